// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Query lifecycle: states, timing, snapshots and the coordinator

pub mod info;
pub mod lifecycle;
pub mod output;
pub mod state;
pub mod timer;

pub use lifecycle::QueryLifecycle;
pub use output::{QueryOutputInfo, QueryOutputManager};
pub use state::QueryState;
pub use timer::QueryStateTimer;
