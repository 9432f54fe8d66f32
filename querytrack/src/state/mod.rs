// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Generic atomic state tracking
//!
//! The state machine here is reused for both the query lifecycle state and
//! the append-only final-snapshot latch. Listener dispatch always goes
//! through a caller-supplied [`executor::Executor`], never inline.

pub mod executor;
pub mod machine;

pub use executor::{Executor, TokioExecutor};
pub use machine::StateMachine;
