// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! QueryTrack - lifecycle coordination for distributed SQL queries
//!
//! QueryTrack tracks a single query from submission to its terminal state
//! on behalf of a coordinator node.
//!
//! # Features
//!
//! - **Ordered lifecycle**: monotonic state transitions with terminal
//!   FINISHED/FAILED states that lock the machine
//! - **Asynchronous notification**: listeners and future-based waits,
//!   always dispatched on a caller-supplied executor, never inline
//! - **Transaction coupling**: implicit auto-commit transactions driven to
//!   commit on FINISHING, aborted or failed on query failure
//! - **Snapshots**: lightweight and full point-in-time views, with an
//!   exactly-once final-snapshot latch and memory-reclaiming pruning
//! - **Concurrent accounting**: lock-free memory and running-task peaks
//!
//! # Usage
//!
//! Embedders construct a [`QueryLifecycle`] per submitted query, report
//! progress through its transition and update methods, and read snapshots
//! through `get_basic_query_info` / `get_query_info`.

pub mod error;
pub mod metadata;
pub mod query;
pub mod session;
pub mod state;
pub mod txn;
pub mod types;

// Re-export the primary entry points
pub use error::{ErrorKind, FailureInfo, QueryError};
pub use metadata::{NoopCleanup, QueryCleanup};
pub use query::{QueryLifecycle, QueryOutputInfo, QueryState};
pub use session::{SelectedRole, Session, SqlFunctionId, SqlInvokedFunction};
pub use state::{Executor, StateMachine, TokioExecutor};
pub use txn::{CommitHandle, CommitResult, TransactionId, TransactionInfo, TransactionManager};
pub use types::{QueryId, ResourceGroupId, SchemaTableName, StageId, TaskId};

/// QueryTrack version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// QueryTrack crate name
pub const CRATE_NAME: &str = env!("CARGO_PKG_NAME");
