// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Query lifecycle states
//!
//! States are ordered; transitions only move to a higher ordinal, with
//! FAILED reachable by an explicit jump from any non-terminal state.
//! FINISHED and FAILED are terminal and mutually exclusive.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum QueryState {
    /// Query is waiting on prerequisite work before admission
    WaitingForPrerequisites,
    /// Query has been admitted to a resource group queue
    Queued,
    /// Query is waiting for cluster resources
    WaitingForResources,
    /// Query is being handed to a coordinator for execution
    Dispatching,
    /// Query is being planned
    Planning,
    /// Execution is being scheduled
    Starting,
    /// Query tasks are running
    Running,
    /// Execution finished, commit in flight
    Finishing,
    /// Query completed successfully and its transaction committed
    Finished,
    /// Query failed, was canceled, or its commit failed
    Failed,
}

impl QueryState {
    pub const TERMINAL_STATES: [QueryState; 2] = [QueryState::Finished, QueryState::Failed];

    /// Whether the query has reached a terminal state
    pub fn is_done(&self) -> bool {
        matches!(self, QueryState::Finished | QueryState::Failed)
    }
}

impl std::fmt::Display for QueryState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            QueryState::WaitingForPrerequisites => "WAITING_FOR_PREREQUISITES",
            QueryState::Queued => "QUEUED",
            QueryState::WaitingForResources => "WAITING_FOR_RESOURCES",
            QueryState::Dispatching => "DISPATCHING",
            QueryState::Planning => "PLANNING",
            QueryState::Starting => "STARTING",
            QueryState::Running => "RUNNING",
            QueryState::Finishing => "FINISHING",
            QueryState::Finished => "FINISHED",
            QueryState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}
