// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Coordinator error types
//!
//! Guard failures on state transitions are reported as `false` and never
//! surface here; these variants cover the loud failure modes (invariant
//! violations, duplicate adds, missing keys) plus the terminal failure
//! causes recorded against a query.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors surfaced by the query lifecycle coordinator
#[derive(Error, Debug)]
pub enum QueryError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Query was canceled by the user")]
    UserCanceled,

    #[error("Transaction failure: {0}")]
    TransactionFailure(String),

    #[error("Cleanup failed: {0}")]
    CleanupFailed(String),
}

/// Coarse classification of a recorded failure, carried in snapshots
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    UserCanceled,
    TransactionFailure,
    NotFound,
    AlreadyExists,
    InvalidArgument,
    InvariantViolation,
    Internal,
}

/// Immutable record of the first failure reported against a query
///
/// Only the first recorded cause is authoritative; later failure reports
/// against an already-failed query are dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub kind: ErrorKind,
    pub message: String,
}

impl FailureInfo {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&QueryError> for FailureInfo {
    fn from(error: &QueryError) -> Self {
        let kind = match error {
            QueryError::NotFound(_) => ErrorKind::NotFound,
            QueryError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            QueryError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            QueryError::InvariantViolation(_) => ErrorKind::InvariantViolation,
            QueryError::UserCanceled => ErrorKind::UserCanceled,
            QueryError::TransactionFailure(_) => ErrorKind::TransactionFailure,
            QueryError::CleanupFailed(_) => ErrorKind::Internal,
        };
        FailureInfo::new(kind, error.to_string())
    }
}
