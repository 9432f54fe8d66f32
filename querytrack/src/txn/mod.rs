// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Transaction manager boundary
//!
//! The coordinator treats the transaction layer as an opaque contract: it
//! begins an auto-commit transaction at submission when the session has
//! none, drives an asynchronous commit when the query reaches FINISHING,
//! and aborts or fails the transaction on query failure. Commit results
//! arrive as an explicit tagged union, so no runtime type inspection is
//! needed on the provenance-attachment path.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::QueryError;
use crate::types::SchemaTableName;

/// Unique identifier for a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransactionId(u64);

impl TransactionId {
    /// Generate a new unique transaction ID based on system time
    pub fn new() -> Self {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64;
        TransactionId(timestamp)
    }

    pub fn id(&self) -> u64 {
        self.0
    }

    pub fn from_u64(id: u64) -> Self {
        TransactionId(id)
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TransactionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "txn_{}", self.0)
    }
}

/// What the coordinator needs to know about a live transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransactionInfo {
    pub transaction_id: TransactionId,
    /// True for the implicit transaction wrapping a query submitted
    /// without an explicit transaction context
    pub auto_commit_context: bool,
}

/// Opaque per-connector token summarizing read/write provenance
///
/// Supplied by the transaction layer at commit time. Payload accessors
/// return serialized strings ready for downstream consumers; an empty
/// string means no payload for that table.
pub trait CommitHandle: Send + Sync {
    fn has_commit_output(&self, table: &SchemaTableName) -> bool;

    fn serialized_commit_output_for_read(&self, table: &SchemaTableName) -> String;

    fn serialized_commit_output_for_write(&self, table: &SchemaTableName) -> String;
}

/// Outcome of an asynchronous commit
///
/// A write transaction yields a single handle; a read-only transaction
/// spanning multiple connectors yields one handle per connector.
#[derive(Clone)]
pub enum CommitResult {
    None,
    Single(Arc<dyn CommitHandle>),
    Many(Vec<Arc<dyn CommitHandle>>),
}

impl std::fmt::Debug for CommitResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommitResult::None => write!(f, "CommitResult::None"),
            CommitResult::Single(_) => write!(f, "CommitResult::Single"),
            CommitResult::Many(handles) => {
                write!(f, "CommitResult::Many({} handles)", handles.len())
            }
        }
    }
}

/// External transaction manager contract
#[async_trait]
pub trait TransactionManager: Send + Sync {
    /// Open a new transaction; `auto_commit` marks the implicit
    /// transaction wrapping a standalone query
    fn begin_transaction(&self, auto_commit: bool) -> TransactionId;

    /// Look up a live transaction; `None` once the transaction is gone
    fn transaction_info(&self, transaction_id: TransactionId) -> Option<TransactionInfo>;

    /// Commit the transaction, yielding commit provenance on success
    async fn commit(&self, transaction_id: TransactionId) -> Result<CommitResult, QueryError>;

    /// Best-effort asynchronous rollback
    fn abort(&self, transaction_id: TransactionId);

    /// Mark an explicit transaction as failed so it can only roll back
    fn fail(&self, transaction_id: TransactionId);

    /// Mark a finished or failed query's transaction inactive
    fn try_set_inactive(&self, transaction_id: TransactionId);
}
