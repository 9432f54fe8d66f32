// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Metadata cleanup boundary
//!
//! Connector-side per-query resources are released through this trait when
//! a query reaches a terminal state. Cleanup is strictly best-effort: any
//! failure is logged and suppressed and never affects the query's recorded
//! outcome.

use crate::error::QueryError;
use crate::session::Session;

/// Best-effort release of per-query connector resources
pub trait QueryCleanup: Send + Sync {
    fn cleanup_query(&self, session: &Session) -> Result<(), QueryError>;
}

/// Cleanup collaborator that does nothing; useful for embedders without
/// connector-side state and for tests
pub struct NoopCleanup;

impl QueryCleanup for NoopCleanup {
    fn cleanup_query(&self, _session: &Session) -> Result<(), QueryError> {
        Ok(())
    }
}
