// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Query session context
//!
//! A `Session` carries the context a query was submitted under: user,
//! default catalog/schema, the prepared statements and session functions
//! visible at submission, and the transaction the query runs in. The
//! lifecycle coordinator records session *mutations* (adds/removes)
//! separately; the session itself stays immutable apart from the one-shot
//! transaction binding and the planner scratch maps.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::txn::TransactionId;
use crate::types::QueryId;

/// Signature of a session-scoped SQL function
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SqlFunctionId {
    pub function_name: String,
    pub argument_types: Vec<String>,
}

impl SqlFunctionId {
    pub fn new(function_name: impl Into<String>, argument_types: Vec<String>) -> Self {
        Self {
            function_name: function_name.into(),
            argument_types,
        }
    }
}

impl std::fmt::Display for SqlFunctionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.function_name, self.argument_types.join(", "))
    }
}

/// Definition of a session-scoped SQL function
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SqlInvokedFunction {
    pub signature: SqlFunctionId,
    pub return_type: String,
    pub body: String,
}

/// Role selection recorded per catalog
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectedRole {
    Role(String),
    All,
    None,
}

/// Per-node planner estimates retained on the session while the query
/// runs; dropped by finished-pruning once the query completes
#[derive(Debug, Default)]
pub struct PlannerState {
    pub plan_node_stats: HashMap<String, f64>,
    pub plan_node_costs: HashMap<String, f64>,
}

/// Immutable session context for one query
pub struct Session {
    query_id: QueryId,
    user: String,
    catalog: Option<String>,
    schema: Option<String>,
    prepared_statements: HashMap<String, String>,
    session_functions: HashMap<SqlFunctionId, SqlInvokedFunction>,
    transaction_id: Mutex<Option<TransactionId>>,
    planner_state: Mutex<PlannerState>,
}

impl Session {
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            query_id: QueryId::new(),
            user: user.into(),
            catalog: None,
            schema: None,
            prepared_statements: HashMap::new(),
            session_functions: HashMap::new(),
            transaction_id: Mutex::new(None),
            planner_state: Mutex::new(PlannerState::default()),
        }
    }

    pub fn with_catalog(mut self, catalog: impl Into<String>) -> Self {
        self.catalog = Some(catalog.into());
        self
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn with_prepared_statement(
        mut self,
        name: impl Into<String>,
        statement: impl Into<String>,
    ) -> Self {
        self.prepared_statements.insert(name.into(), statement.into());
        self
    }

    pub fn with_session_function(mut self, function: SqlInvokedFunction) -> Self {
        self.session_functions
            .insert(function.signature.clone(), function);
        self
    }

    pub fn with_transaction_id(self, transaction_id: TransactionId) -> Self {
        *self.transaction_id.lock() = Some(transaction_id);
        self
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn catalog(&self) -> Option<&str> {
        self.catalog.as_deref()
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    pub fn prepared_statements(&self) -> &HashMap<String, String> {
        &self.prepared_statements
    }

    pub fn session_functions(&self) -> &HashMap<SqlFunctionId, SqlInvokedFunction> {
        &self.session_functions
    }

    pub fn transaction_id(&self) -> Option<TransactionId> {
        *self.transaction_id.lock()
    }

    /// Bind the query's transaction; used by the coordinator when it opens
    /// an auto-commit transaction at submission
    pub(crate) fn bind_transaction(&self, transaction_id: TransactionId) {
        let mut slot = self.transaction_id.lock();
        if slot.is_none() {
            *slot = Some(transaction_id);
        }
    }

    /// Record a planner estimate against a plan node
    pub fn record_plan_node_estimate(&self, node_id: impl Into<String>, stats: f64, cost: f64) {
        let mut state = self.planner_state.lock();
        let node_id = node_id.into();
        state.plan_node_stats.insert(node_id.clone(), stats);
        state.plan_node_costs.insert(node_id, cost);
    }

    pub fn plan_node_estimate_count(&self) -> usize {
        self.planner_state.lock().plan_node_stats.len()
    }

    /// Drop the planner scratch maps; no longer needed once the query has
    /// completed
    pub(crate) fn clear_planner_state(&self) {
        let mut state = self.planner_state.lock();
        state.plan_node_stats.clear();
        state.plan_node_costs.clear();
    }

    /// Point-in-time serializable view of this session
    pub fn to_snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            query_id: self.query_id,
            user: self.user.clone(),
            catalog: self.catalog.clone(),
            schema: self.schema.clone(),
            transaction_id: self.transaction_id(),
        }
    }
}

/// Serializable session view embedded in query snapshots
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub query_id: QueryId,
    pub user: String,
    pub catalog: Option<String>,
    pub schema: Option<String>,
    pub transaction_id: Option<TransactionId>,
}
