// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Output schema and result-location tracking
//!
//! Tracks the query's output column schema (set exactly once) and the
//! append-only map of downstream result-retrieval locations, fanning out
//! change notifications. All state sits behind one narrow mutex; listener
//! invocation always happens outside the critical section, using a
//! snapshot captured while holding it.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::QueryError;
use crate::state::executor::Executor;
use crate::types::TaskId;

/// Snapshot of the query's output: columns plus the known result
/// locations; only available once the columns have been set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryOutputInfo {
    pub column_names: Vec<String>,
    pub column_types: Vec<String>,
    /// Result-retrieval location URI -> producing task
    pub output_locations: BTreeMap<String, TaskId>,
    pub no_more_output_locations: bool,
}

type OutputInfoListener = Arc<dyn Fn(&QueryOutputInfo) + Send + Sync + 'static>;

/// Coordinator for the query's output schema and result locations
pub struct QueryOutputManager {
    executor: Arc<dyn Executor>,
    inner: Mutex<OutputInner>,
}

#[derive(Default)]
struct OutputInner {
    listeners: Vec<OutputInfoListener>,
    column_names: Option<Vec<String>>,
    column_types: Option<Vec<String>>,
    output_locations: BTreeMap<String, TaskId>,
    no_more_output_locations: bool,
}

impl OutputInner {
    fn snapshot(&self) -> Option<QueryOutputInfo> {
        match (&self.column_names, &self.column_types) {
            (Some(names), Some(types)) => Some(QueryOutputInfo {
                column_names: names.clone(),
                column_types: types.clone(),
                output_locations: self.output_locations.clone(),
                no_more_output_locations: self.no_more_output_locations,
            }),
            _ => None,
        }
    }
}

impl QueryOutputManager {
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            executor,
            inner: Mutex::new(OutputInner::default()),
        }
    }

    /// Register a listener for output changes
    ///
    /// If a snapshot is already available (columns set), delivery of the
    /// current snapshot is immediately scheduled on the executor.
    pub fn add_output_info_listener<F>(&self, listener: F)
    where
        F: Fn(&QueryOutputInfo) + Send + Sync + 'static,
    {
        let listener: OutputInfoListener = Arc::new(listener);
        let snapshot = {
            let mut inner = self.inner.lock();
            inner.listeners.push(Arc::clone(&listener));
            inner.snapshot()
        };
        if let Some(info) = snapshot {
            self.executor.execute(Box::new(move || listener(&info)));
        }
    }

    /// Set the output column schema; may be called exactly once
    pub fn set_columns(
        &self,
        column_names: Vec<String>,
        column_types: Vec<String>,
    ) -> Result<(), QueryError> {
        if column_names.len() != column_types.len() {
            return Err(QueryError::InvalidArgument(format!(
                "column names and types must be the same size: {} vs {}",
                column_names.len(),
                column_types.len()
            )));
        }

        let (snapshot, listeners) = {
            let mut inner = self.inner.lock();
            if inner.column_names.is_some() || inner.column_types.is_some() {
                return Err(QueryError::InvariantViolation(
                    "output columns already set".to_string(),
                ));
            }
            inner.column_names = Some(column_names);
            inner.column_types = Some(column_types);
            (inner.snapshot(), inner.listeners.clone())
        };
        if let Some(info) = snapshot {
            self.fire_output_changed(info, listeners);
        }
        Ok(())
    }

    /// Merge new result locations into the append-only location map
    ///
    /// Once sealed with `no_more_output_locations`, later calls must carry
    /// a subset of already-known keys (a silent no-op) or are rejected.
    pub fn update_output_locations(
        &self,
        new_locations: BTreeMap<String, TaskId>,
        no_more_output_locations: bool,
    ) -> Result<(), QueryError> {
        let (snapshot, listeners) = {
            let mut inner = self.inner.lock();
            if inner.no_more_output_locations {
                if !new_locations
                    .keys()
                    .all(|uri| inner.output_locations.contains_key(uri))
                {
                    return Err(QueryError::InvariantViolation(
                        "new output locations added after no more locations set".to_string(),
                    ));
                }
                return Ok(());
            }
            inner.output_locations.extend(new_locations);
            inner.no_more_output_locations = no_more_output_locations;
            (inner.snapshot(), inner.listeners.clone())
        };
        if let Some(info) = snapshot {
            self.fire_output_changed(info, listeners);
        }
        Ok(())
    }

    /// Current snapshot, if the columns have been set
    pub fn query_output_info(&self) -> Option<QueryOutputInfo> {
        self.inner.lock().snapshot()
    }

    fn fire_output_changed(&self, info: QueryOutputInfo, listeners: Vec<OutputInfoListener>) {
        for listener in listeners {
            let info = info.clone();
            self.executor.execute(Box::new(move || listener(&info)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{QueryId, StageId};
    use std::sync::mpsc;

    struct ImmediateExecutor;

    impl Executor for ImmediateExecutor {
        fn execute(&self, task: crate::state::executor::BoxedTask) {
            task();
        }

        fn spawn(&self, _future: crate::state::executor::BoxedFuture) {
            panic!("ImmediateExecutor does not support futures");
        }
    }

    fn manager() -> QueryOutputManager {
        QueryOutputManager::new(Arc::new(ImmediateExecutor))
    }

    fn task_id(id: u32) -> TaskId {
        TaskId::new(StageId::new(QueryId::new(), 0), id)
    }

    #[test]
    fn set_columns_twice_is_rejected() {
        let manager = manager();
        manager
            .set_columns(vec!["a".into()], vec!["bigint".into()])
            .unwrap();
        let err = manager
            .set_columns(vec!["b".into()], vec!["varchar".into()])
            .unwrap_err();
        assert!(matches!(err, QueryError::InvariantViolation(_)));
    }

    #[test]
    fn mismatched_column_arity_is_rejected() {
        let manager = manager();
        let err = manager.set_columns(vec!["a".into()], vec![]).unwrap_err();
        assert!(matches!(err, QueryError::InvalidArgument(_)));
    }

    #[test]
    fn late_listener_receives_current_snapshot() {
        let manager = manager();
        manager
            .set_columns(vec!["a".into()], vec!["bigint".into()])
            .unwrap();
        let (tx, rx) = mpsc::channel();
        manager.add_output_info_listener(move |info: &QueryOutputInfo| {
            tx.send(info.clone()).unwrap();
        });
        let info = rx.try_recv().unwrap();
        assert_eq!(info.column_names, vec!["a".to_string()]);
    }

    #[test]
    fn no_snapshot_before_columns_set() {
        let manager = manager();
        manager
            .update_output_locations(BTreeMap::from([("uri-1".to_string(), task_id(1))]), false)
            .unwrap();
        assert!(manager.query_output_info().is_none());

        let (tx, rx) = mpsc::channel();
        manager.add_output_info_listener(move |info: &QueryOutputInfo| {
            tx.send(info.clone()).unwrap();
        });
        // nothing delivered yet
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn sealed_locations_reject_unknown_keys() {
        let manager = manager();
        manager
            .set_columns(vec!["a".into()], vec!["bigint".into()])
            .unwrap();
        manager
            .update_output_locations(BTreeMap::from([("uri-1".to_string(), task_id(1))]), true)
            .unwrap();
        // subset of known keys is a silent no-op
        manager
            .update_output_locations(BTreeMap::from([("uri-1".to_string(), task_id(1))]), true)
            .unwrap();
        let err = manager
            .update_output_locations(BTreeMap::from([("uri-2".to_string(), task_id(2))]), true)
            .unwrap_err();
        assert!(matches!(err, QueryError::InvariantViolation(_)));
    }

    #[test]
    fn listeners_observe_location_growth() {
        let manager = manager();
        let (tx, rx) = mpsc::channel();
        manager.add_output_info_listener(move |info: &QueryOutputInfo| {
            tx.send(info.output_locations.len()).unwrap();
        });
        manager
            .set_columns(vec!["a".into()], vec!["bigint".into()])
            .unwrap();
        manager
            .update_output_locations(BTreeMap::from([("uri-1".to_string(), task_id(1))]), false)
            .unwrap();
        assert_eq!(rx.try_recv().unwrap(), 0);
        assert_eq!(rx.try_recv().unwrap(), 1);
    }
}
