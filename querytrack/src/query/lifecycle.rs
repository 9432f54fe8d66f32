// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Query lifecycle coordination
//!
//! `QueryLifecycle` owns one query's state machine, memory/task counters,
//! session-mutation records, transaction association and output/input
//! provenance. Many execution-side callers report progress concurrently;
//! readers pull snapshots at any time. No method blocks the calling
//! thread: mutation happens through atomics and narrow mutexes, and the
//! only asynchronous continuation is the transaction commit driven from
//! `transition_to_finishing`.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{FailureInfo, QueryError};
use crate::metadata::QueryCleanup;
use crate::query::info::{
    prune_expired_query_info, prune_finished_query_info, prune_input_histograms,
    BasicQueryInfo, BasicQueryStats, BasicStageExecutionStats, Input, Output, PeakValues,
    PlanStatsAndCosts, QueryInfo, QueryStats, StageExecutionState, StageInfo, TaskState,
    UpdateInfo,
};
use crate::query::output::{QueryOutputInfo, QueryOutputManager};
use crate::query::state::QueryState;
use crate::query::timer::QueryStateTimer;
use crate::session::{SelectedRole, Session, SqlFunctionId, SqlInvokedFunction};
use crate::state::executor::Executor;
use crate::state::machine::StateMachine;
use crate::txn::{CommitHandle, CommitResult, TransactionId, TransactionManager};
use crate::types::{QueryId, ResourceGroupId, SchemaTableName, TaskId};

/// Thread-safe lifecycle coordinator for a single query
pub struct QueryLifecycle {
    query_id: QueryId,
    query: String,
    prepared_query: Option<String>,
    session: Arc<Session>,
    resource_group: ResourceGroupId,
    transaction_manager: Arc<dyn TransactionManager>,
    cleanup: Arc<dyn QueryCleanup>,
    executor: Arc<dyn Executor>,

    timer: QueryStateTimer,
    query_state: StateMachine<QueryState>,
    final_query_info: StateMachine<Option<QueryInfo>>,
    output_manager: QueryOutputManager,

    current_user_memory: AtomicI64,
    peak_user_memory: AtomicI64,
    current_total_memory: AtomicI64,
    peak_total_memory: AtomicI64,
    peak_task_user_memory: AtomicI64,
    peak_task_total_memory: AtomicI64,
    peak_node_total_memory: AtomicI64,
    current_running_task_count: AtomicI32,
    peak_running_task_count: AtomicI32,

    set_catalog: Mutex<Option<String>>,
    set_schema: Mutex<Option<String>>,
    set_session_properties: Mutex<BTreeMap<String, String>>,
    reset_session_properties: Mutex<BTreeSet<String>>,
    set_roles: Mutex<BTreeMap<String, SelectedRole>>,
    added_prepared_statements: Mutex<BTreeMap<String, String>>,
    deallocated_prepared_statements: Mutex<BTreeSet<String>>,
    added_session_functions: Mutex<HashMap<SqlFunctionId, SqlInvokedFunction>>,
    removed_session_functions: Mutex<HashSet<SqlFunctionId>>,

    started_transaction_id: Mutex<Option<TransactionId>>,
    clear_transaction_id: AtomicBool,

    update_info: Mutex<Option<UpdateInfo>>,
    expanded_query: Mutex<Option<String>>,
    failure_cause: Mutex<Option<FailureInfo>>,

    plan_stats_and_costs: Mutex<Option<PlanStatsAndCosts>>,
    inputs: Mutex<Vec<Input>>,
    output: Mutex<Option<Output>>,
}

impl QueryLifecycle {
    /// Create the coordinator for a newly submitted query
    ///
    /// If the session carries no transaction and the query is not a
    /// transaction-control statement, an implicit auto-commit transaction
    /// is begun and bound to the session. Created coordinators must be
    /// transitioned to a terminal state to release their resources.
    pub fn begin(
        query: impl Into<String>,
        prepared_query: Option<String>,
        session: Session,
        resource_group: ResourceGroupId,
        transaction_control: bool,
        transaction_manager: Arc<dyn TransactionManager>,
        cleanup: Arc<dyn QueryCleanup>,
        executor: Arc<dyn Executor>,
    ) -> Arc<Self> {
        if session.transaction_id().is_none() && !transaction_control {
            let transaction_id = transaction_manager.begin_transaction(true);
            session.bind_transaction(transaction_id);
        }
        let session = Arc::new(session);
        let query_id = session.query_id();

        let lifecycle = Arc::new(Self {
            query_id,
            query: query.into(),
            prepared_query,
            session: Arc::clone(&session),
            resource_group,
            transaction_manager: Arc::clone(&transaction_manager),
            cleanup,
            executor: Arc::clone(&executor),
            timer: QueryStateTimer::new(),
            query_state: StateMachine::with_terminal_states(
                format!("query {query_id}"),
                Arc::clone(&executor),
                QueryState::WaitingForPrerequisites,
                QueryState::TERMINAL_STATES.to_vec(),
            ),
            final_query_info: StateMachine::new(
                format!("finalQueryInfo {query_id}"),
                Arc::clone(&executor),
                None,
            ),
            output_manager: QueryOutputManager::new(executor),
            current_user_memory: AtomicI64::new(0),
            peak_user_memory: AtomicI64::new(0),
            current_total_memory: AtomicI64::new(0),
            peak_total_memory: AtomicI64::new(0),
            peak_task_user_memory: AtomicI64::new(0),
            peak_task_total_memory: AtomicI64::new(0),
            peak_node_total_memory: AtomicI64::new(0),
            current_running_task_count: AtomicI32::new(0),
            peak_running_task_count: AtomicI32::new(0),
            set_catalog: Mutex::new(None),
            set_schema: Mutex::new(None),
            set_session_properties: Mutex::new(BTreeMap::new()),
            reset_session_properties: Mutex::new(BTreeSet::new()),
            set_roles: Mutex::new(BTreeMap::new()),
            added_prepared_statements: Mutex::new(BTreeMap::new()),
            deallocated_prepared_statements: Mutex::new(BTreeSet::new()),
            added_session_functions: Mutex::new(HashMap::new()),
            removed_session_functions: Mutex::new(HashSet::new()),
            started_transaction_id: Mutex::new(None),
            clear_transaction_id: AtomicBool::new(false),
            update_info: Mutex::new(None),
            expanded_query: Mutex::new(None),
            failure_cause: Mutex::new(None),
            plan_stats_and_costs: Mutex::new(None),
            inputs: Mutex::new(Vec::new()),
            output: Mutex::new(None),
        });

        // The listener captures only the session and the transaction
        // manager, never the coordinator itself.
        lifecycle.query_state.add_state_change_listener(move |state: &QueryState| {
            log::debug!("Query {} is {}", session.query_id(), state);
            if state.is_done() {
                if let Some(transaction_id) = session.transaction_id() {
                    transaction_manager.try_set_inactive(transaction_id);
                }
            }
        });
        lifecycle
    }

    pub fn query_id(&self) -> QueryId {
        self.query_id
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn resource_group(&self) -> &ResourceGroupId {
        &self.resource_group
    }

    // ------------------------------------------------------------------
    // State machine
    // ------------------------------------------------------------------

    pub fn get_query_state(&self) -> QueryState {
        self.query_state.get()
    }

    pub fn is_done(&self) -> bool {
        self.query_state.get().is_done()
    }

    /// Listener is always notified asynchronously on the executor, and
    /// notifications may be observed out of order
    pub fn add_state_change_listener<F>(&self, listener: F)
    where
        F: Fn(&QueryState) + Send + Sync + 'static,
    {
        self.query_state.add_state_change_listener(listener);
    }

    /// Resolves as soon as the state differs from `snapshot`
    pub fn get_state_change(&self, snapshot: QueryState) -> oneshot::Receiver<QueryState> {
        self.query_state.get_state_change(snapshot)
    }

    fn transition_up(&self, target: QueryState) -> bool {
        self.query_state.set_if(target, |current| *current < target)
    }

    pub fn transition_to_queued(&self) -> bool {
        self.timer.begin_queued();
        self.transition_up(QueryState::Queued)
    }

    pub fn transition_to_waiting_for_resources(&self) -> bool {
        self.timer.begin_waiting_for_resources();
        self.transition_up(QueryState::WaitingForResources)
    }

    pub fn transition_to_dispatching(&self) -> bool {
        self.timer.begin_dispatching();
        self.transition_up(QueryState::Dispatching)
    }

    pub fn transition_to_planning(&self) -> bool {
        self.timer.begin_planning();
        self.transition_up(QueryState::Planning)
    }

    pub fn transition_to_starting(&self) -> bool {
        self.timer.begin_starting();
        self.transition_up(QueryState::Starting)
    }

    pub fn transition_to_running(&self) -> bool {
        self.timer.begin_running();
        self.transition_up(QueryState::Running)
    }

    /// Enter FINISHING and drive the transaction to completion
    ///
    /// For an implicit auto-commit transaction the commit runs
    /// asynchronously; its completion callback executes on the executor,
    /// never inline, and drives the terminal transition. Queries without
    /// an auto-commit transaction go straight to FINISHED.
    pub fn transition_to_finishing(self: &Arc<Self>) -> bool {
        self.timer.begin_finishing();

        if !self.query_state.set_if(QueryState::Finishing, |current| {
            *current != QueryState::Finishing && !current.is_done()
        }) {
            return false;
        }

        let transaction = self
            .session
            .transaction_id()
            .and_then(|id| self.transaction_manager.transaction_info(id));

        match transaction {
            Some(info) if info.auto_commit_context => {
                let lifecycle = Arc::clone(self);
                let transaction_manager = Arc::clone(&self.transaction_manager);
                self.executor.spawn(Box::pin(async move {
                    match transaction_manager.commit(info.transaction_id).await {
                        Ok(result) => {
                            lifecycle.transition_to_finished();
                            lifecycle.attach_commit_result(result);
                        }
                        Err(error) => {
                            lifecycle.transition_to_failed_where(error, |current| {
                                !current.is_done()
                            });
                        }
                    }
                }));
            }
            _ => self.transition_to_finished(),
        }
        true
    }

    fn transition_to_finished(&self) {
        self.cleanup_query_quietly();
        self.timer.end_query();
        self.query_state
            .set_if(QueryState::Finished, |current| !current.is_done());
    }

    /// Record a failure and move to FAILED
    ///
    /// Fails only queries that have not begun their FINISHING-initiated
    /// commit; once the commit is in flight the only admissible failure is
    /// a commit failure, reported internally.
    pub fn transition_to_failed(&self, cause: QueryError) -> bool {
        self.transition_to_failed_where(cause, |current| {
            *current != QueryState::Finishing && !current.is_done()
        })
    }

    fn transition_to_failed_where<P>(&self, cause: QueryError, predicate: P) -> bool
    where
        P: Fn(&QueryState) -> bool,
    {
        let current = self.query_state.get();
        if !predicate(&current) {
            log::debug!(
                "Failure of query {} ignored in state {}: {}",
                self.query_id,
                current,
                cause
            );
            return false;
        }

        self.cleanup_query_quietly();
        self.timer.end_query();

        // The failure cause must be recorded before the state change so
        // listeners can observe it; it is only readable once the
        // transition to FAILED succeeds, so the first recorded cause wins.
        self.record_failure_cause(&cause);

        let failed = self
            .query_state
            .set_if(QueryState::Failed, |current| predicate(current));
        if failed {
            log::debug!("Query {} failed: {}", self.query_id, cause);
            self.abort_or_fail_transaction();
        } else {
            log::debug!("Failure of query {} reported after completion: {}", self.query_id, cause);
        }
        failed
    }

    /// Cancel the query: an unconditional attempt to move any non-done
    /// query straight to FAILED with a user-cancellation cause
    pub fn transition_to_canceled(&self) -> bool {
        self.cleanup_query_quietly();
        self.timer.end_query();
        self.record_failure_cause(&QueryError::UserCanceled);

        let canceled = self
            .query_state
            .set_if(QueryState::Failed, |current| !current.is_done());
        if canceled {
            self.abort_or_fail_transaction();
        }
        canceled
    }

    fn record_failure_cause(&self, cause: &QueryError) {
        let mut failure = self.failure_cause.lock();
        if failure.is_none() {
            *failure = Some(FailureInfo::from(cause));
        }
    }

    fn abort_or_fail_transaction(&self) {
        // if the transaction is already gone, do nothing
        let Some(info) = self
            .session
            .transaction_id()
            .and_then(|id| self.transaction_manager.transaction_info(id))
        else {
            return;
        };
        if info.auto_commit_context {
            self.transaction_manager.abort(info.transaction_id);
        } else {
            self.transaction_manager.fail(info.transaction_id);
        }
    }

    fn cleanup_query_quietly(&self) {
        if let Err(error) = self.cleanup.cleanup_query(&self.session) {
            log::error!("Error cleaning up query {}: {}", self.query_id, error);
        }
    }

    // ------------------------------------------------------------------
    // Commit provenance
    // ------------------------------------------------------------------

    fn attach_commit_result(&self, result: CommitResult) {
        match result {
            CommitResult::None => {}
            CommitResult::Single(handle) => {
                self.attach_commit_output_to_output(handle.as_ref());
                self.attach_commit_output_to_inputs(std::slice::from_ref(&handle));
            }
            CommitResult::Many(handles) => self.attach_commit_output_to_inputs(&handles),
        }
    }

    fn attach_commit_output_to_output(&self, handle: &dyn CommitHandle) {
        let mut output = self.output.lock();
        let Some(current) = output.as_ref() else {
            return;
        };
        let table = SchemaTableName::new(current.schema.clone(), current.table.clone());
        *output = Some(Output {
            serialized_commit_output: handle.serialized_commit_output_for_write(&table),
            ..current.clone()
        });
    }

    fn attach_commit_output_to_inputs(&self, handles: &[Arc<dyn CommitHandle>]) {
        let mut inputs = self.inputs.lock();
        let updated = inputs
            .iter()
            .map(|input| {
                let table = SchemaTableName::new(input.schema.clone(), input.table.clone());
                match handles.iter().find(|handle| handle.has_commit_output(&table)) {
                    Some(handle) => Input {
                        serialized_commit_output: handle.serialized_commit_output_for_read(&table),
                        ..input.clone()
                    },
                    None => input.clone(),
                }
            })
            .collect();
        *inputs = updated;
    }

    // ------------------------------------------------------------------
    // Memory and task counters
    // ------------------------------------------------------------------

    /// Apply memory deltas and max-accumulate the corresponding peaks
    ///
    /// Safe under arbitrary interleaving: peak updates are independent
    /// max-accumulations, never read-modify-write under a lock.
    pub fn update_memory_usage(
        &self,
        delta_user_memory_bytes: i64,
        delta_total_memory_bytes: i64,
        task_user_memory_bytes: i64,
        task_total_memory_bytes: i64,
        peak_node_total_memory_bytes: i64,
    ) {
        // The peak must accumulate the total this add produced, not a
        // later re-read: a concurrent decrement landing in between would
        // hide the prefix sum this call reached.
        let user_memory = self
            .current_user_memory
            .fetch_add(delta_user_memory_bytes, Ordering::SeqCst)
            + delta_user_memory_bytes;
        let total_memory = self
            .current_total_memory
            .fetch_add(delta_total_memory_bytes, Ordering::SeqCst)
            + delta_total_memory_bytes;
        self.peak_user_memory.fetch_max(user_memory, Ordering::SeqCst);
        self.peak_total_memory.fetch_max(total_memory, Ordering::SeqCst);
        self.peak_task_user_memory
            .fetch_max(task_user_memory_bytes, Ordering::SeqCst);
        self.peak_task_total_memory
            .fetch_max(task_total_memory_bytes, Ordering::SeqCst);
        self.peak_node_total_memory
            .fetch_max(peak_node_total_memory_bytes, Ordering::SeqCst);
    }

    pub fn increment_current_running_task_count(&self) -> i32 {
        let running = self.current_running_task_count.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_running_task_count.fetch_max(running, Ordering::SeqCst);
        running
    }

    pub fn decrement_current_running_task_count(&self) -> i32 {
        self.current_running_task_count.fetch_sub(1, Ordering::SeqCst) - 1
    }

    pub fn current_running_task_count(&self) -> i32 {
        self.current_running_task_count.load(Ordering::SeqCst)
    }

    pub fn peak_running_task_count(&self) -> i32 {
        self.peak_running_task_count.load(Ordering::SeqCst)
    }

    pub fn peak_user_memory_bytes(&self) -> u64 {
        self.peak_user_memory.load(Ordering::SeqCst).max(0) as u64
    }

    pub fn peak_total_memory_bytes(&self) -> u64 {
        self.peak_total_memory.load(Ordering::SeqCst).max(0) as u64
    }

    pub fn peak_task_user_memory_bytes(&self) -> u64 {
        self.peak_task_user_memory.load(Ordering::SeqCst).max(0) as u64
    }

    pub fn peak_task_total_memory_bytes(&self) -> u64 {
        self.peak_task_total_memory.load(Ordering::SeqCst).max(0) as u64
    }

    pub fn peak_node_total_memory_bytes(&self) -> u64 {
        self.peak_node_total_memory.load(Ordering::SeqCst).max(0) as u64
    }

    fn peak_values(&self) -> PeakValues {
        PeakValues {
            peak_running_tasks: self.peak_running_task_count(),
            peak_user_memory_bytes: self.peak_user_memory_bytes(),
            peak_total_memory_bytes: self.peak_total_memory_bytes(),
            peak_task_user_memory_bytes: self.peak_task_user_memory_bytes(),
            peak_task_total_memory_bytes: self.peak_task_total_memory_bytes(),
            peak_node_total_memory_bytes: self.peak_node_total_memory_bytes(),
        }
    }

    // ------------------------------------------------------------------
    // Session mutations
    // ------------------------------------------------------------------

    pub fn set_catalog(&self, catalog: impl Into<String>) -> Result<(), QueryError> {
        let mut slot = self.set_catalog.lock();
        if slot.is_some() {
            return Err(QueryError::AlreadyExists("catalog already selected".to_string()));
        }
        *slot = Some(catalog.into());
        Ok(())
    }

    pub fn set_schema(&self, schema: impl Into<String>) -> Result<(), QueryError> {
        let mut slot = self.set_schema.lock();
        if slot.is_some() {
            return Err(QueryError::AlreadyExists("schema already selected".to_string()));
        }
        *slot = Some(schema.into());
        Ok(())
    }

    pub fn add_set_session_property(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<(), QueryError> {
        let key = key.into();
        let mut properties = self.set_session_properties.lock();
        if properties.contains_key(&key) {
            return Err(QueryError::AlreadyExists(format!(
                "session property {key} already set"
            )));
        }
        properties.insert(key, value.into());
        Ok(())
    }

    pub fn add_reset_session_property(&self, name: impl Into<String>) -> Result<(), QueryError> {
        let name = name.into();
        let mut properties = self.reset_session_properties.lock();
        if !properties.insert(name.clone()) {
            return Err(QueryError::AlreadyExists(format!(
                "session property {name} already reset"
            )));
        }
        Ok(())
    }

    pub fn add_set_role(
        &self,
        catalog: impl Into<String>,
        role: SelectedRole,
    ) -> Result<(), QueryError> {
        let catalog = catalog.into();
        let mut roles = self.set_roles.lock();
        if roles.contains_key(&catalog) {
            return Err(QueryError::AlreadyExists(format!(
                "role for catalog {catalog} already set"
            )));
        }
        roles.insert(catalog, role);
        Ok(())
    }

    pub fn add_prepared_statement(
        &self,
        key: impl Into<String>,
        statement: impl Into<String>,
    ) -> Result<(), QueryError> {
        let key = key.into();
        let mut added = self.added_prepared_statements.lock();
        if self.session.prepared_statements().contains_key(&key) || added.contains_key(&key) {
            return Err(QueryError::AlreadyExists(format!(
                "prepared statement {key} already exists"
            )));
        }
        added.insert(key, statement.into());
        Ok(())
    }

    /// Deallocate a prepared statement registered in the session
    ///
    /// With `tolerant` set, removal of an unknown key is a silent no-op.
    pub fn remove_prepared_statement(
        &self,
        key: &str,
        tolerant: bool,
    ) -> Result<(), QueryError> {
        if !self.session.prepared_statements().contains_key(key) {
            if tolerant {
                return Ok(());
            }
            return Err(QueryError::NotFound(format!(
                "prepared statement not found: {key}"
            )));
        }
        self.deallocated_prepared_statements.lock().insert(key.to_string());
        Ok(())
    }

    pub fn add_session_function(
        &self,
        signature: SqlFunctionId,
        function: SqlInvokedFunction,
    ) -> Result<(), QueryError> {
        let mut added = self.added_session_functions.lock();
        if self.session.session_functions().contains_key(&signature)
            || added.contains_key(&signature)
        {
            return Err(QueryError::AlreadyExists(format!(
                "session function {signature} has already been defined"
            )));
        }
        added.insert(signature, function);
        Ok(())
    }

    /// Drop a session function registered in the session
    ///
    /// With `tolerant` set, removal of an unknown signature is a silent
    /// no-op.
    pub fn remove_session_function(
        &self,
        signature: &SqlFunctionId,
        tolerant: bool,
    ) -> Result<(), QueryError> {
        if !self.session.session_functions().contains_key(signature) {
            if tolerant {
                return Ok(());
            }
            return Err(QueryError::NotFound(format!(
                "session function {signature} not found"
            )));
        }
        self.removed_session_functions.lock().insert(signature.clone());
        Ok(())
    }

    pub fn set_started_transaction_id(
        &self,
        transaction_id: TransactionId,
    ) -> Result<(), QueryError> {
        if self.clear_transaction_id.load(Ordering::SeqCst) {
            return Err(QueryError::InvariantViolation(
                "cannot start and clear transaction in the same request".to_string(),
            ));
        }
        *self.started_transaction_id.lock() = Some(transaction_id);
        Ok(())
    }

    pub fn clear_transaction_id(&self) -> Result<(), QueryError> {
        if self.started_transaction_id.lock().is_some() {
            return Err(QueryError::InvariantViolation(
                "cannot start and clear transaction in the same request".to_string(),
            ));
        }
        self.clear_transaction_id.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn set_update_info(&self, update_info: UpdateInfo) {
        *self.update_info.lock() = Some(update_info);
    }

    pub fn set_expanded_query(&self, expanded_query: Option<String>) {
        *self.expanded_query.lock() = expanded_query;
    }

    // ------------------------------------------------------------------
    // Plan and provenance
    // ------------------------------------------------------------------

    /// Replace the input set wholesale (copy-on-write)
    pub fn set_inputs(&self, inputs: Vec<Input>) {
        *self.inputs.lock() = inputs;
    }

    pub fn inputs(&self) -> Vec<Input> {
        self.inputs.lock().clone()
    }

    pub fn set_output(&self, output: Option<Output>) {
        *self.output.lock() = output;
    }

    pub fn output(&self) -> Option<Output> {
        self.output.lock().clone()
    }

    pub fn set_plan_stats_and_costs(&self, stats_and_costs: PlanStatsAndCosts) {
        *self.plan_stats_and_costs.lock() = Some(stats_and_costs);
    }

    // ------------------------------------------------------------------
    // Output coordination
    // ------------------------------------------------------------------

    pub fn set_columns(
        &self,
        column_names: Vec<String>,
        column_types: Vec<String>,
    ) -> Result<(), QueryError> {
        self.output_manager.set_columns(column_names, column_types)
    }

    pub fn update_output_locations(
        &self,
        new_locations: BTreeMap<String, TaskId>,
        no_more_output_locations: bool,
    ) -> Result<(), QueryError> {
        self.output_manager
            .update_output_locations(new_locations, no_more_output_locations)
    }

    pub fn add_output_info_listener<F>(&self, listener: F)
    where
        F: Fn(&QueryOutputInfo) + Send + Sync + 'static,
    {
        self.output_manager.add_output_info_listener(listener);
    }

    pub fn query_output_info(&self) -> Option<QueryOutputInfo> {
        self.output_manager.query_output_info()
    }

    // ------------------------------------------------------------------
    // Timer passthrough
    // ------------------------------------------------------------------

    pub fn begin_analysis(&self) {
        self.timer.begin_analysis();
    }

    pub fn end_analysis(&self) {
        self.timer.end_analysis();
    }

    pub fn record_heartbeat(&self) {
        self.timer.record_heartbeat();
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    /// Failure record, readable only once the query is FAILED
    pub fn get_failure_info(&self) -> Option<FailureInfo> {
        if self.query_state.get() != QueryState::Failed {
            return None;
        }
        self.failure_cause.lock().clone()
    }

    /// Lightweight snapshot for monitoring lists
    pub fn get_basic_query_info(
        &self,
        root_stage_stats: Option<BasicStageExecutionStats>,
    ) -> BasicQueryInfo {
        // Query state must be captured first to provide a consistent
        // view: assembled after the other fields, a query completing
        // mid-assembly could present task state that was never visible.
        let state = self.query_state.get();

        let stage_stats = root_stage_stats.unwrap_or_default();
        let stats = BasicQueryStats {
            create_time_ms: self.timer.create_time_millis(),
            end_time_ms: self.timer.end_time_millis(),
            waiting_for_prerequisites_time_ms: self
                .timer
                .waiting_for_prerequisites_time()
                .as_millis() as u64,
            queued_time_ms: self.timer.queued_time().as_millis() as u64,
            elapsed_time_ms: self.timer.elapsed_time().as_millis() as u64,
            execution_time_ms: self.timer.execution_time().as_millis() as u64,
            analysis_time_ms: self.timer.analysis_time().as_millis() as u64,
            running_tasks: self.current_running_task_count(),
            peak_running_tasks: self.peak_running_task_count(),
            total_drivers: stage_stats.total_drivers,
            queued_drivers: stage_stats.queued_drivers,
            running_drivers: stage_stats.running_drivers,
            completed_drivers: stage_stats.completed_drivers,
            raw_input_rows: stage_stats.raw_input_rows,
            raw_input_bytes: stage_stats.raw_input_bytes,
            cumulative_user_memory: stage_stats.cumulative_user_memory,
            user_memory_reservation_bytes: stage_stats.user_memory_reservation_bytes,
            total_memory_reservation_bytes: stage_stats.total_memory_reservation_bytes,
            peak_user_memory_bytes: self.peak_user_memory_bytes(),
            peak_total_memory_bytes: self.peak_total_memory_bytes(),
            peak_task_total_memory_bytes: self.peak_task_total_memory_bytes(),
            peak_node_total_memory_bytes: self.peak_node_total_memory_bytes(),
            total_cpu_time_ms: stage_stats.total_cpu_time_ms,
            total_scheduled_time_ms: stage_stats.total_scheduled_time_ms,
            fully_blocked: stage_stats.fully_blocked,
            progress_percentage: stage_stats.progress_percentage,
        };

        BasicQueryInfo {
            query_id: self.query_id,
            session: self.session.to_snapshot(),
            resource_group: self.resource_group.clone(),
            state,
            scheduled: stage_stats.scheduled,
            query: self.query.clone(),
            prepared_query: self.prepared_query.clone(),
            stats,
            failure_info: self.failure_cause.lock().clone(),
        }
    }

    /// Full snapshot assembled from the current atomics and the supplied
    /// stage tree
    pub fn get_query_info(&self, root_stage: Option<StageInfo>) -> QueryInfo {
        // Query state must be captured first; see get_basic_query_info.
        let state = self.query_state.get();

        let failure_info = if state == QueryState::Failed {
            self.failure_cause.lock().clone()
        } else {
            None
        };

        let all_stages = StageInfo::all_stages(root_stage.as_ref());
        let final_query_info =
            state.is_done() && all_stages.iter().all(|stage| stage.is_final_stage_info());
        let scheduled = !all_stages.is_empty()
            && all_stages.iter().all(|stage| {
                stage.latest_attempt_execution_info.state != StageExecutionState::Scheduling
            });

        // Traversing all tasks is expensive; collect failed tasks only
        // once the query is done.
        let failed_tasks = if state.is_done() {
            Some(
                all_stages
                    .iter()
                    .flat_map(|stage| {
                        std::iter::once(&stage.latest_attempt_execution_info)
                            .chain(stage.previous_attempts_execution_infos.iter())
                    })
                    .flat_map(|attempt| attempt.tasks.iter())
                    .filter(|task| task.state == TaskState::Failed)
                    .map(|task| task.task_id)
                    .collect::<Vec<_>>(),
            )
        } else {
            None
        };

        let runtime_optimized_stages: Vec<_> = all_stages
            .iter()
            .filter(|stage| stage.runtime_optimized)
            .map(|stage| stage.stage_id)
            .collect();

        let stats = QueryStats::create(&self.timer, self.peak_values(), &all_stages);
        drop(all_stages);

        QueryInfo {
            query_id: self.query_id,
            session: self.session.to_snapshot(),
            state,
            scheduled,
            field_names: self
                .output_manager
                .query_output_info()
                .map(|info| info.column_names)
                .unwrap_or_default(),
            query: self.query.clone(),
            expanded_query: self.expanded_query.lock().clone(),
            prepared_query: self.prepared_query.clone(),
            stats,
            set_catalog: self.set_catalog.lock().clone(),
            set_schema: self.set_schema.lock().clone(),
            set_session_properties: self.set_session_properties.lock().clone(),
            reset_session_properties: self.reset_session_properties.lock().clone(),
            set_roles: self.set_roles.lock().clone(),
            added_prepared_statements: self.added_prepared_statements.lock().clone(),
            deallocated_prepared_statements: self.deallocated_prepared_statements.lock().clone(),
            added_session_functions: self.added_session_functions.lock().clone(),
            removed_session_functions: self.removed_session_functions.lock().clone(),
            started_transaction_id: *self.started_transaction_id.lock(),
            clear_transaction_id: self.clear_transaction_id.load(Ordering::SeqCst),
            update_info: self.update_info.lock().clone(),
            output_stage: root_stage,
            failure_info,
            inputs: self.inputs.lock().clone(),
            output: self.output.lock().clone(),
            final_query_info,
            resource_group: self.resource_group.clone(),
            failed_tasks,
            runtime_optimized_stages: if runtime_optimized_stages.is_empty() {
                None
            } else {
                Some(runtime_optimized_stages)
            },
            plan_stats_and_costs: self
                .plan_stats_and_costs
                .lock()
                .clone()
                .unwrap_or_default(),
        }
    }

    /// Assemble a full snapshot and, if it is final, latch it
    ///
    /// The latch is populated at most once via compare-and-set against
    /// empty, regardless of how many times assembly is invoked.
    pub fn update_query_info(&self, root_stage: Option<StageInfo>) -> QueryInfo {
        let info = self.get_query_info(root_stage);
        if info.final_query_info {
            self.final_query_info.compare_and_set(None, Some(info.clone()));
        }
        info
    }

    pub fn get_final_query_info(&self) -> Option<QueryInfo> {
        self.final_query_info.get()
    }

    /// Register a listener for the final snapshot, guaranteed to fire at
    /// most once
    ///
    /// Registration after the latch is already populated delivers the
    /// cached value on the executor, never inline.
    pub fn add_final_query_info_listener<F>(&self, listener: F)
    where
        F: Fn(&QueryInfo) + Send + Sync + 'static,
    {
        let fired = Arc::new(AtomicBool::new(false));
        let listener = Arc::new(listener);

        let fire_once = {
            let fired = Arc::clone(&fired);
            let listener = Arc::clone(&listener);
            move |value: &Option<QueryInfo>| {
                if let Some(info) = value {
                    if !fired.swap(true, Ordering::SeqCst) {
                        listener(info);
                    }
                }
            }
        };
        self.final_query_info.add_state_change_listener(fire_once);

        let current = self.final_query_info.get();
        if current.is_some() {
            self.executor.execute(Box::new(move || {
                if let Some(info) = current.as_ref() {
                    if !fired.swap(true, Ordering::SeqCst) {
                        listener(info);
                    }
                }
            }));
        }
    }

    // ------------------------------------------------------------------
    // Pruning
    // ------------------------------------------------------------------

    /// Aggressive pruning for expired queries: collapse the stage tree to
    /// a minimal shape while retaining aggregate statistics
    ///
    /// Idempotent; a no-op if the final snapshot changed concurrently.
    pub fn prune_query_info_expired(&self) {
        let observed = self.final_query_info.get();
        let Some(info) = observed.as_ref() else {
            return;
        };
        if info.output_stage.is_none() {
            return;
        }
        let pruned = prune_expired_query_info(info);
        self.final_query_info
            .compare_and_set(observed.clone(), Some(pruned));
    }

    /// Light pruning immediately after completion: strip histograms,
    /// operator summaries and planner maps, keep all scalar counters
    ///
    /// Also detaches the final-info listeners, since the latch can never
    /// transition again.
    pub fn prune_query_info_finished(&self) {
        let observed = self.final_query_info.get();
        let Some(info) = observed.as_ref() else {
            return;
        };
        if info.output_stage.is_none() {
            return;
        }

        // planner scratch state is no longer needed after completion
        self.session.clear_planner_state();

        let pruned_inputs = {
            let mut inputs = self.inputs.lock();
            let pruned = prune_input_histograms(&inputs);
            *inputs = pruned.clone();
            pruned
        };

        // The final snapshot is already latched and terminal, so the
        // listeners can never fire again; drop them and the state they
        // hold onto.
        self.final_query_info.clear_event_listeners();

        {
            let mut stats_and_costs = self.plan_stats_and_costs.lock();
            if let Some(current) = stats_and_costs.as_ref() {
                *stats_and_costs =
                    Some(crate::query::info::prune_histograms_from_stats_and_costs(current));
            }
        }

        let pruned = prune_finished_query_info(info, pruned_inputs);
        self.final_query_info
            .compare_and_set(observed.clone(), Some(pruned));
    }
}

impl std::fmt::Debug for QueryLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryLifecycle")
            .field("query_id", &self.query_id)
            .field("state", &self.query_state.get())
            .finish()
    }
}
