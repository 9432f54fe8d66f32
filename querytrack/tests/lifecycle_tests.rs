// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! End-to-end lifecycle coordination tests
//!
//! Exercises the full coordinator against a mock transaction manager:
//! transition ordering, the asynchronous auto-commit path, commit
//! provenance attachment, failure and cancellation semantics, concurrent
//! accounting and the final-snapshot latch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use querytrack::query::info::{
    Column, Input, OperatorSummary, Output, StageExecutionInfo, StageExecutionState,
    StageExecutionStats, StageInfo, TaskInfo, TaskState,
};
use querytrack::{
    CommitHandle, CommitResult, ErrorKind, NoopCleanup, QueryError, QueryId, QueryLifecycle,
    QueryState, ResourceGroupId, SchemaTableName, Session, SqlFunctionId, SqlInvokedFunction,
    StageId, TaskId, TokioExecutor, TransactionId, TransactionInfo, TransactionManager,
};

enum CommitBehavior {
    Succeed(CommitResult),
    Fail(String),
}

struct MockTransactionManager {
    transactions: Mutex<HashMap<TransactionId, TransactionInfo>>,
    commit_behavior: Mutex<CommitBehavior>,
    committed: Mutex<Vec<TransactionId>>,
    aborted: Mutex<Vec<TransactionId>>,
    failed: Mutex<Vec<TransactionId>>,
    inactive: Mutex<Vec<TransactionId>>,
}

impl MockTransactionManager {
    fn new(commit_behavior: CommitBehavior) -> Arc<Self> {
        Arc::new(Self {
            transactions: Mutex::new(HashMap::new()),
            commit_behavior: Mutex::new(commit_behavior),
            committed: Mutex::new(Vec::new()),
            aborted: Mutex::new(Vec::new()),
            failed: Mutex::new(Vec::new()),
            inactive: Mutex::new(Vec::new()),
        })
    }

    fn committed_count(&self) -> usize {
        self.committed.lock().len()
    }

    fn aborted_count(&self) -> usize {
        self.aborted.lock().len()
    }

    fn failed_count(&self) -> usize {
        self.failed.lock().len()
    }

    fn inactive_count(&self) -> usize {
        self.inactive.lock().len()
    }
}

#[async_trait]
impl TransactionManager for MockTransactionManager {
    fn begin_transaction(&self, auto_commit: bool) -> TransactionId {
        let transaction_id = TransactionId::new();
        self.transactions.lock().insert(
            transaction_id,
            TransactionInfo {
                transaction_id,
                auto_commit_context: auto_commit,
            },
        );
        transaction_id
    }

    fn transaction_info(&self, transaction_id: TransactionId) -> Option<TransactionInfo> {
        self.transactions.lock().get(&transaction_id).copied()
    }

    async fn commit(&self, transaction_id: TransactionId) -> Result<CommitResult, QueryError> {
        self.committed.lock().push(transaction_id);
        match &*self.commit_behavior.lock() {
            CommitBehavior::Succeed(result) => Ok(result.clone()),
            CommitBehavior::Fail(message) => Err(QueryError::TransactionFailure(message.clone())),
        }
    }

    fn abort(&self, transaction_id: TransactionId) {
        self.aborted.lock().push(transaction_id);
    }

    fn fail(&self, transaction_id: TransactionId) {
        self.failed.lock().push(transaction_id);
    }

    fn try_set_inactive(&self, transaction_id: TransactionId) {
        self.inactive.lock().push(transaction_id);
    }
}

struct TestCommitHandle {
    table: SchemaTableName,
    write_payload: String,
    read_payload: String,
}

impl TestCommitHandle {
    fn for_table(table: SchemaTableName) -> Arc<Self> {
        Arc::new(Self {
            table,
            write_payload: "write-payload".to_string(),
            read_payload: "read-payload".to_string(),
        })
    }
}

impl CommitHandle for TestCommitHandle {
    fn has_commit_output(&self, table: &SchemaTableName) -> bool {
        *table == self.table
    }

    fn serialized_commit_output_for_read(&self, table: &SchemaTableName) -> String {
        if *table == self.table {
            self.read_payload.clone()
        } else {
            String::new()
        }
    }

    fn serialized_commit_output_for_write(&self, table: &SchemaTableName) -> String {
        if *table == self.table {
            self.write_payload.clone()
        } else {
            String::new()
        }
    }
}

fn lifecycle_with(
    session: Session,
    transaction_manager: Arc<MockTransactionManager>,
) -> Arc<QueryLifecycle> {
    let _ = env_logger::builder().is_test(true).try_init();
    QueryLifecycle::begin(
        "SELECT orderkey FROM orders",
        None,
        session,
        ResourceGroupId::global(),
        false,
        transaction_manager,
        Arc::new(NoopCleanup),
        Arc::new(TokioExecutor::current()),
    )
}

fn auto_commit_lifecycle(
    transaction_manager: Arc<MockTransactionManager>,
) -> Arc<QueryLifecycle> {
    lifecycle_with(Session::new("alice"), transaction_manager)
}

fn run_to_running(lifecycle: &QueryLifecycle) {
    assert!(lifecycle.transition_to_queued());
    assert!(lifecycle.transition_to_waiting_for_resources());
    assert!(lifecycle.transition_to_dispatching());
    assert!(lifecycle.transition_to_planning());
    assert!(lifecycle.transition_to_starting());
    assert!(lifecycle.transition_to_running());
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within timeout"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn finished_stage(query_id: QueryId) -> StageInfo {
    let attempt = StageExecutionInfo {
        state: StageExecutionState::Finished,
        stats: StageExecutionStats {
            total_tasks: 2,
            completed_tasks: 2,
            raw_input_rows: 100,
            raw_input_bytes: 4096,
            operator_summaries: vec![OperatorSummary {
                plan_node_id: "node-0".to_string(),
                operator_type: "TableScan".to_string(),
                input_rows: 100,
                output_rows: 100,
                metrics: serde_json::json!({}),
            }],
            ..StageExecutionStats::default()
        },
        tasks: vec![
            TaskInfo {
                task_id: TaskId::new(StageId::new(query_id, 0), 0),
                state: TaskState::Finished,
            },
            TaskInfo {
                task_id: TaskId::new(StageId::new(query_id, 0), 1),
                state: TaskState::Failed,
            },
        ],
        failure_cause: None,
    };
    StageInfo {
        stage_id: StageId::new(query_id, 0),
        plan: None,
        latest_attempt_execution_info: attempt.clone(),
        previous_attempts_execution_infos: vec![],
        sub_stages: vec![StageInfo {
            stage_id: StageId::new(query_id, 1),
            plan: None,
            latest_attempt_execution_info: attempt,
            previous_attempts_execution_infos: vec![],
            sub_stages: vec![],
            runtime_optimized: true,
        }],
        runtime_optimized: false,
    }
}

// ==============================================================================
// TRANSITION ORDERING
// ==============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn transitions_follow_lifecycle_order() {
    let tm = MockTransactionManager::new(CommitBehavior::Succeed(CommitResult::None));
    let lifecycle = auto_commit_lifecycle(tm);

    assert_eq!(lifecycle.get_query_state(), QueryState::WaitingForPrerequisites);
    run_to_running(&lifecycle);
    assert_eq!(lifecycle.get_query_state(), QueryState::Running);

    // transitions never regress
    assert!(!lifecycle.transition_to_queued());
    assert!(!lifecycle.transition_to_planning());
    assert_eq!(lifecycle.get_query_state(), QueryState::Running);
}

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_transition_is_rejected() {
    let tm = MockTransactionManager::new(CommitBehavior::Succeed(CommitResult::None));
    let lifecycle = auto_commit_lifecycle(tm);

    assert!(lifecycle.transition_to_queued());
    assert!(!lifecycle.transition_to_queued());
}

#[tokio::test(flavor = "multi_thread")]
async fn intermediate_phases_may_be_skipped() {
    let tm = MockTransactionManager::new(CommitBehavior::Succeed(CommitResult::None));
    let lifecycle = auto_commit_lifecycle(tm);

    assert!(lifecycle.transition_to_running());
    assert_eq!(lifecycle.get_query_state(), QueryState::Running);
}

#[tokio::test(flavor = "multi_thread")]
async fn state_change_future_resolves_on_transition() {
    let tm = MockTransactionManager::new(CommitBehavior::Succeed(CommitResult::None));
    let lifecycle = auto_commit_lifecycle(tm);

    let pending = lifecycle.get_state_change(QueryState::WaitingForPrerequisites);
    lifecycle.transition_to_queued();
    assert_eq!(pending.await.unwrap(), QueryState::Queued);
}

// ==============================================================================
// FINISHING AND COMMIT
// ==============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn auto_commit_finishing_reaches_finished() {
    let tm = MockTransactionManager::new(CommitBehavior::Succeed(CommitResult::None));
    let lifecycle = auto_commit_lifecycle(Arc::clone(&tm));

    run_to_running(&lifecycle);
    assert!(lifecycle.transition_to_finishing());
    assert!(!lifecycle.transition_to_finishing());

    wait_until(|| lifecycle.get_query_state() == QueryState::Finished).await;
    assert_eq!(tm.committed_count(), 1);
    wait_until(|| tm.inactive_count() == 1).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn write_commit_attaches_output_and_input_payloads() {
    let table = SchemaTableName::new("tpch", "orders_copy");
    let handle = TestCommitHandle::for_table(table.clone());
    let tm = MockTransactionManager::new(CommitBehavior::Succeed(CommitResult::Single(handle)));
    let lifecycle = auto_commit_lifecycle(Arc::clone(&tm));

    lifecycle.set_output(Some(Output {
        connector_id: "hive".to_string(),
        schema: table.schema.clone(),
        table: table.table.clone(),
        serialized_commit_output: String::new(),
        columns: vec![Column::new("orderkey", "bigint")],
    }));
    lifecycle.set_inputs(vec![
        Input {
            connector_id: "hive".to_string(),
            schema: table.schema.clone(),
            table: table.table.clone(),
            connector_info: None,
            columns: vec![Column::new("orderkey", "bigint")],
            statistics: None,
            serialized_commit_output: String::new(),
        },
        Input {
            connector_id: "hive".to_string(),
            schema: "tpch".to_string(),
            table: "lineitem".to_string(),
            connector_info: None,
            columns: vec![Column::new("partkey", "bigint")],
            statistics: None,
            serialized_commit_output: String::new(),
        },
    ]);

    run_to_running(&lifecycle);
    assert!(lifecycle.transition_to_finishing());

    wait_until(|| lifecycle.get_query_state() == QueryState::Finished).await;
    wait_until(|| {
        lifecycle
            .output()
            .map(|output| output.serialized_commit_output == "write-payload")
            .unwrap_or(false)
    })
    .await;

    let inputs = lifecycle.inputs();
    assert_eq!(inputs[0].serialized_commit_output, "read-payload");
    // tables without a matching handle keep an empty payload
    assert_eq!(inputs[1].serialized_commit_output, "");
}

#[tokio::test(flavor = "multi_thread")]
async fn read_only_commit_attaches_input_payloads() {
    let table = SchemaTableName::new("tpch", "orders");
    let handle = TestCommitHandle::for_table(table.clone());
    let tm = MockTransactionManager::new(CommitBehavior::Succeed(CommitResult::Many(vec![
        handle,
    ])));
    let lifecycle = auto_commit_lifecycle(Arc::clone(&tm));

    lifecycle.set_inputs(vec![Input {
        connector_id: "hive".to_string(),
        schema: table.schema.clone(),
        table: table.table.clone(),
        connector_info: None,
        columns: vec![Column::new("orderkey", "bigint")],
        statistics: None,
        serialized_commit_output: String::new(),
    }]);

    run_to_running(&lifecycle);
    assert!(lifecycle.transition_to_finishing());

    wait_until(|| lifecycle.get_query_state() == QueryState::Finished).await;
    wait_until(|| lifecycle.inputs()[0].serialized_commit_output == "read-payload").await;
}

#[tokio::test(flavor = "multi_thread")]
async fn commit_failure_fails_query() {
    let tm = MockTransactionManager::new(CommitBehavior::Fail("commit exploded".to_string()));
    let lifecycle = auto_commit_lifecycle(Arc::clone(&tm));

    run_to_running(&lifecycle);
    assert!(lifecycle.transition_to_finishing());

    wait_until(|| lifecycle.get_query_state() == QueryState::Failed).await;
    let failure = lifecycle.get_failure_info().unwrap();
    assert_eq!(failure.kind, ErrorKind::TransactionFailure);
    assert!(failure.message.contains("commit exploded"));
}

#[tokio::test(flavor = "multi_thread")]
async fn explicit_transaction_is_not_committed() {
    let tm = MockTransactionManager::new(CommitBehavior::Succeed(CommitResult::None));
    let transaction_id = tm.begin_transaction(false);
    let session = Session::new("alice").with_transaction_id(transaction_id);
    let lifecycle = lifecycle_with(session, Arc::clone(&tm));

    run_to_running(&lifecycle);
    assert!(lifecycle.transition_to_finishing());

    wait_until(|| lifecycle.get_query_state() == QueryState::Finished).await;
    assert_eq!(tm.committed_count(), 0);
}

// ==============================================================================
// FAILURE AND CANCELLATION
// ==============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn failure_records_cause_and_aborts_auto_commit_transaction() {
    let tm = MockTransactionManager::new(CommitBehavior::Succeed(CommitResult::None));
    let lifecycle = auto_commit_lifecycle(Arc::clone(&tm));

    run_to_running(&lifecycle);
    assert!(lifecycle.transition_to_failed(QueryError::NotFound("table gone".to_string())));
    assert_eq!(lifecycle.get_query_state(), QueryState::Failed);

    let failure = lifecycle.get_failure_info().unwrap();
    assert_eq!(failure.kind, ErrorKind::NotFound);
    assert_eq!(tm.aborted_count(), 1);
    assert_eq!(tm.failed_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn failure_of_explicit_transaction_fails_it() {
    let tm = MockTransactionManager::new(CommitBehavior::Succeed(CommitResult::None));
    let transaction_id = tm.begin_transaction(false);
    let session = Session::new("bob").with_transaction_id(transaction_id);
    let lifecycle = lifecycle_with(session, Arc::clone(&tm));

    assert!(lifecycle.transition_to_failed(QueryError::InvalidArgument("bad plan".to_string())));
    assert_eq!(tm.failed_count(), 1);
    assert_eq!(tm.aborted_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn failure_after_finished_is_ignored() {
    let tm = MockTransactionManager::new(CommitBehavior::Succeed(CommitResult::None));
    let transaction_id = tm.begin_transaction(false);
    let session = Session::new("alice").with_transaction_id(transaction_id);
    let lifecycle = lifecycle_with(session, Arc::clone(&tm));

    run_to_running(&lifecycle);
    assert!(lifecycle.transition_to_finishing());
    wait_until(|| lifecycle.get_query_state() == QueryState::Finished).await;

    assert!(!lifecycle.transition_to_failed(QueryError::NotFound("late".to_string())));
    assert_eq!(lifecycle.get_query_state(), QueryState::Finished);
    assert!(lifecycle.get_failure_info().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_fails_query_with_user_cancellation() {
    let tm = MockTransactionManager::new(CommitBehavior::Succeed(CommitResult::None));
    let lifecycle = auto_commit_lifecycle(Arc::clone(&tm));

    run_to_running(&lifecycle);
    assert!(lifecycle.transition_to_canceled());
    assert_eq!(lifecycle.get_query_state(), QueryState::Failed);

    let failure = lifecycle.get_failure_info().unwrap();
    assert_eq!(failure.kind, ErrorKind::UserCanceled);
    assert_eq!(tm.aborted_count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn first_failure_cause_wins() {
    let tm = MockTransactionManager::new(CommitBehavior::Succeed(CommitResult::None));
    let lifecycle = auto_commit_lifecycle(tm);

    assert!(lifecycle.transition_to_failed(QueryError::NotFound("first".to_string())));
    assert!(!lifecycle.transition_to_canceled());

    let failure = lifecycle.get_failure_info().unwrap();
    assert_eq!(failure.kind, ErrorKind::NotFound);
}

// ==============================================================================
// CONCURRENT ACCOUNTING
// ==============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_memory_updates_keep_peak_sane() {
    let tm = MockTransactionManager::new(CommitBehavior::Succeed(CommitResult::None));
    let lifecycle = auto_commit_lifecycle(tm);

    const THREADS: usize = 8;
    const DELTA: i64 = 1 << 20;

    let handles: Vec<_> = (0..THREADS)
        .map(|_| {
            let lifecycle = Arc::clone(&lifecycle);
            std::thread::spawn(move || {
                for _ in 0..100 {
                    lifecycle.update_memory_usage(DELTA, 2 * DELTA, DELTA, 2 * DELTA, 2 * DELTA);
                    lifecycle.update_memory_usage(-DELTA, -2 * DELTA, DELTA, 2 * DELTA, 2 * DELTA);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let peak_user = lifecycle.peak_user_memory_bytes();
    assert!(peak_user >= DELTA as u64);
    assert!(peak_user <= (THREADS as u64) * DELTA as u64);
    assert_eq!(lifecycle.peak_task_user_memory_bytes(), DELTA as u64);
    assert_eq!(lifecycle.peak_node_total_memory_bytes(), 2 * DELTA as u64);
}

#[tokio::test(flavor = "multi_thread")]
async fn memory_peak_records_every_prefix_sum() {
    let tm = MockTransactionManager::new(CommitBehavior::Succeed(CommitResult::None));
    let lifecycle = auto_commit_lifecycle(tm);

    lifecycle.update_memory_usage(10, 20, 0, 0, 0);
    lifecycle.update_memory_usage(-10, -20, 0, 0, 0);
    // the peak reflects the total each add produced, so a later decrement
    // back to zero never erases it
    assert_eq!(lifecycle.peak_user_memory_bytes(), 10);
    assert_eq!(lifecycle.peak_total_memory_bytes(), 20);

    lifecycle.update_memory_usage(5, 5, 0, 0, 0);
    assert_eq!(lifecycle.peak_user_memory_bytes(), 10);
    assert_eq!(lifecycle.peak_total_memory_bytes(), 20);
}

#[tokio::test(flavor = "multi_thread")]
async fn running_task_count_tracks_peak() {
    let tm = MockTransactionManager::new(CommitBehavior::Succeed(CommitResult::None));
    let lifecycle = auto_commit_lifecycle(tm);

    assert_eq!(lifecycle.increment_current_running_task_count(), 1);
    assert_eq!(lifecycle.increment_current_running_task_count(), 2);
    assert_eq!(lifecycle.decrement_current_running_task_count(), 1);
    assert_eq!(lifecycle.increment_current_running_task_count(), 2);
    assert_eq!(lifecycle.decrement_current_running_task_count(), 1);
    assert_eq!(lifecycle.decrement_current_running_task_count(), 0);

    assert_eq!(lifecycle.current_running_task_count(), 0);
    assert_eq!(lifecycle.peak_running_task_count(), 2);
}

// ==============================================================================
// SESSION MUTATIONS
// ==============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn duplicate_session_mutations_are_rejected() {
    let tm = MockTransactionManager::new(CommitBehavior::Succeed(CommitResult::None));
    let lifecycle = auto_commit_lifecycle(tm);

    lifecycle.set_catalog("hive").unwrap();
    assert!(matches!(
        lifecycle.set_catalog("iceberg"),
        Err(QueryError::AlreadyExists(_))
    ));

    lifecycle.add_set_session_property("optimizer_mode", "cost").unwrap();
    assert!(matches!(
        lifecycle.add_set_session_property("optimizer_mode", "rule"),
        Err(QueryError::AlreadyExists(_))
    ));

    lifecycle.add_reset_session_property("join_distribution").unwrap();
    assert!(matches!(
        lifecycle.add_reset_session_property("join_distribution"),
        Err(QueryError::AlreadyExists(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn prepared_statement_add_and_remove() {
    let tm = MockTransactionManager::new(CommitBehavior::Succeed(CommitResult::None));
    let session = Session::new("alice").with_prepared_statement("q1", "SELECT 1");
    let lifecycle = lifecycle_with(session, tm);

    // key registered in the session cannot be re-added
    assert!(matches!(
        lifecycle.add_prepared_statement("q1", "SELECT 2"),
        Err(QueryError::AlreadyExists(_))
    ));
    lifecycle.add_prepared_statement("q2", "SELECT 2").unwrap();
    assert!(matches!(
        lifecycle.add_prepared_statement("q2", "SELECT 3"),
        Err(QueryError::AlreadyExists(_))
    ));

    lifecycle.remove_prepared_statement("q1", false).unwrap();
    assert!(matches!(
        lifecycle.remove_prepared_statement("missing", false),
        Err(QueryError::NotFound(_))
    ));
    // tolerant removal of an unknown key is a silent no-op
    lifecycle.remove_prepared_statement("missing", true).unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn session_function_add_and_remove() {
    let tm = MockTransactionManager::new(CommitBehavior::Succeed(CommitResult::None));
    let existing = SqlInvokedFunction {
        signature: SqlFunctionId::new("double_it", vec!["bigint".to_string()]),
        return_type: "bigint".to_string(),
        body: "RETURN x * 2".to_string(),
    };
    let session = Session::new("alice").with_session_function(existing.clone());
    let lifecycle = lifecycle_with(session, tm);

    assert!(matches!(
        lifecycle.add_session_function(existing.signature.clone(), existing.clone()),
        Err(QueryError::AlreadyExists(_))
    ));

    let fresh = SqlInvokedFunction {
        signature: SqlFunctionId::new("triple_it", vec!["bigint".to_string()]),
        return_type: "bigint".to_string(),
        body: "RETURN x * 3".to_string(),
    };
    lifecycle.add_session_function(fresh.signature.clone(), fresh.clone()).unwrap();
    assert!(matches!(
        lifecycle.add_session_function(fresh.signature.clone(), fresh),
        Err(QueryError::AlreadyExists(_))
    ));

    lifecycle.remove_session_function(&existing.signature, false).unwrap();
    let unknown = SqlFunctionId::new("nope", vec![]);
    assert!(matches!(
        lifecycle.remove_session_function(&unknown, false),
        Err(QueryError::NotFound(_))
    ));
    lifecycle.remove_session_function(&unknown, true).unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn start_and_clear_transaction_are_mutually_exclusive() {
    let tm = MockTransactionManager::new(CommitBehavior::Succeed(CommitResult::None));
    let lifecycle = auto_commit_lifecycle(Arc::clone(&tm));

    lifecycle.set_started_transaction_id(TransactionId::new()).unwrap();
    assert!(matches!(
        lifecycle.clear_transaction_id(),
        Err(QueryError::InvariantViolation(_))
    ));

    let other = auto_commit_lifecycle(tm);
    other.clear_transaction_id().unwrap();
    assert!(matches!(
        other.set_started_transaction_id(TransactionId::new()),
        Err(QueryError::InvariantViolation(_))
    ));
}

// ==============================================================================
// SNAPSHOTS AND THE FINAL LATCH
// ==============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn query_info_reflects_stage_tree() {
    let tm = MockTransactionManager::new(CommitBehavior::Succeed(CommitResult::None));
    let lifecycle = auto_commit_lifecycle(tm);

    run_to_running(&lifecycle);
    let stage = finished_stage(lifecycle.query_id());
    let info = lifecycle.get_query_info(Some(stage));

    assert_eq!(info.state, QueryState::Running);
    // not final while the query is still running
    assert!(!info.final_query_info);
    assert!(info.failed_tasks.is_none());
    assert_eq!(info.stats.total_tasks, 4);
    assert_eq!(info.stats.raw_input_rows, 200);
    assert_eq!(
        info.runtime_optimized_stages,
        Some(vec![StageId::new(lifecycle.query_id(), 1)])
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn final_info_latches_once_and_listener_fires_once() {
    let tm = MockTransactionManager::new(CommitBehavior::Succeed(CommitResult::None));
    let lifecycle = auto_commit_lifecycle(tm);

    let fired = Arc::new(AtomicUsize::new(0));
    {
        let fired = Arc::clone(&fired);
        lifecycle.add_final_query_info_listener(move |_info| {
            fired.fetch_add(1, Ordering::SeqCst);
        });
    }

    run_to_running(&lifecycle);
    assert!(lifecycle.transition_to_finishing());
    wait_until(|| lifecycle.get_query_state() == QueryState::Finished).await;

    let stage = finished_stage(lifecycle.query_id());
    let first = lifecycle.update_query_info(Some(stage.clone()));
    assert!(first.final_query_info);
    assert_eq!(first.failed_tasks.as_ref().map(Vec::len), Some(2));

    // repeated updates never replace the latched snapshot
    let second = lifecycle.update_query_info(Some(stage));
    assert!(second.final_query_info);
    assert_eq!(lifecycle.get_final_query_info().unwrap().stats.total_tasks, 4);

    wait_until(|| fired.load(Ordering::SeqCst) == 1).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(fired.load(Ordering::SeqCst), 1);

    // a listener registered after the latch gets the cached snapshot once
    let late = Arc::new(AtomicUsize::new(0));
    {
        let late = Arc::clone(&late);
        lifecycle.add_final_query_info_listener(move |info| {
            assert!(info.final_query_info);
            late.fetch_add(1, Ordering::SeqCst);
        });
    }
    wait_until(|| late.load(Ordering::SeqCst) == 1).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn basic_query_info_carries_counters() {
    let tm = MockTransactionManager::new(CommitBehavior::Succeed(CommitResult::None));
    let lifecycle = auto_commit_lifecycle(tm);

    run_to_running(&lifecycle);
    lifecycle.update_memory_usage(1024, 2048, 1024, 2048, 2048);
    lifecycle.increment_current_running_task_count();

    let info = lifecycle.get_basic_query_info(None);
    assert_eq!(info.state, QueryState::Running);
    assert_eq!(info.stats.peak_user_memory_bytes, 1024);
    assert_eq!(info.stats.running_tasks, 1);
    assert!(!info.scheduled);
}

// ==============================================================================
// PRUNING
// ==============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn finished_pruning_drops_operator_summaries() {
    let tm = MockTransactionManager::new(CommitBehavior::Succeed(CommitResult::None));
    let lifecycle = auto_commit_lifecycle(tm);

    run_to_running(&lifecycle);
    assert!(lifecycle.transition_to_finishing());
    wait_until(|| lifecycle.get_query_state() == QueryState::Finished).await;

    let info = lifecycle.update_query_info(Some(finished_stage(lifecycle.query_id())));
    assert!(!info.stats.operator_summaries.is_empty());

    lifecycle.prune_query_info_finished();
    let pruned = lifecycle.get_final_query_info().unwrap();
    assert!(pruned.stats.operator_summaries.is_empty());
    // scalar aggregates survive
    assert_eq!(pruned.stats.total_tasks, 4);
    // the stage tree keeps its structure under the light variant
    assert_eq!(pruned.output_stage.as_ref().unwrap().sub_stages.len(), 1);

    // idempotent
    lifecycle.prune_query_info_finished();
    assert_eq!(lifecycle.get_final_query_info().unwrap(), pruned);
}

#[tokio::test(flavor = "multi_thread")]
async fn finished_pruning_clears_planner_estimates() {
    let tm = MockTransactionManager::new(CommitBehavior::Succeed(CommitResult::None));
    let lifecycle = auto_commit_lifecycle(tm);

    lifecycle.session().record_plan_node_estimate("node-0", 100.0, 7.5);
    lifecycle.session().record_plan_node_estimate("node-1", 50.0, 3.0);
    assert_eq!(lifecycle.session().plan_node_estimate_count(), 2);

    run_to_running(&lifecycle);
    assert!(lifecycle.transition_to_finishing());
    wait_until(|| lifecycle.get_query_state() == QueryState::Finished).await;
    lifecycle.update_query_info(Some(finished_stage(lifecycle.query_id())));

    // estimates survive until the final snapshot is pruned
    assert_eq!(lifecycle.session().plan_node_estimate_count(), 2);
    lifecycle.prune_query_info_finished();
    assert_eq!(lifecycle.session().plan_node_estimate_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn expired_pruning_collapses_stage_tree() {
    let tm = MockTransactionManager::new(CommitBehavior::Succeed(CommitResult::None));
    let lifecycle = auto_commit_lifecycle(tm);

    run_to_running(&lifecycle);
    assert!(lifecycle.transition_to_finishing());
    wait_until(|| lifecycle.get_query_state() == QueryState::Finished).await;
    lifecycle.update_query_info(Some(finished_stage(lifecycle.query_id())));

    lifecycle.prune_query_info_expired();
    let pruned = lifecycle.get_final_query_info().unwrap();
    let stage = pruned.output_stage.as_ref().unwrap();
    assert!(stage.sub_stages.is_empty());
    assert!(stage.latest_attempt_execution_info.tasks.is_empty());
    assert_eq!(stage.latest_attempt_execution_info.stats.total_tasks, 2);

    // idempotent
    lifecycle.prune_query_info_expired();
    assert_eq!(lifecycle.get_final_query_info().unwrap(), pruned);
}

#[tokio::test(flavor = "multi_thread")]
async fn pruning_without_final_info_is_a_noop() {
    let tm = MockTransactionManager::new(CommitBehavior::Succeed(CommitResult::None));
    let lifecycle = auto_commit_lifecycle(tm);

    lifecycle.prune_query_info_finished();
    lifecycle.prune_query_info_expired();
    assert!(lifecycle.get_final_query_info().is_none());
}
