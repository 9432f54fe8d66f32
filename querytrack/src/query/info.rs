// Copyright (c) 2024-2025 DeepGraph Inc.
// SPDX-License-Identifier: Apache-2.0
//
//! Query snapshot value types and pruning
//!
//! Immutable values assembled by the lifecycle coordinator for monitoring
//! and client-facing readers. Composite snapshots may reflect slightly
//! different instants per field; they serve diagnostics, not transactional
//! decisions. The pruning helpers rebuild a snapshot replacing only the
//! sub-fields being dropped, via struct-update syntax, so the expired and
//! finished variants cannot drift apart on untouched fields.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::FailureInfo;
use crate::query::state::QueryState;
use crate::query::timer::QueryStateTimer;
use crate::session::{SelectedRole, SessionSnapshot, SqlFunctionId, SqlInvokedFunction};
use crate::txn::TransactionId;
use crate::types::{QueryId, ResourceGroupId, StageId, TaskId};

/// Output column descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub type_name: String,
}

impl Column {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
        }
    }
}

/// Write sink of a query, present only for write queries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Output {
    pub connector_id: String,
    pub schema: String,
    pub table: String,
    /// Serialized write-commit payload, attached after commit
    pub serialized_commit_output: String,
    pub columns: Vec<Column>,
}

/// One source table read by the query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Input {
    pub connector_id: String,
    pub schema: String,
    pub table: String,
    pub connector_info: Option<serde_json::Value>,
    pub columns: Vec<Column>,
    pub statistics: Option<TableStatistics>,
    /// Serialized read-commit payload, attached after commit
    pub serialized_commit_output: String,
}

/// Equi-width histogram over a column's values
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    pub buckets: Vec<HistogramBucket>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramBucket {
    pub low: f64,
    pub high: f64,
    pub count: f64,
}

/// Connector-reported per-column statistics
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ColumnStatistics {
    pub null_fraction: Option<f64>,
    pub distinct_values: Option<f64>,
    pub data_size_bytes: Option<f64>,
    pub histogram: Option<Histogram>,
}

/// Connector-reported table statistics
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TableStatistics {
    pub row_count: Option<f64>,
    pub column_statistics: HashMap<String, ColumnStatistics>,
}

/// Planner estimate for a single plan node
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PlanNodeStatsEstimate {
    pub output_row_count: f64,
    pub variable_statistics: HashMap<String, VariableStatsEstimate>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct VariableStatsEstimate {
    pub low: f64,
    pub high: f64,
    pub nulls_fraction: f64,
    pub histogram: Option<Histogram>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PlanCostEstimate {
    pub cpu_cost: f64,
    pub memory_cost: f64,
    pub network_cost: f64,
}

/// Planner statistics and cost estimates keyed by plan node id
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PlanStatsAndCosts {
    pub stats: HashMap<String, PlanNodeStatsEstimate>,
    pub costs: HashMap<String, PlanCostEstimate>,
}

impl PlanStatsAndCosts {
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Per-operator execution summary; dropped by finished-pruning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorSummary {
    pub plan_node_id: String,
    pub operator_type: String,
    pub input_rows: u64,
    pub output_rows: u64,
    pub metrics: serde_json::Value,
}

/// Task lifecycle state as reported by the execution engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Running,
    Finished,
    Failed,
    Canceled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub task_id: TaskId,
    pub state: TaskState,
}

/// Stage execution attempt state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageExecutionState {
    Scheduling,
    Running,
    Finished,
    Failed,
    Canceled,
    Aborted,
}

impl StageExecutionState {
    pub fn is_done(&self) -> bool {
        matches!(
            self,
            StageExecutionState::Finished
                | StageExecutionState::Failed
                | StageExecutionState::Canceled
                | StageExecutionState::Aborted
        )
    }
}

/// Aggregate statistics for one stage execution attempt
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StageExecutionStats {
    pub total_tasks: u32,
    pub completed_tasks: u32,
    pub total_cpu_time_ms: u64,
    pub total_scheduled_time_ms: u64,
    pub raw_input_rows: u64,
    pub raw_input_bytes: u64,
    pub cumulative_user_memory: f64,
    pub user_memory_reservation_bytes: u64,
    pub total_memory_reservation_bytes: u64,
    pub operator_summaries: Vec<OperatorSummary>,
}

/// One execution attempt of a stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageExecutionInfo {
    pub state: StageExecutionState,
    pub stats: StageExecutionStats,
    pub tasks: Vec<TaskInfo>,
    pub failure_cause: Option<FailureInfo>,
}

impl StageExecutionInfo {
    /// Whether this attempt's information will never change again
    pub fn is_final(&self) -> bool {
        self.state.is_done()
    }
}

/// Physical plan fragment retained for diagnostics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanFragment {
    pub id: u32,
    pub json_representation: serde_json::Value,
    pub stats_and_costs: Option<PlanStatsAndCosts>,
}

/// Stage sub-tree of a query's execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageInfo {
    pub stage_id: StageId,
    pub plan: Option<PlanFragment>,
    pub latest_attempt_execution_info: StageExecutionInfo,
    pub previous_attempts_execution_infos: Vec<StageExecutionInfo>,
    pub sub_stages: Vec<StageInfo>,
    pub runtime_optimized: bool,
}

impl StageInfo {
    /// Whether this stage and all sub-stages report final information
    pub fn is_final_stage_info(&self) -> bool {
        self.latest_attempt_execution_info.is_final()
            && self.sub_stages.iter().all(StageInfo::is_final_stage_info)
    }

    /// Flatten the stage tree rooted at `root`, root first
    pub fn all_stages(root: Option<&StageInfo>) -> Vec<&StageInfo> {
        let mut stages = Vec::new();
        if let Some(root) = root {
            root.collect(&mut stages);
        }
        stages
    }

    fn collect<'a>(&'a self, into: &mut Vec<&'a StageInfo>) {
        into.push(self);
        for sub_stage in &self.sub_stages {
            sub_stage.collect(into);
        }
    }
}

/// Root-stage statistics supplied by the execution engine for the basic
/// snapshot; zeroed when no stage has been scheduled yet
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BasicStageExecutionStats {
    pub scheduled: bool,
    pub total_drivers: u64,
    pub queued_drivers: u64,
    pub running_drivers: u64,
    pub completed_drivers: u64,
    pub raw_input_rows: u64,
    pub raw_input_bytes: u64,
    pub cumulative_user_memory: f64,
    pub user_memory_reservation_bytes: u64,
    pub total_memory_reservation_bytes: u64,
    pub total_cpu_time_ms: u64,
    pub total_scheduled_time_ms: u64,
    pub fully_blocked: bool,
    pub progress_percentage: Option<f64>,
}

/// Lightweight statistics for the basic snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicQueryStats {
    pub create_time_ms: i64,
    pub end_time_ms: Option<i64>,
    pub waiting_for_prerequisites_time_ms: u64,
    pub queued_time_ms: u64,
    pub elapsed_time_ms: u64,
    pub execution_time_ms: u64,
    pub analysis_time_ms: u64,

    pub running_tasks: i32,
    pub peak_running_tasks: i32,

    pub total_drivers: u64,
    pub queued_drivers: u64,
    pub running_drivers: u64,
    pub completed_drivers: u64,

    pub raw_input_rows: u64,
    pub raw_input_bytes: u64,

    pub cumulative_user_memory: f64,
    pub user_memory_reservation_bytes: u64,
    pub total_memory_reservation_bytes: u64,
    pub peak_user_memory_bytes: u64,
    pub peak_total_memory_bytes: u64,
    pub peak_task_total_memory_bytes: u64,
    pub peak_node_total_memory_bytes: u64,

    pub total_cpu_time_ms: u64,
    pub total_scheduled_time_ms: u64,
    pub fully_blocked: bool,
    pub progress_percentage: Option<f64>,
}

/// Point-in-time lightweight view of a query for monitoring lists
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BasicQueryInfo {
    pub query_id: QueryId,
    pub session: SessionSnapshot,
    pub resource_group: ResourceGroupId,
    pub state: QueryState,
    pub scheduled: bool,
    pub query: String,
    pub prepared_query: Option<String>,
    pub stats: BasicQueryStats,
    pub failure_info: Option<FailureInfo>,
}

/// Full statistics assembled from the timer, the coordinator counters and
/// the stage tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryStats {
    pub create_time_ms: i64,
    pub execution_start_time_ms: Option<i64>,
    pub last_heartbeat_ms: i64,
    pub end_time_ms: Option<i64>,

    pub elapsed_time_ms: u64,
    pub waiting_for_prerequisites_time_ms: u64,
    pub queued_time_ms: u64,
    pub waiting_for_resources_time_ms: u64,
    pub dispatching_time_ms: u64,
    pub planning_time_ms: u64,
    pub analysis_time_ms: u64,
    pub execution_time_ms: u64,
    pub finishing_time_ms: u64,

    pub total_tasks: u32,
    pub completed_tasks: u32,
    pub peak_running_tasks: i32,

    pub raw_input_rows: u64,
    pub raw_input_bytes: u64,
    pub cumulative_user_memory: f64,
    pub user_memory_reservation_bytes: u64,
    pub total_memory_reservation_bytes: u64,

    pub peak_user_memory_bytes: u64,
    pub peak_total_memory_bytes: u64,
    pub peak_task_user_memory_bytes: u64,
    pub peak_task_total_memory_bytes: u64,
    pub peak_node_total_memory_bytes: u64,

    pub total_cpu_time_ms: u64,
    pub total_scheduled_time_ms: u64,

    /// Per-operator summaries; dropped by pruning since they can hold a
    /// large amount of memory
    pub operator_summaries: Vec<OperatorSummary>,
}

/// Memory and task peaks captured by the coordinator's atomics
#[derive(Debug, Clone, Copy, Default)]
pub struct PeakValues {
    pub peak_running_tasks: i32,
    pub peak_user_memory_bytes: u64,
    pub peak_total_memory_bytes: u64,
    pub peak_task_user_memory_bytes: u64,
    pub peak_task_total_memory_bytes: u64,
    pub peak_node_total_memory_bytes: u64,
}

impl QueryStats {
    /// Aggregate timing, counters and all stage attempts into one value
    pub fn create(timer: &QueryStateTimer, peaks: PeakValues, all_stages: &[&StageInfo]) -> Self {
        let mut total_tasks = 0u32;
        let mut completed_tasks = 0u32;
        let mut raw_input_rows = 0u64;
        let mut raw_input_bytes = 0u64;
        let mut cumulative_user_memory = 0f64;
        let mut user_memory_reservation_bytes = 0u64;
        let mut total_memory_reservation_bytes = 0u64;
        let mut total_cpu_time_ms = 0u64;
        let mut total_scheduled_time_ms = 0u64;
        let mut operator_summaries = Vec::new();

        for stage in all_stages {
            let attempts = std::iter::once(&stage.latest_attempt_execution_info)
                .chain(stage.previous_attempts_execution_infos.iter());
            for attempt in attempts {
                let stats = &attempt.stats;
                total_tasks += stats.total_tasks;
                completed_tasks += stats.completed_tasks;
                raw_input_rows += stats.raw_input_rows;
                raw_input_bytes += stats.raw_input_bytes;
                cumulative_user_memory += stats.cumulative_user_memory;
                user_memory_reservation_bytes += stats.user_memory_reservation_bytes;
                total_memory_reservation_bytes += stats.total_memory_reservation_bytes;
                total_cpu_time_ms += stats.total_cpu_time_ms;
                total_scheduled_time_ms += stats.total_scheduled_time_ms;
                operator_summaries.extend(stats.operator_summaries.iter().cloned());
            }
        }

        QueryStats {
            create_time_ms: timer.create_time_millis(),
            execution_start_time_ms: timer.execution_start_time_millis(),
            last_heartbeat_ms: timer.last_heartbeat_millis(),
            end_time_ms: timer.end_time_millis(),
            elapsed_time_ms: timer.elapsed_time().as_millis() as u64,
            waiting_for_prerequisites_time_ms: timer.waiting_for_prerequisites_time().as_millis()
                as u64,
            queued_time_ms: timer.queued_time().as_millis() as u64,
            waiting_for_resources_time_ms: timer.waiting_for_resources_time().as_millis() as u64,
            dispatching_time_ms: timer.dispatching_time().as_millis() as u64,
            planning_time_ms: timer.planning_time().as_millis() as u64,
            analysis_time_ms: timer.analysis_time().as_millis() as u64,
            execution_time_ms: timer.execution_time().as_millis() as u64,
            finishing_time_ms: timer.finishing_time().as_millis() as u64,
            total_tasks,
            completed_tasks,
            peak_running_tasks: peaks.peak_running_tasks,
            raw_input_rows,
            raw_input_bytes,
            cumulative_user_memory,
            user_memory_reservation_bytes,
            total_memory_reservation_bytes,
            peak_user_memory_bytes: peaks.peak_user_memory_bytes,
            peak_total_memory_bytes: peaks.peak_total_memory_bytes,
            peak_task_user_memory_bytes: peaks.peak_task_user_memory_bytes,
            peak_task_total_memory_bytes: peaks.peak_task_total_memory_bytes,
            peak_node_total_memory_bytes: peaks.peak_node_total_memory_bytes,
            total_cpu_time_ms,
            total_scheduled_time_ms,
            operator_summaries,
        }
    }
}

/// What a data-modifying statement did, for client display
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateInfo {
    pub update_type: String,
    pub update_object: String,
}

/// Complete point-in-time view of a query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryInfo {
    pub query_id: QueryId,
    pub session: SessionSnapshot,
    pub state: QueryState,
    pub scheduled: bool,
    pub field_names: Vec<String>,
    pub query: String,
    pub expanded_query: Option<String>,
    pub prepared_query: Option<String>,
    pub stats: QueryStats,

    pub set_catalog: Option<String>,
    pub set_schema: Option<String>,
    pub set_session_properties: BTreeMap<String, String>,
    pub reset_session_properties: BTreeSet<String>,
    pub set_roles: BTreeMap<String, SelectedRole>,
    pub added_prepared_statements: BTreeMap<String, String>,
    pub deallocated_prepared_statements: BTreeSet<String>,
    pub added_session_functions: HashMap<SqlFunctionId, SqlInvokedFunction>,
    pub removed_session_functions: HashSet<SqlFunctionId>,
    pub started_transaction_id: Option<TransactionId>,
    pub clear_transaction_id: bool,
    pub update_info: Option<UpdateInfo>,

    pub output_stage: Option<StageInfo>,
    pub failure_info: Option<FailureInfo>,
    pub inputs: Vec<Input>,
    pub output: Option<Output>,
    /// True once the state is terminal and every stage reports final
    /// information; the first such snapshot is latched
    pub final_query_info: bool,
    pub resource_group: ResourceGroupId,
    pub failed_tasks: Option<Vec<TaskId>>,
    pub runtime_optimized_stages: Option<Vec<StageId>>,
    pub plan_stats_and_costs: PlanStatsAndCosts,
}

/// Drop histograms from every input's table statistics
pub fn prune_input_histograms(inputs: &[Input]) -> Vec<Input> {
    inputs
        .iter()
        .map(|input| Input {
            statistics: input.statistics.as_ref().map(|stats| TableStatistics {
                row_count: stats.row_count,
                column_statistics: stats
                    .column_statistics
                    .iter()
                    .map(|(name, column)| {
                        (
                            name.clone(),
                            ColumnStatistics {
                                histogram: None,
                                ..column.clone()
                            },
                        )
                    })
                    .collect(),
            }),
            ..input.clone()
        })
        .collect()
}

/// Drop histograms from planner estimates, keeping the scalar estimates
pub fn prune_histograms_from_stats_and_costs(stats_and_costs: &PlanStatsAndCosts) -> PlanStatsAndCosts {
    PlanStatsAndCosts {
        stats: stats_and_costs
            .stats
            .iter()
            .map(|(node_id, estimate)| {
                (
                    node_id.clone(),
                    PlanNodeStatsEstimate {
                        output_row_count: estimate.output_row_count,
                        variable_statistics: estimate
                            .variable_statistics
                            .iter()
                            .map(|(variable, stats)| {
                                (
                                    variable.clone(),
                                    VariableStatsEstimate {
                                        histogram: None,
                                        ..stats.clone()
                                    },
                                )
                            })
                            .collect(),
                    },
                )
            })
            .collect(),
        costs: stats_and_costs.costs.clone(),
    }
}

fn prune_stage_execution_stats(stats: &StageExecutionStats) -> StageExecutionStats {
    StageExecutionStats {
        operator_summaries: Vec::new(),
        ..stats.clone()
    }
}

/// Light pruning of a stage tree: keep the structure, drop plan-fragment
/// histograms and per-operator summaries
fn prune_stats_from_stage_info(stage: &StageInfo) -> StageInfo {
    StageInfo {
        plan: stage.plan.as_ref().map(|plan| PlanFragment {
            stats_and_costs: plan
                .stats_and_costs
                .as_ref()
                .map(prune_histograms_from_stats_and_costs),
            ..plan.clone()
        }),
        latest_attempt_execution_info: StageExecutionInfo {
            stats: prune_stage_execution_stats(&stage.latest_attempt_execution_info.stats),
            ..stage.latest_attempt_execution_info.clone()
        },
        previous_attempts_execution_infos: stage
            .previous_attempts_execution_infos
            .iter()
            .map(|attempt| StageExecutionInfo {
                stats: prune_stage_execution_stats(&attempt.stats),
                ..attempt.clone()
            })
            .collect(),
        sub_stages: stage.sub_stages.iter().map(prune_stats_from_stage_info).collect(),
        ..stage.clone()
    }
}

/// Finished-pruning: strip the large optional sub-structures (histograms,
/// per-operator summaries, planner estimates) while preserving every
/// scalar and aggregate counter
pub fn prune_finished_query_info(info: &QueryInfo, pruned_inputs: Vec<Input>) -> QueryInfo {
    QueryInfo {
        stats: QueryStats {
            operator_summaries: Vec::new(),
            ..info.stats.clone()
        },
        output_stage: info.output_stage.as_ref().map(prune_stats_from_stage_info),
        inputs: pruned_inputs,
        plan_stats_and_costs: prune_histograms_from_stats_and_costs(&info.plan_stats_and_costs),
        ..info.clone()
    }
}

/// Expired-pruning: collapse the stage tree to a minimal shape, dropping
/// the plan, all but the latest attempt and nested task details, while
/// retaining aggregate statistics
pub fn prune_expired_query_info(info: &QueryInfo) -> QueryInfo {
    QueryInfo {
        stats: QueryStats {
            operator_summaries: Vec::new(),
            ..info.stats.clone()
        },
        output_stage: info.output_stage.as_ref().map(|stage| StageInfo {
            stage_id: stage.stage_id,
            plan: None,
            latest_attempt_execution_info: StageExecutionInfo {
                state: stage.latest_attempt_execution_info.state,
                stats: prune_stage_execution_stats(&stage.latest_attempt_execution_info.stats),
                tasks: Vec::new(),
                failure_cause: stage.latest_attempt_execution_info.failure_cause.clone(),
            },
            previous_attempts_execution_infos: Vec::new(),
            sub_stages: Vec::new(),
            runtime_optimized: stage.runtime_optimized,
        }),
        plan_stats_and_costs: PlanStatsAndCosts::empty(),
        ..info.clone()
    }
}
