//! The repository port: transactional CRUD over definitions, runs, steps,
//! assets, schedules, recovery requests and history, used by every other
//! component.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;

use crate::model::{
    RecoveryStatus, RetryState, RunStatus, RuntimeContext, WorkflowAssetRecoveryRequest,
    WorkflowAssetStalePartition, WorkflowDefinition, WorkflowRun, WorkflowRunHistoryEvent, WorkflowRunStep,
    WorkflowRunStepAsset, WorkflowRunStepStatus, WorkflowSchedule,
};

/// Failure kinds a repository implementation can raise. `Conflict` covers
/// unique-constraint violations, most commonly a colliding `runKeyNormalized`
/// (see [`RepositoryError::is_run_key_conflict`]).
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("transient store failure: {0}")]
    Transient(String),
    #[error("fatal store failure: {0}")]
    Fatal(String),
}

impl RepositoryError {
    pub fn is_run_key_conflict(&self) -> bool {
        matches!(self, RepositoryError::Conflict(msg) if msg.contains("runKey"))
    }
}

pub type RepoResult<T> = Result<T, RepositoryError>;

#[derive(Debug, Clone, Default)]
pub struct CreateRunInput {
    pub parameters: Value,
    pub triggered_by: Option<String>,
    pub trigger: Option<Value>,
    pub partition_key: Option<String>,
    pub run_key: Option<String>,
}

/// Sparse patch applied to a [`WorkflowRun`] under a row lock. Fields
/// wrapped twice (`Option<Option<T>>`) distinguish "leave unchanged" from
/// "set to null".
#[derive(Debug, Clone, Default)]
pub struct RunPatch {
    pub status: Option<RunStatus>,
    pub context: Option<RuntimeContext>,
    pub output: Option<Option<Value>>,
    pub error_message: Option<Option<String>>,
    pub current_step_id: Option<Option<String>>,
    pub current_step_index: Option<Option<usize>>,
    pub completed_steps: Option<usize>,
    pub total_steps: Option<usize>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct RunStepPatch {
    pub status: Option<WorkflowRunStepStatus>,
    pub attempt: Option<u32>,
    pub retry_count: Option<u32>,
    pub retry_state: Option<RetryState>,
    pub next_attempt_at: Option<Option<DateTime<Utc>>>,
    pub retry_metadata: Option<Option<Value>>,
    pub job_run_id: Option<Option<String>>,
    pub input: Option<Option<Value>>,
    pub output: Option<Option<Value>>,
    pub error_message: Option<Option<String>>,
    pub failure_reason: Option<Option<String>>,
    pub metrics: Option<Option<Value>>,
    pub context: Option<Option<Value>>,
    pub started_at: Option<Option<DateTime<Utc>>>,
    pub completed_at: Option<Option<DateTime<Utc>>>,
    pub last_heartbeat_at: Option<Option<DateTime<Utc>>>,
    pub parent_step_id: Option<Option<String>>,
    pub fanout_index: Option<Option<usize>>,
    pub template_step_id: Option<Option<String>>,
}

#[derive(Debug, Clone)]
pub struct NewAsset {
    pub asset_id: String,
    pub payload: Value,
    pub schema: Option<Value>,
    pub freshness: Option<crate::model::Freshness>,
    pub partition_key: Option<String>,
    pub produced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct DueSchedulesQuery {
    pub limit: usize,
    pub now: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct EnsureRecoveryRequestInput {
    pub asset_id: String,
    pub partition_key: Option<String>,
    pub workflow_definition_id: String,
    pub requested_by_workflow_run_id: String,
    pub requested_by_workflow_run_step_id: String,
}

/// A lightweight record of a step that exhausted its retry budget,
/// supplemental dead-letter bookkeeping.
#[derive(Debug, Clone)]
pub struct FailedStepRecord {
    pub workflow_run_id: String,
    pub step_id: String,
    pub failure_reason: Option<String>,
    pub error_message: Option<String>,
    pub attempt: u32,
    pub recorded_at: DateTime<Utc>,
}

/// Summary of a registered external worker/service, kept warm by optional
/// heartbeats. These methods default to no-ops so an implementation can opt
/// in without changing the trait shape.
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    pub worker_id: String,
    pub last_heartbeat_at: DateTime<Utc>,
    pub metadata: Value,
}

#[async_trait]
pub trait RepositoryPort: Send + Sync + 'static {
    async fn create_definition(&self, definition: WorkflowDefinition) -> RepoResult<WorkflowDefinition>;
    async fn get_definition(&self, id: &str) -> RepoResult<WorkflowDefinition>;
    async fn get_definition_by_slug(&self, slug: &str) -> RepoResult<WorkflowDefinition>;
    /// Full-replace of asset declarations for a definition's steps, run
    /// inside the same transaction as a definition create/update.
    async fn replace_asset_declarations(&self, definition: &WorkflowDefinition) -> RepoResult<()>;

    async fn create_run(&self, definition_id: &str, input: CreateRunInput) -> RepoResult<WorkflowRun>;
    async fn get_run(&self, id: &str) -> RepoResult<WorkflowRun>;
    async fn update_run(&self, id: &str, patch: RunPatch) -> RepoResult<WorkflowRun>;
    async fn find_active_run_by_key(
        &self,
        definition_id: &str,
        run_key_normalized: &str,
    ) -> RepoResult<Option<WorkflowRun>>;

    async fn create_run_step(&self, run_id: &str, step_id: &str) -> RepoResult<WorkflowRunStep>;
    async fn get_run_step(&self, id: &str) -> RepoResult<WorkflowRunStep>;
    async fn get_run_step_by_step_id(&self, run_id: &str, step_id: &str) -> RepoResult<Option<WorkflowRunStep>>;
    async fn list_run_steps(&self, run_id: &str) -> RepoResult<Vec<WorkflowRunStep>>;
    async fn update_run_step(&self, id: &str, patch: RunStepPatch) -> RepoResult<WorkflowRunStep>;

    async fn record_step_assets(
        &self,
        definition_id: &str,
        run_id: &str,
        run_step_id: &str,
        step_id: &str,
        assets: Vec<NewAsset>,
    ) -> RepoResult<Vec<WorkflowRunStepAsset>>;
    async fn clear_stale_partition(
        &self,
        definition_id: &str,
        asset_id: &str,
        partition_key: Option<&str>,
    ) -> RepoResult<()>;
    async fn mark_stale_partition(&self, stale: WorkflowAssetStalePartition) -> RepoResult<()>;
    async fn find_asset_producer(&self, asset_id: &str) -> RepoResult<Option<String>>;

    async fn list_due_schedules(
        &self,
        query: DueSchedulesQuery,
    ) -> RepoResult<Vec<(WorkflowSchedule, WorkflowDefinition)>>;
    async fn create_schedule(&self, schedule: WorkflowSchedule) -> RepoResult<WorkflowSchedule>;
    async fn get_schedule(&self, id: &str) -> RepoResult<WorkflowSchedule>;
    /// Optimistic update keyed on the schedule's previously-read `updatedAt`;
    /// a mismatch surfaces as `RepositoryError::Conflict`.
    async fn update_schedule(
        &self,
        schedule: WorkflowSchedule,
        expected_updated_at: DateTime<Utc>,
    ) -> RepoResult<WorkflowSchedule>;

    async fn find_stale_run_steps(&self, cutoff: DateTime<Utc>, limit: usize) -> RepoResult<Vec<(String, String)>>;

    async fn ensure_recovery_request(
        &self,
        input: EnsureRecoveryRequestInput,
    ) -> RepoResult<(WorkflowAssetRecoveryRequest, bool)>;
    async fn get_recovery_request(&self, id: &str) -> RepoResult<WorkflowAssetRecoveryRequest>;
    async fn update_recovery_request_status(
        &self,
        id: &str,
        status: RecoveryStatus,
        recovery_workflow_run_id: Option<String>,
        last_error: Option<String>,
    ) -> RepoResult<WorkflowAssetRecoveryRequest>;

    async fn append_history(&self, event: WorkflowRunHistoryEvent) -> RepoResult<()>;
    async fn list_history(&self, run_id: &str) -> RepoResult<Vec<WorkflowRunHistoryEvent>>;

    async fn record_failed_step(&self, record: FailedStepRecord) -> RepoResult<()>;
    async fn list_failed_steps(&self, limit: usize) -> RepoResult<Vec<FailedStepRecord>>;

    async fn register_worker(&self, _info: WorkerInfo) -> RepoResult<()> {
        Ok(())
    }
    async fn worker_heartbeat(&self, _worker_id: &str) -> RepoResult<()> {
        Ok(())
    }
}
