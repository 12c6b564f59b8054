//! In-memory `RepositoryPort`, used by unit/integration tests and any
//! deployment happy to trade durability for zero external dependencies.
//! A handful of `parking_lot::RwLock<HashMap<...>>` tables guarded
//! independently (no cross-table transaction needed since everything
//! lives in one process).

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use super::store::*;
use crate::model::{
    normalize_asset_id, normalize_partition_key, RecoveryStatus, RunStatus, WorkflowAssetRecoveryRequest,
    WorkflowAssetStalePartition, WorkflowDefinition, WorkflowRun, WorkflowRunHistoryEvent, WorkflowRunStep,
    WorkflowRunStepAsset, WorkflowSchedule,
};

#[derive(Default)]
pub struct InMemoryRepository {
    definitions: RwLock<HashMap<String, WorkflowDefinition>>,
    definitions_by_slug: RwLock<HashMap<String, String>>,
    runs: RwLock<HashMap<String, WorkflowRun>>,
    run_keys: RwLock<HashMap<(String, String), String>>,
    run_steps: RwLock<HashMap<String, WorkflowRunStep>>,
    run_steps_by_step: RwLock<HashMap<(String, String), String>>,
    assets: RwLock<HashMap<String, Vec<WorkflowRunStepAsset>>>,
    stale_partitions: RwLock<HashMap<(String, String, String), WorkflowAssetStalePartition>>,
    asset_producers: RwLock<HashMap<String, String>>,
    schedules: RwLock<HashMap<String, WorkflowSchedule>>,
    recovery_requests: RwLock<HashMap<String, WorkflowAssetRecoveryRequest>>,
    recovery_by_key: RwLock<HashMap<(String, String), String>>,
    history: RwLock<HashMap<String, Vec<WorkflowRunHistoryEvent>>>,
    failed_steps: RwLock<Vec<FailedStepRecord>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn new_id() -> String {
        Uuid::now_v7().to_string()
    }
}

#[async_trait]
impl RepositoryPort for InMemoryRepository {
    async fn create_definition(&self, definition: WorkflowDefinition) -> RepoResult<WorkflowDefinition> {
        self.definitions_by_slug.write().insert(definition.slug.clone(), definition.id.clone());
        self.definitions.write().insert(definition.id.clone(), definition.clone());
        Ok(definition)
    }

    async fn get_definition(&self, id: &str) -> RepoResult<WorkflowDefinition> {
        self.definitions
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(format!("definition {id}")))
    }

    async fn get_definition_by_slug(&self, slug: &str) -> RepoResult<WorkflowDefinition> {
        let id = self
            .definitions_by_slug
            .read()
            .get(slug)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(format!("definition slug {slug}")))?;
        self.get_definition(&id).await
    }

    async fn replace_asset_declarations(&self, definition: &WorkflowDefinition) -> RepoResult<()> {
        let mut producers = self.asset_producers.write();
        for step in &definition.steps {
            for decl in step.produces() {
                producers.insert(decl.asset_id_normalized(), definition.id.clone());
            }
        }
        Ok(())
    }

    async fn create_run(&self, definition_id: &str, input: CreateRunInput) -> RepoResult<WorkflowRun> {
        let run_key_normalized = input.run_key.as_deref().map(|k| k.trim().to_ascii_lowercase());
        if let Some(ref key) = run_key_normalized {
            if self.find_active_run_by_key(definition_id, key).await?.is_some() {
                return Err(RepositoryError::Conflict(format!(
                    "runKey conflict for definition {definition_id}: {key}"
                )));
            }
        }
        let mut run = WorkflowRun::new(Self::new_id(), definition_id.to_string(), input.parameters);
        run.triggered_by = input.triggered_by;
        run.trigger = input.trigger;
        run.partition_key = input.partition_key;
        run.run_key = input.run_key;
        run.run_key_normalized = run_key_normalized.clone();

        if let Some(key) = run_key_normalized {
            self.run_keys.write().insert((definition_id.to_string(), key), run.id.clone());
        }
        self.runs.write().insert(run.id.clone(), run.clone());
        Ok(run)
    }

    async fn get_run(&self, id: &str) -> RepoResult<WorkflowRun> {
        self.runs.read().get(id).cloned().ok_or_else(|| RepositoryError::NotFound(format!("run {id}")))
    }

    async fn update_run(&self, id: &str, patch: RunPatch) -> RepoResult<WorkflowRun> {
        let mut runs = self.runs.write();
        let run = runs.get_mut(id).ok_or_else(|| RepositoryError::NotFound(format!("run {id}")))?;
        if let Some(status) = patch.status {
            run.status = status;
        }
        if let Some(ctx) = patch.context {
            run.context = ctx;
        }
        if let Some(output) = patch.output {
            run.output = output;
        }
        if let Some(msg) = patch.error_message {
            run.error_message = msg;
        }
        if let Some(step_id) = patch.current_step_id {
            run.current_step_id = step_id;
        }
        if let Some(idx) = patch.current_step_index {
            run.current_step_index = idx;
        }
        if let Some(completed) = patch.completed_steps {
            run.metrics.completed_steps = completed;
        }
        if let Some(total) = patch.total_steps {
            run.metrics.total_steps = total;
        }
        if let Some(started_at) = patch.started_at {
            run.started_at = Some(started_at);
        }
        if let Some(completed_at) = patch.completed_at {
            run.completed_at = Some(completed_at);
            if let Some(started_at) = run.started_at {
                run.duration_ms = Some((completed_at - started_at).num_milliseconds().max(0));
            }
        }
        Ok(run.clone())
    }

    async fn find_active_run_by_key(
        &self,
        definition_id: &str,
        run_key_normalized: &str,
    ) -> RepoResult<Option<WorkflowRun>> {
        let id = self.run_keys.read().get(&(definition_id.to_string(), run_key_normalized.to_string())).cloned();
        match id {
            Some(id) => {
                let run = self.get_run(&id).await?;
                if run.status.is_terminal() {
                    Ok(None)
                } else {
                    Ok(Some(run))
                }
            }
            None => Ok(None),
        }
    }

    async fn create_run_step(&self, run_id: &str, step_id: &str) -> RepoResult<WorkflowRunStep> {
        let step = WorkflowRunStep::new(Self::new_id(), run_id.to_string(), step_id.to_string());
        self.run_steps_by_step
            .write()
            .insert((run_id.to_string(), step_id.to_string()), step.id.clone());
        self.run_steps.write().insert(step.id.clone(), step.clone());
        Ok(step)
    }

    async fn get_run_step(&self, id: &str) -> RepoResult<WorkflowRunStep> {
        self.run_steps.read().get(id).cloned().ok_or_else(|| RepositoryError::NotFound(format!("run step {id}")))
    }

    async fn get_run_step_by_step_id(&self, run_id: &str, step_id: &str) -> RepoResult<Option<WorkflowRunStep>> {
        let id = self.run_steps_by_step.read().get(&(run_id.to_string(), step_id.to_string())).cloned();
        match id {
            Some(id) => Ok(Some(self.get_run_step(&id).await?)),
            None => Ok(None),
        }
    }

    async fn list_run_steps(&self, run_id: &str) -> RepoResult<Vec<WorkflowRunStep>> {
        Ok(self.run_steps.read().values().filter(|s| s.workflow_run_id == run_id).cloned().collect())
    }

    async fn update_run_step(&self, id: &str, patch: RunStepPatch) -> RepoResult<WorkflowRunStep> {
        let mut steps = self.run_steps.write();
        let step = steps.get_mut(id).ok_or_else(|| RepositoryError::NotFound(format!("run step {id}")))?;
        if let Some(status) = patch.status {
            step.status = status;
        }
        if let Some(attempt) = patch.attempt {
            step.attempt = attempt;
        }
        if let Some(retry_count) = patch.retry_count {
            step.retry_count = retry_count;
        }
        if let Some(retry_state) = patch.retry_state {
            step.retry_state = retry_state;
        }
        if let Some(next_attempt_at) = patch.next_attempt_at {
            step.next_attempt_at = next_attempt_at;
        }
        if let Some(metadata) = patch.retry_metadata {
            step.retry_metadata = metadata;
        }
        if let Some(job_run_id) = patch.job_run_id {
            step.job_run_id = job_run_id;
        }
        if let Some(input) = patch.input {
            step.input = input;
        }
        if let Some(output) = patch.output {
            step.output = output;
        }
        if let Some(msg) = patch.error_message {
            step.error_message = msg;
        }
        if let Some(reason) = patch.failure_reason {
            step.failure_reason = reason;
        }
        if let Some(metrics) = patch.metrics {
            step.metrics = metrics;
        }
        if let Some(context) = patch.context {
            step.context = context;
        }
        if let Some(started_at) = patch.started_at {
            step.started_at = started_at;
        }
        if let Some(completed_at) = patch.completed_at {
            step.completed_at = completed_at;
        }
        if let Some(heartbeat) = patch.last_heartbeat_at {
            step.last_heartbeat_at = heartbeat;
        }
        if let Some(parent_step_id) = patch.parent_step_id {
            step.parent_step_id = parent_step_id;
        }
        if let Some(fanout_index) = patch.fanout_index {
            step.fanout_index = fanout_index;
        }
        if let Some(template_step_id) = patch.template_step_id {
            step.template_step_id = template_step_id;
        }
        Ok(step.clone())
    }

    async fn record_step_assets(
        &self,
        definition_id: &str,
        run_id: &str,
        run_step_id: &str,
        step_id: &str,
        assets: Vec<NewAsset>,
    ) -> RepoResult<Vec<WorkflowRunStepAsset>> {
        let rows: Vec<WorkflowRunStepAsset> = assets
            .into_iter()
            .map(|a| WorkflowRunStepAsset {
                id: Self::new_id(),
                workflow_definition_id: definition_id.to_string(),
                workflow_run_id: run_id.to_string(),
                workflow_run_step_id: run_step_id.to_string(),
                step_id: step_id.to_string(),
                asset_id: a.asset_id,
                payload: a.payload,
                schema: a.schema,
                freshness: a.freshness,
                partition_key: a.partition_key,
                produced_at: a.produced_at,
            })
            .collect();
        self.assets.write().insert(run_step_id.to_string(), rows.clone());
        Ok(rows)
    }

    async fn clear_stale_partition(
        &self,
        definition_id: &str,
        asset_id: &str,
        partition_key: Option<&str>,
    ) -> RepoResult<()> {
        let key = (
            definition_id.to_string(),
            normalize_asset_id(asset_id),
            normalize_partition_key(partition_key).unwrap_or_default(),
        );
        self.stale_partitions.write().remove(&key);
        Ok(())
    }

    async fn mark_stale_partition(&self, stale: WorkflowAssetStalePartition) -> RepoResult<()> {
        let key = (
            stale.workflow_definition_id.clone(),
            stale.asset_id.clone(),
            stale.partition_key_normalized.clone(),
        );
        self.stale_partitions.write().insert(key, stale);
        Ok(())
    }

    async fn find_asset_producer(&self, asset_id: &str) -> RepoResult<Option<String>> {
        Ok(self.asset_producers.read().get(&normalize_asset_id(asset_id)).cloned())
    }

    async fn list_due_schedules(
        &self,
        query: DueSchedulesQuery,
    ) -> RepoResult<Vec<(WorkflowSchedule, WorkflowDefinition)>> {
        let now = query.now.unwrap_or_else(Utc::now);
        let schedules = self.schedules.read();
        let mut due: Vec<WorkflowSchedule> = schedules
            .values()
            .filter(|s| s.is_active && s.next_run_at.map(|t| t <= now).unwrap_or(false))
            .cloned()
            .collect();
        due.sort_by_key(|s| s.next_run_at);
        due.truncate(query.limit.max(1));
        let mut out = Vec::with_capacity(due.len());
        for schedule in due {
            let definition = self.get_definition(&schedule.workflow_definition_id).await?;
            out.push((schedule, definition));
        }
        Ok(out)
    }

    async fn create_schedule(&self, schedule: WorkflowSchedule) -> RepoResult<WorkflowSchedule> {
        self.schedules.write().insert(schedule.id.clone(), schedule.clone());
        Ok(schedule)
    }

    async fn get_schedule(&self, id: &str) -> RepoResult<WorkflowSchedule> {
        self.schedules.read().get(id).cloned().ok_or_else(|| RepositoryError::NotFound(format!("schedule {id}")))
    }

    async fn update_schedule(
        &self,
        schedule: WorkflowSchedule,
        expected_updated_at: chrono::DateTime<Utc>,
    ) -> RepoResult<WorkflowSchedule> {
        let mut schedules = self.schedules.write();
        let existing = schedules
            .get(&schedule.id)
            .ok_or_else(|| RepositoryError::NotFound(format!("schedule {}", schedule.id)))?;
        if existing.updated_at != expected_updated_at {
            return Err(RepositoryError::Conflict(format!("schedule {} metadata changed concurrently", schedule.id)));
        }
        schedules.insert(schedule.id.clone(), schedule.clone());
        Ok(schedule)
    }

    async fn find_stale_run_steps(&self, cutoff: chrono::DateTime<Utc>, limit: usize) -> RepoResult<Vec<(String, String)>> {
        use crate::model::{RunStatus as RS, WorkflowRunStepStatus as Status};
        let runs = self.runs.read();
        let mut out = Vec::new();
        for step in self.run_steps.read().values() {
            if step.status != Status::Running {
                continue;
            }
            let Some(run) = runs.get(&step.workflow_run_id) else { continue };
            if run.status != RS::Running {
                continue;
            }
            let heartbeat = step.last_heartbeat_at.or(step.started_at);
            if heartbeat.map(|h| h < cutoff).unwrap_or(false) {
                out.push((step.workflow_run_id.clone(), step.step_id.clone()));
                if out.len() >= limit {
                    break;
                }
            }
        }
        Ok(out)
    }

    async fn ensure_recovery_request(
        &self,
        input: EnsureRecoveryRequestInput,
    ) -> RepoResult<(WorkflowAssetRecoveryRequest, bool)> {
        let partition_key_normalized = normalize_partition_key(input.partition_key.as_deref()).unwrap_or_default();
        let asset_id_normalized = normalize_asset_id(&input.asset_id);
        let key = (asset_id_normalized.clone(), partition_key_normalized.clone());
        if let Some(existing_id) = self.recovery_by_key.read().get(&key).cloned() {
            let existing = self.recovery_requests.read().get(&existing_id).cloned().unwrap();
            if matches!(existing.status, RecoveryStatus::Pending | RecoveryStatus::Running) {
                return Ok((existing, false));
            }
        }
        let request = WorkflowAssetRecoveryRequest {
            id: Self::new_id(),
            asset_id: input.asset_id,
            partition_key_normalized,
            workflow_definition_id: input.workflow_definition_id,
            status: RecoveryStatus::Pending,
            recovery_workflow_run_id: None,
            requested_by_workflow_run_id: input.requested_by_workflow_run_id,
            requested_by_workflow_run_step_id: input.requested_by_workflow_run_step_id,
            attempts: 0,
            last_attempt_at: None,
            last_error: None,
            metadata: serde_json::Value::Null,
            completed_at: None,
        };
        self.recovery_by_key.write().insert(key, request.id.clone());
        self.recovery_requests.write().insert(request.id.clone(), request.clone());
        Ok((request, true))
    }

    async fn get_recovery_request(&self, id: &str) -> RepoResult<WorkflowAssetRecoveryRequest> {
        self.recovery_requests
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(format!("recovery request {id}")))
    }

    async fn update_recovery_request_status(
        &self,
        id: &str,
        status: RecoveryStatus,
        recovery_workflow_run_id: Option<String>,
        last_error: Option<String>,
    ) -> RepoResult<WorkflowAssetRecoveryRequest> {
        let mut requests = self.recovery_requests.write();
        let request = requests.get_mut(id).ok_or_else(|| RepositoryError::NotFound(format!("recovery request {id}")))?;
        request.status = status;
        request.attempts += 1;
        request.last_attempt_at = Some(Utc::now());
        if recovery_workflow_run_id.is_some() {
            request.recovery_workflow_run_id = recovery_workflow_run_id;
        }
        request.last_error = last_error;
        if matches!(status, RecoveryStatus::Succeeded | RecoveryStatus::Failed) {
            request.completed_at = Some(Utc::now());
        }
        Ok(request.clone())
    }

    async fn append_history(&self, event: WorkflowRunHistoryEvent) -> RepoResult<()> {
        self.history.write().entry(event.workflow_run_id().to_string()).or_default().push(event);
        Ok(())
    }

    async fn list_history(&self, run_id: &str) -> RepoResult<Vec<WorkflowRunHistoryEvent>> {
        Ok(self.history.read().get(run_id).cloned().unwrap_or_default())
    }

    async fn record_failed_step(&self, record: FailedStepRecord) -> RepoResult<()> {
        self.failed_steps.write().push(record);
        Ok(())
    }

    async fn list_failed_steps(&self, limit: usize) -> RepoResult<Vec<FailedStepRecord>> {
        let steps = self.failed_steps.read();
        Ok(steps.iter().rev().take(limit).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Dag;
    use serde_json::json;

    fn sample_definition() -> WorkflowDefinition {
        WorkflowDefinition {
            id: "def-1".into(),
            slug: "sample".into(),
            version: 1,
            steps: vec![],
            triggers: vec![],
            parameters_schema: None,
            default_parameters: json!({}),
            metadata: json!({}),
            dag: Dag::default(),
        }
    }

    #[tokio::test]
    async fn run_key_conflict_rejected_while_active() {
        let repo = InMemoryRepository::new();
        repo.create_definition(sample_definition()).await.unwrap();
        let input = CreateRunInput { run_key: Some("k".into()), ..Default::default() };
        repo.create_run("def-1", input.clone()).await.unwrap();
        let err = repo.create_run("def-1", input).await.unwrap_err();
        assert!(err.is_run_key_conflict());
    }

    #[tokio::test]
    async fn run_key_available_again_once_terminal() {
        let repo = InMemoryRepository::new();
        repo.create_definition(sample_definition()).await.unwrap();
        let input = CreateRunInput { run_key: Some("k".into()), ..Default::default() };
        let run = repo.create_run("def-1", input.clone()).await.unwrap();
        repo.update_run(&run.id, RunPatch { status: Some(RunStatus::Succeeded), ..Default::default() })
            .await
            .unwrap();
        assert!(repo.create_run("def-1", input).await.is_ok());
    }

    #[tokio::test]
    async fn recovery_request_reused_while_active() {
        let repo = InMemoryRepository::new();
        let input = EnsureRecoveryRequestInput {
            asset_id: "inventory.dataset".into(),
            partition_key: None,
            workflow_definition_id: "producer".into(),
            requested_by_workflow_run_id: "run-1".into(),
            requested_by_workflow_run_step_id: "step-1".into(),
        };
        let (first, created) = repo.ensure_recovery_request(input.clone()).await.unwrap();
        assert!(created);
        let (second, created_again) = repo.ensure_recovery_request(input).await.unwrap();
        assert!(!created_again);
        assert_eq!(first.id, second.id);
    }
}
