//! Asset-recovery manager. When a job/service step fails with
//! `failureReason == "asset_missing"`, this module ensures a producer run
//! exists to materialize the missing asset partition, parks the consumer
//! step, and polls the recovery request until it settles.
//!
//! Idempotent-by-key run creation (`runKey` conflicts are swallowed, not
//! retried as errors) applied to a `asset-recovery:<assetId>:<partitionKey>`
//! key instead of a trigger-level one.

use chrono::Utc;
use serde_json::json;
use tracing::warn;

use crate::config::OrchestratorConfig;
use crate::model::{
    normalize_asset_id, normalize_partition_key, RecoveryStatus, RetryState, WorkflowRun, WorkflowRunStep,
    WorkflowRunStepStatus,
};
use crate::persistence::{CreateRunInput, EnsureRecoveryRequestInput, QueuePort, RepositoryPort, RunStepPatch};

#[derive(Debug)]
pub enum RecoveryPoll {
    StillPending,
    Ready,
    Failed(String),
}

/// Reads `retryMetadata.recovery.requestId` off a parked run-step, if
/// present, and checks whether that recovery request has settled. Returns
/// `None` when the step carries no pending recovery at all.
pub async fn poll_pending(repo: &dyn RepositoryPort, run_step: &WorkflowRunStep) -> Option<RecoveryPoll> {
    let request_id = run_step
        .retry_metadata
        .as_ref()
        .and_then(|v| v.get("recovery"))
        .and_then(|v| v.get("requestId"))
        .and_then(|v| v.as_str())?
        .to_string();

    match repo.get_recovery_request(&request_id).await {
        Ok(request) => Some(match request.status {
            RecoveryStatus::Succeeded => RecoveryPoll::Ready,
            RecoveryStatus::Failed => {
                RecoveryPoll::Failed(request.last_error.unwrap_or_else(|| "asset recovery failed".to_string()))
            }
            RecoveryStatus::Pending | RecoveryStatus::Running => RecoveryPoll::StillPending,
        }),
        Err(err) => {
            warn!(request_id = %request_id, error = %err, "recovery request lookup failed, treating as still pending");
            Some(RecoveryPoll::StillPending)
        }
    }
}

/// Ensures a recovery request (and, the first time, a producer run) exists
/// for `asset_id`/`partition_key`, then returns the patch that parks the
/// consumer step pending its resolution.
pub async fn ensure_recovery_and_park(
    repo: &dyn RepositoryPort,
    queue: &dyn QueuePort,
    config: &OrchestratorConfig,
    run: &WorkflowRun,
    run_step: &WorkflowRunStep,
    asset_id: &str,
    partition_key: Option<&str>,
) -> Result<RunStepPatch, String> {
    let producer_definition_id = repo
        .find_asset_producer(asset_id)
        .await
        .map_err(|e| e.to_string())?
        .ok_or_else(|| format!("no producer registered for asset {asset_id}"))?;

    let (request, created) = repo
        .ensure_recovery_request(EnsureRecoveryRequestInput {
            asset_id: asset_id.to_string(),
            partition_key: partition_key.map(String::from),
            workflow_definition_id: producer_definition_id.clone(),
            requested_by_workflow_run_id: run.id.clone(),
            requested_by_workflow_run_step_id: run_step.id.clone(),
        })
        .await
        .map_err(|e| e.to_string())?;

    if created {
        let partition_norm = normalize_partition_key(partition_key).unwrap_or_default();
        let run_key = format!("asset-recovery:{}:{partition_norm}", normalize_asset_id(asset_id));
        let parameters = match partition_key {
            Some(key) => json!({"partitionKey": key}),
            None => json!({}),
        };
        match repo
            .create_run(
                &producer_definition_id,
                CreateRunInput {
                    parameters,
                    triggered_by: Some("asset-recovery".to_string()),
                    trigger: Some(json!({"kind": "asset_recovery", "assetId": asset_id})),
                    partition_key: partition_key.map(String::from),
                    run_key: Some(run_key),
                },
            )
            .await
        {
            Ok(producer_run) => {
                let _ = repo
                    .update_recovery_request_status(&request.id, RecoveryStatus::Running, Some(producer_run.id.clone()), None)
                    .await;
                let _ = queue.enqueue_run(&producer_run.id, producer_run.run_key.as_deref()).await;
            }
            Err(err) if err.is_run_key_conflict() => {
                // A producer run for this asset/partition is already in flight; ride along.
            }
            Err(err) => return Err(err.to_string()),
        }
    }

    let next_attempt_at = Utc::now() + chrono::Duration::from_std(config.asset_recovery_poll_interval).unwrap_or_default();
    let _ = queue.schedule_retry(&run.id, next_attempt_at).await;

    Ok(RunStepPatch {
        status: Some(WorkflowRunStepStatus::Pending),
        retry_state: Some(RetryState::Scheduled),
        next_attempt_at: Some(Some(next_attempt_at)),
        retry_metadata: Some(Some(json!({
            "recovery": {
                "requestId": request.id,
                "assetId": asset_id,
                "partitionKey": partition_key,
                "checkedAt": Utc::now(),
            }
        }))),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemoryRepository;
    use crate::model::{AssetDeclaration, AssetDirection, JobStepDefinition, StepDefinition, WorkflowDefinition};

    async fn repo_with_producer() -> (InMemoryRepository, WorkflowDefinition) {
        let repo = InMemoryRepository::new();
        let mut produces = AssetDeclaration::new("inventory.dataset", AssetDirection::Produces);
        produces.auto_materialize = true;
        let steps = vec![StepDefinition::Job(JobStepDefinition {
            id: "produce".into(),
            job_slug: "produce-inventory".into(),
            produces: vec![produces],
            ..Default::default()
        })];
        let definition = WorkflowDefinition::new("producer-def".into(), "producer".into(), 1, steps);
        let created = repo.create_definition(definition).await.unwrap();
        repo.replace_asset_declarations(&created).await.unwrap();
        (repo, created)
    }

    #[tokio::test]
    async fn first_request_creates_a_producer_run_and_parks_the_step() {
        let (repo, definition) = repo_with_producer().await;
        let (queue, _rx) = crate::persistence::InlineQueue::new();
        let config = OrchestratorConfig::default();

        let consumer_def = WorkflowDefinition::new(
            "consumer-def".into(),
            "consumer".into(),
            1,
            vec![StepDefinition::Job(JobStepDefinition { id: "A".into(), job_slug: "consume".into(), ..Default::default() })],
        );
        let consumer_def = repo.create_definition(consumer_def).await.unwrap();
        let run = repo.create_run(&consumer_def.id, CreateRunInput::default()).await.unwrap();
        let run_step = repo.create_run_step(&run.id, "A").await.unwrap();

        let patch = ensure_recovery_and_park(&repo, &queue, &config, &run, &run_step, "inventory.dataset", None)
            .await
            .unwrap();
        assert_eq!(patch.status, Some(WorkflowRunStepStatus::Pending));
        assert!(patch.retry_metadata.is_some());

        let _ = definition;
    }
}
