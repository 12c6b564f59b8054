//! Job step executor: submits a job run through the [`JobRunner`] port,
//! persists produced assets on success, and on an `asset_missing` failure
//! delegates to the asset-recovery manager instead of a plain retry.
//!
//! Load-or-create state, dispatch, interpret terminal outcome: the same
//! activity-execution loop shape shared across this system's
//! job/service/fanout step kinds.

use std::collections::HashMap;

use chrono::Utc;
use serde_json::Value;
use tracing::warn;

use crate::activity::{
    build_scope, dependency_gate, get_or_create_run_step, handle_parameter_resolution_failure, hydrate_succeeded,
    is_already_succeeded, merge_parameters, prepare_parameters, terminal_failure_patch, FanoutMembership, StepDeps,
    StepError, StepExecutionResult,
};
use crate::assets::persist_produced_assets;
use crate::model::{
    JobStepDefinition, RetryState, RuntimeContext, StepDefinition, WorkflowDefinition, WorkflowRun, WorkflowRunStep,
    WorkflowRunStepStatus,
};
use crate::persistence::RunStepPatch;
use crate::recovery::{ensure_recovery_and_park, poll_pending, RecoveryPoll};
use crate::reliability::{calculate_retry_delay, compute_workflow_retry_timestamp, has_attempts_remaining};
use crate::worker::{BundleOverride, JobRunRequest, JobRunStatus};

pub async fn execute(
    deps: &StepDeps,
    definition: &WorkflowDefinition,
    run: &WorkflowRun,
    context: RuntimeContext,
    step: &JobStepDefinition,
    fan: Option<&FanoutMembership>,
) -> StepExecutionResult {
    let run_step = match get_or_create_run_step(deps.repo.as_ref(), &run.id, &step.id, fan).await {
        Ok(rs) => rs,
        Err(err) => return infra_failure(context, &step.id, err.to_string()),
    };

    if is_already_succeeded(&run_step) {
        return hydrate_succeeded(context, &run_step);
    }

    if let Err(err) = dependency_gate(&StepDefinition::Job(step.clone()), &context) {
        return infra_failure(context, &step.id, err.to_string());
    }

    if let Some(outcome) = poll_pending(deps.repo.as_ref(), &run_step).await {
        match outcome {
            RecoveryPoll::StillPending => {
                return StepExecutionResult {
                    context,
                    step_status: WorkflowRunStepStatus::Pending,
                    completed: false,
                    step_patch: RunStepPatch::default(),
                    shared_patch: None,
                    error_message: None,
                    fan_out: None,
                    scheduled_retry: run_step.next_attempt_at,
                };
            }
            RecoveryPoll::Failed(message) => {
                return terminal_job_failure(context, &step.id, message, "asset_recovery_failed");
            }
            RecoveryPoll::Ready => {
                // The producer settled; fall through and re-run the step.
            }
        }
    }

    let merged = merge_parameters(&run.parameters, step.parameters.as_ref());
    let scope = build_scope(run, &context, &merged, fan);
    let parameters = match prepare_parameters(&run.parameters, step.parameters.as_ref(), &scope) {
        Ok(v) => v,
        Err(StepError::ParameterResolutionFailed(summary)) => {
            return handle_parameter_resolution_failure(context, &step.id, summary);
        }
        Err(other) => return infra_failure(context, &step.id, other.to_string()),
    };

    let attempt = run_step.attempt;
    let max_attempts = step.retry_policy.as_ref().and_then(|p| p.max_attempts);

    if let Err(err) = deps
        .repo
        .update_run_step(
            &run_step.id,
            RunStepPatch {
                status: Some(WorkflowRunStepStatus::Running),
                started_at: Some(Some(Utc::now())),
                last_heartbeat_at: Some(Some(Utc::now())),
                input: Some(Some(parameters.clone())),
                ..Default::default()
            },
        )
        .await
    {
        return infra_failure(context, &step.id, err.to_string());
    }
    // Clear any assets a previous, now-superseded attempt produced.
    let _ = deps
        .repo
        .record_step_assets(&definition.id, &run.id, &run_step.id, &step.id, Vec::new())
        .await;

    let request = JobRunRequest {
        job_slug: step.job_slug.clone(),
        parameters: parameters.clone(),
        timeout_ms: step.timeout_ms,
        max_attempts,
        bundle: step.bundle.as_ref().map(|b| BundleOverride {
            slug: b.slug.clone(),
            version: b.version.clone(),
            export_name: b.export_name.clone(),
        }),
        workflow_run_id: run.id.clone(),
        run_step_id: run_step.id.clone(),
        step_id: step.id.clone(),
        attempt,
    };

    let job_run = match deps.job_runner.create_job_run_for_slug(request).await {
        Ok(jr) => jr,
        Err(err) => {
            return schedule_or_fail(deps, context, &run_step, step, attempt, err.to_string(), "job_execution_failed").await;
        }
    };
    let terminal = match deps.job_runner.execute_job_run(&job_run.id).await {
        Ok(jr) => jr,
        Err(err) => {
            return schedule_or_fail(deps, context, &run_step, step, attempt, err.to_string(), "job_execution_failed").await;
        }
    };

    match terminal.status {
        JobRunStatus::Succeeded => {
            let result = terminal.result.clone().unwrap_or(Value::Null);
            let produced = persist_produced_assets(
                deps.repo.as_ref(),
                deps.queue.as_ref(),
                deps.events.as_ref(),
                &definition.id,
                run,
                &run_step.id,
                &step.id,
                &step.produces,
                &result,
            )
            .await;

            let mut context = context;
            let entry = context.steps.entry(step.id.clone()).or_default();
            entry.status = Some(WorkflowRunStepStatus::Succeeded);
            entry.output = Some(result.clone());
            entry.error_message = None;
            entry.failure_reason = None;
            if let Ok(assets) = &produced {
                entry.assets = assets.iter().map(|a| serde_json::to_value(a).unwrap_or(Value::Null)).collect();
            }

            let mut shared_patch = None;
            if let Some(store_as) = &step.store_result_as {
                context.shared.insert(store_as.clone(), result.clone());
                let mut patch = HashMap::new();
                patch.insert(store_as.clone(), result.clone());
                shared_patch = Some(patch);
            }

            StepExecutionResult {
                context,
                step_status: WorkflowRunStepStatus::Succeeded,
                completed: true,
                step_patch: RunStepPatch {
                    status: Some(WorkflowRunStepStatus::Succeeded),
                    output: Some(Some(result)),
                    job_run_id: Some(Some(job_run.id.clone())),
                    retry_state: Some(RetryState::Completed),
                    completed_at: Some(Some(Utc::now())),
                    ..Default::default()
                },
                shared_patch,
                error_message: None,
                fan_out: None,
                scheduled_retry: None,
            }
        }
        JobRunStatus::Failed if terminal.failure_reason.as_deref() == Some("asset_missing") => {
            begin_asset_recovery(deps, context, run, &run_step, &terminal).await
        }
        _ => {
            let message = terminal.error_message.clone().unwrap_or_else(|| "job run failed".to_string());
            let reason = terminal.failure_reason.as_deref().unwrap_or("job_execution_failed").to_string();
            schedule_or_fail(deps, context, &run_step, step, attempt, message, &reason).await
        }
    }
}

async fn begin_asset_recovery(
    deps: &StepDeps,
    context: RuntimeContext,
    run: &WorkflowRun,
    run_step: &WorkflowRunStep,
    terminal: &crate::worker::JobRun,
) -> StepExecutionResult {
    let asset_id = terminal
        .result
        .as_ref()
        .and_then(|v| v.get("assetId"))
        .and_then(|v| v.as_str())
        .or_else(|| terminal.error_message.as_deref())
        .unwrap_or("")
        .to_string();
    let partition_key = terminal
        .result
        .as_ref()
        .and_then(|v| v.get("partitionKey"))
        .and_then(|v| v.as_str())
        .map(String::from);

    if asset_id.is_empty() {
        return terminal_job_failure(
            context,
            &run_step.step_id,
            "asset_missing failure did not name an assetId".to_string(),
            "asset_recovery_failed",
        );
    }

    match ensure_recovery_and_park(
        deps.repo.as_ref(),
        deps.queue.as_ref(),
        &deps.config,
        run,
        run_step,
        &asset_id,
        partition_key.as_deref(),
    )
    .await
    {
        Ok(patch) => StepExecutionResult {
            context,
            step_status: WorkflowRunStepStatus::Pending,
            completed: false,
            step_patch: patch,
            shared_patch: None,
            error_message: None,
            fan_out: None,
            scheduled_retry: None,
        },
        Err(message) => terminal_job_failure(context, &run_step.step_id, message, "asset_recovery_failed"),
    }
}

/// Schedules another attempt if the step's retry policy allows it,
/// otherwise records a terminal failure.
async fn schedule_or_fail(
    deps: &StepDeps,
    context: RuntimeContext,
    run_step: &WorkflowRunStep,
    step: &JobStepDefinition,
    attempt: u32,
    message: String,
    failure_reason: &str,
) -> StepExecutionResult {
    let policy = step.retry_policy.as_ref();
    if !has_attempts_remaining(attempt, policy) {
        return terminal_job_failure(context, &step.id, message, failure_reason);
    }

    let next_attempt = attempt + 1;
    let delay = policy.map(|p| calculate_retry_delay(next_attempt, p)).unwrap_or_default();
    let run_at = if delay.is_zero() {
        compute_workflow_retry_timestamp(next_attempt, policy, &deps.config.retry_config(), Utc::now())
    } else {
        Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default()
    };

    if let Err(err) = deps
        .repo
        .update_run_step(
            &run_step.id,
            RunStepPatch {
                status: Some(WorkflowRunStepStatus::Pending),
                attempt: Some(next_attempt),
                retry_state: Some(RetryState::Scheduled),
                next_attempt_at: Some(Some(run_at)),
                error_message: Some(Some(message.clone())),
                failure_reason: Some(Some(failure_reason.to_string())),
                job_run_id: Some(None),
                started_at: Some(None),
                completed_at: Some(None),
                last_heartbeat_at: Some(None),
                ..Default::default()
            },
        )
        .await
    {
        warn!(step_id = %step.id, error = %err, "failed to persist retry schedule");
    }
    if let Err(err) = deps.queue.schedule_retry(&run_step.workflow_run_id, run_at).await {
        warn!(step_id = %step.id, error = %err, "failed to enqueue scheduled retry");
    }

    StepExecutionResult {
        context,
        step_status: WorkflowRunStepStatus::Pending,
        completed: false,
        step_patch: RunStepPatch::default(),
        shared_patch: None,
        error_message: Some(message),
        fan_out: None,
        scheduled_retry: Some(run_at),
    }
}

fn terminal_job_failure(
    mut context: RuntimeContext,
    step_id: &str,
    message: String,
    failure_reason: &str,
) -> StepExecutionResult {
    let entry = context.steps.entry(step_id.to_string()).or_default();
    entry.status = Some(WorkflowRunStepStatus::Failed);
    entry.error_message = Some(message.clone());
    entry.failure_reason = Some(failure_reason.to_string());

    StepExecutionResult {
        context,
        step_status: WorkflowRunStepStatus::Failed,
        completed: true,
        step_patch: terminal_failure_patch(message.clone(), failure_reason),
        shared_patch: None,
        error_message: Some(message),
        fan_out: None,
        scheduled_retry: None,
    }
}

fn infra_failure(context: RuntimeContext, step_id: &str, message: String) -> StepExecutionResult {
    terminal_job_failure(context, step_id, message, "internal_error")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::events::NullEventSink;
    use crate::persistence::{InMemoryRepository, InlineQueue};
    use crate::secrets::NullSecretStore;
    use crate::services::{ServiceDescriptor, ServiceError, ServiceRegistry, ServiceRequest, ServiceResponse};
    use crate::worker::{InProcessJobRunner, JobRunnerConfig};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;

    struct NoServices;

    #[async_trait]
    impl ServiceRegistry for NoServices {
        async fn get_service_by_slug(&self, _slug: &str) -> Option<ServiceDescriptor> {
            None
        }
        async fn fetch_from_service(
            &self,
            _service: &ServiceDescriptor,
            _request: ServiceRequest,
        ) -> Result<ServiceResponse, ServiceError> {
            Err(ServiceError::NotFound("unused".into()))
        }
    }

    async fn deps_with_handler() -> (StepDeps, Arc<InProcessJobRunner>) {
        let repo: Arc<dyn crate::persistence::RepositoryPort> = Arc::new(InMemoryRepository::new());
        let (queue, _rx) = InlineQueue::new();
        let runner = Arc::new(InProcessJobRunner::new(JobRunnerConfig::default()));
        runner.register_handler("echo", |_ctx, params| async move { Ok(params) });
        let deps = StepDeps {
            repo,
            queue: Arc::new(queue),
            job_runner: runner.clone(),
            services: Arc::new(NoServices),
            secrets: Arc::new(NullSecretStore),
            events: Arc::new(NullEventSink),
            config: OrchestratorConfig::default(),
        };
        (deps, runner)
    }

    #[tokio::test]
    async fn successful_job_marks_step_succeeded_and_stores_result() {
        let (deps, _runner) = deps_with_handler().await;
        let definition = WorkflowDefinition::new(
            "def-1".into(),
            "slug".into(),
            1,
            vec![StepDefinition::Job(JobStepDefinition {
                id: "A".into(),
                job_slug: "echo".into(),
                store_result_as: Some("echoed".into()),
                ..Default::default()
            })],
        );
        deps.repo.create_definition(definition.clone()).await.unwrap();
        let run = deps
            .repo
            .create_run(&definition.id, crate::persistence::CreateRunInput { parameters: json!({"x": 1}), ..Default::default() })
            .await
            .unwrap();

        let step = JobStepDefinition {
            id: "A".into(),
            job_slug: "echo".into(),
            parameters: Some(json!({"x": "{{ parameters.x }}"})),
            store_result_as: Some("echoed".into()),
            ..Default::default()
        };
        let result = execute(&deps, &definition, &run, RuntimeContext::default(), &step, None).await;
        assert_eq!(result.step_status, WorkflowRunStepStatus::Succeeded);
        assert!(result.completed);
        assert_eq!(result.context.shared.get("echoed"), Some(&json!({"x": 1})));
    }

    #[tokio::test]
    async fn unknown_slug_schedules_a_retry_when_attempts_remain() {
        let (deps, _runner) = deps_with_handler().await;
        let definition = WorkflowDefinition::new("def-1".into(), "slug".into(), 1, vec![]);
        deps.repo.create_definition(definition.clone()).await.unwrap();
        let run = deps.repo.create_run(&definition.id, Default::default()).await.unwrap();

        let step = JobStepDefinition {
            id: "A".into(),
            job_slug: "missing-handler".into(),
            retry_policy: Some(crate::model::StepRetryPolicy {
                max_attempts: Some(3),
                ..Default::default()
            }),
            ..Default::default()
        };
        let result = execute(&deps, &definition, &run, RuntimeContext::default(), &step, None).await;
        assert!(!result.completed);
        assert_eq!(result.step_status, WorkflowRunStepStatus::Pending);
    }
}
