//! Fan-out step executor: resolves `collection` to an array, clamps it
//! to the configured item/concurrency caps, and materializes one child
//! `StepDefinition` per item. The orchestrator owns actually running the
//! children — this module only produces the [`FanOutExpansion`] describing
//! them, matching `completed=false` for fan-out parents.
//!
//! Grounded on [`FanOutTemplate::instantiate`] for child id/name derivation
//! and on the load-or-create/dependency-gate/kind-specific-work shape shared
//! with [`crate::activity::job`].

use chrono::Utc;
use serde_json::Value;

use crate::activity::{
    build_scope, dependency_gate, get_or_create_run_step, handle_parameter_resolution_failure, hydrate_succeeded,
    is_already_succeeded, FanOutExpansion, FanoutMembership, StepDeps, StepExecutionResult,
};
use crate::model::{FanOutStepDefinition, RuntimeContext, StepDefinition, WorkflowDefinition, WorkflowRun, WorkflowRunStepStatus};
use crate::persistence::RunStepPatch;
use crate::template::{resolve_string, ResolutionTracker, TemplateScope};

pub async fn execute(
    deps: &StepDeps,
    _definition: &WorkflowDefinition,
    run: &WorkflowRun,
    context: RuntimeContext,
    step: &FanOutStepDefinition,
    fan: Option<&FanoutMembership>,
) -> StepExecutionResult {
    let run_step = match get_or_create_run_step(deps.repo.as_ref(), &run.id, &step.id, fan).await {
        Ok(rs) => rs,
        Err(err) => return terminal_failure(context, &step.id, err.to_string()),
    };

    if is_already_succeeded(&run_step) {
        return hydrate_succeeded(context, &run_step);
    }

    if let Err(err) = dependency_gate(&StepDefinition::Fanout(step.clone()), &context) {
        return terminal_failure(context, &step.id, err.to_string());
    }

    let scope: TemplateScope = build_scope(run, &context, &run.parameters, fan);
    let mut tracker = ResolutionTracker::default();
    let resolved = resolve_string(&step.collection, &scope, &mut tracker);
    if tracker.has_issues() {
        let summary = tracker
            .issues
            .iter()
            .map(|issue| format!("{}: {}", issue.path, issue.expression))
            .collect::<Vec<_>>()
            .join("; ");
        return handle_parameter_resolution_failure(context, &step.id, summary);
    }

    let Value::Array(items) = resolved else {
        return terminal_failure(context, &step.id, "Fan-out collection must resolve to an array".to_string());
    };

    let requested = step.max_items.unwrap_or(deps.config.fanout_max_items);
    let item_cap = requested.min(deps.config.fanout_max_items);
    if items.len() > item_cap {
        return terminal_failure(
            context,
            &step.id,
            format!(
                "Fan-out collection has {} items, exceeding the limit of {item_cap}",
                items.len()
            ),
        );
    }

    if items.is_empty() {
        return empty_collection_success(deps, context, &run_step.id, step).await;
    }

    let requested_concurrency = step.max_concurrency.unwrap_or(deps.config.fanout_max_concurrency);
    let max_concurrency = requested_concurrency.min(items.len()).min(deps.config.fanout_max_concurrency).max(1);

    let children: Vec<StepDefinition> =
        items.iter().enumerate().map(|(i, _)| step.template.instantiate(&step.id, i)).collect();

    if let Err(err) = deps
        .repo
        .update_run_step(
            &run_step.id,
            RunStepPatch {
                status: Some(WorkflowRunStepStatus::Running),
                started_at: Some(Some(Utc::now())),
                last_heartbeat_at: Some(Some(Utc::now())),
                ..Default::default()
            },
        )
        .await
    {
        return terminal_failure(context, &step.id, err.to_string());
    }

    let mut context = context;
    let entry = context.steps.entry(step.id.clone()).or_default();
    entry.status = Some(WorkflowRunStepStatus::Running);

    let mut shared_patch = None;
    if let Some(store_as) = &step.store_results_as {
        context.shared.insert(store_as.clone(), Value::Array(Vec::new()));
        let mut patch = std::collections::HashMap::new();
        patch.insert(store_as.clone(), Value::Array(Vec::new()));
        shared_patch = Some(patch);
    }

    StepExecutionResult {
        context,
        step_status: WorkflowRunStepStatus::Running,
        completed: false,
        step_patch: RunStepPatch::default(),
        shared_patch,
        error_message: None,
        fan_out: Some(FanOutExpansion {
            children,
            items,
            max_concurrency,
            store_results_as: step.store_results_as.clone(),
            parent_run_step_id: run_step.id.clone(),
        }),
        scheduled_retry: None,
    }
}

/// A size-0 collection settles the parent immediately: succeeded, with an
/// empty aggregate stored under `storeResultsAs` if declared.
async fn empty_collection_success(
    deps: &StepDeps,
    context: RuntimeContext,
    run_step_id: &str,
    step: &FanOutStepDefinition,
) -> StepExecutionResult {
    if let Err(err) = deps
        .repo
        .update_run_step(
            run_step_id,
            RunStepPatch {
                status: Some(WorkflowRunStepStatus::Succeeded),
                started_at: Some(Some(Utc::now())),
                completed_at: Some(Some(Utc::now())),
                output: Some(Some(Value::Array(Vec::new()))),
                ..Default::default()
            },
        )
        .await
    {
        return terminal_failure(context, &step.id, err.to_string());
    }

    let mut context = context;
    let entry = context.steps.entry(step.id.clone()).or_default();
    entry.status = Some(WorkflowRunStepStatus::Succeeded);
    entry.output = Some(Value::Array(Vec::new()));

    let mut shared_patch = None;
    if let Some(store_as) = &step.store_results_as {
        context.shared.insert(store_as.clone(), Value::Array(Vec::new()));
        let mut patch = std::collections::HashMap::new();
        patch.insert(store_as.clone(), Value::Array(Vec::new()));
        shared_patch = Some(patch);
    }

    StepExecutionResult {
        context,
        step_status: WorkflowRunStepStatus::Succeeded,
        completed: true,
        step_patch: RunStepPatch {
            status: Some(WorkflowRunStepStatus::Succeeded),
            output: Some(Some(Value::Array(Vec::new()))),
            completed_at: Some(Some(Utc::now())),
            ..Default::default()
        },
        shared_patch,
        error_message: None,
        fan_out: None,
        scheduled_retry: None,
    }
}

fn terminal_failure(mut context: RuntimeContext, step_id: &str, message: String) -> StepExecutionResult {
    let entry = context.steps.entry(step_id.to_string()).or_default();
    entry.status = Some(WorkflowRunStepStatus::Failed);
    entry.error_message = Some(message.clone());
    entry.failure_reason = Some("fanout_expansion_failed".to_string());

    StepExecutionResult {
        context,
        step_status: WorkflowRunStepStatus::Failed,
        completed: true,
        step_patch: RunStepPatch {
            status: Some(WorkflowRunStepStatus::Failed),
            error_message: Some(Some(message.clone())),
            failure_reason: Some(Some("fanout_expansion_failed".to_string())),
            completed_at: Some(Some(Utc::now())),
            ..Default::default()
        },
        shared_patch: None,
        error_message: Some(message),
        fan_out: None,
        scheduled_retry: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::events::NullEventSink;
    use crate::model::{FanOutTemplate, JobStepDefinition, WorkflowDefinition};
    use crate::persistence::{CreateRunInput, InMemoryRepository, InlineQueue};
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

    async fn deps() -> StepDeps {
        let repo: Arc<dyn crate::persistence::RepositoryPort> = Arc::new(InMemoryRepository::new());
        let (queue, _rx) = InlineQueue::new();
        StepDeps {
            repo,
            queue: Arc::new(queue),
            job_runner: Arc::new(InProcessJobRunner::new(JobRunnerConfig::default())),
            services: Arc::new(NoServices),
            secrets: Arc::new(NullSecretStore),
            events: Arc::new(NullEventSink),
            config: OrchestratorConfig::default(),
        }
    }

    fn template() -> FanOutTemplate {
        FanOutTemplate::Job(JobStepDefinition { id: "compute".into(), job_slug: "compute".into(), ..Default::default() })
    }

    #[tokio::test]
    async fn non_array_collection_fails() {
        let deps = deps().await;
        let definition = WorkflowDefinition::new("def".into(), "slug".into(), 1, vec![]);
        deps.repo.create_definition(definition.clone()).await.unwrap();
        let run = deps.repo.create_run(&definition.id, CreateRunInput { parameters: json!({"items": 3}), ..Default::default() }).await.unwrap();
        let step = FanOutStepDefinition {
            id: "Parent".into(),
            collection: "{{ parameters.items }}".into(),
            template: template(),
            max_items: None,
            max_concurrency: None,
            store_results_as: None,
            depends_on: vec![],
            produces: vec![],
        };
        let result = execute(&deps, &definition, &run, RuntimeContext::default(), &step, None).await;
        assert_eq!(result.step_status, WorkflowRunStepStatus::Failed);
        assert!(result.error_message.unwrap().contains("must resolve to an array"));
    }

    #[tokio::test]
    async fn empty_collection_succeeds_immediately() {
        let deps = deps().await;
        let definition = WorkflowDefinition::new("def".into(), "slug".into(), 1, vec![]);
        deps.repo.create_definition(definition.clone()).await.unwrap();
        let run = deps.repo.create_run(&definition.id, CreateRunInput { parameters: json!({"items": []}), ..Default::default() }).await.unwrap();
        let step = FanOutStepDefinition {
            id: "Parent".into(),
            collection: "{{ parameters.items }}".into(),
            template: template(),
            max_items: None,
            max_concurrency: None,
            store_results_as: Some("results".into()),
            depends_on: vec![],
            produces: vec![],
        };
        let result = execute(&deps, &definition, &run, RuntimeContext::default(), &step, None).await;
        assert!(result.completed);
        assert_eq!(result.step_status, WorkflowRunStepStatus::Succeeded);
        assert_eq!(result.context.shared.get("results"), Some(&json!([])));
    }

    #[tokio::test]
    async fn oversized_collection_fails_with_limit_message() {
        let deps = deps().await;
        let definition = WorkflowDefinition::new("def".into(), "slug".into(), 1, vec![]);
        deps.repo.create_definition(definition.clone()).await.unwrap();
        let items: Vec<i32> = (0..5).collect();
        let run = deps.repo.create_run(&definition.id, CreateRunInput { parameters: json!({"items": items}), ..Default::default() }).await.unwrap();
        let step = FanOutStepDefinition {
            id: "Parent".into(),
            collection: "{{ parameters.items }}".into(),
            template: template(),
            max_items: Some(2),
            max_concurrency: None,
            store_results_as: None,
            depends_on: vec![],
            produces: vec![],
        };
        let result = execute(&deps, &definition, &run, RuntimeContext::default(), &step, None).await;
        assert_eq!(result.step_status, WorkflowRunStepStatus::Failed);
        assert!(result.error_message.unwrap().contains("exceeding the limit"));
    }

    #[tokio::test]
    async fn valid_collection_registers_expansion() {
        let deps = deps().await;
        let definition = WorkflowDefinition::new("def".into(), "slug".into(), 1, vec![]);
        deps.repo.create_definition(definition.clone()).await.unwrap();
        let run = deps.repo.create_run(&definition.id, CreateRunInput { parameters: json!({"items": [1, 2, 3]}), ..Default::default() }).await.unwrap();
        let step = FanOutStepDefinition {
            id: "Parent".into(),
            collection: "{{ parameters.items }}".into(),
            template: template(),
            max_items: None,
            max_concurrency: Some(2),
            store_results_as: Some("results".into()),
            depends_on: vec![],
            produces: vec![],
        };
        let result = execute(&deps, &definition, &run, RuntimeContext::default(), &step, None).await;
        assert!(!result.completed);
        let expansion = result.fan_out.unwrap();
        assert_eq!(expansion.children.len(), 3);
        assert_eq!(expansion.max_concurrency, 2);
        assert_eq!(expansion.children[0].id(), "Parent:compute:1");
    }
}
