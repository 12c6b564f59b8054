//! Step executors: one `execute` entry point per step kind, each returning a
//! `StepExecutionResult` the run orchestrator applies. Per-step errors never
//! escape `execute` — they are always translated into a failed/retry-scheduled
//! result, so the orchestrator's own error handling stays limited to
//! unexpected failures in its own scheduling loop.

mod context;
mod error;
pub mod fanout;
pub mod job;
pub mod service;

pub use context::{CancellationHandle, HeartbeatError, HeartbeatPayload, StepContext};
pub use error::StepError;

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::config::OrchestratorConfig;
use crate::events::EventSink;
use crate::model::{
    RuntimeContext, StepDefinition, StepRuntime, WorkflowDefinition, WorkflowRun, WorkflowRunStep,
    WorkflowRunStepStatus,
};
use crate::persistence::{QueuePort, RepositoryPort, RunStepPatch};
use crate::secrets::SecretStore;
use crate::services::ServiceRegistry;
use crate::template::{resolve_json_templates, ResolutionTracker, TemplateScope};
use crate::worker::JobRunner;

/// Everything a step executor needs beyond the step/run/context it is
/// handed: the repository, queue, job runner, service registry, secret
/// store and event sink ports, plus the process-wide tunables. Bundled as
/// trait objects so `execute` doesn't carry five type parameters for every
/// step kind.
#[derive(Clone)]
pub struct StepDeps {
    pub repo: Arc<dyn RepositoryPort>,
    pub queue: Arc<dyn QueuePort>,
    pub job_runner: Arc<dyn JobRunner>,
    pub services: Arc<dyn ServiceRegistry>,
    pub secrets: Arc<dyn SecretStore>,
    pub events: Arc<dyn EventSink>,
    pub config: OrchestratorConfig,
}

/// Identifies a step execution as one child of a fan-out expansion: which
/// parent/template it came from, its index, and the resolved collection
/// item it runs against (exposed to templates as the `item`/`fanout` roots).
#[derive(Debug, Clone)]
pub struct FanoutMembership {
    pub parent_step_id: String,
    pub fanout_index: usize,
    pub template_step_id: String,
    pub item: Value,
}

/// What an executor wants the orchestrator to do next.
#[derive(Debug)]
pub struct StepExecutionResult {
    pub context: RuntimeContext,
    pub step_status: WorkflowRunStepStatus,
    /// `false` means the orchestrator must not treat the step as terminal
    /// yet: either a fan-out expansion was registered, or a retry/recovery
    /// poll was scheduled.
    pub completed: bool,
    pub step_patch: RunStepPatch,
    pub shared_patch: Option<HashMap<String, Value>>,
    pub error_message: Option<String>,
    pub fan_out: Option<FanOutExpansion>,
    pub scheduled_retry: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct FanOutExpansion {
    pub children: Vec<StepDefinition>,
    /// The resolved collection item each `children[i]` runs against, paired
    /// by index so the orchestrator can rebuild a [`FanoutMembership`] per
    /// child without re-resolving the `collection` expression.
    pub items: Vec<Value>,
    pub max_concurrency: usize,
    pub store_results_as: Option<String>,
    pub parent_run_step_id: String,
}

/// `{...a, ...b}` when both sides are objects; `b` when non-null/non-object;
/// `a` otherwise.
pub fn merge_parameters(run_parameters: &Value, step_parameters: Option<&Value>) -> Value {
    match (run_parameters, step_parameters) {
        (Value::Object(a), Some(Value::Object(b))) => {
            let mut merged = a.clone();
            for (k, v) in b {
                merged.insert(k.clone(), v.clone());
            }
            Value::Object(merged)
        }
        (_, Some(b)) if !b.is_null() => b.clone(),
        _ => run_parameters.clone(),
    }
}

/// Confirms every dependency id resolves to a succeeded step in the runtime
/// context. A failure here is a scheduler bug, not a user error — the
/// orchestrator only ever calls `execute` once a step's dependencies show
/// succeeded in its own bookkeeping.
pub fn dependency_gate(step: &StepDefinition, context: &RuntimeContext) -> Result<(), StepError> {
    for dep in step.depends_on() {
        let succeeded = context
            .steps
            .get(dep)
            .and_then(|s| s.status)
            .map(|status| status == WorkflowRunStepStatus::Succeeded)
            .unwrap_or(false);
        if !succeeded {
            return Err(StepError::DependencyBlocked(dep.clone()));
        }
    }
    Ok(())
}

/// Builds the template scope for a step execution: `run`, `parameters`,
/// `shared`/`steps` (via `context`), plus the fan-out `item`/`fanout` roots
/// when this execution is a fan-out child.
pub fn build_scope(
    run: &WorkflowRun,
    context: &RuntimeContext,
    merged_parameters: &Value,
    fan: Option<&FanoutMembership>,
) -> TemplateScope {
    let steps_value = serde_json::to_value(
        context.steps.iter().map(|(k, v)| (k.clone(), v)).collect::<HashMap<_, _>>(),
    )
    .unwrap_or(Value::Null);
    let shared_value = serde_json::to_value(&context.shared).unwrap_or(Value::Null);
    let mut scope = TemplateScope::new()
        .with_root("run", serde_json::to_value(run).unwrap_or(Value::Null))
        .with_root("parameters", merged_parameters.clone())
        .with_root("steps", steps_value)
        .with_root("shared", shared_value);
    if let Some(fan) = fan {
        scope.set_root("item", fan.item.clone());
        scope.set_root(
            "fanout",
            serde_json::json!({"index": fan.fanout_index, "parentStepId": fan.parent_step_id}),
        );
    }
    scope
}

/// Merges run and step parameters, then resolves templates against `scope`.
/// On any unresolved reference returns the `parameter_resolution_failed`
/// variant of [`StepError`] with a summary of every failing path.
pub fn prepare_parameters(
    run_parameters: &Value,
    step_parameters: Option<&Value>,
    scope: &TemplateScope,
) -> Result<Value, StepError> {
    let merged = merge_parameters(run_parameters, step_parameters);
    let mut tracker = ResolutionTracker::default();
    let resolved = resolve_json_templates(&merged, scope, &mut tracker);
    if tracker.has_issues() {
        let summary = tracker
            .issues
            .iter()
            .map(|issue| format!("{}: {}", issue.path, issue.expression))
            .collect::<Vec<_>>()
            .join("; ");
        return Err(StepError::ParameterResolutionFailed(summary));
    }
    Ok(resolved)
}

/// Applies the common bookkeeping for a parameter-resolution failure: mark
/// the step `failed`, `resolutionError=true`, and a human-readable summary.
pub fn handle_parameter_resolution_failure(
    context: RuntimeContext,
    step_id: &str,
    summary: String,
) -> StepExecutionResult {
    let mut context = context;
    let entry = context.steps.entry(step_id.to_string()).or_default();
    entry.status = Some(WorkflowRunStepStatus::Failed);
    entry.error_message = Some(summary.clone());
    entry.failure_reason = Some("parameter_resolution_failed".to_string());
    entry.resolution_error = Some(true);

    StepExecutionResult {
        context,
        step_status: WorkflowRunStepStatus::Failed,
        completed: true,
        step_patch: RunStepPatch {
            status: Some(WorkflowRunStepStatus::Failed),
            error_message: Some(Some(summary.clone())),
            failure_reason: Some(Some("parameter_resolution_failed".to_string())),
            completed_at: Some(Some(Utc::now())),
            ..Default::default()
        },
        shared_patch: None,
        error_message: Some(summary),
        fan_out: None,
        scheduled_retry: None,
    }
}

/// Already-terminal hydration: when a step's persisted status is already
/// `succeeded` (re-entrant orchestrator pass after a crash), replay its
/// recorded runtime state instead of re-executing.
pub fn hydrate_succeeded(context: RuntimeContext, run_step: &WorkflowRunStep) -> StepExecutionResult {
    StepExecutionResult {
        context,
        step_status: WorkflowRunStepStatus::Succeeded,
        completed: true,
        step_patch: RunStepPatch::default(),
        shared_patch: None,
        error_message: None,
        fan_out: None,
        scheduled_retry: None,
    }
}

pub(crate) fn is_already_succeeded(run_step: &WorkflowRunStep) -> bool {
    run_step.status == WorkflowRunStepStatus::Succeeded
}

/// Loads the persisted run-step record for `step_id`, creating it on first
/// execution and stamping fan-out lineage (`parentStepId`/`fanoutIndex`/
/// `templateStepId`) when `fan` is set.
pub async fn get_or_create_run_step(
    repo: &dyn RepositoryPort,
    run_id: &str,
    step_id: &str,
    fan: Option<&FanoutMembership>,
) -> Result<WorkflowRunStep, StepError> {
    if let Some(existing) = repo
        .get_run_step_by_step_id(run_id, step_id)
        .await
        .map_err(|e| StepError::JobFailed(e.to_string()))?
    {
        return Ok(existing);
    }
    let created = repo
        .create_run_step(run_id, step_id)
        .await
        .map_err(|e| StepError::JobFailed(e.to_string()))?;
    match fan {
        Some(fan) => repo
            .update_run_step(
                &created.id,
                RunStepPatch {
                    parent_step_id: Some(Some(fan.parent_step_id.clone())),
                    fanout_index: Some(Some(fan.fanout_index)),
                    template_step_id: Some(Some(fan.template_step_id.clone())),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| StepError::JobFailed(e.to_string())),
        None => Ok(created),
    }
}

/// Shared terminal-failure bookkeeping once a job/service attempt is
/// exhausted and no retry remains: `failed`, retry state `completed`,
/// `nextAttemptAt` cleared, plus a dead-letter record so an operator can
/// query steps that ran out of attempts.
pub fn terminal_failure_patch(error_message: String, failure_reason: &str) -> RunStepPatch {
    RunStepPatch {
        status: Some(WorkflowRunStepStatus::Failed),
        retry_state: Some(crate::model::RetryState::Completed),
        next_attempt_at: Some(None),
        error_message: Some(Some(error_message)),
        failure_reason: Some(Some(failure_reason.to_string())),
        completed_at: Some(Some(Utc::now())),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_parameters_object_shallow_merge() {
        let merged = merge_parameters(&json!({"a": 1, "b": 2}), Some(&json!({"b": 3})));
        assert_eq!(merged, json!({"a": 1, "b": 3}));
    }

    #[test]
    fn merge_parameters_non_object_step_wins() {
        let merged = merge_parameters(&json!({"a": 1}), Some(&json!("override")));
        assert_eq!(merged, json!("override"));
    }

    #[test]
    fn merge_parameters_null_step_keeps_run() {
        let merged = merge_parameters(&json!({"a": 1}), Some(&Value::Null));
        assert_eq!(merged, json!({"a": 1}));
    }

    #[test]
    fn dependency_gate_rejects_unsucceeded_dependency() {
        use crate::model::JobStepDefinition;
        let step = StepDefinition::Job(JobStepDefinition {
            id: "B".into(),
            depends_on: vec!["A".into()],
            ..Default::default()
        });
        let context = RuntimeContext::default();
        assert!(dependency_gate(&step, &context).is_err());
    }
}
