//! Run orchestrator: the DAG scheduler that drives one workflow run
//! from `pending`/`running` to a terminal status. Bounded parallelism,
//! dependency gating, fan-out expansion and run-level commit all live here;
//! the step-kind state machines themselves live under [`crate::activity`].
//!
//! Follows the familiar load/check-terminal/do-work/commit run loop shape,
//! retargeted from event replay onto `FuturesUnordered`-driven step
//! scheduling over a persisted DAG.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use chrono::Utc;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::activity::{fanout, job, service, FanoutMembership, StepDeps, StepExecutionResult};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::events::WorkflowEvent;
use crate::model::{
    RunStatus, RuntimeContext, StepDefinition, WorkflowDefinition, WorkflowRun, WorkflowRunHistoryEvent,
    WorkflowRunStepStatus,
};
use crate::persistence::{NewAsset, RunPatch, RunStepPatch};

/// Thin legacy-named alias kept for call sites that only need the tunables
/// already carried on [`StepDeps::config`]; the orchestrator itself needs
/// no configuration beyond what step execution already reads.
pub type ExecutorConfig = crate::config::OrchestratorConfig;
pub type ExecutorError = OrchestratorError;

type StepFuture = Pin<Box<dyn Future<Output = StepOutcome> + Send>>;

struct StepOutcome {
    step_id: String,
    fan: Option<FanoutMembership>,
    result: StepExecutionResult,
}

struct ChildOutcome {
    index: usize,
    step_id: String,
    status: WorkflowRunStepStatus,
    output: Value,
    error_message: Option<String>,
    item: Value,
    assets: Vec<Value>,
}

struct FanOutState {
    parent_run_step_id: String,
    store_results_as: Option<String>,
    max_concurrency: usize,
    pending: VecDeque<(StepDefinition, FanoutMembership)>,
    active: usize,
    total: usize,
    results: Vec<Option<ChildOutcome>>,
}

impl FanOutState {
    fn settled(&self) -> bool {
        self.active == 0 && self.pending.is_empty()
    }
}

/// DAG scheduler driving one run. Holds the same port bundle every step
/// executor uses ([`StepDeps`]) so the orchestrator and the executors it
/// dispatches to share one dependency-injection surface.
pub struct RunOrchestrator {
    deps: StepDeps,
}

impl RunOrchestrator {
    pub fn new(deps: StepDeps) -> Self {
        Self { deps }
    }

    /// Drives `run_id` from its current state to a terminal status,
    /// returning the committed run. Idempotent: a run already terminal is
    /// returned unchanged.
    #[instrument(skip(self), fields(run_id = %run_id))]
    pub async fn run(&self, run_id: &str) -> OrchestratorResult<WorkflowRun> {
        let mut run = self.deps.repo.get_run(run_id).await?;
        if run.status.is_terminal() {
            debug!(status = ?run.status, "run already terminal, nothing to do");
            return Ok(run);
        }

        let definition = match self.deps.repo.get_definition(&run.workflow_definition_id).await {
            Ok(d) => d,
            Err(_) => {
                return self
                    .commit_failure(&run, "workflow orchestration failed: definition not found".to_string())
                    .await;
            }
        };

        if run.status == RunStatus::Pending {
            let started_at = run.started_at.unwrap_or_else(Utc::now);
            run = self
                .deps
                .repo
                .update_run(
                    &run.id,
                    RunPatch {
                        status: Some(RunStatus::Running),
                        started_at: Some(started_at),
                        total_steps: Some(definition.steps.len()),
                        ..Default::default()
                    },
                )
                .await?;
            self.record_status_history(&run, "running").await;
        }

        match self.drive(run.clone(), definition).await {
            Ok(finished) => Ok(finished),
            Err(err) => {
                warn!(error = %err, "workflow orchestration failed");
                self.commit_failure(&run, format!("Workflow orchestration failed: {err}")).await
            }
        }
    }

    async fn drive(&self, run: WorkflowRun, definition: WorkflowDefinition) -> OrchestratorResult<WorkflowRun> {
        let mut dependencies: HashMap<String, HashSet<String>> = HashMap::new();
        let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
        let mut step_defs: HashMap<String, StepDefinition> = HashMap::new();
        for step in &definition.steps {
            step_defs.insert(step.id().to_string(), step.clone());
            let deps_set: HashSet<String> = step.depends_on().iter().cloned().collect();
            for dep in &deps_set {
                dependents.entry(dep.clone()).or_default().push(step.id().to_string());
            }
            dependencies.insert(step.id().to_string(), deps_set);
        }
        for (dep, children) in &definition.dag.adjacency {
            for child in children {
                let entry = dependents.entry(dep.clone()).or_default();
                if !entry.contains(child) {
                    entry.push(child.clone());
                }
                dependencies.entry(child.clone()).or_default().insert(dep.clone());
            }
        }

        let mut context = run.context.clone();
        let mut status: HashMap<String, WorkflowRunStepStatus> = HashMap::new();
        for step_id in step_defs.keys() {
            let persisted = context.steps.get(step_id).and_then(|s| s.status);
            let initial =
                if persisted == Some(WorkflowRunStepStatus::Succeeded) { WorkflowRunStepStatus::Succeeded } else { WorkflowRunStepStatus::Pending };
            status.insert(step_id.clone(), initial);
        }
        let mut remaining: HashSet<String> =
            step_defs.keys().filter(|id| status.get(*id) != Some(&WorkflowRunStepStatus::Succeeded)).cloned().collect();

        let step_count = step_defs.len().max(1);
        let metadata_max_parallel =
            definition.metadata.get("scheduler").and_then(|s| s.get("maxParallel")).and_then(|v| v.as_u64()).map(|v| v as usize);
        let parameters_concurrency =
            run.parameters.get("workflowConcurrency").and_then(|v| v.as_u64()).map(|v| v as usize);
        let concurrency_limit = self.deps.config.resolve_concurrency_limit(metadata_max_parallel, parameters_concurrency, step_count);

        let mut ready: VecDeque<String> =
            remaining.iter().filter(|id| is_ready(id, &status, &dependencies)).cloned().collect();
        let mut queued: HashSet<String> = ready.iter().cloned().collect();

        let mut fan_out_states: HashMap<String, FanOutState> = HashMap::new();
        let run = Arc::new(run);
        let definition = Arc::new(definition);
        let mut in_flight: FuturesUnordered<StepFuture> = FuturesUnordered::new();
        let mut failure: Option<String> = None;

        loop {
            while in_flight.len() < concurrency_limit {
                if let Some(step_id) = ready.pop_front() {
                    queued.remove(&step_id);
                    let step = step_defs.get(&step_id).cloned().expect("ready step must be declared");
                    let ctx = context.json_roundtrip_clone();
                    in_flight.push(Self::spawn_step(self.deps.clone(), definition.clone(), run.clone(), ctx, step, None));
                    continue;
                }
                if let Some((parent_id, child, membership)) = next_fanout_child(&mut fan_out_states) {
                    let _ = parent_id;
                    let ctx = context.json_roundtrip_clone();
                    in_flight.push(Self::spawn_step(self.deps.clone(), definition.clone(), run.clone(), ctx, child, Some(membership)));
                    continue;
                }
                break;
            }

            if in_flight.is_empty() {
                if failure.is_some() {
                    break;
                }
                let fanouts_idle = fan_out_states.values().all(|f| f.settled());
                if remaining.is_empty() && fanouts_idle {
                    break;
                }
                failure = Some("Workflow blocked by unsatisfied dependencies".to_string());
                break;
            }

            let StepOutcome { step_id, fan, result } = match in_flight.next().await {
                Some(outcome) => outcome,
                None => break,
            };

            context = result.context;
            let _ = self
                .deps
                .repo
                .update_run(
                    &run.id,
                    RunPatch {
                        context: Some(context.clone()),
                        current_step_id: Some(Some(step_id.clone())),
                        ..Default::default()
                    },
                )
                .await;

            if let Some(expansion) = result.fan_out {
                let parent_step = step_defs.get(&step_id).cloned();
                let template_id = match &parent_step {
                    Some(StepDefinition::Fanout(f)) => f.template.id().to_string(),
                    _ => String::new(),
                };
                let mut pending = VecDeque::new();
                for (index, (mut child, item)) in expansion.children.into_iter().zip(expansion.items.into_iter()).enumerate() {
                    if let Some(parent) = &parent_step {
                        propagate_fanout_depends_on(&mut child, parent);
                    }
                    let membership =
                        FanoutMembership { parent_step_id: step_id.clone(), fanout_index: index, template_step_id: template_id.clone(), item };
                    pending.push_back((child, membership));
                }
                fan_out_states.insert(
                    step_id.clone(),
                    FanOutState {
                        parent_run_step_id: expansion.parent_run_step_id,
                        store_results_as: expansion.store_results_as,
                        max_concurrency: expansion.max_concurrency,
                        total: pending.len(),
                        results: (0..pending.len()).map(|_| None).collect(),
                        pending,
                        active: 0,
                    },
                );
                continue;
            }

            if let Some(fan) = fan {
                if let Some(state) = fan_out_states.get_mut(&fan.parent_step_id) {
                    state.active = state.active.saturating_sub(1);
                    if fan.fanout_index < state.results.len() {
                        state.results[fan.fanout_index] = Some(ChildOutcome {
                            index: fan.fanout_index,
                            step_id: step_id.clone(),
                            status: result.step_status,
                            output: context.steps.get(&step_id).and_then(|s| s.output.clone()).unwrap_or(Value::Null),
                            error_message: result.error_message.clone(),
                            item: fan.item.clone(),
                            assets: context.steps.get(&step_id).map(|s| s.assets.clone()).unwrap_or_default(),
                        });
                    }
                }
                if let Some(state) = fan_out_states.get(&fan.parent_step_id) {
                    if state.settled() {
                        match self
                            .settle_fanout(&fan.parent_step_id, &definition, &run, &mut context, &mut fan_out_states)
                            .await
                        {
                            Ok(parent_status) => {
                                status.insert(fan.parent_step_id.clone(), parent_status);
                                remaining.remove(&fan.parent_step_id);
                                if parent_status == WorkflowRunStepStatus::Succeeded {
                                    enqueue_dependents(&fan.parent_step_id, &dependents, &status, &dependencies, &remaining, &mut ready, &mut queued);
                                } else {
                                    failure.get_or_insert_with(|| {
                                        context
                                            .steps
                                            .get(&fan.parent_step_id)
                                            .and_then(|s| s.error_message.clone())
                                            .unwrap_or_else(|| format!("fan-out {} failed", fan.parent_step_id))
                                    });
                                }
                            }
                            Err(err) => {
                                failure.get_or_insert(err.to_string());
                            }
                        }
                    }
                }
                continue;
            }

            if !result.completed {
                // Retry scheduled or a recovery poll parked the step; the
                // heartbeat/retry queue will re-enqueue this run later.
                continue;
            }

            status.insert(step_id.clone(), result.step_status);
            remaining.remove(&step_id);

            if result.step_status == WorkflowRunStepStatus::Succeeded {
                enqueue_dependents(&step_id, &dependents, &status, &dependencies, &remaining, &mut ready, &mut queued);
            } else {
                failure.get_or_insert_with(|| result.error_message.clone().unwrap_or_else(|| format!("step {step_id} failed")));
            }
        }

        if let Some(message) = failure {
            return self.commit_failure(&run, message).await;
        }
        self.commit_success(&run, &context, &status).await
    }

    fn spawn_step(
        deps: StepDeps,
        definition: Arc<WorkflowDefinition>,
        run: Arc<WorkflowRun>,
        context: RuntimeContext,
        step: StepDefinition,
        fan: Option<FanoutMembership>,
    ) -> StepFuture {
        Box::pin(async move {
            let step_id = step.id().to_string();
            let result = match &step {
                StepDefinition::Job(j) => job::execute(&deps, &definition, &run, context, j, fan.as_ref()).await,
                StepDefinition::Service(s) => service::execute(&deps, &definition, &run, context, s, fan.as_ref()).await,
                StepDefinition::Fanout(f) => fanout::execute(&deps, &definition, &run, context, f, fan.as_ref()).await,
            };
            StepOutcome { step_id, fan, result }
        })
    }

    /// Once every child of a fan-out has terminated: aggregate failure
    /// message on any child failure, else sort results by index, persist
    /// them as the parent's output/`storeResultsAs`, and roll up produced
    /// assets.
    async fn settle_fanout(
        &self,
        parent_id: &str,
        definition: &WorkflowDefinition,
        run: &WorkflowRun,
        context: &mut RuntimeContext,
        fan_out_states: &mut HashMap<String, FanOutState>,
    ) -> OrchestratorResult<WorkflowRunStepStatus> {
        let state = fan_out_states.remove(parent_id).expect("settling a registered fan-out");
        let mut results: Vec<ChildOutcome> = state.results.into_iter().flatten().collect();
        results.sort_by_key(|r| r.index);

        let any_failed = results.iter().any(|r| r.status != WorkflowRunStepStatus::Succeeded);
        if any_failed {
            let message = results
                .iter()
                .filter(|r| r.status != WorkflowRunStepStatus::Succeeded)
                .map(|r| format!("{} (item {}): {}", r.step_id, r.index + 1, r.error_message.clone().unwrap_or_default()))
                .collect::<Vec<_>>()
                .join("; ");
            self.deps
                .repo
                .update_run_step(
                    &state.parent_run_step_id,
                    RunStepPatch {
                        status: Some(WorkflowRunStepStatus::Failed),
                        error_message: Some(Some(message.clone())),
                        failure_reason: Some(Some("fanout_child_failed".to_string())),
                        completed_at: Some(Some(Utc::now())),
                        ..Default::default()
                    },
                )
                .await?;
            let entry = context.steps.entry(parent_id.to_string()).or_default();
            entry.status = Some(WorkflowRunStepStatus::Failed);
            entry.error_message = Some(message);
            return Ok(WorkflowRunStepStatus::Failed);
        }

        let output: Vec<Value> = results
            .iter()
            .map(|r| {
                serde_json::json!({
                    "stepId": r.step_id,
                    "index": r.index,
                    "status": "succeeded",
                    "output": r.output,
                    "errorMessage": Value::Null,
                    "item": r.item,
                    "assets": r.assets,
                })
            })
            .collect();
        let output_value = Value::Array(output);

        self.deps
            .repo
            .update_run_step(
                &state.parent_run_step_id,
                RunStepPatch {
                    status: Some(WorkflowRunStepStatus::Succeeded),
                    output: Some(Some(output_value.clone())),
                    completed_at: Some(Some(Utc::now())),
                    ..Default::default()
                },
            )
            .await?;

        let entry = context.steps.entry(parent_id.to_string()).or_default();
        entry.status = Some(WorkflowRunStepStatus::Succeeded);
        entry.output = Some(output_value.clone());

        if let Some(store_as) = &state.store_results_as {
            context.shared.insert(store_as.clone(), output_value);
        }

        if let Some(StepDefinition::Fanout(parent_def)) = definition.step(parent_id) {
            if !parent_def.produces.is_empty() {
                let child_ids: Vec<String> = results.iter().map(|r| r.step_id.clone()).collect();
                rollup_fanout_assets(&self.deps, definition, run, parent_def, &state.parent_run_step_id, parent_id, context, &child_ids)
                    .await;
            }
        }

        Ok(WorkflowRunStepStatus::Succeeded)
    }

    async fn record_status_history(&self, run: &WorkflowRun, status: &str) {
        let _ = self
            .deps
            .repo
            .append_history(WorkflowRunHistoryEvent::RunStatus {
                workflow_run_id: run.id.clone(),
                status: status.to_string(),
                at: Utc::now(),
            })
            .await;
        self.deps.events.emit(WorkflowEvent::RunStatus { run_id: run.id.clone(), status: status.to_string() }).await;
    }

    async fn commit_success(&self, run: &WorkflowRun, context: &RuntimeContext, status: &HashMap<String, WorkflowRunStepStatus>) -> OrchestratorResult<WorkflowRun> {
        let completed_steps = status.values().filter(|s| **s == WorkflowRunStepStatus::Succeeded).count();
        let output = if context.shared.is_empty() { None } else { Some(serde_json::to_value(&context.shared).unwrap_or(Value::Null)) };
        let updated = self
            .deps
            .repo
            .update_run(
                &run.id,
                RunPatch {
                    status: Some(RunStatus::Succeeded),
                    output: Some(output),
                    context: Some(context.clone()),
                    completed_steps: Some(completed_steps),
                    completed_at: Some(Utc::now()),
                    current_step_id: Some(None),
                    ..Default::default()
                },
            )
            .await?;
        self.record_status_history(&updated, "succeeded").await;
        info!(run_id = %updated.id, "run succeeded");
        Ok(updated)
    }

    async fn commit_failure(&self, run: &WorkflowRun, message: String) -> OrchestratorResult<WorkflowRun> {
        let updated = self
            .deps
            .repo
            .update_run(
                &run.id,
                RunPatch {
                    status: Some(RunStatus::Failed),
                    error_message: Some(Some(message.clone())),
                    completed_at: Some(Utc::now()),
                    ..Default::default()
                },
            )
            .await?;
        self.record_status_history(&updated, "failed").await;
        warn!(run_id = %updated.id, error = %message, "run failed");
        Ok(updated)
    }
}

fn is_ready(id: &str, status: &HashMap<String, WorkflowRunStepStatus>, dependencies: &HashMap<String, HashSet<String>>) -> bool {
    if status.get(id) == Some(&WorkflowRunStepStatus::Succeeded) {
        return false;
    }
    dependencies
        .get(id)
        .map(|deps| deps.iter().all(|d| status.get(d) == Some(&WorkflowRunStepStatus::Succeeded)))
        .unwrap_or(true)
}

fn enqueue_dependents(
    step_id: &str,
    dependents: &HashMap<String, Vec<String>>,
    status: &HashMap<String, WorkflowRunStepStatus>,
    dependencies: &HashMap<String, HashSet<String>>,
    remaining: &HashSet<String>,
    ready: &mut VecDeque<String>,
    queued: &mut HashSet<String>,
) {
    let Some(children) = dependents.get(step_id) else { return };
    for child in children {
        if remaining.contains(child) && !queued.contains(child) && is_ready(child, status, dependencies) {
            ready.push_back(child.clone());
            queued.insert(child.clone());
        }
    }
}

/// Pops the next child from whichever fan-out has spare per-parent
/// concurrency, respecting [`FanOutState::max_concurrency`] independent of
/// the run's overall `concurrencyLimit`.
fn next_fanout_child(fan_out_states: &mut HashMap<String, FanOutState>) -> Option<(String, StepDefinition, FanoutMembership)> {
    for (parent_id, state) in fan_out_states.iter_mut() {
        if state.active < state.max_concurrency {
            if let Some((child, membership)) = state.pending.pop_front() {
                state.active += 1;
                return Some((parent_id.clone(), child, membership));
            }
        }
    }
    None
}

fn propagate_fanout_depends_on(child: &mut StepDefinition, parent: &StepDefinition) {
    let inherited: Vec<String> = parent.depends_on().iter().filter(|d| d.as_str() != child.id()).cloned().collect();
    let merge = |existing: &mut Vec<String>| {
        let mut merged = inherited.clone();
        merged.extend(existing.drain(..));
        merged.sort();
        merged.dedup();
        *existing = merged;
    };
    match child {
        StepDefinition::Job(j) => merge(&mut j.depends_on),
        StepDefinition::Service(s) => merge(&mut s.depends_on),
        StepDefinition::Fanout(f) => merge(&mut f.depends_on),
    }
}

async fn rollup_fanout_assets(
    deps: &StepDeps,
    definition: &WorkflowDefinition,
    run: &WorkflowRun,
    parent_step: &crate::model::FanOutStepDefinition,
    parent_run_step_id: &str,
    parent_step_id: &str,
    context: &RuntimeContext,
    child_ids: &[String],
) {
    let mut by_asset: HashMap<String, Vec<Value>> = HashMap::new();
    for child_id in child_ids {
        let Some(step_runtime) = context.steps.get(child_id) else { continue };
        for asset_val in &step_runtime.assets {
            let Some(asset_id) = asset_val.get("assetId").and_then(|v| v.as_str()) else { continue };
            let source = serde_json::json!({
                "stepId": child_id,
                "producedAt": asset_val.get("producedAt").cloned().unwrap_or(Value::Null),
                "payload": asset_val.get("payload").cloned().unwrap_or(Value::Null),
            });
            by_asset.entry(asset_id.to_string()).or_default().push(source);
        }
    }
    if by_asset.is_empty() {
        return;
    }
    let _ = parent_step;
    let new_assets: Vec<NewAsset> = by_asset
        .into_iter()
        .map(|(asset_id, sources)| NewAsset {
            asset_id,
            payload: serde_json::json!({ "sources": sources }),
            schema: None,
            freshness: None,
            partition_key: run.partition_key.clone(),
            produced_at: Utc::now(),
        })
        .collect();
    let _ = deps.repo.record_step_assets(&definition.id, &run.id, parent_run_step_id, parent_step_id, new_assets).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::events::NullEventSink;
    use crate::model::{JobStepDefinition, WorkflowDefinition};
    use crate::persistence::{CreateRunInput, InMemoryRepository, InlineQueue};
    use crate::secrets::NullSecretStore;
    use crate::services::{ServiceDescriptor, ServiceError, ServiceRegistry, ServiceRequest, ServiceResponse};
    use crate::worker::{InProcessJobRunner, JobRunnerConfig};
    use async_trait::async_trait;
    use serde_json::json;

    struct NoServices;

    #[async_trait]
    impl ServiceRegistry for NoServices {
        async fn get_service_by_slug(&self, _slug: &str) -> Option<ServiceDescriptor> {
            None
        }
        async fn fetch_from_service(&self, _service: &ServiceDescriptor, _request: ServiceRequest) -> Result<ServiceResponse, ServiceError> {
            Err(ServiceError::NotFound("unused".into()))
        }
    }

    async fn orchestrator_with(runner: Arc<InProcessJobRunner>) -> (RunOrchestrator, Arc<InMemoryRepository>) {
        let repo = Arc::new(InMemoryRepository::new());
        let (queue, _rx) = InlineQueue::new();
        let deps = StepDeps {
            repo: repo.clone(),
            queue: Arc::new(queue),
            job_runner: runner,
            services: Arc::new(NoServices),
            secrets: Arc::new(NullSecretStore),
            events: Arc::new(NullEventSink),
            config: OrchestratorConfig::default(),
        };
        (RunOrchestrator::new(deps), repo)
    }

    #[tokio::test]
    async fn linear_two_step_run_succeeds_in_order() {
        let runner = Arc::new(InProcessJobRunner::new(JobRunnerConfig::default()));
        runner.register_handler("a", |_ctx, _params| async move { Ok(json!({"value": "a"})) });
        runner.register_handler("b", |_ctx, _params| async move { Ok(json!({"value": "b"})) });
        let (orchestrator, repo) = orchestrator_with(runner).await;

        let definition = WorkflowDefinition::new(
            "def-1".into(),
            "linear".into(),
            1,
            vec![
                StepDefinition::Job(JobStepDefinition { id: "A".into(), job_slug: "a".into(), store_result_as: Some("a".into()), ..Default::default() }),
                StepDefinition::Job(JobStepDefinition {
                    id: "B".into(),
                    job_slug: "b".into(),
                    depends_on: vec!["A".into()],
                    store_result_as: Some("b".into()),
                    ..Default::default()
                }),
            ],
        );
        repo.create_definition(definition.clone()).await.unwrap();
        let run = repo.create_run(&definition.id, CreateRunInput::default()).await.unwrap();

        let finished = orchestrator.run(&run.id).await.unwrap();
        assert_eq!(finished.status, RunStatus::Succeeded);
        assert_eq!(finished.metrics.completed_steps, 2);
        assert_eq!(finished.metrics.total_steps, 2);
    }

    #[tokio::test]
    async fn missing_handler_fails_the_run() {
        let runner = Arc::new(InProcessJobRunner::new(JobRunnerConfig::default()));
        let (orchestrator, repo) = orchestrator_with(runner).await;
        let definition = WorkflowDefinition::new(
            "def-1".into(),
            "broken".into(),
            1,
            vec![StepDefinition::Job(JobStepDefinition { id: "A".into(), job_slug: "nope".into(), ..Default::default() })],
        );
        repo.create_definition(definition.clone()).await.unwrap();
        let run = repo.create_run(&definition.id, CreateRunInput::default()).await.unwrap();

        let finished = orchestrator.run(&run.id).await.unwrap();
        assert_eq!(finished.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn fanout_collection_expands_and_aggregates() {
        let runner = Arc::new(InProcessJobRunner::new(JobRunnerConfig::default()));
        runner.register_handler("double", |_ctx, params| async move {
            let n = params.get("item").and_then(|v| v.as_i64()).unwrap_or(0);
            Ok(json!({"value": n * 2}))
        });
        let (orchestrator, repo) = orchestrator_with(runner).await;

        let definition = WorkflowDefinition::new(
            "def-1".into(),
            "fanout".into(),
            1,
            vec![StepDefinition::Fanout(crate::model::FanOutStepDefinition {
                id: "Parent".into(),
                collection: "{{ parameters.items }}".into(),
                template: crate::model::FanOutTemplate::Job(JobStepDefinition {
                    id: "compute".into(),
                    job_slug: "double".into(),
                    parameters: Some(json!({"item": "{{ item }}"})),
                    ..Default::default()
                }),
                max_items: None,
                max_concurrency: None,
                store_results_as: Some("results".into()),
                depends_on: vec![],
                produces: vec![],
            })],
        );
        repo.create_definition(definition.clone()).await.unwrap();
        let run = repo
            .create_run(&definition.id, CreateRunInput { parameters: json!({"items": [1, 2, 3]}), ..Default::default() })
            .await
            .unwrap();

        let finished = orchestrator.run(&run.id).await.unwrap();
        assert_eq!(finished.status, RunStatus::Succeeded);
        let results = finished.context.shared.get("results").cloned().unwrap();
        let results = results.as_array().unwrap();
        assert_eq!(results.len(), 3);
    }
}
