//! Service step executor: resolves headers/query/body against the
//! runtime scope, including `{secret, prefix?}` header references, then
//! issues the request through a [`ServiceRegistry`] and retries in-process
//! per the step's own retry policy before handing control back to the
//! orchestrator.
//!
//! Same load-or-create, dispatch, interpret-terminal-outcome shape as
//! [`crate::activity::job`], with the attempt loop kept in-process rather
//! than queue-scheduled: see the module doc on
//! [`crate::reliability::calculate_retry_delay`].

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Map, Value};
use tracing::warn;

use crate::activity::{
    build_scope, dependency_gate, get_or_create_run_step, handle_parameter_resolution_failure, hydrate_succeeded,
    is_already_succeeded, merge_parameters, terminal_failure_patch, FanoutMembership, StepDeps, StepError,
    StepExecutionResult,
};
use crate::assets::persist_produced_assets;
use crate::model::{
    RetryState, RuntimeContext, ServiceStepDefinition, StepDefinition, StepRetryPolicy, WorkflowDefinition,
    WorkflowRun, WorkflowRunStep, WorkflowRunStepStatus,
};
use crate::persistence::RunStepPatch;
use crate::recovery::ensure_recovery_and_park;
use crate::reliability::{calculate_retry_delay, has_attempts_remaining};
use crate::secrets::SecretAccessContext;
use crate::services::{ServiceDescriptor, ServiceRequest, ServiceResponse};
use crate::template::{resolve_json_templates, ResolutionTracker, TemplateScope};

const MAX_CAPTURED_BODY: usize = 8192;
const DEFAULT_TIMEOUT_MS: u64 = 30_000;

struct PreparedRequest {
    request: ServiceRequest,
    sanitized_headers: Value,
}

pub async fn execute(
    deps: &StepDeps,
    definition: &WorkflowDefinition,
    run: &WorkflowRun,
    context: RuntimeContext,
    step: &ServiceStepDefinition,
    fan: Option<&FanoutMembership>,
) -> StepExecutionResult {
    let run_step = match get_or_create_run_step(deps.repo.as_ref(), &run.id, &step.id, fan).await {
        Ok(rs) => rs,
        Err(err) => return terminal_job_failure(context, &step.id, err.to_string(), "internal_error"),
    };

    if is_already_succeeded(&run_step) {
        return hydrate_succeeded(context, &run_step);
    }

    if let Err(err) = dependency_gate(&StepDefinition::Service(step.clone()), &context) {
        return terminal_job_failure(context, &step.id, err.to_string(), "internal_error");
    }

    let merged = merge_parameters(&run.parameters, None);
    let scope = build_scope(run, &context, &merged, fan);
    let prepared = match prepare_service_request(deps, step, &scope).await {
        Ok(p) => p,
        Err(StepError::ParameterResolutionFailed(summary)) => {
            return handle_parameter_resolution_failure(context, &step.id, summary);
        }
        Err(other) => return terminal_job_failure(context, &step.id, other.to_string(), "internal_error"),
    };

    if let Err(err) = deps
        .repo
        .update_run_step(
            &run_step.id,
            RunStepPatch {
                status: Some(WorkflowRunStepStatus::Running),
                started_at: Some(Some(Utc::now())),
                last_heartbeat_at: Some(Some(Utc::now())),
                input: Some(Some(json!({"path": prepared.request.path, "headers": prepared.sanitized_headers}))),
                ..Default::default()
            },
        )
        .await
    {
        return terminal_job_failure(context, &step.id, err.to_string(), "internal_error");
    }

    let policy = step.retry_policy.as_ref();
    let mut attempt = run_step.attempt.max(1);
    let mut context = context;

    loop {
        let descriptor = match deps.services.get_service_by_slug(&step.service_slug).await {
            Some(d) => d,
            None => {
                return terminal_job_failure(
                    context,
                    &step.id,
                    format!("service {} not registered", step.service_slug),
                    "service_not_found",
                );
            }
        };

        if !descriptor.status.is_invocable(step.require_healthy, step.allow_degraded) {
            record_invocation(
                deps,
                &run_step.id,
                &step.id,
                &mut context,
                build_metrics(&descriptor, attempt, None, None, None, None),
                build_service_context(&descriptor, &prepared.request, None, None),
            )
            .await;
            let message = format!("service {} is {:?} and not invocable", step.service_slug, descriptor.status);
            match retry_or_exhausted(deps, context, &run_step, &step.id, attempt, policy, message, "service_unavailable")
                .await
            {
                Ok((next, ctx)) => {
                    attempt = next;
                    context = ctx;
                    continue;
                }
                Err(result) => return result,
            }
        }

        let outcome = deps.services.fetch_from_service(&descriptor, prepared.request.clone()).await;
        match outcome {
            Ok(response) if (200..300).contains(&response.status_code) => {
                return succeed(deps, definition, run, context, &run_step, step, &prepared, response, attempt, &descriptor)
                    .await;
            }
            Ok(response) => {
                let response_size_bytes = response.body_text.len();
                let truncated = response_size_bytes > MAX_CAPTURED_BODY;
                record_invocation(
                    deps,
                    &run_step.id,
                    &step.id,
                    &mut context,
                    build_metrics(
                        &descriptor,
                        attempt,
                        Some(response.status_code),
                        Some(response.latency_ms),
                        Some(response_size_bytes),
                        Some(truncated),
                    ),
                    build_service_context(&descriptor, &prepared.request, Some(response.status_code), Some(response.latency_ms)),
                )
                .await;
                if let Some((asset_id, partition_key)) = asset_missing_from_body(&response.body_text) {
                    return begin_asset_recovery(deps, context, run, &run_step, &asset_id, partition_key.as_deref())
                        .await;
                }
                let message = format!(
                    "service {} responded {}: {}",
                    step.service_slug,
                    response.status_code,
                    truncate(&response.body_text, 500)
                );
                match retry_or_exhausted(deps, context, &run_step, &step.id, attempt, policy, message, "service_error")
                    .await
                {
                    Ok((next, ctx)) => {
                        attempt = next;
                        context = ctx;
                        continue;
                    }
                    Err(result) => return result,
                }
            }
            Err(err) => {
                record_invocation(
                    deps,
                    &run_step.id,
                    &step.id,
                    &mut context,
                    build_metrics(&descriptor, attempt, None, None, None, None),
                    build_service_context(&descriptor, &prepared.request, None, None),
                )
                .await;
                match retry_or_exhausted(
                    deps,
                    context,
                    &run_step,
                    &step.id,
                    attempt,
                    policy,
                    err.to_string(),
                    "service_error",
                )
                .await
                {
                    Ok((next, ctx)) => {
                        attempt = next;
                        context = ctx;
                        continue;
                    }
                    Err(result) => return result,
                }
            }
        }
    }
}

/// Either schedules another in-process attempt (sleeping for the policy's
/// backoff first) or, once attempts are exhausted, persists the final
/// attempt count and returns the terminal failure result.
async fn retry_or_exhausted(
    deps: &StepDeps,
    context: RuntimeContext,
    run_step: &WorkflowRunStep,
    step_id: &str,
    attempt: u32,
    policy: Option<&StepRetryPolicy>,
    message: String,
    failure_reason: &str,
) -> Result<(u32, RuntimeContext), StepExecutionResult> {
    if has_attempts_remaining(attempt, policy) {
        let next = attempt + 1;
        sleep_before_retry(next, policy).await;
        Ok((next, context))
    } else {
        if let Err(err) =
            deps.repo.update_run_step(&run_step.id, RunStepPatch { attempt: Some(attempt), ..Default::default() }).await
        {
            warn!(step_id = %step_id, error = %err, "failed to persist exhausted attempt count");
        }
        Err(terminal_job_failure(context, step_id, message, failure_reason))
    }
}

async fn sleep_before_retry(next_attempt: u32, policy: Option<&StepRetryPolicy>) {
    let delay = policy.map(|p| calculate_retry_delay(next_attempt, p)).unwrap_or_default();
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

/// Per-attempt `metrics.service` object: everything the step record's
/// `metrics` field carries for a service invocation, success or failure.
fn build_metrics(
    descriptor: &ServiceDescriptor,
    attempt: u32,
    status_code: Option<u16>,
    latency_ms: Option<u64>,
    response_size_bytes: Option<usize>,
    truncated: Option<bool>,
) -> Value {
    json!({
        "service": {
            "slug": descriptor.slug,
            "status": descriptor.status,
            "attempt": attempt,
            "statusCode": status_code,
            "latencyMs": latency_ms,
            "responseSizeBytes": response_size_bytes,
            "truncated": truncated,
            "baseUrl": descriptor.base_url,
        }
    })
}

/// Per-attempt step `context` object: what the call was, not how it went.
fn build_service_context(
    descriptor: &ServiceDescriptor,
    request: &ServiceRequest,
    status_code: Option<u16>,
    latency_ms: Option<u64>,
) -> Value {
    json!({
        "slug": descriptor.slug,
        "status": descriptor.status,
        "method": request.method,
        "path": request.path,
        "baseUrl": descriptor.base_url,
        "statusCode": status_code,
        "latencyMs": latency_ms,
    })
}

/// Persists `metrics`/`context` for the current attempt and mirrors them
/// into the in-memory runtime context, so both the stored step record and
/// the template-visible `steps.<id>` entry reflect every invocation, not
/// just the terminal one.
async fn record_invocation(
    deps: &StepDeps,
    run_step_id: &str,
    step_id: &str,
    context: &mut RuntimeContext,
    metrics: Value,
    service_context: Value,
) {
    if let Err(err) = deps
        .repo
        .update_run_step(
            run_step_id,
            RunStepPatch {
                metrics: Some(Some(metrics.clone())),
                context: Some(Some(service_context.clone())),
                ..Default::default()
            },
        )
        .await
    {
        warn!(step_id = %step_id, error = %err, "failed to persist invocation metrics");
    }
    let entry = context.steps.entry(step_id.to_string()).or_default();
    entry.metrics = Some(metrics);
    entry.service = Some(service_context);
}

fn asset_missing_from_body(body_text: &str) -> Option<(String, Option<String>)> {
    let value: Value = serde_json::from_str(body_text).ok()?;
    let failure_reason = value.get("failureReason").and_then(|v| v.as_str())?;
    if failure_reason != "asset_missing" {
        return None;
    }
    let asset_id = value.get("assetId").and_then(|v| v.as_str())?.to_string();
    let partition_key = value.get("partitionKey").and_then(|v| v.as_str()).map(String::from);
    Some((asset_id, partition_key))
}

async fn begin_asset_recovery(
    deps: &StepDeps,
    context: RuntimeContext,
    run: &WorkflowRun,
    run_step: &WorkflowRunStep,
    asset_id: &str,
    partition_key: Option<&str>,
) -> StepExecutionResult {
    match ensure_recovery_and_park(deps.repo.as_ref(), deps.queue.as_ref(), &deps.config, run, run_step, asset_id, partition_key)
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

#[allow(clippy::too_many_arguments)]
async fn succeed(
    deps: &StepDeps,
    definition: &WorkflowDefinition,
    run: &WorkflowRun,
    context: RuntimeContext,
    run_step: &WorkflowRunStep,
    step: &ServiceStepDefinition,
    prepared: &PreparedRequest,
    response: ServiceResponse,
    attempt: u32,
    descriptor: &ServiceDescriptor,
) -> StepExecutionResult {
    let response_size_bytes = response.body_text.len();
    let truncated = response_size_bytes > MAX_CAPTURED_BODY;
    let truncated_body = truncate(&response.body_text, MAX_CAPTURED_BODY);
    let parsed_body: Value = serde_json::from_str(&truncated_body).unwrap_or_else(|_| json!({"body": truncated_body}));

    let output = if step.capture_response {
        json!({"statusCode": response.status_code, "latencyMs": response.latency_ms, "body": parsed_body})
    } else {
        json!({"statusCode": response.status_code, "latencyMs": response.latency_ms})
    };

    let metrics = build_metrics(
        descriptor,
        attempt,
        Some(response.status_code),
        Some(response.latency_ms),
        Some(response_size_bytes),
        Some(truncated),
    );
    let service_context = build_service_context(descriptor, &prepared.request, Some(response.status_code), Some(response.latency_ms));

    let produced = persist_produced_assets(
        deps.repo.as_ref(),
        deps.queue.as_ref(),
        deps.events.as_ref(),
        &definition.id,
        run,
        &run_step.id,
        &step.id,
        &step.produces,
        &parsed_body,
    )
    .await;

    let mut context = context;
    let entry = context.steps.entry(step.id.clone()).or_default();
    entry.status = Some(WorkflowRunStepStatus::Succeeded);
    entry.output = Some(output.clone());
    entry.error_message = None;
    entry.failure_reason = None;
    entry.service = Some(service_context.clone());
    entry.metrics = Some(metrics.clone());
    if let Ok(assets) = &produced {
        entry.assets = assets.iter().map(|a| serde_json::to_value(a).unwrap_or(Value::Null)).collect();
    }

    let mut shared_patch = None;
    if let Some(store_as) = &step.store_response_as {
        context.shared.insert(store_as.clone(), output.clone());
        let mut patch = HashMap::new();
        patch.insert(store_as.clone(), output.clone());
        shared_patch = Some(patch);
    }

    StepExecutionResult {
        context,
        step_status: WorkflowRunStepStatus::Succeeded,
        completed: true,
        step_patch: RunStepPatch {
            status: Some(WorkflowRunStepStatus::Succeeded),
            output: Some(Some(output)),
            attempt: Some(attempt),
            retry_state: Some(RetryState::Completed),
            completed_at: Some(Some(Utc::now())),
            metrics: Some(Some(metrics)),
            context: Some(Some(service_context)),
            ..Default::default()
        },
        shared_patch,
        error_message: None,
        fan_out: None,
        scheduled_retry: None,
    }
}

fn terminal_job_failure(mut context: RuntimeContext, step_id: &str, message: String, failure_reason: &str) -> StepExecutionResult {
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

async fn prepare_service_request(
    deps: &StepDeps,
    step: &ServiceStepDefinition,
    scope: &TemplateScope,
) -> Result<PreparedRequest, StepError> {
    let mut tracker = ResolutionTracker::default();
    let path_value = resolve_json_templates(&Value::String(step.request.path.clone()), scope, &mut tracker);
    let path = path_value.as_str().map(String::from).unwrap_or_else(|| step.request.path.clone());

    let query_resolved = step.request.query.as_ref().map(|q| resolve_json_templates(q, scope, &mut tracker));
    let headers_resolved = step.request.headers.as_ref().map(|h| resolve_json_templates(h, scope, &mut tracker));
    let body_resolved = step.request.body.as_ref().map(|b| resolve_json_templates(b, scope, &mut tracker));

    if tracker.has_issues() {
        let summary = tracker
            .issues
            .iter()
            .map(|issue| format!("{}: {}", issue.path, issue.expression))
            .collect::<Vec<_>>()
            .join("; ");
        return Err(StepError::ParameterResolutionFailed(summary));
    }

    let full_path = match &query_resolved {
        Some(Value::Object(map)) if !map.is_empty() => format!("{path}?{}", build_query_string(map)),
        _ => path,
    };

    let (headers, sanitized_headers) = resolve_headers(deps, headers_resolved.as_ref()).await?;

    let default_method = if body_resolved.as_ref().is_some_and(|b| !b.is_null()) { "POST" } else { "GET" };

    Ok(PreparedRequest {
        request: ServiceRequest {
            method: step.request.method.clone().unwrap_or_else(|| default_method.to_string()).to_ascii_uppercase(),
            path: full_path,
            headers,
            body: body_resolved,
            timeout: Duration::from_millis(step.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS)),
        },
        sanitized_headers,
    })
}

fn build_query_string(map: &Map<String, Value>) -> String {
    map.iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(&stringify_query_value(v))))
        .collect::<Vec<_>>()
        .join("&")
}

fn stringify_query_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Resolves a header object into the outgoing `HeaderMap`-shaped map plus a
/// `sanitizedHeaders` view safe to persist: `{secret, prefix?}` entries
/// resolve through the secret store and appear masked, everything else
/// passes through as-is.
async fn resolve_headers(deps: &StepDeps, headers: Option<&Value>) -> Result<(HashMap<String, String>, Value), StepError> {
    let mut out = HashMap::new();
    let mut sanitized = Map::new();
    let Some(Value::Object(map)) = headers else { return Ok((out, Value::Object(sanitized))) };

    for (key, value) in map {
        match value {
            Value::Object(secret_ref) if secret_ref.contains_key("secret") => {
                let reference = secret_ref.get("secret").and_then(|v| v.as_str()).unwrap_or_default();
                let prefix = secret_ref.get("prefix").and_then(|v| v.as_str()).unwrap_or("");
                let resolved = deps
                    .secrets
                    .resolve_secret(reference, SecretAccessContext::default())
                    .await
                    .map_err(|e| StepError::ParameterResolutionFailed(format!("secret {reference}: {e}")))?;
                let secret_value = resolved.value.unwrap_or_default();
                out.insert(key.clone(), format!("{prefix}{secret_value}"));
                sanitized.insert(key.clone(), json!(format!("{prefix}{}", deps.secrets.mask_secret(&secret_value))));
            }
            Value::String(s) => {
                out.insert(key.clone(), s.clone());
                sanitized.insert(key.clone(), json!(s));
            }
            other => {
                let s = stringify_query_value(other);
                out.insert(key.clone(), s.clone());
                sanitized.insert(key.clone(), json!(s));
            }
        }
    }
    Ok((out, Value::Object(sanitized)))
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        s.chars().take(max).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorConfig;
    use crate::events::NullEventSink;
    use crate::model::{ServiceRequestSpec, WorkflowDefinition};
    use crate::persistence::{CreateRunInput, InMemoryRepository, InlineQueue};
    use crate::secrets::{NullSecretStore, ResolvedSecret, SecretError, SecretStore};
    use crate::services::{ServiceDescriptor, ServiceError, ServiceRegistry, ServiceStatus};
    use crate::worker::{InProcessJobRunner, JobRunnerConfig};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::Arc;

    enum Outcome {
        Ok(ServiceResponse),
        Err,
    }

    struct FakeService {
        status: ServiceStatus,
        outcome: Outcome,
        calls: Mutex<u32>,
    }

    #[async_trait]
    impl ServiceRegistry for FakeService {
        async fn get_service_by_slug(&self, slug: &str) -> Option<ServiceDescriptor> {
            Some(ServiceDescriptor { slug: slug.to_string(), base_url: "http://svc.local".into(), status: self.status })
        }

        async fn fetch_from_service(
            &self,
            _service: &ServiceDescriptor,
            _request: ServiceRequest,
        ) -> Result<ServiceResponse, ServiceError> {
            *self.calls.lock() += 1;
            match &self.outcome {
                Outcome::Ok(r) => Ok(r.clone()),
                Outcome::Err => Err(ServiceError::Network { slug: "svc".into(), message: "boom".into() }),
            }
        }
    }

    struct StaticSecretStore;

    #[async_trait]
    impl SecretStore for StaticSecretStore {
        async fn resolve_secret(&self, reference: &str, _ctx: SecretAccessContext) -> Result<ResolvedSecret, SecretError> {
            if reference == "api-key" {
                Ok(ResolvedSecret { value: Some("s3cr3t-value".into()) })
            } else {
                Err(SecretError::NotFound(reference.to_string()))
            }
        }
    }

    async fn deps_with(services: Arc<dyn ServiceRegistry>, secrets: Arc<dyn SecretStore>) -> StepDeps {
        let repo: Arc<dyn crate::persistence::RepositoryPort> = Arc::new(InMemoryRepository::new());
        let (queue, _rx) = InlineQueue::new();
        StepDeps {
            repo,
            queue: Arc::new(queue),
            job_runner: Arc::new(InProcessJobRunner::new(JobRunnerConfig::default())),
            services,
            secrets,
            events: Arc::new(NullEventSink),
            config: OrchestratorConfig::default(),
        }
    }

    fn spec(path: &str) -> ServiceStepDefinition {
        ServiceStepDefinition {
            id: "A".into(),
            service_slug: "svc".into(),
            request: ServiceRequestSpec { method: None, path: path.into(), query: None, headers: None, body: None },
            require_healthy: false,
            allow_degraded: false,
            capture_response: true,
            store_response_as: Some("resp".into()),
            retry_policy: None,
            timeout_ms: None,
            produces: vec![],
            depends_on: vec![],
        }
    }

    #[tokio::test]
    async fn successful_call_marks_step_succeeded_and_stores_response() {
        let service = Arc::new(FakeService {
            status: ServiceStatus::Healthy,
            outcome: Outcome::Ok(ServiceResponse {
                status_code: 200,
                content_type: Some("application/json".into()),
                body_text: "{\"ok\":true}".into(),
                latency_ms: 12,
            }),
            calls: Mutex::new(0),
        });
        let deps = deps_with(service.clone(), Arc::new(NullSecretStore)).await;
        let definition = WorkflowDefinition::new("def-1".into(), "slug".into(), 1, vec![]);
        deps.repo.create_definition(definition.clone()).await.unwrap();
        let run = deps.repo.create_run(&definition.id, CreateRunInput::default()).await.unwrap();

        let step = spec("/widgets");
        let result = execute(&deps, &definition, &run, RuntimeContext::default(), &step, None).await;
        assert_eq!(result.step_status, WorkflowRunStepStatus::Succeeded);
        assert!(result.completed);
        assert!(result.context.shared.contains_key("resp"));
        assert_eq!(*service.calls.lock(), 1);
    }

    #[tokio::test]
    async fn exhausted_attempts_fail_terminally() {
        let service = Arc::new(FakeService { status: ServiceStatus::Healthy, outcome: Outcome::Err, calls: Mutex::new(0) });
        let deps = deps_with(service, Arc::new(NullSecretStore)).await;
        let definition = WorkflowDefinition::new("def-1".into(), "slug".into(), 1, vec![]);
        deps.repo.create_definition(definition.clone()).await.unwrap();
        let run = deps.repo.create_run(&definition.id, CreateRunInput::default()).await.unwrap();

        let mut step = spec("/widgets");
        step.retry_policy = Some(StepRetryPolicy { max_attempts: Some(2), ..Default::default() });
        let result = execute(&deps, &definition, &run, RuntimeContext::default(), &step, None).await;
        assert_eq!(result.step_status, WorkflowRunStepStatus::Failed);
        assert!(result.completed);
    }

    #[tokio::test]
    async fn secret_header_resolves_and_is_masked_in_sanitized_view() {
        let deps = deps_with(
            Arc::new(FakeService {
                status: ServiceStatus::Healthy,
                outcome: Outcome::Ok(ServiceResponse {
                    status_code: 200,
                    content_type: None,
                    body_text: "{}".into(),
                    latency_ms: 1,
                }),
                calls: Mutex::new(0),
            }),
            Arc::new(StaticSecretStore),
        )
        .await;
        let mut step = spec("/widgets");
        step.request.headers =
            Some(json!({"Authorization": {"secret": "api-key", "prefix": "Bearer "}, "Accept": "application/json"}));

        let run = crate::model::WorkflowRun::new("run-1".into(), "def-1".into(), json!({}));
        let scope = build_scope(&run, &RuntimeContext::default(), &json!({}), None);
        let prepared = prepare_service_request(&deps, &step, &scope).await.unwrap();
        assert_eq!(prepared.request.headers.get("Authorization"), Some(&"Bearer s3cr3t-value".to_string()));
        let sanitized = prepared.sanitized_headers.get("Authorization").and_then(|v| v.as_str()).unwrap();
        assert!(sanitized.starts_with("Bearer s3"));
        assert!(!sanitized.contains("s3cr3t-value"));
    }

    #[test]
    fn query_string_is_url_encoded() {
        let mut map = Map::new();
        map.insert("q".into(), json!("a b"));
        assert_eq!(build_query_string(&map), "q=a%20b");
    }
}
