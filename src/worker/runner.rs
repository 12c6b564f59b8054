//! Job runner: `createJobRunForSlug`/`executeJobRun`, backed by an
//! in-process handler registry and a semaphore bounding concurrency.
//! A `Semaphore` gates concurrent executions, and handler registration
//! follows a `register_handler(name, closure)` pattern.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::activity::StepContext;
use crate::worker::{BackpressureConfig, BackpressureState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobRunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
    Expired,
}

impl JobRunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, JobRunStatus::Pending | JobRunStatus::Running)
    }
}

#[derive(Debug, Clone)]
pub struct BundleOverride {
    pub slug: String,
    pub version: Option<String>,
    pub export_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct JobRunRequest {
    pub job_slug: String,
    pub parameters: Value,
    pub timeout_ms: Option<u64>,
    pub max_attempts: Option<u32>,
    pub bundle: Option<BundleOverride>,
    pub workflow_run_id: String,
    pub run_step_id: String,
    pub step_id: String,
    pub attempt: u32,
}

#[derive(Debug, Clone)]
pub struct JobRun {
    pub id: String,
    pub status: JobRunStatus,
    pub result: Option<Value>,
    pub error_message: Option<String>,
    pub failure_reason: Option<String>,
    pub logs_url: Option<String>,
    pub metrics: Option<Value>,
    pub context: Option<Value>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub attempt: u32,
}

#[derive(Debug, Error)]
pub enum JobRunnerError {
    #[error("no handler registered for job slug {0}")]
    UnknownSlug(String),
    #[error("job run {0} not found")]
    RunNotFound(String),
    #[error("job run {0} timed out")]
    Timeout(String),
    #[error("job runner under backpressure: {0}")]
    Overloaded(String),
}

#[async_trait]
pub trait JobRunner: Send + Sync + 'static {
    async fn create_job_run_for_slug(&self, request: JobRunRequest) -> Result<JobRun, JobRunnerError>;
    async fn execute_job_run(&self, id: &str) -> Result<JobRun, JobRunnerError>;
}

pub type JobHandlerFn =
    Arc<dyn Fn(StepContext, Value) -> futures::future::BoxFuture<'static, Result<Value, String>> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct JobRunnerConfig {
    pub max_concurrency: usize,
    pub backpressure: BackpressureConfig,
}

impl Default for JobRunnerConfig {
    fn default() -> Self {
        Self { max_concurrency: 10, backpressure: BackpressureConfig::default() }
    }
}

impl JobRunnerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max.max(1);
        self
    }
}

/// In-process job runner: handlers registered per slug, each execution
/// bounded by a shared semaphore so a burst of job steps cannot overrun the
/// process.
pub struct InProcessJobRunner {
    handlers: RwLock<HashMap<String, JobHandlerFn>>,
    runs: Arc<RwLock<HashMap<String, JobRun>>>,
    semaphore: Arc<Semaphore>,
    backpressure: Arc<BackpressureState>,
}

impl InProcessJobRunner {
    pub fn new(config: JobRunnerConfig) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            runs: Arc::new(RwLock::new(HashMap::new())),
            semaphore: Arc::new(Semaphore::new(config.max_concurrency)),
            backpressure: Arc::new(BackpressureState::new(config.backpressure, config.max_concurrency)),
        }
    }

    pub fn register_handler<F, Fut>(&self, slug: impl Into<String>, handler: F)
    where
        F: Fn(StepContext, Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, String>> + Send + 'static,
    {
        let boxed: JobHandlerFn = Arc::new(move |ctx, params| Box::pin(handler(ctx, params)));
        self.handlers.write().insert(slug.into(), boxed);
    }
}

#[async_trait]
impl JobRunner for InProcessJobRunner {
    async fn create_job_run_for_slug(&self, request: JobRunRequest) -> Result<JobRun, JobRunnerError> {
        if !self.backpressure.should_accept() {
            let reason = self.backpressure.backpressure_reason().unwrap_or_else(|| "load too high".to_string());
            return Err(JobRunnerError::Overloaded(reason));
        }

        let handler = self
            .handlers
            .read()
            .get(&request.job_slug)
            .cloned()
            .ok_or_else(|| JobRunnerError::UnknownSlug(request.job_slug.clone()))?;

        let run_id = Uuid::now_v7().to_string();
        let run = JobRun {
            id: run_id.clone(),
            status: JobRunStatus::Pending,
            result: None,
            error_message: None,
            failure_reason: None,
            logs_url: None,
            metrics: None,
            context: None,
            started_at: Utc::now(),
            completed_at: None,
            attempt: request.attempt,
        };
        self.runs.write().insert(run_id.clone(), run.clone());

        let semaphore = self.semaphore.clone();
        let backpressure = self.backpressure.clone();
        let runs = self.runs.clone();
        let timeout = request.timeout_ms.map(Duration::from_millis);
        backpressure.task_started();
        tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            let ctx = StepContext::new(
                request.workflow_run_id,
                request.run_step_id,
                request.step_id,
                request.attempt,
                request.max_attempts,
            );
            let exec = handler(ctx, request.parameters);
            let outcome = match timeout {
                Some(d) => tokio::time::timeout(d, exec).await.unwrap_or(Err("job timed out".to_string())),
                None => exec.await,
            };
            {
                let mut runs = runs.write();
                if let Some(run) = runs.get_mut(&run_id) {
                    run.completed_at = Some(Utc::now());
                    match outcome {
                        Ok(value) => {
                            run.status = JobRunStatus::Succeeded;
                            run.result = Some(value);
                        }
                        Err(message) => {
                            run.status = JobRunStatus::Failed;
                            run.error_message = Some(message);
                        }
                    }
                }
            }
            backpressure.task_completed();
        });

        Ok(run)
    }

    async fn execute_job_run(&self, id: &str) -> Result<JobRun, JobRunnerError> {
        loop {
            {
                let runs = self.runs.read();
                let run = runs.get(id).ok_or_else(|| JobRunnerError::RunNotFound(id.to_string()))?;
                if run.status.is_terminal() {
                    return Ok(run.clone());
                }
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn registered_handler_produces_succeeded_run() {
        let runner = InProcessJobRunner::new(JobRunnerConfig::default());
        runner.register_handler("echo", |_ctx, params| async move { Ok(params) });
        let run = runner
            .create_job_run_for_slug(JobRunRequest {
                job_slug: "echo".into(),
                parameters: json!({"a": 1}),
                timeout_ms: None,
                max_attempts: Some(1),
                bundle: None,
                workflow_run_id: "run-1".into(),
                run_step_id: "rs-1".into(),
                step_id: "A".into(),
                attempt: 1,
            })
            .await
            .unwrap();
        let terminal = runner.execute_job_run(&run.id).await.unwrap();
        assert_eq!(terminal.status, JobRunStatus::Succeeded);
        assert_eq!(terminal.result, Some(json!({"a": 1})));
    }

    #[tokio::test]
    async fn unknown_slug_rejected() {
        let runner = InProcessJobRunner::new(JobRunnerConfig::default());
        let err = runner
            .create_job_run_for_slug(JobRunRequest {
                job_slug: "missing".into(),
                parameters: json!({}),
                timeout_ms: None,
                max_attempts: None,
                bundle: None,
                workflow_run_id: "run-1".into(),
                run_step_id: "rs-1".into(),
                step_id: "A".into(),
                attempt: 1,
            })
            .await;
        assert!(matches!(err, Err(JobRunnerError::UnknownSlug(_))));
    }
}
