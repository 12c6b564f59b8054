use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use super::asset::WorkflowRunStepAsset;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Failed | RunStatus::Canceled)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowRunStepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RetryState {
    Pending,
    Scheduled,
    Completed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RunMetrics {
    #[serde(default)]
    pub total_steps: usize,
    #[serde(default)]
    pub completed_steps: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRun {
    pub id: String,
    pub workflow_definition_id: String,
    pub status: RunStatus,
    pub parameters: Value,
    pub context: RuntimeContext,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub current_step_id: Option<String>,
    #[serde(default)]
    pub current_step_index: Option<usize>,
    pub metrics: RunMetrics,
    #[serde(default)]
    pub triggered_by: Option<String>,
    #[serde(default)]
    pub trigger: Option<Value>,
    #[serde(default)]
    pub partition_key: Option<String>,
    #[serde(default)]
    pub run_key: Option<String>,
    #[serde(default)]
    pub run_key_normalized: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
}

impl WorkflowRun {
    pub fn new(id: String, workflow_definition_id: String, parameters: Value) -> Self {
        Self {
            id,
            workflow_definition_id,
            status: RunStatus::Pending,
            parameters,
            context: RuntimeContext::default(),
            output: None,
            error_message: None,
            current_step_id: None,
            current_step_index: None,
            metrics: RunMetrics::default(),
            triggered_by: None,
            trigger: None,
            partition_key: None,
            run_key: None,
            run_key_normalized: None,
            started_at: None,
            completed_at: None,
            duration_ms: None,
        }
    }
}

/// `{steps: map<stepId, StepRuntime>, shared?, lastUpdatedAt}`, serialized
/// into `WorkflowRun.context`. The orchestrator owns the in-memory copy for
/// the lifetime of one run; persisted context is always a snapshot of it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeContext {
    #[serde(default)]
    pub steps: HashMap<String, StepRuntime>,
    #[serde(default)]
    pub shared: HashMap<String, Value>,
    #[serde(default)]
    pub last_updated_at: Option<DateTime<Utc>>,
}

impl RuntimeContext {
    /// Cloning the context through a JSON round-trip, as the orchestrator
    /// does per step execution so that one step's handler cannot mutate
    /// another's view through shared references.
    pub fn json_roundtrip_clone(&self) -> Self {
        match serde_json::to_value(self).and_then(serde_json::from_value) {
            Ok(copy) => copy,
            Err(_) => self.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct StepRuntime {
    #[serde(default)]
    pub status: Option<WorkflowRunStepStatus>,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub service: Option<Value>,
    #[serde(default)]
    pub metrics: Option<Value>,
    #[serde(default)]
    pub assets: Vec<Value>,
    #[serde(default)]
    pub resolution_error: Option<bool>,
    #[serde(default)]
    pub error_stack: Option<String>,
    #[serde(default)]
    pub error_name: Option<String>,
    #[serde(default)]
    pub error_properties: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRunStep {
    pub id: String,
    pub workflow_run_id: String,
    pub step_id: String,
    pub status: WorkflowRunStepStatus,
    pub attempt: u32,
    pub retry_count: u32,
    pub retry_state: RetryState,
    #[serde(default)]
    pub next_attempt_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub retry_metadata: Option<Value>,
    #[serde(default)]
    pub job_run_id: Option<String>,
    #[serde(default)]
    pub input: Option<Value>,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub logs_url: Option<String>,
    #[serde(default)]
    pub metrics: Option<Value>,
    #[serde(default)]
    pub context: Option<Value>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub parent_step_id: Option<String>,
    #[serde(default)]
    pub fanout_index: Option<usize>,
    #[serde(default)]
    pub template_step_id: Option<String>,
    #[serde(default)]
    pub produced_assets: Vec<WorkflowRunStepAsset>,
}

impl WorkflowRunStep {
    pub fn new(id: String, workflow_run_id: String, step_id: String) -> Self {
        Self {
            id,
            workflow_run_id,
            step_id,
            status: WorkflowRunStepStatus::Pending,
            attempt: 1,
            retry_count: 0,
            retry_state: RetryState::Pending,
            next_attempt_at: None,
            retry_metadata: None,
            job_run_id: None,
            input: None,
            output: None,
            error_message: None,
            failure_reason: None,
            logs_url: None,
            metrics: None,
            context: None,
            started_at: None,
            completed_at: None,
            last_heartbeat_at: None,
            parent_step_id: None,
            fanout_index: None,
            template_step_id: None,
            produced_assets: Vec::new(),
        }
    }
}
