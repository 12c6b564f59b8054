use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Append-only history row for a run: every status transition and
/// reschedule gets a durable, queryable record instead of only the
/// latest status on the run itself.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowRunHistoryEvent {
    RunStatus {
        workflow_run_id: String,
        status: String,
        at: DateTime<Utc>,
    },
    StepTimeout {
        workflow_run_id: String,
        step_id: String,
        at: DateTime<Utc>,
    },
    RunReschedule {
        workflow_run_id: String,
        reason: String,
        at: DateTime<Utc>,
    },
}

impl WorkflowRunHistoryEvent {
    pub fn workflow_run_id(&self) -> &str {
        match self {
            WorkflowRunHistoryEvent::RunStatus { workflow_run_id, .. }
            | WorkflowRunHistoryEvent::StepTimeout { workflow_run_id, .. }
            | WorkflowRunHistoryEvent::RunReschedule { workflow_run_id, .. } => workflow_run_id,
        }
    }
}
