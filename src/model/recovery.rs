use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowAssetRecoveryRequest {
    pub id: String,
    pub asset_id: String,
    pub partition_key_normalized: String,
    /// Definition id of the producer workflow that will materialize the asset.
    pub workflow_definition_id: String,
    pub status: RecoveryStatus,
    #[serde(default)]
    pub recovery_workflow_run_id: Option<String>,
    pub requested_by_workflow_run_id: String,
    pub requested_by_workflow_run_step_id: String,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub last_attempt_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}
