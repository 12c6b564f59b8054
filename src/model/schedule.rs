use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MaterializedWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowSchedule {
    pub id: String,
    pub workflow_definition_id: String,
    pub cron: String,
    pub timezone: String,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub start_window: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_window: Option<DateTime<Utc>>,
    pub catch_up: bool,
    pub is_active: bool,
    #[serde(default)]
    pub next_run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub catchup_cursor: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_materialized_window: Option<MaterializedWindow>,
    pub updated_at: DateTime<Utc>,
}
