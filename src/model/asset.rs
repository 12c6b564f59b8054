use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AssetDirection {
    Produces,
    Consumes,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum PartitioningType {
    Static,
    TimeWindow,
    Dynamic,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AssetPartitioning {
    #[serde(rename = "type")]
    pub kind: PartitioningType,
    #[serde(default)]
    pub granularity: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Freshness {
    #[serde(default)]
    pub ttl_ms: Option<u64>,
    #[serde(default)]
    pub cadence_ms: Option<u64>,
    #[serde(default)]
    pub max_age_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AssetDeclaration {
    asset_id: String,
    pub direction: AssetDirection,
    #[serde(default)]
    pub schema: Option<Value>,
    #[serde(default)]
    pub freshness: Option<Freshness>,
    #[serde(default)]
    pub auto_materialize: bool,
    #[serde(default)]
    pub partitioning: Option<AssetPartitioning>,
}

impl AssetDeclaration {
    pub fn new(asset_id: impl Into<String>, direction: AssetDirection) -> Self {
        Self {
            asset_id: asset_id.into().trim().to_string(),
            direction,
            schema: None,
            freshness: None,
            auto_materialize: false,
            partitioning: None,
        }
    }

    /// Asset id as stored, trimmed but case-preserved.
    pub fn asset_id(&self) -> &str {
        &self.asset_id
    }

    pub fn asset_id_normalized(&self) -> String {
        super::normalize_asset_id(&self.asset_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRunStepAsset {
    pub id: String,
    pub workflow_definition_id: String,
    pub workflow_run_id: String,
    pub workflow_run_step_id: String,
    pub step_id: String,
    pub asset_id: String,
    pub payload: Value,
    #[serde(default)]
    pub schema: Option<Value>,
    #[serde(default)]
    pub freshness: Option<Freshness>,
    #[serde(default)]
    pub partition_key: Option<String>,
    pub produced_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowAssetStalePartition {
    pub workflow_definition_id: String,
    pub asset_id: String,
    pub partition_key_normalized: String,
    #[serde(default)]
    pub partition_key: Option<String>,
    pub requested_at: DateTime<Utc>,
    #[serde(default)]
    pub requested_by: Option<String>,
    #[serde(default)]
    pub note: Option<String>,
}
