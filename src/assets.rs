//! Asset subsystem: extracts declared assets from a succeeded step's
//! result, persists them, schedules TTL/cadence expiry jobs, and clears any
//! stale-partition flag for the partition just reproduced.
//!
//! Plain free functions over `serde_json::Value`, no derive-heavy builder
//! types, applied to this system's `AssetDeclaration`/`produces` vocabulary.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::events::{EventSink, WorkflowEvent};
use crate::model::{
    normalize_asset_id, normalize_partition_key, AssetDeclaration, AssetDirection, Freshness, WorkflowRun,
    WorkflowRunStepAsset,
};
use crate::persistence::{AssetExpiryPayload, AssetExpiryReason, NewAsset, QueueError, QueuePort, RepositoryPort};

#[derive(Debug, Clone)]
pub struct ExtractedAsset {
    pub asset_id: String,
    pub payload: Value,
    pub schema: Option<Value>,
    pub freshness: Option<Freshness>,
    pub produced_at: DateTime<Utc>,
    pub partition_key: Option<String>,
}

fn rest_minus_metadata(map: &serde_json::Map<String, Value>) -> Value {
    const METADATA_KEYS: &[&str] =
        &["assetId", "asset_id", "schema", "producedAt", "produced_at", "partitionKey", "partition_key", "payload"];
    let mut rest = map.clone();
    for key in METADATA_KEYS {
        rest.remove(*key);
    }
    Value::Object(rest)
}

/// Walks a step result looking for asset contributions, across the four
/// shapes supported: an array of `{assetId, ...}` entries, a single
/// top-level `{assetId, ...}` object, an object wrapping an `assets` key, or
/// an object whose own keys name declared asset ids.
fn collect_contributions(result: &Value, declared: &[(String, &AssetDeclaration)]) -> Vec<(String, Value)> {
    match result {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| {
                let id = item.get("assetId").or_else(|| item.get("asset_id"))?.as_str()?.to_string();
                Some((id, item.clone()))
            })
            .collect(),
        Value::Object(map) => {
            if let Some(id) = map.get("assetId").or_else(|| map.get("asset_id")).and_then(|v| v.as_str()) {
                return vec![(id.to_string(), result.clone())];
            }
            if let Some(assets) = map.get("assets") {
                return collect_contributions(assets, declared);
            }
            declared
                .iter()
                .filter_map(|(normalized, decl)| {
                    map.iter().find(|(k, _)| normalize_asset_id(k) == *normalized).map(|(k, v)| {
                        let _ = decl;
                        (k.clone(), v.clone())
                    })
                })
                .collect()
        }
        _ => Vec::new(),
    }
}

fn build_extracted_asset(decl: &AssetDeclaration, entry: &Value, run: &WorkflowRun) -> Result<ExtractedAsset, String> {
    let payload = match entry {
        Value::Object(map) => map.get("payload").cloned().unwrap_or_else(|| rest_minus_metadata(map)),
        other => other.clone(),
    };
    let schema = entry.get("schema").cloned().or_else(|| decl.schema.clone());
    let produced_at = entry
        .get("producedAt")
        .or_else(|| entry.get("produced_at"))
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);
    let explicit_key = entry
        .get("partitionKey")
        .or_else(|| entry.get("partition_key"))
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from);
    let partition_key = explicit_key.or_else(|| run.partition_key.clone());
    if decl.partitioning.is_some() && partition_key.is_none() {
        return Err(format!("Partition key required for asset {}", decl.asset_id()));
    }
    Ok(ExtractedAsset {
        asset_id: decl.asset_id().to_string(),
        payload,
        schema,
        freshness: decl.freshness.clone(),
        produced_at,
        partition_key,
    })
}

/// `extractProducedAssetsFromResult`: only `produces`-direction
/// declarations are eligible; a result carrying no matching contribution
/// yields an empty list, never an error.
pub fn extract_produced_assets_from_result(
    declarations: &[AssetDeclaration],
    result: &Value,
    run: &WorkflowRun,
) -> Result<Vec<ExtractedAsset>, String> {
    let declared: Vec<(String, &AssetDeclaration)> = declarations
        .iter()
        .filter(|d| d.direction == AssetDirection::Produces)
        .map(|d| (d.asset_id_normalized(), d))
        .collect();
    if declared.is_empty() {
        return Ok(Vec::new());
    }
    let mut out = Vec::new();
    for (raw_id, entry) in collect_contributions(result, &declared) {
        let normalized = normalize_asset_id(&raw_id);
        if let Some((_, decl)) = declared.iter().find(|(n, _)| *n == normalized) {
            out.push(build_extracted_asset(decl, &entry, run)?);
        }
    }
    Ok(out)
}

fn asset_expiry_job_id(reason: AssetExpiryReason, definition_id: &str, asset_id: &str, partition_key_normalized: &str) -> String {
    format!("{}:{definition_id}:{}:{partition_key_normalized}", reason.as_str(), normalize_asset_id(asset_id))
}

/// Schedules at most two asset-expiry jobs (`ttl`, `cadence`) for one
/// produced asset-partition. Re-scheduling under the same job id replaces
/// any job already pending for that reason (see [`QueuePort`]).
pub async fn schedule_asset_freshness(
    queue: &dyn QueuePort,
    definition_id: &str,
    asset: &ExtractedAsset,
) -> Result<(), QueueError> {
    let Some(freshness) = &asset.freshness else { return Ok(()) };
    let partition_norm = normalize_partition_key(asset.partition_key.as_deref()).unwrap_or_default();
    let asset_key = format!("{definition_id}:{}:{partition_norm}", normalize_asset_id(&asset.asset_id));
    let payload_value = serde_json::json!({
        "assetId": asset.asset_id,
        "partitionKey": asset.partition_key,
        "payload": asset.payload,
        "producedAt": asset.produced_at,
    });

    if let Some(ttl) = freshness.ttl_ms {
        let expires_at = asset.produced_at + chrono::Duration::milliseconds(ttl as i64);
        queue
            .schedule_asset_expiry(
                &asset_expiry_job_id(AssetExpiryReason::Ttl, definition_id, &asset.asset_id, &partition_norm),
                AssetExpiryPayload {
                    asset_key: asset_key.clone(),
                    reason: AssetExpiryReason::Ttl,
                    requested_at: asset.produced_at,
                    expires_at,
                    asset: payload_value.clone(),
                },
                Duration::from_millis(ttl),
            )
            .await?;
    }
    if let Some(cadence) = freshness.cadence_ms {
        let expires_at = asset.produced_at + chrono::Duration::milliseconds(cadence as i64);
        queue
            .schedule_asset_expiry(
                &asset_expiry_job_id(AssetExpiryReason::Cadence, definition_id, &asset.asset_id, &partition_norm),
                AssetExpiryPayload {
                    asset_key,
                    reason: AssetExpiryReason::Cadence,
                    requested_at: asset.produced_at,
                    expires_at,
                    asset: payload_value,
                },
                Duration::from_millis(cadence),
            )
            .await?;
    }
    Ok(())
}

/// Full pipeline for a succeeded step's declared `produces`: extract,
/// persist (replacing any prior rows for this step), clear the matching
/// stale-partition flag, schedule freshness, and emit `asset.produced`.
pub async fn persist_produced_assets(
    repo: &dyn RepositoryPort,
    queue: &dyn QueuePort,
    events: &dyn EventSink,
    definition_id: &str,
    run: &WorkflowRun,
    run_step_id: &str,
    step_id: &str,
    declarations: &[AssetDeclaration],
    result: &Value,
) -> Result<Vec<WorkflowRunStepAsset>, String> {
    let extracted = extract_produced_assets_from_result(declarations, result, run)?;
    if extracted.is_empty() {
        repo.record_step_assets(definition_id, &run.id, run_step_id, step_id, Vec::new())
            .await
            .map_err(|e| e.to_string())?;
        return Ok(Vec::new());
    }

    let new_assets: Vec<NewAsset> = extracted
        .iter()
        .map(|a| NewAsset {
            asset_id: a.asset_id.clone(),
            payload: a.payload.clone(),
            schema: a.schema.clone(),
            freshness: a.freshness.clone(),
            partition_key: a.partition_key.clone(),
            produced_at: a.produced_at,
        })
        .collect();
    let persisted = repo
        .record_step_assets(definition_id, &run.id, run_step_id, step_id, new_assets)
        .await
        .map_err(|e| e.to_string())?;

    for asset in &extracted {
        let _ = repo.clear_stale_partition(definition_id, &asset.asset_id, asset.partition_key.as_deref()).await;
        if let Err(err) = schedule_asset_freshness(queue, definition_id, asset).await {
            tracing::warn!(asset_id = %asset.asset_id, error = %err, "failed to schedule asset freshness");
        }
        events
            .emit(WorkflowEvent::AssetProduced {
                asset_id: asset.asset_id.clone(),
                partition_key: asset.partition_key.clone(),
                run_id: run.id.clone(),
            })
            .await;
    }
    Ok(persisted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AssetDeclaration, AssetDirection};
    use serde_json::json;

    fn run() -> WorkflowRun {
        WorkflowRun::new("run-1".into(), "def-1".into(), json!({}))
    }

    #[test]
    fn single_object_form_extracts_one_asset() {
        let decls = vec![AssetDeclaration::new("inventory.dataset", AssetDirection::Produces)];
        let result = json!({"assetId": "inventory.dataset", "rows": 3});
        let extracted = extract_produced_assets_from_result(&decls, &result, &run()).unwrap();
        assert_eq!(extracted.len(), 1);
        assert_eq!(extracted[0].asset_id, "inventory.dataset");
        assert_eq!(extracted[0].payload, json!({"rows": 3}));
    }

    #[test]
    fn array_form_extracts_each_matching_entry() {
        let decls = vec![
            AssetDeclaration::new("a", AssetDirection::Produces),
            AssetDeclaration::new("b", AssetDirection::Produces),
        ];
        let result = json!([{"assetId": "a", "x": 1}, {"assetId": "b", "x": 2}, {"assetId": "c", "x": 3}]);
        let extracted = extract_produced_assets_from_result(&decls, &result, &run()).unwrap();
        assert_eq!(extracted.len(), 2);
    }

    #[test]
    fn keyed_object_form_matches_declared_keys() {
        let decls = vec![AssetDeclaration::new("Inventory", AssetDirection::Produces)];
        let result = json!({"Inventory": {"rows": 7}, "unrelated": 1});
        let extracted = extract_produced_assets_from_result(&decls, &result, &run()).unwrap();
        assert_eq!(extracted.len(), 1);
        assert_eq!(extracted[0].payload, json!({"rows": 7}));
    }

    #[test]
    fn partitioned_asset_without_key_errors() {
        use crate::model::{AssetPartitioning, PartitioningType};
        let mut decl = AssetDeclaration::new("daily.metrics", AssetDirection::Produces);
        decl.partitioning = Some(AssetPartitioning { kind: PartitioningType::Static, granularity: None, timezone: None });
        let result = json!({"assetId": "daily.metrics", "rows": 1});
        let err = extract_produced_assets_from_result(&[decl], &result, &run()).unwrap_err();
        assert!(err.contains("Partition key required"));
    }
}
