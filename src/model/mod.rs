//! Persisted and in-memory data types shared across every component.
//!
//! These mirror the entities a relational store would hold: workflow
//! definitions, runs, steps, assets, schedules and recovery requests. All
//! dynamic payloads use `serde_json::Value` rather than a bespoke sum type,
//! matching how the rest of the stack already treats parameters/context/
//! output/metrics.

mod definition;
mod run;
mod asset;
mod schedule;
mod recovery;
mod history;

pub use definition::{
    BundleRef, Dag, FanOutStepDefinition, FanOutTemplate, JobStepDefinition,
    RetryPolicy as StepRetryPolicy, RetryStrategy, ServiceRequestSpec, ServiceStepDefinition,
    StepDefinition, WorkflowDefinition,
};
pub use asset::{
    AssetDeclaration, AssetDirection, AssetPartitioning, Freshness, PartitioningType,
    WorkflowAssetStalePartition, WorkflowRunStepAsset,
};
pub use run::{
    RunMetrics, RunStatus, RuntimeContext, StepRuntime, WorkflowRun, WorkflowRunStep,
    WorkflowRunStepStatus, RetryState,
};
pub use schedule::{MaterializedWindow, WorkflowSchedule};
pub use recovery::{RecoveryStatus, WorkflowAssetRecoveryRequest};
pub use history::WorkflowRunHistoryEvent;

/// Normalizes an asset id for case-insensitive lookup while preserving the
/// originally supplied casing wherever it is stored back.
pub fn normalize_asset_id(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}

/// Normalizes a partition key the same way asset ids are normalized:
/// trimmed, lower-cased, `None` stays `None`.
pub fn normalize_partition_key(raw: Option<&str>) -> Option<String> {
    raw.map(|s| s.trim().to_ascii_lowercase()).filter(|s| !s.is_empty())
}
