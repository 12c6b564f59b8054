//! Event emission port. The orchestrator and asset subsystem publish
//! informational events; nothing downstream of this crate is assumed, so an
//! implementation can fan them out to a message bus, a webhook dispatcher,
//! or (in tests) a `Vec` the test inspects.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum WorkflowEvent {
    #[serde(rename = "workflow.run.updated")]
    RunUpdated { run_id: String, status: String },
    #[serde(rename = "workflow.run.status")]
    RunStatus { run_id: String, status: String },
    #[serde(rename = "workflow.definition.updated")]
    DefinitionUpdated { definition_id: String },
    #[serde(rename = "asset.produced")]
    AssetProduced { asset_id: String, partition_key: Option<String>, run_id: String },
    #[serde(rename = "asset.expired")]
    AssetExpired { asset_id: String, partition_key: Option<String>, reason: String, payload: Value },
    #[serde(rename = "workflow.analytics.snapshot")]
    AnalyticsSnapshot { payload: Value },
}

#[async_trait]
pub trait EventSink: Send + Sync + 'static {
    async fn emit(&self, event: WorkflowEvent);
}

/// Discards every event. Used where a deployment has not wired up a real
/// sink yet but the orchestrator still needs something to call.
pub struct NullEventSink;

#[async_trait]
impl EventSink for NullEventSink {
    async fn emit(&self, _event: WorkflowEvent) {}
}

/// In-memory sink for tests: records every emitted event in arrival order.
#[derive(Default)]
pub struct RecordingEventSink {
    events: parking_lot::Mutex<Vec<WorkflowEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<WorkflowEvent> {
        self.events.lock().clone()
    }
}

#[async_trait]
impl EventSink for RecordingEventSink {
    async fn emit(&self, event: WorkflowEvent) {
        self.events.lock().push(event);
    }
}
