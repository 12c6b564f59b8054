//! Queue port: `workflow.run` and `asset.expiry` job submission, plus an
//! inline in-process mode backed by `tokio::time::sleep` tasks instead of an
//! external broker. Named jobs with idempotent-by-id delayed scheduling
//! instead of worker claims.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue send failed: {0}")]
    SendFailed(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AssetExpiryReason {
    Ttl,
    Cadence,
    Manual,
}

impl AssetExpiryReason {
    pub fn as_str(self) -> &'static str {
        match self {
            AssetExpiryReason::Ttl => "ttl",
            AssetExpiryReason::Cadence => "cadence",
            AssetExpiryReason::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetExpiryPayload {
    pub asset_key: String,
    pub reason: AssetExpiryReason,
    pub requested_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub asset: Value,
}

/// What fired: either a run worth (re-)scheduling, or an asset-expiry event
/// carrying its original produced metadata plus reason/timing.
#[derive(Debug, Clone)]
pub enum QueuedJob {
    RunWorkflow { run_id: String, run_key: Option<String> },
    AssetExpiry(AssetExpiryPayload),
}

#[async_trait]
pub trait QueuePort: Send + Sync + 'static {
    async fn enqueue_run(&self, run_id: &str, run_key: Option<&str>) -> Result<(), QueueError>;
    async fn schedule_retry(&self, run_id: &str, run_at: DateTime<Utc>) -> Result<(), QueueError>;
    async fn schedule_asset_expiry(&self, job_id: &str, payload: AssetExpiryPayload, delay: Duration) -> Result<(), QueueError>;
    async fn cancel_job(&self, job_id: &str) -> Result<(), QueueError>;
}

/// In-process inline queue: `enqueue`/`scheduleRetry` fire immediately or
/// after a `tokio::time::sleep`, delivering [`QueuedJob`]s over an mpsc
/// channel a run worker drains. Idempotent on job id: re-adding an id that
/// already has a pending delayed task is a no-op; `cancel_job` aborts it.
pub struct InlineQueue {
    sender: mpsc::UnboundedSender<QueuedJob>,
    pending: Arc<Mutex<std::collections::HashMap<String, JoinHandle<()>>>>,
}

impl InlineQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<QueuedJob>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender, pending: Arc::new(Mutex::new(std::collections::HashMap::new())) }, receiver)
    }

    fn schedule(&self, job_id: String, delay: Duration, job: QueuedJob) {
        let sender = self.sender.clone();
        let pending = self.pending.clone();
        let job_id_for_task = job_id.clone();
        let handle = tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let _ = sender.send(job);
            pending.lock().remove(&job_id_for_task);
        });
        if let Some(previous) = self.pending.lock().insert(job_id, handle) {
            previous.abort();
        }
    }
}

#[async_trait]
impl QueuePort for InlineQueue {
    async fn enqueue_run(&self, run_id: &str, run_key: Option<&str>) -> Result<(), QueueError> {
        self.schedule(
            format!("run:{run_id}"),
            Duration::ZERO,
            QueuedJob::RunWorkflow { run_id: run_id.to_string(), run_key: run_key.map(String::from) },
        );
        Ok(())
    }

    async fn schedule_retry(&self, run_id: &str, run_at: DateTime<Utc>) -> Result<(), QueueError> {
        let delay = (run_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        self.schedule(
            format!("retry:{run_id}:{}", run_at.timestamp_millis()),
            delay,
            QueuedJob::RunWorkflow { run_id: run_id.to_string(), run_key: None },
        );
        Ok(())
    }

    async fn schedule_asset_expiry(&self, job_id: &str, payload: AssetExpiryPayload, delay: Duration) -> Result<(), QueueError> {
        self.schedule(job_id.to_string(), delay, QueuedJob::AssetExpiry(payload));
        Ok(())
    }

    async fn cancel_job(&self, job_id: &str) -> Result<(), QueueError> {
        if let Some(handle) = self.pending.lock().remove(job_id) {
            handle.abort();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn enqueue_run_delivers_job() {
        let (queue, mut rx) = InlineQueue::new();
        queue.enqueue_run("run-1", None).await.unwrap();
        let job = rx.recv().await.unwrap();
        matches!(job, QueuedJob::RunWorkflow { run_id, .. } if run_id == "run-1");
    }

    #[tokio::test]
    async fn cancel_prevents_delivery() {
        let (queue, mut rx) = InlineQueue::new();
        queue
            .schedule_asset_expiry(
                "ttl:asset",
                AssetExpiryPayload {
                    asset_key: "asset".into(),
                    reason: AssetExpiryReason::Ttl,
                    requested_at: Utc::now(),
                    expires_at: Utc::now(),
                    asset: Value::Null,
                },
                Duration::from_millis(200),
            )
            .await
            .unwrap();
        queue.cancel_job("ttl:asset").await.unwrap();
        let result = tokio::time::timeout(Duration::from_millis(300), rx.recv()).await;
        assert!(result.is_err(), "canceled job should not be delivered");
    }
}
