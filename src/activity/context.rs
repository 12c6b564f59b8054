//! Step execution context, handed to job handlers running in-process.
//! An attempt counter, a heartbeat channel, and a cancellation flag,
//! keyed on this system's run/run-step id pair.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct HeartbeatPayload {
    pub details: Option<serde_json::Value>,
}

#[derive(Debug, thiserror::Error)]
pub enum HeartbeatError {
    #[error("heartbeat channel closed")]
    ChannelClosed,
    #[error("step was cancelled")]
    Cancelled,
}

/// Context handed to a job handler for the duration of one attempt.
#[derive(Debug)]
pub struct StepContext {
    pub workflow_run_id: String,
    pub run_step_id: String,
    pub step_id: String,
    pub attempt: u32,
    pub max_attempts: Option<u32>,
    heartbeat_tx: Option<mpsc::Sender<HeartbeatPayload>>,
    cancelled: Arc<AtomicBool>,
}

impl StepContext {
    pub fn new(workflow_run_id: String, run_step_id: String, step_id: String, attempt: u32, max_attempts: Option<u32>) -> Self {
        Self {
            workflow_run_id,
            run_step_id,
            step_id,
            attempt,
            max_attempts,
            heartbeat_tx: None,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_heartbeat(mut self, tx: mpsc::Sender<HeartbeatPayload>) -> Self {
        self.heartbeat_tx = Some(tx);
        self
    }

    pub fn cancellation_handle(&self) -> CancellationHandle {
        CancellationHandle { cancelled: self.cancelled.clone() }
    }

    pub async fn heartbeat(&self, details: Option<serde_json::Value>) -> Result<(), HeartbeatError> {
        if self.is_cancelled() {
            return Err(HeartbeatError::Cancelled);
        }
        if let Some(tx) = &self.heartbeat_tx {
            tx.send(HeartbeatPayload { details }).await.map_err(|_| HeartbeatError::ChannelClosed)?;
        }
        Ok(())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn is_last_attempt(&self) -> bool {
        match self.max_attempts {
            Some(max) => self.attempt >= max,
            None => false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CancellationHandle {
    cancelled: Arc<AtomicBool>,
}

impl CancellationHandle {
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_attempt_is_unbounded_without_max() {
        let ctx = StepContext::new("run".into(), "rs".into(), "A".into(), 50, None);
        assert!(!ctx.is_last_attempt());
    }

    #[test]
    fn last_attempt_detected_with_max() {
        let ctx = StepContext::new("run".into(), "rs".into(), "A".into(), 3, Some(3));
        assert!(ctx.is_last_attempt());
    }

    #[tokio::test]
    async fn heartbeat_rejected_once_cancelled() {
        let ctx = StepContext::new("run".into(), "rs".into(), "A".into(), 1, Some(3));
        ctx.cancellation_handle().cancel();
        let result = ctx.heartbeat(None).await;
        assert!(matches!(result, Err(HeartbeatError::Cancelled)));
    }
}
