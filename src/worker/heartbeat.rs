//! Heartbeat monitor: a background loop that finds `running` steps whose
//! heartbeat has gone stale and either reschedules them for retry or marks
//! them failed. A `tokio::time::interval` tick races a `watch` shutdown
//! signal, retargeted from generic task reclamation onto
//! `find_stale_run_steps`/`WorkflowRunStep`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use crate::model::{RetryState, WorkflowRunHistoryEvent, WorkflowRunStepStatus};
use crate::persistence::{QueuePort, RepositoryPort, RunStepPatch};

pub struct HeartbeatMonitorConfig {
    pub check_interval: Duration,
    pub timeout: Duration,
    pub batch_size: usize,
}

impl Default for HeartbeatMonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_millis(15_000),
            timeout: Duration::from_millis(60_000),
            batch_size: 20,
        }
    }
}

pub struct HeartbeatMonitor<R: RepositoryPort, Q: QueuePort> {
    repo: Arc<R>,
    queue: Arc<Q>,
    config: HeartbeatMonitorConfig,
}

impl<R: RepositoryPort, Q: QueuePort> HeartbeatMonitor<R, Q> {
    pub fn new(repo: Arc<R>, queue: Arc<Q>, config: HeartbeatMonitorConfig) -> Self {
        Self { repo, queue, config }
    }

    pub fn spawn(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.check_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = self.tick().await {
                            error!(error = %err, "heartbeat monitor tick failed");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        info!("heartbeat monitor: shutdown requested");
                        break;
                    }
                }
            }
        })
    }

    #[instrument(skip(self))]
    async fn tick(&self) -> Result<(), crate::persistence::RepositoryError> {
        let cutoff = Utc::now() - chrono::Duration::from_std(self.config.timeout).unwrap_or_default();
        let stale = self.repo.find_stale_run_steps(cutoff, self.config.batch_size).await?;
        for (run_id, step_id) in stale {
            if let Err(err) = self.reconcile_one(&run_id, &step_id).await {
                warn!(run_id = %run_id, step_id = %step_id, error = %err, "heartbeat reconciliation failed");
            }
        }
        Ok(())
    }

    async fn reconcile_one(&self, run_id: &str, step_id: &str) -> Result<(), crate::persistence::RepositoryError> {
        let Some(run_step) = self.repo.get_run_step_by_step_id(run_id, step_id).await? else {
            return Ok(());
        };
        if run_step.status != WorkflowRunStepStatus::Running {
            return Ok(());
        }
        let run = self.repo.get_run(run_id).await?;
        if run.status != crate::model::RunStatus::Running {
            return Ok(());
        }

        let definition = self.repo.get_definition(&run.workflow_definition_id).await?;
        let max_attempts = definition
            .step(step_id)
            .and_then(|s| s.retry_policy())
            .and_then(|p| p.max_attempts);

        let next_retry_count = run_step.retry_count + 1;
        let retries_remain = max_attempts.map(|max| next_retry_count < max).unwrap_or(true);

        if retries_remain {
            self.repo
                .update_run_step(
                    &run_step.id,
                    RunStepPatch {
                        status: Some(WorkflowRunStepStatus::Pending),
                        attempt: Some(run_step.attempt + 1),
                        retry_count: Some(next_retry_count),
                        retry_state: Some(RetryState::Pending),
                        failure_reason: Some(Some("heartbeat-timeout".to_string())),
                        job_run_id: Some(None),
                        started_at: Some(None),
                        completed_at: Some(None),
                        last_heartbeat_at: Some(None),
                        ..Default::default()
                    },
                )
                .await?;
        } else {
            self.repo
                .update_run_step(
                    &run_step.id,
                    RunStepPatch {
                        status: Some(WorkflowRunStepStatus::Failed),
                        failure_reason: Some(Some("heartbeat-timeout".to_string())),
                        completed_at: Some(Some(Utc::now())),
                        ..Default::default()
                    },
                )
                .await?;
        }

        self.repo
            .append_history(WorkflowRunHistoryEvent::StepTimeout {
                workflow_run_id: run_id.to_string(),
                step_id: step_id.to_string(),
                at: Utc::now(),
            })
            .await?;
        self.repo
            .append_history(WorkflowRunHistoryEvent::RunReschedule {
                workflow_run_id: run_id.to_string(),
                reason: "heartbeat-timeout".to_string(),
                at: Utc::now(),
            })
            .await?;

        let _ = self.queue.enqueue_run(run_id, run.run_key.as_deref()).await;
        Ok(())
    }
}
