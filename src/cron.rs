//! Cron scheduler: materializes workflow runs for active schedules
//! whose `nextRunAt` has elapsed, with optional catch-up over missed
//! windows. Grounded on [`crate::worker::heartbeat::HeartbeatMonitor`]'s
//! tick-loop shape (an interval tick racing a `watch` shutdown signal) and
//! on [`crate::recovery`]'s idempotent-by-`runKey` run creation, retargeted
//! at `schedule:<scheduleId>:<windowKey>` keys. Leader election is left to
//! the optimistic `updatedAt` guard on [`RepositoryPort::update_schedule`]:
//! every process ticks every schedule, and only the first to win the
//! compare-and-swap advances its cursor, so running more than one scheduler
//! is safe without a true distributed lock (see `scheduler_advisory_locks`
//! in [`OrchestratorConfig`], reserved for a Postgres-backed implementation
//! that wants a real `pg_advisory_lock` instead).

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronExpr;
use serde_json::json;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, instrument, warn};

use crate::config::OrchestratorConfig;
use crate::model::{MaterializedWindow, WorkflowSchedule};
use crate::persistence::{CreateRunInput, DueSchedulesQuery, QueuePort, RepositoryError, RepositoryPort};

#[derive(Debug, Error)]
pub enum CronError {
    #[error("invalid cron expression {expr}: {source}")]
    InvalidExpression { expr: String, source: String },
    #[error("invalid timezone {0}")]
    InvalidTimezone(String),
    #[error("schedule metadata changed concurrently")]
    MetadataConflict,
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

pub struct CronSchedulerConfig {
    pub tick_interval: Duration,
    pub batch_size: usize,
    pub max_catch_up_windows: usize,
}

impl Default for CronSchedulerConfig {
    fn default() -> Self {
        Self { tick_interval: Duration::from_millis(5_000), batch_size: 10, max_catch_up_windows: 25 }
    }
}

impl From<&OrchestratorConfig> for CronSchedulerConfig {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            tick_interval: config.scheduler_interval,
            batch_size: config.scheduler_batch_size,
            max_catch_up_windows: config.scheduler_max_windows,
        }
    }
}

/// Ticks [`RepositoryPort::list_due_schedules`] on an interval, materializing
/// one run per due occurrence (or, with catch-up on, one per missed window)
/// and enqueuing it on [`QueuePort`].
pub struct CronScheduler<R: RepositoryPort, Q: QueuePort> {
    repo: Arc<R>,
    queue: Arc<Q>,
    config: CronSchedulerConfig,
}

impl<R: RepositoryPort, Q: QueuePort> CronScheduler<R, Q> {
    pub fn new(repo: Arc<R>, queue: Arc<Q>, config: CronSchedulerConfig) -> Self {
        Self { repo, queue, config }
    }

    pub fn spawn(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.config.tick_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = self.tick().await {
                            error!(error = %err, "cron scheduler tick failed");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        break;
                    }
                }
            }
        })
    }

    #[instrument(skip(self))]
    pub async fn tick(&self) -> Result<(), CronError> {
        let now = Utc::now();
        let due = self
            .repo
            .list_due_schedules(DueSchedulesQuery { limit: self.config.batch_size, now: Some(now) })
            .await?;
        for (schedule, _definition) in due {
            if let Err(err) = self.materialize(schedule, now).await {
                warn!(error = %err, "schedule materialization failed");
            }
        }
        Ok(())
    }

    async fn materialize(&self, schedule: WorkflowSchedule, now: DateTime<Utc>) -> Result<(), CronError> {
        let expr = parse_cron(&schedule.cron)?;
        let tz: Tz = schedule.timezone.parse().map_err(|_| CronError::InvalidTimezone(schedule.timezone.clone()))?;
        let cursor = schedule.catchup_cursor.or(schedule.next_run_at).unwrap_or(now);

        let mut occurrences = Vec::new();
        for candidate in upcoming_utc(&expr, tz, cursor) {
            if candidate > now {
                break;
            }
            if schedule.start_window.map(|start| candidate < start).unwrap_or(false) {
                continue;
            }
            if schedule.end_window.map(|end| candidate > end).unwrap_or(false) {
                break;
            }
            occurrences.push(candidate);
            if occurrences.len() >= self.config.max_catch_up_windows {
                break;
            }
        }

        if occurrences.is_empty() {
            return self.advance_schedule(schedule, &expr, tz, now, None).await;
        }
        if !schedule.catch_up {
            let latest = *occurrences.last().expect("checked non-empty");
            occurrences = vec![latest];
        }

        let mut window_start = cursor;
        let mut last_window = None;
        for occurrence in &occurrences {
            let partition_key = derive_time_window_partition_key(*occurrence);
            let run_key = format!("schedule:{}:{partition_key}", schedule.id);
            match self
                .repo
                .create_run(
                    &schedule.workflow_definition_id,
                    CreateRunInput {
                        parameters: schedule.parameters.clone(),
                        triggered_by: Some("schedule".to_string()),
                        trigger: Some(json!({
                            "kind": "schedule",
                            "scheduleId": schedule.id,
                            "occurrence": occurrence,
                        })),
                        partition_key: Some(partition_key),
                        run_key: Some(run_key),
                    },
                )
                .await
            {
                Ok(run) => {
                    let _ = self.queue.enqueue_run(&run.id, run.run_key.as_deref()).await;
                }
                Err(err) if err.is_run_key_conflict() => {
                    // Another scheduler instance already materialized this window.
                }
                Err(err) => return Err(err.into()),
            }
            last_window = Some(MaterializedWindow { start: window_start, end: *occurrence });
            window_start = *occurrence;
        }

        self.advance_schedule(schedule, &expr, tz, now, last_window).await
    }

    async fn advance_schedule(
        &self,
        schedule: WorkflowSchedule,
        expr: &CronExpr,
        tz: Tz,
        now: DateTime<Utc>,
        window: Option<MaterializedWindow>,
    ) -> Result<(), CronError> {
        let expected_updated_at = schedule.updated_at;
        let mut updated = schedule;
        updated.next_run_at = upcoming_utc(expr, tz, now).next();
        match &window {
            Some(w) => {
                updated.catchup_cursor = Some(w.end);
                updated.last_materialized_window = Some(w.clone());
            }
            None => updated.catchup_cursor = Some(now),
        }
        updated.updated_at = now;

        match self.repo.update_schedule(updated, expected_updated_at).await {
            Ok(_) => Ok(()),
            Err(RepositoryError::Conflict(_)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

/// The `cron` crate requires a leading seconds field; schedules are written
/// in the ordinary 5-field crontab form, so a `0 ` is prepended when needed.
fn parse_cron(expr: &str) -> Result<CronExpr, CronError> {
    let normalized = if expr.split_whitespace().count() == 5 { format!("0 {expr}") } else { expr.to_string() };
    CronExpr::from_str(&normalized)
        .map_err(|e| CronError::InvalidExpression { expr: expr.to_string(), source: e.to_string() })
}

/// Occurrences of `expr` strictly after `after`, interpreted in `tz` and
/// converted back to UTC.
fn upcoming_utc(expr: &CronExpr, tz: Tz, after: DateTime<Utc>) -> impl Iterator<Item = DateTime<Utc>> + '_ {
    let after_tz = after.with_timezone(&tz);
    expr.after(&after_tz).map(move |t| t.with_timezone(&Utc))
}

/// Partition key for one materialized occurrence: the occurrence instant,
/// UTC, truncated to whole seconds.
fn derive_time_window_partition_key(occurrence: DateTime<Utc>) -> String {
    occurrence.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JobStepDefinition, StepDefinition, WorkflowDefinition};
    use crate::persistence::{InMemoryRepository, InlineQueue};

    fn minimal_schedule(id: &str, definition_id: &str, next_run_at: DateTime<Utc>) -> WorkflowSchedule {
        WorkflowSchedule {
            id: id.to_string(),
            workflow_definition_id: definition_id.to_string(),
            cron: "*/5 * * * *".to_string(),
            timezone: "UTC".to_string(),
            parameters: json!({}),
            start_window: None,
            end_window: None,
            catch_up: false,
            is_active: true,
            next_run_at: Some(next_run_at),
            catchup_cursor: None,
            last_materialized_window: None,
            updated_at: Utc::now() - chrono::Duration::hours(1),
        }
    }

    async fn seeded() -> (InMemoryRepository, WorkflowDefinition) {
        let repo = InMemoryRepository::new();
        let definition = WorkflowDefinition::new(
            "def-1".into(),
            "scheduled".into(),
            1,
            vec![StepDefinition::Job(JobStepDefinition { id: "A".into(), job_slug: "noop".into(), ..Default::default() })],
        );
        let definition = repo.create_definition(definition).await.unwrap();
        (repo, definition)
    }

    #[tokio::test]
    async fn due_schedule_materializes_a_run_and_advances_cursor() {
        let (repo, definition) = seeded().await;
        let schedule = minimal_schedule("sched-1", &definition.id, Utc::now() - chrono::Duration::minutes(1));
        repo.create_schedule(schedule).await.unwrap();

        let repo = Arc::new(repo);
        let (queue, mut rx) = InlineQueue::new();
        let scheduler = CronScheduler::new(repo.clone(), Arc::new(queue), CronSchedulerConfig::default());
        scheduler.tick().await.unwrap();

        let job = rx.recv().await.unwrap();
        assert!(matches!(job, crate::persistence::QueuedJob::RunWorkflow { .. }));

        let updated = repo.get_schedule("sched-1").await.unwrap();
        assert!(updated.next_run_at.unwrap() > Utc::now());
        assert!(updated.catchup_cursor.is_some());
    }

    #[tokio::test]
    async fn repeated_tick_does_not_duplicate_the_same_window() {
        let (repo, definition) = seeded().await;
        let schedule = minimal_schedule("sched-2", &definition.id, Utc::now() - chrono::Duration::minutes(1));
        repo.create_schedule(schedule).await.unwrap();

        let repo = Arc::new(repo);
        let (queue, _rx) = InlineQueue::new();
        let scheduler = CronScheduler::new(repo.clone(), Arc::new(queue), CronSchedulerConfig::default());
        scheduler.tick().await.unwrap();

        // Reset next_run_at into the past again to simulate a second due
        // tick over the same already-materialized window.
        let mut again = repo.get_schedule("sched-2").await.unwrap();
        let expected = again.updated_at;
        again.next_run_at = Some(Utc::now() - chrono::Duration::minutes(1));
        again.catchup_cursor = None;
        repo.update_schedule(again, expected).await.unwrap();
        // The run-key conflict on the already-materialized window must be
        // swallowed, not surfaced as a tick failure.
        scheduler.tick().await.unwrap();
    }
}
