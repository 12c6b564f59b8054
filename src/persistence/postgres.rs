//! Postgres-backed `RepositoryPort`. The database schema itself is a
//! contract-only concern (out of scope per this system's boundary): each
//! entity is kept as a JSONB document under its id, with a handful of plain
//! columns for the lookups the port actually needs (run key collision,
//! definition slug, due schedules, stale heartbeats, active recovery
//! requests). Raw `sqlx::query(...).bind(...)` (no compile-time query
//! macros, since this crate's schema isn't pinned to a migrations
//! directory at build time), `FOR UPDATE` row locks before every mutation,
//! `FOR UPDATE SKIP LOCKED` where concurrent workers should not contend on
//! the same row.
//!
//! Expected tables (DDL owned by the deployment's migration tooling, not
//! this crate):
//! `workflow_definitions(id text primary key, slug text unique, data jsonb)`,
//! `workflow_runs(id text primary key, definition_id text, run_key_normalized text, status text, data jsonb)`,
//! `workflow_run_steps(id text primary key, run_id text, step_id text, status text, last_heartbeat_at timestamptz, data jsonb)`,
//! `workflow_run_step_assets(run_step_id text, asset_id text, partition_key text, data jsonb)`,
//! `workflow_asset_stale_partitions(definition_id text, asset_id text, partition_key_normalized text, data jsonb, primary key (definition_id, asset_id, partition_key_normalized))`,
//! `workflow_schedules(id text primary key, definition_id text, next_run_at timestamptz, is_active bool, data jsonb)`,
//! `workflow_asset_recovery_requests(id text primary key, asset_id text, partition_key_normalized text, status text, data jsonb)`,
//! `workflow_run_history(run_id text, data jsonb)`,
//! `workflow_failed_steps(run_id text, step_id text, data jsonb)`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use super::store::*;
use crate::model::{
    normalize_asset_id, normalize_partition_key, RecoveryStatus, WorkflowAssetRecoveryRequest,
    WorkflowAssetStalePartition, WorkflowDefinition, WorkflowRun, WorkflowRunHistoryEvent, WorkflowRunStep,
    WorkflowRunStepAsset, WorkflowSchedule,
};

pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn to_fatal(err: sqlx::Error) -> RepositoryError {
    RepositoryError::Fatal(err.to_string())
}

fn decode_json<T: serde::de::DeserializeOwned>(value: serde_json::Value) -> RepoResult<T> {
    serde_json::from_value(value).map_err(|e| RepositoryError::Fatal(format!("decode failure: {e}")))
}

#[async_trait]
impl RepositoryPort for PostgresRepository {
    async fn create_definition(&self, definition: WorkflowDefinition) -> RepoResult<WorkflowDefinition> {
        let data = serde_json::to_value(&definition).map_err(|e| RepositoryError::Fatal(e.to_string()))?;
        sqlx::query("INSERT INTO workflow_definitions (id, slug, data) VALUES ($1, $2, $3)")
            .bind(&definition.id)
            .bind(&definition.slug)
            .bind(&data)
            .execute(&self.pool)
            .await
            .map_err(to_fatal)?;
        Ok(definition)
    }

    async fn get_definition(&self, id: &str) -> RepoResult<WorkflowDefinition> {
        let row = sqlx::query("SELECT data FROM workflow_definitions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(to_fatal)?
            .ok_or_else(|| RepositoryError::NotFound(format!("definition {id}")))?;
        decode_json(row.get::<serde_json::Value, _>("data"))
    }

    async fn get_definition_by_slug(&self, slug: &str) -> RepoResult<WorkflowDefinition> {
        let row = sqlx::query("SELECT data FROM workflow_definitions WHERE slug = $1")
            .bind(slug)
            .fetch_optional(&self.pool)
            .await
            .map_err(to_fatal)?
            .ok_or_else(|| RepositoryError::NotFound(format!("definition slug {slug}")))?;
        decode_json(row.get::<serde_json::Value, _>("data"))
    }

    async fn replace_asset_declarations(&self, _definition: &WorkflowDefinition) -> RepoResult<()> {
        // Declarations live inline on the definition's `data` column; nothing
        // further to replace until a dedicated lookup table is needed.
        Ok(())
    }

    async fn create_run(&self, definition_id: &str, input: CreateRunInput) -> RepoResult<WorkflowRun> {
        let mut tx = self.pool.begin().await.map_err(to_fatal)?;
        let run_key_normalized = input.run_key.as_deref().map(|k| k.trim().to_ascii_lowercase());
        if let Some(ref key) = run_key_normalized {
            let existing = sqlx::query(
                "SELECT id FROM workflow_runs WHERE definition_id = $1 AND run_key_normalized = $2 \
                 AND status IN ('pending','running') FOR UPDATE",
            )
            .bind(definition_id)
            .bind(key)
            .fetch_optional(&mut *tx)
            .await
            .map_err(to_fatal)?;
            if existing.is_some() {
                return Err(RepositoryError::Conflict(format!("runKey conflict: {key}")));
            }
        }
        let mut run = WorkflowRun::new(uuid::Uuid::now_v7().to_string(), definition_id.to_string(), input.parameters);
        run.triggered_by = input.triggered_by;
        run.trigger = input.trigger;
        run.partition_key = input.partition_key;
        run.run_key = input.run_key;
        run.run_key_normalized = run_key_normalized;
        let data = serde_json::to_value(&run).map_err(|e| RepositoryError::Fatal(e.to_string()))?;
        sqlx::query(
            "INSERT INTO workflow_runs (id, definition_id, run_key_normalized, status, data) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&run.id)
        .bind(definition_id)
        .bind(&run.run_key_normalized)
        .bind("pending")
        .bind(&data)
        .execute(&mut *tx)
        .await
        .map_err(to_fatal)?;
        tx.commit().await.map_err(to_fatal)?;
        Ok(run)
    }

    async fn get_run(&self, id: &str) -> RepoResult<WorkflowRun> {
        let row = sqlx::query("SELECT data FROM workflow_runs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(to_fatal)?
            .ok_or_else(|| RepositoryError::NotFound(format!("run {id}")))?;
        decode_json(row.get::<serde_json::Value, _>("data"))
    }

    async fn update_run(&self, id: &str, patch: RunPatch) -> RepoResult<WorkflowRun> {
        let mut tx = self.pool.begin().await.map_err(to_fatal)?;
        let row = sqlx::query("SELECT data FROM workflow_runs WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(to_fatal)?
            .ok_or_else(|| RepositoryError::NotFound(format!("run {id}")))?;
        let mut run: WorkflowRun = decode_json(row.get::<serde_json::Value, _>("data"))?;
        if let Some(status) = patch.status {
            run.status = status;
        }
        if let Some(ctx) = patch.context {
            run.context = ctx;
        }
        if let Some(output) = patch.output {
            run.output = output;
        }
        if let Some(msg) = patch.error_message {
            run.error_message = msg;
        }
        if let Some(step_id) = patch.current_step_id {
            run.current_step_id = step_id;
        }
        if let Some(idx) = patch.current_step_index {
            run.current_step_index = idx;
        }
        if let Some(completed) = patch.completed_steps {
            run.metrics.completed_steps = completed;
        }
        if let Some(total) = patch.total_steps {
            run.metrics.total_steps = total;
        }
        if let Some(started_at) = patch.started_at {
            run.started_at = Some(started_at);
        }
        if let Some(completed_at) = patch.completed_at {
            run.completed_at = Some(completed_at);
            if let Some(started_at) = run.started_at {
                run.duration_ms = Some((completed_at - started_at).num_milliseconds().max(0));
            }
        }
        let data = serde_json::to_value(&run).map_err(|e| RepositoryError::Fatal(e.to_string()))?;
        let status_str = format!("{:?}", run.status).to_ascii_lowercase();
        sqlx::query("UPDATE workflow_runs SET status = $2, data = $3 WHERE id = $1")
            .bind(id)
            .bind(&status_str)
            .bind(&data)
            .execute(&mut *tx)
            .await
            .map_err(to_fatal)?;
        tx.commit().await.map_err(to_fatal)?;
        Ok(run)
    }

    async fn find_active_run_by_key(
        &self,
        definition_id: &str,
        run_key_normalized: &str,
    ) -> RepoResult<Option<WorkflowRun>> {
        let row = sqlx::query(
            "SELECT data FROM workflow_runs WHERE definition_id = $1 AND run_key_normalized = $2 \
             AND status IN ('pending','running')",
        )
        .bind(definition_id)
        .bind(run_key_normalized)
        .fetch_optional(&self.pool)
        .await
        .map_err(to_fatal)?;
        row.map(|r| decode_json(r.get::<serde_json::Value, _>("data"))).transpose()
    }

    async fn create_run_step(&self, run_id: &str, step_id: &str) -> RepoResult<WorkflowRunStep> {
        let step = WorkflowRunStep::new(uuid::Uuid::now_v7().to_string(), run_id.to_string(), step_id.to_string());
        let data = serde_json::to_value(&step).map_err(|e| RepositoryError::Fatal(e.to_string()))?;
        sqlx::query(
            "INSERT INTO workflow_run_steps (id, run_id, step_id, status, last_heartbeat_at, data) \
             VALUES ($1, $2, $3, 'pending', NULL, $4)",
        )
        .bind(&step.id)
        .bind(run_id)
        .bind(step_id)
        .bind(&data)
        .execute(&self.pool)
        .await
        .map_err(to_fatal)?;
        Ok(step)
    }

    async fn get_run_step(&self, id: &str) -> RepoResult<WorkflowRunStep> {
        let row = sqlx::query("SELECT data FROM workflow_run_steps WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(to_fatal)?
            .ok_or_else(|| RepositoryError::NotFound(format!("run step {id}")))?;
        decode_json(row.get::<serde_json::Value, _>("data"))
    }

    async fn get_run_step_by_step_id(&self, run_id: &str, step_id: &str) -> RepoResult<Option<WorkflowRunStep>> {
        let row = sqlx::query("SELECT data FROM workflow_run_steps WHERE run_id = $1 AND step_id = $2")
            .bind(run_id)
            .bind(step_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(to_fatal)?;
        row.map(|r| decode_json(r.get::<serde_json::Value, _>("data"))).transpose()
    }

    async fn list_run_steps(&self, run_id: &str) -> RepoResult<Vec<WorkflowRunStep>> {
        let rows = sqlx::query("SELECT data FROM workflow_run_steps WHERE run_id = $1")
            .bind(run_id)
            .fetch_all(&self.pool)
            .await
            .map_err(to_fatal)?;
        rows.into_iter().map(|r| decode_json(r.get::<serde_json::Value, _>("data"))).collect()
    }

    async fn update_run_step(&self, id: &str, patch: RunStepPatch) -> RepoResult<WorkflowRunStep> {
        let mut tx = self.pool.begin().await.map_err(to_fatal)?;
        let row = sqlx::query("SELECT data FROM workflow_run_steps WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(to_fatal)?
            .ok_or_else(|| RepositoryError::NotFound(format!("run step {id}")))?;
        let mut step: WorkflowRunStep = decode_json(row.get::<serde_json::Value, _>("data"))?;
        if let Some(status) = patch.status {
            step.status = status;
        }
        if let Some(attempt) = patch.attempt {
            step.attempt = attempt;
        }
        if let Some(retry_count) = patch.retry_count {
            step.retry_count = retry_count;
        }
        if let Some(retry_state) = patch.retry_state {
            step.retry_state = retry_state;
        }
        if let Some(next_attempt_at) = patch.next_attempt_at {
            step.next_attempt_at = next_attempt_at;
        }
        if let Some(metadata) = patch.retry_metadata {
            step.retry_metadata = metadata;
        }
        if let Some(job_run_id) = patch.job_run_id {
            step.job_run_id = job_run_id;
        }
        if let Some(input) = patch.input {
            step.input = input;
        }
        if let Some(output) = patch.output {
            step.output = output;
        }
        if let Some(msg) = patch.error_message {
            step.error_message = msg;
        }
        if let Some(reason) = patch.failure_reason {
            step.failure_reason = reason;
        }
        if let Some(metrics) = patch.metrics {
            step.metrics = metrics;
        }
        if let Some(context) = patch.context {
            step.context = context;
        }
        if let Some(started_at) = patch.started_at {
            step.started_at = started_at;
        }
        if let Some(completed_at) = patch.completed_at {
            step.completed_at = completed_at;
        }
        if let Some(heartbeat) = patch.last_heartbeat_at {
            step.last_heartbeat_at = heartbeat;
        }
        if let Some(parent_step_id) = patch.parent_step_id {
            step.parent_step_id = parent_step_id;
        }
        if let Some(fanout_index) = patch.fanout_index {
            step.fanout_index = fanout_index;
        }
        if let Some(template_step_id) = patch.template_step_id {
            step.template_step_id = template_step_id;
        }
        let data = serde_json::to_value(&step).map_err(|e| RepositoryError::Fatal(e.to_string()))?;
        let status_str = format!("{:?}", step.status).to_ascii_lowercase();
        sqlx::query("UPDATE workflow_run_steps SET status = $2, last_heartbeat_at = $3, data = $4 WHERE id = $1")
            .bind(id)
            .bind(&status_str)
            .bind(step.last_heartbeat_at)
            .bind(&data)
            .execute(&mut *tx)
            .await
            .map_err(to_fatal)?;
        tx.commit().await.map_err(to_fatal)?;
        Ok(step)
    }

    async fn record_step_assets(
        &self,
        definition_id: &str,
        run_id: &str,
        run_step_id: &str,
        step_id: &str,
        assets: Vec<NewAsset>,
    ) -> RepoResult<Vec<WorkflowRunStepAsset>> {
        let mut tx = self.pool.begin().await.map_err(to_fatal)?;
        sqlx::query("DELETE FROM workflow_run_step_assets WHERE run_step_id = $1")
            .bind(run_step_id)
            .execute(&mut *tx)
            .await
            .map_err(to_fatal)?;
        let mut rows = Vec::with_capacity(assets.len());
        for a in assets {
            let row = WorkflowRunStepAsset {
                id: uuid::Uuid::now_v7().to_string(),
                workflow_definition_id: definition_id.to_string(),
                workflow_run_id: run_id.to_string(),
                workflow_run_step_id: run_step_id.to_string(),
                step_id: step_id.to_string(),
                asset_id: a.asset_id,
                payload: a.payload,
                schema: a.schema,
                freshness: a.freshness,
                partition_key: a.partition_key,
                produced_at: a.produced_at,
            };
            let data = serde_json::to_value(&row).map_err(|e| RepositoryError::Fatal(e.to_string()))?;
            sqlx::query(
                "INSERT INTO workflow_run_step_assets (run_step_id, asset_id, partition_key, data) \
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(run_step_id)
            .bind(&row.asset_id)
            .bind(&row.partition_key)
            .bind(&data)
            .execute(&mut *tx)
            .await
            .map_err(to_fatal)?;
            rows.push(row);
        }
        tx.commit().await.map_err(to_fatal)?;
        Ok(rows)
    }

    async fn clear_stale_partition(
        &self,
        definition_id: &str,
        asset_id: &str,
        partition_key: Option<&str>,
    ) -> RepoResult<()> {
        let normalized = normalize_partition_key(partition_key).unwrap_or_default();
        sqlx::query(
            "DELETE FROM workflow_asset_stale_partitions \
             WHERE definition_id = $1 AND asset_id = $2 AND partition_key_normalized = $3",
        )
        .bind(definition_id)
        .bind(normalize_asset_id(asset_id))
        .bind(&normalized)
        .execute(&self.pool)
        .await
        .map_err(to_fatal)?;
        Ok(())
    }

    async fn mark_stale_partition(&self, stale: WorkflowAssetStalePartition) -> RepoResult<()> {
        let data = serde_json::to_value(&stale).map_err(|e| RepositoryError::Fatal(e.to_string()))?;
        sqlx::query(
            "INSERT INTO workflow_asset_stale_partitions (definition_id, asset_id, partition_key_normalized, data) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (definition_id, asset_id, partition_key_normalized) DO UPDATE SET data = EXCLUDED.data",
        )
        .bind(&stale.workflow_definition_id)
        .bind(&stale.asset_id)
        .bind(&stale.partition_key_normalized)
        .bind(&data)
        .execute(&self.pool)
        .await
        .map_err(to_fatal)?;
        Ok(())
    }

    async fn find_asset_producer(&self, asset_id: &str) -> RepoResult<Option<String>> {
        let row = sqlx::query(
            "SELECT definition_id FROM workflow_definitions, jsonb_array_elements(data->'steps') step, \
             jsonb_array_elements(step->'produces') decl \
             WHERE lower(trim(decl->>'assetId')) = $1 LIMIT 1",
        )
        .bind(normalize_asset_id(asset_id))
        .fetch_optional(&self.pool)
        .await
        .map_err(to_fatal)?;
        Ok(row.map(|r| r.get::<String, _>("definition_id")))
    }

    async fn list_due_schedules(
        &self,
        query: DueSchedulesQuery,
    ) -> RepoResult<Vec<(WorkflowSchedule, WorkflowDefinition)>> {
        let now = query.now.unwrap_or_else(Utc::now);
        let rows = sqlx::query(
            "SELECT data FROM workflow_schedules WHERE is_active = true AND next_run_at <= $1 \
             ORDER BY next_run_at ASC LIMIT $2",
        )
        .bind(now)
        .bind(query.limit.max(1) as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(to_fatal)?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let schedule: WorkflowSchedule = decode_json(row.get::<serde_json::Value, _>("data"))?;
            let definition = self.get_definition(&schedule.workflow_definition_id).await?;
            out.push((schedule, definition));
        }
        Ok(out)
    }

    async fn create_schedule(&self, schedule: WorkflowSchedule) -> RepoResult<WorkflowSchedule> {
        let data = serde_json::to_value(&schedule).map_err(|e| RepositoryError::Fatal(e.to_string()))?;
        sqlx::query(
            "INSERT INTO workflow_schedules (id, definition_id, next_run_at, is_active, data) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(&schedule.id)
        .bind(&schedule.workflow_definition_id)
        .bind(schedule.next_run_at)
        .bind(schedule.is_active)
        .bind(&data)
        .execute(&self.pool)
        .await
        .map_err(to_fatal)?;
        Ok(schedule)
    }

    async fn get_schedule(&self, id: &str) -> RepoResult<WorkflowSchedule> {
        let row = sqlx::query("SELECT data FROM workflow_schedules WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(to_fatal)?
            .ok_or_else(|| RepositoryError::NotFound(format!("schedule {id}")))?;
        decode_json(row.get::<serde_json::Value, _>("data"))
    }

    async fn update_schedule(
        &self,
        schedule: WorkflowSchedule,
        expected_updated_at: DateTime<Utc>,
    ) -> RepoResult<WorkflowSchedule> {
        let mut tx = self.pool.begin().await.map_err(to_fatal)?;
        let row = sqlx::query("SELECT data FROM workflow_schedules WHERE id = $1 FOR UPDATE")
            .bind(&schedule.id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(to_fatal)?
            .ok_or_else(|| RepositoryError::NotFound(format!("schedule {}", schedule.id)))?;
        let existing: WorkflowSchedule = decode_json(row.get::<serde_json::Value, _>("data"))?;
        if existing.updated_at != expected_updated_at {
            return Err(RepositoryError::Conflict(format!("schedule {} metadata changed concurrently", schedule.id)));
        }
        let data = serde_json::to_value(&schedule).map_err(|e| RepositoryError::Fatal(e.to_string()))?;
        sqlx::query("UPDATE workflow_schedules SET next_run_at = $2, is_active = $3, data = $4 WHERE id = $1")
            .bind(&schedule.id)
            .bind(schedule.next_run_at)
            .bind(schedule.is_active)
            .bind(&data)
            .execute(&mut *tx)
            .await
            .map_err(to_fatal)?;
        tx.commit().await.map_err(to_fatal)?;
        Ok(schedule)
    }

    async fn find_stale_run_steps(&self, cutoff: DateTime<Utc>, limit: usize) -> RepoResult<Vec<(String, String)>> {
        let rows = sqlx::query(
            "SELECT s.run_id, s.step_id FROM workflow_run_steps s \
             JOIN workflow_runs r ON r.id = s.run_id \
             WHERE s.status = 'running' AND r.status = 'running' \
             AND COALESCE(s.last_heartbeat_at, (s.data->>'startedAt')::timestamptz) < $1 \
             LIMIT $2 FOR UPDATE SKIP LOCKED",
        )
        .bind(cutoff)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(to_fatal)?;
        Ok(rows.into_iter().map(|r| (r.get::<String, _>("run_id"), r.get::<String, _>("step_id"))).collect())
    }

    async fn ensure_recovery_request(
        &self,
        input: EnsureRecoveryRequestInput,
    ) -> RepoResult<(WorkflowAssetRecoveryRequest, bool)> {
        let asset_id_normalized = normalize_asset_id(&input.asset_id);
        let partition_key_normalized = normalize_partition_key(input.partition_key.as_deref()).unwrap_or_default();
        let mut tx = self.pool.begin().await.map_err(to_fatal)?;
        let existing = sqlx::query(
            "SELECT data FROM workflow_asset_recovery_requests \
             WHERE asset_id = $1 AND partition_key_normalized = $2 AND status IN ('pending','running') FOR UPDATE",
        )
        .bind(&asset_id_normalized)
        .bind(&partition_key_normalized)
        .fetch_optional(&mut *tx)
        .await
        .map_err(to_fatal)?;
        if let Some(row) = existing {
            let request: WorkflowAssetRecoveryRequest = decode_json(row.get::<serde_json::Value, _>("data"))?;
            tx.commit().await.map_err(to_fatal)?;
            return Ok((request, false));
        }
        let request = WorkflowAssetRecoveryRequest {
            id: uuid::Uuid::now_v7().to_string(),
            asset_id: input.asset_id,
            partition_key_normalized,
            workflow_definition_id: input.workflow_definition_id,
            status: RecoveryStatus::Pending,
            recovery_workflow_run_id: None,
            requested_by_workflow_run_id: input.requested_by_workflow_run_id,
            requested_by_workflow_run_step_id: input.requested_by_workflow_run_step_id,
            attempts: 0,
            last_attempt_at: None,
            last_error: None,
            metadata: serde_json::Value::Null,
            completed_at: None,
        };
        let data = serde_json::to_value(&request).map_err(|e| RepositoryError::Fatal(e.to_string()))?;
        sqlx::query(
            "INSERT INTO workflow_asset_recovery_requests (id, asset_id, partition_key_normalized, status, data) \
             VALUES ($1, $2, $3, 'pending', $4)",
        )
        .bind(&request.id)
        .bind(&asset_id_normalized)
        .bind(&request.partition_key_normalized)
        .bind(&data)
        .execute(&mut *tx)
        .await
        .map_err(to_fatal)?;
        tx.commit().await.map_err(to_fatal)?;
        Ok((request, true))
    }

    async fn get_recovery_request(&self, id: &str) -> RepoResult<WorkflowAssetRecoveryRequest> {
        let row = sqlx::query("SELECT data FROM workflow_asset_recovery_requests WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(to_fatal)?
            .ok_or_else(|| RepositoryError::NotFound(format!("recovery request {id}")))?;
        decode_json(row.get::<serde_json::Value, _>("data"))
    }

    async fn update_recovery_request_status(
        &self,
        id: &str,
        status: RecoveryStatus,
        recovery_workflow_run_id: Option<String>,
        last_error: Option<String>,
    ) -> RepoResult<WorkflowAssetRecoveryRequest> {
        let mut tx = self.pool.begin().await.map_err(to_fatal)?;
        let row = sqlx::query("SELECT data FROM workflow_asset_recovery_requests WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(to_fatal)?
            .ok_or_else(|| RepositoryError::NotFound(format!("recovery request {id}")))?;
        let mut request: WorkflowAssetRecoveryRequest = decode_json(row.get::<serde_json::Value, _>("data"))?;
        request.status = status;
        request.attempts += 1;
        request.last_attempt_at = Some(Utc::now());
        if recovery_workflow_run_id.is_some() {
            request.recovery_workflow_run_id = recovery_workflow_run_id;
        }
        request.last_error = last_error;
        if matches!(status, RecoveryStatus::Succeeded | RecoveryStatus::Failed) {
            request.completed_at = Some(Utc::now());
        }
        let status_str = format!("{:?}", request.status).to_ascii_lowercase();
        let data = serde_json::to_value(&request).map_err(|e| RepositoryError::Fatal(e.to_string()))?;
        sqlx::query("UPDATE workflow_asset_recovery_requests SET status = $2, data = $3 WHERE id = $1")
            .bind(id)
            .bind(&status_str)
            .bind(&data)
            .execute(&mut *tx)
            .await
            .map_err(to_fatal)?;
        tx.commit().await.map_err(to_fatal)?;
        Ok(request)
    }

    async fn append_history(&self, event: WorkflowRunHistoryEvent) -> RepoResult<()> {
        let data = serde_json::to_value(&event).map_err(|e| RepositoryError::Fatal(e.to_string()))?;
        sqlx::query("INSERT INTO workflow_run_history (run_id, data) VALUES ($1, $2)")
            .bind(event.workflow_run_id())
            .bind(&data)
            .execute(&self.pool)
            .await
            .map_err(to_fatal)?;
        Ok(())
    }

    async fn list_history(&self, run_id: &str) -> RepoResult<Vec<WorkflowRunHistoryEvent>> {
        let rows = sqlx::query("SELECT data FROM workflow_run_history WHERE run_id = $1 ORDER BY ctid")
            .bind(run_id)
            .fetch_all(&self.pool)
            .await
            .map_err(to_fatal)?;
        rows.into_iter().map(|r| decode_json(r.get::<serde_json::Value, _>("data"))).collect()
    }

    async fn record_failed_step(&self, record: FailedStepRecord) -> RepoResult<()> {
        let data = serde_json::json!({
            "failureReason": record.failure_reason,
            "errorMessage": record.error_message,
            "attempt": record.attempt,
            "recordedAt": record.recorded_at,
        });
        sqlx::query("INSERT INTO workflow_failed_steps (run_id, step_id, data) VALUES ($1, $2, $3)")
            .bind(&record.workflow_run_id)
            .bind(&record.step_id)
            .bind(&data)
            .execute(&self.pool)
            .await
            .map_err(to_fatal)?;
        Ok(())
    }

    async fn list_failed_steps(&self, limit: usize) -> RepoResult<Vec<FailedStepRecord>> {
        let rows = sqlx::query(
            "SELECT run_id, step_id, data FROM workflow_failed_steps ORDER BY ctid DESC LIMIT $1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(to_fatal)?;
        Ok(rows
            .into_iter()
            .map(|r| {
                let data: serde_json::Value = r.get("data");
                FailedStepRecord {
                    workflow_run_id: r.get("run_id"),
                    step_id: r.get("step_id"),
                    failure_reason: data.get("failureReason").and_then(|v| v.as_str()).map(String::from),
                    error_message: data.get("errorMessage").and_then(|v| v.as_str()).map(String::from),
                    attempt: data.get("attempt").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
                    recorded_at: data
                        .get("recordedAt")
                        .and_then(|v| v.as_str())
                        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                        .map(|d| d.with_timezone(&Utc))
                        .unwrap_or_else(Utc::now),
                }
            })
            .collect())
    }
}
