//! Process-wide configuration, read once at component construction from the
//! environment. A single `Config::from_env` struct rather than scattering
//! `std::env::var` calls through the crate.

use std::env;
use std::time::Duration;

fn env_u64(key: &str, default: u64) -> u64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_f64(key: &str, default: f64) -> f64 {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

/// All environment-tunable knobs in one place, read once at process start.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub max_parallel: Option<usize>,
    pub fanout_max_items: usize,
    pub fanout_max_concurrency: usize,
    pub heartbeat_timeout: Duration,
    pub heartbeat_check_interval: Duration,
    pub heartbeat_check_batch: usize,
    pub retry_base_ms: u64,
    pub retry_factor: f64,
    pub retry_max_ms: u64,
    pub retry_jitter_ratio: f64,
    pub asset_recovery_poll_interval: Duration,
    pub scheduler_interval: Duration,
    pub scheduler_batch_size: usize,
    pub scheduler_max_windows: usize,
    pub scheduler_advisory_locks: bool,
    pub scheduler_leader_keepalive: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_parallel: None,
            fanout_max_items: 100,
            fanout_max_concurrency: 10,
            heartbeat_timeout: Duration::from_millis(60_000),
            heartbeat_check_interval: Duration::from_millis(15_000),
            heartbeat_check_batch: 20,
            retry_base_ms: 5_000,
            retry_factor: 2.0,
            retry_max_ms: 1_800_000,
            retry_jitter_ratio: 0.2,
            asset_recovery_poll_interval: Duration::from_millis(30_000),
            scheduler_interval: Duration::from_millis(5_000),
            scheduler_batch_size: 10,
            scheduler_max_windows: 25,
            scheduler_advisory_locks: false,
            scheduler_leader_keepalive: Duration::from_millis(15_000),
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_parallel: env::var("WORKFLOW_MAX_PARALLEL")
                .or_else(|_| env::var("WORKFLOW_CONCURRENCY"))
                .ok()
                .and_then(|v| v.parse().ok()),
            fanout_max_items: env_usize("WORKFLOW_FANOUT_MAX_ITEMS", defaults.fanout_max_items),
            fanout_max_concurrency: env_usize("WORKFLOW_FANOUT_MAX_CONCURRENCY", defaults.fanout_max_concurrency),
            heartbeat_timeout: Duration::from_millis(env_u64(
                "WORKFLOW_HEARTBEAT_TIMEOUT_MS",
                defaults.heartbeat_timeout.as_millis() as u64,
            )),
            heartbeat_check_interval: Duration::from_millis(env_u64(
                "WORKFLOW_HEARTBEAT_CHECK_INTERVAL_MS",
                defaults.heartbeat_check_interval.as_millis() as u64,
            )),
            heartbeat_check_batch: env_usize("WORKFLOW_HEARTBEAT_CHECK_BATCH", defaults.heartbeat_check_batch),
            retry_base_ms: env_u64("WORKFLOW_RETRY_BASE_MS", defaults.retry_base_ms),
            retry_factor: env_f64("WORKFLOW_RETRY_FACTOR", defaults.retry_factor),
            retry_max_ms: env_u64("WORKFLOW_RETRY_MAX_MS", defaults.retry_max_ms),
            retry_jitter_ratio: env_f64("WORKFLOW_RETRY_JITTER_RATIO", defaults.retry_jitter_ratio),
            asset_recovery_poll_interval: Duration::from_millis(env_u64(
                "ASSET_RECOVERY_POLL_INTERVAL_MS",
                defaults.asset_recovery_poll_interval.as_millis() as u64,
            )),
            scheduler_interval: Duration::from_millis(env_u64(
                "WORKFLOW_SCHEDULER_INTERVAL_MS",
                defaults.scheduler_interval.as_millis() as u64,
            )),
            scheduler_batch_size: env_usize("WORKFLOW_SCHEDULER_BATCH_SIZE", defaults.scheduler_batch_size),
            scheduler_max_windows: env_usize("WORKFLOW_SCHEDULER_MAX_WINDOWS", defaults.scheduler_max_windows),
            scheduler_advisory_locks: env_bool("WORKFLOW_SCHEDULER_ADVISORY_LOCKS", defaults.scheduler_advisory_locks),
            scheduler_leader_keepalive: Duration::from_millis(env_u64(
                "WORKFLOW_SCHEDULER_LEADER_KEEPALIVE_MS",
                defaults.scheduler_leader_keepalive.as_millis() as u64,
            )),
        }
    }

    pub fn resolve_concurrency_limit(&self, metadata_max_parallel: Option<usize>, parameters_concurrency: Option<usize>, step_count: usize) -> usize {
        let candidate = self
            .max_parallel
            .or(metadata_max_parallel)
            .or(parameters_concurrency)
            .unwrap_or(1);
        candidate.max(1).min(step_count.max(1))
    }

    pub fn retry_config(&self) -> crate::reliability::WorkflowRetryConfig {
        crate::reliability::WorkflowRetryConfig {
            base_ms: self.retry_base_ms,
            factor: self.retry_factor,
            max_ms: self.retry_max_ms,
            jitter_ratio: self.retry_jitter_ratio,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrency_limit_is_clamped_to_step_count() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.resolve_concurrency_limit(None, Some(50), 3), 3);
    }

    #[test]
    fn concurrency_limit_prefers_env_override() {
        let mut config = OrchestratorConfig::default();
        config.max_parallel = Some(2);
        assert_eq!(config.resolve_concurrency_limit(Some(8), Some(8), 10), 2);
    }
}
