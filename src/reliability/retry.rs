//! Retry delay computation for job/service step executors.
//!
//! Two distinct calculations are in play:
//! - `calculate_retry_delay` is the in-loop backoff a service step executor
//!   uses between attempts it runs itself, driven by the step's own
//!   [`StepRetryPolicy`].
//! - `compute_workflow_retry_timestamp` is what the orchestrator uses to
//!   schedule a *new* run worker invocation (a step reverting to `pending`
//!   with `retryState=scheduled`); it falls back to a jittered exponential
//!   backoff when the step's own policy yields a zero delay.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::model::{RetryStrategy, StepRetryPolicy};

/// `WORKFLOW_RETRY_*` environment-tunable fallback backoff parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkflowRetryConfig {
    pub base_ms: u64,
    pub factor: f64,
    pub max_ms: u64,
    pub jitter_ratio: f64,
}

impl Default for WorkflowRetryConfig {
    fn default() -> Self {
        Self { base_ms: 5_000, factor: 2.0, max_ms: 1_800_000, jitter_ratio: 0.2 }
    }
}

/// In-loop backoff between a service step's own retry attempts.
/// `attempt` is the attempt about to be made (1-based).
pub fn calculate_retry_delay(attempt: u32, policy: &StepRetryPolicy) -> Duration {
    match policy.strategy {
        RetryStrategy::None => Duration::ZERO,
        RetryStrategy::Fixed => Duration::from_millis(policy.initial_delay_ms.min(policy.max_delay_ms)),
        RetryStrategy::Exponential => {
            if attempt <= 1 {
                return Duration::from_millis(policy.initial_delay_ms.min(policy.max_delay_ms));
            }
            let exponent = (attempt - 2).max(0) as i32;
            let millis = (policy.initial_delay_ms as f64) * 2f64.powi(exponent);
            Duration::from_millis((millis as u64).min(policy.max_delay_ms))
        }
    }
}

/// Timestamp at which the orchestrator should re-attempt a step, falling
/// back to jittered exponential backoff when the step's policy delay is
/// zero (strategy `none` with no explicit interval).
pub fn compute_workflow_retry_timestamp(
    next_attempt: u32,
    policy: Option<&StepRetryPolicy>,
    config: &WorkflowRetryConfig,
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let policy_delay = policy.map(|p| calculate_retry_delay(next_attempt, p)).unwrap_or(Duration::ZERO);
    let delay = if policy_delay.is_zero() {
        fallback_backoff(next_attempt, config)
    } else {
        policy_delay
    };
    now + chrono::Duration::from_std(delay).unwrap_or_default()
}

fn fallback_backoff(attempt: u32, config: &WorkflowRetryConfig) -> Duration {
    let exponent = attempt.saturating_sub(1) as i32;
    let base = (config.base_ms as f64) * config.factor.powi(exponent);
    let capped = base.min(config.max_ms as f64);
    let jitter_range = capped * config.jitter_ratio;
    let jittered = if jitter_range > 0.0 {
        let mut rng = rand::thread_rng();
        (capped + rng.gen_range(-jitter_range..jitter_range)).max(0.0)
    } else {
        capped
    };
    Duration::from_millis(jittered as u64)
}

/// Whether another attempt remains given a step's declared retry policy.
/// `None`/missing `max_attempts` means unbounded retries.
pub fn has_attempts_remaining(current_attempt: u32, policy: Option<&StepRetryPolicy>) -> bool {
    match policy.and_then(|p| p.max_attempts) {
        Some(max) => current_attempt < max,
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::StepRetryPolicy;

    fn fixed_policy(ms: u64, max_attempts: u32) -> StepRetryPolicy {
        StepRetryPolicy {
            max_attempts: Some(max_attempts),
            strategy: RetryStrategy::Fixed,
            initial_delay_ms: ms,
            max_delay_ms: ms.max(1),
        }
    }

    #[test]
    fn none_strategy_never_delays() {
        let policy = StepRetryPolicy { max_attempts: Some(1), strategy: RetryStrategy::None, ..Default::default() };
        assert_eq!(calculate_retry_delay(1, &policy), Duration::ZERO);
    }

    #[test]
    fn fixed_strategy_is_constant() {
        let policy = fixed_policy(10, 3);
        assert_eq!(calculate_retry_delay(2, &policy), Duration::from_millis(10));
        assert_eq!(calculate_retry_delay(3, &policy), Duration::from_millis(10));
    }

    #[test]
    fn exponential_strategy_doubles() {
        let policy = StepRetryPolicy {
            max_attempts: Some(5),
            strategy: RetryStrategy::Exponential,
            initial_delay_ms: 100,
            max_delay_ms: 10_000,
        };
        assert_eq!(calculate_retry_delay(2, &policy), Duration::from_millis(100));
        assert_eq!(calculate_retry_delay(3, &policy), Duration::from_millis(200));
        assert_eq!(calculate_retry_delay(4, &policy), Duration::from_millis(400));
    }

    #[test]
    fn exponential_is_clamped_to_max() {
        let policy = StepRetryPolicy {
            max_attempts: Some(10),
            strategy: RetryStrategy::Exponential,
            initial_delay_ms: 1_000,
            max_delay_ms: 3_000,
        };
        assert_eq!(calculate_retry_delay(8, &policy), Duration::from_millis(3_000));
    }

    #[test]
    fn fallback_used_when_policy_delay_is_zero() {
        let config = WorkflowRetryConfig { jitter_ratio: 0.0, ..Default::default() };
        let ts = compute_workflow_retry_timestamp(2, None, &config, Utc::now());
        let now = Utc::now();
        assert!(ts > now);
    }

    #[test]
    fn unbounded_when_max_attempts_missing() {
        let policy = StepRetryPolicy { max_attempts: None, ..Default::default() };
        assert!(has_attempts_remaining(1_000_000, Some(&policy)));
    }

    #[test]
    fn bounded_policy_exhausts() {
        let policy = fixed_policy(10, 3);
        assert!(has_attempts_remaining(2, Some(&policy)));
        assert!(!has_attempts_remaining(3, Some(&policy)));
    }
}
