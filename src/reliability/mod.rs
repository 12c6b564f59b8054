//! Reliability patterns shared by step executors and the run orchestrator.
//!
//! - [`calculate_retry_delay`]/[`compute_workflow_retry_timestamp`] — the
//!   two backoff calculations driving in-loop service retries and
//!   orchestrator-scheduled step re-attempts.

mod retry;

pub use retry::{
    calculate_retry_delay, compute_workflow_retry_timestamp, has_attempts_remaining, WorkflowRetryConfig,
};
