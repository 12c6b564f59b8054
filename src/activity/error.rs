//! Step executor error kinds. These never unwind out of `execute`: every
//! variant is caught at the executor boundary and translated into a
//! `StepExecutionResult` (failed/retry-scheduled), matching the propagation
//! policy that per-step errors never abort the run worker.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StepError {
    #[error("parameter resolution failed: {0}")]
    ParameterResolutionFailed(String),

    #[error("job execution failed: {0}")]
    JobFailed(String),

    #[error("service invocation failed: {0}")]
    ServiceInvocationFailed(String),

    #[error("step exceeded heartbeat timeout")]
    HeartbeatTimeout,

    #[error("fan-out expansion failed: {0}")]
    FanOutExpansionFailed(String),

    #[error("dependency {0} has not succeeded")]
    DependencyBlocked(String),
}

impl StepError {
    pub fn failure_reason(&self) -> &'static str {
        match self {
            StepError::ParameterResolutionFailed(_) => "parameter_resolution_failed",
            StepError::JobFailed(_) => "job_execution_failed",
            StepError::ServiceInvocationFailed(_) => "service_invocation_failed",
            StepError::HeartbeatTimeout => "heartbeat-timeout",
            StepError::FanOutExpansionFailed(_) => "fanout_expansion_failed",
            StepError::DependencyBlocked(_) => "dependency_blocked",
        }
    }
}
