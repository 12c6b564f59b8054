//! Worker-side concerns: the heartbeat monitor that reclaims stalled steps,
//! the in-process job runner, and the backpressure state a runner's handler
//! pool can use to self-throttle.

mod backpressure;
mod heartbeat;
mod runner;

pub use backpressure::{BackpressureConfig, BackpressureError, BackpressureState};
pub use heartbeat::{HeartbeatMonitor, HeartbeatMonitorConfig};
pub use runner::{
    BundleOverride, InProcessJobRunner, JobRun, JobRunRequest, JobRunStatus, JobRunner, JobRunnerConfig,
    JobRunnerError,
};
