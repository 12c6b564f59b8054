//! # Workflow Orchestration Core
//!
//! A DAG-based workflow orchestrator: definitions declare job/service/fan-out
//! steps with `dependsOn` edges, and a run driven by [`engine::RunOrchestrator`]
//! schedules them with bounded concurrency until the run reaches a terminal
//! status.
//!
//! ## Features
//!
//! - **Dependency-gated scheduling**: steps run as soon as every dependency
//!   has succeeded, bounded by a resolved `concurrencyLimit`
//! - **Fan-out**: one step template expanded over a resolved collection, with
//!   its own per-parent concurrency cap and aggregated settlement
//! - **Automatic retries**: per-step policies (`none`/`fixed`/`exponential`)
//!   plus an orchestrator-level jittered backoff fallback
//! - **Heartbeat-driven stall recovery**: [`worker::HeartbeatMonitor`]
//!   reconciles steps whose worker went quiet
//! - **Asset production and recovery**: TTL/cadence expiry scheduling and an
//!   asset-recovery manager that parks consumers until a producer run settles
//! - **Leader-elected cron materialization**: [`cron::CronScheduler`] ticks
//!   due schedules with catch-up, guarded by an optimistic `updatedAt` check
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      RunOrchestrator                          │
//! │  (DAG scheduler: dependency gating, fan-out, concurrency)    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!               dispatches to  ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │            activity::{job, service, fanout}                  │
//! │  (per-step state machines sharing the StepDeps port bundle)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │         persistence::{RepositoryPort, QueuePort}              │
//! │  (Postgres or in-memory; inline or external task queue)     │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use workflow_core::prelude::*;
//!
//! let repo = Arc::new(InMemoryRepository::new());
//! let (queue, _rx) = InlineQueue::new();
//! let deps = StepDeps {
//!     repo: repo.clone(),
//!     queue: Arc::new(queue),
//!     job_runner: Arc::new(InProcessJobRunner::new(JobRunnerConfig::default())),
//!     services: my_service_registry,
//!     secrets: Arc::new(NullSecretStore),
//!     events: Arc::new(NullEventSink),
//!     config: OrchestratorConfig::from_env(),
//! };
//! let orchestrator = RunOrchestrator::new(deps);
//! let run = orchestrator.run(&run_id).await?;
//! ```

pub mod activity;
pub mod assets;
pub mod config;
pub mod cron;
pub mod engine;
pub mod error;
pub mod events;
pub mod model;
pub mod persistence;
pub mod recovery;
pub mod reliability;
pub mod secrets;
pub mod services;
pub mod telemetry;
pub mod template;
pub mod worker;

/// Prelude for common imports.
pub mod prelude {
    pub use crate::activity::{StepDeps, StepError, StepExecutionResult};
    pub use crate::config::OrchestratorConfig;
    pub use crate::cron::CronScheduler;
    pub use crate::engine::RunOrchestrator;
    pub use crate::error::{OrchestratorError, OrchestratorResult};
    pub use crate::events::{EventSink, NullEventSink, WorkflowEvent};
    pub use crate::model::{RunStatus, WorkflowDefinition, WorkflowRun, WorkflowRunStepStatus};
    pub use crate::persistence::{InMemoryRepository, InlineQueue, QueuePort, RepositoryPort};
    pub use crate::secrets::{NullSecretStore, SecretStore};
    pub use crate::services::ServiceRegistry;
    pub use crate::worker::{HeartbeatMonitor, InProcessJobRunner, JobRunnerConfig};
}

// Re-export the most commonly used types at crate root.
pub use config::OrchestratorConfig;
pub use engine::RunOrchestrator;
pub use error::{OrchestratorError, OrchestratorResult};
