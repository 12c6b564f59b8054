//! Top-level error type unifying subsystem errors at binary/test boundaries.
//! Individual subsystems (`persistence`, `activity`, `template`) keep their
//! own `thiserror` enums; this type exists for call sites that need to hand
//! one error back across module boundaries (e.g. the orchestrator, CLI
//! entry points).

use thiserror::Error;

use crate::activity::StepError;
use crate::persistence::{QueueError, RepositoryError};

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("step execution error: {0}")]
    Step(#[from] StepError),

    #[error("workflow definition {0} not found")]
    DefinitionNotFound(String),

    #[error("workflow orchestration failed: {0}")]
    Orchestration(String),
}

pub type OrchestratorResult<T> = Result<T, OrchestratorError>;
