//! Workflow execution engine: the run orchestrator, the DAG scheduler
//! that drives one workflow run from `pending` to a terminal status by
//! dispatching to the step executors under [`crate::activity`].

mod executor;

pub use executor::{ExecutorConfig, ExecutorError, RunOrchestrator};
