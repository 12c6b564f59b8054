//! Persistence layer: the [`RepositoryPort`] trait plus its two
//! implementations ([`InMemoryRepository`] for tests, [`PostgresRepository`]
//! for production), and the [`QueuePort`]/[`InlineQueue`] job-scheduling
//! side used for retries and asset expiry.

mod memory;
mod postgres;
mod queue;
mod store;

pub use memory::InMemoryRepository;
pub use postgres::PostgresRepository;
pub use queue::{AssetExpiryPayload, AssetExpiryReason, InlineQueue, QueueError, QueuePort, QueuedJob};
pub use store::{
    CreateRunInput, DueSchedulesQuery, EnsureRecoveryRequestInput, FailedStepRecord, NewAsset, RepoResult,
    RepositoryError, RepositoryPort, RunPatch, RunStepPatch, WorkerInfo,
};
