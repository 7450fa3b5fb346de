//! Migration jobs: model, persistence, per-item processing and the
//! orchestrator that drives them.

pub mod cancel;
pub mod collaborators;
pub mod model;
pub mod orchestrator;
pub mod processor;
pub mod retry;
pub mod rollback;
pub mod store;

pub use cancel::PauseToken;
pub use collaborators::{CdnInvalidator, ErrorTracker, InvalidationReceipt, LogErrorTracker};
pub use model::{
    BatchStatus, ItemStatus, JobStatus, MigratedLocation, MigrationBatch, MigrationItem,
    MigrationJob, MigrationResult, PhotoRecord, RollbackSnapshot,
};
pub use orchestrator::{MigrationOrchestrator, OrchestratorDeps};
pub use processor::{
    register_transcoder, ItemProcessor, PassthroughTranscoder, PoolItemProcessor, Transcoder,
    TRANSCODE_METHOD,
};
pub use retry::{backoff_delay, with_retry, ErrorClass};
pub use rollback::RollbackReport;
pub use store::{MigrationStore, SqliteMigrationStore};
