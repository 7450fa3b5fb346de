pub mod broadcast;
pub mod config;
pub mod db;
pub mod error;
pub mod guard;
pub mod migration;
pub mod storage;
pub mod telemetry;
pub mod worker;

pub use broadcast::{GuardEventBroadcaster, MigrationProgressBroadcaster, PoolEventBroadcaster};
pub use config::{load_config, Config, MigrationConfig};
pub use db::Database;
pub use error::{
    ConfigError, GuardError, MigrationError, PoolError, RelocatorError, Result, StorageError,
};
pub use guard::{CircuitBreaker, CostGuard, UsageMonitor, UsageWatchdog};
pub use migration::{
    MigrationOrchestrator, MigrationResult, OrchestratorDeps, PoolItemProcessor,
    SqliteMigrationStore,
};
pub use storage::{FilesystemObjectStore, MemoryObjectStore, ObjectStore};
pub use telemetry::init_logging;
pub use worker::{TaskRegistry, WorkerPool};
