use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::guard::QuotaMetric;

#[derive(Error, Debug)]
pub enum RelocatorError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Worker pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Guard rejected operation: {0}")]
    Guard(#[from] GuardError),

    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },

    #[error("Failed to initialize logging: {0}")]
    Logging(String),
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Object not found: {key}")]
    NotFound { key: String },

    #[error("Access denied: {0}")]
    PermissionDenied(String),

    #[error("Storage quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Network failure: {0}")]
    Network(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Invalid object key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("Bucket or root is not configured: {0}")]
    Misconfigured(String),

    #[error("I/O error for '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Storage error: {0}")]
    Other(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PoolError {
    #[error("Task {task_id} ({method}) timed out after {timeout_ms}ms")]
    Timeout {
        task_id: u64,
        method: String,
        timeout_ms: u64,
    },

    #[error("Worker {worker_id} crashed: {reason}")]
    WorkerCrashed { worker_id: u64, reason: String },

    #[error("Task failed: {0}")]
    TaskFailed(String),

    #[error("No handler registered for method '{0}'")]
    UnknownMethod(String),

    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(String),

    #[error("Worker pool has been terminated")]
    Terminated,

    #[error("Worker channel closed unexpectedly")]
    ChannelClosed,
}

/// Rejections issued by the circuit breaker / cost guard.
///
/// Kept apart from storage and pool errors so callers can tell
/// "would exceed quota" from "operation failed".
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GuardError {
    #[error("Operations suspended by circuit breaker: {reason}")]
    Suspended { reason: String },

    #[error("Quota exceeded: {metric} would reach {percentage:.1}% of its limit")]
    QuotaExceeded { metric: QuotaMetric, percentage: f64 },
}

#[derive(Error, Debug)]
pub enum MigrationError {
    #[error("Migration {job_id} is already running")]
    AlreadyRunning { job_id: String },

    #[error("No migration is currently running")]
    NotRunning,

    #[error("No eligible records to migrate")]
    NoEligibleItems,

    #[error("Migration job not found: {0}")]
    JobNotFound(String),

    #[error("Cannot {operation} job {job_id} while it is {status}")]
    InvalidState {
        job_id: String,
        status: String,
        operation: &'static str,
    },

    #[error("Pre-flight check failed: {0}")]
    PreflightFailed(String),

    #[error("Invalid migration config: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Guard(#[from] GuardError),

    #[error("Storage failure: {0}")]
    Storage(#[from] StorageError),

    #[error("Worker pool failure: {0}")]
    Pool(#[from] PoolError),

    #[error("Persistence failure: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Transformation failed: {0}")]
    Transform(String),

    #[error("Post-migration validation failed: {0}")]
    ValidationFailed(String),

    #[error("Rollback failed: {0}")]
    RollbackFailed(String),
}

impl MigrationError {
    /// Short machine-readable code stored on failed migration items.
    pub fn code(&self) -> &'static str {
        match self {
            MigrationError::AlreadyRunning { .. } => "ALREADY_RUNNING",
            MigrationError::NotRunning => "NOT_RUNNING",
            MigrationError::NoEligibleItems => "NO_ELIGIBLE_ITEMS",
            MigrationError::JobNotFound(_) => "JOB_NOT_FOUND",
            MigrationError::InvalidState { .. } => "INVALID_STATE",
            MigrationError::PreflightFailed(_) => "PREFLIGHT_FAILED",
            MigrationError::InvalidConfig(_) => "INVALID_CONFIG",
            MigrationError::Guard(GuardError::Suspended { .. }) => "CIRCUIT_OPEN",
            MigrationError::Guard(GuardError::QuotaExceeded { .. }) => "QUOTA_EXCEEDED",
            MigrationError::Storage(StorageError::NotFound { .. }) => "SOURCE_NOT_FOUND",
            MigrationError::Storage(_) => "STORAGE_ERROR",
            MigrationError::Pool(PoolError::Timeout { .. }) => "TASK_TIMEOUT",
            MigrationError::Pool(_) => "WORKER_ERROR",
            MigrationError::Database(_) => "DATABASE_ERROR",
            MigrationError::Transform(_) => "TRANSFORM_FAILED",
            MigrationError::ValidationFailed(_) => "VALIDATION_FAILED",
            MigrationError::RollbackFailed(_) => "ROLLBACK_FAILED",
        }
    }
}

pub type Result<T> = std::result::Result<T, RelocatorError>;
