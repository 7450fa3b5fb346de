//! Outbound collaborators the orchestrator reports to.

use serde::{Deserialize, Serialize};

use crate::error::{MigrationError, StorageError};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationReceipt {
    pub invalidation_id: String,
    pub status: String,
}

/// Content-delivery cache invalidation. Failures are logged by the caller
/// and never fail a job.
pub trait CdnInvalidator: Send + Sync {
    fn invalidate(&self, paths: &[String]) -> Result<InvalidationReceipt, StorageError>;
}

/// Receives errors that exhausted their retry budget without a known cause.
pub trait ErrorTracker: Send + Sync {
    fn report(&self, context: &str, error: &MigrationError);
}

/// Default tracker: writes the error to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogErrorTracker;

impl ErrorTracker for LogErrorTracker {
    fn report(&self, context: &str, error: &MigrationError) {
        log::error!("Unclassified failure during {}: {} ({})", context, error, error.code());
    }
}
