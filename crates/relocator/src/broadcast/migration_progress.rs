//! Migration progress broadcaster for job status streaming.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Phase of a migration job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MigrationPhase {
    Initializing,
    Snapshot,
    Processing,
    BatchCompleted,
    Paused,
    Validating,
    Completed,
    Failed,
    RollingBack,
    RolledBack,
    RollbackFailed,
}

impl std::fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationPhase::Initializing => write!(f, "Initializing"),
            MigrationPhase::Snapshot => write!(f, "Capturing rollback snapshot"),
            MigrationPhase::Processing => write!(f, "Processing"),
            MigrationPhase::BatchCompleted => write!(f, "Batch completed"),
            MigrationPhase::Paused => write!(f, "Paused"),
            MigrationPhase::Validating => write!(f, "Validating"),
            MigrationPhase::Completed => write!(f, "Completed"),
            MigrationPhase::Failed => write!(f, "Failed"),
            MigrationPhase::RollingBack => write!(f, "Rolling back"),
            MigrationPhase::RolledBack => write!(f, "Rolled back"),
            MigrationPhase::RollbackFailed => write!(f, "Rollback failed"),
        }
    }
}

/// Progress event for a migration job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationProgressEvent {
    pub job_id: String,
    pub phase: MigrationPhase,
    /// Batch the event refers to, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_number: Option<u32>,
    pub total_batches: u32,
    pub total_items: u64,
    pub processed: u64,
    pub success: u64,
    pub errors: u64,
    pub skipped: u64,
    /// Fraction of eligible items accounted for, in `0.0..=1.0`.
    pub fraction: f64,
    /// Estimated seconds remaining, once at least one batch has finished.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<u64>,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

impl MigrationProgressEvent {
    pub fn new(job_id: &str, phase: MigrationPhase, message: &str) -> Self {
        Self {
            job_id: job_id.to_string(),
            phase,
            batch_number: None,
            total_batches: 0,
            total_items: 0,
            processed: 0,
            success: 0,
            errors: 0,
            skipped: 0,
            fraction: 0.0,
            eta_seconds: None,
            message: message.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_batch(mut self, batch_number: u32, total_batches: u32) -> Self {
        self.batch_number = Some(batch_number);
        self.total_batches = total_batches;
        self
    }

    /// Fills the counters and derives `fraction`.
    pub fn with_counts(
        mut self,
        total_items: u64,
        processed: u64,
        success: u64,
        errors: u64,
        skipped: u64,
    ) -> Self {
        self.total_items = total_items;
        self.processed = processed;
        self.success = success;
        self.errors = errors;
        self.skipped = skipped;
        self.fraction = if total_items == 0 {
            0.0
        } else {
            ((processed + skipped) as f64 / total_items as f64).min(1.0)
        };
        self
    }

    pub fn with_eta(mut self, eta_seconds: Option<u64>) -> Self {
        self.eta_seconds = eta_seconds;
        self
    }
}

/// Broadcasts migration progress events for streaming.
#[derive(Clone)]
pub struct MigrationProgressBroadcaster {
    sender: Arc<broadcast::Sender<MigrationProgressEvent>>,
}

impl MigrationProgressBroadcaster {
    /// Creates a new broadcaster with the specified channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Sends a progress event to all subscribers.
    pub fn send(&self, event: MigrationProgressEvent) {
        // No active receivers is fine
        let _ = self.sender.send(event);
    }

    /// Creates a new subscriber for progress events.
    pub fn subscribe(&self) -> broadcast::Receiver<MigrationProgressEvent> {
        self.sender.subscribe()
    }
}

impl Default for MigrationProgressBroadcaster {
    fn default() -> Self {
        Self::new(100)
    }
}
