use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::MigrationConfig;

macro_rules! status_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!("unknown {} '{}'", stringify!($name), other)),
                }
            }
        }
    };
}

status_enum!(JobStatus {
    Pending => "pending",
    Running => "running",
    Paused => "paused",
    Completed => "completed",
    Failed => "failed",
    RollingBack => "rolling_back",
    RollbackFailed => "rollback_failed",
});

status_enum!(BatchStatus {
    Pending => "pending",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
});

status_enum!(ItemStatus {
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
});

impl ItemStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemStatus::Completed | ItemStatus::Failed)
    }
}

/// A source record whose binary asset is being relocated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PhotoRecord {
    pub id: String,
    pub item_id: Option<String>,
    /// Key of the original blob in the source store.
    pub file_path: Option<String>,
    pub file_size: Option<u64>,
    pub mime_type: Option<String>,
    pub storage_key: Option<String>,
    pub storage_url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PhotoRecord {
    /// Has a local original and no migrated location yet.
    pub fn is_eligible(&self) -> bool {
        self.file_path.is_some() && self.storage_key.is_none()
    }
}

/// Pre-migration copy of every eligible record, captured once per job.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RollbackSnapshot {
    pub captured_at: DateTime<Utc>,
    pub records: Vec<PhotoRecord>,
}

impl RollbackSnapshot {
    pub fn capture(records: Vec<PhotoRecord>) -> Self {
        Self {
            captured_at: Utc::now(),
            records,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MigrationJob {
    pub id: String,
    pub status: JobStatus,
    pub batch_size: usize,
    pub total_items: u64,
    pub processed_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub skipped_count: u64,
    pub config: MigrationConfig,
    pub rollback_snapshot: Option<RollbackSnapshot>,
    pub error_details: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub resumed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub rolled_back_at: Option<DateTime<Utc>>,
}

impl MigrationJob {
    pub fn new(id: &str, config: MigrationConfig, total_items: u64) -> Self {
        Self {
            id: id.to_string(),
            status: JobStatus::Pending,
            batch_size: config.batch_size,
            total_items,
            processed_count: 0,
            success_count: 0,
            error_count: 0,
            skipped_count: 0,
            config,
            rollback_snapshot: None,
            error_details: Vec::new(),
            created_at: Utc::now(),
            started_at: None,
            paused_at: None,
            resumed_at: None,
            completed_at: None,
            rolled_back_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MigrationBatch {
    pub id: String,
    pub job_id: String,
    pub batch_number: u32,
    /// Fixed at creation.
    pub item_ids: Vec<String>,
    pub status: BatchStatus,
    pub processed_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub skipped_count: u64,
    pub errors: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub processing_time_ms: Option<u64>,
}

impl MigrationBatch {
    pub fn new(job_id: &str, batch_number: u32, item_ids: Vec<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            job_id: job_id.to_string(),
            batch_number,
            item_ids,
            status: BatchStatus::Pending,
            processed_count: 0,
            success_count: 0,
            error_count: 0,
            skipped_count: 0,
            errors: Vec::new(),
            started_at: None,
            completed_at: None,
            processing_time_ms: None,
        }
    }
}

/// Splits ids into consecutive batches of at most `batch_size`, numbered from 1.
pub fn partition(job_id: &str, ids: &[String], batch_size: usize) -> Vec<MigrationBatch> {
    ids.chunks(batch_size.max(1))
        .enumerate()
        .map(|(i, chunk)| MigrationBatch::new(job_id, i as u32 + 1, chunk.to_vec()))
        .collect()
}

/// One attempt at migrating one record.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationItem {
    pub id: String,
    pub job_id: String,
    pub batch_id: String,
    pub photo_id: String,
    pub attempt: u32,
    pub original_path: Option<String>,
    pub original_size: Option<u64>,
    pub status: ItemStatus,
    pub processed_size: Option<u64>,
    pub destination_keys: Vec<String>,
    pub destination_url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub error_message: Option<String>,
    pub error_code: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl MigrationItem {
    pub fn complete(&mut self, location: &MigratedLocation) {
        self.status = ItemStatus::Completed;
        self.processed_size = Some(location.processed_size);
        self.destination_keys = location.destination_keys.clone();
        self.destination_url = Some(location.storage_url.clone());
        self.thumbnail_url = location.thumbnail_url.clone();
        self.completed_at = Some(Utc::now());
    }

    pub fn fail(&mut self, message: &str, code: &str) {
        self.status = ItemStatus::Failed;
        self.error_message = Some(message.to_string());
        self.error_code = Some(code.to_string());
        self.completed_at = Some(Utc::now());
    }
}

/// Where a record's asset ended up.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MigratedLocation {
    pub storage_key: String,
    pub storage_url: String,
    pub thumbnail_url: Option<String>,
    /// Every object written for the record, including the primary.
    pub destination_keys: Vec<String>,
    pub processed_size: u64,
}

/// Summary of a job returned to callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MigrationResult {
    pub job_id: String,
    pub status: JobStatus,
    pub total_items: u64,
    pub processed_count: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub skipped_count: u64,
    pub total_batches: u32,
    pub completed_batches: u32,
    pub error_details: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub rolled_back_at: Option<DateTime<Utc>>,
}

impl MigrationResult {
    pub fn from_job(job: &MigrationJob, batches: &[MigrationBatch]) -> Self {
        Self {
            job_id: job.id.clone(),
            status: job.status,
            total_items: job.total_items,
            processed_count: job.processed_count,
            success_count: job.success_count,
            error_count: job.error_count,
            skipped_count: job.skipped_count,
            total_batches: batches.len() as u32,
            completed_batches: batches
                .iter()
                .filter(|b| b.status == BatchStatus::Completed)
                .count() as u32,
            error_details: job.error_details.clone(),
            started_at: job.started_at,
            completed_at: job.completed_at,
            rolled_back_at: job.rolled_back_at,
        }
    }
}
