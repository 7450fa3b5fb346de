//! Persistence seam for the orchestrator.
//!
//! `SqliteMigrationStore` maps the raw repository rows onto the migration
//! model; tests and alternative backends can implement `MigrationStore`
//! directly.

use std::collections::HashSet;

use chrono::Utc;

use crate::db::job_repo::JobTimestamp;
use crate::db::photo_repo::PhotoRow;
use crate::db::{
    batch_repo, format_timestamp, from_json, item_repo, job_repo, parse_optional_timestamp,
    parse_timestamp, photo_repo, to_json, Database, DatabaseError,
};

use super::model::{
    BatchStatus, ItemStatus, JobStatus, MigratedLocation, MigrationBatch, MigrationItem,
    MigrationJob, PhotoRecord, RollbackSnapshot,
};

pub trait MigrationStore: Send + Sync {
    fn count_eligible(&self) -> Result<u64, DatabaseError>;
    fn list_eligible_ids(&self) -> Result<Vec<String>, DatabaseError>;
    /// Missing ids are left out of the result.
    fn find_photos(&self, ids: &[String]) -> Result<Vec<PhotoRecord>, DatabaseError>;
    fn find_photo(&self, id: &str) -> Result<Option<PhotoRecord>, DatabaseError>;
    fn apply_migration(&self, photo_id: &str, location: &MigratedLocation)
        -> Result<(), DatabaseError>;
    fn clear_source_path(&self, photo_id: &str) -> Result<(), DatabaseError>;
    /// Writes a snapshotted record back verbatim. Returns false if the
    /// record no longer exists.
    fn restore_photo(&self, record: &PhotoRecord) -> Result<bool, DatabaseError>;

    fn create_job(&self, job: &MigrationJob) -> Result<(), DatabaseError>;
    fn find_job(&self, id: &str) -> Result<Option<MigrationJob>, DatabaseError>;
    fn jobs_with_status(&self, status: JobStatus) -> Result<Vec<String>, DatabaseError>;
    fn update_job_status(
        &self,
        id: &str,
        status: JobStatus,
        stamp: Option<JobTimestamp>,
    ) -> Result<(), DatabaseError>;
    fn increment_job_counts(
        &self,
        id: &str,
        success: u64,
        errors: u64,
        skipped: u64,
    ) -> Result<(), DatabaseError>;
    fn append_job_error(&self, id: &str, message: &str) -> Result<(), DatabaseError>;
    /// Write-once; a second capture fails with `DatabaseError::AlreadySet`.
    fn capture_rollback_snapshot(
        &self,
        id: &str,
        snapshot: &RollbackSnapshot,
    ) -> Result<(), DatabaseError>;

    fn create_batches(&self, batches: &[MigrationBatch]) -> Result<(), DatabaseError>;
    fn list_batches(&self, job_id: &str) -> Result<Vec<MigrationBatch>, DatabaseError>;
    fn update_batch(&self, batch: &MigrationBatch) -> Result<(), DatabaseError>;

    /// Records a new `Processing` attempt for `photo`.
    fn start_item(
        &self,
        job_id: &str,
        batch_id: &str,
        photo: &PhotoRecord,
    ) -> Result<MigrationItem, DatabaseError>;
    fn finish_item(&self, item: &MigrationItem) -> Result<(), DatabaseError>;
    fn list_items(
        &self,
        job_id: &str,
        status: Option<ItemStatus>,
    ) -> Result<Vec<MigrationItem>, DatabaseError>;
    fn terminal_photo_ids(&self, batch_id: &str) -> Result<HashSet<String>, DatabaseError>;
}

#[derive(Clone)]
pub struct SqliteMigrationStore {
    db: Database,
}

impl SqliteMigrationStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

fn parse_status<T: std::str::FromStr>(value: &str) -> Result<T, DatabaseError> {
    value.parse().map_err(|_| DatabaseError::CorruptValue {
        column: "status",
        value: value.to_string(),
    })
}

fn count(column: &'static str, value: i64) -> Result<u64, DatabaseError> {
    u64::try_from(value).map_err(|_| DatabaseError::CorruptValue {
        column,
        value: value.to_string(),
    })
}

pub(crate) fn photo_to_row(photo: &PhotoRecord) -> PhotoRow {
    PhotoRow {
        id: photo.id.clone(),
        item_id: photo.item_id.clone(),
        file_path: photo.file_path.clone(),
        file_size: photo.file_size.map(|s| s as i64),
        mime_type: photo.mime_type.clone(),
        storage_key: photo.storage_key.clone(),
        storage_url: photo.storage_url.clone(),
        thumbnail_url: photo.thumbnail_url.clone(),
        created_at: format_timestamp(photo.created_at),
        updated_at: format_timestamp(photo.updated_at),
    }
}

fn photo_from_row(row: PhotoRow) -> Result<PhotoRecord, DatabaseError> {
    Ok(PhotoRecord {
        file_size: row
            .file_size
            .map(|s| count("file_size", s))
            .transpose()?,
        created_at: parse_timestamp("created_at", &row.created_at)?,
        updated_at: parse_timestamp("updated_at", &row.updated_at)?,
        id: row.id,
        item_id: row.item_id,
        file_path: row.file_path,
        mime_type: row.mime_type,
        storage_key: row.storage_key,
        storage_url: row.storage_url,
        thumbnail_url: row.thumbnail_url,
    })
}

fn job_to_row(job: &MigrationJob) -> Result<job_repo::JobRow, DatabaseError> {
    Ok(job_repo::JobRow {
        id: job.id.clone(),
        status: job.status.as_str().to_string(),
        batch_size: job.batch_size as i64,
        total_items: job.total_items as i64,
        processed_count: job.processed_count as i64,
        success_count: job.success_count as i64,
        error_count: job.error_count as i64,
        skipped_count: job.skipped_count as i64,
        config: to_json("config", &job.config)?,
        rollback_snapshot: None,
        error_details: to_json("error_details", &job.error_details)?,
        created_at: format_timestamp(job.created_at),
        started_at: job.started_at.map(format_timestamp),
        paused_at: job.paused_at.map(format_timestamp),
        resumed_at: job.resumed_at.map(format_timestamp),
        completed_at: job.completed_at.map(format_timestamp),
        rolled_back_at: job.rolled_back_at.map(format_timestamp),
    })
}

fn job_from_row(row: job_repo::JobRow) -> Result<MigrationJob, DatabaseError> {
    Ok(MigrationJob {
        status: parse_status(&row.status)?,
        batch_size: count("batch_size", row.batch_size)? as usize,
        total_items: count("total_items", row.total_items)?,
        processed_count: count("processed_count", row.processed_count)?,
        success_count: count("success_count", row.success_count)?,
        error_count: count("error_count", row.error_count)?,
        skipped_count: count("skipped_count", row.skipped_count)?,
        config: from_json("config", &row.config)?,
        rollback_snapshot: row
            .rollback_snapshot
            .as_deref()
            .map(|s| from_json("rollback_snapshot", s))
            .transpose()?,
        error_details: from_json("error_details", &row.error_details)?,
        created_at: parse_timestamp("created_at", &row.created_at)?,
        started_at: parse_optional_timestamp("started_at", row.started_at.as_deref())?,
        paused_at: parse_optional_timestamp("paused_at", row.paused_at.as_deref())?,
        resumed_at: parse_optional_timestamp("resumed_at", row.resumed_at.as_deref())?,
        completed_at: parse_optional_timestamp("completed_at", row.completed_at.as_deref())?,
        rolled_back_at: parse_optional_timestamp(
            "rolled_back_at",
            row.rolled_back_at.as_deref(),
        )?,
        id: row.id,
    })
}

fn batch_to_row(batch: &MigrationBatch) -> Result<batch_repo::BatchRow, DatabaseError> {
    Ok(batch_repo::BatchRow {
        id: batch.id.clone(),
        job_id: batch.job_id.clone(),
        batch_number: i64::from(batch.batch_number),
        item_ids: to_json("item_ids", &batch.item_ids)?,
        status: batch.status.as_str().to_string(),
        processed_count: batch.processed_count as i64,
        success_count: batch.success_count as i64,
        error_count: batch.error_count as i64,
        skipped_count: batch.skipped_count as i64,
        errors: to_json("errors", &batch.errors)?,
        started_at: batch.started_at.map(format_timestamp),
        completed_at: batch.completed_at.map(format_timestamp),
        processing_time_ms: batch.processing_time_ms.map(|ms| ms as i64),
    })
}

fn batch_from_row(row: batch_repo::BatchRow) -> Result<MigrationBatch, DatabaseError> {
    let status: BatchStatus = parse_status(&row.status)?;
    Ok(MigrationBatch {
        batch_number: count("batch_number", row.batch_number)? as u32,
        item_ids: from_json("item_ids", &row.item_ids)?,
        status,
        processed_count: count("processed_count", row.processed_count)?,
        success_count: count("success_count", row.success_count)?,
        error_count: count("error_count", row.error_count)?,
        skipped_count: count("skipped_count", row.skipped_count)?,
        errors: from_json("errors", &row.errors)?,
        started_at: parse_optional_timestamp("started_at", row.started_at.as_deref())?,
        completed_at: parse_optional_timestamp("completed_at", row.completed_at.as_deref())?,
        processing_time_ms: row
            .processing_time_ms
            .map(|ms| count("processing_time_ms", ms))
            .transpose()?,
        id: row.id,
        job_id: row.job_id,
    })
}

fn item_to_row(item: &MigrationItem) -> Result<item_repo::ItemRow, DatabaseError> {
    Ok(item_repo::ItemRow {
        id: item.id.clone(),
        job_id: item.job_id.clone(),
        batch_id: item.batch_id.clone(),
        photo_id: item.photo_id.clone(),
        attempt: i64::from(item.attempt),
        original_path: item.original_path.clone(),
        original_size: item.original_size.map(|s| s as i64),
        status: item.status.as_str().to_string(),
        processed_size: item.processed_size.map(|s| s as i64),
        destination_keys: to_json("destination_keys", &item.destination_keys)?,
        destination_url: item.destination_url.clone(),
        thumbnail_url: item.thumbnail_url.clone(),
        error_message: item.error_message.clone(),
        error_code: item.error_code.clone(),
        started_at: format_timestamp(item.started_at),
        completed_at: item.completed_at.map(format_timestamp),
    })
}

fn item_from_row(row: item_repo::ItemRow) -> Result<MigrationItem, DatabaseError> {
    Ok(MigrationItem {
        attempt: count("attempt", row.attempt)? as u32,
        original_size: row
            .original_size
            .map(|s| count("original_size", s))
            .transpose()?,
        status: parse_status(&row.status)?,
        processed_size: row
            .processed_size
            .map(|s| count("processed_size", s))
            .transpose()?,
        destination_keys: from_json("destination_keys", &row.destination_keys)?,
        started_at: parse_timestamp("started_at", &row.started_at)?,
        completed_at: parse_optional_timestamp("completed_at", row.completed_at.as_deref())?,
        id: row.id,
        job_id: row.job_id,
        batch_id: row.batch_id,
        photo_id: row.photo_id,
        original_path: row.original_path,
        destination_url: row.destination_url,
        thumbnail_url: row.thumbnail_url,
        error_message: row.error_message,
        error_code: row.error_code,
    })
}

impl MigrationStore for SqliteMigrationStore {
    fn count_eligible(&self) -> Result<u64, DatabaseError> {
        photo_repo::count_eligible(&self.db)
    }

    fn list_eligible_ids(&self) -> Result<Vec<String>, DatabaseError> {
        photo_repo::list_eligible_ids(&self.db)
    }

    fn find_photos(&self, ids: &[String]) -> Result<Vec<PhotoRecord>, DatabaseError> {
        photo_repo::find_many(&self.db, ids)?
            .into_iter()
            .map(photo_from_row)
            .collect()
    }

    fn find_photo(&self, id: &str) -> Result<Option<PhotoRecord>, DatabaseError> {
        photo_repo::find_by_id(&self.db, id)?
            .map(photo_from_row)
            .transpose()
    }

    fn apply_migration(
        &self,
        photo_id: &str,
        location: &MigratedLocation,
    ) -> Result<(), DatabaseError> {
        photo_repo::set_storage_location(
            &self.db,
            photo_id,
            &location.storage_key,
            &location.storage_url,
            location.thumbnail_url.as_deref(),
            &format_timestamp(Utc::now()),
        )?;
        Ok(())
    }

    fn clear_source_path(&self, photo_id: &str) -> Result<(), DatabaseError> {
        photo_repo::clear_file_path(&self.db, photo_id, &format_timestamp(Utc::now()))?;
        Ok(())
    }

    fn restore_photo(&self, record: &PhotoRecord) -> Result<bool, DatabaseError> {
        let row = photo_to_row(record);
        let changed = photo_repo::restore(&self.db, &row, &row.updated_at)?;
        Ok(changed > 0)
    }

    fn create_job(&self, job: &MigrationJob) -> Result<(), DatabaseError> {
        job_repo::insert(&self.db, &job_to_row(job)?)
    }

    fn find_job(&self, id: &str) -> Result<Option<MigrationJob>, DatabaseError> {
        job_repo::find_by_id(&self.db, id)?
            .map(job_from_row)
            .transpose()
    }

    fn jobs_with_status(&self, status: JobStatus) -> Result<Vec<String>, DatabaseError> {
        job_repo::ids_by_status(&self.db, status.as_str())
    }

    fn update_job_status(
        &self,
        id: &str,
        status: JobStatus,
        stamp: Option<JobTimestamp>,
    ) -> Result<(), DatabaseError> {
        let now = format_timestamp(Utc::now());
        job_repo::update_status(
            &self.db,
            id,
            status.as_str(),
            stamp.map(|which| (which, now.as_str())),
        )
    }

    fn increment_job_counts(
        &self,
        id: &str,
        success: u64,
        errors: u64,
        skipped: u64,
    ) -> Result<(), DatabaseError> {
        job_repo::increment_counts(&self.db, id, success as i64, errors as i64, skipped as i64)
    }

    fn append_job_error(&self, id: &str, message: &str) -> Result<(), DatabaseError> {
        job_repo::append_error(&self.db, id, message)
    }

    fn capture_rollback_snapshot(
        &self,
        id: &str,
        snapshot: &RollbackSnapshot,
    ) -> Result<(), DatabaseError> {
        let json = to_json("rollback_snapshot", snapshot)?;
        job_repo::set_rollback_snapshot(&self.db, id, &json)
    }

    fn create_batches(&self, batches: &[MigrationBatch]) -> Result<(), DatabaseError> {
        let rows = batches
            .iter()
            .map(batch_to_row)
            .collect::<Result<Vec<_>, _>>()?;
        batch_repo::insert_all(&self.db, &rows)
    }

    fn list_batches(&self, job_id: &str) -> Result<Vec<MigrationBatch>, DatabaseError> {
        batch_repo::list_by_job(&self.db, job_id)?
            .into_iter()
            .map(batch_from_row)
            .collect()
    }

    fn update_batch(&self, batch: &MigrationBatch) -> Result<(), DatabaseError> {
        batch_repo::update_progress(&self.db, &batch_to_row(batch)?)
    }

    fn start_item(
        &self,
        job_id: &str,
        batch_id: &str,
        photo: &PhotoRecord,
    ) -> Result<MigrationItem, DatabaseError> {
        let attempt = item_repo::next_attempt(&self.db, job_id, &photo.id)?;
        let item = MigrationItem {
            id: uuid::Uuid::new_v4().to_string(),
            job_id: job_id.to_string(),
            batch_id: batch_id.to_string(),
            photo_id: photo.id.clone(),
            attempt: count("attempt", attempt)? as u32,
            original_path: photo.file_path.clone(),
            original_size: photo.file_size,
            status: ItemStatus::Processing,
            processed_size: None,
            destination_keys: Vec::new(),
            destination_url: None,
            thumbnail_url: None,
            error_message: None,
            error_code: None,
            started_at: Utc::now(),
            completed_at: None,
        };
        item_repo::insert(&self.db, &item_to_row(&item)?)?;
        Ok(item)
    }

    fn finish_item(&self, item: &MigrationItem) -> Result<(), DatabaseError> {
        item_repo::finish(&self.db, &item_to_row(item)?)
    }

    fn list_items(
        &self,
        job_id: &str,
        status: Option<ItemStatus>,
    ) -> Result<Vec<MigrationItem>, DatabaseError> {
        item_repo::list_by_job(&self.db, job_id, status.as_ref().map(ItemStatus::as_str))?
            .into_iter()
            .map(item_from_row)
            .collect()
    }

    fn terminal_photo_ids(&self, batch_id: &str) -> Result<HashSet<String>, DatabaseError> {
        item_repo::terminal_photo_ids(&self.db, batch_id)
    }
}
