use std::collections::HashMap;

use log::{error, info, warn};
use tracing::info_span;

use crate::broadcast::{MigrationPhase, MigrationProgressEvent};
use crate::db::job_repo::JobTimestamp;
use crate::error::{MigrationError, StorageError};

use super::cancel::PauseToken;
use super::model::{
    ItemStatus, JobStatus, MigrationItem, MigrationJob, MigrationResult, RollbackSnapshot,
};
use super::orchestrator::MigrationOrchestrator;

/// What a rollback touched.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RollbackReport {
    pub records_restored: u64,
    pub records_missing: u64,
    pub objects_deleted: u64,
    /// Originals copied back from the destination.
    pub sources_restored: u64,
    pub sources_missing: u64,
}

impl MigrationOrchestrator {
    /// Reverses a finished, failed or paused job: puts back any original the
    /// source has lost, restores every snapshotted record and then deletes the
    /// objects its completed items wrote. Any failure leaves the job in
    /// `RollbackFailed` for manual attention.
    ///
    /// A job left `Running` by a crashed process must first go through
    /// `recover_interrupted`.
    pub fn execute_rollback(&self, job_id: &str) -> Result<MigrationResult, MigrationError> {
        let job = self.load_job(job_id)?;
        match job.status {
            JobStatus::Completed | JobStatus::Failed | JobStatus::Paused
                if job.rolled_back_at.is_none() => {}
            JobStatus::RollbackFailed => {}
            status => {
                return Err(MigrationError::InvalidState {
                    job_id: job_id.to_string(),
                    status: status.to_string(),
                    operation: "roll back",
                })
            }
        }
        let snapshot = job.rollback_snapshot.clone().ok_or_else(|| {
            MigrationError::RollbackFailed(format!("job {} has no rollback snapshot", job_id))
        })?;

        let _slot = self.claim(job_id, PauseToken::new())?;
        let _span = info_span!("rollback", job_id = %job_id).entered();
        let store = &self.deps.store;

        store.update_job_status(job_id, JobStatus::RollingBack, None)?;
        info!(
            "Rolling back job {} ({} snapshotted records)",
            job_id,
            snapshot.records.len()
        );
        self.emit(MigrationProgressEvent::new(
            job_id,
            MigrationPhase::RollingBack,
            "Rollback started",
        ));

        match self.apply_rollback(&job, &snapshot) {
            Ok(report) => {
                store.update_job_status(
                    job_id,
                    JobStatus::Completed,
                    Some(JobTimestamp::RolledBack),
                )?;
                info!(
                    "Rolled back job {}: {} restored, {} deleted, {} originals recovered",
                    job_id,
                    report.records_restored,
                    report.objects_deleted,
                    report.sources_restored
                );
                self.emit(MigrationProgressEvent::new(
                    job_id,
                    MigrationPhase::RolledBack,
                    &format!(
                        "Restored {} records, deleted {} objects",
                        report.records_restored, report.objects_deleted
                    ),
                ));
                self.get_migration_status(job_id)
            }
            Err(e) => {
                error!("Rollback of job {} failed: {}", job_id, e);
                let message = format!("rollback: {}", e);
                if let Err(db) = store.append_job_error(job_id, &message) {
                    warn!("Failed to record rollback error on job {}: {}", job_id, db);
                }
                store.update_job_status(job_id, JobStatus::RollbackFailed, None)?;
                self.emit(MigrationProgressEvent::new(
                    job_id,
                    MigrationPhase::RollbackFailed,
                    &message,
                ));
                Err(MigrationError::RollbackFailed(e.to_string()))
            }
        }
    }

    fn apply_rollback(
        &self,
        job: &MigrationJob,
        snapshot: &RollbackSnapshot,
    ) -> Result<RollbackReport, MigrationError> {
        let store = &self.deps.store;
        let mut report = RollbackReport::default();
        let completed = store.list_items(&job.id, Some(ItemStatus::Completed))?;

        // The destination may hold the only copy of a cleaned-up original.
        self.restore_originals(snapshot, &completed, &mut report)?;

        for record in &snapshot.records {
            if store.restore_photo(record)? {
                report.records_restored += 1;
            } else {
                warn!("Snapshotted record {} no longer exists", record.id);
                report.records_missing += 1;
            }
        }

        for item in &completed {
            for key in &item.destination_keys {
                match self.deps.destination.delete(key) {
                    Ok(()) => report.objects_deleted += 1,
                    Err(StorageError::NotFound { .. }) => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }

        Ok(report)
    }

    /// Puts back every snapshotted original that is no longer in the source,
    /// copying the primary object its completed item wrote. Fails if a
    /// migrated original cannot be recovered.
    fn restore_originals(
        &self,
        snapshot: &RollbackSnapshot,
        completed: &[MigrationItem],
        report: &mut RollbackReport,
    ) -> Result<(), MigrationError> {
        let migrated: HashMap<&str, &MigrationItem> = completed
            .iter()
            .map(|item| (item.photo_id.as_str(), item))
            .collect();

        for record in &snapshot.records {
            let Some(path) = record.file_path.as_deref() else {
                continue;
            };
            if self.deps.source.exists(path)? {
                continue;
            }
            let Some(item) = migrated.get(record.id.as_str()) else {
                warn!("Original {} of record {} is gone from the source", path, record.id);
                report.sources_missing += 1;
                continue;
            };

            let key = item.destination_keys.first().ok_or_else(|| {
                MigrationError::RollbackFailed(format!(
                    "original {} of {} is gone and no destination was recorded",
                    path, record.id
                ))
            })?;
            let bytes = self.deps.destination.get(key).map_err(|e| {
                MigrationError::RollbackFailed(format!(
                    "cannot recover original {} of {} from {}: {}",
                    path, record.id, key, e
                ))
            })?;
            let content_type = record
                .mime_type
                .as_deref()
                .unwrap_or("application/octet-stream");
            self.deps.source.put(&bytes, path, content_type)?;
            info!("Restored original {} of {} from {}", path, record.id, key);
            report.sources_restored += 1;
        }
        Ok(())
    }
}
