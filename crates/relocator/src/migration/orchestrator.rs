//! Drives a migration job: preflight, snapshot, sequential batches,
//! validation and completion, plus pause and resume.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use chrono::Utc;
use log::{debug, error, info, warn};
use tracing::info_span;

use crate::broadcast::{MigrationPhase, MigrationProgressBroadcaster, MigrationProgressEvent};
use crate::config::MigrationConfig;
use crate::db::job_repo::JobTimestamp;
use crate::error::{MigrationError, StorageError};
use crate::guard::{CostGuard, OperationType};
use crate::storage::ObjectStore;

use super::cancel::PauseToken;
use super::collaborators::{CdnInvalidator, ErrorTracker, LogErrorTracker};
use super::model::{
    partition, BatchStatus, ItemStatus, JobStatus, MigrationBatch, MigrationItem, MigrationJob,
    MigrationResult, PhotoRecord, RollbackSnapshot,
};
use super::processor::ItemProcessor;
use super::store::MigrationStore;

/// Collaborators injected into the orchestrator.
pub struct OrchestratorDeps {
    pub store: Arc<dyn MigrationStore>,
    pub source: Arc<dyn ObjectStore>,
    pub destination: Arc<dyn ObjectStore>,
    pub processor: Arc<dyn ItemProcessor>,
    /// Consulted before every batch when cost protection is enabled.
    pub guard: Option<Arc<CostGuard>>,
    pub cdn: Option<Arc<dyn CdnInvalidator>>,
    pub error_tracker: Arc<dyn ErrorTracker>,
    pub progress: MigrationProgressBroadcaster,
}

impl OrchestratorDeps {
    pub fn new(
        store: Arc<dyn MigrationStore>,
        source: Arc<dyn ObjectStore>,
        destination: Arc<dyn ObjectStore>,
        processor: Arc<dyn ItemProcessor>,
    ) -> Self {
        Self {
            store,
            source,
            destination,
            processor,
            guard: None,
            cdn: None,
            error_tracker: Arc::new(LogErrorTracker),
            progress: MigrationProgressBroadcaster::default(),
        }
    }

    pub fn with_guard(mut self, guard: Arc<CostGuard>) -> Self {
        self.guard = Some(guard);
        self
    }

    pub fn with_cdn(mut self, cdn: Arc<dyn CdnInvalidator>) -> Self {
        self.cdn = Some(cdn);
        self
    }

    pub fn with_error_tracker(mut self, tracker: Arc<dyn ErrorTracker>) -> Self {
        self.error_tracker = tracker;
        self
    }

    pub fn with_progress(mut self, progress: MigrationProgressBroadcaster) -> Self {
        self.progress = progress;
        self
    }
}

struct ActiveJob {
    job_id: String,
    pause: PauseToken,
}

/// Releases the single active-job slot when dropped.
pub(super) struct ActiveSlot<'a> {
    slot: &'a Mutex<Option<ActiveJob>>,
}

impl Drop for ActiveSlot<'_> {
    fn drop(&mut self) {
        if let Ok(mut active) = self.slot.lock() {
            *active = None;
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct BatchCounts {
    success: u64,
    errors: u64,
    skipped: u64,
}

enum ItemOutcome {
    Migrated,
    Failed(String),
}

enum RunOutcome {
    Finished,
    Paused,
}

pub struct MigrationOrchestrator {
    pub(super) deps: OrchestratorDeps,
    active: Mutex<Option<ActiveJob>>,
}

impl MigrationOrchestrator {
    pub fn new(deps: OrchestratorDeps) -> Self {
        Self {
            deps,
            active: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<MigrationProgressEvent> {
        self.deps.progress.subscribe()
    }

    /// Id of the job currently running on this orchestrator, if any.
    pub fn active_job(&self) -> Option<String> {
        self.lock_active().as_ref().map(|a| a.job_id.clone())
    }

    /// Number of records a new job would pick up right now.
    pub fn eligible_count(&self) -> Result<u64, MigrationError> {
        Ok(self.deps.store.count_eligible()?)
    }

    /// Ids of jobs waiting to be resumed.
    pub fn paused_jobs(&self) -> Result<Vec<String>, MigrationError> {
        Ok(self.deps.store.jobs_with_status(JobStatus::Paused)?)
    }

    /// Moves jobs left mid-flight by a previous process to a state an
    /// operator can act on: running jobs become `Paused` so they can be
    /// resumed or rolled back, interrupted rollbacks become `RollbackFailed`
    /// so they can be retried. The job held by this instance is left alone.
    ///
    /// Returns the ids of the jobs it moved.
    pub fn recover_interrupted(&self) -> Result<Vec<String>, MigrationError> {
        let active = self.lock_active();
        let held = active.as_ref().map(|job| job.job_id.as_str());
        let store = &self.deps.store;
        let mut recovered = Vec::new();

        for job_id in store.jobs_with_status(JobStatus::Running)? {
            if held == Some(job_id.as_str()) {
                continue;
            }
            warn!("Job {} was interrupted while running, marking it paused", job_id);
            self.pause_job(&job_id, "interrupted, recovered as paused")?;
            recovered.push(job_id);
        }

        for job_id in store.jobs_with_status(JobStatus::RollingBack)? {
            if held == Some(job_id.as_str()) {
                continue;
            }
            warn!("Rollback of job {} was interrupted", job_id);
            let message = "rollback: interrupted before completion";
            store.append_job_error(&job_id, message)?;
            store.update_job_status(&job_id, JobStatus::RollbackFailed, None)?;
            self.emit(MigrationProgressEvent::new(
                &job_id,
                MigrationPhase::RollbackFailed,
                message,
            ));
            recovered.push(job_id);
        }

        Ok(recovered)
    }

    /// Starts a new job over every eligible record and runs it to a
    /// terminal or paused state.
    pub fn execute_migration(
        &self,
        config: MigrationConfig,
    ) -> Result<MigrationResult, MigrationError> {
        config.validate().map_err(MigrationError::InvalidConfig)?;

        let job_id = uuid::Uuid::new_v4().to_string();
        let pause = PauseToken::new();
        let _slot = self.claim(&job_id, pause.clone())?;

        self.preflight()?;

        let ids = self.deps.store.list_eligible_ids()?;
        if ids.is_empty() {
            return Err(MigrationError::NoEligibleItems);
        }

        let job = MigrationJob::new(&job_id, config, ids.len() as u64);
        self.deps.store.create_job(&job)?;
        info!(
            "Created migration job {} for {} records (batch size {})",
            job_id,
            ids.len(),
            job.batch_size
        );
        self.emit(
            MigrationProgressEvent::new(&job_id, MigrationPhase::Initializing, "Job created")
                .with_counts(job.total_items, 0, 0, 0, 0),
        );

        let _span = info_span!("migration", job_id = %job_id).entered();
        let outcome = self
            .initialize(&job, &ids)
            .and_then(|()| self.run_batches(&job_id, &job.config, &pause, 0));
        self.settle(&job_id, outcome)
    }

    /// Requests that the running job pause before its next batch.
    pub fn pause_migration(&self) -> Result<(), MigrationError> {
        let active = self.lock_active();
        match active.as_ref() {
            Some(job) => {
                info!("Pause requested for job {}", job.job_id);
                job.pause.pause();
                Ok(())
            }
            None => Err(MigrationError::NotRunning),
        }
    }

    /// Continues a paused job with the configuration it was started with.
    pub fn resume_migration(&self, job_id: &str) -> Result<MigrationResult, MigrationError> {
        let job = self.load_job(job_id)?;
        if job.status != JobStatus::Paused {
            return Err(MigrationError::InvalidState {
                job_id: job_id.to_string(),
                status: job.status.to_string(),
                operation: "resume",
            });
        }

        let pause = PauseToken::new();
        let _slot = self.claim(job_id, pause.clone())?;
        let _span = info_span!("migration", job_id = %job_id).entered();
        info!(
            "Resuming job {} at {}/{} processed",
            job_id, job.processed_count, job.total_items
        );

        let outcome = self
            .deps
            .store
            .update_job_status(job_id, JobStatus::Running, Some(JobTimestamp::Resumed))
            .map_err(MigrationError::from)
            .and_then(|()| self.run_batches(job_id, &job.config, &pause, job.error_count));
        self.settle(job_id, outcome)
    }

    pub fn get_migration_status(&self, job_id: &str) -> Result<MigrationResult, MigrationError> {
        let job = self.load_job(job_id)?;
        let batches = self.deps.store.list_batches(job_id)?;
        Ok(MigrationResult::from_job(&job, &batches))
    }

    /// Attempts on record of a job, optionally filtered by status.
    pub fn job_items(
        &self,
        job_id: &str,
        status: Option<ItemStatus>,
    ) -> Result<Vec<MigrationItem>, MigrationError> {
        Ok(self.deps.store.list_items(job_id, status)?)
    }

    pub(super) fn claim(
        &self,
        job_id: &str,
        pause: PauseToken,
    ) -> Result<ActiveSlot<'_>, MigrationError> {
        let mut active = self.lock_active();
        if let Some(current) = active.as_ref() {
            return Err(MigrationError::AlreadyRunning {
                job_id: current.job_id.clone(),
            });
        }
        *active = Some(ActiveJob {
            job_id: job_id.to_string(),
            pause,
        });
        Ok(ActiveSlot { slot: &self.active })
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<ActiveJob>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(super) fn load_job(&self, job_id: &str) -> Result<MigrationJob, MigrationError> {
        self.deps
            .store
            .find_job(job_id)?
            .ok_or_else(|| MigrationError::JobNotFound(job_id.to_string()))
    }

    pub(super) fn emit(&self, event: MigrationProgressEvent) {
        self.deps.progress.send(event);
    }

    fn preflight(&self) -> Result<(), MigrationError> {
        self.deps
            .destination
            .test_connection()
            .map_err(|e| {
                MigrationError::PreflightFailed(format!("destination unreachable: {}", e))
            })?;
        self.deps
            .source
            .test_connection()
            .map_err(|e| MigrationError::PreflightFailed(format!("source unreachable: {}", e)))?;
        if let Some(guard) = &self.deps.guard {
            if guard.breaker().is_blocking() {
                return Err(MigrationError::PreflightFailed(
                    "circuit breaker is open".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Marks the job running, captures the rollback snapshot and persists
    /// every batch.
    fn initialize(&self, job: &MigrationJob, ids: &[String]) -> Result<(), MigrationError> {
        let store = &self.deps.store;
        store.update_job_status(&job.id, JobStatus::Running, Some(JobTimestamp::Started))?;

        let records = store.find_photos(ids)?;
        let snapshot = RollbackSnapshot::capture(records);
        store.capture_rollback_snapshot(&job.id, &snapshot)?;
        info!(
            "Captured rollback snapshot of {} records",
            snapshot.records.len()
        );
        self.emit(
            MigrationProgressEvent::new(
                &job.id,
                MigrationPhase::Snapshot,
                "Rollback snapshot captured",
            )
            .with_counts(job.total_items, 0, 0, 0, 0),
        );

        let batches = partition(&job.id, ids, job.batch_size);
        store.create_batches(&batches)?;
        info!("Partitioned job into {} batches", batches.len());
        Ok(())
    }

    /// Maps a run outcome to the final result, marking the job failed on
    /// error.
    fn settle(
        &self,
        job_id: &str,
        outcome: Result<RunOutcome, MigrationError>,
    ) -> Result<MigrationResult, MigrationError> {
        match outcome {
            Ok(RunOutcome::Finished) => self.get_migration_status(job_id),
            Ok(RunOutcome::Paused) => {
                info!("Job {} can be resumed with resume_migration", job_id);
                self.get_migration_status(job_id)
            }
            Err(e) => Err(self.fail_job(job_id, e)),
        }
    }

    fn fail_job(&self, job_id: &str, error: MigrationError) -> MigrationError {
        error!("Migration job {} failed: {}", job_id, error);
        let store = &self.deps.store;
        if let Err(e) = store.append_job_error(job_id, &error.to_string()) {
            warn!("Failed to record error on job {}: {}", job_id, e);
        }
        if let Err(e) = store.update_job_status(job_id, JobStatus::Failed, None) {
            warn!("Failed to mark job {} as failed: {}", job_id, e);
        }
        self.emit(MigrationProgressEvent::new(
            job_id,
            MigrationPhase::Failed,
            &error.to_string(),
        ));
        error
    }

    /// Processes every unfinished batch in order. `baseline_errors` is the
    /// job's error count when this run began.
    fn run_batches(
        &self,
        job_id: &str,
        config: &MigrationConfig,
        pause: &PauseToken,
        baseline_errors: u64,
    ) -> Result<RunOutcome, MigrationError> {
        let batches = self.deps.store.list_batches(job_id)?;
        let total_batches = batches.len() as u32;
        let run_started = Instant::now();
        let mut handled_this_run = 0u64;

        for mut batch in batches {
            if batch.status == BatchStatus::Completed {
                continue;
            }
            if pause.is_paused() {
                self.pause_job(job_id, "pause requested")?;
                return Ok(RunOutcome::Paused);
            }

            let counts = self.process_batch(job_id, &mut batch, total_batches, config)?;
            handled_this_run += counts.success + counts.errors + counts.skipped;

            let job = self.load_job(job_id)?;
            let remaining = job
                .total_items
                .saturating_sub(job.processed_count + job.skipped_count);
            let eta = eta_seconds(run_started, handled_this_run, remaining);
            self.emit(
                MigrationProgressEvent::new(
                    job_id,
                    MigrationPhase::BatchCompleted,
                    &format!(
                        "Batch {}/{} done: {} migrated, {} failed, {} skipped",
                        batch.batch_number,
                        total_batches,
                        counts.success,
                        counts.errors,
                        counts.skipped
                    ),
                )
                .with_batch(batch.batch_number, total_batches)
                .with_counts(
                    job.total_items,
                    job.processed_count,
                    job.success_count,
                    job.error_count,
                    job.skipped_count,
                )
                .with_eta(eta),
            );

            if let Some(threshold) = config.pause_on_error_threshold {
                let run_errors = job.error_count.saturating_sub(baseline_errors);
                if run_errors >= threshold {
                    warn!(
                        "Job {} reached {} errors this run (threshold {}), pausing",
                        job_id, run_errors, threshold
                    );
                    self.pause_job(job_id, &format!("{} errors reached threshold", run_errors))?;
                    return Ok(RunOutcome::Paused);
                }
            }
        }

        self.finish_job(job_id, config)?;
        Ok(RunOutcome::Finished)
    }

    fn pause_job(&self, job_id: &str, reason: &str) -> Result<(), MigrationError> {
        self.deps
            .store
            .update_job_status(job_id, JobStatus::Paused, Some(JobTimestamp::Paused))?;
        info!("Job {} paused: {}", job_id, reason);
        let job = self.load_job(job_id)?;
        self.emit(
            MigrationProgressEvent::new(job_id, MigrationPhase::Paused, reason).with_counts(
                job.total_items,
                job.processed_count,
                job.success_count,
                job.error_count,
                job.skipped_count,
            ),
        );
        Ok(())
    }

    fn process_batch(
        &self,
        job_id: &str,
        batch: &mut MigrationBatch,
        total_batches: u32,
        config: &MigrationConfig,
    ) -> Result<BatchCounts, MigrationError> {
        let _span = info_span!("batch", number = batch.batch_number).entered();
        let store = &self.deps.store;
        let started = Instant::now();

        let mut counts = BatchCounts::default();
        let done = store.terminal_photo_ids(&batch.id)?;
        if !done.is_empty() {
            // Attempts finished before an interruption are not yet in any counter.
            for item in store.list_items(job_id, None)? {
                if item.batch_id != batch.id {
                    continue;
                }
                match item.status {
                    ItemStatus::Completed => counts.success += 1,
                    ItemStatus::Failed => counts.errors += 1,
                    ItemStatus::Processing => {}
                }
            }
            info!(
                "Batch {} resumes with {} records already attempted",
                batch.batch_number,
                done.len()
            );
        }

        let pending: Vec<String> = batch
            .item_ids
            .iter()
            .filter(|id| !done.contains(*id))
            .cloned()
            .collect();
        let photos = store.find_photos(&pending)?;

        if config.enable_cost_protection {
            if let Some(guard) = &self.deps.guard {
                let bytes: u64 = photos
                    .iter()
                    .filter(|p| p.is_eligible())
                    .filter_map(|p| p.file_size)
                    .sum();
                if let Err(e) =
                    guard.enforce_limits(OperationType::Upload, bytes, photos.len() as u64)
                {
                    batch.status = BatchStatus::Failed;
                    batch.errors.push(e.to_string());
                    batch.completed_at = Some(Utc::now());
                    store.update_batch(batch)?;
                    return Err(e.into());
                }
            }
        }

        batch.status = BatchStatus::Processing;
        batch.started_at.get_or_insert_with(Utc::now);
        store.update_batch(batch)?;
        self.emit(
            MigrationProgressEvent::new(
                job_id,
                MigrationPhase::Processing,
                &format!("Processing batch {}", batch.batch_number),
            )
            .with_batch(batch.batch_number, total_batches),
        );

        let by_id: HashMap<&str, &PhotoRecord> =
            photos.iter().map(|p| (p.id.as_str(), p)).collect();
        for photo_id in &pending {
            let photo = match by_id.get(photo_id.as_str()) {
                Some(photo) if photo.is_eligible() => *photo,
                Some(_) => {
                    debug!("Photo {} already migrated, skipping", photo_id);
                    counts.skipped += 1;
                    continue;
                }
                None => {
                    debug!("Photo {} no longer exists, skipping", photo_id);
                    counts.skipped += 1;
                    continue;
                }
            };

            match self.process_item(job_id, &batch.id, photo, config)? {
                ItemOutcome::Migrated => counts.success += 1,
                ItemOutcome::Failed(message) => {
                    counts.errors += 1;
                    batch.errors.push(message);
                }
            }
        }

        batch.processed_count += counts.success + counts.errors;
        batch.success_count += counts.success;
        batch.error_count += counts.errors;
        batch.skipped_count += counts.skipped;
        batch.status = BatchStatus::Completed;
        batch.completed_at = Some(Utc::now());
        batch.processing_time_ms =
            Some(batch.processing_time_ms.unwrap_or(0) + started.elapsed().as_millis() as u64);
        store.update_batch(batch)?;
        store.increment_job_counts(job_id, counts.success, counts.errors, counts.skipped)?;

        info!(
            "Batch {} finished in {}ms: {} migrated, {} failed, {} skipped",
            batch.batch_number,
            started.elapsed().as_millis(),
            counts.success,
            counts.errors,
            counts.skipped
        );
        Ok(counts)
    }

    /// Runs one attempt. Processing failures are recorded on the item and
    /// returned as `Failed`; only persistence errors escape.
    fn process_item(
        &self,
        job_id: &str,
        batch_id: &str,
        photo: &PhotoRecord,
        config: &MigrationConfig,
    ) -> Result<ItemOutcome, MigrationError> {
        let store = &self.deps.store;
        let mut item = store.start_item(job_id, batch_id, photo)?;

        match self.deps.processor.process(photo, config) {
            Ok(location) => {
                store.apply_migration(&photo.id, &location)?;
                item.complete(&location);
                store.finish_item(&item)?;
                Ok(ItemOutcome::Migrated)
            }
            Err(e) => {
                warn!(
                    "Photo {} failed on attempt {}: {}",
                    photo.id, item.attempt, e
                );
                item.fail(&e.to_string(), e.code());
                store.finish_item(&item)?;
                Ok(ItemOutcome::Failed(format!("{}: {}", photo.id, e)))
            }
        }
    }

    fn finish_job(&self, job_id: &str, config: &MigrationConfig) -> Result<(), MigrationError> {
        let completed = self
            .deps
            .store
            .list_items(job_id, Some(ItemStatus::Completed))?;

        if config.validate_after {
            self.emit(MigrationProgressEvent::new(
                job_id,
                MigrationPhase::Validating,
                "Validating migrated objects",
            ));
            self.validate_sample(&completed, config.validation_sample_size)?;
        }

        self.invalidate_cdn(&completed);

        if config.cleanup_source {
            self.cleanup_sources(&completed);
        }

        self.deps
            .store
            .update_job_status(job_id, JobStatus::Completed, Some(JobTimestamp::Completed))?;
        let job = self.load_job(job_id)?;
        info!(
            "Migration job {} completed: {} migrated, {} failed, {} skipped",
            job_id, job.success_count, job.error_count, job.skipped_count
        );
        self.emit(
            MigrationProgressEvent::new(job_id, MigrationPhase::Completed, "Migration completed")
                .with_counts(
                    job.total_items,
                    job.processed_count,
                    job.success_count,
                    job.error_count,
                    job.skipped_count,
                ),
        );
        Ok(())
    }

    /// Checks that the primary object of an evenly spaced sample of
    /// completed items exists at the destination.
    fn validate_sample(
        &self,
        completed: &[MigrationItem],
        sample_size: usize,
    ) -> Result<(), MigrationError> {
        if completed.is_empty() || sample_size == 0 {
            return Ok(());
        }
        let step = (completed.len() / sample_size).max(1);
        let sample: Vec<&MigrationItem> =
            completed.iter().step_by(step).take(sample_size).collect();

        let mut missing = Vec::new();
        for item in &sample {
            let Some(key) = item.destination_keys.first() else {
                missing.push(format!("{} (no destination recorded)", item.photo_id));
                continue;
            };
            if !self.deps.destination.exists(key)? {
                missing.push(key.clone());
            }
        }

        if missing.is_empty() {
            debug!("Validated {} migrated objects", sample.len());
            Ok(())
        } else {
            Err(MigrationError::ValidationFailed(format!(
                "{} of {} sampled objects missing: {}",
                missing.len(),
                sample.len(),
                missing.join(", ")
            )))
        }
    }

    fn invalidate_cdn(&self, completed: &[MigrationItem]) {
        let Some(cdn) = &self.deps.cdn else {
            return;
        };
        let paths: Vec<String> = completed
            .iter()
            .flat_map(|item| item.destination_keys.iter().map(|key| format!("/{}", key)))
            .collect();
        if paths.is_empty() {
            return;
        }
        match cdn.invalidate(&paths) {
            Ok(receipt) => info!(
                "CDN invalidation {} for {} paths: {}",
                receipt.invalidation_id,
                paths.len(),
                receipt.status
            ),
            Err(e) => warn!("CDN invalidation failed, continuing: {}", e),
        }
    }

    /// Removes migrated originals from the source store. Failures are
    /// logged and leave the record pointing at its original.
    fn cleanup_sources(&self, completed: &[MigrationItem]) {
        let mut removed = 0;
        for item in completed {
            let Some(path) = item.original_path.as_deref() else {
                continue;
            };
            match self.deps.source.delete(path) {
                Ok(()) | Err(StorageError::NotFound { .. }) => {}
                Err(e) => {
                    warn!("Failed to remove source {}: {}", path, e);
                    continue;
                }
            }
            if let Err(e) = self.deps.store.clear_source_path(&item.photo_id) {
                warn!("Failed to clear source path of {}: {}", item.photo_id, e);
                continue;
            }
            removed += 1;
        }
        info!("Removed {} migrated source objects", removed);
    }
}

fn eta_seconds(started: Instant, handled: u64, remaining: u64) -> Option<u64> {
    if handled == 0 {
        return None;
    }
    let per_item = started.elapsed().as_secs_f64() / handled as f64;
    Some((per_item * remaining as f64).ceil() as u64)
}
