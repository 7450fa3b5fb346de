//! End-to-end migration runs against in-memory stores and a real pool.

mod common;

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};

use common::{photo_id, MigrationConfigBuilder, PhotoBuilder, TestHarness};
use relocator::broadcast::MigrationPhase;
use relocator::config::MigrationConfig;
use relocator::error::MigrationError;
use relocator::migration::{
    BatchStatus, ItemProcessor, ItemStatus, JobStatus, MigratedLocation, MigrationStore,
    PhotoRecord, SqliteMigrationStore,
};

fn ghost_location(photo_id: &str) -> MigratedLocation {
    let key = format!("photos/{}/webp.webp", photo_id);
    MigratedLocation {
        storage_url: format!("https://cdn.test/{}", key),
        storage_key: key.clone(),
        thumbnail_url: None,
        destination_keys: vec![key],
        processed_size: 1,
    }
}

/// Blocks every item until the test lets it through.
struct GatedProcessor {
    started: Sender<String>,
    gate: Receiver<()>,
}

impl ItemProcessor for GatedProcessor {
    fn process(
        &self,
        photo: &PhotoRecord,
        _config: &MigrationConfig,
    ) -> Result<MigratedLocation, MigrationError> {
        let _ = self.started.send(photo.id.clone());
        self.gate
            .recv()
            .map_err(|_| MigrationError::Transform("gate closed".to_string()))?;
        Ok(ghost_location(&photo.id))
    }
}

/// Migrates another record behind the orchestrator's back on first use.
struct MigrateAheadProcessor {
    store: Arc<SqliteMigrationStore>,
    inner: Arc<dyn ItemProcessor>,
    target: String,
    fired: AtomicBool,
}

impl ItemProcessor for MigrateAheadProcessor {
    fn process(
        &self,
        photo: &PhotoRecord,
        config: &MigrationConfig,
    ) -> Result<MigratedLocation, MigrationError> {
        if !self.fired.swap(true, Ordering::SeqCst) {
            self.store
                .apply_migration(&self.target, &ghost_location(&self.target))
                .expect("Failed to migrate ahead");
        }
        self.inner.process(photo, config)
    }
}

/// Panics on the first attempt at `target`, as if the process died there.
struct CrashOnceProcessor {
    inner: Arc<dyn ItemProcessor>,
    target: String,
    armed: AtomicBool,
}

impl ItemProcessor for CrashOnceProcessor {
    fn process(
        &self,
        photo: &PhotoRecord,
        config: &MigrationConfig,
    ) -> Result<MigratedLocation, MigrationError> {
        if photo.id == self.target && self.armed.swap(false, Ordering::SeqCst) {
            panic!("process died while migrating {}", photo.id);
        }
        self.inner.process(photo, config)
    }
}

/// Reports success without writing anything.
struct GhostProcessor;

impl ItemProcessor for GhostProcessor {
    fn process(
        &self,
        photo: &PhotoRecord,
        _config: &MigrationConfig,
    ) -> Result<MigratedLocation, MigrationError> {
        Ok(ghost_location(&photo.id))
    }
}

#[test]
fn test_full_run_partitions_and_completes() {
    let h = TestHarness::new();
    h.seed(120);
    let mut events = h.orchestrator.subscribe();

    let result = h
        .migrate(MigrationConfigBuilder::new().batch_size(50).build())
        .unwrap();

    assert_eq!(result.status, JobStatus::Completed);
    assert_eq!(result.total_items, 120);
    assert_eq!(result.processed_count, 120);
    assert_eq!(result.success_count, 120);
    assert_eq!(result.error_count, 0);
    assert_eq!(result.total_batches, 3);
    assert_eq!(result.completed_batches, 3);
    assert!(result.completed_at.is_some());

    let sizes: Vec<usize> = h
        .store
        .list_batches(&result.job_id)
        .unwrap()
        .iter()
        .map(|b| b.item_ids.len())
        .collect();
    assert_eq!(sizes, vec![50, 50, 20]);

    let photo = h.photo(&photo_id(7));
    assert_eq!(photo.storage_key.as_deref(), Some("photos/photo-007/webp.webp"));
    assert_eq!(
        photo.thumbnail_url.as_deref(),
        Some("https://cdn.test/photos/photo-007/thumbnail.jpg")
    );
    assert_eq!(h.destination.len(), 360);
    assert_eq!(h.orchestrator.eligible_count().unwrap(), 0);

    let requests = h.cdn.requests.lock().unwrap();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].len(), 360);
    assert!(requests[0].contains(&"/photos/photo-000/jpeg.jpg".to_string()));
    drop(requests);

    let mut last_fraction = 0.0;
    let mut last_processed = 0;
    let mut phases = Vec::new();
    while let Ok(event) = events.try_recv() {
        phases.push(event.phase);
        if matches!(
            event.phase,
            MigrationPhase::BatchCompleted | MigrationPhase::Completed
        ) {
            assert!(event.fraction >= last_fraction);
            assert!(event.processed >= last_processed);
            assert!(event.processed == event.success + event.errors);
            last_fraction = event.fraction;
            last_processed = event.processed;
        }
    }
    assert_eq!(phases.first(), Some(&MigrationPhase::Initializing));
    assert_eq!(phases.last(), Some(&MigrationPhase::Completed));
    assert!(phases.contains(&MigrationPhase::Validating));
    assert_eq!(
        phases
            .iter()
            .filter(|p| **p == MigrationPhase::BatchCompleted)
            .count(),
        3
    );
    assert_eq!(last_fraction, 1.0);
}

#[test]
fn test_error_threshold_pauses_then_resume_completes() {
    let h = TestHarness::new();
    h.seed(120);
    for i in 50..55 {
        h.break_source(&photo_id(i));
    }

    let config = MigrationConfigBuilder::new()
        .batch_size(50)
        .pause_on_errors(5)
        .build();
    let paused = h.migrate(config).unwrap();

    assert_eq!(paused.status, JobStatus::Paused);
    assert_eq!(paused.processed_count, 100);
    assert_eq!(paused.error_count, 5);
    assert_eq!(paused.completed_batches, 2);

    let batches = h.store.list_batches(&paused.job_id).unwrap();
    assert_eq!(batches[1].error_count, 5);
    assert_eq!(batches[1].errors.len(), 5);
    assert_eq!(batches[2].status, BatchStatus::Pending);

    let failed = h
        .orchestrator
        .job_items(&paused.job_id, Some(ItemStatus::Failed))
        .unwrap();
    assert_eq!(failed.len(), 5);
    assert!(failed
        .iter()
        .all(|item| item.error_code.as_deref() == Some("SOURCE_NOT_FOUND")));

    let resumed = h.orchestrator.resume_migration(&paused.job_id).unwrap();
    assert_eq!(resumed.status, JobStatus::Completed);
    assert_eq!(resumed.processed_count, 120);
    assert_eq!(resumed.success_count, 115);
    assert_eq!(resumed.error_count, 5);
    assert_eq!(resumed.completed_batches, 3);

    let status = h.orchestrator.get_migration_status(&paused.job_id).unwrap();
    assert_eq!(status, resumed);
}

#[test]
fn test_counters_stay_consistent_with_failures_and_skips() {
    let h = TestHarness::with_processor(|ctx| {
        Arc::new(MigrateAheadProcessor {
            store: ctx.store,
            inner: ctx.default,
            target: photo_id(4),
            fired: AtomicBool::new(false),
        })
    });
    h.seed(5);
    h.break_source(&photo_id(1));

    let result = h
        .migrate(MigrationConfigBuilder::new().batch_size(2).build())
        .unwrap();

    assert_eq!(result.status, JobStatus::Completed);
    assert_eq!(result.total_items, 5);
    assert_eq!(result.success_count, 3);
    assert_eq!(result.error_count, 1);
    assert_eq!(result.skipped_count, 1);
    assert_eq!(
        result.processed_count,
        result.success_count + result.error_count
    );
    assert!(result.processed_count + result.skipped_count <= result.total_items);

    let batches = h.store.list_batches(&result.job_id).unwrap();
    assert_eq!(batches[2].skipped_count, 1);
    assert_eq!(batches[2].processed_count, 0);
}

#[test]
fn test_ineligible_records_are_not_picked_up() {
    let h = TestHarness::new();
    h.seed(3);
    h.seed_photo(PhotoBuilder::new("already-moved", 10).migrated("photos/x/webp.webp"));
    h.seed_photo(PhotoBuilder::new("no-file", 11).without_file());

    let result = h.migrate(MigrationConfigBuilder::new().build()).unwrap();
    assert_eq!(result.total_items, 3);
    assert_eq!(result.processed_count, 3);
    assert_eq!(
        h.photo("already-moved").storage_key.as_deref(),
        Some("photos/x/webp.webp")
    );
}

#[test]
fn test_nothing_to_migrate_fails_fast() {
    let h = TestHarness::new();
    assert!(matches!(
        h.migrate(MigrationConfigBuilder::new().build()),
        Err(MigrationError::NoEligibleItems)
    ));

    h.seed(1);
    h.migrate(MigrationConfigBuilder::new().build()).unwrap();
    assert!(matches!(
        h.migrate(MigrationConfigBuilder::new().build()),
        Err(MigrationError::NoEligibleItems)
    ));
    assert!(h.orchestrator.active_job().is_none());
}

#[test]
fn test_invalid_config_is_rejected() {
    let h = TestHarness::new();
    h.seed(1);
    let result = h.migrate(MigrationConfigBuilder::new().batch_size(0).build());
    assert!(matches!(result, Err(MigrationError::InvalidConfig(_))));
    assert_eq!(h.orchestrator.eligible_count().unwrap(), 1);
}

#[test]
fn test_single_active_job_and_explicit_pause() {
    let (started_tx, started_rx) = crossbeam_channel::unbounded();
    let (gate_tx, gate_rx) = crossbeam_channel::unbounded();
    let h = TestHarness::with_processor(move |_| {
        Arc::new(GatedProcessor {
            started: started_tx,
            gate: gate_rx,
        })
    });
    h.seed(4);
    let config = MigrationConfigBuilder::new()
        .batch_size(2)
        .validate_after(false)
        .build();

    assert!(matches!(
        h.orchestrator.pause_migration(),
        Err(MigrationError::NotRunning)
    ));

    let orchestrator = h.orchestrator.clone();
    let runner_config = config.clone();
    let runner = thread::spawn(move || orchestrator.execute_migration(runner_config));

    let first = started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(first, photo_id(0));
    let running = h.orchestrator.active_job().unwrap();

    match h.migrate(config.clone()) {
        Err(MigrationError::AlreadyRunning { job_id }) => assert_eq!(job_id, running),
        other => panic!("expected AlreadyRunning, got {:?}", other),
    }

    h.orchestrator.pause_migration().unwrap();
    gate_tx.send(()).unwrap();
    gate_tx.send(()).unwrap();

    let paused = runner.join().unwrap().unwrap();
    assert_eq!(paused.job_id, running);
    assert_eq!(paused.status, JobStatus::Paused);
    assert_eq!(paused.processed_count, 2);
    assert_eq!(paused.completed_batches, 1);
    assert!(h.orchestrator.active_job().is_none());
    assert_eq!(h.orchestrator.paused_jobs().unwrap(), vec![running.clone()]);

    gate_tx.send(()).unwrap();
    gate_tx.send(()).unwrap();
    let resumed = h.orchestrator.resume_migration(&running).unwrap();
    assert_eq!(resumed.status, JobStatus::Completed);
    assert_eq!(resumed.processed_count, 4);

    match h.orchestrator.resume_migration(&running) {
        Err(MigrationError::InvalidState { operation, .. }) => assert_eq!(operation, "resume"),
        other => panic!("expected InvalidState, got {:?}", other),
    }
    assert!(matches!(
        h.orchestrator.resume_migration("missing"),
        Err(MigrationError::JobNotFound(_))
    ));
}

#[test]
fn test_failed_validation_marks_job_failed() {
    let h = TestHarness::with_processor(|_| Arc::new(GhostProcessor));
    h.seed(3);

    let err = h.migrate(MigrationConfigBuilder::new().build()).unwrap_err();
    assert!(matches!(err, MigrationError::ValidationFailed(_)));

    let failed = h.store.jobs_with_status(JobStatus::Failed).unwrap();
    assert_eq!(failed.len(), 1);
    let status = h.orchestrator.get_migration_status(&failed[0]).unwrap();
    assert_eq!(status.status, JobStatus::Failed);
    assert_eq!(status.processed_count, 3);
    assert!(status.error_details[0].contains("validation failed"));
    assert!(h.orchestrator.active_job().is_none());
}

#[test]
fn test_cdn_failure_does_not_fail_job() {
    let h = TestHarness::new();
    h.seed(2);
    h.cdn.fail.store(true, Ordering::SeqCst);

    let result = h.migrate(MigrationConfigBuilder::new().build()).unwrap();
    assert_eq!(result.status, JobStatus::Completed);
    assert!(h.cdn.requests.lock().unwrap().is_empty());
}

#[test]
fn test_cleanup_removes_migrated_sources() {
    let h = TestHarness::new();
    h.seed(3);
    h.break_source(&photo_id(2));

    let result = h
        .migrate(MigrationConfigBuilder::new().cleanup_source(true).build())
        .unwrap();
    assert_eq!(result.success_count, 2);

    assert!(h.source.is_empty());
    assert!(h.photo(&photo_id(0)).file_path.is_none());
    assert!(h.photo(&photo_id(2)).file_path.is_some());
}

#[test]
fn test_interrupted_job_is_recovered_and_resumed_mid_batch() {
    let h = TestHarness::with_processor(|ctx| {
        Arc::new(CrashOnceProcessor {
            inner: ctx.default,
            target: photo_id(4),
            armed: AtomicBool::new(true),
        })
    });
    h.seed(6);
    h.break_source(&photo_id(3));

    let crashed = panic::catch_unwind(AssertUnwindSafe(|| {
        h.migrate(MigrationConfigBuilder::new().batch_size(3).build())
    }));
    assert!(crashed.is_err());
    assert_eq!(h.orchestrator.active_job(), None);

    let job_id = h.store.jobs_with_status(JobStatus::Running).unwrap()[0].clone();
    match h.orchestrator.resume_migration(&job_id) {
        Err(MigrationError::InvalidState { status, .. }) => assert_eq!(status, "running"),
        other => panic!("expected InvalidState, got {:?}", other),
    }
    let batches = h.store.list_batches(&job_id).unwrap();
    assert_eq!(batches[0].status, BatchStatus::Completed);
    assert_eq!(batches[1].status, BatchStatus::Processing);

    assert_eq!(h.orchestrator.recover_interrupted().unwrap(), vec![job_id.clone()]);
    assert_eq!(h.orchestrator.paused_jobs().unwrap(), vec![job_id.clone()]);
    assert!(h.orchestrator.recover_interrupted().unwrap().is_empty());

    let result = h.orchestrator.resume_migration(&job_id).unwrap();
    assert_eq!(result.status, JobStatus::Completed);
    assert_eq!(result.processed_count, 6);
    assert_eq!(result.success_count, 5);
    assert_eq!(result.error_count, 1);
    assert_eq!(result.completed_batches, 2);
    assert_eq!(h.destination.len(), 15);

    let batches = h.store.list_batches(&job_id).unwrap();
    assert_eq!(batches[1].processed_count, 3);
    assert_eq!(batches[1].error_count, 1);

    // The failed record keeps its single attempt; the interrupted one gets a second.
    let items = h.store.list_items(&job_id, None).unwrap();
    let attempts = |id: &str| items.iter().filter(|i| i.photo_id == id).count();
    assert_eq!(attempts(&photo_id(3)), 1);
    assert_eq!(attempts(&photo_id(4)), 2);
    assert_eq!(attempts(&photo_id(5)), 1);
}
