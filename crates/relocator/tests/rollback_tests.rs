//! Rollback of finished jobs.

mod common;

use common::{photo_id, source_bytes, source_key, MigrationConfigBuilder, TestHarness};
use relocator::error::MigrationError;
use relocator::migration::{ItemStatus, JobStatus, MigrationStore};
use relocator::storage::ObjectStore;

#[test]
fn test_rollback_restores_records_and_removes_objects() {
    let h = TestHarness::new();
    let ids = h.seed(6);
    h.break_source(&photo_id(1));
    h.break_source(&photo_id(4));
    let originals: Vec<_> = ids.iter().map(|id| h.photo(id)).collect();

    let result = h.migrate(MigrationConfigBuilder::new().batch_size(4).build()).unwrap();
    assert_eq!(result.success_count, 4);
    assert_eq!(result.error_count, 2);
    assert_eq!(h.destination.len(), 12);
    assert!(h.photo(&photo_id(0)).storage_key.is_some());

    let rolled_back = h.orchestrator.execute_rollback(&result.job_id).unwrap();
    assert_eq!(rolled_back.status, JobStatus::Completed);
    assert!(rolled_back.rolled_back_at.is_some());

    for original in &originals {
        assert_eq!(&h.photo(&original.id), original);
    }
    assert!(h.destination.is_empty());
    assert_eq!(h.orchestrator.eligible_count().unwrap(), 6);

    let items = h.store.list_items(&result.job_id, None).unwrap();
    assert_eq!(items.len(), 6);
    assert_eq!(
        items
            .iter()
            .filter(|i| i.status == ItemStatus::Completed)
            .count(),
        4
    );

    match h.orchestrator.execute_rollback(&result.job_id) {
        Err(MigrationError::InvalidState { operation, .. }) => assert_eq!(operation, "roll back"),
        other => panic!("expected InvalidState, got {:?}", other),
    }
}

#[test]
fn test_failed_rollback_can_be_retried() {
    let h = TestHarness::new();
    h.seed(2);
    let result = h.migrate(MigrationConfigBuilder::new().build()).unwrap();

    h.destination.deny_deletes(true);
    let err = h.orchestrator.execute_rollback(&result.job_id).unwrap_err();
    assert!(matches!(err, MigrationError::RollbackFailed(_)));

    let status = h.orchestrator.get_migration_status(&result.job_id).unwrap();
    assert_eq!(status.status, JobStatus::RollbackFailed);
    assert!(status
        .error_details
        .last()
        .unwrap()
        .starts_with("rollback:"));

    h.destination.deny_deletes(false);
    let retried = h.orchestrator.execute_rollback(&result.job_id).unwrap();
    assert_eq!(retried.status, JobStatus::Completed);
    assert!(h.destination.is_empty());
    assert!(h.photo(&photo_id(0)).storage_key.is_none());
}

#[test]
fn test_rollback_of_paused_job() {
    let h = TestHarness::new();
    h.seed(4);
    h.break_source(&photo_id(0));

    let paused = h
        .migrate(
            MigrationConfigBuilder::new()
                .batch_size(2)
                .pause_on_errors(1)
                .build(),
        )
        .unwrap();
    assert_eq!(paused.status, JobStatus::Paused);
    assert_eq!(h.destination.len(), 3);

    h.orchestrator.execute_rollback(&paused.job_id).unwrap();
    assert!(h.destination.is_empty());
    assert_eq!(h.orchestrator.eligible_count().unwrap(), 4);

    assert!(matches!(
        h.orchestrator.execute_rollback("missing"),
        Err(MigrationError::JobNotFound(_))
    ));
}

#[test]
fn test_rollback_after_cleanup_recovers_originals() {
    let h = TestHarness::new();
    let ids = h.seed(3);
    h.break_source(&photo_id(2));
    let originals: Vec<_> = ids.iter().map(|id| h.photo(id)).collect();

    let result = h
        .migrate(MigrationConfigBuilder::new().cleanup_source(true).build())
        .unwrap();
    assert_eq!(result.success_count, 2);
    assert!(h.source.is_empty());

    let rolled_back = h.orchestrator.execute_rollback(&result.job_id).unwrap();
    assert_eq!(rolled_back.status, JobStatus::Completed);

    for id in [photo_id(0), photo_id(1)] {
        assert_eq!(h.source.get(&source_key(&id)).unwrap(), source_bytes(&id));
    }
    // Never migrated, so there was nothing to copy back.
    assert!(!h.source.exists(&source_key(&photo_id(2))).unwrap());

    for original in &originals {
        assert_eq!(&h.photo(&original.id), original);
    }
    assert!(h.destination.is_empty());
}

#[test]
fn test_rollback_keeps_destination_when_original_is_unrecoverable() {
    let h = TestHarness::new();
    h.seed(2);
    let result = h
        .migrate(MigrationConfigBuilder::new().cleanup_source(true).build())
        .unwrap();
    assert_eq!(h.destination.len(), 6);

    let primary = h.photo(&photo_id(0)).storage_key.unwrap();
    h.destination.delete(&primary).unwrap();

    let err = h.orchestrator.execute_rollback(&result.job_id).unwrap_err();
    assert!(matches!(err, MigrationError::RollbackFailed(_)));

    let status = h.orchestrator.get_migration_status(&result.job_id).unwrap();
    assert_eq!(status.status, JobStatus::RollbackFailed);
    assert_eq!(h.destination.len(), 5);
    assert!(h.photo(&photo_id(1)).storage_key.is_some());
}
