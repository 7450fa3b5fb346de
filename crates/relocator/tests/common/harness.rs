//! Test harness for isolated migration runs.
//!
//! Every harness owns an in-memory database, in-memory source and
//! destination stores, a two-worker pool with the passthrough transcoder
//! and a cost guard fed by a local usage ledger.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use relocator::config::{GuardConfig, MigrationConfig, PoolConfig};
use relocator::db::{photo_repo, Database};
use relocator::error::{MigrationError, StorageError};
use relocator::guard::{CircuitBreaker, CostGuard, LocalUsageLedger, UsageMonitor};
use relocator::migration::{
    register_transcoder, CdnInvalidator, ErrorTracker, InvalidationReceipt, ItemProcessor,
    MigrationOrchestrator, MigrationResult, MigrationStore, OrchestratorDeps,
    PassthroughTranscoder, PhotoRecord, PoolItemProcessor, SqliteMigrationStore,
};
use relocator::storage::{MemoryObjectStore, ObjectEntry, ObjectStore, StoredObject};
use relocator::worker::{TaskRegistry, WorkerPool};

use super::builders::{photo_id, source_bytes, source_key, PhotoBuilder};

/// Destination store whose deletes can be made to fail.
pub struct FlakyStore {
    inner: MemoryObjectStore,
    deny_deletes: AtomicBool,
}

impl FlakyStore {
    pub fn new(base_url: &str) -> Self {
        Self {
            inner: MemoryObjectStore::new(base_url),
            deny_deletes: AtomicBool::new(false),
        }
    }

    pub fn deny_deletes(&self, deny: bool) {
        self.deny_deletes.store(deny, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl ObjectStore for FlakyStore {
    fn put(
        &self,
        bytes: &[u8],
        key: &str,
        content_type: &str,
    ) -> Result<StoredObject, StorageError> {
        self.inner.put(bytes, key, content_type)
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.inner.get(key)
    }

    fn delete(&self, key: &str) -> Result<(), StorageError> {
        if self.deny_deletes.load(Ordering::SeqCst) {
            return Err(StorageError::PermissionDenied(format!("delete {}", key)));
        }
        self.inner.delete(key)
    }

    fn list(&self, prefix: &str) -> Result<Vec<ObjectEntry>, StorageError> {
        self.inner.list(prefix)
    }

    fn exists(&self, key: &str) -> Result<bool, StorageError> {
        self.inner.exists(key)
    }

    fn test_connection(&self) -> Result<(), StorageError> {
        self.inner.test_connection()
    }
}

/// CDN invalidator that records every request.
#[derive(Default)]
pub struct RecordingCdn {
    pub requests: Mutex<Vec<Vec<String>>>,
    pub fail: AtomicBool,
}

impl CdnInvalidator for RecordingCdn {
    fn invalidate(&self, paths: &[String]) -> Result<InvalidationReceipt, StorageError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(StorageError::Network("cdn unreachable".to_string()));
        }
        let mut requests = self.requests.lock().unwrap();
        requests.push(paths.to_vec());
        Ok(InvalidationReceipt {
            invalidation_id: format!("inv-{}", requests.len()),
            status: "InProgress".to_string(),
        })
    }
}

/// Error tracker that keeps every report.
#[derive(Default)]
pub struct RecordingTracker {
    pub reports: Mutex<Vec<String>>,
}

impl ErrorTracker for RecordingTracker {
    fn report(&self, context: &str, error: &MigrationError) {
        self.reports
            .lock()
            .unwrap()
            .push(format!("{}: {}", context, error));
    }
}

/// What a custom processor factory gets to work with.
pub struct ProcessorContext {
    pub store: Arc<SqliteMigrationStore>,
    pub destination: Arc<FlakyStore>,
    pub default: Arc<dyn ItemProcessor>,
}

type ProcessorFactory = Box<dyn FnOnce(ProcessorContext) -> Arc<dyn ItemProcessor>>;

pub struct TestHarness {
    pub db: Database,
    pub store: Arc<SqliteMigrationStore>,
    pub source: Arc<MemoryObjectStore>,
    pub destination: Arc<FlakyStore>,
    pub pool: Arc<WorkerPool>,
    pub breaker: Arc<CircuitBreaker>,
    pub ledger: Arc<LocalUsageLedger>,
    pub guard: Arc<CostGuard>,
    pub cdn: Arc<RecordingCdn>,
    pub tracker: Arc<RecordingTracker>,
    pub orchestrator: Arc<MigrationOrchestrator>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::build(GuardConfig::default(), None)
    }

    pub fn with_guard_config(guard_config: GuardConfig) -> Self {
        Self::build(guard_config, None)
    }

    /// Builds a harness whose orchestrator uses the processor returned by
    /// `factory`.
    pub fn with_processor<F>(factory: F) -> Self
    where
        F: FnOnce(ProcessorContext) -> Arc<dyn ItemProcessor> + 'static,
    {
        Self::build(GuardConfig::default(), Some(Box::new(factory)))
    }

    fn build(guard_config: GuardConfig, factory: Option<ProcessorFactory>) -> Self {
        let db = Database::open_in_memory().expect("Failed to open database");
        let store = Arc::new(SqliteMigrationStore::new(db.clone()));
        let source = Arc::new(MemoryObjectStore::new("memory://source"));
        let destination = Arc::new(FlakyStore::new("https://cdn.test"));

        let mut registry = TaskRegistry::new();
        register_transcoder(&mut registry, Arc::new(PassthroughTranscoder));
        let pool_config = PoolConfig {
            min_workers: 1,
            max_workers: 2,
            task_timeout_ms: 5_000,
            ..PoolConfig::default()
        };
        let pool = Arc::new(WorkerPool::new(pool_config, registry).expect("Failed to start pool"));

        let breaker = Arc::new(CircuitBreaker::new(guard_config.breaker));
        let ledger = Arc::new(LocalUsageLedger::new());
        let monitor = Arc::new(UsageMonitor::new(ledger.clone(), Duration::ZERO));
        let guard = Arc::new(CostGuard::new(guard_config, breaker.clone(), monitor));
        let tracker = Arc::new(RecordingTracker::default());
        let cdn = Arc::new(RecordingCdn::default());

        let default: Arc<dyn ItemProcessor> = Arc::new(
            PoolItemProcessor::new(pool.clone(), source.clone(), destination.clone())
                .with_breaker(breaker.clone())
                .with_error_tracker(tracker.clone())
                .with_usage_recorder(ledger.clone()),
        );
        let processor = match factory {
            Some(factory) => factory(ProcessorContext {
                store: store.clone(),
                destination: destination.clone(),
                default,
            }),
            None => default,
        };

        let deps = OrchestratorDeps::new(
            store.clone(),
            source.clone(),
            destination.clone(),
            processor,
        )
        .with_guard(guard.clone())
        .with_cdn(cdn.clone())
        .with_error_tracker(tracker.clone());

        Self {
            db,
            store,
            source,
            destination,
            pool,
            breaker,
            ledger,
            guard,
            cdn,
            tracker,
            orchestrator: Arc::new(MigrationOrchestrator::new(deps)),
        }
    }

    /// Inserts a record and, if it has a file path, its original.
    pub fn seed_photo(&self, builder: PhotoBuilder) -> String {
        let row = builder.build();
        if let Some(path) = &row.file_path {
            self.source
                .put(&source_bytes(&row.id), path, "image/jpeg")
                .expect("Failed to store original");
        }
        photo_repo::insert(&self.db, &row).expect("Failed to insert photo");
        row.id
    }

    /// Seeds `count` eligible records named `photo-000`, `photo-001`, ...
    pub fn seed(&self, count: usize) -> Vec<String> {
        (0..count)
            .map(|i| self.seed_photo(PhotoBuilder::new(&photo_id(i), i)))
            .collect()
    }

    /// Removes a record's original so processing it fails.
    pub fn break_source(&self, id: &str) {
        self.source
            .delete(&source_key(id))
            .expect("Failed to delete original");
    }

    pub fn photo(&self, id: &str) -> PhotoRecord {
        self.store
            .find_photo(id)
            .expect("Failed to load photo")
            .expect("Photo missing")
    }

    pub fn migrate(&self, config: MigrationConfig) -> Result<MigrationResult, MigrationError> {
        self.orchestrator.execute_migration(config)
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
