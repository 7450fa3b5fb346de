use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;
use log::{debug, warn};
use moka::sync::Cache;

use super::projection::UsageSnapshot;
use super::OperationType;
use crate::error::StorageError;
use crate::storage::ObjectStore;

const USAGE_KEY: &str = "usage";

/// A source of current consumption figures.
pub trait UsageSource: Send + Sync {
    fn current_usage(&self) -> Result<UsageSnapshot, StorageError>;
}

/// Receives every storage operation actually performed.
pub trait UsageRecorder: Send + Sync {
    /// `size` and `requests` are what the operation really moved; no
    /// format multiplier is applied.
    fn record(&self, operation: OperationType, size: u64, requests: u64);
}

/// Usage tracked locally by recording every operation as it happens.
#[derive(Debug)]
pub struct LocalUsageLedger {
    usage: RwLock<UsageSnapshot>,
}

impl LocalUsageLedger {
    pub fn new() -> Self {
        Self::with_usage(UsageSnapshot::new(0, 0, 0, 0))
    }

    pub fn with_usage(usage: UsageSnapshot) -> Self {
        Self {
            usage: RwLock::new(usage),
        }
    }

    pub fn set(&self, usage: UsageSnapshot) {
        match self.usage.write() {
            Ok(mut guard) => *guard = usage,
            Err(poisoned) => *poisoned.into_inner() = usage,
        }
    }
}

impl Default for LocalUsageLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageRecorder for LocalUsageLedger {
    fn record(&self, operation: OperationType, size: u64, requests: u64) {
        let mut usage = match self.usage.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *usage = usage.apply(operation, size, requests, 1);
        usage.sampled_at = Utc::now();
    }
}

impl UsageSource for LocalUsageLedger {
    fn current_usage(&self) -> Result<UsageSnapshot, StorageError> {
        self.usage
            .read()
            .map(|usage| *usage)
            .map_err(|_| StorageError::Other("usage ledger lock poisoned".to_string()))
    }
}

/// Measures stored bytes by listing an object store. Request and transfer
/// counters are not observable this way and report zero.
pub struct StoreUsageSource {
    store: Arc<dyn ObjectStore>,
    prefix: String,
}

impl StoreUsageSource {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: &str) -> Self {
        Self {
            store,
            prefix: prefix.to_string(),
        }
    }
}

impl UsageSource for StoreUsageSource {
    fn current_usage(&self) -> Result<UsageSnapshot, StorageError> {
        let storage_bytes = self
            .store
            .list(&self.prefix)?
            .iter()
            .map(|entry| entry.size)
            .sum();
        Ok(UsageSnapshot::new(storage_bytes, 0, 0, 0))
    }
}

/// Reads the usage source, caching the result for a short TTL.
pub struct UsageMonitor {
    source: Arc<dyn UsageSource>,
    cache: Option<Cache<&'static str, UsageSnapshot>>,
}

impl UsageMonitor {
    /// A zero `cache_ttl` disables caching.
    pub fn new(source: Arc<dyn UsageSource>, cache_ttl: Duration) -> Self {
        let cache = (!cache_ttl.is_zero()).then(|| {
            Cache::builder()
                .max_capacity(1)
                .time_to_live(cache_ttl)
                .build()
        });
        Self { source, cache }
    }

    /// Cached usage if fresh, otherwise a new sample.
    pub fn current(&self) -> UsageSnapshot {
        if let Some(usage) = self.cache.as_ref().and_then(|c| c.get(USAGE_KEY)) {
            return usage;
        }
        self.sample()
    }

    /// Reads the source directly, refreshing the cache.
    ///
    /// Falls back to a zeroed estimate when the source is unavailable; the
    /// estimate is never cached.
    pub fn sample(&self) -> UsageSnapshot {
        match self.source.current_usage() {
            Ok(usage) => {
                debug!(
                    "Usage sample: storage={}B classA={} classB={} transfer={}B",
                    usage.storage_bytes,
                    usage.class_a_operations,
                    usage.class_b_operations,
                    usage.transfer_bytes
                );
                if let Some(cache) = &self.cache {
                    cache.insert(USAGE_KEY, usage);
                }
                usage
            }
            Err(e) => {
                warn!("Usage source unavailable, assuming zero usage: {}", e);
                UsageSnapshot::zeroed_estimate()
            }
        }
    }

    pub fn invalidate(&self) {
        if let Some(cache) = &self.cache {
            cache.invalidate(USAGE_KEY);
        }
    }
}
