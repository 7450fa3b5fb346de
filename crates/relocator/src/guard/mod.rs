//! Quota protection: circuit breaker, usage projection and the periodic
//! usage watchdog.

pub mod breaker;
pub mod cost;
pub mod projection;
pub mod usage;
pub mod watchdog;

use serde::{Deserialize, Serialize};

pub use breaker::{Admission, BreakerSnapshot, BreakerState, CircuitBreaker};
pub use cost::CostGuard;
pub use projection::{CostProjection, MetricProjection, UsageSnapshot};
pub use usage::{LocalUsageLedger, StoreUsageSource, UsageMonitor, UsageRecorder, UsageSource};
pub use watchdog::{UsageAlert, UsageWatchdog};

/// A tracked external quota.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum QuotaMetric {
    StorageBytes,
    /// Writes and listings.
    ClassAOperations,
    /// Reads.
    ClassBOperations,
    TransferBytes,
}

impl QuotaMetric {
    pub const ALL: [QuotaMetric; 4] = [
        QuotaMetric::StorageBytes,
        QuotaMetric::ClassAOperations,
        QuotaMetric::ClassBOperations,
        QuotaMetric::TransferBytes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QuotaMetric::StorageBytes => "storage_bytes",
            QuotaMetric::ClassAOperations => "class_a_operations",
            QuotaMetric::ClassBOperations => "class_b_operations",
            QuotaMetric::TransferBytes => "transfer_bytes",
        }
    }
}

impl std::fmt::Display for QuotaMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of storage operation being authorized.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Upload,
    Download,
    Delete,
    List,
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperationType::Upload => write!(f, "upload"),
            OperationType::Download => write!(f, "download"),
            OperationType::Delete => write!(f, "delete"),
            OperationType::List => write!(f, "list"),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}
