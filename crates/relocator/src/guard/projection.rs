use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{OperationType, QuotaMetric};
use crate::config::{GuardConfig, Pricing, QuotaLimits};

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;
const PER_MILLION: f64 = 1_000_000.0;

/// Measured consumption per tracked metric.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct UsageSnapshot {
    pub storage_bytes: u64,
    pub class_a_operations: u64,
    pub class_b_operations: u64,
    pub transfer_bytes: u64,
    /// True when the figures are a fallback rather than a measurement.
    pub estimated: bool,
    pub sampled_at: DateTime<Utc>,
}

impl UsageSnapshot {
    pub fn new(
        storage_bytes: u64,
        class_a_operations: u64,
        class_b_operations: u64,
        transfer_bytes: u64,
    ) -> Self {
        Self {
            storage_bytes,
            class_a_operations,
            class_b_operations,
            transfer_bytes,
            estimated: false,
            sampled_at: Utc::now(),
        }
    }

    /// Fallback used when the usage source cannot be read.
    pub fn zeroed_estimate() -> Self {
        Self {
            estimated: true,
            ..Self::new(0, 0, 0, 0)
        }
    }

    pub fn get(&self, metric: QuotaMetric) -> u64 {
        match metric {
            QuotaMetric::StorageBytes => self.storage_bytes,
            QuotaMetric::ClassAOperations => self.class_a_operations,
            QuotaMetric::ClassBOperations => self.class_b_operations,
            QuotaMetric::TransferBytes => self.transfer_bytes,
        }
    }

    /// Usage after a hypothetical operation.
    ///
    /// Uploads write `multiplier` derived objects per item, so both bytes and
    /// write requests scale with it.
    pub fn apply(
        &self,
        operation: OperationType,
        size: u64,
        requests: u64,
        multiplier: u64,
    ) -> Self {
        let mut next = *self;
        match operation {
            OperationType::Upload => {
                next.storage_bytes = next
                    .storage_bytes
                    .saturating_add(size.saturating_mul(multiplier));
                next.class_a_operations = next
                    .class_a_operations
                    .saturating_add(requests.saturating_mul(multiplier));
            }
            OperationType::Download => {
                next.class_b_operations = next.class_b_operations.saturating_add(requests);
                next.transfer_bytes = next.transfer_bytes.saturating_add(size);
            }
            OperationType::Delete => {
                next.storage_bytes = next.storage_bytes.saturating_sub(size);
            }
            OperationType::List => {
                next.class_a_operations = next.class_a_operations.saturating_add(requests);
            }
        }
        next
    }

    /// Percentage of each quota consumed, in `QuotaMetric::ALL` order.
    pub fn percentages(&self, limits: &QuotaLimits) -> Vec<(QuotaMetric, f64)> {
        QuotaMetric::ALL
            .iter()
            .map(|&metric| (metric, percent(self.get(metric), limit_for(limits, metric))))
            .collect()
    }

    /// Estimated monthly bill for this level of usage.
    pub fn monthly_cost(&self, pricing: &Pricing) -> f64 {
        self.storage_bytes as f64 / BYTES_PER_GB * pricing.storage_per_gb_month
            + self.class_a_operations as f64 / PER_MILLION * pricing.class_a_per_million
            + self.class_b_operations as f64 / PER_MILLION * pricing.class_b_per_million
            + self.transfer_bytes as f64 / BYTES_PER_GB * pricing.transfer_per_gb
    }
}

pub fn limit_for(limits: &QuotaLimits, metric: QuotaMetric) -> u64 {
    match metric {
        QuotaMetric::StorageBytes => limits.storage_bytes,
        QuotaMetric::ClassAOperations => limits.class_a_operations,
        QuotaMetric::ClassBOperations => limits.class_b_operations,
        QuotaMetric::TransferBytes => limits.transfer_bytes,
    }
}

fn percent(value: u64, limit: u64) -> f64 {
    value as f64 / limit.max(1) as f64 * 100.0
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricProjection {
    pub metric: QuotaMetric,
    pub current: u64,
    pub projected: u64,
    pub limit: u64,
    pub current_percent: f64,
    pub projected_percent: f64,
}

/// Current usage plus the effect of one proposed operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CostProjection {
    pub operation: OperationType,
    pub metrics: Vec<MetricProjection>,
    pub current_monthly_cost: f64,
    pub projected_monthly_cost: f64,
    /// Inherited from the usage snapshot.
    pub estimated: bool,
}

impl CostProjection {
    pub fn compute(
        current: &UsageSnapshot,
        operation: OperationType,
        size: u64,
        requests: u64,
        config: &GuardConfig,
    ) -> Self {
        let projected = current.apply(operation, size, requests, config.upload_format_multiplier);
        let metrics = QuotaMetric::ALL
            .iter()
            .map(|&metric| {
                let limit = limit_for(&config.quotas, metric);
                MetricProjection {
                    metric,
                    current: current.get(metric),
                    projected: projected.get(metric),
                    limit,
                    current_percent: percent(current.get(metric), limit),
                    projected_percent: percent(projected.get(metric), limit),
                }
            })
            .collect();

        Self {
            operation,
            metrics,
            current_monthly_cost: current.monthly_cost(&config.pricing),
            projected_monthly_cost: projected.monthly_cost(&config.pricing),
            estimated: current.estimated,
        }
    }

    /// First metric, in `QuotaMetric::ALL` order, projected at or above `threshold`.
    pub fn first_breach(&self, threshold: f64) -> Option<&MetricProjection> {
        self.metrics
            .iter()
            .find(|m| m.projected_percent >= threshold)
    }

    /// Metrics projected at or above `threshold`.
    pub fn warnings(&self, threshold: f64) -> impl Iterator<Item = &MetricProjection> {
        self.metrics
            .iter()
            .filter(move |m| m.projected_percent >= threshold)
    }

    pub fn metric(&self, metric: QuotaMetric) -> Option<&MetricProjection> {
        self.metrics.iter().find(|m| m.metric == metric)
    }
}
