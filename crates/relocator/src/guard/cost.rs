use std::sync::Arc;

use log::{debug, warn};
use tokio::sync::broadcast;

use super::breaker::{Admission, CircuitBreaker};
use super::projection::CostProjection;
use super::usage::UsageMonitor;
use super::OperationType;
use crate::broadcast::guard_events::GuardEvent;
use crate::config::GuardConfig;
use crate::error::GuardError;

/// Pre-operation quota check in front of the circuit breaker.
pub struct CostGuard {
    config: GuardConfig,
    breaker: Arc<CircuitBreaker>,
    monitor: Arc<UsageMonitor>,
}

impl CostGuard {
    pub fn new(
        config: GuardConfig,
        breaker: Arc<CircuitBreaker>,
        monitor: Arc<UsageMonitor>,
    ) -> Self {
        Self {
            config,
            breaker,
            monitor,
        }
    }

    /// Authorizes an operation of the given size and request count.
    ///
    /// Fails with `Suspended` while the breaker is open, before any usage is
    /// read. Otherwise projects usage after the operation; if any metric
    /// reaches the block threshold the breaker is opened and the call fails
    /// with `QuotaExceeded` naming the first offending metric.
    pub fn enforce_limits(
        &self,
        operation: OperationType,
        estimated_size: u64,
        estimated_requests: u64,
    ) -> Result<CostProjection, GuardError> {
        let admission = self.breaker.acquire()?;

        let usage = self.monitor.current();
        let projection = CostProjection::compute(
            &usage,
            operation,
            estimated_size,
            estimated_requests,
            &self.config,
        );

        if let Some(breach) = projection.first_breach(self.config.block_threshold_percent) {
            let reason = format!(
                "{} projected at {:.1}% of quota by {} of {} bytes",
                breach.metric, breach.projected_percent, operation, estimated_size
            );
            warn!("Blocking operation: {}", reason);
            self.breaker.open(&reason);
            return Err(GuardError::QuotaExceeded {
                metric: breach.metric,
                percentage: breach.projected_percent,
            });
        }

        for metric in projection.warnings(self.config.warn_threshold_percent) {
            warn!(
                "{} projected at {:.1}% of quota after {}",
                metric.metric, metric.projected_percent, operation
            );
            self.breaker.events().send(GuardEvent::ProjectionWarning {
                operation,
                metric: metric.metric,
                percentage: metric.projected_percent,
            });
        }

        if admission == Admission::Trial {
            self.breaker.record_success();
        }

        debug!(
            "Authorized {} of {} bytes ({} requests), projected monthly cost {:.2}",
            operation, estimated_size, estimated_requests, projection.projected_monthly_cost
        );
        Ok(projection)
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn monitor(&self) -> &Arc<UsageMonitor> {
        &self.monitor
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GuardEvent> {
        self.breaker.subscribe()
    }
}
