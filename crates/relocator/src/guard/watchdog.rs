//! Periodic usage sampling independent of any in-flight operation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use super::breaker::CircuitBreaker;
use super::usage::UsageMonitor;
use super::{AlertLevel, QuotaMetric};
use crate::broadcast::guard_events::GuardEvent;
use crate::config::GuardConfig;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UsageAlert {
    pub level: AlertLevel,
    pub metric: QuotaMetric,
    pub percentage: f64,
    pub message: String,
}

/// Samples measured usage on an interval, raises tiered alerts, and opens
/// the breaker when measured usage reaches the autonomous trip threshold.
pub struct UsageWatchdog {
    config: GuardConfig,
    breaker: Arc<CircuitBreaker>,
    monitor: Arc<UsageMonitor>,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
    trigger: broadcast::Sender<()>,
}

impl UsageWatchdog {
    pub fn new(
        config: GuardConfig,
        breaker: Arc<CircuitBreaker>,
        monitor: Arc<UsageMonitor>,
    ) -> Self {
        let interval = Duration::from_millis(config.monitor_interval_ms.max(1));
        let (trigger, _) = broadcast::channel(16);
        Self {
            config,
            breaker,
            monitor,
            interval,
            shutdown: Arc::new(AtomicBool::new(false)),
            trigger,
        }
    }

    /// Takes one sample now and acts on it.
    pub fn sample_once(&self) -> Vec<UsageAlert> {
        evaluate(&self.config, &self.breaker, &self.monitor)
    }

    /// Starts the sampling loop in a background thread.
    pub fn start(&self) -> JoinHandle<()> {
        let config = self.config.clone();
        let breaker = Arc::clone(&self.breaker);
        let monitor = Arc::clone(&self.monitor);
        let shutdown = Arc::clone(&self.shutdown);
        let interval = self.interval;
        let mut trigger_rx = self.trigger.subscribe();

        std::thread::spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(rt) => rt,
                Err(e) => {
                    error!("Usage watchdog could not start its runtime: {}", e);
                    return;
                }
            };

            rt.block_on(async {
                let mut interval_timer = tokio::time::interval(interval);
                interval_timer.tick().await; // skip immediate first tick

                loop {
                    if shutdown.load(Ordering::Acquire) {
                        break;
                    }

                    tokio::select! {
                        _ = interval_timer.tick() => {},
                        Ok(()) = trigger_rx.recv() => {
                            log::debug!("Manual usage sample triggered");
                        },
                    }

                    if shutdown.load(Ordering::Acquire) {
                        break;
                    }

                    evaluate(&config, &breaker, &monitor);
                }
            });
            info!("Usage watchdog stopped");
        })
    }

    /// Requests an immediate sample from the running loop.
    pub fn trigger(&self) {
        let _ = self.trigger.send(());
    }

    /// Signals the loop to stop and wakes it.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        let _ = self.trigger.send(());
    }
}

fn evaluate(
    config: &GuardConfig,
    breaker: &CircuitBreaker,
    monitor: &UsageMonitor,
) -> Vec<UsageAlert> {
    let usage = monitor.sample();
    let percentages = usage.percentages(&config.quotas);
    let bands = &config.alert_bands;

    let mut alerts = Vec::new();
    for &(metric, percentage) in &percentages {
        let level = if percentage >= bands.critical {
            AlertLevel::Critical
        } else if percentage >= bands.warning {
            AlertLevel::Warning
        } else if percentage >= bands.info {
            AlertLevel::Info
        } else {
            continue;
        };

        let message = format!("{} usage at {:.1}% of quota", metric, percentage);
        match level {
            AlertLevel::Critical => error!("{}", message),
            AlertLevel::Warning => warn!("{}", message),
            AlertLevel::Info => info!("{}", message),
        }
        breaker.events().send(GuardEvent::UsageAlert {
            level,
            metric,
            percentage,
            message: message.clone(),
        });
        alerts.push(UsageAlert {
            level,
            metric,
            percentage,
            message,
        });
    }

    if let Some(&(metric, percentage)) = percentages
        .iter()
        .find(|(_, p)| *p >= config.autonomous_trip_percent)
    {
        let reason = format!(
            "measured {} usage at {:.1}% reached the {}% limit",
            metric, percentage, config.autonomous_trip_percent
        );
        breaker.open(&reason);
    }

    alerts
}
