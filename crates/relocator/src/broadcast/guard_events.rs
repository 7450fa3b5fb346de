//! Circuit breaker and usage alert events.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::guard::{AlertLevel, BreakerState, OperationType, QuotaMetric};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GuardEvent {
    /// The breaker moved between states.
    StateChanged {
        from: BreakerState,
        to: BreakerState,
        reason: String,
        at: DateTime<Utc>,
    },
    /// A permitted operation is projected to cross the warning threshold.
    ProjectionWarning {
        operation: OperationType,
        metric: QuotaMetric,
        percentage: f64,
    },
    /// A periodic usage sample landed in an alert band.
    UsageAlert {
        level: AlertLevel,
        metric: QuotaMetric,
        percentage: f64,
        message: String,
    },
}

/// Broadcasts guard events.
#[derive(Clone)]
pub struct GuardEventBroadcaster {
    sender: Arc<broadcast::Sender<GuardEvent>>,
}

impl GuardEventBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn send(&self, event: GuardEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GuardEvent> {
        self.sender.subscribe()
    }
}

impl Default for GuardEventBroadcaster {
    fn default() -> Self {
        Self::new(100)
    }
}
