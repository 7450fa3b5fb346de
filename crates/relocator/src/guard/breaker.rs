use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::broadcast::guard_events::{GuardEvent, GuardEventBroadcaster};
use crate::config::BreakerConfig;
use crate::error::GuardError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BreakerState::Closed => write!(f, "closed"),
            BreakerState::Open => write!(f, "open"),
            BreakerState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// How an operation was let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Normal,
    /// The single half-open trial; its outcome decides the next state.
    Trial,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub failure_count: u32,
    pub last_failure_time: Option<DateTime<Utc>>,
    pub last_success_time: Option<DateTime<Utc>>,
    pub open_reason: Option<String>,
}

struct BreakerInner {
    state: BreakerState,
    failure_count: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
    open_reason: Option<String>,
    trial_in_flight: bool,
}

/// Three-state circuit breaker.
///
/// All reads and writes go through one mutex, so the per-call projection trip
/// and the watchdog's autonomous trip are serialized against each other.
pub struct CircuitBreaker {
    max_failures: u32,
    timeout: Duration,
    inner: Mutex<BreakerInner>,
    events: GuardEventBroadcaster,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self::with_events(config, GuardEventBroadcaster::default())
    }

    pub fn with_events(config: BreakerConfig, events: GuardEventBroadcaster) -> Self {
        Self {
            max_failures: config.max_failures.max(1),
            timeout: Duration::from_millis(config.timeout_ms),
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failure_count: 0,
                last_failure: None,
                last_failure_at: None,
                last_success_at: None,
                open_reason: None,
                trial_in_flight: false,
            }),
            events,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        // The inner state stays consistent even if a holder panicked.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn cooled_down(&self, inner: &BreakerInner) -> bool {
        inner
            .last_failure
            .map_or(true, |at| at.elapsed() >= self.timeout)
    }

    fn transition(&self, inner: &mut BreakerInner, to: BreakerState, reason: &str) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        match to {
            BreakerState::Open => warn!("Circuit breaker opened: {}", reason),
            BreakerState::HalfOpen => info!("Circuit breaker half-open: {}", reason),
            BreakerState::Closed => info!("Circuit breaker closed: {}", reason),
        }
        self.events.send(GuardEvent::StateChanged {
            from,
            to,
            reason: reason.to_string(),
            at: Utc::now(),
        });
    }

    /// Asks to run one guarded operation.
    ///
    /// While Open and before the timeout has elapsed this fails without side
    /// effects. The first call after the timeout becomes the half-open trial;
    /// further calls are refused until the trial reports back.
    pub fn acquire(&self) -> Result<Admission, GuardError> {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => Ok(Admission::Normal),
            BreakerState::Open => {
                if !self.cooled_down(&inner) {
                    return Err(GuardError::Suspended {
                        reason: inner
                            .open_reason
                            .clone()
                            .unwrap_or_else(|| "circuit breaker is open".to_string()),
                    });
                }
                inner.trial_in_flight = true;
                self.transition(
                    &mut inner,
                    BreakerState::HalfOpen,
                    "timeout elapsed, allowing trial",
                );
                Ok(Admission::Trial)
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    return Err(GuardError::Suspended {
                        reason: "circuit breaker trial operation in progress".to_string(),
                    });
                }
                inner.trial_in_flight = true;
                Ok(Admission::Trial)
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.failure_count = 0;
        inner.last_success_at = Some(Utc::now());
        if inner.state == BreakerState::HalfOpen {
            inner.trial_in_flight = false;
            inner.open_reason = None;
            self.transition(&mut inner, BreakerState::Closed, "trial operation succeeded");
        }
    }

    pub fn record_failure(&self, reason: &str) {
        let mut inner = self.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        inner.last_failure = Some(Instant::now());
        inner.last_failure_at = Some(Utc::now());

        match inner.state {
            BreakerState::HalfOpen => {
                inner.trial_in_flight = false;
                inner.open_reason = Some(reason.to_string());
                self.transition(&mut inner, BreakerState::Open, reason);
            }
            BreakerState::Closed if inner.failure_count >= self.max_failures => {
                let message = format!(
                    "{} consecutive failures, last: {}",
                    inner.failure_count, reason
                );
                inner.open_reason = Some(message.clone());
                self.transition(&mut inner, BreakerState::Open, &message);
            }
            _ => {}
        }
    }

    /// Forces the breaker Open. Returns false if it already was, in which
    /// case the original reason and timer are kept.
    pub fn open(&self, reason: &str) -> bool {
        let mut inner = self.lock();
        if inner.state == BreakerState::Open {
            return false;
        }
        inner.trial_in_flight = false;
        inner.last_failure = Some(Instant::now());
        inner.last_failure_at = Some(Utc::now());
        inner.open_reason = Some(reason.to_string());
        self.transition(&mut inner, BreakerState::Open, reason);
        true
    }

    /// Returns to Closed and clears the failure history.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.failure_count = 0;
        inner.trial_in_flight = false;
        inner.open_reason = None;
        inner.last_failure = None;
        self.transition(&mut inner, BreakerState::Closed, "manual reset");
    }

    /// Runs `f` under the breaker, recording its outcome.
    pub fn call<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Result<T, E>,
        E: From<GuardError> + std::fmt::Display,
    {
        self.acquire()?;
        match f() {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure(&e.to_string());
                Err(e)
            }
        }
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// True while Open and the timeout has not yet elapsed.
    pub fn is_blocking(&self) -> bool {
        let inner = self.lock();
        inner.state == BreakerState::Open && !self.cooled_down(&inner)
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        BreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            last_failure_time: inner.last_failure_at,
            last_success_time: inner.last_success_at,
            open_reason: inner.open_reason.clone(),
        }
    }

    pub fn events(&self) -> &GuardEventBroadcaster {
        &self.events
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GuardEvent> {
        self.events.subscribe()
    }
}
