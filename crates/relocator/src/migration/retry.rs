//! Error classification and bounded retry with exponential backoff.

use std::io::ErrorKind;
use std::time::Duration;

use log::warn;

use crate::config::RetryPolicy;
use crate::error::{GuardError, MigrationError, PoolError, StorageError};
use crate::guard::CircuitBreaker;

use super::collaborators::ErrorTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network failures and timeouts.
    Transient,
    /// Storage or transfer limits; trips the breaker.
    Quota,
    /// Refused by a breaker that is already open or running its trial.
    Suspended,
    /// Access denied, bad parameters, missing bucket.
    Permission,
    NotFound,
    Unknown,
}

impl ErrorClass {
    pub fn of_storage(error: &StorageError) -> Self {
        match error {
            StorageError::NotFound { .. } => ErrorClass::NotFound,
            StorageError::QuotaExceeded(_) => ErrorClass::Quota,
            StorageError::Network(_) | StorageError::Timeout(_) => ErrorClass::Transient,
            StorageError::PermissionDenied(_)
            | StorageError::InvalidKey { .. }
            | StorageError::Misconfigured(_) => ErrorClass::Permission,
            StorageError::Io { source, .. } => match source.kind() {
                ErrorKind::NotFound => ErrorClass::NotFound,
                ErrorKind::PermissionDenied => ErrorClass::Permission,
                ErrorKind::TimedOut
                | ErrorKind::Interrupted
                | ErrorKind::WouldBlock
                | ErrorKind::ConnectionReset
                | ErrorKind::ConnectionAborted
                | ErrorKind::BrokenPipe => ErrorClass::Transient,
                _ => ErrorClass::Unknown,
            },
            StorageError::Other(_) => ErrorClass::Unknown,
        }
    }

    pub fn of_pool(error: &PoolError) -> Self {
        match error {
            PoolError::Timeout { .. } => ErrorClass::Transient,
            PoolError::WorkerCrashed { .. } | PoolError::TaskFailed(_) => ErrorClass::Unknown,
            PoolError::UnknownMethod(_)
            | PoolError::SpawnFailed(_)
            | PoolError::Terminated
            | PoolError::ChannelClosed => ErrorClass::Permission,
        }
    }

    pub fn of(error: &MigrationError) -> Self {
        match error {
            MigrationError::Storage(e) => Self::of_storage(e),
            MigrationError::Pool(e) => Self::of_pool(e),
            MigrationError::Guard(GuardError::QuotaExceeded { .. }) => ErrorClass::Quota,
            MigrationError::Guard(GuardError::Suspended { .. }) => ErrorClass::Suspended,
            MigrationError::Transform(_) | MigrationError::Database(_) => ErrorClass::Unknown,
            _ => ErrorClass::Permission,
        }
    }

    /// How many times an error of this class is retried.
    pub fn retry_budget(&self, policy: &RetryPolicy) -> u32 {
        match self {
            ErrorClass::Transient => policy.max_retries,
            ErrorClass::Quota | ErrorClass::Suspended | ErrorClass::Permission => 0,
            ErrorClass::NotFound | ErrorClass::Unknown => 1,
        }
    }
}

/// Delay before retry number `attempt` (0-based).
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let factor = policy.backoff_multiplier.max(1.0).powi(attempt as i32);
    let delay = (policy.initial_delay_ms as f64 * factor).min(policy.max_delay_ms as f64);
    Duration::from_millis(delay as u64)
}

/// Runs `op` until it succeeds or its error class runs out of retries.
///
/// Quota errors open `breaker` (when given) and return immediately.
/// Suspended errors return immediately and leave the breaker alone.
/// Unknown errors that survive their retry are reported to `tracker`.
pub fn with_retry<T, F>(
    policy: &RetryPolicy,
    context: &str,
    tracker: &dyn ErrorTracker,
    breaker: Option<&CircuitBreaker>,
    mut op: F,
) -> Result<T, MigrationError>
where
    F: FnMut() -> Result<T, MigrationError>,
{
    let mut attempt = 0;
    loop {
        let error = match op() {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        let class = ErrorClass::of(&error);
        if class == ErrorClass::Quota {
            if let Some(breaker) = breaker {
                breaker.open(&format!("{}: {}", context, error));
            }
            return Err(error);
        }

        let budget = class.retry_budget(policy);
        if attempt >= budget {
            if class == ErrorClass::Unknown {
                tracker.report(context, &error);
            }
            return Err(error);
        }

        let delay = backoff_delay(policy, attempt);
        attempt += 1;
        warn!(
            "{} failed ({:?}): {}; retry {}/{} in {:?}",
            context, class, error, attempt, budget, delay
        );
        std::thread::sleep(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BreakerConfig;
    use crate::guard::{Admission, BreakerState};
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<String>>);

    impl ErrorTracker for Recorder {
        fn report(&self, context: &str, error: &MigrationError) {
            self.0.lock().unwrap().push(format!("{}: {}", context, error));
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            initial_delay_ms: 1,
            max_delay_ms: 4,
            backoff_multiplier: 2.0,
        }
    }

    fn run(
        error: impl Fn() -> MigrationError,
        breaker: Option<&CircuitBreaker>,
        tracker: &Recorder,
    ) -> u32 {
        let mut calls = 0;
        let result: Result<(), _> = with_retry(&fast_policy(), "upload", tracker, breaker, || {
            calls += 1;
            Err(error())
        });
        assert!(result.is_err());
        calls
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(backoff_delay(&policy, 0), Duration::from_millis(1000));
        assert_eq!(backoff_delay(&policy, 1), Duration::from_millis(2000));
        assert_eq!(backoff_delay(&policy, 3), Duration::from_millis(8000));
        assert_eq!(backoff_delay(&policy, 10), Duration::from_millis(30000));
    }

    #[test]
    fn test_classification() {
        assert_eq!(
            ErrorClass::of_storage(&StorageError::Network("reset".into())),
            ErrorClass::Transient
        );
        assert_eq!(
            ErrorClass::of_storage(&StorageError::QuotaExceeded("full".into())),
            ErrorClass::Quota
        );
        assert_eq!(
            ErrorClass::of_storage(&StorageError::Misconfigured("bucket".into())),
            ErrorClass::Permission
        );
        assert_eq!(
            ErrorClass::of_pool(&PoolError::Timeout {
                task_id: 1,
                method: "transcode".into(),
                timeout_ms: 5
            }),
            ErrorClass::Transient
        );
        assert_eq!(
            ErrorClass::of(&MigrationError::Guard(GuardError::Suspended {
                reason: "open".into()
            })),
            ErrorClass::Suspended
        );
        assert_eq!(
            ErrorClass::of(&MigrationError::Guard(GuardError::QuotaExceeded {
                metric: crate::guard::QuotaMetric::StorageBytes,
                percentage: 96.0
            })),
            ErrorClass::Quota
        );
    }

    #[test]
    fn test_retry_budgets() {
        let tracker = Recorder::default();
        assert_eq!(
            run(|| StorageError::Network("reset".into()).into(), None, &tracker),
            4
        );
        assert_eq!(
            run(|| StorageError::PermissionDenied("no".into()).into(), None, &tracker),
            1
        );
        assert_eq!(
            run(|| StorageError::NotFound { key: "k".into() }.into(), None, &tracker),
            2
        );
        assert!(tracker.0.lock().unwrap().is_empty());

        assert_eq!(
            run(|| MigrationError::Transform("bad".into()), None, &tracker),
            2
        );
        assert_eq!(tracker.0.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_quota_error_trips_breaker_without_retry() {
        let tracker = Recorder::default();
        let breaker = CircuitBreaker::new(BreakerConfig::default());
        let calls = run(
            || StorageError::QuotaExceeded("bucket full".into()).into(),
            Some(&breaker),
            &tracker,
        );
        assert_eq!(calls, 1);
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn test_suspended_rejection_leaves_half_open_trial_alone() {
        let tracker = Recorder::default();
        let breaker = CircuitBreaker::new(BreakerConfig {
            max_failures: 1,
            timeout_ms: 0,
        });
        breaker.record_failure("boom");
        assert_eq!(breaker.acquire(), Ok(Admission::Trial));

        let mut calls = 0;
        let result: Result<(), _> =
            with_retry(&fast_policy(), "upload", &tracker, Some(&breaker), || {
                calls += 1;
                breaker.call(|| Ok::<(), MigrationError>(()))
            });

        assert!(matches!(
            result,
            Err(MigrationError::Guard(GuardError::Suspended { .. }))
        ));
        assert_eq!(calls, 1);
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn test_recovers_after_transient_failure() {
        let tracker = Recorder::default();
        let mut calls = 0;
        let value = with_retry(&fast_policy(), "download", &tracker, None, || {
            calls += 1;
            if calls < 3 {
                Err(StorageError::Timeout(Duration::from_millis(5)).into())
            } else {
                Ok(calls)
            }
        })
        .unwrap();
        assert_eq!(value, 3);
    }
}
