//! Retry with exponential backoff and jitter.
//!
//! The executor runs an operation up to `max_attempts` times, sleeping between
//! attempts and stopping early on non-retryable errors or cancellation.
//!
//! # Example
//!
//! ```no_run
//! use devhub_core::resilience::retry::{RetryConfig, RetryExecutor};
//! use tokio_util::sync::CancellationToken;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let executor = RetryExecutor::new(RetryConfig {
//!     max_attempts: 5,
//!     initial_delay: Duration::from_millis(100),
//!     max_delay: Duration::from_secs(30),
//!     backoff_multiplier: 2.0,
//!     jitter: true,
//! });
//!
//! let cancel = CancellationToken::new();
//! let value = executor
//!     .execute(&cancel, || async { Ok::<_, std::io::Error>(42) })
//!     .await?;
//! # Ok(())
//! # }
//! ```

use crate::config::{require_positive, ConfigError};
use crate::resilience::circuit_breaker::CircuitOpenError;
use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Fraction of the capped delay added at most as jitter.
const JITTER_FACTOR: f64 = 0.10;

/// Substrings (lowercase) that mark an error message as transient.
const TRANSIENT_PATTERNS: &[&str] = &[
    "connection refused",
    "connection reset",
    "timeout",
    "timed out",
    "rate limit",
    "service unavailable",
    "network unreachable",
    "network is unreachable",
    "i/o timeout",
];

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    #[serde(rename = "initial_delay_ms", with = "crate::config::duration_ms")]
    pub initial_delay: Duration,
    /// Upper bound on the computed delay, before jitter
    #[serde(rename = "max_delay_ms", with = "crate::config::duration_ms")]
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("retry.max_attempts", self.max_attempts.into())?;
        if self.backoff_multiplier.is_nan() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::new(
                "retry.backoff_multiplier",
                "must be at least 1.0",
            ));
        }
        if self.initial_delay > self.max_delay {
            return Err(ConfigError::new(
                "retry.initial_delay_ms",
                "must not exceed max_delay_ms",
            ));
        }
        Ok(())
    }
}

/// Caller-supplied retryability decision.
pub type RetryPredicate = Arc<dyn Fn(&(dyn StdError + 'static)) -> bool + Send + Sync>;

/// Terminal outcome of a failed [`RetryExecutor::execute`].
#[derive(Debug)]
pub enum RetryError<E> {
    /// Cancellation was observed before or between attempts
    Cancelled {
        /// Attempts made before cancellation
        attempts: u32,
    },
    /// The error was classified as not worth retrying
    NonRetryable {
        /// Attempt at which retrying stopped
        attempt: u32,
        error: E,
    },
    /// Every attempt failed with a retryable error
    Exhausted {
        attempts: u32,
        /// Error from the final attempt
        error: E,
    },
}

impl<E> RetryError<E> {
    /// Number of times the operation was invoked.
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Cancelled { attempts } => *attempts,
            RetryError::NonRetryable { attempt, .. } => *attempt,
            RetryError::Exhausted { attempts, .. } => *attempts,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RetryError::Cancelled { .. })
    }

    /// The last underlying error, if any attempt produced one.
    pub fn into_inner(self) -> Option<E> {
        match self {
            RetryError::Cancelled { .. } => None,
            RetryError::NonRetryable { error, .. } | RetryError::Exhausted { error, .. } => {
                Some(error)
            }
        }
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Cancelled { attempts } => {
                write!(f, "operation cancelled after {} attempts", attempts)
            }
            RetryError::NonRetryable { attempt, error } => {
                write!(f, "non-retryable error on attempt {}: {}", attempt, error)
            }
            RetryError::Exhausted { attempts, error } => {
                write!(f, "operation failed after {} attempts: {}", attempts, error)
            }
        }
    }
}

impl<E: StdError + 'static> StdError for RetryError<E> {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            RetryError::Cancelled { .. } => None,
            RetryError::NonRetryable { error, .. } | RetryError::Exhausted { error, .. } => {
                Some(error)
            }
        }
    }
}

/// Built-in classifier: true when any message in the error's source chain
/// looks like a transient network failure.
///
/// Breaker rejections anywhere in the chain are never transient.
pub fn is_transient(err: &(dyn StdError + 'static)) -> bool {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    let mut transient = false;

    while let Some(e) = current {
        if e.is::<CircuitOpenError>() {
            return false;
        }
        if !transient {
            let message = e.to_string().to_lowercase();
            transient = TRANSIENT_PATTERNS.iter().any(|p| message.contains(p));
        }
        current = e.source();
    }

    transient
}

/// Runs operations under a [`RetryConfig`].
#[derive(Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
    predicate: Option<RetryPredicate>,
}

impl RetryExecutor {
    /// Create an executor using the built-in transient-error classifier.
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            predicate: None,
        }
    }

    /// Replace the built-in classifier with a caller-supplied predicate.
    pub fn with_predicate<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&(dyn StdError + 'static)) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Backoff before the attempt following `attempt` (1-based).
    ///
    /// Attempt 1 uses the unmultiplied base delay. The cap is applied before
    /// jitter, so a jittered delay may exceed `max_delay` by up to 10%.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.config.initial_delay.as_secs_f64()
            * self.config.backoff_multiplier.max(1.0).powi(exponent);
        let capped = if base.is_finite() {
            base.min(self.config.max_delay.as_secs_f64())
        } else {
            self.config.max_delay.as_secs_f64()
        };

        let delay = if self.config.jitter {
            capped + rand::random::<f64>() * JITTER_FACTOR * capped
        } else {
            capped
        };

        // An uncapped max_delay can push the float past Duration::MAX
        Duration::try_from_secs_f64(delay).unwrap_or(Duration::MAX)
    }

    fn is_retryable(&self, err: &(dyn StdError + 'static)) -> bool {
        match &self.predicate {
            Some(predicate) => predicate(err),
            None => is_transient(err),
        }
    }

    /// Execute `operation` with retries.
    ///
    /// Cancellation is checked before every attempt and interrupts backoff
    /// sleeps; an in-flight attempt is not interrupted.
    pub async fn execute<F, Fut, T, E>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: StdError + 'static,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(RetryError::Cancelled { attempts: attempt });
            }
            attempt += 1;
            debug!(attempt, max_attempts, "Retry attempt");

            let error = match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        info!(attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            if !self.is_retryable(&error) {
                warn!(attempt, error = %error, "Error is not retryable, giving up");
                return Err(RetryError::NonRetryable { attempt, error });
            }

            if attempt >= max_attempts {
                warn!(attempts = attempt, error = %error, "Max retry attempts reached");
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    error,
                });
            }

            let delay = self.delay_for_attempt(attempt);
            debug!(attempt, ?delay, error = %error, "Retrying after backoff");

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(RetryError::Cancelled { attempts: attempt });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

impl fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("config", &self.config)
            .field("custom_predicate", &self.predicate.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::circuit_breaker::{
        CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitState,
    };
    use proptest::prelude::*;
    use rstest::rstest;
    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }

    fn transient() -> io::Error {
        io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused")
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_immediately() {
        let executor = RetryExecutor::new(fast_config(3));
        let calls = AtomicU32::new(0);

        let result = executor
            .execute(&CancellationToken::new(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, io::Error>(42)
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_failures() {
        let executor = RetryExecutor::new(fast_config(5));
        let calls = AtomicU32::new(0);

        let result = executor
            .execute(&CancellationToken::new(), || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 4 {
                    Err(transient())
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhausted_after_max_attempts() {
        let executor = RetryExecutor::new(fast_config(3));
        let calls = AtomicU32::new(0);

        let err = executor
            .execute(&CancellationToken::new(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(transient())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, RetryError::Exhausted { attempts: 3, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(
            err.to_string(),
            "operation failed after 3 attempts: connection refused"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_predicate_false_short_circuits() {
        let executor = RetryExecutor::new(fast_config(10)).with_predicate(|_| false);
        let calls = AtomicU32::new(0);

        let err = executor
            .execute(&CancellationToken::new(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(transient())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, RetryError::NonRetryable { attempt: 1, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unclassified_error_is_not_retried() {
        let executor = RetryExecutor::new(fast_config(5));
        let calls = AtomicU32::new(0);

        let err = executor
            .execute(&CancellationToken::new(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(io::Error::new(io::ErrorKind::InvalidInput, "bad request"))
            })
            .await
            .unwrap_err();

        assert_eq!(err.attempts(), 1);
        assert_eq!(err.into_inner().unwrap().to_string(), "bad request");
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let executor = RetryExecutor::new(fast_config(3));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let calls = AtomicU32::new(0);

        let err = executor
            .execute(&cancel, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, io::Error>(())
            })
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(err.attempts(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_backoff() {
        let executor = RetryExecutor::new(RetryConfig {
            initial_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60),
            ..fast_config(3)
        });
        let cancel = CancellationToken::new();
        let calls = AtomicU32::new(0);

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(1)).await;
                cancel.cancel();
            })
        };

        let started = tokio::time::Instant::now();
        let err = executor
            .execute(&cancel, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(transient())
            })
            .await
            .unwrap_err();
        canceller.await.unwrap();

        assert!(matches!(err, RetryError::Cancelled { attempts: 1 }));
        assert!(started.elapsed() < Duration::from_secs(60));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_rejection_is_not_retried() {
        let breaker = CircuitBreaker::new(
            "ai",
            CircuitBreakerConfig {
                failure_threshold: 1,
                ..Default::default()
            },
        );
        let _ = breaker.call(|| async { Err::<(), _>(transient()) }).await;
        assert_eq!(breaker.state(), CircuitState::Open);

        let executor = RetryExecutor::new(fast_config(5));
        let err = executor
            .execute(&CancellationToken::new(), || {
                breaker.call(|| async { Ok::<_, io::Error>(()) })
            })
            .await
            .unwrap_err();

        match err {
            RetryError::NonRetryable {
                attempt: 1,
                error: CircuitBreakerError::Open(open),
            } => assert_eq!(open.name, "ai"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[rstest]
    #[case("connection refused", true)]
    #[case("Connection reset by peer", true)]
    #[case("operation timed out", true)]
    #[case("request Timeout", true)]
    #[case("rate limit exceeded", true)]
    #[case("503 Service Unavailable", true)]
    #[case("network is unreachable", true)]
    #[case("read tcp: i/o timeout", true)]
    #[case("invalid api key", false)]
    #[case("not found", false)]
    fn test_transient_classifier(#[case] message: &str, #[case] expected: bool) {
        let err = io::Error::new(io::ErrorKind::Other, message.to_string());
        assert_eq!(is_transient(&err), expected);
    }

    #[derive(Debug, thiserror::Error)]
    #[error("upstream call failed")]
    struct Upstream(#[source] io::Error);

    #[test]
    fn test_classifier_walks_source_chain() {
        assert!(is_transient(&Upstream(transient())));
        assert!(!is_transient(&Upstream(io::Error::new(
            io::ErrorKind::Other,
            "invalid payload"
        ))));
    }

    #[test]
    fn test_exponential_delays_without_jitter() {
        let executor = RetryExecutor::new(RetryConfig {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            jitter: false,
        });

        assert_eq!(executor.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(executor.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(executor.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(executor.delay_for_attempt(5), Duration::from_secs(1));
        assert_eq!(executor.delay_for_attempt(50), Duration::from_secs(1));
    }

    #[rstest]
    #[case(true)]
    #[case(false)]
    fn test_uncapped_delay_saturates(#[case] jitter: bool) {
        let config = RetryConfig {
            max_attempts: 100,
            max_delay: Duration::MAX,
            jitter,
            ..Default::default()
        };
        assert!(config.validate().is_ok());
        let executor = RetryExecutor::new(config);

        assert_eq!(executor.delay_for_attempt(80), Duration::MAX);
        assert_eq!(executor.delay_for_attempt(u32::MAX), Duration::MAX);
        assert!(executor.delay_for_attempt(1) >= Duration::from_millis(100));
    }

    #[test]
    fn test_config_validation() {
        assert!(RetryConfig::default().validate().is_ok());
        let err = RetryConfig {
            backoff_multiplier: 0.5,
            ..Default::default()
        }
        .validate()
        .unwrap_err();
        assert_eq!(err.field, "retry.backoff_multiplier");
        assert!(RetryConfig {
            max_attempts: 0,
            ..Default::default()
        }
        .validate()
        .is_err());
    }

    proptest! {
        #[test]
        fn prop_delay_monotonic_until_cap(
            initial_ms in 1u64..1_000,
            max_ms in 1_000u64..60_000,
            multiplier in 1.0f64..4.0,
            attempt in 1u32..40,
        ) {
            let executor = RetryExecutor::new(RetryConfig {
                max_attempts: 50,
                initial_delay: Duration::from_millis(initial_ms),
                max_delay: Duration::from_millis(max_ms),
                backoff_multiplier: multiplier,
                jitter: false,
            });
            let current = executor.delay_for_attempt(attempt);
            let next = executor.delay_for_attempt(attempt + 1);
            prop_assert!(next >= current);
            prop_assert!(next.as_secs_f64() <= max_ms as f64 / 1000.0 + 1e-9);
        }

        #[test]
        fn prop_jittered_delay_bounded(
            initial_ms in 1u64..1_000,
            max_ms in 1_000u64..60_000,
            multiplier in 1.0f64..4.0,
            attempt in 1u32..40,
        ) {
            let max_delay = Duration::from_millis(max_ms);
            let executor = RetryExecutor::new(RetryConfig {
                max_attempts: 50,
                initial_delay: Duration::from_millis(initial_ms),
                max_delay,
                backoff_multiplier: multiplier,
                jitter: true,
            });
            let delay = executor.delay_for_attempt(attempt);
            prop_assert!(delay.as_secs_f64() <= max_delay.as_secs_f64() * 1.10 + 1e-9);
            prop_assert!(delay >= Duration::from_millis(initial_ms.min(max_ms)) - Duration::from_nanos(1));
        }
    }
}
