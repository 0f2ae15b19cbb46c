//! Circuit Breaker implementation for preventing cascading failures.
//!
//! A circuit breaker monitors calls to one dependency and fails fast once the
//! dependency is judged unhealthy, periodically re-probing it.
//!
//! # States
//!
//! - **Closed**: Normal operation, calls pass through
//! - **Open**: Too many consecutive failures, calls are rejected without running
//! - **HalfOpen**: A bounded number of trial calls test whether the dependency recovered
//!
//! # Example
//!
//! ```no_run
//! use devhub_core::resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let config = CircuitBreakerConfig {
//!     failure_threshold: 5,
//!     success_threshold: 2,
//!     timeout: Duration::from_secs(60),
//!     half_open_max_requests: 3,
//! };
//!
//! let breaker = CircuitBreaker::new("openai", config);
//!
//! match breaker.call(|| async { Ok::<_, std::io::Error>(42) }).await {
//!     Ok(result) => println!("Success: {}", result),
//!     Err(e) if e.is_open() => eprintln!("Dependency unavailable: {}", e),
//!     Err(e) => eprintln!("Call failed: {}", e),
//! }
//! # }
//! ```

use crate::config::{require_positive, ConfigError};
use crate::observability::metrics::{BREAKER_REJECTIONS, BREAKER_TRANSITIONS};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Retry hint handed out when the half-open trial quota is exhausted.
const HALF_OPEN_RETRY_HINT: Duration = Duration::from_secs(1);

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, calls pass through
    Closed,
    /// Too many failures, calls are rejected
    Open,
    /// Testing if the dependency has recovered
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for circuit breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Number of successful trial calls in half-open state needed to close the circuit
    pub success_threshold: u32,
    /// Time to wait before transitioning from open to half-open
    #[serde(rename = "timeout_ms", with = "crate::config::duration_ms")]
    pub timeout: Duration,
    /// Maximum number of concurrent trial calls allowed in half-open state
    pub half_open_max_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(60),
            half_open_max_requests: 3,
        }
    }
}

impl CircuitBreakerConfig {
    /// Checks the `>= 1` constraints on every threshold.
    pub fn validate(&self) -> Result<(), ConfigError> {
        require_positive("circuit_breaker.failure_threshold", self.failure_threshold.into())?;
        require_positive("circuit_breaker.success_threshold", self.success_threshold.into())?;
        require_positive(
            "circuit_breaker.half_open_max_requests",
            self.half_open_max_requests.into(),
        )?;
        Ok(())
    }
}

/// The breaker refused to run the call.
///
/// Distinct from the wrapped function's own failure so callers can tell an
/// outage of the dependency apart from a bad request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitOpenError {
    /// Name of the breaker that rejected the call
    pub name: String,
    /// State of the breaker at rejection time
    pub state: CircuitState,
    /// Suggested wait before trying again
    pub retry_after: Duration,
}

impl CircuitOpenError {
    /// Retry hint rounded up to whole seconds.
    pub fn retry_after_secs(&self) -> u64 {
        let secs = self.retry_after.as_secs();
        if self.retry_after.subsec_nanos() > 0 {
            secs + 1
        } else {
            secs
        }
    }
}

impl fmt::Display for CircuitOpenError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "circuit breaker '{}' is {}: temporarily unavailable, retry after {}s",
            self.name,
            self.state,
            self.retry_after_secs()
        )
    }
}

impl std::error::Error for CircuitOpenError {}

/// Result of a call made through a [`CircuitBreaker`].
#[derive(Debug)]
pub enum CircuitBreakerError<E> {
    /// The breaker rejected the call without running it
    Open(CircuitOpenError),
    /// The wrapped function ran and returned this error
    Failed(E),
}

impl<E> CircuitBreakerError<E> {
    /// True when the call was refused by the breaker.
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitBreakerError::Open(_))
    }

    /// The rejection details, if the breaker refused the call.
    pub fn open_error(&self) -> Option<&CircuitOpenError> {
        match self {
            CircuitBreakerError::Open(e) => Some(e),
            CircuitBreakerError::Failed(_) => None,
        }
    }

    /// The wrapped function's own error, unchanged.
    pub fn into_inner(self) -> Option<E> {
        match self {
            CircuitBreakerError::Open(_) => None,
            CircuitBreakerError::Failed(e) => Some(e),
        }
    }
}

impl<E: fmt::Display> fmt::Display for CircuitBreakerError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitBreakerError::Open(e) => fmt::Display::fmt(e, f),
            CircuitBreakerError::Failed(e) => fmt::Display::fmt(e, f),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for CircuitBreakerError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CircuitBreakerError::Open(e) => Some(e),
            CircuitBreakerError::Failed(e) => e.source(),
        }
    }
}

/// Lifetime counters for a circuit breaker
#[derive(Debug, Default)]
struct CircuitBreakerMetrics {
    failures: AtomicU64,
    successes: AtomicU64,
    opened_count: AtomicU64,
    closed_count: AtomicU64,
    rejected_count: AtomicU64,
}

impl CircuitBreakerMetrics {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Mutable state, guarded by a single mutex.
///
/// `generation` changes on every transition; results of calls admitted under an
/// older generation are discarded.
struct CircuitBreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    half_open_requests: u32,
    last_state_change: Instant,
    generation: u64,
}

impl CircuitBreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            half_open_requests: 0,
            last_state_change: Instant::now(),
            generation: 0,
        }
    }
}

/// Ticket handed out when a call is admitted.
#[derive(Debug, Clone, Copy)]
struct Admission {
    generation: u64,
    trial: bool,
}

/// Circuit breaker for a single named dependency
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<CircuitBreakerState>,
    metrics: CircuitBreakerMetrics,
}

impl CircuitBreaker {
    /// Create a new circuit breaker. Thresholds below 1 are raised to 1.
    pub fn new(name: impl Into<String>, mut config: CircuitBreakerConfig) -> Self {
        let name = name.into();
        config.failure_threshold = config.failure_threshold.max(1);
        config.success_threshold = config.success_threshold.max(1);
        config.half_open_max_requests = config.half_open_max_requests.max(1);
        info!(breaker = %name, "Creating circuit breaker");

        Self {
            name,
            config,
            state: Mutex::new(CircuitBreakerState::new()),
            metrics: CircuitBreakerMetrics::default(),
        }
    }

    /// Name of the protected dependency
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Configuration in effect
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get the current state of the circuit breaker
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Snapshot of counters and current state
    pub fn stats(&self) -> CircuitBreakerStats {
        let state = self.lock();
        CircuitBreakerStats {
            name: self.name.clone(),
            state: state.state,
            failure_count: state.failure_count,
            success_count: state.success_count,
            half_open_requests: state.half_open_requests,
            failures: self.metrics.failures.load(Ordering::Relaxed),
            successes: self.metrics.successes.load(Ordering::Relaxed),
            opened_count: self.metrics.opened_count.load(Ordering::Relaxed),
            closed_count: self.metrics.closed_count.load(Ordering::Relaxed),
            rejected_count: self.metrics.rejected_count.load(Ordering::Relaxed),
        }
    }

    /// Call a function with circuit breaker protection.
    ///
    /// The function's own error is returned unchanged inside
    /// [`CircuitBreakerError::Failed`]; [`CircuitBreakerError::Open`] means it
    /// was never invoked.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let admission = self.admit().map_err(CircuitBreakerError::Open)?;
        let mut in_flight = InFlight {
            breaker: self,
            admission,
            settled: false,
        };

        match f().await {
            Ok(result) => {
                in_flight.settle(true);
                Ok(result)
            }
            Err(e) => {
                in_flight.settle(false);
                Err(CircuitBreakerError::Failed(e))
            }
        }
    }

    /// Reset the circuit breaker to closed state with zeroed counters
    pub fn reset(&self) {
        let mut state = self.lock();
        info!(breaker = %self.name, from = %state.state, "Manually resetting circuit breaker");
        self.transition(&mut state, CircuitState::Closed);
    }

    fn lock(&self) -> MutexGuard<'_, CircuitBreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decide whether a call may run, moving Open to HalfOpen once the timeout elapsed.
    fn admit(&self) -> Result<Admission, CircuitOpenError> {
        let mut state = self.lock();

        match state.state {
            CircuitState::Closed => Ok(Admission {
                generation: state.generation,
                trial: false,
            }),
            CircuitState::Open => {
                let elapsed = state.last_state_change.elapsed();
                if elapsed >= self.config.timeout {
                    self.transition(&mut state, CircuitState::HalfOpen);
                    state.half_open_requests = 1;
                    Ok(Admission {
                        generation: state.generation,
                        trial: true,
                    })
                } else {
                    Err(self.reject(CircuitState::Open, self.config.timeout - elapsed))
                }
            }
            CircuitState::HalfOpen => {
                if state.half_open_requests >= self.config.half_open_max_requests {
                    Err(self.reject(CircuitState::HalfOpen, HALF_OPEN_RETRY_HINT))
                } else {
                    state.half_open_requests += 1;
                    Ok(Admission {
                        generation: state.generation,
                        trial: true,
                    })
                }
            }
        }
    }

    fn reject(&self, state: CircuitState, retry_after: Duration) -> CircuitOpenError {
        CircuitBreakerMetrics::bump(&self.metrics.rejected_count);
        counter!(BREAKER_REJECTIONS, "breaker" => self.name.clone()).increment(1);
        debug!(breaker = %self.name, %state, "Circuit breaker rejected call");

        CircuitOpenError {
            name: self.name.clone(),
            state,
            retry_after,
        }
    }

    /// Apply the outcome of an admitted call.
    fn record(&self, admission: Admission, success: bool) {
        if success {
            CircuitBreakerMetrics::bump(&self.metrics.successes);
        } else {
            CircuitBreakerMetrics::bump(&self.metrics.failures);
        }

        let mut state = self.lock();
        if state.generation != admission.generation {
            debug!(breaker = %self.name, success, "Discarding result from a previous circuit period");
            return;
        }

        match state.state {
            CircuitState::Closed => {
                if success {
                    state.failure_count = 0;
                } else {
                    state.failure_count += 1;
                    if state.failure_count >= self.config.failure_threshold {
                        warn!(
                            breaker = %self.name,
                            failures = state.failure_count,
                            "Circuit breaker opening after consecutive failures"
                        );
                        self.transition(&mut state, CircuitState::Open);
                    }
                }
            }
            CircuitState::HalfOpen => {
                state.half_open_requests = state.half_open_requests.saturating_sub(1);
                if success {
                    state.success_count += 1;
                    if state.success_count >= self.config.success_threshold {
                        info!(
                            breaker = %self.name,
                            successes = state.success_count,
                            "Circuit breaker closing after successful trials"
                        );
                        self.transition(&mut state, CircuitState::Closed);
                    }
                } else {
                    warn!(breaker = %self.name, "Circuit breaker re-opening after failed trial");
                    self.transition(&mut state, CircuitState::Open);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Give back a half-open slot for a call that never settled (its future was dropped).
    fn release(&self, admission: Admission) {
        if !admission.trial {
            return;
        }
        let mut state = self.lock();
        if state.generation == admission.generation && state.state == CircuitState::HalfOpen {
            state.half_open_requests = state.half_open_requests.saturating_sub(1);
        }
    }

    fn transition(&self, state: &mut CircuitBreakerState, to: CircuitState) {
        let from = state.state;
        state.state = to;
        state.failure_count = 0;
        state.success_count = 0;
        state.half_open_requests = 0;
        state.last_state_change = Instant::now();
        state.generation = state.generation.wrapping_add(1);

        match to {
            CircuitState::Open => CircuitBreakerMetrics::bump(&self.metrics.opened_count),
            CircuitState::Closed if from != CircuitState::Closed => {
                CircuitBreakerMetrics::bump(&self.metrics.closed_count)
            }
            _ => {}
        }

        if from != to {
            info!(breaker = %self.name, %from, %to, "Circuit breaker state change");
            counter!(
                BREAKER_TRANSITIONS,
                "breaker" => self.name.clone(),
                "to" => to.to_string()
            )
            .increment(1);
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

/// Settles an admitted call exactly once, even if the caller drops the future.
struct InFlight<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    settled: bool,
}

impl InFlight<'_> {
    fn settle(&mut self, success: bool) {
        self.settled = true;
        self.breaker.record(self.admission, success);
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.release(self.admission);
        }
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub half_open_requests: u32,
    pub failures: u64,
    pub successes: u64,
    pub opened_count: u64,
    pub closed_count: u64,
    pub rejected_count: u64,
}
