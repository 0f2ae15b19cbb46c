//! Resilience patterns for outbound calls and background work.
//!
//! - **Circuit Breaker**: fails fast while a dependency is unhealthy
//! - **Retry**: re-runs transient failures with exponential backoff and jitter
//! - **Panic Recovery**: turns panics into errors and detects panic storms
//! - **Graceful Shutdown**: runs registered teardown steps under a deadline
//!
//! # Example
//!
//! ```no_run
//! use devhub_core::resilience::{
//!     CircuitBreaker, CircuitBreakerConfig, RetryConfig, RetryExecutor,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let breaker = CircuitBreaker::new("ai_backend", CircuitBreakerConfig::default());
//! let retry = RetryExecutor::new(RetryConfig::default());
//! let cancel = CancellationToken::new();
//!
//! let answer = retry
//!     .execute(&cancel, || {
//!         breaker.call(|| async { Ok::<_, std::io::Error>(42) })
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod circuit_breaker;
pub mod coordinator;
pub mod recovery;
pub mod retry;
pub mod shutdown;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerStats,
    CircuitOpenError, CircuitState,
};
pub use coordinator::{
    CircuitBreakerRegistry, ResilienceConfig, ResilienceCoordinator, ResilienceStats,
};
pub use recovery::{PanicRecovery, RecoveredPanic, RecoveryConfig, RecoveryStats};
pub use retry::{is_transient, RetryConfig, RetryError, RetryExecutor, RetryPredicate};
pub use shutdown::{GracefulShutdown, ShutdownCoordinator, ShutdownError, ShutdownSignal};
