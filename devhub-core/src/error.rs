use crate::config::ConfigError;
use crate::observability::health::HealthCheckError;
use crate::observability::logging::LoggingError;
use crate::observability::metrics::MetricsError;
use crate::performance::pool::PoolError;
use crate::realtime::client::SessionError;
use crate::realtime::hub::HubError;
use crate::resilience::circuit_breaker::CircuitOpenError;
use crate::resilience::recovery::RecoveredPanic;
use crate::resilience::shutdown::ShutdownError;
use thiserror::Error;

/// Any error raised by the core components.
///
/// Generic wrappers (`CircuitBreakerError<E>`, `RetryError<E>`) stay with the
/// caller, which knows the wrapped type.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Hub(#[from] HubError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Shutdown(#[from] ShutdownError),

    #[error(transparent)]
    HealthCheck(#[from] HealthCheckError),

    #[error(transparent)]
    Panic(#[from] RecoveredPanic),

    #[error(transparent)]
    Logging(#[from] LoggingError),

    #[error(transparent)]
    Metrics(#[from] MetricsError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
