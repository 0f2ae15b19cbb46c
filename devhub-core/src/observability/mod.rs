//! Logging, metrics and health checks.

pub mod health;
pub mod logging;
pub mod metrics;

pub use health::{
    ComponentHealth, FnHealthCheck, HealthCheck, HealthCheckConfig, HealthCheckError,
    HealthCheckRegistry, HealthReport, HealthStatus,
};
pub use logging::{init_logging, LogConfig, LogFormat, LoggingError};
pub use metrics::{init_metrics, MetricsError};
