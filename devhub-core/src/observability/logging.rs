//! Structured logging setup.
//!
//! ```rust,no_run
//! use devhub_core::observability::logging::{init_logging, LogConfig};
//!
//! init_logging(&LogConfig::default()).expect("Failed to initialize logging");
//! ```

use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Log format configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format for production (machine-readable)
    Json,
    /// Pretty format for development (human-readable)
    Pretty,
    /// Compact format for minimal output
    Compact,
}

impl Default for LogFormat {
    fn default() -> Self {
        #[cfg(debug_assertions)]
        return Self::Pretty;

        #[cfg(not(debug_assertions))]
        return Self::Json;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub format: LogFormat,
    /// Default log level, used when `RUST_LOG` is unset
    pub level: String,
    /// Explicit filter directives (e.g. "devhub_core=debug,hyper=warn"); wins over `RUST_LOG`
    pub filter: Option<String>,
    pub with_thread_ids: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            level: "info".to_string(),
            filter: None,
            with_thread_ids: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),

    #[error("failed to install subscriber: {0}")]
    Init(#[from] tracing_subscriber::util::TryInitError),
}

/// Build the filter: explicit directives, then `RUST_LOG`, then the default level.
pub fn build_filter(config: &LogConfig) -> Result<EnvFilter, LoggingError> {
    match config.filter {
        Some(ref filter) => Ok(EnvFilter::try_new(filter)?),
        None => Ok(EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&config.level))?),
    }
}

/// Install the global tracing subscriber.
pub fn init_logging(config: &LogConfig) -> Result<(), LoggingError> {
    let env_filter = build_filter(config)?;

    match config.format {
        LogFormat::Json => {
            let json_layer = fmt::layer()
                .json()
                .with_span_events(FmtSpan::CLOSE)
                .with_current_span(true)
                .with_thread_ids(config.with_thread_ids)
                .with_filter(env_filter);

            tracing_subscriber::registry().with(json_layer).try_init()?;
        }
        LogFormat::Pretty => {
            let pretty_layer = fmt::layer()
                .pretty()
                .with_thread_ids(config.with_thread_ids)
                .with_filter(env_filter);

            tracing_subscriber::registry().with(pretty_layer).try_init()?;
        }
        LogFormat::Compact => {
            let compact_layer = fmt::layer()
                .compact()
                .with_thread_ids(config.with_thread_ids)
                .with_filter(env_filter);

            tracing_subscriber::registry().with(compact_layer).try_init()?;
        }
    }

    info!(format = ?config.format, "Logging initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_serde() {
        let format: LogFormat = serde_json::from_str(r#""compact""#).unwrap();
        assert_eq!(format, LogFormat::Compact);
        assert_eq!(serde_json::to_string(&LogFormat::Json).unwrap(), r#""json""#);
    }

    #[test]
    fn test_explicit_filter_is_used() {
        let config = LogConfig {
            filter: Some("devhub_core=debug".to_string()),
            ..Default::default()
        };
        let filter = build_filter(&config).unwrap();
        assert!(filter.to_string().contains("devhub_core=debug"));
    }

    #[test]
    fn test_invalid_filter_is_rejected() {
        let config = LogConfig {
            filter: Some("devhub_core=notalevel".to_string()),
            ..Default::default()
        };
        assert!(matches!(build_filter(&config), Err(LoggingError::Filter(_))));
    }
}
