//! Resilience and real-time messaging core for the DevHub backend.
//!
//! - [`resilience`]: circuit breakers, retries, panic recovery and shutdown
//! - [`performance`]: pooled outbound HTTP clients
//! - [`realtime`]: event hub and per-client sessions
//! - [`observability`]: logging, metrics and health checks

pub mod config;
pub mod error;
pub mod observability;
pub mod performance;
pub mod realtime;
pub mod resilience;

pub use config::ConfigError;
pub use error::{Error, Result};
