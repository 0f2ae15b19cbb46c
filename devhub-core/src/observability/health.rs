//! Health check registry.
//!
//! Probes are registered by name and run concurrently. Each probe is bounded
//! by a timeout and guarded against panics, so one bad probe only fails its
//! own slot.

use crate::resilience::recovery::panic_message;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

/// Health status of a component or the overall system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Component is fully operational
    Healthy,
    /// A non-critical component is failing
    Degraded,
    /// A critical component is failing
    Unhealthy,
}

impl HealthStatus {
    /// Returns true if the status is healthy or degraded
    pub fn is_available(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Degraded)
    }

    /// Combines two health statuses, returning the worst status
    pub fn combine(&self, other: &HealthStatus) -> HealthStatus {
        match (self, other) {
            (HealthStatus::Unhealthy, _) | (_, HealthStatus::Unhealthy) => HealthStatus::Unhealthy,
            (HealthStatus::Degraded, _) | (_, HealthStatus::Degraded) => HealthStatus::Degraded,
            _ => HealthStatus::Healthy,
        }
    }
}

/// Why a probe failed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HealthCheckError {
    #[error("{0}")]
    Failed(String),

    #[error("health check timed out after {0:?}")]
    TimedOut(Duration),

    #[error("health check panicked: {0}")]
    Panicked(String),
}

impl HealthCheckError {
    pub fn failed(message: impl Into<String>) -> Self {
        HealthCheckError::Failed(message.into())
    }
}

/// Configuration for health checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Timeout for individual health checks
    #[serde(rename = "check_timeout_ms", with = "crate::config::duration_ms")]
    pub check_timeout: Duration,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            check_timeout: Duration::from_secs(5),
        }
    }
}

impl HealthCheckConfig {
    /// Sets the timeout for each health check
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.check_timeout = timeout;
        self
    }
}

/// Trait for implementing custom health checks.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// Probe the component; `Ok` means healthy.
    async fn check(&self) -> Result<(), HealthCheckError>;
}

/// Adapter turning an async closure into a [`HealthCheck`].
pub struct FnHealthCheck<F> {
    probe: F,
}

impl<F> FnHealthCheck<F> {
    pub fn new(probe: F) -> Self {
        Self { probe }
    }
}

#[async_trait]
impl<F, Fut> HealthCheck for FnHealthCheck<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HealthCheckError>> + Send,
{
    async fn check(&self) -> Result<(), HealthCheckError> {
        (self.probe)().await
    }
}

/// Health information for a single component.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    /// Name of the component
    pub name: String,
    /// Current health status
    pub status: HealthStatus,
    /// Failure description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Time taken to perform the health check (in milliseconds)
    pub latency_ms: u64,
    pub critical: bool,
    pub last_check: DateTime<Utc>,
}

/// Overall health including all components.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    /// Aggregated health status
    pub status: HealthStatus,
    pub components: BTreeMap<String, ComponentHealth>,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub uptime_seconds: u64,
}

struct RegisteredCheck {
    check: Arc<dyn HealthCheck>,
    critical: bool,
}

/// Health check registry that manages named probes.
pub struct HealthCheckRegistry {
    config: HealthCheckConfig,
    checks: RwLock<BTreeMap<String, RegisteredCheck>>,
    start_time: Instant,
    version: Option<String>,
}

impl HealthCheckRegistry {
    pub fn new(config: HealthCheckConfig) -> Self {
        Self {
            config,
            checks: RwLock::new(BTreeMap::new()),
            start_time: Instant::now(),
            version: None,
        }
    }

    /// Sets the version reported in [`HealthReport`]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Register a critical probe, replacing any probe with the same name.
    pub fn register(&self, name: impl Into<String>, check: Arc<dyn HealthCheck>) {
        self.insert(name.into(), check, true);
    }

    /// Register a probe whose failure only degrades overall health.
    pub fn register_non_critical(&self, name: impl Into<String>, check: Arc<dyn HealthCheck>) {
        self.insert(name.into(), check, false);
    }

    /// Register an async closure as a critical probe.
    pub fn register_fn<F, Fut>(&self, name: impl Into<String>, probe: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HealthCheckError>> + Send + 'static,
    {
        self.register(name, Arc::new(FnHealthCheck::new(probe)));
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.checks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
            .is_some()
    }

    pub fn names(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    /// Run every probe concurrently and return `name -> result`.
    pub async fn perform_health_checks(&self) -> HashMap<String, Result<(), HealthCheckError>> {
        self.run_all()
            .await
            .into_iter()
            .map(|(name, _, _, result)| (name, result))
            .collect()
    }

    /// Run every probe and fold the results into a [`HealthReport`].
    pub async fn report(&self) -> HealthReport {
        let now = Utc::now();
        let components: BTreeMap<String, ComponentHealth> = self
            .run_all()
            .await
            .into_iter()
            .map(|(name, critical, latency, result)| {
                let (status, message) = match result {
                    Ok(()) => (HealthStatus::Healthy, None),
                    Err(e) if critical => (HealthStatus::Unhealthy, Some(e.to_string())),
                    Err(e) => (HealthStatus::Degraded, Some(e.to_string())),
                };
                let health = ComponentHealth {
                    name: name.clone(),
                    status,
                    message,
                    latency_ms: u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
                    critical,
                    last_check: now,
                };
                (name, health)
            })
            .collect();

        let status = components
            .values()
            .fold(HealthStatus::Healthy, |acc, c| acc.combine(&c.status));

        HealthReport {
            status,
            components,
            timestamp: now,
            version: self.version.clone(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    async fn run_all(&self) -> Vec<(String, bool, Duration, Result<(), HealthCheckError>)> {
        let snapshot: Vec<(String, Arc<dyn HealthCheck>, bool)> = self
            .read()
            .iter()
            .map(|(name, entry)| (name.clone(), Arc::clone(&entry.check), entry.critical))
            .collect();

        let check_timeout = self.config.check_timeout;
        let probes = snapshot.into_iter().map(|(name, check, critical)| async move {
            let started = Instant::now();
            let guarded = AssertUnwindSafe(async { check.check().await }).catch_unwind();

            let result = match tokio::time::timeout(check_timeout, guarded).await {
                Ok(Ok(result)) => result,
                Ok(Err(payload)) => {
                    let message = panic_message(payload.as_ref());
                    error!(check = %name, panic = %message, "Health check panicked");
                    Err(HealthCheckError::Panicked(message))
                }
                Err(_) => Err(HealthCheckError::TimedOut(check_timeout)),
            };

            match &result {
                Ok(()) => debug!(check = %name, "Health check passed"),
                Err(e) => warn!(check = %name, error = %e, "Health check failed"),
            }
            (name, critical, started.elapsed(), result)
        });

        join_all(probes).await
    }

    fn insert(&self, name: String, check: Arc<dyn HealthCheck>, critical: bool) {
        self.checks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name, RegisteredCheck { check, critical });
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, RegisteredCheck>> {
        self.checks.read().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for HealthCheckRegistry {
    fn default() -> Self {
        Self::new(HealthCheckConfig::default())
    }
}
