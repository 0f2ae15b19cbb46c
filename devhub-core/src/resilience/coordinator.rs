//! Composition root for the resilience primitives.
//!
//! [`ResilienceCoordinator`] owns the named circuit breakers, panic recovery,
//! the shutdown sequence and the health-check registry so callers pass one
//! value around instead of four.

use crate::config::ConfigError;
use crate::observability::health::{HealthCheckConfig, HealthCheckRegistry};
use crate::resilience::circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState,
};
use crate::resilience::recovery::{PanicRecovery, RecoveryConfig, RecoveryStats};
use crate::resilience::shutdown::{ShutdownCoordinator, ShutdownError};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Named circuit breakers shared across callers.
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    default_config: CircuitBreakerConfig,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::with_default_config(CircuitBreakerConfig::default())
    }

    /// Registry whose [`get_or_default`](Self::get_or_default) uses `config`.
    pub fn with_default_config(config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            default_config: config,
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Return the breaker called `name`, creating it with `config` if absent.
    ///
    /// An existing breaker keeps the configuration it was created with.
    pub fn get_or_create(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let entry = self.breakers.entry(name.to_string()).or_insert_with(|| {
            info!(breaker = name, "Creating circuit breaker");
            Arc::new(CircuitBreaker::new(name, config))
        });
        Arc::clone(entry.value())
    }

    pub fn get_or_default(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_or_create(name, self.default_config.clone())
    }

    /// Breaker names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.breakers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Stats of every breaker, sorted by name.
    pub fn all_stats(&self) -> Vec<CircuitBreakerStats> {
        let mut stats: Vec<CircuitBreakerStats> =
            self.breakers.iter().map(|e| e.value().stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Names of breakers that are not closed.
    pub fn open_breakers(&self) -> Vec<String> {
        let mut open: Vec<String> = self
            .breakers
            .iter()
            .filter(|e| e.value().state() != CircuitState::Closed)
            .map(|e| e.key().clone())
            .collect();
        open.sort();
        open
    }

    pub fn reset_all(&self) {
        for entry in self.breakers.iter() {
            entry.value().reset();
        }
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerRegistry")
            .field("breakers", &self.names())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Defaults for breakers created through `get_or_default`
    pub circuit_breaker: CircuitBreakerConfig,
    pub recovery: RecoveryConfig,
    pub health: HealthCheckConfig,
    /// Deadline for the whole shutdown sequence
    #[serde(rename = "shutdown_timeout_ms", with = "crate::config::duration_ms")]
    pub shutdown_timeout: Duration,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            circuit_breaker: CircuitBreakerConfig::default(),
            recovery: RecoveryConfig::default(),
            health: HealthCheckConfig::default(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl ResilienceConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.circuit_breaker.validate()?;
        self.recovery.validate()?;
        if self.shutdown_timeout.is_zero() {
            return Err(ConfigError::new(
                "resilience.shutdown_timeout",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

/// Point-in-time view of every resilience component.
#[derive(Debug, Clone, Serialize)]
pub struct ResilienceStats {
    pub breakers: Vec<CircuitBreakerStats>,
    pub recovery: RecoveryStats,
    pub shutdown_steps: Vec<String>,
    pub shutting_down: bool,
    pub health_checks: Vec<String>,
}

pub struct ResilienceCoordinator {
    breakers: CircuitBreakerRegistry,
    recovery: Arc<PanicRecovery>,
    shutdown: ShutdownCoordinator,
    health: HealthCheckRegistry,
}

impl ResilienceCoordinator {
    pub fn new(config: ResilienceConfig) -> Self {
        Self {
            breakers: CircuitBreakerRegistry::with_default_config(config.circuit_breaker),
            recovery: Arc::new(PanicRecovery::new(config.recovery)),
            shutdown: ShutdownCoordinator::new(config.shutdown_timeout),
            health: HealthCheckRegistry::new(config.health)
                .with_version(env!("CARGO_PKG_VERSION")),
        }
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    /// Shorthand for `breakers().get_or_create(name, config)`.
    pub fn circuit_breaker(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        self.breakers.get_or_create(name, config)
    }

    pub fn recovery(&self) -> &Arc<PanicRecovery> {
        &self.recovery
    }

    pub fn shutdown_coordinator(&self) -> &ShutdownCoordinator {
        &self.shutdown
    }

    pub fn health(&self) -> &HealthCheckRegistry {
        &self.health
    }

    /// Run the shutdown sequence, then the panic cleanup callbacks.
    pub async fn shutdown(&self) -> Result<(), ShutdownError> {
        let result = self.shutdown.shutdown().await;
        let cleanups = self.recovery.run_cleanups();
        info!(cleanups, ok = result.is_ok(), "Resilience coordinator shut down");
        result
    }

    pub fn stats(&self) -> ResilienceStats {
        ResilienceStats {
            breakers: self.breakers.all_stats(),
            recovery: self.recovery.stats(),
            shutdown_steps: self.shutdown.step_names(),
            shutting_down: self.shutdown.is_shutting_down(),
            health_checks: self.health.names(),
        }
    }
}

impl Default for ResilienceCoordinator {
    fn default() -> Self {
        Self::new(ResilienceConfig::default())
    }
}

impl fmt::Debug for ResilienceCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilienceCoordinator")
            .field("breakers", &self.breakers)
            .field("recovery", &self.recovery)
            .field("shutdown", &self.shutdown)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::circuit_breaker::CircuitBreakerError;
    use pretty_assertions::assert_eq;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn tripping_config() -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold: 1,
            ..CircuitBreakerConfig::default()
        }
    }

    async fn fail(breaker: &CircuitBreaker) {
        let result: Result<(), CircuitBreakerError<io::Error>> = breaker
            .call(|| async { Err(io::Error::new(io::ErrorKind::Other, "boom")) })
            .await;
        assert!(result.is_err());
    }

    #[test]
    fn test_get_or_create_returns_same_breaker() {
        let registry = CircuitBreakerRegistry::new();
        let first = registry.get_or_create("ai", tripping_config());
        let second = registry.get_or_create("ai", CircuitBreakerConfig::default());

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.config().failure_threshold, 1);
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_names_are_sorted() {
        let registry = CircuitBreakerRegistry::new();
        registry.get_or_default("sync");
        registry.get_or_default("ai");
        registry.get_or_default("logs");

        assert_eq!(registry.names(), vec!["ai", "logs", "sync"]);
        let stats: Vec<String> = registry.all_stats().into_iter().map(|s| s.name).collect();
        assert_eq!(stats, vec!["ai", "logs", "sync"]);
    }

    #[tokio::test]
    async fn test_reset_all_closes_open_breakers() {
        let registry = CircuitBreakerRegistry::new();
        let ai = registry.get_or_create("ai", tripping_config());
        let sync = registry.get_or_create("sync", tripping_config());
        fail(&ai).await;
        fail(&sync).await;

        assert_eq!(registry.open_breakers(), vec!["ai", "sync"]);
        registry.reset_all();
        assert!(registry.open_breakers().is_empty());
        assert_eq!(ai.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_shutdown_runs_steps_then_cleanups() {
        let coordinator = ResilienceCoordinator::default();
        let steps = Arc::new(AtomicUsize::new(0));
        let cleanups = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&steps);
        coordinator.shutdown_coordinator().on_shutdown("flush", move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, io::Error>(())
            }
        });
        let counter = Arc::clone(&cleanups);
        coordinator.recovery().on_cleanup("release", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        coordinator.shutdown().await.unwrap();
        assert_eq!(steps.load(Ordering::SeqCst), 1);
        assert_eq!(cleanups.load(Ordering::SeqCst), 1);
        assert!(coordinator.stats().shutting_down);
    }

    #[tokio::test]
    async fn test_stats_snapshot() {
        let coordinator = ResilienceCoordinator::default();
        let breaker = coordinator.circuit_breaker("ai", tripping_config());
        fail(&breaker).await;
        coordinator.health().register_fn("always", || async { Ok(()) });
        let _ = coordinator
            .recovery()
            .recover_sync("task", || -> u32 { panic!("bad input") });

        let stats = coordinator.stats();
        assert_eq!(stats.breakers.len(), 1);
        assert_eq!(stats.breakers[0].state, CircuitState::Open);
        assert_eq!(stats.recovery.panic_count, 1);
        assert_eq!(stats.health_checks, vec!["always"]);
        assert!(!stats.shutting_down);
    }

    #[test]
    fn test_config_validation() {
        assert!(ResilienceConfig::default().validate().is_ok());
        let config = ResilienceConfig {
            shutdown_timeout: Duration::ZERO,
            ..ResilienceConfig::default()
        };
        assert_eq!(
            config.validate().unwrap_err().field,
            "resilience.shutdown_timeout"
        );
    }
}
