//! Application context shared by every route.

use crate::config::AppConfig;
use anyhow::Result;
use devhub_core::observability::HealthCheckError;
use devhub_core::performance::{PoolRegistry, AI_BACKEND_POOL, DEFAULT_POOL, TEST_FRAMEWORK_POOL};
use devhub_core::realtime::EventHub;
use devhub_core::resilience::{GracefulShutdown, ResilienceCoordinator};
use metrics_exporter_prometheus::PrometheusHandle;
use once_cell::sync::OnceCell;
use std::sync::Arc;
use tracing::info;

static CONTEXT: OnceCell<Arc<AppContext>> = OnceCell::new();

pub struct AppContext {
    pub config: AppConfig,
    pub hub: EventHub,
    pub pools: Arc<PoolRegistry>,
    pub resilience: ResilienceCoordinator,
    pub metrics: Option<PrometheusHandle>,
}

impl AppContext {
    /// Build every component and wire shutdown steps and health probes.
    ///
    /// Must run inside a tokio runtime: the event hub loop is spawned here.
    pub fn build(config: AppConfig, metrics: Option<PrometheusHandle>) -> Result<Arc<Self>> {
        let pools = Arc::new(PoolRegistry::with_default_config(config.pools.default.clone()));
        pools.get_or_create(DEFAULT_POOL, config.pools.default.clone())?;
        pools.get_or_create(AI_BACKEND_POOL, config.pools.ai_backend.clone())?;
        pools.get_or_create(TEST_FRAMEWORK_POOL, config.pools.test_framework.clone())?;

        let hub = EventHub::spawn(config.hub.clone());
        let resilience = ResilienceCoordinator::new(config.resilience.clone());

        // Steps run last-registered-first: the hub closes before the pools.
        let shutdown = resilience.shutdown_coordinator();
        shutdown.register_component(Arc::clone(&pools) as Arc<dyn GracefulShutdown>);
        shutdown.register_component(Arc::new(hub.clone()));

        let probe_hub = hub.clone();
        resilience.health().register_fn("event_hub", move || {
            let hub = probe_hub.clone();
            async move {
                if hub.is_running() {
                    Ok(())
                } else {
                    Err(HealthCheckError::failed("event hub loop is not running"))
                }
            }
        });
        let probe_pools = Arc::clone(&pools);
        resilience.health().register_fn("default_pool", move || {
            let pool = probe_pools.get(DEFAULT_POOL);
            async move {
                match pool {
                    Some(pool) if !pool.is_closed() => Ok(()),
                    _ => Err(HealthCheckError::failed("default pool is closed")),
                }
            }
        });

        info!(pools = ?pools.names(), "Application context ready");
        Ok(Arc::new(Self {
            config,
            hub,
            pools,
            resilience,
            metrics,
        }))
    }

    /// Build the process-wide context on first call and return it.
    ///
    /// Later calls return the existing context and ignore their arguments.
    pub fn init(
        config: AppConfig,
        metrics: Option<PrometheusHandle>,
    ) -> Result<&'static Arc<AppContext>> {
        CONTEXT.get_or_try_init(|| Self::build(config, metrics))
    }
}
