//! Pooled outbound HTTP transport with usage statistics.
//!
//! Each [`ConnectionPool`] wraps one `reqwest::Client` tuned for a single
//! logical dependency and records request counts, failures and latency.
//! [`PoolRegistry`] hands out one pool per name.
//!
//! # Examples
//!
//! ```no_run
//! use devhub_core::performance::pool::{PoolConfig, PoolRegistry};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = PoolRegistry::new();
//! let pool = registry.get_or_create("openai", PoolConfig::ai_backend())?;
//!
//! let request = pool.request(reqwest::Method::GET, "https://api.openai.com/v1/models").build()?;
//! let response = pool.execute(request).await?;
//! println!("{} after {:?}", response.status(), pool.stats().average_latency);
//! # Ok(())
//! # }
//! ```

use crate::config::ConfigError;
use crate::observability::metrics::{POOL_FAILURES, POOL_REQUESTS, POOL_REQUEST_DURATION};
use crate::resilience::shutdown::{GracefulShutdown, ShutdownError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use metrics::{counter, histogram};
use reqwest::{Client, Method, Request, RequestBuilder, Response, Url};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Name of the pool returned by [`PoolRegistry::default_pool`].
pub const DEFAULT_POOL: &str = "default";
pub const AI_BACKEND_POOL: &str = "ai_backend";
pub const TEST_FRAMEWORK_POOL: &str = "test_framework";

/// Errors that can occur during pool operations.
#[derive(Error, Debug)]
pub enum PoolError {
    /// Transport failure, passed through unchanged
    #[error(transparent)]
    Transport(#[from] reqwest::Error),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("request cancelled")]
    Cancelled,

    #[error("connection pool '{0}' is closed")]
    Closed(String),

    #[error(transparent)]
    InvalidConfig(#[from] ConfigError),
}

/// Configuration for a connection pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Idle connections kept across all hosts
    pub max_idle_conns: usize,

    /// Idle connections kept per host
    pub max_idle_conns_per_host: usize,

    /// Concurrent in-flight requests per host; 0 means unlimited
    pub max_conns_per_host: usize,

    /// How long an idle connection stays in the pool
    #[serde(rename = "idle_conn_timeout_ms", with = "crate::config::duration_ms")]
    pub idle_conn_timeout: Duration,

    /// Bound on establishing a connection, TLS included
    #[serde(rename = "tls_handshake_timeout_ms", with = "crate::config::duration_ms")]
    pub tls_handshake_timeout: Duration,

    /// Default bound on waiting for response headers
    #[serde(rename = "response_header_timeout_ms", with = "crate::config::duration_ms")]
    pub response_header_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_conns: 100,
            max_idle_conns_per_host: 10,
            max_conns_per_host: 100,
            idle_conn_timeout: Duration::from_secs(90),
            tls_handshake_timeout: Duration::from_secs(10),
            response_header_timeout: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    /// Tuned for slow, long-running AI completion calls.
    pub fn ai_backend() -> Self {
        Self {
            max_idle_conns: 50,
            max_idle_conns_per_host: 20,
            max_conns_per_host: 50,
            idle_conn_timeout: Duration::from_secs(120),
            tls_handshake_timeout: Duration::from_secs(15),
            response_header_timeout: Duration::from_secs(120),
        }
    }

    /// Tuned for many short calls to the test runner.
    pub fn test_framework() -> Self {
        Self {
            max_idle_conns: 30,
            max_idle_conns_per_host: 10,
            max_conns_per_host: 30,
            idle_conn_timeout: Duration::from_secs(60),
            tls_handshake_timeout: Duration::from_secs(10),
            response_header_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_max_idle_conns(mut self, max: usize) -> Self {
        self.max_idle_conns = max;
        self
    }

    pub fn with_max_idle_conns_per_host(mut self, max: usize) -> Self {
        self.max_idle_conns_per_host = max;
        self
    }

    pub fn with_max_conns_per_host(mut self, max: usize) -> Self {
        self.max_conns_per_host = max;
        self
    }

    pub fn with_idle_conn_timeout(mut self, timeout: Duration) -> Self {
        self.idle_conn_timeout = timeout;
        self
    }

    pub fn with_tls_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.tls_handshake_timeout = timeout;
        self
    }

    pub fn with_response_header_timeout(mut self, timeout: Duration) -> Self {
        self.response_header_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_idle_conns_per_host > self.max_idle_conns {
            return Err(ConfigError::new(
                "pool.max_idle_conns_per_host",
                "cannot exceed max_idle_conns",
            ));
        }
        if self.response_header_timeout.is_zero() {
            return Err(ConfigError::new(
                "pool.response_header_timeout_ms",
                "must be greater than zero",
            ));
        }
        if self.tls_handshake_timeout.is_zero() {
            return Err(ConfigError::new(
                "pool.tls_handshake_timeout_ms",
                "must be greater than zero",
            ));
        }
        Ok(())
    }

    fn build_client(&self) -> Result<Client, PoolError> {
        // reqwest only bounds idle connections per host
        let idle_per_host = self.max_idle_conns_per_host.min(self.max_idle_conns);
        Ok(Client::builder()
            .pool_max_idle_per_host(idle_per_host)
            .pool_idle_timeout(self.idle_conn_timeout)
            .connect_timeout(self.tls_handshake_timeout)
            .build()?)
    }
}

/// Snapshot of pool usage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub name: String,
    pub total_requests: u64,
    pub failed_requests: u64,
    #[serde(rename = "total_latency_ms", with = "crate::config::duration_ms")]
    pub total_latency: Duration,
    #[serde(rename = "average_latency_ms", with = "crate::config::duration_ms")]
    pub average_latency: Duration,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct StatsInner {
    total_requests: u64,
    failed_requests: u64,
    total_latency: Duration,
    created_at: DateTime<Utc>,
    last_used_at: Option<DateTime<Utc>>,
}

/// Reusable outbound transport for one named dependency.
pub struct ConnectionPool {
    name: String,
    config: PoolConfig,
    client: RwLock<Client>,
    host_limits: DashMap<String, Arc<Semaphore>>,
    stats: Mutex<StatsInner>,
    closed: AtomicBool,
}

impl ConnectionPool {
    pub fn new(name: impl Into<String>, config: PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;
        let name = name.into();
        let client = config.build_client()?;
        info!(pool = %name, ?config, "Creating connection pool");

        Ok(Self {
            name,
            config,
            client: RwLock::new(client),
            host_limits: DashMap::new(),
            stats: Mutex::new(StatsInner {
                total_requests: 0,
                failed_requests: 0,
                total_latency: Duration::ZERO,
                created_at: Utc::now(),
                last_used_at: None,
            }),
            closed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Start building a request on this pool's client.
    pub fn request(&self, method: Method, url: impl reqwest::IntoUrl) -> RequestBuilder {
        self.client().request(method, url)
    }

    /// Send `request`, bounded by the configured response header timeout.
    pub async fn execute(&self, request: Request) -> Result<Response, PoolError> {
        self.send(request, self.config.response_header_timeout, None).await
    }

    /// Send `request`, abandoning it when `cancel` fires.
    pub async fn execute_with_cancel(
        &self,
        cancel: &CancellationToken,
        request: Request,
    ) -> Result<Response, PoolError> {
        self.send(request, self.config.response_header_timeout, Some(cancel))
            .await
    }

    /// Send `request` with an explicit timeout instead of the configured one.
    pub async fn execute_with_timeout(
        &self,
        request: Request,
        timeout: Duration,
    ) -> Result<Response, PoolError> {
        self.send(request, timeout, None).await
    }

    async fn send(
        &self,
        request: Request,
        timeout: Duration,
        cancel: Option<&CancellationToken>,
    ) -> Result<Response, PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed(self.name.clone()));
        }

        self.lock_stats().total_requests += 1;
        counter!(POOL_REQUESTS, "pool" => self.name.clone()).increment(1);

        let started = Instant::now();
        let client = self.client();
        let host_limit = self.host_limit(request.url());
        debug!(
            pool = %self.name,
            method = %request.method(),
            url = %request.url(),
            "Sending pooled request"
        );

        let pool_name = self.name.clone();
        let attempt = async move {
            // Waiters see the semaphore close when the pool shuts down
            let _permit: Option<OwnedSemaphorePermit> = match host_limit {
                Some(semaphore) => Some(
                    semaphore
                        .acquire_owned()
                        .await
                        .map_err(|_| PoolError::Closed(pool_name))?,
                ),
                None => None,
            };
            client.execute(request).await.map_err(PoolError::from)
        };
        let bounded = async {
            match tokio::time::timeout(timeout, attempt).await {
                Ok(result) => result,
                Err(_) => Err(PoolError::Timeout(timeout)),
            }
        };

        let result = match cancel {
            Some(token) => tokio::select! {
                _ = token.cancelled() => Err(PoolError::Cancelled),
                result = bounded => result,
            },
            None => bounded.await,
        };

        self.finish(started.elapsed(), result.is_err());
        if let Err(ref e) = result {
            warn!(pool = %self.name, error = %e, "Pooled request failed");
        }
        result
    }

    fn finish(&self, elapsed: Duration, failed: bool) {
        {
            let mut stats = self.lock_stats();
            stats.total_latency += elapsed;
            stats.last_used_at = Some(Utc::now());
            if failed {
                stats.failed_requests += 1;
            }
        }

        histogram!(POOL_REQUEST_DURATION, "pool" => self.name.clone())
            .record(elapsed.as_secs_f64());
        if failed {
            counter!(POOL_FAILURES, "pool" => self.name.clone()).increment(1);
        }
    }

    /// Per-host concurrency limiter, created on first use.
    fn host_limit(&self, url: &Url) -> Option<Arc<Semaphore>> {
        if self.config.max_conns_per_host == 0 {
            return None;
        }
        let key = format!(
            "{}:{}",
            url.host_str().unwrap_or_default(),
            url.port_or_known_default().unwrap_or_default()
        );
        let limit = self
            .host_limits
            .entry(key)
            .or_insert_with(|| Arc::new(Semaphore::new(self.config.max_conns_per_host)));
        Some(Arc::clone(limit.value()))
    }

    /// Drop idle connections by swapping in a fresh client.
    ///
    /// In-flight requests keep the old client until they complete.
    pub fn close_idle_connections(&self) -> Result<(), PoolError> {
        let fresh = self.config.build_client()?;
        *self.client.write().unwrap_or_else(PoisonError::into_inner) = fresh;
        debug!(pool = %self.name, "Closed idle connections");
        Ok(())
    }

    /// Reject new requests and release idle connections.
    pub fn close(&self) -> Result<(), PoolError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        for semaphore in self.host_limits.iter() {
            semaphore.value().close();
        }
        self.close_idle_connections()?;
        info!(pool = %self.name, "Connection pool closed");
        Ok(())
    }

    pub fn stats(&self) -> PoolStats {
        let stats = self.lock_stats();
        let average_latency = if stats.total_requests == 0 {
            Duration::ZERO
        } else {
            let divisor = u32::try_from(stats.total_requests).unwrap_or(u32::MAX);
            stats.total_latency / divisor
        };

        PoolStats {
            name: self.name.clone(),
            total_requests: stats.total_requests,
            failed_requests: stats.failed_requests,
            total_latency: stats.total_latency,
            average_latency,
            created_at: stats.created_at,
            last_used_at: stats.last_used_at,
        }
    }

    fn client(&self) -> Client {
        self.client
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn lock_stats(&self) -> MutexGuard<'_, StatsInner> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Named registry holding one pool per dependency.
pub struct PoolRegistry {
    pools: DashMap<String, Arc<ConnectionPool>>,
    default_config: PoolConfig,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::with_default_config(PoolConfig::default())
    }

    /// Registry whose `default` pool uses `config`.
    pub fn with_default_config(config: PoolConfig) -> Self {
        Self {
            pools: DashMap::new(),
            default_config: config,
        }
    }

    /// Existing pool for `name`, or a new one built from `config`.
    ///
    /// `config` is ignored when the pool already exists.
    pub fn get_or_create(
        &self,
        name: &str,
        config: PoolConfig,
    ) -> Result<Arc<ConnectionPool>, PoolError> {
        if let Some(pool) = self.pools.get(name) {
            return Ok(Arc::clone(pool.value()));
        }

        match self.pools.entry(name.to_string()) {
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let pool = Arc::new(ConnectionPool::new(name, config)?);
                entry.insert(Arc::clone(&pool));
                Ok(pool)
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<ConnectionPool>> {
        self.pools.get(name).map(|p| Arc::clone(p.value()))
    }

    pub fn default_pool(&self) -> Result<Arc<ConnectionPool>, PoolError> {
        self.get_or_create(DEFAULT_POOL, self.default_config.clone())
    }

    pub fn ai_backend(&self) -> Result<Arc<ConnectionPool>, PoolError> {
        self.get_or_create(AI_BACKEND_POOL, PoolConfig::ai_backend())
    }

    pub fn test_framework(&self) -> Result<Arc<ConnectionPool>, PoolError> {
        self.get_or_create(TEST_FRAMEWORK_POOL, PoolConfig::test_framework())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pools.iter().map(|p| p.key().clone()).collect();
        names.sort();
        names
    }

    /// Stats for every pool, ordered by name.
    pub fn all_stats(&self) -> Vec<PoolStats> {
        let mut stats: Vec<PoolStats> = self.pools.iter().map(|p| p.value().stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Close every pool and empty the registry.
    pub fn close_all(&self) -> Result<(), PoolError> {
        let names = self.names();
        let mut first_error = None;
        for name in names {
            if let Some((_, pool)) = self.pools.remove(&name) {
                if let Err(e) = pool.close() {
                    warn!(pool = %name, error = %e, "Failed to close pool");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

impl Default for PoolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GracefulShutdown for PoolRegistry {
    async fn shutdown(&self) -> Result<(), ShutdownError> {
        self.close_all()
            .map_err(|e| ShutdownError::ComponentFailed {
                component: "connection_pools".to_string(),
                reason: e.to_string(),
            })
    }

    fn name(&self) -> &str {
        "connection_pools"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_pool_config_presets() {
        let ai = PoolConfig::ai_backend();
        assert_eq!(ai.response_header_timeout, Duration::from_secs(120));
        assert!(ai.validate().is_ok());
        assert!(PoolConfig::test_framework().validate().is_ok());
        assert!(PoolConfig::default().validate().is_ok());
    }

    #[test]
    fn test_pool_config_validation() {
        let config = PoolConfig::default()
            .with_max_idle_conns(5)
            .with_max_idle_conns_per_host(10);
        let err = config.validate().unwrap_err();
        assert_eq!(err.field, "pool.max_idle_conns_per_host");

        let config = PoolConfig::default().with_response_header_timeout(Duration::ZERO);
        assert!(matches!(
            ConnectionPool::new("bad", config),
            Err(PoolError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_pool_config_serde_uses_millis() {
        let json = serde_json::to_value(PoolConfig::default()).unwrap();
        assert_eq!(json["idle_conn_timeout_ms"], 90_000);
        let back: PoolConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, PoolConfig::default());
    }

    #[tokio::test]
    async fn test_successful_requests_update_stats() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let pool = ConnectionPool::new("backend", PoolConfig::default()).unwrap();
        for _ in 0..3 {
            let request = pool
                .request(Method::GET, format!("{}/health", server.uri()))
                .build()
                .unwrap();
            let response = pool.execute(request).await.unwrap();
            assert_eq!(response.status(), 200);
        }

        let stats = pool.stats();
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.failed_requests, 0);
        assert!(stats.last_used_at.is_some());
        assert_eq!(stats.average_latency, stats.total_latency / 3);
    }

    #[tokio::test]
    async fn test_explicit_timeout_counts_as_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let pool = ConnectionPool::new("slow", PoolConfig::default()).unwrap();
        let request = pool.request(Method::GET, server.uri()).build().unwrap();
        let err = pool
            .execute_with_timeout(request, Duration::from_millis(50))
            .await
            .unwrap_err();

        assert!(matches!(err, PoolError::Timeout(d) if d == Duration::from_millis(50)));
        let stats = pool.stats();
        assert_eq!(stats.total_requests, 1);
        assert_eq!(stats.failed_requests, 1);
    }

    #[tokio::test]
    async fn test_cancelled_request_counts_as_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let pool = ConnectionPool::new("cancel", PoolConfig::default()).unwrap();
        let cancel = CancellationToken::new();
        let request = pool.request(Method::GET, server.uri()).build().unwrap();

        let canceller = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                cancel.cancel();
            })
        };
        let err = pool.execute_with_cancel(&cancel, request).await.unwrap_err();
        canceller.await.unwrap();

        assert!(matches!(err, PoolError::Cancelled));
        assert_eq!(pool.stats().failed_requests, 1);
    }

    #[tokio::test]
    async fn test_closed_pool_rejects_requests() {
        let pool = ConnectionPool::new("closing", PoolConfig::default()).unwrap();
        pool.close().unwrap();
        assert!(pool.is_closed());

        let request = pool
            .request(Method::GET, "http://127.0.0.1:1/")
            .build()
            .unwrap();
        let err = pool.execute(request).await.unwrap_err();
        assert!(matches!(err, PoolError::Closed(ref name) if name == "closing"));
        assert_eq!(pool.stats().total_requests, 0);
    }

    #[tokio::test]
    async fn test_close_fails_requests_waiting_for_host_permit() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(300)))
            .mount(&server)
            .await;

        let pool = Arc::new(
            ConnectionPool::new("limited", PoolConfig::default().with_max_conns_per_host(1))
                .unwrap(),
        );
        let send = |pool: Arc<ConnectionPool>, url: String| {
            tokio::spawn(async move {
                let request = pool.request(Method::GET, url).build().unwrap();
                pool.execute(request).await
            })
        };

        let holder = send(Arc::clone(&pool), server.uri());
        tokio::time::sleep(Duration::from_millis(50)).await;
        let waiter = send(Arc::clone(&pool), server.uri());
        tokio::time::sleep(Duration::from_millis(50)).await;

        pool.close().unwrap();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, PoolError::Closed(ref name) if name == "limited"));
        assert_eq!(holder.await.unwrap().unwrap().status(), 200);
        assert_eq!(pool.stats().failed_requests, 1);
    }

    #[tokio::test]
    async fn test_registry_returns_same_pool_per_name() {
        let registry = PoolRegistry::new();
        let a = registry.get_or_create("openai", PoolConfig::ai_backend()).unwrap();
        let b = registry.get_or_create("openai", PoolConfig::default()).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.config(), &PoolConfig::ai_backend());

        let default = registry.default_pool().unwrap();
        assert_eq!(default.name(), DEFAULT_POOL);
        registry.ai_backend().unwrap();
        registry.test_framework().unwrap();

        let names: Vec<String> = registry.all_stats().into_iter().map(|s| s.name).collect();
        assert_eq!(names, vec!["ai_backend", "default", "openai", "test_framework"]);
    }

    #[tokio::test]
    async fn test_close_all_empties_registry() {
        let registry = PoolRegistry::new();
        let pool = registry.default_pool().unwrap();
        registry.ai_backend().unwrap();

        GracefulShutdown::shutdown(&registry).await.unwrap();

        assert!(pool.is_closed());
        assert!(registry.names().is_empty());
        assert!(registry.get(DEFAULT_POOL).is_none());
    }
}
