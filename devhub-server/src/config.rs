use anyhow::Result;
use config::{Config as ConfigLoader, Environment, File};
use devhub_core::observability::LogConfig;
use devhub_core::performance::PoolConfig;
use devhub_core::realtime::{ClientConfig, HubConfig};
use devhub_core::resilience::ResilienceConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Server configuration.
///
/// Sources, later ones winning: `config/default`, `config/local`, then
/// `DEVHUB__*` environment variables (e.g. `DEVHUB__HUB__MAILBOX_CAPACITY`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    /// Install the Prometheus recorder and serve `/metrics`
    pub metrics_enabled: bool,
    pub log: LogConfig,
    pub hub: HubConfig,
    pub client: ClientConfig,
    pub pools: PoolsConfig,
    pub resilience: ResilienceConfig,
}

/// Outbound pools created at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolsConfig {
    pub default: PoolConfig,
    pub ai_backend: PoolConfig,
    pub test_framework: PoolConfig,
}

impl Default for PoolsConfig {
    fn default() -> Self {
        Self {
            default: PoolConfig::default(),
            ai_backend: PoolConfig::ai_backend(),
            test_framework: PoolConfig::test_framework(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            metrics_enabled: true,
            log: LogConfig::default(),
            hub: HubConfig::default(),
            client: ClientConfig::default(),
            pools: PoolsConfig::default(),
            resilience: ResilienceConfig::default(),
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        let loader = ConfigLoader::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            .add_source(
                Environment::with_prefix("DEVHUB")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = loader.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.hub.validate()?;
        self.client.validate()?;
        self.pools.default.validate()?;
        self.pools.ai_backend.validate()?;
        self.pools.test_framework.validate()?;
        self.resilience.validate()?;
        Ok(())
    }

    pub fn socket_addr(&self) -> Result<SocketAddr> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }
}
