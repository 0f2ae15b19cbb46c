//! Outbound HTTP connection pooling.
//!
//! Named pools share tuned `reqwest` clients so services reuse keep-alive
//! connections instead of opening one per call.
//!
//! ```no_run
//! use devhub_core::performance::PoolRegistry;
//! use reqwest::Method;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pools = PoolRegistry::new();
//! let pool = pools.ai_backend()?;
//!
//! let request = pool.request(Method::GET, "http://localhost:8000/health").build()?;
//! let response = pool.execute(request).await?;
//! println!("{}", response.status());
//! # Ok(())
//! # }
//! ```

pub mod pool;

pub use pool::{
    ConnectionPool, PoolConfig, PoolError, PoolRegistry, PoolStats, AI_BACKEND_POOL,
    DEFAULT_POOL, TEST_FRAMEWORK_POOL,
};
