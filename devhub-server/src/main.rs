use anyhow::Result;
use devhub_core::observability::{init_logging, init_metrics};
use devhub_core::resilience::ShutdownSignal;
use devhub_server::{router, AppConfig, AppContext};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    let config = AppConfig::load()?;
    init_logging(&config.log)?;

    tracing::info!("Starting DevHub server");

    let metrics = if config.metrics_enabled {
        Some(init_metrics()?)
    } else {
        None
    };

    let addr = config.socket_addr()?;
    let context = AppContext::init(config, metrics)?;

    let signal = ShutdownSignal::new();
    let app = router(Arc::clone(context));

    tracing::info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown({
            let signal = signal.clone();
            async move { signal.wait().await }
        })
        .await?;

    tracing::info!("HTTP server stopped, shutting down components");
    if let Err(e) = context.resilience.shutdown().await {
        tracing::error!(error = %e, "Shutdown completed with errors");
    }

    Ok(())
}
