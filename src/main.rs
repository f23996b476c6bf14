use std::sync::Arc;

use kraken_cache_proxy::{CacheStore, HttpUpstream, ProxyConfig, ProxyPipeline, Server};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ProxyConfig::from_env();
    let upstream = HttpUpstream::new(&config.upstream, config.upstream_timeout)?;
    let cache = Arc::new(CacheStore::with_ttl(config.ttl));
    let pipeline = Arc::new(
        ProxyPipeline::new(cache, Arc::new(upstream)).with_timeout(config.upstream_timeout),
    );

    let server = Server::bind(config.listen_addr()).await?;
    info!(
        address = %server.local_addr(),
        upstream = %config.upstream,
        ttl_ms = config.ttl.as_millis() as u64,
        "caching proxy started"
    );

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    server
        .run_until(
            move |req| {
                let pipeline = Arc::clone(&pipeline);
                async move { pipeline.handle(req).await }
            },
            shutdown,
        )
        .await?;
    Ok(())
}
