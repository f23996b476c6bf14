//! # kraken-cache-proxy
//!
//! A transparent caching reverse proxy for the Kraken REST API.
//!
//! Every request is forwarded to a single fixed upstream. JSON answers to `GET`
//! requests are remembered per path + query for 30 seconds and replayed with an
//! `X-Cached: true` header until they expire.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use kraken_cache_proxy::{CacheStore, HttpUpstream, ProxyConfig, ProxyPipeline, Server};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ProxyConfig::from_env();
//!     let upstream = HttpUpstream::new(&config.upstream, config.upstream_timeout)?;
//!     let cache = Arc::new(CacheStore::with_ttl(config.ttl));
//!     let pipeline = Arc::new(ProxyPipeline::new(cache, Arc::new(upstream)));
//!
//!     let server = Server::bind(config.listen_addr()).await?;
//!     server.run(move |req| {
//!         let pipeline = Arc::clone(&pipeline);
//!         async move { pipeline.handle(req).await }
//!     }).await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod config;
pub mod http;
pub mod proxy;
pub mod server;
pub mod upstream;

// ── Convenience re-exports ────────────────────────────────────────────────────
pub use cache::CacheStore;
pub use config::ProxyConfig;
pub use http::{Headers, Method, Request, Response, StatusCode};
pub use proxy::{ProxyError, ProxyPipeline};
pub use server::{Server, ServerError};
pub use upstream::{HttpUpstream, Upstream, UpstreamError};
