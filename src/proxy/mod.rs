//! Cache-first request handling in front of the upstream API.
//!
//! [`ProxyPipeline::handle`] is a plain `Request -> Response` function composed
//! from three steps: look the request up in the [`CacheStore`], otherwise
//! forward it to the [`Upstream`] under a fixed timeout, then decode the
//! upstream body as JSON, store it and answer with its canonical encoding.
//!
//! ## Policies
//!
//! - Only origin-form targets (`/path?query`) are accepted. Absolute-form,
//!   authority-form and `*` targets are answered with `400` and never relayed.
//! - The cache key is the request path plus query string, verbatim. Headers
//!   never take part in it.
//! - Only `GET` requests read or populate the cache. Every other method is
//!   relayed untouched so a write can neither be answered from, nor pollute,
//!   a cached read.
//! - Only `2xx` responses whose Kraken envelope carries no errors are stored.
//! - Concurrent misses for the same key are not coalesced: each one forwards
//!   and each one writes, and the last write wins.
//! - Errors are terminal for the request. Nothing is retried and nothing is
//!   written to the cache on a failed path.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::cache::CacheStore;
use crate::http::{Method, Request, Response, StatusCode};
use crate::upstream::kraken::envelope_errors;
use crate::upstream::{Upstream, UpstreamError, UpstreamResponse};

/// Header set to `true` on responses served from the cache.
pub const CACHED_HEADER: &str = "X-Cached";

/// Upper bound on a single upstream call (5 s).
pub const UPSTREAM_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Errors that fail a single proxied request.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("request target must be a path: {0:?}")]
    InvalidTarget(String),

    #[error("upstream did not respond within {0:?}")]
    UpstreamTimeout(Duration),

    #[error(transparent)]
    Upstream(UpstreamError),

    #[error("upstream body is not valid JSON: {0}")]
    Decode(#[from] serde_json::Error),
}

impl ProxyError {
    /// The status reported to the client for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidTarget(_) => StatusCode::BadRequest,
            Self::UpstreamTimeout(_) => StatusCode::GatewayTimeout,
            Self::Upstream(_) | Self::Decode(_) => StatusCode::BadGateway,
        }
    }

    /// Converts the error into the response sent to the client.
    pub fn into_response(self) -> Response {
        let status = self.status();
        Response::new(status).body(format!("{}: {self}", status.canonical_reason()))
    }
}

/// Derives the cache key for a path and optional query string.
///
/// The key is `path`, followed by `?query` when a query string is present (even
/// an empty one). Nothing is normalised: case, parameter order and escapes are
/// significant.
///
/// ```
/// use kraken_cache_proxy::proxy::cache_key;
///
/// assert_eq!(cache_key("/0/public/Ticker", Some("pair=XBTUSD")), "/0/public/Ticker?pair=XBTUSD");
/// assert_eq!(cache_key("/0/public/Time", None), "/0/public/Time");
/// ```
pub fn cache_key(path: &str, query: Option<&str>) -> String {
    match query {
        Some(query) => format!("{path}?{query}"),
        None => path.to_owned(),
    }
}

/// Derives the cache key for `request`. See [`cache_key`].
pub fn request_key(request: &Request) -> String {
    cache_key(request.path(), request.query_string())
}

/// Returns `true` if `target` is in origin form, i.e. a path relative to the
/// upstream origin.
pub fn is_origin_form(target: &str) -> bool {
    target.starts_with('/')
}

/// Returns `true` if responses to `method` may be served from or stored in the cache.
pub fn is_cacheable(method: &Method) -> bool {
    *method == Method::Get
}

/// The request pipeline: cache lookup, upstream fallback, cache population.
///
/// Constructed once at startup and shared across connection tasks behind an [`Arc`].
pub struct ProxyPipeline {
    cache: Arc<CacheStore>,
    upstream: Arc<dyn Upstream>,
    timeout: Duration,
}

impl ProxyPipeline {
    /// Creates a pipeline over `cache` and `upstream` using [`UPSTREAM_TIMEOUT`].
    pub fn new(cache: Arc<CacheStore>, upstream: Arc<dyn Upstream>) -> Self {
        Self {
            cache,
            upstream,
            timeout: UPSTREAM_TIMEOUT,
        }
    }

    /// Overrides the upstream timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns the cache this pipeline reads and populates.
    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    /// Handles one request, turning any [`ProxyError`] into an error response.
    pub async fn handle(&self, request: Request) -> Response {
        match self.try_handle(&request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(
                    method = %request.method(),
                    target = %request.target(),
                    error = %e,
                    "proxy request failed"
                );
                e.into_response()
            }
        }
    }

    /// Handles one request, reporting failures to the caller.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::InvalidTarget`] for a target that is not a path,
    /// [`ProxyError::UpstreamTimeout`] when the upstream does not answer in time,
    /// [`ProxyError::Upstream`] when it cannot be reached, and
    /// [`ProxyError::Decode`] when a cacheable request gets a non-JSON body.
    pub async fn try_handle(&self, request: &Request) -> Result<Response, ProxyError> {
        if !is_origin_form(request.target()) {
            return Err(ProxyError::InvalidTarget(request.target().to_owned()));
        }

        if !is_cacheable(request.method()) {
            let upstream = self.forward(request).await?;
            return Ok(relay(upstream));
        }

        let key = request_key(request);
        if let Some(value) = self.cache.get(&key) {
            info!(key = %key, "cache hit");
            return Ok(Response::new(StatusCode::Ok)
                .json(value.to_string())
                .header(CACHED_HEADER, "true"));
        }

        let upstream = self.forward(request).await?;
        let status = upstream_status(upstream.status);
        let value: Value = serde_json::from_slice(&upstream.body)?;
        let body = value.to_string();

        if !status.is_success() {
            info!(key = %key, status = status.as_u16(), "not caching upstream error status");
        } else {
            let errors = envelope_errors(&value);
            if errors.is_empty() {
                self.cache.put(key.clone(), value);
                info!(key = %key, ttl_ms = self.cache.ttl().as_millis() as u64, "cached upstream response");
            } else {
                warn!(key = %key, errors = %errors.join(" "), "upstream reported errors, not caching");
            }
        }

        Ok(Response::new(status).json(body))
    }

    async fn forward(&self, request: &Request) -> Result<UpstreamResponse, ProxyError> {
        match tokio::time::timeout(self.timeout, self.upstream.forward(request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(UpstreamError::Timeout)) | Err(_) => Err(ProxyError::UpstreamTimeout(self.timeout)),
            Ok(Err(e)) => Err(ProxyError::Upstream(e)),
        }
    }
}

// Passes an upstream answer to a non-cacheable request through untouched.
fn relay(upstream: UpstreamResponse) -> Response {
    let mut response = Response::new(upstream_status(upstream.status)).body_bytes(upstream.body);
    if let Some(content_type) = upstream.content_type {
        response.add_header("Content-Type", content_type);
    }
    response
}

fn upstream_status(code: u16) -> StatusCode {
    StatusCode::try_from(code).unwrap_or_else(|code| {
        warn!(code, "unrecognised upstream status");
        StatusCode::BadGateway
    })
}
