//! [`Upstream`] implementation backed by a [`reqwest`] client.

use std::time::Duration;

use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use tracing::debug;

use super::{Upstream, UpstreamError, UpstreamFuture, UpstreamResponse};
use crate::http::Request;

/// The client negotiates its own content coding with the upstream and hands
/// the proxy a decoded body, so the inbound `Accept-Encoding` is not relayed.
const ACCEPT_ENCODING: &str = "accept-encoding";

/// Relays requests to a fixed origin over HTTP(S).
///
/// The origin is joined verbatim with each request target, so
/// `https://api.kraken.com` + `/0/public/Ticker?pair=XBTUSD` becomes
/// `https://api.kraken.com/0/public/Ticker?pair=XBTUSD`.
#[derive(Debug, Clone)]
pub struct HttpUpstream {
    client: Client,
    origin: String,
}

impl HttpUpstream {
    /// Creates a client for `origin` whose requests give up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`UpstreamError::Transport`] if the TLS backend cannot be initialised.
    pub fn new(origin: impl Into<String>, timeout: Duration) -> Result<Self, UpstreamError> {
        let client = Client::builder().timeout(timeout).build()?;
        let origin = origin.into().trim_end_matches('/').to_owned();
        Ok(Self { client, origin })
    }

    /// Returns the origin requests are relayed to.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    fn url_for(&self, request: &Request) -> String {
        format!("{}{}", self.origin, request.target())
    }
}

/// End-to-end request headers minus `Accept-Encoding`.
fn forwarded_headers(request: &Request) -> impl Iterator<Item = (&str, &str)> {
    request
        .headers()
        .end_to_end()
        .filter(|(name, _)| !name.eq_ignore_ascii_case(ACCEPT_ENCODING))
}

impl Upstream for HttpUpstream {
    fn forward<'a>(&'a self, request: &'a Request) -> UpstreamFuture<'a> {
        Box::pin(async move {
            let method = reqwest::Method::from_bytes(request.method().as_str().as_bytes())
                .map_err(|_| UpstreamError::InvalidMethod(request.method().to_string()))?;
            let url = self.url_for(request);

            let mut builder = self.client.request(method, &url);
            for (name, value) in forwarded_headers(request) {
                builder = builder.header(name, value);
            }
            if !request.body().is_empty() {
                builder = builder.body(request.body().clone());
            }

            debug!(url = %url, "forwarding to upstream");
            let response = builder.send().await?;

            let status = response.status().as_u16();
            let content_type = response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned);
            let body = response.bytes().await?;

            debug!(url = %url, status, bytes = body.len(), "upstream responded");
            Ok(UpstreamResponse {
                status,
                content_type,
                body,
            })
        })
    }
}
