//! The forwarding seam between the proxy and the single fixed upstream API.
//!
//! [`Upstream`] is the only way the proxy reaches the network. Production code
//! uses [`HttpUpstream`]; tests plug in in-process fakes that count calls or
//! never answer.

use std::pin::Pin;

use bytes::Bytes;
use thiserror::Error;

use crate::http::Request;

pub mod http;
pub mod kraken;

pub use self::http::HttpUpstream;

/// Errors produced while relaying a request to the upstream.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// The HTTP client gave up waiting for the upstream.
    #[error("upstream request timed out")]
    Timeout,

    /// Connection refused, DNS failure, TLS failure, truncated body, ...
    #[error("upstream transport error: {0}")]
    Transport(#[source] reqwest::Error),

    /// The inbound method cannot be expressed as an outbound request.
    #[error("cannot forward method {0:?}")]
    InvalidMethod(String),
}

impl From<reqwest::Error> for UpstreamError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::Timeout
        } else {
            Self::Transport(error)
        }
    }
}

/// The raw answer received from the upstream.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    /// Numeric HTTP status.
    pub status: u16,
    /// The upstream `Content-Type`, if any.
    pub content_type: Option<String>,
    /// The complete response body.
    pub body: Bytes,
}

impl UpstreamResponse {
    /// A `200 OK` JSON response with the given body. Mostly useful for fakes.
    pub fn json(body: impl Into<Bytes>) -> Self {
        Self {
            status: 200,
            content_type: Some("application/json".to_owned()),
            body: body.into(),
        }
    }
}

/// Boxed future returned by [`Upstream::forward`].
pub type UpstreamFuture<'a> =
    Pin<Box<dyn Future<Output = Result<UpstreamResponse, UpstreamError>> + Send + 'a>>;

/// A backend the proxy can relay requests to.
///
/// # Contract
///
/// - The request is relayed unchanged: same method, path, query and body, with
///   end-to-end headers only.
/// - Implementations do not retry; a failed call is reported once.
/// - Callers bound the returned future with their own timeout, so an
///   implementation may take arbitrarily long.
pub trait Upstream: Send + Sync {
    /// Relay `request` and return the complete response.
    fn forward<'a>(&'a self, request: &'a Request) -> UpstreamFuture<'a>;
}
