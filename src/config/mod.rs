//! Process configuration.
//!
//! Only the listening port comes from the environment (`PORT`). The upstream
//! origin, TTL and upstream timeout are fixed at compile time.

use std::time::Duration;

use tracing::warn;

use crate::cache::DEFAULT_TTL;
use crate::proxy::UPSTREAM_TIMEOUT;
use crate::upstream::kraken::KRAKEN_API;

/// Port used when `PORT` is unset or not a valid port number.
pub const DEFAULT_PORT: u16 = 8080;

/// Environment variable holding the listening port.
pub const PORT_VAR: &str = "PORT";

/// Settings the binary starts the proxy with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    pub upstream: String,
    pub ttl: Duration,
    pub upstream_timeout: Duration,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            port: DEFAULT_PORT,
            upstream: KRAKEN_API.to_owned(),
            ttl: DEFAULT_TTL,
            upstream_timeout: UPSTREAM_TIMEOUT,
        }
    }
}

impl ProxyConfig {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads the configuration through `lookup`, which maps a variable name to its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let port = match lookup(PORT_VAR) {
            None => DEFAULT_PORT,
            Some(raw) => raw.trim().parse::<u16>().unwrap_or_else(|_| {
                warn!(value = %raw, default = DEFAULT_PORT, "invalid PORT, using default");
                DEFAULT_PORT
            }),
        };

        Self {
            port,
            ..Self::default()
        }
    }

    /// The `host:port` string the server binds to.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
