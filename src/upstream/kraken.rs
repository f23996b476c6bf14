//! The Kraken REST response envelope.
//!
//! Every Kraken endpoint answers `{"error": [...], "result": ...}`, usually with
//! `200 OK` even when `error` is non-empty. Such answers are relayed to the
//! client but never cached.

use serde::Deserialize;
use serde_json::Value;

/// Default upstream origin.
pub const KRAKEN_API: &str = "https://api.kraken.com";

#[derive(Debug, Default, Deserialize)]
struct Envelope {
    #[serde(default)]
    error: Vec<String>,
}

/// Returns the error messages carried by a decoded Kraken response.
///
/// Documents that are not shaped like the envelope report no errors.
pub fn envelope_errors(value: &Value) -> Vec<String> {
    Envelope::deserialize(value)
        .map(|envelope| envelope.error)
        .unwrap_or_default()
}
