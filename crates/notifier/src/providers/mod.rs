//! HTTP-backed provider adapters.

pub mod http;
pub mod resend;

use std::time::Duration;

use reqwest::StatusCode;

pub use http::HttpGatewayProvider;
pub use resend::ResendProvider;

use crate::provider::SendOutcome;

/// Timeout for a single provider request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub(crate) fn build_client() -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()
}

/// Classify a non-2xx provider response.
///
/// 408, 429 and 5xx are transient; 404, 410 and 422 mean the recipient is
/// unusable; 401 and 403 mean our credentials are wrong. Anything else
/// rejects this message only and leaves the endpoint alone.
pub fn classify_status(status: StatusCode, body: &str) -> SendOutcome {
    let reason = format!("HTTP {}: {}", status.as_u16(), truncate(body, 200));
    match status.as_u16() {
        408 | 429 | 500..=599 => SendOutcome::transient(reason),
        404 | 410 | 422 => SendOutcome::permanent(reason),
        401 | 403 => SendOutcome::misconfigured(reason),
        _ => SendOutcome::rejected(reason),
    }
}

/// Network-level failures (connect, timeout, reset) are transient.
pub fn classify_transport_error(err: &reqwest::Error) -> SendOutcome {
    if err.is_builder() {
        SendOutcome::misconfigured(format!("invalid provider request: {err}"))
    } else {
        SendOutcome::transient(format!("provider request failed: {err}"))
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Pull a message id out of a provider's JSON reply.
pub(crate) fn message_id_from(body: &serde_json::Value) -> Option<String> {
    ["id", "message_id", "messageId", "sid"]
        .iter()
        .find_map(|field| body.get(*field))
        .and_then(|v| match v {
            serde_json::Value::String(s) => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}
