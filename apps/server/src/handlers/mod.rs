pub mod admin;
pub mod client;
pub mod health;
pub mod payment;
pub mod session;

use axum::http::HeaderMap;

const IDEMPOTENCY_HEADER: &str = "idempotency-key";

/// Client-chosen key that makes a booking submission safe to repeat.
pub(crate) fn idempotency_key(headers: &HeaderMap) -> Option<String> {
    headers
        .get(IDEMPOTENCY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|k| !k.is_empty() && k.len() <= 200)
        .map(str::to_string)
}
