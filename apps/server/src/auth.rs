use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;
use thiserror::Error;

use crate::{error::AppError, AppState};

type HmacSha256 = Hmac<Sha256>;

/// Accepted clock skew for webhook signatures (5 minutes).
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

fn mac_for(key: &[u8], message: &[u8]) -> Option<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(key).ok()?;
    mac.update(message);
    Some(mac)
}

/// Constant-time token comparison: both sides are MACed under the expected
/// token and the tags compared with `verify_slice`.
pub fn token_matches(presented: &str, expected: &str) -> bool {
    if expected.is_empty() {
        return false;
    }
    let (Some(reference), Some(candidate)) = (
        mac_for(expected.as_bytes(), expected.as_bytes()),
        mac_for(expected.as_bytes(), presented.as_bytes()),
    ) else {
        return false;
    };
    let tag = reference.finalize().into_bytes();
    candidate.verify_slice(&tag).is_ok()
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header_value: &str) -> Option<&str> {
    header_value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Axum middleware guarding the admin routes with `ADMIN_API_TOKEN`.
pub async fn require_admin(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let presented = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(bearer_token)
        .ok_or(AppError::Unauthorized)?;

    if !token_matches(presented, &state.config.admin_api_token) {
        tracing::warn!("Rejected admin request to {}", req.uri().path());
        return Err(AppError::Unauthorized);
    }
    Ok(next.run(req).await)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("malformed signature header")]
    Malformed,
    #[error("signature timestamp outside tolerance")]
    Expired,
    #[error("signature mismatch")]
    Mismatch,
}

/// Verify a `Stripe-Signature` header (`t=<unix>,v1=<hex>[,v1=<hex>...]`).
/// The signed message is `"{t}.{payload}"`.
pub fn verify_stripe_signature(
    payload: &[u8],
    header_value: &str,
    secret: &str,
    now: i64,
) -> Result<(), SignatureError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();
    for part in header_value.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse::<i64>().ok(),
            Some(("v1", value)) => signatures.push(value),
            _ => {}
        }
    }
    let timestamp = timestamp.ok_or(SignatureError::Malformed)?;
    if signatures.is_empty() {
        return Err(SignatureError::Malformed);
    }
    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        return Err(SignatureError::Expired);
    }

    let mut signed = format!("{timestamp}.").into_bytes();
    signed.extend_from_slice(payload);

    let matched = signatures.iter().any(|sig| {
        let Ok(expected) = hex::decode(sig) else {
            return false;
        };
        mac_for(secret.as_bytes(), &signed).is_some_and(|mac| mac.verify_slice(&expected).is_ok())
    });
    if matched {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a valid `Stripe-Signature` header for tests.
    pub(crate) fn sign(payload: &str, secret: &str, timestamp: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("{timestamp}.{payload}").as_bytes());
        format!("t={},v1={}", timestamp, hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn test_token_matches() {
        assert!(token_matches("s3cret", "s3cret"));
        assert!(!token_matches("s3cre", "s3cret"));
        assert!(!token_matches("", "s3cret"));
        assert!(!token_matches("", ""));
    }

    #[test]
    fn test_bearer_token() {
        assert_eq!(bearer_token("Bearer abc"), Some("abc"));
        assert_eq!(bearer_token("Bearer   "), None);
        assert_eq!(bearer_token("Basic abc"), None);
    }

    #[test]
    fn test_valid_signature() {
        let payload = r#"{"type":"checkout.session.completed"}"#;
        let header = sign(payload, "whsec_test", 1_700_000_000);
        assert_eq!(
            verify_stripe_signature(payload.as_bytes(), &header, "whsec_test", 1_700_000_100),
            Ok(())
        );
    }

    #[test]
    fn test_any_v1_may_match() {
        let payload = "{}";
        let good = sign(payload, "whsec_test", 1_700_000_000);
        let header = format!("t=1700000000,v1=deadbeef,{}", &good["t=1700000000,".len()..]);
        assert!(verify_stripe_signature(payload.as_bytes(), &header, "whsec_test", 1_700_000_000).is_ok());
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let header = sign(r#"{"amount":100}"#, "whsec_test", 1_700_000_000);
        assert_eq!(
            verify_stripe_signature(br#"{"amount":1}"#, &header, "whsec_test", 1_700_000_000),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let header = sign("{}", "whsec_other", 1_700_000_000);
        assert_eq!(
            verify_stripe_signature(b"{}", &header, "whsec_test", 1_700_000_000),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_stale_signature_rejected() {
        let header = sign("{}", "whsec_test", 1_700_000_000);
        assert_eq!(
            verify_stripe_signature(b"{}", &header, "whsec_test", 1_700_000_000 + 301),
            Err(SignatureError::Expired)
        );
    }

    #[test]
    fn test_malformed_header_rejected() {
        for header in ["", "v1=abc", "t=abc,v1=abc", "t=1700000000"] {
            assert_eq!(
                verify_stripe_signature(b"{}", header, "whsec_test", 1_700_000_000),
                Err(SignatureError::Malformed),
                "{header}"
            );
        }
    }
}
