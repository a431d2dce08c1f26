use anyhow::Context;
use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
};
use std::sync::Arc;
use url::Url;

use crate::{
    auth,
    booking::{CheckoutProvider, CheckoutRequest, CheckoutSession, StoreError},
    error::AppError,
    models::*,
    store::Store,
    AppState,
};

const STRIPE_API_BASE: &str = "https://api.stripe.com";

// ── Checkout client ──

/// Stripe Checkout (`POST /v1/checkout/sessions`, form-encoded).
pub struct StripeCheckout {
    client: reqwest::Client,
    api_base: String,
    secret_key: String,
    currency: String,
    site_url: Url,
}

impl StripeCheckout {
    pub fn new(client: reqwest::Client, secret_key: String, currency: String, site_url: Url) -> Self {
        Self {
            client,
            api_base: STRIPE_API_BASE.to_string(),
            secret_key,
            currency,
            site_url,
        }
    }

    /// Point the client at another API host (tests, Stripe mock servers).
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    /// Return URL under `SITE_URL`. The `{CHECKOUT_SESSION_ID}` placeholder
    /// must stay unescaped for Stripe to substitute it.
    fn return_url(&self, path: &str, booking_id: i64) -> anyhow::Result<String> {
        let base = self
            .site_url
            .join(path)
            .with_context(|| format!("bad return path {path}"))?;
        Ok(format!(
            "{base}?booking_id={booking_id}&session_id={{CHECKOUT_SESSION_ID}}"
        ))
    }
}

#[async_trait]
impl CheckoutProvider for StripeCheckout {
    async fn create_checkout(&self, request: &CheckoutRequest) -> anyhow::Result<CheckoutSession> {
        let booking_id = request.booking_id.to_string();
        let form: Vec<(&str, String)> = vec![
            ("mode", "payment".into()),
            ("line_items[0][quantity]", "1".into()),
            ("line_items[0][price_data][currency]", self.currency.clone()),
            ("line_items[0][price_data][unit_amount]", (request.amount * 100).to_string()),
            ("line_items[0][price_data][product_data][name]", request.title.clone()),
            (
                "line_items[0][price_data][product_data][description]",
                format!("{} {}", request.date, request.time),
            ),
            ("customer_email", request.customer_email.clone()),
            ("client_reference_id", booking_id.clone()),
            ("metadata[booking_id]", booking_id.clone()),
            ("payment_intent_data[metadata][booking_id]", booking_id),
            ("success_url", self.return_url("booking/success", request.booking_id)?),
            ("cancel_url", self.return_url("booking/cancelled", request.booking_id)?),
        ];

        let resp = self
            .client
            .post(format!("{}/v1/checkout/sessions", self.api_base))
            .bearer_auth(&self.secret_key)
            .form(&form)
            .send()
            .await
            .context("Stripe unreachable")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            tracing::error!("Stripe checkout creation failed: {} - {}", status, text);
            anyhow::bail!("Stripe API error: {}", status);
        }

        let session: StripeCheckoutSession =
            resp.json().await.context("Stripe returned bad JSON")?;
        let url = session
            .url
            .ok_or_else(|| anyhow::anyhow!("Missing checkout URL"))?;

        tracing::info!(
            "Stripe checkout {} created for booking {}",
            session.id,
            request.booking_id
        );
        Ok(CheckoutSession { id: session.id, url })
    }

    async fn resume_checkout(&self, session_id: &str) -> anyhow::Result<Option<CheckoutSession>> {
        let resp = self
            .client
            .get(format!("{}/v1/checkout/sessions/{}", self.api_base, session_id))
            .bearer_auth(&self.secret_key)
            .send()
            .await
            .context("Stripe unreachable")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            tracing::error!("Stripe checkout lookup failed: {} - {}", status, text);
            anyhow::bail!("Stripe API error: {}", status);
        }

        let session: StripeCheckoutSession =
            resp.json().await.context("Stripe returned bad JSON")?;
        Ok(match (session.status.as_deref(), session.url) {
            (Some("open"), Some(url)) => Some(CheckoutSession { id: session.id, url }),
            _ => None,
        })
    }
}

/// Stand-in when no Stripe key is configured: every checkout fails.
pub struct DisabledCheckout;

#[async_trait]
impl CheckoutProvider for DisabledCheckout {
    async fn create_checkout(&self, request: &CheckoutRequest) -> anyhow::Result<CheckoutSession> {
        anyhow::bail!(
            "payments are not configured (booking {})",
            request.booking_id
        )
    }
}

// ── Webhook ──

/// `booking_id` from an event object's metadata.
fn metadata_booking_id(object: &serde_json::Value) -> Option<i64> {
    match &object["metadata"]["booking_id"] {
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => n.as_i64(),
        _ => None,
    }
}

async fn resolve_booking_id(
    store: &Store,
    object: &serde_json::Value,
) -> Result<Option<i64>, StoreError> {
    if let Some(id) = metadata_booking_id(object) {
        return Ok(Some(id));
    }
    match object["id"].as_str() {
        Some(session_id) if session_id.starts_with("cs_") => {
            store.booking_id_for_checkout(session_id).await
        }
        _ => Ok(None),
    }
}

/// POST /api/payments/webhook: Stripe events, signature-checked.
///
/// Store failures answer 500 so Stripe redelivers; anything else is
/// acknowledged with 200.
pub async fn payment_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    let Some(secret) = state.config.stripe_webhook_secret.as_deref() else {
        tracing::warn!("Webhook received but STRIPE_WEBHOOK_SECRET is not set");
        return Err(AppError::Unauthorized);
    };
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| AppError::validation("Missing Stripe-Signature header"))?;

    auth::verify_stripe_signature(&body, signature, secret, chrono::Utc::now().timestamp())
        .map_err(|e| {
            tracing::warn!("Rejected webhook: {}", e);
            AppError::validation(format!("Invalid signature: {e}"))
        })?;

    let event: StripeEvent = serde_json::from_slice(&body)
        .map_err(|e| AppError::validation(format!("Invalid event payload: {e}")))?;
    tracing::info!("Stripe webhook: event={}, type={}", event.id, event.kind);

    let object = &event.data.object;
    let Some(booking_id) = resolve_booking_id(&state.store, object).await? else {
        tracing::warn!("Webhook {} has no booking_id", event.id);
        return Ok(StatusCode::OK);
    };

    let changed = match event.kind.as_str() {
        "checkout.session.completed" if object["payment_status"] == "unpaid" => {
            tracing::info!("Checkout for booking {} completed, payment still processing", booking_id);
            false
        }
        "checkout.session.completed" | "checkout.session.async_payment_succeeded" => {
            state.store.mark_paid(booking_id).await?
        }
        "checkout.session.expired" | "checkout.session.async_payment_failed" => {
            state.store.mark_payment_failed(booking_id).await?
        }
        "charge.refunded" => state.store.mark_refunded(booking_id).await?,
        other => {
            tracing::info!("Ignoring webhook event: {}", other);
            return Ok(StatusCode::OK);
        }
    };

    if changed {
        tracing::info!("Booking {} updated by {}", booking_id, event.kind);
    } else {
        tracing::info!("Booking {} unchanged by {} (already settled)", booking_id, event.kind);
    }
    Ok(StatusCode::OK)
}

// ── Background expiry ──

/// Fail payments left pending longer than `ttl`; their slots open up again.
pub async fn expire_pending_payments(store: &Store, ttl: chrono::Duration) {
    let cutoff = chrono::Utc::now() - ttl;
    match store.expire_pending_payments(cutoff).await {
        Ok(ids) => {
            for id in ids {
                tracing::info!("Expired unpaid booking {}", id);
            }
        }
        Err(e) => tracing::error!("expire_pending_payments: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::tests::{d, t};
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request() -> CheckoutRequest {
        CheckoutRequest {
            booking_id: 42,
            title: "Strategy session".into(),
            amount: 150,
            customer_email: "ana@example.com".into(),
            date: d("2026-03-06"),
            time: t("10:00"),
        }
    }

    fn stripe(server: &MockServer) -> StripeCheckout {
        StripeCheckout::new(
            reqwest::Client::new(),
            "sk_test_123".into(),
            "eur".into(),
            Url::parse("https://consult.example.com/").unwrap(),
        )
        .with_api_base(server.uri())
    }

    #[tokio::test]
    async fn test_checkout_posts_form_and_returns_url() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/checkout/sessions"))
            .and(header("authorization", "Bearer sk_test_123"))
            .and(body_string_contains("unit_amount%5D=15000"))
            .and(body_string_contains("metadata%5Bbooking_id%5D=42"))
            .and(body_string_contains("currency%5D=eur"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "cs_test_1",
                "url": "https://checkout.stripe.com/c/pay/cs_test_1"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let session = stripe(&server).create_checkout(&request()).await.unwrap();
        assert_eq!(session.id, "cs_test_1");
        assert_eq!(session.url, "https://checkout.stripe.com/c/pay/cs_test_1");
    }

    #[tokio::test]
    async fn test_checkout_error_status_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(402).set_body_string("card_declined"))
            .mount(&server)
            .await;

        let err = stripe(&server).create_checkout(&request()).await.unwrap_err();
        assert!(err.to_string().contains("402"));
    }

    #[tokio::test]
    async fn test_resume_returns_only_open_sessions() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v1/checkout/sessions/cs_open"))
            .and(header("authorization", "Bearer sk_test_123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "cs_open",
                "status": "open",
                "url": "https://checkout.stripe.com/c/pay/cs_open"
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/v1/checkout/sessions/cs_done"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "cs_done",
                "status": "expired",
                "url": null
            })))
            .mount(&server)
            .await;

        let client = stripe(&server);
        let open = client.resume_checkout("cs_open").await.unwrap().unwrap();
        assert_eq!(open.url, "https://checkout.stripe.com/c/pay/cs_open");
        assert!(client.resume_checkout("cs_done").await.unwrap().is_none());
        assert!(client.resume_checkout("cs_missing").await.is_err());
    }

    #[tokio::test]
    async fn test_disabled_checkout_always_fails() {
        assert!(DisabledCheckout.create_checkout(&request()).await.is_err());
    }

    #[test]
    fn test_return_url_keeps_placeholder() {
        let server_less = StripeCheckout::new(
            reqwest::Client::new(),
            String::new(),
            "eur".into(),
            Url::parse("https://consult.example.com/app/").unwrap(),
        );
        assert_eq!(
            server_less.return_url("booking/success", 7).unwrap(),
            "https://consult.example.com/app/booking/success?booking_id=7&session_id={CHECKOUT_SESSION_ID}"
        );
    }

    #[test]
    fn test_metadata_booking_id() {
        assert_eq!(
            metadata_booking_id(&serde_json::json!({"metadata": {"booking_id": "12"}})),
            Some(12)
        );
        assert_eq!(
            metadata_booking_id(&serde_json::json!({"metadata": {"booking_id": 5}})),
            Some(5)
        );
        assert_eq!(metadata_booking_id(&serde_json::json!({"metadata": {}})), None);
        assert_eq!(metadata_booking_id(&serde_json::json!({})), None);
    }

    #[tokio::test]
    async fn test_resolve_booking_id_falls_back_to_session() {
        use crate::booking::BookingStore;
        use crate::store::tests::{memory_store, new_booking};

        let store = memory_store().await;
        let (booking, _) = store.insert_booking(&new_booking("2026-03-04", "10:00")).await.unwrap();
        store.attach_checkout_session(booking.id, "cs_test_9").await.unwrap();

        let object = serde_json::json!({"id": "cs_test_9", "metadata": {}});
        assert_eq!(resolve_booking_id(&store, &object).await.unwrap(), Some(booking.id));
        let object = serde_json::json!({"id": "ch_1"});
        assert_eq!(resolve_booking_id(&store, &object).await.unwrap(), None);
    }
}
