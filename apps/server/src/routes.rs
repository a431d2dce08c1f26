use axum::{
    http::HeaderValue,
    middleware::from_fn_with_state,
    routing::{delete, get, patch, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::{
    auth::require_admin,
    handlers::{admin, client, health, payment, session},
    rate_limit::{rate_limit, RateLimiter, Tier},
    AppState,
};

fn cors_layer(origin: &str) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    match HeaderValue::from_str(origin) {
        Ok(value) => layer.allow_origin(AllowOrigin::exact(value)),
        Err(e) => {
            tracing::warn!("SITE_URL origin {} unusable for CORS ({}), allowing any", origin, e);
            layer.allow_origin(Any)
        }
    }
}

/// Assemble the API: five route groups, each with its own rate-limit tier.
pub fn build_router(state: Arc<AppState>, limiter: RateLimiter) -> Router {
    // 1. No limit: health checks + payment webhooks
    let no_limit_routes = Router::new()
        .route("/api/health", get(health::health))
        .route("/api/payments/webhook", post(payment::payment_webhook));

    // 2. Public reads
    let public_routes = Router::new()
        .route("/api/services", get(client::list_services))
        .route("/api/calendar-settings", get(client::calendar_settings))
        .route("/api/booked-slots", get(client::booked_slots))
        .route("/api/available-times", get(client::available_times))
        .route("/api/calendar", get(client::calendar))
        .layer(from_fn_with_state((limiter.clone(), Tier::Public), rate_limit));

    // 3. Anything that writes a booking or opens a checkout
    let booking_routes = Router::new()
        .route("/api/bookings", post(client::create_booking))
        .route("/api/checkout-session", post(client::create_checkout_session))
        .route("/api/sessions/{id}/submit", post(session::submit))
        .layer(from_fn_with_state((limiter.clone(), Tier::Booking), rate_limit));

    // 4. Booking stepper
    let session_routes = Router::new()
        .route("/api/sessions", post(session::create_session))
        .route(
            "/api/sessions/{id}",
            get(session::get_session).delete(session::delete_session),
        )
        .route("/api/sessions/{id}/service", put(session::select_service))
        .route("/api/sessions/{id}/date", put(session::select_date))
        .route("/api/sessions/{id}/time", put(session::select_time))
        .route("/api/sessions/{id}/details", put(session::update_details))
        .route("/api/sessions/{id}/next", post(session::next_step))
        .route("/api/sessions/{id}/back", post(session::previous_step))
        .route("/api/sessions/{id}/book-another", post(session::book_another))
        .layer(from_fn_with_state((limiter.clone(), Tier::Session), rate_limit));

    // 5. Admin: bearer token, then the admin budget
    let admin_routes = Router::new()
        .route(
            "/api/admin/services",
            get(admin::list_all_services).post(admin::create_service),
        )
        .route("/api/admin/services/{id}", put(admin::update_service))
        .route(
            "/api/admin/calendar-settings",
            get(admin::get_calendar_settings).put(admin::update_calendar_settings),
        )
        .route(
            "/api/admin/blocked-dates",
            get(admin::list_blocked_dates).post(admin::add_blocked_date),
        )
        .route("/api/admin/blocked-dates/{id}", delete(admin::delete_blocked_date))
        .route("/api/admin/bookings", get(admin::list_bookings))
        .route(
            "/api/admin/bookings/{id}/status",
            patch(admin::update_booking_status),
        )
        .route("/api/admin/appointments", post(admin::create_appointment))
        .route("/api/admin/appointments/{id}", put(admin::update_appointment))
        .route("/api/admin/calendar-events", post(admin::push_calendar_event))
        .route("/api/admin/calendar-outbox", get(admin::list_outbox))
        .route(
            "/api/admin/calendar-outbox/{id}/retry",
            post(admin::retry_outbox),
        )
        .layer(from_fn_with_state(state.clone(), require_admin))
        .layer(from_fn_with_state((limiter.clone(), Tier::Admin), rate_limit));

    Router::new()
        .merge(no_limit_routes)
        .merge(public_routes)
        .merge(booking_routes)
        .merge(session_routes)
        .merge(admin_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&state.config.site_origin()))
        .with_state(state)
}
