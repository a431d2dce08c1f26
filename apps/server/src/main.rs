mod alert_layer;
mod appointment;
mod auth;
mod booking;
mod calendar_sync;
mod config;
mod db;
mod error;
mod handlers;
mod models;
mod rate_limit;
mod routes;
mod schedule;
mod session;
mod store;

use sqlx::sqlite::SqlitePoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use booking::CheckoutProvider;
use calendar_sync::{CalendarApi, HttpCalendarApi};
use config::Config;
use handlers::payment::{DisabledCheckout, StripeCheckout};
use rate_limit::RateLimiter;
use schedule::BusinessClock;
use session::SessionRegistry;
use store::{ScheduleCache, Store};

/// Shared application state accessible from all handlers.
pub struct AppState {
    pub store: Store,
    pub config: Config,
    pub clock: BusinessClock,
    pub schedule: ScheduleCache,
    pub sessions: SessionRegistry,
    pub checkout: Arc<dyn CheckoutProvider>,
    pub calendar: Option<Arc<dyn CalendarApi>>,
    pub started_at: Instant,
}

/// Payment expiry check interval (seconds).
const PAYMENT_EXPIRY_INTERVAL_SECS: u64 = 300;
/// Calendar outbox poll interval (seconds).
const OUTBOX_INTERVAL_SECS: u64 = 60;
/// Session purge interval (seconds).
const SESSION_PURGE_SECS: u64 = 120;
/// Rate limit cleanup interval (seconds).
const RATE_LIMIT_CLEANUP_SECS: u64 = 300;
/// How long calendar settings are served from memory.
const SCHEDULE_CACHE_SECS: u64 = 30;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // ── Config (read before tracing so the alert layer can use it) ──
    let config = Config::from_env()?;

    let http = reqwest::Client::builder()
        .timeout(config.http_timeout)
        .build()?;

    // ── Tracing: console + optional alert webhook ──
    let env_filter = EnvFilter::from_default_env().add_directive("info".parse()?);
    let fmt_layer = tracing_subscriber::fmt::layer();
    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer);

    match &config.alert_webhook_url {
        Some(url) => {
            let alerts = alert_layer::AlertLayer::new(url.clone(), http.clone());
            registry.with(alerts).init();
        }
        None => registry.init(),
    }

    // ── Database ──
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&config.database_url)
        .await?;

    db::run_migrations(&pool).await?;
    let store = Store::new(pool);

    // ── Providers ──
    let checkout: Arc<dyn CheckoutProvider> = match &config.stripe_secret_key {
        Some(key) => Arc::new(StripeCheckout::new(
            http.clone(),
            key.clone(),
            config.stripe_currency.clone(),
            config.site_url.clone(),
        )),
        None => {
            tracing::warn!("STRIPE_SECRET_KEY not set, paid bookings cannot be checked out");
            Arc::new(DisabledCheckout)
        }
    };
    if config.stripe_webhook_secret.is_none() {
        tracing::warn!("STRIPE_WEBHOOK_SECRET not set, payment webhooks will be rejected");
    }

    let calendar: Option<Arc<dyn CalendarApi>> = match &config.calendar_api_url {
        Some(url) => Some(Arc::new(HttpCalendarApi::new(
            http.clone(),
            url,
            config.calendar_api_key.clone(),
        ))),
        None => {
            tracing::warn!("CALENDAR_API_URL not set, calendar events stay queued");
            None
        }
    };

    let state = Arc::new(AppState {
        store,
        clock: BusinessClock::new(config.tz_offset),
        schedule: ScheduleCache::new(Duration::from_secs(SCHEDULE_CACHE_SECS)),
        sessions: SessionRegistry::new(config.session_ttl),
        checkout,
        calendar,
        started_at: Instant::now(),
        config,
    });

    // ── Background task: expire unpaid bookings ──
    let expire_state = state.clone();
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(Duration::from_secs(PAYMENT_EXPIRY_INTERVAL_SECS));
        loop {
            interval.tick().await;
            handlers::payment::expire_pending_payments(
                &expire_state.store,
                expire_state.config.pending_payment_ttl,
            )
            .await;
        }
    });

    // ── Background task: deliver queued calendar events ──
    if let Some(api) = state.calendar.clone() {
        let outbox_store = state.store.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(OUTBOX_INTERVAL_SECS));
            loop {
                interval.tick().await;
                if let Err(e) =
                    calendar_sync::run_outbox_once(&outbox_store, api.as_ref(), chrono::Utc::now())
                        .await
                {
                    tracing::error!("Calendar outbox run failed: {}", e);
                }
            }
        });
    }

    // ── Background task: drop idle booking sessions ──
    let purge_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(SESSION_PURGE_SECS));
        loop {
            interval.tick().await;
            let purged = purge_state.sessions.purge_expired();
            if purged > 0 {
                tracing::debug!("Purged {} idle booking sessions", purged);
            }
        }
    });

    // ── Rate limiter + background cleanup ──
    let rate_limiter = RateLimiter::with_defaults();
    let cleanup_limiter = rate_limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(RATE_LIMIT_CLEANUP_SECS));
        loop {
            interval.tick().await;
            cleanup_limiter.cleanup();
        }
    });

    let app = routes::build_router(state.clone(), rate_limiter);

    let addr = format!("{}:{}", state.config.host, state.config.port);
    tracing::info!("Consulting booking server starting on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
