//! Tracing layer that forwards ERROR events to an alert webhook.
//!
//! - at most one alert per `MIN_INTERVAL` (10 s)
//! - identical messages suppressed for `DEDUP_WINDOW` (60 s)
//! - the webhook POST (`{"text": ...}`, Slack-compatible) is spawned on the runtime

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

const MIN_INTERVAL: Duration = Duration::from_secs(10);
const DEDUP_WINDOW: Duration = Duration::from_secs(60);

// ── Throttle ──

struct Throttle {
    last_sent: Option<Instant>,
    /// (hash, sent_at) of recently forwarded messages.
    recent: Vec<(u64, Instant)>,
}

impl Throttle {
    fn new() -> Self {
        Self {
            last_sent: None,
            recent: Vec::new(),
        }
    }

    /// Whether a message with `hash` may be sent at `now`; records it if so.
    fn admit(&mut self, hash: u64, now: Instant) -> bool {
        self.recent
            .retain(|(_, ts)| now.duration_since(*ts) < DEDUP_WINDOW);

        let is_dup = self.recent.iter().any(|(h, _)| *h == hash);
        let too_soon = self
            .last_sent
            .is_some_and(|last| now.duration_since(last) < MIN_INTERVAL);
        if is_dup || too_soon {
            return false;
        }
        self.last_sent = Some(now);
        self.recent.push((hash, now));
        true
    }
}

fn message_hash(message: &str) -> u64 {
    let mut h = DefaultHasher::new();
    message.hash(&mut h);
    h.finish()
}

// ── Layer ──

pub struct AlertLayer {
    webhook_url: String,
    http: reqwest::Client,
    throttle: Mutex<Throttle>,
}

impl AlertLayer {
    pub fn new(webhook_url: String, http: reqwest::Client) -> Self {
        Self {
            webhook_url,
            http,
            throttle: Mutex::new(Throttle::new()),
        }
    }
}

fn format_alert(message: &str, target: &str, file: &str, line: &str) -> String {
    let now_utc = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC");
    format!(
        ":rotating_light: *Booking server error*\n```{message}```\n{target} ({file}:{line}) at {now_utc}"
    )
}

impl<S: Subscriber> Layer<S> for AlertLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() != Level::ERROR {
            return;
        }

        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let message = visitor.message();

        let admitted = {
            let mut throttle = self
                .throttle
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            throttle.admit(message_hash(&message), Instant::now())
        };
        if !admitted {
            return;
        }

        let meta = event.metadata();
        let line = meta
            .line()
            .map(|l| l.to_string())
            .unwrap_or_else(|| "?".into());
        let text = format_alert(&message, meta.target(), meta.file().unwrap_or("?"), &line);

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let client = self.http.clone();
        let url = self.webhook_url.clone();
        runtime.spawn(async move {
            let _ = client
                .post(&url)
                .json(&serde_json::json!({ "text": text }))
                .send()
                .await;
        });
    }
}

// ── Field visitor ──

/// Collects the `message` field plus any structured fields of an event.
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<(String, String)>,
}

impl MessageVisitor {
    fn message(&self) -> String {
        if self.fields.is_empty() {
            return self.message.clone();
        }
        let extras: Vec<String> = self
            .fields
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        if self.message.is_empty() {
            extras.join(", ")
        } else {
            format!("{} ({})", self.message, extras.join(", "))
        }
    }

    fn record(&mut self, field: &Field, value: String) {
        if field.name() == "message" {
            self.message = value;
        } else {
            self.fields.push((field.name().to_string(), value));
        }
    }
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.record(field, format!("{:?}", value));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.record(field, value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.record(field, value.to_string());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.record(field, value.to_string());
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_first_message_allowed() {
        let mut throttle = Throttle::new();
        assert!(throttle.admit(111, Instant::now()));
    }

    #[test]
    fn test_rate_limit_suppresses_second() {
        let mut throttle = Throttle::new();
        let now = Instant::now();
        assert!(throttle.admit(111, now));
        assert!(!throttle.admit(222, now + Duration::from_secs(1)));
    }

    #[test]
    fn test_dedup_same_message() {
        let mut throttle = Throttle::new();
        let now = Instant::now();
        assert!(throttle.admit(111, now));
        assert!(!throttle.admit(111, now + MIN_INTERVAL + Duration::from_secs(1)));
        assert!(throttle.admit(222, now + MIN_INTERVAL + Duration::from_secs(1)));
    }

    #[test]
    fn test_dedup_expires_after_window() {
        let mut throttle = Throttle::new();
        let now = Instant::now();
        assert!(throttle.admit(111, now));
        assert!(throttle.admit(111, now + DEDUP_WINDOW + Duration::from_secs(1)));
    }

    #[test]
    fn test_format_message_with_fields() {
        let v = MessageVisitor {
            message: "DB error".into(),
            fields: vec![("booking_id".into(), "42".into())],
        };
        assert_eq!(v.message(), "DB error (booking_id=42)");

        let v = MessageVisitor {
            message: String::new(),
            fields: vec![("error".into(), "timeout".into())],
        };
        assert_eq!(v.message(), "error=timeout");
    }

    #[tokio::test]
    async fn test_error_event_posts_to_webhook() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let layer = AlertLayer::new(format!("{}/hook", server.uri()), reqwest::Client::new());
        let subscriber = tracing_subscriber::registry().with(layer);
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("not forwarded");
            tracing::error!("outbox entry failed");
            tracing::error!("outbox entry failed");
        });

        // Give the spawned request time to land.
        tokio::time::sleep(Duration::from_millis(200)).await;
        server.verify().await;
    }
}
