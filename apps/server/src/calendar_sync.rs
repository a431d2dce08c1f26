//! External calendar events, delivered through the `calendar_outbox` table.
//!
//! Saving an appointment only enqueues the event. A background worker
//! delivers due entries and retries failures with exponential backoff until
//! [`MAX_ATTEMPTS`] is reached, after which the entry is marked `failed` and
//! waits for a manual retry.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::booking::StoreError;
use crate::models::{Booking, OutboxEntry};
use crate::schedule::BusinessClock;
use crate::store::Store;

pub const MAX_ATTEMPTS: i64 = 5;
const BASE_BACKOFF_SECS: i64 = 60;
const BATCH_SIZE: i64 = 20;
const ONLINE_LOCATION: &str = "Online (video call)";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarEvent {
    pub appointment_id: i64,
    pub title: String,
    pub description: String,
    pub start_time: String,
    pub end_time: String,
    pub attendees: Vec<String>,
    pub location: String,
}

impl CalendarEvent {
    pub fn for_booking(
        booking: &Booking,
        service_title: &str,
        clock: &BusinessClock,
        office_location: &str,
    ) -> Self {
        let mut description = format!("Client: {} <{}>", booking.name, booking.email);
        if !booking.topic.is_empty() {
            description.push_str(&format!("\nTopic: {}", booking.topic));
        }
        if !booking.notes.is_empty() {
            description.push_str(&format!("\nNotes: {}", booking.notes));
        }
        Self {
            appointment_id: booking.id,
            title: format!("{} - {}", service_title, booking.name),
            description,
            start_time: clock.rfc3339(booking.date, booking.time),
            end_time: clock.rfc3339(booking.date, booking.end_time),
            attendees: vec![booking.email.clone()],
            location: if booking.is_online {
                ONLINE_LOCATION.to_string()
            } else {
                office_location.to_string()
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedEvent {
    pub event_id: String,
    pub meet_link: Option<String>,
}

#[async_trait]
pub trait CalendarApi: Send + Sync {
    async fn create_event(&self, event: &CalendarEvent) -> anyhow::Result<CreatedEvent>;
}

/// JSON calendar service: `POST {base}/calendar-event`.
pub struct HttpCalendarApi {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpCalendarApi {
    pub fn new(client: reqwest::Client, base_url: &Url, api_key: Option<String>) -> Self {
        Self {
            client,
            endpoint: format!("{}/calendar-event", base_url.as_str().trim_end_matches('/')),
            api_key,
        }
    }
}

#[async_trait]
impl CalendarApi for HttpCalendarApi {
    async fn create_event(&self, event: &CalendarEvent) -> anyhow::Result<CreatedEvent> {
        let mut request = self.client.post(&self.endpoint).json(event);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let resp = request.send().await.context("calendar API unreachable")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("calendar API error: {} - {}", status, text);
        }

        let created: CreatedEvent = resp.json().await.context("calendar API returned bad JSON")?;
        tracing::info!(
            "Calendar event {} created for appointment {}",
            created.event_id,
            event.appointment_id
        );
        Ok(created)
    }
}

/// Delay before the next attempt after `attempts` failures.
pub fn backoff_delay(attempts: i64) -> Duration {
    let shift = (attempts - 1).clamp(0, 8) as u32;
    Duration::seconds(BASE_BACKOFF_SECS * 2i64.pow(shift))
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OutboxRun {
    pub delivered: usize,
    pub retried: usize,
    pub failed: usize,
}

async fn deliver(
    store: &Store,
    api: &dyn CalendarApi,
    entry: &OutboxEntry,
    now: DateTime<Utc>,
    run: &mut OutboxRun,
) -> Result<(), StoreError> {
    let event: CalendarEvent = match serde_json::from_str(&entry.payload) {
        Ok(event) => event,
        Err(e) => {
            tracing::error!("Outbox entry {} has an unreadable payload: {}", entry.id, e);
            store
                .record_outbox_failure(entry.id, entry.attempts + 1, &e.to_string(), None)
                .await?;
            run.failed += 1;
            return Ok(());
        }
    };

    match api.create_event(&event).await {
        Ok(created) => {
            store
                .complete_outbox(entry.id, entry.booking_id, created.meet_link.as_deref())
                .await?;
            run.delivered += 1;
        }
        Err(e) => {
            let attempts = entry.attempts + 1;
            let message = format!("{e:#}");
            if attempts >= MAX_ATTEMPTS {
                tracing::error!(
                    "Calendar event for booking {} failed after {} attempts: {}",
                    entry.booking_id,
                    attempts,
                    message
                );
                store
                    .record_outbox_failure(entry.id, attempts, &message, None)
                    .await?;
                run.failed += 1;
            } else {
                let next = now + backoff_delay(attempts);
                tracing::warn!(
                    "Calendar event for booking {} failed (attempt {}), retrying at {}: {}",
                    entry.booking_id,
                    attempts,
                    next,
                    message
                );
                store
                    .record_outbox_failure(entry.id, attempts, &message, Some(next))
                    .await?;
                run.retried += 1;
            }
        }
    }
    Ok(())
}

/// Deliver every due outbox entry once.
pub async fn run_outbox_once(
    store: &Store,
    api: &dyn CalendarApi,
    now: DateTime<Utc>,
) -> Result<OutboxRun, StoreError> {
    let mut run = OutboxRun::default();
    for entry in store.due_outbox(now, BATCH_SIZE).await? {
        deliver(store, api, &entry, now, &mut run).await?;
    }
    if run != OutboxRun::default() {
        tracing::info!(
            "Calendar outbox: {} delivered, {} retrying, {} failed",
            run.delivered,
            run.retried,
            run.failed
        );
    }
    Ok(run)
}

#[derive(Debug, Serialize)]
pub struct PushResult {
    pub created: Option<CreatedEvent>,
    pub outbox_id: Option<i64>,
}

/// Try to create the event right away; queue it when that fails.
pub async fn push_or_enqueue(
    store: &Store,
    api: Option<&dyn CalendarApi>,
    booking_id: i64,
    event: &CalendarEvent,
) -> Result<PushResult, StoreError> {
    if let Some(api) = api {
        match api.create_event(event).await {
            Ok(created) => {
                if let Some(link) = created.meet_link.as_deref() {
                    store.set_meet_link(booking_id, link).await?;
                }
                return Ok(PushResult {
                    created: Some(created),
                    outbox_id: None,
                });
            }
            Err(e) => {
                tracing::warn!("Calendar event for booking {} deferred: {:#}", booking_id, e);
            }
        }
    }
    let outbox_id = store.enqueue_calendar_event(booking_id, event).await?;
    Ok(PushResult {
        created: None,
        outbox_id: Some(outbox_id),
    })
}
