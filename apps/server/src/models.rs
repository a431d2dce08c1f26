use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use uuid::Uuid;

use crate::schedule::{CalendarSettings, ClockTime, LocalDate};
use crate::session::{BookingSession, Confirmation, ContactForm, SelectedService, SlotsState, Step};

// ── Database models ──

/// Localized text keyed by language code (`en`, `de`, `fr`, ...).
pub type Localized = BTreeMap<String, String>;

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Service {
    pub id: i64,
    #[sqlx(json)]
    pub title: Localized,
    #[sqlx(json)]
    pub description: Localized,
    pub duration_minutes: i64,
    pub price: i64,
    pub is_active: bool,
    pub is_bookable: bool,
    pub sort_order: i64,
}

impl Service {
    /// Whether end users may schedule this service.
    pub fn is_offered(&self) -> bool {
        self.is_active && self.is_bookable
    }

    /// English title, or any title when no English one exists.
    pub fn display_title(&self) -> &str {
        self.title
            .get("en")
            .or_else(|| self.title.values().next())
            .map(String::as_str)
            .unwrap_or("Consultation")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
    NoShow,
}

impl BookingStatus {
    /// Admin-driven lifecycle: pending → confirmed → completed / no_show,
    /// with cancellation possible until the appointment is settled.
    pub fn can_transition_to(self, next: BookingStatus) -> bool {
        use BookingStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed)
                | (Pending, Cancelled)
                | (Confirmed, Completed)
                | (Confirmed, NoShow)
                | (Confirmed, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Completed => "completed",
            BookingStatus::NoShow => "no_show",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum PaymentStatus {
    Free,
    Pending,
    Paid,
    Failed,
    Refunded,
}

impl PaymentStatus {
    /// Initial payment status for a booking at `price`.
    pub fn for_price(price: i64) -> Self {
        if price == 0 {
            PaymentStatus::Free
        } else {
            PaymentStatus::Pending
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Booking {
    pub id: i64,
    pub name: String,
    pub email: String,
    pub topic: String,
    #[sqlx(try_from = "String")]
    pub date: LocalDate,
    #[sqlx(try_from = "String")]
    pub time: ClockTime,
    #[sqlx(try_from = "String")]
    pub end_time: ClockTime,
    pub user_id: Option<String>,
    pub status: BookingStatus,
    pub duration: i64,
    pub service_id: i64,
    pub is_online: bool,
    pub notes: String,
    pub price: i64,
    pub payment_status: PaymentStatus,
    pub stripe_session_id: Option<String>,
    pub meet_link: Option<String>,
    #[serde(skip_serializing)]
    pub idempotency_key: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BlockedDate {
    pub id: i64,
    #[sqlx(try_from = "String")]
    pub date: LocalDate,
    pub reason: Option<String>,
}

/// Singleton `calendar_settings` row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SettingsRow {
    pub slot_duration: i64,
    pub max_advance_booking_days: i64,
    pub min_advance_booking_hours: i64,
    pub lunch_break_enabled: bool,
    pub lunch_break_start: Option<String>,
    pub lunch_break_end: Option<String>,
}

/// One `working_hours` row; `weekday` counts from Monday = 0.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct WorkingHoursRow {
    pub weekday: i64,
    pub enabled: bool,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Done,
    Failed,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct OutboxEntry {
    pub id: i64,
    pub booking_id: i64,
    pub payload: String,
    pub status: OutboxStatus,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub next_attempt_at: String,
    pub created_at: String,
}

// ── API request/response types ──

/// `POST /api/bookings` body. `duration`, `price` and `payment_status` are
/// accepted for compatibility but recomputed from the service.
#[derive(Debug, Deserialize)]
pub struct CreateBookingRequest {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub topic: String,
    pub date: String,
    pub time: String,
    pub user_id: Option<String>,
    pub duration: Option<i64>,
    pub service_id: i64,
    pub specialization: Option<String>,
    #[serde(default)]
    pub is_online: bool,
    #[serde(default)]
    pub notes: String,
    pub price: Option<i64>,
    pub payment_status: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CreateBookingResponse {
    pub booking: Booking,
}

#[derive(Debug, Deserialize)]
pub struct CheckoutSessionRequest {
    #[serde(rename = "bookingId")]
    pub booking_id: i64,
}

#[derive(Debug, Serialize)]
pub struct CheckoutSessionResponse {
    pub url: String,
}

#[derive(Debug, Deserialize)]
pub struct DateQuery {
    pub date: String,
}

#[derive(Debug, Deserialize)]
pub struct CalendarQuery {
    pub year: i32,
    pub month: u32,
}

#[derive(Debug, Serialize)]
pub struct CalendarDay {
    pub date: LocalDate,
    pub available: bool,
    pub free_slots: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct SlotView {
    pub time: ClockTime,
    pub booked: bool,
}

#[derive(Debug, Serialize)]
pub struct AvailableTimesResponse {
    pub date: LocalDate,
    pub available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub slots: Vec<SlotView>,
}

#[derive(Debug, Serialize)]
pub struct CalendarSettingsResponse {
    pub settings: CalendarSettings,
    #[serde(rename = "blockedDates")]
    pub blocked_dates: Vec<BlockedDate>,
}

#[derive(Debug, Deserialize)]
pub struct CreateServiceRequest {
    pub title: Localized,
    #[serde(default)]
    pub description: Localized,
    pub duration_minutes: i64,
    pub price: i64,
    pub is_bookable: Option<bool>,
    pub sort_order: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateServiceRequest {
    pub title: Option<Localized>,
    pub description: Option<Localized>,
    pub duration_minutes: Option<i64>,
    pub price: Option<i64>,
    pub is_active: Option<bool>,
    pub is_bookable: Option<bool>,
    pub sort_order: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct BlockedDateRequest {
    pub date: String,
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BookingsQuery {
    pub date: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StatusUpdateRequest {
    pub status: BookingStatus,
}

/// Staff appointment form, replayed through the editor steps on the server.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppointmentRequest {
    pub name: String,
    pub email: String,
    pub service_id: Option<i64>,
    #[serde(default)]
    pub is_online: bool,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub topic: String,
    pub date: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    #[serde(default)]
    pub add_to_calendar: bool,
}

#[derive(Debug, Serialize)]
pub struct AppointmentResponse {
    pub booking: Booking,
    pub calendar_event_queued: bool,
}

#[derive(Debug, Deserialize)]
pub struct CalendarEventRequest {
    pub booking_id: i64,
}

/// Stripe webhook envelope; only the parts the handler reads.
#[derive(Debug, Deserialize)]
pub struct StripeEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub data: StripeEventData,
}

#[derive(Debug, Deserialize)]
pub struct StripeEventData {
    pub object: serde_json::Value,
}

#[derive(Debug, Deserialize)]
pub struct StripeCheckoutSession {
    pub id: String,
    pub url: Option<String>,
    /// `open`, `complete` or `expired`.
    #[serde(default)]
    pub status: Option<String>,
}

// ── Session API ──

#[derive(Debug, Deserialize)]
pub struct SelectServiceRequest {
    pub service_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct SelectDateRequest {
    pub date: String,
}

#[derive(Debug, Deserialize)]
pub struct SelectTimeRequest {
    pub time: String,
}

/// One offered slot; `booked` is null until the booked-slot lookup lands.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSlot {
    pub time: ClockTime,
    pub booked: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct SessionView {
    pub id: Uuid,
    pub step: Step,
    pub step_index: u8,
    pub service: Option<SelectedService>,
    pub date: Option<LocalDate>,
    pub time: Option<ClockTime>,
    pub slots_state: SlotsState,
    pub slots: Vec<SessionSlot>,
    pub form: ContactForm,
    pub confirmation: Option<Confirmation>,
    pub submitting: bool,
}

impl SessionView {
    pub fn new(id: Uuid, session: &BookingSession) -> Self {
        Self {
            id,
            step: session.step(),
            step_index: session.step().index(),
            service: session.service().cloned(),
            date: session.date(),
            time: session.time(),
            slots_state: session.slots_state(),
            slots: session
                .offered()
                .iter()
                .map(|&time| SessionSlot {
                    time,
                    booked: session.is_booked(time),
                })
                .collect(),
            form: session.form().clone(),
            confirmation: session.confirmation().cloned(),
            submitting: session.is_submitting(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub session: SessionView,
    pub booking: Booking,
    /// Set for paid services: the client continues at the payment page.
    pub checkout_url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ApiResponse<T: Serialize> {
    pub ok: bool,
    pub data: Option<T>,
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
            details: None,
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(msg.into()),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payment_status_for_price() {
        assert_eq!(PaymentStatus::for_price(0), PaymentStatus::Free);
        assert_eq!(PaymentStatus::for_price(150), PaymentStatus::Pending);
    }

    #[test]
    fn test_status_transitions() {
        use BookingStatus::*;
        assert!(Pending.can_transition_to(Confirmed));
        assert!(Confirmed.can_transition_to(NoShow));
        assert!(Confirmed.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Confirmed));
        assert!(!Completed.can_transition_to(Cancelled));
        assert!(!Pending.can_transition_to(Completed));
    }

    #[test]
    fn test_display_title_prefers_english() {
        let mut title = Localized::new();
        title.insert("de".into(), "Beratung".into());
        let mut service = Service {
            id: 1,
            title,
            description: Localized::new(),
            duration_minutes: 60,
            price: 0,
            is_active: true,
            is_bookable: true,
            sort_order: 0,
        };
        assert_eq!(service.display_title(), "Beratung");
        service.title.insert("en".into(), "Consulting".into());
        assert_eq!(service.display_title(), "Consulting");
    }

    #[test]
    fn test_error_envelope_shape() {
        let body = serde_json::to_value(ApiResponse::<()>::error("boom").with_details("id 4")).unwrap();
        assert_eq!(body["ok"], false);
        assert_eq!(body["error"], "boom");
        assert_eq!(body["details"], "id 4");
    }
}
