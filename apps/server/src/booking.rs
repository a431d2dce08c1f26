//! Booking submission: persist, then either hand off to checkout or confirm.

use async_trait::async_trait;
use thiserror::Error;

use crate::models::{Booking, BookingStatus, PaymentStatus, Service};
use crate::schedule::{ClockTime, LocalDate};
use crate::session::{BookingSession, Confirmation, SessionError, SlotContext, SubmissionDraft};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{date} at {time} is already booked")]
    SlotTaken { date: String, time: String },
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("booking {0} is already paid; its service cannot change")]
    PaymentSettled(i64),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("invalid stored payload: {0}")]
    Payload(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("service {0} is not available for booking")]
    ServiceUnavailable(i64),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("checkout for booking {booking_id} failed: {source}")]
    Checkout {
        booking_id: i64,
        source: anyhow::Error,
    },
}

/// Row to insert; price and duration always come from the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBooking {
    pub name: String,
    pub email: String,
    pub topic: String,
    pub date: LocalDate,
    pub time: ClockTime,
    pub end_time: ClockTime,
    pub user_id: Option<String>,
    pub status: BookingStatus,
    pub duration: i64,
    pub service_id: i64,
    pub is_online: bool,
    pub notes: String,
    pub price: i64,
    pub payment_status: PaymentStatus,
    pub idempotency_key: Option<String>,
}

impl NewBooking {
    pub fn from_draft(
        draft: &SubmissionDraft,
        service: &Service,
        user_id: Option<String>,
        idempotency_key: Option<String>,
    ) -> Self {
        let duration = service.duration_minutes.max(0);
        Self {
            name: draft.name.clone(),
            email: draft.email.clone(),
            topic: draft.topic.clone(),
            date: draft.date,
            time: draft.time,
            end_time: draft.time.saturating_add_minutes(duration as u32),
            user_id,
            status: BookingStatus::Pending,
            duration,
            service_id: service.id,
            is_online: draft.is_online,
            notes: draft.notes.clone(),
            price: service.price,
            payment_status: PaymentStatus::for_price(service.price),
            idempotency_key,
        }
    }
}

/// Result of an insert. `replayed` is set when the idempotency key matched
/// an earlier booking and nothing new was written.
#[derive(Debug, Clone)]
pub struct Placement {
    pub booking: Booking,
    pub service: Service,
    pub replayed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutRequest {
    pub booking_id: i64,
    pub title: String,
    /// Major currency units.
    pub amount: i64,
    pub customer_email: String,
    pub date: LocalDate,
    pub time: ClockTime,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSession {
    pub id: String,
    pub url: String,
}

#[async_trait]
pub trait BookingStore: Send + Sync {
    /// The service if it exists, regardless of whether it is offered.
    async fn find_service(&self, id: i64) -> Result<Option<Service>, StoreError>;
    /// Start times of non-cancelled bookings on `date`.
    async fn booked_slots(&self, date: LocalDate) -> Result<Vec<ClockTime>, StoreError>;
    /// Insert, or return the booking already stored under the same idempotency key.
    async fn insert_booking(&self, booking: &NewBooking) -> Result<(Booking, bool), StoreError>;
    async fn attach_checkout_session(
        &self,
        booking_id: i64,
        session_id: &str,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait CheckoutProvider: Send + Sync {
    async fn create_checkout(&self, request: &CheckoutRequest) -> anyhow::Result<CheckoutSession>;

    /// An earlier checkout session if the customer can still pay through it.
    async fn resume_checkout(&self, _session_id: &str) -> anyhow::Result<Option<CheckoutSession>> {
        Ok(None)
    }
}

#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    /// Paid service: the client continues at `url`; the session stays on the details step.
    Checkout { booking: Booking, url: String },
    /// Free service: the session is now confirmed.
    Confirmed {
        booking: Booking,
        confirmation: Confirmation,
    },
}

/// Resolve the service and persist the booking.
pub async fn place_booking(
    store: &dyn BookingStore,
    draft: &SubmissionDraft,
    user_id: Option<String>,
    idempotency_key: Option<String>,
) -> Result<Placement, SubmitError> {
    let service = store
        .find_service(draft.service_id)
        .await?
        .filter(Service::is_offered)
        .ok_or(SubmitError::ServiceUnavailable(draft.service_id))?;

    let new_booking = NewBooking::from_draft(draft, &service, user_id, idempotency_key);
    let (booking, replayed) = store.insert_booking(&new_booking).await?;
    if replayed {
        tracing::info!("Idempotent replay for booking {}", booking.id);
    } else {
        tracing::info!(
            "Booking {} created for {} {} (service {}, price {})",
            booking.id,
            booking.date,
            booking.time,
            service.id,
            service.price
        );
    }
    Ok(Placement {
        booking,
        service,
        replayed,
    })
}

/// Checkout URL for a pending-payment booking.
///
/// A session already attached to the booking is reused while it is open;
/// otherwise a new one is created and its id stored.
pub async fn start_checkout(
    store: &dyn BookingStore,
    checkout: &dyn CheckoutProvider,
    booking: &Booking,
    title: &str,
) -> Result<String, SubmitError> {
    if let Some(existing) = booking.stripe_session_id.as_deref() {
        let resumed = checkout
            .resume_checkout(existing)
            .await
            .map_err(|source| SubmitError::Checkout {
                booking_id: booking.id,
                source,
            })?;
        if let Some(session) = resumed {
            tracing::info!("Reusing checkout {} for booking {}", session.id, booking.id);
            return Ok(session.url);
        }
    }

    let request = CheckoutRequest {
        booking_id: booking.id,
        title: title.to_string(),
        amount: booking.price,
        customer_email: booking.email.clone(),
        date: booking.date,
        time: booking.time,
    };
    let session = checkout
        .create_checkout(&request)
        .await
        .map_err(|source| SubmitError::Checkout {
            booking_id: booking.id,
            source,
        })?;

    if let Err(e) = store.attach_checkout_session(booking.id, &session.id).await {
        tracing::error!(
            "Failed to save checkout session for booking {}: {}",
            booking.id,
            e
        );
    }
    Ok(session.url)
}

/// Persist the session's booking and branch on price.
///
/// The chosen date and time are checked again against `ctx`, since the
/// schedule may have changed after the session left the date step.
/// Any error leaves the session on the details step with its data intact.
/// A checkout failure leaves the booking `pending` for reconciliation.
pub async fn submit(
    session: &mut BookingSession,
    ctx: &SlotContext<'_>,
    store: &dyn BookingStore,
    checkout: &dyn CheckoutProvider,
    idempotency_key: Option<String>,
) -> Result<SubmitOutcome, SubmitError> {
    let draft = session.submission()?;
    ctx.check_slot(draft.date, draft.time)?;
    let placement = place_booking(store, &draft, None, idempotency_key).await?;
    let booking = placement.booking;

    if booking.payment_status == PaymentStatus::Pending {
        let url = start_checkout(store, checkout, &booking, placement.service.display_title()).await?;
        return Ok(SubmitOutcome::Checkout { booking, url });
    }

    let confirmation = Confirmation {
        booking_id: booking.id,
        date: booking.date,
        time: booking.time,
        service_title: placement.service.display_title().to_string(),
        price: booking.price,
        payment_status: booking.payment_status,
    };
    session.confirm(confirmation.clone());
    Ok(SubmitOutcome::Confirmed {
        booking,
        confirmation,
    })
}
