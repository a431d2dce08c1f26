use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use std::sync::Arc;

use crate::{
    booking::{self, BookingStore, StoreError},
    error::AppError,
    models::*,
    schedule::{ClockTime, LocalDate},
    session::{is_valid_email, SessionError, SlotContext, SubmissionDraft},
    AppState,
};

/// First and last day of a month.
fn month_bounds(year: i32, month: u32) -> Option<(LocalDate, LocalDate)> {
    let first = LocalDate::from_ymd(year, month, 1)?;
    let next = if month == 12 {
        LocalDate::from_ymd(year + 1, 1, 1)?
    } else {
        LocalDate::from_ymd(year, month + 1, 1)?
    };
    Some((first, next.add_days(-1)))
}

// ── Endpoints ──

/// GET /api/services: bookable services in display order.
pub async fn list_services(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ApiResponse<Vec<Service>>>, AppError> {
    let services = state.store.list_services(false).await?;
    Ok(Json(ApiResponse::success(services)))
}

/// GET /api/calendar-settings: weekly template, lunch break and blocked dates.
pub async fn calendar_settings(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ApiResponse<CalendarSettingsResponse>>, AppError> {
    let schedule = state.schedule.get(&state.store).await?;
    let blocked_dates = state.store.list_blocked_dates().await?;
    Ok(Json(ApiResponse::success(CalendarSettingsResponse {
        settings: schedule.settings.clone(),
        blocked_dates,
    })))
}

/// GET /api/booked-slots?date=YYYY-MM-DD: start times already taken.
pub async fn booked_slots(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DateQuery>,
) -> Result<Json<ApiResponse<Vec<ClockTime>>>, AppError> {
    let date: LocalDate = query.date.trim().parse()?;
    let times = state.store.booked_slots(date).await?;
    Ok(Json(ApiResponse::success(times)))
}

/// GET /api/available-times?date=YYYY-MM-DD: the slot grid with booked flags.
pub async fn available_times(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DateQuery>,
) -> Result<Json<ApiResponse<AvailableTimesResponse>>, AppError> {
    let date: LocalDate = query.date.trim().parse()?;
    let schedule = state.schedule.get(&state.store).await?;

    if let Err(reason) = schedule.check_date(date, state.clock.today()) {
        return Ok(Json(ApiResponse::success(AvailableTimesResponse {
            date,
            available: false,
            reason: Some(reason.to_string()),
            slots: vec![],
        })));
    }

    let booked = state.store.booked_slots(date).await?;
    let slots = schedule
        .slots_for(date, state.clock.now(), state.config.policy)
        .into_iter()
        .map(|time| SlotView {
            time,
            booked: booked.contains(&time),
        })
        .collect();

    Ok(Json(ApiResponse::success(AvailableTimesResponse {
        date,
        available: true,
        reason: None,
        slots,
    })))
}

/// GET /api/calendar?year=2026&month=3: availability and free slot count per day.
///
/// Booked slots for the whole month come from a single query.
pub async fn calendar(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CalendarQuery>,
) -> Result<Json<ApiResponse<Vec<CalendarDay>>>, AppError> {
    let (first, last) = month_bounds(query.year, query.month)
        .ok_or_else(|| AppError::validation(format!("Invalid month {}-{}", query.year, query.month)))?;

    let schedule = state.schedule.get(&state.store).await?;
    let booked = state.store.booked_slots_between(first, last).await?;
    let today = state.clock.today();
    let now = state.clock.now();

    let mut days = Vec::new();
    let mut date = first;
    while date <= last {
        let available = schedule.is_date_available(date, today);
        let free_slots = if available {
            let taken = booked.get(&date);
            schedule
                .slots_for(date, now, state.config.policy)
                .into_iter()
                .filter(|t| taken.is_none_or(|set| !set.contains(t)))
                .count()
        } else {
            0
        };
        days.push(CalendarDay {
            date,
            available,
            free_slots,
        });
        date = date.add_days(1);
    }

    Ok(Json(ApiResponse::success(days)))
}

/// POST /api/bookings: create a booking for a free slot.
///
/// Price, duration and payment status always come from the service.
/// With an `Idempotency-Key` header a repeated request returns the booking
/// created the first time (200 instead of 201).
pub async fn create_booking(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateBookingRequest>,
) -> Result<(StatusCode, Json<ApiResponse<CreateBookingResponse>>), AppError> {
    let name = body.name.trim();
    if name.is_empty() {
        return Err(SessionError::MissingField("name").into());
    }
    let email = body.email.trim();
    if !is_valid_email(email) {
        return Err(SessionError::InvalidEmail.into());
    }
    let date: LocalDate = body.date.trim().parse()?;
    let time: ClockTime = body.time.trim().parse()?;

    let schedule = state.schedule.get(&state.store).await?;
    SlotContext {
        schedule: &schedule,
        today: state.clock.today(),
        now: state.clock.now(),
        policy: state.config.policy,
    }
    .check_slot(date, time)?;
    // A keyed retry finds its own booking in the slot; the insert resolves it.
    let idempotency_key = super::idempotency_key(&headers);
    if idempotency_key.is_none() && state.store.booked_slots(date).await?.contains(&time) {
        return Err(StoreError::SlotTaken {
            date: date.to_string(),
            time: time.to_string(),
        }
        .into());
    }

    if body.price.is_some() || body.duration.is_some() || body.payment_status.is_some() {
        tracing::debug!("Ignoring client-supplied price/duration/payment_status");
    }
    let topic = match body.specialization.as_deref() {
        Some(area) if body.topic.trim().is_empty() => area.trim().to_string(),
        _ => body.topic.trim().to_string(),
    };

    let draft = SubmissionDraft {
        service_id: body.service_id,
        date,
        time,
        name: name.to_string(),
        email: email.to_string(),
        topic,
        notes: body.notes.trim().to_string(),
        is_online: body.is_online,
    };
    let placement = booking::place_booking(
        &state.store,
        &draft,
        body.user_id.filter(|u| !u.trim().is_empty()),
        idempotency_key,
    )
    .await?;

    let status = if placement.replayed {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((
        status,
        Json(ApiResponse::success(CreateBookingResponse {
            booking: placement.booking,
        })),
    ))
}

/// POST /api/checkout-session: start payment for a pending booking.
pub async fn create_checkout_session(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CheckoutSessionRequest>,
) -> Result<Json<ApiResponse<CheckoutSessionResponse>>, AppError> {
    let booking = state.store.get_booking(body.booking_id).await?;
    if booking.payment_status != PaymentStatus::Pending || booking.status != BookingStatus::Pending {
        return Err(AppError::validation(format!(
            "Booking {} is not awaiting payment",
            booking.id
        )));
    }

    let service = state.store.find_service(booking.service_id).await?;
    let title = service
        .as_ref()
        .map(Service::display_title)
        .unwrap_or("Consultation");

    let url =
        booking::start_checkout(&state.store, state.checkout.as_ref(), &booking, title).await?;
    Ok(Json(ApiResponse::success(CheckoutSessionResponse { url })))
}
