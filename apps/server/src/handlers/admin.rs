//! Staff endpoints. Every route here sits behind `auth::require_admin`.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use std::sync::Arc;

use crate::{
    appointment::{self, AppointmentEditor, EditorMode},
    booking::BookingStore,
    calendar_sync::{self, CalendarEvent, PushResult},
    error::AppError,
    models::*,
    schedule::{CalendarSettings, LocalDate},
    AppState,
};

fn parse_optional_date(raw: Option<&str>) -> Result<Option<LocalDate>, AppError> {
    Ok(raw
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::parse::<LocalDate>)
        .transpose()?)
}

// ── Services ──

/// GET /api/admin/services: all services, hidden ones included.
pub async fn list_all_services(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ApiResponse<Vec<Service>>>, AppError> {
    let services = state.store.list_services(true).await?;
    Ok(Json(ApiResponse::success(services)))
}

/// POST /api/admin/services
pub async fn create_service(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateServiceRequest>,
) -> Result<(StatusCode, Json<ApiResponse<Service>>), AppError> {
    if body.title.values().all(|t| t.trim().is_empty()) {
        return Err(AppError::validation("Service needs a title"));
    }
    if body.duration_minutes <= 0 {
        return Err(AppError::validation("Duration must be positive"));
    }
    if body.price < 0 {
        return Err(AppError::validation("Price cannot be negative"));
    }

    let service = state.store.create_service(&body).await?;
    tracing::info!("Service {} created", service.id);
    Ok((StatusCode::CREATED, Json(ApiResponse::success(service))))
}

/// PUT /api/admin/services/{id}
pub async fn update_service(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<UpdateServiceRequest>,
) -> Result<Json<ApiResponse<Service>>, AppError> {
    if body.duration_minutes.is_some_and(|d| d <= 0) {
        return Err(AppError::validation("Duration must be positive"));
    }
    if body.price.is_some_and(|p| p < 0) {
        return Err(AppError::validation("Price cannot be negative"));
    }

    let service = state.store.update_service(id, &body).await?;
    Ok(Json(ApiResponse::success(service)))
}

// ── Calendar settings ──

/// GET /api/admin/calendar-settings: read straight from the database.
pub async fn get_calendar_settings(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ApiResponse<CalendarSettingsResponse>>, AppError> {
    let schedule = state.store.load_schedule().await?;
    let blocked_dates = state.store.list_blocked_dates().await?;
    Ok(Json(ApiResponse::success(CalendarSettingsResponse {
        settings: schedule.settings,
        blocked_dates,
    })))
}

/// PUT /api/admin/calendar-settings: replace settings and weekly template.
pub async fn update_calendar_settings(
    State(state): State<Arc<AppState>>,
    Json(settings): Json<CalendarSettings>,
) -> Result<Json<ApiResponse<CalendarSettings>>, AppError> {
    settings.validate()?;
    state.store.save_settings(&settings).await?;
    state.schedule.invalidate().await;
    tracing::info!("Calendar settings updated");
    Ok(Json(ApiResponse::success(settings)))
}

/// GET /api/admin/blocked-dates
pub async fn list_blocked_dates(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ApiResponse<Vec<BlockedDate>>>, AppError> {
    let dates = state.store.list_blocked_dates().await?;
    Ok(Json(ApiResponse::success(dates)))
}

/// POST /api/admin/blocked-dates
pub async fn add_blocked_date(
    State(state): State<Arc<AppState>>,
    Json(body): Json<BlockedDateRequest>,
) -> Result<(StatusCode, Json<ApiResponse<BlockedDate>>), AppError> {
    let date: LocalDate = body.date.trim().parse()?;
    let reason = body.reason.as_deref().map(str::trim).filter(|r| !r.is_empty());
    let blocked = state.store.add_blocked_date(date, reason).await?;
    state.schedule.invalidate().await;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(blocked))))
}

/// DELETE /api/admin/blocked-dates/{id}
pub async fn delete_blocked_date(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, AppError> {
    state.store.delete_blocked_date(id).await?;
    state.schedule.invalidate().await;
    Ok(StatusCode::NO_CONTENT)
}

// ── Bookings ──

/// GET /api/admin/bookings?date=&from=&to=
pub async fn list_bookings(
    State(state): State<Arc<AppState>>,
    Query(query): Query<BookingsQuery>,
) -> Result<Json<ApiResponse<Vec<Booking>>>, AppError> {
    let bookings = state
        .store
        .list_bookings(
            parse_optional_date(query.date.as_deref())?,
            parse_optional_date(query.from.as_deref())?,
            parse_optional_date(query.to.as_deref())?,
        )
        .await?;
    Ok(Json(ApiResponse::success(bookings)))
}

/// PATCH /api/admin/bookings/{id}/status
pub async fn update_booking_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<StatusUpdateRequest>,
) -> Result<Json<ApiResponse<Booking>>, AppError> {
    let booking = state.store.get_booking(id).await?;
    if !booking.status.can_transition_to(body.status) {
        return Err(AppError::validation(format!(
            "Cannot change booking {} from {} to {}",
            id,
            booking.status.as_str(),
            body.status.as_str()
        )));
    }
    if !state
        .store
        .set_booking_status(id, booking.status, body.status)
        .await?
    {
        return Err(AppError::Conflict(format!(
            "Booking {id} was changed by another request"
        )));
    }
    tracing::info!(
        "Booking {} moved {} -> {}",
        id,
        booking.status.as_str(),
        body.status.as_str()
    );
    let booking = state.store.get_booking(id).await?;
    Ok(Json(ApiResponse::success(booking)))
}

// ── Appointments ──

async fn save(
    state: &AppState,
    mode: EditorMode,
    body: &AppointmentRequest,
) -> Result<AppointmentResponse, AppError> {
    let appointment = AppointmentEditor::complete(mode, body)?;
    let saved = appointment::save_appointment(
        &state.store,
        &state.clock,
        &state.config.office_location,
        appointment,
    )
    .await?;
    Ok(AppointmentResponse {
        booking: saved.booking,
        calendar_event_queued: saved.calendar_event_queued,
    })
}

/// POST /api/admin/appointments: staff-created appointment, any date.
pub async fn create_appointment(
    State(state): State<Arc<AppState>>,
    Json(body): Json<AppointmentRequest>,
) -> Result<(StatusCode, Json<ApiResponse<AppointmentResponse>>), AppError> {
    let response = save(&state, EditorMode::Create, &body).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(response))))
}

/// PUT /api/admin/appointments/{id}
pub async fn update_appointment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(body): Json<AppointmentRequest>,
) -> Result<Json<ApiResponse<AppointmentResponse>>, AppError> {
    let response = save(&state, EditorMode::Edit(id), &body).await?;
    Ok(Json(ApiResponse::success(response)))
}

// ── Calendar events ──

/// POST /api/admin/calendar-events: create the event now, or queue it.
pub async fn push_calendar_event(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CalendarEventRequest>,
) -> Result<Json<ApiResponse<PushResult>>, AppError> {
    let booking = state.store.get_booking(body.booking_id).await?;
    let service = state.store.find_service(booking.service_id).await?;
    let title = service
        .as_ref()
        .map(Service::display_title)
        .unwrap_or("Consultation");
    let event = CalendarEvent::for_booking(
        &booking,
        title,
        &state.clock,
        &state.config.office_location,
    );

    let result = calendar_sync::push_or_enqueue(
        &state.store,
        state.calendar.as_deref(),
        booking.id,
        &event,
    )
    .await?;
    Ok(Json(ApiResponse::success(result)))
}

/// GET /api/admin/calendar-outbox
pub async fn list_outbox(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ApiResponse<Vec<OutboxEntry>>>, AppError> {
    let entries = state.store.list_outbox().await?;
    Ok(Json(ApiResponse::success(entries)))
}

/// POST /api/admin/calendar-outbox/{id}/retry: re-queue a failed entry.
pub async fn retry_outbox(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, AppError> {
    if state.store.retry_outbox(id).await? {
        tracing::info!("Outbox entry {} re-queued", id);
        Ok(StatusCode::ACCEPTED)
    } else {
        Err(AppError::not_found(format!("No failed outbox entry {id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::tests::d;

    #[test]
    fn test_parse_optional_date() {
        assert_eq!(parse_optional_date(None).unwrap(), None);
        assert_eq!(parse_optional_date(Some("  ")).unwrap(), None);
        assert_eq!(
            parse_optional_date(Some("2026-03-04")).unwrap(),
            Some(d("2026-03-04"))
        );
        assert!(parse_optional_date(Some("04.03.2026")).is_err());
    }
}
