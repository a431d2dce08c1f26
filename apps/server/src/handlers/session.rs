//! Booking stepper over HTTP. Every call returns the session as it stands
//! afterwards; a refused transition answers 400 and leaves it unchanged.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::{
    booking::{self, BookingStore, SubmitOutcome},
    error::AppError,
    models::*,
    schedule::{ClockTime, LocalDate},
    session::{BookingSession, ContactForm, SelectedService, SessionError, SlotContext},
    AppState,
};

type SessionResult = Result<Json<ApiResponse<SessionView>>, AppError>;

fn session_not_found(id: Uuid) -> AppError {
    AppError::not_found(format!("Session {id} not found"))
}

/// Apply `f` to the stored session and render the result.
fn mutate<R>(
    state: &AppState,
    id: Uuid,
    f: impl FnOnce(&mut BookingSession) -> Result<R, SessionError>,
) -> Result<(R, SessionView), AppError> {
    let outcome = state
        .sessions
        .update(id, |session| f(session).map(|r| (r, SessionView::new(id, session))))
        .ok_or_else(|| session_not_found(id))?;
    Ok(outcome?)
}

fn respond(view: SessionView) -> SessionResult {
    Ok(Json(ApiResponse::success(view)))
}

// ── Endpoints ──

/// POST /api/sessions
pub async fn create_session(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<ApiResponse<SessionView>>) {
    let (id, session) = state.sessions.create();
    tracing::debug!("Booking session {} opened ({} active)", id, state.sessions.len());
    (
        StatusCode::CREATED,
        Json(ApiResponse::success(SessionView::new(id, &session))),
    )
}

/// GET /api/sessions/{id}
pub async fn get_session(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> SessionResult {
    let session = state
        .sessions
        .snapshot(id)
        .ok_or_else(|| session_not_found(id))?;
    respond(SessionView::new(id, &session))
}

/// DELETE /api/sessions/{id}
pub async fn delete_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    if state.sessions.remove(id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(session_not_found(id))
    }
}

/// PUT /api/sessions/{id}/service
pub async fn select_service(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<SelectServiceRequest>,
) -> SessionResult {
    let service = state
        .store
        .find_service(body.service_id)
        .await?
        .filter(Service::is_offered)
        .ok_or_else(|| AppError::not_found(format!("Service {} not found", body.service_id)))?;
    let selected = SelectedService::from(&service);

    let ((), view) = mutate(&state, id, |s| s.select_service(selected))?;
    respond(view)
}

/// PUT /api/sessions/{id}/date: select a date and load its booked slots.
///
/// The lookup runs without holding the session; its result is applied only
/// if the session still waits for that exact lookup.
pub async fn select_date(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<SelectDateRequest>,
) -> SessionResult {
    let date: LocalDate = body.date.trim().parse()?;
    let schedule = state.schedule.get(&state.store).await?;
    let ctx = SlotContext {
        schedule: &schedule,
        today: state.clock.today(),
        now: state.clock.now(),
        policy: state.config.policy,
    };
    let (fetch, _) = mutate(&state, id, |s| s.select_date(date, &ctx))?;

    let result = state.store.booked_slots(fetch.date).await;
    let applied = state
        .sessions
        .update(id, |s| s.apply_booked_slots(fetch, result))
        .ok_or_else(|| session_not_found(id))?;
    if !applied {
        tracing::debug!("Session {} moved on before slots for {} arrived", id, fetch.date);
    }

    get_session(State(state), Path(id)).await
}

/// PUT /api/sessions/{id}/time
pub async fn select_time(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<SelectTimeRequest>,
) -> SessionResult {
    let time: ClockTime = body.time.trim().parse()?;
    let ((), view) = mutate(&state, id, |s| s.select_time(time))?;
    respond(view)
}

/// PUT /api/sessions/{id}/details
pub async fn update_details(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(form): Json<ContactForm>,
) -> SessionResult {
    let ((), view) = mutate(&state, id, |s| s.update_details(form))?;
    respond(view)
}

/// POST /api/sessions/{id}/next
pub async fn next_step(State(state): State<Arc<AppState>>, Path(id): Path<Uuid>) -> SessionResult {
    let schedule = state.schedule.get(&state.store).await?;
    let ctx = SlotContext {
        schedule: &schedule,
        today: state.clock.today(),
        now: state.clock.now(),
        policy: state.config.policy,
    };
    let (_, view) = mutate(&state, id, |s| s.advance(&ctx))?;
    respond(view)
}

/// POST /api/sessions/{id}/back
pub async fn previous_step(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> SessionResult {
    let (_, view) = mutate(&state, id, BookingSession::back)?;
    respond(view)
}

/// POST /api/sessions/{id}/book-another
pub async fn book_another(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> SessionResult {
    let ((), view) = mutate(&state, id, BookingSession::book_another)?;
    respond(view)
}

/// POST /api/sessions/{id}/submit: persist the booking.
///
/// The date and time are checked against the current schedule first; a
/// date blocked or a slot expired since `/next` answers 400 and the session
/// stays on the details step. Free services confirm the session; paid ones
/// return a checkout URL and keep the session on the details step. A second
/// submit while one is in flight answers 409.
pub async fn submit(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<SubmitResponse>>, AppError> {
    let schedule = state.schedule.get(&state.store).await?;
    let ctx = SlotContext {
        schedule: &schedule,
        today: state.clock.today(),
        now: state.clock.now(),
        policy: state.config.policy,
    };

    mutate(&state, id, BookingSession::begin_submit)?;
    let Some(mut working) = state.sessions.snapshot(id) else {
        return Err(session_not_found(id));
    };

    let result = booking::submit(
        &mut working,
        &ctx,
        &state.store,
        state.checkout.as_ref(),
        super::idempotency_key(&headers),
    )
    .await;

    match result {
        Ok(outcome) => {
            working.end_submit();
            let view = SessionView::new(id, &working);
            state.sessions.finish_submit(id, working);
            let (booking, checkout_url) = match outcome {
                SubmitOutcome::Checkout { booking, url } => (booking, Some(url)),
                SubmitOutcome::Confirmed { booking, .. } => (booking, None),
            };
            Ok(Json(ApiResponse::success(SubmitResponse {
                session: view,
                booking,
                checkout_url,
            })))
        }
        Err(e) => {
            state.sessions.update(id, BookingSession::end_submit);
            Err(e.into())
        }
    }
}
