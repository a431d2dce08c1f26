//! Staff-side appointment editor.
//!
//! Four steps: client info → service and mode → date/time → confirm. Staff
//! may put an appointment on any date; the working-hours template is not
//! consulted, only the booking uniqueness index applies.

use serde::Serialize;
use thiserror::Error;

use crate::booking::{BookingStore, NewBooking, StoreError};
use crate::calendar_sync::CalendarEvent;
use crate::models::{AppointmentRequest, Booking, BookingStatus, PaymentStatus};
use crate::schedule::{BusinessClock, ClockTime, LocalDate, ScheduleError};
use crate::session::is_valid_email;
use crate::store::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EditorStep {
    ClientInfo,
    ServiceAndMode,
    DateTime,
    Confirm,
}

impl EditorStep {
    pub fn number(self) -> u8 {
        match self {
            EditorStep::ClientInfo => 1,
            EditorStep::ServiceAndMode => 2,
            EditorStep::DateTime => 3,
            EditorStep::Confirm => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditorMode {
    Create,
    Edit(i64),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EditorError {
    #[error("client name is required")]
    MissingName,
    #[error("client email is invalid")]
    InvalidEmail,
    #[error("select a service")]
    MissingService,
    #[error("date, start time and end time are required")]
    MissingDateTime,
    #[error("end time must be after start time")]
    EndNotAfterStart,
    #[error("calendar events can only be added to new appointments")]
    CalendarOnlyOnCreate,
    #[error("appointment is incomplete (step {})", .0.number())]
    Incomplete(EditorStep),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AppointmentForm {
    pub name: String,
    pub email: String,
    pub service_id: Option<i64>,
    pub is_online: bool,
    pub notes: String,
    pub topic: String,
    pub date: Option<LocalDate>,
    pub start_time: Option<ClockTime>,
    pub end_time: Option<ClockTime>,
}

impl TryFrom<&AppointmentRequest> for AppointmentForm {
    type Error = EditorError;

    fn try_from(req: &AppointmentRequest) -> Result<Self, Self::Error> {
        let date = req.date.as_deref().map(str::parse).transpose()?;
        let start_time = req.start_time.as_deref().map(str::parse).transpose()?;
        let end_time = req.end_time.as_deref().map(str::parse).transpose()?;
        Ok(Self {
            name: req.name.trim().to_string(),
            email: req.email.trim().to_string(),
            service_id: req.service_id,
            is_online: req.is_online,
            notes: req.notes.trim().to_string(),
            topic: req.topic.trim().to_string(),
            date,
            start_time,
            end_time,
        })
    }
}

#[derive(Debug, Clone)]
pub struct AppointmentEditor {
    mode: EditorMode,
    step: EditorStep,
    add_to_calendar: bool,
    pub form: AppointmentForm,
}

/// A form that passed every step, ready to be saved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Appointment {
    pub mode: EditorMode,
    pub name: String,
    pub email: String,
    pub service_id: i64,
    pub is_online: bool,
    pub notes: String,
    pub topic: String,
    pub date: LocalDate,
    pub start: ClockTime,
    pub end: ClockTime,
    pub add_to_calendar: bool,
}

impl AppointmentEditor {
    pub fn new(mode: EditorMode, form: AppointmentForm) -> Self {
        Self {
            mode,
            step: EditorStep::ClientInfo,
            add_to_calendar: false,
            form,
        }
    }

    pub fn step(&self) -> EditorStep {
        self.step
    }

    pub fn next(&mut self) -> Result<EditorStep, EditorError> {
        self.step = match self.step {
            EditorStep::ClientInfo => {
                if self.form.name.trim().is_empty() {
                    return Err(EditorError::MissingName);
                }
                if !is_valid_email(&self.form.email) {
                    return Err(EditorError::InvalidEmail);
                }
                EditorStep::ServiceAndMode
            }
            EditorStep::ServiceAndMode => {
                if self.form.service_id.is_none() {
                    return Err(EditorError::MissingService);
                }
                EditorStep::DateTime
            }
            EditorStep::DateTime => {
                self.time_range()?;
                EditorStep::Confirm
            }
            EditorStep::Confirm => EditorStep::Confirm,
        };
        Ok(self.step)
    }

    pub fn back(&mut self) -> EditorStep {
        self.step = match self.step {
            EditorStep::ClientInfo | EditorStep::ServiceAndMode => EditorStep::ClientInfo,
            EditorStep::DateTime => EditorStep::ServiceAndMode,
            EditorStep::Confirm => EditorStep::DateTime,
        };
        self.step
    }

    pub fn set_add_to_calendar(&mut self, enabled: bool) -> Result<(), EditorError> {
        if enabled && self.mode != EditorMode::Create {
            return Err(EditorError::CalendarOnlyOnCreate);
        }
        self.add_to_calendar = enabled;
        Ok(())
    }

    fn time_range(&self) -> Result<(LocalDate, ClockTime, ClockTime), EditorError> {
        let (Some(date), Some(start), Some(end)) =
            (self.form.date, self.form.start_time, self.form.end_time)
        else {
            return Err(EditorError::MissingDateTime);
        };
        if start.minutes_until(end).is_none() {
            return Err(EditorError::EndNotAfterStart);
        }
        Ok((date, start, end))
    }

    pub fn finish(&self) -> Result<Appointment, EditorError> {
        if self.step != EditorStep::Confirm {
            return Err(EditorError::Incomplete(self.step));
        }
        let (date, start, end) = self.time_range()?;
        let service_id = self.form.service_id.ok_or(EditorError::MissingService)?;
        Ok(Appointment {
            mode: self.mode,
            name: self.form.name.trim().to_string(),
            email: self.form.email.trim().to_string(),
            service_id,
            is_online: self.form.is_online,
            notes: self.form.notes.clone(),
            topic: self.form.topic.clone(),
            date,
            start,
            end,
            add_to_calendar: self.add_to_calendar,
        })
    }

    /// Walk every step with the submitted form, as the admin UI does.
    pub fn complete(
        mode: EditorMode,
        request: &AppointmentRequest,
    ) -> Result<Appointment, EditorError> {
        let mut editor = Self::new(mode, AppointmentForm::try_from(request)?);
        while editor.step != EditorStep::Confirm {
            editor.next()?;
        }
        editor.set_add_to_calendar(request.add_to_calendar)?;
        editor.finish()
    }
}

pub struct SavedAppointment {
    pub booking: Booking,
    pub calendar_event_queued: bool,
}

/// Persist the appointment and, for new ones with the toggle on, queue the calendar event.
pub async fn save_appointment(
    store: &Store,
    clock: &BusinessClock,
    office_location: &str,
    appointment: Appointment,
) -> Result<SavedAppointment, StoreError> {
    let service = store
        .find_service(appointment.service_id)
        .await?
        .ok_or(StoreError::NotFound("service"))?;

    let duration = appointment
        .start
        .minutes_until(appointment.end)
        .map(i64::from)
        .unwrap_or(service.duration_minutes);
    let row = NewBooking {
        name: appointment.name,
        email: appointment.email,
        topic: appointment.topic,
        date: appointment.date,
        time: appointment.start,
        end_time: appointment.end,
        user_id: None,
        status: BookingStatus::Confirmed,
        duration,
        service_id: service.id,
        is_online: appointment.is_online,
        notes: appointment.notes,
        price: service.price,
        payment_status: PaymentStatus::for_price(service.price),
        idempotency_key: None,
    };

    let booking = match appointment.mode {
        EditorMode::Create => store.insert_booking(&row).await?.0,
        EditorMode::Edit(id) => store.update_appointment(id, &row).await?,
    };
    tracing::info!("Appointment {} saved for {} {}", booking.id, booking.date, booking.time);

    let mut calendar_event_queued = false;
    if appointment.mode == EditorMode::Create && appointment.add_to_calendar {
        let event = CalendarEvent::for_booking(&booking, service.display_title(), clock, office_location);
        match store.enqueue_calendar_event(booking.id, &event).await {
            Ok(id) => {
                tracing::info!("Calendar event queued (outbox {}) for booking {}", id, booking.id);
                calendar_event_queued = true;
            }
            Err(e) => {
                tracing::error!("Failed to queue calendar event for booking {}: {}", booking.id, e);
            }
        }
    }

    Ok(SavedAppointment {
        booking,
        calendar_event_queued,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::tests::{d, t};

    fn request() -> AppointmentRequest {
        AppointmentRequest {
            name: "Ana".into(),
            email: "ana@example.com".into(),
            service_id: Some(1),
            date: Some("2026-03-07".into()),
            start_time: Some("10:00".into()),
            end_time: Some("11:30".into()),
            ..Default::default()
        }
    }

    #[test]
    fn test_steps_require_their_fields() {
        let mut editor = AppointmentEditor::new(EditorMode::Create, AppointmentForm::default());
        assert_eq!(editor.next(), Err(EditorError::MissingName));
        editor.form.name = "Ana".into();
        editor.form.email = "ana".into();
        assert_eq!(editor.next(), Err(EditorError::InvalidEmail));
        editor.form.email = "ana@example.com".into();
        assert_eq!(editor.next(), Ok(EditorStep::ServiceAndMode));

        assert_eq!(editor.next(), Err(EditorError::MissingService));
        editor.form.service_id = Some(4);
        assert_eq!(editor.next(), Ok(EditorStep::DateTime));

        editor.form.date = Some(d("2026-03-04"));
        editor.form.start_time = Some(t("10:00"));
        assert_eq!(editor.next(), Err(EditorError::MissingDateTime));
        editor.form.end_time = Some(t("10:00"));
        assert_eq!(editor.next(), Err(EditorError::EndNotAfterStart));
        editor.form.end_time = Some(t("11:00"));
        assert_eq!(editor.next(), Ok(EditorStep::Confirm));
        assert_eq!(editor.step().number(), 4);
    }

    #[test]
    fn test_back_stops_at_first_step() {
        let mut editor = AppointmentEditor::new(EditorMode::Create, AppointmentForm::default());
        assert_eq!(editor.back(), EditorStep::ClientInfo);
        editor.form.name = "Ana".into();
        editor.form.email = "ana@example.com".into();
        editor.next().unwrap();
        assert_eq!(editor.back(), EditorStep::ClientInfo);
        assert_eq!(editor.form.name, "Ana");
    }

    #[test]
    fn test_calendar_toggle_only_on_create() {
        let mut editor = AppointmentEditor::new(EditorMode::Edit(9), AppointmentForm::default());
        assert_eq!(
            editor.set_add_to_calendar(true),
            Err(EditorError::CalendarOnlyOnCreate)
        );
        assert!(editor.set_add_to_calendar(false).is_ok());
    }

    #[test]
    fn test_finish_requires_confirm_step() {
        let editor = AppointmentEditor::new(EditorMode::Create, AppointmentForm::default());
        assert_eq!(
            editor.finish(),
            Err(EditorError::Incomplete(EditorStep::ClientInfo))
        );
    }

    #[test]
    fn test_complete_allows_any_date() {
        // 2026-03-07 is a Saturday; staff may still book it.
        let appointment = AppointmentEditor::complete(EditorMode::Create, &request()).unwrap();
        assert_eq!(appointment.date, d("2026-03-07"));
        assert_eq!(appointment.end, t("11:30"));
        assert!(!appointment.add_to_calendar);
    }

    #[test]
    fn test_complete_rejects_bad_time() {
        let mut req = request();
        req.start_time = Some("25:00".into());
        assert!(matches!(
            AppointmentEditor::complete(EditorMode::Create, &req),
            Err(EditorError::Schedule(ScheduleError::InvalidTime(_)))
        ));
    }

    #[test]
    fn test_complete_rejects_calendar_on_edit() {
        let mut req = request();
        req.add_to_calendar = true;
        assert_eq!(
            AppointmentEditor::complete(EditorMode::Edit(3), &req),
            Err(EditorError::CalendarOnlyOnCreate)
        );
        assert!(AppointmentEditor::complete(EditorMode::Create, &req)
            .unwrap()
            .add_to_calendar);
    }

    #[tokio::test]
    async fn test_paid_appointment_survives_payment_expiry() {
        use crate::store::tests::{memory_store, new_booking};
        use chrono::{FixedOffset, Utc};

        let store = memory_store().await;
        let clock = BusinessClock::new(FixedOffset::east_opt(3600).unwrap());
        let mut req = request();
        req.service_id = Some(2);
        let appointment = AppointmentEditor::complete(EditorMode::Create, &req).unwrap();
        let saved = save_appointment(&store, &clock, "Office", appointment)
            .await
            .unwrap();
        assert_eq!(saved.booking.status, BookingStatus::Confirmed);
        assert_eq!(saved.booking.payment_status, PaymentStatus::Pending);

        let mut unpaid = new_booking("2026-03-09", "10:00");
        unpaid.service_id = 2;
        unpaid.price = 150;
        unpaid.payment_status = PaymentStatus::Pending;
        let (unpaid, _) = store.insert_booking(&unpaid).await.unwrap();

        let later = Utc::now() + chrono::Duration::hours(2);
        assert_eq!(store.expire_pending_payments(later).await.unwrap(), vec![unpaid.id]);

        let kept = store.get_booking(saved.booking.id).await.unwrap();
        assert_eq!(kept.status, BookingStatus::Confirmed);
        assert_eq!(kept.payment_status, PaymentStatus::Pending);
        assert_eq!(
            store.booked_slots(d("2026-03-07")).await.unwrap(),
            vec![t("10:00")]
        );
    }
}
