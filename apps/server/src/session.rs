//! Booking stepper: service → date/time → contact details → confirmed.
//!
//! Sessions live server-side in a [`SessionRegistry`]. Booked-slot lookups
//! for a date are issued with a [`SlotFetch`] ticket; a response is applied
//! only if its ticket still matches the session's current date and
//! generation, so a slow answer for a previously selected date can never
//! land on the grid of the date selected after it.

use chrono::NaiveDateTime;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::Display;
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{PaymentStatus, Service};
use crate::schedule::{ClockTime, DateRejection, LocalDate, Schedule, SchedulePolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    SelectService,
    SelectDateTime,
    EnterDetails,
    Confirmed,
}

impl Step {
    pub fn index(self) -> u8 {
        match self {
            Step::SelectService => 0,
            Step::SelectDateTime => 1,
            Step::EnterDetails => 2,
            Step::Confirmed => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("not allowed at step {0:?}")]
    WrongStep(Step),
    #[error("select a service first")]
    NoService,
    #[error("select a date first")]
    NoDate,
    #[error("select a time first")]
    NoTime,
    #[error("{date} is not available: {reason}")]
    DateUnavailable {
        date: LocalDate,
        reason: DateRejection,
    },
    #[error("{0} is not offered on the selected date")]
    TimeNotOffered(ClockTime),
    #[error("{0} is already booked")]
    TimeBooked(ClockTime),
    #[error("booked slots for the selected date are still loading")]
    SlotsLoading,
    #[error("booked slots for the selected date could not be loaded")]
    SlotsUnavailable,
    #[error("{0} is required")]
    MissingField(&'static str),
    #[error("email address is invalid")]
    InvalidEmail,
    #[error("a submission is already in progress")]
    SubmissionInFlight,
}

/// Syntactic e-mail check: one `@`, non-empty local part, dotted domain.
pub fn is_valid_email(email: &str) -> bool {
    let email = email.trim();
    if email.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelectedService {
    pub id: i64,
    pub title: String,
    pub duration_minutes: i64,
    pub price: i64,
}

impl From<&Service> for SelectedService {
    fn from(service: &Service) -> Self {
        Self {
            id: service.id,
            title: service.display_title().to_string(),
            duration_minutes: service.duration_minutes,
            price: service.price,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactForm {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub service_id: Option<i64>,
    #[serde(default)]
    pub is_online: bool,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub topic: String,
}

/// Key of an in-flight booked-slot lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SlotFetch {
    pub date: LocalDate,
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum BookedSlots {
    NotRequested,
    Loading(u64),
    Ready(BTreeSet<ClockTime>),
    Unavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotsState {
    NotRequested,
    Loading,
    Ready,
    Unavailable,
}

/// Everything the date/time rules need, captured at request time.
#[derive(Debug, Clone, Copy)]
pub struct SlotContext<'a> {
    pub schedule: &'a Schedule,
    pub today: LocalDate,
    pub now: NaiveDateTime,
    pub policy: SchedulePolicy,
}

impl SlotContext<'_> {
    /// `date` passes the availability predicate and `time` is one of its offered slots.
    pub fn check_slot(&self, date: LocalDate, time: ClockTime) -> Result<(), SessionError> {
        self.schedule
            .check_date(date, self.today)
            .map_err(|reason| SessionError::DateUnavailable { date, reason })?;
        if !self
            .schedule
            .slots_for(date, self.now, self.policy)
            .contains(&time)
        {
            return Err(SessionError::TimeNotOffered(time));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Confirmation {
    pub booking_id: i64,
    pub date: LocalDate,
    pub time: ClockTime,
    pub service_title: String,
    pub price: i64,
    pub payment_status: PaymentStatus,
}

/// Validated contents of a session ready to be persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionDraft {
    pub service_id: i64,
    pub date: LocalDate,
    pub time: ClockTime,
    pub name: String,
    pub email: String,
    pub topic: String,
    pub notes: String,
    pub is_online: bool,
}

#[derive(Debug, Clone)]
pub struct BookingSession {
    step: Step,
    service: Option<SelectedService>,
    date: Option<LocalDate>,
    time: Option<ClockTime>,
    offered: Vec<ClockTime>,
    booked: BookedSlots,
    generation: u64,
    form: ContactForm,
    confirmation: Option<Confirmation>,
    submitting: bool,
}

impl Default for BookingSession {
    fn default() -> Self {
        Self::new()
    }
}

impl BookingSession {
    pub fn new() -> Self {
        Self {
            step: Step::SelectService,
            service: None,
            date: None,
            time: None,
            offered: Vec::new(),
            booked: BookedSlots::NotRequested,
            generation: 0,
            form: ContactForm::default(),
            confirmation: None,
            submitting: false,
        }
    }

    pub fn step(&self) -> Step {
        self.step
    }

    pub fn service(&self) -> Option<&SelectedService> {
        self.service.as_ref()
    }

    pub fn date(&self) -> Option<LocalDate> {
        self.date
    }

    pub fn time(&self) -> Option<ClockTime> {
        self.time
    }

    pub fn form(&self) -> &ContactForm {
        &self.form
    }

    pub fn confirmation(&self) -> Option<&Confirmation> {
        self.confirmation.as_ref()
    }

    pub fn is_submitting(&self) -> bool {
        self.submitting
    }

    pub fn offered(&self) -> &[ClockTime] {
        &self.offered
    }

    pub fn slots_state(&self) -> SlotsState {
        match self.booked {
            BookedSlots::NotRequested => SlotsState::NotRequested,
            BookedSlots::Loading(_) => SlotsState::Loading,
            BookedSlots::Ready(_) => SlotsState::Ready,
            BookedSlots::Unavailable => SlotsState::Unavailable,
        }
    }

    /// `Some(true)` when `time` is taken, `None` while the snapshot is not loaded.
    pub fn is_booked(&self, time: ClockTime) -> Option<bool> {
        match &self.booked {
            BookedSlots::Ready(set) => Some(set.contains(&time)),
            _ => None,
        }
    }

    /// Offered times that can still be picked.
    pub fn selectable_times(&self) -> Vec<ClockTime> {
        match &self.booked {
            BookedSlots::Ready(set) => self
                .offered
                .iter()
                .copied()
                .filter(|t| !set.contains(t))
                .collect(),
            _ => Vec::new(),
        }
    }

    fn ensure_idle(&self) -> Result<(), SessionError> {
        if self.submitting {
            Err(SessionError::SubmissionInFlight)
        } else {
            Ok(())
        }
    }

    fn ensure_step(&self, allowed: &[Step]) -> Result<(), SessionError> {
        if allowed.contains(&self.step) {
            Ok(())
        } else {
            Err(SessionError::WrongStep(self.step))
        }
    }

    pub fn select_service(&mut self, service: SelectedService) -> Result<(), SessionError> {
        self.ensure_idle()?;
        self.ensure_step(&[Step::SelectService, Step::SelectDateTime])?;
        self.form.service_id = Some(service.id);
        self.service = Some(service);
        Ok(())
    }

    /// Pick a date; clears the time and returns the ticket for the booked-slot lookup.
    pub fn select_date(
        &mut self,
        date: LocalDate,
        ctx: &SlotContext<'_>,
    ) -> Result<SlotFetch, SessionError> {
        self.ensure_idle()?;
        self.ensure_step(&[Step::SelectDateTime])?;
        ctx.schedule
            .check_date(date, ctx.today)
            .map_err(|reason| SessionError::DateUnavailable { date, reason })?;

        self.generation += 1;
        self.date = Some(date);
        self.time = None;
        self.offered = ctx.schedule.slots_for(date, ctx.now, ctx.policy);
        self.booked = BookedSlots::Loading(self.generation);
        Ok(SlotFetch {
            date,
            generation: self.generation,
        })
    }

    /// Apply a booked-slot lookup result. Returns `false` when the ticket is stale.
    pub fn apply_booked_slots<E: Display>(
        &mut self,
        fetch: SlotFetch,
        result: Result<Vec<ClockTime>, E>,
    ) -> bool {
        let current = self.date == Some(fetch.date)
            && self.booked == BookedSlots::Loading(fetch.generation);
        if !current {
            tracing::debug!(
                "Discarding booked slots for {} (generation {})",
                fetch.date,
                fetch.generation
            );
            return false;
        }
        self.booked = match result {
            Ok(times) => BookedSlots::Ready(times.into_iter().collect()),
            Err(e) => {
                tracing::warn!("Booked slots for {} unavailable: {}", fetch.date, e);
                BookedSlots::Unavailable
            }
        };
        true
    }

    fn check_time(&self, time: ClockTime) -> Result<(), SessionError> {
        if self.date.is_none() {
            return Err(SessionError::NoDate);
        }
        if !self.offered.contains(&time) {
            return Err(SessionError::TimeNotOffered(time));
        }
        match &self.booked {
            BookedSlots::Ready(set) if set.contains(&time) => Err(SessionError::TimeBooked(time)),
            BookedSlots::Ready(_) => Ok(()),
            BookedSlots::Unavailable => Err(SessionError::SlotsUnavailable),
            BookedSlots::Loading(_) | BookedSlots::NotRequested => Err(SessionError::SlotsLoading),
        }
    }

    pub fn select_time(&mut self, time: ClockTime) -> Result<(), SessionError> {
        self.ensure_idle()?;
        self.ensure_step(&[Step::SelectDateTime])?;
        self.check_time(time)?;
        self.time = Some(time);
        Ok(())
    }

    /// Guarded forward transition for steps 0→1 and 1→2.
    pub fn advance(&mut self, ctx: &SlotContext<'_>) -> Result<Step, SessionError> {
        self.ensure_idle()?;
        match self.step {
            Step::SelectService => {
                if self.service.is_none() {
                    return Err(SessionError::NoService);
                }
                self.step = Step::SelectDateTime;
            }
            Step::SelectDateTime => {
                let date = self.date.ok_or(SessionError::NoDate)?;
                let time = self.time.ok_or(SessionError::NoTime)?;
                ctx.schedule
                    .check_date(date, ctx.today)
                    .map_err(|reason| SessionError::DateUnavailable { date, reason })?;
                self.check_time(time)?;
                self.step = Step::EnterDetails;
            }
            step @ (Step::EnterDetails | Step::Confirmed) => {
                return Err(SessionError::WrongStep(step));
            }
        }
        Ok(self.step)
    }

    /// Step back without discarding selections.
    pub fn back(&mut self) -> Result<Step, SessionError> {
        self.ensure_idle()?;
        self.step = match self.step {
            Step::EnterDetails => Step::SelectDateTime,
            Step::SelectDateTime => Step::SelectService,
            step => return Err(SessionError::WrongStep(step)),
        };
        Ok(self.step)
    }

    pub fn update_details(&mut self, form: ContactForm) -> Result<(), SessionError> {
        self.ensure_idle()?;
        self.ensure_step(&[Step::SelectDateTime, Step::EnterDetails])?;
        let service_id = self.service.as_ref().map(|s| s.id);
        self.form = ContactForm { service_id, ..form };
        Ok(())
    }

    /// Start over after a confirmed booking, keeping the service.
    pub fn book_another(&mut self) -> Result<(), SessionError> {
        self.ensure_step(&[Step::Confirmed])?;
        self.step = Step::SelectDateTime;
        self.generation += 1;
        self.date = None;
        self.time = None;
        self.offered.clear();
        self.booked = BookedSlots::NotRequested;
        self.confirmation = None;
        Ok(())
    }

    pub fn submission(&self) -> Result<SubmissionDraft, SessionError> {
        self.ensure_step(&[Step::EnterDetails])?;
        let service = self.service.as_ref().ok_or(SessionError::NoService)?;
        let date = self.date.ok_or(SessionError::NoDate)?;
        let time = self.time.ok_or(SessionError::NoTime)?;
        let name = self.form.name.trim();
        if name.is_empty() {
            return Err(SessionError::MissingField("name"));
        }
        let email = self.form.email.trim();
        if email.is_empty() {
            return Err(SessionError::MissingField("email"));
        }
        if !is_valid_email(email) {
            return Err(SessionError::InvalidEmail);
        }
        Ok(SubmissionDraft {
            service_id: service.id,
            date,
            time,
            name: name.to_string(),
            email: email.to_string(),
            topic: self.form.topic.trim().to_string(),
            notes: self.form.notes.trim().to_string(),
            is_online: self.form.is_online,
        })
    }

    /// Raise the submit in-flight flag; refused when already raised.
    pub fn begin_submit(&mut self) -> Result<(), SessionError> {
        self.ensure_idle()?;
        self.ensure_step(&[Step::EnterDetails])?;
        self.submitting = true;
        Ok(())
    }

    pub fn end_submit(&mut self) {
        self.submitting = false;
    }

    pub(crate) fn confirm(&mut self, confirmation: Confirmation) {
        self.step = Step::Confirmed;
        self.confirmation = Some(confirmation);
    }
}

// ── Registry ──

struct Entry {
    session: BookingSession,
    touched: Instant,
}

/// In-memory sessions keyed by id, expired after `ttl` of inactivity.
pub struct SessionRegistry {
    sessions: DashMap<Uuid, Entry>,
    ttl: Duration,
}

impl SessionRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            ttl,
        }
    }

    pub fn create(&self) -> (Uuid, BookingSession) {
        let id = Uuid::new_v4();
        let session = BookingSession::new();
        self.sessions.insert(
            id,
            Entry {
                session: session.clone(),
                touched: Instant::now(),
            },
        );
        (id, session)
    }

    pub fn snapshot(&self, id: Uuid) -> Option<BookingSession> {
        self.sessions.get(&id).map(|e| e.session.clone())
    }

    /// Run `f` against the stored session. The map guard is released before returning.
    pub fn update<R>(&self, id: Uuid, f: impl FnOnce(&mut BookingSession) -> R) -> Option<R> {
        let mut entry = self.sessions.get_mut(&id)?;
        entry.touched = Instant::now();
        Some(f(&mut entry.session))
    }

    /// Store the result of a submission and drop the in-flight flag.
    pub fn finish_submit(&self, id: Uuid, mut session: BookingSession) {
        session.end_submit();
        self.sessions.insert(
            id,
            Entry {
                session,
                touched: Instant::now(),
            },
        );
    }

    pub fn remove(&self, id: Uuid) -> bool {
        self.sessions.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Drop sessions idle longer than the TTL. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let before = self.sessions.len();
        let ttl = self.ttl;
        self.sessions
            .retain(|_, entry| entry.session.submitting || entry.touched.elapsed() < ttl);
        before - self.sessions.len()
    }
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schedule::tests::{d, office_settings, t};
    use std::sync::Arc;
    use tokio::sync::oneshot;

    fn schedule() -> Schedule {
        Schedule {
            settings: office_settings(),
            blocked: BTreeSet::new(),
        }
    }

    fn ctx(schedule: &Schedule) -> SlotContext<'_> {
        SlotContext {
            schedule,
            today: d("2026-03-02"),
            now: t("08:00").on(d("2026-03-02")),
            policy: SchedulePolicy::default(),
        }
    }

    fn consulting(price: i64) -> SelectedService {
        SelectedService {
            id: 7,
            title: "Strategy session".into(),
            duration_minutes: 60,
            price,
        }
    }

    fn at_datetime_step(schedule: &Schedule) -> BookingSession {
        let mut session = BookingSession::new();
        session.select_service(consulting(0)).unwrap();
        assert_eq!(session.advance(&ctx(schedule)).unwrap(), Step::SelectDateTime);
        session
    }

    fn with_time(schedule: &Schedule, date: &str, booked: &[&str], time: &str) -> BookingSession {
        let mut session = at_datetime_step(schedule);
        let fetch = session.select_date(d(date), &ctx(schedule)).unwrap();
        let booked: Vec<_> = booked.iter().map(|s| t(s)).collect();
        assert!(session.apply_booked_slots(fetch, Ok::<_, String>(booked)));
        session.select_time(t(time)).unwrap();
        session
    }

    #[test]
    fn test_email_validation() {
        assert!(is_valid_email("ana@example.com"));
        assert!(is_valid_email("  ana.b+tag@mail.example.org "));
        for bad in ["", "ana", "ana@", "@example.com", "ana@example", "a b@example.com", "a@b@c.com", "ana@.com"] {
            assert!(!is_valid_email(bad), "{bad} should be invalid");
        }
    }

    #[test]
    fn test_cannot_leave_service_step_without_service() {
        let schedule = schedule();
        let mut session = BookingSession::new();
        assert_eq!(session.advance(&ctx(&schedule)), Err(SessionError::NoService));
        assert_eq!(session.step().index(), 0);
    }

    #[test]
    fn test_unavailable_date_is_rejected_without_side_effects() {
        let schedule = schedule();
        let mut session = at_datetime_step(&schedule);
        let err = session.select_date(d("2026-03-07"), &ctx(&schedule)).unwrap_err();
        assert_eq!(
            err,
            SessionError::DateUnavailable {
                date: d("2026-03-07"),
                reason: DateRejection::NonWorkingDay
            }
        );
        assert_eq!(session.date(), None);
        assert_eq!(session.slots_state(), SlotsState::NotRequested);
    }

    #[test]
    fn test_booked_time_cannot_be_selected_or_advanced() {
        let schedule = schedule();
        let mut session = at_datetime_step(&schedule);
        let fetch = session.select_date(d("2026-03-04"), &ctx(&schedule)).unwrap();
        assert!(session.apply_booked_slots(fetch, Ok::<_, String>(vec![t("10:00")])));

        assert_eq!(session.select_time(t("10:00")), Err(SessionError::TimeBooked(t("10:00"))));
        assert_eq!(session.advance(&ctx(&schedule)), Err(SessionError::NoTime));
        assert_eq!(session.step(), Step::SelectDateTime);
        assert!(!session.selectable_times().contains(&t("10:00")));

        session.select_time(t("10:30")).unwrap();
        assert_eq!(session.advance(&ctx(&schedule)).unwrap(), Step::EnterDetails);
    }

    #[test]
    fn test_time_must_come_from_generated_slots() {
        let schedule = schedule();
        let mut session = at_datetime_step(&schedule);
        let fetch = session.select_date(d("2026-03-04"), &ctx(&schedule)).unwrap();
        session.apply_booked_slots(fetch, Ok::<_, String>(vec![]));
        assert_eq!(
            session.select_time(t("10:15")),
            Err(SessionError::TimeNotOffered(t("10:15")))
        );
        assert_eq!(
            session.select_time(t("18:00")),
            Err(SessionError::TimeNotOffered(t("18:00")))
        );
    }

    #[test]
    fn test_check_slot_follows_current_schedule() {
        let mut schedule = schedule();
        assert_eq!(ctx(&schedule).check_slot(d("2026-03-04"), t("10:00")), Ok(()));
        assert_eq!(
            ctx(&schedule).check_slot(d("2026-03-04"), t("10:15")),
            Err(SessionError::TimeNotOffered(t("10:15")))
        );

        schedule.blocked.insert(d("2026-03-04"));
        assert_eq!(
            ctx(&schedule).check_slot(d("2026-03-04"), t("10:00")),
            Err(SessionError::DateUnavailable {
                date: d("2026-03-04"),
                reason: DateRejection::Blocked
            })
        );

        schedule.blocked.clear();
        schedule.settings.min_advance_booking_hours = 3;
        let same_day = SlotContext {
            now: t("08:00").on(d("2026-03-04")),
            today: d("2026-03-04"),
            ..ctx(&schedule)
        };
        assert_eq!(
            same_day.check_slot(d("2026-03-04"), t("10:00")),
            Err(SessionError::TimeNotOffered(t("10:00")))
        );
        assert_eq!(same_day.check_slot(d("2026-03-04"), t("11:00")), Ok(()));

        let later = SlotContext {
            today: d("2026-03-05"),
            ..ctx(&schedule)
        };
        assert!(matches!(
            later.check_slot(d("2026-03-04"), t("11:00")),
            Err(SessionError::DateUnavailable {
                reason: DateRejection::Past,
                ..
            })
        ));
    }

    #[test]
    fn test_time_refused_until_booked_slots_arrive() {
        let schedule = schedule();
        let mut session = at_datetime_step(&schedule);
        session.select_date(d("2026-03-04"), &ctx(&schedule)).unwrap();
        assert_eq!(session.select_time(t("10:00")), Err(SessionError::SlotsLoading));
    }

    #[test]
    fn test_fetch_failure_degrades_to_no_slots() {
        let schedule = schedule();
        let mut session = at_datetime_step(&schedule);
        let fetch = session.select_date(d("2026-03-04"), &ctx(&schedule)).unwrap();
        assert!(session.apply_booked_slots(fetch, Err::<Vec<ClockTime>, _>("timeout")));
        assert_eq!(session.slots_state(), SlotsState::Unavailable);
        assert!(session.selectable_times().is_empty());
        assert_eq!(session.select_time(t("10:00")), Err(SessionError::SlotsUnavailable));
    }

    #[test]
    fn test_new_date_clears_time_and_refetches() {
        let schedule = schedule();
        let mut session = with_time(&schedule, "2026-03-04", &[], "10:00");
        let fetch = session.select_date(d("2026-03-05"), &ctx(&schedule)).unwrap();
        assert_eq!(session.time(), None);
        assert_eq!(session.slots_state(), SlotsState::Loading);
        assert_eq!(fetch.date, d("2026-03-05"));

        // Re-selecting the same date issues a fresh lookup as well.
        let again = session.select_date(d("2026-03-05"), &ctx(&schedule)).unwrap();
        assert!(again.generation > fetch.generation);
        assert!(!session.apply_booked_slots(fetch, Ok::<_, String>(vec![])));
        assert!(session.apply_booked_slots(again, Ok::<_, String>(vec![])));
    }

    #[tokio::test]
    async fn test_late_response_for_previous_date_is_discarded() {
        let schedule = schedule();
        let mut session = at_datetime_step(&schedule);
        let (tx_a, rx_a) = oneshot::channel::<Vec<ClockTime>>();
        let (tx_b, rx_b) = oneshot::channel::<Vec<ClockTime>>();

        let fetch_a = session.select_date(d("2026-03-04"), &ctx(&schedule)).unwrap();
        let fetch_b = session.select_date(d("2026-03-05"), &ctx(&schedule)).unwrap();

        // B resolves first, A arrives late.
        tx_b.send(vec![t("09:00")]).unwrap();
        let booked_b = rx_b.await.unwrap();
        assert!(session.apply_booked_slots(fetch_b, Ok::<_, String>(booked_b)));

        tx_a.send(vec![t("10:00")]).unwrap();
        let booked_a = rx_a.await.unwrap();
        assert!(!session.apply_booked_slots(fetch_a, Ok::<_, String>(booked_a)));

        assert_eq!(session.date(), Some(d("2026-03-05")));
        assert_eq!(session.is_booked(t("09:00")), Some(true));
        assert_eq!(session.is_booked(t("10:00")), Some(false));
    }

    #[tokio::test]
    async fn test_registry_discards_out_of_order_lookups() {
        let schedule = Arc::new(schedule());
        let registry = Arc::new(SessionRegistry::new(Duration::from_secs(60)));
        let (id, _) = registry.create();
        registry
            .update(id, |s| {
                s.select_service(consulting(0))?;
                s.advance(&ctx(&schedule))
            })
            .unwrap()
            .unwrap();

        let (tx_a, rx_a) = oneshot::channel::<Vec<ClockTime>>();
        let (tx_b, rx_b) = oneshot::channel::<Vec<ClockTime>>();

        let spawn_lookup = |date: &'static str, rx: oneshot::Receiver<Vec<ClockTime>>| {
            let registry = registry.clone();
            let schedule = schedule.clone();
            let fetch = registry
                .update(id, |s| s.select_date(d(date), &ctx(&schedule)))
                .unwrap()
                .unwrap();
            tokio::spawn(async move {
                let booked = rx.await.map_err(|e| e.to_string());
                registry.update(id, |s| s.apply_booked_slots(fetch, booked)).unwrap()
            })
        };

        let task_a = spawn_lookup("2026-03-04", rx_a);
        let task_b = spawn_lookup("2026-03-05", rx_b);

        tx_b.send(vec![t("11:00")]).unwrap();
        assert!(task_b.await.unwrap());
        tx_a.send(vec![t("12:00")]).unwrap();
        assert!(!task_a.await.unwrap());

        let session = registry.snapshot(id).unwrap();
        assert_eq!(session.date(), Some(d("2026-03-05")));
        assert_eq!(session.is_booked(t("11:00")), Some(true));
        assert_eq!(session.is_booked(t("12:00")), Some(false));
    }

    #[test]
    fn test_back_keeps_selections() {
        let schedule = schedule();
        let mut session = with_time(&schedule, "2026-03-04", &[], "14:00");
        session.advance(&ctx(&schedule)).unwrap();
        assert_eq!(session.back().unwrap(), Step::SelectDateTime);
        assert_eq!(session.date(), Some(d("2026-03-04")));
        assert_eq!(session.time(), Some(t("14:00")));
        assert_eq!(session.advance(&ctx(&schedule)).unwrap(), Step::EnterDetails);
    }

    #[test]
    fn test_details_step_only_completes_through_submission() {
        let schedule = schedule();
        let mut session = with_time(&schedule, "2026-03-04", &[], "14:00");
        session.advance(&ctx(&schedule)).unwrap();
        assert_eq!(
            session.advance(&ctx(&schedule)),
            Err(SessionError::WrongStep(Step::EnterDetails))
        );
    }

    #[test]
    fn test_submission_requires_contact_fields() {
        let schedule = schedule();
        let mut session = with_time(&schedule, "2026-03-04", &[], "14:00");
        session.advance(&ctx(&schedule)).unwrap();
        assert_eq!(session.submission(), Err(SessionError::MissingField("name")));

        session
            .update_details(ContactForm {
                name: "Ana".into(),
                email: "not-an-email".into(),
                ..ContactForm::default()
            })
            .unwrap();
        assert_eq!(session.submission(), Err(SessionError::InvalidEmail));

        session
            .update_details(ContactForm {
                name: " Ana ".into(),
                email: "ana@example.com".into(),
                service_id: Some(999),
                ..ContactForm::default()
            })
            .unwrap();
        let draft = session.submission().unwrap();
        assert_eq!(draft.name, "Ana");
        assert_eq!(draft.service_id, 7);
        assert_eq!(session.form().service_id, Some(7));
    }

    #[test]
    fn test_in_flight_submission_blocks_changes() {
        let schedule = schedule();
        let mut session = with_time(&schedule, "2026-03-04", &[], "14:00");
        session.advance(&ctx(&schedule)).unwrap();
        session.begin_submit().unwrap();
        assert_eq!(session.begin_submit(), Err(SessionError::SubmissionInFlight));
        assert_eq!(session.back(), Err(SessionError::SubmissionInFlight));
        session.end_submit();
        assert!(session.back().is_ok());
    }

    #[test]
    fn test_book_another_resets_date_and_time() {
        let schedule = schedule();
        let mut session = with_time(&schedule, "2026-03-04", &[], "14:00");
        session.advance(&ctx(&schedule)).unwrap();
        assert_eq!(session.book_another(), Err(SessionError::WrongStep(Step::EnterDetails)));

        session.confirm(Confirmation {
            booking_id: 1,
            date: d("2026-03-04"),
            time: t("14:00"),
            service_title: "Strategy session".into(),
            price: 0,
            payment_status: PaymentStatus::Free,
        });
        assert_eq!(session.back(), Err(SessionError::WrongStep(Step::Confirmed)));

        session.book_another().unwrap();
        assert_eq!(session.step(), Step::SelectDateTime);
        assert_eq!(session.date(), None);
        assert_eq!(session.time(), None);
        assert!(session.confirmation().is_none());
        assert_eq!(session.service().map(|s| s.id), Some(7));
    }

    #[test]
    fn test_registry_purges_idle_sessions() {
        let registry = SessionRegistry::new(Duration::from_millis(0));
        registry.create();
        registry.create();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(registry.purge_expired(), 2);
        assert_eq!(registry.len(), 0);
    }
}
