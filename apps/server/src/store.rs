//! SQLite repository and the read-through schedule cache.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::SqlitePool;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::booking::{BookingStore, NewBooking, StoreError};
use crate::calendar_sync::CalendarEvent;
use crate::models::*;
use crate::schedule::{
    CalendarSettings, ClockTime, LocalDate, LunchBreak, Schedule, WeeklyTemplate, WorkingHours,
    WEEKDAYS,
};

const BOOKING_COLUMNS: &str = "id, name, email, topic, date, time, end_time, user_id, status,
    duration, service_id, is_online, notes, price, payment_status, stripe_session_id,
    meet_link, idempotency_key, created_at, updated_at";

const SERVICE_COLUMNS: &str =
    "id, title, description, duration_minutes, price, is_active, is_bookable, sort_order";

const OUTBOX_COLUMNS: &str =
    "id, booking_id, payload, status, attempts, last_error, next_attempt_at, created_at";

/// Timestamp in the format SQLite's `datetime('now')` produces (UTC).
pub fn db_timestamp(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn parse_time(raw: Option<String>) -> Result<Option<ClockTime>, StoreError> {
    raw.map(|s| s.parse::<ClockTime>())
        .transpose()
        .map_err(|e| StoreError::Database(sqlx::Error::Decode(Box::new(e))))
}

fn slot_conflict(e: sqlx::Error, booking: &NewBooking) -> StoreError {
    if let sqlx::Error::Database(db_err) = &e {
        if db_err.is_unique_violation() && !db_err.message().contains("idempotency_key") {
            return StoreError::SlotTaken {
                date: booking.date.to_string(),
                time: booking.time.to_string(),
            };
        }
    }
    StoreError::Database(e)
}

#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ── Services ──

    pub async fn list_services(&self, include_hidden: bool) -> Result<Vec<Service>, StoreError> {
        let filter = if include_hidden {
            ""
        } else {
            "WHERE is_active = 1 AND is_bookable = 1"
        };
        let services = sqlx::query_as::<_, Service>(&format!(
            "SELECT {SERVICE_COLUMNS} FROM services {filter} ORDER BY sort_order, id"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(services)
    }

    pub async fn create_service(&self, req: &CreateServiceRequest) -> Result<Service, StoreError> {
        let id = sqlx::query(
            "INSERT INTO services (title, description, duration_minutes, price, is_bookable, sort_order)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(Json(&req.title))
        .bind(Json(&req.description))
        .bind(req.duration_minutes)
        .bind(req.price)
        .bind(req.is_bookable.unwrap_or(true))
        .bind(req.sort_order.unwrap_or(0))
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        self.find_service(id)
            .await?
            .ok_or(StoreError::NotFound("service"))
    }

    pub async fn update_service(
        &self,
        id: i64,
        req: &UpdateServiceRequest,
    ) -> Result<Service, StoreError> {
        let result = sqlx::query(
            "UPDATE services SET
                title = COALESCE(?, title),
                description = COALESCE(?, description),
                duration_minutes = COALESCE(?, duration_minutes),
                price = COALESCE(?, price),
                is_active = COALESCE(?, is_active),
                is_bookable = COALESCE(?, is_bookable),
                sort_order = COALESCE(?, sort_order)
             WHERE id = ?",
        )
        .bind(req.title.as_ref().map(Json))
        .bind(req.description.as_ref().map(Json))
        .bind(req.duration_minutes)
        .bind(req.price)
        .bind(req.is_active)
        .bind(req.is_bookable)
        .bind(req.sort_order)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("service"));
        }
        self.find_service(id)
            .await?
            .ok_or(StoreError::NotFound("service"))
    }

    // ── Calendar settings ──

    pub async fn load_schedule(&self) -> Result<Schedule, StoreError> {
        let row = sqlx::query_as::<_, SettingsRow>(
            "SELECT slot_duration, max_advance_booking_days, min_advance_booking_hours,
                    lunch_break_enabled, lunch_break_start, lunch_break_end
             FROM calendar_settings WHERE id = 1",
        )
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound("calendar settings"))?;

        let hours = sqlx::query_as::<_, WorkingHoursRow>(
            "SELECT weekday, enabled, start_time, end_time FROM working_hours ORDER BY weekday",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut weekly = WeeklyTemplate::default();
        for h in hours {
            let Some(weekday) = usize::try_from(h.weekday).ok().and_then(|i| WEEKDAYS.get(i)) else {
                tracing::warn!("Ignoring working_hours row for weekday {}", h.weekday);
                continue;
            };
            *weekly.day_mut(*weekday) = WorkingHours {
                enabled: h.enabled,
                start: parse_time(h.start_time)?,
                end: parse_time(h.end_time)?,
            };
        }

        let settings = CalendarSettings {
            slot_duration: u16::try_from(row.slot_duration).unwrap_or(0),
            max_advance_booking_days: u32::try_from(row.max_advance_booking_days).unwrap_or(0),
            min_advance_booking_hours: u32::try_from(row.min_advance_booking_hours).unwrap_or(0),
            lunch_break: LunchBreak {
                enabled: row.lunch_break_enabled,
                start: parse_time(row.lunch_break_start)?,
                end: parse_time(row.lunch_break_end)?,
            },
            weekly,
        };

        let blocked = sqlx::query_scalar::<_, String>("SELECT date FROM blocked_dates")
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .filter_map(|raw| match raw.parse::<LocalDate>() {
                Ok(date) => Some(date),
                Err(e) => {
                    tracing::warn!("Skipping blocked date: {}", e);
                    None
                }
            })
            .collect::<BTreeSet<_>>();

        Ok(Schedule { settings, blocked })
    }

    /// Replace the settings row and the weekly template atomically.
    pub async fn save_settings(&self, settings: &CalendarSettings) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let lunch = &settings.lunch_break;
        sqlx::query(
            "INSERT INTO calendar_settings
                (id, slot_duration, max_advance_booking_days, min_advance_booking_hours,
                 lunch_break_enabled, lunch_break_start, lunch_break_end, updated_at)
             VALUES (1, ?, ?, ?, ?, ?, ?, datetime('now'))
             ON CONFLICT(id) DO UPDATE SET
                slot_duration = excluded.slot_duration,
                max_advance_booking_days = excluded.max_advance_booking_days,
                min_advance_booking_hours = excluded.min_advance_booking_hours,
                lunch_break_enabled = excluded.lunch_break_enabled,
                lunch_break_start = excluded.lunch_break_start,
                lunch_break_end = excluded.lunch_break_end,
                updated_at = excluded.updated_at",
        )
        .bind(i64::from(settings.slot_duration))
        .bind(i64::from(settings.max_advance_booking_days))
        .bind(i64::from(settings.min_advance_booking_hours))
        .bind(lunch.enabled)
        .bind(lunch.start.map(String::from))
        .bind(lunch.end.map(String::from))
        .execute(&mut *tx)
        .await?;

        for weekday in WEEKDAYS {
            let hours = settings.weekly.day(weekday);
            sqlx::query(
                "INSERT INTO working_hours (weekday, enabled, start_time, end_time)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT(weekday) DO UPDATE SET
                    enabled = excluded.enabled,
                    start_time = excluded.start_time,
                    end_time = excluded.end_time",
            )
            .bind(i64::from(weekday.num_days_from_monday()))
            .bind(hours.enabled)
            .bind(hours.start.map(String::from))
            .bind(hours.end.map(String::from))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn list_blocked_dates(&self) -> Result<Vec<BlockedDate>, StoreError> {
        let rows = sqlx::query_as::<_, BlockedDate>(
            "SELECT id, date, reason FROM blocked_dates ORDER BY date",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Block a date; blocking it again only updates the reason.
    pub async fn add_blocked_date(
        &self,
        date: LocalDate,
        reason: Option<&str>,
    ) -> Result<BlockedDate, StoreError> {
        let row = sqlx::query_as::<_, BlockedDate>(
            "INSERT INTO blocked_dates (date, reason) VALUES (?, ?)
             ON CONFLICT(date) DO UPDATE SET reason = excluded.reason
             RETURNING id, date, reason",
        )
        .bind(date.to_string())
        .bind(reason)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn delete_blocked_date(&self, id: i64) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM blocked_dates WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("blocked date"));
        }
        Ok(())
    }

    // ── Bookings ──

    pub async fn get_booking(&self, id: i64) -> Result<Booking, StoreError> {
        sqlx::query_as::<_, Booking>(&format!(
            "SELECT {BOOKING_COLUMNS} FROM bookings WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(StoreError::NotFound("booking"))
    }

    async fn find_by_idempotency_key(&self, key: &str) -> Result<Option<Booking>, StoreError> {
        let booking = sqlx::query_as::<_, Booking>(&format!(
            "SELECT {BOOKING_COLUMNS} FROM bookings WHERE idempotency_key = ?"
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(booking)
    }

    /// Bookings on `date`, or between `from` and `to` inclusive.
    pub async fn list_bookings(
        &self,
        date: Option<LocalDate>,
        from: Option<LocalDate>,
        to: Option<LocalDate>,
    ) -> Result<Vec<Booking>, StoreError> {
        let date = date.map(|d| d.to_string());
        let from = from.map(|d| d.to_string());
        let to = to.map(|d| d.to_string());
        let bookings = sqlx::query_as::<_, Booking>(&format!(
            "SELECT {BOOKING_COLUMNS} FROM bookings
             WHERE (? IS NULL OR date = ?)
               AND (? IS NULL OR date >= ?)
               AND (? IS NULL OR date <= ?)
             ORDER BY date, time"
        ))
        .bind(&date)
        .bind(&date)
        .bind(&from)
        .bind(&from)
        .bind(&to)
        .bind(&to)
        .fetch_all(&self.pool)
        .await?;
        Ok(bookings)
    }

    /// Booked start times per date for `from..=to`, in one query.
    pub async fn booked_slots_between(
        &self,
        from: LocalDate,
        to: LocalDate,
    ) -> Result<BTreeMap<LocalDate, BTreeSet<ClockTime>>, StoreError> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT date, time FROM bookings
             WHERE date >= ? AND date <= ? AND status <> 'cancelled'",
        )
        .bind(from.to_string())
        .bind(to.to_string())
        .fetch_all(&self.pool)
        .await?;

        let mut by_date: BTreeMap<LocalDate, BTreeSet<ClockTime>> = BTreeMap::new();
        for (date, time) in rows {
            match (date.parse::<LocalDate>(), time.parse::<ClockTime>()) {
                (Ok(date), Ok(time)) => {
                    by_date.entry(date).or_default().insert(time);
                }
                _ => tracing::warn!("booked_slots_between: bad row {} {}", date, time),
            }
        }
        Ok(by_date)
    }

    /// Move a booking from `current` to `next`; `false` if it changed underneath.
    pub async fn set_booking_status(
        &self,
        id: i64,
        current: BookingStatus,
        next: BookingStatus,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE bookings SET status = ?, updated_at = datetime('now')
             WHERE id = ? AND status = ?",
        )
        .bind(next)
        .bind(id)
        .bind(current)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Staff edit of client, service and time.
    ///
    /// Moving to another service re-prices the booking from `row`, unless
    /// its payment is already settled. The same service keeps price and
    /// payment status.
    pub async fn update_appointment(
        &self,
        id: i64,
        row: &NewBooking,
    ) -> Result<Booking, StoreError> {
        let current = self.get_booking(id).await?;
        let (price, payment_status) = if current.service_id == row.service_id {
            (current.price, current.payment_status)
        } else if matches!(
            current.payment_status,
            PaymentStatus::Paid | PaymentStatus::Refunded
        ) {
            return Err(StoreError::PaymentSettled(id));
        } else {
            (row.price, row.payment_status)
        };

        let result = sqlx::query(
            "UPDATE bookings SET
                name = ?, email = ?, topic = ?, date = ?, time = ?, end_time = ?,
                duration = ?, service_id = ?, is_online = ?, notes = ?,
                price = ?, payment_status = ?,
                updated_at = datetime('now')
             WHERE id = ? AND service_id = ? AND payment_status = ?",
        )
        .bind(&row.name)
        .bind(&row.email)
        .bind(&row.topic)
        .bind(row.date.to_string())
        .bind(row.time.to_string())
        .bind(row.end_time.to_string())
        .bind(row.duration)
        .bind(row.service_id)
        .bind(row.is_online)
        .bind(&row.notes)
        .bind(price)
        .bind(payment_status)
        .bind(id)
        .bind(current.service_id)
        .bind(current.payment_status)
        .execute(&self.pool)
        .await
        .map_err(|e| slot_conflict(e, row))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound("booking"));
        }
        self.get_booking(id).await
    }

    pub async fn set_meet_link(&self, booking_id: i64, link: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE bookings SET meet_link = ?, updated_at = datetime('now') WHERE id = ?")
            .bind(link)
            .bind(booking_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── Payments ──

    /// Booking id for a checkout session, for events that carry no metadata.
    pub async fn booking_id_for_checkout(&self, session_id: &str) -> Result<Option<i64>, StoreError> {
        let id = sqlx::query_scalar("SELECT id FROM bookings WHERE stripe_session_id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(id)
    }

    /// pending → paid; a pending booking becomes confirmed.
    pub async fn mark_paid(&self, booking_id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE bookings SET payment_status = 'paid',
                status = CASE WHEN status = 'pending' THEN 'confirmed' ELSE status END,
                updated_at = datetime('now')
             WHERE id = ? AND payment_status = 'pending'",
        )
        .bind(booking_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// pending → failed; the booking is cancelled, which frees its slot.
    pub async fn mark_payment_failed(&self, booking_id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE bookings SET payment_status = 'failed', status = 'cancelled',
                updated_at = datetime('now')
             WHERE id = ? AND payment_status = 'pending'",
        )
        .bind(booking_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn mark_refunded(&self, booking_id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE bookings SET payment_status = 'refunded', updated_at = datetime('now')
             WHERE id = ? AND payment_status = 'paid'",
        )
        .bind(booking_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Fail customer bookings still awaiting checkout since before `cutoff`.
    /// Staff appointments are created confirmed and settle payment elsewhere,
    /// so they never expire. Returns the booking ids.
    pub async fn expire_pending_payments(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<i64>, StoreError> {
        let ids = sqlx::query_scalar(
            "UPDATE bookings SET payment_status = 'failed', status = 'cancelled',
                updated_at = datetime('now')
             WHERE payment_status = 'pending' AND status = 'pending' AND created_at < ?
             RETURNING id",
        )
        .bind(db_timestamp(cutoff))
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    // ── Calendar outbox ──

    pub async fn enqueue_calendar_event(
        &self,
        booking_id: i64,
        event: &CalendarEvent,
    ) -> Result<i64, StoreError> {
        let payload = serde_json::to_string(event)?;
        let id = sqlx::query("INSERT INTO calendar_outbox (booking_id, payload) VALUES (?, ?)")
            .bind(booking_id)
            .bind(payload)
            .execute(&self.pool)
            .await?
            .last_insert_rowid();
        Ok(id)
    }

    pub async fn due_outbox(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<OutboxEntry>, StoreError> {
        let entries = sqlx::query_as::<_, OutboxEntry>(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM calendar_outbox
             WHERE status = 'pending' AND next_attempt_at <= ?
             ORDER BY next_attempt_at, id LIMIT ?"
        ))
        .bind(db_timestamp(now))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    pub async fn complete_outbox(
        &self,
        id: i64,
        booking_id: i64,
        meet_link: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE calendar_outbox SET status = 'done', attempts = attempts + 1, last_error = NULL
             WHERE id = ?",
        )
        .bind(id)
        .execute(&mut *tx)
        .await?;
        if let Some(link) = meet_link {
            sqlx::query(
                "UPDATE bookings SET meet_link = ?, updated_at = datetime('now') WHERE id = ?",
            )
            .bind(link)
            .bind(booking_id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Record a failed attempt; `next_attempt: None` marks the entry as failed for good.
    pub async fn record_outbox_failure(
        &self,
        id: i64,
        attempts: i64,
        error: &str,
        next_attempt: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let status = if next_attempt.is_some() {
            OutboxStatus::Pending
        } else {
            OutboxStatus::Failed
        };
        sqlx::query(
            "UPDATE calendar_outbox SET status = ?, attempts = ?, last_error = ?,
                next_attempt_at = COALESCE(?, next_attempt_at)
             WHERE id = ?",
        )
        .bind(status)
        .bind(attempts)
        .bind(error)
        .bind(next_attempt.map(db_timestamp))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_outbox(&self) -> Result<Vec<OutboxEntry>, StoreError> {
        let entries = sqlx::query_as::<_, OutboxEntry>(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM calendar_outbox ORDER BY id DESC LIMIT 200"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    /// Re-queue a failed entry for immediate delivery with a fresh attempt budget.
    pub async fn retry_outbox(&self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE calendar_outbox SET status = 'pending', attempts = 0,
                next_attempt_at = datetime('now')
             WHERE id = ? AND status = 'failed'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl BookingStore for Store {
    async fn find_service(&self, id: i64) -> Result<Option<Service>, StoreError> {
        let service = sqlx::query_as::<_, Service>(&format!(
            "SELECT {SERVICE_COLUMNS} FROM services WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(service)
    }

    async fn booked_slots(&self, date: LocalDate) -> Result<Vec<ClockTime>, StoreError> {
        let times: Vec<String> = sqlx::query_scalar(
            "SELECT time FROM bookings WHERE date = ? AND status <> 'cancelled' ORDER BY time",
        )
        .bind(date.to_string())
        .fetch_all(&self.pool)
        .await?;

        Ok(times
            .into_iter()
            .filter_map(|raw| match raw.parse::<ClockTime>() {
                Ok(time) => Some(time),
                Err(e) => {
                    tracing::warn!("booked_slots: {}", e);
                    None
                }
            })
            .collect())
    }

    async fn insert_booking(&self, b: &NewBooking) -> Result<(Booking, bool), StoreError> {
        if let Some(key) = &b.idempotency_key {
            if let Some(existing) = self.find_by_idempotency_key(key).await? {
                return Ok((existing, true));
            }
        }

        let inserted = sqlx::query(
            "INSERT INTO bookings (name, email, topic, date, time, end_time, user_id, status,
                duration, service_id, is_online, notes, price, payment_status, idempotency_key)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&b.name)
        .bind(&b.email)
        .bind(&b.topic)
        .bind(b.date.to_string())
        .bind(b.time.to_string())
        .bind(b.end_time.to_string())
        .bind(&b.user_id)
        .bind(b.status)
        .bind(b.duration)
        .bind(b.service_id)
        .bind(b.is_online)
        .bind(&b.notes)
        .bind(b.price)
        .bind(b.payment_status)
        .bind(&b.idempotency_key)
        .execute(&self.pool)
        .await;

        match inserted {
            Ok(result) => Ok((self.get_booking(result.last_insert_rowid()).await?, false)),
            Err(e) => {
                // A concurrent request with the same key won the race.
                if let Some(key) = &b.idempotency_key {
                    if let Some(existing) = self.find_by_idempotency_key(key).await? {
                        return Ok((existing, true));
                    }
                }
                Err(slot_conflict(e, b))
            }
        }
    }

    async fn attach_checkout_session(
        &self,
        booking_id: i64,
        session_id: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE bookings SET stripe_session_id = ?, updated_at = datetime('now') WHERE id = ?",
        )
        .bind(session_id)
        .bind(booking_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ── Schedule cache ──

/// Read-through cache of [`Schedule`], refreshed after `ttl` or on invalidation.
pub struct ScheduleCache {
    ttl: Duration,
    entry: RwLock<Option<(Instant, Arc<Schedule>)>>,
}

impl ScheduleCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entry: RwLock::new(None),
        }
    }

    pub async fn get(&self, store: &Store) -> Result<Arc<Schedule>, StoreError> {
        if let Some((loaded_at, schedule)) = self.entry.read().await.as_ref() {
            if loaded_at.elapsed() < self.ttl {
                return Ok(schedule.clone());
            }
        }
        let schedule = Arc::new(store.load_schedule().await?);
        *self.entry.write().await = Some((Instant::now(), schedule.clone()));
        Ok(schedule)
    }

    pub async fn invalidate(&self) {
        *self.entry.write().await = None;
    }
}
