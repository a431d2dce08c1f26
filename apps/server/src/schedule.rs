//! Working-hours template, slot generation and the date availability rules.
//!
//! Every calendar day in the system is a [`LocalDate`] in the business
//! timezone: the availability predicate, the booked-slot query key and the
//! persisted `bookings.date` column all go through the same type, so a date
//! can never drift by one day between checking and storing.

use chrono::{Datelike, Duration, FixedOffset, NaiveDate, NaiveDateTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const DATE_FORMAT: &str = "%Y-%m-%d";
const MINUTES_PER_DAY: u32 = 24 * 60;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("invalid date '{0}', expected YYYY-MM-DD")]
    InvalidDate(String),
    #[error("invalid time '{0}', expected HH:MM")]
    InvalidTime(String),
    #[error("{0}: start and end are required when the day is enabled")]
    MissingHours(&'static str),
    #[error("{0}: start must be before end")]
    InvertedHours(&'static str),
    #[error("slot duration must be positive")]
    ZeroSlotDuration,
}

// ── LocalDate ──

/// A calendar day (`YYYY-MM-DD`) in the business timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LocalDate(NaiveDate);

impl LocalDate {
    pub fn from_ymd(year: i32, month: u32, day: u32) -> Option<Self> {
        NaiveDate::from_ymd_opt(year, month, day).map(Self)
    }

    pub fn naive(self) -> NaiveDate {
        self.0
    }

    pub fn weekday(self) -> Weekday {
        self.0.weekday()
    }

    pub fn add_days(self, days: i64) -> Self {
        Self(self.0 + Duration::days(days))
    }

    pub fn days_since(self, earlier: LocalDate) -> i64 {
        (self.0 - earlier.0).num_days()
    }
}

impl fmt::Display for LocalDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(DATE_FORMAT))
    }
}

impl FromStr for LocalDate {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        NaiveDate::parse_from_str(s.trim(), DATE_FORMAT)
            .map(Self)
            .map_err(|_| ScheduleError::InvalidDate(s.to_string()))
    }
}

impl TryFrom<String> for LocalDate {
    type Error = ScheduleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<LocalDate> for String {
    fn from(date: LocalDate) -> Self {
        date.to_string()
    }
}

// ── ClockTime ──

/// Time of day with minute precision, written `HH:MM`.
///
/// Parsing also accepts a trailing `:SS` so values copied from SQL `time`
/// columns round-trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClockTime(u16);

impl ClockTime {
    pub fn from_hm(hour: u16, minute: u16) -> Option<Self> {
        (hour < 24 && minute < 60).then_some(Self(hour * 60 + minute))
    }

    pub fn minutes(self) -> u32 {
        u32::from(self.0)
    }

    fn from_minutes(minutes: u32) -> Option<Self> {
        (minutes < MINUTES_PER_DAY).then(|| Self(minutes as u16))
    }

    pub fn hour(self) -> u16 {
        self.0 / 60
    }

    pub fn minute(self) -> u16 {
        self.0 % 60
    }

    /// Minutes from `self` to `later`, `None` when `later` is not after `self`.
    pub fn minutes_until(self, later: ClockTime) -> Option<u32> {
        (later.0 > self.0).then(|| u32::from(later.0 - self.0))
    }

    /// `self + minutes`, capped at 23:59 so an appointment never wraps into the next day.
    pub fn saturating_add_minutes(self, minutes: u32) -> ClockTime {
        let total = self.minutes().saturating_add(minutes).min(MINUTES_PER_DAY - 1);
        Self(total as u16)
    }

    pub fn on(self, date: LocalDate) -> NaiveDateTime {
        date.naive()
            .and_hms_opt(u32::from(self.hour()), u32::from(self.minute()), 0)
            .unwrap_or_else(|| date.naive().and_time(chrono::NaiveTime::MIN))
    }
}

impl fmt::Display for ClockTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour(), self.minute())
    }
}

impl FromStr for ClockTime {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ScheduleError::InvalidTime(s.to_string());
        let mut parts = s.trim().split(':');
        let (Some(h), Some(m)) = (parts.next(), parts.next()) else {
            return Err(invalid());
        };
        if let Some(sec) = parts.next() {
            if sec.len() != 2 || sec.parse::<u8>().map_or(true, |v| v >= 60) {
                return Err(invalid());
            }
        }
        if parts.next().is_some() || h.len() != 2 || m.len() != 2 {
            return Err(invalid());
        }
        let hour = h.parse().map_err(|_| invalid())?;
        let minute = m.parse().map_err(|_| invalid())?;
        Self::from_hm(hour, minute).ok_or_else(invalid)
    }
}

impl TryFrom<String> for ClockTime {
    type Error = ScheduleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ClockTime> for String {
    fn from(time: ClockTime) -> Self {
        time.to_string()
    }
}

// ── Settings ──

/// Opening hours for one weekday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WorkingHours {
    pub enabled: bool,
    pub start: Option<ClockTime>,
    pub end: Option<ClockTime>,
}

impl WorkingHours {
    pub fn open(start: ClockTime, end: ClockTime) -> Self {
        Self {
            enabled: true,
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn closed() -> Self {
        Self::default()
    }

    /// The `(start, end)` window when the day is bookable at all.
    pub fn window(&self) -> Option<(ClockTime, ClockTime)> {
        match (self.enabled, self.start, self.end) {
            (true, Some(start), Some(end)) if start < end => Some((start, end)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WeeklyTemplate {
    pub monday: WorkingHours,
    pub tuesday: WorkingHours,
    pub wednesday: WorkingHours,
    pub thursday: WorkingHours,
    pub friday: WorkingHours,
    pub saturday: WorkingHours,
    pub sunday: WorkingHours,
}

impl WeeklyTemplate {
    pub fn day(&self, weekday: Weekday) -> &WorkingHours {
        match weekday {
            Weekday::Mon => &self.monday,
            Weekday::Tue => &self.tuesday,
            Weekday::Wed => &self.wednesday,
            Weekday::Thu => &self.thursday,
            Weekday::Fri => &self.friday,
            Weekday::Sat => &self.saturday,
            Weekday::Sun => &self.sunday,
        }
    }

    pub fn day_mut(&mut self, weekday: Weekday) -> &mut WorkingHours {
        match weekday {
            Weekday::Mon => &mut self.monday,
            Weekday::Tue => &mut self.tuesday,
            Weekday::Wed => &mut self.wednesday,
            Weekday::Thu => &mut self.thursday,
            Weekday::Fri => &mut self.friday,
            Weekday::Sat => &mut self.saturday,
            Weekday::Sun => &mut self.sunday,
        }
    }
}

pub const WEEKDAYS: [Weekday; 7] = [
    Weekday::Mon,
    Weekday::Tue,
    Weekday::Wed,
    Weekday::Thu,
    Weekday::Fri,
    Weekday::Sat,
    Weekday::Sun,
];

pub fn weekday_name(weekday: Weekday) -> &'static str {
    match weekday {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LunchBreak {
    pub enabled: bool,
    pub start: Option<ClockTime>,
    pub end: Option<ClockTime>,
}

impl LunchBreak {
    fn contains(&self, time: ClockTime) -> bool {
        match (self.enabled, self.start, self.end) {
            (true, Some(start), Some(end)) => start <= time && time < end,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarSettings {
    /// Minutes per bookable slot.
    pub slot_duration: u16,
    pub max_advance_booking_days: u32,
    pub min_advance_booking_hours: u32,
    pub lunch_break: LunchBreak,
    pub weekly: WeeklyTemplate,
}

impl CalendarSettings {
    pub fn validate(&self) -> Result<(), ScheduleError> {
        if self.slot_duration == 0 {
            return Err(ScheduleError::ZeroSlotDuration);
        }
        for weekday in WEEKDAYS {
            let hours = self.weekly.day(weekday);
            if !hours.enabled {
                continue;
            }
            let name = weekday_name(weekday);
            match (hours.start, hours.end) {
                (Some(start), Some(end)) if start < end => {}
                (Some(_), Some(_)) => return Err(ScheduleError::InvertedHours(name)),
                _ => return Err(ScheduleError::MissingHours(name)),
            }
        }
        let lunch = &self.lunch_break;
        if lunch.enabled {
            match (lunch.start, lunch.end) {
                (Some(start), Some(end)) if start < end => {}
                (Some(_), Some(_)) => return Err(ScheduleError::InvertedHours("lunch_break")),
                _ => return Err(ScheduleError::MissingHours("lunch_break")),
            }
        }
        Ok(())
    }
}

// ── Policies ──

/// Whether the last slot of a day may run past closing time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotFit {
    /// A slot is offered if it starts before closing time.
    #[default]
    StartBeforeClose,
    /// A slot is offered only if it also ends by closing time.
    EndBeforeClose,
}

/// How `min_advance_booking_hours` is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MinAdvancePolicy {
    /// Only the day-level rules apply; the hour bound is informational.
    DateOnly,
    /// Slots starting earlier than `now + min_advance_booking_hours` are dropped.
    #[default]
    EnforceHours,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SchedulePolicy {
    pub slot_fit: SlotFit,
    pub min_advance: MinAdvancePolicy,
}

// ── Slot generation ──

/// Candidate slot start times for `date`, ascending.
pub fn generate_time_slots(
    date: LocalDate,
    settings: &CalendarSettings,
    fit: SlotFit,
) -> Vec<ClockTime> {
    let Some((start, end)) = settings.weekly.day(date.weekday()).window() else {
        return Vec::new();
    };
    let step = u32::from(settings.slot_duration);
    if step == 0 {
        return Vec::new();
    }

    let mut slots = Vec::new();
    let mut cursor = start.minutes();
    while cursor < end.minutes() {
        if fit == SlotFit::EndBeforeClose && cursor + step > end.minutes() {
            break;
        }
        let Some(slot) = ClockTime::from_minutes(cursor) else {
            break;
        };
        if !settings.lunch_break.contains(slot) {
            slots.push(slot);
        }
        cursor += step;
    }
    slots
}

// ── Availability ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DateRejection {
    #[error("date is in the past")]
    Past,
    #[error("no working hours on this weekday")]
    NonWorkingDay,
    #[error("date is blocked")]
    Blocked,
    #[error("date is beyond the booking horizon")]
    BeyondHorizon,
}

pub fn check_date(
    date: LocalDate,
    today: LocalDate,
    settings: &CalendarSettings,
    blocked: &BTreeSet<LocalDate>,
) -> Result<(), DateRejection> {
    if date < today {
        return Err(DateRejection::Past);
    }
    if !settings.weekly.day(date.weekday()).enabled {
        return Err(DateRejection::NonWorkingDay);
    }
    if blocked.contains(&date) {
        return Err(DateRejection::Blocked);
    }
    if date.days_since(today) > i64::from(settings.max_advance_booking_days) {
        return Err(DateRejection::BeyondHorizon);
    }
    Ok(())
}

pub fn is_date_available(
    date: LocalDate,
    today: LocalDate,
    settings: &CalendarSettings,
    blocked: &BTreeSet<LocalDate>,
) -> bool {
    check_date(date, today, settings, blocked).is_ok()
}

/// Settings plus the blocked-date set: everything the rules need besides "now".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    pub settings: CalendarSettings,
    pub blocked: BTreeSet<LocalDate>,
}

impl Schedule {
    pub fn check_date(&self, date: LocalDate, today: LocalDate) -> Result<(), DateRejection> {
        check_date(date, today, &self.settings, &self.blocked)
    }

    pub fn is_date_available(&self, date: LocalDate, today: LocalDate) -> bool {
        self.check_date(date, today).is_ok()
    }

    /// Offered slots for `date` after applying the min-advance policy.
    pub fn slots_for(
        &self,
        date: LocalDate,
        now: NaiveDateTime,
        policy: SchedulePolicy,
    ) -> Vec<ClockTime> {
        let slots = generate_time_slots(date, &self.settings, policy.slot_fit);
        match policy.min_advance {
            MinAdvancePolicy::DateOnly => slots,
            MinAdvancePolicy::EnforceHours => {
                let earliest =
                    now + Duration::hours(i64::from(self.settings.min_advance_booking_hours));
                slots
                    .into_iter()
                    .filter(|slot| slot.on(date) >= earliest)
                    .collect()
            }
        }
    }
}

// ── Clock ──

/// Wall clock of the business timezone.
#[derive(Debug, Clone, Copy)]
pub struct BusinessClock {
    offset: FixedOffset,
}

impl BusinessClock {
    pub fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }

    pub fn now(&self) -> NaiveDateTime {
        Utc::now().with_timezone(&self.offset).naive_local()
    }

    pub fn today(&self) -> LocalDate {
        LocalDate(self.now().date())
    }

    /// RFC 3339 timestamp for a local date and time.
    pub fn rfc3339(&self, date: LocalDate, time: ClockTime) -> String {
        let local = time.on(date);
        match local.and_local_timezone(self.offset).single() {
            Some(dt) => dt.to_rfc3339(),
            None => local.and_utc().to_rfc3339(),
        }
    }
}

// ── Tests ──
