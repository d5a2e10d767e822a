use std::fmt;
use std::sync::Mutex;

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveTime, TimeDelta, Utc, Weekday};

use crate::model::Day;

/// Source of "now". Only the reset scheduler and date labelling read it.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for driving the scheduler by hand.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(at) }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = at;
    }

    pub fn advance(&self, by: TimeDelta) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Weekly instant at which the pool resets: weekday + whole hour in a fixed offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetAnchor {
    weekday: Weekday,
    time: NaiveTime,
    offset: FixedOffset,
}

impl ResetAnchor {
    /// `None` if `hour` is not 0..=23 or the offset is outside ±23h.
    pub fn new(weekday: Weekday, hour: u32, utc_offset_hours: i32) -> Option<Self> {
        Some(Self {
            weekday,
            time: NaiveTime::from_hms_opt(hour, 0, 0)?,
            offset: FixedOffset::east_opt(utc_offset_hours.checked_mul(3600)?)?,
        })
    }

    /// Parse `<weekday>@<hour>`, e.g. `sunday@18` or `fri@17`.
    pub fn parse(spec: &str, utc_offset_hours: i32) -> Option<Self> {
        let (day, hour) = spec.trim().split_once('@')?;
        let weekday = day.trim().parse::<Weekday>().ok()?;
        let hour = hour.trim().parse::<u32>().ok()?;
        Self::new(weekday, hour, utc_offset_hours)
    }

    pub fn weekday(&self) -> Weekday {
        self.weekday
    }

    /// Latest anchor instant at or before `now`.
    pub fn most_recent(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let local = now.with_timezone(&self.offset).naive_local();
        let back = (local.weekday().num_days_from_monday() + 7
            - self.weekday.num_days_from_monday())
            % 7;
        let mut candidate = (local.date() - TimeDelta::days(back as i64)).and_time(self.time);
        if candidate > local {
            candidate = candidate - TimeDelta::days(7);
        }
        (candidate - TimeDelta::seconds(self.offset.local_minus_utc() as i64)).and_utc()
    }

    /// First anchor instant strictly after `now`.
    pub fn next_after(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        self.most_recent(now) + TimeDelta::days(7)
    }

    /// The Monday–Friday week opened by the most recent anchor: the first
    /// Monday on or after the anchor's local date.
    pub fn active_week(&self, now: DateTime<Utc>) -> WeekDates {
        let anchor_date = self
            .most_recent(now)
            .with_timezone(&self.offset)
            .date_naive();
        let forward = (7 - anchor_date.weekday().num_days_from_monday()) % 7;
        WeekDates::starting(anchor_date + TimeDelta::days(forward as i64))
    }
}

impl fmt::Display for ResetAnchor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} UTC{}", self.weekday, self.time.format("%H:%M"), self.offset)
    }
}

/// Calendar dates for one Monday–Friday week. Display only; carries no identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WeekDates {
    monday: NaiveDate,
}

impl WeekDates {
    pub fn starting(monday: NaiveDate) -> Self {
        debug_assert_eq!(monday.weekday(), Weekday::Mon);
        Self { monday }
    }

    pub fn monday(&self) -> NaiveDate {
        self.monday
    }

    pub fn friday(&self) -> NaiveDate {
        self.date_of(Day::Friday)
    }

    pub fn date_of(&self, day: Day) -> NaiveDate {
        self.monday + TimeDelta::days(day.offset() as i64)
    }

    /// e.g. "Mon 19 Oct".
    pub fn label(&self, day: Day) -> String {
        self.date_of(day).format("%a %d %b").to_string()
    }
}
