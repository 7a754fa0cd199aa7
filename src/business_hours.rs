//! Timezone-aware business-hour arithmetic.
//!
//! Every calculation runs on the local civil-time projection of an instant
//! and only converts back to an absolute instant when returning. A window of
//! 09:00–17:00 therefore stays 09:00–17:00 local on both sides of a DST
//! transition.

use std::collections::BTreeSet;

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;

use crate::config::ConfigError;
use crate::limits::MAX_CALENDAR_SCAN_DAYS;
use crate::model::{Span, Timestamp};

/// Years covered by the built-in US holiday list.
pub const DEFAULT_HOLIDAY_YEARS: std::ops::RangeInclusive<i32> = 2024..=2032;

#[derive(Debug, Clone, PartialEq)]
pub struct BusinessHoursConfig {
    pub start_hour: u32,
    /// Exclusive. `24` means "until midnight".
    pub end_hour: u32,
    /// ISO weekday numbers, Monday = 1 … Sunday = 7.
    pub business_days: BTreeSet<u32>,
    pub timezone: Tz,
    pub holidays: BTreeSet<NaiveDate>,
}

impl Default for BusinessHoursConfig {
    fn default() -> Self {
        Self {
            start_hour: 9,
            end_hour: 17,
            business_days: (1..=5).collect(),
            timezone: Tz::UTC,
            holidays: default_us_holidays(),
        }
    }
}

impl BusinessHoursConfig {
    pub fn new(
        start_hour: u32,
        end_hour: u32,
        business_days: impl IntoIterator<Item = u32>,
        timezone: Tz,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            start_hour,
            end_hour,
            business_days: business_days.into_iter().collect(),
            timezone,
            holidays: default_us_holidays(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.start_hour >= self.end_hour || self.end_hour > 24 {
            return Err(ConfigError::Invalid("business hours must satisfy start < end <= 24"));
        }
        if self.business_days.is_empty() {
            return Err(ConfigError::Invalid("at least one business day is required"));
        }
        if self.business_days.iter().any(|d| !(1..=7).contains(d)) {
            return Err(ConfigError::Invalid("business days are ISO weekday numbers 1..=7"));
        }
        Ok(())
    }

    /// Replace the holiday list.
    pub fn with_holidays(mut self, holidays: impl IntoIterator<Item = NaiveDate>) -> Self {
        self.holidays = holidays.into_iter().collect();
        self
    }

    pub fn with_timezone(mut self, timezone: Tz) -> Self {
        self.timezone = timezone;
        self
    }

    pub fn is_business_day(&self, date: NaiveDate) -> bool {
        self.business_days
            .contains(&date.weekday().number_from_monday())
            && !self.holidays.contains(&date)
    }

    /// Local civil start and end of the business window on `date`.
    pub fn local_window(&self, date: NaiveDate) -> (NaiveDateTime, NaiveDateTime) {
        let midnight = date.and_time(NaiveTime::MIN);
        (
            midnight + Duration::hours(i64::from(self.start_hour)),
            midnight + Duration::hours(i64::from(self.end_hour)),
        )
    }

    /// The business window on `date` as absolute instants, if `date` is a business day.
    pub fn window_on(&self, date: NaiveDate) -> Option<Span> {
        if !self.is_business_day(date) {
            return None;
        }
        let (start, end) = self.local_window(date);
        Span::try_new(localize(&self.timezone, start), localize(&self.timezone, end))
    }

    pub fn local(&self, instant: Timestamp) -> NaiveDateTime {
        instant.with_timezone(&self.timezone).naive_local()
    }
}

/// Project a local civil time back to an absolute instant. Ambiguous times
/// (clocks falling back) resolve to the earlier instant; times inside a
/// spring-forward gap move to the first valid local time after it.
pub fn localize(tz: &Tz, local: NaiveDateTime) -> Timestamp {
    let mut probe = local;
    for _ in 0..8 {
        if let Some(dt) = tz.from_local_datetime(&probe).earliest() {
            return dt.with_timezone(&Utc);
        }
        probe += Duration::minutes(15);
    }
    local.and_utc()
}

/// Business time between two instants, summed day by day.
pub fn business_time_elapsed(start: Timestamp, end: Timestamp, config: &BusinessHoursConfig) -> Duration {
    if end <= start {
        return Duration::zero();
    }
    let local_start = config.local(start);
    let local_end = config.local(end);

    let mut total = Duration::zero();
    for date in local_start.date().iter_days() {
        if date > local_end.date() {
            break;
        }
        if !config.is_business_day(date) {
            continue;
        }
        let (window_start, window_end) = config.local_window(date);
        let from = window_start.max(local_start);
        let to = window_end.min(local_end);
        if from < to {
            total += to - from;
        }
    }
    total
}

/// Whole business hours between two instants (floored).
pub fn business_hours_elapsed(start: Timestamp, end: Timestamp, config: &BusinessHoursConfig) -> i64 {
    business_time_elapsed(start, end, config).num_hours()
}

pub fn is_business_hours(instant: Timestamp, config: &BusinessHoursConfig) -> bool {
    let local = config.local(instant);
    if !config.is_business_day(local.date()) {
        return false;
    }
    let (window_start, window_end) = config.local_window(local.date());
    window_start <= local && local < window_end
}

/// Smallest instant `>= instant` inside business hours. `None` if no business
/// day exists within the scan horizon (e.g. every remaining date is a holiday).
pub fn next_business_hours(instant: Timestamp, config: &BusinessHoursConfig) -> Option<Timestamp> {
    if is_business_hours(instant, config) {
        return Some(instant);
    }
    let local = config.local(instant);
    let today = local.date();
    for offset in 0..MAX_CALENDAR_SCAN_DAYS {
        let date = today + Duration::days(offset);
        if !config.is_business_day(date) {
            continue;
        }
        let (window_start, _) = config.local_window(date);
        if window_start > local {
            return Some(localize(&config.timezone, window_start));
        }
    }
    None
}

/// The instant at which `target_business_hours` of business time have
/// elapsed since `created_at`. Always lands strictly inside a business window:
/// a target that exactly exhausts one day rolls over to the next day's start.
/// `None` when the target needs more than `MAX_CALENDAR_SCAN_DAYS` business days.
pub fn follow_up_send_time(
    created_at: Timestamp,
    target_business_hours: u32,
    config: &BusinessHoursConfig,
) -> Option<Timestamp> {
    let mut remaining = Duration::hours(i64::from(target_business_hours));
    let mut cursor = next_business_hours(created_at, config)?;
    for _ in 0..MAX_CALENDAR_SCAN_DAYS {
        let local = config.local(cursor);
        let (_, window_end) = config.local_window(local.date());
        let available = window_end - local;
        if remaining < available {
            return Some(localize(&config.timezone, local + remaining));
        }
        remaining -= available;
        cursor = next_business_hours(localize(&config.timezone, window_end), config)?;
    }
    None
}

// ── Default holiday calendar ─────────────────────────────────────

/// US federal holidays for `DEFAULT_HOLIDAY_YEARS`, using observed dates.
pub fn default_us_holidays() -> BTreeSet<NaiveDate> {
    DEFAULT_HOLIDAY_YEARS.flat_map(us_federal_holidays).collect()
}

/// US federal holidays in `year`. Fixed-date holidays falling on a weekend
/// are observed on the adjacent Friday or Monday.
pub fn us_federal_holidays(year: i32) -> Vec<NaiveDate> {
    let fixed = [(1, 1), (6, 19), (7, 4), (11, 11), (12, 25)];
    let floating = [
        (1, Weekday::Mon, 3),  // Martin Luther King Jr. Day
        (2, Weekday::Mon, 3),  // Washington's Birthday
        (9, Weekday::Mon, 1),  // Labor Day
        (10, Weekday::Mon, 2), // Columbus Day
        (11, Weekday::Thu, 4), // Thanksgiving
    ];

    let mut days: Vec<NaiveDate> = fixed
        .iter()
        .filter_map(|&(m, d)| NaiveDate::from_ymd_opt(year, m, d))
        .map(observed)
        .collect();
    days.extend(
        floating
            .iter()
            .filter_map(|&(m, wd, n)| NaiveDate::from_weekday_of_month_opt(year, m, wd, n)),
    );
    // Memorial Day: last Monday of May.
    if let Some(day) = NaiveDate::from_weekday_of_month_opt(year, 5, Weekday::Mon, 5)
        .or_else(|| NaiveDate::from_weekday_of_month_opt(year, 5, Weekday::Mon, 4))
    {
        days.push(day);
    }
    days.sort();
    days
}

fn observed(date: NaiveDate) -> NaiveDate {
    match date.weekday() {
        Weekday::Sat => date - Duration::days(1),
        Weekday::Sun => date + Duration::days(1),
        _ => date,
    }
}
