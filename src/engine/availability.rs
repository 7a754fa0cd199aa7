use chrono::Duration;

use crate::business_hours::{BusinessHoursConfig, is_business_hours};
use crate::limits::MAX_HORIZON_DAYS;
use crate::model::*;

// ── Slot search ───────────────────────────────────────────────────

/// Where and how finely to look for slots.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotSearch {
    /// Daily window, weekdays and holidays considered bookable.
    pub hours: BusinessHoursConfig,
    /// Step between candidate starts inside one free gap.
    pub stride_minutes: u32,
    /// Minimum notice applied when the caller does not pass a floor.
    pub default_notice_minutes: u32,
    pub horizon_days: u32,
}

impl Default for SlotSearch {
    fn default() -> Self {
        Self {
            hours: BusinessHoursConfig::default(),
            stride_minutes: 30,
            default_notice_minutes: 60,
            horizon_days: 7,
        }
    }
}

impl SlotSearch {
    pub fn default_floor(&self, now: Timestamp) -> Timestamp {
        now + Duration::minutes(i64::from(self.default_notice_minutes))
    }
}

/// Enumerate free slots of `duration_minutes` common to every party.
///
/// 1. Merge all parties' busy intervals into one sorted timeline.
/// 2. For each bookable day in `[now, now + horizon_days]`, subtract the
///    timeline from that day's business window to get free gaps. The
///    horizon is capped at `MAX_HORIZON_DAYS`.
/// 3. Walk each gap on `stride_minutes`, emitting every start whose slot
///    still fits in the gap.
///
/// Only starts strictly after `search_floor` and strictly inside business
/// hours are emitted. Output is chronological.
pub fn find_slots(
    busy_by_party: &[Vec<BusyInterval>],
    duration_minutes: u32,
    horizon_days: u32,
    search_floor: Timestamp,
    now: Timestamp,
    search: &SlotSearch,
) -> Vec<Span> {
    if duration_minutes == 0 {
        return Vec::new();
    }
    let duration = Duration::minutes(i64::from(duration_minutes));
    let stride = Duration::minutes(i64::from(search.stride_minutes.max(1)));
    let horizon = Duration::days(i64::from(horizon_days.min(MAX_HORIZON_DAYS)));
    let Some(horizon_end) = now.checked_add_signed(horizon) else {
        return Vec::new();
    };

    let busy = merged_timeline(busy_by_party);

    let first_day = search.hours.local(now).date();
    let last_day = search.hours.local(horizon_end).date();

    let mut slots = Vec::new();
    for day in first_day.iter_days() {
        if day > last_day {
            break;
        }
        let Some(window) = search.hours.window_on(day) else {
            continue;
        };
        let Some(window) = Span::try_new(window.start, window.end.min(horizon_end)) else {
            continue;
        };
        if window.duration() < duration {
            continue;
        }

        for gap in subtract_intervals(&[window], &busy) {
            let mut start = gap.start;
            while start + duration <= gap.end {
                if start > search_floor && is_business_hours(start, &search.hours) {
                    slots.push(Span::new(start, start + duration));
                }
                start += stride;
            }
        }
    }
    slots
}

/// All parties' busy intervals as one sorted, disjoint list.
pub fn merged_timeline(busy_by_party: &[Vec<BusyInterval>]) -> Vec<Span> {
    let mut all: Vec<Span> = busy_by_party.iter().flatten().copied().collect();
    all.sort_by_key(|s| s.start);
    merge_overlapping(&all)
}

/// Merge sorted overlapping/adjacent intervals into disjoint intervals.
pub fn merge_overlapping(sorted: &[Span]) -> Vec<Span> {
    let mut merged: Vec<Span> = Vec::new();
    for &span in sorted {
        if let Some(last) = merged.last_mut()
            && span.start <= last.end {
                last.end = last.end.max(span.end);
                continue;
            }
        merged.push(span);
    }
    merged
}

/// `base` minus `to_remove`. Both inputs sorted by start; `to_remove` disjoint.
pub fn subtract_intervals(base: &[Span], to_remove: &[Span]) -> Vec<Span> {
    let mut result = Vec::new();
    let mut ri = 0;

    for &b in base {
        let mut current_start = b.start;
        let current_end = b.end;

        while ri < to_remove.len() && to_remove[ri].end <= current_start {
            ri += 1;
        }

        let mut j = ri;
        while j < to_remove.len() && to_remove[j].start < current_end {
            let r = &to_remove[j];
            if r.start > current_start {
                result.push(Span::new(current_start, r.start));
            }
            current_start = current_start.max(r.end);
            j += 1;
        }

        if current_start < current_end {
            result.push(Span::new(current_start, current_end));
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike, Utc};

    // 2026-03-02 is a Monday.
    fn t(day: u32, h: u32, m: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2026, 3, day, h, m, 0).unwrap()
    }

    fn span(a: Timestamp, b: Timestamp) -> Span {
        Span::new(a, b)
    }

    // ── subtract_intervals ────────────────────────────────

    #[test]
    fn subtract_no_overlap() {
        let base = vec![span(t(2, 9, 0), t(2, 10, 0)), span(t(2, 11, 0), t(2, 12, 0))];
        let remove = vec![span(t(2, 10, 0), t(2, 11, 0))];
        assert_eq!(subtract_intervals(&base, &remove), base);
    }

    #[test]
    fn subtract_full_overlap() {
        let base = vec![span(t(2, 9, 0), t(2, 10, 0))];
        let remove = vec![span(t(2, 8, 0), t(2, 11, 0))];
        assert!(subtract_intervals(&base, &remove).is_empty());
    }

    #[test]
    fn subtract_multiple_punches() {
        let base = vec![span(t(2, 9, 0), t(2, 17, 0))];
        let remove = vec![
            span(t(2, 10, 0), t(2, 11, 0)),
            span(t(2, 12, 0), t(2, 13, 0)),
            span(t(2, 16, 0), t(2, 18, 0)),
        ];
        assert_eq!(
            subtract_intervals(&base, &remove),
            vec![
                span(t(2, 9, 0), t(2, 10, 0)),
                span(t(2, 11, 0), t(2, 12, 0)),
                span(t(2, 13, 0), t(2, 16, 0)),
            ]
        );
    }

    // ── merge_overlapping ────────────────────────────────

    #[test]
    fn merge_overlapping_and_adjacent() {
        let spans = vec![
            span(t(2, 9, 0), t(2, 10, 0)),
            span(t(2, 9, 30), t(2, 11, 0)),
            span(t(2, 11, 0), t(2, 11, 30)),
            span(t(2, 13, 0), t(2, 14, 0)),
        ];
        assert_eq!(
            merge_overlapping(&spans),
            vec![span(t(2, 9, 0), t(2, 11, 30)), span(t(2, 13, 0), t(2, 14, 0))]
        );
    }

    #[test]
    fn timeline_merges_across_parties() {
        let a = vec![span(t(2, 9, 0), t(2, 10, 0))];
        let b = vec![span(t(2, 9, 30), t(2, 10, 30)), span(t(2, 9, 0), t(2, 9, 15))];
        assert_eq!(merged_timeline(&[a, b]), vec![span(t(2, 9, 0), t(2, 10, 30))]);
    }

    // ── find_slots ────────────────────────────────────────

    fn search() -> SlotSearch {
        SlotSearch {
            hours: BusinessHoursConfig::default().with_holidays(Vec::new()),
            ..SlotSearch::default()
        }
    }

    #[test]
    fn empty_calendars_fill_business_window_on_stride() {
        let now = t(2, 6, 0);
        let slots = find_slots(&[vec![], vec![]], 30, 1, search().default_floor(now), now, &search());
        // Monday 09:00 .. 16:30, every 30 minutes; Tuesday 09:00..06:00 cut by horizon.
        assert_eq!(slots.len(), 16);
        assert_eq!(slots[0], span(t(2, 9, 0), t(2, 9, 30)));
        assert_eq!(slots[15], span(t(2, 16, 30), t(2, 17, 0)));
    }

    #[test]
    fn busy_time_of_any_party_is_excluded() {
        let now = t(2, 6, 0);
        let a = vec![span(t(2, 9, 0), t(2, 12, 0))];
        let b = vec![span(t(2, 12, 0), t(2, 16, 0))];
        let slots = find_slots(&[a, b], 60, 1, now, now, &search());
        assert_eq!(slots, vec![span(t(2, 16, 0), t(2, 17, 0))]);
    }

    #[test]
    fn off_grid_gap_start_is_kept() {
        let now = t(2, 6, 0);
        let a = vec![span(t(2, 9, 0), t(2, 16, 10))];
        let slots = find_slots(&[a], 30, 1, now, now, &search());
        assert_eq!(slots, vec![span(t(2, 16, 10), t(2, 16, 40))]);
    }

    #[test]
    fn fully_booked_day_contributes_nothing() {
        let now = t(2, 6, 0);
        let a = vec![span(t(2, 8, 0), t(2, 18, 0))];
        let slots = find_slots(&[a], 30, 2, now, now, &search());
        assert!(slots.iter().all(|s| s.start >= t(3, 9, 0)));
        assert!(!slots.is_empty());
    }

    #[test]
    fn floor_is_strict() {
        let now = t(2, 9, 0);
        let floor = search().default_floor(now);
        let slots = find_slots(&[vec![]], 30, 1, floor, now, &search());
        assert_eq!(slots[0].start, t(2, 10, 30));
    }

    #[test]
    fn weekends_and_holidays_are_skipped() {
        // Friday evening, three-day horizon.
        let now = t(6, 18, 0);
        let slots = find_slots(&[vec![]], 30, 3, now, now, &search());
        assert!(slots.iter().all(|s| s.start >= t(9, 9, 0)));

        let holiday_search = SlotSearch {
            hours: BusinessHoursConfig::default()
                .with_holidays([chrono::NaiveDate::from_ymd_opt(2026, 3, 9).unwrap()]),
            ..SlotSearch::default()
        };
        assert!(find_slots(&[vec![]], 30, 3, now, now, &holiday_search).is_empty());
    }

    #[test]
    fn every_start_is_inside_business_hours() {
        let now = t(2, 13, 17);
        let busy = vec![
            span(t(2, 14, 5), t(2, 15, 20)),
            span(t(3, 8, 0), t(3, 9, 45)),
            span(t(4, 16, 50), t(4, 19, 0)),
        ];
        let slots = find_slots(&[busy], 45, 7, now, now, &search());
        assert!(!slots.is_empty());
        for s in &slots {
            assert!((9..17).contains(&s.start.hour()), "{s:?}");
            assert!(s.end <= s.start.date_naive().and_hms_opt(17, 0, 0).unwrap().and_utc());
        }
    }

    #[test]
    fn local_timezone_window() {
        let tz_search = SlotSearch {
            hours: BusinessHoursConfig::default()
                .with_timezone(chrono_tz::America::New_York)
                .with_holidays(Vec::new()),
            ..SlotSearch::default()
        };
        let now = t(2, 0, 0);
        let slots = find_slots(&[vec![]], 60, 1, now, now, &tz_search);
        // 09:00 EST = 14:00 UTC
        assert_eq!(slots[0].start, t(2, 14, 0));
        assert_eq!(slots.last().unwrap().end, t(2, 22, 0));
    }

    #[test]
    fn zero_duration_yields_nothing() {
        let now = t(2, 6, 0);
        assert!(find_slots(&[vec![]], 0, 1, now, now, &search()).is_empty());
    }

    #[test]
    fn oversized_horizon_is_capped() {
        let now = t(2, 6, 0);
        let slots = find_slots(&[vec![]], 30, u32::MAX, now, now, &search());
        let capped = find_slots(&[vec![]], 30, MAX_HORIZON_DAYS, now, now, &search());
        assert!(!slots.is_empty());
        assert_eq!(slots, capped);
        assert!(slots.last().unwrap().end <= now + Duration::days(i64::from(MAX_HORIZON_DAYS)));

        let end_of_time = chrono::DateTime::<Utc>::MAX_UTC - Duration::days(1);
        assert!(find_slots(&[vec![]], 30, 7, end_of_time, end_of_time, &search()).is_empty());
    }
}
