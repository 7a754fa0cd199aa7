use std::cmp::Ordering;

use chrono::{Datelike, Duration, NaiveTime, Timelike, Weekday};
use chrono_tz::Tz;

use crate::model::*;

use super::availability::{SlotSearch, find_slots, merged_timeline};

/// Additive bonus for slots starting in `[start_hour, end_hour)` local time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeBand {
    pub start_hour: u32,
    pub end_hour: u32,
    pub bonus: f64,
}

/// Heuristic weights for slot scoring. Passed in explicitly; the engine keeps
/// no process-wide scoring constants.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoringWeights {
    pub base: f64,
    /// First matching band wins.
    pub bands: Vec<TimeBand>,
    /// Inclusive local window `[start, end]` that earns `preferred_window_bonus`.
    pub preferred_window: (NaiveTime, NaiveTime),
    pub preferred_window_bonus: f64,
    /// Start on `:00` or `:30`.
    pub round_start_bonus: f64,
    pub midweek_days: Vec<Weekday>,
    pub midweek_bonus: f64,
    pub near_days: i64,
    pub near_bonus: f64,
    pub soon_days: i64,
    pub soon_bonus: f64,
    pub buffer_minutes: i64,
    pub buffer_bonus: f64,
    pub back_to_back_bonus: f64,
    /// Only used when preferences list preferred days. Ranks among otherwise
    /// equal slots; never lifts a clamped score.
    pub preferred_day_bonus: f64,
    pub max_score: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            base: 0.5,
            bands: vec![
                TimeBand { start_hour: 9, end_hour: 12, bonus: 0.8 },
                TimeBand { start_hour: 13, end_hour: 15, bonus: 1.0 },
                TimeBand { start_hour: 15, end_hour: 17, bonus: 0.6 },
            ],
            preferred_window: (
                NaiveTime::MIN + Duration::hours(10),
                NaiveTime::MIN + Duration::hours(16),
            ),
            preferred_window_bonus: 0.3,
            round_start_bonus: 0.2,
            midweek_days: vec![Weekday::Tue, Weekday::Wed, Weekday::Thu],
            midweek_bonus: 0.2,
            near_days: 2,
            near_bonus: 0.3,
            soon_days: 4,
            soon_bonus: 0.2,
            buffer_minutes: 15,
            buffer_bonus: 0.3,
            back_to_back_bonus: 0.2,
            preferred_day_bonus: 0.2,
            max_score: 1.0,
        }
    }
}

/// Scores slots against one search's busy timeline.
///
/// `busy` is every party's busy intervals; it need not be merged, but
/// `search_candidates` passes the merged timeline.
pub struct Scorer<'a> {
    pub weights: &'a ScoringWeights,
    pub busy: &'a [Span],
    pub now: Timestamp,
    pub timezone: Tz,
    pub preferences: Option<&'a SchedulingPreferences>,
}

impl Scorer<'_> {
    /// Accumulated heuristic before clamping.
    pub fn raw_score(&self, slot: &Span) -> f64 {
        let w = self.weights;
        let local = slot.start.with_timezone(&self.timezone);
        let time = local.time();
        let mut score = w.base;

        if let Some(band) = w
            .bands
            .iter()
            .find(|b| (b.start_hour..b.end_hour).contains(&time.hour()))
        {
            score += band.bonus;
        }
        let (pref_start, pref_end) = w.preferred_window;
        if pref_start <= time && time <= pref_end {
            score += w.preferred_window_bonus;
        }
        if time.second() == 0 && time.minute() % 30 == 0 {
            score += w.round_start_bonus;
        }
        if w.midweek_days.contains(&local.weekday()) {
            score += w.midweek_bonus;
        }

        let lead = slot.start - self.now;
        if lead <= Duration::days(w.near_days) {
            score += w.near_bonus;
        } else if lead <= Duration::days(w.soon_days) {
            score += w.soon_bonus;
        }

        let margin = Duration::minutes(w.buffer_minutes);
        let crowded = self.busy.iter().any(|b| {
            (slot.start - margin <= b.end && b.end <= slot.start)
                || (slot.end <= b.start && b.start <= slot.end + margin)
        });
        if !crowded {
            score += w.buffer_bonus;
        }
        if !self.busy.iter().any(|b| b.end == slot.start) {
            score += w.back_to_back_bonus;
        }

        if let Some(prefs) = self.preferences
            && prefs.preferred_days.contains(&local.weekday())
        {
            score += w.preferred_day_bonus;
        }
        score
    }

    /// Final score in `[0, max_score]`.
    pub fn score(&self, slot: &Span) -> f64 {
        self.raw_score(slot).clamp(0.0, self.weights.max_score)
    }

    /// Hard preference filters. Everything passes without preferences.
    pub fn admits(&self, slot: &Span) -> bool {
        let Some(prefs) = self.preferences else {
            return true;
        };
        let start = slot.start.with_timezone(&self.timezone);
        let end = slot.end.with_timezone(&self.timezone);

        if start.date_naive() != end.date_naive() && end.time() != NaiveTime::MIN {
            return false;
        }
        if start.time() < prefs.earliest_time {
            return false;
        }
        // An end at local midnight counts as the end of the day.
        if end.time() != NaiveTime::MIN && end.time() > prefs.latest_time {
            return false;
        }
        if prefs.avoid_days.contains(&start.weekday()) {
            return false;
        }
        if let Some(lunch) = prefs.lunch_break
            && start.time() < lunch.end
            && lunch.start < end.time()
        {
            return false;
        }
        if slot.start < self.now + Duration::hours(i64::from(prefs.minimum_notice_hours)) {
            return false;
        }
        if !prefs.allow_same_day
            && start.date_naive() == self.now.with_timezone(&self.timezone).date_naive()
        {
            return false;
        }

        if prefs.buffer_minutes > 0 {
            let margin = Duration::minutes(i64::from(prefs.buffer_minutes));
            let padded = Span::new(slot.start - margin, slot.end + margin);
            if self.busy.iter().any(|b| b.overlaps(&padded)) {
                return false;
            }
        } else if !prefs.allow_back_to_back
            && self
                .busy
                .iter()
                .any(|b| b.end == slot.start || b.start == slot.end)
        {
            return false;
        }
        true
    }

    /// Filter, score and order `slots`; keep the best `limit`.
    ///
    /// Order: clamped score desc, then raw score desc, then earlier start.
    pub fn rank_candidates(&self, slots: &[Span], limit: usize) -> Vec<CandidateSlot> {
        let mut scored: Vec<(CandidateSlot, f64)> = slots
            .iter()
            .filter(|s| self.admits(s))
            .map(|s| {
                let raw = self.raw_score(s);
                let slot = CandidateSlot {
                    start: s.start,
                    end: s.end,
                    score: raw.clamp(0.0, self.weights.max_score),
                };
                (slot, raw)
            })
            .collect();

        scored.sort_by(|(a, a_raw), (b, b_raw)| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b_raw.total_cmp(a_raw))
                .then_with(|| a.start.cmp(&b.start))
        });
        scored.truncate(limit);
        scored.into_iter().map(|(slot, _)| slot).collect()
    }
}

/// Sort by score descending, ties broken by earlier start. Stable for equal keys.
pub fn rank(mut slots: Vec<CandidateSlot>) -> Vec<CandidateSlot> {
    slots.sort_by(by_score_then_start);
    slots
}

fn by_score_then_start(a: &CandidateSlot, b: &CandidateSlot) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.start.cmp(&b.start))
}

/// Slot finder + scorer in one call: the best `limit` slots common to every party.
///
/// The search floor is the later of the default notice and the preferences'
/// minimum notice.
pub fn search_candidates(
    busy_by_party: &[Vec<BusyInterval>],
    duration_minutes: u32,
    preferences: Option<&SchedulingPreferences>,
    now: Timestamp,
    search: &SlotSearch,
    weights: &ScoringWeights,
    limit: usize,
) -> Vec<CandidateSlot> {
    let mut floor = search.default_floor(now);
    if let Some(prefs) = preferences {
        floor = floor.max(now + Duration::hours(i64::from(prefs.minimum_notice_hours)));
    }
    let slots = find_slots(
        busy_by_party,
        duration_minutes,
        search.horizon_days,
        floor,
        now,
        search,
    );
    let busy = merged_timeline(busy_by_party);
    let scorer = Scorer {
        weights,
        busy: &busy,
        now,
        timezone: search.hours.timezone,
        preferences,
    };
    scorer.rank_candidates(&slots, limit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::business_hours::BusinessHoursConfig;
    use chrono::{TimeZone, Utc};

    // 2026-03-02 is a Monday.
    fn t(day: u32, h: u32, m: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2026, 3, day, h, m, 0).unwrap()
    }

    fn scorer<'a>(
        weights: &'a ScoringWeights,
        busy: &'a [Span],
        now: Timestamp,
        preferences: Option<&'a SchedulingPreferences>,
    ) -> Scorer<'a> {
        Scorer {
            weights,
            busy,
            now,
            timezone: Tz::UTC,
            preferences,
        }
    }

    fn search() -> SlotSearch {
        SlotSearch {
            hours: BusinessHoursConfig::default().with_holidays(Vec::new()),
            ..SlotSearch::default()
        }
    }

    #[test]
    fn raw_score_components() {
        let w = ScoringWeights::default();
        let now = t(2, 8, 0);

        // Tue 13:00, empty calendars: every bonus applies.
        let s = scorer(&w, &[], now, None);
        let raw = s.raw_score(&Span::new(t(3, 13, 0), t(3, 13, 30)));
        assert!((raw - 3.0).abs() < 1e-9, "{raw}");

        // Mon 09:10: morning band, no preferred window, not round, no midweek.
        let raw = s.raw_score(&Span::new(t(2, 9, 10), t(2, 9, 40)));
        assert!((raw - (0.5 + 0.8 + 0.3 + 0.3 + 0.2)).abs() < 1e-9, "{raw}");

        // 12:00 lunch hour has no band.
        let raw = s.raw_score(&Span::new(t(2, 12, 0), t(2, 12, 30)));
        assert!((raw - (0.5 + 0.3 + 0.2 + 0.3 + 0.3 + 0.2)).abs() < 1e-9, "{raw}");
    }

    #[test]
    fn recency_steps_down_then_stops() {
        let w = ScoringWeights::default();
        let now = t(2, 8, 0);
        let s = scorer(&w, &[], now, None);
        let mon = s.raw_score(&Span::new(t(2, 13, 0), t(2, 13, 30)));
        let next_mon = s.raw_score(&Span::new(t(9, 13, 0), t(9, 13, 30)));
        let fri = s.raw_score(&Span::new(t(6, 13, 0), t(6, 13, 30)));
        assert!((mon - next_mon - 0.3).abs() < 1e-9);
        assert!((fri - next_mon).abs() < 1e-9);
        let thu = s.raw_score(&Span::new(t(5, 13, 0), t(5, 13, 30)));
        let wed = s.raw_score(&Span::new(t(4, 13, 0), t(4, 13, 30)));
        assert!((thu - wed).abs() < 1e-9);
    }

    #[test]
    fn buffer_and_back_to_back_bonuses() {
        let w = ScoringWeights::default();
        let now = t(2, 8, 0);
        let slot = Span::new(t(3, 13, 0), t(3, 13, 30));
        let clear = scorer(&w, &[], now, None).raw_score(&slot);

        let abutting = [Span::new(t(3, 12, 0), t(3, 13, 0))];
        let raw = scorer(&w, &abutting, now, None).raw_score(&slot);
        assert!((clear - raw - 0.5).abs() < 1e-9);

        let near = [Span::new(t(3, 12, 0), t(3, 12, 50))];
        let raw = scorer(&w, &near, now, None).raw_score(&slot);
        assert!((clear - raw - 0.3).abs() < 1e-9);

        let after = [Span::new(t(3, 13, 40), t(3, 14, 0))];
        let raw = scorer(&w, &after, now, None).raw_score(&slot);
        assert!((clear - raw - 0.3).abs() < 1e-9);

        let far = [Span::new(t(3, 11, 0), t(3, 12, 30))];
        let raw = scorer(&w, &far, now, None).raw_score(&slot);
        assert!((clear - raw).abs() < 1e-9);
    }

    #[test]
    fn scores_are_clamped_and_floored() {
        let w = ScoringWeights::default();
        let now = t(2, 6, 0);
        let slots = find_slots(&[vec![]], 30, 7, now, now, &search());
        let s = scorer(&w, &[], now, None);
        for slot in &slots {
            let score = s.score(slot);
            assert!((0.5..=1.0).contains(&score), "{slot:?} {score}");
        }
    }

    #[test]
    fn rank_breaks_ties_by_start_and_is_stable() {
        let a = CandidateSlot { start: t(3, 10, 0), end: t(3, 10, 30), score: 0.9 };
        let b = CandidateSlot { start: t(3, 9, 0), end: t(3, 9, 30), score: 0.9 };
        let c = CandidateSlot { start: t(3, 8, 0), end: t(3, 8, 30), score: 1.0 };
        let ranked = rank(vec![a, b, c]);
        assert_eq!(ranked, vec![c, b, a]);
        assert_eq!(rank(ranked.clone()), ranked);
    }

    #[test]
    fn empty_calendars_best_slot_is_early_afternoon_midweek_and_soon() {
        let now = t(2, 8, 0);
        let best = search_candidates(
            &[vec![], vec![]],
            30,
            None,
            now,
            &search(),
            &ScoringWeights::default(),
            5,
        );
        assert_eq!(best.len(), 5);
        let top = best[0];
        assert_eq!(top.start, t(3, 13, 0));
        assert_eq!(top.score, 1.0);
        assert!(best.windows(2).all(|w| w[0].score >= w[1].score));
    }

    #[test]
    fn avoid_days_and_lunch_filter() {
        let now = t(2, 8, 0);
        let prefs = SchedulingPreferences {
            avoid_days: vec![Weekday::Tue],
            lunch_break: Some(LunchBreak {
                start: NaiveTime::MIN + Duration::hours(12),
                end: NaiveTime::MIN + Duration::hours(14),
            }),
            ..SchedulingPreferences::default()
        };
        let best = search_candidates(
            &[vec![]],
            60,
            Some(&prefs),
            now,
            &search(),
            &ScoringWeights::default(),
            50,
        );
        assert!(!best.is_empty());
        for slot in &best {
            assert_ne!(slot.start.weekday(), Weekday::Tue);
            let (s, e) = (slot.start.time(), slot.end.time());
            assert!(e <= prefs.lunch_break.unwrap().start || s >= prefs.lunch_break.unwrap().end);
        }
    }

    #[test]
    fn earliest_latest_bounds() {
        let now = t(2, 8, 0);
        let prefs = SchedulingPreferences {
            earliest_time: NaiveTime::MIN + Duration::hours(11),
            latest_time: NaiveTime::MIN + Duration::hours(15),
            ..SchedulingPreferences::default()
        };
        let w = ScoringWeights::default();
        let s = scorer(&w, &[], now, Some(&prefs));
        assert!(!s.admits(&Span::new(t(3, 10, 30), t(3, 11, 30))));
        assert!(s.admits(&Span::new(t(3, 11, 0), t(3, 12, 0))));
        assert!(s.admits(&Span::new(t(3, 14, 0), t(3, 15, 0))));
        assert!(!s.admits(&Span::new(t(3, 14, 30), t(3, 15, 30))));
    }

    #[test]
    fn minimum_notice_and_same_day() {
        let now = t(2, 8, 0);
        let prefs = SchedulingPreferences {
            minimum_notice_hours: 24,
            ..SchedulingPreferences::default()
        };
        let best = search_candidates(
            &[vec![]],
            30,
            Some(&prefs),
            now,
            &search(),
            &ScoringWeights::default(),
            100,
        );
        assert!(best.iter().all(|s| s.start >= t(3, 8, 0)));

        let prefs = SchedulingPreferences {
            allow_same_day: false,
            ..SchedulingPreferences::default()
        };
        let w = ScoringWeights::default();
        let s = scorer(&w, &[], now, Some(&prefs));
        assert!(!s.admits(&Span::new(t(2, 15, 0), t(2, 15, 30))));
        assert!(s.admits(&Span::new(t(3, 9, 0), t(3, 9, 30))));
    }

    #[test]
    fn buffer_and_back_to_back_preferences() {
        let now = t(2, 8, 0);
        let busy = [Span::new(t(3, 10, 0), t(3, 11, 0))];

        let prefs = SchedulingPreferences {
            buffer_minutes: 30,
            ..SchedulingPreferences::default()
        };
        let w = ScoringWeights::default();
        let s = scorer(&w, &busy, now, Some(&prefs));
        assert!(!s.admits(&Span::new(t(3, 11, 0), t(3, 11, 30))));
        assert!(!s.admits(&Span::new(t(3, 9, 0), t(3, 9, 45))));
        assert!(s.admits(&Span::new(t(3, 11, 30), t(3, 12, 0))));
        assert!(s.admits(&Span::new(t(3, 9, 0), t(3, 9, 30))));

        let prefs = SchedulingPreferences {
            allow_back_to_back: false,
            ..SchedulingPreferences::default()
        };
        let w = ScoringWeights::default();
        let s = scorer(&w, &busy, now, Some(&prefs));
        assert!(!s.admits(&Span::new(t(3, 11, 0), t(3, 11, 30))));
        assert!(!s.admits(&Span::new(t(3, 9, 30), t(3, 10, 0))));
        assert!(s.admits(&Span::new(t(3, 11, 30), t(3, 12, 0))));
    }

    #[test]
    fn preferred_days_break_clamped_ties() {
        let now = t(2, 8, 0);
        let prefs = SchedulingPreferences {
            preferred_days: vec![Weekday::Wed],
            ..SchedulingPreferences::default()
        };
        let best = search_candidates(
            &[vec![]],
            30,
            Some(&prefs),
            now,
            &search(),
            &ScoringWeights::default(),
            5,
        );
        // Tue 13:00 raw 3.0; Wed 13:00 raw 2.9 + 0.2. Both clamp to 1.0.
        assert_eq!(best[0].start, t(4, 13, 0));
        assert_eq!(best[0].score, 1.0);
        assert_eq!(best[1].score, 1.0);
    }

    #[test]
    fn limit_truncates() {
        let now = t(2, 8, 0);
        let best = search_candidates(
            &[vec![]],
            30,
            None,
            now,
            &search(),
            &ScoringWeights::default(),
            3,
        );
        assert_eq!(best.len(), 3);
    }
}
