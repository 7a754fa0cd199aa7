//! Provider event records → uniform busy intervals.
//!
//! Provider data is noisy: anything that cannot be parsed into a valid
//! `[start, end)` is dropped, never fatal to the batch.

use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::business_hours::localize;
use crate::model::{BusyInterval, Span, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Google,
    Microsoft,
    Ical,
}

/// Start or end of a raw event. Exactly one of `date_time` / `date` is
/// expected; `time_zone` qualifies a naive `date_time` (Microsoft Graph) or an
/// all-day `date`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEventTime {
    #[serde(default)]
    pub date_time: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub time_zone: Option<String>,
}

impl RawEventTime {
    pub fn instant(value: impl Into<String>) -> Self {
        Self {
            date_time: Some(value.into()),
            ..Self::default()
        }
    }

    pub fn all_day(value: impl Into<String>) -> Self {
        Self {
            date: Some(value.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    pub provider: Provider,
    pub start: RawEventTime,
    pub end: RawEventTime,
    /// `cancelled` (Google, iCal) drops the event.
    #[serde(default)]
    pub status: Option<String>,
    /// `transparent` (Google, iCal) marks the event as not blocking time.
    #[serde(default)]
    pub transparency: Option<String>,
    /// Microsoft `showAs`; `free` does not block time.
    #[serde(default)]
    pub show_as: Option<String>,
}

impl RawEvent {
    pub fn timed(provider: Provider, start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            provider,
            start: RawEventTime::instant(start),
            end: RawEventTime::instant(end),
            status: None,
            transparency: None,
            show_as: None,
        }
    }

    pub fn all_day(provider: Provider, start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            provider,
            start: RawEventTime::all_day(start),
            end: RawEventTime::all_day(end),
            status: None,
            transparency: None,
            show_as: None,
        }
    }

    pub fn blocks_time(&self) -> bool {
        let is = |field: &Option<String>, value: &str| {
            field
                .as_deref()
                .is_some_and(|v| v.trim().eq_ignore_ascii_case(value))
        };
        !(is(&self.status, "cancelled")
            || is(&self.transparency, "transparent")
            || is(&self.show_as, "free"))
    }
}

/// Normalize one party's raw events into busy intervals sorted by start.
/// Overlaps and duplicates are kept; downstream merging tolerates them.
pub fn normalize(events: &[RawEvent], default_tz: &Tz) -> Vec<BusyInterval> {
    let mut busy: Vec<BusyInterval> = Vec::with_capacity(events.len());
    let mut skipped = 0usize;
    for event in events.iter().filter(|e| e.blocks_time()) {
        let start = parse_event_time(&event.start, default_tz);
        let end = parse_event_time(&event.end, default_tz);
        match (start, end) {
            (Some(start), Some(end)) => match Span::try_new(start, end) {
                Some(span) => busy.push(span),
                None => skipped += 1,
            },
            _ => skipped += 1,
        }
    }
    if skipped > 0 {
        debug!("normalize: dropped {skipped} unparseable event(s)");
    }
    busy.sort_by_key(|s| s.start);
    busy
}

/// Parse a provider time. RFC 3339 wins; a naive date-time is read in its
/// `time_zone` (or `default_tz`); an all-day date is local midnight.
pub fn parse_event_time(raw: &RawEventTime, default_tz: &Tz) -> Option<Timestamp> {
    let tz = raw
        .time_zone
        .as_deref()
        .map(|name| resolve_zone(name, default_tz))
        .unwrap_or(*default_tz);

    if let Some(value) = raw.date_time.as_deref().map(str::trim) {
        if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
            return Some(dt.with_timezone(&Utc));
        }
        if let Ok(naive) = value.parse::<NaiveDateTime>() {
            return Some(localize(&tz, naive));
        }
        return None;
    }

    let date = raw
        .date
        .as_deref()
        .and_then(|d| NaiveDate::parse_from_str(d.trim(), "%Y-%m-%d").ok())?;
    Some(localize(&tz, date.and_time(NaiveTime::MIN)))
}

/// IANA names for the Windows zone ids Microsoft Graph commonly returns.
const WINDOWS_ZONES: &[(&str, Tz)] = &[
    ("UTC", Tz::UTC),
    ("Coordinated Universal Time", Tz::UTC),
    ("Eastern Standard Time", Tz::America__New_York),
    ("Central Standard Time", Tz::America__Chicago),
    ("Mountain Standard Time", Tz::America__Denver),
    ("US Mountain Standard Time", Tz::America__Phoenix),
    ("Pacific Standard Time", Tz::America__Los_Angeles),
    ("Alaskan Standard Time", Tz::America__Anchorage),
    ("Hawaiian Standard Time", Tz::Pacific__Honolulu),
    ("Atlantic Standard Time", Tz::America__Halifax),
    ("GMT Standard Time", Tz::Europe__London),
    ("W. Europe Standard Time", Tz::Europe__Berlin),
    ("Romance Standard Time", Tz::Europe__Paris),
    ("Central Europe Standard Time", Tz::Europe__Budapest),
    ("Central European Standard Time", Tz::Europe__Warsaw),
    ("E. Europe Standard Time", Tz::Europe__Chisinau),
    ("FLE Standard Time", Tz::Europe__Helsinki),
    ("Russian Standard Time", Tz::Europe__Moscow),
    ("India Standard Time", Tz::Asia__Kolkata),
    ("China Standard Time", Tz::Asia__Shanghai),
    ("Tokyo Standard Time", Tz::Asia__Tokyo),
    ("Singapore Standard Time", Tz::Asia__Singapore),
    ("AUS Eastern Standard Time", Tz::Australia__Sydney),
    ("New Zealand Standard Time", Tz::Pacific__Auckland),
];

/// Resolve a provider zone name: IANA first, then the Windows id table.
/// Unknown names fall back to `default_tz`.
fn resolve_zone(name: &str, default_tz: &Tz) -> Tz {
    let name = name.trim();
    if let Ok(tz) = name.parse::<Tz>() {
        return tz;
    }
    if let Some((_, tz)) = WINDOWS_ZONES.iter().find(|(windows, _)| windows.eq_ignore_ascii_case(name)) {
        return *tz;
    }
    debug!("normalize: unknown time zone {name:?}, using {default_tz}");
    *default_tz
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(d: u32, h: u32, m: u32) -> Timestamp {
        Utc.with_ymd_and_hms(2026, 3, d, h, m, 0).unwrap()
    }

    #[test]
    fn google_timed_and_all_day() {
        let events = vec![
            RawEvent::timed(Provider::Google, "2026-03-03T14:00:00Z", "2026-03-03T15:00:00Z"),
            RawEvent::all_day(Provider::Google, "2026-03-02", "2026-03-03"),
        ];
        let busy = normalize(&events, &Tz::UTC);
        assert_eq!(
            busy,
            vec![
                Span::new(utc(2, 0, 0), utc(3, 0, 0)),
                Span::new(utc(3, 14, 0), utc(3, 15, 0)),
            ]
        );
    }

    #[test]
    fn offsets_are_honoured() {
        let events = vec![RawEvent::timed(
            Provider::Ical,
            "2026-03-03T09:00:00-05:00",
            "2026-03-03T09:30:00-05:00",
        )];
        let busy = normalize(&events, &Tz::UTC);
        assert_eq!(busy, vec![Span::new(utc(3, 14, 0), utc(3, 14, 30))]);
    }

    #[test]
    fn microsoft_naive_time_uses_its_zone() {
        let event = RawEvent {
            provider: Provider::Microsoft,
            start: RawEventTime {
                date_time: Some("2026-03-03T09:00:00.0000000".into()),
                date: None,
                time_zone: Some("America/New_York".into()),
            },
            end: RawEventTime {
                date_time: Some("2026-03-03T10:00:00.0000000".into()),
                date: None,
                time_zone: Some("America/New_York".into()),
            },
            status: None,
            transparency: None,
            show_as: Some("busy".into()),
        };
        let busy = normalize(&[event], &Tz::UTC);
        assert_eq!(busy, vec![Span::new(utc(3, 14, 0), utc(3, 15, 0))]);
    }

    #[test]
    fn windows_zone_names_are_mapped() {
        let at = |value: &str, zone: &str| RawEventTime {
            date_time: Some(value.into()),
            date: None,
            time_zone: Some(zone.into()),
        };
        let event = RawEvent {
            provider: Provider::Microsoft,
            start: at("2026-03-03T09:00:00.0000000", "Eastern Standard Time"),
            end: at("2026-03-03T10:00:00.0000000", "Eastern Standard Time"),
            status: None,
            transparency: None,
            show_as: Some("busy".into()),
        };
        let busy = normalize(&[event], &Tz::UTC);
        assert_eq!(busy, vec![Span::new(utc(3, 14, 0), utc(3, 15, 0))]);

        let berlin = parse_event_time(&at("2026-03-03T09:00:00", "W. Europe Standard Time"), &Tz::UTC);
        assert_eq!(berlin, Some(utc(3, 8, 0)));

        // Unknown names fall back to the caller's zone.
        let unknown = parse_event_time(
            &at("2026-03-03T09:00:00", "Mars Standard Time"),
            &chrono_tz::America::Chicago,
        );
        assert_eq!(unknown, Some(utc(3, 15, 0)));
    }

    #[test]
    fn all_day_uses_default_zone() {
        let events = vec![RawEvent::all_day(Provider::Google, "2026-03-03", "2026-03-04")];
        let busy = normalize(&events, &chrono_tz::America::New_York);
        assert_eq!(busy, vec![Span::new(utc(3, 5, 0), utc(4, 5, 0))]);
    }

    #[test]
    fn garbage_and_inverted_are_dropped() {
        let events = vec![
            RawEvent::timed(Provider::Google, "not a time", "2026-03-03T15:00:00Z"),
            RawEvent::timed(Provider::Google, "2026-03-03T15:00:00Z", "2026-03-03T14:00:00Z"),
            RawEvent::timed(Provider::Google, "2026-03-03T15:00:00Z", "2026-03-03T15:00:00Z"),
            RawEvent {
                provider: Provider::Ical,
                start: RawEventTime::default(),
                end: RawEventTime::default(),
                status: None,
                transparency: None,
                show_as: None,
            },
            RawEvent::timed(Provider::Google, "2026-03-03T16:00:00Z", "2026-03-03T17:00:00Z"),
        ];
        let busy = normalize(&events, &Tz::UTC);
        assert_eq!(busy, vec![Span::new(utc(3, 16, 0), utc(3, 17, 0))]);
    }

    #[test]
    fn free_and_cancelled_do_not_block() {
        let mut cancelled = RawEvent::timed(Provider::Google, "2026-03-03T09:00:00Z", "2026-03-03T10:00:00Z");
        cancelled.status = Some("cancelled".into());
        let mut transparent = RawEvent::timed(Provider::Ical, "2026-03-03T11:00:00Z", "2026-03-03T12:00:00Z");
        transparent.transparency = Some("TRANSPARENT".into());
        let mut free = RawEvent::timed(Provider::Microsoft, "2026-03-03T13:00:00Z", "2026-03-03T14:00:00Z");
        free.show_as = Some("free".into());
        assert!(normalize(&[cancelled, transparent, free], &Tz::UTC).is_empty());
    }

    #[test]
    fn output_sorted_and_keeps_duplicates() {
        let events = vec![
            RawEvent::timed(Provider::Google, "2026-03-03T12:00:00Z", "2026-03-03T13:00:00Z"),
            RawEvent::timed(Provider::Google, "2026-03-03T09:00:00Z", "2026-03-03T10:00:00Z"),
            RawEvent::timed(Provider::Google, "2026-03-03T09:00:00Z", "2026-03-03T10:00:00Z"),
        ];
        let busy = normalize(&events, &Tz::UTC);
        assert_eq!(busy.len(), 3);
        assert!(busy.windows(2).all(|w| w[0].start <= w[1].start));
    }

    #[test]
    fn deserializes_provider_payload() {
        let json = r#"[
            {"provider":"google","start":{"dateTime":"2026-03-03T09:00:00Z"},"end":{"dateTime":"2026-03-03T10:00:00Z"}},
            {"provider":"microsoft","start":{"dateTime":"2026-03-03T11:00:00","timeZone":"UTC"},"end":{"dateTime":"2026-03-03T12:00:00","timeZone":"UTC"},"showAs":"busy"}
        ]"#;
        let events: Vec<RawEvent> = serde_json::from_str(json).unwrap();
        let busy = normalize(&events, &Tz::UTC);
        assert_eq!(
            busy,
            vec![
                Span::new(utc(3, 9, 0), utc(3, 10, 0)),
                Span::new(utc(3, 11, 0), utc(3, 12, 0)),
            ]
        );
    }
}
