use std::collections::BTreeMap;

use chrono::{DateTime, Duration, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Absolute instant. Civil-time projections happen at the edges.
pub type Timestamp = DateTime<Utc>;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Timestamp,
    pub end: Timestamp,
}

/// A time range during which one party is unavailable.
pub type BusyInterval = Span;

impl Span {
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Like `new`, but returns `None` for empty or inverted ranges.
    pub fn try_new(start: Timestamp, end: Timestamp) -> Option<Self> {
        (start < end).then_some(Self { start, end })
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Timestamp) -> bool {
        self.start <= t && t < self.end
    }

    /// Returns true if `self` fully contains `other`.
    pub fn contains_span(&self, other: &Span) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

/// A proposed meeting time. `score` is always within `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CandidateSlot {
    pub start: Timestamp,
    pub end: Timestamp,
    pub score: f64,
}

impl CandidateSlot {
    pub fn span(&self) -> Span {
        Span::new(self.start, self.end)
    }
}

/// Lunch window in organizer-local civil time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LunchBreak {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

/// Organizer-level scheduling preferences. Read-only to the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulingPreferences {
    /// Earliest local start of any meeting.
    pub earliest_time: NaiveTime,
    /// Latest local end of any meeting.
    pub latest_time: NaiveTime,
    pub preferred_days: Vec<Weekday>,
    pub avoid_days: Vec<Weekday>,
    /// Required clearance around existing meetings.
    pub buffer_minutes: u32,
    pub allow_back_to_back: bool,
    pub lunch_break: Option<LunchBreak>,
    pub minimum_notice_hours: u32,
    pub allow_same_day: bool,
}

impl Default for SchedulingPreferences {
    fn default() -> Self {
        Self {
            earliest_time: NaiveTime::MIN + Duration::hours(9),
            latest_time: NaiveTime::MIN + Duration::hours(17),
            preferred_days: Vec::new(),
            avoid_days: Vec::new(),
            buffer_minutes: 0,
            allow_back_to_back: true,
            lunch_break: None,
            minimum_notice_hours: 0,
            allow_same_day: true,
        }
    }
}

// ── Group bookings ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticipantStatus {
    Invited,
    Connected,
    MissedDeadline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingParticipant {
    pub email: String,
    pub connected: bool,
    pub connected_at: Option<Timestamp>,
    pub status: ParticipantStatus,
    pub reminders_sent: u32,
    pub last_reminder_at: Option<Timestamp>,
}

impl BookingParticipant {
    pub fn invited(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            connected: false,
            connected_at: None,
            status: ParticipantStatus::Invited,
            reminders_sent: 0,
            last_reminder_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    AllConnected,
    Confirmed,
    Cancelled,
}

impl BookingStatus {
    pub fn is_closed(self) -> bool {
        matches!(self, BookingStatus::Confirmed | BookingStatus::Cancelled)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupBooking {
    pub id: Ulid,
    pub creator_email: String,
    pub duration_minutes: u32,
    pub participant_deadline: Timestamp,
    pub auto_select_at_deadline: bool,
    pub all_participants_connected: bool,
    /// Set once, the first time every participant is seen connected.
    pub ready_for_selection: Option<Timestamp>,
    /// Set once, when the deadline sweep has handled this booking.
    pub deadline_processed_at: Option<Timestamp>,
    pub selected_time: Option<Span>,
    pub status: BookingStatus,
    pub created_at: Timestamp,
}

// ── Reschedule voting ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RescheduleStatus {
    Pending,
    Objections,
    Confirmed,
}

/// A participant's ballot on a reschedule request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Vote {
    Select { index: usize },
    Object { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RescheduleRequest {
    pub id: Ulid,
    pub original_booking_id: Ulid,
    pub requested_by: String,
    /// Ordered by descending score; votes refer to positions in this list.
    pub suggested_times: Vec<CandidateSlot>,
    /// Organizer plus every invitee, fixed at initiation.
    pub eligible_voters: Vec<String>,
    pub auto_confirm_at: Timestamp,
    pub status: RescheduleStatus,
    pub participant_votes: BTreeMap<String, Vote>,
    pub selected_index: Option<usize>,
    pub created_at: Timestamp,
}

impl RescheduleRequest {
    pub fn has_objection(&self) -> bool {
        self.participant_votes
            .values()
            .any(|v| matches!(v, Vote::Object { .. }))
    }

    /// True once every eligible voter has picked a time.
    pub fn has_quorum(&self) -> bool {
        self.eligible_voters.iter().all(|email| {
            matches!(self.participant_votes.get(email), Some(Vote::Select { .. }))
        })
    }
}

/// Everything the engine keeps for one booking. Mutated only under that
/// booking's write lock.
#[derive(Debug, Clone, PartialEq)]
pub struct BookingState {
    pub booking: GroupBooking,
    pub participants: Vec<BookingParticipant>,
    pub reschedules: Vec<RescheduleRequest>,
}

impl BookingState {
    pub fn participant(&self, email: &str) -> Option<&BookingParticipant> {
        self.participants.iter().find(|p| p.email == email)
    }

    pub fn participant_mut(&mut self, email: &str) -> Option<&mut BookingParticipant> {
        self.participants.iter_mut().find(|p| p.email == email)
    }

    pub fn connected_count(&self) -> usize {
        self.participants.iter().filter(|p| p.connected).count()
    }

    pub fn every_participant_connected(&self) -> bool {
        self.participants.iter().all(|p| p.connected)
    }

    /// Organizer first, then invitees in invitation order.
    pub fn all_members(&self) -> Vec<String> {
        std::iter::once(self.booking.creator_email.clone())
            .chain(self.participants.iter().map(|p| p.email.clone()))
            .collect()
    }

    /// Organizer plus invitees who have connected a calendar.
    pub fn connected_members(&self) -> Vec<String> {
        std::iter::once(self.booking.creator_email.clone())
            .chain(
                self.participants
                    .iter()
                    .filter(|p| p.connected)
                    .map(|p| p.email.clone()),
            )
            .collect()
    }

    pub fn unconnected_emails(&self) -> Vec<String> {
        self.participants
            .iter()
            .filter(|p| !p.connected)
            .map(|p| p.email.clone())
            .collect()
    }

    pub fn pending_reschedule(&self) -> Option<&RescheduleRequest> {
        self.reschedules
            .iter()
            .find(|r| r.status == RescheduleStatus::Pending)
    }

    pub fn reschedule(&self, id: Ulid) -> Option<&RescheduleRequest> {
        self.reschedules.iter().find(|r| r.id == id)
    }

    pub fn reschedule_mut(&mut self, id: Ulid) -> Option<&mut RescheduleRequest> {
        self.reschedules.iter_mut().find(|r| r.id == id)
    }
}

/// Canonical form used for every email comparison.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_ascii_lowercase()
}

/// The event types — flat, one per state transition. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    BookingCreated {
        booking: GroupBooking,
        participants: Vec<BookingParticipant>,
    },
    ParticipantConnected {
        booking_id: Ulid,
        email: String,
        at: Timestamp,
    },
    BookingReady {
        booking_id: Ulid,
        at: Timestamp,
    },
    ReminderSent {
        booking_id: Ulid,
        email: String,
        at: Timestamp,
    },
    DeadlineProcessed {
        booking_id: Ulid,
        missed: Vec<String>,
        at: Timestamp,
    },
    BookingConfirmed {
        booking_id: Ulid,
        span: Span,
    },
    BookingCancelled {
        booking_id: Ulid,
    },
    BookingRemoved {
        booking_id: Ulid,
    },
    RescheduleInitiated {
        request: RescheduleRequest,
    },
    VoteRecorded {
        booking_id: Ulid,
        request_id: Ulid,
        email: String,
        vote: Vote,
    },
    RescheduleObjected {
        booking_id: Ulid,
        request_id: Ulid,
    },
    RescheduleConfirmed {
        booking_id: Ulid,
        request_id: Ulid,
        index: usize,
        span: Span,
    },
}

impl Event {
    pub fn booking_id(&self) -> Ulid {
        match self {
            Event::BookingCreated { booking, .. } => booking.id,
            Event::RescheduleInitiated { request } => request.original_booking_id,
            Event::ParticipantConnected { booking_id, .. }
            | Event::BookingReady { booking_id, .. }
            | Event::ReminderSent { booking_id, .. }
            | Event::DeadlineProcessed { booking_id, .. }
            | Event::BookingConfirmed { booking_id, .. }
            | Event::BookingCancelled { booking_id }
            | Event::BookingRemoved { booking_id }
            | Event::VoteRecorded { booking_id, .. }
            | Event::RescheduleObjected { booking_id, .. }
            | Event::RescheduleConfirmed { booking_id, .. } => *booking_id,
        }
    }
}
