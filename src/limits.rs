//! Hard limits on caller-supplied input. Anything past these is rejected
//! before it touches booking state.

/// Shortest bookable meeting.
pub const MIN_DURATION_MINUTES: u32 = 5;

/// Longest bookable meeting (one full working day).
pub const MAX_DURATION_MINUTES: u32 = 8 * 60;

/// Furthest ahead a slot search may look.
pub const MAX_HORIZON_DAYS: u32 = 60;

/// Invitees on a single group booking (organizer excluded).
pub const MAX_PARTICIPANTS: usize = 50;

/// Accounts queried in a single availability search.
pub const MAX_PARTIES: usize = MAX_PARTICIPANTS + 1;

/// Live booking aggregates held by one engine.
pub const MAX_BOOKINGS: usize = 100_000;

pub const MAX_EMAIL_LEN: usize = 254;

/// Objection message attached to a reschedule vote.
pub const MAX_MESSAGE_LEN: usize = 2_000;

/// Reminders any one participant can ever receive for one booking.
pub const MAX_REMINDERS: u32 = 2;

/// Suggestions attached to a reschedule request.
pub const MAX_RESCHEDULE_SUGGESTIONS: usize = 3;

/// Candidates returned from a direct availability search.
pub const MAX_SEARCH_RESULTS: usize = 5;

/// Days scanned forward when looking for the next business instant.
pub const MAX_CALENDAR_SCAN_DAYS: i64 = 800;
