mod availability;
mod coordination;
mod error;
mod reschedule;
mod scoring;

pub use availability::{SlotSearch, find_slots, merge_overlapping, merged_timeline, subtract_intervals};
pub use coordination::{ConnectionOutcome, DeadlineOutcome, NewGroupBooking, SweepReport};
pub use error::{EngineError, VoteRejection};
pub use reschedule::{VoteOutcome, plurality};
pub use scoring::{Scorer, ScoringWeights, TimeBand, rank, search_candidates};

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Duration;
use dashmap::DashMap;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock, mpsc, oneshot};
use tracing::{info, warn};
use ulid::Ulid;

use crate::calendar::{CalendarSource, fetch_busy};
use crate::config::ConfigError;
use crate::limits::*;
use crate::model::*;
use crate::notify::{Notification, NotifyHub};
use crate::wal::Wal;

pub type SharedBookingState = Arc<RwLock<BookingState>>;

// ── Policy ───────────────────────────────────────────────

/// Timing rules of the coordination state machine.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinationPolicy {
    /// Reminders go out once the deadline is this close.
    pub reminder_window: Duration,
    pub max_reminders: u32,
    /// Minimum gap between two reminders to the same participant.
    pub reminder_spacing: Duration,
    /// How long a reschedule stays open for votes.
    pub reschedule_window: Duration,
}

impl Default for CoordinationPolicy {
    fn default() -> Self {
        Self {
            reminder_window: Duration::hours(24),
            max_reminders: MAX_REMINDERS,
            reminder_spacing: Duration::hours(12),
            reschedule_window: Duration::hours(24),
        }
    }
}

/// Every tunable the engine reads. Immutable once the engine is built.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchedulingPolicy {
    pub search: SlotSearch,
    pub weights: ScoringWeights,
    pub coordination: CoordinationPolicy,
}

impl SchedulingPolicy {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.search.hours.validate()?;
        if self.search.horizon_days == 0 || self.search.horizon_days > MAX_HORIZON_DAYS {
            return Err(ConfigError::Invalid("search horizon must be 1..=60 days"));
        }
        if self.search.stride_minutes == 0 {
            return Err(ConfigError::Invalid("slot stride must be positive"));
        }
        if self.coordination.max_reminders > MAX_REMINDERS {
            return Err(ConfigError::Invalid("reminder cap is at most 2"));
        }
        if self.coordination.reschedule_window <= Duration::zero() {
            return Err(ConfigError::Invalid("reschedule window must be positive"));
        }
        Ok(())
    }
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut deferred = None;
                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                        Ok(other) => {
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }
                commit_batch(&mut wal, &mut batch);
                if let Some(cmd) = deferred {
                    handle_non_append(&mut wal, cmd);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so buffered bytes don't leak into the next batch.
    let flush_result = wal.flush_sync();
    match append_err {
        Some(e) => Err(e),
        None => flush_result,
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result =
                Wal::write_compact_file(wal.path(), &events).and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            commit_batch(wal, &mut vec![(event, response)]);
        }
    }
}

// ── Engine ───────────────────────────────────────────────

pub struct Engine {
    pub state: DashMap<Ulid, SharedBookingState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    /// Reverse lookup: reschedule request id → booking id.
    pub(super) request_to_booking: DashMap<Ulid, Ulid>,
    pub(super) calendars: Arc<dyn CalendarSource>,
    pub policy: SchedulingPolicy,
    /// Shared by booking create/remove, exclusive for compaction, so a
    /// snapshot never misses an aggregate whose event is already logged.
    pub(super) lifecycle: RwLock<()>,
}

/// Apply an event to a booking aggregate (caller holds the lock).
/// `BookingCreated`/`BookingRemoved` are handled at the map level.
fn apply_to_booking(bs: &mut BookingState, event: &Event, requests: &DashMap<Ulid, Ulid>) {
    match event {
        Event::ParticipantConnected { email, at, .. } => {
            if let Some(p) = bs.participant_mut(email) {
                p.connected = true;
                p.connected_at.get_or_insert(*at);
                p.status = ParticipantStatus::Connected;
            }
        }
        Event::BookingReady { at, .. } => {
            bs.booking.all_participants_connected = true;
            bs.booking.ready_for_selection.get_or_insert(*at);
            if bs.booking.status == BookingStatus::Pending {
                bs.booking.status = BookingStatus::AllConnected;
            }
        }
        Event::ReminderSent { email, at, .. } => {
            if let Some(p) = bs.participant_mut(email) {
                p.reminders_sent = (p.reminders_sent + 1).min(MAX_REMINDERS);
                p.last_reminder_at = Some(*at);
            }
        }
        Event::DeadlineProcessed { missed, at, .. } => {
            bs.booking.deadline_processed_at.get_or_insert(*at);
            for email in missed {
                if let Some(p) = bs.participant_mut(email)
                    && !p.connected
                {
                    p.status = ParticipantStatus::MissedDeadline;
                }
            }
        }
        Event::BookingConfirmed { span, .. } => {
            bs.booking.selected_time = Some(*span);
            bs.booking.status = BookingStatus::Confirmed;
        }
        Event::BookingCancelled { .. } => {
            bs.booking.status = BookingStatus::Cancelled;
        }
        Event::RescheduleInitiated { request } => {
            requests.insert(request.id, request.original_booking_id);
            bs.reschedules.push(request.clone());
        }
        Event::VoteRecorded { request_id, email, vote, .. } => {
            if let Some(r) = bs.reschedule_mut(*request_id) {
                r.participant_votes.insert(email.clone(), vote.clone());
            }
        }
        Event::RescheduleObjected { request_id, .. } => {
            if let Some(r) = bs.reschedule_mut(*request_id) {
                r.status = RescheduleStatus::Objections;
            }
        }
        Event::RescheduleConfirmed { request_id, index, span, .. } => {
            if let Some(r) = bs.reschedule_mut(*request_id) {
                r.status = RescheduleStatus::Confirmed;
                r.selected_index = Some(*index);
            }
            bs.booking.selected_time = Some(*span);
            bs.booking.status = BookingStatus::Confirmed;
        }
        Event::BookingCreated { .. } | Event::BookingRemoved { .. } => {}
    }
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        calendars: Arc<dyn CalendarSource>,
        policy: SchedulingPolicy,
    ) -> io::Result<Self> {
        let replay = Wal::replay(&wal_path)?;
        let mut wal = Wal::open(&wal_path)?;
        if replay.truncated {
            // Appending after a torn tail would hide every later record.
            Wal::write_compact_file(&wal_path, &replay.events)?;
            wal.swap_compact_file()?;
        }

        let requests = DashMap::new();
        let mut bookings: HashMap<Ulid, BookingState> = HashMap::new();
        for event in &replay.events {
            match event {
                Event::BookingCreated { booking, participants } => {
                    bookings.insert(
                        booking.id,
                        BookingState {
                            booking: booking.clone(),
                            participants: participants.clone(),
                            reschedules: Vec::new(),
                        },
                    );
                }
                Event::BookingRemoved { booking_id } => {
                    if let Some(bs) = bookings.remove(booking_id) {
                        for r in &bs.reschedules {
                            requests.remove(&r.id);
                        }
                    }
                }
                other => {
                    if let Some(bs) = bookings.get_mut(&other.booking_id()) {
                        apply_to_booking(bs, other, &requests);
                    }
                }
            }
        }

        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let state: DashMap<Ulid, SharedBookingState> = bookings
            .into_iter()
            .map(|(id, bs)| (id, Arc::new(RwLock::new(bs))))
            .collect();
        metrics::gauge!(crate::observability::BOOKINGS_ACTIVE).set(state.len() as f64);
        info!(
            "replayed {} events into {} bookings",
            replay.events.len(),
            state.len()
        );

        Ok(Self {
            state,
            wal_tx,
            notify,
            request_to_booking: requests,
            calendars,
            policy,
            lifecycle: RwLock::new(()),
        })
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append then apply. State only changes once the event is durable.
    pub(super) async fn persist_and_apply(
        &self,
        bs: &mut BookingState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        apply_to_booking(bs, event, &self.request_to_booking);
        Ok(())
    }

    pub(super) fn publish(&self, notifications: &[Notification]) {
        for n in notifications {
            self.notify.send(n);
        }
    }

    pub fn get_shared(&self, id: &Ulid) -> Option<SharedBookingState> {
        self.state.get(id).map(|e| e.value().clone())
    }

    pub(super) fn shared(&self, id: Ulid) -> Result<SharedBookingState, EngineError> {
        self.get_shared(&id).ok_or(EngineError::BookingNotFound(id))
    }

    /// Lookup request → booking, acquire the booking's write lock.
    pub(super) async fn resolve_request_write(
        &self,
        request_id: Ulid,
    ) -> Result<OwnedRwLockWriteGuard<BookingState>, EngineError> {
        let booking_id = self
            .request_to_booking
            .get(&request_id)
            .map(|e| *e.value())
            .ok_or(EngineError::RequestNotFound(request_id))?;
        let bs = self
            .get_shared(&booking_id)
            .ok_or(EngineError::RequestNotFound(request_id))?;
        Ok(bs.write_owned().await)
    }

    /// Snapshot of one booking aggregate.
    pub async fn get_booking(&self, id: Ulid) -> Option<BookingState> {
        let bs = self.get_shared(&id)?;
        let guard = bs.read().await;
        Some(guard.clone())
    }

    pub async fn get_reschedule(&self, request_id: Ulid) -> Option<RescheduleRequest> {
        let booking_id = self.request_to_booking.get(&request_id).map(|e| *e.value())?;
        let bs = self.get_shared(&booking_id)?;
        let guard = bs.read().await;
        guard.reschedule(request_id).cloned()
    }

    pub fn booking_ids(&self) -> Vec<Ulid> {
        self.state.iter().map(|e| *e.key()).collect()
    }

    /// Arcs of every booking, cloned out so no map shard is held across an await.
    pub(super) fn all_shared(&self) -> Vec<(Ulid, SharedBookingState)> {
        self.state
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }

    // ── Slot search ──────────────────────────────────────

    /// Best slots common to every account, fetched fresh. Accounts whose
    /// calendar cannot be fetched count as free.
    pub async fn candidate_slots(
        &self,
        accounts: &[String],
        duration_minutes: u32,
        preferences: Option<&SchedulingPreferences>,
        now: Timestamp,
    ) -> Result<Vec<CandidateSlot>, EngineError> {
        if accounts.is_empty() {
            return Err(EngineError::InvalidInput("at least one calendar is required"));
        }
        if accounts.len() > MAX_PARTIES {
            return Err(EngineError::LimitExceeded("too many calendars"));
        }
        validate_duration(duration_minutes)?;
        let result = Ok(self
            .search(accounts, duration_minutes, preferences, now, &[], MAX_SEARCH_RESULTS)
            .await);
        crate::observability::record_operation("candidate_slots", &result);
        result
    }

    /// Fetch, then rank. `extra_busy` is added as one more party.
    pub(super) async fn search(
        &self,
        accounts: &[String],
        duration_minutes: u32,
        preferences: Option<&SchedulingPreferences>,
        now: Timestamp,
        extra_busy: &[Span],
        limit: usize,
    ) -> Vec<CandidateSlot> {
        let search = &self.policy.search;
        let window = Span::new(
            now,
            now + Duration::days(i64::from(search.horizon_days.max(1))),
        );
        let mut busy = fetch_busy(self.calendars.as_ref(), accounts, window, &search.hours.timezone).await;
        if !extra_busy.is_empty() {
            busy.push(extra_busy.to_vec());
        }

        let started = Instant::now();
        let ranked = search_candidates(
            &busy,
            duration_minutes,
            preferences,
            now,
            search,
            &self.policy.weights,
            limit,
        );
        metrics::histogram!(crate::observability::SLOT_SEARCH_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        metrics::histogram!(crate::observability::SLOT_SEARCH_RESULTS).record(ranked.len() as f64);
        ranked
    }

    // ── Compaction ───────────────────────────────────────

    /// Rewrite the WAL with one snapshot per live booking.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.lifecycle.write().await;

        let mut guards = Vec::new();
        for (_, bs) in self.all_shared() {
            guards.push(bs.read_owned().await);
        }

        let mut events = Vec::with_capacity(guards.len());
        for guard in &guards {
            events.push(Event::BookingCreated {
                booking: guard.booking.clone(),
                participants: guard.participants.clone(),
            });
            for request in &guard.reschedules {
                events.push(Event::RescheduleInitiated {
                    request: request.clone(),
                });
            }
        }

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        let result = rx
            .await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()));
        drop(guards);
        if let Err(e) = &result {
            warn!("WAL compaction failed: {e}");
        }
        result
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

pub(super) fn validate_duration(minutes: u32) -> Result<(), EngineError> {
    if minutes < MIN_DURATION_MINUTES {
        return Err(EngineError::InvalidInput("duration too short"));
    }
    if minutes > MAX_DURATION_MINUTES {
        return Err(EngineError::LimitExceeded("duration too long"));
    }
    Ok(())
}

pub(super) fn validate_email(raw: &str) -> Result<String, EngineError> {
    let email = normalize_email(raw);
    if email.len() > MAX_EMAIL_LEN {
        return Err(EngineError::LimitExceeded("email too long"));
    }
    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(email),
        _ => Err(EngineError::InvalidInput("malformed email")),
    }
}
