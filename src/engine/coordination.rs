use std::sync::Arc;
use std::time::Instant;

use chrono::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::{Notification, NotificationKind};

use super::{Engine, EngineError, validate_duration, validate_email};

/// Input for `Engine::create_group_booking`.
#[derive(Debug, Clone)]
pub struct NewGroupBooking {
    pub creator_email: String,
    pub participant_emails: Vec<String>,
    pub duration_minutes: u32,
    pub participant_deadline: Timestamp,
    pub auto_select_at_deadline: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionOutcome {
    pub connected_count: usize,
    pub total_count: usize,
    pub all_connected: bool,
    /// True only for the call that first observed everyone connected.
    pub became_ready: bool,
    pub notifications: Vec<Notification>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeadlineOutcome {
    pub booking_id: Ulid,
    /// The adopted time, when auto-select found one.
    pub auto_selected: Option<CandidateSlot>,
    /// Participants marked as having missed the deadline.
    pub missed: Vec<String>,
}

/// Result of one full sweep.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub deadlines: Vec<DeadlineOutcome>,
    pub reminders_sent: usize,
    pub reschedules_confirmed: usize,
}

/// What the read phase of deadline handling saw.
struct DeadlineView {
    members: Vec<String>,
    duration_minutes: u32,
    auto_select: bool,
}

fn deadline_due(bs: &BookingState, now: Timestamp) -> bool {
    let b = &bs.booking;
    !b.status.is_closed()
        && !b.all_participants_connected
        && b.deadline_processed_at.is_none()
        && b.participant_deadline <= now
}

fn require_organizer(bs: &BookingState, actor: &str) -> Result<(), EngineError> {
    if normalize_email(actor) == bs.booking.creator_email {
        Ok(())
    } else {
        Err(EngineError::NotOrganizer)
    }
}

impl Engine {
    pub async fn create_group_booking(
        &self,
        new: NewGroupBooking,
        now: Timestamp,
    ) -> Result<Ulid, EngineError> {
        let creator_email = validate_email(&new.creator_email)?;
        validate_duration(new.duration_minutes)?;
        if new.participant_emails.is_empty() {
            return Err(EngineError::InvalidInput("at least one participant is required"));
        }
        if new.participant_emails.len() > MAX_PARTICIPANTS {
            return Err(EngineError::LimitExceeded("too many participants"));
        }
        if new.participant_deadline <= now {
            return Err(EngineError::InvalidInput("participant deadline must be in the future"));
        }

        let mut participants: Vec<BookingParticipant> = Vec::with_capacity(new.participant_emails.len());
        for raw in &new.participant_emails {
            let email = validate_email(raw)?;
            if email == creator_email {
                return Err(EngineError::InvalidInput("organizer cannot be invited"));
            }
            if participants.iter().any(|p| p.email == email) {
                return Err(EngineError::InvalidInput("duplicate participant"));
            }
            participants.push(BookingParticipant::invited(email));
        }

        let _gate = self.lifecycle.read().await;
        if self.state.len() >= MAX_BOOKINGS {
            return Err(EngineError::LimitExceeded("too many bookings"));
        }

        let booking = GroupBooking {
            id: Ulid::new(),
            creator_email,
            duration_minutes: new.duration_minutes,
            participant_deadline: new.participant_deadline,
            auto_select_at_deadline: new.auto_select_at_deadline,
            all_participants_connected: false,
            ready_for_selection: None,
            deadline_processed_at: None,
            selected_time: None,
            status: BookingStatus::Pending,
            created_at: now,
        };
        let id = booking.id;
        let event = Event::BookingCreated {
            booking: booking.clone(),
            participants: participants.clone(),
        };
        self.wal_append(&event).await?;
        self.state.insert(
            id,
            Arc::new(RwLock::new(BookingState {
                booking,
                participants,
                reschedules: Vec::new(),
            })),
        );
        metrics::gauge!(crate::observability::BOOKINGS_ACTIVE).set(self.state.len() as f64);
        info!("booking {id} created");
        Ok(id)
    }

    /// Mark `email` connected. The ready notification fires once, on the call
    /// that first sees every participant connected.
    pub async fn record_participant_connected(
        &self,
        booking_id: Ulid,
        email: &str,
        now: Timestamp,
    ) -> Result<ConnectionOutcome, EngineError> {
        let email = normalize_email(email);
        let bs = self.shared(booking_id)?;
        let mut guard = bs.write().await;
        let already_connected = guard
            .participant(&email)
            .ok_or_else(|| EngineError::UnknownParticipant(email.clone()))?
            .connected;

        let mut notifications = Vec::new();
        let mut became_ready = false;
        if !guard.booking.status.is_closed() {
            if !already_connected {
                let event = Event::ParticipantConnected {
                    booking_id,
                    email: email.clone(),
                    at: now,
                };
                self.persist_and_apply(&mut guard, &event).await?;
            }

            if guard.every_participant_connected() && guard.booking.ready_for_selection.is_none() {
                let event = Event::BookingReady { booking_id, at: now };
                self.persist_and_apply(&mut guard, &event).await?;
                became_ready = true;
                notifications.push(
                    Notification::new(
                        guard.booking.creator_email.clone(),
                        NotificationKind::ReadyToSchedule,
                        booking_id,
                    )
                    .param("participants", guard.participants.len()),
                );
                info!("booking {booking_id} ready for selection");
            }
        }

        let outcome = ConnectionOutcome {
            connected_count: guard.connected_count(),
            total_count: guard.participants.len(),
            all_connected: guard.booking.all_participants_connected,
            became_ready,
            notifications,
        };
        drop(guard);
        self.publish(&outcome.notifications);
        Ok(outcome)
    }

    /// Ranked times for the organizer plus every connected participant.
    pub async fn group_candidate_slots(
        &self,
        booking_id: Ulid,
        actor: &str,
        now: Timestamp,
    ) -> Result<Vec<CandidateSlot>, EngineError> {
        let bs = self.shared(booking_id)?;
        let (members, duration) = {
            let guard = bs.read().await;
            require_organizer(&guard, actor)?;
            if guard.booking.status.is_closed() {
                return Err(EngineError::InvalidState(guard.booking.status));
            }
            (guard.connected_members(), guard.booking.duration_minutes)
        };
        Ok(self
            .search(&members, duration, None, now, &[], MAX_SEARCH_RESULTS)
            .await)
    }

    /// Organizer adopts a time, once everyone connected or the deadline passed.
    pub async fn confirm_group_booking(
        &self,
        booking_id: Ulid,
        actor: &str,
        start: Timestamp,
        now: Timestamp,
    ) -> Result<Span, EngineError> {
        let bs = self.shared(booking_id)?;
        let mut guard = bs.write().await;
        require_organizer(&guard, actor)?;
        let b = &guard.booking;
        let selectable = b.status == BookingStatus::AllConnected
            || (b.status == BookingStatus::Pending && b.deadline_processed_at.is_some());
        if !selectable {
            return Err(EngineError::InvalidState(b.status));
        }
        if start <= now {
            return Err(EngineError::InvalidInput("meeting must start in the future"));
        }
        let span = Span::new(start, start + Duration::minutes(i64::from(b.duration_minutes)));

        let event = Event::BookingConfirmed { booking_id, span };
        self.persist_and_apply(&mut guard, &event).await?;
        info!("booking {booking_id} confirmed for {}", span.start);
        Ok(span)
    }

    pub async fn cancel_booking(&self, booking_id: Ulid, actor: &str) -> Result<(), EngineError> {
        let bs = self.shared(booking_id)?;
        let mut guard = bs.write().await;
        require_organizer(&guard, actor)?;
        if guard.booking.status == BookingStatus::Cancelled {
            return Err(EngineError::InvalidState(BookingStatus::Cancelled));
        }
        let event = Event::BookingCancelled { booking_id };
        self.persist_and_apply(&mut guard, &event).await?;
        info!("booking {booking_id} cancelled");
        Ok(())
    }

    /// Delete a booking aggregate entirely.
    pub async fn remove_booking(&self, booking_id: Ulid, actor: &str) -> Result<(), EngineError> {
        let _gate = self.lifecycle.read().await;
        let bs = self.shared(booking_id)?;
        let guard = bs.write().await;
        require_organizer(&guard, actor)?;

        self.wal_append(&Event::BookingRemoved { booking_id }).await?;
        for r in &guard.reschedules {
            self.request_to_booking.remove(&r.id);
        }
        self.state.remove(&booking_id);
        self.notify.remove(&booking_id);
        metrics::gauge!(crate::observability::BOOKINGS_ACTIVE).set(self.state.len() as f64);
        Ok(())
    }

    // ── Sweeps ───────────────────────────────────────────

    /// Handle every booking whose participant deadline has passed without
    /// everyone connecting. Safe to re-run.
    pub async fn run_deadline_sweep(&self, now: Timestamp) -> Vec<DeadlineOutcome> {
        let mut due = Vec::new();
        for (id, bs) in self.all_shared() {
            if deadline_due(&*bs.read().await, now) {
                due.push(id);
            }
        }

        let mut outcomes = Vec::new();
        for id in due {
            match self.process_deadline(id, now).await {
                Ok(Some(outcome)) => outcomes.push(outcome),
                Ok(None) => {}
                Err(e) => warn!("deadline for booking {id} not processed: {e}"),
            }
        }
        outcomes
    }

    /// Read what the booking needs, fetch calendars without holding the lock,
    /// then re-check under the write lock. If a participant connected in
    /// between, start over so their calendar is included.
    async fn process_deadline(
        &self,
        booking_id: Ulid,
        now: Timestamp,
    ) -> Result<Option<DeadlineOutcome>, EngineError> {
        const ATTEMPTS: usize = 3;
        let bs = self.shared(booking_id)?;

        for _ in 0..ATTEMPTS {
            let view = {
                let guard = bs.read().await;
                if !deadline_due(&guard, now) {
                    return Ok(None);
                }
                DeadlineView {
                    members: guard.connected_members(),
                    duration_minutes: guard.booking.duration_minutes,
                    auto_select: guard.booking.auto_select_at_deadline,
                }
            };

            let pick = if view.auto_select {
                self.search(&view.members, view.duration_minutes, None, now, &[], 1)
                    .await
                    .into_iter()
                    .next()
            } else {
                None
            };

            let mut guard = bs.write().await;
            if !deadline_due(&guard, now) {
                return Ok(None);
            }
            if guard.connected_members() != view.members {
                debug!("booking {booking_id}: participants changed during deadline fetch");
                continue;
            }

            let missed = guard.unconnected_emails();
            let organizer = guard.booking.creator_email.clone();
            let mut notifications = Vec::new();

            let processed = Event::DeadlineProcessed {
                booking_id,
                missed: missed.clone(),
                at: now,
            };
            self.persist_and_apply(&mut guard, &processed).await?;

            if let Some(slot) = pick {
                let event = Event::BookingConfirmed {
                    booking_id,
                    span: slot.span(),
                };
                self.persist_and_apply(&mut guard, &event).await?;
                for member in &view.members {
                    notifications.push(
                        Notification::new(member.clone(), NotificationKind::AutoScheduled, booking_id)
                            .param("start", slot.start.to_rfc3339())
                            .param("end", slot.end.to_rfc3339()),
                    );
                }
                metrics::counter!(crate::observability::DEADLINES_PROCESSED_TOTAL, "outcome" => "auto_selected")
                    .increment(1);
                info!("booking {booking_id}: deadline passed, auto-selected {}", slot.start);
            } else {
                if view.auto_select {
                    warn!("booking {booking_id}: no common slot at deadline, asking organizer");
                }
                notifications.push(
                    Notification::new(organizer, NotificationKind::DeadlineReached, booking_id)
                        .param("connected", guard.connected_count())
                        .param("total", guard.participants.len()),
                );
                metrics::counter!(crate::observability::DEADLINES_PROCESSED_TOTAL, "outcome" => "notified")
                    .increment(1);
                info!("booking {booking_id}: deadline passed, organizer notified");
            }
            drop(guard);
            self.publish(&notifications);

            return Ok(Some(DeadlineOutcome {
                booking_id,
                auto_selected: pick,
                missed,
            }));
        }

        warn!("booking {booking_id}: participants kept changing, deadline left for next sweep");
        Ok(None)
    }

    /// Remind unconnected participants of bookings whose deadline is near.
    /// Never more than `max_reminders` per participant, spaced by
    /// `reminder_spacing`. Returns reminders sent.
    pub async fn run_reminder_sweep(&self, now: Timestamp) -> usize {
        let policy = &self.policy.coordination;
        let mut sent = 0;

        for (booking_id, bs) in self.all_shared() {
            let mut guard = bs.write().await;
            let b = &guard.booking;
            if b.status.is_closed()
                || b.all_participants_connected
                || b.deadline_processed_at.is_some()
                || now >= b.participant_deadline
                || b.participant_deadline - now > policy.reminder_window
            {
                continue;
            }

            let due: Vec<String> = guard
                .participants
                .iter()
                .filter(|p| !p.connected && p.reminders_sent < policy.max_reminders)
                .filter(|p| {
                    p.last_reminder_at
                        .is_none_or(|last| now - last >= policy.reminder_spacing)
                })
                .map(|p| p.email.clone())
                .collect();

            let mut notifications = Vec::new();
            for email in due {
                let event = Event::ReminderSent {
                    booking_id,
                    email: email.clone(),
                    at: now,
                };
                if let Err(e) = self.persist_and_apply(&mut guard, &event).await {
                    warn!("reminder for {email} on booking {booking_id} not recorded: {e}");
                    break;
                }
                notifications.push(
                    Notification::new(email, NotificationKind::ParticipantReminder, booking_id)
                        .param("deadline", guard.booking.participant_deadline.to_rfc3339())
                        .param("organizer", guard.booking.creator_email.clone()),
                );
            }
            drop(guard);

            sent += notifications.len();
            metrics::counter!(crate::observability::REMINDERS_SENT_TOTAL)
                .increment(notifications.len() as u64);
            self.publish(&notifications);
        }
        sent
    }

    /// The single periodic entry point: deadlines, reminders, then
    /// reschedule auto-confirmation.
    pub async fn run_sweep(&self, now: Timestamp) -> SweepReport {
        let started = Instant::now();
        let report = SweepReport {
            deadlines: self.run_deadline_sweep(now).await,
            reminders_sent: self.run_reminder_sweep(now).await,
            reschedules_confirmed: self.run_reschedule_sweep(now).await,
        };
        metrics::histogram!(crate::observability::SWEEP_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        if report != SweepReport::default() {
            info!(
                "sweep: {} deadlines, {} reminders, {} reschedules confirmed",
                report.deadlines.len(),
                report.reminders_sent,
                report.reschedules_confirmed
            );
        }
        report
    }
}
