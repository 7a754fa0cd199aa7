use std::collections::BTreeMap;

use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::{Notification, NotificationKind};

use super::{Engine, EngineError, VoteRejection};

#[derive(Debug, Clone, PartialEq)]
pub enum VoteOutcome {
    /// Recorded; waiting for the rest.
    Pending { votes_cast: usize, eligible: usize },
    /// An objection blocked consensus.
    Objected,
    /// Quorum reached and a time adopted.
    Confirmed { index: usize, slot: CandidateSlot },
}

/// Most-selected option. Ties go to the lowest index, i.e. the better-scored
/// suggestion. `None` when no selections were cast.
pub fn plurality(votes: &BTreeMap<String, Vote>) -> Option<usize> {
    let mut counts: BTreeMap<usize, usize> = BTreeMap::new();
    for vote in votes.values() {
        if let Vote::Select { index } = vote {
            *counts.entry(*index).or_default() += 1;
        }
    }
    counts
        .into_iter()
        .fold(None, |best: Option<(usize, usize)>, (index, n)| match best {
            Some((_, best_n)) if best_n >= n => best,
            _ => Some((index, n)),
        })
        .map(|(index, _)| index)
}

fn check_vote(
    request: &RescheduleRequest,
    email: &str,
    vote: &Vote,
    now: Timestamp,
) -> Result<(), EngineError> {
    if request.status != RescheduleStatus::Pending {
        return Err(VoteRejection::NotPending.into());
    }
    if now >= request.auto_confirm_at {
        return Err(VoteRejection::DeadlinePassed.into());
    }
    if !request.eligible_voters.iter().any(|v| v == email) {
        return Err(VoteRejection::NotEligible.into());
    }
    if request.participant_votes.contains_key(email) {
        return Err(VoteRejection::AlreadyVoted.into());
    }
    match vote {
        Vote::Select { index } if *index >= request.suggested_times.len() => {
            Err(VoteRejection::InvalidChoice.into())
        }
        Vote::Object { message } if message.len() > MAX_MESSAGE_LEN => {
            Err(EngineError::LimitExceeded("objection message too long"))
        }
        _ => Ok(()),
    }
}

impl Engine {
    /// Propose up to three new times for a confirmed booking, computed from
    /// every member's fresh calendar. The current time counts as busy.
    pub async fn initiate_reschedule(
        &self,
        booking_id: Ulid,
        actor: &str,
        now: Timestamp,
    ) -> Result<RescheduleRequest, EngineError> {
        let actor = normalize_email(actor);
        let bs = self.shared(booking_id)?;

        let (members, duration, current) = {
            let guard = bs.read().await;
            check_can_reschedule(&guard, &actor)?;
            (
                guard.all_members(),
                guard.booking.duration_minutes,
                guard.booking.selected_time,
            )
        };

        let current: Vec<Span> = current.into_iter().collect();
        let suggestions = self
            .search(&members, duration, None, now, &current, MAX_RESCHEDULE_SUGGESTIONS)
            .await;
        if suggestions.is_empty() {
            return Err(EngineError::NoAvailability);
        }

        let mut guard = bs.write().await;
        check_can_reschedule(&guard, &actor)?;

        let request = RescheduleRequest {
            id: Ulid::new(),
            original_booking_id: booking_id,
            requested_by: actor,
            suggested_times: suggestions,
            eligible_voters: guard.all_members(),
            auto_confirm_at: now + self.policy.coordination.reschedule_window,
            status: RescheduleStatus::Pending,
            participant_votes: BTreeMap::new(),
            selected_index: None,
            created_at: now,
        };
        let event = Event::RescheduleInitiated {
            request: request.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        drop(guard);

        let notifications: Vec<Notification> = request
            .eligible_voters
            .iter()
            .map(|voter| {
                Notification::new(voter.clone(), NotificationKind::RescheduleProposed, booking_id)
                    .param("request_id", request.id)
                    .param("options", request.suggested_times.len())
                    .param("vote_by", request.auto_confirm_at.to_rfc3339())
            })
            .collect();
        self.publish(&notifications);
        info!("booking {booking_id}: reschedule {} proposed", request.id);
        Ok(request)
    }

    /// Record one ballot. Rejections change nothing.
    pub async fn cast_vote(
        &self,
        request_id: Ulid,
        email: &str,
        vote: Vote,
        now: Timestamp,
    ) -> Result<VoteOutcome, EngineError> {
        let email = normalize_email(email);
        let mut guard = self.resolve_request_write(request_id).await?;
        let booking_id = guard.booking.id;
        let request = guard
            .reschedule(request_id)
            .ok_or(EngineError::RequestNotFound(request_id))?;
        check_vote(request, &email, &vote, now)?;
        if guard.booking.status != BookingStatus::Confirmed {
            return Err(VoteRejection::NotPending.into());
        }

        let recorded = Event::VoteRecorded {
            booking_id,
            request_id,
            email: email.clone(),
            vote: vote.clone(),
        };
        self.persist_and_apply(&mut guard, &recorded).await?;

        let outcome = if let Vote::Object { message } = &vote {
            self.persist_and_apply(&mut guard, &Event::RescheduleObjected { booking_id, request_id })
                .await?;
            let notifications = [Notification::new(
                guard.booking.creator_email.clone(),
                NotificationKind::RescheduleObjection,
                booking_id,
            )
            .param("request_id", request_id)
            .param("from", &email)
            .param("message", message)];
            drop(guard);
            self.publish(&notifications);
            metrics::counter!(crate::observability::RESCHEDULES_RESOLVED_TOTAL, "outcome" => "objections")
                .increment(1);
            info!("booking {booking_id}: reschedule {request_id} objected by {email}");
            VoteOutcome::Objected
        } else {
            let request = guard
                .reschedule(request_id)
                .ok_or(EngineError::RequestNotFound(request_id))?;
            if request.has_quorum() {
                let index = plurality(&request.participant_votes).unwrap_or(0);
                let (slot, notifications) = self.confirm_reschedule(&mut guard, request_id, index).await?;
                drop(guard);
                self.publish(&notifications);
                metrics::counter!(crate::observability::RESCHEDULES_RESOLVED_TOTAL, "outcome" => "confirmed")
                    .increment(1);
                VoteOutcome::Confirmed { index, slot }
            } else {
                VoteOutcome::Pending {
                    votes_cast: request.participant_votes.len(),
                    eligible: request.eligible_voters.len(),
                }
            }
        };
        Ok(outcome)
    }

    /// Confirm every pending request whose voting window has closed, using
    /// the plurality so far (no votes: the best-scored option). Returns how
    /// many were confirmed.
    pub async fn run_reschedule_sweep(&self, now: Timestamp) -> usize {
        let mut confirmed = 0;
        for (booking_id, bs) in self.all_shared() {
            let mut guard = bs.write().await;
            if guard.booking.status != BookingStatus::Confirmed {
                continue;
            }
            let Some(request) = guard.pending_reschedule() else {
                continue;
            };
            if now < request.auto_confirm_at {
                continue;
            }
            let request_id = request.id;
            let index = plurality(&request.participant_votes).unwrap_or(0);

            match self.confirm_reschedule(&mut guard, request_id, index).await {
                Ok((_, notifications)) => {
                    drop(guard);
                    self.publish(&notifications);
                    confirmed += 1;
                    metrics::counter!(crate::observability::RESCHEDULES_RESOLVED_TOTAL, "outcome" => "auto_confirmed")
                        .increment(1);
                }
                Err(e) => warn!("booking {booking_id}: reschedule {request_id} not confirmed: {e}"),
            }
        }
        confirmed
    }

    async fn confirm_reschedule(
        &self,
        bs: &mut BookingState,
        request_id: Ulid,
        index: usize,
    ) -> Result<(CandidateSlot, Vec<Notification>), EngineError> {
        let booking_id = bs.booking.id;
        let request = bs
            .reschedule(request_id)
            .ok_or(EngineError::RequestNotFound(request_id))?;
        let slot = *request
            .suggested_times
            .get(index)
            .ok_or(EngineError::Vote(VoteRejection::InvalidChoice))?;
        let voters = request.eligible_voters.clone();

        let event = Event::RescheduleConfirmed {
            booking_id,
            request_id,
            index,
            span: slot.span(),
        };
        self.persist_and_apply(bs, &event).await?;
        info!("booking {booking_id}: reschedule {request_id} confirmed option {index} at {}", slot.start);

        let notifications = voters
            .into_iter()
            .map(|voter| {
                Notification::new(voter, NotificationKind::RescheduleConfirmed, booking_id)
                    .param("request_id", request_id)
                    .param("start", slot.start.to_rfc3339())
                    .param("end", slot.end.to_rfc3339())
            })
            .collect();
        Ok((slot, notifications))
    }
}

fn check_can_reschedule(bs: &BookingState, actor: &str) -> Result<(), EngineError> {
    if actor != bs.booking.creator_email {
        return Err(EngineError::NotOrganizer);
    }
    if bs.booking.status != BookingStatus::Confirmed || bs.booking.selected_time.is_none() {
        return Err(EngineError::InvalidState(bs.booking.status));
    }
    if let Some(pending) = bs.pending_reschedule() {
        return Err(EngineError::AlreadyExists(pending.id));
    }
    Ok(())
}
