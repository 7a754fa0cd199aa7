use thiserror::Error;
use ulid::Ulid;

use crate::model::BookingStatus;

/// Why a ballot was refused. Expected outcomes; nothing changes on refusal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VoteRejection {
    #[error("request is no longer pending")]
    NotPending,
    #[error("voting deadline has passed")]
    DeadlinePassed,
    #[error("voter is not a participant of this booking")]
    NotEligible,
    #[error("voter has already voted")]
    AlreadyVoted,
    #[error("choice index out of range")]
    InvalidChoice,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("booking not found: {0}")]
    BookingNotFound(Ulid),

    #[error("reschedule request not found: {0}")]
    RequestNotFound(Ulid),

    #[error("not a participant: {0}")]
    UnknownParticipant(String),

    #[error("only the organizer may do this")]
    NotOrganizer,

    #[error("invalid input: {0}")]
    InvalidInput(&'static str),

    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),

    #[error("not allowed while booking is {0:?}")]
    InvalidState(BookingStatus),

    #[error("already exists: {0}")]
    AlreadyExists(Ulid),

    #[error("no common availability")]
    NoAvailability,

    #[error("vote rejected: {0}")]
    Vote(#[from] VoteRejection),

    #[error("WAL error: {0}")]
    WalError(String),
}
