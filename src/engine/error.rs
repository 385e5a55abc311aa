use std::collections::BTreeMap;

use thiserror::Error;
use ulid::Ulid;

use crate::model::TimeWindow;
use crate::store::StoreError;

use super::policy::Violation;

/// Coarse classification callers map onto their own responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    Conflict,
    LimitExceeded,
    NotFound,
    GenerationLimitExceeded,
    PartialFailure,
    Cancelled,
    Unavailable,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(Ulid),

    #[error("member {member_id} already has an active registration for event {event_id}")]
    AlreadyRegistered { event_id: Ulid, member_id: Ulid },

    #[error("registration closed for event {0}")]
    RegistrationClosed(Ulid),

    #[error("event {0} is full")]
    EventFull(Ulid),

    #[error("check-in closed for event {0}")]
    CheckInClosed(Ulid),

    #[error("already checked in: {0}")]
    AlreadyCheckedIn(Ulid),

    #[error("overlaps booking {existing} at {window:?}")]
    Overlap { existing: Ulid, window: TimeWindow },

    #[error("booking rejected: {}", .0.join("; "))]
    BookingRejected(Vec<String>),

    #[error("invalid transition for {id}: {from} -> {to}")]
    InvalidTransition { id: Ulid, from: String, to: String },

    /// Optimistic-concurrency loser: re-read and re-validate, never retry the stale write.
    #[error("stale write on {0}: state changed since it was read")]
    StaleWrite(Ulid),

    #[error("booking limits exceeded: {}", format_violations(.0))]
    LimitExceeded(Vec<Violation>),

    #[error("recurrence expansion passed {0} occurrences without reaching a bound")]
    GenerationLimitExceeded(u32),

    #[error("equipment batch rejected: {} conflicting item(s)", .0.len())]
    AssignmentConflicts(BTreeMap<Ulid, String>),

    #[error("{failed} of {total} items failed")]
    PartialFailure { total: usize, failed: usize, errors: Vec<String> },

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out")]
    Timeout,

    #[error("store error: {0}")]
    Store(String),
}

fn format_violations(v: &[Violation]) -> String {
    v.iter().map(|x| x.to_string()).collect::<Vec<_>>().join("; ")
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_transition(id: Ulid, from: impl std::fmt::Debug, to: impl std::fmt::Debug) -> Self {
        Self::InvalidTransition {
            id,
            from: format!("{from:?}"),
            to: format!("{to:?}"),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_) | EngineError::BookingRejected(_) => ErrorKind::Validation,
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::AlreadyRegistered { .. }
            | EngineError::RegistrationClosed(_)
            | EngineError::EventFull(_)
            | EngineError::CheckInClosed(_)
            | EngineError::AlreadyCheckedIn(_)
            | EngineError::Overlap { .. }
            | EngineError::InvalidTransition { .. }
            | EngineError::StaleWrite(_)
            | EngineError::AssignmentConflicts(_) => ErrorKind::Conflict,
            EngineError::LimitExceeded(_) => ErrorKind::LimitExceeded,
            EngineError::GenerationLimitExceeded(_) => ErrorKind::GenerationLimitExceeded,
            EngineError::PartialFailure { .. } => ErrorKind::PartialFailure,
            EngineError::Cancelled | EngineError::Timeout => ErrorKind::Cancelled,
            EngineError::Store(_) => ErrorKind::Unavailable,
        }
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(id) => EngineError::NotFound(id),
            StoreError::VersionConflict { id, .. } => EngineError::StaleWrite(id),
            other => EngineError::Store(other.to_string()),
        }
    }
}
