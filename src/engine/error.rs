use ulid::Ulid;

use crate::model::{RequestStatus, SessionStatus, Span};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    /// Negotiation deadline passed.
    Expired,
    AlreadyResolved(RequestStatus),
    InvalidTransition {
        from: SessionStatus,
        to: SessionStatus,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    Validation(String),
    State(StateError),
    /// `holder` is the lock or session already occupying `slot`.
    Conflict {
        slot: Span,
        holder: Ulid,
    },
    NotFound(Ulid),
    Forbidden(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for StateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StateError::Expired => write!(f, "booking request has expired"),
            StateError::AlreadyResolved(status) => {
                write!(f, "booking request already resolved: {status}")
            }
            StateError::InvalidTransition { from, to } => {
                write!(f, "invalid session transition: {from} -> {to}")
            }
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "validation failed: {msg}"),
            EngineError::State(e) => write!(f, "{e}"),
            EngineError::Conflict { slot, holder } => write!(
                f,
                "slot [{}, {}) conflicts with {holder}",
                slot.start, slot.end
            ),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::Forbidden(id) => write!(f, "user {id} is not a participant"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for StateError {}
impl std::error::Error for EngineError {}

impl From<StateError> for EngineError {
    fn from(e: StateError) -> Self {
        EngineError::State(e)
    }
}
