//! Call-related error types.

use thiserror::Error;

/// A second call was attempted while one is already active or pending.
/// Never retried automatically; surfaced directly to the caller.
#[derive(Debug, Error)]
#[error("another call is already active")]
pub struct BusyError;

/// Local media device failures. Terminal for the call attempt.
#[derive(Debug, Error)]
pub enum MediaError {
    #[error("media permission denied")]
    PermissionDenied,

    #[error("media device unavailable: {0}")]
    Unavailable(String),
}

/// Per-peer negotiation failures. Recoverable at the session level by
/// dropping that participant while others remain.
#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("malformed session description: {0}")]
    BadDescription(String),

    #[error("ICE failure: {0}")]
    Ice(String),

    #[error("invalid negotiation transition: {0}")]
    InvalidState(String),

    #[error("negotiation cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error("call not found: {0}")]
    NotFound(String),

    #[error("invalid call state transition: {0}")]
    InvalidTransition(#[from] super::state::InvalidTransition),

    #[error(transparent)]
    Busy(#[from] BusyError),

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error("negotiation failed: {0}")]
    Negotiation(#[from] NegotiationError),

    #[error("call API error: {0}")]
    Api(String),

    #[error("not connected")]
    NotConnected,
}
