//! Call state machine implementation.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::EndReason;

/// Current state of a call. Ended is terminal; no transition leaves it.
#[derive(Debug, Clone, Serialize, Default)]
pub enum CallState {
    /// Outgoing call: local media and server ack pending.
    #[default]
    Initiating,
    /// Waiting for the remote side (outgoing: callee; incoming: local user).
    Ringing { since: DateTime<Utc> },
    /// Accepted; per-participant negotiation in progress.
    Connecting { since: DateTime<Utc> },
    /// Every participant's peer link is connected; media flowing.
    Active { connected_at: DateTime<Utc> },
    /// Call over. Duration is measured from Active, if it was reached.
    Ended {
        reason: EndReason,
        ended_at: DateTime<Utc>,
        duration_secs: Option<i64>,
    },
}

impl CallState {
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active { .. })
    }

    pub fn is_ringing(&self) -> bool {
        matches!(self, Self::Ringing { .. })
    }

    pub fn is_connecting(&self) -> bool {
        matches!(self, Self::Connecting { .. })
    }

    pub fn is_ended(&self) -> bool {
        matches!(self, Self::Ended { .. })
    }
}

/// State transitions for calls.
#[derive(Debug, Clone)]
pub enum CallTransition {
    /// Server acknowledged the outgoing call and assigned the call id.
    ServerAcked,
    /// Server refused the outgoing call.
    ServerRejected { reason: EndReason },
    /// Local user accepted an incoming call.
    LocalAccepted,
    /// Local user declined an incoming call.
    LocalDeclined,
    /// First remote participant joined an outgoing call.
    RemoteJoined,
    /// Every peer link reached its connected sub-state.
    MediaConnected,
    /// Hangup, remote end-of-call, fatal failure, or ring timeout.
    Terminated { reason: EndReason },
}

impl CallState {
    /// Apply a state transition. Returns error if transition is invalid.
    pub fn apply(&mut self, transition: CallTransition) -> Result<(), InvalidTransition> {
        let new_state = match (&*self, transition) {
            (CallState::Initiating, CallTransition::ServerAcked) => {
                CallState::Ringing { since: Utc::now() }
            }
            (CallState::Initiating, CallTransition::ServerRejected { reason }) => CallState::Ended {
                reason,
                ended_at: Utc::now(),
                duration_secs: None,
            },
            (CallState::Ringing { .. }, CallTransition::LocalAccepted) => {
                CallState::Connecting { since: Utc::now() }
            }
            (CallState::Ringing { .. }, CallTransition::LocalDeclined) => CallState::Ended {
                reason: EndReason::Declined,
                ended_at: Utc::now(),
                duration_secs: None,
            },
            (CallState::Ringing { .. }, CallTransition::RemoteJoined) => {
                CallState::Connecting { since: Utc::now() }
            }
            (CallState::Connecting { .. }, CallTransition::MediaConnected) => CallState::Active {
                connected_at: Utc::now(),
            },
            (
                CallState::Initiating
                | CallState::Ringing { .. }
                | CallState::Connecting { .. },
                CallTransition::Terminated { reason },
            ) => CallState::Ended {
                reason,
                ended_at: Utc::now(),
                duration_secs: None,
            },
            (CallState::Active { connected_at }, CallTransition::Terminated { reason }) => {
                let duration = Utc::now().signed_duration_since(*connected_at).num_seconds();
                CallState::Ended {
                    reason,
                    ended_at: Utc::now(),
                    duration_secs: Some(duration),
                }
            }
            (current, transition) => {
                return Err(InvalidTransition {
                    current_state: format!("{:?}", current),
                    attempted: format!("{:?}", transition),
                });
            }
        };
        *self = new_state;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}
