//! Multi-party call orchestration on top of the signaling link.
//!
//! # Architecture
//!
//! - [`state`]: call lifecycle state machine ([`state::CallState`] and
//!   [`state::CallTransition`])
//! - [`peer`]: per-participant negotiation ([`peer::PeerLink`]) with ordered
//!   ICE candidate buffering
//! - [`registry`]: single-call-at-a-time admission control
//! - [`session`]: one actor per call serializing every mutation
//! - [`manager`]: wires the event bus to sessions and enforces admission
//! - [`media`], [`api`]: collaborator seams for the media runtime, the call
//!   REST endpoints and the call-history sink

pub mod api;
pub mod error;
pub mod manager;
pub mod media;
pub mod peer;
pub mod registry;
pub mod session;
pub mod state;

#[cfg(test)]
mod protocol_tests;

pub use api::{CallApi, CallHistorySink, CallInitiateResponse, CallRecord};
pub use error::{BusyError, CallError, MediaError, NegotiationError};
pub use manager::CallManager;
pub use registry::CallRegistry;
pub use session::{CallSessionHandle, SessionDeps, SignalOutbox};

use serde::{Deserialize, Serialize};

/// Opaque identifier of a call, assigned by the server for incoming calls
/// and provisionally generated locally for outgoing ones until the server
/// ack supplies the canonical id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Random 32-hex-char id in the style of server-issued ones.
    pub fn generate() -> Self {
        use rand::Rng;
        let mut bytes = [0u8; 16];
        rand::rng().fill(&mut bytes);
        Self(bytes.iter().map(|b| format!("{b:02X}")).collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether this side placed or received the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// Why a call reached its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Local user hung up.
    Hangup,
    /// Remote side ended the call.
    RemoteHangup,
    /// Incoming call declined locally.
    Declined,
    /// Nobody answered within the ring window.
    Timeout,
    /// Negotiation failed for the only remaining participant.
    NegotiationFailed,
    /// Local media could not be acquired.
    MediaFailed,
    /// The server refused the call (e.g. caller already busy).
    ServerRejected,
}
