//! Typed notifications surfaced to the embedding application.
//!
//! Distinct from [`crate::bus::EventBus`], which routes raw wire messages:
//! these are broadcast channels for digested state changes (connection
//! lifecycle, call lifecycle) that the UI subscribes to.

use crate::calls::state::CallState;
use crate::calls::{CallId, EndReason};
use crate::wire::CallKind;
use std::sync::Arc;
use tokio::sync::broadcast;

// The size of the broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 100;

/// Emitted on every successful (re)connect.
#[derive(Debug, Clone)]
pub struct LinkConnected;

/// Emitted on abnormal disconnects that will be retried.
#[derive(Debug, Clone)]
pub struct LinkDisconnected {
    /// Reconnect attempt about to be made (1-based).
    pub attempt: u32,
    pub close_code: Option<u16>,
}

/// Why the link stopped retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GiveUpReason {
    /// The reconnect attempt budget is exhausted.
    RetriesExhausted,
    /// The server closed with the permanent-failure code; retrying is
    /// pointless.
    ServerRejected,
    /// No credential was available to authenticate the connection.
    NoCredential,
}

/// Terminal notification: the link will not reconnect on its own.
#[derive(Debug, Clone)]
pub struct LinkGaveUp {
    pub attempts: u32,
    pub reason: GiveUpReason,
}

/// A call is ringing locally; the application should offer accept/decline.
#[derive(Debug, Clone)]
pub struct IncomingCall {
    pub call_id: CallId,
    pub caller_id: String,
    pub caller_name: Option<String>,
    pub kind: CallKind,
}

/// A call session changed state.
#[derive(Debug, Clone)]
pub struct CallStateChanged {
    pub call_id: CallId,
    pub state: CallState,
}

/// A remote participant changed their mute/video state, joined, or left.
#[derive(Debug, Clone)]
pub struct ParticipantUpdate {
    pub call_id: CallId,
    pub user_id: String,
    pub muted: Option<bool>,
    pub video_enabled: Option<bool>,
    pub left: bool,
}

/// A call reached its terminal state.
#[derive(Debug, Clone)]
pub struct CallEnded {
    pub call_id: CallId,
    pub duration_secs: Option<i64>,
    pub reason: EndReason,
}

// Macro to generate Notifier fields and constructor
macro_rules! define_notifier {
    ($(($field:ident, $type:ty)),* $(,)?) => {
        /// Typed notification bus with a separate broadcast channel per
        /// event type. Constructed once per application session and
        /// dependency-injected, never a process global.
        #[derive(Debug)]
        pub struct Notifier {
            $(
                pub $field: broadcast::Sender<$type>,
            )*
        }

        impl Notifier {
            pub fn new() -> Self {
                Self {
                    $(
                        $field: broadcast::channel(CHANNEL_CAPACITY).0,
                    )*
                }
            }
        }
    };
}

define_notifier! {
    // Connection events
    (connected, Arc<LinkConnected>),
    (disconnected, Arc<LinkDisconnected>),
    (link_gave_up, Arc<LinkGaveUp>),

    // Call events
    (incoming_call, Arc<IncomingCall>),
    (call_state, Arc<CallStateChanged>),
    (participant_update, Arc<ParticipantUpdate>),
    (call_ended, Arc<CallEnded>),
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}
