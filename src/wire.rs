//! JSON wire protocol for the signaling link.
//!
//! Every message is a JSON object tagged by a `type` field. Call signaling
//! messages additionally carry the sender's `user_id` and, when relayed
//! point-to-point rather than broadcast, a `target` participant id.
//!
//! Outbound `mute`/`video_toggle` are rewritten by the server into
//! `participant_muted`/`participant_video` broadcasts, so the enum models
//! both directions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Audio-only or audio+video call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    #[default]
    Audio,
    Video,
}

impl CallKind {
    pub fn is_video(self) -> bool {
        matches!(self, Self::Video)
    }
}

impl std::fmt::Display for CallKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
        }
    }
}

/// Sender details embedded in chat broadcasts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatSender {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// A chat message as broadcast by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: String,
    pub content: String,
    pub message_type: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<ChatSender>,
}

/// All messages exchanged over the signaling link.
///
/// The `join`, `leave` and `call_ended` tags assume a relay that forwards
/// every room message, not only the offer/answer/candidate/mute set; a
/// server restricted to the negotiation tags drops them silently, and the
/// join-driven offer trigger then needs another membership source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireMessage {
    // -- Call signaling --
    Offer {
        sdp: String,
        user_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },
    Answer {
        sdp: String,
        user_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },
    #[serde(rename = "ice-candidate")]
    IceCandidate {
        candidate: String,
        user_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },
    /// Announces the sender joined the call's signaling room.
    Join { user_id: String },
    /// The sender left the call but the call may continue for others.
    Leave { user_id: String },
    Mute { muted: bool, user_id: String },
    VideoToggle { video_enabled: bool, user_id: String },
    ParticipantMuted { user_id: String, muted: bool },
    ParticipantVideo { user_id: String, video_enabled: bool },
    IncomingCall {
        call_id: String,
        caller_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caller_name: Option<String>,
        call_type: CallKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signaling_url: Option<String>,
    },
    CallEnded {
        call_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },

    // -- Chat channel --
    ConnectionEstablished {
        user_id: String,
        device_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    SendMessage {
        conversation_id: String,
        content: String,
        message_type: String,
    },
    NewMessage { message: ChatMessage },
    MessageSent { message: ChatMessage },
    TypingStart { conversation_id: String },
    TypingStop { conversation_id: String },
    TypingIndicator {
        conversation_id: String,
        user_id: String,
        is_typing: bool,
    },
    MarkRead {
        message_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<String>,
    },
    MessageRead {
        message_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<String>,
        read_by: String,
    },

    // -- Liveness and faults --
    Ping,
    Pong,
    Error { message: String },
}

impl WireMessage {
    /// The `type` tag, as spelled on the wire. Used as the dispatch key by
    /// the event bus.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::IceCandidate { .. } => "ice-candidate",
            Self::Join { .. } => "join",
            Self::Leave { .. } => "leave",
            Self::Mute { .. } => "mute",
            Self::VideoToggle { .. } => "video_toggle",
            Self::ParticipantMuted { .. } => "participant_muted",
            Self::ParticipantVideo { .. } => "participant_video",
            Self::IncomingCall { .. } => "incoming_call",
            Self::CallEnded { .. } => "call_ended",
            Self::ConnectionEstablished { .. } => "connection_established",
            Self::SendMessage { .. } => "send_message",
            Self::NewMessage { .. } => "new_message",
            Self::MessageSent { .. } => "message_sent",
            Self::TypingStart { .. } => "typing_start",
            Self::TypingStop { .. } => "typing_stop",
            Self::TypingIndicator { .. } => "typing_indicator",
            Self::MarkRead { .. } => "mark_read",
            Self::MessageRead { .. } => "message_read",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::Error { .. } => "error",
        }
    }

    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
