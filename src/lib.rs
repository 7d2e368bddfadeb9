//! Real-time communication core: a resilient WebSocket signaling link with
//! automatic reconnection, and multi-party call orchestration (offer/answer
//! and ICE relay, mute/video propagation, call lifecycle) on top of it.
//!
//! The crate is transport- and media-agnostic at its edges: the WebSocket
//! lives behind [`transport::TransportFactory`], the WebRTC stack behind
//! [`calls::media::MediaEngine`], and the call REST endpoints behind
//! [`calls::CallApi`]. Everything in between — reconnect policy, wire
//! protocol, the per-call session actor, peer negotiation bookkeeping — is
//! pure logic and tested against scripted doubles.

pub mod bus;
pub mod calls;
pub mod config;
pub mod error;
pub mod events;
mod keepalive;
pub mod link;
pub mod socket;
pub mod transport;
pub mod wire;

pub use bus::{EventBus, MessageHandler};
pub use config::{CallConfig, LinkConfig};
pub use error::ConnectionError;
pub use events::Notifier;
pub use link::{AuthTokenProvider, ConnectionState, SignalingLink};
pub use wire::{CallKind, WireMessage};
