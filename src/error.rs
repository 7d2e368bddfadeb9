//! Connection-level error types.

use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by [`crate::link::SignalingLink::connect`].
///
/// Only `NoCredential` is non-recoverable; everything else is retried by the
/// link's reconnect loop when auto-reconnect is enabled.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("no valid credential available")]
    NoCredential,

    #[error("connection attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection rejected by server: {0}")]
    Rejected(String),

    #[error("already connected")]
    AlreadyConnected,

    #[error("a connection attempt is already in flight")]
    AlreadyConnecting,

    #[error("transport error: {0}")]
    Transport(String),
}
