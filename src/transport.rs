//! Transport abstraction for the signaling link.
//!
//! The link never talks to a WebSocket directly; it goes through the
//! [`Transport`]/[`TransportFactory`] seam so tests can substitute a scripted
//! transport and the production build can use the `tokio-tungstenite` one in
//! [`crate::socket`].

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// An event produced by the transport layer.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The transport has successfully connected.
    Connected,
    /// A text frame has been received from the server.
    MessageReceived(String),
    /// The connection was lost. `code` is the WebSocket close code, when the
    /// peer sent one; abrupt stream teardown yields `None`.
    Disconnected { code: Option<u16> },
}

/// Represents an active network connection.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends a text frame to the server.
    async fn send_text(&self, text: &str) -> Result<(), anyhow::Error>;

    /// Closes the connection with a normal closure code.
    async fn disconnect(&self);
}

/// A factory responsible for creating new transport instances.
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Dials `url` and returns the transport along with its event stream.
    async fn create_transport(
        &self,
        url: &str,
    ) -> Result<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>), anyhow::Error>;
}
