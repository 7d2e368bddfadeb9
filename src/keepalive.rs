//! Application-level liveness for the signaling link.
//!
//! TCP can sit half-open for minutes before anyone notices. The keepalive
//! task pings on a jittered interval and, when the server stops answering,
//! drops the transport so the run loop reconnects.

use crate::link::{ConnectionState, SignalingLink};
use crate::wire::WireMessage;
use log::{debug, warn};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const KEEP_ALIVE_INTERVAL_MIN: Duration = Duration::from_secs(20);
const KEEP_ALIVE_INTERVAL_MAX: Duration = Duration::from_secs(30);

/// How long the link tolerates silence before declaring the connection
/// dead. Spans two missed ping intervals plus slack.
const PONG_DEADLINE: Duration = Duration::from_secs(75);

impl SignalingLink {
    pub(crate) fn spawn_keepalive(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            debug!(target: "Link/Keepalive", "Keepalive loop started");
            loop {
                let interval = rand::rng()
                    .random_range(KEEP_ALIVE_INTERVAL_MIN..=KEEP_ALIVE_INTERVAL_MAX);
                tokio::time::sleep(interval).await;

                if self.state() != ConnectionState::Connected {
                    break;
                }
                let silent_for = self.last_pong.lock().unwrap().elapsed();
                if silent_for > PONG_DEADLINE {
                    warn!(target: "Link/Keepalive", "No pong for {silent_for:?}; recycling the connection");
                    self.force_reconnect().await;
                    break;
                }
                if !self.send(&WireMessage::Ping).await {
                    break;
                }
            }
            debug!(target: "Link/Keepalive", "Keepalive loop stopped");
        })
    }
}
