//! Configuration knobs for the signaling link and call orchestration.

use std::time::Duration;

/// Settings for the signaling WebSocket link.
#[derive(Clone, Debug)]
pub struct LinkConfig {
    /// Base endpoint, e.g. `wss://host/api/v1/ws`. The device id and auth
    /// token are appended by the link when dialing.
    pub endpoint: String,
    /// First reconnect delay; doubles per failed attempt.
    pub base_delay: Duration,
    /// Upper bound on the reconnect delay.
    pub cap_delay: Duration,
    /// Reconnect attempts before giving up with a terminal notification.
    pub max_attempts: u32,
    /// Hard timeout for the open handshake.
    pub connect_timeout: Duration,
    /// Application-level ping/pong liveness loop.
    pub heartbeat: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            base_delay: Duration::from_secs(1),
            cap_delay: Duration::from_secs(30),
            max_attempts: 5,
            connect_timeout: Duration::from_secs(10),
            heartbeat: true,
        }
    }
}

/// Settings for call sessions.
#[derive(Clone, Debug)]
pub struct CallConfig {
    /// STUN/TURN server URLs, passed through to the media engine opaquely.
    pub ice_servers: Vec<String>,
    /// How long an unanswered call may ring before it ends with a timeout.
    pub ring_timeout: Duration,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: Vec::new(),
            ring_timeout: Duration::from_secs(45),
        }
    }
}
