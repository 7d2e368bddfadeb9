//! The signaling link: one resilient WebSocket connection to the server.
//!
//! [`SignalingLink::run`] owns the connect/pump/reconnect loop. Reconnects
//! back off exponentially and stop after a fixed budget, on an
//! authentication close, or when the disconnect was requested locally.
//! Inbound frames are parsed and fanned out through the [`crate::bus`];
//! outbound sends are fire-and-forget and silently dropped while the link
//! is down.

use crate::bus::EventBus;
use crate::config::LinkConfig;
use crate::error::ConnectionError;
use crate::events::{GiveUpReason, LinkConnected, LinkDisconnected, LinkGaveUp, Notifier};
use crate::transport::{Transport, TransportEvent, TransportFactory};
use crate::wire::WireMessage;
use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::time::Instant;

/// Close code the server uses for authentication failures. Reconnecting
/// with the same credential would fail the same way, so the link gives up
/// immediately instead of burning its retry budget.
pub const PERMANENT_REJECT_CODE: u16 = 4001;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

/// Supplies the bearer token appended to the dial URL. Returning `None`
/// (no account, logged out) stops the link without retries.
#[async_trait]
pub trait AuthTokenProvider: Send + Sync {
    async fn bearer_token(&self) -> Option<String>;
}

pub struct SignalingLink {
    pub(crate) config: LinkConfig,
    factory: Arc<dyn TransportFactory>,
    auth: Arc<dyn AuthTokenProvider>,
    pub bus: Arc<EventBus>,
    pub notifier: Arc<Notifier>,

    transport: Mutex<Option<Arc<dyn Transport>>>,
    state_tx: watch::Sender<ConnectionState>,
    is_connecting: AtomicBool,
    expected_disconnect: AtomicBool,
    enable_auto_reconnect: AtomicBool,
    reconnect_attempts: AtomicU32,
    pub(crate) last_pong: StdMutex<Instant>,
}

impl SignalingLink {
    pub fn new(
        config: LinkConfig,
        factory: Arc<dyn TransportFactory>,
        auth: Arc<dyn AuthTokenProvider>,
        bus: Arc<EventBus>,
        notifier: Arc<Notifier>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            config,
            factory,
            auth,
            bus,
            notifier,
            transport: Mutex::new(None),
            state_tx,
            is_connecting: AtomicBool::new(false),
            expected_disconnect: AtomicBool::new(false),
            enable_auto_reconnect: AtomicBool::new(true),
            reconnect_attempts: AtomicU32::new(0),
            last_pong: StdMutex::new(Instant::now()),
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn state_stream(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn set_auto_reconnect(&self, enabled: bool) {
        self.enable_auto_reconnect.store(enabled, Ordering::SeqCst);
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    /// Dials once. The reconnect policy lives in [`Self::run`]; callers that
    /// want resilience use that instead.
    pub async fn connect(
        &self,
        device_id: &str,
    ) -> Result<mpsc::Receiver<TransportEvent>, ConnectionError> {
        if self.state() == ConnectionState::Connected {
            return Err(ConnectionError::AlreadyConnected);
        }
        if self.is_connecting.swap(true, Ordering::SeqCst) {
            return Err(ConnectionError::AlreadyConnecting);
        }
        let _connecting = scopeguard::guard((), |_| {
            self.is_connecting.store(false, Ordering::SeqCst);
        });

        let token = self
            .auth
            .bearer_token()
            .await
            .ok_or(ConnectionError::NoCredential)?;
        let url = format!("{}/{}?token={}", self.config.endpoint, device_id, token);

        self.set_state(ConnectionState::Connecting);
        let dial = tokio::time::timeout(
            self.config.connect_timeout,
            self.factory.create_transport(&url),
        );
        let (transport, events) = match dial.await {
            Ok(Ok(pair)) => pair,
            Ok(Err(err)) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(ConnectionError::Transport(err.to_string()));
            }
            Err(_) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(ConnectionError::Timeout(self.config.connect_timeout));
            }
        };

        *self.transport.lock().await = Some(transport);
        *self.last_pong.lock().unwrap() = Instant::now();
        self.set_state(ConnectionState::Connected);
        Ok(events)
    }

    /// Connect-and-stay-connected loop. Returns only once the link has
    /// terminally given up or was disconnected on purpose.
    pub async fn run(self: &Arc<Self>, device_id: &str) {
        loop {
            match self.connect(device_id).await {
                Ok(mut events) => {
                    self.reconnect_attempts.store(0, Ordering::SeqCst);
                    info!(target: "Link", "Signaling link connected");
                    let _ = self.notifier.connected.send(Arc::new(LinkConnected));

                    let keepalive = self
                        .config
                        .heartbeat
                        .then(|| self.clone().spawn_keepalive());
                    let close_code = self.pump(&mut events).await;
                    if let Some(task) = keepalive {
                        task.abort();
                    }

                    self.transport.lock().await.take();
                    self.set_state(ConnectionState::Disconnected);

                    if self.expected_disconnect.swap(false, Ordering::SeqCst) {
                        debug!(target: "Link", "Disconnected on request");
                        return;
                    }
                    if close_code == Some(PERMANENT_REJECT_CODE) {
                        warn!(target: "Link", "Server rejected the session (close {PERMANENT_REJECT_CODE}); not retrying");
                        self.give_up(GiveUpReason::ServerRejected);
                        return;
                    }
                    if !self.backoff(close_code).await {
                        return;
                    }
                }
                Err(ConnectionError::NoCredential) => {
                    warn!(target: "Link", "No credential; signaling link stopped");
                    self.give_up(GiveUpReason::NoCredential);
                    return;
                }
                Err(
                    err @ (ConnectionError::AlreadyConnected | ConnectionError::AlreadyConnecting),
                ) => {
                    warn!(target: "Link", "Run loop overlap: {err}");
                    return;
                }
                Err(err) => {
                    debug!(target: "Link", "Connect failed: {err}");
                    if !self.backoff(None).await {
                        return;
                    }
                }
            }
            if !self.enable_auto_reconnect.load(Ordering::SeqCst) {
                return;
            }
        }
    }

    /// Sleeps out the next reconnect delay. False when the budget is spent.
    async fn backoff(&self, close_code: Option<u16>) -> bool {
        let attempt = self.reconnect_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt > self.config.max_attempts {
            warn!(target: "Link", "Giving up after {} reconnect attempts", self.config.max_attempts);
            self.give_up(GiveUpReason::RetriesExhausted);
            return false;
        }
        let delay = reconnect_delay(attempt, &self.config);
        info!(target: "Link", "Reconnect attempt {attempt} in {delay:?}");
        let _ = self.notifier.disconnected.send(Arc::new(LinkDisconnected {
            attempt,
            close_code,
        }));
        tokio::time::sleep(delay).await;
        true
    }

    fn give_up(&self, reason: GiveUpReason) {
        let _ = self.notifier.link_gave_up.send(Arc::new(LinkGaveUp {
            attempts: self.reconnect_attempts.load(Ordering::SeqCst).saturating_sub(1),
            reason,
        }));
    }

    /// Consumes transport events until the connection drops. Returns the
    /// close code, when the server sent one.
    async fn pump(&self, events: &mut mpsc::Receiver<TransportEvent>) -> Option<u16> {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Connected => {}
                TransportEvent::MessageReceived(text) => match WireMessage::parse(&text) {
                    Ok(WireMessage::Pong) => self.record_pong(),
                    Ok(WireMessage::Ping) => {
                        self.send(&WireMessage::Pong).await;
                    }
                    Ok(message) => self.bus.dispatch(&message).await,
                    Err(err) => {
                        warn!(target: "Link", "Dropping unparseable frame: {err}");
                    }
                },
                TransportEvent::Disconnected { code } => return code,
            }
        }
        None
    }

    pub(crate) fn record_pong(&self) {
        *self.last_pong.lock().unwrap() = Instant::now();
    }

    /// Sends one message if connected. Messages sent while the link is down
    /// are dropped, not queued; callers needing delivery confirmation wait
    /// for the server's application-level reply.
    pub async fn send(&self, message: &WireMessage) -> bool {
        if self.state() != ConnectionState::Connected {
            debug!(target: "Link", "Dropping {} while disconnected", message.tag());
            return false;
        }
        let json = match message.to_json() {
            Ok(json) => json,
            Err(err) => {
                warn!(target: "Link", "Could not serialize {}: {err}", message.tag());
                return false;
            }
        };
        let transport = self.transport.lock().await.clone();
        let Some(transport) = transport else {
            debug!(target: "Link", "Dropping {} while disconnected", message.tag());
            return false;
        };
        if let Err(err) = transport.send_text(&json).await {
            warn!(target: "Link", "Send of {} failed: {err}", message.tag());
            return false;
        }
        true
    }

    /// Stops the link for good: no reconnect will follow.
    pub async fn disconnect(&self) {
        self.set_auto_reconnect(false);
        self.expected_disconnect.store(true, Ordering::SeqCst);
        self.set_state(ConnectionState::Closing);
        let transport = self.transport.lock().await.clone();
        if let Some(transport) = transport {
            transport.disconnect().await;
        } else {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    /// Tears the transport down without marking the disconnect as expected,
    /// so the run loop dials again. Used when the server stops answering
    /// pings.
    pub(crate) async fn force_reconnect(&self) {
        let transport = self.transport.lock().await.clone();
        if let Some(transport) = transport {
            transport.disconnect().await;
        }
    }
}

#[async_trait]
impl crate::calls::SignalOutbox for SignalingLink {
    async fn send_signal(&self, message: &WireMessage) -> bool {
        self.send(message).await
    }
}

/// `min(base * 2^(attempt-1), cap)`, saturating.
fn reconnect_delay(attempt: u32, config: &LinkConfig) -> Duration {
    let shift = attempt.saturating_sub(1).min(16);
    config
        .base_delay
        .saturating_mul(1u32 << shift)
        .min(config.cap_delay)
}
