//! One actor per call.
//!
//! Every mutation of call state flows through the session's command channel,
//! so there is exactly one writer and no locking around the state machine.
//! Slow collaborator work (device acquisition, the initiate/join requests,
//! offer/answer creation) runs in spawned tasks that report back as
//! commands, so a `Hangup` is never stuck behind a suspended permission
//! prompt; a generation counter lets teardown invalidate whatever is still
//! in flight.

use super::api::{CallApi, CallHistorySink, CallInitiateResponse, CallRecord};
use super::error::{CallError, MediaError, NegotiationError};
use super::media::{IceCandidate, LocalMedia, MediaEngine, SessionDescription};
use super::peer::{NegotiationState, PeerLink};
use super::registry::CallRegistry;
use super::state::{CallState, CallTransition};
use super::{CallDirection, CallId, EndReason};
use crate::config::CallConfig;
use crate::events::{CallEnded, CallStateChanged, Notifier, ParticipantUpdate};
use crate::wire::{CallKind, WireMessage};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

const COMMAND_BUFFER: usize = 32;

/// Outbound half of the signaling link, as seen by call sessions.
#[async_trait]
pub trait SignalOutbox: Send + Sync {
    /// Fire-and-forget. Returns false when the link is down and the message
    /// was dropped.
    async fn send_signal(&self, message: &WireMessage) -> bool;
}

/// Collaborators shared by every session.
pub struct SessionDeps {
    pub outbox: Arc<dyn SignalOutbox>,
    pub media: Arc<dyn MediaEngine>,
    pub api: Arc<dyn CallApi>,
    pub history: Option<Arc<dyn CallHistorySink>>,
    pub registry: Arc<CallRegistry>,
    pub notifier: Arc<Notifier>,
    pub config: CallConfig,
}

pub enum SessionCommand {
    Accept,
    Decline,
    Hangup,
    SetMuted(bool),
    SetVideoEnabled(bool),
    ToggleMute,
    ToggleVideo,
    /// Invites another participant into the running call.
    AddParticipant { user_id: String },
    /// A signaling message routed to this call by the manager.
    Signal(WireMessage),
    ForceEnd {
        reason: EndReason,
    },

    // Results of spawned setup and negotiation tasks. Stale generations are
    // dropped, releasing whatever resource the late result carries.
    MediaReady {
        generation: u64,
        result: Result<Arc<dyn LocalMedia>, MediaError>,
    },
    InitiateReady {
        generation: u64,
        result: Result<CallInitiateResponse, String>,
    },
    JoinReady {
        generation: u64,
        result: Result<(), String>,
    },
    OfferReady {
        participant_id: String,
        generation: u64,
        result: Result<SessionDescription, NegotiationError>,
    },
    AnswerReady {
        participant_id: String,
        generation: u64,
        result: Result<SessionDescription, NegotiationError>,
    },
}

/// Cheap cloneable handle to a running session actor.
#[derive(Clone)]
pub struct CallSessionHandle {
    call_id: Arc<StdMutex<CallId>>,
    pub kind: CallKind,
    pub direction: CallDirection,
    cmd_tx: mpsc::Sender<SessionCommand>,
    state_rx: watch::Receiver<CallState>,
}

impl CallSessionHandle {
    /// Current id; outgoing calls adopt the server-assigned id after the
    /// initiate ack, so this can change once early in the call.
    pub fn call_id(&self) -> CallId {
        self.call_id.lock().unwrap().clone()
    }

    pub fn state(&self) -> CallState {
        self.state_rx.borrow().clone()
    }

    /// Watch stream of state changes, for callers that want to await them.
    pub fn state_stream(&self) -> watch::Receiver<CallState> {
        self.state_rx.clone()
    }

    pub async fn accept(&self) {
        let _ = self.cmd_tx.send(SessionCommand::Accept).await;
    }

    pub async fn decline(&self) {
        let _ = self.cmd_tx.send(SessionCommand::Decline).await;
    }

    pub async fn hangup(&self) {
        let _ = self.cmd_tx.send(SessionCommand::Hangup).await;
    }

    pub async fn add_participant(&self, user_id: impl Into<String>) {
        let _ = self
            .cmd_tx
            .send(SessionCommand::AddParticipant {
                user_id: user_id.into(),
            })
            .await;
    }

    pub async fn set_muted(&self, muted: bool) {
        let _ = self.cmd_tx.send(SessionCommand::SetMuted(muted)).await;
    }

    pub async fn set_video_enabled(&self, enabled: bool) {
        let _ = self
            .cmd_tx
            .send(SessionCommand::SetVideoEnabled(enabled))
            .await;
    }

    /// Flips the mute flag from whatever it currently is inside the actor,
    /// so callers need not track it themselves.
    pub async fn toggle_mute(&self) {
        let _ = self.cmd_tx.send(SessionCommand::ToggleMute).await;
    }

    pub async fn toggle_video(&self) {
        let _ = self.cmd_tx.send(SessionCommand::ToggleVideo).await;
    }

    pub(crate) async fn signal(&self, message: WireMessage) {
        let _ = self.cmd_tx.send(SessionCommand::Signal(message)).await;
    }

    pub(crate) async fn force_end(&self, reason: EndReason) {
        let _ = self.cmd_tx.send(SessionCommand::ForceEnd { reason }).await;
    }
}

pub struct CallSession {
    deps: Arc<SessionDeps>,
    call_id: Arc<StdMutex<CallId>>,
    self_user_id: String,
    kind: CallKind,
    direction: CallDirection,
    invited: Vec<String>,

    state: CallState,
    state_tx: watch::Sender<CallState>,
    participants: HashMap<String, PeerLink>,
    local_media: Option<Arc<dyn LocalMedia>>,
    muted: bool,
    video_enabled: bool,
    /// Set once the server has been told about this call; gates the
    /// best-effort end request during teardown.
    server_knows: bool,
    /// True once the media/initiate (or media/join) pipeline has been
    /// kicked off, so a repeated accept does not open the devices twice.
    setup_started: bool,
    generation: u64,
    ring_deadline: Option<Instant>,
    cmd_tx: mpsc::Sender<SessionCommand>,
}

impl CallSession {
    /// Places an outgoing call. Claims the single-call slot synchronously
    /// before the actor spawns, so a racing second start loses immediately.
    pub fn start_outgoing(
        deps: Arc<SessionDeps>,
        self_user_id: &str,
        participants: Vec<String>,
        kind: CallKind,
    ) -> Result<CallSessionHandle, CallError> {
        let provisional = CallId::generate();
        let (state_tx, state_rx) = watch::channel(CallState::Initiating);
        deps.registry.try_start(provisional.clone(), state_rx.clone())?;

        Ok(Self::spawn(
            deps,
            provisional,
            self_user_id,
            kind,
            CallDirection::Outgoing,
            participants,
            CallState::Initiating,
            state_tx,
            state_rx,
        ))
    }

    /// Registers an incoming call in the ringing state.
    pub fn start_incoming(
        deps: Arc<SessionDeps>,
        self_user_id: &str,
        call_id: CallId,
        caller_id: &str,
        kind: CallKind,
    ) -> Result<CallSessionHandle, CallError> {
        let initial = CallState::Ringing {
            since: chrono::Utc::now(),
        };
        let (state_tx, state_rx) = watch::channel(initial.clone());
        deps.registry.try_start(call_id.clone(), state_rx.clone())?;

        Ok(Self::spawn(
            deps,
            call_id,
            self_user_id,
            kind,
            CallDirection::Incoming,
            vec![caller_id.to_string()],
            initial,
            state_tx,
            state_rx,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn(
        deps: Arc<SessionDeps>,
        call_id: CallId,
        self_user_id: &str,
        kind: CallKind,
        direction: CallDirection,
        invited: Vec<String>,
        state: CallState,
        state_tx: watch::Sender<CallState>,
        state_rx: watch::Receiver<CallState>,
    ) -> CallSessionHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
        let call_id = Arc::new(StdMutex::new(call_id));
        let server_knows = direction == CallDirection::Incoming;
        let session = CallSession {
            deps,
            call_id: call_id.clone(),
            self_user_id: self_user_id.to_string(),
            kind,
            direction,
            invited,
            state,
            state_tx,
            participants: HashMap::new(),
            local_media: None,
            muted: false,
            video_enabled: kind.is_video(),
            server_knows,
            setup_started: direction == CallDirection::Outgoing,
            generation: 0,
            ring_deadline: None,
            cmd_tx: cmd_tx.clone(),
        };
        tokio::spawn(session.run(cmd_rx));

        CallSessionHandle {
            call_id,
            kind,
            direction,
            cmd_tx,
            state_rx,
        }
    }

    fn call_id(&self) -> CallId {
        self.call_id.lock().unwrap().clone()
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<SessionCommand>) {
        if self.direction == CallDirection::Incoming {
            self.arm_ring_deadline();
        } else {
            self.spawn_media_acquisition();
        }

        while !self.state.is_ended() {
            let ringing = self.state.is_ringing();
            let deadline = self.ring_deadline.unwrap_or_else(Instant::now);
            tokio::select! {
                maybe_cmd = cmd_rx.recv() => match maybe_cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => self.finish(EndReason::Hangup).await,
                },
                _ = tokio::time::sleep_until(deadline), if ringing => {
                    info!(target: "Call", "Call {} rang unanswered for {:?}",
                        self.call_id(), self.deps.config.ring_timeout);
                    self.finish(EndReason::Timeout).await;
                }
            }
        }

        // Setup results may still sit in the mailbox holding resources.
        cmd_rx.close();
        while let Some(cmd) = cmd_rx.recv().await {
            self.discard_late(cmd);
        }
    }

    /// Disposes of a command that arrived after the call already ended.
    fn discard_late(&self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::MediaReady { result, .. } => Self::release_unused_media(result),
            SessionCommand::InitiateReady { result, .. } => self.end_unwanted_call(result),
            _ => {}
        }
    }

    /// A device grant that landed after teardown goes straight back.
    fn release_unused_media(result: Result<Arc<dyn LocalMedia>, MediaError>) {
        if let Ok(media) = result {
            media.release();
        }
    }

    /// The call was torn down before the server answered the initiate
    /// request, but the server may have set the call up regardless.
    fn end_unwanted_call(&self, result: Result<CallInitiateResponse, String>) {
        if let Ok(response) = result {
            let api = self.deps.api.clone();
            tokio::spawn(async move {
                let _ = api.end(&response.call_id).await;
            });
        }
    }

    /// First setup stage for both directions. Acquisition can suspend on a
    /// device-permission prompt for as long as the user stares at it, so it
    /// runs off the actor and the mailbox stays responsive; a hangup in the
    /// meantime bumps the generation and the late grant is released unused.
    fn spawn_media_acquisition(&self) {
        let media = self.deps.media.clone();
        let kind = self.kind;
        let generation = self.generation;
        let tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let result = media.acquire_local_media(kind).await;
            let send = tx
                .send(SessionCommand::MediaReady { generation, result })
                .await;
            // Actor already gone: hand a late grant straight back.
            if let Err(unsent) = send
                && let SessionCommand::MediaReady {
                    result: Ok(media), ..
                } = unsent.0
            {
                media.release();
            }
        });
    }

    async fn media_ready(&mut self, result: Result<Arc<dyn LocalMedia>, MediaError>) {
        let media = match result {
            Ok(media) => media,
            Err(err) => {
                warn!(target: "Call", "Local media acquisition failed: {err}");
                self.finish(EndReason::MediaFailed).await;
                return;
            }
        };
        // Mute/video commands may already have been processed while the
        // devices were opening; bring the tracks in line with the flags.
        media.set_audio_enabled(!self.muted);
        media.set_video_enabled(self.video_enabled);
        self.local_media = Some(media);
        match self.direction {
            CallDirection::Outgoing => self.spawn_initiate(),
            CallDirection::Incoming => self.spawn_join(),
        }
    }

    fn spawn_initiate(&self) {
        let api = self.deps.api.clone();
        let invited = self.invited.clone();
        let kind = self.kind;
        let generation = self.generation;
        let tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let result = api.initiate(&invited, kind).await;
            let send = tx
                .send(SessionCommand::InitiateReady { generation, result })
                .await;
            if let Err(unsent) = send
                && let SessionCommand::InitiateReady {
                    result: Ok(response),
                    ..
                } = unsent.0
            {
                let _ = api.end(&response.call_id).await;
            }
        });
    }

    async fn initiate_ready(&mut self, result: Result<CallInitiateResponse, String>) {
        match result {
            Ok(response) => {
                let provisional = self.call_id();
                self.deps
                    .registry
                    .rebind(&provisional, response.call_id.clone());
                *self.call_id.lock().unwrap() = response.call_id;
                self.server_knows = true;
                self.apply(CallTransition::ServerAcked);
                self.arm_ring_deadline();
                self.deps
                    .outbox
                    .send_signal(&WireMessage::Join {
                        user_id: self.self_user_id.clone(),
                    })
                    .await;
                info!(target: "Call", "Outgoing call {} ringing", self.call_id());
            }
            Err(err) => {
                warn!(target: "Call", "Call initiation rejected: {err}");
                if self.enter_ended(CallTransition::ServerRejected {
                    reason: EndReason::ServerRejected,
                }) {
                    self.teardown().await;
                }
            }
        }
    }

    fn spawn_join(&self) {
        let api = self.deps.api.clone();
        let call_id = self.call_id();
        let generation = self.generation;
        let tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let result = api.join(&call_id).await;
            let _ = tx
                .send(SessionCommand::JoinReady { generation, result })
                .await;
        });
    }

    async fn join_ready(&mut self, result: Result<(), String>) {
        if let Err(err) = result {
            warn!(target: "Call", "Join request for call {} failed: {err}", self.call_id());
            self.finish(EndReason::ServerRejected).await;
            return;
        }
        self.apply(CallTransition::LocalAccepted);
        self.ring_deadline = None;
        self.deps
            .outbox
            .send_signal(&WireMessage::Join {
                user_id: self.self_user_id.clone(),
            })
            .await;
    }

    async fn handle_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Accept => self.accept().await,
            SessionCommand::Decline => self.decline().await,
            SessionCommand::Hangup => {
                self.deps
                    .outbox
                    .send_signal(&WireMessage::Leave {
                        user_id: self.self_user_id.clone(),
                    })
                    .await;
                self.finish(EndReason::Hangup).await;
            }
            SessionCommand::AddParticipant { user_id } => self.add_participant(user_id).await,
            SessionCommand::SetMuted(muted) => self.set_muted(muted).await,
            SessionCommand::SetVideoEnabled(enabled) => self.set_video(enabled).await,
            SessionCommand::ToggleMute => self.set_muted(!self.muted).await,
            SessionCommand::ToggleVideo => self.set_video(!self.video_enabled).await,
            SessionCommand::MediaReady { generation, result } => {
                if generation == self.generation {
                    self.media_ready(result).await;
                } else {
                    Self::release_unused_media(result);
                }
            }
            SessionCommand::InitiateReady { generation, result } => {
                if generation == self.generation {
                    self.initiate_ready(result).await;
                } else {
                    self.end_unwanted_call(result);
                }
            }
            SessionCommand::JoinReady { generation, result } => {
                if generation != self.generation {
                    debug!(target: "Call", "Dropping stale join ack");
                    return;
                }
                self.join_ready(result).await;
            }
            SessionCommand::Signal(message) => self.handle_signal(message).await,
            SessionCommand::ForceEnd { reason } => self.finish(reason).await,
            SessionCommand::OfferReady {
                participant_id,
                generation,
                result,
            } => {
                if generation != self.generation {
                    debug!(target: "Call", "Dropping stale offer for {participant_id}");
                    return;
                }
                self.offer_ready(&participant_id, result).await;
            }
            SessionCommand::AnswerReady {
                participant_id,
                generation,
                result,
            } => {
                if generation != self.generation {
                    debug!(target: "Call", "Dropping stale answer for {participant_id}");
                    return;
                }
                self.answer_ready(&participant_id, result).await;
            }
        }
    }

    /// Kicks off the media/join pipeline; the call stays Ringing (ring
    /// deadline included) until the join ack lands.
    async fn accept(&mut self) {
        if self.direction != CallDirection::Incoming || !self.state.is_ringing() {
            debug!(target: "Call", "Ignoring accept in state {:?}", self.state);
            return;
        }
        if self.setup_started {
            debug!(target: "Call", "Accept already underway for call {}", self.call_id());
            return;
        }
        self.setup_started = true;
        self.spawn_media_acquisition();
    }

    async fn decline(&mut self) {
        if !self.state.is_ringing() {
            debug!(target: "Call", "Ignoring decline in state {:?}", self.state);
            return;
        }
        if self.enter_ended(CallTransition::LocalDeclined) {
            self.teardown().await;
        }
    }

    /// Asks the server to invite one more user. The invitee arrives over the
    /// signaling channel as a normal `join`, so no negotiation starts here.
    async fn add_participant(&mut self, user_id: String) {
        if user_id == self.self_user_id || self.participants.contains_key(&user_id) {
            debug!(target: "Call", "{user_id} is already part of this call");
            return;
        }
        if !self.server_knows {
            debug!(target: "Call", "Ignoring invite before the server acked the call");
            return;
        }
        let call_id = self.call_id();
        match self.deps.api.invite(&call_id, &user_id).await {
            Ok(()) => {
                if !self.invited.contains(&user_id) {
                    self.invited.push(user_id);
                }
            }
            Err(err) => warn!(target: "Call", "Invite for {user_id} failed: {err}"),
        }
    }

    /// Idempotent: repeating the current value sends nothing.
    async fn set_muted(&mut self, muted: bool) {
        if self.muted == muted {
            return;
        }
        self.muted = muted;
        if let Some(media) = &self.local_media {
            media.set_audio_enabled(!muted);
        }
        self.deps
            .outbox
            .send_signal(&WireMessage::Mute {
                muted,
                user_id: self.self_user_id.clone(),
            })
            .await;
    }

    async fn set_video(&mut self, enabled: bool) {
        if self.video_enabled == enabled {
            return;
        }
        self.video_enabled = enabled;
        if let Some(media) = &self.local_media {
            media.set_video_enabled(enabled);
        }
        self.deps
            .outbox
            .send_signal(&WireMessage::VideoToggle {
                video_enabled: enabled,
                user_id: self.self_user_id.clone(),
            })
            .await;
    }

    async fn handle_signal(&mut self, message: WireMessage) {
        match message {
            WireMessage::Join { user_id } if user_id != self.self_user_id => {
                self.remote_joined(&user_id).await;
            }
            WireMessage::Offer { sdp, user_id, target } if user_id != self.self_user_id => {
                if Self::targets_other(&target, &self.self_user_id) {
                    return;
                }
                self.remote_offer(&user_id, sdp).await;
            }
            WireMessage::Answer { sdp, user_id, target } if user_id != self.self_user_id => {
                if Self::targets_other(&target, &self.self_user_id) {
                    return;
                }
                self.remote_answer(&user_id, sdp).await;
            }
            WireMessage::IceCandidate {
                candidate,
                user_id,
                target,
            } if user_id != self.self_user_id => {
                if Self::targets_other(&target, &self.self_user_id) {
                    return;
                }
                self.remote_candidate(&user_id, candidate).await;
            }
            WireMessage::Leave { user_id } if user_id != self.self_user_id => {
                self.remote_left(&user_id).await;
            }
            WireMessage::ParticipantMuted { user_id, muted } => {
                if user_id == self.self_user_id {
                    return;
                }
                self.notify_participant(&user_id, Some(muted), None);
            }
            WireMessage::ParticipantVideo {
                user_id,
                video_enabled,
            } => {
                if user_id == self.self_user_id {
                    return;
                }
                self.notify_participant(&user_id, None, Some(video_enabled));
            }
            WireMessage::CallEnded { call_id, .. } => {
                if call_id == self.call_id().as_str() {
                    self.finish(EndReason::RemoteHangup).await;
                }
            }
            other => {
                debug!(target: "Call", "Ignoring signaling message {}", other.tag());
            }
        }
    }

    fn targets_other(target: &Option<String>, self_id: &str) -> bool {
        target.as_deref().is_some_and(|t| t != self_id)
    }

    async fn remote_joined(&mut self, user_id: &str) {
        match self.state {
            CallState::Ringing { .. } => self.apply(CallTransition::RemoteJoined),
            CallState::Connecting { .. } | CallState::Active { .. } => {}
            _ => {
                debug!(target: "Call", "Ignoring join from {user_id} in state {:?}", self.state);
                return;
            }
        }
        self.ring_deadline = None;
        self.notify_participant(user_id, None, None);

        let link = match self.ensure_link(user_id).await {
            Ok(link) => link,
            Err(err) => {
                warn!(target: "Call", "Peer connection for {user_id} failed: {err}");
                return;
            }
        };
        let Some(conn) = link.connection() else { return };
        let generation = self.generation;
        let participant_id = user_id.to_string();
        let tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let result = conn.create_offer().await;
            let _ = tx
                .send(SessionCommand::OfferReady {
                    participant_id,
                    generation,
                    result,
                })
                .await;
        });
    }

    async fn offer_ready(
        &mut self,
        user_id: &str,
        result: Result<SessionDescription, NegotiationError>,
    ) {
        let description = match result {
            Ok(description) => description,
            Err(err) => {
                self.drop_participant(user_id, &err).await;
                return;
            }
        };
        let Some(link) = self.participants.get_mut(user_id) else {
            return;
        };
        if let Err(err) = link.mark_offer_sent() {
            debug!(target: "Call", "Discarding local offer for {user_id}: {err}");
            return;
        }
        self.deps
            .outbox
            .send_signal(&WireMessage::Offer {
                sdp: description.sdp,
                user_id: self.self_user_id.clone(),
                target: Some(user_id.to_string()),
            })
            .await;
    }

    async fn remote_offer(&mut self, user_id: &str, sdp: String) {
        if !(self.state.is_connecting() || self.state.is_active()) {
            debug!(target: "Call", "Ignoring offer from {user_id} in state {:?}", self.state);
            return;
        }
        let link = match self.ensure_link(user_id).await {
            Ok(link) => link,
            Err(err) => {
                warn!(target: "Call", "Peer connection for {user_id} failed: {err}");
                return;
            }
        };
        if let Err(err) = link.apply_remote_offer(SessionDescription::new(sdp)).await {
            self.drop_participant(user_id, &err).await;
            return;
        }
        let Some(conn) = self.participants.get(user_id).and_then(|l| l.connection()) else {
            return;
        };
        let generation = self.generation;
        let participant_id = user_id.to_string();
        let tx = self.cmd_tx.clone();
        tokio::spawn(async move {
            let result = conn.create_answer().await;
            let _ = tx
                .send(SessionCommand::AnswerReady {
                    participant_id,
                    generation,
                    result,
                })
                .await;
        });
    }

    async fn answer_ready(
        &mut self,
        user_id: &str,
        result: Result<SessionDescription, NegotiationError>,
    ) {
        let description = match result {
            Ok(description) => description,
            Err(err) => {
                self.drop_participant(user_id, &err).await;
                return;
            }
        };
        {
            let Some(link) = self.participants.get_mut(user_id) else {
                return;
            };
            if let Err(err) = link.mark_answer_sent() {
                debug!(target: "Call", "Discarding local answer for {user_id}: {err}");
                return;
            }
        }
        self.deps
            .outbox
            .send_signal(&WireMessage::Answer {
                sdp: description.sdp,
                user_id: self.self_user_id.clone(),
                target: Some(user_id.to_string()),
            })
            .await;
        self.check_connected(user_id).await;
    }

    async fn remote_answer(&mut self, user_id: &str, sdp: String) {
        let Some(link) = self.participants.get_mut(user_id) else {
            debug!(target: "Call", "Answer from unknown participant {user_id}");
            return;
        };
        if let Err(err) = link.apply_remote_answer(SessionDescription::new(sdp)).await {
            self.drop_participant(user_id, &err).await;
            return;
        }
        self.check_connected(user_id).await;
    }

    async fn remote_candidate(&mut self, user_id: &str, candidate: String) {
        if !(self.state.is_connecting() || self.state.is_active()) {
            debug!(target: "Call", "Ignoring candidate from {user_id} in state {:?}", self.state);
            return;
        }
        // Candidates may race ahead of the offer; the link buffers them
        // until the remote description lands.
        let link = match self.ensure_link(user_id).await {
            Ok(link) => link,
            Err(err) => {
                warn!(target: "Call", "Peer connection for {user_id} failed: {err}");
                return;
            }
        };
        if let Err(err) = link.add_remote_candidate(IceCandidate::new(candidate)).await {
            self.drop_participant(user_id, &err).await;
            return;
        }
        self.check_connected(user_id).await;
    }

    async fn remote_left(&mut self, user_id: &str) {
        if let Some(mut link) = self.participants.remove(user_id) {
            link.close().await;
        }
        self.notify_left(user_id);
        if self.participants.is_empty()
            && (self.state.is_connecting() || self.state.is_active())
        {
            self.finish(EndReason::RemoteHangup).await;
        }
    }

    async fn ensure_link(&mut self, user_id: &str) -> Result<&mut PeerLink, NegotiationError> {
        if !self.participants.contains_key(user_id) {
            let conn = self
                .deps
                .media
                .create_peer_connection(user_id, &self.deps.config.ice_servers)
                .await?;
            self.participants
                .insert(user_id.to_string(), PeerLink::new(user_id, conn));
        }
        Ok(self.participants.get_mut(user_id).unwrap())
    }

    /// Promotes a link to connected once its transport reports so, then
    /// activates the call when every link is connected.
    async fn check_connected(&mut self, user_id: &str) {
        let newly_connected = {
            let Some(link) = self.participants.get_mut(user_id) else {
                return;
            };
            let negotiated = matches!(
                link.state(),
                NegotiationState::AnswerSent | NegotiationState::AnswerReceived
            );
            if negotiated
                && let Some(conn) = link.connection()
                && conn.is_connected().await
            {
                link.mark_connected().await.is_ok()
            } else {
                false
            }
        };
        if newly_connected {
            debug!(target: "Call", "Peer link to {user_id} connected");
            self.maybe_activate();
        }
    }

    fn maybe_activate(&mut self) {
        if !self.state.is_connecting() || self.participants.is_empty() {
            return;
        }
        let all_connected = self
            .participants
            .values()
            .all(|link| link.state() == NegotiationState::Connected);
        if all_connected {
            self.apply(CallTransition::MediaConnected);
            info!(target: "Call", "Call {} active with {} participant(s)",
                self.call_id(), self.participants.len());
        }
    }

    /// Negotiation with one participant failed; the call survives while
    /// anyone else remains.
    async fn drop_participant(&mut self, user_id: &str, err: &NegotiationError) {
        warn!(target: "Call", "Dropping participant {user_id}: {err}");
        if let Some(mut link) = self.participants.remove(user_id) {
            link.mark_failed();
            link.close().await;
        }
        self.notify_left(user_id);
        if self.participants.is_empty() && !self.state.is_ended() && !self.state.is_ringing() {
            self.finish(EndReason::NegotiationFailed).await;
        } else {
            self.maybe_activate();
        }
    }

    fn apply(&mut self, transition: CallTransition) {
        if let Err(err) = self.state.apply(transition) {
            warn!(target: "Call", "Rejected transition on call {}: {err}", self.call_id());
            return;
        }
        self.publish_state();
    }

    fn publish_state(&self) {
        self.state_tx.send_replace(self.state.clone());
        let _ = self.deps.notifier.call_state.send(Arc::new(CallStateChanged {
            call_id: self.call_id(),
            state: self.state.clone(),
        }));
    }

    fn arm_ring_deadline(&mut self) {
        self.ring_deadline = Some(Instant::now() + self.deps.config.ring_timeout);
    }

    fn notify_participant(
        &self,
        user_id: &str,
        muted: Option<bool>,
        video_enabled: Option<bool>,
    ) {
        let _ = self
            .deps
            .notifier
            .participant_update
            .send(Arc::new(ParticipantUpdate {
                call_id: self.call_id(),
                user_id: user_id.to_string(),
                muted,
                video_enabled,
                left: false,
            }));
    }

    fn notify_left(&self, user_id: &str) {
        let _ = self
            .deps
            .notifier
            .participant_update
            .send(Arc::new(ParticipantUpdate {
                call_id: self.call_id(),
                user_id: user_id.to_string(),
                muted: None,
                video_enabled: None,
                left: true,
            }));
    }

    async fn finish(&mut self, reason: EndReason) {
        if self.state.is_ended() {
            return;
        }
        if self.enter_ended(CallTransition::Terminated { reason }) {
            self.teardown().await;
        }
    }

    /// Moves to the terminal state without publishing it yet; the watch
    /// update happens at the end of teardown, once resources are gone, so
    /// observers of `Ended` see a fully cleaned-up call.
    fn enter_ended(&mut self, transition: CallTransition) -> bool {
        if let Err(err) = self.state.apply(transition) {
            warn!(target: "Call", "Rejected transition on call {}: {err}", self.call_id());
            return false;
        }
        true
    }

    /// Shared teardown, entered with the state already terminal. Releases
    /// every resource, tells the server, and emits the one-and-only end
    /// notification and history record.
    async fn teardown(&mut self) {
        self.generation += 1;
        self.ring_deadline = None;
        for link in self.participants.values_mut() {
            link.close().await;
        }
        self.participants.clear();
        if let Some(media) = self.local_media.take() {
            media.release();
        }

        let call_id = self.call_id();
        if self.server_knows {
            let api = self.deps.api.clone();
            let id = call_id.clone();
            tokio::spawn(async move {
                if let Err(err) = api.end(&id).await {
                    debug!(target: "Call", "End request for call {id} failed: {err}");
                }
            });
        }
        self.deps.registry.clear(&call_id);

        let CallState::Ended {
            reason,
            duration_secs,
            ..
        } = &self.state
        else {
            return;
        };
        let (reason, duration_secs) = (*reason, *duration_secs);
        info!(target: "Call", "Call {call_id} ended: {reason:?}");
        if let Some(history) = &self.deps.history {
            history.call_ended(CallRecord {
                call_id: call_id.clone(),
                kind: self.kind,
                duration_secs,
                end_reason: reason,
            });
        }
        let _ = self.deps.notifier.call_ended.send(Arc::new(CallEnded {
            call_id,
            duration_secs,
            reason,
        }));
        self.publish_state();
    }
}
