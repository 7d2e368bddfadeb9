//! Routes call signaling from the event bus into the active session and
//! enforces the one-call-at-a-time rule.

use super::error::CallError;
use super::session::{CallSession, CallSessionHandle, SessionDeps};
use super::{CallId, EndReason};
use crate::bus::{EventBus, MessageHandler};
use crate::events::IncomingCall;
use crate::wire::{CallKind, WireMessage};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::sync::{Arc, Mutex as StdMutex};

/// Wire tags the manager wants to see. Everything else on the link is chat
/// traffic and none of the call machinery's business.
const CALL_TAGS: &[&str] = &[
    "offer",
    "answer",
    "ice-candidate",
    "join",
    "leave",
    "participant_muted",
    "participant_video",
    "incoming_call",
    "call_ended",
];

pub struct CallManager {
    deps: Arc<SessionDeps>,
    self_user_id: String,
    active: StdMutex<Option<CallSessionHandle>>,
}

impl CallManager {
    pub fn new(deps: Arc<SessionDeps>, self_user_id: &str) -> Arc<Self> {
        Arc::new(Self {
            deps,
            self_user_id: self_user_id.to_string(),
            active: StdMutex::new(None),
        })
    }

    /// Subscribes this manager to every call-related wire tag.
    pub fn register(self: &Arc<Self>, bus: &EventBus) {
        let handler: Arc<dyn MessageHandler> = self.clone();
        for tag in CALL_TAGS {
            bus.subscribe(tag, handler.clone());
        }
    }

    /// Places an outgoing call. Fails with [`CallError::Busy`] while another
    /// call is live.
    pub fn start_call(
        &self,
        participants: Vec<String>,
        kind: CallKind,
    ) -> Result<CallSessionHandle, CallError> {
        let handle =
            CallSession::start_outgoing(self.deps.clone(), &self.self_user_id, participants, kind)?;
        *self.active.lock().unwrap() = Some(handle.clone());
        Ok(handle)
    }

    /// The live call, if any.
    pub fn active_call(&self) -> Option<CallSessionHandle> {
        self.active
            .lock()
            .unwrap()
            .clone()
            .filter(|h| !h.state().is_ended())
    }

    pub async fn accept(&self) -> Result<(), CallError> {
        self.require_active()?.accept().await;
        Ok(())
    }

    pub async fn decline(&self) -> Result<(), CallError> {
        self.require_active()?.decline().await;
        Ok(())
    }

    pub async fn hangup(&self) -> Result<(), CallError> {
        self.require_active()?.hangup().await;
        Ok(())
    }

    /// Pulls one more user into the live call via a server-side invite.
    pub async fn add_participant(&self, user_id: &str) -> Result<(), CallError> {
        self.require_active()?.add_participant(user_id).await;
        Ok(())
    }

    pub async fn set_muted(&self, muted: bool) -> Result<(), CallError> {
        self.require_active()?.set_muted(muted).await;
        Ok(())
    }

    pub async fn set_video_enabled(&self, enabled: bool) -> Result<(), CallError> {
        self.require_active()?.set_video_enabled(enabled).await;
        Ok(())
    }

    /// Flips mute based on the session's own flag, for embedders that do
    /// not mirror the call state.
    pub async fn toggle_mute(&self) -> Result<(), CallError> {
        self.require_active()?.toggle_mute().await;
        Ok(())
    }

    pub async fn toggle_video(&self) -> Result<(), CallError> {
        self.require_active()?.toggle_video().await;
        Ok(())
    }

    /// Ends the live call without signaling the normal hangup path, e.g.
    /// when the application shuts down.
    pub async fn force_end(&self, reason: EndReason) {
        if let Some(handle) = self.active_call() {
            handle.force_end(reason).await;
        }
    }

    fn require_active(&self) -> Result<CallSessionHandle, CallError> {
        self.active_call()
            .ok_or_else(|| CallError::NotFound("no active call".to_string()))
    }

    async fn incoming_call(
        &self,
        call_id: &str,
        caller_id: &str,
        caller_name: Option<&str>,
        kind: CallKind,
    ) {
        if self.active_call().is_some() {
            // No busy signal on the wire; the server times the caller out.
            warn!(target: "Call", "Ignoring incoming call {call_id} while another call is live");
            return;
        }
        let call_id = CallId::new(call_id);
        let handle = match CallSession::start_incoming(
            self.deps.clone(),
            &self.self_user_id,
            call_id.clone(),
            caller_id,
            kind,
        ) {
            Ok(handle) => handle,
            Err(err) => {
                warn!(target: "Call", "Could not ring call {call_id}: {err}");
                return;
            }
        };
        *self.active.lock().unwrap() = Some(handle);
        info!(target: "Call", "Incoming {kind} call {call_id} from {caller_id}");
        let _ = self.deps.notifier.incoming_call.send(Arc::new(IncomingCall {
            call_id,
            caller_id: caller_id.to_string(),
            caller_name: caller_name.map(str::to_string),
            kind,
        }));
    }
}

#[async_trait]
impl MessageHandler for CallManager {
    async fn handle(&self, message: &WireMessage) -> Result<(), anyhow::Error> {
        if let WireMessage::IncomingCall {
            call_id,
            caller_id,
            caller_name,
            call_type,
            ..
        } = message
        {
            self.incoming_call(call_id, caller_id, caller_name.as_deref(), *call_type)
                .await;
            return Ok(());
        }

        match self.active_call() {
            Some(handle) => handle.signal(message.clone()).await,
            None => debug!(target: "Call", "No call to route {} to", message.tag()),
        }
        Ok(())
    }
}
