//! Collaborator seam for the media runtime.
//!
//! The core never touches real devices or a WebRTC stack; it drives these
//! traits and treats descriptions, candidates and stream handles as opaque
//! payloads to relay or hand to the rendering layer.

use super::error::{MediaError, NegotiationError};
use crate::wire::CallKind;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A proposed media/transport configuration (offer or answer).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub sdp: String,
}

impl SessionDescription {
    pub fn new(sdp: impl Into<String>) -> Self {
        Self { sdp: sdp.into() }
    }
}

/// A single proposed network path for direct connectivity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
        }
    }
}

/// Opaque reference to a remote media stream, for the rendering layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaHandle(pub String);

/// Exclusive handle to the local capture devices. Owned by at most one call
/// at a time; must be released before the next acquisition.
pub trait LocalMedia: Send + Sync {
    fn set_audio_enabled(&self, enabled: bool);
    fn set_video_enabled(&self, enabled: bool);
    fn release(&self);
}

/// One peer-to-peer media connection under negotiation.
#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;
    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;
    /// Whether the underlying transport reached its connected state.
    async fn is_connected(&self) -> bool;
    async fn remote_media(&self) -> Option<MediaHandle>;
    async fn close(&self);
}

/// Entry point into the media runtime.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Suspends on device-permission grant.
    async fn acquire_local_media(&self, kind: CallKind)
    -> Result<Arc<dyn LocalMedia>, MediaError>;

    /// Creates a fresh peer connection for one remote participant. The ICE
    /// server list is passed through opaquely.
    async fn create_peer_connection(
        &self,
        participant_id: &str,
        ice_servers: &[String],
    ) -> Result<Arc<dyn PeerConnection>, NegotiationError>;
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use tokio::sync::Notify;

    /// Tracks acquisition/release so tests can assert the
    /// release-before-acquire discipline.
    #[derive(Default)]
    pub struct MockLocalMedia {
        pub audio_enabled: AtomicBool,
        pub video_enabled: AtomicBool,
        pub released: AtomicBool,
    }

    impl LocalMedia for MockLocalMedia {
        fn set_audio_enabled(&self, enabled: bool) {
            self.audio_enabled.store(enabled, Ordering::SeqCst);
        }

        fn set_video_enabled(&self, enabled: bool) {
            self.video_enabled.store(enabled, Ordering::SeqCst);
        }

        fn release(&self) {
            self.released.store(true, Ordering::SeqCst);
        }
    }

    /// Scripted peer connection. `connect_after_candidate` makes
    /// `is_connected` flip once a remote description has been applied and at
    /// least one candidate added, which is enough to drive the session's
    /// connected-check deterministically.
    pub struct MockPeerConnection {
        pub participant_id: String,
        pub remote_description: Mutex<Option<SessionDescription>>,
        pub applied_candidates: Mutex<Vec<IceCandidate>>,
        pub closed: AtomicBool,
        pub connect_after_candidate: bool,
        /// When set, `create_answer` waits on this gate before resolving,
        /// letting tests race a hangup against an in-flight answer.
        pub answer_gate: Option<Arc<Notify>>,
        pub fail_offer: bool,
    }

    impl MockPeerConnection {
        pub fn new(participant_id: &str) -> Self {
            Self {
                participant_id: participant_id.to_string(),
                remote_description: Mutex::new(None),
                applied_candidates: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                connect_after_candidate: true,
                answer_gate: None,
                fail_offer: false,
            }
        }

        pub fn applied(&self) -> Vec<String> {
            self.applied_candidates
                .lock()
                .unwrap()
                .iter()
                .map(|c| c.candidate.clone())
                .collect()
        }
    }

    #[async_trait]
    impl PeerConnection for MockPeerConnection {
        async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
            if self.fail_offer {
                return Err(NegotiationError::BadDescription("scripted failure".into()));
            }
            Ok(SessionDescription::new(format!(
                "offer-for-{}",
                self.participant_id
            )))
        }

        async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
            if let Some(gate) = &self.answer_gate {
                gate.notified().await;
            }
            Ok(SessionDescription::new(format!(
                "answer-for-{}",
                self.participant_id
            )))
        }

        async fn set_remote_description(
            &self,
            description: SessionDescription,
        ) -> Result<(), NegotiationError> {
            *self.remote_description.lock().unwrap() = Some(description);
            Ok(())
        }

        async fn add_ice_candidate(
            &self,
            candidate: IceCandidate,
        ) -> Result<(), NegotiationError> {
            if self.remote_description.lock().unwrap().is_none() {
                return Err(NegotiationError::Ice(
                    "candidate before remote description".into(),
                ));
            }
            self.applied_candidates.lock().unwrap().push(candidate);
            Ok(())
        }

        async fn is_connected(&self) -> bool {
            self.connect_after_candidate
                && self.remote_description.lock().unwrap().is_some()
                && !self.applied_candidates.lock().unwrap().is_empty()
        }

        async fn remote_media(&self) -> Option<MediaHandle> {
            Some(MediaHandle(format!("stream-{}", self.participant_id)))
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    pub struct MockMediaEngine {
        pub acquisitions: AtomicU32,
        pub deny_media: AtomicBool,
        pub current_media: Mutex<Option<Arc<MockLocalMedia>>>,
        pub peers: Mutex<Vec<Arc<MockPeerConnection>>>,
        pub answer_gate: Mutex<Option<Arc<Notify>>>,
        /// When set, `acquire_local_media` waits on this gate before
        /// resolving, standing in for a permission prompt nobody answers.
        pub acquire_gate: Mutex<Option<Arc<Notify>>>,
        /// Participants whose offer creation is scripted to fail.
        pub fail_offers: Mutex<Vec<String>>,
    }

    impl MockMediaEngine {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn peer_for(&self, participant_id: &str) -> Option<Arc<MockPeerConnection>> {
            self.peers
                .lock()
                .unwrap()
                .iter()
                .find(|p| p.participant_id == participant_id)
                .cloned()
        }
    }

    #[async_trait]
    impl MediaEngine for MockMediaEngine {
        async fn acquire_local_media(
            &self,
            _kind: CallKind,
        ) -> Result<Arc<dyn LocalMedia>, MediaError> {
            let gate = self.acquire_gate.lock().unwrap().clone();
            if let Some(gate) = gate {
                gate.notified().await;
            }
            if self.deny_media.load(Ordering::SeqCst) {
                return Err(MediaError::PermissionDenied);
            }
            if let Some(previous) = self.current_media.lock().unwrap().as_ref()
                && !previous.released.load(Ordering::SeqCst)
            {
                // The runtime media API is not re-entrant; this is the bug
                // the release-before-acquire discipline exists to prevent.
                return Err(MediaError::Unavailable("device already in use".into()));
            }
            self.acquisitions.fetch_add(1, Ordering::SeqCst);
            let media = Arc::new(MockLocalMedia::default());
            *self.current_media.lock().unwrap() = Some(media.clone());
            Ok(media)
        }

        async fn create_peer_connection(
            &self,
            participant_id: &str,
            _ice_servers: &[String],
        ) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
            let mut peer = MockPeerConnection::new(participant_id);
            peer.answer_gate = self.answer_gate.lock().unwrap().clone();
            peer.fail_offer = self
                .fail_offers
                .lock()
                .unwrap()
                .iter()
                .any(|p| p == participant_id);
            let peer = Arc::new(peer);
            self.peers.lock().unwrap().push(peer.clone());
            Ok(peer)
        }
    }
}
