//! Per-participant negotiation tracking.

use super::error::NegotiationError;
use super::media::{IceCandidate, MediaHandle, PeerConnection, SessionDescription};
use std::sync::Arc;

/// Negotiation progress with one remote participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    New,
    OfferSent,
    OfferReceived,
    AnswerSent,
    AnswerReceived,
    Connected,
    Failed,
    Closed,
}

impl std::fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::New => "new",
            Self::OfferSent => "offer_sent",
            Self::OfferReceived => "offer_received",
            Self::AnswerSent => "answer_sent",
            Self::AnswerReceived => "answer_received",
            Self::Connected => "connected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// One leg of the call mesh. Candidates that arrive before the remote
/// description are buffered and replayed in arrival order once it lands;
/// handing them to the connection early is a hard runtime error.
pub struct PeerLink {
    pub participant_id: String,
    state: NegotiationState,
    conn: Option<Arc<dyn PeerConnection>>,
    pending_candidates: Vec<IceCandidate>,
    remote_description_set: bool,
    remote_media: Option<MediaHandle>,
}

impl PeerLink {
    pub fn new(participant_id: &str, conn: Arc<dyn PeerConnection>) -> Self {
        Self {
            participant_id: participant_id.to_string(),
            state: NegotiationState::New,
            conn: Some(conn),
            pending_candidates: Vec::new(),
            remote_description_set: false,
            remote_media: None,
        }
    }

    pub fn state(&self) -> NegotiationState {
        self.state
    }

    pub fn connection(&self) -> Option<Arc<dyn PeerConnection>> {
        self.conn.clone()
    }

    pub fn remote_media(&self) -> Option<&MediaHandle> {
        self.remote_media.as_ref()
    }

    fn invalid(&self, attempted: &str) -> NegotiationError {
        NegotiationError::InvalidState(format!(
            "{} in state {} for {}",
            attempted, self.state, self.participant_id
        ))
    }

    fn conn_or_closed(&self) -> Result<Arc<dyn PeerConnection>, NegotiationError> {
        self.conn.clone().ok_or(NegotiationError::Cancelled)
    }

    pub fn mark_offer_sent(&mut self) -> Result<(), NegotiationError> {
        match self.state {
            NegotiationState::New => {
                self.state = NegotiationState::OfferSent;
                Ok(())
            }
            _ => Err(self.invalid("offer send")),
        }
    }

    /// Applies a remote offer, then drains any buffered candidates.
    pub async fn apply_remote_offer(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        match self.state {
            // An offer while ours is outstanding means both sides offered;
            // the remote one wins and we answer it.
            NegotiationState::New | NegotiationState::OfferSent => {}
            _ => return Err(self.invalid("remote offer")),
        }
        let conn = self.conn_or_closed()?;
        conn.set_remote_description(description).await?;
        self.remote_description_set = true;
        self.state = NegotiationState::OfferReceived;
        self.flush_candidates(&conn).await
    }

    pub fn mark_answer_sent(&mut self) -> Result<(), NegotiationError> {
        match self.state {
            NegotiationState::OfferReceived => {
                self.state = NegotiationState::AnswerSent;
                Ok(())
            }
            _ => Err(self.invalid("answer send")),
        }
    }

    pub async fn apply_remote_answer(
        &mut self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        match self.state {
            NegotiationState::OfferSent => {}
            _ => return Err(self.invalid("remote answer")),
        }
        let conn = self.conn_or_closed()?;
        conn.set_remote_description(description).await?;
        self.remote_description_set = true;
        self.state = NegotiationState::AnswerReceived;
        self.flush_candidates(&conn).await
    }

    /// Buffers until the remote description is in place, then applies
    /// directly.
    pub async fn add_remote_candidate(
        &mut self,
        candidate: IceCandidate,
    ) -> Result<(), NegotiationError> {
        match self.state {
            NegotiationState::Failed | NegotiationState::Closed => {
                return Err(self.invalid("ice candidate"));
            }
            _ => {}
        }
        if !self.remote_description_set {
            self.pending_candidates.push(candidate);
            return Ok(());
        }
        let conn = self.conn_or_closed()?;
        conn.add_ice_candidate(candidate).await
    }

    async fn flush_candidates(
        &mut self,
        conn: &Arc<dyn PeerConnection>,
    ) -> Result<(), NegotiationError> {
        for candidate in self.pending_candidates.drain(..) {
            conn.add_ice_candidate(candidate).await?;
        }
        Ok(())
    }

    pub async fn mark_connected(&mut self) -> Result<(), NegotiationError> {
        match self.state {
            NegotiationState::AnswerSent | NegotiationState::AnswerReceived => {}
            NegotiationState::Connected => return Ok(()),
            _ => return Err(self.invalid("connect")),
        }
        let conn = self.conn_or_closed()?;
        self.remote_media = conn.remote_media().await;
        self.state = NegotiationState::Connected;
        Ok(())
    }

    pub fn mark_failed(&mut self) {
        if self.state != NegotiationState::Closed {
            self.state = NegotiationState::Failed;
        }
    }

    pub async fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            conn.close().await;
        }
        self.pending_candidates.clear();
        self.state = NegotiationState::Closed;
    }
}
