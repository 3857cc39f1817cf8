use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::transport::PeerTransport;
use crate::models::{IceCandidate, ParticipantId};
use crate::service::media::RemoteStream;
use crate::{Error, Result};

/// Negotiation state of one peer session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    New,
    OfferSent,
    AnswerSent,
    Connected,
    Closed,
}

impl SessionState {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::OfferSent => "offer_sent",
            Self::AnswerSent => "answer_sent",
            Self::Connected => "connected",
            Self::Closed => "closed",
        }
    }

    /// Allowed transitions. Every live state may close, nothing leaves `Closed`.
    #[must_use]
    pub const fn can_transition_to(&self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::New, Self::OfferSent | Self::AnswerSent)
                | (Self::OfferSent | Self::AnswerSent, Self::Connected)
                | (
                    Self::New | Self::OfferSent | Self::AnswerSent | Self::Connected,
                    Self::Closed
                )
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which side of the exchange the local participant plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionRole {
    Offerer,
    Answerer,
}

pub(crate) struct PeerSession {
    pub remote_id: ParticipantId,
    pub remote_display_name: String,
    pub role: SessionRole,
    pub epoch: u64,
    pub state: SessionState,
    pub transport: Option<Arc<dyn PeerTransport>>,
    pub local_tracks_attached: bool,
    pub remote_description_set: bool,
    pub remote_stream: Option<RemoteStream>,
    /// Local candidates gathered before the offer/answer went out
    pub outbound_candidates: Vec<IceCandidate>,
    pub created_at: Instant,
    pub state_changed_at: Instant,
}

impl PeerSession {
    pub fn new(
        remote_id: ParticipantId,
        remote_display_name: String,
        role: SessionRole,
        epoch: u64,
    ) -> Self {
        let now = Instant::now();
        Self {
            remote_id,
            remote_display_name,
            role,
            epoch,
            state: SessionState::New,
            transport: None,
            local_tracks_attached: false,
            remote_description_set: false,
            remote_stream: None,
            outbound_candidates: Vec::new(),
            created_at: now,
            state_changed_at: now,
        }
    }

    /// Move to `next`, returning the previous state
    pub fn transition(&mut self, next: SessionState) -> Result<SessionState> {
        if !self.state.can_transition_to(next) {
            return Err(Error::Negotiation(format!(
                "invalid session transition {} -> {next}",
                self.state
            )));
        }
        let previous = self.state;
        self.state = next;
        self.state_changed_at = Instant::now();
        Ok(previous)
    }

    /// Still negotiating after `timeout`
    pub fn is_stalled(&self, timeout: Duration) -> bool {
        self.state != SessionState::Connected && self.state_changed_at.elapsed() >= timeout
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            remote_id: self.remote_id.clone(),
            remote_display_name: self.remote_display_name.clone(),
            role: self.role,
            state: self.state,
            local_tracks_attached: self.local_tracks_attached,
            remote_stream: self.remote_stream.clone(),
            age: self.created_at.elapsed(),
        }
    }
}

/// Read-only view of a peer session
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub remote_id: ParticipantId,
    pub remote_display_name: String,
    pub role: SessionRole,
    pub state: SessionState,
    pub local_tracks_attached: bool,
    pub remote_stream: Option<RemoteStream>,
    pub age: Duration,
}
