//! Seam between the session manager and the media stack

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::trace;

use crate::models::{IceCandidate, ParticipantId, SessionDescription};
use crate::service::media::{LocalTrack, RemoteTrack};
use crate::Result;

/// Connectivity state reported by a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Something the transport noticed on its own
#[derive(Debug, Clone)]
pub enum TransportEvent {
    LocalCandidate(IceCandidate),
    RemoteTrack(RemoteTrack),
    StateChanged(TransportState),
}

/// A transport event tagged with the session it belongs to
#[derive(Debug, Clone)]
pub struct TransportNotice {
    pub remote_id: ParticipantId,
    /// Session generation; notices from a replaced transport are dropped
    pub epoch: u64,
    pub event: TransportEvent,
}

/// Handle given to a transport for reporting events
#[derive(Debug, Clone)]
pub struct TransportEvents {
    remote_id: ParticipantId,
    epoch: u64,
    sink: mpsc::UnboundedSender<TransportNotice>,
}

impl TransportEvents {
    #[must_use]
    pub const fn new(
        remote_id: ParticipantId,
        epoch: u64,
        sink: mpsc::UnboundedSender<TransportNotice>,
    ) -> Self {
        Self {
            remote_id,
            epoch,
            sink,
        }
    }

    #[must_use]
    pub const fn remote_id(&self) -> &ParticipantId {
        &self.remote_id
    }

    pub fn emit(&self, event: TransportEvent) {
        let notice = TransportNotice {
            remote_id: self.remote_id.clone(),
            epoch: self.epoch,
            event,
        };
        if self.sink.send(notice).is_err() {
            trace!(remote_id = %self.remote_id, "Transport event after session shutdown");
        }
    }
}

/// One media connection to one remote
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn add_track(&self, track: &LocalTrack) -> Result<()>;

    /// Detach every local track added so far
    async fn remove_tracks(&self) -> Result<()>;

    /// Create an offer and apply it as the local description
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Create an answer and apply it as the local description
    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    async fn create(
        &self,
        remote_id: &ParticipantId,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>>;
}
