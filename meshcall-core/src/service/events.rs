use crate::models::ParticipantId;
use crate::service::media::RemoteStream;
use crate::service::peer::SessionState;

/// Notifications for the UI layer
#[derive(Debug, Clone)]
pub enum PeerEvent {
    SessionStateChanged {
        remote_id: ParticipantId,
        from: SessionState,
        to: SessionState,
    },
    /// A remote stream appeared or gained a track; render or refresh its tile
    RemoteStreamAdded {
        remote_id: ParticipantId,
        display_name: String,
        stream: RemoteStream,
    },
    RemoteStreamRemoved {
        remote_id: ParticipantId,
    },
}

impl PeerEvent {
    #[must_use]
    pub const fn remote_id(&self) -> &ParticipantId {
        match self {
            Self::SessionStateChanged { remote_id, .. }
            | Self::RemoteStreamAdded { remote_id, .. }
            | Self::RemoteStreamRemoved { remote_id } => remote_id,
        }
    }

    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::SessionStateChanged { .. } => "session_state_changed",
            Self::RemoteStreamAdded { .. } => "remote_stream_added",
            Self::RemoteStreamRemoved { .. } => "remote_stream_removed",
        }
    }
}
