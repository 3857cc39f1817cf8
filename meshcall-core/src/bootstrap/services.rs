//! Collaborator construction and injection

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::info;

use crate::models::ParticipantId;
use crate::service::loopback::LoopbackNetwork;
use crate::service::{
    PeerEvent, PeerTransportFactory, RoomController, RoomDirectory, RoomServices,
    SignalingTransport, SyntheticMediaSource, WebRtcTransportFactory,
};
use crate::Config;

/// Which media transport a participant uses
#[derive(Clone)]
pub enum TransportKind {
    /// Real peer connections through webrtc-rs
    WebRtc,
    /// In-process pairing, no network
    Loopback(LoopbackNetwork),
}

impl TransportKind {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::WebRtc => "webrtc",
            Self::Loopback(_) => "loopback",
        }
    }

    fn factory(&self, config: &Config, local_id: &ParticipantId) -> Arc<dyn PeerTransportFactory> {
        match self {
            Self::WebRtc => Arc::new(WebRtcTransportFactory::new(&config.webrtc)),
            Self::Loopback(network) => Arc::new(network.factory(local_id.clone())),
        }
    }
}

/// Build a room controller for one participant
///
/// Returns the controller and the receiver for its UI events.
pub fn init_controller(
    config: &Config,
    local_id: &ParticipantId,
    directory: Arc<dyn RoomDirectory>,
    signaling: Arc<dyn SignalingTransport>,
    transport: &TransportKind,
) -> (RoomController, mpsc::UnboundedReceiver<PeerEvent>) {
    let services = RoomServices {
        directory,
        signaling,
        media: Arc::new(SyntheticMediaSource::new(config.media.clone())),
        transports: transport.factory(config, local_id),
    };

    let (ui_tx, ui_rx) = mpsc::unbounded_channel();
    let controller = RoomController::new(services, config.session.clone(), ui_tx);

    info!(
        participant_id = %local_id,
        transport = transport.name(),
        negotiation_timeout_secs = config.session.negotiation_timeout_seconds,
        "Room controller initialized"
    );
    (controller, ui_rx)
}
