//! Peer transport backed by a webrtc-rs `RTCPeerConnection`

use std::sync::Arc;

use async_trait::async_trait;
use ::webrtc::api::interceptor_registry::register_default_interceptors;
use ::webrtc::api::media_engine::MediaEngine;
use ::webrtc::api::{APIBuilder, API};
use ::webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use ::webrtc::ice_transport::ice_server::RTCIceServer;
use ::webrtc::interceptor::registry::Registry;
use ::webrtc::peer_connection::configuration::RTCConfiguration;
use ::webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use ::webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use ::webrtc::peer_connection::RTCPeerConnection;
use ::webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use ::webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use ::webrtc::rtp_transceiver::RTCRtpTransceiver;
use ::webrtc::track::track_local::TrackLocal;
use ::webrtc::track::track_remote::TrackRemote;
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

use crate::config::WebRTCConfig;
use crate::models::{IceCandidate, ParticipantId, SdpType, SessionDescription};
use crate::service::media::{LocalTrack, RemoteTrack};
use crate::service::peer::{
    PeerTransport, PeerTransportFactory, TransportEvent, TransportEvents, TransportState,
};
use crate::{Error, Result};

impl From<RTCPeerConnectionState> for TransportState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connecting => Self::Connecting,
            RTCPeerConnectionState::Connected => Self::Connected,
            RTCPeerConnectionState::Disconnected => Self::Disconnected,
            RTCPeerConnectionState::Failed => Self::Failed,
            RTCPeerConnectionState::Closed => Self::Closed,
            _ => Self::New,
        }
    }
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(candidate: IceCandidate) -> Self {
        Self {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        }
    }
}

/// ICE configuration shared by every peer connection
fn rtc_configuration(config: &WebRTCConfig) -> RTCConfiguration {
    let mut ice_servers = Vec::new();
    if !config.stun_servers.is_empty() {
        ice_servers.push(RTCIceServer {
            urls: config.stun_servers.clone(),
            ..Default::default()
        });
    }
    if let Some(turn) = &config.turn {
        ice_servers.push(RTCIceServer {
            urls: vec![turn.url.clone()],
            username: turn.username.clone(),
            credential: turn.credential.clone(),
            ..Default::default()
        });
    }

    RTCConfiguration {
        ice_servers,
        ice_candidate_pool_size: config.ice_candidate_pool_size,
        ..Default::default()
    }
}

/// Builds one `RTCPeerConnection` per remote participant
pub struct WebRtcTransportFactory {
    rtc_config: RTCConfiguration,
}

impl WebRtcTransportFactory {
    #[must_use]
    pub fn new(config: &WebRTCConfig) -> Self {
        Self {
            rtc_config: rtc_configuration(config),
        }
    }

    // API is not Clone and owns its media engine, so each connection gets its own
    fn build_api() -> Result<API> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        Ok(APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build())
    }
}

#[async_trait]
impl PeerTransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        remote_id: &ParticipantId,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>> {
        let api = Self::build_api()?;
        let pc = Arc::new(api.new_peer_connection(self.rtc_config.clone()).await?);

        let candidate_events = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            if let Some(candidate) = candidate {
                match candidate.to_json() {
                    Ok(init) => candidate_events.emit(TransportEvent::LocalCandidate(init.into())),
                    Err(e) => warn!(error = %e, "Failed to serialize local ICE candidate"),
                }
            }
            Box::pin(async {})
        }));

        let track_events = events.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                track_events.emit(TransportEvent::RemoteTrack(RemoteTrack::from_rtp(track)));
                Box::pin(async {})
            },
        ));

        let state_events = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            debug!(
                remote_id = %state_events.remote_id(),
                state = %state,
                "Peer connection state changed"
            );
            state_events.emit(TransportEvent::StateChanged(state.into()));
            Box::pin(async {})
        }));

        info!(remote_id = %remote_id, "Peer connection created");
        Ok(Arc::new(WebRtcPeerTransport {
            remote_id: remote_id.clone(),
            pc,
            senders: Mutex::new(Vec::new()),
        }))
    }
}

pub struct WebRtcPeerTransport {
    remote_id: ParticipantId,
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<Vec<Arc<RTCRtpSender>>>,
}

fn negotiation(e: ::webrtc::Error) -> Error {
    Error::Negotiation(e.to_string())
}

#[async_trait]
impl PeerTransport for WebRtcPeerTransport {
    async fn add_track(&self, track: &LocalTrack) -> Result<()> {
        let rtc_track: Arc<dyn TrackLocal + Send + Sync> = track.rtc();
        let sender = self.pc.add_track(rtc_track).await?;

        // RTCP has to be drained for the interceptors to work
        let rtcp_sender = sender.clone();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp_sender.read(&mut buf).await.is_ok() {}
        });

        self.senders.lock().await.push(sender);
        trace!(remote_id = %self.remote_id, track_id = %track.id, "Local track attached");
        Ok(())
    }

    async fn remove_tracks(&self) -> Result<()> {
        let senders: Vec<_> = self.senders.lock().await.drain(..).collect();
        for sender in senders {
            if let Err(e) = self.pc.remove_track(&sender).await {
                debug!(remote_id = %self.remote_id, error = %e, "Failed to remove track");
            }
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await.map_err(negotiation)?;
        let sdp = offer.sdp.clone();
        self.pc
            .set_local_description(offer)
            .await
            .map_err(negotiation)?;
        Ok(SessionDescription::offer(sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await.map_err(negotiation)?;
        let sdp = answer.sdp.clone();
        self.pc
            .set_local_description(answer)
            .await
            .map_err(negotiation)?;
        Ok(SessionDescription::answer(sdp))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let remote = match description.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(description.sdp),
            SdpType::Answer => RTCSessionDescription::answer(description.sdp),
        }
        .map_err(negotiation)?;

        self.pc
            .set_remote_description(remote)
            .await
            .map_err(negotiation)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(candidate.into())
            .await
            .map_err(negotiation)
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        debug!(remote_id = %self.remote_id, "Peer connection closed");
        Ok(())
    }
}
