//! Test helpers and fixtures for meshcall-core tests
//!
//! Scripted collaborators that record what the session layer asked of
//! them, plus envelope builders.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};

use crate::config::SessionConfig;
use crate::models::{
    IceCandidate, LocalParticipant, ParticipantId, SdpType, SessionDescription, Signal,
    SignalingEnvelope,
};
use crate::service::media::{
    LocalMediaSource, LocalTrack, MediaStreamHandle, RemoteTrack, TrackKind,
};
use crate::service::peer::{
    PeerSessionManager, PeerTransport, PeerTransportFactory, TransportEvent, TransportEvents,
    TransportNotice, TransportState,
};
use crate::service::{PeerEvent, SignalingTransport};
use crate::{Error, Result};

/// Create a test participant ID
pub fn test_participant_id(id: &str) -> ParticipantId {
    ParticipantId::from(id)
}

fn envelope(from: &str, to: &str, signal: Signal) -> SignalingEnvelope {
    SignalingEnvelope::new(
        test_participant_id(from),
        test_participant_id(to),
        from,
        signal,
    )
}

pub fn offer_from(from: &str, to: &str) -> SignalingEnvelope {
    envelope(
        from,
        to,
        Signal::Offer(SessionDescription::offer(format!("v=0\r\no=- 1 1 IN IP4 {from}\r\n"))),
    )
}

pub fn answer_from(from: &str, to: &str) -> SignalingEnvelope {
    envelope(
        from,
        to,
        Signal::Answer(SessionDescription::answer(format!("v=0\r\no=- 2 1 IN IP4 {from}\r\n"))),
    )
}

pub fn ice_from(from: &str, to: &str, port: u16) -> SignalingEnvelope {
    let mut candidate =
        IceCandidate::new(format!("candidate:1 1 udp 2130706431 10.0.0.1 {port} typ host"));
    candidate.sdp_mid = Some("0".to_string());
    candidate.sdp_mline_index = Some(0);
    envelope(from, to, Signal::IceCandidate(candidate))
}

pub fn test_stream() -> MediaStreamHandle {
    MediaStreamHandle::new(
        "test-stream".to_string(),
        vec![
            LocalTrack::new(TrackKind::Audio, "test-stream"),
            LocalTrack::new(TrackKind::Video, "test-stream"),
        ],
    )
}

pub fn drain_events(rx: &mut mpsc::UnboundedReceiver<PeerEvent>) -> Vec<PeerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// A manager wired to recording collaborators
pub struct ManagerFixture {
    pub manager: Arc<PeerSessionManager>,
    pub transport_events: mpsc::UnboundedReceiver<TransportNotice>,
    pub ui: mpsc::UnboundedReceiver<PeerEvent>,
}

pub fn manager_with(
    local: &str,
    signaling: Arc<dyn SignalingTransport>,
    factory: Arc<RecordingTransportFactory>,
    config: SessionConfig,
) -> ManagerFixture {
    let (transport_tx, transport_events) = mpsc::unbounded_channel();
    let (ui_tx, ui) = mpsc::unbounded_channel();
    let manager = PeerSessionManager::new(
        LocalParticipant::new(local, local),
        config,
        signaling,
        factory,
        Some(test_stream()),
        transport_tx,
        ui_tx,
    );
    ManagerFixture {
        manager: Arc::new(manager),
        transport_events,
        ui,
    }
}

/// Media source that either hands out a test stream or refuses
pub struct FakeMediaSource {
    deny: bool,
    released: AtomicUsize,
}

impl FakeMediaSource {
    pub fn new() -> Self {
        Self {
            deny: false,
            released: AtomicUsize::new(0),
        }
    }

    pub fn denying() -> Self {
        Self {
            deny: true,
            released: AtomicUsize::new(0),
        }
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LocalMediaSource for FakeMediaSource {
    async fn acquire(&self) -> Result<MediaStreamHandle> {
        if self.deny {
            return Err(Error::MediaAccessDenied("permission dismissed".to_string()));
        }
        Ok(test_stream())
    }

    async fn release(&self, stream: &MediaStreamHandle) {
        stream.stop();
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

/// Transport that records calls and validates input the way a real
/// peer connection would reject garbage
pub struct RecordingTransport {
    events: TransportEvents,
    tracks: AtomicUsize,
    candidates: Mutex<Vec<IceCandidate>>,
    remote_descriptions: Mutex<Vec<SessionDescription>>,
    closed: AtomicBool,
}

impl RecordingTransport {
    fn new(events: TransportEvents) -> Self {
        Self {
            events,
            tracks: AtomicUsize::new(0),
            candidates: Mutex::new(Vec::new()),
            remote_descriptions: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn track_count(&self) -> usize {
        self.tracks.load(Ordering::SeqCst)
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().clone()
    }

    pub fn remote_descriptions(&self) -> usize {
        self.remote_descriptions.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn emit_state(&self, state: TransportState) {
        self.events.emit(TransportEvent::StateChanged(state));
    }

    pub fn emit_remote_track(&self, stream_id: &str) {
        self.events.emit(TransportEvent::RemoteTrack(RemoteTrack {
            id: format!("{stream_id}-audio"),
            kind: TrackKind::Audio,
            stream_id: stream_id.to_string(),
            rtp: None,
        }));
    }

    fn local_description(&self, sdp_type: SdpType) -> SessionDescription {
        self.events.emit(TransportEvent::LocalCandidate(IceCandidate::new(
            "candidate:1 1 udp 2130706431 192.168.0.2 7000 typ host",
        )));
        let sdp = format!("v=0\r\ns=recorded-{}\r\n", sdp_type.as_str());
        match sdp_type {
            SdpType::Offer => SessionDescription::offer(sdp),
            SdpType::Answer => SessionDescription::answer(sdp),
        }
    }
}

#[async_trait]
impl PeerTransport for RecordingTransport {
    async fn add_track(&self, _track: &LocalTrack) -> Result<()> {
        self.tracks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn remove_tracks(&self) -> Result<()> {
        self.tracks.store(0, Ordering::SeqCst);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        Ok(self.local_description(SdpType::Offer))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        Ok(self.local_description(SdpType::Answer))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        if !description.sdp.starts_with("v=0") {
            return Err(Error::Negotiation("malformed session description".to_string()));
        }
        self.remote_descriptions.lock().push(description);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if !candidate.candidate.starts_with("candidate:") {
            return Err(Error::Negotiation("malformed ICE candidate".to_string()));
        }
        self.candidates.lock().push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out [`RecordingTransport`]s and keeps the latest one per remote
///
/// A gated factory parks every `create` call until [`Self::open_gate`].
pub struct RecordingTransportFactory {
    transports: Mutex<HashMap<ParticipantId, Arc<RecordingTransport>>>,
    created: AtomicUsize,
    gate: Option<(Arc<Notify>, Arc<Notify>)>,
}

impl RecordingTransportFactory {
    pub fn new() -> Self {
        Self {
            transports: Mutex::new(HashMap::new()),
            created: AtomicUsize::new(0),
            gate: None,
        }
    }

    pub fn gated() -> Self {
        Self {
            gate: Some((Arc::new(Notify::new()), Arc::new(Notify::new()))),
            ..Self::new()
        }
    }

    pub async fn wait_entered(&self) {
        if let Some((entered, _)) = &self.gate {
            entered.notified().await;
        }
    }

    pub fn open_gate(&self) {
        if let Some((_, gate)) = &self.gate {
            gate.notify_one();
        }
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn transport(&self, remote_id: &ParticipantId) -> Option<Arc<RecordingTransport>> {
        self.transports.lock().get(remote_id).cloned()
    }
}

#[async_trait]
impl PeerTransportFactory for RecordingTransportFactory {
    async fn create(
        &self,
        remote_id: &ParticipantId,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>> {
        let transport = Arc::new(RecordingTransport::new(events));
        self.transports
            .lock()
            .insert(remote_id.clone(), transport.clone());
        self.created.fetch_add(1, Ordering::SeqCst);

        if let Some((entered, gate)) = &self.gate {
            entered.notify_one();
            gate.notified().await;
        }
        Ok(transport)
    }
}
