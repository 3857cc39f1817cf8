//! In-process transport pairing
//!
//! Every participant attached to the same [`LoopbackNetwork`] can reach
//! every other one. No media flows. A transport "connects" once it has
//! both descriptions and at least one remote candidate, and then reports
//! the tracks its counterpart attached.

use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::media::{LocalTrack, RemoteTrack};
use super::peer::{
    PeerTransport, PeerTransportFactory, TransportEvent, TransportEvents, TransportState,
};
use crate::models::{IceCandidate, ParticipantId, SdpType, SessionDescription};
use crate::{Error, Result};

type LinkKey = (ParticipantId, ParticipantId);

#[derive(Default)]
struct Link {
    /// Tracks the owner published, as the counterpart will see them
    tracks: Mutex<Vec<RemoteTrack>>,
}

#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    links: Arc<DashMap<LinkKey, Arc<Link>>>,
    sessions: Arc<AtomicU64>,
    ports: Arc<AtomicU16>,
}

impl LoopbackNetwork {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport factory for one participant
    #[must_use]
    pub fn factory(&self, local_id: ParticipantId) -> LoopbackTransportFactory {
        LoopbackTransportFactory {
            network: self.clone(),
            local_id,
        }
    }

    /// Open transports across all participants
    #[must_use]
    pub fn open_links(&self) -> usize {
        self.links.len()
    }

    fn counterpart_tracks(&self, local_id: &ParticipantId, remote_id: &ParticipantId) -> Vec<RemoteTrack> {
        self.links
            .get(&(remote_id.clone(), local_id.clone()))
            .map(|link| link.tracks.lock().clone())
            .unwrap_or_default()
    }

    fn next_port(&self) -> u16 {
        40000 + self.ports.fetch_add(1, Ordering::Relaxed) % 20000
    }
}

pub struct LoopbackTransportFactory {
    network: LoopbackNetwork,
    local_id: ParticipantId,
}

#[async_trait]
impl PeerTransportFactory for LoopbackTransportFactory {
    async fn create(
        &self,
        remote_id: &ParticipantId,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerTransport>> {
        let link = Arc::new(Link::default());
        self.network
            .links
            .insert((self.local_id.clone(), remote_id.clone()), link.clone());

        debug!(local_id = %self.local_id, remote_id = %remote_id, "Loopback transport created");
        Ok(Arc::new(LoopbackTransport {
            network: self.network.clone(),
            local_id: self.local_id.clone(),
            remote_id: remote_id.clone(),
            link,
            events,
            state: Mutex::new(LinkState::default()),
        }))
    }
}

#[derive(Default)]
struct LinkState {
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    remote_candidates: usize,
    connected: bool,
    closed: bool,
}

struct LoopbackTransport {
    network: LoopbackNetwork,
    local_id: ParticipantId,
    remote_id: ParticipantId,
    link: Arc<Link>,
    events: TransportEvents,
    state: Mutex<LinkState>,
}

impl LoopbackTransport {
    fn ensure_open(&self) -> Result<()> {
        if self.state.lock().closed {
            return Err(Error::Negotiation("transport is closed".to_string()));
        }
        Ok(())
    }

    fn describe(&self, sdp_type: SdpType) -> SessionDescription {
        let session = self.network.sessions.fetch_add(1, Ordering::Relaxed) + 1;
        let mut sdp = format!(
            "v=0\r\no=- {session} 1 IN IP4 127.0.0.1\r\ns=meshcall-loopback\r\nt=0 0\r\na=x-owner:{}\r\n",
            self.local_id
        );
        for track in self.link.tracks.lock().iter() {
            sdp.push_str(&format!("m={} 9 UDP/TLS/RTP/SAVPF 0\r\na=msid:{} {}\r\n", track.kind, track.stream_id, track.id));
        }
        match sdp_type {
            SdpType::Offer => SessionDescription::offer(sdp),
            SdpType::Answer => SessionDescription::answer(sdp),
        }
    }

    fn gather_candidate(&self) {
        let candidate = IceCandidate {
            candidate: format!(
                "candidate:1 1 udp 2130706431 127.0.0.1 {} typ host",
                self.network.next_port()
            ),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        self.events.emit(TransportEvent::LocalCandidate(candidate));
    }

    fn maybe_connect(&self) {
        {
            let mut state = self.state.lock();
            let ready = !state.connected
                && !state.closed
                && state.local.is_some()
                && state.remote.is_some()
                && state.remote_candidates > 0;
            if !ready {
                return;
            }
            state.connected = true;
        }

        trace!(local_id = %self.local_id, remote_id = %self.remote_id, "Loopback transport connected");
        self.events
            .emit(TransportEvent::StateChanged(TransportState::Connected));
        for track in self.network.counterpart_tracks(&self.local_id, &self.remote_id) {
            self.events.emit(TransportEvent::RemoteTrack(track));
        }
    }
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn add_track(&self, track: &LocalTrack) -> Result<()> {
        self.ensure_open()?;
        let stream_id = format!("{}-stream", self.local_id);
        self.link.tracks.lock().push(RemoteTrack {
            id: track.id.clone(),
            kind: track.kind,
            stream_id,
            rtp: None,
        });
        Ok(())
    }

    async fn remove_tracks(&self) -> Result<()> {
        self.link.tracks.lock().clear();
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        self.ensure_open()?;
        let offer = self.describe(SdpType::Offer);
        self.state.lock().local = Some(offer.clone());
        self.events
            .emit(TransportEvent::StateChanged(TransportState::Connecting));
        self.gather_candidate();
        self.maybe_connect();
        Ok(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.ensure_open()?;
        let has_offer = self
            .state
            .lock()
            .remote
            .as_ref()
            .is_some_and(|d| d.sdp_type == SdpType::Offer);
        if !has_offer {
            return Err(Error::Negotiation(
                "cannot answer without a remote offer".to_string(),
            ));
        }

        let answer = self.describe(SdpType::Answer);
        self.state.lock().local = Some(answer.clone());
        self.events
            .emit(TransportEvent::StateChanged(TransportState::Connecting));
        self.gather_candidate();
        self.maybe_connect();
        Ok(answer)
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.ensure_open()?;
        if !description.sdp.starts_with("v=0") {
            return Err(Error::Negotiation("malformed session description".to_string()));
        }

        {
            let mut state = self.state.lock();
            let expected = if state.local.is_some() {
                SdpType::Answer
            } else {
                SdpType::Offer
            };
            if description.sdp_type != expected || state.remote.is_some() {
                return Err(Error::Negotiation(format!(
                    "unexpected remote {} description",
                    description.sdp_type.as_str()
                )));
            }
            state.remote = Some(description);
        }

        self.maybe_connect();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.ensure_open()?;
        if !candidate.candidate.starts_with("candidate:") {
            return Err(Error::Negotiation(format!(
                "malformed ICE candidate: {}",
                candidate.candidate
            )));
        }

        {
            let mut state = self.state.lock();
            if state.remote.is_none() {
                return Err(Error::Negotiation(
                    "remote description not set".to_string(),
                ));
            }
            state.remote_candidates += 1;
        }

        self.maybe_connect();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
        }

        let key = (self.local_id.clone(), self.remote_id.clone());
        self.network
            .links
            .remove_if(&key, |_, link| Arc::ptr_eq(link, &self.link));
        self.events
            .emit(TransportEvent::StateChanged(TransportState::Closed));
        debug!(local_id = %self.local_id, remote_id = %self.remote_id, "Loopback transport closed");
        Ok(())
    }
}
