//! Peer session manager
//!
//! Owns one [`PeerSession`] per remote participant and drives the
//! offer/answer/candidate exchange for it.
//!
//! The session table is guarded by a synchronous lock that is never held
//! across an await. Every async step re-checks the session's epoch when it
//! resumes: if the session was torn down (or replaced) in the meantime,
//! the late result is discarded and any transport it produced is closed.
//! Teardown leaves a tombstone so that envelopes still in flight for the
//! remote cannot recreate the session. Only [`PeerSessionManager::initiate`]
//! and [`PeerSessionManager::reopen`] clear it.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use super::session::{PeerSession, SessionRole, SessionSnapshot, SessionState};
use super::transport::{
    PeerTransport, PeerTransportFactory, TransportEvent, TransportEvents, TransportNotice,
    TransportState,
};
use crate::config::SessionConfig;
use crate::models::{
    IceCandidate, LocalParticipant, ParticipantId, SessionDescription, Signal, SignalingEnvelope,
};
use crate::service::events::PeerEvent;
use crate::service::media::{MediaStreamHandle, RemoteStream};
use crate::service::signaling::SignalingTransport;
use crate::{Error, Result};

/// What happened to an inbound envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeOutcome {
    /// Applied to a session
    Applied,
    /// Held until the session can take it
    Buffered,
    /// Duplicate, out of order, misaddressed or for a closed session
    Ignored,
    /// Rejected by the transport and discarded
    Dropped,
}

/// Torn-down remotes remembered at most; the oldest is forgotten first
const MAX_TOMBSTONES: usize = 256;

#[derive(Default)]
struct SessionTable {
    sessions: HashMap<ParticipantId, PeerSession>,
    /// Remote candidates that arrived before the remote description, oldest remote first
    pending_candidates: IndexMap<ParticipantId, VecDeque<IceCandidate>>,
    /// Tombstones, oldest first
    closed: IndexSet<ParticipantId>,
}

impl SessionTable {
    fn bury(&mut self, remote_id: &ParticipantId) {
        self.closed.shift_remove(remote_id);
        self.closed.insert(remote_id.clone());
        while self.closed.len() > MAX_TOMBSTONES {
            self.closed.shift_remove_index(0);
        }
    }
}

pub struct PeerSessionManager {
    local: LocalParticipant,
    config: SessionConfig,
    signaling: Arc<dyn SignalingTransport>,
    transports: Arc<dyn PeerTransportFactory>,
    media: Option<MediaStreamHandle>,
    transport_events: mpsc::UnboundedSender<TransportNotice>,
    ui: mpsc::UnboundedSender<PeerEvent>,
    table: Mutex<SessionTable>,
    next_epoch: AtomicU64,
}

impl PeerSessionManager {
    pub fn new(
        local: LocalParticipant,
        config: SessionConfig,
        signaling: Arc<dyn SignalingTransport>,
        transports: Arc<dyn PeerTransportFactory>,
        media: Option<MediaStreamHandle>,
        transport_events: mpsc::UnboundedSender<TransportNotice>,
        ui: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        Self {
            local,
            config,
            signaling,
            transports,
            media,
            transport_events,
            ui,
            table: Mutex::new(SessionTable::default()),
            next_epoch: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub const fn local(&self) -> &LocalParticipant {
        &self.local
    }

    /// Open a session to `remote_id` as the offerer
    ///
    /// Idempotent: an existing session is returned untouched. Returns
    /// `None` when the session was torn down before the offer went out.
    pub async fn initiate(
        &self,
        remote_id: &ParticipantId,
        remote_display_name: &str,
    ) -> Result<Option<SessionSnapshot>> {
        if *remote_id == self.local.id {
            return Err(Error::InvalidInput(
                "cannot open a peer session to self".to_string(),
            ));
        }

        let epoch = {
            let mut table = self.table.lock();
            if let Some(existing) = table.sessions.get(remote_id) {
                debug!(
                    remote_id = %remote_id,
                    state = %existing.state,
                    "Session already exists, not initiating"
                );
                return Ok(Some(existing.snapshot()));
            }
            table.closed.shift_remove(remote_id);
            let epoch = self.next_epoch();
            table.sessions.insert(
                remote_id.clone(),
                PeerSession::new(
                    remote_id.clone(),
                    remote_display_name.to_string(),
                    SessionRole::Offerer,
                    epoch,
                ),
            );
            epoch
        };

        info!(
            local_id = %self.local.id,
            remote_id = %remote_id,
            epoch,
            "Initiating peer session"
        );

        if let Err(e) = self.send_offer(remote_id, epoch).await {
            warn!(
                remote_id = %remote_id,
                error = %e,
                "Offer not delivered, session stays new"
            );
            return Err(e);
        }

        Ok(self.session(remote_id))
    }

    /// Accept sessions from `remote_id` again after a teardown
    pub fn reopen(&self, remote_id: &ParticipantId) {
        if self.table.lock().closed.shift_remove(remote_id) {
            debug!(remote_id = %remote_id, "Tombstone cleared");
        }
    }

    /// Apply one inbound envelope
    pub async fn handle_envelope(&self, envelope: SignalingEnvelope) -> EnvelopeOutcome {
        if envelope.to != self.local.id || envelope.from == self.local.id {
            debug!(
                from = %envelope.from,
                to = %envelope.to,
                kind = %envelope.kind(),
                "Misaddressed envelope ignored"
            );
            return EnvelopeOutcome::Ignored;
        }

        let kind = envelope.kind();
        let SignalingEnvelope {
            from,
            signal,
            sender_display_name,
            ..
        } = envelope;
        trace!(from = %from, kind = %kind, "Envelope received");

        match signal {
            Signal::Offer(offer) => self.on_offer(&from, sender_display_name, offer).await,
            Signal::Answer(answer) => self.on_answer(&from, answer).await,
            Signal::IceCandidate(candidate) => self.on_remote_candidate(&from, candidate).await,
            Signal::Unknown(kind) => {
                debug!(from = %from, kind = %kind, "Unknown signal kind ignored");
                EnvelopeOutcome::Ignored
            }
        }
    }

    /// React to something a transport reported
    pub async fn handle_transport_event(&self, notice: TransportNotice) {
        let TransportNotice {
            remote_id,
            epoch,
            event,
        } = notice;

        if !self.is_current(&remote_id, epoch) {
            trace!(remote_id = %remote_id, epoch, "Stale transport event dropped");
            return;
        }

        match event {
            TransportEvent::LocalCandidate(candidate) => {
                let ready = {
                    let mut table = self.table.lock();
                    match table.sessions.get_mut(&remote_id) {
                        Some(session) if session.state == SessionState::New => {
                            session.outbound_candidates.push(candidate);
                            None
                        }
                        Some(_) => Some(candidate),
                        None => None,
                    }
                };
                if let Some(candidate) = ready {
                    self.send_candidate(&remote_id, candidate).await;
                }
            }
            TransportEvent::RemoteTrack(track) => {
                let event = {
                    let mut table = self.table.lock();
                    let Some(session) = table
                        .sessions
                        .get_mut(&remote_id)
                        .filter(|s| s.epoch == epoch)
                    else {
                        return;
                    };
                    let stream = session
                        .remote_stream
                        .get_or_insert_with(|| RemoteStream::new(track.stream_id.clone()));
                    info!(
                        remote_id = %remote_id,
                        track_id = %track.id,
                        kind = %track.kind,
                        "Remote track received"
                    );
                    stream.upsert(track);
                    PeerEvent::RemoteStreamAdded {
                        remote_id: remote_id.clone(),
                        display_name: session.remote_display_name.clone(),
                        stream: stream.clone(),
                    }
                };
                self.notify(event);
            }
            TransportEvent::StateChanged(state) => match state {
                TransportState::Connected => {
                    let answered = self
                        .table
                        .lock()
                        .sessions
                        .get(&remote_id)
                        .is_some_and(|s| s.state == SessionState::AnswerSent);
                    if answered {
                        self.advance(&remote_id, epoch, SessionState::Connected)
                            .await;
                    }
                }
                TransportState::Failed | TransportState::Closed => {
                    warn!(
                        remote_id = %remote_id,
                        state = ?state,
                        "Transport lost, closing session"
                    );
                    self.close_session(&remote_id, false).await;
                }
                TransportState::Disconnected => {
                    info!(remote_id = %remote_id, "Transport disconnected, waiting for recovery");
                }
                TransportState::New | TransportState::Connecting => {
                    trace!(remote_id = %remote_id, state = ?state, "Transport state");
                }
            },
        }
    }

    /// Close the session with `remote_id` and ignore anything that still
    /// arrives for it. Safe in any state and for unknown ids.
    pub async fn teardown(&self, remote_id: &ParticipantId) {
        self.close_session(remote_id, true).await;
    }

    pub async fn teardown_all(&self) {
        let remote_ids: Vec<ParticipantId> = {
            let mut table = self.table.lock();
            table.pending_candidates.clear();
            table.sessions.keys().cloned().collect()
        };
        join_all(remote_ids.iter().map(|id| self.close_session(id, true))).await;
        if !remote_ids.is_empty() {
            info!(closed = remote_ids.len(), "All peer sessions closed");
        }
    }

    /// Close sessions that have not connected within `timeout`
    ///
    /// No tombstone is left, the caller may negotiate again.
    pub async fn expire_stalled(&self, timeout: Duration) -> Vec<ParticipantId> {
        let stalled: Vec<ParticipantId> = self
            .table
            .lock()
            .sessions
            .values()
            .filter(|s| s.is_stalled(timeout))
            .map(|s| s.remote_id.clone())
            .collect();

        for remote_id in &stalled {
            warn!(
                remote_id = %remote_id,
                timeout_secs = timeout.as_secs(),
                "Negotiation stalled, closing session"
            );
            self.close_session(remote_id, false).await;
        }
        stalled
    }

    #[must_use]
    pub fn session(&self, remote_id: &ParticipantId) -> Option<SessionSnapshot> {
        self.table
            .lock()
            .sessions
            .get(remote_id)
            .map(PeerSession::snapshot)
    }

    /// All sessions, ordered by remote id
    #[must_use]
    pub fn sessions(&self) -> Vec<SessionSnapshot> {
        let mut sessions: Vec<_> = self
            .table
            .lock()
            .sessions
            .values()
            .map(PeerSession::snapshot)
            .collect();
        sessions.sort_by(|a, b| a.remote_id.cmp(&b.remote_id));
        sessions
    }

    #[must_use]
    pub fn has_session(&self, remote_id: &ParticipantId) -> bool {
        self.table.lock().sessions.contains_key(remote_id)
    }

    #[must_use]
    pub fn pending_candidates(&self, remote_id: &ParticipantId) -> usize {
        self.table
            .lock()
            .pending_candidates
            .get(remote_id)
            .map_or(0, VecDeque::len)
    }

    fn next_epoch(&self) -> u64 {
        self.next_epoch.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn is_current(&self, remote_id: &ParticipantId, epoch: u64) -> bool {
        self.table
            .lock()
            .sessions
            .get(remote_id)
            .is_some_and(|s| s.epoch == epoch)
    }

    fn notify(&self, event: PeerEvent) {
        if self.ui.send(event).is_err() {
            trace!("UI receiver dropped, event discarded");
        }
    }

    async fn send_offer(&self, remote_id: &ParticipantId, epoch: u64) -> Result<()> {
        let Some(transport) = self.open_transport(remote_id, epoch).await? else {
            return Ok(());
        };

        let offer = transport.create_offer().await?;
        if !self.is_current(remote_id, epoch) {
            debug!(remote_id = %remote_id, "Session closed while creating offer");
            return Ok(());
        }

        self.send_signal(remote_id, Signal::Offer(offer)).await?;
        self.advance(remote_id, epoch, SessionState::OfferSent).await;
        Ok(())
    }

    async fn on_offer(
        &self,
        remote_id: &ParticipantId,
        remote_display_name: String,
        offer: SessionDescription,
    ) -> EnvelopeOutcome {
        let epoch = {
            let mut table = self.table.lock();
            if table.closed.contains(remote_id) {
                debug!(remote_id = %remote_id, "Offer for a closed session ignored");
                return EnvelopeOutcome::Ignored;
            }
            if let Some(existing) = table.sessions.get(remote_id) {
                debug!(
                    remote_id = %remote_id,
                    state = %existing.state,
                    role = ?existing.role,
                    "Duplicate or conflicting offer ignored"
                );
                return EnvelopeOutcome::Ignored;
            }
            let epoch = self.next_epoch();
            table.sessions.insert(
                remote_id.clone(),
                PeerSession::new(
                    remote_id.clone(),
                    remote_display_name,
                    SessionRole::Answerer,
                    epoch,
                ),
            );
            epoch
        };

        match self.answer_offer(remote_id, epoch, offer).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(
                    remote_id = %remote_id,
                    error = %e,
                    "Could not answer offer, dropping it"
                );
                self.discard_session(remote_id, epoch).await;
                EnvelopeOutcome::Dropped
            }
        }
    }

    async fn answer_offer(
        &self,
        remote_id: &ParticipantId,
        epoch: u64,
        offer: SessionDescription,
    ) -> Result<EnvelopeOutcome> {
        let Some(transport) = self.open_transport(remote_id, epoch).await? else {
            return Ok(EnvelopeOutcome::Ignored);
        };

        transport.set_remote_description(offer).await?;
        let Some(pending) = self.take_pending_candidates(remote_id, epoch) else {
            return Ok(EnvelopeOutcome::Ignored);
        };
        self.apply_candidates(remote_id, &transport, pending).await;

        let answer = transport.create_answer().await?;
        if !self.is_current(remote_id, epoch) {
            debug!(remote_id = %remote_id, "Session closed while creating answer");
            return Ok(EnvelopeOutcome::Ignored);
        }

        self.send_signal(remote_id, Signal::Answer(answer)).await?;
        self.advance(remote_id, epoch, SessionState::AnswerSent).await;
        Ok(EnvelopeOutcome::Applied)
    }

    async fn on_answer(
        &self,
        remote_id: &ParticipantId,
        answer: SessionDescription,
    ) -> EnvelopeOutcome {
        let (transport, epoch) = {
            let table = self.table.lock();
            match table.sessions.get(remote_id) {
                Some(session) if session.state == SessionState::OfferSent => {
                    match &session.transport {
                        Some(transport) => (transport.clone(), session.epoch),
                        None => return EnvelopeOutcome::Ignored,
                    }
                }
                Some(session) => {
                    debug!(
                        remote_id = %remote_id,
                        state = %session.state,
                        "Answer outside offer_sent ignored"
                    );
                    return EnvelopeOutcome::Ignored;
                }
                None => {
                    debug!(remote_id = %remote_id, "Answer without a session ignored");
                    return EnvelopeOutcome::Ignored;
                }
            }
        };

        if let Err(e) = transport.set_remote_description(answer).await {
            warn!(remote_id = %remote_id, error = %e, "Rejected answer dropped");
            return EnvelopeOutcome::Dropped;
        }

        let Some(pending) = self.take_pending_candidates(remote_id, epoch) else {
            return EnvelopeOutcome::Ignored;
        };
        self.apply_candidates(remote_id, &transport, pending).await;

        if self
            .advance(remote_id, epoch, SessionState::Connected)
            .await
        {
            EnvelopeOutcome::Applied
        } else {
            EnvelopeOutcome::Ignored
        }
    }

    async fn on_remote_candidate(
        &self,
        remote_id: &ParticipantId,
        candidate: IceCandidate,
    ) -> EnvelopeOutcome {
        let transport = {
            let mut guard = self.table.lock();
            let table = &mut *guard;
            if table.closed.contains(remote_id) {
                debug!(remote_id = %remote_id, "Candidate for a closed session ignored");
                return EnvelopeOutcome::Ignored;
            }

            let ready = table
                .sessions
                .get(remote_id)
                .filter(|s| s.remote_description_set)
                .and_then(|s| s.transport.clone());

            match ready {
                Some(transport) => transport,
                None => {
                    if !table.pending_candidates.contains_key(remote_id)
                        && table.pending_candidates.len() >= self.config.max_pending_remotes
                    {
                        let oldest = table.pending_candidates.shift_remove_index(0);
                        if let Some((evicted, dropped)) = oldest {
                            warn!(
                                remote_id = %evicted,
                                dropped = dropped.len(),
                                "Too many remotes with buffered candidates, dropped oldest buffer"
                            );
                        }
                    }
                    let limit = self.config.max_pending_candidates;
                    let queue = table
                        .pending_candidates
                        .entry(remote_id.clone())
                        .or_default();
                    queue.push_back(candidate);
                    if queue.len() > limit {
                        queue.pop_front();
                        warn!(
                            remote_id = %remote_id,
                            limit,
                            "Pending candidate buffer full, dropped oldest"
                        );
                    }
                    debug!(
                        remote_id = %remote_id,
                        buffered = queue.len(),
                        "Early ICE candidate buffered"
                    );
                    return EnvelopeOutcome::Buffered;
                }
            }
        };

        match transport.add_ice_candidate(candidate).await {
            Ok(()) => EnvelopeOutcome::Applied,
            Err(e) => {
                warn!(remote_id = %remote_id, error = %e, "Malformed ICE candidate skipped");
                EnvelopeOutcome::Dropped
            }
        }
    }

    /// Create the transport for a session and attach the local tracks
    ///
    /// `None` when the session went away while the transport was built.
    async fn open_transport(
        &self,
        remote_id: &ParticipantId,
        epoch: u64,
    ) -> Result<Option<Arc<dyn PeerTransport>>> {
        let events = TransportEvents::new(remote_id.clone(), epoch, self.transport_events.clone());
        let transport = self.transports.create(remote_id, events).await?;

        if let Some(stream) = &self.media {
            for track in stream.tracks() {
                if let Err(e) = transport.add_track(track).await {
                    close_quietly(remote_id, transport.as_ref()).await;
                    return Err(e);
                }
            }
        }

        let stored = {
            let mut table = self.table.lock();
            match table.sessions.get_mut(remote_id) {
                Some(session) if session.epoch == epoch => {
                    session.transport = Some(transport.clone());
                    session.local_tracks_attached = self.media.is_some();
                    true
                }
                _ => false,
            }
        };

        if !stored {
            debug!(remote_id = %remote_id, "Session closed while opening transport");
            close_quietly(remote_id, transport.as_ref()).await;
            return Ok(None);
        }
        Ok(Some(transport))
    }

    /// Mark the remote description applied and take the candidates that
    /// were waiting for it. `None` if the session is gone.
    fn take_pending_candidates(
        &self,
        remote_id: &ParticipantId,
        epoch: u64,
    ) -> Option<Vec<IceCandidate>> {
        let mut guard = self.table.lock();
        let table = &mut *guard;
        let session = table
            .sessions
            .get_mut(remote_id)
            .filter(|s| s.epoch == epoch)?;
        session.remote_description_set = true;
        Some(
            table
                .pending_candidates
                .shift_remove(remote_id)
                .map(Vec::from)
                .unwrap_or_default(),
        )
    }

    async fn apply_candidates(
        &self,
        remote_id: &ParticipantId,
        transport: &Arc<dyn PeerTransport>,
        candidates: Vec<IceCandidate>,
    ) {
        if candidates.is_empty() {
            return;
        }
        let total = candidates.len();
        let mut applied = 0usize;
        for candidate in candidates {
            match transport.add_ice_candidate(candidate).await {
                Ok(()) => applied += 1,
                Err(e) => {
                    warn!(remote_id = %remote_id, error = %e, "Malformed buffered ICE candidate skipped");
                }
            }
        }
        debug!(remote_id = %remote_id, applied, total, "Buffered ICE candidates replayed");
    }

    /// Move a session forward and flush the local candidates it was holding
    async fn advance(&self, remote_id: &ParticipantId, epoch: u64, next: SessionState) -> bool {
        let (event, held) = {
            let mut table = self.table.lock();
            let Some(session) = table
                .sessions
                .get_mut(remote_id)
                .filter(|s| s.epoch == epoch)
            else {
                return false;
            };
            match session.transition(next) {
                Ok(from) => {
                    info!(
                        remote_id = %remote_id,
                        from = %from,
                        to = %next,
                        "Peer session state changed"
                    );
                    (
                        PeerEvent::SessionStateChanged {
                            remote_id: remote_id.clone(),
                            from,
                            to: next,
                        },
                        std::mem::take(&mut session.outbound_candidates),
                    )
                }
                Err(e) => {
                    debug!(remote_id = %remote_id, error = %e, "Transition skipped");
                    return false;
                }
            }
        };

        self.notify(event);
        for candidate in held {
            self.send_candidate(remote_id, candidate).await;
        }
        true
    }

    async fn send_signal(&self, remote_id: &ParticipantId, signal: Signal) -> Result<()> {
        let envelope = SignalingEnvelope::new(
            self.local.id.clone(),
            remote_id.clone(),
            self.local.display_name.clone(),
            signal,
        );
        trace!(to = %remote_id, kind = %envelope.kind(), "Sending envelope");
        self.signaling.send(envelope).await
    }

    async fn send_candidate(&self, remote_id: &ParticipantId, candidate: IceCandidate) {
        if let Err(e) = self
            .send_signal(remote_id, Signal::IceCandidate(candidate))
            .await
        {
            warn!(remote_id = %remote_id, error = %e, "Failed to send ICE candidate");
        }
    }

    async fn close_session(&self, remote_id: &ParticipantId, tombstone: bool) {
        let session = {
            let mut table = self.table.lock();
            if tombstone {
                table.bury(remote_id);
            }
            table.pending_candidates.shift_remove(remote_id);
            table.sessions.remove(remote_id)
        };

        let Some(mut session) = session else {
            trace!(remote_id = %remote_id, "No session to close");
            return;
        };

        if let Some(transport) = session.transport.take() {
            if session.local_tracks_attached {
                if let Err(e) = transport.remove_tracks().await {
                    debug!(remote_id = %remote_id, error = %e, "Failed to detach local tracks");
                }
            }
            close_quietly(remote_id, transport.as_ref()).await;
        }

        let from = session.state;
        if let Err(e) = session.transition(SessionState::Closed) {
            debug!(remote_id = %remote_id, error = %e, "Session already closed");
            return;
        }

        info!(remote_id = %remote_id, from = %from, "Peer session closed");
        self.notify(PeerEvent::SessionStateChanged {
            remote_id: remote_id.clone(),
            from,
            to: SessionState::Closed,
        });
        self.notify(PeerEvent::RemoteStreamRemoved {
            remote_id: remote_id.clone(),
        });
    }

    /// Drop a session that never got past `New`, leaving no trace
    async fn discard_session(&self, remote_id: &ParticipantId, epoch: u64) {
        let session = {
            let mut table = self.table.lock();
            let current = table
                .sessions
                .get(remote_id)
                .is_some_and(|s| s.epoch == epoch);
            if current {
                table.sessions.remove(remote_id)
            } else {
                None
            }
        };
        if let Some(transport) = session.and_then(|s| s.transport) {
            close_quietly(remote_id, transport.as_ref()).await;
        }
    }
}

async fn close_quietly(remote_id: &ParticipantId, transport: &dyn PeerTransport) {
    if let Err(e) = transport.close().await {
        debug!(remote_id = %remote_id, error = %e, "Transport close failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SdpType;
    use crate::service::signaling::{MemoryRelay, MockSignalingTransport};
    use crate::test_helpers::{
        answer_from, drain_events, ice_from, manager_with, offer_from, RecordingTransportFactory,
    };

    fn bob() -> ParticipantId {
        ParticipantId::from("bob")
    }

    #[tokio::test]
    async fn test_initiate_sends_offer_then_candidates() {
        let relay = Arc::new(MemoryRelay::new());
        let factory = Arc::new(RecordingTransportFactory::new());
        let mut fixture =
            manager_with("alice", relay.clone(), factory.clone(), SessionConfig::default());

        let snapshot = fixture
            .manager
            .initiate(&bob(), "Bob")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.state, SessionState::OfferSent);
        assert_eq!(snapshot.role, SessionRole::Offerer);
        assert!(snapshot.local_tracks_attached);

        // The recording transport gathers one candidate while the offer is created
        let transport = factory.transport(&bob()).unwrap();
        let notice = fixture.transport_events.recv().await.unwrap();
        fixture.manager.handle_transport_event(notice).await;

        let mut inbox = relay.subscribe(&bob()).await.unwrap();
        let first = inbox.recv().await.unwrap();
        assert!(matches!(first.signal, Signal::Offer(ref d) if d.sdp_type == SdpType::Offer));
        assert_eq!(first.sender_display_name, "alice");
        let second = inbox.recv().await.unwrap();
        assert!(matches!(second.signal, Signal::IceCandidate(_)));
        assert_eq!(transport.track_count(), 2);
    }

    #[tokio::test]
    async fn test_initiate_is_idempotent() {
        let relay = Arc::new(MemoryRelay::new());
        let factory = Arc::new(RecordingTransportFactory::new());
        let fixture = manager_with("alice", relay.clone(), factory.clone(), SessionConfig::default());

        fixture.manager.initiate(&bob(), "Bob").await.unwrap();
        let again = fixture
            .manager
            .initiate(&bob(), "Bob")
            .await
            .unwrap()
            .unwrap();

        assert_eq!(again.state, SessionState::OfferSent);
        assert_eq!(factory.created(), 1);
        assert_eq!(fixture.manager.sessions().len(), 1);
    }

    #[tokio::test]
    async fn test_initiate_to_self_rejected() {
        let fixture = manager_with(
            "alice",
            Arc::new(MemoryRelay::new()),
            Arc::new(RecordingTransportFactory::new()),
            SessionConfig::default(),
        );
        let result = fixture
            .manager
            .initiate(&ParticipantId::from("alice"), "Alice")
            .await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_duplicate_answer_ignored() {
        let relay = Arc::new(MemoryRelay::new());
        let factory = Arc::new(RecordingTransportFactory::new());
        let mut fixture = manager_with("alice", relay, factory.clone(), SessionConfig::default());

        fixture.manager.initiate(&bob(), "Bob").await.unwrap();
        assert_eq!(
            fixture.manager.handle_envelope(answer_from("bob", "alice")).await,
            EnvelopeOutcome::Applied
        );
        assert_eq!(
            fixture.manager.handle_envelope(answer_from("bob", "alice")).await,
            EnvelopeOutcome::Ignored
        );

        let session = fixture.manager.session(&bob()).unwrap();
        assert_eq!(session.state, SessionState::Connected);
        assert_eq!(factory.transport(&bob()).unwrap().remote_descriptions(), 1);

        let states: Vec<_> = drain_events(&mut fixture.ui)
            .into_iter()
            .filter_map(|e| match e {
                PeerEvent::SessionStateChanged { to, .. } => Some(to),
                _ => None,
            })
            .collect();
        assert_eq!(states, vec![SessionState::OfferSent, SessionState::Connected]);
    }

    #[tokio::test]
    async fn test_answer_without_session_ignored() {
        let fixture = manager_with(
            "alice",
            Arc::new(MemoryRelay::new()),
            Arc::new(RecordingTransportFactory::new()),
            SessionConfig::default(),
        );
        assert_eq!(
            fixture.manager.handle_envelope(answer_from("bob", "alice")).await,
            EnvelopeOutcome::Ignored
        );
        assert!(!fixture.manager.has_session(&bob()));
    }

    #[tokio::test]
    async fn test_candidate_before_offer_is_buffered_then_applied() {
        let relay = Arc::new(MemoryRelay::new());
        let factory = Arc::new(RecordingTransportFactory::new());
        let fixture = manager_with("bob", relay.clone(), factory.clone(), SessionConfig::default());
        let alice = ParticipantId::from("alice");

        assert_eq!(
            fixture.manager.handle_envelope(ice_from("alice", "bob", 5000)).await,
            EnvelopeOutcome::Buffered
        );
        assert_eq!(fixture.manager.pending_candidates(&alice), 1);
        assert!(!fixture.manager.has_session(&alice));

        assert_eq!(
            fixture.manager.handle_envelope(offer_from("alice", "bob")).await,
            EnvelopeOutcome::Applied
        );
        assert_eq!(fixture.manager.pending_candidates(&alice), 0);

        let session = fixture.manager.session(&alice).unwrap();
        assert_eq!(session.state, SessionState::AnswerSent);
        assert_eq!(session.role, SessionRole::Answerer);
        assert_eq!(session.remote_display_name, "alice");

        let transport = factory.transport(&alice).unwrap();
        assert_eq!(transport.candidates().len(), 1);

        let mut inbox = relay.subscribe(&alice).await.unwrap();
        assert!(matches!(inbox.recv().await.unwrap().signal, Signal::Answer(_)));
    }

    #[tokio::test]
    async fn test_pending_candidates_are_capped() {
        let config = SessionConfig {
            max_pending_candidates: 2,
            ..Default::default()
        };
        let fixture = manager_with(
            "bob",
            Arc::new(MemoryRelay::new()),
            Arc::new(RecordingTransportFactory::new()),
            config,
        );
        for port in 0..3 {
            fixture
                .manager
                .handle_envelope(ice_from("alice", "bob", 6000 + port))
                .await;
        }
        assert_eq!(fixture.manager.pending_candidates(&ParticipantId::from("alice")), 2);
    }

    #[tokio::test]
    async fn test_buffered_remotes_are_capped() {
        let config = SessionConfig {
            max_pending_remotes: 2,
            ..Default::default()
        };
        let fixture = manager_with(
            "bob",
            Arc::new(MemoryRelay::new()),
            Arc::new(RecordingTransportFactory::new()),
            config,
        );
        for (remote, port) in [("r0", 6000), ("r1", 6001), ("r2", 6002)] {
            let outcome = fixture
                .manager
                .handle_envelope(ice_from(remote, "bob", port))
                .await;
            assert_eq!(outcome, EnvelopeOutcome::Buffered);
        }
        assert_eq!(fixture.manager.pending_candidates(&ParticipantId::from("r0")), 0);
        assert_eq!(fixture.manager.pending_candidates(&ParticipantId::from("r1")), 1);
        assert_eq!(fixture.manager.pending_candidates(&ParticipantId::from("r2")), 1);
    }

    #[tokio::test]
    async fn test_removal_without_session_drops_buffered_candidates() {
        let fixture = manager_with(
            "alice",
            Arc::new(MemoryRelay::new()),
            Arc::new(RecordingTransportFactory::new()),
            SessionConfig::default(),
        );
        let carol = ParticipantId::from("carol");
        fixture.manager.handle_envelope(ice_from("carol", "alice", 1)).await;
        assert_eq!(fixture.manager.pending_candidates(&carol), 1);

        fixture.manager.teardown(&carol).await;
        assert_eq!(fixture.manager.pending_candidates(&carol), 0);
        assert_eq!(
            fixture.manager.handle_envelope(offer_from("carol", "alice")).await,
            EnvelopeOutcome::Ignored
        );
    }

    #[tokio::test]
    async fn test_tombstones_are_capped() {
        let fixture = manager_with(
            "alice",
            Arc::new(MemoryRelay::new()),
            Arc::new(RecordingTransportFactory::new()),
            SessionConfig::default(),
        );
        for i in 0..=MAX_TOMBSTONES {
            fixture
                .manager
                .teardown(&ParticipantId::from(format!("gone-{i}")))
                .await;
        }
        assert_eq!(fixture.manager.table.lock().closed.len(), MAX_TOMBSTONES);

        // The oldest tombstone was forgotten, the newest still holds
        assert_eq!(
            fixture.manager.handle_envelope(offer_from("gone-0", "alice")).await,
            EnvelopeOutcome::Applied
        );
        let newest = format!("gone-{MAX_TOMBSTONES}");
        assert_eq!(
            fixture.manager.handle_envelope(offer_from(&newest, "alice")).await,
            EnvelopeOutcome::Ignored
        );
    }

    #[tokio::test]
    async fn test_malformed_candidate_skipped() {
        let fixture = manager_with(
            "bob",
            Arc::new(MemoryRelay::new()),
            Arc::new(RecordingTransportFactory::new()),
            SessionConfig::default(),
        );
        fixture.manager.handle_envelope(offer_from("alice", "bob")).await;

        let mut bad = ice_from("alice", "bob", 1);
        if let Signal::IceCandidate(candidate) = &mut bad.signal {
            candidate.candidate = "not-a-candidate".to_string();
        }
        assert_eq!(
            fixture.manager.handle_envelope(bad).await,
            EnvelopeOutcome::Dropped
        );
        assert_eq!(
            fixture.manager.session(&ParticipantId::from("alice")).unwrap().state,
            SessionState::AnswerSent
        );
    }

    #[tokio::test]
    async fn test_duplicate_offer_ignored() {
        let factory = Arc::new(RecordingTransportFactory::new());
        let fixture = manager_with(
            "bob",
            Arc::new(MemoryRelay::new()),
            factory.clone(),
            SessionConfig::default(),
        );
        fixture.manager.handle_envelope(offer_from("alice", "bob")).await;
        assert_eq!(
            fixture.manager.handle_envelope(offer_from("alice", "bob")).await,
            EnvelopeOutcome::Ignored
        );
        assert_eq!(factory.created(), 1);
    }

    #[tokio::test]
    async fn test_malformed_offer_leaves_no_session() {
        let factory = Arc::new(RecordingTransportFactory::new());
        let fixture = manager_with(
            "bob",
            Arc::new(MemoryRelay::new()),
            factory.clone(),
            SessionConfig::default(),
        );
        let mut bad = offer_from("alice", "bob");
        bad.signal = Signal::Offer(SessionDescription::offer("garbage"));

        assert_eq!(
            fixture.manager.handle_envelope(bad).await,
            EnvelopeOutcome::Dropped
        );
        let alice = ParticipantId::from("alice");
        assert!(!fixture.manager.has_session(&alice));
        assert!(factory.transport(&alice).unwrap().is_closed());

        // A well-formed retransmission still gets answered
        assert_eq!(
            fixture.manager.handle_envelope(offer_from("alice", "bob")).await,
            EnvelopeOutcome::Applied
        );
    }

    #[tokio::test]
    async fn test_teardown_then_envelopes_are_noops() {
        let factory = Arc::new(RecordingTransportFactory::new());
        let mut fixture = manager_with(
            "alice",
            Arc::new(MemoryRelay::new()),
            factory.clone(),
            SessionConfig::default(),
        );
        fixture.manager.initiate(&bob(), "Bob").await.unwrap();
        drain_events(&mut fixture.ui);

        fixture.manager.teardown(&bob()).await;
        assert!(!fixture.manager.has_session(&bob()));
        assert!(factory.transport(&bob()).unwrap().is_closed());

        let events = drain_events(&mut fixture.ui);
        assert!(events.iter().any(|e| matches!(
            e,
            PeerEvent::SessionStateChanged { from: SessionState::OfferSent, to: SessionState::Closed, .. }
        )));
        assert!(events
            .iter()
            .any(|e| matches!(e, PeerEvent::RemoteStreamRemoved { .. })));

        for envelope in [
            answer_from("bob", "alice"),
            offer_from("bob", "alice"),
            ice_from("bob", "alice", 1),
        ] {
            assert_eq!(
                fixture.manager.handle_envelope(envelope).await,
                EnvelopeOutcome::Ignored
            );
        }
        assert!(!fixture.manager.has_session(&bob()));
        assert_eq!(fixture.manager.pending_candidates(&bob()), 0);

        // Teardown twice is harmless
        fixture.manager.teardown(&bob()).await;
        assert!(drain_events(&mut fixture.ui).is_empty());
    }

    #[tokio::test]
    async fn test_teardown_during_initiate_wins() {
        let relay = Arc::new(MemoryRelay::new());
        let factory = Arc::new(RecordingTransportFactory::gated());
        let fixture = manager_with("alice", relay.clone(), factory.clone(), SessionConfig::default());
        let manager = fixture.manager.clone();

        let pending = tokio::spawn(async move { manager.initiate(&bob(), "Bob").await });
        factory.wait_entered().await;
        fixture.manager.teardown(&bob()).await;
        factory.open_gate();

        let result = pending.await.unwrap().unwrap();
        assert!(result.is_none());
        assert!(!fixture.manager.has_session(&bob()));
        assert!(factory.transport(&bob()).unwrap().is_closed());
        assert_eq!(relay.stored(&bob()), 0);
    }

    #[tokio::test]
    async fn test_reinitiate_after_teardown() {
        let factory = Arc::new(RecordingTransportFactory::new());
        let fixture = manager_with(
            "alice",
            Arc::new(MemoryRelay::new()),
            factory.clone(),
            SessionConfig::default(),
        );
        fixture.manager.initiate(&bob(), "Bob").await.unwrap();
        fixture.manager.teardown(&bob()).await;

        let snapshot = fixture.manager.initiate(&bob(), "Bob").await.unwrap().unwrap();
        assert_eq!(snapshot.state, SessionState::OfferSent);
        assert_eq!(factory.created(), 2);
    }

    #[tokio::test]
    async fn test_delivery_failure_stalls_session() {
        let mut signaling = MockSignalingTransport::new();
        signaling
            .expect_send()
            .returning(|_| Err(Error::Delivery("relay unavailable".to_string())));

        let fixture = manager_with(
            "alice",
            Arc::new(signaling),
            Arc::new(RecordingTransportFactory::new()),
            SessionConfig::default(),
        );

        let result = fixture.manager.initiate(&bob(), "Bob").await;
        assert!(matches!(result, Err(Error::Delivery(_))));
        assert_eq!(
            fixture.manager.session(&bob()).unwrap().state,
            SessionState::New
        );
    }

    #[tokio::test]
    async fn test_candidates_held_until_offer_sent() {
        let mut signaling = MockSignalingTransport::new();
        signaling
            .expect_send()
            .times(1)
            .returning(|_| Err(Error::Delivery("relay unavailable".to_string())));

        let mut fixture = manager_with(
            "alice",
            Arc::new(signaling),
            Arc::new(RecordingTransportFactory::new()),
            SessionConfig::default(),
        );
        assert!(fixture.manager.initiate(&bob(), "Bob").await.is_err());

        // Gathered while the session is still new: held, not sent
        let notice = fixture.transport_events.recv().await.unwrap();
        assert!(matches!(notice.event, TransportEvent::LocalCandidate(_)));
        fixture.manager.handle_transport_event(notice).await;
        assert!(fixture.manager.has_session(&bob()));
    }

    #[tokio::test]
    async fn test_transport_events() {
        let factory = Arc::new(RecordingTransportFactory::new());
        let mut fixture = manager_with(
            "bob",
            Arc::new(MemoryRelay::new()),
            factory.clone(),
            SessionConfig::default(),
        );
        let alice = ParticipantId::from("alice");
        fixture.manager.handle_envelope(offer_from("alice", "bob")).await;
        drain_events(&mut fixture.ui);

        let transport = factory.transport(&alice).unwrap();
        transport.emit_remote_track("alice-stream");
        transport.emit_state(TransportState::Connected);
        while let Ok(notice) = fixture.transport_events.try_recv() {
            fixture.manager.handle_transport_event(notice).await;
        }

        let session = fixture.manager.session(&alice).unwrap();
        assert_eq!(session.state, SessionState::Connected);
        assert_eq!(session.remote_stream.unwrap().id, "alice-stream");

        let events = drain_events(&mut fixture.ui);
        assert!(events.iter().any(|e| matches!(
            e,
            PeerEvent::RemoteStreamAdded { display_name, .. } if display_name == "alice"
        )));
    }

    #[tokio::test]
    async fn test_stale_transport_events_dropped() {
        let factory = Arc::new(RecordingTransportFactory::new());
        let mut fixture = manager_with(
            "alice",
            Arc::new(MemoryRelay::new()),
            factory.clone(),
            SessionConfig::default(),
        );
        fixture.manager.initiate(&bob(), "Bob").await.unwrap();
        let stale = factory.transport(&bob()).unwrap();
        fixture.manager.teardown(&bob()).await;
        fixture.manager.initiate(&bob(), "Bob").await.unwrap();

        while fixture.transport_events.try_recv().is_ok() {}
        stale.emit_state(TransportState::Failed);
        let notice = fixture.transport_events.recv().await.unwrap();
        fixture.manager.handle_transport_event(notice).await;

        assert_eq!(
            fixture.manager.session(&bob()).unwrap().state,
            SessionState::OfferSent
        );
    }

    #[tokio::test]
    async fn test_transport_failure_closes_without_tombstone() {
        let factory = Arc::new(RecordingTransportFactory::new());
        let mut fixture = manager_with(
            "bob",
            Arc::new(MemoryRelay::new()),
            factory.clone(),
            SessionConfig::default(),
        );
        let alice = ParticipantId::from("alice");
        fixture.manager.handle_envelope(offer_from("alice", "bob")).await;
        while fixture.transport_events.try_recv().is_ok() {}

        factory.transport(&alice).unwrap().emit_state(TransportState::Failed);
        let notice = fixture.transport_events.recv().await.unwrap();
        fixture.manager.handle_transport_event(notice).await;
        assert!(!fixture.manager.has_session(&alice));

        assert_eq!(
            fixture.manager.handle_envelope(offer_from("alice", "bob")).await,
            EnvelopeOutcome::Applied
        );
    }

    #[tokio::test]
    async fn test_expire_stalled() {
        let fixture = manager_with(
            "alice",
            Arc::new(MemoryRelay::new()),
            Arc::new(RecordingTransportFactory::new()),
            SessionConfig::default(),
        );
        fixture.manager.initiate(&bob(), "Bob").await.unwrap();

        assert!(fixture
            .manager
            .expire_stalled(Duration::from_secs(3600))
            .await
            .is_empty());
        assert_eq!(
            fixture.manager.expire_stalled(Duration::ZERO).await,
            vec![bob()]
        );
        assert!(!fixture.manager.has_session(&bob()));

        // Expiry leaves no tombstone
        assert_eq!(
            fixture.manager.handle_envelope(offer_from("bob", "alice")).await,
            EnvelopeOutcome::Applied
        );
    }

    #[tokio::test]
    async fn test_unknown_and_misaddressed_envelopes_ignored() {
        let fixture = manager_with(
            "alice",
            Arc::new(MemoryRelay::new()),
            Arc::new(RecordingTransportFactory::new()),
            SessionConfig::default(),
        );

        let mut unknown = offer_from("bob", "alice");
        unknown.signal = Signal::Unknown("renegotiate".to_string());
        assert_eq!(
            fixture.manager.handle_envelope(unknown).await,
            EnvelopeOutcome::Ignored
        );
        assert_eq!(
            fixture.manager.handle_envelope(offer_from("bob", "carol")).await,
            EnvelopeOutcome::Ignored
        );
        assert!(fixture.manager.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_teardown_all() {
        let fixture = manager_with(
            "alice",
            Arc::new(MemoryRelay::new()),
            Arc::new(RecordingTransportFactory::new()),
            SessionConfig::default(),
        );
        fixture.manager.initiate(&bob(), "Bob").await.unwrap();
        fixture.manager.handle_envelope(offer_from("carol", "alice")).await;
        fixture.manager.handle_envelope(ice_from("dave", "alice", 1)).await;
        assert_eq!(fixture.manager.sessions().len(), 2);

        fixture.manager.teardown_all().await;
        assert!(fixture.manager.sessions().is_empty());
        assert_eq!(fixture.manager.pending_candidates(&ParticipantId::from("dave")), 0);
    }
}
