//! Room controller: entering and leaving a room
//!
//! Joining acquires local media, publishes presence, and then starts a
//! single event loop that owns the roster and feeds the peer session
//! manager. The loop takes directory changes, inbound envelopes and
//! transport events one at a time. Directory changes are preferred when
//! several are ready, so a participant is known before its first offer is
//! handled.
//!
//! A participant only offers to participants that joined after it; the
//! later joiner answers. The directory's join sequence decides, so exactly
//! one side of every pair initiates.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::directory::{DirectoryEvent, RoomDirectory};
use super::events::PeerEvent;
use super::media::{LocalMediaSource, MediaStreamHandle};
use super::peer::{PeerSessionManager, PeerTransportFactory, SessionSnapshot, TransportNotice};
use super::signaling::SignalingTransport;
use super::subscription::Subscription;
use crate::config::SessionConfig;
use crate::models::{LocalParticipant, Participant, ParticipantId, RoomId, SignalingEnvelope};
use crate::{Error, Result};

/// The collaborators a controller works with
#[derive(Clone)]
pub struct RoomServices {
    pub directory: Arc<dyn RoomDirectory>,
    pub signaling: Arc<dyn SignalingTransport>,
    pub media: Arc<dyn LocalMediaSource>,
    pub transports: Arc<dyn PeerTransportFactory>,
}

struct ActiveRoom {
    room_id: RoomId,
    local: Participant,
    stream: MediaStreamHandle,
    manager: Arc<PeerSessionManager>,
    shutdown: CancellationToken,
    event_loop: JoinHandle<()>,
}

pub struct RoomController {
    services: RoomServices,
    config: SessionConfig,
    ui: mpsc::UnboundedSender<PeerEvent>,
    active: Mutex<Option<ActiveRoom>>,
}

impl RoomController {
    pub fn new(
        services: RoomServices,
        config: SessionConfig,
        ui: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        Self {
            services,
            config,
            ui,
            active: Mutex::new(None),
        }
    }

    /// Enter `room_id` as `local`
    ///
    /// Fails without side effects when media is denied or presence cannot
    /// be published.
    pub async fn join_room(&self, room_id: RoomId, local: LocalParticipant) -> Result<Participant> {
        if room_id.is_empty() {
            return Err(Error::InvalidInput("room name is required".to_string()));
        }
        if local.display_name.trim().is_empty() {
            return Err(Error::InvalidInput("display name is required".to_string()));
        }

        let mut active = self.active.lock().await;
        if let Some(current) = active.as_ref() {
            return Err(Error::AlreadyJoined(current.room_id.to_string()));
        }

        let stream = self.services.media.acquire().await.map_err(|e| {
            error!(room_id = %room_id, error = %e, "Could not acquire local media");
            e
        })?;

        let record = match self.services.directory.register(&room_id, &local).await {
            Ok(record) => record,
            Err(e) => {
                error!(room_id = %room_id, error = %e, "Could not publish presence");
                self.services.media.release(&stream).await;
                return Err(e);
            }
        };

        let subscriptions = self.subscribe(&room_id, &local.id).await;
        let (directory_events, signals) = match subscriptions {
            Ok(subscriptions) => subscriptions,
            Err(e) => {
                error!(room_id = %room_id, error = %e, "Could not subscribe to room");
                if let Err(e) = self.services.directory.unregister(&room_id, &local.id).await {
                    warn!(room_id = %room_id, error = %e, "Failed to withdraw presence");
                }
                self.services.media.release(&stream).await;
                return Err(e);
            }
        };

        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(PeerSessionManager::new(
            local.clone(),
            self.config.clone(),
            self.services.signaling.clone(),
            self.services.transports.clone(),
            Some(stream.clone()),
            transport_tx,
            self.ui.clone(),
        ));

        let shutdown = CancellationToken::new();
        let event_loop = tokio::spawn(
            EventLoop {
                local: record.clone(),
                manager: manager.clone(),
                roster: HashMap::new(),
                negotiation_timeout: self.config.negotiation_timeout(),
                sweep_interval: self.config.sweep_interval(),
            }
            .run(directory_events, signals, transport_rx, shutdown.clone()),
        );

        info!(
            room_id = %room_id,
            participant_id = %record.id,
            join_seq = record.join_seq,
            "Joined room"
        );

        *active = Some(ActiveRoom {
            room_id,
            local: record.clone(),
            stream,
            manager,
            shutdown,
            event_loop,
        });
        Ok(record)
    }

    async fn subscribe(
        &self,
        room_id: &RoomId,
        local_id: &ParticipantId,
    ) -> Result<(Subscription<DirectoryEvent>, Subscription<SignalingEnvelope>)> {
        let directory_events = self.services.directory.subscribe(room_id).await?;
        let signals = self.services.signaling.subscribe(local_id).await?;
        Ok((directory_events, signals))
    }

    /// Leave the current room. Safe to call when not in a room.
    pub async fn leave_room(&self) -> Result<()> {
        let Some(room) = self.active.lock().await.take() else {
            debug!("Leave requested while not in a room");
            return Ok(());
        };

        // The loop finishes the event in hand, nothing new starts after this
        room.shutdown.cancel();
        if let Err(e) = room.event_loop.await {
            warn!(error = %e, "Room event loop ended abnormally");
        }

        room.manager.teardown_all().await;
        self.services.media.release(&room.stream).await;

        let unregistered = self
            .services
            .directory
            .unregister(&room.room_id, &room.local.id)
            .await;
        if let Err(e) = &unregistered {
            warn!(room_id = %room.room_id, error = %e, "Failed to withdraw presence");
        }
        if let Err(e) = self.services.signaling.discard_inbox(&room.local.id).await {
            warn!(participant_id = %room.local.id, error = %e, "Failed to discard inbox");
        }

        info!(room_id = %room.room_id, participant_id = %room.local.id, "Left room");
        unregistered
    }

    pub async fn is_joined(&self) -> bool {
        self.active.lock().await.is_some()
    }

    /// The room and the local presence record, while joined
    pub async fn current_room(&self) -> Option<(RoomId, Participant)> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|room| (room.room_id.clone(), room.local.clone()))
    }

    pub async fn sessions(&self) -> Vec<SessionSnapshot> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|room| room.manager.sessions())
            .unwrap_or_default()
    }

    pub async fn session(&self, remote_id: &ParticipantId) -> Option<SessionSnapshot> {
        self.active
            .lock()
            .await
            .as_ref()
            .and_then(|room| room.manager.session(remote_id))
    }

    pub async fn set_audio_enabled(&self, enabled: bool) -> Result<()> {
        let active = self.active.lock().await;
        let room = active
            .as_ref()
            .ok_or_else(|| Error::NotFound("not in a room".to_string()))?;
        room.stream.set_audio_enabled(enabled);
        info!(audio_enabled = enabled, "Microphone toggled");
        Ok(())
    }

    pub async fn set_video_enabled(&self, enabled: bool) -> Result<()> {
        let active = self.active.lock().await;
        let room = active
            .as_ref()
            .ok_or_else(|| Error::NotFound("not in a room".to_string()))?;
        room.stream.set_video_enabled(enabled);
        info!(video_enabled = enabled, "Camera toggled");
        Ok(())
    }

    /// `None` when not in a room
    pub async fn audio_enabled(&self) -> Option<bool> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|room| room.stream.audio_enabled())
    }

    pub async fn video_enabled(&self) -> Option<bool> {
        self.active
            .lock()
            .await
            .as_ref()
            .map(|room| room.stream.video_enabled())
    }
}

struct EventLoop {
    local: Participant,
    manager: Arc<PeerSessionManager>,
    roster: HashMap<ParticipantId, Participant>,
    negotiation_timeout: Option<Duration>,
    sweep_interval: Duration,
}

impl EventLoop {
    async fn run(
        mut self,
        mut directory_events: Subscription<DirectoryEvent>,
        mut signals: Subscription<SignalingEnvelope>,
        mut transport_events: mpsc::UnboundedReceiver<TransportNotice>,
        shutdown: CancellationToken,
    ) {
        let mut sweep = tokio::time::interval(self.sweep_interval.max(Duration::from_millis(10)));
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let sweeping = self.negotiation_timeout.is_some();
        let mut directory_open = true;
        let mut signals_open = true;

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                event = directory_events.recv(), if directory_open => match event {
                    Some(event) => self.on_directory_event(event).await,
                    None => {
                        warn!(participant_id = %self.local.id, "Directory subscription ended");
                        directory_open = false;
                    }
                },
                envelope = signals.recv(), if signals_open => match envelope {
                    Some(envelope) => self.on_envelope(envelope).await,
                    None => {
                        warn!(participant_id = %self.local.id, "Signaling subscription ended");
                        signals_open = false;
                    }
                },
                Some(notice) = transport_events.recv() => {
                    self.manager.handle_transport_event(notice).await;
                }
                _ = sweep.tick(), if sweeping => self.sweep().await,
            }
        }

        debug!(participant_id = %self.local.id, "Room event loop stopped");
    }

    async fn on_directory_event(&mut self, event: DirectoryEvent) {
        match event {
            DirectoryEvent::Added(participant) => {
                if participant.id == self.local.id {
                    return;
                }
                debug!(
                    participant_id = %participant.id,
                    join_seq = participant.join_seq,
                    "Participant present"
                );
                self.manager.reopen(&participant.id);
                let offer = participant.joined_after(&self.local);
                let remote_id = participant.id.clone();
                let display_name = participant.display_name.clone();
                self.roster.insert(remote_id.clone(), participant);

                if offer {
                    if let Err(e) = self.manager.initiate(&remote_id, &display_name).await {
                        warn!(remote_id = %remote_id, error = %e, "Could not initiate session");
                    }
                } else {
                    trace!(remote_id = %remote_id, "Joined earlier, waiting for its offer");
                }
            }
            DirectoryEvent::Removed(participant_id) => {
                if participant_id == self.local.id {
                    warn!("Local presence removed by the directory");
                    return;
                }
                self.roster.remove(&participant_id);
                info!(participant_id = %participant_id, "Participant left");
                self.manager.teardown(&participant_id).await;
            }
        }
    }

    /// Hand an envelope to the manager unless it predates this join
    ///
    /// The relay keeps an inbox across a leave, so messages a remote sent to
    /// the previous presence of this id are replayed on rejoin. Timestamps
    /// travel at millisecond precision, compare at that precision.
    async fn on_envelope(&self, envelope: SignalingEnvelope) {
        if envelope.sent_at.timestamp_millis() < self.local.joined_at.timestamp_millis() {
            debug!(
                from = %envelope.from,
                kind = %envelope.kind(),
                sent_at = %envelope.sent_at,
                joined_at = %self.local.joined_at,
                "Envelope from before this join dropped"
            );
            return;
        }
        let outcome = self.manager.handle_envelope(envelope).await;
        trace!(outcome = ?outcome, "Envelope handled");
    }

    /// Close stalled negotiations and offer again where we are the offerer
    async fn sweep(&mut self) {
        let Some(timeout) = self.negotiation_timeout else {
            return;
        };
        self.manager.expire_stalled(timeout).await;

        let retry: Vec<(ParticipantId, String)> = self
            .roster
            .values()
            .filter(|p| p.joined_after(&self.local) && !self.manager.has_session(&p.id))
            .map(|p| (p.id.clone(), p.display_name.clone()))
            .collect();

        for (remote_id, display_name) in retry {
            info!(remote_id = %remote_id, "Retrying peer session");
            if let Err(e) = self.manager.initiate(&remote_id, &display_name).await {
                warn!(remote_id = %remote_id, error = %e, "Retry failed");
            }
        }
    }
}
