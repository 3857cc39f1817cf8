//! Room directory: who is present in a room
//!
//! The directory owns presence records and pushes membership changes to
//! subscribers. A new subscription is first brought up to date with one
//! `Added` per record already present, in join order, and then receives
//! live changes. Replay and registration happen under the same lock so a
//! subscriber never misses or duplicates a record.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::subscription::Subscription;
use crate::models::{LocalParticipant, Participant, ParticipantId, RoomId};
use crate::Result;

/// Membership change pushed to directory subscribers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryEvent {
    Added(Participant),
    Removed(ParticipantId),
}

impl DirectoryEvent {
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::Added(_) => "added",
            Self::Removed(_) => "removed",
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RoomDirectory: Send + Sync {
    /// Publish (or refresh) the caller's presence record
    ///
    /// Registering an id that is already present updates the display name
    /// in place and keeps its join position.
    async fn register(&self, room_id: &RoomId, participant: &LocalParticipant)
        -> Result<Participant>;

    async fn unregister(&self, room_id: &RoomId, participant_id: &ParticipantId) -> Result<()>;

    async fn subscribe(&self, room_id: &RoomId) -> Result<Subscription<DirectoryEvent>>;

    /// Current roster in join order
    async fn participants(&self, room_id: &RoomId) -> Result<Vec<Participant>>;
}

type SubscriberId = u64;

#[derive(Default)]
struct RoomRoster {
    members: IndexMap<ParticipantId, Participant>,
    next_seq: u64,
    subscribers: Vec<(SubscriberId, mpsc::UnboundedSender<DirectoryEvent>)>,
}

impl RoomRoster {
    fn broadcast(&mut self, room_id: &RoomId, event: &DirectoryEvent) -> usize {
        let before = self.subscribers.len();
        self.subscribers.retain(|(subscriber_id, sender)| {
            if sender.send(event.clone()).is_ok() {
                true
            } else {
                warn!(
                    room_id = %room_id,
                    subscriber_id,
                    event_type = event.event_type(),
                    "Directory subscriber is gone, removing"
                );
                false
            }
        });
        let sent = self.subscribers.len();
        if sent < before {
            debug!(room_id = %room_id, removed = before - sent, "Cleaned up dead directory subscribers");
        }
        sent
    }

    fn is_idle(&self) -> bool {
        self.members.is_empty() && self.subscribers.is_empty()
    }
}

/// In-process room directory
///
/// Cloning shares the same rooms, so every participant of a local demo or
/// test can hold its own handle.
#[derive(Clone, Default)]
pub struct MemoryDirectory {
    rooms: Arc<DashMap<RoomId, Arc<Mutex<RoomRoster>>>>,
    next_subscriber: Arc<AtomicU64>,
}

impl MemoryDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn roster(&self, room_id: &RoomId) -> Arc<Mutex<RoomRoster>> {
        self.rooms.entry(room_id.clone()).or_default().clone()
    }

    fn remove_if_idle(&self, room_id: &RoomId) {
        let removed = self
            .rooms
            .remove_if(room_id, |_, roster| roster.lock().is_idle())
            .is_some();
        if removed {
            debug!(room_id = %room_id, "Room is empty, removed");
        }
    }

    fn detach(&self, room_id: &RoomId, subscriber_id: SubscriberId) {
        if let Some(roster) = self.rooms.get(room_id).map(|r| r.clone()) {
            roster
                .lock()
                .subscribers
                .retain(|(id, _)| *id != subscriber_id);
            debug!(room_id = %room_id, subscriber_id, "Directory subscriber detached");
        }
        self.remove_if_idle(room_id);
    }

    /// Number of rooms currently tracked
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

#[async_trait]
impl RoomDirectory for MemoryDirectory {
    async fn register(
        &self,
        room_id: &RoomId,
        participant: &LocalParticipant,
    ) -> Result<Participant> {
        let roster = self.roster(room_id);
        let mut roster = roster.lock();

        if let Some(existing) = roster.members.get_mut(&participant.id) {
            existing.display_name.clone_from(&participant.display_name);
            debug!(
                room_id = %room_id,
                participant_id = %participant.id,
                join_seq = existing.join_seq,
                "Presence refreshed"
            );
            return Ok(existing.clone());
        }

        roster.next_seq += 1;
        let record = Participant {
            id: participant.id.clone(),
            display_name: participant.display_name.clone(),
            joined_at: Utc::now(),
            join_seq: roster.next_seq,
        };
        roster.members.insert(record.id.clone(), record.clone());
        let notified = roster.broadcast(room_id, &DirectoryEvent::Added(record.clone()));

        info!(
            room_id = %room_id,
            participant_id = %record.id,
            join_seq = record.join_seq,
            notified,
            "Participant registered"
        );
        Ok(record)
    }

    async fn unregister(&self, room_id: &RoomId, participant_id: &ParticipantId) -> Result<()> {
        let Some(roster) = self.rooms.get(room_id).map(|r| r.clone()) else {
            debug!(room_id = %room_id, participant_id = %participant_id, "Unregister for unknown room");
            return Ok(());
        };

        {
            let mut roster = roster.lock();
            if roster.members.shift_remove(participant_id).is_some() {
                let notified =
                    roster.broadcast(room_id, &DirectoryEvent::Removed(participant_id.clone()));
                info!(
                    room_id = %room_id,
                    participant_id = %participant_id,
                    notified,
                    "Participant unregistered"
                );
            }
        }

        self.remove_if_idle(room_id);
        Ok(())
    }

    async fn subscribe(&self, room_id: &RoomId) -> Result<Subscription<DirectoryEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscriber_id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);

        {
            let roster = self.roster(room_id);
            let mut roster = roster.lock();
            for record in roster.members.values() {
                // The receiver is still held locally, this cannot fail
                let _ = tx.send(DirectoryEvent::Added(record.clone()));
            }
            roster.subscribers.push((subscriber_id, tx));
            debug!(
                room_id = %room_id,
                subscriber_id,
                replayed = roster.members.len(),
                "Directory subscriber attached"
            );
        }

        let directory = self.clone();
        let room_id = room_id.clone();
        Ok(Subscription::new(rx, move || {
            directory.detach(&room_id, subscriber_id);
        }))
    }

    async fn participants(&self, room_id: &RoomId) -> Result<Vec<Participant>> {
        Ok(self
            .rooms
            .get(room_id)
            .map(|roster| roster.lock().members.values().cloned().collect())
            .unwrap_or_default())
    }
}
