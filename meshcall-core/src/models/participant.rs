use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::id::ParticipantId;

/// Identity the UI hands to the room controller when entering a room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalParticipant {
    pub id: ParticipantId,
    pub display_name: String,
}

impl LocalParticipant {
    pub fn new(id: impl Into<ParticipantId>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }
}

/// Presence record stored by the room directory
///
/// `join_seq` is the record's position in the room's join order. It is
/// assigned by the directory and only grows, so two records of the same
/// room can always be ordered even when their timestamps collide.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    #[serde(rename = "uid")]
    pub id: ParticipantId,
    #[serde(rename = "name")]
    pub display_name: String,
    pub joined_at: DateTime<Utc>,
    pub join_seq: u64,
}

impl Participant {
    /// Whether this record entered the room after `other`
    #[must_use]
    pub const fn joined_after(&self, other: &Self) -> bool {
        self.join_seq > other.join_seq
    }
}
