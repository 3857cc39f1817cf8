//! Signaling envelopes exchanged through the relay
//!
//! [`SignalingEnvelope`] is the typed form used inside the crate.
//! [`WireSignal`] is the JSON document persisted by the relay:
//!
//! ```json
//! {"type":"offer","sdp":"v=0...","senderName":"Ada","from":"a1","to":"b2","timestamp":1700000000000}
//! ```

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::id::ParticipantId;
use crate::{Error, Result};

/// SDP type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

impl SdpType {
    #[must_use]
    pub const fn as_str(&self) -> &str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
        }
    }
}

/// Session description (SDP)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Session description type
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    /// SDP content
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate, in the browser's `RTCIceCandidate.toJSON()` shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    /// Full candidate string
    pub candidate: String,
    /// SDP mid
    #[serde(default)]
    pub sdp_mid: Option<String>,
    /// SDP mline index
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// Envelope kind, used for logging and dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
    Unknown,
}

impl SignalKind {
    #[must_use]
    pub const fn as_str(&self) -> &str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "ice",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Envelope body: the kind and its payload travel together
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Offer(SessionDescription),
    Answer(SessionDescription),
    IceCandidate(IceCandidate),
    /// A `type` this build does not understand; kept so it can be logged and skipped
    Unknown(String),
}

impl Signal {
    #[must_use]
    pub const fn kind(&self) -> SignalKind {
        match self {
            Self::Offer(_) => SignalKind::Offer,
            Self::Answer(_) => SignalKind::Answer,
            Self::IceCandidate(_) => SignalKind::IceCandidate,
            Self::Unknown(_) => SignalKind::Unknown,
        }
    }
}

/// A signaling message addressed to one participant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalingEnvelope {
    pub from: ParticipantId,
    pub to: ParticipantId,
    pub signal: Signal,
    pub sender_display_name: String,
    pub sent_at: DateTime<Utc>,
}

impl SignalingEnvelope {
    pub fn new(
        from: ParticipantId,
        to: ParticipantId,
        sender_display_name: impl Into<String>,
        signal: Signal,
    ) -> Self {
        Self {
            from,
            to,
            signal,
            sender_display_name: sender_display_name.into(),
            sent_at: Utc::now(),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> SignalKind {
        self.signal.kind()
    }

    /// Encode to the relay's JSON document
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&WireSignal::from(self))?)
    }

    /// Decode a relay JSON document
    pub fn from_json(json: &str) -> Result<Self> {
        let wire: WireSignal = serde_json::from_str(json)?;
        Self::try_from(wire)
    }
}

/// JSON document persisted by the relay for each envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireSignal {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<IceCandidate>,
    #[serde(default)]
    pub sender_name: String,
    pub from: ParticipantId,
    pub to: ParticipantId,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
}

impl From<&SignalingEnvelope> for WireSignal {
    fn from(envelope: &SignalingEnvelope) -> Self {
        let (sdp, candidate) = match &envelope.signal {
            Signal::Offer(desc) | Signal::Answer(desc) => (Some(desc.sdp.clone()), None),
            Signal::IceCandidate(candidate) => (None, Some(candidate.clone())),
            Signal::Unknown(_) => (None, None),
        };
        let kind = match &envelope.signal {
            Signal::Unknown(kind) => kind.clone(),
            other => other.kind().as_str().to_string(),
        };

        Self {
            kind,
            sdp,
            candidate,
            sender_name: envelope.sender_display_name.clone(),
            from: envelope.from.clone(),
            to: envelope.to.clone(),
            timestamp: envelope.sent_at.timestamp_millis(),
        }
    }
}

impl TryFrom<WireSignal> for SignalingEnvelope {
    type Error = Error;

    fn try_from(wire: WireSignal) -> Result<Self> {
        let signal = match wire.kind.as_str() {
            "offer" => Signal::Offer(SessionDescription::offer(wire.sdp.ok_or_else(|| {
                Error::InvalidInput("offer without sdp".to_string())
            })?)),
            "answer" => Signal::Answer(SessionDescription::answer(wire.sdp.ok_or_else(
                || Error::InvalidInput("answer without sdp".to_string()),
            )?)),
            "ice" => Signal::IceCandidate(wire.candidate.ok_or_else(|| {
                Error::InvalidInput("ice message without candidate".to_string())
            })?),
            other => Signal::Unknown(other.to_string()),
        };

        let sent_at = Utc
            .timestamp_millis_opt(wire.timestamp)
            .single()
            .ok_or_else(|| Error::InvalidInput(format!("bad timestamp: {}", wire.timestamp)))?;

        Ok(Self {
            from: wire.from,
            to: wire.to,
            signal,
            sender_display_name: wire.sender_name,
            sent_at,
        })
    }
}
