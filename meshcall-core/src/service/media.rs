//! Local capture and remote media handles

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use crate::models::generate_id;
use crate::Result;

/// Media track kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

impl TrackKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Audio => "audio",
            Self::Video => "video",
        }
    }

    fn capability(self) -> RTCRtpCodecCapability {
        match self {
            Self::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                rtcp_feedback: vec![],
            },
            Self::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
        }
    }
}

impl From<RTPCodecType> for TrackKind {
    fn from(codec_type: RTPCodecType) -> Self {
        match codec_type {
            RTPCodecType::Audio => Self::Audio,
            _ => Self::Video,
        }
    }
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A captured track that is attached to every peer session
#[derive(Clone)]
pub struct LocalTrack {
    pub id: String,
    pub kind: TrackKind,
    enabled: Arc<AtomicBool>,
    rtc: Arc<TrackLocalStaticSample>,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, stream_id: &str) -> Self {
        let id = format!("{}-{}", kind.as_str(), generate_id());
        let rtc = Arc::new(TrackLocalStaticSample::new(
            kind.capability(),
            id.clone(),
            stream_id.to_owned(),
        ));
        Self {
            id,
            kind,
            enabled: Arc::new(AtomicBool::new(true)),
            rtc,
        }
    }

    /// Muted tracks stay attached and keep their sender, they only stop
    /// producing samples
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    #[must_use]
    pub fn rtc(&self) -> Arc<TrackLocalStaticSample> {
        self.rtc.clone()
    }
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("enabled", &self.is_enabled())
            .finish_non_exhaustive()
    }
}

/// The local stream acquired once per room visit
#[derive(Debug, Clone)]
pub struct MediaStreamHandle {
    pub id: String,
    tracks: Vec<LocalTrack>,
    stopped: CancellationToken,
}

impl MediaStreamHandle {
    #[must_use]
    pub fn new(id: String, tracks: Vec<LocalTrack>) -> Self {
        Self {
            id,
            tracks,
            stopped: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn tracks_of(&self, kind: TrackKind) -> impl Iterator<Item = &LocalTrack> {
        self.tracks.iter().filter(move |t| t.kind == kind)
    }

    /// `false` when there is no audio track
    #[must_use]
    pub fn audio_enabled(&self) -> bool {
        self.tracks_of(TrackKind::Audio).any(LocalTrack::is_enabled)
    }

    pub fn set_audio_enabled(&self, enabled: bool) {
        self.tracks_of(TrackKind::Audio)
            .for_each(|t| t.set_enabled(enabled));
    }

    #[must_use]
    pub fn video_enabled(&self) -> bool {
        self.tracks_of(TrackKind::Video).any(LocalTrack::is_enabled)
    }

    pub fn set_video_enabled(&self, enabled: bool) {
        self.tracks_of(TrackKind::Video)
            .for_each(|t| t.set_enabled(enabled));
    }

    /// Stop capture. Producers watching [`Self::stopped`] end.
    pub fn stop(&self) {
        self.stopped.cancel();
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.is_cancelled()
    }

    #[must_use]
    pub fn stopped(&self) -> CancellationToken {
        self.stopped.clone()
    }
}

#[async_trait]
pub trait LocalMediaSource: Send + Sync {
    /// Acquire camera and microphone
    ///
    /// Fails with [`crate::Error::MediaAccessDenied`] when the device or the
    /// user refuses.
    async fn acquire(&self) -> Result<MediaStreamHandle>;

    /// Give the devices back
    async fn release(&self, stream: &MediaStreamHandle) {
        stream.stop();
    }
}

/// A track received from a remote participant
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: TrackKind,
    pub stream_id: String,
    /// The underlying RTP track when the transport is a real peer connection
    pub rtp: Option<Arc<TrackRemote>>,
}

impl RemoteTrack {
    pub fn from_rtp(track: Arc<TrackRemote>) -> Self {
        Self {
            id: track.id(),
            kind: track.kind().into(),
            stream_id: track.stream_id(),
            rtp: Some(track),
        }
    }
}

impl std::fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("stream_id", &self.stream_id)
            .field("rtp", &self.rtp.is_some())
            .finish()
    }
}

/// Tracks received from one remote, grouped the way the UI renders them
#[derive(Debug, Clone)]
pub struct RemoteStream {
    pub id: String,
    pub tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    #[must_use]
    pub fn new(id: String) -> Self {
        Self {
            id,
            tracks: Vec::new(),
        }
    }

    /// Add or replace a track. Returns `false` if the same track was already present.
    pub fn upsert(&mut self, track: RemoteTrack) -> bool {
        if let Some(existing) = self.tracks.iter_mut().find(|t| t.id == track.id) {
            *existing = track;
            false
        } else {
            self.tracks.push(track);
            true
        }
    }

    #[must_use]
    pub fn has(&self, kind: TrackKind) -> bool {
        self.tracks.iter().any(|t| t.kind == kind)
    }
}
