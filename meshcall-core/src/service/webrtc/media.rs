//! Capture source that produces silence and a blank picture
//!
//! Stands in for a camera and microphone on hosts without devices. The
//! samples are written to the same `TrackLocalStaticSample`s a real
//! capture pipeline would feed.

use std::time::Duration;

use async_trait::async_trait;
use ::webrtc::media::Sample;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

use crate::config::MediaConfig;
use crate::models::generate_id;
use crate::service::media::{LocalMediaSource, LocalTrack, MediaStreamHandle, TrackKind};
use crate::{Error, Result};

/// One Opus frame of silence
const OPUS_SILENCE: [u8; 3] = [0xF8, 0xFF, 0xFE];
const AUDIO_FRAME: Duration = Duration::from_millis(20);
const VIDEO_FRAME: Duration = Duration::from_millis(33);

pub struct SyntheticMediaSource {
    config: MediaConfig,
}

impl SyntheticMediaSource {
    #[must_use]
    pub const fn new(config: MediaConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl LocalMediaSource for SyntheticMediaSource {
    async fn acquire(&self) -> Result<MediaStreamHandle> {
        if !self.config.allow_capture {
            return Err(Error::MediaAccessDenied(
                "capture permission was not granted".to_string(),
            ));
        }
        if !self.config.audio && !self.config.video {
            return Err(Error::InvalidInput(
                "at least one of audio or video must be requested".to_string(),
            ));
        }

        let stream_id = format!("stream-{}", generate_id());
        let mut tracks = Vec::new();
        if self.config.audio {
            tracks.push(LocalTrack::new(TrackKind::Audio, &stream_id));
        }
        if self.config.video {
            tracks.push(LocalTrack::new(TrackKind::Video, &stream_id));
        }

        let stream = MediaStreamHandle::new(stream_id, tracks);
        stream.set_audio_enabled(!self.config.start_muted);
        stream.set_video_enabled(!self.config.start_camera_off);

        for track in stream.tracks() {
            tokio::spawn(pump(track.clone(), stream.stopped()));
        }

        info!(
            stream_id = %stream.id,
            tracks = stream.tracks().len(),
            audio_enabled = stream.audio_enabled(),
            video_enabled = stream.video_enabled(),
            "Local media acquired"
        );
        Ok(stream)
    }

    async fn release(&self, stream: &MediaStreamHandle) {
        stream.stop();
        debug!(stream_id = %stream.id, "Local media released");
    }
}

/// Feed placeholder samples into `track` until the stream stops
async fn pump(track: LocalTrack, stopped: CancellationToken) {
    let (payload, frame) = match track.kind {
        TrackKind::Audio => (Bytes::from_static(&OPUS_SILENCE), AUDIO_FRAME),
        TrackKind::Video => (Bytes::from(vec![0u8; 64]), VIDEO_FRAME),
    };
    let rtc = track.rtc();
    let mut ticker = tokio::time::interval(frame);

    loop {
        tokio::select! {
            () = stopped.cancelled() => break,
            _ = ticker.tick() => {
                if !track.is_enabled() {
                    continue;
                }
                let sample = Sample {
                    data: payload.clone(),
                    duration: frame,
                    ..Default::default()
                };
                // Fails until the track is bound to a negotiated sender
                if let Err(e) = rtc.write_sample(&sample).await {
                    trace!(track_id = %track.id, error = %e, "Sample not written");
                }
            }
        }
    }
    debug!(track_id = %track.id, "Sample pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_denied_capture() {
        let source = SyntheticMediaSource::new(MediaConfig {
            allow_capture: false,
            ..Default::default()
        });
        assert!(matches!(
            source.acquire().await,
            Err(Error::MediaAccessDenied(_))
        ));
    }

    #[tokio::test]
    async fn test_start_flags() {
        let source = SyntheticMediaSource::new(MediaConfig {
            start_muted: true,
            ..Default::default()
        });
        let stream = source.acquire().await.unwrap();
        assert_eq!(stream.tracks().len(), 2);
        assert!(!stream.audio_enabled());
        assert!(stream.video_enabled());

        source.release(&stream).await;
        assert!(stream.is_stopped());
    }

    #[tokio::test]
    async fn test_audio_only() {
        let source = SyntheticMediaSource::new(MediaConfig {
            video: false,
            ..Default::default()
        });
        let stream = source.acquire().await.unwrap();
        assert_eq!(stream.tracks_of(TrackKind::Video).count(), 0);
        assert_eq!(stream.tracks_of(TrackKind::Audio).count(), 1);
        source.release(&stream).await;
    }
}
