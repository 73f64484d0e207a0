//! Local capture session and the device seam used to acquire it.

use crate::error::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

pub const STREAM_ID: &str = "webrtc-mesh";

/// Opus frame that decodes to 20ms of silence.
const OPUS_SILENCE: [u8; 3] = [0xf8, 0xff, 0xfe];
const FRAME_DURATION: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
        }
    }
}

/// Stops one capture feeder when signalled or dropped.
#[derive(Debug)]
pub struct CaptureHandle {
    stop: Option<oneshot::Sender<()>>,
}

impl CaptureHandle {
    pub fn new() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self { stop: Some(tx) }, rx)
    }

    fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

/// The local participant's captured tracks, shared read-only by every peer
/// link. Capture is released exactly once, on [`stop`](Self::stop) or drop.
pub struct LocalMediaSession {
    audio: Option<Arc<TrackLocalStaticSample>>,
    video: Option<Arc<TrackLocalStaticSample>>,
    captures: Vec<CaptureHandle>,
    stopped: bool,
}

impl LocalMediaSession {
    pub fn new(
        audio: Option<Arc<TrackLocalStaticSample>>,
        video: Option<Arc<TrackLocalStaticSample>>,
        captures: Vec<CaptureHandle>,
    ) -> Self {
        Self {
            audio,
            video,
            captures,
            stopped: false,
        }
    }

    pub fn tracks(&self) -> Vec<Arc<TrackLocalStaticSample>> {
        self.audio.iter().chain(self.video.iter()).cloned().collect()
    }

    pub fn audio_track(&self) -> Option<&Arc<TrackLocalStaticSample>> {
        self.audio.as_ref()
    }

    /// Frames written here reach every connected peer.
    pub fn video_track(&self) -> Option<&Arc<TrackLocalStaticSample>> {
        self.video.as_ref()
    }

    /// Returns true only for the call that actually released capture.
    pub fn stop(&mut self) -> bool {
        if self.stopped {
            return false;
        }
        self.stopped = true;
        for capture in &mut self.captures {
            capture.stop();
        }
        debug!("Local capture stopped");
        true
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }
}

impl Drop for LocalMediaSession {
    fn drop(&mut self) {
        self.stop();
    }
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Acquire local capture. Failure means the caller may not enter a room.
    async fn get_user_media(&self, constraints: MediaConstraints) -> Result<LocalMediaSession>;
}

pub fn opus_track() -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_OPUS.to_owned(),
            clock_rate: 48000,
            channels: 2,
            ..Default::default()
        },
        "audio".to_owned(),
        STREAM_ID.to_owned(),
    ))
}

pub fn vp8_track() -> Arc<TrackLocalStaticSample> {
    Arc::new(TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: MIME_TYPE_VP8.to_owned(),
            clock_rate: 90000,
            ..Default::default()
        },
        "video".to_owned(),
        STREAM_ID.to_owned(),
    ))
}

/// Devices that need no hardware: a silent Opus track and an idle VP8
/// track.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyntheticDevices;

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn get_user_media(&self, constraints: MediaConstraints) -> Result<LocalMediaSession> {
        if !constraints.audio && !constraints.video {
            return Err(Error::MediaAcquisition(
                "at least one of audio or video must be requested".to_owned(),
            ));
        }

        let mut captures = Vec::new();
        let audio = constraints.audio.then(|| {
            let track = opus_track();
            let (handle, stop) = CaptureHandle::new();
            tokio::spawn(feed_silence(Arc::clone(&track), stop));
            captures.push(handle);
            track
        });
        let video = constraints.video.then(vp8_track);

        Ok(LocalMediaSession::new(audio, video, captures))
    }
}

async fn feed_silence(track: Arc<TrackLocalStaticSample>, mut stop: oneshot::Receiver<()>) {
    let mut ticker = tokio::time::interval(FRAME_DURATION);
    loop {
        tokio::select! {
            _ = &mut stop => break,
            _ = ticker.tick() => {
                let sample = Sample {
                    data: Bytes::from_static(&OPUS_SILENCE),
                    duration: FRAME_DURATION,
                    ..Default::default()
                };
                if let Err(e) = track.write_sample(&sample).await {
                    debug!("Failed to write silence frame: {}", e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_synthetic_devices_honour_constraints() {
        let session = SyntheticDevices
            .get_user_media(MediaConstraints {
                audio: true,
                video: false,
            })
            .await
            .unwrap();
        assert_eq!(session.tracks().len(), 1);
        assert!(session.video_track().is_none());

        let session = SyntheticDevices
            .get_user_media(MediaConstraints::default())
            .await
            .unwrap();
        assert_eq!(session.tracks().len(), 2);
    }

    #[tokio::test]
    async fn test_nothing_requested_is_an_acquisition_error() {
        let result = SyntheticDevices
            .get_user_media(MediaConstraints {
                audio: false,
                video: false,
            })
            .await;
        assert!(matches!(result, Err(Error::MediaAcquisition(_))));
    }

    #[tokio::test]
    async fn test_stop_releases_once() {
        let (handle, mut stop) = CaptureHandle::new();
        let mut session = LocalMediaSession::new(Some(opus_track()), None, vec![handle]);

        assert!(session.stop());
        assert!(!session.stop());
        assert!(session.is_stopped());
        assert!(stop.try_recv().is_ok());
    }

    #[tokio::test]
    async fn test_drop_releases_capture() {
        let (handle, stop) = CaptureHandle::new();
        drop(LocalMediaSession::new(None, Some(vp8_track()), vec![handle]));
        assert!(stop.await.is_ok());
    }
}
