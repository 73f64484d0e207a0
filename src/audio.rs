//! Microphone capture through the host audio backend.

use crate::error::{Error, Result};
use crate::media::{
    vp8_track, CaptureHandle, LocalMediaSession, MediaConstraints, MediaDevices, STREAM_ID,
};
use async_trait::async_trait;
use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};
use webrtc::api::media_engine::MIME_TYPE_PCMU;
use webrtc::media::Sample as MediaSample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

const PCMU_RATE: u32 = 8000;
/// 20ms at 8 kHz
const FRAME_SAMPLES: usize = 160;

/// Default microphone, plus an idle video track the embedding application
/// may feed.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostDevices;

#[async_trait]
impl MediaDevices for HostDevices {
    async fn get_user_media(&self, constraints: MediaConstraints) -> Result<LocalMediaSession> {
        let mut captures = Vec::new();
        let audio = if constraints.audio {
            let track = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_PCMU.to_owned(),
                    clock_rate: PCMU_RATE,
                    channels: 1,
                    ..Default::default()
                },
                "audio".to_owned(),
                STREAM_ID.to_owned(),
            ));
            captures.push(AudioCapture::start(Arc::clone(&track)).await?);
            Some(track)
        } else {
            None
        };
        let video = constraints.video.then(vp8_track);
        Ok(LocalMediaSession::new(audio, video, captures))
    }
}

struct AudioCapture;

impl AudioCapture {
    /// The cpal stream is not `Send`, so it lives on its own thread until
    /// the returned handle stops it.
    async fn start(track: Arc<TrackLocalStaticSample>) -> Result<CaptureHandle> {
        let (handle, stop) = CaptureHandle::new();
        let (ready_tx, ready_rx) = oneshot::channel::<Result<()>>();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel::<Vec<u8>>();

        std::thread::spawn(move || {
            let stream = match Self::open_input(frames_tx) {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };
            let _ = ready_tx.send(Ok(()));
            let _ = stop.blocking_recv();
            drop(stream);
            debug!("Microphone capture stopped");
        });

        ready_rx
            .await
            .map_err(|_| Error::MediaAcquisition("capture thread exited".to_owned()))??;
        tokio::spawn(write_frames(track, frames_rx));
        Ok(handle)
    }

    fn open_input(frames: mpsc::UnboundedSender<Vec<u8>>) -> Result<cpal::Stream> {
        let host = cpal::default_host();
        let input_device = host
            .default_input_device()
            .ok_or_else(|| Error::MediaAcquisition("No input device available".to_owned()))?;

        let config = input_device
            .default_input_config()
            .map_err(|e| Error::MediaAcquisition(e.to_string()))?;
        info!("Input config: {:?}", config);

        let stream_config = config.config();
        let stream = match config.sample_format() {
            SampleFormat::F32 => {
                Self::build_input_stream::<f32>(&input_device, &stream_config, frames)?
            }
            SampleFormat::I16 => {
                Self::build_input_stream::<i16>(&input_device, &stream_config, frames)?
            }
            SampleFormat::U16 => {
                Self::build_input_stream::<u16>(&input_device, &stream_config, frames)?
            }
            sample_format => {
                return Err(Error::MediaAcquisition(format!(
                    "Unsupported sample format: {:?}",
                    sample_format
                )))
            }
        };

        stream
            .play()
            .map_err(|e| Error::MediaAcquisition(e.to_string()))?;
        Ok(stream)
    }

    fn build_input_stream<T>(
        device: &cpal::Device,
        config: &cpal::StreamConfig,
        frames: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Result<cpal::Stream>
    where
        T: SizedSample + Send + 'static,
        f32: FromSample<T>,
    {
        let err_fn = |err| error!("An error occurred on the input audio stream: {}", err);
        let mut resampler = Downsampler::new(config.sample_rate.0, config.channels as usize);

        let stream = device
            .build_input_stream(
                config,
                move |data: &[T], _: &cpal::InputCallbackInfo| {
                    for frame in resampler.push(data) {
                        let _ = frames.send(frame);
                    }
                },
                err_fn,
                None,
            )
            .map_err(|e| Error::MediaAcquisition(e.to_string()))?;

        Ok(stream)
    }
}

async fn write_frames(
    track: Arc<TrackLocalStaticSample>,
    mut frames: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(frame) = frames.recv().await {
        let sample = MediaSample {
            data: Bytes::from(frame),
            duration: Duration::from_millis(20),
            ..Default::default()
        };
        if let Err(e) = track.write_sample(&sample).await {
            debug!("Failed to write audio sample: {}", e);
        }
    }
}

/// Mono downmix and nearest-sample decimation to 8 kHz µ-law frames.
struct Downsampler {
    channels: usize,
    step: f64,
    position: f64,
    frame: Vec<u8>,
}

impl Downsampler {
    fn new(input_rate: u32, channels: usize) -> Self {
        Self {
            channels: channels.max(1),
            step: f64::from(input_rate) / f64::from(PCMU_RATE),
            position: 0.0,
            frame: Vec::with_capacity(FRAME_SAMPLES),
        }
    }

    fn push<T>(&mut self, data: &[T]) -> Vec<Vec<u8>>
    where
        T: Sample,
        f32: FromSample<T>,
    {
        let mut ready = Vec::new();
        let input_frames = data.len() / self.channels;
        while (self.position as usize) < input_frames {
            let start = self.position as usize * self.channels;
            let mono = data[start..start + self.channels]
                .iter()
                .map(|&s| s.to_sample::<f32>())
                .sum::<f32>()
                / self.channels as f32;
            self.frame.push(linear_to_ulaw(mono));
            if self.frame.len() == FRAME_SAMPLES {
                ready.push(std::mem::replace(
                    &mut self.frame,
                    Vec::with_capacity(FRAME_SAMPLES),
                ));
            }
            self.position += self.step;
        }
        self.position -= input_frames as f64;
        ready
    }
}

/// G.711 µ-law companding of a sample in [-1.0, 1.0].
fn linear_to_ulaw(sample: f32) -> u8 {
    const BIAS: i32 = 0x84;
    const CLIP: i32 = 32635;

    let mut pcm = (sample.clamp(-1.0, 1.0) * 32767.0) as i32;
    let sign = if pcm < 0 {
        pcm = -pcm;
        0x80
    } else {
        0
    };
    pcm = pcm.min(CLIP) + BIAS;

    let exponent = (24 - (pcm as u32).leading_zeros() as i32).clamp(0, 7);
    let mantissa = (pcm >> (exponent + 3)) & 0x0f;
    !(sign | (exponent << 4) | mantissa) as u8
}
