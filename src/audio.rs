//! cpal-backed audio capture feeding the local track. cpal streams are not
//! `Send`, so the stream lives on its own thread and hands sample buffers to
//! an async writer task over a channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SampleFormat, SizedSample};
use cpal::Sample as _;
use log::{debug, warn};
use tokio::sync::mpsc;
use webrtc::media::Sample;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::Error;
use crate::media::{CaptureBackend, CaptureHandle};

/// One callback's worth of captured PCM, tagged with the stream format so the
/// writer can compute sample durations.
struct PcmFrame {
    samples: Vec<f32>,
    sample_rate: u32,
    channels: u16,
}

/// Handle to a running input stream. Dropping it unparks the capture thread,
/// which drops the stream and releases the device.
pub struct AudioCapture {
    _stop: std::sync::mpsc::Sender<()>,
}

impl AudioCapture {
    fn start(frames: mpsc::Sender<PcmFrame>, enabled: Arc<AtomicBool>) -> Result<Self> {
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<Result<()>>();

        std::thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || {
                let stream = match open_input_stream(frames, enabled) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // Parks until the AudioCapture handle is dropped.
                let _ = stop_rx.recv();
                drop(stream);
            })?;

        ready_rx
            .recv()
            .map_err(|_| anyhow!("audio capture thread exited before reporting"))??;
        Ok(Self { _stop: stop_tx })
    }
}

fn open_input_stream(
    frames: mpsc::Sender<PcmFrame>,
    enabled: Arc<AtomicBool>,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or_else(|| anyhow!("no input device available"))?;
    let config = device.default_input_config()?;
    debug!("input config: {:?}", config);

    let stream = match config.sample_format() {
        SampleFormat::F32 => build_input_stream::<f32>(&device, &config.into(), frames, enabled)?,
        SampleFormat::I16 => build_input_stream::<i16>(&device, &config.into(), frames, enabled)?,
        SampleFormat::U16 => build_input_stream::<u16>(&device, &config.into(), frames, enabled)?,
        other => return Err(anyhow!("unsupported sample format: {:?}", other)),
    };
    stream.play()?;
    Ok(stream)
}

fn build_input_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    frames: mpsc::Sender<PcmFrame>,
    enabled: Arc<AtomicBool>,
) -> Result<cpal::Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let sample_rate = config.sample_rate.0;
    let channels = config.channels;
    let err_fn = |err| warn!("input audio stream error: {}", err);

    let stream = device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            // Muted: the flag flips in place, no renegotiation anywhere.
            if !enabled.load(Ordering::Relaxed) {
                return;
            }
            let samples: Vec<f32> = data.iter().map(|s| f32::from_sample(*s)).collect();
            // try_send: never block the realtime callback, drop on backpressure
            let _ = frames.try_send(PcmFrame { samples, sample_rate, channels });
        },
        err_fn,
        None,
    )?;
    Ok(stream)
}

/// Audio-only capture backend over the system default input device. Video is
/// not provided here, so rooms joined through this backend share sound only;
/// acquisition degrades to audio-only exactly as when a camera is missing.
pub struct CpalBackend;

#[async_trait]
impl CaptureBackend for CpalBackend {
    async fn open_audio(
        &self,
        track: Arc<TrackLocalStaticSample>,
        enabled: Arc<AtomicBool>,
    ) -> crate::error::Result<CaptureHandle> {
        let (frame_tx, mut frame_rx) = mpsc::channel::<PcmFrame>(64);

        tokio::spawn(async move {
            while let Some(frame) = frame_rx.recv().await {
                if frame.sample_rate == 0 || frame.channels == 0 {
                    continue;
                }
                let per_channel = (frame.samples.len() / frame.channels as usize) as u64;
                let duration =
                    Duration::from_micros(per_channel * 1_000_000 / frame.sample_rate as u64);
                let mut data = Vec::with_capacity(frame.samples.len() * 4);
                for s in &frame.samples {
                    data.extend_from_slice(&s.to_le_bytes());
                }
                let sample = Sample {
                    data: Bytes::from(data),
                    duration,
                    ..Default::default()
                };
                if track.write_sample(&sample).await.is_err() {
                    break;
                }
            }
        });

        // Device probing blocks; keep it off the async workers.
        let capture = tokio::task::spawn_blocking(move || AudioCapture::start(frame_tx, enabled))
            .await
            .map_err(|e| Error::Media(e.to_string()))??;
        Ok(CaptureHandle::new(capture))
    }

    async fn open_video(
        &self,
        _track: Arc<TrackLocalStaticSample>,
        _enabled: Arc<AtomicBool>,
    ) -> crate::error::Result<CaptureHandle> {
        Err(Error::Media("no video capture device on this backend".to_string()))
    }
}
