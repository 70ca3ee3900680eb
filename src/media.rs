//! Local media acquisition. One capture source is shared read-only by every
//! peer link; mute and camera-off flip in-place enabled flags, so no link
//! ever renegotiates for them.

use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::warn;
use tokio::sync::Mutex;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::error::{Error, Result};

/// Keeps a capture device open for as long as it is held. Dropping it stops
/// the underlying stream.
pub struct CaptureHandle {
    _guard: Box<dyn Any + Send>,
}

impl CaptureHandle {
    pub fn new(guard: impl Any + Send) -> Self {
        Self { _guard: Box::new(guard) }
    }
}

/// Seam over the platform capture devices. The shipped [`CpalBackend`]
/// (see `audio.rs`) provides the audio device; video capture depends on what
/// the host application wires in.
#[async_trait]
pub trait CaptureBackend: Send + Sync {
    async fn open_audio(
        &self,
        track: Arc<TrackLocalStaticSample>,
        enabled: Arc<AtomicBool>,
    ) -> Result<CaptureHandle>;

    async fn open_video(
        &self,
        track: Arc<TrackLocalStaticSample>,
        enabled: Arc<AtomicBool>,
    ) -> Result<CaptureHandle>;
}

/// The local capture source. Tracks are added to every peer connection;
/// the enabled flags are checked by the capture pumps, so toggling them is
/// immediately visible on all links at once.
pub struct MediaSource {
    audio: Option<Arc<TrackLocalStaticSample>>,
    video: Option<Arc<TrackLocalStaticSample>>,
    audio_enabled: Arc<AtomicBool>,
    video_enabled: Arc<AtomicBool>,
    captures: std::sync::Mutex<Vec<CaptureHandle>>,
}

impl MediaSource {
    pub fn audio_track(&self) -> Option<Arc<TrackLocalStaticSample>> {
        self.audio.clone()
    }

    pub fn video_track(&self) -> Option<Arc<TrackLocalStaticSample>> {
        self.video.clone()
    }

    pub fn mic_on(&self) -> bool {
        self.audio.is_some() && self.audio_enabled.load(Ordering::SeqCst)
    }

    pub fn cam_on(&self) -> bool {
        self.video.is_some() && self.video_enabled.load(Ordering::SeqCst)
    }

    /// Flips the audio enabled flag; returns the new state. No-op without an
    /// audio track.
    pub fn toggle_mic(&self) -> bool {
        if self.audio.is_none() {
            return false;
        }
        !self.audio_enabled.fetch_xor(true, Ordering::SeqCst)
    }

    pub fn toggle_cam(&self) -> bool {
        if self.video.is_none() {
            return false;
        }
        !self.video_enabled.fetch_xor(true, Ordering::SeqCst)
    }

    /// Stops every capture stream. Safe to call more than once.
    pub fn release(&self) {
        if let Ok(mut captures) = self.captures.lock() {
            captures.clear();
        }
    }
}

/// Acquires and holds the single local [`MediaSource`].
///
/// `acquire` is idempotent: while a source is held, repeated calls return it
/// without touching the device layer again, so the user is never re-prompted
/// for permissions.
pub struct MediaAcquirer {
    backend: Arc<dyn CaptureBackend>,
    held: Mutex<Option<Arc<MediaSource>>>,
}

impl MediaAcquirer {
    pub fn new(backend: Arc<dyn CaptureBackend>) -> Self {
        Self { backend, held: Mutex::new(None) }
    }

    pub async fn acquire(&self) -> Result<Arc<MediaSource>> {
        let mut held = self.held.lock().await;
        if let Some(source) = held.as_ref() {
            return Ok(source.clone());
        }
        let source = self.open_source().await?;
        *held = Some(source.clone());
        Ok(source)
    }

    /// Releases the held source, stopping its capture streams. The next
    /// `acquire` starts from scratch.
    pub async fn release(&self) {
        if let Some(source) = self.held.lock().await.take() {
            source.release();
        }
    }

    /// Tries audio and video; a missing camera degrades to audio only, and
    /// only the loss of both is an error.
    async fn open_source(&self) -> Result<Arc<MediaSource>> {
        let audio_enabled = Arc::new(AtomicBool::new(true));
        let video_enabled = Arc::new(AtomicBool::new(true));
        let mut captures = Vec::new();

        let audio_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                ..Default::default()
            },
            "audio".to_owned(),
            "room-client".to_owned(),
        ));
        let audio = match self
            .backend
            .open_audio(audio_track.clone(), audio_enabled.clone())
            .await
        {
            Ok(handle) => {
                captures.push(handle);
                Some(audio_track)
            }
            Err(e) => {
                warn!("audio capture unavailable: {}", e);
                None
            }
        };

        let video_track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                ..Default::default()
            },
            "video".to_owned(),
            "room-client".to_owned(),
        ));
        let video = match self
            .backend
            .open_video(video_track.clone(), video_enabled.clone())
            .await
        {
            Ok(handle) => {
                captures.push(handle);
                Some(video_track)
            }
            Err(e) => {
                warn!("video capture unavailable, continuing without camera: {}", e);
                None
            }
        };

        if audio.is_none() && video.is_none() {
            return Err(Error::Media("no capture device available".to_string()));
        }

        Ok(Arc::new(MediaSource {
            audio,
            video,
            audio_enabled,
            video_enabled,
            captures: std::sync::Mutex::new(captures),
        }))
    }
}
