//! Media-device seam. The engine only acquires and releases the local audio
//! source; capture, encoding and playback live outside this crate.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;

pub mod device;

pub const OPUS_SAMPLE_RATE: u32 = 48_000;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeviceError {
    #[error("no audio input device available")]
    NoDevice,
    #[error("audio device busy: {0}")]
    Busy(String),
    #[error("unsupported capture constraints: {0}")]
    Unsupported(String),
}

/// Capture constraints requested from the device. `relaxed()` is the single
/// fallback profile tried when the preferred constraints fail.
#[derive(Debug, Clone)]
pub struct MediaConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub sample_rate: Option<u32>,
}

impl MediaConstraints {
    pub fn relaxed() -> Self {
        Self {
            echo_cancellation: false,
            noise_suppression: false,
            sample_rate: None,
        }
    }
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            sample_rate: Some(OPUS_SAMPLE_RATE),
        }
    }
}

/// Opaque handle for an acquired outbound audio source.
#[derive(Clone)]
pub struct AudioTrack {
    id: String,
    inner: TrackInner,
}

#[derive(Clone)]
enum TrackInner {
    Rtp(Arc<TrackLocalStaticRTP>),
    Synthetic,
}

impl AudioTrack {
    /// An RTP-backed opus track for a real peer connection.
    pub fn rtp(id: impl Into<String>) -> Self {
        let id = id.into();
        let track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: OPUS_SAMPLE_RATE,
                channels: 1,
                ..Default::default()
            },
            id.clone(),
            "banter".to_string(),
        ));
        Self {
            id,
            inner: TrackInner::Rtp(track),
        }
    }

    /// A tracked label with no media behind it, for the mock link.
    pub fn synthetic(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            inner: TrackInner::Synthetic,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn as_rtp(&self) -> Option<Arc<TrackLocalStaticRTP>> {
        match &self.inner {
            TrackInner::Rtp(track) => Some(track.clone()),
            TrackInner::Synthetic => None,
        }
    }
}

impl std::fmt::Debug for AudioTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioTrack").field("id", &self.id).finish()
    }
}

#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<AudioTrack, DeviceError>;
    async fn release(&self, track: AudioTrack);
}

/// Acquire with the spec'd fallback discipline: one attempt with the
/// preferred constraints, one with the relaxed profile, then the error is
/// fatal for this attempt.
pub async fn acquire_with_fallback(
    source: &dyn MediaSource,
    preferred: &MediaConstraints,
) -> Result<AudioTrack, DeviceError> {
    match source.acquire(preferred).await {
        Ok(track) => Ok(track),
        Err(err) => {
            warn!(error = %err, "audio acquire failed; retrying with relaxed constraints");
            source.acquire(&MediaConstraints::relaxed()).await
        }
    }
}

/// Scriptable in-memory media source for tests: fails the first
/// `fail_attempts` acquisitions, then succeeds with synthetic tracks.
#[derive(Default)]
pub struct FakeMediaSource {
    fail_attempts: AtomicUsize,
    acquired: AtomicUsize,
    released: AtomicUsize,
}

impl FakeMediaSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(attempts: usize) -> Self {
        let source = Self::default();
        source.fail_attempts.store(attempts, Ordering::SeqCst);
        source
    }

    pub fn acquired(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaSource for FakeMediaSource {
    async fn acquire(&self, _constraints: &MediaConstraints) -> Result<AudioTrack, DeviceError> {
        let remaining = self.fail_attempts.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_attempts.store(remaining - 1, Ordering::SeqCst);
            return Err(DeviceError::Busy("scripted failure".into()));
        }
        let serial = self.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(AudioTrack::synthetic(format!("fake-{serial}")))
    }

    async fn release(&self, _track: AudioTrack) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}
