//! cpal-backed audio device source. Only device selection and constraint
//! validation happen here; the capture pipeline itself is outside the
//! connection engine.

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait};
use tracing::{debug, info};
use uuid::Uuid;

use super::{AudioTrack, DeviceError, MediaConstraints, MediaSource};

#[derive(Default)]
pub struct SystemMediaSource;

impl SystemMediaSource {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl MediaSource for SystemMediaSource {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<AudioTrack, DeviceError> {
        let host = cpal::default_host();
        let device = host.default_input_device().ok_or(DeviceError::NoDevice)?;
        let name = device.name().unwrap_or_else(|_| "<unnamed>".to_string());

        if let Some(rate) = constraints.sample_rate {
            let mut configs = device
                .supported_input_configs()
                .map_err(|err| DeviceError::Busy(err.to_string()))?;
            let supported = configs
                .any(|range| range.min_sample_rate().0 <= rate && rate <= range.max_sample_rate().0);
            if !supported {
                return Err(DeviceError::Unsupported(format!(
                    "device {name} cannot capture at {rate} Hz"
                )));
            }
        }

        info!(device = %name, "acquired audio input device");
        Ok(AudioTrack::rtp(format!("mic-{}", Uuid::new_v4())))
    }

    async fn release(&self, track: AudioTrack) {
        debug!(track = track.id(), "released audio input device");
    }
}
