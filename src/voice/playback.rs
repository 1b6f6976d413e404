//! Audio playback to speakers

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleRate, Stream, StreamConfig};

use super::capture::map_build_error;
use super::scheduler::{AudioOutput, PlaybackCursor};
use crate::{Error, Result};

/// Default playback rate (matches common realtime voice output)
pub const DEFAULT_OUTPUT_SAMPLE_RATE: u32 = 24_000;

/// Default output device, driven by a [`PlaybackCursor`]
pub struct AudioPlayback {
    device: Device,
    config: StreamConfig,
    sample_rate: u32,
}

impl AudioPlayback {
    /// Open the default output device at `sample_rate`
    ///
    /// # Errors
    ///
    /// Returns `Error::DeviceUnavailable` if there is no output device or it
    /// cannot play mono or stereo at the requested rate
    pub fn new(sample_rate: u32) -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_output_device()
            .ok_or_else(|| Error::DeviceUnavailable("no output device available".to_string()))?;

        let supports = |c: &cpal::SupportedStreamConfigRange, channels: u16| {
            c.channels() == channels
                && c.min_sample_rate() <= SampleRate(sample_rate)
                && c.max_sample_rate() >= SampleRate(sample_rate)
        };

        let supported_config = device
            .supported_output_configs()
            .map_err(|e| Error::DeviceUnavailable(e.to_string()))?
            .find(|c| supports(c, 1))
            .or_else(|| {
                // Fallback: try stereo
                device
                    .supported_output_configs()
                    .ok()?
                    .find(|c| supports(c, 2))
            })
            .ok_or_else(|| {
                Error::DeviceUnavailable(format!("no output config for {sample_rate} Hz"))
            })?;

        let config = supported_config
            .with_sample_rate(SampleRate(sample_rate))
            .config();

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate,
            channels = config.channels,
            "audio playback initialized"
        );

        Ok(Self {
            device,
            config,
            sample_rate,
        })
    }
}

impl AudioOutput for AudioPlayback {
    type Stream = Stream;

    fn open(&mut self, mut cursor: PlaybackCursor) -> Result<Stream> {
        let channels = usize::from(self.config.channels);

        let stream = self
            .device
            .build_output_stream(
                &self.config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    cursor.render(data, channels);
                },
                |err| {
                    tracing::error!(error = %err, "audio playback error");
                },
                None,
            )
            .map_err(map_build_error)?;

        stream
            .play()
            .map_err(|e| Error::Audio(format!("failed to start playback: {e}")))?;

        Ok(stream)
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}
