//! Audio capture from microphone

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BuildStreamError, Device, SampleRate, Stream, StreamConfig};
use tokio::sync::mpsc;

use super::encoder::{EncoderStats, FrameEncoder};
use crate::protocol::AudioFrame;
use crate::{Error, Result};

/// Sample rate for audio capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Captures microphone audio and emits fixed-size PCM16 frames
pub struct AudioCapture {
    device: Device,
    config: StreamConfig,
    frame_samples: usize,
    stream: Option<Stream>,
    stats: Option<std::sync::Arc<EncoderStats>>,
}

impl AudioCapture {
    /// Open the default input device
    ///
    /// # Errors
    ///
    /// Returns `Error::DeviceUnavailable` if no microphone is present or none
    /// supports the requested rate, and `Error::PermissionDenied` if the OS
    /// refuses access, and `Error::Config` for a zero frame size
    pub fn new(sample_rate: u32, frame_samples: usize) -> Result<Self> {
        if frame_samples == 0 {
            return Err(Error::Config("frame size must be greater than zero".to_string()));
        }

        let host = cpal::default_host();

        let device = host
            .default_input_device()
            .ok_or_else(|| Error::DeviceUnavailable("no input device available".to_string()))?;

        let supported_config = device
            .supported_input_configs()
            .map_err(|e| classify(&e.to_string(), Error::DeviceUnavailable))?
            .filter(|c| {
                c.min_sample_rate() <= SampleRate(sample_rate)
                    && c.max_sample_rate() >= SampleRate(sample_rate)
            })
            .min_by_key(cpal::SupportedStreamConfigRange::channels)
            .ok_or_else(|| {
                Error::DeviceUnavailable(format!("no input config for {sample_rate} Hz"))
            })?;

        let config = supported_config
            .with_sample_rate(SampleRate(sample_rate))
            .config();

        tracing::debug!(
            device = device.name().unwrap_or_default(),
            sample_rate,
            channels = config.channels,
            frame_samples,
            "audio capture initialized"
        );

        Ok(Self {
            device,
            config,
            frame_samples,
            stream: None,
            stats: None,
        })
    }

    /// Start capturing into `frames`
    ///
    /// Frames are sent with `try_send`; if the receiver falls behind, frames
    /// are dropped rather than stalling the callback.
    ///
    /// # Errors
    ///
    /// Returns `Error::PermissionDenied` or `Error::DeviceUnavailable` if the
    /// stream cannot be opened
    pub fn start(&mut self, frames: mpsc::Sender<AudioFrame>) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let channels = usize::from(self.config.channels).max(1);
        let mut encoder = FrameEncoder::new(self.frame_samples, self.config.sample_rate.0, frames);
        self.stats = Some(encoder.stats());

        // Scratch buffer for downmixing, sized on first callback
        let mut mono: Vec<f32> = Vec::new();

        let stream = self
            .device
            .build_input_stream(
                &self.config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if channels == 1 {
                        encoder.push(data);
                    } else {
                        mono.clear();
                        mono.extend(data.chunks(channels).map(|f| f[0]));
                        encoder.push(&mono);
                    }
                },
                |err| {
                    tracing::error!(error = %err, "audio capture error");
                },
                None,
            )
            .map_err(map_build_error)?;

        stream
            .play()
            .map_err(|e| classify(&e.to_string(), Error::Audio))?;
        self.stream = Some(stream);

        tracing::debug!("audio capture started");
        Ok(())
    }

    /// Stop capturing; the device is released before this returns
    pub fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            tracing::debug!(
                emitted = self.stats.as_ref().map_or(0, |s| s.emitted()),
                dropped = self.stats.as_ref().map_or(0, |s| s.dropped()),
                "audio capture stopped"
            );
        }
    }

    /// Check if currently capturing
    #[must_use]
    pub const fn is_capturing(&self) -> bool {
        self.stream.is_some()
    }

    /// Encoder counters for the running capture
    #[must_use]
    pub fn stats(&self) -> Option<&EncoderStats> {
        self.stats.as_deref()
    }

    /// Get the sample rate
    #[must_use]
    pub const fn sample_rate(&self) -> u32 {
        self.config.sample_rate.0
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Map a cpal stream build failure onto the capture error kinds
pub(crate) fn map_build_error(err: BuildStreamError) -> Error {
    match err {
        BuildStreamError::DeviceNotAvailable => {
            Error::DeviceUnavailable("device no longer available".to_string())
        }
        BuildStreamError::StreamConfigNotSupported | BuildStreamError::InvalidArgument => {
            Error::DeviceUnavailable(err.to_string())
        }
        BuildStreamError::BackendSpecific { err } => classify(&err.description, Error::Audio),
        other => Error::Audio(other.to_string()),
    }
}

/// Backends report access refusal only as text; sniff for it
fn classify(description: &str, fallback: fn(String) -> Error) -> Error {
    let lower = description.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized")
    {
        Error::PermissionDenied(description.to_string())
    } else {
        fallback(description.to_string())
    }
}

#[cfg(test)]
mod tests {
    use cpal::BackendSpecificError;

    use super::*;

    #[test]
    fn missing_device_is_device_unavailable() {
        let err = map_build_error(BuildStreamError::DeviceNotAvailable);
        assert!(matches!(err, Error::DeviceUnavailable(_)));
    }

    #[test]
    fn backend_permission_failure_is_permission_denied() {
        let err = map_build_error(BuildStreamError::BackendSpecific {
            err: BackendSpecificError {
                description: "Permission denied (os error 13)".to_string(),
            },
        });
        assert!(matches!(err, Error::PermissionDenied(_)));
        assert_eq!(err.code(), "permission_denied");
    }

    #[test]
    fn other_backend_failure_is_audio_error() {
        let err = map_build_error(BuildStreamError::BackendSpecific {
            err: BackendSpecificError {
                description: "buffer size mismatch".to_string(),
            },
        });
        assert!(matches!(err, Error::Audio(_)));
    }

    #[test]
    fn zero_frame_size_is_a_config_error() {
        let result = AudioCapture::new(SAMPLE_RATE, 0);
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
