//! Voice client
//!
//! [`VoiceClient`] is owned by its caller and bundles the microphone, the
//! playback scheduler and the relay connection. Nothing is process-global:
//! two clients are two independent sessions.

mod connection;

use tokio::sync::mpsc;

pub use connection::{ClientEvent, Connection};

use crate::Result;
use crate::config::AudioConfig;
use crate::protocol::AudioFrame;
use crate::voice::{AudioCapture, AudioPlayback, PlaybackScheduler};

/// Captured frames held between the audio callback and the socket
const FRAME_QUEUE: usize = 8;

/// A duplex voice session with a relay
pub struct VoiceClient {
    audio: AudioConfig,
    capture: Option<AudioCapture>,
    playback: PlaybackScheduler<AudioPlayback>,
    frames: mpsc::Sender<AudioFrame>,
    connection: Connection,
    stopped: bool,
}

impl VoiceClient {
    /// Open the speaker, connect to the relay at `url` and request a session
    ///
    /// The microphone is not touched until [`Self::start_capture`].
    ///
    /// # Errors
    ///
    /// Returns `Error::DeviceUnavailable` if there is no usable output
    /// device, or `Error::Transport` if the relay cannot be reached
    pub async fn connect(url: &str, audio: AudioConfig) -> Result<Self> {
        let mut playback = PlaybackScheduler::new(AudioPlayback::new(audio.output_sample_rate)?);
        playback.start()?;

        let (frames, frames_rx) = mpsc::channel(FRAME_QUEUE);
        let connection = Connection::open(url, frames_rx, playback.queue()).await?;

        Ok(Self {
            audio,
            capture: None,
            playback,
            frames,
            connection,
            stopped: false,
        })
    }

    /// Start streaming the microphone
    ///
    /// # Errors
    ///
    /// Returns `Error::PermissionDenied` or `Error::DeviceUnavailable`; the
    /// relay session is unaffected either way
    pub fn start_capture(&mut self) -> Result<()> {
        if self.capture.is_some() {
            return Ok(());
        }

        let mut capture = AudioCapture::new(self.audio.input_sample_rate, self.audio.frame_samples)?;
        capture.start(self.frames.clone())?;
        self.capture = Some(capture);
        Ok(())
    }

    /// Wait until the relay acknowledges the session
    ///
    /// # Errors
    ///
    /// Returns the error the relay reported instead, such as
    /// `Error::UpstreamUnavailable` or `Error::SessionExpired`
    pub async fn wait_for_session(&mut self) -> Result<String> {
        self.connection.wait_for_session().await
    }

    /// Next lifecycle event from the relay
    pub async fn next_event(&mut self) -> Option<ClientEvent> {
        self.connection.next_event().await
    }

    /// Halt capture and playback and end the session
    ///
    /// Both device streams are released and queued audio is discarded before
    /// this returns.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        if let Some(mut capture) = self.capture.take() {
            capture.stop();
        }
        self.playback.stop();
        self.connection.stop();
        tracing::info!(
            played = self.playback.stats().played(),
            underruns = self.playback.stats().underruns(),
            "voice client stopped"
        );
    }
}

impl Drop for VoiceClient {
    fn drop(&mut self) {
        self.stop();
    }
}
