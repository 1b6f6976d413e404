//! Per-session response forwarding task

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::oneshot;

use super::SessionRelay;
use super::state::{Delivery, SessionState, TeardownReason};
use crate::protocol::{AudioFrame, Envelope};
use crate::upstream::{ResponseChunk, ResponseStream};

/// Downstream audio sequencing for one session
struct OutboundClock {
    sample_rate: u32,
    seq: u64,
    samples: u64,
}

impl OutboundClock {
    fn frame(&mut self, pcm: bytes::Bytes) -> AudioFrame {
        let timestamp_ms = if self.sample_rate == 0 {
            0
        } else {
            self.samples * 1000 / u64::from(self.sample_rate)
        };
        let frame = AudioFrame {
            seq: self.seq,
            timestamp_ms,
            sample_rate: self.sample_rate,
            pcm,
        };
        self.seq += 1;
        self.samples += frame.sample_count() as u64;
        frame
    }
}

/// Pull upstream responses and forward them to the client until the session
/// ends, then tear it down with the reason that ended it
///
/// Returns without teardown if cancelled, since the canceller owns teardown.
pub(super) async fn run(
    relay: SessionRelay,
    state: Arc<SessionState>,
    mut responses: ResponseStream,
    mut cancel: oneshot::Receiver<()>,
    idle_timeout: Duration,
    output_sample_rate: u32,
) {
    let session_id = state.id().to_string();
    let mut clock = OutboundClock {
        sample_rate: output_sample_rate,
        seq: 0,
        samples: 0,
    };

    let reason = loop {
        let deadline = state.last_activity() + idle_timeout;

        tokio::select! {
            biased;

            _ = &mut cancel => return,

            () = state.client().closed() => break TeardownReason::ClientDisconnected,

            chunk = responses.next() => {
                let envelope = match chunk {
                    Some(Ok(ResponseChunk::Audio(pcm))) => {
                        Envelope::audio(&clock.frame(pcm), Some(&session_id))
                    }
                    Some(Ok(ResponseChunk::Text(text))) => Envelope::text(text, Some(&session_id)),
                    Some(Err(e)) => {
                        tracing::warn!(session_id = %session_id, error = %e, "upstream stream failed");
                        break TeardownReason::Transport(e.to_string());
                    }
                    None => break TeardownReason::UpstreamTerminated,
                };

                state.touch();
                match state.forward(envelope) {
                    Some(Delivery::Sent) => {}
                    Some(Delivery::Dropped) => {
                        tracing::warn!(session_id = %session_id, "client queue full, dropping response chunk");
                    }
                    Some(Delivery::Closed) => break TeardownReason::ClientDisconnected,
                    // Teardown is under way and owns the rest
                    None => return,
                }
            }

            () = tokio::time::sleep_until(deadline) => {
                // Client frames may have touched the session while we slept
                if state.last_activity() + idle_timeout <= tokio::time::Instant::now() {
                    break TeardownReason::IdleTimeout;
                }
            }
        }
    };

    tracing::debug!(session_id = %session_id, reason = reason.as_str(), "session task ending");
    // Dropping the stream before teardown ends upstream consumption
    drop(responses);
    relay.teardown(&session_id, reason).await;
}
