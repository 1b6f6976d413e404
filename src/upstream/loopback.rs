//! Local echo service
//!
//! Returns every audio chunk it receives. Used when no upstream URL is
//! configured, for device checks and demos.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use futures::stream;

use super::{ResponseChunk, SessionParams, UpstreamHandle, UpstreamService, UpstreamSession};
use crate::Result;
use crate::relay::Backlog;

/// Echo upstream
#[derive(Debug, Clone)]
pub struct LoopbackUpstream {
    backlog: usize,
}

impl LoopbackUpstream {
    /// Create an echo service buffering up to `backlog` chunks per session
    #[must_use]
    pub const fn new(backlog: usize) -> Self {
        Self { backlog }
    }
}

#[async_trait]
impl UpstreamService for LoopbackUpstream {
    fn name(&self) -> &'static str {
        "loopback"
    }

    async fn create_session(&self, params: &SessionParams) -> Result<UpstreamSession> {
        tracing::debug!(session_id = %params.session_id, "loopback session started");

        let backlog = Arc::new(Backlog::new(self.backlog));
        let responses = stream::unfold(Arc::clone(&backlog), |backlog| async move {
            let pcm = backlog.pop().await?;
            Some((Ok(ResponseChunk::Audio(pcm)), backlog))
        })
        .boxed();

        Ok(UpstreamSession {
            handle: Arc::new(LoopbackHandle { backlog }),
            responses,
        })
    }
}

struct LoopbackHandle {
    backlog: Arc<Backlog<Bytes>>,
}

#[async_trait]
impl UpstreamHandle for LoopbackHandle {
    fn send_audio(&self, pcm: Bytes) {
        self.backlog.push(pcm);
    }

    async fn close(&self) {
        self.backlog.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echoes_audio_until_closed() {
        let upstream = LoopbackUpstream::new(4);
        let params = SessionParams {
            session_id: "s".to_string(),
            input_sample_rate: 16_000,
            output_sample_rate: 16_000,
        };
        let session = upstream.create_session(&params).await.unwrap();

        session.handle.send_audio(Bytes::from_static(b"ab"));
        session.handle.send_audio(Bytes::from_static(b"cd"));
        session.handle.close().await;

        let echoed: Vec<_> = session.responses.collect().await;
        assert_eq!(echoed.len(), 2);
        assert_eq!(
            echoed[1].as_ref().unwrap(),
            &ResponseChunk::Audio(Bytes::from_static(b"cd"))
        );
    }
}
