//! HTTP API server for the voice relay

pub mod health;
pub mod websocket;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::relay::SessionRelay;
use crate::Result;

/// Shared state for API handlers
#[derive(Debug, Clone)]
pub struct ApiState {
    pub relay: SessionRelay,
    /// Outbound queue depth per client connection
    pub client_queue: usize,
}

/// API server
pub struct ApiServer {
    state: Arc<ApiState>,
    addr: SocketAddr,
}

impl ApiServer {
    /// Create a server for `relay` listening on `addr`
    #[must_use]
    pub fn new(relay: SessionRelay, addr: SocketAddr, client_queue: usize) -> Self {
        Self {
            state: Arc::new(ApiState {
                relay,
                client_queue,
            }),
            addr,
        }
    }

    /// Build the router with all routes
    #[must_use]
    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            .nest("/ws", websocket::router(self.state.clone()))
            .merge(health::router(self.state.clone()))
            .layer(cors)
            .layer(TraceLayer::new_for_http())
    }

    /// Run the API server until `shutdown` resolves, then tear down every
    /// session
    ///
    /// # Errors
    ///
    /// Returns error if server fails to bind or run
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
        let listener = TcpListener::bind(self.addr)
            .await
            .map_err(|e| crate::Error::Config(format!("failed to bind API server: {e}")))?;

        self.serve(listener, shutdown).await
    }

    /// Serve on an already bound listener
    ///
    /// # Errors
    ///
    /// Returns error if the server fails while running
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        let addr = listener.local_addr()?;
        tracing::info!(%addr, "API server listening");

        let relay = self.state.relay.clone();
        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                shutdown.await;
                relay.shutdown().await;
            })
            .await
            .map_err(|e| crate::Error::Config(format!("API server error: {e}")))?;

        Ok(())
    }

    /// Run the API server in a background task
    #[must_use]
    pub fn spawn(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> tokio::task::JoinHandle<Result<()>> {
        tokio::spawn(async move { self.run(shutdown).await })
    }
}
