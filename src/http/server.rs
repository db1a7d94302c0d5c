//! HTTP server implementation.

use std::net::SocketAddr;

use axum::{middleware, routing::get, Router};
use tokio::net::TcpListener;
use tracing::{error, info};

use super::middleware::{admission_middleware, AdmissionState};
use crate::error::{GatekeeperError, Result};

/// Body served by the demo handler behind the admission layer.
pub const WELCOME_MESSAGE: &str = "Welcome to the rate-limited server!";

async fn welcome() -> &'static str {
    WELCOME_MESSAGE
}

/// Build the router with every route behind the admission middleware.
pub fn router(state: AdmissionState) -> Router {
    Router::new()
        .route("/", get(welcome))
        .layer(middleware::from_fn_with_state(state, admission_middleware))
}

/// HTTP server fronted by the admission layer.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Middleware state
    state: AdmissionState,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(addr: SocketAddr, state: AdmissionState) -> Self {
        Self { addr, state }
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        info!(
            addr = %self.addr,
            failure_mode = ?self.state.failure_mode(),
            "Starting HTTP server with admission control"
        );

        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
            GatekeeperError::Io(e)
        })?;

        let app = router(self.state).into_make_service_with_connect_info::<SocketAddr>();

        axum::serve(listener, app)
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                GatekeeperError::Server(e.to_string())
            })
    }
}
