//! HTTP server module
//!
//! Serves agent health and, with the Prometheus reporter, the latest
//! collected points.

pub mod handlers;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{http::Method, routing::get, Router};
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::app::AgentHealth;
use crate::config::ServerConfig;
use crate::reporter::PrometheusReporter;

/// State shared across handlers
#[derive(Clone)]
pub struct ServerState {
    pub config: Arc<ServerConfig>,
    pub health: AgentHealth,
    /// Present when the Prometheus reporter is selected
    pub exporter: Option<Arc<PrometheusReporter>>,
}

/// Build the router; the metrics path is only routed with an exporter
pub fn router(state: ServerState) -> Router {
    let mut app = Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health));
    if state.exporter.is_some() {
        app = app.route(&state.config.path, get(handlers::metrics));
    }
    let cors = CorsLayer::new()
        .allow_methods([Method::GET])
        .allow_origin(Any);
    app.layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(cors),
    )
    .with_state(state)
}

/// Run the HTTP server until `shutdown` resolves
///
/// # Errors
/// Returns an error if the bind address is invalid or the server fails to
/// start
pub async fn run<F>(state: ServerState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let bind_address = state.config.bind_address.clone();
    let port = state.config.port;

    // Handle "localhost" specially, otherwise parse as IP address
    let bind_addr: std::net::IpAddr = if bind_address == "localhost" {
        std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST)
    } else {
        bind_address
            .parse()
            .map_err(|e| anyhow::anyhow!("Invalid bind_address '{}': {}. Use an IP address (e.g., '0.0.0.0', '127.0.0.1') or 'localhost'.", bind_address, e))?
    };
    let addr = SocketAddr::from((bind_addr, port));
    info!(address = %addr, metrics_path = %state.config.path, "Server listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    serve(listener, state, shutdown).await
}

/// Serve on an already bound listener until `shutdown` resolves
pub async fn serve<F>(listener: tokio::net::TcpListener, state: ServerState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        }
    }
}
