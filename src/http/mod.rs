//! HTTP API Module
//!
//! The service surface: delta ingestion from the graph store, a health
//! probe, per-type search, and index management. Handlers receive the
//! shared application state through an `Extension` layer and answer JSON
//! with a uniform error envelope.

pub mod error;
pub mod handlers;

use crate::config::Config;
use crate::delta::DeltaHandler;
use crate::index_manager::IndexManager;
use crate::rdf::client::RdfClientPool;
use crate::schema::Schema;
use crate::search_client::SearchClient;
use crate::update_handler::UpdateHandler;
use axum::{
    routing::{delete, get, post},
    Extension, Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::info;

/// Shared state injected into every handler.
pub struct AppState {
    pub config: Arc<Config>,
    pub schema: Arc<Schema>,
    pub delta: DeltaHandler,
    pub updates: Arc<UpdateHandler>,
    pub manager: Arc<IndexManager>,
    pub search: Arc<SearchClient>,
    pub rdf: Arc<RdfClientPool>,
}

/// Creates the Axum router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/update", post(handlers::post_update))
        .route("/health", get(handlers::health))
        .route("/:type/search", post(handlers::search))
        .route("/:type/search/raw", post(handlers::search_raw))
        .route("/:type/index", post(handlers::reindex))
        .route("/:type/invalidate", post(handlers::invalidate))
        .route("/:type", delete(handlers::remove))
        .layer(Extension(state))
        // Delta messages can be large, but not unbounded.
        .layer(RequestBodyLimitLayer::new(64 * 1024 * 1024))
}

/// Starts the HTTP server with graceful shutdown support.
///
/// Listens for SIGINT (ctrl-c) and SIGTERM; once the server stops accepting
/// connections, the shutdown channel tells the background workers to drain
/// and persist.
pub async fn start_http_server(
    state: Arc<AppState>,
    shutdown_tx: tokio::sync::watch::Sender<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let app = create_router(Arc::clone(&state));
    let addr: SocketAddr = format!("{}:{}", state.config.host, state.config.port).parse()?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(address = %addr, "http_server_listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(termination_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    Ok(())
}

/// Resolves when the process is asked to stop: SIGINT everywhere, SIGTERM
/// where the platform has it.
async fn termination_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate()).expect("SIGTERM listener");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!(signal = "SIGINT", "termination_requested");
            }
            _ = sigterm.recv() => {
                info!(signal = "SIGTERM", "termination_requested");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "signal_listener_failed");
            return;
        }
        info!(signal = "SIGINT", "termination_requested");
    }
}
