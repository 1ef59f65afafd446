//! # kiln-web
//!
//! A one-page web UI for a fine-tuned artifact: a prompt box, an image, a
//! "Dream" button, and example prompts, backed by a JSON endpoint that returns
//! PNG bytes.

pub mod handlers;
pub mod page;
pub mod state;

pub use handlers::{ApiError, DreamRequest};
pub use state::{SharedState, WebState};

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use kiln_types::KilnResult;
use tracing::{info, warn};

/// Stylesheet, favicon, and background shipped with the crate.
pub const BUNDLED_ASSETS_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/assets");

pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(handlers::index))
        .route("/health", get(handlers::health_check))
        .route("/api/examples", get(handlers::examples))
        .route("/api/dream", post(handlers::dream))
        .route("/favicon.ico", get(handlers::favicon))
        .route("/assets/background.svg", get(handlers::background))
        .route("/assets/index.css", get(handlers::stylesheet))
        .with_state(state)
}

/// Serve the UI on `addr` until Ctrl-C.
pub async fn serve(state: WebState, addr: &str) -> KilnResult<()> {
    let app = create_router(Arc::new(state));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Dreambooth UI listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("Dreambooth UI stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
        std::future::pending::<()>().await;
    }
}
