//! HTTP provisioning surface: thin validators over the Wi-Fi manager
//! plus the captive-portal redirect middleware.

pub mod captive;
pub mod provision;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::wifi::WifiManager;
use crate::Result;

pub struct AppState {
    pub wifi: Arc<WifiManager>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/provision", get(provision::provision_page))
        .route("/api/Admin/Provision/networks", get(provision::networks))
        .route("/api/Admin/Provision/connect", post(provision::connect))
        .route("/api/Admin/Provision/status", get(provision::status))
        .route("/api/Admin/Provision/start", post(provision::start))
        .route("/api/Admin/Provision/stop", post(provision::stop))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            captive::redirect_captive_clients,
        ))
        .with_state(state)
}

/// Serve the provisioning surface until the token fires.
pub async fn serve(state: Arc<AppState>, addr: SocketAddr, cancel: CancellationToken) -> Result<()> {
    let app = router(state);
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "provisioning http server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    tracing::info!("provisioning http server stopped");
    Ok(())
}
