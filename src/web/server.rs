//! The server's axum app: REST glue (§4.M) plus the WebSocket terminal
//! bridge (§4.F), sharing one [`AppState`]. Grounded on the teacher's
//! `web/server.rs` (`WebState`/`create_router`/`start_web_server`).

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::session_manager::SessionManager;
use crate::store::Store;

/// State shared across all web request handlers.
pub struct AppState {
    pub manager: Arc<dyn SessionManager>,
    pub config: Arc<Config>,
    pub store: Store,
}

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(super::api::api_routes())
        .merge(super::websocket::ws_routes())
        .merge(super::assets::asset_routes())
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Starts the user-facing HTTP/WS server and performs the startup
/// reconciliation described in §7 before serving.
pub async fn start_server(
    host: &str,
    port: u16,
    manager: Arc<dyn SessionManager>,
    config: Arc<Config>,
    store: Store,
) -> Result<()> {
    let live = manager
        .list()
        .await
        .context("failed to list sessions from the session manager")?
        .into_iter()
        .map(|s| s.session_id)
        .collect::<Vec<_>>();
    store
        .reconcile_with_live_sessions(&live)
        .await
        .context("failed to reconcile session records at startup")?;

    let state = Arc::new(AppState {
        manager,
        config,
        store,
    });
    let app = create_router(state);

    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tracing::info!(%addr, "server listening");
    axum::serve(listener, app).await.context("server error")
}
