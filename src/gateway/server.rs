//! Gateway app assembly (§4.I): shared state, router, and the
//! unauthenticated health endpoint. Grounded on the teacher's
//! `web/server.rs` shape (one state struct, one router-builder function);
//! the teacher has no gateway analog, so the auth/tunnel concerns
//! themselves are grounded per-module in `auth.rs`/`proxy.rs`.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::middleware;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use rand::RngCore;
use serde::Serialize;
use tokio::sync::Mutex;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

use super::proxy::TunnelHandle;

/// Runtime configuration, sourced from the environment (§6).
pub struct GatewayConfig {
    pub username: String,
    pub password: String,
    pub tunnel_secret: String,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self> {
        let username = std::env::var("SP_USERNAME").context("SP_USERNAME must be set")?;
        let password = std::env::var("SP_PASSWORD").context("SP_PASSWORD must be set")?;
        let tunnel_secret = std::env::var("SP_GATEWAY_SECRET").unwrap_or_else(|_| {
            let mut bytes = [0u8; 32];
            rand::rng().fill_bytes(&mut bytes);
            use base64::Engine;
            base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
        });
        Ok(Self {
            username,
            password,
            tunnel_secret,
        })
    }
}

pub struct GatewayState {
    pub username: String,
    pub password: String,
    pub tunnel_secret: String,
    /// The random key minted at process start that signs session cookies
    /// (§4.I): restarting the gateway invalidates every outstanding session.
    pub session_key: [u8; 32],
    pub tunnel: Mutex<Option<Arc<TunnelHandle>>>,
}

impl GatewayState {
    pub fn new(config: GatewayConfig) -> Arc<Self> {
        let mut session_key = [0u8; 32];
        rand::rng().fill_bytes(&mut session_key);
        Arc::new(Self {
            username: config.username,
            password: config.password,
            tunnel_secret: config.tunnel_secret,
            session_key,
            tunnel: Mutex::new(None),
        })
    }
}

pub fn create_router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route("/auth/login", get(super::auth::login_page).post(super::auth::login_submit))
        .route("/auth/logout", post(super::auth::logout))
        .route("/gateway/health", get(gateway_health))
        .route("/tunnel", get(super::proxy::tunnel_upgrade))
        .fallback(super::proxy::proxy_handler)
        .layer(middleware::from_fn_with_state(state.clone(), super::auth::require_auth))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct GatewayHealth {
    status: &'static str,
    gateway: bool,
    connected: bool,
}

async fn gateway_health(State(state): State<Arc<GatewayState>>) -> impl IntoResponse {
    let connected = state.tunnel.lock().await.is_some();
    Json(GatewayHealth {
        status: "ok",
        gateway: true,
        connected,
    })
}
