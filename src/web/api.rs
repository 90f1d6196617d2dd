//! REST glue (§4.M): settings, repos and sessions handlers over
//! [`AppState`]. Grounded on the teacher's `web/api.rs` routing shape;
//! the session endpoints call into the session-manager contract of
//! §4.E instead of the teacher's daemon-specific `SessionManager`.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::config::paths;
use crate::{Error, Result};

use super::server::AppState;

pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/settings", get(list_settings))
        .route("/api/settings/{key}", get(get_setting))
        .route("/api/settings/{key}", put(put_setting))
        .route("/api/settings/{key}", delete(delete_setting))
        .route("/api/repos", get(list_repos))
        .route("/api/repos", post(create_repo))
        .route("/api/repos/{id}", delete(delete_repo))
        .route("/api/repos/{id}/sync", post(sync_repo))
        .route("/api/repos/{id}/branches", get(repo_branches))
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/{id}", delete(kill_session))
}

// ── Health ────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct CliStatus {
    name: String,
    installed: bool,
    authed: bool,
    path: Option<String>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    clis: Vec<CliStatus>,
    git: bool,
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let clis = state
        .config
        .allowed_clis
        .iter()
        .map(|name| match which::which(name) {
            Ok(path) => CliStatus {
                name: name.clone(),
                installed: true,
                authed: true,
                path: Some(path.display().to_string()),
            },
            Err(_) => CliStatus {
                name: name.clone(),
                installed: false,
                authed: false,
                path: None,
            },
        })
        .collect();

    Json(HealthResponse {
        status: "ok",
        clis,
        git: which::which("git").is_ok(),
    })
}

// ── Settings ──────────────────────────────────────────────────────────

async fn list_settings(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>> {
    let settings = state
        .store
        .list_settings()
        .await
        .map_err(Error::Internal)?;
    Ok(Json(serde_json::to_value(settings).map_err(|e| Error::Internal(e.into()))?))
}

async fn get_setting(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let value = state.store.get_setting(&key).await.map_err(Error::Internal)?;
    match value {
        Some(v) => Ok(Json(serde_json::json!({ "key": key, "value": v }))),
        None => Err(Error::NotFound(format!("setting {key} not found"))),
    }
}

#[derive(Deserialize)]
struct SettingBody {
    value: String,
}

async fn put_setting(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Json(body): Json<SettingBody>,
) -> Result<Json<serde_json::Value>> {
    state
        .store
        .set_setting(&key, &body.value)
        .await
        .map_err(Error::Internal)?;
    Ok(Json(serde_json::json!({ "key": key, "value": body.value })))
}

async fn delete_setting(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let removed = state.store.delete_setting(&key).await.map_err(Error::Internal)?;
    if removed {
        Ok(Json(serde_json::json!({ "deleted": true })))
    } else {
        Err(Error::NotFound(format!("setting {key} not found")))
    }
}

// ── Repos ─────────────────────────────────────────────────────────────

async fn list_repos(State(state): State<Arc<AppState>>) -> Result<Json<Vec<crate::store::Repo>>> {
    Ok(Json(state.store.list_repos().await.map_err(Error::Internal)?))
}

#[derive(Deserialize)]
struct CreateRepoRequest {
    name: String,
    local_path: String,
    #[serde(default = "default_branch")]
    default_branch: String,
}

fn default_branch() -> String {
    "main".to_string()
}

async fn create_repo(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateRepoRequest>,
) -> Result<Json<crate::store::Repo>> {
    let repo = state
        .store
        .add_repo(&body.name, &body.local_path, &body.default_branch)
        .await
        .map_err(Error::Internal)?;
    Ok(Json(repo))
}

async fn delete_repo(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let removed = state.store.remove_repo(&id).await.map_err(Error::Internal)?;
    if removed {
        Ok(Json(serde_json::json!({ "deleted": true })))
    } else {
        Err(Error::NotFound(format!("repo {id} not found")))
    }
}

/// Git sync is explicitly out of scope; this acknowledges the request
/// without touching any working copy.
async fn sync_repo(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    state
        .store
        .get_repo(&id)
        .await
        .map_err(Error::Internal)?
        .ok_or_else(|| Error::NotFound(format!("repo {id} not found")))?;
    Ok(Json(serde_json::json!({ "synced": false, "reason": "sync is not implemented" })))
}

async fn repo_branches(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<String>>> {
    let repo = state
        .store
        .get_repo(&id)
        .await
        .map_err(Error::Internal)?
        .ok_or_else(|| Error::NotFound(format!("repo {id} not found")))?;
    Ok(Json(vec![repo.default_branch]))
}

// ── Sessions ──────────────────────────────────────────────────────────

async fn list_sessions(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<crate::ipc::SessionSummary>>> {
    Ok(Json(state.manager.list().await?))
}

#[derive(Deserialize)]
struct CreateSessionRequest {
    cli: String,
    work_dir: String,
    #[serde(default = "default_rows")]
    rows: u16,
    #[serde(default = "default_cols")]
    cols: u16,
}

fn default_rows() -> u16 {
    40
}
fn default_cols() -> u16 {
    120
}

async fn create_session(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateSessionRequest>,
) -> Result<Json<crate::ipc::SessionSummary>> {
    if !state.config.is_cli_allowed(&body.cli) {
        return Err(Error::Unauthorized(format!("{} is not allow-listed", body.cli)));
    }

    let id = uuid::Uuid::new_v4().to_string();
    let handle = state
        .manager
        .start(&id, &body.cli, &body.work_dir, body.rows, body.cols)
        .await?;

    state
        .store
        .record_session_started(&id, &body.cli, &body.work_dir)
        .await
        .map_err(Error::Internal)?;

    Ok(Json(crate::ipc::SessionSummary {
        session_id: id,
        cli: body.cli,
        work_dir: body.work_dir,
        state: crate::ipc::SessionState::Running,
        pid: Some(handle.pid()),
        rows: body.rows,
        cols: body.cols,
        created_unix: now_unix(),
    }))
}

fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Deserialize)]
struct KillSessionQuery {
    #[serde(default)]
    delete_local: bool,
}

async fn kill_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<KillSessionQuery>,
) -> Result<Json<serde_json::Value>> {
    state.manager.stop(&id).await?;
    state
        .store
        .mark_session_stopped(&id)
        .await
        .map_err(Error::Internal)?;

    if query.delete_local {
        if let Ok(dir) = paths::worktree_dir(&id) {
            let _ = std::fs::remove_dir_all(dir);
        }
    }

    Ok(Json(serde_json::json!({ "stopped": true })))
}
