//! The WebSocket terminal bridge (§4.F): replay-then-subscribe ordering,
//! a 60s pong-extended read deadline, a 30s ping ticker, and a 10s output
//! write deadline. Grounded on the teacher's `web/websocket.rs`
//! (`ws_handler`/`handle_socket_inner`), generalized from a PTY-index
//! query parameter to the [`crate::session_manager::SessionManager`]
//! contract and from the teacher's broadcast-based PTY output channel to
//! [`crate::session_manager::OutputSubscription`].

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tokio::time::Instant;

use super::server::AppState;

const READ_DEADLINE: Duration = Duration::from_secs(60);
const PING_INTERVAL: Duration = Duration::from_secs(30);
const WRITE_DEADLINE: Duration = Duration::from_secs(10);

pub fn ws_routes() -> Router<Arc<AppState>> {
    Router::new().route("/ws/session/{id}", get(ws_handler))
}

async fn ws_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let Some(handle) = state.manager.get(&id).await else {
        return axum::http::StatusCode::NOT_FOUND.into_response();
    };

    ws.on_upgrade(move |socket| async move {
        tracing::info!(session = %id, "websocket connected");
        if let Err(e) = run_bridge(socket, state, id.clone(), handle).await {
            tracing::warn!(session = %id, error = %e, "websocket bridge ended with an error");
        }
        tracing::info!(session = %id, "websocket disconnected");
    })
    .into_response()
}

#[derive(Deserialize)]
struct ResizeData {
    rows: u16,
    cols: u16,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum ControlMessage {
    Resize { data: ResizeData },
    #[serde(other)]
    Unknown,
}

async fn run_bridge(
    mut socket: WebSocket,
    state: Arc<AppState>,
    session_id: String,
    handle: Arc<dyn crate::session_manager::SessionHandle>,
) -> anyhow::Result<()> {
    let replay = handle.replay().await;
    if !replay.is_empty() {
        socket.send(Message::Binary(replay.to_vec().into())).await?;
    }
    let mut subscription = handle.subscribe().await;

    let mut read_deadline = Instant::now() + READ_DEADLINE;
    let mut ping_ticker = tokio::time::interval(PING_INTERVAL);
    ping_ticker.tick().await; // first tick fires immediately; consume it

    loop {
        tokio::select! {
            biased;

            () = handle.done() => {
                let _ = socket
                    .send(Message::Close(Some(CloseFrame {
                        code: axum::extract::ws::close_code::NORMAL,
                        reason: "session ended".into(),
                    })))
                    .await;
                return Ok(());
            }

            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        let _ = handle.write(&data).await;
                    }
                    Some(Ok(Message::Text(text))) => {
                        if let Ok(ControlMessage::Resize { data }) =
                            serde_json::from_str::<ControlMessage>(&text)
                        {
                            let _ = state.manager.resize(&session_id, data.rows, data.cols).await;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        read_deadline = Instant::now() + READ_DEADLINE;
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        // Ordinary protocol traffic (browsers/proxies may send these
                        // unprompted) — answer it and keep the bridge open.
                        socket.send(Message::Pong(payload)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Err(e)) => return Err(e.into()),
                }
            }

            chunk = subscription.recv() => {
                match chunk {
                    Some(bytes) => {
                        let send = socket.send(Message::Binary(bytes.to_vec().into()));
                        if tokio::time::timeout(WRITE_DEADLINE, send).await.is_err() {
                            anyhow::bail!("websocket write deadline exceeded");
                        }
                    }
                    None => return Ok(()),
                }
            }

            _ = ping_ticker.tick() => {
                socket.send(Message::Ping(Vec::new().into())).await?;
            }

            () = tokio::time::sleep_until(read_deadline) => {
                anyhow::bail!("no client activity within the read deadline");
            }
        }
    }
}

