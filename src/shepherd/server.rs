//! The shepherd process loop: socket lifecycle, per-connection command
//! dispatch, and Exited fan-out to every connected client. Grounded on the
//! teacher's `daemon/server.rs` (`DaemonServer::run`/`handle_client`),
//! generalized from the teacher's private message-length codec to the
//! tagged [`StreamCodec`] and from a single attach target to the session
//! manager contract of §4.E.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{broadcast, Mutex};
use tokio_util::codec::Framed;

use crate::config::{paths, Config};
use crate::ipc::{Command, Event, Frame, FrameType, Request, Response, StreamCodec};
use crate::session_manager::local::LocalManager;
use crate::session_manager::SessionManager;

/// Runs the shepherd until it receives a shutdown signal or goes idle.
/// Returns an error (and the process should exit nonzero) if another
/// shepherd is already running.
pub async fn run(config: Arc<Config>) -> Result<()> {
    let socket_path = paths::shepherd_socket_path()?;
    let pid_path = paths::shepherd_pid_path()?;
    paths::ensure_dirs()?;

    if socket_path.exists() {
        if UnixStream::connect(&socket_path).await.is_ok() {
            anyhow::bail!("a shepherd is already running at {}", socket_path.display());
        }
        reclaim_stale_files(&socket_path, &pid_path)?;
    }

    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("failed to bind {}", socket_path.display()))?;
    std::fs::write(&pid_path, std::process::id().to_string())
        .with_context(|| format!("failed to write pid file {}", pid_path.display()))?;

    tracing::info!(socket = %socket_path.display(), "shepherd listening");

    let manager = LocalManager::new(config.clone());
    let (exited_tx, _) = broadcast::channel::<String>(256);

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut sigint = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::interrupt())?;

    let idle_timeout = config.shepherd_idle_timeout();
    let mut idle_since = tokio::time::Instant::now();

    loop {
        tokio::select! {
            accept = listener.accept() => {
                match accept {
                    Ok((stream, _)) => {
                        idle_since = tokio::time::Instant::now();
                        let manager = manager.clone();
                        let exited_tx = exited_tx.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, manager, exited_tx).await {
                                tracing::warn!(error = %e, "shepherd connection handler ended with an error");
                            }
                        });
                    }
                    Err(e) => tracing::error!(error = %e, "accept failed"),
                }
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
                break;
            }
            _ = sigint.recv() => {
                tracing::info!("received SIGINT, shutting down");
                break;
            }
            _ = tokio::time::sleep(idle_timeout) => {
                if manager.list().await.map(|s| s.is_empty()).unwrap_or(false)
                    && idle_since.elapsed() >= idle_timeout
                {
                    tracing::info!("idle timeout reached, shutting down");
                    break;
                }
            }
        }
    }

    let _ = manager.stop_all().await;
    let _ = std::fs::remove_file(&socket_path);
    let _ = std::fs::remove_file(&pid_path);
    tracing::info!("shepherd exited cleanly");
    Ok(())
}

fn reclaim_stale_files(socket_path: &std::path::Path, pid_path: &std::path::Path) -> Result<()> {
    if let Ok(contents) = std::fs::read_to_string(pid_path) {
        if let Ok(pid) = contents.trim().parse::<i32>() {
            let alive = nix::sys::signal::kill(nix::unistd::Pid::from_raw(pid), None).is_ok();
            if alive {
                anyhow::bail!("shepherd pid file points at a live process ({pid})");
            }
        }
    }
    let _ = std::fs::remove_file(socket_path);
    let _ = std::fs::remove_file(pid_path);
    Ok(())
}

type WireSink = Arc<Mutex<SplitSink<Framed<UnixStream, StreamCodec>, Frame>>>;

async fn handle_connection(
    stream: UnixStream,
    manager: Arc<LocalManager>,
    exited_tx: broadcast::Sender<String>,
) -> Result<()> {
    let framed = Framed::new(stream, StreamCodec);
    let (sink, mut stream) = framed.split();
    let sink: WireSink = Arc::new(Mutex::new(sink));

    let mut exited_rx = exited_tx.subscribe();
    let exited_sink = sink.clone();
    let exited_task = tokio::spawn(async move {
        while let Ok(session_id) = exited_rx.recv().await {
            let event = Response::notification(Event::Exited { session_id });
            if send_event(&exited_sink, event).await.is_err() {
                break;
            }
        }
    });

    let result = read_loop(&mut stream, &sink, &manager, &exited_tx).await;
    exited_task.abort();
    result
}

async fn read_loop(
    stream: &mut futures_util::stream::SplitStream<Framed<UnixStream, StreamCodec>>,
    sink: &WireSink,
    manager: &Arc<LocalManager>,
    exited_tx: &broadcast::Sender<String>,
) -> Result<()> {
    while let Some(frame) = stream.next().await {
        let frame = frame.context("shepherd connection read error")?;
        match frame.frame_type {
            FrameType::Control => {
                let request: Request = match serde_json::from_slice(&frame.payload) {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(error = %e, "malformed control frame");
                        continue;
                    }
                };
                let event = dispatch(request.command, manager, sink, exited_tx).await;
                send_event(sink, Response::reply(request.id, event)).await?;
            }
            FrameType::Input => {
                if let Some((session_id, data)) = frame.session_scoped() {
                    if let Some(handle) = manager.get(&session_id).await {
                        let _ = handle.write(&data).await;
                    }
                }
            }
            FrameType::Output => {
                tracing::warn!("client sent an Output frame; ignoring");
            }
        }
    }
    Ok(())
}

async fn dispatch(
    command: Command,
    manager: &Arc<LocalManager>,
    sink: &WireSink,
    exited_tx: &broadcast::Sender<String>,
) -> Event {
    match command {
        Command::Start {
            session_id,
            cli,
            work_dir,
            rows,
            cols,
        } => match manager.start(&session_id, &cli, &work_dir, rows, cols).await {
            Ok(handle) => {
                let pid = handle.pid();
                let exited_tx = exited_tx.clone();
                let id_for_exit = session_id.clone();
                tokio::spawn(async move {
                    handle.done().await;
                    let _ = exited_tx.send(id_for_exit);
                });
                Event::Started { session_id, pid }
            }
            Err(e) => Event::error_for_session(e.wire_code(), e.to_string(), session_id),
        },

        Command::Stop { session_id } => match manager.stop(&session_id).await {
            Ok(()) => Event::Stopped { session_id },
            Err(e) => Event::error_for_session(e.wire_code(), e.to_string(), session_id),
        },

        Command::Resize {
            session_id,
            rows,
            cols,
        } => match manager.resize(&session_id, rows, cols).await {
            Ok(()) => Event::Resized { session_id },
            Err(e) => Event::error_for_session(e.wire_code(), e.to_string(), session_id),
        },

        Command::Replay { session_id } => match manager.get(&session_id).await {
            Some(handle) => {
                use base64::Engine;
                let data = base64::engine::general_purpose::STANDARD.encode(handle.replay().await);
                Event::Replay { session_id, data }
            }
            None => Event::error_for_session(
                crate::ipc::ERR_NOT_FOUND,
                format!("session {session_id} not found"),
                session_id,
            ),
        },

        Command::Subscribe { session_id } => match manager.get(&session_id).await {
            Some(handle) => {
                spawn_forwarder(session_id.clone(), handle, sink.clone());
                Event::Subscribed { session_id }
            }
            None => Event::error_for_session(
                crate::ipc::ERR_NOT_FOUND,
                format!("session {session_id} not found"),
                session_id,
            ),
        },

        Command::List => match manager.list().await {
            Ok(sessions) => Event::List { sessions },
            Err(e) => Event::error(e.wire_code(), e.to_string()),
        },

        Command::Ping => Event::Pong,

        Command::StopAll => match manager.stop_all().await {
            Ok(()) => Event::StopDone,
            Err(e) => Event::error(e.wire_code(), e.to_string()),
        },
    }
}

/// Per-(connection, session) forwarder: streams Output frames to this
/// connection until the session ends or the subscription's sink is dropped
/// (the connection going away drops `sink`'s last strong ref only once the
/// connection's other tasks exit; a closed socket surfaces as a failed send,
/// which this task treats as its own `sink` drop).
fn spawn_forwarder(session_id: String, handle: Arc<dyn crate::session_manager::SessionHandle>, sink: WireSink) {
    tokio::spawn(async move {
        let mut subscription = handle.subscribe().await;
        while let Some(chunk) = subscription.recv().await {
            let frame = Frame::output(&session_id, chunk);
            if sink.lock().await.send(frame).await.is_err() {
                break;
            }
        }
    });
}

async fn send_event(sink: &WireSink, response: Response) -> Result<()> {
    let json = serde_json::to_vec(&response).context("failed to encode response")?;
    sink.lock()
        .await
        .send(Frame::control(Bytes::from(json)))
        .await
        .context("failed to write response frame")
}
