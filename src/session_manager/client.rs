//! The shepherd-backed session-manager: proxies the [`SessionManager`]
//! contract over the shepherd's Unix-domain socket wire protocol (§4.C/§4.D).
//! Grounded on the teacher's `daemon/client.rs` request/response dance,
//! generalized to frame-tagged Output demultiplexing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio_util::codec::Framed;

use crate::ipc::codec::{Frame, FrameType, StreamCodec};
use crate::ipc::messages::{
    Command, Event, Request, Response, ERR_ALREADY_EXISTS, ERR_NOT_FOUND, ERR_PROTOCOL_ERROR,
    ERR_SPAWN_FAILED, ERR_TRANSIENT, ERR_UNAUTHORIZED,
};
use crate::ipc::SessionSummary;
use crate::{Error, Result};

use super::{OutputSubscription, SessionHandle, SessionManager};

struct RemoteSubscriber {
    id: u64,
    tx: mpsc::Sender<Bytes>,
}

struct RemoteSession {
    id: String,
    pid: u32,
    wire_subscribed: Mutex<bool>,
    subscribers: Mutex<Vec<RemoteSubscriber>>,
    next_sub_id: AtomicU64,
    done_tx: watch::Sender<bool>,
    client: Weak<ShepherdClient>,
    self_weak: Weak<RemoteSession>,
}

impl RemoteSession {
    async fn fan_out(&self, chunk: Bytes) {
        let mut subs = self.subscribers.lock().await;
        subs.retain(|s| match s.tx.try_send(chunk.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => true, // drop-newest
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    async fn finish(&self) {
        self.subscribers.lock().await.clear();
        let _ = self.done_tx.send(true);
    }

    async fn remove_subscriber(&self, id: u64) {
        self.subscribers.lock().await.retain(|s| s.id != id);
    }
}

/// A live subscription to a remote session's output, proxied over the wire.
pub struct RemoteSubscription {
    id: u64,
    session: Arc<RemoteSession>,
    rx: mpsc::Receiver<Bytes>,
}

#[async_trait]
impl OutputSubscription for RemoteSubscription {
    async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

impl Drop for RemoteSubscription {
    fn drop(&mut self) {
        let session = self.session.clone();
        let id = self.id;
        tokio::spawn(async move {
            session.remove_subscriber(id).await;
        });
    }
}

#[async_trait]
impl SessionHandle for RemoteSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn pid(&self) -> u32 {
        self.pid
    }

    async fn replay(&self) -> Bytes {
        let Some(client) = self.client.upgrade() else {
            return Bytes::new();
        };
        match client
            .send_request(Command::Replay {
                session_id: self.id.clone(),
            })
            .await
        {
            Ok(Event::Replay { data, .. }) => base64::Engine::decode(
                &base64::engine::general_purpose::STANDARD,
                data.as_bytes(),
            )
            .map(Bytes::from)
            .unwrap_or_default(),
            _ => Bytes::new(),
        }
    }

    async fn subscribe(&self) -> Box<dyn OutputSubscription> {
        let already_subscribed = {
            let mut flag = self.wire_subscribed.lock().await;
            let was = *flag;
            *flag = true;
            was
        };

        if !already_subscribed {
            if let Some(client) = self.client.upgrade() {
                let _ = client
                    .send_request(Command::Subscribe {
                        session_id: self.id.clone(),
                    })
                    .await;
            }
        }

        let (tx, rx) = mpsc::channel(256);
        let sub_id = self.next_sub_id.fetch_add(1, Ordering::SeqCst);
        self.subscribers
            .lock()
            .await
            .push(RemoteSubscriber { id: sub_id, tx });

        Box::new(RemoteSubscription {
            id: sub_id,
            session: self
                .self_weak
                .upgrade()
                .expect("subscribe called while the session's own Arc is still live"),
            rx,
        })
    }

    async fn write(&self, data: &[u8]) -> Result<usize> {
        let client = self
            .client
            .upgrade()
            .ok_or_else(|| Error::Transient("shepherd connection closed".into()))?;
        let len = data.len();
        client
            .send_frame(Frame::input(&self.id, Bytes::copy_from_slice(data)))
            .await?;
        Ok(len)
    }

    async fn done(&self) {
        let mut rx = self.done_tx.subscribe();
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }
}

/// A client connection to the shepherd process, implementing
/// [`SessionManager`] by round-tripping Control frames and demultiplexing
/// Output frames to local subscribers.
pub struct ShepherdClient {
    sink: Mutex<SplitSink<Framed<UnixStream, StreamCodec>, Frame>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Result<Event>>>>,
    sessions: RwLock<HashMap<String, Arc<RemoteSession>>>,
    next_request_id: AtomicU64,
    self_weak: Weak<ShepherdClient>,
}

/// The error returned to every pending request waiter when the shepherd
/// connection goes away (§4.D/§5: "client close cancels all pending
/// waiters with ClientClosed").
fn client_closed() -> Error {
    Error::Transient("shepherd client closed".into())
}

impl ShepherdClient {
    pub async fn connect(socket_path: &std::path::Path) -> Result<Arc<Self>> {
        let stream = UnixStream::connect(socket_path)
            .await
            .map_err(|e| Error::Transient(format!("failed to connect to shepherd: {e}")))?;
        let framed = Framed::new(stream, StreamCodec);
        let (sink, stream) = framed.split();

        let client = Arc::new_cyclic(|weak| Self {
            sink: Mutex::new(sink),
            pending: Mutex::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            next_request_id: AtomicU64::new(0),
            self_weak: weak.clone(),
        });

        tokio::spawn(Self::run_reader(client.clone(), stream));
        Ok(client)
    }

    async fn send_frame(&self, frame: Frame) -> Result<()> {
        self.sink
            .lock()
            .await
            .send(frame)
            .await
            .map_err(|e| Error::Transient(format!("shepherd write failed: {e}")))
    }

    /// Sends a command and awaits its correlated response. No per-request
    /// timer (§4.D): a request only resolves when the shepherd answers or
    /// the connection closes, at which point [`Self::fail_pending`] wakes
    /// every waiter with `ClientClosed`. Callers that need a deadline add
    /// one at the application layer.
    async fn send_request(&self, command: Command) -> Result<Event> {
        let id = format!("c{}", self.next_request_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id.clone(), tx);

        let request = Request::new(id.clone(), command);
        let json = serde_json::to_vec(&request)
            .map_err(|e| Error::ProtocolError(format!("failed to encode request: {e}")))?;

        if let Err(e) = self.send_frame(Frame::control(Bytes::from(json))).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match rx.await {
            Ok(result) => result.and_then(event_to_result),
            Err(_) => Err(client_closed()),
        }
    }

    /// Wakes every in-flight request waiter with `ClientClosed`. Called
    /// once the reader task observes the connection has gone away so no
    /// caller hangs forever waiting on a response that will never arrive.
    async fn fail_pending(&self) {
        for (_, tx) in self.pending.lock().await.drain() {
            let _ = tx.send(Err(client_closed()));
        }
    }

    fn register_session(&self, id: &str, pid: u32) -> Arc<RemoteSession> {
        Arc::new_cyclic(|weak| RemoteSession {
            id: id.to_string(),
            pid,
            wire_subscribed: Mutex::new(false),
            subscribers: Mutex::new(Vec::new()),
            next_sub_id: AtomicU64::new(0),
            done_tx: watch::channel(false).0,
            client: self.self_weak.clone(),
            self_weak: weak.clone(),
        })
    }

    async fn run_reader(
        client: Arc<Self>,
        mut stream: futures_util::stream::SplitStream<Framed<UnixStream, StreamCodec>>,
    ) {
        while let Some(frame) = stream.next().await {
            let frame = match frame {
                Ok(f) => f,
                Err(e) => {
                    tracing::warn!(error = %e, "shepherd connection read error");
                    break;
                }
            };

            match frame.frame_type {
                FrameType::Control => client.handle_control_frame(&frame.payload).await,
                FrameType::Output => {
                    if let Some((id, data)) = frame.session_scoped() {
                        if let Some(session) = client.sessions.read().await.get(&id).cloned() {
                            session.fan_out(data).await;
                        }
                    }
                }
                FrameType::Input => {
                    tracing::warn!("shepherd sent an Input frame; ignoring");
                }
            }
        }

        tracing::info!("shepherd connection closed");
        client.fail_pending().await;
        let sessions = client.sessions.read().await;
        for session in sessions.values() {
            session.finish().await;
        }
    }

    async fn handle_control_frame(&self, payload: &Bytes) {
        let response: Response = match serde_json::from_slice(payload) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "malformed control frame from shepherd");
                return;
            }
        };

        if !response.is_notification() {
            if let Some(tx) = self.pending.lock().await.remove(&response.id) {
                let _ = tx.send(Ok(response.event));
            }
            return;
        }

        if let Event::Exited { session_id } = response.event {
            if let Some(session) = self.sessions.write().await.remove(&session_id) {
                session.finish().await;
            }
        }
    }
}

fn event_to_result(event: Event) -> Result<Event> {
    match event {
        Event::Error {
            error,
            message,
            session_id: _,
        } => Err(match error.as_str() {
            ERR_NOT_FOUND => Error::NotFound(message),
            ERR_SPAWN_FAILED => Error::SpawnFailed(message),
            ERR_ALREADY_EXISTS => Error::AlreadyExists(message),
            ERR_PROTOCOL_ERROR => Error::ProtocolError(message),
            ERR_TRANSIENT => Error::Transient(message),
            ERR_UNAUTHORIZED => Error::Unauthorized(message),
            _ => Error::Internal(anyhow::anyhow!(message)),
        }),
        other => Ok(other),
    }
}

#[async_trait]
impl SessionManager for ShepherdClient {
    async fn start(
        &self,
        id: &str,
        cli: &str,
        work_dir: &str,
        rows: u16,
        cols: u16,
    ) -> Result<Arc<dyn SessionHandle>> {
        let event = self
            .send_request(Command::Start {
                session_id: id.to_string(),
                cli: cli.to_string(),
                work_dir: work_dir.to_string(),
                rows,
                cols,
            })
            .await?;

        match event {
            Event::Started { session_id, pid } => {
                let session = self.register_session(&session_id, pid);
                self.sessions
                    .write()
                    .await
                    .insert(session_id, session.clone());
                Ok(session as Arc<dyn SessionHandle>)
            }
            _ => Err(Error::ProtocolError("unexpected response to start".into())),
        }
    }

    async fn stop(&self, id: &str) -> Result<()> {
        self.send_request(Command::Stop {
            session_id: id.to_string(),
        })
        .await?;
        Ok(())
    }

    async fn get(&self, id: &str) -> Option<Arc<dyn SessionHandle>> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .map(|s| s as Arc<dyn SessionHandle>)
    }

    async fn resize(&self, id: &str, rows: u16, cols: u16) -> Result<()> {
        self.send_request(Command::Resize {
            session_id: id.to_string(),
            rows,
            cols,
        })
        .await?;
        Ok(())
    }

    async fn stop_all(&self) -> Result<()> {
        self.send_request(Command::StopAll).await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<SessionSummary>> {
        match self.send_request(Command::List).await? {
            Event::List { sessions } => {
                for summary in &sessions {
                    let known = self.sessions.read().await.contains_key(&summary.session_id);
                    if !known {
                        if let Some(pid) = summary.pid {
                            let session = self.register_session(&summary.session_id, pid);
                            self.sessions
                                .write()
                                .await
                                .insert(summary.session_id.clone(), session);
                        }
                    }
                }
                Ok(sessions)
            }
            _ => Err(Error::ProtocolError("unexpected response to list".into())),
        }
    }
}
