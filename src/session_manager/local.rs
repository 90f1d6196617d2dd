//! The in-process session-manager backend: owns PTYs directly via
//! [`crate::pty::Session`]. Grounded on the teacher's
//! `daemon/session.rs::SessionManager`, generalized from "one box, many
//! PTYs" to "one session, one PTY".

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, RwLock};

use crate::config::Config;
use crate::ipc::SessionSummary;
use crate::pty;
use crate::{Error, Result};

use super::{OutputSubscription, SessionHandle, SessionManager};

#[async_trait]
impl OutputSubscription for pty::Subscription {
    async fn recv(&mut self) -> Option<Bytes> {
        pty::Subscription::recv(self).await
    }
}

#[async_trait]
impl SessionHandle for pty::Session {
    fn id(&self) -> &str {
        pty::Session::id(self)
    }

    fn pid(&self) -> u32 {
        pty::Session::pid(self)
    }

    async fn replay(&self) -> Bytes {
        pty::Session::replay(self).await
    }

    async fn subscribe(&self) -> Box<dyn OutputSubscription> {
        Box::new(pty::Session::subscribe(self).await)
    }

    async fn write(&self, data: &[u8]) -> Result<usize> {
        pty::Session::write(self, data)
    }

    async fn done(&self) {
        pty::Session::done(self).await
    }
}

/// Session table mutations (insert/delete) are serialized under the write
/// lock; reads may be concurrent (§5 shared resources). Never held across
/// network or PTY I/O.
pub struct LocalManager {
    config: Arc<Config>,
    sessions: RwLock<HashMap<String, pty::Session>>,
    exit_tx: mpsc::UnboundedSender<String>,
}

impl LocalManager {
    pub fn new(config: Arc<Config>) -> Arc<Self> {
        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel::<String>();
        let manager = Arc::new(Self {
            config,
            sessions: RwLock::new(HashMap::new()),
            exit_tx,
        });

        let reaper = manager.clone();
        tokio::spawn(async move {
            while let Some(id) = exit_rx.recv().await {
                reaper.sessions.write().await.remove(&id);
            }
        });

        manager
    }
}

#[async_trait]
impl SessionManager for LocalManager {
    async fn start(
        &self,
        id: &str,
        cli: &str,
        work_dir: &str,
        rows: u16,
        cols: u16,
    ) -> Result<Arc<dyn SessionHandle>> {
        {
            let sessions = self.sessions.read().await;
            if sessions.contains_key(id) {
                return Err(Error::AlreadyExists(format!("session {id} already exists")));
            }
        }

        // The allow-list is enforced by callers (REST layer, CLI), not here —
        // the manager does not validate `cli` (§6).
        let session = pty::Session::start(
            id,
            cli,
            work_dir,
            rows,
            cols,
            self.config.replay_ring_bytes,
            self.exit_tx.clone(),
        )
        .await?;

        let handle: Arc<dyn SessionHandle> = Arc::new(session.clone());
        self.sessions.write().await.insert(id.to_string(), session);
        Ok(handle)
    }

    async fn stop(&self, id: &str) -> Result<()> {
        let session = { self.sessions.read().await.get(id).cloned() };
        match session {
            Some(session) => {
                let _ = nix::sys::signal::kill(
                    nix::unistd::Pid::from_raw(session.pid() as i32),
                    nix::sys::signal::Signal::SIGTERM,
                );
                Ok(())
            }
            // Stop on an unknown session is a no-op (§8).
            None => Ok(()),
        }
    }

    async fn get(&self, id: &str) -> Option<Arc<dyn SessionHandle>> {
        let sessions = self.sessions.read().await;
        sessions
            .get(id)
            .cloned()
            .map(|s| Arc::new(s) as Arc<dyn SessionHandle>)
    }

    async fn resize(&self, id: &str, rows: u16, cols: u16) -> Result<()> {
        let sessions = self.sessions.read().await;
        match sessions.get(id) {
            Some(session) => session.resize(rows, cols),
            None => Err(Error::NotFound(format!("session {id} not found"))),
        }
    }

    async fn stop_all(&self) -> Result<()> {
        let sessions = self.sessions.read().await;
        for session in sessions.values() {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(session.pid() as i32),
                nix::sys::signal::Signal::SIGTERM,
            );
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<SessionSummary>> {
        let sessions = self.sessions.read().await;
        let mut out = Vec::with_capacity(sessions.len());
        for session in sessions.values() {
            let (rows, cols) = session.size();
            out.push(SessionSummary {
                session_id: session.id().to_string(),
                cli: session.cli().to_string(),
                work_dir: session.work_dir().to_string(),
                state: session.state().await,
                pid: Some(session.pid()),
                rows,
                cols,
                created_unix: session.created_unix(),
            });
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_rejects_a_duplicate_session_id() {
        let mut config = Config::default();
        config.allowed_clis = vec!["echo".to_string()];
        let manager = LocalManager::new(Arc::new(config));

        manager.start("dup", "echo", "/tmp", 24, 80).await.unwrap();
        let result = manager.start("dup", "echo", "/tmp", 24, 80).await;
        assert!(matches!(result, Err(Error::AlreadyExists(_))));

        manager.get("dup").await.unwrap().done().await;
    }

    #[tokio::test]
    async fn stop_unknown_session_is_a_no_op() {
        let manager = LocalManager::new(Arc::new(Config::default()));
        assert!(manager.stop("no-such-session").await.is_ok());
    }

    #[tokio::test]
    async fn resize_unknown_session_reports_not_found() {
        let manager = LocalManager::new(Arc::new(Config::default()));
        let result = manager.resize("no-such-session", 30, 100).await;
        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn start_and_list_round_trips_a_session() {
        let mut config = Config::default();
        config.allowed_clis = vec!["echo".to_string()];
        let manager = LocalManager::new(Arc::new(config));

        manager.start("s1", "echo", "/tmp", 24, 80).await.unwrap();
        let listed = manager.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].session_id, "s1");

        manager.get("s1").await.unwrap().done().await;
    }
}
