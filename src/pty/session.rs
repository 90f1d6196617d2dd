//! The PTY session object (§4.B): one child process + PTY, a replay ring,
//! and fan-out to subscribers.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicI32, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::io::unix::AsyncFd;
use tokio::process::Command;
use tokio::sync::{mpsc, watch, Mutex};

use crate::ipc::SessionState;
use crate::{Error, Result};

use super::ring::ReplayRing;

/// Read chunk size for the PTY producer (§4.B).
const READ_CHUNK: usize = 32 * 1024;
/// Per-subscriber bounded queue capacity, in chunks (§3 Subscriber).
const SUBSCRIBER_CAPACITY: usize = 256;

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<Bytes>,
}

struct Inner {
    id: String,
    cli: String,
    work_dir: String,
    created_unix: u64,
    pid: u32,
    /// -1 once the PTY master has been closed.
    master_fd: AtomicI32,
    rows: AtomicU16,
    cols: AtomicU16,
    state: Mutex<SessionState>,
    replay: Mutex<ReplayRing>,
    subscribers: Mutex<Vec<Subscriber>>,
    next_sub_id: std::sync::atomic::AtomicU64,
    done_tx: watch::Sender<bool>,
}

/// A handle to a running PTY session. Cheap to clone; all clones share the
/// same underlying state.
#[derive(Clone)]
pub struct Session(Arc<Inner>);

/// A live subscription to a session's output (§3 Subscriber).
pub struct Subscription {
    id: u64,
    session: Session,
    rx: mpsc::Receiver<Bytes>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    pub fn unsubscribe(self) {
        // Dropping removes `rx`; `Drop` below does the table cleanup.
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let session = self.session.clone();
        let id = self.id;
        tokio::spawn(async move {
            session.remove_subscriber(id).await;
        });
    }
}

impl Session {
    /// Starts a child process attached to a freshly allocated PTY (§4.B
    /// start). `on_exit` is invoked with the session id exactly once, after
    /// the session has transitioned to `Exited` and all subscribers have
    /// been closed, so the caller can remove it from its table.
    pub async fn start(
        id: impl Into<String>,
        cli: &str,
        work_dir: &str,
        rows: u16,
        cols: u16,
        ring_bytes: usize,
        on_exit: mpsc::UnboundedSender<String>,
    ) -> Result<Session> {
        let id = id.into();

        if which::which(cli).is_err() {
            return Err(Error::SpawnFailed(format!("{cli} not found on PATH")));
        }
        if !Path::new(work_dir).is_dir() {
            return Err(Error::SpawnFailed(format!(
                "working directory not accessible: {work_dir}"
            )));
        }

        let pty = nix::pty::openpty(
            Some(&nix::pty::Winsize {
                ws_row: rows,
                ws_col: cols,
                ws_xpixel: 0,
                ws_ypixel: 0,
            }),
            None,
        )
        .map_err(|e| Error::SpawnFailed(format!("openpty failed: {e}")))?;

        let master: OwnedFd = pty.master;
        let slave: OwnedFd = pty.slave;
        let master_raw = master.as_raw_fd();

        let stdin = dup_stdio(&slave)?;
        let stdout = dup_stdio(&slave)?;
        let stderr = dup_stdio(&slave)?;

        let mut command = Command::new(cli);
        command
            .current_dir(work_dir)
            .stdin(stdin)
            .stdout(stdout)
            .stderr(stderr);

        // Safety: runs between fork and exec in the child only; establishes
        // the PTY slave as the child's controlling terminal.
        unsafe {
            command.pre_exec(|| {
                nix::unistd::setsid().map_err(std::io::Error::from)?;
                let res = nix::libc::ioctl(0, nix::libc::TIOCSCTTY as _, 0);
                if res < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let mut child = command
            .spawn()
            .map_err(|e| Error::SpawnFailed(format!("failed to spawn {cli}: {e}")))?;
        let pid = child.id().ok_or_else(|| {
            Error::SpawnFailed("child exited before its pid could be observed".into())
        })?;

        // The slave end belongs to the child now; the parent only needs
        // the master.
        drop(slave);

        set_nonblocking(master_raw);

        let created_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        let (done_tx, _done_rx) = watch::channel(false);

        let inner = Arc::new(Inner {
            id: id.clone(),
            cli: cli.to_string(),
            work_dir: work_dir.to_string(),
            created_unix,
            pid,
            master_fd: AtomicI32::new(master_raw),
            rows: AtomicU16::new(rows),
            cols: AtomicU16::new(cols),
            state: Mutex::new(SessionState::Running),
            replay: Mutex::new(ReplayRing::new(ring_bytes)),
            subscribers: Mutex::new(Vec::new()),
            next_sub_id: std::sync::atomic::AtomicU64::new(0),
            done_tx,
        });

        // `master` (the OwnedFd) must stay alive for as long as `master_raw`
        // is read from; the reader task takes ownership of it.
        spawn_reader(inner.clone(), master, on_exit);
        spawn_reaper(inner.clone(), child);

        Ok(Session(inner))
    }

    pub fn id(&self) -> &str {
        &self.0.id
    }

    pub fn cli(&self) -> &str {
        &self.0.cli
    }

    pub fn work_dir(&self) -> &str {
        &self.0.work_dir
    }

    pub fn pid(&self) -> u32 {
        self.0.pid
    }

    pub fn created_unix(&self) -> u64 {
        self.0.created_unix
    }

    pub async fn state(&self) -> SessionState {
        *self.0.state.lock().await
    }

    pub fn size(&self) -> (u16, u16) {
        (
            self.0.rows.load(Ordering::SeqCst),
            self.0.cols.load(Ordering::SeqCst),
        )
    }

    /// Writes bytes to the PTY master. Never blocks on subscribers.
    /// Fails with `Transient` once the session has exited.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        let fd = self.0.master_fd.load(Ordering::SeqCst);
        if fd < 0 {
            return Err(Error::Transient(format!(
                "session {} has exited",
                self.0.id
            )));
        }
        match nix::unistd::write(unsafe { std::os::fd::BorrowedFd::borrow_raw(fd) }, data) {
            Ok(n) => Ok(n),
            Err(nix::errno::Errno::EAGAIN) => Ok(0),
            Err(e) => Err(Error::Transient(format!("write failed: {e}"))),
        }
    }

    /// Idempotent: re-applying the same size is a no-op.
    pub fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        let fd = self.0.master_fd.load(Ordering::SeqCst);
        if fd < 0 {
            return Err(Error::NotFound(format!("session {} has exited", self.0.id)));
        }
        let (cur_rows, cur_cols) = self.size();
        if cur_rows == rows && cur_cols == cols {
            return Ok(());
        }
        let ws = nix::pty::Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let res = unsafe { nix::libc::ioctl(fd, nix::libc::TIOCSWINSZ, &ws) };
        if res < 0 {
            return Err(Error::Transient(format!(
                "resize failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        self.0.rows.store(rows, Ordering::SeqCst);
        self.0.cols.store(cols, Ordering::SeqCst);
        Ok(())
    }

    /// A copy of the current replay snapshot (§3 Replay ring): a suffix of
    /// the output stream, at most the configured ring size.
    pub async fn replay(&self) -> Bytes {
        self.0.replay.lock().await.snapshot()
    }

    /// Subscribes to all output emitted after this call. Callers should
    /// call [`Session::replay`] *before* `subscribe` so the replay snapshot
    /// is a superset of everything emitted before the subscription starts
    /// (§5 ordering guarantees).
    pub async fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let id = self
            .0
            .next_sub_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.0.subscribers.lock().await.push(Subscriber { id, tx });
        Subscription {
            id,
            session: self.clone(),
            rx,
        }
    }

    async fn remove_subscriber(&self, id: u64) {
        self.0.subscribers.lock().await.retain(|s| s.id != id);
    }

    /// Resolves once the session has reached `Exited`.
    pub async fn done(&self) {
        let mut rx = self.0.done_tx.subscribe();
        if *rx.borrow() {
            return;
        }
        let _ = rx.changed().await;
    }
}

fn dup_stdio(fd: &OwnedFd) -> Result<Stdio> {
    let dup = fd
        .try_clone()
        .map_err(|e| Error::SpawnFailed(format!("failed to duplicate pty fd: {e}")))?;
    Ok(Stdio::from(dup))
}

fn set_nonblocking(fd: RawFd) {
    unsafe {
        let flags = nix::libc::fcntl(fd, nix::libc::F_GETFL);
        nix::libc::fcntl(fd, nix::libc::F_SETFL, flags | nix::libc::O_NONBLOCK);
    }
}

/// The internal producer: reads PTY output in 32 KiB chunks, appends to the
/// replay ring, and fans out to subscribers (§4.B).
fn spawn_reader(inner: Arc<Inner>, master: OwnedFd, on_exit: mpsc::UnboundedSender<String>) {
    tokio::spawn(async move {
        let master_raw = master.as_raw_fd();
        let async_fd = match AsyncFd::new(master) {
            Ok(f) => f,
            Err(e) => {
                tracing::error!(session = %inner.id, error = %e, "failed to register pty fd");
                finish(&inner, &on_exit).await;
                return;
            }
        };

        let mut buf = [0u8; READ_CHUNK];
        loop {
            let mut guard = match async_fd.readable().await {
                Ok(g) => g,
                Err(_) => break,
            };

            let outcome = guard.try_io(|_| {
                let n = unsafe {
                    nix::libc::read(master_raw, buf.as_mut_ptr() as *mut _, buf.len())
                };
                if n < 0 {
                    Err(std::io::Error::last_os_error())
                } else if n == 0 {
                    Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof"))
                } else {
                    Ok(n as usize)
                }
            });

            match outcome {
                Ok(Ok(n)) => {
                    let chunk = Bytes::copy_from_slice(&buf[..n]);
                    inner.replay.lock().await.push(&chunk);
                    fan_out(&inner, chunk).await;
                }
                Ok(Err(_)) => break, // PTY read error is treated as end-of-output.
                Err(_would_block) => continue,
            }
        }

        tracing::info!(session = %inner.id, "pty output ended");
        finish(&inner, &on_exit).await;
    });
}

async fn fan_out(inner: &Inner, chunk: Bytes) {
    let mut subs = inner.subscribers.lock().await;
    subs.retain(|s| match s.tx.try_send(chunk.clone()) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => true, // drop-newest; keep the subscriber
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    });
}

fn spawn_reaper(inner: Arc<Inner>, mut child: tokio::process::Child) {
    tokio::spawn(async move {
        let _ = child.wait().await;
        inner.master_fd.store(-1, Ordering::SeqCst);
    });
}

async fn finish(inner: &Arc<Inner>, on_exit: &mpsc::UnboundedSender<String>) {
    *inner.state.lock().await = SessionState::Exited;
    inner.master_fd.store(-1, Ordering::SeqCst);
    inner.subscribers.lock().await.clear(); // drops all senders -> subscriber sinks see EOF
    let _ = inner.done_tx.send(true);
    let _ = on_exit.send(inner.id.clone());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spawn_fails_for_unknown_command() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = Session::start(
            "test-session",
            "definitely-not-a-real-binary-xyz",
            "/tmp",
            24,
            80,
            1024,
            tx,
        )
        .await;
        assert!(matches!(result, Err(Error::SpawnFailed(_))));
    }

    #[tokio::test]
    async fn spawn_fails_for_missing_workdir() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = Session::start(
            "test-session",
            "echo",
            "/no/such/directory/at/all",
            24,
            80,
            1024,
            tx,
        )
        .await;
        assert!(matches!(result, Err(Error::SpawnFailed(_))));
    }

    #[tokio::test]
    async fn echo_session_produces_replay_and_exits() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let session = Session::start("echo-test", "echo", "/tmp", 24, 80, 1024, tx)
            .await
            .expect("echo should be on PATH in test environments");

        session.done().await;
        assert_eq!(session.state().await, SessionState::Exited);

        let snapshot = session.replay().await;
        assert!(snapshot.starts_with(b""));

        let notified = rx.recv().await;
        assert_eq!(notified.as_deref(), Some("echo-test"));
    }

    #[tokio::test]
    async fn resize_is_idempotent() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let session = Session::start("resize-test", "sleep", "/tmp", 24, 80, 1024, tx)
            .await
            .unwrap();
        session.resize(30, 100).unwrap();
        session.resize(30, 100).unwrap();
        assert_eq!(session.size(), (30, 100));
    }
}
