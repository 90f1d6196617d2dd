//! The session-manager interface (§4.E): the contract consumed by the
//! WebSocket bridge and the REST layer, with two interchangeable backends —
//! [`local::LocalManager`] (owns PTYs directly) and
//! [`client::ShepherdClient`] (proxies to the shepherd process). Both
//! backends are observationally identical modulo the shepherd's
//! cross-restart persistence.

pub mod client;
pub mod local;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::ipc::SessionSummary;
use crate::Result;

/// A live subscription to a session handle's output stream.
#[async_trait]
pub trait OutputSubscription: Send {
    async fn recv(&mut self) -> Option<Bytes>;
}

/// A handle to one running (or just-exited) session, backend-agnostic.
#[async_trait]
pub trait SessionHandle: Send + Sync {
    fn id(&self) -> &str;
    fn pid(&self) -> u32;

    /// The current replay snapshot (§3 Replay ring).
    async fn replay(&self) -> Bytes;

    /// Subscribes to output emitted after this call. Callers must call
    /// `replay()` first to preserve the ordering guarantee of §5.
    async fn subscribe(&self) -> Box<dyn OutputSubscription>;

    /// Writes input bytes; never blocks on subscribers.
    async fn write(&self, data: &[u8]) -> Result<usize>;

    /// Resolves once the session has reached `Exited`.
    async fn done(&self);
}

/// Unified contract consumed by the WebSocket bridge and the REST layer
/// (§4.E).
#[async_trait]
pub trait SessionManager: Send + Sync {
    async fn start(
        &self,
        id: &str,
        cli: &str,
        work_dir: &str,
        rows: u16,
        cols: u16,
    ) -> Result<Arc<dyn SessionHandle>>;

    async fn stop(&self, id: &str) -> Result<()>;

    async fn get(&self, id: &str) -> Option<Arc<dyn SessionHandle>>;

    async fn resize(&self, id: &str, rows: u16, cols: u16) -> Result<()>;

    async fn stop_all(&self) -> Result<()>;

    async fn list(&self) -> Result<Vec<SessionSummary>>;
}
