//! The user-facing HTTP/WS server (§4.F, §4.M): REST glue, the terminal
//! WebSocket bridge, and the embedded web UI asset bundle.

pub mod api;
pub mod assets;
pub mod server;
pub mod websocket;

pub use server::{create_router, start_server, AppState};
