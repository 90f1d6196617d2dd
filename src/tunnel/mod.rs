//! The reverse tunnel (§4.G, §4.H): a single authenticated outbound
//! connection from the server to a public gateway, carrying many logical
//! streams via a yamux session over a WebSocket transport adapter.

pub mod adapter;
pub mod client;
