//! The gateway (§4.I): a public HTTPS server exposing one locally-running
//! `superposition` server through a single authenticated reverse tunnel.

pub mod auth;
pub mod proxy;
pub mod server;

pub use server::{create_router, GatewayConfig, GatewayState};
