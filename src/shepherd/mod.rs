//! The shepherd (§4.C): a long-lived supervisor process that owns PTYs
//! directly and exposes them to one or more shepherd clients over a local
//! Unix-domain socket, surviving restarts of the user-facing server.

pub mod server;
pub mod spawn;

pub use server::run;
