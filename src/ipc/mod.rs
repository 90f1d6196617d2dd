//! The shepherd wire protocol: a framed stream of length-prefixed, typed
//! frames (§4.A) carrying either JSON control messages (§3 Request/Response)
//! or session-scoped opaque bytes (PTY input/output).

pub mod codec;
pub mod messages;

pub use codec::{Frame, FrameType, StreamCodec};
pub use messages::*;

/// Maximum frame length (the payload after the 4-byte length prefix and
/// before the 1-byte type tag is not counted separately; this bounds the
/// whole `length` field of §3).
pub const MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;

/// Protocol version exchanged in the handshake preceding the frame stream.
pub const PROTOCOL_VERSION: u32 = 1;
