use serde::{Deserialize, Serialize};

/// State of a [`Session`](crate::pty::Session) (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Starting,
    Running,
    Exited,
}

/// A session as reported by a `List` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub cli: String,
    pub work_dir: String,
    pub state: SessionState,
    pub pid: Option<u32>,
    pub rows: u16,
    pub cols: u16,
    pub created_unix: u64,
}

/// A Request (§3): `(correlation id, command, command-specific fields)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: String,
    #[serde(flatten)]
    pub command: Command,
}

impl Request {
    pub fn new(id: impl Into<String>, command: Command) -> Self {
        Self {
            id: id.into(),
            command,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum Command {
    Start {
        session_id: String,
        cli: String,
        work_dir: String,
        #[serde(default = "default_rows")]
        rows: u16,
        #[serde(default = "default_cols")]
        cols: u16,
    },
    Stop {
        session_id: String,
    },
    Resize {
        session_id: String,
        rows: u16,
        cols: u16,
    },
    Replay {
        session_id: String,
    },
    Subscribe {
        session_id: String,
    },
    List,
    Ping,
    StopAll,
}

fn default_rows() -> u16 {
    40
}
fn default_cols() -> u16 {
    120
}

/// A Response (§3): synchronous responses echo their request's correlation
/// id; asynchronous notifications (currently only `Exited`) carry an empty
/// id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(flatten)]
    pub event: Event,
}

impl Response {
    pub fn reply(id: impl Into<String>, event: Event) -> Self {
        Self {
            id: id.into(),
            event,
        }
    }

    pub fn notification(event: Event) -> Self {
        Self {
            id: String::new(),
            event,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Event {
    Started {
        session_id: String,
        pid: u32,
    },
    Stopped {
        session_id: String,
    },
    StopDone,
    Error {
        error: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },
    /// Carries the replay snapshot base64-encoded in `data` (the snapshot
    /// itself travels in a Control frame, not an Output frame, since it is
    /// a synchronous reply to a `Replay` request).
    Replay {
        session_id: String,
        data: String,
    },
    List {
        sessions: Vec<SessionSummary>,
    },
    Pong,
    Exited {
        session_id: String,
    },
    Resized {
        session_id: String,
    },
    Subscribed {
        session_id: String,
    },
}

impl Event {
    pub fn error(code: &'static str, message: impl Into<String>) -> Self {
        Event::Error {
            error: code.to_string(),
            message: message.into(),
            session_id: None,
        }
    }

    pub fn error_for_session(
        code: &'static str,
        message: impl Into<String>,
        session_id: impl Into<String>,
    ) -> Self {
        Event::Error {
            error: code.to_string(),
            message: message.into(),
            session_id: Some(session_id.into()),
        }
    }
}

// ── Error codes (wire-stable, mirrors crate::Error::wire_code) ──────────

pub const ERR_NOT_FOUND: &str = "NOT_FOUND";
pub const ERR_SPAWN_FAILED: &str = "SPAWN_FAILED";
pub const ERR_ALREADY_EXISTS: &str = "ALREADY_EXISTS";
pub const ERR_PROTOCOL_ERROR: &str = "PROTOCOL_ERROR";
pub const ERR_TRANSIENT: &str = "TRANSIENT";
pub const ERR_UNAUTHORIZED: &str = "UNAUTHORIZED";
pub const ERR_INTERNAL: &str = "INTERNAL_ERROR";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_roundtrips_through_json() {
        let req = Request::new(
            "r1",
            Command::Start {
                session_id: "abc".into(),
                cli: "claude".into(),
                work_dir: "/tmp".into(),
                rows: 40,
                cols: 120,
            },
        );
        let json = serde_json::to_string(&req).unwrap();
        let back: Request = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, "r1");
        matches!(back.command, Command::Start { .. });
    }

    #[test]
    fn exited_notification_has_no_id() {
        let resp = Response::notification(Event::Exited {
            session_id: "abc".into(),
        });
        let json = serde_json::to_value(&resp).unwrap();
        assert!(json.get("id").is_none());
        assert!(resp.is_notification());
    }

    #[test]
    fn synchronous_response_carries_request_id() {
        let resp = Response::reply(
            "r1",
            Event::Started {
                session_id: "abc".into(),
                pid: 42,
            },
        );
        assert_eq!(resp.id, "r1");
        assert!(!resp.is_notification());
    }
}
