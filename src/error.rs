//! Crate-wide error type.
//!
//! Each variant maps to one of the error kinds named in the wire protocol
//! (the `error` field of a [`crate::ipc::Response`]) and to an HTTP status
//! for the REST and gateway layers. The wire string for each kind is fixed
//! by `wire_code()` below and must not change shape across releases.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response as AxumResponse};
use serde::Serialize;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("spawn failed: {0}")]
    SpawnFailed(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("protocol error: {0}")]
    ProtocolError(String),

    #[error("transient: {0}")]
    Transient(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    /// The stable string surfaced in the `error` field of a wire Response
    /// or a gateway/REST JSON error body.
    pub fn wire_code(&self) -> &'static str {
        match self {
            Error::NotFound(_) => "NOT_FOUND",
            Error::SpawnFailed(_) => "SPAWN_FAILED",
            Error::AlreadyExists(_) => "ALREADY_EXISTS",
            Error::ProtocolError(_) => "PROTOCOL_ERROR",
            Error::Transient(_) => "TRANSIENT",
            Error::Unauthorized(_) => "UNAUTHORIZED",
            Error::Internal(_) => "INTERNAL_ERROR",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::SpawnFailed(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Error::AlreadyExists(_) => StatusCode::CONFLICT,
            Error::ProtocolError(_) => StatusCode::BAD_REQUEST,
            Error::Transient(_) => StatusCode::BAD_GATEWAY,
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    message: String,
}

impl IntoResponse for Error {
    fn into_response(self) -> AxumResponse {
        let status = self.status();
        let body = ErrorBody {
            error: self.wire_code().to_string(),
            message: self.to_string(),
        };
        (status, axum::Json(body)).into_response()
    }
}
