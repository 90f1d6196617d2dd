//! Tunnel management and HTTP proxying (§4.H, §4.I). The gateway holds at
//! most one live tunnel; a new `/tunnel` connection replaces whatever was
//! there. A single task owns the yamux `Connection` and is the only thing
//! that ever polls it, since a yamux `Stream` handle is just a proxy into
//! the connection's internal state machine (same constraint the shepherd
//! client already works around for its own multiplexed request/response
//! traffic, grounded on `shepherd/client.rs`'s pending-request table).
//!
//! Ordinary requests are proxied with a deliberately small, Content-Length
//! only HTTP/1.1 serializer (no chunked encoding) rather than pulling in a
//! full client stack here; WebSocket-upgrade requests are proxied by
//! relaying the upgrade handshake over the tunnel stream and then, once the
//! local server answers 101, hijacking the gateway's own raw connection via
//! `hyper::upgrade::on` and splicing the two byte streams together.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, Request, Response, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use futures_util::StreamExt;
use hyper_util::rt::TokioIo;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::compat::{Compat, FuturesAsyncReadCompatExt};
use yamux::{Config as YamuxConfig, Connection, ConnectionError, Mode, Stream as YamuxStream};

use super::server::GatewayState;
use crate::tunnel::adapter::AxumWsAdapter;

type OpenReply = oneshot::Sender<Result<YamuxStream, ConnectionError>>;

/// A live tunnel: a channel to request outbound streams from the task that
/// owns the yamux connection, plus that task's handle so a replacement
/// tunnel can tear the old one down.
pub struct TunnelHandle {
    open_tx: mpsc::Sender<OpenReply>,
    driver: JoinHandle<()>,
}

impl TunnelHandle {
    pub async fn open_stream(&self) -> anyhow::Result<YamuxStream> {
        let (tx, rx) = oneshot::channel();
        self.open_tx
            .send(tx)
            .await
            .map_err(|_| anyhow::anyhow!("tunnel driver is gone"))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("tunnel driver dropped the request"))?
            .map_err(|e| anyhow::anyhow!("failed to open tunnel stream: {e}"))
    }
}

impl Drop for TunnelHandle {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

pub async fn tunnel_upgrade(
    State(state): State<Arc<GatewayState>>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> axum::response::Response {
    let presented = headers
        .get("x-gateway-secret")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if presented != state.tunnel_secret {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    ws.on_upgrade(move |socket| async move {
        let adapter = AxumWsAdapter::new(socket);
        let connection = Connection::new(adapter, YamuxConfig::default(), Mode::Client);
        let (open_tx, open_rx) = mpsc::channel(32);
        let driver = tokio::spawn(run_driver(connection, open_rx));
        let handle = Arc::new(TunnelHandle { open_tx, driver });

        let previous = state.tunnel.lock().await.replace(handle);
        drop(previous); // aborts the old driver, if any, via Drop
        tracing::info!("tunnel connected");
    })
}

/// Owns the yamux connection exclusively: services outbound-open requests
/// and drains (and discards) any stream the local server tries to open
/// inbound, since the gateway never expects one.
async fn run_driver(mut connection: Connection<AxumWsAdapter>, mut open_rx: mpsc::Receiver<OpenReply>) {
    loop {
        tokio::select! {
            request = open_rx.recv() => {
                match request {
                    Some(reply) => {
                        let opened = std::future::poll_fn(|cx| connection.poll_new_outbound(cx)).await;
                        let _ = reply.send(opened);
                    }
                    None => return,
                }
            }
            inbound = connection.next() => {
                match inbound {
                    Some(Ok(_stream)) => tracing::debug!("ignoring unexpected inbound tunnel stream"),
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "tunnel connection error");
                        return;
                    }
                    None => {
                        tracing::info!("tunnel disconnected");
                        return;
                    }
                }
            }
        }
    }
}

#[derive(Serialize)]
struct ProxyError {
    error: &'static str,
}

fn not_connected() -> axum::response::Response {
    (
        StatusCode::BAD_GATEWAY,
        Json(ProxyError {
            error: "gateway not connected to superposition",
        }),
    )
        .into_response()
}

pub async fn proxy_handler(
    State(state): State<Arc<GatewayState>>,
    req: Request<Body>,
) -> axum::response::Response {
    let Some(tunnel) = state.tunnel.lock().await.clone() else {
        return not_connected();
    };

    let is_ws_upgrade = req
        .headers()
        .get(axum::http::header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    let result = if is_ws_upgrade {
        proxy_websocket(tunnel, req).await
    } else {
        proxy_http(tunnel, req).await
    };

    match result {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!(error = %e, "proxy request failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(ProxyError {
                    error: "tunnel stream failed",
                }),
            )
                .into_response()
        }
    }
}

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

fn serialize_request_head(req: &Request<Body>, content_length: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let path = req
        .uri()
        .path_and_query()
        .map(|p| p.as_str())
        .unwrap_or("/");
    out.extend_from_slice(format!("{} {} HTTP/1.1\r\n", req.method(), path).as_bytes());
    for (name, value) in req.headers() {
        if HOP_BY_HOP.contains(&name.as_str().to_ascii_lowercase().as_str()) {
            continue;
        }
        if let Ok(v) = value.to_str() {
            out.extend_from_slice(format!("{}: {}\r\n", name, v).as_bytes());
        }
    }
    out.extend_from_slice(format!("content-length: {content_length}\r\n").as_bytes());
    out.extend_from_slice(b"connection: keep-alive\r\n\r\n");
    out
}

/// Reads a head-terminated-by-blank-line block (status line + headers) from
/// a buffered reader, returning the parsed status code and headers. Leaves
/// the reader positioned at the start of the body.
async fn read_response_head<R: tokio::io::AsyncBufRead + Unpin>(
    reader: &mut R,
) -> anyhow::Result<(StatusCode, HeaderMap)> {
    let mut status_line = String::new();
    reader.read_line(&mut status_line).await?;
    let mut parts = status_line.trim_end().splitn(3, ' ');
    let _version = parts.next();
    let code: u16 = parts
        .next()
        .ok_or_else(|| anyhow::anyhow!("malformed status line"))?
        .parse()?;
    let status = StatusCode::from_u16(code)?;

    let mut headers = HeaderMap::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.trim().as_bytes()),
                value.trim().parse(),
            ) {
                headers.insert(name, value);
            }
        }
    }
    Ok((status, headers))
}

async fn proxy_http(
    tunnel: Arc<TunnelHandle>,
    req: Request<Body>,
) -> anyhow::Result<axum::response::Response> {
    let (parts, body) = req.into_parts();
    let body_bytes = axum::body::to_bytes(body, 16 * 1024 * 1024).await?;

    let stream = tunnel.open_stream().await?;
    let mut stream: Compat<YamuxStream> = stream.compat();

    let head = serialize_request_head(&Request::from_parts(parts, Body::empty()), body_bytes.len());
    stream.write_all(&head).await?;
    if !body_bytes.is_empty() {
        stream.write_all(&body_bytes).await?;
    }
    stream.flush().await?;

    let mut reader = BufReader::new(stream);
    let (status, mut headers) = read_response_head(&mut reader).await?;
    let content_length: usize = headers
        .get(axum::http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);

    let mut body = vec![0u8; content_length];
    reader.read_exact(&mut body).await?;
    headers.remove("transfer-encoding");
    headers.remove("connection");

    let mut response = Response::builder().status(status);
    for (name, value) in headers.iter() {
        response = response.header(name, value);
    }
    Ok(response.body(Body::from(body))?.into_response())
}

async fn proxy_websocket(
    tunnel: Arc<TunnelHandle>,
    mut req: Request<Body>,
) -> anyhow::Result<axum::response::Response> {
    let on_upgrade = hyper::upgrade::on(&mut req);

    let stream = tunnel.open_stream().await?;
    let mut tunnel_io: Compat<YamuxStream> = stream.compat();

    let head = serialize_request_head(&req, 0);
    tunnel_io.write_all(&head).await?;
    tunnel_io.flush().await?;

    let mut reader = BufReader::new(tunnel_io);
    let (status, headers) = read_response_head(&mut reader).await?;
    if status != StatusCode::SWITCHING_PROTOCOLS {
        let content_length: usize = headers
            .get(axum::http::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let mut body = vec![0u8; content_length];
        reader.read_exact(&mut body).await?;
        let mut response = Response::builder().status(status);
        for (name, value) in headers.iter() {
            response = response.header(name, value);
        }
        return Ok(response.body(Body::from(body))?.into_response());
    }

    tokio::spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let mut client_io = TokioIo::new(upgraded);
                // The local server may have pipelined WS frame bytes into the
                // same TCP segment as the 101 response; `BufReader` will have
                // already slurped them into its internal buffer, so they must
                // be replayed before the raw copy takes over.
                let leftover = reader.buffer().to_vec();
                let mut tunnel_io = reader.into_inner();
                if !leftover.is_empty() {
                    if let Err(e) = client_io.write_all(&leftover).await {
                        tracing::debug!(error = %e, "failed to replay buffered tunnel bytes");
                        return;
                    }
                }
                if let Err(e) =
                    tokio::io::copy_bidirectional(&mut client_io, &mut tunnel_io).await
                {
                    tracing::debug!(error = %e, "websocket proxy bridge ended");
                }
            }
            Err(e) => tracing::warn!(error = %e, "failed to hijack client connection"),
        }
    });

    let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
    for (name, value) in headers.iter() {
        response = response.header(name, value);
    }
    Ok(response.body(Body::empty())?.into_response())
}
