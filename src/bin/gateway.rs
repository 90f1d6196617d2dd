//! `superposition-gateway`: the public-facing half of the reverse tunnel
//! (§4.H, §4.I). Grounded on the teacher's `main.rs` shape (parse args,
//! init tracing, dispatch) and on `tokio_rustls`'s accept-loop pattern for
//! manually terminating TLS in front of an axum router, since `axum::serve`
//! only speaks to a bare `TcpListener`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use hyper_util::service::TowerToHyperService;
use tokio::net::TcpListener;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

use superposition::gateway::{self, GatewayConfig, GatewayState};

#[derive(Parser, Debug)]
#[command(name = "superposition-gateway", version, about = "Public reverse-tunnel endpoint for superposition")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the gateway.
    Serve {
        #[arg(long, default_value = "0.0.0.0:8443")]
        listen: SocketAddr,

        /// PEM certificate chain. Omit both this and `--tls-key` to run
        /// plaintext behind a reverse proxy that terminates TLS itself.
        #[arg(long)]
        tls_cert: Option<PathBuf>,

        #[arg(long)]
        tls_key: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("superposition=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let Commands::Serve {
        listen,
        tls_cert,
        tls_key,
    } = cli.command;

    let config = GatewayConfig::from_env()?;
    let state = GatewayState::new(config);
    let app = gateway::create_router(state);

    match (tls_cert, tls_key) {
        (Some(cert), Some(key)) => serve_tls(listen, app, &cert, &key).await,
        (None, None) => serve_plain(listen, app).await,
        _ => anyhow::bail!("--tls-cert and --tls-key must be given together"),
    }
}

async fn serve_plain(listen: SocketAddr, app: axum::Router) -> Result<()> {
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    tracing::info!(%listen, tls = false, "gateway listening");
    axum::serve(listener, app).await.context("gateway server error")
}

async fn serve_tls(listen: SocketAddr, app: axum::Router, cert: &PathBuf, key: &PathBuf) -> Result<()> {
    let tls_config = load_tls_config(cert, key)?;
    let acceptor = TlsAcceptor::from(Arc::new(tls_config));
    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    tracing::info!(%listen, tls = true, "gateway listening");

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                continue;
            }
        };
        let acceptor = acceptor.clone();
        let app = app.clone();
        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::debug!(error = %e, %peer, "tls handshake failed");
                    return;
                }
            };
            let io = TokioIo::new(tls_stream);
            let service = TowerToHyperService::new(app);
            if let Err(e) = AutoBuilder::new(TokioExecutor::new())
                .serve_connection_with_upgrades(io, service)
                .await
            {
                tracing::debug!(error = %e, %peer, "connection error");
            }
        });
    }
}

fn load_tls_config(cert: &PathBuf, key: &PathBuf) -> Result<ServerConfig> {
    let cert_file = std::fs::File::open(cert)
        .with_context(|| format!("failed to open {}", cert.display()))?;
    let mut cert_reader = std::io::BufReader::new(cert_file);
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<std::result::Result<_, _>>()
        .context("failed to parse certificate chain")?;

    let key_file =
        std::fs::File::open(key).with_context(|| format!("failed to open {}", key.display()))?;
    let mut key_reader = std::io::BufReader::new(key_file);
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_reader)
        .context("failed to parse private key")?
        .context("no private key found in key file")?;

    ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("invalid certificate/key pair")
}
