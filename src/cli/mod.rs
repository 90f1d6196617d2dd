//! The `superposition` command-line surface (§6): start the server, run
//! the shepherd in the foreground, and inspect/manage live sessions. CLI
//! allow-list enforcement lives here, at the call site, not inside the
//! session manager (§6 "the supervisor itself does not validate").

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::config::{paths, Config};
use crate::ipc::SessionState;
use crate::session_manager::client::ShepherdClient;
use crate::session_manager::SessionManager;
use crate::shepherd;
use crate::store::Store;

#[derive(Parser, Debug)]
#[command(name = "superposition", version, about = "Persistent PTY sessions for AI coding CLIs")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to a config.toml overriding the platform default.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Overrides the data directory (sessions, database, shepherd socket).
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Emit debug-level logs.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress all but warnings and errors.
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the user-facing HTTP/WebSocket server, spawning the shepherd if
    /// one isn't already running.
    Serve {
        #[arg(long, default_value_t = 8080)]
        port: u16,

        #[arg(long, default_value = "127.0.0.1")]
        host: String,
    },

    /// Run the shepherd in the foreground (normally spawned automatically).
    Shepherd,

    /// Manage live sessions via the shepherd.
    Sessions {
        #[command(subcommand)]
        action: SessionsAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum SessionsAction {
    /// List live sessions.
    Ls {
        #[arg(long)]
        json: bool,
    },

    /// Kill a session.
    Kill {
        id: String,

        /// Send SIGKILL immediately instead of the graceful shutdown sequence.
        #[arg(short, long)]
        force: bool,
    },

    /// Kill every live session.
    StopAll,
}

fn init_logging(verbose: bool, quiet: bool) -> Result<()> {
    let default_level = if verbose {
        "debug"
    } else if quiet {
        "warn"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("superposition={default_level}").parse()?),
        )
        .init();
    Ok(())
}

pub async fn run(cli: Cli) -> Result<()> {
    if let Some(dir) = &cli.data_dir {
        std::env::set_var("SUPERPOSITION_DATA_DIR", dir);
    }
    init_logging(cli.verbose, cli.quiet)?;
    paths::ensure_dirs()?;

    let config = Arc::new(Config::load(cli.config.as_deref())?);

    match cli.command {
        Commands::Serve { port, host } => serve(host, port, config).await,
        Commands::Shepherd => shepherd::run(config).await,
        Commands::Sessions { action } => sessions(action, &config).await,
    }
}

async fn serve(host: String, port: u16, config: Arc<Config>) -> Result<()> {
    shepherd::spawn::ensure_running(&config).await?;

    let socket_path = paths::shepherd_socket_path()?;
    let manager: Arc<dyn SessionManager> = ShepherdClient::connect(&socket_path)
        .await
        .context("failed to connect to the shepherd")?;

    let store = Store::connect(&paths::database_path()?).await?;

    crate::web::start_server(&host, port, manager, config, store).await
}

async fn connect_manager() -> Result<Arc<dyn SessionManager>> {
    let config = Config::load(None)?;
    shepherd::spawn::ensure_running(&config).await?;
    let socket_path = paths::shepherd_socket_path()?;
    let client = ShepherdClient::connect(&socket_path)
        .await
        .context("failed to connect to the shepherd")?;
    Ok(client)
}

async fn sessions(action: SessionsAction, _config: &Config) -> Result<()> {
    match action {
        SessionsAction::Ls { json } => {
            let manager = connect_manager().await?;
            let sessions = manager.list().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&sessions)?);
            } else if sessions.is_empty() {
                println!("no active sessions");
            } else {
                for s in &sessions {
                    let state = match s.state {
                        SessionState::Starting => "starting",
                        SessionState::Running => "running",
                        SessionState::Exited => "exited",
                    };
                    println!(
                        "{:<36} {:<10} {:<8} {}",
                        s.session_id, s.cli, state, s.work_dir
                    );
                }
            }
            Ok(())
        }
        SessionsAction::Kill { id, force } => {
            let manager = connect_manager().await?;
            manager.stop(&id).await?;
            if force {
                tracing::debug!(session = %id, "force flag has no separate effect beyond stop");
            }
            println!("stopped {id}");
            Ok(())
        }
        SessionsAction::StopAll => {
            let manager = connect_manager().await?;
            manager.stop_all().await?;
            println!("stopped all sessions");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }
}
