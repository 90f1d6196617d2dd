use std::path::PathBuf;

use anyhow::{Context, Result};

/// Returns the base data directory, honouring `SUPERPOSITION_DATA_DIR`.
/// Defaults to `~/.superposition`.
pub fn data_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var("SUPERPOSITION_DATA_DIR") {
        return Ok(PathBuf::from(shellexpand::tilde(&dir).into_owned()));
    }
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".superposition"))
}

/// Bare clones of added repositories: `<data_dir>/repos`.
pub fn repos_dir() -> Result<PathBuf> {
    Ok(data_dir()?.join("repos"))
}

/// Active session working copies: `<data_dir>/worktrees`.
pub fn worktrees_dir() -> Result<PathBuf> {
    Ok(data_dir()?.join("worktrees"))
}

/// Working copy for a single session: `<data_dir>/worktrees/<session_id>`.
pub fn worktree_dir(session_id: &str) -> Result<PathBuf> {
    Ok(worktrees_dir()?.join(session_id))
}

/// The shepherd's Unix-domain socket: `<data_dir>/shepherd.sock`.
pub fn shepherd_socket_path() -> Result<PathBuf> {
    Ok(data_dir()?.join("shepherd.sock"))
}

/// The shepherd's pid file: `<data_dir>/shepherd.pid`.
pub fn shepherd_pid_path() -> Result<PathBuf> {
    Ok(data_dir()?.join("shepherd.pid"))
}

/// The shepherd's log file: `<data_dir>/logs/shepherd.log`.
pub fn shepherd_log_path() -> Result<PathBuf> {
    Ok(data_dir()?.join("logs").join("shepherd.log"))
}

/// Cached self-signed TLS material for the gateway: `<data_dir>/gateway-tls/{cert,key}.pem`.
pub fn gateway_tls_dir() -> Result<PathBuf> {
    Ok(data_dir()?.join("gateway-tls"))
}

/// The server's sqlite database file: `<data_dir>/server.db`.
pub fn database_path() -> Result<PathBuf> {
    Ok(data_dir()?.join("server.db"))
}

/// The user config file, honouring `SUPERPOSITION_CONFIG`.
/// Defaults to `$XDG_CONFIG_HOME/superposition/config.toml`.
pub fn default_config_path() -> Result<PathBuf> {
    if let Ok(path) = std::env::var("SUPERPOSITION_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).into_owned()));
    }
    let config = dirs::config_dir().context("Could not determine config directory")?;
    Ok(config.join("superposition").join("config.toml"))
}

/// Ensures all required data-directory subdirectories exist.
pub fn ensure_dirs() -> Result<()> {
    let dirs = [
        data_dir()?,
        data_dir()?.join("logs"),
        repos_dir()?,
        worktrees_dir()?,
        gateway_tls_dir()?,
    ];
    for dir in &dirs {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    }
    Ok(())
}
