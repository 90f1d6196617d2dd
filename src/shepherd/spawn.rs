//! Auto-spawn of the shepherd (§4.C): `serve` and the session-inspection
//! CLI commands both need a live shepherd and shouldn't force the user to
//! start one by hand. Grounded on the teacher's `daemon/spawn.rs`
//! double-fork-and-re-exec dance, generalized from its single
//! `COOP_DAEMON_MODE` marker to this crate's shepherd socket/pid files.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::net::UnixStream;

use crate::config::{paths, Config};

const SHEPHERD_MODE_ENV: &str = "SUPERPOSITION_SHEPHERD_MODE";
const STARTUP_TIMEOUT: Duration = Duration::from_millis(2500);

/// Ensures a shepherd is reachable at the well-known socket, spawning one
/// in the background if not.
pub async fn ensure_running(config: &Config) -> Result<()> {
    let socket_path = paths::shepherd_socket_path()?;

    if socket_path.exists() && UnixStream::connect(&socket_path).await.is_ok() {
        return Ok(());
    }

    spawn_detached()?;
    wait_for_socket(&socket_path).await
}

async fn wait_for_socket(socket_path: &Path) -> Result<()> {
    let deadline = tokio::time::Instant::now() + STARTUP_TIMEOUT;
    loop {
        if UnixStream::connect(socket_path).await.is_ok() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            bail!(
                "shepherd did not become reachable at {} within {:?}",
                socket_path.display(),
                STARTUP_TIMEOUT
            );
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Double-forks so the shepherd survives the spawning process's exit,
/// detaches from the controlling terminal, then re-execs itself in
/// shepherd mode with stdout/stderr redirected to the shepherd log file.
fn spawn_detached() -> Result<()> {
    let exe = std::env::current_exe().context("failed to resolve current executable path")?;

    match unsafe { fork::fork() } {
        Ok(fork::Fork::Parent(_)) => Ok(()),
        Ok(fork::Fork::Child) => {
            let _ = unsafe { nix::libc::setsid() };
            match unsafe { fork::fork() } {
                Ok(fork::Fork::Parent(_)) => std::process::exit(0),
                Ok(fork::Fork::Child) => {
                    run_shepherd_process(&exe);
                    std::process::exit(0);
                }
                Err(e) => {
                    eprintln!("second fork failed: {e}");
                    std::process::exit(1);
                }
            }
        }
        Err(e) => bail!("fork failed: {e}"),
    }
}

fn run_shepherd_process(exe: &Path) {
    let log_path = match paths::shepherd_log_path() {
        Ok(p) => p,
        Err(e) => {
            eprintln!("failed to resolve shepherd log path: {e}");
            return;
        }
    };
    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let stdout = std::fs::File::create(&log_path);
    let stderr = std::fs::File::create(&log_path);
    let (Ok(stdout), Ok(stderr)) = (stdout, stderr) else {
        eprintln!("failed to open shepherd log file {}", log_path.display());
        return;
    };

    let status = std::process::Command::new(exe)
        .env(SHEPHERD_MODE_ENV, "1")
        .stdout(stdout)
        .stderr(stderr)
        .spawn();

    if let Err(e) = status {
        eprintln!("failed to exec shepherd: {e}");
    }
}

/// Checked by `main` before CLI parsing: a process re-exec'd by
/// [`spawn_detached`] skips argument parsing entirely and runs the
/// shepherd loop directly.
pub fn is_shepherd_mode() -> bool {
    std::env::var(SHEPHERD_MODE_ENV).is_ok()
}
