use anyhow::Result;
use clap::Parser;

use superposition::cli::{self, Cli};
use superposition::{config, shepherd};

#[tokio::main]
async fn main() -> Result<()> {
    // A process re-exec'd by `shepherd::spawn::ensure_running` carries this
    // marker and skips straight to the shepherd loop, bypassing CLI parsing
    // (and the terminal it no longer has) entirely.
    if shepherd::spawn::is_shepherd_mode() {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::from_default_env()
                    .add_directive("superposition=info".parse()?),
            )
            .init();

        config::paths::ensure_dirs()?;
        let cfg = std::sync::Arc::new(config::Config::load(None)?);
        if let Err(e) = shepherd::run(cfg).await {
            tracing::error!(error = %e, "shepherd exited with an error");
            std::process::exit(1);
        }
        return Ok(());
    }

    let cli = Cli::parse();
    if let Err(e) = cli::run(cli).await {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}
