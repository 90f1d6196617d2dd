//! Server configuration: a TOML document merged over built-in defaults,
//! then overridden by environment variables. Mirrors the strictness of the
//! teacher's Coopfile (`deny_unknown_fields`) so a typo in the config file
//! is a hard error rather than a silently-ignored key.

pub mod paths;

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub use paths::*;

/// Top-level server configuration (`config.toml`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    /// CLI command names permitted as a session's `cmdName` (§6 allow-list).
    pub allowed_clis: Vec<String>,
    /// Seconds of no active sessions after which the shepherd exits.
    pub shepherd_idle_timeout_secs: u64,
    /// Size of the per-session replay ring, in bytes.
    pub replay_ring_bytes: usize,
    /// Capacity of a per-subscriber bounded output queue, in chunks.
    pub subscriber_queue_capacity: usize,
    pub web: WebConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct WebConfig {
    pub host: String,
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            allowed_clis: vec!["claude".into(), "codex".into(), "gemini".into()],
            shepherd_idle_timeout_secs: 30,
            replay_ring_bytes: 100 * 1024,
            subscriber_queue_capacity: 256,
            web: WebConfig::default(),
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
        }
    }
}

impl Config {
    pub fn shepherd_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.shepherd_idle_timeout_secs)
    }

    /// Whether `cli` is permitted as a session command. The shepherd itself
    /// does not enforce this (§6) — callers (the REST layer, the CLI) must.
    pub fn is_cli_allowed(&self, cli: &str) -> bool {
        self.allowed_clis.iter().any(|c| c == cli)
    }

    /// Load configuration: defaults, then the config file at `path` (or the
    /// platform default if `path` is `None` and the default file exists),
    /// then environment variable overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = Config::default();

        let resolved_path = match path {
            Some(p) => Some(p.to_path_buf()),
            None => {
                let default = paths::default_config_path()?;
                if default.exists() {
                    Some(default)
                } else {
                    None
                }
            }
        };

        if let Some(path) = resolved_path {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            config = toml::from_str(&text)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        }

        if let Ok(clis) = std::env::var("SUPERPOSITION_CLIS") {
            config.allowed_clis = clis.split(',').map(|s| s.trim().to_string()).collect();
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_allows_known_clis() {
        let config = Config::default();
        assert!(config.is_cli_allowed("claude"));
        assert!(config.is_cli_allowed("codex"));
        assert!(!config.is_cli_allowed("bash"));
    }

    #[test]
    fn rejects_unknown_keys() {
        let toml_text = "not_a_real_field = true";
        let result: std::result::Result<Config, _> = toml::from_str(toml_text);
        assert!(result.is_err());
    }

    #[test]
    fn parses_partial_overrides() {
        let toml_text = r#"
            shepherd_idle_timeout_secs = 60

            [web]
            port = 9090
        "#;
        let config: Config = toml::from_str(toml_text).unwrap();
        assert_eq!(config.shepherd_idle_timeout_secs, 60);
        assert_eq!(config.web.port, 9090);
        assert_eq!(config.web.host, "127.0.0.1");
    }
}
