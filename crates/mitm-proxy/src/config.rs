//! Layered configuration.
//!
//! Precedence, highest wins: CLI positional arg → environment (`MITM_*`,
//! loaded via `dotenvy` then `config`) → TOML file under the user's config
//! directory → built-in defaults matching the source's compile-time
//! constants.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

fn default_upstream_host() -> String {
    "2b2t.org".to_string()
}

fn default_listen_port() -> u16 {
    25565
}

fn default_auth_port() -> u16 {
    8080
}

fn default_capture_dir() -> String {
    "saved".to_string()
}

/// Resolved proxy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Real server to connect outbound to.
    #[serde(default = "default_upstream_host")]
    pub upstream_host: String,

    /// Port the client-facing listener binds, and the port used to reach
    /// `upstream_host`. The source hardcodes 25565 for both.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Port the loopback session-server impersonation endpoint binds.
    #[serde(default = "default_auth_port")]
    pub auth_port: u16,

    /// Directory `.mcs` capture files are written into.
    #[serde(default = "default_capture_dir")]
    pub capture_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            upstream_host: default_upstream_host(),
            listen_port: default_listen_port(),
            auth_port: default_auth_port(),
            capture_dir: default_capture_dir(),
        }
    }
}

impl Config {
    /// Path to the on-disk config file: `<config_dir>/mitm-proxy/config.toml`.
    pub fn config_path() -> Result<PathBuf> {
        let mut dir = dirs::config_dir().context("could not determine user config directory")?;
        dir.push("mitm-proxy");
        dir.push("config.toml");
        Ok(dir)
    }

    /// Load the on-disk file if present, then apply `MITM_*` environment
    /// overrides, then apply `cli_host` (the CLI's positional arg) last.
    pub fn load(cli_host: Option<String>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let path = Self::config_path()?;
        let mut builder = config::Config::builder();
        if path.exists() {
            builder = builder.add_source(config::File::from(path.as_path()));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("MITM")
                .try_parsing(true)
                .separator("_"),
        );

        let settings = builder.build().context("failed to assemble configuration")?;

        let mut cfg: Config = match settings.try_deserialize() {
            Ok(cfg) => cfg,
            Err(_) => Config::default(),
        };

        if let Some(host) = cli_host {
            cfg.upstream_host = host;
        }

        Ok(cfg)
    }

    /// Write the current config back to [`Config::config_path`], creating
    /// parent directories as needed.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let toml = toml::to_string_pretty(self)?;
        std::fs::write(path, toml)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_source_constants() {
        let cfg = Config::default();
        assert_eq!(cfg.upstream_host, "2b2t.org");
        assert_eq!(cfg.listen_port, 25565);
        assert_eq!(cfg.auth_port, 8080);
        assert_eq!(cfg.capture_dir, "saved");
    }

    #[test]
    fn serializes_round_trip_through_toml() {
        let cfg = Config::default();
        let toml = toml::to_string_pretty(&cfg).unwrap();
        let back: Config = toml::from_str(&toml).unwrap();
        assert_eq!(back.upstream_host, cfg.upstream_host);
        assert_eq!(back.listen_port, cfg.listen_port);
    }
}
