//! Tether configuration.
//!
//! The adapter reads an optional TOML file:
//!
//! ```toml
//! [logging]
//! level = "debug"          # or any `EnvFilter` directive string
//! json = false
//! file = "/tmp/tether.log"
//!
//! [debugger]
//! path = "/usr/local/bin/dlv"
//! args = ["--check-go-version=false"]
//! run_control_timeout_ms = 30000
//!
//! [maps]
//! dir = "build/maps"
//!
//! [server]
//! listen = "127.0.0.1:4711"
//! ```
//!
//! Command line flags override values loaded from the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod logging;

pub use logging::{init_tracing, LoggingConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(String),
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        // The default `Display` includes a source snippet; keep only the message.
        ConfigError::Toml(err.message().to_string())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TetherConfig {
    #[serde(default)]
    pub logging: LoggingConfig,

    /// How the native debugger is located and driven.
    #[serde(default)]
    pub debugger: DebuggerConfig,

    #[serde(default)]
    pub maps: MapsConfig,

    #[serde(default)]
    pub server: ServerConfig,
}

impl TetherConfig {
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::load_from_str(&text)
    }

    pub fn load_from_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DebuggerConfig {
    /// Native debugger executable. Resolved through `PATH` when not absolute.
    #[serde(default = "DebuggerConfig::default_path")]
    pub path: PathBuf,

    /// Extra arguments inserted before the headless-mode flags.
    #[serde(default)]
    pub args: Vec<String>,

    /// How long to wait for the "listening at" announcement after spawning.
    #[serde(default = "DebuggerConfig::default_announce_timeout_ms")]
    pub announce_timeout_ms: u64,

    #[serde(default = "DebuggerConfig::default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Upper bound for `continue`/`next`/`stepIn`/`stepOut`.
    #[serde(default = "DebuggerConfig::default_run_control_timeout_ms")]
    pub run_control_timeout_ms: u64,

    /// Wait for a killed debugger process to be reaped after a failed launch.
    #[serde(default = "DebuggerConfig::default_reap_timeout_ms")]
    pub reap_timeout_ms: u64,

    /// Wait for the debugger process to exit after detach.
    #[serde(default = "DebuggerConfig::default_exit_timeout_ms")]
    pub exit_timeout_ms: u64,
}

impl DebuggerConfig {
    fn default_path() -> PathBuf {
        PathBuf::from("dlv")
    }

    fn default_announce_timeout_ms() -> u64 {
        5_000
    }

    fn default_request_timeout_ms() -> u64 {
        10_000
    }

    fn default_run_control_timeout_ms() -> u64 {
        30_000
    }

    fn default_reap_timeout_ms() -> u64 {
        2_000
    }

    fn default_exit_timeout_ms() -> u64 {
        5_000
    }

    pub fn announce_timeout(&self) -> Duration {
        Duration::from_millis(self.announce_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn run_control_timeout(&self) -> Duration {
        Duration::from_millis(self.run_control_timeout_ms)
    }

    pub fn reap_timeout(&self) -> Duration {
        Duration::from_millis(self.reap_timeout_ms)
    }

    pub fn exit_timeout(&self) -> Duration {
        Duration::from_millis(self.exit_timeout_ms)
    }
}

impl Default for DebuggerConfig {
    fn default() -> Self {
        Self {
            path: Self::default_path(),
            args: Vec::new(),
            announce_timeout_ms: Self::default_announce_timeout_ms(),
            request_timeout_ms: Self::default_request_timeout_ms(),
            run_control_timeout_ms: Self::default_run_control_timeout_ms(),
            reap_timeout_ms: Self::default_reap_timeout_ms(),
            exit_timeout_ms: Self::default_exit_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MapsConfig {
    /// Directory holding `*.map.json` files written by the compiler.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Serve DAP over TCP on this address instead of stdio.
    #[serde(default)]
    pub listen: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = TetherConfig::load_from_str("").unwrap();
        assert_eq!(config, TetherConfig::default());
        assert_eq!(config.debugger.path, PathBuf::from("dlv"));
        assert_eq!(config.debugger.run_control_timeout(), Duration::from_secs(30));
        assert_eq!(config.debugger.announce_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn parses_all_sections() {
        let config = TetherConfig::load_from_str(
            r#"
            [logging]
            level = "debug"
            json = true

            [debugger]
            path = "/opt/dlv"
            args = ["--log"]
            request_timeout_ms = 250

            [maps]
            dir = "build/maps"

            [server]
            listen = "127.0.0.1:4711"
            "#,
        )
        .unwrap();

        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);
        assert_eq!(config.debugger.path, PathBuf::from("/opt/dlv"));
        assert_eq!(config.debugger.args, vec!["--log".to_string()]);
        assert_eq!(config.debugger.request_timeout(), Duration::from_millis(250));
        assert_eq!(config.debugger.exit_timeout(), Duration::from_secs(5));
        assert_eq!(config.maps.dir, Some(PathBuf::from("build/maps")));
        assert_eq!(config.server.listen.as_deref(), Some("127.0.0.1:4711"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = TetherConfig::load_from_str("[debugger]\nbogus = 1\n").unwrap_err();
        assert!(matches!(err, ConfigError::Toml(_)));
    }

    #[test]
    fn missing_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.toml");
        let err = TetherConfig::load_from_path(&path).unwrap_err();
        assert!(err.to_string().contains("missing.toml"), "{err}");
    }
}
