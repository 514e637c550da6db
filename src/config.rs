//! Server configuration.
//!
//! Loaded from a JSON file (`--config`), or from the `SCRIPTD_CONFIG`
//! environment variable as JSON text, or built from defaults. A few
//! environment variables override individual fields afterwards.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::debug;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub compiler: CompilerConfig,

    #[serde(default)]
    pub display: DisplayConfig,

    #[serde(default)]
    pub rpc: RpcConfig,

    #[serde(default)]
    pub shell: ShellConfig,
}

/// Listener settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address of the script-submission listener.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port of the script-submission listener. `0` picks a free port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Local name of the control listener.
    #[serde(default = "default_control_name")]
    pub control_name: String,

    /// Directory holding local socket files (control and RPC services).
    #[serde(default = "default_socket_dir")]
    pub socket_dir: PathBuf,

    /// How `STOP_SCRIPT` restarts the server.
    #[serde(default)]
    pub restart_mode: RestartMode,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            control_name: default_control_name(),
            socket_dir: default_socket_dir(),
            restart_mode: RestartMode::default(),
        }
    }
}

/// Restart strategies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartMode {
    /// Tear down listeners and start a fresh generation in this process.
    #[default]
    InProcess,
    /// Replace the process image with a fresh copy of the executable.
    Exec,
}

/// Script compilation settings.
#[derive(Debug, Clone, Deserialize)]
pub struct CompilerConfig {
    /// Source extension pulled in as sibling units.
    #[serde(default = "default_extension")]
    pub extension: String,

    /// Staging directory, relative to the script's working directory.
    #[serde(default = "default_staging_dir_name")]
    pub staging_dir_name: String,

    /// Operation budget per script run; `0` means unlimited.
    #[serde(default)]
    pub max_operations: u64,
}

impl Default for CompilerConfig {
    fn default() -> Self {
        Self {
            extension: default_extension(),
            staging_dir_name: default_staging_dir_name(),
            max_operations: 0,
        }
    }
}

/// Display metadata used when no device is attached.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct DisplayConfig {
    #[serde(default = "default_width")]
    pub width: u32,

    #[serde(default = "default_height")]
    pub height: u32,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
        }
    }
}

/// RPC proxy settings.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct RpcConfig {
    /// Upper bound on one call's round trip.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

impl RpcConfig {
    pub const fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

/// Interactive shell client settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ShellConfig {
    /// Server address the shell connects to.
    #[serde(default = "default_shell_addr")]
    pub addr: String,

    /// Working directory sent with every request.
    #[serde(default = "default_shell_dir")]
    pub working_dir: String,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            addr: default_shell_addr(),
            working_dir: default_shell_dir(),
        }
    }
}

impl Config {
    /// Load configuration.
    ///
    /// Priority: `path` > `SCRIPTD_CONFIG` env var > defaults; then the
    /// `SCRIPTD_PORT` and `SCRIPTD_SOCKET_DIR` overrides apply.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            Self::from_json(&text)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?
        } else if let Ok(text) = std::env::var("SCRIPTD_CONFIG") {
            Self::from_json(&text).context("Failed to parse SCRIPTD_CONFIG")?
        } else {
            debug!("No configuration given, using defaults");
            Self::default()
        };

        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Parse configuration from JSON text.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse JSON")?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(port) = std::env::var("SCRIPTD_PORT") {
            self.server.port = port
                .parse()
                .with_context(|| format!("Invalid SCRIPTD_PORT: {port}"))?;
        }
        if let Ok(dir) = std::env::var("SCRIPTD_SOCKET_DIR") {
            self.server.socket_dir = PathBuf::from(dir);
        }
        Ok(())
    }

    /// Path of the control socket.
    pub fn control_socket(&self) -> PathBuf {
        crate::transport::local::socket_path(&self.server.socket_dir, &self.server.control_name)
    }

    /// `host:port` of the script-submission listener.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

fn default_host() -> String {
    "0.0.0.0".into()
}

const fn default_port() -> u16 {
    9800
}

fn default_control_name() -> String {
    "scriptd.shell".into()
}

fn default_socket_dir() -> PathBuf {
    std::env::temp_dir()
}

fn default_extension() -> String {
    "rhai".into()
}

fn default_staging_dir_name() -> String {
    ".staging".into()
}

const fn default_width() -> u32 {
    1080
}

const fn default_height() -> u32 {
    1920
}

const fn default_call_timeout_ms() -> u64 {
    30_000
}

fn default_shell_addr() -> String {
    "127.0.0.1:9800".into()
}

fn default_shell_dir() -> String {
    ".".into()
}
