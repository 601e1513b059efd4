//! Configuration loading from TOML files and environment variables.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::server::{default_socket_dir, DEFAULT_MAX_BUFFER, DEFAULT_MAX_CLIENTS};
use crate::tracker::{default_periods, PeriodConfig};

/// Smallest per-connection buffer that still fits a request and a short reply.
const MIN_BUFFER: usize = 64;

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub idle: IdleConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Tracking periods, in reporting order.
    #[serde(default = "default_periods")]
    pub periods: Vec<PeriodConfig>,
}

/// Query server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Directory for the socket file (default: `$XDG_RUNTIME_DIR/restwatch`).
    #[serde(default)]
    pub socket_dir: Option<PathBuf>,
    /// Socket file name inside `socket_dir`.
    #[serde(default = "default_socket_name")]
    pub socket_name: String,
    /// Maximum simultaneously connected clients.
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,
    /// Listen backlog for pending connections.
    #[serde(default = "default_backlog")]
    pub backlog: i32,
    /// Bound on each connection's input and output buffers, in bytes.
    #[serde(default = "default_max_buffer")]
    pub max_buffer: usize,
    /// Driver tick interval in milliseconds.
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_dir: None,
            socket_name: default_socket_name(),
            max_clients: default_max_clients(),
            backlog: default_backlog(),
            max_buffer: default_max_buffer(),
            tick_ms: default_tick_ms(),
        }
    }
}

impl ServerConfig {
    pub fn socket_dir(&self) -> PathBuf {
        self.socket_dir.clone().unwrap_or_else(default_socket_dir)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }
}

/// Idle detection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdleConfig {
    /// Input-free time before the user counts as idle, in milliseconds.
    #[serde(default = "default_idle_timeout_ms")]
    pub timeout_ms: u64,
    /// Check interval in milliseconds.
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,
}

impl Default for IdleConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_idle_timeout_ms(),
            check_interval_ms: default_check_interval_ms(),
        }
    }
}

impl IdleConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// Default value functions
fn default_socket_name() -> String {
    "socket.sock".to_string()
}

fn default_max_clients() -> usize {
    DEFAULT_MAX_CLIENTS
}

fn default_backlog() -> i32 {
    1
}

fn default_max_buffer() -> usize {
    DEFAULT_MAX_BUFFER
}

fn default_tick_ms() -> u64 {
    20
}

fn default_idle_timeout_ms() -> u64 {
    1000
}

fn default_check_interval_ms() -> u64 {
    250
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            idle: IdleConfig::default(),
            logging: LoggingConfig::default(),
            periods: default_periods(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
        Ok(config)
    }

    /// Load configuration with environment variable overrides.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = config_path {
            Self::from_file(path)?
        } else {
            // Try default config locations
            let default_paths = [
                PathBuf::from("config/default.toml"),
                dirs::config_dir()
                    .map(|d| d.join("restwatch/config.toml"))
                    .unwrap_or_default(),
            ];

            let mut loaded = None;
            for path in &default_paths {
                if path.is_file() {
                    loaded = Some(Self::from_file(path)?);
                    break;
                }
            }
            loaded.unwrap_or_default()
        };

        config.apply_overrides(|key| std::env::var(key).ok());

        if let Some(dir) = &config.server.socket_dir {
            config.server.socket_dir = Some(expand_tilde(dir));
        }

        Ok(config)
    }

    /// Apply `RESTWATCH_*` overrides looked up through `lookup`.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(val) = lookup("RESTWATCH_SOCKET_DIR") {
            self.server.socket_dir = Some(PathBuf::from(val));
        }
        if let Some(val) = lookup("RESTWATCH_MAX_CLIENTS") {
            if let Ok(v) = val.parse() {
                self.server.max_clients = v;
            }
        }
        if let Some(val) = lookup("RESTWATCH_TICK_MS") {
            if let Ok(v) = val.parse() {
                self.server.tick_ms = v;
            }
        }
        if let Some(val) = lookup("RESTWATCH_IDLE_TIMEOUT_MS") {
            if let Ok(v) = val.parse() {
                self.idle.timeout_ms = v;
            }
        }
        if let Some(val) = lookup("RESTWATCH_LOG_LEVEL") {
            self.logging.level = val;
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.server.max_clients == 0 {
            anyhow::bail!("max_clients must be greater than 0");
        }
        if self.server.max_buffer < MIN_BUFFER {
            anyhow::bail!("max_buffer must be at least {} bytes", MIN_BUFFER);
        }
        if self.server.backlog < 1 {
            anyhow::bail!("backlog must be at least 1");
        }
        if self.server.socket_name.is_empty() || self.server.socket_name.contains('/') {
            anyhow::bail!("socket_name must be a plain file name");
        }
        if self.server.tick_ms == 0 {
            anyhow::bail!("Tick interval must be greater than 0");
        }
        if self.idle.timeout_ms == 0 {
            anyhow::bail!("Idle timeout must be greater than 0");
        }
        if self.idle.check_interval_ms == 0 {
            anyhow::bail!("Idle check interval must be greater than 0");
        }
        if self.periods.is_empty() {
            anyhow::bail!("At least one tracking period must be configured");
        }

        let mut names = HashSet::new();
        for period in &self.periods {
            if period.name.is_empty() {
                anyhow::bail!("Tracking period names cannot be empty");
            }
            if !names.insert(period.name.as_str()) {
                anyhow::bail!("Duplicate tracking period '{}'", period.name);
            }
            if period.reset_seconds > 0 && period.reset_seconds >= period.break_seconds {
                anyhow::bail!(
                    "Period '{}': reset_seconds ({}) must be less than break_seconds ({})",
                    period.name,
                    period.reset_seconds,
                    period.break_seconds
                );
            }
        }
        Ok(())
    }
}

/// Expand ~ to home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(rest) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
