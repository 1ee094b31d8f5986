//! Configuration module for the relay server.
//!
//! Supports both command-line arguments and a TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Args, Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Command-line interface for the relay binary.
#[derive(Parser, Debug)]
#[command(name = "chat-relay")]
#[command(version = "0.1.0")]
#[command(about = "A TCP chat relay server", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the server and listen for incoming connections
    Run(RunArgs),
    /// Manage repository git hooks
    Hooks(HooksArgs),
}

/// Flags for the `run` subcommand.
#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long)]
    pub address: Option<String>,

    /// Port to listen on
    #[arg(long)]
    pub port: Option<u16>,

    /// Backend connection URL (e.g. redis://127.0.0.1:6379/0)
    #[arg(long)]
    pub backend_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    pub log_level: Option<String>,
}

/// Flags for the `hooks` subcommand.
#[derive(Args, Debug)]
pub struct HooksArgs {
    /// Install hooks
    #[arg(long)]
    pub install: bool,

    /// Uninstall hooks
    #[arg(long)]
    pub uninstall: bool,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub backend: BackendSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Listener-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerSection {
    /// Address to bind to
    #[serde(default = "default_address")]
    pub address: String,
    /// Port to bind to
    #[serde(default = "default_port")]
    pub port: u16,
    /// Maximum number of concurrent sessions
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: default_port(),
            max_connections: default_max_connections(),
        }
    }
}

/// Backend-related configuration
#[derive(Debug, Deserialize)]
pub struct BackendSection {
    /// Backend connection URL
    #[serde(default = "default_backend_url")]
    pub url: String,
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            url: default_backend_url(),
        }
    }
}

/// Session-related configuration
#[derive(Debug, Deserialize)]
pub struct SessionSection {
    /// Seconds between heartbeats; also the idle-deadline window
    #[serde(default = "default_ping_interval")]
    pub ping_interval_secs: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ping_interval(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingSection {
    /// Log level for stderr diagnostics
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Directory the per-subsystem log files are written to
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            dir: default_log_dir(),
        }
    }
}

fn default_address() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_max_connections() -> usize {
    10_000
}

fn default_backend_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}

fn default_ping_interval() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from(".")
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub address: String,
    pub port: u16,
    pub max_connections: usize,
    pub backend_url: String,
    pub ping_interval_secs: u64,
    pub log_level: String,
    pub log_dir: PathBuf,
}

impl Config {
    /// Resolve configuration from CLI flags and the optional TOML file.
    /// CLI flags take precedence over file values.
    pub fn load(args: RunArgs) -> Result<Config, ConfigError> {
        let toml_config = if let Some(ref config_path) = args.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents).map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        Ok(Config {
            address: args.address.unwrap_or(toml_config.server.address),
            port: args.port.unwrap_or(toml_config.server.port),
            max_connections: toml_config.server.max_connections,
            backend_url: args.backend_url.unwrap_or(toml_config.backend.url),
            ping_interval_secs: toml_config.session.ping_interval_secs,
            log_level: args.log_level.unwrap_or(toml_config.logging.level),
            log_dir: toml_config.logging.dir,
        })
    }

    /// The full listen address, `host:port`.
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Interval between heartbeats; doubles as the session deadline window.
    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }

    /// Resolve a log file name under the configured log directory.
    pub fn log_path(&self, name: &str) -> PathBuf {
        self.log_dir.join(name)
    }
}

/// Configuration loading errors
#[derive(Debug)]
pub enum ConfigError {
    FileRead(PathBuf, std::io::Error),
    TomlParse(PathBuf, toml::de::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::FileRead(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::TomlParse(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
