//! Configuration module for upcase-server.
//!
//! Supports both command-line arguments and TOML configuration file.
//! CLI arguments take precedence over config file values.

use clap::{Parser, ValueEnum};
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

/// What happens to a connection once its response has been written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionPolicy {
    /// Keep the connection registered for further requests until it goes idle.
    #[default]
    KeepAlive,
    /// Shut the connection down after one request/response exchange.
    Close,
}

/// Command-line arguments for the server
#[derive(Parser, Debug)]
#[command(name = "upcase-server")]
#[command(author = "upcase-server authors")]
#[command(version = "0.1.0")]
#[command(about = "A readiness-based TCP server that upper-cases each request", long_about = None)]
pub struct CliArgs {
    /// Port to listen on
    pub port: Option<u16>,

    /// Path to TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// IPv4 address to bind to
    #[arg(long)]
    pub host: Option<String>,

    /// Maximum number of simultaneously open client connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Seconds a keep-alive connection may stay idle (0 = never time out)
    #[arg(long)]
    pub idle_timeout: Option<u64>,

    /// Connection policy after a response has been written
    #[arg(long, value_enum)]
    pub policy: Option<ConnectionPolicy>,

    /// Log level (trace, debug, info, warn, error) [default: info]
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log request and response payloads at debug level
    #[arg(long)]
    pub log_payloads: bool,
}

/// TOML configuration file structure
#[derive(Debug, Deserialize, Default)]
pub struct TomlConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listener-related configuration
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to bind to
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on
    pub port: Option<u16>,
    /// Connection cap
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: None,
            max_connections: default_max_connections(),
        }
    }
}

/// Per-connection lifecycle configuration
#[derive(Debug, Deserialize)]
pub struct ConnectionConfig {
    /// Idle timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,
    #[serde(default)]
    pub policy: ConnectionPolicy,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            idle_timeout: default_idle_timeout(),
            policy: ConnectionPolicy::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log payload contents
    #[serde(default)]
    pub payloads: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            payloads: false,
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_max_connections() -> usize {
    1024
}

fn default_idle_timeout() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Final resolved configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub host: Ipv4Addr,
    pub port: u16,
    pub max_connections: usize,
    /// `None` disables the idle sweep.
    pub idle_timeout: Option<Duration>,
    pub policy: ConnectionPolicy,
    pub log_level: String,
    pub log_payloads: bool,
}

impl Config {
    /// Load configuration from CLI args and optional TOML file.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_args(CliArgs::parse())
    }

    /// Merge parsed CLI args with the TOML file they point at, if any.
    /// CLI arguments take precedence over TOML file values.
    pub fn from_args(cli: CliArgs) -> Result<Self, ConfigError> {
        let toml_config = if let Some(ref config_path) = cli.config {
            let contents = std::fs::read_to_string(config_path)
                .map_err(|e| ConfigError::FileRead(config_path.clone(), e))?;
            toml::from_str(&contents)
                .map_err(|e| ConfigError::TomlParse(config_path.clone(), e))?
        } else {
            TomlConfig::default()
        };

        let port = cli
            .port
            .or(toml_config.server.port)
            .ok_or(ConfigError::MissingPort)?;

        let host_str = cli.host.unwrap_or(toml_config.server.host);
        let host: Ipv4Addr = host_str
            .parse()
            .map_err(|_| ConfigError::InvalidHost(host_str.clone()))?;

        let idle_secs = cli
            .idle_timeout
            .unwrap_or(toml_config.connection.idle_timeout);

        Ok(Config {
            host,
            port,
            max_connections: cli
                .max_connections
                .unwrap_or(toml_config.server.max_connections),
            idle_timeout: (idle_secs > 0).then(|| Duration::from_secs(idle_secs)),
            policy: cli.policy.unwrap_or(toml_config.connection.policy),
            log_level: cli.log_level.unwrap_or(toml_config.logging.level),
            log_payloads: cli.log_payloads || toml_config.logging.payloads,
        })
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {err}", path = .0.display(), err = .1)]
    FileRead(PathBuf, #[source] std::io::Error),
    #[error("Failed to parse config file '{path}': {err}", path = .0.display(), err = .1)]
    TomlParse(PathBuf, #[source] toml::de::Error),
    #[error("No port given: pass PORT or set server.port in the config file")]
    MissingPort,
    #[error("Invalid IPv4 host '{0}'")]
    InvalidHost(String),
}
