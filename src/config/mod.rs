//! Configuration module - environment variable parsing

use std::env;
use std::net::SocketAddr;
use std::time::Duration;

/// Application configuration loaded from environment variables
#[derive(Clone, Debug)]
pub struct Config {
    /// Server binding address
    pub server_addr: SocketAddr,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Allowed client origins for CORS (comma-separated), any origin when unset
    pub client_origin: Option<String>,

    /// Room used when a JOIN carries no room id
    pub default_room: String,
    /// Heartbeat staleness threshold before a player is kicked
    pub heartbeat_timeout: Duration,
    /// Period of the liveness sweep
    pub liveness_sweep: Duration,
    /// Kick players that stayed unfocused for this long (disabled when unset)
    pub inactive_kick: Option<Duration>,
    /// Per-connection inbound message budget per second (unlimited when unset)
    pub message_rate_limit: Option<u32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            log_level: "info".to_string(),
            client_origin: None,
            default_room: "default".to_string(),
            heartbeat_timeout: Duration::from_secs(15),
            liveness_sweep: Duration::from_secs(10),
            inactive_kick: None,
            message_rate_limit: None,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        // Hosting platforms provide PORT, fall back to SERVER_ADDR or default
        let server_addr = match env::var("PORT") {
            Ok(port) => format!("0.0.0.0:{}", port)
                .parse()
                .map_err(|_| ConfigError::InvalidAddress)?,
            Err(_) => match env::var("SERVER_ADDR") {
                Ok(addr) => addr.parse().map_err(|_| ConfigError::InvalidAddress)?,
                Err(_) => defaults.server_addr,
            },
        };

        Ok(Self {
            server_addr,
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
            client_origin: env::var("CLIENT_ORIGIN").ok().filter(|s| !s.trim().is_empty()),
            default_room: env::var("DEFAULT_ROOM").unwrap_or(defaults.default_room),
            heartbeat_timeout: secs_var("HEARTBEAT_TIMEOUT_SECS")?
                .unwrap_or(defaults.heartbeat_timeout),
            liveness_sweep: secs_var("LIVENESS_SWEEP_SECS")?.unwrap_or(defaults.liveness_sweep),
            inactive_kick: secs_var("INACTIVE_KICK_SECS")?,
            message_rate_limit: u32_var("MESSAGE_RATE_LIMIT")?,
        })
    }
}

fn u32_var(name: &'static str) -> Result<Option<u32>, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u32>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidNumber(name)),
        Err(_) => Ok(None),
    }
}

fn secs_var(name: &'static str) -> Result<Option<Duration>, ConfigError> {
    Ok(u32_var(name)?.map(|secs| Duration::from_secs(u64::from(secs))))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid numeric value for environment variable: {0}")]
    InvalidNumber(&'static str),

    #[error("Invalid server address format")]
    InvalidAddress,
}
