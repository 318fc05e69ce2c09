//! Server configuration loading from file and environment variables.

use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use thiserror::Error;

use crate::connection::ConnectionSettings;

/// Length of a generated session secret, in bytes.
const GENERATED_SECRET_LEN: usize = 32;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Server network settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Database settings.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Session token settings.
    #[serde(default)]
    pub session: SessionConfig,

    /// Dispatch loop and connection tunables.
    #[serde(default)]
    pub hub: HubConfig,
}

/// Network configuration for the HTTP server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Host address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    /// SQLite busy timeout in milliseconds.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,

    /// Maximum pooled connections.
    #[serde(default = "default_pool_max_size")]
    pub pool_max_size: u32,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g., "info", "debug", "parley_server=debug,info").
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Whether to output logs in JSON format.
    #[serde(default)]
    pub json: bool,
}

/// Session token configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Hex-encoded HMAC key. Generated at startup when absent.
    #[serde(default)]
    pub secret: Option<String>,

    /// Name of the cookie carrying the session token.
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
}

/// Hub and per-connection tunables.
#[derive(Debug, Clone, Deserialize)]
pub struct HubConfig {
    #[serde(default = "default_command_queue_capacity")]
    pub command_queue_capacity: usize,

    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,

    /// Largest accepted chat message, in bytes.
    #[serde(default = "default_max_message_len")]
    pub max_message_len: usize,

    /// Seconds between keepalive pings. `0` disables them.
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))
}

fn default_port() -> u16 {
    8080
}

fn default_db_path() -> String {
    "parley.db".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

fn default_pool_max_size() -> u32 {
    8
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_cookie_name() -> String {
    "session".to_string()
}

fn default_command_queue_capacity() -> usize {
    crate::hub::DEFAULT_COMMAND_QUEUE_CAPACITY
}

fn default_outbound_queue_capacity() -> usize {
    256
}

fn default_max_message_len() -> usize {
    65_536
}

fn default_ping_interval_secs() -> u64 {
    30
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
            pool_max_size: default_pool_max_size(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            secret: None,
            cookie_name: default_cookie_name(),
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            command_queue_capacity: default_command_queue_capacity(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
            max_message_len: default_max_message_len(),
            ping_interval_secs: default_ping_interval_secs(),
        }
    }
}

impl HubConfig {
    /// Per-connection settings derived from this section.
    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            outbound_queue_capacity: self.outbound_queue_capacity,
            max_message_len: self.max_message_len,
            ping_interval: (self.ping_interval_secs > 0)
                .then(|| Duration::from_secs(self.ping_interval_secs)),
        }
    }
}

impl SessionConfig {
    /// Decodes the configured secret, or generates a random one if none is
    /// configured.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidSecret`] if the secret is empty or not hex.
    pub fn secret_bytes(&self) -> Result<Vec<u8>, ConfigError> {
        match self.secret.as_deref() {
            Some(hex_secret) => {
                let bytes = hex::decode(hex_secret.trim())
                    .map_err(|e| ConfigError::InvalidSecret(e.to_string()))?;
                if bytes.is_empty() {
                    return Err(ConfigError::InvalidSecret("secret is empty".to_string()));
                }
                Ok(bytes)
            }
            None => {
                tracing::warn!(
                    "no session secret configured; generated a random one, \
                     issued sessions will not survive a restart"
                );
                let mut bytes = vec![0u8; GENERATED_SECRET_LEN];
                rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut bytes);
                Ok(bytes)
            }
        }
    }
}

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file.
    #[error("failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),

    /// Failed to parse the configuration file.
    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    /// The session secret is not usable as an HMAC key.
    #[error("invalid session secret: {0}")]
    InvalidSecret(String),
}

/// Loads configuration from a TOML file, falling back to defaults.
///
/// Environment variable overrides:
/// - `PARLEY_HOST` overrides `server.host`
/// - `PARLEY_PORT` overrides `server.port`
/// - `PARLEY_DB_PATH` overrides `database.path`
/// - `PARLEY_LOG_LEVEL` overrides `logging.level`
/// - `PARLEY_LOG_JSON` overrides `logging.json` (set to "true" to enable)
/// - `PARLEY_SESSION_SECRET` overrides `session.secret`
///
/// # Errors
///
/// Returns `ConfigError` if the file exists but cannot be read or parsed.
pub fn load_config(path: Option<&str>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(p) => match std::fs::read_to_string(p) {
            Ok(contents) => parse_config(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = p, "config file not found, using defaults");
                Config::default()
            }
            Err(e) => return Err(ConfigError::FileRead(e)),
        },
        None => Config::default(),
    };

    // Environment variable overrides
    if let Ok(host) = std::env::var("PARLEY_HOST") {
        if let Ok(parsed) = host.parse() {
            config.server.host = parsed;
        }
    }
    if let Ok(port) = std::env::var("PARLEY_PORT") {
        if let Ok(parsed) = port.parse() {
            config.server.port = parsed;
        }
    }
    if let Ok(db_path) = std::env::var("PARLEY_DB_PATH") {
        config.database.path = db_path;
    }
    if let Ok(level) = std::env::var("PARLEY_LOG_LEVEL") {
        config.logging.level = level;
    }
    if let Ok(json) = std::env::var("PARLEY_LOG_JSON") {
        config.logging.json = json == "true" || json == "1";
    }
    if let Ok(secret) = std::env::var("PARLEY_SESSION_SECRET") {
        config.session.secret = Some(secret);
    }

    Ok(config)
}

/// Parses configuration from TOML text without applying overrides.
pub fn parse_config(contents: &str) -> Result<Config, ConfigError> {
    Ok(toml::from_str(contents)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.database.path, "parley.db");
        assert_eq!(config.database.pool_max_size, 8);
        assert_eq!(config.session.cookie_name, "session");
        assert!(config.session.secret.is_none());
        assert_eq!(config.hub.command_queue_capacity, 1024);
        assert_eq!(config.hub.outbound_queue_capacity, 256);
    }

    #[test]
    fn sections_override_defaults() {
        let config = parse_config(
            r#"
            [server]
            host = "0.0.0.0"
            port = 9000

            [session]
            secret = "00ff10"
            cookie_name = "sid"

            [hub]
            ping_interval_secs = 0
            max_message_len = 100
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 9000);
        assert_eq!(config.session.cookie_name, "sid");
        assert_eq!(config.session.secret_bytes().unwrap(), vec![0x00, 0xff, 0x10]);

        let settings = config.hub.connection_settings();
        assert_eq!(settings.ping_interval, None);
        assert_eq!(settings.max_message_len, 100);
        assert_eq!(settings.outbound_queue_capacity, 256);
    }

    #[test]
    fn invalid_or_empty_secret_is_rejected() {
        let mut session = SessionConfig {
            secret: Some("not hex".to_string()),
            ..Default::default()
        };
        assert!(matches!(session.secret_bytes(), Err(ConfigError::InvalidSecret(_))));

        session.secret = Some(String::new());
        assert!(matches!(session.secret_bytes(), Err(ConfigError::InvalidSecret(_))));
    }

    #[test]
    fn missing_secret_is_generated() {
        let session = SessionConfig::default();
        let a = session.secret_bytes().unwrap();
        let b = session.secret_bytes().unwrap();
        assert_eq!(a.len(), GENERATED_SECRET_LEN);
        assert_ne!(a, b);
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        assert!(matches!(parse_config("[server"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let config = load_config(path.to_str()).unwrap();
        assert_eq!(config.database.busy_timeout_ms, 5000);
    }
}
