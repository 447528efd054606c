//! Configuration management

use crate::protocol::{
    Secret, CONNECT_TIMEOUT, HANDSHAKE_TIMEOUT, PEER_JOIN_TIMEOUT, RELAY_BUFFER_SIZE,
    TRANSFER_TIMEOUT,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, crate::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| crate::Error::Config(format!("Failed to read config: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Shared secret, at most 64 UTF-8 bytes
    pub password: String,
    /// Listening port
    pub port: u16,
    /// Listening address
    pub bind: String,
    /// TLS certificate chain (PEM)
    pub cert: PathBuf,
    /// TLS private key (PEM)
    pub private_key: PathBuf,
    /// Log socket buffer sizes while relaying
    pub debug: bool,
    /// SO_SNDBUF for accepted sockets (0 = system default)
    pub send_buffer_size: u32,
    /// SO_RCVBUF for the listening socket (0 = system default)
    pub recv_buffer_size: u32,
    /// Copy buffer size per relay direction
    pub relay_buffer_size: usize,
    /// Refuse destinations that resolve to a loopback address
    pub reject_loopback: bool,
    /// Per-phase timeouts
    pub timeouts: TimeoutConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            password: String::new(),
            port: 0,
            bind: "0.0.0.0".to_string(),
            cert: PathBuf::from("fullchain.pem"),
            private_key: PathBuf::from("privkey.pem"),
            debug: false,
            send_buffer_size: 0,
            recv_buffer_size: 0,
            relay_buffer_size: RELAY_BUFFER_SIZE,
            reject_loopback: true,
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Check the values a server cannot run without
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.password.is_empty() {
            return Err(crate::Error::Config("password is required".to_string()));
        }
        if self.port == 0 {
            return Err(crate::Error::Config("server port is required".to_string()));
        }
        if self.relay_buffer_size == 0 {
            return Err(crate::Error::Config(
                "relay_buffer_size must be positive".to_string(),
            ));
        }
        self.timeouts.validate()?;
        self.secret()?;
        Ok(())
    }

    /// Wire form of the password
    pub fn secret(&self) -> Result<Secret, crate::Error> {
        Ok(Secret::from_password(&self.password)?)
    }

    /// `host:port` to bind
    pub fn listen_addr(&self) -> String {
        if self.bind.contains(':') {
            format!("[{}]:{}", self.bind, self.port)
        } else {
            format!("{}:{}", self.bind, self.port)
        }
    }

    pub fn send_buffer_size(&self) -> Option<u32> {
        (self.send_buffer_size > 0).then_some(self.send_buffer_size)
    }

    pub fn recv_buffer_size(&self) -> Option<u32> {
        (self.recv_buffer_size > 0).then_some(self.recv_buffer_size)
    }
}

/// Timeouts in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Every read before the status byte
    pub handshake: u64,
    /// Reads on both sides while relaying
    pub transfer: u64,
    /// Connecting to the destination
    pub connect: u64,
    /// Waiting for the peer relay task after shutdown
    pub peer_join: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            handshake: HANDSHAKE_TIMEOUT.as_millis() as u64,
            transfer: TRANSFER_TIMEOUT.as_millis() as u64,
            connect: CONNECT_TIMEOUT.as_millis() as u64,
            peer_join: PEER_JOIN_TIMEOUT.as_millis() as u64,
        }
    }
}

impl TimeoutConfig {
    /// A zero timeout would expire every wait at once; `peer_join` may be 0
    pub fn validate(&self) -> Result<(), crate::Error> {
        for (name, value) in [
            ("handshake", self.handshake),
            ("transfer", self.transfer),
            ("connect", self.connect),
        ] {
            if value == 0 {
                return Err(crate::Error::Config(format!(
                    "timeouts.{} must be positive",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// Resolved timeouts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub handshake: Duration,
    pub transfer: Duration,
    pub connect: Duration,
    pub peer_join: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            handshake: HANDSHAKE_TIMEOUT,
            transfer: TRANSFER_TIMEOUT,
            connect: CONNECT_TIMEOUT,
            peer_join: PEER_JOIN_TIMEOUT,
        }
    }
}

impl From<&TimeoutConfig> for Timeouts {
    fn from(config: &TimeoutConfig) -> Self {
        Self {
            handshake: Duration::from_millis(config.handshake),
            transfer: Duration::from_millis(config.transfer),
            connect: Duration::from_millis(config.connect),
            peer_join: Duration::from_millis(config.peer_join),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or filter directive (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (pretty, compact, full)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "full".to_string(),
        }
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    Config {
        server: ServerConfig {
            password: "change-me".to_string(),
            port: 443,
            ..ServerConfig::default()
        },
        logging: LoggingConfig::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.relay_buffer_size, 512 * 1024);
        assert!(config.reject_loopback);
        assert_eq!(config.send_buffer_size(), None);
        assert_eq!(config.recv_buffer_size(), None);

        let timeouts = Timeouts::from(&config.timeouts);
        assert_eq!(timeouts, Timeouts::default());
        assert_eq!(timeouts.transfer, Duration::from_secs(300));
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: Config = toml::from_str(
            r#"
            [server]
            password = "secret"
            port = 8443
            send_buffer_size = 65536

            [server.timeouts]
            transfer = 60000

            [logging]
            level = "debug"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 8443);
        assert_eq!(config.server.send_buffer_size(), Some(65536));
        assert_eq!(config.server.timeouts.transfer, 60000);
        assert_eq!(config.server.timeouts.handshake, 10000);
        assert_eq!(config.server.cert, PathBuf::from("fullchain.pem"));
        assert_eq!(config.logging.level, "debug");
        assert!(config.server.validate().is_ok());
    }

    #[test]
    fn test_validate() {
        let mut config = ServerConfig::default();
        assert!(config.validate().is_err());

        config.password = "pw".to_string();
        assert!(config.validate().is_err());

        config.port = 443;
        assert!(config.validate().is_ok());

        config.password = "x".repeat(65);
        assert!(matches!(config.validate(), Err(crate::Error::Protocol(_))));
    }

    #[test]
    fn test_validate_rejects_zero_timeouts() {
        let valid = ServerConfig {
            password: "pw".to_string(),
            port: 443,
            ..ServerConfig::default()
        };

        let mut config = valid.clone();
        config.timeouts.handshake = 0;
        assert!(matches!(config.validate(), Err(crate::Error::Config(ref m)) if m.contains("handshake")));

        let mut config = valid.clone();
        config.timeouts.transfer = 0;
        assert!(matches!(config.validate(), Err(crate::Error::Config(ref m)) if m.contains("transfer")));

        let mut config = valid.clone();
        config.timeouts.connect = 0;
        assert!(matches!(config.validate(), Err(crate::Error::Config(ref m)) if m.contains("connect")));

        let mut config = valid;
        config.timeouts.peer_join = 0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_listen_addr() {
        let mut config = ServerConfig {
            port: 443,
            ..ServerConfig::default()
        };
        assert_eq!(config.listen_addr(), "0.0.0.0:443");

        config.bind = "::".to_string();
        assert_eq!(config.listen_addr(), "[::]:443");
    }

    #[test]
    fn test_example_roundtrip() {
        let example = generate_example_config();
        let text = toml::to_string_pretty(&example).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.server.port, 443);
        assert_eq!(parsed.server.password, "change-me");
    }
}
