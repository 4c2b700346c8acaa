//! Configuration management

use crate::transport::TransportError;
use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

/// Per-connection ring buffer size (bytes)
pub const DEFAULT_BUFFER_SIZE: usize = 10240;

/// Largest accepted per-connection buffer size; the tunnel buffer is a
/// multiple of it
pub const MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Listen backlog for application clients
pub const DEFAULT_BACKLOG: u32 = 10;

/// Connect timeout (seconds)
pub const DEFAULT_CONNECT_TIMEOUT: u64 = 10;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Tunnel endpoint configuration
    pub tunnel: TunnelConfig,
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

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), crate::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| crate::Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| crate::Error::Config(format!("Failed to write config: {}", e)))
    }
}

/// Which end of the tunnel this process is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Accepts application clients and opens the tunnel
    Originator,
    /// Accepts the tunnel and opens connections to the target
    Terminator,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Originator => write!(f, "originator"),
            Mode::Terminator => write!(f, "terminator"),
        }
    }
}

/// Tunnel endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub mode: Mode,
    /// Originator: address for application clients. Terminator: tunnel address.
    pub listen: String,
    /// Originator: terminator's tunnel address. Terminator: forwarded service.
    pub target: String,
    /// Per-connection ring buffer size; the tunnel uses ten times this
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_backlog")]
    pub backlog: u32,
    /// Seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_backlog() -> u32 {
    DEFAULT_BACKLOG
}

fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT
}

impl TunnelConfig {
    pub fn new(mode: Mode, listen: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            mode,
            listen: listen.into(),
            target: target.into(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            backlog: DEFAULT_BACKLOG,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, crate::Error> {
        resolve(&self.listen)
    }

    pub fn target_addr(&self) -> Result<SocketAddr, crate::Error> {
        resolve(&self.target)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    /// Check values before any socket is opened
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.buffer_size == 0 {
            return Err(crate::Error::Config("buffer_size must be non-zero".into()));
        }
        if self.buffer_size > MAX_BUFFER_SIZE {
            return Err(crate::Error::Config(format!(
                "buffer_size must be at most {}",
                MAX_BUFFER_SIZE
            )));
        }
        if self.connect_timeout == 0 {
            return Err(crate::Error::Config("connect_timeout must be non-zero".into()));
        }
        self.listen_addr()?;
        self.target_addr()?;
        Ok(())
    }
}

/// First address `addr` resolves to
fn resolve(addr: &str) -> Result<SocketAddr, crate::Error> {
    let mut addrs = addr
        .to_socket_addrs()
        .map_err(|e| TransportError::Resolve(format!("{}: {}", addr, e)))?;
    addrs
        .next()
        .ok_or_else(|| TransportError::Resolve(format!("{}: no addresses", addr)).into())
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or a full filter directive
    pub level: String,
    /// Log format (pretty, json, compact)
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
        }
    }
}

/// Generate example configuration for one end of the tunnel
pub fn generate_example_config(mode: Mode) -> Config {
    let tunnel = match mode {
        Mode::Originator => TunnelConfig::new(mode, "127.0.0.1:8000", "203.0.113.10:7000"),
        Mode::Terminator => TunnelConfig::new(mode, "0.0.0.0:7000", "127.0.0.1:22"),
    };
    Config {
        tunnel,
        logging: LoggingConfig::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config: Config = toml::from_str(
            r#"
            [tunnel]
            mode = "terminator"
            listen = "127.0.0.1:7000"
            target = "127.0.0.1:22"
            "#,
        )
        .unwrap();

        assert_eq!(config.tunnel.mode, Mode::Terminator);
        assert_eq!(config.tunnel.buffer_size, DEFAULT_BUFFER_SIZE);
        assert_eq!(config.tunnel.backlog, DEFAULT_BACKLOG);
        assert_eq!(config.tunnel.connect_timeout(), Duration::from_secs(10));
        assert_eq!(config.logging.level, "info");
        config.tunnel.validate().unwrap();
    }

    #[test]
    fn test_example_config_round_trip() {
        let example = generate_example_config(Mode::Originator);
        let text = toml::to_string_pretty(&example).unwrap();
        assert!(text.contains("mode = \"originator\""));

        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.tunnel.listen, example.tunnel.listen);
        assert_eq!(parsed.tunnel.target, example.tunnel.target);
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("portmux-config-{}.toml", std::process::id()));
        let config = generate_example_config(Mode::Terminator);
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded.tunnel.mode, Mode::Terminator);
        assert_eq!(loaded.tunnel.listen, "0.0.0.0:7000");
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = TunnelConfig::new(Mode::Originator, "127.0.0.1:0", "127.0.0.1:1");
        config.buffer_size = 0;
        assert!(matches!(config.validate(), Err(crate::Error::Config(_))));

        config.buffer_size = usize::MAX;
        assert!(matches!(config.validate(), Err(crate::Error::Config(_))));
        config.buffer_size = MAX_BUFFER_SIZE;
        assert!(config.validate().is_ok());

        let config = TunnelConfig::new(Mode::Originator, "not an address", "127.0.0.1:1");
        assert!(matches!(config.validate(), Err(crate::Error::Transport(_))));
    }

    #[test]
    fn test_unknown_mode_is_rejected() {
        let result: Result<Config, _> = toml::from_str(
            r#"
            [tunnel]
            mode = "relay"
            listen = "127.0.0.1:1"
            target = "127.0.0.1:2"
            "#,
        );
        assert!(result.is_err());
    }
}
