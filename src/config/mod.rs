//! Configuration management.
//!
//! Supports configuration from:
//! - TOML config files
//! - Environment variables (`PLEXUS_*`)
//! - CLI arguments (for the demo binary)

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PlexusError, Result};

/// Main configuration struct
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Multiplexer configuration
    #[serde(default)]
    pub multiplexer: MultiplexerConfig,

    /// Negotiation configuration
    #[serde(default)]
    pub negotiation: NegotiationConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let content = std::fs::read_to_string(&path)
            .map_err(|e| PlexusError::Config(format!("Failed to read config file: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| PlexusError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(val) = env_parse("PLEXUS_MUX_WINDOW_SIZE") {
            config.multiplexer.window_size = val;
        }
        if let Some(val) = env_parse("PLEXUS_MUX_MAX_FRAME_PAYLOAD") {
            config.multiplexer.max_frame_payload = val;
        }
        if let Some(val) = env_parse("PLEXUS_MUX_MAX_PACKET_LENGTH") {
            config.multiplexer.max_packet_length = val;
        }
        if let Some(val) = env_parse("PLEXUS_MUX_OPEN_TIMEOUT_SECS") {
            config.multiplexer.open_timeout_secs = val;
        }
        if let Some(val) = env_parse("PLEXUS_HANDSHAKE_TIMEOUT_SECS") {
            config.negotiation.handshake_timeout_secs = val;
        }
        if let Some(val) = env_parse("PLEXUS_MAX_CONCURRENT_ACCEPTS") {
            config.negotiation.max_concurrent_accepts = val;
        }

        config
    }

    /// Default config file location (`<config dir>/plexus/config.toml`)
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("plexus").join("config.toml"))
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        self.multiplexer.validate()?;
        if self.negotiation.handshake_timeout_secs == 0 {
            return Err(PlexusError::Config(
                "negotiation.handshake_timeout_secs must be at least 1".to_string(),
            ));
        }
        if self.negotiation.max_concurrent_accepts == 0 {
            return Err(PlexusError::Config(
                "negotiation.max_concurrent_accepts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.parse().ok()
}

/// Multiplexer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiplexerConfig {
    /// Receive window per stream channel, in bytes
    pub window_size: u32,

    /// Largest data frame payload, in bytes
    pub max_frame_payload: u32,

    /// Largest datagram payload, in bytes
    pub max_packet_length: u32,

    /// Seconds to wait for an open acknowledgement (0 = wait until close)
    pub open_timeout_secs: u64,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            window_size: 64 * 1024,
            max_frame_payload: 16 * 1024,
            max_packet_length: 1024,
            open_timeout_secs: 30,
        }
    }
}

impl MultiplexerConfig {
    /// Open timeout, if bounded
    pub fn open_timeout(&self) -> Option<Duration> {
        (self.open_timeout_secs > 0).then(|| Duration::from_secs(self.open_timeout_secs))
    }

    /// Largest payload the frame reader accepts
    pub fn max_payload(&self) -> usize {
        self.max_frame_payload.max(self.max_packet_length) as usize
    }

    /// Check frame and window sizes
    pub fn validate(&self) -> Result<()> {
        if self.max_frame_payload == 0 {
            return Err(PlexusError::Config(
                "multiplexer.max_frame_payload must be non-zero".to_string(),
            ));
        }
        if self.max_frame_payload > self.window_size {
            return Err(PlexusError::Config(format!(
                "multiplexer.max_frame_payload ({}) exceeds window_size ({})",
                self.max_frame_payload, self.window_size
            )));
        }
        Ok(())
    }
}

/// Negotiation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NegotiationConfig {
    /// Seconds to wait for an incoming session descriptor
    pub handshake_timeout_secs: u64,

    /// Largest accepted session descriptor, in bytes
    pub max_descriptor_len: usize,

    /// Incoming sessions negotiated concurrently
    pub max_concurrent_accepts: usize,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: 10,
            max_descriptor_len: 64 * 1024,
            max_concurrent_accepts: 64,
        }
    }
}

impl NegotiationConfig {
    /// Handshake timeout
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.multiplexer.window_size, 65536);
        assert_eq!(config.multiplexer.open_timeout(), Some(Duration::from_secs(30)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_timeout_is_unbounded() {
        let config = MultiplexerConfig {
            open_timeout_secs: 0,
            ..Default::default()
        };
        assert_eq!(config.open_timeout(), None);
    }

    #[test]
    fn test_frame_larger_than_window_rejected() {
        let config = MultiplexerConfig {
            window_size: 1024,
            max_frame_payload: 4096,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(PlexusError::Config(_))));
    }

    #[test]
    fn test_zero_handshake_timeout_rejected() {
        let mut config = Config::default();
        config.negotiation.handshake_timeout_secs = 0;
        assert!(matches!(config.validate(), Err(PlexusError::Config(_))));
    }

    #[test]
    fn test_config_from_toml() {
        let toml = r#"
            [multiplexer]
            window_size = 8192
            max_frame_payload = 2048

            [negotiation]
            handshake_timeout_secs = 3
        "#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.multiplexer.window_size, 8192);
        assert_eq!(config.multiplexer.max_frame_payload, 2048);
        assert_eq!(config.multiplexer.max_packet_length, 1024);
        assert_eq!(config.negotiation.handshake_timeout_secs, 3);
        assert_eq!(config.negotiation.max_concurrent_accepts, 64);
    }

    #[test]
    fn test_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plexus.toml");
        std::fs::write(&path, "[multiplexer]\nmax_packet_length = 512\n").unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.multiplexer.max_packet_length, 512);

        std::fs::write(&path, "[multiplexer]\nmax_frame_payload = 0\n").unwrap();
        assert!(Config::from_file(&path).is_err());
    }
}
