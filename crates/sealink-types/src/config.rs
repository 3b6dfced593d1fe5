//! Engine configuration.
//!
//! Every field has a default, so a partial TOML file (or none at all) is a
//! valid configuration:
//!
//! ```toml
//! listen_addr = "0.0.0.0:7420"
//! security = "encrypted"
//! key_bits = 2048
//! connection_timeout_ms = 10000
//! ```

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Smallest accepted asymmetric key size in bits.
pub const MIN_KEY_BITS: usize = 512;
/// Largest accepted asymmetric key size in bits.
pub const MAX_KEY_BITS: usize = 8192;
/// Default asymmetric key size in bits.
pub const DEFAULT_KEY_BITS: usize = 2048;
/// Default maximum frame size (10 MB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 10 * 1024 * 1024;
/// Default size of the event loop's read buffer (64 KB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 64 * 1024;

/// Whether application messages travel inside hybrid-encrypted envelopes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityMode {
    /// Key handshake first, then hybrid envelopes.
    #[default]
    Encrypted,
    /// No handshake; messages are framed but not encrypted.
    Plaintext,
}

impl std::fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Encrypted => write!(f, "encrypted"),
            Self::Plaintext => write!(f, "plaintext"),
        }
    }
}

/// Configuration shared by initiators, listeners and their event loops.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WireConfig {
    /// Address a listener binds to. Default: 127.0.0.1:7420.
    pub listen_addr: SocketAddr,
    /// Envelope mode. Default: encrypted.
    pub security: SecurityMode,
    /// Asymmetric key size in bits. Default: 2048.
    pub key_bits: usize,
    /// Largest frame accepted from a peer, in bytes. Default: 10 MB.
    pub max_frame_size: usize,
    /// Bytes read per readiness event. Default: 64 KB.
    pub read_buffer_size: usize,
    /// Liveness timeout tracked per connection. Default: 10s.
    pub connection_timeout_ms: u64,
    /// How long a blocked socket write may stall `send`. Default: 5s.
    pub write_timeout_ms: u64,
    /// How long a listener waits for an initiator's handshake frame. Default: 10s.
    pub handshake_timeout_ms: u64,
}

impl Default for WireConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 7420)),
            security: SecurityMode::Encrypted,
            key_bits: DEFAULT_KEY_BITS,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            connection_timeout_ms: 10_000,
            write_timeout_ms: 5_000,
            handshake_timeout_ms: 10_000,
        }
    }
}

impl WireConfig {
    /// Parse a configuration from TOML text and validate it.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: WireConfig = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML configuration file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_KEY_BITS..=MAX_KEY_BITS).contains(&self.key_bits) {
            return Err(ConfigError::Invalid {
                field: "key_bits",
                reason: format!(
                    "{} is outside {MIN_KEY_BITS}..={MAX_KEY_BITS}",
                    self.key_bits
                ),
            });
        }
        if self.max_frame_size == 0 || self.max_frame_size > u32::MAX as usize {
            return Err(ConfigError::Invalid {
                field: "max_frame_size",
                reason: format!("{} does not fit a u32 length prefix", self.max_frame_size),
            });
        }
        if self.read_buffer_size == 0 {
            return Err(ConfigError::Invalid {
                field: "read_buffer_size",
                reason: "must be non-zero".to_string(),
            });
        }
        if self.write_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "write_timeout_ms",
                reason: "must be non-zero".to_string(),
            });
        }
        if self.handshake_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "handshake_timeout_ms",
                reason: "must be non-zero".to_string(),
            });
        }
        Ok(())
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = WireConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.security, SecurityMode::Encrypted);
        assert_eq!(config.key_bits, 2048);
        assert_eq!(config.connection_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = WireConfig::from_toml_str(
            r#"
            security = "plaintext"
            key_bits = 512
            "#,
        )
        .unwrap();
        assert_eq!(config.security, SecurityMode::Plaintext);
        assert_eq!(config.key_bits, 512);
        assert_eq!(config.max_frame_size, DEFAULT_MAX_FRAME_SIZE);
        assert_eq!(config.listen_addr.port(), 7420);
    }

    #[test]
    fn test_rejects_tiny_keys() {
        let err = WireConfig::from_toml_str("key_bits = 256").unwrap_err();
        match err {
            ConfigError::Invalid { field, .. } => assert_eq!(field, "key_bits"),
            other => panic!("Expected Invalid, got {other:?}"),
        }
    }

    #[test]
    fn test_rejects_unknown_security_mode() {
        let err = WireConfig::from_toml_str(r#"security = "rot13""#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_rejects_zero_read_buffer() {
        let config = WireConfig {
            read_buffer_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
