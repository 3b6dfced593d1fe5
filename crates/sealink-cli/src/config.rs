//! Configuration loading with fallback to defaults.

use sealink_types::{ConfigError, WireConfig};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Load configuration from `path`, or `~/.sealink/config.toml` when `None`.
///
/// A missing file is normal and yields defaults quietly. An unreadable or
/// invalid file is logged and also yields defaults.
pub fn load_config(path: Option<&Path>) -> WireConfig {
    let config_path = path
        .map(|p| p.to_path_buf())
        .unwrap_or_else(default_config_path);

    match WireConfig::from_file(&config_path) {
        Ok(config) => {
            info!(path = %config_path.display(), "Loaded configuration");
            config
        }
        Err(ConfigError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
            info!(path = %config_path.display(), "Config file not found, using defaults");
            WireConfig::default()
        }
        Err(e) => {
            warn!(
                error = %e,
                path = %config_path.display(),
                "Failed to load config, using defaults"
            );
            WireConfig::default()
        }
    }
}

/// `~/.sealink/config.toml`, or `./config.toml` without a home directory.
pub fn default_config_path() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".sealink"))
        .unwrap_or_else(|| PathBuf::from("."))
        .join("config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;
    use sealink_types::SecurityMode;
    use std::io::Write;

    #[test]
    fn test_load_partial_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "security = \"plaintext\"\nkey_bits = 1024").unwrap();

        let config = load_config(Some(file.path()));
        assert_eq!(config.security, SecurityMode::Plaintext);
        assert_eq!(config.key_bits, 1024);
        assert_eq!(config.max_frame_size, WireConfig::default().max_frame_size);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config(Some(&dir.path().join("nope.toml")));
        assert_eq!(config, WireConfig::default());
    }

    #[test]
    fn test_invalid_file_uses_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "key_bits = 12").unwrap();
        assert_eq!(load_config(Some(file.path())), WireConfig::default());

        let mut garbage = tempfile::NamedTempFile::new().unwrap();
        writeln!(garbage, "this is [not toml").unwrap();
        assert_eq!(load_config(Some(garbage.path())), WireConfig::default());
    }

    #[test]
    fn test_unreadable_path_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(load_config(Some(dir.path())), WireConfig::default());
    }

    #[test]
    fn test_default_path_shape() {
        let path = default_config_path();
        assert!(path.ends_with("config.toml"));
    }
}
