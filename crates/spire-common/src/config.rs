//! Configuration structures for Spire storage.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration for the durable write-ahead log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalConfig {
    /// Directory holding the numbered log files and the control file.
    pub log_dir: PathBuf,
    /// Enable fsync for durability. Disabling is only safe for tests.
    pub fsync_enabled: bool,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("./data/wal"),
            fsync_enabled: true,
        }
    }
}

impl WalConfig {
    /// Creates a configuration rooted at the given directory.
    pub fn with_dir(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wal_config_defaults() {
        let config = WalConfig::default();
        assert_eq!(config.log_dir, PathBuf::from("./data/wal"));
        assert!(config.fsync_enabled);
    }

    #[test]
    fn test_wal_config_with_dir() {
        let config = WalConfig::with_dir("/var/lib/spire/wal");
        assert_eq!(config.log_dir, PathBuf::from("/var/lib/spire/wal"));
        assert!(config.fsync_enabled);
    }

    #[test]
    fn test_wal_config_clone() {
        let config1 = WalConfig::default();
        let config2 = config1.clone();
        assert_eq!(config1.log_dir, config2.log_dir);
        assert_eq!(config1.fsync_enabled, config2.fsync_enabled);
    }

    #[test]
    fn test_wal_config_serde_roundtrip() {
        let original = WalConfig {
            log_dir: PathBuf::from("/data/wal"),
            fsync_enabled: false,
        };
        let serialized = serde_json::to_string(&original).unwrap();
        let deserialized: WalConfig = serde_json::from_str(&serialized).unwrap();

        assert_eq!(original.log_dir, deserialized.log_dir);
        assert_eq!(original.fsync_enabled, deserialized.fsync_enabled);
    }
}
