//! Engine configuration
//!
//! Stored as `config.json` in the data directory. Missing file means defaults.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::crypto::CipherKind;
use crate::error::{SyncError, SyncResult};

/// File name inside the data directory
pub const CONFIG_FILE: &str = "config.json";

/// Who can read the published identity blob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum IdentityVisibility {
    /// Stored unencrypted; also published to non-members
    #[default]
    Public,
    /// Encrypted under the "everyone" circle key
    Circle,
}

/// Tunables for the publish and sync pipelines
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Manifest entries older than this are left out of rebuilt manifests
    pub retention_days: u32,
    /// Deadline for root resolution (the optimistic up-to-date check)
    pub resolve_timeout_ms: u64,
    /// Deadline for fetching one blob
    pub fetch_timeout_ms: u64,
    /// Deadline for storing a blob or publishing the root
    pub publish_timeout_ms: u64,
    /// Attempts for publishing the root
    pub publish_retries: u32,
    /// Attempts for fetching a blob that must eventually succeed
    pub fetch_retries: u32,
    /// First backoff delay, doubled per attempt
    pub retry_base_delay_ms: u64,
    /// Period of the background publish+sync loop
    pub sync_interval_secs: u64,
    /// Peers synced concurrently
    pub max_parallel_peers: usize,
    /// Identity blob visibility
    pub identity_visibility: IdentityVisibility,
    /// Cipher for newly generated keys
    pub cipher: CipherKind,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retention_days: crate::manifest::DEFAULT_RETENTION_DAYS,
            resolve_timeout_ms: 3_000,
            fetch_timeout_ms: 10_000,
            publish_timeout_ms: 15_000,
            publish_retries: 3,
            fetch_retries: 3,
            retry_base_delay_ms: 100,
            sync_interval_secs: 60,
            max_parallel_peers: 4,
            identity_visibility: IdentityVisibility::Public,
            cipher: CipherKind::ChaCha20Poly1305,
        }
    }
}

impl EngineConfig {
    /// Load from `<data_dir>/config.json`, falling back to defaults
    pub fn load(data_dir: &Path) -> SyncResult<Self> {
        let path = data_dir.join(CONFIG_FILE);
        if !path.exists() {
            debug!(?path, "No config file, using defaults");
            return Ok(Self::default());
        }
        let bytes = std::fs::read(&path)?;
        let config: Self = serde_json::from_slice(&bytes)
            .map_err(|e| SyncError::Config(format!("Invalid {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Write to `<data_dir>/config.json`
    pub fn save(&self, data_dir: &Path) -> SyncResult<()> {
        self.validate()?;
        std::fs::create_dir_all(data_dir)?;
        let json = serde_json::to_vec_pretty(self).map_err(SyncError::serialization)?;
        std::fs::write(data_dir.join(CONFIG_FILE), json)?;
        Ok(())
    }

    /// Reject values that would stall or disable a pipeline
    pub fn validate(&self) -> SyncResult<()> {
        let zero = [
            ("resolve_timeout_ms", self.resolve_timeout_ms),
            ("fetch_timeout_ms", self.fetch_timeout_ms),
            ("publish_timeout_ms", self.publish_timeout_ms),
            ("publish_retries", u64::from(self.publish_retries)),
            ("fetch_retries", u64::from(self.fetch_retries)),
            ("sync_interval_secs", self.sync_interval_secs),
            ("max_parallel_peers", self.max_parallel_peers as u64),
        ]
        .into_iter()
        .find(|(_, v)| *v == 0);

        if let Some((name, _)) = zero {
            return Err(SyncError::Config(format!("{} must be greater than zero", name)));
        }
        Ok(())
    }

    /// Retention window in milliseconds
    pub fn retention_window_ms(&self) -> i64 {
        i64::from(self.retention_days) * 24 * 60 * 60 * 1000
    }

    /// Root resolution deadline
    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_millis(self.resolve_timeout_ms)
    }

    /// Blob fetch deadline
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    /// Store/publish deadline
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    /// Background loop period
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.retention_days, 30);
        assert_eq!(config.retention_window_ms(), 30 * 86_400_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let config = EngineConfig::load(dir.path()).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let config = EngineConfig {
            retention_days: 7,
            identity_visibility: IdentityVisibility::Circle,
            cipher: CipherKind::LegacyAesCbc,
            ..EngineConfig::default()
        };
        config.save(dir.path()).unwrap();
        assert_eq!(EngineConfig::load(dir.path()).unwrap(), config);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), br#"{"retention_days": 3}"#).unwrap();
        let config = EngineConfig::load(dir.path()).unwrap();
        assert_eq!(config.retention_days, 3);
        assert_eq!(config.fetch_retries, 3);
    }

    #[test]
    fn test_zero_values_rejected() {
        let config = EngineConfig {
            max_parallel_peers: 0,
            ..EngineConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max_parallel_peers"));
    }
}
