//! Drive configuration
//!
//! Every section has serde defaults so a partial JSON file is enough to
//! start a drive.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::Result;

/// Core configuration for a FileDrive instance
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriveConfig {
    /// Root directory holding every user's namespace
    pub root: PathBuf,

    /// Metadata store directory (None = temporary in-memory store)
    pub metadata_path: Option<PathBuf>,

    /// Default log level used by `logging::init`
    pub log_level: String,

    pub handles: HandleCacheConfig,
    pub limiter: LimiterConfig,
    pub uploads: UploadConfig,
    pub sharing: SharingConfig,

    /// Limits applied to users provisioned without explicit limits
    pub default_quota: QuotaLimits,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./filedrive_data/files"),
            metadata_path: Some(PathBuf::from("./filedrive_data/meta")),
            log_level: "info".to_string(),
            handles: HandleCacheConfig::default(),
            limiter: LimiterConfig::default(),
            uploads: UploadConfig::default(),
            sharing: SharingConfig::default(),
            default_quota: QuotaLimits::default(),
        }
    }
}

impl DriveConfig {
    /// Config rooted at `root` with a temporary metadata store.
    pub fn ephemeral(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            metadata_path: None,
            ..Self::default()
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_json_str(&data)
    }
}

/// Bounds for the local file handle cache
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandleCacheConfig {
    /// Maximum simultaneously cached handles
    pub max_open: usize,
    /// Idle time after which a handle may be evicted
    pub idle_ttl_secs: u64,
    /// Handles closed per opportunistic sweep
    pub sweep_batch: usize,
}

impl HandleCacheConfig {
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }
}

impl Default for HandleCacheConfig {
    fn default() -> Self {
        Self {
            max_open: 128,
            idle_ttl_secs: 60,
            sweep_batch: 8,
        }
    }
}

/// Token bucket settings shared by upload and download limiters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    /// Length of one refill cycle
    pub cycle_millis: u64,
    /// Distinct ids tracked per direction before new ids are refused
    pub max_tracked_ids: usize,
    /// Stale buckets removed per cleanup pass
    pub clean_batch: usize,
    /// A bucket untouched for this many cycles is stale
    pub stale_cycles: u32,
    /// How long a user's speed limits are cached
    pub speed_cache_ttl_secs: u64,
    /// Maximum cached speed-limit entries
    pub speed_cache_size: usize,
}

impl LimiterConfig {
    pub fn cycle(&self) -> Duration {
        Duration::from_millis(self.cycle_millis)
    }

    pub fn speed_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.speed_cache_ttl_secs)
    }
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            cycle_millis: 1000,
            max_tracked_ids: 4096,
            clean_batch: 16,
            stale_cycles: 5,
            speed_cache_ttl_secs: 10,
            speed_cache_size: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Upper bound on `_N` suffixes tried when promoting onto an existing name
    pub max_duplicates: u32,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_duplicates: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SharingConfig {
    /// Hex characters in a share id
    pub id_len: usize,
    /// Candidate ids tried before giving up with a conflict
    pub id_attempts: u32,
}

impl Default for SharingConfig {
    fn default() -> Self {
        Self {
            id_len: 7,
            id_attempts: 5,
        }
    }
}

/// Per-user space and speed limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuotaLimits {
    /// Bytes the user may store (committed + reserved)
    pub space_limit: u64,
    /// Upload bytes per limiter cycle
    pub upload_speed_limit: u64,
    /// Download bytes per limiter cycle
    pub download_speed_limit: u64,
}

impl Default for QuotaLimits {
    fn default() -> Self {
        Self {
            space_limit: 1024 * 1024 * 1024,       // 1 GB
            upload_speed_limit: 500 * 1024,        // 500 KB per cycle
            download_speed_limit: 1024 * 1024,     // 1 MB per cycle
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = DriveConfig::from_json_str(
            r#"{ "root": "/srv/drive", "handles": { "max_open": 16 } }"#,
        )
        .unwrap();

        assert_eq!(config.root, PathBuf::from("/srv/drive"));
        assert_eq!(config.handles.max_open, 16);
        assert_eq!(config.handles.idle_ttl_secs, 60);
        assert_eq!(config.sharing.id_len, 7);
        assert_eq!(config.limiter.cycle(), Duration::from_secs(1));
    }

    #[test]
    fn test_json_file_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("drive.json");
        let mut config = DriveConfig::ephemeral(dir.path());
        config.default_quota.space_limit = 42;
        std::fs::write(&path, serde_json::to_string_pretty(&config).unwrap()).unwrap();

        let loaded = DriveConfig::from_json_file(&path).unwrap();
        assert_eq!(loaded.default_quota.space_limit, 42);
        assert!(loaded.metadata_path.is_none());
    }

    #[test]
    fn test_malformed_json_is_serialization_error() {
        let err = DriveConfig::from_json_str("{ not json").unwrap_err();
        assert!(matches!(err, crate::DriveError::Serialization(_)));
    }
}
