//! Pattern Vault - Engine Configuration
//!
//! JSON-backed settings with production defaults. The unlock latency floor is
//! not configurable in production builds.

use std::path::{Path, PathBuf};
use std::time::Duration;

use pattern_keyvault::KdfParams;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{VaultError, VaultResult};

/// Hard ceiling for one blob file
pub const MAX_BLOB_CAPACITY: u64 = 50 * 1024 * 1024;

/// Remote per-object ceiling
pub const REMOTE_OBJECT_CEILING: u64 = 250 * 1000 * 1000;

/// Environment variable overriding the vault root
pub const ROOT_ENV: &str = "PATTERN_VAULT_ROOT";

/// Longest custom vault name kept
pub const MAX_VAULT_NAME_LEN: usize = 30;

// ═══════════════════════════════════════════════════════════════════════════
// LATENCY FLOOR
// ═══════════════════════════════════════════════════════════════════════════

/// Randomized minimum duration of every unlock attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencyFloor {
    pub min: Duration,
    pub max: Duration,
}

impl LatencyFloor {
    /// Production floor: 1-2 seconds
    pub const PROD: Self = Self {
        min: Duration::from_millis(1000),
        max: Duration::from_millis(2000),
    };

    /// Unit tests only
    pub const TEST: Self = Self {
        min: Duration::from_millis(5),
        max: Duration::from_millis(10),
    };

    /// Draw the floor for one attempt
    pub fn draw(&self) -> Duration {
        let min = self.min.as_millis() as u64;
        let max = (self.max.as_millis() as u64).max(min);
        Duration::from_millis(rand::thread_rng().gen_range(min..=max))
    }

    /// Floor in effect for this build
    pub fn current() -> Self {
        #[cfg(test)]
        {
            Self::TEST
        }
        #[cfg(not(test))]
        {
            Self::PROD
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// BACKUP CONFIGURATION
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Concurrent chunk uploads/downloads
    pub fan_out: usize,
    /// Attempts per chunk before the run fails
    pub max_attempts: u32,
    /// Delay before the first retry, doubled each attempt
    pub retry_backoff_ms: u64,
    /// Largest object the remote accepts
    pub object_ceiling: u64,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            fan_out: 4,
            max_attempts: 3,
            retry_backoff_ms: 250,
            object_ceiling: REMOTE_OBJECT_CEILING,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// ENGINE CONFIGURATION
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory holding `vaults/`
    pub root: PathBuf,
    /// Capacity of each blob file in bytes
    pub blob_capacity: u64,
    /// Plaintext window size for import encryption
    pub window_size: usize,
    /// Concurrent image imports
    pub image_workers: usize,
    /// Concurrent video imports
    pub video_workers: usize,
    /// Free/high-water ratio above which a blob is compacted
    pub compaction_threshold: f64,
    /// Argon2id parameters
    pub kdf: KdfParams,
    pub backup: BackupConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./pattern_vault"),
            blob_capacity: MAX_BLOB_CAPACITY,
            window_size: 1024 * 1024,
            image_workers: 2,
            video_workers: 2,
            compaction_threshold: 0.25,
            kdf: KdfParams::default(),
            backup: BackupConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Config rooted at `root` with defaults otherwise
    pub fn with_root<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            ..Self::default()
        }
    }

    /// Load from a JSON file; `PATTERN_VAULT_ROOT` overrides the root
    pub fn load<P: AsRef<Path>>(path: P) -> VaultResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let mut config: EngineConfig = serde_json::from_str(&text)
            .map_err(|e| VaultError::InvalidConfig(e.to_string()))?;
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> VaultResult<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| VaultError::InvalidConfig(e.to_string()))?;
        std::fs::write(path, json)?;
        Ok(())
    }

    pub fn apply_env(&mut self) {
        if let Ok(root) = std::env::var(ROOT_ENV) {
            if !root.is_empty() {
                self.root = PathBuf::from(root);
            }
        }
    }

    /// Size of one sealed window on disk
    pub fn sealed_window_size(&self) -> u64 {
        self.window_size as u64 + crate::crypto::TAG_LEN as u64
    }

    pub fn validate(&self) -> VaultResult<()> {
        if self.blob_capacity == 0 || self.blob_capacity > MAX_BLOB_CAPACITY {
            return Err(VaultError::InvalidConfig(format!(
                "blob_capacity must be in 1..={}",
                MAX_BLOB_CAPACITY
            )));
        }
        if self.window_size == 0 || self.sealed_window_size() > self.blob_capacity {
            return Err(VaultError::InvalidConfig(
                "window_size (plus tag) must fit in one blob".into(),
            ));
        }
        if self.image_workers == 0 || self.video_workers == 0 {
            return Err(VaultError::InvalidConfig("worker pools must be non-empty".into()));
        }
        if !(0.0..=1.0).contains(&self.compaction_threshold) {
            return Err(VaultError::InvalidConfig(
                "compaction_threshold must be within 0.0..=1.0".into(),
            ));
        }
        if self.backup.fan_out == 0 || self.backup.max_attempts == 0 {
            return Err(VaultError::InvalidConfig(
                "backup fan_out and max_attempts must be at least 1".into(),
            ));
        }
        if self.blob_capacity > self.backup.object_ceiling {
            return Err(VaultError::InvalidConfig(
                "blob_capacity exceeds the remote object ceiling".into(),
            ));
        }
        Ok(())
    }

    /// Small blobs and windows with cheap Argon2 for tests
    #[cfg(test)]
    pub fn for_tests<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            blob_capacity: 4 * (1024 + crate::crypto::TAG_LEN as u64),
            window_size: 1024,
            kdf: KdfParams::minimal(),
            backup: BackupConfig {
                retry_backoff_ms: 1,
                ..BackupConfig::default()
            },
            ..Self::default()
        }
    }
}
