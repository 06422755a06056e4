//! Backup chunk keys and manifests

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::content_hash;
use crate::error::RestoreError;

/// Wire format of chunks and manifests
pub const BACKUP_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkKind {
    Blob,
    Index,
}

impl fmt::Display for ChunkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkKind::Blob => f.write_str("blob"),
            ChunkKind::Index => f.write_str("index"),
        }
    }
}

/// Remote identity of one chunk. Uploading the same key twice replaces the
/// object, so retries never duplicate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkKey {
    pub vault_id: String,
    pub kind: ChunkKind,
    pub index: u32,
    pub format_version: u32,
}

impl ChunkKey {
    pub fn new(vault_id: &str, kind: ChunkKind, index: u32) -> Self {
        Self {
            vault_id: vault_id.to_string(),
            kind,
            index,
            format_version: BACKUP_FORMAT_VERSION,
        }
    }

    /// Relative object name, e.g. `<vault>/v1/blob-00003.chunk`
    pub fn object_name(&self) -> String {
        format!(
            "{}/v{}/{}-{:05}.chunk",
            self.vault_id, self.format_version, self.kind, self.index
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub index: u32,
    /// Hex SHA-256 of the chunk bytes
    pub hash: String,
    pub length: u64,
    /// Blob generation the bytes came from (0 for index chunks)
    pub generation: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub format_version: u32,
    pub vault_id: String,
    pub kind: ChunkKind,
    pub chunk_count: u32,
    pub chunks: Vec<ChunkInfo>,
    pub created_at: DateTime<Utc>,
    /// Index manifests: hash of the blob manifest they pair with
    pub paired_manifest_hash: Option<String>,
}

impl BackupManifest {
    pub fn new(vault_id: &str, kind: ChunkKind, mut chunks: Vec<ChunkInfo>) -> Self {
        chunks.sort_by_key(|c| c.index);
        Self {
            format_version: BACKUP_FORMAT_VERSION,
            vault_id: vault_id.to_string(),
            kind,
            chunk_count: chunks.len() as u32,
            chunks,
            created_at: Utc::now(),
            paired_manifest_hash: None,
        }
    }

    /// Hash over the serialized manifest
    pub fn manifest_hash(&self) -> Result<String, serde_json::Error> {
        Ok(content_hash(&serde_json::to_vec(self)?))
    }

    pub fn key(&self, index: u32) -> ChunkKey {
        ChunkKey {
            vault_id: self.vault_id.clone(),
            kind: self.kind,
            index,
            format_version: self.format_version,
        }
    }

    /// Check version, count and that each chunk is listed once. Index
    /// chunks must run `0..n` since they concatenate into one document; blob
    /// chunks may skip indices of blobs no committed file uses.
    pub fn verify_complete(&self) -> Result<(), RestoreError> {
        if self.format_version != BACKUP_FORMAT_VERSION {
            return Err(RestoreError::UnsupportedVersion(self.format_version));
        }
        if self.chunks.len() as u32 != self.chunk_count {
            return Err(RestoreError::IncompleteManifest(format!(
                "{} manifest lists {} of {} chunks",
                self.kind,
                self.chunks.len(),
                self.chunk_count
            )));
        }
        if let Some(pair) = self.chunks.windows(2).find(|w| w[0].index >= w[1].index) {
            return Err(RestoreError::IncompleteManifest(format!(
                "{} manifest lists chunk {} out of order or twice",
                self.kind, pair[1].index
            )));
        }
        if self.kind == ChunkKind::Index {
            for (expected, chunk) in self.chunks.iter().enumerate() {
                if chunk.index != expected as u32 {
                    return Err(RestoreError::MissingChunk {
                        kind: self.kind.to_string(),
                        index: expected as u32,
                    });
                }
            }
        }
        Ok(())
    }
}
