//! Remote object stores for backup chunks
//!
//! The remote only ever sees sealed blobs and sealed index bytes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::manifest::{BackupManifest, ChunkKey, ChunkKind};
use crate::error::BackupError;

/// Keyed object store holding chunks and manifests.
///
/// Puts are atomic per object and idempotent per key.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Stable identity of this remote (checkpoints are per remote)
    fn id(&self) -> String;

    async fn put_chunk(&self, key: &ChunkKey, data: Vec<u8>) -> Result<(), BackupError>;

    async fn get_chunk(&self, key: &ChunkKey) -> Result<Option<Vec<u8>>, BackupError>;

    /// Indices of stored chunks of one kind and format version
    async fn list_chunks(&self, vault_id: &str, kind: ChunkKind, format_version: u32) -> Result<Vec<u32>, BackupError>;

    async fn put_manifest(&self, manifest: &BackupManifest) -> Result<(), BackupError>;

    async fn get_manifest(&self, vault_id: &str, kind: ChunkKind) -> Result<Option<BackupManifest>, BackupError>;
}

// ═══════════════════════════════════════════════════════════════════════════
// IN-MEMORY
// ═══════════════════════════════════════════════════════════════════════════

/// Process-local remote
#[derive(Default)]
pub struct InMemoryRemote {
    id: String,
    chunks: Mutex<HashMap<ChunkKey, Vec<u8>>>,
    manifests: Mutex<HashMap<(String, ChunkKind), BackupManifest>>,
    chunk_puts: AtomicUsize,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self {
            id: format!("memory:{}", uuid::Uuid::new_v4()),
            ..Self::default()
        }
    }

    /// Number of chunk puts received, retries and duplicates included
    pub fn chunk_puts(&self) -> usize {
        self.chunk_puts.load(Ordering::SeqCst)
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.lock().len()
    }

    pub fn remove_chunk(&self, key: &ChunkKey) -> bool {
        self.chunks.lock().remove(key).is_some()
    }

    /// Flip one byte of a stored chunk
    pub fn corrupt_chunk(&self, key: &ChunkKey) -> bool {
        match self.chunks.lock().get_mut(key) {
            Some(data) if !data.is_empty() => {
                data[0] ^= 0xFF;
                true
            }
            _ => false,
        }
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemote {
    fn id(&self) -> String {
        self.id.clone()
    }

    async fn put_chunk(&self, key: &ChunkKey, data: Vec<u8>) -> Result<(), BackupError> {
        self.chunk_puts.fetch_add(1, Ordering::SeqCst);
        self.chunks.lock().insert(key.clone(), data);
        Ok(())
    }

    async fn get_chunk(&self, key: &ChunkKey) -> Result<Option<Vec<u8>>, BackupError> {
        Ok(self.chunks.lock().get(key).cloned())
    }

    async fn list_chunks(&self, vault_id: &str, kind: ChunkKind, format_version: u32) -> Result<Vec<u32>, BackupError> {
        let mut indices: Vec<u32> = self
            .chunks
            .lock()
            .keys()
            .filter(|k| k.vault_id == vault_id && k.kind == kind && k.format_version == format_version)
            .map(|k| k.index)
            .collect();
        indices.sort_unstable();
        Ok(indices)
    }

    async fn put_manifest(&self, manifest: &BackupManifest) -> Result<(), BackupError> {
        self.manifests
            .lock()
            .insert((manifest.vault_id.clone(), manifest.kind), manifest.clone());
        Ok(())
    }

    async fn get_manifest(&self, vault_id: &str, kind: ChunkKind) -> Result<Option<BackupManifest>, BackupError> {
        Ok(self.manifests.lock().get(&(vault_id.to_string(), kind)).cloned())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// DIRECTORY (USB drive / NAS mount)
// ═══════════════════════════════════════════════════════════════════════════

/// Remote backed by a directory, e.g. a USB drive or a mounted NAS share
pub struct DirectoryRemote {
    root: PathBuf,
}

impl DirectoryRemote {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    fn manifest_path(&self, vault_id: &str, kind: ChunkKind) -> PathBuf {
        self.root.join(vault_id).join(format!("{}.manifest.json", kind))
    }

    /// Write through a temporary name so readers never see a partial object
    async fn put_object(&self, path: &Path, data: &[u8]) -> Result<(), BackupError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(remote_io)?;
        }
        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".part");
        let tmp = PathBuf::from(tmp);

        tokio::fs::write(&tmp, data).await.map_err(remote_io)?;
        tokio::fs::rename(&tmp, path).await.map_err(remote_io)?;
        Ok(())
    }

    async fn get_object(&self, path: &Path) -> Result<Option<Vec<u8>>, BackupError> {
        match tokio::fs::read(path).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(remote_io(e)),
        }
    }
}

fn remote_io(e: std::io::Error) -> BackupError {
    BackupError::Remote(e.to_string())
}

#[async_trait]
impl RemoteStore for DirectoryRemote {
    fn id(&self) -> String {
        format!("dir:{}", self.root.display())
    }

    async fn put_chunk(&self, key: &ChunkKey, data: Vec<u8>) -> Result<(), BackupError> {
        self.put_object(&self.root.join(key.object_name()), &data).await
    }

    async fn get_chunk(&self, key: &ChunkKey) -> Result<Option<Vec<u8>>, BackupError> {
        self.get_object(&self.root.join(key.object_name())).await
    }

    async fn list_chunks(&self, vault_id: &str, kind: ChunkKind, format_version: u32) -> Result<Vec<u32>, BackupError> {
        let dir = self.root.join(vault_id).join(format!("v{}", format_version));
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(remote_io(e)),
        };

        let prefix = format!("{}-", kind);
        let mut indices = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(remote_io)? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(index) = name
                .strip_prefix(&prefix)
                .and_then(|rest| rest.strip_suffix(".chunk"))
                .and_then(|n| n.parse::<u32>().ok())
            {
                indices.push(index);
            }
        }
        indices.sort_unstable();
        Ok(indices)
    }

    async fn put_manifest(&self, manifest: &BackupManifest) -> Result<(), BackupError> {
        let json = serde_json::to_vec_pretty(manifest).map_err(|e| BackupError::Remote(e.to_string()))?;
        self.put_object(&self.manifest_path(&manifest.vault_id, manifest.kind), &json)
            .await
    }

    async fn get_manifest(&self, vault_id: &str, kind: ChunkKind) -> Result<Option<BackupManifest>, BackupError> {
        match self.get_object(&self.manifest_path(vault_id, kind)).await? {
            Some(json) => serde_json::from_slice(&json)
                .map(Some)
                .map_err(|e| BackupError::Remote(format!("unreadable manifest: {}", e))),
            None => Ok(None),
        }
    }
}
