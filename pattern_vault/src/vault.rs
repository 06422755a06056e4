//! Pattern Vault - Open Vault
//!
//! One vault directory opened with its key set: index writer, blob store and
//! the read path that turns segments back into plaintext.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use pattern_keyvault::KeyHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::blob_store::{BlobStore, CompactionReport};
use crate::crypto::{open_window, WindowContext};
use crate::error::{StorageError, VaultError, VaultResult};
use crate::index::{self, FileEntry, GlobalSettings, IndexDocument, IndexStore, VaultMetadata};
use crate::secure_fs::{sync_dir, SecureFs};

/// Directory holding one sub-directory per vault id
pub const VAULTS_DIR: &str = "vaults";

/// Directory of a vault under the engine root
pub fn vault_dir(root: &Path, vault_id: &str) -> PathBuf {
    root.join(VAULTS_DIR).join(vault_id)
}

/// Where a restore parks the old vault directory while swapping in the new one
pub fn retired_dir(root: &Path, vault_id: &str) -> PathBuf {
    root.join(VAULTS_DIR).join(format!(".retired-{}", vault_id))
}

/// Finish or undo a restore swap cut short by a crash. A retired directory
/// with no vault directory beside it is moved back; one left next to a
/// restored vault is deleted. Returns whether the old vault was moved back.
pub fn recover_interrupted_swap(root: &Path, vault_id: &str) -> Result<bool, StorageError> {
    let retired = retired_dir(root, vault_id);
    if !retired.exists() {
        return Ok(false);
    }

    let dir = vault_dir(root, vault_id);
    if dir.exists() {
        std::fs::remove_dir_all(&retired)?;
        return Ok(false);
    }
    std::fs::rename(&retired, &dir)?;
    sync_dir(&root.join(VAULTS_DIR))?;
    tracing::warn!("vault directory recovered from an interrupted restore");
    Ok(true)
}

/// How a vault directory is created when it does not exist yet
#[derive(Debug, Clone)]
pub struct NewVault {
    pub grid_size: u8,
    pub auto_name: String,
    pub is_duress: bool,
}

/// Vault statistics
#[derive(Debug, Clone, PartialEq)]
pub struct VaultStats {
    pub display_name: String,
    pub is_duress: bool,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub file_count: u64,
    /// Sum of plaintext sizes
    pub total_size: u64,
    pub blob_count: usize,
    /// Bytes referenced by committed segments
    pub stored_bytes: u64,
    /// Free bytes below blob high-water marks
    pub free_bytes: u64,
    /// Bytes on disk, index and blobs included
    pub disk_bytes: u64,
}

/// An unlocked vault
pub struct VaultStore {
    dir: PathBuf,
    fs: SecureFs,
    keys: KeyHandle,
    index: IndexStore,
    blobs: BlobStore,
}

impl VaultStore {
    /// Open the vault `keys` belongs to, if its directory holds an index
    pub fn open(root: &Path, keys: KeyHandle, blob_capacity: u64) -> Result<Option<Self>, StorageError> {
        recover_interrupted_swap(root, keys.vault_id())?;
        let dir = vault_dir(root, keys.vault_id());
        let fs = SecureFs::new(&dir);

        let Some(doc) = index::load(&fs, &keys)? else {
            return Ok(None);
        };
        let blobs = BlobStore::open(&dir, blob_capacity, &doc)?;
        let index = IndexStore::start(fs.clone(), keys.clone(), doc)?;

        Ok(Some(Self { dir, fs, keys, index, blobs }))
    }

    /// Open the vault, creating an empty one first if needed.
    /// Returns whether it was created.
    pub fn open_or_create(
        root: &Path,
        keys: KeyHandle,
        blob_capacity: u64,
        new: NewVault,
    ) -> Result<(Self, bool), StorageError> {
        if let Some(vault) = Self::open(root, keys.clone(), blob_capacity)? {
            return Ok((vault, false));
        }

        let dir = vault_dir(root, keys.vault_id());
        std::fs::create_dir_all(&dir)?;
        let fs = SecureFs::new(&dir);

        let doc = IndexDocument::new(
            VaultMetadata::new(new.auto_name, new.is_duress),
            GlobalSettings {
                grid_size: new.grid_size,
                backup_enabled: !new.is_duress,
            },
        );
        let blobs = BlobStore::open(&dir, blob_capacity, &doc)?;
        let index = IndexStore::create(fs.clone(), keys.clone(), doc)?;

        tracing::info!(duress = new.is_duress, "vault created");
        Ok((Self { dir, fs, keys, index, blobs }, true))
    }

    pub fn vault_id(&self) -> &str {
        self.keys.vault_id()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn fs(&self) -> &SecureFs {
        &self.fs
    }

    pub fn keys(&self) -> &KeyHandle {
        &self.keys
    }

    pub fn index(&self) -> &IndexStore {
        &self.index
    }

    pub fn blobs(&self) -> &BlobStore {
        &self.blobs
    }

    pub fn snapshot(&self) -> Arc<IndexDocument> {
        self.index.snapshot()
    }

    pub fn is_duress(&self) -> bool {
        self.index.snapshot().metadata.is_duress
    }

    // ═══════════════════════════════════════════════════════════════════════
    // FILES
    // ═══════════════════════════════════════════════════════════════════════

    pub fn list_files(&self) -> Vec<FileEntry> {
        self.index.list()
    }

    pub fn get_file(&self, id: &Uuid) -> VaultResult<FileEntry> {
        self.index.get(id).ok_or_else(|| VaultError::FileNotFound(id.to_string()))
    }

    /// Make a fully written entry visible: flush its blobs, then commit it
    pub fn commit_file(&self, entry: FileEntry) -> Result<Arc<IndexDocument>, StorageError> {
        let mut touched: Vec<u32> = entry.segments.iter().map(|s| s.blob).collect();
        touched.sort_unstable();
        touched.dedup();
        self.blobs.sync(&touched)?;

        let segments = entry.segments.clone();
        let doc = self.index.add_file(entry)?;
        self.blobs.commit(&segments);
        Ok(doc)
    }

    /// Decrypt a file into `writer`, window by window. Returns bytes written.
    pub fn export_file<W: Write>(&self, id: &Uuid, writer: &mut W) -> VaultResult<u64> {
        // Held across lookup and reads so compaction cannot swap generations
        let _gate = self.blobs.read_gate();
        let entry = self.get_file(id)?;
        let windows = entry.segments.len();
        let mut written = 0u64;

        for (i, seg) in entry.segments.iter().enumerate() {
            let sealed = self.blobs.read(seg.blob, seg.offset, seg.length)?;
            let ctx = WindowContext {
                file_id: &entry.id,
                nonce_prefix: &entry.nonce_prefix,
                index: i as u32,
                last: i + 1 == windows,
            };
            let plain = Zeroizing::new(self.keys.with_keys(|k| open_window(k.blob_key(), &ctx, &sealed))??);
            writer.write_all(&plain)?;
            written += plain.len() as u64;
        }

        if written != entry.size {
            return Err(StorageError::Decryption(format!(
                "file {} decrypted to {} bytes, expected {}",
                entry.id, written, entry.size
            ))
            .into());
        }
        Ok(written)
    }

    pub fn read_file(&self, id: &Uuid) -> VaultResult<Vec<u8>> {
        let mut out = Vec::new();
        self.export_file(id, &mut out)?;
        Ok(out)
    }

    /// Remove a file; its blob ranges become free once the removal commits
    pub fn remove_file(&self, id: &Uuid) -> VaultResult<FileEntry> {
        let (removed, doc) = self.index.remove_file(*id)?;
        let entry = removed.ok_or_else(|| VaultError::FileNotFound(id.to_string()))?;
        self.blobs.release_committed(&entry.segments, &doc);
        tracing::debug!(windows = entry.segments.len(), "file removed");
        Ok(entry)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // MAINTENANCE
    // ═══════════════════════════════════════════════════════════════════════

    pub fn compact(&self, threshold: f64, cancel: &CancellationToken) -> Result<CompactionReport, StorageError> {
        self.blobs.compact(&self.index, threshold, cancel)
    }

    pub fn stats(&self) -> VaultResult<VaultStats> {
        let doc = self.index.snapshot();
        let usage = self.blobs.usage();

        Ok(VaultStats {
            display_name: doc.metadata.display_name().to_string(),
            is_duress: doc.metadata.is_duress,
            created_at: doc.metadata.created_at,
            last_accessed: doc.metadata.last_accessed,
            file_count: doc.metadata.file_count,
            total_size: doc.metadata.total_size,
            blob_count: usage.len(),
            stored_bytes: doc.files.values().map(FileEntry::stored_size).sum(),
            free_bytes: usage.iter().map(|u| u.free_bytes).sum(),
            disk_bytes: self.fs.total_size()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{MediaKind, Segment};
    use crate::crypto::{generate_nonce_prefix, seal_window};
    use pattern_keyvault::{derive, KdfParams};
    use tempfile::tempdir;

    fn keys(cells: &[u16]) -> KeyHandle {
        KeyHandle::new(derive(cells, 3, &KdfParams::minimal()).unwrap())
    }

    fn new_vault() -> NewVault {
        NewVault { grid_size: 3, auto_name: "A1-B2-C3".into(), is_duress: false }
    }

    /// Store `data` as a single window
    fn store_single_window(vault: &VaultStore, data: &[u8]) -> FileEntry {
        let id = Uuid::new_v4();
        let prefix = generate_nonce_prefix();
        let ctx = WindowContext { file_id: &id, nonce_prefix: &prefix, index: 0, last: true };
        let sealed = vault.keys().with_keys(|k| seal_window(k.blob_key(), &ctx, data)).unwrap().unwrap();
        let (blob, offset) = vault.blobs().allocate(sealed.len() as u64).unwrap();
        vault.blobs().write(blob, offset, &sealed).unwrap();

        let entry = FileEntry {
            id,
            original_name: "note.bin".into(),
            size: data.len() as u64,
            content_type: "application/octet-stream".into(),
            kind: MediaKind::Image,
            imported_at: Utc::now(),
            nonce_prefix: prefix,
            segments: vec![Segment { blob, offset, length: sealed.len() as u64 }],
        };
        vault.commit_file(entry.clone()).unwrap();
        entry
    }

    #[test]
    fn test_open_missing_vault_is_none() {
        let dir = tempdir().unwrap();
        assert!(VaultStore::open(dir.path(), keys(&[0, 1, 2]), 4096).unwrap().is_none());
    }

    #[test]
    fn test_create_then_reopen() {
        let dir = tempdir().unwrap();
        let (vault, created) = VaultStore::open_or_create(dir.path(), keys(&[0, 1, 2]), 4096, new_vault()).unwrap();
        assert!(created);
        let entry = store_single_window(&vault, b"hello vault");
        drop(vault);

        let (vault, created) = VaultStore::open_or_create(dir.path(), keys(&[0, 1, 2]), 4096, new_vault()).unwrap();
        assert!(!created);
        assert_eq!(vault.read_file(&entry.id).unwrap(), b"hello vault");
        assert_eq!(vault.stats().unwrap().file_count, 1);
    }

    #[test]
    fn test_open_recovers_vault_left_retired() {
        let dir = tempdir().unwrap();
        let handle = keys(&[3, 4, 5]);
        let (vault, _) = VaultStore::open_or_create(dir.path(), handle.clone(), 4096, new_vault()).unwrap();
        let entry = store_single_window(&vault, b"before the swap");
        drop(vault);

        // Crash after the old directory was moved aside, before the new one arrived
        let id = handle.vault_id().to_string();
        std::fs::rename(vault_dir(dir.path(), &id), retired_dir(dir.path(), &id)).unwrap();

        let vault = VaultStore::open(dir.path(), handle, 4096).unwrap().unwrap();
        assert_eq!(vault.read_file(&entry.id).unwrap(), b"before the swap");
        assert!(!retired_dir(dir.path(), &id).exists());
    }

    #[test]
    fn test_leftover_retired_dir_is_removed() {
        let dir = tempdir().unwrap();
        let handle = keys(&[3, 4, 5]);
        let (vault, _) = VaultStore::open_or_create(dir.path(), handle.clone(), 4096, new_vault()).unwrap();
        drop(vault);

        let retired = retired_dir(dir.path(), handle.vault_id());
        std::fs::create_dir_all(retired.join("blobs")).unwrap();
        assert!(!recover_interrupted_swap(dir.path(), handle.vault_id()).unwrap());
        assert!(!retired.exists());
        assert!(VaultStore::open(dir.path(), handle, 4096).unwrap().is_some());
    }

    #[test]
    fn test_remove_file_frees_space() {
        let dir = tempdir().unwrap();
        let (vault, _) = VaultStore::open_or_create(dir.path(), keys(&[4, 5, 6]), 4096, new_vault()).unwrap();
        let entry = store_single_window(&vault, &[1u8; 100]);

        vault.remove_file(&entry.id).unwrap();
        assert!(matches!(vault.read_file(&entry.id), Err(VaultError::FileNotFound(_))));
        assert!(matches!(vault.remove_file(&entry.id), Err(VaultError::FileNotFound(_))));

        let stats = vault.stats().unwrap();
        assert_eq!(stats.file_count, 0);
        assert_eq!(stats.free_bytes, 116);
    }

    #[test]
    fn test_read_after_revoke_fails() {
        let dir = tempdir().unwrap();
        let handle = keys(&[1, 4, 7]);
        let (vault, _) = VaultStore::open_or_create(dir.path(), handle.clone(), 4096, new_vault()).unwrap();
        let entry = store_single_window(&vault, b"secret");

        handle.revoke();
        assert!(matches!(vault.read_file(&entry.id), Err(VaultError::VaultLocked)));
    }

    #[test]
    fn test_compaction_keeps_files_readable() {
        let dir = tempdir().unwrap();
        let (vault, _) = VaultStore::open_or_create(dir.path(), keys(&[2, 4, 6]), 4096, new_vault()).unwrap();
        let a = store_single_window(&vault, &[1u8; 300]);
        let b = store_single_window(&vault, &[2u8; 300]);
        vault.remove_file(&a.id).unwrap();

        let report = vault.compact(0.25, &CancellationToken::new()).unwrap();
        assert_eq!(report.blobs_compacted, vec![0]);
        assert_eq!(vault.read_file(&b.id).unwrap(), vec![2u8; 300]);
    }
}
