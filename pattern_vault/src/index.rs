//! Pattern Vault - Vault Index (Encrypted Document)
//!
//! One encrypted document per vault: metadata, settings, file entries and the
//! blob table. Mutations are applied by a single writer thread in submission
//! order; readers clone the latest committed snapshot without waiting.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread::JoinHandle;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, unbounded, Sender};
use parking_lot::RwLock;
use pattern_keyvault::KeyHandle;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::MAX_VAULT_NAME_LEN;
use crate::crypto::{open_document, seal_document, NONCE_PREFIX_LEN};
use crate::error::StorageError;
use crate::secure_fs::SecureFs;

/// Index file name inside the vault directory
pub const INDEX_FILE: &str = "index.enc";

/// On-disk format version of the index document
pub const INDEX_FORMAT_VERSION: u8 = 1;

const INDEX_MAGIC: &[u8; 4] = b"PVIX";

// ═══════════════════════════════════════════════════════════════════════════
// DOCUMENT MODEL
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

/// One sealed window of a file inside a blob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub blob: u32,
    pub offset: u64,
    pub length: u64,
}

impl Segment {
    pub fn end(&self) -> u64 {
        self.offset + self.length
    }
}

/// A stored file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub id: Uuid,
    pub original_name: String,
    /// Plaintext size
    pub size: u64,
    pub content_type: String,
    pub kind: MediaKind,
    pub imported_at: DateTime<Utc>,
    /// Per-file nonce prefix; the window counter completes each nonce
    pub nonce_prefix: [u8; NONCE_PREFIX_LEN],
    /// Sealed windows in file order
    pub segments: Vec<Segment>,
}

impl FileEntry {
    /// Bytes occupied in blobs
    pub fn stored_size(&self) -> u64 {
        self.segments.iter().map(|s| s.length).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultMetadata {
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub file_count: u64,
    /// Sum of plaintext sizes
    pub total_size: u64,
    pub is_duress: bool,
    /// Grid-letter name generated at creation
    pub auto_name: String,
    pub custom_name: Option<String>,
    pub recovery_phrase_enabled: bool,
}

impl VaultMetadata {
    pub fn new(auto_name: String, is_duress: bool) -> Self {
        let now = Utc::now();
        Self {
            created_at: now,
            last_accessed: now,
            file_count: 0,
            total_size: 0,
            is_duress,
            auto_name,
            custom_name: None,
            recovery_phrase_enabled: false,
        }
    }

    /// Custom name if set, otherwise the generated one
    pub fn display_name(&self) -> &str {
        self.custom_name.as_deref().unwrap_or(&self.auto_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalSettings {
    pub grid_size: u8,
    pub backup_enabled: bool,
}

/// Committed state of one blob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRecord {
    pub index: u32,
    pub generation: u32,
    /// End of the furthest committed byte range
    pub high_water: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDocument {
    /// Incremented on every commit
    pub revision: u64,
    pub metadata: VaultMetadata,
    pub settings: GlobalSettings,
    pub files: BTreeMap<Uuid, FileEntry>,
    pub blobs: Vec<BlobRecord>,
}

/// Trim and cap a user supplied vault name (counted in characters)
pub fn normalize_vault_name(name: &str) -> Option<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(trimmed.chars().take(MAX_VAULT_NAME_LEN).collect())
}

impl IndexDocument {
    pub fn new(metadata: VaultMetadata, settings: GlobalSettings) -> Self {
        Self {
            revision: 0,
            metadata,
            settings,
            files: BTreeMap::new(),
            blobs: Vec::new(),
        }
    }

    pub fn record(&self, blob: u32) -> Option<&BlobRecord> {
        self.blobs.iter().find(|r| r.index == blob)
    }

    /// Insert a file and update counts, size and blob high-water marks together
    pub fn insert_file(&mut self, entry: FileEntry) {
        for seg in &entry.segments {
            match self.blobs.iter_mut().find(|r| r.index == seg.blob) {
                Some(record) => record.high_water = record.high_water.max(seg.end()),
                None => self.blobs.push(BlobRecord {
                    index: seg.blob,
                    generation: 0,
                    high_water: seg.end(),
                }),
            }
        }
        self.blobs.sort_by_key(|r| r.index);

        if let Some(old) = self.files.insert(entry.id, entry.clone()) {
            self.metadata.total_size = self.metadata.total_size.saturating_sub(old.size);
        } else {
            self.metadata.file_count += 1;
        }
        self.metadata.total_size += entry.size;
    }

    /// Remove a file and update counts and size together
    pub fn remove_file(&mut self, id: &Uuid) -> Option<FileEntry> {
        let entry = self.files.remove(id)?;
        self.metadata.file_count = self.metadata.file_count.saturating_sub(1);
        self.metadata.total_size = self.metadata.total_size.saturating_sub(entry.size);
        Some(entry)
    }

    /// Committed segments of one blob, sorted by offset
    pub fn segments_in_blob(&self, blob: u32) -> Vec<Segment> {
        let mut segments: Vec<Segment> = self
            .files
            .values()
            .flat_map(|f| f.segments.iter().copied())
            .filter(|s| s.blob == blob)
            .collect();
        segments.sort_by_key(|s| s.offset);
        segments
    }

    pub fn seal(&self, keys: &KeyHandle) -> Result<Vec<u8>, StorageError> {
        let json = serde_json::to_vec(self)?;
        keys.with_keys(|k| seal_document(k.index_key(), INDEX_MAGIC, INDEX_FORMAT_VERSION, &json))?
    }

    pub fn open(keys: &KeyHandle, data: &[u8]) -> Result<Self, StorageError> {
        let json = keys.with_keys(|k| open_document(k.index_key(), INDEX_MAGIC, INDEX_FORMAT_VERSION, data))??;
        serde_json::from_slice(&json).map_err(|e| StorageError::CorruptIndex(e.to_string()))
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// INDEX STORE (single writer)
// ═══════════════════════════════════════════════════════════════════════════

type Job = Box<dyn FnOnce(&WriterState) + Send>;

struct WriterState {
    fs: SecureFs,
    keys: KeyHandle,
    current: Arc<RwLock<Arc<IndexDocument>>>,
}

impl WriterState {
    fn commit(&self, doc: &IndexDocument) -> Result<(), StorageError> {
        let sealed = doc.seal(&self.keys)?;
        self.fs.write_atomic(INDEX_FILE, &sealed)
    }
}

/// Load the committed index of a vault directory, if one exists.
///
/// A write-ahead file left by an interrupted commit is discarded; the
/// previous snapshot stays authoritative.
pub fn load(fs: &SecureFs, keys: &KeyHandle) -> Result<Option<IndexDocument>, StorageError> {
    if fs.discard_wal(INDEX_FILE)? {
        tracing::warn!("discarded interrupted index write");
    }
    match fs.read_optional(INDEX_FILE)? {
        Some(data) => IndexDocument::open(keys, &data).map(Some),
        None => Ok(None),
    }
}

/// Serialized writer over one vault's index
pub struct IndexStore {
    current: Arc<RwLock<Arc<IndexDocument>>>,
    tx: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl IndexStore {
    /// Persist `doc` as the initial snapshot and start the writer
    pub fn create(fs: SecureFs, keys: KeyHandle, doc: IndexDocument) -> Result<Self, StorageError> {
        let sealed = doc.seal(&keys)?;
        fs.write_atomic(INDEX_FILE, &sealed)?;
        Self::start(fs, keys, doc)
    }

    /// Start the writer over an already committed snapshot
    pub fn start(fs: SecureFs, keys: KeyHandle, doc: IndexDocument) -> Result<Self, StorageError> {
        let current = Arc::new(RwLock::new(Arc::new(doc)));
        let state = WriterState {
            fs,
            keys,
            current: Arc::clone(&current),
        };

        let (tx, rx) = unbounded::<Job>();
        let worker = std::thread::Builder::new()
            .name("index-writer".into())
            .spawn(move || {
                for job in rx {
                    job(&state);
                }
            })?;

        Ok(Self {
            current,
            tx: Some(tx),
            worker: Some(worker),
        })
    }

    /// Latest committed snapshot. Never waits for an in-flight mutation.
    pub fn snapshot(&self) -> Arc<IndexDocument> {
        Arc::clone(&self.current.read())
    }

    /// Apply `f` to a copy of the latest snapshot and commit it.
    ///
    /// Mutations run one at a time in submission order. If `f` fails, or the
    /// commit fails, the committed snapshot is unchanged.
    pub fn mutate<T, F>(&self, f: F) -> Result<(T, Arc<IndexDocument>), StorageError>
    where
        T: Send + 'static,
        F: FnOnce(&mut IndexDocument) -> Result<T, StorageError> + Send + 'static,
    {
        let tx = self.tx.as_ref().ok_or(StorageError::WriterStopped)?;
        let (reply_tx, reply_rx) = bounded(1);

        let job: Job = Box::new(move |state: &WriterState| {
            let result = (|| {
                let mut doc = IndexDocument::clone(&state.current.read());
                let value = f(&mut doc)?;
                doc.revision += 1;
                state.commit(&doc)?;

                let committed = Arc::new(doc);
                *state.current.write() = Arc::clone(&committed);
                Ok((value, committed))
            })();
            let _ = reply_tx.send(result);
        });

        tx.send(job).map_err(|_| StorageError::WriterStopped)?;
        reply_rx.recv().map_err(|_| StorageError::WriterStopped)?
    }

    /// Insert a file entry (metadata updated in the same commit)
    pub fn add_file(&self, entry: FileEntry) -> Result<Arc<IndexDocument>, StorageError> {
        self.mutate(move |doc| {
            doc.insert_file(entry);
            Ok(())
        })
        .map(|(_, doc)| doc)
    }

    /// Remove a file entry; returns the removed entry and the committed snapshot
    pub fn remove_file(&self, id: Uuid) -> Result<(Option<FileEntry>, Arc<IndexDocument>), StorageError> {
        self.mutate(move |doc| Ok(doc.remove_file(&id)))
    }

    /// Set or clear the custom vault name
    pub fn rename(&self, name: Option<String>) -> Result<Arc<IndexDocument>, StorageError> {
        let name = name.as_deref().and_then(normalize_vault_name);
        self.mutate(move |doc| {
            doc.metadata.custom_name = name;
            Ok(())
        })
        .map(|(_, doc)| doc)
    }

    /// Record an access
    pub fn touch(&self) -> Result<Arc<IndexDocument>, StorageError> {
        self.mutate(|doc| {
            doc.metadata.last_accessed = Utc::now();
            Ok(())
        })
        .map(|(_, doc)| doc)
    }

    pub fn set_backup_enabled(&self, enabled: bool) -> Result<Arc<IndexDocument>, StorageError> {
        self.mutate(move |doc| {
            doc.settings.backup_enabled = enabled;
            Ok(())
        })
        .map(|(_, doc)| doc)
    }

    pub fn set_recovery_phrase_enabled(&self, enabled: bool) -> Result<Arc<IndexDocument>, StorageError> {
        self.mutate(move |doc| {
            doc.metadata.recovery_phrase_enabled = enabled;
            Ok(())
        })
        .map(|(_, doc)| doc)
    }

    pub fn get(&self, id: &Uuid) -> Option<FileEntry> {
        self.snapshot().files.get(id).cloned()
    }

    pub fn list(&self) -> Vec<FileEntry> {
        let mut files: Vec<FileEntry> = self.snapshot().files.values().cloned().collect();
        files.sort_by(|a, b| b.imported_at.cmp(&a.imported_at));
        files
    }
}

impl Drop for IndexStore {
    fn drop(&mut self) {
        // Closing the channel ends the writer loop after queued jobs finish
        drop(self.tx.take());
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}
