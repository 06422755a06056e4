//! Pattern Vault - Import Pipeline
//!
//! Images and videos go through separate bounded pools. Each item is read in
//! fixed windows (a video is never held in memory whole), every window is
//! sealed and written to its own blob range, and the entry is committed last.
//! A failing item releases everything it allocated; siblings are unaffected.

use std::fs::File;
use std::io::{self, Cursor, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::config::EngineConfig;
use crate::crypto::{generate_nonce_prefix, seal_window, WindowContext};
use crate::error::{ImportError, StorageError};
use crate::index::{FileEntry, MediaKind, Segment};
use crate::vault::VaultStore;

// ═══════════════════════════════════════════════════════════════════════════
// ITEMS
// ═══════════════════════════════════════════════════════════════════════════

pub enum ImportSource {
    Path(PathBuf),
    Bytes(Vec<u8>),
    Reader(Box<dyn Read + Send>),
}

impl ImportSource {
    fn open(self) -> io::Result<Box<dyn Read + Send>> {
        Ok(match self {
            ImportSource::Path(path) => Box::new(File::open(path)?),
            ImportSource::Bytes(bytes) => Box::new(Cursor::new(bytes)),
            ImportSource::Reader(reader) => reader,
        })
    }
}

/// One pending import
pub struct ImportItem {
    pub name: String,
    pub kind: MediaKind,
    /// Sniffed from the first window when absent
    pub content_type: Option<String>,
    /// Known size, for progress only
    pub size_hint: Option<u64>,
    pub source: ImportSource,
}

impl ImportItem {
    /// Import a file from disk; media kind follows the extension
    pub fn from_path<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let kind = path
            .extension()
            .and_then(|e| e.to_str())
            .and_then(media_kind_for_extension)
            .unwrap_or(MediaKind::Image);

        Self {
            name,
            kind,
            content_type: None,
            size_hint: std::fs::metadata(path).ok().map(|m| m.len()),
            source: ImportSource::Path(path.to_path_buf()),
        }
    }

    pub fn from_bytes(name: impl Into<String>, kind: MediaKind, bytes: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            kind,
            content_type: None,
            size_hint: Some(bytes.len() as u64),
            source: ImportSource::Bytes(bytes),
        }
    }
}

pub fn media_kind_for_extension(ext: &str) -> Option<MediaKind> {
    match ext.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" | "png" | "gif" | "webp" | "heic" | "heif" => Some(MediaKind::Image),
        "mp4" | "m4v" | "mov" => Some(MediaKind::Video),
        _ => None,
    }
}

/// Detect content type from the leading bytes
pub fn sniff_content_type(data: &[u8]) -> &'static str {
    if data.len() < 12 {
        return "application/octet-stream";
    }

    match &data[0..8] {
        [0xFF, 0xD8, 0xFF, ..] => "image/jpeg",
        [0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A] => "image/png",
        [0x47, 0x49, 0x46, 0x38, ..] => "image/gif",
        [0x52, 0x49, 0x46, 0x46, ..] if &data[8..12] == b"WEBP" => "image/webp",
        _ if &data[4..8] == b"ftyp" => match &data[8..12] {
            b"heic" | b"heix" => "image/heic",
            b"mif1" | b"msf1" => "image/heif",
            b"qt  " => "video/quicktime",
            b"isom" | b"iso2" | b"mp41" | b"mp42" | b"avc1" | b"M4V " => "video/mp4",
            _ => "application/octet-stream",
        },
        _ => "application/octet-stream",
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// PROGRESS
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemProgress {
    /// Position of the item in its batch
    pub position: usize,
    pub name: String,
    pub bytes_done: u64,
    pub bytes_total: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImportProgress {
    pub items_completed: usize,
    pub items_total: usize,
    pub in_flight: Vec<ItemProgress>,
}

/// Result for one item, in submission order
#[derive(Debug)]
pub struct ImportOutcome {
    pub name: String,
    pub result: Result<FileEntry, ImportError>,
}

impl ImportOutcome {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// PIPELINE
// ═══════════════════════════════════════════════════════════════════════════

pub struct ImportPipeline {
    vault: Arc<VaultStore>,
    window_size: usize,
    image_slots: Arc<Semaphore>,
    video_slots: Arc<Semaphore>,
    progress: Arc<watch::Sender<ImportProgress>>,
}

impl ImportPipeline {
    pub fn new(vault: Arc<VaultStore>, config: &EngineConfig) -> Self {
        let (progress, _) = watch::channel(ImportProgress::default());
        Self {
            vault,
            window_size: config.window_size,
            image_slots: Arc::new(Semaphore::new(config.image_workers)),
            video_slots: Arc::new(Semaphore::new(config.video_workers)),
            progress: Arc::new(progress),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ImportProgress> {
        self.progress.subscribe()
    }

    /// Import a batch. Returns one outcome per item in submission order.
    pub async fn import_batch(&self, items: Vec<ImportItem>) -> Vec<ImportOutcome> {
        let total = items.len();
        self.progress.send_modify(|p| p.items_total += total);

        let mut tasks = JoinSet::new();
        let mut names = Vec::with_capacity(total);

        for (position, item) in items.into_iter().enumerate() {
            names.push(item.name.clone());
            let slots = match item.kind {
                MediaKind::Image => Arc::clone(&self.image_slots),
                MediaKind::Video => Arc::clone(&self.video_slots),
            };
            let vault = Arc::clone(&self.vault);
            let progress = Arc::clone(&self.progress);
            let window_size = self.window_size;

            tasks.spawn(async move {
                let _permit = match slots.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => return (position, Err(ImportError::Aborted(e.to_string()))),
                };
                let result = tokio::task::spawn_blocking(move || {
                    import_one(&vault, position, item, window_size, &progress)
                })
                .await
                .unwrap_or_else(|e| Err(ImportError::Aborted(e.to_string())));
                (position, result)
            });
        }

        let mut results: Vec<Option<Result<FileEntry, ImportError>>> = (0..total).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((position, result)) => results[position] = Some(result),
                Err(e) => tracing::error!(error = %e, "import task failed to join"),
            }
        }

        names
            .into_iter()
            .zip(results)
            .map(|(name, result)| ImportOutcome {
                name,
                result: result.unwrap_or_else(|| Err(ImportError::Aborted("task lost".into()))),
            })
            .collect()
    }
}

/// Read up to `size` bytes; short only at end of input
fn read_window(reader: &mut dyn Read, size: usize) -> io::Result<Zeroizing<Vec<u8>>> {
    let mut buf = Zeroizing::new(vec![0u8; size]);
    let mut filled = 0;
    while filled < size {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    buf.truncate(filled);
    Ok(buf)
}

fn storage_to_import(e: StorageError) -> ImportError {
    match e {
        StorageError::KeyRevoked => ImportError::KeyRevoked,
        other => ImportError::Storage(other),
    }
}

/// Import a single item on a blocking thread
fn import_one(
    vault: &VaultStore,
    position: usize,
    item: ImportItem,
    window_size: usize,
    progress: &watch::Sender<ImportProgress>,
) -> Result<FileEntry, ImportError> {
    progress.send_modify(|p| {
        p.in_flight.push(ItemProgress {
            position,
            name: item.name.clone(),
            bytes_done: 0,
            bytes_total: item.size_hint,
        })
    });
    tracing::debug!(position, kind = ?item.kind, "import started");

    let mut segments = Vec::new();
    let result = write_windows(vault, position, item, window_size, progress, &mut segments).and_then(|entry| {
        vault.commit_file(entry.clone()).map_err(storage_to_import)?;
        Ok(entry)
    });

    if let Err(e) = &result {
        vault.blobs().release_pending(&segments);
        tracing::warn!(position, error = %e, windows = segments.len(), "import failed, allocations released");
    }

    progress.send_modify(|p| {
        p.items_completed += 1;
        p.in_flight.retain(|i| i.position != position);
    });
    result
}

/// Seal and store every window; the built entry is returned uncommitted.
/// `segments` records each allocation as soon as it is made.
fn write_windows(
    vault: &VaultStore,
    position: usize,
    item: ImportItem,
    window_size: usize,
    progress: &watch::Sender<ImportProgress>,
    segments: &mut Vec<Segment>,
) -> Result<FileEntry, ImportError> {
    let mut reader = item.source.open().map_err(ImportError::Read)?;
    let id = Uuid::new_v4();
    let nonce_prefix = generate_nonce_prefix();

    let mut current = read_window(reader.as_mut(), window_size).map_err(ImportError::Read)?;
    let content_type = item
        .content_type
        .unwrap_or_else(|| sniff_content_type(&current).to_string());

    let mut index: u32 = 0;
    let mut size: u64 = 0;
    loop {
        // One window of lookahead decides the last-window flag
        let next = if current.len() == window_size {
            read_window(reader.as_mut(), window_size).map_err(ImportError::Read)?
        } else {
            Zeroizing::new(Vec::new())
        };
        let last = next.is_empty();

        let ctx = WindowContext {
            file_id: &id,
            nonce_prefix: &nonce_prefix,
            index,
            last,
        };
        let sealed = vault
            .keys()
            .with_keys(|k| seal_window(k.blob_key(), &ctx, &current))?
            .map_err(|e| ImportError::Encryption(e.to_string()))?;

        let (blob, offset) = vault
            .blobs()
            .allocate(sealed.len() as u64)
            .map_err(ImportError::Allocation)?;
        segments.push(Segment {
            blob,
            offset,
            length: sealed.len() as u64,
        });
        vault.blobs().write(blob, offset, &sealed).map_err(storage_to_import)?;

        size += current.len() as u64;
        progress.send_modify(|p| {
            if let Some(entry) = p.in_flight.iter_mut().find(|i| i.position == position) {
                entry.bytes_done = size;
            }
        });

        if last {
            break;
        }
        current = next;
        index = index
            .checked_add(1)
            .ok_or_else(|| ImportError::Aborted("too many windows".into()))?;
    }

    Ok(FileEntry {
        id,
        original_name: item.name,
        size,
        content_type,
        kind: item.kind,
        imported_at: Utc::now(),
        nonce_prefix,
        segments: segments.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::NewVault;
    use pattern_keyvault::{derive, KeyHandle};
    use tempfile::tempdir;

    fn open_vault(root: &Path, config: &EngineConfig) -> Arc<VaultStore> {
        let keys = KeyHandle::new(derive(&[0, 1, 2, 5], 3, &config.kdf).unwrap());
        let (vault, _) = VaultStore::open_or_create(
            root,
            keys,
            config.blob_capacity,
            NewVault { grid_size: 3, auto_name: "A1-B1-C1-C2".into(), is_duress: false },
        )
        .unwrap();
        Arc::new(vault)
    }

    fn data(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_roundtrip_at_blob_boundaries() {
        let dir = tempdir().unwrap();

        // Test blobs hold exactly four sealed 1024-byte windows
        let window = 1024;
        let cases = [(1, 1, 1), (4 * window - 1, 4, 1), (4 * window, 4, 1), (4 * window + 1, 5, 2)];

        for (n, windows, blobs) in cases {
            let root = dir.path().join(format!("case-{}", n));
            let config = EngineConfig::for_tests(&root);
            assert_eq!(config.window_size, window);
            let vault = open_vault(&root, &config);
            let pipeline = ImportPipeline::new(Arc::clone(&vault), &config);

            let outcomes = pipeline
                .import_batch(vec![ImportItem::from_bytes(format!("item-{}", n), MediaKind::Image, data(n))])
                .await;
            let entry = outcomes[0].result.as_ref().unwrap();

            assert_eq!(entry.size, n as u64);
            assert_eq!(entry.segments.len(), windows);
            let mut used: Vec<u32> = entry.segments.iter().map(|s| s.blob).collect();
            used.dedup();
            assert_eq!(used.len(), blobs, "size {}", n);
            assert_eq!(vault.read_file(&entry.id).unwrap(), data(n));
        }
    }

    #[tokio::test]
    async fn test_empty_file_is_one_window() {
        let dir = tempdir().unwrap();
        let config = EngineConfig::for_tests(dir.path());
        let vault = open_vault(dir.path(), &config);
        let pipeline = ImportPipeline::new(Arc::clone(&vault), &config);

        let outcomes = pipeline
            .import_batch(vec![ImportItem::from_bytes("empty.jpg", MediaKind::Image, Vec::new())])
            .await;
        let entry = outcomes[0].result.as_ref().unwrap();
        assert_eq!(entry.segments.len(), 1);
        assert!(vault.read_file(&entry.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failing_item_does_not_block_siblings() {
        let dir = tempdir().unwrap();
        let config = EngineConfig::for_tests(dir.path());
        let vault = open_vault(dir.path(), &config);
        let pipeline = ImportPipeline::new(Arc::clone(&vault), &config);
        let progress = pipeline.subscribe();

        let items = vec![
            ImportItem::from_bytes("a.jpg", MediaKind::Image, data(1500)),
            ImportItem::from_bytes("b.jpg", MediaKind::Image, data(700)),
            ImportItem::from_bytes("c.mp4", MediaKind::Video, data(5000)),
            ImportItem::from_bytes("d.mp4", MediaKind::Video, data(3000)),
            ImportItem::from_path(dir.path().join("missing.mov")),
        ];

        let outcomes = pipeline.import_batch(items).await;
        assert_eq!(outcomes.len(), 5);
        assert!(outcomes[..4].iter().all(ImportOutcome::is_success));
        assert!(matches!(outcomes[4].result, Err(ImportError::Read(_))));
        assert_eq!(outcomes[4].name, "missing.mov");

        assert_eq!(vault.list_files().len(), 4);
        for outcome in &outcomes[..4] {
            let entry = outcome.result.as_ref().unwrap();
            assert_eq!(vault.read_file(&entry.id).unwrap().len() as u64, entry.size);
        }

        let last = progress.borrow().clone();
        assert_eq!(last.items_total, 5);
        assert_eq!(last.items_completed, 5);
        assert!(last.in_flight.is_empty());
    }

    #[tokio::test]
    async fn test_revoked_key_rolls_back() {
        let dir = tempdir().unwrap();
        let config = EngineConfig::for_tests(dir.path());
        let vault = open_vault(dir.path(), &config);
        let pipeline = ImportPipeline::new(Arc::clone(&vault), &config);

        vault.keys().revoke();
        let outcomes = pipeline
            .import_batch(vec![ImportItem::from_bytes("x.png", MediaKind::Image, data(10))])
            .await;
        assert!(matches!(outcomes[0].result, Err(ImportError::KeyRevoked)));
        assert!(vault.blobs().usage().iter().all(|u| u.high_water == u.free_bytes));
    }

    #[test]
    fn test_sniff_content_type() {
        let mut jpeg = vec![0xFF, 0xD8, 0xFF, 0xE0];
        jpeg.resize(16, 0);
        assert_eq!(sniff_content_type(&jpeg), "image/jpeg");

        let mut mov = vec![0, 0, 0, 0x14];
        mov.extend_from_slice(b"ftypqt  ");
        mov.resize(16, 0);
        assert_eq!(sniff_content_type(&mov), "video/quicktime");

        assert_eq!(sniff_content_type(b"tiny"), "application/octet-stream");
    }

    #[test]
    fn test_kind_from_extension() {
        assert_eq!(media_kind_for_extension("MOV"), Some(MediaKind::Video));
        assert_eq!(media_kind_for_extension("heic"), Some(MediaKind::Image));
        assert_eq!(media_kind_for_extension("txt"), None);
    }
}
