//! Pattern Vault - Blob Store
//!
//! Fixed-capacity container files holding sealed windows. Free space is
//! tracked in memory only and rebuilt from the committed index on open.
//!
//! Compaction rewrites a blob into its next generation file, commits the
//! relocated segments through the index writer and only then deletes the old
//! generation. A crash before the commit leaves an orphan new generation that
//! is collected on the next open.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::ops::Range;
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock, RwLockReadGuard};
use tokio_util::sync::CancellationToken;

use crate::error::StorageError;
use crate::index::{IndexDocument, IndexStore, Segment};
use crate::secure_fs::{remove_if_exists, sync_dir};

/// Directory of blob files inside a vault
pub const BLOB_DIR: &str = "blobs";

/// File name of one blob generation
pub fn blob_file_name(index: u32, generation: u32) -> String {
    format!("blob-{:05}-g{}.bin", index, generation)
}

/// Parse `blob-<index>-g<generation>.bin`
pub fn parse_blob_file_name(name: &str) -> Option<(u32, u32)> {
    let rest = name.strip_prefix("blob-")?.strip_suffix(".bin")?;
    let (index, generation) = rest.split_once("-g")?;
    Some((index.parse().ok()?, generation.parse().ok()?))
}

#[derive(Debug, Clone, Default)]
struct BlobState {
    generation: u32,
    high_water: u64,
    /// Sorted, non-overlapping gaps below `high_water`
    free: Vec<Range<u64>>,
    /// Ranges handed out but not yet committed or released
    pending: usize,
    compacting: bool,
}

impl BlobState {
    fn free_bytes(&self) -> u64 {
        self.free.iter().map(|r| r.end - r.start).sum()
    }

    fn fragmentation(&self) -> f64 {
        if self.high_water == 0 {
            0.0
        } else {
            self.free_bytes() as f64 / self.high_water as f64
        }
    }

    /// Gaps past `capacity` (left by a blob written under a larger capacity)
    /// are never handed out.
    fn take(&mut self, size: u64, capacity: u64) -> Option<u64> {
        if let Some(pos) = self
            .free
            .iter()
            .position(|r| r.end.min(capacity).saturating_sub(r.start) >= size)
        {
            let offset = self.free[pos].start;
            self.free[pos].start += size;
            if self.free[pos].start == self.free[pos].end {
                self.free.remove(pos);
            }
            return Some(offset);
        }
        if self.high_water.checked_add(size).is_some_and(|end| end <= capacity) {
            let offset = self.high_water;
            self.high_water += size;
            return Some(offset);
        }
        None
    }

    fn give_back(&mut self, range: Range<u64>) {
        let pos = self.free.partition_point(|r| r.start < range.start);
        self.free.insert(pos, range);

        // Merge neighbours
        let mut merged: Vec<Range<u64>> = Vec::with_capacity(self.free.len());
        for r in self.free.drain(..) {
            match merged.last_mut() {
                Some(last) if last.end >= r.start => last.end = last.end.max(r.end),
                _ => merged.push(r),
            }
        }
        self.free = merged;
    }

    /// Recompute gaps from the committed segments of this blob
    fn rebuild(&mut self, generation: u32, high_water: u64, segments: &[Segment]) {
        self.generation = generation;
        self.high_water = high_water;
        self.free.clear();

        let mut cursor = 0;
        for seg in segments {
            if seg.offset > cursor {
                self.free.push(cursor..seg.offset);
            }
            cursor = cursor.max(seg.end());
        }
        if cursor < high_water {
            self.free.push(cursor..high_water);
        }
    }
}

/// Per-blob usage, for stats
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BlobUsage {
    pub index: u32,
    pub generation: u32,
    pub high_water: u64,
    pub free_bytes: u64,
    pub fragmentation: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionReport {
    pub blobs_compacted: Vec<u32>,
    pub bytes_reclaimed: u64,
}

#[derive(Debug, Default)]
struct ReleaseHolds {
    count: usize,
    /// Removed ranges with the generation they were committed in
    deferred: Vec<(Segment, u32)>,
}

/// While alive, ranges of removed files stay allocated and compaction does
/// not run, so bytes referenced by an earlier snapshot are never rewritten.
pub struct ReleaseHold<'a> {
    store: &'a BlobStore,
}

impl Drop for ReleaseHold<'_> {
    fn drop(&mut self) {
        let deferred = {
            let mut holds = self.store.holds.lock();
            holds.count = holds.count.saturating_sub(1);
            if holds.count > 0 {
                return;
            }
            std::mem::take(&mut holds.deferred)
        };

        let mut blobs = self.store.blobs.lock();
        for (seg, generation) in deferred {
            if let Some(state) = blobs.get_mut(seg.blob as usize) {
                if !state.compacting && state.generation == generation {
                    state.give_back(seg.offset..seg.end());
                }
            }
        }
    }
}

/// Allocator and I/O over one vault's blob files
pub struct BlobStore {
    dir: PathBuf,
    capacity: u64,
    blobs: Mutex<Vec<BlobState>>,
    holds: Mutex<ReleaseHolds>,
    /// Readers hold this across snapshot lookup and blob reads; compaction
    /// takes it exclusively while swapping generations.
    gate: RwLock<()>,
}

impl BlobStore {
    /// Open the blob directory, rebuild free-lists from `doc` and delete blob
    /// files the index does not reference.
    pub fn open(vault_dir: &Path, capacity: u64, doc: &IndexDocument) -> Result<Self, StorageError> {
        let dir = vault_dir.join(BLOB_DIR);
        fs::create_dir_all(&dir)?;

        let count = doc.blobs.iter().map(|r| r.index + 1).max().unwrap_or(0) as usize;
        let mut blobs = vec![BlobState::default(); count];
        for record in &doc.blobs {
            let segments = doc.segments_in_blob(record.index);
            let state = &mut blobs[record.index as usize];
            state.rebuild(record.generation, record.high_water, &segments);
            if record.high_water > capacity {
                tracing::warn!(
                    blob = record.index,
                    high_water = record.high_water,
                    capacity,
                    "blob exceeds configured capacity"
                );
            }
        }

        let store = Self {
            dir,
            capacity,
            blobs: Mutex::new(blobs),
            holds: Mutex::new(ReleaseHolds::default()),
            gate: RwLock::new(()),
        };
        store.collect_orphans(doc)?;
        Ok(store)
    }

    fn collect_orphans(&self, doc: &IndexDocument) -> Result<(), StorageError> {
        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };

            let referenced = match parse_blob_file_name(name) {
                Some((index, generation)) => doc
                    .record(index)
                    .map(|r| r.generation == generation)
                    .unwrap_or(false),
                None => false,
            };
            if !referenced {
                tracing::info!(file = %name, "removing unreferenced blob file");
                remove_if_exists(&entry.path())?;
            }
        }
        Ok(())
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn blob_path(&self, index: u32, generation: u32) -> PathBuf {
        self.dir.join(blob_file_name(index, generation))
    }

    fn current_path(&self, blob: u32) -> Result<PathBuf, StorageError> {
        let blobs = self.blobs.lock();
        let state = blobs.get(blob as usize).ok_or(StorageError::MissingBlob { blob, generation: 0 })?;
        Ok(self.blob_path(blob, state.generation))
    }

    pub fn current_generation(&self, blob: u32) -> Option<u32> {
        self.blobs.lock().get(blob as usize).map(|s| s.generation)
    }

    /// Defer space reuse and compaction until the returned guard drops
    pub fn hold_releases(&self) -> ReleaseHold<'_> {
        self.holds.lock().count += 1;
        ReleaseHold { store: self }
    }

    /// Bytes `[0, length)` of a committed blob generation. Fails if the blob
    /// has moved to another generation since.
    pub fn read_committed_prefix(&self, blob: u32, generation: u32, length: u64) -> Result<Vec<u8>, StorageError> {
        let _gate = self.gate.read();
        if self.current_generation(blob) != Some(generation) {
            return Err(StorageError::MissingBlob { blob, generation });
        }

        let path = self.blob_path(blob, generation);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::MissingBlob { blob, generation })
            }
            Err(e) => return Err(e.into()),
        };

        let mut buf = Vec::with_capacity(length as usize);
        file.take(length).read_to_end(&mut buf)?;
        if (buf.len() as u64) < length {
            return Err(StorageError::OutOfBounds {
                blob,
                offset: 0,
                length,
                limit: buf.len() as u64,
            });
        }
        Ok(buf)
    }

    /// Shared guard that keeps committed segments readable
    pub fn read_gate(&self) -> RwLockReadGuard<'_, ()> {
        self.gate.read()
    }

    /// Reserve `size` contiguous bytes. First fit over blobs in creation
    /// order; a new blob is created when none has room.
    pub fn allocate(&self, size: u64) -> Result<(u32, u64), StorageError> {
        if size == 0 || size > self.capacity {
            return Err(StorageError::AllocationTooLarge {
                size,
                capacity: self.capacity,
            });
        }

        let mut blobs = self.blobs.lock();
        for (index, state) in blobs.iter_mut().enumerate() {
            if state.compacting {
                continue;
            }
            if let Some(offset) = state.take(size, self.capacity) {
                state.pending += 1;
                return Ok((index as u32, offset));
            }
        }

        let index = blobs.len() as u32;
        blobs.push(BlobState {
            high_water: size,
            pending: 1,
            ..BlobState::default()
        });
        tracing::debug!(blob = index, "new blob");
        Ok((index, 0))
    }

    /// Write sealed bytes at an allocated range
    pub fn write(&self, blob: u32, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        let path = self.current_path(blob)?;
        let mut file = OpenOptions::new().write(true).create(true).open(&path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    /// Flush written blobs to disk before their segments are committed
    pub fn sync(&self, blobs: &[u32]) -> Result<(), StorageError> {
        for &blob in blobs {
            let path = self.current_path(blob)?;
            File::open(&path)?.sync_all()?;
        }
        sync_dir(&self.dir)
    }

    /// Read `length` bytes at `offset`. Bounds are checked against the
    /// blob's high-water mark.
    pub fn read(&self, blob: u32, offset: u64, length: u64) -> Result<Vec<u8>, StorageError> {
        let (path, generation, limit) = {
            let blobs = self.blobs.lock();
            let state = blobs.get(blob as usize).ok_or(StorageError::MissingBlob { blob, generation: 0 })?;
            (self.blob_path(blob, state.generation), state.generation, state.high_water)
        };

        if offset.checked_add(length).map_or(true, |end| end > limit) {
            return Err(StorageError::OutOfBounds { blob, offset, length, limit });
        }

        let mut file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StorageError::MissingBlob { blob, generation })
            }
            Err(e) => return Err(e.into()),
        };
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; length as usize];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Segments are now referenced by a committed entry
    pub fn commit(&self, segments: &[Segment]) {
        let mut blobs = self.blobs.lock();
        for seg in segments {
            if let Some(state) = blobs.get_mut(seg.blob as usize) {
                state.pending = state.pending.saturating_sub(1);
            }
        }
    }

    /// Return never-committed ranges (failed import)
    pub fn release_pending(&self, segments: &[Segment]) {
        let mut blobs = self.blobs.lock();
        for seg in segments {
            if let Some(state) = blobs.get_mut(seg.blob as usize) {
                state.pending = state.pending.saturating_sub(1);
                state.give_back(seg.offset..seg.end());
            }
        }
    }

    /// Return ranges of an entry removed in the commit that produced `doc`.
    /// Blobs whose generation moved on since are skipped; their free-list was
    /// rebuilt from a later snapshot.
    pub fn release_committed(&self, segments: &[Segment], doc: &IndexDocument) {
        let mut holds = self.holds.lock();
        if holds.count > 0 {
            for seg in segments {
                if let Some(record) = doc.record(seg.blob) {
                    holds.deferred.push((*seg, record.generation));
                }
            }
            return;
        }

        let mut blobs = self.blobs.lock();
        for seg in segments {
            let Some(record) = doc.record(seg.blob) else { continue };
            if let Some(state) = blobs.get_mut(seg.blob as usize) {
                if state.compacting || state.generation != record.generation {
                    continue;
                }
                state.give_back(seg.offset..seg.end());
            }
        }
    }

    pub fn usage(&self) -> Vec<BlobUsage> {
        self.blobs
            .lock()
            .iter()
            .enumerate()
            .map(|(index, s)| BlobUsage {
                index: index as u32,
                generation: s.generation,
                high_water: s.high_water,
                free_bytes: s.free_bytes(),
                fragmentation: s.fragmentation(),
            })
            .collect()
    }

    /// Rewrite every blob whose fragmentation exceeds `threshold`.
    ///
    /// Runs while other operations continue: allocation skips the blob being
    /// rewritten, and blobs with uncommitted allocations are left alone.
    pub fn compact(
        &self,
        index: &IndexStore,
        threshold: f64,
        cancel: &CancellationToken,
    ) -> Result<CompactionReport, StorageError> {
        if self.holds.lock().count > 0 {
            tracing::info!("compaction skipped while a backup holds blob ranges");
            return Ok(CompactionReport::default());
        }

        let candidates: Vec<u32> = {
            let blobs = self.blobs.lock();
            blobs
                .iter()
                .enumerate()
                .filter(|(_, s)| s.pending == 0 && !s.compacting && s.free_bytes() > 0 && s.fragmentation() > threshold)
                .map(|(i, _)| i as u32)
                .collect()
        };

        let mut report = CompactionReport::default();
        for blob in candidates {
            if cancel.is_cancelled() {
                return Err(StorageError::Cancelled);
            }
            if let Some(reclaimed) = self.compact_blob(index, blob, cancel)? {
                report.blobs_compacted.push(blob);
                report.bytes_reclaimed += reclaimed;
            }
        }

        tracing::info!(
            blobs = report.blobs_compacted.len(),
            reclaimed = report.bytes_reclaimed,
            "compaction finished"
        );
        Ok(report)
    }

    fn compact_blob(&self, index: &IndexStore, blob: u32, cancel: &CancellationToken) -> Result<Option<u64>, StorageError> {
        let (generation, old_high_water) = {
            let mut blobs = self.blobs.lock();
            let Some(state) = blobs.get_mut(blob as usize) else { return Ok(None) };
            if state.pending > 0 || state.compacting {
                return Ok(None);
            }
            state.compacting = true;
            (state.generation, state.high_water)
        };

        let result = self.rewrite_blob(index, blob, generation, cancel);

        // Whatever happened, free space follows the latest committed snapshot
        let snapshot = index.snapshot();
        {
            let mut blobs = self.blobs.lock();
            if let Some(state) = blobs.get_mut(blob as usize) {
                if let Some(record) = snapshot.record(blob) {
                    state.rebuild(record.generation, record.high_water, &snapshot.segments_in_blob(blob));
                }
                state.compacting = false;
            }
        }

        match result {
            Ok(new_high_water) => {
                tracing::debug!(blob, generation = generation + 1, "blob compacted");
                Ok(Some(old_high_water.saturating_sub(new_high_water)))
            }
            Err(e) => {
                if snapshot.record(blob).map(|r| r.generation) == Some(generation) {
                    remove_if_exists(&self.blob_path(blob, generation + 1))?;
                }
                Err(e)
            }
        }
    }

    /// Copy live segments into the next generation and commit the move
    fn rewrite_blob(
        &self,
        index: &IndexStore,
        blob: u32,
        generation: u32,
        cancel: &CancellationToken,
    ) -> Result<u64, StorageError> {
        let live = index.snapshot().segments_in_blob(blob);
        let old_path = self.blob_path(blob, generation);
        let new_path = self.blob_path(blob, generation + 1);

        let mut source = File::open(&old_path)?;
        let mut target = OpenOptions::new().write(true).create(true).truncate(true).open(&new_path)?;

        let mut moved: HashMap<u64, u64> = HashMap::with_capacity(live.len());
        let mut cursor = 0u64;
        let mut buf = Vec::new();
        for seg in &live {
            if cancel.is_cancelled() {
                return Err(StorageError::Cancelled);
            }
            buf.resize(seg.length as usize, 0);
            source.seek(SeekFrom::Start(seg.offset))?;
            source.read_exact(&mut buf)?;
            target.write_all(&buf)?;
            moved.insert(seg.offset, cursor);
            cursor += seg.length;
        }
        target.sync_all()?;
        drop(target);
        sync_dir(&self.dir)?;

        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }

        let new_high_water = cursor;
        let _exclusive = self.gate.write();
        index.mutate(move |doc| {
            for entry in doc.files.values_mut() {
                for seg in entry.segments.iter_mut().filter(|s| s.blob == blob) {
                    seg.offset = *moved.get(&seg.offset).ok_or_else(|| {
                        StorageError::CorruptIndex(format!("segment at {} of blob {} was not copied", seg.offset, blob))
                    })?;
                }
            }
            let record = doc
                .blobs
                .iter_mut()
                .find(|r| r.index == blob)
                .ok_or(StorageError::MissingBlob { blob, generation })?;
            record.generation = generation + 1;
            record.high_water = new_high_water;
            Ok(())
        })?;

        {
            let mut blobs = self.blobs.lock();
            if let Some(state) = blobs.get_mut(blob as usize) {
                state.generation = generation + 1;
                state.high_water = new_high_water;
            }
        }
        if let Err(e) = remove_if_exists(&old_path) {
            // Collected as an orphan on the next open
            tracing::warn!(blob, generation, error = %e, "could not delete old blob generation");
        }
        Ok(new_high_water)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::{FileEntry, GlobalSettings, MediaKind, VaultMetadata};
    use crate::secure_fs::SecureFs;
    use chrono::Utc;
    use pattern_keyvault::{derive, KdfParams, KeyHandle};
    use tempfile::tempdir;
    use uuid::Uuid;

    const CAP: u64 = 100;

    fn empty_doc() -> IndexDocument {
        IndexDocument::new(
            VaultMetadata::new("A1".into(), false),
            GlobalSettings { grid_size: 3, backup_enabled: false },
        )
    }

    fn entry(segments: Vec<Segment>) -> FileEntry {
        FileEntry {
            id: Uuid::new_v4(),
            original_name: "f".into(),
            size: segments.iter().map(|s| s.length).sum(),
            content_type: "application/octet-stream".into(),
            kind: MediaKind::Image,
            imported_at: Utc::now(),
            nonce_prefix: [0; 8],
            segments,
        }
    }

    /// Allocate, write a byte pattern, commit to the index
    fn store_file(store: &BlobStore, index: &IndexStore, size: u64, fill: u8) -> FileEntry {
        let (blob, offset) = store.allocate(size).unwrap();
        store.write(blob, offset, &vec![fill; size as usize]).unwrap();
        let seg = Segment { blob, offset, length: size };
        let e = entry(vec![seg]);
        index.add_file(e.clone()).unwrap();
        store.commit(&[seg]);
        e
    }

    fn setup(dir: &Path) -> (BlobStore, IndexStore) {
        let keys = KeyHandle::new(derive(&[0, 1, 2], 3, &KdfParams::minimal()).unwrap());
        let index = IndexStore::create(SecureFs::new(dir), keys, empty_doc()).unwrap();
        let store = BlobStore::open(dir, CAP, &index.snapshot()).unwrap();
        (store, index)
    }

    #[test]
    fn test_file_name_roundtrip() {
        assert_eq!(blob_file_name(3, 7), "blob-00003-g7.bin");
        assert_eq!(parse_blob_file_name("blob-00003-g7.bin"), Some((3, 7)));
        assert_eq!(parse_blob_file_name("index.enc"), None);
    }

    #[test]
    fn test_first_fit_and_new_blob() {
        let dir = tempdir().unwrap();
        let (store, _index) = setup(dir.path());

        assert_eq!(store.allocate(60).unwrap(), (0, 0));
        assert_eq!(store.allocate(40).unwrap(), (0, 60));
        // Blob 0 is full
        assert_eq!(store.allocate(1).unwrap(), (1, 0));
        assert!(matches!(store.allocate(CAP + 1), Err(StorageError::AllocationTooLarge { .. })));
    }

    #[test]
    fn test_released_gap_reused_first() {
        let dir = tempdir().unwrap();
        let (store, _index) = setup(dir.path());

        let a = store.allocate(30).unwrap();
        let _b = store.allocate(30).unwrap();
        store.release_pending(&[Segment { blob: a.0, offset: a.1, length: 30 }]);

        assert_eq!(store.allocate(20).unwrap(), (0, 0));
        assert_eq!(store.allocate(10).unwrap(), (0, 20));
        assert_eq!(store.allocate(10).unwrap(), (0, 60));
    }

    #[test]
    fn test_read_bounds_checked() {
        let dir = tempdir().unwrap();
        let (store, index) = setup(dir.path());
        let e = store_file(&store, &index, 10, 7);

        let seg = e.segments[0];
        assert_eq!(store.read(seg.blob, seg.offset, seg.length).unwrap(), vec![7; 10]);
        assert!(matches!(store.read(0, 5, 10), Err(StorageError::OutOfBounds { .. })));
        assert!(matches!(store.read(9, 0, 1), Err(StorageError::MissingBlob { .. })));
    }

    #[test]
    fn test_reopen_rebuilds_free_list_and_drops_orphans() {
        let dir = tempdir().unwrap();
        let (store, index) = setup(dir.path());

        let a = store_file(&store, &index, 30, 1);
        let _b = store_file(&store, &index, 30, 2);
        let (_, doc) = index.remove_file(a.id).unwrap();
        store.release_committed(&a.segments, &doc);

        // Uncommitted allocation in a fresh blob: its file is an orphan
        let (blob, offset) = store.allocate(80).unwrap();
        store.write(blob, offset, &[9; 80]).unwrap();
        drop(store);

        let reopened = BlobStore::open(dir.path(), CAP, &index.snapshot()).unwrap();
        assert!(!reopened.blob_path(1, 0).exists());
        // The removed file's gap is free again
        assert_eq!(reopened.allocate(30).unwrap(), (0, 0));
    }

    #[test]
    fn test_reopen_with_smaller_capacity() {
        let dir = tempdir().unwrap();
        let (store, index) = setup(dir.path());

        let a = store_file(&store, &index, 40, 1);
        let b = store_file(&store, &index, 40, 2);
        let c = store_file(&store, &index, 10, 3);
        for removed in [&a, &c] {
            let (_, doc) = index.remove_file(removed.id).unwrap();
            store.release_committed(&removed.segments, &doc);
        }
        drop(store);

        // Blob 0 reaches offset 90, past the new capacity of 50
        let reopened = BlobStore::open(dir.path(), 50, &index.snapshot()).unwrap();
        let kept = b.segments[0];
        assert_eq!(reopened.read(kept.blob, kept.offset, kept.length).unwrap(), vec![2; 40]);

        assert_eq!(reopened.allocate(40).unwrap(), (0, 0));
        // The gap at 80..90 lies past capacity and the tail is full
        assert_eq!(reopened.allocate(10).unwrap(), (1, 0));
        assert!(matches!(
            reopened.allocate(60),
            Err(StorageError::AllocationTooLarge { size: 60, capacity: 50 })
        ));
    }

    #[test]
    fn test_compaction_relocates_and_bumps_generation() {
        let dir = tempdir().unwrap();
        let (store, index) = setup(dir.path());

        let a = store_file(&store, &index, 40, 1);
        let b = store_file(&store, &index, 40, 2);
        let (_, doc) = index.remove_file(a.id).unwrap();
        store.release_committed(&a.segments, &doc);

        let report = store.compact(&index, 0.25, &CancellationToken::new()).unwrap();
        assert_eq!(report.blobs_compacted, vec![0]);
        assert_eq!(report.bytes_reclaimed, 40);

        let snap = index.snapshot();
        assert_eq!(snap.record(0).unwrap().generation, 1);
        assert_eq!(snap.record(0).unwrap().high_water, 40);

        let moved = snap.files[&b.id].segments[0];
        assert_eq!(moved.offset, 0);
        assert_eq!(store.read(0, 0, 40).unwrap(), vec![2; 40]);
        assert!(!store.blob_path(0, 0).exists());
        assert!(store.blob_path(0, 1).exists());
    }

    #[test]
    fn test_cancelled_compaction_changes_nothing() {
        let dir = tempdir().unwrap();
        let (store, index) = setup(dir.path());

        let a = store_file(&store, &index, 40, 1);
        let b = store_file(&store, &index, 40, 2);
        let (_, doc) = index.remove_file(a.id).unwrap();
        store.release_committed(&a.segments, &doc);

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(store.compact(&index, 0.25, &cancel), Err(StorageError::Cancelled)));

        let snap = index.snapshot();
        assert_eq!(snap.record(0).unwrap().generation, 0);
        let seg = snap.files[&b.id].segments[0];
        assert_eq!(store.read(seg.blob, seg.offset, seg.length).unwrap(), vec![2; 40]);
        assert!(!store.blob_path(0, 1).exists());
    }

    #[test]
    fn test_hold_defers_reuse_of_removed_ranges() {
        let dir = tempdir().unwrap();
        let (store, index) = setup(dir.path());
        let a = store_file(&store, &index, 40, 1);

        let hold = store.hold_releases();
        let (_, doc) = index.remove_file(a.id).unwrap();
        store.release_committed(&a.segments, &doc);
        assert_eq!(store.allocate(10).unwrap(), (0, 40));
        assert!(store.compact(&index, 0.0, &CancellationToken::new()).unwrap().blobs_compacted.is_empty());
        drop(hold);

        assert_eq!(store.allocate(10).unwrap(), (0, 0));
    }

    #[test]
    fn test_committed_prefix_checks_generation() {
        let dir = tempdir().unwrap();
        let (store, index) = setup(dir.path());
        store_file(&store, &index, 40, 5);

        assert_eq!(store.read_committed_prefix(0, 0, 40).unwrap(), vec![5; 40]);
        assert!(matches!(store.read_committed_prefix(0, 1, 40), Err(StorageError::MissingBlob { .. })));
        assert!(matches!(store.read_committed_prefix(0, 0, 41), Err(StorageError::OutOfBounds { .. })));
    }

    #[test]
    fn test_compaction_skips_blob_with_pending_allocation() {
        let dir = tempdir().unwrap();
        let (store, index) = setup(dir.path());

        let a = store_file(&store, &index, 40, 1);
        let (_, doc) = index.remove_file(a.id).unwrap();
        store.release_committed(&a.segments, &doc);
        store_file(&store, &index, 20, 2);
        let _in_flight = store.allocate(10).unwrap();

        let report = store.compact(&index, 0.0, &CancellationToken::new()).unwrap();
        assert!(report.blobs_compacted.is_empty());
    }
}
