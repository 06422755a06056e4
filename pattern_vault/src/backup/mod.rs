//! Pattern Vault - Backup & Restore
//!
//! Chunked, resumable upload of a vault to a remote object store. Blobs go
//! first, one chunk each; the blob manifest is published once every blob is
//! acknowledged; then the sealed index snapshot and, last, the index manifest
//! that pairs with the blob manifest. Nothing published ever points at an
//! unacknowledged chunk.

pub mod checkpoint;
pub mod host;
pub mod manifest;
pub mod remote;
pub mod restore;

use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pattern_keyvault::KeyHandle;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;

pub use checkpoint::{AckedChunk, BackupCheckpoint, CHECKPOINT_FILE};
pub use host::{ExecutionHost, ForegroundHost, ManualHost, ProtectionToken};
pub use manifest::{BackupManifest, ChunkInfo, ChunkKey, ChunkKind, BACKUP_FORMAT_VERSION};
pub use remote::{DirectoryRemote, InMemoryRemote, RemoteStore};
pub use restore::RestoreReport;

use host::ProtectionGuard;

use crate::config::BackupConfig;
use crate::crypto::content_hash;
use crate::error::{BackupError, RestoreError, StorageError};
use crate::index::BlobRecord;
use crate::vault::VaultStore;

// ═══════════════════════════════════════════════════════════════════════════
// STATE
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The protected execution grant expired; resumable
    Interrupted,
    Error(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupState {
    Idle,
    UploadingBlobs { acked: u32, total: u32 },
    UploadingIndex,
    Finalizing,
    Complete,
    Failed(FailureReason),
}

impl BackupState {
    pub fn is_running(&self) -> bool {
        matches!(
            self,
            BackupState::UploadingBlobs { .. } | BackupState::UploadingIndex | BackupState::Finalizing
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupReport {
    pub blobs_total: usize,
    pub blobs_uploaded: usize,
    /// Already acknowledged with identical bytes
    pub blobs_skipped: usize,
    pub index_chunks: usize,
    pub bytes_uploaded: u64,
}

// ═══════════════════════════════════════════════════════════════════════════
// RETRY
// ═══════════════════════════════════════════════════════════════════════════

/// Run `op` until it succeeds, a non-retryable error occurs or attempts run out
async fn with_retry<T, F, Fut>(config: &BackupConfig, what: &str, mut op: F) -> Result<T, BackupError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BackupError>>,
{
    let mut attempt: u32 = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < config.max_attempts => {
                let delay = config.retry_backoff_ms.saturating_mul(1u64 << (attempt - 1).min(16));
                tracing::warn!(what, attempt, error = %e, "remote operation failed, retrying");
                tokio::time::sleep(Duration::from_millis(delay)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn put_chunk(
    remote: &Arc<dyn RemoteStore>,
    config: &BackupConfig,
    key: ChunkKey,
    data: Vec<u8>,
) -> Result<(), BackupError> {
    if data.len() as u64 > config.object_ceiling {
        return Err(BackupError::ChunkTooLarge {
            size: data.len() as u64,
            limit: config.object_ceiling,
        });
    }
    let what = key.object_name();
    with_retry(config, &what, || {
        let remote = Arc::clone(remote);
        let key = key.clone();
        let data = data.clone();
        async move { remote.put_chunk(&key, data).await }
    })
    .await
}

async fn put_manifest(
    remote: &Arc<dyn RemoteStore>,
    config: &BackupConfig,
    manifest: &BackupManifest,
) -> Result<(), BackupError> {
    with_retry(config, "manifest", || {
        let remote = Arc::clone(remote);
        let manifest = manifest.clone();
        async move { remote.put_manifest(&manifest).await }
    })
    .await
}

fn join_error(e: tokio::task::JoinError) -> BackupError {
    BackupError::Remote(format!("backup task failed: {}", e))
}

// ═══════════════════════════════════════════════════════════════════════════
// COORDINATOR
// ═══════════════════════════════════════════════════════════════════════════

struct BlobChunk {
    info: ChunkInfo,
    uploaded: bool,
}

/// Clears the running flag on every exit path
struct RunningFlag<'a>(&'a AtomicBool);

impl Drop for RunningFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct BackupCoordinator {
    remote: Arc<dyn RemoteStore>,
    host: Arc<dyn ExecutionHost>,
    config: BackupConfig,
    state: watch::Sender<BackupState>,
    running: AtomicBool,
}

impl BackupCoordinator {
    pub fn new(remote: Arc<dyn RemoteStore>, host: Arc<dyn ExecutionHost>, config: BackupConfig) -> Self {
        let (state, _) = watch::channel(BackupState::Idle);
        Self {
            remote,
            host,
            config,
            state,
            running: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<BackupState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> BackupState {
        self.state.borrow().clone()
    }

    fn publish(&self, state: BackupState) {
        tracing::debug!(?state, "backup state");
        self.state.send_replace(state);
    }

    /// Back up `vault`. A run starts from `Idle`; a finished or failed run
    /// returns to `Idle` when the next one starts.
    pub async fn run(&self, vault: Arc<VaultStore>) -> Result<BackupReport, BackupError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(BackupError::AlreadyRunning);
        }
        let _running = RunningFlag(&self.running);
        self.publish(BackupState::Idle);

        if !vault.snapshot().settings.backup_enabled {
            return Err(BackupError::Disabled);
        }
        if vault.keys().is_revoked() {
            return Err(StorageError::KeyRevoked.into());
        }

        let protection = ProtectionGuard::begin(self.host.as_ref());
        let result = self.upload(&vault, protection.token()).await;
        drop(protection);

        match &result {
            Ok(report) => {
                tracing::info!(
                    uploaded = report.blobs_uploaded,
                    skipped = report.blobs_skipped,
                    bytes = report.bytes_uploaded,
                    "backup complete"
                );
                self.publish(BackupState::Complete);
            }
            Err(BackupError::Interrupted) => {
                tracing::warn!("backup interrupted, resumable");
                self.publish(BackupState::Failed(FailureReason::Interrupted));
            }
            Err(e) => {
                tracing::error!(error = %e, "backup failed");
                self.publish(BackupState::Failed(FailureReason::Error(e.to_string())));
            }
        }
        result
    }

    async fn upload(&self, vault: &Arc<VaultStore>, token: &ProtectionToken) -> Result<BackupReport, BackupError> {
        // Bytes referenced by this snapshot stay put until the run ends
        let _hold = vault.blobs().hold_releases();
        let snapshot = vault.snapshot();
        let vault_id = vault.vault_id().to_string();

        let mut checkpoint = {
            let vault = Arc::clone(vault);
            let remote_id = self.remote.id();
            tokio::task::spawn_blocking(move || BackupCheckpoint::load(vault.fs(), vault.keys(), &remote_id))
                .await
                .map_err(join_error)??
        };

        let total = snapshot.blobs.len();
        let mut report = BackupReport {
            blobs_total: total,
            ..BackupReport::default()
        };
        self.publish(BackupState::UploadingBlobs { acked: 0, total: total as u32 });

        // Blob chunks
        let slots = Arc::new(Semaphore::new(self.config.fan_out));
        let mut tasks = JoinSet::new();
        let acked_before = Arc::new(checkpoint.clone());
        for record in snapshot.blobs.iter().copied() {
            tasks.spawn(upload_blob(
                Arc::clone(vault),
                Arc::clone(&self.remote),
                Arc::clone(&slots),
                token.clone(),
                self.config.clone(),
                record,
                Arc::clone(&acked_before),
            ));
        }

        let mut infos = Vec::with_capacity(total);
        let mut interrupted = false;
        let mut failure = None;
        while let Some(joined) = tasks.join_next().await {
            match joined.map_err(join_error).and_then(|r| r) {
                Ok(chunk) => {
                    if chunk.uploaded {
                        report.blobs_uploaded += 1;
                        report.bytes_uploaded += chunk.info.length;
                    } else {
                        report.blobs_skipped += 1;
                    }
                    checkpoint.ack(
                        chunk.info.index,
                        AckedChunk {
                            generation: chunk.info.generation,
                            hash: chunk.info.hash.clone(),
                            length: chunk.info.length,
                        },
                    );
                    self.save_checkpoint(vault, &checkpoint).await?;
                    infos.push(chunk.info);
                    self.publish(BackupState::UploadingBlobs {
                        acked: infos.len() as u32,
                        total: total as u32,
                    });
                }
                Err(BackupError::Interrupted) => interrupted = true,
                Err(e) => {
                    if failure.is_none() {
                        tasks.abort_all();
                        failure = Some(e);
                    }
                }
            }
        }
        if let Some(e) = failure {
            return Err(e);
        }
        if interrupted || token.is_expired() {
            return Err(BackupError::Interrupted);
        }

        let blob_manifest = BackupManifest::new(&vault_id, ChunkKind::Blob, infos);
        put_manifest(&self.remote, &self.config, &blob_manifest).await?;

        // Index snapshot, sealed exactly as it is stored locally
        self.publish(BackupState::UploadingIndex);
        let sealed = snapshot.seal(vault.keys())?;
        let piece_len = self.config.object_ceiling.max(1) as usize;
        let mut index_infos = Vec::new();
        for (i, piece) in sealed.chunks(piece_len).enumerate() {
            if token.is_expired() {
                return Err(BackupError::Interrupted);
            }
            let key = ChunkKey::new(&vault_id, ChunkKind::Index, i as u32);
            put_chunk(&self.remote, &self.config, key, piece.to_vec()).await?;
            report.bytes_uploaded += piece.len() as u64;
            index_infos.push(ChunkInfo {
                index: i as u32,
                hash: content_hash(piece),
                length: piece.len() as u64,
                generation: 0,
            });
        }
        report.index_chunks = index_infos.len();

        self.publish(BackupState::Finalizing);
        if token.is_expired() {
            return Err(BackupError::Interrupted);
        }
        let mut index_manifest = BackupManifest::new(&vault_id, ChunkKind::Index, index_infos);
        index_manifest.paired_manifest_hash = Some(blob_manifest.manifest_hash().map_err(StorageError::from)?);
        put_manifest(&self.remote, &self.config, &index_manifest).await?;

        Ok(report)
    }

    async fn save_checkpoint(&self, vault: &Arc<VaultStore>, checkpoint: &BackupCheckpoint) -> Result<(), BackupError> {
        let vault = Arc::clone(vault);
        let checkpoint = checkpoint.clone();
        tokio::task::spawn_blocking(move || checkpoint.save(vault.fs(), vault.keys()))
            .await
            .map_err(join_error)??;
        Ok(())
    }

    /// Restore the backup of the vault `keys` opens into `root`. The vault
    /// must not be open.
    pub async fn restore(&self, root: &Path, keys: &KeyHandle) -> Result<RestoreReport, RestoreError> {
        let _protection = ProtectionGuard::begin(self.host.as_ref());
        restore::restore_vault(Arc::clone(&self.remote), root, keys, self.config.fan_out).await
    }
}

/// Read, hash and (unless already acknowledged) upload one blob
async fn upload_blob(
    vault: Arc<VaultStore>,
    remote: Arc<dyn RemoteStore>,
    slots: Arc<Semaphore>,
    token: ProtectionToken,
    config: BackupConfig,
    record: BlobRecord,
    acked: Arc<BackupCheckpoint>,
) -> Result<BlobChunk, BackupError> {
    let _permit = slots
        .acquire_owned()
        .await
        .map_err(|e| BackupError::Remote(e.to_string()))?;
    // Chunk boundary
    if token.is_expired() {
        return Err(BackupError::Interrupted);
    }

    let data = {
        let vault = Arc::clone(&vault);
        tokio::task::spawn_blocking(move || {
            vault
                .blobs()
                .read_committed_prefix(record.index, record.generation, record.high_water)
        })
        .await
        .map_err(join_error)??
    };

    let info = ChunkInfo {
        index: record.index,
        hash: content_hash(&data),
        length: data.len() as u64,
        generation: record.generation,
    };
    if acked.is_acked(info.index, info.generation, &info.hash) {
        return Ok(BlobChunk { info, uploaded: false });
    }

    put_chunk(&remote, &config, ChunkKey::new(vault.vault_id(), ChunkKind::Blob, record.index), data).await?;
    tracing::debug!(blob = record.index, "blob chunk acknowledged");
    Ok(BlobChunk { info, uploaded: true })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use pattern_keyvault::derive;
    use tempfile::tempdir;

    use crate::config::EngineConfig;
    use crate::import::{ImportItem, ImportPipeline};
    use crate::index::{MediaKind, Segment};
    use crate::vault::NewVault;

    const CELLS: &[u16] = &[0, 4, 8, 5];

    fn keys(config: &EngineConfig) -> KeyHandle {
        KeyHandle::new(derive(CELLS, 3, &config.kdf).unwrap())
    }

    fn data(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    /// Vault with one file spanning three blobs and one small file
    async fn populated_vault(root: &Path, config: &EngineConfig) -> Arc<VaultStore> {
        let (vault, _) = VaultStore::open_or_create(
            root,
            keys(config),
            config.blob_capacity,
            NewVault { grid_size: 3, auto_name: "A1-B2-C3-C2".into(), is_duress: false },
        )
        .unwrap();
        let vault = Arc::new(vault);
        let pipeline = ImportPipeline::new(Arc::clone(&vault), config);

        let big = pipeline
            .import_batch(vec![ImportItem::from_bytes("clip.mp4", MediaKind::Video, data(10 * 1024, 1))])
            .await;
        assert!(big[0].is_success());
        let small = pipeline
            .import_batch(vec![ImportItem::from_bytes("pic.jpg", MediaKind::Image, data(300, 2))])
            .await;
        assert!(small[0].is_success());
        vault
    }

    fn coordinator(remote: Arc<dyn RemoteStore>, host: Arc<dyn ExecutionHost>, config: &EngineConfig) -> BackupCoordinator {
        BackupCoordinator::new(remote, host, config.backup.clone())
    }

    /// Withdraws the host grant after `after` successful blob uploads
    struct ExpiringRemote {
        inner: Arc<InMemoryRemote>,
        host: Arc<ManualHost>,
        after: usize,
        blob_puts: AtomicUsize,
    }

    #[async_trait]
    impl RemoteStore for ExpiringRemote {
        fn id(&self) -> String {
            self.inner.id()
        }

        async fn put_chunk(&self, key: &ChunkKey, data: Vec<u8>) -> Result<(), BackupError> {
            self.inner.put_chunk(key, data).await?;
            if key.kind == ChunkKind::Blob && self.blob_puts.fetch_add(1, Ordering::SeqCst) + 1 == self.after {
                self.host.expire();
            }
            Ok(())
        }

        async fn get_chunk(&self, key: &ChunkKey) -> Result<Option<Vec<u8>>, BackupError> {
            self.inner.get_chunk(key).await
        }

        async fn list_chunks(&self, vault_id: &str, kind: ChunkKind, version: u32) -> Result<Vec<u32>, BackupError> {
            self.inner.list_chunks(vault_id, kind, version).await
        }

        async fn put_manifest(&self, manifest: &BackupManifest) -> Result<(), BackupError> {
            self.inner.put_manifest(manifest).await
        }

        async fn get_manifest(&self, vault_id: &str, kind: ChunkKind) -> Result<Option<BackupManifest>, BackupError> {
            self.inner.get_manifest(vault_id, kind).await
        }
    }

    /// Fails the first `failures` chunk puts with a retryable error
    struct FlakyRemote {
        inner: InMemoryRemote,
        failures: AtomicUsize,
    }

    #[async_trait]
    impl RemoteStore for FlakyRemote {
        fn id(&self) -> String {
            self.inner.id()
        }

        async fn put_chunk(&self, key: &ChunkKey, data: Vec<u8>) -> Result<(), BackupError> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(BackupError::Remote("connection reset".into()));
            }
            self.inner.put_chunk(key, data).await
        }

        async fn get_chunk(&self, key: &ChunkKey) -> Result<Option<Vec<u8>>, BackupError> {
            self.inner.get_chunk(key).await
        }

        async fn list_chunks(&self, vault_id: &str, kind: ChunkKind, version: u32) -> Result<Vec<u32>, BackupError> {
            self.inner.list_chunks(vault_id, kind, version).await
        }

        async fn put_manifest(&self, manifest: &BackupManifest) -> Result<(), BackupError> {
            self.inner.put_manifest(manifest).await
        }

        async fn get_manifest(&self, vault_id: &str, kind: ChunkKind) -> Result<Option<BackupManifest>, BackupError> {
            self.inner.get_manifest(vault_id, kind).await
        }
    }

    #[tokio::test]
    async fn test_backup_and_restore_elsewhere() {
        let dir = tempdir().unwrap();
        let config = EngineConfig::for_tests(dir.path().join("device-a"));
        let vault = populated_vault(&config.root, &config).await;
        let files = vault.list_files();

        let remote = Arc::new(InMemoryRemote::new());
        let backup = coordinator(remote.clone(), Arc::new(ForegroundHost::default()), &config);
        let report = backup.run(Arc::clone(&vault)).await.unwrap();
        assert_eq!(report.blobs_total, 3);
        assert_eq!(report.blobs_uploaded, 3);
        assert_eq!(backup.state(), BackupState::Complete);

        let other_root = dir.path().join("device-b");
        let restored = backup.restore(&other_root, &keys(&config)).await.unwrap();
        assert_eq!(restored.files, 2);

        let reopened = VaultStore::open(&other_root, keys(&config), config.blob_capacity).unwrap().unwrap();
        for file in files {
            assert_eq!(reopened.read_file(&file.id).unwrap(), vault.read_file(&file.id).unwrap());
        }
        assert_eq!(reopened.snapshot().metadata, vault.snapshot().metadata);
    }

    #[tokio::test]
    async fn test_restore_when_lower_blob_holds_no_files() {
        let dir = tempdir().unwrap();
        let config = EngineConfig::for_tests(dir.path().join("device-a"));
        let (vault, _) = VaultStore::open_or_create(
            &config.root,
            keys(&config),
            config.blob_capacity,
            NewVault { grid_size: 3, auto_name: "A1-B2-C3-C2".into(), is_duress: false },
        )
        .unwrap();
        let vault = Arc::new(vault);

        // An import that never commits fills blob 0, so the next file lands in blob 1
        let (held, _) = vault.blobs().allocate(config.blob_capacity).unwrap();
        let outcome = ImportPipeline::new(Arc::clone(&vault), &config)
            .import_batch(vec![ImportItem::from_bytes("pic.jpg", MediaKind::Image, data(300, 5))])
            .await;
        let entry = outcome[0].result.as_ref().unwrap().clone();
        assert_eq!(entry.segments[0].blob, 1);
        vault.blobs().release_pending(&[Segment { blob: held, offset: 0, length: config.blob_capacity }]);

        let remote = Arc::new(InMemoryRemote::new());
        let backup = coordinator(remote, Arc::new(ForegroundHost::default()), &config);
        let report = backup.run(Arc::clone(&vault)).await.unwrap();
        assert_eq!(report.blobs_total, 1);

        let other_root = dir.path().join("device-b");
        let restored = backup.restore(&other_root, &keys(&config)).await.unwrap();
        assert_eq!(restored.files, 1);
        let reopened = VaultStore::open(&other_root, keys(&config), config.blob_capacity).unwrap().unwrap();
        assert_eq!(reopened.read_file(&entry.id).unwrap(), data(300, 5));
    }

    #[tokio::test]
    async fn test_second_run_uploads_no_blob_again() {
        let dir = tempdir().unwrap();
        let config = EngineConfig::for_tests(dir.path());
        let vault = populated_vault(dir.path(), &config).await;

        let remote = Arc::new(InMemoryRemote::new());
        let backup = coordinator(remote.clone(), Arc::new(ForegroundHost::default()), &config);
        backup.run(Arc::clone(&vault)).await.unwrap();
        let chunks = remote.chunk_count();
        let puts = remote.chunk_puts();

        let second = backup.run(Arc::clone(&vault)).await.unwrap();
        assert_eq!(second.blobs_uploaded, 0);
        assert_eq!(second.blobs_skipped, 3);
        assert_eq!(remote.chunk_count(), chunks);
        assert_eq!(remote.chunk_puts(), puts + second.index_chunks);

        // The published pair is still a valid backup
        let target = tempdir().unwrap();
        backup.restore(target.path(), &keys(&config)).await.unwrap();
    }

    #[tokio::test]
    async fn test_interrupted_run_resumes_without_reupload() {
        let dir = tempdir().unwrap();
        let mut config = EngineConfig::for_tests(dir.path());
        config.backup.fan_out = 1;
        let vault = populated_vault(dir.path(), &config).await;

        let host = ManualHost::new();
        let memory = Arc::new(InMemoryRemote::new());
        let remote = Arc::new(ExpiringRemote {
            inner: memory.clone(),
            host: host.clone(),
            after: 2,
            blob_puts: AtomicUsize::new(0),
        });
        let backup = coordinator(remote, host.clone(), &config);

        let first = backup.run(Arc::clone(&vault)).await;
        assert!(matches!(first, Err(BackupError::Interrupted)));
        assert_eq!(backup.state(), BackupState::Failed(FailureReason::Interrupted));
        assert_eq!(host.active(), 0);
        assert_eq!(memory.chunk_puts(), 2);
        assert!(memory.get_manifest(vault.vault_id(), ChunkKind::Index).await.unwrap().is_none());

        let resumed = backup.run(Arc::clone(&vault)).await.unwrap();
        assert_eq!(resumed.blobs_skipped, 2);
        assert_eq!(resumed.blobs_uploaded, 1);
        assert_eq!(memory.list_chunks(vault.vault_id(), ChunkKind::Blob, 1).await.unwrap(), vec![0, 1, 2]);
        assert_eq!(host.ended(), 2);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let dir = tempdir().unwrap();
        let config = EngineConfig::for_tests(dir.path());
        let vault = populated_vault(dir.path(), &config).await;

        let remote = Arc::new(FlakyRemote {
            inner: InMemoryRemote::new(),
            failures: AtomicUsize::new(2),
        });
        let backup = coordinator(remote.clone(), Arc::new(ForegroundHost::default()), &config);
        backup.run(vault).await.unwrap();
        assert_eq!(remote.inner.chunk_count(), 4);
    }

    #[tokio::test]
    async fn test_restore_rejects_missing_chunk() {
        let dir = tempdir().unwrap();
        let config = EngineConfig::for_tests(dir.path().join("a"));
        let vault = populated_vault(&config.root, &config).await;

        let remote = Arc::new(InMemoryRemote::new());
        let backup = coordinator(remote.clone(), Arc::new(ForegroundHost::default()), &config);
        backup.run(Arc::clone(&vault)).await.unwrap();
        assert!(remote.remove_chunk(&ChunkKey::new(vault.vault_id(), ChunkKind::Blob, 1)));

        let target = dir.path().join("b");
        match backup.restore(&target, &keys(&config)).await {
            Err(RestoreError::MissingChunk { kind, index }) => {
                assert_eq!(kind, "blob");
                assert_eq!(index, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!crate::vault::vault_dir(&target, vault.vault_id()).exists());
    }

    #[tokio::test]
    async fn test_restore_rejects_hash_mismatch_and_keeps_local_state() {
        let dir = tempdir().unwrap();
        let config = EngineConfig::for_tests(dir.path());
        let vault = populated_vault(dir.path(), &config).await;
        let vault_id = vault.vault_id().to_string();
        let files = vault.list_files();

        let remote = Arc::new(InMemoryRemote::new());
        let backup = coordinator(remote.clone(), Arc::new(ForegroundHost::default()), &config);
        backup.run(Arc::clone(&vault)).await.unwrap();
        drop(vault);

        assert!(remote.corrupt_chunk(&ChunkKey::new(&vault_id, ChunkKind::Blob, 0)));
        assert!(matches!(
            backup.restore(dir.path(), &keys(&config)).await,
            Err(RestoreError::HashMismatch { .. })
        ));

        let local = VaultStore::open(dir.path(), keys(&config), config.blob_capacity).unwrap().unwrap();
        assert_eq!(local.list_files().len(), files.len());
    }

    #[tokio::test]
    async fn test_restore_replaces_local_vault() {
        let dir = tempdir().unwrap();
        let config = EngineConfig::for_tests(dir.path());
        let vault = populated_vault(dir.path(), &config).await;
        let victim = vault.list_files()[0].clone();

        let remote = Arc::new(InMemoryRemote::new());
        let backup = coordinator(remote, Arc::new(ForegroundHost::default()), &config);
        backup.run(Arc::clone(&vault)).await.unwrap();

        vault.remove_file(&victim.id).unwrap();
        drop(vault);

        backup.restore(dir.path(), &keys(&config)).await.unwrap();
        let local = VaultStore::open(dir.path(), keys(&config), config.blob_capacity).unwrap().unwrap();
        assert_eq!(local.read_file(&victim.id).unwrap().len() as u64, victim.size);
    }

    #[tokio::test]
    async fn test_unknown_vault_has_no_manifest() {
        let dir = tempdir().unwrap();
        let config = EngineConfig::for_tests(dir.path());
        let backup = coordinator(Arc::new(InMemoryRemote::new()), Arc::new(ForegroundHost::default()), &config);

        assert!(matches!(
            backup.restore(dir.path(), &keys(&config)).await,
            Err(RestoreError::ManifestNotFound)
        ));
    }

    #[tokio::test]
    async fn test_disabled_and_locked_vaults_do_not_upload() {
        let dir = tempdir().unwrap();
        let config = EngineConfig::for_tests(dir.path());
        let vault = populated_vault(dir.path(), &config).await;
        let remote = Arc::new(InMemoryRemote::new());
        let backup = coordinator(remote.clone(), Arc::new(ForegroundHost::default()), &config);

        vault.index().set_backup_enabled(false).unwrap();
        assert!(matches!(backup.run(Arc::clone(&vault)).await, Err(BackupError::Disabled)));
        assert_eq!(backup.state(), BackupState::Idle);

        vault.index().set_backup_enabled(true).unwrap();
        vault.keys().revoke();
        assert!(matches!(
            backup.run(Arc::clone(&vault)).await,
            Err(BackupError::Storage(StorageError::KeyRevoked))
        ));
        assert_eq!(remote.chunk_puts(), 0);
    }
}
