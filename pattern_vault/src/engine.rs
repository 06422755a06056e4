//! Pattern Vault - Engine
//!
//! Owns the unlocked vault, if any. Every vault operation goes through the
//! active session; `lock()` revokes its keys so work still holding the old
//! handle fails at its next key use.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use pattern_keyvault::{derive_key_set, derive_pattern_key, DerivationError, KdfParams, KeyHandle, KeySet, Pattern};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::backup::{BackupCoordinator, BackupReport, RestoreReport};
use crate::blob_store::CompactionReport;
use crate::config::{EngineConfig, LatencyFloor};
use crate::duress::{self, DuressEntry, Resolution};
use crate::error::{StorageError, VaultError, VaultResult};
use crate::import::{ImportItem, ImportOutcome, ImportPipeline};
use crate::index::FileEntry;
use crate::vault::{vault_dir, NewVault, VaultStats, VaultStore, VAULTS_DIR};

/// Result of one unlock attempt
#[derive(Debug)]
pub enum UnlockOutcome {
    Unlocked {
        vault_id: String,
        /// A decoy opened; callers must not treat it differently
        duress: bool,
        created: bool,
    },
    Failed(DerivationError),
}

impl UnlockOutcome {
    pub fn is_unlocked(&self) -> bool {
        matches!(self, UnlockOutcome::Unlocked { .. })
    }
}

fn derive_keys(pattern: &Pattern, params: &KdfParams) -> Result<KeySet, DerivationError> {
    let master = derive_pattern_key(pattern, params)?;
    derive_key_set(&master)
}

fn join_error(e: tokio::task::JoinError) -> VaultError {
    StorageError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())).into()
}

/// Derive, resolve and open the vault a pattern belongs to
fn open_for_pattern(
    config: &EngineConfig,
    cells: Vec<u16>,
    grid: u8,
) -> VaultResult<Result<(VaultStore, bool), DerivationError>> {
    let pattern = match Pattern::new(cells, grid) {
        Ok(pattern) => pattern,
        Err(e) => return Ok(Err(e)),
    };
    let keys = match derive_keys(&pattern, &config.kdf) {
        Ok(keys) => KeyHandle::new(keys),
        Err(e) => return Ok(Err(e)),
    };

    let opened = match duress::resolve(&config.root, &keys)? {
        Resolution::Duress(_) => (
            duress::trigger_duress(&config.root, keys, config.blob_capacity, &pattern)?,
            false,
        ),
        Resolution::Real(_) => VaultStore::open_or_create(
            &config.root,
            keys,
            config.blob_capacity,
            NewVault {
                grid_size: grid,
                auto_name: pattern.grid_letters(),
                is_duress: false,
            },
        )?,
    };
    Ok(Ok(opened))
}

/// Vault engine - explicitly constructed, no global state
pub struct Engine {
    config: EngineConfig,
    session: RwLock<Option<Arc<VaultStore>>>,
    /// Bumped by every `lock()`, under the session write lock
    lock_epoch: AtomicU64,
    /// One unlock or restore at a time
    unlock_gate: tokio::sync::Mutex<()>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> VaultResult<Self> {
        config.validate()?;
        std::fs::create_dir_all(config.root.join(VAULTS_DIR))?;
        Ok(Self {
            config,
            session: RwLock::new(None),
            lock_epoch: AtomicU64::new(0),
            unlock_gate: tokio::sync::Mutex::new(()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ═══════════════════════════════════════════════════════════════════════
    // LOCK CONTRACT
    // ═══════════════════════════════════════════════════════════════════════

    /// Try to unlock with a pattern. Any open vault is locked first.
    ///
    /// Every attempt takes at least the latency floor, whatever its outcome.
    /// A `lock()` that lands while the attempt is in flight wins: the opened
    /// vault is revoked and `VaultLocked` is returned.
    pub async fn unlock(&self, cells: &[u16], grid: u8) -> VaultResult<UnlockOutcome> {
        let _gate = self.unlock_gate.lock().await;
        let started = Instant::now();
        let floor = LatencyFloor::current().draw();
        self.lock();
        let epoch = self.lock_epoch.load(Ordering::SeqCst);

        let config = self.config.clone();
        let cells = cells.to_vec();
        let result = tokio::task::spawn_blocking(move || open_for_pattern(&config, cells, grid))
            .await
            .map_err(join_error);

        let elapsed = started.elapsed();
        if elapsed < floor {
            tokio::time::sleep(floor - elapsed).await;
        }

        let (vault, created) = match result?? {
            Ok(opened) => opened,
            Err(e) => {
                tracing::info!("unlock failed");
                return Ok(UnlockOutcome::Failed(e));
            }
        };
        vault.index().touch()?;

        let outcome = UnlockOutcome::Unlocked {
            vault_id: vault.vault_id().to_string(),
            duress: vault.is_duress(),
            created,
        };
        let mut session = self.session.write();
        if self.lock_epoch.load(Ordering::SeqCst) != epoch {
            drop(session);
            vault.keys().revoke();
            tracing::info!("locked during unlock, discarding session");
            return Err(VaultError::VaultLocked);
        }
        *session = Some(Arc::new(vault));
        drop(session);
        tracing::info!(created, "vault unlocked");
        Ok(outcome)
    }

    /// Revoke the active keys. Safe to call in any state.
    pub fn lock(&self) {
        let mut session = self.session.write();
        self.lock_epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(vault) = session.take() {
            vault.keys().revoke();
            tracing::info!("vault locked");
        }
    }

    pub fn is_locked(&self) -> bool {
        self.session.read().is_none()
    }

    pub fn on_foreground_lost(&self) {
        tracing::debug!("foreground lost");
        self.lock();
    }

    pub fn on_screen_captured(&self) {
        tracing::warn!("screen capture detected");
        self.lock();
    }

    /// The unlocked vault
    pub fn vault(&self) -> VaultResult<Arc<VaultStore>> {
        match self.session.read().as_ref() {
            Some(vault) if !vault.keys().is_revoked() => Ok(Arc::clone(vault)),
            _ => Err(VaultError::VaultLocked),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // FILES
    // ═══════════════════════════════════════════════════════════════════════

    /// Pipeline bound to the unlocked vault, for callers watching progress
    pub fn import_pipeline(&self) -> VaultResult<ImportPipeline> {
        Ok(ImportPipeline::new(self.vault()?, &self.config))
    }

    pub async fn import(&self, items: Vec<ImportItem>) -> VaultResult<Vec<ImportOutcome>> {
        Ok(self.import_pipeline()?.import_batch(items).await)
    }

    pub fn list_files(&self) -> VaultResult<Vec<FileEntry>> {
        Ok(self.vault()?.list_files())
    }

    pub fn get_file(&self, id: &Uuid) -> VaultResult<FileEntry> {
        self.vault()?.get_file(id)
    }

    pub fn read_file(&self, id: &Uuid) -> VaultResult<Vec<u8>> {
        self.vault()?.read_file(id)
    }

    /// Decrypt a file to `out`. A partial output is removed on failure.
    pub fn export_file(&self, id: &Uuid, out: &Path) -> VaultResult<u64> {
        let vault = self.vault()?;
        let mut file = std::io::BufWriter::new(std::fs::File::create(out)?);
        let written = vault.export_file(id, &mut file).and_then(|n| {
            std::io::Write::flush(&mut file)?;
            Ok(n)
        });
        if written.is_err() {
            drop(file);
            let _ = std::fs::remove_file(out);
        }
        written
    }

    pub fn remove_file(&self, id: &Uuid) -> VaultResult<FileEntry> {
        self.vault()?.remove_file(id)
    }

    /// Set a custom vault name; `None` or blank restores the pattern name
    pub fn rename(&self, name: Option<String>) -> VaultResult<String> {
        let doc = self.vault()?.index().rename(name)?;
        Ok(doc.metadata.display_name().to_string())
    }

    pub fn stats(&self) -> VaultResult<VaultStats> {
        self.vault()?.stats()
    }

    pub fn set_backup_enabled(&self, enabled: bool) -> VaultResult<()> {
        self.vault()?.index().set_backup_enabled(enabled)?;
        Ok(())
    }

    pub fn set_recovery_phrase_enabled(&self, enabled: bool) -> VaultResult<()> {
        self.vault()?.index().set_recovery_phrase_enabled(enabled)?;
        Ok(())
    }

    pub fn compact(&self, cancel: &CancellationToken) -> VaultResult<CompactionReport> {
        Ok(self.vault()?.compact(self.config.compaction_threshold, cancel)?)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // DURESS
    // ═══════════════════════════════════════════════════════════════════════

    /// Register a duress pattern for the unlocked real vault
    pub async fn register_duress(&self, cells: &[u16], grid: u8) -> VaultResult<DuressEntry> {
        let real = self.vault()?;
        let config = self.config.clone();
        let cells = cells.to_vec();

        tokio::task::spawn_blocking(move || {
            let pattern = Pattern::new(cells, grid)?;
            let keys = KeyHandle::new(derive_keys(&pattern, &config.kdf)?);
            let entry = duress::register_duress(&config.root, &real, keys.clone(), config.blob_capacity, &pattern);
            // The decoy stays closed until its pattern is drawn
            keys.revoke();
            entry
        })
        .await
        .map_err(join_error)?
    }

    pub fn list_duress(&self) -> VaultResult<Vec<DuressEntry>> {
        let real = self.vault()?;
        duress::list_duress(&real)
    }

    pub fn remove_duress(&self, decoy_id: &str) -> VaultResult<()> {
        let real = self.vault()?;
        duress::remove_duress(&self.config.root, &real, decoy_id)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // BACKUP
    // ═══════════════════════════════════════════════════════════════════════

    pub async fn backup(&self, coordinator: &BackupCoordinator) -> VaultResult<BackupReport> {
        Ok(coordinator.run(self.vault()?).await?)
    }

    /// Restore the vault a pattern opens from its backup. Locks first; unlock
    /// again afterwards to use the restored vault.
    pub async fn restore(&self, coordinator: &BackupCoordinator, cells: &[u16], grid: u8) -> VaultResult<RestoreReport> {
        let _gate = self.unlock_gate.lock().await;
        self.lock();

        let params = self.config.kdf;
        let cells = cells.to_vec();
        let keys = tokio::task::spawn_blocking(move || {
            let pattern = Pattern::new(cells, grid)?;
            derive_keys(&pattern, &params)
        })
        .await
        .map_err(join_error)??;
        let keys = KeyHandle::new(keys);

        let report = coordinator.restore(&self.config.root, &keys).await;
        keys.revoke();
        Ok(report?)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // WIPE
    // ═══════════════════════════════════════════════════════════════════════

    /// Delete the unlocked vault, and for a real vault its decoys, then lock
    pub fn wipe(&self) -> VaultResult<()> {
        let vault = self.vault()?;
        let mut dirs = vec![vault.dir().to_path_buf()];
        if !vault.is_duress() {
            for entry in duress::list_duress(vault.as_ref())? {
                dirs.push(vault_dir(&self.config.root, &entry.decoy_id));
            }
        }
        drop(vault);
        self.lock();

        for dir in &dirs {
            if dir.exists() {
                std::fs::remove_dir_all(dir)?;
            }
        }
        tracing::warn!(vaults = dirs.len(), "vault wiped");
        Ok(())
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.lock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use tempfile::tempdir;

    use crate::backup::{ForegroundHost, InMemoryRemote};
    use crate::index::MediaKind;

    const REAL: &[u16] = &[0, 1, 2, 5, 8];
    const DURESS: &[u16] = &[6, 4, 2];

    fn engine(root: &Path) -> Engine {
        Engine::new(EngineConfig::for_tests(root)).unwrap()
    }

    async fn import_one(engine: &Engine, name: &str, bytes: Vec<u8>) -> FileEntry {
        let mut outcomes = engine
            .import(vec![ImportItem::from_bytes(name, MediaKind::Image, bytes)])
            .await
            .unwrap();
        outcomes.remove(0).result.unwrap()
    }

    #[tokio::test]
    async fn test_unlock_creates_then_reopens() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path());
        assert!(engine.is_locked());

        let started = Instant::now();
        let first = engine.unlock(REAL, 3).await.unwrap();
        assert!(started.elapsed() >= LatencyFloor::TEST.min);
        let UnlockOutcome::Unlocked { vault_id, duress, created } = first else {
            panic!("expected unlock");
        };
        assert!(!duress);
        assert!(created);
        assert_eq!(engine.stats().unwrap().display_name, "A1-B1-C1-C2-C3");

        engine.lock();
        match engine.unlock(REAL, 3).await.unwrap() {
            UnlockOutcome::Unlocked { vault_id: again, created, .. } => {
                assert_eq!(again, vault_id);
                assert!(!created);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_malformed_pattern_fails_and_stays_locked() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path());

        let started = Instant::now();
        let outcome = engine.unlock(&[0, 9], 3).await.unwrap();
        assert!(started.elapsed() >= LatencyFloor::TEST.min);
        assert!(matches!(
            outcome,
            UnlockOutcome::Failed(DerivationError::CellOutOfRange { .. })
        ));
        assert!(engine.is_locked());
        assert!(matches!(engine.unlock(&[], 3).await.unwrap(), UnlockOutcome::Failed(_)));
        assert!(matches!(engine.list_files(), Err(VaultError::VaultLocked)));
    }

    #[tokio::test]
    async fn test_lock_revokes_outstanding_handles() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path());
        engine.unlock(REAL, 3).await.unwrap();
        let entry = import_one(&engine, "a.jpg", vec![9u8; 2000]).await;

        let held = engine.vault().unwrap();
        assert_eq!(held.read_file(&entry.id).unwrap().len(), 2000);

        engine.lock();
        engine.lock();
        assert!(held.keys().is_revoked());
        assert!(matches!(held.read_file(&entry.id), Err(VaultError::VaultLocked)));
        assert!(matches!(engine.read_file(&entry.id), Err(VaultError::VaultLocked)));
    }

    #[tokio::test]
    async fn test_lock_during_unlock_stays_locked() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path());
        engine.unlock(REAL, 3).await.unwrap();
        engine.lock();

        let (outcome, ()) = tokio::join!(engine.unlock(REAL, 3), async {
            tokio::time::sleep(std::time::Duration::from_millis(2)).await;
            engine.lock();
        });
        assert!(matches!(outcome, Err(VaultError::VaultLocked)));
        assert!(engine.is_locked());
        assert!(matches!(engine.list_files(), Err(VaultError::VaultLocked)));

        assert!(engine.unlock(REAL, 3).await.unwrap().is_unlocked());
        assert!(!engine.is_locked());
    }

    #[tokio::test]
    async fn test_concurrent_unlocks_are_serialized() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path());

        let (a, b) = tokio::join!(engine.unlock(REAL, 3), engine.unlock(REAL, 3));
        let created: Vec<bool> = [a.unwrap(), b.unwrap()]
            .into_iter()
            .map(|outcome| match outcome {
                UnlockOutcome::Unlocked { created, .. } => created,
                other => panic!("unexpected {:?}", other),
            })
            .collect();
        assert_eq!(created, vec![true, false]);

        let vaults = std::fs::read_dir(dir.path().join(VAULTS_DIR))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| !e.file_name().to_string_lossy().starts_with('.'))
            .count();
        assert_eq!(vaults, 1);

        let entry = import_one(&engine, "d.jpg", vec![4u8; 800]).await;
        assert_eq!(engine.read_file(&entry.id).unwrap(), vec![4u8; 800]);
    }

    #[tokio::test]
    async fn test_lifecycle_events_lock() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path());

        engine.unlock(REAL, 3).await.unwrap();
        engine.on_foreground_lost();
        assert!(engine.is_locked());

        engine.unlock(REAL, 3).await.unwrap();
        engine.on_screen_captured();
        assert!(engine.is_locked());
    }

    #[tokio::test]
    async fn test_duress_vault_is_disjoint() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path());

        engine.unlock(REAL, 3).await.unwrap();
        let real_file = import_one(&engine, "real.jpg", vec![1u8; 500]).await;
        let entry = engine.register_duress(DURESS, 3).await.unwrap();
        assert_eq!(engine.list_duress().unwrap(), vec![entry.clone()]);
        assert!(matches!(
            engine.register_duress(REAL, 3).await,
            Err(VaultError::DuressConflict(_))
        ));
        engine.lock();

        match engine.unlock(DURESS, 3).await.unwrap() {
            UnlockOutcome::Unlocked { vault_id, duress, .. } => {
                assert!(duress);
                assert_eq!(vault_id, entry.decoy_id);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(engine.list_files().unwrap().is_empty());
        assert!(matches!(engine.list_duress(), Err(VaultError::NotRealVault)));
        let decoy_file = import_one(&engine, "decoy.jpg", vec![2u8; 500]).await;
        engine.lock();

        engine.unlock(REAL, 3).await.unwrap();
        let real_ids: HashSet<Uuid> = engine.list_files().unwrap().iter().map(|f| f.id).collect();
        assert!(real_ids.contains(&real_file.id));
        assert!(!real_ids.contains(&decoy_file.id));

        engine.remove_duress(&entry.decoy_id).unwrap();
        assert!(engine.list_duress().unwrap().is_empty());
        assert!(!vault_dir(dir.path(), &entry.decoy_id).exists());
    }

    #[tokio::test]
    async fn test_export_writes_plaintext() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path());
        engine.unlock(REAL, 3).await.unwrap();
        let bytes: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
        let entry = import_one(&engine, "b.png", bytes.clone()).await;

        let out = dir.path().join("out.png");
        assert_eq!(engine.export_file(&entry.id, &out).unwrap(), 3000);
        assert_eq!(std::fs::read(&out).unwrap(), bytes);

        let missing = dir.path().join("missing.png");
        assert!(matches!(
            engine.export_file(&Uuid::new_v4(), &missing),
            Err(VaultError::FileNotFound(_))
        ));
        assert!(!missing.exists());
    }

    #[tokio::test]
    async fn test_backup_then_restore_through_engine() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path());
        engine.unlock(REAL, 3).await.unwrap();
        let entry = import_one(&engine, "c.jpg", vec![7u8; 1500]).await;

        let coordinator = BackupCoordinator::new(
            Arc::new(InMemoryRemote::new()),
            Arc::new(ForegroundHost::default()),
            engine.config().backup.clone(),
        );
        engine.backup(&coordinator).await.unwrap();
        engine.remove_file(&entry.id).unwrap();

        let report = engine.restore(&coordinator, REAL, 3).await.unwrap();
        assert!(engine.is_locked());
        assert_eq!(report.files, 1);

        engine.unlock(REAL, 3).await.unwrap();
        assert_eq!(engine.read_file(&entry.id).unwrap(), vec![7u8; 1500]);
    }

    #[tokio::test]
    async fn test_wipe_removes_vault_and_decoys() {
        let dir = tempdir().unwrap();
        let engine = engine(dir.path());
        engine.unlock(REAL, 3).await.unwrap();
        let real_dir = engine.vault().unwrap().dir().to_path_buf();
        let decoy = engine.register_duress(DURESS, 3).await.unwrap();

        engine.wipe().unwrap();
        assert!(engine.is_locked());
        assert!(!real_dir.exists());
        assert!(!vault_dir(dir.path(), &decoy.decoy_id).exists());
    }
}
