//! Pattern Vault - Duress Resolver
//!
//! A duress pattern opens a decoy vault instead of the real one. The list of
//! decoys lives in the real vault, sealed with its duress key; each decoy's
//! own index is flagged so the decoy key alone is enough to recognize it.

use std::path::Path;

use chrono::{DateTime, Utc};
use pattern_keyvault::{KeyHandle, Pattern};
use serde::{Deserialize, Serialize};

use crate::crypto::{open_document, seal_document};
use crate::error::{StorageError, VaultError, VaultResult};
use crate::index;
use crate::secure_fs::SecureFs;
use crate::vault::{vault_dir, NewVault, VaultStore};

/// Duress map file inside a real vault directory
pub const DURESS_FILE: &str = "duress.enc";

const DURESS_MAGIC: &[u8; 4] = b"PVDM";
const DURESS_FORMAT_VERSION: u8 = 1;

/// Which vault a key opens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// The real vault (possibly not created yet)
    Real(String),
    /// A decoy provisioned by a duress registration
    Duress(String),
}

impl Resolution {
    pub fn vault_id(&self) -> &str {
        match self {
            Resolution::Real(id) | Resolution::Duress(id) => id,
        }
    }

    pub fn is_duress(&self) -> bool {
        matches!(self, Resolution::Duress(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuressEntry {
    pub decoy_id: String,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuressMap {
    pub entries: Vec<DuressEntry>,
}

impl DuressMap {
    /// Load the map of a real vault; empty if none was ever written
    pub fn load(fs: &SecureFs, keys: &KeyHandle) -> Result<Self, StorageError> {
        fs.discard_wal(DURESS_FILE)?;
        let Some(data) = fs.read_optional(DURESS_FILE)? else {
            return Ok(Self::default());
        };
        let json = keys.with_keys(|k| open_document(k.duress_key(), DURESS_MAGIC, DURESS_FORMAT_VERSION, &data))??;
        Ok(serde_json::from_slice(&json)?)
    }

    pub fn save(&self, fs: &SecureFs, keys: &KeyHandle) -> Result<(), StorageError> {
        let json = serde_json::to_vec(self)?;
        let sealed = keys.with_keys(|k| seal_document(k.duress_key(), DURESS_MAGIC, DURESS_FORMAT_VERSION, &json))??;
        fs.write_atomic(DURESS_FILE, &sealed)
    }

    pub fn contains(&self, decoy_id: &str) -> bool {
        self.entries.iter().any(|e| e.decoy_id == decoy_id)
    }
}

/// Decide which vault `keys` opens.
///
/// A key whose index exists and is flagged as duress is a decoy; everything
/// else, including keys never seen before, resolves to a real vault.
pub fn resolve(root: &Path, keys: &KeyHandle) -> Result<Resolution, StorageError> {
    let fs = SecureFs::new(&vault_dir(root, keys.vault_id()));
    let id = keys.vault_id().to_string();

    match index::load(&fs, keys)? {
        Some(doc) if doc.metadata.is_duress => Ok(Resolution::Duress(id)),
        _ => Ok(Resolution::Real(id)),
    }
}

/// Open the decoy for a duress key, provisioning an empty one if missing
pub fn trigger_duress(
    root: &Path,
    keys: KeyHandle,
    blob_capacity: u64,
    pattern: &Pattern,
) -> Result<VaultStore, StorageError> {
    let (decoy, created) = VaultStore::open_or_create(
        root,
        keys,
        blob_capacity,
        NewVault {
            grid_size: pattern.grid_size(),
            auto_name: pattern.grid_letters(),
            is_duress: true,
        },
    )?;
    if created {
        tracing::info!("decoy vault provisioned");
    }
    Ok(decoy)
}

/// Register a duress pattern for `real` and provision its decoy
pub fn register_duress(
    root: &Path,
    real: &VaultStore,
    decoy_keys: KeyHandle,
    blob_capacity: u64,
    pattern: &Pattern,
) -> VaultResult<DuressEntry> {
    if real.is_duress() {
        return Err(VaultError::NotRealVault);
    }
    let decoy_id = decoy_keys.vault_id().to_string();
    if decoy_id == real.vault_id() {
        return Err(VaultError::DuressConflict("same as the unlock pattern".into()));
    }
    if let Resolution::Real(_) = resolve(root, &decoy_keys)? {
        if vault_dir(root, &decoy_id).join(index::INDEX_FILE).exists() {
            return Err(VaultError::DuressConflict("pattern already opens a real vault".into()));
        }
    }

    let mut map = DuressMap::load(real.fs(), real.keys())?;
    if let Some(existing) = map.entries.iter().find(|e| e.decoy_id == decoy_id) {
        return Ok(existing.clone());
    }

    trigger_duress(root, decoy_keys, blob_capacity, pattern)?;
    let entry = DuressEntry {
        decoy_id,
        registered_at: Utc::now(),
    };
    map.entries.push(entry.clone());
    map.save(real.fs(), real.keys())?;

    tracing::info!(decoys = map.entries.len(), "duress pattern registered");
    Ok(entry)
}

pub fn list_duress(real: &VaultStore) -> VaultResult<Vec<DuressEntry>> {
    if real.is_duress() {
        return Err(VaultError::NotRealVault);
    }
    Ok(DuressMap::load(real.fs(), real.keys())?.entries)
}

/// Forget a duress registration and wipe its decoy
pub fn remove_duress(root: &Path, real: &VaultStore, decoy_id: &str) -> VaultResult<()> {
    if real.is_duress() {
        return Err(VaultError::NotRealVault);
    }
    let mut map = DuressMap::load(real.fs(), real.keys())?;
    if !map.contains(decoy_id) {
        return Err(VaultError::DuressNotFound(decoy_id.to_string()));
    }

    map.entries.retain(|e| e.decoy_id != decoy_id);
    map.save(real.fs(), real.keys())?;

    let dir = vault_dir(root, decoy_id);
    if dir.exists() {
        std::fs::remove_dir_all(&dir)?;
    }
    tracing::info!(decoys = map.entries.len(), "duress pattern removed");
    Ok(())
}
