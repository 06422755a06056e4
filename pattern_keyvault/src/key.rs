//! Vault keys and revocable key handles
//!
//! A [`KeySet`] holds every key derived for one vault. It lives inside a
//! [`KeyHandle`] slot shared by the engine and any in-flight operation. Locking
//! revokes the slot: the keys are dropped (and zeroized) under the write lock,
//! so a holder of an old handle gets [`KeyError::Revoked`] on its next use and
//! never sees zeroed material.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use secrecy::{ExposeSecret, SecretBox};

use crate::error::KeyError;

/// Key length (AES-256 / XChaCha20)
pub const KEY_LEN: usize = 32;

/// 256-bit key, zeroized on drop
pub struct VaultKey {
    inner: SecretBox<[u8; KEY_LEN]>,
}

impl VaultKey {
    pub fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self {
            inner: SecretBox::new(Box::new(bytes)),
        }
    }

    /// Expose the key bytes (use with caution)
    pub fn expose(&self) -> &[u8; KEY_LEN] {
        self.inner.expose_secret()
    }
}

impl fmt::Debug for VaultKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("VaultKey(<redacted>)")
    }
}

/// Every key a vault needs, derived from one pattern key
pub struct KeySet {
    vault_id: String,
    index_key: VaultKey,
    blob_key: VaultKey,
    duress_key: VaultKey,
}

impl KeySet {
    pub(crate) fn new(vault_id: String, index_key: VaultKey, blob_key: VaultKey, duress_key: VaultKey) -> Self {
        Self {
            vault_id,
            index_key,
            blob_key,
            duress_key,
        }
    }

    /// Non-reversible vault identifier (hex); safe to use as a directory name
    pub fn vault_id(&self) -> &str {
        &self.vault_id
    }

    /// Key sealing the index document and backup checkpoint
    pub fn index_key(&self) -> &VaultKey {
        &self.index_key
    }

    /// Key for per-window file encryption
    pub fn blob_key(&self) -> &VaultKey {
        &self.blob_key
    }

    /// Key sealing the duress map of a real vault
    pub fn duress_key(&self) -> &VaultKey {
        &self.duress_key
    }
}

impl fmt::Debug for KeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySet")
            .field("vault_id", &self.vault_id)
            .finish_non_exhaustive()
    }
}

struct KeySlot {
    vault_id: String,
    keys: RwLock<Option<KeySet>>,
}

/// Shared, revocable reference to the active key set.
///
/// Cloning is cheap; all clones see the same slot.
#[derive(Clone)]
pub struct KeyHandle {
    slot: Arc<KeySlot>,
}

impl KeyHandle {
    pub fn new(keys: KeySet) -> Self {
        Self {
            slot: Arc::new(KeySlot {
                vault_id: keys.vault_id.clone(),
                keys: RwLock::new(Some(keys)),
            }),
        }
    }

    /// Identifier of the vault this handle opens. Still available after revoke.
    pub fn vault_id(&self) -> &str {
        &self.slot.vault_id
    }

    /// Run `f` with the live keys.
    ///
    /// Holds the read lock for the duration of `f`, so keep `f` short (one
    /// window, one document). `revoke` waits for it to finish.
    pub fn with_keys<T>(&self, f: impl FnOnce(&KeySet) -> T) -> Result<T, KeyError> {
        let guard = self.slot.keys.read();
        match guard.as_ref() {
            Some(keys) => Ok(f(keys)),
            None => Err(KeyError::Revoked),
        }
    }

    /// Zeroize and drop the keys. Idempotent; returns whether keys were live.
    pub fn revoke(&self) -> bool {
        let taken = self.slot.keys.write().take();
        let was_live = taken.is_some();
        // SecretBox zeroizes on drop
        drop(taken);
        if was_live {
            tracing::debug!("key slot revoked");
        }
        was_live
    }

    pub fn is_revoked(&self) -> bool {
        self.slot.keys.read().is_none()
    }
}

impl fmt::Debug for KeyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyHandle")
            .field("vault_id", &self.slot.vault_id)
            .field("revoked", &self.is_revoked())
            .finish()
    }
}
