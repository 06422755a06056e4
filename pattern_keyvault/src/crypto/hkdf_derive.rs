//! HKDF sub-keys of the pattern key

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::error::DerivationError;
use crate::key::{KeySet, VaultKey, KEY_LEN};

/// HKDF info labels
pub mod purposes {
    pub const INDEX: &str = "pattern-vault:index:v1";
    pub const BLOB: &str = "pattern-vault:blob:v1";
    pub const DURESS: &str = "pattern-vault:duress:v1";
    pub const VAULT_ID: &str = "pattern-vault:vault-id:v1";
}

const HKDF_SALT: &[u8] = b"pattern-vault/hkdf/v1";

/// Length of the vault identifier before hex encoding
const VAULT_ID_LEN: usize = 16;

fn expand_key(hk: &Hkdf<Sha256>, purpose: &str) -> Result<VaultKey, DerivationError> {
    let mut okm = [0u8; KEY_LEN];
    hk.expand(purpose.as_bytes(), &mut okm)
        .map_err(|e| DerivationError::Kdf(e.to_string()))?;
    let key = VaultKey::new(okm);
    okm.zeroize();
    Ok(key)
}

/// Derive the full key set (and vault id) from a pattern key
pub fn derive_key_set(master: &VaultKey) -> Result<KeySet, DerivationError> {
    let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), master.expose());

    let mut id = [0u8; VAULT_ID_LEN];
    hk.expand(purposes::VAULT_ID.as_bytes(), &mut id)
        .map_err(|e| DerivationError::Kdf(e.to_string()))?;
    let vault_id = hex::encode(id);

    Ok(KeySet::new(
        vault_id,
        expand_key(&hk, purposes::INDEX)?,
        expand_key(&hk, purposes::BLOB)?,
        expand_key(&hk, purposes::DURESS)?,
    ))
}
