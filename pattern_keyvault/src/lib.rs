//! # Pattern Keyvault
//!
//! Key layer for Pattern Vault. Turns a drawn gesture pattern into a vault key
//! and keeps that key in memory that can be wiped on demand.
//!
//! ## Capabilities
//! - Pattern validation (grid bounds, empty patterns)
//! - Argon2id pattern KDF with an application pepper (no stored secret)
//! - HKDF-SHA256 sub-keys: index, blob, duress map, vault identifier
//! - Revocable [`KeyHandle`]: `revoke()` zeroizes the keys for every holder

pub mod error;
pub mod pattern;
pub mod crypto;
pub mod key;

// Re-exports
pub use error::{DerivationError, KeyError};
pub use pattern::{Pattern, MIN_GRID_SIZE, MAX_GRID_SIZE};
pub use crypto::{derive_pattern_key, derive_key_set, KdfParams};
pub use key::{KeyHandle, KeySet, VaultKey, KEY_LEN};

/// Library version
pub const VERSION: &str = "1.0.0";

/// Derive the key set for a pattern in one step.
///
/// Deterministic: the same cells and grid size always produce the same keys.
pub fn derive(cells: &[u16], grid_size: u8, params: &KdfParams) -> Result<KeySet, DerivationError> {
    let pattern = Pattern::new(cells.to_vec(), grid_size)?;
    let master = derive_pattern_key(&pattern, params)?;
    derive_key_set(&master)
}
