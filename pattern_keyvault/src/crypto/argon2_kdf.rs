//! Argon2id KDF deriving the vault key from a drawn pattern

use argon2::{Algorithm, Argon2, Params, Version};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::error::DerivationError;
use crate::key::{VaultKey, KEY_LEN};
use crate::pattern::Pattern;

/// Application pepper, passed to Argon2 as its secret input
const PEPPER: &[u8] = b"PATTERN_VAULT_v1_PEPPER";

/// Salt domain; the grid size is appended so equal cell lists on different grids diverge
const SALT_DOMAIN: &[u8] = b"pattern-vault/salt/v1";

/// Argon2id cost parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory in KiB
    pub memory_cost_kib: u32,
    /// Iterations
    pub time_cost: u32,
    /// Lanes
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::interactive()
    }
}

impl KdfParams {
    /// Default for unlock on phones and desktops
    pub fn interactive() -> Self {
        Self {
            memory_cost_kib: 64 * 1024, // 64 MiB
            time_cost: 3,
            parallelism: 1,
        }
    }

    /// Weak devices
    pub fn low_memory() -> Self {
        Self {
            memory_cost_kib: 16 * 1024, // 16 MiB
            time_cost: 4,
            parallelism: 1,
        }
    }

    /// Cheapest valid parameters. Tests only.
    pub fn minimal() -> Self {
        Self {
            memory_cost_kib: 64,
            time_cost: 1,
            parallelism: 1,
        }
    }
}

fn salt_for_grid(grid: u8) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(SALT_DOMAIN);
    hasher.update([grid]);
    hasher.finalize().into()
}

/// Derive the 32-byte pattern key.
///
/// Stateless and deterministic. Callers that face the user must add the unlock
/// latency floor on top; this function runs as fast as Argon2 allows.
pub fn derive_pattern_key(pattern: &Pattern, params: &KdfParams) -> Result<VaultKey, DerivationError> {
    let argon_params = Params::new(
        params.memory_cost_kib,
        params.time_cost,
        params.parallelism,
        Some(KEY_LEN),
    )
    .map_err(|e| DerivationError::Kdf(format!("invalid Argon2 params: {}", e)))?;

    let argon2 = Argon2::new_with_secret(PEPPER, Algorithm::Argon2id, Version::V0x13, argon_params)
        .map_err(|e| DerivationError::Kdf(format!("Argon2 init failed: {}", e)))?;

    let input = pattern.canonical_bytes();
    let salt = salt_for_grid(pattern.grid_size());

    let mut output = [0u8; KEY_LEN];
    argon2
        .hash_password_into(&input, &salt, &mut output)
        .map_err(|e| DerivationError::Kdf(format!("hashing failed: {}", e)))?;

    let key = VaultKey::new(output);
    output.zeroize();

    tracing::debug!(grid = pattern.grid_size(), "pattern key derived");
    Ok(key)
}
