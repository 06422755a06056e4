//! Key derivation - Argon2id pattern KDF and HKDF sub-keys

mod argon2_kdf;
mod hkdf_derive;

pub use argon2_kdf::{derive_pattern_key, KdfParams};
pub use hkdf_derive::{derive_key_set, purposes};
