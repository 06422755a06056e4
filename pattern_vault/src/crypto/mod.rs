//! Pattern Vault - Cryptographic Core
//!
//! Keys come from `pattern_keyvault`; this module only seals and opens bytes.

pub mod aead;

pub use aead::*;
