//! # Pattern Vault
//!
//! Pattern-locked encrypted media vault with duress decoys and chunked,
//! resumable backup.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                       PATTERN VAULT                      │
//! │  ┌─────────────┐  ┌─────────────┐  ┌──────────────────┐  │
//! │  │   ENGINE    │  │   DURESS    │  │  BACKUP/RESTORE  │  │
//! │  │ lock/unlock │  │  RESOLVER   │  │  chunks+manifest │  │
//! │  └──────┬──────┘  └──────┬──────┘  └────────┬─────────┘  │
//! │         │                │                  │            │
//! │  ┌──────┴────────────────┴──────────────────┴─────────┐  │
//! │  │              PATTERN_KEYVAULT KEY SLOT              │  │
//! │  │     Argon2id → HKDF → index / blob / duress keys    │  │
//! │  └─────────────────────────────────────────────────────┘  │
//! │                                                          │
//! │  ┌─────────────┐  ┌─────────────┐  ┌──────────────────┐  │
//! │  │   IMPORT    │  │  INDEX      │  │   BLOB STORE     │  │
//! │  │  PIPELINE   │  │  (1 writer) │  │  first-fit, gen  │  │
//! │  └─────────────┘  └─────────────┘  └──────────────────┘  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Security Model
//!
//! - File windows sealed with AES-256-GCM under the blob key
//! - Index, duress map and backup checkpoint sealed with XChaCha20-Poly1305
//! - No stored secret: keys exist only while unlocked
//! - Locking revokes the key slot for every holder
//! - Remote stores only ever see ciphertext

pub mod backup;
pub mod blob_store;
pub mod config;
pub mod crypto;
pub mod duress;
pub mod engine;
pub mod error;
pub mod import;
pub mod index;
pub mod secure_fs;
pub mod vault;

pub use backup::{BackupCoordinator, BackupReport, BackupState, RemoteStore, RestoreReport};
pub use config::EngineConfig;
pub use engine::{Engine, UnlockOutcome};
pub use error::{VaultError, VaultResult};
pub use import::{ImportItem, ImportOutcome, ImportPipeline};
pub use index::{FileEntry, MediaKind};
pub use vault::{VaultStats, VaultStore};

/// Pattern Vault version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
