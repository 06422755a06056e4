//! Pattern Vault - Error Types

use thiserror::Error;

pub use pattern_keyvault::{DerivationError, KeyError};

/// Result type for engine operations
pub type VaultResult<T> = Result<T, VaultError>;

// ═══════════════════════════════════════════════════════════════
// STORAGE ERRORS
// ═══════════════════════════════════════════════════════════════

/// Local storage failures. Each one implies data-loss risk, so they are
/// always surfaced.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Index corrupted: {0}")]
    CorruptIndex(String),

    #[error("Unsupported format version {found} (expected {expected})")]
    UnsupportedVersion { found: u8, expected: u8 },

    #[error("Blob {blob} generation {generation} is missing")]
    MissingBlob { blob: u32, generation: u32 },

    #[error("Read outside blob {blob}: offset {offset} + {length} exceeds {limit}")]
    OutOfBounds { blob: u32, offset: u64, length: u64, limit: u64 },

    #[error("Allocation of {size} bytes exceeds blob capacity {capacity}")]
    AllocationTooLarge { size: u64, capacity: u64 },

    #[error("Vault key revoked")]
    KeyRevoked,

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Compaction cancelled")]
    Cancelled,

    #[error("Index writer stopped")]
    WriterStopped,
}

impl From<KeyError> for StorageError {
    fn from(_: KeyError) -> Self {
        StorageError::KeyRevoked
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════
// IMPORT ERRORS
// ═══════════════════════════════════════════════════════════════

/// Per-item import failure. Isolated to the item that produced it.
#[derive(Error, Debug)]
pub enum ImportError {
    #[error("Could not read source: {0}")]
    Read(#[source] std::io::Error),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Allocation failed: {0}")]
    Allocation(#[source] StorageError),

    #[error("Storage failed: {0}")]
    Storage(#[source] StorageError),

    #[error("Vault locked during import")]
    KeyRevoked,

    #[error("Import task aborted: {0}")]
    Aborted(String),
}

impl From<KeyError> for ImportError {
    fn from(_: KeyError) -> Self {
        ImportError::KeyRevoked
    }
}

// ═══════════════════════════════════════════════════════════════
// BACKUP ERRORS
// ═══════════════════════════════════════════════════════════════

/// Backup failures. Retryable and resumable; local state is never touched.
#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Remote store error: {0}")]
    Remote(String),

    #[error("Chunk of {size} bytes exceeds remote ceiling {limit}")]
    ChunkTooLarge { size: u64, limit: u64 },

    #[error("Backup interrupted before completion")]
    Interrupted,

    #[error("Backup already running")]
    AlreadyRunning,

    #[error("Backup disabled for this vault")]
    Disabled,

    #[error("Local storage error during backup: {0}")]
    Storage(#[from] StorageError),
}

impl BackupError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackupError::Remote(_) | BackupError::Interrupted)
    }
}

// ═══════════════════════════════════════════════════════════════
// RESTORE ERRORS
// ═══════════════════════════════════════════════════════════════

/// Restore failures. Raised before any local state is replaced.
#[derive(Error, Debug)]
pub enum RestoreError {
    #[error("No backup found for this vault")]
    ManifestNotFound,

    #[error("Manifest incomplete: {0}")]
    IncompleteManifest(String),

    #[error("Chunk {index} of {kind} is missing")]
    MissingChunk { kind: String, index: u32 },

    #[error("Chunk {index} of {kind} failed hash verification")]
    HashMismatch { kind: String, index: u32 },

    #[error("Unsupported backup format version {0}")]
    UnsupportedVersion(u32),

    #[error("Restored index references data outside the backup: {0}")]
    DanglingReference(String),

    #[error("Remote store error: {0}")]
    Remote(String),

    #[error("Local storage error during restore: {0}")]
    Storage(#[from] StorageError),
}

// ═══════════════════════════════════════════════════════════════
// ENGINE ERRORS
// ═══════════════════════════════════════════════════════════════

/// Engine-level error
#[derive(Error, Debug)]
pub enum VaultError {
    #[error("Vault is locked")]
    VaultLocked,

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("Duress vault not found: {0}")]
    DuressNotFound(String),

    #[error("Operation requires the real vault")]
    NotRealVault,

    #[error("Pattern cannot be used as a duress pattern: {0}")]
    DuressConflict(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Derivation(#[from] DerivationError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Import(#[from] ImportError),

    #[error(transparent)]
    Backup(#[from] BackupError),

    #[error(transparent)]
    Restore(#[from] RestoreError),
}

impl From<KeyError> for VaultError {
    fn from(_: KeyError) -> Self {
        VaultError::VaultLocked
    }
}

impl From<std::io::Error> for VaultError {
    fn from(e: std::io::Error) -> Self {
        VaultError::Storage(StorageError::Io(e))
    }
}

impl VaultError {
    /// Errors that indicate tampering or data loss
    pub fn is_security_critical(&self) -> bool {
        matches!(
            self,
            VaultError::Storage(StorageError::CorruptIndex(_))
                | VaultError::Storage(StorageError::Decryption(_))
                | VaultError::Restore(RestoreError::HashMismatch { .. })
        )
    }

    /// Errors a later retry can resolve
    pub fn is_retryable(&self) -> bool {
        match self {
            VaultError::Backup(e) => e.is_retryable(),
            VaultError::Restore(RestoreError::Remote(_)) => true,
            _ => false,
        }
    }
}
