//! Pattern Vault - AEAD Encryption
//!
//! AES-256-GCM for file windows, XChaCha20-Poly1305 for documents (index,
//! duress map, backup checkpoint).

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use pattern_keyvault::VaultKey;
use rand::RngCore;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::StorageError;

/// GCM / Poly1305 authentication tag size
pub const TAG_LEN: usize = 16;

/// Random per-file part of the window nonce
pub const NONCE_PREFIX_LEN: usize = 8;

/// Nonce length for XChaCha20
pub const XCHACHA_NONCE_LEN: usize = 24;

/// Magic + version + nonce
const DOCUMENT_HEADER_LEN: usize = 4 + 1 + XCHACHA_NONCE_LEN;

/// Generate the per-file nonce prefix
pub fn generate_nonce_prefix() -> [u8; NONCE_PREFIX_LEN] {
    let mut prefix = [0u8; NONCE_PREFIX_LEN];
    rand::thread_rng().fill_bytes(&mut prefix);
    prefix
}

// ═══════════════════════════════════════════════════════════════════════════
// AES-256-GCM (file windows)
// ═══════════════════════════════════════════════════════════════════════════

/// Position of one window inside a file; bound into the AAD so windows cannot
/// be reordered, swapped between files, or truncated.
#[derive(Debug, Clone, Copy)]
pub struct WindowContext<'a> {
    pub file_id: &'a Uuid,
    pub nonce_prefix: &'a [u8; NONCE_PREFIX_LEN],
    pub index: u32,
    pub last: bool,
}

impl WindowContext<'_> {
    fn nonce(&self) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[..NONCE_PREFIX_LEN].copy_from_slice(self.nonce_prefix);
        nonce[NONCE_PREFIX_LEN..].copy_from_slice(&self.index.to_be_bytes());
        nonce
    }

    fn aad(&self) -> [u8; 21] {
        let mut aad = [0u8; 21];
        aad[..16].copy_from_slice(self.file_id.as_bytes());
        aad[16..20].copy_from_slice(&self.index.to_be_bytes());
        aad[20] = u8::from(self.last);
        aad
    }
}

/// Encrypt one plaintext window. Output is `plaintext.len() + TAG_LEN` bytes.
pub fn seal_window(key: &VaultKey, ctx: &WindowContext<'_>, plaintext: &[u8]) -> Result<Vec<u8>, StorageError> {
    let cipher = Aes256Gcm::new_from_slice(key.expose())
        .map_err(|e| StorageError::Encryption(e.to_string()))?;

    let nonce_bytes = ctx.nonce();
    let aad = ctx.aad();

    cipher
        .encrypt(Nonce::from_slice(&nonce_bytes), Payload { msg: plaintext, aad: &aad })
        .map_err(|e| StorageError::Encryption(e.to_string()))
}

/// Decrypt one window sealed by [`seal_window`]
pub fn open_window(key: &VaultKey, ctx: &WindowContext<'_>, ciphertext: &[u8]) -> Result<Vec<u8>, StorageError> {
    let cipher = Aes256Gcm::new_from_slice(key.expose())
        .map_err(|e| StorageError::Decryption(e.to_string()))?;

    let nonce_bytes = ctx.nonce();
    let aad = ctx.aad();

    cipher
        .decrypt(Nonce::from_slice(&nonce_bytes), Payload { msg: ciphertext, aad: &aad })
        .map_err(|_| StorageError::Decryption(format!("window {} failed authentication", ctx.index)))
}

// ═══════════════════════════════════════════════════════════════════════════
// XChaCha20-Poly1305 (documents)
// ═══════════════════════════════════════════════════════════════════════════

/// Encrypted document: `[magic 4][version 1][nonce 24][ciphertext + tag]`
pub struct EncryptedData {
    pub magic: [u8; 4],
    pub version: u8,
    pub nonce: [u8; XCHACHA_NONCE_LEN],
    pub ciphertext: Vec<u8>,
}

impl EncryptedData {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut result = Vec::with_capacity(DOCUMENT_HEADER_LEN + self.ciphertext.len());
        result.extend_from_slice(&self.magic);
        result.push(self.version);
        result.extend_from_slice(&self.nonce);
        result.extend_from_slice(&self.ciphertext);
        result
    }

    /// Parse and check magic and version
    pub fn from_bytes(data: &[u8], magic: &[u8; 4], version: u8) -> Result<Self, StorageError> {
        if data.len() < DOCUMENT_HEADER_LEN + TAG_LEN {
            return Err(StorageError::CorruptIndex("document too short".into()));
        }
        if &data[..4] != magic {
            return Err(StorageError::CorruptIndex("bad magic".into()));
        }
        if data[4] != version {
            return Err(StorageError::UnsupportedVersion {
                found: data[4],
                expected: version,
            });
        }

        let mut nonce = [0u8; XCHACHA_NONCE_LEN];
        nonce.copy_from_slice(&data[5..DOCUMENT_HEADER_LEN]);

        Ok(Self {
            magic: *magic,
            version,
            nonce,
            ciphertext: data[DOCUMENT_HEADER_LEN..].to_vec(),
        })
    }

    fn aad(&self) -> [u8; 5] {
        let mut aad = [0u8; 5];
        aad[..4].copy_from_slice(&self.magic);
        aad[4] = self.version;
        aad
    }
}

/// Seal a document with XChaCha20-Poly1305
pub fn seal_document(key: &VaultKey, magic: &[u8; 4], version: u8, plaintext: &[u8]) -> Result<Vec<u8>, StorageError> {
    let cipher = XChaCha20Poly1305::new_from_slice(key.expose())
        .map_err(|e| StorageError::Encryption(e.to_string()))?;

    let mut nonce = [0u8; XCHACHA_NONCE_LEN];
    rand::thread_rng().fill_bytes(&mut nonce);

    let mut doc = EncryptedData {
        magic: *magic,
        version,
        nonce,
        ciphertext: Vec::new(),
    };
    let aad = doc.aad();

    doc.ciphertext = cipher
        .encrypt(XNonce::from_slice(&nonce), Payload { msg: plaintext, aad: &aad })
        .map_err(|e| StorageError::Encryption(e.to_string()))?;

    Ok(doc.to_bytes())
}

/// Open a document sealed by [`seal_document`]
pub fn open_document(key: &VaultKey, magic: &[u8; 4], version: u8, data: &[u8]) -> Result<Vec<u8>, StorageError> {
    let doc = EncryptedData::from_bytes(data, magic, version)?;
    let cipher = XChaCha20Poly1305::new_from_slice(key.expose())
        .map_err(|e| StorageError::Decryption(e.to_string()))?;
    let aad = doc.aad();

    cipher
        .decrypt(XNonce::from_slice(&doc.nonce), Payload { msg: &doc.ciphertext, aad: &aad })
        .map_err(|_| StorageError::CorruptIndex("authentication failed".into()))
}

// ═══════════════════════════════════════════════════════════════════════════
// Content hashes (backup chunks)
// ═══════════════════════════════════════════════════════════════════════════

/// Hex SHA-256 of a byte slice
pub fn content_hash(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
