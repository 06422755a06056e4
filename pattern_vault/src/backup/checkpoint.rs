//! Local record of acknowledged blob chunks
//!
//! Sealed with the index key. Lets an interrupted run resume without
//! re-uploading blobs the remote already holds.

use std::collections::BTreeMap;

use pattern_keyvault::KeyHandle;
use serde::{Deserialize, Serialize};

use crate::crypto::{open_document, seal_document};
use crate::error::StorageError;
use crate::secure_fs::SecureFs;

pub const CHECKPOINT_FILE: &str = "backup.ckpt";

const CHECKPOINT_MAGIC: &[u8; 4] = b"PVCK";
const CHECKPOINT_FORMAT_VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckedChunk {
    pub generation: u32,
    pub hash: String,
    pub length: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupCheckpoint {
    /// Remote the acknowledgements were received from
    pub remote_id: String,
    pub acked: BTreeMap<u32, AckedChunk>,
}

impl BackupCheckpoint {
    /// Load the checkpoint for `remote_id`. A checkpoint written for another
    /// remote, or an unreadable one, starts over empty.
    pub fn load(fs: &SecureFs, keys: &KeyHandle, remote_id: &str) -> Result<Self, StorageError> {
        fs.discard_wal(CHECKPOINT_FILE)?;
        let fresh = Self {
            remote_id: remote_id.to_string(),
            acked: BTreeMap::new(),
        };

        let Some(data) = fs.read_optional(CHECKPOINT_FILE)? else {
            return Ok(fresh);
        };
        let opened = keys.with_keys(|k| {
            open_document(k.index_key(), CHECKPOINT_MAGIC, CHECKPOINT_FORMAT_VERSION, &data)
        })?;

        let checkpoint = match opened.map(|json| serde_json::from_slice::<Self>(&json)) {
            Ok(Ok(checkpoint)) => checkpoint,
            _ => {
                tracing::warn!("backup checkpoint unreadable, starting over");
                return Ok(fresh);
            }
        };
        if checkpoint.remote_id != remote_id {
            return Ok(fresh);
        }
        Ok(checkpoint)
    }

    pub fn save(&self, fs: &SecureFs, keys: &KeyHandle) -> Result<(), StorageError> {
        let json = serde_json::to_vec(self)?;
        let sealed = keys.with_keys(|k| {
            seal_document(k.index_key(), CHECKPOINT_MAGIC, CHECKPOINT_FORMAT_VERSION, &json)
        })??;
        fs.write_atomic(CHECKPOINT_FILE, &sealed)
    }

    /// Whether blob `index` with these exact bytes was acknowledged
    pub fn is_acked(&self, index: u32, generation: u32, hash: &str) -> bool {
        self.acked
            .get(&index)
            .map(|a| a.generation == generation && a.hash == hash)
            .unwrap_or(false)
    }

    pub fn ack(&mut self, index: u32, chunk: AckedChunk) {
        self.acked.insert(index, chunk);
    }
}
