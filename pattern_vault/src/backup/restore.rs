//! Restore from a remote backup
//!
//! Everything is fetched and verified into a staging directory first; the
//! vault directory is only replaced once the whole backup checked out.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use pattern_keyvault::KeyHandle;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use super::manifest::{BackupManifest, ChunkInfo, ChunkKind, BACKUP_FORMAT_VERSION};
use super::remote::RemoteStore;
use crate::blob_store::{blob_file_name, BLOB_DIR};
use crate::crypto::content_hash;
use crate::duress::DURESS_FILE;
use crate::error::{BackupError, RestoreError, StorageError};
use crate::index::{IndexDocument, INDEX_FILE};
use crate::secure_fs::{sync_dir, SecureFs};
use crate::vault::{recover_interrupted_swap, retired_dir, vault_dir, VAULTS_DIR};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    pub vault_id: String,
    pub blobs: usize,
    pub files: u64,
    pub bytes: u64,
}

fn remote_err(e: BackupError) -> RestoreError {
    RestoreError::Remote(e.to_string())
}

fn hash_mismatch(kind: ChunkKind, index: u32) -> RestoreError {
    RestoreError::HashMismatch {
        kind: kind.to_string(),
        index,
    }
}

/// Fetch both manifests and check they describe one complete backup
async fn fetch_manifests(
    remote: &dyn RemoteStore,
    vault_id: &str,
) -> Result<(BackupManifest, BackupManifest), RestoreError> {
    let index_manifest = remote
        .get_manifest(vault_id, ChunkKind::Index)
        .await
        .map_err(remote_err)?
        .ok_or(RestoreError::ManifestNotFound)?;
    index_manifest.verify_complete()?;

    let blob_manifest = remote
        .get_manifest(vault_id, ChunkKind::Blob)
        .await
        .map_err(remote_err)?
        .ok_or_else(|| RestoreError::IncompleteManifest("blob manifest missing".into()))?;
    blob_manifest.verify_complete()?;

    let link = blob_manifest
        .manifest_hash()
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    if index_manifest.paired_manifest_hash.as_deref() != Some(link.as_str()) {
        return Err(RestoreError::IncompleteManifest(
            "index manifest does not pair with the current blob manifest".into(),
        ));
    }

    for manifest in [&index_manifest, &blob_manifest] {
        let listed = remote
            .list_chunks(vault_id, manifest.kind, BACKUP_FORMAT_VERSION)
            .await
            .map_err(remote_err)?;
        for chunk in &manifest.chunks {
            if listed.binary_search(&chunk.index).is_err() {
                return Err(RestoreError::MissingChunk {
                    kind: manifest.kind.to_string(),
                    index: chunk.index,
                });
            }
        }
    }

    Ok((index_manifest, blob_manifest))
}

async fn fetch_verified(remote: &dyn RemoteStore, manifest: &BackupManifest, chunk: &ChunkInfo) -> Result<Vec<u8>, RestoreError> {
    let data = remote
        .get_chunk(&manifest.key(chunk.index))
        .await
        .map_err(remote_err)?
        .ok_or_else(|| RestoreError::MissingChunk {
            kind: manifest.kind.to_string(),
            index: chunk.index,
        })?;

    if data.len() as u64 != chunk.length || content_hash(&data) != chunk.hash {
        return Err(hash_mismatch(manifest.kind, chunk.index));
    }
    Ok(data)
}

/// Check every segment lies inside a restored blob
fn check_references(doc: &IndexDocument, blob_manifest: &BackupManifest) -> Result<(), RestoreError> {
    let chunks: HashMap<u32, &ChunkInfo> = blob_manifest.chunks.iter().map(|c| (c.index, c)).collect();

    for record in &doc.blobs {
        let chunk = chunks
            .get(&record.index)
            .ok_or_else(|| RestoreError::DanglingReference(format!("blob {} not in backup", record.index)))?;
        if chunk.generation != record.generation || chunk.length != record.high_water {
            return Err(RestoreError::DanglingReference(format!(
                "blob {} generation {} does not match backup generation {}",
                record.index, record.generation, chunk.generation
            )));
        }
    }

    for entry in doc.files.values() {
        for seg in &entry.segments {
            let inside = doc
                .record(seg.blob)
                .map(|r| seg.end() <= r.high_water)
                .unwrap_or(false);
            if !inside {
                return Err(RestoreError::DanglingReference(format!(
                    "file {} segment at blob {} offset {}",
                    entry.id, seg.blob, seg.offset
                )));
            }
        }
    }
    Ok(())
}

/// Replace the vault directory with `staging`. A crash between the two
/// renames leaves the old vault under its retired name, which the next open
/// moves back.
fn swap_into_place(staging: &Path, root: &Path, vault_id: &str) -> Result<(), StorageError> {
    let target = vault_dir(root, vault_id);
    let parent = root.join(VAULTS_DIR);

    if target.exists() {
        // Keep the duress registrations of a real vault
        let duress = target.join(DURESS_FILE);
        if duress.exists() {
            std::fs::copy(&duress, staging.join(DURESS_FILE))?;
            std::fs::File::open(staging.join(DURESS_FILE))?.sync_all()?;
        }

        let retired = retired_dir(root, vault_id);
        if retired.exists() {
            std::fs::remove_dir_all(&retired)?;
        }
        std::fs::rename(&target, &retired)?;
        std::fs::rename(staging, &target)?;
        sync_dir(&parent)?;
        std::fs::remove_dir_all(&retired)?;
    } else {
        std::fs::rename(staging, &target)?;
        sync_dir(&parent)?;
    }
    Ok(())
}

/// Write one staged blob and flush it before the directory is swapped in
async fn write_durable(path: &Path, data: &[u8]) -> Result<(), StorageError> {
    let mut file = tokio::fs::File::create(path).await?;
    file.write_all(data).await?;
    file.sync_all().await?;
    Ok(())
}

/// Restore the backup of the vault `keys` opens into `root`.
///
/// The vault must not be open while this runs.
pub async fn restore_vault(
    remote: Arc<dyn RemoteStore>,
    root: &Path,
    keys: &KeyHandle,
    fan_out: usize,
) -> Result<RestoreReport, RestoreError> {
    let vault_id = keys.vault_id().to_string();
    recover_interrupted_swap(root, &vault_id)?;
    let (index_manifest, blob_manifest) = fetch_manifests(remote.as_ref(), &vault_id).await?;
    tracing::info!(
        blobs = blob_manifest.chunk_count,
        index_chunks = index_manifest.chunk_count,
        "restore manifests verified"
    );

    let staging: PathBuf = root.join(VAULTS_DIR).join(format!(".restore-{}", vault_id));
    if staging.exists() {
        std::fs::remove_dir_all(&staging).map_err(StorageError::from)?;
    }
    std::fs::create_dir_all(staging.join(BLOB_DIR)).map_err(StorageError::from)?;

    let result = stage(remote, &staging, keys, &index_manifest, &blob_manifest, fan_out).await;
    let report = match result {
        Ok(doc) => RestoreReport {
            vault_id: vault_id.clone(),
            blobs: blob_manifest.chunks.len(),
            files: doc.metadata.file_count,
            bytes: doc.metadata.total_size,
        },
        Err(e) => {
            let _ = std::fs::remove_dir_all(&staging);
            tracing::warn!(error = %e, "restore aborted, local state unchanged");
            return Err(e);
        }
    };

    if let Err(e) = swap_into_place(&staging, root, &vault_id) {
        let _ = std::fs::remove_dir_all(&staging);
        return Err(e.into());
    }

    tracing::info!(files = report.files, "restore complete");
    Ok(report)
}

/// Download and verify everything into `staging`
async fn stage(
    remote: Arc<dyn RemoteStore>,
    staging: &Path,
    keys: &KeyHandle,
    index_manifest: &BackupManifest,
    blob_manifest: &BackupManifest,
    fan_out: usize,
) -> Result<IndexDocument, RestoreError> {
    let slots = Arc::new(Semaphore::new(fan_out.max(1)));
    let mut tasks = JoinSet::new();

    for chunk in blob_manifest.chunks.iter().cloned() {
        let remote = Arc::clone(&remote);
        let slots = Arc::clone(&slots);
        let manifest = blob_manifest.clone();
        let path = staging.join(BLOB_DIR).join(blob_file_name(chunk.index, chunk.generation));

        tasks.spawn(async move {
            let _permit = slots
                .acquire_owned()
                .await
                .map_err(|e| RestoreError::Remote(e.to_string()))?;
            let data = fetch_verified(remote.as_ref(), &manifest, &chunk).await?;
            write_durable(&path, &data).await?;
            Ok::<_, RestoreError>(())
        });
    }

    while let Some(joined) = tasks.join_next().await {
        let outcome = joined.map_err(|e| RestoreError::Remote(e.to_string()))?;
        if let Err(e) = outcome {
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
            return Err(e);
        }
    }

    let mut sealed = Vec::new();
    for chunk in &index_manifest.chunks {
        sealed.extend(fetch_verified(remote.as_ref(), index_manifest, chunk).await?);
    }

    let doc = IndexDocument::open(keys, &sealed)?;
    check_references(&doc, blob_manifest)?;

    let fs = SecureFs::new(staging);
    fs.write_atomic(INDEX_FILE, &sealed)?;
    sync_dir(&staging.join(BLOB_DIR))?;
    Ok(doc)
}
