//! Pattern Vault - Durable Filesystem Operations
//!
//! Write-ahead-then-rename for documents that must never be observed half
//! written (index, duress map, backup checkpoint).

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use crate::error::StorageError;

/// Suffix of the write-ahead file next to its target
pub const WAL_SUFFIX: &str = "wal";

/// Filesystem handle rooted at one vault directory
#[derive(Debug, Clone)]
pub struct SecureFs {
    root: PathBuf,
}

impl SecureFs {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Full path for a relative file
    pub fn full_path(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    /// Path of the write-ahead file for `relative`
    pub fn wal_path(&self, relative: &str) -> PathBuf {
        let mut name = self.full_path(relative).into_os_string();
        name.push(".");
        name.push(WAL_SUFFIX);
        PathBuf::from(name)
    }

    /// Write `data` to the WAL file and fsync it, without publishing.
    pub fn write_ahead(&self, relative: &str, data: &[u8]) -> Result<PathBuf, StorageError> {
        let path = self.full_path(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let wal = self.wal_path(relative);
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&wal)?;
        file.write_all(data)?;
        file.sync_all()?;
        Ok(wal)
    }

    /// Atomically replace `relative` with `data`.
    ///
    /// A crash at any point leaves either the previous content or the new one.
    pub fn write_atomic(&self, relative: &str, data: &[u8]) -> Result<(), StorageError> {
        let wal = self.write_ahead(relative, data)?;
        let path = self.full_path(relative);
        fs::rename(&wal, &path)?;
        sync_dir(path.parent().unwrap_or(&self.root))?;
        Ok(())
    }

    /// Read a file; `None` if it does not exist
    pub fn read_optional(&self, relative: &str) -> Result<Option<Vec<u8>>, StorageError> {
        match fs::read(self.full_path(relative)) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove a stale write-ahead file left by a crash
    pub fn discard_wal(&self, relative: &str) -> Result<bool, StorageError> {
        remove_if_exists(&self.wal_path(relative))
    }

    pub fn exists(&self, relative: &str) -> bool {
        self.full_path(relative).exists()
    }

    /// Remove a file; missing files are fine
    pub fn delete_file(&self, relative: &str) -> Result<bool, StorageError> {
        remove_if_exists(&self.full_path(relative))
    }

    /// File names in a relative directory (empty if it does not exist)
    pub fn list_dir(&self, relative: &str) -> Result<Vec<String>, StorageError> {
        let path = self.full_path(relative);
        let mut files = Vec::new();

        if path.exists() {
            for entry in fs::read_dir(&path)? {
                let entry = entry?;
                if let Some(name) = entry.file_name().to_str() {
                    files.push(name.to_string());
                }
            }
        }

        files.sort();
        Ok(files)
    }

    /// Total bytes under the root
    pub fn total_size(&self) -> Result<u64, StorageError> {
        dir_size(&self.root)
    }
}

/// Remove a file; returns whether it existed
pub fn remove_if_exists(path: &Path) -> Result<bool, StorageError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Fsync a directory so a rename inside it is durable
pub fn sync_dir(dir: &Path) -> Result<(), StorageError> {
    #[cfg(unix)]
    {
        File::open(dir)?.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}

fn dir_size(path: &Path) -> Result<u64, StorageError> {
    let mut size = 0;

    if path.is_dir() {
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let path = entry.path();

            if path.is_dir() {
                size += dir_size(&path)?;
            } else {
                size += fs::metadata(&path)?.len();
            }
        }
    }

    Ok(size)
}
