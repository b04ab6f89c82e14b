use crate::error::{IoContext, IoError};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = ".beanfile.lock";
const LOCK_METADATA_FILE: &str = ".beanfile.lock.meta.json";

/// Who holds the ledger lock, written next to the lock file while held.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LockMetadata {
    pub operation: String,
    pub started_at: String,
    pub pid: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LockStatus {
    pub locked: bool,
    pub metadata: Option<LockMetadata>,
}

/// Ledger-wide write lock. Released when dropped.
#[derive(Debug)]
pub struct LedgerLock {
    _file: File,
    metadata_path: PathBuf,
}

impl Drop for LedgerLock {
    fn drop(&mut self) {
        let _ = remove_metadata(&self.metadata_path);
    }
}

pub fn lock_path(ledger_dir: &Path) -> PathBuf {
    ledger_dir.join(LOCK_FILE)
}

pub fn lock_metadata_path(ledger_dir: &Path) -> PathBuf {
    ledger_dir.join(LOCK_METADATA_FILE)
}

fn open_lock_file(lock_path: &Path) -> Result<File, IoError> {
    if let Some(parent) = lock_path.parent() {
        fs::create_dir_all(parent).at(parent)?;
    }
    OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(lock_path)
        .at(lock_path)
}

fn remove_metadata(metadata_path: &Path) -> Result<(), IoError> {
    match fs::remove_file(metadata_path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(IoError::new(metadata_path, err)),
    }
}

fn write_metadata(metadata_path: &Path, operation: &str) -> Result<(), IoError> {
    let metadata = LockMetadata {
        operation: operation.to_string(),
        started_at: chrono::Utc::now().to_rfc3339(),
        pid: Some(std::process::id()),
    };
    let json = serde_json::to_vec_pretty(&metadata).map_err(io::Error::other).at(metadata_path)?;
    fs::write(metadata_path, json).at(metadata_path)
}

/// Acquire the lock for `ledger_dir`, waiting for any other holder to
/// finish so that concurrent writers queue instead of interleaving.
pub fn acquire(ledger_dir: &Path, operation: &str) -> Result<LedgerLock, IoError> {
    let path = lock_path(ledger_dir);
    let file = open_lock_file(&path)?;
    if file.try_lock_exclusive().is_err() {
        log::info!("waiting for ledger lock {}", path.display());
        file.lock_exclusive().at(&path)?;
    }
    finish_acquire(ledger_dir, file, operation)
}

/// Acquire the locks of several ledger directories in a fixed order. A
/// directory named twice is locked once.
pub fn acquire_all(ledger_dirs: &[&Path], operation: &str) -> Result<Vec<LedgerLock>, IoError> {
    let mut dirs: Vec<PathBuf> = ledger_dirs
        .iter()
        .map(|dir| fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf()))
        .collect();
    dirs.sort();
    dirs.dedup();
    dirs.iter().map(|dir| acquire(dir, operation)).collect()
}

/// Acquire the lock only if nobody holds it.
pub fn try_acquire(ledger_dir: &Path, operation: &str) -> Result<Option<LedgerLock>, IoError> {
    let path = lock_path(ledger_dir);
    let file = open_lock_file(&path)?;
    if file.try_lock_exclusive().is_err() {
        return Ok(None);
    }
    finish_acquire(ledger_dir, file, operation).map(Some)
}

fn finish_acquire(ledger_dir: &Path, file: File, operation: &str) -> Result<LedgerLock, IoError> {
    let metadata_path = lock_metadata_path(ledger_dir);
    remove_metadata(&metadata_path)?;
    write_metadata(&metadata_path, operation)?;
    Ok(LedgerLock {
        _file: file,
        metadata_path,
    })
}

pub fn status(ledger_dir: &Path) -> Result<LockStatus, IoError> {
    match try_acquire(ledger_dir, "status")? {
        Some(_lock) => Ok(LockStatus {
            locked: false,
            metadata: None,
        }),
        None => {
            let metadata = fs::read_to_string(lock_metadata_path(ledger_dir))
                .ok()
                .and_then(|text| serde_json::from_str(&text).ok());
            Ok(LockStatus {
                locked: true,
                metadata,
            })
        }
    }
}
