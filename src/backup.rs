use crate::error::{IoContext, IoError};
use crate::journal;
use chrono::{Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const BACKUP_MARKER: &str = ".backup.";
const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";
const TIMESTAMP_LEN: usize = 15;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub enabled: bool,
    /// Backups kept per file; 0 keeps all of them.
    pub max_backup_files: usize,
    /// Abort the write when a snapshot cannot be taken.
    pub strict: bool,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_backup_files: 10,
            strict: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error(transparent)]
    Io(#[from] IoError),
    #[error("{} is not a backup file name", .0.display())]
    NotABackup(PathBuf),
}

/// A `<file>.backup.<YYYYMMDD-HHMMSS>[-N]` file next to the ledger file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupFile {
    pub path: PathBuf,
    pub taken_at: NaiveDateTime,
    /// Disambiguates snapshots taken within the same second.
    pub sequence: u32,
}

impl BackupFile {
    fn sort_key(&self) -> (NaiveDateTime, u32) {
        (self.taken_at, self.sequence)
    }
}

/// Copy `file` aside before it is modified. A file that does not exist yet
/// has nothing to preserve and yields `None`.
pub fn snapshot(file: &Path) -> Result<Option<PathBuf>, BackupError> {
    snapshot_at(file, Local::now().naive_local())
}

pub fn snapshot_at(file: &Path, now: NaiveDateTime) -> Result<Option<PathBuf>, BackupError> {
    if !file.exists() {
        return Ok(None);
    }
    let stamp = now.format(TIMESTAMP_FORMAT).to_string();
    let mut backup = backup_path(file, &stamp);
    let mut sequence = 0u32;
    while backup.exists() {
        sequence += 1;
        backup = backup_path(file, &format!("{stamp}-{sequence}"));
    }
    fs::copy(file, &backup).at(&backup)?;
    log::info!("backed up {} to {}", file.display(), backup.display());
    Ok(Some(backup))
}

fn backup_path(file: &Path, suffix: &str) -> PathBuf {
    let name = file
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    file.with_file_name(format!("{name}{BACKUP_MARKER}{suffix}"))
}

/// Parse a backup path belonging to `file`.
pub fn parse_backup(file: &Path, candidate: &Path) -> Option<BackupFile> {
    let name = file.file_name()?.to_str()?;
    let candidate_name = candidate.file_name()?.to_str()?;
    let suffix = candidate_name
        .strip_prefix(name)?
        .strip_prefix(BACKUP_MARKER)?;
    if !suffix.is_char_boundary(TIMESTAMP_LEN) {
        return None;
    }
    let (stamp, rest) = suffix.split_at(TIMESTAMP_LEN);
    let taken_at = NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).ok()?;
    let sequence = match rest {
        "" => 0,
        counter => counter.strip_prefix('-')?.parse().ok()?,
    };
    Some(BackupFile {
        path: candidate.to_path_buf(),
        taken_at,
        sequence,
    })
}

/// Backups of `file`, newest first.
pub fn list_backups(file: &Path) -> Result<Vec<BackupFile>, BackupError> {
    let dir = match file.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let entries = match fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(IoError::new(dir, err).into()),
    };
    let mut backups = Vec::new();
    for entry in entries {
        let entry = entry.at(&dir)?;
        if let Some(backup) = parse_backup(file, &entry.path()) {
            backups.push(backup);
        }
    }
    backups.sort_by_key(|backup| std::cmp::Reverse(backup.sort_key()));
    Ok(backups)
}

/// Delete the oldest backups of `file` beyond `max_count`. Returns the
/// deleted paths.
pub fn enforce_retention(file: &Path, max_count: usize) -> Result<Vec<PathBuf>, BackupError> {
    if max_count == 0 {
        return Ok(Vec::new());
    }
    let mut removed = Vec::new();
    for backup in list_backups(file)?.into_iter().skip(max_count) {
        fs::remove_file(&backup.path).at(&backup.path)?;
        log::info!("removed old backup {}", backup.path.display());
        removed.push(backup.path);
    }
    Ok(removed)
}

/// Put a backup's content back in place of `file`.
pub fn restore(backup: &Path, file: &Path) -> Result<(), BackupError> {
    if parse_backup(file, backup).is_none() {
        return Err(BackupError::NotABackup(backup.to_path_buf()));
    }
    let content = fs::read(backup).at(backup)?;
    journal::atomic_write(file, &content)?;
    log::info!("restored {} from {}", file.display(), backup.display());
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_dir(prefix: &str) -> PathBuf {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!(
            "beanfile-backup-{prefix}-{}-{now}",
            std::process::id()
        ));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn at(hour: u32, minute: u32, second: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, 1)
            .unwrap()
            .and_hms_opt(hour, minute, second)
            .unwrap()
    }

    #[test]
    fn snapshot_names_and_collisions() {
        let dir = temp_dir("names");
        let file = dir.join("ledger.beancount");
        assert_eq!(snapshot_at(&file, at(9, 0, 0)).unwrap(), None);

        fs::write(&file, "one\n").unwrap();
        let first = snapshot_at(&file, at(9, 0, 0)).unwrap().unwrap();
        let second = snapshot_at(&file, at(9, 0, 0)).unwrap().unwrap();
        assert_eq!(
            first.file_name().unwrap(),
            "ledger.beancount.backup.20250301-090000"
        );
        assert_eq!(
            second.file_name().unwrap(),
            "ledger.beancount.backup.20250301-090000-1"
        );
        assert_eq!(fs::read_to_string(&second).unwrap(), "one\n");

        let listed: Vec<u32> = list_backups(&file)
            .unwrap()
            .iter()
            .map(|backup| backup.sequence)
            .collect();
        assert_eq!(listed, vec![1, 0]);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn parse_backup_ignores_other_files() {
        let file = Path::new("/books/accounts.beancount");
        assert!(parse_backup(file, Path::new("/books/accounts.beancount.backup.20250301-090000")).is_some());
        assert!(parse_backup(file, Path::new("/books/accounts.beancount.backup.2025")).is_none());
        assert!(parse_backup(file, Path::new("/books/prices.beancount.backup.20250301-090000")).is_none());
        assert!(parse_backup(file, Path::new("/books/accounts.beancount.backup.20250301-090000-x")).is_none());
    }

    #[test]
    fn retention_keeps_newest() {
        let dir = temp_dir("retention");
        let file = dir.join("prices.beancount");
        fs::write(&file, "x\n").unwrap();
        let taken: Vec<PathBuf> = (0..5)
            .map(|minute| snapshot_at(&file, at(10, minute, 0)).unwrap().unwrap())
            .collect();

        let removed = enforce_retention(&file, 2).unwrap();
        assert_eq!(removed, taken[..3].iter().rev().cloned().collect::<Vec<_>>());
        let kept: Vec<PathBuf> = list_backups(&file)
            .unwrap()
            .into_iter()
            .map(|backup| backup.path)
            .collect();
        assert_eq!(kept, vec![taken[4].clone(), taken[3].clone()]);

        assert!(enforce_retention(&file, 0).unwrap().is_empty());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn restore_puts_content_back() {
        let dir = temp_dir("restore");
        let file = dir.join("notes.beancount");
        fs::write(&file, "before\n").unwrap();
        let backup = snapshot(&file).unwrap().unwrap();
        fs::write(&file, "after\n").unwrap();
        restore(&backup, &file).unwrap();
        assert_eq!(fs::read_to_string(&file).unwrap(), "before\n");
        assert!(matches!(
            restore(&file, &file),
            Err(BackupError::NotABackup(_))
        ));
        let _ = fs::remove_dir_all(&dir);
    }
}
