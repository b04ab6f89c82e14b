//! Create, update and delete single directives.
//!
//! Every operation runs the same sequence under the ledger lock: validate
//! the entry, locate the existing text (update/delete), snapshot each file
//! about to change, write each one atomically, then run the external
//! validator over the whole ledger. A rejected or failed write restores the
//! pre-write content of every touched file before returning.

use crate::backup::{self, BackupError};
use crate::codec;
use crate::config::EngineConfig;
use crate::entry::{Commodity, EntryKind, LedgerEntry, Metadata, SourceLocation, ValidationError};
use crate::error::IoError;
use crate::journal;
use crate::layout::{self, LayoutMode, ManagedFile};
use crate::lock;
use crate::locator::{self, LocatedSpan, LocatorError};
use crate::validator::{LedgerValidator, ValidatorError};
use chrono::{Local, NaiveDate};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Validate,
    Locate,
    Snapshot,
    Write,
    ExternalValidate,
    Retention,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Validate => "validate",
            Self::Locate => "locate",
            Self::Snapshot => "snapshot",
            Self::Write => "write",
            Self::ExternalValidate => "external-validate",
            Self::Retention => "retention",
        };
        f.write_str(name)
    }
}

/// How an operation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalState {
    Committed,
    /// Something was written, then undone; the ledger is as it was.
    RolledBack,
    /// Nothing was written, or the undo itself failed.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Created,
    Updated,
    Deleted,
}

/// Where a query snapshot last saw an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationHint {
    pub file: PathBuf,
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationOutcome {
    pub kind: MutationKind,
    pub id: String,
    /// Where the entry now lives; `None` after a delete.
    pub location: Option<SourceLocation>,
    pub files_written: Vec<PathBuf>,
    pub backups: Vec<PathBuf>,
    pub pruned_backups: Vec<PathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub enum MutationError {
    #[error("invalid entry: {0}")]
    Validation(#[from] ValidationError),
    #[error("entry id {given} does not match {expected}")]
    IdMismatch { expected: String, given: String },
    #[error("new entries are assigned a fresh id; got {0}")]
    IdSupplied(String),
    #[error(transparent)]
    Locator(#[from] LocatorError),
    #[error("backup failed: {0}")]
    Backup(#[source] BackupError),
    #[error("{phase} failed: {source}")]
    Io {
        phase: Phase,
        #[source]
        source: IoError,
        rolled_back: bool,
    },
    #[error("{source}; changes were rolled back")]
    ExternalValidation {
        #[source]
        source: ValidatorError,
        backups: Vec<PathBuf>,
    },
    #[error("rollback after \"{cause}\" failed: {source}; recover from {backups:?}")]
    RollbackFailed {
        cause: String,
        #[source]
        source: IoError,
        backups: Vec<PathBuf>,
    },
}

impl MutationError {
    pub fn state(&self) -> TerminalState {
        match self {
            Self::ExternalValidation { .. } => TerminalState::RolledBack,
            Self::Io {
                rolled_back: true, ..
            } => TerminalState::RolledBack,
            _ => TerminalState::Failed,
        }
    }
}

/// One file's content before and after an operation.
#[derive(Debug, Clone)]
struct FileEdit {
    path: PathBuf,
    before: Option<String>,
    after: String,
}

pub struct MutationEngine<'a> {
    config: &'a EngineConfig,
    validator: &'a dyn LedgerValidator,
}

impl<'a> MutationEngine<'a> {
    pub fn new(config: &'a EngineConfig, validator: &'a dyn LedgerValidator) -> Self {
        Self { config, validator }
    }

    fn root(&self) -> PathBuf {
        self.config.layout.root_file()
    }

    /// Append a new entry to the file the layout assigns it. The entry is
    /// always given a fresh id, so ids are never reused after a delete.
    pub fn create(&self, mut entry: LedgerEntry) -> Result<MutationOutcome, MutationError> {
        if !entry.id.is_empty() {
            return Err(MutationError::IdSupplied(entry.id));
        }
        entry.id = uuid::Uuid::new_v4().to_string();
        log::debug!("create {entry}: {}", Phase::Validate);
        entry.validate(&self.config.validation_options())?;

        let _lock = self.lock("create")?;
        self.create_locked(entry)
    }

    fn create_locked(&self, entry: LedgerEntry) -> Result<MutationOutcome, MutationError> {
        let target = self.config.layout.file_for(&entry);
        let before = read(&target, Phase::Locate)?;
        let text = codec::encode(&entry);
        let after = journal::append_block(before.as_deref().unwrap_or_default(), &text);
        let location = appended_location(&target, &after, &text);

        let edits = vec![FileEdit {
            path: target,
            before,
            after,
        }];
        self.apply(MutationKind::Created, entry.id, Some(location), edits)
    }

    /// Replace the text of entry `id` with `entry`, leaving the rest of the
    /// file untouched. In the structured layout an entry whose date or type
    /// now maps to a different managed file is moved there.
    pub fn update(
        &self,
        id: &str,
        mut entry: LedgerEntry,
        hint: Option<&LocationHint>,
    ) -> Result<MutationOutcome, MutationError> {
        if entry.id.is_empty() {
            entry.id = id.to_string();
        } else if entry.id != id {
            return Err(MutationError::IdMismatch {
                expected: id.to_string(),
                given: entry.id,
            });
        }
        log::debug!("update {entry}: {}", Phase::Validate);
        entry.validate(&self.config.validation_options())?;

        let _lock = self.lock("update")?;
        self.update_locked(id, entry, hint)
    }

    fn update_locked(
        &self,
        id: &str,
        entry: LedgerEntry,
        hint: Option<&LocationHint>,
    ) -> Result<MutationOutcome, MutationError> {
        let (span, content) = self.locate(id, hint)?;
        let text = codec::encode(&entry);
        let target = self.config.layout.file_for(&entry);

        let edits;
        let location;
        if self.should_move(&span.file, &target) {
            let removed = journal::remove_lines(&content, span.start_line, span.end_line);
            let target_before = read(&target, Phase::Locate)?;
            let target_after =
                journal::append_block(target_before.as_deref().unwrap_or_default(), &text);
            location = appended_location(&target, &target_after, &text);
            log::info!(
                "moving {id} from {} to {}",
                span.file.display(),
                target.display()
            );
            edits = vec![
                FileEdit {
                    path: span.file.clone(),
                    before: Some(content),
                    after: removed,
                },
                FileEdit {
                    path: target,
                    before: target_before,
                    after: target_after,
                },
            ];
        } else {
            let after = journal::splice_lines(&content, span.start_line, span.end_line, &text);
            location = SourceLocation {
                file: span.file.clone(),
                start_line: span.start_line,
                end_line: span.start_line + text.lines().count().saturating_sub(1),
            };
            edits = vec![FileEdit {
                path: span.file.clone(),
                before: Some(content),
                after,
            }];
        }
        self.apply(MutationKind::Updated, entry.id, Some(location), edits)
    }

    /// Remove the text of entry `id`.
    pub fn delete(
        &self,
        id: &str,
        hint: Option<&LocationHint>,
    ) -> Result<MutationOutcome, MutationError> {
        let _lock = self.lock("delete")?;
        let (span, content) = self.locate(id, hint)?;
        let after = journal::remove_lines(&content, span.start_line, span.end_line);
        let edits = vec![FileEdit {
            path: span.file,
            before: Some(content),
            after,
        }];
        self.apply(MutationKind::Deleted, id.to_string(), None, edits)
    }

    /// Declare commodity `symbol` with `meta`, or replace the metadata of
    /// its existing declaration in place. A new declaration is dated `date`,
    /// else on the earliest directive in the ledger, else today.
    pub fn upsert_commodity(
        &self,
        symbol: &str,
        meta: Metadata,
        date: Option<NaiveDate>,
    ) -> Result<MutationOutcome, MutationError> {
        let options = self.config.validation_options();
        let _lock = self.lock("upsert-commodity")?;
        let root = self.root();
        let entries = if root.exists() {
            journal::read_entries(&root).map_err(LocatorError::from)?
        } else {
            Vec::new()
        };

        let existing = entries.iter().find(|entry| {
            matches!(&entry.kind, EntryKind::Commodity(commodity) if commodity.currency == symbol)
        });
        if let Some(existing) = existing {
            let mut entry = existing.clone();
            entry.meta = meta;
            entry.source = None;
            log::debug!("update {entry}: {}", Phase::Validate);
            entry.validate(&options)?;
            let hint = existing.source.as_ref().map(|source| LocationHint {
                file: source.file.clone(),
                line: source.start_line,
            });
            return self.update_locked(&existing.id, entry, hint.as_ref());
        }

        let date = date
            .or_else(|| entries.iter().map(|entry| entry.date).min())
            .unwrap_or_else(|| Local::now().date_naive());
        let mut entry = LedgerEntry::new(
            date,
            EntryKind::Commodity(Commodity {
                currency: symbol.to_string(),
            }),
        );
        entry.meta = meta;
        entry.id = uuid::Uuid::new_v4().to_string();
        log::debug!("create {entry}: {}", Phase::Validate);
        entry.validate(&options)?;
        self.create_locked(entry)
    }

    fn lock(&self, operation: &str) -> Result<lock::LedgerLock, MutationError> {
        lock::acquire(&self.config.layout.folder, operation).map_err(|source| MutationError::Io {
            phase: Phase::Locate,
            source,
            rolled_back: false,
        })
    }

    /// Find the entry and return its span together with the file content the
    /// span was verified against.
    fn locate(
        &self,
        id: &str,
        hint: Option<&LocationHint>,
    ) -> Result<(LocatedSpan, String), MutationError> {
        log::debug!("{id}: {}", Phase::Locate);
        let hint = hint.map(|hint| (hint.file.as_path(), hint.line));
        let found = locator::locate_in_ledger(&self.root(), id, hint)?;
        let content = read(&found.file, Phase::Locate)?.unwrap_or_default();
        let span = locator::locate_in_content(&content, &found.file, id, Some(found.start_line))?;
        Ok((span, content))
    }

    fn should_move(&self, current: &Path, target: &Path) -> bool {
        if self.config.layout.mode != LayoutMode::Structured || current == target {
            return false;
        }
        // Only entries in files the layout owns are moved.
        current
            .strip_prefix(&self.config.layout.folder)
            .ok()
            .and_then(|relative| {
                ManagedFile::from_relative_path(
                    &relative.to_string_lossy(),
                    &self.config.layout.extension,
                )
            })
            .is_some()
    }

    fn apply(
        &self,
        kind: MutationKind,
        id: String,
        location: Option<SourceLocation>,
        mut edits: Vec<FileEdit>,
    ) -> Result<MutationOutcome, MutationError> {
        if self.config.layout.mode == LayoutMode::Structured {
            let pending: BTreeMap<PathBuf, String> = edits
                .iter()
                .map(|edit| (edit.path.clone(), edit.after.clone()))
                .collect();
            let planned = layout::planned_root(&self.config.layout, &pending).map_err(|source| {
                MutationError::Io {
                    phase: Phase::Write,
                    source,
                    rolled_back: false,
                }
            })?;
            if let Some(root_text) = planned {
                let root = self.root();
                let before = read(&root, Phase::Write)?;
                edits.push(FileEdit {
                    path: root,
                    before,
                    after: root_text,
                });
            }
        }

        log::debug!("{id}: {}", Phase::Snapshot);
        let backups = self.snapshot_all(&edits)?;

        log::debug!("{id}: {}", Phase::Write);
        let mut written: Vec<&FileEdit> = Vec::new();
        for edit in &edits {
            if let Err(source) = journal::atomic_write(&edit.path, edit.after.as_bytes()) {
                let cause = source.to_string();
                written.push(edit);
                self.rollback(&written, &cause, &backups)?;
                self.retention(&edits);
                return Err(MutationError::Io {
                    phase: Phase::Write,
                    source,
                    rolled_back: true,
                });
            }
            written.push(edit);
        }

        log::debug!("{id}: {}", Phase::ExternalValidate);
        if let Err(source) = self.validator.validate(&self.root()) {
            log::warn!("validator rejected {id}: {source}");
            self.rollback(&written, &source.to_string(), &backups)?;
            self.retention(&edits);
            return Err(MutationError::ExternalValidation { source, backups });
        }

        log::debug!("{id}: {}", Phase::Retention);
        let pruned_backups = self.retention(&edits);

        log::info!("{kind:?} {id}");
        Ok(MutationOutcome {
            kind,
            id,
            location,
            files_written: edits.into_iter().map(|edit| edit.path).collect(),
            backups,
            pruned_backups,
        })
    }

    fn snapshot_all(&self, edits: &[FileEdit]) -> Result<Vec<PathBuf>, MutationError> {
        let mut backups = Vec::new();
        if !self.config.backup.enabled {
            return Ok(backups);
        }
        for edit in edits.iter().filter(|edit| edit.before.is_some()) {
            match backup::snapshot(&edit.path) {
                Ok(Some(path)) => backups.push(path),
                Ok(None) => {}
                Err(err) if self.config.backup.strict => return Err(MutationError::Backup(err)),
                Err(err) => log::warn!("backup of {} failed: {err}", edit.path.display()),
            }
        }
        Ok(backups)
    }

    /// Put every written file back the way it was, newest write first.
    fn rollback(
        &self,
        written: &[&FileEdit],
        cause: &str,
        backups: &[PathBuf],
    ) -> Result<(), MutationError> {
        for edit in written.iter().rev() {
            let restored = match &edit.before {
                Some(before) => journal::atomic_write(&edit.path, before.as_bytes()),
                None => match std::fs::remove_file(&edit.path) {
                    Ok(()) => Ok(()),
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    Err(err) => Err(IoError::new(&edit.path, err)),
                },
            };
            if let Err(source) = restored {
                log::error!(
                    "rollback of {} failed: {source}; backups: {backups:?}",
                    edit.path.display()
                );
                return Err(MutationError::RollbackFailed {
                    cause: cause.to_string(),
                    source,
                    backups: backups.to_vec(),
                });
            }
            log::info!("rolled back {}", edit.path.display());
        }
        Ok(())
    }

    fn retention(&self, edits: &[FileEdit]) -> Vec<PathBuf> {
        let mut pruned = Vec::new();
        if !self.config.backup.enabled {
            return pruned;
        }
        for edit in edits {
            match backup::enforce_retention(&edit.path, self.config.backup.max_backup_files) {
                Ok(removed) => pruned.extend(removed),
                Err(err) => log::warn!("pruning backups of {} failed: {err}", edit.path.display()),
            }
        }
        pruned
    }
}

fn read(path: &Path, phase: Phase) -> Result<Option<String>, MutationError> {
    journal::read_optional(path).map_err(|source| MutationError::Io {
        phase,
        source,
        rolled_back: false,
    })
}

/// The span a block occupies at the end of `content`.
fn appended_location(file: &Path, content: &str, block: &str) -> SourceLocation {
    let total = content.lines().count();
    let block_lines = block.lines().count();
    SourceLocation {
        file: file.to_path_buf(),
        start_line: total + 1 - block_lines,
        end_line: total,
    }
}
