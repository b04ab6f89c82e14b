//! Convert between a single ledger file and the structured layout.

use crate::error::{IoContext, IoError};
use crate::journal::{self, Block, JournalError};
use crate::layout::{self, LayoutConfig};
use crate::lock;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigratedFile {
    pub path: PathBuf,
    pub entries: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationOutcome {
    pub dry_run: bool,
    /// Files written (or that would be written), root last.
    pub files: Vec<MigratedFile>,
    pub entries: usize,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MigrationOptions {
    /// Replace managed files that already hold content.
    pub overwrite: bool,
    /// Plan and report without writing anything.
    pub dry_run: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum MigrationError {
    #[error("{} already exists", path.display())]
    Conflict { path: PathBuf },
    #[error("{} is part of the source ledger and cannot be a destination", path.display())]
    SourceIsDestination { path: PathBuf },
    #[error(transparent)]
    Io(#[from] IoError),
    #[error(transparent)]
    Journal(#[from] JournalError),
    #[error("undoing a partial migration after \"{cause}\" failed: {source}")]
    RollbackFailed {
        cause: String,
        #[source]
        source: IoError,
    },
}

/// Split the ledger at `single_file` (and anything it includes) into the
/// structured layout under `config.folder`. The source files are not
/// modified. If a write fails, files written so far are put back.
pub fn to_structured(
    single_file: &Path,
    config: &LayoutConfig,
    options: MigrationOptions,
) -> Result<MigrationOutcome, MigrationError> {
    let _locks = lock_unless_dry_run(
        &[&config.folder, parent_dir(single_file)],
        "migrate to-structured",
        options,
    )?;
    let blocks = journal::walk_ledger(single_file)?;
    let mut outcome = MigrationOutcome {
        dry_run: options.dry_run,
        ..MigrationOutcome::default()
    };

    let mut groups: BTreeMap<PathBuf, Vec<String>> = BTreeMap::new();
    let mut preamble: Vec<String> = Vec::new();
    let mut sources: Vec<PathBuf> = Vec::new();
    for sourced in blocks {
        if !sources.contains(&sourced.file) {
            sources.push(sourced.file.clone());
        }
        match sourced.block {
            Block::Directive { entry, text } => {
                let target = config.folder.join(layout::target_file(&entry, config));
                groups.entry(target).or_default().push(text);
                outcome.entries += 1;
            }
            Block::Other { text, start_line, .. } => {
                if is_tag_stack(&text) {
                    outcome.warnings.push(format!(
                        "{}:{start_line}: pushtag/poptag moved to the root file no longer applies to the entries it surrounded",
                        sourced.file.display()
                    ));
                }
                preamble.push(text.trim_end().to_string());
            }
            Block::Include { .. } => {}
        }
    }
    if !sources.iter().any(|source| source == single_file) {
        sources.push(single_file.to_path_buf());
    }

    let root = config.root_file();
    check_not_source(&root, &sources)?;
    for target in groups.keys() {
        check_not_source(target, &sources)?;
        if !options.overwrite && has_content(target)? {
            return Err(MigrationError::Conflict {
                path: target.clone(),
            });
        }
    }
    if !options.overwrite && has_content(&root)? {
        return Err(MigrationError::Conflict { path: root });
    }

    let pending: BTreeMap<PathBuf, String> = groups
        .iter()
        .map(|(path, texts)| (path.clone(), texts.join("\n")))
        .collect();
    let files = layout::populated_files_with(config, &pending)?;
    let root_text = layout::render_root(&preamble.join("\n\n"), &files, &config.extension);

    for (path, texts) in &groups {
        outcome.files.push(MigratedFile {
            path: path.clone(),
            entries: texts.len(),
        });
    }
    outcome.files.push(MigratedFile {
        path: root.clone(),
        entries: 0,
    });

    if options.dry_run {
        return Ok(outcome);
    }

    let mut writes: Vec<(PathBuf, String)> = pending.into_iter().collect();
    let written_files = writes.len();
    writes.push((root, root_text));
    write_all(&writes)?;
    log::info!(
        "migrated {} entries from {} into {} files under {}",
        outcome.entries,
        single_file.display(),
        written_files,
        config.folder.display()
    );
    Ok(outcome)
}

/// Concatenate the structured ledger at `structured_root` into the single
/// file `destination`, following includes in declared order.
pub fn to_single(
    structured_root: &Path,
    destination: &Path,
    options: MigrationOptions,
) -> Result<MigrationOutcome, MigrationError> {
    if destination.exists() {
        return Err(MigrationError::Conflict {
            path: destination.to_path_buf(),
        });
    }
    let _locks = lock_unless_dry_run(
        &[parent_dir(structured_root), parent_dir(destination)],
        "migrate to-single",
        options,
    )?;
    // Checked again now that no other writer can create it.
    if destination.exists() {
        return Err(MigrationError::Conflict {
            path: destination.to_path_buf(),
        });
    }

    let blocks = journal::walk_ledger(structured_root)?;
    let mut outcome = MigrationOutcome {
        dry_run: options.dry_run,
        ..MigrationOutcome::default()
    };
    let mut texts = Vec::with_capacity(blocks.len());
    for sourced in &blocks {
        if sourced.block.entry().is_some() {
            outcome.entries += 1;
        }
        texts.push(sourced.block.text().trim_end());
    }
    let mut content = texts.join("\n\n");
    if !content.is_empty() {
        content.push('\n');
    }
    outcome.files.push(MigratedFile {
        path: destination.to_path_buf(),
        entries: outcome.entries,
    });

    if options.dry_run {
        return Ok(outcome);
    }

    journal::atomic_write(destination, content.as_bytes())?;
    log::info!(
        "wrote {} entries from {} to {}",
        outcome.entries,
        structured_root.display(),
        destination.display()
    );
    Ok(outcome)
}

fn parent_dir(path: &Path) -> &Path {
    path.parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

fn lock_unless_dry_run(
    dirs: &[&Path],
    operation: &str,
    options: MigrationOptions,
) -> Result<Vec<lock::LedgerLock>, IoError> {
    if options.dry_run {
        return Ok(Vec::new());
    }
    lock::acquire_all(dirs, operation)
}

/// Write every file in order. When one fails, the files already written
/// get their previous content back, or are removed if they are new.
fn write_all(writes: &[(PathBuf, String)]) -> Result<(), MigrationError> {
    let mut done: Vec<(&Path, Option<String>)> = Vec::new();
    for (path, content) in writes {
        let before = journal::read_optional(path)?;
        if let Err(err) = journal::atomic_write(path, content.as_bytes()) {
            log::warn!("migration write failed, undoing {} files: {err}", done.len());
            undo_writes(&done).map_err(|source| MigrationError::RollbackFailed {
                cause: err.to_string(),
                source,
            })?;
            return Err(err.into());
        }
        done.push((path, before));
    }
    Ok(())
}

fn undo_writes(done: &[(&Path, Option<String>)]) -> Result<(), IoError> {
    for (path, before) in done.iter().rev() {
        match before {
            Some(content) => journal::atomic_write(path, content.as_bytes())?,
            None => fs::remove_file(path).at(path)?,
        }
        log::info!("undid migration write to {}", path.display());
    }
    Ok(())
}

fn has_content(path: &Path) -> Result<bool, IoError> {
    Ok(journal::read_optional(path)?.is_some_and(|content| !content.trim().is_empty()))
}

fn check_not_source(path: &Path, sources: &[PathBuf]) -> Result<(), MigrationError> {
    let Ok(canonical) = fs::canonicalize(path) else {
        // Does not exist yet, so it cannot be one of the sources.
        return Ok(());
    };
    for source in sources {
        if fs::canonicalize(source).is_ok_and(|source| source == canonical) {
            return Err(MigrationError::SourceIsDestination {
                path: path.to_path_buf(),
            });
        }
    }
    Ok(())
}

fn is_tag_stack(text: &str) -> bool {
    let first = text.split_whitespace().next().unwrap_or_default();
    first == "pushtag" || first == "poptag"
}
