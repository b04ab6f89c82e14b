//! Find the exact lines a directive occupies, given its id and a possibly
//! stale `(file, line)` hint from an earlier query snapshot.

use crate::codec::ParseError;
use crate::entry::LedgerEntry;
use crate::error::{IoContext, IoError};
use crate::journal::{self, Block, JournalError};
use std::fs;
use std::path::{Path, PathBuf};

/// Where a directive currently lives, re-verified against the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocatedSpan {
    pub file: PathBuf,
    /// 1-based, inclusive; includes trailing metadata lines.
    pub start_line: usize,
    pub end_line: usize,
    pub entry: LedgerEntry,
    /// The block's text exactly as it appears in the file.
    pub text: String,
}

#[derive(Debug, thiserror::Error)]
pub enum LocatorError {
    #[error("entry {id} not found in {}", file.display())]
    NotFound { id: String, file: PathBuf },
    #[error(
        "entry {id} occurs {} times in {} and the hint matches none of them (lines {lines:?})",
        lines.len(),
        file.display()
    )]
    Stale {
        id: String,
        file: PathBuf,
        lines: Vec<usize>,
    },
    #[error(transparent)]
    Io(#[from] IoError),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

impl From<JournalError> for LocatorError {
    fn from(err: JournalError) -> Self {
        match err {
            JournalError::Io(err) => Self::Io(err),
            JournalError::Parse(err) => Self::Parse(err),
        }
    }
}

/// Locate `id` in `file`. A match covering `hint_line` wins; otherwise
/// the id must occur exactly once in the file.
pub fn locate(file: &Path, id: &str, hint_line: Option<usize>) -> Result<LocatedSpan, LocatorError> {
    let content = fs::read_to_string(file).at(file)?;
    locate_in_content(&content, file, id, hint_line)
}

pub fn locate_in_content(
    content: &str,
    file: &Path,
    id: &str,
    hint_line: Option<usize>,
) -> Result<LocatedSpan, LocatorError> {
    // Every block is decoded: content ids depend on the blocks before them.
    let mut found: Vec<LocatedSpan> = journal::parse_blocks(content, file)?
        .into_iter()
        .filter_map(|block| match block {
            Block::Directive { entry, text } if entry.id == id => span_of(file, entry, text),
            _ => None,
        })
        .collect();

    if let Some(line) = hint_line {
        if let Some(index) = found
            .iter()
            .position(|span| span.start_line <= line && line <= span.end_line)
        {
            return Ok(found.swap_remove(index));
        }
        log::debug!(
            "hint {}:{line} for {id} is stale, scanning the whole file",
            file.display()
        );
    }

    match found.len() {
        0 => Err(LocatorError::NotFound {
            id: id.to_string(),
            file: file.to_path_buf(),
        }),
        1 => Ok(found.remove(0)),
        _ => Err(LocatorError::Stale {
            id: id.to_string(),
            file: file.to_path_buf(),
            lines: found.iter().map(|span| span.start_line).collect(),
        }),
    }
}

/// Locate `id` anywhere in the ledger rooted at `root`. A hinted file is
/// searched first; the others are only searched when it misses.
pub fn locate_in_ledger(
    root: &Path,
    id: &str,
    hint: Option<(&Path, usize)>,
) -> Result<LocatedSpan, LocatorError> {
    if let Some((file, line)) = hint {
        match locate(file, id, Some(line)) {
            Err(LocatorError::NotFound { .. }) => {}
            Err(LocatorError::Io(err)) if err.source.kind() == std::io::ErrorKind::NotFound => {}
            other => return other,
        }
    }

    let mut found = Vec::new();
    for file in journal::ledger_files(root)? {
        if hint.is_some_and(|(hinted, _)| hinted == file) {
            continue;
        }
        match locate(&file, id, None) {
            Ok(span) => found.push(span),
            Err(LocatorError::NotFound { .. }) => {}
            Err(err) => return Err(err),
        }
    }
    match found.len() {
        0 => Err(LocatorError::NotFound {
            id: id.to_string(),
            file: root.to_path_buf(),
        }),
        1 => Ok(found.remove(0)),
        _ => Err(LocatorError::Stale {
            id: id.to_string(),
            file: root.to_path_buf(),
            lines: found.iter().map(|span| span.start_line).collect(),
        }),
    }
}

fn span_of(file: &Path, entry: LedgerEntry, text: String) -> Option<LocatedSpan> {
    let source = entry.source.clone()?;
    Some(LocatedSpan {
        file: file.to_path_buf(),
        start_line: source.start_line,
        end_line: source.end_line,
        entry,
        text,
    })
}
