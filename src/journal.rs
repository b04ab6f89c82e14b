use crate::codec::{ContentIds, ParseError};
use crate::entry::{Flag, LedgerEntry, SourceLocation};
use crate::error::{IoContext, IoError};
use std::collections::BTreeSet;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Directive keywords the codec understands. Any other dated line (document,
/// query, custom, ...) is carried through as an opaque block.
const DIRECTIVE_KEYWORDS: &[&str] = &[
    "balance",
    "note",
    "pad",
    "open",
    "close",
    "price",
    "commodity",
    "event",
];

/// One blank-line-delimited chunk of a ledger file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Block {
    /// A directive the codec decoded.
    Directive { entry: LedgerEntry, text: String },
    /// `include "path"` as written.
    Include {
        target: String,
        line: usize,
        text: String,
    },
    /// Options, plugins, comments and directives this crate does not model.
    Other {
        start_line: usize,
        end_line: usize,
        text: String,
    },
}

impl Block {
    pub fn text(&self) -> &str {
        match self {
            Self::Directive { text, .. } | Self::Include { text, .. } | Self::Other { text, .. } => {
                text
            }
        }
    }

    pub fn entry(&self) -> Option<&LedgerEntry> {
        match self {
            Self::Directive { entry, .. } => Some(entry),
            _ => None,
        }
    }
}

/// Lines `start_line..=end_line` (1-based) of a file, as written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawBlock {
    pub start_line: usize,
    pub end_line: usize,
    pub text: String,
}

#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error(transparent)]
    Io(#[from] IoError),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// A block together with the file it was read from.
#[derive(Debug, Clone)]
pub struct SourcedBlock {
    pub file: PathBuf,
    pub block: Block,
}

/// Split file content into raw blocks: a block is a non-indented line plus
/// every indented line that follows it up to the next blank or non-indented
/// line. Runs of adjacent option, plugin and comment lines form one block.
pub fn split_blocks(content: &str) -> Vec<RawBlock> {
    let mut blocks: Vec<RawBlock> = Vec::new();
    let mut current: Option<RawBlock> = None;

    for (index, line) in content.lines().enumerate() {
        let line_no = index + 1;
        if line.trim().is_empty() {
            blocks.extend(current.take());
            continue;
        }
        let indented = line.starts_with([' ', '\t']);
        match current.as_mut() {
            Some(block) if indented || (is_loose(line) && is_loose(&block.text)) => {
                block.end_line = line_no;
                block.text.push_str(line);
                block.text.push('\n');
            }
            _ => {
                blocks.extend(current.take());
                current = Some(RawBlock {
                    start_line: line_no,
                    end_line: line_no,
                    text: format!("{line}\n"),
                });
            }
        }
    }
    blocks.extend(current);
    blocks
}

/// Undated, non-include lines (options, plugins, comments) that may share a
/// block with the lines around them.
fn is_loose(line: &str) -> bool {
    !line.starts_with(|ch: char| ch.is_ascii_digit() || ch.is_whitespace())
        && !line.starts_with("include")
}

/// Classify and decode every block of a file.
pub fn parse_blocks(content: &str, file: &Path) -> Result<Vec<Block>, ParseError> {
    let mut ids = ContentIds::default();
    split_blocks(content)
        .into_iter()
        .map(|raw| classify(raw, file, &mut ids))
        .collect()
}

pub(crate) fn classify(raw: RawBlock, file: &Path, ids: &mut ContentIds) -> Result<Block, ParseError> {
    let header = raw.text.lines().next().unwrap_or_default();
    let mut words = header.split_whitespace();
    let first = words.next().unwrap_or_default();
    let second = words.next().unwrap_or_default();

    if first == "include" {
        let target = header
            .trim_start_matches("include")
            .trim()
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .trim_matches('"')
            .to_string();
        return Ok(Block::Include {
            target,
            line: raw.start_line,
            text: raw.text,
        });
    }

    let dated = first.len() == 10 && first.as_bytes().first().is_some_and(u8::is_ascii_digit);
    let known = DIRECTIVE_KEYWORDS.contains(&second) || Flag::from_symbol(second).is_some();
    if !dated || !known || header.starts_with([' ', '\t']) {
        return Ok(Block::Other {
            start_line: raw.start_line,
            end_line: raw.end_line,
            text: raw.text,
        });
    }

    let mut entry =
        ids.decode_at(&raw.text, raw.start_line).map_err(|err| err.in_file(file))?;
    entry.source = Some(SourceLocation {
        file: file.to_path_buf(),
        start_line: raw.start_line,
        end_line: raw.end_line,
    });
    Ok(Block::Directive {
        entry,
        text: raw.text,
    })
}

pub fn read_blocks(path: &Path) -> Result<Vec<Block>, JournalError> {
    let content = fs::read_to_string(path).at(path)?;
    Ok(parse_blocks(&content, path)?)
}

/// Read a file, treating a missing file as empty.
pub fn read_optional(path: &Path) -> Result<Option<String>, IoError> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(Some(content)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(IoError::new(path, err)),
    }
}

/// Resolve an include target relative to the file that names it.
pub fn resolve_include(including_file: &Path, target: &str) -> PathBuf {
    let target = Path::new(target);
    if target.is_absolute() {
        return target.to_path_buf();
    }
    including_file
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(target)
}

/// Every block reachable from `root`, in document order, with each include
/// replaced by the blocks of the file it names. A file included twice is
/// only read the first time.
pub fn walk_ledger(root: &Path) -> Result<Vec<SourcedBlock>, JournalError> {
    let mut seen = BTreeSet::new();
    let mut out = Vec::new();
    walk_file(root, &mut seen, &mut out)?;
    Ok(out)
}

/// Every directive reachable from `root`, in document order.
pub fn read_entries(root: &Path) -> Result<Vec<LedgerEntry>, JournalError> {
    Ok(walk_ledger(root)?
        .into_iter()
        .filter_map(|sourced| match sourced.block {
            Block::Directive { entry, .. } => Some(entry),
            _ => None,
        })
        .collect())
}

/// Every file reachable from `root` through includes, root first.
pub fn ledger_files(root: &Path) -> Result<Vec<PathBuf>, JournalError> {
    let mut files = Vec::new();
    for sourced in walk_ledger(root)? {
        if !files.contains(&sourced.file) {
            files.push(sourced.file);
        }
    }
    if !files.iter().any(|file| file == root) {
        files.insert(0, root.to_path_buf());
    }
    Ok(files)
}

fn walk_file(
    path: &Path,
    seen: &mut BTreeSet<PathBuf>,
    out: &mut Vec<SourcedBlock>,
) -> Result<(), JournalError> {
    let key = fs::canonicalize(path).at(path)?;
    if !seen.insert(key) {
        log::warn!("skipping repeated include of {}", path.display());
        return Ok(());
    }
    for block in read_blocks(path)? {
        match &block {
            Block::Include { target, .. } => {
                let included = resolve_include(path, target);
                walk_file(&included, seen, out)?;
            }
            _ => out.push(SourcedBlock {
                file: path.to_path_buf(),
                block,
            }),
        }
    }
    Ok(())
}

/// Replace lines `start_line..=end_line` (1-based) with `replacement`,
/// leaving every other byte of `content` untouched.
pub fn splice_lines(content: &str, start_line: usize, end_line: usize, replacement: &str) -> String {
    let lines: Vec<&str> = content.split_inclusive('\n').collect();
    let start = start_line.saturating_sub(1).min(lines.len());
    let end = end_line.min(lines.len()).max(start);
    let mut out = String::with_capacity(content.len() + replacement.len());
    for line in &lines[..start] {
        out.push_str(line);
    }
    out.push_str(replacement);
    for line in &lines[end..] {
        out.push_str(line);
    }
    out
}

/// Remove a block's lines along with one blank separator line, so deleting
/// does not leave a growing run of empty lines behind.
pub fn remove_lines(content: &str, start_line: usize, end_line: usize) -> String {
    let lines: Vec<&str> = content.split_inclusive('\n').collect();
    let is_blank = |index: usize| lines.get(index).is_some_and(|line| line.trim().is_empty());
    let (mut start, mut end) = (start_line.saturating_sub(1), end_line);
    if is_blank(end) {
        end += 1;
    } else if start > 0 && is_blank(start - 1) {
        start -= 1;
    }
    splice_lines(content, start + 1, end, "")
}

/// Append a block after existing content, separated by one blank line.
pub fn append_block(content: &str, block: &str) -> String {
    let mut out = content.to_string();
    if !out.is_empty() {
        if !out.ends_with('\n') {
            out.push('\n');
        }
        if !out.ends_with("\n\n") {
            out.push('\n');
        }
    }
    out.push_str(block);
    out
}

/// Write via a sibling temp file and rename, so readers never see a
/// partially written ledger.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<(), IoError> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent).at(parent)?;
    }
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "ledger".to_string());
    let temp_path = path.with_file_name(format!(".{file_name}.tmp"));
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&temp_path)
        .at(&temp_path)?;
    file.write_all(content).at(&temp_path)?;
    file.sync_all().at(&temp_path)?;
    drop(file);
    fs::rename(&temp_path, path).at(path)?;
    Ok(())
}
