//! Which file a directive belongs to, and the root file that includes them.

use crate::codec::ContentIds;
use crate::entry::{EntryKind, LedgerEntry};
use crate::error::{IoContext, IoError};
use crate::journal::{self, Block};
use chrono::Datelike;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_EXTENSION: &str = "beancount";
pub const DEFAULT_ROOT_STEM: &str = "ledger";
pub const TRANSACTIONS_DIR: &str = "transactions";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutMode {
    /// Every directive lives in the root file.
    Single,
    /// Directives are routed to per-type files included from the root.
    #[default]
    Structured,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    pub mode: LayoutMode,
    /// Directory holding the root file and every managed file.
    pub folder: PathBuf,
    /// File extension without the dot.
    pub extension: String,
    pub root_stem: String,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            mode: LayoutMode::default(),
            folder: PathBuf::from("."),
            extension: DEFAULT_EXTENSION.to_string(),
            root_stem: DEFAULT_ROOT_STEM.to_string(),
        }
    }
}

impl LayoutConfig {
    /// Layout whose root is `root_file`, e.g. `books/ledger.beancount`.
    pub fn for_root_file(root_file: &Path, mode: LayoutMode) -> Self {
        let defaults = Self::default();
        Self {
            mode,
            folder: root_file
                .parent()
                .filter(|parent| !parent.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or(defaults.folder),
            extension: root_file
                .extension()
                .map(|ext| ext.to_string_lossy().into_owned())
                .unwrap_or(defaults.extension),
            root_stem: root_file
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or(defaults.root_stem),
        }
    }

    pub fn root_file(&self) -> PathBuf {
        self.folder
            .join(format!("{}.{}", self.root_stem, self.extension))
    }

    /// Absolute (folder-joined) path of the file `entry` is written to.
    pub fn file_for(&self, entry: &LedgerEntry) -> PathBuf {
        match self.mode {
            LayoutMode::Single => self.root_file(),
            LayoutMode::Structured => self.folder.join(target_file(entry, self)),
        }
    }
}

/// A file of the structured layout. The derived order is the include order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ManagedFile {
    Accounts,
    Commodities,
    Prices,
    Balances,
    Pads,
    Notes,
    Events,
    Transactions(i32),
}

const FIXED_FILES: [(ManagedFile, &str); 7] = [
    (ManagedFile::Accounts, "accounts"),
    (ManagedFile::Commodities, "commodities"),
    (ManagedFile::Prices, "prices"),
    (ManagedFile::Balances, "balances"),
    (ManagedFile::Pads, "pads"),
    (ManagedFile::Notes, "notes"),
    (ManagedFile::Events, "events"),
];

impl ManagedFile {
    pub fn for_entry(entry: &LedgerEntry) -> Self {
        match &entry.kind {
            EntryKind::Open(_) | EntryKind::Close(_) => Self::Accounts,
            EntryKind::Commodity(_) => Self::Commodities,
            EntryKind::Price(_) => Self::Prices,
            EntryKind::Balance(_) => Self::Balances,
            EntryKind::Pad(_) => Self::Pads,
            EntryKind::Note(_) => Self::Notes,
            EntryKind::Event(_) => Self::Events,
            EntryKind::Transaction(_) => Self::Transactions(entry.date.year()),
        }
    }

    /// Path relative to the layout folder, always `/`-separated so it can be
    /// written into an include statement as is.
    pub fn relative_path(self, extension: &str) -> String {
        match self {
            Self::Transactions(year) => format!("{TRANSACTIONS_DIR}/{year}.{extension}"),
            fixed => {
                let stem = FIXED_FILES
                    .iter()
                    .find(|(file, _)| *file == fixed)
                    .map(|(_, stem)| *stem)
                    .unwrap_or_default();
                format!("{stem}.{extension}")
            }
        }
    }

    /// Inverse of [`ManagedFile::relative_path`].
    pub fn from_relative_path(path: &str, extension: &str) -> Option<Self> {
        let path = path.replace('\\', "/");
        let stem = path.strip_suffix(&format!(".{extension}"))?;
        if let Some(year) = stem.strip_prefix(&format!("{TRANSACTIONS_DIR}/")) {
            if year.len() == 4 && year.bytes().all(|b| b.is_ascii_digit()) {
                return year.parse().ok().map(Self::Transactions);
            }
            return None;
        }
        FIXED_FILES
            .iter()
            .find(|(_, name)| *name == stem)
            .map(|(file, _)| *file)
    }
}

/// Relative path of the file `entry` belongs to in the structured layout.
pub fn target_file(entry: &LedgerEntry, config: &LayoutConfig) -> PathBuf {
    PathBuf::from(ManagedFile::for_entry(entry).relative_path(&config.extension))
}

/// Managed files under `config.folder` that currently hold at least one
/// directive.
pub fn populated_files(config: &LayoutConfig) -> Result<BTreeSet<ManagedFile>, IoError> {
    populated_files_with(config, &BTreeMap::new())
}

/// Like [`populated_files`], but `pending` content stands in for what is on
/// disk, so a write plan can be checked before anything is written.
pub fn populated_files_with(
    config: &LayoutConfig,
    pending: &BTreeMap<PathBuf, String>,
) -> Result<BTreeSet<ManagedFile>, IoError> {
    let mut candidates: Vec<ManagedFile> = FIXED_FILES.iter().map(|(file, _)| *file).collect();
    let transactions_dir = config.folder.join(TRANSACTIONS_DIR);
    match fs::read_dir(&transactions_dir) {
        Ok(entries) => {
            for dir_entry in entries {
                let dir_entry = dir_entry.at(&transactions_dir)?;
                let name = dir_entry.file_name().to_string_lossy().into_owned();
                let relative = format!("{TRANSACTIONS_DIR}/{name}");
                if let Some(file) = ManagedFile::from_relative_path(&relative, &config.extension) {
                    candidates.push(file);
                }
            }
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(IoError::new(transactions_dir, err)),
    }

    for path in pending.keys() {
        let relative = path
            .strip_prefix(&config.folder)
            .ok()
            .map(|relative| relative.to_string_lossy().into_owned());
        if let Some(file) = relative
            .and_then(|relative| ManagedFile::from_relative_path(&relative, &config.extension))
        {
            candidates.push(file);
        }
    }

    let mut populated = BTreeSet::new();
    for file in candidates {
        let path = config.folder.join(file.relative_path(&config.extension));
        let content = match pending.get(&path) {
            Some(content) => Some(content.clone()),
            None => journal::read_optional(&path)?,
        };
        if content.is_some_and(|content| has_directive(&content)) {
            populated.insert(file);
        }
    }
    Ok(populated)
}

fn has_directive(content: &str) -> bool {
    journal::split_blocks(content).iter().any(|block| {
        let first = block.text.trim_start();
        !first.starts_with(';') && !first.starts_with('#')
    })
}

/// Root file text: `preamble`, then one include per managed file.
pub fn render_root(preamble: &str, files: &BTreeSet<ManagedFile>, extension: &str) -> String {
    let mut out = String::new();
    let preamble = preamble.trim_end();
    if !preamble.is_empty() {
        out.push_str(preamble);
        out.push_str("\n\n");
    }
    for file in files {
        out.push_str(&format!("include \"{}\"\n", file.relative_path(extension)));
    }
    out
}

/// Split an existing root file into the part this crate does not manage
/// (options, plugins, comments, foreign includes) and drop the managed
/// includes.
pub fn root_preamble(content: &str, root: &Path, extension: &str) -> String {
    let mut kept: Vec<String> = Vec::new();
    let mut ids = ContentIds::default();
    for raw in journal::split_blocks(content) {
        let managed_include = matches!(
            journal::classify(raw.clone(), root, &mut ids),
            Ok(Block::Include { ref target, .. })
                if ManagedFile::from_relative_path(target, extension).is_some()
        );
        if !managed_include {
            kept.push(raw.text.trim_end().to_string());
        }
    }
    kept.join("\n\n")
}

/// Rewrite the root file so its include list matches the populated managed
/// files. Returns whether the file changed.
pub fn regenerate_root(config: &LayoutConfig) -> Result<bool, IoError> {
    let Some(rendered) = planned_root(config, &BTreeMap::new())? else {
        return Ok(false);
    };
    let root = config.root_file();
    journal::atomic_write(&root, rendered.as_bytes())?;
    log::info!("regenerated {}", root.display());
    Ok(true)
}

/// The root file text once `pending` has been written, or `None` when the
/// current root already matches.
pub fn planned_root(
    config: &LayoutConfig,
    pending: &BTreeMap<PathBuf, String>,
) -> Result<Option<String>, IoError> {
    let root = config.root_file();
    let existing = match pending.get(&root) {
        Some(content) => content.clone(),
        None => journal::read_optional(&root)?.unwrap_or_default(),
    };
    let preamble = root_preamble(&existing, &root, &config.extension);
    let files = populated_files_with(config, pending)?;
    let rendered = render_root(&preamble, &files, &config.extension);
    Ok((rendered != existing).then_some(rendered))
}
