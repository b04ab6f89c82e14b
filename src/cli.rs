use crate::config::{self, EngineConfig};
use crate::entry::{LedgerEntry, MetaValue, Metadata};
use crate::layout::{LayoutConfig, LayoutMode};
use crate::migration::{self, MigrationOptions};
use crate::mutation::{LocationHint, MutationEngine};
use crate::{backup, locator, validator};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use std::error::Error;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "beanfile", version = crate::version::APP_VERSION)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Append a new entry read as JSON.
    Add(AddArgs),
    /// Replace an existing entry.
    Update(UpdateArgs),
    /// Remove an entry.
    Delete(DeleteArgs),
    /// Print where an entry currently lives.
    Locate(LocateArgs),
    /// Declare a commodity, or replace the metadata of its declaration.
    Commodity(CommodityArgs),
    Migrate(MigrateArgs),
    Backups(BackupsArgs),
}

#[derive(Args, Clone)]
struct LedgerArgs {
    /// Root ledger file; `beanfile.json` is read from its directory. Without
    /// it, `beanfile.json` in the current directory names the layout.
    #[arg(long)]
    ledger: Option<PathBuf>,
    /// Write every entry into the root file.
    #[arg(long, conflicts_with = "structured")]
    single: bool,
    /// Route entries to per-type files included from the root.
    #[arg(long)]
    structured: bool,
    #[arg(long)]
    no_validate: bool,
    #[arg(long)]
    no_backup: bool,
    #[arg(long, value_name = "N")]
    max_backup_files: Option<usize>,
    #[arg(long, value_name = "PROGRAM")]
    validator: Option<String>,
}

#[derive(Args)]
struct AddArgs {
    #[command(flatten)]
    ledger: LedgerArgs,
    /// JSON entry file, or `-` for stdin.
    #[arg(long, value_name = "PATH", default_value = "-")]
    json: PathBuf,
}

#[derive(Args)]
struct HintArgs {
    /// File the entry was last seen in.
    #[arg(long, requires = "line")]
    file: Option<PathBuf>,
    /// Line the entry was last seen at.
    #[arg(long)]
    line: Option<usize>,
}

impl HintArgs {
    fn hint(&self, root: &Path) -> Option<LocationHint> {
        let line = self.line?;
        let file = self.file.clone().unwrap_or_else(|| root.to_path_buf());
        Some(LocationHint { file, line })
    }
}

#[derive(Args)]
struct UpdateArgs {
    #[command(flatten)]
    ledger: LedgerArgs,
    #[arg(long)]
    id: String,
    #[command(flatten)]
    hint: HintArgs,
    #[arg(long, value_name = "PATH", default_value = "-")]
    json: PathBuf,
}

#[derive(Args)]
struct DeleteArgs {
    #[command(flatten)]
    ledger: LedgerArgs,
    #[arg(long)]
    id: String,
    #[command(flatten)]
    hint: HintArgs,
}

#[derive(Args)]
struct LocateArgs {
    #[arg(long)]
    ledger: Option<PathBuf>,
    #[arg(long)]
    id: String,
    #[command(flatten)]
    hint: HintArgs,
}

#[derive(Args)]
struct CommodityArgs {
    #[command(flatten)]
    ledger: LedgerArgs,
    #[arg(long)]
    symbol: String,
    /// Metadata as `key=value`; repeatable. Replaces all existing metadata.
    #[arg(long = "meta", value_name = "KEY=VALUE", value_parser = parse_meta_pair)]
    meta: Vec<(String, String)>,
    /// Date of a new declaration; defaults to the earliest directive.
    #[arg(long, value_name = "YYYY-MM-DD")]
    date: Option<NaiveDate>,
}

fn parse_meta_pair(value: &str) -> Result<(String, String), String> {
    value
        .split_once('=')
        .map(|(key, value)| (key.trim().to_string(), value.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{value}'"))
}

#[derive(Args)]
struct MigrateArgs {
    #[command(subcommand)]
    command: MigrateCommand,
}

#[derive(Subcommand)]
enum MigrateCommand {
    /// Split a single ledger file into the structured layout.
    ToStructured(ToStructuredArgs),
    /// Concatenate a structured ledger into one file.
    ToSingle(ToSingleArgs),
}

#[derive(Args)]
struct ToStructuredArgs {
    /// The single ledger file to split.
    #[arg(long, value_name = "FILE")]
    source: PathBuf,
    /// Root file of the structured layout to create; defaults to the
    /// layout in `beanfile.json`.
    #[arg(long)]
    ledger: Option<PathBuf>,
    #[arg(long)]
    overwrite: bool,
    #[arg(long)]
    dry_run: bool,
}

#[derive(Args)]
struct ToSingleArgs {
    #[arg(long)]
    ledger: Option<PathBuf>,
    #[arg(long, value_name = "FILE")]
    output: PathBuf,
    #[arg(long)]
    dry_run: bool,
}

#[derive(Args)]
struct BackupsArgs {
    #[command(subcommand)]
    command: BackupsCommand,
}

#[derive(Subcommand)]
enum BackupsCommand {
    List(BackupFileArgs),
    Prune(BackupPruneArgs),
}

#[derive(Args)]
struct BackupFileArgs {
    #[arg(long, value_name = "FILE")]
    file: PathBuf,
}

#[derive(Args)]
struct BackupPruneArgs {
    #[arg(long, value_name = "FILE")]
    file: PathBuf,
    /// Backups to keep; defaults to `backup.max_backup_files`.
    #[arg(long, value_name = "N")]
    keep: Option<usize>,
}

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct CliLocatedEntry {
    file: PathBuf,
    start_line: usize,
    end_line: usize,
    entry: LedgerEntry,
}

#[derive(serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct CliBackup {
    path: PathBuf,
    taken_at: String,
}

pub fn run() -> Result<(), Box<dyn Error>> {
    init_logging();
    let cli = Cli::parse();
    match cli.command {
        Commands::Add(args) => run_add(args),
        Commands::Update(args) => run_update(args),
        Commands::Delete(args) => run_delete(args),
        Commands::Locate(args) => run_locate(args),
        Commands::Commodity(args) => run_commodity(args),
        Commands::Migrate(args) => run_migrate(args),
        Commands::Backups(args) => run_backups(args),
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn ledger_dir(ledger: &Path) -> PathBuf {
    match ledger.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// `beanfile.json` from the ledger's directory with command-line overrides
/// applied.
fn resolve_config(args: &LedgerArgs) -> Result<EngineConfig, Box<dyn Error>> {
    resolve_config_in(args, Path::new("."))
}

/// Like [`resolve_config`], reading `beanfile.json` from `default_dir` when
/// no `--ledger` is given. An explicit ledger replaces the configured layout
/// folder and root name; otherwise the configured layout is kept.
fn resolve_config_in(args: &LedgerArgs, default_dir: &Path) -> Result<EngineConfig, Box<dyn Error>> {
    let mut config = match &args.ledger {
        Some(ledger) => {
            let mut config = config::load(&ledger_dir(ledger))?;
            config.layout = LayoutConfig::for_root_file(ledger, config.layout.mode);
            config
        }
        None => config::load(default_dir)?,
    };
    if args.single {
        config.layout.mode = LayoutMode::Single;
    } else if args.structured {
        config.layout.mode = LayoutMode::Structured;
    }
    if args.no_validate {
        config.validator.enabled = false;
    }
    if let Some(program) = &args.validator {
        config.validator.program = program.clone();
    }
    if args.no_backup {
        config.backup.enabled = false;
    }
    if let Some(max) = args.max_backup_files {
        config.backup.max_backup_files = max;
    }
    Ok(config)
}

fn read_text_input(path: &Path) -> Result<String, Box<dyn Error>> {
    if path.as_os_str() == "-" {
        let mut buffer = String::new();
        std::io::stdin().read_to_string(&mut buffer)?;
        return Ok(buffer);
    }
    Ok(std::fs::read_to_string(path)?)
}

fn read_entry(path: &Path) -> Result<LedgerEntry, Box<dyn Error>> {
    let text = read_text_input(path)?;
    if text.trim().is_empty() {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidInput, "entry JSON is empty").into());
    }
    Ok(serde_json::from_str(&text)?)
}

fn run_add(args: AddArgs) -> Result<(), Box<dyn Error>> {
    let config = resolve_config(&args.ledger)?;
    let entry = read_entry(&args.json)?;
    let validator = validator::from_config(&config.validator);
    let outcome = MutationEngine::new(&config, validator.as_ref()).create(entry)?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

fn run_update(args: UpdateArgs) -> Result<(), Box<dyn Error>> {
    let config = resolve_config(&args.ledger)?;
    let entry = read_entry(&args.json)?;
    let hint = args.hint.hint(&config.layout.root_file());
    let validator = validator::from_config(&config.validator);
    let outcome =
        MutationEngine::new(&config, validator.as_ref()).update(&args.id, entry, hint.as_ref())?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

fn run_delete(args: DeleteArgs) -> Result<(), Box<dyn Error>> {
    let config = resolve_config(&args.ledger)?;
    let hint = args.hint.hint(&config.layout.root_file());
    let validator = validator::from_config(&config.validator);
    let outcome = MutationEngine::new(&config, validator.as_ref()).delete(&args.id, hint.as_ref())?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

/// The given ledger, else the root named by `beanfile.json` in the current
/// directory.
fn root_or_configured(ledger: Option<&Path>) -> Result<PathBuf, Box<dyn Error>> {
    match ledger {
        Some(ledger) => Ok(ledger.to_path_buf()),
        None => Ok(config::load(Path::new("."))?.layout.root_file()),
    }
}

fn run_locate(args: LocateArgs) -> Result<(), Box<dyn Error>> {
    let root = root_or_configured(args.ledger.as_deref())?;
    let hint = args.hint.hint(&root);
    let span = locator::locate_in_ledger(
        &root,
        &args.id,
        hint.as_ref().map(|hint| (hint.file.as_path(), hint.line)),
    )?;
    let located = CliLocatedEntry {
        file: span.file,
        start_line: span.start_line,
        end_line: span.end_line,
        entry: span.entry,
    };
    println!("{}", serde_json::to_string_pretty(&located)?);
    Ok(())
}

fn run_commodity(args: CommodityArgs) -> Result<(), Box<dyn Error>> {
    let config = resolve_config(&args.ledger)?;
    let meta: Metadata = args
        .meta
        .into_iter()
        .map(|(key, value)| (key, MetaValue::String(value)))
        .collect();
    let validator = validator::from_config(&config.validator);
    let outcome = MutationEngine::new(&config, validator.as_ref()).upsert_commodity(
        &args.symbol,
        meta,
        args.date,
    )?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

fn run_migrate(args: MigrateArgs) -> Result<(), Box<dyn Error>> {
    let outcome = match args.command {
        MigrateCommand::ToStructured(args) => {
            let layout = match &args.ledger {
                Some(ledger) => LayoutConfig::for_root_file(ledger, LayoutMode::Structured),
                None => LayoutConfig {
                    mode: LayoutMode::Structured,
                    ..config::load(Path::new("."))?.layout
                },
            };
            migration::to_structured(
                &args.source,
                &layout,
                MigrationOptions {
                    overwrite: args.overwrite,
                    dry_run: args.dry_run,
                },
            )?
        }
        MigrateCommand::ToSingle(args) => migration::to_single(
            &root_or_configured(args.ledger.as_deref())?,
            &args.output,
            MigrationOptions {
                overwrite: false,
                dry_run: args.dry_run,
            },
        )?,
    };
    for warning in &outcome.warnings {
        eprintln!("warning: {warning}");
    }
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

fn run_backups(args: BackupsArgs) -> Result<(), Box<dyn Error>> {
    match args.command {
        BackupsCommand::List(args) => {
            let listed: Vec<CliBackup> = backup::list_backups(&args.file)?
                .into_iter()
                .map(|backup| CliBackup {
                    path: backup.path,
                    taken_at: backup.taken_at.format("%Y-%m-%dT%H:%M:%S").to_string(),
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&listed)?);
        }
        BackupsCommand::Prune(args) => {
            let keep = match args.keep {
                Some(keep) => keep,
                None => config::load(&ledger_dir(&args.file))?.backup.max_backup_files,
            };
            let removed = backup::enforce_retention(&args.file, keep)?;
            println!("Removed {} backup(s).", removed.len());
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::{resolve_config, resolve_config_in, Cli, Commands, MigrateCommand};
    use crate::config::{self, EngineConfig};
    use crate::layout::{LayoutConfig, LayoutMode};
    use clap::Parser;
    use std::path::{Path, PathBuf};

    #[test]
    fn parses_update_with_hint() {
        let cli = Cli::try_parse_from([
            "beanfile",
            "update",
            "--ledger",
            "books/ledger.beancount",
            "--id",
            "abc",
            "--file",
            "books/accounts.beancount",
            "--line",
            "12",
            "--json",
            "entry.json",
            "--no-validate",
        ])
        .unwrap();
        let Commands::Update(args) = cli.command else {
            panic!("expected update");
        };
        assert_eq!(args.id, "abc");
        let hint = args.hint.hint(Path::new("books/ledger.beancount")).unwrap();
        assert_eq!(hint.file, PathBuf::from("books/accounts.beancount"));
        assert_eq!(hint.line, 12);
        assert!(args.ledger.no_validate);
    }

    #[test]
    fn hint_file_requires_line() {
        assert!(Cli::try_parse_from([
            "beanfile",
            "delete",
            "--id",
            "abc",
            "--file",
            "x.beancount",
        ])
        .is_err());
    }

    #[test]
    fn single_and_structured_conflict() {
        assert!(Cli::try_parse_from(["beanfile", "add", "--single", "--structured"]).is_err());
    }

    #[test]
    fn parses_migrate_to_single() {
        let cli = Cli::try_parse_from([
            "beanfile",
            "migrate",
            "to-single",
            "--ledger",
            "books/ledger.beancount",
            "--output",
            "all.beancount",
        ])
        .unwrap();
        let Commands::Migrate(args) = cli.command else {
            panic!("expected migrate");
        };
        let MigrateCommand::ToSingle(args) = args.command else {
            panic!("expected to-single");
        };
        assert_eq!(args.output, PathBuf::from("all.beancount"));
        assert!(!args.dry_run);
    }

    #[test]
    fn flags_override_config() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = dir.path().join("main.bean");
        let cli = Cli::try_parse_from([
            "beanfile".to_string(),
            "add".to_string(),
            "--ledger".to_string(),
            ledger.display().to_string(),
            "--single".to_string(),
            "--max-backup-files".to_string(),
            "3".to_string(),
            "--validator".to_string(),
            "my-check".to_string(),
        ])
        .unwrap();
        let Commands::Add(args) = cli.command else {
            panic!("expected add");
        };
        let config = resolve_config(&args.ledger).unwrap();
        assert_eq!(config.layout.mode, LayoutMode::Single);
        assert_eq!(config.layout.root_file(), ledger);
        assert_eq!(config.layout.extension, "bean");
        assert_eq!(config.backup.max_backup_files, 3);
        assert_eq!(config.validator.program, "my-check");
    }

    fn add_args(extra: &[&str]) -> super::LedgerArgs {
        let mut argv = vec!["beanfile", "add"];
        argv.extend_from_slice(extra);
        let Commands::Add(args) = Cli::try_parse_from(argv).unwrap().command else {
            panic!("expected add");
        };
        args.ledger
    }

    #[test]
    fn configured_layout_is_used_without_ledger_flag() {
        let dir = tempfile::tempdir().unwrap();
        let stored = EngineConfig {
            layout: LayoutConfig {
                mode: LayoutMode::Structured,
                folder: PathBuf::from("books"),
                root_stem: "main".to_string(),
                ..LayoutConfig::default()
            },
            ..EngineConfig::default()
        };
        config::save(dir.path(), &stored).unwrap();

        let config = resolve_config_in(&add_args(&[]), dir.path()).unwrap();
        assert_eq!(config.layout.mode, LayoutMode::Structured);
        assert_eq!(
            config.layout.root_file(),
            dir.path().join("books").join("main.beancount")
        );

        let config = resolve_config_in(&add_args(&["--single"]), dir.path()).unwrap();
        assert_eq!(config.layout.mode, LayoutMode::Single);
        assert_eq!(
            config.layout.root_file(),
            dir.path().join("books").join("main.beancount")
        );
    }

    #[test]
    fn ledger_flag_keeps_configured_mode() {
        let dir = tempfile::tempdir().unwrap();
        let stored = EngineConfig {
            layout: LayoutConfig {
                mode: LayoutMode::Structured,
                ..LayoutConfig::default()
            },
            ..EngineConfig::default()
        };
        config::save(dir.path(), &stored).unwrap();
        let ledger = dir.path().join("other.beancount");
        let ledger_arg = ledger.display().to_string();

        let config =
            resolve_config_in(&add_args(&["--ledger", &ledger_arg]), Path::new("unused")).unwrap();
        assert_eq!(config.layout.mode, LayoutMode::Structured);
        assert_eq!(config.layout.root_file(), ledger);
    }

    #[test]
    fn parses_commodity_metadata() {
        let cli = Cli::try_parse_from([
            "beanfile",
            "commodity",
            "--symbol",
            "ACME",
            "--meta",
            "name=Acme Corp",
            "--date",
            "2024-01-01",
        ])
        .unwrap();
        let Commands::Commodity(args) = cli.command else {
            panic!("expected commodity");
        };
        assert_eq!(args.meta, vec![("name".to_string(), "Acme Corp".to_string())]);
        assert_eq!(args.date.unwrap().to_string(), "2024-01-01");
        assert!(Cli::try_parse_from(["beanfile", "commodity", "--symbol", "X", "--meta", "novalue"]).is_err());
    }
}
