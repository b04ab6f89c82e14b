use beanfile::codec;
use beanfile::journal;
use beanfile::layout::{LayoutConfig, LayoutMode};
use beanfile::migration::{self, MigrationError, MigrationOptions};
use beanfile::LedgerEntry;
use std::collections::BTreeMap;
use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};

const LEDGER: &str = r#"option "title" "Household"
option "operating_currency" "USD"

; Accounts
2024-01-01 open Assets:Checking USD
  id: "acct-checking"

2024-01-01 open Assets:Broker:Acme ACME "FIFO"

2024-01-01 open Expenses:Food

2024-01-01 commodity ACME
  name: "Acme Corp"

2024-01-02 * "Grocer" "Weekly shop" #food
  id: "t-2024-1"
  Expenses:Food      54.20 USD
  Assets:Checking

2024-01-03 pad Assets:Checking Equity:Opening

2024-02-10 ! "Broker" "Buy" ^trade-1
  Assets:Broker:Acme   10 ACME {15.00 USD, 2024-02-10, "first"}
  Assets:Checking   -150.00 USD

2024-03-01 price ACME 16.50 USD

2024-03-31 balance Assets:Checking 1,000.00 USD

2024-04-01 note Assets:Checking "Called about fees"

2024-05-01 event "location" "Lisbon"

2024-12-31 * "Bakery" "Bread"
  Expenses:Food  3.10 USD
  Assets:Checking  -3.10 USD

2025-01-05 * "Cafe" "Coffee"
  Expenses:Food  4.50 USD
    note: "oat milk"
  Assets:Checking

2025-01-06 txn "Cafe" "Coffee again"
  Expenses:Food  4.50 USD
  Assets:Checking

2025-06-30 close Expenses:Food
"#;

fn sorted_encodings(entries: &[LedgerEntry]) -> Vec<String> {
    let mut encoded: Vec<String> = entries.iter().map(codec::encode).collect();
    encoded.sort();
    encoded
}

fn snapshot_tree(dir: &Path) -> Result<BTreeMap<PathBuf, Vec<u8>>, Box<dyn Error>> {
    let mut files = BTreeMap::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in fs::read_dir(&current)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else {
                files.insert(path.clone(), fs::read(&path)?);
            }
        }
    }
    Ok(files)
}

fn structured_layout(dir: &Path) -> LayoutConfig {
    LayoutConfig {
        mode: LayoutMode::Structured,
        folder: dir.join("books"),
        ..LayoutConfig::default()
    }
}

#[test]
fn to_single_of_to_structured_keeps_every_entry() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let single = dir.path().join("household.beancount");
    fs::write(&single, LEDGER)?;
    let original = journal::read_entries(&single)?;
    assert_eq!(original.len(), 15);

    let layout = structured_layout(dir.path());
    let outcome = migration::to_structured(&single, &layout, MigrationOptions::default())?;
    assert_eq!(outcome.entries, original.len());
    assert_eq!(fs::read_to_string(&single)?, LEDGER);

    let structured = journal::read_entries(&layout.root_file())?;
    assert_eq!(sorted_encodings(&structured), sorted_encodings(&original));

    let merged = dir.path().join("merged.beancount");
    migration::to_single(&layout.root_file(), &merged, MigrationOptions::default())?;
    let round_tripped = journal::read_entries(&merged)?;
    assert_eq!(sorted_encodings(&round_tripped), sorted_encodings(&original));

    // Ids survive, including content-derived ones.
    let mut ids: Vec<&str> = original.iter().map(|entry| entry.id.as_str()).collect();
    let mut merged_ids: Vec<&str> = round_tripped.iter().map(|entry| entry.id.as_str()).collect();
    ids.sort_unstable();
    merged_ids.sort_unstable();
    assert_eq!(ids, merged_ids);

    let merged_text = fs::read_to_string(&merged)?;
    assert!(merged_text.starts_with("option \"title\" \"Household\"\noption \"operating_currency\" \"USD\"\n\n; Accounts\n"));
    Ok(())
}

#[test]
fn structured_layout_splits_by_year() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let single = dir.path().join("single.beancount");
    let mut text = String::from("2024-01-01 open Assets:Cash USD\n\n2024-01-01 open Expenses:Misc\n");
    for (day, year) in [(1, 2024), (2, 2024), (3, 2024), (1, 2025), (2, 2025)] {
        text.push_str(&format!(
            "\n{year}-02-0{day} * \"Shop\"\n  Expenses:Misc  {day} USD\n  Assets:Cash\n"
        ));
    }
    fs::write(&single, &text)?;
    let layout = structured_layout(dir.path());

    migration::to_structured(&single, &layout, MigrationOptions::default())?;

    let count = |relative: &str| -> Result<usize, Box<dyn Error>> {
        Ok(journal::read_blocks(&layout.folder.join(relative))?
            .iter()
            .filter(|block| block.entry().is_some())
            .count())
    };
    assert_eq!(count("transactions/2024.beancount")?, 3);
    assert_eq!(count("transactions/2025.beancount")?, 2);
    assert_eq!(count("accounts.beancount")?, 2);
    assert_eq!(
        fs::read_to_string(layout.root_file())?,
        "include \"accounts.beancount\"\n\
include \"transactions/2024.beancount\"\n\
include \"transactions/2025.beancount\"\n"
    );
    assert!(!layout.folder.join("prices.beancount").exists());
    Ok(())
}

#[test]
fn to_single_refuses_existing_destination() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let single = dir.path().join("single.beancount");
    fs::write(&single, LEDGER)?;
    let layout = structured_layout(dir.path());
    migration::to_structured(&single, &layout, MigrationOptions::default())?;

    let destination = dir.path().join("out").join("ledger.beancount");
    fs::create_dir_all(dir.path().join("out"))?;
    fs::write(&destination, "; already here\n")?;
    let before = snapshot_tree(dir.path())?;

    let err = migration::to_single(&layout.root_file(), &destination, MigrationOptions::default())
        .err()
        .ok_or("migration should conflict")?;
    assert!(matches!(err, MigrationError::Conflict { ref path } if path == &destination));
    assert_eq!(snapshot_tree(dir.path())?, before);
    Ok(())
}

#[test]
fn includes_in_source_are_followed() -> Result<(), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let source_dir = dir.path().join("src");
    fs::create_dir_all(source_dir.join("old"))?;
    fs::write(
        source_dir.join("main.beancount"),
        "2024-01-01 open Assets:Cash\n\ninclude \"old/2023.beancount\"\n\n2024-01-02 open Expenses:Misc\n",
    )?;
    fs::write(
        source_dir.join("old").join("2023.beancount"),
        "2023-05-05 * \"Old shop\"\n  Expenses:Misc  1 USD\n  Assets:Cash\n",
    )?;
    let layout = structured_layout(dir.path());

    let outcome = migration::to_structured(
        &source_dir.join("main.beancount"),
        &layout,
        MigrationOptions::default(),
    )?;
    assert_eq!(outcome.entries, 3);
    assert_eq!(
        fs::read_to_string(layout.folder.join("accounts.beancount"))?,
        "2024-01-01 open Assets:Cash\n\n2024-01-02 open Expenses:Misc\n"
    );
    assert!(layout.folder.join("transactions/2023.beancount").exists());
    Ok(())
}
