//! Persistence and migration for plain-text beancount ledgers: a typed
//! directive model, its canonical text codec, span-accurate edits with
//! backups and rollback, and conversion between a single ledger file and a
//! per-type multi-file layout.

pub mod backup;
pub mod cli;
pub mod codec;
pub mod config;
pub mod entry;
pub mod error;
pub mod journal;
pub mod layout;
pub mod locator;
pub mod lock;
pub mod migration;
pub mod mutation;
pub mod validator;

mod version;

pub use entry::LedgerEntry;
pub use version::APP_VERSION;
