use chrono::NaiveDate;
use regex::Regex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;
use std::sync::OnceLock;

pub type AccountName = String;
pub type Currency = String;
pub type Metadata = BTreeMap<String, MetaValue>;

/// Metadata key under which a directive's id is persisted. Reserved on
/// directives; posting metadata may still use it.
pub const ID_META_KEY: &str = "id";

/// A metadata value. Quoted strings are kept apart from everything else
/// (`10 USD`, `2024-01-01`, `TRUE`), which is held as written and put back
/// unquoted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetaValue {
    String(String),
    Other(String),
}

impl MetaValue {
    pub fn as_str(&self) -> &str {
        match self {
            Self::String(value) | Self::Other(value) => value,
        }
    }
}

impl From<&str> for MetaValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

/// Transaction (and posting) flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Flag {
    #[default]
    Complete,
    Incomplete,
}

impl Flag {
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Complete => "*",
            Self::Incomplete => "!",
        }
    }

    pub fn from_symbol(symbol: &str) -> Option<Self> {
        match symbol {
            "*" | "txn" => Some(Self::Complete),
            "!" => Some(Self::Incomplete),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Booking {
    Strict,
    StrictWithSize,
    None,
    Average,
    Fifo,
    Lifo,
    Hifo,
}

impl Booking {
    pub fn keyword(self) -> &'static str {
        match self {
            Self::Strict => "STRICT",
            Self::StrictWithSize => "STRICT_WITH_SIZE",
            Self::None => "NONE",
            Self::Average => "AVERAGE",
            Self::Fifo => "FIFO",
            Self::Lifo => "LIFO",
            Self::Hifo => "HIFO",
        }
    }

    pub fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword {
            "STRICT" => Some(Self::Strict),
            "STRICT_WITH_SIZE" => Some(Self::StrictWithSize),
            "NONE" => Some(Self::None),
            "AVERAGE" => Some(Self::Average),
            "FIFO" => Some(Self::Fifo),
            "LIFO" => Some(Self::Lifo),
            "HIFO" => Some(Self::Hifo),
            _ => None,
        }
    }
}

/// Lot cost attached to a posting. Every component is optional so that a
/// reduction can match a lot by cost, by acquisition date, or by label.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Cost {
    #[serde(default)]
    pub amount: Option<Decimal>,
    #[serde(default)]
    pub currency: Option<Currency>,
    #[serde(default)]
    pub acquisition_date: Option<NaiveDate>,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub is_total_cost: bool,
}

/// `@` / `@@` price annotation on a posting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceAnnotation {
    pub amount: Decimal,
    pub currency: Currency,
    #[serde(default)]
    pub is_total_price: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Posting {
    #[serde(default)]
    pub flag: Option<Flag>,
    pub account: AccountName,
    #[serde(default)]
    pub amount: Option<Decimal>,
    #[serde(default)]
    pub currency: Option<Currency>,
    #[serde(default)]
    pub cost: Option<Cost>,
    #[serde(default)]
    pub price: Option<PriceAnnotation>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub meta: Metadata,
}

impl Posting {
    /// A plain `account  amount currency` posting.
    pub fn new(account: &str, amount: Decimal, currency: &str) -> Self {
        Self {
            flag: None,
            account: account.to_string(),
            amount: Some(amount),
            currency: Some(currency.to_string()),
            cost: None,
            price: None,
            comment: None,
            meta: Metadata::new(),
        }
    }

    /// A posting whose amount is left for the ledger to infer.
    pub fn elided(account: &str) -> Self {
        Self {
            flag: None,
            account: account.to_string(),
            amount: None,
            currency: None,
            cost: None,
            price: None,
            comment: None,
            meta: Metadata::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(default)]
    pub flag: Flag,
    #[serde(default)]
    pub payee: Option<String>,
    #[serde(default)]
    pub narration: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub links: BTreeSet<String>,
    pub postings: Vec<Posting>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub account: AccountName,
    pub amount: Decimal,
    pub currency: Currency,
    #[serde(default)]
    pub tolerance: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    pub account: AccountName,
    pub comment: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub links: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pad {
    pub account: AccountName,
    pub source_account: AccountName,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Open {
    pub account: AccountName,
    #[serde(default)]
    pub currencies: Vec<Currency>,
    #[serde(default)]
    pub booking: Option<Booking>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Close {
    pub account: AccountName,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Price {
    pub commodity: Currency,
    pub amount: Decimal,
    pub currency: Currency,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commodity {
    pub currency: Currency,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub event_type: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntryKind {
    Transaction(Transaction),
    Balance(Balance),
    Note(Note),
    Pad(Pad),
    Open(Open),
    Close(Close),
    Price(Price),
    Commodity(Commodity),
    Event(Event),
}

impl EntryKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Transaction(_) => "transaction",
            Self::Balance(_) => "balance",
            Self::Note(_) => "note",
            Self::Pad(_) => "pad",
            Self::Open(_) => "open",
            Self::Close(_) => "close",
            Self::Price(_) => "price",
            Self::Commodity(_) => "commodity",
            Self::Event(_) => "event",
        }
    }
}

/// Where a directive was last seen. Advisory only: the file may have changed
/// since, so the locator re-verifies before anything is mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceLocation {
    pub file: PathBuf,
    /// 1-based, inclusive.
    pub start_line: usize,
    /// 1-based, inclusive.
    pub end_line: usize,
}

/// One dated directive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Empty until the mutation engine assigns one.
    #[serde(default)]
    pub id: String,
    pub date: NaiveDate,
    #[serde(default)]
    pub meta: Metadata,
    pub kind: EntryKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceLocation>,
}

// `source` is a cache of where the text lived, not part of the directive.
impl PartialEq for LedgerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.date == other.date
            && self.meta == other.meta
            && self.kind == other.kind
    }
}

impl Eq for LedgerEntry {}

impl LedgerEntry {
    pub fn new(date: NaiveDate, kind: EntryKind) -> Self {
        Self {
            id: String::new(),
            date,
            meta: Metadata::new(),
            kind,
            source: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn kind_name(&self) -> &'static str {
        self.kind.name()
    }

    pub fn as_transaction(&self) -> Option<&Transaction> {
        match &self.kind {
            EntryKind::Transaction(txn) => Some(txn),
            _ => None,
        }
    }

    /// Check every invariant that can be decided from the entry alone.
    pub fn validate(&self, options: &ValidationOptions) -> Result<(), ValidationError> {
        validate_id(&self.id)?;
        if self.meta.contains_key(ID_META_KEY) {
            return Err(ValidationError::ReservedMetadataKey(ID_META_KEY.to_string()));
        }
        validate_meta(&self.meta)?;
        match &self.kind {
            EntryKind::Transaction(txn) => validate_transaction(self.date, txn, options),
            EntryKind::Balance(balance) => {
                validate_account(&balance.account)?;
                validate_currency(&balance.currency)
            }
            EntryKind::Note(note) => {
                validate_account(&note.account)?;
                validate_single_line(&note.comment, "note comment")?;
                validate_tags_and_links(&note.tags, &note.links)
            }
            EntryKind::Pad(pad) => {
                validate_account(&pad.account)?;
                validate_account(&pad.source_account)
            }
            EntryKind::Open(open) => {
                validate_account(&open.account)?;
                open.currencies
                    .iter()
                    .try_for_each(|currency| validate_currency(currency))
            }
            EntryKind::Close(close) => validate_account(&close.account),
            EntryKind::Price(price) => {
                validate_currency(&price.commodity)?;
                validate_currency(&price.currency)
            }
            EntryKind::Commodity(commodity) => validate_currency(&commodity.currency),
            EntryKind::Event(event) => {
                validate_single_line(&event.event_type, "event type")?;
                validate_single_line(&event.description, "event description")
            }
        }
    }
}

impl fmt::Display for LedgerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.date, self.kind_name(), self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationOptions {
    /// Largest per-currency residual a balanced transaction may leave.
    pub tolerance: Decimal,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self {
            tolerance: Decimal::new(5, 3),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("transaction must include at least two postings")]
    TooFewPostings,
    #[error("only one posting may omit an amount")]
    MultipleMissingAmounts,
    #[error("posting {index}: amount and currency must be given together")]
    AmountWithoutCurrency { index: usize },
    #[error("posting {index}: cost or price requires an explicit amount and currency")]
    CostWithoutAmount { index: usize },
    #[error("posting {index}: cost amount and currency must be given together")]
    IncompleteCost { index: usize },
    #[error("posting {index}: lot date {lot_date} is after transaction date {date}")]
    LotDateAfterTransaction {
        index: usize,
        lot_date: NaiveDate,
        date: NaiveDate,
    },
    #[error("invalid tag '{0}'")]
    InvalidTag(String),
    #[error("invalid link '{0}'")]
    InvalidLink(String),
    #[error("invalid metadata key '{0}'")]
    InvalidMetadataKey(String),
    #[error("metadata key '{0}' is reserved")]
    ReservedMetadataKey(String),
    #[error("invalid unquoted metadata value '{0}'")]
    InvalidMetadataValue(String),
    #[error("posting {index}: comment must be non-empty without surrounding whitespace")]
    InvalidComment { index: usize },
    #[error("invalid account name '{0}'")]
    InvalidAccount(String),
    #[error("invalid currency '{0}'")]
    InvalidCurrency(String),
    #[error("invalid id '{0}'")]
    InvalidId(String),
    #[error("{0} must be a single line")]
    MultiLine(&'static str),
    #[error("transaction does not balance: {currency} is off by {residual}")]
    Unbalanced { currency: Currency, residual: Decimal },
}

const TAG_OR_LINK_PATTERN: &str = r"^[A-Za-z0-9_-]+$";
const METADATA_KEY_PATTERN: &str = r"^[a-z][a-z0-9_-]*$";
const ACCOUNT_PATTERN: &str = r"^[A-Z][A-Za-z0-9-]*(?::[A-Z0-9][A-Za-z0-9-]*)+$";
const CURRENCY_PATTERN: &str = r"^[A-Z](?:[A-Z0-9'._-]{0,22}[A-Z0-9])?$";

/// Match against a lazily compiled pattern. A pattern that fails to compile
/// matches nothing.
fn matches(cell: &'static OnceLock<Option<Regex>>, source: &str, value: &str) -> bool {
    cell.get_or_init(|| match Regex::new(source) {
        Ok(regex) => Some(regex),
        Err(err) => {
            log::error!("invalid built-in pattern {source}: {err}");
            None
        }
    })
    .as_ref()
    .is_some_and(|regex| regex.is_match(value))
}

pub(crate) fn is_tag_or_link(value: &str) -> bool {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    matches(&RE, TAG_OR_LINK_PATTERN, value)
}

pub(crate) fn is_metadata_key(value: &str) -> bool {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    matches(&RE, METADATA_KEY_PATTERN, value)
}

pub(crate) fn is_account(value: &str) -> bool {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    matches(&RE, ACCOUNT_PATTERN, value)
}

pub(crate) fn is_currency(value: &str) -> bool {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    matches(&RE, CURRENCY_PATTERN, value)
}

fn validate_id(id: &str) -> Result<(), ValidationError> {
    if id.is_empty() || id.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_') {
        Ok(())
    } else {
        Err(ValidationError::InvalidId(id.to_string()))
    }
}

fn validate_single_line(value: &str, field: &'static str) -> Result<(), ValidationError> {
    if value.contains('\n') || value.contains('\r') {
        return Err(ValidationError::MultiLine(field));
    }
    Ok(())
}

fn validate_account(account: &str) -> Result<(), ValidationError> {
    if is_account(account) {
        Ok(())
    } else {
        Err(ValidationError::InvalidAccount(account.to_string()))
    }
}

fn validate_currency(currency: &str) -> Result<(), ValidationError> {
    if is_currency(currency) {
        Ok(())
    } else {
        Err(ValidationError::InvalidCurrency(currency.to_string()))
    }
}

fn validate_meta(meta: &Metadata) -> Result<(), ValidationError> {
    for (key, value) in meta {
        if !is_metadata_key(key) {
            return Err(ValidationError::InvalidMetadataKey(key.clone()));
        }
        match value {
            MetaValue::String(text) => validate_single_line(text, "metadata value")?,
            MetaValue::Other(text) => {
                let well_formed = !text.contains(['\n', '\r', ';'])
                    && !text.starts_with('"')
                    && text.trim() == text;
                if !well_formed {
                    return Err(ValidationError::InvalidMetadataValue(text.clone()));
                }
            }
        }
    }
    Ok(())
}

fn validate_tags_and_links(
    tags: &BTreeSet<String>,
    links: &BTreeSet<String>,
) -> Result<(), ValidationError> {
    if let Some(tag) = tags.iter().find(|tag| !is_tag_or_link(tag)) {
        return Err(ValidationError::InvalidTag(tag.clone()));
    }
    if let Some(link) = links.iter().find(|link| !is_tag_or_link(link)) {
        return Err(ValidationError::InvalidLink(link.clone()));
    }
    Ok(())
}

fn validate_transaction(
    date: NaiveDate,
    txn: &Transaction,
    options: &ValidationOptions,
) -> Result<(), ValidationError> {
    if let Some(payee) = &txn.payee {
        validate_single_line(payee, "payee")?;
    }
    validate_single_line(&txn.narration, "narration")?;
    validate_tags_and_links(&txn.tags, &txn.links)?;

    if txn.postings.len() < 2 {
        return Err(ValidationError::TooFewPostings);
    }
    let missing = txn
        .postings
        .iter()
        .filter(|posting| posting.amount.is_none())
        .count();
    if missing > 1 {
        return Err(ValidationError::MultipleMissingAmounts);
    }

    for (index, posting) in txn.postings.iter().enumerate() {
        validate_account(&posting.account)?;
        validate_meta(&posting.meta)?;
        if let Some(comment) = &posting.comment {
            validate_single_line(comment, "posting comment")?;
            if comment.is_empty() || comment.trim() != comment {
                return Err(ValidationError::InvalidComment { index });
            }
        }
        if posting.amount.is_some() != posting.currency.is_some() {
            if posting.cost.is_some() || posting.price.is_some() {
                return Err(ValidationError::CostWithoutAmount { index });
            }
            return Err(ValidationError::AmountWithoutCurrency { index });
        }
        if let Some(currency) = &posting.currency {
            validate_currency(currency)?;
        }
        if (posting.cost.is_some() || posting.price.is_some()) && posting.amount.is_none() {
            return Err(ValidationError::CostWithoutAmount { index });
        }
        if let Some(cost) = &posting.cost {
            if cost.amount.is_some() != cost.currency.is_some() {
                return Err(ValidationError::IncompleteCost { index });
            }
            if let Some(currency) = &cost.currency {
                validate_currency(currency)?;
            }
            if let Some(label) = &cost.label {
                validate_single_line(label, "lot label")?;
            }
            if let Some(lot_date) = cost.acquisition_date {
                if lot_date > date {
                    return Err(ValidationError::LotDateAfterTransaction {
                        index,
                        lot_date,
                        date,
                    });
                }
            }
        }
        if let Some(price) = &posting.price {
            validate_currency(&price.currency)?;
        }
    }

    if missing == 0 {
        check_balanced(txn, options)?;
    }
    Ok(())
}

/// Sum each posting's weight per currency and require every residual to be
/// within tolerance. Postings that match a lot without stating its cost
/// cannot be weighed here, so such transactions are left to the ledger.
pub fn check_balanced(txn: &Transaction, options: &ValidationOptions) -> Result<(), ValidationError> {
    let mut residuals: BTreeMap<&str, Decimal> = BTreeMap::new();
    for posting in &txn.postings {
        let (Some(units), Some(currency)) = (posting.amount, posting.currency.as_deref()) else {
            return Ok(());
        };
        let (weight, weight_currency) = match (&posting.cost, &posting.price) {
            (Some(cost), _) => match (cost.amount, cost.currency.as_deref()) {
                (Some(number), Some(cost_currency)) if cost.is_total_cost => {
                    (signed_total(units, number), cost_currency)
                }
                (Some(number), Some(cost_currency)) => (units * number, cost_currency),
                _ => return Ok(()),
            },
            (None, Some(price)) if price.is_total_price => {
                (signed_total(units, price.amount), price.currency.as_str())
            }
            (None, Some(price)) => (units * price.amount, price.currency.as_str()),
            (None, None) => (units, currency),
        };
        *residuals.entry(weight_currency).or_default() += weight;
    }

    for (currency, residual) in residuals {
        if residual.abs() > options.tolerance {
            return Err(ValidationError::Unbalanced {
                currency: currency.to_string(),
                residual,
            });
        }
    }
    Ok(())
}

fn signed_total(units: Decimal, total: Decimal) -> Decimal {
    if units.is_sign_negative() {
        -total.abs()
    } else {
        total.abs()
    }
}
