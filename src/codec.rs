//! Conversion between [`LedgerEntry`] values and beancount directive text.
//!
//! `encode` always produces the canonical layout: a header line, the `id`
//! metadata line followed by the remaining directive metadata, then one
//! indented line per posting with amounts right-aligned in a shared column.
//! `decode` accepts the looser forms people type by hand (unquoted narration,
//! `txn` instead of `*`, thousands separators, either balance tolerance form).

use crate::entry::{
    is_account, Balance, Booking, Close, Commodity, Cost, EntryKind, Event, Flag, LedgerEntry,
    MetaValue, Metadata, Note, Open, Pad, Posting, Price, PriceAnnotation, Transaction, ID_META_KEY,
};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::collections::{BTreeSet, HashMap};
use std::fmt::Write as FmtWrite;
use std::path::PathBuf;
use std::str::FromStr;

const INDENT: &str = "  ";
const POSTING_META_INDENT: &str = "    ";
const ID_NAMESPACE: uuid::Uuid = uuid::Uuid::from_u128(0x6a1f_0c7e_5d2b_4c1a_9e34_b7a8_51d0_c2f3);

/// A directive that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{}line {line}: {reason}", file_prefix(.file))]
pub struct ParseError {
    pub file: Option<PathBuf>,
    /// 1-based line number of the offending line.
    pub line: usize,
    pub reason: String,
}

fn file_prefix(file: &Option<PathBuf>) -> String {
    match file {
        Some(path) => format!("{}: ", path.display()),
        None => String::new(),
    }
}

impl ParseError {
    fn new(line: usize, reason: impl Into<String>) -> Self {
        Self {
            file: None,
            line,
            reason: reason.into(),
        }
    }

    pub fn in_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.file = Some(file.into());
        self
    }
}

/// Render an entry in canonical form, terminated by a newline.
pub fn encode(entry: &LedgerEntry) -> String {
    encode_inner(entry, true)
}

/// Decode the text of one directive block. Line numbers in errors are
/// relative to the block, starting at 1.
pub fn decode(text: &str) -> Result<LedgerEntry, ParseError> {
    decode_at(text, 1)
}

/// Decode a block whose first line sits at `first_line` of its file.
pub fn decode_at(text: &str, first_line: usize) -> Result<LedgerEntry, ParseError> {
    let (mut entry, explicit_id) = decode_parts(text, first_line)?;
    entry.id = match explicit_id {
        Some(id) => id,
        None => content_id(&entry),
    };
    Ok(entry)
}

/// Assigns content ids across the blocks of one file. Directives that are
/// written identically and carry no `id` line are told apart by the order
/// in which they appear.
#[derive(Debug, Default)]
pub struct ContentIds {
    seen: HashMap<String, usize>,
}

impl ContentIds {
    /// Like [`decode_at`], for the next block of the file.
    pub fn decode_at(&mut self, text: &str, first_line: usize) -> Result<LedgerEntry, ParseError> {
        let (mut entry, explicit_id) = decode_parts(text, first_line)?;
        entry.id = match explicit_id {
            Some(id) => id,
            None => {
                let canonical = encode_inner(&entry, false);
                let occurrence = self.seen.entry(canonical.clone()).or_default();
                let id = occurrence_id(&canonical, *occurrence);
                *occurrence += 1;
                id
            }
        };
        Ok(entry)
    }
}

fn decode_parts(
    text: &str,
    first_line: usize,
) -> Result<(LedgerEntry, Option<String>), ParseError> {
    let mut lines = text
        .lines()
        .enumerate()
        .map(|(offset, line)| (first_line + offset, line))
        .filter(|(_, line)| !line.trim().is_empty());

    let Some((header_no, header)) = lines.next() else {
        return Err(ParseError::new(first_line, "empty directive"));
    };
    if header.starts_with([' ', '\t']) {
        return Err(ParseError::new(header_no, "directive header must not be indented"));
    }

    let tokens = tokenize(header, header_no)?;
    let mut cursor = Cursor::new(&tokens, header_no);
    let date = parse_date(cursor.word("date")?, header_no)?;
    let keyword = cursor.word("directive keyword")?;
    let mut meta = Metadata::new();

    let mut kind = match keyword {
        "balance" => EntryKind::Balance(parse_balance(&mut cursor)?),
        "note" => EntryKind::Note(parse_note(&mut cursor)?),
        "pad" => EntryKind::Pad(Pad {
            account: cursor.account()?,
            source_account: cursor.account()?,
        }),
        "open" => EntryKind::Open(parse_open(&mut cursor)?),
        "close" => EntryKind::Close(Close {
            account: cursor.account()?,
        }),
        "price" => EntryKind::Price(Price {
            commodity: cursor.word("commodity")?.to_string(),
            amount: parse_number(cursor.word("price amount")?, header_no)?,
            currency: cursor.word("price currency")?.to_string(),
        }),
        "commodity" => EntryKind::Commodity(Commodity {
            currency: cursor.word("commodity")?.to_string(),
        }),
        "event" => EntryKind::Event(Event {
            event_type: cursor.string("event type")?,
            description: cursor.string("event description")?,
        }),
        other => match Flag::from_symbol(other) {
            Some(flag) => EntryKind::Transaction(parse_transaction_header(flag, &mut cursor)?),
            None => {
                return Err(ParseError::new(
                    header_no,
                    format!("unsupported directive '{other}'"),
                ))
            }
        },
    };
    cursor.finish()?;

    let mut posting_indent = None;
    for (line_no, line) in lines {
        if !line.starts_with([' ', '\t']) {
            return Err(ParseError::new(
                line_no,
                "continuation line must be indented",
            ));
        }
        let indent = line.len() - line.trim_start().len();
        let trimmed = line.trim();
        if trimmed.starts_with(';') {
            continue;
        }
        if let Some((key, value)) = parse_meta_line(trimmed, line_no)? {
            let target = match (&mut kind, posting_indent) {
                (EntryKind::Transaction(txn), Some(owner_indent)) if indent > owner_indent => {
                    match txn.postings.last_mut() {
                        Some(posting) => &mut posting.meta,
                        None => &mut meta,
                    }
                }
                _ => &mut meta,
            };
            if target.insert(key.clone(), value).is_some() {
                return Err(ParseError::new(line_no, format!("duplicate metadata key '{key}'")));
            }
            continue;
        }
        match &mut kind {
            EntryKind::Transaction(txn) => {
                txn.postings.push(parse_posting(trimmed, line_no)?);
                posting_indent = Some(indent);
            }
            _ => {
                return Err(ParseError::new(
                    line_no,
                    format!("unexpected line in {} directive", kind.name()),
                ))
            }
        }
    }

    let explicit_id = meta
        .remove(ID_META_KEY)
        .map(|value| value.as_str().to_string());
    let entry = LedgerEntry {
        id: String::new(),
        date,
        meta,
        kind,
        source: None,
    };
    Ok((entry, explicit_id))
}

/// Stable id for a directive that was written without an `id` line: a
/// name-based UUID over its canonical text, so reformatting does not change it.
/// This is the id of the first such directive in a file; see [`ContentIds`].
pub fn content_id(entry: &LedgerEntry) -> String {
    occurrence_id(&encode_inner(entry, false), 0)
}

fn occurrence_id(canonical: &str, occurrence: usize) -> String {
    let name = if occurrence == 0 {
        canonical.to_string()
    } else {
        format!("{canonical}#{occurrence}")
    };
    uuid::Uuid::new_v5(&ID_NAMESPACE, name.as_bytes()).to_string()
}

fn encode_inner(entry: &LedgerEntry, with_id: bool) -> String {
    let mut buf = String::new();
    let _ = write!(buf, "{} ", entry.date.format("%Y-%m-%d"));
    match &entry.kind {
        EntryKind::Transaction(txn) => {
            buf.push_str(txn.flag.symbol());
            if let Some(payee) = &txn.payee {
                let _ = write!(buf, " {}", quote(payee));
            }
            let _ = write!(buf, " {}", quote(&txn.narration));
            push_tags_and_links(&mut buf, &txn.tags, &txn.links);
        }
        EntryKind::Balance(balance) => {
            let _ = write!(buf, "balance {} {}", balance.account, balance.amount);
            if let Some(tolerance) = balance.tolerance {
                let _ = write!(buf, " ~ {tolerance}");
            }
            let _ = write!(buf, " {}", balance.currency);
        }
        EntryKind::Note(note) => {
            let _ = write!(buf, "note {} {}", note.account, quote(&note.comment));
            push_tags_and_links(&mut buf, &note.tags, &note.links);
        }
        EntryKind::Pad(pad) => {
            let _ = write!(buf, "pad {} {}", pad.account, pad.source_account);
        }
        EntryKind::Open(open) => {
            let _ = write!(buf, "open {}", open.account);
            if !open.currencies.is_empty() {
                let _ = write!(buf, " {}", open.currencies.join(","));
            }
            if let Some(booking) = open.booking {
                let _ = write!(buf, " {}", quote(booking.keyword()));
            }
        }
        EntryKind::Close(close) => {
            let _ = write!(buf, "close {}", close.account);
        }
        EntryKind::Price(price) => {
            let _ = write!(
                buf,
                "price {} {} {}",
                price.commodity, price.amount, price.currency
            );
        }
        EntryKind::Commodity(commodity) => {
            let _ = write!(buf, "commodity {}", commodity.currency);
        }
        EntryKind::Event(event) => {
            let _ = write!(
                buf,
                "event {} {}",
                quote(&event.event_type),
                quote(&event.description)
            );
        }
    }
    buf.push('\n');

    if with_id && !entry.id.is_empty() {
        let _ = writeln!(buf, "{INDENT}{ID_META_KEY}: {}", quote(&entry.id));
    }
    for (key, value) in &entry.meta {
        if key == ID_META_KEY {
            continue;
        }
        push_meta_line(&mut buf, INDENT, key, value);
    }

    if let EntryKind::Transaction(txn) = &entry.kind {
        push_postings(&mut buf, &txn.postings);
    }
    buf
}

fn push_tags_and_links(buf: &mut String, tags: &BTreeSet<String>, links: &BTreeSet<String>) {
    for tag in tags {
        let _ = write!(buf, " #{tag}");
    }
    for link in links {
        let _ = write!(buf, " ^{link}");
    }
}

fn posting_label(posting: &Posting) -> String {
    match posting.flag {
        Some(flag) => format!("{} {}", flag.symbol(), posting.account),
        None => posting.account.clone(),
    }
}

fn push_postings(buf: &mut String, postings: &[Posting]) {
    let labels: Vec<String> = postings.iter().map(posting_label).collect();
    let account_width = labels.iter().map(String::len).max().unwrap_or(0);
    let numbers: Vec<Option<String>> = postings
        .iter()
        .map(|posting| posting.amount.map(|amount| amount.to_string()))
        .collect();
    let number_width = numbers
        .iter()
        .flatten()
        .map(String::len)
        .max()
        .unwrap_or(0);

    for ((posting, label), number) in postings.iter().zip(&labels).zip(&numbers) {
        let mut line = format!("{INDENT}{label}");
        if let (Some(number), Some(currency)) = (number, &posting.currency) {
            let _ = write!(
                line,
                "{:pad$}  {number:>number_width$} {currency}",
                "",
                pad = account_width - label.len()
            );
            if let Some(cost) = &posting.cost {
                let _ = write!(line, " {}", render_cost(cost));
            }
            if let Some(price) = &posting.price {
                let marker = if price.is_total_price { "@@" } else { "@" };
                let _ = write!(line, " {marker} {} {}", price.amount, price.currency);
            }
        }
        if let Some(comment) = &posting.comment {
            let _ = write!(line, "  ; {comment}");
        }
        buf.push_str(&line);
        buf.push('\n');
        for (key, value) in &posting.meta {
            push_meta_line(buf, POSTING_META_INDENT, key, value);
        }
    }
}

fn push_meta_line(buf: &mut String, indent: &str, key: &str, value: &MetaValue) {
    match value {
        MetaValue::String(text) => {
            let _ = writeln!(buf, "{indent}{key}: {}", quote(text));
        }
        MetaValue::Other(text) if text.is_empty() => {
            let _ = writeln!(buf, "{indent}{key}:");
        }
        MetaValue::Other(text) => {
            let _ = writeln!(buf, "{indent}{key}: {text}");
        }
    }
}

fn render_cost(cost: &Cost) -> String {
    let mut parts = Vec::new();
    if let (Some(amount), Some(currency)) = (cost.amount, &cost.currency) {
        parts.push(format!("{amount} {currency}"));
    }
    if let Some(date) = cost.acquisition_date {
        parts.push(date.format("%Y-%m-%d").to_string());
    }
    if let Some(label) = &cost.label {
        parts.push(quote(label));
    }
    let inner = parts.join(", ");
    if cost.is_total_cost {
        format!("{{{{{inner}}}}}")
    } else {
        format!("{{{inner}}}")
    }
}

fn quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for ch in value.chars() {
        if ch == '"' || ch == '\\' {
            out.push('\\');
        }
        out.push(ch);
    }
    out.push('"');
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Str(String),
    OpenBrace,
    OpenTotal,
    CloseBrace,
    CloseTotal,
    Comma,
    At,
    AtAt,
    Tilde,
    Comment(String),
}

fn tokenize(line: &str, line_no: usize) -> Result<Vec<Token>, ParseError> {
    let chars: Vec<char> = line.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let ch = chars[i];
        let next = chars.get(i + 1).copied();
        match ch {
            c if c.is_whitespace() => i += 1,
            ';' => {
                let rest: String = chars[i + 1..].iter().collect();
                tokens.push(Token::Comment(rest.trim().to_string()));
                break;
            }
            '"' => {
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(ParseError::new(line_no, "unterminated string")),
                        Some('\\') => {
                            if let Some(escaped) = chars.get(i + 1) {
                                value.push(*escaped);
                            }
                            i += 2;
                        }
                        Some('"') => {
                            i += 1;
                            break;
                        }
                        Some(other) => {
                            value.push(*other);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(value));
            }
            '{' if next == Some('{') => {
                tokens.push(Token::OpenTotal);
                i += 2;
            }
            '{' => {
                tokens.push(Token::OpenBrace);
                i += 1;
            }
            '}' if next == Some('}') => {
                tokens.push(Token::CloseTotal);
                i += 2;
            }
            '}' => {
                tokens.push(Token::CloseBrace);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '@' if next == Some('@') => {
                tokens.push(Token::AtAt);
                i += 2;
            }
            '@' => {
                tokens.push(Token::At);
                i += 1;
            }
            '~' => {
                tokens.push(Token::Tilde);
                i += 1;
            }
            _ => {
                let start = i;
                while i < chars.len() {
                    let c = chars[i];
                    let thousands = c == ','
                        && i > start
                        && chars[i - 1].is_ascii_digit()
                        && chars.get(i + 1).is_some_and(char::is_ascii_digit);
                    let delimiter = matches!(c, '{' | '}' | '"' | ',' | '@' | '~' | ';');
                    if c.is_whitespace() || (delimiter && !thousands) {
                        break;
                    }
                    i += 1;
                }
                tokens.push(Token::Word(chars[start..i].iter().collect()));
            }
        }
    }
    Ok(tokens)
}

struct Cursor<'a> {
    tokens: &'a [Token],
    pos: usize,
    line: usize,
}

impl<'a> Cursor<'a> {
    fn new(tokens: &'a [Token], line: usize) -> Self {
        Self {
            tokens,
            pos: 0,
            line,
        }
    }

    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<&'a Token> {
        let token = self.tokens.get(self.pos);
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn error(&self, reason: impl Into<String>) -> ParseError {
        ParseError::new(self.line, reason)
    }

    fn word(&mut self, what: &str) -> Result<&'a str, ParseError> {
        match self.advance() {
            Some(Token::Word(word)) => Ok(word),
            Some(other) => Err(self.error(format!("expected {what}, found {other:?}"))),
            None => Err(self.error(format!("missing {what}"))),
        }
    }

    fn string(&mut self, what: &str) -> Result<String, ParseError> {
        match self.advance() {
            Some(Token::Str(value)) => Ok(value.clone()),
            Some(other) => Err(self.error(format!("expected quoted {what}, found {other:?}"))),
            None => Err(self.error(format!("missing {what}"))),
        }
    }

    fn account(&mut self) -> Result<String, ParseError> {
        let word = self.word("account")?;
        if is_account(word) {
            Ok(word.to_string())
        } else {
            Err(self.error(format!("invalid account '{word}'")))
        }
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    /// Trailing comments are allowed; anything else left over is an error.
    fn finish(&mut self) -> Result<(), ParseError> {
        match self.advance() {
            None | Some(Token::Comment(_)) => Ok(()),
            Some(other) => Err(self.error(format!("unexpected {other:?}"))),
        }
    }
}

fn parse_date(word: &str, line: usize) -> Result<NaiveDate, ParseError> {
    NaiveDate::parse_from_str(word, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(word, "%Y/%m/%d"))
        .map_err(|_| ParseError::new(line, format!("invalid date '{word}'")))
}

fn parse_number(word: &str, line: usize) -> Result<Decimal, ParseError> {
    let cleaned: String = word
        .trim_start_matches('+')
        .chars()
        .filter(|ch| *ch != ',')
        .collect();
    Decimal::from_str(&cleaned).map_err(|_| ParseError::new(line, format!("invalid number '{word}'")))
}

fn parse_tags_and_links(
    cursor: &mut Cursor<'_>,
) -> Result<(BTreeSet<String>, BTreeSet<String>), ParseError> {
    let mut tags = BTreeSet::new();
    let mut links = BTreeSet::new();
    while let Some(Token::Word(word)) = cursor.peek() {
        if let Some(tag) = word.strip_prefix('#') {
            tags.insert(tag.to_string());
        } else if let Some(link) = word.strip_prefix('^') {
            links.insert(link.to_string());
        } else {
            return Err(cursor.error(format!("unexpected '{word}'")));
        }
        cursor.pos += 1;
    }
    Ok((tags, links))
}

fn parse_transaction_header(flag: Flag, cursor: &mut Cursor<'_>) -> Result<Transaction, ParseError> {
    let mut strings = Vec::new();
    while let Some(Token::Str(value)) = cursor.peek() {
        strings.push(value.clone());
        cursor.pos += 1;
    }

    if strings.is_empty() {
        let mut words = Vec::new();
        while let Some(Token::Word(word)) = cursor.peek() {
            if word.starts_with('#') || word.starts_with('^') {
                break;
            }
            words.push(word.as_str());
            cursor.pos += 1;
        }
        if !words.is_empty() {
            strings.push(words.join(" "));
        }
    }

    let (payee, narration) = match strings.len() {
        0 => (None, String::new()),
        1 => (None, strings.remove(0)),
        2 => {
            let narration = strings.remove(1);
            (Some(strings.remove(0)), narration)
        }
        _ => return Err(cursor.error("too many strings in transaction header")),
    };
    let (tags, links) = parse_tags_and_links(cursor)?;
    Ok(Transaction {
        flag,
        payee,
        narration,
        tags,
        links,
        postings: Vec::new(),
    })
}

fn parse_balance(cursor: &mut Cursor<'_>) -> Result<Balance, ParseError> {
    let account = cursor.account()?;
    let line = cursor.line;
    let amount = parse_number(cursor.word("balance amount")?, line)?;
    let (tolerance, currency) = if cursor.eat(&Token::Tilde) {
        let tolerance = parse_number(cursor.word("tolerance")?, line)?;
        (Some(tolerance), cursor.word("balance currency")?.to_string())
    } else {
        let currency = cursor.word("balance currency")?.to_string();
        let tolerance = if cursor.eat(&Token::Tilde) {
            let tolerance = parse_number(cursor.word("tolerance")?, line)?;
            if let Some(Token::Word(word)) = cursor.peek() {
                if *word != currency {
                    return Err(cursor.error("tolerance currency differs from balance currency"));
                }
                cursor.pos += 1;
            }
            Some(tolerance)
        } else {
            None
        };
        (tolerance, currency)
    };
    Ok(Balance {
        account,
        amount,
        currency,
        tolerance,
    })
}

fn parse_note(cursor: &mut Cursor<'_>) -> Result<Note, ParseError> {
    let account = cursor.account()?;
    let comment = cursor.string("note comment")?;
    let (tags, links) = parse_tags_and_links(cursor)?;
    Ok(Note {
        account,
        comment,
        tags,
        links,
    })
}

fn parse_open(cursor: &mut Cursor<'_>) -> Result<Open, ParseError> {
    let account = cursor.account()?;
    let mut currencies = Vec::new();
    let mut booking = None;
    loop {
        match cursor.peek() {
            Some(Token::Word(word)) => {
                currencies.push(word.clone());
                cursor.pos += 1;
            }
            Some(Token::Comma) => cursor.pos += 1,
            Some(Token::Str(keyword)) => {
                booking = Some(
                    Booking::from_keyword(keyword)
                        .ok_or_else(|| cursor.error(format!("unknown booking method '{keyword}'")))?,
                );
                cursor.pos += 1;
                break;
            }
            _ => break,
        }
    }
    Ok(Open {
        account,
        currencies,
        booking,
    })
}

fn parse_meta_line(line: &str, line_no: usize) -> Result<Option<(String, MetaValue)>, ParseError> {
    let Some((key, rest)) = line.split_once(':') else {
        return Ok(None);
    };
    if !key.starts_with(|ch: char| ch.is_ascii_lowercase())
        || !key
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
    {
        return Ok(None);
    }
    if !rest.is_empty() && !rest.starts_with([' ', '\t']) {
        return Ok(None);
    }
    let rest = rest.trim();
    let value = if rest.starts_with('"') {
        let tokens = tokenize(rest, line_no)?;
        match tokens.as_slice() {
            [Token::Str(value)] | [Token::Str(value), Token::Comment(_)] => {
                MetaValue::String(value.clone())
            }
            _ => return Err(ParseError::new(line_no, format!("malformed value for '{key}'"))),
        }
    } else {
        let value = rest.split_once(';').map_or(rest, |(value, _)| value);
        MetaValue::Other(value.trim().to_string())
    };
    Ok(Some((key.to_string(), value)))
}

fn parse_posting(line: &str, line_no: usize) -> Result<Posting, ParseError> {
    let tokens = tokenize(line, line_no)?;
    let mut cursor = Cursor::new(&tokens, line_no);

    let flag = match cursor.peek() {
        Some(Token::Word(word)) if word == "*" || word == "!" => {
            cursor.pos += 1;
            Flag::from_symbol(word)
        }
        _ => None,
    };
    let account = cursor.account()?;
    let mut posting = Posting {
        flag,
        ..Posting::elided(&account)
    };

    if let Some(Token::Word(_)) = cursor.peek() {
        posting.amount = Some(parse_number(cursor.word("amount")?, line_no)?);
        posting.currency = Some(cursor.word("currency")?.to_string());
    }

    match cursor.peek() {
        Some(Token::OpenBrace) => {
            cursor.pos += 1;
            posting.cost = Some(parse_cost(&mut cursor, false)?);
        }
        Some(Token::OpenTotal) => {
            cursor.pos += 1;
            posting.cost = Some(parse_cost(&mut cursor, true)?);
        }
        _ => {}
    }

    let total_price = match cursor.peek() {
        Some(Token::At) => Some(false),
        Some(Token::AtAt) => Some(true),
        _ => None,
    };
    if let Some(is_total_price) = total_price {
        cursor.pos += 1;
        posting.price = Some(PriceAnnotation {
            amount: parse_number(cursor.word("price amount")?, line_no)?,
            currency: cursor.word("price currency")?.to_string(),
            is_total_price,
        });
    }

    if posting.amount.is_none() && (posting.cost.is_some() || posting.price.is_some()) {
        return Err(ParseError::new(
            line_no,
            "cost or price requires an explicit amount",
        ));
    }

    match cursor.advance() {
        None => {}
        Some(Token::Comment(comment)) => {
            if !comment.is_empty() {
                posting.comment = Some(comment.clone());
            }
        }
        Some(other) => return Err(ParseError::new(line_no, format!("unexpected {other:?}"))),
    }
    Ok(posting)
}

fn parse_cost(cursor: &mut Cursor<'_>, is_total_cost: bool) -> Result<Cost, ParseError> {
    let close = if is_total_cost {
        Token::CloseTotal
    } else {
        Token::CloseBrace
    };
    let mut cost = Cost {
        is_total_cost,
        ..Cost::default()
    };
    let line = cursor.line;
    loop {
        match cursor.advance() {
            Some(token) if *token == close => break,
            Some(Token::Comma) => {}
            Some(Token::Str(label)) => {
                if cost.label.replace(label.clone()).is_some() {
                    return Err(cursor.error("lot label given twice"));
                }
            }
            Some(Token::Word(word)) => {
                if let Ok(date) = parse_date(word, line) {
                    if cost.acquisition_date.replace(date).is_some() {
                        return Err(cursor.error("lot date given twice"));
                    }
                    continue;
                }
                let amount = parse_number(word, line)?;
                let currency = cursor.word("cost currency")?;
                if cost.amount.replace(amount).is_some() {
                    return Err(cursor.error("lot cost given twice"));
                }
                cost.currency = Some(currency.to_string());
            }
            Some(other) => return Err(cursor.error(format!("unexpected {other:?} in cost"))),
            None => return Err(cursor.error("unterminated cost")),
        }
    }
    Ok(cost)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn dec(value: &str) -> Decimal {
        Decimal::from_str(value).unwrap()
    }

    fn date(value: &str) -> NaiveDate {
        NaiveDate::parse_from_str(value, "%Y-%m-%d").unwrap()
    }

    fn purchase() -> LedgerEntry {
        let mut meta = Metadata::new();
        meta.insert("receipt".to_string(), "scan-0042.pdf".into());
        let mut broker = Posting {
            cost: Some(Cost {
                amount: Some(dec("150.00")),
                currency: Some("USD".to_string()),
                acquisition_date: Some(date("2025-02-28")),
                label: Some("lot \"A\"".to_string()),
                is_total_cost: false,
            }),
            comment: Some("first buy".to_string()),
            ..Posting::new("Assets:Broker:Acme", dec("2"), "ACME")
        };
        broker.meta.insert("confirmation".to_string(), "X-17".into());
        LedgerEntry {
            id: "4f0a6c9e-2b1d-4c35-9a57-0d8e6f1b2c3d".to_string(),
            date: date("2025-03-01"),
            meta,
            kind: EntryKind::Transaction(Transaction {
                flag: Flag::Incomplete,
                payee: Some("Broker".to_string()),
                narration: "Buy ACME".to_string(),
                tags: ["invest".to_string()].into_iter().collect(),
                links: ["trade-17".to_string()].into_iter().collect(),
                postings: vec![
                    broker,
                    Posting {
                        flag: Some(Flag::Complete),
                        ..Posting::new("Assets:Checking", dec("-300.00"), "USD")
                    },
                    Posting {
                        price: Some(PriceAnnotation {
                            amount: dec("1.10"),
                            currency: "USD".to_string(),
                            is_total_price: false,
                        }),
                        ..Posting::new("Assets:Euro", dec("0"), "EUR")
                    },
                ],
            }),
            source: None,
        }
    }

    #[test]
    fn encodes_transaction_canonically() {
        let entry = LedgerEntry {
            id: "abc".to_string(),
            date: date("2025-03-01"),
            meta: Metadata::new(),
            kind: EntryKind::Transaction(Transaction {
                flag: Flag::Complete,
                payee: Some("Coffee Shop".to_string()),
                narration: String::new(),
                tags: BTreeSet::new(),
                links: BTreeSet::new(),
                postings: vec![
                    Posting::new("Expenses:Food", dec("4.50"), "USD"),
                    Posting::new("Assets:Checking", dec("-4.50"), "USD"),
                ],
            }),
            source: None,
        };
        assert_eq!(
            encode(&entry),
            "2025-03-01 * \"Coffee Shop\" \"\"\n\
             \x20 id: \"abc\"\n\
             \x20 Expenses:Food     4.50 USD\n\
             \x20 Assets:Checking  -4.50 USD\n"
        );
    }

    #[test]
    fn encodes_lots_and_prices() {
        let text = encode(&purchase());
        assert!(text.contains(
            "  ! Assets:Broker:Acme        2 ACME {150.00 USD, 2025-02-28, \"lot \\\"A\\\"\"}  ; first buy\n"
        ));
        assert!(text.contains("    confirmation: \"X-17\"\n"));
        assert!(text.contains("Assets:Euro                 0 EUR @ 1.10 USD\n"));
        assert!(text.starts_with("2025-03-01 ! \"Broker\" \"Buy ACME\" #invest ^trade-17\n  id: "));
    }

    #[test]
    fn total_cost_uses_double_braces() {
        let cost = Cost {
            amount: Some(dec("1500")),
            currency: Some("USD".to_string()),
            is_total_cost: true,
            ..Cost::default()
        };
        assert_eq!(render_cost(&cost), "{{1500 USD}}");
        let by_label = Cost {
            label: Some("ref-001".to_string()),
            ..Cost::default()
        };
        assert_eq!(render_cost(&by_label), "{\"ref-001\"}");
    }

    #[test]
    fn round_trips_every_variant() {
        let with_id = |kind| LedgerEntry::new(date("2024-06-30"), kind).with_id("id-1");
        let entries = vec![
            purchase(),
            with_id(EntryKind::Balance(Balance {
                account: "Assets:Checking".to_string(),
                amount: dec("1200.00"),
                currency: "USD".to_string(),
                tolerance: Some(dec("0.01")),
            })),
            with_id(EntryKind::Note(Note {
                account: "Assets:Checking".to_string(),
                comment: "Called the bank".to_string(),
                tags: ["followup".to_string()].into_iter().collect(),
                links: BTreeSet::new(),
            })),
            with_id(EntryKind::Pad(Pad {
                account: "Assets:Checking".to_string(),
                source_account: "Equity:Opening-Balances".to_string(),
            })),
            with_id(EntryKind::Open(Open {
                account: "Assets:Broker:Acme".to_string(),
                currencies: vec!["ACME".to_string(), "USD".to_string()],
                booking: Some(Booking::Fifo),
            })),
            with_id(EntryKind::Close(Close {
                account: "Assets:Old".to_string(),
            })),
            with_id(EntryKind::Price(Price {
                commodity: "ACME".to_string(),
                amount: dec("151.25"),
                currency: "USD".to_string(),
            })),
            with_id(EntryKind::Commodity(Commodity {
                currency: "ACME".to_string(),
            })),
            with_id(EntryKind::Event(Event {
                event_type: "location".to_string(),
                description: "Berlin".to_string(),
            })),
        ];
        for entry in entries {
            let text = encode(&entry);
            assert_eq!(decode(&text).unwrap(), entry, "{text}");
        }
    }

    #[test]
    fn decodes_hand_written_variants() {
        let text = "2024-01-05 txn Groceries for the week #food\n\
                    \x20   Expenses:Food   1,234.50 USD ; big shop\n\
                    \x20   Assets:Checking\n";
        let entry = decode(text).unwrap();
        let txn = entry.as_transaction().unwrap();
        assert_eq!(txn.flag, Flag::Complete);
        assert_eq!(txn.payee, None);
        assert_eq!(txn.narration, "Groceries for the week");
        assert!(txn.tags.contains("food"));
        assert_eq!(txn.postings[0].amount, Some(dec("1234.50")));
        assert_eq!(txn.postings[0].comment.as_deref(), Some("big shop"));
        assert_eq!(txn.postings[1].amount, None);
    }

    #[test]
    fn decodes_legacy_balance_tolerance() {
        let entry = decode("2024-01-31 balance Assets:Checking 100.00 USD ~ 0.01 USD\n").unwrap();
        let EntryKind::Balance(balance) = entry.kind else {
            panic!("expected balance");
        };
        assert_eq!(balance.tolerance, Some(dec("0.01")));
        assert_eq!(balance.currency, "USD");
    }

    #[test]
    fn missing_id_gets_stable_content_id() {
        let text = "2024-01-01 open Assets:Checking USD\n";
        let first = decode(text).unwrap();
        let reformatted = decode("2024-01-01   open   Assets:Checking   USD ; opened\n").unwrap();
        assert!(!first.id.is_empty());
        assert_eq!(first.id, reformatted.id);
        let other = decode("2024-01-01 open Assets:Savings USD\n").unwrap();
        assert_ne!(first.id, other.id);
    }

    #[test]
    fn metadata_attaches_to_owner() {
        let text = "2024-02-01 * \"Rent\"\n\
                    \x20 id: \"rent-feb\"\n\
                    \x20 invoice: \"2024-02\"\n\
                    \x20 Expenses:Rent  900 USD\n\
                    \x20   period: \"february\"\n\
                    \x20 Assets:Checking  -900 USD\n";
        let entry = decode(text).unwrap();
        assert_eq!(entry.id, "rent-feb");
        assert_eq!(entry.meta.get("invoice"), Some(&MetaValue::from("2024-02")));
        assert!(!entry.meta.contains_key(ID_META_KEY));
        let txn = entry.as_transaction().unwrap();
        assert_eq!(
            txn.postings[0].meta.get("period"),
            Some(&MetaValue::from("february"))
        );
        assert!(txn.postings[1].meta.is_empty());
    }

    #[test]
    fn unquoted_metadata_keeps_its_form() {
        let text = "2024-02-01 open Assets:Card\n\
                    \x20 id: \"card\"\n\
                    \x20 limit: 10 USD ; raised in march\n\
                    \x20 opened-on: 2024-01-01\n\
                    \x20 owner: \"Sam\"\n\
                    \x20 pending:\n";
        let entry = decode(text).unwrap();
        assert_eq!(entry.meta.get("limit"), Some(&MetaValue::Other("10 USD".to_string())));
        assert_eq!(
            entry.meta.get("opened-on"),
            Some(&MetaValue::Other("2024-01-01".to_string()))
        );
        assert_eq!(entry.meta.get("owner"), Some(&MetaValue::from("Sam")));
        assert_eq!(entry.meta.get("pending"), Some(&MetaValue::Other(String::new())));

        let encoded = encode(&entry);
        assert!(encoded.contains("  limit: 10 USD\n"), "{encoded}");
        assert!(encoded.contains("  opened-on: 2024-01-01\n"), "{encoded}");
        assert!(encoded.contains("  owner: \"Sam\"\n"), "{encoded}");
        assert!(encoded.contains("  pending:\n"), "{encoded}");
        assert_eq!(decode(&encoded).unwrap(), entry);
    }

    #[test]
    fn valid_metadata_keys_round_trip() {
        let mut entry = purchase();
        entry.meta.insert("a-b_c1".to_string(), "x".into());
        if let EntryKind::Transaction(txn) = &mut entry.kind {
            txn.postings[1].meta.insert(ID_META_KEY.to_string(), "line-2".into());
        }
        entry
            .validate(&crate::entry::ValidationOptions::default())
            .unwrap();
        let text = encode(&entry);
        assert_eq!(decode(&text).unwrap(), entry, "{text}");
    }

    #[test]
    fn identical_directives_get_distinct_content_ids() {
        let text = "2024-01-01 open Assets:Cash USD\n";
        let mut ids = ContentIds::default();
        let first = ids.decode_at(text, 1).unwrap();
        let second = ids.decode_at(text, 3).unwrap();
        let other = ids.decode_at("2024-01-01 open Assets:Bank USD\n", 5).unwrap();
        assert_eq!(first.id, content_id(&first));
        assert_ne!(first.id, second.id);
        assert_eq!(other.id, content_id(&other));

        let mut again = ContentIds::default();
        assert_eq!(again.decode_at(text, 1).unwrap().id, first.id);
        assert_eq!(again.decode_at(text, 9).unwrap().id, second.id);

        let explicit = "2024-01-01 open Assets:Cash USD\n  id: \"cash\"\n";
        assert_eq!(again.decode_at(explicit, 11).unwrap().id, "cash");
    }

    #[test]
    fn rejects_malformed_spans_with_line_numbers() {
        let err = decode_at("2024-02-01 * \"Rent\"\n  Expenses:Rent  900\n", 40).unwrap_err();
        assert_eq!(err.line, 41);
        assert!(err.reason.contains("currency"), "{}", err.reason);

        let err = decode("2024-13-01 close Assets:Old\n").unwrap_err();
        assert_eq!(err.line, 1);
        assert!(err.reason.contains("invalid date"));

        let err = decode("2024-01-01 document Assets:Old \"x.pdf\"\n").unwrap_err();
        assert!(err.reason.contains("unsupported directive"));

        let err = decode("2024-01-01 * \"Bad\n").unwrap_err();
        assert_eq!(err.reason, "unterminated string");

        let err = decode("2024-01-01 * \"x\"\n  Assets:Cash  1 USD {2 EUR\n").unwrap_err();
        assert_eq!(err.reason, "unterminated cost");
    }

    #[test]
    fn parse_error_display_includes_file() {
        let err = ParseError::new(3, "bad").in_file("main.beancount");
        assert_eq!(err.to_string(), "main.beancount: line 3: bad");
    }
}
