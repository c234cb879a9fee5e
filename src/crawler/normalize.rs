//! Row normalization
//!
//! Maps schema-agnostic table rows onto typed [`TradeRecord`]s:
//! - Header names resolve to known columns, exactly first and then by containment
//! - Numbers tolerate currency symbols, separators and parenthesized negatives
//! - Dates accept the handful of layouts the source has used
//! - The natural-key hash is derived from normalized values only

use crate::crawler::parser::RawRow;
use crate::storage::{TradeCode, TradeRecord};
use crate::ParseError;
use chrono::{NaiveDate, NaiveDateTime};
use sha2::{Digest, Sha256};

/// Columns the normalizer understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Column {
    DeleteMarker,
    FilingDate,
    TradeDate,
    Ticker,
    CompanyName,
    InsiderName,
    Title,
    TradeType,
    Price,
    Quantity,
    Owned,
    DeltaOwn,
    Value,
    InsiderCount,
    TradeCount,
    ViewLink,
    Unknown,
}

/// Lowercase header text to column, in partial-match priority order
const HEADER_TABLE: &[(&str, Column)] = &[
    ("x", Column::DeleteMarker),
    ("filing date", Column::FilingDate),
    ("trade date", Column::TradeDate),
    ("ticker", Column::Ticker),
    ("company name", Column::CompanyName),
    ("insider name", Column::InsiderName),
    ("title", Column::Title),
    ("trade type", Column::TradeType),
    ("price", Column::Price),
    ("qty", Column::Quantity),
    ("owned", Column::Owned),
    ("δown", Column::DeltaOwn),
    ("value", Column::Value),
    ("insider cnt", Column::InsiderCount),
    ("trade cnt", Column::TradeCount),
    ("view", Column::ViewLink),
];

const REQUIRED: &[(Column, &str)] = &[
    (Column::InsiderName, "insider_name"),
    (Column::Ticker, "ticker"),
    (Column::FilingDate, "filing_date"),
    (Column::TradeDate, "trade_date"),
];

const ABSENT_MARKERS: &[&str] = &["", "-", "n/a", "na", "nan", "none", "new", ">999%"];

/// Position of each known column in a table's header
#[derive(Debug, Clone)]
pub struct ColumnMap {
    columns: Vec<Column>,
}

impl ColumnMap {
    pub fn from_headers(headers: &[String]) -> Self {
        Self {
            columns: headers.iter().map(|h| match_header(h)).collect(),
        }
    }

    pub fn index_of(&self, column: Column) -> Option<usize> {
        self.columns.iter().position(|c| *c == column)
    }
}

fn match_header(header: &str) -> Column {
    let normalized = header
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();

    if let Some((_, column)) = HEADER_TABLE.iter().find(|(key, _)| *key == normalized) {
        return *column;
    }

    // Short keys like "x" would match nearly anything
    HEADER_TABLE
        .iter()
        .filter(|(key, _)| key.chars().count() >= 3)
        .find(|(key, _)| normalized.contains(key))
        .map(|(_, column)| *column)
        .unwrap_or(Column::Unknown)
}

/// Turns raw rows of one table into trade records
#[derive(Debug, Clone)]
pub struct RecordNormalizer {
    map: ColumnMap,
}

impl RecordNormalizer {
    /// Creates a normalizer for a table's header
    ///
    /// # Errors
    ///
    /// `ParseError::Structural` if a required column is missing from the
    /// header, since every row would fail.
    pub fn new(headers: &[String], table_id: &str) -> Result<Self, ParseError> {
        let map = ColumnMap::from_headers(headers);

        let missing: Vec<&str> = REQUIRED
            .iter()
            .filter(|(column, _)| map.index_of(*column).is_none())
            .map(|(_, name)| *name)
            .collect();
        if !missing.is_empty() {
            return Err(ParseError::Structural {
                table_id: table_id.to_string(),
                message: format!("is missing required columns: {}", missing.join(", ")),
            });
        }

        Ok(Self { map })
    }

    /// Normalizes one row
    ///
    /// # Errors
    ///
    /// `ParseError::Validation` naming the first required field that is
    /// missing or unparseable.
    pub fn normalize(&self, row: &RawRow, source: &str) -> Result<TradeRecord, ParseError> {
        let insider_name = self
            .text(row, Column::InsiderName)
            .ok_or_else(|| missing("insider_name"))?;

        let ticker_cell = self.text(row, Column::Ticker).ok_or_else(|| missing("ticker"))?;
        let (ticker, embedded_company) = split_ticker_company(&ticker_cell);
        if ticker.is_empty() {
            return Err(missing("ticker"));
        }

        let filing_cell = self
            .text(row, Column::FilingDate)
            .ok_or_else(|| missing("filing_date"))?;
        let filing_date = parse_datetime(&filing_cell).ok_or_else(|| ParseError::Validation {
            field: "filing_date",
            message: format!("unparseable date '{}'", filing_cell),
        })?;

        let trade_cell = self
            .text(row, Column::TradeDate)
            .ok_or_else(|| missing("trade_date"))?;
        let trade_date = parse_date(&trade_cell).ok_or_else(|| ParseError::Validation {
            field: "trade_date",
            message: format!("unparseable date '{}'", trade_cell),
        })?;

        let trade_code = self
            .text(row, Column::TradeType)
            .map(|t| parse_trade_code(&t))
            .unwrap_or(TradeCode::Unknown);

        let price = self.number(row, Column::Price);
        let quantity = self.number(row, Column::Quantity).map(|q| q.round() as i64);
        let owned = self.number(row, Column::Owned).map(|o| o.round() as i64);
        let delta_own = self.number(row, Column::DeltaOwn);
        let value = match self.map.index_of(Column::Value) {
            Some(_) => self.number(row, Column::Value),
            None => price.zip(quantity).map(|(p, q)| p * q as f64),
        };

        let form_url = row
            .links
            .iter()
            .find(|href| href.contains("form4") || href.contains("sec.gov"))
            .cloned();

        Ok(TradeRecord {
            hash_id: natural_key(&insider_name, &ticker, trade_date, trade_code, quantity),
            insider_name,
            title: self.text(row, Column::Title),
            company_name: self.text(row, Column::CompanyName).or(embedded_company),
            ticker,
            filing_date,
            trade_date,
            trade_code,
            price,
            quantity,
            owned,
            delta_own,
            value,
            form_url,
            source: source.to_string(),
        })
    }

    /// Collapsed cell text, None when the column is absent or the cell is empty
    fn text(&self, row: &RawRow, column: Column) -> Option<String> {
        let index = self.map.index_of(column)?;
        let text = collapse_whitespace(row.cells.get(index)?);
        (!text.is_empty()).then_some(text)
    }

    fn number(&self, row: &RawRow, column: Column) -> Option<f64> {
        let index = self.map.index_of(column)?;
        parse_number(row.cells.get(index)?)
    }
}

fn missing(field: &'static str) -> ParseError {
    ParseError::Validation {
        field,
        message: "missing or empty".to_string(),
    }
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Computes the natural-key hash of a filing
///
/// SHA-256 over lowercase insider name, uppercase ticker, ISO trade date,
/// trade code and quantity, joined with `|`.
pub fn natural_key(
    insider_name: &str,
    ticker: &str,
    trade_date: NaiveDate,
    trade_code: TradeCode,
    quantity: Option<i64>,
) -> String {
    let quantity = quantity.map_or_else(|| "none".to_string(), |q| q.to_string());
    let key = format!(
        "{}|{}|{}|{}|{}",
        collapse_whitespace(insider_name).to_lowercase(),
        ticker.trim().to_uppercase(),
        trade_date.format("%Y-%m-%d"),
        trade_code.as_str(),
        quantity
    );

    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    hex::encode(hasher.finalize())
}

/// Parses a number leniently
///
/// Strips `$ £ €`, thousands separators and a leading `+`; `(x)` is negative and
/// a trailing `%` yields a fraction. Absent markers (`-`, `n/a`, `New`, ...)
/// give None.
pub fn parse_number(text: &str) -> Option<f64> {
    let trimmed = text.trim();
    if ABSENT_MARKERS.contains(&trimmed.to_lowercase().as_str()) {
        return None;
    }

    let (negative, inner) = match trimmed.strip_prefix('(').and_then(|s| s.strip_suffix(')')) {
        Some(inner) => (true, inner),
        None => (false, trimmed),
    };

    let (percent, inner) = match inner.trim().strip_suffix('%') {
        Some(inner) => (true, inner),
        None => (false, inner.trim()),
    };

    let cleaned: String = inner
        .chars()
        .filter(|c| !matches!(c, '$' | '£' | '€' | ',' | '+') && !c.is_whitespace())
        .collect();

    let mut value: f64 = cleaned.parse().ok()?;
    if !value.is_finite() {
        return None;
    }
    if percent {
        value /= 100.0;
    }
    if negative {
        value = -value;
    }
    Some(value)
}

/// Parses a date in any of the accepted layouts
pub fn parse_date(text: &str) -> Option<NaiveDate> {
    let trimmed = collapse_whitespace(text);
    ["%Y-%m-%d", "%m/%d/%Y", "%b %d, %Y"]
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(&trimmed, format).ok())
        .or_else(|| parse_datetime(&trimmed).map(|dt| dt.date()))
}

/// Parses a timestamp; date-only values become midnight
pub fn parse_datetime(text: &str) -> Option<NaiveDateTime> {
    let trimmed = collapse_whitespace(text);
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%d %H:%M", "%m/%d/%Y %H:%M:%S"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(&trimmed, format).ok())
        .or_else(|| {
            ["%Y-%m-%d", "%m/%d/%Y", "%b %d, %Y"]
                .iter()
                .find_map(|format| NaiveDate::parse_from_str(&trimmed, format).ok())
                .and_then(|date| date.and_hms_opt(0, 0, 0))
        })
}

/// Splits a `TICKER Company` cell
///
/// The first token counts as a ticker only if it is at most 6 characters of
/// `A-Z` or `.`; otherwise the whole cell is the ticker.
pub fn split_ticker_company(cell: &str) -> (String, Option<String>) {
    let cell = collapse_whitespace(cell);
    match cell.split_once(' ') {
        Some((first, rest)) if is_ticker_token(first) => (first.to_string(), Some(rest.to_string())),
        _ => (cell.to_uppercase(), None),
    }
}

fn is_ticker_token(token: &str) -> bool {
    !token.is_empty()
        && token.len() <= 6
        && token.chars().all(|c| c.is_ascii_uppercase() || c == '.')
}

/// Parses a trade-type cell such as `P - Purchase` or `S - Sale+OE`
pub fn parse_trade_code(text: &str) -> TradeCode {
    let upper = text.trim().to_uppercase();
    let code = upper
        .split(|c: char| c == '-' || c.is_whitespace())
        .next()
        .unwrap_or("")
        .trim();

    match code {
        "S" if upper.contains("+OE") => TradeCode::SaleAfterExercise,
        "S+" => TradeCode::SaleAfterExercise,
        other => TradeCode::from_db_string(other),
    }
}
