//! HTML table extraction
//!
//! This module locates the filings table on a page and turns it into
//! schema-agnostic rows:
//! - Header names from `thead th`, or the first row carrying `th` cells
//! - Data rows as ordered, whitespace-collapsed cell texts plus row links
//! - Rows padded or truncated to the header width instead of dropped

use crate::ParseError;
use scraper::{ElementRef, Html, Selector};

/// One table row, in table order
#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
    /// Zero-based position among the emitted data rows
    pub position: usize,

    /// Cell texts, exactly as many as there are headers
    pub cells: Vec<String>,

    /// Every `href` found in the row
    pub links: Vec<String>,
}

/// Headers and data rows extracted from a table
#[derive(Debug, Clone)]
pub struct ParsedTable {
    pub headers: Vec<String>,
    pub rows: Vec<RawRow>,
}

impl ParsedTable {
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Extracts the table with the given id from a page
///
/// # Arguments
///
/// * `html` - Page content
/// * `table_id` - The `id` attribute of the target table
/// * `max_rows` - Upper bound on emitted data rows
///
/// # Returns
///
/// * `Ok(ParsedTable)` - Headers and up to `max_rows` rows (possibly none)
/// * `Err(ParseError::Structural)` - The table or its header is missing
pub fn parse_table(html: &str, table_id: &str, max_rows: usize) -> Result<ParsedTable, ParseError> {
    let document = Html::parse_document(html);
    let table_selector = selector("table", table_id)?;

    let table = document
        .select(&table_selector)
        .find(|element| element.value().id() == Some(table_id))
        .ok_or_else(|| structural(table_id, "not found on page"))?;

    let headers = extract_headers(&table, table_id)?;
    if headers.is_empty() {
        return Err(structural(table_id, "has no header cells"));
    }

    let rows = extract_rows(&table, table_id, headers.len(), max_rows)?;

    tracing::debug!(
        table_id,
        columns = headers.len(),
        rows = rows.len(),
        "Parsed table"
    );

    Ok(ParsedTable { headers, rows })
}

fn extract_headers(table: &ElementRef<'_>, table_id: &str) -> Result<Vec<String>, ParseError> {
    let thead_selector = selector("thead th", table_id)?;
    let headers: Vec<String> = table.select(&thead_selector).map(|th| cell_text(&th)).collect();
    if !headers.is_empty() {
        return Ok(headers);
    }

    let row_selector = selector("tr", table_id)?;
    let th_selector = selector("th", table_id)?;
    Ok(table
        .select(&row_selector)
        .map(|row| row.select(&th_selector).map(|th| cell_text(&th)).collect::<Vec<_>>())
        .find(|cells| !cells.is_empty())
        .unwrap_or_default())
}

fn extract_rows(
    table: &ElementRef<'_>,
    table_id: &str,
    width: usize,
    max_rows: usize,
) -> Result<Vec<RawRow>, ParseError> {
    let row_selector = selector("tr", table_id)?;
    let cell_selector = selector("td", table_id)?;
    let link_selector = selector("a[href]", table_id)?;

    let mut rows = Vec::new();
    for row in table.select(&row_selector) {
        if rows.len() >= max_rows {
            break;
        }

        // Header rows carry only `th` cells
        let mut cells: Vec<String> = row.select(&cell_selector).map(|td| cell_text(&td)).collect();
        if cells.is_empty() {
            continue;
        }

        if cells.len() != width {
            tracing::debug!(
                table_id,
                position = rows.len(),
                found = cells.len(),
                expected = width,
                "Row width differs from header, padding or truncating"
            );
            cells.resize(width, String::new());
        }

        let links = row
            .select(&link_selector)
            .filter_map(|a| a.value().attr("href"))
            .map(str::to_string)
            .collect();

        rows.push(RawRow {
            position: rows.len(),
            cells,
            links,
        });
    }

    Ok(rows)
}

/// Collapses all whitespace runs (non-breaking spaces included) to single spaces
fn cell_text(element: &ElementRef<'_>) -> String {
    element.text().flat_map(str::split_whitespace).collect::<Vec<_>>().join(" ")
}

fn selector(css: &str, table_id: &str) -> Result<Selector, ParseError> {
    Selector::parse(css).map_err(|e| structural(table_id, &format!("selector '{}' invalid: {}", css, e)))
}

fn structural(table_id: &str, message: &str) -> ParseError {
    ParseError::Structural {
        table_id: table_id.to_string(),
        message: message.to_string(),
    }
}
