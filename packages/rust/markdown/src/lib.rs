//! Markdown handling for scraped pages.
//!
//! - [`html_to_markdown`] turns one section of scraped HTML into clean
//!   Markdown via `htmd` plus a cleanup pipeline.
//! - [`split`] is the structure-aware chunker used for section-less pages and
//!   batch re-ingestion.

mod cleanup;
mod splitter;

use std::sync::LazyLock;

use scraper::{ElementRef, Html, Selector};
use tracing::{debug, instrument};
use url::Url;

use runbook_shared::{Result, RunbookError};

pub use splitter::{Chunks, split};

/// Tags dropped by the converter.
const SKIPPED_TAGS: [&str; 7] = ["script", "style", "nav", "iframe", "noscript", "svg", "button"];

// ---------------------------------------------------------------------------
// Converter
// ---------------------------------------------------------------------------

/// Convert an HTML fragment to Markdown.
///
/// Tables are rendered as pipe tables first, since `htmd` leaves them as
/// inline text. Relative links are resolved against `base_url` when given.
#[instrument(skip_all, fields(html_len = html.len()))]
pub fn html_to_markdown(html: &str, base_url: Option<&Url>) -> Result<String> {
    let html = render_tables(html);

    let converter = htmd::HtmlToMarkdown::builder()
        .skip_tags(SKIPPED_TAGS.to_vec())
        .build();

    let raw = converter
        .convert(&html)
        .map_err(|e| RunbookError::Conversion(format!("htmd conversion failed: {e}")))?;

    let cleaned = cleanup::run_pipeline(&raw, base_url);
    debug!(raw_len = raw.len(), cleaned_len = cleaned.len(), "converted section");
    Ok(cleaned)
}

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

static TABLE: LazyLock<Selector> = LazyLock::new(|| Selector::parse("table").expect("valid selector"));
static ROW: LazyLock<Selector> = LazyLock::new(|| Selector::parse("tr").expect("valid selector"));
static HEADER_CELL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("th").expect("valid selector"));
static DATA_CELL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("td").expect("valid selector"));

/// Replace every `<table>` in `html` with an equivalent pipe table.
fn render_tables(html: &str) -> String {
    let doc = Html::parse_fragment(html);
    let mut out = html.to_string();

    for table in doc.select(&TABLE) {
        out = out.replacen(&table.html(), &pipe_table(&table), 1);
    }
    out
}

fn cell_texts(row: &ElementRef<'_>, cells: &Selector) -> Vec<String> {
    row.select(cells)
        .map(|cell| {
            cell.text()
                .collect::<String>()
                .split_whitespace()
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect()
}

fn pipe_table(table: &ElementRef<'_>) -> String {
    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut has_header = false;

    for tr in table.select(&ROW) {
        let header = cell_texts(&tr, &HEADER_CELL);
        if !header.is_empty() {
            has_header = rows.is_empty();
            rows.push(header);
            continue;
        }
        let data = cell_texts(&tr, &DATA_CELL);
        if !data.is_empty() {
            rows.push(data);
        }
    }

    let width = rows.iter().map(Vec::len).max().unwrap_or(0);
    if width == 0 {
        return String::new();
    }
    for row in &mut rows {
        row.resize(width, String::new());
    }

    let line = |cells: &[String]| format!("| {} |\n", cells.join(" | "));
    let separator = line(&vec!["---".to_string(); width]);

    let mut md = String::from("\n\n");
    if has_header {
        md.push_str(&line(&rows[0]));
        md.push_str(&separator);
        for row in &rows[1..] {
            md.push_str(&line(row));
        }
    } else {
        md.push_str(&line(&vec![String::new(); width]));
        md.push_str(&separator);
        for row in &rows {
            md.push_str(&line(row));
        }
    }
    md.push('\n');
    md
}
