//! Cutting a fetched page into structural sections.
//!
//! Sections are chosen by the first splitting selector that matches. A
//! section whose Markdown is longer than `max_chunk_size` is cut again with
//! the next, finer selector; if that finds nothing the section is kept whole.

use std::collections::HashSet;
use std::sync::LazyLock;

use scraper::{ElementRef, Html, Selector};
use url::Url;

use runbook_markdown::html_to_markdown;
use runbook_shared::{Result, RunbookError, ScrapedLink, ScrapedSection, ScrapingConfig};

static LINK: LazyLock<Selector> = LazyLock::new(|| Selector::parse("a[href]").expect("valid selector"));

/// Walk `doc` and return its sections in document order.
pub(crate) fn extract_sections(
    doc: &Html,
    page_url: &Url,
    config: &ScrapingConfig,
) -> Result<Vec<ScrapedSection>> {
    let selectors = config
        .splitting_selectors
        .iter()
        .map(|s| parse_selector(s))
        .collect::<Result<Vec<_>>>()?;
    if selectors.is_empty() {
        return Ok(Vec::new());
    }

    let mut walker = SectionWalker {
        page_url,
        selectors,
        title_selector: parse_selector(&config.title_selector)?,
        id_selector: config
            .section_id_selector
            .as_deref()
            .map(parse_selector)
            .transpose()?,
        max_chunk_size: config.max_chunk_size,
        counter: 0,
        used_ids: HashSet::new(),
        sections: Vec::new(),
    };
    walker.walk(doc, None, 0)?;
    Ok(walker.sections)
}

fn parse_selector(selector: &str) -> Result<Selector> {
    Selector::parse(selector)
        .map_err(|e| RunbookError::config(format!("invalid CSS selector '{selector}': {e}")))
}

struct SectionWalker<'a> {
    page_url: &'a Url,
    selectors: Vec<Selector>,
    title_selector: Selector,
    id_selector: Option<Selector>,
    max_chunk_size: usize,
    counter: usize,
    used_ids: HashSet<String>,
    sections: Vec<ScrapedSection>,
}

impl SectionWalker<'_> {
    /// Emit the sections matched by selector `level` inside `scope` (the whole
    /// document when `None`). Returns how many sections were emitted.
    fn walk<'d>(&mut self, doc: &'d Html, scope: Option<ElementRef<'d>>, level: usize) -> Result<usize> {
        let selector = &self.selectors[level];
        let mut matches: Vec<ElementRef<'d>> = match scope {
            Some(element) => element.select(selector).collect(),
            None => doc.select(selector).collect(),
        };

        // Nested matches are covered by their outermost match.
        let ids: HashSet<_> = matches.iter().map(|m| m.id()).collect();
        matches.retain(|m| !m.ancestors().any(|a| ids.contains(&a.id())));

        let finer = level + 1 < self.selectors.len();
        if matches.is_empty() {
            return if finer { self.walk(doc, scope, level + 1) } else { Ok(0) };
        }

        let mut emitted = 0;
        for section in matches {
            let content = html_to_markdown(&section.html(), Some(self.page_url))?;
            if content.trim().is_empty() {
                continue;
            }

            if finer && content.chars().count() > self.max_chunk_size {
                let nested = self.walk(doc, Some(section), level + 1)?;
                if nested > 0 {
                    emitted += nested;
                    continue;
                }
            }

            self.emit(section, content);
            emitted += 1;
        }
        Ok(emitted)
    }

    fn emit(&mut self, section: ElementRef<'_>, content: String) {
        self.counter += 1;

        let explicit_id = match &self.id_selector {
            Some(selector) => section.select(selector).next().and_then(|el| el.value().id()),
            None => None,
        }
        .or_else(|| section.value().id())
        .filter(|id| !id.is_empty());

        let mut anchor_id = explicit_id.map_or_else(|| self.counter.to_string(), str::to_string);
        if !self.used_ids.insert(anchor_id.clone()) {
            anchor_id = format!("{anchor_id}-{}", self.counter);
            self.used_ids.insert(anchor_id.clone());
        }

        let title = section
            .select(&self.title_selector)
            .next()
            .map(|el| collapse_whitespace(el.text()))
            .unwrap_or_default();

        self.sections.push(ScrapedSection {
            anchor_id,
            title,
            content,
            links: extract_links(section, self.page_url),
        });
    }
}

/// Links inside `section`, resolved against the page URL.
///
/// Anchor-only, `javascript:`, `mailto:` and self links are dropped, as are
/// links without anchor text.
fn extract_links(section: ElementRef<'_>, page_url: &Url) -> Vec<ScrapedLink> {
    section
        .select(&LINK)
        .filter_map(|a| {
            let url = resolve_link(a.value().attr("href")?, page_url)?;
            let anchor_text = collapse_whitespace(a.text());
            (!anchor_text.is_empty()).then_some(ScrapedLink { url, anchor_text })
        })
        .collect()
}

/// Resolve `href` against `page_url`, strip its fragment and drop links that
/// point back at the page itself.
fn resolve_link(href: &str, page_url: &Url) -> Option<String> {
    let href = href.trim();
    if href.is_empty()
        || href.starts_with('#')
        || href.starts_with("javascript:")
        || href.starts_with("mailto:")
        || href.starts_with("tel:")
    {
        return None;
    }

    let mut resolved = page_url.join(href).ok()?;
    if !matches!(resolved.scheme(), "http" | "https") {
        return None;
    }
    resolved.set_fragment(None);

    let same_page = resolved.scheme() == page_url.scheme()
        && resolved.host_str() == page_url.host_str()
        && resolved.port_or_known_default() == page_url.port_or_known_default()
        && resolved.path() == page_url.path();
    (!same_page).then(|| resolved.to_string())
}

fn collapse_whitespace<'a>(text: impl Iterator<Item = &'a str>) -> String {
    text.collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}
