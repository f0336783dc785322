//! Cleanup passes applied to Markdown produced from a scraped section.
//!
//! Every pass is a `&str -> String` function. Passes that touch inline markup
//! leave fenced code untouched.

use std::sync::LazyLock;

use regex::Regex;
use url::Url;

/// Run all passes over raw converter output.
pub(crate) fn run_pipeline(md: &str, base_url: Option<&Url>) -> String {
    let md = fix_fence_languages(md);
    let md = outside_fences(&md, strip_container_tags);
    let md = outside_fences(&md, |line| resolve_links(line, base_url));
    let md = trim_line_ends(&md);
    collapse_blank_lines(&md).trim().to_string()
}

/// Apply `pass` to every line that is not part of a fenced code block.
fn outside_fences(md: &str, pass: impl Fn(&str) -> String) -> String {
    let mut fence: Option<&str> = None;
    let mut out = Vec::new();

    for line in md.lines() {
        let marker = ["```", "~~~"]
            .into_iter()
            .find(|m| line.trim_start().starts_with(m));

        match (marker, fence) {
            (Some(m), None) => {
                fence = Some(m);
                out.push(line.to_string());
            }
            (Some(m), Some(open)) => {
                if m == open {
                    fence = None;
                }
                out.push(line.to_string());
            }
            (None, Some(_)) => out.push(line.to_string()),
            (None, None) => out.push(pass(line)),
        }
    }

    out.join("\n")
}

// ---------------------------------------------------------------------------
// Passes
// ---------------------------------------------------------------------------

/// Turn class-style hints (`language-js`, `lang-py`) into bare info strings.
fn fix_fence_languages(md: &str) -> String {
    static LANG_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?m)^(```|~~~)(?:language-|lang-|highlight-)(\w+)").expect("valid regex")
    });

    LANG_RE.replace_all(md, "$1$2").into_owned()
}

/// Drop layout tags the converter passed through, keeping their text.
fn strip_container_tags(line: &str) -> String {
    static TAG_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(
            r"</?(?:div|span|section|article|aside|header|footer|figure|figcaption|details|summary|main)(?:\s[^>]*)?>",
        )
        .expect("valid regex")
    });

    TAG_RE.replace_all(line, "").into_owned()
}

/// Make relative link targets absolute so sections stand on their own.
fn resolve_links(line: &str, base_url: Option<&Url>) -> String {
    static LINK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(!?)\[([^\]]*)\]\(([^)\s]+)\)").expect("valid regex"));

    let Some(base) = base_url else {
        return line.to_string();
    };

    LINK_RE
        .replace_all(line, |caps: &regex::Captures| {
            let (bang, text, href) = (&caps[1], &caps[2], &caps[3]);
            if href.starts_with('#') || Url::parse(href).is_ok() {
                return caps[0].to_string();
            }
            match base.join(href) {
                Ok(resolved) => format!("{bang}[{text}]({resolved})"),
                Err(_) => caps[0].to_string(),
            }
        })
        .into_owned()
}

fn trim_line_ends(md: &str) -> String {
    md.lines().map(str::trim_end).collect::<Vec<_>>().join("\n")
}

/// Collapse runs of blank lines into one blank line.
fn collapse_blank_lines(md: &str) -> String {
    static BLANK_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\n{3,}").expect("valid regex"));

    BLANK_RE.replace_all(md, "\n\n").into_owned()
}
