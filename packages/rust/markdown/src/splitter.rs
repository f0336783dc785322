//! Structure-aware recursive chunker.
//!
//! Splits Markdown into pieces of at most `max_size` characters, trying
//! delimiter levels from coarsest to finest: headings `#` through `######`,
//! then horizontal rules. Fenced code blocks are never split, so a single
//! oversized fence comes out as one irreducible chunk.

/// Index of the horizontal-rule level; heading level `n` maps to `n - 1`.
const RULE_LEVEL: usize = 6;

/// Number of delimiter levels.
const LEVEL_COUNT: usize = 7;

/// Split `text` into chunks of at most `max_size` characters where structure
/// allows it.
///
/// The returned iterator is lazy: each call to `next` refines only as much of
/// the pending input as it needs. It borrows `text`, so calling `split` again
/// restarts from the beginning.
pub fn split(text: &str, max_size: usize) -> Chunks<'_> {
    Chunks {
        max_size,
        pending: vec![(text, 0)],
    }
}

/// Iterator over chunks produced by [`split`].
#[derive(Debug, Clone)]
pub struct Chunks<'a> {
    max_size: usize,
    /// Work stack of `(slice, first level still to try)`, last item next.
    pending: Vec<(&'a str, usize)>,
}

impl Iterator for Chunks<'_> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        while let Some((text, level)) = self.pending.pop() {
            if char_len(text) > self.max_size {
                if let Some(found) = splittable_level(text, level) {
                    let pieces = split_at_level(text, found);
                    // Reverse so the first piece is popped first.
                    self.pending
                        .extend(pieces.into_iter().rev().map(|piece| (piece, found + 1)));
                    continue;
                }
            }

            let chunk = strip_rules(text);
            if !chunk.trim().is_empty() {
                return Some(chunk);
            }
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Line classification
// ---------------------------------------------------------------------------

/// Fence marker a line opens or closes with, if any.
fn fence_marker(line: &str) -> Option<&'static str> {
    if line.starts_with("```") {
        Some("```")
    } else if line.starts_with("~~~") {
        Some("~~~")
    } else {
        None
    }
}

/// Delimiter level of a line outside a fence, if it is a delimiter.
fn delimiter_level(line: &str) -> Option<usize> {
    let line = line.trim_end_matches(['\n', '\r']);

    let hashes = line.bytes().take_while(|b| *b == b'#').count();
    if (1..=6).contains(&hashes) {
        let rest = &line[hashes..];
        return match rest.chars().next() {
            Some(c) if c.is_whitespace() => Some(hashes - 1),
            _ => None,
        };
    }

    if is_rule(line) { Some(RULE_LEVEL) } else { None }
}

/// Whether a line is a horizontal rule such as `---`, `***` or `___`.
fn is_rule(line: &str) -> bool {
    let body = line.trim();
    body.chars().count() >= 3 && body.chars().all(|c| matches!(c, '-' | '*' | '_'))
}

/// Walk the lines of `text`, reporting each with whether it sits inside a
/// fenced block (fence lines themselves count as inside).
fn for_each_line<'a>(text: &'a str, mut f: impl FnMut(&'a str, bool)) {
    let mut open: Option<&'static str> = None;
    for line in text.split_inclusive('\n') {
        match (fence_marker(line), open) {
            (Some(marker), None) => {
                open = Some(marker);
                f(line, true);
            }
            (Some(marker), Some(current)) => {
                if marker == current {
                    open = None;
                }
                f(line, true);
            }
            (None, Some(_)) => f(line, true),
            (None, None) => f(line, false),
        }
    }
}

// ---------------------------------------------------------------------------
// Splitting
// ---------------------------------------------------------------------------

/// First level at or after `from` with a delimiter line outside any fence.
fn splittable_level(text: &str, from: usize) -> Option<usize> {
    if from >= LEVEL_COUNT {
        return None;
    }

    let mut best: Option<usize> = None;
    for_each_line(text, |line, fenced| {
        if fenced {
            return;
        }
        if let Some(level) = delimiter_level(line) {
            if level >= from && best.is_none_or(|b| level < b) {
                best = Some(level);
            }
        }
    });
    best
}

/// Split `text` at every delimiter line of exactly `level`.
///
/// Heading lines start the next piece. Rule lines end the current piece and
/// are dropped. Every piece is a contiguous slice of `text`.
fn split_at_level(text: &str, level: usize) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut offset = 0;

    for_each_line(text, |line, fenced| {
        let line_start = offset;
        offset += line.len();

        if fenced || delimiter_level(line) != Some(level) {
            return;
        }

        let piece = &text[start..line_start];
        if !piece.trim().is_empty() {
            pieces.push(piece);
        }
        start = if level == RULE_LEVEL { offset } else { line_start };
    });

    let rest = &text[start..];
    if !rest.trim().is_empty() && !is_rule(rest) {
        pieces.push(rest);
    }
    pieces
}

/// Remove rule lines that sit outside fences.
fn strip_rules(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for_each_line(text, |line, fenced| {
        if fenced || !is_rule(line) {
            out.push_str(line);
        }
    });
    out
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}
