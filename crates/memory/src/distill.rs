//! Observer-output distillation.
//!
//! The observer stage replies in a loosely XML-ish format: flat, non-nested
//! tags wrapping narrative/fact segments, with two legacy fallbacks (a flat
//! emoji-marked list, and fully unstructured text).  Parsing never fails:
//! malformed or absent tags degrade to the least-structured representation
//! the input still supports.

use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::schema::{ObserverOutput, Segment};

static SEGMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<segment>(.*?)</segment>").expect("static regex"));

/// Severity markers used by the legacy flat observer format.  Their presence
/// is what distinguishes "unstructured but usable" output from opaque text.
const SEVERITY_MARKERS: &[&str] = &["🔴", "🟠", "🟡", "🟢", "⚠️", "💡", "📌"];

/// Extract the content of the first `<{tag}>…</{tag}>` pair, if present.
///
/// The grammar is flat (no nesting), so plain substring search is enough and
/// avoids recompiling a regex per tag.
fn tag_content<'a>(raw: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = raw.find(&open)? + open.len();
    let end = raw[start..].find(&close)? + start;
    Some(&raw[start..end])
}

/// Strip a single leading bullet marker (`-`, `*`, `•`) from a fact line.
fn strip_bullet(line: &str) -> &str {
    let trimmed = line.trim();
    trimmed
        .strip_prefix('-')
        .or_else(|| trimmed.strip_prefix('*'))
        .or_else(|| trimmed.strip_prefix('•'))
        .map(str::trim_start)
        .unwrap_or(trimmed)
}

/// Parse all `<segment>` blocks out of `raw`.
///
/// Returns an empty vec when no segment tags are present, which signals the
/// caller to fall back to the legacy flat format.
pub fn parse_segments(raw: &str) -> Vec<Segment> {
    let mut segments = Vec::new();

    for captures in SEGMENT_RE.captures_iter(raw) {
        let block = captures.get(1).map(|m| m.as_str()).unwrap_or_default();

        let narrative = tag_content(block, "narrative")
            .map(str::trim)
            .unwrap_or_default()
            .to_string();

        let facts: Vec<String> = tag_content(block, "facts")
            .unwrap_or_default()
            .lines()
            .map(strip_bullet)
            .filter(|line| !line.is_empty())
            .map(ToString::to_string)
            .collect();

        if narrative.is_empty() && facts.is_empty() {
            continue;
        }
        segments.push(Segment { narrative, facts });
    }

    segments
}

/// Parse a full observer reply.
///
/// Resolution order:
/// 1. Wrapper tags (`<observations>`, `<current-task>`, `<suggested-response>`)
///    or `<segment>` blocks present → structured parse, `parsed = true`.
/// 2. No tags but legacy severity markers present → the whole reply is kept
///    as unstructured observations, `parsed = true`.
/// 3. Neither → `parsed = false`; the caller must treat the output as opaque.
pub fn parse_observer_output(raw: &str) -> ObserverOutput {
    let observations = tag_content(raw, "observations").map(str::trim);
    let current_task = tag_content(raw, "current-task").map(str::trim);
    let suggested_response = tag_content(raw, "suggested-response").map(str::trim);
    let segments = parse_segments(raw);

    let has_wrapper = observations.is_some()
        || current_task.is_some()
        || suggested_response.is_some()
        || !segments.is_empty();

    if has_wrapper {
        return ObserverOutput {
            observations: observations.unwrap_or_default().to_string(),
            segments,
            current_task: current_task.filter(|s| !s.is_empty()).map(ToString::to_string),
            suggested_response: suggested_response
                .filter(|s| !s.is_empty())
                .map(ToString::to_string),
            parsed: true,
        };
    }

    if SEVERITY_MARKERS.iter().any(|marker| raw.contains(marker)) {
        debug!("observer output has no wrapper tags; keeping flat marker format");
        return ObserverOutput {
            observations: raw.trim().to_string(),
            parsed: true,
            ..Default::default()
        };
    }

    debug!("observer output is unstructured and unmarked; treating as opaque");
    ObserverOutput::default()
}

// ── Tests ─────────────────────────────────────────────────────────────────────
