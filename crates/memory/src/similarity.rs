//! Text and vector similarity used by triage and the maintenance pass.

use std::sync::LazyLock;

use regex::Regex;

/// Leading `- (YYYY-MM-DD) ` bullet-date prefix, as rendered into the
/// canonical document.  Stripped before comparing so re-dated restatements
/// of the same fact still match.
static DATE_BULLET_PREFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^-\s*\(\d{4}-\d{2}-\d{2}\)\s*").expect("static regex"));

/// Comparison window.  Long entries differ mostly in their tails; the first
/// hundred characters are what decides whether two bullets say the same thing.
const MATCH_PREFIX_CHARS: usize = 100;

/// Strip one leading `- (YYYY-MM-DD) ` prefix, leaving the rest untouched.
pub fn strip_date_bullet(text: &str) -> &str {
    match DATE_BULLET_PREFIX_RE.find(text.trim_start()) {
        Some(m) => &text.trim_start()[m.end()..],
        None => text,
    }
}

/// Normalize a line for duplicate matching: strip one leading bullet-date
/// prefix, case-fold, collapse whitespace runs, truncate.
pub fn normalize_for_match(text: &str) -> String {
    let stripped = DATE_BULLET_PREFIX_RE.replace(text.trim(), "");
    let collapsed = stripped
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase();
    collapsed.chars().take(MATCH_PREFIX_CHARS).collect()
}

/// Normalized edit-distance similarity in `[0, 1]`:
/// `1 − levenshtein(a, b) / max(len)`.  Two empty strings score 1.
pub fn similarity_score(a: &str, b: &str) -> f64 {
    let a = normalize_for_match(a);
    let b = normalize_for_match(b);
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - levenshtein(&a, &b) as f64 / max_len as f64
}

/// Best similarity against a set of candidates.  Returns the winning index
/// and score, or `None` when `candidates` is empty.
pub fn best_match<'a, I>(needle: &str, candidates: I) -> Option<(usize, f64)>
where
    I: IntoIterator<Item = &'a str>,
{
    candidates
        .into_iter()
        .enumerate()
        .map(|(idx, candidate)| (idx, similarity_score(needle, candidate)))
        .max_by(|(_, left), (_, right)| left.total_cmp(right))
}

/// Classic char-level Levenshtein distance.
fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let (m, n) = (a.len(), b.len());
    if m == 0 {
        return n;
    }
    if n == 0 {
        return m;
    }

    // Single-row DP: prev holds row i-1, curr is built in place.
    let mut prev: Vec<usize> = (0..=n).collect();
    let mut curr = vec![0usize; n + 1];
    for i in 1..=m {
        curr[0] = i;
        for j in 1..=n {
            let cost = usize::from(a[i - 1] != b[j - 1]);
            curr[j] = (prev[j] + 1).min(curr[j - 1] + 1).min(prev[j - 1] + cost);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[n]
}

/// Cosine similarity between two embedding vectors.
///
/// Defined as `0` when the vectors differ in length or either norm is zero,
/// so degenerate points can never clear a merge threshold.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a == 0.0 || mag_b == 0.0 {
        return 0.0;
    }
    dot / (mag_a * mag_b)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
