//! Proposal triage.
//!
//! `triage` is a pure decision function: it inspects a proposal against the
//! canonical document and the other pending proposals and classifies it,
//! without touching any state.  Side effects (deleting records, folding a
//! merge, writing the document) belong to the caller, which keeps every
//! branch of the decision table independently testable.

use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::schema::{Proposal, ProposalId};
use crate::similarity::{similarity_score, strip_date_bullet};

/// Classification of a proposal.  Exactly one applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriageAction {
    /// Safe to apply to the canonical document without a human decision.
    AutoPromote,
    /// Discard: empty, leaked instruction text, or a duplicate.
    AutoReject,
    /// Fold this proposal's content into another pending proposal
    /// (`merge_with`) and discard this record.
    AutoMerge,
    /// Park in the pending set and escalate for a human decision.
    NeedsReview,
}

#[derive(Debug, Clone)]
pub struct TriageDecision {
    pub action: TriageAction,
    pub reason: String,
    /// Target proposal for `AutoMerge`; `None` for every other action.
    pub merge_with: Option<ProposalId>,
}

impl TriageDecision {
    fn reject(reason: impl Into<String>) -> Self {
        Self {
            action: TriageAction::AutoReject,
            reason: reason.into(),
            merge_with: None,
        }
    }
}

/// Thresholds the decision function runs with; sourced from
/// `ConsolidationConfig` by the runtime.
#[derive(Debug, Clone, Copy)]
pub struct TriageParams {
    /// Similarity score at or above which two texts count as duplicates.
    pub duplicate_threshold: f64,
}

impl Default for TriageParams {
    fn default() -> Self {
        Self {
            duplicate_threshold: 0.85,
        }
    }
}

/// Imperative openers the reflection step sometimes echoes back from its own
/// instructions instead of producing content.  Checked after stripping a
/// leading date-bullet prefix, case-insensitively.
const INSTRUCTION_PREFIXES: &[&str] = &[
    "add after",
    "add before",
    "add under",
    "add to",
    "append",
    "insert",
    "replace",
    "consolidate",
    "merge",
    "move",
    "remove",
    "delete",
    "rewrite",
    "update the",
];

/// The literal rendered-bullet format.  A change that already carries it is
/// the reflection step echoing the example formatting it was shown.
static RAW_BULLET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^- \(\d{4}-\d{2}-\d{2}\) ").expect("static regex"));

static PAREN_DATE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(\d{4}-\d{2}-\d{2}\)").expect("static regex"));

static ADR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bADR[- ]?\d+").expect("static regex"));

static BACKTICK_TOKEN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"`[^`]+`").expect("static regex"));

static FILE_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9_.-]+/[A-Za-z0-9_./-]+").expect("static regex"));

static CONFIG_EXT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\.(toml|ya?ml|json|ini|conf|cfg|env)\b").expect("static regex"));

/// First/second-person opinion and preference wording.  Anything carrying it
/// is a judgement call, not a recordable fact.
static OPINION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(should|wants?|prefers?|never|always)\b").expect("static regex"));

/// Classify `proposal` against the canonical document text and the other
/// pending proposals.  First matching rule wins:
///
/// 1. empty change
/// 2. instruction-text artifact
/// 3. raw leaked bullet format
/// 4. duplicate of an existing canonical bullet
/// 5. duplicate of another pending proposal (longer text survives)
/// 6. factual, timestamped, low-risk → promote
/// 7. needs a human
pub fn triage(
    proposal: &Proposal,
    canonical_text: &str,
    pending: &[Proposal],
    params: &TriageParams,
) -> TriageDecision {
    let change = proposal.change.trim();

    if change.is_empty() {
        return TriageDecision::reject("empty proposal change");
    }

    let body = strip_date_bullet(change).trim().to_lowercase();
    if INSTRUCTION_PREFIXES.iter().any(|p| body.starts_with(p)) {
        return TriageDecision::reject("instruction text artifact");
    }

    if RAW_BULLET_RE.is_match(change) {
        return TriageDecision::reject("raw leaked bullet format");
    }

    if let Some((line, score)) = best_canonical_match(change, canonical_text) {
        if score >= params.duplicate_threshold {
            debug!(id = %proposal.id, score, line, "change duplicates an existing bullet");
            return TriageDecision::reject("duplicate of existing entry");
        }
    }

    let best_pending = pending
        .iter()
        .filter(|other| other.id != proposal.id)
        .map(|other| (other, similarity_score(change, &other.change)))
        .max_by(|(_, left), (_, right)| left.total_cmp(right));

    if let Some((other, score)) = best_pending {
        if score >= params.duplicate_threshold {
            // Duplicate pair: the longer change survives.  Strictly longer
            // means this proposal absorbs the other; otherwise the other is
            // kept as-is and this one is dropped.
            return if change.chars().count() > other.change.trim().chars().count() {
                TriageDecision {
                    action: TriageAction::AutoMerge,
                    reason: format!("absorbs shorter duplicate pending proposal {}", other.id),
                    merge_with: Some(other.id.clone()),
                }
            } else {
                TriageDecision::reject(format!("duplicate of pending proposal {}", other.id))
            };
        }
    }

    if is_promotable(proposal) {
        return TriageDecision {
            action: TriageAction::AutoPromote,
            reason: "factual timestamped technical update".to_string(),
            merge_with: None,
        };
    }

    TriageDecision {
        action: TriageAction::NeedsReview,
        reason: "ambiguous or preference-laden change".to_string(),
        merge_with: None,
    }
}

/// Best similarity against the bullet lines already in the canonical
/// document.  Returns the matching line and its score.
fn best_canonical_match<'a>(change: &str, canonical_text: &'a str) -> Option<(&'a str, f64)> {
    canonical_text
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with("- "))
        .map(|line| (line, similarity_score(change, line)))
        .max_by(|(_, left), (_, right)| left.total_cmp(right))
}

/// A change is promotable without review when it is a dated, concrete,
/// technical statement aimed at a low-risk structural section: it carries a
/// parenthesized date, at least one specific reference (ADR, file path,
/// backticked command, or config-file name), and no opinion wording.
fn is_promotable(proposal: &Proposal) -> bool {
    let change = proposal.change.as_str();
    PAREN_DATE_RE.is_match(change)
        && has_specific_reference(change)
        && proposal.section.is_low_risk()
        && !OPINION_RE.is_match(change)
}

fn has_specific_reference(change: &str) -> bool {
    ADR_RE.is_match(change)
        || BACKTICK_TOKEN_RE.is_match(change)
        || FILE_PATH_RE.is_match(change)
        || CONFIG_EXT_RE.is_match(change)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::{TriageAction, TriageParams, triage};
    use crate::schema::{Proposal, ProposalId, Section};

    fn proposal(id: &str, section: Section, change: &str) -> Proposal {
        Proposal {
            id: ProposalId::parse(id).unwrap(),
            section,
            change: change.to_string(),
            source: None,
            captured_at: Utc::now(),
        }
    }

    fn run(p: &Proposal, canonical: &str, pending: &[Proposal]) -> super::TriageDecision {
        triage(p, canonical, pending, &TriageParams::default())
    }

    const CANONICAL: &str = "\
## System Architecture
- (2026-01-02) Ingest runs through NATS JetStream

## Patterns
- (2026-01-03) Retries use jittered exponential backoff
";

    #[test]
    fn empty_or_whitespace_change_is_rejected() {
        for change in ["", "   ", "\n\t"] {
            let p = proposal("p-20260107-001", Section::Patterns, change);
            let decision = run(&p, CANONICAL, &[]);
            assert_eq!(decision.action, TriageAction::AutoReject);
            assert_eq!(decision.reason, "empty proposal change");
        }
    }

    #[test]
    fn instruction_text_is_rejected_even_behind_a_date_bullet() {
        for change in [
            "Replace the second bullet with the new wording",
            "consolidate both entries about retries",
            "- (2026-01-07) Add after the NATS entry: caching notes",
        ] {
            let p = proposal("p-20260107-001", Section::Patterns, change);
            let decision = run(&p, CANONICAL, &[]);
            assert_eq!(decision.action, TriageAction::AutoReject, "{change:?}");
            assert_eq!(decision.reason, "instruction text artifact");
        }
    }

    #[test]
    fn raw_bullet_format_is_rejected() {
        let p = proposal(
            "p-20260107-001",
            Section::Patterns,
            "- (2026-01-07) Workers drain queues before shutdown",
        );
        let decision = run(&p, CANONICAL, &[]);
        assert_eq!(decision.action, TriageAction::AutoReject);
        assert_eq!(decision.reason, "raw leaked bullet format");
    }

    #[test]
    fn duplicate_of_canonical_bullet_is_rejected() {
        let p = proposal(
            "p-20260107-001",
            Section::Patterns,
            "Retries use jittered exponential backoff",
        );
        let decision = run(&p, CANONICAL, &[]);
        assert_eq!(decision.action, TriageAction::AutoReject);
        assert_eq!(decision.reason, "duplicate of existing entry");
    }

    #[test]
    fn byte_identical_canonical_bullet_is_rejected_for_any_document() {
        let doc = "## Patterns\n- config lives in deploy/app.toml\n";
        let p = proposal("p-20260107-001", Section::Patterns, "config lives in deploy/app.toml");
        let decision = run(&p, doc, &[]);
        assert_eq!(decision.action, TriageAction::AutoReject);
    }

    #[test]
    fn shorter_duplicate_pending_proposal_rejects_current() {
        let longer = proposal(
            "p-20260106-001",
            Section::Patterns,
            "Deploy pipeline promotes images through staging then prod",
        );
        let current = proposal(
            "p-20260107-001",
            Section::Patterns,
            "Deploy pipeline promotes images through staging then prod",
        );
        let decision = run(&current, CANONICAL, std::slice::from_ref(&longer));
        // Equal length counts as "other is kept".
        assert_eq!(decision.action, TriageAction::AutoReject);
        assert!(decision.reason.contains("p-20260106-001"));
    }

    #[test]
    fn longer_duplicate_merges_into_the_other_record() {
        let shorter = proposal(
            "p-20260106-002",
            Section::Patterns,
            "Deploy pipeline promotes container images through staging before production",
        );
        let current = proposal(
            "p-20260107-001",
            Section::Patterns,
            "Deploy pipeline promotes container images through staging before production daily",
        );
        let decision = run(&current, CANONICAL, std::slice::from_ref(&shorter));
        assert_eq!(decision.action, TriageAction::AutoMerge);
        assert_eq!(decision.merge_with, Some(shorter.id.clone()));
    }

    #[test]
    fn merge_tie_break_always_discards_the_shorter_side() {
        let short_text = "Cache keys include the tenant id and the deployment region for isolation";
        let long_text = "Cache keys include the tenant id and the deployment region for isolation everywhere";
        let short_p = proposal("p-20260107-001", Section::Patterns, short_text);
        let long_p = proposal("p-20260107-002", Section::Patterns, long_text);

        // Short proposal triaged against pending long one: rejected.
        let d1 = run(&short_p, CANONICAL, std::slice::from_ref(&long_p));
        assert_eq!(d1.action, TriageAction::AutoReject);

        // Long proposal triaged against pending short one: merge, absorbing it.
        let d2 = run(&long_p, CANONICAL, std::slice::from_ref(&short_p));
        assert_eq!(d2.action, TriageAction::AutoMerge);
        assert_eq!(d2.merge_with, Some(short_p.id.clone()));
    }

    #[test]
    fn pending_comparison_skips_self() {
        let current = proposal("p-20260107-001", Section::Patterns, "Workers use a shared drain hook");
        let pending = vec![current.clone()];
        let decision = run(&current, CANONICAL, &pending);
        assert_ne!(decision.action, TriageAction::AutoMerge);
        assert_ne!(decision.reason, "duplicate of pending proposal p-20260107-001");
    }

    #[test]
    fn factual_timestamped_update_is_promoted() {
        let p = proposal(
            "p-20260107-001",
            Section::SystemArchitecture,
            "(2026-01-07) Migrated job queue to `nats-server` per ADR-41",
        );
        let decision = run(&p, CANONICAL, &[]);
        assert_eq!(decision.action, TriageAction::AutoPromote);
        assert_eq!(decision.reason, "factual timestamped technical update");
    }

    #[test]
    fn file_path_counts_as_specific_reference() {
        let p = proposal(
            "p-20260107-001",
            Section::Patterns,
            "(2026-01-07) Worker pool sizing moved to infra/worker.toml",
        );
        assert_eq!(run(&p, CANONICAL, &[]).action, TriageAction::AutoPromote);
    }

    #[test]
    fn opinion_wording_forces_review() {
        let p = proposal(
            "p-20260107-001",
            Section::Patterns,
            "(2026-01-07) We should always gate deploys on infra/smoke.toml",
        );
        let decision = run(&p, CANONICAL, &[]);
        assert_eq!(decision.action, TriageAction::NeedsReview);
    }

    #[test]
    fn high_risk_section_forces_review() {
        let p = proposal(
            "p-20260107-001",
            Section::HardRules,
            "(2026-01-07) Rotate the signing key per ADR-9",
        );
        assert_eq!(run(&p, CANONICAL, &[]).action, TriageAction::NeedsReview);
    }

    #[test]
    fn undated_change_forces_review() {
        let p = proposal(
            "p-20260107-001",
            Section::Patterns,
            "Job queue migrated to `nats-server` per ADR-41",
        );
        assert_eq!(run(&p, CANONICAL, &[]).action, TriageAction::NeedsReview);
    }

    #[test]
    fn vague_change_without_references_forces_review() {
        let p = proposal(
            "p-20260107-001",
            Section::Patterns,
            "(2026-01-07) The team reorganised the deployment flow",
        );
        assert_eq!(run(&p, CANONICAL, &[]).action, TriageAction::NeedsReview);
    }
}
