//! Review lifecycle reconciliation.
//!
//! A human edits the review checklist (Markdown task-list syntax) between
//! pipeline runs.  `reconcile` compares that checklist against the
//! previously-persisted pending set and sorts every proposal into exactly one
//! bucket.  It is pure: the caller persists the resulting pending list and
//! rewrites the checklist only after the whole pass succeeds, so a failed run
//! changes nothing.

use chrono::{DateTime, Duration, Utc};
use tracing::info;

use crate::schema::{Proposal, ProposalId};

// ── Checklist ─────────────────────────────────────────────────────────────────

/// State of one checklist line: `- [ ]`, `- [x]`, or `- [-]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecklistMark {
    Unchecked,
    Checked,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct ChecklistEntry {
    pub id: ProposalId,
    pub mark: ChecklistMark,
    /// Whatever followed the id on the line; used as the description when a
    /// hand-added id has no stored record.
    pub note: String,
}

#[derive(Debug, Clone, Default)]
pub struct Checklist {
    pub entries: Vec<ChecklistEntry>,
}

impl Checklist {
    /// Parse a checklist document.  Lines that are not task-list items with a
    /// valid proposal id are ignored (headers, prose, hand-written notes).
    pub fn parse(raw: &str) -> Self {
        let mut entries = Vec::new();
        for line in raw.lines() {
            let line = line.trim();
            let (mark, rest) = if let Some(rest) = line.strip_prefix("- [ ]") {
                (ChecklistMark::Unchecked, rest)
            } else if let Some(rest) = line.strip_prefix("- [x]").or_else(|| line.strip_prefix("- [X]")) {
                (ChecklistMark::Checked, rest)
            } else if let Some(rest) = line.strip_prefix("- [-]") {
                (ChecklistMark::Deleted, rest)
            } else {
                continue;
            };

            let rest = rest.trim_start();
            let (id_token, note) = match rest.split_once(char::is_whitespace) {
                Some((token, note)) => (token, note.trim()),
                None => (rest, ""),
            };
            let Some(id) = ProposalId::parse(id_token) else {
                continue;
            };
            entries.push(ChecklistEntry {
                id,
                mark,
                note: note.to_string(),
            });
        }
        Self { entries }
    }

    pub fn mark_for(&self, id: &ProposalId) -> Option<ChecklistMark> {
        self.entries
            .iter()
            .find(|entry| &entry.id == id)
            .map(|entry| entry.mark)
    }

    /// Render the checklist document for a pending set.  Always unchecked:
    /// rendering happens after reconciliation, when every surviving entry is
    /// by definition still awaiting a decision.
    pub fn render(pending: &[Proposal]) -> String {
        let mut out = String::from(
            "# Memory Review Queue\n\n\
             Check `[x]` to approve, mark `[-]` to discard. Unreviewed items expire.\n\n",
        );
        for proposal in pending {
            let summary = proposal.change.lines().next().unwrap_or_default().trim();
            out.push_str(&format!(
                "- [ ] {} [{}] {}\n",
                proposal.id,
                proposal.section.label(),
                summary
            ));
        }
        out
    }
}

// ── Reconciliation ────────────────────────────────────────────────────────────

/// Result of one reconciliation pass.  The four proposal buckets are
/// disjoint; `next_pending_ids` is the pending set to persist afterwards.
#[derive(Debug, Clone, Default)]
pub struct ReviewOutcome {
    pub approved: Vec<Proposal>,
    pub rejected: Vec<Proposal>,
    pub expired: Vec<Proposal>,
    pub unchanged: Vec<Proposal>,
    /// Ids present in the checklist as unchecked but unknown to the pending
    /// store: treated as newly-discovered pending items, with the line note
    /// as their only description.
    pub discovered: Vec<(ProposalId, String)>,
    pub next_pending_ids: Vec<ProposalId>,
}

/// Reconcile the persisted pending set against the current checklist.
///
/// Decision per previously-pending proposal:
/// - checked in the checklist → approved
/// - explicitly deleted (`[-]`) → rejected
/// - absent from the checklist → rejected within the expiry window, expired
///   once `now - captured_at` reaches it (absence alone cannot distinguish a
///   human deletion from simple elapsed time; this split is deliberate,
///   inherited policy, pinned by tests rather than assumed correct)
/// - still unchecked → expired once past the window, otherwise unchanged
pub fn reconcile(
    previous: &[Proposal],
    checklist: &Checklist,
    now: DateTime<Utc>,
    expiry_days: u64,
) -> ReviewOutcome {
    let expiry = Duration::days(expiry_days as i64);
    let mut outcome = ReviewOutcome::default();

    for proposal in previous {
        let aged_out = now - proposal.captured_at >= expiry;
        match checklist.mark_for(&proposal.id) {
            Some(ChecklistMark::Checked) => outcome.approved.push(proposal.clone()),
            Some(ChecklistMark::Deleted) => outcome.rejected.push(proposal.clone()),
            None if aged_out => outcome.expired.push(proposal.clone()),
            None => outcome.rejected.push(proposal.clone()),
            Some(ChecklistMark::Unchecked) if aged_out => outcome.expired.push(proposal.clone()),
            Some(ChecklistMark::Unchecked) => outcome.unchanged.push(proposal.clone()),
        }
    }

    let known: std::collections::HashSet<&ProposalId> =
        previous.iter().map(|p| &p.id).collect();
    for entry in &checklist.entries {
        if entry.mark == ChecklistMark::Unchecked && !known.contains(&entry.id) {
            outcome
                .discovered
                .push((entry.id.clone(), entry.note.clone()));
        }
    }

    outcome.next_pending_ids = outcome
        .unchanged
        .iter()
        .map(|p| p.id.clone())
        .chain(outcome.discovered.iter().map(|(id, _)| id.clone()))
        .collect();

    info!(
        approved = outcome.approved.len(),
        rejected = outcome.rejected.len(),
        expired = outcome.expired.len(),
        unchanged = outcome.unchanged.len(),
        discovered = outcome.discovered.len(),
        "review reconciliation complete"
    );

    outcome
}

// ── Tests ─────────────────────────────────────────────────────────────────────
