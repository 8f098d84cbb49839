//! Pipeline passes.
//!
//! Each pass is one logical unit driven by the external scheduler: triage
//! (observer output → classified proposals), reconciliation (human checklist
//! → promoted/rejected/expired), and nightly store maintenance.  The first
//! two take the pass lock and compute every decision in memory before the
//! first write, so an aborted pass leaves upstream state untouched and a
//! retry is always safe.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use tracing::{info, instrument, warn};

use curator_config::AppConfig;
use curator_llm::{ProposalDraft, Provider, ReflectionRouter, parse_proposals};
use curator_memory::distill::parse_observer_output;
use curator_memory::review::reconcile;
use curator_memory::{
    CanonicalDocument, Checklist, DailyLog, LogOutcome, MaintenanceReport, PendingStore, Proposal,
    ProposalId, Section, StoreMaintainer, TriageAction, TriageParams, VectorStore,
    append_to_section, replace_atomic, triage,
};

use crate::lock::PassLock;
use crate::prompt::{REFLECTION_SYSTEM_PROMPT, build_reflection_prompt};
use crate::tracker::TrackerClient;

// ── Summaries ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct TriageSummary {
    /// Promoted ids with the section that received them.
    pub promoted: Vec<(ProposalId, String)>,
    /// Rejected ids with the triage reason.
    pub rejected: Vec<(ProposalId, String)>,
    /// `(discarded, kept)` pairs from duplicate folding.
    pub merged: Vec<(ProposalId, ProposalId)>,
    pub needs_review: Vec<ProposalId>,
    pub pending_total: usize,
}

#[derive(Debug, Default)]
pub struct ReconcileSummary {
    pub promoted: usize,
    pub rejected: usize,
    pub expired: usize,
    pub unchanged: usize,
    pub discovered: usize,
    /// Approved proposals whose target section could not take the write;
    /// they stay pending for human remediation instead of being dropped.
    pub held_for_remediation: usize,
}

// ── Pipeline ──────────────────────────────────────────────────────────────────

pub struct Pipeline {
    config: AppConfig,
    document: CanonicalDocument,
    pending: PendingStore,
    daily_log: DailyLog,
    tracker: Option<TrackerClient>,
}

impl Pipeline {
    pub fn new(config: AppConfig) -> Self {
        let document = CanonicalDocument::new(&config.storage.canonical_path);
        let pending = PendingStore::new(&config.storage.pending_path);
        let daily_log = DailyLog::new(&config.storage.daily_log_dir);
        let tracker = TrackerClient::from_config(&config.tracker);
        Self {
            config,
            document,
            pending,
            daily_log,
            tracker,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn pending_store(&self) -> &PendingStore {
        &self.pending
    }

    // ── Triage pass ────────────────────────────────────────────────────────

    /// Full triage pass: distill observer output, reflect, classify.
    #[instrument(skip(self, raw, router))]
    pub async fn triage_pass(
        &self,
        raw: &str,
        router: &ReflectionRouter,
    ) -> Result<TriageSummary> {
        let output = parse_observer_output(raw);
        if !output.parsed {
            info!("observer output is opaque; no proposals this run");
            return Ok(TriageSummary::default());
        }

        let canonical = self.document.read_or_seed().await?;
        let prompt = build_reflection_prompt(&output, &canonical);
        let primary = if self.config.llm.provider.eq_ignore_ascii_case("openrouter") {
            Provider::OpenRouter
        } else {
            Provider::Ollama
        };

        let (provider, reply) = router
            .generate_with_fallback(
                primary,
                &self.config.llm.ollama_model,
                &self.config.llm.openrouter_model,
                REFLECTION_SYSTEM_PROMPT,
                &prompt,
            )
            .await
            .context("reflection call failed")?;

        let drafts = parse_proposals(&reply);
        info!(?provider, drafts = drafts.len(), "reflection complete");
        self.triage_drafts(drafts).await
    }

    /// Classify a batch of drafts and apply the outcomes.
    ///
    /// Decision phase mutates only in-memory copies of the canonical text
    /// and pending set; the write phase then lands the final state in one
    /// atomic replace per file.  Promotions earlier in the batch are visible
    /// to later duplicate checks through the in-memory document.
    #[instrument(skip(self, drafts), fields(count = drafts.len()))]
    pub async fn triage_drafts(&self, drafts: Vec<ProposalDraft>) -> Result<TriageSummary> {
        let _lock = PassLock::acquire(&self.config.storage.lock_path)?;
        let now = Utc::now();
        let today = now.date_naive();

        let mut pending = self.pending.load().await?;
        let mut canonical = self.document.read_or_seed().await?;
        let params = TriageParams {
            duplicate_threshold: self.config.consolidation.duplicate_threshold,
        };
        let fallback = self.config.consolidation.fallback_section.clone();

        let mut summary = TriageSummary::default();
        let mut known_ids: Vec<ProposalId> = pending.iter().map(|p| p.id.clone()).collect();

        for draft in drafts {
            let id = ProposalId::next(today, &known_ids);
            known_ids.push(id.clone());

            let section_label = if draft.section.trim().is_empty() {
                fallback.clone()
            } else {
                draft.section.clone()
            };
            let proposal = Proposal {
                id: id.clone(),
                section: Section::from_label(&section_label),
                change: draft.change,
                source: draft.source,
                captured_at: now,
            };

            let decision = triage(&proposal, &canonical, &pending, &params);
            info!(id = %proposal.id, action = ?decision.action, reason = %decision.reason, "proposal triaged");

            match decision.action {
                TriageAction::AutoPromote => {
                    match append_to_section(
                        &canonical,
                        proposal.section.label(),
                        &proposal.bullet_line(),
                        Some(&fallback),
                    ) {
                        Ok(updated) => {
                            canonical = updated;
                            summary
                                .promoted
                                .push((id, proposal.section.label().to_string()));
                        }
                        Err(err) => {
                            // Integrity problem: the document cannot take the
                            // write.  Park the proposal for a human instead of
                            // dropping it.
                            warn!(%err, id = %proposal.id, "promotion target missing; routing to review");
                            summary.needs_review.push(id);
                            pending.push(proposal);
                        }
                    }
                }
                TriageAction::AutoReject => {
                    summary.rejected.push((id, decision.reason));
                }
                TriageAction::AutoMerge => {
                    let target_idx = decision
                        .merge_with
                        .as_ref()
                        .and_then(|target_id| pending.iter().position(|p| &p.id == target_id));
                    match target_idx {
                        Some(idx) => {
                            pending[idx].change = proposal.change;
                            summary.merged.push((id, pending[idx].id.clone()));
                        }
                        None => {
                            warn!(id = %proposal.id, "merge target vanished; routing to review");
                            summary.needs_review.push(id);
                            pending.push(proposal);
                        }
                    }
                }
                TriageAction::NeedsReview => {
                    summary.needs_review.push(id);
                    pending.push(proposal);
                }
            }
        }

        // Write phase.
        self.document.replace(&canonical).await?;
        self.pending.save(&pending).await?;
        replace_atomic(
            Path::new(&self.config.storage.checklist_path),
            &Checklist::render(&pending),
        )
        .await?;

        for (id, section) in &summary.promoted {
            self.daily_log
                .record(today, LogOutcome::Promoted, id.as_str(), &format!("promoted to {section}"))
                .await?;
        }
        for (id, reason) in &summary.rejected {
            self.daily_log
                .record(today, LogOutcome::Rejected, id.as_str(), reason)
                .await?;
        }

        if let Some(tracker) = &self.tracker {
            for id in &summary.needs_review {
                if let Some(proposal) = pending.iter().find(|p| &p.id == id) {
                    tracker
                        .escalate(proposal.id.as_str(), proposal.section.label(), &proposal.change)
                        .await;
                }
            }
        }

        summary.pending_total = pending.len();
        info!(
            promoted = summary.promoted.len(),
            rejected = summary.rejected.len(),
            merged = summary.merged.len(),
            needs_review = summary.needs_review.len(),
            pending_total = summary.pending_total,
            "triage pass complete"
        );
        Ok(summary)
    }

    // ── Reconciliation pass ────────────────────────────────────────────────

    /// Reconcile the human-edited checklist against the pending set, promote
    /// what was approved, archive the rest.
    #[instrument(skip(self))]
    pub async fn reconcile_pass(&self) -> Result<ReconcileSummary> {
        let _lock = PassLock::acquire(&self.config.storage.lock_path)?;
        let now = Utc::now();
        let today = now.date_naive();

        let previous = self.pending.load().await?;
        let checklist_raw = tokio::fs::read_to_string(&self.config.storage.checklist_path)
            .await
            .unwrap_or_default();
        let checklist = Checklist::parse(&checklist_raw);

        let outcome = reconcile(
            &previous,
            &checklist,
            now,
            self.config.consolidation.review_expiry_days,
        );

        // Decision phase: build the new document and pending set in memory.
        let mut canonical = self.document.read_or_seed().await?;
        let fallback = self.config.consolidation.fallback_section.clone();
        let mut next_pending: Vec<Proposal> = outcome.unchanged.clone();
        let mut promoted: Vec<&Proposal> = Vec::new();
        let mut held = 0usize;

        for proposal in &outcome.approved {
            match append_to_section(
                &canonical,
                proposal.section.label(),
                &proposal.bullet_line(),
                Some(&fallback),
            ) {
                Ok(updated) => {
                    canonical = updated;
                    promoted.push(proposal);
                }
                Err(err) => {
                    warn!(%err, id = %proposal.id, "approved proposal has no usable section; keeping pending");
                    held += 1;
                    next_pending.push(proposal.clone());
                }
            }
        }

        for (id, note) in &outcome.discovered {
            let change = if note.is_empty() {
                "(recovered from checklist)".to_string()
            } else {
                note.clone()
            };
            next_pending.push(Proposal {
                id: id.clone(),
                section: Section::from_label(&fallback),
                change,
                source: Some("checklist".to_string()),
                captured_at: now,
            });
        }

        // Write phase.
        self.document.replace(&canonical).await?;
        self.pending.save(&next_pending).await?;
        replace_atomic(
            Path::new(&self.config.storage.checklist_path),
            &Checklist::render(&next_pending),
        )
        .await?;

        for proposal in &promoted {
            self.daily_log
                .record(
                    today,
                    LogOutcome::Promoted,
                    proposal.id.as_str(),
                    &format!("approved into {}", proposal.section.label()),
                )
                .await?;
        }
        for proposal in &outcome.rejected {
            self.daily_log
                .record(today, LogOutcome::Rejected, proposal.id.as_str(), "removed during review")
                .await?;
        }
        for proposal in &outcome.expired {
            self.daily_log
                .record(
                    today,
                    LogOutcome::Expired,
                    proposal.id.as_str(),
                    &format!(
                        "no decision after {} days",
                        self.config.consolidation.review_expiry_days
                    ),
                )
                .await?;
        }

        let summary = ReconcileSummary {
            promoted: promoted.len(),
            rejected: outcome.rejected.len(),
            expired: outcome.expired.len(),
            unchanged: outcome.unchanged.len(),
            discovered: outcome.discovered.len(),
            held_for_remediation: held,
        };
        info!(
            promoted = summary.promoted,
            rejected = summary.rejected,
            expired = summary.expired,
            unchanged = summary.unchanged,
            discovered = summary.discovered,
            "reconciliation pass complete"
        );
        Ok(summary)
    }

    // ── Maintenance pass ───────────────────────────────────────────────────

    /// Nightly store maintenance.  Takes no pass lock: it touches neither
    /// the document nor the pending set, and absorbed points being terminal
    /// makes overlapping runs converge to the same state.
    #[instrument(skip(self, store))]
    pub async fn maintenance_pass(&self, store: &dyn VectorStore) -> Result<MaintenanceReport> {
        let now = Utc::now();
        let (day_start, day_end) = local_day_bounds(now, &self.config.consolidation.timezone);
        let maintainer = StoreMaintainer::new(store, &self.config.consolidation);
        Ok(maintainer.run(day_start, day_end, now).await?)
    }
}

/// UTC bounds of the local calendar day containing `now`.  Unrecognised
/// timezone names fall back to UTC; a DST gap at midnight resolves to the
/// earliest valid instant.
fn local_day_bounds(now: DateTime<Utc>, tz_name: &str) -> (DateTime<Utc>, DateTime<Utc>) {
    let tz: Tz = tz_name.parse().unwrap_or(chrono_tz::UTC);
    let local_day = now.with_timezone(&tz).date_naive();

    let to_utc = |naive: chrono::NaiveDateTime| {
        tz.from_local_datetime(&naive)
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
    };

    let start = to_utc(local_day.and_time(NaiveTime::MIN));
    let end = local_day
        .succ_opt()
        .map(|next| to_utc(next.and_time(NaiveTime::MIN)))
        .unwrap_or(start + Duration::days(1));
    (start, end)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
