//! Canonical memory document and the daily audit log.
//!
//! The canonical document is a single UTF-8 file of `##`-delimited sections
//! whose bodies are append-only bullet lists.  All mutation goes through
//! section-bounded insertion plus an atomic whole-file replace, so a reader
//! never sees a torn write and no insert can disturb a neighbouring section.
//! Lost-update protection across concurrent promoters is the runtime's job
//! (it holds the pass lock around every read-modify-write cycle).

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::StoreError;

// ── Section-bounded insertion ─────────────────────────────────────────────────

/// Insert `bullet` at the end of the `## {label}` section: after the last
/// non-blank line of the section body, before any trailing blank lines that
/// separate it from the next header.  Returns `None` when the header is
/// absent.
fn insert_into_section(document: &str, label: &str, bullet: &str) -> Option<String> {
    let header = format!("## {label}");
    let mut lines: Vec<&str> = document.lines().collect();

    let header_idx = lines.iter().position(|line| line.trim_end() == header)?;

    let boundary = lines[header_idx + 1..]
        .iter()
        .position(|line| line.starts_with("##"))
        .map(|offset| header_idx + 1 + offset)
        .unwrap_or(lines.len());

    let insert_at = lines[header_idx + 1..boundary]
        .iter()
        .rposition(|line| !line.trim().is_empty())
        .map(|offset| header_idx + 1 + offset + 1)
        .unwrap_or(header_idx + 1);

    lines.insert(insert_at, bullet);
    Some(lines.join("\n") + "\n")
}

/// Append `bullet` into `## {label}`, falling back to `## {fallback}` when
/// the target header is missing.  With neither header present the document
/// cannot safely take the write: that is an integrity error for a human to
/// resolve, never a silent append at the end of the file.
pub fn append_to_section(
    document: &str,
    label: &str,
    bullet: &str,
    fallback: Option<&str>,
) -> Result<String, StoreError> {
    if let Some(updated) = insert_into_section(document, label, bullet) {
        return Ok(updated);
    }
    if let Some(fallback) = fallback {
        if let Some(updated) = insert_into_section(document, fallback, bullet) {
            debug!(label, fallback, "target section missing; appended to fallback");
            return Ok(updated);
        }
    }
    Err(StoreError::Integrity(format!(
        "no '## {label}' section in canonical document and no usable fallback"
    )))
}

// ── Atomic replace ────────────────────────────────────────────────────────────

/// Write `content` to a `.tmp` sibling of `path`, fsync, rename into place.
/// A crash at any point leaves either the old file or the complete new one.
/// Also used by the runtime for the review checklist.
pub async fn replace_atomic(path: &Path, content: &str) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let tmp_path = {
        let filename = path
            .file_name()
            .map(|f| f.to_string_lossy().to_string())
            .unwrap_or_else(|| "document".to_string());
        path.with_file_name(format!("{filename}.tmp"))
    };

    let write_result: Result<(), StoreError> = async {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)
            .await?;
        file.write_all(content.as_bytes()).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }
    .await;

    if let Err(err) = write_result {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(err);
    }

    if let Err(err) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(err.into());
    }

    Ok(())
}

// ── Canonical document ────────────────────────────────────────────────────────

const DOCUMENT_SKELETON: &str = "\
# Memory

## Hard Rules

## System Architecture

## Patterns

## Conventions
";

#[derive(Debug, Clone)]
pub struct CanonicalDocument {
    path: PathBuf,
}

impl CanonicalDocument {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the document, seeding the standard section skeleton on first use.
    pub async fn read_or_seed(&self) -> Result<String, StoreError> {
        if !self.path.exists() {
            info!(path = %self.path.display(), "canonical document missing; seeding skeleton");
            replace_atomic(&self.path, DOCUMENT_SKELETON).await?;
            return Ok(DOCUMENT_SKELETON.to_string());
        }
        Ok(tokio::fs::read_to_string(&self.path).await?)
    }

    /// Atomically replace the whole document.  Used by passes that batch
    /// several section inserts into one write; call with the pass lock held.
    pub async fn replace(&self, content: &str) -> Result<(), StoreError> {
        replace_atomic(&self.path, content).await
    }

    /// One read-modify-write cycle: load, insert the bullet into its section
    /// (or the fallback), atomically replace.  Call with the pass lock held.
    pub async fn append(
        &self,
        label: &str,
        bullet: &str,
        fallback: Option<&str>,
    ) -> Result<(), StoreError> {
        let document = self.read_or_seed().await?;
        let updated = append_to_section(&document, label, bullet, fallback)?;
        replace_atomic(&self.path, &updated).await?;
        info!(section = label, "canonical document updated");
        Ok(())
    }
}

// ── Daily audit log ───────────────────────────────────────────────────────────

/// Outcome recorded in the daily log, one fixed header per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOutcome {
    Promoted,
    Rejected,
    Expired,
}

impl LogOutcome {
    fn header(self) -> &'static str {
        match self {
            Self::Promoted => "Promoted Proposals",
            Self::Rejected => "Rejected Proposals",
            Self::Expired => "Expired Proposals",
        }
    }
}

/// Append-only audit trail: one file per calendar day, one line per proposal
/// outcome, grouped under fixed headers.
#[derive(Debug, Clone)]
pub struct DailyLog {
    dir: PathBuf,
}

impl DailyLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn file_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("{}.md", date.format("%Y-%m-%d")))
    }

    /// Record one proposal outcome.  Returns `false` when a line for this
    /// proposal id already exists in today's file, so a retried pass never
    /// duplicates its audit trail.
    pub async fn record(
        &self,
        date: NaiveDate,
        outcome: LogOutcome,
        proposal_id: &str,
        detail: &str,
    ) -> Result<bool, StoreError> {
        let path = self.file_for(date);
        let existing = if path.exists() {
            tokio::fs::read_to_string(&path).await?
        } else {
            format!(
                "# Memory Log {}\n\n## Promoted Proposals\n\n## Rejected Proposals\n\n## Expired Proposals\n",
                date.format("%Y-%m-%d")
            )
        };

        if existing.contains(proposal_id) {
            debug!(proposal_id, "daily log already has an entry; skipping");
            return Ok(false);
        }

        let line = format!("- {proposal_id}: {detail}");
        let updated = append_to_section(&existing, outcome.header(), &line, None)?;
        replace_atomic(&path, &updated).await?;
        Ok(true)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
