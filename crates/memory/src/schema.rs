use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

// ── Observations ──────────────────────────────────────────────────────────────

/// One distilled fact captured from a session, as stored in the observation
/// vector store.  Observations are never deleted: the maintenance pass only
/// flags them (`merged_into`, `stale`) and updates the keeper's payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Observation {
    pub id: Uuid,
    pub session_id: String,
    pub text: String,
    pub observation_type: String,
    pub created_at: DateTime<Utc>,
    /// How many times retrieval has surfaced this observation.  `None` means
    /// the field was never written, which staleness tagging treats as zero.
    #[serde(default)]
    pub recall_count: Option<u32>,
    /// Number of near-duplicates absorbed into this observation.
    #[serde(default)]
    pub merged_count: u32,
    #[serde(default)]
    pub stale: bool,
    #[serde(default)]
    pub stale_tagged_at: Option<DateTime<Utc>>,
    /// Set once this observation has been absorbed into a keeper.  Terminal:
    /// an absorbed observation is never again a merge candidate.
    #[serde(default)]
    pub merged_into: Option<Uuid>,
}

impl Observation {
    pub fn new(
        session_id: impl Into<String>,
        text: impl Into<String>,
        observation_type: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        let session_id = session_id.into();
        let text = text.into();
        let id = Self::derived_id(&session_id, &text);
        Self {
            id,
            session_id,
            text,
            observation_type: observation_type.into(),
            created_at,
            recall_count: None,
            merged_count: 0,
            stale: false,
            stale_tagged_at: None,
            merged_into: None,
        }
    }

    /// Deterministic point id from the capture session and text, so
    /// re-submitting the same fact upserts instead of duplicating.
    pub fn derived_id(session_id: &str, text: &str) -> Uuid {
        let mut hasher = Sha256::new();
        hasher.update(session_id.as_bytes());
        hasher.update([0x1f]);
        hasher.update(text.as_bytes());
        let digest = hasher.finalize();
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        Uuid::from_bytes(bytes)
    }

    pub fn never_recalled(&self) -> bool {
        self.recall_count.unwrap_or(0) == 0
    }

    pub fn is_absorbed(&self) -> bool {
        self.merged_into.is_some()
    }
}

// ── Segments ──────────────────────────────────────────────────────────────────

/// Ephemeral parse result from the observer output: one narrative plus the
/// facts distilled alongside it.  Consumed immediately by the reflection
/// stage, never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub narrative: String,
    pub facts: Vec<String>,
}

/// Full parse of an observer reply.  `parsed == false` means the output had
/// neither wrapper tags nor legacy severity markers and should be treated as
/// opaque.
#[derive(Debug, Clone, Default)]
pub struct ObserverOutput {
    pub observations: String,
    pub segments: Vec<Segment>,
    pub current_task: Option<String>,
    pub suggested_response: Option<String>,
    pub parsed: bool,
}

// ── Sections ──────────────────────────────────────────────────────────────────

/// Named section of the canonical memory document.
///
/// `SystemArchitecture` and `Patterns` are the low-risk structural sections:
/// factual, timestamped updates targeting them may be promoted without a
/// human decision.  Everything aimed at `HardRules` or `Conventions` (or an
/// unknown section) goes through review.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Section {
    HardRules,
    SystemArchitecture,
    Patterns,
    Conventions,
    Other(String),
}

impl Section {
    pub fn label(&self) -> &str {
        match self {
            Self::HardRules => "Hard Rules",
            Self::SystemArchitecture => "System Architecture",
            Self::Patterns => "Patterns",
            Self::Conventions => "Conventions",
            Self::Other(name) => name,
        }
    }

    /// Parse a section from its label (case- and punctuation-insensitive).
    /// Unknown labels pass through as `Other` so a proposal never loses its
    /// target on the way in; `Other` sections are never auto-promoted.
    pub fn from_label(s: &str) -> Self {
        let folded: String = s
            .trim()
            .chars()
            .filter(|c| c.is_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match folded.as_str() {
            "hardrules" => Self::HardRules,
            "systemarchitecture" | "architecture" => Self::SystemArchitecture,
            "patterns" | "pattern" => Self::Patterns,
            "conventions" | "convention" => Self::Conventions,
            _ => Self::Other(s.trim().to_string()),
        }
    }

    pub fn is_low_risk(&self) -> bool {
        matches!(self, Self::SystemArchitecture | Self::Patterns)
    }
}

impl From<String> for Section {
    fn from(s: String) -> Self {
        Self::from_label(&s)
    }
}

impl From<Section> for String {
    fn from(s: Section) -> Self {
        s.label().to_string()
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ── Proposal ids ──────────────────────────────────────────────────────────────

/// Externally-visible proposal identifier: `p-YYYYMMDD-NNN`, date component
/// from the UTC capture date, sequence zero-padded to 3 digits and
/// monotonically increasing per day.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProposalId(String);

impl ProposalId {
    pub fn new(date: NaiveDate, seq: u32) -> Self {
        Self(format!("p-{}-{seq:03}", date.format("%Y%m%d")))
    }

    /// Strict parse of the `p-YYYYMMDD-NNN` format.  Returns `None` for
    /// anything else, including a malformed date component.
    pub fn parse(s: &str) -> Option<Self> {
        let rest = s.strip_prefix("p-")?;
        let (date_part, seq_part) = rest.split_once('-')?;
        if date_part.len() != 8 || seq_part.len() != 3 {
            return None;
        }
        NaiveDate::parse_from_str(date_part, "%Y%m%d").ok()?;
        seq_part.parse::<u32>().ok()?;
        Some(Self(s.to_string()))
    }

    pub fn date(&self) -> Option<NaiveDate> {
        let date_part = self.0.strip_prefix("p-")?.split_once('-')?.0;
        NaiveDate::parse_from_str(date_part, "%Y%m%d").ok()
    }

    pub fn seq(&self) -> Option<u32> {
        self.0.rsplit_once('-')?.1.parse().ok()
    }

    /// Next id for `date`: one past the highest sequence already used on
    /// that date, starting at 001.
    pub fn next(date: NaiveDate, existing: &[ProposalId]) -> Self {
        let max_seq = existing
            .iter()
            .filter(|id| id.date() == Some(date))
            .filter_map(ProposalId::seq)
            .max()
            .unwrap_or(0);
        Self::new(date, max_seq + 1)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProposalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Proposals ─────────────────────────────────────────────────────────────────

/// A candidate edit to the canonical memory document, awaiting triage or
/// human review.  Created by the reflection stage; mutated or destroyed only
/// by triage, reconciliation, or promotion, never concurrently.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub id: ProposalId,
    pub section: Section,
    pub change: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub captured_at: DateTime<Utc>,
}

impl Proposal {
    /// Render the bullet line this proposal would add to its section.
    pub fn bullet_line(&self) -> String {
        format!(
            "- ({}) {}",
            self.captured_at.format("%Y-%m-%d"),
            self.change.trim()
        )
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
