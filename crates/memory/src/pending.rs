//! Persisted pending-proposal set.
//!
//! A single JSON file holding the ordered review queue.  At most one pass
//! (triage or reconciliation) may rewrite it at a time; the runtime's pass
//! lock enforces that.  Replacement is atomic so a crash mid-save leaves the
//! previous set intact.

use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::StoreError;
use crate::schema::Proposal;

#[derive(Debug, Clone)]
pub struct PendingStore {
    path: PathBuf,
}

impl PendingStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the pending set.  A missing file is an empty queue; a file that
    /// exists but does not parse is an integrity error, because silently
    /// starting from empty would re-approve everything ever parked here.
    pub async fn load(&self) -> Result<Vec<Proposal>, StoreError> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "no pending store yet; starting empty");
            return Ok(Vec::new());
        }

        let raw = tokio::fs::read_to_string(&self.path).await?;
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&raw).map_err(|err| {
            warn!(path = %self.path.display(), %err, "pending store is unreadable");
            StoreError::Integrity(format!(
                "pending store {} is corrupt: {err}",
                self.path.display()
            ))
        })
    }

    /// Atomically replace the pending set.
    ///
    /// The new content is written to a `.tmp` sibling, fsync'd, then renamed
    /// over the original.  A crash before the rename leaves the old set; a
    /// crash after leaves the new one.  The `.tmp` file is cleaned up on any
    /// error path.
    pub async fn save(&self, proposals: &[Proposal]) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let tmp_path = {
            let filename = self
                .path
                .file_name()
                .map(|f| f.to_string_lossy().to_string())
                .unwrap_or_else(|| "pending.json".to_string());
            self.path.with_file_name(format!("{filename}.tmp"))
        };

        let write_result: Result<(), StoreError> = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)
                .await?;
            let rendered = serde_json::to_string_pretty(proposals)?;
            file.write_all(rendered.as_bytes()).await?;
            file.write_all(b"\n").await?;
            file.flush().await?;
            file.sync_all().await?;
            Ok(())
        }
        .await;

        if let Err(err) = write_result {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(err);
        }

        if let Err(err) = tokio::fs::rename(&tmp_path, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(err.into());
        }

        debug!(path = %self.path.display(), count = proposals.len(), "pending store saved");
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
