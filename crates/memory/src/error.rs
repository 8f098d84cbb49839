use thiserror::Error;

/// Errors surfaced by the stores and writers in this crate.
///
/// The split matters to the caller: `Unavailable` and `Io` are retryable
/// (the pass aborted before mutating anything, so the next scheduled run
/// can simply try again), while `Integrity` means the data itself needs a
/// human to look at it and retrying will not help.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The vector store or search index could not be reached.
    #[error("vector store unavailable: {0}")]
    Unavailable(String),

    /// On-disk state contradicts an invariant (missing section header with
    /// no fallback, dangling merge target, corrupt pending store).
    #[error("data integrity violation: {0}")]
    Integrity(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Whether a failed pass may be re-run as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Io(_))
    }
}
