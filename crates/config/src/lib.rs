use std::env;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

// ── Storage paths ─────────────────────────────────────────────────────────────

/// Locations of the on-disk state the pipeline reads and writes.
///
/// | Field            | Purpose                                                |
/// |------------------|--------------------------------------------------------|
/// | `canonical_path` | The curated knowledge document (`##`-sectioned text).  |
/// | `checklist_path` | Human-editable review checklist (Markdown task list).  |
/// | `pending_path`   | Persisted pending-proposal set (JSON).                 |
/// | `daily_log_dir`  | One audit log file per calendar day.                   |
/// | `lock_path`      | Advisory lock file serializing pipeline passes.        |
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub canonical_path: String,
    pub checklist_path: String,
    pub pending_path: String,
    pub daily_log_dir: String,
    pub lock_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            canonical_path: ".curator/memory.md".to_string(),
            checklist_path: ".curator/review.md".to_string(),
            pending_path: ".curator/pending.json".to_string(),
            daily_log_dir: ".curator/log".to_string(),
            lock_path: ".curator/curator.lock".to_string(),
        }
    }
}

// ── Consolidation tunables ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsolidationConfig {
    /// Cosine-similarity threshold above which two same-day observations are
    /// merged during the nightly maintenance pass.  The upstream value was a
    /// bare constant with no stated derivation, so it is a tunable here.
    pub dedup_threshold: f32,
    /// Normalized edit-distance score at or above which a proposal is treated
    /// as a duplicate of an existing bullet or another pending proposal.
    pub duplicate_threshold: f64,
    /// Observations older than this many days that have never been recalled
    /// are tagged stale by the maintenance pass.
    pub stale_after_days: u64,
    /// Pending proposals with no human decision after this many days expire.
    pub review_expiry_days: u64,
    /// Page size for scroll-paginated reads of the observation store.
    pub scroll_page_size: usize,
    /// Section that receives a promotion whose target section header is
    /// missing from the canonical document.
    pub fallback_section: String,
    /// IANA timezone name used to delimit "today" for the dedup pass.
    /// Falls back to UTC when the name is unrecognised.
    pub timezone: String,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            dedup_threshold: 0.85,
            duplicate_threshold: 0.85,
            stale_after_days: 30,
            review_expiry_days: 7,
            scroll_page_size: 128,
            fallback_section: "Conventions".to_string(),
            timezone: "UTC".to_string(),
        }
    }
}

// ── Vector store ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorStoreConfig {
    /// gRPC endpoint of the qdrant instance.  Overridden at runtime by the
    /// `QDRANT_URL` environment variable when set.
    pub url: String,
    pub collection: String,
    /// Request-level timeout applied to every scroll / payload-update call.
    pub timeout_secs: u64,
    /// Dimensionality of the observation embeddings (all-mpnet-base-v2).
    pub vector_dim: usize,
}

impl Default for VectorStoreConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:6334".to_string(),
            collection: "observations".to_string(),
            timeout_secs: 20,
            vector_dim: 768,
        }
    }
}

// ── LLM provider ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub provider: String,
    pub ollama_model: String,
    pub openrouter_model: String,
    /// Base URL for the Ollama API.  Overridden at runtime by the
    /// `OLLAMA_BASE_URL` environment variable when set.
    pub ollama_base_url: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: "ollama".to_string(),
            ollama_model: "llama3.1:8b".to_string(),
            openrouter_model: "openai/gpt-4o-mini".to_string(),
            ollama_base_url: "http://localhost:11434".to_string(),
        }
    }
}

// ── Task tracker ──────────────────────────────────────────────────────────────

/// Escalation target for proposals that need a human decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub enabled: bool,
    pub base_url: String,
    /// API token.  Can also be set via `TRACKER_API_TOKEN` (env takes
    /// precedence over the config file).
    pub api_token: String,
    pub project: String,
    pub labels: Vec<String>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: "https://api.todoist.com/rest/v2".to_string(),
            api_token: String::new(),
            project: "memory-review".to_string(),
            labels: vec!["memory".to_string(), "needs-review".to_string()],
        }
    }
}

// ── Telemetry ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

// ── AppConfig ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub storage: StorageConfig,
    pub consolidation: ConsolidationConfig,
    pub vector_store: VectorStoreConfig,
    pub llm: LlmConfig,
    pub tracker: TrackerConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(value) = env::var("QDRANT_URL") {
            if !value.is_empty() {
                config.vector_store.url = value;
            }
        }

        if let Ok(value) = env::var("OLLAMA_BASE_URL") {
            if !value.is_empty() {
                config.llm.provider = "ollama".to_string();
                config.llm.ollama_base_url = value;
            }
        }

        // Tracker token env override (takes precedence over config file).
        if let Ok(token) = env::var("TRACKER_API_TOKEN") {
            if !token.is_empty() {
                config.tracker.api_token = token;
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }

    pub fn active_model(&self) -> &str {
        if self.llm.provider.eq_ignore_ascii_case("openrouter") {
            &self.llm.openrouter_model
        } else {
            &self.llm.ollama_model
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    // ── Consolidation defaults ─────────────────────────────────────────────
    // These thresholds gate what reaches the canonical document without a
    // human decision. Changing any of them should be a deliberate, reviewed
    // decision.

    #[test]
    fn consolidation_defaults() {
        let cfg = AppConfig::default();
        assert!((cfg.consolidation.dedup_threshold - 0.85).abs() < f32::EPSILON);
        assert!((cfg.consolidation.duplicate_threshold - 0.85).abs() < f64::EPSILON);
        assert_eq!(cfg.consolidation.stale_after_days, 30);
        assert_eq!(cfg.consolidation.review_expiry_days, 7);
        assert_eq!(cfg.consolidation.scroll_page_size, 128);
        assert_eq!(cfg.consolidation.fallback_section, "Conventions");
        assert_eq!(cfg.consolidation.timezone, "UTC");
    }

    #[test]
    fn storage_and_vector_defaults() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.storage.canonical_path, ".curator/memory.md");
        assert_eq!(cfg.storage.pending_path, ".curator/pending.json");
        assert_eq!(cfg.vector_store.collection, "observations");
        assert_eq!(cfg.vector_store.vector_dim, 768);
        assert!(!cfg.tracker.enabled, "tracker must be opt-in");
        assert_eq!(cfg.telemetry.log_level, "info");
    }

    // ── load_from ──────────────────────────────────────────────────────────

    #[test]
    fn load_from_missing_file_returns_defaults() {
        let dir = TempDir::new().unwrap();
        let cfg = AppConfig::load_from(dir.path().join("nonexistent.toml")).unwrap();
        assert_eq!(cfg.llm.provider, "ollama");
        assert_eq!(cfg.storage.daily_log_dir, ".curator/log");
    }

    #[test]
    fn load_from_valid_toml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.toml");
        fs::write(
            &path,
            r#"
[storage]
canonical_path = "/data/memory.md"

[consolidation]
dedup_threshold = 0.9
stale_after_days = 14

[vector_store]
url = "http://qdrant:6334"
collection = "obs-test"

[llm]
provider = "openrouter"
openrouter_model = "anthropic/claude-3.5-sonnet"

[tracker]
enabled = true
project = "inbox"
"#,
        )
        .unwrap();

        let cfg = AppConfig::load_from(&path).unwrap();
        assert_eq!(cfg.storage.canonical_path, "/data/memory.md");
        assert!((cfg.consolidation.dedup_threshold - 0.9).abs() < f32::EPSILON);
        assert_eq!(cfg.consolidation.stale_after_days, 14);
        assert_eq!(cfg.vector_store.collection, "obs-test");
        assert_eq!(cfg.llm.provider, "openrouter");
        assert!(cfg.tracker.enabled);
        assert_eq!(cfg.tracker.project, "inbox");
        // Unspecified sections keep their defaults
        assert_eq!(cfg.consolidation.review_expiry_days, 7);
    }

    #[test]
    fn load_from_partial_toml_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("partial.toml");
        fs::write(
            &path,
            r#"
[consolidation]
dedup_threshold = 0.75
"#,
        )
        .unwrap();

        let cfg = AppConfig::load_from(&path).unwrap();
        assert!((cfg.consolidation.dedup_threshold - 0.75).abs() < f32::EPSILON);
        assert_eq!(cfg.llm.ollama_model, "llama3.1:8b");
    }

    #[test]
    fn load_from_invalid_toml_returns_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        fs::write(&path, "this is not valid toml {{{{").unwrap();
        assert!(AppConfig::load_from(&path).is_err());
    }

    // ── save_to + roundtrip ────────────────────────────────────────────────

    #[test]
    fn save_and_reload_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sub/config.toml");

        let mut cfg = AppConfig::default();
        cfg.storage.canonical_path = "/tmp/doc.md".to_string();
        cfg.consolidation.review_expiry_days = 10;
        cfg.tracker.labels = vec!["triage".to_string()];

        cfg.save_to(&path).unwrap();
        assert!(path.exists());

        let loaded = AppConfig::load_from(&path).unwrap();
        assert_eq!(loaded.storage.canonical_path, "/tmp/doc.md");
        assert_eq!(loaded.consolidation.review_expiry_days, 10);
        assert_eq!(loaded.tracker.labels, vec!["triage".to_string()]);
    }

    #[test]
    fn save_creates_parent_directories() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a/b/c/config.toml");
        let cfg = AppConfig::default();
        cfg.save_to(&path).unwrap();
        assert!(path.exists());
    }

    // ── active_model ───────────────────────────────────────────────────────

    #[test]
    fn active_model_returns_ollama_by_default() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.active_model(), "llama3.1:8b");
    }

    #[test]
    fn active_model_case_insensitive() {
        let mut cfg = AppConfig::default();
        cfg.llm.provider = "OpenRouter".to_string();
        assert_eq!(cfg.active_model(), "openai/gpt-4o-mini");
    }

    // ── Env var overrides ──────────────────────────────────────────────────

    #[test]
    fn env_tracker_token_overrides_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tracker.toml");
        fs::write(
            &path,
            r#"
[tracker]
api_token = "from-file"
"#,
        )
        .unwrap();

        // SAFETY: test is single-threaded for this env var.
        unsafe { env::set_var("TRACKER_API_TOKEN", "from-env") };
        let cfg = AppConfig::load_from(&path).unwrap();
        assert_eq!(cfg.tracker.api_token, "from-env");
        unsafe { env::remove_var("TRACKER_API_TOKEN") };
    }
}
