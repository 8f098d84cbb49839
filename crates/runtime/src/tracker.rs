//! Task-tracker escalation for proposals that need a human decision.
//!
//! Best-effort by design: a tracker outage must never fail a triage pass,
//! because the proposal is already parked in the pending set and the
//! checklist.  Failures are logged and forgotten.

use anyhow::Result;
use curator_config::TrackerConfig;
use serde_json::json;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct TrackerClient {
    client: reqwest::Client,
    config: TrackerConfig,
}

impl TrackerClient {
    /// Build a client from config.  Returns `None` when the tracker is
    /// disabled or has no token, so callers can skip escalation entirely.
    pub fn from_config(config: &TrackerConfig) -> Option<Self> {
        if !config.enabled || config.api_token.trim().is_empty() {
            return None;
        }
        Some(Self {
            client: reqwest::Client::new(),
            config: config.clone(),
        })
    }

    pub async fn create_task(&self, content: &str, description: &str) -> Result<()> {
        let endpoint = format!("{}/tasks", self.config.base_url.trim_end_matches('/'));
        let payload = json!({
            "content": content,
            "description": description,
            "labels": self.config.labels,
            "project": self.config.project,
        });

        let response = self
            .client
            .post(endpoint)
            .bearer_auth(&self.config.api_token)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("tracker rejected task ({status})");
        }
        Ok(())
    }

    /// Escalate one needs-review proposal.  Never returns an error.
    pub async fn escalate(&self, proposal_id: &str, section: &str, change: &str) {
        let content = format!("Review memory proposal {proposal_id}");
        let description = format!("[{section}] {change}");
        match self.create_task(&content, &description).await {
            Ok(()) => info!(proposal_id, "review task created in tracker"),
            Err(err) => warn!(proposal_id, %err, "tracker escalation failed; proposal stays pending"),
        }
    }
}
