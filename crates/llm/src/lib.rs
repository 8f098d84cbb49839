//! Reflection inference.
//!
//! One call shape: `generate(system_prompt, user_prompt) -> raw text`,
//! served by Ollama with an OpenRouter fallback.  The reply is expected to
//! be a flat `<proposals>` document; `parse_proposals` turns it into drafts
//! and degrades to an empty list on anything malformed, because a bad
//! inference run must cost at most one night's proposals, never a crash.

use std::sync::LazyLock;

use anyhow::Result;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Provider {
    Ollama,
    OpenRouter,
}

#[derive(Debug, Clone)]
pub struct OllamaClient {
    client: reqwest::Client,
    base_url: String,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    async fn generate_model(&self, model: &str, system: &str, prompt: &str) -> Result<String> {
        let endpoint = format!("{}/api/generate", self.base_url.trim_end_matches('/'));
        let payload = json!({
            "model": model,
            "system": system,
            "prompt": prompt,
            "stream": false
        });

        let response = self.client.post(endpoint).json(&payload).send().await?;
        let status = response.status();
        let body: serde_json::Value = response.json().await?;
        if !status.is_success() {
            anyhow::bail!("ollama error ({status}): {body}");
        }

        body.get("response")
            .and_then(|value| value.as_str())
            .map(ToString::to_string)
            .ok_or_else(|| anyhow::anyhow!("ollama response missing text: {body}"))
    }
}

#[derive(Debug, Clone, Default)]
pub struct OpenRouterClient {
    client: reqwest::Client,
}

impl OpenRouterClient {
    pub fn new() -> Self {
        Self::default()
    }

    async fn generate_model(&self, model: &str, system: &str, prompt: &str) -> Result<String> {
        let api_key = std::env::var("OPENROUTER_API_KEY").unwrap_or_default();
        if api_key.trim().is_empty() {
            anyhow::bail!("OPENROUTER_API_KEY is not set");
        }

        let payload = json!({
            "model": model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": prompt}
            ]
        });

        let response = self
            .client
            .post("https://openrouter.ai/api/v1/chat/completions")
            .bearer_auth(api_key)
            .header("HTTP-Referer", "https://curator.local")
            .header("X-Title", "Curator")
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        let body: serde_json::Value = response.json().await?;
        if !status.is_success() {
            anyhow::bail!("openrouter error ({status}): {body}");
        }

        body.get("choices")
            .and_then(|choices| choices.get(0))
            .and_then(|choice| choice.get("message"))
            .and_then(|message| message.get("content"))
            .and_then(|content| content.as_str())
            .map(ToString::to_string)
            .ok_or_else(|| anyhow::anyhow!("openrouter response missing content"))
    }
}

/// Routes a reflection call to the primary provider, falling back to
/// OpenRouter when Ollama is unreachable.
#[derive(Debug, Clone)]
pub struct ReflectionRouter {
    ollama: OllamaClient,
    openrouter: OpenRouterClient,
}

impl ReflectionRouter {
    pub fn new(ollama_base_url: impl Into<String>) -> Self {
        Self {
            ollama: OllamaClient::new(ollama_base_url),
            openrouter: OpenRouterClient::new(),
        }
    }

    pub async fn generate_with_fallback(
        &self,
        primary: Provider,
        ollama_model: &str,
        openrouter_model: &str,
        system: &str,
        prompt: &str,
    ) -> Result<(Provider, String)> {
        match primary {
            Provider::Ollama => match self.ollama.generate_model(ollama_model, system, prompt).await {
                Ok(text) => Ok((Provider::Ollama, text)),
                Err(err) => {
                    warn!(%err, "ollama unavailable; falling back to openrouter");
                    let text = self
                        .openrouter
                        .generate_model(openrouter_model, system, prompt)
                        .await?;
                    Ok((Provider::OpenRouter, text))
                }
            },
            Provider::OpenRouter => {
                let text = self
                    .openrouter
                    .generate_model(openrouter_model, system, prompt)
                    .await?;
                Ok((Provider::OpenRouter, text))
            }
        }
    }
}

// ── Proposal parsing ──────────────────────────────────────────────────────────

/// Candidate edit as emitted by the reflection step.  String-typed on
/// purpose: section names are resolved against the canonical document by the
/// runtime, not here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposalDraft {
    pub section: String,
    pub change: String,
    pub source: Option<String>,
}

static PROPOSAL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)<proposal>(.*?)</proposal>").expect("static regex"));

fn tag_content<'a>(block: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = block.find(&open)? + open.len();
    let end = block[start..].find(&close)? + start;
    Some(&block[start..end])
}

/// Extract proposal drafts from a reflection reply.
///
/// Blocks without a `<change>` tag are dropped; a present-but-empty change
/// survives so triage can record the rejection.  Anything else malformed
/// (no `<proposal>` blocks at all, stray text, truncated output) yields an
/// empty list.
pub fn parse_proposals(raw: &str) -> Vec<ProposalDraft> {
    let mut drafts = Vec::new();
    for captures in PROPOSAL_RE.captures_iter(raw) {
        let block = captures.get(1).map(|m| m.as_str()).unwrap_or_default();
        let Some(change) = tag_content(block, "change") else {
            debug!("proposal block without <change> tag; dropping");
            continue;
        };
        let section = tag_content(block, "section").map(str::trim).unwrap_or_default();
        let source = tag_content(block, "source")
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string);
        drafts.push(ProposalDraft {
            section: section.to_string(),
            change: change.trim().to_string(),
            source,
        });
    }
    debug!(count = drafts.len(), "reflection proposals parsed");
    drafts
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::parse_proposals;

    #[test]
    fn parses_wrapped_proposal_list() {
        let raw = "\
<proposals>
  <proposal>
    <section>Patterns</section>
    <change>(2026-01-07) Retries use jittered backoff in worker/retry.rs</change>
    <source>session-42</source>
  </proposal>
  <proposal>
    <section>Conventions</section>
    <change>Commit messages use imperative mood</change>
  </proposal>
</proposals>";
        let drafts = parse_proposals(raw);
        assert_eq!(drafts.len(), 2);
        assert_eq!(drafts[0].section, "Patterns");
        assert_eq!(drafts[0].source.as_deref(), Some("session-42"));
        assert_eq!(drafts[1].section, "Conventions");
        assert!(drafts[1].source.is_none());
    }

    #[test]
    fn proposal_blocks_work_without_outer_wrapper() {
        let raw = "<proposal><section>Patterns</section><change>x</change></proposal>";
        assert_eq!(parse_proposals(raw).len(), 1);
    }

    #[test]
    fn malformed_output_degrades_to_empty() {
        for raw in ["", "no tags here", "<proposals></proposals>", "<proposal>truncat"] {
            assert!(parse_proposals(raw).is_empty(), "{raw:?}");
        }
    }

    #[test]
    fn block_without_change_tag_is_dropped() {
        let raw = "<proposal><section>Patterns</section></proposal>";
        assert!(parse_proposals(raw).is_empty());
    }

    #[test]
    fn empty_change_survives_for_triage_to_reject() {
        let raw = "<proposal><section>Patterns</section><change>  </change></proposal>";
        let drafts = parse_proposals(raw);
        assert_eq!(drafts.len(), 1);
        assert!(drafts[0].change.is_empty());
    }

    #[test]
    fn missing_section_defaults_to_empty_string() {
        let raw = "<proposal><change>some change</change></proposal>";
        let drafts = parse_proposals(raw);
        assert_eq!(drafts[0].section, "");
    }
}
