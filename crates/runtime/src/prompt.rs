//! Reflection prompt assembly.

use curator_memory::ObserverOutput;

/// System prompt for the reflection call.  The reply format is the only
/// contract: a flat `<proposals>` document that `curator_llm::parse_proposals`
/// can read, degrading to zero proposals on anything else.
pub const REFLECTION_SYSTEM_PROMPT: &str = "\
You curate a long-lived engineering memory document. Given today's distilled \
observations, propose durable additions to the document. Only propose facts, \
decisions, and conventions worth keeping for months. Never propose anything \
already covered by the current document. Reply with ONLY this structure and \
nothing else:

<proposals>
  <proposal>
    <section>one of the document's section names</section>
    <change>one self-contained statement</change>
  </proposal>
</proposals>

Reply with <proposals></proposals> when nothing is worth keeping.";

/// Build the user prompt from a parsed observer reply and the current
/// canonical document.
pub fn build_reflection_prompt(output: &ObserverOutput, canonical: &str) -> String {
    let mut prompt = String::new();

    if !output.segments.is_empty() {
        prompt.push_str("TODAY'S SESSION SEGMENTS:\n");
        for segment in &output.segments {
            prompt.push_str(&format!("narrative: {}\n", segment.narrative));
            for fact in &segment.facts {
                prompt.push_str(&format!("  fact: {fact}\n"));
            }
        }
        prompt.push('\n');
    }

    if !output.observations.is_empty() {
        prompt.push_str("RAW OBSERVATIONS:\n");
        prompt.push_str(&output.observations);
        prompt.push_str("\n\n");
    }

    if let Some(task) = &output.current_task {
        prompt.push_str(&format!("CURRENT TASK: {task}\n\n"));
    }

    prompt.push_str("CURRENT MEMORY DOCUMENT:\n");
    prompt.push_str(canonical);
    prompt
}

#[cfg(test)]
mod tests {
    use curator_memory::{ObserverOutput, Segment};

    use super::build_reflection_prompt;

    #[test]
    fn prompt_includes_segments_observations_and_document() {
        let output = ObserverOutput {
            observations: "🟡 queue latency rising".to_string(),
            segments: vec![Segment {
                narrative: "Queue degraded.".to_string(),
                facts: vec!["Retry spiked".to_string()],
            }],
            current_task: Some("stabilise ingest".to_string()),
            suggested_response: None,
            parsed: true,
        };
        let prompt = build_reflection_prompt(&output, "## Patterns\n- existing\n");

        assert!(prompt.contains("narrative: Queue degraded."));
        assert!(prompt.contains("fact: Retry spiked"));
        assert!(prompt.contains("🟡 queue latency rising"));
        assert!(prompt.contains("CURRENT TASK: stabilise ingest"));
        assert!(prompt.contains("## Patterns\n- existing"));
    }

    #[test]
    fn empty_sections_are_omitted() {
        let prompt = build_reflection_prompt(&ObserverOutput::default(), "doc");
        assert!(!prompt.contains("SEGMENTS"));
        assert!(!prompt.contains("RAW OBSERVATIONS"));
        assert!(prompt.ends_with("doc"));
    }
}
