use tkl_core::cards::CardContent;
use tkl_core::domain::{Assertion, Entity, Episode, Segment};
use tkl_core::normalize::seconds_to_hms;

pub fn extraction_prompt(episode: &Episode, segments: &[Segment]) -> String {
    let mut lines = String::new();
    for seg in segments {
        let speaker = seg.speaker.as_deref().unwrap_or("Unknown");
        match seg.start_secs {
            Some(secs) => lines.push_str(&format!(
                "S{} {speaker} ({}): {}\n",
                seg.id,
                seconds_to_hms(secs),
                seg.text
            )),
            None => lines.push_str(&format!("S{} {speaker}: {}\n", seg.id, seg.text)),
        }
    }

    format!(
        r#"You are building a technology knowledge base from a podcast transcript.
Extract topics, entities, assertions and reference cards from the segments below.

Rules (non-negotiable):
1. Use only what the transcript says. Never invent facts, names or numbers.
2. Every assertion must list the numeric ids of the segments that support it, plus a short verbatim quote.
3. Entity types must be one of: model, company, framework, hardware, benchmark, paper, product, concept.
4. Assertion types must be one of: fact, opinion, prediction, recommendation, anecdote.
5. confidence and verification_priority are numbers between 0 and 1. Surprising or load-bearing claims get a high verification_priority.
6. Topic ranges use segment ids from this episode, start at or before end.
7. Return a single JSON object and nothing else.

Episode: {title}

Segments (S<id> speaker (time): text):
{lines}
Return JSON with this exact shape:
{{
  "topics": [{{"name": "...", "summary": "...", "start_segment_id": 0, "end_segment_id": 0}}],
  "entities": [{{"name": "...", "type": "model", "aliases": ["..."]}}],
  "assertions": [{{"entity": "...", "type": "fact", "statement": "...", "speaker": "...", "confidence": 0.8, "verification_priority": 0.2, "segment_ids": [0], "quote": "..."}}],
  "cards": [{{"entity": "...", "definition": "...", "key_points": ["..."], "comparisons": ["..."], "recent_summary": "..."}}]
}}"#,
        title = episode.title,
    )
}

pub fn card_synthesis_prompt(
    entity: &Entity,
    existing: Option<&CardContent>,
    assertions: &[Assertion],
) -> String {
    let mut evidence = String::new();
    for a in assertions {
        evidence.push_str(&format!("- [{}] {}\n", a.assertion_type.as_str(), a.statement));
    }
    let current = existing
        .and_then(|card| serde_json::to_string_pretty(card).ok())
        .unwrap_or_else(|| "{}".to_string());

    format!(
        r#"You maintain a living reference card for {name} ({kind}).

Rules (non-negotiable):
1. Base every statement on the evidence below; never invent.
2. Keep existing key points that are still supported and add what is new.
3. recent_summary is one or two sentences on the latest developments.
4. Return a single JSON object and nothing else.

Current card:
{current}

Evidence:
{evidence}
Return JSON with this exact shape:
{{"definition": "...", "key_points": ["..."], "comparisons": ["..."], "recent_summary": "..."}}"#,
        name = entity.display_name,
        kind = entity.entity_type.as_str(),
    )
}
