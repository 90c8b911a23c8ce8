pub mod prompts;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tkl_core::cards::CardContent;
use tkl_core::domain::{
    Assertion, AssertionDraft, AssertionType, CardDraft, Entity, EntityDraft, EntityType,
    Episode, ExtractionBatch, IngestWarning, Segment, TopicDraft,
};
use tkl_core::error::AppError;
use tkl_core::store::{self, ExtractionApplySummary};

use crate::llm::Llm;

#[derive(Debug, Clone, Deserialize)]
struct ExtractionPayload {
    #[serde(default)]
    topics: Vec<TopicPayload>,
    #[serde(default)]
    entities: Vec<EntityPayload>,
    #[serde(default)]
    assertions: Vec<AssertionPayload>,
    #[serde(default)]
    cards: Vec<CardPayload>,
}

#[derive(Debug, Clone, Deserialize)]
struct TopicPayload {
    name: String,
    #[serde(default)]
    summary: Option<String>,
    start_segment_id: i64,
    end_segment_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
struct EntityPayload {
    name: String,
    #[serde(rename = "type")]
    entity_type: String,
    #[serde(default)]
    aliases: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct AssertionPayload {
    entity: String,
    #[serde(rename = "type")]
    assertion_type: String,
    statement: String,
    #[serde(default)]
    speaker: Option<String>,
    #[serde(default)]
    confidence: Option<f64>,
    #[serde(default)]
    verification_priority: Option<f64>,
    #[serde(default)]
    segment_ids: Vec<i64>,
    #[serde(default)]
    quote: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct CardPayload {
    entity: String,
    #[serde(default)]
    definition: Option<String>,
    #[serde(default)]
    key_points: Vec<String>,
    #[serde(default)]
    comparisons: Vec<String>,
    #[serde(default)]
    recent_summary: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct CardBodyPayload {
    #[serde(default)]
    definition: Option<String>,
    #[serde(default)]
    key_points: Vec<String>,
    #[serde(default)]
    comparisons: Vec<String>,
    #[serde(default)]
    recent_summary: Option<String>,
}

/// Locate the JSON object in a model response. A fenced block wins; otherwise
/// the outermost braces are taken.
fn parse_json_block(raw: &str) -> Option<&str> {
    if let Some(start) = raw.find("```") {
        let after = &raw[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```") {
            let block = after[..end].trim();
            if !block.is_empty() {
                return Some(block);
            }
        }
    }
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end >= start).then(|| raw[start..=end].trim())
}

fn clean_opt(value: Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Decode a model response into a candidate batch. Rows with unknown enum
/// values are dropped with a warning; a response with no JSON at all is an
/// error.
pub fn parse_extraction(raw: &str) -> Result<(ExtractionBatch, Vec<IngestWarning>), AppError> {
    let block = parse_json_block(raw).ok_or_else(|| {
        AppError::new(
            "AI_EXTRACT_INVALID",
            "Extraction response contained no JSON object",
        )
    })?;
    let payload: ExtractionPayload = serde_json::from_str(block).map_err(|e| {
        AppError::new("AI_EXTRACT_INVALID", "Failed to decode extraction JSON")
            .with_details(e.to_string())
    })?;

    let mut batch = ExtractionBatch::default();
    let mut warnings: Vec<IngestWarning> = Vec::new();

    for t in payload.topics {
        batch.topics.push(TopicDraft {
            name: t.name,
            summary: clean_opt(t.summary),
            start_segment_id: t.start_segment_id,
            end_segment_id: t.end_segment_id,
        });
    }

    for e in payload.entities {
        match EntityType::parse(&e.entity_type.trim().to_ascii_lowercase()) {
            Some(entity_type) => batch.entities.push(EntityDraft {
                name: e.name,
                entity_type,
                aliases: e.aliases,
            }),
            None => warnings.push(
                IngestWarning::new("AI_EXTRACT_BAD_TYPE", "Dropped entity with unknown type")
                    .with_details(format!("name={}; type={}", e.name, e.entity_type)),
            ),
        }
    }

    for a in payload.assertions {
        let assertion_type = match AssertionType::parse(&a.assertion_type.trim().to_ascii_lowercase())
        {
            Some(assertion_type) => assertion_type,
            None => {
                warnings.push(
                    IngestWarning::new(
                        "AI_EXTRACT_BAD_TYPE",
                        "Dropped assertion with unknown type",
                    )
                    .with_details(format!("entity={}; type={}", a.entity, a.assertion_type)),
                );
                continue;
            }
        };
        batch.assertions.push(AssertionDraft {
            entity_name: a.entity,
            assertion_type,
            statement: a.statement,
            speaker: clean_opt(a.speaker),
            confidence: a.confidence.unwrap_or(0.5),
            verification_priority: a.verification_priority.unwrap_or(0.0),
            segment_ids: a.segment_ids,
            evidence_quote: clean_opt(a.quote),
        });
    }

    for c in payload.cards {
        batch.cards.push(CardDraft {
            entity_name: c.entity,
            definition: clean_opt(c.definition),
            key_points: c.key_points,
            comparisons: c.comparisons,
            recent_summary: clean_opt(c.recent_summary),
        });
    }

    Ok((batch, warnings))
}

/// One extraction round-trip: prompt, generate, decode.
pub fn extract_knowledge(
    llm: &dyn Llm,
    model: &str,
    episode: &Episode,
    segments: &[Segment],
) -> Result<(ExtractionBatch, Vec<IngestWarning>), AppError> {
    let prompt = prompts::extraction_prompt(episode, segments);
    let raw = llm.generate(model, &prompt)?;
    parse_extraction(&raw)
}

fn fallback_card(assertions: &[Assertion]) -> CardContent {
    CardContent {
        definition: None,
        key_points: assertions.iter().take(8).map(|a| a.statement.clone()).collect(),
        comparisons: Vec::new(),
        recent_summary: assertions.last().map(|a| a.statement.clone()),
    }
}

/// Produce a card body for an entity from its stored assertions. This never
/// fails: if the model is down or returns junk, the assertions themselves
/// become the card.
pub fn synthesize_card(
    llm: &dyn Llm,
    model: &str,
    entity: &Entity,
    existing: Option<&CardContent>,
    assertions: &[Assertion],
) -> CardContent {
    let prompt = prompts::card_synthesis_prompt(entity, existing, assertions);
    let raw = match llm.generate(model, &prompt) {
        Ok(raw) => raw,
        Err(e) => {
            log::warn!(
                "card synthesis for {} failed ({}); falling back to assertions",
                entity.display_name,
                e.code
            );
            return fallback_card(assertions);
        }
    };

    let parsed = parse_json_block(&raw)
        .and_then(|block| serde_json::from_str::<CardBodyPayload>(block).ok());
    match parsed {
        Some(payload) => CardContent {
            definition: clean_opt(payload.definition),
            key_points: payload.key_points,
            comparisons: payload.comparisons,
            recent_summary: clean_opt(payload.recent_summary),
        },
        None => {
            log::warn!(
                "card synthesis for {} returned unusable JSON; falling back to assertions",
                entity.display_name
            );
            fallback_card(assertions)
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExtractionRunSummary {
    pub applied: ExtractionApplySummary,
    pub cards_synthesized: usize,
    pub warnings: Vec<IngestWarning>,
}

/// Full extraction pass for one episode: generate candidates, apply them to
/// the store, then refresh a card for every mentioned entity that now holds
/// assertions. A model failure degrades to an empty run instead of erroring;
/// store failures still propagate.
pub fn run_extraction(
    conn: &Connection,
    llm: &dyn Llm,
    model: &str,
    episode_id: i64,
) -> Result<ExtractionRunSummary, AppError> {
    let episode = store::fetch_episode(conn, episode_id)?;
    let segments = store::segments_for_episode(conn, episode_id)?;

    let mut summary = ExtractionRunSummary::default();
    if segments.is_empty() {
        summary.warnings.push(IngestWarning::new(
            "EXTRACT_NO_SEGMENTS",
            "Episode has no segments to extract from",
        ));
        return Ok(summary);
    }

    let (batch, mut parse_warnings) = match extract_knowledge(llm, model, &episode, &segments) {
        Ok(parsed) => parsed,
        Err(e) => {
            log::warn!(
                "extraction for episode {episode_id} failed: {} {}",
                e.code,
                e.message
            );
            summary.warnings.push(
                IngestWarning::new("EXTRACT_FAILED", "Extraction produced no candidates")
                    .with_details(format!("{}: {}", e.code, e.message)),
            );
            return Ok(summary);
        }
    };
    summary.warnings.append(&mut parse_warnings);

    summary.applied = store::apply_extraction(conn, episode_id, &batch)?;

    let mut refreshed: Vec<String> = Vec::new();
    for draft in &batch.entities {
        let entity = match store::fetch_entity_by_name(conn, &draft.name)? {
            Some(entity) => entity,
            None => continue,
        };
        if refreshed.contains(&entity.canonical_name) {
            continue;
        }
        refreshed.push(entity.canonical_name.clone());

        let assertions = store::assertions_for_entity(conn, entity.id)?;
        if assertions.is_empty() {
            continue;
        }
        let existing = store::card_for_entity(conn, entity.id)?.map(|card| CardContent {
            definition: card.definition,
            key_points: card.key_points,
            comparisons: card.comparisons,
            recent_summary: card.recent_summary,
        });
        let content = synthesize_card(llm, model, &entity, existing.as_ref(), &assertions);
        store::upsert_card(conn, entity.id, &content)?;
        summary.cards_synthesized += 1;
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn json_block_prefers_the_fence() {
        let raw = "Sure! Here you go:\n```json\n{\"topics\": []}\n```\ntrailing prose {";
        assert_eq!(parse_json_block(raw), Some("{\"topics\": []}"));
    }

    #[test]
    fn json_block_falls_back_to_outer_braces() {
        let raw = "prefix {\"entities\": [{\"name\": \"x\", \"type\": \"model\"}]} suffix";
        assert_eq!(
            parse_json_block(raw),
            Some("{\"entities\": [{\"name\": \"x\", \"type\": \"model\"}]}")
        );
        assert_eq!(parse_json_block("no json at all"), None);
    }

    #[test]
    fn unknown_enum_values_become_warnings() {
        let raw = r#"{
          "entities": [
            {"name": "GPT-5", "type": "model"},
            {"name": "Mystery", "type": "vibe"}
          ],
          "assertions": [
            {"entity": "GPT-5", "type": "hunch", "statement": "nope", "segment_ids": [1]}
          ]
        }"#;
        let (batch, warnings) = parse_extraction(raw).unwrap();
        assert_eq!(batch.entities.len(), 1);
        assert_eq!(batch.assertions.len(), 0);
        assert_eq!(warnings.len(), 2);
        assert!(warnings.iter().all(|w| w.code == "AI_EXTRACT_BAD_TYPE"));
    }

    #[test]
    fn assertion_defaults_fill_in() {
        let raw = r#"{"assertions": [{"entity": "x", "type": "fact", "statement": "s", "segment_ids": [3]}]}"#;
        let (batch, warnings) = parse_extraction(raw).unwrap();
        assert!(warnings.is_empty());
        let a = &batch.assertions[0];
        assert_eq!(a.confidence, 0.5);
        assert_eq!(a.verification_priority, 0.0);
        assert_eq!(a.speaker, None);
    }
}
