pub mod prompts;
pub mod rank;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tkl_core::domain::Segment;
use tkl_core::error::AppError;
use tkl_core::normalize::{seconds_to_hms, take_quote};
use tkl_core::store;

use crate::embeddings::Embedder;
use crate::index::{self, EmbeddingConfig, IndexScope, ObjectKind};
use crate::llm::{Llm, DEFAULT_LLM_MODEL};
use rank::{lexical_candidates, rerank, RankedCandidate};

pub const DEFAULT_K: usize = 6;
pub const DEFAULT_OVERFETCH: usize = 4;
pub const DEFAULT_MIN_SIMILARITY: f32 = 0.25;
pub const DEFAULT_RECENCY_WEIGHT: f32 = 0.05;
pub const DEFAULT_VERIFIED_BONUS: f32 = 0.10;

pub const SNIPPET_MAX_CHARS: usize = 280;
pub const CITATION_QUOTE_MAX_CHARS: usize = 240;

pub const INSUFFICIENT_EVIDENCE_ANSWER: &str =
    "Insufficient evidence in the ingested episodes to answer that.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMode {
    /// Extractive answers straight from the ranked evidence.
    Fast,
    /// Composed answers through the local model, with citation enforcement.
    Thorough,
}

#[derive(Debug, Clone)]
pub struct RetrieveConfig {
    pub k: usize,
    pub overfetch: usize,
    pub min_similarity: f32,
    pub recency_weight: f32,
    pub verified_bonus: f32,
    pub embedding: EmbeddingConfig,
}

impl Default for RetrieveConfig {
    fn default() -> Self {
        RetrieveConfig {
            k: DEFAULT_K,
            overfetch: DEFAULT_OVERFETCH,
            min_similarity: DEFAULT_MIN_SIMILARITY,
            recency_weight: DEFAULT_RECENCY_WEIGHT,
            verified_bonus: DEFAULT_VERIFIED_BONUS,
            embedding: EmbeddingConfig::default(),
        }
    }
}

/// Where a piece of evidence came from, down to the segment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Citation {
    pub segment_id: i64,
    pub episode_id: i64,
    pub episode_title: String,
    pub speaker: Option<String>,
    pub timestamp: Option<String>,
    pub link: Option<String>,
    pub quote: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchHit {
    pub kind: ObjectKind,
    pub object_id: i64,
    pub similarity: f32,
    pub score: f32,
    pub snippet: String,
    pub citation: Citation,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SearchResponse {
    pub hits: Vec<SearchHit>,
    pub fallback_lexical: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AskResponse {
    pub answer: String,
    pub insufficient_evidence: bool,
    pub citations: Vec<Citation>,
    pub fallback_lexical: bool,
    pub debug: Option<Vec<RankedCandidate>>,
}

#[derive(Debug, Clone)]
pub struct AskOptions {
    pub episode_id: Option<i64>,
    pub mode: RetrievalMode,
    pub llm_model: String,
    pub debug: bool,
}

impl Default for AskOptions {
    fn default() -> Self {
        AskOptions {
            episode_id: None,
            mode: RetrievalMode::Fast,
            llm_model: DEFAULT_LLM_MODEL.to_string(),
            debug: false,
        }
    }
}

/// Over-fetch and re-rank candidates for a query. Falls back to keyword
/// scoring when the scope holds no usable vectors or the query cannot be
/// embedded.
fn gather_candidates(
    conn: &Connection,
    embedder: &dyn Embedder,
    cfg: &RetrieveConfig,
    query: &str,
    episode_id: Option<i64>,
    kinds: &[ObjectKind],
) -> Result<(Vec<RankedCandidate>, bool), AppError> {
    let scope = IndexScope {
        episode_id,
        kinds: kinds.to_vec(),
    };
    let fetch = cfg.k.max(1) * cfg.overfetch.max(1);

    let mut fallback_lexical = false;
    let raw: Vec<(ObjectKind, i64, f32)> =
        if !index::scope_has_embeddings(conn, &cfg.embedding, &scope)? {
            fallback_lexical = true;
            lexical_candidates(conn, query, episode_id, fetch)?
        } else {
            match embedder.embed(&cfg.embedding.model, query) {
                Ok(qvec) => index::nearest(conn, &cfg.embedding, &scope, &qvec, fetch)?,
                Err(e) => {
                    log::warn!("query embedding failed ({}); using lexical fallback", e.code);
                    fallback_lexical = true;
                    lexical_candidates(conn, query, episode_id, fetch)?
                }
            }
        };

    let ranked = rerank(conn, cfg.recency_weight, cfg.verified_bonus, &raw)?;
    Ok((ranked, fallback_lexical))
}

fn citation_for_segment(
    conn: &Connection,
    seg: &Segment,
    quote: Option<&str>,
) -> Result<Citation, AppError> {
    let episode = store::fetch_episode(conn, seg.episode_id)?;
    Ok(Citation {
        segment_id: seg.id,
        episode_id: episode.id,
        episode_title: episode.title,
        speaker: seg.speaker.clone(),
        timestamp: seg.start_secs.map(seconds_to_hms),
        link: seg.link.clone(),
        quote: take_quote(quote.unwrap_or(&seg.text), CITATION_QUOTE_MAX_CHARS),
    })
}

/// Resolve a candidate to its citation segment plus the text its snippet is
/// cut from. Segments cite themselves, chunks cite their first segment,
/// assertions their first supporting segment, cards the latest assertion of
/// their entity. None means the candidate has no resolvable evidence and is
/// dropped from results.
fn resolve_citation(
    conn: &Connection,
    kind: ObjectKind,
    object_id: i64,
) -> Result<Option<(Citation, String)>, AppError> {
    match kind {
        ObjectKind::Segment => {
            let seg = store::fetch_segment(conn, object_id)?;
            let citation = citation_for_segment(conn, &seg, None)?;
            Ok(Some((citation, seg.text)))
        }
        ObjectKind::Chunk => {
            let chunk = store::fetch_chunk(conn, object_id)?;
            let seg = store::fetch_segment(conn, chunk.start_segment_id)?;
            let citation = citation_for_segment(conn, &seg, None)?;
            Ok(Some((citation, chunk.text)))
        }
        ObjectKind::Assertion => {
            let assertion = store::fetch_assertion(conn, object_id)?;
            let segment_id = match assertion.segment_ids.first() {
                Some(&id) => id,
                None => return Ok(None),
            };
            let seg = store::fetch_segment(conn, segment_id)?;
            let citation =
                citation_for_segment(conn, &seg, assertion.evidence_quote.as_deref())?;
            Ok(Some((citation, assertion.statement)))
        }
        ObjectKind::Card => {
            let card = store::fetch_card(conn, object_id)?;
            let entity = store::fetch_entity(conn, card.entity_id)?;
            let assertions = store::assertions_for_entity(conn, card.entity_id)?;
            for assertion in assertions.iter().rev() {
                if let Some(&segment_id) = assertion.segment_ids.first() {
                    let seg = store::fetch_segment(conn, segment_id)?;
                    let citation =
                        citation_for_segment(conn, &seg, assertion.evidence_quote.as_deref())?;
                    let text = match card.definition.as_deref() {
                        Some(def) => format!("{}: {def}", entity.display_name),
                        None => format!("{}: {}", entity.display_name, card.key_points.join("; ")),
                    };
                    return Ok(Some((citation, text)));
                }
            }
            Ok(None)
        }
    }
}

/// Scored lookup across segments, chunks, assertions and cards. Every hit
/// carries a citation; candidates without one are dropped.
pub fn search(
    conn: &Connection,
    embedder: &dyn Embedder,
    cfg: &RetrieveConfig,
    query: &str,
    episode_id: Option<i64>,
) -> Result<SearchResponse, AppError> {
    let query = query.trim();
    if query.is_empty() {
        return Err(AppError::new("RETRIEVE_QUERY_EMPTY", "Query must not be empty"));
    }

    let (ranked, fallback_lexical) =
        gather_candidates(conn, embedder, cfg, query, episode_id, &ObjectKind::ALL)?;

    let mut hits: Vec<SearchHit> = Vec::new();
    for cand in &ranked {
        if hits.len() == cfg.k.max(1) {
            break;
        }
        let (citation, text) = match resolve_citation(conn, cand.kind, cand.object_id)? {
            Some(resolved) => resolved,
            None => continue,
        };
        hits.push(SearchHit {
            kind: cand.kind,
            object_id: cand.object_id,
            similarity: cand.similarity,
            score: cand.score,
            snippet: take_quote(&text, SNIPPET_MAX_CHARS),
            citation,
        });
    }

    Ok(SearchResponse {
        hits,
        fallback_lexical,
    })
}

fn extractive_answer(snippets: &[String]) -> String {
    let mut out = String::new();
    for (i, snippet) in snippets.iter().enumerate() {
        out.push_str(&format!("- {snippet} [{}]\n", i + 1));
    }
    out
}

/// Require at least one [n] marker and no marker outside 1..=citations.
pub fn enforce_citation_markers(answer: &str, citations: usize) -> Result<(), AppError> {
    let bytes = answer.as_bytes();
    let mut found = false;
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'[' {
            let mut j = i + 1;
            while j < bytes.len() && bytes[j].is_ascii_digit() {
                j += 1;
            }
            if j > i + 1 && j < bytes.len() && bytes[j] == b']' {
                let n = answer[i + 1..j].parse::<usize>().unwrap_or(0);
                if n == 0 || n > citations {
                    return Err(AppError::new(
                        "AI_ANSWER_BAD_CITATION",
                        "Answer cites evidence that was not provided",
                    )
                    .with_details(format!("marker={}; citations={citations}", &answer[i..=j])));
                }
                found = true;
                i = j + 1;
                continue;
            }
        }
        i += 1;
    }
    if !found {
        return Err(AppError::new(
            "AI_ANSWER_UNCITED",
            "Answer contains no citation markers",
        ));
    }
    Ok(())
}

/// Answer a question over chunks and assertions. Below the similarity floor
/// the response says so instead of guessing. Thorough mode routes through
/// the model and falls back to extracts whenever the answer is unusable.
pub fn ask(
    conn: &Connection,
    embedder: &dyn Embedder,
    llm: Option<&dyn Llm>,
    cfg: &RetrieveConfig,
    question: &str,
    opts: &AskOptions,
) -> Result<AskResponse, AppError> {
    let question = question.trim();
    if question.is_empty() {
        return Err(AppError::new("RETRIEVE_QUERY_EMPTY", "Question must not be empty"));
    }

    let kinds = [ObjectKind::Chunk, ObjectKind::Assertion];
    let (ranked, fallback_lexical) =
        gather_candidates(conn, embedder, cfg, question, opts.episode_id, &kinds)?;
    let debug = if opts.debug { Some(ranked.clone()) } else { None };

    let eligible: Vec<&RankedCandidate> = if fallback_lexical {
        ranked.iter().filter(|c| c.similarity > 0.0).collect()
    } else {
        ranked
            .iter()
            .filter(|c| c.similarity >= cfg.min_similarity)
            .collect()
    };

    if eligible.is_empty() {
        return Ok(AskResponse {
            answer: INSUFFICIENT_EVIDENCE_ANSWER.to_string(),
            insufficient_evidence: true,
            citations: Vec::new(),
            fallback_lexical,
            debug,
        });
    }

    let mut citations: Vec<Citation> = Vec::new();
    let mut snippets: Vec<String> = Vec::new();
    for cand in eligible {
        if citations.len() == cfg.k.max(1) {
            break;
        }
        let (citation, text) = match resolve_citation(conn, cand.kind, cand.object_id)? {
            Some(resolved) => resolved,
            None => continue,
        };
        snippets.push(take_quote(&text, SNIPPET_MAX_CHARS));
        citations.push(citation);
    }

    if citations.is_empty() {
        return Ok(AskResponse {
            answer: INSUFFICIENT_EVIDENCE_ANSWER.to_string(),
            insufficient_evidence: true,
            citations: Vec::new(),
            fallback_lexical,
            debug,
        });
    }

    let answer = match (opts.mode, llm) {
        (RetrievalMode::Thorough, Some(llm)) => {
            let evidence: Vec<String> = snippets
                .iter()
                .zip(citations.iter())
                .enumerate()
                .map(|(i, (snippet, cit))| {
                    let speaker = cit.speaker.as_deref().unwrap_or("unknown");
                    format!(
                        "[{}] {speaker} in \"{}\": {snippet}",
                        i + 1,
                        cit.episode_title
                    )
                })
                .collect();
            let prompt = prompts::answer_prompt(question, &evidence);
            match llm.generate(&opts.llm_model, &prompt) {
                Ok(text) => {
                    let trimmed = text.trim();
                    if trimmed.to_lowercase().starts_with("insufficient evidence") {
                        return Ok(AskResponse {
                            answer: INSUFFICIENT_EVIDENCE_ANSWER.to_string(),
                            insufficient_evidence: true,
                            citations: Vec::new(),
                            fallback_lexical,
                            debug,
                        });
                    }
                    match enforce_citation_markers(trimmed, citations.len()) {
                        Ok(()) => trimmed.to_string(),
                        Err(e) => {
                            log::warn!(
                                "generated answer rejected ({}); falling back to extracts",
                                e.code
                            );
                            extractive_answer(&snippets)
                        }
                    }
                }
                Err(e) => {
                    log::warn!(
                        "answer generation failed ({}); falling back to extracts",
                        e.code
                    );
                    extractive_answer(&snippets)
                }
            }
        }
        _ => extractive_answer(&snippets),
    };

    Ok(AskResponse {
        answer,
        insufficient_evidence: false,
        citations,
        fallback_lexical,
        debug,
    })
}
