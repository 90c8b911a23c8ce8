use std::collections::HashMap;

use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tkl_core::error::AppError;

use crate::index::ObjectKind;

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "but", "by", "do", "does", "for", "from", "had",
    "has", "have", "how", "in", "is", "it", "its", "of", "on", "or", "that", "the", "this",
    "to", "was", "were", "what", "when", "where", "which", "who", "why", "will", "with",
];

/// One scored candidate after re-ranking. `score` is the similarity plus the
/// recency and verification adjustments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RankedCandidate {
    pub kind: ObjectKind,
    pub object_id: i64,
    pub similarity: f32,
    pub recency_bonus: f32,
    pub verified_bonus: f32,
    pub score: f32,
}

fn query_failed(what: &str, e: impl std::fmt::Display) -> AppError {
    AppError::new("DB_QUERY_FAILED", format!("Failed to {what}")).with_details(e.to_string())
}

/// Each episode's position in publication order as a 0..=1 fraction, newest
/// at 1. Episodes without a date sort oldest.
fn recency_fractions(conn: &Connection) -> Result<HashMap<i64, f32>, AppError> {
    let mut stmt = conn
        .prepare(
            "SELECT id FROM episodes \
             ORDER BY (published_at IS NULL) DESC, published_at ASC, id ASC",
        )
        .map_err(|e| query_failed("prepare episode order", e))?;
    let rows = stmt
        .query_map([], |row| row.get::<_, i64>(0))
        .map_err(|e| query_failed("query episode order", e))?;

    let mut ids = Vec::new();
    for row in rows {
        ids.push(row.map_err(|e| query_failed("decode episode id", e))?);
    }

    let n = ids.len();
    let mut out = HashMap::with_capacity(n);
    for (i, id) in ids.into_iter().enumerate() {
        let frac = if n > 1 {
            i as f32 / (n - 1) as f32
        } else {
            1.0
        };
        out.insert(id, frac);
    }
    Ok(out)
}

/// The episode a candidate belongs to. Cards borrow their entity's last-seen
/// episode.
fn candidate_episode(
    conn: &Connection,
    kind: ObjectKind,
    object_id: i64,
) -> Result<Option<i64>, AppError> {
    let sql = match kind {
        ObjectKind::Segment => "SELECT episode_id FROM segments WHERE id = ?1",
        ObjectKind::Chunk => "SELECT episode_id FROM chunks WHERE id = ?1",
        ObjectKind::Assertion => "SELECT episode_id FROM assertions WHERE id = ?1",
        ObjectKind::Card => {
            "SELECT e.last_seen_episode_id FROM tech_cards tc \
             JOIN entities e ON e.id = tc.entity_id WHERE tc.id = ?1"
        }
    };
    let found: Option<Option<i64>> = conn
        .query_row(sql, [object_id], |row| row.get(0))
        .optional()
        .map_err(|e| query_failed("query candidate episode", e))?;
    Ok(found.flatten())
}

fn assertion_status_bonus(
    conn: &Connection,
    object_id: i64,
    bonus: f32,
) -> Result<f32, AppError> {
    let status: Option<String> = conn
        .query_row(
            "SELECT verification_status FROM assertions WHERE id = ?1",
            [object_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| query_failed("query verification status", e))?;
    Ok(match status.as_deref() {
        Some("verified") => bonus,
        Some("disputed") => -bonus,
        _ => 0.0,
    })
}

/// Fold recency and verification into the raw similarities, then order by
/// score with object id and kind as tie-breaks.
pub fn rerank(
    conn: &Connection,
    recency_weight: f32,
    verified_bonus: f32,
    raw: &[(ObjectKind, i64, f32)],
) -> Result<Vec<RankedCandidate>, AppError> {
    let fractions = recency_fractions(conn)?;

    let mut out: Vec<RankedCandidate> = Vec::with_capacity(raw.len());
    for &(kind, object_id, similarity) in raw {
        let recency_bonus = match candidate_episode(conn, kind, object_id)? {
            Some(episode_id) => {
                recency_weight * fractions.get(&episode_id).copied().unwrap_or(0.0)
            }
            None => 0.0,
        };
        let status_bonus = if kind == ObjectKind::Assertion {
            assertion_status_bonus(conn, object_id, verified_bonus)?
        } else {
            0.0
        };
        out.push(RankedCandidate {
            kind,
            object_id,
            similarity,
            recency_bonus,
            verified_bonus: status_bonus,
            score: similarity + recency_bonus + status_bonus,
        });
    }

    out.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.object_id.cmp(&b.object_id))
            .then(a.kind.cmp(&b.kind))
    });
    Ok(out)
}

fn terms(text: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for token in text.split(|c: char| !c.is_alphanumeric()) {
        if token.is_empty() {
            continue;
        }
        let t = token.to_lowercase();
        if t.len() < 2 || STOPWORDS.contains(&t.as_str()) {
            continue;
        }
        if !out.contains(&t) {
            out.push(t);
        }
    }
    out
}

fn overlap_score(query_terms: &[String], text: &str) -> f32 {
    if query_terms.is_empty() {
        return 0.0;
    }
    let doc_terms = terms(text);
    let hits = query_terms
        .iter()
        .filter(|t| doc_terms.contains(t))
        .count();
    hits as f32 / query_terms.len() as f32
}

fn scored_rows(
    conn: &Connection,
    sql: &str,
    episode_id: Option<i64>,
    kind: ObjectKind,
    query_terms: &[String],
    out: &mut Vec<(ObjectKind, i64, f32)>,
) -> Result<(), AppError> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| query_failed("prepare lexical scan", e))?;
    let rows = stmt
        .query_map(
            rusqlite::params![episode_id],
            |row| -> rusqlite::Result<(i64, String)> { Ok((row.get(0)?, row.get(1)?)) },
        )
        .map_err(|e| query_failed("query lexical scan", e))?;
    for row in rows {
        let (id, text) = row.map_err(|e| query_failed("decode lexical row", e))?;
        let score = overlap_score(query_terms, &text);
        if score > 0.0 {
            out.push((kind, id, score));
        }
    }
    Ok(())
}

/// Keyword fallback when no vectors are usable: score chunks and assertions
/// by the share of query terms they contain.
pub fn lexical_candidates(
    conn: &Connection,
    query: &str,
    episode_id: Option<i64>,
    limit: usize,
) -> Result<Vec<(ObjectKind, i64, f32)>, AppError> {
    let query_terms = terms(query);
    if query_terms.is_empty() {
        return Ok(Vec::new());
    }

    let mut out: Vec<(ObjectKind, i64, f32)> = Vec::new();
    scored_rows(
        conn,
        "SELECT id, text FROM chunks WHERE (?1 IS NULL OR episode_id = ?1) ORDER BY id ASC",
        episode_id,
        ObjectKind::Chunk,
        &query_terms,
        &mut out,
    )?;
    scored_rows(
        conn,
        "SELECT id, statement FROM assertions WHERE (?1 IS NULL OR episode_id = ?1) ORDER BY id ASC",
        episode_id,
        ObjectKind::Assertion,
        &query_terms,
        &mut out,
    )?;

    out.sort_by(|a, b| {
        b.2.partial_cmp(&a.2)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.1.cmp(&b.1))
            .then(a.0.cmp(&b.0))
    });
    out.truncate(limit);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn terms_drop_stopwords_and_short_tokens() {
        assert_eq!(
            terms("What is the widget-cache for a GPU?"),
            vec!["widget", "cache", "gpu"]
        );
        assert_eq!(terms("the and of"), Vec::<String>::new());
    }

    #[test]
    fn overlap_scores_the_share_of_query_terms() {
        let q = terms("widget cache latency");
        assert_eq!(overlap_score(&q, "The widget cache halved latency"), 1.0);
        assert!((overlap_score(&q, "the widget shipped") - 1.0 / 3.0).abs() < 1e-6);
        assert_eq!(overlap_score(&q, "nothing relevant"), 0.0);
    }
}
