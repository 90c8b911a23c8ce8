use std::collections::HashMap;

use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::cards::{merge_cards, CardContent};
use crate::domain::{
    Assertion, AssertionDraft, AssertionType, CardDraft, Chunk, Entity, EntityDraft, Episode,
    ExtractionBatch, IngestWarning, Segment, SegmentDraft, TechCard, Topic, TopicDraft,
    VerificationStatus,
};
use crate::error::AppError;
use crate::hash::{assertion_fingerprint, content_fingerprint};
use crate::normalize::{normalize_name, take_quote};

/// Maximum stored evidence quote length, in characters.
pub const EVIDENCE_QUOTE_MAX_CHARS: usize = 240;

const EPISODE_COLS: &str =
    "id, source_id, title, show, participants, published_at, url, raw_text, created_at";
const SEGMENT_COLS: &str =
    "id, episode_id, idx, speaker, start_secs, end_secs, link, text, fingerprint, created_at";
const TOPIC_COLS: &str =
    "id, episode_id, name, summary, start_segment_id, end_segment_id, created_at";
const ENTITY_COLS: &str = "id, entity_type, canonical_name, display_name, aliases, \
     first_seen_episode_id, last_seen_episode_id, created_at, updated_at";
const ASSERTION_COLS: &str = "id, entity_id, episode_id, assertion_type, statement, speaker, \
     confidence, verification_priority, verification_status, segment_ids, evidence_quote, \
     fingerprint, created_at";
const CARD_COLS: &str =
    "id, entity_id, definition, key_points, comparisons, recent_summary, created_at, updated_at";
const CHUNK_COLS: &str = "id, episode_id, topic_id, start_segment_id, end_segment_id, text, \
     token_est, fingerprint, created_at";

fn is_unique_constraint_error(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => e.code == rusqlite::ErrorCode::ConstraintViolation,
        _ => false,
    }
}

fn query_failed(what: &str, e: impl std::fmt::Display) -> AppError {
    AppError::new("DB_QUERY_FAILED", format!("Failed to {what}")).with_details(e.to_string())
}

fn bad_column(idx: usize, what: &str, detail: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("{what}: {detail}"),
        )),
    )
}

fn decode_string_list(idx: usize, what: &str, raw: &str) -> rusqlite::Result<Vec<String>> {
    serde_json::from_str(raw).map_err(|e| bad_column(idx, what, &e.to_string()))
}

fn decode_id_list(idx: usize, what: &str, raw: &str) -> rusqlite::Result<Vec<i64>> {
    serde_json::from_str(raw).map_err(|e| bad_column(idx, what, &e.to_string()))
}

fn encode_json_list<T: Serialize>(list: &[T], what: &str) -> Result<String, AppError> {
    serde_json::to_string(list).map_err(|e| {
        AppError::new("DB_ENCODE_FAILED", format!("Failed to encode {what}"))
            .with_details(e.to_string())
    })
}

fn episode_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Episode> {
    let participants = match row.get::<_, Option<String>>(4)? {
        Some(raw) => decode_string_list(4, "episode participants", &raw)?,
        None => Vec::new(),
    };
    Ok(Episode {
        id: row.get(0)?,
        source_id: row.get(1)?,
        title: row.get(2)?,
        show: row.get(3)?,
        participants,
        published_at: row.get(5)?,
        url: row.get(6)?,
        raw_text: row.get(7)?,
        created_at: row.get(8)?,
    })
}

fn segment_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Segment> {
    Ok(Segment {
        id: row.get(0)?,
        episode_id: row.get(1)?,
        idx: row.get(2)?,
        speaker: row.get(3)?,
        start_secs: row.get(4)?,
        end_secs: row.get(5)?,
        link: row.get(6)?,
        text: row.get(7)?,
        fingerprint: row.get(8)?,
        created_at: row.get(9)?,
    })
}

fn topic_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Topic> {
    Ok(Topic {
        id: row.get(0)?,
        episode_id: row.get(1)?,
        name: row.get(2)?,
        summary: row.get(3)?,
        start_segment_id: row.get(4)?,
        end_segment_id: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn entity_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Entity> {
    let type_raw: String = row.get(1)?;
    let entity_type = crate::domain::EntityType::parse(&type_raw)
        .ok_or_else(|| bad_column(1, "unknown entity_type", &type_raw))?;
    let aliases_raw: String = row.get(4)?;
    Ok(Entity {
        id: row.get(0)?,
        entity_type,
        canonical_name: row.get(2)?,
        display_name: row.get(3)?,
        aliases: decode_string_list(4, "entity aliases", &aliases_raw)?,
        first_seen_episode_id: row.get(5)?,
        last_seen_episode_id: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}

fn assertion_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Assertion> {
    let type_raw: String = row.get(3)?;
    let assertion_type = AssertionType::parse(&type_raw)
        .ok_or_else(|| bad_column(3, "unknown assertion_type", &type_raw))?;
    let status_raw: String = row.get(8)?;
    let verification_status = VerificationStatus::parse(&status_raw)
        .ok_or_else(|| bad_column(8, "unknown verification_status", &status_raw))?;
    let ids_raw: String = row.get(9)?;
    Ok(Assertion {
        id: row.get(0)?,
        entity_id: row.get(1)?,
        episode_id: row.get(2)?,
        assertion_type,
        statement: row.get(4)?,
        speaker: row.get(5)?,
        confidence: row.get(6)?,
        verification_priority: row.get(7)?,
        verification_status,
        segment_ids: decode_id_list(9, "assertion segment_ids", &ids_raw)?,
        evidence_quote: row.get(10)?,
        fingerprint: row.get(11)?,
        created_at: row.get(12)?,
    })
}

fn card_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TechCard> {
    let key_points_raw: String = row.get(3)?;
    let comparisons_raw: String = row.get(4)?;
    Ok(TechCard {
        id: row.get(0)?,
        entity_id: row.get(1)?,
        definition: row.get(2)?,
        key_points: decode_string_list(3, "card key_points", &key_points_raw)?,
        comparisons: decode_string_list(4, "card comparisons", &comparisons_raw)?,
        recent_summary: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

fn chunk_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Chunk> {
    Ok(Chunk {
        id: row.get(0)?,
        episode_id: row.get(1)?,
        topic_id: row.get(2)?,
        start_segment_id: row.get(3)?,
        end_segment_id: row.get(4)?,
        text: row.get(5)?,
        token_est: row.get(6)?,
        fingerprint: row.get(7)?,
        created_at: row.get(8)?,
    })
}

fn collect_rows<T>(
    rows: impl Iterator<Item = rusqlite::Result<T>>,
    what: &str,
) -> Result<Vec<T>, AppError> {
    let mut out = Vec::new();
    for r in rows {
        out.push(r.map_err(|e| query_failed(&format!("decode {what} row"), e))?);
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Episodes and segments
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EpisodeDraft {
    pub source_id: String,
    pub title: String,
    pub show: Option<String>,
    pub published_at: Option<String>,
    pub url: Option<String>,
    pub raw_text: Option<String>,
}

/// Create the episode on first sight of `source_id`, otherwise backfill
/// metadata columns that are still NULL. Returns (id, created).
pub fn upsert_episode(conn: &Connection, draft: &EpisodeDraft) -> Result<(i64, bool), AppError> {
    let source_id = draft.source_id.trim();
    if source_id.is_empty() {
        return Err(AppError::new(
            "EPISODE_SOURCE_ID_REQUIRED",
            "Episode source_id is required",
        ));
    }
    let title = draft.title.trim();
    if title.is_empty() {
        return Err(AppError::new(
            "EPISODE_TITLE_REQUIRED",
            "Episode title is required",
        ));
    }

    let existing: Option<i64> = conn
        .query_row(
            "SELECT id FROM episodes WHERE source_id = ?1",
            [source_id],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| query_failed("query episode by source_id", e))?;

    if let Some(id) = existing {
        conn.execute(
            r#"
          UPDATE episodes SET
            show = COALESCE(show, ?2),
            published_at = COALESCE(published_at, ?3),
            url = COALESCE(url, ?4),
            raw_text = COALESCE(raw_text, ?5)
          WHERE id = ?1
          "#,
            rusqlite::params![id, draft.show, draft.published_at, draft.url, draft.raw_text],
        )
        .map_err(|e| query_failed("backfill episode metadata", e))?;
        return Ok((id, false));
    }

    conn.execute(
        r#"
      INSERT INTO episodes(source_id, title, show, participants, published_at, url, raw_text, created_at)
      VALUES (?1, ?2, ?3, NULL, ?4, ?5, ?6, strftime('%Y-%m-%dT%H:%M:%fZ','now'))
      "#,
        rusqlite::params![
            source_id,
            title,
            draft.show,
            draft.published_at,
            draft.url,
            draft.raw_text
        ],
    )
    .map_err(|e| {
        AppError::new("EPISODE_INSERT_FAILED", "Failed to insert episode")
            .with_details(e.to_string())
    })?;

    Ok((conn.last_insert_rowid(), true))
}

pub fn fetch_episode(conn: &Connection, id: i64) -> Result<Episode, AppError> {
    conn.query_row(
        &format!("SELECT {EPISODE_COLS} FROM episodes WHERE id = ?1"),
        [id],
        episode_from_row,
    )
    .map_err(|e| AppError::new("DB_NOT_FOUND", "Episode not found").with_details(e.to_string()))
}

pub fn fetch_episode_by_source_id(
    conn: &Connection,
    source_id: &str,
) -> Result<Option<Episode>, AppError> {
    conn.query_row(
        &format!("SELECT {EPISODE_COLS} FROM episodes WHERE source_id = ?1"),
        [source_id.trim()],
        episode_from_row,
    )
    .optional()
    .map_err(|e| query_failed("query episode by source_id", e))
}

pub fn list_episodes(conn: &Connection) -> Result<Vec<Episode>, AppError> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {EPISODE_COLS} FROM episodes ORDER BY id ASC"
        ))
        .map_err(|e| query_failed("prepare episodes query", e))?;
    let rows = stmt
        .query_map([], episode_from_row)
        .map_err(|e| query_failed("query episodes", e))?;
    collect_rows(rows, "episode")
}

/// Record the distinct speakers observed at ingest time, once. Later runs
/// never overwrite a non-empty participant list.
pub fn set_participants_if_empty(
    conn: &Connection,
    episode_id: i64,
    speakers: &[String],
) -> Result<bool, AppError> {
    if speakers.is_empty() {
        return Ok(false);
    }
    let encoded = encode_json_list(speakers, "episode participants")?;
    let changed = conn
        .execute(
            "UPDATE episodes SET participants = ?2 \
             WHERE id = ?1 AND (participants IS NULL OR participants = '[]')",
            rusqlite::params![episode_id, encoded],
        )
        .map_err(|e| query_failed("update episode participants", e))?;
    Ok(changed > 0)
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SegmentInsertSummary {
    /// Stored ids for the non-empty drafts, in input order.
    pub segment_ids: Vec<i64>,
    pub inserted: usize,
    pub reused: usize,
    pub warnings: Vec<IngestWarning>,
}

fn find_segment_by_fingerprint(
    conn: &Connection,
    fingerprint: &str,
) -> Result<Option<Segment>, AppError> {
    conn.query_row(
        &format!("SELECT {SEGMENT_COLS} FROM segments WHERE fingerprint = ?1"),
        [fingerprint],
        segment_from_row,
    )
    .optional()
    .map_err(|e| query_failed("query segment by fingerprint", e))
}

/// Store parsed segments for an episode. Each row is its own atomic unit:
/// an existing fingerprint resolves to the stored row, and a concurrent
/// duplicate insert is re-probed instead of surfacing the constraint error.
pub fn insert_segments(
    conn: &Connection,
    episode_id: i64,
    drafts: &[SegmentDraft],
) -> Result<SegmentInsertSummary, AppError> {
    fetch_episode(conn, episode_id)?;

    let mut next_idx: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(idx) + 1, 0) FROM segments WHERE episode_id = ?1",
            [episode_id],
            |row| row.get(0),
        )
        .map_err(|e| query_failed("query next segment index", e))?;

    let mut summary = SegmentInsertSummary {
        segment_ids: Vec::new(),
        inserted: 0,
        reused: 0,
        warnings: Vec::new(),
    };

    for (pos, draft) in drafts.iter().enumerate() {
        let text = draft.text.trim();
        if text.is_empty() {
            summary.warnings.push(
                IngestWarning::new("INGEST_SEGMENT_EMPTY", "Skipped empty segment")
                    .with_details(format!("position={pos}")),
            );
            continue;
        }

        let fingerprint = content_fingerprint(text);
        if let Some(existing) = find_segment_by_fingerprint(conn, &fingerprint)? {
            if existing.episode_id != episode_id {
                summary.warnings.push(
                    IngestWarning::new(
                        "INGEST_SEGMENT_CROSS_EPISODE",
                        "Segment text already stored under another episode; reusing that row",
                    )
                    .with_details(format!(
                        "position={pos}; segment_id={}; episode_id={}",
                        existing.id, existing.episode_id
                    )),
                );
            }
            summary.segment_ids.push(existing.id);
            summary.reused += 1;
            continue;
        }

        let res = conn.execute(
            r#"
          INSERT INTO segments(episode_id, idx, speaker, start_secs, end_secs, link, text, fingerprint, created_at)
          VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, strftime('%Y-%m-%dT%H:%M:%fZ','now'))
          "#,
            rusqlite::params![
                episode_id,
                next_idx,
                draft.speaker,
                draft.start_secs,
                draft.end_secs,
                draft.link,
                text,
                fingerprint
            ],
        );

        match res {
            Ok(_) => {
                summary.segment_ids.push(conn.last_insert_rowid());
                summary.inserted += 1;
                next_idx += 1;
            }
            Err(e) if is_unique_constraint_error(&e) => {
                // Lost a race with a concurrent ingest of the same text.
                let existing = find_segment_by_fingerprint(conn, &fingerprint)?.ok_or_else(|| {
                    AppError::new("SEGMENT_INSERT_FAILED", "Segment insert conflicted")
                        .with_details(format!("position={pos}; err={e}"))
                })?;
                summary.segment_ids.push(existing.id);
                summary.reused += 1;
            }
            Err(e) => {
                return Err(AppError::new(
                    "SEGMENT_INSERT_FAILED",
                    "Failed to insert segment",
                )
                .with_details(format!("position={pos}; err={e}")));
            }
        }
    }

    Ok(summary)
}

pub fn fetch_segment(conn: &Connection, id: i64) -> Result<Segment, AppError> {
    conn.query_row(
        &format!("SELECT {SEGMENT_COLS} FROM segments WHERE id = ?1"),
        [id],
        segment_from_row,
    )
    .map_err(|e| AppError::new("DB_NOT_FOUND", "Segment not found").with_details(e.to_string()))
}

pub fn segments_for_episode(
    conn: &Connection,
    episode_id: i64,
) -> Result<Vec<Segment>, AppError> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {SEGMENT_COLS} FROM segments WHERE episode_id = ?1 ORDER BY idx ASC, id ASC"
        ))
        .map_err(|e| query_failed("prepare segments query", e))?;
    let rows = stmt
        .query_map([episode_id], segment_from_row)
        .map_err(|e| query_failed("query segments", e))?;
    collect_rows(rows, "segment")
}

// ---------------------------------------------------------------------------
// Topics
// ---------------------------------------------------------------------------

/// Upsert a topic span keyed by (episode, name). The segment range must lie
/// inside the episode in display order. Returns (id, created).
pub fn upsert_topic(
    conn: &Connection,
    episode_id: i64,
    draft: &TopicDraft,
) -> Result<(i64, bool), AppError> {
    let name = draft.name.trim();
    if name.is_empty() {
        return Err(AppError::new("TOPIC_NAME_REQUIRED", "Topic name is required"));
    }

    let start = fetch_segment(conn, draft.start_segment_id).map_err(|e| {
        AppError::new("TOPIC_RANGE_INVALID", "Topic start segment does not exist")
            .with_details(e.to_string())
    })?;
    let end = fetch_segment(conn, draft.end_segment_id).map_err(|e| {
        AppError::new("TOPIC_RANGE_INVALID", "Topic end segment does not exist")
            .with_details(e.to_string())
    })?;
    if start.episode_id != episode_id || end.episode_id != episode_id {
        return Err(AppError::new(
            "TOPIC_RANGE_INVALID",
            "Topic segment range crosses episodes",
        )
        .with_details(format!(
            "episode_id={episode_id}; start_episode={}; end_episode={}",
            start.episode_id, end.episode_id
        )));
    }
    if start.idx > end.idx {
        return Err(AppError::new(
            "TOPIC_RANGE_INVALID",
            "Topic start segment comes after its end segment",
        )
        .with_details(format!("start_idx={}; end_idx={}", start.idx, end.idx)));
    }

    let existing: Option<Topic> = conn
        .query_row(
            &format!("SELECT {TOPIC_COLS} FROM topics WHERE episode_id = ?1 AND name = ?2"),
            rusqlite::params![episode_id, name],
            topic_from_row,
        )
        .optional()
        .map_err(|e| query_failed("query topic by name", e))?;

    if let Some(topic) = existing {
        let changed = topic.summary.as_deref() != draft.summary.as_deref()
            || topic.start_segment_id != draft.start_segment_id
            || topic.end_segment_id != draft.end_segment_id;
        if changed {
            conn.execute(
                "UPDATE topics SET summary = ?2, start_segment_id = ?3, end_segment_id = ?4 WHERE id = ?1",
                rusqlite::params![
                    topic.id,
                    draft.summary,
                    draft.start_segment_id,
                    draft.end_segment_id
                ],
            )
            .map_err(|e| query_failed("update topic", e))?;
        }
        return Ok((topic.id, false));
    }

    conn.execute(
        r#"
      INSERT INTO topics(episode_id, name, summary, start_segment_id, end_segment_id, created_at)
      VALUES (?1, ?2, ?3, ?4, ?5, strftime('%Y-%m-%dT%H:%M:%fZ','now'))
      "#,
        rusqlite::params![
            episode_id,
            name,
            draft.summary,
            draft.start_segment_id,
            draft.end_segment_id
        ],
    )
    .map_err(|e| {
        AppError::new("TOPIC_INSERT_FAILED", "Failed to insert topic").with_details(e.to_string())
    })?;

    Ok((conn.last_insert_rowid(), true))
}

pub fn topics_for_episode(conn: &Connection, episode_id: i64) -> Result<Vec<Topic>, AppError> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {TOPIC_COLS} FROM topics WHERE episode_id = ?1 ORDER BY start_segment_id ASC, id ASC"
        ))
        .map_err(|e| query_failed("prepare topics query", e))?;
    let rows = stmt
        .query_map([episode_id], topic_from_row)
        .map_err(|e| query_failed("query topics", e))?;
    collect_rows(rows, "topic")
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EntityUpsertOutcome {
    pub entity_id: i64,
    pub created: bool,
    pub updated: bool,
}

fn clean_aliases(canonical: &str, raw: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for alias in raw {
        let a = alias.trim();
        if a.is_empty() || normalize_name(a) == canonical {
            continue;
        }
        if !out.iter().any(|x| x == a) {
            out.push(a.to_string());
        }
    }
    out
}

fn merge_aliases(existing: &[String], incoming: &[String]) -> Vec<String> {
    let mut out: Vec<String> = existing.to_vec();
    for alias in incoming {
        if !out.iter().any(|x| x == alias) {
            out.push(alias.clone());
        }
    }
    out
}

fn find_entity_by_canonical(
    conn: &Connection,
    canonical: &str,
) -> Result<Option<Entity>, AppError> {
    conn.query_row(
        &format!("SELECT {ENTITY_COLS} FROM entities WHERE canonical_name = ?1"),
        [canonical],
        entity_from_row,
    )
    .optional()
    .map_err(|e| query_failed("query entity by canonical name", e))
}

fn merge_into_entity(
    conn: &Connection,
    episode_id: i64,
    existing: &Entity,
    draft: &EntityDraft,
) -> Result<EntityUpsertOutcome, AppError> {
    if existing.entity_type != draft.entity_type {
        return Err(AppError::new(
            "CONFLICT",
            "Canonical name already registered with a different entity type",
        )
        .with_details(format!(
            "name={}; stored={}; incoming={}",
            existing.canonical_name,
            existing.entity_type.as_str(),
            draft.entity_type.as_str()
        )));
    }

    let incoming = clean_aliases(&existing.canonical_name, &draft.aliases);
    let merged = merge_aliases(&existing.aliases, &incoming);
    let changed = merged != existing.aliases || existing.last_seen_episode_id != Some(episode_id);
    if changed {
        let encoded = encode_json_list(&merged, "entity aliases")?;
        conn.execute(
            r#"
          UPDATE entities SET
            aliases = ?2,
            last_seen_episode_id = ?3,
            updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
          WHERE id = ?1
          "#,
            rusqlite::params![existing.id, encoded, episode_id],
        )
        .map_err(|e| query_failed("update entity", e))?;
    }

    Ok(EntityUpsertOutcome {
        entity_id: existing.id,
        created: false,
        updated: changed,
    })
}

/// Resolve by case-normalized canonical name: merge aliases and bump the
/// last-seen episode on a match, insert otherwise. A name registered under a
/// different entity type fails with a `CONFLICT` error for that row.
pub fn upsert_entity(
    conn: &Connection,
    episode_id: i64,
    draft: &EntityDraft,
) -> Result<EntityUpsertOutcome, AppError> {
    let display = draft.name.trim();
    let canonical = normalize_name(display);
    if canonical.is_empty() {
        return Err(AppError::new(
            "ENTITY_NAME_REQUIRED",
            "Entity canonical name is required",
        ));
    }

    if let Some(existing) = find_entity_by_canonical(conn, &canonical)? {
        return merge_into_entity(conn, episode_id, &existing, draft);
    }

    let aliases = clean_aliases(&canonical, &draft.aliases);
    let encoded = encode_json_list(&aliases, "entity aliases")?;
    let res = conn.execute(
        r#"
      INSERT INTO entities(entity_type, canonical_name, display_name, aliases,
                           first_seen_episode_id, last_seen_episode_id, created_at, updated_at)
      VALUES (?1, ?2, ?3, ?4, ?5, ?5,
              strftime('%Y-%m-%dT%H:%M:%fZ','now'), strftime('%Y-%m-%dT%H:%M:%fZ','now'))
      "#,
        rusqlite::params![
            draft.entity_type.as_str(),
            canonical,
            display,
            encoded,
            episode_id
        ],
    );

    match res {
        Ok(_) => Ok(EntityUpsertOutcome {
            entity_id: conn.last_insert_rowid(),
            created: true,
            updated: false,
        }),
        Err(e) if is_unique_constraint_error(&e) => {
            // Concurrent first mention of the same name: merge into the winner.
            match find_entity_by_canonical(conn, &canonical)? {
                Some(existing) => merge_into_entity(conn, episode_id, &existing, draft),
                None => Err(AppError::new(
                    "ENTITY_INSERT_FAILED",
                    "Entity insert conflicted",
                )
                .with_details(e.to_string())),
            }
        }
        Err(e) => Err(
            AppError::new("ENTITY_INSERT_FAILED", "Failed to insert entity")
                .with_details(e.to_string()),
        ),
    }
}

pub fn fetch_entity(conn: &Connection, id: i64) -> Result<Entity, AppError> {
    conn.query_row(
        &format!("SELECT {ENTITY_COLS} FROM entities WHERE id = ?1"),
        [id],
        entity_from_row,
    )
    .map_err(|e| AppError::new("DB_NOT_FOUND", "Entity not found").with_details(e.to_string()))
}

pub fn fetch_entity_by_name(conn: &Connection, name: &str) -> Result<Option<Entity>, AppError> {
    find_entity_by_canonical(conn, &normalize_name(name))
}

pub fn list_entities(conn: &Connection) -> Result<Vec<Entity>, AppError> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {ENTITY_COLS} FROM entities ORDER BY canonical_name ASC"
        ))
        .map_err(|e| query_failed("prepare entities query", e))?;
    let rows = stmt
        .query_map([], entity_from_row)
        .map_err(|e| query_failed("query entities", e))?;
    collect_rows(rows, "entity")
}

// ---------------------------------------------------------------------------
// Assertions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AssertionOutcome {
    pub assertion_id: i64,
    pub inserted: bool,
}

fn validate_segment_refs(
    conn: &Connection,
    episode_id: i64,
    segment_ids: &[i64],
) -> Result<Vec<i64>, AppError> {
    let mut ids: Vec<i64> = segment_ids.to_vec();
    ids.sort_unstable();
    ids.dedup();
    if ids.is_empty() {
        return Err(AppError::new(
            "EVIDENCE_MISSING",
            "Assertion has no supporting segments",
        ));
    }
    for id in &ids {
        let owner: Option<i64> = conn
            .query_row(
                "SELECT episode_id FROM segments WHERE id = ?1",
                [id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| query_failed("query segment owner", e))?;
        match owner {
            Some(eid) if eid == episode_id => {}
            Some(eid) => {
                return Err(AppError::new(
                    "EVIDENCE_MISSING",
                    "Supporting segment belongs to a different episode",
                )
                .with_details(format!("segment_id={id}; episode_id={eid}")));
            }
            None => {
                return Err(AppError::new(
                    "EVIDENCE_MISSING",
                    "Supporting segment does not exist",
                )
                .with_details(format!("segment_id={id}")));
            }
        }
    }
    Ok(ids)
}

fn find_assertion_id_by_fingerprint(
    conn: &Connection,
    fingerprint: &str,
) -> Result<Option<i64>, AppError> {
    conn.query_row(
        "SELECT id FROM assertions WHERE fingerprint = ?1",
        [fingerprint],
        |row| row.get(0),
    )
    .optional()
    .map_err(|e| query_failed("query assertion by fingerprint", e))
}

/// Store a candidate claim. Every supporting segment must resolve inside the
/// target episode; an existing fingerprint resolves to the stored row.
pub fn insert_assertion(
    conn: &Connection,
    episode_id: i64,
    entity_id: i64,
    draft: &AssertionDraft,
) -> Result<AssertionOutcome, AppError> {
    let statement = draft.statement.trim();
    if statement.is_empty() {
        return Err(AppError::new(
            "ASSERTION_STATEMENT_REQUIRED",
            "Assertion statement is required",
        ));
    }

    let ids = validate_segment_refs(conn, episode_id, &draft.segment_ids)?;
    let fingerprint =
        assertion_fingerprint(episode_id, statement, draft.speaker.as_deref(), &ids);

    if let Some(id) = find_assertion_id_by_fingerprint(conn, &fingerprint)? {
        return Ok(AssertionOutcome {
            assertion_id: id,
            inserted: false,
        });
    }

    let confidence = draft.confidence.clamp(0.0, 1.0);
    let priority = draft.verification_priority.clamp(0.0, 1.0);
    let quote = draft
        .evidence_quote
        .as_deref()
        .map(|q| take_quote(q, EVIDENCE_QUOTE_MAX_CHARS))
        .filter(|q| !q.is_empty());
    let encoded_ids = encode_json_list(&ids, "assertion segment_ids")?;

    let res = conn.execute(
        r#"
      INSERT INTO assertions(entity_id, episode_id, assertion_type, statement, speaker,
                             confidence, verification_priority, verification_status,
                             segment_ids, evidence_quote, fingerprint, created_at)
      VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'unverified', ?8, ?9, ?10,
              strftime('%Y-%m-%dT%H:%M:%fZ','now'))
      "#,
        rusqlite::params![
            entity_id,
            episode_id,
            draft.assertion_type.as_str(),
            statement,
            draft.speaker,
            confidence,
            priority,
            encoded_ids,
            quote,
            fingerprint
        ],
    );

    match res {
        Ok(_) => Ok(AssertionOutcome {
            assertion_id: conn.last_insert_rowid(),
            inserted: true,
        }),
        Err(e) if is_unique_constraint_error(&e) => {
            match find_assertion_id_by_fingerprint(conn, &fingerprint)? {
                Some(id) => Ok(AssertionOutcome {
                    assertion_id: id,
                    inserted: false,
                }),
                None => Err(AppError::new(
                    "CONFLICT",
                    "Assertion insert hit a uniqueness constraint",
                )
                .with_details(e.to_string())),
            }
        }
        Err(e) => Err(
            AppError::new("ASSERTION_INSERT_FAILED", "Failed to insert assertion")
                .with_details(e.to_string()),
        ),
    }
}

/// The only mutation allowed on a stored assertion.
pub fn set_verification_status(
    conn: &Connection,
    assertion_id: i64,
    status: VerificationStatus,
) -> Result<(), AppError> {
    let changed = conn
        .execute(
            "UPDATE assertions SET verification_status = ?2 WHERE id = ?1",
            rusqlite::params![assertion_id, status.as_str()],
        )
        .map_err(|e| query_failed("update verification status", e))?;
    if changed == 0 {
        return Err(AppError::new("DB_NOT_FOUND", "Assertion not found")
            .with_details(format!("assertion_id={assertion_id}")));
    }
    Ok(())
}

pub fn fetch_assertion(conn: &Connection, id: i64) -> Result<Assertion, AppError> {
    conn.query_row(
        &format!("SELECT {ASSERTION_COLS} FROM assertions WHERE id = ?1"),
        [id],
        assertion_from_row,
    )
    .map_err(|e| AppError::new("DB_NOT_FOUND", "Assertion not found").with_details(e.to_string()))
}

pub fn assertions_for_entity(
    conn: &Connection,
    entity_id: i64,
) -> Result<Vec<Assertion>, AppError> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {ASSERTION_COLS} FROM assertions WHERE entity_id = ?1 ORDER BY id ASC"
        ))
        .map_err(|e| query_failed("prepare assertions query", e))?;
    let rows = stmt
        .query_map([entity_id], assertion_from_row)
        .map_err(|e| query_failed("query assertions", e))?;
    collect_rows(rows, "assertion")
}

pub fn assertions_for_episode(
    conn: &Connection,
    episode_id: i64,
) -> Result<Vec<Assertion>, AppError> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {ASSERTION_COLS} FROM assertions WHERE episode_id = ?1 ORDER BY id ASC"
        ))
        .map_err(|e| query_failed("prepare assertions query", e))?;
    let rows = stmt
        .query_map([episode_id], assertion_from_row)
        .map_err(|e| query_failed("query assertions", e))?;
    collect_rows(rows, "assertion")
}

// ---------------------------------------------------------------------------
// Tech cards
// ---------------------------------------------------------------------------

/// Merge-and-summarize upsert keyed by entity id: key points and comparisons
/// are unioned, the recent summary is replaced. Returns (id, created).
pub fn upsert_card(
    conn: &Connection,
    entity_id: i64,
    content: &CardContent,
) -> Result<(i64, bool), AppError> {
    fetch_entity(conn, entity_id)?;

    let existing = card_for_entity(conn, entity_id)?;
    if let Some(card) = existing {
        let old = CardContent {
            definition: card.definition.clone(),
            key_points: card.key_points.clone(),
            comparisons: card.comparisons.clone(),
            recent_summary: card.recent_summary.clone(),
        };
        let merged = merge_cards(&old, content);
        conn.execute(
            r#"
          UPDATE tech_cards SET
            definition = ?2,
            key_points = ?3,
            comparisons = ?4,
            recent_summary = ?5,
            updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
          WHERE id = ?1
          "#,
            rusqlite::params![
                card.id,
                merged.definition,
                encode_json_list(&merged.key_points, "card key_points")?,
                encode_json_list(&merged.comparisons, "card comparisons")?,
                merged.recent_summary
            ],
        )
        .map_err(|e| query_failed("update tech card", e))?;
        return Ok((card.id, false));
    }

    let fresh = merge_cards(&CardContent::default(), content);
    conn.execute(
        r#"
      INSERT INTO tech_cards(entity_id, definition, key_points, comparisons, recent_summary,
                             created_at, updated_at)
      VALUES (?1, ?2, ?3, ?4, ?5,
              strftime('%Y-%m-%dT%H:%M:%fZ','now'), strftime('%Y-%m-%dT%H:%M:%fZ','now'))
      "#,
        rusqlite::params![
            entity_id,
            fresh.definition,
            encode_json_list(&fresh.key_points, "card key_points")?,
            encode_json_list(&fresh.comparisons, "card comparisons")?,
            fresh.recent_summary
        ],
    )
    .map_err(|e| {
        AppError::new("CARD_INSERT_FAILED", "Failed to insert tech card")
            .with_details(e.to_string())
    })?;

    Ok((conn.last_insert_rowid(), true))
}

pub fn fetch_card(conn: &Connection, id: i64) -> Result<TechCard, AppError> {
    conn.query_row(
        &format!("SELECT {CARD_COLS} FROM tech_cards WHERE id = ?1"),
        [id],
        card_from_row,
    )
    .map_err(|e| AppError::new("DB_NOT_FOUND", "Tech card not found").with_details(e.to_string()))
}

pub fn card_for_entity(conn: &Connection, entity_id: i64) -> Result<Option<TechCard>, AppError> {
    conn.query_row(
        &format!("SELECT {CARD_COLS} FROM tech_cards WHERE entity_id = ?1"),
        [entity_id],
        card_from_row,
    )
    .optional()
    .map_err(|e| query_failed("query tech card", e))
}

pub fn list_cards(conn: &Connection) -> Result<Vec<TechCard>, AppError> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {CARD_COLS} FROM tech_cards ORDER BY entity_id ASC"
        ))
        .map_err(|e| query_failed("prepare tech cards query", e))?;
    let rows = stmt
        .query_map([], card_from_row)
        .map_err(|e| query_failed("query tech cards", e))?;
    collect_rows(rows, "tech card")
}

// ---------------------------------------------------------------------------
// Chunks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkInsertOutcome {
    pub chunk_id: i64,
    pub inserted: bool,
}

fn find_chunk_id_by_fingerprint(
    conn: &Connection,
    fingerprint: &str,
) -> Result<Option<i64>, AppError> {
    conn.query_row(
        "SELECT id FROM chunks WHERE fingerprint = ?1",
        [fingerprint],
        |row| row.get(0),
    )
    .optional()
    .map_err(|e| query_failed("query chunk by fingerprint", e))
}

/// Store a built chunk and its ordered segment membership. Rebuilds that
/// produce identical text resolve to the stored row without touching
/// membership.
pub fn insert_chunk(
    conn: &Connection,
    episode_id: i64,
    topic_id: Option<i64>,
    segment_ids: &[i64],
    text: &str,
    token_est: i64,
) -> Result<ChunkInsertOutcome, AppError> {
    if segment_ids.is_empty() {
        return Err(AppError::new(
            "CHUNK_SEGMENTS_REQUIRED",
            "Chunk needs at least one segment",
        ));
    }
    for id in segment_ids {
        let owner: Option<i64> = conn
            .query_row(
                "SELECT episode_id FROM segments WHERE id = ?1",
                [id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| query_failed("query segment owner", e))?;
        if owner != Some(episode_id) {
            return Err(AppError::new(
                "CHUNK_SEGMENTS_INVALID",
                "Chunk segment does not belong to the episode",
            )
            .with_details(format!("segment_id={id}")));
        }
    }

    let fingerprint = content_fingerprint(text);
    if let Some(id) = find_chunk_id_by_fingerprint(conn, &fingerprint)? {
        return Ok(ChunkInsertOutcome {
            chunk_id: id,
            inserted: false,
        });
    }

    let start = segment_ids[0];
    let end = segment_ids[segment_ids.len() - 1];
    let res = conn.execute(
        r#"
      INSERT INTO chunks(episode_id, topic_id, start_segment_id, end_segment_id, text,
                         token_est, fingerprint, created_at)
      VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, strftime('%Y-%m-%dT%H:%M:%fZ','now'))
      "#,
        rusqlite::params![episode_id, topic_id, start, end, text, token_est, fingerprint],
    );

    let chunk_id = match res {
        Ok(_) => conn.last_insert_rowid(),
        Err(e) if is_unique_constraint_error(&e) => {
            match find_chunk_id_by_fingerprint(conn, &fingerprint)? {
                Some(id) => {
                    return Ok(ChunkInsertOutcome {
                        chunk_id: id,
                        inserted: false,
                    })
                }
                None => {
                    return Err(AppError::new(
                        "CHUNK_INSERT_FAILED",
                        "Chunk insert conflicted",
                    )
                    .with_details(e.to_string()))
                }
            }
        }
        Err(e) => {
            return Err(
                AppError::new("CHUNK_INSERT_FAILED", "Failed to insert chunk")
                    .with_details(e.to_string()),
            )
        }
    };

    for (ordinal, segment_id) in segment_ids.iter().enumerate() {
        conn.execute(
            "INSERT INTO chunk_segments(chunk_id, segment_id, ordinal) VALUES (?1, ?2, ?3)",
            rusqlite::params![chunk_id, segment_id, ordinal as i64],
        )
        .map_err(|e| {
            AppError::new(
                "CHUNK_INSERT_FAILED",
                "Failed to insert chunk segment membership",
            )
            .with_details(format!("chunk_id={chunk_id}; segment_id={segment_id}; err={e}"))
        })?;
    }

    Ok(ChunkInsertOutcome {
        chunk_id,
        inserted: true,
    })
}

pub fn fetch_chunk(conn: &Connection, id: i64) -> Result<Chunk, AppError> {
    conn.query_row(
        &format!("SELECT {CHUNK_COLS} FROM chunks WHERE id = ?1"),
        [id],
        chunk_from_row,
    )
    .map_err(|e| AppError::new("DB_NOT_FOUND", "Chunk not found").with_details(e.to_string()))
}

pub fn chunks_for_episode(conn: &Connection, episode_id: i64) -> Result<Vec<Chunk>, AppError> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {CHUNK_COLS} FROM chunks WHERE episode_id = ?1 ORDER BY start_segment_id ASC, id ASC"
        ))
        .map_err(|e| query_failed("prepare chunks query", e))?;
    let rows = stmt
        .query_map([episode_id], chunk_from_row)
        .map_err(|e| query_failed("query chunks", e))?;
    collect_rows(rows, "chunk")
}

pub fn segments_for_chunk(conn: &Connection, chunk_id: i64) -> Result<Vec<Segment>, AppError> {
    let mut stmt = conn
        .prepare(
            r#"
          SELECT s.id, s.episode_id, s.idx, s.speaker, s.start_secs, s.end_secs, s.link,
                 s.text, s.fingerprint, s.created_at
          FROM chunk_segments cs
          JOIN segments s ON s.id = cs.segment_id
          WHERE cs.chunk_id = ?1
          ORDER BY cs.ordinal ASC
          "#,
        )
        .map_err(|e| query_failed("prepare chunk segments query", e))?;
    let rows = stmt
        .query_map([chunk_id], segment_from_row)
        .map_err(|e| query_failed("query chunk segments", e))?;
    collect_rows(rows, "chunk segment")
}

// ---------------------------------------------------------------------------
// Extraction batch coordinator
// ---------------------------------------------------------------------------

/// Row-level failure surfaced in the batch summary instead of aborting the
/// batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RowConflict {
    pub subject: String,
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExtractionApplySummary {
    pub topics_upserted: usize,
    pub entities_created: usize,
    pub entities_updated: usize,
    pub assertions_inserted: usize,
    pub assertions_deduped: usize,
    pub cards_upserted: usize,
    pub conflicts: Vec<RowConflict>,
    pub warnings: Vec<IngestWarning>,
}

fn resolve_entity_id(
    conn: &Connection,
    resolved: &HashMap<String, i64>,
    name: &str,
) -> Result<Option<i64>, AppError> {
    let canonical = normalize_name(name);
    if let Some(id) = resolved.get(&canonical) {
        return Ok(Some(*id));
    }
    Ok(fetch_entity_by_name(conn, name)?.map(|e| e.id))
}

/// Apply one extraction batch to the store. Each row is handled
/// independently: conflicts and rejected candidates land in the summary and
/// the batch keeps going. Re-applying an unchanged batch changes nothing
/// except card bookkeeping.
pub fn apply_extraction(
    conn: &Connection,
    episode_id: i64,
    batch: &ExtractionBatch,
) -> Result<ExtractionApplySummary, AppError> {
    fetch_episode(conn, episode_id)?;

    let mut summary = ExtractionApplySummary::default();
    let mut resolved: HashMap<String, i64> = HashMap::new();

    for draft in &batch.topics {
        match upsert_topic(conn, episode_id, draft) {
            Ok(_) => summary.topics_upserted += 1,
            Err(e) if e.code == "TOPIC_RANGE_INVALID" || e.code == "TOPIC_NAME_REQUIRED" => {
                summary.warnings.push(
                    IngestWarning::new("EXTRACT_TOPIC_SKIPPED", "Skipped invalid topic candidate")
                        .with_details(format!("name={}; reason={}", draft.name, e.message)),
                );
            }
            Err(e) => return Err(e),
        }
    }

    for draft in &batch.entities {
        match upsert_entity(conn, episode_id, draft) {
            Ok(outcome) => {
                resolved.insert(normalize_name(&draft.name), outcome.entity_id);
                if outcome.created {
                    summary.entities_created += 1;
                } else if outcome.updated {
                    summary.entities_updated += 1;
                }
            }
            Err(e) if e.code == "CONFLICT" => {
                summary.conflicts.push(RowConflict {
                    subject: "entity".to_string(),
                    name: draft.name.clone(),
                    reason: e.details.unwrap_or(e.message),
                });
            }
            Err(e) if e.code == "ENTITY_NAME_REQUIRED" => {
                summary.warnings.push(IngestWarning::new(
                    "EXTRACT_ENTITY_SKIPPED",
                    "Skipped entity candidate without a name",
                ));
            }
            Err(e) => return Err(e),
        }
    }

    for draft in &batch.assertions {
        let entity_id = match resolve_entity_id(conn, &resolved, &draft.entity_name)? {
            Some(id) => id,
            None => {
                summary.warnings.push(
                    IngestWarning::new(
                        "EXTRACT_ASSERTION_ENTITY_UNKNOWN",
                        "Assertion candidate references an unknown entity",
                    )
                    .with_details(format!("entity={}", draft.entity_name)),
                );
                continue;
            }
        };

        match insert_assertion(conn, episode_id, entity_id, draft) {
            Ok(outcome) => {
                if outcome.inserted {
                    summary.assertions_inserted += 1;
                } else {
                    summary.assertions_deduped += 1;
                }
            }
            Err(e) if e.code == "EVIDENCE_MISSING" => {
                summary.warnings.push(
                    IngestWarning::new(
                        "EXTRACT_ASSERTION_EVIDENCE_MISSING",
                        "Rejected assertion candidate without resolvable evidence",
                    )
                    .with_details(format!(
                        "entity={}; reason={}",
                        draft.entity_name,
                        e.details.unwrap_or(e.message)
                    )),
                );
            }
            Err(e) if e.code == "CONFLICT" || e.code == "ASSERTION_STATEMENT_REQUIRED" => {
                summary.conflicts.push(RowConflict {
                    subject: "assertion".to_string(),
                    name: draft.entity_name.clone(),
                    reason: e.details.unwrap_or(e.message),
                });
            }
            Err(e) => return Err(e),
        }
    }

    for draft in &batch.cards {
        let entity_id = match resolve_entity_id(conn, &resolved, &draft.entity_name)? {
            Some(id) => id,
            None => {
                summary.warnings.push(
                    IngestWarning::new(
                        "EXTRACT_CARD_ENTITY_UNKNOWN",
                        "Card candidate references an unknown entity",
                    )
                    .with_details(format!("entity={}", draft.entity_name)),
                );
                continue;
            }
        };
        upsert_card(conn, entity_id, &card_content_from_draft(draft))?;
        summary.cards_upserted += 1;
    }

    Ok(summary)
}

fn card_content_from_draft(draft: &CardDraft) -> CardContent {
    CardContent {
        definition: draft
            .definition
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(str::to_string),
        key_points: draft.key_points.clone(),
        comparisons: draft.comparisons.clone(),
        recent_summary: draft
            .recent_summary
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
    }
}
