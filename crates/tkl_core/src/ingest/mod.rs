pub mod transcript_csv;
pub mod transcript_lines;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::domain::{IngestWarning, SegmentDraft};
use crate::error::AppError;
use crate::store::{self, EpisodeDraft};

pub use transcript_csv::ingest_transcript_csv;
pub use transcript_lines::{detect_format, ingest_transcript_text, preview_transcript_text};

/// Caller-supplied episode metadata. `source_id` is the stable identity used
/// for re-runs; everything else is optional context.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TranscriptMeta {
    pub source_id: String,
    pub title: String,
    pub show: Option<String>,
    pub published_at: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranscriptIngestSummary {
    pub episode_id: i64,
    pub episode_created: bool,
    pub detected_format: String,
    pub segments_inserted: usize,
    pub segments_reused: usize,
    pub segment_ids: Vec<i64>,
    pub warnings: Vec<IngestWarning>,
}

/// What an ingest run would store, without touching the database.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TranscriptPreview {
    pub detected_format: String,
    pub segments: usize,
    pub speakers: Vec<String>,
    pub warnings: Vec<IngestWarning>,
}

/// Shared ingest tail: upsert the episode, store the parsed segments and
/// record first-seen participants.
fn store_drafts(
    conn: &Connection,
    meta: &TranscriptMeta,
    raw_text: &str,
    detected_format: &str,
    drafts: Vec<SegmentDraft>,
    speakers: Vec<String>,
    mut warnings: Vec<IngestWarning>,
) -> Result<TranscriptIngestSummary, AppError> {
    if drafts.is_empty() {
        return Err(AppError::new(
            "INGEST_EMPTY",
            "Transcript produced no segments",
        ));
    }

    let draft = EpisodeDraft {
        source_id: meta.source_id.clone(),
        title: meta.title.clone(),
        show: meta.show.clone(),
        published_at: meta.published_at.clone(),
        url: meta.url.clone(),
        raw_text: Some(raw_text.to_string()),
    };
    let (episode_id, episode_created) = store::upsert_episode(conn, &draft)?;

    let stored = store::insert_segments(conn, episode_id, &drafts)?;
    warnings.extend(stored.warnings);

    store::set_participants_if_empty(conn, episode_id, &speakers)?;

    log::info!(
        "ingested episode {episode_id} ({detected_format}): {} inserted, {} reused",
        stored.inserted,
        stored.reused
    );

    Ok(TranscriptIngestSummary {
        episode_id,
        episode_created,
        detected_format: detected_format.to_string(),
        segments_inserted: stored.inserted,
        segments_reused: stored.reused,
        segment_ids: stored.segment_ids,
        warnings,
    })
}
