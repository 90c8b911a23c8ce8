use std::collections::HashMap;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::domain::{IngestWarning, Segment, Topic};
use crate::error::AppError;
use crate::normalize::{estimate_tokens, seconds_to_hms};
use crate::store;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkingConfig {
    pub max_tokens: usize,
    pub min_segments: usize,
    pub max_segments: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        ChunkingConfig {
            max_tokens: 800,
            min_segments: 2,
            max_segments: 6,
        }
    }
}

impl ChunkingConfig {
    fn normalized(&self) -> ChunkingConfig {
        let min_segments = self.min_segments.max(1);
        ChunkingConfig {
            max_tokens: self.max_tokens.max(1),
            min_segments,
            max_segments: self.max_segments.max(min_segments),
        }
    }
}

/// Inclusive index range into the episode's ordered segment list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    pub start_index: usize,
    pub end_index: usize,
    pub topic_id: Option<i64>,
}

/// The topic claiming each segment position. Overlapping topics resolve to
/// the lowest topic id; topics whose boundary segments are not in the list
/// claim nothing.
fn region_ids(segments: &[Segment], topics: &[Topic]) -> Vec<Option<i64>> {
    let pos: HashMap<i64, usize> = segments.iter().enumerate().map(|(i, s)| (s.id, i)).collect();
    let mut regions: Vec<Option<i64>> = vec![None; segments.len()];

    let mut ordered: Vec<&Topic> = topics.iter().collect();
    ordered.sort_by_key(|t| t.id);
    for topic in ordered {
        let (a, b) = match (
            pos.get(&topic.start_segment_id),
            pos.get(&topic.end_segment_id),
        ) {
            (Some(&a), Some(&b)) if a <= b => (a, b),
            _ => continue,
        };
        for region in regions[a..=b].iter_mut() {
            if region.is_none() {
                *region = Some(topic.id);
            }
        }
    }
    regions
}

/// Partition the segments into chunk plans. Every segment lands in exactly
/// one plan, plans never cross a topic boundary, and a plan exceeds the token
/// budget only when the segment minimum forces it.
pub fn plan_chunks(
    segments: &[Segment],
    topics: &[Topic],
    cfg: &ChunkingConfig,
) -> Vec<ChunkPlan> {
    let cfg = cfg.normalized();
    let regions = region_ids(segments, topics);
    let mut plans: Vec<ChunkPlan> = Vec::new();

    let mut start = 0usize;
    while start < segments.len() {
        let region = regions[start];
        let mut run_end = start;
        while run_end + 1 < segments.len() && regions[run_end + 1] == region {
            run_end += 1;
        }

        let mut i = start;
        while i <= run_end {
            let mut end = i;
            let mut tokens = estimate_tokens(&segments[i].text);
            let mut count = 1usize;
            while end < run_end {
                let next = estimate_tokens(&segments[end + 1].text);
                let forced = count < cfg.min_segments;
                let fits = tokens + next <= cfg.max_tokens as i64 && count < cfg.max_segments;
                if forced || fits {
                    end += 1;
                    count += 1;
                    tokens += next;
                } else {
                    break;
                }
            }
            plans.push(ChunkPlan {
                start_index: i,
                end_index: end,
                topic_id: region,
            });
            i = end + 1;
        }

        start = run_end + 1;
    }

    plans
}

/// Render the retrieval text for a chunk: an optional topic header followed
/// by one speaker-attributed line per segment.
pub fn chunk_text(segments: &[Segment], topic_name: Option<&str>) -> String {
    let mut lines: Vec<String> = Vec::new();
    if let Some(name) = topic_name {
        lines.push(format!("[Topic: {name}]"));
    }
    for seg in segments {
        let speaker = seg.speaker.as_deref().unwrap_or("Unknown");
        match seg.start_secs {
            Some(secs) => lines.push(format!(
                "{speaker} ({}): {}",
                seconds_to_hms(secs),
                seg.text
            )),
            None => lines.push(format!("{speaker}: {}", seg.text)),
        }
    }
    lines.join("\n")
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkBuildSummary {
    pub planned: usize,
    pub inserted: usize,
    pub reused: usize,
    pub warnings: Vec<IngestWarning>,
}

/// Build and store the chunk partition for one episode. Rebuilding over
/// unchanged segments resolves every plan to its stored row. An episode with
/// no segments reports zero plans.
pub fn build_chunks(
    conn: &Connection,
    episode_id: i64,
    cfg: &ChunkingConfig,
) -> Result<ChunkBuildSummary, AppError> {
    store::fetch_episode(conn, episode_id)?;
    let segments = store::segments_for_episode(conn, episode_id)?;
    let topics = store::topics_for_episode(conn, episode_id)?;
    let names: HashMap<i64, String> = topics.iter().map(|t| (t.id, t.name.clone())).collect();

    let plans = plan_chunks(&segments, &topics, cfg);
    let mut summary = ChunkBuildSummary {
        planned: plans.len(),
        ..ChunkBuildSummary::default()
    };

    for plan in &plans {
        let slice = &segments[plan.start_index..=plan.end_index];
        let topic_name = plan
            .topic_id
            .and_then(|id| names.get(&id))
            .map(String::as_str);
        let text = chunk_text(slice, topic_name);
        let token_est = estimate_tokens(&text) as i64;
        let ids: Vec<i64> = slice.iter().map(|s| s.id).collect();
        let outcome = store::insert_chunk(conn, episode_id, plan.topic_id, &ids, &text, token_est)?;
        if outcome.inserted {
            summary.inserted += 1;
        } else {
            summary.reused += 1;
        }
    }

    log::info!(
        "chunked episode {episode_id}: {} planned, {} inserted, {} reused",
        summary.planned,
        summary.inserted,
        summary.reused
    );
    Ok(summary)
}
