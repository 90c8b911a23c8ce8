use rusqlite::Connection;

use crate::domain::Assertion;
use crate::error::AppError;
use crate::store;

/// Assertions at or above this verification priority land in the report's
/// review queue.
pub const VERIFICATION_FLAG_THRESHOLD: f64 = 0.7;

fn count_rows(conn: &Connection, sql: &str) -> Result<i64, AppError> {
    conn.query_row(sql, [], |row| row.get(0)).map_err(|e| {
        AppError::new("DB_QUERY_FAILED", "Failed to count rows").with_details(e.to_string())
    })
}

fn entity_assertion_counts(
    conn: &Connection,
    episode_id: Option<i64>,
    limit: Option<usize>,
) -> Result<Vec<(String, String, i64)>, AppError> {
    let mut sql = String::from(
        "SELECT e.display_name, e.entity_type, COUNT(a.id) AS n \
         FROM entities e JOIN assertions a ON a.entity_id = e.id",
    );
    if episode_id.is_some() {
        sql.push_str(" WHERE a.episode_id = ?1");
    }
    sql.push_str(" GROUP BY e.id ORDER BY n DESC, e.canonical_name ASC");
    if let Some(limit) = limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }

    let mut stmt = conn.prepare(&sql).map_err(|e| {
        AppError::new("DB_QUERY_FAILED", "Failed to prepare entity counts")
            .with_details(e.to_string())
    })?;
    let map = |row: &rusqlite::Row<'_>| -> rusqlite::Result<(String, String, i64)> {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?))
    };
    let rows = match episode_id {
        Some(id) => stmt.query_map([id], map),
        None => stmt.query_map([], map),
    }
    .map_err(|e| {
        AppError::new("DB_QUERY_FAILED", "Failed to query entity counts")
            .with_details(e.to_string())
    })?;

    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(|e| {
            AppError::new("DB_QUERY_FAILED", "Failed to decode entity count row")
                .with_details(e.to_string())
        })?);
    }
    Ok(out)
}

fn sort_by_priority(flagged: &mut [Assertion]) {
    flagged.sort_by(|a, b| {
        b.verification_priority
            .partial_cmp(&a.verification_priority)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.id.cmp(&b.id))
    });
}

/// Deterministic markdown digest of one episode: metadata, topic map, entity
/// activity and the verification queue.
pub fn generate_episode_report(conn: &Connection, episode_id: i64) -> Result<String, AppError> {
    let episode = store::fetch_episode(conn, episode_id)?;
    let segments = store::segments_for_episode(conn, episode_id)?;
    let topics = store::topics_for_episode(conn, episode_id)?;
    let entities = entity_assertion_counts(conn, Some(episode_id), None)?;
    let assertions = store::assertions_for_episode(conn, episode_id)?;

    let mut out = String::new();
    out.push_str(&format!("# {}\n\n", episode.title));
    out.push_str(&format!("- Source: {}\n", episode.source_id));
    if let Some(show) = episode.show.as_deref() {
        out.push_str(&format!("- Show: {show}\n"));
    }
    if let Some(published) = episode.published_at.as_deref() {
        out.push_str(&format!("- Published: {published}\n"));
    }
    if let Some(url) = episode.url.as_deref() {
        out.push_str(&format!("- URL: {url}\n"));
    }
    if !episode.participants.is_empty() {
        out.push_str(&format!(
            "- Participants: {}\n",
            episode.participants.join(", ")
        ));
    }
    out.push_str(&format!("- Segments: {}\n\n", segments.len()));

    out.push_str("## Topics\n\n");
    if topics.is_empty() {
        out.push_str("_No topics extracted._\n\n");
    } else {
        for topic in &topics {
            let start = store::fetch_segment(conn, topic.start_segment_id)?;
            let end = store::fetch_segment(conn, topic.end_segment_id)?;
            out.push_str(&format!(
                "- **{}** (segments {}-{})",
                topic.name, start.idx, end.idx
            ));
            if let Some(summary) = topic.summary.as_deref() {
                out.push_str(&format!(": {summary}"));
            }
            out.push('\n');
        }
        out.push('\n');
    }

    out.push_str("## Entities\n\n");
    if entities.is_empty() {
        out.push_str("_No entities extracted._\n\n");
    } else {
        for (name, entity_type, n) in &entities {
            let noun = if *n == 1 { "assertion" } else { "assertions" };
            out.push_str(&format!("- {name} ({entity_type}): {n} {noun}\n"));
        }
        out.push('\n');
    }

    let mut flagged: Vec<Assertion> = assertions
        .into_iter()
        .filter(|a| a.verification_priority >= VERIFICATION_FLAG_THRESHOLD)
        .collect();
    sort_by_priority(&mut flagged);

    out.push_str("## Verification Queue\n\n");
    if flagged.is_empty() {
        out.push_str("_Nothing flagged for verification._\n");
    } else {
        for a in &flagged {
            let entity = store::fetch_entity(conn, a.entity_id)?;
            let speaker = a.speaker.as_deref().unwrap_or("unknown");
            out.push_str(&format!(
                "1. **{:.2}** {} on {}: {} ({speaker})\n",
                a.verification_priority,
                a.assertion_type.as_str(),
                entity.display_name,
                a.statement
            ));
            if let Some(quote) = a.evidence_quote.as_deref() {
                out.push_str(&format!("   > {quote}\n"));
            }
        }
    }

    Ok(out)
}

/// Markdown snapshot of the whole library: row counts plus the most
/// asserted-about entities.
pub fn library_overview(conn: &Connection) -> Result<String, AppError> {
    let episodes = count_rows(conn, "SELECT COUNT(*) FROM episodes")?;
    let segments = count_rows(conn, "SELECT COUNT(*) FROM segments")?;
    let entities = count_rows(conn, "SELECT COUNT(*) FROM entities")?;
    let assertions = count_rows(conn, "SELECT COUNT(*) FROM assertions")?;
    let cards = count_rows(conn, "SELECT COUNT(*) FROM tech_cards")?;
    let chunks = count_rows(conn, "SELECT COUNT(*) FROM chunks")?;

    let mut out = String::new();
    out.push_str("# Library\n\n");
    out.push_str(&format!("- Episodes: {episodes}\n"));
    out.push_str(&format!("- Segments: {segments}\n"));
    out.push_str(&format!("- Entities: {entities}\n"));
    out.push_str(&format!("- Assertions: {assertions}\n"));
    out.push_str(&format!("- Tech cards: {cards}\n"));
    out.push_str(&format!("- Chunks: {chunks}\n\n"));

    let top = entity_assertion_counts(conn, None, Some(10))?;
    out.push_str("## Top Entities\n\n");
    if top.is_empty() {
        out.push_str("_No entities yet._\n");
    } else {
        for (name, entity_type, n) in &top {
            out.push_str(&format!("- {name} ({entity_type}): {n}\n"));
        }
    }

    Ok(out)
}
