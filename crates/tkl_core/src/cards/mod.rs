use std::collections::{HashMap, HashSet};
use std::path::Path;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::domain::{Assertion, Entity, IngestWarning, TechCard};
use crate::error::AppError;
use crate::store;

/// Mutable body of a tech card, without the row bookkeeping.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CardContent {
    pub definition: Option<String>,
    pub key_points: Vec<String>,
    pub comparisons: Vec<String>,
    pub recent_summary: Option<String>,
}

fn union_dedup(old: &[String], new: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for item in old.iter().chain(new.iter()) {
        let t = item.trim();
        if t.is_empty() {
            continue;
        }
        if !out.iter().any(|x| x == t) {
            out.push(t.to_string());
        }
    }
    out
}

fn pick_text(old: &Option<String>, new: &Option<String>) -> Option<String> {
    match new.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(s) => Some(s.to_string()),
        None => old
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
    }
}

/// Fold a newer card body into the stored one. Lists are unioned in first-seen
/// order, the definition is kept unless the newer body supplies one, and the
/// recent summary is replaced outright when present.
pub fn merge_cards(old: &CardContent, new: &CardContent) -> CardContent {
    CardContent {
        definition: pick_text(&old.definition, &new.definition),
        key_points: union_dedup(&old.key_points, &new.key_points),
        comparisons: union_dedup(&old.comparisons, &new.comparisons),
        recent_summary: pick_text(&old.recent_summary, &new.recent_summary),
    }
}

/// Filesystem-safe name: lowercase alphanumerics joined by single dashes.
pub fn slug(name: &str) -> String {
    let mut out = String::new();
    let mut pending_dash = false;
    for ch in name.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(ch.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    if out.is_empty() {
        out.push_str("card");
    }
    out
}

/// Render a card as standalone markdown with YAML frontmatter and a numbered
/// evidence index drawn from the entity's assertions.
pub fn card_markdown(
    entity: &Entity,
    card: &TechCard,
    assertions: &[Assertion],
    episode_titles: &HashMap<i64, String>,
) -> String {
    let mut out = String::new();

    out.push_str("---\n");
    out.push_str(&format!("entity: {}\n", entity.display_name));
    out.push_str(&format!("type: {}\n", entity.entity_type.as_str()));
    let aliases = serde_json::to_string(&entity.aliases).unwrap_or_else(|_| "[]".to_string());
    out.push_str(&format!("aliases: {aliases}\n"));
    out.push_str(&format!("updated: {}\n", card.updated_at));
    out.push_str("---\n\n");

    out.push_str(&format!("# {}\n\n", entity.display_name));

    if let Some(def) = card.definition.as_deref() {
        out.push_str(&format!("{def}\n\n"));
    }

    if !card.key_points.is_empty() {
        out.push_str("## Key Points\n\n");
        for point in &card.key_points {
            out.push_str(&format!("- {point}\n"));
        }
        out.push('\n');
    }

    if !card.comparisons.is_empty() {
        out.push_str("## Comparisons\n\n");
        for comparison in &card.comparisons {
            out.push_str(&format!("- {comparison}\n"));
        }
        out.push('\n');
    }

    if let Some(summary) = card.recent_summary.as_deref() {
        out.push_str("## Recent Developments\n\n");
        out.push_str(&format!("{summary}\n\n"));
    }

    if !assertions.is_empty() {
        out.push_str("## Evidence\n\n");
        for (n, a) in assertions.iter().enumerate() {
            let episode = episode_titles
                .get(&a.episode_id)
                .map(String::as_str)
                .unwrap_or("unknown episode");
            let speaker = a
                .speaker
                .as_deref()
                .map(|s| format!("{s}, "))
                .unwrap_or_default();
            out.push_str(&format!(
                "{}. **{}** ({speaker}_{episode}_): {}\n",
                n + 1,
                a.assertion_type.as_str(),
                a.statement
            ));
            if let Some(quote) = a.evidence_quote.as_deref() {
                out.push_str(&format!("   > {quote}\n"));
            }
        }
        out.push('\n');
    }

    out
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct CardExportSummary {
    pub written: usize,
    pub warnings: Vec<IngestWarning>,
}

/// Write every stored card to `dir` as `<slug>.md`. Slug collisions get the
/// entity id appended so no file is silently overwritten.
pub fn export_cards(conn: &Connection, dir: &Path) -> Result<CardExportSummary, AppError> {
    std::fs::create_dir_all(dir).map_err(|e| {
        AppError::new("EXPORT_IO_FAILED", "Failed to create card export directory")
            .with_details(format!("dir={}; err={e}", dir.display()))
    })?;

    let cards = store::list_cards(conn)?;
    let mut summary = CardExportSummary::default();
    let mut used: HashSet<String> = HashSet::new();

    for card in &cards {
        let entity = store::fetch_entity(conn, card.entity_id)?;
        let assertions = store::assertions_for_entity(conn, entity.id)?;

        let mut episode_titles: HashMap<i64, String> = HashMap::new();
        for a in &assertions {
            if !episode_titles.contains_key(&a.episode_id) {
                let episode = store::fetch_episode(conn, a.episode_id)?;
                episode_titles.insert(episode.id, episode.title);
            }
        }

        let mut name = slug(&entity.canonical_name);
        if !used.insert(name.clone()) {
            name = format!("{name}-{}", entity.id);
            used.insert(name.clone());
            summary.warnings.push(
                IngestWarning::new("EXPORT_SLUG_COLLISION", "Card slug already taken")
                    .with_details(format!("entity={}; slug={name}", entity.display_name)),
            );
        }

        let path = dir.join(format!("{name}.md"));
        let body = card_markdown(&entity, card, &assertions, &episode_titles);
        std::fs::write(&path, body).map_err(|e| {
            AppError::new("EXPORT_IO_FAILED", "Failed to write card file")
                .with_details(format!("path={}; err={e}", path.display()))
        })?;
        summary.written += 1;
    }

    Ok(summary)
}
