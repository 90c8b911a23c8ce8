use std::collections::{HashMap, HashSet};

use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tkl_core::domain::IngestWarning;
use tkl_core::error::AppError;

use crate::embeddings::Embedder;

pub const DEFAULT_EMBED_MODEL: &str = "nomic-embed-text";
pub const DEFAULT_EMBED_DIMS: usize = 768;

/// What an embedding row points at. The discriminant order is the final
/// tie-break when scores and object ids collide across kinds.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Segment,
    Chunk,
    Assertion,
    Card,
}

impl ObjectKind {
    pub const ALL: [ObjectKind; 4] = [
        ObjectKind::Segment,
        ObjectKind::Chunk,
        ObjectKind::Assertion,
        ObjectKind::Card,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Segment => "segment",
            ObjectKind::Chunk => "chunk",
            ObjectKind::Assertion => "assertion",
            ObjectKind::Card => "card",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "segment" => Some(ObjectKind::Segment),
            "chunk" => Some(ObjectKind::Chunk),
            "assertion" => Some(ObjectKind::Assertion),
            "card" => Some(ObjectKind::Card),
            _ => None,
        }
    }

    fn table(&self) -> &'static str {
        match self {
            ObjectKind::Segment => "segments",
            ObjectKind::Chunk => "chunks",
            ObjectKind::Assertion => "assertions",
            ObjectKind::Card => "tech_cards",
        }
    }
}

/// Model name and dimension count that key every embedding row. Vectors from
/// different models or sizes never mix.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EmbeddingConfig {
    pub model: String,
    pub dims: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        EmbeddingConfig {
            model: DEFAULT_EMBED_MODEL.to_string(),
            dims: DEFAULT_EMBED_DIMS,
        }
    }
}

impl EmbeddingConfig {
    /// `TKL_EMBED_MODEL` / `TKL_EMBED_DIMS`, falling back to the defaults.
    pub fn from_env() -> Self {
        let model = std::env::var("TKL_EMBED_MODEL")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| DEFAULT_EMBED_MODEL.to_string());
        let dims = std::env::var("TKL_EMBED_DIMS")
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|d| *d > 0)
            .unwrap_or(DEFAULT_EMBED_DIMS);
        EmbeddingConfig { model, dims }
    }
}

/// Little-endian f32 blob, 4 bytes per component.
pub fn encode_vector(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(values.len() * 4);
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

pub fn decode_vector(bytes: &[u8], dims: usize) -> Result<Vec<f32>, AppError> {
    if bytes.len() != dims * 4 {
        return Err(
            AppError::new("INDEX_VECTOR_CORRUPT", "Stored vector has the wrong length")
                .with_details(format!("bytes={}; dims={dims}", bytes.len())),
        );
    }
    let mut out = Vec::with_capacity(dims);
    for chunk in bytes.chunks_exact(4) {
        let v = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        if !v.is_finite() {
            return Err(AppError::new(
                "INDEX_VECTOR_CORRUPT",
                "Stored vector contains a non-finite value",
            ));
        }
        out.push(v);
    }
    Ok(out)
}

/// None on length mismatch, zero vectors and non-finite results.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.is_empty() || a.len() != b.len() {
        return None;
    }
    let mut dot = 0f32;
    let mut norm_a = 0f32;
    let mut norm_b = 0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a <= 0.0 || norm_b <= 0.0 {
        return None;
    }
    let sim = dot / (norm_a.sqrt() * norm_b.sqrt());
    sim.is_finite().then_some(sim)
}

fn object_exists(conn: &Connection, kind: ObjectKind, object_id: i64) -> Result<bool, AppError> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ?1", kind.table());
    let found: Option<i64> = conn
        .query_row(&sql, [object_id], |row| row.get(0))
        .optional()
        .map_err(|e| {
            AppError::new("DB_QUERY_FAILED", "Failed to check embedding target")
                .with_details(e.to_string())
        })?;
    Ok(found.is_some())
}

fn find_embedding_id(
    conn: &Connection,
    kind: ObjectKind,
    object_id: i64,
    cfg: &EmbeddingConfig,
) -> Result<Option<i64>, AppError> {
    conn.query_row(
        "SELECT id FROM embeddings \
         WHERE object_type = ?1 AND object_id = ?2 AND model = ?3 AND dims = ?4",
        rusqlite::params![kind.as_str(), object_id, cfg.model, cfg.dims as i64],
        |row| row.get(0),
    )
    .optional()
    .map_err(|e| {
        AppError::new("DB_QUERY_FAILED", "Failed to query embedding")
            .with_details(e.to_string())
    })
}

/// Store one vector under its typed key, replacing any previous vector for
/// the same (kind, object, model, dims). Returns (row id, created).
pub fn upsert_embedding(
    conn: &Connection,
    kind: ObjectKind,
    object_id: i64,
    cfg: &EmbeddingConfig,
    vector: &[f32],
) -> Result<(i64, bool), AppError> {
    if vector.len() != cfg.dims {
        return Err(AppError::new(
            "INDEX_DIMS_MISMATCH",
            "Vector length does not match the configured dimension count",
        )
        .with_details(format!("got={}; dims={}", vector.len(), cfg.dims)));
    }
    if vector.iter().any(|v| !v.is_finite()) {
        return Err(AppError::new(
            "INDEX_VECTOR_INVALID",
            "Vector contains a non-finite value",
        ));
    }
    if !object_exists(conn, kind, object_id)? {
        return Err(AppError::new("DB_NOT_FOUND", "Embedding target does not exist")
            .with_details(format!("kind={}; object_id={object_id}", kind.as_str())));
    }

    let blob = encode_vector(vector);
    if let Some(id) = find_embedding_id(conn, kind, object_id, cfg)? {
        conn.execute(
            "UPDATE embeddings SET vector = ?2 WHERE id = ?1",
            rusqlite::params![id, blob],
        )
        .map_err(|e| {
            AppError::new("DB_UPDATE_FAILED", "Failed to update embedding")
                .with_details(e.to_string())
        })?;
        return Ok((id, false));
    }

    let res = conn.execute(
        r#"
      INSERT INTO embeddings(object_type, object_id, model, dims, vector, created_at)
      VALUES (?1, ?2, ?3, ?4, ?5, strftime('%Y-%m-%dT%H:%M:%fZ','now'))
      "#,
        rusqlite::params![kind.as_str(), object_id, cfg.model, cfg.dims as i64, blob],
    );

    match res {
        Ok(_) => Ok((conn.last_insert_rowid(), true)),
        Err(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            // Lost a race on the typed key; replace the winner's vector.
            match find_embedding_id(conn, kind, object_id, cfg)? {
                Some(id) => {
                    conn.execute(
                        "UPDATE embeddings SET vector = ?2 WHERE id = ?1",
                        rusqlite::params![id, blob],
                    )
                    .map_err(|e| {
                        AppError::new("DB_UPDATE_FAILED", "Failed to update embedding")
                            .with_details(e.to_string())
                    })?;
                    Ok((id, false))
                }
                None => Err(AppError::new(
                    "DB_INSERT_FAILED",
                    "Embedding insert conflicted",
                )
                .with_details(e.to_string())),
            }
        }
        Err(e) => Err(
            AppError::new("DB_INSERT_FAILED", "Failed to insert embedding")
                .with_details(e.to_string()),
        ),
    }
}

pub fn fetch_embedding(
    conn: &Connection,
    kind: ObjectKind,
    object_id: i64,
    cfg: &EmbeddingConfig,
) -> Result<Option<Vec<f32>>, AppError> {
    let blob: Option<Vec<u8>> = conn
        .query_row(
            "SELECT vector FROM embeddings \
             WHERE object_type = ?1 AND object_id = ?2 AND model = ?3 AND dims = ?4",
            rusqlite::params![kind.as_str(), object_id, cfg.model, cfg.dims as i64],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| {
            AppError::new("DB_QUERY_FAILED", "Failed to query embedding")
                .with_details(e.to_string())
        })?;
    match blob {
        Some(blob) => Ok(Some(decode_vector(&blob, cfg.dims)?)),
        None => Ok(None),
    }
}

/// Restrict a scan to one episode and/or a subset of kinds. An empty kind
/// list means every kind.
#[derive(Debug, Clone, Default)]
pub struct IndexScope {
    pub episode_id: Option<i64>,
    pub kinds: Vec<ObjectKind>,
}

impl IndexScope {
    fn allows_kind(&self, kind: ObjectKind) -> bool {
        self.kinds.is_empty() || self.kinds.contains(&kind)
    }
}

fn id_set(conn: &Connection, sql: &str, episode_id: i64) -> Result<HashSet<i64>, AppError> {
    let mut stmt = conn.prepare(sql).map_err(|e| {
        AppError::new("DB_QUERY_FAILED", "Failed to prepare scope query")
            .with_details(e.to_string())
    })?;
    let rows = stmt
        .query_map([episode_id], |row| row.get::<_, i64>(0))
        .map_err(|e| {
            AppError::new("DB_QUERY_FAILED", "Failed to query scope ids")
                .with_details(e.to_string())
        })?;
    let mut out = HashSet::new();
    for row in rows {
        out.insert(row.map_err(|e| {
            AppError::new("DB_QUERY_FAILED", "Failed to decode scope id")
                .with_details(e.to_string())
        })?);
    }
    Ok(out)
}

/// Ids admitted per kind under an episode scope. Cards join through entities
/// that hold at least one assertion in the episode.
fn scope_sets(
    conn: &Connection,
    episode_id: i64,
) -> Result<HashMap<ObjectKind, HashSet<i64>>, AppError> {
    let mut out = HashMap::new();
    out.insert(
        ObjectKind::Segment,
        id_set(conn, "SELECT id FROM segments WHERE episode_id = ?1", episode_id)?,
    );
    out.insert(
        ObjectKind::Chunk,
        id_set(conn, "SELECT id FROM chunks WHERE episode_id = ?1", episode_id)?,
    );
    out.insert(
        ObjectKind::Assertion,
        id_set(
            conn,
            "SELECT id FROM assertions WHERE episode_id = ?1",
            episode_id,
        )?,
    );
    out.insert(
        ObjectKind::Card,
        id_set(
            conn,
            "SELECT id FROM tech_cards WHERE entity_id IN \
             (SELECT DISTINCT entity_id FROM assertions WHERE episode_id = ?1)",
            episode_id,
        )?,
    );
    Ok(out)
}

/// Exhaustive scan under one (model, dims) key: cosine against every stored
/// vector in scope, sorted by similarity with id then kind as tie-breaks.
/// A vector that fails to decode is an error, not a skip.
pub fn nearest(
    conn: &Connection,
    cfg: &EmbeddingConfig,
    scope: &IndexScope,
    query: &[f32],
    limit: usize,
) -> Result<Vec<(ObjectKind, i64, f32)>, AppError> {
    if query.len() != cfg.dims {
        return Err(AppError::new(
            "INDEX_DIMS_MISMATCH",
            "Query vector length does not match the configured dimension count",
        )
        .with_details(format!("got={}; dims={}", query.len(), cfg.dims)));
    }

    let allowed = match scope.episode_id {
        Some(id) => Some(scope_sets(conn, id)?),
        None => None,
    };

    let mut stmt = conn
        .prepare(
            "SELECT object_type, object_id, vector FROM embeddings \
             WHERE model = ?1 AND dims = ?2 \
             ORDER BY object_type ASC, object_id ASC",
        )
        .map_err(|e| {
            AppError::new("DB_QUERY_FAILED", "Failed to prepare index scan")
                .with_details(e.to_string())
        })?;
    let rows = stmt
        .query_map(
            rusqlite::params![cfg.model, cfg.dims as i64],
            |row| -> rusqlite::Result<(String, i64, Vec<u8>)> {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            },
        )
        .map_err(|e| {
            AppError::new("DB_QUERY_FAILED", "Failed to scan embeddings")
                .with_details(e.to_string())
        })?;

    let mut hits: Vec<(ObjectKind, i64, f32)> = Vec::new();
    for row in rows {
        let (kind_raw, object_id, blob) = row.map_err(|e| {
            AppError::new("DB_QUERY_FAILED", "Failed to decode embedding row")
                .with_details(e.to_string())
        })?;
        let kind = match ObjectKind::parse(&kind_raw) {
            Some(kind) => kind,
            None => continue,
        };
        if !scope.allows_kind(kind) {
            continue;
        }
        if let Some(allowed) = &allowed {
            match allowed.get(&kind) {
                Some(set) if set.contains(&object_id) => {}
                _ => continue,
            }
        }
        let vector = decode_vector(&blob, cfg.dims)?;
        if let Some(sim) = cosine_similarity(query, &vector) {
            hits.push((kind, object_id, sim));
        }
    }

    hits.sort_by(|a, b| {
        b.2.partial_cmp(&a.2)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.1.cmp(&b.1))
            .then(a.0.cmp(&b.0))
    });
    hits.truncate(limit);
    Ok(hits)
}

/// True when at least one vector under this (model, dims) key is visible in
/// the scope. Retrieval uses this to pick lexical fallback.
pub fn scope_has_embeddings(
    conn: &Connection,
    cfg: &EmbeddingConfig,
    scope: &IndexScope,
) -> Result<bool, AppError> {
    let allowed = match scope.episode_id {
        Some(id) => Some(scope_sets(conn, id)?),
        None => None,
    };

    let mut stmt = conn
        .prepare(
            "SELECT object_type, object_id FROM embeddings WHERE model = ?1 AND dims = ?2",
        )
        .map_err(|e| {
            AppError::new("DB_QUERY_FAILED", "Failed to prepare index probe")
                .with_details(e.to_string())
        })?;
    let rows = stmt
        .query_map(
            rusqlite::params![cfg.model, cfg.dims as i64],
            |row| -> rusqlite::Result<(String, i64)> { Ok((row.get(0)?, row.get(1)?)) },
        )
        .map_err(|e| {
            AppError::new("DB_QUERY_FAILED", "Failed to probe embeddings")
                .with_details(e.to_string())
        })?;

    for row in rows {
        let (kind_raw, object_id) = row.map_err(|e| {
            AppError::new("DB_QUERY_FAILED", "Failed to decode embedding row")
                .with_details(e.to_string())
        })?;
        let kind = match ObjectKind::parse(&kind_raw) {
            Some(kind) => kind,
            None => continue,
        };
        if !scope.allows_kind(kind) {
            continue;
        }
        if let Some(allowed) = &allowed {
            match allowed.get(&kind) {
                Some(set) if set.contains(&object_id) => {}
                _ => continue,
            }
        }
        return Ok(true);
    }
    Ok(false)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EmbedBuildSummary {
    pub embedded: usize,
    pub skipped_existing: usize,
    pub failed: usize,
    pub warnings: Vec<IngestWarning>,
}

fn collect_pairs(
    stmt: &mut rusqlite::Statement<'_>,
    params: impl rusqlite::Params,
) -> Result<Vec<(i64, String)>, AppError> {
    let rows = stmt
        .query_map(params, |row| -> rusqlite::Result<(i64, String)> {
            Ok((row.get(0)?, row.get(1)?))
        })
        .map_err(|e| {
            AppError::new("DB_QUERY_FAILED", "Failed to query embedding targets")
                .with_details(e.to_string())
        })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row.map_err(|e| {
            AppError::new("DB_QUERY_FAILED", "Failed to decode embedding target")
                .with_details(e.to_string())
        })?);
    }
    Ok(out)
}

fn not_embedded_clause(kind: ObjectKind) -> String {
    format!(
        "NOT EXISTS (SELECT 1 FROM embeddings e WHERE e.object_type = '{}' \
         AND e.object_id = t.id AND e.model = ?2 AND e.dims = ?3)",
        kind.as_str()
    )
}

/// Retrieval text for a card: definition, key points and recent summary as
/// plain lines.
fn card_embed_text(definition: &str, key_points_raw: &str, recent: &str) -> String {
    let mut parts: Vec<String> = Vec::new();
    if !definition.trim().is_empty() {
        parts.push(definition.trim().to_string());
    }
    let points: Vec<String> = serde_json::from_str(key_points_raw).unwrap_or_default();
    for point in points {
        let point = point.trim().to_string();
        if !point.is_empty() {
            parts.push(point);
        }
    }
    if !recent.trim().is_empty() {
        parts.push(recent.trim().to_string());
    }
    parts.join("\n")
}

fn missing_card_texts(
    conn: &Connection,
    cfg: &EmbeddingConfig,
    episode_id: Option<i64>,
) -> Result<Vec<(i64, String)>, AppError> {
    let sql = format!(
        "SELECT t.id, COALESCE(t.definition, ''), t.key_points, COALESCE(t.recent_summary, '') \
         FROM tech_cards t \
         WHERE (?1 IS NULL OR t.entity_id IN \
                (SELECT DISTINCT entity_id FROM assertions WHERE episode_id = ?1)) \
           AND {} ORDER BY t.id ASC",
        not_embedded_clause(ObjectKind::Card)
    );
    let mut stmt = conn.prepare(&sql).map_err(|e| {
        AppError::new("DB_QUERY_FAILED", "Failed to prepare embedding targets")
            .with_details(e.to_string())
    })?;
    let rows = stmt
        .query_map(
            rusqlite::params![episode_id, cfg.model, cfg.dims as i64],
            |row| -> rusqlite::Result<(i64, String, String, String)> {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            },
        )
        .map_err(|e| {
            AppError::new("DB_QUERY_FAILED", "Failed to query embedding targets")
                .with_details(e.to_string())
        })?;
    let mut out = Vec::new();
    for row in rows {
        let (id, definition, key_points, recent) = row.map_err(|e| {
            AppError::new("DB_QUERY_FAILED", "Failed to decode embedding target")
                .with_details(e.to_string())
        })?;
        out.push((id, card_embed_text(&definition, &key_points, &recent)));
    }
    Ok(out)
}

fn missing_texts(
    conn: &Connection,
    kind: ObjectKind,
    cfg: &EmbeddingConfig,
    episode_id: Option<i64>,
) -> Result<Vec<(i64, String)>, AppError> {
    if kind == ObjectKind::Card {
        return missing_card_texts(conn, cfg, episode_id);
    }

    let column = match kind {
        ObjectKind::Assertion => "statement",
        _ => "text",
    };
    let sql = format!(
        "SELECT t.id, t.{column} FROM {} t \
         WHERE (?1 IS NULL OR t.episode_id = ?1) AND {} ORDER BY t.id ASC",
        kind.table(),
        not_embedded_clause(kind)
    );
    let mut stmt = conn.prepare(&sql).map_err(|e| {
        AppError::new("DB_QUERY_FAILED", "Failed to prepare embedding targets")
            .with_details(e.to_string())
    })?;
    collect_pairs(
        &mut stmt,
        rusqlite::params![episode_id, cfg.model, cfg.dims as i64],
    )
}

fn total_objects(
    conn: &Connection,
    kind: ObjectKind,
    episode_id: Option<i64>,
) -> Result<usize, AppError> {
    let sql = match kind {
        ObjectKind::Card => "SELECT COUNT(*) FROM tech_cards t \
             WHERE (?1 IS NULL OR t.entity_id IN \
                    (SELECT DISTINCT entity_id FROM assertions WHERE episode_id = ?1))"
            .to_string(),
        _ => format!(
            "SELECT COUNT(*) FROM {} t WHERE (?1 IS NULL OR t.episode_id = ?1)",
            kind.table()
        ),
    };
    let n: i64 = conn
        .query_row(&sql, rusqlite::params![episode_id], |row| row.get(0))
        .map_err(|e| {
            AppError::new("DB_QUERY_FAILED", "Failed to count embedding targets")
                .with_details(e.to_string())
        })?;
    Ok(n as usize)
}

/// Embed every object that has no vector under the configured (model, dims)
/// key, optionally restricted to one episode. Already-indexed objects are
/// left alone. A transport-level embedder failure aborts the run; a
/// per-object failure is recorded and the run continues.
pub fn build_embeddings(
    conn: &Connection,
    embedder: &dyn Embedder,
    cfg: &EmbeddingConfig,
    episode_id: Option<i64>,
) -> Result<EmbedBuildSummary, AppError> {
    let mut summary = EmbedBuildSummary::default();

    for kind in ObjectKind::ALL {
        let total = total_objects(conn, kind, episode_id)?;
        let missing = missing_texts(conn, kind, cfg, episode_id)?;
        summary.skipped_existing += total - missing.len();

        for (object_id, text) in missing {
            if text.trim().is_empty() {
                summary.warnings.push(
                    IngestWarning::new("INDEX_EMPTY_TEXT", "Skipped object with no text to embed")
                        .with_details(format!(
                            "kind={}; object_id={object_id}",
                            kind.as_str()
                        )),
                );
                continue;
            }

            let vector = match embedder.embed(&cfg.model, &text) {
                Ok(vector) => vector,
                Err(e) if e.retryable => return Err(e),
                Err(e) => {
                    log::warn!(
                        "embedding {} {object_id} failed: {} {}",
                        kind.as_str(),
                        e.code,
                        e.message
                    );
                    summary.failed += 1;
                    summary.warnings.push(
                        IngestWarning::new("INDEX_EMBED_FAILED", "Failed to embed object")
                            .with_details(format!(
                                "kind={}; object_id={object_id}; err={}",
                                kind.as_str(),
                                e.code
                            )),
                    );
                    continue;
                }
            };

            if vector.len() != cfg.dims {
                summary.failed += 1;
                summary.warnings.push(
                    IngestWarning::new(
                        "INDEX_DIMS_MISMATCH",
                        "Embedder returned a vector of the wrong size",
                    )
                    .with_details(format!(
                        "kind={}; object_id={object_id}; got={}; dims={}",
                        kind.as_str(),
                        vector.len(),
                        cfg.dims
                    )),
                );
                continue;
            }

            upsert_embedding(conn, kind, object_id, cfg, &vector)?;
            summary.embedded += 1;
        }
    }

    log::info!(
        "embedding build: {} embedded, {} existing, {} failed",
        summary.embedded,
        summary.skipped_existing,
        summary.failed
    );
    Ok(summary)
}
