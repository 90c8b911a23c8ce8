use tkl_ai::embeddings::Embedder;
use tkl_ai::index::{
    build_embeddings, fetch_embedding, nearest, scope_has_embeddings, upsert_embedding,
    EmbeddingConfig, IndexScope, ObjectKind,
};
use tkl_core::cards::CardContent;
use tkl_core::chunking::{build_chunks, ChunkingConfig};
use tkl_core::db;
use tkl_core::domain::{AssertionDraft, AssertionType, EntityDraft, EntityType};
use tkl_core::error::AppError;
use tkl_core::ingest::{ingest_transcript_text, TranscriptMeta};
use tkl_core::store;

/// Deterministic two-dimensional embedder: component 0 counts 'a', component
/// 1 counts 'b'.
struct CountAb;

impl Embedder for CountAb {
    fn embed(&self, _model: &str, input: &str) -> Result<Vec<f32>, AppError> {
        let a = input.matches('a').count() as f32;
        let b = input.matches('b').count() as f32;
        Ok(vec![a, b])
    }
}

struct FailingEmbedder;

impl Embedder for FailingEmbedder {
    fn embed(&self, _model: &str, _input: &str) -> Result<Vec<f32>, AppError> {
        Err(AppError::new("OLLAMA_HTTP", "embedder offline"))
    }
}

struct FlakyEmbedder;

impl Embedder for FlakyEmbedder {
    fn embed(&self, _model: &str, _input: &str) -> Result<Vec<f32>, AppError> {
        Err(AppError::new("OLLAMA_HTTP", "request timed out").with_retryable(true))
    }
}

struct WrongSizeEmbedder;

impl Embedder for WrongSizeEmbedder {
    fn embed(&self, _model: &str, _input: &str) -> Result<Vec<f32>, AppError> {
        Ok(vec![1.0])
    }
}

fn stub_cfg() -> EmbeddingConfig {
    EmbeddingConfig {
        model: "stub-embed".to_string(),
        dims: 2,
    }
}

fn seed(conn: &rusqlite::Connection) -> (i64, Vec<i64>) {
    let text = include_str!(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/../../fixtures/demo/transcript_sample.txt"
    ));
    let meta = TranscriptMeta {
        source_id: "ep-1".to_string(),
        title: "Widget Cache Deep Dive".to_string(),
        show: None,
        published_at: None,
        url: None,
    };
    let summary = ingest_transcript_text(conn, &meta, text).expect("ingest");
    (summary.episode_id, summary.segment_ids)
}

fn count_embeddings(conn: &rusqlite::Connection) -> i64 {
    conn.query_row("SELECT COUNT(*) FROM embeddings", [], |row| row.get(0))
        .unwrap()
}

#[test]
fn build_embeddings_indexes_each_object_once() {
    let mut conn = db::open_in_memory().expect("open");
    db::migrate(&mut conn).expect("migrate");
    let (episode_id, segs) = seed(&conn);

    let entity_id = store::upsert_entity(
        &conn,
        episode_id,
        &EntityDraft {
            name: "widget-cache".to_string(),
            entity_type: EntityType::Product,
            aliases: vec![],
        },
    )
    .expect("entity")
    .entity_id;
    store::insert_assertion(
        &conn,
        episode_id,
        entity_id,
        &AssertionDraft {
            entity_name: "widget-cache".to_string(),
            assertion_type: AssertionType::Fact,
            statement: "Cuts median lookup latency roughly in half.".to_string(),
            speaker: Some("Bob".to_string()),
            confidence: 0.8,
            verification_priority: 0.5,
            segment_ids: vec![segs[1]],
            evidence_quote: None,
        },
    )
    .expect("assertion");
    store::upsert_card(
        &conn,
        entity_id,
        &CardContent {
            definition: Some("An in-process cache layer.".to_string()),
            key_points: vec!["Halves lookup latency.".to_string()],
            comparisons: vec![],
            recent_summary: None,
        },
    )
    .expect("card");
    let chunks = build_chunks(&conn, episode_id, &ChunkingConfig::default()).expect("chunks");
    assert_eq!(chunks.inserted, 1);

    // 3 segments + 1 chunk + 1 assertion + 1 card.
    let cfg = stub_cfg();
    let summary = build_embeddings(&conn, &CountAb, &cfg, None).expect("build");
    assert_eq!(summary.embedded, 6);
    assert_eq!(summary.skipped_existing, 0);
    assert_eq!(summary.failed, 0);
    assert!(summary.warnings.is_empty());
    assert_eq!(count_embeddings(&conn), 6);

    let vector = fetch_embedding(&conn, ObjectKind::Segment, segs[0], &cfg).expect("fetch");
    assert!(vector.is_some());

    let again = build_embeddings(&conn, &CountAb, &cfg, None).expect("rebuild");
    assert_eq!(again.embedded, 0);
    assert_eq!(again.skipped_existing, 6);
    assert_eq!(count_embeddings(&conn), 6);
}

#[test]
fn separate_model_keys_coexist() {
    let mut conn = db::open_in_memory().expect("open");
    db::migrate(&mut conn).expect("migrate");
    seed(&conn);

    let cfg_a = stub_cfg();
    let cfg_b = EmbeddingConfig {
        model: "stub-embed-alt".to_string(),
        dims: 2,
    };
    build_embeddings(&conn, &CountAb, &cfg_a, None).expect("build a");
    let b = build_embeddings(&conn, &CountAb, &cfg_b, None).expect("build b");
    assert_eq!(b.embedded, 3);
    assert_eq!(count_embeddings(&conn), 6);

    let scope = IndexScope::default();
    assert!(scope_has_embeddings(&conn, &cfg_a, &scope).expect("probe a"));
    assert!(scope_has_embeddings(&conn, &cfg_b, &scope).expect("probe b"));

    // A scan under one key never sees the other key's vectors.
    let hits = nearest(&conn, &cfg_a, &scope, &[1.0, 1.0], 100).expect("scan");
    assert_eq!(hits.len(), 3);
}

#[test]
fn upsert_embedding_overwrites_and_validates() {
    let mut conn = db::open_in_memory().expect("open");
    db::migrate(&mut conn).expect("migrate");
    let (_, segs) = seed(&conn);
    let cfg = stub_cfg();

    let (id, created) =
        upsert_embedding(&conn, ObjectKind::Segment, segs[0], &cfg, &[1.0, 0.0]).expect("insert");
    assert!(created);

    let (id_again, created_again) =
        upsert_embedding(&conn, ObjectKind::Segment, segs[0], &cfg, &[0.0, 2.0]).expect("replace");
    assert_eq!(id_again, id);
    assert!(!created_again);
    let stored = fetch_embedding(&conn, ObjectKind::Segment, segs[0], &cfg).expect("fetch");
    assert_eq!(stored, Some(vec![0.0, 2.0]));

    let err = upsert_embedding(&conn, ObjectKind::Segment, segs[0], &cfg, &[1.0])
        .expect_err("wrong dims");
    assert_eq!(err.code, "INDEX_DIMS_MISMATCH");

    let err = upsert_embedding(&conn, ObjectKind::Segment, segs[0], &cfg, &[f32::NAN, 0.0])
        .expect_err("non-finite");
    assert_eq!(err.code, "INDEX_VECTOR_INVALID");

    let err = upsert_embedding(&conn, ObjectKind::Segment, 9999, &cfg, &[1.0, 0.0])
        .expect_err("missing target");
    assert_eq!(err.code, "DB_NOT_FOUND");
}

#[test]
fn corrupt_stored_vectors_error_out() {
    let mut conn = db::open_in_memory().expect("open");
    db::migrate(&mut conn).expect("migrate");
    let (_, segs) = seed(&conn);
    let cfg = stub_cfg();

    upsert_embedding(&conn, ObjectKind::Segment, segs[0], &cfg, &[1.0, 0.0]).expect("insert");
    conn.execute(
        "UPDATE embeddings SET vector = ?1",
        rusqlite::params![vec![1u8, 2, 3]],
    )
    .expect("corrupt");

    let err = nearest(&conn, &cfg, &IndexScope::default(), &[1.0, 0.0], 10)
        .expect_err("corrupt scan");
    assert_eq!(err.code, "INDEX_VECTOR_CORRUPT");

    let err = fetch_embedding(&conn, ObjectKind::Segment, segs[0], &cfg)
        .expect_err("corrupt fetch");
    assert_eq!(err.code, "INDEX_VECTOR_CORRUPT");
}

#[test]
fn nearest_scopes_by_episode_and_kind() {
    let mut conn = db::open_in_memory().expect("open");
    db::migrate(&mut conn).expect("migrate");
    let (ep1, segs1) = seed(&conn);

    let meta = TranscriptMeta {
        source_id: "ep-2".to_string(),
        title: "Memo Store Rewrite".to_string(),
        show: None,
        published_at: None,
        url: None,
    };
    let text2 = "Carol (00:00:10): The memo-store rewrite is out.\n\
                 Dan (00:00:40): It trades memory for latency across the board.";
    let ep2 = ingest_transcript_text(&conn, &meta, text2)
        .expect("ingest")
        .episode_id;

    build_chunks(&conn, ep1, &ChunkingConfig::default()).expect("chunks");
    let cfg = stub_cfg();
    build_embeddings(&conn, &CountAb, &cfg, None).expect("build");

    let scope = IndexScope {
        episode_id: Some(ep1),
        kinds: vec![ObjectKind::Segment],
    };
    let hits = nearest(&conn, &cfg, &scope, &[1.0, 1.0], 50).expect("scan");
    assert_eq!(hits.len(), segs1.len());
    for (kind, object_id, _) in &hits {
        assert_eq!(*kind, ObjectKind::Segment);
        assert!(segs1.contains(object_id));
    }

    // An empty kind list admits everything in the episode.
    let wide = IndexScope {
        episode_id: Some(ep1),
        kinds: vec![],
    };
    let wide_hits = nearest(&conn, &cfg, &wide, &[1.0, 1.0], 50).expect("scan");
    assert!(wide_hits.iter().any(|(kind, _, _)| *kind == ObjectKind::Chunk));

    // The other episode's scope excludes ep1 entirely; its first segment has
    // no 'a' or 'b' at all, so only one vector can match.
    let other = IndexScope {
        episode_id: Some(ep2),
        kinds: vec![ObjectKind::Segment],
    };
    let other_hits = nearest(&conn, &cfg, &other, &[1.0, 1.0], 50).expect("scan");
    assert_eq!(other_hits.len(), 1);
    assert!(!segs1.contains(&other_hits[0].1));
}

#[test]
fn objects_without_text_are_skipped() {
    let mut conn = db::open_in_memory().expect("open");
    db::migrate(&mut conn).expect("migrate");
    let (episode_id, _) = seed(&conn);

    let entity_id = store::upsert_entity(
        &conn,
        episode_id,
        &EntityDraft {
            name: "widget-cache".to_string(),
            entity_type: EntityType::Product,
            aliases: vec![],
        },
    )
    .expect("entity")
    .entity_id;
    store::upsert_card(&conn, entity_id, &CardContent::default()).expect("empty card");

    let summary = build_embeddings(&conn, &CountAb, &stub_cfg(), None).expect("build");
    assert_eq!(summary.embedded, 3);
    assert_eq!(summary.failed, 0);
    assert!(summary
        .warnings
        .iter()
        .any(|w| w.code == "INDEX_EMPTY_TEXT"));
}

#[test]
fn embedder_failures_record_or_abort() {
    let mut conn = db::open_in_memory().expect("open");
    db::migrate(&mut conn).expect("migrate");
    seed(&conn);
    let cfg = stub_cfg();

    // Per-object failures are recorded and the run finishes.
    let summary = build_embeddings(&conn, &FailingEmbedder, &cfg, None).expect("build");
    assert_eq!(summary.embedded, 0);
    assert_eq!(summary.failed, 3);
    assert!(summary
        .warnings
        .iter()
        .all(|w| w.code == "INDEX_EMBED_FAILED"));
    assert_eq!(count_embeddings(&conn), 0);

    // A retryable transport error aborts instead.
    let err = build_embeddings(&conn, &FlakyEmbedder, &cfg, None).expect_err("abort");
    assert_eq!(err.code, "OLLAMA_HTTP");

    // A vector of the wrong size is a per-object failure.
    let summary = build_embeddings(&conn, &WrongSizeEmbedder, &cfg, None).expect("build");
    assert_eq!(summary.failed, 3);
    assert!(summary
        .warnings
        .iter()
        .all(|w| w.code == "INDEX_DIMS_MISMATCH"));
}
