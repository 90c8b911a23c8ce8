use tkl_ai::embeddings::Embedder;
use tkl_ai::index::{build_embeddings, EmbeddingConfig, ObjectKind};
use tkl_ai::retrieve::{search, RetrieveConfig};
use tkl_core::chunking::{build_chunks, ChunkingConfig};
use tkl_core::db;
use tkl_core::domain::{AssertionDraft, AssertionType, EntityDraft, EntityType, VerificationStatus};
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

fn cfg(k: usize) -> RetrieveConfig {
    RetrieveConfig {
        k,
        overfetch: 4,
        min_similarity: 0.25,
        recency_weight: 0.05,
        verified_bonus: 0.10,
        embedding: EmbeddingConfig {
            model: "stub-embed".to_string(),
            dims: 2,
        },
    }
}

fn ingest(
    conn: &rusqlite::Connection,
    source_id: &str,
    title: &str,
    published: Option<&str>,
    text: &str,
) -> (i64, Vec<i64>) {
    let meta = TranscriptMeta {
        source_id: source_id.to_string(),
        title: title.to_string(),
        show: None,
        published_at: published.map(str::to_string),
        url: None,
    };
    let summary = ingest_transcript_text(conn, &meta, text).expect("ingest");
    (summary.episode_id, summary.segment_ids)
}

/// Fixture episode with one entity, one quoted assertion and one chunk.
fn seed_indexed(conn: &rusqlite::Connection, embed: bool) -> (i64, Vec<i64>, i64) {
    let text = include_str!(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/../../fixtures/demo/transcript_sample.txt"
    ));
    let (episode_id, segs) = ingest(conn, "ep-1", "Widget Cache Deep Dive", None, text);

    let entity_id = store::upsert_entity(
        conn,
        episode_id,
        &EntityDraft {
            name: "widget-cache".to_string(),
            entity_type: EntityType::Product,
            aliases: vec![],
        },
    )
    .expect("entity")
    .entity_id;
    let assertion_id = store::insert_assertion(
        conn,
        episode_id,
        entity_id,
        &AssertionDraft {
            entity_name: "widget-cache".to_string(),
            assertion_type: AssertionType::Fact,
            statement: "widget-cache cuts median lookup latency roughly in half.".to_string(),
            speaker: Some("Bob".to_string()),
            confidence: 0.8,
            verification_priority: 0.5,
            segment_ids: vec![segs[1]],
            evidence_quote: Some("cuts median lookup latency roughly in half".to_string()),
        },
    )
    .expect("assertion")
    .assertion_id;
    build_chunks(conn, episode_id, &ChunkingConfig::default()).expect("chunks");

    if embed {
        build_embeddings(conn, &CountAb, &cfg(1).embedding, None).expect("embed");
    }
    (episode_id, segs, assertion_id)
}

#[test]
fn search_returns_cited_hits_in_score_order() {
    let mut conn = db::open_in_memory().expect("open");
    db::migrate(&mut conn).expect("migrate");
    let (_, segs, _) = seed_indexed(&conn, true);

    let response = search(
        &conn,
        &CountAb,
        &cfg(10),
        "what is widget-cache latency",
        None,
    )
    .expect("search");
    assert!(!response.fallback_lexical);

    // 3 segments + 1 chunk + 1 assertion, every one citeable.
    assert_eq!(response.hits.len(), 5);
    for pair in response.hits.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
    for hit in &response.hits {
        assert_eq!(hit.citation.episode_title, "Widget Cache Deep Dive");
        assert!(!hit.snippet.is_empty());
        assert!(!hit.citation.quote.is_empty());
    }

    // Chunks cite their first segment.
    let chunk = response
        .hits
        .iter()
        .find(|h| h.kind == ObjectKind::Chunk)
        .expect("chunk hit");
    assert_eq!(chunk.citation.segment_id, segs[0]);
    assert_eq!(chunk.citation.timestamp.as_deref(), Some("00:00:05"));
    assert_eq!(chunk.citation.speaker.as_deref(), Some("Alice"));

    // Assertions carry their stored evidence quote.
    let assertion = response
        .hits
        .iter()
        .find(|h| h.kind == ObjectKind::Assertion)
        .expect("assertion hit");
    assert_eq!(assertion.citation.segment_id, segs[1]);
    assert_eq!(
        assertion.citation.quote,
        "cuts median lookup latency roughly in half"
    );
}

#[test]
fn search_rejects_blank_queries() {
    let mut conn = db::open_in_memory().expect("open");
    db::migrate(&mut conn).expect("migrate");
    seed_indexed(&conn, true);

    let err = search(&conn, &CountAb, &cfg(5), "", None).expect_err("empty");
    assert_eq!(err.code, "RETRIEVE_QUERY_EMPTY");
    let err = search(&conn, &CountAb, &cfg(5), "   ", None).expect_err("blank");
    assert_eq!(err.code, "RETRIEVE_QUERY_EMPTY");
}

#[test]
fn search_scopes_to_one_episode() {
    let mut conn = db::open_in_memory().expect("open");
    db::migrate(&mut conn).expect("migrate");
    let (ep1, _, _) = seed_indexed(&conn, false);
    let (ep2, _) = ingest(
        &conn,
        "ep-2",
        "Memo Store Rewrite",
        None,
        "Carol (00:00:10): The memo-store rewrite trades memory for latency.\n\
         Dan (00:00:40): Batch reads gain the most from the new arena allocator.",
    );
    build_embeddings(&conn, &CountAb, &cfg(1).embedding, None).expect("embed");

    let scoped = search(&conn, &CountAb, &cfg(10), "latency tradeoffs", Some(ep2))
        .expect("search");
    assert!(!scoped.hits.is_empty());
    for hit in &scoped.hits {
        assert_eq!(hit.citation.episode_id, ep2);
        assert_ne!(hit.citation.episode_id, ep1);
    }
}

#[test]
fn search_falls_back_to_lexical_without_vectors() {
    let mut conn = db::open_in_memory().expect("open");
    db::migrate(&mut conn).expect("migrate");
    seed_indexed(&conn, false);

    let response = search(&conn, &CountAb, &cfg(10), "widget-cache latency", None)
        .expect("search");
    assert!(response.fallback_lexical);
    assert!(!response.hits.is_empty());
    for hit in &response.hits {
        assert!(matches!(hit.kind, ObjectKind::Chunk | ObjectKind::Assertion));
        assert!(hit.similarity > 0.0);
    }
}

#[test]
fn broken_embedders_fall_back_to_lexical() {
    let mut conn = db::open_in_memory().expect("open");
    db::migrate(&mut conn).expect("migrate");
    seed_indexed(&conn, true);

    let response = search(
        &conn,
        &FailingEmbedder,
        &cfg(10),
        "widget-cache latency",
        None,
    )
    .expect("search");
    assert!(response.fallback_lexical);
    assert!(!response.hits.is_empty());
}

#[test]
fn verification_status_shifts_the_ranking() {
    let mut conn = db::open_in_memory().expect("open");
    db::migrate(&mut conn).expect("migrate");
    let text = include_str!(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/../../fixtures/demo/transcript_sample.txt"
    ));
    let (episode_id, segs) = ingest(&conn, "ep-1", "Widget Cache Deep Dive", None, text);
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

    // Two claims with identical stub vectors, so only the status differs.
    let mut ids = Vec::new();
    for statement in ["Claim one holds.", "Claim two holds."] {
        let outcome = store::insert_assertion(
            &conn,
            episode_id,
            entity_id,
            &AssertionDraft {
                entity_name: "widget-cache".to_string(),
                assertion_type: AssertionType::Fact,
                statement: statement.to_string(),
                speaker: Some("Bob".to_string()),
                confidence: 0.8,
                verification_priority: 0.1,
                segment_ids: vec![segs[0]],
                evidence_quote: None,
            },
        )
        .expect("assertion");
        ids.push(outcome.assertion_id);
    }
    build_embeddings(&conn, &CountAb, &cfg(1).embedding, None).expect("embed");

    store::set_verification_status(&conn, ids[0], VerificationStatus::Disputed).expect("dispute");
    store::set_verification_status(&conn, ids[1], VerificationStatus::Verified).expect("verify");

    let response = search(&conn, &CountAb, &cfg(20), "claim", None).expect("search");
    let assertion_order: Vec<i64> = response
        .hits
        .iter()
        .filter(|h| h.kind == ObjectKind::Assertion)
        .map(|h| h.object_id)
        .collect();
    // Id order alone would list the disputed claim first.
    assert_eq!(assertion_order, vec![ids[1], ids[0]]);
}

#[test]
fn recency_prefers_newer_episodes() {
    let mut conn = db::open_in_memory().expect("open");
    db::migrate(&mut conn).expect("migrate");

    // Identical stub vectors in both episodes; only publication dates differ.
    let (ep_old, _) = ingest(
        &conn,
        "ep-old",
        "Cache History",
        Some("2024-01-01T00:00:00Z"),
        "Alice (00:00:05): The cache holds.",
    );
    let (ep_new, _) = ingest(
        &conn,
        "ep-new",
        "Cache Present",
        Some("2026-01-01T00:00:00Z"),
        "Alice (00:00:05): The cache molds.",
    );
    build_embeddings(&conn, &CountAb, &cfg(1).embedding, None).expect("embed");

    let response = search(&conn, &CountAb, &cfg(10), "cache", None).expect("search");
    assert_eq!(response.hits.len(), 2);
    // Id order alone would list the older episode first.
    assert_eq!(response.hits[0].citation.episode_id, ep_new);
    assert_eq!(response.hits[1].citation.episode_id, ep_old);
    assert!(response.hits[0].score > response.hits[1].score);
}
