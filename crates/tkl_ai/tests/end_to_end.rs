use tkl_ai::embeddings::Embedder;
use tkl_ai::extract::run_extraction;
use tkl_ai::index::{build_embeddings, EmbeddingConfig};
use tkl_ai::llm::Llm;
use tkl_ai::retrieve::{ask, search, AskOptions, RetrieveConfig};
use tkl_core::cards;
use tkl_core::chunking::{build_chunks, ChunkingConfig};
use tkl_core::db;
use tkl_core::error::AppError;
use tkl_core::ingest::{ingest_transcript_text, TranscriptMeta};
use tkl_core::report;

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

struct StubLlm {
    extraction: String,
    card: String,
}

impl Llm for StubLlm {
    fn generate(&self, _model: &str, prompt: &str) -> Result<String, AppError> {
        if prompt.contains("living reference card") {
            Ok(self.card.clone())
        } else {
            Ok(self.extraction.clone())
        }
    }
}

const CARD_JSON: &str = r#"{"definition": "An in-process cache layer.", "key_points": ["Halves lookup latency."], "comparisons": ["memo-store"], "recent_summary": "2.0 teased on the show."}"#;

fn extraction_json(segs: &[i64]) -> String {
    format!(
        r#"```json
{{
  "topics": [
    {{"name": "Caching", "summary": "How widget-cache works", "start_segment_id": {s0}, "end_segment_id": {s1}}}
  ],
  "entities": [
    {{"name": "widget-cache", "type": "product", "aliases": ["wcache"]}},
    {{"name": "memo-store", "type": "product", "aliases": []}}
  ],
  "assertions": [
    {{"entity": "widget-cache", "type": "fact", "statement": "widget-cache cuts median lookup latency roughly in half.", "speaker": "Bob", "confidence": 0.9, "verification_priority": 0.3, "segment_ids": [{s1}], "quote": "cuts median lookup latency roughly in half"}},
    {{"entity": "widget-cache", "type": "prediction", "statement": "widget-cache 2.0 will ship a write-behind mode.", "speaker": "Alice", "confidence": 0.7, "verification_priority": 0.9, "segment_ids": [{s2}]}},
    {{"entity": "memo-store", "type": "opinion", "statement": "memo-store feels slower under contention.", "speaker": "Bob", "segment_ids": [{s1}]}}
  ],
  "cards": []
}}
```"#,
        s0 = segs[0],
        s1 = segs[1],
        s2 = segs[2],
    )
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

#[test]
fn transcript_to_answer_pipeline() {
    let mut conn = db::open_in_memory().expect("open");
    db::migrate(&mut conn).expect("migrate");

    let text = include_str!(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/../../fixtures/demo/transcript_sample.txt"
    ));
    let meta = TranscriptMeta {
        source_id: "ep-1".to_string(),
        title: "Widget Cache Deep Dive".to_string(),
        show: Some("Tech Weekly".to_string()),
        published_at: Some("2026-07-01T00:00:00Z".to_string()),
        url: None,
    };
    let ingested = ingest_transcript_text(&conn, &meta, text).expect("ingest");
    let (episode_id, segs) = (ingested.episode_id, ingested.segment_ids);
    assert_eq!(segs.len(), 3);
    assert!(ingested.warnings.is_empty());

    let llm = StubLlm {
        extraction: extraction_json(&segs),
        card: CARD_JSON.to_string(),
    };
    let extracted = run_extraction(&conn, &llm, "stub-llm", episode_id).expect("extract");
    assert_eq!(extracted.applied.topics_upserted, 1);
    assert_eq!(extracted.applied.entities_created, 2);
    assert_eq!(extracted.applied.assertions_inserted, 3);
    assert_eq!(extracted.cards_synthesized, 2);

    // The topic splits the episode into two chunk regions.
    let chunked = build_chunks(
        &conn,
        episode_id,
        &ChunkingConfig {
            max_tokens: 800,
            min_segments: 2,
            max_segments: 2,
        },
    )
    .expect("chunks");
    assert_eq!(chunked.planned, 2);
    assert_eq!(chunked.inserted, 2);

    // 3 segments + 2 chunks + 3 assertions + 2 cards.
    let indexed = build_embeddings(&conn, &CountAb, &cfg(4).embedding, None).expect("embed");
    assert_eq!(indexed.embedded, 10);
    assert_eq!(indexed.failed, 0);

    let found = search(&conn, &CountAb, &cfg(4), "widget-cache latency", None).expect("search");
    assert!(!found.fallback_lexical);
    assert!(!found.hits.is_empty());

    let answered = ask(
        &conn,
        &CountAb,
        None,
        &cfg(4),
        "what is widget-cache latency",
        &AskOptions::default(),
    )
    .expect("ask");
    assert!(!answered.insufficient_evidence);
    assert!(answered.answer.contains("[1]"));
    assert!(!answered.citations.is_empty());
    for citation in &answered.citations {
        assert_eq!(citation.episode_id, episode_id);
        assert_eq!(citation.episode_title, "Widget Cache Deep Dive");
        assert!(segs.contains(&citation.segment_id));
    }

    let noise = ask(
        &conn,
        &CountAb,
        None,
        &cfg(4),
        "zzz",
        &AskOptions::default(),
    )
    .expect("ask noise");
    assert!(noise.insufficient_evidence);

    let md = report::generate_episode_report(&conn, episode_id).expect("report");
    assert!(md.contains("# Widget Cache Deep Dive"));
    assert!(md.contains("## Verification Queue"));
    assert!(md.contains("widget-cache 2.0 will ship a write-behind mode."));

    let dir = tempfile::tempdir().expect("tempdir");
    let exported = cards::export_cards(&conn, dir.path()).expect("export");
    assert_eq!(exported.written, 2);
    assert!(dir.path().join("widget-cache.md").is_file());
    assert!(dir.path().join("memo-store.md").is_file());
}
