use tkl_core::db;
use tkl_core::ingest::{
    ingest_transcript_csv, ingest_transcript_text, preview_transcript_text, TranscriptMeta,
};

fn meta(source_id: &str, title: &str) -> TranscriptMeta {
    TranscriptMeta {
        source_id: source_id.to_string(),
        title: title.to_string(),
        show: None,
        published_at: None,
        url: None,
    }
}

#[test]
fn ingests_timestamped_transcript_and_records_participants() {
    let text = include_str!(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/../../fixtures/demo/transcript_sample.txt"
    ));

    let mut conn = db::open_in_memory().expect("open");
    db::migrate(&mut conn).expect("migrate");

    let prev = preview_transcript_text(text).expect("preview");
    assert_eq!(prev.detected_format, "speaker_timestamped");
    assert_eq!(prev.segments, 3);
    assert_eq!(prev.speakers, vec!["Alice", "Bob"]);

    let summary = ingest_transcript_text(&conn, &meta("ep-1", "Widget Cache Deep Dive"), text)
        .expect("ingest");
    assert!(summary.episode_created);
    assert_eq!(summary.detected_format, "speaker_timestamped");
    assert_eq!(summary.segments_inserted, 3);
    assert_eq!(summary.segments_reused, 0);
    assert_eq!(summary.segment_ids.len(), 3);

    let episode = tkl_core::store::fetch_episode(&conn, summary.episode_id).expect("episode");
    assert_eq!(episode.participants, vec!["Alice", "Bob"]);

    // Timed segments close at the next segment's start.
    let segments =
        tkl_core::store::segments_for_episode(&conn, summary.episode_id).expect("segments");
    assert_eq!(segments[0].start_secs, Some(5));
    assert_eq!(segments[0].end_secs, Some(70));
    assert_eq!(segments[1].end_secs, Some(150));
    assert_eq!(segments[2].end_secs, None);
}

#[test]
fn reingesting_the_same_transcript_changes_nothing() {
    let text = include_str!(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/../../fixtures/demo/transcript_sample.txt"
    ));

    let mut conn = db::open_in_memory().expect("open");
    db::migrate(&mut conn).expect("migrate");

    let first = ingest_transcript_text(&conn, &meta("ep-1", "Widget Cache Deep Dive"), text)
        .expect("first ingest");
    let second = ingest_transcript_text(&conn, &meta("ep-1", "Widget Cache Deep Dive"), text)
        .expect("second ingest");

    assert!(!second.episode_created);
    assert_eq!(second.segments_inserted, 0);
    assert_eq!(second.segments_reused, 3);
    assert_eq!(second.segment_ids, first.segment_ids);

    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM segments", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 3);
}

#[test]
fn episode_metadata_backfills_but_never_overwrites() {
    let text = "Alice (00:00:05): only line here";

    let mut conn = db::open_in_memory().expect("open");
    db::migrate(&mut conn).expect("migrate");

    let bare = meta("ep-meta", "First Title");
    let summary = ingest_transcript_text(&conn, &bare, text).expect("ingest");

    let mut richer = meta("ep-meta", "Second Title");
    richer.show = Some("The Deep Dive".to_string());
    richer.published_at = Some("2026-03-05T00:00:00Z".to_string());
    ingest_transcript_text(&conn, &richer, text).expect("re-ingest");

    let episode = tkl_core::store::fetch_episode(&conn, summary.episode_id).expect("episode");
    assert_eq!(episode.title, "First Title");
    assert_eq!(episode.show.as_deref(), Some("The Deep Dive"));
    assert_eq!(episode.published_at.as_deref(), Some("2026-03-05T00:00:00Z"));
}

#[test]
fn plain_speaker_lines_store_without_timestamps() {
    let text = "Alice: the cache is fast\nBob: faster than I expected\nAlice: agreed";

    let mut conn = db::open_in_memory().expect("open");
    db::migrate(&mut conn).expect("migrate");

    let summary =
        ingest_transcript_text(&conn, &meta("ep-plain", "Plain Lines"), text).expect("ingest");
    assert_eq!(summary.detected_format, "speaker_lines");
    assert_eq!(summary.segments_inserted, 3);

    let no_ts: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM segments WHERE episode_id = ?1 AND start_secs IS NULL",
            [summary.episode_id],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(no_ts, 3);
}

#[test]
fn unstructured_text_falls_back_to_raw_lines_with_warning() {
    let text = "some rambling prose\nwithout any speaker heads\nacross three lines";

    let mut conn = db::open_in_memory().expect("open");
    db::migrate(&mut conn).expect("migrate");

    let summary =
        ingest_transcript_text(&conn, &meta("ep-raw", "Raw Paste"), text).expect("ingest");
    assert_eq!(summary.detected_format, "raw_lines");
    assert_eq!(summary.segments_inserted, 3);
    assert!(summary
        .warnings
        .iter()
        .any(|w| w.code == "INGEST_FORMAT_FALLBACK"));

    let anon: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM segments WHERE episode_id = ?1 AND speaker IS NULL",
            [summary.episode_id],
            |row| row.get(0),
        )
        .unwrap();
    assert_eq!(anon, 3);
}

#[test]
fn empty_transcript_is_rejected() {
    let mut conn = db::open_in_memory().expect("open");
    db::migrate(&mut conn).expect("migrate");

    let err = ingest_transcript_text(&conn, &meta("ep-none", "Empty"), "   \n  \n")
        .expect_err("must fail");
    assert_eq!(err.code, "INGEST_EMPTY");
}

#[test]
fn csv_transcript_ingests_with_optional_columns() {
    let csv_text = include_str!(concat!(
        env!("CARGO_MANIFEST_DIR"),
        "/../../fixtures/demo/transcript_sample.csv"
    ));

    let mut conn = db::open_in_memory().expect("open");
    db::migrate(&mut conn).expect("migrate");

    let summary =
        ingest_transcript_csv(&conn, &meta("ep-csv", "CSV Episode"), csv_text).expect("ingest");
    assert_eq!(summary.detected_format, "csv");
    assert_eq!(summary.segments_inserted, 3);
    assert!(summary.warnings.is_empty(), "{:?}", summary.warnings);

    let episode = tkl_core::store::fetch_episode(&conn, summary.episode_id).expect("episode");
    assert_eq!(episode.participants, vec!["Alice", "Bob"]);

    let segments =
        tkl_core::store::segments_for_episode(&conn, summary.episode_id).expect("segments");
    assert_eq!(segments[0].speaker.as_deref(), Some("Alice"));
    assert_eq!(segments[0].start_secs, Some(5));
    assert_eq!(segments[0].end_secs, Some(68));
    assert_eq!(segments[2].speaker, None);
    assert_eq!(segments[2].end_secs, None);
}

#[test]
fn csv_bad_cells_warn_and_keep_the_row() {
    let csv_text = "speaker,start,text\n\
                    Alice,12,fine row\n\
                    Bob,soon,bad start cell\n\
                    Carol,,empty start is fine\n";

    let mut conn = db::open_in_memory().expect("open");
    db::migrate(&mut conn).expect("migrate");

    let summary =
        ingest_transcript_csv(&conn, &meta("ep-csv-bad", "CSV Warnings"), csv_text)
            .expect("ingest");
    assert_eq!(summary.segments_inserted, 3);

    let bad_time: Vec<_> = summary
        .warnings
        .iter()
        .filter(|w| w.code == "INGEST_CSV_BAD_TIME")
        .collect();
    assert_eq!(bad_time.len(), 1);
    assert!(bad_time[0]
        .details
        .as_deref()
        .unwrap_or("")
        .contains("row=3"));
}

#[test]
fn csv_without_text_column_is_rejected() {
    let mut conn = db::open_in_memory().expect("open");
    db::migrate(&mut conn).expect("migrate");

    let err = ingest_transcript_csv(
        &conn,
        &meta("ep-csv-miss", "Broken CSV"),
        "speaker,start\nAlice,5\n",
    )
    .expect_err("must fail");
    assert_eq!(err.code, "CSV_HEADER_MISSING");
}

#[test]
fn csv_rows_without_text_are_skipped_with_warning() {
    let csv_text = "speaker,text\nAlice,something said\nBob,\n";

    let mut conn = db::open_in_memory().expect("open");
    db::migrate(&mut conn).expect("migrate");

    let summary = ingest_transcript_csv(&conn, &meta("ep-csv-skip", "Sparse CSV"), csv_text)
        .expect("ingest");
    assert_eq!(summary.segments_inserted, 1);
    assert!(summary
        .warnings
        .iter()
        .any(|w| w.code == "INGEST_CSV_ROW_SKIPPED"));
}
