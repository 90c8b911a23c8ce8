use csv::ReaderBuilder;
use rusqlite::Connection;

use crate::domain::{IngestWarning, SegmentDraft};
use crate::error::AppError;
use crate::normalize::{parse_hms, timestamp_link};

use super::{TranscriptIngestSummary, TranscriptMeta};

pub const FORMAT_CSV: &str = "csv";

fn column(headers: &csv::StringRecord, names: &[&str]) -> Option<usize> {
    headers.iter().position(|h| {
        let h = h.trim().to_ascii_lowercase();
        names.iter().any(|n| *n == h)
    })
}

fn field<'r>(record: &'r csv::StringRecord, idx: Option<usize>) -> Option<&'r str> {
    idx.and_then(|i| record.get(i))
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Accepts plain seconds (`95`), fractional seconds (`95.5`) and clock
/// stamps (`1:35`, `00:01:35`).
fn parse_time_cell(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<i64>() {
        return (secs >= 0).then_some(secs);
    }
    if let Ok(secs) = raw.parse::<f64>() {
        if secs.is_finite() && secs >= 0.0 {
            return Some(secs as i64);
        }
    }
    parse_hms(raw)
}

/// Parse and store a `speaker,start,end,text` table under the episode named
/// by `meta`. Column order is free, `start_secs`/`end_secs` are accepted as
/// synonyms, and only `text` is required. Malformed rows are skipped with a
/// warning instead of failing the run.
pub fn ingest_transcript_csv(
    conn: &Connection,
    meta: &TranscriptMeta,
    csv_text: &str,
) -> Result<TranscriptIngestSummary, AppError> {
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .from_reader(csv_text.as_bytes());

    let headers = reader
        .headers()
        .map_err(|e| {
            AppError::new("CSV_PARSE_FAILED", "Failed to read CSV header row")
                .with_details(e.to_string())
        })?
        .clone();

    let text_idx = column(&headers, &["text"]).ok_or_else(|| {
        AppError::new("CSV_HEADER_MISSING", "CSV is missing a `text` column")
            .with_details(format!("headers={headers:?}"))
    })?;
    let speaker_idx = column(&headers, &["speaker"]);
    let start_idx = column(&headers, &["start", "start_secs"]);
    let end_idx = column(&headers, &["end", "end_secs"]);

    let mut drafts: Vec<SegmentDraft> = Vec::new();
    let mut speakers: Vec<String> = Vec::new();
    let mut warnings: Vec<IngestWarning> = Vec::new();

    // Header occupies row 1.
    for (n, result) in reader.records().enumerate() {
        let row = n + 2;
        let record = match result {
            Ok(record) => record,
            Err(e) => {
                warnings.push(
                    IngestWarning::new("INGEST_CSV_BAD_ROW", "Skipped unreadable CSV row")
                        .with_details(format!("row={row}; err={e}")),
                );
                continue;
            }
        };

        let text = match field(&record, Some(text_idx)) {
            Some(text) => text,
            None => {
                warnings.push(
                    IngestWarning::new("INGEST_CSV_ROW_SKIPPED", "Skipped CSV row without text")
                        .with_details(format!("row={row}")),
                );
                continue;
            }
        };

        let mut read_time = |idx: Option<usize>, label: &str| -> Option<i64> {
            let raw = field(&record, idx)?;
            match parse_time_cell(raw) {
                Some(secs) => Some(secs),
                None => {
                    warnings.push(
                        IngestWarning::new("INGEST_CSV_BAD_TIME", "Ignored unparseable time cell")
                            .with_details(format!("row={row}; column={label}; value={raw}")),
                    );
                    None
                }
            }
        };

        let start_secs = read_time(start_idx, "start");
        let mut end_secs = read_time(end_idx, "end");
        if let (Some(start), Some(end)) = (start_secs, end_secs) {
            if end < start {
                warnings.push(
                    IngestWarning::new("INGEST_CSV_BAD_TIME", "Ignored end before start")
                        .with_details(format!("row={row}; start={start}; end={end}")),
                );
                end_secs = None;
            }
        }

        let speaker = field(&record, speaker_idx).map(str::to_string);
        if let Some(name) = speaker.as_deref() {
            if !speakers.iter().any(|s| s == name) {
                speakers.push(name.to_string());
            }
        }

        let link = match (meta.url.as_deref(), start_secs) {
            (Some(url), Some(secs)) => Some(timestamp_link(url, secs)),
            _ => None,
        };

        drafts.push(SegmentDraft {
            speaker,
            start_secs,
            end_secs,
            link,
            text: text.to_string(),
        });
    }

    super::store_drafts(conn, meta, csv_text, FORMAT_CSV, drafts, speakers, warnings)
}
