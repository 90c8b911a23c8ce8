use rusqlite::Connection;

use crate::domain::{IngestWarning, SegmentDraft};
use crate::error::AppError;
use crate::normalize::{normalize_text, parse_hms, timestamp_link};

use super::{TranscriptIngestSummary, TranscriptMeta, TranscriptPreview};

pub const FORMAT_TIMESTAMPED: &str = "speaker_timestamped";
pub const FORMAT_SPEAKER: &str = "speaker_lines";
pub const FORMAT_RAW: &str = "raw_lines";

const SPEAKER_HEAD_MAX: usize = 64;
const DETECT_SAMPLE: usize = 40;

fn valid_speaker_head(head: &str) -> bool {
    if head.is_empty() || head.len() > SPEAKER_HEAD_MAX {
        return false;
    }
    let mut has_alpha = false;
    for ch in head.chars() {
        if ch.is_alphabetic() {
            has_alpha = true;
            continue;
        }
        if ch.is_ascii_digit() || matches!(ch, ' ' | '.' | '-' | '\'' | '_') {
            continue;
        }
        return false;
    }
    has_alpha
}

/// `Speaker (HH:MM:SS): text`. The stamp is the last parenthesized group
/// before the colon, so names with their own parentheses still parse.
fn parse_timestamped_line(line: &str) -> Option<(String, i64, String)> {
    let marker = line.find("):")?;
    let open = line[..marker].rfind('(')?;
    let head = line[..open].trim();
    if head.is_empty()
        || head.len() > SPEAKER_HEAD_MAX
        || !head.chars().any(char::is_alphabetic)
    {
        return None;
    }
    let secs = parse_hms(line[open + 1..marker].trim())?;
    Some((head.to_string(), secs, line[marker + 2..].trim().to_string()))
}

/// `Speaker: text`. URL-looking lines and timestamp-only heads do not count.
fn parse_speaker_line(line: &str) -> Option<(String, String)> {
    let colon = line.find(':')?;
    if line[colon + 1..].starts_with("//") {
        return None;
    }
    let head = line[..colon].trim();
    if !valid_speaker_head(head) {
        return None;
    }
    Some((head.to_string(), line[colon + 1..].trim().to_string()))
}

/// Pick the parse mode from a sample of the first non-empty lines. A single
/// timestamped head settles it; otherwise plain speaker heads must carry at
/// least half of the sample.
pub fn detect_format(text: &str) -> &'static str {
    let mut sample = 0usize;
    let mut speaker_hits = 0usize;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if sample == DETECT_SAMPLE {
            break;
        }
        sample += 1;
        if parse_timestamped_line(line).is_some() {
            return FORMAT_TIMESTAMPED;
        }
        if parse_speaker_line(line).is_some() {
            speaker_hits += 1;
        }
    }
    if sample > 0 && speaker_hits * 2 >= sample {
        FORMAT_SPEAKER
    } else {
        FORMAT_RAW
    }
}

fn note_speaker(speakers: &mut Vec<String>, name: &str) {
    if !speakers.iter().any(|s| s == name) {
        speakers.push(name.to_string());
    }
}

fn append_continuation(text: &mut String, line: &str) {
    if !text.is_empty() {
        text.push(' ');
    }
    text.push_str(line);
}

fn parse_lines(
    format: &str,
    text: &str,
    url: Option<&str>,
) -> (Vec<SegmentDraft>, Vec<String>, Vec<IngestWarning>) {
    let mut drafts: Vec<SegmentDraft> = Vec::new();
    let mut speakers: Vec<String> = Vec::new();
    let mut warnings: Vec<IngestWarning> = Vec::new();
    let mut preamble = 0usize;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match format {
            FORMAT_TIMESTAMPED => {
                if let Some((speaker, secs, body)) = parse_timestamped_line(line) {
                    note_speaker(&mut speakers, &speaker);
                    drafts.push(SegmentDraft {
                        speaker: Some(speaker),
                        start_secs: Some(secs),
                        end_secs: None,
                        link: url.map(|u| timestamp_link(u, secs)),
                        text: body,
                    });
                } else if let Some(open) = drafts.last_mut() {
                    append_continuation(&mut open.text, line);
                } else {
                    preamble += 1;
                }
            }
            FORMAT_SPEAKER => {
                if let Some((speaker, body)) = parse_speaker_line(line) {
                    note_speaker(&mut speakers, &speaker);
                    drafts.push(SegmentDraft {
                        speaker: Some(speaker),
                        start_secs: None,
                        end_secs: None,
                        link: None,
                        text: body,
                    });
                } else if let Some(open) = drafts.last_mut() {
                    append_continuation(&mut open.text, line);
                } else {
                    preamble += 1;
                }
            }
            _ => {
                drafts.push(SegmentDraft {
                    speaker: None,
                    start_secs: None,
                    end_secs: None,
                    link: None,
                    text: line.to_string(),
                });
            }
        }
    }

    if preamble > 0 {
        warnings.push(
            IngestWarning::new(
                "INGEST_PREAMBLE_SKIPPED",
                "Skipped lines before the first speaker line",
            )
            .with_details(format!("lines={preamble}")),
        );
    }
    if format == FORMAT_RAW && !drafts.is_empty() {
        warnings.push(IngestWarning::new(
            "INGEST_FORMAT_FALLBACK",
            "No speaker structure detected; every line became its own segment",
        ));
    }

    // Close each timed segment at the next segment's start. Out-of-order
    // stamps leave the end open rather than inventing a negative span.
    for i in 1..drafts.len() {
        if let Some(next_start) = drafts[i].start_secs {
            let prev = &mut drafts[i - 1];
            if prev.end_secs.is_none() && prev.start_secs.map_or(true, |s| s <= next_start) {
                prev.end_secs = Some(next_start);
            }
        }
    }

    (drafts, speakers, warnings)
}

/// Parse and store a plain-text transcript under the episode named by `meta`.
pub fn ingest_transcript_text(
    conn: &Connection,
    meta: &TranscriptMeta,
    text: &str,
) -> Result<TranscriptIngestSummary, AppError> {
    let normalized = normalize_text(text);
    if normalized.trim().is_empty() {
        return Err(AppError::new("INGEST_EMPTY", "Transcript has no content"));
    }
    let format = detect_format(&normalized);
    let (drafts, speakers, warnings) = parse_lines(format, &normalized, meta.url.as_deref());
    super::store_drafts(conn, meta, &normalized, format, drafts, speakers, warnings)
}

/// Dry-run parse: report what ingest would store.
pub fn preview_transcript_text(text: &str) -> Result<TranscriptPreview, AppError> {
    let normalized = normalize_text(text);
    if normalized.trim().is_empty() {
        return Err(AppError::new("INGEST_EMPTY", "Transcript has no content"));
    }
    let format = detect_format(&normalized);
    let (drafts, speakers, warnings) = parse_lines(format, &normalized, None);
    Ok(TranscriptPreview {
        detected_format: format.to_string(),
        segments: drafts.len(),
        speakers,
        warnings,
    })
}
