use time::format_description::well_known::Rfc3339;
use time::{Date, Month, OffsetDateTime, UtcOffset};

/// Case-normalized canonical form used for entity uniqueness: whitespace
/// collapsed to single spaces, lowercased.
pub fn normalize_name(raw: &str) -> String {
    raw.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Line endings normalized to `\n`.
pub fn normalize_text(s: &str) -> String {
    s.replace("\r\n", "\n").replace('\r', "\n")
}

/// `HH:MM:SS` rendering for citations and chunk text. Negative inputs clamp
/// to zero.
pub fn seconds_to_hms(secs: i64) -> String {
    let secs = secs.max(0);
    let h = secs / 3600;
    let m = (secs % 3600) / 60;
    let s = secs % 60;
    format!("{h:02}:{m:02}:{s:02}")
}

/// Parse `HH:MM:SS`, `H:MM:SS`, or `MM:SS` into seconds.
pub fn parse_hms(raw: &str) -> Option<i64> {
    let parts: Vec<&str> = raw.trim().split(':').collect();
    let nums: Vec<i64> = parts
        .iter()
        .map(|p| p.trim().parse::<i64>())
        .collect::<Result<_, _>>()
        .ok()?;
    match nums.as_slice() {
        [h, m, s] if (0..60).contains(m) && (0..60).contains(s) && *h >= 0 => {
            Some(h * 3600 + m * 60 + s)
        }
        [m, s] if (0..60).contains(s) && *m >= 0 => Some(m * 60 + s),
        _ => None,
    }
}

/// Rough token estimate used for chunk budgeting: one token per four bytes,
/// at least one for non-empty text.
pub fn estimate_tokens(text: &str) -> i64 {
    let t = text.trim();
    if t.is_empty() {
        return 0;
    }
    ((t.len() as i64) / 4).max(1)
}

/// Trim and bound a quote to `max_chars` characters, appending `...` when
/// truncated. Cuts on character boundaries.
pub fn take_quote(text: &str, max_chars: usize) -> String {
    let t = text.trim();
    if t.chars().count() <= max_chars {
        return t.to_string();
    }
    let mut s: String = t.chars().take(max_chars).collect();
    s.push_str("...");
    s
}

/// Canonicalize a publication date to RFC3339 UTC. Accepts RFC3339 or a
/// bare `YYYY-MM-DD` (treated as midnight UTC).
pub fn parse_published_at(raw: &str) -> Option<String> {
    let t = raw.trim();
    if t.is_empty() {
        return None;
    }
    if let Ok(dt) = OffsetDateTime::parse(t, &Rfc3339) {
        return dt.to_offset(UtcOffset::UTC).format(&Rfc3339).ok();
    }

    let parts: Vec<&str> = t.split('-').collect();
    if let [y, m, d] = parts.as_slice() {
        let year: i32 = y.parse().ok()?;
        let month: u8 = m.parse().ok()?;
        let day: u8 = d.parse().ok()?;
        let date = Date::from_calendar_date(year, Month::try_from(month).ok()?, day).ok()?;
        return date.midnight().assume_utc().format(&Rfc3339).ok();
    }
    None
}

/// Deep link into the source player at a given offset, when the source URL
/// is known.
pub fn timestamp_link(url: &str, start_secs: i64) -> String {
    let sep = if url.contains('?') { '&' } else { '?' };
    format!("{url}{sep}t={start_secs}s")
}
