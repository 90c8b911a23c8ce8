use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of the trimmed text. The sole uniqueness key for
/// segments and chunks, so identical text always collapses to one row.
pub fn content_fingerprint(text: &str) -> String {
    let digest = Sha256::digest(text.trim().as_bytes());
    hex::encode(digest)
}

/// Fingerprint over the identifying tuple of an assertion. Segment ids are
/// sorted so extraction order does not change the key; the episode id keeps
/// the same wording in different episodes distinct.
pub fn assertion_fingerprint(
    episode_id: i64,
    statement: &str,
    speaker: Option<&str>,
    segment_ids: &[i64],
) -> String {
    let mut ids: Vec<i64> = segment_ids.to_vec();
    ids.sort_unstable();
    ids.dedup();
    let ids = ids
        .iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",");
    let payload = format!(
        "episode={episode_id}|statement={}|speaker={}|segments={ids}",
        statement.trim(),
        speaker.unwrap_or("")
    );
    content_fingerprint(&payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_fingerprint_is_stable_and_trims() {
        let a = content_fingerprint("hello world");
        let b = content_fingerprint("  hello world \n");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert_ne!(a, content_fingerprint("hello worlds"));
    }

    #[test]
    fn assertion_fingerprint_ignores_segment_order() {
        let a = assertion_fingerprint(1, "x is fast", Some("alice"), &[3, 1, 2]);
        let b = assertion_fingerprint(1, "x is fast", Some("alice"), &[1, 2, 3]);
        assert_eq!(a, b);
    }

    #[test]
    fn assertion_fingerprint_distinguishes_episode_and_speaker() {
        let base = assertion_fingerprint(1, "x is fast", Some("alice"), &[1]);
        assert_ne!(base, assertion_fingerprint(2, "x is fast", Some("alice"), &[1]));
        assert_ne!(base, assertion_fingerprint(1, "x is fast", Some("bob"), &[1]));
        assert_ne!(base, assertion_fingerprint(1, "x is fast", None, &[1]));
    }
}
