//! PII-safe identifiers and free-text scrubbing for decision traces.

use std::fmt::Write as _;
use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};

pub const DESTINATION_HASH_PREFIX: &str = "dst_";
const DESTINATION_HASH_HEX_CHARS: usize = 32;
const TRUNCATION_MARKER: &str = "...";

fn pii_patterns() -> &'static [(Regex, &'static str)] {
    static PATTERNS: OnceLock<Vec<(Regex, &'static str)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            (r"(?i)\b[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}\b", "[email]"),
            (
                r"(?i)\b(?:calle|carrera|cra|cl|kr|avenida|av|diagonal|dg|transversal|tv)\.?\s*\d+[a-z]?(?:\s*(?:#|no\.?|n[°º])\s*\d+[a-z]?(?:\s*-\s*\d+)?)?|\b\d{1,5}\s+(?:[a-z]+\s+){0,3}(?:street|st|avenue|ave|road|rd|boulevard|blvd|lane|ln|drive|dr)\b\.?",
                "[address]",
            ),
            (r"\+?\d[\d\s().-]{6,}\d", "[phone]"),
        ]
        .into_iter()
        .filter_map(|(pattern, replacement)| match Regex::new(pattern) {
            Ok(regex) => Some((regex, replacement)),
            Err(error) => {
                tracing::error!(%error, replacement, "pii pattern failed to compile");
                None
            }
        })
        .collect()
    })
}

/// Hashes a raw destination address into a stable, non-reversible identifier.
pub fn hash_destination(raw_destination: &str, salt: Option<&str>) -> String {
    let mut hasher = Sha256::new();
    if let Some(salt) = salt.filter(|value| !value.is_empty()) {
        hasher.update(salt.as_bytes());
        hasher.update(b":");
    }
    hasher.update(raw_destination.trim().as_bytes());
    let digest = hasher.finalize();
    let mut encoded =
        String::with_capacity(DESTINATION_HASH_PREFIX.len() + DESTINATION_HASH_HEX_CHARS);
    encoded.push_str(DESTINATION_HASH_PREFIX);
    for byte in digest.iter().take(DESTINATION_HASH_HEX_CHARS / 2) {
        let _ = write!(encoded, "{byte:02x}");
    }
    encoded
}

/// Strips e-mail, street-address and phone-like fragments, collapses
/// whitespace and bounds the result to `max_chars` chars.
pub fn redact_detail(text: &str, max_chars: usize) -> String {
    let mut scrubbed = text.to_string();
    for (pattern, replacement) in pii_patterns() {
        scrubbed = pattern.replace_all(&scrubbed, *replacement).into_owned();
    }
    let collapsed = scrubbed.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate_chars(&collapsed, max_chars)
}

fn truncate_chars(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    if max_chars <= TRUNCATION_MARKER.len() {
        return value.chars().take(max_chars).collect();
    }
    let keep = max_chars - TRUNCATION_MARKER.len();
    let mut output = value.chars().take(keep).collect::<String>();
    output.push_str(TRUNCATION_MARKER);
    output
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use proptest::prelude::*;

    use super::*;

    #[test]
    fn unit_hash_is_stable_and_prefixed() {
        let first = hash_destination("573001234567@c.us", None);
        let second = hash_destination("573001234567@c.us", None);
        assert_eq!(first, second);
        assert!(first.starts_with(DESTINATION_HASH_PREFIX));
        assert_eq!(first.len(), DESTINATION_HASH_PREFIX.len() + 32);
        assert!(!first.contains("573001234567"));
    }

    #[test]
    fn unit_hash_ignores_surrounding_whitespace_and_honors_salt() {
        assert_eq!(
            hash_destination(" user-1 ", None),
            hash_destination("user-1", None)
        );
        assert_ne!(
            hash_destination("user-1", Some("tenant-a")),
            hash_destination("user-1", None)
        );
    }

    #[test]
    fn functional_hash_has_no_collisions_across_ten_thousand_samples() {
        let mut seen = HashSet::new();
        for index in 0..10_000u32 {
            let raw = format!("57300{index:07}@c.us");
            assert!(seen.insert(hash_destination(&raw, None)), "collision at {raw}");
        }
        assert_eq!(seen.len(), 10_000);
    }

    #[test]
    fn unit_redact_detail_strips_phone_email_and_address() {
        let redacted = redact_detail(
            "call +57 300 123 4567 or mail ana@example.com, ship to Calle 45 # 12-30",
            280,
        );
        assert!(!redacted.contains("300 123"));
        assert!(!redacted.contains("ana@example.com"));
        assert!(!redacted.contains("45 # 12"));
        assert!(redacted.contains("[phone]"));
        assert!(redacted.contains("[email]"));
        assert!(redacted.contains("[address]"));
    }

    #[test]
    fn unit_redact_detail_handles_english_street_addresses() {
        let redacted = redact_detail("deliver to 221 Baker Street tomorrow", 280);
        assert_eq!(redacted, "deliver to [address] tomorrow");
    }

    #[test]
    fn unit_redact_detail_truncates_with_marker() {
        let redacted = redact_detail(&"x".repeat(50), 10);
        assert_eq!(redacted, "xxxxxxx...");
        assert_eq!(redact_detail("short", 10), "short");
    }

    proptest! {
        #[test]
        fn redacted_detail_never_exceeds_bound(text in ".{0,400}", max_chars in 0usize..300) {
            let redacted = redact_detail(&text, max_chars);
            prop_assert!(redacted.chars().count() <= max_chars);
        }
    }
}
