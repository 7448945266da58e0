//! Helpers for keeping identifiers and error text safe to log.

use sha2::{Digest, Sha256};

/// Maximum length of an `error_summary` stored on a task execution.
pub const MAX_SUMMARY_LEN: usize = 256;

/// Stable, non-reversible fingerprint of an identifier (e.g. a provider name
/// or account handle) for use on error paths instead of the raw value.
pub fn fingerprint(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    let hex: String = digest[..6].iter().map(|b| format!("{b:02x}")).collect();
    format!("fp:{hex}")
}

/// Truncate `text` to [`MAX_SUMMARY_LEN`] bytes on a char boundary.
pub fn truncate_summary(text: &str) -> String {
    if text.len() <= MAX_SUMMARY_LEN {
        return text.to_owned();
    }
    let mut end = MAX_SUMMARY_LEN;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_and_opaque() {
        let a = fingerprint("google_ads");
        assert_eq!(a, fingerprint("google_ads"));
        assert_ne!(a, fingerprint("meta"));
        assert!(a.starts_with("fp:"));
        assert!(!a.contains("google"));
        assert_eq!(a.len(), 3 + 12);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        let long = "é".repeat(MAX_SUMMARY_LEN);
        let t = truncate_summary(&long);
        assert!(t.len() <= MAX_SUMMARY_LEN + '…'.len_utf8());
        assert_eq!(truncate_summary("short"), "short");
    }
}
