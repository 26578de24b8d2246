//! Shared utility functions used across multiple modules.

use uuid::Uuid;

/// Prefix of client-generated placeholder identifiers.
pub const TEMP_ID_PREFIX: &str = "temp_";

/// Normalize optional text by trimming whitespace and removing empties.
///
/// Returns `None` when the input is `None` or the trimmed value is empty.
pub fn normalize_text_option(value: Option<String>) -> Option<String> {
    let value = value?;
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Check if a string starts with `http://` or `https://`.
pub fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

/// Truncate text to at most 180 characters for error messages.
pub fn compact_text(value: &str) -> String {
    value.trim().chars().take(180).collect()
}

/// Current Unix timestamp in milliseconds.
pub fn unix_millis_now() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Generate a client-side placeholder id (time-sortable UUID v7).
pub fn new_temp_id() -> String {
    format!("{TEMP_ID_PREFIX}{}", Uuid::now_v7())
}

/// Generate an opaque identifier for queue operations, conflicts and backups.
pub fn new_id() -> String {
    Uuid::now_v7().to_string()
}

/// Whether `id` was generated by [`new_temp_id`].
pub fn is_temp_id(id: &str) -> bool {
    id.starts_with(TEMP_ID_PREFIX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_text_option_rejects_empty() {
        assert_eq!(normalize_text_option(None), None);
        assert_eq!(normalize_text_option(Some("   ".to_string())), None);
    }

    #[test]
    fn normalize_text_option_trims_value() {
        assert_eq!(
            normalize_text_option(Some(" https://example.com ".to_string())),
            Some("https://example.com".to_string())
        );
    }

    #[test]
    fn is_http_url_accepts_valid_schemes() {
        assert!(is_http_url("http://localhost"));
        assert!(is_http_url("https://example.com"));
        assert!(!is_http_url("ftp://example.com"));
    }

    #[test]
    fn temp_ids_are_unique_and_recognizable() {
        let first = new_temp_id();
        let second = new_temp_id();
        assert_ne!(first, second);
        assert!(is_temp_id(&first));
        assert!(!is_temp_id("srv-42"));
    }
}
