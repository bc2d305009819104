//! Small helpers shared by the queue, probe, and CLI.

use crate::error::{Error, Result};

/// Longest error text kept on a queue record or printed in a listing
pub const MAX_ERROR_CHARS: usize = 180;

/// Whether `url` is absolute (`http://` or `https://`)
pub fn is_absolute_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Validate a configured base URL and strip any trailing slash.
///
/// `label` names the setting in the error message.
pub fn parse_base_url(value: &str, label: &str) -> Result<String> {
    let value = value.trim();
    if value.is_empty() {
        return Err(Error::InvalidInput(format!("{label} must not be empty")));
    }
    if !is_absolute_url(value) {
        return Err(Error::InvalidInput(format!(
            "{label} must include http:// or https://"
        )));
    }
    Ok(value.trim_end_matches('/').to_string())
}

/// Trim and cut `text` to `max` characters, marking the cut with `...`
pub fn clip(text: &str, max: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut clipped: String = text.chars().take(max.saturating_sub(3)).collect();
    clipped.push_str("...");
    clipped
}

/// Current Unix timestamp in milliseconds.
pub fn unix_millis_now() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn base_url_is_trimmed_and_unslashed() {
        assert_eq!(
            parse_base_url(" https://ward.local/api/ ", "endpoint URL").unwrap(),
            "https://ward.local/api"
        );
    }

    #[test]
    fn base_url_needs_a_scheme() {
        assert!(matches!(
            parse_base_url("ward.local", "endpoint URL"),
            Err(Error::InvalidInput(message)) if message.contains("http://")
        ));
        assert!(parse_base_url("   ", "probe URL").is_err());
    }

    #[test]
    fn clip_marks_long_text() {
        let long = "x".repeat(500);
        let clipped = clip(&long, MAX_ERROR_CHARS);
        assert_eq!(clipped.chars().count(), MAX_ERROR_CHARS);
        assert!(clipped.ends_with("..."));
        assert_eq!(clip("  short  ", MAX_ERROR_CHARS), "short");
    }
}
