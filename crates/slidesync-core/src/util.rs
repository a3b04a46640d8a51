//! Shared utility functions used across multiple modules.

/// Seconds since the Unix epoch, float precision.
pub type Timestamp = f64;

/// Check if a string starts with `http://` or `https://`.
pub fn is_http_url(value: &str) -> bool {
    value.starts_with("http://") || value.starts_with("https://")
}

/// Current wall-clock time as a float Unix timestamp.
#[allow(clippy::cast_precision_loss)]
pub fn now_ts() -> Timestamp {
    chrono::Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Current Unix timestamp in milliseconds.
pub fn unix_millis_now() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_http_url_accepts_valid_schemes() {
        assert!(is_http_url("http://localhost"));
        assert!(is_http_url("https://example.com"));
        assert!(!is_http_url("libsql://example.turso.io"));
    }

    #[test]
    fn now_ts_has_sub_second_precision_and_is_recent() {
        let ts = now_ts();
        assert!(ts > 1_600_000_000.0);
        assert!((ts - ts.trunc()) >= 0.0);
    }
}
