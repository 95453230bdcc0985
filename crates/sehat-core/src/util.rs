//! Shared utility functions used across multiple modules.

/// Current Unix timestamp in milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Format a unix-millisecond timestamp for display, e.g. in CLI output.
///
/// Returns `-` for timestamps at or below zero (never synced).
pub fn format_ms(timestamp_ms: i64) -> String {
    if timestamp_ms <= 0 {
        return "-".to_string();
    }
    chrono::DateTime::from_timestamp_millis(timestamp_ms).map_or_else(
        || "-".to_string(),
        |dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
    )
}
