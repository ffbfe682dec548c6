/// Milliseconds since the Unix epoch.
pub type Timestamp = u64;

/// Current wall-clock time in Unix epoch milliseconds.
pub fn now_millis() -> Timestamp {
    let dur = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    dur.as_millis() as Timestamp
}

/// Formats a countdown as `m:ss`.
pub fn format_time_left(secs: u64) -> String {
    format!("{}:{:02}", secs / 60, secs % 60)
}
