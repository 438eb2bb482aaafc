use chrono::Utc;

/// Returns the current unix timestamp in milliseconds, matching the
/// ms-epoch fields persisted in tenant metadata.
#[inline]
pub fn timestamp_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Returns the current unix timestamp in whole seconds.
#[inline]
pub fn timestamp_secs() -> u64 {
    Utc::now().timestamp() as u64
}
