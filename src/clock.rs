/// Wall clock helpers; every persisted timestamp is epoch milliseconds
use chrono::Utc;
use std::time::Duration;

/// Current time in epoch milliseconds
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Duration as signed milliseconds, saturating
pub fn duration_ms(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Epoch milliseconds `duration` from now
pub fn from_now(duration: Duration) -> i64 {
    now_ms().saturating_add(duration_ms(duration))
}
