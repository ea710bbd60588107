//! Wall-clock access funneled through one place so tests can see a stable
//! `now_ms()` without reaching for a mocking crate.

use std::time::{SystemTime, UNIX_EPOCH};

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
