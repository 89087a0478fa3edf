use std::time::Instant;

use time::OffsetDateTime;

/// Millisecond time source used to stamp pending callbacks.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> i64;
}

/// Monotonic clock anchored to the wall clock (UTC) at construction.
///
/// Readings advance with [`Instant`], so wall-clock steps never shorten or
/// stretch callback ages.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
    origin_ms: i64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            origin_ms: (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64,
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        let elapsed = i64::try_from(self.origin.elapsed().as_millis()).unwrap_or(i64::MAX);
        self.origin_ms.saturating_add(elapsed)
    }
}
