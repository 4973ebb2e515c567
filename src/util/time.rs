//! Time utilities

use std::time::{Duration, Instant};

/// Server start time for uptime tracking
static SERVER_START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

/// Initialize server start time (call once at startup)
pub fn init_server_time() {
    SERVER_START.get_or_init(Instant::now);
}

/// Get server uptime in seconds
pub fn uptime_secs() -> u64 {
    SERVER_START
        .get()
        .map(|start| start.elapsed().as_secs())
        .unwrap_or(0)
}

/// Exponential backoff: `base * 2^attempt`, capped at `max`
pub fn backoff_delay(base: Duration, attempt: u32, max: Duration) -> Duration {
    base.checked_mul(1u32 << attempt.min(16))
        .unwrap_or(max)
        .min(max)
}
