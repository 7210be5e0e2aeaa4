//! Time utilities for the round engine and liveness tracking

use std::time::Duration;

use tokio::time::Instant;

/// Milliseconds on the server clock
pub type Millis = u64;

/// Server start time for uptime tracking
static SERVER_START: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();

/// Initialize server start time (call once at startup)
pub fn init_server_time() {
    SERVER_START.get_or_init(std::time::Instant::now);
}

/// Get server uptime in seconds
pub fn uptime_secs() -> u64 {
    SERVER_START
        .get()
        .map(|start| start.elapsed().as_secs())
        .unwrap_or(0)
}

/// Round tick cadence
pub const ROUND_TICK: Duration = Duration::from_secs(1);

/// Monotonic clock reading milliseconds since its creation.
///
/// Built on `tokio::time::Instant` so that paused-time tests advance it
/// together with the tick and sweep timers.
#[derive(Debug, Clone, Copy)]
pub struct ServerClock {
    origin: Instant,
}

impl ServerClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> Millis {
        self.origin.elapsed().as_millis() as Millis
    }
}

impl Default for ServerClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Convert a duration to server-clock milliseconds
pub fn as_millis(duration: Duration) -> Millis {
    duration.as_millis() as Millis
}
