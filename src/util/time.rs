//! Time utilities and the cadences the core runs on

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

/// Outbound presence broadcast cadence
pub const BROADCAST_INTERVAL: Duration = Duration::from_millis(350);

/// Backend keep-alive ping cadence
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);

/// Simulated heading drift cadence (only while no live heading exists)
pub const HEADING_SIM_INTERVAL: Duration = Duration::from_millis(180);

/// Presence records older than this are hidden from the player list
pub const STALE_AFTER: Duration = Duration::from_secs(12);

/// A mesh peer silent for this long is reported disconnected
pub const PEER_SILENCE_TIMEOUT: Duration = Duration::from_secs(6);

/// First backend reconnect delay; doubles per failure
pub const RECONNECT_BASE: Duration = Duration::from_secs(1);

/// Upper bound for the backend reconnect delay
pub const RECONNECT_MAX: Duration = Duration::from_secs(30);

/// Current wall-clock time in UTC
pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

/// Process start time for uptime tracking
static PROCESS_START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

/// Initialize process start time (call once at startup)
pub fn init_process_time() {
    PROCESS_START.get_or_init(Instant::now);
}

/// Get process uptime in seconds
pub fn uptime_secs() -> u64 {
    PROCESS_START
        .get()
        .map(|start| start.elapsed().as_secs())
        .unwrap_or(0)
}

/// Exponential reconnect backoff
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
}

impl Backoff {
    pub fn new() -> Self {
        Self {
            next: RECONNECT_BASE,
        }
    }

    /// Delay to wait before the next attempt; doubles the following one
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (self.next * 2).min(RECONNECT_MAX);
        delay
    }

    pub fn reset(&mut self) {
        self.next = RECONNECT_BASE;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new()
    }
}
