//! Wall-clock source for expiration timestamps.
//!
//! Expiration tags are unix seconds, so the service needs a wall clock, while
//! its timers run on `tokio::time`. [`TokioClock`] ties the two together so a
//! paused test runtime advances both at once.

use std::time::{SystemTime, UNIX_EPOCH};

pub trait Clock: Send + Sync {
    /// Current unix time in seconds.
    fn now_secs(&self) -> u64;
}

/// System wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_secs(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|duration| duration.as_secs())
            .unwrap_or_default()
    }
}

/// Unix time derived from `tokio::time::Instant`.
///
/// Starts at `base_secs` and advances with the runtime clock, including
/// `tokio::time::advance` under a paused runtime.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    base_secs: u64,
    started: tokio::time::Instant,
}

impl TokioClock {
    pub fn new(base_secs: u64) -> Self {
        Self {
            base_secs,
            started: tokio::time::Instant::now(),
        }
    }

    /// Anchored at the current system time.
    pub fn from_system() -> Self {
        Self::new(SystemClock.now_secs())
    }
}

impl Clock for TokioClock {
    fn now_secs(&self) -> u64 {
        self.base_secs + self.started.elapsed().as_secs()
    }
}
