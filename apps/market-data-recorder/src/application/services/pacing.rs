//! Global request pacing.
//!
//! One pacer is shared by every request of a run, across symbols, pages and
//! retries, so no two provider calls start closer together than
//! `min_interval`.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Enforces a minimum interval between successive requests.
#[derive(Debug)]
pub struct RequestPacer {
    min_interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RequestPacer {
    /// Pacer with an explicit minimum interval.
    #[must_use]
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            next_slot: Mutex::new(None),
        }
    }

    /// Pacer for a requests-per-minute ceiling. Zero disables pacing.
    #[must_use]
    pub fn per_minute(requests_per_minute: u32) -> Self {
        if requests_per_minute == 0 {
            return Self::new(Duration::ZERO);
        }
        Self::new(Duration::from_secs(60) / requests_per_minute)
    }

    /// Minimum spacing between requests.
    #[must_use]
    pub const fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Wait until the next request may start, then claim that slot.
    ///
    /// The lock is held across the sleep so concurrent callers queue in
    /// order instead of claiming the same slot.
    pub async fn acquire(&self) {
        let mut next_slot = self.next_slot.lock().await;
        if let Some(slot) = *next_slot {
            tokio::time::sleep_until(slot).await;
        }
        *next_slot = Some(Instant::now() + self.min_interval);
    }
}
