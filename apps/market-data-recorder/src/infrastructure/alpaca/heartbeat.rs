//! Connection Heartbeat
//!
//! Pings the server on a fixed interval and declares the connection dead
//! when nothing (pong or data) has arrived within the timeout after a ping.
//! Polled from the connection's own `select!` loop rather than a separate
//! task, so it stops with the connection.

use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::infrastructure::config::WebSocketSettings;

/// Shortest ping interval; a zero period would panic the ticker.
const MIN_PING_INTERVAL: Duration = Duration::from_millis(1);

/// Heartbeat timing.
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    /// Interval between pings.
    pub ping_interval: Duration,
    /// Silence after a ping that counts as a dead connection.
    pub pong_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(20),
            pong_timeout: Duration::from_secs(20),
        }
    }
}

impl From<&WebSocketSettings> for HeartbeatConfig {
    fn from(settings: &WebSocketSettings) -> Self {
        Self {
            ping_interval: settings.heartbeat_interval,
            pong_timeout: settings.heartbeat_timeout,
        }
    }
}

/// What the connection loop should do on a heartbeat tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// Send a ping frame.
    SendPing,
    /// Nothing heard since the last ping within the timeout.
    TimedOut,
}

/// Per-connection heartbeat.
#[derive(Debug)]
pub struct Heartbeat {
    config: HeartbeatConfig,
    ticker: Interval,
    last_seen: Instant,
    ping_sent_at: Option<Instant>,
}

impl Heartbeat {
    /// Start a heartbeat. The first ping goes out one interval from now.
    ///
    /// Intervals below one millisecond are raised to one millisecond.
    #[must_use]
    pub fn new(config: HeartbeatConfig) -> Self {
        let now = Instant::now();
        let period = config.ping_interval.max(MIN_PING_INTERVAL);
        let mut ticker = tokio::time::interval_at(now + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self {
            config,
            ticker,
            last_seen: now,
            ping_sent_at: None,
        }
    }

    /// Record inbound traffic of any kind.
    pub fn record_activity(&mut self) {
        self.last_seen = Instant::now();
        self.ping_sent_at = None;
    }

    /// Wait for the next tick and decide what to do.
    pub async fn tick(&mut self) -> HeartbeatEvent {
        self.ticker.tick().await;
        let timed_out = self.ping_sent_at.is_some_and(|sent| {
            self.last_seen < sent && sent.elapsed() >= self.config.pong_timeout
        });
        if timed_out {
            return HeartbeatEvent::TimedOut;
        }
        if self.ping_sent_at.is_none() {
            self.ping_sent_at = Some(Instant::now());
        }
        HeartbeatEvent::SendPing
    }

    /// Time since the last inbound traffic.
    #[must_use]
    pub fn silence(&self) -> Duration {
        self.last_seen.elapsed()
    }
}
