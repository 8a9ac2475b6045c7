//! Capture Integration Tests
//!
//! Runs `CaptureSupervisor` with scripted sources and real append logs in a
//! temporary directory.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;

use market_data_recorder::{
    AppendLog, CaptureConfig, CaptureLog, CaptureRecord, CaptureSupervisor, EventKind, Quote,
    StreamContext, StreamError, StreamSource, StreamState, Symbol, Trade,
};

fn quote(n: usize) -> CaptureRecord {
    CaptureRecord::Quote(Quote {
        symbol: format!("Q{n:03}"),
        timestamp: Utc::now(),
        ask_exchange: "V".to_string(),
        ask_price: Decimal::new(10_001, 2),
        ask_size: 1,
        bid_exchange: "V".to_string(),
        bid_price: Decimal::new(10_000, 2),
        bid_size: 1,
        conditions: vec!["R".to_string()],
        tape: "C".to_string(),
        received_at: Utc::now(),
    })
}

fn trade(n: i64) -> CaptureRecord {
    CaptureRecord::Trade(Trade {
        symbol: "SPY".to_string(),
        timestamp: Utc::now(),
        exchange: "P".to_string(),
        price: Decimal::new(51_000, 2),
        size: 100,
        trade_id: n,
        conditions: Vec::new(),
        tape: "B".to_string(),
        received_at: Utc::now(),
    })
}

/// Delivers a burst of quotes at random intervals. Messages already in
/// flight when cancellation arrives are still delivered.
struct BurstSource {
    count: usize,
}

#[async_trait]
impl StreamSource for BurstSource {
    fn name(&self) -> &str {
        "burst"
    }

    fn kinds(&self) -> Vec<EventKind> {
        vec![EventKind::Quotes]
    }

    async fn subscribe(&self, _: EventKind, _: &[Symbol]) -> Result<(), StreamError> {
        Ok(())
    }

    async fn unsubscribe(&self, _: EventKind, _: &[Symbol]) -> Result<(), StreamError> {
        Ok(())
    }

    async fn run(&self, ctx: StreamContext, cancel: CancellationToken) -> Result<(), StreamError> {
        ctx.transition(StreamState::Connecting);
        ctx.transition(StreamState::Subscribed);
        for n in 0..self.count {
            ctx.deliver(quote(n)).await?;
            let pause = rand::rng().random_range(0..=2_000);
            tokio::time::sleep(Duration::from_micros(pause)).await;
        }
        cancel.cancelled().await;
        Ok(())
    }
}

/// Delivers quotes until cancelled, checking between every delivery, and
/// counts how many it handed over.
struct InterruptibleSource {
    limit: usize,
    delivered: Arc<AtomicUsize>,
}

#[async_trait]
impl StreamSource for InterruptibleSource {
    fn name(&self) -> &str {
        "interruptible"
    }

    fn kinds(&self) -> Vec<EventKind> {
        vec![EventKind::Quotes]
    }

    async fn subscribe(&self, _: EventKind, _: &[Symbol]) -> Result<(), StreamError> {
        Ok(())
    }

    async fn unsubscribe(&self, _: EventKind, _: &[Symbol]) -> Result<(), StreamError> {
        Ok(())
    }

    async fn run(&self, ctx: StreamContext, cancel: CancellationToken) -> Result<(), StreamError> {
        ctx.transition(StreamState::Connecting);
        ctx.transition(StreamState::Subscribed);
        for n in 0..self.limit {
            if cancel.is_cancelled() {
                break;
            }
            ctx.deliver(quote(n)).await?;
            self.delivered.fetch_add(1, Ordering::SeqCst);
            // Bursts of back-to-back deliveries keep the channel backed up.
            if n % 32 == 31 {
                let pause = rand::rng().random_range(0..=500);
                tokio::time::sleep(Duration::from_micros(pause)).await;
            }
        }
        Ok(())
    }
}

/// Emits a few trades, then ignores cancellation forever.
struct StuckSource;

#[async_trait]
impl StreamSource for StuckSource {
    fn name(&self) -> &str {
        "stuck"
    }

    fn kinds(&self) -> Vec<EventKind> {
        vec![EventKind::Trades]
    }

    async fn subscribe(&self, _: EventKind, _: &[Symbol]) -> Result<(), StreamError> {
        Ok(())
    }

    async fn unsubscribe(&self, _: EventKind, _: &[Symbol]) -> Result<(), StreamError> {
        Ok(())
    }

    async fn run(&self, ctx: StreamContext, _cancel: CancellationToken) -> Result<(), StreamError> {
        ctx.transition(StreamState::Connecting);
        ctx.transition(StreamState::Subscribed);
        for n in 0..3 {
            ctx.deliver(trade(n)).await?;
        }
        std::future::pending::<()>().await;
        Ok(())
    }
}

fn config(shutdown_timeout: Duration) -> CaptureConfig {
    CaptureConfig {
        shutdown_timeout,
        channel_capacity: 16,
        flush_interval: Duration::from_millis(20),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_mid_burst_keeps_every_record_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let log = AppendLog::open(dir.path(), EventKind::Quotes, 7)
        .await
        .unwrap();
    let path = log.path().to_path_buf();

    let supervisor = CaptureSupervisor::start(
        config(Duration::from_secs(5)),
        vec![Arc::new(BurstSource { count: 100 }) as Arc<dyn StreamSource>],
        vec![Box::new(log) as Box<dyn CaptureLog>],
    );
    tokio::time::sleep(Duration::from_millis(30)).await;

    let report = supervisor.shutdown().await;

    assert_eq!(report.streams[0].state, StreamState::Closed);
    assert_eq!(report.records(EventKind::Quotes), 100);
    assert!(report.is_success());

    let contents = std::fs::read_to_string(&path).unwrap();
    assert!(contents.ends_with('\n'));
    let lines: Vec<&str> = contents.lines().collect();
    assert_eq!(lines.len(), 101);
    assert!(lines[0].starts_with("symbol,"));
    for (n, line) in lines[1..].iter().enumerate() {
        assert!(line.starts_with(&format!("Q{n:03},")), "line {n}: {line}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn source_stopped_mid_burst_loses_and_repeats_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let log = AppendLog::open(dir.path(), EventKind::Quotes, 5)
        .await
        .unwrap();
    let path = log.path().to_path_buf();
    let delivered = Arc::new(AtomicUsize::new(0));
    let limit = 1_000_000;

    let supervisor = CaptureSupervisor::start(
        config(Duration::from_secs(5)),
        vec![Arc::new(InterruptibleSource {
            limit,
            delivered: Arc::clone(&delivered),
        }) as Arc<dyn StreamSource>],
        vec![Box::new(log) as Box<dyn CaptureLog>],
    );
    tokio::time::sleep(Duration::from_millis(40)).await;

    let report = supervisor.shutdown().await;
    let delivered = delivered.load(Ordering::SeqCst);

    assert!(delivered > 0, "nothing delivered before shutdown");
    assert!(delivered < limit, "source finished before shutdown");
    assert_eq!(report.streams[0].state, StreamState::Closed);
    assert_eq!(report.records(EventKind::Quotes), delivered as u64);
    assert!(report.is_success());

    let contents = std::fs::read_to_string(&path).unwrap();
    assert!(contents.ends_with('\n'));
    let rows: Vec<&str> = contents.lines().skip(1).collect();
    assert_eq!(rows.len(), delivered);

    let mut seen = HashSet::new();
    for (n, row) in rows.iter().enumerate() {
        let symbol = row.split(',').next().unwrap();
        assert_eq!(symbol, format!("Q{n:03}"), "row {n}: {row}");
        assert!(seen.insert(symbol), "duplicate row {row}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stuck_stream_is_forced_closed_within_bound() {
    let dir = tempfile::tempdir().unwrap();
    let trades = AppendLog::open(dir.path(), EventKind::Trades, 100)
        .await
        .unwrap();
    let quotes = AppendLog::open(dir.path(), EventKind::Quotes, 100)
        .await
        .unwrap();
    let trades_path = trades.path().to_path_buf();
    let timeout = Duration::from_millis(300);

    let supervisor = CaptureSupervisor::start(
        config(timeout),
        vec![
            Arc::new(StuckSource) as Arc<dyn StreamSource>,
            Arc::new(BurstSource { count: 5 }),
        ],
        vec![
            Box::new(trades) as Box<dyn CaptureLog>,
            Box::new(quotes),
        ],
    );
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    let report = supervisor.shutdown().await;
    let elapsed = started.elapsed();

    assert!(
        elapsed < timeout + Duration::from_secs(1),
        "shutdown took {elapsed:?}"
    );
    let stuck = report.streams.iter().find(|s| s.name == "stuck").unwrap();
    assert_eq!(stuck.state, StreamState::ForcedClosed);
    let burst = report.streams.iter().find(|s| s.name == "burst").unwrap();
    assert_eq!(burst.state, StreamState::Closed);

    // Records delivered before the forced close still reach the file.
    assert_eq!(report.records(EventKind::Trades), 3);
    assert_eq!(report.records(EventKind::Quotes), 5);
    let trade_lines = std::fs::read_to_string(trades_path).unwrap().lines().count();
    assert_eq!(trade_lines, 4);
}
