//! Streaming Capture Supervisor
//!
//! Owns one task per stream source and one writer task per capture log.
//! Receive loops hand records to writers over bounded channels, so a slow
//! disk never stalls a socket read and a hung stream never blocks a sibling.
//!
//! # Shutdown
//!
//! 1. Stop accepting subscriptions.
//! 2. Mark every live stream `Draining` and cancel it; sources unsubscribe
//!    and send a close frame.
//! 3. Join all streams concurrently against one deadline, `shutdown_timeout`
//!    from the start of shutdown. A stream that misses it is aborted and
//!    marked `ForcedClosed`.
//! 4. Tell writers to drain what is queued, then flush and sync each log.
//!    Writers share the same deadline, extended by at most `WRITER_GRACE`
//!    when the streams used it all up.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::application::ports::{CaptureLog, LogError, StreamContext, StreamError, StreamSource};
use crate::domain::Symbol;
use crate::domain::streaming::{CaptureRecord, EventKind, StreamState};
use crate::infrastructure::metrics;

// =============================================================================
// Configuration and Errors
// =============================================================================

/// Time writers always get to close once streams are joined.
const WRITER_GRACE: Duration = Duration::from_millis(250);

/// Capture tuning.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Bound on the whole shutdown, streams and writers together.
    pub shutdown_timeout: Duration,
    /// Records buffered between a receive loop and its writer.
    pub channel_capacity: usize,
    /// Longest time a record may sit unflushed.
    pub flush_interval: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(10),
            channel_capacity: 4096,
            flush_interval: Duration::from_secs(1),
        }
    }
}

/// Capture control errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CaptureError {
    /// Shutdown has begun; no new subscriptions.
    #[error("capture is shutting down")]
    ShuttingDown,

    /// No running stream carries this event kind.
    #[error("no stream carries {0} events")]
    NoStreamFor(EventKind),

    /// The stream rejected the request.
    #[error(transparent)]
    Stream(#[from] StreamError),
}

/// Initial subscription failed. The capture was shut down before returning.
#[derive(Debug, thiserror::Error)]
#[error("initial subscription failed: {error}")]
pub struct StartError {
    /// Why the subscription failed.
    #[source]
    pub error: CaptureError,
    /// Outcome of the shutdown that followed.
    pub report: CaptureReport,
}

// =============================================================================
// Reports
// =============================================================================

/// Final state of one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamReport {
    /// Stream name.
    pub name: String,
    /// Terminal state.
    pub state: StreamState,
    /// Error that ended the stream, if any.
    pub error: Option<String>,
}

/// Final counters of one capture log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriterReport {
    /// Event kind stored by the log.
    pub kind: Option<EventKind>,
    /// Records appended.
    pub records: u64,
    /// Records that could not be appended.
    pub failed: u64,
    /// Close or join error, if any.
    pub error: Option<String>,
}

impl WriterReport {
    /// Move records a failed write dropped from appended to failed.
    fn discount_dropped(&mut self, error: &LogError) {
        let dropped = error.dropped_records() as u64;
        self.records = self.records.saturating_sub(dropped);
        self.failed += dropped;
    }
}

/// Result of a capture session.
#[derive(Debug, Clone, Default)]
pub struct CaptureReport {
    /// One entry per stream.
    pub streams: Vec<StreamReport>,
    /// One entry per capture log.
    pub writers: Vec<WriterReport>,
}

impl CaptureReport {
    /// Whether no stream failed and every writer closed cleanly.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.streams.iter().all(|s| s.state != StreamState::Failed)
            && self
                .writers
                .iter()
                .all(|w| w.error.is_none() && w.failed == 0)
    }

    /// Records appended to the log of `kind`.
    #[must_use]
    pub fn records(&self, kind: EventKind) -> u64 {
        self.writers
            .iter()
            .filter(|w| w.kind == Some(kind))
            .map(|w| w.records)
            .sum()
    }
}

impl fmt::Display for CaptureReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let streams: Vec<String> = self
            .streams
            .iter()
            .map(|s| format!("{}={}", s.name, s.state))
            .collect();
        let writers: Vec<String> = self
            .writers
            .iter()
            .map(|w| {
                let kind = w.kind.map_or("unknown", |k| k.as_str());
                format!("{kind}={}", w.records)
            })
            .collect();
        write!(
            f,
            "streams[{}] records[{}]",
            streams.join(" "),
            writers.join(" ")
        )
    }
}

// =============================================================================
// Supervisor
// =============================================================================

struct StreamHandle {
    source: Arc<dyn StreamSource>,
    state: Arc<RwLock<StreamState>>,
    cancel: CancellationToken,
    task: JoinHandle<Result<(), StreamError>>,
}

struct WriterHandle {
    kind: EventKind,
    task: JoinHandle<WriterReport>,
}

/// Runs capture streams and their writers.
pub struct CaptureSupervisor {
    config: CaptureConfig,
    accepting: AtomicBool,
    streams: Vec<StreamHandle>,
    writers: Vec<WriterHandle>,
    drain: CancellationToken,
}

impl CaptureSupervisor {
    /// Spawn one writer per log and one receive loop per source.
    ///
    /// Each source only receives channels for kinds it carries and that
    /// have a log attached. Must be called from within a tokio runtime.
    pub fn start(
        config: CaptureConfig,
        sources: Vec<Arc<dyn StreamSource>>,
        logs: Vec<Box<dyn CaptureLog>>,
    ) -> Self {
        let drain = CancellationToken::new();
        let mut senders: HashMap<EventKind, mpsc::Sender<CaptureRecord>> = HashMap::new();
        let mut writers = Vec::with_capacity(logs.len());

        for log in logs {
            let kind = log.kind();
            let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
            senders.insert(kind, tx);
            let task = tokio::spawn(run_writer(
                log,
                rx,
                config.flush_interval,
                drain.child_token(),
            ));
            writers.push(WriterHandle { kind, task });
        }

        let mut streams = Vec::with_capacity(sources.len());
        for source in sources {
            let routes: HashMap<_, _> = source
                .kinds()
                .into_iter()
                .filter_map(|kind| senders.get(&kind).map(|tx| (kind, tx.clone())))
                .collect();

            let state = Arc::new(RwLock::new(StreamState::Disconnected));
            let ctx = StreamContext::new(source.name(), Arc::clone(&state), routes);
            let cancel = CancellationToken::new();

            let task = tokio::spawn({
                let source = Arc::clone(&source);
                let cancel = cancel.clone();
                async move {
                    let result = source.run(ctx.clone(), cancel).await;
                    if let Err(e) = &result {
                        tracing::error!(stream = %ctx.name(), error = %e, "Stream stopped");
                        ctx.transition(StreamState::Failed);
                    }
                    result
                }
            });

            tracing::info!(stream = source.name(), "Stream started");
            streams.push(StreamHandle {
                source,
                state,
                cancel,
                task,
            });
        }

        // Writers finish once every stream context is gone (or on drain).
        drop(senders);

        Self {
            config,
            accepting: AtomicBool::new(true),
            streams,
            writers,
            drain,
        }
    }

    /// Start capture and subscribe `symbols` for each of `kinds`.
    ///
    /// No subscription is made when `symbols` is empty.
    ///
    /// # Errors
    ///
    /// On the first failed subscription the capture is shut down, so records
    /// already delivered still reach disk, and the error is returned with
    /// the shutdown report.
    pub async fn start_subscribed(
        config: CaptureConfig,
        sources: Vec<Arc<dyn StreamSource>>,
        logs: Vec<Box<dyn CaptureLog>>,
        kinds: &[EventKind],
        symbols: &[Symbol],
    ) -> Result<Self, StartError> {
        let supervisor = Self::start(config, sources, logs);
        if symbols.is_empty() {
            return Ok(supervisor);
        }
        for kind in kinds {
            if let Err(error) = supervisor.subscribe(*kind, symbols).await {
                tracing::error!(kind = %kind, error = %error, "Initial subscription failed");
                let report = supervisor.shutdown().await;
                return Err(StartError { error, report });
            }
        }
        Ok(supervisor)
    }

    /// Subscribe `symbols` for `kind` on every stream that carries it.
    ///
    /// # Errors
    ///
    /// `ShuttingDown` once shutdown has begun, `NoStreamFor` when no stream
    /// carries `kind`, or the stream's own error.
    pub async fn subscribe(&self, kind: EventKind, symbols: &[Symbol]) -> Result<(), CaptureError> {
        let sources = self.sources_for(kind)?;
        for source in sources {
            source.subscribe(kind, symbols).await?;
        }
        tracing::info!(kind = %kind, symbols = symbols.len(), "Subscribed");
        Ok(())
    }

    /// Unsubscribe `symbols` for `kind`.
    ///
    /// # Errors
    ///
    /// As for [`Self::subscribe`].
    pub async fn unsubscribe(
        &self,
        kind: EventKind,
        symbols: &[Symbol],
    ) -> Result<(), CaptureError> {
        let sources = self.sources_for(kind)?;
        for source in sources {
            source.unsubscribe(kind, symbols).await?;
        }
        tracing::info!(kind = %kind, symbols = symbols.len(), "Unsubscribed");
        Ok(())
    }

    fn sources_for(&self, kind: EventKind) -> Result<Vec<Arc<dyn StreamSource>>, CaptureError> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(CaptureError::ShuttingDown);
        }
        let sources: Vec<_> = self
            .streams
            .iter()
            .filter(|h| h.source.kinds().contains(&kind))
            .map(|h| Arc::clone(&h.source))
            .collect();
        if sources.is_empty() {
            return Err(CaptureError::NoStreamFor(kind));
        }
        Ok(sources)
    }

    /// Current state of every stream.
    #[must_use]
    pub fn stream_states(&self) -> Vec<(String, StreamState)> {
        self.streams
            .iter()
            .map(|h| (h.source.name().to_string(), *h.state.read()))
            .collect()
    }

    /// Whether every stream has reached a terminal state on its own.
    #[must_use]
    pub fn all_streams_terminal(&self) -> bool {
        self.streams.iter().all(|h| h.state.read().is_terminal())
    }

    /// Stop all streams and close all logs, bounded by the shutdown timeout.
    pub async fn shutdown(self) -> CaptureReport {
        self.accepting.store(false, Ordering::Release);
        let timeout = self.config.shutdown_timeout;
        let deadline = Instant::now() + timeout;

        tracing::info!(
            streams = self.streams.len(),
            timeout_ms = timeout.as_millis(),
            "Capture shutdown started"
        );

        for handle in &self.streams {
            let mut state = handle.state.write();
            if let Ok(next) = state.transition(StreamState::Draining) {
                *state = next;
                metrics::record_stream_state(handle.source.name(), next);
            }
            drop(state);
            handle.cancel.cancel();
        }

        let streams = join_all(
            self.streams
                .into_iter()
                .map(|handle| join_stream(handle, deadline)),
        )
        .await;

        self.drain.cancel();

        let writer_deadline = deadline.max(Instant::now() + WRITER_GRACE);
        let writers = join_all(
            self.writers
                .into_iter()
                .map(|handle| join_writer(handle, writer_deadline)),
        )
        .await;

        let report = CaptureReport { streams, writers };
        tracing::info!(%report, "Capture shutdown complete");
        report
    }
}

async fn join_stream(mut handle: StreamHandle, deadline: Instant) -> StreamReport {
    let name = handle.source.name().to_string();
    let joined = tokio::time::timeout_at(deadline, &mut handle.task).await;

    let error = match joined {
        Ok(Ok(Ok(()))) => None,
        Ok(Ok(Err(e))) => Some(e.to_string()),
        Ok(Err(join_error)) => Some(join_error.to_string()),
        Err(_) => {
            handle.task.abort();
            let mut state = handle.state.write();
            if let Ok(next) = state.transition(StreamState::ForcedClosed) {
                *state = next;
            }
            drop(state);
            tracing::warn!(
                stream = %name,
                "ShutdownTimeout: stream did not close in time, forced close"
            );
            metrics::record_forced_close(&name);
            Some("shutdown timeout".to_string())
        }
    };

    let final_state = {
        let mut state = handle.state.write();
        if let Ok(next) = state.transition(StreamState::Closed) {
            *state = next;
        }
        *state
    };
    metrics::record_stream_state(&name, final_state);
    tracing::info!(stream = %name, state = %final_state, "Stream joined");

    StreamReport {
        name,
        state: final_state,
        error,
    }
}

async fn join_writer(mut handle: WriterHandle, deadline: Instant) -> WriterReport {
    match tokio::time::timeout_at(deadline, &mut handle.task).await {
        Ok(Ok(report)) => report,
        Ok(Err(join_error)) => WriterReport {
            kind: Some(handle.kind),
            error: Some(join_error.to_string()),
            ..WriterReport::default()
        },
        Err(_) => {
            handle.task.abort();
            tracing::warn!(kind = %handle.kind, "Capture writer did not finish in time");
            WriterReport {
                kind: Some(handle.kind),
                error: Some("writer shutdown timeout".to_string()),
                ..WriterReport::default()
            }
        }
    }
}

/// Writer loop for one log: append in arrival order, flush on a timer,
/// drain and close when asked.
async fn run_writer(
    mut log: Box<dyn CaptureLog>,
    mut rx: mpsc::Receiver<CaptureRecord>,
    flush_interval: Duration,
    drain: CancellationToken,
) -> WriterReport {
    let kind = log.kind();
    let mut report = WriterReport {
        kind: Some(kind),
        ..WriterReport::default()
    };
    let mut ticker = tokio::time::interval(flush_interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut draining = false;

    loop {
        tokio::select! {
            biased;

            record = rx.recv() => {
                let Some(record) = record else { break };
                match log.append(&record).await {
                    Ok(()) => {
                        report.records += 1;
                        metrics::record_appended(kind);
                    }
                    Err(e) => {
                        // A failed write also drops records counted as appended earlier.
                        let earlier = e.dropped_records().saturating_sub(1) as u64;
                        report.records = report.records.saturating_sub(earlier);
                        report.failed += earlier + 1;
                        tracing::error!(kind = %kind, error = %e, "Failed to append record");
                    }
                }
            }

            () = drain.cancelled(), if !draining => {
                // Buffered records are still delivered after close().
                rx.close();
                draining = true;
            }

            _ = ticker.tick() => {
                if let Err(e) = log.flush().await {
                    report.discount_dropped(&e);
                    tracing::error!(kind = %kind, error = %e, "Failed to flush capture log");
                }
            }
        }
    }

    if let Err(e) = log.close().await {
        report.discount_dropped(&e);
        tracing::error!(kind = %kind, error = %e, "Failed to close capture log");
        report.error = Some(e.to_string());
    }
    tracing::info!(kind = %kind, records = report.records, "Capture log closed");
    report
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::MockCaptureLog;
    use crate::domain::streaming::Quote;
    use async_trait::async_trait;
    use chrono::Utc;
    use rust_decimal::Decimal;

    fn quote(n: i64) -> CaptureRecord {
        CaptureRecord::Quote(Quote {
            symbol: "SPY".to_string(),
            timestamp: Utc::now(),
            ask_exchange: "P".to_string(),
            ask_price: Decimal::new(50_001 + n, 2),
            ask_size: 1,
            bid_exchange: "P".to_string(),
            bid_price: Decimal::new(50_000 + n, 2),
            bid_size: 1,
            conditions: Vec::new(),
            tape: "B".to_string(),
            received_at: Utc::now(),
        })
    }

    /// Emits `count` quotes then waits for cancellation.
    struct ScriptedSource {
        count: i64,
    }

    #[async_trait]
    impl StreamSource for ScriptedSource {
        fn name(&self) -> &str {
            "scripted"
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
            }
            cancel.cancelled().await;
            Ok(())
        }
    }

    /// Never finishes, even when cancelled.
    struct HungSource;

    #[async_trait]
    impl StreamSource for HungSource {
        fn name(&self) -> &str {
            "hung"
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
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    /// Fails immediately.
    struct FailingSource;

    #[async_trait]
    impl StreamSource for FailingSource {
        fn name(&self) -> &str {
            "failing"
        }

        fn kinds(&self) -> Vec<EventKind> {
            vec![EventKind::TradeUpdates]
        }

        async fn subscribe(&self, _: EventKind, _: &[Symbol]) -> Result<(), StreamError> {
            Ok(())
        }

        async fn unsubscribe(&self, _: EventKind, _: &[Symbol]) -> Result<(), StreamError> {
            Ok(())
        }

        async fn run(&self, ctx: StreamContext, _cancel: CancellationToken) -> Result<(), StreamError> {
            ctx.transition(StreamState::Connecting);
            Err(StreamError::ReconnectExhausted { attempts: 3 })
        }
    }

    /// Accepts the stream but rejects every subscription.
    struct RejectingSource;

    #[async_trait]
    impl StreamSource for RejectingSource {
        fn name(&self) -> &str {
            "rejecting"
        }

        fn kinds(&self) -> Vec<EventKind> {
            vec![EventKind::Quotes]
        }

        async fn subscribe(&self, _: EventKind, _: &[Symbol]) -> Result<(), StreamError> {
            Err(StreamError::ConnectionLost("subscribe refused".to_string()))
        }

        async fn unsubscribe(&self, _: EventKind, _: &[Symbol]) -> Result<(), StreamError> {
            Ok(())
        }

        async fn run(&self, ctx: StreamContext, cancel: CancellationToken) -> Result<(), StreamError> {
            ctx.transition(StreamState::Connecting);
            ctx.transition(StreamState::Subscribed);
            for n in 0..4 {
                ctx.deliver(quote(n)).await?;
            }
            cancel.cancelled().await;
            Ok(())
        }
    }

    /// Takes far longer than any shutdown bound to close.
    struct SlowCloseLog {
        kind: EventKind,
    }

    #[async_trait]
    impl CaptureLog for SlowCloseLog {
        fn kind(&self) -> EventKind {
            self.kind
        }

        async fn append(&mut self, _: &CaptureRecord) -> Result<(), LogError> {
            Ok(())
        }

        async fn flush(&mut self) -> Result<(), LogError> {
            Ok(())
        }

        async fn close(&mut self) -> Result<(), LogError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    fn counting_log(kind: EventKind) -> MockCaptureLog {
        let mut log = MockCaptureLog::new();
        log.expect_kind().return_const(kind);
        log.expect_append().returning(|_| Ok(()));
        log.expect_flush().returning(|| Ok(()));
        log.expect_close().times(1).returning(|| Ok(()));
        log
    }

    fn config(timeout_ms: u64) -> CaptureConfig {
        CaptureConfig {
            shutdown_timeout: Duration::from_millis(timeout_ms),
            channel_capacity: 8,
            flush_interval: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn clean_shutdown_closes_streams_and_logs() {
        let supervisor = CaptureSupervisor::start(
            config(1_000),
            vec![Arc::new(ScriptedSource { count: 20 }) as Arc<dyn StreamSource>],
            vec![Box::new(counting_log(EventKind::Quotes)) as Box<dyn CaptureLog>],
        );
        tokio::time::sleep(Duration::from_millis(50)).await;

        let report = supervisor.shutdown().await;

        assert_eq!(report.streams.len(), 1);
        assert_eq!(report.streams[0].state, StreamState::Closed);
        assert_eq!(report.records(EventKind::Quotes), 20);
        assert!(report.is_success());
    }

    #[tokio::test]
    async fn hung_stream_is_forced_closed_within_timeout() {
        let supervisor = CaptureSupervisor::start(
            config(200),
            vec![
                Arc::new(HungSource) as Arc<dyn StreamSource>,
                Arc::new(ScriptedSource { count: 3 }),
            ],
            vec![
                Box::new(counting_log(EventKind::Trades)) as Box<dyn CaptureLog>,
                Box::new(counting_log(EventKind::Quotes)),
            ],
        );
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = std::time::Instant::now();
        let report = supervisor.shutdown().await;
        let elapsed = started.elapsed();

        assert!(elapsed < Duration::from_millis(200) + Duration::from_millis(800));
        let states: HashMap<_, _> = report
            .streams
            .iter()
            .map(|s| (s.name.as_str(), s.state))
            .collect();
        assert_eq!(states["hung"], StreamState::ForcedClosed);
        assert_eq!(states["scripted"], StreamState::Closed);
        assert_eq!(report.records(EventKind::Quotes), 3);
    }

    #[tokio::test]
    async fn failing_stream_does_not_affect_siblings() {
        let supervisor = CaptureSupervisor::start(
            config(1_000),
            vec![
                Arc::new(FailingSource) as Arc<dyn StreamSource>,
                Arc::new(ScriptedSource { count: 5 }),
            ],
            vec![
                Box::new(counting_log(EventKind::TradeUpdates)) as Box<dyn CaptureLog>,
                Box::new(counting_log(EventKind::Quotes)),
            ],
        );
        tokio::time::sleep(Duration::from_millis(50)).await;

        let states: HashMap<_, _> = supervisor.stream_states().into_iter().collect();
        assert_eq!(states["failing"], StreamState::Failed);
        assert_eq!(states["scripted"], StreamState::Subscribed);
        assert!(!supervisor.all_streams_terminal());

        let report = supervisor.shutdown().await;
        assert!(!report.is_success());
        assert_eq!(report.records(EventKind::Quotes), 5);
    }

    #[tokio::test]
    async fn subscribe_after_shutdown_is_rejected() {
        let supervisor = CaptureSupervisor::start(
            config(500),
            vec![Arc::new(ScriptedSource { count: 0 }) as Arc<dyn StreamSource>],
            vec![Box::new(counting_log(EventKind::Quotes)) as Box<dyn CaptureLog>],
        );

        supervisor
            .subscribe(EventKind::Quotes, &["SPY".to_string()])
            .await
            .unwrap();
        supervisor.accepting.store(false, Ordering::Release);

        assert_eq!(
            supervisor
                .subscribe(EventKind::Quotes, &["QQQ".to_string()])
                .await,
            Err(CaptureError::ShuttingDown)
        );
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn subscribe_for_uncarried_kind_is_rejected() {
        let supervisor = CaptureSupervisor::start(
            config(500),
            vec![Arc::new(ScriptedSource { count: 0 }) as Arc<dyn StreamSource>],
            vec![Box::new(counting_log(EventKind::Quotes)) as Box<dyn CaptureLog>],
        );
        assert_eq!(
            supervisor
                .subscribe(EventKind::Trades, &["SPY".to_string()])
                .await,
            Err(CaptureError::NoStreamFor(EventKind::Trades))
        );
        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn append_failures_are_counted_not_fatal() {
        let mut log = MockCaptureLog::new();
        log.expect_kind().return_const(EventKind::Quotes);
        let mut n = 0;
        log.expect_append().returning(move |_| {
            n += 1;
            if n == 2 {
                Err(LogError::Encode("bad row".to_string()))
            } else {
                Ok(())
            }
        });
        log.expect_flush().returning(|| Ok(()));
        log.expect_close().returning(|| Ok(()));

        let supervisor = CaptureSupervisor::start(
            config(1_000),
            vec![Arc::new(ScriptedSource { count: 4 }) as Arc<dyn StreamSource>],
            vec![Box::new(log) as Box<dyn CaptureLog>],
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        let report = supervisor.shutdown().await;

        assert_eq!(report.writers[0].records, 3);
        assert_eq!(report.writers[0].failed, 1);
        assert!(!report.is_success());
    }

    #[tokio::test(start_paused = true)]
    async fn hung_stream_and_slow_writer_share_one_deadline() {
        let supervisor = CaptureSupervisor::start(
            config(1_000),
            vec![Arc::new(HungSource) as Arc<dyn StreamSource>],
            vec![Box::new(SlowCloseLog {
                kind: EventKind::Trades,
            }) as Box<dyn CaptureLog>],
        );
        tokio::time::sleep(Duration::from_millis(10)).await;

        let started = Instant::now();
        let report = supervisor.shutdown().await;
        let elapsed = started.elapsed();

        assert!(
            elapsed <= Duration::from_millis(1_000) + WRITER_GRACE,
            "shutdown took {elapsed:?}"
        );
        assert_eq!(report.streams[0].state, StreamState::ForcedClosed);
        assert_eq!(
            report.writers[0].error.as_deref(),
            Some("writer shutdown timeout")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_writer_uses_time_left_by_fast_streams() {
        let supervisor = CaptureSupervisor::start(
            config(1_000),
            vec![Arc::new(ScriptedSource { count: 2 }) as Arc<dyn StreamSource>],
            vec![Box::new(SlowCloseLog {
                kind: EventKind::Quotes,
            }) as Box<dyn CaptureLog>],
        );
        tokio::time::sleep(Duration::from_millis(10)).await;

        let started = Instant::now();
        supervisor.shutdown().await;
        let elapsed = started.elapsed();

        assert!(elapsed >= Duration::from_millis(1_000), "{elapsed:?}");
        assert!(elapsed <= Duration::from_millis(1_000) + WRITER_GRACE, "{elapsed:?}");
    }

    #[tokio::test]
    async fn failed_initial_subscription_still_flushes_and_closes() {
        let mut log = MockCaptureLog::new();
        log.expect_kind().return_const(EventKind::Quotes);
        log.expect_append().times(4).returning(|_| Ok(()));
        log.expect_flush().returning(|| Ok(()));
        log.expect_close().times(1).returning(|| Ok(()));

        let err = CaptureSupervisor::start_subscribed(
            config(1_000),
            vec![Arc::new(RejectingSource) as Arc<dyn StreamSource>],
            vec![Box::new(log) as Box<dyn CaptureLog>],
            &[EventKind::Quotes],
            &["SPY".to_string()],
        )
        .await
        .err()
        .expect("subscription should fail");

        assert!(matches!(err.error, CaptureError::Stream(_)));
        assert_eq!(err.report.streams.len(), 1);
        assert!(err.report.streams[0].state.is_terminal());
        assert_eq!(err.report.records(EventKind::Quotes), 4);
        assert!(err.to_string().contains("subscribe refused"));
    }

    #[tokio::test]
    async fn start_subscribed_without_symbols_skips_subscription() {
        let supervisor = CaptureSupervisor::start_subscribed(
            config(500),
            vec![Arc::new(RejectingSource) as Arc<dyn StreamSource>],
            vec![Box::new(counting_log(EventKind::Quotes)) as Box<dyn CaptureLog>],
            &[EventKind::Quotes],
            &[],
        )
        .await
        .expect("nothing to subscribe");
        assert!(supervisor.shutdown().await.is_success());
    }

    #[tokio::test]
    async fn records_dropped_by_a_failed_write_count_as_failed() {
        let mut log = MockCaptureLog::new();
        log.expect_kind().return_const(EventKind::Quotes);
        let mut n = 0;
        log.expect_append().returning(move |_| {
            n += 1;
            if n == 3 {
                Err(LogError::WriteFailed {
                    records: 3,
                    source: std::io::Error::other("disk full"),
                })
            } else {
                Ok(())
            }
        });
        log.expect_flush().returning(|| Ok(()));
        log.expect_close().returning(|| Ok(()));

        let supervisor = CaptureSupervisor::start(
            config(1_000),
            vec![Arc::new(ScriptedSource { count: 5 }) as Arc<dyn StreamSource>],
            vec![Box::new(log) as Box<dyn CaptureLog>],
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
        let report = supervisor.shutdown().await;

        assert_eq!(report.writers[0].records, 2);
        assert_eq!(report.writers[0].failed, 3);
    }

    #[test]
    fn failed_flush_moves_dropped_records_to_failed() {
        let mut report = WriterReport {
            records: 10,
            ..WriterReport::default()
        };
        report.discount_dropped(&LogError::WriteFailed {
            records: 4,
            source: std::io::Error::other("disk full"),
        });
        assert_eq!((report.records, report.failed), (6, 4));

        report.discount_dropped(&LogError::Encode("bad row".to_string()));
        assert_eq!((report.records, report.failed), (6, 4));
    }
}
