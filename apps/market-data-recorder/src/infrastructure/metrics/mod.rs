//! Prometheus Metrics Module
//!
//! Exposes recorder metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Backfill**: provider requests, retries by reason, symbol outcomes, bars written
//! - **Capture**: events received, records appended, writer backpressure, crossed quotes
//! - **Streams**: lifecycle state, reconnects, forced closes
//!
//! # Integration
//!
//! When a listen port is configured, metrics are served at `/metrics` on
//! that port. Without one no recorder is installed and every call here is
//! a no-op.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::OnceLock;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::domain::streaming::{EventKind, StreamState};

// =============================================================================
// Exporter
// =============================================================================

static INSTALLED: OnceLock<SocketAddr> = OnceLock::new();

/// Install the Prometheus recorder with an HTTP listener on `listen_port`.
///
/// A port of zero leaves metrics disabled. Returns the listen address when
/// an exporter is running. Must be called from within a tokio runtime.
///
/// # Errors
///
/// Returns an error if the recorder cannot be installed or the listener
/// cannot be bound.
pub fn init_metrics(listen_port: u16) -> Result<Option<SocketAddr>, BuildError> {
    if listen_port == 0 {
        return Ok(None);
    }
    if let Some(addr) = INSTALLED.get() {
        return Ok(Some(*addr));
    }

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, listen_port));
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    register_metrics();

    let _ = INSTALLED.set(addr);
    Ok(Some(addr))
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Backfill
    describe_counter!(
        "recorder_provider_requests_total",
        "Total historical bars requests issued, retries included"
    );
    describe_counter!(
        "recorder_provider_retries_total",
        "Total historical bars retries by reason"
    );
    describe_counter!(
        "recorder_backfill_symbols_total",
        "Backfilled symbols by outcome"
    );
    describe_counter!(
        "recorder_bars_written_total",
        "Total bars written to symbol files"
    );

    // Capture
    describe_counter!(
        "recorder_events_received_total",
        "Total streamed events received by kind"
    );
    describe_counter!(
        "recorder_records_appended_total",
        "Total records appended to capture logs by kind"
    );
    describe_counter!(
        "recorder_writer_backpressure_total",
        "Times a receive loop waited on a full writer channel"
    );
    describe_counter!(
        "recorder_crossed_quotes_total",
        "Quotes received with bid above ask"
    );
    describe_counter!(
        "recorder_decode_errors_total",
        "Stream messages that could not be decoded"
    );

    // Streams
    describe_gauge!(
        "recorder_stream_state",
        "Stream lifecycle state (0=disconnected 1=connecting 2=subscribed 3=draining 4=closed 5=forced_closed 6=failed)"
    );
    describe_counter!(
        "recorder_stream_reconnects_total",
        "Total stream reconnection attempts"
    );
    describe_counter!(
        "recorder_stream_forced_closes_total",
        "Streams aborted after missing the shutdown timeout"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Record a historical bars request.
pub fn record_provider_request() {
    counter!("recorder_provider_requests_total").increment(1);
}

/// Record a retry of a historical bars request.
pub fn record_retry(reason: &'static str) {
    counter!("recorder_provider_retries_total", "reason" => reason).increment(1);
}

/// Record the outcome of one backfilled symbol.
pub fn record_symbol_outcome(outcome: &'static str) {
    counter!("recorder_backfill_symbols_total", "outcome" => outcome).increment(1);
}

/// Record bars written for a symbol.
pub fn record_bars_written(count: usize) {
    counter!("recorder_bars_written_total").increment(count as u64);
}

/// Record a streamed event received from a feed.
pub fn record_event_received(kind: EventKind) {
    counter!("recorder_events_received_total", "kind" => kind.as_str()).increment(1);
}

/// Record a record appended to a capture log.
pub fn record_appended(kind: EventKind) {
    counter!("recorder_records_appended_total", "kind" => kind.as_str()).increment(1);
}

/// Record a receive loop waiting on a full writer channel.
pub fn record_backpressure(kind: EventKind) {
    counter!("recorder_writer_backpressure_total", "kind" => kind.as_str()).increment(1);
}

/// Record a crossed quote.
pub fn record_crossed_quote() {
    counter!("recorder_crossed_quotes_total").increment(1);
}

/// Record a stream message that failed to decode.
pub fn record_decode_error(stream: &str) {
    counter!("recorder_decode_errors_total", "stream" => stream.to_string()).increment(1);
}

/// Update the lifecycle state gauge of a stream.
pub fn record_stream_state(stream: &str, state: StreamState) {
    gauge!("recorder_stream_state", "stream" => stream.to_string()).set(f64::from(state.code()));
}

/// Record a stream reconnection attempt.
pub fn record_reconnect(stream: &str) {
    counter!("recorder_stream_reconnects_total", "stream" => stream.to_string()).increment(1);
}

/// Record a stream aborted at shutdown.
pub fn record_forced_close(stream: &str) {
    counter!("recorder_stream_forced_closes_total", "stream" => stream.to_string()).increment(1);
}

// =============================================================================
// Tests
// =============================================================================
