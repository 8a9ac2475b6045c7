#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Market Data Recorder - Historical Backfill and Streaming Capture
//!
//! Pulls market data from Alpaca and persists it to flat CSV files:
//!
//! - **Backfill**: paginated historical bars for a list of symbols under a
//!   run-wide request rate ceiling, one CSV per symbol
//! - **Capture**: long-lived quote, trade and trade update streams, each
//!   appended to its own durable log, with a bounded shutdown
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: vendor-neutral records and rules
//!   - `history`: bars, timeframes, ordered per-symbol series
//!   - `streaming`: quotes, trades, executions, stream lifecycle
//!
//! - **Application**: use cases and port definitions
//!   - `ports`: bars provider and sink, stream sources, capture logs
//!   - `services`: request pacing, backfill, capture supervision
//!
//! - **Infrastructure**: adapters and external integrations
//!   - `alpaca`: REST bars client and WebSocket stream sources
//!   - `storage`: bar files and append-only capture logs
//!   - `config`: configuration from the environment
//!   - `metrics`, `telemetry`: observability
//!
//! # Data Flow
//!
//! ```text
//! Alpaca REST ──► BackfillService ──► <SYMBOL>.csv
//!                   (paced, retried)
//!
//! Alpaca stock WS ──┐                 ┌──► writer ──► quotes.csv
//!                   ├─► bounded mpsc ─┼──► writer ──► trades.csv
//! Alpaca trade WS ──┘                 └──► writer ──► executions.csv
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core market data types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::Symbol;
pub use domain::history::{Adjustment, Bar, BarSeries, PageCursor, Timeframe};
pub use domain::streaming::{CaptureRecord, EventKind, Execution, Quote, StreamState, Trade};

// Ports
pub use application::ports::{
    BarSink, BarsPage, BarsProvider, BarsRequest, CaptureLog, LogError, ProviderError,
    SinkError, StreamContext, StreamError, StreamSource,
};

// Services
pub use application::services::{
    BackfillConfig, BackfillJob, BackfillReport, BackfillService, CaptureConfig, CaptureError,
    CaptureReport, CaptureSupervisor, FetchError, RequestPacer, StartError, SymbolOutcome,
};

// Infrastructure config
pub use infrastructure::config::{
    BackfillSettings, CaptureSettings, ConfigError, Credentials, DataFeed, Environment,
    RecorderConfig, WebSocketSettings,
};

// Adapters
pub use infrastructure::alpaca::{AlpacaBarsClient, MarketDataSource, TradeUpdatesSource};
pub use infrastructure::storage::{AppendLog, BarLayout, CsvBarWriter};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
