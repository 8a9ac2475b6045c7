//! Market Data Streaming Types
//!
//! Core domain types for streamed events: quotes, trades, and account
//! executions. These types are codec-agnostic and represent the canonical
//! internal representation that capture logs are written from.
//!
//! Every record carries two clocks: the exchange (or broker) timestamp
//! from the event itself and `received_at`, the local capture time.

mod state;

pub use state::{InvalidTransition, StreamState};

use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Symbol;

// =============================================================================
// Event Kinds
// =============================================================================

/// Kind of streamed event, and therefore which capture log it lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventKind {
    /// Best bid/ask quotes.
    Quotes,
    /// Executed trades.
    Trades,
    /// Account order and fill updates.
    TradeUpdates,
}

impl EventKind {
    /// All event kinds.
    pub const ALL: [Self; 3] = [Self::Quotes, Self::Trades, Self::TradeUpdates];

    /// Short label for logs and metrics.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Quotes => "quotes",
            Self::Trades => "trades",
            Self::TradeUpdates => "trade_updates",
        }
    }

    /// File name of the capture log for this kind.
    #[must_use]
    pub const fn log_file_name(&self) -> &'static str {
        match self {
            Self::Quotes => "quotes.csv",
            Self::Trades => "trades.csv",
            Self::TradeUpdates => "executions.csv",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Records
// =============================================================================

/// Best bid/ask snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Quote {
    /// Ticker symbol.
    pub symbol: Symbol,
    /// Exchange timestamp.
    pub timestamp: DateTime<Utc>,
    /// Ask venue code.
    pub ask_exchange: String,
    /// Ask price (zero when absent).
    pub ask_price: Decimal,
    /// Ask size.
    pub ask_size: u64,
    /// Bid venue code.
    pub bid_exchange: String,
    /// Bid price (zero when absent).
    pub bid_price: Decimal,
    /// Bid size.
    pub bid_size: u64,
    /// Quote condition codes.
    pub conditions: Vec<String>,
    /// Consolidated tape.
    pub tape: String,
    /// Local capture time.
    pub received_at: DateTime<Utc>,
}

impl Quote {
    /// Whether both sides are present and the bid is above the ask.
    ///
    /// Crossed quotes are recorded as delivered; callers only flag them.
    #[must_use]
    pub fn is_crossed(&self) -> bool {
        self.bid_price > Decimal::ZERO
            && self.ask_price > Decimal::ZERO
            && self.bid_price > self.ask_price
    }
}

/// Executed transaction report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    /// Ticker symbol.
    pub symbol: Symbol,
    /// Exchange timestamp.
    pub timestamp: DateTime<Utc>,
    /// Venue code.
    pub exchange: String,
    /// Trade price.
    pub price: Decimal,
    /// Trade size.
    pub size: u64,
    /// Venue trade identifier.
    pub trade_id: i64,
    /// Trade condition codes.
    pub conditions: Vec<String>,
    /// Consolidated tape.
    pub tape: String,
    /// Local capture time.
    pub received_at: DateTime<Utc>,
}

/// Account order or fill update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Execution {
    /// Event name (`new`, `fill`, `partial_fill`, `canceled`, ...).
    pub event: String,
    /// Broker event time, when provided.
    pub timestamp: Option<DateTime<Utc>>,
    /// Broker order ID.
    pub order_id: String,
    /// Client order ID.
    pub client_order_id: String,
    /// Ticker symbol.
    pub symbol: Symbol,
    /// Order side.
    pub side: String,
    /// Order type.
    pub order_type: String,
    /// Fill price for fill events.
    pub price: Option<Decimal>,
    /// Fill quantity for fill events.
    pub qty: Option<Decimal>,
    /// Cumulative filled quantity.
    pub filled_qty: Decimal,
    /// Average fill price so far.
    pub filled_avg_price: Option<Decimal>,
    /// Position quantity after the event.
    pub position_qty: Option<Decimal>,
    /// Order status.
    pub status: String,
    /// Local capture time.
    pub received_at: DateTime<Utc>,
}

/// A normalized event bound for a capture log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureRecord {
    /// Quote event.
    Quote(Quote),
    /// Trade event.
    Trade(Trade),
    /// Account execution event.
    Execution(Box<Execution>),
}

impl CaptureRecord {
    /// The log this record belongs to.
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Quote(_) => EventKind::Quotes,
            Self::Trade(_) => EventKind::Trades,
            Self::Execution(_) => EventKind::TradeUpdates,
        }
    }

    /// Symbol the record refers to.
    #[must_use]
    pub fn symbol(&self) -> &str {
        match self {
            Self::Quote(q) => &q.symbol,
            Self::Trade(t) => &t.symbol,
            Self::Execution(e) => &e.symbol,
        }
    }
}
