//! Historical Bars Ports (Driven Ports)
//!
//! A paginated provider of historical bars and a sink that persists one
//! completed series per symbol.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::Symbol;
use crate::domain::history::{Adjustment, Bar, BarSeries, PageCursor, Timeframe};

// =============================================================================
// Request / Response
// =============================================================================

/// One page request for a symbol's bars.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarsRequest {
    /// Ticker symbol.
    pub symbol: Symbol,
    /// Bar interval.
    pub timeframe: Timeframe,
    /// Range start (inclusive).
    pub start: DateTime<Utc>,
    /// Range end (inclusive).
    pub end: DateTime<Utc>,
    /// Maximum bars per page.
    pub limit: u32,
    /// Corporate action adjustment.
    pub adjustment: Adjustment,
    /// Continuation cursor from the previous page.
    pub page_token: Option<PageCursor>,
}

impl BarsRequest {
    /// The same query continued from `cursor`.
    #[must_use]
    pub fn next_page(&self, cursor: PageCursor) -> Self {
        Self {
            page_token: Some(cursor),
            ..self.clone()
        }
    }
}

/// One page of bars.
///
/// An empty `bars` with no cursor on the first page means the provider has
/// no data for the symbol in range.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BarsPage {
    /// Bars in ascending time order.
    pub bars: Vec<Bar>,
    /// Cursor for the next page; `None` on the final page.
    pub next_page_token: Option<PageCursor>,
}

/// Failure fetching a page.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// Response did not have the expected shape.
    #[error("malformed response: {0}")]
    Malformed(String),

    /// Provider throttled the request.
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited {
        /// Provider-suggested wait, if given.
        retry_after: Option<Duration>,
    },

    /// Network failure, timeout, or server-side error.
    #[error("transport error: {0}")]
    Transport(String),

    /// Request refused for a reason retrying will not fix.
    #[error("request rejected ({status}): {message}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Provider message.
        message: String,
    },
}

// =============================================================================
// Ports
// =============================================================================

/// Source of paginated historical bars.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BarsProvider: Send + Sync {
    /// Fetch a single page. Implementations must not retry or sleep; pacing
    /// and retries belong to the caller.
    async fn fetch_page(&self, request: &BarsRequest) -> Result<BarsPage, ProviderError>;
}

/// Failure persisting a series.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// Filesystem failure.
    #[error("failed to write {path}: {source}")]
    Io {
        /// Target path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Row serialization failure.
    #[error("failed to encode bars for {symbol}: {message}")]
    Encode {
        /// Series symbol.
        symbol: Symbol,
        /// Encoder message.
        message: String,
    },
}

/// Destination for completed bar series.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BarSink: Send + Sync {
    /// Persist `series`, replacing any earlier output for the symbol.
    /// Returns where it was written.
    async fn write_series(&self, series: &BarSeries) -> Result<PathBuf, SinkError>;
}
