//! Historical Bar Types
//!
//! OHLCV bars as returned by a historical market data provider, the
//! interval they are aggregated over, and the per-symbol ordered series
//! the backfill assembles from paginated responses.

mod series;
mod timeframe;

pub use series::{BarSeries, SeriesError};
pub use timeframe::{Timeframe, TimeframeError, TimeframeUnit};

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::Symbol;

// =============================================================================
// Bar
// =============================================================================

/// One OHLCV observation for a symbol over a time bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bar {
    /// Ticker symbol.
    pub symbol: Symbol,
    /// Start of the bucket (UTC).
    pub timestamp: DateTime<Utc>,
    /// Opening price.
    pub open: Decimal,
    /// Highest price.
    pub high: Decimal,
    /// Lowest price.
    pub low: Decimal,
    /// Closing price.
    pub close: Decimal,
    /// Traded volume.
    pub volume: u64,
    /// Number of trades in the bucket.
    pub trade_count: Option<u64>,
    /// Volume-weighted average price.
    pub vwap: Option<Decimal>,
}

/// A bar whose prices break the OHLC relationship.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BarViolation {
    /// A price field is zero or negative.
    #[error("{field} price must be positive, got {value}")]
    NonPositivePrice {
        /// Offending field name.
        field: &'static str,
        /// Offending value.
        value: Decimal,
    },

    /// High is below open or close.
    #[error("high {high} is below the open/close body")]
    HighBelowBody {
        /// Reported high.
        high: Decimal,
    },

    /// Low is above open or close.
    #[error("low {low} is above the open/close body")]
    LowAboveBody {
        /// Reported low.
        low: Decimal,
    },
}

impl Bar {
    /// Check `high >= max(open, close) >= min(open, close) >= low` and
    /// that all prices are positive.
    ///
    /// # Errors
    ///
    /// Returns the first violation found.
    pub fn validate(&self) -> Result<(), BarViolation> {
        for (field, value) in [
            ("open", self.open),
            ("high", self.high),
            ("low", self.low),
            ("close", self.close),
        ] {
            if value <= Decimal::ZERO {
                return Err(BarViolation::NonPositivePrice { field, value });
            }
        }

        let body_top = self.open.max(self.close);
        let body_bottom = self.open.min(self.close);

        if self.high < body_top {
            return Err(BarViolation::HighBelowBody { high: self.high });
        }
        if self.low > body_bottom {
            return Err(BarViolation::LowAboveBody { low: self.low });
        }
        Ok(())
    }
}

// =============================================================================
// Request Parameters
// =============================================================================

/// Opaque continuation token for a paginated bars query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageCursor(String);

impl PageCursor {
    /// Wrap a provider token.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PageCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Corporate action adjustment applied to historical prices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Adjustment {
    /// Prices as traded.
    Raw,
    /// Adjusted for splits.
    Split,
    /// Adjusted for dividends.
    Dividend,
    /// Adjusted for splits and dividends.
    #[default]
    All,
}

impl Adjustment {
    /// Query string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Split => "split",
            Self::Dividend => "dividend",
            Self::All => "all",
        }
    }
}

impl FromStr for Adjustment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "raw" => Ok(Self::Raw),
            "split" => Ok(Self::Split),
            "dividend" => Ok(Self::Dividend),
            "all" => Ok(Self::All),
            other => Err(format!(
                "unknown adjustment '{other}' (expected raw, split, dividend or all)"
            )),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
