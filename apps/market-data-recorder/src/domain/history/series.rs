//! Per-symbol ordered bar sequence.

use chrono::{DateTime, Utc};

use super::Bar;
use crate::domain::Symbol;

/// A page of bars could not be appended to a series.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SeriesError {
    /// Bar timestamp does not strictly follow the previous bar.
    #[error("bar at {next} does not follow previous bar at {previous}")]
    OutOfOrder {
        /// Timestamp of the last accepted bar.
        previous: DateTime<Utc>,
        /// Timestamp of the rejected bar.
        next: DateTime<Utc>,
    },

    /// Bar belongs to a different symbol.
    #[error("bar for {found} cannot be added to the {expected} series")]
    SymbolMismatch {
        /// Series symbol.
        expected: Symbol,
        /// Symbol on the rejected bar.
        found: Symbol,
    },
}

/// Bars for one symbol with strictly increasing, unique timestamps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarSeries {
    symbol: Symbol,
    bars: Vec<Bar>,
}

impl BarSeries {
    /// Create an empty series.
    #[must_use]
    pub fn new(symbol: impl Into<Symbol>) -> Self {
        Self {
            symbol: symbol.into(),
            bars: Vec::new(),
        }
    }

    /// Append a page of bars.
    ///
    /// The page is checked as a whole before anything is appended, so a
    /// rejected page leaves the series unchanged.
    ///
    /// # Errors
    ///
    /// Returns `OutOfOrder` if any bar does not strictly follow its
    /// predecessor, or `SymbolMismatch` for a bar of another symbol.
    pub fn extend_page(&mut self, page: Vec<Bar>) -> Result<(), SeriesError> {
        let mut previous = self.last_timestamp();
        for bar in &page {
            if bar.symbol != self.symbol {
                return Err(SeriesError::SymbolMismatch {
                    expected: self.symbol.clone(),
                    found: bar.symbol.clone(),
                });
            }
            if let Some(prev) = previous
                && bar.timestamp <= prev
            {
                return Err(SeriesError::OutOfOrder {
                    previous: prev,
                    next: bar.timestamp,
                });
            }
            previous = Some(bar.timestamp);
        }
        self.bars.extend(page);
        Ok(())
    }

    /// Series symbol.
    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Bars in timestamp order.
    #[must_use]
    pub fn bars(&self) -> &[Bar] {
        &self.bars
    }

    /// Number of bars.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bars.len()
    }

    /// Whether the series holds no bars.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    /// Timestamp of the last bar.
    #[must_use]
    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.bars.last().map(|b| b.timestamp)
    }
}
