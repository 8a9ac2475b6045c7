//! Bar aggregation intervals.
//!
//! Accepts the compact vendor forms (`5Min`, `5T`, `1Hour`, `1H`, `1Day`,
//! `1D`, `1Week`, `1W`, `3Month`, `3M`) and spelled-out labels such as
//! `15 minutes` or `1 day`.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Unit of a [`Timeframe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeframeUnit {
    /// Minute buckets (1-59).
    Minute,
    /// Hour buckets (1-23).
    Hour,
    /// Daily buckets (1 only).
    Day,
    /// Weekly buckets (1 only).
    Week,
    /// Monthly buckets (1, 2, 3, 4, 6 or 12).
    Month,
}

impl TimeframeUnit {
    /// Suffix used when rendering the compact form.
    #[must_use]
    pub const fn suffix(self) -> &'static str {
        match self {
            Self::Minute => "Min",
            Self::Hour => "Hour",
            Self::Day => "Day",
            Self::Week => "Week",
            Self::Month => "Month",
        }
    }

    const fn accepts(self, amount: u32) -> bool {
        match self {
            Self::Minute => amount >= 1 && amount <= 59,
            Self::Hour => amount >= 1 && amount <= 23,
            Self::Day | Self::Week => amount == 1,
            Self::Month => matches!(amount, 1 | 2 | 3 | 4 | 6 | 12),
        }
    }

    fn parse_suffix(suffix: &str) -> Option<Self> {
        // Single-letter forms are case sensitive: "M" is a month, "Min" a minute.
        match suffix {
            "T" => return Some(Self::Minute),
            "H" => return Some(Self::Hour),
            "D" => return Some(Self::Day),
            "W" => return Some(Self::Week),
            "M" => return Some(Self::Month),
            _ => {}
        }

        match suffix.to_lowercase().as_str() {
            "min" | "mins" | "minute" | "minutes" => Some(Self::Minute),
            "hour" | "hours" | "hr" | "hrs" => Some(Self::Hour),
            "day" | "days" => Some(Self::Day),
            "week" | "weeks" | "wk" => Some(Self::Week),
            "month" | "months" | "mo" => Some(Self::Month),
            _ => None,
        }
    }
}

/// Errors from parsing or constructing a [`Timeframe`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimeframeError {
    /// Empty input.
    #[error("timeframe is empty")]
    Empty,

    /// Missing or unparseable leading amount.
    #[error("timeframe '{0}' must start with a positive number")]
    InvalidAmount(String),

    /// Unrecognized unit suffix.
    #[error("timeframe '{0}' has an unknown unit")]
    UnknownUnit(String),

    /// Amount not allowed for the unit.
    #[error("{amount} is not a valid amount for {unit:?} bars")]
    OutOfRange {
        /// Requested amount.
        amount: u32,
        /// Requested unit.
        unit: TimeframeUnit,
    },
}

/// Interval that bars are aggregated over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Timeframe {
    amount: u32,
    unit: TimeframeUnit,
}

impl Timeframe {
    /// One-minute bars.
    pub const MINUTE: Self = Self {
        amount: 1,
        unit: TimeframeUnit::Minute,
    };

    /// One-hour bars.
    pub const HOUR: Self = Self {
        amount: 1,
        unit: TimeframeUnit::Hour,
    };

    /// Daily bars.
    pub const DAY: Self = Self {
        amount: 1,
        unit: TimeframeUnit::Day,
    };

    /// Weekly bars.
    pub const WEEK: Self = Self {
        amount: 1,
        unit: TimeframeUnit::Week,
    };

    /// Build a timeframe, checking the amount is valid for the unit.
    ///
    /// # Errors
    ///
    /// Returns `OutOfRange` when the unit does not support `amount`.
    pub const fn new(amount: u32, unit: TimeframeUnit) -> Result<Self, TimeframeError> {
        if unit.accepts(amount) {
            Ok(Self { amount, unit })
        } else {
            Err(TimeframeError::OutOfRange { amount, unit })
        }
    }

    /// Number of units per bar.
    #[must_use]
    pub const fn amount(&self) -> u32 {
        self.amount
    }

    /// Unit of each bar.
    #[must_use]
    pub const fn unit(&self) -> TimeframeUnit {
        self.unit
    }
}

impl Default for Timeframe {
    fn default() -> Self {
        Self::DAY
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.amount, self.unit.suffix())
    }
}

impl FromStr for Timeframe {
    type Err = TimeframeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let input = s.trim();
        if input.is_empty() {
            return Err(TimeframeError::Empty);
        }

        let digits_end = input
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(input.len());
        let (digits, rest) = input.split_at(digits_end);

        let amount: u32 = digits
            .parse()
            .map_err(|_| TimeframeError::InvalidAmount(input.to_string()))?;

        let unit = TimeframeUnit::parse_suffix(rest.trim())
            .ok_or_else(|| TimeframeError::UnknownUnit(input.to_string()))?;

        Self::new(amount, unit)
    }
}
