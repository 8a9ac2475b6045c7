//! Domain Layer - Core market data types and business rules.
//!
//! This layer contains the vendor-neutral domain types for historical
//! bars and streamed events, with no I/O. Adapters in the infrastructure
//! layer translate vendor payloads into these types.

/// Historical bar types (bars, timeframes, ordered series).
pub mod history;

/// Streamed event types (quotes, trades, executions) and stream lifecycle.
pub mod streaming;

/// A ticker symbol (e.g. "AAPL").
pub type Symbol = String;
