//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - `BarsProvider`: paginated historical bars source
//! - `BarSink`: per-symbol bar file writer
//! - `StreamSource`: live event subscription
//! - `CaptureLog`: append-only record log

mod bars;
mod capture_log;
mod stream;

pub use bars::{BarSink, BarsPage, BarsProvider, BarsRequest, ProviderError, SinkError};
pub use capture_log::{CaptureLog, LogError};
pub use stream::{StreamContext, StreamError, StreamSource};

#[cfg(test)]
pub use bars::{MockBarSink, MockBarsProvider};
#[cfg(test)]
pub use capture_log::MockCaptureLog;
