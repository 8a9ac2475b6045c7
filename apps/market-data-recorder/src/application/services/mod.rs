//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `RequestPacer`: run-wide minimum spacing between provider requests
//! - `BackfillService`: paginated per-symbol fetch with retries and a report
//! - `CaptureSupervisor`: stream tasks, capture writers, bounded shutdown

mod backfill;
mod capture;
mod pacing;

pub use backfill::{
    BackfillConfig, BackfillJob, BackfillReport, BackfillService, FetchError, RetryBackoff,
    SymbolOutcome,
};
pub use capture::{
    CaptureConfig, CaptureError, CaptureReport, CaptureSupervisor, StartError, StreamReport,
    WriterReport,
};
pub use pacing::RequestPacer;
