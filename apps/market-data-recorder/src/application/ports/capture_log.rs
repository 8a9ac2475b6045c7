//! Capture Log Port (Driven Port)

use async_trait::async_trait;

use crate::domain::streaming::{CaptureRecord, EventKind};

/// Failure appending to a capture log.
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// Filesystem failure.
    #[error("capture log I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Row serialization failure.
    #[error("failed to encode record: {0}")]
    Encode(String),

    /// Record routed to the wrong log.
    #[error("{found} record sent to the {expected} log")]
    WrongKind {
        /// Kind the log stores.
        expected: EventKind,
        /// Kind of the rejected record.
        found: EventKind,
    },

    /// A buffered write failed. The queued records were dropped and the
    /// file was cut back to its last complete line.
    #[error("capture log write failed, {records} queued records dropped: {source}")]
    WriteFailed {
        /// Records dropped, including the one being appended.
        records: usize,
        /// Underlying failure.
        #[source]
        source: std::io::Error,
    },
}

impl LogError {
    /// Records accepted by this log that a failed write discarded.
    #[must_use]
    pub const fn dropped_records(&self) -> usize {
        match self {
            Self::WriteFailed { records, .. } => *records,
            _ => 0,
        }
    }
}

/// Append-only log of one event kind.
///
/// A record is either fully appended or not at all. Appends may be buffered
/// until the next `flush`; `close` flushes and syncs. A failed write drops
/// everything buffered and says how much through
/// [`LogError::dropped_records`].
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CaptureLog: Send {
    /// Kind of record this log stores.
    fn kind(&self) -> EventKind;

    /// Append one record.
    async fn append(&mut self, record: &CaptureRecord) -> Result<(), LogError>;

    /// Write buffered records to the file.
    async fn flush(&mut self) -> Result<(), LogError>;

    /// Flush and sync to disk.
    async fn close(&mut self) -> Result<(), LogError>;
}
