//! Stream Source Port (Driven Port)
//!
//! A live event subscription. Each source runs its receive loop on its own
//! task and hands normalized records to the capture writers through a
//! [`StreamContext`]; it never touches the capture files itself.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use crate::domain::Symbol;
use crate::domain::streaming::{CaptureRecord, EventKind, StreamState};

/// Stream failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// Connection dropped or could not be established.
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Reconnect attempts exhausted.
    #[error("reconnect attempts exhausted after {attempts} attempts")]
    ReconnectExhausted {
        /// Attempts made.
        attempts: u32,
    },

    /// Credentials rejected.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The source does not carry this event kind.
    #[error("stream does not carry {0} events")]
    Unsupported(EventKind),

    /// No capture log is attached for this event kind.
    #[error("no capture log attached for {0} events")]
    Unrouted(EventKind),

    /// The capture writer is gone.
    #[error("capture writer closed")]
    SinkClosed,
}

/// Per-stream execution context handed to [`StreamSource::run`].
///
/// Carries the stream's lifecycle state and the channels to the capture
/// writers. Delivery never blocks on file I/O; a full channel waits for
/// the writer rather than dropping the record.
#[derive(Debug, Clone)]
pub struct StreamContext {
    name: Arc<str>,
    state: Arc<RwLock<StreamState>>,
    routes: HashMap<EventKind, mpsc::Sender<CaptureRecord>>,
}

impl StreamContext {
    /// Create a context for stream `name`.
    #[must_use]
    pub fn new(
        name: impl Into<Arc<str>>,
        state: Arc<RwLock<StreamState>>,
        routes: HashMap<EventKind, mpsc::Sender<CaptureRecord>>,
    ) -> Self {
        Self {
            name: name.into(),
            state,
            routes,
        }
    }

    /// Stream name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> StreamState {
        *self.state.read()
    }

    /// Move to `next` if legal. Illegal moves are ignored, which keeps
    /// a receive loop's late `Disconnected` from overriding `Draining`.
    pub fn transition(&self, next: StreamState) -> bool {
        let mut state = self.state.write();
        if *state == next {
            return true;
        }
        match state.transition(next) {
            Ok(new_state) => {
                tracing::debug!(stream = %self.name, from = %*state, to = %new_state, "Stream state changed");
                *state = new_state;
                crate::infrastructure::metrics::record_stream_state(&self.name, new_state);
                true
            }
            Err(e) => {
                tracing::trace!(stream = %self.name, error = %e, "Ignoring stream transition");
                false
            }
        }
    }

    /// Hand a record to its capture writer.
    ///
    /// # Errors
    ///
    /// Returns `Unrouted` when no log is attached for the record's kind and
    /// `SinkClosed` when the writer has gone away.
    pub async fn deliver(&self, record: CaptureRecord) -> Result<(), StreamError> {
        let kind = record.kind();
        let tx = self.routes.get(&kind).ok_or(StreamError::Unrouted(kind))?;

        match tx.try_send(record) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(record)) => {
                tracing::warn!(
                    stream = %self.name,
                    kind = %kind,
                    "Capture writer backlog full, waiting"
                );
                crate::infrastructure::metrics::record_backpressure(kind);
                tx.send(record).await.map_err(|_| StreamError::SinkClosed)
            }
            Err(TrySendError::Closed(_)) => Err(StreamError::SinkClosed),
        }
    }
}

/// A live event subscription.
#[async_trait]
pub trait StreamSource: Send + Sync {
    /// Stream name for logs and reports.
    fn name(&self) -> &str;

    /// Event kinds this source can deliver.
    fn kinds(&self) -> Vec<EventKind>;

    /// Add symbols for `kind`. Takes effect on the live connection if one
    /// is up and on every reconnect.
    async fn subscribe(&self, kind: EventKind, symbols: &[Symbol]) -> Result<(), StreamError>;

    /// Remove symbols for `kind`.
    async fn unsubscribe(&self, kind: EventKind, symbols: &[Symbol]) -> Result<(), StreamError>;

    /// Receive loop. Runs until `cancel` fires (then closes the connection
    /// and returns `Ok`) or until reconnects are exhausted.
    async fn run(&self, ctx: StreamContext, cancel: CancellationToken) -> Result<(), StreamError>;
}
