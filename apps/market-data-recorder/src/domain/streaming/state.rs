//! Stream lifecycle state machine.
//!
//! ```text
//! Disconnected ──► Connecting ──► Subscribed ──► Draining ──► Closed
//!      ▲               │              │             │
//!      └───────────────┴──────────────┘             └──► ForcedClosed
//!
//! Disconnected / Connecting ──► Failed   (reconnect budget exhausted)
//! Subscribed ──► Failed                  (unrecoverable error mid-session)
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of one capture stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum StreamState {
    /// Not connected; initial state and the state after a connection drop.
    #[default]
    Disconnected,
    /// Connecting, authenticating, and subscribing.
    Connecting,
    /// Subscriptions confirmed; events are flowing.
    Subscribed,
    /// Stop requested; waiting for the receive loop to exit.
    Draining,
    /// Receive loop exited cleanly.
    Closed,
    /// Receive loop did not exit within the shutdown timeout and was aborted.
    ForcedClosed,
    /// Reconnect budget exhausted or an unrecoverable error.
    Failed,
}

/// Rejected state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid stream transition {from} -> {to}")]
pub struct InvalidTransition {
    /// State before the attempted change.
    pub from: StreamState,
    /// Requested state.
    pub to: StreamState,
}

impl StreamState {
    /// Whether no further transitions are possible.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::ForcedClosed | Self::Failed)
    }

    /// Whether `next` is a legal successor of `self`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Disconnected, Self::Connecting | Self::Draining | Self::Failed)
                | (
                    Self::Connecting,
                    Self::Subscribed | Self::Disconnected | Self::Draining | Self::Failed
                )
                | (Self::Subscribed, Self::Disconnected | Self::Draining | Self::Failed)
                | (Self::Draining, Self::Closed | Self::ForcedClosed)
        )
    }

    /// Move to `next`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` if `next` is not a legal successor.
    pub const fn transition(self, next: Self) -> Result<Self, InvalidTransition> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(InvalidTransition {
                from: self,
                to: next,
            })
        }
    }

    /// Label for logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Subscribed => "subscribed",
            Self::Draining => "draining",
            Self::Closed => "closed",
            Self::ForcedClosed => "forced_closed",
            Self::Failed => "failed",
        }
    }

    /// Numeric code for the state gauge.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Disconnected => 0,
            Self::Connecting => 1,
            Self::Subscribed => 2,
            Self::Draining => 3,
            Self::Closed => 4,
            Self::ForcedClosed => 5,
            Self::Failed => 6,
        }
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
