//! Alpaca WebSocket Authentication
//!
//! Alpaca terminates connections that do not authenticate within 10 seconds.
//!
//! # Stock Stream
//! 1. Receive `[{"T":"success","msg":"connected"}]`
//! 2. Send `{"action":"auth","key":"...","secret":"..."}`
//! 3. Receive `[{"T":"success","msg":"authenticated"}]` or an error
//!
//! # Trade Updates Stream
//! 1. Send the same auth request right after connecting
//! 2. Receive `{"stream":"authorization","data":{"status":"authorized"}}`
//! 3. Send a listen request for `trade_updates`
//!
//! # Error Codes
//!
//! - 401: Not authenticated
//! - 402: Authentication failed (invalid credentials)
//! - 403: Already authenticated
//! - 404: Authentication timeout
//! - 406: Connection limit exceeded
//! - 409: Insufficient subscription (feed not included in the plan)

use std::time::Duration;

use thiserror::Error;

use super::messages::{AuthRequest, ErrorMessage, SuccessKind};
use crate::infrastructure::config::Credentials;

/// Maximum time allowed for authentication after connection.
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors that can occur during authentication.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// Request made before authenticating.
    #[error("not authenticated: must authenticate before making requests")]
    NotAuthenticated,

    /// Invalid API key or secret.
    #[error("authentication failed: invalid API key or secret")]
    InvalidCredentials,

    /// Connection was already authenticated.
    #[error("already authenticated: connection is already authenticated")]
    AlreadyAuthenticated,

    /// Authentication took longer than 10 seconds.
    #[error("authentication timeout: must authenticate within 10 seconds")]
    Timeout,

    /// Too many concurrent connections for this account.
    #[error("connection limit exceeded: too many concurrent connections")]
    ConnectionLimitExceeded,

    /// The account's plan does not include the requested feed.
    #[error("insufficient subscription: the account's plan does not include this feed")]
    InsufficientSubscription,

    /// Any other server error.
    #[error("server error ({code}): {message}")]
    ServerError {
        /// Error code from server
        code: i32,
        /// Error message from server
        message: String,
    },
}

impl AuthError {
    /// Whether reconnecting with the same credentials cannot help.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        matches!(self, Self::InvalidCredentials | Self::InsufficientSubscription)
    }
}

impl From<&ErrorMessage> for AuthError {
    fn from(err: &ErrorMessage) -> Self {
        match err.code {
            401 => Self::NotAuthenticated,
            402 => Self::InvalidCredentials,
            403 => Self::AlreadyAuthenticated,
            404 => Self::Timeout,
            406 => Self::ConnectionLimitExceeded,
            409 => Self::InsufficientSubscription,
            code => Self::ServerError {
                code,
                message: err.msg.clone(),
            },
        }
    }
}

/// Authentication progress on one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthState {
    /// Socket open, server greeting not yet seen.
    #[default]
    AwaitingGreeting,
    /// Auth request sent.
    Authenticating,
    /// Credentials accepted.
    Authenticated,
    /// Credentials rejected.
    Failed,
}

/// Tracks authentication for one connection. A fresh handler is created
/// per connection attempt.
#[derive(Debug)]
pub struct AuthHandler {
    credentials: Credentials,
    state: AuthState,
}

impl AuthHandler {
    /// Create a handler.
    #[must_use]
    pub const fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            state: AuthState::AwaitingGreeting,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> AuthState {
        self.state
    }

    /// Whether the credentials have been accepted.
    #[must_use]
    pub const fn is_authenticated(&self) -> bool {
        matches!(self.state, AuthState::Authenticated)
    }

    /// Build the auth request and mark it sent.
    pub fn auth_request(&mut self) -> AuthRequest<'_> {
        self.state = AuthState::Authenticating;
        AuthRequest::new(self.credentials.api_key(), self.credentials.api_secret())
    }

    /// Apply a stock stream success message. Returns `true` when the
    /// greeting arrived and an auth request should be sent now.
    pub fn on_success(&mut self, kind: SuccessKind) -> bool {
        match kind {
            SuccessKind::Connected => matches!(self.state, AuthState::AwaitingGreeting),
            SuccessKind::Authenticated => {
                self.state = AuthState::Authenticated;
                false
            }
        }
    }

    /// Apply a trade updates authorization result.
    ///
    /// # Errors
    ///
    /// Returns `InvalidCredentials` if authorization was rejected.
    pub fn on_authorization(&mut self, authorized: bool) -> Result<(), AuthError> {
        if authorized {
            self.state = AuthState::Authenticated;
            Ok(())
        } else {
            self.state = AuthState::Failed;
            Err(AuthError::InvalidCredentials)
        }
    }

    /// Apply a server error received before authentication completed.
    pub fn on_error(&mut self, msg: &ErrorMessage) -> AuthError {
        self.state = AuthState::Failed;
        AuthError::from(msg)
    }
}
