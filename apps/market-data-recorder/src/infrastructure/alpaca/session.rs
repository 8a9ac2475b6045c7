//! WebSocket Session Plumbing
//!
//! The reconnect loop and connection helpers shared by the stock data and
//! trade updates sources. A source implements [`Session`] for one
//! connection's lifetime; [`run_with_reconnect`] wraps it with backoff and
//! the stream state transitions.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::auth::AUTH_TIMEOUT;
use super::codec::JsonCodec;
use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use crate::application::ports::{StreamContext, StreamError};
use crate::domain::streaming::{CaptureRecord, StreamState};
use crate::infrastructure::metrics;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Outbound half of a connection.
pub type WsWrite = SplitSink<WsStream, Message>;

/// Inbound half of a connection.
pub type WsRead = SplitStream<WsStream>;

/// How long to wait for the server's close acknowledgement.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Why a connection ended.
#[derive(Debug)]
pub enum SessionError {
    /// The connection failed; a reconnect may succeed.
    Retryable(String),
    /// Reconnecting cannot help.
    Fatal(StreamError),
}

impl SessionError {
    /// Retryable failure from any displayable cause.
    pub fn retryable(e: impl std::fmt::Display) -> Self {
        Self::Retryable(e.to_string())
    }
}

/// One connection's lifetime.
#[async_trait]
pub trait Session: Send + Sync {
    /// Connect, authenticate, subscribe and receive until `cancel` fires
    /// (`Ok`) or the connection fails. Resets `policy` once subscribed.
    async fn connect_and_run(
        &self,
        ctx: &StreamContext,
        cancel: &CancellationToken,
        policy: &mut ReconnectPolicy,
    ) -> Result<(), SessionError>;
}

/// Drive `session` until cancelled, reconnecting with backoff.
///
/// # Errors
///
/// Returns the fatal error of the last connection, or `ReconnectExhausted`
/// once the attempt budget is spent.
pub async fn run_with_reconnect<S: Session + ?Sized>(
    session: &S,
    ctx: &StreamContext,
    cancel: &CancellationToken,
    config: ReconnectConfig,
) -> Result<(), StreamError> {
    let mut policy = ReconnectPolicy::new(config);

    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }

        match session.connect_and_run(ctx, cancel, &mut policy).await {
            Ok(()) => {
                tracing::info!(stream = %ctx.name(), "Stream closed");
                return Ok(());
            }
            Err(SessionError::Fatal(e)) => {
                tracing::error!(stream = %ctx.name(), error = %e, "Stream failed");
                return Err(e);
            }
            Err(SessionError::Retryable(reason)) => {
                ctx.transition(StreamState::Disconnected);

                let Some(delay) = policy.next_delay() else {
                    let attempts = policy.attempts();
                    tracing::error!(
                        stream = %ctx.name(),
                        attempts,
                        reason = %reason,
                        "Reconnect attempts exhausted"
                    );
                    return Err(StreamError::ReconnectExhausted { attempts });
                };

                metrics::record_reconnect(ctx.name());
                tracing::warn!(
                    stream = %ctx.name(),
                    reason = %reason,
                    attempt = policy.attempts(),
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Stream connection lost, reconnecting"
                );

                tokio::select! {
                    () = cancel.cancelled() => return Ok(()),
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

/// Open a WebSocket connection.
///
/// # Errors
///
/// Returns `Retryable` when the handshake fails or takes longer than the
/// authentication window.
pub async fn open(url: &str) -> Result<(WsWrite, WsRead), SessionError> {
    tracing::info!(url = %url, "Connecting");
    let (ws, _response) = tokio::time::timeout(AUTH_TIMEOUT, tokio_tungstenite::connect_async(url))
        .await
        .map_err(|_| SessionError::Retryable("connect timed out".to_string()))?
        .map_err(SessionError::retryable)?;
    Ok(ws.split())
}

/// Serialize and send one request.
///
/// # Errors
///
/// Returns `Retryable` when the socket write fails.
pub async fn send_json<T: serde::Serialize + Sync>(
    write: &mut WsWrite,
    codec: JsonCodec,
    value: &T,
) -> Result<(), SessionError> {
    let text = codec
        .encode(value)
        .map_err(|e| SessionError::Fatal(StreamError::ConnectionLost(e.to_string())))?;
    write
        .send(Message::Text(text.into()))
        .await
        .map_err(SessionError::retryable)
}

/// Send a ping frame.
///
/// # Errors
///
/// Returns `Retryable` when the socket write fails.
pub async fn send_ping(write: &mut WsWrite) -> Result<(), SessionError> {
    write
        .send(Message::Ping(Vec::new().into()))
        .await
        .map_err(SessionError::retryable)
}

/// Answer a server ping.
///
/// # Errors
///
/// Returns `Retryable` when the socket write fails.
pub async fn send_pong(write: &mut WsWrite, payload: Message) -> Result<(), SessionError> {
    if let Message::Ping(data) = payload {
        write
            .send(Message::Pong(data))
            .await
            .map_err(SessionError::retryable)?;
    }
    Ok(())
}

/// Send a close frame and wait briefly for the server to acknowledge it.
pub async fn close(write: &mut WsWrite, read: &mut WsRead) {
    if let Err(e) = write.send(Message::Close(None)).await {
        tracing::debug!(error = %e, "Close frame not sent");
        return;
    }
    let acknowledged = tokio::time::timeout(CLOSE_GRACE, async {
        while let Some(Ok(message)) = read.next().await {
            if message.is_close() {
                break;
            }
        }
    })
    .await;
    if acknowledged.is_err() {
        tracing::debug!("Server did not acknowledge close");
    }
}

/// Hand a record to its writer. A kind with no log attached is skipped.
///
/// # Errors
///
/// Returns `Fatal` when the writer is gone.
pub async fn deliver(ctx: &StreamContext, record: CaptureRecord) -> Result<(), SessionError> {
    match ctx.deliver(record).await {
        Ok(()) => Ok(()),
        Err(StreamError::Unrouted(kind)) => {
            tracing::trace!(stream = %ctx.name(), kind = %kind, "No log attached, skipping");
            Ok(())
        }
        Err(e) => Err(SessionError::Fatal(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use parking_lot::RwLock;

    struct FlakySession {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl Session for FlakySession {
        async fn connect_and_run(
            &self,
            ctx: &StreamContext,
            _cancel: &CancellationToken,
            _policy: &mut ReconnectPolicy,
        ) -> Result<(), SessionError> {
            ctx.transition(StreamState::Connecting);
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(SessionError::Retryable("refused".to_string()));
            }
            Ok(())
        }
    }

    fn context() -> StreamContext {
        StreamContext::new(
            "test",
            Arc::new(RwLock::new(StreamState::Disconnected)),
            HashMap::new(),
        )
    }

    fn config(max_attempts: u32) -> ReconnectConfig {
        ReconnectConfig {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            multiplier: 2.0,
            jitter_factor: 0.0,
            max_attempts,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn recovers_after_transient_failures() {
        let session = FlakySession {
            calls: AtomicU32::new(0),
            fail_first: 2,
        };
        let result =
            run_with_reconnect(&session, &context(), &CancellationToken::new(), config(5)).await;
        assert_eq!(result, Ok(()));
        assert_eq!(session.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_budget() {
        let session = FlakySession {
            calls: AtomicU32::new(0),
            fail_first: u32::MAX,
        };
        let ctx = context();
        let result = run_with_reconnect(&session, &ctx, &CancellationToken::new(), config(3)).await;
        assert_eq!(result, Err(StreamError::ReconnectExhausted { attempts: 3 }));
        assert_eq!(session.calls.load(Ordering::SeqCst), 4);
        assert_eq!(ctx.state(), StreamState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_during_backoff_returns_ok() {
        let session = FlakySession {
            calls: AtomicU32::new(0),
            fail_first: u32::MAX,
        };
        let cancel = CancellationToken::new();
        let ctx = context();
        let run = run_with_reconnect(
            &session,
            &ctx,
            &cancel,
            ReconnectConfig {
                initial_delay: Duration::from_secs(60),
                ..config(0)
            },
        );
        tokio::pin!(run);

        tokio::select! {
            _ = &mut run => panic!("should be backing off"),
            () = tokio::time::sleep(Duration::from_secs(1)) => {}
        }
        cancel.cancel();
        assert_eq!(run.await, Ok(()));
    }
}
