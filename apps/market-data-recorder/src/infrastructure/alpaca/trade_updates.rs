//! Trade Updates Stream Source
//!
//! Account order events from `wss://paper-api.alpaca.markets/stream`
//! (paper) or `wss://api.alpaca.markets/stream` (live).
//!
//! The server has no per-symbol subscription; every account event is
//! delivered. Until the first subscription every symbol is recorded; after
//! that only subscribed symbols are, so removing the last one records
//! nothing.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use parking_lot::RwLock;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::auth::{AUTH_TIMEOUT, AuthHandler};
use super::codec::{CodecError, DecodedFrame, JsonCodec};
use super::heartbeat::{Heartbeat, HeartbeatConfig, HeartbeatEvent};
use super::messages::{ListenRequest, StreamMessage};
use super::normalize;
use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use super::session::{self, Session, SessionError, WsWrite};
use crate::application::ports::{StreamContext, StreamError, StreamSource};
use crate::domain::Symbol;
use crate::domain::streaming::{CaptureRecord, EventKind, StreamState};
use crate::infrastructure::config::{Credentials, RecorderConfig};
use crate::infrastructure::metrics;

/// Local symbol filter for account events.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SymbolFilter {
    /// No subscription made yet; record every symbol.
    #[default]
    All,
    /// Record only these symbols. May be empty.
    Only(BTreeSet<Symbol>),
}

impl SymbolFilter {
    /// Whether events for `symbol` pass.
    #[must_use]
    pub fn accepts(&self, symbol: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only(symbols) => symbols.contains(symbol),
        }
    }

    fn add(&mut self, symbols: &[Symbol]) {
        match self {
            Self::All => *self = Self::Only(symbols.iter().cloned().collect()),
            Self::Only(current) => current.extend(symbols.iter().cloned()),
        }
    }

    fn remove(&mut self, symbols: &[Symbol]) {
        match self {
            Self::All => *self = Self::Only(BTreeSet::new()),
            Self::Only(current) => {
                for symbol in symbols {
                    current.remove(symbol);
                }
            }
        }
    }
}

/// Account trade updates stream.
#[derive(Debug)]
pub struct TradeUpdatesSource {
    name: String,
    url: String,
    credentials: Credentials,
    heartbeat: HeartbeatConfig,
    reconnect: ReconnectConfig,
    codec: JsonCodec,
    filter: RwLock<SymbolFilter>,
}

impl TradeUpdatesSource {
    /// Stream name used in logs, metrics and reports.
    pub const NAME: &'static str = "trade_updates";

    /// Create a source for `url`.
    #[must_use]
    pub fn new(
        url: impl Into<String>,
        credentials: Credentials,
        heartbeat: HeartbeatConfig,
        reconnect: ReconnectConfig,
    ) -> Self {
        Self {
            name: Self::NAME.to_string(),
            url: url.into(),
            credentials,
            heartbeat,
            reconnect,
            codec: JsonCodec::new(),
            filter: RwLock::new(SymbolFilter::All),
        }
    }

    /// Create a source from recorder configuration.
    #[must_use]
    pub fn from_config(config: &RecorderConfig) -> Self {
        Self::new(
            config.trade_updates_url(),
            config.credentials.clone(),
            HeartbeatConfig::from(&config.websocket),
            ReconnectConfig::from(&config.websocket),
        )
    }

    /// Whether events for `symbol` are recorded.
    #[must_use]
    pub fn accepts(&self, symbol: &str) -> bool {
        self.filter.read().accepts(symbol)
    }

    async fn handle_frame(
        &self,
        decoded: Result<DecodedFrame, CodecError>,
        ctx: &StreamContext,
        write: &mut WsWrite,
        auth: &mut AuthHandler,
        policy: &mut ReconnectPolicy,
    ) -> Result<(), SessionError> {
        let frame = match decoded {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(stream = %self.name, error = %e, "Dropping undecodable frame");
                metrics::record_decode_error(&self.name);
                return Ok(());
            }
        };
        for error in frame.errors {
            tracing::warn!(stream = %self.name, error = %error, "Dropping undecodable message");
            metrics::record_decode_error(&self.name);
        }

        for message in frame.messages {
            match message {
                StreamMessage::Authorization(data) => {
                    auth.on_authorization(data.is_authorized()).map_err(|e| {
                        SessionError::Fatal(StreamError::Authentication(e.to_string()))
                    })?;
                    tracing::info!(stream = %self.name, "Authorized");
                    session::send_json(write, self.codec, &ListenRequest::trade_updates()).await?;
                }
                StreamMessage::Listening(data) => {
                    if data.streams.iter().any(|s| s == "trade_updates") {
                        tracing::info!(stream = %self.name, "Listening for trade updates");
                        ctx.transition(StreamState::Subscribed);
                        policy.reset();
                    }
                }
                StreamMessage::TradeUpdate(data) => {
                    let execution = match normalize::execution(*data, Utc::now()) {
                        Ok(execution) => execution,
                        Err(e) => {
                            tracing::warn!(stream = %self.name, error = %e, "Dropping trade update");
                            metrics::record_decode_error(&self.name);
                            continue;
                        }
                    };
                    if !self.accepts(&execution.symbol) {
                        continue;
                    }
                    metrics::record_event_received(EventKind::TradeUpdates);
                    tracing::debug!(
                        event = %execution.event,
                        symbol = %execution.symbol,
                        order_id = %execution.order_id,
                        "Trade update"
                    );
                    session::deliver(ctx, CaptureRecord::Execution(Box::new(execution))).await?;
                }
                StreamMessage::Error(error) if !auth.is_authenticated() => {
                    let auth_error = auth.on_error(&error);
                    if auth_error.is_fatal() {
                        return Err(SessionError::Fatal(StreamError::Authentication(
                            auth_error.to_string(),
                        )));
                    }
                    return Err(SessionError::retryable(auth_error));
                }
                other => {
                    tracing::trace!(stream = %self.name, message = ?other, "Ignoring message");
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Session for TradeUpdatesSource {
    async fn connect_and_run(
        &self,
        ctx: &StreamContext,
        cancel: &CancellationToken,
        policy: &mut ReconnectPolicy,
    ) -> Result<(), SessionError> {
        ctx.transition(StreamState::Connecting);
        let (mut write, mut read) = session::open(&self.url).await?;
        let mut auth = AuthHandler::new(self.credentials.clone());
        let request = auth.auth_request();
        session::send_json(&mut write, self.codec, &request).await?;

        let mut heartbeat = Heartbeat::new(self.heartbeat);
        let auth_deadline = tokio::time::sleep(AUTH_TIMEOUT);
        tokio::pin!(auth_deadline);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    session::close(&mut write, &mut read).await;
                    return Ok(());
                }
                () = &mut auth_deadline, if !auth.is_authenticated() => {
                    return Err(SessionError::retryable("authorization timed out"));
                }
                event = heartbeat.tick() => match event {
                    HeartbeatEvent::SendPing => session::send_ping(&mut write).await?,
                    HeartbeatEvent::TimedOut => {
                        return Err(SessionError::Retryable(format!(
                            "heartbeat timeout after {:?} of silence",
                            heartbeat.silence()
                        )));
                    }
                },
                frame = read.next() => {
                    heartbeat.record_activity();
                    match frame {
                        Some(Ok(Message::Binary(bytes))) => {
                            let decoded = self.codec.decode_bytes(&bytes);
                            self.handle_frame(decoded, ctx, &mut write, &mut auth, policy).await?;
                        }
                        Some(Ok(Message::Text(text))) => {
                            let decoded = self.codec.decode(text.as_str());
                            self.handle_frame(decoded, ctx, &mut write, &mut auth, policy).await?;
                        }
                        Some(Ok(ping @ Message::Ping(_))) => {
                            session::send_pong(&mut write, ping).await?;
                        }
                        Some(Ok(Message::Close(frame))) => {
                            return Err(SessionError::Retryable(format!("server closed connection: {frame:?}")));
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(SessionError::retryable(e)),
                        None => return Err(SessionError::retryable("stream ended")),
                    }
                }
            }
        }
    }
}

#[async_trait]
impl StreamSource for TradeUpdatesSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kinds(&self) -> Vec<EventKind> {
        vec![EventKind::TradeUpdates]
    }

    async fn subscribe(&self, kind: EventKind, symbols: &[Symbol]) -> Result<(), StreamError> {
        if kind != EventKind::TradeUpdates {
            return Err(StreamError::Unsupported(kind));
        }
        if !symbols.is_empty() {
            self.filter.write().add(symbols);
        }
        Ok(())
    }

    async fn unsubscribe(&self, kind: EventKind, symbols: &[Symbol]) -> Result<(), StreamError> {
        if kind != EventKind::TradeUpdates {
            return Err(StreamError::Unsupported(kind));
        }
        self.filter.write().remove(symbols);
        Ok(())
    }

    async fn run(&self, ctx: StreamContext, cancel: CancellationToken) -> Result<(), StreamError> {
        session::run_with_reconnect(self, &ctx, &cancel, self.reconnect.clone()).await
    }
}
