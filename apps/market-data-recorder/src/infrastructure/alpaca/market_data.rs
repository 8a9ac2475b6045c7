//! Stock Data Stream Source
//!
//! Quotes and trades over one connection to
//! `wss://stream.data.alpaca.markets/v2/{feed}`. Both kinds share the
//! connection; each is routed to its own capture log.
//!
//! Subscriptions live in a desired set. Changes are pushed to the live
//! connection as a diff against what the server last acknowledged, and the
//! whole set is replayed after every reconnect.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use parking_lot::RwLock;
use tokio::sync::Notify;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::auth::{AUTH_TIMEOUT, AuthHandler};
use super::codec::{CodecError, DecodedFrame, JsonCodec};
use super::heartbeat::{Heartbeat, HeartbeatConfig, HeartbeatEvent};
use super::messages::{StreamMessage, SubscriptionRequest};
use super::normalize;
use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use super::session::{self, Session, SessionError, WsWrite};
use crate::application::ports::{StreamContext, StreamError, StreamSource};
use crate::domain::Symbol;
use crate::domain::streaming::{CaptureRecord, EventKind, StreamState};
use crate::infrastructure::config::{Credentials, RecorderConfig};
use crate::infrastructure::metrics;

// =============================================================================
// Subscription Set
// =============================================================================

/// Quote and trade symbols.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionSet {
    quotes: BTreeSet<Symbol>,
    trades: BTreeSet<Symbol>,
}

impl SubscriptionSet {
    fn symbols_mut(&mut self, kind: EventKind) -> Result<&mut BTreeSet<Symbol>, StreamError> {
        match kind {
            EventKind::Quotes => Ok(&mut self.quotes),
            EventKind::Trades => Ok(&mut self.trades),
            EventKind::TradeUpdates => Err(StreamError::Unsupported(kind)),
        }
    }

    /// Add symbols for `kind`.
    ///
    /// # Errors
    ///
    /// Returns `Unsupported` for trade updates.
    pub fn add(&mut self, kind: EventKind, symbols: &[Symbol]) -> Result<(), StreamError> {
        self.symbols_mut(kind)?.extend(symbols.iter().cloned());
        Ok(())
    }

    /// Remove symbols for `kind`.
    ///
    /// # Errors
    ///
    /// Returns `Unsupported` for trade updates.
    pub fn remove(&mut self, kind: EventKind, symbols: &[Symbol]) -> Result<(), StreamError> {
        let set = self.symbols_mut(kind)?;
        for symbol in symbols {
            set.remove(symbol);
        }
        Ok(())
    }

    /// Whether no symbols are subscribed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.quotes.is_empty() && self.trades.is_empty()
    }

    /// Subscribe and unsubscribe requests that turn `current` into `self`.
    #[must_use]
    pub fn changes_from(&self, current: &Self) -> (SubscriptionRequest, SubscriptionRequest) {
        let mut subscribe = SubscriptionRequest::subscribe();
        subscribe.quotes = self.quotes.difference(&current.quotes).cloned().collect();
        subscribe.trades = self.trades.difference(&current.trades).cloned().collect();

        let mut unsubscribe = SubscriptionRequest::unsubscribe();
        unsubscribe.quotes = current.quotes.difference(&self.quotes).cloned().collect();
        unsubscribe.trades = current.trades.difference(&self.trades).cloned().collect();

        (subscribe, unsubscribe)
    }
}

// =============================================================================
// Source
// =============================================================================

/// Quotes and trades stream.
#[derive(Debug)]
pub struct MarketDataSource {
    name: String,
    url: String,
    credentials: Credentials,
    heartbeat: HeartbeatConfig,
    reconnect: ReconnectConfig,
    codec: JsonCodec,
    desired: RwLock<SubscriptionSet>,
    changed: Notify,
}

impl MarketDataSource {
    /// Stream name used in logs, metrics and reports.
    pub const NAME: &'static str = "market_data";

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
            desired: RwLock::new(SubscriptionSet::default()),
            changed: Notify::new(),
        }
    }

    /// Create a source from recorder configuration.
    #[must_use]
    pub fn from_config(config: &RecorderConfig) -> Self {
        Self::new(
            config.stock_stream_url(),
            config.credentials.clone(),
            HeartbeatConfig::from(&config.websocket),
            ReconnectConfig::from(&config.websocket),
        )
    }

    /// Current desired subscriptions.
    #[must_use]
    pub fn subscriptions(&self) -> SubscriptionSet {
        self.desired.read().clone()
    }

    async fn sync(
        &self,
        write: &mut WsWrite,
        active: &mut SubscriptionSet,
    ) -> Result<(), SessionError> {
        let desired = self.subscriptions();
        let (subscribe, unsubscribe) = desired.changes_from(active);
        if !unsubscribe.is_empty() {
            tracing::debug!(quotes = ?unsubscribe.quotes, trades = ?unsubscribe.trades, "Unsubscribing");
            session::send_json(write, self.codec, &unsubscribe).await?;
        }
        if !subscribe.is_empty() {
            tracing::debug!(quotes = ?subscribe.quotes, trades = ?subscribe.trades, "Subscribing");
            session::send_json(write, self.codec, &subscribe).await?;
        }
        *active = desired;
        Ok(())
    }

    async fn handle_frame(
        &self,
        frame: DecodedFrame,
        ctx: &StreamContext,
        conn: &mut Connection,
        policy: &mut ReconnectPolicy,
    ) -> Result<(), SessionError> {
        for error in frame.errors {
            tracing::warn!(stream = %self.name, error = %error, "Dropping undecodable message");
            metrics::record_decode_error(&self.name);
        }

        for message in frame.messages {
            match message {
                StreamMessage::Success(success) => {
                    if conn.auth.on_success(success.msg) {
                        let request = conn.auth.auth_request();
                        session::send_json(&mut conn.write, self.codec, &request).await?;
                    } else if conn.auth.is_authenticated() {
                        tracing::info!(stream = %self.name, "Authenticated");
                        self.sync(&mut conn.write, &mut conn.active).await?;
                        ctx.transition(StreamState::Subscribed);
                        policy.reset();
                    }
                }
                StreamMessage::Error(error) => {
                    if conn.auth.is_authenticated() {
                        tracing::warn!(stream = %self.name, code = error.code, msg = %error.msg, "Stream error");
                        continue;
                    }
                    let auth_error = conn.auth.on_error(&error);
                    if auth_error.is_fatal() {
                        return Err(SessionError::Fatal(StreamError::Authentication(
                            auth_error.to_string(),
                        )));
                    }
                    return Err(SessionError::retryable(auth_error));
                }
                StreamMessage::Subscription(ack) => {
                    tracing::info!(
                        stream = %self.name,
                        quotes = ?ack.quotes,
                        trades = ?ack.trades,
                        "Subscription confirmed"
                    );
                }
                StreamMessage::Quote(raw) => {
                    let quote = normalize::quote(raw, Utc::now());
                    metrics::record_event_received(EventKind::Quotes);
                    if quote.is_crossed() {
                        metrics::record_crossed_quote();
                        tracing::debug!(
                            symbol = %quote.symbol,
                            bid = %quote.bid_price,
                            ask = %quote.ask_price,
                            "Crossed quote"
                        );
                    }
                    session::deliver(ctx, CaptureRecord::Quote(quote)).await?;
                }
                StreamMessage::Trade(raw) => {
                    metrics::record_event_received(EventKind::Trades);
                    let trade = normalize::trade(raw, Utc::now());
                    session::deliver(ctx, CaptureRecord::Trade(trade)).await?;
                }
                other => {
                    tracing::trace!(stream = %self.name, message = ?other, "Ignoring message");
                }
            }
        }
        Ok(())
    }
}

/// Per-connection state.
struct Connection {
    write: WsWrite,
    auth: AuthHandler,
    active: SubscriptionSet,
}

#[async_trait]
impl Session for MarketDataSource {
    async fn connect_and_run(
        &self,
        ctx: &StreamContext,
        cancel: &CancellationToken,
        policy: &mut ReconnectPolicy,
    ) -> Result<(), SessionError> {
        ctx.transition(StreamState::Connecting);
        let (write, mut read) = session::open(&self.url).await?;
        let mut conn = Connection {
            write,
            auth: AuthHandler::new(self.credentials.clone()),
            active: SubscriptionSet::default(),
        };
        let mut heartbeat = Heartbeat::new(self.heartbeat);
        let auth_deadline = tokio::time::sleep(AUTH_TIMEOUT);
        tokio::pin!(auth_deadline);

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    let (_, unsubscribe) = SubscriptionSet::default().changes_from(&conn.active);
                    if !unsubscribe.is_empty() {
                        if let Err(e) =
                            session::send_json(&mut conn.write, self.codec, &unsubscribe).await
                        {
                            tracing::debug!(error = ?e, "Unsubscribe on shutdown not sent");
                        }
                    }
                    session::close(&mut conn.write, &mut read).await;
                    return Ok(());
                }
                () = &mut auth_deadline, if !conn.auth.is_authenticated() => {
                    return Err(SessionError::retryable("authentication timed out"));
                }
                () = self.changed.notified(), if conn.auth.is_authenticated() => {
                    self.sync(&mut conn.write, &mut conn.active).await?;
                }
                event = heartbeat.tick() => match event {
                    HeartbeatEvent::SendPing => session::send_ping(&mut conn.write).await?,
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
                        Some(Ok(Message::Text(text))) => {
                            let decoded = self.codec.decode(text.as_str());
                            self.handle_decoded(decoded, ctx, &mut conn, policy).await?;
                        }
                        Some(Ok(Message::Binary(bytes))) => {
                            let decoded = self.codec.decode_bytes(&bytes);
                            self.handle_decoded(decoded, ctx, &mut conn, policy).await?;
                        }
                        Some(Ok(ping @ Message::Ping(_))) => {
                            session::send_pong(&mut conn.write, ping).await?;
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

impl MarketDataSource {
    async fn handle_decoded(
        &self,
        decoded: Result<DecodedFrame, CodecError>,
        ctx: &StreamContext,
        conn: &mut Connection,
        policy: &mut ReconnectPolicy,
    ) -> Result<(), SessionError> {
        match decoded {
            Ok(frame) => self.handle_frame(frame, ctx, conn, policy).await,
            Err(e) => {
                tracing::warn!(stream = %self.name, error = %e, "Dropping undecodable frame");
                metrics::record_decode_error(&self.name);
                Ok(())
            }
        }
    }
}

#[async_trait]
impl StreamSource for MarketDataSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kinds(&self) -> Vec<EventKind> {
        vec![EventKind::Quotes, EventKind::Trades]
    }

    async fn subscribe(&self, kind: EventKind, symbols: &[Symbol]) -> Result<(), StreamError> {
        self.desired.write().add(kind, symbols)?;
        self.changed.notify_one();
        Ok(())
    }

    async fn unsubscribe(&self, kind: EventKind, symbols: &[Symbol]) -> Result<(), StreamError> {
        self.desired.write().remove(kind, symbols)?;
        self.changed.notify_one();
        Ok(())
    }

    async fn run(&self, ctx: StreamContext, cancel: CancellationToken) -> Result<(), StreamError> {
        session::run_with_reconnect(self, &ctx, &cancel, self.reconnect.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    use futures_util::SinkExt;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    fn symbols(list: &[&str]) -> Vec<Symbol> {
        list.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn changes_from_computes_both_directions() {
        let mut current = SubscriptionSet::default();
        current.add(EventKind::Quotes, &symbols(&["AAPL", "MSFT"])).unwrap();

        let mut desired = SubscriptionSet::default();
        desired.add(EventKind::Quotes, &symbols(&["AAPL", "TSLA"])).unwrap();
        desired.add(EventKind::Trades, &symbols(&["AAPL"])).unwrap();

        let (subscribe, unsubscribe) = desired.changes_from(&current);
        assert_eq!(subscribe.quotes, vec!["TSLA"]);
        assert_eq!(subscribe.trades, vec!["AAPL"]);
        assert_eq!(unsubscribe.quotes, vec!["MSFT"]);
        assert!(unsubscribe.trades.is_empty());
    }

    #[test]
    fn trade_updates_are_unsupported() {
        let mut set = SubscriptionSet::default();
        assert_eq!(
            set.add(EventKind::TradeUpdates, &symbols(&["AAPL"])),
            Err(StreamError::Unsupported(EventKind::TradeUpdates))
        );
    }

    #[tokio::test]
    async fn subscribe_updates_desired_set() {
        let source = MarketDataSource::new(
            "ws://127.0.0.1:1",
            Credentials::new("k".to_string(), "s".to_string()),
            HeartbeatConfig::default(),
            ReconnectConfig::default(),
        );
        source
            .subscribe(EventKind::Quotes, &symbols(&["AAPL", "MSFT"]))
            .await
            .unwrap();
        source
            .unsubscribe(EventKind::Quotes, &symbols(&["MSFT"]))
            .await
            .unwrap();
        let (subscribe, _) = source.subscriptions().changes_from(&SubscriptionSet::default());
        assert_eq!(subscribe.quotes, vec!["AAPL"]);
    }

    /// Scripted stock stream server: greets, authenticates, acknowledges the
    /// subscription, sends one quote and one trade, then records every text
    /// frame it receives until the client closes.
    async fn serve_once(listener: TcpListener, seen: mpsc::UnboundedSender<String>) {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        ws.send(Message::Text(r#"[{"T":"success","msg":"connected"}]"#.into()))
            .await
            .unwrap();

        while let Some(Ok(message)) = ws.next().await {
            match message {
                Message::Text(text) => {
                    let text = text.as_str().to_string();
                    let _ = seen.send(text.clone());
                    if text.contains(r#""action":"auth""#) {
                        ws.send(Message::Text(r#"[{"T":"success","msg":"authenticated"}]"#.into()))
                            .await
                            .unwrap();
                    } else if text.contains(r#""action":"subscribe""#) {
                        ws.send(Message::Text(
                            r#"[{"T":"subscription","quotes":["AAPL"],"trades":["AAPL"]},
                                {"T":"q","S":"AAPL","bx":"V","bp":185.10,"bs":3,"ax":"V","ap":185.12,"as":2,"t":"2024-03-11T14:30:00.5Z","c":["R"],"z":"C"},
                                {"T":"t","S":"AAPL","i":7,"x":"V","p":185.11,"s":100,"t":"2024-03-11T14:30:00.6Z","c":["@"],"z":"C"}]"#
                                .into(),
                        ))
                        .await
                        .unwrap();
                    }
                }
                Message::Close(_) => {
                    let _ = seen.send("<close>".to_string());
                    break;
                }
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn captures_and_closes_cleanly() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel();
        let server = tokio::spawn(serve_once(listener, seen_tx));

        let source = Arc::new(MarketDataSource::new(
            url,
            Credentials::new("key".to_string(), "secret".to_string()),
            HeartbeatConfig::default(),
            ReconnectConfig::default(),
        ));
        source
            .subscribe(EventKind::Quotes, &symbols(&["AAPL"]))
            .await
            .unwrap();
        source
            .subscribe(EventKind::Trades, &symbols(&["AAPL"]))
            .await
            .unwrap();

        let (quotes_tx, mut quotes_rx) = mpsc::channel(8);
        let (trades_tx, mut trades_rx) = mpsc::channel(8);
        let state = Arc::new(RwLock::new(StreamState::Disconnected));
        let ctx = StreamContext::new(
            MarketDataSource::NAME,
            Arc::clone(&state),
            HashMap::from([(EventKind::Quotes, quotes_tx), (EventKind::Trades, trades_tx)]),
        );
        let cancel = CancellationToken::new();
        let run = tokio::spawn({
            let source = Arc::clone(&source);
            let cancel = cancel.clone();
            async move { source.run(ctx, cancel).await }
        });

        let quote = tokio::time::timeout(Duration::from_secs(5), quotes_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(quote, CaptureRecord::Quote(q) if q.symbol == "AAPL"));
        let trade = tokio::time::timeout(Duration::from_secs(5), trades_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(trade, CaptureRecord::Trade(t) if t.trade_id == 7));
        assert_eq!(*state.read(), StreamState::Subscribed);

        *state.write() = StreamState::Draining;
        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Ok(()));
        server.await.unwrap();

        let mut frames = Vec::new();
        while let Ok(frame) = seen_rx.try_recv() {
            frames.push(frame);
        }
        assert!(frames[0].contains(r#""action":"auth""#));
        assert!(frames[1].contains(r#""action":"subscribe""#));
        assert!(frames.iter().any(|f| f.contains(r#""action":"unsubscribe""#)));
        assert_eq!(frames.last().map(String::as_str), Some("<close>"));
    }
}
