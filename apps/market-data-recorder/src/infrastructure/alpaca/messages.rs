//! Alpaca Wire Types
//!
//! Serde types mirroring Alpaca's JSON payloads: the stock data stream, the
//! account trade updates stream and the historical bars REST endpoint.
//!
//! # Stock Stream Frames
//!
//! Every frame is a JSON array; each element carries a `T` discriminator:
//! `success`, `error`, `subscription`, `q` (quote), `t` (trade).
//!
//! # Trade Updates Frames
//!
//! Single objects discriminated by `stream`: `authorization`, `listening`,
//! `trade_updates`. Alpaca sends these as binary frames.
//!
//! # References
//!
//! - [Stock Streaming](https://docs.alpaca.markets/docs/real-time-stock-pricing-data)
//! - [Trade Updates](https://docs.alpaca.markets/docs/websocket-streaming)
//! - [Historical Bars](https://docs.alpaca.markets/reference/stockbars)

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// =============================================================================
// Control Messages
// =============================================================================

/// Success message indicating connection or authentication succeeded.
///
/// ```json
/// {"T": "success", "msg": "connected"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SuccessMessage {
    /// Success message: "connected" or "authenticated"
    pub msg: SuccessKind,
}

/// Kind of success message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SuccessKind {
    /// Initial connection established
    Connected,
    /// Authentication successful
    Authenticated,
}

/// Error message with code and description.
///
/// ```json
/// {"T": "error", "code": 402, "msg": "auth failed"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ErrorMessage {
    /// Error code
    pub code: i32,
    /// Error message
    pub msg: String,
}

/// Active subscriptions as acknowledged by the server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SubscriptionMessage {
    /// Subscribed trade symbols
    #[serde(default)]
    pub trades: Vec<String>,
    /// Subscribed quote symbols
    #[serde(default)]
    pub quotes: Vec<String>,
}

// =============================================================================
// Stock Stream Messages
// =============================================================================

/// Real-time stock quote.
///
/// ```json
/// {"T":"q","S":"AMD","bx":"U","bp":87.66,"bs":1,"ax":"Q","ap":87.68,"as":4,
///  "t":"2021-02-22T15:51:45.335689322Z","c":["R"],"z":"C"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StockQuoteMessage {
    /// Ticker symbol
    #[serde(rename = "S")]
    pub symbol: String,
    /// Bid exchange code
    #[serde(rename = "bx", default)]
    pub bid_exchange: String,
    /// Bid price
    #[serde(rename = "bp")]
    pub bid_price: Decimal,
    /// Bid size (round lots)
    #[serde(rename = "bs")]
    pub bid_size: u64,
    /// Ask exchange code
    #[serde(rename = "ax", default)]
    pub ask_exchange: String,
    /// Ask price
    #[serde(rename = "ap")]
    pub ask_price: Decimal,
    /// Ask size (round lots)
    #[serde(rename = "as")]
    pub ask_size: u64,
    /// Quote timestamp (RFC-3339, nanosecond precision)
    #[serde(rename = "t")]
    pub timestamp: DateTime<Utc>,
    /// Quote condition codes
    #[serde(rename = "c", default)]
    pub conditions: Vec<String>,
    /// Tape: "A", "B" or "C"
    #[serde(rename = "z", default)]
    pub tape: String,
}

/// Real-time stock trade.
///
/// ```json
/// {"T":"t","i":96921,"S":"AAPL","x":"D","p":126.55,"s":1,
///  "t":"2021-02-22T15:51:44.208Z","c":["@","I"],"z":"C"}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StockTradeMessage {
    /// Ticker symbol
    #[serde(rename = "S")]
    pub symbol: String,
    /// Trade ID (unique per exchange per day)
    #[serde(rename = "i")]
    pub trade_id: i64,
    /// Exchange code where the trade executed
    #[serde(rename = "x", default)]
    pub exchange: String,
    /// Trade price
    #[serde(rename = "p")]
    pub price: Decimal,
    /// Trade size (shares)
    #[serde(rename = "s")]
    pub size: u64,
    /// Trade timestamp (RFC-3339, nanosecond precision)
    #[serde(rename = "t")]
    pub timestamp: DateTime<Utc>,
    /// Trade condition codes
    #[serde(rename = "c", default)]
    pub conditions: Vec<String>,
    /// Tape: "A", "B" or "C"
    #[serde(rename = "z", default)]
    pub tape: String,
}

// =============================================================================
// Trade Updates Messages
// =============================================================================

/// Order fields carried by a trade update. Numeric fields arrive as strings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct OrderDetails {
    /// Broker order ID
    pub id: String,
    /// Client-provided order ID
    #[serde(default)]
    pub client_order_id: String,
    /// Ticker symbol
    pub symbol: String,
    /// "buy" or "sell"
    #[serde(default)]
    pub side: String,
    /// "market", "limit", ...
    #[serde(rename = "type", default)]
    pub order_type: String,
    /// Ordered quantity
    #[serde(default)]
    pub qty: Option<String>,
    /// Filled quantity so far
    #[serde(default)]
    pub filled_qty: Option<String>,
    /// Average fill price
    #[serde(default)]
    pub filled_avg_price: Option<String>,
    /// Order status after the event
    #[serde(default)]
    pub status: String,
}

/// Payload of a `trade_updates` frame.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TradeUpdateData {
    /// Event name: "new", "fill", "partial_fill", "canceled", ...
    pub event: String,
    /// Order state after the event
    pub order: OrderDetails,
    /// Event time
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    /// Position after a fill
    #[serde(default)]
    pub position_qty: Option<String>,
    /// Fill price
    #[serde(default)]
    pub price: Option<String>,
    /// Fill quantity
    #[serde(default)]
    pub qty: Option<String>,
}

/// Authorization result on the trade updates stream.
///
/// ```json
/// {"stream":"authorization","data":{"status":"authorized","action":"authenticate"}}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AuthorizationData {
    /// "authorized" or "unauthorized"
    pub status: String,
}

impl AuthorizationData {
    /// Whether the credentials were accepted.
    #[must_use]
    pub fn is_authorized(&self) -> bool {
        self.status == "authorized"
    }
}

/// Streams the server is now sending.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ListeningData {
    /// Stream names
    #[serde(default)]
    pub streams: Vec<String>,
}

// =============================================================================
// Outbound Messages
// =============================================================================

/// Authentication request, shared by both streams.
#[derive(Debug, Clone, Serialize)]
pub struct AuthRequest<'a> {
    /// Always "auth"
    pub action: &'static str,
    /// API key
    pub key: &'a str,
    /// API secret
    pub secret: &'a str,
}

impl<'a> AuthRequest<'a> {
    /// Build an auth request.
    #[must_use]
    pub const fn new(key: &'a str, secret: &'a str) -> Self {
        Self {
            action: "auth",
            key,
            secret,
        }
    }
}

/// Subscribe or unsubscribe request on the stock stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SubscriptionRequest {
    /// "subscribe" or "unsubscribe"
    pub action: &'static str,
    /// Trade symbols
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub trades: Vec<String>,
    /// Quote symbols
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub quotes: Vec<String>,
}

impl SubscriptionRequest {
    /// Empty subscribe request.
    #[must_use]
    pub fn subscribe() -> Self {
        Self {
            action: "subscribe",
            ..Default::default()
        }
    }

    /// Empty unsubscribe request.
    #[must_use]
    pub fn unsubscribe() -> Self {
        Self {
            action: "unsubscribe",
            ..Default::default()
        }
    }

    /// Whether the request names no symbols.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.trades.is_empty() && self.quotes.is_empty()
    }
}

/// Listen request on the trade updates stream.
#[derive(Debug, Clone, Serialize)]
pub struct ListenRequest {
    /// Always "listen"
    pub action: &'static str,
    /// Requested streams
    pub data: ListenData,
}

/// Body of a [`ListenRequest`].
#[derive(Debug, Clone, Serialize)]
pub struct ListenData {
    /// Stream names
    pub streams: Vec<&'static str>,
}

impl ListenRequest {
    /// Listen to `trade_updates`.
    #[must_use]
    pub fn trade_updates() -> Self {
        Self {
            action: "listen",
            data: ListenData {
                streams: vec!["trade_updates"],
            },
        }
    }
}

// =============================================================================
// Decoded Stream Messages
// =============================================================================

/// One decoded stream element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamMessage {
    /// Connection or authentication success
    Success(SuccessMessage),
    /// Server error
    Error(ErrorMessage),
    /// Subscription acknowledgement
    Subscription(SubscriptionMessage),
    /// Stock quote
    Quote(StockQuoteMessage),
    /// Stock trade
    Trade(StockTradeMessage),
    /// Trade updates authorization result
    Authorization(AuthorizationData),
    /// Trade updates listen acknowledgement
    Listening(ListeningData),
    /// Account order event
    TradeUpdate(Box<TradeUpdateData>),
    /// A message type the recorder does not capture
    Ignored(String),
}

// =============================================================================
// Historical Bars (REST)
// =============================================================================

/// One bar as returned by `GET /v2/stocks/bars`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RestBar {
    /// Bar start time
    pub t: DateTime<Utc>,
    /// Open
    pub o: Decimal,
    /// High
    pub h: Decimal,
    /// Low
    pub l: Decimal,
    /// Close
    pub c: Decimal,
    /// Volume
    pub v: u64,
    /// Trade count
    #[serde(default)]
    pub n: Option<u64>,
    /// Volume-weighted average price
    #[serde(default)]
    pub vw: Option<Decimal>,
}

/// One page of the multi-symbol bars endpoint.
///
/// `bars` is required but may be `null` or `{}`; `next_page_token` is absent
/// or `null` on the final page.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BarsResponse {
    /// Bars keyed by symbol. The key must be present even when null.
    #[serde(deserialize_with = "Option::deserialize")]
    pub bars: Option<HashMap<String, Vec<RestBar>>>,
    /// Continuation cursor
    #[serde(default)]
    pub next_page_token: Option<String>,
}
