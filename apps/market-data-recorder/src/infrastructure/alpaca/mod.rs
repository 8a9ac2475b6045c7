//! Alpaca Adapters
//!
//! Clients for Alpaca's market data and trading APIs:
//!
//! - **Bars**: historical OHLCV pages over REST
//! - **Market data**: stock quotes and trades over WebSocket (JSON codec)
//! - **Trade updates**: account order events over WebSocket (JSON codec)
//!
//! Vendor payloads are converted to domain records in [`normalize`]; nothing
//! outside this module sees Alpaca wire types.

pub mod auth;
pub mod bars;
pub mod codec;
pub mod heartbeat;
pub mod market_data;
pub mod messages;
pub mod normalize;
pub mod reconnect;
pub mod session;
pub mod trade_updates;

pub use auth::{AuthError, AuthHandler, AuthState};
pub use bars::AlpacaBarsClient;
pub use codec::{CodecError, DecodedFrame, JsonCodec};
pub use heartbeat::{Heartbeat, HeartbeatConfig, HeartbeatEvent};
pub use market_data::{MarketDataSource, SubscriptionSet};
pub use normalize::NormalizeError;
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
pub use session::SessionError;
pub use trade_updates::{SymbolFilter, TradeUpdatesSource};
