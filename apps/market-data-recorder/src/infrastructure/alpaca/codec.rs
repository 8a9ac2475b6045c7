//! Stream Codec
//!
//! Decodes Alpaca's JSON stream frames into [`StreamMessage`]s and encodes
//! outbound requests.
//!
//! A frame is either an array of `T`-tagged elements (stock stream) or a
//! single `stream`-tagged object (trade updates). Elements decode
//! independently: one bad element does not discard the rest of its frame.

use serde_json::Value;

use super::messages::{
    AuthorizationData, ErrorMessage, ListeningData, StockQuoteMessage, StockTradeMessage,
    StreamMessage, SubscriptionMessage, SuccessMessage, TradeUpdateData,
};

/// Codec errors.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// JSON encoding/decoding failed.
    #[error("JSON codec error: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame is neither an array nor an object.
    #[error("invalid frame: {0}")]
    InvalidFormat(String),

    /// Object without a `T` or `stream` discriminator.
    #[error("message has no type discriminator")]
    MissingType,

    /// `stream` frame without a `data` body.
    #[error("{0} frame has no data")]
    MissingData(String),
}

/// The elements of one frame. Elements that failed to decode are kept as
/// errors alongside the ones that succeeded.
#[derive(Debug, Default)]
pub struct DecodedFrame {
    /// Successfully decoded elements, in frame order.
    pub messages: Vec<StreamMessage>,
    /// Per-element failures.
    pub errors: Vec<CodecError>,
}

/// JSON codec for the stock and trade updates streams.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonCodec;

impl JsonCodec {
    /// Create a new JSON codec.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Decode one text frame.
    ///
    /// # Errors
    ///
    /// Returns an error when the frame itself is not valid JSON or is not an
    /// array or object.
    pub fn decode(&self, text: &str) -> Result<DecodedFrame, CodecError> {
        let value: Value = serde_json::from_str(text.trim())?;
        let elements = match value {
            Value::Array(items) => items,
            object @ Value::Object(_) => vec![object],
            other => {
                let preview: String = other.to_string().chars().take(50).collect();
                return Err(CodecError::InvalidFormat(preview));
            }
        };

        let mut frame = DecodedFrame::default();
        for element in elements {
            match Self::decode_element(element) {
                Ok(message) => frame.messages.push(message),
                Err(e) => frame.errors.push(e),
            }
        }
        Ok(frame)
    }

    /// Decode one binary frame. Trade updates arrive as UTF-8 JSON in binary
    /// frames.
    ///
    /// # Errors
    ///
    /// Returns an error when the bytes are not valid UTF-8 JSON.
    pub fn decode_bytes(&self, bytes: &[u8]) -> Result<DecodedFrame, CodecError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| CodecError::InvalidFormat(format!("binary frame is not UTF-8: {e}")))?;
        self.decode(text)
    }

    fn decode_element(value: Value) -> Result<StreamMessage, CodecError> {
        if let Some(tag) = value.get("T").and_then(Value::as_str) {
            let message = match tag {
                "success" => StreamMessage::Success(serde_json::from_value::<SuccessMessage>(value)?),
                "error" => StreamMessage::Error(serde_json::from_value::<ErrorMessage>(value)?),
                "subscription" => {
                    StreamMessage::Subscription(serde_json::from_value::<SubscriptionMessage>(value)?)
                }
                "q" => StreamMessage::Quote(serde_json::from_value::<StockQuoteMessage>(value)?),
                "t" => StreamMessage::Trade(serde_json::from_value::<StockTradeMessage>(value)?),
                other => StreamMessage::Ignored(other.to_string()),
            };
            return Ok(message);
        }

        let Some(stream) = value.get("stream").and_then(Value::as_str).map(str::to_string) else {
            return Err(CodecError::MissingType);
        };
        let data = match value {
            Value::Object(mut map) => map.remove("data"),
            _ => None,
        }
        .ok_or_else(|| CodecError::MissingData(stream.clone()))?;

        let message = match stream.as_str() {
            "authorization" => {
                StreamMessage::Authorization(serde_json::from_value::<AuthorizationData>(data)?)
            }
            "listening" => StreamMessage::Listening(serde_json::from_value::<ListeningData>(data)?),
            "trade_updates" => StreamMessage::TradeUpdate(Box::new(
                serde_json::from_value::<TradeUpdateData>(data)?,
            )),
            _ => StreamMessage::Ignored(stream),
        };
        Ok(message)
    }

    /// Encode a request as a JSON string.
    ///
    /// # Errors
    ///
    /// Returns an error if JSON serialization fails.
    pub fn encode<T: serde::Serialize>(&self, value: &T) -> Result<String, CodecError> {
        Ok(serde_json::to_string(value)?)
    }
}
