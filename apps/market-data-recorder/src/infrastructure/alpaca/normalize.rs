//! Wire to domain conversion.
//!
//! Pure functions from Alpaca payloads to the recorder's domain records.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use super::messages::{RestBar, StockQuoteMessage, StockTradeMessage, TradeUpdateData};
use crate::domain::history::Bar;
use crate::domain::streaming::{Execution, Quote, Trade};

/// A trade update field that does not hold a decimal.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("trade update field {field} is not a decimal: {value:?}")]
pub struct NormalizeError {
    /// Field name.
    pub field: &'static str,
    /// Raw value.
    pub value: String,
}

/// Stock stream quote to domain quote.
#[must_use]
pub fn quote(msg: StockQuoteMessage, received_at: DateTime<Utc>) -> Quote {
    Quote {
        symbol: msg.symbol,
        timestamp: msg.timestamp,
        ask_exchange: msg.ask_exchange,
        ask_price: msg.ask_price,
        ask_size: msg.ask_size,
        bid_exchange: msg.bid_exchange,
        bid_price: msg.bid_price,
        bid_size: msg.bid_size,
        conditions: msg.conditions,
        tape: msg.tape,
        received_at,
    }
}

/// Stock stream trade to domain trade.
#[must_use]
pub fn trade(msg: StockTradeMessage, received_at: DateTime<Utc>) -> Trade {
    Trade {
        symbol: msg.symbol,
        timestamp: msg.timestamp,
        exchange: msg.exchange,
        price: msg.price,
        size: msg.size,
        trade_id: msg.trade_id,
        conditions: msg.conditions,
        tape: msg.tape,
        received_at,
    }
}

/// Trade update to domain execution. A missing `filled_qty` reads as zero.
///
/// # Errors
///
/// Returns an error when a numeric field is present but not a decimal.
pub fn execution(
    data: TradeUpdateData,
    received_at: DateTime<Utc>,
) -> Result<Execution, NormalizeError> {
    let order = data.order;
    Ok(Execution {
        price: decimal("price", data.price.as_deref())?,
        qty: decimal("qty", data.qty.as_deref())?,
        position_qty: decimal("position_qty", data.position_qty.as_deref())?,
        filled_qty: decimal("filled_qty", order.filled_qty.as_deref())?.unwrap_or_default(),
        filled_avg_price: decimal("filled_avg_price", order.filled_avg_price.as_deref())?,
        event: data.event,
        timestamp: data.timestamp,
        order_id: order.id,
        client_order_id: order.client_order_id,
        symbol: order.symbol,
        side: order.side,
        order_type: order.order_type,
        status: order.status,
        received_at,
    })
}

/// REST bar to domain bar.
#[must_use]
pub fn bar(symbol: &str, raw: RestBar) -> Bar {
    Bar {
        symbol: symbol.to_string(),
        timestamp: raw.t,
        open: raw.o,
        high: raw.h,
        low: raw.l,
        close: raw.c,
        volume: raw.v,
        trade_count: raw.n,
        vwap: raw.vw,
    }
}

fn decimal(field: &'static str, raw: Option<&str>) -> Result<Option<Decimal>, NormalizeError> {
    match raw.map(str::trim) {
        None | Some("") => Ok(None),
        Some(value) => Decimal::from_str(value)
            .map(Some)
            .map_err(|_| NormalizeError {
                field,
                value: value.to_string(),
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::alpaca::messages::OrderDetails;

    fn update(price: Option<&str>, filled_qty: Option<&str>) -> TradeUpdateData {
        TradeUpdateData {
            event: "partial_fill".to_string(),
            order: OrderDetails {
                id: "order-1".to_string(),
                client_order_id: "client-1".to_string(),
                symbol: "AAPL".to_string(),
                side: "buy".to_string(),
                order_type: "limit".to_string(),
                qty: Some("10".to_string()),
                filled_qty: filled_qty.map(str::to_string),
                filled_avg_price: Some("179.05".to_string()),
                status: "partially_filled".to_string(),
            },
            timestamp: None,
            position_qty: Some("4".to_string()),
            price: price.map(str::to_string),
            qty: Some("4".to_string()),
        }
    }

    #[test]
    fn execution_parses_decimal_strings() {
        let exec = execution(update(Some("179.05"), Some("4")), Utc::now()).unwrap();
        assert_eq!(exec.price, Some(Decimal::new(17_905, 2)));
        assert_eq!(exec.filled_qty, Decimal::from(4));
        assert_eq!(exec.position_qty, Some(Decimal::from(4)));
        assert_eq!(exec.order_id, "order-1");
    }

    #[test]
    fn missing_filled_qty_is_zero() {
        let exec = execution(update(None, None), Utc::now()).unwrap();
        assert_eq!(exec.filled_qty, Decimal::ZERO);
        assert_eq!(exec.price, None);
    }

    #[test]
    fn garbage_decimal_is_rejected() {
        let err = execution(update(Some("abc"), Some("4")), Utc::now()).unwrap_err();
        assert_eq!(err.field, "price");
    }

    #[test]
    fn crossed_quote_survives_normalization() {
        let msg: StockQuoteMessage = serde_json::from_str(
            r#"{"T":"q","S":"XYZ","bx":"V","bp":10.05,"bs":1,"ax":"V","ap":10.00,"as":1,
                "t":"2024-03-11T14:30:00Z","c":[],"z":"C"}"#,
        )
        .unwrap();
        let q = quote(msg, Utc::now());
        assert!(q.is_crossed());
        assert_eq!(q.bid_price, Decimal::new(1005, 2));
    }

    #[test]
    fn rest_bar_maps_all_fields() {
        let raw: RestBar = serde_json::from_str(
            r#"{"t":"2024-01-02T05:00:00Z","o":187.15,"h":188.44,"l":183.885,"c":185.64,
                "v":82488674,"n":1009074,"vw":185.9465}"#,
        )
        .unwrap();
        let b = bar("AAPL", raw);
        assert_eq!(b.symbol, "AAPL");
        assert_eq!(b.volume, 82_488_674);
        assert_eq!(b.trade_count, Some(1_009_074));
        assert!(b.validate().is_ok());
    }
}
