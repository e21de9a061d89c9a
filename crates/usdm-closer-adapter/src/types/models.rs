/*
[INPUT]:  Parsed REST and WebSocket payloads
[OUTPUT]: Shared data contracts crossing the adapter/executor boundary
[POS]:    Type layer - core models
[UPDATE]: When module contracts change shape
*/

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::enums::{OrderStatus, OrderType, PositionSide, Side, TimeInForce};

/// Per-instrument precision and minimum constraints. Immutable once loaded;
/// replaced wholesale by REST calibration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentRule {
    pub symbol: String,
    pub tick_size: Decimal,
    pub step_size: Decimal,
    pub min_qty: Decimal,
    pub min_notional: Decimal,
}

/// Hedge-mode position snapshot. `position_amt` is signed: long positive,
/// short negative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Position {
    pub symbol: String,
    pub position_side: PositionSide,
    pub position_amt: Decimal,
    pub entry_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub leverage: u32,
    pub mark_price: Option<Decimal>,
    pub liquidation_price: Option<Decimal>,
}

/// What we want the exchange to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderIntent {
    pub symbol: String,
    pub side: Side,
    pub position_side: PositionSide,
    pub qty: Decimal,
    pub price: Option<Decimal>,
    pub stop_price: Option<Decimal>,
    pub order_type: OrderType,
    pub time_in_force: TimeInForce,
    pub reduce_only: bool,
    pub close_position: bool,
    pub client_order_id: Option<String>,
    /// Risk intents (panic close, protective stop) bypass the soft limiters.
    pub is_risk: bool,
}

impl OrderIntent {
    pub fn limit(
        symbol: impl Into<String>,
        side: Side,
        position_side: PositionSide,
        qty: Decimal,
        price: Decimal,
        time_in_force: TimeInForce,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            position_side,
            qty,
            price: Some(price),
            stop_price: None,
            order_type: OrderType::Limit,
            time_in_force,
            reduce_only: true,
            close_position: false,
            client_order_id: None,
            is_risk: false,
        }
    }

    pub fn stop_market_close(
        symbol: impl Into<String>,
        position_side: PositionSide,
        stop_price: Decimal,
        client_order_id: String,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            side: position_side.closing_side(),
            position_side,
            qty: Decimal::ZERO,
            price: None,
            stop_price: Some(stop_price),
            order_type: OrderType::StopMarket,
            time_in_force: TimeInForce::Gtc,
            reduce_only: true,
            close_position: true,
            client_order_id: Some(client_order_id),
            is_risk: true,
        }
    }
}

/// Outcome of a placement or cancellation. Expected exchange rejections are
/// carried here rather than raised.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OrderResult {
    pub success: bool,
    pub order_id: Option<String>,
    pub client_order_id: Option<String>,
    pub status: Option<OrderStatus>,
    pub filled_qty: Decimal,
    pub avg_price: Decimal,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

impl OrderResult {
    pub fn rejected(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            status: Some(OrderStatus::Rejected),
            error_code: Some(code.into()),
            error_message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_message: Some(message.into()),
            ..Default::default()
        }
    }
}

/// ORDER_TRADE_UPDATE projection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderUpdate {
    pub symbol: String,
    pub order_id: String,
    pub client_order_id: String,
    pub side: Side,
    pub position_side: PositionSide,
    pub status: OrderStatus,
    pub filled_qty: Decimal,
    pub avg_price: Decimal,
    pub timestamp_ms: i64,
    pub order_type: Option<String>,
    pub close_position: Option<bool>,
    pub reduce_only: Option<bool>,
    pub is_maker: Option<bool>,
    pub realized_pnl: Option<Decimal>,
    pub fee: Option<Decimal>,
    pub fee_asset: Option<String>,
}

/// ALGO_UPDATE projection for conditional orders. Status stays a raw string
/// because the algo service has its own vocabulary (TRIGGERED, FINISHED...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlgoOrderUpdate {
    pub symbol: String,
    pub algo_id: String,
    pub client_algo_id: String,
    pub side: Side,
    pub status: String,
    pub timestamp_ms: i64,
    pub order_type: Option<String>,
    pub position_side: Option<PositionSide>,
    pub close_position: Option<bool>,
    pub reduce_only: Option<bool>,
}

impl AlgoOrderUpdate {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status.to_ascii_uppercase().as_str(),
            "CANCELED" | "FILLED" | "TRIGGERED" | "EXPIRED" | "REJECTED" | "FINISHED"
        )
    }
}

/// One entry of an ACCOUNT_UPDATE `P` array. Amount is signed by side; a
/// zero amount means the position is gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionUpdate {
    pub symbol: String,
    pub position_side: PositionSide,
    pub position_amt: Decimal,
    pub entry_price: Option<Decimal>,
    pub unrealized_pnl: Option<Decimal>,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeverageUpdate {
    pub symbol: String,
    pub leverage: u32,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketEventKind {
    BookTicker,
    AggTrade,
    MarkPrice,
}

/// One market-data tick. Only the fields of the originating stream are set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketEvent {
    pub symbol: String,
    pub timestamp_ms: i64,
    pub kind: MarketEventKind,
    pub best_bid: Option<Decimal>,
    pub best_ask: Option<Decimal>,
    pub last_trade_price: Option<Decimal>,
    pub mark_price: Option<Decimal>,
}

/// Trade metadata fetched over REST to reconcile fills whose user-data
/// receipt never arrived.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TradeMeta {
    pub is_maker: Option<bool>,
    pub realized_pnl: Option<Decimal>,
    pub fee: Option<Decimal>,
    pub fee_asset: Option<String>,
}

/// Tolerantly-parsed open order, covering both /openOrders and
/// /openAlgoOrders rows. Conditional close-position stops may carry a zero
/// quantity, so everything beyond the symbol is optional.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct OpenOrder {
    pub symbol: String,
    pub order_id: Option<String>,
    pub client_order_id: Option<String>,
    pub position_side: Option<PositionSide>,
    pub order_type: Option<String>,
    pub stop_price: Option<Decimal>,
    pub close_position: Option<bool>,
    pub reduce_only: Option<bool>,
    pub working_type: Option<String>,
    pub status: Option<String>,
}

impl OpenOrder {
    /// Parse one row from either open-orders endpoint. Algo rows use
    /// algoId/clientAlgoId/triggerPrice; normal rows orderId/clientOrderId/
    /// stopPrice.
    pub fn from_value(value: &serde_json::Value) -> Option<OpenOrder> {
        let obj = value.as_object()?;
        let symbol = obj.get("symbol")?.as_str()?.to_string();

        let order_id = pick_string(obj, &["algoId", "orderId", "id"]);
        let client_order_id = pick_string(obj, &["clientAlgoId", "clientOrderId"]);
        let position_side = obj
            .get("positionSide")
            .and_then(|v| v.as_str())
            .and_then(PositionSide::parse);
        let order_type = pick_string(obj, &["type", "orderType", "algoType"])
            .map(|t| t.trim().to_ascii_uppercase());
        let stop_price = pick_decimal(obj, &["triggerPrice", "stopPrice"]).filter(|p| *p > Decimal::ZERO);
        let close_position = pick_bool(obj, "closePosition");
        let reduce_only = pick_bool(obj, "reduceOnly");
        let working_type = pick_string(obj, &["workingType"]);
        let status = pick_string(obj, &["status"]);

        Some(OpenOrder {
            symbol,
            order_id,
            client_order_id,
            position_side,
            order_type,
            stop_price,
            close_position,
            reduce_only,
            working_type,
            status,
        })
    }
}

fn pick_string(obj: &serde_json::Map<String, serde_json::Value>, keys: &[&str]) -> Option<String> {
    for key in keys {
        match obj.get(*key) {
            Some(serde_json::Value::String(s)) if !s.is_empty() => return Some(s.clone()),
            Some(serde_json::Value::Number(n)) => return Some(n.to_string()),
            _ => {}
        }
    }
    None
}

fn pick_decimal(obj: &serde_json::Map<String, serde_json::Value>, keys: &[&str]) -> Option<Decimal> {
    for key in keys {
        if let Some(value) = obj.get(*key) {
            let text = match value {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Number(n) => n.to_string(),
                _ => continue,
            };
            if let Ok(parsed) = text.parse::<Decimal>() {
                return Some(parsed);
            }
        }
    }
    None
}

fn pick_bool(obj: &serde_json::Map<String, serde_json::Value>, key: &str) -> Option<bool> {
    match obj.get(key) {
        Some(serde_json::Value::Bool(b)) => Some(*b),
        Some(serde_json::Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" => Some(false),
            _ => None,
        },
        Some(serde_json::Value::Number(n)) => match n.as_i64() {
            Some(1) => Some(true),
            Some(0) => Some(false),
            _ => None,
        },
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(value: &str) -> Decimal {
        Decimal::from_str(value).expect("valid decimal")
    }

    #[test]
    fn open_order_parses_normal_row() {
        let raw = serde_json::json!({
            "symbol": "BTCUSDT",
            "orderId": 123456,
            "clientOrderId": "uc-ps-btcusdt-L-12345",
            "positionSide": "LONG",
            "type": "STOP_MARKET",
            "stopPrice": "101.2",
            "closePosition": true,
            "reduceOnly": "true",
            "workingType": "MARK_PRICE",
            "status": "NEW"
        });
        let order = OpenOrder::from_value(&raw).expect("parsed");
        assert_eq!(order.order_id.as_deref(), Some("123456"));
        assert_eq!(order.position_side, Some(PositionSide::Long));
        assert_eq!(order.stop_price, Some(dec("101.2")));
        assert_eq!(order.close_position, Some(true));
        assert_eq!(order.reduce_only, Some(true));
        assert_eq!(order.order_type.as_deref(), Some("STOP_MARKET"));
    }

    #[test]
    fn open_order_parses_algo_row() {
        let raw = serde_json::json!({
            "symbol": "ETHUSDT",
            "algoId": "987",
            "clientAlgoId": "uc-ps-ethusdt-S-555",
            "positionSide": "SHORT",
            "algoType": "stop_market",
            "triggerPrice": "2200.5",
            "closePosition": 1
        });
        let order = OpenOrder::from_value(&raw).expect("parsed");
        assert_eq!(order.order_id.as_deref(), Some("987"));
        assert_eq!(order.client_order_id.as_deref(), Some("uc-ps-ethusdt-S-555"));
        assert_eq!(order.order_type.as_deref(), Some("STOP_MARKET"));
        assert_eq!(order.stop_price, Some(dec("2200.5")));
        assert_eq!(order.close_position, Some(true));
    }

    #[test]
    fn open_order_drops_zero_stop_price() {
        let raw = serde_json::json!({
            "symbol": "BTCUSDT",
            "orderId": 7,
            "stopPrice": "0"
        });
        let order = OpenOrder::from_value(&raw).expect("parsed");
        assert_eq!(order.stop_price, None);
    }

    #[test]
    fn stop_market_close_intent_shape() {
        let intent = OrderIntent::stop_market_close(
            "BTCUSDT",
            PositionSide::Long,
            dec("101.2"),
            "uc-ps-btcusdt-L-1".to_string(),
        );
        assert_eq!(intent.side, Side::Sell);
        assert_eq!(intent.order_type, OrderType::StopMarket);
        assert!(intent.close_position);
        assert!(intent.reduce_only);
        assert!(intent.is_risk);
        assert_eq!(intent.qty, Decimal::ZERO);
    }
}
