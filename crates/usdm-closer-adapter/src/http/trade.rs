/*
[INPUT]:  OrderIntent, order ids, open-order queries
[OUTPUT]: OrderResult with expected rejections folded in, open-order views,
          trade metadata for late-fill reconciliation
[POS]:    HTTP layer - trading endpoints
[UPDATE]: When order params or rejection classification change
*/

use reqwest::Method;
use rust_decimal::Decimal;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::http::client::UsdmClient;
use crate::http::error::{AdapterError, Result};
use crate::types::enums::{OrderStatus, OrderType};
use crate::types::models::{OpenOrder, OrderIntent, OrderResult, TradeMeta};

const INSUFFICIENT_FUNDS_CODES: [i64; 2] = [-2018, -2019];
const POST_ONLY_REJECT_CODE: i64 = -5022;

#[derive(Debug, Deserialize)]
struct OrderResponse {
    #[serde(rename = "orderId")]
    order_id: Option<i64>,
    #[serde(rename = "clientOrderId")]
    client_order_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(rename = "executedQty")]
    executed_qty: Option<String>,
    #[serde(rename = "avgPrice")]
    avg_price: Option<String>,
}

impl OrderResponse {
    fn into_result(self) -> OrderResult {
        OrderResult {
            success: true,
            order_id: self.order_id.map(|id| id.to_string()),
            client_order_id: self.client_order_id,
            status: self.status.as_deref().map(OrderStatus::parse),
            filled_qty: parse_decimal_or_zero(self.executed_qty.as_deref()),
            avg_price: parse_decimal_or_zero(self.avg_price.as_deref()),
            error_code: None,
            error_message: None,
        }
    }
}

fn parse_decimal_or_zero(value: Option<&str>) -> Decimal {
    value
        .and_then(|text| text.parse::<Decimal>().ok())
        .unwrap_or(Decimal::ZERO)
}

fn is_post_only_reject(code: i64, message: &str) -> bool {
    code == POST_ONLY_REJECT_CODE || message.to_ascii_lowercase().contains("post only")
}

impl UsdmClient {
    /// Place an order.
    ///
    /// Hedge mode: `positionSide` is always sent and `reduceOnly` never is;
    /// the exchange rejects the pair together. Reduce-only semantics are
    /// carried by positionSide + side + qty bounded by the position.
    /// Expected rejections come back as a failed `OrderResult`; transport
    /// errors bubble.
    pub async fn place_order(&self, intent: &OrderIntent) -> Result<OrderResult> {
        let mut params: Vec<(&str, String)> = vec![
            ("symbol", intent.symbol.clone()),
            ("side", intent.side.as_str().to_string()),
            ("positionSide", intent.position_side.as_str().to_string()),
            ("type", intent.order_type.as_str().to_string()),
        ];

        if let Some(cid) = &intent.client_order_id {
            params.push(("newClientOrderId", cid.clone()));
        }

        match intent.order_type {
            OrderType::Limit => {
                params.push(("timeInForce", intent.time_in_force.as_str().to_string()));
                params.push(("quantity", intent.qty.normalize().to_string()));
                if let Some(price) = intent.price {
                    params.push(("price", price.normalize().to_string()));
                }
            }
            OrderType::StopMarket => {
                let stop_price = intent.stop_price.ok_or_else(|| {
                    AdapterError::Config("STOP_MARKET requires stop_price".to_string())
                })?;
                params.push(("stopPrice", stop_price.normalize().to_string()));
                params.push(("workingType", "MARK_PRICE".to_string()));
                if intent.close_position {
                    params.push(("closePosition", "true".to_string()));
                } else {
                    params.push(("quantity", intent.qty.normalize().to_string()));
                }
            }
        }

        match self
            .signed_request::<OrderResponse>(Method::POST, "/fapi/v1/order", &params)
            .await
        {
            Ok(response) => {
                let result = response.into_result();
                debug!(
                    symbol = %intent.symbol,
                    side = %intent.side.as_str(),
                    qty = %intent.qty,
                    order_id = result.order_id.as_deref().unwrap_or(""),
                    "order placed"
                );
                Ok(result)
            }
            Err(AdapterError::Api { code, message }) => {
                Ok(classify_rejection(intent, code, &message))
            }
            Err(err) => Err(err),
        }
    }

    /// Cancel a normal order. Never falls back to the algo endpoint.
    /// Exchange-side refusals (already gone, unknown id) come back as a
    /// failed result; transport errors bubble.
    pub async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<OrderResult> {
        let params = [
            ("symbol", symbol.to_string()),
            ("orderId", order_id.to_string()),
        ];
        match self
            .signed_request::<OrderResponse>(Method::DELETE, "/fapi/v1/order", &params)
            .await
        {
            Ok(response) => {
                debug!(symbol, order_id, "order canceled");
                Ok(response.into_result())
            }
            Err(AdapterError::Api { code, message }) => {
                debug!(symbol, order_id, code, message = %message, "cancel refused");
                Ok(OrderResult {
                    success: false,
                    order_id: Some(order_id.to_string()),
                    error_code: Some(code.to_string()),
                    error_message: Some(message),
                    ..Default::default()
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Cancel a conditional (algo) order only.
    pub async fn cancel_algo_order(&self, symbol: &str, algo_id: &str) -> Result<OrderResult> {
        let params = [
            ("symbol", symbol.to_string()),
            ("algoId", algo_id.to_string()),
        ];
        match self
            .signed_request::<serde_json::Value>(Method::DELETE, "/fapi/v1/algoOrder", &params)
            .await
        {
            Ok(_) => {
                debug!(symbol, algo_id, "algo order canceled");
                Ok(OrderResult {
                    success: true,
                    order_id: Some(algo_id.to_string()),
                    status: Some(OrderStatus::Canceled),
                    ..Default::default()
                })
            }
            Err(AdapterError::Api { code, message }) => {
                debug!(symbol, algo_id, code, message = %message, "algo cancel refused");
                Ok(OrderResult {
                    success: false,
                    order_id: Some(algo_id.to_string()),
                    error_code: Some(code.to_string()),
                    error_message: Some(message),
                    ..Default::default()
                })
            }
            Err(err) => Err(err),
        }
    }

    /// Cancel an order of unknown kind: normal first, algo on refusal.
    pub async fn cancel_any_order(&self, symbol: &str, order_id: &str) -> Result<OrderResult> {
        let normal = self.cancel_order(symbol, order_id).await?;
        if normal.success {
            return Ok(normal);
        }
        self.cancel_algo_order(symbol, order_id).await
    }

    /// Open orders via the standard endpoint.
    pub async fn fetch_open_orders(&self, symbol: Option<&str>) -> Result<Vec<OpenOrder>> {
        self.fetch_open_orders_raw(symbol).await
    }

    /// Open orders parsed straight from the raw payload. Kept as a distinct
    /// entry point because close-position stops with origQty=0 must survive
    /// parsing for external-takeover classification.
    pub async fn fetch_open_orders_raw(&self, symbol: Option<&str>) -> Result<Vec<OpenOrder>> {
        let mut params: Vec<(&str, String)> = Vec::new();
        if let Some(symbol) = symbol {
            params.push(("symbol", symbol.to_string()));
        }
        let rows: serde_json::Value = self
            .signed_request(Method::GET, "/fapi/v1/openOrders", &params)
            .await?;
        Ok(parse_open_order_rows(&rows))
    }

    /// Open conditional orders (STOP_MARKET, TAKE_PROFIT_MARKET, ...).
    pub async fn fetch_open_algo_orders(&self, symbol: Option<&str>) -> Result<Vec<OpenOrder>> {
        let mut params: Vec<(&str, String)> = Vec::new();
        if let Some(symbol) = symbol {
            params.push(("symbol", symbol.to_string()));
        }
        let rows: serde_json::Value = self
            .signed_request(Method::GET, "/fapi/v1/openAlgoOrders", &params)
            .await?;
        Ok(parse_open_order_rows(&rows))
    }

    /// First-fill metadata for an order: maker flag, realized PnL, fee.
    /// Missing trades yield an empty TradeMeta, not an error.
    pub async fn fetch_order_trade_meta(&self, symbol: &str, order_id: &str) -> Result<TradeMeta> {
        let params = [
            ("symbol", symbol.to_string()),
            ("orderId", order_id.to_string()),
        ];
        let rows: serde_json::Value = self
            .signed_request(Method::GET, "/fapi/v1/userTrades", &params)
            .await?;

        let Some(first) = rows.as_array().and_then(|list| list.first()) else {
            return Ok(TradeMeta::default());
        };

        let is_maker = first.get("maker").and_then(|v| v.as_bool());
        let realized_pnl = first
            .get("realizedPnl")
            .and_then(value_to_decimal);
        let fee = first.get("commission").and_then(value_to_decimal);
        let fee_asset = first
            .get("commissionAsset")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());

        Ok(TradeMeta {
            is_maker,
            realized_pnl,
            fee,
            fee_asset,
        })
    }
}

fn classify_rejection(intent: &OrderIntent, code: i64, message: &str) -> OrderResult {
    if INSUFFICIENT_FUNDS_CODES.contains(&code) {
        warn!(symbol = %intent.symbol, code, message, "insufficient funds");
        return OrderResult::rejected("INSUFFICIENT_FUNDS", message);
    }
    if is_post_only_reject(code, message) {
        // Structured reject-level log; the execution layer may retry once
        // with an aggressive limit instead.
        warn!(
            symbol = %intent.symbol,
            side = %intent.position_side.as_str(),
            reason = "post_only_reject",
            code,
            order_type = intent.order_type.as_str(),
            time_in_force = intent.time_in_force.as_str(),
            price = %intent.price.unwrap_or_default(),
            qty = %intent.qty,
            "order rejected"
        );
        return OrderResult::rejected(code.to_string(), message);
    }
    warn!(symbol = %intent.symbol, code, message, "invalid order");
    OrderResult::rejected(code.to_string(), message)
}

fn parse_open_order_rows(payload: &serde_json::Value) -> Vec<OpenOrder> {
    let rows = match payload {
        serde_json::Value::Array(list) => list.as_slice(),
        serde_json::Value::Object(map) => map
            .get("data")
            .or_else(|| map.get("orders"))
            .and_then(|v| v.as_array())
            .map(|list| list.as_slice())
            .unwrap_or(&[]),
        _ => &[],
    };
    rows.iter().filter_map(OpenOrder::from_value).collect()
}

fn value_to_decimal(value: &serde_json::Value) -> Option<Decimal> {
    match value {
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => n.to_string().parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::enums::{PositionSide, Side, TimeInForce};
    use std::str::FromStr;

    fn dec(value: &str) -> Decimal {
        Decimal::from_str(value).expect("valid decimal")
    }

    fn sell_intent() -> OrderIntent {
        OrderIntent::limit(
            "BTCUSDT",
            Side::Sell,
            PositionSide::Long,
            dec("0.01"),
            dec("100.0"),
            TimeInForce::Gtx,
        )
    }

    #[test]
    fn post_only_reject_is_structured() {
        let result = classify_rejection(&sell_intent(), -5022, "Post Only order will be rejected");
        assert!(!result.success);
        assert_eq!(result.error_code.as_deref(), Some("-5022"));
        assert_eq!(result.status, Some(OrderStatus::Rejected));
    }

    #[test]
    fn post_only_reject_matches_message_text() {
        let result = classify_rejection(&sell_intent(), -1234, "order would post only cross");
        assert_eq!(result.error_code.as_deref(), Some("-1234"));
        assert!(is_post_only_reject(-1234, "order would Post Only cross"));
    }

    #[test]
    fn insufficient_funds_code_is_mapped() {
        let result = classify_rejection(&sell_intent(), -2019, "Margin is insufficient.");
        assert_eq!(result.error_code.as_deref(), Some("INSUFFICIENT_FUNDS"));
    }

    #[test]
    fn open_order_rows_accept_list_and_wrapped_forms() {
        let list = serde_json::json!([{"symbol": "BTCUSDT", "orderId": 1}]);
        assert_eq!(parse_open_order_rows(&list).len(), 1);

        let wrapped = serde_json::json!({"data": [{"symbol": "BTCUSDT", "orderId": 2}]});
        assert_eq!(parse_open_order_rows(&wrapped).len(), 1);

        let odd = serde_json::json!("nope");
        assert!(parse_open_order_rows(&odd).is_empty());
    }

    #[test]
    fn order_response_parses_fill_fields() {
        let response: OrderResponse = serde_json::from_value(serde_json::json!({
            "orderId": 42,
            "clientOrderId": "uc-abc-1",
            "status": "FILLED",
            "executedQty": "0.010",
            "avgPrice": "100.5"
        }))
        .expect("order response");
        let result = response.into_result();
        assert!(result.success);
        assert_eq!(result.order_id.as_deref(), Some("42"));
        assert_eq!(result.status, Some(OrderStatus::Filled));
        assert_eq!(result.filled_qty, dec("0.010"));
        assert_eq!(result.avg_price, dec("100.5"));
    }
}
