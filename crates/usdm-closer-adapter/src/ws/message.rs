/*
[INPUT]:  Raw WebSocket frame JSON
[OUTPUT]: Typed frame structs for market and user-data streams
[POS]:    WebSocket layer - frame schemas
[UPDATE]: When the exchange changes stream payloads we consume
*/

use serde::Deserialize;

/// Combined-stream envelope: `{"stream": "...", "data": {...}}`.
#[derive(Debug, Clone, Deserialize)]
pub struct CombinedFrame {
    pub stream: String,
    pub data: serde_json::Value,
}

/// `<symbol>@bookTicker` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct BookTickerData {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "b")]
    pub best_bid: String,
    #[serde(rename = "a")]
    pub best_ask: String,
    #[serde(default, rename = "T")]
    pub transaction_time: Option<i64>,
    #[serde(default, rename = "E")]
    pub event_time: Option<i64>,
}

/// `<symbol>@aggTrade` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct AggTradeData {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "p")]
    pub price: String,
    #[serde(default, rename = "T")]
    pub trade_time: Option<i64>,
    #[serde(default, rename = "E")]
    pub event_time: Option<i64>,
}

/// `<symbol>@markPrice@1s` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct MarkPriceData {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "p")]
    pub mark_price: String,
    #[serde(default, rename = "E")]
    pub event_time: Option<i64>,
    #[serde(default, rename = "T")]
    pub next_funding_time: Option<i64>,
}

/// User-data stream frames, tagged by the `e` field.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "e")]
pub enum UserFrame {
    #[serde(rename = "ORDER_TRADE_UPDATE")]
    OrderTrade {
        #[serde(default, rename = "E")]
        event_time: Option<i64>,
        #[serde(default, rename = "T")]
        transaction_time: Option<i64>,
        #[serde(rename = "o")]
        order: OrderTradeData,
    },
    #[serde(rename = "ALGO_UPDATE")]
    AlgoUpdate {
        #[serde(default, rename = "E")]
        event_time: Option<i64>,
        #[serde(default, rename = "T")]
        transaction_time: Option<i64>,
        #[serde(rename = "o")]
        order: AlgoOrderData,
    },
    #[serde(rename = "ACCOUNT_UPDATE")]
    AccountUpdate {
        #[serde(default, rename = "E")]
        event_time: Option<i64>,
        #[serde(default, rename = "T")]
        transaction_time: Option<i64>,
        #[serde(rename = "a")]
        account: AccountData,
    },
    #[serde(rename = "ACCOUNT_CONFIG_UPDATE")]
    AccountConfig {
        #[serde(default, rename = "E")]
        event_time: Option<i64>,
        #[serde(default, rename = "T")]
        transaction_time: Option<i64>,
        #[serde(default, rename = "ac")]
        config: Option<AccountConfigData>,
    },
    #[serde(rename = "listenKeyExpired")]
    ListenKeyExpired,
    #[serde(other)]
    Other,
}

/// `ORDER_TRADE_UPDATE.o`: only the fields we consume.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderTradeData {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(default, rename = "c")]
    pub client_order_id: Option<String>,
    #[serde(default, rename = "S")]
    pub side: Option<String>,
    #[serde(default, rename = "o")]
    pub order_type: Option<String>,
    #[serde(default, rename = "X")]
    pub status: Option<String>,
    #[serde(default, rename = "i")]
    pub order_id: Option<i64>,
    #[serde(default, rename = "z")]
    pub cumulative_filled_qty: Option<String>,
    #[serde(default, rename = "ap")]
    pub avg_price: Option<String>,
    #[serde(default, rename = "n")]
    pub commission: Option<String>,
    #[serde(default, rename = "N")]
    pub commission_asset: Option<String>,
    #[serde(default, rename = "m")]
    pub is_maker: Option<bool>,
    #[serde(default, rename = "R")]
    pub reduce_only: Option<bool>,
    #[serde(default, rename = "ps")]
    pub position_side: Option<String>,
    #[serde(default, rename = "cp")]
    pub close_position: Option<bool>,
    #[serde(default, rename = "rp")]
    pub realized_pnl: Option<String>,
}

/// `ALGO_UPDATE.o`: conditional-order update.
#[derive(Debug, Clone, Deserialize)]
pub struct AlgoOrderData {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(default, rename = "S")]
    pub side: Option<String>,
    #[serde(default, rename = "ps")]
    pub position_side: Option<String>,
    #[serde(default, rename = "aid")]
    pub algo_id: Option<serde_json::Value>,
    #[serde(default, rename = "caid")]
    pub client_algo_id: Option<String>,
    #[serde(default, rename = "X")]
    pub status: Option<String>,
    #[serde(default, rename = "o")]
    pub order_type: Option<String>,
    #[serde(default, rename = "cp")]
    pub close_position: Option<bool>,
    #[serde(default, rename = "R")]
    pub reduce_only: Option<bool>,
}

/// `ACCOUNT_UPDATE.a`.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountData {
    #[serde(default, rename = "P")]
    pub positions: Vec<AccountPositionData>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountPositionData {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(default, rename = "pa")]
    pub position_amt: Option<String>,
    #[serde(default, rename = "ep")]
    pub entry_price: Option<String>,
    #[serde(default, rename = "up")]
    pub unrealized_pnl: Option<String>,
    #[serde(default, rename = "ps")]
    pub position_side: Option<String>,
}

/// `ACCOUNT_CONFIG_UPDATE.ac`. Leverage arrives as a bare number.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfigData {
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(default, rename = "l")]
    pub leverage: Option<serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combined_frame_roundtrip() {
        let text = r#"{"stream":"btcusdt@bookTicker","data":{"e":"bookTicker","s":"BTCUSDT","b":"25.35","B":"31.21","a":"25.36","A":"40.66","T":1591097736594,"E":1591097736593}}"#;
        let frame: CombinedFrame = serde_json::from_str(text).expect("frame");
        assert_eq!(frame.stream, "btcusdt@bookTicker");
        let ticker: BookTickerData = serde_json::from_value(frame.data).expect("book ticker");
        assert_eq!(ticker.symbol, "BTCUSDT");
        assert_eq!(ticker.best_bid, "25.35");
        assert_eq!(ticker.transaction_time, Some(1591097736594));
    }

    #[test]
    fn user_frame_order_trade_update() {
        let text = r#"{"e":"ORDER_TRADE_UPDATE","E":1591097736594,"T":1591097736591,"o":{"s":"BTCUSDT","c":"uc-run-1","S":"SELL","o":"LIMIT","f":"GTX","q":"0.001","p":"50000","ap":"50001.5","X":"FILLED","i":12345678,"z":"0.001","n":"0.02","N":"USDT","m":true,"R":true,"ps":"LONG","cp":false,"rp":"1.23"}}"#;
        let frame: UserFrame = serde_json::from_str(text).expect("frame");
        match frame {
            UserFrame::OrderTrade { order, transaction_time, .. } => {
                assert_eq!(order.order_id, Some(12345678));
                assert_eq!(order.is_maker, Some(true));
                assert_eq!(order.realized_pnl.as_deref(), Some("1.23"));
                assert_eq!(order.commission_asset.as_deref(), Some("USDT"));
                assert_eq!(transaction_time, Some(1591097736591));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn user_frame_listen_key_expired() {
        let text = r#"{"e":"listenKeyExpired","E":1576653824250}"#;
        let frame: UserFrame = serde_json::from_str(text).expect("frame");
        assert!(matches!(frame, UserFrame::ListenKeyExpired));
    }

    #[test]
    fn user_frame_unknown_event_is_other() {
        let text = r#"{"e":"MARGIN_CALL","E":1576653824250}"#;
        let frame: UserFrame = serde_json::from_str(text).expect("frame");
        assert!(matches!(frame, UserFrame::Other));
    }

    #[test]
    fn account_update_positions_parse() {
        let text = r#"{"e":"ACCOUNT_UPDATE","E":1591097736594,"a":{"B":[],"P":[{"s":"BTCUSDT","pa":"0.001","ep":"50000","up":"0.12","ps":"LONG"},{"s":"BTCUSDT","pa":"0","ep":"0","up":"0","ps":"SHORT"}]}}"#;
        let frame: UserFrame = serde_json::from_str(text).expect("frame");
        match frame {
            UserFrame::AccountUpdate { account, .. } => {
                assert_eq!(account.positions.len(), 2);
                assert_eq!(account.positions[0].position_amt.as_deref(), Some("0.001"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn account_config_leverage_is_raw_value() {
        let text = r#"{"e":"ACCOUNT_CONFIG_UPDATE","E":1611646737478,"T":1611646737476,"ac":{"s":"BTCUSDT","l":25}}"#;
        let frame: UserFrame = serde_json::from_str(text).expect("frame");
        match frame {
            UserFrame::AccountConfig { config, .. } => {
                let config = config.expect("ac present");
                assert_eq!(config.leverage, Some(serde_json::json!(25)));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
