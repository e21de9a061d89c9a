/*
[INPUT]:  listenKey REST lifecycle + user-data stream frames
[OUTPUT]: Order/algo/position/leverage updates + reconnect notifications
[POS]:    WebSocket layer - account stream ingest
[UPDATE]: When event parsing or the session-key cadence changes
*/

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::http::client::UsdmClient;
use crate::types::enums::{OrderStatus, PositionSide, Side};
use crate::types::models::{AlgoOrderUpdate, LeverageUpdate, OrderUpdate, PositionUpdate};
use crate::util::now_ms;
use crate::ws::market::ReconnectPolicy;
use crate::ws::message::{
    AccountConfigData, AccountData, AlgoOrderData, OrderTradeData, UserFrame,
};

const WS_BASE_URL: &str = "wss://fstream.binance.com";
const WS_TESTNET_URL: &str = "wss://stream.binancefuture.com";

/// Session keys expire after 60 minutes; renew at half that.
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30 * 60);
const LISTEN_KEY_CLOSE_TIMEOUT: Duration = Duration::from_millis(1_500);

#[derive(Debug, Clone, PartialEq)]
pub enum UserStreamEvent {
    Order(OrderUpdate),
    Algo(AlgoOrderUpdate),
    Position(PositionUpdate),
    Leverage(LeverageUpdate),
    /// Successful reconnect after at least one established connection.
    Reconnected,
}

pub(crate) enum ParsedUserMessage {
    Events(Vec<UserStreamEvent>),
    ListenKeyExpired,
    Ignored,
}

/// User-data stream client: obtains a listenKey, keeps it alive on a fixed
/// cadence, and reconnects with a fresh key on expiry or transport drop.
#[derive(Debug)]
pub struct UserDataStream {
    client: Arc<UsdmClient>,
    ws_base: String,
    policy: ReconnectPolicy,
    events: mpsc::Sender<UserStreamEvent>,
}

impl UserDataStream {
    pub fn new(
        client: Arc<UsdmClient>,
        policy: ReconnectPolicy,
        events: mpsc::Sender<UserStreamEvent>,
    ) -> Self {
        let ws_base = if client.is_testnet() { WS_TESTNET_URL } else { WS_BASE_URL };
        Self {
            client,
            ws_base: ws_base.to_string(),
            policy,
            events,
        }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut delay_ms = self.policy.initial_delay_ms;
        let mut established_before = false;

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.connect_once(&shutdown, &mut established_before).await {
                ConnectOutcome::Shutdown | ConnectOutcome::ReceiverGone => break,
                ConnectOutcome::Established => {
                    // A full session ran; restart backoff from scratch.
                    delay_ms = self.policy.initial_delay_ms;
                }
                ConnectOutcome::Failed => {}
            }

            debug!(stream = "user_data", delay_ms, "reconnecting after backoff");
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
            }
            delay_ms = self.policy.next_delay(delay_ms);
        }

        // Invalidate the session key so the stream does not linger server-side.
        let _ = tokio::time::timeout(LISTEN_KEY_CLOSE_TIMEOUT, self.client.close_user_data_stream())
            .await;
    }

    async fn connect_once(
        &self,
        shutdown: &CancellationToken,
        established_before: &mut bool,
    ) -> ConnectOutcome {
        let listen_key = match self.client.start_user_data_stream().await {
            Ok(key) => key,
            Err(err) => {
                warn!(stream = "user_data", error = %err, "failed to obtain listenKey");
                return ConnectOutcome::Failed;
            }
        };
        debug!(stream = "user_data", key_prefix = &listen_key[..listen_key.len().min(8)], "listenKey obtained");

        let url = format!("{}/ws/{}", self.ws_base, listen_key);
        let stream = match connect_async(&url).await {
            Ok((stream, _response)) => stream,
            Err(err) => {
                warn!(stream = "user_data", error = %err, "connect_error");
                return ConnectOutcome::Failed;
            }
        };

        info!(stream = "user_data", "ws connected");
        if *established_before
            && self
                .events
                .send(UserStreamEvent::Reconnected)
                .await
                .is_err()
        {
            return ConnectOutcome::ReceiverGone;
        }
        *established_before = true;

        let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        keepalive.tick().await; // consume the immediate first tick

        let (mut write, mut read) = stream.split();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = write.send(WsMessage::Close(None)).await;
                    return ConnectOutcome::Shutdown;
                }
                _ = keepalive.tick() => {
                    if let Err(err) = self.client.keepalive_user_data_stream().await {
                        warn!(stream = "user_data", error = %err, "listenKey keepalive failed");
                    } else {
                        debug!(stream = "user_data", "listenKey renewed");
                    }
                }
                frame = read.next() => match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        match parse_user_message(text.as_str()) {
                            ParsedUserMessage::Events(events) => {
                                for event in events {
                                    if self.events.send(event).await.is_err() {
                                        return ConnectOutcome::ReceiverGone;
                                    }
                                }
                            }
                            ParsedUserMessage::ListenKeyExpired => {
                                warn!(stream = "user_data", "listenKey expired; reconnecting");
                                let _ = write.send(WsMessage::Close(None)).await;
                                return ConnectOutcome::Established;
                            }
                            ParsedUserMessage::Ignored => {}
                        }
                    }
                    Some(Ok(WsMessage::Ping(payload))) => {
                        let _ = write.send(WsMessage::Pong(payload)).await;
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        warn!(stream = "user_data", "ws disconnected");
                        return ConnectOutcome::Established;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(stream = "user_data", error = %err, "ws receive error");
                        return ConnectOutcome::Established;
                    }
                }
            }
        }
    }
}

enum ConnectOutcome {
    /// Connection ran and ended; reconnect with a fresh key.
    Established,
    /// Could not get a key or connect at all.
    Failed,
    Shutdown,
    ReceiverGone,
}

pub(crate) fn parse_user_message(text: &str) -> ParsedUserMessage {
    let frame: UserFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(err) => {
            debug!(stream = "user_data", error = %err, "unparsed frame");
            return ParsedUserMessage::Ignored;
        }
    };

    match frame {
        UserFrame::OrderTrade {
            event_time,
            transaction_time,
            order,
        } => match order_update_from(order, transaction_time, event_time) {
            Some(update) => ParsedUserMessage::Events(vec![UserStreamEvent::Order(update)]),
            None => ParsedUserMessage::Ignored,
        },
        UserFrame::AlgoUpdate {
            event_time,
            transaction_time,
            order,
        } => match algo_update_from(order, transaction_time, event_time) {
            Some(update) => ParsedUserMessage::Events(vec![UserStreamEvent::Algo(update)]),
            None => ParsedUserMessage::Ignored,
        },
        UserFrame::AccountUpdate {
            event_time,
            transaction_time,
            account,
        } => ParsedUserMessage::Events(
            position_updates_from(account, transaction_time, event_time)
                .into_iter()
                .map(UserStreamEvent::Position)
                .collect(),
        ),
        UserFrame::AccountConfig {
            event_time,
            transaction_time,
            config,
        } => match config.and_then(|c| leverage_update_from(c, transaction_time, event_time)) {
            Some(update) => ParsedUserMessage::Events(vec![UserStreamEvent::Leverage(update)]),
            None => ParsedUserMessage::Ignored,
        },
        UserFrame::ListenKeyExpired => ParsedUserMessage::ListenKeyExpired,
        UserFrame::Other => ParsedUserMessage::Ignored,
    }
}

fn resolve_ts(transaction_time: Option<i64>, event_time: Option<i64>) -> i64 {
    transaction_time
        .filter(|t| *t > 0)
        .or(event_time.filter(|t| *t > 0))
        .unwrap_or_else(now_ms)
}

fn parse_decimal(value: Option<&str>) -> Decimal {
    value
        .and_then(|text| Decimal::from_str(text).ok())
        .unwrap_or(Decimal::ZERO)
}

fn parse_decimal_opt(value: Option<&str>) -> Option<Decimal> {
    value.and_then(|text| Decimal::from_str(text).ok())
}

fn order_update_from(
    order: OrderTradeData,
    transaction_time: Option<i64>,
    event_time: Option<i64>,
) -> Option<OrderUpdate> {
    let side = match order.side.as_deref() {
        Some("BUY") => Side::Buy,
        _ => Side::Sell,
    };
    let position_side = order
        .position_side
        .as_deref()
        .and_then(PositionSide::parse)
        .unwrap_or(PositionSide::Short);
    let status = order
        .status
        .as_deref()
        .map(OrderStatus::parse)
        .unwrap_or(OrderStatus::New);

    Some(OrderUpdate {
        symbol: order.symbol,
        order_id: order.order_id.map(|id| id.to_string()).unwrap_or_default(),
        client_order_id: order.client_order_id.unwrap_or_default(),
        side,
        position_side,
        status,
        filled_qty: parse_decimal(order.cumulative_filled_qty.as_deref()),
        avg_price: parse_decimal(order.avg_price.as_deref()),
        timestamp_ms: resolve_ts(transaction_time, event_time),
        order_type: order.order_type,
        close_position: order.close_position,
        reduce_only: order.reduce_only,
        is_maker: order.is_maker,
        realized_pnl: parse_decimal_opt(order.realized_pnl.as_deref()),
        fee: parse_decimal_opt(order.commission.as_deref()),
        fee_asset: order.commission_asset,
    })
}

fn algo_update_from(
    order: AlgoOrderData,
    transaction_time: Option<i64>,
    event_time: Option<i64>,
) -> Option<AlgoOrderUpdate> {
    let side = match order.side.as_deref() {
        Some("BUY") => Side::Buy,
        _ => Side::Sell,
    };
    let algo_id = match order.algo_id {
        Some(serde_json::Value::String(s)) => s,
        Some(serde_json::Value::Number(n)) => n.to_string(),
        _ => String::new(),
    };

    Some(AlgoOrderUpdate {
        symbol: order.symbol,
        algo_id,
        client_algo_id: order.client_algo_id.unwrap_or_default(),
        side,
        status: order.status.unwrap_or_default(),
        timestamp_ms: resolve_ts(transaction_time, event_time),
        order_type: order.order_type,
        position_side: order.position_side.as_deref().and_then(PositionSide::parse),
        close_position: order.close_position,
        reduce_only: order.reduce_only,
    })
}

fn position_updates_from(
    account: AccountData,
    transaction_time: Option<i64>,
    event_time: Option<i64>,
) -> Vec<PositionUpdate> {
    let timestamp_ms = resolve_ts(transaction_time, event_time);
    let mut updates = Vec::new();

    for raw in account.positions {
        let Some(position_side) = raw.position_side.as_deref().and_then(PositionSide::parse) else {
            continue;
        };
        let amt = parse_decimal(raw.position_amt.as_deref());
        let position_amt = match position_side {
            PositionSide::Long => amt.abs(),
            PositionSide::Short => -amt.abs(),
        };
        let entry_price = parse_decimal_opt(raw.entry_price.as_deref()).filter(|p| *p > Decimal::ZERO);
        let unrealized_pnl = parse_decimal_opt(raw.unrealized_pnl.as_deref());

        updates.push(PositionUpdate {
            symbol: raw.symbol,
            position_side,
            position_amt,
            entry_price,
            unrealized_pnl,
            timestamp_ms,
        });
    }

    updates
}

fn leverage_update_from(
    config: AccountConfigData,
    transaction_time: Option<i64>,
    event_time: Option<i64>,
) -> Option<LeverageUpdate> {
    if config.symbol.trim().is_empty() {
        return None;
    }
    let leverage = match config.leverage? {
        serde_json::Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .unwrap_or(0),
        serde_json::Value::String(s) => s
            .parse::<i64>()
            .or_else(|_| s.parse::<f64>().map(|f| f as i64))
            .unwrap_or(0),
        _ => 0,
    };
    if leverage <= 0 {
        return None;
    }
    Some(LeverageUpdate {
        symbol: config.symbol,
        leverage: leverage as u32,
        timestamp_ms: resolve_ts(transaction_time, event_time),
    })
}
