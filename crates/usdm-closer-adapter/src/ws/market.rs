/*
[INPUT]:  Combined market streams (bookTicker, aggTrade, markPrice@1s)
[OUTPUT]: MarketEvent stream + reconnect notifications via mpsc
[POS]:    WebSocket layer - market data ingest
[UPDATE]: When subscriptions, parse rules, or backoff policy change
*/

use std::str::FromStr;

use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::types::models::{MarketEvent, MarketEventKind};
use crate::util::{now_ms, stream_symbol};
use crate::ws::message::{AggTradeData, BookTickerData, CombinedFrame, MarkPriceData};

const WS_BASE_URL: &str = "wss://fstream.binance.com";
const WS_TESTNET_URL: &str = "wss://stream.binancefuture.com";

/// Exponential backoff policy for stream reconnects.
#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2,
        }
    }
}

impl ReconnectPolicy {
    pub fn next_delay(&self, current_ms: u64) -> u64 {
        current_ms
            .saturating_mul(self.multiplier.max(1) as u64)
            .min(self.max_delay_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarketStreamEvent {
    Event(MarketEvent),
    /// A successful reconnect after at least one established connection.
    /// The first connect does not emit this.
    Reconnected,
}

/// Market-data stream client. One combined connection carries bookTicker,
/// aggTrade and 1s markPrice for every configured symbol.
#[derive(Debug)]
pub struct MarketStream {
    symbols: Vec<String>,
    ws_base: String,
    policy: ReconnectPolicy,
    events: mpsc::Sender<MarketStreamEvent>,
}

impl MarketStream {
    pub fn new(
        symbols: Vec<String>,
        testnet: bool,
        policy: ReconnectPolicy,
        events: mpsc::Sender<MarketStreamEvent>,
    ) -> Self {
        let ws_base = if testnet { WS_TESTNET_URL } else { WS_BASE_URL };
        Self {
            symbols,
            ws_base: ws_base.to_string(),
            policy,
            events,
        }
    }

    fn stream_url(&self) -> String {
        let mut streams = Vec::with_capacity(self.symbols.len() * 3);
        for symbol in &self.symbols {
            let ws_symbol = stream_symbol(symbol);
            streams.push(format!("{ws_symbol}@bookTicker"));
            streams.push(format!("{ws_symbol}@aggTrade"));
            streams.push(format!("{ws_symbol}@markPrice@1s"));
        }
        format!("{}/stream?streams={}", self.ws_base, streams.join("/"))
    }

    /// Connect-and-read loop with exponential backoff. Runs until the
    /// shutdown token fires or the event receiver is dropped.
    pub async fn run(self, shutdown: CancellationToken) {
        let url = self.stream_url();
        let mut delay_ms = self.policy.initial_delay_ms;
        let mut established_before = false;

        loop {
            if shutdown.is_cancelled() {
                return;
            }

            match connect_async(&url).await {
                Ok((stream, _response)) => {
                    info!(stream = "market_data", "ws connected");
                    if established_before
                        && self
                            .events
                            .send(MarketStreamEvent::Reconnected)
                            .await
                            .is_err()
                    {
                        return;
                    }
                    established_before = true;
                    delay_ms = self.policy.initial_delay_ms;

                    let (mut write, mut read) = stream.split();
                    loop {
                        tokio::select! {
                            _ = shutdown.cancelled() => {
                                let _ = write.send(WsMessage::Close(None)).await;
                                return;
                            }
                            frame = read.next() => match frame {
                                Some(Ok(WsMessage::Text(text))) => {
                                    if let Some(event) = parse_market_frame(text.as_str())
                                        && self
                                            .events
                                            .send(MarketStreamEvent::Event(event))
                                            .await
                                            .is_err()
                                    {
                                        return;
                                    }
                                }
                                Some(Ok(WsMessage::Ping(payload))) => {
                                    let _ = write.send(WsMessage::Pong(payload)).await;
                                }
                                Some(Ok(WsMessage::Close(_))) | None => break,
                                Some(Ok(_)) => {}
                                Some(Err(err)) => {
                                    warn!(stream = "market_data", error = %err, "ws receive error");
                                    break;
                                }
                            }
                        }
                    }
                    warn!(stream = "market_data", "ws disconnected");
                }
                Err(err) => {
                    warn!(stream = "market_data", error = %err, "connect_error");
                }
            }

            debug!(stream = "market_data", delay_ms, "reconnecting after backoff");
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(std::time::Duration::from_millis(delay_ms)) => {}
            }
            delay_ms = self.policy.next_delay(delay_ms);
        }
    }
}

/// Parse one combined-stream frame into a MarketEvent. Crossed books
/// (bid > ask) and non-positive mark prices are dropped.
pub(crate) fn parse_market_frame(text: &str) -> Option<MarketEvent> {
    let frame: CombinedFrame = serde_json::from_str(text).ok()?;

    if frame.stream.contains("@bookTicker") {
        let data: BookTickerData = serde_json::from_value(frame.data).ok()?;
        let best_bid = Decimal::from_str(&data.best_bid).ok()?;
        let best_ask = Decimal::from_str(&data.best_ask).ok()?;
        if best_bid > best_ask {
            warn!(symbol = %data.symbol, bid = %best_bid, ask = %best_ask, "crossed book quote dropped");
            return None;
        }
        return Some(MarketEvent {
            symbol: data.symbol,
            timestamp_ms: data
                .transaction_time
                .or(data.event_time)
                .unwrap_or_else(now_ms),
            kind: MarketEventKind::BookTicker,
            best_bid: Some(best_bid),
            best_ask: Some(best_ask),
            last_trade_price: None,
            mark_price: None,
        });
    }

    if frame.stream.contains("@aggTrade") {
        let data: AggTradeData = serde_json::from_value(frame.data).ok()?;
        let price = Decimal::from_str(&data.price).ok()?;
        return Some(MarketEvent {
            symbol: data.symbol,
            timestamp_ms: data.trade_time.or(data.event_time).unwrap_or_else(now_ms),
            kind: MarketEventKind::AggTrade,
            best_bid: None,
            best_ask: None,
            last_trade_price: Some(price),
            mark_price: None,
        });
    }

    if frame.stream.contains("@markPrice") {
        let data: MarkPriceData = serde_json::from_value(frame.data).ok()?;
        let mark = Decimal::from_str(&data.mark_price).ok()?;
        if mark <= Decimal::ZERO {
            return None;
        }
        return Some(MarketEvent {
            symbol: data.symbol,
            timestamp_ms: data
                .event_time
                .or(data.next_funding_time)
                .unwrap_or_else(now_ms),
            kind: MarketEventKind::MarkPrice,
            best_bid: None,
            best_ask: None,
            last_trade_price: None,
            mark_price: Some(mark),
        });
    }

    None
}
