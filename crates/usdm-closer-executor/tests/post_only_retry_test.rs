/*
[INPUT]:  A post-only rejection from the exchange
[OUTPUT]: One-shot aggressive-limit retry assertions
[POS]:    Integration tests - application-layer post-only recovery
[UPDATE]: When the retry policy changes
*/

use std::str::FromStr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rust_decimal::Decimal;

use usdm_closer_adapter::{
    InstrumentRule, OrderIntent, OrderResult, OrderStatus, PositionSide, Side, TimeInForce,
    TradeMeta,
};
use usdm_closer_executor::app::maybe_retry_post_only_reject;
use usdm_closer_executor::config::FillRateConfig;
use usdm_closer_executor::execution::{
    EngineConfig, ExecutionEngine, ExecutionMode, ExecutionState, MakerPriceMode, OrderGateway,
};
use usdm_closer_executor::signal::MarketState;

fn dec(value: &str) -> Decimal {
    Decimal::from_str(value).expect("valid decimal")
}

#[derive(Default)]
struct CountingGateway {
    placed: Mutex<Vec<OrderIntent>>,
}

#[async_trait]
impl OrderGateway for CountingGateway {
    async fn place_order(&self, intent: &OrderIntent) -> OrderResult {
        self.placed.lock().unwrap().push(intent.clone());
        OrderResult {
            success: true,
            order_id: Some("abc".to_string()),
            status: Some(OrderStatus::New),
            ..Default::default()
        }
    }

    async fn cancel_order(&self, _symbol: &str, order_id: &str, _is_risk: bool) -> OrderResult {
        OrderResult {
            success: true,
            order_id: Some(order_id.to_string()),
            ..Default::default()
        }
    }

    async fn fetch_order_trade_meta(&self, _symbol: &str, _order_id: &str) -> TradeMeta {
        TradeMeta::default()
    }
}

fn engine_config() -> EngineConfig {
    EngineConfig {
        order_ttl_ms: 800,
        repost_cooldown_ms: 100,
        base_lot_mult: 1,
        maker_price_mode: MakerPriceMode::InsideSpread1Tick,
        maker_n_ticks: 1,
        maker_safety_ticks: 1,
        maker_timeouts_to_escalate: 2,
        aggr_fills_to_deescalate: 1,
        aggr_timeouts_to_deescalate: 2,
        max_mult: 50,
        max_order_notional: dec("200"),
        ws_fill_grace_ms: 5_000,
        fill_rate: FillRateConfig::default(),
    }
}

fn market() -> MarketState {
    MarketState {
        symbol: "BTCUSDT".to_string(),
        best_bid: dec("99.0"),
        best_ask: dec("100.0"),
        last_trade_price: dec("99.5"),
        previous_trade_price: dec("99.4"),
        mark_price: None,
        last_update_ms: 1_000,
        is_ready: true,
    }
}

fn rules() -> InstrumentRule {
    InstrumentRule {
        symbol: "BTCUSDT".to_string(),
        tick_size: dec("0.1"),
        step_size: dec("0.001"),
        min_qty: dec("0.001"),
        min_notional: dec("5"),
    }
}

fn gtx_intent() -> OrderIntent {
    OrderIntent::limit(
        "BTCUSDT",
        Side::Sell,
        PositionSide::Long,
        dec("0.01"),
        dec("100.0"),
        TimeInForce::Gtx,
    )
}

#[tokio::test]
async fn post_only_reject_retries_with_aggressive_limit() {
    let gateway = Arc::new(CountingGateway::default());
    let mut engine = ExecutionEngine::new(engine_config(), gateway.clone(), None).expect("engine");
    engine.state_mut("BTCUSDT", PositionSide::Long).state = ExecutionState::Placing;

    let rejection = OrderResult::rejected("-5022", "post only rejected");
    let (retry_intent, retry_result, retried) =
        maybe_retry_post_only_reject(&mut engine, &gtx_intent(), rejection, &rules(), &market())
            .await;

    assert!(retried);
    assert!(retry_result.success);
    assert_eq!(retry_intent.time_in_force, TimeInForce::Gtc);
    // Aggressive SELL crosses to the bid.
    assert_eq!(retry_intent.price, Some(dec("99.0")));
    assert_eq!(
        engine.state("BTCUSDT", PositionSide::Long).mode,
        ExecutionMode::AggressiveLimit
    );
    assert_eq!(gateway.placed.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn retry_also_fires_on_message_text() {
    let gateway = Arc::new(CountingGateway::default());
    let mut engine = ExecutionEngine::new(engine_config(), gateway.clone(), None).expect("engine");

    let rejection = OrderResult::rejected("-9999", "Order would Post Only cross the book");
    let (_, _, retried) =
        maybe_retry_post_only_reject(&mut engine, &gtx_intent(), rejection, &rules(), &market())
            .await;
    assert!(retried);
    assert_eq!(gateway.placed.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn other_rejections_are_not_retried() {
    let gateway = Arc::new(CountingGateway::default());
    let mut engine = ExecutionEngine::new(engine_config(), gateway.clone(), None).expect("engine");

    let rejection = OrderResult::rejected("INSUFFICIENT_FUNDS", "Margin is insufficient.");
    let (intent, result, retried) =
        maybe_retry_post_only_reject(&mut engine, &gtx_intent(), rejection, &rules(), &market())
            .await;

    assert!(!retried);
    assert!(!result.success);
    assert_eq!(intent.time_in_force, TimeInForce::Gtx);
    assert!(gateway.placed.lock().unwrap().is_empty());
    assert_eq!(
        engine.state("BTCUSDT", PositionSide::Long).mode,
        ExecutionMode::MakerOnly
    );
}

#[tokio::test]
async fn gtc_intents_never_retry() {
    let gateway = Arc::new(CountingGateway::default());
    let mut engine = ExecutionEngine::new(engine_config(), gateway.clone(), None).expect("engine");

    let mut intent = gtx_intent();
    intent.time_in_force = TimeInForce::Gtc;
    let rejection = OrderResult::rejected("-5022", "post only rejected");
    let (_, _, retried) =
        maybe_retry_post_only_reject(&mut engine, &intent, rejection, &rules(), &market()).await;
    assert!(!retried);
}
