/*
[INPUT]:  Scripted open-order sweeps across consecutive syncs
[OUTPUT]: External takeover, release, and re-placement flow assertions
[POS]:    Integration tests - protective stop reconciliation over time
[UPDATE]: When the takeover flow changes
*/

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rust_decimal::Decimal;

use usdm_closer_adapter::{InstrumentRule, OpenOrder, OrderIntent, OrderResult, Position, PositionSide};
use usdm_closer_executor::protective_stop::{ProtectiveStopManager, StopExchange, SymbolSyncArgs};

fn dec(value: &str) -> Decimal {
    Decimal::from_str(value).expect("valid decimal")
}

#[derive(Default)]
struct ScriptedExchange {
    orders: Mutex<Vec<OpenOrder>>,
    cancels: Mutex<Vec<String>>,
    places: Mutex<Vec<OrderIntent>>,
}

impl ScriptedExchange {
    fn set_orders(&self, orders: Vec<OpenOrder>) {
        *self.orders.lock().unwrap() = orders;
    }
}

#[async_trait]
impl StopExchange for ScriptedExchange {
    async fn fetch_open_orders_raw(&self, _symbol: &str) -> usdm_closer_adapter::Result<Vec<OpenOrder>> {
        Ok(self.orders.lock().unwrap().clone())
    }

    async fn fetch_open_orders(&self, _symbol: &str) -> usdm_closer_adapter::Result<Vec<OpenOrder>> {
        Ok(self.orders.lock().unwrap().clone())
    }

    async fn fetch_open_algo_orders(&self, _symbol: &str) -> usdm_closer_adapter::Result<Vec<OpenOrder>> {
        Ok(Vec::new())
    }

    async fn cancel_algo_order(&self, _symbol: &str, order_id: &str) -> OrderResult {
        self.cancels.lock().unwrap().push(order_id.to_string());
        OrderResult {
            success: true,
            order_id: Some(order_id.to_string()),
            ..Default::default()
        }
    }

    async fn place_order(&self, intent: &OrderIntent) -> OrderResult {
        self.places.lock().unwrap().push(intent.clone());
        OrderResult {
            success: true,
            order_id: Some(format!("stop-{}", self.places.lock().unwrap().len())),
            ..Default::default()
        }
    }
}

fn rules() -> InstrumentRule {
    InstrumentRule {
        symbol: "ETHUSDT".to_string(),
        tick_size: dec("0.01"),
        step_size: dec("0.001"),
        min_qty: dec("0.001"),
        min_notional: dec("5"),
    }
}

fn short_position(liq: &str) -> Position {
    Position {
        symbol: "ETHUSDT".to_string(),
        position_side: PositionSide::Short,
        position_amt: dec("-1.5"),
        entry_price: dec("2000"),
        unrealized_pnl: Decimal::ZERO,
        leverage: 10,
        mark_price: Some(dec("2000")),
        liquidation_price: Some(dec(liq)),
    }
}

fn external_short_stop(order_id: &str, stop: &str) -> OpenOrder {
    OpenOrder {
        symbol: "ETHUSDT".to_string(),
        order_id: Some(order_id.to_string()),
        client_order_id: Some("manual-1".to_string()),
        position_side: Some(PositionSide::Short),
        order_type: Some("STOP_MARKET".to_string()),
        stop_price: Some(dec(stop)),
        close_position: Some(true),
        reduce_only: Some(true),
        working_type: Some("MARK_PRICE".to_string()),
        status: Some("NEW".to_string()),
    }
}

fn own_short_stop(manager: &ProtectiveStopManager, order_id: &str, stop: &str) -> OpenOrder {
    OpenOrder {
        symbol: "ETHUSDT".to_string(),
        order_id: Some(order_id.to_string()),
        client_order_id: Some(format!("{}-22222", manager.side_prefix("ETHUSDT", PositionSide::Short))),
        position_side: Some(PositionSide::Short),
        order_type: Some("STOP_MARKET".to_string()),
        stop_price: Some(dec(stop)),
        close_position: Some(true),
        reduce_only: Some(true),
        working_type: Some("MARK_PRICE".to_string()),
        status: Some("NEW".to_string()),
    }
}

fn sync_args<'a>(
    positions: &'a HashMap<PositionSide, Position>,
    rules: &'a InstrumentRule,
    reason: &'a str,
) -> SymbolSyncArgs<'a> {
    SymbolSyncArgs {
        symbol: "ETHUSDT",
        rules,
        positions,
        enabled: true,
        dist_to_liq: dec("0.02"),
        external_latch: HashMap::new(),
        reason,
    }
}

#[tokio::test]
async fn takeover_then_release_replaces_own_stop() {
    let exchange = Arc::new(ScriptedExchange::default());
    let manager = ProtectiveStopManager::new(exchange.clone(), "uc-ps-");
    let rules = rules();
    let mut positions = HashMap::new();
    positions.insert(PositionSide::Short, short_position("2100"));

    // Sweep 1: our stop plus a valid foreign stop. We yield.
    exchange.set_orders(vec![
        own_short_stop(&manager, "10", "2058.82"),
        external_short_stop("77", "2050"),
    ]);
    let present = manager.sync_symbol(sync_args(&positions, &rules, "external_stop")).await;
    assert!(present[&PositionSide::Short]);
    assert_eq!(exchange.cancels.lock().unwrap().clone(), vec!["10".to_string()]);
    assert!(exchange.places.lock().unwrap().is_empty());
    assert!(manager.recorded_stop("ETHUSDT", PositionSide::Short).is_none());

    // Sweep 2: the foreign stop is gone. We take the side back.
    exchange.set_orders(Vec::new());
    let present = manager
        .sync_symbol(sync_args(&positions, &rules, "external_takeover_release"))
        .await;
    assert!(!present[&PositionSide::Short]);

    let places = exchange.places.lock().unwrap().clone();
    assert_eq!(places.len(), 1);
    // SHORT: 2100 / 1.02 = 2058.82..., rounded down on the 0.01 tick.
    assert_eq!(places[0].stop_price, Some(dec("2058.82")));
    assert!(places[0].close_position);
    assert!(
        manager
            .recorded_stop("ETHUSDT", PositionSide::Short)
            .is_some()
    );
}

#[tokio::test]
async fn repeat_sync_with_unchanged_inputs_is_idempotent() {
    let exchange = Arc::new(ScriptedExchange::default());
    let manager = ProtectiveStopManager::new(exchange.clone(), "uc-ps-");
    let rules = rules();
    let mut positions = HashMap::new();
    positions.insert(PositionSide::Short, short_position("2100"));

    // First sweep places the stop.
    manager.sync_symbol(sync_args(&positions, &rules, "startup")).await;
    assert_eq!(exchange.places.lock().unwrap().len(), 1);
    let placed = exchange.places.lock().unwrap()[0].clone();

    // The placed stop is now visible on the exchange; a second sweep with
    // identical inputs must not mutate anything.
    exchange.set_orders(vec![OpenOrder {
        symbol: "ETHUSDT".to_string(),
        order_id: Some("stop-1".to_string()),
        client_order_id: placed.client_order_id.clone(),
        position_side: Some(PositionSide::Short),
        order_type: Some("STOP_MARKET".to_string()),
        stop_price: placed.stop_price,
        close_position: Some(true),
        reduce_only: Some(true),
        working_type: Some("MARK_PRICE".to_string()),
        status: Some("NEW".to_string()),
    }]);
    manager.sync_symbol(sync_args(&positions, &rules, "position_update")).await;

    assert_eq!(exchange.places.lock().unwrap().len(), 1);
    assert!(exchange.cancels.lock().unwrap().is_empty());
}

#[tokio::test]
async fn short_stop_tightens_downward_only() {
    let exchange = Arc::new(ScriptedExchange::default());
    let manager = ProtectiveStopManager::new(exchange.clone(), "uc-ps-");
    let rules = rules();
    let mut positions = HashMap::new();

    // Existing own stop at 2058.82; a farther liquidation price would move
    // the stop up (wider), which is forbidden.
    exchange.set_orders(vec![own_short_stop(&manager, "10", "2058.82")]);
    positions.insert(PositionSide::Short, short_position("2200"));
    manager.sync_symbol(sync_args(&positions, &rules, "position_update")).await;
    assert!(exchange.cancels.lock().unwrap().is_empty());
    assert!(exchange.places.lock().unwrap().is_empty());

    // A nearer liquidation price tightens the stop downward; allowed.
    positions.insert(PositionSide::Short, short_position("2050"));
    manager.sync_symbol(sync_args(&positions, &rules, "position_update")).await;
    assert_eq!(exchange.cancels.lock().unwrap().clone(), vec!["10".to_string()]);
    let places = exchange.places.lock().unwrap().clone();
    assert_eq!(places.len(), 1);
    // 2050 / 1.02 = 2009.80..., rounded down.
    assert_eq!(places[0].stop_price, Some(dec("2009.80")));
}
