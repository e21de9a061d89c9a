/*
[INPUT]:  Positions, rules, open-order sweeps, external-takeover latch
[OUTPUT]: Exactly one exchange-side STOP_MARKET per held side, tighten-only
[POS]:    Risk layer - exchange-resident protective stop reconciler
[UPDATE]: When ownership, takeover, or tighten rules change
*/

use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};
use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::{info, warn};

use usdm_closer_adapter::util::{now_ms, round_down_to, round_up_to, stream_symbol};
use usdm_closer_adapter::{
    AlgoOrderUpdate, InstrumentRule, OpenOrder, OrderIntent, OrderResult, OrderUpdate, Position,
    PositionSide,
};

const STOP_ORDER_TYPES: [&str; 4] = ["STOP_MARKET", "TAKE_PROFIT_MARKET", "STOP", "TAKE_PROFIT"];

/// Default minimum distance between a stop and the liquidation price for
/// the stop to count as protective: 0.01%.
const DEFAULT_MIN_DIST_RATIO: Decimal = Decimal::from_parts(1, 0, 0, false, 4);

/// Exchange surface the reconciler needs. Small on purpose so tests can
/// script it.
#[async_trait]
pub trait StopExchange: Send + Sync {
    async fn fetch_open_orders_raw(&self, symbol: &str) -> usdm_closer_adapter::Result<Vec<OpenOrder>>;
    async fn fetch_open_orders(&self, symbol: &str) -> usdm_closer_adapter::Result<Vec<OpenOrder>>;
    async fn fetch_open_algo_orders(&self, symbol: &str) -> usdm_closer_adapter::Result<Vec<OpenOrder>>;
    async fn cancel_algo_order(&self, symbol: &str, order_id: &str) -> OrderResult;
    async fn place_order(&self, intent: &OrderIntent) -> OrderResult;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectiveStopState {
    pub symbol: String,
    pub position_side: PositionSide,
    pub client_order_id: String,
    pub order_id: Option<String>,
    pub stop_price: Option<Decimal>,
}

pub struct SymbolSyncArgs<'a> {
    pub symbol: &'a str,
    pub rules: &'a InstrumentRule,
    pub positions: &'a HashMap<PositionSide, Position>,
    pub enabled: bool,
    pub dist_to_liq: Decimal,
    pub external_latch: HashMap<PositionSide, bool>,
    pub reason: &'a str,
}

type Key = (String, PositionSide);

/// Maintains at most one own conditional stop per `(symbol, side)`.
/// A symbol-level async lock serialises REST sweeps per symbol; different
/// symbols sync concurrently.
pub struct ProtectiveStopManager {
    exchange: Arc<dyn StopExchange>,
    cid_prefix: String,
    states: Mutex<HashMap<Key, ProtectiveStopState>>,
    symbol_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    startup_own_logged: Mutex<HashSet<Key>>,
    startup_external_logged: Mutex<HashSet<Key>>,
    external_multi_sig: Mutex<HashMap<Key, Vec<String>>>,
}

impl ProtectiveStopManager {
    pub fn new(exchange: Arc<dyn StopExchange>, cid_prefix: impl Into<String>) -> Self {
        Self {
            exchange,
            cid_prefix: cid_prefix.into(),
            states: Mutex::new(HashMap::new()),
            symbol_locks: Mutex::new(HashMap::new()),
            startup_own_logged: Mutex::new(HashSet::new()),
            startup_external_logged: Mutex::new(HashSet::new()),
            external_multi_sig: Mutex::new(HashMap::new()),
        }
    }

    fn symbol_lock(&self, symbol: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.symbol_locks
            .lock()
            .expect("symbol locks")
            .entry(symbol.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Stable per-side id prefix: `{cid_prefix}{ws_symbol}-{L|S}`. Survives
    /// restarts, which is how recovery identifies our own stops.
    pub fn side_prefix(&self, symbol: &str, position_side: PositionSide) -> String {
        let ws_symbol = stream_symbol(symbol);
        let prefix = format!("{}{}-{}", self.cid_prefix, ws_symbol, position_side.code());
        if prefix.len() >= 30 {
            // Pathologically long symbols degrade to a hash.
            let mut hasher = std::collections::hash_map::DefaultHasher::new();
            ws_symbol.hash(&mut hasher);
            let digest = hasher.finish() & 0xfff_ffff;
            return format!("{}{digest:07x}-{}", self.cid_prefix, position_side.code());
        }
        prefix
    }

    /// Unique client order id: side prefix + millisecond suffix (ids must be
    /// unique for 7 days; the suffix avoids collisions across replacements).
    pub fn build_client_order_id(&self, symbol: &str, position_side: PositionSide) -> String {
        let prefix = self.side_prefix(symbol, position_side);
        let ts = now_ms() % 100_000;
        let mut cid = format!("{prefix}-{ts}");
        cid.truncate(36);
        cid
    }

    pub fn matches_own(&self, cid: &str, symbol: &str, position_side: PositionSide) -> bool {
        cid.starts_with(&self.side_prefix(symbol, position_side))
    }

    pub fn is_own_algo_order(&self, symbol: &str, algo_id: &str) -> bool {
        if algo_id.is_empty() {
            return false;
        }
        let states = self.states.lock().expect("states");
        PositionSide::both().iter().any(|side| {
            states
                .get(&(symbol.to_string(), *side))
                .and_then(|state| state.order_id.as_deref())
                == Some(algo_id)
        })
    }

    pub fn recorded_stop(&self, symbol: &str, position_side: PositionSide) -> Option<ProtectiveStopState> {
        self.states
            .lock()
            .expect("states")
            .get(&(symbol.to_string(), position_side))
            .cloned()
    }

    /// Stop price such that `|mark − liq| / mark ≈ dist_to_liq` at trigger.
    /// LONG rounds up (fires earlier), SHORT rounds down.
    pub fn compute_stop_price(
        &self,
        position_side: PositionSide,
        liquidation_price: Decimal,
        dist_to_liq: Decimal,
        tick_size: Decimal,
    ) -> Result<Decimal> {
        if liquidation_price <= Decimal::ZERO {
            bail!("liquidation_price must be > 0");
        }
        if dist_to_liq <= Decimal::ZERO || dist_to_liq >= Decimal::ONE {
            bail!("dist_to_liq must be in (0, 1)");
        }
        Ok(match position_side {
            PositionSide::Long => {
                round_up_to(liquidation_price / (Decimal::ONE - dist_to_liq), tick_size)
            }
            PositionSide::Short => {
                round_down_to(liquidation_price / (Decimal::ONE + dist_to_liq), tick_size)
            }
        })
    }

    /// A stop is valid when it triggers strictly before liquidation:
    /// LONG above `liq·(1+ε)`, SHORT below `liq·(1−ε)`.
    pub fn is_stop_price_valid(
        &self,
        position_side: PositionSide,
        stop_price: Decimal,
        liquidation_price: Decimal,
        min_dist_ratio: Decimal,
    ) -> bool {
        if liquidation_price <= Decimal::ZERO || stop_price <= Decimal::ZERO {
            return false;
        }
        match position_side {
            PositionSide::Long => stop_price > liquidation_price * (Decimal::ONE + min_dist_ratio),
            PositionSide::Short => stop_price < liquidation_price * (Decimal::ONE - min_dist_ratio),
        }
    }

    /// Terminal update for one of our stops clears the local record; the
    /// caller schedules a resync.
    pub fn on_order_update(&self, update: &OrderUpdate) {
        if update.client_order_id.is_empty() || !update.status.is_terminal() {
            return;
        }
        for side in PositionSide::both() {
            if !self.matches_own(&update.client_order_id, &update.symbol, side) {
                continue;
            }
            let removed = self
                .states
                .lock()
                .expect("states")
                .remove(&(update.symbol.clone(), side));
            if removed.is_some() {
                info!(
                    symbol = %update.symbol,
                    side = side.as_str(),
                    risk_stage = "protective_stop",
                    reason = format!("order_update={}", update.status.as_str()),
                    order_id = %update.order_id,
                    "protective stop record cleared"
                );
            }
        }
    }

    /// Same for ALGO_UPDATE terminal states. Callers pre-filter to our own
    /// orders by prefix.
    pub fn on_algo_order_update(&self, update: &AlgoOrderUpdate) {
        if !update.is_terminal() {
            return;
        }
        for side in PositionSide::both() {
            if !self.matches_own(&update.client_algo_id, &update.symbol, side) {
                continue;
            }
            let removed = self
                .states
                .lock()
                .expect("states")
                .remove(&(update.symbol.clone(), side));
            if removed.is_some() {
                info!(
                    symbol = %update.symbol,
                    side = side.as_str(),
                    risk_stage = "protective_stop",
                    reason = format!("algo_update={}", update.status),
                    algo_id = %update.algo_id,
                    "protective stop record cleared"
                );
            }
        }
    }

    /// Reconcile one symbol against the exchange. Returns external-stop
    /// presence per side so the orchestrator can settle the takeover latch.
    pub async fn sync_symbol(&self, args: SymbolSyncArgs<'_>) -> HashMap<PositionSide, bool> {
        let lock = self.symbol_lock(args.symbol);
        let _guard = lock.lock().await;

        let mut no_external = HashMap::new();
        no_external.insert(PositionSide::Long, false);
        no_external.insert(PositionSide::Short, false);

        // Raw open orders are authoritative here: the normalised view may
        // drop closePosition stops with origQty=0.
        let open_orders = match self.exchange.fetch_open_orders_raw(args.symbol).await {
            Ok(orders) => orders,
            Err(err) => {
                warn!(symbol = args.symbol, error = %err, reason = args.reason, "raw open orders fetch failed");
                match self.exchange.fetch_open_orders(args.symbol).await {
                    Ok(orders) => orders,
                    Err(err) => {
                        warn!(symbol = args.symbol, error = %err, "protective stop sync aborted: open orders unavailable");
                        return no_external;
                    }
                }
            }
        };
        let algo_orders = match self.exchange.fetch_open_algo_orders(args.symbol).await {
            Ok(orders) => orders,
            Err(err) => {
                warn!(symbol = args.symbol, error = %err, "protective stop sync aborted: algo orders unavailable");
                return no_external;
            }
        };

        let mut own_by_side: HashMap<PositionSide, Vec<OpenOrder>> = HashMap::new();
        let mut external_by_side: HashMap<PositionSide, Vec<OpenOrder>> = HashMap::new();

        for order in open_orders.into_iter().chain(algo_orders) {
            let Some(side) = order.position_side else {
                continue;
            };
            let owned = order
                .client_order_id
                .as_deref()
                .is_some_and(|cid| self.matches_own(cid, args.symbol, side));
            if owned {
                own_by_side.entry(side).or_default().push(order);
            } else if is_close_position_stop(&order) || is_reduce_only_stop(&order) {
                external_by_side.entry(side).or_default().push(order);
            }
        }

        self.warn_on_multiple_externals(args.symbol, &external_by_side);
        if args.reason == "startup" {
            self.log_startup_orders(args.symbol, &own_by_side, &external_by_side);
        }

        let mut external_present = HashMap::new();
        for side in PositionSide::both() {
            let has_external = external_by_side.get(&side).is_some_and(|orders| !orders.is_empty());
            external_present.insert(side, has_external);
            self.sync_side(SideSync {
                symbol: args.symbol,
                side,
                rules: args.rules,
                position: args.positions.get(&side),
                enabled: args.enabled,
                dist_to_liq: args.dist_to_liq,
                existing_orders: own_by_side.remove(&side).unwrap_or_default(),
                external_orders: external_by_side.remove(&side).unwrap_or_default(),
                latched: *args.external_latch.get(&side).unwrap_or(&false),
            })
            .await;
        }

        external_present
    }

    fn warn_on_multiple_externals(
        &self,
        symbol: &str,
        external_by_side: &HashMap<PositionSide, Vec<OpenOrder>>,
    ) {
        for side in PositionSide::both() {
            let Some(externals) = external_by_side.get(&side) else {
                continue;
            };
            if externals.len() <= 1 {
                continue;
            }
            let mut ids: Vec<String> = externals
                .iter()
                .filter_map(|o| o.order_id.clone())
                .collect();
            ids.sort();
            if ids.is_empty() {
                continue;
            }
            let key = (symbol.to_string(), side);
            let mut sigs = self.external_multi_sig.lock().expect("multi sig");
            if sigs.get(&key) == Some(&ids) {
                continue;
            }
            sigs.insert(key, ids.clone());
            warn!(
                symbol,
                side = side.as_str(),
                risk_stage = "protective_stop",
                reason = "external_stop_multiple",
                count = externals.len(),
                order_ids = ?ids,
                "multiple external stops on one side"
            );
        }
    }

    fn log_startup_orders(
        &self,
        symbol: &str,
        own_by_side: &HashMap<PositionSide, Vec<OpenOrder>>,
        external_by_side: &HashMap<PositionSide, Vec<OpenOrder>>,
    ) {
        for side in PositionSide::both() {
            let key = (symbol.to_string(), side);
            if let Some(existing) = own_by_side.get(&side).filter(|v| !v.is_empty())
                && self.startup_own_logged.lock().expect("own logged").insert(key.clone())
            {
                let first = &existing[0];
                info!(
                    symbol,
                    side = side.as_str(),
                    risk_stage = "protective_stop",
                    reason = "startup_existing_own_stop",
                    count = existing.len(),
                    order_id = first.order_id.as_deref().unwrap_or(""),
                    client_order_id = first.client_order_id.as_deref().unwrap_or(""),
                    "existing own protective stop found at startup"
                );
            }
            if self
                .startup_external_logged
                .lock()
                .expect("external logged")
                .insert(key)
                && let Some(externals) = external_by_side.get(&side).filter(|v| !v.is_empty())
            {
                let sample = &externals[0];
                info!(
                    symbol,
                    side = side.as_str(),
                    risk_stage = "protective_stop",
                    reason = "startup_existing_external_stop",
                    order_id = sample.order_id.as_deref().unwrap_or(""),
                    client_order_id = sample.client_order_id.as_deref().unwrap_or(""),
                    stop_price = sample.stop_price.map(|p| p.to_string()).unwrap_or_default(),
                    working_type = sample.working_type.as_deref().unwrap_or(""),
                    "external stop found at startup"
                );
            }
        }
    }

    async fn sync_side(&self, sync: SideSync<'_>) {
        let key = (sync.symbol.to_string(), sync.side);

        // Cull duplicate own orders; keep the first.
        let mut existing = sync.existing_orders.into_iter();
        let keep_order = existing.next();
        for extra in existing {
            if let Some(order_id) = extra.order_id.as_deref() {
                let result = self.exchange.cancel_algo_order(sync.symbol, order_id).await;
                if !result.success {
                    warn!(
                        symbol = sync.symbol,
                        order_id,
                        error = result.error_message.as_deref().unwrap_or(""),
                        "duplicate protective stop cancel failed"
                    );
                }
            }
        }

        let has_position = sync
            .position
            .map(|p| p.position_amt.abs() > Decimal::ZERO)
            .unwrap_or(false);

        // Disabled or flat: no own stop may remain.
        if !sync.enabled || !has_position {
            if let Some(order) = &keep_order
                && let Some(order_id) = order.order_id.as_deref()
            {
                let result = self.exchange.cancel_algo_order(sync.symbol, order_id).await;
                if result.success {
                    info!(
                        symbol = sync.symbol,
                        side = sync.side.as_str(),
                        risk_stage = "protective_stop",
                        reason = if has_position { "cancel_disabled" } else { "cancel_no_position" },
                        order_id,
                        "own protective stop canceled"
                    );
                } else {
                    warn!(
                        symbol = sync.symbol,
                        order_id,
                        error = result.error_message.as_deref().unwrap_or(""),
                        "protective stop cancel failed"
                    );
                }
            }
            self.states.lock().expect("states").remove(&key);
            return;
        }

        let position = sync.position.expect("position present");
        let liq_price = position.liquidation_price;
        let mut latched = sync.latched;

        if !sync.external_orders.is_empty() {
            let mut has_unknown_external = false;
            let mut valid_externals: Vec<&OpenOrder> = Vec::new();
            let mut invalid_externals: Vec<&OpenOrder> = Vec::new();

            for order in &sync.external_orders {
                let Some(stop_price) = order.stop_price else {
                    // Cannot judge it: keep conservatively.
                    has_unknown_external = true;
                    continue;
                };
                match liq_price.filter(|p| *p > Decimal::ZERO) {
                    Some(liq) => {
                        if self.is_stop_price_valid(sync.side, stop_price, liq, DEFAULT_MIN_DIST_RATIO) {
                            valid_externals.push(order);
                        } else {
                            invalid_externals.push(order);
                        }
                    }
                    None => has_unknown_external = true,
                }
            }

            let mut invalid_detected = false;
            for invalid in &invalid_externals {
                let Some(order_id) = invalid.order_id.as_deref() else {
                    continue;
                };
                invalid_detected = true;
                let result = self.exchange.cancel_algo_order(sync.symbol, order_id).await;
                if result.success {
                    info!(
                        symbol = sync.symbol,
                        side = sync.side.as_str(),
                        risk_stage = "protective_stop",
                        reason = "cancel_invalid_external_stop",
                        order_id,
                        external_stop_price = invalid.stop_price.map(|p| p.to_string()).unwrap_or_default(),
                        liquidation_price = liq_price.map(|p| p.to_string()).unwrap_or_default(),
                        "invalid external stop canceled"
                    );
                } else {
                    warn!(
                        symbol = sync.symbol,
                        order_id,
                        error = result.error_message.as_deref().unwrap_or(""),
                        "invalid external stop cancel failed"
                    );
                }
            }

            if !valid_externals.is_empty() || has_unknown_external {
                // Valid external takeover: withdraw and stop maintaining.
                if let Some(order) = &keep_order
                    && let Some(order_id) = order.order_id.as_deref()
                {
                    let result = self.exchange.cancel_algo_order(sync.symbol, order_id).await;
                    if !result.success {
                        warn!(
                            symbol = sync.symbol,
                            order_id,
                            error = result.error_message.as_deref().unwrap_or(""),
                            "own stop cancel failed during external takeover"
                        );
                        return;
                    }
                    info!(
                        symbol = sync.symbol,
                        side = sync.side.as_str(),
                        risk_stage = "protective_stop",
                        reason = "cancel_own_due_to_external_stop",
                        order_id,
                        "own protective stop yielded to external"
                    );
                }
                self.states.lock().expect("states").remove(&key);
                return;
            }

            // Only invalid externals existed; we just removed them, so the
            // latch no longer reflects reality for this sweep.
            if invalid_detected {
                latched = false;
            }
        }

        // While latched, no cancels and no placements on this side.
        if latched {
            return;
        }

        let Some(liquidation_price) = liq_price.filter(|p| *p > Decimal::ZERO) else {
            info!(
                symbol = sync.symbol,
                side = sync.side.as_str(),
                risk_stage = "protective_stop",
                reason = "skip_missing_liquidation_price",
                "protective stop skipped"
            );
            return;
        };

        let desired_stop_price = match self.compute_stop_price(
            sync.side,
            liquidation_price,
            sync.dist_to_liq,
            sync.rules.tick_size,
        ) {
            Ok(price) => price,
            Err(err) => {
                warn!(symbol = sync.symbol, side = sync.side.as_str(), error = %err, "stop price computation failed");
                return;
            }
        };

        let existing_order_id = keep_order.as_ref().and_then(|o| o.order_id.clone());
        let existing_cid = keep_order.as_ref().and_then(|o| o.client_order_id.clone());
        let existing_norm = keep_order
            .as_ref()
            .and_then(|o| o.stop_price)
            .map(|p| round_down_to(p, sync.rules.tick_size));
        let desired_norm = round_down_to(desired_stop_price, sync.rules.tick_size);
        let desired_cid = self.build_client_order_id(sync.symbol, sync.side);

        if let Some(existing_norm) = existing_norm {
            let widens = match sync.side {
                // LONG tightens upward; SHORT tightens downward.
                PositionSide::Long => desired_norm < existing_norm,
                PositionSide::Short => desired_norm > existing_norm,
            };
            if widens || existing_norm == desired_norm {
                self.states.lock().expect("states").insert(
                    key,
                    ProtectiveStopState {
                        symbol: sync.symbol.to_string(),
                        position_side: sync.side,
                        client_order_id: existing_cid.unwrap_or(desired_cid),
                        order_id: existing_order_id,
                        stop_price: Some(existing_norm),
                    },
                );
                return;
            }
        }

        // Replace: cancel first, never place on a failed cancel.
        if let Some(order_id) = existing_order_id.as_deref() {
            let result = self.exchange.cancel_algo_order(sync.symbol, order_id).await;
            if !result.success {
                warn!(
                    symbol = sync.symbol,
                    order_id,
                    error = result.error_message.as_deref().unwrap_or(""),
                    "protective stop cancel failed; placement skipped"
                );
                return;
            }
        }

        let intent = OrderIntent::stop_market_close(
            sync.symbol,
            sync.side,
            desired_stop_price,
            desired_cid.clone(),
        );
        let result = self.exchange.place_order(&intent).await;
        let Some(order_id) = result.order_id.clone().filter(|_| result.success) else {
            warn!(
                symbol = sync.symbol,
                side = sync.side.as_str(),
                error = result.error_message.as_deref().unwrap_or(""),
                "protective stop placement failed"
            );
            return;
        };

        self.states.lock().expect("states").insert(
            key,
            ProtectiveStopState {
                symbol: sync.symbol.to_string(),
                position_side: sync.side,
                client_order_id: desired_cid,
                order_id: Some(order_id.clone()),
                stop_price: Some(desired_stop_price),
            },
        );
        info!(
            symbol = sync.symbol,
            side = sync.side.as_str(),
            risk_stage = "protective_stop",
            reason = "place_or_update",
            order_id,
            price = %desired_stop_price,
            "protective stop placed"
        );
    }
}

struct SideSync<'a> {
    symbol: &'a str,
    side: PositionSide,
    rules: &'a InstrumentRule,
    position: Option<&'a Position>,
    enabled: bool,
    dist_to_liq: Decimal,
    existing_orders: Vec<OpenOrder>,
    external_orders: Vec<OpenOrder>,
    latched: bool,
}

/// closePosition stop of a conditional type.
fn is_close_position_stop(order: &OpenOrder) -> bool {
    order.close_position == Some(true)
        && order
            .order_type
            .as_deref()
            .is_some_and(|t| STOP_ORDER_TYPES.contains(&t))
}

/// reduceOnly conditional stop; takeover only applies when the side is
/// attributable.
fn is_reduce_only_stop(order: &OpenOrder) -> bool {
    order.reduce_only == Some(true)
        && order
            .order_type
            .as_deref()
            .is_some_and(|t| STOP_ORDER_TYPES.contains(&t))
        && order.position_side.is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use std::sync::Mutex as StdMutex;

    fn dec(value: &str) -> Decimal {
        Decimal::from_str(value).expect("valid decimal")
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

    fn position(side: PositionSide, amt: &str, liq: Option<&str>) -> Position {
        Position {
            symbol: "BTCUSDT".to_string(),
            position_side: side,
            position_amt: dec(amt),
            entry_price: dec("100"),
            unrealized_pnl: Decimal::ZERO,
            leverage: 20,
            mark_price: Some(dec("100")),
            liquidation_price: liq.map(dec),
        }
    }

    fn own_stop(manager: &ProtectiveStopManager, side: PositionSide, order_id: &str, stop: &str) -> OpenOrder {
        OpenOrder {
            symbol: "BTCUSDT".to_string(),
            order_id: Some(order_id.to_string()),
            client_order_id: Some(format!("{}-11111", manager.side_prefix("BTCUSDT", side))),
            position_side: Some(side),
            order_type: Some("STOP_MARKET".to_string()),
            stop_price: Some(dec(stop)),
            close_position: Some(true),
            reduce_only: Some(true),
            working_type: Some("MARK_PRICE".to_string()),
            status: Some("NEW".to_string()),
        }
    }

    fn external_stop(side: PositionSide, order_id: &str, stop: &str) -> OpenOrder {
        OpenOrder {
            symbol: "BTCUSDT".to_string(),
            order_id: Some(order_id.to_string()),
            client_order_id: Some("manual-stop-1".to_string()),
            position_side: Some(side),
            order_type: Some("STOP_MARKET".to_string()),
            stop_price: Some(dec(stop)),
            close_position: Some(true),
            reduce_only: Some(true),
            working_type: Some("MARK_PRICE".to_string()),
            status: Some("NEW".to_string()),
        }
    }

    #[derive(Default)]
    struct MockStopExchange {
        orders: StdMutex<Vec<OpenOrder>>,
        algo_orders: StdMutex<Vec<OpenOrder>>,
        cancels: StdMutex<Vec<String>>,
        places: StdMutex<Vec<OrderIntent>>,
        fail_cancels: StdMutex<bool>,
    }

    impl MockStopExchange {
        fn set_orders(&self, orders: Vec<OpenOrder>) {
            *self.orders.lock().unwrap() = orders;
        }

        fn cancels(&self) -> Vec<String> {
            self.cancels.lock().unwrap().clone()
        }

        fn places(&self) -> Vec<OrderIntent> {
            self.places.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl StopExchange for MockStopExchange {
        async fn fetch_open_orders_raw(&self, _symbol: &str) -> usdm_closer_adapter::Result<Vec<OpenOrder>> {
            Ok(self.orders.lock().unwrap().clone())
        }

        async fn fetch_open_orders(&self, _symbol: &str) -> usdm_closer_adapter::Result<Vec<OpenOrder>> {
            Ok(self.orders.lock().unwrap().clone())
        }

        async fn fetch_open_algo_orders(&self, _symbol: &str) -> usdm_closer_adapter::Result<Vec<OpenOrder>> {
            Ok(self.algo_orders.lock().unwrap().clone())
        }

        async fn cancel_algo_order(&self, _symbol: &str, order_id: &str) -> OrderResult {
            self.cancels.lock().unwrap().push(order_id.to_string());
            if *self.fail_cancels.lock().unwrap() {
                OrderResult::failed("cancel refused")
            } else {
                OrderResult {
                    success: true,
                    order_id: Some(order_id.to_string()),
                    ..Default::default()
                }
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

    fn manager(exchange: Arc<MockStopExchange>) -> ProtectiveStopManager {
        ProtectiveStopManager::new(exchange, "uc-ps-")
    }

    fn args<'a>(
        positions: &'a HashMap<PositionSide, Position>,
        rules: &'a InstrumentRule,
        latch: HashMap<PositionSide, bool>,
        reason: &'a str,
    ) -> SymbolSyncArgs<'a> {
        SymbolSyncArgs {
            symbol: "BTCUSDT",
            rules,
            positions,
            enabled: true,
            dist_to_liq: dec("0.01"),
            external_latch: latch,
            reason,
        }
    }

    #[test]
    fn stop_price_rounds_toward_earlier_trigger() {
        let m = manager(Arc::new(MockStopExchange::default()));
        // LONG: 99 / 0.99 = 100.0 -> rounds up on the 0.1 tick.
        let long = m
            .compute_stop_price(PositionSide::Long, dec("99"), dec("0.01"), dec("0.1"))
            .unwrap();
        assert_eq!(long, dec("100.0"));
        // SHORT: 101 / 1.01 = 100.0 -> rounds down.
        let short = m
            .compute_stop_price(PositionSide::Short, dec("101"), dec("0.01"), dec("0.1"))
            .unwrap();
        assert_eq!(short, dec("100.0"));
        // Unaligned values keep the direction.
        let long = m
            .compute_stop_price(PositionSide::Long, dec("99.5"), dec("0.013"), dec("0.1"))
            .unwrap();
        assert!(long >= dec("99.5") / (Decimal::ONE - dec("0.013")));

        assert!(m.compute_stop_price(PositionSide::Long, dec("0"), dec("0.01"), dec("0.1")).is_err());
        assert!(m.compute_stop_price(PositionSide::Long, dec("99"), dec("1"), dec("0.1")).is_err());
    }

    #[test]
    fn stop_validity_checks_side_of_liquidation() {
        let m = manager(Arc::new(MockStopExchange::default()));
        let eps = dec("0.0001");
        assert!(m.is_stop_price_valid(PositionSide::Long, dec("100"), dec("99"), eps));
        assert!(!m.is_stop_price_valid(PositionSide::Long, dec("99"), dec("99"), eps));
        assert!(!m.is_stop_price_valid(PositionSide::Long, dec("98"), dec("99"), eps));
        assert!(m.is_stop_price_valid(PositionSide::Short, dec("100"), dec("101"), eps));
        assert!(!m.is_stop_price_valid(PositionSide::Short, dec("102"), dec("101"), eps));
    }

    #[tokio::test]
    async fn places_stop_for_open_position() {
        let exchange = Arc::new(MockStopExchange::default());
        let m = manager(exchange.clone());
        let rules = rules();
        let mut positions = HashMap::new();
        positions.insert(PositionSide::Long, position(PositionSide::Long, "0.5", Some("99")));

        m.sync_symbol(args(&positions, &rules, HashMap::new(), "startup")).await;

        let places = exchange.places();
        assert_eq!(places.len(), 1);
        let intent = &places[0];
        assert_eq!(intent.stop_price, Some(dec("100.0")));
        assert!(intent.close_position);
        assert!(intent.is_risk);
        assert!(intent.client_order_id.as_deref().unwrap().starts_with("uc-ps-btcusdt-L"));
        assert!(m.recorded_stop("BTCUSDT", PositionSide::Long).is_some());
    }

    #[tokio::test]
    async fn tighten_only_never_widens() {
        let exchange = Arc::new(MockStopExchange::default());
        let m = manager(exchange.clone());
        let rules = rules();

        // Existing own stop at 101.1; desired (liq 97.9) would be lower.
        exchange.set_orders(vec![own_stop(&m, PositionSide::Long, "5", "101.1")]);
        let mut positions = HashMap::new();
        positions.insert(PositionSide::Long, position(PositionSide::Long, "0.5", Some("97.9")));

        m.sync_symbol(args(&positions, &rules, HashMap::new(), "position_update")).await;
        assert!(exchange.cancels().is_empty());
        assert!(exchange.places().is_empty());
        let recorded = m.recorded_stop("BTCUSDT", PositionSide::Long).expect("state");
        assert_eq!(recorded.stop_price, Some(dec("101.1")));

        // Desired above the existing stop: replace at 101.2.
        positions.insert(PositionSide::Long, position(PositionSide::Long, "0.5", Some("100.1")));
        m.sync_symbol(args(&positions, &rules, HashMap::new(), "position_update")).await;
        assert_eq!(exchange.cancels(), vec!["5".to_string()]);
        let places = exchange.places();
        assert_eq!(places.len(), 1);
        assert_eq!(places[0].stop_price, Some(dec("101.2")));
    }

    #[tokio::test]
    async fn equal_stop_price_is_a_no_op() {
        let exchange = Arc::new(MockStopExchange::default());
        let m = manager(exchange.clone());
        let rules = rules();
        // liq 99, dist 0.01 -> desired exactly 100.0 == existing.
        exchange.set_orders(vec![own_stop(&m, PositionSide::Long, "5", "100.0")]);
        let mut positions = HashMap::new();
        positions.insert(PositionSide::Long, position(PositionSide::Long, "0.5", Some("99")));

        m.sync_symbol(args(&positions, &rules, HashMap::new(), "position_update")).await;
        assert!(exchange.cancels().is_empty());
        assert!(exchange.places().is_empty());
    }

    #[tokio::test]
    async fn failed_cancel_blocks_replacement() {
        let exchange = Arc::new(MockStopExchange::default());
        *exchange.fail_cancels.lock().unwrap() = true;
        let m = manager(exchange.clone());
        let rules = rules();
        exchange.set_orders(vec![own_stop(&m, PositionSide::Long, "5", "100.0")]);
        let mut positions = HashMap::new();
        // Desired 101.2 > existing: replacement wanted, but cancel fails.
        positions.insert(PositionSide::Long, position(PositionSide::Long, "0.5", Some("100.1")));

        m.sync_symbol(args(&positions, &rules, HashMap::new(), "position_update")).await;
        assert_eq!(exchange.cancels().len(), 1);
        assert!(exchange.places().is_empty());
    }

    #[tokio::test]
    async fn valid_external_stop_takes_over() {
        let exchange = Arc::new(MockStopExchange::default());
        let m = manager(exchange.clone());
        let rules = rules();
        exchange.set_orders(vec![
            own_stop(&m, PositionSide::Short, "5", "100.0"),
            external_stop(PositionSide::Short, "77", "100.5"),
        ]);
        let mut positions = HashMap::new();
        positions.insert(PositionSide::Short, position(PositionSide::Short, "-0.5", Some("101")));

        let present = m
            .sync_symbol(args(&positions, &rules, HashMap::new(), "external_stop")).await;
        assert_eq!(present[&PositionSide::Short], true);
        // Own stop yielded; no replacement placed.
        assert_eq!(exchange.cancels(), vec!["5".to_string()]);
        assert!(exchange.places().is_empty());
        assert!(m.recorded_stop("BTCUSDT", PositionSide::Short).is_none());
    }

    #[tokio::test]
    async fn invalid_external_stop_is_removed_and_replaced() {
        let exchange = Arc::new(MockStopExchange::default());
        let m = manager(exchange.clone());
        let rules = rules();
        // SHORT stop above liquidation price triggers after liquidation:
        // invalid, cancel it and take over.
        exchange.set_orders(vec![external_stop(PositionSide::Short, "77", "102")]);
        let mut positions = HashMap::new();
        positions.insert(PositionSide::Short, position(PositionSide::Short, "-0.5", Some("101")));

        m.sync_symbol(args(&positions, &rules, HashMap::new(), "external_stop")).await;
        assert_eq!(exchange.cancels(), vec!["77".to_string()]);
        assert_eq!(exchange.places().len(), 1);
        // SHORT: 101 / 1.01 = 100.0 rounded down.
        assert_eq!(exchange.places()[0].stop_price, Some(dec("100.0")));
    }

    #[tokio::test]
    async fn latch_freezes_the_side() {
        let exchange = Arc::new(MockStopExchange::default());
        let m = manager(exchange.clone());
        let rules = rules();
        exchange.set_orders(vec![own_stop(&m, PositionSide::Long, "5", "100.0")]);
        let mut positions = HashMap::new();
        // Tighten would normally fire, but the latch holds the side.
        positions.insert(PositionSide::Long, position(PositionSide::Long, "0.5", Some("100.1")));

        let mut latch = HashMap::new();
        latch.insert(PositionSide::Long, true);
        m.sync_symbol(args(&positions, &rules, latch, "external_takeover_verify")).await;
        assert!(exchange.cancels().is_empty());
        assert!(exchange.places().is_empty());
    }

    #[tokio::test]
    async fn flat_position_cancels_own_stop() {
        let exchange = Arc::new(MockStopExchange::default());
        let m = manager(exchange.clone());
        let rules = rules();
        exchange.set_orders(vec![own_stop(&m, PositionSide::Long, "5", "100.0")]);
        let positions = HashMap::new();

        m.sync_symbol(args(&positions, &rules, HashMap::new(), "position_update")).await;
        assert_eq!(exchange.cancels(), vec!["5".to_string()]);
        assert!(exchange.places().is_empty());
        assert!(m.recorded_stop("BTCUSDT", PositionSide::Long).is_none());
    }

    #[tokio::test]
    async fn duplicate_own_stops_are_culled() {
        let exchange = Arc::new(MockStopExchange::default());
        let m = manager(exchange.clone());
        let rules = rules();
        exchange.set_orders(vec![
            own_stop(&m, PositionSide::Long, "5", "100.0"),
            own_stop(&m, PositionSide::Long, "6", "99.8"),
        ]);
        let mut positions = HashMap::new();
        positions.insert(PositionSide::Long, position(PositionSide::Long, "0.5", Some("99")));

        m.sync_symbol(args(&positions, &rules, HashMap::new(), "position_update")).await;
        // The duplicate (second) order is cancelled; the first is kept and
        // matches the desired price, so no further mutation happens.
        assert_eq!(exchange.cancels(), vec!["6".to_string()]);
        assert!(exchange.places().is_empty());
    }

    #[tokio::test]
    async fn missing_liquidation_price_skips_placement() {
        let exchange = Arc::new(MockStopExchange::default());
        let m = manager(exchange.clone());
        let rules = rules();
        let mut positions = HashMap::new();
        positions.insert(PositionSide::Long, position(PositionSide::Long, "0.5", None));

        m.sync_symbol(args(&positions, &rules, HashMap::new(), "startup")).await;
        assert!(exchange.places().is_empty());
    }

    #[tokio::test]
    async fn terminal_updates_clear_local_record() {
        let exchange = Arc::new(MockStopExchange::default());
        let m = manager(exchange.clone());
        let rules = rules();
        let mut positions = HashMap::new();
        positions.insert(PositionSide::Long, position(PositionSide::Long, "0.5", Some("99")));
        m.sync_symbol(args(&positions, &rules, HashMap::new(), "startup")).await;
        let recorded = m.recorded_stop("BTCUSDT", PositionSide::Long).expect("state");

        let update = AlgoOrderUpdate {
            symbol: "BTCUSDT".to_string(),
            algo_id: recorded.order_id.clone().unwrap(),
            client_algo_id: recorded.client_order_id.clone(),
            side: usdm_closer_adapter::Side::Sell,
            status: "CANCELED".to_string(),
            timestamp_ms: 1,
            order_type: Some("STOP_MARKET".to_string()),
            position_side: Some(PositionSide::Long),
            close_position: Some(true),
            reduce_only: Some(true),
        };
        m.on_algo_order_update(&update);
        assert!(m.recorded_stop("BTCUSDT", PositionSide::Long).is_none());
    }

    #[test]
    fn client_order_id_fits_exchange_limit() {
        let m = manager(Arc::new(MockStopExchange::default()));
        let cid = m.build_client_order_id("BTCUSDT", PositionSide::Long);
        assert!(cid.len() <= 36);
        assert!(cid.starts_with("uc-ps-btcusdt-L-"));
        assert!(m.matches_own(&cid, "BTCUSDT", PositionSide::Long));
        assert!(!m.matches_own(&cid, "BTCUSDT", PositionSide::Short));
    }
}
