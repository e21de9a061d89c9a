/*
[INPUT]:  ExitSignal / panic requests, OrderResult, OrderUpdate, instrument rules
[OUTPUT]: OrderIntent via the gateway + per-side state transitions
          (mode rotation, TTL timeouts, late-fill reconciliation, fill-rate feedback)
[POS]:    Execution layer - per symbol+side state machine
[UPDATE]: When pricing, sizing, rotation, or reconciliation semantics change
*/

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use usdm_closer_adapter::util::round_down_to;
use usdm_closer_adapter::{
    InstrumentRule, OrderIntent, OrderResult, OrderStatus, OrderUpdate, PositionSide, TimeInForce,
    TradeMeta,
};

use crate::config::{FillRateConfig, MergedSymbolConfig};
use crate::signal::{ExitSignal, MarketState};

/// Per-side lifecycle. IDLE is the only state that consumes a new signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    Idle,
    Placing,
    Waiting,
    Canceling,
    Cooldown,
}

impl ExecutionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionState::Idle => "idle",
            ExecutionState::Placing => "placing",
            ExecutionState::Waiting => "waiting",
            ExecutionState::Canceling => "canceling",
            ExecutionState::Cooldown => "cooldown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    MakerOnly,
    AggressiveLimit,
}

impl ExecutionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionMode::MakerOnly => "maker_only",
            ExecutionMode::AggressiveLimit => "aggressive_limit",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum MakerPriceMode {
    #[serde(rename = "at_touch")]
    AtTouch,
    #[default]
    #[serde(rename = "inside_spread_1tick")]
    InsideSpread1Tick,
    #[serde(rename = "custom_ticks")]
    CustomTicks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillRateBucket {
    Low,
    Mid,
    High,
}

impl FillRateBucket {
    pub fn as_str(self) -> &'static str {
        match self {
            FillRateBucket::Low => "low",
            FillRateBucket::Mid => "mid",
            FillRateBucket::High => "high",
        }
    }
}

/// Order placement/cancellation seam. Implementations fold transport
/// failures into `OrderResult` so the state machine never unwinds on
/// exchange trouble.
#[async_trait]
pub trait OrderGateway: Send + Sync {
    async fn place_order(&self, intent: &OrderIntent) -> OrderResult;
    async fn cancel_order(&self, symbol: &str, order_id: &str, is_risk: bool) -> OrderResult;
    async fn fetch_order_trade_meta(&self, symbol: &str, order_id: &str) -> TradeMeta;
}

/// Completed-fill notification; must not block.
#[derive(Debug, Clone)]
pub struct FillEvent {
    pub symbol: String,
    pub position_side: PositionSide,
    pub mode: ExecutionMode,
    pub filled_qty: Decimal,
    pub avg_price: Decimal,
    pub reason: String,
    pub role: Option<&'static str>,
    pub realized_pnl: Option<Decimal>,
    pub fee: Option<Decimal>,
    pub fee_asset: Option<String>,
}

pub trait FillListener: Send + Sync {
    fn on_fill(&self, event: &FillEvent);
}

/// Mutable state of one `(symbol, position_side)` key.
#[derive(Debug, Clone)]
pub struct SideState {
    pub symbol: String,
    pub position_side: PositionSide,
    pub state: ExecutionState,
    pub mode: ExecutionMode,

    pub current_order_id: Option<String>,
    pub current_order_placed_ms: i64,
    pub current_order_mode: Option<ExecutionMode>,
    pub current_order_reason: Option<String>,
    pub current_order_is_risk: bool,
    pub current_order_filled_qty: Decimal,

    pub last_completed_order_id: Option<String>,
    pub last_completed_ms: i64,
    pub pending_fill_log: bool,
    pub last_completed_filled_qty: Decimal,
    pub last_completed_avg_price: Decimal,
    pub last_completed_mode: Option<ExecutionMode>,
    pub last_completed_reason: Option<String>,
    pub last_completed_realized_pnl: Option<Decimal>,
    pub last_completed_fee: Option<Decimal>,
    pub last_completed_fee_asset: Option<String>,

    /// Panic overrides; meaningful only while `risk_active`.
    pub risk_active: bool,
    pub ttl_ms_override: Option<i64>,
    pub maker_timeouts_to_escalate_override: Option<i32>,

    pub maker_timeout_count: i32,
    pub aggr_timeout_count: i32,
    pub aggr_fill_count: i32,

    pub recent_maker_submits: VecDeque<i64>,
    pub recent_maker_fills: VecDeque<i64>,
    pub fill_rate: Option<Decimal>,
    pub fill_rate_bucket: Option<FillRateBucket>,
    pub fill_rate_maker_timeouts_override: Option<i32>,
}

impl SideState {
    fn new(symbol: &str, position_side: PositionSide) -> Self {
        Self {
            symbol: symbol.to_string(),
            position_side,
            state: ExecutionState::Idle,
            mode: ExecutionMode::MakerOnly,
            current_order_id: None,
            current_order_placed_ms: 0,
            current_order_mode: None,
            current_order_reason: None,
            current_order_is_risk: false,
            current_order_filled_qty: Decimal::ZERO,
            last_completed_order_id: None,
            last_completed_ms: 0,
            pending_fill_log: false,
            last_completed_filled_qty: Decimal::ZERO,
            last_completed_avg_price: Decimal::ZERO,
            last_completed_mode: None,
            last_completed_reason: None,
            last_completed_realized_pnl: None,
            last_completed_fee: None,
            last_completed_fee_asset: None,
            risk_active: false,
            ttl_ms_override: None,
            maker_timeouts_to_escalate_override: None,
            maker_timeout_count: 0,
            aggr_timeout_count: 0,
            aggr_fill_count: 0,
            recent_maker_submits: VecDeque::new(),
            recent_maker_fills: VecDeque::new(),
            fill_rate: None,
            fill_rate_bucket: None,
            fill_rate_maker_timeouts_override: None,
        }
    }

    fn clear_current_order(&mut self) {
        self.current_order_id = None;
        self.current_order_mode = None;
        self.current_order_reason = None;
        self.current_order_is_risk = false;
        self.current_order_filled_qty = Decimal::ZERO;
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub order_ttl_ms: i64,
    pub repost_cooldown_ms: i64,
    pub base_lot_mult: u32,
    pub maker_price_mode: MakerPriceMode,
    pub maker_n_ticks: u32,
    pub maker_safety_ticks: u32,
    pub maker_timeouts_to_escalate: i32,
    pub aggr_fills_to_deescalate: i32,
    pub aggr_timeouts_to_deescalate: i32,
    pub max_mult: u32,
    pub max_order_notional: Decimal,
    pub ws_fill_grace_ms: i64,
    pub fill_rate: FillRateConfig,
}

impl EngineConfig {
    fn validate(&self) -> Result<()> {
        if self.maker_safety_ticks < 1 {
            bail!("maker_safety_ticks must be >= 1");
        }
        if self.fill_rate.enabled {
            if self.fill_rate.low_threshold > self.fill_rate.high_threshold {
                bail!("fill_rate low_threshold must be <= high_threshold");
            }
            if self.fill_rate.window_ms <= 0 {
                bail!("fill_rate window_ms must be > 0");
            }
        }
        Ok(())
    }
}

impl From<&MergedSymbolConfig> for EngineConfig {
    fn from(cfg: &MergedSymbolConfig) -> Self {
        Self {
            order_ttl_ms: cfg.order_ttl_ms,
            repost_cooldown_ms: cfg.repost_cooldown_ms,
            base_lot_mult: cfg.base_lot_mult,
            maker_price_mode: cfg.maker_price_mode,
            maker_n_ticks: cfg.maker_n_ticks,
            maker_safety_ticks: cfg.maker_safety_ticks,
            maker_timeouts_to_escalate: cfg.maker_timeouts_to_escalate,
            aggr_fills_to_deescalate: cfg.aggr_fills_to_deescalate,
            aggr_timeouts_to_deescalate: cfg.aggr_timeouts_to_deescalate,
            max_mult: cfg.max_mult,
            max_order_notional: cfg.max_order_notional,
            ws_fill_grace_ms: cfg.ws_fill_grace_ms,
            fill_rate: cfg.fill_rate.clone(),
        }
    }
}

/// Unified view of a completed fill, whether it came from a synchronous
/// REST result or a user-data update.
struct FilledView {
    order_id: String,
    filled_qty: Decimal,
    avg_price: Decimal,
    is_maker: Option<bool>,
    realized_pnl: Option<Decimal>,
    fee: Option<Decimal>,
    fee_asset: Option<String>,
}

impl FilledView {
    fn from_result(result: &OrderResult) -> Self {
        Self {
            order_id: result.order_id.clone().unwrap_or_default(),
            filled_qty: result.filled_qty,
            avg_price: result.avg_price,
            is_maker: None,
            realized_pnl: None,
            fee: None,
            fee_asset: None,
        }
    }

    fn from_update(update: &OrderUpdate) -> Self {
        Self {
            order_id: update.order_id.clone(),
            filled_qty: update.filled_qty,
            avg_price: update.avg_price,
            is_maker: update.is_maker,
            realized_pnl: update.realized_pnl,
            fee: update.fee,
            fee_asset: update.fee_asset.clone(),
        }
    }
}

fn role_of(is_maker: Option<bool>) -> Option<&'static str> {
    is_maker.map(|maker| if maker { "maker" } else { "taker" })
}

type Key = (String, PositionSide);

/// Per-side execution state machine. One engine per symbol; the owner
/// serialises access (side loop + user-data dispatch lock the same engine).
pub struct ExecutionEngine {
    cfg: EngineConfig,
    gateway: Arc<dyn OrderGateway>,
    on_fill: Option<Arc<dyn FillListener>>,
    states: HashMap<Key, SideState>,
}

impl ExecutionEngine {
    pub fn new(
        cfg: EngineConfig,
        gateway: Arc<dyn OrderGateway>,
        on_fill: Option<Arc<dyn FillListener>>,
    ) -> Result<Self> {
        cfg.validate()?;
        Ok(Self {
            cfg,
            gateway,
            on_fill,
            states: HashMap::new(),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.cfg
    }

    pub fn gateway(&self) -> Arc<dyn OrderGateway> {
        self.gateway.clone()
    }

    pub fn state(&mut self, symbol: &str, position_side: PositionSide) -> &SideState {
        self.state_mut(symbol, position_side)
    }

    pub fn state_mut(&mut self, symbol: &str, position_side: PositionSide) -> &mut SideState {
        self.states
            .entry((symbol.to_string(), position_side))
            .or_insert_with(|| SideState::new(symbol, position_side))
    }

    pub fn reset_state(&mut self, symbol: &str, position_side: PositionSide) {
        self.states.insert(
            (symbol.to_string(), position_side),
            SideState::new(symbol, position_side),
        );
    }

    /// External mode override (risk trigger, post-only retry).
    pub fn set_mode(
        &mut self,
        symbol: &str,
        position_side: PositionSide,
        mode: ExecutionMode,
        reason: &str,
    ) {
        let state = self.state_mut(symbol, position_side);
        set_mode(state, mode, reason);
    }

    // --- signal / panic entry ----------------------------------------------

    /// Consume an exit signal. Returns the intent to place, or None when the
    /// key is busy, the position is done, or sizing collapses to zero.
    pub fn on_signal(
        &mut self,
        signal: &ExitSignal,
        position_amt: Decimal,
        rules: &InstrumentRule,
        market: &MarketState,
        now_ms: i64,
    ) -> Option<OrderIntent> {
        let cfg = self.cfg.clone();
        let state = self.state_mut(&signal.symbol, signal.position_side);

        if state.state != ExecutionState::Idle {
            debug!(
                symbol = %signal.symbol,
                side = signal.position_side.as_str(),
                state = state.state.as_str(),
                "signal skipped; key busy"
            );
            return None;
        }
        if is_position_done(position_amt, rules.min_qty, rules.step_size) {
            return None;
        }

        let qty = compute_qty(
            &cfg,
            position_amt,
            rules.min_qty,
            rules.step_size,
            market.last_trade_price,
            signal.roi_mult,
            signal.accel_mult,
        );
        if qty <= Decimal::ZERO {
            debug!(symbol = %signal.symbol, side = signal.position_side.as_str(), "sized to zero; skip");
            return None;
        }

        let (price, time_in_force) = price_for_mode(
            &cfg,
            state.mode,
            signal.position_side,
            market.best_bid,
            market.best_ask,
            rules.tick_size,
        );

        let mut intent = OrderIntent::limit(
            signal.symbol.clone(),
            signal.position_side.closing_side(),
            signal.position_side,
            qty,
            price,
            time_in_force,
        );
        intent.reduce_only = true;

        state.state = ExecutionState::Placing;
        state.current_order_placed_ms = now_ms;
        state.current_order_mode = Some(state.mode);
        state.current_order_reason = Some(signal.reason.as_str().to_string());
        state.current_order_is_risk = false;
        state.current_order_filled_qty = Decimal::ZERO;

        debug!(
            symbol = %signal.symbol,
            side = intent.side.as_str(),
            qty = %qty,
            price = %price,
            position_side = signal.position_side.as_str(),
            "order intent created"
        );
        Some(intent)
    }

    /// Forced tiered close, independent of signals and throttles.
    pub fn on_panic_close(
        &mut self,
        symbol: &str,
        position_side: PositionSide,
        position_amt: Decimal,
        rules: &InstrumentRule,
        market: &MarketState,
        now_ms: i64,
        slice_ratio: Decimal,
        reason: &str,
    ) -> Option<OrderIntent> {
        let cfg = self.cfg.clone();
        let state = self.state_mut(symbol, position_side);

        if state.state != ExecutionState::Idle {
            return None;
        }
        if is_position_done(position_amt, rules.min_qty, rules.step_size) {
            return None;
        }

        let qty = compute_panic_qty(position_amt, rules.min_qty, rules.step_size, slice_ratio);
        if qty <= Decimal::ZERO {
            return None;
        }

        let (price, time_in_force) = price_for_mode(
            &cfg,
            state.mode,
            position_side,
            market.best_bid,
            market.best_ask,
            rules.tick_size,
        );

        let mut intent = OrderIntent::limit(
            symbol.to_string(),
            position_side.closing_side(),
            position_side,
            qty,
            price,
            time_in_force,
        );
        intent.reduce_only = true;
        intent.is_risk = true;

        state.state = ExecutionState::Placing;
        state.current_order_placed_ms = now_ms;
        state.current_order_mode = Some(state.mode);
        state.current_order_reason = Some(reason.to_string());
        state.current_order_is_risk = true;
        state.current_order_filled_qty = Decimal::ZERO;

        Some(intent)
    }

    // --- placement result ---------------------------------------------------

    pub async fn on_order_placed(
        &mut self,
        intent: &OrderIntent,
        result: &OrderResult,
        now_ms: i64,
    ) {
        let fill_rate_cfg_enabled = self.cfg.fill_rate.enabled;
        let state = self.state_mut(&intent.symbol, intent.position_side);

        if result.success && result.order_id.is_some() {
            state.state = ExecutionState::Waiting;
            state.current_order_id = result.order_id.clone();
            state.current_order_placed_ms = now_ms;
            state.current_order_filled_qty = result.filled_qty;

            info!(
                symbol = %intent.symbol,
                side = intent.position_side.as_str(),
                mode = state.mode.as_str(),
                qty = %intent.qty,
                price = %intent.price.unwrap_or_default(),
                order_id = result.order_id.as_deref().unwrap_or(""),
                "order placed"
            );

            let order_mode = state.current_order_mode.unwrap_or(state.mode);
            if fill_rate_cfg_enabled
                && !intent.is_risk
                && order_mode == ExecutionMode::MakerOnly
            {
                let cfg = self.cfg.clone();
                let state = self.state_mut(&intent.symbol, intent.position_side);
                update_fill_rate(&cfg, state, now_ms, true, false, false);
            }

            // Synchronous fill: finish the key now and wait for the WS
            // receipt to fill in role/PnL within the grace window.
            if result.status == Some(OrderStatus::Filled) {
                let state = self.state_mut(&intent.symbol, intent.position_side);
                state.last_completed_order_id = result.order_id.clone();
                state.last_completed_ms = now_ms;
                state.pending_fill_log = true;
                state.last_completed_filled_qty = result.filled_qty;
                state.last_completed_avg_price = result.avg_price;
                state.last_completed_mode = state.current_order_mode.or(Some(state.mode));
                state.last_completed_reason = Some(
                    state
                        .current_order_reason
                        .clone()
                        .unwrap_or_else(|| "unknown".to_string()),
                );
                state.last_completed_realized_pnl = None;
                state.last_completed_fee = None;
                state.last_completed_fee_asset = None;

                self.handle_filled(
                    &intent.symbol,
                    intent.position_side,
                    FilledView::from_result(result),
                    now_ms,
                    false,
                    false,
                );
            }
        } else {
            // Failed placement: short cooldown so repeated triggers cannot
            // hammer the limiter.
            state.state = ExecutionState::Cooldown;
            state.current_order_placed_ms = now_ms;
            state.clear_current_order();
            if result.error_code.as_deref() == Some("-5022") {
                // Already logged structurally by the adapter.
                return;
            }
            warn!(
                symbol = %intent.symbol,
                side = intent.position_side.as_str(),
                error = result.error_message.as_deref().unwrap_or("unknown"),
                "order placement failed"
            );
        }
    }

    // --- user-data updates --------------------------------------------------

    pub async fn on_order_update(&mut self, update: &OrderUpdate, now_ms: i64) {
        self.flush_pending_fill_if_expired(&update.symbol, update.position_side, now_ms)
            .await;

        let key = (update.symbol.clone(), update.position_side);
        let state = self
            .states
            .entry(key.clone())
            .or_insert_with(|| SideState::new(&update.symbol, update.position_side));

        if state.current_order_id.as_deref() != Some(update.order_id.as_str()) {
            if should_accept_late_fill(&self.cfg, state, update, now_ms) {
                let role = role_of(update.is_maker);
                let event = FillEvent {
                    symbol: update.symbol.clone(),
                    position_side: update.position_side,
                    mode: state.last_completed_mode.unwrap_or(state.mode),
                    filled_qty: state.last_completed_filled_qty,
                    avg_price: state.last_completed_avg_price,
                    reason: state
                        .last_completed_reason
                        .clone()
                        .unwrap_or_else(|| "unknown".to_string()),
                    role,
                    realized_pnl: update.realized_pnl,
                    fee: update.fee,
                    fee_asset: update.fee_asset.clone(),
                };
                log_fill(
                    &update.symbol,
                    update.position_side,
                    &update.order_id,
                    update.filled_qty,
                    update.avg_price,
                    role,
                    update.realized_pnl,
                    update.fee,
                );
                if let Some(listener) = &self.on_fill {
                    listener.on_fill(&event);
                }
                state.pending_fill_log = false;
                state.last_completed_order_id = None;
                state.last_completed_ms = 0;
                state.last_completed_filled_qty = Decimal::ZERO;
                state.last_completed_avg_price = Decimal::ZERO;
                state.last_completed_fee = None;
                state.last_completed_fee_asset = None;
                state.last_completed_mode = None;
                state.last_completed_reason = None;
                state.last_completed_realized_pnl = None;
            }
            return;
        }

        match update.status {
            OrderStatus::Filled => {
                self.handle_filled(
                    &update.symbol,
                    update.position_side,
                    FilledView::from_update(update),
                    now_ms,
                    true,
                    true,
                );
            }
            OrderStatus::Canceled => self.handle_canceled(&update.symbol, update.position_side, now_ms),
            OrderStatus::Rejected => self.handle_rejected(&update.symbol, update.position_side),
            OrderStatus::Expired => self.handle_expired(&update.symbol, update.position_side, now_ms),
            OrderStatus::PartiallyFilled => {
                let role = role_of(update.is_maker);
                log_fill(
                    &update.symbol,
                    update.position_side,
                    &update.order_id,
                    update.filled_qty,
                    update.avg_price,
                    role,
                    update.realized_pnl,
                    update.fee,
                );
                let state = self.state_mut(&update.symbol, update.position_side);
                state.current_order_filled_qty = update.filled_qty;

                // A partial fill counts as traction: reset the timeout
                // counter, and in aggressive mode prefer maker next round.
                let order_mode = state.current_order_mode.unwrap_or(state.mode);
                if update.filled_qty > Decimal::ZERO {
                    match order_mode {
                        ExecutionMode::MakerOnly => state.maker_timeout_count = 0,
                        ExecutionMode::AggressiveLimit => {
                            state.aggr_timeout_count = 0;
                            if state.mode != ExecutionMode::MakerOnly {
                                set_mode(state, ExecutionMode::MakerOnly, "partial_fill_deescalate");
                            }
                        }
                    }
                }
            }
            OrderStatus::New => {}
        }
    }

    fn handle_filled(
        &mut self,
        symbol: &str,
        position_side: PositionSide,
        fill: FilledView,
        now_ms: i64,
        emit_fill_log: bool,
        emit_on_fill: bool,
    ) {
        let cfg = self.cfg.clone();
        let on_fill = self.on_fill.clone();
        let state = self.state_mut(symbol, position_side);

        let executed_mode = state.current_order_mode.unwrap_or(state.mode);
        let reason = state
            .current_order_reason
            .clone()
            .unwrap_or_else(|| "unknown".to_string());
        let role = role_of(fill.is_maker);

        if emit_fill_log {
            log_fill(
                symbol,
                position_side,
                &fill.order_id,
                fill.filled_qty,
                fill.avg_price,
                role,
                fill.realized_pnl,
                fill.fee,
            );
        }

        if cfg.fill_rate.enabled
            && !state.current_order_is_risk
            && executed_mode == ExecutionMode::MakerOnly
        {
            update_fill_rate(&cfg, state, now_ms, false, true, false);
        }

        if emit_on_fill && let Some(listener) = &on_fill {
            listener.on_fill(&FillEvent {
                symbol: symbol.to_string(),
                position_side,
                mode: executed_mode,
                filled_qty: fill.filled_qty,
                avg_price: fill.avg_price,
                reason,
                role,
                realized_pnl: fill.realized_pnl,
                fee: fill.fee,
                fee_asset: fill.fee_asset.clone(),
            });
        }

        match executed_mode {
            ExecutionMode::MakerOnly => state.maker_timeout_count = 0,
            ExecutionMode::AggressiveLimit => {
                state.aggr_timeout_count = 0;
                state.aggr_fill_count += 1;
                if cfg.aggr_fills_to_deescalate > 0
                    && state.aggr_fill_count >= cfg.aggr_fills_to_deescalate
                {
                    set_mode(state, ExecutionMode::MakerOnly, "aggr_fill_deescalate");
                }
            }
        }

        state.state = ExecutionState::Idle;
        state.current_order_placed_ms = 0;
        state.clear_current_order();
    }

    fn handle_canceled(&mut self, symbol: &str, position_side: PositionSide, now_ms: i64) {
        let state = self.state_mut(symbol, position_side);
        info!(
            symbol,
            side = position_side.as_str(),
            order_id = state.current_order_id.as_deref().unwrap_or(""),
            reason = "timeout",
            "order canceled"
        );
        state.state = ExecutionState::Cooldown;
        state.current_order_placed_ms = now_ms; // cooldown start
        state.clear_current_order();
    }

    fn handle_rejected(&mut self, symbol: &str, position_side: PositionSide) {
        let state = self.state_mut(symbol, position_side);
        warn!(symbol, side = position_side.as_str(), "order rejected");
        state.state = ExecutionState::Idle;
        state.current_order_placed_ms = 0;
        state.clear_current_order();
    }

    fn handle_expired(&mut self, symbol: &str, position_side: PositionSide, now_ms: i64) {
        let state = self.state_mut(symbol, position_side);
        info!(symbol, side = position_side.as_str(), "order expired");
        state.state = ExecutionState::Cooldown;
        state.current_order_placed_ms = now_ms;
        state.clear_current_order();
    }

    // --- late-fill reconciliation -------------------------------------------

    async fn flush_pending_fill_if_expired(
        &mut self,
        symbol: &str,
        position_side: PositionSide,
        now_ms: i64,
    ) {
        let key = (symbol.to_string(), position_side);
        let snapshot = {
            let Some(state) = self.states.get(&key) else {
                return;
            };
            if !state.pending_fill_log {
                return;
            }
            if now_ms - state.last_completed_ms <= self.cfg.ws_fill_grace_ms {
                return;
            }
            state.last_completed_order_id.clone().map(|order_id| {
                (
                    order_id,
                    state.last_completed_filled_qty,
                    state.last_completed_avg_price,
                    state.last_completed_mode,
                    state.last_completed_reason.clone(),
                    state.last_completed_realized_pnl,
                    state.last_completed_fee,
                    state.last_completed_fee_asset.clone(),
                )
            })
        };

        if let Some((order_id, filled_qty, avg_price, mode, reason, cached_pnl, cached_fee, cached_fee_asset)) =
            snapshot
        {
            // The WS receipt never arrived inside the grace window; fall
            // back to REST trade metadata.
            let meta = self.gateway.fetch_order_trade_meta(symbol, &order_id).await;
            let role = role_of(meta.is_maker);
            let pnl = meta.realized_pnl.or(cached_pnl);
            let fee = meta.fee.or(cached_fee);
            let fee_asset = meta.fee_asset.or(cached_fee_asset);

            log_fill(
                symbol,
                position_side,
                &order_id,
                filled_qty,
                avg_price,
                role,
                pnl,
                fee,
            );
            if let Some(listener) = &self.on_fill {
                let state_mode = self.states.get(&key).map(|s| s.mode).unwrap_or(ExecutionMode::MakerOnly);
                listener.on_fill(&FillEvent {
                    symbol: symbol.to_string(),
                    position_side,
                    mode: mode.unwrap_or(state_mode),
                    filled_qty,
                    avg_price,
                    reason: reason.unwrap_or_else(|| "unknown".to_string()),
                    role,
                    realized_pnl: pnl,
                    fee,
                    fee_asset,
                });
            }
        }

        if let Some(state) = self.states.get_mut(&key) {
            state.pending_fill_log = false;
            state.last_completed_ms = now_ms;
            state.last_completed_mode = None;
            state.last_completed_reason = None;
            state.last_completed_realized_pnl = None;
            state.last_completed_fee = None;
            state.last_completed_fee_asset = None;
        }
    }

    pub fn log_fill_rate_snapshot(&mut self, symbol: &str, position_side: PositionSide, now_ms: i64) {
        if !self.cfg.fill_rate.enabled {
            return;
        }
        let cfg = self.cfg.clone();
        let state = self.state_mut(symbol, position_side);
        update_fill_rate(&cfg, state, now_ms, false, false, true);
    }

    // --- timers -------------------------------------------------------------

    /// TTL sweep for one key. Issues the cancel and moves straight to
    /// COOLDOWN, keeping the order id so a late terminal update still
    /// reconciles. Returns true when a cancel was triggered.
    pub async fn check_timeout(
        &mut self,
        symbol: &str,
        position_side: PositionSide,
        now_ms: i64,
    ) -> bool {
        self.flush_pending_fill_if_expired(symbol, position_side, now_ms)
            .await;

        let cfg = self.cfg.clone();
        let (order_id, is_risk) = {
            let state = self.state_mut(symbol, position_side);

            // Drop an exhausted late-fill cache so a recycled order id can
            // never match a stale entry.
            if !state.pending_fill_log
                && state.last_completed_order_id.is_some()
                && now_ms - state.last_completed_ms > cfg.ws_fill_grace_ms
            {
                state.last_completed_order_id = None;
                state.last_completed_ms = 0;
                state.last_completed_filled_qty = Decimal::ZERO;
                state.last_completed_avg_price = Decimal::ZERO;
                state.last_completed_realized_pnl = None;
                state.last_completed_fee = None;
                state.last_completed_fee_asset = None;
            }

            if state.state != ExecutionState::Waiting {
                return false;
            }

            let order_mode = state.current_order_mode.unwrap_or(state.mode);
            let ttl_ms = state.ttl_ms_override.unwrap_or(cfg.order_ttl_ms);
            let elapsed = now_ms - state.current_order_placed_ms;
            if elapsed < ttl_ms {
                return false;
            }

            let had_fill = state.current_order_filled_qty > Decimal::ZERO;
            state.state = ExecutionState::Canceling;

            let timeout_count = match order_mode {
                ExecutionMode::AggressiveLimit => {
                    if had_fill {
                        state.aggr_timeout_count = 0;
                    } else {
                        state.aggr_timeout_count += 1;
                    }
                    state.aggr_timeout_count
                }
                ExecutionMode::MakerOnly => {
                    if had_fill {
                        state.maker_timeout_count = 0;
                    } else {
                        state.maker_timeout_count += 1;
                    }
                    state.maker_timeout_count
                }
            };

            info!(
                symbol,
                side = position_side.as_str(),
                order_id = state.current_order_id.as_deref().unwrap_or(""),
                timeout_count,
                "order ttl timeout"
            );

            // Rotate mode before the cancel round-trip.
            match order_mode {
                ExecutionMode::MakerOnly => {
                    let escalate = state
                        .maker_timeouts_to_escalate_override
                        .or(state.fill_rate_maker_timeouts_override)
                        .unwrap_or(cfg.maker_timeouts_to_escalate);
                    if escalate > 0 && state.maker_timeout_count >= escalate {
                        set_mode(state, ExecutionMode::AggressiveLimit, "maker_timeout_escalate");
                    }
                }
                ExecutionMode::AggressiveLimit => {
                    if cfg.aggr_timeouts_to_deescalate > 0
                        && state.aggr_timeout_count >= cfg.aggr_timeouts_to_deescalate
                    {
                        set_mode(state, ExecutionMode::MakerOnly, "aggr_timeout_deescalate");
                    } else if had_fill && state.mode != ExecutionMode::MakerOnly {
                        set_mode(state, ExecutionMode::MakerOnly, "partial_fill_deescalate");
                    }
                }
            }

            (state.current_order_id.clone(), state.current_order_is_risk)
        };

        if let Some(order_id) = order_id {
            let result = self.gateway.cancel_order(symbol, &order_id, is_risk).await;
            if !result.success {
                warn!(
                    symbol,
                    order_id,
                    error = result.error_message.as_deref().unwrap_or("unknown"),
                    "cancel request failed"
                );
            }
        }

        // Cooldown with the order context retained so a late receipt for
        // this order still matches.
        let state = self.state_mut(symbol, position_side);
        state.state = ExecutionState::Cooldown;
        state.current_order_placed_ms = now_ms;

        true
    }

    /// Cooldown sweep: back to IDLE once the repost cooldown elapses.
    pub fn check_cooldown(&mut self, symbol: &str, position_side: PositionSide, now_ms: i64) -> bool {
        let cooldown_ms = self.cfg.repost_cooldown_ms;
        let state = self.state_mut(symbol, position_side);
        if state.state != ExecutionState::Cooldown {
            return false;
        }
        if now_ms - state.current_order_placed_ms < cooldown_ms {
            return false;
        }
        state.state = ExecutionState::Idle;
        state.current_order_placed_ms = 0;
        true
    }

    // --- pricing & sizing ---------------------------------------------------

    pub fn build_maker_price(
        &self,
        position_side: PositionSide,
        best_bid: Decimal,
        best_ask: Decimal,
        tick_size: Decimal,
    ) -> Decimal {
        build_maker_price(&self.cfg, position_side, best_bid, best_ask, tick_size)
    }

    pub fn build_aggressive_limit_price(
        &self,
        position_side: PositionSide,
        best_bid: Decimal,
        best_ask: Decimal,
        tick_size: Decimal,
    ) -> Decimal {
        build_aggressive_limit_price(position_side, best_bid, best_ask, tick_size)
    }

    pub fn compute_qty(
        &self,
        position_amt: Decimal,
        min_qty: Decimal,
        step_size: Decimal,
        last_trade_price: Decimal,
        roi_mult: u32,
        accel_mult: u32,
    ) -> Decimal {
        compute_qty(
            &self.cfg,
            position_amt,
            min_qty,
            step_size,
            last_trade_price,
            roi_mult,
            accel_mult,
        )
    }

    pub fn compute_panic_qty(
        &self,
        position_amt: Decimal,
        min_qty: Decimal,
        step_size: Decimal,
        slice_ratio: Decimal,
    ) -> Decimal {
        compute_panic_qty(position_amt, min_qty, step_size, slice_ratio)
    }

    pub fn is_position_done(&self, position_amt: Decimal, min_qty: Decimal, step_size: Decimal) -> bool {
        is_position_done(position_amt, min_qty, step_size)
    }
}

fn set_mode(state: &mut SideState, new_mode: ExecutionMode, reason: &str) {
    if state.mode == new_mode {
        return;
    }
    let from_mode = state.mode;
    state.mode = new_mode;

    // Counters must not leak across modes.
    state.maker_timeout_count = 0;
    state.aggr_timeout_count = 0;
    state.aggr_fill_count = 0;

    info!(
        symbol = %state.symbol,
        side = state.position_side.as_str(),
        mode = new_mode.as_str(),
        from_mode = from_mode.as_str(),
        reason,
        "execution mode change"
    );
}

fn price_for_mode(
    cfg: &EngineConfig,
    mode: ExecutionMode,
    position_side: PositionSide,
    best_bid: Decimal,
    best_ask: Decimal,
    tick_size: Decimal,
) -> (Decimal, TimeInForce) {
    match mode {
        ExecutionMode::MakerOnly => (
            build_maker_price(cfg, position_side, best_bid, best_ask, tick_size),
            TimeInForce::Gtx,
        ),
        ExecutionMode::AggressiveLimit => (
            build_aggressive_limit_price(position_side, best_bid, best_ask, tick_size),
            TimeInForce::Gtc,
        ),
    }
}

/// Maker price: mode target, flattened to tick, then forced at least
/// `maker_safety_ticks` inside the book so a GTX order cannot cross.
fn build_maker_price(
    cfg: &EngineConfig,
    position_side: PositionSide,
    best_bid: Decimal,
    best_ask: Decimal,
    tick_size: Decimal,
) -> Decimal {
    let n_ticks = Decimal::from(cfg.maker_n_ticks);
    let mut price = match position_side {
        PositionSide::Long => match cfg.maker_price_mode {
            MakerPriceMode::AtTouch => best_ask,
            MakerPriceMode::InsideSpread1Tick => best_ask - tick_size,
            MakerPriceMode::CustomTicks => best_ask - tick_size * n_ticks,
        },
        PositionSide::Short => match cfg.maker_price_mode {
            MakerPriceMode::AtTouch => best_bid,
            MakerPriceMode::InsideSpread1Tick => best_bid + tick_size,
            MakerPriceMode::CustomTicks => best_bid + tick_size * n_ticks,
        },
    };

    price = round_down_to(price, tick_size);

    if tick_size > Decimal::ZERO {
        let safety = tick_size * Decimal::from(cfg.maker_safety_ticks);
        match position_side {
            PositionSide::Long => {
                // SELL must rest above the bid.
                let min_maker_price = round_down_to(best_bid, tick_size) + safety;
                if price < min_maker_price {
                    price = min_maker_price;
                }
            }
            PositionSide::Short => {
                // BUY must rest below the ask.
                let mut max_maker_price = round_down_to(best_ask, tick_size) - safety;
                if max_maker_price <= Decimal::ZERO {
                    max_maker_price = tick_size;
                }
                if price > max_maker_price {
                    price = max_maker_price;
                }
            }
        }
    }

    price
}

/// Aggressive limit: cross the touch. SELL floors the bid; BUY ceils the ask.
fn build_aggressive_limit_price(
    position_side: PositionSide,
    best_bid: Decimal,
    best_ask: Decimal,
    tick_size: Decimal,
) -> Decimal {
    if tick_size <= Decimal::ZERO {
        return match position_side {
            PositionSide::Long => best_bid,
            PositionSide::Short => best_ask,
        };
    }
    match position_side {
        PositionSide::Long => round_down_to(best_bid, tick_size),
        PositionSide::Short => {
            let mut price = round_down_to(best_ask, tick_size);
            if price < best_ask {
                price += tick_size;
            }
            price
        }
    }
}

fn compute_qty(
    cfg: &EngineConfig,
    position_amt: Decimal,
    min_qty: Decimal,
    step_size: Decimal,
    last_trade_price: Decimal,
    roi_mult: u32,
    accel_mult: u32,
) -> Decimal {
    let abs_position = position_amt.abs();
    if abs_position < min_qty {
        return Decimal::ZERO;
    }

    let base_mult = cfg.base_lot_mult.max(1);
    let roi_mult = roi_mult.max(1);
    let accel_mult = accel_mult.max(1);
    let max_mult = cfg.max_mult.max(1);

    let final_mult = (base_mult as u64 * roi_mult as u64 * accel_mult as u64).min(max_mult as u64);
    let base_qty = min_qty * Decimal::from(final_mult);

    let mut qty = base_qty.min(abs_position);
    if last_trade_price > Decimal::ZERO && cfg.max_order_notional > Decimal::ZERO {
        qty = qty.min(cfg.max_order_notional / last_trade_price);
    }

    qty = round_down_to(qty, step_size);
    if qty < min_qty {
        return Decimal::ZERO;
    }
    qty
}

/// Panic slice: `|position| * slice_ratio` floored to step, lifted to
/// min_qty when flooring collapses the final sliver, never above the
/// position.
fn compute_panic_qty(
    position_amt: Decimal,
    min_qty: Decimal,
    step_size: Decimal,
    slice_ratio: Decimal,
) -> Decimal {
    let abs_position = position_amt.abs();
    if abs_position < min_qty || slice_ratio <= Decimal::ZERO {
        return Decimal::ZERO;
    }

    let mut qty = round_down_to(abs_position * slice_ratio, step_size);
    if qty < min_qty {
        qty = min_qty;
    }
    if qty > abs_position {
        qty = round_down_to(abs_position, step_size);
    }
    if qty < min_qty {
        return Decimal::ZERO;
    }
    qty
}

fn is_position_done(position_amt: Decimal, min_qty: Decimal, step_size: Decimal) -> bool {
    let rounded = round_down_to(position_amt.abs(), step_size);
    rounded == Decimal::ZERO || rounded < min_qty
}

fn should_accept_late_fill(
    cfg: &EngineConfig,
    state: &SideState,
    update: &OrderUpdate,
    now_ms: i64,
) -> bool {
    if !state.pending_fill_log || state.last_completed_order_id.is_none() {
        return false;
    }
    if state.last_completed_order_id.as_deref() != Some(update.order_id.as_str()) {
        return false;
    }
    if now_ms - state.last_completed_ms > cfg.ws_fill_grace_ms {
        return false;
    }
    update.status == OrderStatus::Filled && update.filled_qty > Decimal::ZERO
}

fn update_fill_rate(
    cfg: &EngineConfig,
    state: &mut SideState,
    now_ms: i64,
    is_submit: bool,
    is_fill: bool,
    force_log: bool,
) {
    if !cfg.fill_rate.enabled {
        return;
    }

    if is_submit {
        state.recent_maker_submits.push_back(now_ms);
    }
    if is_fill {
        state.recent_maker_fills.push_back(now_ms);
    }

    let cutoff = now_ms - cfg.fill_rate.window_ms;
    while state
        .recent_maker_submits
        .front()
        .is_some_and(|ts| *ts < cutoff)
    {
        state.recent_maker_submits.pop_front();
    }
    while state
        .recent_maker_fills
        .front()
        .is_some_and(|ts| *ts < cutoff)
    {
        state.recent_maker_fills.pop_front();
    }

    let submits = state.recent_maker_submits.len();
    if submits == 0 {
        state.fill_rate = None;
        state.fill_rate_bucket = None;
        state.fill_rate_maker_timeouts_override = None;
        return;
    }

    let fills = state.recent_maker_fills.len();
    let fill_rate = Decimal::from(fills as u64) / Decimal::from(submits as u64);
    let (bucket, override_value) = if fill_rate < cfg.fill_rate.low_threshold {
        (
            FillRateBucket::Low,
            Some(cfg.fill_rate.low_maker_timeouts_to_escalate),
        )
    } else if fill_rate > cfg.fill_rate.high_threshold {
        (
            FillRateBucket::High,
            cfg.fill_rate.high_maker_timeouts_to_escalate,
        )
    } else {
        (FillRateBucket::Mid, None)
    };

    if force_log || state.fill_rate_bucket != Some(bucket) {
        info!(
            symbol = %state.symbol,
            side = state.position_side.as_str(),
            fill_rate = %fill_rate,
            bucket = bucket.as_str(),
            submits,
            fills,
            maker_timeouts_to_escalate = override_value,
            "maker fill rate"
        );
    }

    state.fill_rate = Some(fill_rate);
    state.fill_rate_bucket = Some(bucket);
    state.fill_rate_maker_timeouts_override = override_value;
}

#[allow(clippy::too_many_arguments)]
fn log_fill(
    symbol: &str,
    position_side: PositionSide,
    order_id: &str,
    filled_qty: Decimal,
    avg_price: Decimal,
    role: Option<&'static str>,
    pnl: Option<Decimal>,
    fee: Option<Decimal>,
) {
    info!(
        symbol,
        side = position_side.as_str(),
        order_id,
        filled_qty = %filled_qty,
        avg_price = %avg_price,
        role = role.unwrap_or("unknown"),
        pnl = pnl.map(|p| p.to_string()).unwrap_or_default(),
        fee = fee.map(|f| f.to_string()).unwrap_or_default(),
        "order filled"
    );
}
