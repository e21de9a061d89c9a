/*
[INPUT]:  MarketEvent stream, position snapshots, tier tables
[OUTPUT]: Throttled ExitSignal with ROI/acceleration multipliers
[POS]:    Signal layer - exit decision source
[UPDATE]: When tier evaluation, throttling, or readiness rules change
*/

use std::collections::{HashMap, VecDeque};

use rust_decimal::Decimal;
use tracing::debug;

use usdm_closer_adapter::{MarketEvent, MarketEventKind, Position, PositionSide};

use crate::config::{AccelTier, RoiTier};

/// Per-symbol market view maintained from the three market streams.
/// `last_update_ms` is wall-clock (exchange event time) and is refreshed
/// only by book-ticker and agg-trade events; mark price does not count
/// toward staleness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketState {
    pub symbol: String,
    pub best_bid: Decimal,
    pub best_ask: Decimal,
    pub last_trade_price: Decimal,
    pub previous_trade_price: Decimal,
    pub mark_price: Option<Decimal>,
    pub last_update_ms: i64,
    pub is_ready: bool,
}

impl MarketState {
    fn new(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            best_bid: Decimal::ZERO,
            best_ask: Decimal::ZERO,
            last_trade_price: Decimal::ZERO,
            previous_trade_price: Decimal::ZERO,
            mark_price: None,
            last_update_ms: 0,
            is_ready: false,
        }
    }

    /// Stale when no book/trade update has been seen, or the latest one is
    /// older than `stale_data_ms` against the wall clock.
    pub fn is_stale(&self, now_ms: i64, stale_data_ms: i64) -> bool {
        if self.last_update_ms == 0 {
            return true;
        }
        now_ms - self.last_update_ms > stale_data_ms
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalReason {
    LongPrimary,
    LongBidImprove,
    ShortPrimary,
    ShortAskImprove,
}

impl SignalReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SignalReason::LongPrimary => "long_primary",
            SignalReason::LongBidImprove => "long_bid_improve",
            SignalReason::ShortPrimary => "short_primary",
            SignalReason::ShortAskImprove => "short_ask_improve",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExitSignal {
    pub symbol: String,
    pub position_side: PositionSide,
    pub reason: SignalReason,
    pub roi_mult: u32,
    pub accel_mult: u32,
    pub market: MarketState,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, Default)]
struct SideThrottle {
    last_signal_ms: i64,
    has_signaled: bool,
    last_signal_bid: Decimal,
    last_signal_ask: Decimal,
}

#[derive(Debug)]
struct SymbolSignalState {
    market: MarketState,
    has_book: bool,
    has_trade: bool,
    min_signal_interval_ms: i64,
    accel_window_ms: i64,
    /// Descending by threshold; first match wins.
    roi_tiers: Vec<RoiTier>,
    accel_tiers: Vec<AccelTier>,
    /// (mono_ms, price) trade samples inside the acceleration window.
    trades: VecDeque<(i64, Decimal)>,
    throttles: HashMap<PositionSide, SideThrottle>,
}

/// Per-symbol signal engine: keeps market state and emits throttled exit
/// signals with tiered multipliers.
#[derive(Debug, Default)]
pub struct SignalEngine {
    symbols: HashMap<String, SymbolSignalState>,
}

impl SignalEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn configure_symbol(
        &mut self,
        symbol: &str,
        min_signal_interval_ms: i64,
        accel_window_ms: i64,
        mut roi_tiers: Vec<RoiTier>,
        mut accel_tiers: Vec<AccelTier>,
    ) {
        roi_tiers.sort_by(|a, b| b.roi.cmp(&a.roi));
        accel_tiers.sort_by(|a, b| b.ret.cmp(&a.ret));
        self.symbols.insert(
            symbol.to_string(),
            SymbolSignalState {
                market: MarketState::new(symbol),
                has_book: false,
                has_trade: false,
                min_signal_interval_ms,
                accel_window_ms,
                roi_tiers,
                accel_tiers,
                trades: VecDeque::new(),
                throttles: HashMap::new(),
            },
        );
    }

    /// Fold one market event into the symbol state. `mono_now_ms` stamps
    /// trade samples for the acceleration window.
    pub fn update_market(&mut self, event: &MarketEvent, mono_now_ms: i64) {
        let Some(state) = self.symbols.get_mut(&event.symbol) else {
            return;
        };

        match event.kind {
            MarketEventKind::BookTicker => {
                if let (Some(bid), Some(ask)) = (event.best_bid, event.best_ask) {
                    state.market.best_bid = bid;
                    state.market.best_ask = ask;
                    state.market.last_update_ms = event.timestamp_ms;
                    state.has_book = true;
                }
            }
            MarketEventKind::AggTrade => {
                if let Some(price) = event.last_trade_price {
                    if state.market.last_trade_price != price {
                        state.market.previous_trade_price = state.market.last_trade_price;
                    }
                    state.market.last_trade_price = price;
                    state.market.last_update_ms = event.timestamp_ms;
                    state.has_trade = true;
                    state.trades.push_back((mono_now_ms, price));
                    trim_trades(&mut state.trades, mono_now_ms, state.accel_window_ms);
                }
            }
            MarketEventKind::MarkPrice => {
                state.market.mark_price = event.mark_price;
            }
        }

        state.market.is_ready = state.has_book && state.has_trade;
    }

    pub fn is_data_ready(&self, symbol: &str) -> bool {
        self.symbols
            .get(symbol)
            .map(|s| s.market.is_ready)
            .unwrap_or(false)
    }

    pub fn market_state(&self, symbol: &str) -> Option<MarketState> {
        self.symbols.get(symbol).map(|s| s.market.clone())
    }

    /// Evaluate one side of one symbol at monotonic `now_ms`.
    ///
    /// Primary signals fire when ROI crosses a tier and the per-side
    /// throttle allows it. While the throttle is active, an improvement
    /// signal fires instead if the touch moved favourably (bid up for
    /// longs, ask down for shorts) since the last emitted signal.
    pub fn evaluate(
        &mut self,
        symbol: &str,
        position_side: PositionSide,
        position: &Position,
        now_ms: i64,
    ) -> Option<ExitSignal> {
        let state = self.symbols.get_mut(symbol)?;
        if !state.market.is_ready {
            return None;
        }
        if position.entry_price <= Decimal::ZERO || state.market.last_trade_price <= Decimal::ZERO {
            return None;
        }

        let roi = match position_side {
            PositionSide::Long => {
                (state.market.last_trade_price - position.entry_price) / position.entry_price
            }
            PositionSide::Short => {
                (position.entry_price - state.market.last_trade_price) / position.entry_price
            }
        };

        let roi_mult = state
            .roi_tiers
            .iter()
            .find(|tier| roi >= tier.roi)
            .map(|tier| tier.mult.max(1))?;

        trim_trades(&mut state.trades, now_ms, state.accel_window_ms);
        let accel_mult = accel_multiplier(
            &state.trades,
            state.market.last_trade_price,
            position_side,
            &state.accel_tiers,
        );

        let throttle = state.throttles.entry(position_side).or_default();
        let primary_open =
            !throttle.has_signaled || now_ms - throttle.last_signal_ms >= state.min_signal_interval_ms;

        let reason = if primary_open {
            match position_side {
                PositionSide::Long => SignalReason::LongPrimary,
                PositionSide::Short => SignalReason::ShortPrimary,
            }
        } else {
            // Primary throttled: only a favourable touch move re-arms.
            let improved = match position_side {
                PositionSide::Long => state.market.best_bid > throttle.last_signal_bid,
                PositionSide::Short => state.market.best_ask < throttle.last_signal_ask,
            };
            if !improved {
                return None;
            }
            match position_side {
                PositionSide::Long => SignalReason::LongBidImprove,
                PositionSide::Short => SignalReason::ShortAskImprove,
            }
        };

        throttle.has_signaled = true;
        throttle.last_signal_ms = now_ms;
        throttle.last_signal_bid = state.market.best_bid;
        throttle.last_signal_ask = state.market.best_ask;

        debug!(
            symbol,
            side = position_side.as_str(),
            reason = reason.as_str(),
            roi = %roi,
            roi_mult,
            accel_mult,
            "exit signal"
        );

        Some(ExitSignal {
            symbol: symbol.to_string(),
            position_side,
            reason,
            roi_mult,
            accel_mult,
            market: state.market.clone(),
            timestamp_ms: now_ms,
        })
    }
}

fn trim_trades(trades: &mut VecDeque<(i64, Decimal)>, now_ms: i64, window_ms: i64) {
    let cutoff = now_ms - window_ms;
    while let Some((ts, _)) = trades.front() {
        if *ts < cutoff {
            trades.pop_front();
        } else {
            break;
        }
    }
}

/// Windowed return against the oldest in-window trade, sign by side.
fn accel_multiplier(
    trades: &VecDeque<(i64, Decimal)>,
    last_trade_price: Decimal,
    position_side: PositionSide,
    tiers: &[AccelTier],
) -> u32 {
    let Some((_, window_start_price)) = trades.front() else {
        return 1;
    };
    if *window_start_price <= Decimal::ZERO {
        return 1;
    }
    let ret = match position_side {
        PositionSide::Long => (last_trade_price - window_start_price) / window_start_price,
        PositionSide::Short => (window_start_price - last_trade_price) / window_start_price,
    };
    tiers
        .iter()
        .find(|tier| ret >= tier.ret)
        .map(|tier| tier.mult.max(1))
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(value: &str) -> Decimal {
        Decimal::from_str(value).expect("valid decimal")
    }

    fn book_event(symbol: &str, bid: &str, ask: &str, ts: i64) -> MarketEvent {
        MarketEvent {
            symbol: symbol.to_string(),
            timestamp_ms: ts,
            kind: MarketEventKind::BookTicker,
            best_bid: Some(dec(bid)),
            best_ask: Some(dec(ask)),
            last_trade_price: None,
            mark_price: None,
        }
    }

    fn trade_event(symbol: &str, price: &str, ts: i64) -> MarketEvent {
        MarketEvent {
            symbol: symbol.to_string(),
            timestamp_ms: ts,
            kind: MarketEventKind::AggTrade,
            best_bid: None,
            best_ask: None,
            last_trade_price: Some(dec(price)),
            mark_price: None,
        }
    }

    fn mark_event(symbol: &str, price: &str, ts: i64) -> MarketEvent {
        MarketEvent {
            symbol: symbol.to_string(),
            timestamp_ms: ts,
            kind: MarketEventKind::MarkPrice,
            best_bid: None,
            best_ask: None,
            last_trade_price: None,
            mark_price: Some(dec(price)),
        }
    }

    fn long_position(entry: &str) -> Position {
        Position {
            symbol: "BTCUSDT".to_string(),
            position_side: PositionSide::Long,
            position_amt: dec("1"),
            entry_price: dec(entry),
            unrealized_pnl: Decimal::ZERO,
            leverage: 10,
            mark_price: None,
            liquidation_price: None,
        }
    }

    fn short_position(entry: &str) -> Position {
        Position {
            position_side: PositionSide::Short,
            position_amt: dec("-1"),
            ..long_position(entry)
        }
    }

    fn engine_with_tiers() -> SignalEngine {
        let mut engine = SignalEngine::new();
        engine.configure_symbol(
            "BTCUSDT",
            200,
            3_000,
            vec![
                RoiTier { roi: dec("0.01"), mult: 2 },
                RoiTier { roi: dec("0.02"), mult: 4 },
            ],
            vec![AccelTier { ret: dec("0.005"), mult: 3 }],
        );
        engine
    }

    #[test]
    fn not_ready_until_book_and_trade_seen() {
        let mut engine = engine_with_tiers();
        assert!(!engine.is_data_ready("BTCUSDT"));
        engine.update_market(&book_event("BTCUSDT", "100", "100.1", 1), 1);
        assert!(!engine.is_data_ready("BTCUSDT"));
        engine.update_market(&trade_event("BTCUSDT", "100", 2), 2);
        assert!(engine.is_data_ready("BTCUSDT"));
    }

    #[test]
    fn mark_price_does_not_refresh_staleness() {
        let mut engine = engine_with_tiers();
        engine.update_market(&book_event("BTCUSDT", "100", "100.1", 1_000), 1_000);
        engine.update_market(&trade_event("BTCUSDT", "100", 1_000), 1_000);
        engine.update_market(&mark_event("BTCUSDT", "100.05", 9_000), 9_000);

        let state = engine.market_state("BTCUSDT").expect("state");
        assert_eq!(state.last_update_ms, 1_000);
        assert!(state.is_stale(4_000, 1_500));
        assert_eq!(state.mark_price, Some(dec("100.05")));
    }

    #[test]
    fn previous_trade_price_is_preserved_on_change() {
        let mut engine = engine_with_tiers();
        engine.update_market(&trade_event("BTCUSDT", "100", 1), 1);
        engine.update_market(&trade_event("BTCUSDT", "100", 2), 2);
        engine.update_market(&trade_event("BTCUSDT", "101", 3), 3);
        let state = engine.market_state("BTCUSDT").expect("state");
        assert_eq!(state.last_trade_price, dec("101"));
        assert_eq!(state.previous_trade_price, dec("100"));
    }

    #[test]
    fn highest_satisfied_roi_tier_wins() {
        let mut engine = engine_with_tiers();
        engine.update_market(&book_event("BTCUSDT", "102", "102.1", 1), 1);
        engine.update_market(&trade_event("BTCUSDT", "102.5", 2), 2);

        let signal = engine
            .evaluate("BTCUSDT", PositionSide::Long, &long_position("100"), 1_000)
            .expect("signal");
        assert_eq!(signal.reason, SignalReason::LongPrimary);
        assert_eq!(signal.roi_mult, 4);
    }

    #[test]
    fn no_signal_below_lowest_tier() {
        let mut engine = engine_with_tiers();
        engine.update_market(&book_event("BTCUSDT", "100", "100.1", 1), 1);
        engine.update_market(&trade_event("BTCUSDT", "100.5", 2), 2);
        assert!(
            engine
                .evaluate("BTCUSDT", PositionSide::Long, &long_position("100"), 1_000)
                .is_none()
        );
    }

    #[test]
    fn short_roi_is_mirrored() {
        let mut engine = engine_with_tiers();
        engine.update_market(&book_event("BTCUSDT", "97.9", "98", 1), 1);
        engine.update_market(&trade_event("BTCUSDT", "98", 2), 2);

        let signal = engine
            .evaluate("BTCUSDT", PositionSide::Short, &short_position("100"), 1_000)
            .expect("signal");
        assert_eq!(signal.reason, SignalReason::ShortPrimary);
        assert_eq!(signal.roi_mult, 4);
    }

    #[test]
    fn throttle_blocks_until_interval_elapses() {
        let mut engine = engine_with_tiers();
        engine.update_market(&book_event("BTCUSDT", "102", "102.1", 1), 1);
        engine.update_market(&trade_event("BTCUSDT", "102", 2), 2);

        let position = long_position("100");
        assert!(engine.evaluate("BTCUSDT", PositionSide::Long, &position, 1_000).is_some());
        assert!(engine.evaluate("BTCUSDT", PositionSide::Long, &position, 1_100).is_none());
        assert!(engine.evaluate("BTCUSDT", PositionSide::Long, &position, 1_200).is_some());
    }

    #[test]
    fn bid_improvement_fires_inside_throttle_window() {
        let mut engine = engine_with_tiers();
        engine.update_market(&book_event("BTCUSDT", "102", "102.2", 1), 1);
        engine.update_market(&trade_event("BTCUSDT", "102", 2), 2);

        let position = long_position("100");
        let first = engine
            .evaluate("BTCUSDT", PositionSide::Long, &position, 1_000)
            .expect("primary");
        assert_eq!(first.reason, SignalReason::LongPrimary);

        // Throttled and no improvement: silent.
        assert!(engine.evaluate("BTCUSDT", PositionSide::Long, &position, 1_050).is_none());

        // Bid ticks up inside the throttle window.
        engine.update_market(&book_event("BTCUSDT", "102.1", "102.2", 3), 3);
        let second = engine
            .evaluate("BTCUSDT", PositionSide::Long, &position, 1_100)
            .expect("improvement");
        assert_eq!(second.reason, SignalReason::LongBidImprove);

        // The improvement consumed the snapshot; the same book stays silent.
        assert!(engine.evaluate("BTCUSDT", PositionSide::Long, &position, 1_150).is_none());
    }

    #[test]
    fn ask_improvement_is_mirrored_for_shorts() {
        let mut engine = engine_with_tiers();
        engine.update_market(&book_event("BTCUSDT", "97.8", "98", 1), 1);
        engine.update_market(&trade_event("BTCUSDT", "98", 2), 2);

        let position = short_position("100");
        assert!(engine.evaluate("BTCUSDT", PositionSide::Short, &position, 1_000).is_some());

        engine.update_market(&book_event("BTCUSDT", "97.8", "97.9", 3), 3);
        let signal = engine
            .evaluate("BTCUSDT", PositionSide::Short, &position, 1_050)
            .expect("improvement");
        assert_eq!(signal.reason, SignalReason::ShortAskImprove);
    }

    #[test]
    fn accel_multiplier_uses_window_start_price() {
        let mut engine = engine_with_tiers();
        engine.update_market(&book_event("BTCUSDT", "102", "102.1", 1), 1_000);
        // Window start at 101.0, latest at 102.0: ret ~ 0.0099 >= 0.005.
        engine.update_market(&trade_event("BTCUSDT", "101", 2), 1_000);
        engine.update_market(&trade_event("BTCUSDT", "102", 3), 2_000);

        let signal = engine
            .evaluate("BTCUSDT", PositionSide::Long, &long_position("100"), 2_500)
            .expect("signal");
        assert_eq!(signal.accel_mult, 3);
    }

    #[test]
    fn accel_window_trims_old_samples() {
        let mut engine = engine_with_tiers();
        engine.update_market(&book_event("BTCUSDT", "102", "102.1", 1), 1_000);
        engine.update_market(&trade_event("BTCUSDT", "90", 2), 1_000);
        engine.update_market(&trade_event("BTCUSDT", "102", 3), 10_000);

        // The 90 sample fell out of the 3s window; the only in-window sample
        // is the latest trade, so the windowed return is zero.
        let signal = engine
            .evaluate("BTCUSDT", PositionSide::Long, &long_position("100"), 10_000)
            .expect("signal");
        assert_eq!(signal.accel_mult, 1);
    }
}
