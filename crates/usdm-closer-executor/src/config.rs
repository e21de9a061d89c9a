/*
[INPUT]:  YAML configuration file + environment credentials
[OUTPUT]: Validated global config and per-symbol merged views
[POS]:    Configuration layer - startup wiring
[UPDATE]: When adding new configuration options
*/

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result, bail};
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::execution::MakerPriceMode;

/// Top-level configuration: global defaults plus per-symbol overrides.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default, rename = "global")]
    pub global: GlobalConfig,
    #[serde(default)]
    pub symbols: BTreeMap<String, SymbolConfig>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct GlobalConfig {
    pub testnet: bool,
    pub proxy: Option<String>,
    pub ws: WsConfig,
    pub execution: ExecutionConfig,
    pub accel: AccelConfig,
    pub roi: RoiConfig,
    pub risk: RiskConfig,
    pub rate_limit: RateLimitConfig,
    pub telegram: TelegramConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WsConfig {
    pub stale_data_ms: i64,
    pub reconnect: ReconnectConfig,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            stale_data_ms: 1_500,
            reconnect: ReconnectConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub order_ttl_ms: i64,
    pub repost_cooldown_ms: i64,
    pub min_signal_interval_ms: i64,
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

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            order_ttl_ms: 800,
            repost_cooldown_ms: 100,
            min_signal_interval_ms: 200,
            base_lot_mult: 1,
            maker_price_mode: MakerPriceMode::InsideSpread1Tick,
            maker_n_ticks: 1,
            maker_safety_ticks: 1,
            maker_timeouts_to_escalate: 2,
            aggr_fills_to_deescalate: 1,
            aggr_timeouts_to_deescalate: 2,
            max_mult: 50,
            max_order_notional: Decimal::from(200),
            ws_fill_grace_ms: 5_000,
            fill_rate: FillRateConfig::default(),
        }
    }
}

/// Maker fill-rate feedback; off by default.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FillRateConfig {
    pub enabled: bool,
    pub window_ms: i64,
    pub low_threshold: Decimal,
    pub high_threshold: Decimal,
    pub low_maker_timeouts_to_escalate: i32,
    pub high_maker_timeouts_to_escalate: Option<i32>,
}

impl Default for FillRateConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window_ms: 300_000,
            low_threshold: Decimal::new(25, 2),
            high_threshold: Decimal::new(75, 2),
            low_maker_timeouts_to_escalate: 1,
            high_maker_timeouts_to_escalate: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AccelConfig {
    pub window_ms: i64,
    pub tiers: Vec<AccelTier>,
}

impl Default for AccelConfig {
    fn default() -> Self {
        Self {
            window_ms: 3_000,
            tiers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccelTier {
    pub ret: Decimal,
    pub mult: u32,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RoiConfig {
    pub tiers: Vec<RoiTier>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoiTier {
    pub roi: Decimal,
    pub mult: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub liq_distance_threshold: Decimal,
    pub panic_close: PanicCloseConfig,
    pub protective_stop: ProtectiveStopConfig,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            liq_distance_threshold: Decimal::new(15, 3),
            panic_close: PanicCloseConfig::default(),
            protective_stop: ProtectiveStopConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PanicCloseConfig {
    pub enabled: bool,
    /// TTL of panic orders as a fraction of the normal order TTL, in (0, 1].
    pub ttl_percent: Decimal,
    pub tiers: Vec<PanicTier>,
}

impl Default for PanicCloseConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_percent: Decimal::new(5, 1),
            tiers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PanicTier {
    pub dist_to_liq: Decimal,
    pub slice_ratio: Decimal,
    pub maker_timeouts_to_escalate: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProtectiveStopConfig {
    pub enabled: bool,
    pub dist_to_liq: Decimal,
    pub external_takeover: ExternalTakeoverConfig,
}

impl Default for ProtectiveStopConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            dist_to_liq: Decimal::new(5, 2),
            external_takeover: ExternalTakeoverConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExternalTakeoverConfig {
    pub enabled: bool,
    pub rest_verify_interval_s: i64,
    pub max_hold_s: i64,
}

impl Default for ExternalTakeoverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rest_verify_interval_s: 30,
            max_hold_s: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_orders_per_sec: usize,
    pub max_cancels_per_sec: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_orders_per_sec: 5,
            max_cancels_per_sec: 8,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TelegramConfig {
    pub enabled: bool,
    pub events: TelegramEvents,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelegramEvents {
    pub on_fill: bool,
    pub on_reconnect: bool,
    pub on_risk_trigger: bool,
    pub on_open_alert: bool,
}

impl Default for TelegramEvents {
    fn default() -> Self {
        Self {
            on_fill: true,
            on_reconnect: true,
            on_risk_trigger: true,
            on_open_alert: false,
        }
    }
}

/// Per-symbol overrides. Same shape as the global groups; absent fields
/// fall back to the global value.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SymbolConfig {
    pub execution: Option<ExecutionOverrides>,
    pub accel: Option<AccelOverrides>,
    pub roi: Option<RoiOverrides>,
    pub risk: Option<RiskOverrides>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ExecutionOverrides {
    pub order_ttl_ms: Option<i64>,
    pub repost_cooldown_ms: Option<i64>,
    pub min_signal_interval_ms: Option<i64>,
    pub base_lot_mult: Option<u32>,
    pub maker_price_mode: Option<MakerPriceMode>,
    pub maker_n_ticks: Option<u32>,
    pub maker_safety_ticks: Option<u32>,
    pub maker_timeouts_to_escalate: Option<i32>,
    pub aggr_fills_to_deescalate: Option<i32>,
    pub aggr_timeouts_to_deescalate: Option<i32>,
    pub max_mult: Option<u32>,
    pub max_order_notional: Option<Decimal>,
    pub ws_fill_grace_ms: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AccelOverrides {
    pub window_ms: Option<i64>,
    pub tiers: Option<Vec<AccelTier>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RoiOverrides {
    pub tiers: Option<Vec<RoiTier>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct RiskOverrides {
    pub liq_distance_threshold: Option<Decimal>,
    pub panic_close: Option<PanicCloseOverrides>,
    pub protective_stop: Option<ProtectiveStopOverrides>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct PanicCloseOverrides {
    pub enabled: Option<bool>,
    pub ttl_percent: Option<Decimal>,
    pub tiers: Option<Vec<PanicTier>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ProtectiveStopOverrides {
    pub enabled: Option<bool>,
    pub dist_to_liq: Option<Decimal>,
    pub external_takeover: Option<ExternalTakeoverOverrides>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ExternalTakeoverOverrides {
    pub enabled: Option<bool>,
    pub rest_verify_interval_s: Option<i64>,
    pub max_hold_s: Option<i64>,
}

/// One symbol's fully-resolved settings: symbol override where present,
/// global default otherwise.
#[derive(Debug, Clone)]
pub struct MergedSymbolConfig {
    pub symbol: String,
    pub stale_data_ms: i64,
    pub order_ttl_ms: i64,
    pub repost_cooldown_ms: i64,
    pub min_signal_interval_ms: i64,
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
    pub accel_window_ms: i64,
    pub accel_tiers: Vec<AccelTier>,
    pub roi_tiers: Vec<RoiTier>,
    pub liq_distance_threshold: Decimal,
    pub panic_close_enabled: bool,
    pub panic_close_ttl_percent: Decimal,
    pub panic_close_tiers: Vec<PanicTier>,
    pub protective_stop_enabled: bool,
    pub protective_stop_dist_to_liq: Decimal,
    pub external_takeover_enabled: bool,
    pub external_takeover_rest_verify_interval_s: i64,
    pub external_takeover_max_hold_s: i64,
}

impl AppConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("read config file {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&content)
            .with_context(|| format!("parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn symbols(&self) -> Vec<String> {
        self.symbols.keys().cloned().collect()
    }

    /// Fail-fast checks. Anything wrong here stops the process before it
    /// touches the exchange.
    pub fn validate(&self) -> Result<()> {
        if self.symbols.is_empty() {
            bail!("configuration defines no symbols");
        }
        for symbol in self.symbols.keys() {
            let merged = self.merged(symbol);
            if merged.maker_safety_ticks < 1 {
                bail!("{symbol}: maker_safety_ticks must be >= 1");
            }
            if merged.fill_rate.enabled {
                if merged.fill_rate.low_threshold > merged.fill_rate.high_threshold {
                    bail!("{symbol}: fill_rate low_threshold must be <= high_threshold");
                }
                if merged.fill_rate.window_ms <= 0 {
                    bail!("{symbol}: fill_rate window_ms must be > 0");
                }
            }
            if merged.panic_close_enabled {
                if merged.panic_close_ttl_percent <= Decimal::ZERO
                    || merged.panic_close_ttl_percent > Decimal::ONE
                {
                    bail!("{symbol}: panic_close ttl_percent must be in (0, 1]");
                }
                for tier in &merged.panic_close_tiers {
                    if tier.slice_ratio <= Decimal::ZERO || tier.slice_ratio > Decimal::ONE {
                        bail!("{symbol}: panic tier slice_ratio must be in (0, 1]");
                    }
                    if tier.maker_timeouts_to_escalate < 1 {
                        bail!("{symbol}: panic tier maker_timeouts_to_escalate must be >= 1");
                    }
                }
            }
            if merged.protective_stop_enabled
                && (merged.protective_stop_dist_to_liq <= Decimal::ZERO
                    || merged.protective_stop_dist_to_liq >= Decimal::ONE)
            {
                bail!("{symbol}: protective_stop dist_to_liq must be in (0, 1)");
            }
            if merged.external_takeover_enabled
                && (merged.external_takeover_rest_verify_interval_s < 1
                    || merged.external_takeover_max_hold_s < 1)
            {
                bail!("{symbol}: external_takeover intervals must be >= 1s");
            }
        }
        Ok(())
    }

    pub fn merged(&self, symbol: &str) -> MergedSymbolConfig {
        let g = &self.global;
        let s = self.symbols.get(symbol);
        let s_exec = s.and_then(|s| s.execution.as_ref());
        let s_accel = s.and_then(|s| s.accel.as_ref());
        let s_roi = s.and_then(|s| s.roi.as_ref());
        let s_risk = s.and_then(|s| s.risk.as_ref());
        let s_panic = s_risk.and_then(|r| r.panic_close.as_ref());
        let s_pstop = s_risk.and_then(|r| r.protective_stop.as_ref());
        let s_takeover = s_pstop.and_then(|p| p.external_takeover.as_ref());

        MergedSymbolConfig {
            symbol: symbol.to_string(),
            stale_data_ms: g.ws.stale_data_ms,
            order_ttl_ms: pick(s_exec, |e| e.order_ttl_ms, g.execution.order_ttl_ms),
            repost_cooldown_ms: pick(s_exec, |e| e.repost_cooldown_ms, g.execution.repost_cooldown_ms),
            min_signal_interval_ms: pick(
                s_exec,
                |e| e.min_signal_interval_ms,
                g.execution.min_signal_interval_ms,
            ),
            base_lot_mult: pick(s_exec, |e| e.base_lot_mult, g.execution.base_lot_mult),
            maker_price_mode: pick(s_exec, |e| e.maker_price_mode, g.execution.maker_price_mode),
            maker_n_ticks: pick(s_exec, |e| e.maker_n_ticks, g.execution.maker_n_ticks),
            maker_safety_ticks: pick(s_exec, |e| e.maker_safety_ticks, g.execution.maker_safety_ticks),
            maker_timeouts_to_escalate: pick(
                s_exec,
                |e| e.maker_timeouts_to_escalate,
                g.execution.maker_timeouts_to_escalate,
            ),
            aggr_fills_to_deescalate: pick(
                s_exec,
                |e| e.aggr_fills_to_deescalate,
                g.execution.aggr_fills_to_deescalate,
            ),
            aggr_timeouts_to_deescalate: pick(
                s_exec,
                |e| e.aggr_timeouts_to_deescalate,
                g.execution.aggr_timeouts_to_deescalate,
            ),
            max_mult: pick(s_exec, |e| e.max_mult, g.execution.max_mult),
            max_order_notional: pick(s_exec, |e| e.max_order_notional, g.execution.max_order_notional),
            ws_fill_grace_ms: pick(s_exec, |e| e.ws_fill_grace_ms, g.execution.ws_fill_grace_ms),
            fill_rate: g.execution.fill_rate.clone(),
            accel_window_ms: pick(s_accel, |a| a.window_ms, g.accel.window_ms),
            accel_tiers: s_accel
                .and_then(|a| a.tiers.clone())
                .unwrap_or_else(|| g.accel.tiers.clone()),
            roi_tiers: s_roi
                .and_then(|r| r.tiers.clone())
                .unwrap_or_else(|| g.roi.tiers.clone()),
            liq_distance_threshold: pick(
                s_risk,
                |r| r.liq_distance_threshold,
                g.risk.liq_distance_threshold,
            ),
            panic_close_enabled: pick(s_panic, |p| p.enabled, g.risk.panic_close.enabled),
            panic_close_ttl_percent: pick(s_panic, |p| p.ttl_percent, g.risk.panic_close.ttl_percent),
            panic_close_tiers: s_panic
                .and_then(|p| p.tiers.clone())
                .unwrap_or_else(|| g.risk.panic_close.tiers.clone()),
            protective_stop_enabled: pick(s_pstop, |p| p.enabled, g.risk.protective_stop.enabled),
            protective_stop_dist_to_liq: pick(
                s_pstop,
                |p| p.dist_to_liq,
                g.risk.protective_stop.dist_to_liq,
            ),
            external_takeover_enabled: pick(
                s_takeover,
                |t| t.enabled,
                g.risk.protective_stop.external_takeover.enabled,
            ),
            external_takeover_rest_verify_interval_s: pick(
                s_takeover,
                |t| t.rest_verify_interval_s,
                g.risk.protective_stop.external_takeover.rest_verify_interval_s,
            ),
            external_takeover_max_hold_s: pick(
                s_takeover,
                |t| t.max_hold_s,
                g.risk.protective_stop.external_takeover.max_hold_s,
            ),
        }
    }
}

fn pick<S, T: Clone>(overrides: Option<&S>, field: impl Fn(&S) -> Option<T>, default: T) -> T {
    overrides.and_then(field).unwrap_or(default)
}

/// API credentials arrive only through the environment.
#[derive(Debug, Clone)]
pub struct EnvCredentials {
    pub api_key: String,
    pub api_secret: String,
}

impl EnvCredentials {
    pub fn from_env() -> Result<Self> {
        let api_key = std::env::var("BINANCE_API_KEY")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .context("environment variable BINANCE_API_KEY is not set")?;
        let api_secret = std::env::var("BINANCE_API_SECRET")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .context("environment variable BINANCE_API_SECRET is not set")?;
        Ok(Self { api_key, api_secret })
    }
}
