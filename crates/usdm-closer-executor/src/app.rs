/*
[INPUT]:  Config, env credentials, WS event streams, OS shutdown signal
[OUTPUT]: Running per-side execution loops, protective-stop sync scheduling,
          reconnect calibration, bounded shutdown
[POS]:    Orchestration layer - task graph and cross-component glue
[UPDATE]: When task topology, takeover protocol, or shutdown order change
*/

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::{Mutex as TokioMutex, Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use usdm_closer_adapter::util::{mono_ms, now_ms};
use usdm_closer_adapter::{
    AlgoOrderUpdate, ClientConfig, Credentials, InstrumentRule, LeverageUpdate, MarketEventKind,
    MarketStream, MarketStreamEvent, OpenOrder, OrderIntent, OrderResult, OrderUpdate, Position,
    PositionSide, PositionUpdate, ReconnectPolicy, TimeInForce, TradeMeta, UsdmClient,
    UserDataStream, UserStreamEvent,
};

use crate::config::{AppConfig, EnvCredentials, MergedSymbolConfig, TelegramEvents};
use crate::execution::{
    ExecutionEngine, ExecutionMode, ExecutionState, FillEvent, FillListener, OrderGateway,
};
use crate::notify::{FillNotification, TelegramNotifier};
use crate::protective_stop::{ProtectiveStopManager, StopExchange, SymbolSyncArgs};
use crate::rate_limit::SlidingWindowRateLimiter;
use crate::risk::{RiskManager, dist_to_liq};
use crate::signal::{MarketState, SignalEngine};

pub const CLIENT_ORDER_PREFIX: &str = "uc";
pub const PROTECTIVE_STOP_PREFIX: &str = "uc-ps-";

const STOP_ORDER_TYPES: [&str; 4] = ["STOP_MARKET", "TAKE_PROFIT_MARKET", "STOP", "TAKE_PROFIT"];

const SIDE_LOOP_INTERVAL: Duration = Duration::from_millis(50);
const TIMEOUT_CHECK_INTERVAL: Duration = Duration::from_millis(100);
const DATA_WARMUP: Duration = Duration::from_secs(2);
const EVENT_CHANNEL_CAPACITY: usize = 1_024;

type Key = (String, PositionSide);

/// Identity of this run; every order we place carries this prefix so that
/// shutdown cleanup touches only our own orders.
#[derive(Debug, Clone)]
pub struct RunIdentity {
    pub run_id: String,
    pub prefix: String,
}

impl RunIdentity {
    pub fn new() -> Self {
        let run_id = Uuid::new_v4().simple().to_string()[..10].to_string();
        let prefix = format!("{CLIENT_ORDER_PREFIX}-{run_id}-");
        Self { run_id, prefix }
    }

    pub fn next_client_order_id(&self) -> String {
        let suffix_len = 36usize.saturating_sub(self.prefix.len());
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{}{}", self.prefix, &suffix[..suffix_len.min(suffix.len())])
    }
}

impl Default for RunIdentity {
    fn default() -> Self {
        Self::new()
    }
}

/// External-takeover latch for one `(symbol, side)`.
#[derive(Debug, Clone, Default)]
pub struct ExternalTakeoverState {
    pub active: bool,
    pub first_seen_ms: i64,
    pub last_seen_ms: i64,
    pub last_verify_ms: i64,
    pub last_verify_present: Option<bool>,
    pub pending_release: bool,
}

/// Order gateway: run-prefixed client order ids, soft rate limiting with a
/// risk bypass, and transport errors folded into results.
pub struct Gateway {
    client: Arc<UsdmClient>,
    identity: RunIdentity,
    order_limiter: StdMutex<SlidingWindowRateLimiter>,
    cancel_limiter: StdMutex<SlidingWindowRateLimiter>,
}

impl Gateway {
    pub fn new(client: Arc<UsdmClient>, identity: RunIdentity, max_orders_per_sec: usize, max_cancels_per_sec: usize) -> Self {
        Self {
            client,
            identity,
            order_limiter: StdMutex::new(SlidingWindowRateLimiter::new(max_orders_per_sec, 1_000)),
            cancel_limiter: StdMutex::new(SlidingWindowRateLimiter::new(max_cancels_per_sec, 1_000)),
        }
    }

    pub fn identity(&self) -> &RunIdentity {
        &self.identity
    }
}

#[async_trait]
impl OrderGateway for Gateway {
    async fn place_order(&self, intent: &OrderIntent) -> OrderResult {
        if !intent.is_risk && !self.order_limiter.lock().expect("order limiter").try_acquire(mono_ms()) {
            info!(symbol = %intent.symbol, reason = "place_order", "soft rate limit hit");
            return OrderResult::rejected("rate_limited:place_order", "rate_limited: place_order");
        }

        let mut intent = intent.clone();
        if intent.client_order_id.is_none() {
            intent.client_order_id = Some(self.identity.next_client_order_id());
        }

        match self.client.place_order(&intent).await {
            Ok(result) => result,
            Err(err) => {
                warn!(symbol = %intent.symbol, error = %err, "place order transport failure");
                OrderResult {
                    success: false,
                    error_code: Some("PLACE_ORDER_FAILED".to_string()),
                    error_message: Some(err.to_string()),
                    ..Default::default()
                }
            }
        }
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str, is_risk: bool) -> OrderResult {
        if !is_risk && !self.cancel_limiter.lock().expect("cancel limiter").try_acquire(mono_ms()) {
            info!(symbol, order_id, reason = "cancel_order", "soft rate limit hit");
            return OrderResult::rejected("rate_limited:cancel_order", "rate_limited: cancel_order");
        }

        match self.client.cancel_order(symbol, order_id).await {
            Ok(result) => result,
            Err(err) => {
                warn!(symbol, order_id, error = %err, "cancel transport failure");
                OrderResult::failed(err.to_string())
            }
        }
    }

    async fn fetch_order_trade_meta(&self, symbol: &str, order_id: &str) -> TradeMeta {
        match self.client.fetch_order_trade_meta(symbol, order_id).await {
            Ok(meta) => meta,
            Err(err) => {
                warn!(symbol, order_id, error = %err, "trade meta fetch failed");
                TradeMeta::default()
            }
        }
    }
}

// Protective stops talk to the exchange through the same gateway; their
// intents are risk-tagged so no soft limiter applies.
#[async_trait]
impl StopExchange for Gateway {
    async fn fetch_open_orders_raw(&self, symbol: &str) -> usdm_closer_adapter::Result<Vec<OpenOrder>> {
        self.client.fetch_open_orders_raw(Some(symbol)).await
    }

    async fn fetch_open_orders(&self, symbol: &str) -> usdm_closer_adapter::Result<Vec<OpenOrder>> {
        self.client.fetch_open_orders(Some(symbol)).await
    }

    async fn fetch_open_algo_orders(&self, symbol: &str) -> usdm_closer_adapter::Result<Vec<OpenOrder>> {
        self.client.fetch_open_algo_orders(Some(symbol)).await
    }

    async fn cancel_algo_order(&self, symbol: &str, order_id: &str) -> OrderResult {
        match self.client.cancel_algo_order(symbol, order_id).await {
            Ok(result) => result,
            Err(err) => OrderResult::failed(err.to_string()),
        }
    }

    async fn place_order(&self, intent: &OrderIntent) -> OrderResult {
        OrderGateway::place_order(self, intent).await
    }
}

struct StopSyncTask {
    handle: JoinHandle<()>,
    reason: String,
}

/// State shared across tasks.
struct Shared {
    positions: StdRwLock<HashMap<String, HashMap<PositionSide, Position>>>,
    rules: StdRwLock<HashMap<String, InstrumentRule>>,
    leverage: StdRwLock<HashMap<String, u32>>,
    calibrating: AtomicBool,
    calibration_lock: TokioMutex<()>,
    calibration_running: AtomicBool,
    latch: StdMutex<HashMap<Key, ExternalTakeoverState>>,
    stop_sync_tasks: StdMutex<HashMap<String, StopSyncTask>>,
    panic_last_tier: StdMutex<HashMap<Key, Decimal>>,
    no_position_logged: StdMutex<HashSet<Key>>,
    positions_ready: AtomicBool,
    position_revision: StdMutex<HashMap<Key, u64>>,
    position_last_change: StdMutex<HashMap<Key, (Decimal, Decimal)>>,
    position_notify: Notify,
    core_tasks: StdMutex<Vec<JoinHandle<()>>>,
    stream_tasks: StdMutex<Vec<JoinHandle<()>>>,
    aux_tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            positions: StdRwLock::new(HashMap::new()),
            rules: StdRwLock::new(HashMap::new()),
            leverage: StdRwLock::new(HashMap::new()),
            calibrating: AtomicBool::new(false),
            calibration_lock: TokioMutex::new(()),
            calibration_running: AtomicBool::new(false),
            latch: StdMutex::new(HashMap::new()),
            stop_sync_tasks: StdMutex::new(HashMap::new()),
            panic_last_tier: StdMutex::new(HashMap::new()),
            no_position_logged: StdMutex::new(HashSet::new()),
            positions_ready: AtomicBool::new(false),
            position_revision: StdMutex::new(HashMap::new()),
            position_last_change: StdMutex::new(HashMap::new()),
            position_notify: Notify::new(),
            core_tasks: StdMutex::new(Vec::new()),
            stream_tasks: StdMutex::new(Vec::new()),
            aux_tasks: StdMutex::new(Vec::new()),
        }
    }

    fn position(&self, symbol: &str, side: PositionSide) -> Option<Position> {
        self.positions
            .read()
            .expect("positions lock")
            .get(symbol)
            .and_then(|sides| sides.get(&side))
            .cloned()
    }

    fn track_aux(&self, handle: JoinHandle<()>) {
        let mut tasks = self.aux_tasks.lock().expect("aux tasks");
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
    }
}

/// Fill listener wired into every execution engine: logs are already done
/// by the engine; this side spawns the Telegram notification with a
/// position before→after once the next ACCOUNT_UPDATE lands.
struct FillNotifier {
    shared: Arc<Shared>,
    notifier: Option<Arc<TelegramNotifier>>,
    events: TelegramEvents,
    shutdown: CancellationToken,
}

impl FillListener for FillNotifier {
    fn on_fill(&self, event: &FillEvent) {
        let Some(notifier) = self.notifier.clone() else {
            return;
        };
        if !notifier.enabled || !self.events.on_fill || self.shutdown.is_cancelled() {
            return;
        }

        let shared = self.shared.clone();
        let event = event.clone();
        let handle = tokio::spawn(async move {
            let key = (event.symbol.clone(), event.position_side);
            let start_rev = shared
                .position_revision
                .lock()
                .expect("revision lock")
                .get(&key)
                .copied()
                .unwrap_or(0);

            let changed =
                wait_for_position_change(&shared, &key, start_rev, Duration::from_millis(1_500)).await;

            let mut before_after: Option<(Decimal, Decimal)> = None;
            if changed {
                let change = shared
                    .position_last_change
                    .lock()
                    .expect("change lock")
                    .get(&key)
                    .copied();
                if let Some((before, after)) = change
                    && after.abs() <= before.abs()
                {
                    before_after = Some((before, after));
                }
            }

            let (before, after) = before_after.unwrap_or_else(|| {
                // No account update arrived in time; derive from the cache.
                let cached = shared
                    .position(&event.symbol, event.position_side)
                    .map(|p| p.position_amt)
                    .unwrap_or(Decimal::ZERO);
                let delta = match event.position_side {
                    PositionSide::Long => -event.filled_qty,
                    PositionSide::Short => event.filled_qty,
                };
                let mut after = cached + delta;
                if event.position_side == PositionSide::Long && after < Decimal::ZERO {
                    after = Decimal::ZERO;
                }
                if event.position_side == PositionSide::Short && after > Decimal::ZERO {
                    after = Decimal::ZERO;
                }
                (cached, after)
            });

            notifier
                .notify_fill(FillNotification {
                    symbol: event.symbol.clone(),
                    side: event.position_side.as_str().to_string(),
                    mode: event.mode.as_str().to_string(),
                    qty: event.filled_qty.to_string(),
                    avg_price: event.avg_price.to_string(),
                    reason: event.reason.clone(),
                    role: event.role.map(|r| r.to_string()),
                    realized_pnl: event.realized_pnl,
                    fee: event.fee,
                    position_before: before.abs().to_string(),
                    position_after: after.abs().to_string(),
                })
                .await;
        });
        self.shared.track_aux(handle);
    }
}

async fn wait_for_position_change(
    shared: &Arc<Shared>,
    key: &Key,
    start_rev: u64,
    timeout: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let current = shared
            .position_revision
            .lock()
            .expect("revision lock")
            .get(key)
            .copied()
            .unwrap_or(0);
        if current > start_rev {
            return true;
        }
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return false;
        }
        tokio::select! {
            _ = shared.position_notify.notified() => {}
            _ = tokio::time::sleep(remaining) => return false,
        }
    }
}

/// Application root: owns the task graph and all cross-component glue.
pub struct Application {
    me: std::sync::Weak<Application>,
    config: AppConfig,
    symbols: Vec<String>,
    merged: HashMap<String, MergedSymbolConfig>,
    client: Arc<UsdmClient>,
    gateway: Arc<Gateway>,
    engines: HashMap<String, Arc<TokioMutex<ExecutionEngine>>>,
    signal: Arc<TokioMutex<SignalEngine>>,
    risk: RiskManager,
    stops: Arc<ProtectiveStopManager>,
    notifier: Option<Arc<TelegramNotifier>>,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
}

impl Application {
    pub fn new(config: AppConfig, credentials: EnvCredentials) -> Result<Arc<Self>> {
        config.validate()?;
        let symbols = config.symbols();

        let identity = RunIdentity::new();
        info!(run_id = %identity.run_id, prefix = %identity.prefix, "run identity");

        let client = Arc::new(
            UsdmClient::new(
                Credentials::new(credentials.api_key, credentials.api_secret)?,
                config.global.testnet,
                config.global.proxy.as_deref(),
                ClientConfig::default(),
            )
            .context("initialize exchange client")?,
        );

        let gateway = Arc::new(Gateway::new(
            client.clone(),
            identity,
            config.global.rate_limit.max_orders_per_sec,
            config.global.rate_limit.max_cancels_per_sec,
        ));

        let notifier = if config.global.telegram.enabled {
            let token = std::env::var("TELEGRAM_BOT_TOKEN").unwrap_or_default();
            let chat_id = std::env::var("TELEGRAM_CHAT_ID").unwrap_or_default();
            if token.trim().is_empty() {
                anyhow::bail!("TELEGRAM_BOT_TOKEN is not set while telegram.enabled=true");
            }
            if chat_id.trim().is_empty() {
                anyhow::bail!("TELEGRAM_CHAT_ID is not set while telegram.enabled=true");
            }
            Some(Arc::new(TelegramNotifier::new(
                token,
                chat_id,
                true,
                3,
                config.global.proxy.as_deref(),
                Duration::from_secs(10),
            )))
        } else {
            None
        };

        let shared = Arc::new(Shared::new());
        let shutdown = CancellationToken::new();

        let mut merged = HashMap::new();
        let mut signal_engine = SignalEngine::new();
        for symbol in &symbols {
            let cfg = config.merged(symbol);
            signal_engine.configure_symbol(
                symbol,
                cfg.min_signal_interval_ms,
                cfg.accel_window_ms,
                cfg.roi_tiers.clone(),
                cfg.accel_tiers.clone(),
            );
            merged.insert(symbol.clone(), cfg);
        }

        let fill_listener: Arc<dyn FillListener> = Arc::new(FillNotifier {
            shared: shared.clone(),
            notifier: notifier.clone(),
            events: config.global.telegram.events.clone(),
            shutdown: shutdown.clone(),
        });

        let mut engines = HashMap::new();
        for symbol in &symbols {
            let cfg = merged.get(symbol).expect("merged config");
            let engine = ExecutionEngine::new(
                cfg.into(),
                gateway.clone(),
                Some(fill_listener.clone()),
            )
            .with_context(|| format!("build execution engine for {symbol}"))?;
            engines.insert(symbol.clone(), Arc::new(TokioMutex::new(engine)));
        }

        let stops = Arc::new(ProtectiveStopManager::new(
            gateway.clone(),
            PROTECTIVE_STOP_PREFIX,
        ));

        let risk = RiskManager::new(config.global.risk.liq_distance_threshold);

        Ok(Arc::new_cyclic(|me| Self {
            me: me.clone(),
            config,
            symbols,
            merged,
            client,
            gateway,
            engines,
            signal: Arc::new(TokioMutex::new(signal_engine)),
            risk,
            stops,
            notifier,
            shared,
            shutdown,
        }))
    }

    /// Strong handle to self for task spawning.
    fn arc(&self) -> Arc<Self> {
        self.me.upgrade().expect("application dropped while running")
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Startup, task graph, wait for shutdown, teardown.
    pub async fn run(&self) -> Result<()> {
        info!(symbols = ?self.symbols, "starting up");

        let rules = self.client.load_markets().await.context("load markets")?;
        {
            let mut cache = self.shared.rules.write().expect("rules lock");
            for symbol in &self.symbols {
                let symbol = symbol.as_str();
                match rules.get(symbol) {
                    Some(rule) => {
                        info!(
                            symbol,
                            tick = %rule.tick_size,
                            step = %rule.step_size,
                            min_qty = %rule.min_qty,
                            "instrument rules loaded"
                        );
                        cache.insert(symbol.to_string(), rule.clone());
                    }
                    None => warn!(symbol, "no instrument rules found"),
                }
            }
        }

        self.fetch_positions_all().await.context("fetch startup positions")?;
        self.log_startup_no_positions();
        self.shared.positions_ready.store(true, Ordering::SeqCst);
        self.sync_protective_stops_all("startup").await;

        // Stream ingest.
        let policy = ReconnectPolicy {
            initial_delay_ms: self.config.global.ws.reconnect.initial_delay_ms,
            max_delay_ms: self.config.global.ws.reconnect.max_delay_ms,
            multiplier: self.config.global.ws.reconnect.multiplier,
        };
        let (market_tx, market_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (user_tx, user_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let market_stream = MarketStream::new(
            self.symbols.clone(),
            self.config.global.testnet,
            policy,
            market_tx,
        );
        let user_stream = UserDataStream::new(self.client.clone(), policy, user_tx);
        {
            let mut streams = self.shared.stream_tasks.lock().expect("stream tasks");
            streams.push(self.spawn_monitored("market_ws", market_stream.run(self.shutdown.clone())));
            streams.push(self.spawn_monitored("user_data_ws", user_stream.run(self.shutdown.clone())));
        }

        {
            let mut core = self.shared.core_tasks.lock().expect("core tasks");
            core.push(self.spawn_monitored("market_dispatch", self.arc().market_dispatch(market_rx)));
            core.push(self.spawn_monitored("user_dispatch", self.arc().user_dispatch(user_rx)));
        }

        info!("waiting for market data warmup");
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = tokio::time::sleep(DATA_WARMUP) => {}
        }

        {
            let mut core = self.shared.core_tasks.lock().expect("core tasks");
            for symbol in self.symbols.clone() {
                for side in PositionSide::both() {
                    core.push(
                        self.spawn_monitored("side_loop", self.arc().side_loop(symbol.clone(), side)),
                    );
                }
            }
            core.push(self.spawn_monitored("timeout_check", self.arc().timeout_check_loop()));
        }

        self.shutdown.cancelled().await;
        self.shutdown_sequence().await;
        Ok(())
    }

    /// Spawn a long-lived task whose unexpected exit or panic requests
    /// shutdown. Aborting the returned handle also aborts the inner task.
    fn spawn_monitored(
        &self,
        name: &'static str,
        fut: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> JoinHandle<()> {
        struct AbortOnDrop(tokio::task::AbortHandle);
        impl Drop for AbortOnDrop {
            fn drop(&mut self) {
                self.0.abort();
            }
        }

        let shutdown = self.shutdown.clone();
        let inner = tokio::spawn(fut);
        let guard = AbortOnDrop(inner.abort_handle());
        tokio::spawn(async move {
            let _guard = guard;
            match inner.await {
                Ok(()) if !shutdown.is_cancelled() => {
                    error!(task = name, "background task exited unexpectedly");
                    shutdown.cancel();
                }
                Err(err) if err.is_panic() && !shutdown.is_cancelled() => {
                    error!(task = name, "background task panicked");
                    shutdown.cancel();
                }
                _ => {}
            }
        })
    }

    // --- dispatchers --------------------------------------------------------

    async fn market_dispatch(self: Arc<Self>, mut rx: mpsc::Receiver<MarketStreamEvent>) {
        loop {
            let message = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                message = rx.recv() => message,
            };
            let Some(message) = message else { return };

            match message {
                MarketStreamEvent::Event(event) => {
                    {
                        let mut signal = self.signal.lock().await;
                        signal.update_market(&event, mono_ms());
                    }
                    // Mark price feeds the dist-to-liq checks.
                    if event.kind == MarketEventKind::MarkPrice
                        && let Some(mark) = event.mark_price
                    {
                        let mut positions = self.shared.positions.write().expect("positions lock");
                        if let Some(sides) = positions.get_mut(&event.symbol) {
                            for position in sides.values_mut() {
                                position.mark_price = Some(mark);
                            }
                        }
                    }
                }
                MarketStreamEvent::Reconnected => self.on_ws_reconnect("market_data"),
            }
        }
    }

    async fn user_dispatch(self: Arc<Self>, mut rx: mpsc::Receiver<UserStreamEvent>) {
        loop {
            let message = tokio::select! {
                _ = self.shutdown.cancelled() => return,
                message = rx.recv() => message,
            };
            let Some(message) = message else { return };

            match message {
                UserStreamEvent::Order(update) => self.handle_order_update(update).await,
                UserStreamEvent::Algo(update) => self.handle_algo_update(update),
                UserStreamEvent::Position(update) => self.handle_position_update(update),
                UserStreamEvent::Leverage(update) => self.handle_leverage_update(update),
                UserStreamEvent::Reconnected => self.on_ws_reconnect("user_data"),
            }
        }
    }

    // --- reconnect calibration ---------------------------------------------

    fn on_ws_reconnect(&self, stream_type: &'static str) {
        if self.shutdown.is_cancelled() {
            return;
        }

        if let Some(notifier) = self.notifier.clone()
            && self.config.global.telegram.events.on_reconnect
        {
            let handle = tokio::spawn(async move {
                notifier.notify_reconnect(stream_type).await;
            });
            self.shared.track_aux(handle);
        }

        if self
            .shared
            .calibration_running
            .swap(true, Ordering::SeqCst)
        {
            return;
        }

        let app = self.arc();
        let handle = tokio::spawn(async move {
            app.calibrate_after_reconnect(stream_type).await;
            app.shared.calibration_running.store(false, Ordering::SeqCst);
        });
        self.shared.track_aux(handle);
    }

    /// Reconnect means the WS view may have gaps: reload rules and positions
    /// over REST while the `calibrating` gate suspends signal evaluation.
    async fn calibrate_after_reconnect(&self, stream_type: &str) {
        let _guard = self.shared.calibration_lock.lock().await;
        if self.shutdown.is_cancelled() {
            return;
        }

        self.shared.calibrating.store(true, Ordering::SeqCst);
        info!(stream = stream_type, "calibration start");

        let outcome: Result<()> = async {
            let rules = self.client.load_markets().await?;
            {
                let mut cache = self.shared.rules.write().expect("rules lock");
                for symbol in &self.symbols {
                    if let Some(rule) = rules.get(symbol) {
                        cache.insert(symbol.clone(), rule.clone());
                    }
                }
            }
            self.fetch_positions_all().await?;
            Ok(())
        }
        .await;

        if let Err(err) = outcome {
            error!(stream = stream_type, error = %err, "calibration failed");
        } else {
            self.sync_protective_stops_all(&format!("calibration:{stream_type}")).await;
        }

        self.shared.calibrating.store(false, Ordering::SeqCst);
        info!(stream = stream_type, "calibration done");
    }

    // --- user-data handlers -------------------------------------------------

    async fn handle_order_update(&self, update: OrderUpdate) {
        if let Some(engine) = self.engines.get(&update.symbol) {
            engine.lock().await.on_order_update(&update, mono_ms()).await;
        }
        self.stops.on_order_update(&update);

        if update.client_order_id.starts_with(PROTECTIVE_STOP_PREFIX) {
            self.schedule_protective_stop_sync(
                &update.symbol,
                &format!("order_update:{}", update.status.as_str()),
            );
            return;
        }

        // Foreign conditional close orders flip the takeover latch.
        if is_external_stop_shape(update.order_type.as_deref(), update.close_position, update.reduce_only)
        {
            let terminal = update.status.is_terminal();
            let now = mono_ms();
            if terminal {
                self.latch_request_release(&update.symbol, update.position_side, now, "ws_order");
            } else {
                self.latch_set(&update.symbol, update.position_side, now, "ws_order");
            }
            self.schedule_protective_stop_sync(
                &update.symbol,
                &format!("external_stop:{}", update.status.as_str()),
            );
        }
    }

    fn handle_algo_update(&self, update: AlgoOrderUpdate) {
        if !self.engines.contains_key(&update.symbol) {
            return;
        }

        let own = update.client_algo_id.starts_with(PROTECTIVE_STOP_PREFIX)
            || self.stops.is_own_algo_order(&update.symbol, &update.algo_id);
        if own {
            self.stops.on_algo_order_update(&update);
            self.schedule_protective_stop_sync(&update.symbol, &format!("our_algo:{}", update.status));
            return;
        }

        if is_external_stop_shape(update.order_type.as_deref(), update.close_position, update.reduce_only)
        {
            // Unattributed side means either book could be taken over.
            let sides: Vec<PositionSide> = match update.position_side {
                Some(side) => vec![side],
                None => PositionSide::both().to_vec(),
            };
            let terminal = update.is_terminal();
            let now = mono_ms();
            for side in sides {
                if terminal {
                    self.latch_request_release(&update.symbol, side, now, "ws_algo");
                } else {
                    self.latch_set(&update.symbol, side, now, "ws_algo");
                }
            }
            self.schedule_protective_stop_sync(
                &update.symbol,
                &format!("external_algo:{}", update.status),
            );
        }
    }

    fn handle_position_update(&self, update: PositionUpdate) {
        if !self.engines.contains_key(&update.symbol) {
            return;
        }
        let key = (update.symbol.clone(), update.position_side);

        let prev = self.shared.position(&update.symbol, update.position_side);
        let prev_amt = prev.as_ref().map(|p| p.position_amt).unwrap_or(Decimal::ZERO);

        if prev_amt != update.position_amt {
            *self
                .shared
                .position_revision
                .lock()
                .expect("revision lock")
                .entry(key.clone())
                .or_insert(0) += 1;
            self.shared
                .position_last_change
                .lock()
                .expect("change lock")
                .insert(key.clone(), (prev_amt, update.position_amt));
            self.shared.position_notify.notify_waiters();
        }

        if update.position_amt.abs() == Decimal::ZERO {
            // Drop the cache entry entirely so no ghost position lingers.
            let removed = {
                let mut positions = self.shared.positions.write().expect("positions lock");
                positions
                    .get_mut(&update.symbol)
                    .and_then(|sides| sides.remove(&update.position_side))
                    .is_some()
            };
            if removed && prev_amt.abs() > Decimal::ZERO {
                info!(
                    symbol = %update.symbol,
                    side = update.position_side.as_str(),
                    position_amt = %Decimal::ZERO,
                    "position update"
                );
                self.log_no_position(&update.symbol, update.position_side, true);
                // Remaining reduce-only orders on a flat book would reopen
                // exposure through the opposite side; clear them.
                let app = self.arc();
                let symbol = update.symbol.clone();
                let side = update.position_side;
                let handle = tokio::spawn(async move {
                    app.cancel_run_prefix_orders_for_side(&symbol, side, "position_zero").await;
                });
                self.shared.track_aux(handle);
            }
            self.schedule_protective_stop_sync(
                &update.symbol,
                &format!("position_update:{}", update.position_side.as_str()),
            );
            return;
        }

        self.clear_no_position_log(&update.symbol, update.position_side);

        // This executor only closes; any growth is outside interference.
        if self.shared.positions_ready.load(Ordering::SeqCst)
            && update.position_amt.abs() > prev_amt.abs()
            && self.config.global.telegram.events.on_open_alert
            && let Some(notifier) = self.notifier.clone()
        {
            let symbol = update.symbol.clone();
            let side = update.position_side.as_str().to_string();
            let before = prev_amt.abs().to_string();
            let after = update.position_amt.abs().to_string();
            let handle = tokio::spawn(async move {
                notifier.notify_open_alert(&symbol, &side, &before, &after).await;
            });
            self.shared.track_aux(handle);
        }

        let leverage_cache = self
            .shared
            .leverage
            .lock_read(&update.symbol)
            .unwrap_or(0);
        let merged_position = Position {
            symbol: update.symbol.clone(),
            position_side: update.position_side,
            position_amt: update.position_amt,
            entry_price: update
                .entry_price
                .or(prev.as_ref().map(|p| p.entry_price))
                .unwrap_or(Decimal::ZERO),
            unrealized_pnl: update
                .unrealized_pnl
                .or(prev.as_ref().map(|p| p.unrealized_pnl))
                .unwrap_or(Decimal::ZERO),
            leverage: prev
                .as_ref()
                .map(|p| p.leverage)
                .filter(|l| *l > 0)
                .unwrap_or(if leverage_cache > 0 { leverage_cache } else { 1 }),
            mark_price: prev.as_ref().and_then(|p| p.mark_price),
            liquidation_price: prev.as_ref().and_then(|p| p.liquidation_price),
        };

        {
            let mut positions = self.shared.positions.write().expect("positions lock");
            positions
                .entry(update.symbol.clone())
                .or_default()
                .insert(update.position_side, merged_position);
        }

        if prev_amt != update.position_amt {
            info!(
                symbol = %update.symbol,
                side = update.position_side.as_str(),
                position_amt = %update.position_amt,
                "position update"
            );
            self.schedule_protective_stop_sync(
                &update.symbol,
                &format!("position_update:{}", update.position_side.as_str()),
            );
        }
    }

    fn handle_leverage_update(&self, update: LeverageUpdate) {
        if !self.engines.contains_key(&update.symbol) || update.leverage == 0 {
            return;
        }

        {
            let mut leverage = self.shared.leverage.write().expect("leverage lock");
            if leverage.get(&update.symbol) == Some(&update.leverage) {
                return;
            }
            leverage.insert(update.symbol.clone(), update.leverage);
        }

        {
            let mut positions = self.shared.positions.write().expect("positions lock");
            if let Some(sides) = positions.get_mut(&update.symbol) {
                for position in sides.values_mut() {
                    position.leverage = update.leverage;
                }
            }
        }

        info!(
            symbol = %update.symbol,
            leverage = update.leverage,
            reason = "ws_account_config_update",
            "leverage update"
        );
    }

    // --- position bookkeeping ----------------------------------------------

    async fn fetch_positions_all(&self) -> Result<()> {
        match self.client.fetch_leverage_map(&self.symbols).await {
            Ok(map) => {
                if !map.is_empty() {
                    info!(count = map.len(), "leverage snapshot loaded");
                    let mut leverage = self.shared.leverage.write().expect("leverage lock");
                    for (symbol, value) in map {
                        leverage.insert(symbol, value);
                    }
                }
            }
            Err(err) => warn!(error = %err, "startup leverage fetch failed"),
        }

        for symbol in &self.symbols {
            let positions = self.client.fetch_positions(Some(symbol.as_str())).await?;
            self.store_symbol_positions(symbol, positions, true);
        }
        Ok(())
    }

    async fn refresh_position(&self, symbol: &str) {
        match self.client.fetch_positions(Some(symbol)).await {
            Ok(positions) => self.store_symbol_positions(symbol, positions, false),
            Err(err) => warn!(symbol, error = %err, "position refresh failed"),
        }
    }

    /// Clear-then-refill so a missing row cannot leave a ghost position.
    fn store_symbol_positions(&self, symbol: &str, fetched: Vec<Position>, log_updates: bool) {
        let leverage_override = self
            .shared
            .leverage
            .lock_read(symbol)
            .unwrap_or(0);

        let mut sides = HashMap::new();
        for mut position in fetched {
            if leverage_override > 0 && position.leverage != leverage_override {
                position.leverage = leverage_override;
            }
            if position.leverage > 0 {
                self.shared
                    .leverage
                    .write()
                    .expect("leverage lock")
                    .insert(symbol.to_string(), position.leverage);
            }
            if position.position_amt.abs() > Decimal::ZERO {
                self.clear_no_position_log(symbol, position.position_side);
                if log_updates {
                    info!(
                        symbol,
                        side = position.position_side.as_str(),
                        position_amt = %position.position_amt,
                        "position update"
                    );
                }
            }
            sides.insert(position.position_side, position);
        }

        self.shared
            .positions
            .write()
            .expect("positions lock")
            .insert(symbol.to_string(), sides);
    }

    fn log_startup_no_positions(&self) {
        for symbol in &self.symbols {
            for side in PositionSide::both() {
                let held = self
                    .shared
                    .position(symbol, side)
                    .map(|p| p.position_amt.abs() > Decimal::ZERO)
                    .unwrap_or(false);
                if !held {
                    self.log_no_position(symbol, side, false);
                }
            }
        }
    }

    fn log_no_position(&self, symbol: &str, side: PositionSide, cleared: bool) {
        let key = (symbol.to_string(), side);
        if !self
            .shared
            .no_position_logged
            .lock()
            .expect("no-position lock")
            .insert(key)
        {
            return;
        }
        if cleared {
            info!(symbol, side = side.as_str(), "position fully closed");
        }
        info!(symbol, side = side.as_str(), "no position; waiting");
    }

    fn clear_no_position_log(&self, symbol: &str, side: PositionSide) {
        self.shared
            .no_position_logged
            .lock()
            .expect("no-position lock")
            .remove(&(symbol.to_string(), side));
    }

    // --- side evaluation ----------------------------------------------------

    async fn side_loop(self: Arc<Self>, symbol: String, side: PositionSide) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(SIDE_LOOP_INTERVAL) => {}
            }
            self.evaluate_symbol_side(&symbol, side).await;
        }
    }

    async fn evaluate_symbol_side(&self, symbol: &str, side: PositionSide) {
        if self.shared.calibrating.load(Ordering::SeqCst) {
            return;
        }

        let Some(position) = self.shared.position(symbol, side) else {
            return;
        };
        if position.position_amt.abs() == Decimal::ZERO {
            return;
        }

        let Some(cfg) = self.merged.get(symbol) else {
            return;
        };
        let Some(rules) = self
            .shared
            .rules
            .read()
            .expect("rules lock")
            .get(symbol)
            .cloned()
        else {
            return;
        };

        let (market, data_ready) = {
            let signal = self.signal.lock().await;
            (signal.market_state(symbol), signal.is_data_ready(symbol))
        };
        let Some(market) = market else {
            return;
        };
        if market.is_stale(now_ms(), cfg.stale_data_ms) {
            return;
        }
        if market.best_bid <= Decimal::ZERO || market.best_ask <= Decimal::ZERO {
            return;
        }

        let Some(engine) = self.engines.get(symbol).cloned() else {
            return;
        };
        let key = (symbol.to_string(), side);

        // Panic close runs before signals and ignores their throttles.
        let position_dist = dist_to_liq(&position);
        let selected_tier = if cfg.panic_close_enabled && !cfg.panic_close_tiers.is_empty() {
            position_dist.and_then(|dist| {
                let mut tiers = cfg.panic_close_tiers.clone();
                tiers.sort_by(|a, b| a.dist_to_liq.cmp(&b.dist_to_liq));
                tiers.into_iter().find(|tier| dist <= tier.dist_to_liq)
            })
        } else {
            None
        };

        let mut engine = engine.lock().await;

        if let (Some(tier), Some(dist)) = (&selected_tier, position_dist) {
            let tier_changed = {
                let mut last = self.shared.panic_last_tier.lock().expect("panic tier lock");
                last.insert(key.clone(), tier.dist_to_liq) != Some(tier.dist_to_liq)
            };
            if tier_changed {
                warn!(
                    symbol,
                    side = side.as_str(),
                    risk_stage = "panic_close",
                    dist_to_liq = %dist,
                    tier_dist_to_liq = %tier.dist_to_liq,
                    slice_ratio = %tier.slice_ratio,
                    "panic close tier engaged"
                );
                if self.config.global.telegram.events.on_risk_trigger
                    && let Some(notifier) = self.notifier.clone()
                {
                    let symbol = symbol.to_string();
                    let side_name = side.as_str().to_string();
                    let dist_text = dist.to_string();
                    let handle = tokio::spawn(async move {
                        notifier.notify_risk_trigger(&symbol, &side_name, &dist_text).await;
                    });
                    self.shared.track_aux(handle);
                }
            }

            {
                let order_ttl_ms = engine.config().order_ttl_ms;
                let state = engine.state_mut(symbol, side);
                if !state.risk_active {
                    state.risk_active = true;
                    let scaled = Decimal::from(order_ttl_ms) * cfg.panic_close_ttl_percent;
                    let ttl: i64 = scaled.trunc().try_into().unwrap_or(1);
                    state.ttl_ms_override = Some(ttl.max(1));
                }
                state.maker_timeouts_to_escalate_override =
                    Some(tier.maker_timeouts_to_escalate as i32);
            }

            engine.check_cooldown(symbol, side, mono_ms());
            let intent = engine.on_panic_close(
                symbol,
                side,
                position.position_amt,
                &rules,
                &market,
                mono_ms(),
                tier.slice_ratio,
                &format!("panic_close@{}", tier.dist_to_liq),
            );
            if let Some(intent) = intent {
                let result = OrderGateway::place_order(self.gateway.as_ref(), &intent).await;
                engine.on_order_placed(&intent, &result, mono_ms()).await;
            }
            return;
        }

        // Out of the panic zone: recover overrides once the key is idle.
        {
            let state = engine.state_mut(symbol, side);
            if state.risk_active && state.state == ExecutionState::Idle {
                state.risk_active = false;
                state.ttl_ms_override = None;
                state.maker_timeouts_to_escalate_override = None;
                self.shared
                    .panic_last_tier
                    .lock()
                    .expect("panic tier lock")
                    .remove(&key);
            }
        }

        if !data_ready {
            return;
        }

        engine.check_cooldown(symbol, side, mono_ms());

        let signal = {
            let mut signal_engine = self.signal.lock().await;
            signal_engine.evaluate(symbol, side, &position, mono_ms())
        };
        let Some(signal) = signal else {
            return;
        };

        // Close to liquidation: skip the maker dance entirely.
        let risk_flag = self.risk.check_risk(&position, Some(cfg.liq_distance_threshold));
        if risk_flag.is_triggered
            && let Some(dist) = risk_flag.dist_to_liq
        {
            let state = engine.state_mut(symbol, side);
            if state.mode != ExecutionMode::AggressiveLimit {
                engine.set_mode(symbol, side, ExecutionMode::AggressiveLimit, "risk_trigger");
                warn!(
                    symbol,
                    side = side.as_str(),
                    mode = ExecutionMode::AggressiveLimit.as_str(),
                    risk_stage = "liq_distance_breach",
                    dist_to_liq = %dist,
                    "risk trigger"
                );
                if self.config.global.telegram.events.on_risk_trigger
                    && let Some(notifier) = self.notifier.clone()
                {
                    let symbol = symbol.to_string();
                    let side_name = side.as_str().to_string();
                    let dist_text = dist.to_string();
                    let handle = tokio::spawn(async move {
                        notifier.notify_risk_trigger(&symbol, &side_name, &dist_text).await;
                    });
                    self.shared.track_aux(handle);
                }
            }
        }

        let Some(intent) = engine.on_signal(&signal, position.position_amt, &rules, &market, mono_ms())
        else {
            return;
        };

        let result = OrderGateway::place_order(self.gateway.as_ref(), &intent).await;
        let (final_intent, final_result, _retried) =
            maybe_retry_post_only_reject(&mut engine, &intent, result, &rules, &market).await;
        engine.on_order_placed(&final_intent, &final_result, mono_ms()).await;
        drop(engine);

        if final_result.success {
            self.refresh_position(symbol).await;
        }
    }

    // --- timeout sweep ------------------------------------------------------

    async fn timeout_check_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = tokio::time::sleep(TIMEOUT_CHECK_INTERVAL) => {}
            }

            for symbol in &self.symbols {
                if let Some(engine) = self.engines.get(symbol) {
                    let mut engine = engine.lock().await;
                    for side in PositionSide::both() {
                        engine.check_timeout(symbol, side, mono_ms()).await;
                    }
                }

                // Long-held latches are re-verified against REST.
                let Some(cfg) = self.merged.get(symbol) else {
                    continue;
                };
                if cfg.external_takeover_enabled
                    && PositionSide::both()
                        .iter()
                        .any(|side| self.latch_should_verify(symbol, *side, mono_ms()))
                {
                    self.schedule_protective_stop_sync(symbol, "external_takeover_verify");
                }
            }
        }
    }

    // --- external takeover latch --------------------------------------------

    fn takeover_cfg(&self, symbol: &str) -> Option<(i64, i64)> {
        let cfg = self.merged.get(symbol)?;
        if !cfg.external_takeover_enabled {
            return None;
        }
        Some((
            cfg.external_takeover_rest_verify_interval_s * 1_000,
            cfg.external_takeover_max_hold_s * 1_000,
        ))
    }

    fn latch_set(&self, symbol: &str, side: PositionSide, now_ms: i64, source: &str) {
        if self.takeover_cfg(symbol).is_none() {
            return;
        }
        let mut latches = self.shared.latch.lock().expect("latch lock");
        let state = latches.entry((symbol.to_string(), side)).or_default();
        if !state.active {
            state.active = true;
            state.first_seen_ms = now_ms;
            state.last_verify_present = None;
            state.pending_release = false;
            info!(
                symbol,
                side = side.as_str(),
                reason = "external_takeover_set",
                source,
                "external stop takeover latched"
            );
        }
        state.last_seen_ms = now_ms;
    }

    /// Terminal WS state for one external stop does not prove the side is
    /// clear; mark pending and let the REST sweep decide.
    fn latch_request_release(&self, symbol: &str, side: PositionSide, now_ms: i64, _source: &str) {
        if self.takeover_cfg(symbol).is_none() {
            return;
        }
        {
            let mut latches = self.shared.latch.lock().expect("latch lock");
            let state = latches.entry((symbol.to_string(), side)).or_default();
            if !state.active {
                return;
            }
            state.pending_release = true;
            state.last_seen_ms = now_ms;
        }
        self.schedule_protective_stop_sync(symbol, "external_takeover_verify");
    }

    fn latch_release(&self, symbol: &str, side: PositionSide, now_ms: i64, source: &str, reason: &str) -> bool {
        if self.takeover_cfg(symbol).is_none() {
            return false;
        }
        let mut latches = self.shared.latch.lock().expect("latch lock");
        let state = latches.entry((symbol.to_string(), side)).or_default();
        let released = state.active;
        if released {
            state.active = false;
            state.last_verify_present = None;
            state.pending_release = false;
            info!(symbol, side = side.as_str(), reason, source, "external stop takeover released");
        }
        state.last_seen_ms = now_ms;
        released
    }

    fn latch_is_active(&self, symbol: &str, side: PositionSide) -> bool {
        if self.takeover_cfg(symbol).is_none() {
            return false;
        }
        self.shared
            .latch
            .lock()
            .expect("latch lock")
            .get(&(symbol.to_string(), side))
            .map(|s| s.active)
            .unwrap_or(false)
    }

    fn latch_should_verify(&self, symbol: &str, side: PositionSide, now_ms: i64) -> bool {
        let Some((verify_ms, max_hold_ms)) = self.takeover_cfg(symbol) else {
            return false;
        };
        let latches = self.shared.latch.lock().expect("latch lock");
        let Some(state) = latches.get(&(symbol.to_string(), side)) else {
            return false;
        };
        if !state.active {
            return false;
        }
        if state.last_verify_ms == 0 || now_ms - state.last_verify_ms >= verify_ms {
            return true;
        }
        state.first_seen_ms > 0
            && now_ms - state.first_seen_ms >= max_hold_ms
            && now_ms - state.last_verify_ms >= verify_ms.min(5_000)
    }

    fn latch_note_verified(&self, symbol: &str, side: PositionSide, now_ms: i64) {
        let mut latches = self.shared.latch.lock().expect("latch lock");
        if let Some(state) = latches.get_mut(&(symbol.to_string(), side)) {
            state.last_verify_ms = now_ms;
        }
    }

    // --- protective stop scheduling -----------------------------------------

    fn protective_stop_debounce(reason: &str) -> Duration {
        if reason.starts_with("position_update") {
            Duration::from_secs(1)
        } else if reason.starts_with("startup") || reason.starts_with("calibration") {
            Duration::ZERO
        } else {
            Duration::from_millis(200)
        }
    }

    pub fn schedule_protective_stop_sync(&self, symbol: &str, reason: &str) {
        if self.shutdown.is_cancelled() {
            return;
        }

        let mut tasks = self.shared.stop_sync_tasks.lock().expect("stop sync tasks");
        if let Some(prev) = tasks.get(symbol) {
            // Verify syncs only need to run at least once.
            if reason == "external_takeover_verify"
                && prev.reason == "external_takeover_verify"
                && !prev.handle.is_finished()
            {
                return;
            }
            if !prev.handle.is_finished() {
                prev.handle.abort();
            }
        }

        let debounce = Self::protective_stop_debounce(reason);
        let app = self.arc();
        let symbol_owned = symbol.to_string();
        let reason_owned = reason.to_string();
        let handle = tokio::spawn(async move {
            if !debounce.is_zero() {
                tokio::time::sleep(debounce).await;
            }
            app.sync_protective_stop(&symbol_owned, &reason_owned).await;
        });
        tasks.insert(
            symbol.to_string(),
            StopSyncTask {
                handle,
                reason: reason.to_string(),
            },
        );
    }

    async fn sync_protective_stops_all(&self, reason: &str) {
        for symbol in self.symbols.clone() {
            self.sync_protective_stop(&symbol, reason).await;
        }
    }

    async fn sync_protective_stop(&self, symbol: &str, reason: &str) {
        let mut reason = reason.to_string();
        loop {
            let Some(cfg) = self.merged.get(symbol) else {
                return;
            };
            let Some(rules) = self
                .shared
                .rules
                .read()
                .expect("rules lock")
                .get(symbol)
                .cloned()
            else {
                return;
            };
            let positions = self
                .shared
                .positions
                .read()
                .expect("positions lock")
                .get(symbol)
                .cloned()
                .unwrap_or_default();

            let mut latch_map = HashMap::new();
            for side in PositionSide::both() {
                latch_map.insert(side, self.latch_is_active(symbol, side));
            }

            let rest_external = self
                .stops
                .sync_symbol(SymbolSyncArgs {
                    symbol,
                    rules: &rules,
                    positions: &positions,
                    enabled: cfg.protective_stop_enabled,
                    dist_to_liq: cfg.protective_stop_dist_to_liq,
                    external_latch: latch_map,
                    reason: &reason,
                })
                .await;

            let Some((verify_ms, _max_hold_ms)) = self.takeover_cfg(symbol) else {
                return;
            };

            let now = mono_ms();
            let mut needs_resync = false;
            for side in PositionSide::both() {
                self.latch_note_verified(symbol, side, now);
                let present = *rest_external.get(&side).unwrap_or(&false);
                if present {
                    self.latch_set(symbol, side, now, "rest");
                    if let Some(state) = self
                        .shared
                        .latch
                        .lock()
                        .expect("latch lock")
                        .get_mut(&(symbol.to_string(), side))
                    {
                        state.pending_release = false;
                    }
                } else {
                    let (active, pending, last_seen) = {
                        let latches = self.shared.latch.lock().expect("latch lock");
                        latches
                            .get(&(symbol.to_string(), side))
                            .map(|s| (s.active, s.pending_release, s.last_seen_ms))
                            .unwrap_or((false, false, 0))
                    };
                    if active && pending {
                        // The REST sweep is the authoritative witness.
                        if self.latch_release(symbol, side, now, "rest_verify", "external_takeover_release") {
                            needs_resync = true;
                        }
                    } else if active && now - last_seen >= verify_ms
                        && self.latch_release(symbol, side, now, "rest", "external_takeover_release_by_rest")
                    {
                        needs_resync = true;
                    }
                }

                if reason.starts_with("external_takeover_verify") {
                    let mut latches = self.shared.latch.lock().expect("latch lock");
                    if let Some(state) = latches.get_mut(&(symbol.to_string(), side))
                        && state.active
                        && state.last_verify_present != Some(present)
                    {
                        state.last_verify_present = Some(present);
                        info!(
                            symbol,
                            side = side.as_str(),
                            reason = "external_takeover_verify",
                            external_present = present,
                            "takeover latch verified"
                        );
                    }
                }
            }

            if needs_resync {
                // A released latch means our own stop may need re-placing.
                reason = "external_takeover_release".to_string();
                continue;
            }
            return;
        }
    }

    // --- order cleanup ------------------------------------------------------

    async fn cancel_run_prefix_orders_for_side(&self, symbol: &str, side: PositionSide, reason: &str) {
        let prefix = &self.gateway.identity().prefix;
        let orders = match self.client.fetch_open_orders(Some(symbol)).await {
            Ok(orders) => orders,
            Err(err) => {
                warn!(symbol, error = %err, "open orders fetch failed");
                return;
            }
        };

        let mut cancelled = 0usize;
        for order in orders {
            let Some(cid) = order.client_order_id.as_deref() else {
                continue;
            };
            if !cid.starts_with(prefix.as_str()) {
                continue;
            }
            if order.position_side.is_some_and(|ps| ps != side) {
                continue;
            }
            let Some(order_id) = order.order_id.as_deref() else {
                continue;
            };
            match self.client.cancel_order(symbol, order_id).await {
                Ok(result) if result.success => cancelled += 1,
                Ok(result) => warn!(
                    symbol,
                    order_id,
                    error = result.error_message.as_deref().unwrap_or(""),
                    "order cleanup cancel refused"
                ),
                Err(err) => warn!(symbol, order_id, error = %err, "order cleanup cancel failed"),
            }
        }

        if cancelled > 0 {
            info!(symbol, side = side.as_str(), reason, cancelled, "run orders cleaned up");
        }
    }

    /// Shutdown cleanup: cancel every order carrying this run's prefix.
    /// Protective stops carry a different prefix on purpose and survive.
    async fn cancel_own_orders(&self, reason: &str) {
        let prefix = &self.gateway.identity().prefix;
        let mut cancelled = 0usize;
        let mut total_open = 0usize;

        let symbol_scopes: Vec<Option<String>> = if self.symbols.is_empty() {
            vec![None]
        } else {
            self.symbols.iter().cloned().map(Some).collect()
        };

        for scope in symbol_scopes {
            let orders = match self.client.fetch_open_orders(scope.as_deref()).await {
                Ok(orders) => orders,
                Err(err) => {
                    warn!(symbol = scope.as_deref().unwrap_or("*"), error = %err, "open orders fetch failed");
                    continue;
                }
            };
            total_open += orders.len();

            for order in orders {
                let Some(cid) = order.client_order_id.as_deref() else {
                    continue;
                };
                if !cid.starts_with(prefix.as_str()) {
                    continue;
                }
                let Some(order_id) = order.order_id.as_deref() else {
                    continue;
                };
                let symbol = order.symbol.as_str();
                info!(symbol, order_id, client_order_id = cid, reason, "cancelling own order");
                match self.client.cancel_order(symbol, order_id).await {
                    Ok(result) if result.success => cancelled += 1,
                    Ok(result) => warn!(
                        symbol,
                        order_id,
                        error = result.error_message.as_deref().unwrap_or(""),
                        "own order cancel refused"
                    ),
                    Err(err) => warn!(symbol, order_id, error = %err, "own order cancel failed"),
                }
            }
        }

        info!(cancelled, total_open, prefix = prefix.as_str(), reason, "own order cleanup complete");
    }

    // --- shutdown -----------------------------------------------------------

    async fn shutdown_sequence(&self) {
        info!("graceful shutdown started");

        let core = std::mem::take(&mut *self.shared.core_tasks.lock().expect("core tasks"));
        for task in &core {
            task.abort();
        }
        gather_with_timeout(core, Duration::from_secs(2), "core tasks").await;

        let stop_tasks: Vec<JoinHandle<()>> = {
            let mut tasks = self.shared.stop_sync_tasks.lock().expect("stop sync tasks");
            tasks.drain().map(|(_, task)| task.handle).collect()
        };
        for task in &stop_tasks {
            task.abort();
        }
        gather_with_timeout(stop_tasks, Duration::from_secs(2), "protective stop tasks").await;

        // Cancel only this run's orders. The exchange-side protective stops
        // are the durable safety net and are left alone.
        if tokio::time::timeout(Duration::from_secs(8), self.cancel_own_orders("shutdown"))
            .await
            .is_err()
        {
            warn!("own order cleanup timed out");
        }

        let streams = std::mem::take(&mut *self.shared.stream_tasks.lock().expect("stream tasks"));
        gather_with_timeout(streams, Duration::from_secs(5), "stream tasks").await;

        let aux = std::mem::take(&mut *self.shared.aux_tasks.lock().expect("aux tasks"));
        for task in &aux {
            task.abort();
        }
        gather_with_timeout(aux, Duration::from_secs(2), "aux tasks").await;

        info!("graceful shutdown complete");
    }
}

/// Bounded wait for a set of tasks; stragglers are aborted.
async fn gather_with_timeout(tasks: Vec<JoinHandle<()>>, timeout: Duration, name: &str) {
    if tasks.is_empty() {
        return;
    }
    let deadline = tokio::time::Instant::now() + timeout;
    for task in tasks {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            warn!(name, "shutdown gather timed out; aborting stragglers");
            task.abort();
            continue;
        }
        if tokio::time::timeout(remaining, task).await.is_err() {
            warn!(name, "task did not finish in time");
        }
    }
}

fn is_external_stop_shape(
    order_type: Option<&str>,
    close_position: Option<bool>,
    reduce_only: Option<bool>,
) -> bool {
    let Some(order_type) = order_type else {
        return false;
    };
    STOP_ORDER_TYPES.contains(&order_type.to_ascii_uppercase().as_str())
        && (close_position == Some(true) || reduce_only == Some(true))
}

/// One-shot application-layer recovery for a post-only rejection: flip the
/// key to AGGRESSIVE_LIMIT, reprice against the touch, place once with GTC.
pub async fn maybe_retry_post_only_reject(
    engine: &mut ExecutionEngine,
    intent: &OrderIntent,
    result: OrderResult,
    rules: &InstrumentRule,
    market: &MarketState,
) -> (OrderIntent, OrderResult, bool) {
    if result.success || intent.time_in_force != TimeInForce::Gtx {
        return (intent.clone(), result, false);
    }
    let post_only = result.error_code.as_deref() == Some("-5022")
        || result
            .error_message
            .as_deref()
            .is_some_and(|m| m.to_ascii_lowercase().contains("post only"));
    if !post_only {
        return (intent.clone(), result, false);
    }

    engine.set_mode(
        &intent.symbol,
        intent.position_side,
        ExecutionMode::AggressiveLimit,
        "post_only_retry",
    );

    let price = engine.build_aggressive_limit_price(
        intent.position_side,
        market.best_bid,
        market.best_ask,
        rules.tick_size,
    );
    let mut retry = intent.clone();
    retry.price = Some(price);
    retry.time_in_force = TimeInForce::Gtc;
    retry.client_order_id = None;

    debug!(
        symbol = %intent.symbol,
        side = intent.position_side.as_str(),
        price = %price,
        "post-only reject; retrying with aggressive limit"
    );
    let retry_result = engine.gateway().place_order(&retry).await;
    (retry, retry_result, true)
}

/// Small read helper so position merging stays legible.
trait LeverageRead {
    fn lock_read(&self, symbol: &str) -> Option<u32>;
}

impl LeverageRead for StdRwLock<HashMap<String, u32>> {
    fn lock_read(&self, symbol: &str) -> Option<u32> {
        self.read().expect("leverage lock").get(symbol).copied()
    }
}
