//! Engine loop and control surface
//!
//! Drives periodic evaluation, deadline enforcement, market lifecycle, and
//! shutdown. Book updates additionally trigger an immediate evaluation for
//! the affected market, so price-sensitive rules fire within one update
//! latency rather than waiting for the next tick.

use crate::config::Config;
use crate::events::{EngineEvent, EventBus};
use crate::execution::{ExecError, ExecutionCoordinator, VenueExecutor};
use crate::feed::{PriceFeed, SpotPriceTracker};
use crate::market::{MarketContext, MarketDescriptor, MarketStore};
use crate::orderbook::{BookTracker, OrderBook};
use crate::strategy::Evaluator;
use crate::telemetry::{record_counter, set_gauge, CounterMetric, GaugeMetric};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;

/// Seconds a market id stays blocked from re-adding after a permanent
/// venue error
const READD_COOLDOWN_SECS: i64 = 60;

/// Minimum interval between market_update events per market
const MARKET_UPDATE_INTERVAL_MS: i64 = 300;

/// Budget for best-effort order cancellation during shutdown
const SHUTDOWN_CANCEL_BUDGET: Duration = Duration::from_secs(10);

/// Control-surface errors
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("market limit reached ({0})")]
    CapacityExceeded(usize),
    #[error("market {0} already tracked")]
    DuplicateMarket(String),
    #[error("market {0} is in re-add cooldown")]
    ReaddCooldown(String),
}

/// Snapshot returned by `get_status`
#[derive(Debug, Clone)]
pub struct EngineStatus {
    pub running: bool,
    pub halted: bool,
    pub active_markets: usize,
    pub quarantined_markets: usize,
    pub total_pnl: Decimal,
    pub win_rate: Decimal,
    pub completed_trades: u64,
}

#[derive(Default)]
struct EngineState {
    running: bool,
    /// Daily loss limit breached: exits continue, entries stop
    halted: bool,
    /// Markets frozen after an invariant violation
    quarantined: HashSet<String>,
    /// Re-add block after permanent venue errors
    readd_cooldown: HashMap<String, DateTime<Utc>>,
    last_market_update: HashMap<String, DateTime<Utc>>,
    token_to_market: HashMap<String, String>,
}

/// The scalping engine
pub struct Engine {
    config: Config,
    evaluator: Evaluator,
    store: Arc<MarketStore>,
    coordinator: Arc<ExecutionCoordinator>,
    books: Arc<BookTracker>,
    spot: Arc<SpotPriceTracker>,
    feeds: StdMutex<Vec<Arc<dyn PriceFeed>>>,
    bus: EventBus,
    state: Arc<StdMutex<EngineState>>,
    shutdown: watch::Sender<bool>,
}

impl Engine {
    pub fn new(
        config: Config,
        venue: Arc<dyn VenueExecutor>,
        feeds: Vec<Arc<dyn PriceFeed>>,
        bus: EventBus,
    ) -> Arc<Self> {
        let store = Arc::new(MarketStore::new());
        let dry_run = !config.engine.trading_enabled;
        let coordinator = Arc::new(ExecutionCoordinator::new(
            venue,
            Arc::clone(&store),
            bus.clone(),
            dry_run,
        ));
        let books = Arc::new(BookTracker::new(config.venue.ws_url.clone()));
        let spot = Arc::new(SpotPriceTracker::new(&config.feed));
        let (shutdown, _) = watch::channel(false);

        Arc::new(Self {
            evaluator: Evaluator::new(config.strategy.clone()),
            config,
            store,
            coordinator,
            books,
            spot,
            feeds: StdMutex::new(feeds),
            bus,
            state: Arc::new(StdMutex::new(EngineState::default())),
            shutdown,
        })
    }

    /// Observer stream handle
    pub fn events(&self) -> EventBus {
        self.bus.clone()
    }

    // --- Control surface ---

    /// Start the feeds, the book stream, and the tick loop.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        {
            let mut state = self.state.lock().expect("engine state");
            if state.running {
                return Ok(());
            }
            state.running = true;
        }

        let shutdown_rx = self.shutdown.subscribe();
        let feeds = self.feeds.lock().expect("feed list").clone();
        if !feeds.is_empty() {
            self.spot.start(feeds, shutdown_rx.clone()).await?;
        }
        self.books.start(shutdown_rx.clone());

        let engine = Arc::clone(self);
        tokio::spawn(engine.run_tick_loop(shutdown_rx));

        tracing::info!(
            dry_run = !self.config.engine.trading_enabled,
            tick_ms = self.config.engine.tick_interval_ms,
            "engine started"
        );
        self.publish_status().await;
        Ok(())
    }

    /// Stop evaluating, best-effort cancel resting orders, terminate tasks.
    ///
    /// No order placement begins after this is called; the cancel pass runs
    /// under a fixed budget and failures are logged.
    pub async fn stop(self: &Arc<Self>) {
        {
            let mut state = self.state.lock().expect("engine state");
            if !state.running {
                return;
            }
            state.running = false;
        }

        let coordinator = Arc::clone(&self.coordinator);
        let market_ids = self.store.market_ids().await;
        let sweep = async move {
            for market_id in market_ids {
                coordinator.cancel_all_tp_orders(&market_id).await;
            }
        };
        if tokio::time::timeout(SHUTDOWN_CANCEL_BUDGET, sweep).await.is_err() {
            tracing::error!("shutdown cancel sweep exceeded its budget");
        }

        let _ = self.shutdown.send(true);
        self.spot.stop();
        tracing::info!("engine stopped");
        self.publish_status().await;
    }

    /// Begin tracking a market and subscribe its tokens.
    pub async fn add_market(self: &Arc<Self>, descriptor: MarketDescriptor) -> Result<(), EngineError> {
        let market_id = descriptor.market_id.clone();
        {
            let state = self.state.lock().expect("engine state");
            if let Some(until) = state.readd_cooldown.get(&market_id) {
                if Utc::now() < *until {
                    return Err(EngineError::ReaddCooldown(market_id));
                }
            }
        }

        let limit = self.config.engine.max_concurrent_markets;
        if self.store.len().await >= limit {
            return Err(EngineError::CapacityExceeded(limit));
        }

        let tokens = vec![descriptor.token_yes.clone(), descriptor.token_no.clone()];
        if !self.store.add(descriptor).await {
            return Err(EngineError::DuplicateMarket(market_id));
        }

        {
            let mut state = self.state.lock().expect("engine state");
            state.readd_cooldown.remove(&market_id);
            for token in &tokens {
                state.token_to_market.insert(token.clone(), market_id.clone());
            }
        }

        let weak: Weak<Engine> = Arc::downgrade(self);
        self.books
            .subscribe(
                &tokens,
                Arc::new(move |token_id: &str, book: &OrderBook| {
                    if let Some(engine) = weak.upgrade() {
                        let token_id = token_id.to_string();
                        let book = book.clone();
                        tokio::spawn(async move {
                            engine.handle_book_update(token_id, book).await;
                        });
                    }
                }),
            )
            .await;

        tracing::info!(market_id, "market added");
        set_gauge(GaugeMetric::ActiveMarkets, self.store.len().await as f64);
        Ok(())
    }

    /// Stop tracking a market: cancel its resting orders, unsubscribe its
    /// tokens, drop its context.
    pub async fn remove_market(self: &Arc<Self>, market_id: &str) -> Option<MarketContext> {
        self.coordinator.cancel_all_tp_orders(market_id).await;
        let removed = self.store.remove(market_id).await?;

        let tokens = vec![
            removed.descriptor.token_yes.clone(),
            removed.descriptor.token_no.clone(),
        ];
        self.books.unsubscribe(&tokens);

        {
            let mut state = self.state.lock().expect("engine state");
            for token in &tokens {
                state.token_to_market.remove(token);
            }
            state.quarantined.remove(market_id);
            state.last_market_update.remove(market_id);
        }

        tracing::info!(market_id, "market removed");
        set_gauge(GaugeMetric::ActiveMarkets, self.store.len().await as f64);
        Some(removed)
    }

    /// Current engine status
    pub async fn get_status(&self) -> EngineStatus {
        let stats = self.coordinator.stats();
        let (running, halted, quarantined) = {
            let state = self.state.lock().expect("engine state");
            (state.running, state.halted, state.quarantined.len())
        };

        // Realized plus whatever open ladders would lock if unwound now
        let mut total_pnl = stats.realized_pnl;
        for ctx in self.store.snapshot_all().await {
            for position in &ctx.positions {
                if let Some(pnl) = ctx.unrealized_pnl(position) {
                    total_pnl += pnl;
                }
            }
        }

        EngineStatus {
            running,
            halted,
            active_markets: self.store.len().await,
            quarantined_markets: quarantined,
            total_pnl,
            win_rate: stats.win_rate(),
            completed_trades: stats.completed_trades,
        }
    }

    /// Venue fill callback. A fill we cannot attribute quarantines the
    /// market pending manual inspection.
    pub async fn on_venue_fill(self: &Arc<Self>, order_id: &str, price: Decimal, size: Decimal) {
        match self.coordinator.on_fill(order_id, price, size).await {
            Ok(()) => {}
            Err(ExecError::UnknownOrder { order_id, market_id }) => {
                tracing::error!(order_id, ?market_id, "fill for unknown order");
                match market_id {
                    Some(market_id) => {
                        self.quarantine(&market_id, format!("fill for unknown order {order_id}"));
                    }
                    None => self.bus.publish(EngineEvent::Error {
                        market_id: None,
                        kind: "invariant-violation".into(),
                        detail: format!("fill for unknown order {order_id}"),
                        ts: Utc::now(),
                    }),
                }
            }
            Err(e) => {
                tracing::warn!(order_id, error = %e, "fill reconciliation failed");
            }
        }
        self.check_daily_loss();
    }

    /// Venue cancel callback
    pub async fn on_venue_cancel(&self, order_id: &str) {
        self.coordinator.on_cancel(order_id).await;
    }

    // --- Tick loop ---

    async fn run_tick_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut tick =
            tokio::time::interval(Duration::from_millis(self.config.engine.tick_interval_ms));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if !self.is_running() {
                        return;
                    }
                    self.on_tick().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    async fn on_tick(self: &Arc<Self>) {
        let now = Utc::now();

        for snapshot in self.store.snapshot_all().await {
            let market_id = snapshot.descriptor.market_id.clone();
            let time_left = snapshot.time_left(now);

            // Deadline sweep: no resting TP orders inside the unwind window
            if time_left < self.config.strategy.force_unwind_time_left
                && !snapshot.active_tp_orders.is_empty()
            {
                self.coordinator.cancel_all_tp_orders(&market_id).await;
            }

            // Retire expired markets with nothing left open
            if time_left < -self.config.engine.market_grace_secs
                && snapshot.positions.is_empty()
                && snapshot.active_tp_orders.is_empty()
            {
                tracing::info!(market_id, "retiring expired market");
                self.remove_market(&market_id).await;
                continue;
            }

            self.emit_market_update(&market_id, now).await;

            let engine = Arc::clone(self);
            tokio::spawn(async move {
                engine.evaluate_market(market_id).await;
            });
        }

        self.publish_status().await;
    }

    /// Book change entry point: refresh the context's view of the top of
    /// book, notify observers, and re-evaluate immediately.
    async fn handle_book_update(self: Arc<Self>, token_id: String, book: OrderBook) {
        let market_id = {
            let state = self.state.lock().expect("engine state");
            match state.token_to_market.get(&token_id) {
                Some(id) => id.clone(),
                None => return,
            }
        };

        let Some(handle) = self.store.get(&market_id).await else {
            return;
        };
        {
            let mut ctx = handle.lock().await;
            let (bid, ask) = book.top_of_book();
            if token_id == ctx.descriptor.token_yes {
                ctx.yes_bid = bid;
                ctx.yes_price = ask;
            } else {
                ctx.no_bid = bid;
                ctx.no_price = ask;
            }
        }

        self.emit_market_update(&market_id, Utc::now()).await;
        self.evaluate_market(market_id).await;
    }

    /// One serialized evaluation pass for a market. Skips silently when an
    /// execution is already in flight; the next tick retries over fresher
    /// state.
    async fn evaluate_market(self: &Arc<Self>, market_id: String) {
        if !self.is_running() || self.is_quarantined(&market_id) {
            return;
        }

        let gate = self.coordinator.gate(&market_id);
        let Ok(_guard) = gate.try_lock() else {
            return;
        };

        let Some(snapshot) = self.store.snapshot(&market_id).await else {
            return;
        };
        let now = Utc::now();
        let Some(signal) = self.evaluator.evaluate(&snapshot, now) else {
            return;
        };

        if let Err(detail) = signal.validate() {
            tracing::error!(market_id, detail, "evaluator contract violation");
            self.bus.publish(EngineEvent::Error {
                market_id: Some(market_id),
                kind: "evaluator-contract".into(),
                detail,
                ts: now,
            });
            return;
        }

        if self.is_halted() && signal.is_entry() {
            tracing::debug!(market_id, "entry suppressed: daily loss limit reached");
            return;
        }

        if let Some(handle) = self.store.get(&market_id).await {
            handle.lock().await.last_signal_time = Some(now);
        }

        record_counter(CounterMetric::SignalsGenerated, 1);
        self.bus.publish(EngineEvent::SignalGenerated {
            market_id: market_id.clone(),
            action: signal.action,
            side: signal.side,
            size: signal.size,
            price: signal.price,
            reason: signal.reason.clone(),
            dca_level: signal.dca_level,
            ts: now,
        });

        match self.coordinator.execute(&market_id, &signal).await {
            Ok(_) => {}
            Err(ExecError::Venue(e)) if e.is_permanent() => {
                tracing::error!(market_id, error = %e, "permanent venue error, removing market");
                self.bus.publish(EngineEvent::Error {
                    market_id: Some(market_id.clone()),
                    kind: "venue-permanent".into(),
                    detail: e.to_string(),
                    ts: Utc::now(),
                });
                {
                    let mut state = self.state.lock().expect("engine state");
                    state.readd_cooldown.insert(
                        market_id.clone(),
                        Utc::now() + ChronoDuration::seconds(READD_COOLDOWN_SECS),
                    );
                }
                self.remove_market(&market_id).await;
            }
            Err(ExecError::MarketGone(_)) => {}
            Err(e) => {
                // Transient: drop the signal; the next tick re-proposes if
                // conditions still hold
                tracing::warn!(market_id, error = %e, "signal dropped");
                self.bus.publish(EngineEvent::Error {
                    market_id: Some(market_id),
                    kind: "venue-transient".into(),
                    detail: e.to_string(),
                    ts: Utc::now(),
                });
            }
        }

        self.check_daily_loss();
    }

    // --- Helpers ---

    async fn emit_market_update(&self, market_id: &str, now: DateTime<Utc>) {
        {
            let mut state = self.state.lock().expect("engine state");
            if let Some(last) = state.last_market_update.get(market_id) {
                if (now - *last).num_milliseconds() < MARKET_UPDATE_INTERVAL_MS {
                    return;
                }
            }
            state.last_market_update.insert(market_id.to_string(), now);
        }

        let Some(ctx) = self.store.snapshot(market_id).await else {
            return;
        };
        self.bus.publish(EngineEvent::MarketUpdate {
            market_id: market_id.to_string(),
            yes_price: ctx.yes_price,
            no_price: ctx.no_price,
            yes_bid: ctx.yes_bid,
            no_bid: ctx.no_bid,
            time_left: ctx.time_left(now),
            position_summary: ctx.position_summary(),
            ts: now,
        });
    }

    async fn publish_status(&self) {
        let status = self.get_status().await;
        let open_positions: usize = self
            .store
            .snapshot_all()
            .await
            .iter()
            .map(|ctx| ctx.positions.len())
            .sum();
        set_gauge(GaugeMetric::OpenPositions, open_positions as f64);
        set_gauge(GaugeMetric::QuarantinedMarkets, status.quarantined_markets as f64);
        set_gauge(
            GaugeMetric::RealizedPnl,
            self.coordinator.stats().realized_pnl.to_f64().unwrap_or(0.0),
        );
        if let Some(spot) = self.spot.current_price() {
            set_gauge(GaugeMetric::SpotPrice, spot.to_f64().unwrap_or(0.0));
        }
        self.bus.publish(EngineEvent::BotStatus {
            running: status.running,
            active_markets: status.active_markets,
            total_pnl: status.total_pnl,
            win_rate: status.win_rate,
            completed_trades: status.completed_trades,
            ts: Utc::now(),
        });
    }

    fn check_daily_loss(&self) {
        let limit = self.config.engine.daily_loss_limit;
        if limit.is_zero() {
            return;
        }
        let realized = self.coordinator.stats().realized_pnl;
        if realized <= -limit {
            let mut state = self.state.lock().expect("engine state");
            if !state.halted {
                state.halted = true;
                drop(state);
                tracing::warn!(%realized, %limit, "daily loss limit breached, refusing new entries");
                self.bus.publish(EngineEvent::Error {
                    market_id: None,
                    kind: "daily-loss-limit".into(),
                    detail: format!("realized pnl {realized} breached limit {limit}"),
                    ts: Utc::now(),
                });
            }
        }
    }

    fn is_running(&self) -> bool {
        self.state.lock().expect("engine state").running
    }

    fn is_halted(&self) -> bool {
        self.state.lock().expect("engine state").halted
    }

    fn is_quarantined(&self, market_id: &str) -> bool {
        self.state
            .lock()
            .expect("engine state")
            .quarantined
            .contains(market_id)
    }

    /// Freeze a market after an invariant violation: no more signals until
    /// manual inspection.
    pub fn quarantine(&self, market_id: &str, detail: impl Into<String>) {
        let detail = detail.into();
        {
            let mut state = self.state.lock().expect("engine state");
            if !state.quarantined.insert(market_id.to_string()) {
                return;
            }
        }
        tracing::error!(market_id, detail, "market quarantined");
        self.bus.publish(EngineEvent::Error {
            market_id: Some(market_id.to_string()),
            kind: "quarantine".into(),
            detail,
            ts: Utc::now(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EngineConfig, FeedConfig, StrategyParams, TelemetryConfig, VenueConfig};
    use crate::execution::{Order, OrderAck, OrderStatus, OrderType, VenueError};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU64, Ordering};

    enum VenueMode {
        Fill,
        AuthFail,
    }

    /// Venue double: fills market orders at a settable price, rests limits,
    /// or fails everything with an auth error.
    struct TestVenue {
        mode: VenueMode,
        fill_price: StdMutex<Decimal>,
        placed: StdMutex<Vec<Order>>,
        next_id: AtomicU64,
    }

    impl TestVenue {
        fn filling() -> Self {
            Self {
                mode: VenueMode::Fill,
                fill_price: StdMutex::new(dec!(0.50)),
                placed: StdMutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }
        }

        fn auth_failing() -> Self {
            Self {
                mode: VenueMode::AuthFail,
                fill_price: StdMutex::new(dec!(0.50)),
                placed: StdMutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }
        }

        fn set_fill_price(&self, price: Decimal) {
            *self.fill_price.lock().unwrap() = price;
        }

        fn placed_count(&self) -> usize {
            self.placed.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl VenueExecutor for TestVenue {
        async fn place_order(&self, order: &Order) -> Result<OrderAck, VenueError> {
            if matches!(self.mode, VenueMode::AuthFail) {
                return Err(VenueError::Auth("bad credentials".into()));
            }
            self.placed.lock().unwrap().push(order.clone());
            let order_id = format!("ord-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
            match order.order_type {
                OrderType::Market => Ok(OrderAck {
                    order_id,
                    status: OrderStatus::Matched,
                    fill_price: Some(*self.fill_price.lock().unwrap()),
                    fill_size: Some(order.size),
                }),
                OrderType::LimitPostOnly => Ok(OrderAck {
                    order_id,
                    status: OrderStatus::Live,
                    fill_price: None,
                    fill_size: None,
                }),
            }
        }

        async fn cancel_order(&self, _order_id: &str) -> Result<(), VenueError> {
            Ok(())
        }
    }

    fn test_config(max_markets: usize, daily_loss_limit: Decimal) -> Config {
        Config {
            engine: EngineConfig {
                trading_enabled: true,
                max_concurrent_markets: max_markets,
                daily_loss_limit,
                tick_interval_ms: 200,
                market_grace_secs: 600,
            },
            strategy: StrategyParams::default(),
            feed: FeedConfig {
                symbol: "BTCUSDT".into(),
                staleness_secs: 5,
                history_secs: 600,
            },
            venue: VenueConfig {
                rest_url: "https://venue.test".into(),
                ws_url: "wss://venue.test/market".into(),
                api_key: String::new(),
                order_timeout_secs: 5,
            },
            telemetry: TelemetryConfig {
                log_level: "info".into(),
            },
        }
    }

    fn descriptor(id: &str, end_offset_secs: i64) -> MarketDescriptor {
        MarketDescriptor {
            market_id: id.into(),
            question: "q".into(),
            token_yes: format!("{id}-yes"),
            token_no: format!("{id}-no"),
            end_time: Utc::now() + ChronoDuration::seconds(end_offset_secs),
            min_tick: dec!(0.01),
        }
    }

    fn engine_with(venue: Arc<dyn VenueExecutor>, config: Config) -> Arc<Engine> {
        let engine = Engine::new(config, venue, vec![], EventBus::new(64));
        engine.state.lock().unwrap().running = true;
        engine
    }

    async fn set_prices(engine: &Arc<Engine>, market_id: &str, yes: Decimal, no: Decimal) {
        let handle = engine.store.get(market_id).await.unwrap();
        let mut ctx = handle.lock().await;
        ctx.yes_price = Some(yes);
        ctx.no_price = Some(no);
    }

    #[tokio::test]
    async fn test_add_market_capacity() {
        let venue = Arc::new(TestVenue::filling());
        let engine = engine_with(venue, test_config(1, dec!(0)));

        engine.add_market(descriptor("m1", 900)).await.unwrap();
        let err = engine.add_market(descriptor("m2", 900)).await.unwrap_err();
        assert!(matches!(err, EngineError::CapacityExceeded(1)));
    }

    #[tokio::test]
    async fn test_add_market_duplicate() {
        let venue = Arc::new(TestVenue::filling());
        let engine = engine_with(venue, test_config(5, dec!(0)));

        engine.add_market(descriptor("m1", 900)).await.unwrap();
        let err = engine.add_market(descriptor("m1", 900)).await.unwrap_err();
        assert!(matches!(err, EngineError::DuplicateMarket(_)));
    }

    #[tokio::test]
    async fn test_entry_flows_through_to_position() {
        let venue = Arc::new(TestVenue::filling());
        venue.set_fill_price(dec!(0.33));
        let engine = engine_with(Arc::clone(&venue) as Arc<dyn VenueExecutor>, test_config(5, dec!(0)));

        engine.add_market(descriptor("m1", 840)).await.unwrap();
        set_prices(&engine, "m1", dec!(0.33), dec!(0.69)).await;

        engine.evaluate_market("m1".to_string()).await;

        let ctx = engine.store.snapshot("m1").await.unwrap();
        assert_eq!(ctx.positions.len(), 1);
        assert_eq!(ctx.positions[0].entry_price, dec!(0.33));
        assert_eq!(venue.placed_count(), 1);
    }

    #[tokio::test]
    async fn test_permanent_venue_error_removes_market_and_blocks_readd() {
        let venue = Arc::new(TestVenue::auth_failing());
        let engine = engine_with(venue, test_config(5, dec!(0)));

        engine.add_market(descriptor("m1", 840)).await.unwrap();
        set_prices(&engine, "m1", dec!(0.33), dec!(0.69)).await;

        engine.evaluate_market("m1".to_string()).await;

        assert!(!engine.store.contains("m1").await);
        let err = engine.add_market(descriptor("m1", 840)).await.unwrap_err();
        assert!(matches!(err, EngineError::ReaddCooldown(_)));

        // Other market ids are unaffected
        engine.add_market(descriptor("m2", 840)).await.unwrap();
    }

    #[tokio::test]
    async fn test_daily_loss_limit_halts_entries_but_not_exits() {
        let venue = Arc::new(TestVenue::filling());
        venue.set_fill_price(dec!(0.33));
        let engine = engine_with(
            Arc::clone(&venue) as Arc<dyn VenueExecutor>,
            test_config(5, dec!(2)),
        );

        engine.add_market(descriptor("m1", 840)).await.unwrap();
        set_prices(&engine, "m1", dec!(0.33), dec!(0.69)).await;
        engine.evaluate_market("m1".to_string()).await; // enter at 0.33
        engine.evaluate_market("m1".to_string()).await; // TP placed

        // Unwind against a badly slipped fill: pnl = 10*(1-0.33-0.90) = -2.3
        set_prices(&engine, "m1", dec!(0.42), dec!(0.55)).await;
        venue.set_fill_price(dec!(0.90));
        engine.evaluate_market("m1".to_string()).await;

        assert!(engine.is_halted());
        let placed_before = venue.placed_count();

        // A fresh entry opportunity is refused while halted
        set_prices(&engine, "m1", dec!(0.30), dec!(0.70)).await;
        engine.evaluate_market("m1".to_string()).await;
        assert_eq!(venue.placed_count(), placed_before);
        assert!(engine.store.snapshot("m1").await.unwrap().positions.is_empty());
    }

    #[tokio::test]
    async fn test_quarantined_market_is_not_evaluated() {
        let venue = Arc::new(TestVenue::filling());
        let engine = engine_with(Arc::clone(&venue) as Arc<dyn VenueExecutor>, test_config(5, dec!(0)));

        engine.add_market(descriptor("m1", 840)).await.unwrap();
        set_prices(&engine, "m1", dec!(0.33), dec!(0.69)).await;
        engine.quarantine("m1", "test");

        engine.evaluate_market("m1".to_string()).await;
        assert_eq!(venue.placed_count(), 0);

        let status = engine.get_status().await;
        assert_eq!(status.quarantined_markets, 1);
    }

    #[tokio::test]
    async fn test_expired_flat_market_is_retired() {
        let venue = Arc::new(TestVenue::filling());
        let engine = engine_with(venue, test_config(5, dec!(0)));

        // Ended 11 minutes ago, past the 600s grace
        engine.add_market(descriptor("m1", -660)).await.unwrap();
        engine.on_tick().await;

        assert!(!engine.store.contains("m1").await);
    }

    #[tokio::test]
    async fn test_expired_market_with_position_is_kept() {
        let venue = Arc::new(TestVenue::filling());
        venue.set_fill_price(dec!(0.33));
        let engine = engine_with(Arc::clone(&venue) as Arc<dyn VenueExecutor>, test_config(5, dec!(0)));

        engine.add_market(descriptor("m1", 840)).await.unwrap();
        set_prices(&engine, "m1", dec!(0.33), dec!(0.69)).await;
        engine.evaluate_market("m1".to_string()).await;

        // Push the end time into the past, beyond the grace window
        {
            let handle = engine.store.get("m1").await.unwrap();
            handle.lock().await.descriptor.end_time = Utc::now() - ChronoDuration::seconds(700);
        }
        engine.on_tick().await;

        assert!(engine.store.contains("m1").await);
    }

    #[tokio::test]
    async fn test_market_update_rate_limited() {
        let venue = Arc::new(TestVenue::filling());
        let engine = engine_with(venue, test_config(5, dec!(0)));
        engine.add_market(descriptor("m1", 840)).await.unwrap();

        let mut events = engine.bus.subscribe();
        let now = Utc::now();
        engine.emit_market_update("m1", now).await;
        engine.emit_market_update("m1", now + ChronoDuration::milliseconds(100)).await;
        engine.emit_market_update("m1", now + ChronoDuration::milliseconds(400)).await;

        let mut updates = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, EngineEvent::MarketUpdate { .. }) {
                updates += 1;
            }
        }
        assert_eq!(updates, 2);
    }

    #[tokio::test]
    async fn test_unknown_fill_emits_invariant_error() {
        let venue = Arc::new(TestVenue::filling());
        let engine = engine_with(venue, test_config(5, dec!(0)));

        let mut events = engine.bus.subscribe();
        engine.on_venue_fill("ghost-order", dec!(0.88), dec!(10)).await;

        match events.try_recv().unwrap() {
            EngineEvent::Error { kind, .. } => assert_eq!(kind, "invariant-violation"),
            other => panic!("expected error event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_deadline_sweep_clears_tp_orders() {
        let venue = Arc::new(TestVenue::filling());
        venue.set_fill_price(dec!(0.33));
        let engine = engine_with(Arc::clone(&venue) as Arc<dyn VenueExecutor>, test_config(5, dec!(0)));

        engine.add_market(descriptor("m1", 840)).await.unwrap();
        set_prices(&engine, "m1", dec!(0.33), dec!(0.69)).await;
        engine.evaluate_market("m1".to_string()).await; // enter
        engine.evaluate_market("m1".to_string()).await; // TP placed
        assert!(!engine.store.snapshot("m1").await.unwrap().active_tp_orders.is_empty());

        // Shrink time_left into the unwind window and tick
        {
            let handle = engine.store.get("m1").await.unwrap();
            handle.lock().await.descriptor.end_time = Utc::now() + ChronoDuration::seconds(250);
        }
        engine.on_tick().await;

        assert!(engine.store.snapshot("m1").await.unwrap().active_tp_orders.is_empty());
    }

    #[tokio::test]
    async fn test_status_reflects_trading() {
        let venue = Arc::new(TestVenue::filling());
        venue.set_fill_price(dec!(0.33));
        let engine = engine_with(Arc::clone(&venue) as Arc<dyn VenueExecutor>, test_config(5, dec!(0)));

        engine.add_market(descriptor("m1", 840)).await.unwrap();
        let status = engine.get_status().await;
        assert!(status.running);
        assert_eq!(status.active_markets, 1);
        assert_eq!(status.completed_trades, 0);
    }
}
