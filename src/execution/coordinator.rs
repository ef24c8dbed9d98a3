//! Execution coordinator
//!
//! Turns evaluator signals into venue orders and reconciles fills back into
//! market contexts. All work for one market runs under that market's gate,
//! so a second signal cannot interleave with an in-flight venue call;
//! distinct markets proceed in parallel.

use super::{Order, OrderSide, OrderStatus, OrderType, VenueError, VenueExecutor};
use crate::events::{EngineEvent, EventBus};
use crate::market::{MarketStore, Position, TpOrder};
use crate::strategy::{Side, Signal, SignalAction};
use crate::telemetry::{record_counter, CounterMetric};
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Coordinator errors surfaced to the engine loop
#[derive(Debug, Error)]
pub enum ExecError {
    #[error(transparent)]
    Venue(#[from] VenueError),
    #[error("market {0} is no longer tracked")]
    MarketGone(String),
    #[error("fill for unknown order {order_id}")]
    UnknownOrder {
        order_id: String,
        /// Known when the order routed to a market whose context no longer
        /// tracks it
        market_id: Option<String>,
    },
}

/// What happened to a dispatched signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecOutcome {
    /// Order placed (and for IOC, filled) against the venue
    Executed,
    /// Dry-run mode: no venue call, no position change
    DryRun,
    /// The venue acknowledged but nothing filled
    NoFill,
}

/// Realized performance counters
#[derive(Debug, Clone, Default)]
pub struct TradeStats {
    pub realized_pnl: Decimal,
    pub completed_trades: u64,
    pub wins: u64,
}

impl TradeStats {
    pub fn win_rate(&self) -> Decimal {
        if self.completed_trades == 0 {
            return Decimal::ZERO;
        }
        Decimal::from(self.wins) / Decimal::from(self.completed_trades)
    }
}

/// Serialized per-market order execution
pub struct ExecutionCoordinator {
    venue: Arc<dyn VenueExecutor>,
    store: Arc<MarketStore>,
    bus: EventBus,
    dry_run: bool,
    /// Per-market serialization tokens; held across the whole
    /// cancel -> place -> ack sequence
    gates: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Venue-reported net position per (market, side)
    net_positions: StdMutex<HashMap<(String, Side), Decimal>>,
    /// Resting TP order id -> market id, for fill routing
    tp_index: StdMutex<HashMap<String, String>>,
    stats: StdMutex<TradeStats>,
}

impl ExecutionCoordinator {
    pub fn new(
        venue: Arc<dyn VenueExecutor>,
        store: Arc<MarketStore>,
        bus: EventBus,
        dry_run: bool,
    ) -> Self {
        Self {
            venue,
            store,
            bus,
            dry_run,
            gates: StdMutex::new(HashMap::new()),
            net_positions: StdMutex::new(HashMap::new()),
            tp_index: StdMutex::new(HashMap::new()),
            stats: StdMutex::new(TradeStats::default()),
        }
    }

    /// The serialization token for a market. Callers take this before
    /// evaluating and hold it through `execute`.
    pub fn gate(&self, market_id: &str) -> Arc<Mutex<()>> {
        let mut gates = self.gates.lock().expect("gate map");
        Arc::clone(gates.entry(market_id.to_string()).or_default())
    }

    /// Snapshot of realized performance
    pub fn stats(&self) -> TradeStats {
        self.stats.lock().expect("stats").clone()
    }

    /// Venue-reported net position for one (market, side)
    pub fn net_position(&self, market_id: &str, side: Side) -> Decimal {
        self.net_positions
            .lock()
            .expect("net positions")
            .get(&(market_id.to_string(), side))
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    /// Effect one signal. Must be called under the market's gate.
    pub async fn execute(&self, market_id: &str, signal: &Signal) -> Result<ExecOutcome, ExecError> {
        if self.dry_run {
            tracing::info!(market_id, ?signal.action, reason = %signal.reason, "dry-run: skipping venue call");
            return Ok(ExecOutcome::DryRun);
        }

        match signal.action {
            SignalAction::EnterYes | SignalAction::EnterNo => self.enter(market_id, signal).await,
            SignalAction::ExitMarket | SignalAction::ForceUnwind => {
                self.exit_at_market(market_id, signal).await
            }
            SignalAction::PlaceTpLimit => self.place_tp(market_id, signal).await,
        }
    }

    /// Marketable-IOC buy of the signal side's token
    async fn enter(&self, market_id: &str, signal: &Signal) -> Result<ExecOutcome, ExecError> {
        let handle = self
            .store
            .get(market_id)
            .await
            .ok_or_else(|| ExecError::MarketGone(market_id.to_string()))?;

        let token_id = {
            let ctx = handle.lock().await;
            ctx.token(signal.side).to_string()
        };

        let order = Order {
            client_id: Uuid::new_v4(),
            market_id: market_id.to_string(),
            token_id,
            side: OrderSide::Buy,
            size: signal.size,
            price: None,
            order_type: OrderType::Market,
        };

        let ack = self.place_order(&order).await?;
        match ack.status {
            OrderStatus::Matched => {
                let price = ack.fill_price.unwrap_or(signal.price);
                let size = ack.fill_size.unwrap_or(signal.size);

                {
                    let mut ctx = handle.lock().await;
                    ctx.positions.push(Position {
                        side: signal.side,
                        size,
                        entry_price: price,
                        entry_time: Utc::now(),
                        is_high_scalp: signal.is_high_scalp,
                        dca_level: signal.dca_level,
                    });
                    if signal.is_high_scalp {
                        ctx.high_scalps_opened += 1;
                    }
                }
                self.adjust_net(market_id, signal.side, size);

                tracing::info!(
                    market_id,
                    side = %signal.side,
                    %size,
                    %price,
                    dca_level = signal.dca_level,
                    high_scalp = signal.is_high_scalp,
                    "entry filled"
                );
                self.publish_trade(market_id, signal, size, price, None);
                Ok(ExecOutcome::Executed)
            }
            OrderStatus::Live => {
                tracing::warn!(market_id, order_id = %ack.order_id, "IOC entry rested unexpectedly");
                Ok(ExecOutcome::NoFill)
            }
            OrderStatus::Rejected => {
                Err(VenueError::Rejected(format!("entry rejected for {market_id}")).into())
            }
        }
    }

    /// Close the held side at market by buying the opposite token.
    ///
    /// Resting TP orders for the side are cancelled first so the exit cannot
    /// double-close through a racing limit fill.
    async fn exit_at_market(&self, market_id: &str, signal: &Signal) -> Result<ExecOutcome, ExecError> {
        let handle = self
            .store
            .get(market_id)
            .await
            .ok_or_else(|| ExecError::MarketGone(market_id.to_string()))?;

        let (opposite_token, resting_tps) = {
            let ctx = handle.lock().await;
            let tps: Vec<String> = ctx
                .active_tp_orders
                .iter()
                .filter(|o| o.side == signal.side)
                .map(|o| o.order_id.clone())
                .collect();
            (ctx.token(signal.side.opposite()).to_string(), tps)
        };

        for order_id in resting_tps {
            if self.cancel_with_retry(&order_id).await.is_err() {
                self.publish_error(
                    Some(market_id),
                    "reconciliation",
                    format!("failed to cancel TP order {order_id} before exit"),
                );
            }
            self.forget_tp(market_id, &order_id).await;
        }

        let order = Order {
            client_id: Uuid::new_v4(),
            market_id: market_id.to_string(),
            token_id: opposite_token,
            side: OrderSide::Buy,
            size: signal.size,
            price: None,
            order_type: OrderType::Market,
        };

        let ack = self.place_order(&order).await?;
        match ack.status {
            OrderStatus::Matched => {
                let price = ack.fill_price.unwrap_or(signal.price);

                let (removed_size, pnl) = {
                    let mut ctx = handle.lock().await;
                    let removed = drain_positions(&mut ctx.positions, signal);
                    let removed_size: Decimal = removed.iter().map(|p| p.size).sum();
                    // Unwind economics: each share pays out 1 after holding
                    // both sides, net of entry and the opposite fill
                    let pnl: Decimal = removed
                        .iter()
                        .map(|p| p.size * (Decimal::ONE - p.entry_price - price))
                        .sum();

                    let closed_level = removed.iter().any(|p| !p.is_high_scalp);
                    if closed_level && ctx.positions.iter().all(|p| p.is_high_scalp) {
                        ctx.completed_cycles += 1;
                    }
                    (removed_size, pnl)
                };

                self.adjust_net(market_id, signal.side, -removed_size);
                self.record_close(pnl);

                tracing::info!(
                    market_id,
                    side = %signal.side,
                    size = %removed_size,
                    %price,
                    %pnl,
                    reason = %signal.reason,
                    "position closed at market"
                );
                self.publish_trade(market_id, signal, removed_size, price, Some(pnl));
                Ok(ExecOutcome::Executed)
            }
            OrderStatus::Live => {
                tracing::warn!(market_id, order_id = %ack.order_id, "IOC exit rested unexpectedly");
                Ok(ExecOutcome::NoFill)
            }
            OrderStatus::Rejected => {
                Err(VenueError::Rejected(format!("exit rejected for {market_id}")).into())
            }
        }
    }

    /// Cancel-then-place for the resting take-profit limit
    async fn place_tp(&self, market_id: &str, signal: &Signal) -> Result<ExecOutcome, ExecError> {
        let handle = self
            .store
            .get(market_id)
            .await
            .ok_or_else(|| ExecError::MarketGone(market_id.to_string()))?;

        let (token_id, stale_tps) = {
            let ctx = handle.lock().await;
            let tps: Vec<String> = ctx
                .active_tp_orders
                .iter()
                .filter(|o| o.side == signal.side)
                .map(|o| o.order_id.clone())
                .collect();
            (ctx.token(signal.side).to_string(), tps)
        };

        for order_id in stale_tps {
            if self.cancel_with_retry(&order_id).await.is_err() {
                self.publish_error(
                    Some(market_id),
                    "reconciliation",
                    format!("failed to cancel stale TP order {order_id}"),
                );
            }
            self.forget_tp(market_id, &order_id).await;
        }

        let order = Order {
            client_id: Uuid::new_v4(),
            market_id: market_id.to_string(),
            token_id,
            side: OrderSide::Sell,
            size: signal.size,
            price: Some(signal.price),
            order_type: OrderType::LimitPostOnly,
        };

        let ack = self.place_order(&order).await?;
        match ack.status {
            OrderStatus::Live | OrderStatus::Matched => {
                {
                    let mut ctx = handle.lock().await;
                    ctx.active_tp_orders.push(TpOrder {
                        order_id: ack.order_id.clone(),
                        client_id: order.client_id,
                        side: signal.side,
                        size: signal.size,
                    });
                }
                self.tp_index
                    .lock()
                    .expect("tp index")
                    .insert(ack.order_id.clone(), market_id.to_string());

                tracing::info!(
                    market_id,
                    order_id = %ack.order_id,
                    client_id = %order.client_id,
                    side = %signal.side,
                    price = %signal.price,
                    "take-profit limit resting"
                );

                // A post-only limit should never cross, but if the venue
                // reports an immediate match, reconcile it like a fill.
                if ack.status == OrderStatus::Matched {
                    let price = ack.fill_price.unwrap_or(signal.price);
                    let size = ack.fill_size.unwrap_or(signal.size);
                    self.on_fill(&ack.order_id, price, size).await?;
                }
                Ok(ExecOutcome::Executed)
            }
            OrderStatus::Rejected => {
                Err(VenueError::Rejected(format!("TP limit rejected for {market_id}")).into())
            }
        }
    }

    /// Venue fill callback for resting orders.
    ///
    /// A fill for an order we are not tracking is an invariant violation;
    /// the engine quarantines the market.
    pub async fn on_fill(
        &self,
        order_id: &str,
        price: Decimal,
        size: Decimal,
    ) -> Result<(), ExecError> {
        let market_id = {
            let index = self.tp_index.lock().expect("tp index");
            index.get(order_id).cloned().ok_or_else(|| ExecError::UnknownOrder {
                order_id: order_id.to_string(),
                market_id: None,
            })?
        };

        let handle = self
            .store
            .get(&market_id)
            .await
            .ok_or_else(|| ExecError::MarketGone(market_id.clone()))?;

        let (side, closed_size, pnl) = {
            let mut ctx = handle.lock().await;
            let tp_pos = ctx
                .active_tp_orders
                .iter()
                .position(|o| o.order_id == order_id)
                .ok_or_else(|| ExecError::UnknownOrder {
                    order_id: order_id.to_string(),
                    market_id: Some(market_id.clone()),
                })?;

            let side = ctx.active_tp_orders[tp_pos].side;

            // Reduce the LEVEL ladder FIFO by the filled size; a TP fill is
            // a sale of the held token at the limit price.
            let mut remaining = size;
            let mut closed_size = Decimal::ZERO;
            let mut pnl = Decimal::ZERO;
            for p in ctx
                .positions
                .iter_mut()
                .filter(|p| !p.is_high_scalp && p.side == side)
            {
                if remaining.is_zero() {
                    break;
                }
                let take = p.size.min(remaining);
                pnl += take * (price - p.entry_price);
                p.size -= take;
                remaining -= take;
                closed_size += take;
            }
            ctx.positions.retain(|p| !p.size.is_zero());

            if ctx.active_tp_orders[tp_pos].size <= size {
                ctx.active_tp_orders.remove(tp_pos);
            } else {
                ctx.active_tp_orders[tp_pos].size -= size;
            }

            let ladder_empty = ctx.positions.iter().all(|p| p.is_high_scalp);
            if !closed_size.is_zero() && ladder_empty {
                ctx.completed_cycles += 1;
            }
            (side, closed_size, pnl)
        };

        // Keep the routing entry for partially filled orders; drop it once
        // the order is no longer resting.
        {
            let ctx = handle.lock().await;
            if !ctx.active_tp_orders.iter().any(|o| o.order_id == order_id) {
                self.tp_index.lock().expect("tp index").remove(order_id);
            }
        }

        self.adjust_net(&market_id, side, -closed_size);
        self.record_close(pnl);

        tracing::info!(
            market_id,
            order_id,
            side = %side,
            size = %closed_size,
            %price,
            %pnl,
            "take-profit filled"
        );
        self.bus.publish(EngineEvent::TradeExecuted {
            market_id,
            action: "tp_fill".into(),
            side,
            size: closed_size,
            price,
            pnl: Some(pnl),
            reason: format!("tp@{price}"),
            ts: Utc::now(),
        });
        Ok(())
    }

    /// Venue cancel callback; also used after our own cancels succeed
    pub async fn on_cancel(&self, order_id: &str) {
        let market_id = {
            let index = self.tp_index.lock().expect("tp index");
            index.get(order_id).cloned()
        };
        if let Some(market_id) = market_id {
            self.forget_tp(&market_id, order_id).await;
        }
    }

    /// Deadline sweep: cancel every resting TP order for a market
    pub async fn cancel_all_tp_orders(&self, market_id: &str) -> usize {
        let Some(handle) = self.store.get(market_id).await else {
            return 0;
        };

        let order_ids: Vec<String> = {
            let ctx = handle.lock().await;
            ctx.active_tp_orders.iter().map(|o| o.order_id.clone()).collect()
        };

        let mut cancelled = 0;
        for order_id in order_ids {
            match self.cancel_with_retry(&order_id).await {
                Ok(()) => {
                    self.forget_tp(market_id, &order_id).await;
                    cancelled += 1;
                }
                Err(e) => {
                    tracing::error!(market_id, order_id, error = %e, "TP cancel failed after retries");
                    self.publish_error(
                        Some(market_id),
                        "reconciliation",
                        format!("failed to cancel TP order {order_id}: {e}"),
                    );
                }
            }
        }
        cancelled
    }

    /// Up to 3 attempts with a 100ms pause between them
    async fn cancel_with_retry(&self, order_id: &str) -> Result<(), VenueError> {
        let mut last_err = VenueError::Transient("no attempt".into());
        for attempt in 0..3 {
            if attempt > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
            match self.venue.cancel_order(order_id).await {
                Ok(()) => {
                    record_counter(CounterMetric::OrdersCancelled, 1);
                    return Ok(());
                }
                Err(e) => {
                    tracing::warn!(order_id, attempt, error = %e, "cancel attempt failed");
                    last_err = e;
                }
            }
        }
        record_counter(CounterMetric::VenueErrors, 1);
        Err(last_err)
    }

    async fn place_order(&self, order: &Order) -> Result<super::OrderAck, VenueError> {
        match self.venue.place_order(order).await {
            Ok(ack) => {
                record_counter(CounterMetric::OrdersPlaced, 1);
                tracing::debug!(
                    client_id = %order.client_id,
                    order_id = %ack.order_id,
                    "order acknowledged"
                );
                Ok(ack)
            }
            Err(e) => {
                record_counter(CounterMetric::VenueErrors, 1);
                tracing::warn!(client_id = %order.client_id, error = %e, "order failed");
                Err(e)
            }
        }
    }

    async fn forget_tp(&self, market_id: &str, order_id: &str) {
        self.tp_index.lock().expect("tp index").remove(order_id);
        if let Some(handle) = self.store.get(market_id).await {
            let mut ctx = handle.lock().await;
            ctx.active_tp_orders.retain(|o| o.order_id != order_id);
        }
    }

    fn adjust_net(&self, market_id: &str, side: Side, delta: Decimal) {
        let mut net = self.net_positions.lock().expect("net positions");
        let entry = net.entry((market_id.to_string(), side)).or_default();
        *entry += delta;
        if entry.is_zero() {
            net.remove(&(market_id.to_string(), side));
        }
    }

    fn record_close(&self, pnl: Decimal) {
        let mut stats = self.stats.lock().expect("stats");
        stats.realized_pnl += pnl;
        stats.completed_trades += 1;
        if pnl > Decimal::ZERO {
            stats.wins += 1;
        }
    }

    fn publish_trade(
        &self,
        market_id: &str,
        signal: &Signal,
        size: Decimal,
        price: Decimal,
        pnl: Option<Decimal>,
    ) {
        let action = match signal.action {
            SignalAction::EnterYes => "enter_yes",
            SignalAction::EnterNo => "enter_no",
            SignalAction::ExitMarket => "exit_market",
            SignalAction::ForceUnwind => "force_unwind",
            SignalAction::PlaceTpLimit => "place_tp_limit",
        };
        self.bus.publish(EngineEvent::TradeExecuted {
            market_id: market_id.to_string(),
            action: action.into(),
            side: signal.side,
            size,
            price,
            pnl,
            reason: signal.reason.clone(),
            ts: Utc::now(),
        });
    }

    fn publish_error(&self, market_id: Option<&str>, kind: &str, detail: String) {
        self.bus.publish(EngineEvent::Error {
            market_id: market_id.map(str::to_string),
            kind: kind.to_string(),
            detail,
            ts: Utc::now(),
        });
    }
}

/// Remove the positions a market exit closes: the LEVEL ladder for a force
/// unwind, high-scalp positions for a high-scalp exit, the whole side
/// otherwise.
fn drain_positions(positions: &mut Vec<Position>, signal: &Signal) -> Vec<Position> {
    let closes = |p: &Position| {
        if p.side != signal.side {
            return false;
        }
        match signal.action {
            SignalAction::ForceUnwind => !p.is_high_scalp,
            SignalAction::ExitMarket if signal.is_high_scalp => p.is_high_scalp,
            _ => true,
        }
    };

    let mut removed = Vec::new();
    positions.retain(|p| {
        if closes(p) {
            removed.push(p.clone());
            false
        } else {
            true
        }
    });
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::OrderAck;
    use crate::market::MarketDescriptor;
    use async_trait::async_trait;
    use chrono::Duration;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    /// Scripted venue: market orders fill at a settable price, limits rest,
    /// cancels optionally fail a configured number of times.
    struct MockVenue {
        fill_price: StdMutex<Decimal>,
        placed: StdMutex<Vec<Order>>,
        cancelled: StdMutex<Vec<String>>,
        cancel_failures: AtomicUsize,
        next_id: AtomicU64,
    }

    impl MockVenue {
        fn new() -> Self {
            Self {
                fill_price: StdMutex::new(dec!(0.50)),
                placed: StdMutex::new(Vec::new()),
                cancelled: StdMutex::new(Vec::new()),
                cancel_failures: AtomicUsize::new(0),
                next_id: AtomicU64::new(1),
            }
        }

        fn set_fill_price(&self, price: Decimal) {
            *self.fill_price.lock().unwrap() = price;
        }

        fn fail_next_cancels(&self, n: usize) {
            self.cancel_failures.store(n, Ordering::SeqCst);
        }

        fn placed_count(&self) -> usize {
            self.placed.lock().unwrap().len()
        }

        fn cancelled_ids(&self) -> Vec<String> {
            self.cancelled.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl VenueExecutor for MockVenue {
        async fn place_order(&self, order: &Order) -> Result<OrderAck, VenueError> {
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

        async fn cancel_order(&self, order_id: &str) -> Result<(), VenueError> {
            if self.cancel_failures.load(Ordering::SeqCst) > 0 {
                self.cancel_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(VenueError::Transient("cancel glitch".into()));
            }
            self.cancelled.lock().unwrap().push(order_id.to_string());
            Ok(())
        }
    }

    fn descriptor() -> MarketDescriptor {
        MarketDescriptor {
            market_id: "mkt-1".into(),
            question: "q".into(),
            token_yes: "tok-yes".into(),
            token_no: "tok-no".into(),
            end_time: Utc::now() + Duration::minutes(15),
            min_tick: dec!(0.01),
        }
    }

    async fn setup(dry_run: bool) -> (Arc<MockVenue>, Arc<MarketStore>, ExecutionCoordinator) {
        let venue = Arc::new(MockVenue::new());
        let store = Arc::new(MarketStore::new());
        store.add(descriptor()).await;
        let coordinator = ExecutionCoordinator::new(
            Arc::clone(&venue) as Arc<dyn VenueExecutor>,
            Arc::clone(&store),
            EventBus::new(64),
            dry_run,
        );
        (venue, store, coordinator)
    }

    fn entry_signal(side: Side, price: Decimal, dca_level: u32) -> Signal {
        Signal {
            action: match side {
                Side::Yes => SignalAction::EnterYes,
                Side::No => SignalAction::EnterNo,
            },
            side,
            size: dec!(10),
            price,
            reason: format!("entry@{price}"),
            dca_level,
            is_high_scalp: false,
        }
    }

    fn tp_signal(side: Side, size: Decimal) -> Signal {
        Signal {
            action: SignalAction::PlaceTpLimit,
            side,
            size,
            price: dec!(0.88),
            reason: "tp@0.88".into(),
            dca_level: 0,
            is_high_scalp: false,
        }
    }

    #[tokio::test]
    async fn test_entry_fill_appends_position() {
        let (venue, store, coordinator) = setup(false).await;
        venue.set_fill_price(dec!(0.33));

        let outcome = coordinator
            .execute("mkt-1", &entry_signal(Side::Yes, dec!(0.33), 0))
            .await
            .unwrap();
        assert_eq!(outcome, ExecOutcome::Executed);

        let ctx = store.snapshot("mkt-1").await.unwrap();
        assert_eq!(ctx.positions.len(), 1);
        assert_eq!(ctx.positions[0].entry_price, dec!(0.33));
        assert_eq!(ctx.positions[0].dca_level, 0);

        // Net position matches the context sum
        assert_eq!(coordinator.net_position("mkt-1", Side::Yes), dec!(10));
        assert_eq!(ctx.side_size(Side::Yes), dec!(10));
    }

    #[tokio::test]
    async fn test_dry_run_skips_venue_and_positions() {
        let (venue, store, coordinator) = setup(true).await;

        let outcome = coordinator
            .execute("mkt-1", &entry_signal(Side::Yes, dec!(0.33), 0))
            .await
            .unwrap();
        assert_eq!(outcome, ExecOutcome::DryRun);
        assert_eq!(venue.placed_count(), 0);
        assert!(store.snapshot("mkt-1").await.unwrap().positions.is_empty());
    }

    #[tokio::test]
    async fn test_tp_place_records_order_id() {
        let (_venue, store, coordinator) = setup(false).await;
        coordinator
            .execute("mkt-1", &entry_signal(Side::Yes, dec!(0.33), 0))
            .await
            .unwrap();

        coordinator
            .execute("mkt-1", &tp_signal(Side::Yes, dec!(10)))
            .await
            .unwrap();

        let ctx = store.snapshot("mkt-1").await.unwrap();
        assert_eq!(ctx.active_tp_orders.len(), 1);
        assert_eq!(ctx.active_tp_orders[0].side, Side::Yes);
    }

    #[tokio::test]
    async fn test_tp_replace_cancels_stale_order() {
        let (venue, store, coordinator) = setup(false).await;
        coordinator
            .execute("mkt-1", &entry_signal(Side::Yes, dec!(0.33), 0))
            .await
            .unwrap();
        coordinator
            .execute("mkt-1", &tp_signal(Side::Yes, dec!(10)))
            .await
            .unwrap();

        // A second placement (e.g. after a DCA grew the ladder) replaces
        coordinator
            .execute("mkt-1", &tp_signal(Side::Yes, dec!(20)))
            .await
            .unwrap();

        let ctx = store.snapshot("mkt-1").await.unwrap();
        assert_eq!(ctx.active_tp_orders.len(), 1);
        assert_eq!(ctx.active_tp_orders[0].size, dec!(20));
        assert_eq!(venue.cancelled_ids().len(), 1);
    }

    #[tokio::test]
    async fn test_tp_fill_closes_ladder_and_counts_cycle() {
        let (venue, store, coordinator) = setup(false).await;
        venue.set_fill_price(dec!(0.33));
        coordinator
            .execute("mkt-1", &entry_signal(Side::Yes, dec!(0.33), 0))
            .await
            .unwrap();
        coordinator
            .execute("mkt-1", &tp_signal(Side::Yes, dec!(10)))
            .await
            .unwrap();

        let order_id = store.snapshot("mkt-1").await.unwrap().active_tp_orders[0]
            .order_id
            .clone();

        coordinator.on_fill(&order_id, dec!(0.88), dec!(10)).await.unwrap();

        let ctx = store.snapshot("mkt-1").await.unwrap();
        assert!(ctx.positions.is_empty());
        assert!(ctx.active_tp_orders.is_empty());
        assert_eq!(ctx.completed_cycles, 1);

        // 10 * (0.88 - 0.33)
        let stats = coordinator.stats();
        assert_eq!(stats.realized_pnl, dec!(5.50));
        assert_eq!(stats.completed_trades, 1);
        assert_eq!(stats.wins, 1);
        assert_eq!(coordinator.net_position("mkt-1", Side::Yes), dec!(0));
    }

    #[tokio::test]
    async fn test_partial_tp_fill_keeps_remainder() {
        let (venue, store, coordinator) = setup(false).await;
        venue.set_fill_price(dec!(0.33));
        coordinator
            .execute("mkt-1", &entry_signal(Side::Yes, dec!(0.33), 0))
            .await
            .unwrap();
        coordinator
            .execute("mkt-1", &tp_signal(Side::Yes, dec!(10)))
            .await
            .unwrap();

        let order_id = store.snapshot("mkt-1").await.unwrap().active_tp_orders[0]
            .order_id
            .clone();

        coordinator.on_fill(&order_id, dec!(0.88), dec!(4)).await.unwrap();

        let ctx = store.snapshot("mkt-1").await.unwrap();
        assert_eq!(ctx.level_size(Side::Yes), dec!(6));
        assert_eq!(ctx.active_tp_orders[0].size, dec!(6));
        // Ladder not empty: no cycle yet
        assert_eq!(ctx.completed_cycles, 0);
        assert_eq!(coordinator.net_position("mkt-1", Side::Yes), dec!(6));

        // Remainder fills
        coordinator.on_fill(&order_id, dec!(0.88), dec!(6)).await.unwrap();
        let ctx = store.snapshot("mkt-1").await.unwrap();
        assert!(ctx.positions.is_empty());
        assert_eq!(ctx.completed_cycles, 1);
    }

    #[tokio::test]
    async fn test_market_exit_cancels_tp_and_counts_cycle() {
        let (venue, store, coordinator) = setup(false).await;
        venue.set_fill_price(dec!(0.34));
        coordinator
            .execute("mkt-1", &entry_signal(Side::Yes, dec!(0.34), 0))
            .await
            .unwrap();
        venue.set_fill_price(dec!(0.10));
        coordinator
            .execute("mkt-1", &entry_signal(Side::Yes, dec!(0.10), 1))
            .await
            .unwrap();
        coordinator
            .execute("mkt-1", &tp_signal(Side::Yes, dec!(20)))
            .await
            .unwrap();

        // Unwind: buy NO at 0.58
        venue.set_fill_price(dec!(0.58));
        let exit = Signal {
            action: SignalAction::ExitMarket,
            side: Side::Yes,
            size: dec!(20),
            price: dec!(0.58),
            reason: "unwind".into(),
            dca_level: 0,
            is_high_scalp: false,
        };
        coordinator.execute("mkt-1", &exit).await.unwrap();

        let ctx = store.snapshot("mkt-1").await.unwrap();
        assert!(ctx.positions.is_empty());
        assert!(ctx.active_tp_orders.is_empty());
        assert_eq!(ctx.completed_cycles, 1);
        assert_eq!(venue.cancelled_ids().len(), 1);

        // PnL: 10*(1-0.34-0.58) + 10*(1-0.10-0.58) = 0.8 + 3.2
        assert_eq!(coordinator.stats().realized_pnl, dec!(4.00));
        assert_eq!(coordinator.net_position("mkt-1", Side::Yes), dec!(0));
    }

    #[tokio::test]
    async fn test_force_unwind_leaves_high_scalps() {
        let (venue, store, coordinator) = setup(false).await;
        venue.set_fill_price(dec!(0.34));
        coordinator
            .execute("mkt-1", &entry_signal(Side::Yes, dec!(0.34), 0))
            .await
            .unwrap();

        venue.set_fill_price(dec!(0.89));
        let mut scalp = entry_signal(Side::No, dec!(0.89), 0);
        scalp.is_high_scalp = true;
        coordinator.execute("mkt-1", &scalp).await.unwrap();

        venue.set_fill_price(dec!(0.70));
        let unwind = Signal {
            action: SignalAction::ForceUnwind,
            side: Side::Yes,
            size: dec!(10),
            price: dec!(0.70),
            reason: "force-unwind-5min".into(),
            dca_level: 0,
            is_high_scalp: false,
        };
        coordinator.execute("mkt-1", &unwind).await.unwrap();

        let ctx = store.snapshot("mkt-1").await.unwrap();
        assert_eq!(ctx.positions.len(), 1);
        assert!(ctx.positions[0].is_high_scalp);
        assert_eq!(ctx.completed_cycles, 1);
        assert_eq!(ctx.high_scalps_opened, 1);
    }

    #[tokio::test]
    async fn test_high_scalp_exit_does_not_count_cycle() {
        let (venue, store, coordinator) = setup(false).await;
        venue.set_fill_price(dec!(0.89));
        let mut scalp = entry_signal(Side::Yes, dec!(0.89), 0);
        scalp.is_high_scalp = true;
        coordinator.execute("mkt-1", &scalp).await.unwrap();

        venue.set_fill_price(dec!(0.08));
        let exit = Signal {
            action: SignalAction::ExitMarket,
            side: Side::Yes,
            size: dec!(10),
            price: dec!(0.08),
            reason: "high-scalp-tp".into(),
            dca_level: 0,
            is_high_scalp: true,
        };
        coordinator.execute("mkt-1", &exit).await.unwrap();

        let ctx = store.snapshot("mkt-1").await.unwrap();
        assert!(ctx.positions.is_empty());
        assert_eq!(ctx.completed_cycles, 0);
        // 10 * (1 - 0.89 - 0.08)
        assert_eq!(coordinator.stats().realized_pnl, dec!(0.30));
    }

    #[tokio::test]
    async fn test_fill_for_unknown_order_is_invariant_violation() {
        let (_venue, _store, coordinator) = setup(false).await;
        let err = coordinator
            .on_fill("ghost-order", dec!(0.88), dec!(10))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::UnknownOrder { .. }));
    }

    #[tokio::test]
    async fn test_place_then_cancel_round_trip() {
        let (_venue, store, coordinator) = setup(false).await;
        coordinator
            .execute("mkt-1", &entry_signal(Side::Yes, dec!(0.33), 0))
            .await
            .unwrap();

        let before = store.snapshot("mkt-1").await.unwrap().active_tp_orders.clone();
        assert!(before.is_empty());

        coordinator
            .execute("mkt-1", &tp_signal(Side::Yes, dec!(10)))
            .await
            .unwrap();
        let resting = store.snapshot("mkt-1").await.unwrap().active_tp_orders[0]
            .order_id
            .clone();
        coordinator.on_cancel(&resting).await;

        let after = store.snapshot("mkt-1").await.unwrap().active_tp_orders;
        assert!(after.is_empty());
    }

    #[tokio::test]
    async fn test_deadline_sweep_cancels_all() {
        let (venue, store, coordinator) = setup(false).await;
        coordinator
            .execute("mkt-1", &entry_signal(Side::Yes, dec!(0.33), 0))
            .await
            .unwrap();
        coordinator
            .execute("mkt-1", &tp_signal(Side::Yes, dec!(10)))
            .await
            .unwrap();

        let cancelled = coordinator.cancel_all_tp_orders("mkt-1").await;
        assert_eq!(cancelled, 1);
        assert_eq!(venue.cancelled_ids().len(), 1);
        assert!(store
            .snapshot("mkt-1")
            .await
            .unwrap()
            .active_tp_orders
            .is_empty());
    }

    #[tokio::test]
    async fn test_cancel_retries_through_transient_failures() {
        let (venue, _store, coordinator) = setup(false).await;
        coordinator
            .execute("mkt-1", &entry_signal(Side::Yes, dec!(0.33), 0))
            .await
            .unwrap();
        coordinator
            .execute("mkt-1", &tp_signal(Side::Yes, dec!(10)))
            .await
            .unwrap();

        // Two failures, third attempt succeeds
        venue.fail_next_cancels(2);
        let cancelled = coordinator.cancel_all_tp_orders("mkt-1").await;
        assert_eq!(cancelled, 1);
    }

    #[tokio::test]
    async fn test_cancel_gives_up_after_three_attempts() {
        let (venue, store, coordinator) = setup(false).await;
        coordinator
            .execute("mkt-1", &entry_signal(Side::Yes, dec!(0.33), 0))
            .await
            .unwrap();
        coordinator
            .execute("mkt-1", &tp_signal(Side::Yes, dec!(10)))
            .await
            .unwrap();

        venue.fail_next_cancels(3);
        let cancelled = coordinator.cancel_all_tp_orders("mkt-1").await;
        assert_eq!(cancelled, 0);
        // Order stays tracked for manual reconciliation
        assert_eq!(
            store.snapshot("mkt-1").await.unwrap().active_tp_orders.len(),
            1
        );
    }

    #[tokio::test]
    async fn test_unknown_market_errors() {
        let (_venue, _store, coordinator) = setup(false).await;
        let err = coordinator
            .execute("mkt-ghost", &entry_signal(Side::Yes, dec!(0.33), 0))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::MarketGone(_)));
    }
}
