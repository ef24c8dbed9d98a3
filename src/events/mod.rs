//! Engine event stream
//!
//! Fan-out of engine activity to observers (dashboards, loggers). Wire names
//! are stable: `trade_executed`, `signal_generated`, `market_update`,
//! `bot_status`, `error`. Producers never block; a subscriber that falls
//! behind its bounded queue loses the oldest events.

use crate::market::PositionSummary;
use crate::strategy::{Side, SignalAction};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::broadcast;

/// An observable engine event
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    TradeExecuted {
        market_id: String,
        action: String,
        side: Side,
        size: Decimal,
        price: Decimal,
        #[serde(skip_serializing_if = "Option::is_none")]
        pnl: Option<Decimal>,
        reason: String,
        ts: DateTime<Utc>,
    },
    SignalGenerated {
        market_id: String,
        action: SignalAction,
        side: Side,
        size: Decimal,
        price: Decimal,
        reason: String,
        dca_level: u32,
        ts: DateTime<Utc>,
    },
    MarketUpdate {
        market_id: String,
        yes_price: Option<Decimal>,
        no_price: Option<Decimal>,
        yes_bid: Option<Decimal>,
        no_bid: Option<Decimal>,
        time_left: i64,
        position_summary: Option<PositionSummary>,
        ts: DateTime<Utc>,
    },
    BotStatus {
        running: bool,
        active_markets: usize,
        total_pnl: Decimal,
        win_rate: Decimal,
        completed_trades: u64,
        ts: DateTime<Utc>,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        market_id: Option<String>,
        kind: String,
        detail: String,
        ts: DateTime<Utc>,
    },
}

/// Bounded broadcast bus for engine events
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    /// Create a bus whose subscribers each buffer up to `capacity` events
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Attach an observer. Slow observers skip over dropped events rather
    /// than backpressuring the engine.
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Publish an event; a bus with no observers is fine.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
