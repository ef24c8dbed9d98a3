//! Per-market runtime state
//!
//! Positions are the single source of truth: ladder sizes, average entries,
//! and high-scalp counts are always derived from the position list.
//! `completed_cycles` and `high_scalps_opened` are the only stored counters
//! because closed positions are destroyed.

use super::MarketDescriptor;
use crate::strategy::Side;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One filled entry (initial, DCA rung, or high scalp)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// Held side
    pub side: Side,
    /// Shares
    pub size: Decimal,
    /// Fill price
    pub entry_price: Decimal,
    /// Fill timestamp
    pub entry_time: DateTime<Utc>,
    /// True for opportunistic late entries outside the DCA ladder
    pub is_high_scalp: bool,
    /// 0 = initial entry, 1.. = averaging-down rungs
    pub dca_level: u32,
}

/// A resting take-profit limit order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TpOrder {
    /// Venue order id
    pub order_id: String,
    /// Client id the order was submitted under
    pub client_id: Uuid,
    /// Ladder side the order exits
    pub side: Side,
    /// Resting size
    pub size: Decimal,
}

/// Aggregate view of the held ladder, for observers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSummary {
    pub side: Side,
    pub size: Decimal,
    pub avg_entry_price: Decimal,
    pub unrealized_pnl: Option<Decimal>,
}

/// Mutable per-market state
#[derive(Debug, Clone)]
pub struct MarketContext {
    pub descriptor: MarketDescriptor,
    /// Latest best ask per side; `None` until the first quote
    pub yes_price: Option<Decimal>,
    pub no_price: Option<Decimal>,
    /// Latest best bid per side
    pub yes_bid: Option<Decimal>,
    pub no_bid: Option<Decimal>,
    /// Open positions, in fill order
    pub positions: Vec<Position>,
    /// Full LEVEL round-trips completed in this market
    pub completed_cycles: u32,
    /// High-scalp entries taken in this market (open or closed)
    pub high_scalps_opened: u32,
    /// Resting take-profit orders
    pub active_tp_orders: Vec<TpOrder>,
    /// Last time the evaluator produced a signal for this market
    pub last_signal_time: Option<DateTime<Utc>>,
}

impl MarketContext {
    pub fn new(descriptor: MarketDescriptor) -> Self {
        Self {
            descriptor,
            yes_price: None,
            no_price: None,
            yes_bid: None,
            no_bid: None,
            positions: Vec::new(),
            completed_cycles: 0,
            high_scalps_opened: 0,
            active_tp_orders: Vec::new(),
            last_signal_time: None,
        }
    }

    /// Seconds until resolution; negative after expiry
    pub fn time_left(&self, now: DateTime<Utc>) -> i64 {
        (self.descriptor.end_time - now).num_seconds()
    }

    /// Best ask for a side
    pub fn ask(&self, side: Side) -> Option<Decimal> {
        match side {
            Side::Yes => self.yes_price,
            Side::No => self.no_price,
        }
    }

    /// Best bid for a side
    pub fn bid(&self, side: Side) -> Option<Decimal> {
        match side {
            Side::Yes => self.yes_bid,
            Side::No => self.no_bid,
        }
    }

    /// Token id for a side
    pub fn token(&self, side: Side) -> &str {
        match side {
            Side::Yes => &self.descriptor.token_yes,
            Side::No => &self.descriptor.token_no,
        }
    }

    /// LEVEL (non-high-scalp) positions on one side
    pub fn level_positions(&self, side: Side) -> impl Iterator<Item = &Position> {
        self.positions
            .iter()
            .filter(move |p| !p.is_high_scalp && p.side == side)
    }

    pub fn has_level(&self, side: Side) -> bool {
        self.level_positions(side).next().is_some()
    }

    pub fn level_count(&self, side: Side) -> usize {
        self.level_positions(side).count()
    }

    /// Total LEVEL ladder size on one side
    pub fn level_size(&self, side: Side) -> Decimal {
        self.level_positions(side).map(|p| p.size).sum()
    }

    /// Size-weighted average entry of the LEVEL ladder
    pub fn level_avg_entry(&self, side: Side) -> Option<Decimal> {
        let total = self.level_size(side);
        if total.is_zero() {
            return None;
        }
        let weighted: Decimal = self
            .level_positions(side)
            .map(|p| p.size * p.entry_price)
            .sum();
        Some(weighted / total)
    }

    /// Entry price of the initial (dca_level 0) LEVEL position
    pub fn first_level_entry(&self, side: Side) -> Option<Decimal> {
        self.level_positions(side)
            .find(|p| p.dca_level == 0)
            .map(|p| p.entry_price)
    }

    /// Open high-scalp positions (any side)
    pub fn high_scalp_positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.iter().filter(|p| p.is_high_scalp)
    }

    /// Total open size on one side, LEVEL and high-scalp combined
    pub fn side_size(&self, side: Side) -> Decimal {
        self.positions
            .iter()
            .filter(|p| p.side == side)
            .map(|p| p.size)
            .sum()
    }

    /// Whether a TP order is resting for a side
    pub fn has_tp_for(&self, side: Side) -> bool {
        self.active_tp_orders.iter().any(|o| o.side == side)
    }

    /// Unrealized PnL of one position, priced as an unwind: buying the
    /// opposite side locks `1 - entry - opposite_ask` per share. `None`
    /// when the opposite ask is unknown.
    pub fn unrealized_pnl(&self, position: &Position) -> Option<Decimal> {
        let opposite_ask = self.ask(position.side.opposite())?;
        Some(position.size * (Decimal::ONE - position.entry_price - opposite_ask))
    }

    /// Aggregate ladder summary for the larger held side, for observers
    pub fn position_summary(&self) -> Option<PositionSummary> {
        let yes = self.side_size(Side::Yes);
        let no = self.side_size(Side::No);
        let side = if yes >= no && !yes.is_zero() {
            Side::Yes
        } else if !no.is_zero() {
            Side::No
        } else {
            return None;
        };

        let size = self.side_size(side);
        let weighted: Decimal = self
            .positions
            .iter()
            .filter(|p| p.side == side)
            .map(|p| p.size * p.entry_price)
            .sum();
        let avg_entry_price = weighted / size;
        let unrealized_pnl = self
            .ask(side.opposite())
            .map(|opp| size * (Decimal::ONE - avg_entry_price - opp));

        Some(PositionSummary {
            side,
            size,
            avg_entry_price,
            unrealized_pnl,
        })
    }
}
