//! Scalping rule evaluation
//!
//! A pure, priority-ordered rule list over a market snapshot. Determinism is
//! the point: no I/O, no clock reads beyond the caller-supplied `now`, no
//! randomness, so identical snapshots always produce identical signals.

use super::{Side, Signal, SignalAction};
use crate::config::StrategyParams;
use crate::market::MarketContext;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

const SIDES: [Side; 2] = [Side::Yes, Side::No];

/// Evaluates one market snapshot against the multi-level DCA rules
pub struct Evaluator {
    params: StrategyParams,
}

impl Evaluator {
    pub fn new(params: StrategyParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &StrategyParams {
        &self.params
    }

    /// Produce the highest-priority applicable signal, or `None`.
    ///
    /// Rule order (first match wins): force exit, force unwind, take-profit
    /// placement, unwind trigger, high-scalp take-profit, DCA-2, DCA-1,
    /// initial LEVEL entry, high-scalp entry.
    pub fn evaluate(&self, ctx: &MarketContext, now: DateTime<Utc>) -> Option<Signal> {
        let time_left = ctx.time_left(now);

        if let Some(signal) = self.force_exit(ctx, time_left) {
            return Some(signal);
        }
        if let Some(signal) = self.force_unwind(ctx, time_left) {
            return Some(signal);
        }
        if let Some(signal) = self.tp_placement(ctx, time_left) {
            return Some(signal);
        }
        if let Some(signal) = self.unwind_trigger(ctx) {
            return Some(signal);
        }
        if let Some(signal) = self.high_scalp_exit(ctx) {
            return Some(signal);
        }

        // Both ladders populated only happens mid-unwind; hold off on any
        // further entries until the inconsistency clears.
        if ctx.has_level(Side::Yes) && ctx.has_level(Side::No) {
            return None;
        }

        if let Some(signal) = self.dca(ctx) {
            return Some(signal);
        }
        if let Some(signal) = self.level_entry(ctx, time_left) {
            return Some(signal);
        }
        self.high_scalp_entry(ctx, time_left)
    }

    /// Rule 1: inside the force-exit window, close everything that is losing;
    /// in the final minute close unconditionally. One side per call; the
    /// next evaluation picks up whatever remains.
    fn force_exit(&self, ctx: &MarketContext, time_left: i64) -> Option<Signal> {
        if time_left > self.params.force_exit_time_left {
            return None;
        }

        let losing = ctx
            .positions
            .iter()
            .any(|p| ctx.unrealized_pnl(p).is_some_and(|pnl| pnl < Decimal::ZERO));
        if !losing && time_left > 60 {
            return None;
        }

        let side = ctx.positions.first()?.side;
        Some(Signal {
            action: SignalAction::ExitMarket,
            side,
            size: ctx.side_size(side),
            price: ctx.ask(side.opposite()).unwrap_or(Decimal::ZERO),
            reason: format!("force-exit-{}min", self.params.force_exit_time_left / 60),
            dca_level: 0,
            is_high_scalp: false,
        })
    }

    /// Rule 2: at the unwind deadline, close the LEVEL ladder at market.
    /// High-scalp positions are left to their own exit rules.
    fn force_unwind(&self, ctx: &MarketContext, time_left: i64) -> Option<Signal> {
        if time_left > self.params.force_unwind_time_left {
            return None;
        }

        let yes = ctx.level_size(Side::Yes);
        let no = ctx.level_size(Side::No);
        let side = if !yes.is_zero() && yes >= no {
            Side::Yes
        } else if !no.is_zero() {
            Side::No
        } else {
            return None;
        };

        Some(Signal {
            action: SignalAction::ForceUnwind,
            side,
            size: ctx.level_size(side),
            price: ctx.ask(side.opposite()).unwrap_or(Decimal::ZERO),
            reason: format!("force-unwind-{}min", self.params.force_unwind_time_left / 60),
            dca_level: 0,
            is_high_scalp: false,
        })
    }

    /// Rule 3: rest a take-profit limit for a cheap-entry LEVEL ladder that
    /// has none yet. Never inside the unwind window (invariant: no resting
    /// TP orders in the final five minutes).
    fn tp_placement(&self, ctx: &MarketContext, time_left: i64) -> Option<Signal> {
        if time_left <= self.params.force_unwind_time_left {
            return None;
        }

        for side in SIDES {
            if !ctx.has_level(side) || ctx.has_tp_for(side) {
                continue;
            }
            let avg = ctx.level_avg_entry(side)?;
            if avg > Decimal::new(50, 2) {
                continue;
            }
            return Some(Signal {
                action: SignalAction::PlaceTpLimit,
                side,
                size: ctx.level_size(side),
                price: self.params.tp_price,
                reason: format!("tp@{}", self.params.tp_price),
                dca_level: 0,
                is_high_scalp: false,
            });
        }
        None
    }

    /// Rule 4: the opposite ask dropping below the trigger means the held
    /// side can be closed by buying the opposite cheaply; lock it in.
    fn unwind_trigger(&self, ctx: &MarketContext) -> Option<Signal> {
        for side in SIDES {
            if !ctx.has_level(side) {
                continue;
            }
            let opposite_ask = match ctx.ask(side.opposite()) {
                Some(ask) => ask,
                None => continue,
            };
            if opposite_ask < self.params.unwind_trigger {
                return Some(Signal {
                    action: SignalAction::ExitMarket,
                    side,
                    size: ctx.side_size(side),
                    price: opposite_ask,
                    reason: "unwind".into(),
                    dca_level: 0,
                    is_high_scalp: false,
                });
            }
        }
        None
    }

    /// High-scalp take-profit: exit at market once buying the opposite side
    /// locks the configured profit fraction over the entry cost.
    fn high_scalp_exit(&self, ctx: &MarketContext) -> Option<Signal> {
        for side in SIDES {
            let mut size = Decimal::ZERO;
            let mut weighted = Decimal::ZERO;
            for p in ctx.high_scalp_positions().filter(|p| p.side == side) {
                size += p.size;
                weighted += p.size * p.entry_price;
            }
            if size.is_zero() {
                continue;
            }
            let avg = weighted / size;
            let target_exit =
                Decimal::ONE - (Decimal::ONE + self.params.high_scalp_profit_target) * avg;
            let opposite_ask = match ctx.ask(side.opposite()) {
                Some(ask) => ask,
                None => continue,
            };
            if opposite_ask <= target_exit {
                return Some(Signal {
                    action: SignalAction::ExitMarket,
                    side,
                    size,
                    price: opposite_ask,
                    reason: "high-scalp-tp".into(),
                    dca_level: 0,
                    is_high_scalp: true,
                });
            }
        }
        None
    }

    /// Rules 5 and 6: averaging-down rungs, keyed off the drop from the
    /// initial entry. Rung count determines which drop threshold applies,
    /// so the same rung can never be entered twice in one cycle.
    fn dca(&self, ctx: &MarketContext) -> Option<Signal> {
        for side in SIDES {
            let rungs = ctx.level_count(side);
            if rungs == 0 || rungs > 2 {
                continue;
            }
            let ask = match ctx.ask(side) {
                Some(ask) => ask,
                None => continue,
            };
            let first_entry = ctx.first_level_entry(side)?;

            let (required_drop, dca_level, reason) = if rungs == 2 {
                (self.params.dca_drop_2, 2, "dca-2")
            } else {
                (self.params.dca_drop_1, 1, "dca-1")
            };

            if ask <= first_entry - required_drop {
                return Some(Signal {
                    action: enter_action(side),
                    side,
                    size: self.params.clip_size,
                    price: ask,
                    reason: reason.into(),
                    dca_level,
                    is_high_scalp: false,
                });
            }
        }
        None
    }

    /// Rule 7: initial LEVEL entry on the cheaper side, budget and deadline
    /// permitting. Equal prices tie-break to YES.
    fn level_entry(&self, ctx: &MarketContext, time_left: i64) -> Option<Signal> {
        if ctx.has_level(Side::Yes) || ctx.has_level(Side::No) {
            return None;
        }
        if ctx.completed_cycles >= self.params.max_completed_cycles {
            return None;
        }
        if time_left < self.params.min_entry_time_left {
            return None;
        }

        let yes_ask = ctx.ask(Side::Yes).filter(|a| *a <= self.params.entry_trigger);
        let no_ask = ctx.ask(Side::No).filter(|a| *a <= self.params.entry_trigger);

        let (side, ask) = match (yes_ask, no_ask) {
            (Some(y), Some(n)) if n < y => (Side::No, n),
            (Some(y), _) => (Side::Yes, y),
            (None, Some(n)) => (Side::No, n),
            (None, None) => return None,
        };

        Some(Signal {
            action: enter_action(side),
            side,
            size: self.params.clip_size,
            price: ask,
            reason: format!("entry@{}", ask),
            dca_level: 0,
            is_high_scalp: false,
        })
    }

    /// Rule 8: late in market life the LEVEL budget is closed, but a side
    /// trading rich (yet under the threshold) is worth a capped scalp.
    /// Never inside the unconditional-exit minute, where rule 1 would close
    /// the position straight back out.
    fn high_scalp_entry(&self, ctx: &MarketContext, time_left: i64) -> Option<Signal> {
        if time_left <= 60 || time_left >= self.params.min_entry_time_left {
            return None;
        }
        if ctx.high_scalps_opened >= self.params.max_high_scalps {
            return None;
        }
        // One scalp at a time
        if ctx.high_scalp_positions().next().is_some() {
            return None;
        }

        for side in SIDES {
            if ctx.has_level(side) {
                continue;
            }
            let ask = match ctx.ask(side) {
                Some(ask) => ask,
                None => continue,
            };
            if ask > self.params.entry_trigger && ask <= self.params.high_scalp_entry {
                return Some(Signal {
                    action: enter_action(side),
                    side,
                    size: self.params.clip_size,
                    price: ask,
                    reason: "high-scalp".into(),
                    dca_level: 0,
                    is_high_scalp: true,
                });
            }
        }
        None
    }
}

fn enter_action(side: Side) -> SignalAction {
    match side {
        Side::Yes => SignalAction::EnterYes,
        Side::No => SignalAction::EnterNo,
    }
}
