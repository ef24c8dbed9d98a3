//! Strategy types and the scalping evaluator

mod evaluator;

pub use evaluator::Evaluator;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Binary market side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Yes,
    No,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Yes => Side::No,
            Side::No => Side::Yes,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Yes => write!(f, "YES"),
            Side::No => write!(f, "NO"),
        }
    }
}

/// What the coordinator should do for a market
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalAction {
    /// Buy YES at market
    EnterYes,
    /// Buy NO at market
    EnterNo,
    /// Rest a post-only take-profit limit for the held ladder
    PlaceTpLimit,
    /// Close the held side at market
    ExitMarket,
    /// Deadline-driven close of the LEVEL ladder at market
    ForceUnwind,
}

/// An actionable signal produced by the evaluator.
///
/// "No action" is `None` from [`Evaluator::evaluate`], not a variant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal {
    pub action: SignalAction,
    /// Side the signal concerns (for exits, the held side being closed)
    pub side: Side,
    /// Shares
    pub size: Decimal,
    /// Resting price for limits; reference price for market orders
    pub price: Decimal,
    /// Observability tag, e.g. "entry@0.34", "dca-1", "unwind"
    pub reason: String,
    /// DCA rung for entries (0 = initial)
    pub dca_level: u32,
    /// True when the signal concerns high-scalp positions
    pub is_high_scalp: bool,
}

impl Signal {
    /// Contract check applied before execution. A failure here is a
    /// programming bug in the evaluator and aborts the market's tick.
    pub fn validate(&self) -> Result<(), String> {
        if self.size <= Decimal::ZERO {
            return Err(format!("non-positive signal size {}", self.size));
        }
        if self.price < Decimal::ZERO || self.price > Decimal::ONE {
            return Err(format!("signal price {} outside [0, 1]", self.price));
        }
        Ok(())
    }

    /// Whether this signal opens new exposure (gated when halted)
    pub fn is_entry(&self) -> bool {
        matches!(self.action, SignalAction::EnterYes | SignalAction::EnterNo)
    }
}
