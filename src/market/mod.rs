//! Market state
//!
//! Immutable market descriptors, per-market runtime context, and the
//! thread-safe context store.

mod context;
mod store;

pub use context::{MarketContext, Position, PositionSummary, TpOrder};
pub use store::MarketStore;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// An externally supplied binary market definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketDescriptor {
    /// Unique market identifier
    pub market_id: String,
    /// Display question, e.g. "Will BTC be higher at 14:15?"
    pub question: String,
    /// YES-side token
    pub token_yes: String,
    /// NO-side token
    pub token_no: String,
    /// Resolution instant
    pub end_time: DateTime<Utc>,
    /// Price increment
    pub min_tick: Decimal,
}
