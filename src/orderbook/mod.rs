//! Order book tracking
//!
//! L2 books per token from the venue market-data stream, with sequence-gap
//! detection and top-of-book change events.

mod book;
mod client;
mod tracker;

pub use book::{BookSide, OrderBook};
pub use client::{parse_stream_message, subscribe_payload, BookMessage};
pub use tracker::{BookTracker, BookUpdateFn};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A price level in the order book
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceLevel {
    /// Price at this level
    pub price: Decimal,
    /// Total size available
    pub size: Decimal,
}
