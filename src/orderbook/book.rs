//! Order book state

use super::PriceLevel;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Which side of the book a level belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookSide {
    Bid,
    Ask,
}

/// L2 aggregated order book for a token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBook {
    /// Token identifier
    pub token_id: String,
    /// Bid levels, best (highest) first
    pub bids: Vec<PriceLevel>,
    /// Ask levels, best (lowest) first
    pub asks: Vec<PriceLevel>,
    /// Venue sequence number of the last applied message
    pub seq: u64,
    /// Last update timestamp
    pub updated_at: DateTime<Utc>,
}

impl OrderBook {
    /// Create a new empty order book
    pub fn new(token_id: impl Into<String>) -> Self {
        Self {
            token_id: token_id.into(),
            bids: vec![],
            asks: vec![],
            seq: 0,
            updated_at: Utc::now(),
        }
    }

    /// Get best bid price
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|l| l.price)
    }

    /// Get best ask price
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|l| l.price)
    }

    /// Best bid and ask together; either side may be absent
    pub fn top_of_book(&self) -> (Option<Decimal>, Option<Decimal>) {
        (self.best_bid(), self.best_ask())
    }

    /// Get mid price
    pub fn mid_price(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid + ask) / Decimal::TWO),
            _ => None,
        }
    }

    /// Get spread
    pub fn spread(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some(ask - bid),
            _ => None,
        }
    }

    /// Upsert one level, keeping bids descending and asks ascending.
    /// A zero size removes the level.
    pub fn apply_level(&mut self, side: BookSide, price: Decimal, size: Decimal) {
        let levels = match side {
            BookSide::Bid => &mut self.bids,
            BookSide::Ask => &mut self.asks,
        };

        if size.is_zero() {
            levels.retain(|l| l.price != price);
            return;
        }

        if let Some(level) = levels.iter_mut().find(|l| l.price == price) {
            level.size = size;
            return;
        }

        let pos = match side {
            BookSide::Bid => levels.partition_point(|l| l.price > price),
            BookSide::Ask => levels.partition_point(|l| l.price < price),
        };
        levels.insert(pos, PriceLevel { price, size });
    }
}
