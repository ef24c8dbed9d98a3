//! Spot price feeds
//!
//! Real-time BTC/USD reference price aggregated from two public exchange
//! streams. Advisory input: the scalping rules themselves are price-level
//! based and keep working when spot is unavailable.

mod binance;
mod coinbase;
mod tracker;

pub use binance::BinanceFeed;
pub use coinbase::CoinbaseFeed;
pub use tracker::SpotPriceTracker;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::mpsc;

/// A single trade-price tick from an exchange
#[derive(Debug, Clone, Serialize)]
pub struct PriceTick {
    /// Feed identifier ("binance", "coinbase")
    pub source: &'static str,
    /// Last trade price
    pub price: Decimal,
    /// Local receive timestamp
    pub timestamp: DateTime<Utc>,
    /// Exchange-reported event time
    pub exchange_ts: DateTime<Utc>,
}

/// Trait for spot feed implementations
#[async_trait]
pub trait PriceFeed: Send + Sync {
    /// Stable feed identifier
    fn source(&self) -> &'static str;
    /// Subscribe to price updates; the feed reconnects internally
    async fn subscribe(&self) -> anyhow::Result<mpsc::Receiver<PriceTick>>;
}
