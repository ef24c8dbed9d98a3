//! Order execution
//!
//! Venue order types, the executor seam, and the per-market coordinator
//! that turns signals into orders and fills into position changes.

mod coordinator;
mod venue;

pub use coordinator::{ExecError, ExecOutcome, ExecutionCoordinator, TradeStats};
pub use venue::RestVenue;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Venue-assigned order identifier
pub type OrderId = String;

/// Client-assigned order identifier, generated before submission
pub type ClientOrderId = Uuid;

/// Order direction on a token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    /// Marketable immediate-or-cancel
    Market,
    /// Post-only resting limit
    LimitPostOnly,
}

/// An order to be submitted
#[derive(Debug, Clone, Serialize)]
pub struct Order {
    /// Locally-owned id, sent with the order so fills and cancels can be
    /// correlated without trusting the venue's ack alone
    pub client_id: ClientOrderId,
    pub market_id: String,
    pub token_id: String,
    pub side: OrderSide,
    pub size: Decimal,
    /// Required for limits; reference only for market orders
    pub price: Option<Decimal>,
    pub order_type: OrderType,
}

/// Terminal-or-resting state reported in an order acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    /// Filled immediately (IOC)
    Matched,
    /// Resting on the book (post-only limit)
    Live,
    /// Refused by the venue
    Rejected,
}

/// Venue acknowledgement for a placed order
#[derive(Debug, Clone, Deserialize)]
pub struct OrderAck {
    pub order_id: OrderId,
    pub status: OrderStatus,
    /// Fill details, present when status is `Matched`
    pub fill_price: Option<Decimal>,
    pub fill_size: Option<Decimal>,
}

/// Venue error taxonomy. Transient errors drop the signal and let the next
/// tick re-propose; permanent errors remove the market.
#[derive(Debug, Clone, Error)]
pub enum VenueError {
    #[error("venue call timed out")]
    Timeout,
    #[error("transient venue error: {0}")]
    Transient(String),
    #[error("order rejected: {0}")]
    Rejected(String),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("unknown market: {0}")]
    UnknownMarket(String),
}

impl VenueError {
    /// Permanent errors quarantine the market id for a cooldown
    pub fn is_permanent(&self) -> bool {
        matches!(self, VenueError::Auth(_) | VenueError::UnknownMarket(_))
    }
}

/// Trait for venue order access
#[async_trait]
pub trait VenueExecutor: Send + Sync {
    /// Submit an order
    async fn place_order(&self, order: &Order) -> Result<OrderAck, VenueError>;
    /// Cancel a resting order
    async fn cancel_order(&self, order_id: &str) -> Result<(), VenueError>;
}
