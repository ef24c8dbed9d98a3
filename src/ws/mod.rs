//! Reconnecting WebSocket client
//!
//! Shared by the spot price feeds and the venue market-data stream.

mod client;

pub use client::{StreamClient, StreamConfig, StreamEvent};
