//! poly-scalper: scalping engine for short-duration binary prediction markets
//!
//! This library provides the core components for:
//! - Real-time spot price aggregation from Binance and Coinbase
//! - Order book tracking from the venue market-data WebSocket
//! - Per-market scalping state machines (entry / DCA / unwind / force-exit)
//! - Serialized order execution with fill reconciliation
//! - An engine loop with deadline enforcement and market lifecycle
//! - An observable event stream for dashboards and logging

pub mod cli;
pub mod config;
pub mod engine;
pub mod events;
pub mod execution;
pub mod feed;
pub mod market;
pub mod orderbook;
pub mod strategy;
pub mod telemetry;
pub mod ws;
