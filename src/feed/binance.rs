//! Binance WebSocket trade feed

use super::{PriceFeed, PriceTick};
use crate::ws::{StreamClient, StreamConfig, StreamEvent};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::str::FromStr;
use tokio::sync::mpsc;

const BINANCE_WS_URL: &str = "wss://stream.binance.com:9443/ws";

/// Binance trade message (abbreviated field names per their schema)
#[derive(Debug, Deserialize)]
struct BinanceTradeMessage {
    #[serde(rename = "e")]
    event_type: String,
    #[serde(rename = "p")]
    price: String,
    #[serde(rename = "T")]
    trade_time: i64,
}

/// Feed for the `<symbol>@trade` stream
pub struct BinanceFeed {
    symbol: String,
}

impl BinanceFeed {
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into().to_lowercase(),
        }
    }

    fn ws_url(&self) -> String {
        format!("{}/{}@trade", BINANCE_WS_URL, self.symbol)
    }

    fn parse_message(text: &str) -> Option<PriceTick> {
        let trade: BinanceTradeMessage = serde_json::from_str(text).ok()?;
        if trade.event_type != "trade" {
            return None;
        }

        let price = Decimal::from_str(&trade.price).ok()?;
        let exchange_ts = Utc.timestamp_millis_opt(trade.trade_time).single()?;

        Some(PriceTick {
            source: "binance",
            price,
            timestamp: Utc::now(),
            exchange_ts,
        })
    }
}

#[async_trait]
impl PriceFeed for BinanceFeed {
    fn source(&self) -> &'static str {
        "binance"
    }

    async fn subscribe(&self) -> anyhow::Result<mpsc::Receiver<PriceTick>> {
        let (tx, rx) = mpsc::channel(1024);
        let client = StreamClient::new(StreamConfig::new(self.ws_url()));
        let (mut events, _out) = client.open();

        tracing::info!(symbol = %self.symbol, "subscribing to binance trade stream");

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if let StreamEvent::Text(text) = event {
                    if let Some(tick) = Self::parse_message(&text) {
                        if tx.send(tick).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        Ok(rx)
    }
}
