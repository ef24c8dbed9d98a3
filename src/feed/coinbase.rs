//! Coinbase WebSocket ticker feed

use super::{PriceFeed, PriceTick};
use crate::ws::{StreamClient, StreamConfig, StreamEvent};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use tokio::sync::mpsc;

const COINBASE_WS_URL: &str = "wss://ws-feed.exchange.coinbase.com";

#[derive(Debug, Serialize)]
struct SubscribeMessage {
    #[serde(rename = "type")]
    msg_type: &'static str,
    product_ids: Vec<String>,
    channels: Vec<&'static str>,
}

/// Coinbase ticker message; only last-trade price and time are used
#[derive(Debug, Deserialize)]
struct TickerMessage {
    #[serde(rename = "type")]
    msg_type: String,
    price: String,
    time: Option<String>,
}

/// Feed for the `ticker` channel of one product
pub struct CoinbaseFeed {
    product_id: String,
}

impl CoinbaseFeed {
    /// Create a feed for the given product, e.g. "BTC-USD"
    pub fn new(product_id: impl Into<String>) -> Self {
        Self {
            product_id: product_id.into().to_uppercase(),
        }
    }

    /// Map a spot symbol like "BTCUSDT" onto the Coinbase product id
    pub fn for_symbol(symbol: &str) -> Self {
        let base = symbol.trim_end_matches("USDT").trim_end_matches("USD");
        Self::new(format!("{}-USD", base.to_uppercase()))
    }

    fn subscribe_payload(&self) -> String {
        let msg = SubscribeMessage {
            msg_type: "subscribe",
            product_ids: vec![self.product_id.clone()],
            channels: vec!["ticker"],
        };
        serde_json::to_string(&msg).expect("static subscribe message")
    }

    fn parse_message(text: &str) -> Option<PriceTick> {
        let ticker: TickerMessage = serde_json::from_str(text).ok()?;
        if ticker.msg_type != "ticker" {
            return None;
        }

        let price = Decimal::from_str(&ticker.price).ok()?;
        let now = Utc::now();
        let exchange_ts = ticker
            .time
            .as_deref()
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or(now);

        Some(PriceTick {
            source: "coinbase",
            price,
            timestamp: now,
            exchange_ts,
        })
    }
}

#[async_trait]
impl PriceFeed for CoinbaseFeed {
    fn source(&self) -> &'static str {
        "coinbase"
    }

    async fn subscribe(&self) -> anyhow::Result<mpsc::Receiver<PriceTick>> {
        let (tx, rx) = mpsc::channel(1024);
        let client = StreamClient::new(StreamConfig::new(COINBASE_WS_URL));
        let (mut events, out) = client.open();
        let payload = self.subscribe_payload();

        tracing::info!(product = %self.product_id, "subscribing to coinbase ticker");

        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    // Sent on every (re)connect so the subscription survives drops
                    StreamEvent::Connected => {
                        if out.send(payload.clone()).await.is_err() {
                            return;
                        }
                    }
                    StreamEvent::Text(text) => {
                        if let Some(tick) = CoinbaseFeed::parse_message(&text) {
                            if tx.send(tick).await.is_err() {
                                return;
                            }
                        }
                    }
                    _ => {}
                }
            }
        });

        Ok(rx)
    }
}
