//! Venue market-data wire format
//!
//! The venue pushes an initial `book` snapshot per subscribed token followed
//! by `price_change` deltas keyed by price level. Every message carries a
//! per-token monotone sequence number used downstream for gap detection.

use super::{BookSide, OrderBook, PriceLevel};
use chrono::{TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Subscription request for a set of tokens
#[derive(Debug, Serialize)]
struct SubscriptionMessage {
    assets_ids: Vec<String>,
    #[serde(rename = "type")]
    msg_type: &'static str,
}

/// Build the subscription payload for the market channel
pub fn subscribe_payload(token_ids: &[String]) -> String {
    let msg = SubscriptionMessage {
        assets_ids: token_ids.to_vec(),
        msg_type: "market",
    };
    serde_json::to_string(&msg).expect("static subscription message")
}

/// Full book snapshot event
#[derive(Debug, Deserialize)]
struct BookEvent {
    asset_id: String,
    #[serde(default)]
    bids: Vec<WireLevel>,
    #[serde(default)]
    asks: Vec<WireLevel>,
    #[serde(default)]
    seq: u64,
    #[serde(default)]
    timestamp: String,
}

#[derive(Debug, Deserialize)]
struct WireLevel {
    price: String,
    size: String,
}

/// Delta event: one or more level changes, each with its own token sequence
#[derive(Debug, Deserialize)]
struct PriceChangeEvent {
    price_changes: Vec<WireChange>,
}

#[derive(Debug, Deserialize)]
struct WireChange {
    asset_id: String,
    price: String,
    size: String,
    side: String,
    #[serde(default)]
    seq: u64,
}

/// A parsed market-data message
#[derive(Debug, Clone)]
pub enum BookMessage {
    /// Replace the token's book atomically
    Snapshot(OrderBook),
    /// Upsert (or remove, when size is zero) a single level
    Delta {
        token_id: String,
        seq: u64,
        side: BookSide,
        price: Decimal,
        size: Decimal,
    },
}

/// Parse one stream frame into zero or more book messages.
///
/// Frames may contain a single event or an array of events; unknown event
/// types and malformed levels are skipped.
pub fn parse_stream_message(text: &str) -> Vec<BookMessage> {
    let value: serde_json::Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(_) => return vec![],
    };

    match value {
        serde_json::Value::Array(events) => {
            events.iter().flat_map(parse_event).collect()
        }
        event => parse_event(&event),
    }
}

fn parse_event(event: &serde_json::Value) -> Vec<BookMessage> {
    let event_type = event
        .get("event_type")
        .and_then(|v| v.as_str())
        .unwrap_or("");

    match event_type {
        "book" => match serde_json::from_value::<BookEvent>(event.clone()) {
            Ok(book) => vec![BookMessage::Snapshot(snapshot_to_book(book))],
            Err(e) => {
                tracing::warn!(error = %e, "malformed book snapshot");
                vec![]
            }
        },
        "price_change" => match serde_json::from_value::<PriceChangeEvent>(event.clone()) {
            Ok(msg) => msg.price_changes.iter().filter_map(change_to_delta).collect(),
            Err(e) => {
                tracing::warn!(error = %e, "malformed price change");
                vec![]
            }
        },
        // Informational events carry no book state
        "last_trade_price" | "tick_size_change" => vec![],
        other => {
            tracing::trace!(event_type = other, "ignoring event");
            vec![]
        }
    }
}

fn snapshot_to_book(event: BookEvent) -> OrderBook {
    let mut bids: Vec<PriceLevel> = event.bids.iter().filter_map(wire_level).collect();
    let mut asks: Vec<PriceLevel> = event.asks.iter().filter_map(wire_level).collect();
    bids.sort_by(|a, b| b.price.cmp(&a.price));
    asks.sort_by(|a, b| a.price.cmp(&b.price));

    let updated_at = event
        .timestamp
        .parse::<i64>()
        .ok()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now);

    OrderBook {
        token_id: event.asset_id,
        bids,
        asks,
        seq: event.seq,
        updated_at,
    }
}

fn wire_level(level: &WireLevel) -> Option<PriceLevel> {
    let price = Decimal::from_str(&level.price).ok()?;
    let size = Decimal::from_str(&level.size).ok()?;
    if size.is_zero() {
        return None;
    }
    Some(PriceLevel { price, size })
}

fn change_to_delta(change: &WireChange) -> Option<BookMessage> {
    let price = Decimal::from_str(&change.price).ok()?;
    let size = Decimal::from_str(&change.size).ok()?;
    let side = match change.side.as_str() {
        "BUY" => BookSide::Bid,
        "SELL" => BookSide::Ask,
        _ => return None,
    };

    Some(BookMessage::Delta {
        token_id: change.asset_id.clone(),
        seq: change.seq,
        side,
        price,
        size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_subscribe_payload() {
        let payload = subscribe_payload(&["tok-1".into(), "tok-2".into()]);
        assert!(payload.contains("\"assets_ids\""));
        assert!(payload.contains("\"type\":\"market\""));
        assert!(payload.contains("tok-1"));
    }

    #[test]
    fn test_parse_snapshot() {
        let json = r#"{
            "event_type": "book",
            "asset_id": "123",
            "bids": [{"price": "0.49", "size": "200"}, {"price": "0.50", "size": "100"}],
            "asks": [{"price": "0.53", "size": "250"}, {"price": "0.52", "size": "150"}],
            "seq": 7,
            "timestamp": "1704067200000"
        }"#;

        let messages = parse_stream_message(json);
        assert_eq!(messages.len(), 1);

        match &messages[0] {
            BookMessage::Snapshot(book) => {
                assert_eq!(book.token_id, "123");
                assert_eq!(book.seq, 7);
                // Sorted regardless of wire order
                assert_eq!(book.best_bid(), Some(dec!(0.50)));
                assert_eq!(book.best_ask(), Some(dec!(0.52)));
            }
            other => panic!("expected snapshot, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_snapshot_drops_zero_levels() {
        let json = r#"{
            "event_type": "book",
            "asset_id": "123",
            "bids": [{"price": "0.50", "size": "0"}],
            "asks": [{"price": "0.52", "size": "10"}],
            "seq": 1
        }"#;

        match &parse_stream_message(json)[0] {
            BookMessage::Snapshot(book) => {
                assert!(book.bids.is_empty());
                assert_eq!(book.asks.len(), 1);
            }
            other => panic!("expected snapshot, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_price_changes() {
        let json = r#"{
            "event_type": "price_change",
            "price_changes": [
                {"asset_id": "123", "price": "0.51", "size": "10", "side": "BUY", "seq": 8},
                {"asset_id": "456", "price": "0.40", "size": "0", "side": "SELL", "seq": 3}
            ]
        }"#;

        let messages = parse_stream_message(json);
        assert_eq!(messages.len(), 2);

        match &messages[0] {
            BookMessage::Delta { token_id, seq, side, price, size } => {
                assert_eq!(token_id, "123");
                assert_eq!(*seq, 8);
                assert_eq!(*side, BookSide::Bid);
                assert_eq!(*price, dec!(0.51));
                assert_eq!(*size, dec!(10));
            }
            other => panic!("expected delta, got {other:?}"),
        }
        match &messages[1] {
            BookMessage::Delta { side, size, .. } => {
                assert_eq!(*side, BookSide::Ask);
                assert!(size.is_zero());
            }
            other => panic!("expected delta, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_event_array() {
        let json = r#"[
            {"event_type": "book", "asset_id": "1", "bids": [], "asks": [], "seq": 1},
            {"event_type": "last_trade_price", "asset_id": "1", "price": "0.5"}
        ]"#;

        let messages = parse_stream_message(json);
        assert_eq!(messages.len(), 1);
        assert!(matches!(messages[0], BookMessage::Snapshot(_)));
    }

    #[test]
    fn test_parse_garbage() {
        assert!(parse_stream_message("not json").is_empty());
        assert!(parse_stream_message(r#"{"event_type": "mystery"}"#).is_empty());
    }

    #[test]
    fn test_parse_unknown_side_skipped() {
        let json = r#"{
            "event_type": "price_change",
            "price_changes": [
                {"asset_id": "123", "price": "0.51", "size": "10", "side": "HOLD", "seq": 1}
            ]
        }"#;
        assert!(parse_stream_message(json).is_empty());
    }
}
