//! Book tracker
//!
//! Owns the live L2 book per subscribed token, applies snapshot and delta
//! messages from the venue stream, detects sequence gaps, and notifies
//! registered callbacks on top-of-book changes.

use super::{parse_stream_message, subscribe_payload, BookMessage, OrderBook};
use crate::telemetry::{record_counter, CounterMetric};
use crate::ws::{StreamClient, StreamConfig, StreamEvent};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};

/// Callback invoked with a consistent book snapshot after a top-of-book change
pub type BookUpdateFn = Arc<dyn Fn(&str, &OrderBook) + Send + Sync>;

struct TokenState {
    book: OrderBook,
    /// False until the first snapshot, and again after a sequence gap;
    /// prices read as `None` while unsynced.
    synced: bool,
}

struct TokenEntry {
    state: Arc<Mutex<TokenState>>,
    callbacks: Vec<BookUpdateFn>,
}

/// Tracks order books for all subscribed tokens
pub struct BookTracker {
    tokens: Mutex<HashMap<String, TokenEntry>>,
    /// Outbound channel to the venue stream, present once started
    out: Mutex<Option<mpsc::Sender<String>>>,
    ws_url: String,
}

impl BookTracker {
    pub fn new(ws_url: impl Into<String>) -> Self {
        Self {
            tokens: Mutex::new(HashMap::new()),
            out: Mutex::new(None),
            ws_url: ws_url.into(),
        }
    }

    /// Connect to the venue stream and process messages until shutdown.
    pub fn start(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let client = StreamClient::new(StreamConfig::new(self.ws_url.clone()));
        let (mut events, out_tx) = client.open();
        *self.out.lock().expect("out channel") = Some(out_tx);

        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => {
                        match event {
                            Some(StreamEvent::Connected) => tracker.resubscribe_all().await,
                            Some(StreamEvent::Text(text)) => {
                                for message in parse_stream_message(&text) {
                                    tracker.apply(message);
                                }
                            }
                            Some(StreamEvent::Reconnecting { .. }) => tracker.mark_all_unsynced(),
                            Some(StreamEvent::Closed) | None => {
                                tracker.mark_all_unsynced();
                                return;
                            }
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        });
    }

    /// Subscribe to tokens, registering `on_update` for their top-of-book
    /// changes. Idempotent: duplicate subscriptions coalesce onto the same
    /// book and add the callback.
    pub async fn subscribe(&self, token_ids: &[String], on_update: BookUpdateFn) {
        {
            let mut tokens = self.tokens.lock().expect("token map");
            for id in token_ids {
                let entry = tokens.entry(id.clone()).or_insert_with(|| TokenEntry {
                    state: Arc::new(Mutex::new(TokenState {
                        book: OrderBook::new(id.clone()),
                        synced: false,
                    })),
                    callbacks: Vec::new(),
                });
                entry.callbacks.push(Arc::clone(&on_update));
            }
        }
        self.request_snapshot(token_ids).await;
    }

    /// Drop tokens; callbacks are no longer invoked and prices read as `None`.
    pub fn unsubscribe(&self, token_ids: &[String]) {
        let mut tokens = self.tokens.lock().expect("token map");
        for id in token_ids {
            tokens.remove(id);
        }
    }

    /// Latest top-of-book; each side independently may be `None`.
    pub fn get_price(&self, token_id: &str) -> (Option<Decimal>, Option<Decimal>) {
        let Some(state) = self.token_state(token_id) else {
            return (None, None);
        };
        let state = state.lock().expect("token state");
        if !state.synced {
            return (None, None);
        }
        state.book.top_of_book()
    }

    /// Deep copy of the current book, safe to read off-thread.
    pub fn get_book_snapshot(&self, token_id: &str) -> Option<OrderBook> {
        let state = self.token_state(token_id)?;
        let state = state.lock().expect("token state");
        state.synced.then(|| state.book.clone())
    }

    /// Apply one parsed message. Exposed for tests and for replaying frames.
    pub fn apply(&self, message: BookMessage) {
        match message {
            BookMessage::Snapshot(book) => self.apply_snapshot(book),
            BookMessage::Delta {
                token_id,
                seq,
                side,
                price,
                size,
            } => self.apply_delta(&token_id, seq, side, price, size),
        }
    }

    fn apply_snapshot(&self, book: OrderBook) {
        let token_id = book.token_id.clone();
        let Some(state) = self.token_state(&token_id) else {
            return;
        };

        let (changed, snapshot) = {
            let mut state = state.lock().expect("token state");
            let old_top = state.synced.then(|| state.book.top_of_book());
            state.book = book;
            state.synced = true;
            let new_top = state.book.top_of_book();
            (old_top != Some(new_top), state.book.clone())
        };

        if changed {
            self.notify(&token_id, &snapshot);
        }
    }

    fn apply_delta(
        &self,
        token_id: &str,
        seq: u64,
        side: super::BookSide,
        price: Decimal,
        size: Decimal,
    ) {
        let Some(state) = self.token_state(token_id) else {
            return;
        };

        enum Outcome {
            Changed(OrderBook),
            Unchanged,
            Gap,
        }

        let outcome = {
            let mut state = state.lock().expect("token state");
            if !state.synced {
                Outcome::Unchanged
            } else if seq <= state.book.seq {
                // Duplicate or out-of-order replay of an already applied level
                Outcome::Unchanged
            } else if seq > state.book.seq + 1 {
                tracing::warn!(
                    token_id,
                    expected = state.book.seq + 1,
                    got = seq,
                    "sequence gap, dropping book"
                );
                record_counter(CounterMetric::SequenceGaps, 1);
                state.synced = false;
                state.book = OrderBook::new(token_id);
                Outcome::Gap
            } else {
                let old_top = state.book.top_of_book();
                state.book.apply_level(side, price, size);
                state.book.seq = seq;
                state.book.updated_at = chrono::Utc::now();
                if state.book.top_of_book() != old_top {
                    Outcome::Changed(state.book.clone())
                } else {
                    Outcome::Unchanged
                }
            }
        };

        match outcome {
            Outcome::Changed(snapshot) => self.notify(token_id, &snapshot),
            Outcome::Gap => {
                let ids = vec![token_id.to_string()];
                let out = self.out.lock().expect("out channel").clone();
                if let Some(out) = out {
                    let payload = subscribe_payload(&ids);
                    tokio::spawn(async move {
                        let _ = out.send(payload).await;
                    });
                }
            }
            Outcome::Unchanged => {}
        }
    }

    fn token_state(&self, token_id: &str) -> Option<Arc<Mutex<TokenState>>> {
        let tokens = self.tokens.lock().expect("token map");
        tokens.get(token_id).map(|e| Arc::clone(&e.state))
    }

    /// Invoke callbacks outside any book lock.
    fn notify(&self, token_id: &str, snapshot: &OrderBook) {
        let callbacks: Vec<BookUpdateFn> = {
            let tokens = self.tokens.lock().expect("token map");
            match tokens.get(token_id) {
                Some(entry) => entry.callbacks.clone(),
                None => return,
            }
        };
        for callback in callbacks {
            callback(token_id, snapshot);
        }
    }

    fn mark_all_unsynced(&self) {
        let states: Vec<Arc<Mutex<TokenState>>> = {
            let tokens = self.tokens.lock().expect("token map");
            tokens.values().map(|e| Arc::clone(&e.state)).collect()
        };
        for state in states {
            let mut state = state.lock().expect("token state");
            state.synced = false;
        }
    }

    async fn resubscribe_all(&self) {
        let ids: Vec<String> = {
            let tokens = self.tokens.lock().expect("token map");
            tokens.keys().cloned().collect()
        };
        if !ids.is_empty() {
            self.request_snapshot(&ids).await;
        }
    }

    async fn request_snapshot(&self, token_ids: &[String]) {
        if token_ids.is_empty() {
            return;
        }
        let out = self.out.lock().expect("out channel").clone();
        if let Some(out) = out {
            let _ = out.send(subscribe_payload(token_ids)).await;
        }
    }
}
