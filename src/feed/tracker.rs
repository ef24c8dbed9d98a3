//! Spot price aggregation
//!
//! Combines the last trade price from each live feed into a single reference
//! price and keeps a short sampled history for change-over-window queries.

use super::{PriceFeed, PriceTick};
use crate::config::FeedConfig;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// One sampled point of the aggregated price
#[derive(Debug, Clone, Copy)]
struct Sample {
    ts: DateTime<Utc>,
    price: Decimal,
}

#[derive(Debug, Default)]
struct TrackerState {
    /// Latest quote per feed
    quotes: HashMap<&'static str, (DateTime<Utc>, Decimal)>,
    /// Aggregated price history, oldest first, 1s granularity
    history: VecDeque<Sample>,
}

/// Aggregates BTC spot price from multiple exchange feeds.
///
/// Feed handlers push ticks under a short-held mutex; a sampler task captures
/// the aggregate once per second. A feed whose last quote is older than the
/// staleness window is ignored; with no fresh feed the price is `None`.
pub struct SpotPriceTracker {
    state: Arc<Mutex<TrackerState>>,
    staleness: Duration,
    retention: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SpotPriceTracker {
    pub fn new(config: &FeedConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(TrackerState::default())),
            staleness: Duration::seconds(config.staleness_secs),
            retention: Duration::seconds(config.history_secs),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Start ingesting from the given feeds and capturing 1s samples.
    ///
    /// Tasks run until `shutdown` flips to true.
    pub async fn start(
        &self,
        feeds: Vec<Arc<dyn PriceFeed>>,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let mut tasks = Vec::new();

        for feed in feeds {
            let mut rx = feed.subscribe().await?;
            let state = Arc::clone(&self.state);
            let retention = self.retention;
            let mut shutdown = shutdown.clone();

            tasks.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        tick = rx.recv() => {
                            match tick {
                                Some(tick) => ingest(&state, retention, &tick),
                                None => {
                                    tracing::warn!(source = feed.source(), "spot feed ended");
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
            }));
        }

        // Sampler: one aggregate snapshot per second
        {
            let state = Arc::clone(&self.state);
            let staleness = self.staleness;
            let retention = self.retention;
            let mut shutdown = shutdown.clone();

            tasks.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            sample(&state, staleness, retention, Utc::now());
                        }
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                return;
                            }
                        }
                    }
                }
            }));
        }

        self.tasks.lock().expect("tracker task list").extend(tasks);
        Ok(())
    }

    /// Stop all feed and sampler tasks.
    pub fn stop(&self) {
        for task in self.tasks.lock().expect("tracker task list").drain(..) {
            task.abort();
        }
    }

    /// Current aggregated price: average of fresh feeds, a single fresh feed
    /// if only one is live, `None` when all are stale.
    pub fn current_price(&self) -> Option<Decimal> {
        self.current_price_at(Utc::now())
    }

    fn current_price_at(&self, now: DateTime<Utc>) -> Option<Decimal> {
        let state = self.state.lock().expect("tracker state");
        let fresh: Vec<Decimal> = state
            .quotes
            .values()
            .filter(|(ts, _)| now - *ts < self.staleness)
            .map(|(_, price)| *price)
            .collect();

        if fresh.is_empty() {
            return None;
        }
        let count = Decimal::from(fresh.len() as u64);
        Some(fresh.iter().sum::<Decimal>() / count)
    }

    /// Relative price change over the trailing window:
    /// `(current - historical) / historical`, with the historical sample
    /// linearly interpolated. `None` if the history does not reach back far
    /// enough or no feed is fresh.
    pub fn price_change_since(&self, seconds_ago: i64) -> Option<Decimal> {
        self.price_change_since_at(seconds_ago, Utc::now())
    }

    fn price_change_since_at(&self, seconds_ago: i64, now: DateTime<Utc>) -> Option<Decimal> {
        let current = self.current_price_at(now)?;
        let target = now - Duration::seconds(seconds_ago);

        let state = self.state.lock().expect("tracker state");
        let historical = interpolate(&state.history, target)?;
        if historical.is_zero() {
            return None;
        }
        Some((current - historical) / historical)
    }

    #[cfg(test)]
    fn ingest_for_test(&self, tick: &PriceTick) {
        ingest(&self.state, self.retention, tick);
    }

    #[cfg(test)]
    fn sample_for_test(&self, now: DateTime<Utc>) {
        sample(&self.state, self.staleness, self.retention, now);
    }
}

fn ingest(state: &Mutex<TrackerState>, retention: Duration, tick: &PriceTick) {
    let mut state = state.lock().expect("tracker state");
    state.quotes.insert(tick.source, (tick.timestamp, tick.price));
    prune(&mut state.history, tick.timestamp - retention);
}

fn sample(state: &Mutex<TrackerState>, staleness: Duration, retention: Duration, now: DateTime<Utc>) {
    let mut state = state.lock().expect("tracker state");
    let fresh: Vec<Decimal> = state
        .quotes
        .values()
        .filter(|(ts, _)| now - *ts < staleness)
        .map(|(_, price)| *price)
        .collect();

    if !fresh.is_empty() {
        let price = fresh.iter().sum::<Decimal>() / Decimal::from(fresh.len() as u64);
        state.history.push_back(Sample { ts: now, price });
    }
    prune(&mut state.history, now - retention);
}

fn prune(history: &mut VecDeque<Sample>, cutoff: DateTime<Utc>) {
    while history.front().is_some_and(|s| s.ts < cutoff) {
        history.pop_front();
    }
}

/// Linear interpolation over the sampled history. Requires a sample on each
/// side of the target instant.
fn interpolate(history: &VecDeque<Sample>, target: DateTime<Utc>) -> Option<Decimal> {
    let first = history.front()?;
    if target < first.ts {
        return None;
    }

    let mut before = *first;
    for sample in history.iter() {
        if sample.ts == target {
            return Some(sample.price);
        }
        if sample.ts > target {
            let span = (sample.ts - before.ts).num_milliseconds();
            if span == 0 {
                return Some(sample.price);
            }
            let elapsed = (target - before.ts).num_milliseconds();
            let frac = Decimal::from(elapsed) / Decimal::from(span);
            return Some(before.price + (sample.price - before.price) * frac);
        }
        before = *sample;
    }
    // Target is newer than the last sample; treat the last sample as current.
    Some(before.price)
}
