//! Market context store
//!
//! The map spine is guarded by one coarse lock held only for membership
//! reads and writes; each context has its own lock so distinct markets
//! evaluate in parallel. The evaluator reads deep-copy snapshots only.

use super::{MarketContext, MarketDescriptor};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Thread-safe registry of market contexts keyed by market id
#[derive(Default)]
pub struct MarketStore {
    inner: RwLock<HashMap<String, Arc<Mutex<MarketContext>>>>,
}

impl MarketStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a market. Returns false if the id is already present.
    pub async fn add(&self, descriptor: MarketDescriptor) -> bool {
        let mut map = self.inner.write().await;
        if map.contains_key(&descriptor.market_id) {
            return false;
        }
        let id = descriptor.market_id.clone();
        map.insert(id, Arc::new(Mutex::new(MarketContext::new(descriptor))));
        true
    }

    /// Remove a market, returning its final state.
    pub async fn remove(&self, market_id: &str) -> Option<MarketContext> {
        let handle = self.inner.write().await.remove(market_id)?;
        let ctx = handle.lock().await.clone();
        Some(ctx)
    }

    /// Shared handle to the live context.
    pub async fn get(&self, market_id: &str) -> Option<Arc<Mutex<MarketContext>>> {
        self.inner.read().await.get(market_id).cloned()
    }

    /// Deep copy of the mutable fields, taken under the per-context lock.
    pub async fn snapshot(&self, market_id: &str) -> Option<MarketContext> {
        let handle = self.get(market_id).await?;
        let ctx = handle.lock().await;
        Some(ctx.clone())
    }

    /// Snapshots of every active market.
    pub async fn snapshot_all(&self) -> Vec<MarketContext> {
        let handles: Vec<Arc<Mutex<MarketContext>>> =
            self.inner.read().await.values().cloned().collect();
        let mut snapshots = Vec::with_capacity(handles.len());
        for handle in handles {
            snapshots.push(handle.lock().await.clone());
        }
        snapshots
    }

    /// Ids of all active markets.
    pub async fn market_ids(&self) -> Vec<String> {
        self.inner.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn contains(&self, market_id: &str) -> bool {
        self.inner.read().await.contains_key(market_id)
    }
}
