//! Rill metrics: per-(handler, scope) pending-work counters with a bounded
//! sample history, periodic snapshot/reaper tasks, and the provider that
//! reconciles live counters with durable-queue counts.
//!
//! The store is an explicitly owned component so tests can instantiate
//! independent instances; nothing here is process-global.

#![forbid(unsafe_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::{counter, gauge};
use rustc_hash::FxHashMap;
use tokio::sync::watch;
use tracing::{debug, info};

use rill_core::{SourceScope, TriggerMetrics};
use rill_lease::{LeaseError, LeaseQueue};

/// Registry key: one counter set per (handler, scope) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetricsKey {
    pub handler_id: String,
    pub database: Option<String>,
    pub collection: Option<String>,
}

impl MetricsKey {
    pub fn new(handler_id: impl Into<String>, scope: &SourceScope) -> Self {
        Self {
            handler_id: handler_id.into(),
            database: scope.database.clone(),
            collection: scope.collection.clone(),
        }
    }
}

impl std::fmt::Display for MetricsKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}-{}-{}",
            self.handler_id,
            self.database.as_deref().unwrap_or(""),
            self.collection.as_deref().unwrap_or("")
        )
    }
}

#[derive(Debug, Clone)]
pub struct MetricsStoreConfig {
    /// Bound on the per-key history ring.
    pub max_samples: usize,
    pub snapshot_interval: Duration,
    pub reap_interval: Duration,
    /// Keys whose newest sample is older than this are evicted.
    pub stale_after: Duration,
}

impl Default for MetricsStoreConfig {
    fn default() -> Self {
        Self {
            max_samples: 100,
            snapshot_interval: Duration::from_secs(5),
            reap_interval: Duration::from_secs(600),
            stale_after: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Default)]
struct KeyState {
    pending: i64,
    processing: i64,
    history: VecDeque<TriggerMetrics>,
}

/// Concurrent key -> counter map plus bounded per-key history ring. Counters
/// are created lazily and never explicitly destroyed; the reaper evicts keys
/// after long inactivity.
pub struct MetricsStore {
    cfg: MetricsStoreConfig,
    inner: Mutex<FxHashMap<MetricsKey, KeyState>>,
}

impl MetricsStore {
    pub fn new(cfg: MetricsStoreConfig) -> Self {
        Self { cfg, inner: Mutex::new(FxHashMap::default()) }
    }

    pub fn add_pending(&self, key: &MetricsKey, delta: i64) {
        let mut inner = self.inner.lock().expect("metrics store poisoned");
        let state = inner.entry(key.clone()).or_default();
        state.pending += delta;
    }

    pub fn add_processing(&self, key: &MetricsKey, delta: i64) {
        let mut inner = self.inner.lock().expect("metrics store poisoned");
        let state = inner.entry(key.clone()).or_default();
        state.processing += delta;
    }

    /// Live counter values, stamped now.
    pub fn current(&self, key: &MetricsKey) -> TriggerMetrics {
        let mut inner = self.inner.lock().expect("metrics store poisoned");
        let state = inner.entry(key.clone()).or_default();
        TriggerMetrics::at(state.pending, state.processing, Utc::now())
    }

    /// Newest history sample, falling back to the live counters before the
    /// first snapshot tick has run.
    pub fn latest(&self, key: &MetricsKey) -> TriggerMetrics {
        let mut inner = self.inner.lock().expect("metrics store poisoned");
        let state = inner.entry(key.clone()).or_default();
        match state.history.back() {
            Some(s) => s.clone(),
            None => TriggerMetrics::at(state.pending, state.processing, Utc::now()),
        }
    }

    /// Trailing samples in chronological order.
    pub fn history(&self, key: &MetricsKey) -> Vec<TriggerMetrics> {
        let inner = self.inner.lock().expect("metrics store poisoned");
        inner.get(key).map(|s| s.history.iter().cloned().collect()).unwrap_or_default()
    }

    pub fn key_count(&self) -> usize {
        self.inner.lock().expect("metrics store poisoned").len()
    }

    /// Record one snapshot per key into its history ring, evicting the oldest
    /// entry on overflow.
    pub fn take_snapshot(&self, now: DateTime<Utc>) {
        let mut inner = self.inner.lock().expect("metrics store poisoned");
        for (key, state) in inner.iter_mut() {
            let sample = TriggerMetrics::at(state.pending, state.processing, now);
            gauge!("rill_pending_events", state.pending as f64, "key" => key.to_string());
            state.history.push_back(sample);
            while state.history.len() > self.cfg.max_samples {
                state.history.pop_front();
            }
        }
        counter!("metrics_snapshot_ticks_total", 1u64);
    }

    /// Evict keys with no samples or whose newest sample exceeds the
    /// staleness threshold.
    pub fn reap_stale(&self, now: DateTime<Utc>) {
        let stale = chrono::Duration::from_std(self.cfg.stale_after)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        let mut inner = self.inner.lock().expect("metrics store poisoned");
        let before = inner.len();
        inner.retain(|_, state| match state.history.back() {
            Some(s) => now - s.timestamp <= stale,
            None => false,
        });
        let evicted = before - inner.len();
        if evicted > 0 {
            debug!(evicted, "reaped stale metric keys");
        }
    }
}

/// Spawn the periodic snapshot/reaper pair for a store. Both ticks observe
/// the cancellation signal and the task exits promptly when it fires.
pub fn spawn_samplers(
    store: Arc<MetricsStore>,
    mut cancel: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    let snapshot_every = store.cfg.snapshot_interval;
    let reap_every = store.cfg.reap_interval;
    tokio::spawn(async move {
        let mut snapshot = tokio::time::interval(snapshot_every);
        let mut reap = tokio::time::interval(reap_every);
        // The first tick of an interval fires immediately; skip it so an
        // empty store is not reaped at startup.
        snapshot.tick().await;
        reap.tick().await;
        loop {
            tokio::select! {
                _ = cancel.changed() => {
                    if *cancel.borrow() { break; }
                }
                _ = snapshot.tick() => store.take_snapshot(Utc::now()),
                _ = reap.tick() => store.reap_stale(Utc::now()),
            }
        }
        info!("metrics samplers stopped");
    })
}

#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("lease query: {0}")]
    Lease(#[from] LeaseError),
}

/// Read surface for monitors. In durable mode the durable-queue count is
/// ground truth and beats the in-memory approximation; query failures are
/// surfaced so a caller can tell "no work" from "couldn't measure".
pub struct MetricsProvider {
    store: Arc<MetricsStore>,
    key: MetricsKey,
    scope: SourceScope,
    lease: Option<Arc<LeaseQueue>>,
}

impl MetricsProvider {
    pub fn new(store: Arc<MetricsStore>, handler_id: impl Into<String>, scope: SourceScope) -> Self {
        let handler_id = handler_id.into();
        let key = MetricsKey::new(&handler_id, &scope);
        Self { store, key, scope, lease: None }
    }

    pub fn with_lease_queue(mut self, lease: Arc<LeaseQueue>) -> Self {
        self.lease = Some(lease);
        self
    }

    pub fn key(&self) -> &MetricsKey {
        &self.key
    }

    pub async fn get_metrics(&self) -> Result<TriggerMetrics, MetricsError> {
        if let Some(lease) = &self.lease {
            let pending = lease.count_pending(&self.key.handler_id, &self.scope).await?;
            debug!(key = %self.key, pending, "metrics from lease queue");
            return Ok(TriggerMetrics::at(pending, 0, Utc::now()));
        }
        Ok(self.store.latest(&self.key))
    }

    pub fn history(&self) -> Vec<TriggerMetrics> {
        self.store.history(&self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rill_core::{ChangeEvent, MonitorLevel, OperationKind, ResumeToken};
    use rill_lease::{LeaseBackend, LeaseRecord, MemoryLeaseBackend};

    fn key() -> MetricsKey {
        MetricsKey::new("fn", &SourceScope::collection("db", "coll"))
    }

    fn small_store(max_samples: usize) -> MetricsStore {
        MetricsStore::new(MetricsStoreConfig { max_samples, ..Default::default() })
    }

    #[test]
    fn key_display_matches_identity_convention() {
        assert_eq!(key().to_string(), "fn-db-coll");
        let cluster = MetricsKey::new("fn", &SourceScope::cluster());
        assert_eq!(cluster.to_string(), "fn--");
    }

    #[test]
    fn history_ring_is_bounded() {
        let store = small_store(3);
        let k = key();
        for n in 0..5 {
            store.add_pending(&k, 1);
            store.take_snapshot(Utc::now() + chrono::Duration::seconds(n));
        }
        let history = store.history(&k);
        assert_eq!(history.len(), 3);
        assert_eq!(history.last().unwrap().pending_events, 5);
        assert_eq!(history.first().unwrap().pending_events, 3);
    }

    #[test]
    fn latest_falls_back_to_live_counters() {
        let store = small_store(10);
        let k = key();
        store.add_pending(&k, 7);
        assert_eq!(store.latest(&k).pending_events, 7);
        store.take_snapshot(Utc::now());
        store.add_pending(&k, 1);
        // After a snapshot the newest sample wins, even if counters moved on.
        assert_eq!(store.latest(&k).pending_events, 7);
    }

    #[test]
    fn reaper_evicts_keys_with_old_samples() {
        let store = small_store(10);
        let k = key();
        store.add_pending(&k, 1);
        store.take_snapshot(Utc::now() - chrono::Duration::hours(2));
        store.reap_stale(Utc::now());
        assert_eq!(store.key_count(), 0);

        let store = small_store(10);
        store.add_pending(&k, 1);
        store.take_snapshot(Utc::now());
        store.reap_stale(Utc::now());
        assert_eq!(store.key_count(), 1);
    }

    #[test]
    fn reaper_evicts_never_sampled_keys() {
        let store = small_store(10);
        store.add_pending(&key(), 1);
        store.reap_stale(Utc::now());
        assert_eq!(store.key_count(), 0);
    }

    #[tokio::test]
    async fn provider_reconciles_with_lease_counts() {
        let scope = SourceScope::collection("db", "coll");
        let queue = Arc::new(LeaseQueue::new(
            Arc::new(MemoryLeaseBackend::new()) as Arc<dyn LeaseBackend>
        ));
        queue.initialize().await.unwrap();
        let event = ChangeEvent {
            document_key: "doc-1".into(),
            operation: OperationKind::Insert,
            document: serde_json::json!({}),
            resume_token: ResumeToken::new(serde_json::json!({ "pos": 1 })),
        };
        for _ in 0..2 {
            let rec =
                LeaseRecord::for_event("fn", &scope, MonitorLevel::Collection, &event).unwrap();
            queue.enqueue(rec).await.unwrap();
        }

        let store = Arc::new(MetricsStore::new(MetricsStoreConfig::default()));
        // Drifted in-memory counter must not win over the durable count.
        store.add_pending(&MetricsKey::new("fn", &scope), 99);
        let provider = MetricsProvider::new(Arc::clone(&store), "fn", scope.clone())
            .with_lease_queue(Arc::clone(&queue));
        let metrics = provider.get_metrics().await.unwrap();
        assert_eq!(metrics.pending_events, 2);

        queue.dequeue_oldest("fn", &scope).await.unwrap().unwrap();
        assert_eq!(provider.get_metrics().await.unwrap().pending_events, 1);
    }

    #[tokio::test]
    async fn provider_surfaces_lease_query_failure() {
        let scope = SourceScope::collection("db", "coll");
        // Queue never initialized: the count query fails and the provider
        // must report that instead of a silent zero.
        let queue = Arc::new(LeaseQueue::new(
            Arc::new(MemoryLeaseBackend::new()) as Arc<dyn LeaseBackend>
        ));
        let store = Arc::new(MetricsStore::new(MetricsStoreConfig::default()));
        let provider =
            MetricsProvider::new(store, "fn", scope).with_lease_queue(queue);
        assert!(provider.get_metrics().await.is_err());
    }

    #[tokio::test]
    async fn samplers_tick_and_stop_on_cancel() {
        let store = Arc::new(MetricsStore::new(MetricsStoreConfig {
            snapshot_interval: Duration::from_millis(10),
            reap_interval: Duration::from_secs(3600),
            ..Default::default()
        }));
        let k = key();
        store.add_pending(&k, 4);
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let handle = spawn_samplers(Arc::clone(&store), cancel_rx);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!store.history(&k).is_empty());
        cancel_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("samplers did not stop")
            .unwrap();
    }
}
