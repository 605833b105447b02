//! Fixed-capacity worker pool for direct delivery. Submission blocks once
//! saturated, which throttles the feed-read loop instead of buffering
//! unbounded events in memory.

use std::sync::Arc;

use metrics::counter;
use tokio::sync::Semaphore;
use tracing::warn;

use rill_core::{ChangeEvent, ChangeHandler};
use rill_metrics::{MetricsKey, MetricsStore};

pub struct BoundedDispatcher {
    handler: Arc<dyn ChangeHandler>,
    metrics: Arc<MetricsStore>,
    key: MetricsKey,
    capacity: usize,
    permits: Arc<Semaphore>,
}

impl BoundedDispatcher {
    pub fn new(
        handler: Arc<dyn ChangeHandler>,
        metrics: Arc<MetricsStore>,
        key: MetricsKey,
        capacity: usize,
    ) -> Self {
        let capacity = capacity.max(1);
        Self { handler, metrics, key, capacity, permits: Arc::new(Semaphore::new(capacity)) }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    /// Accept one event, waiting for a free worker slot. Handler failures are
    /// logged per item and never propagate to the caller.
    pub async fn submit(&self, event: ChangeEvent) {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .expect("dispatcher semaphore closed");
        self.metrics.add_pending(&self.key, 1);

        let handler = Arc::clone(&self.handler);
        let metrics = Arc::clone(&self.metrics);
        let key = self.key.clone();
        tokio::spawn(async move {
            metrics.add_pending(&key, -1);
            metrics.add_processing(&key, 1);
            let outcome = handler.invoke(&event).await;
            if !outcome.succeeded {
                warn!(
                    key = %key,
                    document = %event.document_key,
                    error = %outcome.error.as_deref().unwrap_or("unknown"),
                    "handler invocation failed"
                );
                counter!("dispatch_failures_total", 1u64);
            }
            counter!("dispatch_invocations_total", 1u64);
            metrics.add_processing(&key, -1);
            drop(permit);
        });
    }

    /// Wait until every accepted event has finished executing. Safe to call
    /// while new submissions are blocked; no accepted work is abandoned.
    pub async fn drain(&self) {
        let all = self
            .permits
            .acquire_many(self.capacity as u32)
            .await
            .expect("dispatcher semaphore closed");
        drop(all);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rill_core::{HandlerOutcome, OperationKind, ResumeToken, SourceScope};
    use rill_metrics::MetricsStoreConfig;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn event(n: u32) -> ChangeEvent {
        ChangeEvent {
            document_key: format!("doc-{n}"),
            operation: OperationKind::Insert,
            document: serde_json::json!({ "n": n }),
            resume_token: ResumeToken::new(serde_json::json!({ "pos": n })),
        }
    }

    struct GaugedHandler {
        in_flight: AtomicUsize,
        high_water: AtomicUsize,
        invocations: AtomicUsize,
        fail_every: Option<usize>,
    }

    impl GaugedHandler {
        fn new(fail_every: Option<usize>) -> Self {
            Self {
                in_flight: AtomicUsize::new(0),
                high_water: AtomicUsize::new(0),
                invocations: AtomicUsize::new(0),
                fail_every,
            }
        }
    }

    #[async_trait::async_trait]
    impl ChangeHandler for GaugedHandler {
        async fn invoke(&self, _event: &ChangeEvent) -> HandlerOutcome {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.high_water.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            let n = self.invocations.fetch_add(1, Ordering::SeqCst);
            match self.fail_every {
                Some(k) if n % k == 0 => HandlerOutcome::failed("synthetic failure"),
                _ => HandlerOutcome::ok(),
            }
        }
    }

    fn dispatcher(handler: Arc<GaugedHandler>, capacity: usize) -> BoundedDispatcher {
        let metrics = Arc::new(MetricsStore::new(MetricsStoreConfig::default()));
        let key = MetricsKey::new("fn", &SourceScope::collection("db", "coll"));
        BoundedDispatcher::new(handler, metrics, key, capacity)
    }

    #[tokio::test]
    async fn back_pressure_bounds_in_flight_and_loses_nothing() {
        let handler = Arc::new(GaugedHandler::new(None));
        let pool = dispatcher(Arc::clone(&handler), 2);
        for n in 0..6 {
            pool.submit(event(n)).await;
        }
        pool.drain().await;
        assert_eq!(handler.invocations.load(Ordering::SeqCst), 6);
        assert!(handler.high_water.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn failures_do_not_stop_the_pool() {
        let handler = Arc::new(GaugedHandler::new(Some(2)));
        let pool = dispatcher(Arc::clone(&handler), 4);
        for n in 0..8 {
            pool.submit(event(n)).await;
        }
        pool.drain().await;
        assert_eq!(handler.invocations.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn drain_waits_for_accepted_work() {
        let handler = Arc::new(GaugedHandler::new(None));
        let pool = dispatcher(Arc::clone(&handler), 4);
        for n in 0..4 {
            pool.submit(event(n)).await;
        }
        pool.drain().await;
        assert_eq!(pool.in_flight(), 0);
        assert_eq!(handler.invocations.load(Ordering::SeqCst), 4);
    }
}
