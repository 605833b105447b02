//! Durable delivery: the producer side writes each change event as a lease
//! record (with a bounded retry budget), and a polling consumer pool drains
//! the queue independently of the feed-read loop.

use std::sync::Arc;

use metrics::counter;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use rill_core::{ChangeEvent, ChangeHandler, MonitorLevel};
use rill_lease::{LeaseQueue, LeaseRecord};
use rill_metrics::{MetricsKey, MetricsStore};

use crate::listener::{Deliver, ListenerConfig};

pub(crate) struct DurableDelivery {
    lease: Arc<LeaseQueue>,
    cfg: ListenerConfig,
    level: MonitorLevel,
}

impl DurableDelivery {
    pub(crate) fn new(lease: Arc<LeaseQueue>, cfg: ListenerConfig, level: MonitorLevel) -> Self {
        Self { lease, cfg, level }
    }
}

#[async_trait::async_trait]
impl Deliver for DurableDelivery {
    /// Write the event durably, retrying up to the budget with exponential
    /// backoff. Past the budget the event is skipped with a loud log line;
    /// one unwritable event must not stop the producer.
    async fn deliver(&self, event: ChangeEvent, cancel: &mut watch::Receiver<bool>) -> bool {
        let record =
            match LeaseRecord::for_event(&self.cfg.handler_id, &self.cfg.scope, self.level, &event)
            {
                Ok(r) => r,
                Err(e) => {
                    error!(
                        handler = %self.cfg.handler_id,
                        document = %event.document_key,
                        error = %e,
                        "change event not serializable; skipped"
                    );
                    return true;
                }
            };

        let mut backoff = self.cfg.write_retry_backoff;
        for attempt in 0..=self.cfg.write_retry_budget {
            match self.lease.enqueue(record.clone()).await {
                Ok(()) => return true,
                Err(e) if attempt < self.cfg.write_retry_budget => {
                    warn!(
                        handler = %self.cfg.handler_id,
                        document = %event.document_key,
                        attempt,
                        error = %e,
                        "durable write failed; retrying"
                    );
                    tokio::select! {
                        _ = cancel.changed() => return false,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = (backoff * 2).min(self.cfg.backoff_cap);
                }
                Err(e) => {
                    // Explicit trade-off: log as potential loss, keep going.
                    error!(
                        handler = %self.cfg.handler_id,
                        document = %event.document_key,
                        error = %e,
                        "durable write failed after retries; event skipped"
                    );
                    counter!("lease_write_failures_total", 1u64);
                }
            }
        }
        true
    }
}

/// One polling consumer: dequeue-oldest, invoke the handler, sleep briefly
/// when the queue is empty. Handler failures are logged per record and never
/// stop the loop.
pub(crate) fn run_consumer(
    idx: usize,
    lease: Arc<LeaseQueue>,
    handler: Arc<dyn ChangeHandler>,
    metrics: Arc<MetricsStore>,
    key: MetricsKey,
    cfg: ListenerConfig,
    mut cancel: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        debug!(consumer = idx, key = %key, "lease consumer started");
        while !*cancel.borrow() {
            match lease.dequeue_oldest(&cfg.handler_id, &cfg.scope).await {
                Ok(Some(record)) => {
                    let event = match record.event() {
                        Ok(ev) => ev,
                        Err(e) => {
                            error!(
                                consumer = idx,
                                lease = %record.id,
                                error = %e,
                                "undecodable lease record dropped"
                            );
                            continue;
                        }
                    };
                    metrics.add_processing(&key, 1);
                    let outcome = handler.invoke(&event).await;
                    metrics.add_processing(&key, -1);
                    if !outcome.succeeded {
                        warn!(
                            consumer = idx,
                            key = %key,
                            document = %event.document_key,
                            error = %outcome.error.as_deref().unwrap_or("unknown"),
                            "handler invocation failed"
                        );
                        counter!("dispatch_failures_total", 1u64);
                    }
                    counter!("dispatch_invocations_total", 1u64);
                }
                Ok(None) => {
                    // Empty queue: poll again after a short sleep.
                    tokio::select! {
                        _ = cancel.changed() => break,
                        _ = tokio::time::sleep(cfg.poll_interval) => {}
                    }
                }
                Err(e) => {
                    warn!(consumer = idx, key = %key, error = %e, "lease dequeue failed");
                    tokio::select! {
                        _ = cancel.changed() => break,
                        _ = tokio::time::sleep(cfg.poll_interval) => {}
                    }
                }
            }
        }
        info!(consumer = idx, key = %key, "lease consumer stopped");
    })
}
