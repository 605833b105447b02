//! Change-feed listener: owns the feed cursor and the reconnect/backoff
//! protocol, delivering events either straight to the bounded dispatcher
//! (direct mode) or into the durable lease queue (durable mode).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use metrics::counter;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use rill_core::{
    ChangeEvent, ChangeHandler, ConfigError, FeedClient, FeedCursor, MonitorLevel,
    OperationFilter, SourceScope,
};
use rill_lease::LeaseQueue;
use rill_metrics::{MetricsKey, MetricsStore};

use crate::dispatch::BoundedDispatcher;
use crate::durable::{run_consumer, DurableDelivery};
use crate::tracker::ResumeTracker;

#[derive(Debug, Clone)]
pub struct ListenerConfig {
    pub scope: SourceScope,
    pub handler_id: String,
    /// Widen the cursor filter beyond insert/update/replace.
    pub include_deletes: bool,
    /// Max in-flight handler invocations in direct mode.
    pub dispatcher_capacity: usize,
    /// Durable-mode consumer pool size.
    pub consumer_count: usize,
    /// Durable-mode sleep between polls of an empty queue.
    pub poll_interval: Duration,
    /// Retries for a single durable write before the event is skipped.
    pub write_retry_budget: u32,
    /// First delay of the per-write retry backoff.
    pub write_retry_backoff: Duration,
    /// Reconnect backoff: seed delay, doubling up to the cap.
    pub backoff_seed: Duration,
    pub backoff_cap: Duration,
}

impl ListenerConfig {
    pub fn new(scope: SourceScope, handler_id: impl Into<String>) -> Self {
        Self {
            scope,
            handler_id: handler_id.into(),
            include_deletes: false,
            dispatcher_capacity: 32,
            consumer_count: 4,
            poll_interval: Duration::from_millis(1000),
            write_retry_budget: 5,
            write_retry_backoff: Duration::from_millis(200),
            backoff_seed: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(300),
        }
    }

    fn validate(&self) -> Result<MonitorLevel, ConfigError> {
        if self.handler_id.is_empty() {
            return Err(ConfigError::MissingHandlerId);
        }
        self.scope.monitor_level()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Lifecycle: `Created -> Starting -> Running -> Stopping -> Stopped`, with
/// the reconnect sub-loop living inside `Running`. `stop` is idempotent and
/// drains all in-flight handler invocations before returning.
pub struct ChangeFeedListener {
    client: Arc<dyn FeedClient>,
    handler: Arc<dyn ChangeHandler>,
    metrics: Arc<MetricsStore>,
    lease: Option<Arc<LeaseQueue>>,
    dispatcher: Option<Arc<BoundedDispatcher>>,
    cfg: ListenerConfig,
    level: MonitorLevel,
    key: MetricsKey,
    tracker: Arc<ResumeTracker>,
    cancel_tx: watch::Sender<bool>,
    state: Mutex<ListenerState>,
    tasks: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl ChangeFeedListener {
    /// Direct mode: cursor -> bounded dispatcher.
    pub fn new(
        client: Arc<dyn FeedClient>,
        handler: Arc<dyn ChangeHandler>,
        metrics: Arc<MetricsStore>,
        cfg: ListenerConfig,
    ) -> Result<Self, ConfigError> {
        Self::build(client, handler, metrics, None, cfg)
    }

    /// Durable mode: cursor -> lease queue, drained by a consumer pool.
    pub fn with_lease_queue(
        client: Arc<dyn FeedClient>,
        handler: Arc<dyn ChangeHandler>,
        metrics: Arc<MetricsStore>,
        lease: Arc<LeaseQueue>,
        cfg: ListenerConfig,
    ) -> Result<Self, ConfigError> {
        Self::build(client, handler, metrics, Some(lease), cfg)
    }

    fn build(
        client: Arc<dyn FeedClient>,
        handler: Arc<dyn ChangeHandler>,
        metrics: Arc<MetricsStore>,
        lease: Option<Arc<LeaseQueue>>,
        cfg: ListenerConfig,
    ) -> Result<Self, ConfigError> {
        let level = cfg.validate()?;
        let key = MetricsKey::new(&cfg.handler_id, &cfg.scope);
        let dispatcher = if lease.is_none() {
            Some(Arc::new(BoundedDispatcher::new(
                Arc::clone(&handler),
                Arc::clone(&metrics),
                key.clone(),
                cfg.dispatcher_capacity,
            )))
        } else {
            None
        };
        let (cancel_tx, _) = watch::channel(false);
        Ok(Self {
            client,
            handler,
            metrics,
            lease,
            dispatcher,
            cfg,
            level,
            key,
            tracker: Arc::new(ResumeTracker::new()),
            cancel_tx,
            state: Mutex::new(ListenerState::Created),
            tasks: tokio::sync::Mutex::new(Vec::new()),
        })
    }

    pub fn state(&self) -> ListenerState {
        *self.state.lock().expect("listener state poisoned")
    }

    pub fn monitor_level(&self) -> MonitorLevel {
        self.level
    }

    fn set_state(&self, next: ListenerState) {
        *self.state.lock().expect("listener state poisoned") = next;
    }

    fn filter(&self) -> OperationFilter {
        OperationFilter { include_deletes: self.cfg.include_deletes }
    }

    /// Open the feed and launch the delivery tasks. Fails fast on cursor-open
    /// or (durable mode) queue-initialization errors.
    pub async fn start(&self) -> Result<()> {
        {
            let mut state = self.state.lock().expect("listener state poisoned");
            if *state != ListenerState::Created {
                bail!("listener already started (state {:?})", *state);
            }
            *state = ListenerState::Starting;
        }

        let startup = self.launch().await;
        match startup {
            Ok(()) => {
                self.set_state(ListenerState::Running);
                info!(
                    key = %self.key,
                    level = ?self.level,
                    durable = self.lease.is_some(),
                    "change feed listener started"
                );
                Ok(())
            }
            Err(e) => {
                self.set_state(ListenerState::Created);
                error!(key = %self.key, error = %e, "starting the listener failed");
                Err(e)
            }
        }
    }

    async fn launch(&self) -> Result<()> {
        let cursor = self
            .client
            .open_cursor(&self.cfg.scope, self.filter(), None)
            .await
            .context("opening change feed cursor")?;

        let mut tasks = self.tasks.lock().await;
        match &self.lease {
            Some(lease) => {
                // The queue must be ready before the first durable write.
                lease.initialize().await.context("initializing lease queue")?;
                let delivery = DurableDelivery::new(
                    Arc::clone(lease),
                    self.cfg.clone(),
                    self.level,
                );
                tasks.push(self.spawn_pump(cursor, delivery));
                for idx in 0..self.cfg.consumer_count.max(1) {
                    tasks.push(run_consumer(
                        idx,
                        Arc::clone(lease),
                        Arc::clone(&self.handler),
                        Arc::clone(&self.metrics),
                        self.key.clone(),
                        self.cfg.clone(),
                        self.cancel_tx.subscribe(),
                    ));
                }
            }
            None => {
                let dispatcher =
                    Arc::clone(self.dispatcher.as_ref().expect("direct mode has a dispatcher"));
                tasks.push(self.spawn_pump(cursor, DirectDelivery { dispatcher }));
            }
        }
        Ok(())
    }

    fn spawn_pump<D: Deliver + 'static>(
        &self,
        cursor: Box<dyn FeedCursor>,
        delivery: D,
    ) -> JoinHandle<()> {
        let client = Arc::clone(&self.client);
        let tracker = Arc::clone(&self.tracker);
        let scope = self.cfg.scope.clone();
        let filter = self.filter();
        let seed = self.cfg.backoff_seed;
        let cap = self.cfg.backoff_cap;
        let cancel = self.cancel_tx.subscribe();
        tokio::spawn(async move {
            pump_feed(client, scope, filter, seed, cap, tracker, cancel, cursor, delivery).await;
        })
    }

    /// Signal cancellation, wait for every loop to exit and every in-flight
    /// handler invocation to finish. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.lock().expect("listener state poisoned");
            match *state {
                ListenerState::Stopped | ListenerState::Stopping => return Ok(()),
                ListenerState::Created => {
                    *state = ListenerState::Stopped;
                    return Ok(());
                }
                _ => *state = ListenerState::Stopping,
            }
        }

        let _ = self.cancel_tx.send(true);
        let tasks = {
            let mut tasks = self.tasks.lock().await;
            std::mem::take(&mut *tasks)
        };
        for task in tasks {
            if let Err(e) = task.await {
                warn!(key = %self.key, error = %e, "listener task ended abnormally");
            }
        }
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.drain().await;
        }
        self.set_state(ListenerState::Stopped);
        info!(key = %self.key, "change feed listener stopped");
        Ok(())
    }
}

/// Delivery seam between the shared feed pump and the two modes.
/// Returns `false` when cancellation interrupted the delivery.
#[async_trait::async_trait]
pub(crate) trait Deliver: Send {
    async fn deliver(&self, event: ChangeEvent, cancel: &mut watch::Receiver<bool>) -> bool;
}

struct DirectDelivery {
    dispatcher: Arc<BoundedDispatcher>,
}

#[async_trait::async_trait]
impl Deliver for DirectDelivery {
    async fn deliver(&self, event: ChangeEvent, cancel: &mut watch::Receiver<bool>) -> bool {
        // Submission blocks while the pool is saturated; that back-pressure
        // is what throttles the read loop.
        tokio::select! {
            _ = cancel.changed() => false,
            _ = self.dispatcher.submit(event) => true,
        }
    }
}

/// Shared read loop: read batches in feed order, deliver each event, record
/// its resume token, and on any feed error back off exponentially and reopen
/// the cursor from the last recorded token. Every wait observes cancellation.
#[allow(clippy::too_many_arguments)]
async fn pump_feed<D: Deliver>(
    client: Arc<dyn FeedClient>,
    scope: SourceScope,
    filter: OperationFilter,
    backoff_seed: Duration,
    backoff_cap: Duration,
    tracker: Arc<ResumeTracker>,
    mut cancel: watch::Receiver<bool>,
    mut cursor: Box<dyn FeedCursor>,
    delivery: D,
) {
    let mut delay = backoff_seed;
    debug!(scope = %scope.label(), "feed pump started");
    'pump: while !*cancel.borrow() {
        let batch = tokio::select! {
            _ = cancel.changed() => break 'pump,
            batch = cursor.next_batch() => batch,
        };
        match batch {
            Ok(events) => {
                for event in events {
                    let token = event.resume_token.clone();
                    if !delivery.deliver(event, &mut cancel).await {
                        break 'pump;
                    }
                    // Recorded only after the event was handed off, so a
                    // crash redelivers rather than skips (at-least-once).
                    tracker.record(token);
                }
                delay = backoff_seed;
            }
            Err(e) => {
                warn!(
                    scope = %scope.label(),
                    error = %e,
                    retry_in = ?delay,
                    "change feed error; backing off"
                );
                tokio::select! {
                    _ = cancel.changed() => break 'pump,
                    _ = tokio::time::sleep(delay) => {}
                }
                delay = (delay * 2).min(backoff_cap);

                let resume = tracker.current();
                counter!("feed_reconnects_total", 1u64);
                match client.open_cursor(&scope, filter, resume.as_ref()).await {
                    Ok(next) => {
                        info!(
                            scope = %scope.label(),
                            resumed = resume.is_some(),
                            "reconnected to change feed"
                        );
                        cursor = next;
                        delay = backoff_seed;
                    }
                    Err(e) => {
                        error!(scope = %scope.label(), error = %e, "reconnect failed; will retry");
                    }
                }
            }
        }
    }
    debug!(scope = %scope.label(), "feed pump stopped");
}
