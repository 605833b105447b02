//! Rill lease queue: a collection-backed durable queue that decouples feed
//! reads from handler invocations. Records become visible to consumers only
//! after a successful durable write; dequeue-oldest is a single atomic
//! find-and-delete so no two consumers ever receive the same record.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use rill_core::{ChangeEvent, MonitorLevel, ResumeToken, SourceScope};

/// One durably stored, not-yet-processed change event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub id: Uuid,
    /// Event timestamp used for oldest-first ordering.
    pub timestamp: DateTime<Utc>,
    pub monitor_level: MonitorLevel,
    pub source_cluster: Option<String>,
    pub handler_id: String,
    pub source_database: Option<String>,
    pub source_collection: Option<String>,
    pub resume_token: ResumeToken,
    /// Serialized [`ChangeEvent`].
    pub change_event: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl LeaseRecord {
    pub fn for_event(
        handler_id: &str,
        scope: &SourceScope,
        level: MonitorLevel,
        event: &ChangeEvent,
    ) -> Result<Self, serde_json::Error> {
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4(),
            timestamp: now,
            monitor_level: level,
            source_cluster: None,
            handler_id: handler_id.to_string(),
            source_database: scope.database.clone(),
            source_collection: scope.collection.clone(),
            resume_token: event.resume_token.clone(),
            change_event: serde_json::to_value(event)?,
            created_at: now,
        })
    }

    pub fn event(&self) -> Result<ChangeEvent, serde_json::Error> {
        serde_json::from_value(self.change_event.clone())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    #[error("lease queue used before initialize()")]
    NotInitialized,
    #[error("lease backend: {0}")]
    Backend(String),
}

/// Storage backend for lease records. Implementations must make
/// `find_and_delete_oldest` atomic (find + delete as one operation);
/// the queue layers no application-level locking on top of it.
#[async_trait::async_trait]
pub trait LeaseBackend: Send + Sync {
    /// Create the supporting indexes: `(timestamp, handler)` and
    /// `(handler, scope, timestamp)`.
    async fn create_indexes(&self) -> Result<(), LeaseError>;

    async fn insert(&self, record: LeaseRecord) -> Result<(), LeaseError>;

    /// Atomically remove and return the oldest record for the key, by
    /// ascending timestamp. `None` when the queue is empty.
    async fn find_and_delete_oldest(
        &self,
        handler_id: &str,
        scope: &SourceScope,
    ) -> Result<Option<LeaseRecord>, LeaseError>;

    async fn count(&self, handler_id: &str, scope: &SourceScope) -> Result<i64, LeaseError>;
}

/// Durable queue over a [`LeaseBackend`], with a mutex-gated idempotent
/// initialize. Every other operation fails with `NotInitialized` until one
/// `initialize` call has completed.
pub struct LeaseQueue {
    backend: Arc<dyn LeaseBackend>,
    initialized: AtomicBool,
    init_gate: tokio::sync::Mutex<()>,
}

impl LeaseQueue {
    pub fn new(backend: Arc<dyn LeaseBackend>) -> Self {
        Self { backend, initialized: AtomicBool::new(false), init_gate: tokio::sync::Mutex::new(()) }
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Idempotent and safe under concurrent first-call races: a single winner
    /// performs setup, the rest wait on the gate and then proceed. Index
    /// creation failure is logged and swallowed; the store stays usable,
    /// just slower.
    pub async fn initialize(&self) -> Result<(), LeaseError> {
        if self.is_initialized() {
            return Ok(());
        }
        let _gate = self.init_gate.lock().await;
        if self.is_initialized() {
            return Ok(());
        }
        match self.backend.create_indexes().await {
            Ok(()) => info!("lease queue initialized with indexes"),
            Err(e) => warn!(error = %e, "lease index creation failed; continuing without"),
        }
        self.initialized.store(true, Ordering::Release);
        Ok(())
    }

    pub async fn enqueue(&self, record: LeaseRecord) -> Result<(), LeaseError> {
        self.ensure_initialized()?;
        self.backend.insert(record).await?;
        counter!("lease_enqueue_total", 1u64);
        Ok(())
    }

    pub async fn dequeue_oldest(
        &self,
        handler_id: &str,
        scope: &SourceScope,
    ) -> Result<Option<LeaseRecord>, LeaseError> {
        self.ensure_initialized()?;
        let rec = self.backend.find_and_delete_oldest(handler_id, scope).await?;
        if let Some(r) = &rec {
            debug!(handler = %handler_id, lease = %r.id, "lease dequeued");
            counter!("lease_dequeue_total", 1u64);
        }
        Ok(rec)
    }

    pub async fn count_pending(
        &self,
        handler_id: &str,
        scope: &SourceScope,
    ) -> Result<i64, LeaseError> {
        self.ensure_initialized()?;
        self.backend.count(handler_id, scope).await
    }

    fn ensure_initialized(&self) -> Result<(), LeaseError> {
        if self.is_initialized() {
            Ok(())
        } else {
            Err(LeaseError::NotInitialized)
        }
    }
}

// ---- In-memory backend ----

struct MemoryInner {
    seq: u64,
    records: Vec<(u64, LeaseRecord)>,
}

/// In-memory [`LeaseBackend`] with the same atomicity contract, for tests and
/// single-process deployments. Ties on equal timestamps break by insertion
/// order.
pub struct MemoryLeaseBackend {
    inner: std::sync::Mutex<MemoryInner>,
    index_builds: AtomicUsize,
    fail_indexes: bool,
}

impl MemoryLeaseBackend {
    pub fn new() -> Self {
        Self {
            inner: std::sync::Mutex::new(MemoryInner { seq: 0, records: Vec::new() }),
            index_builds: AtomicUsize::new(0),
            fail_indexes: false,
        }
    }

    /// Backend whose index creation always fails, for exercising the
    /// non-fatal initialize path.
    pub fn with_failing_indexes() -> Self {
        Self { fail_indexes: true, ..Self::new() }
    }

    /// How many times `create_indexes` has been attempted.
    pub fn index_builds(&self) -> usize {
        self.index_builds.load(Ordering::SeqCst)
    }

    fn matches(record: &LeaseRecord, handler_id: &str, scope: &SourceScope) -> bool {
        record.handler_id == handler_id
            && record.source_database == scope.database
            && record.source_collection == scope.collection
    }
}

impl Default for MemoryLeaseBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl LeaseBackend for MemoryLeaseBackend {
    async fn create_indexes(&self) -> Result<(), LeaseError> {
        self.index_builds.fetch_add(1, Ordering::SeqCst);
        if self.fail_indexes {
            return Err(LeaseError::Backend("index creation rejected".into()));
        }
        Ok(())
    }

    async fn insert(&self, record: LeaseRecord) -> Result<(), LeaseError> {
        let mut inner = self.inner.lock().expect("lease backend poisoned");
        let seq = inner.seq;
        inner.seq += 1;
        inner.records.push((seq, record));
        Ok(())
    }

    async fn find_and_delete_oldest(
        &self,
        handler_id: &str,
        scope: &SourceScope,
    ) -> Result<Option<LeaseRecord>, LeaseError> {
        let mut inner = self.inner.lock().expect("lease backend poisoned");
        let oldest = inner
            .records
            .iter()
            .enumerate()
            .filter(|(_, (_, r))| Self::matches(r, handler_id, scope))
            .min_by_key(|(_, (seq, r))| (r.timestamp, *seq))
            .map(|(idx, _)| idx);
        Ok(oldest.map(|idx| inner.records.remove(idx).1))
    }

    async fn count(&self, handler_id: &str, scope: &SourceScope) -> Result<i64, LeaseError> {
        let inner = self.inner.lock().expect("lease backend poisoned");
        Ok(inner.records.iter().filter(|(_, r)| Self::matches(r, handler_id, scope)).count() as i64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rill_core::{ChangeEvent, OperationKind};
    use std::collections::HashSet;

    fn scope() -> SourceScope {
        SourceScope::collection("db", "coll")
    }

    fn event(n: u32) -> ChangeEvent {
        ChangeEvent {
            document_key: format!("doc-{n}"),
            operation: OperationKind::Insert,
            document: serde_json::json!({ "n": n }),
            resume_token: ResumeToken::new(serde_json::json!({ "pos": n })),
        }
    }

    fn record(n: u32) -> LeaseRecord {
        LeaseRecord::for_event("fn", &scope(), MonitorLevel::Collection, &event(n)).unwrap()
    }

    #[tokio::test]
    async fn initialize_is_idempotent_under_concurrency() {
        let backend = Arc::new(MemoryLeaseBackend::new());
        let queue = Arc::new(LeaseQueue::new(Arc::clone(&backend) as Arc<dyn LeaseBackend>));
        let barrier = Arc::new(tokio::sync::Barrier::new(8));
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let q = Arc::clone(&queue);
            let b = Arc::clone(&barrier);
            tasks.push(tokio::spawn(async move {
                b.wait().await;
                q.initialize().await
            }));
        }
        for t in tasks {
            t.await.unwrap().unwrap();
        }
        assert_eq!(backend.index_builds(), 1);
        assert!(queue.is_initialized());
    }

    #[tokio::test]
    async fn operations_fail_before_initialize() {
        let queue = LeaseQueue::new(Arc::new(MemoryLeaseBackend::new()));
        assert!(matches!(queue.enqueue(record(1)).await, Err(LeaseError::NotInitialized)));
        assert!(matches!(
            queue.dequeue_oldest("fn", &scope()).await,
            Err(LeaseError::NotInitialized)
        ));
        assert!(matches!(
            queue.count_pending("fn", &scope()).await,
            Err(LeaseError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn index_failure_is_non_fatal() {
        let queue = LeaseQueue::new(Arc::new(MemoryLeaseBackend::with_failing_indexes()));
        queue.initialize().await.unwrap();
        queue.enqueue(record(1)).await.unwrap();
        assert_eq!(queue.count_pending("fn", &scope()).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn dequeue_returns_oldest_first() {
        let queue = LeaseQueue::new(Arc::new(MemoryLeaseBackend::new()));
        queue.initialize().await.unwrap();
        let mut first = record(1);
        let mut second = record(2);
        first.timestamp = Utc::now() - chrono::Duration::seconds(10);
        second.timestamp = Utc::now();
        // Insert newest first to prove ordering is by timestamp, not arrival.
        queue.enqueue(second.clone()).await.unwrap();
        queue.enqueue(first.clone()).await.unwrap();
        let got = queue.dequeue_oldest("fn", &scope()).await.unwrap().unwrap();
        assert_eq!(got.id, first.id);
        let got = queue.dequeue_oldest("fn", &scope()).await.unwrap().unwrap();
        assert_eq!(got.id, second.id);
        assert!(queue.dequeue_oldest("fn", &scope()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_dequeue_never_duplicates() {
        let queue = Arc::new(LeaseQueue::new(Arc::new(MemoryLeaseBackend::new())));
        queue.initialize().await.unwrap();
        for n in 0..3 {
            queue.enqueue(record(n)).await.unwrap();
        }
        let barrier = Arc::new(tokio::sync::Barrier::new(8));
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let q = Arc::clone(&queue);
            let b = Arc::clone(&barrier);
            tasks.push(tokio::spawn(async move {
                b.wait().await;
                q.dequeue_oldest("fn", &scope()).await.unwrap()
            }));
        }
        let mut ids = HashSet::new();
        let mut empties = 0usize;
        for t in tasks {
            match t.await.unwrap() {
                Some(r) => {
                    assert!(ids.insert(r.id), "record dequeued twice");
                }
                None => empties += 1,
            }
        }
        assert_eq!(ids.len(), 3);
        assert_eq!(empties, 5);
    }

    #[tokio::test]
    async fn scoped_records_do_not_cross_keys() {
        let queue = LeaseQueue::new(Arc::new(MemoryLeaseBackend::new()));
        queue.initialize().await.unwrap();
        queue.enqueue(record(1)).await.unwrap();
        let other = SourceScope::collection("db", "other");
        assert_eq!(queue.count_pending("fn", &other).await.unwrap(), 0);
        assert!(queue.dequeue_oldest("fn", &other).await.unwrap().is_none());
        assert_eq!(queue.count_pending("fn", &scope()).await.unwrap(), 1);
    }
}
