//! Rill core types: change events, scopes, metrics snapshots and the
//! collaborator contracts (feed client, change handler).

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque resume position for a change feed. Ordered by emission time on the
/// store side; the engine only stores and replays it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeToken(pub serde_json::Value);

impl ResumeToken {
    pub fn new(raw: serde_json::Value) -> Self {
        Self(raw)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Insert,
    Update,
    Replace,
    Delete,
}

/// A single observed change. Immutable once read off the cursor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Key of the changed document, used in diagnostics.
    pub document_key: String,
    pub operation: OperationKind,
    /// Full document after the change (update lookup shape).
    pub document: serde_json::Value,
    pub resume_token: ResumeToken,
}

/// Granularity at which a feed is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitorLevel {
    Collection,
    Database,
    Cluster,
}

/// Monitored scope: which database/collection (if any) the feed covers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceScope {
    pub database: Option<String>,
    pub collection: Option<String>,
}

impl SourceScope {
    pub fn cluster() -> Self {
        Self { database: None, collection: None }
    }

    pub fn database(db: impl Into<String>) -> Self {
        Self { database: Some(db.into()), collection: None }
    }

    pub fn collection(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self { database: Some(db.into()), collection: Some(coll.into()) }
    }

    /// Derive the monitor level from which names are present. A collection
    /// name without a database name is a configuration error.
    pub fn monitor_level(&self) -> Result<MonitorLevel, ConfigError> {
        match (&self.database, &self.collection) {
            (Some(_), Some(_)) => Ok(MonitorLevel::Collection),
            (Some(_), None) => Ok(MonitorLevel::Database),
            (None, None) => Ok(MonitorLevel::Cluster),
            (None, Some(_)) => Err(ConfigError::CollectionWithoutDatabase),
        }
    }

    /// Identity label used in metrics keys and log lines: empty segments for
    /// absent names, matching the `{database}-{collection}` convention.
    pub fn label(&self) -> String {
        format!(
            "{}-{}",
            self.database.as_deref().unwrap_or(""),
            self.collection.as_deref().unwrap_or("")
        )
    }
}

/// Which operation kinds a cursor should deliver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationFilter {
    pub include_deletes: bool,
}

impl OperationFilter {
    pub fn admits(&self, op: OperationKind) -> bool {
        match op {
            OperationKind::Insert | OperationKind::Update | OperationKind::Replace => true,
            OperationKind::Delete => self.include_deletes,
        }
    }
}

/// Point-in-time load snapshot for one (handler, scope) pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerMetrics {
    pub pending_events: i64,
    /// In-flight handler invocations. Only meaningful in direct mode.
    pub processing_events: i64,
    pub timestamp: DateTime<Utc>,
}

impl TriggerMetrics {
    pub fn at(pending_events: i64, processing_events: i64, timestamp: DateTime<Utc>) -> Self {
        Self { pending_events, processing_events, timestamp }
    }
}

/// Construction-time errors. These are operator mistakes and fail fast.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("handler id must not be empty")]
    MissingHandlerId,
    #[error("a collection name requires a database name")]
    CollectionWithoutDatabase,
    #[error("invalid config value: {0}")]
    InvalidValue(String),
}

/// Errors surfaced by the external feed client. All of these are treated as
/// transient by the listener and retried with backoff.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("opening cursor: {0}")]
    Open(String),
    #[error("reading cursor: {0}")]
    Read(String),
}

/// Live cursor over a change feed. `next_batch` may block until events arrive
/// and may return an empty batch; any error tears the cursor down.
#[async_trait::async_trait]
pub trait FeedCursor: Send {
    async fn next_batch(&mut self) -> Result<Vec<ChangeEvent>, FeedError>;
}

/// External data-store collaborator: opens resumable cursors at a given scope.
#[async_trait::async_trait]
pub trait FeedClient: Send + Sync {
    async fn open_cursor(
        &self,
        scope: &SourceScope,
        filter: OperationFilter,
        resume_from: Option<&ResumeToken>,
    ) -> Result<Box<dyn FeedCursor>, FeedError>;
}

/// Outcome of one handler invocation. `succeeded = false` is recoverable and
/// loggable, never a reason to stop ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerOutcome {
    pub succeeded: bool,
    pub error: Option<String>,
}

impl HandlerOutcome {
    pub fn ok() -> Self {
        Self { succeeded: true, error: None }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self { succeeded: false, error: Some(error.into()) }
    }
}

/// Downstream handler invoked once per delivered change event.
#[async_trait::async_trait]
pub trait ChangeHandler: Send + Sync {
    async fn invoke(&self, event: &ChangeEvent) -> HandlerOutcome;
}
