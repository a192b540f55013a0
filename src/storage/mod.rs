//! Resource storage
//!
//! Durable, queryable persistence for discovered Pub/Sub resources.
//!
//! # Module Structure
//!
//! - [`Store`] - the storage contract used by the collector and graph builder
//! - [`sqlite`] - SQLite implementation (WAL mode, pooled connections)
//!
//! Topics and subscriptions are keyed by their full resource name, so saving
//! the same resource twice overwrites it in place. Every save also upserts the
//! owning project's bookkeeping row inside the same transaction.

pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use sqlite::SqliteStore;

/// Placeholder metadata written until richer resource details are collected.
pub const EMPTY_METADATA: &str = "{}";

/// A Pub/Sub topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Topic {
    /// Storage-assigned ID (0 until persisted)
    pub id: i64,
    pub name: String,
    pub project_id: String,
    /// `projects/{project}/topics/{name}`, globally unique
    pub full_resource_name: String,
    /// JSON-encoded metadata
    pub metadata: String,
    pub last_synced: Option<DateTime<Utc>>,
}

impl Topic {
    pub fn new(name: &str, project_id: &str, full_resource_name: &str) -> Self {
        Self {
            id: 0,
            name: name.to_string(),
            project_id: project_id.to_string(),
            full_resource_name: full_resource_name.to_string(),
            metadata: EMPTY_METADATA.to_string(),
            last_synced: None,
        }
    }

    pub fn with_metadata(mut self, metadata: impl Into<String>) -> Self {
        self.metadata = metadata.into();
        self
    }
}

/// A Pub/Sub subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subscription {
    pub id: i64,
    pub name: String,
    pub project_id: String,
    /// Topic this subscription reads from. May live in another project and
    /// may not exist in the store at all.
    pub topic_full_resource_name: String,
    pub full_resource_name: String,
    pub metadata: String,
    pub last_synced: Option<DateTime<Utc>>,
}

impl Subscription {
    pub fn new(
        name: &str,
        project_id: &str,
        topic_full_resource_name: &str,
        full_resource_name: &str,
    ) -> Self {
        Self {
            id: 0,
            name: name.to_string(),
            project_id: project_id.to_string(),
            topic_full_resource_name: topic_full_resource_name.to_string(),
            full_resource_name: full_resource_name.to_string(),
            metadata: EMPTY_METADATA.to_string(),
            last_synced: None,
        }
    }

    pub fn with_metadata(mut self, metadata: impl Into<String>) -> Self {
        self.metadata = metadata.into();
        self
    }
}

/// Sync bookkeeping for one project
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectRecord {
    pub project_id: String,
    /// Last fully successful collection; `None` when resources were saved but
    /// no collection has completed yet
    pub last_synced: Option<DateTime<Utc>>,
}

impl ProjectRecord {
    /// True when the last sync happened more than `max_age` ago, or never.
    pub fn is_older_than(&self, max_age: chrono::Duration, now: DateTime<Utc>) -> bool {
        self.last_synced.map_or(true, |synced| now - synced > max_age)
    }
}

/// Storage-layer failure
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("storage task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("storage operation cancelled")]
    Cancelled,

    #[error("store is closed")]
    Closed,
}

impl StoreError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Storage contract for collected resources.
///
/// Implementations must be safe to call from many collector tasks at once and
/// must apply each save atomically together with its project row.
#[async_trait]
pub trait Store: Send + Sync {
    /// Upsert a topic by full resource name, touching its project.
    async fn save_topic(&self, cancel: &CancellationToken, topic: &Topic) -> StoreResult<()>;

    /// Upsert a subscription by full resource name, touching its project.
    /// The referenced topic does not need to exist.
    async fn save_subscription(
        &self,
        cancel: &CancellationToken,
        subscription: &Subscription,
    ) -> StoreResult<()>;

    async fn get_topics(&self, cancel: &CancellationToken, project_id: &str)
        -> StoreResult<Vec<Topic>>;

    async fn get_subscriptions(
        &self,
        cancel: &CancellationToken,
        project_id: &str,
    ) -> StoreResult<Vec<Subscription>>;

    /// Topics for the listed projects, or for every project when `projects`
    /// is empty.
    async fn get_all_topics(
        &self,
        cancel: &CancellationToken,
        projects: &[String],
    ) -> StoreResult<Vec<Topic>>;

    /// Subscriptions for the listed projects, or for every project when
    /// `projects` is empty.
    async fn get_all_subscriptions(
        &self,
        cancel: &CancellationToken,
        projects: &[String],
    ) -> StoreResult<Vec<Subscription>>;

    /// Distinct project IDs known to the store, sorted.
    async fn get_all_projects(&self, cancel: &CancellationToken) -> StoreResult<Vec<String>>;

    /// Project bookkeeping rows, sorted by project ID.
    async fn get_project_records(
        &self,
        cancel: &CancellationToken,
    ) -> StoreResult<Vec<ProjectRecord>>;

    /// Record that a project was scanned, even if it held no resources.
    async fn update_project_sync_time(
        &self,
        cancel: &CancellationToken,
        project_id: &str,
    ) -> StoreResult<()>;

    /// Release underlying resources.
    fn close(&self) -> StoreResult<()>;
}
