//! SQLite Store
//!
//! Connection-pooled SQLite backend:
//! - WAL journal so concurrent collector writes don't block each other for long
//! - One transaction per save covering the resource and its project row
//! - Blocking database work runs on tokio's blocking pool

use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, params_from_iter, Connection, Row};
use tokio_util::sync::CancellationToken;

use super::{ProjectRecord, Store, StoreError, StoreResult, Subscription, Topic};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS projects (
    project_id TEXT PRIMARY KEY,
    last_synced TIMESTAMP
);

CREATE TABLE IF NOT EXISTS topics (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    project_id TEXT NOT NULL,
    full_resource_name TEXT NOT NULL UNIQUE,
    metadata TEXT NOT NULL DEFAULT '{}',
    last_synced TIMESTAMP NOT NULL
);

CREATE TABLE IF NOT EXISTS subscriptions (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    project_id TEXT NOT NULL,
    topic_full_resource_name TEXT NOT NULL,
    full_resource_name TEXT NOT NULL UNIQUE,
    metadata TEXT NOT NULL DEFAULT '{}',
    last_synced TIMESTAMP NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_subs_topic ON subscriptions(topic_full_resource_name);
CREATE INDEX IF NOT EXISTS idx_topics_project ON topics(project_id);
CREATE INDEX IF NOT EXISTS idx_subs_project ON subscriptions(project_id);
"#;

const UPSERT_PROJECT: &str = "
    INSERT INTO projects (project_id, last_synced) VALUES (?1, ?2)
    ON CONFLICT(project_id) DO UPDATE SET last_synced = excluded.last_synced";

/// Registers the project without touching its sync time
const TOUCH_PROJECT: &str = "
    INSERT INTO projects (project_id) VALUES (?1)
    ON CONFLICT(project_id) DO NOTHING";

const UPSERT_TOPIC: &str = "
    INSERT INTO topics (name, project_id, full_resource_name, metadata, last_synced)
    VALUES (?1, ?2, ?3, ?4, ?5)
    ON CONFLICT(full_resource_name) DO UPDATE SET
        name = excluded.name,
        project_id = excluded.project_id,
        metadata = excluded.metadata,
        last_synced = excluded.last_synced";

const UPSERT_SUBSCRIPTION: &str = "
    INSERT INTO subscriptions
        (name, project_id, topic_full_resource_name, full_resource_name, metadata, last_synced)
    VALUES (?1, ?2, ?3, ?4, ?5, ?6)
    ON CONFLICT(full_resource_name) DO UPDATE SET
        name = excluded.name,
        project_id = excluded.project_id,
        topic_full_resource_name = excluded.topic_full_resource_name,
        metadata = excluded.metadata,
        last_synced = excluded.last_synced";

const TOPIC_COLUMNS: &str = "id, name, project_id, full_resource_name, metadata, last_synced";
const SUBSCRIPTION_COLUMNS: &str =
    "id, name, project_id, topic_full_resource_name, full_resource_name, metadata, last_synced";

/// SQLite's default host-parameter limit is 999 on older builds.
const MAX_PARAMS_PER_QUERY: usize = 500;

/// Connection pool sizing
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_size: u32,
    pub connection_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|p| p.get() as u32)
            .unwrap_or(4);
        Self {
            max_size: (cores * 2).clamp(4, 16),
            connection_timeout: Duration::from_secs(30),
        }
    }
}

/// SQLite-backed [`Store`]
pub struct SqliteStore {
    pool: Mutex<Option<Pool<SqliteConnectionManager>>>,
}

impl SqliteStore {
    /// Open (or create) a database file, creating parent directories.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        Self::open_with_config(path, PoolConfig::default())
    }

    pub fn open_with_config<P: AsRef<Path>>(path: P, config: PoolConfig) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let manager = SqliteConnectionManager::file(path).with_init(configure_connection);
        let pool = Pool::builder()
            .max_size(config.max_size)
            .connection_timeout(config.connection_timeout)
            .build(manager)?;

        tracing::debug!("Opened SQLite store at {}", path.display());
        Self::initialize(pool)
    }

    /// In-memory database. Limited to a single connection, since every
    /// connection to `:memory:` is a separate database.
    pub fn open_in_memory() -> StoreResult<Self> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder().max_size(1).build(manager)?;
        Self::initialize(pool)
    }

    fn initialize(pool: Pool<SqliteConnectionManager>) -> StoreResult<Self> {
        pool.get()?.execute_batch(SCHEMA)?;
        Ok(Self {
            pool: Mutex::new(Some(pool)),
        })
    }

    fn pool(&self) -> StoreResult<Pool<SqliteConnectionManager>> {
        self.pool
            .lock()
            .map_err(|_| StoreError::Closed)?
            .clone()
            .ok_or(StoreError::Closed)
    }

    /// Run `op` on a pooled connection on the blocking thread pool.
    ///
    /// Cancellation stops the wait, not the blocking task: a write already
    /// handed to the pool can still commit after this returns
    /// [`StoreError::Cancelled`]. Every write is an idempotent upsert, so
    /// redoing it on the next run is harmless.
    async fn run<T, F>(&self, cancel: &CancellationToken, op: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }
        let pool = self.pool()?;
        let task = tokio::task::spawn_blocking(move || {
            let mut conn = pool.get()?;
            op(&mut conn)
        });

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(StoreError::Cancelled),
            joined = task => joined?,
        }
    }
}

fn configure_connection(conn: &mut Connection) -> Result<(), rusqlite::Error> {
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        tracing::warn!("SQLite refused WAL journal mode, using {}", mode);
    }
    conn.execute_batch(
        "PRAGMA synchronous = NORMAL;
         PRAGMA busy_timeout = 5000;",
    )?;
    Ok(())
}

fn map_topic(row: &Row<'_>) -> rusqlite::Result<Topic> {
    Ok(Topic {
        id: row.get(0)?,
        name: row.get(1)?,
        project_id: row.get(2)?,
        full_resource_name: row.get(3)?,
        metadata: row.get(4)?,
        last_synced: row.get::<_, Option<DateTime<Utc>>>(5)?,
    })
}

fn map_subscription(row: &Row<'_>) -> rusqlite::Result<Subscription> {
    Ok(Subscription {
        id: row.get(0)?,
        name: row.get(1)?,
        project_id: row.get(2)?,
        topic_full_resource_name: row.get(3)?,
        full_resource_name: row.get(4)?,
        metadata: row.get(5)?,
        last_synced: row.get::<_, Option<DateTime<Utc>>>(6)?,
    })
}

/// Select rows from `table`, either everything or those whose project is in
/// `projects`, querying in chunks to stay under the parameter limit.
fn select_by_projects<T>(
    conn: &Connection,
    table: &str,
    columns: &str,
    projects: &[String],
    map: fn(&Row<'_>) -> rusqlite::Result<T>,
) -> StoreResult<Vec<T>> {
    if projects.is_empty() {
        let mut stmt = conn.prepare(&format!("SELECT {columns} FROM {table}"))?;
        let rows = stmt.query_map([], map)?;
        return Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?);
    }

    let mut out = Vec::new();
    for chunk in projects.chunks(MAX_PARAMS_PER_QUERY) {
        let placeholders = vec!["?"; chunk.len()].join(",");
        let sql = format!("SELECT {columns} FROM {table} WHERE project_id IN ({placeholders})");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(chunk.iter()), map)?;
        for row in rows {
            out.push(row?);
        }
    }
    Ok(out)
}

#[async_trait]
impl Store for SqliteStore {
    async fn save_topic(&self, cancel: &CancellationToken, topic: &Topic) -> StoreResult<()> {
        let topic = topic.clone();
        self.run(cancel, move |conn| {
            let now = Utc::now();
            let tx = conn.transaction()?;
            tx.execute(TOUCH_PROJECT, [&topic.project_id])?;
            tx.execute(
                UPSERT_TOPIC,
                params![
                    topic.name,
                    topic.project_id,
                    topic.full_resource_name,
                    topic.metadata,
                    now
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn save_subscription(
        &self,
        cancel: &CancellationToken,
        subscription: &Subscription,
    ) -> StoreResult<()> {
        let sub = subscription.clone();
        self.run(cancel, move |conn| {
            let now = Utc::now();
            let tx = conn.transaction()?;
            tx.execute(TOUCH_PROJECT, [&sub.project_id])?;
            tx.execute(
                UPSERT_SUBSCRIPTION,
                params![
                    sub.name,
                    sub.project_id,
                    sub.topic_full_resource_name,
                    sub.full_resource_name,
                    sub.metadata,
                    now
                ],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn get_topics(
        &self,
        cancel: &CancellationToken,
        project_id: &str,
    ) -> StoreResult<Vec<Topic>> {
        let project_id = project_id.to_string();
        self.run(cancel, move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TOPIC_COLUMNS} FROM topics WHERE project_id = ?1"
            ))?;
            let rows = stmt.query_map([project_id], map_topic)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn get_subscriptions(
        &self,
        cancel: &CancellationToken,
        project_id: &str,
    ) -> StoreResult<Vec<Subscription>> {
        let project_id = project_id.to_string();
        self.run(cancel, move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE project_id = ?1"
            ))?;
            let rows = stmt.query_map([project_id], map_subscription)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn get_all_topics(
        &self,
        cancel: &CancellationToken,
        projects: &[String],
    ) -> StoreResult<Vec<Topic>> {
        let projects = projects.to_vec();
        self.run(cancel, move |conn| {
            select_by_projects(conn, "topics", TOPIC_COLUMNS, &projects, map_topic)
        })
        .await
    }

    async fn get_all_subscriptions(
        &self,
        cancel: &CancellationToken,
        projects: &[String],
    ) -> StoreResult<Vec<Subscription>> {
        let projects = projects.to_vec();
        self.run(cancel, move |conn| {
            select_by_projects(
                conn,
                "subscriptions",
                SUBSCRIPTION_COLUMNS,
                &projects,
                map_subscription,
            )
        })
        .await
    }

    async fn get_all_projects(&self, cancel: &CancellationToken) -> StoreResult<Vec<String>> {
        self.run(cancel, |conn| {
            let mut stmt =
                conn.prepare("SELECT DISTINCT project_id FROM projects ORDER BY project_id")?;
            let rows = stmt.query_map([], |row| row.get(0))?;
            Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
        })
        .await
    }

    async fn get_project_records(
        &self,
        cancel: &CancellationToken,
    ) -> StoreResult<Vec<ProjectRecord>> {
        self.run(cancel, |conn| {
            let mut stmt =
                conn.prepare("SELECT project_id, last_synced FROM projects ORDER BY project_id")?;
            let rows = stmt.query_map([], |row| {
                Ok(ProjectRecord {
                    project_id: row.get(0)?,
                    last_synced: row.get(1)?,
                })
            })?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
        .await
    }

    async fn update_project_sync_time(
        &self,
        cancel: &CancellationToken,
        project_id: &str,
    ) -> StoreResult<()> {
        let project_id = project_id.to_string();
        self.run(cancel, move |conn| {
            conn.execute(UPSERT_PROJECT, params![project_id, Utc::now()])?;
            Ok(())
        })
        .await
    }

    fn close(&self) -> StoreResult<()> {
        let pool = self
            .pool
            .lock()
            .map_err(|_| StoreError::Closed)?
            .take();
        if let Some(pool) = pool {
            // Fold the WAL back into the main file before connections drop
            if let Ok(conn) = pool.get() {
                if let Err(e) = conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE);") {
                    tracing::debug!("WAL checkpoint on close failed: {}", e);
                }
            }
            tracing::debug!("SQLite store closed");
        }
        Ok(())
    }
}
