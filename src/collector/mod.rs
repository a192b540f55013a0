//! Resource collection
//!
//! Walks Pub/Sub projects and writes what it finds into a [`Store`].
//!
//! # Architecture
//!
//! - [`Collector`] - per-project collection with a cached client per project
//! - [`pool`] - bounded fan-out across many projects with per-project errors
//! - [`retry`] - exponential backoff and transient-error classification
//! - [`rate_limit`] - token bucket shared by all outbound calls
//!
//! Each listing runs inside the retry loop as a whole: a failure anywhere in
//! the iteration drops the stream and the next attempt starts from the first
//! page. Items are upserted one by one as they arrive, so progress made before
//! a failure stays in the store and re-saving it on the next attempt is
//! harmless.

pub mod pool;
pub mod rate_limit;
pub mod retry;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::TryStreamExt;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::error::Cancelled;
use crate::gcp::client::{ClientProvider, PubSubApi};
use crate::storage::{Store, Subscription, Topic};

pub use pool::ProjectPool;
pub use rate_limit::RateLimiter;
pub use retry::{is_retryable, retry_with_backoff, RetryPolicy};

/// Anything the project pool can run once per project.
#[async_trait]
pub trait ProjectCollector: Send + Sync {
    async fn collect_project(&self, cancel: &CancellationToken, project_id: &str) -> Result<()>;
}

/// Counts of what one project's collection saved
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectStats {
    pub topics: usize,
    pub subscriptions: usize,
}

/// Collects topics and subscriptions for one project at a time.
///
/// Safe to share between concurrent tasks; clients are created once per
/// project and reused until [`Collector::close`].
pub struct Collector {
    provider: Arc<dyn ClientProvider>,
    clients: RwLock<HashMap<String, Arc<dyn PubSubApi>>>,
    store: Arc<dyn Store>,
    limiter: RateLimiter,
    retry: RetryPolicy,
}

impl Collector {
    /// Collector limited to `requests_per_second` item fetches, with a burst
    /// of twice that.
    pub fn new(
        provider: Arc<dyn ClientProvider>,
        store: Arc<dyn Store>,
        requests_per_second: f64,
    ) -> Self {
        Self {
            provider,
            clients: RwLock::new(HashMap::new()),
            store,
            limiter: RateLimiter::per_second(requests_per_second),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    /// Number of cached project clients
    pub async fn cached_clients(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Cached client for the project, creating one if needed.
    ///
    /// Creation runs without holding the lock. If another task stored a client
    /// for the same project in the meantime, that one wins and ours is closed.
    async fn get_client(&self, project_id: &str) -> Result<Arc<dyn PubSubApi>> {
        if let Some(client) = self.clients.read().await.get(project_id) {
            return Ok(client.clone());
        }

        let created = self
            .provider
            .get_client(project_id)
            .await
            .with_context(|| format!("failed to create pubsub client for project {project_id}"))?;

        let mut clients = self.clients.write().await;
        if let Some(existing) = clients.get(project_id) {
            tracing::debug!("Lost client creation race for {}, closing duplicate", project_id);
            if let Err(e) = created.close().await {
                tracing::warn!("Failed to close duplicate client for {}: {:#}", project_id, e);
            }
            return Ok(existing.clone());
        }

        clients.insert(project_id.to_string(), created.clone());
        Ok(created)
    }

    /// Collect one project: topics, then subscriptions, then mark it synced.
    ///
    /// A listing failure aborts the rest of the project but keeps whatever was
    /// already saved. The sync time is only recorded when both listings finish.
    pub async fn collect(&self, cancel: &CancellationToken, project_id: &str) -> Result<CollectStats> {
        let client = self.get_client(project_id).await?;

        let topics = self
            .collect_topics(cancel, client.as_ref(), project_id)
            .await
            .context("failed to collect topics")?;

        let subscriptions = self
            .collect_subscriptions(cancel, client.as_ref(), project_id)
            .await
            .context("failed to collect subscriptions")?;

        self.store
            .update_project_sync_time(cancel, project_id)
            .await
            .context("failed to update project sync time")?;

        let stats = CollectStats {
            topics,
            subscriptions,
        };
        tracing::info!(
            "Collected {}: {} topics, {} subscriptions",
            project_id,
            stats.topics,
            stats.subscriptions
        );
        Ok(stats)
    }

    async fn collect_topics(
        &self,
        cancel: &CancellationToken,
        client: &dyn PubSubApi,
        project_id: &str,
    ) -> Result<usize> {
        let store = self.store.as_ref();
        let limiter = &self.limiter;

        retry_with_backoff(cancel, &self.retry, move || async move {
            let mut topics = client.list_topics(project_id);
            let mut saved = 0usize;

            loop {
                limiter.wait(cancel).await.context("rate limiter error")?;

                let Some(entry) = next_or_cancel(cancel, &mut topics)
                    .await
                    .context("failed to iterate topics")?
                else {
                    break;
                };

                let name = extract_resource_name(&entry.name);
                store
                    .save_topic(cancel, &Topic::new(name, project_id, &entry.name))
                    .await
                    .with_context(|| format!("failed to save topic {name}"))?;
                saved += 1;
            }

            Ok::<_, anyhow::Error>(saved)
        })
        .await
    }

    async fn collect_subscriptions(
        &self,
        cancel: &CancellationToken,
        client: &dyn PubSubApi,
        project_id: &str,
    ) -> Result<usize> {
        let store = self.store.as_ref();
        let limiter = &self.limiter;

        retry_with_backoff(cancel, &self.retry, move || async move {
            let mut subscriptions = client.list_subscriptions(project_id);
            let mut saved = 0usize;

            loop {
                limiter.wait(cancel).await.context("rate limiter error")?;

                let Some(entry) = next_or_cancel(cancel, &mut subscriptions)
                    .await
                    .context("failed to iterate subscriptions")?
                else {
                    break;
                };

                let name = extract_resource_name(&entry.name);
                let subscription = Subscription::new(name, project_id, &entry.topic, &entry.name);
                store
                    .save_subscription(cancel, &subscription)
                    .await
                    .with_context(|| format!("failed to save subscription {name}"))?;
                saved += 1;
            }

            Ok::<_, anyhow::Error>(saved)
        })
        .await
    }

    /// Close every cached client, reporting all failures together.
    pub async fn close(&self) -> Result<()> {
        let clients: Vec<(String, Arc<dyn PubSubApi>)> =
            self.clients.write().await.drain().collect();

        let mut failures = Vec::new();
        for (project_id, client) in clients {
            if let Err(e) = client.close().await {
                failures.push(format!("failed to close client for project {project_id}: {e:#}"));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            failures.sort();
            Err(anyhow::anyhow!(
                "errors closing clients: {}",
                failures.join("; ")
            ))
        }
    }
}

#[async_trait]
impl ProjectCollector for Collector {
    async fn collect_project(&self, cancel: &CancellationToken, project_id: &str) -> Result<()> {
        self.collect(cancel, project_id).await.map(|_| ())
    }
}

/// Next listing item, or [`Cancelled`] if `cancel` fires while the page
/// request is still in flight.
async fn next_or_cancel<T>(
    cancel: &CancellationToken,
    stream: &mut BoxStream<'_, Result<T>>,
) -> Result<Option<T>> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Cancelled.into()),
        next = stream.try_next() => next,
    }
}

/// Last non-empty `/`-separated segment of a resource path.
///
/// `"projects/p/topics/t"` gives `"t"`; `""`, `"/"` and `"//"` give `""`;
/// a trailing slash is skipped, so `"projects/p/topics/"` gives `"topics"`.
pub fn extract_resource_name(full_path: &str) -> &str {
    full_path
        .rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or("")
}
