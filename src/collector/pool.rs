//! Project pool
//!
//! Runs one collection task per project, at most `max_concurrent` at a time,
//! with a shared token bucket pacing project starts. A failing project is
//! recorded against its ID and never stops the others.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use super::rate_limit::RateLimiter;
use super::ProjectCollector;
use crate::error::{Cancelled, PartialFailure};

pub type ProjectErrors = HashMap<String, Arc<anyhow::Error>>;

pub struct ProjectPool {
    semaphore: Arc<Semaphore>,
    limiter: Arc<RateLimiter>,
    max_concurrent: usize,
    errors: Arc<Mutex<ProjectErrors>>,
}

impl ProjectPool {
    /// Pool admitting `max_concurrent` projects at once (at least 1) and
    /// starting at most `requests_per_second` of them per second, burst 2x.
    pub fn new(requests_per_second: f64, max_concurrent: usize) -> Self {
        Self::with_rate_limiter(RateLimiter::per_second(requests_per_second), max_concurrent)
    }

    pub fn with_rate_limiter(limiter: RateLimiter, max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            limiter: Arc::new(limiter),
            max_concurrent,
            errors: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Collect every project, returning [`PartialFailure`] if any failed.
    /// Repeated IDs are collected once.
    ///
    /// Errors from a previous run are cleared first. Per-project details are
    /// available from [`ProjectPool::errors`] afterwards.
    pub async fn collect_all(
        &self,
        cancel: &CancellationToken,
        collector: Arc<dyn ProjectCollector>,
        projects: &[String],
    ) -> Result<(), PartialFailure> {
        self.lock_errors().clear();

        let mut seen = HashSet::new();
        let projects: Vec<&String> = projects
            .iter()
            .filter(|p| seen.insert(p.as_str()))
            .collect();

        let mut handles = Vec::with_capacity(projects.len());
        for &project_id in &projects {
            let semaphore = self.semaphore.clone();
            let limiter = self.limiter.clone();
            let collector = collector.clone();
            let cancel = cancel.clone();
            let task_project = project_id.clone();

            let handle = tokio::spawn(async move {
                run_project(&cancel, &semaphore, &limiter, collector.as_ref(), &task_project).await
            });
            handles.push((project_id.clone(), handle));
        }

        for (project_id, handle) in handles {
            let outcome = match handle.await {
                Ok(result) => result,
                Err(join_err) => {
                    Err(anyhow::Error::new(join_err).context("collection task failed"))
                }
            };

            if let Err(err) = outcome {
                tracing::error!("Failed to collect project {}: {:#}", project_id, err);
                self.lock_errors().insert(project_id, Arc::new(err));
            }
        }

        let failed = self.lock_errors().len();
        if failed > 0 {
            return Err(PartialFailure {
                failed,
                total: projects.len(),
            });
        }

        tracing::info!("Collected {} projects", projects.len());
        Ok(())
    }

    /// Copy of the per-project errors from the last run
    pub fn errors(&self) -> ProjectErrors {
        self.lock_errors().clone()
    }

    fn lock_errors(&self) -> std::sync::MutexGuard<'_, ProjectErrors> {
        // A poisoned map still holds valid entries
        self.errors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Admission slot, then a start token, then the collection itself.
async fn run_project(
    cancel: &CancellationToken,
    semaphore: &Arc<Semaphore>,
    limiter: &RateLimiter,
    collector: &dyn ProjectCollector,
    project_id: &str,
) -> anyhow::Result<()> {
    let _permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(Cancelled.into()),
        permit = semaphore.clone().acquire_owned() => permit.context("project pool closed")?,
    };

    limiter.wait(cancel).await.context("rate limiter error")?;

    collector.collect_project(cancel, project_id).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Fails for the listed projects, records the rest, tracks peak concurrency.
    #[derive(Default)]
    struct ScriptedCollector {
        failing: Vec<&'static str>,
        collected: Mutex<Vec<String>>,
        active: AtomicUsize,
        peak: AtomicUsize,
        work: Duration,
    }

    #[async_trait]
    impl ProjectCollector for ScriptedCollector {
        async fn collect_project(
            &self,
            _cancel: &CancellationToken,
            project_id: &str,
        ) -> anyhow::Result<()> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.work).await;
            self.active.fetch_sub(1, Ordering::SeqCst);

            if self.failing.iter().any(|f| *f == project_id) {
                anyhow::bail!("permission denied on {project_id}");
            }
            self.collected.lock().unwrap().push(project_id.to_string());
            Ok(())
        }
    }

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_failure_is_isolated_to_its_project() {
        let collector = Arc::new(ScriptedCollector {
            failing: vec!["B"],
            ..Default::default()
        });
        let pool = ProjectPool::with_rate_limiter(RateLimiter::unlimited(), 2);
        let cancel = CancellationToken::new();

        let err = pool
            .collect_all(&cancel, collector.clone(), &ids(&["A", "B", "C"]))
            .await
            .unwrap_err();
        assert_eq!(err, PartialFailure { failed: 1, total: 3 });
        assert_eq!(err.to_string(), "failed to collect 1 of 3 projects");

        let errors = pool.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors["B"].to_string().contains("permission denied on B"));

        let mut collected = collector.collected.lock().unwrap().clone();
        collected.sort();
        assert_eq!(collected, ["A", "C"]);
    }

    #[tokio::test]
    async fn test_duplicate_ids_are_collected_once() {
        let collector = Arc::new(ScriptedCollector {
            failing: vec!["B"],
            ..Default::default()
        });
        let pool = ProjectPool::with_rate_limiter(RateLimiter::unlimited(), 4);
        let cancel = CancellationToken::new();

        let err = pool
            .collect_all(&cancel, collector.clone(), &ids(&["A", "B", "A", "B"]))
            .await
            .unwrap_err();
        assert_eq!(err, PartialFailure { failed: 1, total: 2 });
        assert_eq!(*collector.collected.lock().unwrap(), ["A"]);
    }

    #[tokio::test]
    async fn test_empty_project_list_is_a_no_op() {
        let pool = ProjectPool::new(10.0, 5);
        let cancel = CancellationToken::new();

        pool.collect_all(&cancel, Arc::new(ScriptedCollector::default()), &[])
            .await
            .unwrap();
        assert!(pool.errors().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_is_bounded() {
        let collector = Arc::new(ScriptedCollector {
            work: Duration::from_millis(100),
            ..Default::default()
        });
        let pool = ProjectPool::with_rate_limiter(RateLimiter::unlimited(), 3);
        let cancel = CancellationToken::new();
        let projects: Vec<String> = (0..12).map(|i| format!("project-{i}")).collect();

        pool.collect_all(&cancel, collector.clone(), &projects)
            .await
            .unwrap();

        assert_eq!(collector.peak.load(Ordering::SeqCst), 3);
        assert_eq!(collector.collected.lock().unwrap().len(), 12);
    }

    #[tokio::test]
    async fn test_errors_reset_between_runs() {
        let collector = Arc::new(ScriptedCollector {
            failing: vec!["broken"],
            ..Default::default()
        });
        let pool = ProjectPool::with_rate_limiter(RateLimiter::unlimited(), 4);
        let cancel = CancellationToken::new();

        assert!(pool
            .collect_all(&cancel, collector.clone(), &ids(&["broken", "fine"]))
            .await
            .is_err());
        pool.collect_all(&cancel, collector, &ids(&["fine"]))
            .await
            .unwrap();
        assert!(pool.errors().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_pool_records_every_project() {
        let collector = Arc::new(ScriptedCollector::default());
        let pool = ProjectPool::new(10.0, 2);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = pool
            .collect_all(&cancel, collector.clone(), &ids(&["x", "y", "z"]))
            .await
            .unwrap_err();
        assert_eq!(err.failed, 3);
        assert!(pool
            .errors()
            .values()
            .all(|e| crate::error::is_cancelled(e)));
        assert!(collector.collected.lock().unwrap().is_empty());
    }

    #[test]
    fn test_zero_concurrency_is_clamped() {
        assert_eq!(ProjectPool::new(1.0, 0).max_concurrent(), 1);
    }
}
