//! Worker pool: runs N coordinators against one job's frontier.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::marker::PhantomData;
use std::time::Duration;
use tokio::task::JoinSet;

use crate::config::{CoordinatorConfig, FrontierConfig};
use crate::coordinator::{Coordinator, CoordinatorReport, ProcessResult, StopSignal};
use crate::error::{FrontierError, Result};
use crate::frontier::Frontier;
use crate::item::WorkItem;
use crate::store::{SharedStore, StoreClient};

/// Builder for WorkerPool.
pub struct WorkerPoolBuilder<T, F, Fut>
where
    T: Serialize + for<'de> Deserialize<'de> + Clone + Send + Sync + 'static,
    F: Fn(WorkItem<T>) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = ProcessResult<T>> + Send + 'static,
{
    job_id: Option<String>,
    workers: usize,
    pool_id: Option<String>,
    handler: Option<F>,
    store: Option<SharedStore>,
    coordinator: CoordinatorConfig,
    frontier: FrontierConfig,
    _phantom: PhantomData<T>,
}

impl<T, F, Fut> Default for WorkerPoolBuilder<T, F, Fut>
where
    T: Serialize + for<'de> Deserialize<'de> + Clone + Send + Sync + 'static,
    F: Fn(WorkItem<T>) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = ProcessResult<T>> + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, F, Fut> WorkerPoolBuilder<T, F, Fut>
where
    T: Serialize + for<'de> Deserialize<'de> + Clone + Send + Sync + 'static,
    F: Fn(WorkItem<T>) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = ProcessResult<T>> + Send + 'static,
{
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            job_id: None,
            workers: 1,
            pool_id: None,
            handler: None,
            store: None,
            coordinator: CoordinatorConfig::default(),
            frontier: FrontierConfig::default(),
            _phantom: PhantomData,
        }
    }

    /// Set the store.
    pub fn store(mut self, store: impl StoreClient + 'static) -> Self {
        self.store = Some(SharedStore::new(store));
        self
    }

    /// Set a store that is already shared, without wrapping it again.
    pub fn shared_store(mut self, store: SharedStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the job whose frontier the pool works on.
    pub fn job_id(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    /// Set the number of coordinators.
    pub fn workers(mut self, num: usize) -> Self {
        self.workers = num;
        self
    }

    /// Override the generated pool id.
    pub fn pool_id(mut self, pool_id: impl Into<String>) -> Self {
        self.pool_id = Some(pool_id.into());
        self
    }

    /// Set the processing callback.
    pub fn handler(mut self, handler: F) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Set the fetch timeout.
    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.coordinator.fetch_timeout = timeout;
        self
    }

    /// Stop each coordinator after this many consecutive empty polls.
    pub fn max_idle_polls(mut self, polls: u32) -> Self {
        self.coordinator.max_idle_polls = Some(polls);
        self
    }

    /// Replace the coordinator configuration.
    pub fn coordinator_config(mut self, config: CoordinatorConfig) -> Self {
        self.coordinator = config;
        self
    }

    /// Replace the frontier configuration.
    pub fn frontier_config(mut self, config: FrontierConfig) -> Self {
        self.frontier = config;
        self
    }

    /// Build the WorkerPool.
    pub fn build(self) -> Result<WorkerPool<T, F, Fut>> {
        let handler = self
            .handler
            .ok_or_else(|| FrontierError::Config("Handler is required".to_string()))?;

        let store = self
            .store
            .ok_or_else(|| FrontierError::Config("Store is required".to_string()))?;

        let job_id = self
            .job_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| FrontierError::Config("Job id is required".to_string()))?;

        if self.workers == 0 {
            return Err(FrontierError::Config(
                "At least one worker is required".to_string(),
            ));
        }

        Ok(WorkerPool {
            frontier: Frontier::new(store, self.frontier),
            job_id,
            workers: self.workers,
            pool_id: self.pool_id.unwrap_or_else(generate_pool_id),
            handler,
            config: self.coordinator,
            stop: StopSignal::new(),
            _phantom: PhantomData,
        })
    }
}

/// Outcome of a pool run.
#[derive(Debug, Clone, Default)]
pub struct PoolReport {
    /// Reports of coordinators that stopped cleanly.
    pub workers: Vec<CoordinatorReport>,
    /// Errors of coordinators that stopped abnormally.
    pub failures: Vec<String>,
}

impl PoolReport {
    /// Items processed across all workers.
    pub fn processed(&self) -> u64 {
        self.workers.iter().map(|w| w.processed).sum()
    }

    /// Items whose callback failed across all workers.
    pub fn failed(&self) -> u64 {
        self.workers.iter().map(|w| w.failed).sum()
    }

    /// Discovered items queued across all workers.
    pub fn enqueued(&self) -> u64 {
        self.workers.iter().map(|w| w.enqueued).sum()
    }

    /// Whether every coordinator stopped cleanly.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn record(
        &mut self,
        joined: std::result::Result<Result<CoordinatorReport>, tokio::task::JoinError>,
    ) {
        match joined {
            Ok(Ok(report)) => self.workers.push(report),
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Coordinator failed");
                self.failures.push(e.to_string());
            }
            Err(e) => {
                tracing::error!(error = %e, "Task panicked");
                self.failures.push(e.to_string());
            }
        }
    }
}

/// A pool of coordinators sharing one frontier.
pub struct WorkerPool<T, F, Fut>
where
    T: Serialize + for<'de> Deserialize<'de> + Clone + Send + Sync + 'static,
    F: Fn(WorkItem<T>) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = ProcessResult<T>> + Send + 'static,
{
    frontier: Frontier<SharedStore>,
    job_id: String,
    workers: usize,
    pool_id: String,
    handler: F,
    config: CoordinatorConfig,
    stop: StopSignal,
    _phantom: PhantomData<T>,
}

impl<T, F, Fut> WorkerPool<T, F, Fut>
where
    T: Serialize + for<'de> Deserialize<'de> + Clone + Send + Sync + 'static,
    F: Fn(WorkItem<T>) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = ProcessResult<T>> + Send + 'static,
{
    /// Create a new builder for WorkerPool.
    pub fn builder() -> WorkerPoolBuilder<T, F, Fut> {
        WorkerPoolBuilder::new()
    }

    /// Get the pool ID.
    pub fn pool_id(&self) -> &str {
        &self.pool_id
    }

    /// Job the pool works on.
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// The shared frontier, for seeding and stats.
    pub fn frontier(&self) -> &Frontier<SharedStore> {
        &self.frontier
    }

    /// Handle that stops every coordinator of this pool.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Run until Ctrl-C or until every coordinator stops on its own.
    pub async fn run(&self) -> Result<PoolReport> {
        self.run_until(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await
    }

    /// Run until `shutdown` resolves or every coordinator stops on its own.
    ///
    /// Coordinators finish their current item before stopping. A coordinator
    /// that hits a fatal store error is recorded in the report; the others
    /// keep running.
    pub async fn run_until<S>(&self, shutdown: S) -> Result<PoolReport>
    where
        S: Future<Output = ()> + Send,
    {
        self.frontier.open(&self.job_id).await?;

        let mut tasks = JoinSet::new();
        for index in 0..self.workers {
            let coordinator = Coordinator::new(
                format!("{}-{}", self.pool_id, index),
                self.job_id.clone(),
                self.frontier.clone(),
                self.handler.clone(),
                self.config.clone(),
                self.stop.clone(),
            );
            tasks.spawn(coordinator.run());
        }

        tracing::info!(
            workers = self.workers,
            job_id = %self.job_id,
            pool_id = %self.pool_id,
            "Worker pool started"
        );

        let mut report = PoolReport::default();
        let mut shutdown_requested = false;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown, if !shutdown_requested => {
                    tracing::info!(pool_id = %self.pool_id, "Shutdown requested, draining...");
                    shutdown_requested = true;
                    self.stop.stop();
                }
                joined = tasks.join_next() => match joined {
                    Some(result) => report.record(result),
                    None => break,
                },
            }
        }

        self.frontier.close(&self.job_id).await?;

        tracing::info!(
            pool_id = %self.pool_id,
            processed = report.processed(),
            failed = report.failed(),
            "Worker pool stopped"
        );
        Ok(report)
    }
}

/// Generate a unique pool id: `<host>-<pid>-<random>`.
pub fn generate_pool_id() -> String {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    let pid = std::process::id();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}-{}-{}", host, pid, &suffix[..8])
}
