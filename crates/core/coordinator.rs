//! Worker coordinator: the per-worker fetch/process/enqueue loop.
//!
//! ```text
//! Idle -> Fetching -> Processing -> Enqueuing -> Idle
//!   \________\____________\____________\______-> Stopped
//! ```
//!
//! An empty pop is not an error: the coordinator pauses and polls again.
//! Processing failures drop the item. A store that cannot be reached is
//! retried with exponential backoff until the failure budget runs out.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use crate::backoff::Backoff;
use crate::config::CoordinatorConfig;
use crate::error::{FrontierError, Result};
use crate::frontier::{Enqueued, Frontier};
use crate::item::WorkItem;
use crate::store::{SharedStore, StoreClient};

/// Result type for processing callbacks: the follow-up items discovered.
pub type ProcessResult<T> = std::result::Result<Vec<WorkItem<T>>, ProcessingError>;

/// Error returned from processing callbacks.
#[derive(Debug, Clone)]
pub struct ProcessingError {
    /// Error message.
    pub message: String,
}

impl ProcessingError {
    /// Create a new processing error.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl fmt::Display for ProcessingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl<E: std::error::Error> From<E> for ProcessingError {
    fn from(err: E) -> Self {
        Self::new(err.to_string())
    }
}

impl From<ProcessingError> for FrontierError {
    fn from(err: ProcessingError) -> Self {
        FrontierError::Processing(err.message)
    }
}

/// Where a coordinator is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    /// Between cycles.
    Idle,
    /// Waiting on a pop.
    Fetching,
    /// Running the callback.
    Processing,
    /// Pushing discovered items.
    Enqueuing,
    /// Terminal.
    Stopped,
}

/// Why a coordinator stopped without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The stop signal was raised.
    Cancelled,
    /// `max_idle_polls` consecutive polls found the queue empty.
    Idle,
}

/// What a coordinator did before it stopped.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoordinatorReport {
    /// Worker identifier.
    pub worker_id: String,
    /// Items processed successfully.
    pub processed: u64,
    /// Items whose callback failed (dropped).
    pub failed: u64,
    /// Follow-up items returned by callbacks.
    pub discovered: u64,
    /// Discovered items that were queued.
    pub enqueued: u64,
    /// Discovered items rejected as duplicates.
    pub duplicates: u64,
    /// Pops that timed out on an empty queue.
    pub empty_polls: u64,
    /// Store calls retried after a transient failure.
    pub store_retries: u64,
    /// Queue entries that could not be decoded.
    pub malformed: u64,
    /// Message of the most recent callback failure.
    pub last_failure: Option<String>,
    /// Set once the coordinator stopped.
    pub stop_reason: Option<StopReason>,
}

/// Cooperative stop flag shared between a pool and its coordinators.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    inner: Arc<StopInner>,
}

#[derive(Debug, Default)]
struct StopInner {
    stopped: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    /// Create a signal that has not been raised.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the signal; every holder observes it.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Whether the signal was raised.
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Wait until the signal is raised.
    pub async fn stopped(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_stopped() {
                return;
            }
            notified.await;
        }
    }

    /// Sleep for `duration` unless stopped first. Returns whether stopped.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.stopped() => true,
            _ = tokio::time::sleep(duration) => self.is_stopped(),
        }
    }
}

/// Retries store operations that fail with `StoreUnavailable`.
struct StoreRetry {
    worker_id: String,
    backoff: Backoff,
    max_failures: u32,
    stop: StopSignal,
    retries: u64,
}

impl StoreRetry {
    /// Retry until success; fatal once the budget is exhausted.
    async fn run<R, Op, Fut>(&mut self, operation: &str, op: Op) -> Result<R>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        match self.attempt(operation, false, op).await? {
            Some(value) => Ok(value),
            None => Err(FrontierError::Store(format!("{operation} interrupted"))),
        }
    }

    /// Like `run`, but gives up with `None` if stopped while backing off.
    async fn run_cancellable<R, Op, Fut>(&mut self, operation: &str, op: Op) -> Result<Option<R>>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        self.attempt(operation, true, op).await
    }

    async fn attempt<R, Op, Fut>(
        &mut self,
        operation: &str,
        cancellable: bool,
        mut op: Op,
    ) -> Result<Option<R>>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<R>>,
    {
        let budget = self.max_failures.max(1);
        let mut failures = 0u32;

        loop {
            let err = match op().await {
                Ok(value) => return Ok(Some(value)),
                Err(e) if e.is_transient() => e,
                Err(e) => return Err(e),
            };

            failures += 1;
            if failures >= budget {
                tracing::error!(
                    worker_id = %self.worker_id,
                    operation = operation,
                    attempts = failures,
                    error = %err,
                    "Store retry budget exhausted"
                );
                return Err(FrontierError::FatalStore {
                    operation: operation.to_string(),
                    attempts: failures,
                    last_error: err.to_string(),
                });
            }

            let delay = self.backoff.delay(failures - 1);
            self.retries += 1;
            tracing::warn!(
                worker_id = %self.worker_id,
                operation = operation,
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Store unavailable, backing off"
            );

            if cancellable {
                if self.stop.sleep(delay).await {
                    return Ok(None);
                }
            } else {
                tokio::time::sleep(delay).await;
            }
        }
    }
}

enum Cycle {
    Worked,
    Empty,
    Cancelled,
}

/// Runs one worker's state machine against a job's frontier.
pub struct Coordinator<T, F, Fut, S = SharedStore>
where
    T: Serialize + for<'de> Deserialize<'de> + Clone + Send + Sync + 'static,
    F: Fn(WorkItem<T>) -> Fut + Send + Sync,
    Fut: Future<Output = ProcessResult<T>> + Send,
    S: StoreClient + Clone + 'static,
{
    job_id: String,
    frontier: Frontier<S>,
    handler: F,
    config: CoordinatorConfig,
    stop: StopSignal,
    retry: StoreRetry,
    state: CoordinatorState,
    idle_polls: u32,
    report: CoordinatorReport,
    _phantom: PhantomData<T>,
}

impl<T, F, Fut, S> Coordinator<T, F, Fut, S>
where
    T: Serialize + for<'de> Deserialize<'de> + Clone + Send + Sync + 'static,
    F: Fn(WorkItem<T>) -> Fut + Send + Sync,
    Fut: Future<Output = ProcessResult<T>> + Send,
    S: StoreClient + Clone + 'static,
{
    /// Create a coordinator for `job_id`.
    pub fn new(
        worker_id: impl Into<String>,
        job_id: impl Into<String>,
        frontier: Frontier<S>,
        handler: F,
        config: CoordinatorConfig,
        stop: StopSignal,
    ) -> Self {
        let worker_id = worker_id.into();
        let retry = StoreRetry {
            worker_id: worker_id.clone(),
            backoff: config.store_backoff.clone(),
            max_failures: config.max_store_failures,
            stop: stop.clone(),
            retries: 0,
        };

        Self {
            job_id: job_id.into(),
            frontier,
            handler,
            config,
            stop,
            retry,
            state: CoordinatorState::Idle,
            idle_polls: 0,
            report: CoordinatorReport {
                worker_id,
                ..Default::default()
            },
            _phantom: PhantomData,
        }
    }

    /// Worker identifier.
    pub fn worker_id(&self) -> &str {
        &self.report.worker_id
    }

    /// Current state.
    pub fn state(&self) -> CoordinatorState {
        self.state
    }

    /// Run until stopped, idle, or the store is declared lost.
    ///
    /// Returns `FrontierError::FatalStore` when the store stayed unavailable
    /// for `max_store_failures` consecutive attempts, and any non-transient
    /// store error as is.
    pub async fn run(mut self) -> Result<CoordinatorReport> {
        tracing::info!(
            worker_id = %self.worker_id(),
            job_id = %self.job_id,
            "Coordinator started"
        );

        loop {
            if self.stop.is_stopped() {
                return Ok(self.finish(StopReason::Cancelled));
            }

            match self.cycle().await {
                Ok(Cycle::Worked) => self.idle_polls = 0,
                Ok(Cycle::Empty) => {
                    self.report.empty_polls += 1;
                    self.idle_polls += 1;
                    if self
                        .config
                        .max_idle_polls
                        .is_some_and(|max| self.idle_polls >= max)
                    {
                        return Ok(self.finish(StopReason::Idle));
                    }
                    if self.stop.sleep(self.config.idle_backoff).await {
                        return Ok(self.finish(StopReason::Cancelled));
                    }
                }
                Ok(Cycle::Cancelled) => return Ok(self.finish(StopReason::Cancelled)),
                Err(e) => {
                    self.transition(CoordinatorState::Stopped);
                    tracing::error!(
                        worker_id = %self.worker_id(),
                        job_id = %self.job_id,
                        error = %e,
                        "Coordinator stopped on error"
                    );
                    return Err(e);
                }
            }
        }
    }

    async fn cycle(&mut self) -> Result<Cycle> {
        self.transition(CoordinatorState::Fetching);

        let job_id = self.job_id.as_str();
        let frontier = &self.frontier;
        let timeout = self.config.fetch_timeout;

        let popped = self
            .retry
            .run_cancellable("pop", || frontier.next::<T>(job_id, timeout))
            .await;

        let item = match popped {
            Ok(Some(Some(item))) => item,
            Ok(Some(None)) => {
                self.transition(CoordinatorState::Idle);
                return Ok(Cycle::Empty);
            }
            Ok(None) => return Ok(Cycle::Cancelled),
            Err(FrontierError::MalformedEntry(entry)) => {
                self.report.malformed += 1;
                tracing::warn!(
                    worker_id = %self.report.worker_id,
                    entry = %entry,
                    "Dropping malformed queue entry"
                );
                self.transition(CoordinatorState::Idle);
                return Ok(Cycle::Worked);
            }
            Err(e) => return Err(e),
        };

        self.transition(CoordinatorState::Processing);
        let fingerprint = item.fingerprint();
        let kept = self.config.dead_letter.then(|| item.clone());

        tracing::debug!(
            worker_id = %self.report.worker_id,
            fingerprint = %fingerprint,
            priority = item.priority(),
            "Processing item"
        );

        match (self.handler)(item).await {
            Ok(discovered) => {
                self.report.processed += 1;
                self.transition(CoordinatorState::Enqueuing);
                self.enqueue_discovered(discovered).await?;
            }
            Err(err) => {
                self.report.failed += 1;
                tracing::warn!(
                    worker_id = %self.report.worker_id,
                    fingerprint = %fingerprint,
                    error = %err,
                    "Processing failed, item dropped"
                );

                if let Some(item) = kept {
                    let job_id = self.job_id.as_str();
                    let frontier = &self.frontier;
                    let message = err.message.as_str();
                    self.retry
                        .run("push_dead", || frontier.push_dead(job_id, &item, message))
                        .await?;
                }
                self.report.last_failure = Some(err.message);
            }
        }

        self.transition(CoordinatorState::Idle);
        Ok(Cycle::Worked)
    }

    async fn enqueue_discovered(&mut self, discovered: Vec<WorkItem<T>>) -> Result<()> {
        let job_id = self.job_id.as_str();
        let frontier = &self.frontier;

        for item in discovered {
            self.report.discovered += 1;
            let outcome = self
                .retry
                .run("enqueue", || frontier.enqueue(job_id, &item))
                .await?;

            match outcome {
                Enqueued::Queued => self.report.enqueued += 1,
                Enqueued::Duplicate => self.report.duplicates += 1,
            }
        }

        tracing::debug!(
            worker_id = %self.report.worker_id,
            enqueued = self.report.enqueued,
            duplicates = self.report.duplicates,
            "Discovered items enqueued"
        );
        Ok(())
    }

    fn transition(&mut self, next: CoordinatorState) {
        if self.state != next {
            tracing::trace!(
                worker_id = %self.report.worker_id,
                from = ?self.state,
                to = ?next,
                "State transition"
            );
            self.state = next;
        }
    }

    fn finish(mut self, reason: StopReason) -> CoordinatorReport {
        self.transition(CoordinatorState::Stopped);
        self.report.stop_reason = Some(reason);
        self.report.store_retries = self.retry.retries;

        tracing::info!(
            worker_id = %self.report.worker_id,
            job_id = %self.job_id,
            reason = ?reason,
            processed = self.report.processed,
            failed = self.report.failed,
            "Coordinator stopped"
        );
        self.report
    }
}
