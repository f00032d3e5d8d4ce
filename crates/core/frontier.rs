//! The frontier: deduper and queue behind one handle.
//!
//! Workers never push straight into the queue. They go through
//! [`Frontier::enqueue`], which records the fingerprint and queues the item in
//! one atomic step, so an item is queued at most once per job no matter how
//! many workers discover it.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::config::FrontierConfig;
use crate::dedupe::Deduper;
use crate::error::Result;
use crate::item::WorkItem;
use crate::keys::FrontierKeys;
use crate::queue::FrontierQueue;
use crate::store::{StoreClient, UnseenPush};

/// Outcome of [`Frontier::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// The item was pushed.
    Queued,
    /// The fingerprint had been seen before; nothing was pushed.
    Duplicate,
}

/// Snapshot of a job's frontier sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrontierStats {
    /// Items waiting in the queue.
    pub queued: usize,
    /// Distinct fingerprints recorded.
    pub seen: usize,
    /// Items in the dead-letter set.
    pub dead: usize,
}

#[derive(Serialize)]
struct DeadLetter<'a, T> {
    item: &'a WorkItem<T>,
    error: &'a str,
    failed_at: i64,
}

/// Deduplicated priority frontier shared by every worker of a job.
#[derive(Clone)]
pub struct Frontier<S: StoreClient + Clone> {
    store: S,
    deduper: Deduper<S>,
    queue: FrontierQueue<S>,
    config: FrontierConfig,
}

impl<S: StoreClient + Clone> Frontier<S> {
    /// Create a frontier over `store`.
    pub fn new(store: S, config: FrontierConfig) -> Self {
        Self {
            deduper: Deduper::new(store.clone()),
            queue: FrontierQueue::new(store.clone(), config.priority_order),
            store,
            config,
        }
    }

    /// Lifecycle configuration.
    pub fn config(&self) -> &FrontierConfig {
        &self.config
    }

    /// The underlying deduper.
    pub fn deduper(&self) -> &Deduper<S> {
        &self.deduper
    }

    /// The underlying queue.
    pub fn queue(&self) -> &FrontierQueue<S> {
        &self.queue
    }

    /// The store this frontier writes to.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Push `item` unless its fingerprint was already seen for the job.
    ///
    /// Items created with [`WorkItem::unfiltered`] skip the check but are still
    /// recorded as seen. Marking and pushing are a single store operation, so
    /// a failed call leaves neither behind and is safe to retry.
    pub async fn enqueue<T>(&self, job_id: &str, item: &WorkItem<T>) -> Result<Enqueued>
    where
        T: Serialize,
    {
        let keys = FrontierKeys::new(job_id);
        let (seen, sequence, queue) = (keys.seen(), keys.sequence(), keys.queue());
        let fingerprint = item.fingerprint();
        let fingerprint_hex = fingerprint.to_hex();
        let payload = item.to_json()?;

        let op = UnseenPush {
            seen: &seen,
            fingerprint: &fingerprint_hex,
            sequence: &sequence,
            queue: &queue,
            payload: &payload,
            score: self.queue.order().score(item.priority()),
            force: item.dont_filter(),
        };
        let fresh = self.store.push_unseen(&op).await?;

        if !fresh && !item.dont_filter() {
            tracing::trace!(job_id = %job_id, fingerprint = %fingerprint, "Duplicate fingerprint");
            return Ok(Enqueued::Duplicate);
        }
        Ok(Enqueued::Queued)
    }

    /// Enqueue start items; returns how many were queued.
    pub async fn seed<T, I>(&self, job_id: &str, items: I) -> Result<usize>
    where
        T: Serialize,
        I: IntoIterator<Item = WorkItem<T>>,
    {
        let mut queued = 0;
        for item in items {
            if self.enqueue(job_id, &item).await? == Enqueued::Queued {
                queued += 1;
            }
        }

        tracing::info!(job_id = %job_id, queued = queued, "Frontier seeded");
        Ok(queued)
    }

    /// Pop the next item, waiting up to `timeout`.
    pub async fn next<T>(&self, job_id: &str, timeout: Duration) -> Result<Option<WorkItem<T>>>
    where
        T: for<'de> Deserialize<'de>,
    {
        self.queue.pop(job_id, timeout).await
    }

    /// Whether the queue currently holds items.
    pub async fn has_pending(&self, job_id: &str) -> Result<bool> {
        Ok(self.queue.size(job_id).await? > 0)
    }

    /// Record a failed item in the dead-letter set.
    pub async fn push_dead<T>(&self, job_id: &str, item: &WorkItem<T>, error: &str) -> Result<()>
    where
        T: Serialize,
    {
        let failed_at = current_timestamp();
        let record = serde_json::to_string(&DeadLetter {
            item,
            error,
            failed_at,
        })?;
        self.store
            .push(&FrontierKeys::new(job_id).dead(), &record, failed_at as f64)
            .await
    }

    /// Current sizes of the job's queue, seen set and dead-letter set.
    pub async fn stats(&self, job_id: &str) -> Result<FrontierStats> {
        Ok(FrontierStats {
            queued: self.queue.size(job_id).await?,
            seen: self.deduper.seen_count(job_id).await?,
            dead: self.store.count(&FrontierKeys::new(job_id).dead()).await?,
        })
    }

    /// Delete every key of the job.
    pub async fn reset(&self, job_id: &str) -> Result<()> {
        self.store.delete(&FrontierKeys::new(job_id).all()).await?;
        tracing::info!(job_id = %job_id, "Frontier reset");
        Ok(())
    }

    /// Prepare the job before workers start.
    pub async fn open(&self, job_id: &str) -> Result<()> {
        self.store.ping().await?;
        if self.config.flush_on_start {
            self.reset(job_id).await?;
        }
        let stats = self.stats(job_id).await?;
        tracing::info!(
            job_id = %job_id,
            queued = stats.queued,
            seen = stats.seen,
            "Frontier opened"
        );
        Ok(())
    }

    /// Finish the job after workers stopped; clears state unless persisting.
    pub async fn close(&self, job_id: &str) -> Result<()> {
        if !self.config.persist {
            self.reset(job_id).await?;
        }
        tracing::info!(job_id = %job_id, persist = self.config.persist, "Frontier closed");
        Ok(())
    }
}

/// Get current Unix timestamp in seconds.
fn current_timestamp() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
