//! Persisted priority queue of work items.
//!
//! Items live in one sorted set per job. The score is the item's priority
//! (negated for [`PriorityOrder::HighestFirst`]); the member is
//! `<20-digit sequence>|<item json>`. The store orders equal scores by member,
//! so the zero-padded insertion sequence gives FIFO order within a priority.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{FrontierError, Result};
use crate::item::WorkItem;
use crate::keys::FrontierKeys;
use crate::store::StoreClient;

/// Which end of the priority range is served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PriorityOrder {
    /// Smaller priority values are more urgent.
    #[default]
    LowestFirst,
    /// Larger priority values are more urgent.
    HighestFirst,
}

impl PriorityOrder {
    /// Store score for a priority.
    pub fn score(self, priority: i64) -> f64 {
        match self {
            PriorityOrder::LowestFirst => priority as f64,
            PriorityOrder::HighestFirst => -(priority as f64),
        }
    }
}

const SEQUENCE_SEPARATOR: char = '|';

/// Priority queue over a [`StoreClient`].
///
/// The queue does not dedupe; pair it with a [`Deduper`](crate::Deduper) or
/// use a [`Frontier`](crate::Frontier).
#[derive(Clone)]
pub struct FrontierQueue<S: StoreClient> {
    store: S,
    order: PriorityOrder,
}

impl<S: StoreClient> FrontierQueue<S> {
    /// Create a queue serving the most urgent item per `order` first.
    pub fn new(store: S, order: PriorityOrder) -> Self {
        Self { store, order }
    }

    /// Priority direction of this queue.
    pub fn order(&self) -> PriorityOrder {
        self.order
    }

    /// Insert an item.
    pub async fn push<T>(&self, job_id: &str, item: &WorkItem<T>) -> Result<()>
    where
        T: Serialize,
    {
        let keys = FrontierKeys::new(job_id);
        let seq = self.store.next_sequence(&keys.sequence()).await?;
        let member = encode_member(seq, &item.to_json()?);
        let score = self.order.score(item.priority());

        self.store.push(&keys.queue(), &member, score).await?;

        tracing::trace!(
            job_id = %job_id,
            fingerprint = %item.fingerprint(),
            priority = item.priority(),
            seq = seq,
            "Item pushed"
        );
        Ok(())
    }

    /// Remove and return the most urgent item.
    ///
    /// Waits up to `timeout` while the queue is empty and returns `Ok(None)`
    /// when it expires.
    pub async fn pop<T>(&self, job_id: &str, timeout: Duration) -> Result<Option<WorkItem<T>>>
    where
        T: for<'de> Deserialize<'de>,
    {
        let keys = FrontierKeys::new(job_id);
        let Some((member, _score)) = self.store.pop_min(&keys.queue(), timeout).await? else {
            return Ok(None);
        };

        let json = decode_member(&member)?;
        let item = WorkItem::from_json(json).map_err(|e| {
            FrontierError::MalformedEntry(format!("undecodable item in {}: {e}", keys.queue()))
        })?;
        Ok(Some(item))
    }

    /// Approximate number of queued items.
    pub async fn size(&self, job_id: &str) -> Result<usize> {
        self.store.count(&FrontierKeys::new(job_id).queue()).await
    }

    /// Drop every queued item and reset the sequence.
    pub async fn clear(&self, job_id: &str) -> Result<()> {
        let keys = FrontierKeys::new(job_id);
        self.store.delete(&[keys.queue(), keys.sequence()]).await
    }
}

pub(crate) fn encode_member(seq: u64, json: &str) -> String {
    format!("{:020}{}{}", seq, SEQUENCE_SEPARATOR, json)
}

fn decode_member(member: &str) -> Result<&str> {
    match member.split_once(SEQUENCE_SEPARATOR) {
        Some((seq, json)) if seq.len() == 20 && seq.bytes().all(|b| b.is_ascii_digit()) => Ok(json),
        _ => Err(FrontierError::MalformedEntry(truncate(member, 64))),
    }
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}
