//! Store abstraction for frontier state.
//!
//! The frontier never talks to a concrete key-value store directly. Every
//! component receives a [`StoreClient`] handle and relies only on the atomic
//! primitives below; clustering is invisible beyond connection setup.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;

/// Key-value store operations the frontier needs.
///
/// Implementations must be thread-safe (Send + Sync) and every method must be
/// atomic on the store side. Connection failures are reported as
/// [`FrontierError::StoreUnavailable`](crate::FrontierError::StoreUnavailable).
#[async_trait]
pub trait StoreClient: Send + Sync {
    // ========== Sorted Set Operations ==========

    /// Insert `member` into the sorted set at `key` with the given score.
    async fn push(&self, key: &str, member: &str, score: f64) -> Result<()>;

    /// Atomically remove and return the lowest-scored member of `key`.
    ///
    /// Blocks up to `timeout` while the set is empty and returns `None` once it
    /// expires. A zero timeout never blocks.
    async fn pop_min(&self, key: &str, timeout: Duration) -> Result<Option<(String, f64)>>;

    /// Number of members in the sorted set at `key`.
    async fn count(&self, key: &str) -> Result<usize>;

    // ========== Set Operations ==========

    /// Add `member` to the set at `key`.
    ///
    /// Returns `true` if the member was not present before.
    async fn add_if_absent(&self, key: &str, member: &str) -> Result<bool>;

    /// Number of members in the set at `key`.
    async fn set_count(&self, key: &str) -> Result<usize>;

    // ========== Composite Operations ==========

    /// Mark a fingerprint as seen and queue its payload in one atomic step.
    ///
    /// Adds `op.fingerprint` to the set `op.seen`. If it was absent, or
    /// `op.force` is set, increments the counter `op.sequence` and inserts
    /// `<seq>|<payload>` into the sorted set `op.queue` with `op.score`, where
    /// `<seq>` is the new counter value zero-padded to 20 digits.
    ///
    /// Returns `true` if the fingerprint was not present before. Either every
    /// write happens or none does.
    async fn push_unseen(&self, op: &UnseenPush<'_>) -> Result<bool>;

    // ========== Counters & Keys ==========

    /// Atomically increment the counter at `key` and return the new value.
    async fn next_sequence(&self, key: &str) -> Result<u64>;

    /// Delete the given keys. Missing keys are ignored.
    async fn delete(&self, keys: &[String]) -> Result<()>;

    /// Round-trip to the store to verify the connection.
    async fn ping(&self) -> Result<()>;
}

/// Arguments for [`StoreClient::push_unseen`].
#[derive(Debug, Clone, Copy)]
pub struct UnseenPush<'a> {
    pub seen: &'a str,
    pub fingerprint: &'a str,
    pub sequence: &'a str,
    pub queue: &'a str,
    pub payload: &'a str,
    pub score: f64,
    pub force: bool,
}

/// A type-erased store that can be shared across tasks.
pub type DynStore = Arc<dyn StoreClient>;

/// Wrapper around `Arc<dyn StoreClient>` for convenience.
#[derive(Clone)]
pub struct SharedStore {
    inner: DynStore,
}

impl SharedStore {
    /// Create a new SharedStore from any StoreClient implementation.
    pub fn new<S: StoreClient + 'static>(store: S) -> Self {
        Self {
            inner: Arc::new(store),
        }
    }

    /// Get a reference to the inner store.
    pub fn inner(&self) -> &DynStore {
        &self.inner
    }
}

impl From<DynStore> for SharedStore {
    fn from(inner: DynStore) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl StoreClient for SharedStore {
    async fn push(&self, key: &str, member: &str, score: f64) -> Result<()> {
        self.inner.push(key, member, score).await
    }

    async fn pop_min(&self, key: &str, timeout: Duration) -> Result<Option<(String, f64)>> {
        self.inner.pop_min(key, timeout).await
    }

    async fn count(&self, key: &str) -> Result<usize> {
        self.inner.count(key).await
    }

    async fn add_if_absent(&self, key: &str, member: &str) -> Result<bool> {
        self.inner.add_if_absent(key, member).await
    }

    async fn set_count(&self, key: &str) -> Result<usize> {
        self.inner.set_count(key).await
    }

    async fn push_unseen(&self, op: &UnseenPush<'_>) -> Result<bool> {
        self.inner.push_unseen(op).await
    }

    async fn next_sequence(&self, key: &str) -> Result<u64> {
        self.inner.next_sequence(key).await
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        self.inner.delete(keys).await
    }

    async fn ping(&self) -> Result<()> {
        self.inner.ping().await
    }
}
