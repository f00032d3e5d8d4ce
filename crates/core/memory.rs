//! In-process store.
//!
//! `MemoryStore` implements [`StoreClient`] on top of a mutex-guarded map. It
//! keeps the same atomicity guarantees as a real store within one process,
//! which makes it useful for tests, demos and single-process crawls. It can
//! also be switched to "unavailable" to exercise the coordinator's retry path.

use async_trait::async_trait;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

use crate::error::{FrontierError, Result};
use crate::queue::encode_member;
use crate::store::{StoreClient, UnseenPush};

/// f64 score with a total order.
#[derive(Debug, Clone, Copy)]
struct Score(f64);

impl PartialEq for Score {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.0.total_cmp(&other.0)
    }
}

/// Sorted set ordered by (score, member), like a Redis ZSET.
#[derive(Debug, Default)]
struct SortedSet {
    ordered: BTreeSet<(Score, String)>,
    scores: HashMap<String, Score>,
}

impl SortedSet {
    fn insert(&mut self, member: &str, score: f64) {
        if let Some(old) = self.scores.insert(member.to_string(), Score(score)) {
            self.ordered.remove(&(old, member.to_string()));
        }
        self.ordered.insert((Score(score), member.to_string()));
    }

    fn pop_first(&mut self) -> Option<(String, f64)> {
        let (score, member) = self.ordered.pop_first()?;
        self.scores.remove(&member);
        Some((member, score.0))
    }

    fn len(&self) -> usize {
        self.ordered.len()
    }
}

#[derive(Debug, Default)]
struct State {
    sorted: HashMap<String, SortedSet>,
    sets: HashMap<String, HashSet<String>>,
    counters: HashMap<String, u64>,
}

#[derive(Debug, Default)]
struct Inner {
    state: Mutex<State>,
    pushed: Notify,
    available: AtomicBool,
    fail_next: AtomicUsize,
}

/// In-memory [`StoreClient`].
///
/// Clones share the same data.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        let inner = Inner {
            available: AtomicBool::new(true),
            ..Default::default()
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Simulate losing (`false`) or regaining (`true`) the connection.
    ///
    /// While unavailable every operation fails with `StoreUnavailable`.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Make the next `n` operations fail with `StoreUnavailable`.
    pub fn fail_next(&self, n: usize) {
        self.inner.fail_next.store(n, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        if !self.inner.available.load(Ordering::SeqCst) {
            return Err(FrontierError::StoreUnavailable(
                "memory store marked unavailable".to_string(),
            ));
        }
        let injected = self
            .inner
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if injected.is_ok() {
            return Err(FrontierError::StoreUnavailable(
                "injected memory store failure".to_string(),
            ));
        }
        Ok(())
    }

    fn state(&self) -> Result<MutexGuard<'_, State>> {
        self.inner
            .state
            .lock()
            .map_err(|_| FrontierError::Store("memory store lock poisoned".to_string()))
    }

    fn try_pop(&self, key: &str) -> Result<Option<(String, f64)>> {
        let mut state = self.state()?;
        let popped = state.sorted.get_mut(key).and_then(SortedSet::pop_first);
        if state.sorted.get(key).is_some_and(|z| z.len() == 0) {
            state.sorted.remove(key);
        }
        Ok(popped)
    }
}

#[async_trait]
impl StoreClient for MemoryStore {
    async fn push(&self, key: &str, member: &str, score: f64) -> Result<()> {
        self.check_available()?;
        self.state()?
            .sorted
            .entry(key.to_string())
            .or_default()
            .insert(member, score);
        self.inner.pushed.notify_waiters();
        Ok(())
    }

    async fn pop_min(&self, key: &str, timeout: Duration) -> Result<Option<(String, f64)>> {
        self.check_available()?;
        // None means the timeout is too large to represent: wait forever.
        let deadline = tokio::time::Instant::now().checked_add(timeout);

        loop {
            // Register interest before looking, so a push between the check
            // and the wait is not missed.
            let notified = self.inner.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(popped) = self.try_pop(key)? {
                return Ok(Some(popped));
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Ok(None);
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn count(&self, key: &str) -> Result<usize> {
        self.check_available()?;
        Ok(self.state()?.sorted.get(key).map_or(0, SortedSet::len))
    }

    async fn add_if_absent(&self, key: &str, member: &str) -> Result<bool> {
        self.check_available()?;
        Ok(self
            .state()?
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn set_count(&self, key: &str) -> Result<usize> {
        self.check_available()?;
        Ok(self.state()?.sets.get(key).map_or(0, HashSet::len))
    }

    async fn push_unseen(&self, op: &UnseenPush<'_>) -> Result<bool> {
        self.check_available()?;
        let fresh = {
            let mut state = self.state()?;
            let fresh = state
                .sets
                .entry(op.seen.to_string())
                .or_default()
                .insert(op.fingerprint.to_string());
            if fresh || op.force {
                let counter = state.counters.entry(op.sequence.to_string()).or_insert(0);
                *counter += 1;
                let member = encode_member(*counter, op.payload);
                state
                    .sorted
                    .entry(op.queue.to_string())
                    .or_default()
                    .insert(&member, op.score);
            }
            fresh
        };
        self.inner.pushed.notify_waiters();
        Ok(fresh)
    }

    async fn next_sequence(&self, key: &str) -> Result<u64> {
        self.check_available()?;
        let mut state = self.state()?;
        let counter = state.counters.entry(key.to_string()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        self.check_available()?;
        let mut state = self.state()?;
        for key in keys {
            state.sorted.remove(key);
            state.sets.remove(key);
            state.counters.remove(key);
        }
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        self.check_available()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pop_returns_lowest_score_first() {
        let store = MemoryStore::new();
        store.push("z", "b", 2.0).await.unwrap();
        store.push("z", "a", 1.0).await.unwrap();
        store.push("z", "c", -1.0).await.unwrap();

        let zero = Duration::ZERO;
        assert_eq!(store.pop_min("z", zero).await.unwrap().unwrap().0, "c");
        assert_eq!(store.pop_min("z", zero).await.unwrap().unwrap().0, "a");
        assert_eq!(store.pop_min("z", zero).await.unwrap().unwrap().0, "b");
        assert!(store.pop_min("z", zero).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_equal_scores_order_by_member() {
        let store = MemoryStore::new();
        store.push("z", "002", 5.0).await.unwrap();
        store.push("z", "001", 5.0).await.unwrap();
        let (first, score) = store.pop_min("z", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(first, "001");
        assert_eq!(score, 5.0);
    }

    #[tokio::test]
    async fn test_push_existing_member_updates_score() {
        let store = MemoryStore::new();
        store.push("z", "a", 1.0).await.unwrap();
        store.push("z", "b", 2.0).await.unwrap();
        store.push("z", "a", 3.0).await.unwrap();
        assert_eq!(store.count("z").await.unwrap(), 2);
        assert_eq!(store.pop_min("z", Duration::ZERO).await.unwrap().unwrap().0, "b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_pop_times_out() {
        let store = MemoryStore::new();
        let start = tokio::time::Instant::now();
        let popped = store.pop_min("empty", Duration::from_secs(2)).await.unwrap();
        assert!(popped.is_none());
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_pop_wakes_on_push() {
        let store = MemoryStore::new();
        let popper = {
            let store = store.clone();
            tokio::spawn(async move { store.pop_min("q", Duration::from_secs(30)).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        store.push("q", "late", 0.0).await.unwrap();

        let popped = popper.await.unwrap().unwrap();
        assert_eq!(popped.unwrap().0, "late");
    }

    #[tokio::test]
    async fn test_unbounded_pop_returns_queued_member() {
        let store = MemoryStore::new();
        store.push("q", "ready", 1.0).await.unwrap();
        let popped = store.pop_min("q", Duration::MAX).await.unwrap();
        assert_eq!(popped.unwrap().0, "ready");
    }

    #[tokio::test(start_paused = true)]
    async fn test_unbounded_pop_waits_for_push() {
        let store = MemoryStore::new();
        let popper = {
            let store = store.clone();
            tokio::spawn(async move { store.pop_min("q", Duration::MAX).await })
        };
        tokio::time::sleep(Duration::from_secs(3600)).await;
        assert!(!popper.is_finished());
        store.push("q", "late", 0.0).await.unwrap();

        let popped = popper.await.unwrap().unwrap();
        assert_eq!(popped.unwrap().0, "late");
    }

    #[tokio::test]
    async fn test_push_unseen_marks_and_queues_once() {
        let store = MemoryStore::new();
        let op = UnseenPush {
            seen: "seen",
            fingerprint: "fp",
            sequence: "seq",
            queue: "q",
            payload: "{}",
            score: 2.0,
            force: false,
        };
        assert!(store.push_unseen(&op).await.unwrap());
        assert!(!store.push_unseen(&op).await.unwrap());
        assert_eq!(store.count("q").await.unwrap(), 1);
        assert_eq!(store.set_count("seen").await.unwrap(), 1);

        let forced = UnseenPush { force: true, ..op };
        assert!(!store.push_unseen(&forced).await.unwrap());
        assert_eq!(store.count("q").await.unwrap(), 2);

        let (first, score) = store.pop_min("q", Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(first, format!("{:020}|{{}}", 1));
        assert_eq!(score, 2.0);
    }

    #[tokio::test]
    async fn test_failed_push_unseen_writes_nothing() {
        let store = MemoryStore::new();
        let op = UnseenPush {
            seen: "seen",
            fingerprint: "fp",
            sequence: "seq",
            queue: "q",
            payload: "{}",
            score: 0.0,
            force: false,
        };
        store.fail_next(1);
        assert!(store.push_unseen(&op).await.is_err());
        assert_eq!(store.set_count("seen").await.unwrap(), 0);
        assert_eq!(store.count("q").await.unwrap(), 0);

        assert!(store.push_unseen(&op).await.unwrap());
        assert_eq!(store.count("q").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_add_if_absent() {
        let store = MemoryStore::new();
        assert!(store.add_if_absent("s", "x").await.unwrap());
        assert!(!store.add_if_absent("s", "x").await.unwrap());
        assert!(store.add_if_absent("s", "y").await.unwrap());
        assert_eq!(store.set_count("s").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_sequence_and_delete() {
        let store = MemoryStore::new();
        assert_eq!(store.next_sequence("seq").await.unwrap(), 1);
        assert_eq!(store.next_sequence("seq").await.unwrap(), 2);
        store.add_if_absent("s", "x").await.unwrap();
        store
            .delete(&["seq".to_string(), "s".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(store.next_sequence("seq").await.unwrap(), 1);
        assert_eq!(store.set_count("s").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_and_injected_failures() {
        let store = MemoryStore::new();
        store.set_available(false);
        assert!(matches!(
            store.ping().await,
            Err(FrontierError::StoreUnavailable(_))
        ));
        store.set_available(true);
        store.ping().await.unwrap();

        store.fail_next(2);
        assert!(store.ping().await.is_err());
        assert!(store.count("z").await.is_err());
        store.ping().await.unwrap();
    }
}
