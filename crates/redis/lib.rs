//! Redis store for the frontier coordinator.
//!
//! Implements [`StoreClient`] on top of a single Redis node or a Redis
//! Cluster. Every key of a job carries the same hash tag, so a job's queue,
//! sequence and seen set always live in one cluster slot.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use frontier_core::{Frontier, FrontierConfig, StoreConfig};
//! use frontier_redis::RedisStore;
//!
//! #[tokio::main]
//! async fn main() -> frontier_core::Result<()> {
//!     let store = RedisStore::connect(&StoreConfig::from_env()?).await?;
//!     let frontier = Frontier::new(store, FrontierConfig::default());
//!     println!("{:?}", frontier.stats("my-crawl").await?);
//!     Ok(())
//! }
//! ```

use async_trait::async_trait;
use frontier_core::{FrontierError, Result, StoreClient, StoreConfig, UnseenPush};
use redis::aio::ConnectionManager;
use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;
use redis::{
    Cmd, ErrorKind, FromRedisValue, RedisError, RedisResult, Script, ScriptInvocation,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Default number of idle connections kept for blocking pops.
pub const DEFAULT_BLOCKING_POOL: usize = 16;

/// Smallest timeout sent with BZPOPMIN; zero would block forever.
const MIN_BLOCK_SECS: f64 = 0.001;

/// Timeouts at or above this many seconds block without limit.
const MAX_BLOCK_SECS: f64 = 1.0e9;

/// KEYS: seen, sequence, queue. ARGV: fingerprint, payload, score, force.
const PUSH_UNSEEN_SCRIPT: &str = r"
local fresh = redis.call('SADD', KEYS[1], ARGV[1])
if fresh == 1 or ARGV[4] == '1' then
    local seq = redis.call('INCR', KEYS[2])
    redis.call('ZADD', KEYS[3], ARGV[3], string.format('%020d', seq) .. '|' .. ARGV[2])
end
return fresh
";

/// BZPOPMIN timeout argument for `timeout`; 0 blocks forever.
fn block_secs(timeout: Duration) -> f64 {
    let secs = timeout.as_secs_f64();
    if secs >= MAX_BLOCK_SECS {
        0.0
    } else {
        secs.max(MIN_BLOCK_SECS)
    }
}

/// Bounded stack of idle connections.
struct IdlePool<C> {
    idle: Mutex<Vec<C>>,
    capacity: usize,
}

impl<C> IdlePool<C> {
    fn new(capacity: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::with_capacity(capacity)),
            capacity,
        }
    }

    fn take(&self) -> Option<C> {
        self.idle.lock().ok().and_then(|mut idle| idle.pop())
    }

    /// Keep `conn` for reuse; returns false if the pool was full.
    fn put(&self, conn: C) -> bool {
        match self.idle.lock() {
            Ok(mut idle) if idle.len() < self.capacity => {
                idle.push(conn);
                true
            }
            _ => false,
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.idle.lock().map_or(0, |idle| idle.len())
    }
}

enum Client {
    Standalone(redis::Client),
    Clustered(ClusterClient),
}

impl Client {
    async fn connect(&self) -> RedisResult<Connection> {
        match self {
            Client::Standalone(client) => Ok(Connection::Standalone(
                ConnectionManager::new(client.clone()).await?,
            )),
            Client::Clustered(client) => Ok(Connection::Clustered(
                client.get_async_connection().await?,
            )),
        }
    }
}

#[derive(Clone)]
enum Connection {
    Standalone(ConnectionManager),
    Clustered(ClusterConnection),
}

impl Connection {
    async fn query<T: FromRedisValue>(&mut self, cmd: &Cmd) -> RedisResult<T> {
        match self {
            Connection::Standalone(conn) => cmd.query_async(conn).await,
            Connection::Clustered(conn) => cmd.query_async(conn).await,
        }
    }

    async fn invoke<T: FromRedisValue>(
        &mut self,
        script: &ScriptInvocation<'_>,
    ) -> RedisResult<T> {
        match self {
            Connection::Standalone(conn) => script.invoke_async(conn).await,
            Connection::Clustered(conn) => script.invoke_async(conn).await,
        }
    }
}

/// Redis-backed [`StoreClient`].
///
/// Regular commands share one multiplexed connection. Blocking pops hold a
/// connection for up to their timeout, so each one runs on a connection
/// checked out of an idle pool instead. A pop that finds the pool empty opens
/// a new connection; in cluster mode that is a full `ClusterConnection` with
/// its own slot map, so size the pool with
/// [`with_blocking_pool`](Self::with_blocking_pool) to at least the number of
/// workers sharing this store.
#[derive(Clone)]
pub struct RedisStore {
    client: Arc<Client>,
    conn: Connection,
    blocking: Arc<IdlePool<Connection>>,
    push_unseen: Arc<Script>,
    clustered: bool,
}

impl RedisStore {
    /// Connect according to `config` and verify the connection with PING.
    ///
    /// A malformed URL is a `Config` error; an unreachable server is
    /// `StoreUnavailable`.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let client = match config {
            StoreConfig::Standalone { url } => {
                Client::Standalone(redis::Client::open(url.as_str()).map_err(config_error)?)
            }
            StoreConfig::Clustered { nodes } => {
                Client::Clustered(ClusterClient::new(nodes.clone()).map_err(config_error)?)
            }
        };

        let conn = client.connect().await.map_err(store_error)?;
        let store = Self {
            client: Arc::new(client),
            conn,
            blocking: Arc::new(IdlePool::new(DEFAULT_BLOCKING_POOL)),
            push_unseen: Arc::new(Script::new(PUSH_UNSEEN_SCRIPT)),
            clustered: config.is_clustered(),
        };
        store.ping().await?;

        tracing::info!(clustered = store.clustered, "Connected to Redis");
        Ok(store)
    }

    /// Connect to a single node by URL.
    pub async fn new(redis_url: &str) -> Result<Self> {
        Self::connect(&StoreConfig::standalone(redis_url)).await
    }

    /// Connect using the `REDIS_*` environment variables.
    pub async fn from_env() -> Result<Self> {
        Self::connect(&StoreConfig::from_env()?).await
    }

    /// Keep up to `size` idle connections for blocking pops.
    ///
    /// Idle connections already pooled are dropped.
    pub fn with_blocking_pool(mut self, size: usize) -> Self {
        self.blocking = Arc::new(IdlePool::new(size));
        self
    }

    /// Whether this store talks to a cluster.
    pub fn is_clustered(&self) -> bool {
        self.clustered
    }

    async fn query<T: FromRedisValue>(&self, cmd: &Cmd) -> Result<T> {
        let mut conn = self.conn.clone();
        conn.query(cmd).await.map_err(store_error)
    }

    async fn checkout(&self) -> Result<Connection> {
        match self.blocking.take() {
            Some(conn) => Ok(conn),
            None => {
                tracing::debug!(clustered = self.clustered, "Opening blocking connection");
                self.client.connect().await.map_err(store_error)
            }
        }
    }

    fn checkin(&self, conn: Connection) {
        if !self.blocking.put(conn) {
            tracing::trace!("Blocking pool full, closing connection");
        }
    }
}

#[async_trait]
impl StoreClient for RedisStore {
    async fn push(&self, key: &str, member: &str, score: f64) -> Result<()> {
        self.query::<()>(redis::cmd("ZADD").arg(key).arg(score).arg(member))
            .await
    }

    async fn pop_min(&self, key: &str, timeout: Duration) -> Result<Option<(String, f64)>> {
        if timeout.is_zero() {
            let popped: Vec<(String, f64)> = self
                .query(redis::cmd("ZPOPMIN").arg(key).arg(1))
                .await?;
            return Ok(popped.into_iter().next());
        }

        let mut conn = self.checkout().await?;
        let reply: Option<(String, String, f64)> = conn
            .query(
                redis::cmd("BZPOPMIN")
                    .arg(key)
                    .arg(block_secs(timeout)),
            )
            .await
            .map_err(store_error)?;
        self.checkin(conn);

        Ok(reply.map(|(_, member, score)| (member, score)))
    }

    async fn count(&self, key: &str) -> Result<usize> {
        self.query(redis::cmd("ZCARD").arg(key)).await
    }

    async fn add_if_absent(&self, key: &str, member: &str) -> Result<bool> {
        let added: i64 = self.query(redis::cmd("SADD").arg(key).arg(member)).await?;
        Ok(added > 0)
    }

    async fn set_count(&self, key: &str) -> Result<usize> {
        self.query(redis::cmd("SCARD").arg(key)).await
    }

    async fn push_unseen(&self, op: &UnseenPush<'_>) -> Result<bool> {
        let mut invocation = self.push_unseen.key(op.seen);
        invocation
            .key(op.sequence)
            .key(op.queue)
            .arg(op.fingerprint)
            .arg(op.payload)
            .arg(op.score)
            .arg(if op.force { "1" } else { "0" });

        let mut conn = self.conn.clone();
        let fresh: i64 = conn.invoke(&invocation).await.map_err(store_error)?;
        Ok(fresh == 1)
    }

    async fn next_sequence(&self, key: &str) -> Result<u64> {
        self.query(redis::cmd("INCR").arg(key)).await
    }

    async fn delete(&self, keys: &[String]) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }
        self.query::<()>(redis::cmd("DEL").arg(keys)).await
    }

    async fn ping(&self) -> Result<()> {
        let reply: String = self.query(&redis::cmd("PING")).await?;
        if reply != "PONG" {
            return Err(FrontierError::Store(format!("unexpected PING reply: {reply}")));
        }
        Ok(())
    }
}

/// Build a store for `config`. Same as [`RedisStore::connect`].
pub async fn connect(config: &StoreConfig) -> Result<RedisStore> {
    RedisStore::connect(config).await
}

/// Map a Redis error: connectivity problems are transient, the rest are not.
fn store_error(err: RedisError) -> FrontierError {
    let transient = err.is_io_error()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_timeout()
        || err.is_cluster_error()
        || matches!(
            err.kind(),
            ErrorKind::BusyLoadingError | ErrorKind::TryAgain | ErrorKind::MasterDown
        );

    if transient {
        FrontierError::StoreUnavailable(err.to_string())
    } else {
        FrontierError::Store(err.to_string())
    }
}

fn config_error(err: RedisError) -> FrontierError {
    FrontierError::Config(err.to_string())
}


#[cfg(test)]
mod integration_tests {
    use super::*;
    use frontier_core::{
        CoordinatorConfig, Deduper, Enqueued, Fingerprint, Frontier, FrontierConfig,
        FrontierKeys, FrontierQueue, PriorityOrder, ProcessResult, Request, StopReason, WorkItem,
        WorkerPool,
    };

    fn redis_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
    }

    fn test_job() -> String {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("frontier_test_{}", ts)
    }

    async fn store() -> RedisStore {
        RedisStore::new(&redis_url())
            .await
            .expect("Failed to connect to Redis")
    }

    fn request(url: &str, priority: i64) -> WorkItem<Request> {
        WorkItem::new(Request::get(url), priority).unwrap()
    }

    async fn cleanup(store: &RedisStore, job: &str) {
        store.delete(&FrontierKeys::new(job).all()).await.ok();
    }

    #[tokio::test]
    #[ignore = "requires running Redis server"]
    async fn test_queue_orders_by_priority_then_fifo() {
        let store = store().await;
        let job = test_job();
        let queue = FrontierQueue::new(store.clone(), PriorityOrder::LowestFirst);

        queue.push(&job, &request("https://example.com/a", 5)).await.unwrap();
        queue.push(&job, &request("https://example.com/b", 1)).await.unwrap();
        queue.push(&job, &request("https://example.com/c", 5)).await.unwrap();
        assert_eq!(queue.size(&job).await.unwrap(), 3);

        let mut urls = Vec::new();
        while let Some(item) = queue
            .pop::<Request>(&job, Duration::from_millis(100))
            .await
            .unwrap()
        {
            urls.push(item.into_payload().url);
        }
        assert_eq!(
            urls,
            vec![
                "https://example.com/b",
                "https://example.com/a",
                "https://example.com/c"
            ]
        );

        cleanup(&store, &job).await;
    }

    #[tokio::test]
    #[ignore = "requires running Redis server"]
    async fn test_pop_times_out_on_empty_queue() {
        let store = store().await;
        let job = test_job();
        let queue = FrontierQueue::new(store, PriorityOrder::default());

        let start = std::time::Instant::now();
        let popped = queue
            .pop::<Request>(&job, Duration::from_millis(300))
            .await
            .unwrap();
        assert!(popped.is_none());
        assert!(start.elapsed() >= Duration::from_millis(250));

        let popped = queue.pop::<Request>(&job, Duration::ZERO).await.unwrap();
        assert!(popped.is_none());
    }

    #[tokio::test]
    #[ignore = "requires running Redis server"]
    async fn test_dedupe_across_connections() {
        let job = test_job();
        let first = Deduper::new(store().await);
        let second = Deduper::new(store().await);
        let fp = Fingerprint::from_canonical_bytes(b"shared");

        assert!(first.seen_or_mark(&job, &fp).await.unwrap());
        assert!(!second.seen_or_mark(&job, &fp).await.unwrap());
        assert_eq!(second.seen_count(&job).await.unwrap(), 1);

        first.clear(&job).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore = "requires running Redis server"]
    async fn test_concurrent_pops_deliver_each_item_once() {
        let store = store().await;
        let job = test_job();
        let frontier = Frontier::new(store.clone(), FrontierConfig::default());
        for i in 0..20 {
            frontier
                .enqueue(&job, &request(&format!("https://example.com/{i}"), 0))
                .await
                .unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let frontier = frontier.clone();
            let job = job.clone();
            handles.push(tokio::spawn(async move {
                let mut got = Vec::new();
                while let Some(item) = frontier
                    .next::<Request>(&job, Duration::from_millis(200))
                    .await
                    .unwrap()
                {
                    got.push(item.into_payload().url);
                }
                got
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 20);

        cleanup(&store, &job).await;
    }

    #[tokio::test]
    #[ignore = "requires running Redis server"]
    async fn test_push_unseen_is_one_step() {
        let store = store().await;
        let job = test_job();
        let keys = FrontierKeys::new(&job);
        let (seen, sequence, queue) = (keys.seen(), keys.sequence(), keys.queue());
        let op = UnseenPush {
            seen: &seen,
            fingerprint: "fp",
            sequence: &sequence,
            queue: &queue,
            payload: "{}",
            score: -2.0,
            force: false,
        };

        assert!(store.push_unseen(&op).await.unwrap());
        assert!(!store.push_unseen(&op).await.unwrap());
        assert!(!store.push_unseen(&UnseenPush { force: true, ..op }).await.unwrap());
        assert_eq!(store.count(&queue).await.unwrap(), 2);
        assert_eq!(store.set_count(&seen).await.unwrap(), 1);

        let (member, score) = store.pop_min(&queue, Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(member, format!("{:020}|{{}}", 1));
        assert_eq!(score, -2.0);

        cleanup(&store, &job).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore = "requires running Redis server"]
    async fn test_blocking_pool_keeps_at_most_its_size() {
        let store = store().await.with_blocking_pool(2);
        let job = test_job();
        let queue = FrontierKeys::new(&job).queue();

        let mut pops = Vec::new();
        for _ in 0..4 {
            let store = store.clone();
            let queue = queue.clone();
            pops.push(tokio::spawn(async move {
                store.pop_min(&queue, Duration::from_millis(200)).await
            }));
        }
        for pop in pops {
            assert!(pop.await.unwrap().unwrap().is_none());
        }
        assert_eq!(store.blocking.len(), 2);
    }

    #[tokio::test]
    #[ignore = "requires running Redis server"]
    async fn test_frontier_rejects_duplicates() {
        let store = store().await;
        let job = test_job();
        let frontier = Frontier::new(store.clone(), FrontierConfig::default());

        let item = request("https://example.com/page?b=2&a=1", 0);
        let same = request("https://example.com/page?a=1&b=2#top", 3);
        assert_eq!(frontier.enqueue(&job, &item).await.unwrap(), Enqueued::Queued);
        assert_eq!(frontier.enqueue(&job, &same).await.unwrap(), Enqueued::Duplicate);

        let stats = frontier.stats(&job).await.unwrap();
        assert_eq!((stats.queued, stats.seen), (1, 1));

        cleanup(&store, &job).await;
    }

    async fn follow_once(item: WorkItem<Request>) -> ProcessResult<Request> {
        let req = item.payload();
        if req.depth > 0 {
            return Ok(Vec::new());
        }
        Ok(vec![
            WorkItem::new(req.follow("https://example.com/next"), 0)?,
            WorkItem::new(req.follow("https://example.com/"), 0)?,
        ])
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    #[ignore = "requires running Redis server"]
    async fn test_worker_pool_against_redis() {
        let store = store().await;
        let job = test_job();

        let pool = WorkerPool::builder()
            .store(store.clone())
            .job_id(&job)
            .workers(3)
            .coordinator_config(
                CoordinatorConfig::builder()
                    .fetch_timeout(Duration::from_millis(200))
                    .idle_backoff(Duration::from_millis(50))
                    .max_idle_polls(2)
                    .build(),
            )
            .handler(follow_once)
            .build()
            .unwrap();

        pool.frontier()
            .seed(&job, vec![request("https://example.com/", 0)])
            .await
            .unwrap();

        let report = pool.run_until(std::future::pending()).await.unwrap();
        assert!(report.is_clean());
        assert_eq!(report.processed(), 2);
        assert!(report
            .workers
            .iter()
            .all(|w| w.stop_reason == Some(StopReason::Idle)));

        cleanup(&store, &job).await;
    }
}
