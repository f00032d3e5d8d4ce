//! Crawl a synthetic site with a pool of coordinators.
//!
//! This demo shows:
//! - Seeding a frontier and deduplicating discovered links
//! - Prioritizing shallow pages over deep ones
//! - Dropping items whose processing fails
//! - Stopping once the frontier stays empty, or on Ctrl+C
//!
//! Uses Redis when `REDIS_URL` (or any other store setting) is present,
//! otherwise an in-process store. Invalid settings abort the run.
//!
//! Run with: `REDIS_URL=redis://localhost cargo run -p demo-crawl`
//!
//! Start it from several terminals at once to see workers in separate
//! processes share one frontier.

use frontier_core::{
    CoordinatorConfig, FrontierConfig, MemoryStore, ProcessResult, ProcessingError, Request,
    SharedStore, StoreConfig, WorkItem, WorkerPool,
};
use frontier_redis::RedisStore;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const SITE: &str = "https://books.example";
const PAGES: u32 = 60;
const MAX_DEPTH: u32 = 4;
const WORKERS: usize = 4;

fn page_url(page: u32) -> String {
    format!("{SITE}/page/{page}")
}

fn page_number(url: &str) -> Option<u32> {
    url.rsplit('/').next()?.parse().ok()
}

/// Fetch a page and return the links found on it.
///
/// Page `n` links to `2n`, `2n + 1` and back to page 1. Every 13th page
/// fails to load.
async fn crawl_page(item: WorkItem<Request>) -> ProcessResult<Request> {
    let request = item.payload();
    let page = page_number(&request.url)
        .ok_or_else(|| ProcessingError::new(format!("unexpected url {}", request.url)))?;

    tokio::time::sleep(Duration::from_millis(50)).await;

    if page % 13 == 0 {
        return Err(ProcessingError::new(format!("HTTP 503 for {}", request.url)));
    }

    println!("[crawl] depth={} {}", request.depth, request.url);

    if request.depth >= MAX_DEPTH {
        return Ok(Vec::new());
    }

    let links = [2 * page, 2 * page + 1, 1]
        .into_iter()
        .filter(|&n| n <= PAGES)
        .map(|n| WorkItem::new(request.follow(page_url(n)), i64::from(request.depth) + 1))
        .collect::<frontier_core::Result<Vec<_>>>()?;
    Ok(links)
}

async fn open_store() -> frontier_core::Result<SharedStore> {
    let Some(config) = StoreConfig::from_env_if_set()? else {
        tracing::warn!("No Redis configured, using in-memory store");
        return Ok(SharedStore::new(MemoryStore::new()));
    };

    println!("Connecting to {:?}...", config);
    match RedisStore::connect(&config).await {
        Ok(store) => Ok(SharedStore::new(store.with_blocking_pool(WORKERS))),
        Err(e) => {
            eprintln!("Failed to connect: {}", e);
            eprintln!("Make sure Redis is running: docker run -d -p 6379:6379 redis");
            Err(e)
        }
    }
}

#[tokio::main]
async fn main() -> frontier_core::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    println!("frontier crawl demo\n");

    let job_id = std::env::var("CRAWL_JOB").unwrap_or_else(|_| "demo-crawl".to_string());
    let store = open_store().await?;

    let pool = WorkerPool::builder()
        .shared_store(store)
        .job_id(&job_id)
        .workers(WORKERS)
        .frontier_config(FrontierConfig {
            flush_on_start: std::env::var("CRAWL_FRESH").is_ok(),
            ..Default::default()
        })
        .coordinator_config(
            CoordinatorConfig::builder()
                .fetch_timeout(Duration::from_secs(1))
                .idle_backoff(Duration::from_millis(250))
                .max_idle_polls(3)
                .dead_letter(true)
                .build(),
        )
        .handler(crawl_page)
        .build()?;

    let seeded = pool
        .frontier()
        .seed(&job_id, vec![WorkItem::new(Request::get(page_url(1)), 0)?])
        .await?;
    println!("seeded {} request(s) for job {}", seeded, job_id);
    println!("\nPress Ctrl+C to stop\n");

    let report = pool.run().await?;

    let stats = pool.frontier().stats(&job_id).await?;
    println!("\n--- Report ---\n");
    println!("  processed:  {}", report.processed());
    println!("  failed:     {}", report.failed());
    println!("  enqueued:   {}", report.enqueued());
    println!("  seen:       {}", stats.seen);
    println!("  dead:       {}", stats.dead);
    for failure in &report.failures {
        println!("  worker error: {}", failure);
    }

    println!("\nDone");
    Ok(())
}
