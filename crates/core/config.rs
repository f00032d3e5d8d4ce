//! Configuration types for the frontier.
//!
//! [`StoreConfig`] is resolved once at startup from an already-loaded settings
//! map (or the process environment) and is validated eagerly; nothing touches
//! the store with an incomplete configuration.

use std::collections::HashMap;
use std::time::Duration;

use crate::backoff::Backoff;
use crate::error::{FrontierError, Result};
use crate::queue::PriorityOrder;

// ========== Store Connection ==========

/// Settings keys understood by [`StoreConfig::from_map`].
pub mod keys {
    /// Standalone connection URL.
    pub const REDIS_URL: &str = "REDIS_URL";
    /// Standalone host, used when no URL is given.
    pub const REDIS_HOST: &str = "REDIS_HOST";
    /// Standalone port, defaults to 6379.
    pub const REDIS_PORT: &str = "REDIS_PORT";
    /// Value encoding; only UTF-8 is supported.
    pub const REDIS_ENCODING: &str = "REDIS_ENCODING";
    /// Cluster entry URL.
    pub const REDIS_CLUSTER_URL: &str = "REDIS_CLUSTER_URL";
    /// Comma separated cluster nodes (`host:port` or URLs).
    pub const STARTUP_NODES: &str = "STARTUP_NODES";
    /// Explicit `true`/`false` switch between the two variants.
    pub const REDIS_CLUSTER_MODE: &str = "REDIS_CLUSTER_MODE";

    pub(crate) const ALL: [&str; 7] = [
        REDIS_URL,
        REDIS_HOST,
        REDIS_PORT,
        REDIS_ENCODING,
        REDIS_CLUSTER_URL,
        STARTUP_NODES,
        REDIS_CLUSTER_MODE,
    ];
}

const DEFAULT_PORT: u16 = 6379;

/// How to reach the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreConfig {
    /// A single node.
    Standalone {
        /// Connection URL, e.g. `redis://localhost:6379/0`.
        url: String,
    },
    /// A cluster, reached through one or more startup nodes.
    Clustered {
        /// Node URLs.
        nodes: Vec<String>,
    },
}

impl StoreConfig {
    /// Standalone configuration from a URL.
    pub fn standalone(url: impl Into<String>) -> Self {
        StoreConfig::Standalone { url: url.into() }
    }

    /// Cluster configuration from node addresses.
    pub fn clustered<I, N>(nodes: I) -> Self
    where
        I: IntoIterator<Item = N>,
        N: AsRef<str>,
    {
        StoreConfig::Clustered {
            nodes: nodes.into_iter().map(|n| node_url(n.as_ref())).collect(),
        }
    }

    /// Whether this is the cluster variant.
    pub fn is_clustered(&self) -> bool {
        matches!(self, StoreConfig::Clustered { .. })
    }

    /// Resolve from a settings map.
    ///
    /// Cluster mode is taken from `REDIS_CLUSTER_MODE` when set, otherwise
    /// inferred from which keys are present. Missing or conflicting keys are a
    /// configuration error. Empty values count as absent.
    pub fn from_map(settings: &HashMap<String, String>) -> Result<Self> {
        let get = |key: &str| {
            settings
                .get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
        };

        if let Some(encoding) = get(keys::REDIS_ENCODING) {
            let normalized = encoding.to_ascii_lowercase().replace(['-', '_'], "");
            if normalized != "utf8" {
                return Err(FrontierError::Config(format!(
                    "unsupported {}: {encoding} (only utf-8)",
                    keys::REDIS_ENCODING
                )));
            }
        }

        let has_standalone = [keys::REDIS_URL, keys::REDIS_HOST, keys::REDIS_PORT]
            .iter()
            .any(|k| get(*k).is_some());
        let has_cluster = [keys::REDIS_CLUSTER_URL, keys::STARTUP_NODES]
            .iter()
            .any(|k| get(*k).is_some());

        let cluster_mode = match get(keys::REDIS_CLUSTER_MODE) {
            Some(raw) => parse_bool(keys::REDIS_CLUSTER_MODE, raw)?,
            None => {
                if has_standalone && has_cluster {
                    return Err(FrontierError::Config(format!(
                        "both standalone and cluster settings present; set {} to choose",
                        keys::REDIS_CLUSTER_MODE
                    )));
                }
                has_cluster
            }
        };

        if cluster_mode {
            let mut nodes = Vec::new();
            if let Some(url) = get(keys::REDIS_CLUSTER_URL) {
                nodes.push(node_url(url));
            }
            if let Some(list) = get(keys::STARTUP_NODES) {
                nodes.extend(
                    list.split(',')
                        .map(str::trim)
                        .filter(|n| !n.is_empty())
                        .map(node_url),
                );
            }
            if nodes.is_empty() {
                return Err(FrontierError::Config(format!(
                    "cluster mode requires {} or {}",
                    keys::REDIS_CLUSTER_URL,
                    keys::STARTUP_NODES
                )));
            }
            return Ok(StoreConfig::Clustered { nodes });
        }

        if let Some(url) = get(keys::REDIS_URL) {
            return Ok(StoreConfig::Standalone {
                url: url.to_string(),
            });
        }

        let port = match get(keys::REDIS_PORT) {
            Some(raw) => raw.parse::<u16>().map_err(|_| {
                FrontierError::Config(format!("{} is not a valid port: {raw}", keys::REDIS_PORT))
            })?,
            None => DEFAULT_PORT,
        };

        match get(keys::REDIS_HOST) {
            Some(host) => Ok(StoreConfig::Standalone {
                url: format!("redis://{host}:{port}/"),
            }),
            None => Err(FrontierError::Config(format!(
                "no store configured: set {} or {} (standalone), or {} / {} (cluster)",
                keys::REDIS_URL,
                keys::REDIS_HOST,
                keys::REDIS_CLUSTER_URL,
                keys::STARTUP_NODES
            ))),
        }
    }

    /// Like [`from_map`](Self::from_map), but `None` when no store key is set.
    ///
    /// Once any key is present the settings must be valid.
    pub fn from_map_if_set(settings: &HashMap<String, String>) -> Result<Option<Self>> {
        let any_set = keys::ALL
            .iter()
            .any(|k| settings.get(*k).is_some_and(|v| !v.trim().is_empty()));
        if !any_set {
            return Ok(None);
        }
        Self::from_map(settings).map(Some)
    }

    /// Resolve from process environment variables with the same names.
    pub fn from_env() -> Result<Self> {
        Self::from_map(&env_settings())
    }

    /// Resolve from the environment, or `None` when no store key is set.
    pub fn from_env_if_set() -> Result<Option<Self>> {
        Self::from_map_if_set(&env_settings())
    }
}

fn env_settings() -> HashMap<String, String> {
    keys::ALL
        .iter()
        .filter_map(|k| std::env::var(k).ok().map(|v| (k.to_string(), v)))
        .collect()
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(FrontierError::Config(format!(
            "{key} must be true or false, got {raw}"
        ))),
    }
}

fn node_url(node: &str) -> String {
    if node.contains("://") {
        node.to_string()
    } else {
        format!("redis://{node}")
    }
}

// ========== Frontier ==========

/// Job lifecycle settings for a [`Frontier`](crate::Frontier).
#[derive(Debug, Clone, PartialEq)]
pub struct FrontierConfig {
    /// Which priorities are served first.
    pub priority_order: PriorityOrder,
    /// Keep queue and seen set when the job closes.
    pub persist: bool,
    /// Drop any leftover state when the job opens.
    pub flush_on_start: bool,
}

impl Default for FrontierConfig {
    fn default() -> Self {
        Self {
            priority_order: PriorityOrder::LowestFirst,
            persist: true,
            flush_on_start: false,
        }
    }
}

// ========== Coordinator ==========

/// Configuration for a worker coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// How long one pop may block waiting for work.
    pub fetch_timeout: Duration,
    /// Pause after an empty pop before polling again.
    pub idle_backoff: Duration,
    /// Stop after this many consecutive empty polls. `None` polls forever.
    pub max_idle_polls: Option<u32>,
    /// Backoff between retries of a failing store operation.
    pub store_backoff: Backoff,
    /// Consecutive store failures tolerated before stopping.
    pub max_store_failures: u32,
    /// Record failed items in the job's dead-letter set.
    pub dead_letter: bool,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(5),
            idle_backoff: Duration::from_millis(500),
            max_idle_polls: None,
            store_backoff: Backoff::default(),
            max_store_failures: 10,
            dead_letter: false,
        }
    }
}

/// Builder for CoordinatorConfig.
#[derive(Debug, Default)]
pub struct CoordinatorConfigBuilder {
    config: CoordinatorConfig,
}

impl CoordinatorConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the fetch timeout.
    pub fn fetch_timeout(mut self, timeout: Duration) -> Self {
        self.config.fetch_timeout = timeout;
        self
    }

    /// Set the pause after an empty poll.
    pub fn idle_backoff(mut self, backoff: Duration) -> Self {
        self.config.idle_backoff = backoff;
        self
    }

    /// Stop after `polls` consecutive empty polls.
    pub fn max_idle_polls(mut self, polls: u32) -> Self {
        self.config.max_idle_polls = Some(polls);
        self
    }

    /// Set the store retry backoff.
    pub fn store_backoff(mut self, backoff: Backoff) -> Self {
        self.config.store_backoff = backoff;
        self
    }

    /// Set the number of consecutive store failures tolerated.
    pub fn max_store_failures(mut self, failures: u32) -> Self {
        self.config.max_store_failures = failures;
        self
    }

    /// Enable or disable the dead-letter set.
    pub fn dead_letter(mut self, enabled: bool) -> Self {
        self.config.dead_letter = enabled;
        self
    }

    /// Build the CoordinatorConfig.
    pub fn build(self) -> CoordinatorConfig {
        self.config
    }
}

impl CoordinatorConfig {
    /// Create a new builder.
    pub fn builder() -> CoordinatorConfigBuilder {
        CoordinatorConfigBuilder::new()
    }
}
