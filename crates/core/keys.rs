//! Store key layout for a crawl job.

/// Prefix for all frontier-created keys.
pub const FRONTIER_KEY_PREFIX: &str = "frontier";

/// Builds the store keys that belong to one job.
///
/// The job id is wrapped in a `{...}` hash tag so every key of a job maps to
/// the same cluster slot.
#[derive(Debug, Clone)]
pub struct FrontierKeys {
    job_id: String,
}

impl FrontierKeys {
    /// Create a new FrontierKeys instance for the given job.
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
        }
    }

    /// Get the job id.
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    /// Key for the pending work items (ZSET, scored by priority).
    pub fn queue(&self) -> String {
        format!("{}:{{{}}}:queue", FRONTIER_KEY_PREFIX, self.job_id)
    }

    /// Key for the insertion sequence counter (STRING).
    pub fn sequence(&self) -> String {
        format!("{}:{{{}}}:seq", FRONTIER_KEY_PREFIX, self.job_id)
    }

    /// Key for the fingerprints seen so far (SET).
    pub fn seen(&self) -> String {
        format!("{}:{{{}}}:seen", FRONTIER_KEY_PREFIX, self.job_id)
    }

    /// Key for items whose processing failed (ZSET, scored by failure time).
    pub fn dead(&self) -> String {
        format!("{}:{{{}}}:dead", FRONTIER_KEY_PREFIX, self.job_id)
    }

    /// Every key owned by the job, for teardown.
    pub fn all(&self) -> Vec<String> {
        vec![self.queue(), self.sequence(), self.seen(), self.dead()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frontier_keys() {
        let keys = FrontierKeys::new("books");
        assert_eq!(keys.queue(), "frontier:{books}:queue");
        assert_eq!(keys.sequence(), "frontier:{books}:seq");
        assert_eq!(keys.seen(), "frontier:{books}:seen");
        assert_eq!(keys.dead(), "frontier:{books}:dead");
    }

    #[test]
    fn test_frontier_keys_job_id() {
        let keys = FrontierKeys::new(String::from("staging"));
        assert_eq!(keys.job_id(), "staging");
    }

    #[test]
    fn test_frontier_keys_share_hash_tag() {
        let keys = FrontierKeys::new("crawl:v2");
        for key in keys.all() {
            assert!(key.contains("{crawl:v2}"), "missing hash tag in {}", key);
        }
        assert_eq!(keys.all().len(), 4);
    }
}
