//! Fingerprint deduplication shared by all workers of a job.

use crate::error::Result;
use crate::fingerprint::Fingerprint;
use crate::keys::FrontierKeys;
use crate::store::StoreClient;

/// Records fingerprints in the job's seen set.
///
/// Check and insert happen in one store call, so two workers discovering the
/// same item concurrently cannot both enqueue it.
#[derive(Clone)]
pub struct Deduper<S: StoreClient> {
    store: S,
}

impl<S: StoreClient> Deduper<S> {
    /// Create a deduper over the given store.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Mark `fingerprint` as seen for `job_id`.
    ///
    /// Returns `true` if this call inserted it (first sighting) and `false` if
    /// it was already present. Store failures are returned as is.
    pub async fn seen_or_mark(&self, job_id: &str, fingerprint: &Fingerprint) -> Result<bool> {
        let keys = FrontierKeys::new(job_id);
        let inserted = self
            .store
            .add_if_absent(&keys.seen(), &fingerprint.to_hex())
            .await?;

        if !inserted {
            tracing::trace!(job_id = %job_id, fingerprint = %fingerprint, "Duplicate fingerprint");
        }
        Ok(inserted)
    }

    /// Number of fingerprints recorded for the job.
    pub async fn seen_count(&self, job_id: &str) -> Result<usize> {
        self.store.set_count(&FrontierKeys::new(job_id).seen()).await
    }

    /// Forget every fingerprint of the job.
    pub async fn clear(&self, job_id: &str) -> Result<()> {
        self.store
            .delete(&[FrontierKeys::new(job_id).seen()])
            .await
    }
}
