use std::sync::Arc;

use blindpair_core::error::StoreError;
use blindpair_core::profile::PublicProfile;
use blindpair_core::records::{self, QUEUE_ROOT, QueueEntry, queue_key};
use blindpair_core::store::{Store, children};
use blindpair_core::time::{Timestamp, now_millis};

/// Pool of users waiting for a partner, one entry per uid.
#[derive(Clone)]
pub struct QueueManager {
    store: Arc<dyn Store>,
}

impl QueueManager {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Advertise `profile` as waiting. Re-joining overwrites the old entry.
    pub async fn join(&self, profile: &PublicProfile) -> Result<(), StoreError> {
        let key = queue_key(&profile.uid);
        let entry = QueueEntry::new(profile, now_millis());
        self.store.upsert(&key, records::encode(&key, &entry)?).await?;
        tracing::debug!(uid = %profile.uid, "Joined queue");
        Ok(())
    }

    /// Remove `uid` from the pool. No-op if absent.
    pub async fn leave(&self, uid: &str) -> Result<(), StoreError> {
        self.store.delete(&queue_key(uid)).await
    }

    /// Fresh entries other than `exclude_uid`, in snapshot (key) order.
    ///
    /// The order carries no fairness guarantee.
    pub async fn scan(
        &self,
        exclude_uid: &str,
        max_age_ms: u64,
    ) -> Result<Vec<QueueEntry>, StoreError> {
        self.scan_at(exclude_uid, max_age_ms, now_millis()).await
    }

    pub async fn scan_at(
        &self,
        exclude_uid: &str,
        max_age_ms: u64,
        now: Timestamp,
    ) -> Result<Vec<QueueEntry>, StoreError> {
        let snapshot = self.store.get(QUEUE_ROOT).await?;
        let mut candidates = Vec::new();
        for (uid, value) in children(snapshot) {
            if uid == exclude_uid {
                continue;
            }
            let key = queue_key(&uid);
            match records::decode::<QueueEntry>(&key, value) {
                Ok(entry) if entry.uid != exclude_uid && entry.is_fresh(now, max_age_ms) => {
                    candidates.push(entry);
                },
                Ok(_) => {},
                Err(e) => tracing::warn!(key = %key, error = %e, "Skipping malformed queue entry"),
            }
        }
        Ok(candidates)
    }
}
