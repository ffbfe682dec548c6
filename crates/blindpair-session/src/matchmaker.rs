use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::time::Instant;

use blindpair_core::error::{MatchError, StoreError};
use blindpair_core::profile::{Profile, PublicProfile};
use blindpair_core::records::{self, MatchRecord, QueueEntry, match_key};
use blindpair_core::room::RoomId;
use blindpair_core::store::Store;
use blindpair_core::time::now_millis;

use crate::queue::QueueManager;

const RESUBSCRIBE_PAUSE: Duration = Duration::from_millis(250);

/// How a search concluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pairing {
    /// We picked a waiting candidate and wrote the pair ourselves.
    /// `partial` holds the first of the follow-up writes that failed.
    Created {
        record: MatchRecord,
        partial: Option<MatchError>,
    },
    /// Another user picked us while we waited in the queue.
    Found(MatchRecord),
}

impl Pairing {
    pub fn record(&self) -> &MatchRecord {
        match self {
            Pairing::Created { record, .. } | Pairing::Found(record) => record,
        }
    }
}

/// Pairs waiting users by writing reciprocal match records.
///
/// Writes to different keys are independent. Two searchers that pick the
/// same candidate both succeed locally and the last write to the
/// candidate's record wins; the loser is left in a ghost match that the
/// notification bridge detects.
#[derive(Clone)]
pub struct Matchmaker {
    store: Arc<dyn Store>,
    queue: QueueManager,
}

impl Matchmaker {
    pub fn new(store: Arc<dyn Store>) -> Self {
        let queue = QueueManager::new(Arc::clone(&store));
        Self { store, queue }
    }

    pub fn queue(&self) -> &QueueManager {
        &self.queue
    }

    /// Only verified profiles may match.
    pub fn check_eligible(profile: &Profile) -> Result<(), MatchError> {
        if profile.is_verified {
            Ok(())
        } else {
            Err(MatchError::VerificationRequired)
        }
    }

    /// One full search attempt: pair with the first fresh candidate, or
    /// queue up and wait up to `timeout` for someone to pick us.
    pub async fn start_match(
        &self,
        me: &PublicProfile,
        max_age_ms: u64,
        timeout: Duration,
    ) -> Result<Pairing, MatchError> {
        let candidates = self.queue.scan(&me.uid, max_age_ms).await?;
        if let Some(partner) = candidates.into_iter().next() {
            return self.create_match(me, &partner).await;
        }

        self.queue.join(me).await?;
        let result = self.await_match(&me.uid, timeout).await;
        if let Err(e) = self.queue.leave(&me.uid).await {
            tracing::warn!(uid = %me.uid, error = %e, "Failed to leave queue");
        }
        result.map(Pairing::Found)
    }

    /// Write `MatchRecord[me]`, then `MatchRecord[partner]`, then remove the
    /// partner's queue entry. Nothing is rolled back.
    pub async fn create_match(
        &self,
        me: &PublicProfile,
        partner: &QueueEntry,
    ) -> Result<Pairing, MatchError> {
        let room_id = RoomId::generate();
        let partner_info = partner.public();
        let (mine, theirs) = MatchRecord::pair(&room_id, me, &partner_info, now_millis());

        let my_key = match_key(&me.uid);
        if let Err(source) = self.write_record(&my_key, &mine).await {
            return Err(MatchError::PartialWriteFailure {
                key: my_key,
                source,
            });
        }

        let mut partial = None;
        let their_key = match_key(&partner.uid);
        if let Err(source) = self.write_record(&their_key, &theirs).await {
            tracing::warn!(room = %room_id, partner = %partner.uid, error = %source, "Partner match write failed");
            partial = Some(MatchError::PartialWriteFailure {
                key: their_key,
                source,
            });
        }
        if let Err(source) = self.queue.leave(&partner.uid).await {
            tracing::warn!(room = %room_id, partner = %partner.uid, error = %source, "Failed to dequeue partner");
            partial.get_or_insert(MatchError::PartialWriteFailure {
                key: records::queue_key(&partner.uid),
                source,
            });
        }

        tracing::info!(uid = %me.uid, partner = %partner.uid, room = %room_id, "Created match");
        Ok(Pairing::Created {
            record: mine,
            partial,
        })
    }

    /// Wait for a match record to appear under our own key whose partner
    /// record points back at us.
    ///
    /// A record without a reciprocal partner record is left over from a
    /// lost pairing; it is deleted and the wait goes on. Lost subscriptions
    /// are re-established until the deadline.
    pub async fn await_match(&self, uid: &str, timeout: Duration) -> Result<MatchRecord, MatchError> {
        let deadline = Instant::now() + timeout;
        loop {
            let attempt = tokio::time::timeout_at(deadline, self.watch_for_record(uid)).await;
            match attempt {
                Err(_) => return Err(MatchError::SearchTimeout),
                Ok(Ok(record)) => return Ok(record),
                Ok(Err(e)) => {
                    tracing::warn!(uid, error = %e, "Match watch lost, resubscribing");
                    let pause = tokio::time::sleep(RESUBSCRIBE_PAUSE);
                    if tokio::time::timeout_at(deadline, pause).await.is_err() {
                        return Err(MatchError::SearchTimeout);
                    }
                },
            }
        }
    }

    async fn watch_for_record(&self, uid: &str) -> Result<MatchRecord, StoreError> {
        let key = match_key(uid);
        let mut sub = self.store.subscribe(&key).await?;
        while let Some(snapshot) = sub.next().await {
            let Some(value) = snapshot? else {
                continue;
            };
            let record = match records::decode::<MatchRecord>(&key, value) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Ignoring malformed match record");
                    continue;
                },
            };
            if self.is_reciprocated(uid, &record).await? {
                return Ok(record);
            }
            tracing::info!(
                uid,
                partner = %record.partner.uid,
                room = %record.room_id,
                "Discarding match record without a reciprocal partner"
            );
            self.release_record(uid, &record.room_id).await?;
        }
        Err(StoreError::SubscriptionLost { key })
    }

    /// Whether the partner named in `record` holds a record pointing back.
    async fn is_reciprocated(&self, uid: &str, record: &MatchRecord) -> Result<bool, StoreError> {
        let key = match_key(&record.partner.uid);
        let Some(value) = self.store.get(&key).await? else {
            return Ok(false);
        };
        match records::decode::<MatchRecord>(&key, value) {
            Ok(theirs) => Ok(record.reciprocates(&theirs, uid)),
            Err(StoreError::Malformed { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Our current match record, if any.
    pub async fn own_record(&self, uid: &str) -> Result<Option<MatchRecord>, StoreError> {
        let key = match_key(uid);
        match self.store.get(&key).await? {
            Some(value) => records::decode(&key, value).map(Some),
            None => Ok(None),
        }
    }

    /// Delete our match record unconditionally.
    pub async fn clear_record(&self, uid: &str) -> Result<(), StoreError> {
        self.store.delete(&match_key(uid)).await
    }

    /// Delete our match record only if it still belongs to `room_id`.
    ///
    /// A record rewritten by a newer pairing is left for that pairing.
    pub async fn release_record(&self, uid: &str, room_id: &RoomId) -> Result<bool, StoreError> {
        let current = match self.own_record(uid).await {
            Ok(current) => current,
            Err(StoreError::Malformed { .. }) => None,
            Err(e) => return Err(e),
        };
        match current {
            Some(record) if record.room_id != *room_id => Ok(false),
            _ => {
                self.clear_record(uid).await?;
                Ok(true)
            },
        }
    }

    async fn write_record(&self, key: &str, record: &MatchRecord) -> Result<(), StoreError> {
        self.store.upsert(key, records::encode(key, record)?).await
    }
}
