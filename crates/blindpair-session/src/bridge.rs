use std::sync::Arc;

use futures::StreamExt;
use serde_json::Value;

use blindpair_core::error::StoreError;
use blindpair_core::profile::Uid;
use blindpair_core::records::{self, MatchRecord, match_key};
use blindpair_core::store::{Store, Subscription};

/// Why a session lost its partner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vanished {
    /// The partner's match record is gone: they ended, skipped or timed out.
    Absent,
    /// The records no longer point at each other: a concurrent pairing
    /// overwrote one side.
    Ghost,
}

/// Watches match records to learn when a partner has left.
#[derive(Clone)]
pub struct NotificationBridge {
    store: Arc<dyn Store>,
}

impl NotificationBridge {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Subscribe to the partner's record and our own for the session
    /// described by `mine`.
    pub async fn watch(&self, me: &str, mine: &MatchRecord) -> Result<PartnerWatch, StoreError> {
        let partner = self.store.subscribe(&match_key(&mine.partner.uid)).await?;
        let own = self.store.subscribe(&match_key(me)).await?;
        Ok(PartnerWatch {
            me: me.to_string(),
            mine: mine.clone(),
            partner,
            own,
        })
    }
}

/// Live watch over one pairing. Yields at most one [`Vanished`].
pub struct PartnerWatch {
    me: Uid,
    mine: MatchRecord,
    partner: Subscription,
    own: Subscription,
}

impl PartnerWatch {
    /// Resolve once the pairing is broken. An `Err` means a subscription
    /// was lost before anything was observed.
    pub async fn vanished(mut self) -> Result<Vanished, StoreError> {
        loop {
            tokio::select! {
                snapshot = self.partner.next() => {
                    let value = snapshot.ok_or_else(|| lost(&self.partner))??;
                    if let Some(kind) = self.check_partner(value) {
                        return Ok(kind);
                    }
                }
                snapshot = self.own.next() => {
                    let value = snapshot.ok_or_else(|| lost(&self.own))??;
                    if let Some(kind) = self.check_own(value) {
                        return Ok(kind);
                    }
                }
            }
        }
    }

    fn check_partner(&self, value: Option<Value>) -> Option<Vanished> {
        let Some(value) = value else {
            return Some(Vanished::Absent);
        };
        match records::decode::<MatchRecord>(self.partner.key(), value) {
            Ok(theirs) if self.mine.reciprocates(&theirs, &self.me) => None,
            Ok(theirs) => {
                tracing::info!(
                    uid = %self.me,
                    partner = %self.mine.partner.uid,
                    room = %self.mine.room_id,
                    their_room = %theirs.room_id,
                    "Partner record points elsewhere"
                );
                Some(Vanished::Ghost)
            },
            Err(e) => {
                tracing::warn!(error = %e, "Partner record unreadable, treating as ghost");
                Some(Vanished::Ghost)
            },
        }
    }

    fn check_own(&self, value: Option<Value>) -> Option<Vanished> {
        let Some(value) = value else {
            return Some(Vanished::Ghost);
        };
        match records::decode::<MatchRecord>(self.own.key(), value) {
            Ok(current) if current.room_id == self.mine.room_id => None,
            Ok(current) => {
                tracing::info!(
                    uid = %self.me,
                    room = %self.mine.room_id,
                    new_room = %current.room_id,
                    "Own record overwritten by another pairing"
                );
                Some(Vanished::Ghost)
            },
            Err(e) => {
                tracing::warn!(error = %e, "Own record unreadable, treating as ghost");
                Some(Vanished::Ghost)
            },
        }
    }
}

fn lost(sub: &Subscription) -> StoreError {
    StoreError::SubscriptionLost {
        key: sub.key().to_string(),
    }
}
