//! Shapes and key layout of the records kept in the shared store.
//!
//! ```text
//! queue/{uid}                      QueueEntry
//! matches/{uid}                    MatchRecord
//! chats/{roomId}/messages/{id}     ChatMessage
//! ```

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::StoreError;
use crate::profile::{GroupAttributes, PublicProfile, Uid};
use crate::room::RoomId;
use crate::time::Timestamp;

pub const QUEUE_ROOT: &str = "queue";
pub const MATCHES_ROOT: &str = "matches";
pub const CHATS_ROOT: &str = "chats";

pub fn queue_key(uid: &str) -> String {
    format!("{QUEUE_ROOT}/{uid}")
}

pub fn match_key(uid: &str) -> String {
    format!("{MATCHES_ROOT}/{uid}")
}

pub fn messages_key(room_id: &RoomId) -> String {
    format!("{CHATS_ROOT}/{room_id}/messages")
}

/// Advertisement that a user is waiting for a partner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub uid: Uid,
    pub display_name: String,
    #[serde(default)]
    pub group_attributes: GroupAttributes,
    pub joined_at: Timestamp,
}

impl QueueEntry {
    pub fn new(profile: &PublicProfile, joined_at: Timestamp) -> Self {
        Self {
            uid: profile.uid.clone(),
            display_name: profile.display_name.clone(),
            group_attributes: profile.group_attributes.clone(),
            joined_at,
        }
    }

    pub fn public(&self) -> PublicProfile {
        PublicProfile {
            uid: self.uid.clone(),
            display_name: self.display_name.clone(),
            group_attributes: self.group_attributes.clone(),
        }
    }

    /// Whether the entry was written within `max_age_ms` of `now`.
    /// Entries stamped in the future count as fresh.
    pub fn is_fresh(&self, now: Timestamp, max_age_ms: u64) -> bool {
        now.saturating_sub(self.joined_at) <= max_age_ms
    }
}

/// A user's record of the session they are in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchRecord {
    pub room_id: RoomId,
    pub partner: PublicProfile,
    pub created_at: Timestamp,
}

impl MatchRecord {
    /// The two reciprocal records for a new pairing: the first belongs to
    /// `a`, the second to `b`.
    pub fn pair(
        room_id: &RoomId,
        a: &PublicProfile,
        b: &PublicProfile,
        created_at: Timestamp,
    ) -> (Self, Self) {
        let for_a = Self {
            room_id: room_id.clone(),
            partner: b.clone(),
            created_at,
        };
        let for_b = Self {
            room_id: room_id.clone(),
            partner: a.clone(),
            created_at,
        };
        (for_a, for_b)
    }

    /// True when `other`, read from the partner's key, points back at
    /// `my_uid` in the same room.
    pub fn reciprocates(&self, other: &MatchRecord, my_uid: &str) -> bool {
        other.room_id == self.room_id && other.partner.uid == my_uid
    }
}

/// Serializes a record for the store.
pub fn encode<T: Serialize>(key: &str, record: &T) -> Result<Value, StoreError> {
    serde_json::to_value(record).map_err(|e| StoreError::malformed(key, e))
}

/// Deserializes a record read from the store.
pub fn decode<T: DeserializeOwned>(key: &str, value: Value) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::malformed(key, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::Profile;

    fn ana() -> PublicProfile {
        Profile::new("ana", "Ana")
            .with_attribute("affiliation", "North")
            .public()
    }

    fn ben() -> PublicProfile {
        Profile::new("ben", "Ben").public()
    }

    #[test]
    fn key_layout() {
        let room = RoomId::parse("room_1_x").unwrap();
        assert_eq!(queue_key("ana"), "queue/ana");
        assert_eq!(match_key("ana"), "matches/ana");
        assert_eq!(messages_key(&room), "chats/room_1_x/messages");
    }

    #[test]
    fn queue_entry_wire_shape() {
        let entry = QueueEntry::new(&ana(), 42);
        let json = encode("queue/ana", &entry).unwrap();
        assert_eq!(json["displayName"], "Ana");
        assert_eq!(json["joinedAt"], 42);
        assert_eq!(json["groupAttributes"]["affiliation"], "North");
    }

    #[test]
    fn freshness_window() {
        let entry = QueueEntry::new(&ana(), 10_000);
        assert!(entry.is_fresh(40_000, 30_000));
        assert!(!entry.is_fresh(40_001, 30_000));
        assert!(entry.is_fresh(5_000, 30_000));
    }

    #[test]
    fn pair_is_reciprocal() {
        let room = RoomId::generate();
        let (for_ana, for_ben) = MatchRecord::pair(&room, &ana(), &ben(), 1);
        assert_eq!(for_ana.partner.uid, "ben");
        assert_eq!(for_ben.partner.uid, "ana");
        assert!(for_ana.reciprocates(&for_ben, "ana"));
        assert!(for_ben.reciprocates(&for_ana, "ben"));
    }

    #[test]
    fn different_room_is_not_reciprocal() {
        let (for_ana, _) = MatchRecord::pair(&RoomId::generate(), &ana(), &ben(), 1);
        let (_, other) = MatchRecord::pair(
            &RoomId::parse("room_2_other").unwrap(),
            &ana(),
            &ben(),
            1,
        );
        assert!(!for_ana.reciprocates(&other, "ana"));
    }

    #[test]
    fn decode_reports_key() {
        let err = decode::<MatchRecord>("matches/ana", serde_json::json!({"x": 1})).unwrap_err();
        match err {
            StoreError::Malformed { key, .. } => assert_eq!(key, "matches/ana"),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
