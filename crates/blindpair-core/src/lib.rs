pub mod config;
pub mod directory;
pub mod error;
pub mod memory_store;
pub mod message;
pub mod profile;
pub mod records;
pub mod room;
pub mod state;
pub mod store;
pub mod time;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers {
    use crate::memory_store::MemoryStore;
    use crate::profile::Profile;
    use crate::records::{MatchRecord, QueueEntry, match_key, queue_key};
    use crate::room::RoomId;
    use crate::time::Timestamp;

    /// Verified profile named after its uid.
    pub fn make_profile(uid: &str) -> Profile {
        Profile::new(uid, format!("User {uid}"))
            .verified()
            .with_attribute("affiliation", "Test College")
    }

    /// Write a queue entry for `uid` stamped `joined_at`.
    pub fn seed_queue_entry(store: &MemoryStore, uid: &str, joined_at: Timestamp) {
        let entry = QueueEntry::new(&make_profile(uid).public(), joined_at);
        store.seed(&queue_key(uid), &entry);
    }

    /// Write a reciprocal pair of match records directly.
    pub fn seed_pair(store: &MemoryStore, a: &str, b: &str, room: &RoomId) {
        let (for_a, for_b) = MatchRecord::pair(
            room,
            &make_profile(a).public(),
            &make_profile(b).public(),
            crate::time::now_millis(),
        );
        store.seed(&match_key(a), &for_a);
        store.seed(&match_key(b), &for_b);
    }
}
