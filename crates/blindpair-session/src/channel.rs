use std::sync::Arc;

use futures::StreamExt;
use serde_json::Value;

use blindpair_core::config::SessionConfig;
use blindpair_core::error::{MatchError, StoreError};
use blindpair_core::message::{ChatMessage, sort_messages};
use blindpair_core::records::{self, messages_key};
use blindpair_core::room::RoomId;
use blindpair_core::store::{Store, Subscription, children};
use blindpair_core::time::now_millis;

/// Append-only message list of one room.
#[derive(Clone)]
pub struct MessageChannel {
    store: Arc<dyn Store>,
    max_message_chars: usize,
    max_reaction_chars: usize,
}

impl MessageChannel {
    pub fn new(store: Arc<dyn Store>, config: &SessionConfig) -> Self {
        Self {
            store,
            max_message_chars: config.max_message_chars,
            max_reaction_chars: config.max_reaction_chars,
        }
    }

    /// Append user text. Blank text is rejected; long text is truncated.
    pub async fn send_text(
        &self,
        room_id: &RoomId,
        sender: &str,
        text: &str,
    ) -> Result<String, MatchError> {
        let msg = ChatMessage::text(room_id, sender, text, now_millis(), self.max_message_chars)
            .ok_or(MatchError::EmptyMessage)?;
        Ok(self.append(&msg).await?)
    }

    pub async fn send_reaction(
        &self,
        room_id: &RoomId,
        sender: &str,
        payload: &str,
    ) -> Result<String, MatchError> {
        let msg =
            ChatMessage::reaction(room_id, sender, payload, now_millis(), self.max_reaction_chars)
                .ok_or(MatchError::EmptyMessage)?;
        Ok(self.append(&msg).await?)
    }

    /// Append a notice on behalf of the session itself.
    pub async fn send_system(
        &self,
        room_id: &RoomId,
        text: &str,
        skip: bool,
    ) -> Result<String, StoreError> {
        let msg = ChatMessage::system(room_id, text, now_millis(), skip);
        self.append(&msg).await
    }

    /// Append a prepared message and return its generated id.
    pub async fn append(&self, msg: &ChatMessage) -> Result<String, StoreError> {
        let key = messages_key(&msg.room_id);
        let value = records::encode(&key, msg)?;
        self.store.append_to_list(&key, value).await
    }

    /// Current messages of the room, sorted.
    pub async fn fetch(&self, room_id: &RoomId) -> Result<Vec<ChatMessage>, StoreError> {
        let key = messages_key(room_id);
        let snapshot = self.store.get(&key).await?;
        Ok(decode_messages(&key, snapshot))
    }

    /// Live feed delivering the full sorted message set on every change.
    ///
    /// Messages written while no feed is open are not replayed beyond what
    /// the first snapshot contains.
    pub async fn subscribe(&self, room_id: &RoomId) -> Result<MessageFeed, StoreError> {
        let key = messages_key(room_id);
        let sub = self.store.subscribe(&key).await?;
        Ok(MessageFeed { key, sub })
    }
}

/// Subscription to one room's messages. Dropping it unsubscribes.
pub struct MessageFeed {
    key: String,
    sub: Subscription,
}

impl MessageFeed {
    pub async fn next(&mut self) -> Option<Result<Vec<ChatMessage>, StoreError>> {
        let snapshot = self.sub.next().await?;
        Some(snapshot.map(|value| decode_messages(&self.key, value)))
    }
}

fn decode_messages(key: &str, snapshot: Option<Value>) -> Vec<ChatMessage> {
    let mut messages: Vec<ChatMessage> = children(snapshot)
        .into_iter()
        .filter_map(|(id, value)| {
            let item_key = format!("{key}/{id}");
            match records::decode::<ChatMessage>(&item_key, value) {
                Ok(mut msg) => {
                    msg.id = id;
                    Some(msg)
                },
                Err(e) => {
                    tracing::warn!(key = %item_key, error = %e, "Skipping malformed message");
                    None
                },
            }
        })
        .collect();
    sort_messages(&mut messages);
    messages
}

#[cfg(test)]
mod tests {
    use blindpair_core::memory_store::MemoryStore;
    use blindpair_core::message::{SKIP_NOTICE_TEXT, SYSTEM_SENDER};

    use super::*;

    fn setup() -> (Arc<MemoryStore>, MessageChannel, RoomId) {
        let store = Arc::new(MemoryStore::new());
        let channel = MessageChannel::new(
            Arc::clone(&store) as Arc<dyn Store>,
            &SessionConfig::default(),
        );
        (store, channel, RoomId::generate())
    }

    #[tokio::test]
    async fn subscriber_sees_timestamp_order() {
        let (_store, channel, room) = setup();
        let mut feed = channel.subscribe(&room).await.unwrap();
        assert!(feed.next().await.unwrap().unwrap().is_empty());

        for ts in [50, 10, 30] {
            let msg = ChatMessage::text(&room, "ana", &format!("at {ts}"), ts, 200).unwrap();
            channel.append(&msg).await.unwrap();
        }

        let mut latest = Vec::new();
        for _ in 0..3 {
            latest = feed.next().await.unwrap().unwrap();
        }
        let stamps: Vec<_> = latest.iter().map(|m| m.timestamp).collect();
        assert_eq!(stamps, vec![10, 30, 50]);
        assert!(latest.iter().all(|m| !m.id.is_empty()));
    }

    #[tokio::test]
    async fn blank_message_rejected() {
        let (store, channel, room) = setup();
        let err = channel.send_text(&room, "ana", "   ").await.unwrap_err();
        assert_eq!(err, MatchError::EmptyMessage);
        assert!(store.peek(&messages_key(&room)).is_none());
    }

    #[tokio::test]
    async fn long_message_truncated() {
        let (_store, channel, room) = setup();
        channel
            .send_text(&room, "ana", &"x".repeat(500))
            .await
            .unwrap();
        let messages = channel.fetch(&room).await.unwrap();
        assert_eq!(messages[0].text.len(), 200);
    }

    #[tokio::test]
    async fn reaction_and_system_flags() {
        let (_store, channel, room) = setup();
        channel.send_reaction(&room, "ana", "😂").await.unwrap();
        channel
            .send_system(&room, SKIP_NOTICE_TEXT, true)
            .await
            .unwrap();
        let messages = channel.fetch(&room).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert!(messages.iter().any(|m| m.flags.is_reaction));
        let system = messages.iter().find(|m| m.is_system()).unwrap();
        assert_eq!(system.sender, SYSTEM_SENDER);
        assert!(system.is_skip_action());
    }

    #[tokio::test]
    async fn malformed_entries_skipped() {
        let (store, channel, room) = setup();
        store.seed(
            &format!("{}/zzz", messages_key(&room)),
            &serde_json::json!({"bogus": 1}),
        );
        channel.send_text(&room, "ana", "hello").await.unwrap();
        let messages = channel.fetch(&room).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].text, "hello");
    }

    #[tokio::test]
    async fn dropping_feed_unsubscribes() {
        let (store, channel, room) = setup();
        let feed = channel.subscribe(&room).await.unwrap();
        assert_eq!(store.watcher_count("chats"), 1);
        drop(feed);
        assert_eq!(store.watcher_count("chats"), 0);
    }
}
