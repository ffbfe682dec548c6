use serde::{Deserialize, Serialize};

use crate::profile::Uid;
use crate::room::RoomId;
use crate::time::Timestamp;

/// Sender id used for messages the session writes on its own behalf.
pub const SYSTEM_SENDER: &str = "system";

/// Quick-reaction palette offered to clients.
pub const REACTIONS: &[&str] = &["🔥", "😂", "❤️", "😢", "😮", "👍", "🤔", "😎"];

pub const END_NOTICE_TEXT: &str = "Your partner has ended the chat.";
pub const SKIP_NOTICE_TEXT: &str = "Your partner skipped to the next chat.";
pub const TIME_UP_NOTICE_TEXT: &str = "Time's up! This chat has ended.";

/// Marker flags carried alongside every message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MessageFlags {
    pub is_reaction: bool,
    pub is_system: bool,
    pub is_skip_action: bool,
}

/// One entry in a room's append-only message list.
///
/// `id` is assigned by the store on append; it is not part of the stored
/// value and is filled back in from the list key when reading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    #[serde(default, skip_serializing)]
    pub id: String,
    pub room_id: RoomId,
    pub sender: Uid,
    pub text: String,
    pub timestamp: Timestamp,
    #[serde(flatten)]
    pub flags: MessageFlags,
}

impl ChatMessage {
    /// User-authored text. Returns `None` when nothing is left after
    /// trimming; longer input is cut to `max_chars` characters.
    pub fn text(
        room_id: &RoomId,
        sender: &str,
        raw: &str,
        timestamp: Timestamp,
        max_chars: usize,
    ) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(Self {
            id: String::new(),
            room_id: room_id.clone(),
            sender: sender.to_string(),
            text: truncate_chars(trimmed, max_chars).to_string(),
            timestamp,
            flags: MessageFlags::default(),
        })
    }

    pub fn reaction(
        room_id: &RoomId,
        sender: &str,
        emoji: &str,
        timestamp: Timestamp,
        max_chars: usize,
    ) -> Option<Self> {
        let mut msg = Self::text(room_id, sender, emoji, timestamp, max_chars)?;
        msg.flags.is_reaction = true;
        Some(msg)
    }

    /// Message written by the session itself when a participant leaves.
    pub fn system(room_id: &RoomId, text: &str, timestamp: Timestamp, skip: bool) -> Self {
        Self {
            id: String::new(),
            room_id: room_id.clone(),
            sender: SYSTEM_SENDER.to_string(),
            text: text.to_string(),
            timestamp,
            flags: MessageFlags {
                is_reaction: false,
                is_system: true,
                is_skip_action: skip,
            },
        }
    }

    pub fn is_system(&self) -> bool {
        self.flags.is_system || self.sender == SYSTEM_SENDER
    }

    pub fn is_skip_action(&self) -> bool {
        self.flags.is_skip_action
    }

    pub fn is_mine(&self, uid: &str) -> bool {
        self.sender == uid
    }
}

/// Cuts `s` to at most `max` characters without splitting a code point.
pub fn truncate_chars(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Orders messages by timestamp, then by id for equal timestamps.
pub fn sort_messages(messages: &mut [ChatMessage]) {
    messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
}

/// The most recent message in timestamp order.
pub fn last_message(messages: &[ChatMessage]) -> Option<&ChatMessage> {
    messages
        .iter()
        .max_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room() -> RoomId {
        RoomId::parse("room_1_abcdefgh").unwrap()
    }

    fn at(id: &str, timestamp: Timestamp) -> ChatMessage {
        let mut msg = ChatMessage::text(&room(), "u1", "hi", timestamp, 200).unwrap();
        msg.id = id.to_string();
        msg
    }

    #[test]
    fn text_is_trimmed() {
        let msg = ChatMessage::text(&room(), "u1", "  hello  ", 1, 200).unwrap();
        assert_eq!(msg.text, "hello");
        assert!(!msg.is_system());
    }

    #[test]
    fn blank_text_is_rejected() {
        assert!(ChatMessage::text(&room(), "u1", "   \n\t", 1, 200).is_none());
    }

    #[test]
    fn long_text_truncated_by_chars() {
        let raw = "é".repeat(250);
        let msg = ChatMessage::text(&room(), "u1", &raw, 1, 200).unwrap();
        assert_eq!(msg.text.chars().count(), 200);
    }

    #[test]
    fn reaction_sets_flag() {
        let msg = ChatMessage::reaction(&room(), "u1", "🔥", 1, 8).unwrap();
        assert!(msg.flags.is_reaction);
        assert_eq!(msg.text, "🔥");
    }

    #[test]
    fn system_message_flags() {
        let msg = ChatMessage::system(&room(), SKIP_NOTICE_TEXT, 1, true);
        assert_eq!(msg.sender, SYSTEM_SENDER);
        assert!(msg.is_system());
        assert!(msg.is_skip_action());
    }

    #[test]
    fn wire_shape_is_flat_camel_case() {
        let msg = ChatMessage::system(&room(), END_NOTICE_TEXT, 7, false);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["roomId"], "room_1_abcdefgh");
        assert_eq!(json["isSystem"], true);
        assert_eq!(json["isSkipAction"], false);
        assert!(json.get("id").is_none());
    }

    #[test]
    fn missing_flags_default_to_false() {
        let json = serde_json::json!({
            "roomId": "room_1_abcdefgh",
            "sender": "u1",
            "text": "hey",
            "timestamp": 3
        });
        let msg: ChatMessage = serde_json::from_value(json).unwrap();
        assert_eq!(msg.flags, MessageFlags::default());
    }

    #[test]
    fn sorts_by_timestamp() {
        let mut msgs = vec![at("a", 50), at("b", 10), at("c", 30)];
        sort_messages(&mut msgs);
        let stamps: Vec<_> = msgs.iter().map(|m| m.timestamp).collect();
        assert_eq!(stamps, vec![10, 30, 50]);
    }

    #[test]
    fn ties_break_on_id() {
        let mut msgs = vec![at("b", 5), at("a", 5)];
        sort_messages(&mut msgs);
        assert_eq!(msgs[0].id, "a");
        assert_eq!(last_message(&msgs).unwrap().id, "b");
    }

    mod proptests {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #[test]
            fn sorted_is_non_decreasing(stamps in proptest::collection::vec(0u64..1_000, 0..40)) {
                let mut msgs: Vec<_> = stamps
                    .iter()
                    .enumerate()
                    .map(|(i, ts)| at(&format!("{i:04}"), *ts))
                    .collect();
                sort_messages(&mut msgs);
                for pair in msgs.windows(2) {
                    prop_assert!(pair[0].timestamp <= pair[1].timestamp);
                }
            }

            #[test]
            fn truncation_never_exceeds_limit(s in ".{0,300}", max in 1usize..250) {
                prop_assert!(truncate_chars(&s, max).chars().count() <= max);
            }
        }
    }
}
