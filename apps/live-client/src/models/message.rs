use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    Question,
    Answer,
    /// Plain chat text. Unknown type strings decode to this.
    #[default]
    #[serde(other)]
    Text,
}

/// A Q&A message as delivered by the chat service or the live channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Secondary id field some backend responses carry instead of `id`.
    #[serde(default, rename = "_id", skip_serializing_if = "Option::is_none")]
    pub alt_id: Option<String>,
    #[serde(default)]
    pub event_id: String,
    #[serde(default)]
    pub sender_id: String,
    #[serde(default, alias = "message", alias = "content")]
    pub text: String,
    #[serde(default)]
    pub message_type: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// Idempotency key echoed back for messages this client sent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default)]
    pub pinned: bool,
    /// Emoji → users who reacted with it.
    #[serde(default)]
    pub reactions: BTreeMap<String, BTreeSet<String>>,
    #[serde(default)]
    pub read_by: BTreeSet<String>,
    /// When this client first saw the message. Ordering fallback for a missing `created_at`.
    #[serde(skip)]
    pub observed_at: Option<DateTime<Utc>>,
}

impl Message {
    /// Identity used for dedupe: `id`, falling back to `_id`.
    pub fn key(&self) -> Option<&str> {
        non_blank(self.id.as_deref()).or_else(|| non_blank(self.alt_id.as_deref()))
    }

    pub fn parent_key(&self) -> Option<&str> {
        non_blank(self.parent_message_id.as_deref())
    }

    pub fn is_question(&self) -> bool {
        self.message_type == MessageType::Question
    }

    /// Answers and anything carrying a parent reference are replies.
    pub fn is_reply(&self) -> bool {
        self.message_type == MessageType::Answer || self.parent_key().is_some()
    }

    pub fn sort_time(&self) -> DateTime<Utc> {
        self.created_at
            .or(self.observed_at)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Thread order: `created_at` (or observation time) ascending, ties broken by id.
    pub fn thread_order(&self, other: &Self) -> Ordering {
        self.sort_time()
            .cmp(&other.sort_time())
            .then_with(|| self.key().cmp(&other.key()))
    }

    pub fn reaction_count(&self) -> usize {
        self.reactions.values().map(BTreeSet::len).sum()
    }
}

/// Partial update carried by `qna_update`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePatch {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, rename = "_id")]
    pub alt_id: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub event_id: String,
    #[serde(default, alias = "message", alias = "content")]
    pub text: Option<String>,
    #[serde(default)]
    pub message_type: Option<MessageType>,
    #[serde(default)]
    pub parent_message_id: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub pinned: Option<bool>,
    #[serde(default)]
    pub reactions: Option<BTreeMap<String, BTreeSet<String>>>,
    #[serde(default)]
    pub read_by: Option<BTreeSet<String>>,
}

impl MessagePatch {
    pub fn key(&self) -> Option<&str> {
        non_blank(self.message_id.as_deref())
            .or_else(|| non_blank(self.id.as_deref()))
            .or_else(|| non_blank(self.alt_id.as_deref()))
    }

    /// Apply every present field to `message`. Returns true if anything changed.
    pub fn apply_to(&self, message: &mut Message) -> bool {
        let before = message.clone();
        if let Some(text) = &self.text {
            message.text = text.clone();
        }
        if let Some(message_type) = self.message_type {
            message.message_type = message_type;
        }
        if let Some(parent) = &self.parent_message_id {
            message.parent_message_id = Some(parent.clone());
        }
        if let Some(created_at) = self.created_at {
            message.created_at = Some(created_at);
        }
        if let Some(pinned) = self.pinned {
            message.pinned = pinned;
        }
        if let Some(reactions) = &self.reactions {
            message.reactions = reactions.clone();
        }
        if let Some(read_by) = &self.read_by {
            message.read_by.extend(read_by.iter().cloned());
        }
        *message != before
    }
}

/// Reference to one message (`qna_delete`, `qna_pin`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRef {
    #[serde(default)]
    pub event_id: String,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, rename = "_id")]
    pub alt_id: Option<String>,
    #[serde(default)]
    pub pinned: Option<bool>,
}

impl MessageRef {
    pub fn key(&self) -> Option<&str> {
        non_blank(self.message_id.as_deref())
            .or_else(|| non_blank(self.id.as_deref()))
            .or_else(|| non_blank(self.alt_id.as_deref()))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReactionAction {
    #[default]
    Add,
    Remove,
}

/// Payload of `qna_reaction`: either one add/remove, or the full reaction map.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReactionChange {
    #[serde(default)]
    pub event_id: String,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default, rename = "_id")]
    pub alt_id: Option<String>,
    #[serde(default)]
    pub emoji: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub action: ReactionAction,
    #[serde(default)]
    pub reactions: Option<BTreeMap<String, BTreeSet<String>>>,
}

impl ReactionChange {
    pub fn key(&self) -> Option<&str> {
        non_blank(self.message_id.as_deref())
            .or_else(|| non_blank(self.id.as_deref()))
            .or_else(|| non_blank(self.alt_id.as_deref()))
    }

    pub fn apply_to(&self, message: &mut Message) -> bool {
        if let Some(all) = &self.reactions {
            if message.reactions == *all {
                return false;
            }
            message.reactions = all.clone();
            return true;
        }
        let emoji = non_blank(self.emoji.as_deref());
        let user = non_blank(self.user_id.as_deref());
        let (Some(emoji), Some(user)) = (emoji, user) else {
            return false;
        };
        match self.action {
            ReactionAction::Add => message
                .reactions
                .entry(emoji.to_string())
                .or_default()
                .insert(user.to_string()),
            ReactionAction::Remove => {
                let Some(users) = message.reactions.get_mut(emoji) else {
                    return false;
                };
                let removed = users.remove(user);
                if users.is_empty() {
                    message.reactions.remove(emoji);
                }
                removed
            }
        }
    }
}

/// Payload of `qna_read`: one reader, one or many messages.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceipt {
    #[serde(default)]
    pub event_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub message_id: Option<String>,
    #[serde(default)]
    pub message_ids: Vec<String>,
}

impl ReadReceipt {
    pub fn message_keys(&self) -> impl Iterator<Item = &str> {
        non_blank(self.message_id.as_deref())
            .into_iter()
            .chain(self.message_ids.iter().map(String::as_str).filter(|s| !s.is_empty()))
    }
}

/// Body of `sendMessage`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub event_id: String,
    pub text: String,
    pub message_type: MessageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<String>,
    pub client_id: String,
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.filter(|s| !s.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_backend_shape_with_secondary_id() {
        let msg: Message = serde_json::from_value(serde_json::json!({
            "_id": "m1",
            "eventId": "ev1",
            "senderId": "u1",
            "message": "How do we submit?",
            "messageType": "Question",
            "createdAt": "2026-03-01T10:00:00Z",
        }))
        .unwrap();
        assert_eq!(msg.key(), Some("m1"));
        assert_eq!(msg.text, "How do we submit?");
        assert!(msg.is_question());
        assert!(!msg.is_reply());
    }

    #[test]
    fn unknown_message_type_is_text() {
        let msg: Message = serde_json::from_value(serde_json::json!({
            "id": "m1",
            "eventId": "ev1",
            "messageType": "Poll",
        }))
        .unwrap();
        assert_eq!(msg.message_type, MessageType::Text);
    }

    #[test]
    fn blank_primary_id_falls_back() {
        let msg: Message = serde_json::from_value(serde_json::json!({
            "id": "", "_id": "m9", "eventId": "ev1"
        }))
        .unwrap();
        assert_eq!(msg.key(), Some("m9"));
    }

    #[test]
    fn reaction_add_and_remove() {
        let mut msg: Message = serde_json::from_value(serde_json::json!({"id": "m1"})).unwrap();
        let add = ReactionChange {
            emoji: Some("🔥".into()),
            user_id: Some("u1".into()),
            ..Default::default()
        };
        assert!(add.apply_to(&mut msg));
        assert!(!add.apply_to(&mut msg));
        assert_eq!(msg.reaction_count(), 1);

        let remove = ReactionChange {
            action: ReactionAction::Remove,
            ..add
        };
        assert!(remove.apply_to(&mut msg));
        assert!(msg.reactions.is_empty());
    }

    #[test]
    fn reaction_target_accepts_every_id_field() {
        use serde_json::json;

        let keyed = |value: serde_json::Value| {
            serde_json::from_value::<ReactionChange>(value)
                .unwrap()
                .key()
                .map(str::to_string)
        };
        assert_eq!(keyed(json!({ "messageId": "m1", "_id": "m2" })).as_deref(), Some("m1"));
        assert_eq!(keyed(json!({ "id": "m3" })).as_deref(), Some("m3"));
        assert_eq!(keyed(json!({ "_id": "m4", "emoji": "🎉" })).as_deref(), Some("m4"));
        assert_eq!(keyed(json!({ "id": " " })), None);
    }

    #[test]
    fn patch_reports_changes_only() {
        let mut msg: Message =
            serde_json::from_value(serde_json::json!({"id": "m1", "text": "old"})).unwrap();
        let patch = MessagePatch {
            id: Some("m1".into()),
            text: Some("new".into()),
            ..Default::default()
        };
        assert!(patch.apply_to(&mut msg));
        assert_eq!(msg.text, "new");
        assert!(!patch.apply_to(&mut msg));
    }
}
