use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    /// Event-scoped announcement (backlog or `event_announcement*` push).
    #[default]
    Announcement,
    /// Push addressed to the user room (`notification`).
    Direct,
}

/// An announcement or direct notification known to the accumulator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, alias = "message", alias = "content")]
    pub body: String,
    #[serde(default)]
    pub event_id: Option<String>,
    /// Recipient of a direct notification.
    #[serde(default, alias = "recipientId")]
    pub user_id: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub read_by: BTreeSet<String>,
    #[serde(default)]
    pub kind: NotificationKind,
}

impl Notification {
    pub fn is_read_by(&self, user_id: &str) -> bool {
        self.read_by.contains(user_id)
    }

    /// Fold a newer copy of the same item into this one.
    ///
    /// Content fields take the incoming values; `read_by` is a union so the
    /// merge is commutative with a concurrent local `mark_read`.
    pub fn merge(&mut self, incoming: Notification) {
        if !incoming.title.is_empty() {
            self.title = incoming.title;
        }
        if !incoming.body.is_empty() {
            self.body = incoming.body;
        }
        if incoming.event_id.is_some() {
            self.event_id = incoming.event_id;
        }
        if incoming.user_id.is_some() {
            self.user_id = incoming.user_id;
        }
        if incoming.created_at.is_some() {
            self.created_at = incoming.created_at;
        }
        self.read_by.extend(incoming.read_by);
    }
}

/// Payload of `event_announcement_delete`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRef {
    #[serde(alias = "_id", alias = "announcementId")]
    pub id: String,
    #[serde(default)]
    pub event_id: Option<String>,
}

/// Number of items in `items` that `user_id` has not read.
pub fn unread_count<'a>(items: impl IntoIterator<Item = &'a Notification>, user_id: &str) -> usize {
    items
        .into_iter()
        .filter(|n| !n.is_read_by(user_id))
        .count()
}
