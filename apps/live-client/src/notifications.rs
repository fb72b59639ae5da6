//! Unread/notification accumulator.
//!
//! Merges the announcement backlog of every tracked event with live
//! announcement and direct-notification pushes into one known set, and keeps
//! an unread counter for the session user on top of it.
//!
//! The counter is adjusted in place by exactly one on a new unread live item
//! and on a local read flip. Every other mutation recounts it from the set.

use std::collections::HashSet;
use std::sync::Arc;

use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::sync::watch;

use crate::api::AnnouncementService;
use crate::error::ClientError;
use crate::gateway::events::{PushEvent, PushKind};
use crate::gateway::router::PushHandler;
use crate::models::notification::{unread_count, Notification, NotificationKind, NotificationRef};

#[derive(Default)]
struct Inbox {
    items: Vec<Notification>,
    unread: usize,
    tracked_events: HashSet<String>,
    /// Ids this client marked read. Survive a backlog reload unless the call failed.
    local_reads: HashSet<String>,
    /// Bumped on reset so late backlog completions are dropped.
    generation: u64,
}

impl Inbox {
    fn recount(&mut self, user_id: &str) {
        self.unread = unread_count(&self.items, user_id);
    }

    fn find_mut(&mut self, id: &str) -> Option<&mut Notification> {
        self.items.iter_mut().find(|n| n.id == id)
    }

    fn tracks(&self, item: &Notification) -> bool {
        match item.kind {
            NotificationKind::Direct => true,
            NotificationKind::Announcement => item
                .event_id
                .as_deref()
                .is_some_and(|id| self.tracked_events.contains(id)),
        }
    }

    /// Backlog copies are authoritative for read state, except for ids this
    /// client has marked read itself.
    fn apply_backlog_item(&mut self, user_id: &str, incoming: Notification) {
        let server_read = incoming.is_read_by(user_id);
        let keep_local = self.local_reads.contains(&incoming.id);
        match self.items.iter_mut().find(|n| n.id == incoming.id) {
            Some(existing) => {
                existing.merge(incoming);
                if !server_read && !keep_local {
                    existing.read_by.remove(user_id);
                }
            }
            None => self.items.push(incoming),
        }
    }

    /// Make `fetched` the complete announcement set of `event_id`.
    ///
    /// Known announcements of that event missing from `fetched` were deleted
    /// server-side and are dropped. Returns how many items were merged.
    fn replace_event_backlog(
        &mut self,
        user_id: &str,
        event_id: &str,
        fetched: Vec<Notification>,
    ) -> usize {
        let fetched: Vec<Notification> = fetched
            .into_iter()
            .filter(|item| !item.id.is_empty())
            .map(|mut item| {
                item.kind = NotificationKind::Announcement;
                item.event_id.get_or_insert_with(|| event_id.to_string());
                item
            })
            .collect();
        let present: HashSet<&str> = fetched.iter().map(|item| item.id.as_str()).collect();

        let mut removed = Vec::new();
        self.items.retain(|item| {
            let stale = item.kind == NotificationKind::Announcement
                && item.event_id.as_deref() == Some(event_id)
                && !present.contains(item.id.as_str());
            if stale {
                removed.push(item.id.clone());
            }
            !stale
        });
        if !removed.is_empty() {
            tracing::debug!(
                %event_id,
                removed = removed.len(),
                "dropping announcements missing from backlog"
            );
        }
        for id in &removed {
            self.local_reads.remove(id);
        }

        let merged = fetched.len();
        for item in fetched {
            self.apply_backlog_item(user_id, item);
        }
        merged
    }
}

pub struct NotificationCenter {
    user_id: String,
    service: Arc<dyn AnnouncementService>,
    inbox: Mutex<Inbox>,
    unread_tx: watch::Sender<usize>,
}

impl NotificationCenter {
    pub fn new(user_id: impl Into<String>, service: Arc<dyn AnnouncementService>) -> Self {
        let (unread_tx, _) = watch::channel(0);
        Self {
            user_id: user_id.into(),
            service,
            inbox: Mutex::new(Inbox::default()),
            unread_tx,
        }
    }

    pub fn unread_count(&self) -> usize {
        self.inbox.lock().unread
    }

    /// Receiver that wakes whenever the unread count changes.
    pub fn subscribe_unread(&self) -> watch::Receiver<usize> {
        self.unread_tx.subscribe()
    }

    /// Known items, newest first.
    pub fn items(&self) -> Vec<Notification> {
        let mut items = self.inbox.lock().items.clone();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
        items
    }

    pub fn is_read(&self, id: &str) -> Option<bool> {
        let inbox = self.inbox.lock();
        inbox
            .items
            .iter()
            .find(|n| n.id == id)
            .map(|n| n.is_read_by(&self.user_id))
    }

    /// Track exactly `event_ids`. Announcements of events no longer tracked are dropped.
    pub fn set_scope<I, S>(&self, event_ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut inbox = self.inbox.lock();
        inbox.tracked_events = event_ids.into_iter().map(Into::into).collect();
        let Inbox {
            items,
            tracked_events,
            ..
        } = &mut *inbox;
        items.retain(|item| match item.kind {
            NotificationKind::Direct => true,
            NotificationKind::Announcement => item
                .event_id
                .as_deref()
                .is_some_and(|id| tracked_events.contains(id)),
        });
        inbox.recount(&self.user_id);
        self.publish(&inbox);
    }

    /// Fetch the announcement history of every event in `event_ids` and merge it.
    ///
    /// Fetches run concurrently. A failing event is logged and skipped so the
    /// others still land. Results that arrive after a [`reset`](Self::reset)
    /// are discarded.
    pub async fn load_backlog(&self, event_ids: &[String]) {
        self.set_scope(event_ids.iter().cloned());
        let generation = self.inbox.lock().generation;

        let fetches: Vec<_> = event_ids
            .iter()
            .map(|event_id| async move {
                (event_id, self.service.get_event_announcements(event_id).await)
            })
            .collect();
        let results = join_all(fetches).await;

        let mut inbox = self.inbox.lock();
        if inbox.generation != generation {
            tracing::debug!("discarding backlog for a reset session");
            return;
        }
        let mut merged = 0usize;
        for (event_id, result) in results {
            let items = match result {
                Ok(items) => items,
                Err(err) => {
                    tracing::warn!(%event_id, %err, "announcement backlog load failed");
                    continue;
                }
            };
            if !inbox.tracked_events.contains(event_id) {
                continue;
            }
            merged += inbox.replace_event_backlog(&self.user_id, event_id, items);
        }
        inbox.recount(&self.user_id);
        tracing::debug!(events = event_ids.len(), merged, unread = inbox.unread, "backlog merged");
        self.publish(&inbox);
    }

    /// Merge one live announcement or direct notification.
    ///
    /// Returns true if the item was new. The counter moves by one only for a
    /// new item that is unread for the session user.
    pub fn on_live_push(&self, mut item: Notification) -> bool {
        if item.id.is_empty() {
            tracing::debug!("dropping live notification without id");
            return false;
        }
        if item.kind == NotificationKind::Direct
            && item.user_id.as_deref().is_some_and(|u| u != self.user_id)
        {
            tracing::debug!(id = %item.id, "direct notification for another user");
            return false;
        }
        item.created_at.get_or_insert_with(chrono::Utc::now);

        let mut inbox = self.inbox.lock();
        if !inbox.tracks(&item) {
            tracing::debug!(
                id = %item.id,
                event_id = ?item.event_id,
                "live announcement for untracked event"
            );
            return false;
        }
        if let Some(existing) = inbox.find_mut(&item.id) {
            existing.merge(item);
            inbox.recount(&self.user_id);
            self.publish(&inbox);
            return false;
        }

        let unread = !item.is_read_by(&self.user_id);
        inbox.items.push(item);
        if unread {
            inbox.unread += 1;
        }
        self.check_counter(&inbox);
        self.publish(&inbox);
        true
    }

    /// Patch a known announcement. Unknown ids are ignored.
    pub fn on_update(&self, patch: Notification) -> bool {
        let mut inbox = self.inbox.lock();
        let Some(existing) = inbox.find_mut(&patch.id) else {
            tracing::debug!(id = %patch.id, "update for unknown announcement");
            return false;
        };
        existing.merge(patch);
        inbox.recount(&self.user_id);
        self.publish(&inbox);
        true
    }

    pub fn on_delete(&self, target: &NotificationRef) -> bool {
        let mut inbox = self.inbox.lock();
        let before = inbox.items.len();
        inbox.items.retain(|n| n.id != target.id);
        if inbox.items.len() == before {
            return false;
        }
        inbox.local_reads.remove(&target.id);
        inbox.recount(&self.user_id);
        self.publish(&inbox);
        true
    }

    /// Mark one item read for the session user.
    ///
    /// Flips local state immediately, then calls the announcement service.
    /// Unknown and already-read ids succeed without a call. A failed call is
    /// returned but the local flip stays; the next backlog reload corrects it.
    pub async fn mark_read(&self, id: &str) -> Result<(), ClientError> {
        let generation = {
            let mut inbox = self.inbox.lock();
            let user_id = self.user_id.as_str();
            let Some(item) = inbox.find_mut(id) else {
                tracing::debug!(%id, "mark_read for unknown notification");
                return Ok(());
            };
            if !item.read_by.insert(user_id.to_string()) {
                return Ok(());
            }
            inbox.unread = inbox.unread.saturating_sub(1);
            inbox.local_reads.insert(id.to_string());
            self.check_counter(&inbox);
            self.publish(&inbox);
            inbox.generation
        };

        match self.service.mark_as_read(id).await {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::warn!(%id, %err, "mark as read failed");
                let mut inbox = self.inbox.lock();
                if inbox.generation == generation {
                    inbox.local_reads.remove(id);
                }
                Err(err)
            }
        }
    }

    /// Mark every unread item read. Returns the first failure, after trying all.
    pub async fn mark_all_read(&self) -> Result<(), ClientError> {
        let ids: Vec<String> = {
            let inbox = self.inbox.lock();
            inbox
                .items
                .iter()
                .filter(|n| !n.is_read_by(&self.user_id))
                .map(|n| n.id.clone())
                .collect()
        };

        let mut first_err = None;
        for id in &ids {
            if let Err(err) = self.mark_read(id).await {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Forget everything (session teardown). In-flight loads are discarded.
    pub fn reset(&self) {
        let mut inbox = self.inbox.lock();
        let generation = inbox.generation + 1;
        *inbox = Inbox {
            generation,
            ..Inbox::default()
        };
        self.publish(&inbox);
    }

    fn publish(&self, inbox: &Inbox) {
        let unread = inbox.unread;
        self.unread_tx.send_if_modified(|current| {
            if *current == unread {
                return false;
            }
            *current = unread;
            true
        });
    }

    fn check_counter(&self, inbox: &Inbox) {
        debug_assert_eq!(
            inbox.unread,
            unread_count(&inbox.items, &self.user_id),
            "unread counter drifted from the known set"
        );
    }
}

impl PushHandler for NotificationCenter {
    fn handle_push(&self, push: &PushEvent) {
        match push.kind {
            PushKind::AnnouncementCreate | PushKind::Notification => {
                let mut item: Notification = match serde_json::from_value(push.data.clone()) {
                    Ok(item) => item,
                    Err(err) => {
                        tracing::debug!(
                            kind = push.kind.tag(),
                            %err,
                            "dropping malformed notification push"
                        );
                        return;
                    }
                };
                item.kind = if push.kind == PushKind::Notification {
                    NotificationKind::Direct
                } else {
                    NotificationKind::Announcement
                };
                self.on_live_push(item);
            }
            PushKind::AnnouncementUpdate => match serde_json::from_value(push.data.clone()) {
                Ok(patch) => {
                    self.on_update(patch);
                }
                Err(err) => tracing::debug!(%err, "dropping malformed announcement update"),
            },
            PushKind::AnnouncementDelete => {
                match serde_json::from_value::<NotificationRef>(push.data.clone()) {
                    Ok(target) => {
                        self.on_delete(&target);
                    }
                    Err(err) => tracing::debug!(%err, "dropping malformed announcement delete"),
                }
            }
            _ => {}
        }
    }
}
