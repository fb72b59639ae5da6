//! Bounded feed of team, submission and leaderboard pushes.

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;

use crate::gateway::events::{PushEvent, PushKind};
use crate::gateway::router::PushHandler;

/// Maximum number of entries kept in the feed.
pub const MAX_ACTIVITY_ENTRIES: usize = 500;

/// One activity push as stored in the feed.
#[derive(Debug, Clone)]
pub struct ActivityEntry {
    pub seq: u64,
    pub kind: PushKind,
    pub event_id: String,
    pub data: Value,
    pub received_at: DateTime<Utc>,
}

#[derive(Default)]
struct Feed {
    seq: u64,
    entries: VecDeque<ActivityEntry>,
    tracked_events: HashSet<String>,
}

/// Keeps the most recent activity for tracked events. Oldest entries are evicted first.
#[derive(Default)]
pub struct ActivityFeed {
    feed: Mutex<Feed>,
}

impl ActivityFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track exactly `event_ids`; entries for other events are dropped.
    pub fn set_scope<I, S>(&self, event_ids: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut feed = self.feed.lock();
        feed.tracked_events = event_ids.into_iter().map(Into::into).collect();
        let Feed {
            entries,
            tracked_events,
            ..
        } = &mut *feed;
        entries.retain(|e| tracked_events.contains(&e.event_id));
    }

    /// Record one push. Returns the assigned sequence number, or `None` if ignored.
    pub fn record(&self, push: &PushEvent) -> Option<u64> {
        if !PushKind::ACTIVITY.contains(&push.kind) {
            return None;
        }
        let Some(event_id) = push.event_id() else {
            tracing::debug!(kind = push.kind.tag(), "activity push without eventId");
            return None;
        };
        let mut feed = self.feed.lock();
        if !feed.tracked_events.contains(event_id) {
            tracing::debug!(kind = push.kind.tag(), %event_id, "activity for untracked event");
            return None;
        }
        feed.seq += 1;
        let seq = feed.seq;
        feed.entries.push_back(ActivityEntry {
            seq,
            kind: push.kind,
            event_id: event_id.to_string(),
            data: push.data.clone(),
            received_at: push.received_at,
        });
        while feed.entries.len() > MAX_ACTIVITY_ENTRIES {
            feed.entries.pop_front();
        }
        Some(seq)
    }

    /// Up to `limit` most recent entries, newest first. `None` means every tracked event.
    pub fn recent(&self, event_id: Option<&str>, limit: usize) -> Vec<ActivityEntry> {
        let feed = self.feed.lock();
        feed.entries
            .iter()
            .rev()
            .filter(|e| event_id.map_or(true, |id| e.event_id == id))
            .take(limit)
            .cloned()
            .collect()
    }

    /// Most recent entry of `kind` for `event_id` (e.g. the current leaderboard).
    pub fn latest(&self, kind: PushKind, event_id: &str) -> Option<ActivityEntry> {
        let feed = self.feed.lock();
        feed.entries
            .iter()
            .rev()
            .find(|e| e.kind == kind && e.event_id == event_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.feed.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.feed.lock().entries.is_empty()
    }

    pub fn reset(&self) {
        *self.feed.lock() = Feed::default();
    }
}

impl PushHandler for ActivityFeed {
    fn handle_push(&self, push: &PushEvent) {
        self.record(push);
    }
}
