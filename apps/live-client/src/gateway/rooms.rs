//! Room subscriptions: keep the server-side room set in line with the user's events.
//!
//! Joins are fire-and-forget. The desired set is the user room plus one room
//! per created or joined event; rooms that drop out of it get an explicit
//! `leave_room`. Server-side joins do not survive a reconnect, so the joined
//! set is forgotten on every disconnect and replayed on every connect.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::api::EventMembership;
use crate::models::membership::UserEvents;
use crate::models::room::{compute_rooms, Room, RoomType};

use super::connection::{ConnectionHandle, ConnectionState};
use super::events::ClientFrame;

#[derive(Default)]
struct RoomSets {
    desired: BTreeSet<Room>,
    joined: HashSet<Room>,
}

pub struct RoomSubscriptions {
    user_id: String,
    connection: ConnectionHandle,
    membership: Arc<dyn EventMembership>,
    rooms: Mutex<RoomSets>,
}

impl RoomSubscriptions {
    pub fn new(
        user_id: impl Into<String>,
        connection: ConnectionHandle,
        membership: Arc<dyn EventMembership>,
    ) -> Self {
        let user_id = user_id.into();
        let rooms = RoomSets {
            desired: compute_rooms(&user_id, &UserEvents::default()),
            joined: HashSet::new(),
        };
        Self {
            user_id,
            connection,
            membership,
            rooms: Mutex::new(rooms),
        }
    }

    /// Fetch the user's events and resync rooms. Returns the current event ids.
    ///
    /// A failed fetch is logged and the previous room set is kept.
    pub async fn refresh(&self) -> BTreeSet<String> {
        match self.membership.get_user_events().await {
            Ok(events) => self.set_events(&events),
            Err(err) => {
                tracing::warn!(%err, "event membership fetch failed; keeping previous rooms");
                self.event_ids()
            }
        }
    }

    /// Replace the desired room set from a membership snapshot and resync.
    pub fn set_events(&self, events: &UserEvents) -> BTreeSet<String> {
        self.rooms.lock().desired = compute_rooms(&self.user_id, events);
        self.sync();
        self.event_ids()
    }

    /// Event ids currently in the desired set.
    pub fn event_ids(&self) -> BTreeSet<String> {
        self.rooms
            .lock()
            .desired
            .iter()
            .filter(|room| room.room_type == RoomType::Event)
            .map(|room| room.room_id.clone())
            .collect()
    }

    pub fn joined(&self) -> BTreeSet<Room> {
        self.rooms.lock().joined.iter().cloned().collect()
    }

    /// Join missing rooms and leave dropped ones. No-op while disconnected.
    pub fn sync(&self) {
        if !self.connection.is_connected() {
            return;
        }
        let mut rooms = self.rooms.lock();
        let RoomSets { desired, joined } = &mut *rooms;

        for room in desired.iter() {
            if joined.contains(room) {
                continue;
            }
            match self.connection.send(ClientFrame::join_room(room)) {
                Ok(()) => {
                    tracing::debug!(%room, "join requested");
                    joined.insert(room.clone());
                }
                Err(err) => {
                    tracing::debug!(%room, %err, "join deferred until reconnect");
                    return;
                }
            }
        }

        let dropped: Vec<Room> = joined.iter().filter(|r| !desired.contains(*r)).cloned().collect();
        for room in dropped {
            if let Err(err) = self.connection.send(ClientFrame::leave_room(&room)) {
                tracing::debug!(%room, %err, "leave skipped; connection gone");
                return;
            }
            tracing::debug!(%room, "leave requested");
            joined.remove(&room);
        }
    }

    /// Forget joins and reset the desired set to the user room only (teardown).
    pub fn reset(&self) {
        let mut rooms = self.rooms.lock();
        rooms.joined.clear();
        rooms.desired = compute_rooms(&self.user_id, &UserEvents::default());
    }

    /// Follow connection state: forget joins on disconnect, rejoin everything on connect.
    pub fn spawn_sync(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        let mut state_rx = self.connection.watch_state();
        tokio::spawn(async move {
            loop {
                let state = *state_rx.borrow_and_update();
                this.rooms.lock().joined.clear();
                if state == ConnectionState::Connected {
                    this.sync();
                }
                if state_rx.changed().await.is_err() {
                    break;
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::memory::MemoryBackend;
    use crate::gateway::events::EVENT_LEAVE_ROOM;
    use tokio::sync::mpsc;

    fn drain(rx: &mut mpsc::UnboundedReceiver<ClientFrame>) -> Vec<ClientFrame> {
        let mut frames = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            frames.push(frame);
        }
        frames
    }

    fn events(ids: &[&str]) -> UserEvents {
        UserEvents {
            created_event_ids: vec![],
            participating_event_ids: ids.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn refresh_joins_user_and_event_rooms_once() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_user_events(UserEvents {
            created_event_ids: vec!["ev1".into()],
            participating_event_ids: vec!["ev2".into()],
        });
        let (handle, mut rx) = ConnectionHandle::connected_for_tests();
        let rooms = RoomSubscriptions::new("u1", handle, backend);

        let ids = rooms.refresh().await;
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec!["ev1", "ev2"]);

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| f.event == "join_room"));

        // Same set again: nothing new goes out.
        rooms.refresh().await;
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn growth_joins_only_new_rooms_and_shrink_leaves() {
        let backend = Arc::new(MemoryBackend::new());
        let (handle, mut rx) = ConnectionHandle::connected_for_tests();
        let rooms = RoomSubscriptions::new("u1", handle, backend);

        rooms.set_events(&events(&["ev1"]));
        assert_eq!(drain(&mut rx).len(), 2);

        rooms.set_events(&events(&["ev1", "ev2"]));
        let frames = drain(&mut rx);
        assert_eq!(frames, vec![ClientFrame::join_room(&Room::event("ev2"))]);

        rooms.set_events(&events(&["ev2"]));
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event, EVENT_LEAVE_ROOM);
        assert_eq!(frames[0].data["roomId"], "ev1");
        assert!(!rooms.joined().contains(&Room::event("ev1")));
    }

    #[tokio::test]
    async fn no_joins_while_disconnected() {
        let backend = Arc::new(MemoryBackend::new());
        let (handle, mut rx) = ConnectionHandle::connected_for_tests();
        handle.set_state_for_tests(ConnectionState::Disconnected);
        let rooms = RoomSubscriptions::new("u1", handle, backend);

        rooms.set_events(&events(&["ev1"]));
        assert!(drain(&mut rx).is_empty());
        assert!(rooms.joined().is_empty());
        assert_eq!(rooms.event_ids().len(), 1);
    }

    #[tokio::test]
    async fn membership_failure_keeps_previous_rooms() {
        let backend = Arc::new(MemoryBackend::new());
        let (handle, _rx) = ConnectionHandle::connected_for_tests();
        let rooms = RoomSubscriptions::new("u1", handle, backend.clone());
        rooms.set_events(&events(&["ev1"]));

        backend.set_failing(true);
        let ids = rooms.refresh().await;
        assert!(ids.contains("ev1"));
    }

    #[tokio::test]
    async fn reconnect_rejoins_everything() {
        let backend = Arc::new(MemoryBackend::new());
        let (handle, mut rx) = ConnectionHandle::connected_for_tests();
        let rooms = Arc::new(RoomSubscriptions::new("u1", handle.clone(), backend));
        rooms.set_events(&events(&["ev1"]));
        assert_eq!(drain(&mut rx).len(), 2);

        let watcher = rooms.spawn_sync();
        tokio::task::yield_now().await;
        drain(&mut rx);

        handle.set_state_for_tests(ConnectionState::Disconnected);
        tokio::task::yield_now().await;
        assert!(rooms.joined().is_empty());

        handle.set_state_for_tests(ConnectionState::Connected);
        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while rooms.joined().len() < 2 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("rooms rejoined");
        assert_eq!(drain(&mut rx).len(), 2);
        watcher.abort();
    }
}
