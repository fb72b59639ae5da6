use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use super::membership::UserEvents;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomType {
    User,
    Event,
}

/// A server-side broadcast channel the live connection can join.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Room {
    pub room_type: RoomType,
    pub room_id: String,
}

impl Room {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            room_type: RoomType::User,
            room_id: user_id.into(),
        }
    }

    pub fn event(event_id: impl Into<String>) -> Self {
        Self {
            room_type: RoomType::Event,
            room_id: event_id.into(),
        }
    }
}

impl fmt::Display for Room {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.room_type {
            RoomType::User => write!(f, "user:{}", self.room_id),
            RoomType::Event => write!(f, "event:{}", self.room_id),
        }
    }
}

/// The room set for a user: their own room plus one per created or joined event.
pub fn compute_rooms(user_id: &str, events: &UserEvents) -> BTreeSet<Room> {
    let mut rooms: BTreeSet<Room> = events.event_ids().into_iter().map(Room::event).collect();
    if !user_id.is_empty() {
        rooms.insert(Room::user(user_id));
    }
    rooms
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rooms_cover_user_and_union_of_events() {
        let events = UserEvents {
            created_event_ids: vec!["ev1".into(), "ev2".into()],
            participating_event_ids: vec!["ev2".into(), "ev3".into()],
        };
        let rooms = compute_rooms("u1", &events);
        assert_eq!(rooms.len(), 4);
        assert!(rooms.contains(&Room::user("u1")));
        assert!(rooms.contains(&Room::event("ev1")));
        assert!(rooms.contains(&Room::event("ev2")));
        assert!(rooms.contains(&Room::event("ev3")));
    }

    #[test]
    fn room_serializes_as_join_payload() {
        let json = serde_json::to_value(Room::event("ev1")).unwrap();
        assert_eq!(json, serde_json::json!({"roomType": "event", "roomId": "ev1"}));
    }
}
