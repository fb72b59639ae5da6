//! Live channel event tags and wire-format frames.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::room::Room;

// ---------------------------------------------------------------------------
// Control events
// ---------------------------------------------------------------------------

pub const EVENT_IDENTIFY: &str = "identify";
pub const EVENT_READY: &str = "ready";
pub const EVENT_JOIN_ROOM: &str = "join_room";
pub const EVENT_LEAVE_ROOM: &str = "leave_room";

/// Close codes the server uses to reject a handshake.
pub const CLOSE_NOT_AUTHENTICATED: u16 = 4003;
pub const CLOSE_AUTH_FAILED: u16 = 4004;

// ---------------------------------------------------------------------------
// Client → Server frame
// ---------------------------------------------------------------------------

/// A frame sent from the client to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientFrame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl ClientFrame {
    /// First frame on a new connection.
    pub fn identify(token: &str) -> Self {
        Self {
            event: EVENT_IDENTIFY.to_string(),
            data: serde_json::json!({ "token": token }),
        }
    }

    pub fn join_room(room: &Room) -> Self {
        Self {
            event: EVENT_JOIN_ROOM.to_string(),
            data: serde_json::to_value(room).unwrap_or_default(),
        }
    }

    pub fn leave_room(room: &Room) -> Self {
        Self {
            event: EVENT_LEAVE_ROOM.to_string(),
            data: serde_json::to_value(room).unwrap_or_default(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Server → Client frame
// ---------------------------------------------------------------------------

/// A frame received from the server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerFrame {
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

impl ServerFrame {
    /// Parse a text frame. Anything that isn't a `{event, data}` object yields `None`.
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }

    /// Convert into a routable push. Control events and unknown tags yield `None`.
    pub fn into_push(self) -> Option<PushEvent> {
        let kind = PushKind::from_tag(&self.event)?;
        Some(PushEvent {
            kind,
            data: self.data,
            received_at: Utc::now(),
        })
    }
}

// ---------------------------------------------------------------------------
// Push events
// ---------------------------------------------------------------------------

/// Server push tags the router knows how to route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PushKind {
    TeamUpdate,
    SubmissionUpdate,
    LeaderboardUpdate,
    AnnouncementCreate,
    AnnouncementUpdate,
    AnnouncementDelete,
    Notification,
    QnaMessage,
    QnaUpdate,
    QnaDelete,
    QnaReaction,
    QnaRead,
    QnaPin,
}

impl PushKind {
    pub const ALL: [PushKind; 13] = [
        PushKind::TeamUpdate,
        PushKind::SubmissionUpdate,
        PushKind::LeaderboardUpdate,
        PushKind::AnnouncementCreate,
        PushKind::AnnouncementUpdate,
        PushKind::AnnouncementDelete,
        PushKind::Notification,
        PushKind::QnaMessage,
        PushKind::QnaUpdate,
        PushKind::QnaDelete,
        PushKind::QnaReaction,
        PushKind::QnaRead,
        PushKind::QnaPin,
    ];

    pub const ANNOUNCEMENTS: [PushKind; 4] = [
        PushKind::AnnouncementCreate,
        PushKind::AnnouncementUpdate,
        PushKind::AnnouncementDelete,
        PushKind::Notification,
    ];

    pub const QNA: [PushKind; 6] = [
        PushKind::QnaMessage,
        PushKind::QnaUpdate,
        PushKind::QnaDelete,
        PushKind::QnaReaction,
        PushKind::QnaRead,
        PushKind::QnaPin,
    ];

    pub const ACTIVITY: [PushKind; 3] = [
        PushKind::TeamUpdate,
        PushKind::SubmissionUpdate,
        PushKind::LeaderboardUpdate,
    ];

    pub fn tag(self) -> &'static str {
        match self {
            PushKind::TeamUpdate => "team_update",
            PushKind::SubmissionUpdate => "submission_update",
            PushKind::LeaderboardUpdate => "leaderboard_update",
            PushKind::AnnouncementCreate => "event_announcement",
            PushKind::AnnouncementUpdate => "event_announcement_update",
            PushKind::AnnouncementDelete => "event_announcement_delete",
            PushKind::Notification => "notification",
            PushKind::QnaMessage => "qna_message",
            PushKind::QnaUpdate => "qna_update",
            PushKind::QnaDelete => "qna_delete",
            PushKind::QnaReaction => "qna_reaction",
            PushKind::QnaRead => "qna_read",
            PushKind::QnaPin => "qna_pin",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.tag() == tag)
    }
}

/// One inbound push, as handed to consumers.
#[derive(Debug, Clone)]
pub struct PushEvent {
    pub kind: PushKind,
    pub data: Value,
    pub received_at: DateTime<Utc>,
}

impl PushEvent {
    pub fn new(kind: PushKind, data: Value) -> Self {
        Self {
            kind,
            data,
            received_at: Utc::now(),
        }
    }

    /// The `eventId` scope discriminator, if the payload carries one.
    pub fn event_id(&self) -> Option<&str> {
        self.data
            .get("eventId")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_tag_round_trips() {
        for kind in PushKind::ALL {
            assert_eq!(PushKind::from_tag(kind.tag()), Some(kind));
        }
    }

    #[test]
    fn unknown_and_control_tags_are_not_pushes() {
        assert!(ServerFrame::parse(r#"{"event":"ready","data":{}}"#)
            .unwrap()
            .into_push()
            .is_none());
        assert!(ServerFrame::parse(r#"{"event":"confetti","data":{}}"#)
            .unwrap()
            .into_push()
            .is_none());
    }

    #[test]
    fn malformed_frames_are_dropped() {
        assert!(ServerFrame::parse("not json").is_none());
        assert!(ServerFrame::parse(r#"{"data":{}}"#).is_none());
        assert!(ServerFrame::parse("[1,2,3]").is_none());
    }

    #[test]
    fn push_exposes_scope() {
        let text = r#"{"event":"qna_message","data":{"eventId":"ev1","id":"m1"}}"#;
        let push = ServerFrame::parse(text)
            .unwrap()
            .into_push()
            .unwrap();
        assert_eq!(push.kind, PushKind::QnaMessage);
        assert_eq!(push.event_id(), Some("ev1"));
    }

    #[test]
    fn join_room_frame_shape() {
        let frame = ClientFrame::join_room(&Room::user("u1"));
        let json: Value = serde_json::from_str(&frame.to_json()).unwrap();
        assert_eq!(json["event"], "join_room");
        assert_eq!(json["data"]["roomType"], "user");
        assert_eq!(json["data"]["roomId"], "u1");
    }
}
