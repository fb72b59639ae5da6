//! Request/response collaborators consumed by the live core.
//!
//! Backed by the platform REST API in production ([`http::HttpBackend`]) and
//! an in-memory fixture in tests ([`memory::MemoryBackend`]).

pub mod http;
pub mod memory;

use async_trait::async_trait;

use crate::error::ClientError;
use crate::models::membership::UserEvents;
use crate::models::message::{Message, SendMessageRequest};
use crate::models::notification::Notification;
use crate::models::participant::Participant;

#[async_trait]
pub trait EventMembership: Send + Sync {
    async fn get_user_events(&self) -> Result<UserEvents, ClientError>;
}

#[async_trait]
pub trait AnnouncementService: Send + Sync {
    async fn get_event_announcements(
        &self,
        event_id: &str,
    ) -> Result<Vec<Notification>, ClientError>;
    async fn mark_as_read(&self, id: &str) -> Result<(), ClientError>;
}

#[async_trait]
pub trait ChatService: Send + Sync {
    /// `page` is 1-based.
    async fn get_messages(
        &self,
        event_id: &str,
        page: u32,
        limit: u32,
    ) -> Result<Vec<Message>, ClientError>;
    async fn send_message(&self, request: &SendMessageRequest) -> Result<Message, ClientError>;
}

#[async_trait]
pub trait ParticipantRoster: Send + Sync {
    async fn get_participants(&self, event_id: &str) -> Result<Vec<Participant>, ClientError>;
}

/// Everything the core needs from the platform, in one bound.
pub trait Backend: EventMembership + AnnouncementService + ChatService + ParticipantRoster {}

impl<T> Backend for T where
    T: EventMembership + AnnouncementService + ChatService + ParticipantRoster
{
}
