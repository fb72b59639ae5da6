//! In-memory collaborator fixture for tests and offline runs.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use crate::error::ClientError;
use crate::models::membership::UserEvents;
use crate::models::message::{Message, SendMessageRequest};
use crate::models::notification::Notification;
use crate::models::participant::Participant;

use super::{AnnouncementService, ChatService, EventMembership, ParticipantRoster};

#[derive(Default)]
struct Data {
    user_events: UserEvents,
    announcements: HashMap<String, Vec<Notification>>,
    read_calls: Vec<String>,
    messages: HashMap<String, Vec<Message>>,
    sent: Vec<SendMessageRequest>,
    participants: HashMap<String, Vec<Participant>>,
    failing_events: HashSet<String>,
    calls: HashMap<&'static str, usize>,
}

/// Collaborator backed by plain maps. Every call can be made to fail.
#[derive(Default)]
pub struct MemoryBackend {
    data: Mutex<Data>,
    fail_all: AtomicBool,
    next_id: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_user_events(&self, events: UserEvents) {
        self.data.lock().user_events = events;
    }

    pub fn set_announcements(&self, event_id: &str, items: Vec<Notification>) {
        self.data
            .lock()
            .announcements
            .insert(event_id.to_string(), items);
    }

    pub fn set_messages(&self, event_id: &str, messages: Vec<Message>) {
        self.data
            .lock()
            .messages
            .insert(event_id.to_string(), messages);
    }

    pub fn set_participants(&self, event_id: &str, participants: Vec<Participant>) {
        self.data
            .lock()
            .participants
            .insert(event_id.to_string(), participants);
    }

    /// Make every call fail with a 503 until reset.
    pub fn set_failing(&self, failing: bool) {
        self.fail_all.store(failing, Ordering::SeqCst);
    }

    /// Make calls scoped to `event_id` fail with a 503.
    pub fn fail_event(&self, event_id: &str) {
        self.data.lock().failing_events.insert(event_id.to_string());
    }

    pub fn read_calls(&self) -> Vec<String> {
        self.data.lock().read_calls.clone()
    }

    pub fn sent(&self) -> Vec<SendMessageRequest> {
        self.data.lock().sent.clone()
    }

    /// How many times the named collaborator method was invoked.
    pub fn call_count(&self, method: &str) -> usize {
        self.data.lock().calls.get(method).copied().unwrap_or(0)
    }

    fn enter(&self, method: &'static str, event_id: Option<&str>) -> Result<(), ClientError> {
        let mut data = self.data.lock();
        *data.calls.entry(method).or_default() += 1;
        let failing = self.fail_all.load(Ordering::SeqCst)
            || event_id.is_some_and(|id| data.failing_events.contains(id));
        if failing {
            return Err(ClientError::http(503, "Service unavailable"));
        }
        Ok(())
    }
}

#[async_trait]
impl EventMembership for MemoryBackend {
    async fn get_user_events(&self) -> Result<UserEvents, ClientError> {
        self.enter("get_user_events", None)?;
        Ok(self.data.lock().user_events.clone())
    }
}

#[async_trait]
impl AnnouncementService for MemoryBackend {
    async fn get_event_announcements(
        &self,
        event_id: &str,
    ) -> Result<Vec<Notification>, ClientError> {
        self.enter("get_event_announcements", Some(event_id))?;
        Ok(self
            .data
            .lock()
            .announcements
            .get(event_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn mark_as_read(&self, id: &str) -> Result<(), ClientError> {
        self.enter("mark_as_read", None)?;
        self.data.lock().read_calls.push(id.to_string());
        Ok(())
    }
}

#[async_trait]
impl ChatService for MemoryBackend {
    async fn get_messages(
        &self,
        event_id: &str,
        page: u32,
        limit: u32,
    ) -> Result<Vec<Message>, ClientError> {
        self.enter("get_messages", Some(event_id))?;
        let data = self.data.lock();
        let all = data.messages.get(event_id).map(Vec::as_slice).unwrap_or_default();
        let skip = (page.max(1) as usize - 1) * limit as usize;
        Ok(all.iter().skip(skip).take(limit as usize).cloned().collect())
    }

    async fn send_message(&self, request: &SendMessageRequest) -> Result<Message, ClientError> {
        self.enter("send_message", Some(&request.event_id))?;
        let n = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.data.lock().sent.push(request.clone());
        Ok(Message {
            id: Some(format!("srv_{n}")),
            alt_id: None,
            event_id: request.event_id.clone(),
            sender_id: String::new(),
            text: request.text.clone(),
            message_type: request.message_type,
            parent_message_id: request.parent_message_id.clone(),
            created_at: Some(Utc::now()),
            client_id: Some(request.client_id.clone()),
            pinned: false,
            reactions: Default::default(),
            read_by: Default::default(),
            observed_at: None,
        })
    }
}

#[async_trait]
impl ParticipantRoster for MemoryBackend {
    async fn get_participants(&self, event_id: &str) -> Result<Vec<Participant>, ClientError> {
        self.enter("get_participants", Some(event_id))?;
        Ok(self
            .data
            .lock()
            .participants
            .get(event_id)
            .cloned()
            .unwrap_or_default())
    }
}
