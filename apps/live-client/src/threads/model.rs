//! Per-event Q&A boards: history, live deltas, pending sends.
//!
//! Each open board keeps the server-confirmed message set and a separate
//! pending overlay of sends that have not been echoed back yet. The thread
//! view is re-derived from the confirmed set after every mutation.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use hackhub_common::id::prefix;
use hackhub_common::PrefixedId;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;

use crate::api::{ChatService, ParticipantRoster};
use crate::config::Config;
use crate::error::{ClientError, FieldError};
use crate::gateway::connection::ConnectionHandle;
use crate::gateway::events::{PushEvent, PushKind};
use crate::gateway::router::PushHandler;
use crate::models::message::{
    Message, MessagePatch, MessageRef, MessageType, ReactionChange, ReadReceipt, SendMessageRequest,
};

use super::projection::{derive_threads, ThreadView};
use super::roster::{placeholder_name, Roster};

/// Longest message body accepted by `send`, in characters.
pub const MAX_MESSAGE_CHARS: usize = 4000;

const CHANGE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingStatus {
    /// Request in flight.
    Sending,
    /// Accepted by the chat service; waiting for the live echo.
    Sent,
    /// Request failed. Can be retried with the same client id or discarded.
    Failed,
}

/// A send that has not been reconciled with its server echo yet.
#[derive(Debug, Clone)]
pub struct PendingMessage {
    pub client_id: String,
    pub request: SendMessageRequest,
    pub status: PendingStatus,
    /// Server id from the send response, once known.
    pub server_id: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub error: Option<ClientError>,
}

impl PrefixedId for PendingMessage {
    const PREFIX: &'static str = prefix::CLIENT_MESSAGE;
}

impl PendingMessage {
    /// Whether `echo` is the server copy of this send.
    ///
    /// Tried in order: the echoed client id, the server id from the send
    /// response, then same sender, text and parent within `window`.
    fn matches(&self, echo: &Message, user_id: &str, window: chrono::Duration) -> bool {
        if let Some(client_id) = echo.client_id.as_deref().filter(|c| !c.is_empty()) {
            return client_id == self.client_id;
        }
        if let (Some(server_id), Some(key)) = (self.server_id.as_deref(), echo.key()) {
            if server_id == key {
                return true;
            }
        }
        let elapsed = (echo.sort_time() - self.submitted_at).num_milliseconds().abs();
        echo.sender_id == user_id
            && echo.text.trim() == self.request.text
            && echo.parent_key() == self.request.parent_message_id.as_deref()
            && elapsed <= window.num_milliseconds()
    }
}

struct Board {
    /// Distinguishes this opening of the board from earlier ones.
    session: u64,
    messages: Vec<Message>,
    pending: Vec<PendingMessage>,
    roster: Roster,
    view: ThreadView,
    next_page: u32,
    exhausted: bool,
}

impl Board {
    fn new(session: u64) -> Self {
        Self {
            session,
            messages: Vec::new(),
            pending: Vec::new(),
            roster: Roster::default(),
            view: ThreadView::default(),
            next_page: 1,
            exhausted: false,
        }
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.messages.iter().position(|m| m.key() == Some(key))
    }

    fn find_mut(&mut self, key: &str) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.key() == Some(key))
    }

    fn rederive(&mut self) {
        self.view = derive_threads(&self.messages);
    }

    /// Drop the pending entry `echo` settles, if any.
    fn reconcile(&mut self, echo: &Message, user_id: &str, window: chrono::Duration) -> bool {
        match self.pending.iter().position(|p| p.matches(echo, user_id, window)) {
            Some(index) => {
                let settled = self.pending.remove(index);
                tracing::debug!(
                    client_id = %settled.client_id,
                    message_id = ?echo.key(),
                    "pending send settled"
                );
                true
            }
            None => false,
        }
    }

    /// Merge a history page. Existing messages take the server copy but keep
    /// their first observation time and every reader seen so far.
    fn merge_page(
        &mut self,
        page: Vec<Message>,
        now: DateTime<Utc>,
        user_id: &str,
        window: chrono::Duration,
    ) -> usize {
        let mut merged = 0;
        for mut incoming in page {
            let Some(key) = incoming.key().map(str::to_string) else {
                continue;
            };
            let first_seen = self.position(&key).and_then(|i| self.messages[i].observed_at);
            incoming.observed_at = Some(first_seen.unwrap_or(now));
            self.reconcile(&incoming, user_id, window);
            match self.find_mut(&key) {
                Some(existing) => {
                    incoming.read_by.extend(std::mem::take(&mut existing.read_by));
                    *existing = incoming;
                }
                None => self.messages.push(incoming),
            }
            merged += 1;
        }
        self.rederive();
        merged
    }

    /// Merge a freshly fetched first page and drop what the server no longer has.
    ///
    /// Confirmed messages inside the page's time span that the page does not
    /// list were deleted while their delete push was missed. An exhausted
    /// page covers all history up to the moment it was requested.
    fn merge_first_page(
        &mut self,
        page: Vec<Message>,
        requested_at: DateTime<Utc>,
        exhausted: bool,
        user_id: &str,
        window: chrono::Duration,
    ) -> usize {
        let listed: HashSet<String> = page
            .iter()
            .filter_map(|m| m.key().map(str::to_string))
            .collect();
        let merged = self.merge_page(page, Utc::now(), user_id, window);

        let span: Vec<DateTime<Utc>> = self
            .messages
            .iter()
            .filter(|m| m.key().is_some_and(|k| listed.contains(k)))
            .map(Message::sort_time)
            .collect();
        if span.is_empty() && !exhausted {
            return merged;
        }
        let listed_newest = span.iter().max().copied();
        let (oldest, newest) = if exhausted {
            (None, listed_newest.map_or(requested_at, |t| t.max(requested_at)))
        } else {
            (span.iter().min().copied(), listed_newest.unwrap_or(requested_at))
        };

        let before = self.messages.len();
        self.messages.retain(|m| {
            let time = m.sort_time();
            m.key().is_some_and(|k| listed.contains(k))
                || time > newest
                || oldest.is_some_and(|o| time < o)
        });
        let removed = before - self.messages.len();
        if removed > 0 {
            tracing::debug!(removed, "dropping q&a messages missing from reloaded history");
            self.rederive();
        }
        merged
    }
}

/// Owner of every open Q&A board for one session.
pub struct ThreadModel {
    user_id: String,
    config: Arc<Config>,
    chat: Arc<dyn ChatService>,
    roster: Arc<dyn ParticipantRoster>,
    connection: ConnectionHandle,
    boards: Mutex<HashMap<String, Board>>,
    next_session: AtomicU64,
    changes: broadcast::Sender<String>,
}

impl ThreadModel {
    pub fn new(
        user_id: impl Into<String>,
        config: Arc<Config>,
        chat: Arc<dyn ChatService>,
        roster: Arc<dyn ParticipantRoster>,
        connection: ConnectionHandle,
    ) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            user_id: user_id.into(),
            config,
            chat,
            roster,
            connection,
            boards: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(1),
            changes,
        }
    }

    /// Receiver of event ids whose board changed.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<String> {
        self.changes.subscribe()
    }

    /// Start tracking `event_id`. Returns false if it was already open.
    pub fn open(&self, event_id: &str) -> bool {
        let mut boards = self.boards.lock();
        if boards.contains_key(event_id) {
            return false;
        }
        let session = self.next_session.fetch_add(1, Ordering::Relaxed);
        boards.insert(event_id.to_string(), Board::new(session));
        tracing::debug!(%event_id, "q&a board opened");
        true
    }

    /// Stop tracking `event_id`. Outstanding loads for it are discarded.
    pub fn close(&self, event_id: &str) -> bool {
        self.boards.lock().remove(event_id).is_some()
    }

    pub fn close_all(&self) {
        self.boards.lock().clear();
    }

    pub fn is_open(&self, event_id: &str) -> bool {
        self.boards.lock().contains_key(event_id)
    }

    pub fn open_events(&self) -> Vec<String> {
        let mut events: Vec<String> = self.boards.lock().keys().cloned().collect();
        events.sort();
        events
    }

    /// Fetch the first history page (and the roster, once) and merge it.
    ///
    /// Opens the board if needed. Returns the number of messages merged; a
    /// completion for a board that was closed meanwhile merges nothing.
    pub async fn load_history(&self, event_id: &str) -> Result<usize, ClientError> {
        self.open(event_id);
        let (session, need_roster) = {
            let boards = self.boards.lock();
            match boards.get(event_id) {
                Some(board) => (board.session, !board.roster.is_loaded()),
                None => return Ok(0),
            }
        };

        let limit = self.config.history_page_size;
        let roster = async {
            if need_roster {
                Some(self.roster.get_participants(event_id).await)
            } else {
                None
            }
        };
        let requested_at = Utc::now();
        let (history, roster) = tokio::join!(self.chat.get_messages(event_id, 1, limit), roster);

        let merged = {
            let mut boards = self.boards.lock();
            let Some(board) = boards.get_mut(event_id).filter(|b| b.session == session) else {
                tracing::debug!(%event_id, "discarding history for a closed board");
                return Ok(0);
            };
            match roster {
                Some(Ok(participants)) => board.roster = Roster::from_participants(participants),
                Some(Err(err)) => tracing::warn!(%event_id, %err, "participant roster load failed"),
                None => {}
            }
            let page = history?;
            let exhausted = page.len() < limit as usize;
            let window = self.echo_window();
            let merged =
                board.merge_first_page(page, requested_at, exhausted, &self.user_id, window);
            // Older pages already merged stay merged; paging resumes where it was.
            let paged_back = board.next_page > 2;
            board.exhausted = exhausted || (paged_back && board.exhausted);
            board.next_page = board.next_page.max(2);
            merged
        };

        tracing::debug!(%event_id, merged, "q&a history loaded");
        self.notify(event_id);
        Ok(merged)
    }

    /// Fetch and merge the next older history page. Returns 0 once history is exhausted.
    pub async fn load_older(&self, event_id: &str) -> Result<usize, ClientError> {
        let (session, page_number) = {
            let boards = self.boards.lock();
            let Some(board) = boards.get(event_id) else {
                return Err(ClientError::not_found(format!("Q&A board {event_id} is not open")));
            };
            if board.exhausted {
                return Ok(0);
            }
            (board.session, board.next_page.max(1))
        };

        let limit = self.config.history_page_size;
        let page = self.chat.get_messages(event_id, page_number, limit).await?;

        let merged = {
            let mut boards = self.boards.lock();
            let Some(board) = boards.get_mut(event_id).filter(|b| b.session == session) else {
                return Ok(0);
            };
            if board.next_page.max(1) != page_number {
                // A concurrent load already consumed this page.
                return Ok(0);
            }
            let fetched = page.len();
            let merged = board.merge_page(page, Utc::now(), &self.user_id, self.echo_window());
            board.next_page = page_number + 1;
            board.exhausted = fetched < limit as usize;
            merged
        };

        self.notify(event_id);
        Ok(merged)
    }

    /// Submit a question, or an answer when `reply_to` names a question.
    ///
    /// Returns the client id keying the pending entry. The message only joins
    /// the confirmed set once its echo arrives on the live channel.
    pub async fn send(
        &self,
        event_id: &str,
        text: &str,
        reply_to: Option<&str>,
    ) -> Result<String, ClientError> {
        if !self.connection.is_connected() {
            return Err(ClientError::not_connected());
        }
        let text = text.trim();
        let mut problems = Vec::new();
        if text.is_empty() {
            problems.push(FieldError {
                field: "text".to_string(),
                message: "must not be empty".to_string(),
            });
        } else if text.chars().count() > MAX_MESSAGE_CHARS {
            problems.push(FieldError {
                field: "text".to_string(),
                message: format!("must be at most {MAX_MESSAGE_CHARS} characters"),
            });
        }

        let client_id = PendingMessage::generate();
        let (request, session) = {
            let mut boards = self.boards.lock();
            let Some(board) = boards.get_mut(event_id) else {
                return Err(ClientError::not_found(format!("Q&A board {event_id} is not open")));
            };
            if let Some(parent) = reply_to {
                let is_question = board
                    .position(parent)
                    .is_some_and(|i| board.messages[i].is_question());
                if !is_question {
                    problems.push(FieldError {
                        field: "replyTo".to_string(),
                        message: "must reference a question in this event".to_string(),
                    });
                }
            }
            if !problems.is_empty() {
                return Err(ClientError::validation(problems));
            }

            let request = SendMessageRequest {
                event_id: event_id.to_string(),
                text: text.to_string(),
                message_type: if reply_to.is_some() {
                    MessageType::Answer
                } else {
                    MessageType::Question
                },
                parent_message_id: reply_to.map(str::to_string),
                client_id: client_id.clone(),
            };
            board.pending.push(PendingMessage {
                client_id: client_id.clone(),
                request: request.clone(),
                status: PendingStatus::Sending,
                server_id: None,
                submitted_at: Utc::now(),
                error: None,
            });
            (request, board.session)
        };
        self.notify(event_id);

        self.deliver(session, request).await?;
        Ok(client_id)
    }

    /// Resend a failed pending message under its original client id.
    pub async fn retry_send(&self, event_id: &str, client_id: &str) -> Result<(), ClientError> {
        if !self.connection.is_connected() {
            return Err(ClientError::not_connected());
        }
        let (request, session) = {
            let mut boards = self.boards.lock();
            let Some(board) = boards.get_mut(event_id) else {
                return Err(ClientError::not_found(format!("Q&A board {event_id} is not open")));
            };
            let Some(pending) = board.pending.iter_mut().find(|p| p.client_id == client_id) else {
                return Err(ClientError::not_found(format!("No pending message {client_id}")));
            };
            if pending.status != PendingStatus::Failed {
                return Ok(());
            }
            pending.status = PendingStatus::Sending;
            pending.error = None;
            pending.submitted_at = Utc::now();
            (pending.request.clone(), board.session)
        };
        self.notify(event_id);
        self.deliver(session, request).await
    }

    /// Drop a pending message from the overlay. Returns false if it was not there.
    pub fn discard_pending(&self, event_id: &str, client_id: &str) -> bool {
        let removed = {
            let mut boards = self.boards.lock();
            let Some(board) = boards.get_mut(event_id) else {
                return false;
            };
            let before = board.pending.len();
            board.pending.retain(|p| p.client_id != client_id);
            board.pending.len() != before
        };
        if removed {
            self.notify(event_id);
        }
        removed
    }

    async fn deliver(&self, session: u64, request: SendMessageRequest) -> Result<(), ClientError> {
        let result = self.chat.send_message(&request).await;
        let event_id = request.event_id.as_str();

        {
            let mut boards = self.boards.lock();
            let Some(board) = boards.get_mut(event_id).filter(|b| b.session == session) else {
                return result.map(|_| ());
            };
            let confirmed = match &result {
                Ok(message) => message.key().map(str::to_string),
                Err(_) => None,
            };
            let echoed = confirmed.as_deref().is_some_and(|key| board.position(key).is_some());

            let pending_at = board
                .pending
                .iter()
                .position(|p| p.client_id == request.client_id);
            if let Some(index) = pending_at {
                match &result {
                    Ok(_) if echoed => {
                        board.pending.remove(index);
                    }
                    Ok(_) => {
                        let pending = &mut board.pending[index];
                        pending.status = PendingStatus::Sent;
                        pending.server_id = confirmed;
                    }
                    Err(err) => {
                        let pending = &mut board.pending[index];
                        pending.status = PendingStatus::Failed;
                        pending.error = Some(err.clone());
                    }
                }
            }
        }

        if let Err(err) = &result {
            tracing::warn!(%event_id, client_id = %request.client_id, %err, "q&a send failed");
        }
        self.notify(event_id);
        result.map(|_| ())
    }

    // -- live deltas --------------------------------------------------------

    /// Insert an echoed or broadcast message. Duplicates are ignored.
    pub fn on_insert(&self, mut message: Message) -> bool {
        let Some(key) = message.key().map(str::to_string) else {
            tracing::debug!("dropping q&a message without id");
            return false;
        };
        let event_id = message.event_id.clone();
        {
            let mut boards = self.boards.lock();
            let Some(board) = boards.get_mut(&event_id) else {
                return false;
            };
            let window = self.echo_window();
            message.observed_at.get_or_insert_with(Utc::now);
            let settled = board.reconcile(&message, &self.user_id, window);
            if board.position(&key).is_some() {
                tracing::debug!(%event_id, message_id = %key, "duplicate q&a message ignored");
                if !settled {
                    return false;
                }
            } else {
                board.messages.push(message);
                board.rederive();
            }
        }
        self.notify(&event_id);
        true
    }

    pub fn on_update(&self, patch: &MessagePatch) -> bool {
        let Some(key) = patch.key() else {
            return false;
        };
        self.mutate(&patch.event_id, key, |message| patch.apply_to(message))
    }

    pub fn on_delete(&self, target: &MessageRef) -> bool {
        let Some(key) = target.key() else {
            return false;
        };
        let removed = {
            let mut boards = self.boards.lock();
            let Some(board) = boards.get_mut(&target.event_id) else {
                return false;
            };
            match board.position(key) {
                Some(index) => {
                    board.messages.remove(index);
                    board.rederive();
                    true
                }
                None => {
                    tracing::debug!(
                        event_id = %target.event_id,
                        message_id = %key,
                        "delete for unknown message"
                    );
                    false
                }
            }
        };
        if removed {
            self.notify(&target.event_id);
        }
        removed
    }

    pub fn on_reaction(&self, change: &ReactionChange) -> bool {
        let Some(key) = change.key() else {
            return false;
        };
        self.mutate(&change.event_id, key, |message| change.apply_to(message))
    }

    pub fn on_read(&self, receipt: &ReadReceipt) -> bool {
        if receipt.user_id.is_empty() {
            return false;
        }
        let changed = {
            let mut boards = self.boards.lock();
            let Some(board) = boards.get_mut(&receipt.event_id) else {
                return false;
            };
            let mut changed = false;
            for key in receipt.message_keys() {
                if let Some(message) = board.find_mut(key) {
                    changed |= message.read_by.insert(receipt.user_id.clone());
                }
            }
            if changed {
                board.rederive();
            }
            changed
        };
        if changed {
            self.notify(&receipt.event_id);
        }
        changed
    }

    pub fn on_pin(&self, target: &MessageRef) -> bool {
        let Some(key) = target.key() else {
            return false;
        };
        let pinned = target.pinned.unwrap_or(true);
        self.mutate(&target.event_id, key, |message| {
            let changed = message.pinned != pinned;
            message.pinned = pinned;
            changed
        })
    }

    /// Apply `f` to the message `key` on board `event_id`; no-op when either is unknown.
    fn mutate(&self, event_id: &str, key: &str, f: impl FnOnce(&mut Message) -> bool) -> bool {
        let changed = {
            let mut boards = self.boards.lock();
            let Some(board) = boards.get_mut(event_id) else {
                return false;
            };
            let Some(message) = board.find_mut(key) else {
                tracing::debug!(%event_id, message_id = %key, "delta for unknown message");
                return false;
            };
            let changed = f(message);
            if changed {
                board.rederive();
            }
            changed
        };
        if changed {
            self.notify(event_id);
        }
        changed
    }

    // -- readers ------------------------------------------------------------

    pub fn thread_view(&self, event_id: &str) -> Option<ThreadView> {
        self.boards.lock().get(event_id).map(|b| b.view.clone())
    }

    /// Confirmed messages in thread order.
    pub fn messages(&self, event_id: &str) -> Vec<Message> {
        let mut messages = self
            .boards
            .lock()
            .get(event_id)
            .map(|b| b.messages.clone())
            .unwrap_or_default();
        messages.sort_by(Message::thread_order);
        messages
    }

    pub fn pending(&self, event_id: &str) -> Vec<PendingMessage> {
        self.boards
            .lock()
            .get(event_id)
            .map(|b| b.pending.clone())
            .unwrap_or_default()
    }

    pub fn pinned(&self, event_id: &str) -> Vec<Message> {
        let mut pinned: Vec<Message> = self
            .messages(event_id)
            .into_iter()
            .filter(|m| m.pinned)
            .collect();
        pinned.sort_by(Message::thread_order);
        pinned
    }

    /// Display label for a sender on `event_id`'s board.
    pub fn display_name(&self, event_id: &str, user_id: &str) -> String {
        match self.boards.lock().get(event_id) {
            Some(board) => board.roster.display_name(user_id),
            None => placeholder_name(user_id),
        }
    }

    fn echo_window(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.echo_match_window)
            .unwrap_or_else(|_| chrono::Duration::seconds(30))
    }

    fn notify(&self, event_id: &str) {
        // No receivers is fine.
        let _ = self.changes.send(event_id.to_string());
    }
}

fn parse<T: DeserializeOwned>(push: &PushEvent) -> Option<T> {
    match serde_json::from_value(push.data.clone()) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::debug!(kind = push.kind.tag(), %err, "dropping malformed q&a push");
            None
        }
    }
}

impl PushHandler for ThreadModel {
    fn handle_push(&self, push: &PushEvent) {
        match push.kind {
            PushKind::QnaMessage => {
                if let Some(message) = parse::<Message>(push) {
                    self.on_insert(message);
                }
            }
            PushKind::QnaUpdate => {
                if let Some(patch) = parse::<MessagePatch>(push) {
                    self.on_update(&patch);
                }
            }
            PushKind::QnaDelete => {
                if let Some(target) = parse::<MessageRef>(push) {
                    self.on_delete(&target);
                }
            }
            PushKind::QnaReaction => {
                if let Some(change) = parse::<ReactionChange>(push) {
                    self.on_reaction(&change);
                }
            }
            PushKind::QnaRead => {
                if let Some(receipt) = parse::<ReadReceipt>(push) {
                    self.on_read(&receipt);
                }
            }
            PushKind::QnaPin => {
                if let Some(target) = parse::<MessageRef>(push) {
                    self.on_pin(&target);
                }
            }
            _ => {}
        }
    }
}
