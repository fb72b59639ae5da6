#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::time;

use live_client::config::Config;
use live_client::session::Session;

pub const USER_ID: &str = "u1";
pub const TOKEN: &str = "tok_valid";

/// Everything the mock platform knows and everything it has seen.
pub struct Inner {
    pub user_events: Mutex<Value>,
    pub announcements: Mutex<HashMap<String, Vec<Value>>>,
    pub messages: Mutex<HashMap<String, Vec<Value>>>,
    /// Raw participant bodies, returned verbatim.
    pub participants: Mutex<HashMap<String, Value>>,
    pub read_calls: Mutex<Vec<String>>,
    pub sent: Mutex<Vec<Value>>,
    /// Client frames after identify, tagged with the connection number.
    pub frames: Mutex<Vec<(usize, Value)>>,
    pub identifies: AtomicUsize,
    pub rejections: AtomicUsize,
    pub locked_attempts: AtomicUsize,
    pub echo_sends: AtomicBool,
    next_id: AtomicU64,
    pushes: broadcast::Sender<String>,
    kick: broadcast::Sender<()>,
}

#[derive(Clone)]
pub struct MockState(pub Arc<Inner>);

impl std::ops::Deref for MockState {
    type Target = Inner;

    fn deref(&self) -> &Inner {
        &self.0
    }
}

impl MockState {
    fn new() -> Self {
        let (pushes, _) = broadcast::channel(256);
        let (kick, _) = broadcast::channel(4);
        Self(Arc::new(Inner {
            user_events: Mutex::new(json!({ "createdEventIds": [], "participatingEventIds": [] })),
            announcements: Mutex::new(HashMap::new()),
            messages: Mutex::new(HashMap::new()),
            participants: Mutex::new(HashMap::new()),
            read_calls: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            frames: Mutex::new(Vec::new()),
            identifies: AtomicUsize::new(0),
            rejections: AtomicUsize::new(0),
            locked_attempts: AtomicUsize::new(0),
            echo_sends: AtomicBool::new(true),
            next_id: AtomicU64::new(0),
            pushes,
            kick,
        }))
    }

    pub fn set_user_events(&self, created: &[&str], participating: &[&str]) {
        *self.user_events.lock() = json!({
            "createdEventIds": created,
            "participatingEventIds": participating,
        });
    }

    pub fn add_announcement(&self, event_id: &str, id: &str, read_by: &[&str]) {
        self.announcements
            .lock()
            .entry(event_id.to_string())
            .or_default()
            .push(json!({
                "_id": id,
                "title": format!("Announcement {id}"),
                "message": "Details inside",
                "eventId": event_id,
                "readBy": read_by,
                "createdAt": "2026-03-01T09:00:00Z",
            }));
    }

    pub fn add_message(&self, event_id: &str, message: Value) {
        self.messages
            .lock()
            .entry(event_id.to_string())
            .or_default()
            .push(message);
    }

    pub fn remove_announcement(&self, event_id: &str, id: &str) {
        if let Some(items) = self.announcements.lock().get_mut(event_id) {
            items.retain(|a| a["_id"] != id);
        }
    }

    pub fn remove_message(&self, event_id: &str, id: &str) {
        if let Some(items) = self.messages.lock().get_mut(event_id) {
            items.retain(|m| m["_id"] != id);
        }
    }

    pub fn set_participants(&self, event_id: &str, participants: Value) {
        self.participants.lock().insert(event_id.to_string(), participants);
    }

    /// Broadcast a push to every identified connection.
    pub fn push(&self, event: &str, data: Value) {
        self.push_raw(json!({ "event": event, "data": data }).to_string());
    }

    pub fn push_raw(&self, text: impl Into<String>) {
        let _ = self.pushes.send(text.into());
    }

    /// Close every live connection from the server side.
    pub fn kick_all(&self) {
        let _ = self.kick.send(());
    }

    pub fn identify_count(&self) -> usize {
        self.identifies.load(Ordering::SeqCst)
    }

    pub fn frames_named(&self, event: &str) -> Vec<(usize, Value)> {
        self.frames
            .lock()
            .iter()
            .filter(|(_, f)| f["event"] == event)
            .cloned()
            .collect()
    }

    /// Distinct `(roomType, roomId)` pairs joined on connection `conn`.
    pub fn rooms_joined_on(&self, conn: usize) -> BTreeSet<(String, String)> {
        self.frames_named("join_room")
            .into_iter()
            .filter(|(c, _)| *c == conn)
            .map(|(_, f)| {
                (
                    f["data"]["roomType"].as_str().unwrap_or_default().to_string(),
                    f["data"]["roomId"].as_str().unwrap_or_default().to_string(),
                )
            })
            .collect()
    }
}

pub struct MockPlatform {
    pub addr: SocketAddr,
    pub state: MockState,
}

impl MockPlatform {
    /// Client config pointed at this server, with fast reconnects.
    pub fn config(&self) -> Config {
        let mut config =
            Config::new(format!("http://{}", self.addr), format!("ws://{}/live", self.addr));
        config.reconnect_base = Duration::from_millis(20);
        config.reconnect_max = Duration::from_millis(200);
        config.handshake_timeout = Duration::from_secs(2);
        config
    }

    pub fn session(&self) -> Session {
        Session::new(USER_ID, TOKEN)
    }
}

/// Start the mock platform on an ephemeral port. The server runs in the background.
pub async fn start_mock_platform() -> MockPlatform {
    let state = MockState::new();
    let app = Router::new()
        .route("/api/users/me/events", get(user_events))
        .route("/api/events/{event_id}/announcements", get(announcements))
        .route("/api/announcements/{id}/read", post(mark_read))
        .route("/api/events/{event_id}/messages", get(list_messages).post(create_message))
        .route("/api/events/{event_id}/participants", get(participants))
        .route("/live", get(live))
        .route("/live-locked", get(live_locked))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    MockPlatform { addr, state }
}

/// Poll `condition` until it holds, panicking after five seconds.
pub async fn wait_for(what: &str, mut condition: impl FnMut() -> bool) {
    let polled = time::timeout(Duration::from_secs(5), async {
        while !condition() {
            time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    if polled.is_err() {
        panic!("timed out waiting for {what}");
    }
}

// ---------------------------------------------------------------------------
// REST handlers
// ---------------------------------------------------------------------------

fn authorized(headers: &HeaderMap) -> Result<(), Response> {
    let expected = format!("Bearer {TOKEN}");
    match headers.get("authorization").and_then(|v| v.to_str().ok()) {
        Some(value) if value == expected => Ok(()),
        _ => Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": { "code": "UNAUTHORIZED", "message": "Invalid token" } })),
        )
            .into_response()),
    }
}

async fn user_events(State(state): State<MockState>, headers: HeaderMap) -> Response {
    if let Err(resp) = authorized(&headers) {
        return resp;
    }
    Json(state.user_events.lock().clone()).into_response()
}

async fn announcements(
    State(state): State<MockState>,
    Path(event_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = authorized(&headers) {
        return resp;
    }
    let items = state.announcements.lock().get(&event_id).cloned().unwrap_or_default();
    Json(json!({ "data": items })).into_response()
}

async fn mark_read(
    State(state): State<MockState>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = authorized(&headers) {
        return resp;
    }
    state.read_calls.lock().push(id);
    StatusCode::NO_CONTENT.into_response()
}

#[derive(Deserialize)]
struct PageParams {
    page: Option<usize>,
    limit: Option<usize>,
}

async fn list_messages(
    State(state): State<MockState>,
    Path(event_id): Path<String>,
    Query(params): Query<PageParams>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = authorized(&headers) {
        return resp;
    }
    let page = params.page.unwrap_or(1).max(1);
    let limit = params.limit.unwrap_or(50);
    let all = state.messages.lock().get(&event_id).cloned().unwrap_or_default();
    let items: Vec<Value> = all.into_iter().skip((page - 1) * limit).take(limit).collect();
    Json(items).into_response()
}

async fn create_message(
    State(state): State<MockState>,
    Path(event_id): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(resp) = authorized(&headers) {
        return resp;
    }
    let n = state.next_id.fetch_add(1, Ordering::SeqCst) + 1;
    let message = json!({
        "id": format!("srv_{n}"),
        "eventId": event_id,
        "senderId": USER_ID,
        "text": body["text"],
        "messageType": body["messageType"],
        "parentMessageId": body.get("parentMessageId").cloned().unwrap_or(Value::Null),
        "clientId": body["clientId"],
        "createdAt": chrono::Utc::now(),
    });
    state.sent.lock().push(body);
    state.add_message(&event_id, message.clone());
    if state.echo_sends.load(Ordering::SeqCst) {
        state.push("qna_message", message.clone());
    }
    (StatusCode::CREATED, Json(message)).into_response()
}

async fn participants(
    State(state): State<MockState>,
    Path(event_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = authorized(&headers) {
        return resp;
    }
    let body = state.participants.lock().get(&event_id).cloned().unwrap_or_else(|| json!([]));
    Json(body).into_response()
}

// ---------------------------------------------------------------------------
// Live channel
// ---------------------------------------------------------------------------

async fn live(ws: WebSocketUpgrade, State(state): State<MockState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Refuses every upgrade, as a server does for an expired token.
async fn live_locked(State(state): State<MockState>) -> Response {
    state.locked_attempts.fetch_add(1, Ordering::SeqCst);
    StatusCode::UNAUTHORIZED.into_response()
}

async fn handle_socket(mut socket: WebSocket, state: MockState) {
    let identify = match time::timeout(Duration::from_secs(5), socket.recv()).await {
        Ok(Some(Ok(Message::Text(text)))) => {
            serde_json::from_str::<Value>(text.as_str()).unwrap_or_default()
        }
        _ => return,
    };
    if identify["event"] != "identify" || identify["data"]["token"] != TOKEN {
        state.rejections.fetch_add(1, Ordering::SeqCst);
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: 4004,
                reason: String::from("Authentication failed").into(),
            })))
            .await;
        return;
    }

    // Subscribe before ready so no push sent after ready is missed.
    let mut pushes = state.pushes.subscribe();
    let mut kick = state.kick.subscribe();
    let conn = state.identifies.fetch_add(1, Ordering::SeqCst) + 1;

    let ready = json!({ "event": "ready", "data": { "userId": USER_ID } }).to_string();
    if socket.send(Message::Text(ready.into())).await.is_err() {
        return;
    }

    loop {
        tokio::select! {
            msg = socket.recv() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(frame) = serde_json::from_str::<Value>(text.as_str()) {
                        state.frames.lock().push((conn, frame));
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
            push = pushes.recv() => match push {
                Ok(text) => {
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = kick.recv() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
        }
    }
}
