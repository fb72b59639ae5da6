//! Live connection lifecycle: identify handshake, reconnect with backoff, teardown.
//!
//! State machine:
//!
//! ```text
//! Idle → Connecting → Connected ⇄ Disconnected → Idle (teardown)
//!            └──────────→ Disconnected (handshake failure, retried)
//! ```
//!
//! [`ConnectionManager`] is the only owner allowed to open or close the
//! transport. Everything else gets a [`ConnectionHandle`]: it can read the
//! state, send frames while connected, and attach or detach push handlers.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use hackhub_common::id::{prefix, prefixed_ulid};
use parking_lot::Mutex;
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::config::Config;
use crate::error::ClientError;
use crate::session::Session;

use super::events::{
    ClientFrame, PushEvent, PushKind, ServerFrame, CLOSE_AUTH_FAILED, CLOSE_NOT_AUTHENTICATED,
    EVENT_READY,
};
use super::router::{EventRouter, PushHandler};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
}

/// Why a handshake did not produce an open connection.
#[derive(Debug, thiserror::Error)]
enum HandshakeError {
    /// The server refused the token. Not retried until the next `connect`.
    #[error("rejected: {0}")]
    Rejected(String),
    #[error("timed out waiting for ready")]
    Timeout,
    #[error("transport: {0}")]
    Transport(String),
}

/// How an established connection ended.
enum SessionEnd {
    Shutdown,
    Closed(String),
}

/// State shared between the manager, its handles, and the supervisor task.
struct Shared {
    state: watch::Sender<ConnectionState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<ClientFrame>>>,
}

impl Shared {
    fn set_state(&self, next: ConnectionState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

/// Read-and-subscribe view of the live connection, handed to every consumer.
#[derive(Clone)]
pub struct ConnectionHandle {
    shared: Arc<Shared>,
    router: Arc<EventRouter>,
}

impl ConnectionHandle {
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Receiver that wakes on every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Queue a frame for the open connection.
    ///
    /// Fails with a retryable `NOT_CONNECTED` error instead of buffering.
    pub fn send(&self, frame: ClientFrame) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::not_connected());
        }
        let outbound = self.shared.outbound.lock();
        match outbound.as_ref() {
            Some(tx) => tx.send(frame).map_err(|_| ClientError::not_connected()),
            None => Err(ClientError::not_connected()),
        }
    }

    /// Attach a push handler under `key` (see [`EventRouter::subscribe`]).
    pub fn subscribe(&self, key: &str, kinds: &[PushKind], handler: Arc<dyn PushHandler>) -> bool {
        self.router.subscribe(key, kinds, handler)
    }

    pub fn unsubscribe(&self, key: &str) -> bool {
        self.router.unsubscribe(key)
    }

    /// A handle that reports `Connected` and captures outbound frames, for unit tests.
    #[cfg(test)]
    pub(crate) fn connected_for_tests() -> (Self, mpsc::UnboundedReceiver<ClientFrame>) {
        let (state, _) = watch::channel(ConnectionState::Connected);
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self {
            shared: Arc::new(Shared {
                state,
                outbound: Mutex::new(Some(tx)),
            }),
            router: Arc::new(EventRouter::new()),
        };
        (handle, rx)
    }

    /// Force a state transition on a test handle.
    #[cfg(test)]
    pub(crate) fn set_state_for_tests(&self, state: ConnectionState) {
        self.shared.set_state(state);
    }
}

struct Supervisor {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

/// Owner of the single live connection for one session.
pub struct ConnectionManager {
    config: Arc<Config>,
    shared: Arc<Shared>,
    router: Arc<EventRouter>,
    supervisor: Mutex<Option<Supervisor>>,
}

impl ConnectionManager {
    pub fn new(config: Arc<Config>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            config,
            shared: Arc::new(Shared {
                state,
                outbound: Mutex::new(None),
            }),
            router: Arc::new(EventRouter::new()),
            supervisor: Mutex::new(None),
        }
    }

    pub fn handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            shared: self.shared.clone(),
            router: self.router.clone(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Open the live connection for `session`, replacing any previous one.
    ///
    /// Never fails: a session without a token leaves the manager `Disconnected`,
    /// and handshake or transport problems are retried in the background.
    pub async fn connect(&self, session: &Session) {
        self.stop_supervisor().await;

        let Some(token) = session.token() else {
            tracing::warn!(
                user_id = %session.user_id,
                "session has no token; live connection not opened"
            );
            self.shared.set_state(ConnectionState::Disconnected);
            return;
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (push_tx, push_rx) = mpsc::unbounded_channel();

        let dispatcher = tokio::spawn(self.router.clone().run(push_rx));
        let task = tokio::spawn(supervise(
            self.config.clone(),
            self.shared.clone(),
            token.to_string(),
            push_tx,
            shutdown_rx,
        ));

        *self.supervisor.lock() = Some(Supervisor {
            shutdown: shutdown_tx,
            task,
            dispatcher,
        });
    }

    /// Close the transport, stop reconnecting, and detach every push handler.
    pub async fn disconnect(&self) {
        self.stop_supervisor().await;
        self.router.clear();
        self.shared.set_state(ConnectionState::Idle);
        tracing::info!("live connection torn down");
    }

    async fn stop_supervisor(&self) {
        let Some(supervisor) = self.supervisor.lock().take() else {
            return;
        };
        let _ = supervisor.shutdown.send(true);
        if let Err(err) = supervisor.task.await {
            tracing::warn!(?err, "connection task ended abnormally");
        }
        // The push sender lives in the supervisor task, so the dispatcher
        // drains whatever is queued and stops on its own.
        let _ = supervisor.dispatcher.await;
        self.shared.outbound.lock().take();
    }
}

/// Delay before reconnect attempt `attempt` (0-based): exponential, capped, ±20% jitter.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let exp = base.saturating_mul(2u32.saturating_pow(attempt.min(16)));
    let capped = exp.min(max);
    let jitter = rand::thread_rng().gen_range(0.8..=1.2);
    capped.mul_f64(jitter).min(max).max(Duration::from_millis(1))
}

async fn supervise(
    config: Arc<Config>,
    shared: Arc<Shared>,
    token: String,
    push_tx: mpsc::UnboundedSender<PushEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempt: u32 = 0;

    loop {
        let connection_id = prefixed_ulid(prefix::CONNECTION);
        shared.set_state(ConnectionState::Connecting);

        let outcome = tokio::select! {
            result = handshake(&config, &token) => result,
            _ = shutdown.changed() => break,
        };

        match outcome {
            Ok(ws) => {
                attempt = 0;
                let (out_tx, out_rx) = mpsc::unbounded_channel();
                // Outbound must be in place before anyone can observe `Connected`.
                *shared.outbound.lock() = Some(out_tx);
                shared.set_state(ConnectionState::Connected);
                tracing::info!(%connection_id, "live connection established");

                let end = run_connection(ws, &config, &push_tx, out_rx, &mut shutdown).await;

                shared.outbound.lock().take();
                shared.set_state(ConnectionState::Disconnected);
                match end {
                    SessionEnd::Shutdown => {
                        tracing::info!(%connection_id, "live connection closed by client");
                        break;
                    }
                    SessionEnd::Closed(reason) => {
                        tracing::warn!(%connection_id, %reason, "live connection lost");
                    }
                }
            }
            Err(HandshakeError::Rejected(reason)) => {
                tracing::warn!(%connection_id, %reason, "live handshake rejected; not retrying");
                shared.set_state(ConnectionState::Disconnected);
                return;
            }
            Err(err) => {
                tracing::warn!(%connection_id, %err, attempt, "live handshake failed");
                shared.set_state(ConnectionState::Disconnected);
            }
        }

        let delay = backoff_delay(attempt, config.reconnect_base, config.reconnect_max);
        attempt = attempt.saturating_add(1);
        tracing::debug!(delay_ms = delay.as_millis() as u64, attempt, "reconnect scheduled");

        tokio::select! {
            _ = time::sleep(delay) => {}
            _ = shutdown.changed() => break,
        }
    }
}

/// Connect, send `identify`, and wait for `ready` within the handshake timeout.
async fn handshake(config: &Config, token: &str) -> Result<WsStream, HandshakeError> {
    let (mut ws, _) = tokio_tungstenite::connect_async(config.live_url.as_str())
        .await
        .map_err(|err| match err {
            tungstenite::Error::Http(resp) if matches!(resp.status().as_u16(), 401 | 403) => {
                HandshakeError::Rejected(format!("upgrade refused with {}", resp.status()))
            }
            other => HandshakeError::Transport(other.to_string()),
        })?;

    ws.send(Message::Text(ClientFrame::identify(token).to_json().into()))
        .await
        .map_err(|e| HandshakeError::Transport(e.to_string()))?;

    let wait_ready = async {
        while let Some(msg) = ws.next().await {
            let msg = msg.map_err(|e| HandshakeError::Transport(e.to_string()))?;
            match msg {
                Message::Text(text) => match ServerFrame::parse(text.as_str()) {
                    Some(frame) if frame.event == EVENT_READY => return Ok(()),
                    // Pushes cannot be scoped before ready; drop them.
                    _ => continue,
                },
                Message::Close(Some(frame)) => {
                    let code = u16::from(frame.code);
                    if code == CLOSE_AUTH_FAILED || code == CLOSE_NOT_AUTHENTICATED {
                        return Err(HandshakeError::Rejected(frame.reason.as_str().to_string()));
                    }
                    return Err(HandshakeError::Transport(format!("closed with {code}")));
                }
                Message::Close(None) => {
                    return Err(HandshakeError::Transport("closed before ready".to_string()))
                }
                _ => continue,
            }
        }
        Err(HandshakeError::Transport("stream ended before ready".to_string()))
    };

    let ready = time::timeout(config.handshake_timeout, wait_ready).await;
    match ready {
        Ok(Ok(())) => Ok(ws),
        Ok(Err(err)) => Err(err),
        Err(_) => {
            let _ = ws.close(None).await;
            Err(HandshakeError::Timeout)
        }
    }
}

/// Main connection loop: forward pushes, flush outbound frames, keep the link alive.
async fn run_connection(
    ws: WsStream,
    config: &Config,
    push_tx: &mpsc::UnboundedSender<PushEvent>,
    mut out_rx: mpsc::UnboundedReceiver<ClientFrame>,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let mut heartbeat = time::interval(config.heartbeat_interval);
    heartbeat.tick().await; // First tick fires immediately; skip it.

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let Some(frame) = ServerFrame::parse(text.as_str()) else {
                            tracing::debug!("dropping malformed live frame");
                            continue;
                        };
                        let event = frame.event.clone();
                        match frame.into_push() {
                            Some(push) => {
                                if push_tx.send(push).is_err() {
                                    return SessionEnd::Shutdown;
                                }
                            }
                            None => tracing::debug!(%event, "ignoring unrouted live event"),
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| format!("{} {}", u16::from(f.code), f.reason.as_str()))
                            .unwrap_or_else(|| "server closed".to_string());
                        return SessionEnd::Closed(reason);
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return SessionEnd::Closed(e.to_string()),
                    None => return SessionEnd::Closed("stream ended".to_string()),
                }
            }

            frame = out_rx.recv() => {
                let Some(frame) = frame else {
                    return SessionEnd::Closed("outbound queue closed".to_string());
                };
                if let Err(e) = ws_tx.send(Message::Text(frame.to_json().into())).await {
                    return SessionEnd::Closed(e.to_string());
                }
            }

            _ = heartbeat.tick() => {
                if let Err(e) = ws_tx.send(Message::Ping(Vec::new().into())).await {
                    return SessionEnd::Closed(e.to_string());
                }
            }

            _ = shutdown.changed() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                return SessionEnd::Shutdown;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let base = Duration::from_millis(100);
        let max = Duration::from_secs(5);

        let first = backoff_delay(0, base, max);
        assert!(first >= Duration::from_millis(80) && first <= Duration::from_millis(120));

        let fourth = backoff_delay(3, base, max);
        assert!(fourth >= Duration::from_millis(640) && fourth <= Duration::from_millis(960));

        for attempt in [10, 20, 1000] {
            assert!(backoff_delay(attempt, base, max) <= max);
        }
    }

    #[test]
    fn backoff_never_zero() {
        assert!(backoff_delay(0, Duration::ZERO, Duration::from_secs(1)) > Duration::ZERO);
    }

    #[tokio::test]
    async fn connect_without_token_stays_disconnected() {
        let config = Config::new("http://127.0.0.1:9", "ws://127.0.0.1:9");
        let manager = ConnectionManager::new(Arc::new(config));
        manager.connect(&Session::without_token("u1")).await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);

        let err = manager.handle().send(ClientFrame::identify("x")).unwrap_err();
        assert!(err.is_not_connected());
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn disconnect_returns_to_idle_and_detaches_handlers() {
        struct Noop;
        impl PushHandler for Noop {
            fn handle_push(&self, _push: &PushEvent) {}
        }

        let config = Config::new("http://127.0.0.1:9", "ws://127.0.0.1:9");
        let manager = ConnectionManager::new(Arc::new(config));
        manager.handle().subscribe("noop", &PushKind::ALL, Arc::new(Noop));
        manager.disconnect().await;
        assert_eq!(manager.state(), ConnectionState::Idle);
        assert_eq!(manager.router.handler_count(), 0);
    }
}
