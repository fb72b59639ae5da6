pub mod activity;
pub mod api;
pub mod config;
pub mod error;
pub mod gateway;
pub mod models;
pub mod notifications;
pub mod session;
pub mod threads;

use std::sync::Arc;

use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use activity::ActivityFeed;
use api::{AnnouncementService, Backend, ChatService, EventMembership, ParticipantRoster};
use config::Config;
use gateway::connection::{ConnectionHandle, ConnectionManager, ConnectionState};
use gateway::events::PushKind;
use gateway::rooms::RoomSubscriptions;
use notifications::NotificationCenter;
use session::Session;
use threads::ThreadModel;

/// Router keys of the core's push handlers. Re-attaching a key replaces it.
pub const HANDLER_NOTIFICATIONS: &str = "notifications";
pub const HANDLER_QNA: &str = "qna";
pub const HANDLER_ACTIVITY: &str = "activity";

/// The consumers that hold derived state. Cheap to clone into watcher tasks.
#[derive(Clone)]
struct Components {
    rooms: Arc<RoomSubscriptions>,
    notifications: Arc<NotificationCenter>,
    threads: Arc<ThreadModel>,
    activity: Arc<ActivityFeed>,
}

impl Components {
    /// Refresh membership and rooms, then reload the backlog and every open board.
    async fn resync(&self) {
        let event_ids: Vec<String> = self.rooms.refresh().await.into_iter().collect();
        self.activity.set_scope(event_ids.iter().cloned());

        let open = self.threads.open_events();
        let boards = open.len();
        let reloads: Vec<_> = open
            .into_iter()
            .map(|event_id| async move {
                if let Err(err) = self.threads.load_history(&event_id).await {
                    tracing::warn!(%event_id, %err, "q&a history reload failed");
                }
            })
            .collect();
        tokio::join!(self.notifications.load_backlog(&event_ids), join_all(reloads));
        tracing::debug!(events = event_ids.len(), boards, "live state resynced");
    }

    fn reset(&self) {
        self.rooms.reset();
        self.notifications.reset();
        self.threads.close_all();
        self.activity.reset();
    }
}

/// Real-time core for one authenticated session.
///
/// Owns the live connection and every component fed by it. UI code reads
/// derived state through the accessors and acts through the components.
pub struct LiveCore {
    session: Session,
    connection: ConnectionManager,
    parts: Components,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LiveCore {
    pub fn new<B>(config: Arc<Config>, session: Session, backend: Arc<B>) -> Self
    where
        B: Backend + 'static,
    {
        let connection = ConnectionManager::new(config.clone());
        let handle = connection.handle();

        let membership: Arc<dyn EventMembership> = backend.clone();
        let announcements: Arc<dyn AnnouncementService> = backend.clone();
        let chat: Arc<dyn ChatService> = backend.clone();
        let roster: Arc<dyn ParticipantRoster> = backend;

        let parts = Components {
            rooms: Arc::new(RoomSubscriptions::new(&session.user_id, handle.clone(), membership)),
            notifications: Arc::new(NotificationCenter::new(&session.user_id, announcements)),
            threads: Arc::new(ThreadModel::new(&session.user_id, config, chat, roster, handle)),
            activity: Arc::new(ActivityFeed::new()),
        };

        Self {
            session,
            connection,
            parts,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Attach handlers, open the live connection and load initial state.
    ///
    /// Safe to call again after [`stop`](Self::stop).
    pub async fn start(&self) {
        let handle = self.connection.handle();
        handle.subscribe(
            HANDLER_NOTIFICATIONS,
            &PushKind::ANNOUNCEMENTS,
            self.parts.notifications.clone(),
        );
        handle.subscribe(HANDLER_QNA, &PushKind::QNA, self.parts.threads.clone());
        handle.subscribe(HANDLER_ACTIVITY, &PushKind::ACTIVITY, self.parts.activity.clone());

        let watchers = vec![self.parts.rooms.spawn_sync(), self.spawn_resync_watcher()];
        let previous = std::mem::replace(&mut *self.tasks.lock(), watchers);
        for task in previous {
            task.abort();
        }

        tracing::info!(user_id = %self.session.user_id, "live core starting");
        self.connection.connect(&self.session).await;
        self.parts.resync().await;
    }

    /// Tear down the connection and forget all derived state.
    pub async fn stop(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task.abort();
        }
        self.connection.disconnect().await;
        self.parts.reset();
        tracing::info!(user_id = %self.session.user_id, "live core stopped");
    }

    /// Reload everything that may have been missed while the connection was down.
    pub async fn resync(&self) {
        self.parts.resync().await;
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn connection(&self) -> ConnectionHandle {
        self.connection.handle()
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn rooms(&self) -> &Arc<RoomSubscriptions> {
        &self.parts.rooms
    }

    pub fn notifications(&self) -> &Arc<NotificationCenter> {
        &self.parts.notifications
    }

    pub fn threads(&self) -> &Arc<ThreadModel> {
        &self.parts.threads
    }

    pub fn activity(&self) -> &Arc<ActivityFeed> {
        &self.parts.activity
    }

    /// Resync on every `Connected` after the first one.
    fn spawn_resync_watcher(&self) -> JoinHandle<()> {
        let parts = self.parts.clone();
        let mut state_rx = self.connection.handle().watch_state();
        tokio::spawn(async move {
            let mut connected_before = false;
            while state_rx.changed().await.is_ok() {
                let state = *state_rx.borrow_and_update();
                if state != ConnectionState::Connected {
                    continue;
                }
                if connected_before {
                    tracing::info!("live connection restored; resyncing");
                    parts.resync().await;
                }
                connected_before = true;
            }
        })
    }
}
