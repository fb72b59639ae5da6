use std::path::Path;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use live_client::api::http::HttpBackend;
use live_client::config::Config;
use live_client::session::Session;
use live_client::LiveCore;

#[tokio::main]
async fn main() {
    // Load .env file (silently skip if missing; env vars may be set externally)
    if dotenvy::dotenv().is_err() {
        let env_path = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
        let _ = dotenvy::from_path(env_path);
    }

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(Config::from_env());
    let user_id = std::env::var("USER_ID").expect("USER_ID env var is required");
    let session = match std::env::var("AUTH_TOKEN") {
        Ok(token) => Session::new(user_id, token),
        Err(_) => Session::without_token(user_id),
    };
    let watch_event = std::env::var("WATCH_EVENT_ID").ok().filter(|id| !id.is_empty());

    let token = session.token().unwrap_or_default();
    let backend = Arc::new(HttpBackend::new(&config.api_url, token));
    tracing::info!(
        api_url = %config.api_url,
        live_url = %config.live_url,
        "live-client configured"
    );

    let core = LiveCore::new(config.clone(), session, backend);
    core.start().await;

    if let Some(event_id) = &watch_event {
        if let Err(err) = core.threads().load_history(event_id).await {
            tracing::warn!(%event_id, %err, "initial q&a history load failed");
        }
    }

    let mut unread = core.notifications().subscribe_unread();
    let mut changes = core.threads().subscribe_changes();
    tracing::info!(unread = core.notifications().unread_count(), "live core ready");

    loop {
        tokio::select! {
            changed = unread.changed() => {
                if changed.is_err() {
                    break;
                }
                let count = *unread.borrow_and_update();
                tracing::info!(unread = count, "unread notifications");
            }
            changed = changes.recv() => {
                let event_id = match changed {
                    Ok(event_id) => event_id,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "board change notifications lagged");
                        continue;
                    }
                    Err(RecvError::Closed) => break,
                };
                if watch_event.as_deref() != Some(event_id.as_str()) {
                    continue;
                }
                let Some(view) = core.threads().thread_view(&event_id) else {
                    continue;
                };
                for thread in &view.threads {
                    let asker = core.threads().display_name(&event_id, &thread.question.sender_id);
                    tracing::info!(
                        %event_id,
                        %asker,
                        answers = thread.answers.len(),
                        "Q: {}",
                        thread.question.text
                    );
                }
                let pending = core.threads().pending(&event_id).len();
                tracing::info!(%event_id, threads = view.len(), pending, "q&a board updated");
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown requested");
                break;
            }
        }
    }

    core.stop().await;
}
