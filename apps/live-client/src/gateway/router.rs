//! Dispatch hub fanning inbound pushes out to registered consumers.
//!
//! The connection task feeds a single `mpsc` queue; one dispatcher task drains
//! it in order and calls every handler that declared interest in the push's
//! kind. Handlers are keyed, so re-registering a consumer replaces its previous
//! registration instead of doubling delivery.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use super::events::{PushEvent, PushKind};

/// A consumer of live pushes. Must not block; parse failures are the handler's to swallow.
pub trait PushHandler: Send + Sync {
    fn handle_push(&self, push: &PushEvent);
}

struct Registration {
    kinds: HashSet<PushKind>,
    handler: Arc<dyn PushHandler>,
}

/// Keyed registry of push handlers.
#[derive(Default)]
pub struct EventRouter {
    handlers: DashMap<String, Registration>,
}

impl EventRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `handler` under `key` for the given kinds.
    ///
    /// Returns true if an existing registration under `key` was replaced.
    pub fn subscribe(&self, key: &str, kinds: &[PushKind], handler: Arc<dyn PushHandler>) -> bool {
        let registration = Registration {
            kinds: kinds.iter().copied().collect(),
            handler,
        };
        let replaced = self.handlers.insert(key.to_string(), registration).is_some();
        tracing::debug!(%key, kinds = kinds.len(), replaced, "push handler attached");
        replaced
    }

    pub fn unsubscribe(&self, key: &str) -> bool {
        self.handlers.remove(key).is_some()
    }

    /// Detach every handler (connection teardown).
    pub fn clear(&self) {
        self.handlers.clear();
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Deliver one push to every interested handler. Returns how many received it.
    pub fn dispatch(&self, push: &PushEvent) -> usize {
        // Collect first so no map shard is locked while handlers run.
        let targets: Vec<Arc<dyn PushHandler>> = self
            .handlers
            .iter()
            .filter(|entry| entry.kinds.contains(&push.kind))
            .map(|entry| entry.handler.clone())
            .collect();

        if targets.is_empty() {
            tracing::trace!(kind = push.kind.tag(), "no handler for push");
        }
        for handler in &targets {
            handler.handle_push(push);
        }
        targets.len()
    }

    /// Drain `rx` in order until every sender is gone.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<PushEvent>) {
        while let Some(push) = rx.recv().await {
            self.dispatch(&push);
        }
        tracing::debug!("push dispatcher stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<PushKind>>,
    }

    impl PushHandler for Recorder {
        fn handle_push(&self, push: &PushEvent) {
            self.seen.lock().push(push.kind);
        }
    }

    fn push(kind: PushKind) -> PushEvent {
        PushEvent::new(kind, serde_json::json!({ "eventId": "ev1" }))
    }

    #[test]
    fn routes_only_declared_kinds() {
        let router = EventRouter::new();
        let qna = Arc::new(Recorder::default());
        let inbox = Arc::new(Recorder::default());
        router.subscribe("qna", &PushKind::QNA, qna.clone());
        router.subscribe("notifications", &PushKind::ANNOUNCEMENTS, inbox.clone());

        assert_eq!(router.dispatch(&push(PushKind::QnaMessage)), 1);
        assert_eq!(router.dispatch(&push(PushKind::Notification)), 1);
        assert_eq!(router.dispatch(&push(PushKind::LeaderboardUpdate)), 0);

        assert_eq!(*qna.seen.lock(), vec![PushKind::QnaMessage]);
        assert_eq!(*inbox.seen.lock(), vec![PushKind::Notification]);
    }

    #[test]
    fn resubscribing_a_key_does_not_duplicate_delivery() {
        let router = EventRouter::new();
        let recorder = Arc::new(Recorder::default());
        assert!(!router.subscribe("qna", &PushKind::QNA, recorder.clone()));
        assert!(router.subscribe("qna", &PushKind::QNA, recorder.clone()));

        router.dispatch(&push(PushKind::QnaPin));
        assert_eq!(recorder.seen.lock().len(), 1);
    }

    #[test]
    fn clear_detaches_everything() {
        let router = EventRouter::new();
        let recorder = Arc::new(Recorder::default());
        router.subscribe("a", &PushKind::ALL, recorder.clone());
        router.clear();
        assert_eq!(router.handler_count(), 0);
        assert_eq!(router.dispatch(&push(PushKind::TeamUpdate)), 0);
        assert!(recorder.seen.lock().is_empty());
    }

    #[tokio::test]
    async fn dispatcher_preserves_queue_order() {
        let router = Arc::new(EventRouter::new());
        let recorder = Arc::new(Recorder::default());
        router.subscribe("all", &PushKind::ALL, recorder.clone());

        let (tx, rx) = mpsc::unbounded_channel();
        let order = [PushKind::QnaMessage, PushKind::QnaUpdate, PushKind::QnaDelete];
        for kind in order {
            tx.send(push(kind)).unwrap();
        }
        drop(tx);
        router.clone().run(rx).await;

        assert_eq!(*recorder.seen.lock(), order.to_vec());
    }
}
