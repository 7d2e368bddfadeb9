//! In-process event bus routing inbound wire messages by their `type` tag.
//!
//! The bus decouples the transport from business logic: the link dispatches
//! every parsed [`WireMessage`] here, and interested subsystems subscribe per
//! tag. Handlers for one tag run in subscription order; a failing handler is
//! logged and does not stop the remaining ones. No ordering is guaranteed
//! across distinct tags.

use crate::wire::WireMessage;
use async_trait::async_trait;
use dashmap::DashMap;
use log::warn;
use std::sync::Arc;

/// A subscriber for one or more wire message tags.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &WireMessage) -> Result<(), anyhow::Error>;
}

/// Tag-keyed registry of message handlers.
#[derive(Default)]
pub struct EventBus {
    handlers: DashMap<String, Vec<Arc<dyn MessageHandler>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `tag`. Registering the same handler instance
    /// twice for the same tag is a no-op, so a handler never runs twice per
    /// dispatch.
    pub fn subscribe(&self, tag: &str, handler: Arc<dyn MessageHandler>) {
        let mut entry = self.handlers.entry(tag.to_string()).or_default();
        if entry.iter().any(|h| Arc::ptr_eq(h, &handler)) {
            return;
        }
        entry.push(handler);
    }

    /// Removes `handler` from `tag`. Unsubscribing a handler that is not
    /// registered is a no-op.
    pub fn unsubscribe(&self, tag: &str, handler: &Arc<dyn MessageHandler>) {
        if let Some(mut entry) = self.handlers.get_mut(tag) {
            entry.retain(|h| !Arc::ptr_eq(h, handler));
        }
    }

    /// Invokes every handler registered for the message's tag, in
    /// subscription order, isolating per-handler failures.
    pub async fn dispatch(&self, message: &WireMessage) {
        let snapshot: Vec<Arc<dyn MessageHandler>> = match self.handlers.get(message.tag()) {
            Some(entry) => entry.clone(),
            None => return,
        };
        for handler in snapshot {
            if let Err(e) = handler.handle(message).await {
                warn!(target: "Bus", "Handler for '{}' failed: {e:#}", message.tag());
            }
        }
    }

    /// Number of handlers currently registered for `tag`.
    pub fn handler_count(&self, tag: &str) -> usize {
        self.handlers.get(tag).map(|e| e.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct RecordingHandler {
        label: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
        calls: AtomicUsize,
        fail: bool,
    }

    impl RecordingHandler {
        fn new(label: &'static str, log: Arc<Mutex<Vec<&'static str>>>, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                label,
                log,
                calls: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl MessageHandler for RecordingHandler {
        async fn handle(&self, _message: &WireMessage) -> Result<(), anyhow::Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.log.lock().unwrap().push(self.label);
            if self.fail {
                anyhow::bail!("handler exploded");
            }
            Ok(())
        }
    }

    fn ping() -> WireMessage {
        WireMessage::Ping
    }

    #[tokio::test]
    async fn test_dispatch_in_subscription_order() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = RecordingHandler::new("a", log.clone(), false);
        let b = RecordingHandler::new("b", log.clone(), false);
        let c = RecordingHandler::new("c", log.clone(), false);
        bus.subscribe("ping", a);
        bus.subscribe("ping", b);
        bus.subscribe("ping", c);

        bus.dispatch(&ping()).await;
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_duplicate_subscription_is_deduplicated() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = RecordingHandler::new("a", log.clone(), false);
        bus.subscribe("ping", a.clone());
        bus.subscribe("ping", a.clone());
        assert_eq!(bus.handler_count("ping"), 1);

        bus.dispatch(&ping()).await;
        assert_eq!(a.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_block_later_ones() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let boom = RecordingHandler::new("boom", log.clone(), true);
        let after = RecordingHandler::new("after", log.clone(), false);
        bus.subscribe("ping", boom);
        bus.subscribe("ping", after.clone());

        bus.dispatch(&ping()).await;
        assert_eq!(*log.lock().unwrap(), vec!["boom", "after"]);
        assert_eq!(after.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_missing_handler_is_noop() {
        let bus = EventBus::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let a = RecordingHandler::new("a", log.clone(), false);
        let stranger = RecordingHandler::new("s", log, false);
        bus.subscribe("ping", a.clone());

        let stranger_dyn: Arc<dyn MessageHandler> = stranger;
        bus.unsubscribe("ping", &stranger_dyn);
        bus.unsubscribe("pong", &stranger_dyn);
        assert_eq!(bus.handler_count("ping"), 1);

        let a_dyn: Arc<dyn MessageHandler> = a;
        bus.unsubscribe("ping", &a_dyn);
        assert_eq!(bus.handler_count("ping"), 0);
    }

    #[tokio::test]
    async fn test_dispatch_without_subscribers_is_noop() {
        let bus = EventBus::new();
        bus.dispatch(&ping()).await;
    }
}
