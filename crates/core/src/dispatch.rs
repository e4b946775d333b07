//! Priority-ordered, filter-gated fan-out to subscribers.
//!
//! Grounded on the original event-handler system: handlers are kept in
//! descending-priority order (stable within equal priorities), filters
//! compose via `and`/`or`, and a handler's failure is logged and isolated
//! — it never aborts dispatch to the remaining handlers.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::error;

use crate::model::ChatId;

/// Sum type of everything the dispatcher can fan out. Unifies the
/// dispatch shape on `(update)` regardless of originating component.
#[derive(Debug, Clone)]
pub enum Update {
    /// A participant joined, left, or changed state.
    ParticipantUpdate {
        /// Chat the update concerns.
        chat_id: ChatId,
        /// Participant identity.
        user_id: i64,
    },
    /// The local client was kicked from the call.
    Kicked {
        /// Chat the client was kicked from.
        chat_id: ChatId,
    },
    /// The local client left the call voluntarily.
    Left {
        /// Chat the client left.
        chat_id: ChatId,
    },
    /// The attached source reached end-of-stream.
    StreamEnd {
        /// Chat whose stream ended.
        chat_id: ChatId,
    },
    /// An operation failed and the call surfaces it as an event.
    Error {
        /// Chat the error concerns.
        chat_id: ChatId,
        /// Human-readable description.
        message: String,
    },
    /// Any update that doesn't fit the above, for host-defined extensions.
    Custom {
        /// Chat the update concerns, if any.
        chat_id: Option<ChatId>,
        /// Opaque event name.
        name: String,
        /// Opaque JSON payload.
        payload: serde_json::Value,
    },
}

impl Update {
    /// The chat this update concerns, if any.
    pub fn chat_id(&self) -> Option<ChatId> {
        match self {
            Update::ParticipantUpdate { chat_id, .. }
            | Update::Kicked { chat_id }
            | Update::Left { chat_id }
            | Update::StreamEnd { chat_id }
            | Update::Error { chat_id, .. } => Some(*chat_id),
            Update::Custom { chat_id, .. } => *chat_id,
        }
    }
}

/// A closed, composable predicate over an `Update`.
#[async_trait]
pub trait Filter: Send + Sync {
    /// Whether this update matches the filter.
    async fn matches(&self, update: &Update) -> bool;
}

/// Matches updates concerning one specific chat.
pub struct ChatFilter(pub ChatId);

#[async_trait]
impl Filter for ChatFilter {
    async fn matches(&self, update: &Update) -> bool {
        update.chat_id() == Some(self.0)
    }
}

/// Matches `Update::Custom` events with a given name.
pub struct CustomNameFilter(pub String);

#[async_trait]
impl Filter for CustomNameFilter {
    async fn matches(&self, update: &Update) -> bool {
        matches!(update, Update::Custom { name, .. } if name == &self.0)
    }
}

/// Combines two filters with logical AND.
pub struct AndFilter(pub Arc<dyn Filter>, pub Arc<dyn Filter>);

#[async_trait]
impl Filter for AndFilter {
    async fn matches(&self, update: &Update) -> bool {
        self.0.matches(update).await && self.1.matches(update).await
    }
}

/// Combines two filters with logical OR.
pub struct OrFilter(pub Arc<dyn Filter>, pub Arc<dyn Filter>);

#[async_trait]
impl Filter for OrFilter {
    async fn matches(&self, update: &Update) -> bool {
        self.0.matches(update).await || self.1.matches(update).await
    }
}

/// Subscriber callback. Invoked in the dispatcher's task context; slow
/// handlers are the caller's responsibility.
pub type Handler = Arc<dyn Fn(&Update) + Send + Sync>;

struct HandlerEntry {
    handler: Handler,
    filter: Option<Arc<dyn Filter>>,
    priority: i32,
    id: u64,
}

/// Ordered list of `(handler, filter?, priority)` entries, sorted by
/// descending priority (stable within equal priorities); `dispatch`
/// invokes every matching handler and isolates handler panics/errors from
/// the rest of the iteration.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Mutex<Vec<HandlerEntry>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl EventDispatcher {
    /// Construct an empty dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, returning an id usable with `remove_handler`.
    ///
    /// Inserted before the first existing entry with a strictly lower
    /// priority, preserving insertion order among equal priorities.
    pub fn add_handler(
        &self,
        handler: Handler,
        filter: Option<Arc<dyn Filter>>,
        priority: i32,
    ) -> u64 {
        let id = self.next_id.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let entry = HandlerEntry { handler, filter, priority, id };
        let mut handlers = self.handlers.lock();
        let pos = handlers.iter().position(|existing| priority > existing.priority);
        match pos {
            Some(idx) => handlers.insert(idx, entry),
            None => handlers.push(entry),
        }
        id
    }

    /// Remove a previously registered handler by id. Returns whether one was removed.
    pub fn remove_handler(&self, id: u64) -> bool {
        let mut handlers = self.handlers.lock();
        let before = handlers.len();
        handlers.retain(|entry| entry.id != id);
        handlers.len() != before
    }

    /// Number of registered handlers.
    pub fn handler_count(&self) -> usize {
        self.handlers.lock().len()
    }

    /// Remove every registered handler.
    pub fn clear(&self) {
        self.handlers.lock().clear();
    }

    /// Fan out `update` to every matching handler in priority order.
    ///
    /// A handler that panics is caught and logged; it never prevents later
    /// handlers from running.
    pub async fn dispatch(&self, update: Update) {
        // Snapshot under the lock, then release it before awaiting filters
        // or invoking handlers — handlers may themselves call add_handler.
        let snapshot: Vec<(Handler, Option<Arc<dyn Filter>>)> = {
            let handlers = self.handlers.lock();
            handlers
                .iter()
                .map(|entry| (entry.handler.clone(), entry.filter.clone()))
                .collect()
        };
        for (handler, filter) in snapshot {
            if let Some(filter) = &filter {
                if !filter.matches(&update).await {
                    continue;
                }
            }
            let update_ref = &update;
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                handler(update_ref)
            }));
            if let Err(panic) = result {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(%message, "event handler panicked; isolating and continuing dispatch");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn handlers_invoked_in_priority_order() {
        let dispatcher = EventDispatcher::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let order_a = order.clone();
        dispatcher.add_handler(Arc::new(move |_: &Update| order_a.lock().push("low")), None, 1);
        let order_b = order.clone();
        dispatcher.add_handler(Arc::new(move |_: &Update| order_b.lock().push("high")), None, 10);
        let order_c = order.clone();
        dispatcher.add_handler(Arc::new(move |_: &Update| order_c.lock().push("mid")), None, 5);

        dispatcher.dispatch(Update::Kicked { chat_id: 1 }).await;

        assert_eq!(*order.lock(), vec!["high", "mid", "low"]);
    }

    #[tokio::test]
    async fn filter_excludes_non_matching_updates() {
        let dispatcher = EventDispatcher::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = count.clone();
        dispatcher.add_handler(
            Arc::new(move |_: &Update| {
                count_clone.fetch_add(1, Ordering::SeqCst);
            }),
            Some(Arc::new(ChatFilter(42))),
            0,
        );

        dispatcher.dispatch(Update::Kicked { chat_id: 1 }).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        dispatcher.dispatch(Update::Kicked { chat_id: 42 }).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_handler_does_not_stop_dispatch() {
        let dispatcher = EventDispatcher::new();
        let ran = Arc::new(AtomicUsize::new(0));

        dispatcher.add_handler(Arc::new(|_: &Update| panic!("boom")), None, 10);
        let ran_clone = ran.clone();
        dispatcher.add_handler(
            Arc::new(move |_: &Update| {
                ran_clone.fetch_add(1, Ordering::SeqCst);
            }),
            None,
            5,
        );

        dispatcher.dispatch(Update::Kicked { chat_id: 1 }).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
