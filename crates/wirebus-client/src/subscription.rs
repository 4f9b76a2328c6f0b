//! Client-side subscription registry.
//!
//! Maps `subject → ordered handler list`. Each entry is a decode-and-invoke
//! closure captured at subscription time: the payload type was fixed when
//! the handler registered, so delivery never inspects types at runtime.
//!
//! The registry also drives the announce protocol: the first handler added
//! for a subject means one `Subscribe` frame goes to the broker, and only
//! removing the last handler sends the matching `Unsubscribe`. Everything in
//! between mutates the list locally.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;

/// Future returned by a decode-and-invoke closure.
pub(crate) type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// A type-erased handler: takes the raw delivery payload, decodes it as the
/// type fixed at registration, and runs the user callback.
pub(crate) type DynHandler = Arc<dyn Fn(Vec<u8>) -> HandlerFuture + Send + Sync>;

/// Identifies one registered handler so it can be removed later.
///
/// Returned by `subscribe`; closures have no identity of their own in Rust,
/// so removal is by token rather than by handler value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Outcome of removing a handler from the registry.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Removal {
    /// No handler with that id was registered for the subject.
    NotFound,
    /// Removed; `last` is true when the subject now has no handlers left.
    Removed { last: bool },
}

struct HandlerEntry {
    id: SubscriptionId,
    handler: DynHandler,
}

#[derive(Default)]
pub(crate) struct HandlerRegistry {
    next_id: AtomicU64,
    inner: RwLock<HashMap<String, Vec<HandlerEntry>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `handler` to `subject`'s list.
    ///
    /// Returns the handler's id and whether it is the first handler for the
    /// subject (the caller announces the subject to the broker exactly then).
    pub async fn add(&self, subject: &str, handler: DynHandler) -> (SubscriptionId, bool) {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut map = self.inner.write().await;
        let entries = map.entry(subject.to_string()).or_default();
        let first = entries.is_empty();
        entries.push(HandlerEntry { id, handler });
        (id, first)
    }

    /// Removes the handler registered under `id` for `subject`.
    pub async fn remove(&self, subject: &str, id: SubscriptionId) -> Removal {
        let mut map = self.inner.write().await;
        let Some(entries) = map.get_mut(subject) else {
            return Removal::NotFound;
        };
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        if entries.len() == before {
            return Removal::NotFound;
        }
        let last = entries.is_empty();
        if last {
            map.remove(subject);
        }
        Removal::Removed { last }
    }

    /// Handlers for `subject` in registration order, detached from the
    /// registry so invocation never holds the lock.
    pub async fn snapshot(&self, subject: &str) -> Vec<DynHandler> {
        self.inner
            .read()
            .await
            .get(subject)
            .map(|entries| entries.iter().map(|e| Arc::clone(&e.handler)).collect())
            .unwrap_or_default()
    }

    /// Every subject that currently has at least one handler. Used to
    /// re-announce subscriptions after a reconnect.
    pub async fn subjects(&self) -> Vec<String> {
        self.inner.read().await.keys().cloned().collect()
    }

    pub async fn handler_count(&self, subject: &str) -> usize {
        self.inner
            .read()
            .await
            .get(subject)
            .map_or(0, |entries| entries.len())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
