//! Host-wide message bus shared by every frame.
//!
//! Every listener sees every posted message, the same way each `message`
//! listener on a browser window does. Runs filter by token; the bus itself
//! never inspects payloads.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tokio::sync::mpsc;

/// Identifies one registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Anything a frame can post messages to.
pub trait Outbox: Send + Sync {
    /// Post one JSON message.
    fn post(&self, message: Value);
}

#[derive(Default)]
struct BusInner {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(ListenerId, mpsc::UnboundedSender<Value>)>>,
}

/// Broadcast bus connecting frames to run listeners.
#[derive(Clone, Default)]
pub struct MessageBus {
    inner: Arc<BusInner>,
}

impl MessageBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    fn listeners(&self) -> MutexGuard<'_, Vec<(ListenerId, mpsc::UnboundedSender<Value>)>> {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a listener. Messages posted from now on are delivered to the
    /// returned receiver in post order.
    pub fn add_listener(&self) -> (ListenerId, mpsc::UnboundedReceiver<Value>) {
        let id = ListenerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners().push((id, tx));
        (id, rx)
    }

    /// Detach a listener. Returns `false` if it was already gone.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    /// Number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.listeners().len()
    }

    /// Deliver `message` to every listener.
    pub fn post(&self, message: Value) {
        let mut listeners = self.listeners();
        // receivers dropped without remove_listener are pruned here
        listeners.retain(|(_, tx)| tx.send(message.clone()).is_ok());
    }
}

impl Outbox for MessageBus {
    fn post(&self, message: Value) {
        MessageBus::post(self, message);
    }
}

impl std::fmt::Debug for MessageBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBus")
            .field("listeners", &self.listener_count())
            .finish()
    }
}
