//! Typed in-process event bus. Every cross-component notification goes
//! through here; subscribers filter on the fields they care about rather
//! than subscribing to per-entity topics.

use std::net::SocketAddr;

use tokio::sync::broadcast;

use crate::detect::DetectedPort;

#[derive(Clone, Debug)]
pub enum Event {
    /// Filtered output chunk from a session, in arrival order.
    SessionData { pane_id: String, data: Vec<u8> },
    /// The session's process exited (naturally or via kill).
    SessionExit {
        pane_id: String,
        exit_code: Option<i32>,
        signal: Option<i32>,
    },
    /// A listening port appeared in a session's process tree.
    PortAdd(DetectedPort),
    /// A previously reported port is no longer listening.
    PortRemove { pane_id: String, port: u16 },
    /// A proxy route's backend target changed.
    ProxyUpdated {
        canonical_port: u16,
        target: Option<SocketAddr>,
    },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Fire-and-forget publish; an event with no subscribers is not an error.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
