use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::trace;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    pub payload: Value,
    pub pack_id: String,
    pub instance_id: String,
    pub emitted_at: DateTime<Utc>,
}

pub trait EventBus: Send + Sync {
    fn publish(&self, event: Event);
}

/// Fan-out over a tokio broadcast channel. Publishing with no subscribers is not an error.
#[derive(Clone, Debug)]
pub struct BroadcastEventBus {
    tx: broadcast::Sender<Event>,
}

impl BroadcastEventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventBus for BroadcastEventBus {
    fn publish(&self, event: Event) {
        if self.tx.send(event).is_err() {
            trace!("event published with no subscribers");
        }
    }
}
