//! Service event bus. Subscribers (RPC push, desktop notifications, tests)
//! receive a broadcast of noteworthy state changes; a lagging subscriber
//! only loses its own backlog.

use aim_core::message::Message;
use aim_core::types::IdentityId;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

pub const EVENT_BUS_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServiceEvent {
    MessageReceived { message: Message },
    MessageRequestQueued { sender: IdentityId },
    MessageStatusChanged { message_id: String, status: aim_core::message::MessageStatus },
    SecurityAlert { sender: IdentityId, detail: String },
    NetworkingStarted,
    NetworkingStopped,
    DegradeEntered,
    DegradeRecovered,
    AccountSwitched { profile_id: String },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ServiceEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: ServiceEvent) {
        // No receivers is fine; events are advisory.
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServiceEvent> {
        self.tx.subscribe()
    }

    pub fn backlog_estimate(&self) -> usize {
        self.tx.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
