//! Status notifications for observers.
//!
//! The core publishes session state changes and transfer progress on a
//! broadcast channel. Publishing never blocks: a subscriber that falls behind
//! loses old events (`RecvError::Lagged`) instead of stalling a transfer.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use super::transfer::TransferState;
use super::types::SessionState;

/// Events buffered per subscriber before the oldest are dropped.
const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RemoteEvent {
    /// A session for `name` changed state.
    SessionState {
        name: String,
        state: SessionState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// A chunk of a transfer completed.
    TransferProgress {
        id: String,
        host: String,
        transferred: u64,
        total: u64,
    },
    /// A transfer changed state.
    TransferState {
        id: String,
        host: String,
        state: TransferState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// Cloneable publishing handle.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RemoteEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: RemoteEvent) {
        if self.sender.send(event).is_err() {
            trace!("No event subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RemoteEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
