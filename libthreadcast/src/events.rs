//! Progress events for broadcasts
//!
//! An in-process event bus over `tokio::sync::broadcast`. The orchestrator
//! emits events as targets progress; any number of subscribers (CLI
//! progress output, logs, tests) can follow along.
//!
//! Emitting never blocks. Without subscribers events are dropped, and a
//! lagging subscriber misses the oldest events rather than slowing anyone
//! down.
//!
//! # Example
//!
//! ```
//! use libthreadcast::events::{Event, EventBus};
//!
//! # async fn example() {
//! let event_bus = EventBus::new(100);
//! let mut receiver = event_bus.subscribe();
//!
//! event_bus.emit(Event::BroadcastFinished {
//!     request_id: "abc123".to_string(),
//!     status: 200,
//! });
//!
//! if let Ok(event) = receiver.recv().await {
//!     println!("Received: {:?}", event);
//! }
//! # }
//! ```

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::error::ApiError;
use crate::types::Target;

pub type EventReceiver = broadcast::Receiver<Event>;

/// Default per-subscriber buffer
pub const DEFAULT_CAPACITY: usize = 100;

#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Receive every event emitted from now on
    pub fn subscribe(&self) -> EventReceiver {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: Event) {
        // Err only means nobody is listening
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Validation passed and tasks are about to start
    BroadcastStarted {
        request_id: String,
        targets: Vec<Target>,
    },

    /// One message of a thread was published
    MessagePublished {
        request_id: String,
        target: Target,
        /// Position of the message in the thread, 0-based
        index: usize,
        post_id: String,
    },

    TargetFailed {
        request_id: String,
        target: Target,
        error: ApiError,
    },

    TargetCompleted {
        request_id: String,
        target: Target,
        post_ids: Vec<String>,
    },

    /// Every target has reported; `status` is the composite status
    BroadcastFinished { request_id: String, status: u16 },
}
