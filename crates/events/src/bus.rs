//! In-process event bus backed by a `tokio::sync::broadcast` channel.
//!
//! [`FlowEventBus`] is the publish/subscribe hub for [`FlowEvent`]s.
//! It is shared via `Arc<FlowEventBus>` across the engine and any
//! transport layer that forwards events to clients. Delivery is
//! at-least-once per transition for attached subscribers; events
//! published with no subscriber attached are dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use loregen_core::types::FlowId;

// ---------------------------------------------------------------------------
// FlowEvent
// ---------------------------------------------------------------------------

/// A lifecycle or progress event for one flow.
///
/// Constructed via [`FlowEvent::new`] and enriched with the builder
/// methods [`with_stage`](FlowEvent::with_stage) and
/// [`with_payload`](FlowEvent::with_payload).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowEvent {
    /// One of the `loregen_core::flow_events` constants.
    pub event_type: String,

    /// The flow this event concerns.
    pub flow_id: FlowId,

    /// Wire-format stage name, when the event is stage-scoped.
    pub stage: Option<String>,

    /// Free-form JSON payload carrying event-specific data.
    pub payload: serde_json::Value,

    /// When the event was created (UTC).
    pub timestamp: DateTime<Utc>,
}

impl FlowEvent {
    /// Create a new event with only the required type and flow id.
    pub fn new(event_type: impl Into<String>, flow_id: impl Into<FlowId>) -> Self {
        Self {
            event_type: event_type.into(),
            flow_id: flow_id.into(),
            stage: None,
            payload: serde_json::Value::Object(Default::default()),
            timestamp: Utc::now(),
        }
    }

    /// Attach the stage this event concerns.
    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    /// Set the JSON payload for the event.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

// ---------------------------------------------------------------------------
// FlowEventBus
// ---------------------------------------------------------------------------

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// In-process fan-out event bus.
///
/// Wraps a [`broadcast::Sender`] so that any number of subscribers can
/// independently receive every published [`FlowEvent`].
pub struct FlowEventBus {
    sender: broadcast::Sender<FlowEvent>,
}

impl FlowEventBus {
    /// Create a bus with a specific channel capacity.
    ///
    /// When the buffer is full, the oldest un-consumed messages are
    /// dropped and slow receivers observe a `RecvError::Lagged`.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all current subscribers.
    ///
    /// If there are no active subscribers the event is silently dropped.
    pub fn publish(&self, event: FlowEvent) {
        // Ignore the SendError -- it only means there are zero receivers.
        let _ = self.sender.send(event);
    }

    /// Subscribe to all events published on this bus.
    pub fn subscribe(&self) -> broadcast::Receiver<FlowEvent> {
        self.sender.subscribe()
    }
}

impl Default for FlowEventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
