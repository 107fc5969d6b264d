/// Typed realtime event channel. The router fans events out to local
/// handlers first, then to the outbound network path, and stamps a
/// per-page sequence on every event it dispatches.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use tokio::sync::mpsc;
use uuid::Uuid;

use page::{ComponentId, Position, Props};

use crate::ConflictId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ContentChange,
    ComponentAdd,
    ComponentMove,
    ComponentDelete,
    PageCreate,
    NavUpdate,
    ConflictDetected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    ContentChange {
        content_key: String,
        old_value: String,
        new_value: String,
        content_type: String,
    },
    ComponentAdd {
        component_id: ComponentId,
        component_type: String,
        position: Position,
        props: Props,
    },
    ComponentMove {
        component_id: ComponentId,
        old_position: Position,
        new_position: Position,
        affected_components: Vec<ComponentId>,
    },
    ComponentDelete {
        component_id: ComponentId,
        position: Position,
        removed_components: Vec<ComponentId>,
        affected_components: Vec<ComponentId>,
    },
    PageCreate {
        page_name: String,
    },
    NavUpdate {
        items: Vec<String>,
    },
    ConflictDetected {
        conflict_id: ConflictId,
        component_id: Option<ComponentId>,
    },
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            EventPayload::ContentChange { .. } => EventType::ContentChange,
            EventPayload::ComponentAdd { .. } => EventType::ComponentAdd,
            EventPayload::ComponentMove { .. } => EventType::ComponentMove,
            EventPayload::ComponentDelete { .. } => EventType::ComponentDelete,
            EventPayload::PageCreate { .. } => EventType::PageCreate,
            EventPayload::NavUpdate { .. } => EventType::NavUpdate,
            EventPayload::ConflictDetected { .. } => EventType::ConflictDetected,
        }
    }
}

/// Immutable once emitted. `version` is the optimistic version string of
/// the targeted content key (last-writer detection, not causal
/// ordering); `sequence` is assigned by the router per page.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeEvent {
    pub id: EventId,
    pub page_name: String,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    pub sequence: u64,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl RealtimeEvent {
    pub fn new(
        page_name: impl Into<String>,
        user_id: impl Into<String>,
        version: impl Into<String>,
        payload: EventPayload,
    ) -> Self {
        Self {
            id: EventId::new(),
            page_name: page_name.into(),
            user_id: user_id.into(),
            timestamp: Utc::now(),
            version: version.into(),
            sequence: 0,
            payload,
        }
    }

    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Error,
}

pub type EventHandler = Box<dyn Fn(&RealtimeEvent) + Send>;

/// Publish/subscribe bus with synchronous local dispatch. Local handlers
/// always run before the network send, so local state never lags behind
/// what the emitting user sees. Network failures are the transport's
/// concern; the router only flips its connection status.
pub struct EventRouter {
    handlers: HashMap<EventType, Vec<EventHandler>>,
    sequences: HashMap<String, u64>,
    network: Option<mpsc::UnboundedSender<RealtimeEvent>>,
    status: ConnectionStatus,
}

impl EventRouter {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            sequences: HashMap::new(),
            network: None,
            status: ConnectionStatus::Disconnected,
        }
    }

    /// Register a handler for one event type. Handlers run in
    /// registration order.
    pub fn register(&mut self, event_type: EventType, handler: EventHandler) {
        self.handlers.entry(event_type).or_default().push(handler);
    }

    /// Attach the outbound network sender and mark the channel live.
    pub fn set_network(&mut self, sender: mpsc::UnboundedSender<RealtimeEvent>) {
        self.network = Some(sender);
        self.status = ConnectionStatus::Connected;
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.status
    }

    pub fn set_connection_status(&mut self, status: ConnectionStatus) {
        self.status = status;
    }

    /// Dispatch an event: stamp its per-page sequence, deliver to local
    /// handlers in registration order, then forward on the network path
    /// when connected. Returns the stamped event.
    pub fn route(&mut self, mut event: RealtimeEvent) -> RealtimeEvent {
        let sequence = self.sequences.entry(event.page_name.clone()).or_insert(0);
        *sequence += 1;
        event.sequence = *sequence;

        if let Some(handlers) = self.handlers.get(&event.event_type()) {
            for handler in handlers {
                handler(&event);
            }
        }

        if self.status == ConnectionStatus::Connected {
            if let Some(network) = &self.network {
                if network.send(event.clone()).is_err() {
                    tracing::warn!(
                        event = %event.id,
                        page = %event.page_name,
                        "network send failed; marking connection errored"
                    );
                    self.status = ConnectionStatus::Error;
                }
            }
        }

        event
    }
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}
