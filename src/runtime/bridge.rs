//! Connectivity seam between the runtime wrapper and whatever link carries its status out.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::RwLock;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeState {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
}

impl BridgeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BridgeState::Connecting => "connecting",
            BridgeState::Connected => "connected",
            BridgeState::Disconnected => "disconnected",
            BridgeState::Reconnecting => "reconnecting",
        }
    }
}

impl fmt::Display for BridgeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connectivity transition emitted by a bridge session.
#[derive(Debug, Clone, PartialEq)]
pub enum BridgeEvent {
    Connected,
    Disconnected,
    Reconnecting,
    Error(String),
}

impl BridgeEvent {
    fn for_state(state: BridgeState) -> Option<Self> {
        match state {
            BridgeState::Connected => Some(BridgeEvent::Connected),
            BridgeState::Disconnected => Some(BridgeEvent::Disconnected),
            BridgeState::Reconnecting => Some(BridgeEvent::Reconnecting),
            BridgeState::Connecting => None,
        }
    }
}

/// Read-only view of an external bridge session. The runtime never drives reconnection.
pub trait BridgeSession: Send + Sync {
    fn state(&self) -> BridgeState;

    /// Free-form session details surfaced in status snapshots.
    fn metadata(&self) -> Option<Value> {
        None
    }

    fn subscribe(&self) -> broadcast::Receiver<BridgeEvent>;
}

/// In-process bridge whose state is driven by its owner.
pub struct LocalBridge {
    state: RwLock<BridgeState>,
    metadata: RwLock<Option<Value>>,
    events: broadcast::Sender<BridgeEvent>,
}

impl LocalBridge {
    pub fn new(initial: BridgeState) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: RwLock::new(initial),
            metadata: RwLock::new(None),
            events,
        }
    }

    pub fn connected() -> Self {
        Self::new(BridgeState::Connected)
    }

    pub fn with_metadata(self, metadata: Value) -> Self {
        *self.metadata.write().unwrap_or_else(|p| p.into_inner()) = Some(metadata);
        self
    }

    /// Move to `state`, notifying subscribers when it changed.
    pub fn set_state(&self, state: BridgeState) {
        let previous = {
            let mut slot = self.state.write().unwrap_or_else(|p| p.into_inner());
            std::mem::replace(&mut *slot, state)
        };
        if previous == state {
            return;
        }
        tracing::debug!(from = %previous, to = %state, "bridge state changed");
        if let Some(event) = BridgeEvent::for_state(state) {
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
    }

    pub fn report_error(&self, message: impl Into<String>) {
        let _ = self.events.send(BridgeEvent::Error(message.into()));
    }
}

impl BridgeSession for LocalBridge {
    fn state(&self) -> BridgeState {
        *self.state.read().unwrap_or_else(|p| p.into_inner())
    }

    fn metadata(&self) -> Option<Value> {
        self.metadata
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }
}
