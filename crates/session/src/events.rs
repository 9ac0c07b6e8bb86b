//! Lifecycle events and the externally observable connection state.
//!
//! Events are fanned out over a `tokio::sync::broadcast` channel.  The
//! serialized form (`{"event": "status-change", ...}`) is the contract
//! consumed by adapter layers, so variant names must not change.

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Connection state.  Exactly one value at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum SessionEvent {
    Connected {
        url: String,
    },
    Disconnected {
        reason: String,
    },
    Error {
        kind: String,
        message: String,
    },
    StatusChange {
        state: ConnectionState,
    },
    ToolRegistered {
        name: String,
    },
    ToolUnregistered {
        name: String,
    },
    ToolCalled {
        name: String,
        duration_ms: u64,
        is_error: bool,
    },
    ToolError {
        name: String,
        error: String,
    },
    Reconnecting {
        attempt: u32,
        delay_ms: u64,
    },
    Reconnected {
        attempts: u32,
        elapsed_ms: u64,
    },
    ReconnectFailed {
        attempt: u32,
        error: String,
        next_delay_ms: u64,
    },
    ReconnectGaveUp {
        attempts: u32,
        elapsed_ms: u64,
    },
}

/// Cloneable handle to the session's event channel.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event.  Having no subscribers is not an error.
    pub fn emit(&self, event: SessionEvent) {
        tracing::trace!(?event, "session event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
