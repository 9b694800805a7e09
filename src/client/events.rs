//! Connection Events
//!
//! Events emitted by the client so callers can react to session
//! lifecycle changes without polling.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Events emitted by the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionEvent {
    /// A session was dialed and authenticated
    Connected { host: String, session: u64 },

    /// A session ended
    Disconnected {
        host: String,
        session: u64,
        reason: DisconnectReason,
    },

    /// The appliance rejected the API key
    AuthenticationFailed { host: String, reason: String },

    /// A call got no answer in time
    CallTimedOut {
        method: String,
        id: u64,
        after: Duration,
    },
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// The client was closed
    Closed,
    /// The appliance sent a closure frame or ended the stream
    RemoteClosed(Option<String>),
    /// The transport failed
    TransportError(String),
    /// Authentication did not succeed
    HandshakeFailed,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::Closed => write!(f, "closed"),
            DisconnectReason::RemoteClosed(Some(reason)) => write!(f, "remote closed: {}", reason),
            DisconnectReason::RemoteClosed(None) => write!(f, "remote closed"),
            DisconnectReason::TransportError(e) => write!(f, "transport error: {}", e),
            DisconnectReason::HandshakeFailed => write!(f, "handshake failed"),
        }
    }
}

impl ConnectionEvent {
    /// Session this event belongs to, if any
    pub fn session(&self) -> Option<u64> {
        match self {
            ConnectionEvent::Connected { session, .. } => Some(*session),
            ConnectionEvent::Disconnected { session, .. } => Some(*session),
            ConnectionEvent::AuthenticationFailed { .. } | ConnectionEvent::CallTimedOut { .. } => {
                None
            }
        }
    }

    /// Check if this is a lifecycle event
    pub fn is_lifecycle_event(&self) -> bool {
        matches!(
            self,
            ConnectionEvent::Connected { .. } | ConnectionEvent::Disconnected { .. }
        )
    }
}
