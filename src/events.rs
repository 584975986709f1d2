//! Fire-and-forget notifications for external observers.

use serde_json::Value;
use tokio::sync::broadcast;

use crate::token::Token;

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Primary identity established by an entity strategy.
    Profile,
    /// Resource token obtained through a fresh authorization.
    Authorization,
    /// Resource token renewed with a refresh grant.
    Refresh,
}

#[derive(Debug, Clone)]
pub struct AuthEvent {
    pub kind: EventKind,
    /// Strategy name that produced the event.
    pub source: String,
    pub tags: Vec<String>,
    pub user: Value,
    pub token: Token,
}

/// Broadcast seam between strategies and observers. Emission never fails
/// the authentication outcome: a send with no live receivers is dropped,
/// and a slow receiver only lags its own copy of the stream.
#[derive(Clone)]
pub struct EventSink {
    sender: broadcast::Sender<AuthEvent>,
}

impl EventSink {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AuthEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: AuthEvent) {
        tracing::debug!(source = %event.source, kind = ?event.kind, "emitting auth event");
        let _ = self.sender.send(event);
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}
