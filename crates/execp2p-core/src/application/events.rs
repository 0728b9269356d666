//! Typed event bus between the session orchestrator and front ends.
//!
//! The transport never exposes internal state for polling; it publishes
//! events here and the UI subscribes.

use std::collections::HashMap;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::domain::wire::MessagePayload;

use super::status::NetworkStatus;

/// Bus capacity; slow subscribers lag and lose the oldest events.
const EVENT_BUS_CAPACITY: usize = 100;

/// Everything a front end can observe.
#[derive(Debug, Clone, Serialize)]
pub enum AppEvent {
    /// A decrypted chat payload arrived (or a local echo).
    MessageReceived(MessagePayload),
    /// Periodic connection/encryption status snapshot.
    StatusUpdate(NetworkStatus),
    /// Human-readable security notice (rotation, mismatch warnings...).
    SecurityMessage(String),
    /// Per-peer identity fingerprints changed.
    PeerFingerprints(HashMap<String, String>),
    /// A peer renamed itself. Produced by front ends that decode the chat
    /// sub-protocol; the core never parses message bodies.
    NicknameUpdate { peer_id: String, nickname: String },
    /// The room was closed locally.
    RoomLeft,
    /// Asynchronous transport/discovery failure.
    NetworkError(String),
}

impl AppEvent {
    /// Stable string key for event routing in loosely-typed front ends.
    pub fn key(&self) -> &'static str {
        match self {
            Self::MessageReceived(_) => "message:received",
            Self::StatusUpdate(_) => "status:update",
            Self::SecurityMessage(_) => "security:message",
            Self::PeerFingerprints(_) => "peer:fingerprints",
            Self::NicknameUpdate { .. } => "nickname:update",
            Self::RoomLeft => "room:left",
            Self::NetworkError(_) => "network:error",
        }
    }
}

/// Cloneable broadcast bus.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AppEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { tx }
    }

    /// Publish to all current subscribers; a bus with no listeners simply
    /// drops the event.
    pub fn publish(&self, event: AppEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_published_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish(AppEvent::SecurityMessage("rotated".into()));
        match rx.recv().await.unwrap() {
            AppEvent::SecurityMessage(msg) => assert_eq!(msg, "rotated"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn event_keys_are_stable() {
        assert_eq!(AppEvent::RoomLeft.key(), "room:left");
        assert_eq!(
            AppEvent::NetworkError("x".into()).key(),
            "network:error"
        );
    }
}
