//! Asynchronous hardware and protocol notifications.
//!
//! There is at most one live [`Subscription`] per [`EventBus`]. Subscribing again
//! replaces the previous receiver; the old one observes a closed channel.
//! Publishing never blocks: events are dropped when nobody is listening.
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Event payloads delivered to the registered listener.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LinkEvent {
    PresenceDetected { source: Uuid, energy: f32 },
    PresenceLost { source: Uuid },
    AlignmentLocked { source: Uuid, attempts: u32, error: f32 },
    AlignmentLost { source: Uuid, signal_strength: f32 },
    SafetyTrip { source: Uuid, reason: String },
    ChannelDegraded { source: Uuid, reason: String },
    ChannelRecovered { source: Uuid },
    /// Frames moved from the laser identified by `source` to ultrasound.
    FallbackActivated { source: Uuid, reason: String },
    FallbackRecovered { source: Uuid },
    SessionEstablished { session: Uuid },
}

/// Fan-in point engines publish to.
#[derive(Clone, Default)]
pub struct EventBus {
    listener: Arc<Mutex<Option<mpsc::UnboundedSender<LinkEvent>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a new listener, replacing any previous one.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.listener.lock() = Some(tx);
        Subscription { receiver: rx }
    }

    /// Drops the current listener, if any.
    pub fn unsubscribe(&self) {
        self.listener.lock().take();
    }

    pub fn has_listener(&self) -> bool {
        self.listener
            .lock()
            .as_ref()
            .map(|tx| !tx.is_closed())
            .unwrap_or(false)
    }

    /// Fire-and-forget delivery.
    pub fn publish(&self, event: LinkEvent) {
        let mut guard = self.listener.lock();
        if let Some(tx) = guard.as_ref() {
            if tx.send(event).is_err() {
                tracing::debug!("event listener dropped; clearing registration");
                guard.take();
            }
        }
    }
}

/// Caller-owned receiving end; dropping it ends delivery.
#[derive(Debug)]
pub struct Subscription {
    receiver: mpsc::UnboundedReceiver<LinkEvent>,
}

impl Subscription {
    /// Waits for the next event. `None` once the subscription was replaced.
    pub async fn recv(&mut self) -> Option<LinkEvent> {
        self.receiver.recv().await
    }

    /// Non-blocking poll.
    pub fn try_recv(&mut self) -> Option<LinkEvent> {
        self.receiver.try_recv().ok()
    }

    /// Drains everything currently queued.
    pub fn drain(&mut self) -> Vec<LinkEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.receiver.try_recv() {
            events.push(event);
        }
        events
    }
}
