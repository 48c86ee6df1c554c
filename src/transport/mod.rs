//! Transport envelopes and observer fan-out.
//!
//! The transport layer is the seam between the orchestration core and
//! whatever shell delivers events to clients. Everything crosses it as
//! a JSON envelope so multiple entity kinds share one channel:
//! session-scoped messages, legion-scoped comms, and control events
//! (state changes, project updates, schedule updates, tool calls).
//!
//! Consumers register [`SessionObserver`]s; the registry fans out in
//! registration order, so ordering-sensitive observers (storage before
//! transport) register first.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{broadcast, RwLock};
use tracing::debug;

use crate::pipeline::ParsedMessage;

/// Build the session-scoped message envelope.
pub fn message_envelope(session_id: &str, data: Value) -> Value {
    json!({
        "type": "message",
        "session_id": session_id,
        "data": data,
        "timestamp": Utc::now().to_rfc3339(),
    })
}

/// Build the legion-scoped comm envelope.
pub fn comm_envelope(comm: Value) -> Value {
    json!({
        "type": "comm",
        "comm": comm,
        "timestamp": Utc::now().to_rfc3339(),
    })
}

/// Build a control envelope (`state_change`, `project_updated`, …).
pub fn control_envelope(kind: &str, data: Value) -> Value {
    json!({
        "type": kind,
        "data": data,
        "timestamp": Utc::now().to_rfc3339(),
    })
}

/// Fan-out hub for transport envelopes. Subscribers receive every
/// envelope broadcast after they subscribe; a lagging subscriber loses
/// oldest events rather than blocking the core.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    tx: broadcast::Sender<Value>,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Broadcaster {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Value> {
        self.tx.subscribe()
    }

    /// Broadcast an envelope. A send with no subscribers is not an
    /// error; the core never depends on someone listening.
    pub fn broadcast(&self, envelope: Value) {
        let _ = self.tx.send(envelope);
    }

    pub fn broadcast_message(&self, session_id: &str, data: Value) {
        self.broadcast(message_envelope(session_id, data));
    }

    pub fn broadcast_comm(&self, comm: Value) {
        self.broadcast(comm_envelope(comm));
    }

    pub fn broadcast_control(&self, kind: &str, data: Value) {
        self.broadcast(control_envelope(kind, data));
    }
}

/// Capability set every stream consumer implements.
#[async_trait]
pub trait SessionObserver: Send + Sync {
    async fn on_message(&self, session_id: &str, message: &ParsedMessage, transport: &Value);
    async fn on_error(&self, session_id: &str, error: &Value);
    async fn on_state_change(&self, session_id: &str, event: &Value);
}

/// Ordered observer fan-out. Observers fire in registration order.
#[derive(Default)]
pub struct ObserverRegistry {
    observers: RwLock<Vec<Arc<dyn SessionObserver>>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, observer: Arc<dyn SessionObserver>) {
        self.observers.write().await.push(observer);
    }

    pub async fn emit_message(&self, session_id: &str, message: &ParsedMessage, transport: &Value) {
        for observer in self.observers.read().await.iter() {
            observer.on_message(session_id, message, transport).await;
        }
    }

    pub async fn emit_error(&self, session_id: &str, error: &Value) {
        for observer in self.observers.read().await.iter() {
            observer.on_error(session_id, error).await;
        }
    }

    pub async fn emit_state_change(&self, session_id: &str, event: &Value) {
        for observer in self.observers.read().await.iter() {
            observer.on_state_change(session_id, event).await;
        }
    }
}

/// Observer that forwards everything onto the [`Broadcaster`] in the
/// standard envelopes.
pub struct TransportObserver {
    broadcaster: Broadcaster,
}

impl TransportObserver {
    pub fn new(broadcaster: Broadcaster) -> Self {
        Self { broadcaster }
    }
}

#[async_trait]
impl SessionObserver for TransportObserver {
    async fn on_message(&self, session_id: &str, _message: &ParsedMessage, transport: &Value) {
        self.broadcaster
            .broadcast_message(session_id, transport.clone());
    }

    async fn on_error(&self, session_id: &str, error: &Value) {
        debug!(target: "transport", "broadcasting error for session {}", session_id);
        self.broadcaster.broadcast_control("error", error.clone());
    }

    async fn on_state_change(&self, _session_id: &str, event: &Value) {
        self.broadcaster
            .broadcast_control("state_change", event.clone());
    }
}
