//! Push channel to a remote observation console

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

/// Event pushed to the console of one charge point
///
/// Serialized as `{"type": "...", "payload": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "payload", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConsoleEvent {
    /// A copy of a frame or a log line
    Log(Value),
    /// Transport status, tagged with the connection instance number
    WsStatus { id: u64, description: String },
    WsError(String),
}

pub trait ConsoleSink: Send + Sync + 'static {
    /// Whether any console is attached for this identity
    fn has_listeners(&self, identity: &str) -> bool;

    fn push(&self, identity: &str, event: ConsoleEvent);
}

/// Default console, drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullConsole;

impl ConsoleSink for NullConsole {
    fn has_listeners(&self, _identity: &str) -> bool {
        false
    }

    fn push(&self, _identity: &str, _event: ConsoleEvent) {}
}

/// One broadcast channel per identity; each subscriber is a console connection
#[derive(Debug)]
pub struct BroadcastConsole {
    capacity: usize,
    channels: RwLock<HashMap<String, broadcast::Sender<ConsoleEvent>>>,
}

impl BroadcastConsole {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            channels: RwLock::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self, identity: &str) -> broadcast::Receiver<ConsoleEvent> {
        let mut channels = self.channels.write();
        channels
            .entry(identity.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }
}

impl Default for BroadcastConsole {
    fn default() -> Self {
        Self::new(256)
    }
}

impl ConsoleSink for BroadcastConsole {
    fn has_listeners(&self, identity: &str) -> bool {
        self.channels
            .read()
            .get(identity)
            .map(|tx| tx.receiver_count() > 0)
            .unwrap_or(false)
    }

    fn push(&self, identity: &str, event: ConsoleEvent) {
        if let Some(tx) = self.channels.read().get(identity) {
            let _ = tx.send(event);
        }
    }
}
