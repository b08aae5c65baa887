use axum::extract::ws::Message;
use dashmap::DashMap;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::engine::notify::{Group, Notifier};

/// Channel sender half for pushing frames to a WebSocket connection.
pub type WsSender = mpsc::UnboundedSender<Message>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    Driver,
    Rider,
}

impl ClientKind {
    /// Accepts the handshake spellings used by the rider and driver apps.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "driver" => Some(ClientKind::Driver),
            "user" | "customer" | "rider" => Some(ClientKind::Rider),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    pub kind: ClientKind,
    pub id: String,
}

impl ClientIdentity {
    pub fn driver(id: impl Into<String>) -> Self {
        Self {
            kind: ClientKind::Driver,
            id: id.into(),
        }
    }

    pub fn rider(id: impl Into<String>) -> Self {
        Self {
            kind: ClientKind::Rider,
            id: id.into(),
        }
    }

    pub fn groups(&self) -> Vec<Group> {
        match self.kind {
            ClientKind::Driver => vec![Group::Drivers, Group::Driver(self.id.clone())],
            ClientKind::Rider => vec![Group::Rider(self.id.clone())],
        }
    }
}

struct ClientConnection {
    groups: Vec<Group>,
    sender: WsSender,
}

/// All live client connections and their broadcast groups.
pub struct ConnectionHub {
    connections: DashMap<String, ClientConnection>,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    /// Registers a connection and returns the receiver the socket task
    /// forwards to the sink.
    pub fn register(
        &self,
        connection_id: &str,
        identity: &ClientIdentity,
    ) -> mpsc::UnboundedReceiver<Message> {
        let (sender, rx) = mpsc::unbounded_channel();
        self.connections.insert(
            connection_id.to_string(),
            ClientConnection {
                groups: identity.groups(),
                sender,
            },
        );
        rx
    }

    pub fn remove(&self, connection_id: &str) {
        self.connections.remove(connection_id);
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Sends a Close frame to every connection, then forgets them.
    pub fn shutdown_all(&self) {
        let count = self.connections.len();
        for connection in self.connections.iter() {
            let _ = connection.sender.send(Message::Close(None));
        }
        self.connections.clear();
        info!(count, "closed all websocket connections");
    }
}

impl Default for ConnectionHub {
    fn default() -> Self {
        Self::new()
    }
}

fn frame(event: &str, payload: Value) -> Message {
    Message::Text(json!({ "event": event, "data": payload }).to_string().into())
}

impl Notifier for ConnectionHub {
    fn send_to_client(&self, connection_id: &str, event: &str, payload: Value) {
        match self.connections.get(connection_id) {
            Some(connection) => {
                let _ = connection.sender.send(frame(event, payload));
            }
            None => debug!(connection_id, event, "dropping event for closed connection"),
        }
    }

    fn send_to_group(&self, group: &Group, event: &str, payload: Value) {
        let message = frame(event, payload);
        let mut delivered = 0usize;
        for connection in self.connections.iter() {
            if connection.groups.contains(group) {
                let _ = connection.sender.send(message.clone());
                delivered += 1;
            }
        }
        debug!(group = %group, event, delivered, "group event sent");
    }
}
