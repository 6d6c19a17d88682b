//! Connected client bookkeeping
//!
//! Each WebSocket connection gets a bounded outbound queue drained by its
//! writer task. Sends never block: a full queue drops the frame with a
//! warning, so a slow client cannot stall the requests feeding it.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{trace, warn};
use uuid::Uuid;

use crate::config::DeliveryMode;
use crate::relay::events::{EventSink, OutboundEvent, ServerFrame};
use crate::relay::tracker::ConversationKey;

/// Unique connection identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClientId(String);

impl Default for ClientId {
    fn default() -> Self {
        Self(format!("client_{}", Uuid::new_v4()))
    }
}

impl ClientId {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug)]
struct Client {
    tx: mpsc::Sender<String>,
    /// In-flight request count per conversation submitted by this client
    conversations: HashMap<ConversationKey, usize>,
}

/// Registry of connected WebSocket clients
#[derive(Debug)]
pub struct ClientRegistry {
    clients: DashMap<ClientId, Client>,
    send_queue: usize,
}

impl ClientRegistry {
    pub fn new(send_queue: usize) -> Self {
        Self {
            clients: DashMap::new(),
            send_queue: send_queue.max(1),
        }
    }

    /// Register a new client and return its id and outbound queue
    pub fn register(&self) -> (ClientId, mpsc::Receiver<String>) {
        let id = ClientId::new();
        let (tx, rx) = mpsc::channel(self.send_queue);
        self.clients.insert(
            id.clone(),
            Client {
                tx,
                conversations: HashMap::new(),
            },
        );
        (id, rx)
    }

    /// Remove a client, returning the conversations it still has requests in flight for
    pub fn unregister(&self, id: &ClientId) -> Vec<ConversationKey> {
        self.clients
            .remove(id)
            .map(|(_, client)| client.conversations.into_keys().collect())
            .unwrap_or_default()
    }

    /// Record that `id` has a request in flight for `key`
    pub fn remember(&self, id: &ClientId, key: &ConversationKey) {
        if let Some(mut client) = self.clients.get_mut(id) {
            *client.conversations.entry(key.clone()).or_insert(0) += 1;
        }
    }

    /// Record that one of `id`'s requests for `key` has finished
    pub fn forget(&self, id: &ClientId, key: &ConversationKey) {
        let Some(mut client) = self.clients.get_mut(id) else {
            return;
        };
        if let Some(count) = client.conversations.get_mut(key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                client.conversations.remove(key);
            }
        }
    }

    /// Number of conversations `id` has requests in flight for
    pub fn outstanding(&self, id: &ClientId) -> usize {
        self.clients
            .get(id)
            .map(|c| c.conversations.len())
            .unwrap_or(0)
    }

    /// Queue a frame for one client; false if it is gone or its queue is full
    pub fn send_to(&self, id: &ClientId, frame: String) -> bool {
        let Some(tx) = self.clients.get(id).map(|c| c.tx.clone()) else {
            trace!(client_id = %id, "Dropping frame for disconnected client");
            return false;
        };
        Self::try_send(id, &tx, frame)
    }

    /// Queue a frame for every connected client; returns how many accepted it
    pub fn broadcast(&self, frame: &str) -> usize {
        let targets: Vec<(ClientId, mpsc::Sender<String>)> = self
            .clients
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().tx.clone()))
            .collect();

        targets
            .iter()
            .filter(|(id, tx)| Self::try_send(id, tx, frame.to_string()))
            .count()
    }

    /// Requests in flight across all clients
    pub fn outstanding_total(&self) -> usize {
        self.clients
            .iter()
            .map(|entry| entry.value().conversations.values().sum::<usize>())
            .sum()
    }

    /// Number of connected clients
    pub fn count(&self) -> usize {
        self.clients.len()
    }

    fn try_send(id: &ClientId, tx: &mpsc::Sender<String>, frame: String) -> bool {
        match tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(frame)) => {
                warn!(
                    client_id = %id,
                    frame_len = frame.len(),
                    "Send queue full, dropping frame"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Event sink that routes a request's events through the registry
pub struct ClientSink {
    registry: Arc<ClientRegistry>,
    mode: DeliveryMode,
    origin: ClientId,
}

impl ClientSink {
    pub fn new(registry: Arc<ClientRegistry>, mode: DeliveryMode, origin: ClientId) -> Self {
        Self {
            registry,
            mode,
            origin,
        }
    }
}

impl EventSink for ClientSink {
    fn emit(&self, event: OutboundEvent) {
        let frame = match serde_json::to_string(&ServerFrame::Message(event)) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error_message = %e, "Failed to serialize outbound frame");
                return;
            }
        };

        match self.mode {
            DeliveryMode::Origin => {
                self.registry.send_to(&self.origin, frame);
            }
            DeliveryMode::Broadcast => {
                self.registry.broadcast(&frame);
            }
        }
    }
}
