use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::error::SocketError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(Uuid);

impl ClientId {
    pub fn new() -> Self {
        ClientId(Uuid::new_v4())
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Outbound half of one connection. The registry and the broadcaster only ever
/// see this trait, never the transport behind it.
#[async_trait]
pub trait ClientSink: Send + Sync {
    async fn send_text(&self, text: &str) -> Result<(), SocketError>;
}

/// Handle to one connected client.
#[derive(Clone)]
pub struct Client {
    id: ClientId,
    sink: Arc<dyn ClientSink>,
}

impl Client {
    pub fn new(id: ClientId, sink: Arc<dyn ClientSink>) -> Self {
        Self { id, sink }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub async fn send_text(&self, text: &str) -> Result<(), SocketError> {
        self.sink.send_text(text).await
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client").field("id", &self.id).finish()
    }
}

/// Set of clients currently eligible for broadcast. The lock is never held
/// across an await, so membership can also be dropped from synchronous code.
#[derive(Default)]
pub struct ClientRegistry {
    clients: Mutex<HashMap<ClientId, Client>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `client`; registering an id that is already present keeps the
    /// existing entry.
    pub fn register(&self, client: Client) {
        let id = client.id();
        let mut clients = self.clients.lock();
        clients.entry(id).or_insert(client);
        debug!(client_id = %id, members = clients.len(), "Client registered");
    }

    /// Returns whether the client was present.
    pub fn unregister(&self, id: &ClientId) -> bool {
        let mut clients = self.clients.lock();
        let removed = clients.remove(id).is_some();
        if removed {
            debug!(client_id = %id, members = clients.len(), "Client unregistered");
        }
        removed
    }

    pub fn snapshot_members(&self) -> Vec<Client> {
        self.clients.lock().values().cloned().collect()
    }

    pub fn contains(&self, id: &ClientId) -> bool {
        self.clients.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.lock().is_empty()
    }
}
