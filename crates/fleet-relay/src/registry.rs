//! Connected downstream clients
//!
//! The registry is a plain collection. It is owned by the hub task and never
//! shared, so it needs no lock.

use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use fleet_core::AuthContext;
use fleet_frame::CloseCode;
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Identifier of a downstream connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ClientId(Uuid);

impl ClientId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
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

/// Work item for a client's writer task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// Pre-encoded frame bytes
    Frame(Bytes),
    /// Send a close frame with this code, then shut the socket down
    Close(CloseCode),
}

/// The client's writer task has gone away
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disconnected;

/// A registered downstream session
#[derive(Debug, Clone)]
pub struct Client {
    pub id: ClientId,
    pub auth: AuthContext,
    pub connected_at: DateTime<Utc>,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl Client {
    pub fn new(id: ClientId, auth: AuthContext, outbound: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            id,
            auth,
            connected_at: Utc::now(),
            outbound,
        }
    }

    /// Queue an encoded frame; never waits
    pub fn deliver(&self, frame: Bytes) -> Result<(), Disconnected> {
        self.outbound
            .send(Outbound::Frame(frame))
            .map_err(|_| Disconnected)
    }

    /// Ask the writer to close the connection
    pub fn close(&self, code: CloseCode) -> Result<(), Disconnected> {
        self.outbound
            .send(Outbound::Close(code))
            .map_err(|_| Disconnected)
    }
}

/// Counts for status reporting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistrySnapshot {
    pub clients: usize,
    pub scoped_clients: usize,
}

/// Currently connected clients
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: HashMap<ClientId, Client>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a client. Returns false if its id is already registered.
    pub fn add(&mut self, client: Client) -> bool {
        if self.clients.contains_key(&client.id) {
            return false;
        }
        self.clients.insert(client.id, client);
        true
    }

    /// Remove a client; removing an unknown id is a no-op
    pub fn remove(&mut self, id: &ClientId) -> Option<Client> {
        self.clients.remove(id)
    }

    pub fn for_each(&self, mut f: impl FnMut(&Client)) {
        self.clients.values().for_each(|c| f(c));
    }

    pub fn iter(&self) -> impl Iterator<Item = &Client> {
        self.clients.values()
    }

    /// Remove and return every client
    pub fn drain(&mut self) -> Vec<Client> {
        self.clients.drain().map(|(_, c)| c).collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn snapshot(&self) -> RegistrySnapshot {
        RegistrySnapshot {
            clients: self.clients.len(),
            scoped_clients: self.iter().filter(|c| c.auth.is_scoped()).count(),
        }
    }
}
