//! Relay hub task
//!
//! One task owns the client registry and handles every command in arrival
//! order. Fan-out for an upstream message finishes before the next command
//! is taken, so each client sees messages in upstream order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use fleet_core::{RelayError, RelayResult};
use fleet_frame::CloseCode;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::fanout::FanOut;
use crate::registry::{Client, ClientId, ClientRegistry, RegistrySnapshot};

/// Counters shared with status reporting
#[derive(Debug, Default)]
pub struct RelayStats {
    messages_relayed: AtomicU64,
}

impl RelayStats {
    pub fn messages_relayed(&self) -> u64 {
        self.messages_relayed.load(Ordering::Relaxed)
    }
}

/// Commands processed by the hub
#[derive(Debug)]
pub enum HubCommand {
    Register(Client),
    Unregister(ClientId),
    Upstream(String),
    Snapshot(oneshot::Sender<RegistrySnapshot>),
    /// Close every client with the code and empty the registry
    CloseAll(CloseCode),
}

/// Cloneable handle for sending commands to the hub
#[derive(Debug, Clone)]
pub struct HubHandle {
    tx: mpsc::UnboundedSender<HubCommand>,
}

impl HubHandle {
    fn send(&self, command: HubCommand) -> RelayResult<()> {
        self.tx.send(command).map_err(|_| RelayError::HubClosed)
    }

    pub fn register(&self, client: Client) -> RelayResult<()> {
        self.send(HubCommand::Register(client))
    }

    pub fn unregister(&self, id: ClientId) -> RelayResult<()> {
        self.send(HubCommand::Unregister(id))
    }

    /// Queue an upstream message for fan-out
    pub fn upstream(&self, message: String) -> RelayResult<()> {
        self.send(HubCommand::Upstream(message))
    }

    pub fn close_all(&self, code: CloseCode) -> RelayResult<()> {
        self.send(HubCommand::CloseAll(code))
    }

    /// Registry counts, taken after every command queued before this call
    pub async fn snapshot(&self) -> RelayResult<RegistrySnapshot> {
        let (tx, rx) = oneshot::channel();
        self.send(HubCommand::Snapshot(tx))?;
        rx.await.map_err(|_| RelayError::HubClosed)
    }
}

struct Hub {
    registry: ClientRegistry,
    fanout: FanOut,
    stats: Arc<RelayStats>,
}

impl Hub {
    async fn handle(&mut self, command: HubCommand) {
        match command {
            HubCommand::Register(client) => {
                let id = client.id;
                let tenant = client
                    .auth
                    .tenant_id
                    .as_ref()
                    .map(|t| t.to_string())
                    .unwrap_or_default();
                let role = client.auth.role;
                if self.registry.add(client) {
                    info!(
                        client_id = %id,
                        tenant = %tenant,
                        role = %role,
                        clients = self.registry.len(),
                        "Client registered"
                    );
                }
            }
            HubCommand::Unregister(id) => {
                if let Some(client) = self.registry.remove(&id) {
                    let connected_secs = (Utc::now() - client.connected_at).num_seconds();
                    info!(
                        client_id = %id,
                        connected_secs,
                        clients = self.registry.len(),
                        "Client removed"
                    );
                }
            }
            HubCommand::Upstream(message) => {
                let report = self.fanout.dispatch(&message, &mut self.registry).await;
                self.stats.messages_relayed.fetch_add(1, Ordering::Relaxed);
                debug!(
                    delivered = report.delivered,
                    skipped = report.skipped,
                    pruned = report.pruned.len(),
                    "Message relayed"
                );
            }
            HubCommand::Snapshot(reply) => {
                let _ = reply.send(self.registry.snapshot());
            }
            HubCommand::CloseAll(code) => {
                let clients = self.registry.drain();
                info!(count = clients.len(), code = u16::from(code), "Closing all clients");
                for client in clients {
                    let _ = client.close(code);
                }
            }
        }
    }
}

/// Spawn the hub task.
///
/// The task ends once every [`HubHandle`] has been dropped.
pub fn spawn_hub(fanout: FanOut, stats: Arc<RelayStats>) -> (HubHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut hub = Hub {
        registry: ClientRegistry::new(),
        fanout,
        stats,
    };

    let task = tokio::spawn(async move {
        while let Some(command) = rx.recv().await {
            hub.handle(command).await;
        }
        debug!("Relay hub stopped");
    });

    (HubHandle { tx }, task)
}
