//! Relay service lifecycle
//!
//! [`RelayService`] owns everything that lives for the duration of a run:
//! the hub task, the upstream connector and the gateway accept loop. It is
//! built once by the process entry point; tests build as many as they like.

use std::net::SocketAddr;
use std::sync::Arc;

use fleet_core::{RelayError, RelayResult, SessionProvider, TokenVerifier};
use fleet_frame::CloseCode;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::fanout::FanOut;
use crate::gateway::{Gateway, GatewayConfig};
use crate::hub::{spawn_hub, HubHandle, RelayStats};
use crate::registry::RegistrySnapshot;
use crate::resolver::OwnershipResolver;
use crate::upstream::{UpstreamConfig, UpstreamConnector, UpstreamPhase, UpstreamStatus};

/// Everything the relay needs to run
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Downstream listen address; port 0 picks a free port
    pub listen: SocketAddr,
    pub gateway: GatewayConfig,
    pub upstream: UpstreamConfig,
}

/// Upstream section of [`RelayStatus`]
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamReport {
    pub phase: UpstreamPhase,
    pub attempt: u32,
    pub next_retry_ms: Option<u64>,
}

impl From<UpstreamStatus> for UpstreamReport {
    fn from(status: UpstreamStatus) -> Self {
        Self {
            phase: status.phase,
            attempt: status.attempt,
            next_retry_ms: status.next_retry.map(|d| d.as_millis() as u64),
        }
    }
}

/// Read-only status served by the status router
#[derive(Debug, Clone, Serialize)]
pub struct RelayStatus {
    pub clients: usize,
    pub scoped_clients: usize,
    pub upstream: UpstreamReport,
    pub messages_relayed: u64,
}

struct Running {
    hub: HubHandle,
    hub_task: JoinHandle<()>,
    connector: UpstreamConnector,
    gateway_task: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
    local_addr: SocketAddr,
}

/// The relay: one upstream connection fanned out to many viewers
pub struct RelayService {
    config: RelayConfig,
    verifier: Arc<dyn TokenVerifier>,
    session: Arc<dyn SessionProvider>,
    resolver: Arc<OwnershipResolver>,
    stats: Arc<RelayStats>,
    running: Mutex<Option<Running>>,
}

impl RelayService {
    pub fn new(
        config: RelayConfig,
        verifier: Arc<dyn TokenVerifier>,
        session: Arc<dyn SessionProvider>,
        resolver: OwnershipResolver,
    ) -> Self {
        Self {
            config,
            verifier,
            session,
            resolver: Arc::new(resolver),
            stats: Arc::new(RelayStats::default()),
            running: Mutex::new(None),
        }
    }

    /// Bind the downstream listener, start the hub and connect upstream.
    ///
    /// Returns the bound address.
    pub async fn start(&self) -> RelayResult<SocketAddr> {
        if self.running.lock().is_some() {
            return Err(RelayError::Lifecycle("relay already running".into()));
        }

        let listener = TcpListener::bind(self.config.listen).await?;
        let local_addr = listener.local_addr()?;

        let (hub, hub_task) = spawn_hub(FanOut::new(self.resolver.clone()), self.stats.clone());
        let connector = UpstreamConnector::new(
            self.config.upstream.clone(),
            self.session.clone(),
            hub.clone(),
        );

        let (shutdown, shutdown_rx) = watch::channel(false);
        let gateway = Arc::new(Gateway::new(
            self.config.gateway.clone(),
            self.verifier.clone(),
            hub.clone(),
        ));
        let gateway_task = tokio::spawn(gateway.serve(listener, shutdown_rx));

        let mut running = self.running.lock();
        if running.is_some() {
            // Lost a race with a concurrent start
            let _ = shutdown.send(true);
            hub_task.abort();
            return Err(RelayError::Lifecycle("relay already running".into()));
        }

        connector.ensure_connection();
        info!(
            listen = %local_addr,
            path = %self.config.gateway.path,
            upstream = %connector.url(),
            "Relay started"
        );

        *running = Some(Running {
            hub,
            hub_task,
            connector,
            gateway_task,
            shutdown,
            local_addr,
        });
        Ok(local_addr)
    }

    /// Close upstream, close every client with 1001 and stop accepting.
    ///
    /// Calling this on a stopped relay does nothing.
    pub async fn stop(&self) {
        let running = self.running.lock().take();
        let Some(running) = running else {
            return;
        };

        running.connector.stop();
        // Stop accepting first so no handshake can register after the drain
        let _ = running.shutdown.send(true);
        let _ = running.gateway_task.await;
        let _ = running.hub.close_all(CloseCode::Away);

        // Commands are handled in order, so this returns after CloseAll
        let _ = running.hub.snapshot().await;
        running.hub_task.abort();

        info!(listen = %running.local_addr, "Relay stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.local_addr)
    }

    /// Registry counts
    pub async fn snapshot(&self) -> RelayResult<RegistrySnapshot> {
        let hub = self
            .running
            .lock()
            .as_ref()
            .map(|r| r.hub.clone())
            .ok_or(RelayError::HubClosed)?;
        hub.snapshot().await
    }

    pub fn upstream_status(&self) -> Option<UpstreamStatus> {
        self.running.lock().as_ref().map(|r| r.connector.status())
    }

    /// Ask the connector to connect now if it is idle
    pub fn ensure_upstream(&self) {
        if let Some(running) = self.running.lock().as_ref() {
            running.connector.ensure_connection();
        }
    }

    pub fn messages_relayed(&self) -> u64 {
        self.stats.messages_relayed()
    }

    pub async fn status(&self) -> RelayStatus {
        let registry = self.snapshot().await.unwrap_or_default();
        let upstream = self.upstream_status().unwrap_or(UpstreamStatus {
            phase: UpstreamPhase::Stopped,
            attempt: 0,
            next_retry: None,
        });

        RelayStatus {
            clients: registry.clients,
            scoped_clients: registry.scoped_clients,
            upstream: upstream.into(),
            messages_relayed: self.stats.messages_relayed(),
        }
    }
}
