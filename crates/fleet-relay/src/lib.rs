//! fleet-relay - Realtime multi-tenant telemetry relay
//!
//! Holds one privileged streaming connection to the tracking backend and
//! fans every message out to the connected viewers, each restricted to its
//! own tenant's entities.
//!
//! # Components
//!
//! - [`UpstreamConnector`] - the single upstream connection, with backoff
//! - [`Gateway`] - hand-rolled upgrade handshake and per-connection tasks
//! - [`ClientRegistry`] - connected viewers, owned by the hub task
//! - [`FanOut`] - per-tenant filtering and delivery
//! - [`OwnershipResolver`] - entity to tenant resolution
//! - [`RelayService`] - ties them together with `start` / `stop`
//!
//! # Usage
//!
//! ```ignore
//! use fleet_relay::{OwnershipResolver, RelayService};
//!
//! let resolver = OwnershipResolver::from_registry(registry);
//! let relay = RelayService::new(config, verifier, session, resolver);
//! let addr = relay.start().await?;
//! // ...
//! relay.stop().await;
//! ```

pub mod auth;
pub mod collaborators;
pub mod error;
pub mod fanout;
pub mod gateway;
pub mod hub;
pub mod registry;
pub mod resolver;
pub mod service;
pub mod status;
pub mod upstream;

pub use auth::{sign_token, JwtTokenVerifier, SessionClaims};
pub use collaborators::{DeviceOwnership, StaticDeviceRegistry, StaticSessionProvider};
pub use error::{ConnectorError, HandshakeError};
pub use fanout::{DispatchReport, FanOut, ENTITY_FIELDS};
pub use gateway::{Gateway, GatewayConfig, READY_MESSAGE};
pub use hub::{HubHandle, RelayStats};
pub use registry::{Client, ClientId, ClientRegistry, RegistrySnapshot};
pub use resolver::{extract_device_references, OwnershipResolver, EXTRACTORS};
pub use service::{RelayConfig, RelayService, RelayStatus};
pub use status::status_router;
pub use upstream::{
    streaming_url, Backoff, UpstreamConfig, UpstreamConnector, UpstreamPhase, UpstreamStatus,
};
