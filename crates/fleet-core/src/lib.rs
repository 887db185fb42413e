//! fleet-core - Core traits and types for the fleet telemetry relay
//!
//! This crate provides the abstractions shared by the relay and by the
//! adapters that talk to the external systems around it:
//!
//! - [`TokenVerifier`] - decodes and verifies a downstream viewer's session token
//! - [`SessionProvider`] - obtains the privileged credential for the upstream feed
//! - [`DeviceRegistry`] - ownership lookups against the device/vehicle registry
//! - [`TenantLookup`] - one stage of tenant resolution, composed by the relay

pub mod collaborators;
pub mod error;
pub mod models;

pub use collaborators::{
    ByUniqueId, ByUpstreamId, DeviceRegistry, SessionProvider, TenantLookup, TokenVerifier,
};
pub use error::{AuthError, LookupError, LookupResult, RelayError, RelayResult};
pub use models::*;
