//! Collaborator traits - the seams between the relay and external systems
//!
//! The relay never talks to the session issuer, the tracking backend's
//! login endpoint or the device registry directly. Each is reached through
//! one of the traits below so deployments (and tests) can plug in their own
//! implementation.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{AuthError, LookupResult};
use crate::models::{AuthContext, Credential, DeviceRef, TenantId};

/// Verifies the signed session token presented by a downstream viewer
pub trait TokenVerifier: Send + Sync {
    /// Decode and verify `token`, returning the viewer's context
    fn verify(&self, token: &str) -> Result<AuthContext, AuthError>;
}

/// Supplies the privileged credential for the upstream connection
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Obtain a credential.
    ///
    /// `Ok(None)` means no credential is available right now; the caller
    /// retries later. Errors are treated the same way but carry a cause
    /// worth logging.
    async fn credential(&self) -> Result<Option<Credential>, String>;
}

/// Ownership lookups against the external device/vehicle registry
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// Tenant owning the device whose upstream (tracking backend) id is `reference`
    async fn tenant_by_upstream_id(&self, reference: &DeviceRef) -> LookupResult<Option<TenantId>>;

    /// Tenant owning the device whose hardware unique id is `reference`
    async fn tenant_by_unique_id(&self, reference: &DeviceRef) -> LookupResult<Option<TenantId>>;
}

/// One stage of tenant resolution.
///
/// The relay composes stages with short-circuit OR: the first stage that
/// returns a tenant wins.
#[async_trait]
pub trait TenantLookup: Send + Sync {
    /// Stage name used in logs
    fn name(&self) -> &'static str;

    async fn lookup(&self, reference: &DeviceRef) -> LookupResult<Option<TenantId>>;
}

/// Stage that resolves a reference as an upstream device id
pub struct ByUpstreamId(pub Arc<dyn DeviceRegistry>);

#[async_trait]
impl TenantLookup for ByUpstreamId {
    fn name(&self) -> &'static str {
        "upstream_id"
    }

    async fn lookup(&self, reference: &DeviceRef) -> LookupResult<Option<TenantId>> {
        self.0.tenant_by_upstream_id(reference).await
    }
}

/// Stage that resolves a reference as a hardware unique id
pub struct ByUniqueId(pub Arc<dyn DeviceRegistry>);

#[async_trait]
impl TenantLookup for ByUniqueId {
    fn name(&self) -> &'static str {
        "unique_id"
    }

    async fn lookup(&self, reference: &DeviceRef) -> LookupResult<Option<TenantId>> {
        self.0.tenant_by_unique_id(reference).await
    }
}
