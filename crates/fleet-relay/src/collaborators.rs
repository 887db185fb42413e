//! In-process collaborator implementations
//!
//! Config-backed registry and session provider, used for small deployments
//! and throughout the tests.

use std::collections::HashMap;

use async_trait::async_trait;
use fleet_core::{Credential, DeviceRef, DeviceRegistry, LookupResult, SessionProvider, TenantId};
use serde::Deserialize;

/// Ownership of one device, as listed in configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceOwnership {
    /// Id the tracking backend uses for the device
    #[serde(default)]
    pub upstream_id: Option<String>,
    /// Hardware unique id (IMEI or similar)
    #[serde(default)]
    pub unique_id: Option<String>,
    pub tenant: TenantId,
}

/// Device registry held in memory, indexed both ways
#[derive(Debug, Default)]
pub struct StaticDeviceRegistry {
    by_upstream_id: HashMap<String, TenantId>,
    by_unique_id: HashMap<String, TenantId>,
}

impl StaticDeviceRegistry {
    pub fn new(devices: impl IntoIterator<Item = DeviceOwnership>) -> Self {
        let mut registry = Self::default();
        for device in devices {
            if let Some(id) = device.upstream_id {
                registry.by_upstream_id.insert(id, device.tenant.clone());
            }
            if let Some(id) = device.unique_id {
                registry.by_unique_id.insert(id, device.tenant);
            }
        }
        registry
    }

    pub fn len(&self) -> usize {
        self.by_upstream_id.len().max(self.by_unique_id.len())
    }

    pub fn is_empty(&self) -> bool {
        self.by_upstream_id.is_empty() && self.by_unique_id.is_empty()
    }
}

#[async_trait]
impl DeviceRegistry for StaticDeviceRegistry {
    async fn tenant_by_upstream_id(&self, reference: &DeviceRef) -> LookupResult<Option<TenantId>> {
        Ok(self.by_upstream_id.get(reference.as_str()).cloned())
    }

    async fn tenant_by_unique_id(&self, reference: &DeviceRef) -> LookupResult<Option<TenantId>> {
        Ok(self.by_unique_id.get(reference.as_str()).cloned())
    }
}

/// Session provider that always hands out the same credential
#[derive(Debug, Clone)]
pub struct StaticSessionProvider {
    credential: Option<Credential>,
}

impl StaticSessionProvider {
    pub fn new(credential: Credential) -> Self {
        Self {
            credential: Some(credential),
        }
    }

    /// Provider that never has a credential; the connector keeps retrying
    pub fn unavailable() -> Self {
        Self { credential: None }
    }
}

#[async_trait]
impl SessionProvider for StaticSessionProvider {
    async fn credential(&self) -> Result<Option<Credential>, String> {
        Ok(self.credential.clone())
    }
}
