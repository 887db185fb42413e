//! Ownership resolution
//!
//! Maps an upstream entity to the tenant owning its device. Entities carry
//! their device reference in one of several shapes; [`EXTRACTORS`] lists
//! them in priority order, and each candidate is run through the lookup
//! stages until one of them names a tenant.

use std::collections::HashMap;
use std::sync::Arc;

use fleet_core::{
    ByUniqueId, ByUpstreamId, DeviceRef, DeviceRegistry, TenantId, TenantLookup,
};
use serde_json::Value;
use tracing::{debug, warn};

/// One recognized device-reference shape: a field path into the entity
#[derive(Debug, Clone, Copy)]
pub struct Extractor {
    pub name: &'static str,
    path: &'static [&'static str],
}

impl Extractor {
    const fn new(name: &'static str, path: &'static [&'static str]) -> Self {
        Self { name, path }
    }

    /// The reference found at this extractor's path, if any
    pub fn extract(&self, entity: &Value) -> Option<DeviceRef> {
        let mut current = entity;
        for key in self.path {
            current = current.as_object()?.get(*key)?;
        }
        DeviceRef::from_json(current)
    }
}

/// Recognized shapes, highest priority first
pub const EXTRACTORS: &[Extractor] = &[
    Extractor::new("deviceId", &["deviceId"]),
    Extractor::new("device_id", &["device_id"]),
    Extractor::new("deviceID", &["deviceID"]),
    Extractor::new("id", &["id"]),
    Extractor::new("uniqueId", &["uniqueId"]),
    Extractor::new("device.id", &["device", "id"]),
    Extractor::new("device.deviceId", &["device", "deviceId"]),
    Extractor::new("device.uniqueId", &["device", "uniqueId"]),
    Extractor::new("position.deviceId", &["position", "deviceId"]),
];

/// Every candidate device reference in `entity`, in priority order.
///
/// A bare scalar entity is its own reference. Repeated values are kept
/// only at their first position.
pub fn extract_device_references(entity: &Value) -> Vec<DeviceRef> {
    if !entity.is_object() {
        return DeviceRef::from_json(entity).into_iter().collect();
    }

    let mut refs: Vec<DeviceRef> = Vec::new();
    for extractor in EXTRACTORS {
        if let Some(r) = extractor.extract(entity) {
            if !refs.contains(&r) {
                refs.push(r);
            }
        }
    }
    refs
}

/// Per-message memo of reference resolutions
pub type ResolutionCache = HashMap<DeviceRef, Option<TenantId>>;

/// Resolves entities to tenants through an ordered list of lookup stages
pub struct OwnershipResolver {
    stages: Vec<Arc<dyn TenantLookup>>,
}

impl OwnershipResolver {
    pub fn new(stages: Vec<Arc<dyn TenantLookup>>) -> Self {
        Self { stages }
    }

    /// Standard two-stage resolver: exact upstream id, then hardware unique id
    pub fn from_registry(registry: Arc<dyn DeviceRegistry>) -> Self {
        Self::new(vec![
            Arc::new(ByUpstreamId(registry.clone())),
            Arc::new(ByUniqueId(registry)),
        ])
    }

    /// Resolve one reference; the first stage that names a tenant wins.
    ///
    /// A failing stage is logged and counts as no match.
    pub async fn resolve_reference(&self, reference: &DeviceRef) -> Option<TenantId> {
        for stage in &self.stages {
            match stage.lookup(reference).await {
                Ok(Some(tenant)) => {
                    debug!(
                        reference = %reference,
                        stage = stage.name(),
                        tenant = %tenant,
                        "Resolved device"
                    );
                    return Some(tenant);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        reference = %reference,
                        stage = stage.name(),
                        error = %e,
                        "Ownership lookup failed"
                    );
                }
            }
        }
        None
    }

    /// Tenant owning `entity`, trying each candidate reference in order
    pub async fn resolve_tenant(&self, entity: &Value) -> Option<TenantId> {
        self.resolve_tenant_cached(entity, &mut ResolutionCache::new())
            .await
    }

    /// Like [`resolve_tenant`](Self::resolve_tenant), reusing earlier results in `cache`
    pub async fn resolve_tenant_cached(
        &self,
        entity: &Value,
        cache: &mut ResolutionCache,
    ) -> Option<TenantId> {
        for reference in extract_device_references(entity) {
            let resolved = match cache.get(&reference) {
                Some(hit) => hit.clone(),
                None => {
                    let resolved = self.resolve_reference(&reference).await;
                    cache.insert(reference, resolved.clone());
                    resolved
                }
            };
            if resolved.is_some() {
                return resolved;
            }
        }
        None
    }
}
