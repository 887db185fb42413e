//! Per-client fan-out of upstream messages
//!
//! Unscoped clients get every message as it arrived. Tenant-scoped clients
//! get a derived copy whose entity arrays only hold their tenant's
//! entities, or nothing at all when none of the entities is theirs.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use fleet_core::TenantId;
use fleet_frame::encode_text;
use serde_json::{Map, Value};
use tracing::debug;

use crate::registry::{ClientId, ClientRegistry};
use crate::resolver::{OwnershipResolver, ResolutionCache};

/// Top-level array fields that carry entities
pub const ENTITY_FIELDS: [&str; 4] = ["positions", "events", "devices", "statistics"];

/// Outcome of dispatching one message
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    /// Clients that had a frame queued
    pub delivered: usize,
    /// Scoped clients with nothing to receive for this message
    pub skipped: usize,
    /// Clients removed because their connection was gone
    pub pruned: Vec<ClientId>,
}

/// Upstream message, parsed on first use
struct LazyMessage<'a> {
    raw: &'a str,
    parsed: Option<Option<Map<String, Value>>>,
}

impl<'a> LazyMessage<'a> {
    fn new(raw: &'a str) -> Self {
        Self { raw, parsed: None }
    }

    /// The message as a JSON object; `None` if it is not one
    fn object(&mut self) -> Option<&Map<String, Value>> {
        let raw = self.raw;
        self.parsed
            .get_or_insert_with(|| match serde_json::from_str(raw) {
                Ok(Value::Object(map)) => Some(map),
                Ok(_) => {
                    debug!("Upstream message is not an object; scoped clients skip it");
                    None
                }
                Err(e) => {
                    debug!(error = %e, "Upstream message is not JSON; scoped clients skip it");
                    None
                }
            })
            .as_ref()
    }
}

/// Computes and delivers per-client payloads
pub struct FanOut {
    resolver: Arc<OwnershipResolver>,
}

impl FanOut {
    pub fn new(resolver: Arc<OwnershipResolver>) -> Self {
        Self { resolver }
    }

    /// Deliver `raw` to every registered client, pruning dead ones.
    ///
    /// Filtered payloads are computed once per tenant and ownership
    /// lookups are memoized for the duration of this call.
    pub async fn dispatch(&self, raw: &str, registry: &mut ClientRegistry) -> DispatchReport {
        let mut report = DispatchReport::default();
        let mut message = LazyMessage::new(raw);
        let mut cache = ResolutionCache::new();
        let mut per_tenant: HashMap<TenantId, Option<Bytes>> = HashMap::new();
        let mut raw_frame: Option<Bytes> = None;

        for client in registry.iter() {
            let frame = match client.auth.scope() {
                None => raw_frame
                    .get_or_insert_with(|| Bytes::from(encode_text(raw)))
                    .clone(),
                Some(tenant) => {
                    if !per_tenant.contains_key(tenant) {
                        let filtered = match message.object() {
                            Some(object) => {
                                filter_for_tenant(&self.resolver, object, tenant, &mut cache).await
                            }
                            None => None,
                        };
                        per_tenant.insert(
                            tenant.clone(),
                            filtered.map(|payload| Bytes::from(encode_text(&payload))),
                        );
                    }
                    match per_tenant.get(tenant).cloned().flatten() {
                        Some(frame) => frame,
                        None => {
                            report.skipped += 1;
                            continue;
                        }
                    }
                }
            };

            if client.deliver(frame).is_ok() {
                report.delivered += 1;
            } else {
                report.pruned.push(client.id);
            }
        }

        for id in &report.pruned {
            debug!(client_id = %id, "Delivery failed, removing client");
            registry.remove(id);
        }

        report
    }
}

/// The tenant's view of `object`, serialized, or `None` if it holds no
/// entity owned by `tenant`.
///
/// Every entity array present is emitted, possibly empty. Other arrays are
/// dropped; non-array fields are copied as-is.
pub async fn filter_for_tenant(
    resolver: &OwnershipResolver,
    object: &Map<String, Value>,
    tenant: &TenantId,
    cache: &mut ResolutionCache,
) -> Option<String> {
    let mut out = Map::new();
    let mut matched = false;

    for (key, value) in object {
        match value {
            Value::Array(items) if ENTITY_FIELDS.contains(&key.as_str()) => {
                let mut kept = Vec::new();
                for item in items {
                    if resolver.resolve_tenant_cached(item, cache).await.as_ref() == Some(tenant) {
                        kept.push(item.clone());
                    }
                }
                matched |= !kept.is_empty();
                out.insert(key.clone(), Value::Array(kept));
            }
            Value::Array(_) => {}
            other => {
                out.insert(key.clone(), other.clone());
            }
        }
    }

    matched.then(|| Value::Object(out).to_string())
}
