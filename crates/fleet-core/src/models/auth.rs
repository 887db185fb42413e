//! Viewer identity and tenant models

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque tenant identifier, resolved by the external registry
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub String);

impl TenantId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Role of an authenticated viewer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Administrative role: sees every tenant's entities
    Admin,
    /// Regular viewer: scoped to its tenant when it has one
    User,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::Admin => "admin",
            Role::User => "user",
        };
        f.write_str(s)
    }
}

/// Authenticated context attached to a downstream client.
///
/// A client is *tenant-scoped* when it carries a tenant and is not
/// administrative; every other client is unscoped and receives upstream
/// messages unmodified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthContext {
    /// Subject the token was issued to
    pub subject_id: String,
    /// Tenant the subject belongs to, if any
    pub tenant_id: Option<TenantId>,
    /// Role of the subject
    pub role: Role,
}

impl AuthContext {
    pub fn new(subject_id: impl Into<String>, tenant_id: Option<TenantId>, role: Role) -> Self {
        Self {
            subject_id: subject_id.into(),
            tenant_id,
            role,
        }
    }

    /// Tenant this client is restricted to, or `None` when unscoped
    pub fn scope(&self) -> Option<&TenantId> {
        match self.role {
            Role::Admin => None,
            Role::User => self.tenant_id.as_ref(),
        }
    }

    pub fn is_scoped(&self) -> bool {
        self.scope().is_some()
    }
}
