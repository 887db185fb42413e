//! Device references and upstream credentials

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A raw device identifier found inside an upstream entity.
///
/// Upstream ids are numeric and hardware ids are strings, but a reference
/// may carry either form, so numbers are kept in their canonical decimal
/// text and compared as strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceRef(String);

impl DeviceRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Build a reference from a JSON scalar.
    ///
    /// Returns `None` for null, booleans, containers and empty strings.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => Some(Self(canonical_number(n))),
            Value::String(s) if !s.trim().is_empty() => Some(Self(s.trim().to_string())),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Largest float magnitude below which every integer is exactly representable
const MAX_EXACT_FLOAT_INT: f64 = 9_007_199_254_740_992.0;

// `10.0` and `10` name the same device
fn canonical_number(n: &serde_json::Number) -> String {
    if n.is_f64() {
        if let Some(f) = n.as_f64() {
            if f.fract() == 0.0 && f.abs() < MAX_EXACT_FLOAT_INT {
                return (f as i64).to_string();
            }
        }
    }
    n.to_string()
}

impl fmt::Display for DeviceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<i64> for DeviceRef {
    fn from(id: i64) -> Self {
        Self(id.to_string())
    }
}

impl From<&str> for DeviceRef {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Privileged credential used to open the upstream stream
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Session cookie, sent as `Cookie: <name>=<value>`
    Cookie { name: String, value: String },
    /// Bearer token, sent as `Authorization: Bearer <token>`
    Bearer(String),
}

impl Credential {
    /// Header name and value to attach to the upstream request
    pub fn header(&self) -> (&'static str, String) {
        match self {
            Credential::Cookie { name, value } => ("Cookie", format!("{}={}", name, value)),
            Credential::Bearer(token) => ("Authorization", format!("Bearer {}", token)),
        }
    }
}

// Secrets stay out of logs.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Cookie { name, .. } => write!(f, "Cookie({}=***)", name),
            Credential::Bearer(_) => write!(f, "Bearer(***)"),
        }
    }
}
