//! Session token verification
//!
//! Viewer tokens are HS256 JWTs issued by the dashboard's session service.

use std::collections::HashSet;

use fleet_core::{AuthContext, AuthError, Role, TenantId, TokenVerifier};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

/// Claims carried by a viewer session token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sub: String,
    #[serde(rename = "tenantId", default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    /// Expiry, seconds since the epoch
    pub exp: u64,
}

/// Sign claims with a shared secret (HS256)
pub fn sign_token(secret: &[u8], claims: &SessionClaims) -> Result<String, AuthError> {
    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        claims,
        &EncodingKey::from_secret(secret),
    )
    .map_err(|e| AuthError::Invalid(e.to_string()))
}

/// [`TokenVerifier`] for HS256 session tokens
pub struct JwtTokenVerifier {
    key: DecodingKey,
    validation: Validation,
    admin_roles: HashSet<String>,
}

impl JwtTokenVerifier {
    pub fn new(
        secret: &[u8],
        admin_roles: impl IntoIterator<Item = String>,
        leeway_secs: u64,
    ) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = leeway_secs;
        Self {
            key: DecodingKey::from_secret(secret),
            validation,
            admin_roles: admin_roles.into_iter().collect(),
        }
    }
}

impl TokenVerifier for JwtTokenVerifier {
    fn verify(&self, token: &str) -> Result<AuthContext, AuthError> {
        if token.is_empty() {
            return Err(AuthError::Missing);
        }

        let data = jsonwebtoken::decode::<SessionClaims>(token, &self.key, &self.validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Invalid(e.to_string()),
            })?;
        let claims = data.claims;

        let role = match claims.role.as_deref() {
            Some(role) if self.admin_roles.contains(role) => Role::Admin,
            _ => Role::User,
        };
        let tenant = claims
            .tenant_id
            .filter(|t| !t.is_empty())
            .map(TenantId::new);

        Ok(AuthContext::new(claims.sub, tenant, role))
    }
}
