//! TOML configuration for the relay daemon

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use fleet_core::{Credential, DeviceRegistry, RelayError, SessionProvider};
use fleet_relay::{
    Backoff, DeviceOwnership, GatewayConfig, JwtTokenVerifier, RelayConfig, StaticDeviceRegistry,
    StaticSessionProvider, UpstreamConfig,
};
use fleet_tracker::{HttpDeviceRegistry, HttpSessionProvider, SESSION_COOKIE};
use serde::Deserialize;

/// Overrides `auth.jwt_secret`
pub const JWT_SECRET_ENV: &str = "FLEET_RELAY_JWT_SECRET";
/// Overrides `upstream.session.password`
pub const UPSTREAM_PASSWORD_ENV: &str = "FLEET_UPSTREAM_PASSWORD";

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8082))
}

fn default_socket_path() -> String {
    "/api/socket".to_string()
}

fn default_max_frame_bytes() -> usize {
    64 * 1024
}

fn default_max_handshake_bytes() -> usize {
    8 * 1024
}

fn default_reconnect_floor_ms() -> u64 {
    2_000
}

fn default_reconnect_ceiling_ms() -> u64 {
    60_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_admin_roles() -> Vec<String> {
    vec!["admin".to_string()]
}

fn default_leeway_secs() -> u64 {
    30
}

/// `[server]` - downstream listener
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Only path accepting upgrades
    #[serde(default = "default_socket_path")]
    pub path: String,
    /// Address for the status router; disabled when absent
    #[serde(default)]
    pub status_listen: Option<SocketAddr>,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    #[serde(default = "default_max_handshake_bytes")]
    pub max_handshake_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            path: default_socket_path(),
            status_listen: None,
            max_frame_bytes: default_max_frame_bytes(),
            max_handshake_bytes: default_max_handshake_bytes(),
        }
    }
}

/// `[upstream.session]` - how the relay authenticates upstream
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Fixed session cookie value, used instead of logging in
    #[serde(default)]
    pub token: Option<String>,
}

/// `[upstream]` - the tracking backend
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamSection {
    pub base_url: String,
    #[serde(default = "default_socket_path")]
    pub socket_path: String,
    #[serde(default = "default_reconnect_floor_ms")]
    pub reconnect_floor_ms: u64,
    #[serde(default = "default_reconnect_ceiling_ms")]
    pub reconnect_ceiling_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default)]
    pub session: SessionConfig,
}

/// `[auth]` - downstream token verification
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub jwt_secret: String,
    #[serde(default = "default_admin_roles")]
    pub admin_roles: Vec<String>,
    #[serde(default = "default_leeway_secs")]
    pub leeway_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            admin_roles: default_admin_roles(),
            leeway_secs: default_leeway_secs(),
        }
    }
}

/// `[registry]` - where device ownership comes from
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RegistryConfig {
    Static {
        #[serde(default)]
        devices: Vec<DeviceOwnership>,
    },
    Http {
        base_url: String,
        #[serde(default)]
        bearer_token: Option<String>,
    },
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig::Static {
            devices: Vec::new(),
        }
    }
}

/// Top-level daemon configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub upstream: UpstreamSection,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config file '{}'", path.display()))
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Let secrets from the environment replace values from the file
    pub fn apply_env_overrides(&mut self) {
        if let Ok(secret) = std::env::var(JWT_SECRET_ENV) {
            if !secret.is_empty() {
                self.auth.jwt_secret = secret;
            }
        }
        if let Ok(password) = std::env::var(UPSTREAM_PASSWORD_ENV) {
            if !password.is_empty() {
                self.upstream.session.password = Some(password);
            }
        }
    }

    /// Reject configurations the relay cannot run with
    pub fn validate(&self) -> Result<(), RelayError> {
        if !self.server.path.starts_with('/') {
            return Err(RelayError::Config(format!(
                "server.path must start with '/': {}",
                self.server.path
            )));
        }
        if !self.upstream.socket_path.starts_with('/') {
            return Err(RelayError::Config(format!(
                "upstream.socket_path must start with '/': {}",
                self.upstream.socket_path
            )));
        }
        if self.upstream.reconnect_floor_ms == 0 {
            return Err(RelayError::Config(
                "upstream.reconnect_floor_ms must be positive".into(),
            ));
        }
        if self.upstream.reconnect_floor_ms > self.upstream.reconnect_ceiling_ms {
            return Err(RelayError::Config(format!(
                "upstream.reconnect_floor_ms ({}) exceeds reconnect_ceiling_ms ({})",
                self.upstream.reconnect_floor_ms, self.upstream.reconnect_ceiling_ms
            )));
        }
        if self.auth.jwt_secret.is_empty() {
            return Err(RelayError::Config(format!(
                "auth.jwt_secret is required (or set {})",
                JWT_SECRET_ENV
            )));
        }

        let session = &self.upstream.session;
        let has_login = session.email.is_some() && session.password.is_some();
        if session.token.is_none() && !has_login {
            return Err(RelayError::Config(format!(
                "upstream.session needs either token or email and password \
                 (password may come from {})",
                UPSTREAM_PASSWORD_ENV
            )));
        }

        self.upstream_config().map(|_| ())
    }

    fn upstream_config(&self) -> Result<UpstreamConfig, RelayError> {
        let mut upstream = UpstreamConfig::new(&self.upstream.base_url, &self.upstream.socket_path)
            .map_err(|e| RelayError::Config(format!("upstream.base_url: {}", e)))?;
        upstream.backoff = Backoff::new(
            Duration::from_millis(self.upstream.reconnect_floor_ms),
            Duration::from_millis(self.upstream.reconnect_ceiling_ms),
        );
        upstream.connect_timeout = Duration::from_millis(self.upstream.connect_timeout_ms);
        Ok(upstream)
    }

    /// Settings for [`fleet_relay::RelayService`]
    pub fn relay_config(&self) -> Result<RelayConfig, RelayError> {
        Ok(RelayConfig {
            listen: self.server.listen,
            gateway: GatewayConfig {
                path: self.server.path.clone(),
                max_frame_bytes: self.server.max_frame_bytes,
                max_handshake_bytes: self.server.max_handshake_bytes,
            },
            upstream: self.upstream_config()?,
        })
    }

    pub fn token_verifier(&self) -> JwtTokenVerifier {
        JwtTokenVerifier::new(
            self.auth.jwt_secret.as_bytes(),
            self.auth.admin_roles.iter().cloned(),
            self.auth.leeway_secs,
        )
    }

    /// A fixed token wins over email/password login
    pub fn session_provider(&self) -> anyhow::Result<Arc<dyn SessionProvider>> {
        let session = &self.upstream.session;
        if let Some(token) = &session.token {
            return Ok(Arc::new(StaticSessionProvider::new(Credential::Cookie {
                name: SESSION_COOKIE.to_string(),
                value: token.clone(),
            })));
        }

        match (&session.email, &session.password) {
            (Some(email), Some(password)) => Ok(Arc::new(
                HttpSessionProvider::new(&self.upstream.base_url, email, password)
                    .context("Failed to create session provider")?,
            )),
            _ => anyhow::bail!("upstream.session has neither token nor email and password"),
        }
    }

    pub fn device_registry(&self) -> anyhow::Result<Arc<dyn DeviceRegistry>> {
        match &self.registry {
            RegistryConfig::Static { devices } => {
                Ok(Arc::new(StaticDeviceRegistry::new(devices.iter().cloned())))
            }
            RegistryConfig::Http {
                base_url,
                bearer_token,
            } => Ok(Arc::new(
                HttpDeviceRegistry::with_bearer_token(base_url, bearer_token.as_deref())
                    .context("Failed to create device registry client")?,
            )),
        }
    }
}
