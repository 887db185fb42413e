//! Session bootstrap against the tracking backend
//!
//! The backend issues a session cookie in exchange for the relay account's
//! email and password. That cookie is what the upstream stream request
//! presents.

use std::time::Duration;

use async_trait::async_trait;
use fleet_core::{Credential, SessionProvider};
use reqwest::header::SET_COOKIE;
use reqwest::Client;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::error::TrackerResult;
use crate::with_trailing_slash;

/// Name of the backend's session cookie
pub const SESSION_COOKIE: &str = "JSESSIONID";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Logs in over HTTP to obtain the upstream session cookie
#[derive(Debug, Clone)]
pub struct HttpSessionProvider {
    client: Client,
    base_url: Url,
    email: String,
    password: String,
}

impl HttpSessionProvider {
    pub fn new(
        base_url: &str,
        email: impl Into<String>,
        password: impl Into<String>,
    ) -> TrackerResult<Self> {
        let client = Client::builder().timeout(DEFAULT_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: with_trailing_slash(Url::parse(base_url)?),
            email: email.into(),
            password: password.into(),
        })
    }

    /// `POST api/session`, returning the session cookie if one was issued
    #[instrument(skip(self), fields(base_url = %self.base_url))]
    pub async fn login(&self) -> TrackerResult<Option<Credential>> {
        let url = self.base_url.join("api/session")?;
        let response = self
            .client
            .post(url)
            .form(&[("email", self.email.as_str()), ("password", self.password.as_str())])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            warn!(status = status.as_u16(), "Session request rejected");
            return Ok(None);
        }

        let cookie = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find_map(|v| cookie_value(v, SESSION_COOKIE));

        match cookie {
            Some(value) => {
                debug!("Session established");
                Ok(Some(Credential::Cookie {
                    name: SESSION_COOKIE.to_string(),
                    value,
                }))
            }
            None => {
                warn!("Session response carried no session cookie");
                Ok(None)
            }
        }
    }
}

#[async_trait]
impl SessionProvider for HttpSessionProvider {
    async fn credential(&self) -> Result<Option<Credential>, String> {
        self.login().await.map_err(|e| e.to_string())
    }
}

/// Value of cookie `name` in a `Set-Cookie` header
fn cookie_value(header: &str, name: &str) -> Option<String> {
    let pair = header.split(';').next()?;
    let (key, value) = pair.split_once('=')?;
    (key.trim() == name && !value.trim().is_empty()).then(|| value.trim().to_string())
}
