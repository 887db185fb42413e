//! Ownership lookups over HTTP

use std::time::Duration;

use async_trait::async_trait;
use fleet_core::{DeviceRef, DeviceRegistry, LookupResult, TenantId};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, instrument};
use url::Url;

use crate::error::{TrackerError, TrackerResult};
use crate::with_trailing_slash;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct OwnershipResponse {
    #[serde(rename = "tenantId", default)]
    tenant_id: Option<String>,
}

/// [`DeviceRegistry`] backed by the dashboard's ownership endpoint.
///
/// `GET devices/ownership?upstreamId=..` (or `uniqueId=..`) answers
/// `200 {"tenantId": ..}` or `404` when the device is unknown.
#[derive(Debug, Clone)]
pub struct HttpDeviceRegistry {
    client: Client,
    base_url: Url,
}

impl HttpDeviceRegistry {
    pub fn new(base_url: &str) -> TrackerResult<Self> {
        Self::with_bearer_token(base_url, None)
    }

    /// Registry client that sends `Authorization: Bearer <token>` when a token is given
    pub fn with_bearer_token(base_url: &str, token: Option<&str>) -> TrackerResult<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(token) = token {
            let value = reqwest::header::HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| TrackerError::ParseError(format!("Invalid auth token: {}", e)))?;
            headers.insert(reqwest::header::AUTHORIZATION, value);
        }

        let client = Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            base_url: with_trailing_slash(Url::parse(base_url)?),
        })
    }

    #[instrument(skip(self, reference), fields(reference = %reference))]
    async fn lookup(&self, param: &str, reference: &DeviceRef) -> TrackerResult<Option<TenantId>> {
        let mut url = self.base_url.join("devices/ownership")?;
        url.query_pairs_mut().append_pair(param, reference.as_str());

        let response = self.client.get(url).send().await?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            debug!(param, "Device not registered");
            return Ok(None);
        }
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(TrackerError::server_error(status.as_u16(), message));
        }

        let body = response.text().await?;
        let parsed: OwnershipResponse =
            serde_json::from_str(&body).map_err(|e| TrackerError::ParseError(e.to_string()))?;
        Ok(parsed
            .tenant_id
            .filter(|t| !t.is_empty())
            .map(TenantId::new))
    }
}

#[async_trait]
impl DeviceRegistry for HttpDeviceRegistry {
    async fn tenant_by_upstream_id(&self, reference: &DeviceRef) -> LookupResult<Option<TenantId>> {
        Ok(self.lookup("upstreamId", reference).await?)
    }

    async fn tenant_by_unique_id(&self, reference: &DeviceRef) -> LookupResult<Option<TenantId>> {
        Ok(self.lookup("uniqueId", reference).await?)
    }
}
