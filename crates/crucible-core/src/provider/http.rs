//! REST client for the GPU marketplace.

use super::{GpuProvider, InstanceStatus, Offer, OfferQuery, ProviderError, ProviderResult};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, error, info};

pub struct HttpGpuProvider {
    base_url: String,
    api_key: Option<String>,
    client: Client,
}

#[derive(Serialize)]
struct CreateInstanceBody<'a> {
    offer_id: &'a str,
    label: &'a str,
}

#[derive(Deserialize)]
struct CreateInstanceResponse {
    id: String,
}

impl HttpGpuProvider {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> ProviderResult<Self> {
        let client = Client::builder().timeout(timeout).build().map_err(|e| {
            ProviderError::Unavailable(format!("Failed to create HTTP client: {e}"))
        })?;
        Ok(Self { base_url: base_url.into().trim_end_matches('/').to_string(), api_key, client })
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> ProviderResult<Response> {
        self.authed(request).send().await.map_err(|e| {
            error!(error = %e, operation = what, "GPU provider request failed");
            ProviderError::Unavailable(format!("{what}: {e}"))
        })
    }

    async fn error_for(response: Response, subject: &str) -> ProviderError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        match status {
            StatusCode::NOT_FOUND => ProviderError::NotFound(subject.to_string()),
            StatusCode::CONFLICT | StatusCode::GONE => {
                ProviderError::OfferTaken(format!("{subject}: {body}"))
            }
            s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
                ProviderError::Unavailable(format!("{subject}: {s} {body}"))
            }
            s => ProviderError::Rejected { status: s.as_u16(), message: body },
        }
    }

    async fn decode<T: for<'de> Deserialize<'de>>(response: Response) -> ProviderResult<T> {
        response.json().await.map_err(|e| ProviderError::Decode(e.to_string()))
    }
}

#[async_trait]
impl GpuProvider for HttpGpuProvider {
    async fn search_offers(&self, query: &OfferQuery) -> ProviderResult<Vec<Offer>> {
        let mut request =
            self.client.get(format!("{}/offers", self.base_url)).query(&[("gpu_type", &query.gpu_type)]);
        if let Some(max) = query.max_hourly_rate {
            request = request.query(&[("max_hourly_rate", max)]);
        }
        let response = self.send(request, "search offers").await?;
        if !response.status().is_success() {
            return Err(Self::error_for(response, &query.gpu_type).await);
        }
        let mut offers: Vec<Offer> = Self::decode(response).await?;
        offers.sort_by(|a, b| a.hourly_rate.total_cmp(&b.hourly_rate));
        debug!(gpu_type = %query.gpu_type, count = offers.len(), "Fetched offers");
        Ok(offers)
    }

    async fn create_instance(&self, offer_id: &str, label: &str) -> ProviderResult<String> {
        let request = self
            .client
            .post(format!("{}/instances", self.base_url))
            .json(&CreateInstanceBody { offer_id, label });
        let response = self.send(request, "create instance").await?;
        if !response.status().is_success() {
            return Err(Self::error_for(response, offer_id).await);
        }
        let created: CreateInstanceResponse = Self::decode(response).await?;
        info!(offer_id, instance_id = %created.id, "Created instance");
        Ok(created.id)
    }

    async fn instance_status(&self, instance_id: &str) -> ProviderResult<InstanceStatus> {
        let request = self.client.get(format!("{}/instances/{instance_id}", self.base_url));
        let response = self.send(request, "instance status").await?;
        if !response.status().is_success() {
            return Err(Self::error_for(response, instance_id).await);
        }
        Self::decode(response).await
    }

    async fn terminate(&self, instance_id: &str) -> ProviderResult<()> {
        let request = self.client.delete(format!("{}/instances/{instance_id}", self.base_url));
        let response = self.send(request, "terminate instance").await?;
        let status = response.status();
        // Already gone counts as terminated.
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(Self::error_for(response, instance_id).await)
    }
}
