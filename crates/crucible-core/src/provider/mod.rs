//! GPU provisioning API.

pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub use http::HttpGpuProvider;

/// A rentable machine offered by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub id: String,
    pub gpu_type: String,
    /// USD per hour.
    pub hourly_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OfferQuery {
    pub gpu_type: String,
    pub max_hourly_rate: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Starting,
    Running,
    Stopping,
    Stopped,
    /// Released by the provider; the id no longer resolves to a machine.
    Gone,
}

impl InstanceState {
    /// Whether the machine may still be billing.
    pub fn is_alive(self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }

    pub fn is_dead(self) -> bool {
        matches!(self, Self::Stopped | Self::Gone)
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Gone => "gone",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceStatus {
    pub state: InstanceState,
    #[serde(default)]
    pub ssh_host: Option<String>,
    #[serde(default)]
    pub ssh_port: Option<u16>,
}

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("instance not found: {0}")]
    NotFound(String),

    /// The offer was taken by someone else between search and create.
    #[error("offer unavailable: {0}")]
    OfferTaken(String),

    /// Transient: network failure or provider-side error.
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("provider rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("failed to decode provider response: {0}")]
    Decode(String),
}

pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

#[async_trait]
pub trait GpuProvider: Send + Sync {
    /// Offers matching the query, cheapest first.
    async fn search_offers(&self, query: &OfferQuery) -> ProviderResult<Vec<Offer>>;

    /// Rent the machine behind `offer_id`; returns the new instance id.
    async fn create_instance(&self, offer_id: &str, label: &str) -> ProviderResult<String>;

    async fn instance_status(&self, instance_id: &str) -> ProviderResult<InstanceStatus>;

    /// Request destruction. Safe to call repeatedly.
    async fn terminate(&self, instance_id: &str) -> ProviderResult<()>;
}
