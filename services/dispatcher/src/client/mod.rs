//! Clients for the CI task queue and the device farm.
//!
//! The workers only see the [`TaskQueue`] and [`DeviceFarm`] traits; the
//! HTTP implementations live in the submodules.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::error::ClientError;

mod lambdatest;
mod retry;
mod taskcluster;

pub use lambdatest::LambdaTestClient;
pub use retry::{with_retry, BackoffPolicy};
pub use taskcluster::TaskclusterClient;

/// Request timeout for all API calls.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// State of a single farm device as last reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceState {
    /// Idle and available for a new job.
    Active,
    /// Running a job.
    Busy,
    /// Being reset after a job.
    Cleanup,
    /// Assigned a job that has not started yet.
    Initiated,
    /// Any other status string.
    Unknown,
}

impl DeviceState {
    /// Map a farm status string to a state. Unrecognized values are `Unknown`.
    pub fn parse(status: &str) -> Self {
        match status.trim().to_ascii_lowercase().as_str() {
            "active" => Self::Active,
            "busy" => Self::Busy,
            "cleanup" => Self::Cleanup,
            "initiated" => Self::Initiated,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Busy => "busy",
            Self::Cleanup => "cleanup",
            Self::Initiated => "initiated",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Device type -> device id -> state, for the whole account.
pub type DeviceList = BTreeMap<String, BTreeMap<String, DeviceState>>;

/// Job state -> number of jobs in that state.
pub type JobSummary = BTreeMap<String, u64>;

/// Source of CI queue depth.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Number of unclaimed tasks for a worker type.
    async fn pending_task_count(&self, worker_type: &str) -> Result<u64, ClientError>;
}

/// Source of device and job state for the farm account.
#[async_trait]
pub trait DeviceFarm: Send + Sync {
    /// Every device on the account, grouped by device type.
    async fn device_list(&self) -> Result<DeviceList, ClientError>;

    /// Count of recent jobs per job state.
    async fn job_summary(&self) -> Result<JobSummary, ClientError>;
}

/// Build the shared HTTP client used by the API clients.
pub(crate) fn http_client() -> Result<reqwest::Client, ClientError> {
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(ClientError::Build)
}

/// `Authorization` header value for HTTP basic auth.
pub(crate) fn basic_auth_header(username: &str, password: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{username}:{password}")))
}

/// Issue a GET and decode a JSON body, mapping failures to [`ClientError`].
pub(crate) async fn get_json<T: DeserializeOwned>(
    client: &reqwest::Client,
    url: &str,
    authorization: Option<&str>,
) -> Result<T, ClientError> {
    debug!(url = %url, "GET");

    let mut request = client.get(url);
    if let Some(value) = authorization {
        request = request.header(reqwest::header::AUTHORIZATION, value);
    }

    let response = request.send().await.map_err(|source| ClientError::Transport {
        url: url.to_string(),
        source,
    })?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        warn!(url = %url, status = %status, body = %body, "Request failed");
        return Err(ClientError::Status {
            url: url.to_string(),
            status: status.as_u16(),
            body,
        });
    }

    response.json().await.map_err(|source| ClientError::Decode {
        url: url.to_string(),
        source,
    })
}
