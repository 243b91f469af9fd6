//! LambdaTest private cloud and HyperExecute job API client.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{
    basic_auth_header, get_json, http_client, with_retry, BackoffPolicy, DeviceFarm, DeviceList,
    DeviceState, JobSummary,
};
use crate::config::FarmCredentials;
use crate::error::ClientError;

/// Client for the device list and job summary endpoints.
pub struct LambdaTestClient {
    client: reqwest::Client,
    device_api_url: String,
    job_api_url: String,
    authorization: String,
    backoff: BackoffPolicy,
}

#[derive(Debug, Deserialize)]
struct DeviceListResponse {
    data: DeviceListData,
}

#[derive(Debug, Deserialize)]
struct DeviceListData {
    #[serde(default)]
    private_cloud_devices: Vec<PrivateCloudDevice>,
}

#[derive(Debug, Deserialize)]
struct PrivateCloudDevice {
    name: String,
    udid: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct JobListResponse {
    #[serde(default)]
    data: Vec<JobEntry>,
}

#[derive(Debug, Deserialize)]
struct JobEntry {
    status: String,
}

impl LambdaTestClient {
    /// Create a client for the given API roots.
    pub fn new(
        device_api_url: impl Into<String>,
        job_api_url: impl Into<String>,
        credentials: &FarmCredentials,
    ) -> Result<Self, ClientError> {
        Ok(Self {
            client: http_client()?,
            device_api_url: device_api_url.into().trim_end_matches('/').to_string(),
            job_api_url: job_api_url.into().trim_end_matches('/').to_string(),
            authorization: basic_auth_header(&credentials.username, &credentials.access_key),
            backoff: BackoffPolicy::default(),
        })
    }

    /// Replace the retry policy.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    fn devices_url(&self) -> String {
        format!(
            "{}/mobile-automation/api/v1/privatecloud_devices",
            self.device_api_url
        )
    }

    fn jobs_url(&self) -> String {
        format!(
            "{}/v1.0/jobs?show_test_summary=false&is_cursor_base_pagination=true&limit=100",
            self.job_api_url
        )
    }
}

fn group_devices(devices: Vec<PrivateCloudDevice>) -> DeviceList {
    let mut list = DeviceList::new();
    for device in devices {
        list.entry(device.name)
            .or_default()
            .insert(device.udid, DeviceState::parse(&device.status));
    }
    list
}

fn summarize_jobs(jobs: Vec<JobEntry>) -> JobSummary {
    let mut summary = JobSummary::new();
    for job in jobs {
        *summary.entry(job.status.to_ascii_lowercase()).or_default() += 1;
    }
    summary
}

#[async_trait]
impl DeviceFarm for LambdaTestClient {
    async fn device_list(&self) -> Result<DeviceList, ClientError> {
        let url = self.devices_url();
        let response: DeviceListResponse = with_retry(&self.backoff, "device_list", || {
            get_json(&self.client, &url, Some(&self.authorization))
        })
        .await?;

        let device_count = response.data.private_cloud_devices.len();
        let list = group_devices(response.data.private_cloud_devices);
        debug!(
            device_count,
            device_types = list.len(),
            "Fetched device list"
        );
        Ok(list)
    }

    async fn job_summary(&self) -> Result<JobSummary, ClientError> {
        let url = self.jobs_url();
        let response: JobListResponse = with_retry(&self.backoff, "job_summary", || {
            get_json(&self.client, &url, Some(&self.authorization))
        })
        .await?;

        Ok(summarize_jobs(response.data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(name: &str, udid: &str, status: &str) -> PrivateCloudDevice {
        PrivateCloudDevice {
            name: name.to_string(),
            udid: udid.to_string(),
            status: status.to_string(),
        }
    }

    #[test]
    fn test_group_devices_by_type() {
        let list = group_devices(vec![
            device("Galaxy A55", "A1", "active"),
            device("Galaxy A55", "A2", "busy"),
            device("Pixel 6", "P1", "offline"),
        ]);

        assert_eq!(list.len(), 2);
        assert_eq!(list["Galaxy A55"]["A1"], DeviceState::Active);
        assert_eq!(list["Galaxy A55"]["A2"], DeviceState::Busy);
        assert_eq!(list["Pixel 6"]["P1"], DeviceState::Unknown);
    }

    #[test]
    fn test_summarize_jobs() {
        let jobs = ["initiated", "running", "Initiated", "completed"]
            .into_iter()
            .map(|s| JobEntry {
                status: s.to_string(),
            })
            .collect();
        let summary = summarize_jobs(jobs);

        assert_eq!(summary["initiated"], 2);
        assert_eq!(summary["running"], 1);
        assert_eq!(summary["completed"], 1);
    }

    #[test]
    fn test_device_list_response_shape() {
        let body = r#"{"data":{"private_cloud_devices":[{"name":"Galaxy A55","udid":"A1","status":"active","extra":1}]}}"#;
        let parsed: DeviceListResponse = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.data.private_cloud_devices.len(), 1);
        assert_eq!(parsed.data.private_cloud_devices[0].udid, "A1");
    }
}
