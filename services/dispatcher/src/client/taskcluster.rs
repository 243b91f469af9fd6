//! Taskcluster queue client.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{get_json, http_client, with_retry, BackoffPolicy, TaskQueue};
use crate::error::ClientError;

/// Reads pending task counts from the Taskcluster queue service.
pub struct TaskclusterClient {
    client: reqwest::Client,
    root_url: String,
    provisioner: String,
    backoff: BackoffPolicy,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PendingTasksResponse {
    pending_tasks: u64,
}

impl TaskclusterClient {
    /// Create a client for a Taskcluster deployment and provisioner.
    pub fn new(
        root_url: impl Into<String>,
        provisioner: impl Into<String>,
    ) -> Result<Self, ClientError> {
        Ok(Self {
            client: http_client()?,
            root_url: root_url.into().trim_end_matches('/').to_string(),
            provisioner: provisioner.into(),
            backoff: BackoffPolicy::default(),
        })
    }

    /// Replace the retry policy.
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    fn pending_url(&self, worker_type: &str) -> String {
        format!(
            "{}/api/queue/v1/pending/{}/{}",
            self.root_url, self.provisioner, worker_type
        )
    }
}

#[async_trait]
impl TaskQueue for TaskclusterClient {
    async fn pending_task_count(&self, worker_type: &str) -> Result<u64, ClientError> {
        let url = self.pending_url(worker_type);
        let response: PendingTasksResponse = with_retry(&self.backoff, "pending_tasks", || {
            get_json(&self.client, &url, None)
        })
        .await?;

        debug!(
            worker_type,
            pending_tasks = response.pending_tasks,
            "Fetched pending task count"
        );
        Ok(response.pending_tasks)
    }
}
