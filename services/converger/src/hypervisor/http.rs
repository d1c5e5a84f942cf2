//! HTTP client for the management-plane task API.
//!
//! Endpoints:
//! - `GET  /api/machines?path=...` inventory lookup (404 = not found)
//! - `GET  /api/datastores/{ds}/search?folder=...&pattern=...` file search
//! - `POST /api/tasks` task submission
//! - `GET  /api/tasks/{id}` task status

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, error, warn};
use vmlife_model::MachinePath;

use super::{
    Hypervisor, HypervisorError, MachineRecord, TaskHandle, TaskOutcome, TaskRequest,
};
use crate::config::Config;

/// Fault name the backend uses for a missing datastore folder or file.
const FILE_NOT_FOUND: &str = "FileNotFound";

/// Management-plane API client.
pub struct HttpHypervisor {
    client: reqwest::Client,
    base_url: String,
    poll_interval: Duration,
    task_timeout: Duration,
}

impl HttpHypervisor {
    /// Create a new client from configuration.
    pub fn new(config: &Config) -> Result<Self, HypervisorError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            base_url: config.endpoint.trim_end_matches('/').to_string(),
            poll_interval: config.task_poll_interval,
            task_timeout: config.task_timeout,
        })
    }

    async fn fetch_task(&self, task_id: &str) -> Result<TaskStatus, HypervisorError> {
        let url = format!("{}/api/tasks/{}", self.base_url, task_id);
        let response = self.client.get(&url).send().await?;
        let response = check_status(response).await?;
        decode(response).await
    }
}

#[async_trait]
impl Hypervisor for HttpHypervisor {
    async fn find_machine(
        &self,
        path: &MachinePath,
    ) -> Result<Option<MachineRecord>, HypervisorError> {
        let url = format!("{}/api/machines", self.base_url);
        debug!(path = %path, "Looking up machine");

        let response = self
            .client
            .get(&url)
            .query(&[("path", path.as_str())])
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }

        let response = check_status(response).await?;
        let record: MachineRecord = decode(response).await?;
        Ok(Some(record))
    }

    async fn search_datastore(
        &self,
        datastore: &str,
        folder: &str,
        pattern: &str,
    ) -> Result<Vec<String>, HypervisorError> {
        let url = format!("{}/api/datastores/{}/search", self.base_url, datastore);
        debug!(datastore, folder, pattern, "Searching datastore");

        let response = self
            .client
            .get(&url)
            .query(&[("folder", folder), ("pattern", pattern)])
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            // Some backends report a vanished folder as a fault, not a 404.
            if let Ok(fault) = serde_json::from_str::<FaultBody>(&body) {
                if fault.fault == FILE_NOT_FOUND {
                    return Ok(Vec::new());
                }
            }
            error!(status = %status, body = %body, "Datastore search failed");
            return Err(HypervisorError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        let result: SearchResult = decode(response).await?;
        Ok(result.files)
    }

    async fn submit_task(&self, request: TaskRequest) -> Result<TaskHandle, HypervisorError> {
        let url = format!("{}/api/tasks", self.base_url);
        let op = request.kind();
        debug!(op, "Submitting task");

        let response = self.client.post(&url).json(&request).send().await?;
        let response = check_status(response).await?;
        let accepted: TaskAccepted = decode(response).await?;

        Ok(TaskHandle {
            task_id: accepted.task_id,
            op,
        })
    }

    async fn await_completion(&self, handle: &TaskHandle) -> Result<TaskOutcome, HypervisorError> {
        let started = Instant::now();

        loop {
            let status = self.fetch_task(&handle.task_id).await?;
            match status.state {
                TaskState::Success => {
                    debug!(task = %handle, elapsed_ms = started.elapsed().as_millis() as u64, "Task succeeded");
                    return Ok(TaskOutcome {
                        machine_id: status.result,
                    });
                }
                TaskState::Error => {
                    let fault = status.error.unwrap_or_else(|| FaultBody {
                        fault: "UnknownFault".to_string(),
                        message: String::new(),
                    });
                    warn!(task = %handle, fault = %fault.fault, "Task failed");
                    return Err(HypervisorError::TaskFault {
                        task_id: handle.task_id.clone(),
                        op: handle.op,
                        fault: fault.fault,
                        message: fault.message,
                    });
                }
                TaskState::Queued | TaskState::Running => {}
            }

            let elapsed = started.elapsed();
            if elapsed >= self.task_timeout {
                return Err(HypervisorError::TaskTimeout {
                    task_id: handle.task_id.clone(),
                    op: handle.op,
                    elapsed,
                });
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, HypervisorError> {
    if response.status().is_success() {
        return Ok(response);
    }

    let status = response.status();
    let message = response.text().await.unwrap_or_default();
    error!(status = %status, message = %message, "Management API error");
    Err(HypervisorError::Api {
        status: status.as_u16(),
        message,
    })
}

async fn decode<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, HypervisorError> {
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes).map_err(|e| HypervisorError::Decode(e.to_string()))
}

#[derive(Debug, Deserialize)]
struct SearchResult {
    #[serde(default)]
    files: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct TaskAccepted {
    task_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum TaskState {
    Queued,
    Running,
    Success,
    Error,
}

#[derive(Debug, Deserialize)]
struct TaskStatus {
    state: TaskState,
    #[serde(default)]
    error: Option<FaultBody>,
    #[serde(default)]
    result: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FaultBody {
    fault: String,
    #[serde(default)]
    message: String,
}
