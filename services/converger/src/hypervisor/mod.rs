//! Hypervisor client interface.
//!
//! The interface abstracts the management plane:
//! - Inventory lookup by machine path
//! - Datastore file search
//! - Asynchronous task submission with blocking wait-for-completion
//!
//! An HTTP implementation talks to the real backend; a mock implementation
//! is provided for testing and development.

mod http;
mod mock;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use vmlife_model::{MachinePath, PowerState};

pub use http::HttpHypervisor;
pub use mock::MockHypervisor;

/// Errors from the hypervisor backend.
#[derive(Debug, Error)]
pub enum HypervisorError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("decode error: {0}")]
    Decode(String),

    /// A submitted task reached its terminal state in failure.
    #[error("task {task_id} ({op}) failed with {fault}: {message}")]
    TaskFault {
        task_id: String,
        op: &'static str,
        fault: String,
        message: String,
    },

    /// The wait gave up; the task itself may still complete later.
    #[error("task {task_id} ({op}) still running after {elapsed:?}")]
    TaskTimeout {
        task_id: String,
        op: &'static str,
        elapsed: Duration,
    },

    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

impl HypervisorError {
    /// Fault name for task faults, e.g. `InvalidPowerState`.
    pub fn fault(&self) -> Option<&str> {
        match self {
            HypervisorError::TaskFault { fault, .. } => Some(fault),
            _ => None,
        }
    }
}

/// A machine as registered in the inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineRecord {
    /// Registration identity.
    #[serde(rename = "id")]
    pub machine_id: String,

    pub path: MachinePath,

    pub power_state: PowerState,

    /// Datastore holding the machine's files.
    pub datastore: String,

    /// Folder on the datastore holding the machine's files.
    pub folder: String,
}

/// Asynchronous operation submitted to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TaskRequest {
    PowerOff {
        machine_id: String,
    },
    PowerOn {
        machine_id: String,
    },
    Unregister {
        machine_id: String,
    },
    Destroy {
        machine_id: String,
    },
    DeleteFiles {
        datastore: String,
        paths: Vec<String>,
    },
    #[serde(rename = "clone")]
    CloneMachine {
        template_path: String,
        compute: String,
        /// Inventory folder receiving the clone.
        folder: String,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        memory_mb: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cpu_count: Option<u32>,
        power_on: bool,
    },
    Register {
        vmx_path: String,
        compute: String,
        folder: String,
        name: String,
    },
}

impl TaskRequest {
    /// Short operation name used in logs, errors and fault injection.
    pub fn kind(&self) -> &'static str {
        match self {
            TaskRequest::PowerOff { .. } => "power_off",
            TaskRequest::PowerOn { .. } => "power_on",
            TaskRequest::Unregister { .. } => "unregister",
            TaskRequest::Destroy { .. } => "destroy",
            TaskRequest::DeleteFiles { .. } => "delete_files",
            TaskRequest::CloneMachine { .. } => "clone",
            TaskRequest::Register { .. } => "register",
        }
    }

    /// Returns true if this task removes files from a datastore.
    pub fn deletes_files(&self) -> bool {
        matches!(
            self,
            TaskRequest::Destroy { .. } | TaskRequest::DeleteFiles { .. }
        )
    }
}

/// Handle to a submitted task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskHandle {
    pub task_id: String,
    pub op: &'static str,
}

impl fmt::Display for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.task_id, self.op)
    }
}

/// Successful terminal state of a task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskOutcome {
    /// Machine created by the task (clone, register).
    pub machine_id: Option<String>,
}

/// Hypervisor client interface.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    /// Look up a machine by inventory path. `Ok(None)` means not found.
    async fn find_machine(
        &self,
        path: &MachinePath,
    ) -> Result<Option<MachineRecord>, HypervisorError>;

    /// List file names under `folder` on `datastore` matching the glob `pattern`.
    ///
    /// A missing folder yields an empty list.
    async fn search_datastore(
        &self,
        datastore: &str,
        folder: &str,
        pattern: &str,
    ) -> Result<Vec<String>, HypervisorError>;

    /// Submit an asynchronous task.
    async fn submit_task(&self, request: TaskRequest) -> Result<TaskHandle, HypervisorError>;

    /// Block until the task is terminal. A fault is returned as `TaskFault`.
    async fn await_completion(&self, handle: &TaskHandle) -> Result<TaskOutcome, HypervisorError>;

    /// Submit a task and wait for it.
    async fn run_task(&self, request: TaskRequest) -> Result<TaskOutcome, HypervisorError> {
        let handle = self.submit_task(request).await?;
        self.await_completion(&handle).await
    }
}
