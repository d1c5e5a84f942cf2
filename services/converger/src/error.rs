//! Convergence errors.
//!
//! Every failure is fatal for the call that raised it and is never retried
//! here. The next convergence call starts from a fresh observation.

use serde::Serialize;
use thiserror::Error;
use vmlife_model::{MachinePath, ObservedState};
use vmlife_reconcile::{Operation, PlanError, VerificationFailure};

use crate::hypervisor::HypervisorError;

/// Stable, machine-readable error class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidDesiredState,
    ObservationFailed,
    UnsupportedTransition,
    OperationFault,
    VerificationFailed,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidDesiredState => "invalid_desired_state",
            ErrorKind::ObservationFailed => "observation_failed",
            ErrorKind::UnsupportedTransition => "unsupported_transition",
            ErrorKind::OperationFault => "operation_fault",
            ErrorKind::VerificationFailed => "verification_failed",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Convergence errors.
#[derive(Debug, Error)]
pub enum ConvergeError {
    /// The desired state lacks what the required transition needs.
    #[error("{path}: {source}")]
    InvalidDesiredState {
        path: MachinePath,
        source: PlanError,
    },

    /// Current state could not be determined; no plan was built or checked.
    #[error("{path}: could not observe machine: {source}")]
    ObservationFailed {
        path: MachinePath,
        source: HypervisorError,
    },

    /// The observed/desired pairing has no defined operation.
    #[error("{path}: {source}")]
    UnsupportedTransition {
        path: MachinePath,
        source: PlanError,
    },

    /// A submitted task failed; the rest of the plan was not attempted.
    #[error("{path}: {operation} failed after [{}]: {source}", join(.completed))]
    OperationFault {
        path: MachinePath,
        operation: Operation,
        completed: Vec<Operation>,
        source: HypervisorError,
    },

    /// The plan ran without a fault but the machine did not reach the target.
    #[error("{path}: plan [{}] completed but verification failed: {failure}", join(.executed))]
    VerificationFailed {
        path: MachinePath,
        executed: Vec<Operation>,
        failure: VerificationFailure,
        observed: Box<ObservedState>,
    },
}

fn join(operations: &[Operation]) -> String {
    operations
        .iter()
        .map(|op| op.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl ConvergeError {
    pub(crate) fn from_plan(path: &MachinePath, err: PlanError) -> Self {
        match err {
            PlanError::MissingField { .. } => ConvergeError::InvalidDesiredState {
                path: path.clone(),
                source: err,
            },
            PlanError::UnsupportedTransition { .. } => ConvergeError::UnsupportedTransition {
                path: path.clone(),
                source: err,
            },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ConvergeError::InvalidDesiredState { .. } => ErrorKind::InvalidDesiredState,
            ConvergeError::ObservationFailed { .. } => ErrorKind::ObservationFailed,
            ConvergeError::UnsupportedTransition { .. } => ErrorKind::UnsupportedTransition,
            ConvergeError::OperationFault { .. } => ErrorKind::OperationFault,
            ConvergeError::VerificationFailed { .. } => ErrorKind::VerificationFailed,
        }
    }

    pub fn path(&self) -> &MachinePath {
        match self {
            ConvergeError::InvalidDesiredState { path, .. }
            | ConvergeError::ObservationFailed { path, .. }
            | ConvergeError::UnsupportedTransition { path, .. }
            | ConvergeError::OperationFault { path, .. }
            | ConvergeError::VerificationFailed { path, .. } => path,
        }
    }

    /// Operations that completed before the call failed.
    pub fn completed(&self) -> &[Operation] {
        match self {
            ConvergeError::OperationFault { completed, .. } => completed,
            ConvergeError::VerificationFailed { executed, .. } => executed,
            _ => &[],
        }
    }

    /// Returns true if the machine may have changed before the failure.
    pub fn changed(&self) -> bool {
        !self.completed().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmlife_model::{Ensure, MachineState};

    fn path() -> MachinePath {
        MachinePath::parse("/opdx1/vm/eng/web01").unwrap()
    }

    #[test]
    fn test_operation_fault_message_and_kind() {
        let err = ConvergeError::OperationFault {
            path: path(),
            operation: Operation::Destroy,
            completed: vec![Operation::PowerOff],
            source: HypervisorError::TaskFault {
                task_id: "task-9".to_string(),
                op: "destroy",
                fault: "FileLocked".to_string(),
                message: "disk busy".to_string(),
            },
        };
        assert_eq!(err.kind(), ErrorKind::OperationFault);
        assert!(err.changed());
        assert_eq!(
            err.to_string(),
            "/opdx1/vm/eng/web01: destroy failed after [powerOff]: \
             task task-9 (destroy) failed with FileLocked: disk busy"
        );
    }

    #[test]
    fn test_plan_errors_map_to_kinds() {
        let missing = ConvergeError::from_plan(
            &path(),
            PlanError::MissingField {
                field: "compute",
                from: MachineState::Absent,
                ensure: Ensure::Present,
            },
        );
        assert_eq!(missing.kind(), ErrorKind::InvalidDesiredState);
        assert!(!missing.changed());

        let unsupported = ConvergeError::from_plan(
            &path(),
            PlanError::UnsupportedTransition {
                from: MachineState::Present,
                to: Ensure::Absent,
                reason: "power state is unknown".to_string(),
            },
        );
        assert_eq!(unsupported.kind(), ErrorKind::UnsupportedTransition);
        assert_eq!(unsupported.path(), &path());
    }
}
