//! Lifecycle planning primitives.
//!
//! This library decides which hypervisor operations bring one machine from
//! its observed state to its desired state. Key concepts:
//!
//! - **Desired state**: What the caller asked for (`present`, `absent`, `unregistered`).
//! - **Observed state**: What the hypervisor reports right now (registration, power, files).
//! - **Plan**: The ordered, minimal list of operations that closes the gap.
//!
//! Nothing in this crate performs I/O. Execution and observation live in the
//! converger service; this crate is the decision table plus the post-state check.
//!
//! # Invariants
//!
//! - A plan is empty iff the observed state already satisfies the desired state
//! - `unregistered` never plans a file-deleting operation
//! - `absent` never plans a plain `unregister`
//! - `powerOff` precedes every structural step when the machine is powered on,
//!   and is never planned otherwise

use std::time::Duration;

use thiserror::Error;
use vmlife_model::{Ensure, MachineState, PowerState};

mod plan;
mod verify;

pub use plan::{plan, Operation, OperationPlan, PlanPolicy, PostCondition};
pub use verify::{verify, VerificationFailure};

/// Errors raised while building a plan.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    /// The observed/desired pairing has no defined operation.
    #[error("unsupported transition from {from} to {to}: {reason}")]
    UnsupportedTransition {
        from: MachineState,
        to: Ensure,
        reason: String,
    },

    /// The desired state lacks a field the transition needs.
    #[error("ensure={ensure} from {from} requires '{field}'")]
    MissingField {
        field: &'static str,
        from: MachineState,
        ensure: Ensure,
    },
}

impl PlanError {
    pub(crate) fn unknown_power(from: MachineState, to: Ensure, power: PowerState) -> Self {
        PlanError::UnsupportedTransition {
            from,
            to,
            reason: format!("power state is {power}, refusing a structural change"),
        }
    }
}

/// Default interval between convergence passes in watch mode.
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(30);
