//! Error handling and display for the CLI.

use colored::Colorize;
use thiserror::Error;
use vmlife_converger::{ConvergeError, ErrorKind, GuardError, HypervisorError};

use crate::manifest::ManifestError;

/// CLI-specific errors.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("{failed} of {total} machine(s) did not converge")]
    ConvergeFailed { failed: usize, total: usize },

    #[error("{failed} of {total} machine(s) could not be planned")]
    PlanFailed { failed: usize, total: usize },
}

/// Hint for a convergence error class.
pub fn hint(kind: ErrorKind) -> &'static str {
    match kind {
        ErrorKind::InvalidDesiredState => {
            "Hint: Add the missing field to the machine entry in the manifest."
        }
        ErrorKind::ObservationFailed => {
            "Hint: Check that the management API at VMLIFE_ENDPOINT is reachable."
        }
        ErrorKind::UnsupportedTransition => {
            "Hint: Inspect the machine with `vmctl resource <path>` and fix it by hand."
        }
        ErrorKind::OperationFault => {
            "Hint: The plan stopped at the failing step. Rerun once the fault is cleared."
        }
        ErrorKind::VerificationFailed => {
            "Hint: The backend accepted every step but the machine did not change. \
             Inspect it with `vmctl resource <path>`."
        }
    }
}

/// Print an error in a user-friendly format.
pub fn print_error(err: &anyhow::Error) {
    eprintln!("{} {:#}", "Error:".red().bold(), err);

    if let Some(converge_err) = err.downcast_ref::<ConvergeError>() {
        eprintln!("\n{}", hint(converge_err.kind()).yellow());
        return;
    }

    if let Some(guard_err) = err.downcast_ref::<GuardError>() {
        let message = match guard_err.kind() {
            Some(kind) => hint(kind),
            None => "Hint: Raise --timeout-secs. A submitted task may still complete.",
        };
        eprintln!("\n{}", message.yellow());
        return;
    }

    if let Some(hv_err) = err.downcast_ref::<HypervisorError>() {
        eprintln!("\n{}", hint(ErrorKind::ObservationFailed).yellow());
        if let HypervisorError::Api { status, .. } = hv_err {
            eprintln!("API status: {}", status);
        }
        return;
    }

    if err.downcast_ref::<ManifestError>().is_some() {
        eprintln!(
            "\n{}",
            "Hint: Each [[machine]] needs `path` and `ensure`.".yellow()
        );
        return;
    }

    if let Some(CliError::ConvergeFailed { .. } | CliError::PlanFailed { .. }) =
        err.downcast_ref::<CliError>()
    {
        eprintln!(
            "\n{}",
            "Hint: Machines that converged are left as they are; rerunning is safe.".yellow()
        );
    }
}
