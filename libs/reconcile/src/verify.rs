//! Post-state verification.

use thiserror::Error;
use vmlife_model::{DesiredState, Ensure, MachineState, ObservedState};

use crate::{Operation, OperationPlan, PostCondition};

/// A completed plan whose post-state still disagrees with the desired state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("expected ensure={expected}, observed {observed}{}", unmet_suffix(.unmet))]
pub struct VerificationFailure {
    pub expected: Ensure,
    pub observed: MachineState,
    /// First operation whose post-condition does not hold.
    pub unmet: Option<(Operation, PostCondition)>,
}

fn unmet_suffix(unmet: &Option<(Operation, PostCondition)>) -> String {
    match unmet {
        Some((op, condition)) => format!(" ({op} left the machine not {condition})"),
        None => String::new(),
    }
}

/// Check a fresh observation against the desired state and every
/// post-condition of the executed plan.
///
/// `before` is the observation the plan was built from. An `unregistered`
/// result is only accepted while the files seen in `before` are still seen.
pub fn verify(
    desired: &DesiredState,
    executed: &OperationPlan,
    before: &ObservedState,
    observed: &ObservedState,
) -> Result<(), VerificationFailure> {
    let state = observed.machine_state();
    let unmet = executed
        .operations()
        .iter()
        .map(|op| (*op, op.post_condition()))
        .find(|(_, condition)| !condition.holds(&before.backing_files, observed));

    if desired.ensure.accepts(state) && unmet.is_none() {
        Ok(())
    } else {
        Err(VerificationFailure {
            expected: desired.ensure,
            observed: state,
            unmet,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{plan, PlanPolicy};
    use vmlife_model::{BackingFiles, MachinePath, PowerState, Registration};

    fn running() -> ObservedState {
        ObservedState {
            registration: Some(Registration {
                machine_id: "vm-7".to_string(),
                power_state: PowerState::PoweredOn,
            }),
            backing_files: BackingFiles {
                datastore: "ds1".to_string(),
                config: vec!["[ds1] db/db.vmx".to_string()],
                disks: vec!["[ds1] db/db_1.vmdk".to_string()],
            },
        }
    }

    fn desired(ensure: Ensure) -> DesiredState {
        DesiredState::new(MachinePath::parse("/dc/vm/db").unwrap(), ensure)
    }

    #[test]
    fn test_unregister_verified_when_files_kept() {
        let desired = desired(Ensure::Unregistered);
        let executed = plan(&desired, &running(), PlanPolicy::default()).unwrap();

        let mut after = running();
        after.registration = None;
        assert!(verify(&desired, &executed, &running(), &after).is_ok());
    }

    #[test]
    fn test_unregister_that_lost_the_files_fails() {
        let desired = desired(Ensure::Unregistered);
        let executed = plan(&desired, &running(), PlanPolicy::default()).unwrap();

        // Nothing registered and nothing found: `absent` satisfies the ensure
        // value, but the files seen before the unregister are gone.
        let after = ObservedState::not_found("ds1");
        let failure = verify(&desired, &executed, &running(), &after).unwrap_err();
        assert_eq!(failure.observed, MachineState::Absent);
        assert_eq!(
            failure.unmet,
            Some((Operation::Unregister, PostCondition::FilesKept))
        );

        let mut partial = running();
        partial.registration = None;
        partial.backing_files.disks.clear();
        assert!(verify(&desired, &executed, &running(), &partial).is_err());
    }

    #[test]
    fn test_destroy_that_leaked_files_fails() {
        let desired = desired(Ensure::Absent);
        let executed = plan(&desired, &running(), PlanPolicy::default()).unwrap();

        let mut after = running();
        after.registration = None;
        let failure = verify(&desired, &executed, &running(), &after).unwrap_err();
        assert_eq!(failure.expected, Ensure::Absent);
        assert_eq!(failure.observed, MachineState::Unregistered);
        assert_eq!(
            failure.unmet,
            Some((Operation::Destroy, PostCondition::Gone))
        );
        assert!(failure.to_string().contains("destroy"));
    }

    #[test]
    fn test_empty_plan_checks_state_only() {
        let desired = desired(Ensure::Present);
        assert!(verify(&desired, &OperationPlan::default(), &running(), &running()).is_ok());

        let gone = ObservedState::not_found("ds1");
        let failure =
            verify(&desired, &OperationPlan::default(), &gone, &gone).unwrap_err();
        assert_eq!(failure.unmet, None);
        assert_eq!(failure.to_string(), "expected ensure=present, observed absent");
    }
}
