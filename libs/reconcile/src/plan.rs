//! Decision table mapping (desired, observed) to an operation plan.

use std::fmt;

use serde::Serialize;
use vmlife_model::{
    BackingFiles, DesiredState, Ensure, FileClass, MachineState, ObservedState, PowerState,
};

use crate::PlanError;

/// Policy knobs that change what "converged" means.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlanPolicy {
    /// Power on a registered machine that is off when `ensure=present`.
    pub power_on_present: bool,
}

/// One atomic hypervisor operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case", tag = "op", content = "class")]
pub enum Operation {
    PowerOff,
    PowerOn,
    /// Remove the inventory registration, keep files.
    Unregister,
    /// Remove the registration and every backing file.
    Destroy,
    /// Delete the backing files of one class from the datastore.
    DeleteFiles(FileClass),
    /// Clone the template into the target pool and power the clone on.
    CloneAndPowerOn,
    /// Register existing backing files into the inventory.
    Register,
}

impl Operation {
    /// Operations that change registration or storage.
    pub fn is_structural(&self) -> bool {
        !matches!(self, Operation::PowerOff | Operation::PowerOn)
    }

    /// File classes this operation deletes.
    pub fn deletes_files(&self) -> &'static [FileClass] {
        match self {
            Operation::Destroy => &FileClass::ALL,
            Operation::DeleteFiles(FileClass::Config) => &[FileClass::Config],
            Operation::DeleteFiles(FileClass::Disk) => &[FileClass::Disk],
            _ => &[],
        }
    }

    /// What must hold once this operation has completed.
    pub fn post_condition(&self) -> PostCondition {
        match self {
            Operation::PowerOff => PostCondition::NotRunning,
            Operation::PowerOn | Operation::CloneAndPowerOn => PostCondition::Running,
            Operation::Unregister => PostCondition::FilesKept,
            Operation::Destroy => PostCondition::Gone,
            Operation::DeleteFiles(class) => PostCondition::FilesRemoved(*class),
            Operation::Register => PostCondition::Registered,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::PowerOff => f.write_str("powerOff"),
            Operation::PowerOn => f.write_str("powerOn"),
            Operation::Unregister => f.write_str("unregister"),
            Operation::Destroy => f.write_str("destroy"),
            Operation::DeleteFiles(class) => write!(f, "deleteFiles({class})"),
            Operation::CloneAndPowerOn => f.write_str("clone+powerOn"),
            Operation::Register => f.write_str("register"),
        }
    }
}

/// Observable condition expected after an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PostCondition {
    /// Not registered, or registered and not powered on.
    NotRunning,
    /// Registered and powered on.
    Running,
    Registered,
    /// Not registered, and every file seen before the plan is still there.
    FilesKept,
    /// Neither registered nor backed by any file.
    Gone,
    FilesRemoved(FileClass),
}

impl PostCondition {
    /// Check the condition against `observed`, given the files `before`
    /// the plan ran.
    pub fn holds(&self, before: &BackingFiles, observed: &ObservedState) -> bool {
        match self {
            PostCondition::NotRunning => observed.power_state() != PowerState::PoweredOn,
            PostCondition::Running => {
                observed.registered() && observed.power_state() == PowerState::PoweredOn
            }
            PostCondition::Registered => observed.registered(),
            PostCondition::FilesKept => {
                !observed.registered()
                    && FileClass::ALL.into_iter().all(|class| {
                        before
                            .files(class)
                            .iter()
                            .all(|f| observed.backing_files.files(class).contains(f))
                    })
            }
            PostCondition::Gone => !observed.exists(),
            PostCondition::FilesRemoved(class) => !observed.backing_files.has(*class),
        }
    }
}

impl fmt::Display for PostCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PostCondition::NotRunning => f.write_str("not powered on"),
            PostCondition::Running => f.write_str("registered and powered on"),
            PostCondition::Registered => f.write_str("registered"),
            PostCondition::FilesKept => f.write_str("unregistered with its files kept"),
            PostCondition::Gone => f.write_str("no registration and no backing files"),
            PostCondition::FilesRemoved(class) => write!(f, "no {class} files"),
        }
    }
}

/// Ordered operations for one convergence call.
///
/// Consumed entirely within the call that built it; never resumed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OperationPlan {
    from: Option<MachineState>,
    operations: Vec<Operation>,
}

impl OperationPlan {
    fn new(from: MachineState, operations: Vec<Operation>) -> Self {
        Self {
            from: Some(from),
            operations,
        }
    }

    /// State the plan starts from.
    pub fn from_state(&self) -> Option<MachineState> {
        self.from
    }

    pub fn operations(&self) -> &[Operation] {
        &self.operations
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    /// Number of operations that delete files of `class`.
    pub fn file_deletions(&self, class: FileClass) -> usize {
        self.operations
            .iter()
            .filter(|op| op.deletes_files().contains(&class))
            .count()
    }
}

impl<'a> IntoIterator for &'a OperationPlan {
    type Item = &'a Operation;
    type IntoIter = std::slice::Iter<'a, Operation>;

    fn into_iter(self) -> Self::IntoIter {
        self.operations.iter()
    }
}

impl fmt::Display for OperationPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, op) in self.operations.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{op}")?;
        }
        f.write_str("]")
    }
}

/// Compute the minimal plan taking `observed` to `desired`.
///
/// Pure: the same inputs always yield the same plan.
pub fn plan(
    desired: &DesiredState,
    observed: &ObservedState,
    policy: PlanPolicy,
) -> Result<OperationPlan, PlanError> {
    let from = observed.machine_state();
    let to = desired.ensure;

    let operations = match (from, to) {
        (MachineState::Absent, Ensure::Present) => {
            require(desired.compute.as_ref(), "compute", from, to)?;
            require(desired.template_path.as_ref(), "template_path", from, to)?;
            vec![Operation::CloneAndPowerOn]
        }
        // Nothing to unregister and nothing to keep.
        (MachineState::Absent, Ensure::Unregistered) => Vec::new(),
        (MachineState::Absent, Ensure::Absent) => Vec::new(),

        (MachineState::Unregistered, Ensure::Present) => {
            require(desired.compute.as_ref(), "compute", from, to)?;
            if !observed.backing_files.has(FileClass::Config) {
                return Err(PlanError::UnsupportedTransition {
                    from,
                    to,
                    reason: "no configuration file left to register".to_string(),
                });
            }
            let mut ops = vec![Operation::Register];
            if policy.power_on_present {
                ops.push(Operation::PowerOn);
            }
            ops
        }
        (MachineState::Unregistered, Ensure::Unregistered) => Vec::new(),
        (MachineState::Unregistered, Ensure::Absent) => FileClass::ALL
            .into_iter()
            .filter(|class| observed.backing_files.has(*class))
            .map(Operation::DeleteFiles)
            .collect(),

        (MachineState::Present, Ensure::Present) => {
            let power = observed.power_state();
            if policy.power_on_present
                && matches!(power, PowerState::PoweredOff | PowerState::Suspended)
            {
                vec![Operation::PowerOn]
            } else {
                Vec::new()
            }
        }
        (MachineState::Present, Ensure::Unregistered) => {
            let mut ops = power_off_first(observed, from, to)?;
            ops.push(Operation::Unregister);
            ops
        }
        (MachineState::Present, Ensure::Absent) => {
            let mut ops = power_off_first(observed, from, to)?;
            ops.push(Operation::Destroy);
            ops
        }
    };

    Ok(OperationPlan::new(from, operations))
}

fn require<T>(
    value: Option<&T>,
    field: &'static str,
    from: MachineState,
    ensure: Ensure,
) -> Result<(), PlanError> {
    match value {
        Some(_) => Ok(()),
        None => Err(PlanError::MissingField {
            field,
            from,
            ensure,
        }),
    }
}

/// `[powerOff]` when the machine is on, `[]` when it is off or suspended.
fn power_off_first(
    observed: &ObservedState,
    from: MachineState,
    to: Ensure,
) -> Result<Vec<Operation>, PlanError> {
    match observed.power_state() {
        PowerState::PoweredOn => Ok(vec![Operation::PowerOff]),
        PowerState::PoweredOff | PowerState::Suspended => Ok(Vec::new()),
        power @ PowerState::Unknown => Err(PlanError::unknown_power(from, to, power)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;
    use vmlife_model::{MachinePath, Registration};

    fn desired(ensure: Ensure) -> DesiredState {
        DesiredState::new(MachinePath::parse("/opdx1/vm/eng/web01").unwrap(), ensure)
            .with_compute("general1")
            .with_template("/eng/templates/debian")
            .with_hardware(512, 2)
    }

    fn observed(power: Option<PowerState>, config: bool, disk: bool) -> ObservedState {
        ObservedState {
            registration: power.map(|power_state| Registration {
                machine_id: "vm-1".to_string(),
                power_state,
            }),
            backing_files: BackingFiles {
                datastore: "ds1".to_string(),
                config: if config {
                    vec!["[ds1] web01/web01.vmx".to_string()]
                } else {
                    Vec::new()
                },
                disks: if disk {
                    vec!["[ds1] web01/web01_1.vmdk".to_string()]
                } else {
                    Vec::new()
                },
            },
        }
    }

    #[rstest]
    #[case::running_to_unregistered(
        Some(PowerState::PoweredOn), Ensure::Unregistered,
        vec![Operation::PowerOff, Operation::Unregister]
    )]
    #[case::running_to_absent(
        Some(PowerState::PoweredOn), Ensure::Absent,
        vec![Operation::PowerOff, Operation::Destroy]
    )]
    #[case::stopped_to_unregistered(
        Some(PowerState::PoweredOff), Ensure::Unregistered,
        vec![Operation::Unregister]
    )]
    #[case::suspended_to_absent(
        Some(PowerState::Suspended), Ensure::Absent,
        vec![Operation::Destroy]
    )]
    #[case::running_to_present(Some(PowerState::PoweredOn), Ensure::Present, vec![])]
    #[case::stopped_to_present(Some(PowerState::PoweredOff), Ensure::Present, vec![])]
    #[case::unregistered_to_unregistered(None, Ensure::Unregistered, vec![])]
    #[case::unregistered_to_absent(
        None, Ensure::Absent,
        vec![Operation::DeleteFiles(FileClass::Config), Operation::DeleteFiles(FileClass::Disk)]
    )]
    #[case::unregistered_to_present(None, Ensure::Present, vec![Operation::Register])]
    fn test_transitions_with_files(
        #[case] power: Option<PowerState>,
        #[case] ensure: Ensure,
        #[case] expected: Vec<Operation>,
    ) {
        let plan = plan(
            &desired(ensure),
            &observed(power, true, true),
            PlanPolicy::default(),
        )
        .unwrap();
        assert_eq!(plan.operations(), expected.as_slice());
    }

    #[rstest]
    #[case(Ensure::Absent, vec![])]
    #[case(Ensure::Unregistered, vec![])]
    #[case(Ensure::Present, vec![Operation::CloneAndPowerOn])]
    fn test_transitions_from_absent(#[case] ensure: Ensure, #[case] expected: Vec<Operation>) {
        let plan = plan(
            &desired(ensure),
            &observed(None, false, false),
            PlanPolicy::default(),
        )
        .unwrap();
        assert_eq!(plan.operations(), expected.as_slice());
        assert_eq!(plan.from_state(), Some(MachineState::Absent));
    }

    #[test]
    fn test_power_on_policy() {
        let policy = PlanPolicy {
            power_on_present: true,
        };
        let stopped = observed(Some(PowerState::PoweredOff), true, true);
        let plan_present = plan(&desired(Ensure::Present), &stopped, policy).unwrap();
        assert_eq!(plan_present.operations(), &[Operation::PowerOn]);

        let running = observed(Some(PowerState::PoweredOn), true, true);
        assert!(plan(&desired(Ensure::Present), &running, policy)
            .unwrap()
            .is_empty());

        let unregistered = observed(None, true, true);
        let plan_register = plan(&desired(Ensure::Present), &unregistered, policy).unwrap();
        assert_eq!(
            plan_register.operations(),
            &[Operation::Register, Operation::PowerOn]
        );
    }

    #[test]
    fn test_partial_files_delete_only_what_exists() {
        let plan = plan(
            &desired(Ensure::Absent),
            &observed(None, false, true),
            PlanPolicy::default(),
        )
        .unwrap();
        assert_eq!(plan.operations(), &[Operation::DeleteFiles(FileClass::Disk)]);
    }

    #[test]
    fn test_register_needs_config_file() {
        let err = plan(
            &desired(Ensure::Present),
            &observed(None, false, true),
            PlanPolicy::default(),
        )
        .unwrap_err();
        assert!(matches!(err, PlanError::UnsupportedTransition { .. }));
    }

    #[test]
    fn test_unknown_power_is_unsupported() {
        let err = plan(
            &desired(Ensure::Absent),
            &observed(Some(PowerState::Unknown), true, true),
            PlanPolicy::default(),
        )
        .unwrap_err();
        assert!(matches!(err, PlanError::UnsupportedTransition { .. }));
    }

    #[test]
    fn test_create_requires_compute_and_template() {
        let path = MachinePath::parse("/opdx1/vm/eng/web01").unwrap();
        let bare = DesiredState::new(path, Ensure::Present);
        let err = plan(&bare, &observed(None, false, false), PlanPolicy::default()).unwrap_err();
        assert_eq!(
            err,
            PlanError::MissingField {
                field: "compute",
                from: MachineState::Absent,
                ensure: Ensure::Present,
            }
        );

        let no_template = bare.clone().with_compute("general1");
        let err = plan(&no_template, &observed(None, false, false), PlanPolicy::default())
            .unwrap_err();
        assert!(matches!(
            err,
            PlanError::MissingField {
                field: "template_path",
                ..
            }
        ));
    }

    #[test]
    fn test_plan_display() {
        let plan = plan(
            &desired(Ensure::Absent),
            &observed(Some(PowerState::PoweredOn), true, true),
            PlanPolicy::default(),
        )
        .unwrap();
        assert_eq!(plan.to_string(), "[powerOff, destroy]");
    }

    fn any_observed() -> impl Strategy<Value = ObservedState> {
        let power = prop_oneof![
            Just(None),
            Just(Some(PowerState::PoweredOn)),
            Just(Some(PowerState::PoweredOff)),
            Just(Some(PowerState::Suspended)),
        ];
        (power, any::<bool>(), any::<bool>())
            .prop_map(|(power, config, disk)| observed(power, config, disk))
    }

    fn any_ensure() -> impl Strategy<Value = Ensure> {
        prop_oneof![
            Just(Ensure::Present),
            Just(Ensure::Absent),
            Just(Ensure::Unregistered),
        ]
    }

    proptest! {
        #[test]
        fn prop_empty_iff_accepted(observed in any_observed(), ensure in any_ensure()) {
            // registering without a config file is refused, not planned
            let result = plan(&desired(ensure), &observed, PlanPolicy::default());
            prop_assume!(result.is_ok());
            let plan = result.unwrap();
            prop_assert_eq!(plan.is_empty(), ensure.accepts(observed.machine_state()));
        }

        #[test]
        fn prop_ensure_separation(observed in any_observed()) {
            let unregister = plan(&desired(Ensure::Unregistered), &observed, PlanPolicy::default()).unwrap();
            prop_assert!(unregister.operations().iter().all(|op| op.deletes_files().is_empty()));

            let absent = plan(&desired(Ensure::Absent), &observed, PlanPolicy::default()).unwrap();
            prop_assert!(!absent.operations().contains(&Operation::Unregister));
            for class in FileClass::ALL {
                prop_assert!(absent.file_deletions(class) <= 1);
            }
        }

        #[test]
        fn prop_power_off_precedes_structural(observed in any_observed(), ensure in any_ensure()) {
            let result = plan(&desired(ensure), &observed, PlanPolicy::default());
            prop_assume!(result.is_ok());
            let plan = result.unwrap();
            let power_off = plan.operations().iter().position(|op| *op == Operation::PowerOff);
            let structural = plan.operations().iter().position(|op| op.is_structural());
            if observed.power_state() != PowerState::PoweredOn {
                prop_assert!(power_off.is_none());
            }
            if let Some(p) = power_off {
                prop_assert_eq!(p, 0);
                prop_assert!(structural.is_some_and(|s| s > p));
            }
        }
    }
}
