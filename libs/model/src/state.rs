//! Desired and observed machine state.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{MachinePath, ModelError};

// =============================================================================
// Desired state
// =============================================================================

/// The lifecycle state a caller asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ensure {
    /// Registered with the hypervisor, backed by files.
    Present,
    /// Neither registered nor backed by files.
    Absent,
    /// Not registered, but backing files are kept on the datastore.
    Unregistered,
}

impl Ensure {
    pub const ALL: [Ensure; 3] = [Ensure::Present, Ensure::Absent, Ensure::Unregistered];

    pub fn as_str(&self) -> &'static str {
        match self {
            Ensure::Present => "present",
            Ensure::Absent => "absent",
            Ensure::Unregistered => "unregistered",
        }
    }

    /// Returns true if a machine in `state` satisfies this desired value.
    ///
    /// `Unregistered` is satisfied by an absent machine: there is nothing to
    /// unregister and nothing to keep.
    pub fn accepts(&self, state: MachineState) -> bool {
        match self {
            Ensure::Present => state == MachineState::Present,
            Ensure::Absent => state == MachineState::Absent,
            Ensure::Unregistered => {
                matches!(state, MachineState::Unregistered | MachineState::Absent)
            }
        }
    }
}

impl fmt::Display for Ensure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Ensure {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "present" => Ok(Ensure::Present),
            "absent" => Ok(Ensure::Absent),
            "unregistered" => Ok(Ensure::Unregistered),
            _ => Err(ModelError::InvalidValue {
                kind: "ensure",
                value: s.to_string(),
                expected: "present, absent, unregistered",
            }),
        }
    }
}

/// Desired state for one machine, as authored by the front end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredState {
    /// Identity of the machine.
    pub path: MachinePath,

    pub ensure: Ensure,

    /// Compute resource whose pool receives a newly created machine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compute: Option<String>,

    /// Inventory path of the template to clone from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_count: Option<u32>,
}

impl DesiredState {
    /// Create a desired state with only the identity and ensure value set.
    pub fn new(path: MachinePath, ensure: Ensure) -> Self {
        Self {
            path,
            ensure,
            compute: None,
            template_path: None,
            memory_mb: None,
            cpu_count: None,
        }
    }

    pub fn with_compute(mut self, compute: impl Into<String>) -> Self {
        self.compute = Some(compute.into());
        self
    }

    pub fn with_template(mut self, template_path: impl Into<String>) -> Self {
        self.template_path = Some(template_path.into());
        self
    }

    pub fn with_hardware(mut self, memory_mb: u32, cpu_count: u32) -> Self {
        self.memory_mb = Some(memory_mb);
        self.cpu_count = Some(cpu_count);
        self
    }

    /// Same desired state with a different ensure value.
    pub fn with_ensure(&self, ensure: Ensure) -> Self {
        Self {
            ensure,
            ..self.clone()
        }
    }
}

// =============================================================================
// Observed state
// =============================================================================

/// Power state reported by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PowerState {
    PoweredOn,
    PoweredOff,
    Suspended,
    #[serde(other)]
    Unknown,
}

impl PowerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PowerState::PoweredOn => "poweredOn",
            PowerState::PoweredOff => "poweredOff",
            PowerState::Suspended => "suspended",
            PowerState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for PowerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Class of backing file kept on the datastore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileClass {
    /// `<name>.vmx`
    Config,
    /// `<name>.vmdk`, `<name>_1.vmdk`, ...
    Disk,
}

impl FileClass {
    pub const ALL: [FileClass; 2] = [FileClass::Config, FileClass::Disk];

    pub fn as_str(&self) -> &'static str {
        match self {
            FileClass::Config => "config",
            FileClass::Disk => "disk",
        }
    }

    /// Glob handed to the datastore search for a machine name.
    pub fn search_pattern(&self, name: &str) -> String {
        match self {
            FileClass::Config => format!("{name}.vmx"),
            FileClass::Disk => format!("{name}*.vmdk"),
        }
    }

    /// Returns true if `file` (a bare file name) belongs to this class for `name`.
    ///
    /// Disk descriptors are `<name>.vmdk` or `<name>_<n>.vmdk`. Extent files
    /// such as `<name>_1-flat.vmdk` are owned by their descriptor and ignored.
    pub fn matches(&self, name: &str, file: &str) -> bool {
        match self {
            FileClass::Config => file == format!("{name}.vmx"),
            FileClass::Disk => {
                let Some(stem) = file
                    .strip_prefix(name)
                    .and_then(|rest| rest.strip_suffix(".vmdk"))
                else {
                    return false;
                };
                match stem.strip_prefix('_') {
                    None => stem.is_empty(),
                    Some(n) => !n.is_empty() && n.bytes().all(|b| b.is_ascii_digit()),
                }
            }
        }
    }
}

impl fmt::Display for FileClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Format a datastore path, e.g. `[datastore1] web01/web01.vmx`.
pub fn datastore_path(datastore: &str, relative: &str) -> String {
    format!("[{datastore}] {relative}")
}

/// Split a datastore path into `(datastore, relative)`.
pub fn parse_datastore_path(path: &str) -> Option<(&str, &str)> {
    let rest = path.strip_prefix('[')?;
    let (datastore, relative) = rest.split_once("] ")?;
    if datastore.is_empty() || relative.is_empty() {
        return None;
    }
    Some((datastore, relative))
}

/// Registration of a machine in the hypervisor inventory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Registration {
    /// Backend identity of the registered object.
    pub machine_id: String,
    pub power_state: PowerState,
}

/// Backing files found on the datastore for a machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackingFiles {
    /// Datastore that was probed.
    pub datastore: String,
    /// Datastore paths of configuration files.
    #[serde(default)]
    pub config: Vec<String>,
    /// Datastore paths of disk descriptors.
    #[serde(default)]
    pub disks: Vec<String>,
}

impl BackingFiles {
    /// No files on the given datastore.
    pub fn none(datastore: impl Into<String>) -> Self {
        Self {
            datastore: datastore.into(),
            config: Vec::new(),
            disks: Vec::new(),
        }
    }

    pub fn files(&self, class: FileClass) -> &[String] {
        match class {
            FileClass::Config => &self.config,
            FileClass::Disk => &self.disks,
        }
    }

    pub fn has(&self, class: FileClass) -> bool {
        !self.files(class).is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.config.is_empty() && self.disks.is_empty()
    }
}

/// Snapshot of a machine as observed at the start (or end) of one convergence call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedState {
    /// Inventory registration, `None` when the path lookup found nothing.
    pub registration: Option<Registration>,
    pub backing_files: BackingFiles,
}

impl ObservedState {
    /// A machine that is neither registered nor backed by files.
    pub fn not_found(datastore: impl Into<String>) -> Self {
        Self {
            registration: None,
            backing_files: BackingFiles::none(datastore),
        }
    }

    pub fn exists(&self) -> bool {
        self.registered() || self.backing_files_present()
    }

    pub fn registered(&self) -> bool {
        self.registration.is_some()
    }

    /// Power state of the registered machine, `Unknown` when not registered.
    pub fn power_state(&self) -> PowerState {
        self.registration
            .as_ref()
            .map(|r| r.power_state)
            .unwrap_or(PowerState::Unknown)
    }

    pub fn backing_files_present(&self) -> bool {
        !self.backing_files.is_empty()
    }

    pub fn machine_state(&self) -> MachineState {
        MachineState::from(self)
    }
}

/// Conceptual lifecycle state derived from an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineState {
    /// No registration, no files.
    Absent,
    /// Files present, not registered.
    Unregistered,
    /// Registered, any power state.
    Present,
}

impl MachineState {
    /// The ensure value that describes this state.
    pub fn as_ensure(&self) -> Ensure {
        match self {
            MachineState::Absent => Ensure::Absent,
            MachineState::Unregistered => Ensure::Unregistered,
            MachineState::Present => Ensure::Present,
        }
    }
}

impl From<&ObservedState> for MachineState {
    fn from(observed: &ObservedState) -> Self {
        if observed.registered() {
            MachineState::Present
        } else if observed.backing_files_present() {
            MachineState::Unregistered
        } else {
            MachineState::Absent
        }
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ensure().as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(config: &[&str], disks: &[&str]) -> BackingFiles {
        BackingFiles {
            datastore: "ds1".to_string(),
            config: config.iter().map(|s| s.to_string()).collect(),
            disks: disks.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_ensure_parse_and_display() {
        for ensure in Ensure::ALL {
            assert_eq!(ensure.as_str().parse::<Ensure>().unwrap(), ensure);
        }
        let err = "running".parse::<Ensure>().unwrap_err();
        assert!(!err.is_path_error());
    }

    #[test]
    fn test_ensure_accepts() {
        assert!(Ensure::Present.accepts(MachineState::Present));
        assert!(!Ensure::Present.accepts(MachineState::Unregistered));
        assert!(Ensure::Absent.accepts(MachineState::Absent));
        assert!(!Ensure::Absent.accepts(MachineState::Unregistered));
        assert!(Ensure::Unregistered.accepts(MachineState::Unregistered));
        assert!(Ensure::Unregistered.accepts(MachineState::Absent));
        assert!(!Ensure::Unregistered.accepts(MachineState::Present));
    }

    #[test]
    fn test_disk_file_matching() {
        let disk = FileClass::Disk;
        assert!(disk.matches("web01", "web01.vmdk"));
        assert!(disk.matches("web01", "web01_1.vmdk"));
        assert!(disk.matches("web01", "web01_12.vmdk"));
        assert!(!disk.matches("web01", "web01_1-flat.vmdk"));
        assert!(!disk.matches("web01", "web01_.vmdk"));
        assert!(!disk.matches("web01", "web012.vmdk"));
        assert!(!disk.matches("web01", "web01.vmx"));
        assert!(FileClass::Config.matches("web01", "web01.vmx"));
        assert!(!FileClass::Config.matches("web01", "web01.vmx.lck"));
    }

    #[test]
    fn test_datastore_paths() {
        let path = datastore_path("ds1", "web01/web01.vmx");
        assert_eq!(path, "[ds1] web01/web01.vmx");
        assert_eq!(parse_datastore_path(&path), Some(("ds1", "web01/web01.vmx")));
        assert_eq!(parse_datastore_path("ds1/web01.vmx"), None);
        assert_eq!(parse_datastore_path("[] web01.vmx"), None);
    }

    #[test]
    fn test_machine_state_from_observation() {
        let mut observed = ObservedState::not_found("ds1");
        assert_eq!(observed.machine_state(), MachineState::Absent);
        assert!(!observed.exists());
        assert_eq!(observed.power_state(), PowerState::Unknown);

        observed.backing_files = files(&["[ds1] a/a.vmx"], &["[ds1] a/a_1.vmdk"]);
        assert_eq!(observed.machine_state(), MachineState::Unregistered);
        assert!(observed.exists());

        observed.registration = Some(Registration {
            machine_id: "vm-42".to_string(),
            power_state: PowerState::PoweredOn,
        });
        assert_eq!(observed.machine_state(), MachineState::Present);
        assert_eq!(observed.power_state(), PowerState::PoweredOn);
    }

    #[test]
    fn test_power_state_serde() {
        let json = serde_json::to_string(&PowerState::PoweredOn).unwrap();
        assert_eq!(json, "\"poweredOn\"");
        let parsed: PowerState = serde_json::from_str("\"somethingElse\"").unwrap();
        assert_eq!(parsed, PowerState::Unknown);
    }

    #[test]
    fn test_desired_state_deserialize() {
        let desired: DesiredState = serde_json::from_value(serde_json::json!({
            "path": "/opdx1/vm/eng/web01",
            "ensure": "unregistered",
            "memory_mb": 512,
        }))
        .unwrap();
        assert_eq!(desired.ensure, Ensure::Unregistered);
        assert_eq!(desired.memory_mb, Some(512));
        assert_eq!(desired.compute, None);
    }
}
