//! Output formatting for CLI commands.

use clap::ValueEnum;
use colored::Colorize;
use serde::Serialize;
use vmlife_converger::{ConvergenceResult, GuardError};
use vmlife_model::{DesiredState, Ensure, MachinePath, MachineState, ObservedState};
use vmlife_reconcile::Operation;

/// Output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text.
    #[default]
    Table,
    /// JSON format.
    Json,
}

/// Print a single item as pretty JSON.
pub fn print_single<T: Serialize + ?Sized>(data: &T) {
    let json = serde_json::to_string_pretty(data).unwrap_or_else(|_| "{}".to_string());
    println!("{}", json);
}

/// Print a success message.
pub fn print_success(message: &str) {
    println!("{} {}", "Success:".green().bold(), message);
}

/// Print an info message.
pub fn print_info(message: &str) {
    println!("{} {}", "Info:".blue().bold(), message);
}

/// Print a failure message.
pub fn print_failure(message: &str) {
    println!("{} {}", "Failed:".red().bold(), message);
}

/// Log format on stderr.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Ensure value as a resource listing reports it: registration alone
/// decides between `present` and `absent`.
fn listed_ensure(observed: &ObservedState) -> Ensure {
    if observed.registered() {
        Ensure::Present
    } else {
        Ensure::Absent
    }
}

/// Render an observation as a puppet-style resource block.
///
/// ```text
/// vsphere_machine { '/opdx1/vm/eng/web01':
///   ensure      => 'present',
///   power_state => 'poweredOn',
/// }
/// ```
///
/// An unregistered machine lists as `absent`, with `backing_files` marking
/// the files it left on the datastore.
pub fn render_resource(path: &MachinePath, observed: &ObservedState) -> String {
    let mut attributes = vec![("ensure", listed_ensure(observed).to_string())];
    match observed.machine_state() {
        MachineState::Present => {
            attributes.push(("power_state", observed.power_state().to_string()))
        }
        MachineState::Unregistered => attributes.push(("backing_files", "present".to_string())),
        MachineState::Absent => {}
    }

    let width = attributes.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
    let mut out = format!("vsphere_machine {{ '{path}':\n");
    for (key, value) in &attributes {
        out.push_str(&format!("  {key:<width$} => '{value}',\n"));
    }
    out.push('}');
    out
}

/// Observation summary for `--format json`.
#[derive(Debug, Serialize)]
pub struct ResourceView<'a> {
    pub path: &'a MachinePath,
    pub ensure: Ensure,
    /// Lifecycle state, telling an unregistered machine from a gone one.
    pub state: MachineState,
    pub backing_files: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub power_state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<&'a str>,
    pub config_files: &'a [String],
    pub disk_files: &'a [String],
}

impl<'a> ResourceView<'a> {
    pub fn new(path: &'a MachinePath, observed: &'a ObservedState) -> Self {
        Self {
            path,
            ensure: listed_ensure(observed),
            state: observed.machine_state(),
            backing_files: observed.backing_files_present(),
            power_state: observed
                .registered()
                .then(|| observed.power_state().to_string()),
            machine_id: observed
                .registration
                .as_ref()
                .map(|r| r.machine_id.as_str()),
            config_files: &observed.backing_files.config,
            disk_files: &observed.backing_files.disks,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    Changed,
    Unchanged,
    Failed,
}

#[derive(Debug, Serialize)]
pub struct ReportError {
    pub kind: &'static str,
    pub message: String,
}

/// Result of one convergence call, as reported to the user.
#[derive(Debug, Serialize)]
pub struct MachineReport {
    pub path: MachinePath,
    pub desired: Ensure,
    pub status: ReportStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ensure: Option<Ensure>,
    pub operations: Vec<Operation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ReportError>,
}

impl MachineReport {
    pub fn new(desired: &DesiredState, outcome: Result<ConvergenceResult, GuardError>) -> Self {
        match outcome {
            Ok(result) => Self {
                path: result.path,
                desired: desired.ensure,
                status: if result.changed {
                    ReportStatus::Changed
                } else {
                    ReportStatus::Unchanged
                },
                ensure: Some(result.ensure),
                operations: result.operations,
                error: None,
            },
            Err(err) => {
                let operations = match &err {
                    GuardError::Converge(e) => e.completed().to_vec(),
                    GuardError::TimedOut { .. } => Vec::new(),
                };
                Self {
                    path: desired.path.clone(),
                    desired: desired.ensure,
                    status: ReportStatus::Failed,
                    ensure: None,
                    operations,
                    error: Some(ReportError {
                        kind: err.kind().map(|k| k.as_str()).unwrap_or("timed_out"),
                        message: err.to_string(),
                    }),
                }
            }
        }
    }

    pub fn failed(&self) -> bool {
        self.status == ReportStatus::Failed
    }

    fn summary(&self) -> String {
        let operations = self
            .operations
            .iter()
            .map(|op| op.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        match (&self.status, &self.error) {
            (ReportStatus::Unchanged, _) => {
                format!("{}: already {}", self.path, self.ensure.unwrap_or(self.desired))
            }
            (ReportStatus::Changed, _) => format!(
                "{}: ensure={} [{}]",
                self.path,
                self.ensure.unwrap_or(self.desired),
                operations
            ),
            (ReportStatus::Failed, Some(error)) => error.message.clone(),
            (ReportStatus::Failed, None) => format!("{}: failed", self.path),
        }
    }
}

/// Print one line per machine, or a JSON array.
pub fn print_reports(reports: &[MachineReport], format: OutputFormat) {
    match format {
        OutputFormat::Json => print_single(reports),
        OutputFormat::Table => {
            for report in reports {
                match report.status {
                    ReportStatus::Changed => print_success(&report.summary()),
                    ReportStatus::Unchanged => print_info(&report.summary()),
                    ReportStatus::Failed => print_failure(&report.summary()),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmlife_model::{BackingFiles, PowerState, Registration};

    fn web01() -> MachinePath {
        MachinePath::parse("/opdx1/vm/eng/web01").unwrap()
    }

    fn files() -> BackingFiles {
        BackingFiles {
            datastore: "ds1".to_string(),
            config: vec!["[ds1] web01/web01.vmx".to_string()],
            disks: vec!["[ds1] web01/web01_1.vmdk".to_string()],
        }
    }

    #[test]
    fn renders_absent_resource() {
        let observed = ObservedState::not_found("ds1");
        assert_eq!(
            render_resource(&web01(), &observed),
            "vsphere_machine { '/opdx1/vm/eng/web01':\n  ensure => 'absent',\n}"
        );
    }

    #[test]
    fn renders_unregistered_resource() {
        let observed = ObservedState {
            registration: None,
            backing_files: files(),
        };
        assert_eq!(
            render_resource(&web01(), &observed),
            "vsphere_machine { '/opdx1/vm/eng/web01':\n  \
             ensure        => 'absent',\n  \
             backing_files => 'present',\n}"
        );

        let json = serde_json::to_value(ResourceView::new(&web01(), &observed)).unwrap();
        assert_eq!(json["ensure"], "absent");
        assert_eq!(json["state"], "unregistered");
        assert_eq!(json["backing_files"], true);
        assert!(json.get("power_state").is_none());
    }

    #[test]
    fn renders_present_resource_with_power_state() {
        let observed = ObservedState {
            registration: Some(Registration {
                machine_id: "vm-7".to_string(),
                power_state: PowerState::PoweredOn,
            }),
            backing_files: files(),
        };
        assert_eq!(
            render_resource(&web01(), &observed),
            "vsphere_machine { '/opdx1/vm/eng/web01':\n  \
             ensure      => 'present',\n  \
             power_state => 'poweredOn',\n}"
        );

        let json = serde_json::to_value(ResourceView::new(&web01(), &observed)).unwrap();
        assert_eq!(json["ensure"], "present");
        assert_eq!(json["state"], "present");
        assert_eq!(json["machine_id"], "vm-7");
        assert_eq!(json["disk_files"][0], "[ds1] web01/web01_1.vmdk");
    }

    #[test]
    fn report_for_timeout() {
        let desired = DesiredState::new(web01(), Ensure::Absent);
        let report = MachineReport::new(
            &desired,
            Err(GuardError::TimedOut {
                path: web01(),
                after: std::time::Duration::from_secs(5),
            }),
        );
        assert!(report.failed());
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["error"]["kind"], "timed_out");
        assert!(json.get("ensure").is_none());
    }
}
