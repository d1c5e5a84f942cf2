//! In-memory hypervisor for testing and development.
//!
//! Tasks take effect at submission; `await_completion` returns the recorded
//! outcome. Backend rules the engine has to respect are enforced: a powered-on
//! machine refuses unregister and destroy, powering off a machine that is
//! already off faults, and deleting a missing file faults.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};
use vmlife_model::{datastore_path, parse_datastore_path, MachinePath, PowerState};

use super::{
    Hypervisor, HypervisorError, MachineRecord, TaskHandle, TaskOutcome, TaskRequest,
};

#[derive(Debug, Clone)]
struct MockMachine {
    machine_id: String,
    power_state: PowerState,
    datastore: String,
    folder: String,
}

#[derive(Debug, Default)]
struct MockState {
    machines: BTreeMap<MachinePath, MockMachine>,
    /// Full datastore paths, e.g. `[ds1] web01/web01.vmx`.
    files: BTreeSet<String>,
    templates: BTreeSet<String>,
    tasks: HashMap<String, Result<TaskOutcome, (String, String)>>,
    log: Vec<TaskRequest>,
    faults: HashMap<&'static str, String>,
    ignored: HashSet<&'static str>,
    lookup_failure: Option<String>,
    counter: u64,
}

impl MockState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.counter += 1;
        format!("{prefix}-{}", self.counter)
    }

    fn machine_by_id(
        &mut self,
        machine_id: &str,
    ) -> Result<(MachinePath, &mut MockMachine), (String, String)> {
        self.machines
            .iter_mut()
            .find(|(_, m)| m.machine_id == machine_id)
            .map(|(path, m)| (path.clone(), m))
            .ok_or_else(|| {
                (
                    "ManagedObjectNotFound".to_string(),
                    format!("no machine with id {machine_id}"),
                )
            })
    }

    fn apply(
        &mut self,
        request: &TaskRequest,
        default_datastore: &str,
    ) -> Result<TaskOutcome, (String, String)> {
        match request {
            TaskRequest::PowerOff { machine_id } => {
                let (_, machine) = self.machine_by_id(machine_id)?;
                if machine.power_state != PowerState::PoweredOn {
                    return Err(invalid_power(machine.power_state));
                }
                machine.power_state = PowerState::PoweredOff;
                Ok(TaskOutcome::default())
            }
            TaskRequest::PowerOn { machine_id } => {
                let (_, machine) = self.machine_by_id(machine_id)?;
                if machine.power_state == PowerState::PoweredOn {
                    return Err(invalid_power(machine.power_state));
                }
                machine.power_state = PowerState::PoweredOn;
                Ok(TaskOutcome::default())
            }
            TaskRequest::Unregister { machine_id } => {
                let (path, machine) = self.machine_by_id(machine_id)?;
                if machine.power_state == PowerState::PoweredOn {
                    return Err(invalid_power(machine.power_state));
                }
                self.machines.remove(&path);
                Ok(TaskOutcome::default())
            }
            TaskRequest::Destroy { machine_id } => {
                let (path, machine) = self.machine_by_id(machine_id)?;
                if machine.power_state == PowerState::PoweredOn {
                    return Err(invalid_power(machine.power_state));
                }
                let prefix = datastore_path(&machine.datastore, &format!("{}/", machine.folder));
                self.machines.remove(&path);
                self.files.retain(|f| !f.starts_with(&prefix));
                Ok(TaskOutcome::default())
            }
            TaskRequest::DeleteFiles { paths, .. } => {
                if let Some(missing) = paths.iter().find(|p| !self.files.contains(*p)) {
                    return Err((FILE_NOT_FOUND.to_string(), format!("{missing} not found")));
                }
                for path in paths {
                    self.files.remove(path);
                }
                Ok(TaskOutcome::default())
            }
            TaskRequest::CloneMachine {
                template_path,
                folder,
                name,
                power_on,
                ..
            } => {
                if !self.templates.contains(template_path) {
                    return Err(("NotFound".to_string(), format!("template {template_path}")));
                }
                let path = machine_path(folder, name)?;
                if self.machines.contains_key(&path) {
                    return Err(("DuplicateName".to_string(), path.to_string()));
                }
                let machine_id = self.next_id("vm");
                self.files
                    .insert(datastore_path(default_datastore, &format!("{name}/{name}.vmx")));
                self.files
                    .insert(datastore_path(default_datastore, &format!("{name}/{name}_1.vmdk")));
                self.machines.insert(
                    path,
                    MockMachine {
                        machine_id: machine_id.clone(),
                        power_state: if *power_on {
                            PowerState::PoweredOn
                        } else {
                            PowerState::PoweredOff
                        },
                        datastore: default_datastore.to_string(),
                        folder: name.clone(),
                    },
                );
                Ok(TaskOutcome {
                    machine_id: Some(machine_id),
                })
            }
            TaskRequest::Register {
                vmx_path,
                folder,
                name,
                ..
            } => {
                if !self.files.contains(vmx_path) {
                    return Err((FILE_NOT_FOUND.to_string(), format!("{vmx_path} not found")));
                }
                let (datastore, relative) = parse_datastore_path(vmx_path).ok_or_else(|| {
                    ("InvalidDatastorePath".to_string(), vmx_path.clone())
                })?;
                let files_folder = relative.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("");
                let path = machine_path(folder, name)?;
                if self.machines.contains_key(&path) {
                    return Err(("AlreadyExists".to_string(), path.to_string()));
                }
                let machine_id = self.next_id("vm");
                let machine = MockMachine {
                    machine_id: machine_id.clone(),
                    power_state: PowerState::PoweredOff,
                    datastore: datastore.to_string(),
                    folder: files_folder.to_string(),
                };
                self.machines.insert(path, machine);
                Ok(TaskOutcome {
                    machine_id: Some(machine_id),
                })
            }
        }
    }
}

const FILE_NOT_FOUND: &str = "FileNotFound";

fn invalid_power(state: PowerState) -> (String, String) {
    (
        "InvalidPowerState".to_string(),
        format!("operation not allowed in power state {state}"),
    )
}

fn machine_path(folder: &str, name: &str) -> Result<MachinePath, (String, String)> {
    MachinePath::parse(&format!("{}/{}", folder.trim_end_matches('/'), name))
        .map_err(|e| ("InvalidName".to_string(), e.to_string()))
}

/// Match `name` against a glob where `*` matches any run of characters.
fn glob_match(pattern: &str, name: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == name;
    }

    let (first, last) = (parts[0], parts[parts.len() - 1]);
    if !name.starts_with(first) || name.len() < first.len() + last.len() {
        return false;
    }
    let mut rest = &name[first.len()..];
    for middle in &parts[1..parts.len() - 1] {
        match rest.find(middle) {
            Some(idx) => rest = &rest[idx + middle.len()..],
            None => return false,
        }
    }
    rest.ends_with(last)
}

/// Mock hypervisor for testing and development.
pub struct MockHypervisor {
    datastore: String,
    state: Mutex<MockState>,
}

impl MockHypervisor {
    /// Create an empty mock whose clones land on `datastore`.
    pub fn new(datastore: impl Into<String>) -> Self {
        Self {
            datastore: datastore.into(),
            state: Mutex::new(MockState::default()),
        }
    }

    /// Make `template_path` available for cloning.
    pub fn with_template(mut self, template_path: impl Into<String>) -> Self {
        self.state.get_mut().templates.insert(template_path.into());
        self
    }

    /// Add a registered machine with config and disk files.
    pub fn with_machine(mut self, path: &MachinePath, power_state: PowerState) -> Self {
        let datastore = self.datastore.clone();
        let state = self.state.get_mut();
        let name = path.name().to_string();
        let machine_id = state.next_id("vm");
        state
            .files
            .insert(datastore_path(&datastore, &format!("{name}/{name}.vmx")));
        state
            .files
            .insert(datastore_path(&datastore, &format!("{name}/{name}_1.vmdk")));
        state.machines.insert(
            path.clone(),
            MockMachine {
                machine_id,
                power_state,
                datastore,
                folder: name,
            },
        );
        self
    }

    /// Add a powered-on machine with config and disk files.
    pub fn with_running_machine(self, path: &MachinePath) -> Self {
        self.with_machine(path, PowerState::PoweredOn)
    }

    /// Add backing files for `path` without registering it.
    pub fn with_unregistered_machine(mut self, path: &MachinePath) -> Self {
        let datastore = self.datastore.clone();
        let name = path.name();
        let state = self.state.get_mut();
        state
            .files
            .insert(datastore_path(&datastore, &format!("{name}/{name}.vmx")));
        state
            .files
            .insert(datastore_path(&datastore, &format!("{name}/{name}_1.vmdk")));
        self
    }

    /// Add an arbitrary file on a datastore.
    pub fn with_file(mut self, path: impl Into<String>) -> Self {
        self.state.get_mut().files.insert(path.into());
        self
    }

    /// Make every task of `kind` fault with `fault`.
    pub async fn fail_task(&self, kind: &'static str, fault: impl Into<String>) {
        self.state.lock().await.faults.insert(kind, fault.into());
    }

    /// Make every task of `kind` report success without any effect.
    pub async fn ignore_task(&self, kind: &'static str) {
        self.state.lock().await.ignored.insert(kind);
    }

    /// Make inventory lookups fail (`None` restores them).
    pub async fn fail_lookups(&self, message: Option<&str>) {
        self.state.lock().await.lookup_failure = message.map(str::to_string);
    }

    /// Every task submitted so far, in order.
    pub async fn task_log(&self) -> Vec<TaskRequest> {
        self.state.lock().await.log.clone()
    }

    /// File names under `folder` on `datastore` matching `pattern`, as a
    /// datastore browser would list them.
    pub async fn files_matching(
        &self,
        datastore: &str,
        folder: &str,
        pattern: &str,
    ) -> Vec<String> {
        let prefix = datastore_path(datastore, &format!("{folder}/"));
        let state = self.state.lock().await;
        state
            .files
            .iter()
            .filter_map(|f| f.strip_prefix(&prefix))
            .filter(|name| !name.contains('/') && glob_match(pattern, name))
            .map(str::to_string)
            .collect()
    }

    /// Current power state of the machine at `path`, if registered.
    pub async fn power_state(&self, path: &MachinePath) -> Option<PowerState> {
        self.state
            .lock()
            .await
            .machines
            .get(path)
            .map(|m| m.power_state)
    }
}

#[async_trait]
impl Hypervisor for MockHypervisor {
    async fn find_machine(
        &self,
        path: &MachinePath,
    ) -> Result<Option<MachineRecord>, HypervisorError> {
        let state = self.state.lock().await;
        if let Some(message) = &state.lookup_failure {
            return Err(HypervisorError::Unavailable(message.clone()));
        }

        Ok(state.machines.get(path).map(|m| MachineRecord {
            machine_id: m.machine_id.clone(),
            path: path.clone(),
            power_state: m.power_state,
            datastore: m.datastore.clone(),
            folder: m.folder.clone(),
        }))
    }

    async fn search_datastore(
        &self,
        datastore: &str,
        folder: &str,
        pattern: &str,
    ) -> Result<Vec<String>, HypervisorError> {
        Ok(self.files_matching(datastore, folder, pattern).await)
    }

    async fn submit_task(&self, request: TaskRequest) -> Result<TaskHandle, HypervisorError> {
        let mut state = self.state.lock().await;
        let op = request.kind();
        let task_id = state.next_id("task");

        let injected = state.faults.get(op).cloned();
        let outcome = if let Some(fault) = injected {
            Err((fault, format!("injected fault for {op}")))
        } else if state.ignored.contains(op) {
            Ok(TaskOutcome::default())
        } else {
            state.apply(&request, &self.datastore)
        };

        info!(task_id = %task_id, op, ok = outcome.is_ok(), "[MOCK] Task submitted");
        state.log.push(request);
        state.tasks.insert(task_id.clone(), outcome);

        Ok(TaskHandle { task_id, op })
    }

    async fn await_completion(&self, handle: &TaskHandle) -> Result<TaskOutcome, HypervisorError> {
        let state = self.state.lock().await;
        debug!(task = %handle, "[MOCK] Awaiting task");

        match state.tasks.get(&handle.task_id) {
            Some(Ok(outcome)) => Ok(outcome.clone()),
            Some(Err((fault, message))) => Err(HypervisorError::TaskFault {
                task_id: handle.task_id.clone(),
                op: handle.op,
                fault: fault.clone(),
                message: message.clone(),
            }),
            None => Err(HypervisorError::Api {
                status: 404,
                message: format!("unknown task {}", handle.task_id),
            }),
        }
    }
}
