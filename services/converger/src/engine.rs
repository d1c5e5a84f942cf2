//! Reconciliation engine.
//!
//! One call to [`Engine::converge`]:
//! 1. reads a fresh [`ObservedState`]
//! 2. builds the plan with [`vmlife_reconcile::plan`]
//! 3. executes each step as a hypervisor task, awaiting it before the next
//! 4. re-reads the machine and verifies the post-state
//!
//! The re-read probes the datastore folder of the first read when the
//! machine is no longer registered, so files left behind by `unregister`
//! stay in view.
//!
//! The first failing step aborts the rest of the plan. Nothing is retried
//! and nothing is remembered between calls.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use vmlife_model::{DesiredState, Ensure, FileClass, MachinePath, ObservedState};
use vmlife_reconcile::{plan, verify, Operation, OperationPlan, PlanError, PlanPolicy};

use crate::config::Config;
use crate::error::ConvergeError;
use crate::hypervisor::{Hypervisor, TaskRequest};
use crate::observe::{FileLocation, ObservedStateReader};

/// Outcome of a successful convergence call.
#[derive(Debug, Clone, Serialize)]
pub struct ConvergenceResult {
    pub path: MachinePath,

    /// Ensure value describing the final observed state.
    pub ensure: Ensure,

    /// True if any operation was executed.
    pub changed: bool,

    /// Operations executed, in order.
    pub operations: Vec<Operation>,

    /// Final observation.
    pub observed: ObservedState,

    pub finished_at: DateTime<Utc>,
}

/// Reconciliation engine.
pub struct Engine {
    hypervisor: Arc<dyn Hypervisor>,
    reader: ObservedStateReader,
    policy: PlanPolicy,
}

impl Engine {
    /// Create a new engine.
    pub fn new(
        hypervisor: Arc<dyn Hypervisor>,
        default_datastore: impl Into<String>,
        policy: PlanPolicy,
    ) -> Self {
        let reader = ObservedStateReader::new(Arc::clone(&hypervisor), default_datastore);
        Self {
            hypervisor,
            reader,
            policy,
        }
    }

    /// Create an engine using the datastore and policy from configuration.
    pub fn from_config(hypervisor: Arc<dyn Hypervisor>, config: &Config) -> Self {
        Self::new(hypervisor, config.datastore.clone(), config.plan_policy())
    }

    /// Observe the machine at `path`.
    pub async fn observe(&self, path: &MachinePath) -> Result<ObservedState, ConvergeError> {
        self.reader
            .read(path)
            .await
            .map_err(|source| ConvergeError::ObservationFailed {
                path: path.clone(),
                source,
            })
    }

    async fn observe_from(
        &self,
        path: &MachinePath,
        fallback: Option<&FileLocation>,
    ) -> Result<(ObservedState, FileLocation), ConvergeError> {
        self.reader
            .read_from(path, fallback)
            .await
            .map_err(|source| ConvergeError::ObservationFailed {
                path: path.clone(),
                source,
            })
    }

    /// Observe and plan without executing anything.
    pub async fn plan(
        &self,
        desired: &DesiredState,
    ) -> Result<(ObservedState, OperationPlan), ConvergeError> {
        self.located_plan(desired)
            .await
            .map(|(observed, _, plan)| (observed, plan))
    }

    async fn located_plan(
        &self,
        desired: &DesiredState,
    ) -> Result<(ObservedState, FileLocation, OperationPlan), ConvergeError> {
        let (observed, location) = self.observe_from(&desired.path, None).await?;
        let plan = plan(desired, &observed, self.policy)
            .map_err(|e| ConvergeError::from_plan(&desired.path, e))?;
        Ok((observed, location, plan))
    }

    /// Converge the machine to `desired`.
    pub async fn converge(&self, desired: &DesiredState) -> Result<ConvergenceResult, ConvergeError> {
        let path = &desired.path;
        let (observed, location, plan) = self.located_plan(desired).await?;

        if plan.is_empty() {
            debug!(
                path = %path,
                ensure = %desired.ensure,
                state = %observed.machine_state(),
                "Already converged"
            );
            return Ok(ConvergenceResult {
                path: path.clone(),
                ensure: observed.machine_state().as_ensure(),
                changed: false,
                operations: Vec::new(),
                observed,
                finished_at: Utc::now(),
            });
        }

        info!(
            path = %path,
            ensure = %desired.ensure,
            from = %observed.machine_state(),
            plan = %plan,
            "Executing plan"
        );

        self.execute(desired, &observed, &plan).await?;

        let (after, _) = self.observe_from(path, Some(&location)).await?;
        if let Err(failure) = verify(desired, &plan, &observed, &after) {
            warn!(path = %path, error = %failure, "Verification failed");
            return Err(ConvergeError::VerificationFailed {
                path: path.clone(),
                executed: plan.operations().to_vec(),
                failure,
                observed: Box::new(after),
            });
        }

        info!(path = %path, ensure = %desired.ensure, "Converged");

        Ok(ConvergenceResult {
            path: path.clone(),
            ensure: after.machine_state().as_ensure(),
            changed: true,
            operations: plan.operations().to_vec(),
            observed: after,
            finished_at: Utc::now(),
        })
    }

    /// Run every step in order, stopping at the first fault.
    async fn execute(
        &self,
        desired: &DesiredState,
        observed: &ObservedState,
        plan: &OperationPlan,
    ) -> Result<(), ConvergeError> {
        let mut machine_id = observed.registration.as_ref().map(|r| r.machine_id.clone());
        let mut completed = Vec::with_capacity(plan.len());

        for operation in plan {
            let request = task_request(*operation, desired, observed, machine_id.as_deref())
                .map_err(|e| ConvergeError::from_plan(&desired.path, e))?;

            debug!(path = %desired.path, operation = %operation, "Submitting step");

            let outcome = self.hypervisor.run_task(request).await.map_err(|source| {
                warn!(
                    path = %desired.path,
                    operation = %operation,
                    error = %source,
                    "Step failed, aborting plan"
                );
                ConvergeError::OperationFault {
                    path: desired.path.clone(),
                    operation: *operation,
                    completed: completed.clone(),
                    source,
                }
            })?;

            if let Some(created) = outcome.machine_id {
                machine_id = Some(created);
            }
            completed.push(*operation);
        }

        Ok(())
    }
}

/// Translate a plan step into a backend task.
fn task_request(
    operation: Operation,
    desired: &DesiredState,
    observed: &ObservedState,
    machine_id: Option<&str>,
) -> Result<TaskRequest, PlanError> {
    let from = observed.machine_state();
    let registered = |op: fn(String) -> TaskRequest| {
        machine_id
            .map(|id| op(id.to_string()))
            .ok_or_else(|| PlanError::UnsupportedTransition {
                from,
                to: desired.ensure,
                reason: format!("{operation} needs a registered machine"),
            })
    };
    let field = |value: &Option<String>, name: &'static str| {
        value.clone().ok_or(PlanError::MissingField {
            field: name,
            from,
            ensure: desired.ensure,
        })
    };

    let path = &desired.path;
    let request = match operation {
        Operation::PowerOff => registered(|machine_id| TaskRequest::PowerOff { machine_id })?,
        Operation::PowerOn => registered(|machine_id| TaskRequest::PowerOn { machine_id })?,
        Operation::Unregister => registered(|machine_id| TaskRequest::Unregister { machine_id })?,
        Operation::Destroy => registered(|machine_id| TaskRequest::Destroy { machine_id })?,
        Operation::DeleteFiles(class) => TaskRequest::DeleteFiles {
            datastore: observed.backing_files.datastore.clone(),
            paths: observed.backing_files.files(class).to_vec(),
        },
        Operation::CloneAndPowerOn => TaskRequest::CloneMachine {
            template_path: field(&desired.template_path, "template_path")?,
            compute: field(&desired.compute, "compute")?,
            folder: path.folder().to_string(),
            name: path.name().to_string(),
            memory_mb: desired.memory_mb,
            cpu_count: desired.cpu_count,
            power_on: true,
        },
        Operation::Register => TaskRequest::Register {
            vmx_path: observed
                .backing_files
                .files(FileClass::Config)
                .first()
                .cloned()
                .ok_or_else(|| PlanError::UnsupportedTransition {
                    from,
                    to: desired.ensure,
                    reason: "no configuration file left to register".to_string(),
                })?,
            compute: field(&desired.compute, "compute")?,
            folder: path.folder().to_string(),
            name: path.name().to_string(),
        },
    };

    Ok(request)
}
