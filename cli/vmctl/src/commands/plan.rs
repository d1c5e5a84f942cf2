//! Plan command: observe and plan, never execute.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use colored::Colorize;
use futures_util::future::join_all;
use serde::Serialize;
use vmlife_converger::ConvergeError;
use vmlife_model::{DesiredState, Ensure, MachinePath, MachineState, ObservedState};
use vmlife_reconcile::{Operation, OperationPlan};

use crate::error::CliError;
use crate::manifest::load_manifests;
use crate::output::{print_failure, print_single, OutputFormat};

use super::CommandContext;

/// Show the operations `apply` would run.
#[derive(Debug, Args)]
pub struct PlanCommand {
    /// Manifest file (TOML). Repeatable.
    #[arg(short = 'f', long = "file", value_name = "PATH", required = true)]
    pub files: Vec<PathBuf>,
}

#[derive(Debug, Serialize)]
struct PlanView {
    path: MachinePath,
    ensure: Ensure,
    #[serde(skip_serializing_if = "Option::is_none")]
    observed: Option<MachineState>,
    operations: Vec<Operation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl PlanView {
    fn new(
        desired: &DesiredState,
        outcome: Result<(ObservedState, OperationPlan), ConvergeError>,
    ) -> Self {
        match outcome {
            Ok((observed, plan)) => Self {
                path: desired.path.clone(),
                ensure: desired.ensure,
                observed: Some(observed.machine_state()),
                operations: plan.operations().to_vec(),
                error: None,
            },
            Err(err) => Self {
                path: desired.path.clone(),
                ensure: desired.ensure,
                observed: None,
                operations: Vec::new(),
                error: Some(err.to_string()),
            },
        }
    }

    fn line(&self) -> String {
        let observed = self
            .observed
            .map(|s| s.to_string())
            .unwrap_or_else(|| "?".to_string());
        if self.operations.is_empty() {
            return format!("{}: {} (no changes)", self.path, observed);
        }
        let operations = self
            .operations
            .iter()
            .map(|op| op.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "{}: {} -> {} [{}]",
            self.path, observed, self.ensure, operations
        )
    }
}

impl PlanCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let machines = load_manifests(&self.files)?;
        let engine = ctx.engine(&machines)?;

        let outcomes = join_all(machines.iter().map(|d| engine.plan(d))).await;
        let views: Vec<PlanView> = machines
            .iter()
            .zip(outcomes)
            .map(|(desired, outcome)| PlanView::new(desired, outcome))
            .collect();

        match ctx.format {
            OutputFormat::Json => print_single(&views),
            OutputFormat::Table => {
                println!("{}", "Plan:".bold());
                for view in &views {
                    match &view.error {
                        Some(error) => print_failure(error),
                        None => println!("- {}", view.line()),
                    }
                }
            }
        }

        let failed = views.iter().filter(|v| v.error.is_some()).count();
        if failed > 0 {
            return Err(CliError::PlanFailed {
                failed,
                total: views.len(),
            }
            .into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plan_line() {
        let view = PlanView {
            path: MachinePath::parse("/opdx1/vm/eng/web01").unwrap(),
            ensure: Ensure::Unregistered,
            observed: Some(MachineState::Present),
            operations: vec![Operation::PowerOff, Operation::Unregister],
            error: None,
        };
        assert_eq!(
            view.line(),
            "/opdx1/vm/eng/web01: present -> unregistered [powerOff, unregister]"
        );
    }
}
