//! Apply command.
//!
//! Converges every machine in the manifests. Distinct paths converge
//! concurrently. The guard serializes calls for the same path, so a path
//! listed twice converges once per entry in manifest order.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Args;
use futures_util::future::join_all;
use vmlife_converger::ConvergeGuard;
use vmlife_model::DesiredState;

use crate::error::CliError;
use crate::manifest::load_manifests;
use crate::output::{print_reports, MachineReport};

use super::CommandContext;

/// Converge every machine in the manifests.
#[derive(Debug, Args)]
pub struct ApplyCommand {
    /// Manifest file (TOML). Repeatable.
    #[arg(short = 'f', long = "file", value_name = "PATH", required = true)]
    pub files: Vec<PathBuf>,

    /// Abandon a machine's convergence after this many seconds.
    #[arg(long)]
    pub timeout_secs: Option<u64>,
}

impl ApplyCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let machines = load_manifests(&self.files)?;
        let guard = ConvergeGuard::new(Arc::new(ctx.engine(&machines)?));
        let timeout = self.timeout_secs.map(Duration::from_secs);

        let reports = converge_all(&guard, &machines, timeout).await;
        print_reports(&reports, ctx.format);

        let failed = reports.iter().filter(|r| r.failed()).count();
        if failed > 0 {
            return Err(CliError::ConvergeFailed {
                failed,
                total: reports.len(),
            }
            .into());
        }
        Ok(())
    }
}

/// Converge `machines` concurrently, one report per machine in input order.
pub(super) async fn converge_all(
    guard: &ConvergeGuard,
    machines: &[DesiredState],
    timeout: Option<Duration>,
) -> Vec<MachineReport> {
    let outcomes = join_all(machines.iter().map(|d| guard.converge(d, timeout))).await;
    machines
        .iter()
        .zip(outcomes)
        .map(|(desired, outcome)| MachineReport::new(desired, outcome))
        .collect()
}
