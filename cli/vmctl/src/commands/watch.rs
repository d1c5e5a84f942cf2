//! Watch command: converge the manifests on an interval until Ctrl+C.
//!
//! A failed machine is not retried within a pass. The next pass starts from
//! a fresh observation.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Args;
use tracing::{info, warn};
use vmlife_converger::ConvergeGuard;
use vmlife_reconcile::DEFAULT_RECONCILE_INTERVAL;

use crate::manifest::load_manifests;
use crate::output::{print_reports, ReportStatus};

use super::apply::converge_all;
use super::CommandContext;

/// Converge the manifests repeatedly until interrupted.
#[derive(Debug, Args)]
pub struct WatchCommand {
    /// Manifest file (TOML). Repeatable.
    #[arg(short = 'f', long = "file", value_name = "PATH", required = true)]
    pub files: Vec<PathBuf>,

    /// Seconds between passes.
    #[arg(long, default_value_t = DEFAULT_RECONCILE_INTERVAL.as_secs())]
    pub interval_secs: u64,

    /// Abandon a machine's convergence after this many seconds.
    #[arg(long)]
    pub timeout_secs: Option<u64>,
}

impl WatchCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let machines = load_manifests(&self.files)?;
        let guard = ConvergeGuard::new(Arc::new(ctx.engine(&machines)?));
        let timeout = self.timeout_secs.map(Duration::from_secs);

        info!(
            machines = machines.len(),
            interval_secs = self.interval_secs,
            "Starting watch loop"
        );

        let mut interval = tokio::time::interval(Duration::from_secs(self.interval_secs.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut pass: u64 = 0;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    pass += 1;
                    let reports = converge_all(&guard, &machines, timeout).await;
                    let changed = reports.iter().filter(|r| r.status == ReportStatus::Changed).count();
                    let failed = reports.iter().filter(|r| r.failed()).count();
                    if failed > 0 {
                        warn!(pass, changed, failed, "Pass finished with failures");
                    } else {
                        info!(pass, changed, "Pass finished");
                    }
                    if changed > 0 || failed > 0 {
                        print_reports(&reports, ctx.format);
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    info!(passes = pass, "Watch loop shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}
