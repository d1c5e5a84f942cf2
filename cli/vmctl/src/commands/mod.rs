//! CLI commands.

mod apply;
mod plan;
mod resource;
mod watch;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use vmlife_converger::{Config, Engine, HttpHypervisor, Hypervisor, MockHypervisor};
use vmlife_model::DesiredState;

use crate::output::{LogFormat, OutputFormat};

/// vmctl - Converge virtual machines to present, absent or unregistered.
#[derive(Debug, Parser)]
#[command(name = "vmctl")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Output format.
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Table)]
    format: OutputFormat,

    /// Log format on stderr.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Log filter, overridden by RUST_LOG.
    #[arg(long, global = true, env = "VMLIFE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Management API URL.
    #[arg(long, global = true, env = "VMLIFE_ENDPOINT")]
    endpoint: Option<String>,

    /// Datastore probed for files of unregistered machines.
    #[arg(long, global = true, env = "VMLIFE_DATASTORE")]
    datastore: Option<String>,

    /// Use an in-memory hypervisor instead of the management API.
    #[arg(long, global = true)]
    mock: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Converge every machine in the manifests.
    Apply(apply::ApplyCommand),

    /// Show the operations `apply` would run, without running them.
    Plan(plan::PlanCommand),

    /// Show the observed state of one machine.
    Resource(resource::ResourceCommand),

    /// Converge the manifests repeatedly until interrupted.
    Watch(watch::WatchCommand),

    /// Show CLI version.
    Version,
}

impl Cli {
    /// Run the CLI command.
    pub async fn run(self) -> Result<()> {
        let mut config = Config::from_env();
        if let Some(endpoint) = self.endpoint {
            config.endpoint = endpoint;
        }
        if let Some(datastore) = self.datastore {
            config.datastore = datastore;
        }
        config.log_level = self.log_level;

        let ctx = CommandContext {
            config,
            format: self.format,
            mock: self.mock,
        };

        match self.command {
            Commands::Apply(cmd) => cmd.run(ctx).await,
            Commands::Plan(cmd) => cmd.run(ctx).await,
            Commands::Resource(cmd) => cmd.run(ctx).await,
            Commands::Watch(cmd) => cmd.run(ctx).await,
            Commands::Version => {
                println!("vmctl {}", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
        }
    }
}

/// Shared command context.
pub struct CommandContext {
    pub config: Config,
    pub format: OutputFormat,
    pub mock: bool,
}

impl CommandContext {
    /// Build the hypervisor client.
    ///
    /// The mock starts empty apart from the templates `machines` clone from.
    pub fn hypervisor(&self, machines: &[DesiredState]) -> Result<Arc<dyn Hypervisor>> {
        if self.mock {
            info!(datastore = %self.config.datastore, "Using in-memory hypervisor");
            let mock = machines
                .iter()
                .filter_map(|d| d.template_path.clone())
                .fold(MockHypervisor::new(self.config.datastore.clone()), |mock, t| {
                    mock.with_template(t)
                });
            return Ok(Arc::new(mock));
        }

        info!(endpoint = %self.config.endpoint, "Using management API");
        let client =
            HttpHypervisor::new(&self.config).context("failed to create management API client")?;
        Ok(Arc::new(client))
    }

    /// Build an engine for `machines`.
    pub fn engine(&self, machines: &[DesiredState]) -> Result<Engine> {
        let hypervisor = self.hypervisor(machines)?;
        Ok(Engine::from_config(hypervisor, &self.config))
    }
}
