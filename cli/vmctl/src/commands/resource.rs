//! Resource command: print the observed state of one machine.

use anyhow::{Context, Result};
use clap::Args;
use vmlife_model::MachinePath;

use crate::output::{print_single, render_resource, OutputFormat, ResourceView};

use super::CommandContext;

/// Show the observed state of one machine.
#[derive(Debug, Args)]
pub struct ResourceCommand {
    /// Inventory path, e.g. /opdx1/vm/eng/web01.
    pub path: String,
}

impl ResourceCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        let path = MachinePath::parse(&self.path)
            .with_context(|| format!("invalid machine path: {}", self.path))?;
        let engine = ctx.engine(&[])?;
        let observed = engine.observe(&path).await?;

        match ctx.format {
            OutputFormat::Json => print_single(&ResourceView::new(&path, &observed)),
            OutputFormat::Table => println!("{}", render_resource(&path, &observed)),
        }
        Ok(())
    }
}
