//! Manifest parsing.
//!
//! A manifest lists the machines to converge:
//!
//! ```toml
//! [[machine]]
//! path = "/opdx1/vm/eng/web01"
//! ensure = "present"
//! compute = "general1"
//! template_path = "/eng/templates/debian-wheezy"
//! memory_mb = 512
//! cpu_count = 1
//! ```
//!
//! A path may be listed more than once. Its entries converge one after
//! another in manifest order.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use thiserror::Error;
use vmlife_model::{DesiredState, Ensure, MachinePath};

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("invalid manifest TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("manifest declares no machines")]
    Empty,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ManifestFile {
    #[serde(default)]
    machine: Vec<MachineEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MachineEntry {
    path: MachinePath,
    ensure: Ensure,
    compute: Option<String>,
    template_path: Option<String>,
    memory_mb: Option<u32>,
    cpu_count: Option<u32>,
}

impl From<MachineEntry> for DesiredState {
    fn from(entry: MachineEntry) -> Self {
        DesiredState {
            path: entry.path,
            ensure: entry.ensure,
            compute: entry.compute,
            template_path: entry.template_path,
            memory_mb: entry.memory_mb,
            cpu_count: entry.cpu_count,
        }
    }
}

/// Parse one manifest document.
pub fn parse_manifest(contents: &str) -> Result<Vec<DesiredState>, ManifestError> {
    let file: ManifestFile = toml::from_str(contents)?;
    Ok(file.machine.into_iter().map(DesiredState::from).collect())
}

/// Load and merge manifests, keeping file order.
pub fn load_manifests(paths: &[PathBuf]) -> Result<Vec<DesiredState>> {
    let mut machines = Vec::new();
    for path in paths {
        machines.extend(load_manifest(path)?);
    }
    check_machines(&machines)?;
    Ok(machines)
}

fn load_manifest(path: &Path) -> Result<Vec<DesiredState>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read manifest: {}", path.display()))?;
    parse_manifest(&contents).with_context(|| format!("invalid manifest: {}", path.display()))
}

fn check_machines(machines: &[DesiredState]) -> Result<(), ManifestError> {
    if machines.is_empty() {
        return Err(ManifestError::Empty);
    }
    Ok(())
}
