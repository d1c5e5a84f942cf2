//! Observed-state reader.
//!
//! Combines an inventory lookup with a datastore probe. The probe runs even
//! when the lookup misses, because an unregistered machine keeps its files.

use std::sync::Arc;

use tracing::debug;
use vmlife_model::{datastore_path, BackingFiles, FileClass, MachinePath, ObservedState, Registration};

use crate::hypervisor::{Hypervisor, HypervisorError};

/// Datastore folder holding a machine's files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLocation {
    pub datastore: String,
    pub folder: String,
}

/// Builds a fresh [`ObservedState`] for a machine path on every call.
#[derive(Clone)]
pub struct ObservedStateReader {
    hypervisor: Arc<dyn Hypervisor>,

    /// Datastore probed when the machine is not registered.
    default_datastore: String,
}

impl ObservedStateReader {
    pub fn new(hypervisor: Arc<dyn Hypervisor>, default_datastore: impl Into<String>) -> Self {
        Self {
            hypervisor,
            default_datastore: default_datastore.into(),
        }
    }

    /// Observe the machine at `path`.
    ///
    /// A machine that is neither registered nor backed by files is a valid
    /// result, not an error.
    pub async fn read(&self, path: &MachinePath) -> Result<ObservedState, HypervisorError> {
        self.read_from(path, None).await.map(|(observed, _)| observed)
    }

    /// Observe the machine at `path`, also returning where its files were
    /// probed.
    ///
    /// A registered machine is probed where the inventory says its files
    /// live. Otherwise `fallback` is probed, or the default datastore under a
    /// folder named after the machine. Passing the location of an earlier
    /// read in the same call keeps an unregistered machine's files in view.
    pub async fn read_from(
        &self,
        path: &MachinePath,
        fallback: Option<&FileLocation>,
    ) -> Result<(ObservedState, FileLocation), HypervisorError> {
        let name = path.name();
        let record = self.hypervisor.find_machine(path).await?;

        let location = match (&record, fallback) {
            (Some(record), _) => FileLocation {
                datastore: record.datastore.clone(),
                folder: record.folder.clone(),
            },
            (None, Some(fallback)) => fallback.clone(),
            (None, None) => FileLocation {
                datastore: self.default_datastore.clone(),
                folder: name.to_string(),
            },
        };
        let FileLocation { datastore, folder } = &location;

        let mut backing_files = BackingFiles::none(datastore.as_str());
        for class in FileClass::ALL {
            let found = self
                .hypervisor
                .search_datastore(datastore, folder, &class.search_pattern(name))
                .await?;

            let mut paths: Vec<String> = found
                .into_iter()
                .filter(|file| class.matches(name, file))
                .map(|file| datastore_path(datastore, &format!("{folder}/{file}")))
                .collect();
            paths.sort();

            match class {
                FileClass::Config => backing_files.config = paths,
                FileClass::Disk => backing_files.disks = paths,
            }
        }

        let observed = ObservedState {
            registration: record.map(|r| Registration {
                machine_id: r.machine_id,
                power_state: r.power_state,
            }),
            backing_files,
        };

        debug!(
            path = %path,
            state = %observed.machine_state(),
            power_state = %observed.power_state(),
            config_files = observed.backing_files.config.len(),
            disk_files = observed.backing_files.disks.len(),
            datastore = %datastore,
            "Observed machine"
        );

        Ok((observed, location))
    }
}
