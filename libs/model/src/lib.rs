//! # vmlife-model
//!
//! Data model for machine lifecycle convergence.
//!
//! ## Design Principles
//!
//! - The machine path is the sole identity key; two records with the same
//!   path describe the same logical machine
//! - Desired state is authored externally and immutable for one convergence call
//! - Observed state is derived fresh on every call and never cached
//! - Registration and backing storage are observed separately, so a machine
//!   can be unregistered while its files remain on the datastore
//!
//! ## Path Format
//!
//! Machine paths are hierarchical inventory paths:
//!
//! - `/opdx1/vm/eng/CLOUD-0a1b2c3d4e5f6a7b`
//! - `/datacenter/vm/folder/name`
//!
//! The first segment is the datacenter, the last segment is the machine name.

mod error;
mod path;
mod state;

pub use error::ModelError;
pub use path::MachinePath;
pub use state::*;
