//! vmlife converger library
//!
//! Converges one machine at a time from its observed lifecycle state to the
//! desired one (`present`, `absent`, `unregistered`) using the minimal set of
//! hypervisor operations, then re-reads the machine to prove the result.
//!
//! ## Architecture
//!
//! ```text
//! DesiredState ──► Engine ──► ObservedStateReader ──► Hypervisor (lookup, datastore search)
//!                    │
//!                    ├──► vmlife_reconcile::plan  (pure decision)
//!                    ├──► Hypervisor (submit task, await completion) per step
//!                    └──► ObservedStateReader + vmlife_reconcile::verify
//! ```
//!
//! The engine holds no per-machine state between calls. Calls for distinct
//! paths may run concurrently; calls for the same path must be serialized by
//! the caller, which [`guard::ConvergeGuard`] does with one lock per path.
//!
//! ## Modules
//!
//! - `hypervisor`: client trait, HTTP adapter and in-memory mock
//! - `observe`: observed-state reader
//! - `engine`: plan execution and verification
//! - `guard`: per-path serialization and call timeouts

pub mod config;
pub mod engine;
pub mod error;
pub mod guard;
pub mod hypervisor;
pub mod observe;

pub use config::Config;
pub use engine::{ConvergenceResult, Engine};
pub use error::{ConvergeError, ErrorKind};
pub use guard::{ConvergeGuard, GuardError, PathLocks};
pub use hypervisor::{HttpHypervisor, Hypervisor, HypervisorError, MockHypervisor};
pub use observe::{FileLocation, ObservedStateReader};
