//! domdec - distributed 3D domain decomposition for particle simulations.
//!
//! The engine assigns charge groups (small contiguous atom clusters) to the
//! ranks of a compute cluster, keeps the per-rank state consistent while
//! particles drift and the box deforms, and feeds measured load back into
//! the cell boundaries. Ranks meet only at explicit transport calls, so the
//! same code runs on an MPI cluster (`--features mpi`) and as N threads of
//! one process for tests and tooling.
//!
//! Every fatal condition surfaces as a [`DdError`]; there is no partial
//! recovery, the driver is expected to log the message and abort the run
//! with a non-zero exit code.

pub mod balance;
pub mod collect;
pub mod comm;
pub mod config;
pub mod dd;
pub mod dump;
pub mod error;
pub mod geometry;
pub mod grid;
pub mod halo;
pub mod partition;
pub mod state;

#[cfg(test)]
mod scenario_tests;

pub use balance::DdCycle;
pub use comm::local::{LocalCluster, LocalComm};
pub use comm::Communicator;
pub use config::{DdEnv, DdOptions, SimParams};
pub use dd::{DomDec, MASTER_RANK};
pub use error::{DdError, Result};
pub use grid::pme::{ClusterLayout, Duty};
pub use state::{CgBlock, State};

/// Initialize tracing for the library.
pub fn setup_logging(level: Option<String>) {
    let filter = level.unwrap_or_else(|| "info".to_string());
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
