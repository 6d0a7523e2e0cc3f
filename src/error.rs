//! Fatal error taxonomy.
//!
//! Every condition here aborts the whole run: the partitioning state of the
//! cluster is no longer consistent once one rank has failed, so there is no
//! partial recovery. The top-level driver logs the message and exits.

use thiserror::Error;

use crate::geometry::Rvec;

pub type Result<T> = std::result::Result<T, DdError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DdError {
    // Configuration
    #[error("domain decomposition has not been implemented for box vectors that have non-zero components in directions that do not use domain decomposition: ncells = {nc:?}, box vector[{vector}] = {component:?}")]
    BoxGeometry {
        nc: [usize; 3],
        vector: usize,
        component: Rvec,
    },

    #[error("the {dim}-size of the box ({box_len}) times the triclinic skew factor ({skew_fac}) is smaller than the number of decomposition cells ({nc}) times the cut-off distance ({cutoff})")]
    CellTooSmall {
        dim: char,
        box_len: f64,
        skew_fac: f64,
        nc: usize,
        cutoff: f64,
    },

    #[error("a system without periodic boundaries is not supported with domain decomposition")]
    UnsupportedPbc,

    #[error("simple neighbor searching is not supported with domain decomposition, use grid searching")]
    UnsupportedNsType,

    #[error("SHAKE is not supported with domain decomposition, use LINCS")]
    UnsupportedConstraintAlg,

    #[error("the size of the domain decomposition grid ({grid}) does not match the number of particle-particle ranks ({ranks})")]
    GridMismatch { grid: usize, ranks: usize },

    #[error("incorrect static load entries for the {dim} direction: {reason}")]
    StaticLoadParse { dim: char, reason: String },

    // Invariant violations
    #[error("step {step}: the charge group starting at atom {atom} moved more than the cut-off ({cutoff}) in direction {dim}: distance out of cell {distance}, old coords {old:?}, new coords {new:?}")]
    CgEscaped {
        step: i64,
        atom: usize,
        dim: char,
        cutoff: f64,
        distance: f64,
        old: Rvec,
        new: Rvec,
    },

    #[error("internal grid inconsistency: {0}")]
    GridInconsistency(String),

    // Runtime
    #[error("the dynamic load balancing could not balance dimension {dim}: box size {box_len}, triclinic skew factor {skew_fac}, #cells {nc}, cut-off {cutoff}")]
    LbInfeasible {
        dim: char,
        box_len: f64,
        skew_fac: f64,
        nc: usize,
        cutoff: f64,
    },

    #[error("transport failure: {0}")]
    Transport(String),

    #[error("i/o failure: {0}")]
    Io(String),
}

impl From<std::io::Error> for DdError {
    fn from(e: std::io::Error) -> Self {
        DdError::Io(e.to_string())
    }
}
