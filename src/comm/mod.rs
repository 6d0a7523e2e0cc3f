//! Message transport between decomposition ranks.
//!
//! The engine is SPMD: every rank runs the same program and only meets the
//! others at the calls below. The core never talks to a transport directly;
//! it goes through [`Communicator`], which has two implementations: an
//! in-process cluster that runs N ranks as threads of one process
//! ([`local::LocalCluster`]), and an MPI-backed cluster transport behind the
//! `mpi` cargo feature.
//!
//! Receive sizes are always known to the caller (counts are exchanged before
//! payloads everywhere in the engine), so every receive takes the expected
//! element count and a mismatch is a fatal transport error.

pub mod local;

#[cfg(feature = "mpi")]
pub mod cluster;

use crate::error::Result;
use crate::geometry::Rvec;

/// Pairwise exchange direction along one decomposition dimension.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dir {
    Forward,
    Backward,
}

pub trait Communicator: Sized {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;

    // Point-to-point, used by the master gather/scatter paths.
    fn send_rvecs(&self, to: usize, buf: &[Rvec]) -> Result<()>;
    fn recv_rvecs(&self, from: usize, n: usize) -> Result<Vec<Rvec>>;

    // Paired exchange: send to one neighbor while receiving from the other.
    fn sendrecv_ints(&self, to: usize, send: &[i32], from: usize, nrecv: usize)
        -> Result<Vec<i32>>;
    fn sendrecv_reals(&self, to: usize, send: &[f64], from: usize, nrecv: usize)
        -> Result<Vec<f64>>;
    fn sendrecv_rvecs(
        &self,
        to: usize,
        send: &[Rvec],
        from: usize,
        nrecv: usize,
    ) -> Result<Vec<Rvec>>;

    // Collectives over the whole communicator.
    fn bcast_ints(&self, root: usize, buf: &mut [i32]) -> Result<()>;
    fn bcast_reals(&self, root: usize, buf: &mut [f64]) -> Result<()>;
    fn bcast_rvecs(&self, root: usize, buf: &mut [Rvec]) -> Result<()>;

    /// Equal-count gather; the root gets the concatenation in rank order.
    fn gather_ints(&self, root: usize, send: &[i32]) -> Result<Option<Vec<i32>>>;
    fn gather_reals(&self, root: usize, send: &[f64]) -> Result<Option<Vec<f64>>>;
    fn gather_rvecs(&self, root: usize, send: &[Rvec]) -> Result<Option<Vec<Rvec>>>;

    /// Variable-count gather, one buffer per rank.
    fn gatherv_ints(&self, root: usize, send: &[i32]) -> Result<Option<Vec<Vec<i32>>>>;

    /// Equal-count scatter; `send` is the rank-ordered concatenation on the
    /// root and ignored elsewhere.
    fn scatter_ints(&self, root: usize, send: Option<&[i32]>, count: usize) -> Result<Vec<i32>>;

    /// Variable-count scatter, one buffer per rank on the root.
    fn scatterv_ints(&self, root: usize, send: Option<&[Vec<i32>]>) -> Result<Vec<i32>>;

    /// Collective: carve out a sub-communicator over `ranks` (parent rank
    /// ids, becoming ranks 0..len in list order). Members get `Some`,
    /// non-members `None`. Every rank of the parent must call this.
    fn subset(&self, ranks: &[usize]) -> Result<Option<Self>>;
}
