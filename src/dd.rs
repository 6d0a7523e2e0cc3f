//! The per-rank decomposition state.
//!
//! One `DomDec` lives on every particle rank and carries everything the
//! repartitioning cycle touches: the grid view, the cell geometry, the local
//! index tables and the communication scratch buffers. The component
//! operations are implemented next to their subject (`partition`, `halo`,
//! `balance`, `collect`, `dump`) as further `impl` blocks on this type.

use crate::balance::{have_cycle_counter, CycleCounters, LoadRecord, RowComm};
use crate::comm::{Communicator, Dir};
use crate::config::{parse_cell_load, DdEnv, DdOptions, SimParams};
use crate::error::{DdError, Result};
use crate::geometry::{Rvec, TricDirs, DIM};
use crate::grid::DdGrid;
use crate::halo::HaloInd;
use crate::state::{over_alloc, Ga2La};

/// Rank that holds the whole-system view during gathers and scatters.
pub const MASTER_RANK: usize = 0;

/// Whole-system bookkeeping, allocated on the master rank only.
#[derive(Clone, Debug, Default)]
pub struct MasterState {
    /// Cell boundaries per dimension, `nc[d] + 1` entries.
    pub cell_x: [Vec<f64>; DIM],
    /// Home charge-group count per rank.
    pub ncg: Vec<usize>,
    /// Prefix of `ncg` into `cg`.
    pub index: Vec<usize>,
    /// Global charge-group ids grouped by owning rank.
    pub cg: Vec<usize>,
    /// Home atom count per rank.
    pub nat: Vec<usize>,
}

pub struct DomDec<C: Communicator> {
    pub comm: C,
    pub grid: DdGrid,
    pub env: DdEnv,
    pub params: SimParams,
    pub tric: TricDirs,

    /// Communicated distance: cut-off, floored by the bonded minimum.
    pub cutoff: f64,
    pub dyn_load_bal: bool,
    /// Cell rows may have unequal boundaries in higher dimensions.
    pub grid_jump: bool,
    pub record_load: bool,
    pub static_load: [Option<Vec<f64>>; DIM],

    // Cell geometry, real space.
    pub cell_x0: Rvec,
    pub cell_x1: Rvec,
    /// Neighbor-search extent, widened under grid jump.
    pub cell_ns_x0: Rvec,
    pub cell_ns_x1: Rvec,
    // Cell fractions, indexed by decomposition dimension index.
    pub cell_f0: [f64; DIM],
    pub cell_f1: [f64; DIM],
    pub cell_f_max0: [f64; DIM],
    pub cell_f_min1: [f64; DIM],
    /// First-neighbor row boundaries for the second decomposition dimension.
    pub cell_d1: [[f64; 2]; 2],
    /// Same for the third dimension, per (dim0 shift, dim1 shift).
    pub cell_d2: [[[f64; 2]; 2]; 2],

    // Local charge groups and atoms.
    pub ncg_home: usize,
    pub nat_home: usize,
    pub ncg_tot: usize,
    pub nat_tot: usize,
    pub nat_tot_vsite: usize,
    pub nat_tot_con: usize,
    /// Global charge-group id per local charge group.
    pub index_gl: Vec<usize>,
    /// Prefix sum of local charge-group sizes, `ncg_tot + 1` entries.
    pub cgindex: Vec<usize>,
    /// Global atom id per local atom.
    pub gatindex: Vec<usize>,
    /// Dense reverse map over global atoms.
    pub ga2la: Vec<Ga2La>,
    /// Charge-group boundaries per zone, `ncell + 1` entries.
    pub ncg_cell: Vec<usize>,
    /// Center of geometry per local charge group.
    pub cg_cm: Vec<Rvec>,

    /// Halo send/receive tables, one per decomposition dimension.
    pub ind: Vec<HaloInd>,

    pub master: Option<MasterState>,
    pub master_has_all_cg: bool,

    // Load balancing.
    pub cycl: CycleCounters,
    pub rows: Vec<Option<RowComm<C>>>,
    pub load: Vec<LoadRecord>,
    pub first_load_printed: bool,

    // Scratch, grown on demand.
    pub(crate) buf_int: Vec<i32>,
    pub(crate) buf_vr: Vec<Rvec>,
}

impl<C: Communicator> DomDec<C> {
    /// Set up the decomposition on this rank. Collective: every particle
    /// rank must call this with the same options.
    pub fn new(opts: &DdOptions, env: DdEnv, params: SimParams, comm: C) -> Result<Self> {
        params.validate()?;

        let nnodes = opts.nc[0] * opts.nc[1] * opts.nc[2];
        if nnodes != comm.size() {
            return Err(DdError::GridMismatch {
                grid: nnodes,
                ranks: comm.size(),
            });
        }

        tracing::info!(
            "domain decomposition grid {} x {} x {}, separate mesh ranks {}",
            opts.nc[0],
            opts.nc[1],
            opts.nc[2],
            opts.npmenodes
        );

        let grid = DdGrid::new(opts.nc, comm.rank(), &env)?;
        tracing::info!(
            "making {}D domain decomposition, home cell index {} {} {}",
            grid.ndim,
            grid.ci[0],
            grid.ci[1],
            grid.ci[2]
        );

        let record_load = have_cycle_counter();
        let dyn_load_bal = if opts.dyn_load_bal && !record_load {
            tracing::warn!(
                "cycle counting is not supported on this architecture, \
                 will not use dynamic load balancing"
            );
            false
        } else {
            opts.dyn_load_bal
        };

        let mut static_load: [Option<Vec<f64>>; DIM] = [None, None, None];
        if !dyn_load_bal {
            static_load[0] = parse_cell_load(0, opts.nc[0], opts.load_x.as_deref())?;
            static_load[1] = parse_cell_load(1, opts.nc[1], opts.load_y.as_deref())?;
            static_load[2] = parse_cell_load(2, opts.nc[2], opts.load_z.as_deref())?;
        }

        let mut cutoff = params.cutoff;
        if params.inter_cg_bondeds {
            cutoff = cutoff.max(opts.comm_distance_min);
            if comm.rank() == MASTER_RANK {
                tracing::info!(
                    "atoms involved in bonded interactions should be within {} nm",
                    cutoff
                );
            }
        }

        let master = (comm.rank() == MASTER_RANK).then(MasterState::default);
        let ndim = grid.ndim;

        let mut dd = DomDec {
            comm,
            grid,
            env,
            params,
            tric: TricDirs::default(),
            cutoff,
            dyn_load_bal,
            grid_jump: dyn_load_bal,
            record_load,
            static_load,
            cell_x0: [0.0; DIM],
            cell_x1: [0.0; DIM],
            cell_ns_x0: [0.0; DIM],
            cell_ns_x1: [0.0; DIM],
            cell_f0: [0.0; DIM],
            cell_f1: [0.0; DIM],
            cell_f_max0: [0.0; DIM],
            cell_f_min1: [0.0; DIM],
            cell_d1: [[0.0; 2]; 2],
            cell_d2: [[[0.0; 2]; 2]; 2],
            ncg_home: 0,
            nat_home: 0,
            ncg_tot: 0,
            nat_tot: 0,
            nat_tot_vsite: 0,
            nat_tot_con: 0,
            index_gl: Vec::new(),
            cgindex: vec![0],
            gatindex: Vec::new(),
            ga2la: Vec::new(),
            ncg_cell: vec![0; 9],
            cg_cm: Vec::new(),
            ind: (0..ndim).map(|_| HaloInd::default()).collect(),
            master,
            master_has_all_cg: false,
            cycl: CycleCounters::default(),
            rows: Vec::new(),
            load: (0..ndim).map(|_| LoadRecord::default()).collect(),
            first_load_printed: false,
            buf_int: Vec::new(),
            buf_vr: Vec::new(),
        };

        if dd.record_load {
            dd.make_load_communicators()?;
        }

        Ok(dd)
    }

    #[inline]
    pub fn is_master(&self) -> bool {
        self.comm.rank() == MASTER_RANK
    }

    /// Paired neighbor exchange along decomposition dimension `dim_ind`:
    /// forward sends to the +1 neighbor and receives from the -1 neighbor.
    pub(crate) fn neighbor_pair(&self, dim_ind: usize, dir: Dir) -> (usize, usize) {
        match dir {
            Dir::Forward => (
                self.grid.neighbor[dim_ind][0],
                self.grid.neighbor[dim_ind][1],
            ),
            Dir::Backward => (
                self.grid.neighbor[dim_ind][1],
                self.grid.neighbor[dim_ind][0],
            ),
        }
    }

    pub(crate) fn sendrecv_ints(
        &self,
        dim_ind: usize,
        dir: Dir,
        send: &[i32],
        nrecv: usize,
    ) -> Result<Vec<i32>> {
        let (to, from) = self.neighbor_pair(dim_ind, dir);
        self.comm.sendrecv_ints(to, send, from, nrecv)
    }

    pub(crate) fn sendrecv_rvecs(
        &self,
        dim_ind: usize,
        dir: Dir,
        send: &[Rvec],
        nrecv: usize,
    ) -> Result<Vec<Rvec>> {
        let (to, from) = self.neighbor_pair(dim_ind, dir);
        self.comm.sendrecv_rvecs(to, send, from, nrecv)
    }

    pub(crate) fn sendrecv_reals(
        &self,
        dim_ind: usize,
        dir: Dir,
        send: &[f64],
        nrecv: usize,
    ) -> Result<Vec<f64>> {
        let (to, from) = self.neighbor_pair(dim_ind, dir);
        self.comm.sendrecv_reals(to, send, from, nrecv)
    }

    /// Global atom id of local atom `i`, as a 1-based serial for reports.
    pub fn glatnr(&self, i: usize) -> Result<usize> {
        if i >= self.nat_tot_con || i >= self.gatindex.len() {
            return Err(DdError::GridInconsistency(format!(
                "local atom {} is beyond the local atom count {}",
                i, self.nat_tot_con
            )));
        }
        Ok(self.gatindex[i] + 1)
    }

    pub(crate) fn ensure_ga2la(&mut self, natoms: usize) {
        if self.ga2la.len() < natoms {
            self.ga2la.resize(natoms, Ga2La::default());
        }
    }
}

/// Grow a vector to hold `n` elements, over-allocating the capacity so the
/// next few growths are free.
pub(crate) fn ensure_len<T: Clone + Default>(v: &mut Vec<T>, n: usize) {
    if v.len() < n {
        let target = over_alloc(n);
        v.reserve(target - v.len());
        v.resize(n, T::default());
    }
}
