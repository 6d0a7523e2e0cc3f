//! Dynamic load balancing.
//!
//! Wall-clock cycles are tallied per phase between repartitionings. Along
//! each decomposition dimension the ranks of one cell row share a row
//! communicator; the row root reduces the measured loads and moves the cell
//! fractions against the imbalance, under-relaxed so the feedback loop stays
//! stable. Rows reduce hierarchically from the last dimension upward, so the
//! master ends up with the whole picture in `load[0]`.

use crate::comm::Communicator;
use crate::dd::DomDec;
use crate::error::{DdError, Result};
use crate::geometry::{
    check_box_size, dim_char, Matrix, CELL_MARGIN, DIM, PRES_SCALE_MARGIN,
};

/// Hard clamp on the per-step relative imbalance a cell may react to.
const IMBALANCE_MAX: f64 = 0.1;
/// Under-relaxation of the cell-size response.
const RELAX: f64 = 0.5;
/// Floats per row member in the load reduction.
const NLOAD_MAX: usize = 9;

/// Cycle-granularity timers are architecture dependent; without them the
/// dynamic balancer has nothing to feed on and is demoted to off.
pub fn have_cycle_counter() -> bool {
    cfg!(any(
        target_arch = "x86",
        target_arch = "x86_64",
        target_arch = "aarch64"
    ))
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DdCycle {
    /// Force computation.
    F = 0,
    /// Halo coordinate move.
    MoveX = 1,
    /// Halo force move.
    MoveF = 2,
    /// Long-range mesh part.
    Pme = 3,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CycleCounters {
    pub cycl: [f64; 4],
    pub n: [u32; 4],
}

impl CycleCounters {
    #[inline]
    pub fn add(&mut self, which: DdCycle, cycles: f64) {
        self.cycl[which as usize] += cycles;
        self.n[which as usize] += 1;
    }

    #[inline]
    pub fn get(&self, which: DdCycle) -> f64 {
        self.cycl[which as usize]
    }

    #[inline]
    pub fn count(&self, which: DdCycle) -> u32 {
        self.n[which as usize]
    }

    pub fn clear(&mut self) {
        *self = CycleCounters::default();
    }
}

/// Reduced load figures for one decomposition dimension. Only meaningful on
/// ranks that participate in that row's reduction; the full picture lives at
/// the master in dimension 0.
#[derive(Clone, Debug, Default)]
pub struct LoadRecord {
    pub nload: usize,
    /// Row-gathered raw records, `nc * nload` floats, root only.
    pub load: Vec<f64>,
    pub sum: f64,
    pub max: f64,
    /// Sum over cells, or the max scaled by the cell count when the row was
    /// limited by the minimum cell size.
    pub sum_m: f64,
    /// Smallest relative cell volume in the subtree.
    pub cvol_min: f64,
    pub mdf: f64,
    pub pme: f64,
    /// Bit per dimension that was limited by the minimum cell size.
    pub flags: i32,
}

/// Per-row-root state for the fraction update.
#[derive(Clone, Debug, Default)]
pub struct RowRoot {
    pub cell_size: Vec<f64>,
    pub at_min: Vec<bool>,
    pub cell_f_max0: Vec<f64>,
    pub cell_f_min1: Vec<f64>,
    pub bound_min: Vec<f64>,
    pub bound_max: Vec<f64>,
    pub limited: bool,
}

impl RowRoot {
    fn new(nc: usize) -> Self {
        RowRoot {
            cell_size: vec![1.0 / nc as f64; nc],
            at_min: vec![false; nc],
            cell_f_max0: vec![0.0; nc],
            cell_f_min1: vec![0.0; nc],
            bound_min: vec![0.0; nc],
            bound_max: vec![0.0; nc],
            limited: false,
        }
    }
}

/// One rank's membership in a load-balancing row.
pub struct RowComm<C: Communicator> {
    pub comm: C,
    /// Row fractions, `nc + 1` cuts plus the lower-dimension pairs at the
    /// tail; written by the root, broadcast to every member.
    pub cell_f: Vec<f64>,
    pub root: Option<RowRoot>,
}

impl<C: Communicator> DomDec<C> {
    /// Build the row communicators. Collective over the decomposition.
    ///
    /// Dimension 0 has a single row through the origin; each later
    /// dimension has one row per combination of earlier-dimension
    /// coordinates, with the remaining coordinates pinned at zero. A rank
    /// joins at most one row per dimension; roots sit at coordinate 0.
    pub(crate) fn make_load_communicators(&mut self) -> Result<()> {
        tracing::debug!("making load communicators");
        let ndim = self.grid.ndim;
        let mut rows: Vec<Option<RowComm<C>>> = (0..ndim).map(|_| None).collect();

        let mut loc = [0usize; DIM];
        self.try_join_row(&mut rows, 0, &loc)?;
        if ndim > 1 {
            let dim0 = self.grid.dims[0];
            for i in 0..self.grid.nc[dim0] {
                loc[dim0] = i;
                self.try_join_row(&mut rows, 1, &loc)?;
            }
        }
        if ndim > 2 {
            let dim0 = self.grid.dims[0];
            let dim1 = self.grid.dims[1];
            for i in 0..self.grid.nc[dim0] {
                loc[dim0] = i;
                for j in 0..self.grid.nc[dim1] {
                    loc[dim1] = j;
                    self.try_join_row(&mut rows, 2, &loc)?;
                }
            }
        }

        self.rows = rows;
        tracing::debug!("finished making load communicators");
        Ok(())
    }

    fn try_join_row(
        &mut self,
        rows: &mut [Option<RowComm<C>>],
        dim_ind: usize,
        loc: &[usize; DIM],
    ) -> Result<()> {
        let ranks = self.grid.row_ranks(dim_ind, loc);
        if let Some(sub) = self.comm.subset(&ranks)? {
            if rows[dim_ind].is_some() {
                return Err(DdError::GridInconsistency(format!(
                    "rank {} joined two rows in dimension index {}",
                    self.grid.rank, dim_ind
                )));
            }
            let dim = self.grid.dims[dim_ind];
            let nc = self.grid.nc[dim];
            let root = (sub.rank() == 0).then(|| RowRoot::new(nc));
            rows[dim_ind] = Some(RowComm {
                comm: sub,
                cell_f: vec![0.0; nc + 1 + dim_ind * 2],
                root,
            });
        }
        Ok(())
    }

    /// Reduce the cycle counts along the rows, last dimension first, so
    /// every row root knows its members' loads and the master the totals.
    pub fn get_load_distribution(&mut self) -> Result<()> {
        let ndim = self.grid.ndim;
        let sep_pme = self.cycl.count(DdCycle::Pme) > 0;

        for d in (0..ndim).rev() {
            let dim = self.grid.dims[d];
            // Only the roots of the higher-dimension rows carry their
            // subtree's figures into this dimension.
            let participates = d == ndim - 1
                || (self.grid.ci[self.grid.dims[d + 1]] == 0
                    && self.grid.ci[self.grid.dims[ndim - 1]] == 0);
            if !participates {
                continue;
            }

            let cell_frac = if self.grid_jump {
                let row = self.row(d)?;
                let ci = self.grid.ci[dim];
                row.cell_f[ci + 1] - row.cell_f[ci]
            } else {
                0.0
            };

            let mut sbuf: Vec<f64> = Vec::with_capacity(NLOAD_MAX);
            if d == ndim - 1 {
                let force = self.cycl.get(DdCycle::F);
                sbuf.push(force);
                sbuf.push(force);
                if self.grid_jump {
                    sbuf.push(force);
                    sbuf.push(cell_frac);
                    if d > 0 {
                        sbuf.push(self.cell_f_max0[d]);
                        sbuf.push(self.cell_f_min1[d]);
                    }
                }
                if sep_pme {
                    sbuf.push(
                        self.cycl.get(DdCycle::MoveX)
                            + force
                            + self.cycl.get(DdCycle::MoveF),
                    );
                    sbuf.push(self.cycl.get(DdCycle::Pme));
                }
            } else {
                let child = &self.load[d + 1];
                sbuf.push(child.sum);
                sbuf.push(child.max);
                if self.grid_jump {
                    sbuf.push(child.sum_m);
                    sbuf.push(child.cvol_min * cell_frac);
                    sbuf.push(child.flags as f64);
                    if d > 0 {
                        sbuf.push(self.cell_f_max0[d]);
                        sbuf.push(self.cell_f_min1[d]);
                    }
                }
                if sep_pme {
                    sbuf.push(child.mdf);
                    sbuf.push(child.pme);
                }
            }
            let nload = sbuf.len();

            let gathered = self.row(d)?.comm.gather_reals(0, &sbuf)?;

            let nc = self.grid.nc[dim];
            let grid_jump = self.grid_jump;
            let dyn_load_bal = self.dyn_load_bal;
            if let Some(all) = gathered {
                // We are the row root; fold the members' figures.
                let limited = self
                    .rows[d]
                    .as_ref()
                    .and_then(|r| r.root.as_ref())
                    .map(|r| r.limited)
                    .unwrap_or(false);
                let load = &mut self.load[d];
                load.nload = nload;
                load.load = all;
                load.sum = 0.0;
                load.max = 0.0;
                load.sum_m = 0.0;
                load.cvol_min = 1.0;
                load.flags = 0;
                load.mdf = 0.0;
                load.pme = 0.0;
                let mut max0 = Vec::new();
                let mut min1 = Vec::new();
                let mut pos = 0;
                for _ in 0..nc {
                    load.sum += load.load[pos];
                    pos += 1;
                    load.max = load.max.max(load.load[pos]);
                    pos += 1;
                    if grid_jump {
                        if limited {
                            // The row could not be balanced properly, so
                            // the maximum stands in for the average.
                            load.sum_m = load.sum_m.max(load.load[pos]);
                        } else {
                            load.sum_m += load.load[pos];
                        }
                        pos += 1;
                        load.cvol_min = load.cvol_min.min(load.load[pos]);
                        pos += 1;
                        if d < ndim - 1 {
                            load.flags = (load.load[pos] + 0.5) as i32;
                            pos += 1;
                        }
                        if d > 0 {
                            max0.push(load.load[pos]);
                            pos += 1;
                            min1.push(load.load[pos]);
                            pos += 1;
                        }
                    }
                    if sep_pme {
                        load.mdf = load.mdf.max(load.load[pos]);
                        pos += 1;
                        load.pme = load.pme.max(load.load[pos]);
                        pos += 1;
                    }
                }
                if dyn_load_bal && limited {
                    load.sum_m *= nc as f64;
                    load.flags |= 1 << d;
                }
                if !max0.is_empty() {
                    let root = self.row_root_mut(d)?;
                    root.cell_f_max0.copy_from_slice(&max0);
                    root.cell_f_min1.copy_from_slice(&min1);
                }
            } else {
                self.load[d].nload = nload;
            }
        }
        Ok(())
    }

    fn row(&self, d: usize) -> Result<&RowComm<C>> {
        self.rows.get(d).and_then(|r| r.as_ref()).ok_or_else(|| {
            DdError::GridInconsistency(format!(
                "rank {} has no row communicator for dimension index {}",
                self.grid.rank, d
            ))
        })
    }

    fn row_root_mut(&mut self, d: usize) -> Result<&mut RowRoot> {
        self.rows
            .get_mut(d)
            .and_then(|r| r.as_mut())
            .and_then(|r| r.root.as_mut())
            .ok_or_else(|| {
                DdError::GridInconsistency(format!(
                    "rank is not the root of the dimension-index-{} row",
                    d
                ))
            })
    }

    /// Rebuild the cell boundaries for the current box.
    ///
    /// `uniform` resets a balanced grid to equal fractions (used right
    /// after a master redistribution); `master_mode` fills the master's
    /// whole-grid boundary table instead of the local cell bounds.
    pub fn set_cell_sizes(
        &mut self,
        box_: &Matrix,
        dynamic_box: bool,
        uniform: bool,
        master_mode: bool,
    ) -> Result<()> {
        self.tric.set(box_, &self.grid.nc)?;

        if self.is_master() {
            check_box_size(box_, &self.tric, self.grid.dd_dims(), &self.grid.nc, self.cutoff)?;
        }

        if self.dyn_load_bal && !master_mode {
            self.set_cell_sizes_dlb(box_, dynamic_box, uniform)?;
        } else {
            self.set_cell_sizes_slb(box_, master_mode)?;
        }

        tracing::debug!(
            cell_x0 = ?self.cell_x0,
            cell_x1 = ?self.cell_x1,
            skew_fac = ?self.tric.skew_fac,
            "cell sizes set"
        );
        Ok(())
    }

    /// Static sizes: uniform, or proportional to the per-cell load weights.
    fn set_cell_sizes_slb(&mut self, box_: &Matrix, master_mode: bool) -> Result<()> {
        for d in 0..DIM {
            let n = self.grid.nc[d];
            let widths: Vec<f64> = match &self.static_load[d] {
                Some(w) if n > 1 => {
                    let total: f64 = w.iter().sum();
                    w.iter().map(|wi| box_[d][d] * wi / total).collect()
                }
                _ => vec![box_[d][d] / n as f64; n],
            };
            if master_mode {
                let ma = self.master.as_mut().ok_or_else(|| {
                    DdError::GridInconsistency(
                        "master cell table requested away from the master rank".into(),
                    )
                })?;
                ma.cell_x[d].clear();
                ma.cell_x[d].push(0.0);
                let mut at = 0.0;
                for w in &widths {
                    at += w;
                    ma.cell_x[d].push(at);
                }
            } else {
                let ci = self.grid.ci[d];
                self.cell_x0[d] = widths[..ci].iter().sum();
                self.cell_x1[d] = self.cell_x0[d] + widths[ci];
            }
        }
        Ok(())
    }

    /// Balanced sizes: each row root relaxes its fractions against the
    /// measured loads and broadcasts them over the row.
    fn set_cell_sizes_dlb(&mut self, box_: &Matrix, dynamic_box: bool, uniform: bool) -> Result<()> {
        let ndim = self.grid.ndim;
        for d in 0..ndim {
            let dim = self.grid.dims[d];

            let mut row_member = true;
            let mut row_root = true;
            for d1 in d..ndim {
                if self.grid.ci[self.grid.dims[d1]] > 0 {
                    if d1 > d {
                        row_member = false;
                    }
                    row_root = false;
                }
            }

            if row_root {
                self.balance_row(d, box_, dynamic_box, uniform)?;
            }

            if row_member {
                let nc = self.grid.nc[dim];
                let nbcast = nc + 1 + d * 2;
                // Every member only needs its own pair, but one broadcast
                // of the whole row is cheaper than a tailored scatter.
                {
                    let row = self.rows[d].as_mut().ok_or_else(|| {
                        DdError::GridInconsistency(format!(
                            "row member without a row communicator in dimension index {}",
                            d
                        ))
                    })?;
                    let (comm, cell_f) = (&row.comm, &mut row.cell_f);
                    comm.bcast_reals(0, &mut cell_f[..nbcast])?;
                }

                let cell_f: Vec<f64> = self.row(d)?.cell_f.clone();
                let ci = self.grid.ci[dim];
                self.cell_f0[d] = cell_f[ci];
                self.cell_f1[d] = cell_f[ci + 1];
                let mut pos = nc + 1;
                for d1 in 0..=d {
                    if d1 < d {
                        // Lower-dimension fractions ride at the tail
                        self.cell_f0[d1] = cell_f[pos];
                        pos += 1;
                        self.cell_f1[d1] = cell_f[pos];
                        pos += 1;
                    }
                    let dim1 = self.grid.dims[d1];
                    self.cell_x0[dim1] = self.cell_f0[d1] * box_[dim1][dim1];
                    self.cell_x1[dim1] = self.cell_f1[d1] * box_[dim1][dim1];
                }
            }
        }

        for dim in 0..DIM {
            if self.grid.nc[dim] == 1 {
                self.cell_x0[dim] = 0.0;
                self.cell_x1[dim] = box_[dim][dim];
            }
        }
        Ok(())
    }

    /// The row root's fraction update.
    fn balance_row(&mut self, d: usize, box_: &Matrix, dynamic_box: bool, uniform: bool) -> Result<()> {
        let dim = self.grid.dims[d];
        let nc = self.grid.nc[dim];
        let have_cycles = self.cycl.count(DdCycle::F) > 0;
        let load_aver = self.load[d].sum_m / nc as f64;
        let loads: Vec<f64> = if !uniform && have_cycles {
            let rec = &self.load[d];
            (0..nc).map(|i| rec.load[i * rec.nload + 2]).collect()
        } else {
            Vec::new()
        };
        let cell_f0: Vec<f64> = self.cell_f0[..d].to_vec();
        let cell_f1: Vec<f64> = self.cell_f1[..d].to_vec();

        let cutoff_f = self.cutoff / box_[dim][dim];
        let mut cell_min = CELL_MARGIN * cutoff_f;
        if self.tric.tric_dir[dim] {
            cell_min /= self.tric.skew_fac[dim];
        }
        if dynamic_box && d > 0 {
            cell_min *= PRES_SCALE_MARGIN;
        }
        let err = DdError::LbInfeasible {
            dim: dim_char(dim),
            box_len: box_[dim][dim],
            skew_fac: self.tric.skew_fac[dim],
            nc,
            cutoff: self.cutoff,
        };

        let row = self.rows[d].as_mut().ok_or_else(|| {
            DdError::GridInconsistency(format!(
                "row root without a row communicator in dimension index {}",
                d
            ))
        })?;
        let cell_f = &mut row.cell_f;
        let root = row.root.as_mut().ok_or_else(|| {
            DdError::GridInconsistency(format!("row root state missing in dimension index {}", d))
        })?;

        if uniform {
            for size in root.cell_size.iter_mut() {
                *size = 1.0 / nc as f64;
            }
        } else if have_cycles {
            for i in 0..nc {
                let imbalance =
                    ((loads[i] - load_aver) / load_aver).clamp(-IMBALANCE_MAX, IMBALANCE_MAX);
                root.cell_size[i] *= 1.0 - RELAX * imbalance;
            }
        }

        if d > 0 && !uniform {
            // Keep the cuts clear of the neighbor rows' extremes, giving
            // back half of the available slack.
            for i in 1..nc {
                root.bound_min[i] = root.cell_f_max0[i - 1] + cell_min;
                let space = cell_f[i] - root.bound_min[i];
                if space > 0.0 {
                    root.bound_min[i] += 0.5 * space;
                }
                root.bound_max[i] = root.cell_f_min1[i] - cell_min;
                let space = cell_f[i] - (root.cell_f_min1[i] - cell_min);
                if space < 0.0 {
                    root.bound_max[i] += 0.5 * space;
                }
            }
        }

        // Normalize, pinning cells that fell below the minimum and
        // spreading the remainder over the rest until nothing new pins.
        for m in root.at_min.iter_mut() {
            *m = false;
        }
        let mut nmin = 0;
        loop {
            let nmin_old = nmin;
            let mut fac = 0.0;
            for i in 0..nc {
                if !root.at_min[i] {
                    fac += root.cell_size[i];
                }
            }
            fac = (1.0 - nmin as f64 * cell_min) / fac;
            cell_f[0] = 0.0;
            for i in 0..nc {
                if !root.at_min[i] {
                    root.cell_size[i] *= fac;
                    if root.cell_size[i] < cell_min {
                        root.at_min[i] = true;
                        root.cell_size[i] = cell_min;
                        nmin += 1;
                    }
                }
                cell_f[i + 1] = cell_f[i] + root.cell_size[i];
            }
            if nmin == nmin_old {
                break;
            }
        }

        let last = nc - 1;
        cell_f[last + 1] = 1.0;
        root.cell_size[last] = cell_f[last + 1] - cell_f[last];
        if root.cell_size[last] < cutoff_f {
            return Err(err);
        }
        root.limited = nmin > 0;

        if d > 0 {
            if uniform {
                for i in 0..nc {
                    root.cell_f_max0[i] = cell_f[i];
                    root.cell_f_min1[i] = cell_f[i + 1];
                }
            } else {
                for i in 1..nc {
                    let lim_lo = cell_f[i] < root.bound_min[i];
                    let lim_hi = cell_f[i] > root.bound_max[i];
                    if lim_lo && lim_hi {
                        // Both limits violated, try the best we can
                        cell_f[i] = 0.5 * (root.bound_min[i] + root.bound_max[i]);
                    } else if lim_lo {
                        cell_f[i] = root.bound_min[i];
                    } else if lim_hi {
                        cell_f[i] = root.bound_max[i];
                    }
                    if lim_lo || lim_hi {
                        root.limited = true;
                    }
                }
            }
        }

        // Lower-dimension fractions piggy-back at the tail of the buffer
        let mut pos = nc + 1;
        for d1 in 0..d {
            cell_f[pos] = cell_f0[d1];
            pos += 1;
            cell_f[pos] = cell_f1[d1];
            pos += 1;
        }
        Ok(())
    }

    /// Smallest cell volume relative to a uniform grid; master only.
    pub fn vol_min(&self) -> f64 {
        self.load[0].cvol_min * self.grid.nnodes as f64
    }

    /// Relative force-load imbalance over all cells; master only.
    pub fn f_imbalance(&self) -> f64 {
        self.load[0].max * self.grid.nnodes as f64 / self.load[0].sum - 1.0
    }

    /// Mesh vs particle-force load ratio; master only.
    pub fn pme_f_imbalance(&self) -> f64 {
        self.load[0].pme / self.load[0].mdf - 1.0
    }

    pub(crate) fn print_load(&self) {
        let flags = self.load[0].flags;
        if flags != 0 {
            let dims: String = (0..self.grid.ndim)
                .filter(|d| flags & (1 << d) != 0)
                .map(|d| dim_char(self.grid.dims[d]))
                .collect();
            tracing::info!(
                "load balancing is limited by the minimum cell size in dimension(s) {}",
                dims
            );
        }
        if self.dyn_load_bal {
            tracing::info!(
                "DD vol min/aver {:5.3}{} load imbalance: force {:4.1} %",
                self.vol_min(),
                if flags != 0 { '!' } else { ' ' },
                self.f_imbalance() * 100.0
            );
        } else {
            tracing::info!("DD load imbalance: force {:4.1} %", self.f_imbalance() * 100.0);
        }
        if self.cycl.count(DdCycle::Pme) > 0 {
            tracing::info!("DD pme mesh/force {:4.1} %", self.pme_f_imbalance() * 100.0);
        }
    }
}
