//! Partitioning: who owns which charge groups.
//!
//! Two entry paths exist. The master-state path distributes the whole
//! system from the master rank (initial distribution, or after an external
//! reset of the global state). The incremental path moves only the charge
//! groups that drifted across a cell boundary since the last step; it lives
//! in [`redistribute`](self::redistribute).

mod redistribute;

use rayon::prelude::*;

use crate::comm::Communicator;
use crate::dd::{ensure_len, DomDec, MASTER_RANK};
use crate::error::{DdError, Result};
use crate::geometry::{rvec_dec, rvec_inc, DIM};
use crate::grid::rank_of;
use crate::state::{center_of_geometry, CgBlock, State};

impl<C: Communicator> DomDec<C> {
    /// Repartition the system for the current coordinates.
    ///
    /// Phases run in a fixed order on every rank: load accounting,
    /// redistribution (or master distribution), cell sizing, halo setup,
    /// index rebuild. `state_global` is only read and written on the master
    /// rank.
    pub fn partition_system(
        &mut self,
        step: i64,
        master_state: bool,
        gcgs: &CgBlock,
        mut state_global: Option<&mut State>,
        state_local: &mut State,
        verbose: bool,
    ) -> Result<()> {
        if self.record_load && self.cycl.count(crate::balance::DdCycle::F) > 0 {
            let log_load = !self.first_load_printed;
            if self.dyn_load_bal || log_load || verbose {
                self.get_load_distribution()?;
                if self.is_master() && (log_load || verbose) {
                    self.print_load();
                }
                self.first_load_printed = true;
            }
        }

        let mut cg0 = 0;
        if master_state {
            self.get_cg_distribution(gcgs, state_global.as_deref_mut())?;
            self.distribute_state(gcgs, state_global.as_deref(), state_local)?;
            self.calc_cgcm(state_local);
        }

        let box_ = state_local.box_;
        self.set_cell_sizes(&box_, self.params.dynamic_box, master_state, false)?;

        if self.env.nst_dump_grid > 0 && step % self.env.nst_dump_grid == 0 {
            self.write_grid_dump("dd_grid", step, &state_local.box_)?;
        }

        if !master_state {
            cg0 = self.redistribute_cg(step, gcgs, state_local)?;
        }

        self.setup_communication(step, gcgs, &box_)?;

        self.make_dd_indices(gcgs, cg0);
        self.set_cg_boundaries();

        // Virtual-site and constraint construction would extend these
        // ranges; without them the halo is the end of the local atoms.
        state_local.ensure_capacity(self.nat_tot_con);

        self.cycl.clear();

        if self.env.nst_dump > 0 && step % self.env.nst_dump == 0 {
            self.move_x(&box_, &mut state_local.x)?;
            self.write_atom_dump("dd_dump", step, "dump", &state_local.x, &box_)?;
        }

        Ok(())
    }

    /// Master-state distribution: the master bins every charge group into a
    /// cell and scatters the per-rank charge-group lists.
    fn get_cg_distribution(
        &mut self,
        gcgs: &CgBlock,
        state_global: Option<&mut State>,
    ) -> Result<()> {
        self.clear_dd_indices(0);

        let nnodes = self.grid.nnodes;
        let counts: Option<Vec<i32>> = if self.is_master() {
            let state = state_global.ok_or_else(|| {
                DdError::GridInconsistency("master has no global state to distribute".into())
            })?;
            self.distribute_cg(gcgs, state)?;
            let ma = self.master.as_ref().ok_or_else(|| {
                DdError::GridInconsistency("master bookkeeping missing on the master rank".into())
            })?;
            let mut buf = Vec::with_capacity(2 * nnodes);
            for i in 0..nnodes {
                buf.push(ma.ncg[i] as i32);
                buf.push(ma.nat[i] as i32);
            }
            Some(buf)
        } else {
            None
        };

        let buf2 = self
            .comm
            .scatter_ints(MASTER_RANK, counts.as_deref(), 2)?;
        self.ncg_home = buf2[0] as usize;
        self.nat_home = buf2[1] as usize;

        let payload: Option<Vec<Vec<i32>>> = self.master.as_ref().map(|ma| {
            (0..nnodes)
                .map(|n| {
                    ma.cg[ma.index[n]..ma.index[n + 1]]
                        .iter()
                        .map(|&cg| cg as i32)
                        .collect()
                })
                .collect()
        });
        let mine = self.comm.scatterv_ints(MASTER_RANK, payload.as_deref())?;

        ensure_len(&mut self.index_gl, self.ncg_home);
        ensure_len(&mut self.cgindex, self.ncg_home + 1);
        for (i, &cg) in mine.iter().enumerate() {
            self.index_gl[i] = cg as usize;
        }

        // Home charge-group sizes
        self.cgindex[0] = 0;
        for i in 0..self.ncg_home {
            self.cgindex[i + 1] = self.cgindex[i] + gcgs.size(self.index_gl[i]);
        }

        tracing::debug!(home = ?&self.index_gl[..self.ncg_home.min(20)], "home charge groups");
        self.master_has_all_cg = true;
        Ok(())
    }

    /// Bin every global charge group into its cell on the master.
    ///
    /// Centers of geometry are wrapped into the unit cell dimension by
    /// dimension from the highest down, which keeps the lattice placement
    /// correct under box tilt; wrapped groups drag their atoms along so the
    /// scattered coordinates match.
    fn distribute_cg(&mut self, gcgs: &CgBlock, state: &mut State) -> Result<()> {
        let box_ = state.box_;
        self.set_cell_sizes(&box_, false, true, true)?;

        let mut invbox = [0.0; DIM];
        for d in 0..DIM {
            invbox[d] = 1.0 / box_[d][d];
        }
        let nc = self.grid.nc;
        let tric_dir = self.tric.tric_dir;

        // The center pass is embarrassingly parallel over charge groups.
        let x = &state.x;
        let mut cogs: Vec<[f64; DIM]> = (0..gcgs.ncg())
            .into_par_iter()
            .map(|icg| center_of_geometry(&x[gcgs.index[icg]..gcgs.index[icg + 1]]))
            .collect();

        let ma = self.master.as_mut().ok_or_else(|| {
            DdError::GridInconsistency("charge group distribution away from the master rank".into())
        })?;
        ma.ncg.clear();
        ma.ncg.resize(self.grid.nnodes, 0);
        ma.nat.clear();
        ma.nat.resize(self.grid.nnodes, 0);

        let mut tmp_ind: Vec<Vec<usize>> = vec![Vec::new(); self.grid.nnodes];
        for icg in 0..gcgs.ncg() {
            let atoms = gcgs.atoms(icg);
            let cg_cm = &mut cogs[icg];
            let mut ind = [0usize; DIM];
            for d in (0..DIM).rev() {
                let mut pos_d = cg_cm[d];
                if tric_dir[d] && nc[d] > 1 {
                    for j in d + 1..DIM {
                        pos_d -= cg_cm[j] * box_[j][d] * invbox[j];
                    }
                }
                while pos_d >= box_[d][d] {
                    pos_d -= box_[d][d];
                    rvec_dec(cg_cm, box_[d]);
                    for k in atoms.clone() {
                        rvec_dec(&mut state.x[k], box_[d]);
                    }
                }
                while pos_d < 0.0 {
                    pos_d += box_[d][d];
                    rvec_inc(cg_cm, box_[d]);
                    for k in atoms.clone() {
                        rvec_inc(&mut state.x[k], box_[d]);
                    }
                }
                ind[d] = ma.cell_x[d][1..nc[d]].partition_point(|&b| pos_d >= b);
            }
            let rank = rank_of(&nc, &ind);
            tmp_ind[rank].push(icg);
            ma.ncg[rank] += 1;
            ma.nat[rank] += atoms.len();
        }

        ma.index.clear();
        ma.cg.clear();
        let mut at = 0;
        for list in &tmp_ind {
            ma.index.push(at);
            ma.cg.extend_from_slice(list);
            at += list.len();
        }
        ma.index.push(at);

        tracing::info!(distribution = ?ma.ncg, "charge group distribution");
        Ok(())
    }

    /// Centers of geometry for the home charge groups.
    pub(crate) fn calc_cgcm(&mut self, state: &State) {
        ensure_len(&mut self.cg_cm, self.ncg_home);
        for cg in 0..self.ncg_home {
            self.cg_cm[cg] =
                center_of_geometry(&state.x[self.cgindex[cg]..self.cgindex[cg + 1]]);
        }
    }

    /// Rebuild the local/global atom index maps from `cg_start` onward.
    pub(crate) fn make_dd_indices(&mut self, gcgs: &CgBlock, cg_start: usize) {
        self.ensure_ga2la(gcgs.natoms());
        ensure_len(&mut self.gatindex, self.nat_tot);

        let mut a = self.cgindex[cg_start];
        for cell in 0..self.grid.ncell {
            let cg0 = if cell == 0 {
                cg_start
            } else {
                self.ncg_cell[cell]
            };
            for cg in cg0..self.ncg_cell[cell + 1] {
                let cg_gl = self.index_gl[cg];
                for a_gl in gcgs.atoms(cg_gl) {
                    self.gatindex[a] = a_gl;
                    self.ga2la[a_gl].cell = cell as i32;
                    self.ga2la[a_gl].a = a;
                    a += 1;
                }
            }
        }
    }

    /// Forget the reverse map for atoms from `a_start` on, without touching
    /// the whole global table.
    pub(crate) fn clear_dd_indices(&mut self, a_start: usize) {
        for i in a_start..self.nat_tot.min(self.gatindex.len()) {
            self.ga2la[self.gatindex[i]].cell = -1;
        }
    }

    /// Record the zone charge-group boundaries for neighbor searching.
    pub(crate) fn set_cg_boundaries(&mut self) {
        for c in 0..self.grid.nizone {
            let (j0, j1) = (self.grid.izone[c].j0, self.grid.izone[c].j1);
            self.grid.izone[c].cg1 = self.ncg_cell[c + 1];
            self.grid.izone[c].jcg0 = self.ncg_cell[j0];
            self.grid.izone[c].jcg1 = self.ncg_cell[j1];
        }
    }

    /// The j-range and allowed periodic shifts for an i-charge-group during
    /// neighbor searching.
    pub fn ns_ranges(&self, icg: usize) -> Result<(usize, usize, [i32; DIM], [i32; DIM])> {
        let mut izone = 0;
        while icg >= self.grid.izone[izone].cg1 {
            izone += 1;
            if izone >= self.grid.nizone {
                return Err(DdError::GridInconsistency(format!(
                    "charge group {} is outside the neighbor-search zones",
                    icg
                )));
            }
        }
        let iz = &self.grid.izone[izone];
        let jcg0 = if izone == 0 { icg } else { iz.jcg0 };
        let jcg1 = iz.jcg1;

        let mut shift0 = [0; DIM];
        let mut shift1 = [0; DIM];
        for d in 0..self.grid.ndim {
            let dim = self.grid.dims[d];
            shift0[dim] = iz.shift0[dim];
            shift1[dim] = iz.shift1[dim];
            if self.tric.tric_dir[dim] || (self.grid_jump && d > 0) {
                // Conservative: stretched rows can reach one image further
                shift0[dim] -= 1;
                shift1[dim] += 1;
            }
        }
        Ok((jcg0, jcg1, shift0, shift1))
    }
}
