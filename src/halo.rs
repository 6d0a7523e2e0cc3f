//! Halo construction and the per-step coordinate and force moves.
//!
//! Communication runs one decomposition dimension at a time. Each pass sends
//! the charge groups within one cut-off of the backward neighbor's cell and
//! receives the mirror selection from the forward neighbor, appending it
//! after everything already resident. Because later dimensions treat the
//! received groups as candidates again, `ndim` passes build the full
//! 2^ndim-zone neighborhood.

use crate::comm::{Communicator, Dir};
use crate::dd::{ensure_len, DomDec};
use crate::error::{DdError, Result};
use crate::geometry::{dim_char, rvec_add, shift_index, Matrix, Rvec, DIM, SHIFTS};
use crate::state::CgBlock;

/// Zone visit order per dimension pass; pass `d` walks the 2^d zones present
/// before the pass in the order neighbor searching expects.
const CELL_PERM: [[usize; 4]; 3] = [[0, 0, 0, 0], [1, 0, 0, 0], [3, 0, 1, 2]];

/// Send/receive bookkeeping for one decomposition dimension.
///
/// Slots `0..ncell` hold per-zone charge-group counts, slot `ncell` the total
/// charge-group count and slot `ncell + 1` the total atom count, where
/// `ncell` is the zone count before this dimension's pass.
#[derive(Clone, Debug, Default)]
pub struct HaloInd {
    pub nsend: [usize; 10],
    pub nrecv: [usize; 10],
    /// Local charge-group indices selected for sending.
    pub index: Vec<usize>,
}

impl HaloInd {
    /// Append a send entry; capacity grows geometrically and never shrinks.
    #[inline]
    fn push(&mut self, cg: usize) {
        if self.index.len() == self.index.capacity() {
            let grown = (self.index.capacity() * 3 / 2).max(1024);
            self.index.reserve_exact(grown - self.index.len());
        }
        self.index.push(cg);
    }
}

impl<C: Communicator> DomDec<C> {
    /// Build the halo for the current partitioning and pull the halo charge
    /// group ids and centers over.
    pub fn setup_communication(&mut self, step: i64, gcgs: &CgBlock, box_: &Matrix) -> Result<()> {
        tracing::debug!(step, "setting up halo communication");

        let ndim = self.grid.ndim;
        let mut tric_dist = [false; DIM];
        for dim_ind in 0..ndim {
            let dim = self.grid.dims[dim_ind];
            if (self.cell_x1[dim] - self.cell_x0[dim]) * self.tric.skew_fac[dim] < self.cutoff {
                return Err(DdError::CellTooSmall {
                    dim: dim_char(dim),
                    box_len: self.cell_x1[dim] - self.cell_x0[dim],
                    skew_fac: self.tric.skew_fac[dim],
                    nc: 1,
                    cutoff: self.cutoff,
                });
            }
            for i in 0..=dim_ind {
                if self.tric.tric_dir[self.grid.dims[i]] {
                    tric_dist[dim_ind] = true;
                }
            }
        }

        // Neighbor-search extent; grid jump widens it below.
        self.cell_ns_x0 = self.cell_x0;
        self.cell_ns_x1 = self.cell_x1;

        if self.grid_jump && ndim > 1 {
            self.move_cellx(box_)?;
            self.check_grid_jump(step, box_)?;
        }

        let dim0 = self.grid.dims[0];
        let mut dim1 = 0;
        // Near corners of the neighboring cells per dimension pass and zone.
        let mut corner = [[0.0f64; 4]; DIM];
        let mut corner_round_0 = 0.0;
        let mut corner_round_1 = [0.0f64; 4];

        corner[0][0] = self.cell_x0[dim0];
        if ndim >= 2 {
            dim1 = self.grid.dims[1];
            // Zone 1 only sees this row from the first row; every row sees
            // zone 0.
            corner[1][0] = self.cell_x0[dim1];
            corner[1][1] = self.cell_x0[dim1];
            if self.grid_jump {
                corner[1][1] = self.cell_x0[dim1].max(self.cell_d1[1][0]);
                if self.params.inter_cg_bondeds {
                    // For the bonded distance we need the maximum
                    corner[1][0] = corner[1][1];
                }
            }
            // Upper-right corner for the rounding correction
            corner_round_0 = self.cell_x1[dim0];

            if ndim >= 3 {
                let dim2 = self.grid.dims[2];
                for j in 0..4 {
                    corner[2][j] = self.cell_x0[dim2];
                }
                if self.grid_jump {
                    // Use the maximum of the i-zones that see a j-zone
                    for i in 0..self.grid.nizone {
                        let iz = self.grid.izone[i];
                        for j in iz.j0..iz.j1 {
                            if j >= 4 {
                                let s0 = self.grid.shift[i][dim0];
                                let s1 = self.grid.shift[i][dim1];
                                corner[2][j - 4] =
                                    corner[2][j - 4].max(self.cell_d2[s0][s1][0]);
                            }
                        }
                    }
                    if self.params.inter_cg_bondeds {
                        for j in 0..4 {
                            corner[2][j] = corner[2][1];
                        }
                    }
                }

                // Zones (0,0,0) and (1,0,0) can see zone (0,1,1);
                // only (0,0,0) can see (1,1,1).
                corner_round_1[0] = self.cell_x1[dim1];
                corner_round_1[3] = self.cell_x1[dim1];
                if self.grid_jump {
                    corner_round_1[0] = self.cell_x1[dim1].max(self.cell_d1[1][1]);
                    if self.params.inter_cg_bondeds {
                        corner_round_1[3] = corner_round_1[0];
                    }
                }
            }
        }

        let r_comm2 = self.cutoff * self.cutoff;
        let skew_fac2_0 = self.tric.skew_fac[dim0] * self.tric.skew_fac[dim0];
        let skew_fac2_1 = if ndim >= 3 {
            self.tric.skew_fac[dim1] * self.tric.skew_fac[dim1]
        } else {
            0.0
        };

        self.ncg_cell[0] = 0;
        self.ncg_cell[1] = self.ncg_home;

        let mut nat_tot = self.nat_home;
        let mut ncell = 1;
        for dim_ind in 0..ndim {
            let dim = self.grid.dims[dim_ind];
            let skew_fac2_d = self.tric.skew_fac[dim] * self.tric.skew_fac[dim];

            self.buf_int.clear();
            self.buf_vr.clear();
            self.ind[dim_ind].index.clear();
            let mut nsend = 0;
            let mut nat = 0;
            for cell in 0..ncell {
                self.ind[dim_ind].nsend[cell] = 0;
                let celli = CELL_PERM[dim_ind][cell];
                for cg in self.ncg_cell[celli]..self.ncg_cell[celli + 1] {
                    let cm = self.cg_cm[cg];
                    let mut r2 = 0.0;
                    if !tric_dist[dim_ind] {
                        // Rectangular box, axis-wise distances
                        let r = cm[dim] - corner[dim_ind][cell];
                        if r > 0.0 {
                            r2 += r * r;
                        }
                        // Rounding against the corner already handled by the
                        // lower dimensions avoids double counting.
                        if dim_ind >= 1 && (celli == 1 || celli == 2) {
                            let r = cm[dim0] - corner_round_0;
                            r2 += r * r;
                        }
                        if dim_ind == 2 && (celli == 2 || celli == 3) {
                            let r = cm[dim1] - corner_round_1[cell];
                            if r > 0.0 {
                                r2 += r * r;
                            }
                        }
                    } else {
                        // Triclinic: discount the tilt of the higher
                        // dimensions, then scale to slab thickness.
                        let mut r = cm[dim] - corner[dim_ind][cell];
                        for i in dim + 1..DIM {
                            r -= cm[i] * self.tric.v[dim][i][dim];
                        }
                        if r > 0.0 {
                            r2 += r * r * skew_fac2_d;
                        }
                        if dim_ind >= 1 && (celli == 1 || celli == 2) {
                            let mut r = cm[dim0] - corner_round_0;
                            for i in dim0 + 1..DIM {
                                r -= cm[i] * self.tric.v[dim0][i][dim0];
                            }
                            r2 += r * r * skew_fac2_0;
                        }
                        if dim_ind == 2 && (celli == 2 || celli == 3) {
                            let mut r = cm[dim1] - corner_round_1[cell];
                            for i in dim1 + 1..DIM {
                                r -= cm[i] * self.tric.v[dim1][i][dim1];
                            }
                            if r > 0.0 {
                                r2 += r * r * skew_fac2_1;
                            }
                        }
                    }

                    if r2 < r_comm2 {
                        self.ind[dim_ind].push(cg);
                        self.buf_int.push(self.index_gl[cg] as i32);
                        self.ind[dim_ind].nsend[cell] += 1;
                        if self.grid.ci[dim] == 0 {
                            // Periodic image: the receiver sits across the
                            // box boundary
                            self.buf_vr.push(rvec_add(cm, box_[dim]));
                        } else {
                            self.buf_vr.push(cm);
                        }
                        nsend += 1;
                        nat += self.cgindex[cg + 1] - self.cgindex[cg];
                    }
                }
            }
            self.ind[dim_ind].nsend[ncell] = nsend;
            self.ind[dim_ind].nsend[ncell + 1] = nat;

            // Counts first, then ids and centers, receiving in place after
            // the resident charge groups.
            let scounts: Vec<i32> = self.ind[dim_ind].nsend[..ncell + 2]
                .iter()
                .map(|&n| n as i32)
                .collect();
            let rcounts = self.sendrecv_ints(dim_ind, Dir::Backward, &scounts, ncell + 2)?;
            for (slot, &n) in rcounts.iter().enumerate() {
                self.ind[dim_ind].nrecv[slot] = n as usize;
            }
            let ncg_recv = self.ind[dim_ind].nrecv[ncell];

            let cg0 = self.ncg_cell[ncell];
            ensure_len(&mut self.index_gl, cg0 + ncg_recv);
            ensure_len(&mut self.cgindex, cg0 + ncg_recv + 1);
            ensure_len(&mut self.cg_cm, cg0 + ncg_recv);

            let send_ids = std::mem::take(&mut self.buf_int);
            let recv_ids = self.sendrecv_ints(dim_ind, Dir::Backward, &send_ids, ncg_recv)?;
            self.buf_int = send_ids;
            for (i, &gcg) in recv_ids.iter().enumerate() {
                self.index_gl[cg0 + i] = gcg as usize;
            }

            let send_cm = std::mem::take(&mut self.buf_vr);
            let recv_cm = self.sendrecv_rvecs(dim_ind, Dir::Backward, &send_cm, ncg_recv)?;
            self.buf_vr = send_cm;
            self.cg_cm[cg0..cg0 + ncg_recv].copy_from_slice(&recv_cm);

            // Extend the local prefix sum over the received groups.
            for cell in ncell..2 * ncell {
                self.ncg_cell[cell + 1] = self.ncg_cell[cell] + self.ind[dim_ind].nrecv[cell - ncell];
                for cg in self.ncg_cell[cell]..self.ncg_cell[cell + 1] {
                    let nrcg = gcgs.size(self.index_gl[cg]);
                    self.cgindex[cg + 1] = self.cgindex[cg] + nrcg;
                    nat_tot += nrcg;
                }
            }
            ncell *= 2;
        }

        self.ncg_tot = self.ncg_cell[self.grid.ncell];
        self.nat_tot = nat_tot;
        self.nat_tot_vsite = nat_tot;
        self.nat_tot_con = nat_tot;

        tracing::debug!(
            zones = ?&self.ncg_cell[..self.grid.ncell + 1],
            "finished setting up halo communication"
        );
        Ok(())
    }

    /// Fill the halo coordinates from the current send tables. Runs the
    /// dimensions forward; ranks on the periodic edge shift by one box
    /// vector so the receiver sees continuous coordinates.
    pub fn move_x(&mut self, box_: &Matrix, x: &mut [Rvec]) -> Result<()> {
        let mut ncell = 1;
        let mut nat_tot = self.nat_home;
        for dim_ind in 0..self.grid.ndim {
            let dim = self.grid.dims[dim_ind];
            let shifted = self.grid.ci[dim] == 0;

            self.buf_vr.clear();
            let ind = &self.ind[dim_ind];
            for &cg in &ind.index[..ind.nsend[ncell]] {
                for j in self.cgindex[cg]..self.cgindex[cg + 1] {
                    if shifted {
                        self.buf_vr.push(rvec_add(x[j], box_[dim]));
                    } else {
                        self.buf_vr.push(x[j]);
                    }
                }
            }

            let nrecv = ind.nrecv[ncell + 1];
            let send = std::mem::take(&mut self.buf_vr);
            let recv = self.sendrecv_rvecs(dim_ind, Dir::Backward, &send, nrecv)?;
            self.buf_vr = send;
            x[nat_tot..nat_tot + nrecv].copy_from_slice(&recv);
            nat_tot += nrecv;
            ncell *= 2;
        }
        Ok(())
    }

    /// Return the halo forces to their owners, accumulating into the home
    /// forces. Runs the dimensions in reverse, making it the adjoint of
    /// [`move_x`](Self::move_x); the periodic-edge contribution also lands
    /// in the shift-force slot for the virial.
    pub fn move_f(
        &mut self,
        f: &mut [Rvec],
        mut fshift: Option<&mut [Rvec; SHIFTS]>,
    ) -> Result<()> {
        let mut ncell = self.grid.ncell / 2;
        let mut nat_tot = self.nat_tot;
        for dim_ind in (0..self.grid.ndim).rev() {
            let dim = self.grid.dims[dim_ind];
            let nrecv = self.ind[dim_ind].nrecv[ncell + 1];
            nat_tot -= nrecv;

            let nsend_at = self.ind[dim_ind].nsend[ncell + 1];
            let recv = self.sendrecv_rvecs(
                dim_ind,
                Dir::Forward,
                &f[nat_tot..nat_tot + nrecv],
                nsend_at,
            )?;

            let ind = &self.ind[dim_ind];
            let mut n = 0;
            let on_edge = self.grid.ci[dim] == 0;
            let mut vis = [0i32; DIM];
            vis[dim] = 1;
            let is = shift_index(vis);
            for &cg in &ind.index[..ind.nsend[ncell]] {
                match fshift.as_deref_mut() {
                    Some(fs) if on_edge => {
                        for j in self.cgindex[cg]..self.cgindex[cg + 1] {
                            for d in 0..DIM {
                                f[j][d] += recv[n][d];
                                // This force crossed the box; it belongs to
                                // the image's virial term
                                fs[is][d] += recv[n][d];
                            }
                            n += 1;
                        }
                    }
                    _ => {
                        for j in self.cgindex[cg]..self.cgindex[cg + 1] {
                            for d in 0..DIM {
                                f[j][d] += recv[n][d];
                            }
                            n += 1;
                        }
                    }
                }
            }
            ncell /= 2;
        }
        Ok(())
    }

    /// Exchange cell boundaries with the neighbor rows so a grid-jumped
    /// decomposition knows how far its neighbors reach, and record the
    /// boundary extremes per dimension.
    pub(crate) fn move_cellx(&mut self, box_: &Matrix) -> Result<()> {
        let ndim = self.grid.ndim;

        self.cell_d1[0][0] = self.cell_f0[1];
        self.cell_d1[0][1] = self.cell_f1[1];
        if ndim >= 3 {
            self.cell_d2[0][0][0] = self.cell_f0[2];
            self.cell_d2[0][0][1] = self.cell_f1[2];
        }

        // Pairs of fractions ride in a flat buffer; the receive side is
        // appended behind the send side.
        let mut buf: Vec<[f64; 2]> = Vec::with_capacity(8);
        let mut extr_s = [[0.0f64; 2]; 2];
        let mut pos = 0;

        for d in (0..ndim - 1).rev() {
            let dim = self.grid.dims[d];

            buf.push([self.cell_f0[d + 1], self.cell_f1[d + 1]]);
            pos += 1;
            extr_s[d] = [self.cell_f0[d + 1], self.cell_f1[d + 1]];

            if d == 0 && ndim >= 3 {
                buf.push(extr_s[1]);
                pos += 1;
            }

            if self.grid.nc[dim] > 2 {
                // The extremes only need to travel forward through the row
                let n = ndim - d - 1;
                let send: Vec<f64> = extr_s[d..d + n].iter().flatten().copied().collect();
                let recv = self.sendrecv_reals(d, Dir::Forward, &send, 2 * n)?;
                for d1 in d..ndim - 1 {
                    let r = &recv[2 * (d1 - d)..2 * (d1 - d) + 2];
                    extr_s[d1][0] = extr_s[d1][0].max(r[0]);
                    extr_s[d1][1] = extr_s[d1][1].min(r[1]);
                }
            }

            let send: Vec<f64> = buf[..pos].iter().flatten().copied().collect();
            let recv = self.sendrecv_reals(d, Dir::Backward, &send, 2 * pos)?;
            for pair in recv.chunks_exact(2) {
                buf.push([pair[0], pair[1]]);
            }

            if d == 1 || (d == 0 && ndim == 3) {
                for i in d..2 {
                    self.cell_d2[1 - d][i] = buf[pos];
                    pos += 1;
                    extr_s[1][0] = extr_s[1][0].max(self.cell_d2[1 - d][i][0]);
                    extr_s[1][1] = extr_s[1][1].min(self.cell_d2[1 - d][i][1]);
                }
            }
            if d == 0 {
                self.cell_d1[1] = buf[pos];
                pos += 1;
                extr_s[0][0] = extr_s[0][0].max(self.cell_d1[1][0]);
                extr_s[0][1] = extr_s[0][1].min(self.cell_d1[1][1]);
            }
            if d == 0 && ndim >= 3 {
                extr_s[1][0] = extr_s[1][0].max(buf[pos][0]);
                extr_s[1][1] = extr_s[1][1].min(buf[pos][1]);
                pos += 1;
            }
        }

        // Convert the neighbor fractions to real bounds and widen the
        // neighbor-search extent to cover them.
        if ndim >= 2 {
            let dim = self.grid.dims[1];
            let len = box_[dim][dim];
            for i in 0..2 {
                for k in 0..2 {
                    self.cell_d1[i][k] *= len;
                }
                self.cell_ns_x0[dim] = self.cell_ns_x0[dim].min(self.cell_d1[i][0]);
                self.cell_ns_x1[dim] = self.cell_ns_x1[dim].max(self.cell_d1[i][1]);
            }
        }
        if ndim >= 3 {
            let dim = self.grid.dims[2];
            let len = box_[dim][dim];
            for i in 0..2 {
                for j in 0..2 {
                    for k in 0..2 {
                        self.cell_d2[i][j][k] *= len;
                    }
                    self.cell_ns_x0[dim] = self.cell_ns_x0[dim].min(self.cell_d2[i][j][0]);
                    self.cell_ns_x1[dim] = self.cell_ns_x1[dim].max(self.cell_d2[i][j][1]);
                }
            }
        }
        for d in 1..ndim {
            self.cell_f_max0[d] = extr_s[d - 1][0];
            self.cell_f_min1[d] = extr_s[d - 1][1];
        }
        Ok(())
    }

    /// A grid-jumped boundary that moved within one cut-off of a neighbor
    /// row's boundary breaks the single-shift halo assumption.
    pub(crate) fn check_grid_jump(&self, step: i64, box_: &Matrix) -> Result<()> {
        for d in 1..self.grid.ndim {
            let dim = self.grid.dims[d];
            let mut bfac = box_[dim][dim];
            if self.tric.tric_dir[dim] {
                bfac *= self.tric.skew_fac[dim];
            }
            if (self.cell_f1[d] - self.cell_f_max0[d]) * bfac < self.cutoff
                || (self.cell_f0[d] - self.cell_f_min1[d]) * bfac > -self.cutoff
            {
                return Err(DdError::GridInconsistency(format!(
                    "step {}: the domain decomposition grid has shifted too much in the {}-direction around cell {} {} {}",
                    step,
                    dim_char(dim),
                    self.grid.ci[0],
                    self.grid.ci[1],
                    self.grid.ci[2]
                )));
            }
        }
        Ok(())
    }
}
