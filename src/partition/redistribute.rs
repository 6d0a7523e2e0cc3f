//! Incremental redistribution: route drifted charge groups to neighbors.
//!
//! Each home charge group gets a per-dimension deviation of -1, 0 or +1
//! against the current cell bounds. Groups that stay are compacted in place;
//! movers are packed into one outgoing buffer per face neighbor and walked
//! across the decomposition dimensions in order, so a diagonal move reaches
//! its destination in at most `ndim` hops.

use crate::comm::{Communicator, Dir};
use crate::dd::{ensure_len, DomDec};
use crate::error::{DdError, Result};
use crate::geometry::{dim_char, rvec_dec, rvec_inc, Rvec, DIM};
use crate::state::{center_of_geometry, CgBlock, Ga2La, State};

/// Ints per charge group in the flag buffer: global id, then size and
/// direction flags packed into one word.
const CG_IBS: usize = 2;
/// Low 16 bits carry the charge-group size.
const FLAG_NRCG: i32 = 0xffff;

#[inline]
fn flag_fw(d: usize) -> i32 {
    1 << (16 + d * 2)
}

#[inline]
fn flag_bw(d: usize) -> i32 {
    1 << (16 + d * 2 + 1)
}

impl<C: Communicator> DomDec<C> {
    /// Move the charge groups that left this cell to their new owners and
    /// compact the local arrays. Returns the number of home charge groups
    /// that stayed, the rebuild start for the index pass.
    pub fn redistribute_cg(
        &mut self,
        step: i64,
        gcgs: &CgBlock,
        state: &mut State,
    ) -> Result<usize> {
        let ndim = self.grid.ndim;
        let has_v = self.params.integrator.has_velocities();
        let has_sd = self.params.integrator.has_sd_state();
        let nvec = 1 + usize::from(has_v) + usize::from(has_sd);

        let box_ = state.box_;
        let mut invbox = [0.0; DIM];
        let mut cell_x0 = [0.0; DIM];
        let mut cell_x1 = [0.0; DIM];
        let mut limit0 = [0.0; DIM];
        let mut limit1 = [0.0; DIM];
        let mut tric_dir = [false; DIM];
        for d in 0..DIM {
            invbox[d] = 1.0 / box_[d][d];
            cell_x0[d] = self.cell_x0[d];
            cell_x1[d] = self.cell_x1[d];
            limit0[d] = cell_x0[d] - self.cutoff;
            limit1[d] = cell_x1[d] + self.cutoff;
            tric_dir[d] = self.tric.tric_dir[d] && self.grid.nc[d] > 1;
        }

        // Per-neighbor outgoing buffers: (id, size|flags) ints and the
        // packed (center, x.., v.., sd..) payload.
        let mut cggl_flag: [Vec<i32>; DIM * 2] = Default::default();
        let mut cgcm_state: [Vec<Rvec>; DIM * 2] = Default::default();
        let mut ncg = [0usize; DIM * 2];
        let mut nat = [0usize; DIM * 2];

        let mut moved: Vec<i32> = vec![-1; self.ncg_home];

        // Pass 1: new centers, box wrap, deviation flags.
        for cg in 0..self.ncg_home {
            let k0 = self.cgindex[cg];
            let k1 = self.cgindex[cg + 1];
            let nrcg = k1 - k0;
            let mut cm_new = center_of_geometry(&state.x[k0..k1]);

            let mut dev = [0i32; DIM];
            for d in (0..DIM).rev() {
                if self.grid.nc[d] > 1 {
                    // Location in lattice coordinates
                    let mut pos_d = cm_new[d];
                    if tric_dir[d] {
                        for d2 in d + 1..DIM {
                            pos_d -= cm_new[d2] * box_[d2][d] * invbox[d2];
                        }
                    }
                    if pos_d >= cell_x1[d] {
                        if pos_d >= limit1[d] {
                            return Err(self.cg_move_error(step, cg, d, 1, cm_new, pos_d));
                        }
                        dev[d] = 1;
                        if self.grid.ci[d] == self.grid.nc[d] - 1 {
                            rvec_dec(&mut cm_new, box_[d]);
                            for k in k0..k1 {
                                rvec_dec(&mut state.x[k], box_[d]);
                            }
                        }
                    } else if pos_d < cell_x0[d] {
                        if pos_d < limit0[d] {
                            return Err(self.cg_move_error(step, cg, d, -1, cm_new, pos_d));
                        }
                        dev[d] = -1;
                        if self.grid.ci[d] == 0 {
                            rvec_inc(&mut cm_new, box_[d]);
                            for k in k0..k1 {
                                rvec_inc(&mut state.x[k], box_[d]);
                            }
                        }
                    }
                } else {
                    // Undecomposed dimension: plain rectangular wrap
                    while cm_new[d] >= box_[d][d] {
                        rvec_dec(&mut cm_new, box_[d]);
                        for k in k0..k1 {
                            rvec_dec(&mut state.x[k], box_[d]);
                        }
                    }
                    while cm_new[d] < 0.0 {
                        rvec_inc(&mut cm_new, box_[d]);
                        for k in k0..k1 {
                            rvec_inc(&mut state.x[k], box_[d]);
                        }
                    }
                }
            }

            self.cg_cm[cg] = cm_new;

            // Route to the first deviating dimension; with two cells the
            // backward neighbor is the forward one.
            let mut flag = 0;
            let mut mc = -1i32;
            for d in 0..ndim {
                let dim = self.grid.dims[d];
                if dev[dim] == 1 {
                    flag |= flag_fw(d);
                    if mc == -1 {
                        mc = (d * 2) as i32;
                    }
                } else if dev[dim] == -1 {
                    flag |= flag_bw(d);
                    if mc == -1 {
                        mc = if self.grid.nc[dim] > 2 {
                            (d * 2 + 1) as i32
                        } else {
                            (d * 2) as i32
                        };
                    }
                }
            }
            moved[cg] = mc;
            if mc >= 0 {
                let mc = mc as usize;
                cggl_flag[mc].push(self.index_gl[cg] as i32);
                cggl_flag[mc].push(nrcg as i32 | flag);
                ncg[mc] += 1;
                nat[mc] += nrcg;
            }
        }

        // Size the payload buffers for the exact interleaved layout.
        for mc in 0..ndim * 2 {
            cgcm_state[mc].resize(ncg[mc] + nat[mc] * nvec, [0.0; DIM]);
        }

        // Pass 2: compact stayers in place, scatter movers into the
        // per-neighbor payloads.
        let home_pos_cg =
            compact_and_copy_vec_cg(&moved, &self.cgindex, nvec, &mut self.cg_cm, &mut cgcm_state);
        let mut home_pos_at =
            compact_and_copy_vec_at(&moved, &self.cgindex, nvec, 0, &mut state.x, &mut cgcm_state);
        if has_v {
            compact_and_copy_vec_at(&moved, &self.cgindex, nvec, 1, &mut state.v, &mut cgcm_state);
        }
        if has_sd {
            let slot = 1 + usize::from(has_v);
            compact_and_copy_vec_at(
                &moved,
                &self.cgindex,
                nvec,
                slot,
                &mut state.sd_x,
                &mut cgcm_state,
            );
        }

        compact_ind(
            self.ncg_home,
            &moved,
            &mut self.index_gl,
            &mut self.cgindex,
            &mut self.gatindex,
            &mut self.ga2la,
        );

        let ncg_stay_home = home_pos_cg;
        let mut home_pos_cg = home_pos_cg;

        let old_nat_home = self.nat_home;
        for d in 0..ndim {
            let dim = self.grid.dims[d];
            let mut recv_flags: Vec<i32> = Vec::new();
            let mut recv_state: Vec<Rvec> = Vec::new();
            let mut ncg_recv = 0usize;

            let ndir = if self.grid.nc[dim] == 2 { 1 } else { 2 };
            for dir in 0..ndir {
                let cdd = d * 2 + dir;
                let dirv = if dir == 0 { Dir::Forward } else { Dir::Backward };

                // Counts first, then the flag ints, then the payload.
                let sbuf = [ncg[cdd] as i32, nat[cdd] as i32];
                tracing::debug!(
                    dim_ind = d,
                    dir,
                    ncg = ncg[cdd],
                    nat = nat[cdd],
                    "sending drifted charge groups"
                );
                let rbuf = self.sendrecv_ints(d, dirv, &sbuf, 2)?;
                let (ncg_r, nat_r) = (rbuf[0] as usize, rbuf[1] as usize);

                let flags = self.sendrecv_ints(
                    d,
                    dirv,
                    &cggl_flag[cdd][..ncg[cdd] * CG_IBS],
                    ncg_r * CG_IBS,
                )?;
                recv_flags.extend_from_slice(&flags);

                let nvs = ncg[cdd] + nat[cdd] * nvec;
                let nvr = ncg_r + nat_r * nvec;
                let payload = self.sendrecv_rvecs(d, dirv, &cgcm_state[cdd][..nvs], nvr)?;
                recv_state.extend_from_slice(&payload);

                ncg_recv += ncg_r;
            }

            // Keep or forward each received charge group.
            let mut buf_pos = 0usize;
            for cg in 0..ncg_recv {
                let mut flag = recv_flags[cg * CG_IBS + 1];
                let mut mc = -1i32;
                if d < ndim - 1 {
                    for d2 in d + 1..ndim {
                        if mc != -1 {
                            break;
                        }
                        let dim2 = self.grid.dims[d2];
                        if self.grid_jump {
                            // Rows differ, so the sender's verdict for this
                            // dimension may not hold here; recheck against
                            // our own bounds unless the group crosses the
                            // periodic boundary, where the flag is already
                            // image-correct.
                            let crosses_pbc = (self.grid.ci[dim2] == self.grid.nc[dim2] - 1
                                && flag & flag_fw(d2) != 0)
                                || (self.grid.ci[dim2] == 0 && flag & flag_bw(d2) != 0);
                            if !crosses_pbc {
                                flag &= !(flag_fw(d2) | flag_bw(d2));
                                let cm = recv_state[buf_pos];
                                let mut pos_d = cm[dim2];
                                if tric_dir[dim2] {
                                    for d3 in dim2 + 1..DIM {
                                        pos_d -= cm[d3] * box_[d3][dim2] * invbox[d3];
                                    }
                                }
                                if pos_d >= cell_x1[dim2] {
                                    flag |= flag_fw(d2);
                                } else if pos_d < cell_x0[dim2] {
                                    flag |= flag_bw(d2);
                                }
                                recv_flags[cg * CG_IBS + 1] = flag;
                            }
                        }
                        if flag & flag_fw(d2) != 0 {
                            mc = (d2 * 2) as i32;
                        } else if flag & flag_bw(d2) != 0 {
                            mc = if self.grid.nc[self.grid.dims[d2]] > 2 {
                                (d2 * 2 + 1) as i32
                            } else {
                                (d2 * 2) as i32
                            };
                        }
                    }
                }

                let nrcg = (flag & FLAG_NRCG) as usize;
                if mc == -1 {
                    // This one is ours now
                    ensure_len(&mut self.index_gl, home_pos_cg + 1);
                    ensure_len(&mut self.cgindex, home_pos_cg + 2);
                    ensure_len(&mut self.cg_cm, home_pos_cg + 1);
                    self.index_gl[home_pos_cg] = recv_flags[cg * CG_IBS] as usize;
                    self.cgindex[home_pos_cg + 1] = self.cgindex[home_pos_cg] + nrcg;
                    self.cg_cm[home_pos_cg] = recv_state[buf_pos];
                    buf_pos += 1;
                    state.ensure_capacity(home_pos_at + nrcg);
                    for i in 0..nrcg {
                        state.x[home_pos_at + i] = recv_state[buf_pos];
                        buf_pos += 1;
                    }
                    if has_v {
                        for i in 0..nrcg {
                            state.v[home_pos_at + i] = recv_state[buf_pos];
                            buf_pos += 1;
                        }
                    }
                    if has_sd {
                        for i in 0..nrcg {
                            state.sd_x[home_pos_at + i] = recv_state[buf_pos];
                            buf_pos += 1;
                        }
                    }
                    home_pos_cg += 1;
                    home_pos_at += nrcg;
                } else {
                    // Pass it along the next dimension
                    let mc = mc as usize;
                    cggl_flag[mc].push(recv_flags[cg * CG_IBS]);
                    cggl_flag[mc].push(flag);
                    cgcm_state[mc]
                        .extend_from_slice(&recv_state[buf_pos..buf_pos + 1 + nrcg * nvec]);
                    buf_pos += 1 + nrcg * nvec;
                    ncg[mc] += 1;
                    nat[mc] += nrcg;
                }
            }
        }

        // Home indices were compacted in place; the halo entries are stale
        // until the next halo setup.
        self.clear_dd_indices(old_nat_home);

        self.ncg_home = home_pos_cg;
        self.nat_home = home_pos_at;
        self.master_has_all_cg = false;

        tracing::debug!(
            stayed = ncg_stay_home,
            home = self.ncg_home,
            "finished repartitioning"
        );
        Ok(ncg_stay_home)
    }

    fn cg_move_error(
        &self,
        step: i64,
        cg: usize,
        d: usize,
        dir: i32,
        cm_new: Rvec,
        pos_d: f64,
    ) -> DdError {
        DdError::CgEscaped {
            step,
            atom: self.gatindex[self.cgindex[cg]],
            dim: dim_char(d),
            cutoff: self.cutoff,
            distance: if dir == 1 {
                pos_d - self.cell_x1[d]
            } else {
                pos_d - self.cell_x0[d]
            },
            old: self.cg_cm[cg],
            new: cm_new,
        }
    }
}

/// Compact the per-atom vector `src` in place for staying groups and copy
/// movers into their payload slot `vec` of `bufs`.
fn compact_and_copy_vec_at(
    moved: &[i32],
    cgindex: &[usize],
    nvec: usize,
    vec: usize,
    src: &mut [Rvec],
    bufs: &mut [Vec<Rvec>],
) -> usize {
    let mut pos_vec = [0usize; DIM * 2];
    let mut home_pos = 0;

    let mut i0 = 0;
    for (icg, &m) in moved.iter().enumerate() {
        let i1 = cgindex[icg + 1];
        if m == -1 {
            for i in i0..i1 {
                src[home_pos] = src[i];
                home_pos += 1;
            }
        } else {
            let m = m as usize;
            let nrcg = i1 - i0;
            // Interleave behind the center and any earlier vectors
            pos_vec[m] += 1 + vec * nrcg;
            for i in i0..i1 {
                bufs[m][pos_vec[m]] = src[i];
                pos_vec[m] += 1;
            }
            pos_vec[m] += (nvec - vec - 1) * nrcg;
        }
        i0 = i1;
    }

    home_pos
}

/// Same for the per-group center array, which owns slot 0 of each payload.
fn compact_and_copy_vec_cg(
    moved: &[i32],
    cgindex: &[usize],
    nvec: usize,
    cg_cm: &mut [Rvec],
    bufs: &mut [Vec<Rvec>],
) -> usize {
    let mut pos_vec = [0usize; DIM * 2];
    let mut home_pos = 0;

    let mut i0 = 0;
    for (icg, &m) in moved.iter().enumerate() {
        let i1 = cgindex[icg + 1];
        if m == -1 {
            cg_cm[home_pos] = cg_cm[icg];
            home_pos += 1;
        } else {
            let m = m as usize;
            let nrcg = i1 - i0;
            bufs[m][pos_vec[m]] = cg_cm[icg];
            pos_vec[m] += 1 + nrcg * nvec;
        }
        i0 = i1;
    }

    home_pos
}

/// Compact the index tables for staying groups; movers lose their reverse
/// mapping here.
fn compact_ind(
    ncg: usize,
    moved: &[i32],
    index_gl: &mut [usize],
    cgindex: &mut [usize],
    gatindex: &mut [usize],
    ga2la: &mut [Ga2La],
) -> usize {
    let mut home_pos = 0;
    let mut nat = 0;
    for cg in 0..ncg {
        let a0 = cgindex[cg];
        let a1 = cgindex[cg + 1];
        if moved[cg] == -1 {
            // Compact in place; the zone stays 0 so only the local
            // position changes.
            cgindex[home_pos] = nat;
            for a in a0..a1 {
                let a_gl = gatindex[a];
                gatindex[nat] = a_gl;
                ga2la[a_gl].a = nat;
                nat += 1;
            }
            index_gl[home_pos] = index_gl[cg];
            home_pos += 1;
        } else {
            for a in a0..a1 {
                ga2la[gatindex[a]].cell = -1;
            }
        }
    }
    cgindex[home_pos] = nat;

    home_pos
}
