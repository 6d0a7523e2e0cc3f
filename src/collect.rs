//! Whole-system gather and scatter through the master rank.
//!
//! Point-to-point per rank rather than clever collectives: this path only
//! runs at checkpoints and external resets, so the master's bandwidth is an
//! acceptable bottleneck in exchange for keeping the global ordering logic
//! in one place.

use crate::comm::Communicator;
use crate::dd::{DomDec, MASTER_RANK};
use crate::error::{DdError, Result};
use crate::geometry::{Rvec, DIM};
use crate::state::{CgBlock, State};

impl<C: Communicator> DomDec<C> {
    /// Refresh the master's map of who owns which charge group.
    pub fn collect_cg(&mut self) -> Result<()> {
        let counts = self
            .comm
            .gather_ints(MASTER_RANK, &[self.ncg_home as i32, self.nat_home as i32])?;
        if let Some(counts) = counts {
            let nnodes = self.grid.nnodes;
            let ma = self.master.as_mut().ok_or_else(|| {
                DdError::GridInconsistency("charge group collection without master state".into())
            })?;
            ma.ncg.clear();
            ma.nat.clear();
            ma.index.clear();
            ma.index.push(0);
            for n in 0..nnodes {
                ma.ncg.push(counts[2 * n] as usize);
                ma.nat.push(counts[2 * n + 1] as usize);
                ma.index.push(ma.index[n] + ma.ncg[n]);
            }
            tracing::debug!(distribution = ?ma.ncg, "collected charge group distribution");
        }

        let groups = self.comm.gatherv_ints(
            MASTER_RANK,
            &self.index_gl[..self.ncg_home]
                .iter()
                .map(|&cg| cg as i32)
                .collect::<Vec<_>>(),
        )?;
        if let Some(groups) = groups {
            let ma = self.master.as_mut().ok_or_else(|| {
                DdError::GridInconsistency("charge group collection without master state".into())
            })?;
            ma.cg.clear();
            for per_rank in groups {
                ma.cg.extend(per_rank.into_iter().map(|cg| cg as usize));
            }
        }

        self.master_has_all_cg = true;
        Ok(())
    }

    /// Gather a per-atom vector into global atom order on the master.
    pub fn collect_vec(
        &mut self,
        gcgs: &CgBlock,
        local: &[Rvec],
        global: Option<&mut Vec<Rvec>>,
    ) -> Result<()> {
        if !self.master_has_all_cg {
            self.collect_cg()?;
        }

        if !self.is_master() {
            return self.comm.send_rvecs(MASTER_RANK, &local[..self.nat_home]);
        }

        let global = global.ok_or_else(|| {
            DdError::GridInconsistency("master has no global vector to collect into".into())
        })?;
        let ma = self.master.as_ref().ok_or_else(|| {
            DdError::GridInconsistency("vector collection without master state".into())
        })?;
        if global.len() < gcgs.natoms() {
            global.resize(gcgs.natoms(), [0.0; DIM]);
        }

        for n in 0..self.grid.nnodes {
            let buf: Vec<Rvec> = if n == MASTER_RANK {
                local[..self.nat_home].to_vec()
            } else {
                self.comm.recv_rvecs(n, ma.nat[n])?
            };
            let mut a = 0;
            for i in ma.index[n]..ma.index[n + 1] {
                for c in gcgs.atoms(ma.cg[i]) {
                    global[c] = buf[a];
                    a += 1;
                }
            }
            if a != ma.nat[n] {
                return Err(DdError::GridInconsistency(format!(
                    "rank {} delivered {} atoms where {} were expected",
                    n, a, ma.nat[n]
                )));
            }
        }
        Ok(())
    }

    /// Scatter a global per-atom vector out to the owning ranks.
    pub fn distribute_vec(
        &mut self,
        gcgs: &CgBlock,
        global: Option<&[Rvec]>,
        local: &mut Vec<Rvec>,
    ) -> Result<()> {
        if self.is_master() {
            let global = global.ok_or_else(|| {
                DdError::GridInconsistency("master has no global vector to distribute".into())
            })?;
            let ma = self.master.as_ref().ok_or_else(|| {
                DdError::GridInconsistency("vector distribution without master state".into())
            })?;

            let mut buf = Vec::new();
            for n in 0..self.grid.nnodes {
                buf.clear();
                for i in ma.index[n]..ma.index[n + 1] {
                    for c in gcgs.atoms(ma.cg[i]) {
                        buf.push(global[c]);
                    }
                }
                if buf.len() != ma.nat[n] {
                    return Err(DdError::GridInconsistency(format!(
                        "packed {} atoms for rank {} where {} were expected",
                        buf.len(),
                        n,
                        ma.nat[n]
                    )));
                }
                if n == MASTER_RANK {
                    if local.len() < buf.len() {
                        local.resize(buf.len(), [0.0; DIM]);
                    }
                    local[..buf.len()].copy_from_slice(&buf);
                } else {
                    self.comm.send_rvecs(n, &buf)?;
                }
            }
        } else {
            let recv = self.comm.recv_rvecs(MASTER_RANK, self.nat_home)?;
            if local.len() < recv.len() {
                local.resize(recv.len(), [0.0; DIM]);
            }
            local[..recv.len()].copy_from_slice(&recv);
        }
        Ok(())
    }

    /// Gather the full dynamic state onto the master.
    pub fn collect_state(
        &mut self,
        gcgs: &CgBlock,
        state_local: &State,
        state_global: Option<&mut State>,
    ) -> Result<()> {
        let mut state_global = state_global;
        if self.is_master() {
            let global = state_global.as_deref_mut().ok_or_else(|| {
                DdError::GridInconsistency("master has no global state to collect into".into())
            })?;
            global.lambda = state_local.lambda;
            global.box_ = state_local.box_;
            global.boxv = state_local.boxv;
            global.pcoupl_mu = state_local.pcoupl_mu;
            global.nosehoover_xi = state_local.nosehoover_xi.clone();
        }

        self.collect_vec(
            gcgs,
            &state_local.x,
            state_global.as_deref_mut().map(|s| &mut s.x),
        )?;
        if self.params.integrator.has_velocities() {
            self.collect_vec(
                gcgs,
                &state_local.v,
                state_global.as_deref_mut().map(|s| &mut s.v),
            )?;
        }
        if self.params.integrator.has_sd_state() {
            self.collect_vec(
                gcgs,
                &state_local.sd_x,
                state_global.as_deref_mut().map(|s| &mut s.sd_x),
            )?;
        }
        Ok(())
    }

    /// Push the master's state out: scalars by broadcast, vectors by the
    /// ownership map.
    pub fn distribute_state(
        &mut self,
        gcgs: &CgBlock,
        state_global: Option<&State>,
        state_local: &mut State,
    ) -> Result<()> {
        if let Some(global) = state_global {
            if self.is_master() {
                state_local.lambda = global.lambda;
                state_local.box_ = global.box_;
                state_local.boxv = global.boxv;
                state_local.pcoupl_mu = global.pcoupl_mu;
                state_local.nosehoover_xi = global.nosehoover_xi.clone();
            }
        }

        let mut lambda = [state_local.lambda];
        self.comm.bcast_reals(MASTER_RANK, &mut lambda)?;
        state_local.lambda = lambda[0];
        self.comm.bcast_rvecs(MASTER_RANK, &mut state_local.box_)?;
        self.comm.bcast_rvecs(MASTER_RANK, &mut state_local.boxv)?;
        self.comm
            .bcast_rvecs(MASTER_RANK, &mut state_local.pcoupl_mu)?;

        let mut ngtc = [state_local.nosehoover_xi.len() as i32];
        self.comm.bcast_ints(MASTER_RANK, &mut ngtc)?;
        state_local.nosehoover_xi.resize(ngtc[0] as usize, 0.0);
        self.comm
            .bcast_reals(MASTER_RANK, &mut state_local.nosehoover_xi)?;

        state_local.ensure_capacity(self.nat_home);

        let global_x = state_global.map(|s| &s.x[..]);
        self.distribute_vec(gcgs, global_x, &mut state_local.x)?;
        if self.params.integrator.has_velocities() {
            let global_v = state_global.map(|s| &s.v[..]);
            self.distribute_vec(gcgs, global_v, &mut state_local.v)?;
        }
        if self.params.integrator.has_sd_state() {
            let global_sd = state_global.map(|s| &s.sd_x[..]);
            self.distribute_vec(gcgs, global_sd, &mut state_local.sd_x)?;
        }
        Ok(())
    }
}
