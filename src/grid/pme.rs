//! Mesh-rank layout: how the long-range mesh ranks sit between the
//! particle-particle ranks and which slab each one serves.
//!
//! Only the rank-layout contract lives here; the mesh computation itself is
//! somebody else's job. The decomposition needs just enough to route each
//! particle rank's coordinates to its mesh peer and to pick the single rank
//! that returns virial and energy.

use serde::{Deserialize, Serialize};

use crate::config::DdEnv;
use crate::error::{DdError, Result};
use crate::geometry::{DIM, YY, ZZ};

use super::{rank_of, xyz_of};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Duty {
    PpOnly,
    PmeOnly,
    Both,
}

/// Placement of particle and mesh ranks inside the whole cluster.
#[derive(Clone, Debug)]
pub struct ClusterLayout {
    /// Total ranks, mesh ranks included.
    pub nnodes: usize,
    pub npmenodes: usize,
    /// Particle-rank grid.
    pub nc: [usize; DIM],
    /// Grid extended along `pmedim` when the layout is Cartesian.
    pub ntot: [usize; DIM],
    pub cartesian: bool,
    pub pmedim: usize,
    /// World ranks of the mesh ranks when they are interleaved.
    pub pmenodes: Option<Vec<usize>>,
}

impl ClusterLayout {
    pub fn new(
        nc: [usize; DIM],
        npmenodes: usize,
        nnodes: usize,
        request_cartesian: bool,
        env: &DdEnv,
    ) -> Result<Self> {
        let pp_nnodes = nc[0] * nc[1] * nc[2];
        if pp_nnodes + npmenodes != nnodes {
            return Err(DdError::GridMismatch {
                grid: pp_nnodes,
                ranks: nnodes.saturating_sub(npmenodes),
            });
        }
        // The interleave construction places at most one mesh rank behind
        // each particle rank.
        if npmenodes > pp_nnodes {
            return Err(DdError::GridMismatch {
                grid: pp_nnodes,
                ranks: npmenodes,
            });
        }

        let mut ntot = nc;
        let mut cartesian = request_cartesian;
        let mut pmedim = ZZ;
        if cartesian && npmenodes > 0 {
            let div_y = (npmenodes * nc[YY]) % pp_nnodes == 0;
            let div_z = (npmenodes * nc[ZZ]) % pp_nnodes == 0;
            if div_y || div_z {
                // The thinnest slab of mesh-only ranks disturbs the
                // particle communication the least.
                pmedim = if div_y && (!div_z || nc[YY] <= nc[ZZ]) {
                    YY
                } else {
                    ZZ
                };
                ntot[pmedim] += npmenodes * nc[pmedim] / pp_nnodes;
            } else {
                cartesian = false;
            }
        }

        let pmenodes = if !cartesian && npmenodes > 0 && !env.order_pp_pme {
            Some(interleave(pp_nnodes, npmenodes))
        } else {
            None
        };

        if cartesian {
            tracing::info!(
                "will use a Cartesian communicator: {} x {} x {}",
                ntot[0],
                ntot[1],
                ntot[2]
            );
        } else {
            tracing::info!("will not use a Cartesian communicator");
        }

        Ok(ClusterLayout {
            nnodes,
            npmenodes,
            nc,
            ntot,
            cartesian,
            pmedim,
            pmenodes,
        })
    }

    fn pp_nnodes(&self) -> usize {
        self.nc[0] * self.nc[1] * self.nc[2]
    }

    pub fn duty(&self, rank: usize) -> Duty {
        if self.npmenodes == 0 {
            return Duty::Both;
        }
        if self.cartesian {
            let coords = xyz_of(&self.ntot, rank);
            if coords[self.pmedim] < self.nc[self.pmedim] {
                Duty::PpOnly
            } else {
                Duty::PmeOnly
            }
        } else if self.pme_rank_for(rank).is_some() {
            Duty::PpOnly
        } else {
            Duty::PmeOnly
        }
    }

    pub fn is_pme_only(&self, rank: usize) -> bool {
        self.duty(rank) == Duty::PmeOnly
    }

    /// Grid coordinates of the mesh rank serving the particle rank at
    /// `coords` in the extended Cartesian grid.
    fn coords_to_pme_coords(&self, coords: [usize; DIM]) -> [usize; DIM] {
        let nc = self.nc[self.pmedim];
        let ntot = self.ntot[self.pmedim];
        let mut pme = coords;
        pme[self.pmedim] = nc + (coords[self.pmedim] * (ntot - nc) + (ntot - nc) / 2) / nc;
        pme
    }

    /// The mesh rank a particle rank sends to; `None` for mesh-only ranks.
    pub fn pme_rank_for(&self, rank: usize) -> Option<usize> {
        if self.npmenodes == 0 {
            return None;
        }
        if self.cartesian {
            let coords = xyz_of(&self.ntot, rank);
            if coords[self.pmedim] < self.nc[self.pmedim] {
                Some(rank_of(&self.ntot, &self.coords_to_pme_coords(coords)))
            } else {
                None
            }
        } else {
            match &self.pmenodes {
                None => {
                    let pp = self.pp_nnodes();
                    if rank < pp {
                        Some(pp + (rank * self.npmenodes + self.npmenodes / 2) / pp)
                    } else {
                        None
                    }
                }
                Some(pmenodes) => {
                    let mut i = 0;
                    while i < pmenodes.len() && rank > pmenodes[i] {
                        i += 1;
                    }
                    if i < pmenodes.len() && rank < pmenodes[i] {
                        Some(pmenodes[i])
                    } else {
                        None
                    }
                }
            }
        }
    }

    /// Mesh slab index for a decomposition cell index.
    pub fn ddindex_to_pme_slab(&self, ddindex: usize) -> usize {
        if self.cartesian {
            let coords = xyz_of(&self.nc, ddindex);
            let mut pme = self.coords_to_pme_coords(coords);
            let mut n = self.ntot;
            n[self.pmedim] -= self.nc[self.pmedim];
            pme[self.pmedim] -= self.nc[self.pmedim];
            (pme[0] * n[1] + pme[1]) * n[2] + pme[2]
        } else {
            (ddindex * self.npmenodes + self.npmenodes / 2) / self.pp_nnodes()
        }
    }

    /// World rank of a decomposition cell index.
    pub fn ddindex_to_rank(&self, ddindex: usize) -> usize {
        if self.cartesian {
            let coords = xyz_of(&self.nc, ddindex);
            rank_of(&self.ntot, &coords)
        } else if self.pmenodes.is_some() {
            // Interleaved mesh ranks shift every particle rank up by the
            // number of mesh ranks placed before it.
            ddindex + self.ddindex_to_pme_slab(ddindex)
        } else {
            ddindex
        }
    }

    /// World ranks of the particle ranks in decomposition-index order.
    pub fn pp_ranks(&self) -> Vec<usize> {
        (0..self.pp_nnodes())
            .map(|i| self.ddindex_to_rank(i))
            .collect()
    }

    /// True iff `rank` is the last particle rank feeding its mesh rank, and
    /// therefore the one that receives the virial and energy back.
    pub fn receive_vir_ener(&self, rank: usize) -> bool {
        if self.npmenodes == 0 || self.npmenodes >= self.pp_nnodes() {
            return true;
        }
        let pmenode = self.pme_rank_for(rank);
        if self.cartesian {
            let mut coords = xyz_of(&self.ntot, rank);
            coords[self.pmedim] += 1;
            if coords[self.pmedim] < self.nc[self.pmedim] {
                let next = rank_of(&self.ntot, &coords);
                if self.pme_rank_for(next) == pmenode {
                    return false;
                }
            }
        } else if rank + 1 < self.nnodes && self.pme_rank_for(rank + 1) == pmenode {
            return false;
        }
        true
    }
}

/// Interleave positions: one mesh rank behind each run of particle ranks it
/// serves, so `pmenodes[n] = i + 1 + n` for each particle index `i` where
/// the slab boundary advances.
fn interleave(pp_nnodes: usize, npmenodes: usize) -> Vec<usize> {
    let mut pmenodes = Vec::with_capacity(npmenodes);
    let mut n = 0;
    for i in 0..pp_nnodes {
        let p0 = (i * npmenodes + npmenodes / 2) / pp_nnodes;
        let p1 = ((i + 1) * npmenodes + npmenodes / 2) / pp_nnodes;
        if i + 1 == pp_nnodes || p1 > p0 {
            tracing::debug!("pmenode[{}] = {}", n, i + 1 + n);
            pmenodes.push(i + 1 + n);
            n += 1;
        }
    }
    pmenodes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout(nc: [usize; 3], npme: usize) -> ClusterLayout {
        let pp = nc[0] * nc[1] * nc[2];
        ClusterLayout::new(nc, npme, pp + npme, false, &DdEnv::default()).unwrap()
    }

    #[test]
    fn grid_must_match_rank_count() {
        let err = ClusterLayout::new([2, 2, 1], 1, 4, false, &DdEnv::default()).unwrap_err();
        assert!(matches!(err, DdError::GridMismatch { grid: 4, ranks: 3 }));
        // More mesh ranks than particle ranks is rejected outright
        assert!(ClusterLayout::new([2, 1, 1], 3, 5, false, &DdEnv::default()).is_err());
    }

    #[test]
    fn no_pme_means_every_rank_does_both() {
        let l = layout([2, 2, 1], 0);
        assert_eq!(l.duty(0), Duty::Both);
        assert_eq!(l.pme_rank_for(3), None);
        assert_eq!(l.pp_ranks(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn interleaved_mesh_ranks_sit_between_their_clients() {
        // 4 particle ranks, 2 mesh ranks: world order pp pp pme pp pp pme
        let l = layout([4, 1, 1], 2);
        assert_eq!(l.pmenodes.as_deref(), Some(&[2, 5][..]));
        assert_eq!(l.pp_ranks(), vec![0, 1, 3, 4]);
        assert_eq!(l.duty(2), Duty::PmeOnly);
        assert_eq!(l.duty(1), Duty::PpOnly);
        assert_eq!(l.pme_rank_for(0), Some(2));
        assert_eq!(l.pme_rank_for(1), Some(2));
        assert_eq!(l.pme_rank_for(3), Some(5));
        assert_eq!(l.pme_rank_for(2), None);
        // Only the last client of each mesh rank collects virial/energy
        assert!(!l.receive_vir_ener(0));
        assert!(l.receive_vir_ener(1));
        assert!(l.receive_vir_ener(4));
    }

    #[test]
    fn blocked_layout_when_interleave_is_suppressed() {
        let env = DdEnv {
            order_pp_pme: true,
            ..DdEnv::default()
        };
        let l = ClusterLayout::new([4, 1, 1], 2, 6, false, &env).unwrap();
        assert!(l.pmenodes.is_none());
        assert_eq!(l.pp_ranks(), vec![0, 1, 2, 3]);
        assert_eq!(l.pme_rank_for(0), Some(4));
        assert_eq!(l.pme_rank_for(2), Some(5));
        assert_eq!(l.ddindex_to_pme_slab(3), 1);
    }

    #[test]
    fn cartesian_layout_extends_the_thinnest_dimension() {
        // 2x2x2 particle grid with 4 mesh ranks divides along y
        let l = ClusterLayout::new([2, 2, 2], 4, 12, true, &DdEnv::default()).unwrap();
        assert!(l.cartesian);
        assert_eq!(l.pmedim, YY);
        assert_eq!(l.ntot, [2, 3, 2]);
        // coords with y < 2 are particle ranks
        assert_eq!(l.duty(rank_of(&l.ntot, &[0, 0, 0])), Duty::PpOnly);
        assert_eq!(l.duty(rank_of(&l.ntot, &[0, 2, 0])), Duty::PmeOnly);
        let pme = l.pme_rank_for(rank_of(&l.ntot, &[1, 1, 1])).unwrap();
        assert_eq!(xyz_of(&l.ntot, pme)[YY], 2);
    }
}
