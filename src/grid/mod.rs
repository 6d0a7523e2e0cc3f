//! Rank grid: 3D coordinates, neighbors and communication zones.
//!
//! The flat rank index runs z fastest, `rank = ((cx*ny)+cy)*nz + cz`; this
//! order keeps ranks with equal x consecutive, which minimizes coordinate
//! traffic towards the mesh ranks that decompose along x.

pub mod pme;

use crate::config::DdEnv;
use crate::error::{DdError, Result};
use crate::geometry::DIM;

/// Zone order: home zone first, then the forward neighbors in the order
/// neighbor searching expects them.
const ZONE_CELLS: [[usize; DIM]; 8] = [
    [0, 0, 0],
    [1, 0, 0],
    [1, 1, 0],
    [0, 1, 0],
    [0, 1, 1],
    [0, 0, 1],
    [1, 0, 1],
    [1, 1, 1],
];

// i-zone -> j-zone ranges per decomposition dimensionality. Zone pair (i, j)
// is searched once; the half-shell construction keeps the lists disjoint.
const ZONE_PAIRS_3D: [[usize; 3]; 4] = [[0, 0, 8], [1, 3, 6], [2, 5, 6], [3, 5, 7]];
const ZONE_PAIRS_2D: [[usize; 3]; 2] = [[0, 0, 4], [1, 3, 4]];
const ZONE_PAIRS_1D: [[usize; 3]; 1] = [[0, 0, 2]];

/// Flat rank index of grid coordinates.
#[inline]
pub fn rank_of(nc: &[usize; DIM], ci: &[usize; DIM]) -> usize {
    (ci[0] * nc[1] + ci[1]) * nc[2] + ci[2]
}

/// Grid coordinates of a flat rank index.
#[inline]
pub fn xyz_of(nc: &[usize; DIM], rank: usize) -> [usize; DIM] {
    [
        rank / (nc[1] * nc[2]),
        (rank / nc[2]) % nc[1],
        rank % nc[2],
    ]
}

/// One i-zone: the j-zones it is paired with and its charge-group ranges,
/// the latter filled in after every partitioning.
#[derive(Clone, Copy, Debug, Default)]
pub struct IZone {
    pub j0: usize,
    pub j1: usize,
    pub cg1: usize,
    pub jcg0: usize,
    pub jcg1: usize,
    pub shift0: [i32; DIM],
    pub shift1: [i32; DIM],
}

#[derive(Clone, Debug)]
pub struct DdGrid {
    pub nc: [usize; DIM],
    pub nnodes: usize,
    /// Number of decomposed dimensions.
    pub ndim: usize,
    /// Decomposed dimensions in communication order; first `ndim` valid.
    pub dims: [usize; DIM],
    /// This rank's grid coordinates.
    pub ci: [usize; DIM],
    pub rank: usize,
    /// Per decomposed dimension: [forward, backward] neighbor ranks.
    pub neighbor: [[usize; 2]; DIM],
    /// Number of zones (2^ndim).
    pub ncell: usize,
    /// Per-zone grid shift relative to the home cell.
    pub shift: [[usize; DIM]; 8],
    pub nizone: usize,
    pub izone: [IZone; 4],
}

impl DdGrid {
    /// Build the grid view for `rank`. The communication order is x..z, or
    /// z..x when the environment asks for it.
    pub fn new(nc: [usize; DIM], rank: usize, env: &DdEnv) -> Result<Self> {
        let nnodes = nc[0] * nc[1] * nc[2];
        let ci = xyz_of(&nc, rank);

        let dim_order: Vec<usize> = if env.order_zyx {
            (0..DIM).rev().collect()
        } else {
            (0..DIM).collect()
        };
        if env.order_zyx {
            tracing::info!("using domain decomposition order z, y, x");
        }

        let mut dims = [0; DIM];
        let mut neighbor = [[0; 2]; DIM];
        let mut ndim = 0;
        for &d in &dim_order {
            if nc[d] > 1 {
                dims[ndim] = d;
                let mut tmp = ci;
                tmp[d] = (ci[d] + 1) % nc[d];
                neighbor[ndim][0] = rank_of(&nc, &tmp);
                tmp[d] = (ci[d] + nc[d] - 1) % nc[d];
                neighbor[ndim][1] = rank_of(&nc, &tmp);
                ndim += 1;
            }
        }

        let (ncell, pairs): (usize, &[[usize; 3]]) = match ndim {
            3 => (8, &ZONE_PAIRS_3D),
            2 => (4, &ZONE_PAIRS_2D),
            1 => (2, &ZONE_PAIRS_1D),
            _ => {
                return Err(DdError::GridInconsistency(format!(
                    "can only decompose 1, 2 or 3 dimensions, grid is {:?}",
                    nc
                )))
            }
        };

        // Map each zone's abstract shift onto the actual decomposed dims.
        let mut shift = [[0usize; DIM]; 8];
        for (i, zone) in shift.iter_mut().enumerate().take(ncell) {
            let mut m = 0;
            for &d in &dim_order {
                if nc[d] > 1 {
                    zone[d] = ZONE_CELLS[i][m];
                    m += 1;
                }
            }
        }

        let mut izone = [IZone::default(); 4];
        for (i, iz) in izone.iter_mut().enumerate().take(pairs.len()) {
            if pairs[i][0] != i {
                return Err(DdError::GridInconsistency(
                    "zone pair table out of order".into(),
                ));
            }
            iz.j0 = pairs[i][1];
            iz.j1 = pairs[i][2];
            for d in 0..DIM {
                if nc[d] == 1 {
                    // All periodic images are in play along this dimension
                    iz.shift0[d] = -1;
                    iz.shift1[d] = 1;
                } else {
                    // Shifts between paired zones are at most one cell
                    iz.shift0[d] = 1;
                    iz.shift1[d] = -1;
                    for j in iz.j0..iz.j1 {
                        let diff = shift[j][d] as i32 - shift[i][d] as i32;
                        iz.shift0[d] = iz.shift0[d].min(diff);
                        iz.shift1[d] = iz.shift1[d].max(diff);
                    }
                }
            }
        }

        Ok(DdGrid {
            nc,
            nnodes,
            ndim,
            dims,
            ci,
            rank,
            neighbor,
            ncell,
            shift,
            nizone: pairs.len(),
            izone,
        })
    }

    /// The decomposed dimensions in communication order.
    #[inline]
    pub fn dd_dims(&self) -> &[usize] {
        &self.dims[..self.ndim]
    }

    /// Ranks forming the load-balancing row along `dim_ind`, keeping the
    /// other coordinates fixed at `fixed`; the row root comes first.
    pub fn row_ranks(&self, dim_ind: usize, fixed: &[usize; DIM]) -> Vec<usize> {
        let dim = self.dims[dim_ind];
        let mut loc = *fixed;
        (0..self.nc[dim])
            .map(|i| {
                loc[dim] = i;
                rank_of(&self.nc, &loc)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank_index_round_trip() {
        let nc = [3, 2, 4];
        for rank in 0..24 {
            assert_eq!(rank_of(&nc, &xyz_of(&nc, rank)), rank);
        }
        assert_eq!(rank_of(&nc, &[1, 1, 2]), (1 * 2 + 1) * 4 + 2);
    }

    #[test]
    fn neighbors_wrap_periodically() {
        let grid = DdGrid::new([3, 1, 1], 2, &DdEnv::default()).unwrap();
        assert_eq!(grid.ndim, 1);
        assert_eq!(grid.dims[0], 0);
        assert_eq!(grid.neighbor[0], [0, 1]);

        let grid = DdGrid::new([2, 2, 1], 0, &DdEnv::default()).unwrap();
        assert_eq!(grid.ndim, 2);
        // forward in x from (0,0) is rank (1,0) = 2; backward wraps to same
        assert_eq!(grid.neighbor[0], [2, 2]);
        assert_eq!(grid.neighbor[1], [1, 1]);
    }

    #[test]
    fn zone_counts_match_dimensionality() {
        let g1 = DdGrid::new([4, 1, 1], 0, &DdEnv::default()).unwrap();
        assert_eq!((g1.ncell, g1.nizone), (2, 1));
        let g2 = DdGrid::new([2, 1, 2], 0, &DdEnv::default()).unwrap();
        assert_eq!((g2.ncell, g2.nizone), (4, 2));
        let g3 = DdGrid::new([2, 2, 2], 0, &DdEnv::default()).unwrap();
        assert_eq!((g3.ncell, g3.nizone), (8, 4));
    }

    #[test]
    fn zone_shifts_follow_decomposed_dims() {
        // 2D in x and z: zone 1 shifts x, zone 3 shifts z only
        let g = DdGrid::new([2, 1, 2], 0, &DdEnv::default()).unwrap();
        assert_eq!(g.shift[1], [1, 0, 0]);
        assert_eq!(g.shift[2], [1, 0, 1]);
        assert_eq!(g.shift[3], [0, 0, 1]);
    }

    #[test]
    fn row_ranks_run_along_dimension() {
        let g = DdGrid::new([2, 3, 1], 3, &DdEnv::default()).unwrap();
        // dim_ind 1 is y; fixing x=1 gives ranks (1,0),(1,1),(1,2)
        assert_eq!(g.row_ranks(1, &[1, 0, 0]), vec![3, 4, 5]);
    }
}
