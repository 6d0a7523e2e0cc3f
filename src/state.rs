//! System state and the charge-group block.
//!
//! A charge group is a contiguous run of atoms treated as one spatial unit.
//! The block stores one prefix sum over group sizes, so group `i` owns atoms
//! `index[i]..index[i+1]`; there is no per-group allocation anywhere.

use serde::{Deserialize, Serialize};

use crate::config::Integrator;
use crate::geometry::{Matrix, Rvec, DIM};

/// Growth headroom for buffers that are resized on demand, so repeated small
/// overflows do not reallocate every step.
#[inline]
pub fn over_alloc(n: usize) -> usize {
    n + n / 5 + 100
}

/// Immutable global charge-group division: prefix sum of group sizes.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CgBlock {
    pub index: Vec<usize>,
}

impl CgBlock {
    pub fn from_sizes(sizes: &[usize]) -> Self {
        let mut index = Vec::with_capacity(sizes.len() + 1);
        index.push(0);
        let mut at = 0;
        for &s in sizes {
            at += s;
            index.push(at);
        }
        CgBlock { index }
    }

    /// One single-atom group per atom.
    pub fn single_atoms(natoms: usize) -> Self {
        CgBlock {
            index: (0..=natoms).collect(),
        }
    }

    #[inline]
    pub fn ncg(&self) -> usize {
        self.index.len() - 1
    }

    #[inline]
    pub fn natoms(&self) -> usize {
        *self.index.last().unwrap_or(&0)
    }

    #[inline]
    pub fn size(&self, cg: usize) -> usize {
        self.index[cg + 1] - self.index[cg]
    }

    #[inline]
    pub fn atoms(&self, cg: usize) -> std::ops::Range<usize> {
        self.index[cg]..self.index[cg + 1]
    }
}

/// Coordinates plus the scalar thermodynamic state that rides along with
/// them through every gather, scatter and redistribution. Which dynamic
/// vectors exist is a property of the integrator, not of the current
/// lengths, so an empty rank still agrees with its neighbors on the wire
/// layout.
#[derive(Clone, Debug)]
pub struct State {
    pub integrator: Integrator,
    pub lambda: f64,
    pub box_: Matrix,
    pub boxv: Matrix,
    pub pcoupl_mu: Matrix,
    pub nosehoover_xi: Vec<f64>,
    pub x: Vec<Rvec>,
    /// Velocities, when the integrator carries them.
    pub v: Vec<Rvec>,
    /// Stochastic-dynamics memory, when the integrator carries it.
    pub sd_x: Vec<Rvec>,
}

impl State {
    pub fn new(box_: Matrix, x: Vec<Rvec>, integrator: Integrator) -> Self {
        let n = x.len();
        State {
            integrator,
            lambda: 0.0,
            box_,
            boxv: [[0.0; DIM]; DIM],
            pcoupl_mu: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            nosehoover_xi: Vec::new(),
            x,
            v: if integrator.has_velocities() {
                vec![[0.0; DIM]; n]
            } else {
                Vec::new()
            },
            sd_x: if integrator.has_sd_state() {
                vec![[0.0; DIM]; n]
            } else {
                Vec::new()
            },
        }
    }

    /// Grow every carried vector to hold at least `n` atoms.
    pub fn ensure_capacity(&mut self, n: usize) {
        if self.x.len() < n {
            let cap = over_alloc(n);
            self.x.resize(cap, [0.0; DIM]);
            if self.integrator.has_velocities() {
                self.v.resize(cap, [0.0; DIM]);
            }
            if self.integrator.has_sd_state() {
                self.sd_x.resize(cap, [0.0; DIM]);
            }
        }
    }
}

/// Reverse lookup for one global atom; `cell == -1` means not resident.
#[derive(Clone, Copy, Debug)]
pub struct Ga2La {
    pub cell: i32,
    pub a: usize,
}

impl Default for Ga2La {
    fn default() -> Self {
        Ga2La { cell: -1, a: 0 }
    }
}

/// Center of geometry of one contiguous atom run.
#[inline]
pub fn center_of_geometry(x: &[Rvec]) -> Rvec {
    if x.len() == 1 {
        return x[0];
    }
    let inv = 1.0 / x.len() as f64;
    let mut cm = [0.0; DIM];
    for xi in x {
        for d in 0..DIM {
            cm[d] += xi[d];
        }
    }
    [cm[0] * inv, cm[1] * inv, cm[2] * inv]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_prefix_sums() {
        let cgs = CgBlock::from_sizes(&[3, 1, 2]);
        assert_eq!(cgs.ncg(), 3);
        assert_eq!(cgs.natoms(), 6);
        assert_eq!(cgs.size(1), 1);
        assert_eq!(cgs.atoms(2), 4..6);
    }

    #[test]
    fn cog_of_run() {
        let x = [[0.0, 0.0, 0.0], [2.0, 4.0, 6.0]];
        assert_eq!(center_of_geometry(&x), [1.0, 2.0, 3.0]);
    }

    #[test]
    fn over_alloc_grows() {
        assert!(over_alloc(1000) >= 1200);
        assert!(over_alloc(0) > 0);
    }
}
