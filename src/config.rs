//! Run configuration.
//!
//! Environment switches are read exactly once at startup into an immutable
//! `DdEnv` value that is threaded into the engine; nothing re-reads the
//! process environment afterwards.

use serde::{Deserialize, Serialize};

use crate::error::{DdError, Result};
use crate::geometry::{dim_char, DIM};

/// User-facing decomposition options.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DdOptions {
    /// Decomposition grid, one entry per dimension, each >= 1.
    pub nc: [usize; DIM],
    /// Number of separate mesh-only ranks; 0 means every rank does both.
    pub npmenodes: usize,
    /// Lower bound on the communicated distance (nm), applied when charge
    /// groups interact across cell borders through bonded terms.
    pub comm_distance_min: f64,
    /// Request dynamic load balancing.
    pub dyn_load_bal: bool,
    /// Static per-cell load weights, whitespace separated, one per cell.
    pub load_x: Option<String>,
    pub load_y: Option<String>,
    pub load_z: Option<String>,
}

impl Default for DdOptions {
    fn default() -> Self {
        DdOptions {
            nc: [1, 1, 1],
            npmenodes: 0,
            comm_distance_min: 0.0,
            dyn_load_bal: false,
            load_x: None,
            load_y: None,
            load_z: None,
        }
    }
}

/// Environment switches, captured once.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct DdEnv {
    /// Iterate decomposition dimensions z -> x instead of x -> z.
    pub order_zyx: bool,
    /// Dump per-rank atom assignments every n steps (0 disables).
    pub nst_dump: i64,
    /// Dump the cell grid wireframe every n steps (0 disables).
    pub nst_dump_grid: i64,
    /// Keep mesh-only ranks in a block after the particle ranks instead of
    /// interleaving them.
    pub order_pp_pme: bool,
}

impl DdEnv {
    pub fn capture() -> Self {
        DdEnv {
            order_zyx: std::env::var_os("GMX_DD_ORDER_ZYX").is_some(),
            nst_dump: nst_env("GMX_DD_DUMP"),
            nst_dump_grid: nst_env("GMX_DD_DUMP_GRID"),
            order_pp_pme: std::env::var_os("GMX_ORDER_PP_PME").is_some(),
        }
    }
}

/// A set variable with an unparsable value still enables the dump, at
/// every step.
fn nst_env(name: &str) -> i64 {
    match std::env::var(name) {
        Ok(val) => val.trim().parse().unwrap_or(1),
        Err(_) => 0,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PbcType {
    None,
    Xyz,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NsType {
    Grid,
    Simple,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConstraintAlg {
    Lincs,
    Shake,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Integrator {
    /// Leap-frog dynamics: positions and velocities.
    Md,
    /// Stochastic dynamics: positions, velocities and the SD memory term.
    Sd,
    /// Energy minimization: positions only.
    Steep,
}

impl Integrator {
    pub fn has_velocities(self) -> bool {
        matches!(self, Integrator::Md | Integrator::Sd)
    }

    pub fn has_sd_state(self) -> bool {
        self == Integrator::Sd
    }
}

/// The slice of simulation parameters the decomposition depends on.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SimParams {
    pub pbc: PbcType,
    pub ns_type: NsType,
    pub constraint_alg: ConstraintAlg,
    pub integrator: Integrator,
    /// Neighbor-list cut-off (nm).
    pub cutoff: f64,
    /// Whether bonded interactions connect different charge groups.
    pub inter_cg_bondeds: bool,
    /// Whether pressure coupling deforms the box during the run.
    pub dynamic_box: bool,
}

impl SimParams {
    /// Reject simulation setups the decomposition cannot handle.
    pub fn validate(&self) -> Result<()> {
        if self.pbc == PbcType::None {
            return Err(DdError::UnsupportedPbc);
        }
        if self.ns_type == NsType::Simple {
            return Err(DdError::UnsupportedNsType);
        }
        if self.constraint_alg == ConstraintAlg::Shake {
            return Err(DdError::UnsupportedConstraintAlg);
        }
        Ok(())
    }
}

/// Parse a static load string into per-cell width weights.
///
/// Exactly one positive value per cell; anything left over after the last
/// cell is rejected rather than silently ignored.
pub fn parse_cell_load(dim: usize, nc: usize, load: Option<&str>) -> Result<Option<Vec<f64>>> {
    let load = match load {
        Some(s) if nc > 1 => s,
        _ => return Ok(None),
    };

    let mut weights = Vec::with_capacity(nc);
    let mut tokens = load.split_whitespace();
    for _ in 0..nc {
        let tok = tokens.next().ok_or_else(|| DdError::StaticLoadParse {
            dim: dim_char(dim),
            reason: format!("expected {} entries, got {}", nc, weights.len()),
        })?;
        let w: f64 = tok.parse().map_err(|_| DdError::StaticLoadParse {
            dim: dim_char(dim),
            reason: format!("'{}' is not a number", tok),
        })?;
        if w <= 0.0 {
            return Err(DdError::StaticLoadParse {
                dim: dim_char(dim),
                reason: format!("load {} is not positive", w),
            });
        }
        weights.push(w);
    }
    if let Some(extra) = tokens.next() {
        return Err(DdError::StaticLoadParse {
            dim: dim_char(dim),
            reason: format!("unexpected trailing entry '{}'", extra),
        });
    }

    tracing::info!(dim = %dim_char(dim), "using static load balancing");
    Ok(Some(weights))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_load_round_trip() {
        let w = parse_cell_load(0, 3, Some("1 2 1")).unwrap().unwrap();
        assert_eq!(w, vec![1.0, 2.0, 1.0]);
    }

    #[test]
    fn cell_load_ignored_for_single_cell() {
        assert!(parse_cell_load(1, 1, Some("1 2 1")).unwrap().is_none());
        assert!(parse_cell_load(1, 4, None).unwrap().is_none());
    }

    #[test]
    fn cell_load_rejects_short_negative_and_trailing() {
        assert!(parse_cell_load(0, 3, Some("1 2")).is_err());
        assert!(parse_cell_load(0, 2, Some("1 -2")).is_err());
        assert!(parse_cell_load(0, 2, Some("1 2 3")).is_err());
        assert!(parse_cell_load(2, 2, Some("1 bad")).is_err());
    }

    #[test]
    fn param_screen() {
        let mut params = SimParams {
            pbc: PbcType::Xyz,
            ns_type: NsType::Grid,
            constraint_alg: ConstraintAlg::Lincs,
            integrator: Integrator::Md,
            cutoff: 1.0,
            inter_cg_bondeds: false,
            dynamic_box: false,
        };
        assert!(params.validate().is_ok());
        params.ns_type = NsType::Simple;
        assert_eq!(params.validate(), Err(DdError::UnsupportedNsType));
        params.ns_type = NsType::Grid;
        params.pbc = PbcType::None;
        assert_eq!(params.validate(), Err(DdError::UnsupportedPbc));
        params.pbc = PbcType::Xyz;
        params.constraint_alg = ConstraintAlg::Shake;
        assert_eq!(params.validate(), Err(DdError::UnsupportedConstraintAlg));
    }
}
