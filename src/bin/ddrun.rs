//! Run a synthetic particle system through the decomposition engine with
//! the in-process cluster: every rank of the grid becomes one thread.
//!
//! Usage: ddrun <config.json>
//!
//! The config carries the decomposition options plus the synthetic system:
//!
//! ```json
//! {
//!   "options": { "nc": [2, 2, 1], "npmenodes": 0, "comm_distance_min": 0.0,
//!                "dyn_load_bal": false,
//!                "load_x": null, "load_y": null, "load_z": null },
//!   "box_len": 10.0,
//!   "cutoff": 1.5,
//!   "natoms": 1000,
//!   "steps": 50
//! }
//! ```
//!
//! Exits 0 on success, 1 on any fatal decomposition error.

use serde::Deserialize;

use domdec::balance::DdCycle;
use domdec::comm::Communicator;
use domdec::config::{ConstraintAlg, Integrator, NsType, PbcType};
use domdec::geometry::Rvec;
use domdec::{
    setup_logging, CgBlock, ClusterLayout, DdEnv, DdOptions, DomDec, LocalCluster, SimParams,
    State, MASTER_RANK,
};

#[derive(Deserialize)]
struct RunConfig {
    options: DdOptions,
    box_len: f64,
    cutoff: f64,
    natoms: usize,
    steps: i64,
}

fn main() {
    setup_logging(None);

    let path = match std::env::args().nth(1) {
        Some(p) => p,
        None => {
            eprintln!("usage: ddrun <config.json>");
            std::process::exit(2);
        }
    };
    let cfg: RunConfig = match std::fs::File::open(&path)
        .map_err(|e| e.to_string())
        .and_then(|f| serde_json::from_reader(f).map_err(|e| e.to_string()))
    {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("ddrun: cannot read {}: {}", path, e);
            std::process::exit(2);
        }
    };

    let env = DdEnv::capture();
    let nnodes = cfg.options.nc.iter().product::<usize>() + cfg.options.npmenodes;
    let layout = match ClusterLayout::new(cfg.options.nc, cfg.options.npmenodes, nnodes, false, &env)
    {
        Ok(layout) => layout,
        Err(e) => {
            eprintln!("ddrun: {}", e);
            std::process::exit(1);
        }
    };
    tracing::info!(
        pp_ranks = ?layout.pp_ranks(),
        pme = cfg.options.npmenodes,
        "cluster layout"
    );

    let params = SimParams {
        pbc: PbcType::Xyz,
        ns_type: NsType::Grid,
        constraint_alg: ConstraintAlg::Lincs,
        integrator: Integrator::Md,
        cutoff: cfg.cutoff,
        inter_cg_bondeds: false,
        dynamic_box: false,
    };

    // Single-atom charge groups on a jittered lattice fill the box.
    let gcgs = CgBlock::single_atoms(cfg.natoms);
    let box_len = cfg.box_len;
    let side = (cfg.natoms as f64).cbrt().ceil() as usize;
    let x0: Vec<Rvec> = (0..cfg.natoms)
        .map(|i| {
            let (ix, iy, iz) = (i % side, (i / side) % side, i / (side * side));
            let h = box_len / side as f64;
            [
                (ix as f64 + 0.5) * h,
                (iy as f64 + 0.5) * h,
                (iz as f64 + 0.5) * h,
            ]
        })
        .collect();
    let box_ = [
        [box_len, 0.0, 0.0],
        [0.0, box_len, 0.0],
        [0.0, 0.0, box_len],
    ];

    let n_pp = layout.pp_ranks().len();
    let results = LocalCluster::run(n_pp, |comm| {
        let rank = comm.rank();
        let mut dd = DomDec::new(&cfg.options, env, params, comm)?;

        let mut global = State::new(box_, x0.clone(), params.integrator);
        let mut local = State::new(box_, Vec::new(), params.integrator);

        dd.partition_system(
            0,
            true,
            &gcgs,
            (rank == MASTER_RANK).then_some(&mut global),
            &mut local,
            false,
        )?;

        for step in 1..=cfg.steps {
            // Drift everything along a slow helix so groups cross borders.
            let phase = step as f64 * 0.02;
            for i in 0..dd.nat_home {
                local.x[i][0] += 0.01 * (phase + local.x[i][1]).sin();
                local.x[i][1] += 0.01 * (phase + local.x[i][2]).cos();
                local.x[i][2] += 0.005;
            }
            dd.partition_system(step, false, &gcgs, None, &mut local, false)?;
            dd.move_x(&box_, &mut local.x)?;
            // Synthetic load figures so the balancer has input.
            dd.cycl.add(DdCycle::F, 1.0e6 * (1.0 + rank as f64 * 0.1));
            dd.cycl.add(DdCycle::MoveX, 1.0e4);
            dd.cycl.add(DdCycle::MoveF, 1.0e4);
        }

        dd.collect_state(&gcgs, &local, (rank == MASTER_RANK).then_some(&mut global))?;
        Ok::<usize, domdec::DdError>(dd.nat_home)
    });

    let mut total = 0;
    for (rank, res) in results.into_iter().enumerate() {
        match res {
            Ok(nat_home) => {
                tracing::info!(rank, nat_home, "rank finished");
                total += nat_home;
            }
            Err(e) => {
                eprintln!("ddrun: rank {}: {}", rank, e);
                std::process::exit(1);
            }
        }
    }
    assert_eq!(total, cfg.natoms, "atoms lost in the decomposition");
    tracing::info!(natoms = total, steps = cfg.steps, "run complete");
}
