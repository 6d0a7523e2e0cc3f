//! Diagnostic dumps of the decomposition geometry and atom assignments.
//!
//! Both writers emit the classic line-oriented ATOM record format so any
//! structure viewer can display a step: the grid file draws every rank's
//! cell as eight corner pseudo-atoms wired up with CONECT records, the atom
//! file tags each local atom's zone in the B-factor column. Coordinates go
//! out in Angstrom.

use std::fs::File;
use std::io::{BufWriter, Write};

use crate::comm::Communicator;
use crate::dd::{DomDec, MASTER_RANK};
use crate::error::Result;
use crate::geometry::{iprod, mvmul, norm2, Matrix, Rvec, DIM};

fn write_pdb_box(out: &mut impl Write, box_: &Matrix) -> std::io::Result<()> {
    let len = |v: Rvec| norm2(v).sqrt();
    let angle = |u: Rvec, v: Rvec| -> f64 {
        let denom = len(u) * len(v);
        if denom == 0.0 {
            90.0
        } else {
            (iprod(u, v) / denom).acos().to_degrees()
        }
    };
    writeln!(
        out,
        "CRYST1{:9.3}{:9.3}{:9.3}{:7.2}{:7.2}{:7.2} P 1           1",
        10.0 * len(box_[0]),
        10.0 * len(box_[1]),
        10.0 * len(box_[2]),
        angle(box_[1], box_[2]),
        angle(box_[0], box_[2]),
        angle(box_[0], box_[1]),
    )
}

#[allow(clippy::too_many_arguments)]
fn write_atom_line(
    out: &mut impl Write,
    serial: usize,
    name: &str,
    resname: &str,
    resid: usize,
    x: Rvec,
    occupancy: f64,
    bfactor: f64,
) -> std::io::Result<()> {
    writeln!(
        out,
        "ATOM  {:>5}  {:<4}{:>3}  {:>4}    {:8.3}{:8.3}{:8.3}{:6.2}{:6.2}",
        serial,
        name,
        resname,
        resid,
        10.0 * x[0],
        10.0 * x[1],
        10.0 * x[2],
        occupancy,
        bfactor,
    )
}

impl<C: Communicator> DomDec<C> {
    /// Collect every rank's cell corners on the master and write one grid
    /// wireframe file for this step.
    pub fn write_grid_dump(&mut self, prefix: &str, step: i64, box_: &Matrix) -> Result<()> {
        let corners = [self.cell_x0, self.cell_x1];
        let gathered = self.comm.gather_rvecs(MASTER_RANK, &corners)?;
        let grid_r = match gathered {
            Some(g) => g,
            None => return Ok(()),
        };

        // Cells are axis-aligned in lattice coordinates; shear the corners
        // back into real space for display.
        let mut tric = [[0.0; DIM]; DIM];
        for d in 0..DIM {
            for i in 0..DIM {
                if d == i {
                    tric[d][i] = 1.0;
                } else if self.grid.nc[d] > 1 {
                    tric[d][i] = box_[i][d] / box_[i][i];
                }
            }
        }

        let fname = format!("{}_{}.pdb", prefix, step);
        let mut out = BufWriter::new(File::create(&fname)?);
        write_pdb_box(&mut out, box_)?;

        let box_vol = box_[0][0] * box_[1][1] * box_[2][2];
        let mut serial = 1;
        for i in 0..self.grid.nnodes {
            let lo = grid_r[i * 2];
            let hi = grid_r[i * 2 + 1];
            let mut vol = self.grid.nnodes as f64 / box_vol;
            for d in 0..DIM {
                vol *= hi[d] - lo[d];
            }
            for z in 0..2 {
                for y in 0..2 {
                    for x in 0..2 {
                        let cx = [grid_r[i * 2 + x][0], grid_r[i * 2 + y][1], grid_r[i * 2 + z][2]];
                        let r = mvmul(&tric, cx);
                        write_atom_line(&mut out, serial, "CA", "GLY", 1 + i, r, 1.0, vol)?;
                        serial += 1;
                    }
                }
            }
            // Wire the 8 corners into a box along each axis
            for d in 0..DIM {
                for x in 0..4 {
                    let a = match d {
                        0 => 1 + i * 8 + 2 * x,
                        1 => 1 + i * 8 + 2 * x - (x % 2),
                        _ => 1 + i * 8 + x,
                    };
                    writeln!(out, "{:>6}{:>5}{:>5}", "CONECT", a, a + (1 << d))?;
                }
            }
        }
        Ok(())
    }

    /// Write this rank's atoms with their zone in the B-factor column:
    /// home and halo zones carry the zone index, construction-only atoms
    /// the two values past the last zone.
    pub fn write_atom_dump(
        &self,
        prefix: &str,
        step: i64,
        title: &str,
        x: &[Rvec],
        box_: &Matrix,
    ) -> Result<()> {
        let fname = format!("{}_{}_n{}.pdb", prefix, step, self.comm.rank());
        let mut out = BufWriter::new(File::create(&fname)?);

        writeln!(out, "TITLE     {}", title)?;
        write_pdb_box(&mut out, box_)?;

        for i in 0..self.nat_tot_con {
            let a_gl = self.gatindex[i];
            let b = if i < self.nat_tot {
                let mut zone = 0;
                while i >= self.cgindex[self.ncg_cell[zone + 1]] {
                    zone += 1;
                }
                zone as f64
            } else if i < self.nat_tot_vsite {
                self.grid.ncell as f64
            } else {
                (self.grid.ncell + 1) as f64
            };
            write_atom_line(
                &mut out,
                (a_gl + 1) % 100_000,
                "CA",
                "GLY",
                (a_gl + 1) % 10_000,
                x[i],
                1.0,
                b,
            )?;
        }
        writeln!(out, "TER")?;
        Ok(())
    }
}
