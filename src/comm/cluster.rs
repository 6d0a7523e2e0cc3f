//! MPI-backed cluster transport (`--features mpi`).
//!
//! Thin mapping of the [`Communicator`](super::Communicator) contract onto
//! rsmpi. Vectors of 3-vectors travel as flat `f64` buffers so no custom MPI
//! datatypes are needed.

use mpi::collective::Root;
use mpi::point_to_point as p2p;
use mpi::topology::{Color, UserCommunicator};
use mpi::traits::{Communicator as _, Destination, Source};

use crate::error::{DdError, Result};
use crate::geometry::{Rvec, DIM};

use super::Communicator;

pub struct ClusterComm {
    comm: UserCommunicator,
}

impl ClusterComm {
    /// Initialize MPI and wrap the world communicator. The returned universe
    /// must stay alive for the duration of the run.
    pub fn init() -> Result<(mpi::environment::Universe, ClusterComm)> {
        let universe = mpi::initialize()
            .ok_or_else(|| DdError::Transport("MPI initialization failed".into()))?;
        let comm = universe.world().duplicate();
        Ok((universe, ClusterComm { comm }))
    }

    fn flatten(buf: &[Rvec]) -> Vec<f64> {
        let mut flat = Vec::with_capacity(buf.len() * DIM);
        for v in buf {
            flat.extend_from_slice(v);
        }
        flat
    }

    fn unflatten(flat: &[f64]) -> Vec<Rvec> {
        flat.chunks_exact(DIM)
            .map(|c| [c[0], c[1], c[2]])
            .collect()
    }
}

impl Communicator for ClusterComm {
    fn rank(&self) -> usize {
        self.comm.rank() as usize
    }

    fn size(&self) -> usize {
        self.comm.size() as usize
    }

    fn send_rvecs(&self, to: usize, buf: &[Rvec]) -> Result<()> {
        let flat = Self::flatten(buf);
        self.comm.process_at_rank(to as i32).send(&flat[..]);
        Ok(())
    }

    fn recv_rvecs(&self, from: usize, n: usize) -> Result<Vec<Rvec>> {
        let mut flat = vec![0.0f64; n * DIM];
        self.comm
            .process_at_rank(from as i32)
            .receive_into(&mut flat[..]);
        Ok(Self::unflatten(&flat))
    }

    fn sendrecv_ints(
        &self,
        to: usize,
        send: &[i32],
        from: usize,
        nrecv: usize,
    ) -> Result<Vec<i32>> {
        let mut recv = vec![0i32; nrecv];
        p2p::send_receive_into(
            send,
            &self.comm.process_at_rank(to as i32),
            &mut recv[..],
            &self.comm.process_at_rank(from as i32),
        );
        Ok(recv)
    }

    fn sendrecv_reals(
        &self,
        to: usize,
        send: &[f64],
        from: usize,
        nrecv: usize,
    ) -> Result<Vec<f64>> {
        let mut recv = vec![0.0f64; nrecv];
        p2p::send_receive_into(
            send,
            &self.comm.process_at_rank(to as i32),
            &mut recv[..],
            &self.comm.process_at_rank(from as i32),
        );
        Ok(recv)
    }

    fn sendrecv_rvecs(
        &self,
        to: usize,
        send: &[Rvec],
        from: usize,
        nrecv: usize,
    ) -> Result<Vec<Rvec>> {
        let flat = Self::flatten(send);
        let recv = self.sendrecv_reals(to, &flat, from, nrecv * DIM)?;
        Ok(Self::unflatten(&recv))
    }

    fn bcast_ints(&self, root: usize, buf: &mut [i32]) -> Result<()> {
        self.comm.process_at_rank(root as i32).broadcast_into(buf);
        Ok(())
    }

    fn bcast_reals(&self, root: usize, buf: &mut [f64]) -> Result<()> {
        self.comm.process_at_rank(root as i32).broadcast_into(buf);
        Ok(())
    }

    fn bcast_rvecs(&self, root: usize, buf: &mut [Rvec]) -> Result<()> {
        let mut flat = Self::flatten(buf);
        self.comm
            .process_at_rank(root as i32)
            .broadcast_into(&mut flat[..]);
        buf.copy_from_slice(&Self::unflatten(&flat));
        Ok(())
    }

    fn gather_ints(&self, root: usize, send: &[i32]) -> Result<Option<Vec<i32>>> {
        let proc = self.comm.process_at_rank(root as i32);
        if self.rank() == root {
            let mut all = vec![0i32; send.len() * self.size()];
            proc.gather_into_root(send, &mut all[..]);
            Ok(Some(all))
        } else {
            proc.gather_into(send);
            Ok(None)
        }
    }

    fn gather_reals(&self, root: usize, send: &[f64]) -> Result<Option<Vec<f64>>> {
        let proc = self.comm.process_at_rank(root as i32);
        if self.rank() == root {
            let mut all = vec![0.0f64; send.len() * self.size()];
            proc.gather_into_root(send, &mut all[..]);
            Ok(Some(all))
        } else {
            proc.gather_into(send);
            Ok(None)
        }
    }

    fn gather_rvecs(&self, root: usize, send: &[Rvec]) -> Result<Option<Vec<Rvec>>> {
        let flat = Self::flatten(send);
        Ok(self
            .gather_reals(root, &flat)?
            .map(|all| Self::unflatten(&all)))
    }

    fn gatherv_ints(&self, root: usize, send: &[i32]) -> Result<Option<Vec<Vec<i32>>>> {
        // Counts first, then one receive per rank; this path only runs at
        // checkpoints so latency is acceptable.
        let counts = self.gather_ints(root, &[send.len() as i32])?;
        if self.rank() == root {
            let counts = counts.expect("root gather returned no counts");
            let mut all = Vec::with_capacity(self.size());
            for (src, &n) in counts.iter().enumerate() {
                if src == root {
                    all.push(send.to_vec());
                } else {
                    let mut buf = vec![0i32; n as usize];
                    self.comm
                        .process_at_rank(src as i32)
                        .receive_into(&mut buf[..]);
                    all.push(buf);
                }
            }
            Ok(Some(all))
        } else {
            self.comm.process_at_rank(root as i32).send(send);
            Ok(None)
        }
    }

    fn scatter_ints(&self, root: usize, send: Option<&[i32]>, count: usize) -> Result<Vec<i32>> {
        let proc = self.comm.process_at_rank(root as i32);
        let mut recv = vec![0i32; count];
        if self.rank() == root {
            let send = send.ok_or_else(|| {
                DdError::Transport("scatter root called without a send buffer".into())
            })?;
            proc.scatter_into_root(send, &mut recv[..]);
        } else {
            proc.scatter_into(&mut recv[..]);
        }
        Ok(recv)
    }

    fn scatterv_ints(&self, root: usize, send: Option<&[Vec<i32>]>) -> Result<Vec<i32>> {
        // Counts ride ahead on an equal-count scatter.
        let mine = if self.rank() == root {
            let send = send.ok_or_else(|| {
                DdError::Transport("scatter root called without a send buffer".into())
            })?;
            let counts: Vec<i32> = send.iter().map(|v| v.len() as i32).collect();
            let n = self.scatter_ints(root, Some(&counts), 1)?[0] as usize;
            for (dst, buf) in send.iter().enumerate() {
                if dst != root {
                    self.comm.process_at_rank(dst as i32).send(&buf[..]);
                }
            }
            send[root][..n].to_vec()
        } else {
            let n = self.scatter_ints(root, None, 1)?[0] as usize;
            let mut buf = vec![0i32; n];
            self.comm
                .process_at_rank(root as i32)
                .receive_into(&mut buf[..]);
            buf
        };
        Ok(mine)
    }

    fn subset(&self, ranks: &[usize]) -> Result<Option<Self>> {
        let color = match ranks.iter().position(|&r| r == self.rank()) {
            // Color by the lead rank so disjoint subsets split in one call.
            Some(_) => Color::with_value(ranks[0] as i32),
            None => Color::undefined(),
        };
        let key = ranks
            .iter()
            .position(|&r| r == self.rank())
            .map(|p| p as i32)
            .unwrap_or(0);
        Ok(self
            .comm
            .split_by_color_with_key(color, key)
            .map(|comm| ClusterComm { comm }))
    }
}
