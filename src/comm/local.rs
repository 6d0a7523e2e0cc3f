//! In-process cluster: N ranks as threads of one process.
//!
//! Each ordered rank pair owns a dedicated unbounded channel, so a paired
//! send/receive can never deadlock and message order per pair is FIFO.
//! Sub-communicators get a fresh channel mesh from a shared registry keyed
//! by the member list; the mesh is built by whichever member arrives first
//! and retired once every member has claimed its end.

use std::collections::HashMap;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{DdError, Result};
use crate::geometry::Rvec;

use super::Communicator;

#[derive(Debug)]
enum Msg {
    Ints(Vec<i32>),
    Reals(Vec<f64>),
    Rvecs(Vec<Rvec>),
}

struct SubsetSlot {
    txs: Vec<Vec<Sender<Msg>>>,
    rxs: Vec<Option<Vec<Receiver<Msg>>>>,
    claimed: usize,
}

#[derive(Default)]
struct SubsetRegistry {
    slots: Mutex<HashMap<Vec<usize>, SubsetSlot>>,
}

/// One rank's endpoint. Owned by exactly one thread.
pub struct LocalComm {
    rank: usize,
    size: usize,
    /// Senders to every rank, self included.
    txs: Vec<Sender<Msg>>,
    /// Receivers from every rank, self included.
    rxs: Vec<Receiver<Msg>>,
    registry: Arc<SubsetRegistry>,
}

/// Builder for a full in-process cluster.
pub struct LocalCluster;

impl LocalCluster {
    /// Create the endpoints for `n` ranks; hand one to each rank thread.
    pub fn new(n: usize) -> Vec<LocalComm> {
        let registry = Arc::new(SubsetRegistry::default());
        let (txs, rxs) = mesh(n);
        txs.into_iter()
            .zip(rxs)
            .enumerate()
            .map(|(rank, (txs, rxs))| LocalComm {
                rank,
                size: n,
                txs,
                rxs,
                registry: Arc::clone(&registry),
            })
            .collect()
    }

    /// Run the same closure on `n` ranks, one thread each, and collect the
    /// per-rank results in rank order. A panicking rank fails the caller.
    pub fn run<T, F>(n: usize, f: F) -> Vec<T>
    where
        T: Send,
        F: Fn(LocalComm) -> T + Send + Sync,
    {
        let comms = LocalCluster::new(n);
        let f = &f;
        std::thread::scope(|scope| {
            let handles: Vec<_> = comms
                .into_iter()
                .map(|comm| scope.spawn(move || f(comm)))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("rank thread panicked"))
                .collect()
        })
    }
}

/// Build an n x n channel mesh; element [i][j] carries i -> j traffic.
fn mesh(n: usize) -> (Vec<Vec<Sender<Msg>>>, Vec<Vec<Receiver<Msg>>>) {
    let mut txs: Vec<Vec<Sender<Msg>>> = (0..n).map(|_| Vec::with_capacity(n)).collect();
    let mut rxs: Vec<Vec<Receiver<Msg>>> = (0..n).map(|_| Vec::with_capacity(n)).collect();
    for src in 0..n {
        for dst in 0..n {
            let (tx, rx) = channel();
            txs[src].push(tx);
            rxs[dst].push(rx);
        }
    }
    // rxs[dst] currently ordered by construction per src already: for each
    // dst the receivers were pushed in src order.
    (txs, rxs)
}

impl LocalComm {
    fn send(&self, to: usize, msg: Msg) -> Result<()> {
        self.txs[to]
            .send(msg)
            .map_err(|_| DdError::Transport(format!("rank {} is gone", to)))
    }

    fn recv(&self, from: usize) -> Result<Msg> {
        self.rxs[from]
            .recv()
            .map_err(|_| DdError::Transport(format!("rank {} is gone", from)))
    }

    fn recv_ints_exact(&self, from: usize, n: usize) -> Result<Vec<i32>> {
        match self.recv(from)? {
            Msg::Ints(v) if v.len() == n => Ok(v),
            Msg::Ints(v) => Err(protocol_mismatch(from, n, v.len(), "ints")),
            _ => Err(wrong_kind(from, "ints")),
        }
    }

    fn recv_reals_exact(&self, from: usize, n: usize) -> Result<Vec<f64>> {
        match self.recv(from)? {
            Msg::Reals(v) if v.len() == n => Ok(v),
            Msg::Reals(v) => Err(protocol_mismatch(from, n, v.len(), "reals")),
            _ => Err(wrong_kind(from, "reals")),
        }
    }

    fn recv_rvecs_exact(&self, from: usize, n: usize) -> Result<Vec<Rvec>> {
        match self.recv(from)? {
            Msg::Rvecs(v) if v.len() == n => Ok(v),
            Msg::Rvecs(v) => Err(protocol_mismatch(from, n, v.len(), "rvecs")),
            _ => Err(wrong_kind(from, "rvecs")),
        }
    }
}

fn protocol_mismatch(from: usize, want: usize, got: usize, kind: &str) -> DdError {
    DdError::Transport(format!(
        "protocol mismatch receiving {} from rank {}: expected {}, got {}",
        kind, from, want, got
    ))
}

fn wrong_kind(from: usize, want: &str) -> DdError {
    DdError::Transport(format!(
        "protocol mismatch receiving from rank {}: expected {}",
        from, want
    ))
}

impl Communicator for LocalComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn send_rvecs(&self, to: usize, buf: &[Rvec]) -> Result<()> {
        self.send(to, Msg::Rvecs(buf.to_vec()))
    }

    fn recv_rvecs(&self, from: usize, n: usize) -> Result<Vec<Rvec>> {
        self.recv_rvecs_exact(from, n)
    }

    fn sendrecv_ints(
        &self,
        to: usize,
        send: &[i32],
        from: usize,
        nrecv: usize,
    ) -> Result<Vec<i32>> {
        self.send(to, Msg::Ints(send.to_vec()))?;
        self.recv_ints_exact(from, nrecv)
    }

    fn sendrecv_reals(
        &self,
        to: usize,
        send: &[f64],
        from: usize,
        nrecv: usize,
    ) -> Result<Vec<f64>> {
        self.send(to, Msg::Reals(send.to_vec()))?;
        self.recv_reals_exact(from, nrecv)
    }

    fn sendrecv_rvecs(
        &self,
        to: usize,
        send: &[Rvec],
        from: usize,
        nrecv: usize,
    ) -> Result<Vec<Rvec>> {
        self.send(to, Msg::Rvecs(send.to_vec()))?;
        self.recv_rvecs_exact(from, nrecv)
    }

    fn bcast_ints(&self, root: usize, buf: &mut [i32]) -> Result<()> {
        if self.rank == root {
            for dst in 0..self.size {
                if dst != root {
                    self.send(dst, Msg::Ints(buf.to_vec()))?;
                }
            }
        } else {
            buf.copy_from_slice(&self.recv_ints_exact(root, buf.len())?);
        }
        Ok(())
    }

    fn bcast_reals(&self, root: usize, buf: &mut [f64]) -> Result<()> {
        if self.rank == root {
            for dst in 0..self.size {
                if dst != root {
                    self.send(dst, Msg::Reals(buf.to_vec()))?;
                }
            }
        } else {
            buf.copy_from_slice(&self.recv_reals_exact(root, buf.len())?);
        }
        Ok(())
    }

    fn bcast_rvecs(&self, root: usize, buf: &mut [Rvec]) -> Result<()> {
        if self.rank == root {
            for dst in 0..self.size {
                if dst != root {
                    self.send(dst, Msg::Rvecs(buf.to_vec()))?;
                }
            }
        } else {
            buf.copy_from_slice(&self.recv_rvecs_exact(root, buf.len())?);
        }
        Ok(())
    }

    fn gather_ints(&self, root: usize, send: &[i32]) -> Result<Option<Vec<i32>>> {
        if self.rank != root {
            self.send(root, Msg::Ints(send.to_vec()))?;
            return Ok(None);
        }
        let mut all = Vec::with_capacity(send.len() * self.size);
        for src in 0..self.size {
            if src == root {
                all.extend_from_slice(send);
            } else {
                all.extend(self.recv_ints_exact(src, send.len())?);
            }
        }
        Ok(Some(all))
    }

    fn gather_reals(&self, root: usize, send: &[f64]) -> Result<Option<Vec<f64>>> {
        if self.rank != root {
            self.send(root, Msg::Reals(send.to_vec()))?;
            return Ok(None);
        }
        let mut all = Vec::with_capacity(send.len() * self.size);
        for src in 0..self.size {
            if src == root {
                all.extend_from_slice(send);
            } else {
                all.extend(self.recv_reals_exact(src, send.len())?);
            }
        }
        Ok(Some(all))
    }

    fn gather_rvecs(&self, root: usize, send: &[Rvec]) -> Result<Option<Vec<Rvec>>> {
        if self.rank != root {
            self.send(root, Msg::Rvecs(send.to_vec()))?;
            return Ok(None);
        }
        let mut all = Vec::with_capacity(send.len() * self.size);
        for src in 0..self.size {
            if src == root {
                all.extend_from_slice(send);
            } else {
                all.extend(self.recv_rvecs_exact(src, send.len())?);
            }
        }
        Ok(Some(all))
    }

    fn gatherv_ints(&self, root: usize, send: &[i32]) -> Result<Option<Vec<Vec<i32>>>> {
        if self.rank != root {
            self.send(root, Msg::Ints(send.to_vec()))?;
            return Ok(None);
        }
        let mut all = Vec::with_capacity(self.size);
        for src in 0..self.size {
            if src == root {
                all.push(send.to_vec());
            } else {
                match self.recv(src)? {
                    Msg::Ints(v) => all.push(v),
                    _ => return Err(wrong_kind(src, "ints")),
                }
            }
        }
        Ok(Some(all))
    }

    fn scatter_ints(&self, root: usize, send: Option<&[i32]>, count: usize) -> Result<Vec<i32>> {
        if self.rank == root {
            let send = send.ok_or_else(|| {
                DdError::Transport("scatter root called without a send buffer".to_string())
            })?;
            for dst in 0..self.size {
                if dst != root {
                    self.send(dst, Msg::Ints(send[dst * count..(dst + 1) * count].to_vec()))?;
                }
            }
            Ok(send[root * count..(root + 1) * count].to_vec())
        } else {
            self.recv_ints_exact(root, count)
        }
    }

    fn scatterv_ints(&self, root: usize, send: Option<&[Vec<i32>]>) -> Result<Vec<i32>> {
        if self.rank == root {
            let send = send.ok_or_else(|| {
                DdError::Transport("scatter root called without a send buffer".to_string())
            })?;
            for dst in 0..self.size {
                if dst != root {
                    self.send(dst, Msg::Ints(send[dst].clone()))?;
                }
            }
            Ok(send[root].clone())
        } else {
            match self.recv(root)? {
                Msg::Ints(v) => Ok(v),
                _ => Err(wrong_kind(root, "ints")),
            }
        }
    }

    fn subset(&self, ranks: &[usize]) -> Result<Option<Self>> {
        let pos = match ranks.iter().position(|&r| r == self.rank) {
            Some(pos) => pos,
            None => return Ok(None),
        };
        let m = ranks.len();
        let mut slots = self.registry.slots.lock();
        let slot = slots.entry(ranks.to_vec()).or_insert_with(|| {
            let (txs, rxs) = mesh(m);
            SubsetSlot {
                txs,
                rxs: rxs.into_iter().map(Some).collect(),
                claimed: 0,
            }
        });
        let txs = slot.txs[pos].clone();
        let rxs = slot.rxs[pos]
            .take()
            .ok_or_else(|| DdError::Transport("sub-communicator endpoint claimed twice".into()))?;
        slot.claimed += 1;
        if slot.claimed == m {
            slots.remove(ranks);
        }
        Ok(Some(LocalComm {
            rank: pos,
            size: m,
            txs,
            rxs,
            registry: Arc::clone(&self.registry),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sendrecv_ring() {
        let sums = LocalCluster::run(4, |comm| {
            let right = (comm.rank() + 1) % 4;
            let left = (comm.rank() + 3) % 4;
            let got = comm
                .sendrecv_ints(right, &[comm.rank() as i32], left, 1)
                .unwrap();
            got[0]
        });
        assert_eq!(sums, vec![3, 0, 1, 2]);
    }

    #[test]
    fn bcast_and_gather() {
        let out = LocalCluster::run(3, |comm| {
            let mut buf = if comm.rank() == 1 { [7.0, 8.0] } else { [0.0; 2] };
            comm.bcast_reals(1, &mut buf).unwrap();
            let gathered = comm.gather_ints(0, &[comm.rank() as i32 * 10]).unwrap();
            (buf, gathered)
        });
        for (buf, _) in &out {
            assert_eq!(*buf, [7.0, 8.0]);
        }
        assert_eq!(out[0].1.as_deref(), Some(&[0, 10, 20][..]));
        assert!(out[1].1.is_none());
    }

    #[test]
    fn scatterv_round_trip() {
        let got = LocalCluster::run(3, |comm| {
            let payload: Vec<Vec<i32>> = vec![vec![1], vec![2, 3], vec![]];
            let send = (comm.rank() == 0).then_some(&payload[..]);
            comm.scatterv_ints(0, send).unwrap()
        });
        assert_eq!(got, vec![vec![1], vec![2, 3], vec![]]);
    }

    #[test]
    fn subset_forms_rows() {
        // 2x2 grid: rows {0,1} and {2,3}; each row gathers at its root.
        let got = LocalCluster::run(4, |comm| {
            let row = if comm.rank() < 2 {
                vec![0usize, 1]
            } else {
                vec![2usize, 3]
            };
            let sub = comm.subset(&row).unwrap().unwrap();
            sub.gather_ints(0, &[comm.rank() as i32]).unwrap()
        });
        assert_eq!(got[0].as_deref(), Some(&[0, 1][..]));
        assert_eq!(got[2].as_deref(), Some(&[2, 3][..]));
        assert!(got[1].is_none() && got[3].is_none());
    }

    #[test]
    fn size_mismatch_is_transport_error() {
        LocalCluster::run(2, |comm| {
            if comm.rank() == 0 {
                comm.send_rvecs(1, &[[1.0, 2.0, 3.0]]).unwrap();
            } else {
                let err = comm.recv_rvecs(0, 2).unwrap_err();
                assert!(matches!(err, DdError::Transport(_)));
            }
        });
    }
}
