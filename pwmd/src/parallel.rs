// pwmd - A Rust implementation of plane-wave Car-Parrinello molecular dynamics
// Copyright (C) 2024 The pwmd developers

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

//! Cartesian process topology and the axis collectives built on it.
//!
//! The engine is SPMD: every rank runs the same program and communicates
//! only through the blocking, ordering-preserving collectives below. The
//! topology has three independent axes: `i` distributes the FFT grid, `j`
//! distributes the orbital index and `k` distributes Brillouin-zone
//! samples (size 1 in the Gamma-point variant).
//!
//! Two communicator back-ends exist, resolved at construction: a serial
//! fast path for a single rank, and a shared-memory world in which each
//! rank is a thread and messages travel over per-pair channels.

use std::sync::mpsc::{channel, Receiver, Sender};

/// Axis selector for collectives.
///
/// `Global` spans the whole process grid; `I`, `J` and `K` span the ranks
/// that differ only in the named coordinate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Global,
    I,
    J,
    K,
}

enum Packet {
    Real(Vec<f64>),
    Int(Vec<i64>),
}

struct RankLinks {
    /// Outgoing channel per destination taskid.
    senders: Vec<Sender<Packet>>,
    /// Incoming channel per source taskid.
    receivers: Vec<Receiver<Packet>>,
}

enum World {
    Serial,
    Threads(RankLinks),
}

/// One rank's view of the process grid.
pub struct Parallel {
    np_i: usize,
    np_j: usize,
    np_k: usize,
    taskid: usize,
    world: World,
}

impl Parallel {
    /// Serial topology: a single rank, all collectives are identities.
    pub fn serial() -> Parallel {
        Parallel {
            np_i: 1,
            np_j: 1,
            np_k: 1,
            taskid: 0,
            world: World::Serial,
        }
    }

    fn taskid_of(&self, i: usize, j: usize, k: usize) -> usize {
        i + self.np_i * (j + self.np_j * k)
    }

    pub fn np(&self) -> usize {
        self.np_i * self.np_j * self.np_k
    }
    pub fn np_i(&self) -> usize {
        self.np_i
    }
    pub fn np_j(&self) -> usize {
        self.np_j
    }
    pub fn np_k(&self) -> usize {
        self.np_k
    }
    pub fn taskid(&self) -> usize {
        self.taskid
    }
    pub fn taskid_i(&self) -> usize {
        self.taskid % self.np_i
    }
    pub fn taskid_j(&self) -> usize {
        (self.taskid / self.np_i) % self.np_j
    }
    pub fn taskid_k(&self) -> usize {
        self.taskid / (self.np_i * self.np_j)
    }

    /// True on exactly one rank of the grid.
    pub fn is_master(&self) -> bool {
        self.taskid == 0
    }

    /// Absolute taskid of grid coordinates `(i, j, k)`.
    pub fn rank_of(&self, i: usize, j: usize, k: usize) -> usize {
        self.taskid_of(i, j, k)
    }

    /// Taskids of the ranks in the requested communicator, in axis order.
    /// This rank is always a member.
    fn group(&self, axis: Axis) -> Vec<usize> {
        let (i, j, k) = (self.taskid_i(), self.taskid_j(), self.taskid_k());
        match axis {
            Axis::Global => (0..self.np()).collect(),
            Axis::I => (0..self.np_i).map(|ii| self.taskid_of(ii, j, k)).collect(),
            Axis::J => (0..self.np_j).map(|jj| self.taskid_of(i, jj, k)).collect(),
            Axis::K => (0..self.np_k).map(|kk| self.taskid_of(i, j, kk)).collect(),
        }
    }

    fn links(&self) -> &RankLinks {
        match &self.world {
            World::Threads(links) => links,
            World::Serial => unreachable!("no links on a serial world"),
        }
    }

    fn send_packet(&self, dst: usize, p: Packet) {
        self.links().senders[dst]
            .send(p)
            .expect("peer rank hung up during a collective");
    }

    fn recv_real(&self, src: usize) -> Vec<f64> {
        match self.links().receivers[src].recv() {
            Ok(Packet::Real(v)) => v,
            _ => panic!("collective ordering violated between ranks"),
        }
    }

    fn recv_int(&self, src: usize) -> Vec<i64> {
        match self.links().receivers[src].recv() {
            Ok(Packet::Int(v)) => v,
            _ => panic!("collective ordering violated between ranks"),
        }
    }

    /// Point-to-point send of doubles to an absolute taskid.
    pub fn dsend(&self, dst: usize, x: &[f64]) {
        if dst == self.taskid {
            return;
        }
        self.send_packet(dst, Packet::Real(x.to_vec()));
    }

    /// Point-to-point receive of doubles from an absolute taskid.
    pub fn drecv(&self, src: usize, x: &mut [f64]) {
        if src == self.taskid {
            return;
        }
        let v = self.recv_real(src);
        x.copy_from_slice(&v);
    }

    /// Scalar sum over the requested communicator.
    pub fn sum_all(&self, axis: Axis, x: f64) -> f64 {
        let mut buf = [x];
        self.vector_sum_all(axis, &mut buf);
        buf[0]
    }

    /// Element-wise in-place sum over the requested communicator.
    pub fn vector_sum_all(&self, axis: Axis, x: &mut [f64]) {
        if let World::Serial = self.world {
            return;
        }
        let group = self.group(axis);
        if group.len() == 1 {
            return;
        }
        let root = group[0];
        if self.taskid == root {
            for &src in &group[1..] {
                let v = self.recv_real(src);
                for (xi, vi) in x.iter_mut().zip(v.iter()) {
                    *xi += vi;
                }
            }
            for &dst in &group[1..] {
                self.send_packet(dst, Packet::Real(x.to_vec()));
            }
        } else {
            self.send_packet(root, Packet::Real(x.to_vec()));
            let v = self.recv_real(root);
            x.copy_from_slice(&v);
        }
    }

    /// Integer variant of [`Parallel::vector_sum_all`].
    pub fn vector_isum_all(&self, axis: Axis, x: &mut [i64]) {
        if let World::Serial = self.world {
            return;
        }
        let group = self.group(axis);
        if group.len() == 1 {
            return;
        }
        let root = group[0];
        if self.taskid == root {
            for &src in &group[1..] {
                let v = self.recv_int(src);
                for (xi, vi) in x.iter_mut().zip(v.iter()) {
                    *xi += vi;
                }
            }
            for &dst in &group[1..] {
                self.send_packet(dst, Packet::Int(x.to_vec()));
            }
        } else {
            self.send_packet(root, Packet::Int(x.to_vec()));
            let v = self.recv_int(root);
            x.copy_from_slice(&v);
        }
    }

    /// Broadcast doubles from the group member at axis position `root`.
    pub fn brdcst_values(&self, axis: Axis, root: usize, x: &mut [f64]) {
        if let World::Serial = self.world {
            return;
        }
        let group = self.group(axis);
        if group.len() == 1 {
            return;
        }
        let root_id = group[root];
        if self.taskid == root_id {
            for &dst in group.iter().filter(|&&t| t != root_id) {
                self.send_packet(dst, Packet::Real(x.to_vec()));
            }
        } else {
            let v = self.recv_real(root_id);
            x.copy_from_slice(&v);
        }
    }

    /// Broadcast integers from the group member at axis position `root`.
    pub fn brdcst_ivalues(&self, axis: Axis, root: usize, x: &mut [i64]) {
        if let World::Serial = self.world {
            return;
        }
        let group = self.group(axis);
        if group.len() == 1 {
            return;
        }
        let root_id = group[root];
        if self.taskid == root_id {
            for &dst in group.iter().filter(|&&t| t != root_id) {
                self.send_packet(dst, Packet::Int(x.to_vec()));
            }
        } else {
            let v = self.recv_int(root_id);
            x.copy_from_slice(&v);
        }
    }
}

/// Builder for the shared-memory SPMD world.
///
/// `spawn` returns one [`Parallel`] handle per rank; each handle is moved
/// into its rank thread. All pairwise channels are wired up front so no
/// further synchronization is needed to start communicating.
pub struct LocalWorld;

impl LocalWorld {
    pub fn spawn(np_i: usize, np_j: usize, np_k: usize) -> Vec<Parallel> {
        assert!(np_i > 0 && np_j > 0 && np_k > 0);
        let np = np_i * np_j * np_k;
        if np == 1 {
            return vec![Parallel::serial()];
        }

        // senders[src][dst] / receivers[dst][src]
        let mut senders: Vec<Vec<Option<Sender<Packet>>>> = (0..np)
            .map(|_| (0..np).map(|_| None).collect())
            .collect();
        let mut receivers: Vec<Vec<Option<Receiver<Packet>>>> = (0..np)
            .map(|_| (0..np).map(|_| None).collect())
            .collect();
        for src in 0..np {
            for dst in 0..np {
                let (tx, rx) = channel();
                senders[src][dst] = Some(tx);
                receivers[dst][src] = Some(rx);
            }
        }

        let mut ranks = Vec::with_capacity(np);
        for (taskid, (txs, rxs)) in senders.into_iter().zip(receivers.into_iter()).enumerate() {
            ranks.push(Parallel {
                np_i,
                np_j,
                np_k,
                taskid,
                world: World::Threads(RankLinks {
                    senders: txs.into_iter().map(Option::unwrap).collect(),
                    receivers: rxs.into_iter().map(Option::unwrap).collect(),
                }),
            });
        }
        ranks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn run_world<F>(np_i: usize, np_j: usize, np_k: usize, f: F)
    where
        F: Fn(Parallel) + Send + Sync + 'static + Copy,
    {
        let ranks = LocalWorld::spawn(np_i, np_j, np_k);
        let handles: Vec<_> = ranks
            .into_iter()
            .map(|p| thread::spawn(move || f(p)))
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn coordinates_round_trip() {
        let ranks = LocalWorld::spawn(3, 2, 2);
        for (t, p) in ranks.iter().enumerate() {
            assert_eq!(p.taskid(), t);
            assert_eq!(
                p.taskid_i() + 3 * (p.taskid_j() + 2 * p.taskid_k()),
                p.taskid()
            );
        }
        assert!(ranks[0].is_master());
        assert!(!ranks[5].is_master());
    }

    #[test]
    fn global_sum_counts_ranks() {
        run_world(2, 2, 1, |p| {
            let s = p.sum_all(Axis::Global, 1.0);
            assert_eq!(s, 4.0);
        });
    }

    #[test]
    fn axis_sums_are_independent() {
        run_world(2, 3, 1, |p| {
            // Summing the i coordinate along j keeps it constant; summing
            // along i totals the coordinate range.
            let along_j = p.sum_all(Axis::J, p.taskid_i() as f64);
            assert_eq!(along_j, 3.0 * p.taskid_i() as f64);
            let along_i = p.sum_all(Axis::I, p.taskid_i() as f64);
            assert_eq!(along_i, 1.0);
        });
    }

    #[test]
    fn vector_sum_all_in_place() {
        run_world(2, 2, 1, |p| {
            let mut v = vec![p.taskid() as f64, 1.0];
            p.vector_sum_all(Axis::Global, &mut v);
            assert_eq!(v, vec![6.0, 4.0]);
        });
    }

    #[test]
    fn broadcast_from_axis_root() {
        run_world(1, 4, 1, |p| {
            let mut v = if p.taskid_j() == 2 {
                vec![2.5, -1.0]
            } else {
                vec![0.0, 0.0]
            };
            p.brdcst_values(Axis::J, 2, &mut v);
            assert_eq!(v, vec![2.5, -1.0]);
        });
    }

    #[test]
    fn point_to_point_transfers() {
        run_world(1, 2, 1, |p| {
            if p.taskid() == 0 {
                p.dsend(1, &[3.0, 4.0]);
            } else {
                let mut v = [0.0; 2];
                p.drecv(0, &mut v);
                assert_eq!(v, [3.0, 4.0]);
            }
        });
    }

    #[test]
    fn integer_sum_all() {
        run_world(2, 1, 2, |p| {
            let mut v = vec![1i64, p.taskid_k() as i64];
            p.vector_isum_all(Axis::K, &mut v);
            assert_eq!(v[0], 2);
            assert_eq!(v[1], 1);
        });
    }
}
