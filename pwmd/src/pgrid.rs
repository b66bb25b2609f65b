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

//! Packed reciprocal-space grid.
//!
//! For every Brillouin index the grid selects the plane waves inside the
//! kinetic-energy cutoff and permutes their complex coefficients into a
//! dense contiguous ordering, which turns the sparse cutoff sphere into
//! BLAS-friendly vectors. Grid index 0 is the density grid (cutoff
//! `ecut`); indices `1..=nbrillq` are the wavefunction grids (cutoff
//! `wcut`).
//!
//! In the Gamma-point variant coefficients obey `c(-G) = conj(c(G))`, so
//! only one representative per conjugate pair is kept: inner products
//! double every contribution and subtract the self-conjugate part, and
//! the imaginary part of the zero wavevector is pinned to zero.
//!
//! The grid also owns the batched inverse-FFT pipeline
//! (`cr_pfft3b_queuein` / `_queuefilled` / `_queueout`), FIFO within a
//! rank.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::device::GDevice;
use crate::error::{Error, Result};
use crate::lattice::Lattice;
use crate::mapping::{Map3, MapKind};
use crate::parallel::{Axis, Parallel};

pub type DeviceHandle = Rc<RefCell<GDevice>>;

/// Pack tables of one cutoff sphere.
struct PackInfo {
    npack: usize,
    /// Leading self-conjugate entries (the zero wavevector when owned).
    nzero: usize,
    /// Packed index -> local complex index in the rotation-0 layout.
    to_grid: Vec<usize>,
    /// Packed index -> grid coordinates.
    gi: Vec<i64>,
    gj: Vec<i64>,
    gk: Vec<i64>,
    /// Packed index -> reciprocal vector.
    gvec: Vec<[f64; 3]>,
    /// (partner grid index, source packed index) pairs that restore the
    /// kx = 0 plane redundancy before an inverse transform.
    conj_pairs: Vec<(usize, usize)>,
    /// Per-(i,j) z-column skip mask for the batched transforms.
    zero_z: Vec<bool>,
    /// Per-(i,k) y-column skip mask.
    zero_y: Vec<bool>,
}

struct FftQueue {
    ready: VecDeque<Vec<f64>>,
}

/// Distributed packed reciprocal-space grid.
pub struct PackedGrid {
    parall: Arc<Parallel>,
    device: DeviceHandle,
    pub lattice: Lattice,
    map: Map3,
    pub nx: usize,
    pub ny: usize,
    pub nz: usize,
    pub nfft3d: usize,
    pub n2ft3d: usize,
    gamma: bool,
    nbrillouin: usize,
    nbrillq: usize,
    weights: Vec<f64>,
    grids: Vec<PackInfo>,
    npack1_max: usize,
    scratch: RefCell<Vec<f64>>,
    queue: RefCell<FftQueue>,
}

impl PackedGrid {
    /// Build the pack tables for the density grid and every locally owned
    /// Brillouin slot, and create the FFT plans.
    pub fn new(
        parall: Arc<Parallel>,
        device: DeviceHandle,
        lattice: Lattice,
        kind: MapKind,
        nbrillouin: usize,
        gamma: bool,
    ) -> Result<PackedGrid> {
        assert!(nbrillouin >= 1);
        assert!(
            !gamma || nbrillouin == 1,
            "the Gamma-point variant has a single Brillouin sample"
        );
        let (nx, ny, nz) = (lattice.nx(), lattice.ny(), lattice.nz());
        let map = Map3::new(kind, parall.np_i(), parall.taskid_i(), nx, ny, nz);
        let nfft3d = map.nfft3d();
        let n2ft3d = map.n2ft3d();

        device.borrow_mut().batch_fft_init(nx, ny, nz)?;

        // Brillouin samples are dealt cyclically over axis k.
        let np_k = parall.np_k();
        let taskid_k = parall.taskid_k();
        let nbrillq = (0..nbrillouin).filter(|nb| nb % np_k == taskid_k).count();
        assert!(
            nbrillq >= 1,
            "every rank of axis k must own at least one Brillouin sample"
        );
        let weights = vec![1.0 / nbrillouin as f64; nbrillq];

        let mut grids = Vec::with_capacity(1 + nbrillq);
        grids.push(Self::build_pack(&parall, &lattice, &map, lattice.ecut()));
        for _ in 0..nbrillq {
            grids.push(Self::build_pack(&parall, &lattice, &map, lattice.wcut()));
        }

        // Uniform orbital stride across ranks.
        let mut all = vec![0i64; parall.np()];
        all[parall.taskid()] = grids[1].npack as i64;
        parall.vector_isum_all(Axis::Global, &mut all);
        let npack1_max = *all.iter().max().unwrap() as usize;

        Ok(PackedGrid {
            parall,
            device,
            lattice,
            map,
            nx,
            ny,
            nz,
            nfft3d,
            n2ft3d,
            gamma,
            nbrillouin,
            nbrillq,
            weights,
            grids,
            npack1_max,
            scratch: RefCell::new(vec![0.0; n2ft3d]),
            queue: RefCell::new(FftQueue {
                ready: VecDeque::new(),
            }),
        })
    }

    fn build_pack(parall: &Parallel, lattice: &Lattice, map: &Map3, cut: f64) -> PackInfo {
        let (nx, ny, nz) = (lattice.nx(), lattice.ny(), lattice.nz());
        let nxh1 = nx / 2 + 1;
        let taskid_i = parall.taskid_i();

        let mut zero_entries = Vec::new();
        let mut entries = Vec::new();
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nxh1 {
                    // Nyquist planes sit outside every physical cutoff.
                    if i == nx / 2 || j == ny / 2 || k == nz / 2 {
                        continue;
                    }
                    let ki = i as i64;
                    let kj = if j <= ny / 2 { j as i64 } else { j as i64 - ny as i64 };
                    let kk = if k <= nz / 2 { k as i64 } else { k as i64 - nz as i64 };
                    // One representative per conjugate pair.
                    let rep = ki > 0 || kj > 0 || (kj == 0 && kk >= 0);
                    if !rep {
                        continue;
                    }
                    let g = lattice.gvector(ki, kj, kk);
                    let gg = g[0] * g[0] + g[1] * g[1] + g[2] * g[2];
                    if 0.5 * gg > cut {
                        continue;
                    }
                    if map.cijktop(i, j, k) != taskid_i {
                        continue;
                    }
                    let entry = (map.cijktoindex(i, j, k), ki, kj, kk, g, i, j, k);
                    if ki == 0 && kj == 0 && kk == 0 {
                        zero_entries.push(entry);
                    } else {
                        entries.push(entry);
                    }
                }
            }
        }

        let nzero = zero_entries.len();
        zero_entries.extend(entries);
        let npack = zero_entries.len();

        let mut info = PackInfo {
            npack,
            nzero,
            to_grid: Vec::with_capacity(npack),
            gi: Vec::with_capacity(npack),
            gj: Vec::with_capacity(npack),
            gk: Vec::with_capacity(npack),
            gvec: Vec::with_capacity(npack),
            conj_pairs: Vec::new(),
            zero_z: vec![true; nxh1 * ny],
            zero_y: vec![true; nxh1 * nz],
        };
        let serial_i = parall.np_i() == 1;
        let mut live_i = vec![false; nxh1];
        for (p, (indx, ki, kj, kk, g, i, j, k)) in zero_entries.into_iter().enumerate() {
            info.to_grid.push(indx);
            info.gi.push(ki);
            info.gj.push(kj);
            info.gk.push(kk);
            info.gvec.push(g);
            info.zero_z[i + nxh1 * j] = false;
            live_i[i] = true;
            if serial_i && ki == 0 && (kj != 0 || kk != 0) {
                let jc = (ny - j) % ny;
                let kc = (nz - k) % nz;
                info.conj_pairs.push((map.cijktoindex(i, jc, kc), p));
                info.zero_z[i + nxh1 * jc] = false;
            }
        }
        for k in 0..nz {
            for i in 0..nxh1 {
                info.zero_y[i + nxh1 * k] = !live_i[i];
            }
        }
        info
    }

    pub fn parall(&self) -> &Arc<Parallel> {
        &self.parall
    }
    pub fn device(&self) -> &DeviceHandle {
        &self.device
    }
    pub fn gamma(&self) -> bool {
        self.gamma
    }
    pub fn nbrillouin(&self) -> usize {
        self.nbrillouin
    }
    pub fn nbrillq(&self) -> usize {
        self.nbrillq
    }
    /// Brillouin-zone weight of the local slot `nbq`.
    pub fn pbrill_weight(&self, nbq: usize) -> f64 {
        self.weights[nbq]
    }
    /// Owner along axis `k` of global Brillouin index `nb`.
    pub fn ktop(&self, nb: usize) -> usize {
        nb % self.parall.np_k()
    }
    /// Local slot of global Brillouin index `nb` on its owner.
    pub fn ktoindex(&self, nb: usize) -> usize {
        nb / self.parall.np_k()
    }

    pub fn npack(&self, nb: usize) -> usize {
        self.grids[nb].npack
    }
    pub fn nzero(&self, nb: usize) -> usize {
        self.grids[nb].nzero
    }
    pub fn npack1_max(&self) -> usize {
        self.npack1_max
    }
    /// Reciprocal vectors of the packed entries of grid `nb`.
    pub fn gvectors(&self, nb: usize) -> &[[f64; 3]] {
        &self.grids[nb].gvec
    }

    pub fn cijktop(&self, i: usize, j: usize, k: usize) -> usize {
        self.map.cijktop(i, j, k)
    }
    pub fn cijktoindex(&self, i: usize, j: usize, k: usize) -> usize {
        self.map.cijktoindex(i, j, k)
    }

    // ---- packed vector operations -------------------------------------

    /// Local inner product with Gamma-point doubling accounting.
    pub fn cc_pack_idot(&self, nb: usize, a: &[f64], b: &[f64]) -> f64 {
        let g = &self.grids[nb];
        let n2 = 2 * g.npack;
        let mut sum = 0.0;
        for i in 0..n2 {
            sum += a[i] * b[i];
        }
        if self.gamma {
            sum *= 2.0;
            for i in 0..2 * g.nzero {
                sum -= a[i] * b[i];
            }
        }
        sum
    }

    /// Inner product summed across the grid distribution (axis `i`).
    pub fn cc_pack_dot(&self, nb: usize, a: &[f64], b: &[f64]) -> f64 {
        self.parall.sum_all(Axis::I, self.cc_pack_idot(nb, a, b))
    }

    pub fn c_pack_smul(&self, nb: usize, alpha: f64, a: &mut [f64]) {
        for x in a[..2 * self.grids[nb].npack].iter_mut() {
            *x *= alpha;
        }
    }

    pub fn cc_pack_daxpy(&self, nb: usize, alpha: f64, a: &[f64], b: &mut [f64]) {
        let n2 = 2 * self.grids[nb].npack;
        for i in 0..n2 {
            b[i] += alpha * a[i];
        }
    }

    pub fn cc_pack_copy(&self, nb: usize, a: &[f64], b: &mut [f64]) {
        let n2 = 2 * self.grids[nb].npack;
        b[..n2].copy_from_slice(&a[..n2]);
    }

    pub fn c_pack_zero(&self, nb: usize, a: &mut [f64]) {
        for x in a[..2 * self.grids[nb].npack].iter_mut() {
            *x = 0.0;
        }
    }

    /// Pin the imaginary part of the self-conjugate (zero-wavevector)
    /// entries to zero; real-space orbitals require it at the Gamma point.
    pub fn c_pack_noimagzero(&self, nb: usize, a: &mut [f64]) {
        for p in 0..self.grids[nb].nzero {
            a[2 * p + 1] = 0.0;
        }
    }

    /// In place: collapse a full rotation-0 field to its packed prefix.
    pub fn c_pack(&self, nb: usize, a: &mut [f64]) {
        let g = &self.grids[nb];
        let mut tmp = self.scratch.borrow_mut();
        tmp[..self.n2ft3d].copy_from_slice(&a[..self.n2ft3d]);
        for x in a[..self.n2ft3d].iter_mut() {
            *x = 0.0;
        }
        for (p, &indx) in g.to_grid.iter().enumerate() {
            a[2 * p] = tmp[2 * indx];
            a[2 * p + 1] = tmp[2 * indx + 1];
        }
    }

    /// In place: scatter a packed prefix back onto the full rotation-0
    /// field, restoring the kx = 0 plane conjugate partners.
    pub fn c_unpack(&self, nb: usize, a: &mut [f64]) {
        let g = &self.grids[nb];
        let mut tmp = self.scratch.borrow_mut();
        tmp[..2 * g.npack].copy_from_slice(&a[..2 * g.npack]);
        for x in a[..self.n2ft3d].iter_mut() {
            *x = 0.0;
        }
        for (p, &indx) in g.to_grid.iter().enumerate() {
            a[2 * indx] = tmp[2 * p];
            a[2 * indx + 1] = tmp[2 * p + 1];
        }
        if self.gamma {
            for &(partner, p) in &g.conj_pairs {
                a[2 * partner] = tmp[2 * p];
                a[2 * partner + 1] = -tmp[2 * p + 1];
            }
        }
    }

    /// Pack an integer field in place (index projections for the
    /// structure factor).
    pub fn i_pack(&self, nb: usize, a: &mut [i64]) {
        let g = &self.grids[nb];
        let tmp: Vec<i64> = g.to_grid.iter().map(|&indx| a[indx]).collect();
        for x in a.iter_mut() {
            *x = 0;
        }
        a[..g.npack].copy_from_slice(&tmp);
    }

    pub fn ii_pack_copy(&self, nb: usize, a: &[i64], b: &mut [i64]) {
        b[..self.grids[nb].npack].copy_from_slice(&a[..self.grids[nb].npack]);
    }

    // ---- real-space helpers -------------------------------------------

    pub fn r_zero(&self, a: &mut [f64]) {
        for x in a[..self.n2ft3d].iter_mut() {
            *x = 0.0;
        }
    }

    pub fn rr_copy(&self, a: &[f64], b: &mut [f64]) {
        b[..self.n2ft3d].copy_from_slice(&a[..self.n2ft3d]);
    }

    /// Fill the real-space field with reproducible noise (orbital
    /// bootstrap when no restart file exists).
    pub fn r_setrandom(&self, seed: u64, a: &mut [f64]) {
        let mut rng = StdRng::seed_from_u64(seed);
        let row = self.nx + 2;
        self.r_zero(a);
        for chunk in a[..self.n2ft3d].chunks_mut(row) {
            for x in chunk[..self.nx].iter_mut() {
                *x = 0.5 - rng.gen::<f64>();
            }
        }
    }

    fn require_serial_i(&self, what: &'static str) -> Result<()> {
        if self.parall.np_i() > 1 {
            return Err(Error::UnsupportedParallel(what));
        }
        Ok(())
    }

    /// Forward transform, real space to reciprocal space, with the
    /// `1/(nx ny nz)` normalization baked in.
    pub fn rc_fft3d(&self, a: &mut [f64]) -> Result<()> {
        self.require_serial_i("rc_fft3d needs the FFT grid resident on one rank")?;
        let (nx, ny, nz) = (self.nx, self.ny, self.nz);
        let nxh1 = nx / 2 + 1;
        let mut dev = self.device.borrow_mut();
        dev.batch_cfftx(true, nx, ny * nz, a);
        {
            let mut buf = self.scratch.borrow_mut();
            gather_y(a, &mut buf, nxh1, ny, nz);
            dev.batch_cffty(true, ny, nxh1 * nz, &mut buf);
            scatter_y(&buf, a, nxh1, ny, nz);
        }
        {
            let mut buf = self.scratch.borrow_mut();
            gather_z(a, &mut buf, nxh1, ny, nz);
            dev.batch_cfftz(true, nz, nxh1 * ny, &mut buf);
            scatter_z(&buf, a, nxh1, ny, nz);
        }
        let scale = 1.0 / (nx * ny * nz) as f64;
        for x in a[..self.n2ft3d].iter_mut() {
            *x *= scale;
        }
        Ok(())
    }

    /// Inverse transform, reciprocal space to real space (unnormalised).
    pub fn cr_fft3d(&self, a: &mut [f64]) -> Result<()> {
        self.cr_fft3d_masked(a, None)
    }

    fn cr_fft3d_masked(&self, a: &mut [f64], nb: Option<usize>) -> Result<()> {
        self.require_serial_i("cr_fft3d needs the FFT grid resident on one rank")?;
        let (nx, ny, nz) = (self.nx, self.ny, self.nz);
        let nxh1 = nx / 2 + 1;
        let mut dev = self.device.borrow_mut();
        {
            let mut buf = self.scratch.borrow_mut();
            gather_z(a, &mut buf, nxh1, ny, nz);
            let zero = nb.map(|nb| self.grids[nb].zero_z.as_slice());
            dev.batch_cfftz_zero(false, nz, nxh1 * ny, &mut buf, zero);
            scatter_z(&buf, a, nxh1, ny, nz);
        }
        {
            let mut buf = self.scratch.borrow_mut();
            gather_y(a, &mut buf, nxh1, ny, nz);
            let zero = nb.map(|nb| self.grids[nb].zero_y.as_slice());
            dev.batch_cffty_zero(false, ny, nxh1 * nz, &mut buf, zero);
            scatter_y(&buf, a, nxh1, ny, nz);
        }
        dev.batch_cfftx(false, nx, ny * nz, a);
        Ok(())
    }

    // ---- batched inverse-FFT pipeline ---------------------------------

    /// Submit a packed vector of grid `nb` for inverse transform.
    pub fn cr_pfft3b_queuein(&self, nb: usize, packed: &[f64]) -> Result<()> {
        let mut buf = vec![0.0; self.n2ft3d];
        buf[..2 * self.grids[nb].npack].copy_from_slice(&packed[..2 * self.grids[nb].npack]);
        self.c_unpack(nb, &mut buf);
        self.cr_fft3d_masked(&mut buf, Some(nb))?;
        self.queue.borrow_mut().ready.push_back(buf);
        Ok(())
    }

    /// True when at least one completed result is waiting.
    pub fn cr_pfft3b_queuefilled(&self) -> bool {
        !self.queue.borrow().ready.is_empty()
    }

    /// Retrieve the next real-space result, in submission order.
    pub fn cr_pfft3b_queueout(&self, _nb: usize, out: &mut [f64]) {
        let buf = self
            .queue
            .borrow_mut()
            .ready
            .pop_front()
            .expect("FFT queue drained while empty");
        out[..self.n2ft3d].copy_from_slice(&buf);
    }
}

// Gather/scatter between the rotation-0 x-rows layout and contiguous
// per-column buffers for the strided y and z stages.

fn gather_y(a: &[f64], buf: &mut [f64], nxh1: usize, ny: usize, nz: usize) {
    for k in 0..nz {
        for i in 0..nxh1 {
            let col = i + nxh1 * k;
            for j in 0..ny {
                let s = 2 * (i + nxh1 * (j + ny * k));
                let d = 2 * (col * ny + j);
                buf[d] = a[s];
                buf[d + 1] = a[s + 1];
            }
        }
    }
}

fn scatter_y(buf: &[f64], a: &mut [f64], nxh1: usize, ny: usize, nz: usize) {
    for k in 0..nz {
        for i in 0..nxh1 {
            let col = i + nxh1 * k;
            for j in 0..ny {
                let d = 2 * (i + nxh1 * (j + ny * k));
                let s = 2 * (col * ny + j);
                a[d] = buf[s];
                a[d + 1] = buf[s + 1];
            }
        }
    }
}

fn gather_z(a: &[f64], buf: &mut [f64], nxh1: usize, ny: usize, nz: usize) {
    for j in 0..ny {
        for i in 0..nxh1 {
            let col = i + nxh1 * j;
            for k in 0..nz {
                let s = 2 * (i + nxh1 * (j + ny * k));
                let d = 2 * (col * nz + k);
                buf[d] = a[s];
                buf[d + 1] = a[s + 1];
            }
        }
    }
}

fn scatter_z(buf: &[f64], a: &mut [f64], nxh1: usize, ny: usize, nz: usize) {
    for j in 0..ny {
        for i in 0..nxh1 {
            let col = i + nxh1 * j;
            for k in 0..nz {
                let d = 2 * (i + nxh1 * (j + ny * k));
                let s = 2 * (col * nz + k);
                a[d] = buf[s];
                a[d + 1] = buf[s + 1];
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Backend;
    use float_cmp::assert_approx_eq;

    fn gamma_grid(cell: f64, ecut: f64, wcut: f64) -> PackedGrid {
        let unita = [cell, 0.0, 0.0, 0.0, cell, 0.0, 0.0, 0.0, cell];
        let lattice = Lattice::new(unita, ecut, wcut);
        PackedGrid::new(
            Arc::new(Parallel::serial()),
            Rc::new(RefCell::new(GDevice::new(Backend::Host))),
            lattice,
            MapKind::Slab,
            1,
            true,
        )
        .unwrap()
    }

    #[test]
    fn packing_is_dense_and_within_cutoff() {
        let grid = gamma_grid(8.0, 20.0, 10.0);
        for nb in 0..2 {
            let npack = grid.npack(nb);
            assert!(npack > 0);
            let cut = if nb == 0 {
                grid.lattice.ecut()
            } else {
                grid.lattice.wcut()
            };
            for g in grid.gvectors(nb) {
                let gg = g[0] * g[0] + g[1] * g[1] + g[2] * g[2];
                assert!(0.5 * gg <= cut + 1e-12);
            }
        }
        // The wavefunction sphere is strictly inside the density sphere.
        assert!(grid.npack(1) < grid.npack(0));
        assert_eq!(grid.nzero(1), 1);
        assert_eq!(grid.npack1_max(), grid.npack(1));
    }

    #[test]
    fn idot_doubles_all_but_the_zero_wave() {
        let grid = gamma_grid(8.0, 20.0, 10.0);
        let npack = grid.npack(1);
        let mut a = vec![0.0; 2 * npack];
        a[0] = 3.0; // G = 0, real by construction
        a[2] = 1.0;
        a[3] = 2.0;
        let dot = grid.cc_pack_idot(1, &a, &a);
        assert_approx_eq!(f64, dot, 2.0 * (1.0 + 4.0) + 9.0, epsilon = 1e-14);
    }

    #[test]
    fn pack_unpack_round_trips() {
        let grid = gamma_grid(8.0, 20.0, 10.0);
        let npack = grid.npack(1);
        let mut v = vec![0.0; grid.n2ft3d];
        for p in 0..2 * npack {
            v[p] = (p as f64 * 0.17).sin();
        }
        grid.c_pack_noimagzero(1, &mut v);
        let packed: Vec<f64> = v[..2 * npack].to_vec();
        grid.c_unpack(1, &mut v);
        grid.c_pack(1, &mut v);
        for p in 0..2 * npack {
            assert_approx_eq!(f64, v[p], packed[p], epsilon = 1e-15);
        }
    }

    #[test]
    fn full_grid_fft_round_trip_on_a_gaussian() {
        // Scenario: a Gaussian at the cell centre, forward then inverse.
        let grid = gamma_grid(8.0, 20.0, 10.0);
        let (nx, ny, nz) = (grid.nx, grid.ny, grid.nz);
        let row = nx + 2;
        let mut a = vec![0.0; grid.n2ft3d];
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    let dx = (i as f64 - nx as f64 / 2.0) * 8.0 / nx as f64;
                    let dy = (j as f64 - ny as f64 / 2.0) * 8.0 / ny as f64;
                    let dz = (k as f64 - nz as f64 / 2.0) * 8.0 / nz as f64;
                    a[i + row * (j + ny * k)] = (-(dx * dx + dy * dy + dz * dz)).exp();
                }
            }
        }
        let orig = a.clone();
        grid.rc_fft3d(&mut a).unwrap();
        grid.cr_fft3d(&mut a).unwrap();
        let max = orig.iter().cloned().fold(0.0f64, f64::max);
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    let idx = i + row * (j + ny * k);
                    assert!((a[idx] - orig[idx]).abs() < 1e-12 * max);
                }
            }
        }
    }

    #[test]
    fn packed_inverse_transform_is_real() {
        let grid = gamma_grid(8.0, 20.0, 10.0);
        let npack = grid.npack(1);
        let mut packed = vec![0.0; 2 * npack];
        for p in 0..npack {
            packed[2 * p] = (p as f64 * 0.23).cos();
            packed[2 * p + 1] = (p as f64 * 0.31).sin();
        }
        grid.c_pack_noimagzero(1, &mut packed);

        // Round trip through the full grid: unpack + inverse + forward +
        // pack reproduces the packed coefficients, which is only possible
        // if the conjugate completion produced a genuinely real field.
        let mut full = vec![0.0; grid.n2ft3d];
        full[..2 * npack].copy_from_slice(&packed);
        grid.c_unpack(1, &mut full);
        grid.cr_fft3d(&mut full).unwrap();
        grid.rc_fft3d(&mut full).unwrap();
        grid.c_pack(1, &mut full);
        for p in 0..2 * npack {
            assert_approx_eq!(f64, full[p], packed[p], epsilon = 1e-11);
        }
    }

    #[test]
    fn pipeline_preserves_fifo_order() {
        let grid = gamma_grid(8.0, 20.0, 10.0);
        let npack = grid.npack(1);
        let mut first = vec![0.0; 2 * npack];
        let mut second = vec![0.0; 2 * npack];
        first[0] = 1.0;
        second[0] = 2.0;

        grid.cr_pfft3b_queuein(1, &first).unwrap();
        grid.cr_pfft3b_queuein(1, &second).unwrap();
        assert!(grid.cr_pfft3b_queuefilled());

        let mut out1 = vec![0.0; grid.n2ft3d];
        let mut out2 = vec![0.0; grid.n2ft3d];
        grid.cr_pfft3b_queueout(1, &mut out1);
        grid.cr_pfft3b_queueout(1, &mut out2);
        assert!(!grid.cr_pfft3b_queuefilled());

        // A constant G=0 coefficient transforms to a constant field.
        assert_approx_eq!(f64, out1[0], 1.0, epsilon = 1e-12);
        assert_approx_eq!(f64, out2[0], 2.0, epsilon = 1e-12);
    }
}
