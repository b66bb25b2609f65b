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

//! Batched compute surface of the engine: the fixed set of GEMM shapes,
//! the symmetric eigensolver and the batched 1D FFTs along each grid
//! axis.
//!
//! The capability set {gemm, eig, fft_batched} is resolved once at
//! construction. The host back-end delegates dense algebra to `nalgebra`
//! and transforms to `rustfft` plans; large `(npack x ne)` operands are
//! streamed tile by tile through a small pool of reusable buffers, the
//! same way an accelerator back-end would stage them through device
//! memory.

use std::sync::Arc;

use nalgebra::{DMatrix, DMatrixView, DMatrixViewMut};
use num_complex::Complex64;
use num_traits::Zero;
use rustfft::{Fft, FftPlanner};

use crate::error::{Error, Result};

/// Back-end selector; the capability set is fixed here, never at call
/// sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Host,
}

struct Slab {
    len: usize,
    inuse: bool,
    data: Vec<f64>,
}

/// Pool of equally-reusable buffers keyed by size.
struct BufferPool {
    slabs: Vec<Slab>,
}

impl BufferPool {
    fn new() -> BufferPool {
        BufferPool { slabs: Vec::new() }
    }

    /// Hand out a zeroed buffer of exactly `len` doubles, reusing a free
    /// slab of the same size when one exists.
    fn fetch(&mut self, len: usize) -> Result<usize> {
        for (ii, slab) in self.slabs.iter_mut().enumerate() {
            if !slab.inuse && slab.len == len {
                slab.inuse = true;
                slab.data.iter_mut().for_each(|x| *x = 0.0);
                return Ok(ii);
            }
        }
        let mut data: Vec<f64> = Vec::new();
        data.try_reserve_exact(len)
            .map_err(|_| Error::DeviceAlloc { len })?;
        data.resize(len, 0.0);
        self.slabs.push(Slab {
            len,
            inuse: true,
            data,
        });
        Ok(self.slabs.len() - 1)
    }

    fn release(&mut self, indx: usize) {
        self.slabs[indx].inuse = false;
    }
}

struct FftPlans {
    nx: usize,
    ny: usize,
    nz: usize,
    fwd_x: Arc<dyn Fft<f64>>,
    bwd_x: Arc<dyn Fft<f64>>,
    fwd_y: Arc<dyn Fft<f64>>,
    bwd_y: Arc<dyn Fft<f64>>,
    fwd_z: Arc<dyn Fft<f64>>,
    bwd_z: Arc<dyn Fft<f64>>,
}

/// Tile partition of a `(2*npack1) x ne` operand.
#[derive(Debug, Clone, Default)]
struct TilePlan {
    tile_fac: usize,
    npack2: usize,
    tile_npack2: Vec<usize>,
    tile_start2: Vec<usize>,
}

impl TilePlan {
    fn new(npack1: usize, tile_fac: usize) -> TilePlan {
        assert!(tile_fac > 0);
        let npack2 = 2 * npack1;
        let base = npack2 / tile_fac;
        let rem = npack2 % tile_fac;
        let mut tile_npack2 = Vec::with_capacity(tile_fac);
        let mut tile_start2 = Vec::with_capacity(tile_fac);
        let mut start = 0;
        for t in 0..tile_fac {
            let len = base + if t < rem { 1 } else { 0 };
            tile_npack2.push(len);
            tile_start2.push(start);
            start += len;
        }
        TilePlan {
            tile_fac,
            npack2,
            tile_npack2,
            tile_start2,
        }
    }
}

/// Uniform surface over the batched GEMM shapes, the eigensolver and the
/// per-axis batched FFTs.
pub struct GDevice {
    backend: Backend,
    pool: BufferPool,
    plans: Option<FftPlans>,
    tile: TilePlan,
    stage_a: [usize; 2],
    stage_b: [usize; 2],
    staged: bool,
    workers: Option<scoped_threadpool::Pool>,
}

/// Copy tile `t` of a column-major `(npack2 x ne)` operand into a staging
/// buffer of leading dimension `tile_len`.
fn stage_tile(src: &[f64], npack2: usize, ne: usize, start: usize, tile_len: usize, dst: &mut [f64]) {
    for col in 0..ne {
        let s = col * npack2 + start;
        let d = col * tile_len;
        dst[d..d + tile_len].copy_from_slice(&src[s..s + tile_len]);
    }
}

/// Sort eigenvalues descending, carrying eigenvector columns along.
fn eigsrt(d: &mut [f64], v: &mut [f64], n: usize) {
    for i in 0..n.saturating_sub(1) {
        let mut k = i;
        let mut p = d[i];
        for j in i + 1..n {
            if d[j] >= p {
                k = j;
                p = d[j];
            }
        }
        if k != i {
            d[k] = d[i];
            d[i] = p;
            for j in 0..n {
                v.swap(j + i * n, j + k * n);
            }
        }
    }
}

impl GDevice {
    pub fn new(backend: Backend) -> GDevice {
        GDevice {
            backend,
            pool: BufferPool::new(),
            plans: None,
            tile: TilePlan::new(1, 1),
            stage_a: [0; 2],
            stage_b: [0; 2],
            staged: false,
            workers: None,
        }
    }

    pub fn backend(&self) -> Backend {
        self.backend
    }

    /// Enable intra-rank worker threads for the batched FFTs.
    pub fn set_num_threads(&mut self, num_threads: usize) {
        self.workers = if num_threads > 1 {
            Some(scoped_threadpool::Pool::new(num_threads as u32))
        } else {
            None
        };
    }

    /// Obtain a zeroed pooled buffer, reusing a freed slab of equal size.
    pub fn fetch_dev_mem_indx(&mut self, len: usize) -> Result<usize> {
        self.pool.fetch(len)
    }

    pub fn release_dev_mem(&mut self, indx: usize) {
        self.pool.release(indx);
    }

    /// Set up the tile partition and the two rotating staging buffers for
    /// `(2*npack1) x ne` operands.
    pub fn psi_alloc(&mut self, npack1: usize, ne: usize, tile_fac: usize) -> Result<()> {
        self.tile = TilePlan::new(npack1, tile_fac);
        let max_len = *self.tile.tile_npack2.iter().max().unwrap();
        self.stage_a[0] = self.pool.fetch(max_len * ne)?;
        self.stage_b[0] = self.pool.fetch(max_len * ne)?;
        if tile_fac > 1 {
            self.stage_a[1] = self.pool.fetch(max_len * ne)?;
            self.stage_b[1] = self.pool.fetch(max_len * ne)?;
        } else {
            self.stage_a[1] = self.stage_a[0];
            self.stage_b[1] = self.stage_b[0];
        }
        self.staged = true;
        Ok(())
    }

    pub fn psi_dealloc(&mut self) {
        if self.staged {
            self.pool.release(self.stage_a[0]);
            self.pool.release(self.stage_b[0]);
            if self.tile.tile_fac > 1 {
                self.pool.release(self.stage_a[1]);
                self.pool.release(self.stage_b[1]);
            }
            self.staged = false;
        }
    }

    /// `c <- alpha a^T b + beta c`, one `ne x ne` output.
    pub fn tn1_dgemm(
        &mut self,
        npack2: usize,
        ne: usize,
        alpha: f64,
        a: &[f64],
        b: &[f64],
        beta: f64,
        c: &mut [f64],
    ) {
        let av = DMatrixView::from_slice(&a[..npack2 * ne], npack2, ne);
        let bv = DMatrixView::from_slice(&b[..npack2 * ne], npack2, ne);
        let mut cv = DMatrixViewMut::from_slice(&mut c[..ne * ne], ne, ne);
        cv.gemm_tr(alpha, &av, &bv, beta);
    }

    /// Fused `a^T a`, `a^T b`, `b^T b`, tile-streamed through the staging
    /// buffers when a tile partition is active.
    pub fn tn3_dgemm(
        &mut self,
        npack2: usize,
        ne: usize,
        alpha: f64,
        a: &[f64],
        b: &[f64],
        beta: f64,
        caa: &mut [f64],
        cab: &mut [f64],
        cbb: &mut [f64],
    ) {
        if !self.staged || self.tile.tile_fac == 1 || self.tile.npack2 != npack2 {
            let av = DMatrixView::from_slice(&a[..npack2 * ne], npack2, ne);
            let bv = DMatrixView::from_slice(&b[..npack2 * ne], npack2, ne);
            DMatrixViewMut::from_slice(&mut caa[..ne * ne], ne, ne).gemm_tr(alpha, &av, &av, beta);
            DMatrixViewMut::from_slice(&mut cab[..ne * ne], ne, ne).gemm_tr(alpha, &av, &bv, beta);
            DMatrixViewMut::from_slice(&mut cbb[..ne * ne], ne, ne).gemm_tr(alpha, &bv, &bv, beta);
            return;
        }

        let mut beta0 = beta;
        for tt in 0..self.tile.tile_fac {
            let len = self.tile.tile_npack2[tt];
            let start = self.tile.tile_start2[tt];
            let (ia, ib) = (self.stage_a[tt % 2], self.stage_b[tt % 2]);
            stage_tile(a, npack2, ne, start, len, &mut self.pool.slabs[ia].data);
            stage_tile(b, npack2, ne, start, len, &mut self.pool.slabs[ib].data);
            let at = DMatrixView::from_slice(&self.pool.slabs[ia].data[..len * ne], len, ne);
            let bt = DMatrixView::from_slice(&self.pool.slabs[ib].data[..len * ne], len, ne);
            DMatrixViewMut::from_slice(&mut caa[..ne * ne], ne, ne).gemm_tr(alpha, &at, &at, beta0);
            DMatrixViewMut::from_slice(&mut cab[..ne * ne], ne, ne).gemm_tr(alpha, &at, &bt, beta0);
            DMatrixViewMut::from_slice(&mut cbb[..ne * ne], ne, ne).gemm_tr(alpha, &bt, &bt, beta0);
            beta0 = 1.0;
        }
    }

    /// Fused `a^T a`, `a^T b`, `b^T a`, `b^T b`.
    pub fn tn4_dgemm(
        &mut self,
        npack2: usize,
        ne: usize,
        alpha: f64,
        a: &[f64],
        b: &[f64],
        beta: f64,
        caa: &mut [f64],
        cab: &mut [f64],
        cba: &mut [f64],
        cbb: &mut [f64],
    ) {
        let av = DMatrixView::from_slice(&a[..npack2 * ne], npack2, ne);
        let bv = DMatrixView::from_slice(&b[..npack2 * ne], npack2, ne);
        DMatrixViewMut::from_slice(&mut caa[..ne * ne], ne, ne).gemm_tr(alpha, &av, &av, beta);
        DMatrixViewMut::from_slice(&mut cab[..ne * ne], ne, ne).gemm_tr(alpha, &av, &bv, beta);
        DMatrixViewMut::from_slice(&mut cba[..ne * ne], ne, ne).gemm_tr(alpha, &bv, &av, beta);
        DMatrixViewMut::from_slice(&mut cbb[..ne * ne], ne, ne).gemm_tr(alpha, &bv, &bv, beta);
    }

    /// Rectangular `ne x nprj` projector contraction `c <- alpha a^T b +
    /// beta c`.
    pub fn tn_dgemm(
        &mut self,
        ne: usize,
        nprj: usize,
        npack2: usize,
        alpha: f64,
        a: &[f64],
        b: &[f64],
        beta: f64,
        c: &mut [f64],
    ) {
        let av = DMatrixView::from_slice(&a[..npack2 * ne], npack2, ne);
        let bv = DMatrixView::from_slice(&b[..npack2 * nprj], npack2, nprj);
        let mut cv = DMatrixViewMut::from_slice(&mut c[..ne * nprj], ne, nprj);
        cv.gemm_tr(alpha, &av, &bv, beta);
    }

    /// `c <- alpha a b + beta c` with `a` tall (`npack2 x ne`) and `b`
    /// dense (`ne x ne`).
    pub fn nn_dgemm(
        &mut self,
        npack2: usize,
        ne: usize,
        alpha: f64,
        a: &[f64],
        b: &[f64],
        beta: f64,
        c: &mut [f64],
    ) {
        let av = DMatrixView::from_slice(&a[..npack2 * ne], npack2, ne);
        let bv = DMatrixView::from_slice(&b[..ne * ne], ne, ne);
        let mut cv = DMatrixViewMut::from_slice(&mut c[..npack2 * ne], npack2, ne);
        cv.gemm(alpha, &av, &bv, beta);
    }

    /// `c <- alpha a b^T + beta c` with `a` tall (`npack2 x nprj`) and `b`
    /// dense (`ne x nprj`).
    pub fn nt_dgemm(
        &mut self,
        npack2: usize,
        ne: usize,
        nprj: usize,
        alpha: f64,
        a: &[f64],
        b: &[f64],
        beta: f64,
        c: &mut [f64],
    ) {
        let av = DMatrixView::from_slice(&a[..npack2 * nprj], npack2, nprj);
        let bt = DMatrixView::from_slice(&b[..ne * nprj], ne, nprj).transpose();
        let mut cv = DMatrixViewMut::from_slice(&mut c[..npack2 * ne], npack2, ne);
        cv.gemm(alpha, &av, &bt, beta);
    }

    /// The fused four-GEMM accumulation of the Lagrange-multiplier
    /// iteration: `sa1 += s21 sa0 + sa0 s12 + sa0 (s11 sa0)`, with `st1`
    /// receiving the inner product `s11 sa0`.
    pub fn mm6_dgemm(
        &mut self,
        ne: usize,
        s21: &[f64],
        s12: &[f64],
        s11: &[f64],
        sa0: &[f64],
        sa1: &mut [f64],
        st1: &mut [f64],
    ) {
        let nn = ne * ne;
        let s21v = DMatrixView::from_slice(&s21[..nn], ne, ne);
        let s12v = DMatrixView::from_slice(&s12[..nn], ne, ne);
        let s11v = DMatrixView::from_slice(&s11[..nn], ne, ne);
        let sa0v = DMatrixView::from_slice(&sa0[..nn], ne, ne);
        {
            let mut sa1v = DMatrixViewMut::from_slice(&mut sa1[..nn], ne, ne);
            sa1v.gemm(1.0, &s21v, &sa0v, 1.0);
            sa1v.gemm(1.0, &sa0v, &s12v, 1.0);
        }
        {
            let mut st1v = DMatrixViewMut::from_slice(&mut st1[..nn], ne, ne);
            st1v.gemm(1.0, &s11v, &sa0v, 0.0);
        }
        let st1v = DMatrixView::from_slice(&st1[..nn], ne, ne);
        let mut sa1v = DMatrixViewMut::from_slice(&mut sa1[..nn], ne, ne);
        sa1v.gemm(1.0, &sa0v, &st1v, 1.0);
    }

    /// Symmetric eigensolver per spin block, eigenvalues sorted
    /// descending and eigenvectors returned in place of `hml`.
    pub fn nn_eigensolver(
        &mut self,
        ispin: usize,
        ne: &[usize; 2],
        hml: &mut [f64],
        eig: &mut [f64],
    ) -> Result<()> {
        let mut shift1 = 0;
        let mut shift2 = 0;
        for ms in 0..ispin {
            let n = ne[ms];
            let block = DMatrix::from_column_slice(n, n, &hml[shift2..shift2 + n * n]);
            let decomp = nalgebra::SymmetricEigen::try_new(block, 1.0e-14, 100_000)
                .ok_or(Error::Eigensolver { n })?;
            for (i, ev) in decomp.eigenvalues.iter().enumerate() {
                eig[shift1 + i] = *ev;
            }
            hml[shift2..shift2 + n * n].copy_from_slice(decomp.eigenvectors.as_slice());
            eigsrt(
                &mut eig[shift1..shift1 + n],
                &mut hml[shift2..shift2 + n * n],
                n,
            );
            shift1 += ne[0];
            shift2 += ne[0] * ne[0];
        }
        Ok(())
    }

    /// Create the per-axis FFT plans once for a given grid.
    pub fn batch_fft_init(&mut self, nx: usize, ny: usize, nz: usize) -> Result<()> {
        if nx == 0 || ny == 0 || nz == 0 {
            return Err(Error::FftPlan(nx.min(ny).min(nz)));
        }
        let mut planner = FftPlanner::new();
        self.plans = Some(FftPlans {
            nx,
            ny,
            nz,
            fwd_x: planner.plan_fft_forward(nx),
            bwd_x: planner.plan_fft_inverse(nx),
            fwd_y: planner.plan_fft_forward(ny),
            bwd_y: planner.plan_fft_inverse(ny),
            fwd_z: planner.plan_fft_forward(nz),
            bwd_z: planner.plan_fft_inverse(nz),
        });
        Ok(())
    }

    fn plans(&self) -> &FftPlans {
        self.plans
            .as_ref()
            .expect("batch_fft_init must run before any batched FFT")
    }

    /// Batched real<->half-complex transform along x. `a` holds `nq`
    /// rows of `nx + 2` doubles: `nx` reals forward, `nx/2 + 1` complex
    /// pairs backward.
    pub fn batch_cfftx(&mut self, forward: bool, nx: usize, nq: usize, a: &mut [f64]) {
        assert_eq!(self.plans().nx, nx);
        let (fwd, bwd) = (self.plans().fwd_x.clone(), self.plans().bwd_x.clone());
        let row = nx + 2;
        let apply = move |chunk: &mut [f64]| {
            let mut buf = vec![Complex64::zero(); nx];
            let mut scratch =
                vec![Complex64::zero(); fwd.get_inplace_scratch_len().max(bwd.get_inplace_scratch_len())];
            if forward {
                for (x, b) in chunk[..nx].iter().zip(buf.iter_mut()) {
                    *b = Complex64::new(*x, 0.0);
                }
                fwd.process_with_scratch(&mut buf, &mut scratch);
                for k in 0..=nx / 2 {
                    chunk[2 * k] = buf[k].re;
                    chunk[2 * k + 1] = buf[k].im;
                }
            } else {
                for k in 0..=nx / 2 {
                    buf[k] = Complex64::new(chunk[2 * k], chunk[2 * k + 1]);
                }
                for k in 1..nx / 2 {
                    buf[nx - k] = buf[k].conj();
                }
                bwd.process_with_scratch(&mut buf, &mut scratch);
                for (x, b) in chunk[..nx].iter_mut().zip(buf.iter()) {
                    *x = b.re;
                }
                chunk[nx] = 0.0;
                chunk[nx + 1] = 0.0;
            }
        };
        self.run_batches(a, row, nq, None, apply);
    }

    /// Batched complex transform along y: `nq` contiguous chunks of
    /// `2*ny` doubles.
    pub fn batch_cffty(&mut self, forward: bool, ny: usize, nq: usize, a: &mut [f64]) {
        self.batch_cffty_zero(forward, ny, nq, a, None);
    }

    /// Same with a per-batch zero-skip mask.
    pub fn batch_cffty_zero(
        &mut self,
        forward: bool,
        ny: usize,
        nq: usize,
        a: &mut [f64],
        zero: Option<&[bool]>,
    ) {
        assert_eq!(self.plans().ny, ny);
        let plan = if forward {
            self.plans().fwd_y.clone()
        } else {
            self.plans().bwd_y.clone()
        };
        let apply = move |chunk: &mut [f64]| {
            let mut buf: Vec<Complex64> = chunk
                .chunks_exact(2)
                .map(|p| Complex64::new(p[0], p[1]))
                .collect();
            let mut scratch = vec![Complex64::zero(); plan.get_inplace_scratch_len()];
            plan.process_with_scratch(&mut buf, &mut scratch);
            for (p, b) in chunk.chunks_exact_mut(2).zip(buf.iter()) {
                p[0] = b.re;
                p[1] = b.im;
            }
        };
        self.run_batches(a, 2 * ny, nq, zero, apply);
    }

    /// Batched complex transform along z: `nq` contiguous chunks of
    /// `2*nz` doubles.
    pub fn batch_cfftz(&mut self, forward: bool, nz: usize, nq: usize, a: &mut [f64]) {
        self.batch_cfftz_zero(forward, nz, nq, a, None);
    }

    /// Same with a per-batch zero-skip mask.
    pub fn batch_cfftz_zero(
        &mut self,
        forward: bool,
        nz: usize,
        nq: usize,
        a: &mut [f64],
        zero: Option<&[bool]>,
    ) {
        assert_eq!(self.plans().nz, nz);
        let plan = if forward {
            self.plans().fwd_z.clone()
        } else {
            self.plans().bwd_z.clone()
        };
        let apply = move |chunk: &mut [f64]| {
            let mut buf: Vec<Complex64> = chunk
                .chunks_exact(2)
                .map(|p| Complex64::new(p[0], p[1]))
                .collect();
            let mut scratch = vec![Complex64::zero(); plan.get_inplace_scratch_len()];
            plan.process_with_scratch(&mut buf, &mut scratch);
            for (p, b) in chunk.chunks_exact_mut(2).zip(buf.iter()) {
                p[0] = b.re;
                p[1] = b.im;
            }
        };
        self.run_batches(a, 2 * nz, nq, zero, apply);
    }

    /// Apply `f` to each of `nq` chunks of `chunk_len` doubles, skipping
    /// masked batches, across the worker pool when one is configured.
    fn run_batches<F>(
        &mut self,
        a: &mut [f64],
        chunk_len: usize,
        nq: usize,
        zero: Option<&[bool]>,
        f: F,
    ) where
        F: Fn(&mut [f64]) + Send + Sync,
    {
        let data = &mut a[..chunk_len * nq];
        match self.workers.as_mut() {
            Some(pool) if nq > 1 => {
                let f = &f;
                pool.scoped(|s| {
                    for (q, chunk) in data.chunks_mut(chunk_len).enumerate() {
                        if zero.map_or(false, |z| z[q]) {
                            continue;
                        }
                        s.execute(move || f(chunk));
                    }
                });
            }
            _ => {
                for (q, chunk) in data.chunks_mut(chunk_len).enumerate() {
                    if zero.map_or(false, |z| z[q]) {
                        continue;
                    }
                    f(chunk);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;

    #[test]
    fn pool_reuses_freed_slabs() {
        let mut dev = GDevice::new(Backend::Host);
        let a = dev.fetch_dev_mem_indx(16).unwrap();
        let b = dev.fetch_dev_mem_indx(16).unwrap();
        assert_ne!(a, b);
        dev.release_dev_mem(a);
        let c = dev.fetch_dev_mem_indx(16).unwrap();
        assert_eq!(a, c);
        let d = dev.fetch_dev_mem_indx(32).unwrap();
        assert_ne!(c, d);
    }

    #[test]
    fn tn1_matches_reference() {
        let mut dev = GDevice::new(Backend::Host);
        let (npack2, ne) = (6, 2);
        let a: Vec<f64> = (0..npack2 * ne).map(|i| i as f64).collect();
        let b: Vec<f64> = (0..npack2 * ne).map(|i| (i as f64).sin()).collect();
        let mut c = vec![0.0; ne * ne];
        dev.tn1_dgemm(npack2, ne, 2.0, &a, &b, 0.0, &mut c);
        for i in 0..ne {
            for j in 0..ne {
                let mut expect = 0.0;
                for g in 0..npack2 {
                    expect += 2.0 * a[g + i * npack2] * b[g + j * npack2];
                }
                assert_approx_eq!(f64, c[i + j * ne], expect, epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn tiled_tn3_matches_untiled() {
        let (npack1, ne) = (17, 3);
        let npack2 = 2 * npack1;
        let a: Vec<f64> = (0..npack2 * ne).map(|i| (i as f64 * 0.37).cos()).collect();
        let b: Vec<f64> = (0..npack2 * ne).map(|i| (i as f64 * 0.11).sin()).collect();

        let mut plain = GDevice::new(Backend::Host);
        let (mut aa0, mut ab0, mut bb0) = (vec![0.0; 9], vec![0.0; 9], vec![0.0; 9]);
        plain.tn3_dgemm(npack2, ne, 2.0, &a, &b, 0.0, &mut aa0, &mut ab0, &mut bb0);

        let mut tiled = GDevice::new(Backend::Host);
        tiled.psi_alloc(npack1, ne, 4).unwrap();
        let (mut aa1, mut ab1, mut bb1) = (vec![0.0; 9], vec![0.0; 9], vec![0.0; 9]);
        tiled.tn3_dgemm(npack2, ne, 2.0, &a, &b, 0.0, &mut aa1, &mut ab1, &mut bb1);

        for i in 0..9 {
            assert_approx_eq!(f64, aa0[i], aa1[i], epsilon = 1e-10);
            assert_approx_eq!(f64, ab0[i], ab1[i], epsilon = 1e-10);
            assert_approx_eq!(f64, bb0[i], bb1[i], epsilon = 1e-10);
        }
    }

    #[test]
    fn mm6_matches_explicit_products() {
        let ne = 3;
        let nn = ne * ne;
        let s21: Vec<f64> = (0..nn).map(|i| (i as f64 * 0.3).sin()).collect();
        let s12 = s21.clone();
        let s11: Vec<f64> = (0..nn).map(|i| (i as f64 * 0.7).cos()).collect();
        let sa0: Vec<f64> = (0..nn).map(|i| 0.1 * i as f64).collect();
        let s22: Vec<f64> = (0..nn).map(|i| 1.0 / (1.0 + i as f64)).collect();

        let mut sa1 = s22.clone();
        let mut st1 = vec![0.0; nn];
        let mut dev = GDevice::new(Backend::Host);
        dev.mm6_dgemm(ne, &s21, &s12, &s11, &sa0, &mut sa1, &mut st1);

        let m = |v: &Vec<f64>| DMatrix::from_column_slice(ne, ne, v);
        let expect =
            m(&s22) + m(&s21) * m(&sa0) + m(&sa0) * m(&s12) + m(&sa0) * (m(&s11) * m(&sa0));
        for i in 0..nn {
            assert_approx_eq!(f64, sa1[i], expect.as_slice()[i], epsilon = 1e-12);
        }
    }

    #[test]
    fn eigensolver_sorts_descending_with_orthonormal_columns() {
        let n = 4;
        // Symmetric test matrix.
        let mut hml = vec![0.0; n * n];
        for i in 0..n {
            for j in 0..n {
                hml[i + j * n] = 1.0 / (1.0 + (i + j) as f64) + if i == j { i as f64 } else { 0.0 };
            }
        }
        let a = DMatrix::from_column_slice(n, n, &hml);
        let mut eig = vec![0.0; n];
        let mut dev = GDevice::new(Backend::Host);
        dev.nn_eigensolver(1, &[n, 0], &mut hml, &mut eig).unwrap();

        for w in eig.windows(2) {
            assert!(w[0] >= w[1]);
        }
        let v = DMatrix::from_column_slice(n, n, &hml);
        let vtv = v.transpose() * &v;
        for i in 0..n {
            for j in 0..n {
                let expect = if i == j { 1.0 } else { 0.0 };
                assert_approx_eq!(f64, vtv[(i, j)], expect, epsilon = 1e-10);
            }
        }
        // A v = lambda v for each column.
        for j in 0..n {
            let col = v.column(j);
            let av = &a * col;
            for i in 0..n {
                assert_approx_eq!(f64, av[i], eig[j] * col[i], epsilon = 1e-9);
            }
        }
    }

    #[test]
    fn x_axis_transform_round_trips() {
        let nx = 16;
        let nq = 3;
        let mut dev = GDevice::new(Backend::Host);
        dev.batch_fft_init(nx, 4, 4).unwrap();
        let row = nx + 2;
        let mut a = vec![0.0; row * nq];
        for q in 0..nq {
            for i in 0..nx {
                a[q * row + i] = ((i + q) as f64 * 0.39).cos();
            }
        }
        let orig = a.clone();
        dev.batch_cfftx(true, nx, nq, &mut a);
        dev.batch_cfftx(false, nx, nq, &mut a);
        for q in 0..nq {
            for i in 0..nx {
                assert_approx_eq!(
                    f64,
                    a[q * row + i] / nx as f64,
                    orig[q * row + i],
                    epsilon = 1e-12
                );
            }
        }
    }

    #[test]
    fn zero_mask_skips_batches() {
        let nz = 8;
        let mut dev = GDevice::new(Backend::Host);
        dev.batch_fft_init(4, 4, nz).unwrap();
        let mut a = vec![1.0; 2 * nz * 2];
        let zero = vec![false, true];
        dev.batch_cfftz_zero(true, nz, 2, &mut a, Some(&zero));
        // The masked batch is untouched.
        assert!(a[2 * nz..].iter().all(|&x| x == 1.0));
        // The live batch was transformed (a constant transforms to a spike).
        assert_approx_eq!(f64, a[0], nz as f64, epsilon = 1e-12);
        assert_approx_eq!(f64, a[2], 0.0, epsilon = 1e-12);
    }
}
