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

//! The orbital bundle: electron orbitals as packed reciprocal-space
//! columns, the BLAS-level algebra on them, modified Gram-Schmidt, the
//! Lagrange-multiplier constraint solver and the Stiefel rotation
//! toolkit.
//!
//! The bundle *owns* its packed grid and orbital map (composition, not
//! inheritance) and keeps the seven overlap matrices `s22 s21 s12 s11
//! sa1 sa0 st1` in a single arena with typed views.
//!
//! `psi` arrays are flat `f64` vectors of length
//! `nbrillq * (neq[0]+neq[1]) * 2*npack1_max`; Brillouin slot, spin and
//! orbital are implicit strides, spin blocks contiguous.

use tracing::warn;

use crate::error::{Error, Result};
use crate::mapping::Map1;
use crate::parallel::Axis;
use crate::pgrid::PackedGrid;

/// Lagrange-multiplier iteration cap and thresholds; these constants are
/// part of the accepted-orbital contract.
const ITERLMD: usize = 220;
const CONVGLMD: f64 = 1.0e-15;
const CONVGLMD2: f64 = 1.0e-12;

/// Spin-block loop bounds for the `mb` convention: `mb == -1` spans all
/// spins, otherwise the single block `mb`.
fn spin_bounds(mb: i32, ispin: usize, ne: [usize; 2]) -> (usize, usize, usize) {
    if mb == -1 {
        (0, ispin, ne[0] * ne[0])
    } else {
        (mb as usize, mb as usize + 1, 0)
    }
}

/// Split the overlap arena into its seven named matrices.
struct OverlapViews<'a> {
    s22: &'a mut [f64],
    s21: &'a mut [f64],
    s12: &'a mut [f64],
    s11: &'a mut [f64],
    sa1: &'a mut [f64],
    sa0: &'a mut [f64],
    st1: &'a mut [f64],
}

fn overlap_views(arena: &mut [f64], nn: usize) -> OverlapViews {
    let (s22, rest) = arena.split_at_mut(nn);
    let (s21, rest) = rest.split_at_mut(nn);
    let (s12, rest) = rest.split_at_mut(nn);
    let (s11, rest) = rest.split_at_mut(nn);
    let (sa1, rest) = rest.split_at_mut(nn);
    let (sa0, rest) = rest.split_at_mut(nn);
    let (st1, _) = rest.split_at_mut(nn);
    OverlapViews {
        s22,
        s21,
        s12,
        s11,
        sa1,
        sa0,
        st1,
    }
}

/// Shared immutable context for the matrix-multiply cores, so they can
/// run while the overlap arena is mutably borrowed.
struct MatCtx<'a> {
    grid: &'a PackedGrid,
    omap: &'a Map1,
    ispin: usize,
    ne: [usize; 2],
    neq: [usize; 2],
    parallelized: bool,
}

impl<'a> MatCtx<'a> {
    fn npack2(&self) -> usize {
        2 * self.grid.npack1_max()
    }

    /// Offset of the spin-`ms` block of Brillouin slot `nbq` in a psi
    /// array.
    fn spin_offset(&self, nbq: usize, ms: usize) -> usize {
        (nbq * (self.neq[0] + self.neq[1]) + ms * self.neq[0]) * self.npack2()
    }
}

/// Subtract the self-conjugate (zero-wavevector) contribution that the
/// doubled GEMM counted twice: `h[i,j] -= sum_{g<ng0} a[g,i] b[g,j]`.
fn gamma_zero_correction(
    ng0: usize,
    npack2: usize,
    n: usize,
    a: &[f64],
    b: &[f64],
    h: &mut [f64],
) {
    if ng0 == 0 {
        return;
    }
    for j in 0..n {
        for i in 0..n {
            let mut s = 0.0;
            for g in 0..ng0 {
                s += a[g + i * npack2] * b[g + j * npack2];
            }
            h[i + j * n] -= s;
        }
    }
}

fn symmetrize_upper_to_lower(h: &mut [f64], n: usize) {
    for k in 0..n {
        for j in k + 1..n {
            h[j + k * n] = h[k + j * n];
        }
    }
}

/// One overlap product `h_block = <psi1^T psi2>` for spin `ms` of slot
/// `nbq`, written into the full `ne x ne` block on every rank.
///
/// Serial in `j`: a single doubled GEMM plus the zero-wave correction.
/// Distributed in `j`: the orbital columns of `psi2` are assembled along
/// axis `j`, the local block GEMM is scattered to the global row
/// positions, and the sum-reductions along axes `j` and `i` complete the
/// matrix.
fn tn_block(ctx: &MatCtx, nbq: usize, ms: usize, psi1: &[f64], psi2: &[f64], h: &mut [f64]) {
    let n = ctx.ne[ms];
    let h = &mut h[..n * n];
    let npack2 = ctx.npack2();
    let gamma = ctx.grid.gamma();
    let alpha = if gamma { 2.0 } else { 1.0 };
    let ng0 = if gamma { 2 * ctx.grid.nzero(nbq + 1) } else { 0 };
    let off = ctx.spin_offset(nbq, ms);
    let device = ctx.grid.device().clone();

    if !ctx.parallelized {
        let a = &psi1[off..off + npack2 * n];
        let b = &psi2[off..off + npack2 * n];
        device
            .borrow_mut()
            .tn1_dgemm(npack2, n, alpha, a, b, 0.0, h);
        gamma_zero_correction(ng0, npack2, n, a, b, h);
        ctx.grid.parall().vector_sum_all(Axis::I, h);
        return;
    }

    let nq = ctx.neq[ms];
    let a = &psi1[off..off + npack2 * nq];
    // Assemble the full column set of psi2 for this spin.
    let mut bfull = vec![0.0; npack2 * n];
    for q in 0..nq {
        let g = ctx.omap.global_index(ms, q);
        bfull[g * npack2..(g + 1) * npack2]
            .copy_from_slice(&psi2[off + q * npack2..off + (q + 1) * npack2]);
    }
    ctx.grid.parall().vector_sum_all(Axis::J, &mut bfull);

    // Local block: rows are this rank's columns of psi1.
    for x in h.iter_mut() {
        *x = 0.0;
    }
    if nq > 0 {
        let mut block = vec![0.0; nq * n];
        device
            .borrow_mut()
            .tn_dgemm(nq, n, npack2, alpha, a, &bfull, 0.0, &mut block);
        for j in 0..n {
            for q in 0..nq {
                let mut s = block[q + j * nq];
                for g in 0..ng0 {
                    s -= a[g + q * npack2] * bfull[g + j * npack2];
                }
                h[ctx.omap.global_index(ms, q) + j * n] = s;
            }
        }
    }
    ctx.grid.parall().vector_sum_all(Axis::J, h);
    ctx.grid.parall().vector_sum_all(Axis::I, h);
}

/// `psi2 <- alpha psi1 . h + beta psi2` for spin `ms` of slot `nbq`.
fn nn_block(
    ctx: &MatCtx,
    nbq: usize,
    ms: usize,
    alpha: f64,
    psi1: &[f64],
    h: &[f64],
    beta: f64,
    psi2: &mut [f64],
) {
    let n = ctx.ne[ms];
    let npack2 = ctx.npack2();
    let off = ctx.spin_offset(nbq, ms);
    let device = ctx.grid.device().clone();

    if !ctx.parallelized {
        device.borrow_mut().nn_dgemm(
            npack2,
            n,
            alpha,
            &psi1[off..off + npack2 * n],
            h,
            beta,
            &mut psi2[off..off + npack2 * n],
        );
        return;
    }

    let nq = ctx.neq[ms];
    let mut afull = vec![0.0; npack2 * n];
    for q in 0..nq {
        let g = ctx.omap.global_index(ms, q);
        afull[g * npack2..(g + 1) * npack2]
            .copy_from_slice(&psi1[off + q * npack2..off + (q + 1) * npack2]);
    }
    ctx.grid.parall().vector_sum_all(Axis::J, &mut afull);
    if nq == 0 {
        return;
    }
    // b[q, m] = h[m, global(q)] so that afull . b^T lands on the local
    // columns.
    let mut b = vec![0.0; nq * n];
    for q in 0..nq {
        let g = ctx.omap.global_index(ms, q);
        for m in 0..n {
            b[q + m * nq] = h[m + g * n];
        }
    }
    device.borrow_mut().nt_dgemm(
        npack2,
        nq,
        n,
        alpha,
        &afull,
        &b,
        beta,
        &mut psi2[off..off + npack2 * nq],
    );
}

/// Distributed wavefunction bundle.
pub struct Orbitals {
    grid: PackedGrid,
    omap: Map1,
    pub ispin: usize,
    pub ne: [usize; 2],
    pub neq: [usize; 2],
    nbrillq: usize,
    parallelized: bool,
    arena: Vec<f64>,
}

impl Orbitals {
    pub fn new(grid: PackedGrid, ispin: usize, ne: [usize; 2]) -> Orbitals {
        let parall = grid.parall().clone();
        let omap = Map1::new(ispin, ne, parall.np_j(), parall.taskid_j());
        let neq = omap.neq;
        let nbrillq = grid.nbrillq();
        let parallelized = parall.np_j() > 1;
        let arena = vec![0.0; 7 * ne[0] * ne[0]];
        Orbitals {
            grid,
            omap,
            ispin,
            ne,
            neq,
            nbrillq,
            parallelized,
            arena,
        }
    }

    pub fn grid(&self) -> &PackedGrid {
        &self.grid
    }
    pub fn omap(&self) -> &Map1 {
        &self.omap
    }
    pub fn nbrillq(&self) -> usize {
        self.nbrillq
    }
    pub fn npack2(&self) -> usize {
        2 * self.grid.npack1_max()
    }
    fn ctx(&self) -> MatCtx {
        MatCtx {
            grid: &self.grid,
            omap: &self.omap,
            ispin: self.ispin,
            ne: self.ne,
            neq: self.neq,
            parallelized: self.parallelized,
        }
    }

    /// Total local length of a psi array.
    pub fn g_nsize(&self) -> usize {
        self.nbrillq * (self.neq[0] + self.neq[1]) * self.npack2()
    }

    pub fn g_allocate(&self) -> Vec<f64> {
        vec![0.0; self.g_nsize()]
    }

    /// Real-space companion of a psi array.
    pub fn h_allocate(&self) -> Vec<f64> {
        vec![0.0; self.nbrillq * (self.neq[0] + self.neq[1]) * self.grid.n2ft3d]
    }

    /// Spin-resolved real-space density.
    pub fn r_nalloc(&self) -> Vec<f64> {
        vec![0.0; self.ispin * self.grid.n2ft3d]
    }

    /// Per-spin matrix storage (all Brillouin slots).
    pub fn m_allocate(&self, mb: i32) -> Vec<f64> {
        let nn = if mb == -1 {
            self.ne[0] * self.ne[0] + self.ne[1] * self.ne[1]
        } else {
            self.ne[mb as usize] * self.ne[mb as usize]
        };
        vec![0.0; self.nbrillq * nn]
    }

    pub fn m_size(&self, mb: i32) -> usize {
        if mb == -1 {
            self.ne[0] * self.ne[0] + self.ne[1] * self.ne[1]
        } else {
            self.ne[mb as usize] * self.ne[mb as usize]
        }
    }

    /// Offset of local column `col` (spin blocks contiguous) of slot
    /// `nbq`.
    pub fn col_offset(&self, nbq: usize, col: usize) -> usize {
        (nbq * (self.neq[0] + self.neq[1]) + col) * self.npack2()
    }

    // ---- flat vector algebra ------------------------------------------

    /// Weighted trace `sum w(nbq) <psi1_n, psi2_n>` over every local
    /// orbital, doubled for spin-restricted runs.
    pub fn gg_traceall(&self, psi1: &[f64], psi2: &[f64]) -> f64 {
        let npack2 = self.npack2();
        let mut sum = 0.0;
        let mut indx = 0;
        for nbq in 0..self.nbrillq {
            let weight = self.grid.pbrill_weight(nbq);
            for _ in 0..self.neq[0] + self.neq[1] {
                sum += self
                    .grid
                    .cc_pack_idot(nbq + 1, &psi1[indx..], &psi2[indx..])
                    * weight;
                indx += npack2;
            }
        }
        if self.ispin == 1 {
            sum *= 2.0;
        }
        self.grid.parall().sum_all(Axis::Global, sum)
    }

    pub fn gg_copy(&self, psi1: &[f64], psi2: &mut [f64]) {
        psi2[..self.g_nsize()].copy_from_slice(&psi1[..self.g_nsize()]);
    }

    pub fn gg_smul(&self, alpha: f64, psi1: &[f64], psi2: &mut [f64]) {
        for (o, i) in psi2[..self.g_nsize()].iter_mut().zip(psi1.iter()) {
            *o = alpha * i;
        }
    }

    pub fn g_scale(&self, alpha: f64, psi1: &mut [f64]) {
        for x in psi1[..self.g_nsize()].iter_mut() {
            *x *= alpha;
        }
    }

    pub fn gg_sum2(&self, psi1: &[f64], psi2: &mut [f64]) {
        for (o, i) in psi2[..self.g_nsize()].iter_mut().zip(psi1.iter()) {
            *o += i;
        }
    }

    pub fn gg_minus2(&self, psi1: &[f64], psi2: &mut [f64]) {
        for (o, i) in psi2[..self.g_nsize()].iter_mut().zip(psi1.iter()) {
            *o -= i;
        }
    }

    pub fn ggg_minus(&self, psi1: &[f64], psi2: &[f64], psi3: &mut [f64]) {
        for ((o, a), b) in psi3[..self.g_nsize()]
            .iter_mut()
            .zip(psi1.iter())
            .zip(psi2.iter())
        {
            *o = a - b;
        }
    }

    pub fn gg_daxpy(&self, alpha: f64, psi1: &[f64], psi2: &mut [f64]) {
        for (o, i) in psi2[..self.g_nsize()].iter_mut().zip(psi1.iter()) {
            *o += alpha * i;
        }
    }

    pub fn g_zero(&self, psi: &mut [f64]) {
        for x in psi[..self.g_nsize()].iter_mut() {
            *x = 0.0;
        }
    }

    // ---- real-space couplings -----------------------------------------

    /// Batched inverse FFT of every local orbital through the pipeline,
    /// in submission order.
    pub fn gh_fftb(&self, psi: &[f64], psi_r: &mut [f64]) -> Result<()> {
        let npack2 = self.npack2();
        let shift2 = self.grid.n2ft3d;
        for nbq in 0..self.nbrillq {
            let n = self.neq[0] + self.neq[1];
            let base1 = nbq * n * npack2;
            let base2 = nbq * n * shift2;
            let mut indx1 = 0;
            let mut indx2 = 0;
            while indx2 < n {
                if indx1 < n {
                    self.grid
                        .cr_pfft3b_queuein(nbq + 1, &psi[base1 + indx1 * npack2..])?;
                    indx1 += 1;
                }
                if self.grid.cr_pfft3b_queuefilled() || indx1 >= n {
                    self.grid
                        .cr_pfft3b_queueout(nbq + 1, &mut psi_r[base2 + indx2 * shift2..]);
                    indx2 += 1;
                }
            }
        }
        Ok(())
    }

    /// Accumulate `dn[ms, r] = alpha sum_n w(nbq) |psi_r[nbq, ms, n, r]|^2`,
    /// reduced over the orbital and Brillouin axes.
    pub fn hr_asumsqr(&self, alpha: f64, psir: &[f64], dn: &mut [f64]) {
        let n2ft3d = self.grid.n2ft3d;
        for x in dn[..self.ispin * n2ft3d].iter_mut() {
            *x = 0.0;
        }
        let mut indx1 = 0;
        for nbq in 0..self.nbrillq {
            let w = alpha * self.grid.pbrill_weight(nbq);
            for ms in 0..self.ispin {
                for _ in 0..self.neq[ms] {
                    let dn_ms = &mut dn[ms * n2ft3d..(ms + 1) * n2ft3d];
                    for (o, p) in dn_ms.iter_mut().zip(psir[indx1..indx1 + n2ft3d].iter()) {
                        *o += w * p * p;
                    }
                    indx1 += n2ft3d;
                }
            }
        }
        self.grid
            .parall()
            .vector_sum_all(Axis::J, &mut dn[..self.ispin * n2ft3d]);
        self.grid
            .parall()
            .vector_sum_all(Axis::K, &mut dn[..self.ispin * n2ft3d]);
    }

    /// Perturbation density `dn12 = alpha sum_n (psir0 psir1 + psir1
    /// psir0)`.
    pub fn hhr_asummul(&self, alpha: f64, psir0: &[f64], psir1: &[f64], dn12: &mut [f64]) {
        let n2ft3d = self.grid.n2ft3d;
        for x in dn12[..self.ispin * n2ft3d].iter_mut() {
            *x = 0.0;
        }
        let mut indx1 = 0;
        for _nbq in 0..self.nbrillq {
            for ms in 0..self.ispin {
                for _ in 0..self.neq[ms] {
                    let dn_ms = &mut dn12[ms * n2ft3d..(ms + 1) * n2ft3d];
                    for (o, (p0, p1)) in dn_ms.iter_mut().zip(
                        psir0[indx1..indx1 + n2ft3d]
                            .iter()
                            .zip(psir1[indx1..indx1 + n2ft3d].iter()),
                    ) {
                        *o += alpha * 2.0 * p0 * p1;
                    }
                    indx1 += n2ft3d;
                }
            }
        }
        self.grid
            .parall()
            .vector_sum_all(Axis::J, &mut dn12[..self.ispin * n2ft3d]);
        self.grid
            .parall()
            .vector_sum_all(Axis::K, &mut dn12[..self.ispin * n2ft3d]);
    }

    // ---- overlap products ---------------------------------------------

    pub fn ggm_multiply(&mut self, psi1: &[f64], psi2: &[f64], hml: &mut [f64]) {
        self.ffm_multiply(-1, psi1, psi2, hml);
    }

    pub fn ggm_sym_multiply(&mut self, psi1: &[f64], psi2: &[f64], hml: &mut [f64]) {
        self.ffm_sym_multiply(-1, psi1, psi2, hml);
    }

    pub fn ffm_multiply(&mut self, mb: i32, psi1: &[f64], psi2: &[f64], hml: &mut [f64]) {
        let ctx = self.ctx();
        let (ms1, ms2, ishift) = spin_bounds(mb, self.ispin, self.ne);
        for ms in ms1..ms2 {
            let mshift = if mb == -1 { ms * ishift } else { 0 };
            let n = self.ne[ms];
            tn_block(&ctx, 0, ms, psi1, psi2, &mut hml[mshift..mshift + n * n]);
        }
    }

    pub fn ffm_sym_multiply(&mut self, mb: i32, psi1: &[f64], psi2: &[f64], hml: &mut [f64]) {
        self.ffm_multiply(mb, psi1, psi2, hml);
        let (ms1, ms2, ishift) = spin_bounds(mb, self.ispin, self.ne);
        for ms in ms1..ms2 {
            let mshift = if mb == -1 { ms * ishift } else { 0 };
            symmetrize_upper_to_lower(&mut hml[mshift..], self.ne[ms]);
        }
    }

    fn ffm3_core(
        ctx: &MatCtx,
        nbq: usize,
        ms: usize,
        psi1: &[f64],
        psi2: &[f64],
        s11: &mut [f64],
        s21: &mut [f64],
        s22: &mut [f64],
    ) {
        tn_block(ctx, nbq, ms, psi1, psi1, s11);
        tn_block(ctx, nbq, ms, psi1, psi2, s21);
        tn_block(ctx, nbq, ms, psi2, psi2, s22);
        let n = ctx.ne[ms];
        symmetrize_upper_to_lower(s11, n);
        symmetrize_upper_to_lower(s21, n);
        symmetrize_upper_to_lower(s22, n);
    }

    /// Fused overlaps `s11 = psi1^T psi1`, `s21 = psi1^T psi2`,
    /// `s22 = psi2^T psi2` for spin block `mb` of slot 0.
    pub fn ffm3_sym_multiply(
        &mut self,
        mb: i32,
        psi1: &[f64],
        psi2: &[f64],
        s11: &mut [f64],
        s21: &mut [f64],
        s22: &mut [f64],
    ) {
        let ctx = self.ctx();
        let (ms1, ms2, ishift) = spin_bounds(mb, self.ispin, self.ne);
        for ms in ms1..ms2 {
            let mshift = if mb == -1 { ms * ishift } else { 0 };
            Self::ffm3_core(
                &ctx,
                0,
                ms,
                psi1,
                psi2,
                &mut s11[mshift..],
                &mut s21[mshift..],
                &mut s22[mshift..],
            );
        }
    }

    /// Fused overlaps of all four cross products.
    pub fn ffm4_sym_multiply(
        &mut self,
        mb: i32,
        psi1: &[f64],
        psi2: &[f64],
        s11: &mut [f64],
        s21: &mut [f64],
        s12: &mut [f64],
        s22: &mut [f64],
    ) {
        let ctx = self.ctx();
        let (ms1, ms2, ishift) = spin_bounds(mb, self.ispin, self.ne);
        for ms in ms1..ms2 {
            let mshift = if mb == -1 { ms * ishift } else { 0 };
            let n = self.ne[ms];
            tn_block(&ctx, 0, ms, psi1, psi1, &mut s11[mshift..mshift + n * n]);
            tn_block(&ctx, 0, ms, psi1, psi2, &mut s21[mshift..mshift + n * n]);
            tn_block(&ctx, 0, ms, psi2, psi1, &mut s12[mshift..mshift + n * n]);
            tn_block(&ctx, 0, ms, psi2, psi2, &mut s22[mshift..mshift + n * n]);
            symmetrize_upper_to_lower(&mut s11[mshift..], n);
            symmetrize_upper_to_lower(&mut s21[mshift..], n);
            symmetrize_upper_to_lower(&mut s12[mshift..], n);
            symmetrize_upper_to_lower(&mut s22[mshift..], n);
        }
    }

    /// `psi2 <- alpha psi1 . hml + beta psi2`, per spin block, slot 0.
    pub fn fmf_multiply(
        &mut self,
        mb: i32,
        psi1: &[f64],
        hml: &[f64],
        alpha: f64,
        psi2: &mut [f64],
        beta: f64,
    ) {
        let ctx = self.ctx();
        let (ms1, ms2, ishift) = spin_bounds(mb, self.ispin, self.ne);
        for ms in ms1..ms2 {
            let mshift = if mb == -1 { ms * ishift } else { 0 };
            nn_block(&ctx, 0, ms, alpha, psi1, &hml[mshift..], beta, psi2);
        }
    }

    // ---- dense matrix helpers -----------------------------------------

    pub fn m_scal(&self, alpha: f64, hml: &mut [f64]) {
        for x in hml[..self.m_size(-1)].iter_mut() {
            *x *= alpha;
        }
    }

    pub fn m_trace(&self, hml: &[f64]) -> f64 {
        let mut sum = 0.0;
        let mut mshift = 0;
        for ms in 0..self.ispin {
            let n = self.ne[ms];
            for i in 0..n {
                sum += hml[mshift + i + i * n];
            }
            mshift += self.ne[0] * self.ne[0];
        }
        sum
    }

    /// Diagonalise per spin block on the master rank and broadcast the
    /// eigenpairs.
    pub fn m_diagonalize(&mut self, hml: &mut [f64], eig: &mut [f64]) -> Result<()> {
        let parall = self.grid.parall().clone();
        let nn = self.m_size(-1);
        let n = self.ne[0] + self.ne[1];
        if parall.is_master() {
            self.grid
                .device()
                .borrow_mut()
                .nn_eigensolver(self.ispin, &self.ne, hml, eig)?;
        }
        parall.brdcst_values(Axis::Global, 0, &mut hml[..nn]);
        parall.brdcst_values(Axis::Global, 0, &mut eig[..n]);
        Ok(())
    }

    pub fn mm_transpose(&self, mb: i32, a: &[f64], b: &mut [f64]) {
        let (ms1, ms2, ishift) = spin_bounds(mb, self.ispin, self.ne);
        for ms in ms1..ms2 {
            let shift = if mb == -1 { ms * ishift } else { 0 };
            let n = self.ne[ms];
            for j in 0..n {
                for i in 0..n {
                    b[shift + i + j * n] = a[shift + j + i * n];
                }
            }
        }
    }

    pub fn mmm_multiply(&self, mb: i32, a: &[f64], b: &[f64], alpha: f64, c: &mut [f64], beta: f64) {
        let (ms1, ms2, ishift) = spin_bounds(mb, self.ispin, self.ne);
        let device = self.grid.device().clone();
        for ms in ms1..ms2 {
            let shift = if mb == -1 { ms * ishift } else { 0 };
            let n = self.ne[ms];
            if n > 0 {
                device.borrow_mut().nn_dgemm(
                    n,
                    n,
                    alpha,
                    &a[shift..shift + n * n],
                    &b[shift..shift + n * n],
                    beta,
                    &mut c[shift..shift + n * n],
                );
            }
        }
    }

    /// `c <- alpha a^T b + beta c` per spin block.
    pub fn mmm_multiply2(
        &self,
        mb: i32,
        a: &[f64],
        b: &[f64],
        alpha: f64,
        c: &mut [f64],
        beta: f64,
    ) {
        let (ms1, ms2, ishift) = spin_bounds(mb, self.ispin, self.ne);
        let device = self.grid.device().clone();
        for ms in ms1..ms2 {
            let shift = if mb == -1 { ms * ishift } else { 0 };
            let n = self.ne[ms];
            if n > 0 {
                device.borrow_mut().tn1_dgemm(
                    n,
                    n,
                    alpha,
                    &a[shift..shift + n * n],
                    &b[shift..shift + n * n],
                    beta,
                    &mut c[shift..shift + n * n],
                );
            }
        }
    }

    /// Average the off-diagonal halves of `a` and `b` (the
    /// B-symmetrisation used when the operator is non-Hermitian across
    /// orbitals).
    pub fn mm_kiril_btransform(&self, mb: i32, a: &mut [f64], b: &mut [f64]) {
        let (ms1, ms2, ishift) = spin_bounds(mb, self.ispin, self.ne);
        for ms in ms1..ms2 {
            let shift = if mb == -1 { ms * ishift } else { 0 };
            let n = self.ne[ms];
            for i in 0..n {
                for j in 0..i {
                    let indx = shift + i + j * n;
                    let indxt = shift + j + i * n;
                    let tmp = 0.5 * (a[indx] + b[indx]);
                    let tmpt = 0.5 * (a[indxt] + b[indxt]);
                    a[indx] = tmp;
                    b[indx] = tmp;
                    a[indxt] = tmpt;
                    b[indxt] = tmpt;
                }
            }
        }
    }

    // ---- Gram-Schmidt and the Lagrange constraint ---------------------

    /// Reverse modified Gram-Schmidt within each spin block, per
    /// Brillouin slot. When the orbitals are sharded over axis `j` the
    /// owner of the pivot column broadcasts it before the projection
    /// sweep.
    pub fn g_ortho(&mut self, psi: &mut [f64]) {
        let npack2 = self.npack2();
        if self.parallelized {
            let parall = self.grid.parall().clone();
            let np_j = parall.np_j() as i64;
            let taskid_j = parall.taskid_j() as i64;
            let mut tmp = vec![0.0; npack2];

            for nbq in 0..self.nbrillq {
                for ms in 0..self.ispin {
                    let counts = self.omap.counts(ms).to_vec();
                    let shift0 = self.ctx().spin_offset(nbq, ms);
                    let mut kcur = np_j - 1;
                    let mut kk = counts[kcur as usize] as i64 - 1;
                    while kk < 0 && kcur > 0 {
                        kcur -= 1;
                        kk = counts[kcur as usize] as i64 - 1;
                    }

                    for k in (0..self.ne[ms] as i64).rev() {
                        if kcur == taskid_j {
                            let indxk = shift0 + npack2 * kk as usize;
                            let w = self
                                .grid
                                .cc_pack_dot(nbq + 1, &psi[indxk..], &psi[indxk..]);
                            let w = 1.0 / w.sqrt();
                            self.grid.c_pack_smul(nbq + 1, w, &mut psi[indxk..]);
                            tmp.copy_from_slice(&psi[indxk..indxk + npack2]);
                        }
                        if kcur > 0 {
                            parall.brdcst_values(Axis::J, kcur as usize, &mut tmp);
                        }

                        let mut jj = kk - 1;
                        let mut jcur = kcur;
                        while jj < 0 && jcur > 0 {
                            jcur -= 1;
                            jj = counts[jcur as usize] as i64 - 1;
                        }
                        for _j in (0..k).rev() {
                            if jcur == taskid_j {
                                let indxj = shift0 + npack2 * jj as usize;
                                let w =
                                    -self.grid.cc_pack_dot(nbq + 1, &tmp, &psi[indxj..]);
                                self.grid
                                    .cc_pack_daxpy(nbq + 1, w, &tmp, &mut psi[indxj..]);
                            }
                            jj -= 1;
                            while jj < 0 && jcur > 0 {
                                jcur -= 1;
                                jj = counts[jcur as usize] as i64 - 1;
                            }
                        }

                        kk -= 1;
                        while kk < 0 && kcur > 0 {
                            kcur -= 1;
                            kk = counts[kcur as usize] as i64 - 1;
                        }
                    }
                }
            }
        } else {
            for nbq in 0..self.nbrillq {
                for ms in 0..self.ispin {
                    let ishift = self.ctx().spin_offset(nbq, ms);
                    for k in (0..self.ne[ms]).rev() {
                        let indxk = ishift + npack2 * k;
                        let w = self
                            .grid
                            .cc_pack_dot(nbq + 1, &psi[indxk..], &psi[indxk..]);
                        let w = 1.0 / w.sqrt();
                        self.grid.c_pack_smul(nbq + 1, w, &mut psi[indxk..]);

                        for j in (0..k).rev() {
                            let indxj = ishift + npack2 * j;
                            let (head, tail) = psi.split_at_mut(indxj + npack2);
                            let pk = &tail[indxk - indxj - npack2..];
                            let col_j = &mut head[indxj..];
                            let w = -self.grid.cc_pack_idot(nbq + 1, pk, col_j);
                            let w = self.grid.parall().sum_all(Axis::I, w);
                            self.grid.cc_pack_daxpy(nbq + 1, w, pk, col_j);
                        }
                    }
                }
            }
        }
    }

    /// Scale the overlap residuals into the fixed-point form of the
    /// Lagrange iteration.
    pub fn m_scale_s22_s21_s11(
        &self,
        mb: i32,
        dte: f64,
        s22: &mut [f64],
        s21: &mut [f64],
        s11: &mut [f64],
    ) {
        scale_residuals(self.ispin, self.ne, mb, dte, s22, s21, None, s11);
    }

    pub fn m_scale_s22_s21_s12_s11(
        &self,
        mb: i32,
        dte: f64,
        s22: &mut [f64],
        s21: &mut [f64],
        s12: &mut [f64],
        s11: &mut [f64],
    ) {
        scale_residuals(self.ispin, self.ne, mb, dte, s22, s21, Some(s12), s11);
    }

    /// Restore orthonormality of `psi2` after a Verlet step by the
    /// iterated Lagrange-multiplier fixed point, then apply the
    /// correction `psi2 += dte psi1 lambda`.
    pub fn ggm_lambda(&mut self, dte: f64, psi1: &[f64], psi2: &mut [f64], lmbda: &mut [f64]) {
        self.lambda_inner(dte, psi1, psi2, lmbda, false);
    }

    /// Variant with the Kiril B-symmetrisation of the cross overlaps,
    /// for operators that are non-Hermitian across orbitals.
    pub fn ggm_lambda_sic(&mut self, dte: f64, psi1: &[f64], psi2: &mut [f64], lmbda: &mut [f64]) {
        self.lambda_inner(dte, psi1, psi2, lmbda, true);
    }

    fn lambda_inner(
        &mut self,
        dte: f64,
        psi1: &[f64],
        psi2: &mut [f64],
        lmbda: &mut [f64],
        sic: bool,
    ) {
        let ne = self.ne;
        let ispin = self.ispin;
        let nbrillq = self.nbrillq;
        let lm_stride = self.m_size(-1);

        for nbq in 0..nbrillq {
            for ms in 0..ispin {
                let n = ne[ms];
                let nn = n * n;
                let ctx = MatCtx {
                    grid: &self.grid,
                    omap: &self.omap,
                    ispin,
                    ne,
                    neq: self.neq,
                    parallelized: self.parallelized,
                };
                let views = overlap_views(&mut self.arena, ne[0] * ne[0]);
                let OverlapViews {
                    s22,
                    s21,
                    s12,
                    s11,
                    sa1,
                    sa0,
                    st1,
                } = views;

                if sic {
                    tn_block(&ctx, nbq, ms, psi1, psi1, &mut s11[..nn]);
                    tn_block(&ctx, nbq, ms, psi2, psi1, &mut s21[..nn]);
                    tn_block(&ctx, nbq, ms, psi1, psi2, &mut s12[..nn]);
                    tn_block(&ctx, nbq, ms, psi2, psi2, &mut s22[..nn]);
                    for s in [&mut s11[..nn], &mut s21[..nn], &mut s12[..nn], &mut s22[..nn]] {
                        symmetrize_upper_to_lower(s, n);
                    }
                    kiril_btransform(n, &mut s12[..nn], &mut s21[..nn]);
                    scale_residuals(
                        ispin,
                        ne,
                        ms as i32,
                        dte,
                        &mut s22[..nn],
                        &mut s21[..nn],
                        Some(&mut s12[..nn]),
                        &mut s11[..nn],
                    );
                } else {
                    tn_block(&ctx, nbq, ms, psi1, psi1, &mut s11[..nn]);
                    tn_block(&ctx, nbq, ms, psi1, psi2, &mut s21[..nn]);
                    tn_block(&ctx, nbq, ms, psi2, psi2, &mut s22[..nn]);
                    for s in [&mut s11[..nn], &mut s21[..nn], &mut s22[..nn]] {
                        symmetrize_upper_to_lower(s, n);
                    }
                    scale_residuals(
                        ispin,
                        ne,
                        ms as i32,
                        dte,
                        &mut s22[..nn],
                        &mut s21[..nn],
                        None,
                        &mut s11[..nn],
                    );
                    s12[..nn].copy_from_slice(&s21[..nn]);
                }

                sa0[..nn].copy_from_slice(&s22[..nn]);

                let mut adiff = 0.0;
                let mut done = false;
                let mut ii = 0;
                while !done && ii < ITERLMD {
                    ii += 1;
                    sa1[..nn].copy_from_slice(&s22[..nn]);
                    self.grid.device().borrow_mut().mm6_dgemm(
                        n,
                        &s12[..nn],
                        &s12[..nn],
                        &s11[..nn],
                        &sa0[..nn],
                        &mut sa1[..nn],
                        &mut st1[..nn],
                    );
                    adiff = 0.0;
                    for i in 0..nn {
                        let d = (sa1[i] - sa0[i]).abs();
                        if d > adiff {
                            adiff = d;
                        }
                    }
                    if adiff < CONVGLMD {
                        done = true;
                    } else {
                        sa0[..nn].copy_from_slice(&sa1[..nn]);
                    }
                }
                if !done && adiff >= CONVGLMD2 {
                    warn!(adiff, iterations = ii, "lambda iteration did not converge");
                }

                let lshift = nbq * lm_stride + ms * ne[0] * ne[0];
                lmbda[lshift..lshift + nn].copy_from_slice(&sa1[..nn]);
            }
        }

        // Constraint correction.
        let ctx = self.ctx();
        for nbq in 0..nbrillq {
            let lshift = nbq * lm_stride;
            for ms in 0..ispin {
                let mshift = lshift + ms * ne[0] * ne[0];
                nn_block(&ctx, nbq, ms, dte, psi1, &lmbda[mshift..], 1.0, psi2);
            }
        }
    }

    // ---- SVD and diagonalisation wrappers ------------------------------

    /// `a = u diag(s) v^T` through the eigendecomposition of `a^T a`.
    pub fn ggm_svd(
        &mut self,
        a: &[f64],
        u: &mut [f64],
        s: &mut [f64],
        v: &mut [f64],
    ) -> Result<()> {
        self.ggm_sym_multiply(a, a, v);
        self.m_diagonalize(v, s)?;
        self.fmf_multiply(-1, a, v, 1.0, u, 0.0);

        let npack2 = self.npack2();
        let nloc = self.neq[0] + self.neq[1];
        let mut norms = vec![0.0; nloc];
        for (n, norm) in norms.iter_mut().enumerate() {
            *norm = self.grid.cc_pack_idot(1, &u[n * npack2..], &u[n * npack2..]);
        }
        self.grid.parall().vector_sum_all(Axis::I, &mut norms);
        for (n, norm) in norms.iter().enumerate() {
            self.grid
                .c_pack_smul(1, 1.0 / norm.sqrt(), &mut u[n * npack2..]);
        }

        for x in s[..self.ne[0] + self.ne[1]].iter_mut() {
            *x = x.abs().sqrt();
        }
        Ok(())
    }

    // ---- Stiefel (skew rotation) toolkit -------------------------------

    /// Modified Gram-Schmidt QR of the packed columns `q`, upper factor
    /// into `r`.
    pub fn fm_qr(&mut self, mb: i32, q: &mut [f64], r: &mut [f64]) -> Result<()> {
        if self.parallelized {
            return Err(Error::UnsupportedParallel(
                "fm_QR over a sharded orbital axis",
            ));
        }
        let npack2 = self.npack2();
        let (ms1, ms2, ishift2) = spin_bounds(mb, self.ispin, self.ne);
        for x in r[..self.m_size(mb)].iter_mut() {
            *x = 0.0;
        }
        for ms in ms1..ms2 {
            let ishift = ms * self.ne[0] * npack2;
            let rshift = if mb == -1 { ms * ishift2 } else { 0 };
            let n = self.ne[ms];
            for k in 0..n {
                let indxk = ishift + npack2 * k;
                let w = self.grid.cc_pack_dot(1, &q[indxk..], &q[indxk..]);
                let w = w.sqrt();
                r[rshift + k + k * n] = w;
                self.grid.c_pack_smul(1, 1.0 / w, &mut q[indxk..]);

                for j in k + 1..n {
                    let indxj = ishift + npack2 * j;
                    let (head, tail) = q.split_at_mut(indxj);
                    let col_k = &head[indxk..indxk + npack2];
                    let col_j = &mut tail[..npack2];
                    let w = self.grid.cc_pack_idot(1, col_k, col_j);
                    let w = self.grid.parall().sum_all(Axis::I, w);
                    r[rshift + k + j * n] = w;
                    self.grid.cc_pack_daxpy(1, -w, col_k, col_j);
                }
            }
        }
        Ok(())
    }

    /// Assemble `T = [[A, -R^T], [R, 0]]` in `2n x 2n` blocks.
    pub fn mmm4_ar_to_t4(&self, mb: i32, a: &[f64], r: &[f64], t4: &mut [f64]) {
        let (ms1, ms2, ishift1, ishift2) = if mb == -1 {
            let z = self.ne[0] * self.ne[0];
            for x in t4[..4 * z + self.ne[1] * self.ne[1]].iter_mut() {
                *x = 0.0;
            }
            (0, self.ispin, z, 4 * z)
        } else {
            let n = self.ne[mb as usize];
            for x in t4[..4 * n * n].iter_mut() {
                *x = 0.0;
            }
            // The single-block path clears the output and performs no
            // block iteration.
            (mb as usize, mb as usize, 0, 0)
        };
        for ms in ms1..ms2 {
            let n = self.ne[ms];
            let asub = &a[ms * ishift1..];
            let rsub = &r[ms * ishift1..];
            let tsub = &mut t4[ms * ishift2..];
            for j in 0..n {
                for i in 0..n {
                    tsub[i + j * 2 * n] = asub[i + j * n];
                    tsub[(i + n) + j * 2 * n] = rsub[i + j * n];
                    tsub[i + (j + n) * 2 * n] = -rsub[j + i * n];
                }
            }
        }
    }

    /// Factor a skew matrix `K` into the rotation generators `V, W,
    /// Sigma` with `exp(K t) = V cos(Sigma t) V^T-style combination`.
    pub fn m4_factorskew(
        &self,
        mb: i32,
        k4: &[f64],
        v4: &mut [f64],
        w4: &mut [f64],
        sigma: &mut [f64],
    ) -> Result<()> {
        let (ms1, ms2, ishift1, ishift2) = if mb == -1 {
            (0, self.ispin, 2 * self.ne[0], 4 * self.ne[0] * self.ne[0])
        } else {
            (mb as usize, mb as usize, 0, 0)
        };
        for ms in ms1..ms2 {
            let n = 2 * self.ne[ms];
            let s1 = ms * ishift1;
            let s2 = ms * ishift2;
            factor_skew(
                n,
                &k4[s2..s2 + n * n],
                &mut v4[s2..s2 + n * n],
                &mut w4[s2..s2 + n * n],
                &mut sigma[s1..s1 + n],
            )?;
        }
        Ok(())
    }

    /// `R(t) = V A^T + W B^T` with `A = V cos(Sigma t) + W sin(Sigma t)`
    /// and `B = W cos(Sigma t) - V sin(Sigma t)`.
    pub fn m4_rotationskew(
        &self,
        mb: i32,
        t: f64,
        v4: &[f64],
        w4: &[f64],
        sigma: &[f64],
        a4: &mut [f64],
        b4: &mut [f64],
        r4: &mut [f64],
    ) {
        let (ms1, ms2, ishift1, ishift2, nj) = if mb == -1 {
            (
                0,
                self.ispin,
                2 * self.ne[0],
                4 * self.ne[0] * self.ne[0],
                2 * (self.ne[0] + self.ne[1]),
            )
        } else {
            (mb as usize, mb as usize, 0, 0, 2 * self.ne[mb as usize])
        };
        let mut sa = vec![0.0; nj];
        let mut sb = vec![0.0; nj];
        for (i, (ca, cb)) in sa.iter_mut().zip(sb.iter_mut()).enumerate() {
            *ca = (sigma[i] * t).cos();
            *cb = (sigma[i] * t).sin();
        }

        let device = self.grid.device().clone();
        for ms in ms1..ms2 {
            let n = 2 * self.ne[ms];
            let s1 = ms * ishift1;
            let s2 = ms * ishift2;
            for j in 0..n {
                for i in 0..n {
                    let indx = s2 + i + j * n;
                    a4[indx] = v4[indx] * sa[s1 + j] + w4[indx] * sb[s1 + j];
                    b4[indx] = w4[indx] * sa[s1 + j] - v4[indx] * sb[s1 + j];
                }
            }
            // R = V A^T + W B^T
            let mut dev = device.borrow_mut();
            dev.nt_dgemm(
                n,
                n,
                n,
                1.0,
                &v4[s2..s2 + n * n],
                &a4[s2..s2 + n * n],
                0.0,
                &mut r4[s2..s2 + n * n],
            );
            dev.nt_dgemm(
                n,
                n,
                n,
                1.0,
                &w4[s2..s2 + n * n],
                &b4[s2..s2 + n * n],
                1.0,
                &mut r4[s2..s2 + n * n],
            );
        }
    }

    /// Extract the `M` (upper-left) and `N` (lower-left) `n x n` blocks
    /// of the `2n x 2n` rotation.
    pub fn m4_r4_to_mn(&self, mb: i32, r4: &[f64], m: &mut [f64], n_out: &mut [f64]) {
        let (ms1, ms2, ishift1, ishift2) = if mb == -1 {
            (0, self.ispin, self.ne[0] * self.ne[0], 4 * self.ne[0] * self.ne[0])
        } else {
            (mb as usize, mb as usize, 0, 0)
        };
        for ms in ms1..ms2 {
            let n = self.ne[ms];
            let s1 = ms * ishift1;
            let s2 = ms * ishift2;
            for j in 0..n {
                for i in 0..n {
                    m[s1 + i + j * n] = r4[s2 + i + j * 2 * n];
                    n_out[s1 + i + j * n] = r4[s2 + (i + n) + j * 2 * n];
                }
            }
        }
    }

    /// `A = cos(S t) Vt`, `B = sin(S t) Vt` row-scaled variants used by
    /// the rotation integrators.
    pub fn mm_sctimesvtrans(
        &self,
        mb: i32,
        t: f64,
        s: &[f64],
        vt: &[f64],
        a: &mut [f64],
        b: &mut [f64],
        sa: &mut [f64],
        sb: &mut [f64],
    ) {
        self.sctimesvtrans_with(mb, t, s, vt, a, b, sa, sb, |sj, t| {
            ((sj * t).cos(), (sj * t).sin())
        });
    }

    /// `S sin / S cos` variant.
    pub fn mm_sctimesvtrans2(
        &self,
        mb: i32,
        t: f64,
        s: &[f64],
        vt: &[f64],
        a: &mut [f64],
        b: &mut [f64],
        sa: &mut [f64],
        sb: &mut [f64],
    ) {
        self.sctimesvtrans_with(mb, t, s, vt, a, b, sa, sb, |sj, t| {
            (sj * (sj * t).sin(), sj * (sj * t).cos())
        });
    }

    /// `sin / 1 - cos` variant.
    pub fn mm_sctimesvtrans3(
        &self,
        mb: i32,
        t: f64,
        s: &[f64],
        vt: &[f64],
        a: &mut [f64],
        b: &mut [f64],
        sa: &mut [f64],
        sb: &mut [f64],
    ) {
        self.sctimesvtrans_with(mb, t, s, vt, a, b, sa, sb, |sj, t| {
            ((sj * t).sin(), 1.0 - (sj * t).cos())
        });
    }

    fn sctimesvtrans_with<F>(
        &self,
        mb: i32,
        t: f64,
        s: &[f64],
        vt: &[f64],
        a: &mut [f64],
        b: &mut [f64],
        sa: &mut [f64],
        sb: &mut [f64],
        f: F,
    ) where
        F: Fn(f64, f64) -> (f64, f64),
    {
        let (ms1, ms2, ishift2) = spin_bounds(mb, self.ispin, self.ne);
        let ishift1 = if mb == -1 { self.ne[0] } else { 0 };
        let nj = if mb == -1 {
            self.ne[0] + self.ne[1]
        } else {
            self.ne[mb as usize]
        };
        for j in 0..nj {
            let (va, vb) = f(s[j], t);
            sa[j] = va;
            sb[j] = vb;
        }
        for ms in ms1..ms2 {
            let shift1 = ms * ishift1;
            let shift2 = ms * ishift2;
            let n = self.ne[ms];
            for k in 0..n {
                for j in 0..n {
                    let indx2 = shift2 + j + k * n;
                    a[indx2] = sa[shift1 + j] * vt[indx2];
                    b[indx2] = sb[shift1 + j] * vt[indx2];
                }
            }
        }
    }

    // ---- bootstrap ----------------------------------------------------

    /// Fill `psi` with reproducible random orbitals: real-space noise,
    /// forward transform, pack, and the Gamma-point cleanup of the zero
    /// wavevector.
    pub fn g_generate_random(&self, psi: &mut [f64]) -> Result<()> {
        let parall = self.grid.parall().clone();
        let npack2 = self.npack2();
        let mut tmp = vec![0.0; self.grid.n2ft3d];
        for nb in 0..self.grid.nbrillouin() {
            let pk = self.grid.ktop(nb);
            let qk = self.grid.ktoindex(nb);
            for ms in 0..self.ispin {
                for n in 0..self.ne[ms] {
                    let pj = self.omap.msntop(ms, n);
                    let qj = self.omap.msntoindex(ms, n);
                    if pj == parall.taskid_j() && pk == parall.taskid_k() {
                        let seed =
                            91 + parall.taskid() as u64 + 7919 * (n + ms * self.ne[0] + nb) as u64;
                        self.grid.r_setrandom(seed, &mut tmp);
                        self.grid.rc_fft3d(&mut tmp)?;
                        self.grid.c_pack(qk + 1, &mut tmp);
                        let indx = self.col_offset(qk, qj);
                        self.grid.cc_pack_copy(qk + 1, &tmp, &mut psi[indx..]);
                        self.grid.c_pack_noimagzero(qk + 1, &mut psi[indx..]);
                    }
                }
            }
        }
        Ok(())
    }
}

fn kiril_btransform(n: usize, a: &mut [f64], b: &mut [f64]) {
    for i in 0..n {
        for j in 0..i {
            let indx = i + j * n;
            let indxt = j + i * n;
            let tmp = 0.5 * (a[indx] + b[indx]);
            a[indx] = tmp;
            b[indx] = tmp;
            let tmpt = 0.5 * (a[indxt] + b[indxt]);
            a[indxt] = tmpt;
            b[indxt] = tmpt;
        }
    }
}

/// Diagonal/off-diagonal scaling of the overlap residuals entering the
/// fixed-point iteration: diagonals measure the deviation from
/// orthonormality, off-diagonals are plain scalings.
fn scale_residuals(
    ispin: usize,
    ne: [usize; 2],
    mb: i32,
    dte: f64,
    s22: &mut [f64],
    s21: &mut [f64],
    mut s12: Option<&mut [f64]>,
    s11: &mut [f64],
) {
    let (ms1, ms2, ishift2) = spin_bounds(mb, ispin, ne);
    for ms in ms1..ms2 {
        let n = ne[ms];
        let mut indx0 = if mb == -1 { ms * ishift2 } else { 0 };
        for k in 0..n {
            s22[indx0] = (1.0 - s22[indx0]) * (0.5 / dte);
            s21[indx0] = (1.0 - s21[indx0]) * 0.5;
            if let Some(s12) = s12.as_mut() {
                s12[indx0] = (1.0 - s12[indx0]) * 0.5;
            }
            s11[indx0] *= -0.5 * dte;

            let mut indx = indx0 + 1;
            let mut indxt = indx0 + n;
            for _j in k + 1..n {
                s22[indx] *= -0.5 / dte;
                s22[indxt] *= -0.5 / dte;
                s21[indx] *= -0.5;
                s21[indxt] *= -0.5;
                if let Some(s12) = s12.as_mut() {
                    s12[indx] *= -0.5;
                    s12[indxt] *= -0.5;
                }
                s11[indx] *= -0.5 * dte;
                s11[indxt] *= -0.5 * dte;
                indx += 1;
                indxt += n;
            }
            indx0 += n + 1;
        }
    }
}

/// Real skew-matrix factorisation via the real Schur form: `K = sum_j
/// sigma_j (v_j w_j^T - w_j v_j^T)` with orthonormal pair columns.
fn factor_skew(
    n: usize,
    k4: &[f64],
    v4: &mut [f64],
    w4: &mut [f64],
    sigma: &mut [f64],
) -> Result<()> {
    use nalgebra::DMatrix;
    let m = DMatrix::from_column_slice(n, n, k4);
    let schur = nalgebra::Schur::try_new(m, 1.0e-14, 100_000).ok_or(Error::Eigensolver { n })?;
    let (q, t) = schur.unpack();

    for x in v4[..n * n].iter_mut() {
        *x = 0.0;
    }
    for x in w4[..n * n].iter_mut() {
        *x = 0.0;
    }
    let inv_sqrt2 = 1.0 / 2.0f64.sqrt();

    let mut j = 0;
    while j < n {
        let paired = j + 1 < n && t[(j + 1, j)].abs() > 1.0e-12;
        if paired {
            let sg = t[(j, j + 1)];
            sigma[j] = sg;
            sigma[j + 1] = sg;
            for i in 0..n {
                let q1 = q[(i, j)] * inv_sqrt2;
                let q2 = q[(i, j + 1)] * inv_sqrt2;
                v4[i + j * n] = q1;
                w4[i + j * n] = q2;
                v4[i + (j + 1) * n] = q2;
                w4[i + (j + 1) * n] = -q1;
            }
            j += 2;
        } else {
            sigma[j] = 0.0;
            for i in 0..n {
                v4[i + j * n] = q[(i, j)];
            }
            j += 1;
        }
    }
    Ok(())
}
