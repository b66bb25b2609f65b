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

//! Per-ion structure factor `S_i(G) = exp(i G . R_i)`, stored as the
//! outer product of three 1D phase tables and projected onto packed
//! indices.
//!
//! `phafac` must be called after every ionic move.

use crate::ion::Ion;
use crate::pgrid::PackedGrid;

pub struct Strfac {
    nion: usize,
    nx: usize,
    ny: usize,
    nz: usize,
    unitg: [f64; 9],
    /// Phase tables, one complex row of length `n_axis` per ion.
    wx1: Vec<f64>,
    wy1: Vec<f64>,
    wz1: Vec<f64>,
    /// Packed index -> 1D table offsets, per grid index.
    i_indx: Vec<Vec<i64>>,
    j_indx: Vec<Vec<i64>>,
    k_indx: Vec<Vec<i64>>,
    npack: Vec<usize>,
}

impl Strfac {
    /// Precompute the packed index projections for the density grid and
    /// every local Brillouin slot. The phase tables themselves are filled
    /// by [`Strfac::phafac`].
    pub fn new(ion: &Ion, grid: &PackedGrid) -> Strfac {
        let (nx, ny, nz) = (grid.nx, grid.ny, grid.nz);
        let taskid_i = grid.parall().taskid_i();
        let maxsize = grid.nbrillq() + 1;

        let mut i_indx = Vec::with_capacity(maxsize);
        let mut j_indx = Vec::with_capacity(maxsize);
        let mut k_indx = Vec::with_capacity(maxsize);
        let mut npack = Vec::with_capacity(maxsize);

        let mut ii_indx = vec![0i64; grid.nfft3d];
        let mut jj_indx = vec![0i64; grid.nfft3d];
        let mut kk_indx = vec![0i64; grid.nfft3d];
        for nb in 0..maxsize {
            for k in 0..nz {
                for j in 0..ny {
                    for i in 0..nx / 2 + 1 {
                        if grid.cijktop(i, j, k) == taskid_i {
                            let indx = grid.cijktoindex(i, j, k);
                            ii_indx[indx] = i as i64;
                            jj_indx[indx] = j as i64;
                            kk_indx[indx] = k as i64;
                        }
                    }
                }
            }
            grid.i_pack(nb, &mut ii_indx);
            grid.i_pack(nb, &mut jj_indx);
            grid.i_pack(nb, &mut kk_indx);
            let n = grid.npack(nb);
            let mut iv = vec![0i64; n];
            let mut jv = vec![0i64; n];
            let mut kv = vec![0i64; n];
            grid.ii_pack_copy(nb, &ii_indx, &mut iv);
            grid.ii_pack_copy(nb, &jj_indx, &mut jv);
            grid.ii_pack_copy(nb, &kk_indx, &mut kv);
            i_indx.push(iv);
            j_indx.push(jv);
            k_indx.push(kv);
            npack.push(n);
        }

        Strfac {
            nion: ion.nion(),
            nx,
            ny,
            nz,
            unitg: grid.lattice.unitg_flat(),
            wx1: vec![0.0; 2 * ion.nion() * nx],
            wy1: vec![0.0; 2 * ion.nion() * ny],
            wz1: vec![0.0; 2 * ion.nion() * nz],
            i_indx,
            j_indx,
            k_indx,
            npack,
        }
    }

    /// Rebuild the phase tables from the current ionic positions: seed at
    /// the origin, advance by the per-axis phase recurrence, mirror the
    /// conjugate half and zero the Nyquist row.
    pub fn phafac(&mut self, ion: &Ion) {
        let pi = std::f64::consts::PI;
        let (nx, ny, nz) = (self.nx, self.ny, self.nz);
        let (nxh, nyh, nzh) = (nx / 2, ny / 2, nz / 2);

        for i in 0..self.nion {
            let r = ion.rion1(i);
            let sw1 = self.unitg[0] * r[0] + self.unitg[1] * r[1] + self.unitg[2] * r[2] + pi;
            let sw2 = self.unitg[3] * r[0] + self.unitg[4] * r[1] + self.unitg[5] * r[2] + pi;
            let sw3 = self.unitg[6] * r[0] + self.unitg[7] * r[1] + self.unitg[8] * r[2] + pi;

            let (cw1x, cw1y) = (sw1.cos(), sw1.sin());
            let (cw2x, cw2y) = (sw2.cos(), sw2.sin());
            let (cw3x, cw3y) = (sw3.cos(), sw3.sin());

            fill_axis(&mut self.wx1[2 * i * nx..2 * (i + 1) * nx], nx, nxh, cw1x, cw1y);
            fill_axis(&mut self.wy1[2 * i * ny..2 * (i + 1) * ny], ny, nyh, cw2x, cw2y);
            fill_axis(&mut self.wz1[2 * i * nz..2 * (i + 1) * nz], nz, nzh, cw3x, cw3y);
        }
    }

    /// Assemble the packed structure factor of ion `ii` on grid `nb`.
    pub fn strfac_pack(&self, nb: usize, ii: usize, strx: &mut [f64]) {
        let npack = self.npack[nb];
        let indxi = &self.i_indx[nb];
        let indxj = &self.j_indx[nb];
        let indxk = &self.k_indx[nb];

        let exi = &self.wx1[2 * ii * self.nx..];
        let exj = &self.wy1[2 * ii * self.ny..];
        let exk = &self.wz1[2 * ii * self.nz..];

        for p in 0..npack {
            let ai = exi[2 * indxi[p] as usize];
            let bi = exi[2 * indxi[p] as usize + 1];
            let aj = exj[2 * indxj[p] as usize];
            let bj = exj[2 * indxj[p] as usize + 1];
            let ak = exk[2 * indxk[p] as usize];
            let bk = exk[2 * indxk[p] as usize + 1];
            let c = aj * ak - bj * bk;
            let d = aj * bk + ak * bj;
            strx[2 * p] = ai * c - bi * d;
            strx[2 * p + 1] = ai * d + bi * c;
        }
    }
}

/// Seed `w[0] = 1`, recur `w[k] = w[k-1] * (cx + i cy)`, mirror
/// `w[n-k] = conj(w[k])` and zero the Nyquist entry.
fn fill_axis(w: &mut [f64], n: usize, nh: usize, cx: f64, cy: f64) {
    w[0] = 1.0;
    w[1] = 0.0;
    for k in 1..=nh {
        let a = w[2 * (k - 1)];
        let b = w[2 * (k - 1) + 1];
        w[2 * k] = a * cx - b * cy;
        w[2 * k + 1] = a * cy + b * cx;
        w[2 * (n - k)] = w[2 * k];
        w[2 * (n - k) + 1] = -w[2 * k + 1];
    }
    w[2 * nh] = 0.0;
    w[2 * nh + 1] = 0.0;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Backend, GDevice};
    use crate::lattice::Lattice;
    use crate::mapping::MapKind;
    use crate::parallel::Parallel;
    use float_cmp::assert_approx_eq;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::Arc;

    fn fixture(positions: Vec<[f64; 3]>) -> (PackedGrid, Ion) {
        let unita = [8.0, 0.0, 0.0, 0.0, 8.0, 0.0, 0.0, 0.0, 8.0];
        let lattice = Lattice::new(unita, 20.0, 10.0);
        let grid = PackedGrid::new(
            Arc::new(Parallel::serial()),
            Rc::new(RefCell::new(GDevice::new(Backend::Host))),
            lattice,
            MapKind::Slab,
            1,
            true,
        )
        .unwrap();
        let n = positions.len();
        let ion = Ion::new(
            vec!["H".to_string(); n],
            vec![0; n],
            vec![1.008],
            vec![1.0],
            positions.into_iter().flatten().collect(),
            vec![0.0; 3 * n],
        );
        (grid, ion)
    }

    #[test]
    fn phases_have_unit_modulus_and_real_zero_wave() {
        let (grid, ion) = fixture(vec![[1.3, 0.7, -0.2]]);
        let mut strfac = Strfac::new(&ion, &grid);
        strfac.phafac(&ion);
        let npack = grid.npack(1);
        let mut s = vec![0.0; 2 * npack];
        strfac.strfac_pack(1, 0, &mut s);
        for p in 0..npack {
            let m = s[2 * p] * s[2 * p] + s[2 * p + 1] * s[2 * p + 1];
            assert_approx_eq!(f64, m, 1.0, epsilon = 1e-12);
        }
        // The packed ordering places G = 0 first; its phase is real.
        assert_approx_eq!(f64, s[0], 1.0, epsilon = 1e-12);
        assert_approx_eq!(f64, s[1], 0.0, epsilon = 1e-12);
    }

    #[test]
    fn phase_ratio_matches_displacement() {
        // Scenario: ions at the origin and at (1, 0, 0); for every packed
        // G the ratio S_2 / S_1 must be exp(i G_x).
        let (grid, ion) = fixture(vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0]]);
        let mut strfac = Strfac::new(&ion, &grid);
        strfac.phafac(&ion);
        let npack = grid.npack(1);
        let mut s1 = vec![0.0; 2 * npack];
        let mut s2 = vec![0.0; 2 * npack];
        strfac.strfac_pack(1, 0, &mut s1);
        strfac.strfac_pack(1, 1, &mut s2);
        for (p, g) in grid.gvectors(1).iter().enumerate() {
            // ratio = s2 * conj(s1)  (|s1| = 1)
            let re = s2[2 * p] * s1[2 * p] + s2[2 * p + 1] * s1[2 * p + 1];
            let im = s2[2 * p + 1] * s1[2 * p] - s2[2 * p] * s1[2 * p + 1];
            assert_approx_eq!(f64, re, g[0].cos(), epsilon = 1e-10);
            assert_approx_eq!(f64, im, g[0].sin(), epsilon = 1e-10);
        }
    }

    #[test]
    fn tables_refresh_when_ions_move() {
        let (grid, mut ion) = fixture(vec![[0.0, 0.0, 0.0]]);
        let mut strfac = Strfac::new(&ion, &grid);
        strfac.phafac(&ion);
        let npack = grid.npack(1);
        let mut before = vec![0.0; 2 * npack];
        strfac.strfac_pack(1, 0, &mut before);

        ion.set_rion1(0, [0.5, 0.0, 0.0]);
        strfac.phafac(&ion);
        let mut after = vec![0.0; 2 * npack];
        strfac.strfac_pack(1, 0, &mut after);

        let moved = (0..npack).any(|p| (before[2 * p] - after[2 * p]).abs() > 1e-8);
        assert!(moved, "phafac must pick up new ionic positions");
    }
}
