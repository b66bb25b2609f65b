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

//! Simulation cell: real and reciprocal lattice vectors, plane-wave
//! cutoffs and the FFT grid sizes they imply.

use std::f64::consts::PI;

/// Real-space cell, derived reciprocal cell and the FFT grid.
///
/// Vectors are stored column-major: `unita[i + 3*j]` is component `i` of
/// lattice vector `j`, and `unita . unitg^T = 2 pi I`.
#[derive(Debug, Clone)]
pub struct Lattice {
    unita: [f64; 9],
    unitg: [f64; 9],
    omega: f64,
    ecut: f64,
    wcut: f64,
    nx: usize,
    ny: usize,
    nz: usize,
}

fn cross(a: &[f64], b: &[f64]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

/// Smallest even FFT size resolving plane waves up to `gmax` along a
/// reciprocal axis of length `b`.
fn fft_size(gmax: f64, b: f64) -> usize {
    let mut n = (2.0 * (gmax / b).ceil()) as usize + 2;
    if n % 2 == 1 {
        n += 1;
    }
    n.max(4)
}

impl Lattice {
    /// Build a cell from column-major lattice vectors and the density /
    /// wavefunction cutoffs (atomic units). FFT sizes are chosen to hold
    /// the density cutoff sphere.
    ///
    /// Panics if the cell is singular.
    pub fn new(unita: [f64; 9], ecut: f64, wcut: f64) -> Lattice {
        let mut lattice = Lattice::with_ngrid(unita, ecut, wcut, (4, 4, 4));
        let gmax = (2.0 * ecut).sqrt();
        let blen = |j: usize| -> f64 {
            let g = &lattice.unitg[3 * j..3 * j + 3];
            (g[0] * g[0] + g[1] * g[1] + g[2] * g[2]).sqrt()
        };
        let nx = fft_size(gmax, blen(0));
        let ny = fft_size(gmax, blen(1));
        let nz = fft_size(gmax, blen(2));
        lattice.nx = nx;
        lattice.ny = ny;
        lattice.nz = nz;
        lattice
    }

    /// Same as [`Lattice::new`] but with the FFT grid imposed (restart
    /// headers carry explicit grid sizes).
    pub fn with_ngrid(
        unita: [f64; 9],
        ecut: f64,
        wcut: f64,
        ngrid: (usize, usize, usize),
    ) -> Lattice {
        assert!(ecut > 0.0 && wcut > 0.0, "cutoffs must be positive");
        let a1 = &unita[0..3];
        let a2 = &unita[3..6];
        let a3 = &unita[6..9];
        let c23 = cross(a2, a3);
        let volume = a1[0] * c23[0] + a1[1] * c23[1] + a1[2] * c23[2];
        if volume.abs() < 1.0e-12 {
            panic!("singular lattice: cell volume is zero");
        }
        let c31 = cross(a3, a1);
        let c12 = cross(a1, a2);
        let mut unitg = [0.0; 9];
        let twopi = 2.0 * PI;
        for i in 0..3 {
            unitg[i] = twopi * c23[i] / volume;
            unitg[3 + i] = twopi * c31[i] / volume;
            unitg[6 + i] = twopi * c12[i] / volume;
        }
        Lattice {
            unita,
            unitg,
            omega: volume.abs(),
            ecut,
            wcut,
            nx: ngrid.0,
            ny: ngrid.1,
            nz: ngrid.2,
        }
    }

    pub fn unita(&self, i: usize, j: usize) -> f64 {
        self.unita[i + 3 * j]
    }
    pub fn unitg(&self, i: usize, j: usize) -> f64 {
        self.unitg[i + 3 * j]
    }
    pub fn unita1d(&self, k: usize) -> f64 {
        self.unita[k]
    }
    pub fn unita_flat(&self) -> [f64; 9] {
        self.unita
    }
    pub fn unitg_flat(&self) -> [f64; 9] {
        self.unitg
    }
    pub fn omega(&self) -> f64 {
        self.omega
    }
    pub fn ecut(&self) -> f64 {
        self.ecut
    }
    pub fn wcut(&self) -> f64 {
        self.wcut
    }
    pub fn nx(&self) -> usize {
        self.nx
    }
    pub fn ny(&self) -> usize {
        self.ny
    }
    pub fn nz(&self) -> usize {
        self.nz
    }

    /// Lattice constants `a, b, c` and angles `alpha, beta, gamma` (degrees).
    pub fn abc_abg(&self) -> (f64, f64, f64, f64, f64, f64) {
        let len = |j: usize| -> f64 {
            let a = &self.unita[3 * j..3 * j + 3];
            (a[0] * a[0] + a[1] * a[1] + a[2] * a[2]).sqrt()
        };
        let dot = |p: usize, q: usize| -> f64 {
            let a = &self.unita[3 * p..3 * p + 3];
            let b = &self.unita[3 * q..3 * q + 3];
            a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
        };
        let (a, b, c) = (len(0), len(1), len(2));
        let deg = 180.0 / PI;
        let alpha = (dot(1, 2) / (b * c)).acos() * deg;
        let beta = (dot(0, 2) / (a * c)).acos() * deg;
        let gamma = (dot(0, 1) / (a * b)).acos() * deg;
        (a, b, c, alpha, beta, gamma)
    }

    /// Reciprocal vector of the integer triple `(k1, k2, k3)`.
    pub fn gvector(&self, k1: i64, k2: i64, k3: i64) -> [f64; 3] {
        let (k1, k2, k3) = (k1 as f64, k2 as f64, k3 as f64);
        [
            k1 * self.unitg[0] + k2 * self.unitg[3] + k3 * self.unitg[6],
            k1 * self.unitg[1] + k2 * self.unitg[4] + k3 * self.unitg[7],
            k1 * self.unitg[2] + k2 * self.unitg[5] + k3 * self.unitg[8],
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;

    fn cubic(a: f64) -> [f64; 9] {
        [a, 0.0, 0.0, 0.0, a, 0.0, 0.0, 0.0, a]
    }

    #[test]
    fn reciprocal_vectors_are_dual() {
        let lat = Lattice::new(cubic(8.0), 20.0, 10.0);
        for i in 0..3 {
            for j in 0..3 {
                let mut dot = 0.0;
                for c in 0..3 {
                    dot += lat.unita(c, i) * lat.unitg(c, j);
                }
                let expect = if i == j { 2.0 * PI } else { 0.0 };
                assert_approx_eq!(f64, dot, expect, epsilon = 1e-12);
            }
        }
        assert_approx_eq!(f64, lat.omega(), 512.0, epsilon = 1e-10);
    }

    #[test]
    fn fft_grid_holds_cutoff_sphere() {
        let lat = Lattice::new(cubic(8.0), 20.0, 10.0);
        let gmax = (2.0f64 * 20.0).sqrt();
        let b = 2.0 * PI / 8.0;
        assert!(lat.nx() as f64 / 2.0 * b > gmax);
        assert_eq!(lat.nx() % 2, 0);
        assert_eq!(lat.nx(), lat.ny());
        assert_eq!(lat.ny(), lat.nz());
    }

    #[test]
    fn abc_abg_of_cubic_cell() {
        let lat = Lattice::new(cubic(8.0), 20.0, 10.0);
        let (a, b, c, alpha, beta, gamma) = lat.abc_abg();
        assert_approx_eq!(f64, a, 8.0, epsilon = 1e-12);
        assert_approx_eq!(f64, b, 8.0, epsilon = 1e-12);
        assert_approx_eq!(f64, c, 8.0, epsilon = 1e-12);
        assert_approx_eq!(f64, alpha, 90.0, epsilon = 1e-10);
        assert_approx_eq!(f64, beta, 90.0, epsilon = 1e-10);
        assert_approx_eq!(f64, gamma, 90.0, epsilon = 1e-10);
    }

    #[test]
    #[should_panic]
    fn singular_cell_is_rejected() {
        let unita = [1.0, 0.0, 0.0, 2.0, 0.0, 0.0, 0.0, 0.0, 1.0];
        let _ = Lattice::new(unita, 10.0, 5.0);
    }
}
