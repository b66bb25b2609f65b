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

//! Contracts with the external physics kernels.
//!
//! The pseudopotential, Hartree, exchange-correlation and Ewald pieces
//! live outside this crate; the integrator consumes them through the
//! traits below. Sign convention: every `*_apply` routine accumulates the
//! *force* contribution `-(operator) psi` into `hpsi`, matching the
//! Verlet update `psi2 = 2 psi1 - psi0 + dt^2/m Hpsi`.
//!
//! The kinetic operator is pure reciprocal-grid arithmetic, so a
//! reference implementation is provided here.

use crate::ion::Ion;
use crate::pgrid::PackedGrid;
use crate::strfac::Strfac;

pub trait CoulombOperator {
    /// Hartree potential of the total density, real space in and out.
    fn v_hartree(&self, grid: &PackedGrid, dn: &[f64], vh: &mut [f64]);
    /// Hartree energy of the total density.
    fn e_hartree(&self, grid: &PackedGrid, dn: &[f64]) -> f64;
}

pub trait XcOperator {
    /// Exchange-correlation potential per spin channel, real space.
    fn v_xc(&self, grid: &PackedGrid, ispin: usize, dn: &[f64], vxc: &mut [f64]);
    /// Exchange-correlation energy.
    fn e_xc(&self, grid: &PackedGrid, ispin: usize, dn: &[f64]) -> f64;
}

pub trait PseudoPotential {
    /// Add the local pseudopotential (summed over ions via the structure
    /// factor) to the real-space potential.
    fn v_local_add(&self, grid: &PackedGrid, strfac: &Strfac, v: &mut [f64]);
    /// Accumulate `-V_NL psi` for one packed orbital of grid `nb`.
    fn v_nonlocal_apply(
        &self,
        grid: &PackedGrid,
        strfac: &Strfac,
        nb: usize,
        psi: &[f64],
        hpsi: &mut [f64],
    );
    /// Ionic force contribution.
    fn f_ion_add(&self, grid: &PackedGrid, strfac: &Strfac, ion: &Ion, fion: &mut [f64]);
    /// Valence charge of species `ka`.
    fn zv(&self, ka: usize) -> f64;
    /// Atom-centred point charges, when the APC correction is active.
    fn apc_charges(&self, _ion: &Ion) -> Option<Vec<f64>> {
        None
    }
}

pub trait EwaldSum {
    /// Refresh internal phase tables after an ionic move.
    fn phafac(&mut self, ion: &Ion);
    fn energy(&self, ion: &Ion) -> f64;
    fn force(&self, ion: &Ion, fion: &mut [f64]);
}

/// Kinetic-energy operator on packed vectors: `tg(G) = -|G|^2 / 2`.
pub struct Kinetic {
    /// One table per grid index (0 density, then wavefunction slots).
    tg: Vec<Vec<f64>>,
}

impl Kinetic {
    pub fn new(grid: &PackedGrid) -> Kinetic {
        let mut tg = Vec::with_capacity(grid.nbrillq() + 1);
        for nb in 0..=grid.nbrillq() {
            tg.push(
                grid.gvectors(nb)
                    .iter()
                    .map(|g| -0.5 * (g[0] * g[0] + g[1] * g[1] + g[2] * g[2]))
                    .collect(),
            );
        }
        Kinetic { tg }
    }

    /// Accumulate the kinetic force `-T psi = tg . psi` into `hpsi`.
    pub fn ke_apply(&self, nb: usize, psi: &[f64], hpsi: &mut [f64]) {
        for (p, &t) in self.tg[nb].iter().enumerate() {
            hpsi[2 * p] += t * psi[2 * p];
            hpsi[2 * p + 1] += t * psi[2 * p + 1];
        }
    }

    /// Kinetic energy of one packed orbital (positive), with Gamma-point
    /// doubling handled by the caller through `cc_pack_idot`-style sums.
    pub fn ke_orbital(&self, grid: &PackedGrid, nb: usize, psi: &[f64]) -> f64 {
        let tg = &self.tg[nb];
        let mut sum = 0.0;
        for (p, &t) in tg.iter().enumerate() {
            sum -= t * (psi[2 * p] * psi[2 * p] + psi[2 * p + 1] * psi[2 * p + 1]);
        }
        if grid.gamma() {
            sum *= 2.0;
            for p in 0..grid.nzero(nb) {
                sum += tg[p] * (psi[2 * p] * psi[2 * p] + psi[2 * p + 1] * psi[2 * p + 1]);
            }
        }
        sum
    }
}

/// Stand-ins for runs (and tests) without the physics kernels attached.
pub struct ZeroCoulomb;
pub struct ZeroXc;
pub struct ZeroPseudo;
pub struct ZeroEwald;

impl CoulombOperator for ZeroCoulomb {
    fn v_hartree(&self, grid: &PackedGrid, _dn: &[f64], vh: &mut [f64]) {
        for x in vh[..grid.n2ft3d].iter_mut() {
            *x = 0.0;
        }
    }
    fn e_hartree(&self, _grid: &PackedGrid, _dn: &[f64]) -> f64 {
        0.0
    }
}

impl XcOperator for ZeroXc {
    fn v_xc(&self, grid: &PackedGrid, ispin: usize, _dn: &[f64], vxc: &mut [f64]) {
        for x in vxc[..ispin * grid.n2ft3d].iter_mut() {
            *x = 0.0;
        }
    }
    fn e_xc(&self, _grid: &PackedGrid, _ispin: usize, _dn: &[f64]) -> f64 {
        0.0
    }
}

impl PseudoPotential for ZeroPseudo {
    fn v_local_add(&self, _grid: &PackedGrid, _strfac: &Strfac, _v: &mut [f64]) {}
    fn v_nonlocal_apply(
        &self,
        _grid: &PackedGrid,
        _strfac: &Strfac,
        _nb: usize,
        _psi: &[f64],
        _hpsi: &mut [f64],
    ) {
    }
    fn f_ion_add(&self, _grid: &PackedGrid, _strfac: &Strfac, _ion: &Ion, _fion: &mut [f64]) {}
    fn zv(&self, _ka: usize) -> f64 {
        0.0
    }
}

impl EwaldSum for ZeroEwald {
    fn phafac(&mut self, _ion: &Ion) {}
    fn energy(&self, _ion: &Ion) -> f64 {
        0.0
    }
    fn force(&self, _ion: &Ion, _fion: &mut [f64]) {}
}

/// The full operator set consumed by one Car-Parrinello run.
pub struct Operators {
    pub coulomb: Box<dyn CoulombOperator>,
    pub xc: Box<dyn XcOperator>,
    pub psp: Box<dyn PseudoPotential>,
    pub ewald: Box<dyn EwaldSum>,
}

impl Operators {
    /// Bare operator set: kinetic-only dynamics.
    pub fn zeroed() -> Operators {
        Operators {
            coulomb: Box::new(ZeroCoulomb),
            xc: Box::new(ZeroXc),
            psp: Box::new(ZeroPseudo),
            ewald: Box::new(ZeroEwald),
        }
    }
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

    fn grid() -> PackedGrid {
        let unita = [8.0, 0.0, 0.0, 0.0, 8.0, 0.0, 0.0, 0.0, 8.0];
        PackedGrid::new(
            Arc::new(Parallel::serial()),
            Rc::new(RefCell::new(GDevice::new(Backend::Host))),
            Lattice::new(unita, 20.0, 10.0),
            MapKind::Slab,
            1,
            true,
        )
        .unwrap()
    }

    #[test]
    fn kinetic_energy_of_a_single_plane_wave() {
        let grid = grid();
        let kin = Kinetic::new(&grid);
        let npack = grid.npack(1);
        // Put weight on one non-zero G; expect ke = 2 * 0.5 |G|^2 from the
        // Gamma doubling of a unit coefficient.
        let mut psi = vec![0.0; 2 * npack];
        let p = grid.nzero(1); // first non-self-conjugate entry
        psi[2 * p] = 1.0;
        let g = grid.gvectors(1)[p];
        let gg = g[0] * g[0] + g[1] * g[1] + g[2] * g[2];
        let ke = kin.ke_orbital(&grid, 1, &psi);
        assert_approx_eq!(f64, ke, gg, epsilon = 1e-12);

        let mut hpsi = vec![0.0; 2 * npack];
        kin.ke_apply(1, &psi, &mut hpsi);
        assert_approx_eq!(f64, hpsi[2 * p], -0.5 * gg, epsilon = 1e-12);
    }

    #[test]
    fn zero_operators_do_nothing() {
        let grid = grid();
        let ops = Operators::zeroed();
        let mut v = vec![1.0; grid.n2ft3d];
        ops.coulomb.v_hartree(&grid, &[], &mut v);
        assert!(v.iter().all(|&x| x == 0.0));
        assert_eq!(ops.coulomb.e_hartree(&grid, &[]), 0.0);
    }
}
