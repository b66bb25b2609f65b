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

//! Distributed plane-wave wavefunction algebra and a Car-Parrinello
//! molecular-dynamics integrator.
//!
//! The engine owns electron orbitals as packed reciprocal-space arrays
//! distributed over a Cartesian process grid, provides the BLAS-level
//! and Gram-Schmidt / Lagrange-constraint primitives on them, couples
//! reciprocal and real space through batched 3D FFTs, and advances the
//! coupled electron-ion system with an extended-Lagrangian Verlet step.
//! The pseudopotential, Hartree, exchange-correlation and Ewald physics
//! plug in through the traits in [`operators`].
//!
//! Usage
//! -----
//! Build the packed grid and the orbital bundle, then drive a run:
//!
//! ```
//! use std::cell::RefCell;
//! use std::rc::Rc;
//! use std::sync::Arc;
//! use pwmd::device::{Backend, GDevice};
//! use pwmd::lattice::Lattice;
//! use pwmd::mapping::MapKind;
//! use pwmd::orbitals::Orbitals;
//! use pwmd::parallel::Parallel;
//! use pwmd::pgrid::PackedGrid;
//!
//! let lattice = Lattice::new([8.0, 0.0, 0.0, 0.0, 8.0, 0.0, 0.0, 0.0, 8.0], 10.0, 5.0);
//! let grid = PackedGrid::new(
//!     Arc::new(Parallel::serial()),
//!     Rc::new(RefCell::new(GDevice::new(Backend::Host))),
//!     lattice,
//!     MapKind::Slab,
//!     1,
//!     true,
//! )
//! .unwrap();
//! let mut orbitals = Orbitals::new(grid, 1, [2, 0]);
//! let mut psi = orbitals.g_allocate();
//! orbitals.g_generate_random(&mut psi).unwrap();
//! orbitals.g_ortho(&mut psi);
//! assert!((orbitals.gg_traceall(&psi, &psi) - 4.0).abs() < 1e-9);
//! ```

pub mod control;
pub mod cpmd;
pub mod device;
pub mod error;
pub mod ion;
pub mod lattice;
pub mod mapping;
pub mod operators;
pub mod orbitals;
pub mod parallel;
pub mod pgrid;
pub mod psi_io;
pub mod strfac;
pub mod thermostat;

pub use crate::cpmd::cpmd;
pub use crate::error::{Error, Result};
pub use crate::orbitals::Orbitals;
pub use crate::parallel::{Axis, LocalWorld, Parallel};
pub use crate::pgrid::PackedGrid;
