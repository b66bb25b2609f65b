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

//! The Lagrange-multiplier constraint over a sharded orbital axis: two
//! ranks along `j` must reproduce the single-rank result and restore
//! orthonormality after a perturbed Verlet step.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::thread;

use pwmd::device::{Backend, GDevice};
use pwmd::lattice::Lattice;
use pwmd::mapping::MapKind;
use pwmd::orbitals::Orbitals;
use pwmd::parallel::{LocalWorld, Parallel};
use pwmd::pgrid::PackedGrid;

fn bundle(parall: Arc<Parallel>, ne: usize) -> Orbitals {
    let unita = [8.0, 0.0, 0.0, 0.0, 8.0, 0.0, 0.0, 0.0, 8.0];
    let lattice = Lattice::new(unita, 20.0, 10.0);
    let grid = PackedGrid::new(
        parall,
        Rc::new(RefCell::new(GDevice::new(Backend::Host))),
        lattice,
        MapKind::Slab,
        1,
        true,
    )
    .unwrap();
    Orbitals::new(grid, 1, [ne, 0])
}

fn fill_column(chunk: &mut [f64], nglobal: usize, shift: u64) {
    for (p, x) in chunk.iter_mut().enumerate() {
        *x = (0.13 * p as f64 + 0.9 * (nglobal as u64 + shift + 1) as f64).sin() * 0.3;
    }
    chunk[1] = 0.0;
}

fn run_rank(p: Parallel, ne: usize) -> Vec<f64> {
    let mut orbs = bundle(Arc::new(p), ne);
    let npack2 = orbs.npack2();
    let nq = orbs.neq[0];

    let mut psi1 = orbs.g_allocate();
    for q in 0..nq {
        let g = orbs.omap().global_index(0, q);
        fill_column(&mut psi1[q * npack2..(q + 1) * npack2], g, 0);
    }
    orbs.g_ortho(&mut psi1);

    // Perturbed Verlet result.
    let mut psi2 = psi1.clone();
    for q in 0..nq {
        let g = orbs.omap().global_index(0, q);
        let mut noise = vec![0.0; npack2];
        fill_column(&mut noise, g, 40);
        for (o, n) in psi2[q * npack2..(q + 1) * npack2].iter_mut().zip(noise.iter()) {
            *o += 0.01 * n;
        }
    }

    let mut lmbda = orbs.m_allocate(-1);
    orbs.ggm_lambda(1.0, &psi1, &mut psi2, &mut lmbda);

    let mut overlap = vec![0.0; orbs.m_size(-1)];
    orbs.ggm_sym_multiply(&psi2, &psi2, &mut overlap);
    for i in 0..ne {
        for j in 0..ne {
            let expect = if i == j { 1.0 } else { 0.0 };
            assert!(
                (overlap[i + j * ne] - expect).abs() < 1e-10,
                "overlap deviates by {}",
                overlap[i + j * ne] - expect
            );
        }
    }
    overlap
}

#[test]
fn sharded_lambda_restores_orthonormality_and_matches_serial() {
    let ne = 4;

    // Single-rank reference.
    let reference = run_rank(Parallel::serial(), ne);

    // Two ranks along the orbital axis; every rank asserts its own
    // orthonormality and agreement with the reference.
    let reference = Arc::new(reference);
    let handles: Vec<_> = LocalWorld::spawn(1, 2, 1)
        .into_iter()
        .map(|p| {
            let reference = reference.clone();
            thread::spawn(move || {
                let overlap = run_rank(p, ne);
                for (a, b) in overlap.iter().zip(reference.iter()) {
                    assert!((a - b).abs() < 1e-10);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
}
