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

//! The Car-Parrinello integrator: the extended-Lagrangian Verlet step,
//! the inner/outer iteration structure, energy bookkeeping, simulated
//! annealing and the run entry point `cpmd`.
//!
//! One inner step: structure-factor refresh, density from the batched
//! inverse FFTs, external potentials, `Hpsi`, the Verlet update
//! `psi2 = 2 psi1 - psi0 + dt^2/m_fake Hpsi` (the velocity form on the
//! very first step), the Lagrange-multiplier constraint, the ionic
//! Verlet step and the buffer rotation.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use itertools::izip;
use serde_json::{json, Value};
use tracing::info;

use crate::control::Control;
use crate::device::{Backend, GDevice};
use crate::error::{Error, Result};
use crate::ion::Ion;
use crate::lattice::Lattice;
use crate::operators::{Kinetic, Operators};
use crate::orbitals::Orbitals;
use crate::parallel::Parallel;
use crate::pgrid::PackedGrid;
use crate::psi_io::{psi_filefind, psi_get_header, psi_read, psi_read0, psi_write};
use crate::strfac::Strfac;
use crate::thermostat::NoseHoover;

/// Running mean/variance of the potential and conserved energies.
#[derive(Debug, Default)]
pub struct RunStats {
    n: f64,
    se: f64,
    se2: f64,
    sh: f64,
    sh2: f64,
}

impl RunStats {
    pub fn update(&mut self, h: f64, e: f64) {
        self.n += 1.0;
        self.sh += h;
        self.sh2 += h * h;
        self.se += e;
        self.se2 += e * e;
    }

    pub fn eave(&self) -> f64 {
        if self.n > 0.0 {
            self.se / self.n
        } else {
            0.0
        }
    }
    pub fn evar(&self) -> f64 {
        if self.n > 0.0 {
            self.se2 / self.n - self.eave() * self.eave()
        } else {
            0.0
        }
    }
    pub fn have(&self) -> f64 {
        if self.n > 0.0 {
            self.sh / self.n
        } else {
            0.0
        }
    }
    pub fn hvar(&self) -> f64 {
        if self.n > 0.0 {
            self.sh2 / self.n - self.have() * self.have()
        } else {
            0.0
        }
    }
}

/// `it_in` Car-Parrinello steps. With `verlet == false` (first call
/// only) `psi0` must hold the orbital velocities; afterwards the buffers
/// hold positions at `t - dt` and `t`.
#[allow(clippy::too_many_arguments)]
pub fn inner_loop_md(
    verlet: bool,
    sa_alpha: [f64; 2],
    dt: f64,
    fake_mass: f64,
    it_in: usize,
    orbs: &mut Orbitals,
    ion: &mut Ion,
    nose: &mut NoseHoover,
    kin: &Kinetic,
    ops: &mut Operators,
    strfac: &mut Strfac,
    psi0: &mut Vec<f64>,
    psi1: &mut Vec<f64>,
    psi2: &mut Vec<f64>,
    hpsi: &mut Vec<f64>,
    psi_r: &mut Vec<f64>,
    dn: &mut Vec<f64>,
    hml: &mut Vec<f64>,
    lmbda: &mut Vec<f64>,
    e: &mut [f64; 60],
) -> Result<()> {
    let omega = orbs.grid().lattice.omega();
    let n2ft3d = orbs.grid().n2ft3d;
    let ispin = orbs.ispin;
    let dte = dt * dt / fake_mass;
    let spin_factor = if ispin == 1 { 2.0 } else { 1.0 };
    let npts = (orbs.grid().nx * orbs.grid().ny * orbs.grid().nz) as f64;
    let dv = omega / npts;

    let mut vh = vec![0.0; n2ft3d];
    let mut vxc = vec![0.0; ispin * n2ft3d];
    let mut vloc = vec![0.0; n2ft3d];
    let mut vpsir = vec![0.0; n2ft3d];
    let mut dntot = vec![0.0; n2ft3d];
    let mut fion = vec![0.0; 3 * ion.nion()];

    for _ in 0..it_in {
        if verlet {
            ion.shift_ring();
        }
        strfac.phafac(ion);
        ops.ewald.phafac(ion);

        // Density at the current positions.
        orbs.gh_fftb(psi1, psi_r)?;
        orbs.hr_asumsqr(1.0 / omega, psi_r, dn);
        for (t, up, dnw) in izip!(
            dntot.iter_mut(),
            dn[..n2ft3d].iter(),
            dn[(ispin - 1) * n2ft3d..].iter()
        ) {
            *t = up + dnw;
        }

        // External potentials.
        ops.coulomb.v_hartree(orbs.grid(), &dntot, &mut vh);
        ops.xc.v_xc(orbs.grid(), ispin, dn, &mut vxc);
        for x in vloc.iter_mut() {
            *x = 0.0;
        }
        ops.psp.v_local_add(orbs.grid(), strfac, &mut vloc);

        // Hpsi = -(T + V) psi1, orbital by orbital.
        orbs.g_zero(hpsi);
        for nbq in 0..orbs.nbrillq() {
            for ms in 0..ispin {
                for q in 0..orbs.neq[ms] {
                    let col = ms * orbs.neq[0] + q;
                    let coff = orbs.col_offset(nbq, col);
                    kin.ke_apply(nbq + 1, &psi1[coff..], &mut hpsi[coff..]);

                    let roff = (nbq * (orbs.neq[0] + orbs.neq[1]) + col) * n2ft3d;
                    for (v, h, l, x, p) in izip!(
                        vpsir.iter_mut(),
                        vh.iter(),
                        vloc.iter(),
                        vxc[ms * n2ft3d..].iter(),
                        psi_r[roff..].iter()
                    ) {
                        *v = (h + l + x) * p;
                    }
                    orbs.grid().rc_fft3d(&mut vpsir)?;
                    orbs.grid().c_pack(nbq + 1, &mut vpsir);
                    orbs.grid()
                        .cc_pack_daxpy(nbq + 1, -1.0, &vpsir, &mut hpsi[coff..]);

                    ops.psp.v_nonlocal_apply(
                        orbs.grid(),
                        strfac,
                        nbq + 1,
                        &psi1[coff..],
                        &mut hpsi[coff..],
                    );
                }
            }
        }

        // Orbital Hamiltonian matrix and energies.
        orbs.ggm_sym_multiply(psi1, hpsi, hml);
        orbs.m_scal(-1.0, hml);
        let eorbit = spin_factor * orbs.m_trace(hml);
        let ehartr = ops.coulomb.e_hartree(orbs.grid(), &dntot);
        let exc = ops.xc.e_xc(orbs.grid(), ispin, dn);
        let eion = ops.ewald.energy(ion);
        let mut pxc = 0.0;
        for ms in 0..ispin {
            for r in 0..n2ft3d {
                pxc += vxc[ms * n2ft3d + r] * dn[ms * n2ft3d + r] * dv;
            }
        }

        // Verlet / Newton update with the thermostat-annealing blend.
        let sse = if nose.on() { nose.scale_e() } else { sa_alpha[0] };
        let ssr = if nose.on() { nose.scale_r() } else { sa_alpha[1] };
        if verlet {
            orbs.ggg_minus(psi1, psi0, psi2);
            orbs.g_scale(sse, psi2);
            orbs.gg_sum2(psi1, psi2);
            orbs.gg_daxpy(dte, hpsi, psi2);
        } else {
            orbs.gg_copy(psi1, psi2);
            orbs.gg_daxpy(dt, psi0, psi2);
            orbs.gg_daxpy(0.5 * dte, hpsi, psi2);
        }

        // Re-impose orthonormality through the Lagrange multipliers.
        orbs.ggm_lambda(dte, psi1, psi2, lmbda);

        // Fictitious electron kinetic energy (central difference after
        // the constraint correction).
        if verlet {
            orbs.ggg_minus(psi2, psi0, hpsi);
            orbs.g_scale(1.0 / (2.0 * dt), hpsi);
        } else {
            orbs.ggg_minus(psi2, psi1, hpsi);
            orbs.g_scale(1.0 / dt, hpsi);
        }
        let eke = fake_mass * orbs.gg_traceall(hpsi, hpsi);

        // Ionic step.
        for f in fion.iter_mut() {
            *f = 0.0;
        }
        ops.ewald.force(ion, &mut fion);
        ops.psp.f_ion_add(orbs.grid(), strfac, ion, &mut fion);
        if verlet {
            ion.verlet_step(&fion, dt, ssr);
        } else {
            ion.newton_step(&fion, dt);
        }

        e[1] = eorbit - ehartr + (exc - pxc) + eion;
        e[2] = eke;
        e[3] = ion.ke();
        e[0] = e[1] + e[2] + e[3] + nose.e_energy() + nose.r_energy();
        e[4] = eorbit;
        e[5] = ehartr;
        e[6] = exc;
        e[7] = eion;

        nose.integrate(e[2], e[3]);

        // Rotate psi0 <- psi1 <- psi2.
        std::mem::swap(psi0, psi1);
        std::mem::swap(psi1, psi2);
    }
    Ok(())
}

/// One full Car-Parrinello run driven by the runtime database. Restart
/// files for the wavefunction and its companion are written at the end;
/// the database string is updated in place with the energies and
/// `initialize_wavefunction = false`.
pub fn cpmd(parall: Arc<Parallel>, rtdb: &mut String, ops: &mut Operators) -> Result<()> {
    let control = Control::new(rtdb)?;
    let mut e = [0.0f64; 60];

    // Grid shape: an existing restart header wins over the database.
    let psi_in = control.input_movecs_filename();
    let have_psi = !control.initialize_wavefunction() && psi_filefind(&parall, &psi_in);
    let (unita, ispin, ne, ngrid) = if have_psi {
        let h = psi_get_header(&parall, &psi_in)?;
        (
            h.unita,
            h.ispin,
            h.ne,
            Some((h.nfft[0], h.nfft[1], h.nfft[2])),
        )
    } else {
        (control.unita(), control.ispin(), control.ne(), None)
    };
    let lattice = match ngrid {
        Some(g) => Lattice::with_ngrid(unita, control.ecut(), control.wcut(), g),
        None => Lattice::new(unita, control.ecut(), control.wcut()),
    };

    let device = Rc::new(RefCell::new(GDevice::new(Backend::Host)));
    let grid = PackedGrid::new(
        parall.clone(),
        device,
        lattice,
        control.mapping(),
        1,
        true,
    )?;
    let mut orbs = Orbitals::new(grid, ispin, ne);

    let mut psi0 = orbs.g_allocate();
    let mut psi1 = orbs.g_allocate();
    let mut psi2 = orbs.g_allocate();
    let mut hpsi = orbs.g_allocate();
    let mut psi_r = orbs.h_allocate();
    let mut dn = orbs.r_nalloc();
    let mut hml = orbs.m_allocate(-1);
    let mut lmbda = orbs.m_allocate(-1);
    let mut eig = vec![0.0; ne[0] + ne[1]];

    // Wavefunction and its velocity companion.
    if have_psi {
        psi_read(&mut orbs, &psi_in, &mut psi1)?;
    } else {
        orbs.g_generate_random(&mut psi1)?;
        orbs.g_ortho(&mut psi1);
    }
    orbs.g_zero(&mut psi0);
    let vpsi_in = control.input_v_movecs_filename();
    if psi_filefind(&parall, &vpsi_in) {
        psi_read0(&orbs, &vpsi_in, &mut psi0)?;
    }
    let eke0 = control.fake_mass() * orbs.gg_traceall(&psi0, &psi0);
    orbs.g_scale(control.scaling(0), &mut psi0);
    let eke1 = control.fake_mass() * orbs.gg_traceall(&psi0, &psi0);

    // Ions and their collaborators.
    let (symbols, coords, velocities, masses, charges) = control.geometry();
    let nion = symbols.len();
    let mut ion = Ion::new(
        symbols,
        (0..nion).collect(),
        masses,
        charges,
        coords,
        velocities,
    );
    ion.fix_translation = control.fix_translation();
    ion.rescale_velocities(control.scaling(1));

    let mut strfac = Strfac::new(&ion, orbs.grid());
    strfac.phafac(&ion);
    ops.ewald.phafac(&ion);
    let kin = Kinetic::new(orbs.grid());

    let dt = control.time_step();
    let fake_mass = control.fake_mass();
    let mut nose = NoseHoover::new(
        control.nose_on(),
        control.nose_te(),
        control.nose_tr(),
        control.nose_pe(),
        control.nose_pr(),
        ne[0] + ne[1],
        ion.ndof(),
        dt,
    );

    // Simulated annealing: thermostat targets decay when a thermostat is
    // active, otherwise the velocity terms decay directly.
    let mut sa_alpha = [1.0f64, 1.0f64];
    let mut sa_with_nose = false;
    if control.sa() {
        if nose.on() {
            sa_with_nose = true;
        } else {
            sa_alpha[0] = (-(dt / control.sa_decay(0))).exp();
            sa_alpha[1] = (-(dt / control.sa_decay(1))).exp();
        }
    }

    if parall.is_master() {
        info!(
            np = parall.np(),
            time_step = dt,
            fake_mass,
            eke_initial = eke0,
            eke_scaled = eke1,
            "starting Car-Parrinello iteration"
        );
    }

    // Newton step: the first move consumes the explicit velocities.
    inner_loop_md(
        false, sa_alpha, dt, fake_mass, 1, &mut orbs, &mut ion, &mut nose, &kin, ops,
        &mut strfac, &mut psi0, &mut psi1, &mut psi2, &mut hpsi, &mut psi_r, &mut dn, &mut hml,
        &mut lmbda, &mut e,
    )?;

    // Position-Verlet outer loop.
    let it_in = control.loop_(0);
    let mut stats = RunStats::default();
    let mut icount = 0;
    while icount < control.loop_(1) {
        icount += 1;
        inner_loop_md(
            true, sa_alpha, dt, fake_mass, it_in, &mut orbs, &mut ion, &mut nose, &kin, ops,
            &mut strfac, &mut psi0, &mut psi1, &mut psi2, &mut hpsi, &mut psi_r, &mut dn,
            &mut hml, &mut lmbda, &mut e,
        )?;
        stats.update(e[0], e[1]);

        if sa_with_nose {
            let elapsed = (icount * it_in) as f64 * dt;
            let te = nose.te * (-(elapsed / control.sa_decay(0))).exp();
            let tr = nose.tr * (-(elapsed / control.sa_decay(1))).exp();
            nose.retarget(te, tr, ne[0] + ne[1], ion.ndof());
        }

        if parall.is_master() {
            info!(
                iter = icount * it_in,
                e_total = e[0],
                e_potential = e[1],
                eke_psi = e[2],
                eke_ion = e[3],
                temperature = ion.temperature(),
                "md step"
            );
        }

        if control.out_of_time() {
            if parall.is_master() {
                info!("wall clock exhausted, writing restart and stopping");
            }
            break;
        }
    }

    // Diagonalise the orbital Hamiltonian and rotate current and
    // previous orbitals into the eigenbasis.
    orbs.m_diagonalize(&mut hml, &mut eig)?;
    orbs.fmf_multiply(-1, &psi1, &hml, 1.0, &mut psi2, 0.0);
    orbs.gg_copy(&psi0, &mut hpsi);
    orbs.fmf_multiply(-1, &hpsi, &hml, 1.0, &mut psi0, 0.0);

    psi_write(&orbs, &control.output_movecs_filename(), &psi2, None)?;
    psi_write(&orbs, &control.output_v_movecs_filename(), &psi0, None)?;

    if parall.is_master() {
        info!(
            e_total = e[0],
            eave = stats.have(),
            evar = stats.hvar(),
            vave = stats.eave(),
            vvar = stats.evar(),
            eigenvalues = ?eig,
            "run complete"
        );
    }

    // Fold the results back into the runtime database.
    let mut dbjson: Value =
        serde_json::from_str(rtdb).map_err(|err| Error::Rtdb(err.to_string()))?;
    dbjson["pspw"]["energy"] = json!(e[0]);
    dbjson["pspw"]["energies"] = json!(e.to_vec());
    if let Some(q) = ops.psp.apc_charges(&ion) {
        dbjson["nwpw"]["apc"]["q"] = json!(q);
    }
    dbjson["nwpw"]["initialize_wavefunction"] = json!(false);
    *rtdb = dbjson.to_string();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::MapKind;

    fn fixture(ne: usize, wcut: f64) -> (Orbitals, Ion, Strfac, Kinetic) {
        let unita = [8.0, 0.0, 0.0, 0.0, 8.0, 0.0, 0.0, 0.0, 8.0];
        let lattice = Lattice::new(unita, 2.0 * wcut, wcut);
        let grid = PackedGrid::new(
            Arc::new(Parallel::serial()),
            Rc::new(RefCell::new(GDevice::new(Backend::Host))),
            lattice,
            MapKind::Slab,
            1,
            true,
        )
        .unwrap();
        let orbs = Orbitals::new(grid, 1, [ne, 0]);
        let ion = Ion::new(
            vec!["H".to_string()],
            vec![0],
            vec![1.008],
            vec![1.0],
            vec![4.0, 4.0, 4.0],
            vec![0.0; 3],
        );
        let strfac = Strfac::new(&ion, orbs.grid());
        let kin = Kinetic::new(orbs.grid());
        (orbs, ion, strfac, kin)
    }

    /// Smooth low-frequency orbital so the Verlet step is well inside
    /// the stability region at dt = 5.
    fn smooth_psi(orbs: &mut Orbitals) -> Vec<f64> {
        let mut psi = orbs.g_allocate();
        let npack2 = orbs.npack2();
        for (col, chunk) in psi.chunks_mut(npack2).enumerate() {
            for (p, g) in orbs.grid().gvectors(1).iter().enumerate() {
                let gg = g[0] * g[0] + g[1] * g[1] + g[2] * g[2];
                chunk[2 * p] = (-(gg) / 2.0).exp() * (1.0 + 0.1 * (col as f64 + 1.0));
            }
        }
        orbs.g_ortho(&mut psi);
        psi
    }

    #[test]
    fn microcanonical_energy_is_conserved() {
        // Hydrogen-like scenario with the physics kernels stubbed out:
        // kinetic-only Car-Parrinello dynamics over 100 steps with
        // m_fake = 500 and the thermostat off. The free-oscillation
        // frequencies of the stand-in Hamiltonian are stiffer than the
        // physical ones, so the step is kept well inside the stability
        // region; the drift bound matches the physical scenario.
        let (mut orbs, mut ion, mut strfac, kin) = fixture(1, 10.0);
        let mut ops = Operators::zeroed();
        let mut nose = NoseHoover::off();

        let mut psi1 = smooth_psi(&mut orbs);
        let mut psi0 = orbs.g_allocate();
        let mut psi2 = orbs.g_allocate();
        let mut hpsi = orbs.g_allocate();
        let mut psi_r = orbs.h_allocate();
        let mut dn = orbs.r_nalloc();
        let mut hml = orbs.m_allocate(-1);
        let mut lmbda = orbs.m_allocate(-1);
        let mut e = [0.0f64; 60];

        let (dt, fake_mass) = (1.0, 500.0);
        inner_loop_md(
            false, [1.0, 1.0], dt, fake_mass, 1, &mut orbs, &mut ion, &mut nose, &kin,
            &mut ops, &mut strfac, &mut psi0, &mut psi1, &mut psi2, &mut hpsi, &mut psi_r,
            &mut dn, &mut hml, &mut lmbda, &mut e,
        )
        .unwrap();
        let e_start = e[0];

        inner_loop_md(
            true, [1.0, 1.0], dt, fake_mass, 100, &mut orbs, &mut ion, &mut nose, &kin,
            &mut ops, &mut strfac, &mut psi0, &mut psi1, &mut psi2, &mut hpsi, &mut psi_r,
            &mut dn, &mut hml, &mut lmbda, &mut e,
        )
        .unwrap();

        assert!(
            (e[0] - e_start).abs() < 5.0e-4,
            "energy drifted by {}",
            (e[0] - e_start).abs()
        );
    }

    #[test]
    fn verlet_steps_keep_orbitals_orthonormal() {
        let (mut orbs, mut ion, mut strfac, kin) = fixture(2, 10.0);
        let mut ops = Operators::zeroed();
        let mut nose = NoseHoover::off();

        let mut psi1 = smooth_psi(&mut orbs);
        let mut psi0 = orbs.g_allocate();
        let mut psi2 = orbs.g_allocate();
        let mut hpsi = orbs.g_allocate();
        let mut psi_r = orbs.h_allocate();
        let mut dn = orbs.r_nalloc();
        let mut hml = orbs.m_allocate(-1);
        let mut lmbda = orbs.m_allocate(-1);
        let mut e = [0.0f64; 60];

        inner_loop_md(
            false, [1.0, 1.0], 5.0, 500.0, 1, &mut orbs, &mut ion, &mut nose, &kin, &mut ops,
            &mut strfac, &mut psi0, &mut psi1, &mut psi2, &mut hpsi, &mut psi_r, &mut dn,
            &mut hml, &mut lmbda, &mut e,
        )
        .unwrap();
        inner_loop_md(
            true, [1.0, 1.0], 5.0, 500.0, 10, &mut orbs, &mut ion, &mut nose, &kin, &mut ops,
            &mut strfac, &mut psi0, &mut psi1, &mut psi2, &mut hpsi, &mut psi_r, &mut dn,
            &mut hml, &mut lmbda, &mut e,
        )
        .unwrap();

        let mut s = vec![0.0; orbs.m_size(-1)];
        orbs.ggm_sym_multiply(&psi1, &psi1, &mut s);
        for i in 0..2 {
            for j in 0..2 {
                let expect = if i == j { 1.0 } else { 0.0 };
                assert!(
                    (s[i + 2 * j] - expect).abs() < 1e-10,
                    "orthonormality broke: {}",
                    s[i + 2 * j] - expect
                );
            }
        }
    }

    #[test]
    fn full_run_writes_restarts_and_updates_the_database() {
        let dir = std::env::temp_dir();
        let base = format!("pwmd_cpmd_{}", std::process::id());
        let psi_file = dir.join(format!("{}.movecs", base));
        let vpsi_file = dir.join(format!("{}.vmovecs", base));

        let mut rtdb = serde_json::json!({
            "nwpw": {
                "loop": [2, 2],
                "time_step": 5.0,
                "fake_mass": 500.0,
                "cutoff": 5.0,
                "ne": [1, 0],
                "ispin": 1,
                "simulation_cell": { "unita": [8.0,0.0,0.0, 0.0,8.0,0.0, 0.0,0.0,8.0] },
                "initialize_wavefunction": true,
                "input_wavefunction_filename": psi_file.to_string_lossy(),
                "input_v_wavefunction_filename": vpsi_file.to_string_lossy()
            },
            "geometry": {
                "symbols": ["H"],
                "coords": [4.0, 4.0, 4.0],
                "masses": [1.008],
                "charges": [1.0]
            }
        })
        .to_string();

        let mut ops = Operators::zeroed();
        cpmd(Arc::new(Parallel::serial()), &mut rtdb, &mut ops).unwrap();

        assert!(psi_file.exists(), "wavefunction restart missing");
        assert!(vpsi_file.exists(), "velocity restart missing");

        let v: Value = serde_json::from_str(&rtdb).unwrap();
        assert_eq!(v["nwpw"]["initialize_wavefunction"], Value::Bool(false));
        assert!(v["pspw"]["energies"].as_array().unwrap().len() == 60);

        std::fs::remove_file(&psi_file).ok();
        std::fs::remove_file(&vpsi_file).ok();
    }
}
