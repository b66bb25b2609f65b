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

//! Ion subsystem: positions, velocities, masses and the temperature /
//! centre-of-mass accessors consumed by the integrator.

/// Boltzmann constant in Hartree per Kelvin.
pub const KB: f64 = 3.16679e-6;

/// Electron masses per atomic mass unit.
const AMU_TO_AU: f64 = 1822.89;

/// Ion state with the three-position Verlet ring `rion0/rion1/rion2`.
pub struct Ion {
    nion: usize,
    nkatm: usize,
    symbols: Vec<String>,
    /// Species index per ion.
    katm: Vec<usize>,
    /// Atomic masses (amu) per species.
    amu: Vec<f64>,
    /// Valence charge per species.
    zv: Vec<f64>,
    /// Dynamical mass per ion, atomic units.
    mass: Vec<f64>,
    rion0: Vec<f64>,
    rion1: Vec<f64>,
    rion2: Vec<f64>,
    vion: Vec<f64>,
    pub fix_translation: bool,
    pub fix_rotation: bool,
    /// Kinetic energy before / after the startup velocity rescale.
    pub eki0: f64,
    pub eki1: f64,
}

impl Ion {
    pub fn new(
        symbols: Vec<String>,
        katm: Vec<usize>,
        amu: Vec<f64>,
        zv: Vec<f64>,
        rion: Vec<f64>,
        vion: Vec<f64>,
    ) -> Ion {
        let nion = katm.len();
        assert_eq!(symbols.len(), nion);
        assert_eq!(rion.len(), 3 * nion);
        assert_eq!(vion.len(), 3 * nion);
        assert_eq!(amu.len(), zv.len());
        assert!(amu.iter().all(|&m| m > 0.0), "ion masses must be positive");
        let mass: Vec<f64> = katm.iter().map(|&ka| amu[ka] * AMU_TO_AU).collect();
        Ion {
            nion,
            nkatm: amu.len(),
            symbols,
            katm,
            amu,
            zv,
            mass,
            rion0: rion.clone(),
            rion1: rion.clone(),
            rion2: rion,
            vion,
            fix_translation: false,
            fix_rotation: false,
            eki0: 0.0,
            eki1: 0.0,
        }
    }

    pub fn nion(&self) -> usize {
        self.nion
    }
    pub fn nkatm(&self) -> usize {
        self.nkatm
    }
    pub fn symbol(&self, ii: usize) -> &str {
        &self.symbols[ii]
    }
    pub fn katm(&self, ii: usize) -> usize {
        self.katm[ii]
    }
    pub fn amu(&self, ii: usize) -> f64 {
        self.amu[self.katm[ii]]
    }
    pub fn zv(&self, ka: usize) -> f64 {
        self.zv[ka]
    }
    pub fn mass(&self, ii: usize) -> f64 {
        self.mass[ii]
    }

    pub fn rion1(&self, ii: usize) -> [f64; 3] {
        [
            self.rion1[3 * ii],
            self.rion1[3 * ii + 1],
            self.rion1[3 * ii + 2],
        ]
    }
    pub fn set_rion1(&mut self, ii: usize, r: [f64; 3]) {
        self.rion1[3 * ii..3 * ii + 3].copy_from_slice(&r);
    }
    pub fn rion(&self, i: usize, ii: usize) -> f64 {
        self.rion1[i + 3 * ii]
    }
    pub fn vion(&self, i: usize, ii: usize) -> f64 {
        self.vion[i + 3 * ii]
    }

    /// Geometric centre of the current positions.
    pub fn gc(&self) -> [f64; 3] {
        let mut c = [0.0; 3];
        for ii in 0..self.nion {
            for x in 0..3 {
                c[x] += self.rion1[x + 3 * ii];
            }
        }
        for x in c.iter_mut() {
            *x /= self.nion as f64;
        }
        c
    }

    /// Centre of mass of the current positions.
    pub fn com(&self) -> [f64; 3] {
        let mut c = [0.0; 3];
        let mut m = 0.0;
        for ii in 0..self.nion {
            m += self.mass[ii];
            for x in 0..3 {
                c[x] += self.mass[ii] * self.rion1[x + 3 * ii];
            }
        }
        for x in c.iter_mut() {
            *x /= m;
        }
        c
    }

    pub fn vgc(&self) -> [f64; 3] {
        let mut c = [0.0; 3];
        for ii in 0..self.nion {
            for x in 0..3 {
                c[x] += self.vion[x + 3 * ii];
            }
        }
        for x in c.iter_mut() {
            *x /= self.nion as f64;
        }
        c
    }

    pub fn vcom(&self) -> [f64; 3] {
        let mut c = [0.0; 3];
        let mut m = 0.0;
        for ii in 0..self.nion {
            m += self.mass[ii];
            for x in 0..3 {
                c[x] += self.mass[ii] * self.vion[x + 3 * ii];
            }
        }
        for x in c.iter_mut() {
            *x /= m;
        }
        c
    }

    /// Ionic kinetic energy from the current velocities.
    pub fn ke(&self) -> f64 {
        let mut e = 0.0;
        for ii in 0..self.nion {
            let v2 = (0..3)
                .map(|x| self.vion[x + 3 * ii] * self.vion[x + 3 * ii])
                .sum::<f64>();
            e += 0.5 * self.mass[ii] * v2;
        }
        e
    }

    /// Kinetic energy of the centre-of-mass motion.
    pub fn ekg(&self) -> f64 {
        let v = self.vcom();
        let m: f64 = self.mass.iter().sum();
        0.5 * m * (v[0] * v[0] + v[1] * v[1] + v[2] * v[2])
    }

    /// Ionic degrees of freedom after the optional constraints.
    pub fn ndof(&self) -> usize {
        let mut dof = 3 * self.nion;
        if self.fix_translation {
            dof = dof.saturating_sub(3);
        }
        if self.fix_rotation {
            dof = dof.saturating_sub(3);
        }
        dof.max(1)
    }

    pub fn temperature(&self) -> f64 {
        2.0 * self.ke() / (KB * self.ndof() as f64)
    }

    pub fn com_temperature(&self) -> f64 {
        2.0 * self.ekg() / (KB * 3.0)
    }

    /// Startup velocity rescale; records the kinetic energy before and
    /// after.
    pub fn rescale_velocities(&mut self, scale: f64) {
        self.eki0 = self.ke();
        for v in self.vion.iter_mut() {
            *v *= scale;
        }
        self.eki1 = self.ke();
    }

    /// Remove the net momentum from the velocities (translation fix).
    pub fn remove_com_motion(&mut self) {
        let v = self.vcom();
        for ii in 0..self.nion {
            for x in 0..3 {
                self.vion[x + 3 * ii] -= v[x];
            }
        }
    }

    /// Rotate the position ring: `rion0 <- rion1 <- rion2`.
    pub fn shift_ring(&mut self) {
        std::mem::swap(&mut self.rion0, &mut self.rion1);
        self.rion1.copy_from_slice(&self.rion2);
    }

    /// First (Newton) step from explicit velocities.
    pub fn newton_step(&mut self, fion: &[f64], dt: f64) {
        for ii in 0..self.nion {
            let dtm = dt * dt / self.mass[ii];
            for x in 0..3 {
                let idx = x + 3 * ii;
                self.rion2[idx] =
                    self.rion1[idx] + dt * self.vion[idx] + 0.5 * dtm * fion[idx];
            }
        }
        for idx in 0..3 * self.nion {
            self.vion[idx] = (self.rion2[idx] - self.rion1[idx]) / dt;
        }
    }

    /// Position-Verlet step `rion2 = 2 rion1 - rion0 + dt^2 F / m`, with
    /// an optional velocity-like damping factor from the thermostat or
    /// the annealing schedule.
    pub fn verlet_step(&mut self, fion: &[f64], dt: f64, scale: f64) {
        for ii in 0..self.nion {
            let dtm = dt * dt / self.mass[ii];
            for x in 0..3 {
                let idx = x + 3 * ii;
                let dr = scale * (self.rion1[idx] - self.rion0[idx]);
                self.rion2[idx] = self.rion1[idx] + dr + dtm * fion[idx];
            }
        }
        self.update_velocities(dt);
        if self.fix_translation {
            self.remove_com_motion();
        }
    }

    fn update_velocities(&mut self, dt: f64) {
        for idx in 0..3 * self.nion {
            self.vion[idx] = (self.rion2[idx] - self.rion0[idx]) / (2.0 * dt);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;

    fn two_ions() -> Ion {
        Ion::new(
            vec!["H".to_string(), "H".to_string()],
            vec![0, 0],
            vec![1.008],
            vec![1.0],
            vec![0.0, 0.0, 0.0, 2.0, 0.0, 0.0],
            vec![1.0e-4, 0.0, 0.0, -1.0e-4, 0.0, 0.0],
        )
    }

    #[test]
    fn centres_and_temperature() {
        let ion = two_ions();
        assert_eq!(ion.gc(), [1.0, 0.0, 0.0]);
        assert_eq!(ion.com(), [1.0, 0.0, 0.0]);
        // Equal and opposite momenta: the centre of mass is at rest.
        let v = ion.vcom();
        assert_approx_eq!(f64, v[0], 0.0, epsilon = 1e-18);
        assert!(ion.temperature() > 0.0);
        assert_approx_eq!(f64, ion.com_temperature(), 0.0, epsilon = 1e-18);
    }

    #[test]
    fn rescale_records_kinetic_energies() {
        let mut ion = two_ions();
        ion.rescale_velocities(2.0);
        assert_approx_eq!(f64, ion.eki1, 4.0 * ion.eki0, epsilon = 1e-18);
    }

    #[test]
    fn ndof_honours_constraints() {
        let mut ion = two_ions();
        assert_eq!(ion.ndof(), 6);
        ion.fix_translation = true;
        assert_eq!(ion.ndof(), 3);
    }

    #[test]
    fn free_flight_verlet_is_exact() {
        // No forces: Verlet must reproduce uniform motion exactly.
        let mut ion = two_ions();
        let dt = 5.0;
        let f = vec![0.0; 6];
        let x0 = ion.rion(0, 0);
        ion.newton_step(&f, dt);
        for _ in 0..3 {
            ion.shift_ring();
            ion.verlet_step(&f, dt, 1.0);
        }
        // One Newton step plus three Verlet steps of uniform motion.
        let expect = x0 + 4.0 * dt * 1.0e-4;
        assert_approx_eq!(f64, ion.rion2[0], expect, epsilon = 1e-12);
        assert_approx_eq!(f64, ion.vion(0, 0), 1.0e-4, epsilon = 1e-12);
    }
}
