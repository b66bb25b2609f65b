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

//! Nose-Hoover thermostats for the fictitious electron dynamics and for
//! the ions.
//!
//! Each subsystem carries an independent single chain. The chains feed
//! the Verlet update through multiplicative damping factors on the
//! velocity-like difference term, and contribute their own energy to the
//! conserved quantity.

use crate::ion::KB;

#[derive(Debug, Clone)]
struct Chain {
    /// Target kinetic energy of the coupled subsystem.
    ke_target: f64,
    /// Thermostat inertia.
    q: f64,
    /// Thermostat coordinate and velocity.
    x: f64,
    xdot: f64,
}

impl Chain {
    fn advance(&mut self, ke: f64, dt: f64) {
        let accel = 2.0 * (ke - self.ke_target) / self.q;
        self.xdot += dt * accel;
        self.x += dt * self.xdot;
    }

    /// Damping applied to the `r1 - r0` difference in the Verlet step.
    fn scale(&self, dt: f64) -> f64 {
        (1.0 - 0.5 * dt * self.xdot) / (1.0 + 0.5 * dt * self.xdot)
    }

    fn energy(&self) -> f64 {
        0.5 * self.q * self.xdot * self.xdot + 2.0 * self.ke_target * self.x
    }
}

/// Paired electron / ion thermostats; inactive unless constructed `on`.
pub struct NoseHoover {
    on: bool,
    pub te: f64,
    pub tr: f64,
    dt: f64,
    elc: Chain,
    ion: Chain,
}

impl NoseHoover {
    /// `te`/`tr` are the electron and ion target temperatures (Kelvin),
    /// `pe`/`pr` the coupling periods (a.u. of time), `ne_total` the
    /// number of occupied orbitals and `ndof` the ionic degrees of
    /// freedom.
    pub fn new(
        on: bool,
        te: f64,
        tr: f64,
        pe: f64,
        pr: f64,
        ne_total: usize,
        ndof: usize,
        dt: f64,
    ) -> NoseHoover {
        // ke targets: the fictitious electron system is driven toward a
        // small fixed kinetic energy proportional to Te, the ions toward
        // the equipartition value.
        let ke_e = 0.5 * KB * te * ne_total.max(1) as f64;
        let ke_r = 0.5 * KB * tr * ndof.max(1) as f64;
        let qe = 2.0 * ke_e * pe * pe;
        let qr = 2.0 * ke_r * pr * pr;
        NoseHoover {
            on,
            te,
            tr,
            dt,
            elc: Chain {
                ke_target: ke_e,
                q: qe.max(1.0e-12),
                x: 0.0,
                xdot: 0.0,
            },
            ion: Chain {
                ke_target: ke_r,
                q: qr.max(1.0e-12),
                x: 0.0,
                xdot: 0.0,
            },
        }
    }

    pub fn off() -> NoseHoover {
        NoseHoover::new(false, 0.0, 0.0, 1.0, 1.0, 1, 1, 1.0)
    }

    pub fn on(&self) -> bool {
        self.on
    }

    /// Advance both chains from the measured kinetic energies.
    pub fn integrate(&mut self, eke_elc: f64, eke_ion: f64) {
        if !self.on {
            return;
        }
        self.elc.advance(eke_elc, self.dt);
        self.ion.advance(eke_ion, self.dt);
    }

    /// Damping factor for the electronic Verlet difference term.
    pub fn scale_e(&self) -> f64 {
        if self.on {
            self.elc.scale(self.dt)
        } else {
            1.0
        }
    }

    /// Damping factor for the ionic Verlet difference term.
    pub fn scale_r(&self) -> f64 {
        if self.on {
            self.ion.scale(self.dt)
        } else {
            1.0
        }
    }

    /// Retarget both chains (simulated annealing drives the targets
    /// down).
    pub fn retarget(&mut self, te: f64, tr: f64, ne_total: usize, ndof: usize) {
        self.te = te;
        self.tr = tr;
        self.elc.ke_target = 0.5 * KB * te * ne_total.max(1) as f64;
        self.ion.ke_target = 0.5 * KB * tr * ndof.max(1) as f64;
    }

    /// Thermostat contribution to the conserved quantity.
    pub fn e_energy(&self) -> f64 {
        if self.on {
            self.elc.energy()
        } else {
            0.0
        }
    }

    pub fn r_energy(&self) -> f64 {
        if self.on {
            self.ion.energy()
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;

    #[test]
    fn inactive_thermostat_is_identity() {
        let nose = NoseHoover::off();
        assert!(!nose.on());
        assert_approx_eq!(f64, nose.scale_e(), 1.0, epsilon = 1e-15);
        assert_approx_eq!(f64, nose.scale_r(), 1.0, epsilon = 1e-15);
        assert_approx_eq!(f64, nose.e_energy(), 0.0, epsilon = 1e-15);
    }

    #[test]
    fn hot_system_is_damped() {
        let mut nose = NoseHoover::new(true, 300.0, 300.0, 100.0, 100.0, 4, 6, 5.0);
        let target = 0.5 * KB * 300.0 * 6.0;
        // Run hotter than the target: the chain velocity turns positive
        // and the scale factor drops below one.
        for _ in 0..5 {
            nose.integrate(10.0 * target, 10.0 * target);
        }
        assert!(nose.scale_r() < 1.0);
        assert!(nose.r_energy() != 0.0);
    }

    #[test]
    fn cold_system_is_driven() {
        let mut nose = NoseHoover::new(true, 300.0, 300.0, 100.0, 100.0, 4, 6, 5.0);
        for _ in 0..5 {
            nose.integrate(0.0, 0.0);
        }
        assert!(nose.scale_r() > 1.0);
    }
}
