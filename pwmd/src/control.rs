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

//! Typed access to the runtime database (a JSON document) that drives a
//! run. All engine parameters live under the `nwpw` object; every
//! accessor falls back to the documented default when the key is absent.

use std::time::Instant;

use serde_json::Value;

use crate::error::{Error, Result};
use crate::mapping::MapKind;

pub struct Control {
    json: Value,
    start: Instant,
}

impl Control {
    pub fn new(rtdb: &str) -> Result<Control> {
        let json: Value =
            serde_json::from_str(rtdb).map_err(|e| Error::Rtdb(format!("parse failure: {}", e)))?;
        Ok(Control {
            json,
            start: Instant::now(),
        })
    }

    fn f64_at(&self, ptr: &str, default: f64) -> f64 {
        self.json.pointer(ptr).and_then(Value::as_f64).unwrap_or(default)
    }

    fn u64_at(&self, ptr: &str, default: u64) -> u64 {
        self.json.pointer(ptr).and_then(Value::as_u64).unwrap_or(default)
    }

    fn str_at(&self, ptr: &str, default: &str) -> String {
        self.json
            .pointer(ptr)
            .and_then(Value::as_str)
            .unwrap_or(default)
            .to_string()
    }

    fn bool_at(&self, ptr: &str, default: bool) -> bool {
        self.json.pointer(ptr).and_then(Value::as_bool).unwrap_or(default)
    }

    /// `loop[0]`: inner steps per outer iteration; `loop[1]`: outer
    /// iterations.
    pub fn loop_(&self, i: usize) -> usize {
        let default = if i == 0 { 10 } else { 100 };
        self.json
            .pointer("/nwpw/loop")
            .and_then(|v| v.get(i))
            .and_then(Value::as_u64)
            .unwrap_or(default) as usize
    }

    /// Time step in atomic units.
    pub fn time_step(&self) -> f64 {
        self.f64_at("/nwpw/time_step", 5.8)
    }

    /// Fictitious orbital mass.
    pub fn fake_mass(&self) -> f64 {
        self.f64_at("/nwpw/fake_mass", 400000.0)
    }

    /// Startup velocity rescales: index 0 orbitals, index 1 ions.
    pub fn scaling(&self, i: usize) -> f64 {
        self.json
            .pointer("/nwpw/scaling")
            .and_then(|v| v.get(i))
            .and_then(Value::as_f64)
            .unwrap_or(1.0)
    }

    pub fn sa(&self) -> bool {
        self.bool_at("/nwpw/SA", false)
    }

    pub fn sa_decay(&self, i: usize) -> f64 {
        self.json
            .pointer("/nwpw/sa_decay")
            .and_then(|v| v.get(i))
            .and_then(Value::as_f64)
            .unwrap_or(1.0)
    }

    pub fn initialize_wavefunction(&self) -> bool {
        self.bool_at("/nwpw/initialize_wavefunction", false)
    }

    pub fn input_movecs_filename(&self) -> String {
        self.str_at("/nwpw/input_wavefunction_filename", "input.movecs")
    }

    pub fn input_v_movecs_filename(&self) -> String {
        self.str_at("/nwpw/input_v_wavefunction_filename", "input.vmovecs")
    }

    pub fn output_movecs_filename(&self) -> String {
        let default = self.input_movecs_filename();
        self.str_at("/nwpw/output_wavefunction_filename", &default)
    }

    pub fn output_v_movecs_filename(&self) -> String {
        let default = self.input_v_movecs_filename();
        self.str_at("/nwpw/output_v_wavefunction_filename", &default)
    }

    /// Depth of the batched-FFT pipeline.
    pub fn pfft3_qsize(&self) -> usize {
        self.u64_at("/nwpw/pfft3_qsize", 4) as usize
    }

    /// Requested size of the orbital axis of the process grid.
    pub fn np_orbital(&self) -> usize {
        self.u64_at("/nwpw/np_orbital", 1) as usize
    }

    /// FFT-grid decomposition: 1 slab, 2 Hilbert, 3 H-curve.
    pub fn mapping(&self) -> MapKind {
        match self.u64_at("/nwpw/mapping", 1) {
            2 => MapKind::Hilbert,
            3 => MapKind::HCurve,
            _ => MapKind::Slab,
        }
    }

    pub fn ispin(&self) -> usize {
        self.u64_at("/nwpw/ispin", 1) as usize
    }

    pub fn ne(&self) -> [usize; 2] {
        let up = self
            .json
            .pointer("/nwpw/ne")
            .and_then(|v| v.get(0))
            .and_then(Value::as_u64)
            .unwrap_or(1) as usize;
        let dn = self
            .json
            .pointer("/nwpw/ne")
            .and_then(|v| v.get(1))
            .and_then(Value::as_u64)
            .unwrap_or(0) as usize;
        [up, dn]
    }

    /// Column-major cell vectors.
    pub fn unita(&self) -> [f64; 9] {
        let mut unita = [0.0; 9];
        if let Some(arr) = self
            .json
            .pointer("/nwpw/simulation_cell/unita")
            .and_then(Value::as_array)
        {
            for (i, v) in arr.iter().take(9).enumerate() {
                unita[i] = v.as_f64().unwrap_or(0.0);
            }
        } else {
            // Default: 20 a.u. cubic cell.
            unita[0] = 20.0;
            unita[4] = 20.0;
            unita[8] = 20.0;
        }
        unita
    }

    /// Wavefunction cutoff (Hartree).
    pub fn wcut(&self) -> f64 {
        self.f64_at("/nwpw/cutoff", 10.0)
    }

    /// Density cutoff (Hartree); defaults to twice the wavefunction
    /// cutoff.
    pub fn ecut(&self) -> f64 {
        self.f64_at("/nwpw/ecut", 2.0 * self.wcut())
    }

    pub fn nose_on(&self) -> bool {
        self.bool_at("/nwpw/nose_hoover/on", false)
    }

    pub fn nose_te(&self) -> f64 {
        self.f64_at("/nwpw/nose_hoover/Te", 298.15)
    }

    pub fn nose_tr(&self) -> f64 {
        self.f64_at("/nwpw/nose_hoover/Tr", 298.15)
    }

    pub fn nose_pe(&self) -> f64 {
        self.f64_at("/nwpw/nose_hoover/Pe", 1200.0)
    }

    pub fn nose_pr(&self) -> f64 {
        self.f64_at("/nwpw/nose_hoover/Pr", 1200.0)
    }

    /// Wall-clock budget in seconds; unlimited when absent.
    pub fn walltime(&self) -> f64 {
        self.f64_at("/nwpw/walltime", f64::INFINITY)
    }

    pub fn out_of_time(&self) -> bool {
        self.start.elapsed().as_secs_f64() > self.walltime()
    }

    pub fn fix_translation(&self) -> bool {
        self.bool_at("/nwpw/fix_translation", false)
    }

    /// Geometry block: per-ion symbols, positions, velocities, masses and
    /// charges. Positions are mandatory once ions exist.
    pub fn geometry(&self) -> (Vec<String>, Vec<f64>, Vec<f64>, Vec<f64>, Vec<f64>) {
        let symbols: Vec<String> = self
            .json
            .pointer("/geometry/symbols")
            .and_then(Value::as_array)
            .map(|a| {
                a.iter()
                    .map(|v| v.as_str().unwrap_or("X").to_string())
                    .collect()
            })
            .unwrap_or_default();
        let coords = self.f64_array("/geometry/coords");
        let velocities = if self.json.pointer("/geometry/velocities").is_some() {
            self.f64_array("/geometry/velocities")
        } else {
            vec![0.0; coords.len()]
        };
        let masses = if self.json.pointer("/geometry/masses").is_some() {
            self.f64_array("/geometry/masses")
        } else {
            vec![1.008; symbols.len()]
        };
        let charges = if self.json.pointer("/geometry/charges").is_some() {
            self.f64_array("/geometry/charges")
        } else {
            vec![1.0; symbols.len()]
        };
        (symbols, coords, velocities, masses, charges)
    }

    fn f64_array(&self, ptr: &str) -> Vec<f64> {
        self.json
            .pointer(ptr)
            .and_then(Value::as_array)
            .map(|a| a.iter().map(|v| v.as_f64().unwrap_or(0.0)).collect())
            .unwrap_or_default()
    }
}
