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

//! Restart-file layer: the binary orbital stream, header handling, the
//! in-place grid expander and the random-bootstrap fallback.
//!
//! Stream layout (native-endian): `i32` version, `i32[3]` FFT sizes,
//! `f64[9]` cell, `i32` ispin, `i32[2]` ne, `i32` occupation flag, then
//! one unpacked complex field of `2 (nx/2+1) ny nz` doubles per orbital,
//! followed by per-orbital occupations when the flag is positive.
//!
//! The master rank owns the file; orbital fields travel point-to-point
//! to the rank that owns the `(orbital, Brillouin)` slot, with the k-axis
//! owner derived from the k coordinate on both the read and write paths.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};

use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::orbitals::Orbitals;
use crate::parallel::{Axis, Parallel};

#[derive(Debug, Clone)]
pub struct PsiHeader {
    pub version: i32,
    pub nfft: [usize; 3],
    pub unita: [f64; 9],
    pub ispin: usize,
    pub ne: [usize; 2],
    pub occupation: i32,
}

fn read_i32(r: &mut impl Read, path: &str) -> Result<i32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b).map_err(|e| Error::io(path, e))?;
    Ok(i32::from_ne_bytes(b))
}

fn write_i32(w: &mut impl Write, v: i32, path: &str) -> Result<()> {
    w.write_all(&v.to_ne_bytes()).map_err(|e| Error::io(path, e))
}

fn read_f64s(r: &mut impl Read, out: &mut [f64], path: &str) -> Result<()> {
    let mut b = [0u8; 8];
    for x in out.iter_mut() {
        r.read_exact(&mut b).map_err(|e| Error::io(path, e))?;
        *x = f64::from_ne_bytes(b);
    }
    Ok(())
}

fn write_f64s(w: &mut impl Write, v: &[f64], path: &str) -> Result<()> {
    for x in v {
        w.write_all(&x.to_ne_bytes()).map_err(|e| Error::io(path, e))?;
    }
    Ok(())
}

fn read_header(r: &mut impl Read, path: &str) -> Result<PsiHeader> {
    let version = read_i32(r, path)?;
    let nfft = [
        read_i32(r, path)? as usize,
        read_i32(r, path)? as usize,
        read_i32(r, path)? as usize,
    ];
    let mut unita = [0.0; 9];
    read_f64s(r, &mut unita, path)?;
    let ispin = read_i32(r, path)? as usize;
    let ne = [read_i32(r, path)? as usize, read_i32(r, path)? as usize];
    let occupation = read_i32(r, path)?;
    Ok(PsiHeader {
        version,
        nfft,
        unita,
        ispin,
        ne,
        occupation,
    })
}

fn write_header(w: &mut impl Write, h: &PsiHeader, path: &str) -> Result<()> {
    write_i32(w, h.version, path)?;
    for d in h.nfft.iter() {
        write_i32(w, *d as i32, path)?;
    }
    write_f64s(w, &h.unita, path)?;
    write_i32(w, h.ispin as i32, path)?;
    write_i32(w, h.ne[0] as i32, path)?;
    write_i32(w, h.ne[1] as i32, path)?;
    write_i32(w, h.occupation, path)
}

fn broadcast_header(parall: &Parallel, header: &mut PsiHeader) {
    let mut ints = [
        header.version as i64,
        header.nfft[0] as i64,
        header.nfft[1] as i64,
        header.nfft[2] as i64,
        header.ispin as i64,
        header.ne[0] as i64,
        header.ne[1] as i64,
        header.occupation as i64,
    ];
    parall.brdcst_ivalues(Axis::Global, 0, &mut ints);
    parall.brdcst_values(Axis::Global, 0, &mut header.unita);
    header.version = ints[0] as i32;
    header.nfft = [ints[1] as usize, ints[2] as usize, ints[3] as usize];
    header.ispin = ints[4] as usize;
    header.ne = [ints[5] as usize, ints[6] as usize];
    header.occupation = ints[7] as i32;
}

/// True when the restart file exists (checked on the master, agreed by
/// every rank).
pub fn psi_filefind(parall: &Parallel, filename: &str) -> bool {
    let mut found = [0i64];
    if parall.is_master() && std::path::Path::new(filename).exists() {
        found[0] = 1;
    }
    parall.brdcst_ivalues(Axis::Global, 0, &mut found);
    found[0] > 0
}

/// Read and broadcast just the header.
pub fn psi_get_header(parall: &Parallel, filename: &str) -> Result<PsiHeader> {
    let mut header = PsiHeader {
        version: 0,
        nfft: [0; 3],
        unita: [0.0; 9],
        ispin: 1,
        ne: [0; 2],
        occupation: -1,
    };
    if parall.is_master() {
        let f = File::open(filename).map_err(|e| Error::io(filename, e))?;
        let mut r = BufReader::new(f);
        header = read_header(&mut r, filename)?;
    }
    broadcast_header(parall, &mut header);
    Ok(header)
}

/// Read the orbitals of an existing restart file into packed storage;
/// returns the occupations when the file carries them.
pub fn psi_read0(
    orbs: &Orbitals,
    filename: &str,
    psi: &mut [f64],
) -> Result<(PsiHeader, Option<Vec<f64>>)> {
    let grid = orbs.grid();
    let parall = grid.parall().clone();
    if parall.np_i() > 1 {
        return Err(Error::UnsupportedParallel(
            "restart i/o needs the FFT grid resident on one rank",
        ));
    }

    let mut reader = None;
    let mut header = PsiHeader {
        version: 0,
        nfft: [0; 3],
        unita: [0.0; 9],
        ispin: 1,
        ne: [0; 2],
        occupation: -1,
    };
    if parall.is_master() {
        let f = File::open(filename).map_err(|e| Error::io(filename, e))?;
        let mut r = BufReader::new(f);
        header = read_header(&mut r, filename)?;
        reader = Some(r);
    }
    broadcast_header(parall.as_ref(), &mut header);
    if header.nfft != [grid.nx, grid.ny, grid.nz] {
        return Err(Error::BadRestart {
            path: filename.to_string(),
            reason: format!(
                "grid {}x{}x{} does not match the running {}x{}x{}",
                header.nfft[0], header.nfft[1], header.nfft[2], grid.nx, grid.ny, grid.nz
            ),
        });
    }

    let n2ft3d = grid.n2ft3d;
    let mut tmp = vec![0.0; n2ft3d];
    for nb in 0..grid.nbrillouin() {
        let pk = grid.ktop(nb);
        let qk = grid.ktoindex(nb);
        for ms in 0..header.ispin {
            for n in 0..header.ne[ms] {
                let pj = orbs.omap().msntop(ms, n);
                let dest = parall.rank_of(0, pj, pk);
                if parall.is_master() {
                    read_f64s(reader.as_mut().unwrap(), &mut tmp, filename)?;
                    if dest != parall.taskid() {
                        parall.dsend(dest, &tmp);
                    }
                } else if dest == parall.taskid() {
                    parall.drecv(0, &mut tmp);
                }
                if dest == parall.taskid() {
                    let qj = orbs.omap().msntoindex(ms, n);
                    grid.c_pack(qk + 1, &mut tmp);
                    let indx = orbs.col_offset(qk, qj);
                    grid.cc_pack_copy(qk + 1, &tmp, &mut psi[indx..]);
                }
            }
        }
    }

    let occupations = if header.occupation > 0 {
        let ntot = header.ne[0] + header.ne[1];
        let mut occ = vec![0.0; ntot];
        if parall.is_master() {
            read_f64s(reader.as_mut().unwrap(), &mut occ, filename)?;
        }
        parall.brdcst_values(Axis::Global, 0, &mut occ);
        Some(occ)
    } else {
        None
    };

    Ok((header, occupations))
}

/// Write the orbitals (and optional occupations) as a restart stream.
pub fn psi_write(
    orbs: &Orbitals,
    filename: &str,
    psi: &[f64],
    occupations: Option<&[f64]>,
) -> Result<()> {
    let grid = orbs.grid();
    let parall = grid.parall().clone();
    if parall.np_i() > 1 {
        return Err(Error::UnsupportedParallel(
            "restart i/o needs the FFT grid resident on one rank",
        ));
    }

    let header = PsiHeader {
        version: 3,
        nfft: [grid.nx, grid.ny, grid.nz],
        unita: grid.lattice.unita_flat(),
        ispin: orbs.ispin,
        ne: orbs.ne,
        occupation: occupations.map_or(-1, |o| o.len() as i32),
    };

    let mut writer = None;
    if parall.is_master() {
        let f = File::create(filename).map_err(|e| Error::io(filename, e))?;
        let mut w = BufWriter::new(f);
        write_header(&mut w, &header, filename)?;
        writer = Some(w);
    }

    let n2ft3d = grid.n2ft3d;
    let mut tmp = vec![0.0; n2ft3d];
    for nb in 0..grid.nbrillouin() {
        let pk = grid.ktop(nb);
        let qk = grid.ktoindex(nb);
        for ms in 0..orbs.ispin {
            for n in 0..orbs.ne[ms] {
                let pj = orbs.omap().msntop(ms, n);
                let src = parall.rank_of(0, pj, pk);
                if src == parall.taskid() {
                    let qj = orbs.omap().msntoindex(ms, n);
                    let indx = orbs.col_offset(qk, qj);
                    grid.r_zero(&mut tmp);
                    grid.cc_pack_copy(qk + 1, &psi[indx..], &mut tmp);
                    grid.c_unpack(qk + 1, &mut tmp);
                    if !parall.is_master() {
                        parall.dsend(0, &tmp);
                    }
                }
                if parall.is_master() {
                    if src != parall.taskid() {
                        parall.drecv(src, &mut tmp);
                    }
                    write_f64s(writer.as_mut().unwrap(), &tmp, filename)?;
                }
            }
        }
    }

    if parall.is_master() {
        if let Some(occ) = occupations {
            write_f64s(writer.as_mut().unwrap(), occ, filename)?;
        }
        writer
            .unwrap()
            .flush()
            .map_err(|e| Error::io(filename, e))?;
    }
    Ok(())
}

/// Move one unpacked complex field between grids, preserving low
/// frequencies; `jreverse`/`kreverse` select truncation direction when
/// the target grid is smaller.
fn wvfnc_expander_convert(ngrid: [usize; 3], psi1: &[f64], dngrid: [usize; 3], psi2: &mut [f64]) {
    let inc2 = ngrid[0] / 2 + 1;
    let dinc2 = dngrid[0] / 2 + 1;
    let inc3 = inc2 * ngrid[1];
    let dinc3 = dinc2 * dngrid[1];

    let n1 = ngrid[0].min(dngrid[0]);
    let n2 = ngrid[1].min(dngrid[1]);
    let n3 = ngrid[2].min(dngrid[2]);

    let jdiff = dngrid[1] as i64 - ngrid[1] as i64;
    let kdiff = dngrid[2] as i64 - ngrid[2] as i64;
    let jreverse = jdiff < 0;
    let kreverse = kdiff < 0;
    let jdiff = jdiff.unsigned_abs() as usize;
    let kdiff = kdiff.unsigned_abs() as usize;

    for x in psi2.iter_mut() {
        *x = 0.0;
    }
    for k in 0..n3 {
        for j in 0..n2 {
            for i in 0..n1 / 2 + 1 {
                let k2 = if k < n3 / 2 { k } else { kdiff + k };
                let j2 = if j < n2 / 2 { j } else { jdiff + j };

                let (mut indx, mut dindx) = (i, i);
                if jreverse {
                    indx += j2 * inc2;
                    dindx += j * dinc2;
                } else {
                    indx += j * inc2;
                    dindx += j2 * dinc2;
                }
                if kreverse {
                    indx += k2 * inc3;
                    dindx += k * dinc3;
                } else {
                    indx += k * inc3;
                    dindx += k2 * dinc3;
                }

                psi2[2 * dindx] = psi1[2 * indx];
                psi2[2 * dindx + 1] = psi1[2 * indx + 1];
            }
        }
    }
}

/// Rewrite a restart file in place onto the current FFT grid (master
/// only; callers on other ranks fall through).
fn wvfnc_expander(orbs: &Orbitals, filename: &str) -> Result<()> {
    let grid = orbs.grid();
    if !grid.parall().is_master() {
        return Ok(());
    }
    let tmpname = format!("{}.wvfnc_expander", filename);

    let f = File::open(filename).map_err(|e| Error::io(filename, e))?;
    let mut r = BufReader::new(f);
    let header = read_header(&mut r, filename)?;

    let dnfft = [grid.nx, grid.ny, grid.nz];
    let out_header = PsiHeader {
        nfft: dnfft,
        unita: grid.lattice.unita_flat(),
        ..header.clone()
    };
    let fo = File::create(&tmpname).map_err(|e| Error::io(&tmpname, e))?;
    let mut w = BufWriter::new(fo);
    write_header(&mut w, &out_header, &tmpname)?;

    let n2ft3d = 2 * (header.nfft[0] / 2 + 1) * header.nfft[1] * header.nfft[2];
    let dn2ft3d = 2 * (dnfft[0] / 2 + 1) * dnfft[1] * dnfft[2];
    let mut psi1 = vec![0.0; n2ft3d];
    let mut psi2 = vec![0.0; dn2ft3d];
    for ms in 0..header.ispin {
        for n in 0..header.ne[ms] {
            info!(orbital = n + 1, spin = ms + 1, "converting wavefunction grid");
            read_f64s(&mut r, &mut psi1, filename)?;
            wvfnc_expander_convert(header.nfft, &psi1, dnfft, &mut psi2);
            write_f64s(&mut w, &psi2, &tmpname)?;
        }
    }
    if header.occupation > 0 {
        let mut occ = vec![0.0; header.ne[0] + header.ne[1]];
        read_f64s(&mut r, &mut occ, filename)?;
        write_f64s(&mut w, &occ, &tmpname)?;
    }
    w.flush().map_err(|e| Error::io(&tmpname, e))?;
    drop(w);
    std::fs::rename(&tmpname, filename).map_err(|e| Error::io(filename, e))?;
    Ok(())
}

/// Expand or truncate the file when its grid differs from the running
/// one.
pub fn psi_check_convert(orbs: &Orbitals, filename: &str) -> Result<()> {
    let parall = orbs.grid().parall().clone();
    let header = psi_get_header(parall.as_ref(), filename)?;
    let grid = orbs.grid();
    if header.nfft != [grid.nx, grid.ny, grid.nz] {
        info!(
            from = ?header.nfft,
            to = ?[grid.nx, grid.ny, grid.nz],
            "restart grids are being converted"
        );
        wvfnc_expander(orbs, filename)?;
    }
    Ok(())
}

/// Read a wavefunction, recovering from a missing file with a random
/// bootstrap, and re-orthogonalise when the stored orbitals have
/// drifted.
pub fn psi_read(orbs: &mut Orbitals, filename: &str, psi: &mut [f64]) -> Result<()> {
    let parall = orbs.grid().parall().clone();
    if psi_filefind(parall.as_ref(), filename) {
        psi_check_convert(orbs, filename)?;
        info!(filename, "input psi exists, reading from file");
        psi_read0(orbs, filename, psi)?;
    } else {
        info!("generating random psi from scratch");
        orbs.g_generate_random(psi)?;
        orbs.g_ortho(psi);
    }

    let sum2 = orbs.gg_traceall(psi, psi);
    let mut sum1 = (orbs.ne[0] + orbs.ne[1]) as f64;
    if orbs.ispin == 1 {
        sum1 *= 2.0;
    }
    if (sum2 - sum1).abs() > 1.0e-10 {
        warn!(
            trace = sum2,
            expected = sum1,
            "orthonormality drift on load, Gram-Schmidt being performed"
        );
        orbs.g_ortho(psi);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Backend, GDevice};
    use crate::lattice::Lattice;
    use crate::mapping::MapKind;
    use crate::pgrid::PackedGrid;
    use float_cmp::assert_approx_eq;
    use std::cell::RefCell;
    use std::rc::Rc;
    use std::sync::Arc;

    fn bundle_on_grid(ngrid: usize, wcut: f64, ecut: f64, ne: usize) -> Orbitals {
        let unita = [8.0, 0.0, 0.0, 0.0, 8.0, 0.0, 0.0, 0.0, 8.0];
        let lattice = Lattice::with_ngrid(unita, ecut, wcut, (ngrid, ngrid, ngrid));
        let grid = PackedGrid::new(
            Arc::new(Parallel::serial()),
            Rc::new(RefCell::new(GDevice::new(Backend::Host))),
            lattice,
            MapKind::Slab,
            1,
            true,
        )
        .unwrap();
        Orbitals::new(grid, 1, [ne, 0])
    }

    fn tmpfile(tag: &str) -> String {
        let dir = std::env::temp_dir();
        dir.join(format!("pwmd_{}_{}", std::process::id(), tag))
            .to_string_lossy()
            .into_owned()
    }

    #[test]
    fn restart_round_trip_preserves_the_trace() {
        let mut orbs = bundle_on_grid(16, 6.0, 12.0, 2);
        let mut psi = orbs.g_allocate();
        orbs.g_generate_random(&mut psi).unwrap();
        orbs.g_ortho(&mut psi);
        let trace0 = orbs.gg_traceall(&psi, &psi);

        let path = tmpfile("roundtrip");
        psi_write(&orbs, &path, &psi, None).unwrap();

        let mut psi2 = orbs.g_allocate();
        let (header, occ) = psi_read0(&orbs, &path, &mut psi2).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(header.nfft, [16, 16, 16]);
        assert_eq!(header.ne, [2, 0]);
        assert!(occ.is_none());
        let trace1 = orbs.gg_traceall(&psi2, &psi2);
        assert_approx_eq!(f64, trace0, trace1, epsilon = 1e-12);
        for (a, b) in psi.iter().zip(psi2.iter()) {
            assert_approx_eq!(f64, *a, *b, epsilon = 1e-13);
        }
    }

    #[test]
    fn occupations_survive_the_stream() {
        let orbs = bundle_on_grid(16, 6.0, 12.0, 2);
        let psi = orbs.g_allocate();
        let path = tmpfile("occ");
        psi_write(&orbs, &path, &psi, Some(&[1.0, 0.5])).unwrap();
        let mut psi2 = orbs.g_allocate();
        let (_, occ) = psi_read0(&orbs, &path, &mut psi2).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(occ, Some(vec![1.0, 0.5]));
    }

    #[test]
    fn missing_file_bootstraps_orthonormal_random_orbitals() {
        let mut orbs = bundle_on_grid(16, 6.0, 12.0, 2);
        let mut psi = orbs.g_allocate();
        psi_read(&mut orbs, &tmpfile("missing_never_created"), &mut psi).unwrap();
        let trace = orbs.gg_traceall(&psi, &psi);
        // Spin-restricted: 2 electrons per orbital.
        assert_approx_eq!(f64, trace, 4.0, epsilon = 1e-9);
    }

    #[test]
    fn expander_moves_orbitals_to_a_finer_grid() {
        // Scenario: save on a 16^3 grid, reload onto 32^3; norms must be
        // preserved to near machine precision because the cutoff sphere
        // is common to both grids.
        let mut coarse = bundle_on_grid(16, 6.0, 12.0, 2);
        let mut psi = coarse.g_allocate();
        coarse.g_generate_random(&mut psi).unwrap();
        coarse.g_ortho(&mut psi);
        let trace0 = coarse.gg_traceall(&psi, &psi);

        let path = tmpfile("expander");
        psi_write(&coarse, &path, &psi, None).unwrap();

        let mut fine = bundle_on_grid(32, 6.0, 12.0, 2);
        let mut psi2 = fine.g_allocate();
        psi_read(&mut fine, &path, &mut psi2).unwrap();
        std::fs::remove_file(&path).ok();

        let trace1 = fine.gg_traceall(&psi2, &psi2);
        assert!((trace0 - trace1).abs() < 1e-14 * trace0.abs().max(1.0));
    }

    #[test]
    fn header_round_trips_through_the_stream() {
        let orbs = bundle_on_grid(16, 6.0, 12.0, 2);
        let psi = orbs.g_allocate();
        let path = tmpfile("header");
        psi_write(&orbs, &path, &psi, None).unwrap();
        let parall = Parallel::serial();
        let h = psi_get_header(&parall, &path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(h.version, 3);
        assert_eq!(h.ispin, 1);
        assert_eq!(h.occupation, -1);
        assert_approx_eq!(f64, h.unita[0], 8.0, epsilon = 1e-15);
    }
}
