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

//! Parallel maps: how the 3D FFT grid is dealt across axis `i` and how
//! the orbital index is dealt across axis `j`.
//!
//! The 3D map supports a cyclic slab decomposition and two transverse
//! space-filling-curve decompositions (Hilbert and H-curve); every
//! orthogonal rotation of the FFT grid carries its own `(pmap, qmap)`
//! pair so the distributed transposes stay balanced.

/// Decomposition strategy for the FFT grid along axis `i`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapKind {
    /// Contiguous-cyclic z-slabs; fastest when `np_i <= nz`.
    Slab,
    /// Pseudo-Hilbert curve over the transverse plane.
    Hilbert,
    /// Serpentine H-curve over the transverse plane.
    HCurve,
}

/// Hilbert index of `(x, y)` on a `side x side` square (`side` a power
/// of two). Used only to order transverse cells, so ties are broken by
/// the caller.
fn hilbert_index(side: usize, x: usize, y: usize) -> usize {
    let (mut x, mut y) = (x, y);
    let mut d = 0;
    let mut s = side / 2;
    while s > 0 {
        let rx = if x & s > 0 { 1 } else { 0 };
        let ry = if y & s > 0 { 1 } else { 0 };
        d += s * s * ((3 * rx) ^ ry);
        if ry == 0 {
            if rx == 1 {
                x = side - 1 - x;
                y = side - 1 - y;
            }
            std::mem::swap(&mut x, &mut y);
        }
        s /= 2;
    }
    d
}

/// Order the cells of an `m x n` transverse plane along a pseudo-Hilbert
/// curve; `map[j + k*m]` receives the curve position of cell `(j, k)`.
fn hilbert2d_map(m: usize, n: usize, map: &mut [i64]) {
    let mut side = 1;
    while side < m.max(n) {
        side *= 2;
    }
    let mut order: Vec<(usize, usize)> = (0..m * n)
        .map(|c| (hilbert_index(side, c % m, c / m), c))
        .collect();
    order.sort();
    for (pos, &(_, cell)) in order.iter().enumerate() {
        map[cell] = pos as i64;
    }
}

/// Serpentine ordering of an `m x n` transverse plane.
fn hcurve2d_map(m: usize, n: usize, map: &mut [i64]) {
    for k in 0..n {
        for j in 0..m {
            let pos = if k % 2 == 0 { j } else { m - 1 - j };
            map[j + k * m] = (k * m + pos) as i64;
        }
    }
}

/// Cut a curve ordering into `np` near-equal segments.
///
/// On entry `pmap` holds curve positions; on exit `pmap[cell]` is the
/// owning rank and `qmap[cell]` the local index within that rank.
/// Returns the number of cells owned by `taskid`.
fn generate_map_indexes(
    taskid: usize,
    np: usize,
    ny: usize,
    nz: usize,
    pmap: &mut [i64],
    qmap: &mut [i64],
) -> usize {
    let ngrid = ny * nz;
    let nq1 = ngrid / np;
    let rmdr1 = ngrid % np;
    let mut nq2 = nq1;
    if rmdr1 > 0 {
        nq2 += 1;
    }

    let mut indx_proc = vec![0i64; ngrid];
    let mut indx_q = vec![0i64; ngrid];
    let mut nq = 0;
    let mut p = 0usize;
    let mut q = 0usize;
    for i in 0..ngrid {
        indx_proc[i] = p as i64;
        indx_q[i] = q as i64;
        if taskid == p {
            nq += 1;
        }
        q += 1;
        if q >= nq2 {
            q = 0;
            p = (p + 1) % np;
            if p >= rmdr1 {
                nq2 = nq1;
            }
        }
    }

    for cell in 0..ngrid {
        let pos = pmap[cell] as usize;
        pmap[cell] = indx_proc[pos];
        qmap[cell] = indx_q[pos];
    }
    nq
}

/// Quadruple a coarse transverse map onto the doubled grid so that all
/// four quadrants of a coarse cell stay co-owned; local indices of the
/// three copies are offset by the per-rank coarse count.
fn expand_map2d(
    np: usize,
    ny: usize,
    nz: usize,
    pmap_in: &[i64],
    qmap_in: &[i64],
    pmap_out: &mut [i64],
    qmap_out: &mut [i64],
) {
    for k in 0..nz {
        for j in 0..ny {
            let p = pmap_in[j + k * ny];
            pmap_out[j + k * 2 * ny] = p;
            pmap_out[j + ny + k * 2 * ny] = p;
            pmap_out[j + (k + nz) * 2 * ny] = p;
            pmap_out[j + ny + (k + nz) * 2 * ny] = p;
        }
    }

    for p in 0..np as i64 {
        let mut nqp = 0;
        for cell in 0..ny * nz {
            if pmap_in[cell] == p && qmap_in[cell] > nqp {
                nqp = qmap_in[cell];
            }
        }
        let nqp = nqp + 1;
        for k in 0..nz {
            for j in 0..ny {
                if pmap_in[j + k * ny] == p {
                    let q = qmap_in[j + k * ny];
                    qmap_out[j + k * 2 * ny] = q;
                    qmap_out[j + ny + k * 2 * ny] = q + nqp;
                    qmap_out[j + (k + nz) * 2 * ny] = q + 2 * nqp;
                    qmap_out[j + ny + (k + nz) * 2 * ny] = q + 3 * nqp;
                }
            }
        }
    }
}

/// Distribution of the 3D FFT grid over axis `i`.
///
/// Rotation 0 is the x-rows layout used for packing; rotations 1 and 2
/// cover the y- and z-oriented stages of the distributed transform.
#[derive(Debug, Clone)]
pub struct Map3 {
    pub kind: MapKind,
    np: usize,
    taskid: usize,
    nx: usize,
    ny: usize,
    nz: usize,
    pmap: [Vec<i64>; 3],
    qmap: [Vec<i64>; 3],
    nq: [usize; 3],
    nfft3d: usize,
    n2ft3d: usize,
}

impl Map3 {
    pub fn new(
        kind: MapKind,
        np: usize,
        taskid: usize,
        nx: usize,
        ny: usize,
        nz: usize,
    ) -> Map3 {
        assert!(np > 0 && taskid < np);
        assert!(nx % 2 == 0 && nx >= 4 && ny >= 4 && nz >= 4);
        let nxh1 = nx / 2 + 1;

        match kind {
            MapKind::Slab => {
                let mut pmap0 = vec![0i64; nz];
                let mut qmap0 = vec![0i64; nz];
                let mut nq = 0;
                let mut p = 0usize;
                let mut q = 0i64;
                for k in 0..nz {
                    qmap0[k] = q;
                    pmap0[k] = p as i64;
                    if p == taskid {
                        nq = (q + 1) as usize;
                    }
                    p += 1;
                    if p >= np {
                        p = 0;
                        q += 1;
                    }
                }
                let nfft3d = nxh1 * ny * nq;
                Map3 {
                    kind,
                    np,
                    taskid,
                    nx,
                    ny,
                    nz,
                    pmap: [pmap0, Vec::new(), Vec::new()],
                    qmap: [qmap0, Vec::new(), Vec::new()],
                    nq: [nq, 0, 0],
                    nfft3d,
                    n2ft3d: 2 * nfft3d,
                }
            }
            MapKind::Hilbert | MapKind::HCurve => {
                let dims = [(ny, nz), (nz, nxh1), (nxh1, ny)];
                let mut pmap: [Vec<i64>; 3] = [Vec::new(), Vec::new(), Vec::new()];
                let mut qmap: [Vec<i64>; 3] = [Vec::new(), Vec::new(), Vec::new()];
                let mut nq = [0usize; 3];
                for (r, &(m, n)) in dims.iter().enumerate() {
                    let mut p = vec![0i64; m * n];
                    let mut q = vec![0i64; m * n];
                    match kind {
                        MapKind::Hilbert => hilbert2d_map(m, n, &mut p),
                        _ => hcurve2d_map(m, n, &mut p),
                    }
                    nq[r] = generate_map_indexes(taskid, np, m, n, &mut p, &mut q);
                    pmap[r] = p;
                    qmap[r] = q;
                }
                let nfft3d = (nxh1 * nq[0]).max(ny * nq[1]).max(nz * nq[2]);
                Map3 {
                    kind,
                    np,
                    taskid,
                    nx,
                    ny,
                    nz,
                    pmap,
                    qmap,
                    nq,
                    nfft3d,
                    n2ft3d: 2 * nfft3d,
                }
            }
        }
    }

    /// Double-grid map for an upsampled density mesh: the transverse
    /// decomposition is generated on the coarse `(ny/2, nz/2)` plane and
    /// quadrupled, keeping contract/expand rank-local.
    pub fn new_doubled(
        kind: MapKind,
        np: usize,
        taskid: usize,
        nx: usize,
        ny: usize,
        nz: usize,
    ) -> Map3 {
        assert!(kind != MapKind::Slab, "double-grid maps are curve maps");
        assert!(ny % 2 == 0 && nz % 2 == 0);
        let nxh1 = nx / 2 + 1;
        let (nyh, nzh) = (ny / 2, nz / 2);

        let mut pmap_h = vec![0i64; nyh * nzh];
        let mut qmap_h = vec![0i64; nyh * nzh];
        let mut pmap1 = vec![0i64; nz * nxh1];
        let mut qmap1 = vec![0i64; nz * nxh1];
        let mut pmap2 = vec![0i64; nxh1 * ny];
        let mut qmap2 = vec![0i64; nxh1 * ny];
        match kind {
            MapKind::Hilbert => {
                hilbert2d_map(nyh, nzh, &mut pmap_h);
                hilbert2d_map(nz, nxh1, &mut pmap1);
                hilbert2d_map(nxh1, ny, &mut pmap2);
            }
            _ => {
                hcurve2d_map(nyh, nzh, &mut pmap_h);
                hcurve2d_map(nz, nxh1, &mut pmap1);
                hcurve2d_map(nxh1, ny, &mut pmap2);
            }
        }
        let nq0 = 4 * generate_map_indexes(taskid, np, nyh, nzh, &mut pmap_h, &mut qmap_h);
        let nq1 = generate_map_indexes(taskid, np, nz, nxh1, &mut pmap1, &mut qmap1);
        let nq2 = generate_map_indexes(taskid, np, nxh1, ny, &mut pmap2, &mut qmap2);

        let mut pmap0 = vec![0i64; ny * nz];
        let mut qmap0 = vec![0i64; ny * nz];
        expand_map2d(np, nyh, nzh, &pmap_h, &qmap_h, &mut pmap0, &mut qmap0);

        let nfft3d = (nxh1 * nq0).max(ny * nq1).max(nz * nq2);
        Map3 {
            kind,
            np,
            taskid,
            nx,
            ny,
            nz,
            pmap: [pmap0, pmap1, pmap2],
            qmap: [qmap0, qmap1, qmap2],
            nq: [nq0, nq1, nq2],
            nfft3d,
            n2ft3d: 2 * nfft3d,
        }
    }

    pub fn np(&self) -> usize {
        self.np
    }
    pub fn taskid(&self) -> usize {
        self.taskid
    }
    pub fn nfft3d(&self) -> usize {
        self.nfft3d
    }
    pub fn n2ft3d(&self) -> usize {
        self.n2ft3d
    }
    pub fn nq(&self, rotation: usize) -> usize {
        self.nq[rotation]
    }

    /// Owner of grid point `(i, j, k)` in the rotation-0 (x-rows) layout.
    pub fn cijktop(&self, _i: usize, j: usize, k: usize) -> usize {
        match self.kind {
            MapKind::Slab => self.pmap[0][k] as usize,
            _ => self.pmap[0][j + k * self.ny] as usize,
        }
    }

    /// Local complex index of grid point `(i, j, k)` on its owner, in the
    /// rotation-0 layout.
    pub fn cijktoindex(&self, i: usize, j: usize, k: usize) -> usize {
        let nxh1 = self.nx / 2 + 1;
        match self.kind {
            MapKind::Slab => i + nxh1 * (j + self.ny * self.qmap[0][k] as usize),
            _ => i + nxh1 * self.qmap[0][j + k * self.ny] as usize,
        }
    }
}

/// Round-robin distribution of `(spin, orbital)` pairs over axis `j`.
#[derive(Debug, Clone)]
pub struct Map1 {
    pub ispin: usize,
    pub ne: [usize; 2],
    pub neq: [usize; 2],
    np_j: usize,
    taskid_j: usize,
    pmap: [Vec<usize>; 2],
    qmap: [Vec<usize>; 2],
    counts: [Vec<usize>; 2],
}

impl Map1 {
    pub fn new(ispin: usize, ne: [usize; 2], np_j: usize, taskid_j: usize) -> Map1 {
        assert!(ispin == 1 || ispin == 2);
        assert!(taskid_j < np_j);
        assert!(ispin == 2 || ne[1] == 0, "spin-restricted runs carry ne[1] == 0");
        let mut pmap: [Vec<usize>; 2] = [Vec::new(), Vec::new()];
        let mut qmap: [Vec<usize>; 2] = [Vec::new(), Vec::new()];
        let mut counts: [Vec<usize>; 2] = [vec![0; np_j], vec![0; np_j]];
        let mut neq = [0usize; 2];
        for ms in 0..ispin {
            let mut owned = vec![0usize; np_j];
            for n in 0..ne[ms] {
                let pj = n % np_j;
                pmap[ms].push(pj);
                qmap[ms].push(owned[pj]);
                owned[pj] += 1;
            }
            counts[ms] = owned;
            neq[ms] = counts[ms][taskid_j];
        }
        Map1 {
            ispin,
            ne,
            neq,
            np_j,
            taskid_j,
            pmap,
            qmap,
            counts,
        }
    }

    pub fn np_j(&self) -> usize {
        self.np_j
    }
    pub fn taskid_j(&self) -> usize {
        self.taskid_j
    }

    /// Owner rank (along axis `j`) of orbital `(ms, n)`.
    pub fn msntop(&self, ms: usize, n: usize) -> usize {
        self.pmap[ms][n]
    }

    /// Local slot of orbital `(ms, n)` on its owner; spin blocks are
    /// contiguous, so spin 1 starts at `neq[0]`.
    pub fn msntoindex(&self, ms: usize, n: usize) -> usize {
        self.qmap[ms][n] + ms * self.neq[0]
    }

    /// Number of spin-`ms` orbitals owned by each rank of axis `j`.
    pub fn counts(&self, ms: usize) -> &[usize] {
        &self.counts[ms]
    }

    /// Global orbital index of this rank's local slot `q` (inverse of the
    /// round-robin deal).
    pub fn global_index(&self, ms: usize, q: usize) -> usize {
        let n = q * self.np_j + self.taskid_j;
        debug_assert!(n < self.ne[ms]);
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ownership_is_partition(map: &dyn Fn(usize) -> Map3, np: usize, nx: usize, ny: usize, nz: usize) {
        // Every grid point has exactly one owner, and each owner's local
        // indices are unique.
        let maps: Vec<Map3> = (0..np).map(|t| map(t)).collect();
        let mut per_rank: Vec<std::collections::HashSet<usize>> =
            (0..np).map(|_| std::collections::HashSet::new()).collect();
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx / 2 + 1 {
                    let p = maps[0].cijktop(i, j, k);
                    assert!(p < np);
                    for m in &maps {
                        assert_eq!(m.cijktop(i, j, k), p);
                    }
                    let idx = maps[p].cijktoindex(i, j, k);
                    assert!(idx < maps[p].nfft3d());
                    assert!(per_rank[p].insert(idx), "local index reused");
                }
            }
        }
        let total: usize = per_rank.iter().map(|s| s.len()).sum();
        assert_eq!(total, (nx / 2 + 1) * ny * nz);
    }

    #[test]
    fn slab_map_partitions_grid() {
        ownership_is_partition(&|t| Map3::new(MapKind::Slab, 3, t, 8, 6, 6), 3, 8, 6, 6);
    }

    #[test]
    fn hilbert_map_partitions_grid() {
        ownership_is_partition(&|t| Map3::new(MapKind::Hilbert, 4, t, 8, 6, 6), 4, 8, 6, 6);
    }

    #[test]
    fn hcurve_map_partitions_grid() {
        ownership_is_partition(&|t| Map3::new(MapKind::HCurve, 3, t, 8, 6, 6), 3, 8, 6, 6);
    }

    #[test]
    fn hilbert_segments_are_balanced() {
        let np = 4;
        let total = 16 * 16;
        let nqs: Vec<usize> = (0..np)
            .map(|t| Map3::new(MapKind::Hilbert, np, t, 8, 16, 16).nq(0))
            .collect();
        assert_eq!(nqs.iter().sum::<usize>(), total);
        let (min, max) = (nqs.iter().min().unwrap(), nqs.iter().max().unwrap());
        assert!(max - min <= 1, "curve segments differ by more than one cell");
    }

    #[test]
    fn doubled_map_coowns_quadrants() {
        let np = 3;
        let (nx, ny, nz) = (8, 8, 8);
        let maps: Vec<Map3> = (0..np)
            .map(|t| Map3::new_doubled(MapKind::Hilbert, np, t, nx, ny, nz))
            .collect();
        let (nyh, nzh) = (ny / 2, nz / 2);
        for k in 0..nzh {
            for j in 0..nyh {
                let p = maps[0].cijktop(0, j, k);
                assert_eq!(maps[0].cijktop(0, j + nyh, k), p);
                assert_eq!(maps[0].cijktop(0, j, k + nzh), p);
                assert_eq!(maps[0].cijktop(0, j + nyh, k + nzh), p);
            }
        }
        let total: usize = (0..np).map(|t| maps[t].nq(0)).sum();
        assert_eq!(total, ny * nz);
    }

    #[test]
    fn orbitals_are_dealt_round_robin() {
        let map = Map1::new(2, [5, 3], 2, 0);
        assert_eq!(map.neq, [3, 2]);
        assert_eq!(map.msntop(0, 0), 0);
        assert_eq!(map.msntop(0, 1), 1);
        assert_eq!(map.msntop(0, 4), 0);
        assert_eq!(map.msntoindex(0, 4), 2);
        // Spin-1 block starts after the local spin-0 block.
        assert_eq!(map.msntoindex(1, 0), 3);
        let sum: usize = map.counts(0).iter().sum();
        assert_eq!(sum, 5);
    }

    #[test]
    fn serial_orbital_map_is_identity() {
        let map = Map1::new(1, [4, 0], 1, 0);
        for n in 0..4 {
            assert_eq!(map.msntop(0, n), 0);
            assert_eq!(map.msntoindex(0, n), n);
        }
    }
}
