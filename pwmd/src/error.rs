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

//! Error types shared by the whole engine.
//!
//! Fatal conditions carry the numerical context (sizes, residuals, status
//! codes) rather than a backtrace; non-fatal conditions (Lagrange-multiplier
//! residuals above threshold, orthonormality drift on load) are reported as
//! `tracing` warnings at the detection site and never surface here.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// A pooled device buffer could not be allocated.
    #[error("device buffer allocation of {len} doubles failed")]
    DeviceAlloc { len: usize },

    /// A code path was entered that is not provided for the current
    /// process-grid shape.
    #[error("unsupported parallel path: {0}")]
    UnsupportedParallel(&'static str),

    /// FFT plan creation failed at construction time.
    #[error("FFT plan creation failed for length {0}")]
    FftPlan(usize),

    /// The symmetric eigensolver did not converge.
    #[error("symmetric eigensolver failed for a {n} x {n} block")]
    Eigensolver { n: usize },

    /// Filesystem failure while reading or writing a restart stream.
    #[error("i/o failure on {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A restart file whose header cannot be reconciled with the running
    /// configuration.
    #[error("restart file {path} is incompatible: {reason}")]
    BadRestart { path: String, reason: String },

    /// Malformed or missing runtime-database content.
    #[error("runtime database: {0}")]
    Rtdb(String),
}

impl Error {
    pub(crate) fn io(path: &str, source: std::io::Error) -> Error {
        Error::Io {
            path: path.to_string(),
            source,
        }
    }
}
