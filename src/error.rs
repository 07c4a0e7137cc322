//! Crate-wide error type.
//!
//! One enum covers the whole pipeline so that every stage can propagate
//! with `?`. Recoverable conditions (unknown columns, a single observation
//! outside the ephemeris span) are logged and handled locally; what
//! reaches this type is fatal for the operation that raised it.

use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid usage: {0}")]
    Usage(String),

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parse error at {path}:{line}: {msg}")]
    Parse {
        path: PathBuf,
        line: usize,
        msg: String,
    },

    #[error("requested MJD {mjd} outside sampled interval [{start}, {end}]")]
    OutOfRange { mjd: f64, start: f64, end: f64 },

    #[error("lookup failed: {0}")]
    LookupFail(String),

    #[error("{context} failed to converge after {iterations} iterations")]
    NonConvergent { context: String, iterations: u32 },

    #[error("unresolvable duplicate: {0}")]
    DuplicateUnresolvable(String),

    #[error("invariant violated: {0}")]
    InvariantViolation(String),
}

impl Error {
    /// Attach a path to a raw IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Parse failure carrying file position context.
    pub fn parse(path: impl Into<PathBuf>, line: usize, msg: impl Into<String>) -> Self {
        Self::Parse {
            path: path.into(),
            line,
            msg: msg.into(),
        }
    }

    pub fn non_convergent(context: impl Into<String>, iterations: u32) -> Self {
        Self::NonConvergent {
            context: context.into(),
            iterations,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
