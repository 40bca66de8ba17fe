//! Errors

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Coarse classification of an error, per the error-kind taxonomy the
/// pipeline is required to expose: I/O, compressor, format, limit,
/// resource, internal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Io,
    Compressor,
    Format,
    Limit,
    Resource,
    Internal,
}

/// Errors generated by the block processor, fragment accumulator, writer,
/// manifest parser, and directory scanner.
#[derive(Error, Debug)]
pub enum SqfsBuildError {
    #[error("I/O error on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error("std io error: {0}")]
    StdIo(#[from] io::Error),

    #[error("compressor error: {0}")]
    Compressor(String),

    #[error("{file}:{line}: {message}")]
    Manifest {
        file: PathBuf,
        line: usize,
        message: String,
    },

    #[error("limit exceeded: {0}")]
    Limit(String),

    #[error("resource exhausted: {0}")]
    Resource(String),

    #[error("internal invariant violation: {0}")]
    Internal(String),

    /// A sticky-status snapshot: the display text of whatever error first
    /// set [`crate::queue::Shared`]'s status, carrying its original
    /// [`ErrorKind`] along rather than collapsing everything to
    /// `Internal` (the classification §7 requires must survive the trip
    /// through the shared status cell).
    #[error("{message}")]
    Sticky { kind: ErrorKind, message: String },

    #[error("block processor has already failed: {0}")]
    Poisoned(Box<SqfsBuildError>),

    #[error("unsupported compressor: {0:?}")]
    UnsupportedCompressor(crate::compressor::Compressor),

    #[error("feature not implemented: {0}")]
    Unimplemented(&'static str),
}

impl SqfsBuildError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SqfsBuildError::Io { .. } | SqfsBuildError::StdIo(_) => ErrorKind::Io,
            SqfsBuildError::Compressor(_) | SqfsBuildError::UnsupportedCompressor(_) => {
                ErrorKind::Compressor
            }
            SqfsBuildError::Manifest { .. } => ErrorKind::Format,
            SqfsBuildError::Limit(_) => ErrorKind::Limit,
            SqfsBuildError::Resource(_) => ErrorKind::Resource,
            SqfsBuildError::Internal(_) | SqfsBuildError::Unimplemented(_) => ErrorKind::Internal,
            SqfsBuildError::Sticky { kind, .. } => *kind,
            SqfsBuildError::Poisoned(inner) => inner.kind(),
        }
    }

    /// Process exit code this error maps to: 0 success, 1 user error, 2
    /// I/O error. Internal failures are surfaced as a plain runtime
    /// failure at the process boundary.
    pub fn exit_code(&self) -> i32 {
        match self.kind() {
            // Manifest syntax and CLI-argument misuse (bad block size,
            // output already exists, missing -F/-D) are user errors.
            ErrorKind::Format | ErrorKind::Limit => 1,
            ErrorKind::Io | ErrorKind::Compressor | ErrorKind::Resource | ErrorKind::Internal => 2,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        SqfsBuildError::Io {
            path: path.into(),
            source,
        }
    }

    /// Wraps a previously recorded sticky-status `(kind, message)` as a
    /// poisoned error for callers observing it after the fact, preserving
    /// the classification of whichever error first set the status.
    pub(crate) fn poisoned(kind: ErrorKind, message: String) -> Self {
        SqfsBuildError::Poisoned(Box::new(SqfsBuildError::Sticky { kind, message }))
    }
}

pub type Result<T> = std::result::Result<T, SqfsBuildError>;
