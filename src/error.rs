//! Unified error surface for the archiver core.
//!
//! Planner and header-emission failures are fatal to the run; sidecar read
//! failures silently downgrade to the scan fallback; worker I/O failures
//! mark the rank as failed and become a global failure through the
//! end-of-phase all-true reduction.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ArchiveError>;

#[derive(Error, Debug)]
pub enum ArchiveError {
    /// Open/read/write/seek/stat/truncate/unlink failure, with the path
    /// and operation that raised it.
    #[error("I/O error during {op} on '{path}': {source}")]
    Io {
        op:     &'static str,
        path:   PathBuf,
        source: io::Error,
    },

    /// The pax header encoder could not represent an entry.
    #[error("Failed to encode header for '{path}': {reason}")]
    Encode { path: PathBuf, reason: String },

    /// A header or data block could not be decoded from the archive.
    #[error("Failed to decode archive entry at offset {offset}: {source}")]
    Decode { offset: u64, source: io::Error },

    /// An encoded header exceeded the planner's scratch ceiling.  Fatal:
    /// the ceiling cannot grow after planning, since planned sizes must
    /// match actual emission.
    #[error("Encoded header for '{path}' is {size} bytes, exceeding the {limit}-byte ceiling")]
    Layout { path: PathBuf, size: u64, limit: u64 },

    /// The `.idx` sidecar could not be written, or its content does not
    /// match the entries it claims to describe.
    #[error("Index sidecar error for '{path}': {reason}")]
    Index { path: PathBuf, reason: String },

    /// Input validation failed before any byte was written.
    #[error("Invalid input: {0}")]
    Input(String),

    /// A read or write moved fewer bytes than the layout requires, or the
    /// archive ended mid-entry.
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// A peer rank failed during the named phase; this rank's own work was
    /// clean but the run is torn down as a whole.
    #[error("Run aborted: {0} failed on a peer rank")]
    Aborted(&'static str),
}

impl ArchiveError {
    /// Wrap an `io::Error` with the operation and path that raised it.
    pub fn io(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        ArchiveError::Io { op, path: path.into(), source }
    }
}
