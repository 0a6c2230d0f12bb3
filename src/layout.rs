//! Offset planner — assigns every entry its archive byte range.
//!
//! Planning is a dry run of the header encoder: each local entry's header
//! is encoded and discarded, keeping only its length.  Per-entry archive
//! contribution is `header_size + round_up(size, 512)` for regular files
//! and `header_size` alone otherwise; unsupported kinds contribute zero.
//! A local prefix sum plus an exclusive scan across ranks yields globally
//! contiguous, gap-free offsets — disjointness of every rank's byte ranges
//! follows by construction, with no coordination needed afterwards.

use std::path::Path;

use crate::comm::Comm;
use crate::entry::{Entry, EntryKind};
use crate::error::{ArchiveError, Result};
use crate::header;

/// Ceiling on one encoded header.  Headers carry pax records for long
/// names and (in preserve mode) whatever the on-disk object holds, so the
/// ceiling is generous; planned sizes must match emission exactly, so it
/// cannot be raised after planning.
pub const HEADER_CEILING: u64 = 128 * 1024 * 1024;

/// Round `n` up to the next 512-byte boundary.
#[inline]
pub fn pad512(n: u64) -> u64 {
    n.div_ceil(512) * 512
}

/// Planned byte ranges for one rank's entries, plus the global totals
/// every rank learns from the planning collectives.
#[derive(Debug)]
pub struct Layout {
    /// Encoded header length per local entry (0 for unsupported kinds).
    pub header_sizes: Vec<u64>,
    /// Absolute archive offset of each local entry's header.
    pub offsets:      Vec<u64>,
    /// Total archive bytes across all ranks, excluding the trailer.
    pub archive_total: u64,
    /// Total regular-file payload bytes (padded) across all ranks; drives
    /// progress percentages.
    pub data_total:   u64,
    /// Local entries whose header could not be fully populated (e.g. a
    /// symlink with no readable target).  Their slots are reserved and the
    /// run is reported failed once the archive is complete.
    pub failed_entries: u64,
}

/// Plan the layout for this rank's entry slice.  Collective: every rank
/// must call with its own slice of the globally sorted list.
pub fn plan(comm: &Comm, entries: &[Entry], cwd: &Path, preserve: bool) -> Result<Layout> {
    let mut header_sizes = vec![0u64; entries.len()];
    let mut offsets      = vec![0u64; entries.len()];

    let mut local_bytes = 0u64;
    let mut data_bytes  = 0u64;
    let mut failed      = 0u64;
    let mut fatal: Option<ArchiveError> = None;

    for (idx, entry) in entries.iter().enumerate() {
        offsets[idx] = local_bytes;

        if !entry.kind.is_supported() {
            continue;
        }

        // A symlink whose target could not be captured still reserves its
        // header slot; the run is marked failed at the end of the phase.
        if entry.kind.is_link() && entry.link_target.is_none() {
            failed += 1;
        }

        // Dry run: encode, keep the length, discard the bytes.
        let header_size = match header::encode_header(entry, cwd, preserve) {
            Ok(bytes) if (bytes.len() as u64) <= HEADER_CEILING => bytes.len() as u64,
            Ok(bytes) => {
                fatal.get_or_insert(ArchiveError::Layout {
                    path:  entry.path.clone(),
                    size:  bytes.len() as u64,
                    limit: HEADER_CEILING,
                });
                0
            }
            Err(e) => {
                log::error!("Failed to encode header for '{}': {e}", entry.path.display());
                fatal.get_or_insert(e);
                0
            }
        };
        header_sizes[idx] = header_size;

        let contribution = match entry.kind {
            EntryKind::File => {
                let padded = pad512(entry.size);
                data_bytes += padded;
                header_size + padded
            }
            _ => header_size,
        };
        local_bytes += contribution;
    }

    // The collectives run even when this rank hit a fatal error, so peers
    // are never left waiting; the driver's all-true checkpoint follows.
    let global_base   = comm.exscan_sum(local_bytes);
    let archive_total = comm.allreduce_sum(local_bytes);
    let data_total    = comm.allreduce_sum(data_bytes);

    if let Some(e) = fatal {
        return Err(e);
    }

    for off in offsets.iter_mut() {
        *off += global_base;
    }

    Ok(Layout {
        header_sizes,
        offsets,
        archive_total,
        data_total,
        failed_entries: failed,
    })
}
