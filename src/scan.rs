//! Metadata scanner — rebuilds the entry list from an archive.
//!
//! Three paths, in falling order of preference:
//!
//! 1. **Indexed** ([`read_metadata_at`]): with sidecar offsets in hand,
//!    each rank seeks straight to its assigned entries.  A fresh one-shot
//!    decoder is opened per entry and dropped after the header — that
//!    short lifecycle keeps the decoder from reading into payload bytes a
//!    peer may be touching concurrently.
//! 2. **Offset recovery** ([`recover_offsets`]): no sidecar, but the
//!    archive is a plain uncompressed tar — rank 0 walks every header
//!    once, reconstructs each entry's start offset (pax preludes
//!    included), and broadcasts the result.  Extraction then proceeds as
//!    if indexed, and the sidecar is rewritten for next time.
//! 3. **Streaming** ([`read_metadata_streaming`]): a single decoder reads
//!    every header from byte zero to EOF on every rank; entry `j` is kept
//!    by the rank satisfying `j % ranks == rank`.  Entry offsets are not
//!    recovered, so extraction must stream the same way.

use std::fs::File;
use std::io::{BufReader, Seek, SeekFrom};
use std::ops::Range;
use std::path::Path;
use std::time::{Duration, Instant};

use crate::comm::Comm;
use crate::entry::{Entry, EntryKind};
use crate::error::{ArchiveError, Result};
use crate::layout::pad512;
use crate::paths;

/// Read granularity for header-only passes; headers and pax records are
/// small, so a large buffer would only drag payload bytes through cache.
const HEADER_BLOCK: usize = 10 * 1024;

// ── Entry conversion ─────────────────────────────────────────────────────────

/// Convert a decoded tar entry into a list [`Entry`].  The member name is
/// reduced against `cwd` and joined to an absolute path.
fn entry_from_tar<R: std::io::Read>(
    item:   &mut tar::Entry<R>,
    cwd:    &Path,
    offset: u64,
) -> Result<Entry> {
    let decode = |e: std::io::Error| ArchiveError::Decode { offset, source: e };

    let rel = item.path().map_err(decode)?.into_owned();
    let path = paths::join_reduced(cwd, &rel);

    let header = item.header();
    let et = header.entry_type();
    let kind = if et.is_dir() {
        EntryKind::Dir
    } else if et.is_symlink() {
        EntryKind::Link
    } else if et.is_file() {
        EntryKind::File
    } else {
        EntryKind::Other
    };

    let size  = item.size();
    let mode  = header.mode().map_err(decode)?;
    let uid   = header.uid().map_err(decode)?;
    let gid   = header.gid().map_err(decode)?;
    let mtime = header.mtime().map_err(decode)? as i64;
    let uname = header.username().ok().flatten().map(str::to_owned);
    let gname = header.groupname().ok().flatten().map(str::to_owned);
    let link_target = item
        .link_name()
        .map_err(decode)?
        .map(|t| t.into_owned());

    Ok(Entry {
        path,
        kind,
        size: if kind.is_file() { size } else { 0 },
        mode,
        uid,
        gid,
        uname,
        gname,
        atime:       mtime,
        atime_nsec:  0,
        mtime,
        mtime_nsec:  0,
        ctime:       mtime,
        ctime_nsec:  0,
        link_target,
    })
}

// ── Indexed scan ─────────────────────────────────────────────────────────────

/// Read the headers for entries `range` using sidecar offsets.  One
/// decoder per entry, dropped before the next seek.
pub fn read_metadata_at(
    archive: &Path,
    offsets: &[u64],
    range:   Range<usize>,
    cwd:     &Path,
) -> Result<Vec<Entry>> {
    let file = File::open(archive).map_err(|e| ArchiveError::io("open", archive, e))?;

    let mut entries = Vec::with_capacity(range.len());
    for idx in range {
        let offset = offsets[idx];
        (&file)
            .seek(SeekFrom::Start(offset))
            .map_err(|e| ArchiveError::io("seek", archive, e))?;

        let mut decoder = tar::Archive::new(BufReader::with_capacity(HEADER_BLOCK, &file));
        let mut inner = decoder
            .entries()
            .map_err(|e| ArchiveError::Decode { offset, source: e })?;
        let mut item = inner
            .next()
            .ok_or_else(|| {
                ArchiveError::Protocol(format!(
                    "unexpected end of archive at entry {idx} (offset {offset})"
                ))
            })?
            .map_err(|e| ArchiveError::Decode { offset, source: e })?;

        entries.push(entry_from_tar(&mut item, cwd, offset)?);
    }
    Ok(entries)
}

// ── Streaming scan ───────────────────────────────────────────────────────────

/// Streaming fallback: decode every header from byte zero, keeping the
/// entries striped onto this rank.  Every rank reads to EOF.
pub fn read_metadata_streaming(
    archive: &Path,
    cwd:     &Path,
    rank:    usize,
    ranks:   usize,
) -> Result<Vec<Entry>> {
    let file = File::open(archive).map_err(|e| ArchiveError::io("open", archive, e))?;
    let mut decoder = tar::Archive::new(BufReader::with_capacity(1024 * 1024, file));

    let mut entries = Vec::new();
    let iter = decoder
        .entries()
        .map_err(|e| ArchiveError::Decode { offset: 0, source: e })?;
    for (count, item) in iter.enumerate() {
        let mut item = item.map_err(|e| ArchiveError::Decode { offset: 0, source: e })?;
        if count % ranks == rank {
            let offset = item.raw_file_position();
            entries.push(entry_from_tar(&mut item, cwd, offset)?);
        }
    }
    Ok(entries)
}

// ── Offset recovery ──────────────────────────────────────────────────────────

/// Rank 0 scans every header to rebuild the per-entry offset array, then
/// broadcasts it.  Returns `None` when the archive cannot be walked (for
/// example a compressed tar), in which case extraction must stream.
/// Collective.
pub fn recover_offsets(
    comm:     &Comm,
    archive:  &Path,
    interval: Option<Duration>,
) -> Option<Vec<u64>> {
    if comm.is_root() {
        log::info!("Indexing archive");
        let scanned = match scan_entry_offsets(archive, interval) {
            Ok(offsets) => Some(offsets),
            Err(e) => {
                log::error!("Failed to index {}: {e}", archive.display());
                None
            }
        };
        comm.broadcast(0, Some(scanned))
    } else {
        comm.broadcast(0, None)
    }
}

/// Walk the archive sequentially and record the byte offset at which each
/// entry begins.  An entry "begins" at its first header block, which is
/// the pax prelude when one is present — the running position is advanced
/// from the previous entry's payload end rather than taken from the
/// decoder's header position, which would skip the prelude.
pub fn scan_entry_offsets(archive: &Path, interval: Option<Duration>) -> Result<Vec<u64>> {
    let file_size = std::fs::metadata(archive)
        .map_err(|e| ArchiveError::io("stat", archive, e))?
        .len();
    let file = File::open(archive).map_err(|e| ArchiveError::io("open", archive, e))?;
    let mut decoder = tar::Archive::new(BufReader::with_capacity(HEADER_BLOCK, file));

    let start = Instant::now();
    let mut last = start;

    let mut offsets = Vec::new();
    let mut next_pos = 0u64;

    let iter = decoder
        .entries()
        .map_err(|e| ArchiveError::Decode { offset: 0, source: e })?;
    for item in iter {
        let item = item.map_err(|e| ArchiveError::Decode { offset: next_pos, source: e })?;
        offsets.push(next_pos);
        next_pos = item.raw_file_position() + pad512(item.size());

        if let Some(period) = interval {
            let now = Instant::now();
            if now.duration_since(last) > period && file_size > 0 {
                let percent = next_pos as f64 * 100.0 / file_size as f64;
                let secs = now.duration_since(start).as_secs_f64();
                let remaining = if percent > 0.0 {
                    (100.0 - percent) * secs / percent
                } else {
                    0.0
                };
                log::info!(
                    "Indexed {} items in {:.3} secs ({:.0}%) {:.0} secs left ...",
                    offsets.len(), secs, percent, remaining
                );
                last = now;
            }
        }
    }
    Ok(offsets)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a small archive through the library's own writer.
    fn sample_archive(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("sample.tar");
        let mut builder = tar::Builder::new(File::create(&path).unwrap());

        let mut add_file = |name: &str, data: &[u8]| {
            let mut header = tar::Header::new_ustar();
            header.set_mode(0o644);
            header.set_uid(0);
            header.set_gid(0);
            header.set_size(data.len() as u64);
            header.set_mtime(1_600_000_000);
            header.set_cksum();
            builder.append_data(&mut header, name, data).unwrap();
        };
        add_file("a.txt", b"hello");
        add_file("b/c.bin", &[0u8; 600]);
        add_file("empty", b"");
        builder.finish().unwrap();
        path
    }

    #[test]
    fn recovered_offsets_start_at_zero_and_tile() {
        let dir = tempfile::tempdir().unwrap();
        let path = sample_archive(dir.path());
        let offsets = scan_entry_offsets(&path, None).unwrap();
        assert_eq!(offsets.len(), 3);
        assert_eq!(offsets[0], 0);
        // a.txt: 512 header + 512 padded payload.
        assert_eq!(offsets[1], 1024);
        // b/c.bin: 512 header + 1024 padded payload.
        assert_eq!(offsets[2], 1024 + 1536);
    }

    #[test]
    fn indexed_scan_reads_single_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = sample_archive(dir.path());
        let offsets = scan_entry_offsets(&path, None).unwrap();

        let out = Path::new("/restore");
        let entries = read_metadata_at(&path, &offsets, 1..3, out).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].path, Path::new("/restore/b/c.bin"));
        assert_eq!(entries[0].size, 600);
        assert_eq!(entries[1].path, Path::new("/restore/empty"));
        assert_eq!(entries[1].size, 0);
    }

    #[test]
    fn streaming_scan_stripes_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = sample_archive(dir.path());
        let out = Path::new("/restore");

        let rank0 = read_metadata_streaming(&path, out, 0, 2).unwrap();
        let rank1 = read_metadata_streaming(&path, out, 1, 2).unwrap();
        assert_eq!(rank0.len(), 2); // entries 0 and 2
        assert_eq!(rank1.len(), 1); // entry 1
        assert_eq!(rank1[0].path, Path::new("/restore/b/c.bin"));
    }

    #[test]
    fn corrupt_header_is_a_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = sample_archive(dir.path());
        let offsets = vec![100u64]; // mid-header garbage offset
        let out = Path::new("/restore");
        let err = read_metadata_at(&path, &offsets, 0..1, out).unwrap_err();
        assert!(matches!(err, ArchiveError::Decode { .. } | ArchiveError::Protocol(_)));
    }
}
