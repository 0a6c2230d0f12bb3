//! Chunk scheduler — parallel payload streaming.
//!
//! The performance-critical subsystem: it moves regular-file payload bytes
//! between source files and the archive, in parallel, exactly once per
//! byte, with no per-chunk coordination.  Byte-range disjointness comes
//! entirely from the layout; the queue only decides *who* moves a chunk,
//! never *where* it lands.
//!
//! # Work distribution
//!
//! Each rank enqueues one [`ChunkWorkItem`] per chunk of its own regular
//! files into a per-rank work-stealing deque.  Workers drain their own
//! deque first and steal from backlogged peers when empty — no locality
//! assumption, any rank may execute any chunk.  Global termination is a
//! shared outstanding-item counter: produced counts are added before the
//! start barrier, one decrement per consumed item, and the loop exits when
//! the counter reaches zero.
//!
//! # Failure
//!
//! A failed chunk marks the executing rank as failed and the item as
//! consumed; the failure is not propagated mid-run but surfaces in the
//! terminal all-true reduction.  There are no chunk-level retries; the
//! storage stack is assumed correct.

use std::fs::{self, File};
use std::io::{BufReader, Seek, SeekFrom};
use std::ops::Range;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::OnceLock;

use crossbeam::deque::{Steal, Stealer, Worker};
use crossbeam::utils::Backoff;
use filetime::FileTime;

use crate::archive::ArchiveOptions;
use crate::comm::Comm;
use crate::entry::Entry;
use crate::error::{ArchiveError, Result};
use crate::layout::Layout;
use crate::progress::Progress;

// ── Work items ───────────────────────────────────────────────────────────────

/// One unit of payload work: chunk `chunk_index` of the file at
/// `source`, landing at `archive_base + chunk_index * chunk_size`.
/// Produced once by the generator, consumed exactly once by some worker.
#[derive(Debug)]
pub struct ChunkWorkItem {
    pub source:       PathBuf,
    pub file_size:    u64,
    pub chunk_index:  u64,
    pub archive_base: u64,
}

/// Chunk items for this rank's regular files: `ceil(size / chunk)` per
/// file, and a single degenerate item for empty files so they still
/// traverse the write path.
fn generate_items(entries: &[Entry], layout: &Layout, chunk: u64) -> Vec<ChunkWorkItem> {
    let mut items = Vec::new();
    for (idx, entry) in entries.iter().enumerate() {
        if !entry.kind.is_file() {
            continue;
        }
        let archive_base = layout.offsets[idx] + layout.header_sizes[idx];
        let chunks = entry.size.div_ceil(chunk).max(1);
        for chunk_index in 0..chunks {
            items.push(ChunkWorkItem {
                source: entry.path.clone(),
                file_size: entry.size,
                chunk_index,
                archive_base,
            });
        }
    }
    items
}

/// Index of the chunk responsible for a file's trailing padding.
#[inline]
fn last_chunk(file_size: u64, chunk: u64) -> u64 {
    let num_full = file_size / chunk;
    let rem = file_size - num_full * chunk;
    if file_size == 0 {
        0
    } else if rem > 0 {
        num_full
    } else {
        num_full - 1
    }
}

// ── Shared queue state ───────────────────────────────────────────────────────

struct ChunkQueue {
    stealers:  Vec<OnceLock<Stealer<ChunkWorkItem>>>,
    remaining: AtomicU64,
}

impl ChunkQueue {
    fn new(ranks: usize) -> Self {
        ChunkQueue {
            stealers:  (0..ranks).map(|_| OnceLock::new()).collect(),
            remaining: AtomicU64::new(0),
        }
    }
}

fn steal_from_peers(queue: &ChunkQueue, rank: usize) -> Option<ChunkWorkItem> {
    let ranks = queue.stealers.len();
    for step in 1..ranks {
        let peer = (rank + step) % ranks;
        let Some(stealer) = queue.stealers[peer].get() else { continue };
        loop {
            match stealer.steal() {
                Steal::Success(item) => return Some(item),
                Steal::Empty => break,
                Steal::Retry => {}
            }
        }
    }
    None
}

// ── Payload copy (create path) ───────────────────────────────────────────────

/// Stream this rank's payload chunks into the archive, stealing peer
/// chunks once local work runs dry.  Collective; returns `Err` if any
/// chunk executed *by this rank* failed.
pub fn copy_payloads(
    comm:         &Comm,
    entries:      &[Entry],
    layout:       &Layout,
    archive:      &File,
    archive_path: &Path,
    opts:         &ArchiveOptions,
    progress:     &Progress,
) -> Result<()> {
    let rank = comm.rank();
    let queue = comm.shared(|| ChunkQueue::new(comm.ranks()));

    let local = Worker::new_fifo();
    queue.stealers[rank]
        .set(local.stealer())
        .unwrap_or_else(|_| unreachable!("stealer registered twice for rank {rank}"));

    let items = generate_items(entries, layout, opts.chunk_size);
    let produced = items.len() as u64;
    for item in items {
        local.push(item);
    }
    queue.remaining.fetch_add(produced, Ordering::SeqCst);

    // All deques populated and all stealers registered past this point.
    comm.barrier();

    let mut buf = vec![0u8; opts.block_size.min(opts.chunk_size).max(512) as usize];
    let mut first_error: Option<ArchiveError> = None;
    let backoff = Backoff::new();

    loop {
        match local.pop().or_else(|| steal_from_peers(&queue, rank)) {
            Some(item) => {
                backoff.reset();
                if let Err(e) = copy_chunk(&item, archive, archive_path, opts, &mut buf, progress, rank) {
                    log::error!("Chunk {} of '{}' failed: {e}", item.chunk_index, item.source.display());
                    first_error.get_or_insert(e);
                }
                queue.remaining.fetch_sub(1, Ordering::SeqCst);
                progress.tick(rank);
            }
            None => {
                if queue.remaining.load(Ordering::SeqCst) == 0 {
                    break;
                }
                progress.tick(rank);
                backoff.snooze();
            }
        }
    }

    comm.barrier();
    match first_error {
        None => Ok(()),
        Some(e) => Err(e),
    }
}

/// Move one chunk: positional reads from the source at `k * chunk`,
/// positional writes into the archive at `archive_base + k * chunk`, in
/// `block_size`-sized transfers bounded by the chunk's byte range.  The
/// chunk owning the file's tail also writes the 512-byte round-up
/// padding, which stays inside the range the layout reserved for this
/// file.
fn copy_chunk(
    item:         &ChunkWorkItem,
    archive:      &File,
    archive_path: &Path,
    opts:         &ArchiveOptions,
    buf:          &mut [u8],
    progress:     &Progress,
    rank:         usize,
) -> Result<()> {
    let source = File::open(&item.source)
        .map_err(|e| ArchiveError::io("open", &item.source, e))?;

    let begin = item.chunk_index * opts.chunk_size;
    let end   = ((item.chunk_index + 1) * opts.chunk_size).min(item.file_size);

    let mut src_off = begin;
    let mut dst_off = item.archive_base + begin;
    while src_off < end {
        let want = ((end - src_off) as usize).min(buf.len());
        let n = source
            .read_at(&mut buf[..want], src_off)
            .map_err(|e| ArchiveError::io("read", &item.source, e))?;
        if n == 0 {
            return Err(ArchiveError::Protocol(format!(
                "'{}' ended at {src_off} of {} expected bytes",
                item.source.display(), item.file_size
            )));
        }
        archive
            .write_all_at(&buf[..n], dst_off)
            .map_err(|e| ArchiveError::io("write", archive_path, e))?;
        progress.add(rank, n as u64, 0);
        src_off += n as u64;
        dst_off += n as u64;
    }

    if item.chunk_index == last_chunk(item.file_size, opts.chunk_size) {
        let pad = ((512 - (item.file_size % 512)) % 512) as usize;
        if pad > 0 {
            let zeros = [0u8; 512];
            archive
                .write_all_at(&zeros[..pad], item.archive_base + item.file_size)
                .map_err(|e| ArchiveError::io("write padding", archive_path, e))?;
        }
    }
    Ok(())
}

// ── Extraction (offset path) ─────────────────────────────────────────────────

/// Materialize entries `range` from the archive using sidecar offsets:
/// seek, one-shot decoder, header, payload streamed to disk, decoder
/// dropped.  Returns `Err` if any of this rank's entries failed.
pub fn extract_payloads_offsets(
    archive: &Path,
    offsets: &[u64],
    range:   Range<usize>,
    cwd:     &Path,
    opts:    &ArchiveOptions,
    progress: &Progress,
    rank:    usize,
) -> Result<()> {
    let file = File::open(archive).map_err(|e| ArchiveError::io("open", archive, e))?;
    let buffer = opts.chunk_size.min(1024 * 1024) as usize;

    for idx in range {
        let offset = offsets[idx];
        (&file)
            .seek(SeekFrom::Start(offset))
            .map_err(|e| ArchiveError::io("seek", archive, e))?;

        // Headers and payload sit in one contiguous region here, so the
        // read buffer is sized to the chunk rather than to a header.
        let mut decoder = tar::Archive::new(BufReader::with_capacity(buffer, &file));
        configure_unpack(&mut decoder, opts);

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

        unpack_entry(&mut item, cwd, offset)?;

        let bytes = if item.header().entry_type().is_file() { item.size() } else { 0 };
        progress.add(rank, bytes, 1);
        progress.tick(rank);
    }
    Ok(())
}

// ── Extraction (streaming path) ──────────────────────────────────────────────

/// Rank-striped streaming extraction: one decoder advances through every
/// header; entry `j` is materialized by the rank with `j % ranks == rank`.
/// Skipped entries' payload bytes are consumed by the decoder as part of
/// advancing to the next header.  Reads to EOF on every rank.
pub fn extract_payloads_streaming(
    archive:  &Path,
    cwd:      &Path,
    opts:     &ArchiveOptions,
    progress: &Progress,
    rank:     usize,
    ranks:    usize,
) -> Result<()> {
    let file = File::open(archive).map_err(|e| ArchiveError::io("open", archive, e))?;
    let mut decoder = tar::Archive::new(BufReader::with_capacity(1024 * 1024, file));
    configure_unpack(&mut decoder, opts);

    let iter = decoder
        .entries()
        .map_err(|e| ArchiveError::Decode { offset: 0, source: e })?;
    for (count, item) in iter.enumerate() {
        let mut item = item.map_err(|e| ArchiveError::Decode { offset: 0, source: e })?;
        if count % ranks != rank {
            continue;
        }
        let offset = item.raw_file_position();
        unpack_entry(&mut item, cwd, offset)?;

        let bytes = if item.header().entry_type().is_file() { item.size() } else { 0 };
        progress.add(rank, bytes, 1);
        progress.tick(rank);
    }
    Ok(())
}

fn configure_unpack<R: std::io::Read>(decoder: &mut tar::Archive<R>, opts: &ArchiveOptions) {
    decoder.set_preserve_permissions(true);
    decoder.set_preserve_mtime(true);
    decoder.set_overwrite(true);
    if opts.preserve {
        decoder.set_unpack_xattrs(true);
        decoder.set_preserve_ownerships(true);
    }
}

fn unpack_entry<R: std::io::Read>(
    item:   &mut tar::Entry<R>,
    cwd:    &Path,
    offset: u64,
) -> Result<()> {
    let written = item
        .unpack_in(cwd)
        .map_err(|e| ArchiveError::Decode { offset, source: e })?;
    if !written {
        log::warn!(
            "Skipped entry at offset {offset}: member name escapes '{}'",
            cwd.display()
        );
    }
    Ok(())
}

// ── Directory phases ─────────────────────────────────────────────────────────

/// Pre-create every directory this rank owns.  Runs before any payload is
/// written, so a rank creating a file never races a peer that still owes
/// creation of the parent.  `create_dir_all` makes concurrent creation of
/// shared ancestors benign.
pub fn precreate_dirs(entries: &[Entry]) -> Result<()> {
    for entry in entries {
        if entry.kind.is_dir() {
            fs::create_dir_all(&entry.path)
                .map_err(|e| ArchiveError::io("mkdir", &entry.path, e))?;
        }
    }
    Ok(())
}

/// Re-apply directory timestamps from the metadata list.  Runs after all
/// payloads are on disk and a barrier has been crossed — creating children
/// mutates parent mtimes, so doing this earlier would be undone.
pub fn fixup_dir_times(entries: &[Entry]) -> Result<()> {
    for entry in entries {
        if entry.kind.is_dir() {
            let atime = FileTime::from_unix_time(entry.atime, entry.atime_nsec as u32);
            let mtime = FileTime::from_unix_time(entry.mtime, entry.mtime_nsec as u32);
            filetime::set_file_times(&entry.path, atime, mtime)
                .map_err(|e| ArchiveError::io("utimes", &entry.path, e))?;
        }
    }
    Ok(())
}
