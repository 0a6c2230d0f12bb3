//! Archive entries and the metadata list.
//!
//! An [`Entry`] describes one filesystem item headed into (or out of) an
//! archive: absolute path, kind, size, ownership, and timestamps.  Entries
//! are immutable during a run.  The global list is sorted by path — so
//! parent directories precede their children in the archive — and split
//! into one contiguous slice per rank.

use std::fs;
use std::ops::Range;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use crate::error::{ArchiveError, Result};

/// Longest symbolic-link target the header encoder will accept.
pub const MAX_LINK_TARGET: usize = 4096;

// ── Entry kind ───────────────────────────────────────────────────────────────

/// Closed set of item kinds the archiver handles.  Unknown kinds contribute
/// zero bytes to the archive and are skipped by the planner, header writer,
/// and scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Dir,
    Link,
    Other,
}

impl EntryKind {
    #[inline] pub fn is_file(self) -> bool { self == EntryKind::File }
    #[inline] pub fn is_dir(self)  -> bool { self == EntryKind::Dir }
    #[inline] pub fn is_link(self) -> bool { self == EntryKind::Link }

    /// Whether the archiver emits a header for this kind at all.
    #[inline]
    pub fn is_supported(self) -> bool {
        !matches!(self, EntryKind::Other)
    }
}

// ── Entry ────────────────────────────────────────────────────────────────────

/// One filesystem item.  `size` is 0 for non-regular entries; `link_target`
/// is populated for symlinks when `readlink` succeeded at enumeration time.
#[derive(Debug, Clone)]
pub struct Entry {
    pub path:        PathBuf,
    pub kind:        EntryKind,
    pub size:        u64,
    pub mode:        u32,
    pub uid:         u64,
    pub gid:         u64,
    pub uname:       Option<String>,
    pub gname:       Option<String>,
    pub atime:       i64,
    pub atime_nsec:  i64,
    pub mtime:       i64,
    pub mtime_nsec:  i64,
    pub ctime:       i64,
    pub ctime_nsec:  i64,
    pub link_target: Option<PathBuf>,
}

impl Entry {
    /// Build an entry by lstat-ing `path`.  Symlink targets are captured
    /// here; a target that cannot be read (or is longer than
    /// [`MAX_LINK_TARGET`]) leaves `link_target` empty, which the planner
    /// later reports as a failed entry while still reserving its header
    /// slot.
    pub fn from_path(path: &Path) -> Result<Self> {
        let meta = fs::symlink_metadata(path)
            .map_err(|e| ArchiveError::io("lstat", path, e))?;

        let ft = meta.file_type();
        let kind = if ft.is_file() {
            EntryKind::File
        } else if ft.is_dir() {
            EntryKind::Dir
        } else if ft.is_symlink() {
            EntryKind::Link
        } else {
            EntryKind::Other
        };

        let link_target = if kind.is_link() {
            match fs::read_link(path) {
                Ok(t) if t.as_os_str().len() <= MAX_LINK_TARGET => Some(t),
                Ok(t) => {
                    log::error!(
                        "Link target of '{}' is {} bytes, exceeding the {}-byte limit",
                        path.display(), t.as_os_str().len(), MAX_LINK_TARGET
                    );
                    None
                }
                Err(e) => {
                    log::error!("Failed to read link '{}': {}", path.display(), e);
                    None
                }
            }
        } else {
            None
        };

        Ok(Entry {
            path:        path.to_path_buf(),
            kind,
            size:        if kind.is_file() { meta.size() } else { 0 },
            mode:        meta.mode(),
            uid:         meta.uid() as u64,
            gid:         meta.gid() as u64,
            uname:       None,
            gname:       None,
            atime:       meta.atime(),
            atime_nsec:  meta.atime_nsec(),
            mtime:       meta.mtime(),
            mtime_nsec:  meta.mtime_nsec(),
            ctime:       meta.ctime(),
            ctime_nsec:  meta.ctime_nsec(),
            link_target,
        })
    }
}

// ── List construction ────────────────────────────────────────────────────────

/// Walk each source root and collect entries for every item underneath,
/// the roots themselves included.  The result is sorted by path.
pub fn collect_entries(roots: &[PathBuf]) -> Result<Vec<Entry>> {
    let mut entries = Vec::new();
    for root in roots {
        for item in walkdir::WalkDir::new(root).follow_links(false) {
            let item = item.map_err(|e| {
                ArchiveError::Input(format!("failed to walk '{}': {}", root.display(), e))
            })?;
            entries.push(Entry::from_path(item.path())?);
        }
    }
    sort_by_path(&mut entries);
    Ok(entries)
}

/// Sort entries by path byte order.  Rank-count independence of the
/// produced archive depends on this global order being applied before the
/// list is partitioned.
pub fn sort_by_path(entries: &mut [Entry]) {
    entries.sort_by(|a, b| a.path.cmp(&b.path));
}

/// Contiguous slice of a `total`-element list owned by `rank` out of
/// `ranks`.  The first `total % ranks` ranks receive one extra element.
pub fn partition(total: usize, ranks: usize, rank: usize) -> Range<usize> {
    let per = total / ranks;
    let rem = total % ranks;
    if rank < rem {
        let start = rank * (per + 1);
        start..start + per + 1
    } else {
        let start = rem * (per + 1) + (rank - rem) * per;
        start..start + per
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_covers_all_elements() {
        for total in [0usize, 1, 7, 64, 65] {
            for ranks in [1usize, 2, 3, 8] {
                let mut next = 0;
                for rank in 0..ranks {
                    let r = partition(total, ranks, rank);
                    assert_eq!(r.start, next, "gap at rank {rank} of {ranks} over {total}");
                    next = r.end;
                }
                assert_eq!(next, total);
            }
        }
    }

    #[test]
    fn partition_remainder_goes_first() {
        assert_eq!(partition(10, 4, 0), 0..3);
        assert_eq!(partition(10, 4, 1), 3..6);
        assert_eq!(partition(10, 4, 2), 6..8);
        assert_eq!(partition(10, 4, 3), 8..10);
    }
}
