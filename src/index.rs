//! Offset-index sidecar — `<archive>.idx`.
//!
//! # On-disk format
//!
//! `n` consecutive 8-byte **big-endian** unsigned integers, one per entry
//! in global order; word `i` is the absolute archive offset of entry `i`'s
//! pax header.  File size is exactly `n * 8` bytes.  Byte order is network
//! order on disk and host order in memory — the sidecar is portable across
//! machines even though a run never mixes them.
//!
//! No checksum is carried: a corrupt word surfaces as a decode error at
//! the affected entry when the archive is read back.
//!
//! The sidecar is written right after planning, so extraction can seek
//! straight to any entry.  If it is missing or unreadable the reader
//! reports "no index" and extraction falls back to scanning.

use std::fs::{self, File, OpenOptions};
use std::io::Read;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder};

use crate::comm::Comm;
use crate::error::{ArchiveError, Result};

/// Sidecar path: the archive path with `.idx` appended.
pub fn index_path(archive: &Path) -> PathBuf {
    let mut name = archive.as_os_str().to_owned();
    name.push(".idx");
    PathBuf::from(name)
}

// ── Writer ───────────────────────────────────────────────────────────────────

/// Write this rank's offsets into the sidecar at its scanned element
/// position.  Collective.  Rank 0 unlinks and recreates the file; all
/// ranks then write disjoint ranges with positional writes, and an
/// all-true reduction confirms every write landed.
pub fn write_index(comm: &Comm, archive: &Path, offsets: &[u64]) -> Result<()> {
    let path = index_path(archive);
    if comm.is_root() {
        log::debug!("Writing index to {}", path.display());
    }

    // Element offset of our block within the global sequence.
    let elem_offset = comm.exscan_sum(offsets.len() as u64);

    // Rank 0 creates and truncates; everyone else opens after the barrier.
    let file = if comm.is_root() {
        let _ = fs::remove_file(&path);
        let f = File::create(&path).map_err(|e| ArchiveError::io("create", &path, e));
        comm.barrier();
        f
    } else {
        comm.barrier();
        OpenOptions::new()
            .write(true)
            .open(&path)
            .map_err(|e| ArchiveError::io("open", &path, e))
    };

    let wrote = match file {
        Ok(f) => {
            let mut packed = vec![0u8; offsets.len() * 8];
            BigEndian::write_u64_into(offsets, &mut packed);
            f.write_all_at(&packed, elem_offset * 8).is_ok()
        }
        Err(e) => {
            log::error!("{e}");
            false
        }
    };

    if comm.alltrue(wrote) {
        Ok(())
    } else {
        Err(ArchiveError::Index {
            path,
            reason: "one or more ranks failed to write their offsets".into(),
        })
    }
}

// ── Reader ───────────────────────────────────────────────────────────────────

/// Read the sidecar back: rank 0 stats and reads, then broadcasts the
/// packed bytes; every rank decodes to host order.  Returns `None` when
/// the sidecar is missing or unreadable — the caller falls back to a scan.
/// Collective.
pub fn read_index(comm: &Comm, archive: &Path) -> Option<Vec<u64>> {
    let path = index_path(archive);

    let packed: Option<Vec<u8>> = if comm.is_root() {
        let loaded = load_packed(&path);
        if loaded.is_some() {
            log::info!("Read index {}", path.display());
        }
        comm.broadcast(0, Some(loaded))
    } else {
        comm.broadcast(0, None)
    };

    packed.map(|bytes| {
        let mut offsets = vec![0u64; bytes.len() / 8];
        BigEndian::read_u64_into(&bytes, &mut offsets);
        offsets
    })
}

/// Rank 0's half of the read: entry count from the file size, then the
/// whole packed array.  Any failure collapses to "no index".
fn load_packed(path: &Path) -> Option<Vec<u8>> {
    let meta = fs::metadata(path).ok()?;
    let count = meta.len() / 8;

    let mut file = File::open(path).ok()?;
    let mut packed = vec![0u8; (count * 8) as usize];
    file.read_exact(&mut packed).ok()?;
    Some(packed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::partition;

    #[test]
    fn sidecar_path_appends_idx() {
        assert_eq!(index_path(Path::new("/out/backup.tar")), PathBuf::from("/out/backup.tar.idx"));
    }

    #[test]
    fn roundtrip_across_ranks() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("a.tar");
        let all: Vec<u64> = (0..13).map(|i| i * 512).collect();

        let results = Comm::launch(4, |comm| {
            let range = partition(all.len(), comm.ranks(), comm.rank());
            write_index(&comm, &archive, &all[range]).unwrap();
            comm.barrier();
            read_index(&comm, &archive).unwrap()
        });
        for got in results {
            assert_eq!(got, all);
        }
    }

    #[test]
    fn on_disk_words_are_big_endian() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("a.tar");
        Comm::launch(1, |comm| {
            write_index(&comm, &archive, &[0x0102_0304_0506_0708]).unwrap();
        });
        let raw = fs::read(index_path(&archive)).unwrap();
        assert_eq!(raw, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn missing_sidecar_reports_none() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("nope.tar");
        let results = Comm::launch(2, |comm| read_index(&comm, &archive).is_none());
        assert_eq!(results, vec![true, true]);
    }
}
