//! Pax header emission.
//!
//! The encoder produces the header *blocks only* for one entry: an
//! optional pax extended-header record set (typeflag `x`) followed by the
//! ustar base record.  It never emits payload bytes and it can never emit
//! the 1024-byte end-of-archive trailer — the single global trailer is
//! written exactly once by rank 0 after all chunk workers complete.
//! Violating that discipline would overwrite neighboring entries' bytes,
//! so the trailer simply has no code path here.
//!
//! The ustar field encoding (octal fields, checksum, name/prefix split)
//! is delegated to the `tar` crate; pax records are emitted for values the
//! ustar fields cannot carry: long paths, long link targets, large sizes,
//! large uid/gid, and sub-second mtimes.
//!
//! Two modes, selected by `preserve`:
//! - *stat-based*: all fields come from the in-memory [`Entry`];
//! - *preserve*: mode, ownership, and times are re-read from the on-disk
//!   object at encode time.  The payload size always comes from the Entry
//!   so headers and the planned payload ranges cannot disagree.

use std::fs;
use std::os::unix::fs::FileExt;
use std::path::Path;

use tar::{EntryType, Header, HeaderMode};

use crate::entry::{Entry, EntryKind};
use crate::error::{ArchiveError, Result};
use crate::layout::Layout;
use crate::paths;

/// Largest value an 11-digit octal ustar size field can carry.
const USTAR_MAX_SIZE: u64 = 0o77777777777;
/// Largest value a 7-digit octal ustar uid/gid field can carry.
const USTAR_MAX_ID: u64 = 0o7777777;
/// Member name of pax extended-header records.
const PAX_HEADER_NAME: &str = "@PaxHeader";

/// Encode the header blocks for one entry.  The returned buffer length is
/// always a multiple of 512.  A `Link` entry without a captured target is
/// encoded without a link name; the caller reports it as a failed entry
/// while keeping its header slot.
pub fn encode_header(entry: &Entry, cwd: &Path, preserve: bool) -> Result<Vec<u8>> {
    debug_assert!(entry.kind.is_supported());

    // Archive member name: relative to the base directory.  Directories
    // are marked by their typeflag, not a trailing slash, matching the
    // encoder library's own convention.
    let rel = paths::relativize(&entry.path, cwd);
    let name = rel.to_string_lossy().into_owned();

    let mut header = Header::new_ustar();
    let mut pax: Vec<(&str, String)> = Vec::new();

    if preserve {
        let meta = fs::symlink_metadata(&entry.path)
            .map_err(|e| ArchiveError::io("lstat", &entry.path, e))?;
        header.set_metadata_in_mode(&meta, HeaderMode::Complete);
    } else {
        header.set_mode(entry.mode & 0o7777);
        header.set_uid(entry.uid);
        header.set_gid(entry.gid);
        header.set_mtime(entry.mtime.max(0) as u64);
    }

    header.set_entry_type(match entry.kind {
        EntryKind::File => EntryType::Regular,
        EntryKind::Dir  => EntryType::Directory,
        EntryKind::Link => EntryType::Symlink,
        EntryKind::Other => unreachable!("unsupported kinds are filtered by the planner"),
    });

    // Size: Entry is authoritative in both modes so that the header always
    // matches the payload range the layout reserved.
    header.set_size(if entry.kind.is_file() { entry.size } else { 0 });

    if let Some(ref uname) = entry.uname {
        let _ = header.set_username(uname);
    }
    if let Some(ref gname) = entry.gname {
        let _ = header.set_groupname(gname);
    }

    // Member name: ustar name/prefix split if it fits, else a pax `path`
    // record plus a truncated base-field name.
    if header.set_path(&name).is_err() {
        pax.push(("path", name.clone()));
        header
            .set_path(truncate_utf8(&name, 100))
            .map_err(|e| ArchiveError::Encode {
                path:   entry.path.clone(),
                reason: format!("member name not encodable: {e}"),
            })?;
    }

    // Link target, same scheme.
    if entry.kind.is_link() {
        if let Some(ref target) = entry.link_target {
            let target_name = target.to_string_lossy().into_owned();
            if header.set_link_name(&target_name).is_err() {
                pax.push(("linkpath", target_name.clone()));
                let _ = header.set_link_name(truncate_utf8(&target_name, 100));
            }
        }
        // A link without a captured target keeps its slot; the planner has
        // already reported the entry as failed.
    }

    if entry.kind.is_file() && entry.size > USTAR_MAX_SIZE {
        pax.push(("size", entry.size.to_string()));
    }
    if entry.uid > USTAR_MAX_ID {
        pax.push(("uid", entry.uid.to_string()));
    }
    if entry.gid > USTAR_MAX_ID {
        pax.push(("gid", entry.gid.to_string()));
    }
    if entry.mtime_nsec != 0 && entry.mtime >= 0 {
        pax.push(("mtime", format!("{}.{:09}", entry.mtime, entry.mtime_nsec)));
    }

    header.set_cksum();

    if pax.is_empty() {
        return Ok(header.as_bytes().to_vec());
    }

    // Pax prelude: one `x` header block, then the records padded to a
    // 512-byte boundary, then the base record.
    let records = encode_pax_records(&pax);

    let mut xhdr = Header::new_ustar();
    xhdr.set_entry_type(EntryType::XHeader);
    xhdr.set_mode(0o644);
    xhdr.set_size(records.len() as u64);
    xhdr.set_mtime(entry.mtime.max(0) as u64);
    xhdr.set_path(PAX_HEADER_NAME).map_err(|e| ArchiveError::Encode {
        path:   entry.path.clone(),
        reason: format!("pax header name not encodable: {e}"),
    })?;
    xhdr.set_cksum();

    let padded = records.len().div_ceil(512) * 512;
    let mut out = Vec::with_capacity(512 + padded + 512);
    out.extend_from_slice(xhdr.as_bytes());
    out.extend_from_slice(&records);
    out.resize(512 + padded, 0);
    out.extend_from_slice(header.as_bytes());
    Ok(out)
}

/// Encode pax records in the `"%d %s=%s\n"` form, where the leading
/// decimal is the byte length of the whole record including itself.
fn encode_pax_records(pairs: &[(&str, String)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (key, value) in pairs {
        // len = digits(len) + " key=value\n"; the digit count feeds back
        // into the length, so grow it until it is self-consistent.
        let body = key.len() + value.len() + 3;
        let mut len = body + 1;
        while len != body + decimal_digits(len) {
            len = body + decimal_digits(len);
        }
        out.extend_from_slice(format!("{len} {key}={value}\n").as_bytes());
    }
    out
}

fn decimal_digits(mut n: usize) -> usize {
    let mut digits = 1;
    while n >= 10 {
        n /= 10;
        digits += 1;
    }
    digits
}

/// Longest prefix of `s` that is at most `max` bytes and ends on a UTF-8
/// boundary.
fn truncate_utf8(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// ── Header write phase ───────────────────────────────────────────────────────

/// Write the header blocks for every supported local entry at its planned
/// offset.  Writes are disjoint across ranks by layout construction.
///
/// Returns an error if any emitted header no longer matches the planned
/// size — the on-disk object changed between planning and emission, and
/// writing it would overrun a neighboring entry's bytes.
pub fn write_headers(
    archive:  &fs::File,
    archive_path: &Path,
    entries:  &[Entry],
    layout:   &Layout,
    cwd:      &Path,
    preserve: bool,
) -> Result<()> {
    for (idx, entry) in entries.iter().enumerate() {
        if !entry.kind.is_supported() {
            continue;
        }
        let bytes = encode_header(entry, cwd, preserve)?;
        if bytes.len() as u64 != layout.header_sizes[idx] {
            return Err(ArchiveError::Protocol(format!(
                "header for '{}' re-encoded to {} bytes but {} were planned",
                entry.path.display(), bytes.len(), layout.header_sizes[idx]
            )));
        }
        archive
            .write_all_at(&bytes, layout.offsets[idx])
            .map_err(|e| ArchiveError::io("write header", archive_path, e))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn file_entry(path: &str, size: u64) -> Entry {
        Entry {
            path:        PathBuf::from(path),
            kind:        EntryKind::File,
            size,
            mode:        0o100644,
            uid:         1000,
            gid:         1000,
            uname:       Some("user".into()),
            gname:       Some("user".into()),
            atime:       1_600_000_000,
            atime_nsec:  0,
            mtime:       1_600_000_000,
            mtime_nsec:  0,
            ctime:       1_600_000_000,
            ctime_nsec:  0,
            link_target: None,
        }
    }

    #[test]
    fn short_name_is_one_block() {
        let entry = file_entry("/src/a.txt", 10);
        let bytes = encode_header(&entry, Path::new("/src"), false).unwrap();
        assert_eq!(bytes.len(), 512);
        assert_eq!(&bytes[257..262], b"ustar");
    }

    #[test]
    fn long_name_gets_pax_prelude() {
        let long = format!("/src/{}/f.txt", "d".repeat(300));
        let entry = file_entry(&long, 1);
        let bytes = encode_header(&entry, Path::new("/src"), false).unwrap();
        // x-header + at least one record block + base header.
        assert!(bytes.len() >= 1536);
        assert_eq!(bytes.len() % 512, 0);
        assert_eq!(bytes[156], b'x');
        // The records must contain the full member name.
        let records = &bytes[512..bytes.len() - 512];
        let text = String::from_utf8_lossy(records);
        assert!(text.contains("path="));
        assert!(text.contains(&"d".repeat(300)));
    }

    #[test]
    fn subsecond_mtime_gets_pax_record() {
        let mut entry = file_entry("/src/a.txt", 0);
        entry.mtime_nsec = 123_456_789;
        let bytes = encode_header(&entry, Path::new("/src"), false).unwrap();
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("mtime=1600000000.123456789"));
    }

    #[test]
    fn directory_uses_dir_typeflag() {
        let mut entry = file_entry("/src/sub", 0);
        entry.kind = EntryKind::Dir;
        entry.mode = 0o40755;
        let bytes = encode_header(&entry, Path::new("/src"), false).unwrap();
        assert_eq!(bytes.len(), 512);
        assert!(bytes[..100].starts_with(b"sub\0"));
        assert_eq!(bytes[156], b'5');
    }

    #[test]
    fn pax_record_length_is_self_consistent() {
        let records = encode_pax_records(&[("path", "x".repeat(90))]);
        let text = String::from_utf8(records.clone()).unwrap();
        let (len_str, _) = text.split_once(' ').unwrap();
        assert_eq!(len_str.parse::<usize>().unwrap(), records.len());
    }

    #[test]
    fn headers_decode_through_the_library() {
        let long = format!("/src/{}/payload.bin", "sub".repeat(60));
        let entry = file_entry(&long, 3);
        let mut bytes = encode_header(&entry, Path::new("/src"), false).unwrap();
        bytes.extend_from_slice(b"abc");
        bytes.resize(bytes.len() + 509, 0); // payload padding
        bytes.resize(bytes.len() + 1024, 0); // trailer

        let mut ar = tar::Archive::new(std::io::Cursor::new(bytes));
        let mut entries = ar.entries().unwrap();
        let first = entries.next().unwrap().unwrap();
        assert_eq!(first.header().entry_type(), EntryType::Regular);
        assert_eq!(first.size(), 3);
        assert_eq!(
            first.path().unwrap().to_string_lossy(),
            format!("{}/payload.bin", "sub".repeat(60))
        );
        assert!(entries.next().is_none());
    }
}
