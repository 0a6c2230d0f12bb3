use partar::archive::{archive_create, archive_extract, ArchiveOptions};
use partar::entry::collect_entries;
use partar::index_path;
use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn opts(ranks: usize) -> ArchiveOptions {
    ArchiveOptions {
        ranks,
        // Small chunks so multi-chunk files appear even in small trees.
        chunk_size: 1024,
        block_size: 512,
        progress_interval: None,
        ..ArchiveOptions::default()
    }
}

/// Lay down a source tree with the shapes the scheduler cares about:
/// empty file, sub-chunk file, exact-chunk file, multi-chunk file,
/// nested directories, and a symlink.
fn build_tree(root: &Path) {
    fs::create_dir_all(root.join("sub/deep")).unwrap();
    fs::write(root.join("a.txt"), b"abcdefghij").unwrap();
    fs::write(root.join("empty"), b"").unwrap();
    fs::write(root.join("sub/exact.bin"), vec![7u8; 1024]).unwrap();
    let big: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
    fs::write(root.join("sub/deep/big.bin"), &big).unwrap();
    symlink("a.txt", root.join("link")).unwrap();

    // A known directory mtime, to observe the fix-up phase.
    filetime::set_file_mtime(
        root.join("sub"),
        filetime::FileTime::from_unix_time(1_500_000_000, 0),
    )
    .unwrap();
}

fn create_archive(src_root: &Path, archive: &Path, ranks: usize) {
    let cwd = src_root.parent().unwrap();
    let entries = collect_entries(&[src_root.to_path_buf()]).unwrap();
    archive_create(entries, archive, cwd, &opts(ranks)).unwrap();
}

/// Collect (relative path, kind letter, content) for every item in a tree.
fn snapshot(root: &Path) -> Vec<(PathBuf, char, Vec<u8>)> {
    let mut out = Vec::new();
    for item in walkdir::WalkDir::new(root).sort_by_file_name() {
        let item = item.unwrap();
        let rel = item.path().strip_prefix(root).unwrap().to_path_buf();
        let ft = item.file_type();
        if ft.is_dir() {
            out.push((rel, 'd', Vec::new()));
        } else if ft.is_symlink() {
            let target = fs::read_link(item.path()).unwrap();
            out.push((rel, 'l', target.into_os_string().into_encoded_bytes()));
        } else {
            out.push((rel, 'f', fs::read(item.path()).unwrap()));
        }
    }
    out
}

// ── Layout and sidecar shape ─────────────────────────────────────────────────

/// Clamp an item's mtime to a whole second so its header stays a single
/// ustar block (sub-second stamps add a pax record block).
fn clamp_mtime(path: &Path) {
    filetime::set_file_mtime(path, filetime::FileTime::from_unix_time(1_600_000_000, 0)).unwrap();
}

#[test]
fn single_small_file_layout() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("tree");
    fs::create_dir(&src).unwrap();
    fs::write(src.join("ten.txt"), b"abcdefghij").unwrap();
    clamp_mtime(&src.join("ten.txt"));

    let archive = dir.path().join("one.tar");
    let entries = collect_entries(&[src.join("ten.txt")]).unwrap();
    archive_create(entries, &archive, &src, &opts(1)).unwrap();

    // Header block + one padded payload block + trailer.
    let bytes = fs::read(&archive).unwrap();
    assert_eq!(bytes.len(), 512 + 512 + 1024);
    assert_eq!(&bytes[512..522], b"abcdefghij");
    assert!(bytes[522..1024].iter().all(|&b| b == 0), "padding must be zero");
    assert!(bytes[1024..].iter().all(|&b| b == 0), "trailer must be zero");

    // Index: one big-endian word, offset zero.
    let idx = fs::read(index_path(&archive)).unwrap();
    assert_eq!(idx, vec![0u8; 8]);
}

#[test]
fn parent_dir_and_two_files_tile_the_archive() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("d");
    fs::create_dir(&src).unwrap();
    fs::write(src.join("f1"), vec![1u8; 513]).unwrap();
    fs::write(src.join("f2"), vec![2u8; 1]).unwrap();
    for rel in ["f1", "f2", ""] {
        clamp_mtime(&src.join(rel));
    }

    let archive = dir.path().join("two.tar");
    create_archive(&src, &archive, 1);

    // Entries are path-ordered: d, d/f1, d/f2.  All names are short, so
    // every header is one block; 513 bytes pad to 1024.
    let idx = fs::read(index_path(&archive)).unwrap();
    let words: Vec<u64> = idx
        .chunks(8)
        .map(|w| u64::from_be_bytes(w.try_into().unwrap()))
        .collect();
    assert_eq!(words, vec![0, 512, 512 + 512 + 1024]);

    let len = fs::metadata(&archive).unwrap().len();
    assert_eq!(len, (512 + 512 + 1024 + 512 + 512) + 1024);
}

#[test]
fn archives_are_identical_across_rank_counts() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("tree");
    build_tree(&src);

    let a1 = dir.path().join("r1.tar");
    let a4 = dir.path().join("r4.tar");
    create_archive(&src, &a1, 1);
    create_archive(&src, &a4, 4);

    assert_eq!(fs::read(&a1).unwrap(), fs::read(&a4).unwrap());
    assert_eq!(
        fs::read(index_path(&a1)).unwrap(),
        fs::read(index_path(&a4)).unwrap()
    );
}

#[test]
fn recreating_an_archive_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("tree");
    build_tree(&src);

    let archive = dir.path().join("same.tar");
    create_archive(&src, &archive, 2);
    let first = fs::read(&archive).unwrap();
    create_archive(&src, &archive, 2);
    assert_eq!(first, fs::read(&archive).unwrap());
}

// ── Round trips ──────────────────────────────────────────────────────────────

#[test]
fn create_then_extract_roundtrips() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("tree");
    build_tree(&src);

    let archive = dir.path().join("t.tar");
    create_archive(&src, &archive, 3);

    let dest = dir.path().join("restore");
    fs::create_dir(&dest).unwrap();
    archive_extract(&archive, &dest, &opts(3)).unwrap();

    assert_eq!(snapshot(&src), snapshot(&dest.join("tree")));

    // Directory mtime was re-applied after payloads landed.
    let mtime = fs::metadata(dest.join("tree/sub")).unwrap();
    assert_eq!(
        filetime::FileTime::from_last_modification_time(&mtime).unix_seconds(),
        1_500_000_000
    );
}

#[test]
fn extraction_matches_with_and_without_sidecar() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("tree");
    build_tree(&src);

    let archive = dir.path().join("t.tar");
    create_archive(&src, &archive, 2);

    let with_idx = dir.path().join("with");
    fs::create_dir(&with_idx).unwrap();
    archive_extract(&archive, &with_idx, &opts(2)).unwrap();

    // Remove the sidecar: extraction recovers offsets by scanning, and
    // saves them back for the next run.
    fs::remove_file(index_path(&archive)).unwrap();
    let without_idx = dir.path().join("without");
    fs::create_dir(&without_idx).unwrap();
    archive_extract(&archive, &without_idx, &opts(2)).unwrap();

    assert_eq!(snapshot(&with_idx), snapshot(&without_idx));
    assert!(index_path(&archive).exists(), "scanned offsets are saved");
}

#[test]
fn extracting_twice_overwrites_cleanly() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("tree");
    build_tree(&src);

    let archive = dir.path().join("t.tar");
    create_archive(&src, &archive, 1);

    let dest = dir.path().join("restore");
    fs::create_dir(&dest).unwrap();
    archive_extract(&archive, &dest, &opts(1)).unwrap();
    let first = snapshot(&dest);
    archive_extract(&archive, &dest, &opts(1)).unwrap();
    assert_eq!(first, snapshot(&dest));
}

#[test]
fn produced_archive_reads_with_a_stock_decoder() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("tree");
    build_tree(&src);

    let archive = dir.path().join("t.tar");
    create_archive(&src, &archive, 2);

    // A plain single-stream tar reader must accept the whole archive.
    let mut decoder = tar::Archive::new(fs::File::open(&archive).unwrap());
    let dest = dir.path().join("stock");
    fs::create_dir(&dest).unwrap();
    decoder.unpack(&dest).unwrap();

    assert_eq!(snapshot(&src), snapshot(&dest.join("tree")));
}

#[test]
fn extract_then_recreate_reproduces_the_archive() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("tree");
    // Files and directories only: symlink mtimes are not round-tripped
    // byte-exactly by every platform.
    fs::create_dir_all(src.join("sub")).unwrap();
    fs::write(src.join("a.bin"), vec![9u8; 2000]).unwrap();
    fs::write(src.join("sub/b.bin"), b"bb").unwrap();
    // Whole-second mtimes everywhere: extraction restores seconds, so
    // sub-second stamps would differ between the two archives.
    for rel in ["a.bin", "sub/b.bin", "sub", ""] {
        filetime::set_file_mtime(
            src.join(rel),
            filetime::FileTime::from_unix_time(1_400_000_000, 0),
        )
        .unwrap();
    }

    let a1 = dir.path().join("a1.tar");
    create_archive(&src, &a1, 2);

    fs::remove_file(index_path(&a1)).unwrap();
    let dest = dir.path().join("d");
    fs::create_dir(&dest).unwrap();
    archive_extract(&a1, &dest, &opts(2)).unwrap();

    let a2 = dir.path().join("a2.tar");
    create_archive(&dest.join("tree"), &a2, 2);

    assert_eq!(fs::read(&a1).unwrap(), fs::read(&a2).unwrap());
}

// ── Failure paths ────────────────────────────────────────────────────────────

#[test]
fn corrupt_sidecar_fails_the_extraction() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("tree");
    build_tree(&src);

    let archive = dir.path().join("t.tar");
    create_archive(&src, &archive, 1);

    // Flip one byte of the second offset word.
    let idx = index_path(&archive);
    let mut bytes = fs::read(&idx).unwrap();
    bytes[15] ^= 0xFF;
    fs::write(&idx, &bytes).unwrap();

    let dest = dir.path().join("restore");
    fs::create_dir(&dest).unwrap();
    assert!(archive_extract(&archive, &dest, &opts(2)).is_err());
}

#[test]
fn create_refuses_unreadable_sources() {
    let err = partar::check_archive_paths(
        &[PathBuf::from("/does/not/exist")],
        Path::new("/tmp/x.tar"),
    );
    assert!(err.is_err());
}
