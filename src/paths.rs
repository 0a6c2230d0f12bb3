//! Path relativize / join / reduce helpers.
//!
//! Archive member names are always relative; list entries are absolute.
//! These helpers convert between the two around a base directory, purely
//! lexically (no filesystem access, no symlink resolution).

use std::path::{Component, Path, PathBuf};

/// Compute the relative path from `base` to `path`.
///
/// Falls back to walking both component lists when `path` is not a plain
/// extension of `base`, inserting `..` for every unmatched base component.
pub fn relativize(path: &Path, base: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix(base) {
        if stripped.as_os_str().is_empty() {
            return PathBuf::from(".");
        }
        return stripped.to_path_buf();
    }

    let path_parts: Vec<Component> = path.components().collect();
    let base_parts: Vec<Component> = base.components().collect();

    // Length of the common prefix.
    let common = path_parts
        .iter()
        .zip(base_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut rel = PathBuf::new();
    for _ in common..base_parts.len() {
        rel.push("..");
    }
    for part in &path_parts[common..] {
        rel.push(part);
    }
    if rel.as_os_str().is_empty() {
        rel.push(".");
    }
    rel
}

/// Join a relative member name onto `base` and lexically reduce the result.
///
/// `.` components are dropped and `..` pops the previous component, so a
/// crafted member name cannot silently retain dot-dot segments.
pub fn join_reduced(base: &Path, rel: &Path) -> PathBuf {
    let mut out = PathBuf::from(base);
    for part in rel.components() {
        match part {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relativize_child() {
        assert_eq!(
            relativize(Path::new("/data/set/a.bin"), Path::new("/data")),
            PathBuf::from("set/a.bin")
        );
    }

    #[test]
    fn relativize_sibling() {
        assert_eq!(
            relativize(Path::new("/data/set/a.bin"), Path::new("/data/other")),
            PathBuf::from("../set/a.bin")
        );
    }

    #[test]
    fn relativize_self() {
        assert_eq!(relativize(Path::new("/data"), Path::new("/data")), PathBuf::from("."));
    }

    #[test]
    fn join_reduces_dots() {
        assert_eq!(
            join_reduced(Path::new("/out"), Path::new("./a/../b/c.txt")),
            PathBuf::from("/out/b/c.txt")
        );
    }
}
