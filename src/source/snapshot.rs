//! Commit-named snapshots of successful builds and the `latest.txt` marker.

use std::fs;
use std::path::Path;

use tracing::{info, warn};
use walkdir::WalkDir;

use crate::errors::{ReesError, Result};

pub const LATEST_MARKER: &str = "latest.txt";

/// Copy `src` to `dst` recursively. Symlinks are recreated with their
/// original target rather than followed.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(|e| ReesError::git("walk build directory", e))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| ReesError::git("walk build directory", e))?;
        let target = dst.join(rel);
        let file_type = entry.file_type();

        if file_type.is_symlink() {
            let link = fs::read_link(entry.path())
                .map_err(|e| ReesError::git_io("read link", entry.path(), e))?;
            std::os::unix::fs::symlink(&link, &target)
                .map_err(|e| ReesError::git_io("create link", &target, e))?;
        } else if file_type.is_dir() {
            fs::create_dir_all(&target).map_err(|e| ReesError::git_io("create", &target, e))?;
        } else {
            fs::copy(entry.path(), &target).map_err(|e| ReesError::git_io("copy", &target, e))?;
        }
    }
    Ok(())
}

/// Replace `<cache_root>/<hash>` with a copy of `build_dir` and point
/// `latest.txt` at `hash`.
pub fn save_snapshot(cache_root: &Path, build_dir: &Path, hash: &str) -> Result<()> {
    let snapshot = cache_root.join(hash);
    if snapshot.exists() {
        info!(path = %snapshot.display(), "removing existing snapshot");
        fs::remove_dir_all(&snapshot).map_err(|e| ReesError::git_io("remove", &snapshot, e))?;
    }

    copy_tree(build_dir, &snapshot)?;

    let marker = cache_root.join(LATEST_MARKER);
    fs::write(&marker, hash).map_err(|e| ReesError::git_io("write", &marker, e))?;
    info!(%hash, path = %snapshot.display(), "build preserved");
    Ok(())
}

/// Hash recorded in `latest.txt`, if it can be read.
pub fn read_marker(cache_root: &Path) -> Option<String> {
    let marker = cache_root.join(LATEST_MARKER);
    match fs::read_to_string(&marker) {
        Ok(content) => {
            let hash = content.trim();
            (!hash.is_empty()).then(|| hash.to_string())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            warn!(path = %marker.display(), "error reading {}: {}", LATEST_MARKER, e);
            None
        }
    }
}

/// Commit-named snapshot directories under `cache_root`, sorted by name.
pub fn list_snapshots(cache_root: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(cache_root) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| name != super::LATEST_DIR)
        .collect();
    names.sort();
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn build_tree(root: &Path) -> std::path::PathBuf {
        let latest = root.join("latest");
        fs::create_dir_all(latest.join("_build/html")).unwrap();
        fs::write(latest.join("index.md"), "# doc").unwrap();
        fs::write(latest.join("_build/html/index.html"), "<html/>").unwrap();
        std::os::unix::fs::symlink("index.md", latest.join("alias.md")).unwrap();
        std::os::unix::fs::symlink("/nonexistent/target", latest.join("dangling")).unwrap();
        latest
    }

    #[test]
    fn test_save_then_read_marker() {
        let dir = tempdir().unwrap();
        let latest = build_tree(dir.path());

        save_snapshot(dir.path(), &latest, "abc123").unwrap();

        assert_eq!(read_marker(dir.path()).as_deref(), Some("abc123"));
        let raw = fs::read_to_string(dir.path().join(LATEST_MARKER)).unwrap();
        assert_eq!(raw, "abc123");
        assert!(dir.path().join("abc123/_build/html/index.html").exists());
    }

    #[test]
    fn test_symlinks_copied_verbatim() {
        let dir = tempdir().unwrap();
        let latest = build_tree(dir.path());

        save_snapshot(dir.path(), &latest, "abc123").unwrap();

        let alias = dir.path().join("abc123/alias.md");
        assert!(fs::symlink_metadata(&alias).unwrap().file_type().is_symlink());
        assert_eq!(fs::read_link(&alias).unwrap(), Path::new("index.md"));
        let dangling = dir.path().join("abc123/dangling");
        assert_eq!(
            fs::read_link(&dangling).unwrap(),
            Path::new("/nonexistent/target")
        );
    }

    #[test]
    fn test_two_saves_keep_two_snapshots() {
        let dir = tempdir().unwrap();
        let latest = build_tree(dir.path());

        save_snapshot(dir.path(), &latest, "first").unwrap();
        fs::write(latest.join("index.md"), "# changed").unwrap();
        save_snapshot(dir.path(), &latest, "second").unwrap();

        assert_eq!(read_marker(dir.path()).as_deref(), Some("second"));
        assert_eq!(
            fs::read_to_string(dir.path().join("first/index.md")).unwrap(),
            "# doc"
        );
        assert_eq!(
            fs::read_to_string(dir.path().join("second/index.md")).unwrap(),
            "# changed"
        );
        assert_eq!(list_snapshots(dir.path()), vec!["first", "second"]);
    }

    #[test]
    fn test_resave_overwrites_instead_of_merging() {
        let dir = tempdir().unwrap();
        let latest = build_tree(dir.path());
        save_snapshot(dir.path(), &latest, "abc").unwrap();
        fs::write(dir.path().join("abc/stale.txt"), "old").unwrap();

        save_snapshot(dir.path(), &latest, "abc").unwrap();

        assert!(!dir.path().join("abc/stale.txt").exists());
    }

    #[test]
    fn test_read_marker_absent() {
        let dir = tempdir().unwrap();
        assert_eq!(read_marker(dir.path()), None);
        assert!(list_snapshots(&dir.path().join("missing")).is_empty());
    }
}
