//! Local exclude list and working-tree cleaning.
//!
//! Paths listed in `.git/info/exclude` survive [`clean_untracked`], which is
//! how a previous build's cache and downloaded data outlive a checkout.

use std::fs;
use std::io::Write;
use std::path::{Component, Path};

use git2::{Repository, Status, StatusOptions};
use tracing::debug;

use crate::errors::{ReesError, Result};

pub const DATA_DIR: &str = "data";
pub const BUILD_CACHE_DIR: &str = "_build";

/// Patterns kept out of cleaning for this run.
pub fn protected_dirs(preserve_cache: bool) -> Vec<&'static str> {
    if preserve_cache {
        vec![DATA_DIR, BUILD_CACHE_DIR]
    } else {
        vec![DATA_DIR]
    }
}

/// Append `<dir>/` for each of `dirs` missing from the repository's exclude
/// file. Existing lines are never rewritten or duplicated.
pub fn ensure_excludes(repo: &Repository, dirs: &[&str]) -> Result<()> {
    let info_dir = repo.path().join("info");
    let exclude_path = info_dir.join("exclude");
    fs::create_dir_all(&info_dir).map_err(|e| ReesError::git_io("create", &info_dir, e))?;

    let existing = match fs::read_to_string(&exclude_path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(ReesError::git_io("read", &exclude_path, e)),
    };

    let missing: Vec<String> = dirs
        .iter()
        .map(|dir| format!("{}/", dir))
        .filter(|pattern| !existing.lines().any(|line| line.trim() == pattern))
        .collect();
    if missing.is_empty() {
        return Ok(());
    }

    let mut addition = String::new();
    if !existing.is_empty() && !existing.ends_with('\n') {
        addition.push('\n');
    }
    for pattern in &missing {
        addition.push_str(pattern);
        addition.push('\n');
    }

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&exclude_path)
        .map_err(|e| ReesError::git_io("open", &exclude_path, e))?;
    file.write_all(addition.as_bytes())
        .map_err(|e| ReesError::git_io("write", &exclude_path, e))?;
    debug!(patterns = ?missing, "updated local exclude list");
    Ok(())
}

/// Remove untracked and ignored files from the working tree, keeping any
/// path that lies under one of `protected` directory names.
pub fn clean_untracked(repo: &Repository, protected: &[&str]) -> Result<usize> {
    let workdir = repo
        .workdir()
        .ok_or_else(|| ReesError::git("clean", anyhow::anyhow!("repository has no working tree")))?
        .to_path_buf();

    let mut opts = StatusOptions::new();
    opts.include_untracked(true)
        .include_ignored(true)
        .recurse_untracked_dirs(false)
        .recurse_ignored_dirs(false);
    let statuses = repo
        .statuses(Some(&mut opts))
        .map_err(|e| ReesError::git("read working tree status", e))?;

    let mut removed = 0;
    for entry in statuses.iter() {
        if !entry.status().intersects(Status::WT_NEW | Status::IGNORED) {
            continue;
        }
        let Some(rel) = entry.path() else {
            continue;
        };
        let rel = Path::new(rel);
        if is_protected(rel, protected) {
            continue;
        }

        let full = workdir.join(rel);
        let meta = match fs::symlink_metadata(&full) {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(ReesError::git_io("inspect", &full, e)),
        };
        let result = if meta.is_dir() {
            prune_dir(&full, protected).map(|_| ())
        } else {
            fs::remove_file(&full)
        };
        result.map_err(|e| ReesError::git_io("remove", &full, e))?;
        removed += 1;
    }
    Ok(removed)
}

/// Remove everything under `dir` except nested protected directories.
/// Returns `true` when `dir` itself was removed.
fn prune_dir(dir: &Path, protected: &[&str]) -> std::io::Result<bool> {
    let mut kept = false;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            if protected.iter().any(|p| entry.file_name() == *p) {
                debug!(path = %path.display(), "keeping nested protected directory");
                kept = true;
            } else if !prune_dir(&path, protected)? {
                kept = true;
            }
        } else {
            fs::remove_file(&path)?;
        }
    }
    if !kept {
        fs::remove_dir(dir)?;
    }
    Ok(!kept)
}

fn is_protected(rel: &Path, protected: &[&str]) -> bool {
    rel.components().any(|component| match component {
        Component::Normal(name) => protected.iter().any(|p| name == *p),
        _ => false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn exclude_contents(repo: &Repository) -> String {
        fs::read_to_string(repo.path().join("info/exclude")).unwrap_or_default()
    }

    #[test]
    fn test_ensure_excludes_appends_missing_once() {
        let dir = tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();

        ensure_excludes(&repo, &["data", "_build"]).unwrap();
        ensure_excludes(&repo, &["data", "_build"]).unwrap();

        let content = exclude_contents(&repo);
        assert_eq!(content.matches("data/").count(), 1);
        assert_eq!(content.matches("_build/").count(), 1);
        assert!(content.ends_with('\n'));
    }

    #[test]
    fn test_ensure_excludes_keeps_newline_discipline() {
        let dir = tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        fs::create_dir_all(repo.path().join("info")).unwrap();
        fs::write(repo.path().join("info/exclude"), "*.log").unwrap();

        ensure_excludes(&repo, &["data"]).unwrap();

        assert_eq!(exclude_contents(&repo), "*.log\ndata/\n");
    }

    #[test]
    fn test_protected_dirs() {
        assert_eq!(protected_dirs(true), vec!["data", "_build"]);
        assert_eq!(protected_dirs(false), vec!["data"]);
    }

    #[test]
    fn test_is_protected_matches_whole_components() {
        assert!(is_protected(Path::new("data/"), &["data"]));
        assert!(is_protected(Path::new("content/data/x.csv"), &["data"]));
        assert!(!is_protected(Path::new("database.db"), &["data"]));
        assert!(!is_protected(Path::new("_build/"), &["data"]));
    }

    #[test]
    fn test_clean_untracked_removes_only_unprotected() {
        let dir = tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        ensure_excludes(&repo, &["data", "_build"]).unwrap();

        fs::write(dir.path().join("stray.txt"), "x").unwrap();
        fs::create_dir_all(dir.path().join("scratch/deep")).unwrap();
        fs::write(dir.path().join("scratch/deep/f"), "x").unwrap();
        fs::create_dir_all(dir.path().join("data")).unwrap();
        fs::write(dir.path().join("data/set.csv"), "1,2").unwrap();
        fs::create_dir_all(dir.path().join("_build/html")).unwrap();
        fs::write(dir.path().join("_build/html/index.html"), "<html/>").unwrap();

        let removed = clean_untracked(&repo, &protected_dirs(true)).unwrap();

        assert_eq!(removed, 2);
        assert!(!dir.path().join("stray.txt").exists());
        assert!(!dir.path().join("scratch").exists());
        assert!(dir.path().join("data/set.csv").exists());
        assert!(dir.path().join("_build/html/index.html").exists());
    }

    #[test]
    fn test_clean_untracked_keeps_nested_data_in_untracked_dir() {
        let dir = tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        ensure_excludes(&repo, &["data"]).unwrap();

        fs::create_dir_all(dir.path().join("chapter/data")).unwrap();
        fs::write(dir.path().join("chapter/data/set.csv"), "1,2").unwrap();
        fs::write(dir.path().join("chapter/notes.md"), "x").unwrap();
        fs::create_dir_all(dir.path().join("chapter/figures")).unwrap();
        fs::write(dir.path().join("chapter/figures/a.png"), "png").unwrap();

        clean_untracked(&repo, &protected_dirs(false)).unwrap();

        assert!(dir.path().join("chapter/data/set.csv").exists());
        assert!(!dir.path().join("chapter/notes.md").exists());
        assert!(!dir.path().join("chapter/figures").exists());
    }

    #[test]
    fn test_clean_untracked_drops_build_cache_when_not_preserved() {
        let dir = tempdir().unwrap();
        let repo = Repository::init(dir.path()).unwrap();
        ensure_excludes(&repo, &["data"]).unwrap();
        fs::create_dir_all(dir.path().join("_build")).unwrap();
        fs::write(dir.path().join("_build/cache"), "x").unwrap();

        clean_untracked(&repo, &protected_dirs(false)).unwrap();

        assert!(!dir.path().join("_build").exists());
    }
}
