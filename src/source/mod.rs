//! Source Manager: the reusable `latest/` working tree and its snapshots.
//!
//! Cache layout, rooted at the configured parent directory:
//!
//! ```text
//! <parent>/<owner>/<repo>/latest/        mutable working tree
//! <parent>/<owner>/<repo>/latest.txt     last successfully built commit
//! <parent>/<owner>/<repo>/<commit-hash>/ snapshot of a successful build
//! ```
//!
//! Only `latest/` is ever cloned, fetched, or checked out. Snapshot
//! directories are produced by copying it after a successful build.

pub mod exclude;
pub mod snapshot;

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, FixedOffset, NaiveDate, Offset, Utc};
use git2::build::CheckoutBuilder;
use git2::{Repository, ResetType};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::{LATEST, ReesConfig, RepositoryRef};
use crate::errors::{ReesError, Result};

pub const LATEST_DIR: &str = "latest";
pub const DATA_REQUIREMENT_FILE: &str = "binder/data_requirement.json";

const OVERRIDE_IMAGE_MESSAGE: &str = "Base runtime image";

/// A resolved commit: when it was made, what it says, and (when known) its id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitInfo {
    pub datetime: DateTime<FixedOffset>,
    pub message: String,
    pub hash: Option<String>,
}

impl CommitInfo {
    fn from_commit(commit: &git2::Commit<'_>) -> Self {
        let time = commit.time();
        let offset = FixedOffset::east_opt(time.offset_minutes() * 60).unwrap_or(Utc.fix());
        let datetime = DateTime::from_timestamp(time.seconds(), 0)
            .unwrap_or(DateTime::UNIX_EPOCH)
            .with_timezone(&offset);
        Self {
            datetime,
            message: commit.message().unwrap_or_default().trim().to_string(),
            hash: Some(commit.id().to_string()),
        }
    }

    /// Record used for images that are not built from the source history.
    pub fn override_image() -> Self {
        let datetime = NaiveDate::from_ymd_opt(2024, 11, 20)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(|naive| naive.and_utc().fixed_offset())
            .unwrap_or_else(|| DateTime::UNIX_EPOCH.fixed_offset());
        Self {
            datetime,
            message: OVERRIDE_IMAGE_MESSAGE.to_string(),
            hash: None,
        }
    }
}

/// State of the build tree after a clone or checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildContext {
    pub build_dir: PathBuf,
    pub dataset_name: Option<String>,
    pub preserve_cache: bool,
    pub repo_commit: Option<CommitInfo>,
    pub image_commit: Option<CommitInfo>,
}

#[derive(Debug, Deserialize)]
struct DataRequirement {
    #[serde(rename = "projectName")]
    project_name: Option<String>,
}

/// Manages the `latest/` working tree of one repository.
pub struct SourceManager {
    repository: RepositoryRef,
    provider: String,
    branch: String,
    commit_ref: String,
    image_tag: String,
    image_is_override: bool,
    preserve_cache: bool,
    parent_dir: Option<PathBuf>,
    context: Option<BuildContext>,
}

impl SourceManager {
    pub fn new(
        repository: RepositoryRef,
        provider: impl Into<String>,
        branch: impl Into<String>,
        commit_ref: impl Into<String>,
        image_tag: impl Into<String>,
        image_is_override: bool,
        preserve_cache: bool,
    ) -> Self {
        Self {
            repository,
            provider: provider.into().trim_end_matches('/').to_string(),
            branch: branch.into(),
            commit_ref: commit_ref.into(),
            image_tag: image_tag.into(),
            image_is_override,
            preserve_cache,
            parent_dir: None,
            context: None,
        }
    }

    /// Manager for the configured repository, attached to the configured
    /// build-source parent directory.
    pub fn from_config(config: &ReesConfig) -> Self {
        let env = &config.environment;
        let mut manager = Self::new(
            env.repository.clone(),
            config.source.provider.clone(),
            env.branch.clone(),
            env.commit_ref.clone(),
            env.image_tag.clone(),
            env.image_name_override.is_some(),
            config.source.preserve_cache,
        );
        manager.attach(&config.container.host_build_source_parent_dir);
        manager
    }

    pub fn clone_url(&self) -> String {
        format!(
            "{}/{}/{}",
            self.provider,
            self.repository.owner(),
            self.repository.name()
        )
    }

    pub fn commit_ref(&self) -> &str {
        &self.commit_ref
    }

    /// Replace the target commit and image tag once they are resolved.
    pub fn pin(&mut self, commit_ref: &str, image_tag: &str) {
        self.commit_ref = commit_ref.to_string();
        self.image_tag = image_tag.to_string();
    }

    pub fn preserve_cache(&self) -> bool {
        self.preserve_cache
    }

    pub fn context(&self) -> Option<&BuildContext> {
        self.context.as_ref()
    }

    /// `<parent>/<owner>/<repo>`, once a parent directory is known.
    pub fn cache_root(&self) -> Option<PathBuf> {
        self.parent_dir.as_ref().map(|parent| {
            parent
                .join(self.repository.owner())
                .join(self.repository.name())
        })
    }

    pub fn build_dir(&self) -> Option<PathBuf> {
        self.cache_root().map(|root| root.join(LATEST_DIR))
    }

    pub fn snapshot_dir(&self, hash: &str) -> Option<PathBuf> {
        self.cache_root().map(|root| root.join(hash))
    }

    /// Point the manager at `parent_dir` without touching the network.
    pub fn attach(&mut self, parent_dir: &Path) {
        self.parent_dir = Some(parent_dir.to_path_buf());
    }

    /// Open and fetch an existing `latest/` tree, or clone a fresh one.
    /// Returns `true` when a clone happened.
    pub fn clone_or_reuse(&mut self, parent_dir: &Path) -> Result<bool> {
        self.attach(parent_dir);
        let build_dir = self.require_build_dir()?;

        let fresh = if build_dir.exists() {
            info!(path = %build_dir.display(), "reusing existing source tree");
            let repo = open_repo(&build_dir)?;
            fetch_origin(&repo)?;
            false
        } else {
            if let Some(parent) = build_dir.parent() {
                fs::create_dir_all(parent).map_err(|e| ReesError::git_io("create", parent, e))?;
            }
            let url = self.clone_url();
            info!(%url, path = %build_dir.display(), "cloning source repository");
            Repository::clone(&url, &build_dir)
                .map_err(|e| ReesError::git(format!("clone {}", url), e))?;
            true
        };

        self.refresh_context(&build_dir)?;
        Ok(fresh)
    }

    /// Prepare `latest/` for the target commit: protect data and cache
    /// directories, fetch, clean, hard-reset, and check out.
    pub fn checkout_target(&mut self) -> Result<bool> {
        if self.context.is_none() {
            return Err(ReesError::git(
                "checkout",
                anyhow::anyhow!("source tree has not been cloned"),
            ));
        }
        let build_dir = self.require_build_dir()?;
        let repo = open_repo(&build_dir)?;

        let protected = exclude::protected_dirs(self.preserve_cache);
        exclude::ensure_excludes(&repo, &protected)?;

        fetch_origin(&repo)?;

        let removed = exclude::clean_untracked(&repo, &protected)?;
        debug!(removed, "cleaned working tree");

        let head = repo
            .head()
            .and_then(|head| head.peel_to_commit())
            .map_err(|e| ReesError::git("resolve HEAD", e))?;
        repo.reset(head.as_object(), ResetType::Hard, None)
            .map_err(|e| ReesError::git("hard reset", e))?;

        let target = self.find_target(&repo)?;
        repo.checkout_tree(target.as_object(), Some(CheckoutBuilder::new().force()))
            .map_err(|e| ReesError::git(format!("checkout {}", self.commit_ref), e))?;
        repo.set_head_detached(target.id())
            .map_err(|e| ReesError::git(format!("detach HEAD at {}", target.id()), e))?;
        info!(commit = %target.id(), "checked out target commit");

        self.refresh_context(&build_dir)?;
        Ok(true)
    }

    /// Copy `latest/` to a snapshot named after the checked-out commit and
    /// record it in `latest.txt`.
    pub fn save_successful_build(&self) -> Result<bool> {
        let (Some(cache_root), Some(build_dir)) = (self.cache_root(), self.build_dir()) else {
            return Err(ReesError::git(
                "save build",
                anyhow::anyhow!("no build directory is known"),
            ));
        };
        let hash = self
            .context
            .as_ref()
            .and_then(|ctx| ctx.repo_commit.as_ref())
            .and_then(|commit| commit.hash.clone())
            .unwrap_or_else(|| self.commit_ref.clone());
        snapshot::save_snapshot(&cache_root, &build_dir, &hash)?;
        Ok(true)
    }

    pub fn read_last_successful_hash(&self) -> Option<String> {
        self.cache_root()
            .and_then(|root| snapshot::read_marker(&root))
    }

    pub fn snapshots(&self) -> Vec<String> {
        self.cache_root()
            .map(|root| snapshot::list_snapshots(&root))
            .unwrap_or_default()
    }

    /// Delete `latest/_build`. Succeeds when it is already absent.
    pub fn clear_build_cache(&self) -> Result<bool> {
        let Some(build_dir) = self.build_dir() else {
            return Ok(true);
        };
        let cache = build_dir.join(exclude::BUILD_CACHE_DIR);
        match fs::remove_dir_all(&cache) {
            Ok(()) => {
                info!(path = %cache.display(), "cleared build cache");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
            Err(e) => Err(ReesError::git_io("remove", &cache, e)),
        }
    }

    /// Dataset named by `binder/data_requirement.json` in the build tree.
    pub fn dataset_name(&self) -> Option<String> {
        let manifest = self.build_dir()?.join(DATA_REQUIREMENT_FILE);
        read_dataset_name(&manifest, self.repository.name())
    }

    pub fn data_requirement_path(&self) -> Option<PathBuf> {
        self.build_dir().map(|dir| dir.join(DATA_REQUIREMENT_FILE))
    }

    fn require_build_dir(&self) -> Result<PathBuf> {
        self.build_dir().ok_or_else(|| {
            ReesError::git("locate build directory", anyhow::anyhow!("no parent directory set"))
        })
    }

    /// Candidate refs for the target commit. Names prefer the fetched
    /// remote ref over a possibly stale local branch. An unresolved `latest`
    /// falls back to the remote branch tip.
    fn target_candidates(&self) -> Vec<String> {
        let remote = format!("origin/{}", self.commit_ref);
        let mut candidates = if looks_like_hash(&self.commit_ref) {
            vec![self.commit_ref.clone(), remote]
        } else {
            vec![remote, self.commit_ref.clone()]
        };
        if self.commit_ref == LATEST {
            candidates.push(format!("origin/{}", self.branch));
        }
        candidates
    }

    fn find_target<'r>(&self, repo: &'r Repository) -> Result<git2::Commit<'r>> {
        let mut last_err = None;
        for candidate in self.target_candidates() {
            match repo
                .revparse_single(&candidate)
                .and_then(|obj| obj.peel_to_commit())
            {
                Ok(commit) => return Ok(commit),
                Err(e) => last_err = Some(e),
            }
        }
        let message = format!("resolve commit {}", self.commit_ref);
        Err(match last_err {
            Some(e) => ReesError::git(message, e),
            None => ReesError::git(message, anyhow::anyhow!("no candidates")),
        })
    }

    fn refresh_context(&mut self, build_dir: &Path) -> Result<()> {
        let repo = open_repo(build_dir)?;
        let repo_commit = CommitInfo::from_commit(&self.find_target(&repo)?);

        let image_commit = if self.image_is_override {
            Some(CommitInfo::override_image())
        } else {
            match repo
                .revparse_single(&self.image_tag)
                .and_then(|obj| obj.peel_to_commit())
            {
                Ok(commit) => Some(CommitInfo::from_commit(&commit)),
                Err(e) => {
                    warn!(tag = %self.image_tag, "image tag does not name a commit: {}", e);
                    None
                }
            }
        };

        self.context = Some(BuildContext {
            build_dir: build_dir.to_path_buf(),
            dataset_name: read_dataset_name(
                &build_dir.join(DATA_REQUIREMENT_FILE),
                self.repository.name(),
            ),
            preserve_cache: self.preserve_cache,
            repo_commit: Some(repo_commit),
            image_commit,
        });
        Ok(())
    }
}

fn open_repo(path: &Path) -> Result<Repository> {
    Repository::open(path).map_err(|e| ReesError::git(format!("open {}", path.display()), e))
}

fn fetch_origin(repo: &Repository) -> Result<()> {
    info!("fetching latest changes from origin");
    let mut remote = repo
        .find_remote("origin")
        .map_err(|e| ReesError::git("find remote origin", e))?;
    remote
        .fetch(&[] as &[&str], None, None)
        .map_err(|e| ReesError::git("fetch origin", e))
}

fn read_dataset_name(manifest: &Path, repo_name: &str) -> Option<String> {
    let content = match fs::read_to_string(manifest) {
        Ok(content) => content,
        Err(_) => {
            warn!(path = %manifest.display(), "data requirement file not found, no dataset");
            return None;
        }
    };
    match serde_json::from_str::<DataRequirement>(&content) {
        Ok(req) => Some(
            req.project_name
                .filter(|name| !name.trim().is_empty())
                .unwrap_or_else(|| repo_name.to_string()),
        ),
        Err(e) => {
            warn!(path = %manifest.display(), "unreadable data requirement file: {}", e);
            Some(repo_name.to_string())
        }
    }
}

/// Abbreviated or full hex object id.
fn looks_like_hash(reference: &str) -> bool {
    (4..=40).contains(&reference.len()) && reference.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::GitOrigin;
    use tempfile::tempdir;

    fn manager(origin: &GitOrigin, commit: &str, preserve: bool) -> SourceManager {
        SourceManager::new(
            format!("{}/{}", origin.owner, origin.name).parse().unwrap(),
            origin.provider(),
            origin.head_branch(),
            commit,
            "not-a-commit",
            false,
            preserve,
        )
    }

    fn git_dirs(root: &Path) -> usize {
        walkdir::WalkDir::new(root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name() == ".git")
            .count()
    }

    #[test]
    fn test_clone_then_reuse() {
        let origin = GitOrigin::new("owner", "repo");
        let head = origin.commit_file("doc.md", "v1", "Add doc");
        let cache = tempdir().unwrap();

        let mut sources = manager(&origin, &head, true);
        assert!(sources.clone_or_reuse(cache.path()).unwrap());
        assert!(!sources.clone_or_reuse(cache.path()).unwrap());

        let build_dir = cache.path().join("owner/repo/latest");
        assert_eq!(sources.build_dir().unwrap(), build_dir);
        assert!(build_dir.join("doc.md").exists());
        assert_eq!(git_dirs(cache.path()), 1);

        let ctx = sources.context().unwrap();
        let repo_commit = ctx.repo_commit.as_ref().unwrap();
        assert_eq!(repo_commit.hash.as_deref(), Some(head.as_str()));
        assert_eq!(repo_commit.message, "Add doc");
        assert!(ctx.image_commit.is_none());
    }

    #[test]
    fn test_clone_unknown_commit_fails() {
        let origin = GitOrigin::new("owner", "repo");
        let cache = tempdir().unwrap();
        let mut sources = manager(&origin, "deadbeefdeadbeef", true);
        let err = sources.clone_or_reuse(cache.path()).unwrap_err();
        assert!(matches!(err, ReesError::GitOperation { .. }));
    }

    #[test]
    fn test_checkout_requires_clone() {
        let origin = GitOrigin::new("owner", "repo");
        let mut sources = manager(&origin, "HEAD", true);
        assert!(matches!(
            sources.checkout_target(),
            Err(ReesError::GitOperation { .. })
        ));
    }

    #[test]
    fn test_checkout_preserves_data_and_cache() {
        let origin = GitOrigin::new("owner", "repo");
        let first = origin.commit_file("doc.md", "v1", "First");
        let second = origin.commit_file("doc.md", "v2", "Second");
        let cache = tempdir().unwrap();

        let mut sources = manager(&origin, &first, true);
        sources.clone_or_reuse(cache.path()).unwrap();
        sources.checkout_target().unwrap();

        let build_dir = sources.build_dir().unwrap();
        assert_eq!(fs::read_to_string(build_dir.join("doc.md")).unwrap(), "v1");

        fs::create_dir_all(build_dir.join("data")).unwrap();
        fs::write(build_dir.join("data/set.csv"), "1,2").unwrap();
        fs::create_dir_all(build_dir.join("_build/cache")).unwrap();
        fs::write(build_dir.join("_build/cache/x"), "cached").unwrap();
        fs::write(build_dir.join("stray.txt"), "stray").unwrap();
        fs::write(build_dir.join("doc.md"), "local edit").unwrap();

        let mut sources = manager(&origin, &second, true);
        sources.clone_or_reuse(cache.path()).unwrap();
        sources.checkout_target().unwrap();

        assert_eq!(fs::read_to_string(build_dir.join("doc.md")).unwrap(), "v2");
        assert!(build_dir.join("data/set.csv").exists());
        assert!(build_dir.join("_build/cache/x").exists());
        assert!(!build_dir.join("stray.txt").exists());

        let exclude = fs::read_to_string(build_dir.join(".git/info/exclude")).unwrap();
        assert_eq!(exclude.matches("data/").count(), 1);
        assert_eq!(exclude.matches("_build/").count(), 1);
    }

    #[test]
    fn test_checkout_without_cache_preservation_drops_build_dir() {
        let origin = GitOrigin::new("owner", "repo");
        let head = origin.commit_file("doc.md", "v1", "First");
        let cache = tempdir().unwrap();

        let mut sources = manager(&origin, &head, false);
        sources.clone_or_reuse(cache.path()).unwrap();
        let build_dir = sources.build_dir().unwrap();
        fs::create_dir_all(build_dir.join("_build")).unwrap();
        fs::write(build_dir.join("_build/x"), "cached").unwrap();
        fs::create_dir_all(build_dir.join("data")).unwrap();

        sources.checkout_target().unwrap();

        assert!(!build_dir.join("_build").exists());
        assert!(build_dir.join("data").exists());
    }

    #[test]
    fn test_unresolved_latest_falls_back_to_branch_tip() {
        let origin = GitOrigin::new("owner", "repo");
        let head = origin.commit_file("doc.md", "tip", "Tip");
        let cache = tempdir().unwrap();

        let mut sources = manager(&origin, LATEST, true);
        sources.clone_or_reuse(cache.path()).unwrap();
        sources.checkout_target().unwrap();

        let ctx = sources.context().unwrap();
        assert_eq!(
            ctx.repo_commit.as_ref().unwrap().hash.as_deref(),
            Some(head.as_str())
        );
    }

    #[test]
    fn test_branch_ref_follows_fetched_tip_over_stale_local_branch() {
        let origin = GitOrigin::new("owner", "repo");
        origin.commit_file("doc.md", "v1", "First");
        let cache = tempdir().unwrap();
        let branch = origin.head_branch();

        let mut sources = manager(&origin, &branch, true);
        sources.clone_or_reuse(cache.path()).unwrap();
        sources.checkout_target().unwrap();
        let build_dir = sources.build_dir().unwrap();
        assert_eq!(fs::read_to_string(build_dir.join("doc.md")).unwrap(), "v1");

        let tip = origin.commit_file("doc.md", "v2", "Second");
        let mut sources = manager(&origin, &branch, true);
        sources.clone_or_reuse(cache.path()).unwrap();
        sources.checkout_target().unwrap();

        assert_eq!(fs::read_to_string(build_dir.join("doc.md")).unwrap(), "v2");
        let ctx = sources.context().unwrap();
        assert_eq!(
            ctx.repo_commit.as_ref().unwrap().hash.as_deref(),
            Some(tip.as_str())
        );
    }

    #[test]
    fn test_hash_refs_are_tried_verbatim_first() {
        assert!(looks_like_hash("deadbeef"));
        assert!(looks_like_hash(&"a".repeat(40)));
        assert!(!looks_like_hash("main"));
        assert!(!looks_like_hash(LATEST));
    }

    #[test]
    fn test_save_and_read_last_hash() {
        let origin = GitOrigin::new("owner", "repo");
        let head = origin.commit_file("doc.md", "v1", "First");
        let cache = tempdir().unwrap();

        let mut sources = manager(&origin, &head, true);
        assert_eq!(sources.read_last_successful_hash(), None);
        sources.clone_or_reuse(cache.path()).unwrap();
        sources.checkout_target().unwrap();
        sources.save_successful_build().unwrap();

        assert_eq!(sources.read_last_successful_hash().as_deref(), Some(head.as_str()));
        assert!(sources.snapshot_dir(&head).unwrap().join("doc.md").exists());
        assert_eq!(sources.snapshots(), vec![head]);
    }

    #[test]
    fn test_clear_build_cache_is_idempotent() {
        let origin = GitOrigin::new("owner", "repo");
        let cache = tempdir().unwrap();
        let mut sources = manager(&origin, "HEAD", true);
        sources.clone_or_reuse(cache.path()).unwrap();
        let build_cache = sources.build_dir().unwrap().join("_build");
        fs::create_dir_all(build_cache.join("x")).unwrap();

        assert!(sources.clear_build_cache().unwrap());
        assert!(!build_cache.exists());
        assert!(sources.clear_build_cache().unwrap());
    }

    #[test]
    fn test_dataset_name_resolution() {
        let origin = GitOrigin::new("owner", "repo");
        let cache = tempdir().unwrap();
        let mut sources = manager(&origin, "HEAD", true);
        sources.clone_or_reuse(cache.path()).unwrap();
        assert_eq!(sources.dataset_name(), None);

        let manifest = sources.data_requirement_path().unwrap();
        fs::create_dir_all(manifest.parent().unwrap()).unwrap();
        fs::write(&manifest, r#"{"projectName":"my-dataset","src":"x"}"#).unwrap();
        assert_eq!(sources.dataset_name().as_deref(), Some("my-dataset"));

        fs::write(&manifest, r#"{"src":"x"}"#).unwrap();
        assert_eq!(sources.dataset_name().as_deref(), Some("repo"));
    }

    #[test]
    fn test_image_commit_info() {
        let origin = GitOrigin::new("owner", "repo");
        let head = origin.commit_file("doc.md", "v1", "Image source");
        let cache = tempdir().unwrap();

        let mut by_tag = SourceManager::new(
            "owner/repo".parse().unwrap(),
            origin.provider(),
            origin.head_branch(),
            head.clone(),
            head.clone(),
            false,
            true,
        );
        by_tag.clone_or_reuse(cache.path()).unwrap();
        let image = by_tag.context().unwrap().image_commit.clone().unwrap();
        assert_eq!(image.message, "Image source");

        let mut overridden = SourceManager::new(
            "owner/repo".parse().unwrap(),
            origin.provider(),
            origin.head_branch(),
            head,
            "v1",
            true,
            true,
        );
        overridden.clone_or_reuse(cache.path()).unwrap();
        let image = overridden.context().unwrap().image_commit.clone().unwrap();
        assert_eq!(image, CommitInfo::override_image());
        assert_eq!(image.datetime.format("%Y-%m-%d").to_string(), "2024-11-20");
    }
}
