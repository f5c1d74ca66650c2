//! Local git blobstore
//!
//! Iconfiles are plain files in a git working tree. Every mutation writes or
//! removes files, stages everything and makes exactly one commit. If any of
//! those steps fails the working tree is reset to the last commit.
//!
//! git must not run concurrently against one working tree, so all git work
//! of an instance goes through a single [`JobQueue`] worker.

use super::paths::iconfile_path;
use super::queue::JobQueue;
use super::{
    commit_failure_requested, commit_message, BlobstoreError, BlobstoreRepository,
    CommitMetadata,
};
use crate::models::{IconDescriptor, Iconfile, IconfileDescriptor};
use crate::vcs;
use async_trait::async_trait;
use chrono::DateTime;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

const COMMITTER_NAME: &str = "Icon Repo Server";
const COMMITTER_EMAIL: &str = "IconRepoServer@UIToolBox";

/// Format for `git show`: one field per line, message last
const METADATA_FORMAT: &str = "--format=%H%n%an%n%ae%n%aI%n%cn%n%ce%n%cI%n%B";

/// A git working tree holding iconfiles
#[derive(Clone)]
pub struct LocalGitRepository {
    inner: Arc<WorkingTree>,
    queue: JobQueue,
}

struct WorkingTree {
    location: PathBuf,
    simulate_commit_failure: AtomicBool,
}

/// One file-level change of a commit
struct FileChange {
    icon_name: String,
    descriptor: IconfileDescriptor,
    path: String,
    /// `Some` writes the file, `None` removes it
    content: Option<Vec<u8>>,
}

impl LocalGitRepository {
    /// Open (without creating) the repository at `location`
    ///
    /// Spawns the job worker, so this must run inside a Tokio runtime.
    pub fn new(location: impl Into<PathBuf>) -> Self {
        let location = location.into();
        let queue = JobQueue::spawn(format!("git:{}", location.display()));
        Self {
            inner: Arc::new(WorkingTree {
                location,
                simulate_commit_failure: AtomicBool::new(commit_failure_requested()),
            }),
            queue,
        }
    }

    /// Make every following commit fail (or stop doing so)
    pub fn set_commit_failure(&self, enabled: bool) {
        self.inner
            .simulate_commit_failure
            .store(enabled, Ordering::SeqCst);
    }

    pub fn location(&self) -> &Path {
        &self.inner.location
    }

    async fn commit_changes(
        &self,
        changes: Vec<FileChange>,
        action: &'static str,
        modified_by: &str,
    ) -> Result<(), BlobstoreError> {
        let tree = Arc::clone(&self.inner);
        let modified_by = modified_by.to_string();
        self.queue
            .submit(async move { tree.commit_transaction(changes, action, &modified_by).await })
            .await?
    }
}

impl WorkingTree {
    async fn git(&self, args: &[&str], context: &str) -> Result<String, BlobstoreError> {
        vcs::git(args, &self.location)
            .await
            .map(|output| output.stdout)
            .map_err(|e| BlobstoreError::command(context, e))
    }

    fn absolute(&self, relative: &str) -> PathBuf {
        relative
            .split('/')
            .fold(self.location.clone(), |path, part| path.join(part))
    }

    async fn create(&self) -> Result<(), BlobstoreError> {
        if self.location.join(".git").is_dir() {
            info!("Git repository already exists at {:?}", self.location);
            return Ok(());
        }

        tokio::fs::create_dir_all(&self.location)
            .await
            .map_err(|e| {
                BlobstoreError::io(format!("Failed to create {:?}", self.location), e)
            })?;

        self.git(&["init", "-q"], "Failed to initialize git repository")
            .await?;
        self.git(
            &["config", "user.name", COMMITTER_NAME],
            "Failed to configure committer name",
        )
        .await?;
        self.git(
            &["config", "user.email", COMMITTER_EMAIL],
            "Failed to configure committer email",
        )
        .await?;
        self.git(
            &["commit", "-q", "--allow-empty", "-m", "Initial commit"],
            "Failed to create initial commit",
        )
        .await?;

        info!("Created git repository at {:?}", self.location);
        Ok(())
    }

    async fn delete(&self) -> Result<(), BlobstoreError> {
        match tokio::fs::remove_dir_all(&self.location).await {
            Ok(()) => {
                info!("Deleted git repository at {:?}", self.location);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BlobstoreError::io(
                format!("Failed to delete {:?}", self.location),
                e,
            )),
        }
    }

    async fn commit_transaction(
        &self,
        changes: Vec<FileChange>,
        action: &str,
        modified_by: &str,
    ) -> Result<(), BlobstoreError> {
        let paths: Vec<String> = changes.iter().map(|c| c.path.clone()).collect();
        let message = commit_message(&paths, action, modified_by);

        let result = self.apply_and_commit(&changes, &message, modified_by).await;
        match &result {
            Ok(()) => info!("Committed: {}", message),
            Err(e) => {
                warn!("Commit '{}' failed, rolling back: {}", message, e);
                self.rollback().await;
            }
        }
        result
    }

    async fn apply_and_commit(
        &self,
        changes: &[FileChange],
        message: &str,
        modified_by: &str,
    ) -> Result<(), BlobstoreError> {
        for change in changes {
            self.apply(change).await?;
        }

        self.git(&["add", "-A"], "Failed to stage changes").await?;

        let author = format!("--author={}@IconRepoServer <{}>", modified_by, modified_by);
        let args: Vec<&str> = if self.simulate_commit_failure.load(Ordering::SeqCst) {
            vec!["procyon lotor"]
        } else {
            vec!["commit", "-q", "-m", message, &author]
        };
        self.git(&args, "Failed to commit changes").await?;
        Ok(())
    }

    async fn apply(&self, change: &FileChange) -> Result<(), BlobstoreError> {
        let path = self.absolute(&change.path);
        match &change.content {
            Some(content) => {
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await.map_err(|e| {
                        BlobstoreError::io(format!("Failed to create {:?}", parent), e)
                    })?;
                }
                tokio::fs::write(&path, content)
                    .await
                    .map_err(|e| BlobstoreError::io(format!("Failed to write {:?}", path), e))
            }
            None => match tokio::fs::remove_file(&path).await {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    Err(BlobstoreError::IconfileNotFound {
                        icon: change.icon_name.clone(),
                        iconfile: change.descriptor.clone(),
                    })
                }
                Err(e) => Err(BlobstoreError::io(format!("Failed to remove {:?}", path), e)),
            },
        }
    }

    /// Return the working tree to the last commit. Failures are only logged.
    async fn rollback(&self) {
        if let Err(e) = vcs::git(&["reset", "--hard", "HEAD"], &self.location).await {
            error!("Rollback of {:?} failed at reset: {}", self.location, e);
        }
        if let Err(e) = vcs::git(&["clean", "-qfdx"], &self.location).await {
            error!("Rollback of {:?} failed at clean: {}", self.location, e);
        }
    }

    async fn check_status(&self) -> Result<bool, BlobstoreError> {
        let status = self
            .git(&["status", "--porcelain"], "Failed to read status")
            .await?;
        Ok(status.trim().is_empty())
    }

    async fn state_id(&self) -> Result<String, BlobstoreError> {
        let head = self
            .git(&["rev-parse", "HEAD"], "Failed to resolve HEAD")
            .await?;
        Ok(head.trim().to_string())
    }

    async fn list_iconfiles(&self) -> Result<Vec<String>, BlobstoreError> {
        let listing = self
            .git(
                &["ls-tree", "-r", "HEAD", "--name-only"],
                "Failed to list files",
            )
            .await?;
        Ok(listing
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect())
    }

    async fn version_for(&self, path: &str) -> Result<Option<String>, BlobstoreError> {
        let commit = self
            .git(
                &["log", "-n", "1", "--pretty=format:%H", "--", path],
                "Failed to look up version",
            )
            .await?;
        let commit = commit.trim();
        Ok(if commit.is_empty() {
            None
        } else {
            Some(commit.to_string())
        })
    }

    async fn version_metadata(&self, version: &str) -> Result<CommitMetadata, BlobstoreError> {
        if version.is_empty() || version.starts_with('-') {
            return Err(BlobstoreError::InvalidPathComponent(version.to_string()));
        }
        let raw = self
            .git(
                &["show", "-s", METADATA_FORMAT, version],
                "Failed to read commit metadata",
            )
            .await?;
        parse_commit_metadata(&raw)
    }
}

fn parse_commit_metadata(raw: &str) -> Result<CommitMetadata, BlobstoreError> {
    let mut lines = raw.splitn(8, '\n');
    let mut next = |field: &str| {
        lines
            .next()
            .map(str::to_string)
            .ok_or_else(|| BlobstoreError::Decode {
                what: "commit metadata".to_string(),
                details: format!("missing {}", field),
            })
    };

    let commit_id = next("commit id")?;
    let author_name = next("author name")?;
    let author_email = next("author email")?;
    let authored = next("author date")?;
    let committer_name = next("committer name")?;
    let committer_email = next("committer email")?;
    let committed = next("commit date")?;
    let message = next("message").unwrap_or_default();

    let parse_date = |value: &str| {
        DateTime::parse_from_rfc3339(value).map_err(|e| BlobstoreError::Decode {
            what: "commit date".to_string(),
            details: format!("{}: {}", value, e),
        })
    };

    Ok(CommitMetadata {
        commit_id,
        author_name,
        author_email,
        authored_at: parse_date(&authored)?,
        committer_name,
        committer_email,
        committed_at: parse_date(&committed)?,
        message: message.trim_end().to_string(),
    })
}

impl fmt::Display for LocalGitRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "local git repository at {}", self.inner.location.display())
    }
}

#[async_trait]
impl BlobstoreRepository for LocalGitRepository {
    async fn create(&self) -> Result<(), BlobstoreError> {
        let tree = Arc::clone(&self.inner);
        self.queue.submit(async move { tree.create().await }).await?
    }

    async fn delete(&self) -> Result<(), BlobstoreError> {
        let tree = Arc::clone(&self.inner);
        self.queue.submit(async move { tree.delete().await }).await?
    }

    async fn add_iconfile(
        &self,
        icon_name: &str,
        iconfile: &Iconfile,
        modified_by: &str,
    ) -> Result<(), BlobstoreError> {
        let change = FileChange {
            icon_name: icon_name.to_string(),
            descriptor: iconfile.descriptor.clone(),
            path: iconfile_path(icon_name, &iconfile.descriptor)?,
            content: Some(iconfile.content.clone()),
        };
        self.commit_changes(vec![change], "added", modified_by).await
    }

    async fn get_iconfile(
        &self,
        icon_name: &str,
        descriptor: &IconfileDescriptor,
    ) -> Result<Vec<u8>, BlobstoreError> {
        let path = self.inner.absolute(&iconfile_path(icon_name, descriptor)?);
        tokio::fs::read(&path).await.map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                BlobstoreError::IconfileNotFound {
                    icon: icon_name.to_string(),
                    iconfile: descriptor.clone(),
                }
            } else {
                BlobstoreError::io(format!("Failed to read {:?}", path), e)
            }
        })
    }

    async fn delete_icon(
        &self,
        icon: &IconDescriptor,
        modified_by: &str,
    ) -> Result<(), BlobstoreError> {
        let changes = icon
            .iconfiles
            .iter()
            .map(|descriptor| {
                Ok(FileChange {
                    icon_name: icon.name.clone(),
                    descriptor: descriptor.clone(),
                    path: iconfile_path(&icon.name, descriptor)?,
                    content: None,
                })
            })
            .collect::<Result<Vec<_>, BlobstoreError>>()?;

        if changes.is_empty() {
            return Ok(());
        }
        self.commit_changes(changes, "deleted", modified_by).await
    }

    async fn delete_iconfile(
        &self,
        icon_name: &str,
        descriptor: &IconfileDescriptor,
        modified_by: &str,
    ) -> Result<(), BlobstoreError> {
        let change = FileChange {
            icon_name: icon_name.to_string(),
            descriptor: descriptor.clone(),
            path: iconfile_path(icon_name, descriptor)?,
            content: None,
        };
        self.commit_changes(vec![change], "deleted", modified_by)
            .await
    }

    async fn check_status(&self) -> Result<bool, BlobstoreError> {
        let tree = Arc::clone(&self.inner);
        self.queue
            .submit(async move { tree.check_status().await })
            .await?
    }

    async fn get_state_id(&self) -> Result<String, BlobstoreError> {
        let tree = Arc::clone(&self.inner);
        self.queue.submit(async move { tree.state_id().await }).await?
    }

    async fn list_iconfiles(&self) -> Result<Vec<String>, BlobstoreError> {
        let tree = Arc::clone(&self.inner);
        self.queue
            .submit(async move { tree.list_iconfiles().await })
            .await?
    }

    async fn get_version_for(
        &self,
        icon_name: &str,
        descriptor: &IconfileDescriptor,
    ) -> Result<Option<String>, BlobstoreError> {
        let path = iconfile_path(icon_name, descriptor)?;
        let tree = Arc::clone(&self.inner);
        self.queue
            .submit(async move { tree.version_for(&path).await })
            .await?
    }

    async fn get_version_metadata(&self, version: &str) -> Result<CommitMetadata, BlobstoreError> {
        let version = version.to_string();
        let tree = Arc::clone(&self.inner);
        self.queue
            .submit(async move { tree.version_metadata(&version).await })
            .await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn create_repo() -> (TempDir, LocalGitRepository) {
        let dir = TempDir::new().unwrap();
        let repo = LocalGitRepository::new(dir.path().join("icons"));
        repo.set_commit_failure(false);
        repo.create().await.unwrap();
        (dir, repo)
    }

    fn dock_png() -> Iconfile {
        Iconfile::new(IconfileDescriptor::new("png", "36dp"), b"png-bytes".to_vec())
    }

    #[tokio::test]
    async fn test_create_initializes_clean_repository() {
        let (_dir, repo) = create_repo().await;

        assert!(repo.location().join(".git").is_dir());
        assert!(repo.check_status().await.unwrap());
        assert!(!repo.get_state_id().await.unwrap().is_empty());
        assert!(repo.list_iconfiles().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_is_idempotent() {
        let (_dir, repo) = create_repo().await;
        let state = repo.get_state_id().await.unwrap();

        repo.create().await.unwrap();
        assert_eq!(repo.get_state_id().await.unwrap(), state);
    }

    #[tokio::test]
    async fn test_add_and_get_iconfile() {
        let (_dir, repo) = create_repo().await;
        let iconfile = dock_png();

        repo.add_iconfile("dock", &iconfile, "ux").await.unwrap();

        let content = repo.get_iconfile("dock", &iconfile.descriptor).await.unwrap();
        assert_eq!(content, iconfile.content);
        assert_eq!(
            repo.list_iconfiles().await.unwrap(),
            vec!["png/36dp/dock@36dp.png".to_string()]
        );
        assert!(repo.check_status().await.unwrap());
    }

    #[tokio::test]
    async fn test_commit_author_and_message() {
        let (_dir, repo) = create_repo().await;
        let iconfile = dock_png();
        repo.add_iconfile("dock", &iconfile, "ux").await.unwrap();

        let version = repo
            .get_version_for("dock", &iconfile.descriptor)
            .await
            .unwrap()
            .expect("version after add");
        assert_eq!(version, repo.get_state_id().await.unwrap());

        let metadata = repo.get_version_metadata(&version).await.unwrap();
        assert_eq!(metadata.commit_id, version);
        assert_eq!(metadata.author_name, "ux@IconRepoServer");
        assert_eq!(metadata.author_email, "ux");
        assert_eq!(metadata.committer_name, COMMITTER_NAME);
        assert!(metadata.message.contains("png/36dp/dock@36dp.png"));
        assert!(metadata.message.ends_with("by ux"));
    }

    #[tokio::test]
    async fn test_version_for_unknown_iconfile_is_none() {
        let (_dir, repo) = create_repo().await;
        let version = repo
            .get_version_for("dock", &IconfileDescriptor::new("svg", "18px"))
            .await
            .unwrap();
        assert!(version.is_none());
    }

    #[tokio::test]
    async fn test_get_missing_iconfile() {
        let (_dir, repo) = create_repo().await;
        let err = repo
            .get_iconfile("dock", &IconfileDescriptor::new("png", "36dp"))
            .await
            .unwrap_err();
        assert!(matches!(err, BlobstoreError::IconfileNotFound { .. }));
    }

    #[tokio::test]
    async fn test_delete_iconfile() {
        let (_dir, repo) = create_repo().await;
        let iconfile = dock_png();
        repo.add_iconfile("dock", &iconfile, "ux").await.unwrap();

        repo.delete_iconfile("dock", &iconfile.descriptor, "ux")
            .await
            .unwrap();

        assert!(repo.list_iconfiles().await.unwrap().is_empty());
        assert!(repo.check_status().await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_missing_iconfile_rolls_back() {
        let (_dir, repo) = create_repo().await;
        let state = repo.get_state_id().await.unwrap();

        let err = repo
            .delete_iconfile("dock", &IconfileDescriptor::new("png", "36dp"), "ux")
            .await
            .unwrap_err();

        assert!(matches!(err, BlobstoreError::IconfileNotFound { .. }));
        assert_eq!(repo.get_state_id().await.unwrap(), state);
    }

    #[tokio::test]
    async fn test_delete_icon_removes_all_files_in_one_commit() {
        let (_dir, repo) = create_repo().await;
        let png = dock_png();
        let svg = Iconfile::new(IconfileDescriptor::new("svg", "18px"), b"<svg/>".to_vec());
        repo.add_iconfile("dock", &png, "ux").await.unwrap();
        repo.add_iconfile("dock", &svg, "ux").await.unwrap();

        let mut icon = IconDescriptor::new("dock", "ux");
        icon.iconfiles = vec![png.descriptor.clone(), svg.descriptor.clone()];
        repo.delete_icon(&icon, "admin").await.unwrap();

        assert!(repo.list_iconfiles().await.unwrap().is_empty());
        let head = repo.get_state_id().await.unwrap();
        let metadata = repo.get_version_metadata(&head).await.unwrap();
        assert!(metadata.message.contains("png/36dp/dock@36dp.png"));
        assert!(metadata.message.contains("svg/18px/dock@18px.svg"));
    }

    #[tokio::test]
    async fn test_failed_commit_rolls_back_working_tree() {
        let (_dir, repo) = create_repo().await;
        let state = repo.get_state_id().await.unwrap();

        repo.set_commit_failure(true);
        let err = repo
            .add_iconfile("dock", &dock_png(), "ux")
            .await
            .unwrap_err();
        assert!(matches!(err, BlobstoreError::Command { .. }));

        assert!(repo.check_status().await.unwrap());
        assert_eq!(repo.get_state_id().await.unwrap(), state);
        assert!(!repo.location().join("png").exists());

        repo.set_commit_failure(false);
        repo.add_iconfile("dock", &dock_png(), "ux").await.unwrap();
        assert_ne!(repo.get_state_id().await.unwrap(), state);
    }

    #[tokio::test]
    async fn test_concurrent_adds_are_serialized() {
        let (_dir, repo) = create_repo().await;

        let mut handles = Vec::new();
        for i in 0..6 {
            let repo = repo.clone();
            handles.push(tokio::spawn(async move {
                let iconfile = Iconfile::new(
                    IconfileDescriptor::new("png", "36dp"),
                    format!("content-{}", i).into_bytes(),
                );
                repo.add_iconfile(&format!("icon{}", i), &iconfile, "ux").await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(repo.list_iconfiles().await.unwrap().len(), 6);
        assert!(repo.check_status().await.unwrap());
    }

    #[tokio::test]
    async fn test_invalid_icon_name_rejected() {
        let (_dir, repo) = create_repo().await;
        let err = repo
            .add_iconfile("../escape", &dock_png(), "ux")
            .await
            .unwrap_err();
        assert!(matches!(err, BlobstoreError::InvalidPathComponent(_)));
    }

    #[tokio::test]
    async fn test_delete_repository() {
        let (_dir, repo) = create_repo().await;
        repo.delete().await.unwrap();
        assert!(!repo.location().exists());
        // Deleting twice is fine
        repo.delete().await.unwrap();
    }

    #[test]
    fn test_parse_commit_metadata() {
        let raw = "abc123\nux@IconRepoServer\nux\n2024-03-11T10:00:00+01:00\nIcon Repo Server\nIconRepoServer@UIToolBox\n2024-03-11T10:00:01+01:00\npng/36dp/dock@36dp.png added by ux\n\n";
        let metadata = parse_commit_metadata(raw).unwrap();
        assert_eq!(metadata.commit_id, "abc123");
        assert_eq!(metadata.author_email, "ux");
        assert_eq!(metadata.message, "png/36dp/dock@36dp.png added by ux");
        assert_eq!(metadata.authored_at.to_rfc3339(), "2024-03-11T10:00:00+01:00");
    }
}
