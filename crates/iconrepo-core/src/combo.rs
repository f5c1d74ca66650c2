//! Repository coordinator
//!
//! Pairs one index with one blobstore and keeps them consistent. Each
//! mutation is handed to the index together with the matching blobstore
//! write as a side effect; the index undoes its own change when that write
//! fails, so a failed call leaves both stores as they were.

use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::blobstore::{iconfile_path, validate_path_component, BlobstoreRepository};
use crate::error::{RepoError, RepoResult};
use crate::indexing::{IndexRepository, SideEffect};
use crate::models::{IconDescriptor, Iconfile, IconfileDescriptor, TagUsage};

/// Drift between the index and the blobstore
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ConsistencyReport {
    /// Indexed iconfiles whose content is not in the blobstore
    pub missing_content: Vec<String>,
    /// Stored content that no indexed iconfile refers to
    pub orphaned_content: Vec<String>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.missing_content.is_empty() && self.orphaned_content.is_empty()
    }
}

fn validate(field: &'static str, value: &str) -> RepoResult<()> {
    validate_path_component(value).map_err(|_| RepoError::InvalidInput {
        field,
        reason: format!("'{}' is empty or contains a path separator or '..'", value),
    })
}

fn validate_iconfile(icon_name: &str, descriptor: &IconfileDescriptor) -> RepoResult<()> {
    validate("icon name", icon_name)?;
    validate("format", &descriptor.format)?;
    validate("size", &descriptor.size)
}

fn validate_tag(tag: &str) -> RepoResult<()> {
    if tag.trim().is_empty() {
        return Err(RepoError::InvalidInput {
            field: "tag",
            reason: "must not be empty".to_string(),
        });
    }
    Ok(())
}

/// Index and blobstore used as one repository
#[derive(Clone)]
pub struct RepoCombo {
    index: Arc<dyn IndexRepository>,
    blobstore: Arc<dyn BlobstoreRepository>,
}

impl RepoCombo {
    pub fn new(index: Arc<dyn IndexRepository>, blobstore: Arc<dyn BlobstoreRepository>) -> Self {
        Self { index, blobstore }
    }

    pub fn index(&self) -> &Arc<dyn IndexRepository> {
        &self.index
    }

    pub fn blobstore(&self) -> &Arc<dyn BlobstoreRepository> {
        &self.blobstore
    }

    // ==================== Reads ====================

    pub async fn describe_all_icons(&self) -> RepoResult<Vec<IconDescriptor>> {
        Ok(self.index.describe_all_icons().await?)
    }

    pub async fn describe_icon(&self, icon_name: &str) -> RepoResult<IconDescriptor> {
        validate("icon name", icon_name)?;
        Ok(self.index.describe_icon(icon_name).await?)
    }

    pub async fn get_tags(&self) -> RepoResult<Vec<String>> {
        Ok(self.index.get_existing_tags().await?)
    }

    pub async fn get_tags_with_counts(&self) -> RepoResult<Vec<TagUsage>> {
        Ok(self.index.get_tags_with_counts().await?)
    }

    /// Content comes straight from the blobstore
    pub async fn get_iconfile(
        &self,
        icon_name: &str,
        descriptor: &IconfileDescriptor,
    ) -> RepoResult<Vec<u8>> {
        validate_iconfile(icon_name, descriptor)?;
        Ok(self.blobstore.get_iconfile(icon_name, descriptor).await?)
    }

    // ==================== Mutations ====================

    pub async fn create_icon(
        &self,
        icon_name: &str,
        iconfile: &Iconfile,
        modified_by: &str,
    ) -> RepoResult<()> {
        validate_iconfile(icon_name, &iconfile.descriptor)?;

        let blobstore = &self.blobstore;
        let store_content: SideEffect<'_> =
            Box::pin(async move { blobstore.add_iconfile(icon_name, iconfile, modified_by).await });
        self.index
            .create_icon(
                icon_name,
                &iconfile.descriptor,
                modified_by,
                Some(store_content),
            )
            .await?;

        info!("{} created icon {}", modified_by, icon_name);
        Ok(())
    }

    pub async fn add_iconfile(
        &self,
        icon_name: &str,
        iconfile: &Iconfile,
        modified_by: &str,
    ) -> RepoResult<()> {
        validate_iconfile(icon_name, &iconfile.descriptor)?;

        let blobstore = &self.blobstore;
        let store_content: SideEffect<'_> =
            Box::pin(async move { blobstore.add_iconfile(icon_name, iconfile, modified_by).await });
        self.index
            .add_iconfile_to_icon(
                icon_name,
                &iconfile.descriptor,
                modified_by,
                Some(store_content),
            )
            .await?;
        Ok(())
    }

    /// Delete the icon with all its iconfiles
    pub async fn delete_icon(&self, icon_name: &str, modified_by: &str) -> RepoResult<()> {
        validate("icon name", icon_name)?;

        // The blobstore needs to know which files to remove
        let icon = self.index.describe_icon(icon_name).await?;

        let blobstore = &self.blobstore;
        let icon_ref = &icon;
        let remove_content: SideEffect<'_> =
            Box::pin(async move { blobstore.delete_icon(icon_ref, modified_by).await });
        self.index
            .delete_icon(icon_name, modified_by, Some(remove_content))
            .await?;

        info!("{} deleted icon {}", modified_by, icon_name);
        Ok(())
    }

    /// Delete one iconfile; the icon goes too when it was the last one
    pub async fn delete_iconfile(
        &self,
        icon_name: &str,
        descriptor: &IconfileDescriptor,
        modified_by: &str,
    ) -> RepoResult<()> {
        validate_iconfile(icon_name, descriptor)?;

        let blobstore = &self.blobstore;
        let remove_content: SideEffect<'_> = Box::pin(async move {
            blobstore
                .delete_iconfile(icon_name, descriptor, modified_by)
                .await
        });
        self.index
            .delete_iconfile(icon_name, descriptor, modified_by, Some(remove_content))
            .await?;
        Ok(())
    }

    pub async fn add_tag(&self, icon_name: &str, tag: &str, modified_by: &str) -> RepoResult<()> {
        validate("icon name", icon_name)?;
        validate_tag(tag)?;
        Ok(self.index.add_tag(icon_name, tag, modified_by).await?)
    }

    pub async fn remove_tag(
        &self,
        icon_name: &str,
        tag: &str,
        modified_by: &str,
    ) -> RepoResult<()> {
        validate("icon name", icon_name)?;
        validate_tag(tag)?;
        Ok(self.index.remove_tag(icon_name, tag, modified_by).await?)
    }

    // ==================== Management ====================

    /// Compare what the index describes with what the blobstore holds
    ///
    /// Read-only: nothing is repaired.
    pub async fn check_consistency(&self) -> RepoResult<ConsistencyReport> {
        let mut indexed = BTreeSet::new();
        for icon in self.index.describe_all_icons().await? {
            for descriptor in &icon.iconfiles {
                indexed.insert(iconfile_path(&icon.name, descriptor)?);
            }
        }
        let stored: BTreeSet<String> = self.blobstore.list_iconfiles().await?.into_iter().collect();

        let report = ConsistencyReport {
            missing_content: indexed.difference(&stored).cloned().collect(),
            orphaned_content: stored.difference(&indexed).cloned().collect(),
        };
        if !report.is_consistent() {
            warn!(
                "Index and {} disagree: {} missing, {} orphaned",
                self.blobstore,
                report.missing_content.len(),
                report.orphaned_content.len()
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blobstore::LocalGitRepository;
    use crate::error::ErrorKind;
    use crate::indexing::{IndexError, SqliteIndex};
    use tempfile::TempDir;

    fn dock_png() -> Iconfile {
        Iconfile::new(IconfileDescriptor::new("png", "36dp"), b"dock png".to_vec())
    }

    async fn combo() -> (TempDir, LocalGitRepository, RepoCombo) {
        let dir = TempDir::new().unwrap();
        let blobstore = LocalGitRepository::new(dir.path().join("icons"));
        blobstore.create().await.unwrap();
        let index = SqliteIndex::open_in_memory().unwrap();
        let combo = RepoCombo::new(Arc::new(index), Arc::new(blobstore.clone()));
        (dir, blobstore, combo)
    }

    #[tokio::test]
    async fn test_invalid_names_are_rejected_up_front() {
        let (_dir, _, combo) = combo().await;

        for name in ["", "..", "a/b", "a\\b"] {
            let err = combo.create_icon(name, &dock_png(), "ux").await.unwrap_err();
            assert_eq!(err.kind(), ErrorKind::InvalidInput, "accepted {:?}", name);
        }

        let bad_size = Iconfile::new(IconfileDescriptor::new("png", "../36dp"), vec![1]);
        let err = combo.create_icon("dock", &bad_size, "ux").await.unwrap_err();
        assert!(matches!(err, RepoError::InvalidInput { field: "size", .. }));

        let err = combo.add_tag("dock", "  ", "ux").await.unwrap_err();
        assert!(matches!(err, RepoError::InvalidInput { field: "tag", .. }));
        assert!(combo.describe_all_icons().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_create_and_read_back() {
        let (_dir, _, combo) = combo().await;
        combo.create_icon("dock", &dock_png(), "ux").await.unwrap();

        let icon = combo.describe_icon("dock").await.unwrap();
        assert_eq!(icon.iconfiles, vec![dock_png().descriptor]);
        let content = combo
            .get_iconfile("dock", &dock_png().descriptor)
            .await
            .unwrap();
        assert_eq!(content, b"dock png");
    }

    #[tokio::test]
    async fn test_blobstore_failure_leaves_no_trace() {
        let (_dir, blobstore, combo) = combo().await;
        let state = blobstore.get_state_id().await.unwrap();

        blobstore.set_commit_failure(true);
        let err = combo.create_icon("dock", &dock_png(), "ux").await.unwrap_err();
        assert!(matches!(
            err,
            RepoError::Index(IndexError::SideEffect {
                compensated: true,
                ..
            })
        ));

        assert!(combo.describe_all_icons().await.unwrap().is_empty());
        assert_eq!(blobstore.get_state_id().await.unwrap(), state);
        assert!(blobstore.check_status().await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_icon_removes_content() {
        let (_dir, blobstore, combo) = combo().await;
        combo.create_icon("dock", &dock_png(), "ux").await.unwrap();
        combo
            .add_iconfile(
                "dock",
                &Iconfile::new(IconfileDescriptor::new("svg", "18px"), b"<svg/>".to_vec()),
                "ux",
            )
            .await
            .unwrap();

        combo.delete_icon("dock", "ux").await.unwrap();
        assert!(blobstore.list_iconfiles().await.unwrap().is_empty());
        assert_eq!(
            combo.describe_icon("dock").await.unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[tokio::test]
    async fn test_delete_missing_icon_is_not_found() {
        let (_dir, _, combo) = combo().await;
        let err = combo.delete_icon("dock", "ux").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_consistency_report() {
        let (_dir, blobstore, combo) = combo().await;
        combo.create_icon("dock", &dock_png(), "ux").await.unwrap();
        assert!(combo.check_consistency().await.unwrap().is_consistent());

        // Content written behind the index's back
        blobstore
            .add_iconfile(
                "anchor",
                &Iconfile::new(IconfileDescriptor::new("png", "36dp"), vec![1]),
                "ux",
            )
            .await
            .unwrap();
        // Index entry without content
        combo
            .index()
            .add_iconfile_to_icon("dock", &IconfileDescriptor::new("svg", "18px"), "ux", None)
            .await
            .unwrap();

        let report = combo.check_consistency().await.unwrap();
        assert_eq!(report.missing_content, vec!["svg/18px/dock@18px.svg"]);
        assert_eq!(report.orphaned_content, vec!["png/36dp/anchor@36dp.png"]);
    }
}
