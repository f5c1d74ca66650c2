//! Index repositories
//!
//! The index is the authoritative record of which icons exist, which
//! renditions they have and how they are tagged. It does not hold content.
//!
//! Mutations that must be mirrored in the blobstore take a *side effect*:
//! a future performing the blobstore write. The index applies its own change,
//! awaits the side effect, and undoes its change if the side effect fails.
//!
//! - `sqlite`: relational variant with embedded schema migrations
//! - `document`: document-store variant serialized by lease locks

pub mod document;
mod error;
pub mod schema;
mod sqlite;

pub use document::DocumentIndex;
pub use error::IndexError;
pub(crate) use error::ResultExt;
pub use sqlite::{SetupRetry, SqliteIndex};

use crate::blobstore::BlobstoreError;
use crate::models::{IconDescriptor, IconfileDescriptor, TagUsage};
use async_trait::async_trait;
use futures_util::future::BoxFuture;

/// Deferred blobstore write run by the index after its own change
pub type SideEffect<'a> = BoxFuture<'a, Result<(), BlobstoreError>>;

/// Metadata store for icons
#[async_trait]
pub trait IndexRepository: Send + Sync {
    async fn describe_all_icons(&self) -> Result<Vec<IconDescriptor>, IndexError>;

    async fn describe_icon(&self, icon_name: &str) -> Result<IconDescriptor, IndexError>;

    /// Every tag currently attached to at least one icon
    async fn get_existing_tags(&self) -> Result<Vec<String>, IndexError>;

    async fn get_tags_with_counts(&self) -> Result<Vec<TagUsage>, IndexError>;

    async fn create_icon(
        &self,
        icon_name: &str,
        iconfile: &IconfileDescriptor,
        modified_by: &str,
        side_effect: Option<SideEffect<'_>>,
    ) -> Result<(), IndexError>;

    async fn add_iconfile_to_icon(
        &self,
        icon_name: &str,
        iconfile: &IconfileDescriptor,
        modified_by: &str,
        side_effect: Option<SideEffect<'_>>,
    ) -> Result<(), IndexError>;

    /// Attach a tag; attaching it twice is a no-op
    async fn add_tag(&self, icon_name: &str, tag: &str, modified_by: &str)
        -> Result<(), IndexError>;

    /// Detach a tag; detaching an absent tag is a no-op
    async fn remove_tag(
        &self,
        icon_name: &str,
        tag: &str,
        modified_by: &str,
    ) -> Result<(), IndexError>;

    async fn delete_icon(
        &self,
        icon_name: &str,
        modified_by: &str,
        side_effect: Option<SideEffect<'_>>,
    ) -> Result<(), IndexError>;

    /// Delete one rendition; removing the last one deletes the icon
    async fn delete_iconfile(
        &self,
        icon_name: &str,
        iconfile: &IconfileDescriptor,
        modified_by: &str,
        side_effect: Option<SideEffect<'_>>,
    ) -> Result<(), IndexError>;
}

/// Await an optional side effect
pub(crate) async fn run_side_effect(
    side_effect: Option<SideEffect<'_>>,
) -> Result<(), BlobstoreError> {
    match side_effect {
        Some(effect) => effect.await,
        None => Ok(()),
    }
}
