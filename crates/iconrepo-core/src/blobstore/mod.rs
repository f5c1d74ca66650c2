//! Blobstore repositories
//!
//! The blobstore holds iconfile content, versioned by a version-control
//! system. Two implementations exist:
//!
//! - `local`: a git working tree on the local filesystem
//! - `gitlab`: a project on a GitLab-compatible service, driven over REST
//!
//! Both lay content out as `<format>/<size>/<name>@<size>.<format>`.

mod gitlab;
mod local;
mod paths;
mod queue;

pub use gitlab::{GitlabConfig, GitlabRepository, RetryPolicy, DEFAULT_API_BASE};
pub use local::LocalGitRepository;
pub use paths::{iconfile_path, validate_path_component};
pub use queue::{JobQueue, QueueClosed};

use crate::error::ErrorKind;
use crate::models::{IconDescriptor, Iconfile, IconfileDescriptor};
use crate::vcs::CommandError;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use thiserror::Error;

/// When set to "true", commits are made to fail so rollback can be exercised
pub const SIMULATE_COMMIT_FAILURE_ENV: &str = "GIT_COMMIT_FAIL_INTRUSIVE_TEST";

pub(crate) fn commit_failure_requested() -> bool {
    std::env::var(SIMULATE_COMMIT_FAILURE_ENV)
        .map(|v| v == "true")
        .unwrap_or(false)
}

/// Errors that can occur in a blobstore
#[derive(Error, Debug)]
pub enum BlobstoreError {
    #[error("Iconfile not found: {icon} ({iconfile})")]
    IconfileNotFound {
        icon: String,
        iconfile: IconfileDescriptor,
    },

    #[error("Invalid path component '{0}'")]
    InvalidPathComponent(String),

    /// A version-control command failed
    #[error("{context}: {source}")]
    Command {
        context: String,
        #[source]
        source: CommandError,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// Transport-level HTTP failure (connect, timeout, body)
    #[error("{context}: {source}")]
    Http {
        context: String,
        #[source]
        source: reqwest::Error,
    },

    /// The provider answered with an unexpected status
    #[error("{context}: unexpected status {status}: {body}")]
    Provider {
        context: String,
        status: u16,
        body: String,
    },

    #[error("{operation} still failing after {attempts} attempts")]
    RetriesExhausted { operation: String, attempts: u32 },

    #[error("Failed to decode {what}: {details}")]
    Decode { what: String, details: String },

    #[error("Invalid blobstore configuration: {0}")]
    Configuration(String),

    #[error("Namespace '{0}' not found")]
    NamespaceNotFound(String),

    #[error("Simulated commit failure")]
    SimulatedFailure,

    #[error("Job queue is closed")]
    QueueClosed,
}

impl BlobstoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BlobstoreError::IconfileNotFound { .. } => ErrorKind::NotFound,
            BlobstoreError::InvalidPathComponent(_) => ErrorKind::InvalidInput,
            _ => ErrorKind::Internal,
        }
    }

    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        BlobstoreError::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn command(context: impl Into<String>, source: CommandError) -> Self {
        BlobstoreError::Command {
            context: context.into(),
            source,
        }
    }
}

impl From<QueueClosed> for BlobstoreError {
    fn from(_: QueueClosed) -> Self {
        BlobstoreError::QueueClosed
    }
}

/// Metadata of one version (commit) in the blobstore
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitMetadata {
    pub commit_id: String,
    pub author_name: String,
    pub author_email: String,
    pub authored_at: DateTime<FixedOffset>,
    pub committer_name: String,
    pub committer_email: String,
    pub committed_at: DateTime<FixedOffset>,
    pub message: String,
}

/// Content store for iconfiles
///
/// Implementations display as a human-readable location for logging.
#[async_trait]
pub trait BlobstoreRepository: fmt::Display + Send + Sync {
    /// Create the underlying repository (idempotent for the local variant)
    async fn create(&self) -> Result<(), BlobstoreError>;

    /// Delete the underlying repository with all its history
    async fn delete(&self) -> Result<(), BlobstoreError>;

    async fn add_iconfile(
        &self,
        icon_name: &str,
        iconfile: &Iconfile,
        modified_by: &str,
    ) -> Result<(), BlobstoreError>;

    async fn get_iconfile(
        &self,
        icon_name: &str,
        descriptor: &IconfileDescriptor,
    ) -> Result<Vec<u8>, BlobstoreError>;

    /// Remove every iconfile of the icon in one version
    async fn delete_icon(
        &self,
        icon: &IconDescriptor,
        modified_by: &str,
    ) -> Result<(), BlobstoreError>;

    async fn delete_iconfile(
        &self,
        icon_name: &str,
        descriptor: &IconfileDescriptor,
        modified_by: &str,
    ) -> Result<(), BlobstoreError>;

    // ==================== Management ====================

    /// `true` when there are no uncommitted changes
    async fn check_status(&self) -> Result<bool, BlobstoreError>;

    /// Identifier of the current version of the whole store
    async fn get_state_id(&self) -> Result<String, BlobstoreError>;

    /// Paths of every stored iconfile
    async fn list_iconfiles(&self) -> Result<Vec<String>, BlobstoreError>;

    /// Version that last touched the iconfile, `None` if it was never stored
    async fn get_version_for(
        &self,
        icon_name: &str,
        descriptor: &IconfileDescriptor,
    ) -> Result<Option<String>, BlobstoreError>;

    async fn get_version_metadata(&self, version: &str) -> Result<CommitMetadata, BlobstoreError>;
}

/// Commit message listing the affected paths
pub(crate) fn commit_message(paths: &[String], action: &str, modified_by: &str) -> String {
    format!("{} {} by {}", paths.join(", "), action, modified_by)
}
