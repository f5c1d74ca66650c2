//! Icon repository core library
//!
//! Icons are described in an *index* and their content (one file per
//! format and size) is kept in a version-controlled *blobstore*. The
//! [`RepoCombo`] coordinator keeps the two consistent without a shared
//! transaction: every index mutation carries the blobstore write as a side
//! effect and is undone when that write fails.
//!
//! # Modules
//!
//! - `combo`: the coordinator and the consistency report
//! - `indexing`: index repositories (SQLite, document store)
//! - `lock`: lease locks used by the document-store index
//! - `blobstore`: blobstore repositories (local git, GitLab)
//! - `vcs`: external command runner
//! - `factory`: builds repositories from configuration
//! - `config`: application configuration

pub mod blobstore;
pub mod combo;
pub mod config;
pub mod error;
pub mod factory;
pub mod indexing;
pub mod lock;
pub mod models;
pub mod vcs;

pub use blobstore::{BlobstoreError, BlobstoreRepository, CommitMetadata};
pub use combo::{ConsistencyReport, RepoCombo};
pub use config::Config;
pub use error::{ErrorKind, RepoError, RepoResult};
pub use factory::{open_blobstore, open_index};
pub use indexing::{IndexError, IndexRepository};
pub use models::{IconDescriptor, Iconfile, IconfileDescriptor, TagUsage};
