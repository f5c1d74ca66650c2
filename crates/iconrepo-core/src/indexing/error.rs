//! Index error handling

use crate::blobstore::BlobstoreError;
use crate::error::ErrorKind;
use crate::lock::LockError;
use crate::models::IconfileDescriptor;
use super::document::DocumentStoreError;
use thiserror::Error;

/// Errors that can occur in an index repository
#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Icon not found: {0}")]
    IconNotFound(String),

    #[error("Iconfile not found: {icon} ({iconfile})")]
    IconfileNotFound {
        icon: String,
        iconfile: IconfileDescriptor,
    },

    #[error("Icon already exists: {0}")]
    IconAlreadyExists(String),

    #[error("Iconfile already exists: {icon} ({iconfile})")]
    IconfileAlreadyExists {
        icon: String,
        iconfile: IconfileDescriptor,
    },

    /// More than one record where at most one may exist
    #[error("Too many records found for {0}")]
    TooManyFound(String),

    /// SQL failure, with the operation that caused it
    #[error("{context}: {source}")]
    Database {
        context: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Schema upgrade to '{version}' failed: {source}")]
    SchemaUpgrade {
        version: String,
        #[source]
        source: rusqlite::Error,
    },

    /// The database stayed unreachable for every setup attempt
    #[error("Database still unavailable after {attempts} attempts: {source}")]
    Unavailable {
        attempts: u32,
        #[source]
        source: Box<IndexError>,
    },

    #[error("{context}: {source}")]
    Document {
        context: String,
        #[source]
        source: DocumentStoreError,
    },

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("Failed to encode item: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The paired blobstore write failed after the index change was applied
    #[error("Blobstore update for {operation} failed ({}): {source}", compensation_label(.compensated))]
    SideEffect {
        operation: String,
        /// Whether the index change was successfully undone
        compensated: bool,
        #[source]
        source: BlobstoreError,
    },
}

fn compensation_label(compensated: &bool) -> &'static str {
    if *compensated {
        "index change reverted"
    } else {
        "index change could NOT be reverted"
    }
}

impl IndexError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            IndexError::IconNotFound(_) | IndexError::IconfileNotFound { .. } => {
                ErrorKind::NotFound
            }
            IndexError::IconAlreadyExists(_) | IndexError::IconfileAlreadyExists { .. } => {
                ErrorKind::AlreadyExists
            }
            IndexError::TooManyFound(_) => ErrorKind::TooManyFound,
            IndexError::SideEffect { source, .. } => source.kind(),
            _ => ErrorKind::Internal,
        }
    }

    /// Check if the database was unreachable rather than failing a query
    pub fn is_transient(&self) -> bool {
        match self {
            IndexError::Unavailable { .. } => true,
            IndexError::Database { source, .. } | IndexError::SchemaUpgrade { source, .. } => {
                is_transient_sqlite_error(source)
            }
            IndexError::Document {
                source: DocumentStoreError::Transport(_),
                ..
            } => true,
            _ => false,
        }
    }
}

/// Busy, locked and cannot-open errors usually clear up on their own
pub(crate) fn is_transient_sqlite_error(error: &rusqlite::Error) -> bool {
    use rusqlite::ErrorCode;

    matches!(
        error,
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(
                e.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::CannotOpen
            )
    )
}

/// Whether a SQL error is a UNIQUE / PRIMARY KEY violation
pub(crate) fn is_unique_violation(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
    )
}

/// Attach operation context to lower-level errors
pub(crate) trait ResultExt<T> {
    fn context<C: Into<String>>(self, context: C) -> Result<T, IndexError>;
}

impl<T> ResultExt<T> for Result<T, rusqlite::Error> {
    fn context<C: Into<String>>(self, context: C) -> Result<T, IndexError> {
        self.map_err(|source| IndexError::Database {
            context: context.into(),
            source,
        })
    }
}

impl<T> ResultExt<T> for Result<T, DocumentStoreError> {
    fn context<C: Into<String>>(self, context: C) -> Result<T, IndexError> {
        self.map_err(|source| IndexError::Document {
            context: context.into(),
            source,
        })
    }
}
