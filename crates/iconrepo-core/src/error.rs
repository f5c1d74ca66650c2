//! Error classification shared by every layer
//!
//! Each layer has its own `thiserror` enum; all of them can be reduced to an
//! [`ErrorKind`], which is what the API boundary turns into a status code.

use crate::blobstore::BlobstoreError;
use crate::indexing::IndexError;
use thiserror::Error;

/// Coarse classification of a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    TooManyFound,
    PermissionDenied,
    InvalidInput,
    Internal,
}

impl ErrorKind {
    /// HTTP-class status code for this kind
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::NotFound => 404,
            ErrorKind::AlreadyExists => 409,
            ErrorKind::PermissionDenied => 403,
            ErrorKind::InvalidInput => 400,
            ErrorKind::TooManyFound | ErrorKind::Internal => 500,
        }
    }
}

/// Errors returned by the repository coordinator
#[derive(Error, Debug)]
pub enum RepoError {
    /// Caller-supplied value rejected before touching any store
    #[error("Invalid {field}: {reason}")]
    InvalidInput { field: &'static str, reason: String },

    /// Produced by an authorization layer and passed through unchanged
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Blobstore(#[from] BlobstoreError),
}

impl RepoError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RepoError::InvalidInput { .. } => ErrorKind::InvalidInput,
            RepoError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            RepoError::Index(e) => e.kind(),
            RepoError::Blobstore(e) => e.kind(),
        }
    }
}

/// Result type for coordinator operations
pub type RepoResult<T> = Result<T, RepoError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::IconfileDescriptor;

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(ErrorKind::NotFound.http_status(), 404);
        assert_eq!(ErrorKind::AlreadyExists.http_status(), 409);
        assert_eq!(ErrorKind::PermissionDenied.http_status(), 403);
        assert_eq!(ErrorKind::InvalidInput.http_status(), 400);
        assert_eq!(ErrorKind::TooManyFound.http_status(), 500);
        assert_eq!(ErrorKind::Internal.http_status(), 500);
    }

    #[test]
    fn test_repo_error_kind_follows_source() {
        let err = RepoError::from(IndexError::IconNotFound("dock".to_string()));
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = RepoError::from(IndexError::IconfileAlreadyExists {
            icon: "dock".to_string(),
            iconfile: IconfileDescriptor::new("png", "36dp"),
        });
        assert_eq!(err.kind(), ErrorKind::AlreadyExists);

        let err = RepoError::PermissionDenied("ADD_TAG".to_string());
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    }

    #[test]
    fn test_side_effect_error_keeps_blobstore_kind() {
        let err = RepoError::from(IndexError::SideEffect {
            operation: "delete iconfile".to_string(),
            compensated: true,
            source: BlobstoreError::IconfileNotFound {
                icon: "dock".to_string(),
                iconfile: IconfileDescriptor::new("png", "36dp"),
            },
        });
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.to_string().contains("delete iconfile"));
    }
}
