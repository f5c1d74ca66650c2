//! Iconfile path convention
//!
//! Content for `(name, format, size)` lives at
//! `<format>/<size>/<name>@<size>.<format>`, relative to the repository root.

use super::BlobstoreError;
use crate::models::IconfileDescriptor;

/// Reject values that would escape or restructure the path layout
pub fn validate_path_component(value: &str) -> Result<(), BlobstoreError> {
    let invalid = value.is_empty()
        || value == "."
        || value.contains("..")
        || value.contains('/')
        || value.contains('\\')
        || value.contains('\0');

    if invalid {
        return Err(BlobstoreError::InvalidPathComponent(value.to_string()));
    }
    Ok(())
}

/// Repository-relative path of an iconfile, always `/`-separated
pub fn iconfile_path(
    icon_name: &str,
    descriptor: &IconfileDescriptor,
) -> Result<String, BlobstoreError> {
    validate_path_component(icon_name)?;
    validate_path_component(&descriptor.format)?;
    validate_path_component(&descriptor.size)?;

    Ok(format!(
        "{format}/{size}/{name}@{size}.{format}",
        format = descriptor.format,
        size = descriptor.size,
        name = icon_name,
    ))
}
