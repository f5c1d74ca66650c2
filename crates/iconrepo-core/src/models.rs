//! Data models for the icon repository
//!
//! Defines the domain structures shared by the index and the blobstore:
//! icons, iconfile descriptors and iconfiles.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// The `(format, size)` identity of one rendition of an icon
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IconfileDescriptor {
    /// File format, e.g. "svg" or "png"
    pub format: String,
    /// Size label, e.g. "18px" or "36dp"
    pub size: String,
}

impl IconfileDescriptor {
    pub fn new(format: impl Into<String>, size: impl Into<String>) -> Self {
        Self {
            format: format.into(),
            size: size.into(),
        }
    }
}

impl fmt::Display for IconfileDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Format: {}, Size: {}", self.format, self.size)
    }
}

/// An iconfile descriptor together with its binary content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Iconfile {
    pub descriptor: IconfileDescriptor,
    pub content: Vec<u8>,
}

impl Iconfile {
    pub fn new(descriptor: IconfileDescriptor, content: impl Into<Vec<u8>>) -> Self {
        Self {
            descriptor,
            content: content.into(),
        }
    }
}

/// Full description of an icon as known to the index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IconDescriptor {
    /// Unique icon name
    pub name: String,
    /// Identity of the last user who changed the icon
    pub modified_by: String,
    /// Tags attached to the icon
    pub tags: BTreeSet<String>,
    /// Renditions of the icon, sorted by format then size
    pub iconfiles: Vec<IconfileDescriptor>,
}

impl IconDescriptor {
    pub fn new(name: impl Into<String>, modified_by: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            modified_by: modified_by.into(),
            tags: BTreeSet::new(),
            iconfiles: Vec::new(),
        }
    }

    /// Check whether the icon has a rendition with the given descriptor
    pub fn has_iconfile(&self, descriptor: &IconfileDescriptor) -> bool {
        self.iconfiles.iter().any(|d| d == descriptor)
    }

    /// Add a tag (no-op if already present)
    pub fn add_tag(&mut self, tag: impl Into<String>) -> bool {
        self.tags.insert(tag.into())
    }

    /// Remove a tag
    pub fn remove_tag(&mut self, tag: &str) -> bool {
        self.tags.remove(tag)
    }
}

/// A tag and the number of icons currently carrying it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagUsage {
    pub tag: String,
    pub reference_count: u64,
}

impl TagUsage {
    pub fn new(tag: impl Into<String>, reference_count: u64) -> Self {
        Self {
            tag: tag.into(),
            reference_count,
        }
    }
}
