//! Document-store index
//!
//! Icons and tags live as one item each in a key/value document store.
//! The store offers no multi-item transactions, so mutations are serialized
//! with per-key leases and undone item by item when a later step fails.
//!
//! - `memory`: in-process store for tests and local development
//! - `dynamodb`: Amazon DynamoDB (feature `dynamodb`)

#[cfg(feature = "dynamodb")]
mod dynamodb;
mod items;
mod memory;
mod repository;

#[cfg(feature = "dynamodb")]
pub use dynamodb::{DynamoDbConfig, DynamoDbStore};
pub use items::{
    IconItem, IconfileItem, TagItem, ICONS_LOCK_TABLE, ICONS_TABLE, ICON_NAME_ATTRIBUTE,
    ICON_TAGS_LOCK_TABLE, ICON_TAGS_TABLE, LOCK_KEY_ATTRIBUTE, TAG_ATTRIBUTE,
};
pub use memory::MemoryDocumentStore;
pub use repository::DocumentIndex;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

/// One stored document: attribute name to value
pub type Item = serde_json::Map<String, Value>;

/// Normalized store failures
#[derive(Error, Debug)]
pub enum DocumentStoreError {
    #[error("Table not found: {0}")]
    TableNotFound(String),

    /// A conditional write found the item in a different state
    #[error("Condition check failed")]
    ConditionCheckFailed,

    #[error("Document store request failed: {0}")]
    Transport(String),

    #[error("Invalid item: {0}")]
    InvalidItem(String),
}

/// Precondition of a conditional write
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// The item has no such attribute (i.e. does not exist)
    AttributeNotExists(String),
    /// The attribute holds exactly this value
    AttributeEquals(String, Value),
    /// The attribute is absent or holds a number below the bound
    AttributeNotExistsOrLessThan(String, i64),
}

impl Condition {
    /// Evaluate against the current item (`None` when absent)
    pub fn holds_for(&self, current: Option<&Item>) -> bool {
        let attribute = |name: &str| current.and_then(|item| item.get(name));
        match self {
            Condition::AttributeNotExists(name) => attribute(name).is_none(),
            Condition::AttributeEquals(name, expected) => attribute(name) == Some(expected),
            Condition::AttributeNotExistsOrLessThan(name, bound) => match attribute(name) {
                None => true,
                Some(value) => value.as_i64().is_some_and(|v| v < *bound),
            },
        }
    }
}

/// Minimal key/value document store
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Create the table unless it exists; items are keyed by `key_attribute`
    async fn ensure_table(&self, table: &str, key_attribute: &str)
        -> Result<(), DocumentStoreError>;

    async fn get_item(
        &self,
        table: &str,
        key_attribute: &str,
        key: &str,
    ) -> Result<Option<Item>, DocumentStoreError>;

    /// Insert or replace an item, optionally only when `condition` holds
    async fn put_item(
        &self,
        table: &str,
        item: Item,
        condition: Option<Condition>,
    ) -> Result<(), DocumentStoreError>;

    /// Delete an item; deleting an absent item is not an error
    async fn delete_item(
        &self,
        table: &str,
        key_attribute: &str,
        key: &str,
        condition: Option<Condition>,
    ) -> Result<(), DocumentStoreError>;

    /// Every item of the table
    async fn scan(&self, table: &str) -> Result<Vec<Item>, DocumentStoreError>;
}
