//! In-process document store

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;

use super::{Condition, DocumentStore, DocumentStoreError, Item};

struct Table {
    key_attribute: String,
    items: BTreeMap<String, Item>,
}

/// Document store kept in memory; conditional writes are atomic
#[derive(Default)]
pub struct MemoryDocumentStore {
    tables: Mutex<HashMap<String, Table>>,
    unavailable: AtomicBool,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail as if the store could not be reached
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), DocumentStoreError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DocumentStoreError::Transport(
                "memory store is unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

fn table_mut<'a>(
    tables: &'a mut HashMap<String, Table>,
    name: &str,
) -> Result<&'a mut Table, DocumentStoreError> {
    tables
        .get_mut(name)
        .ok_or_else(|| DocumentStoreError::TableNotFound(name.to_string()))
}

fn check(condition: Option<&Condition>, current: Option<&Item>) -> Result<(), DocumentStoreError> {
    match condition {
        Some(condition) if !condition.holds_for(current) => {
            Err(DocumentStoreError::ConditionCheckFailed)
        }
        _ => Ok(()),
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn ensure_table(
        &self,
        table: &str,
        key_attribute: &str,
    ) -> Result<(), DocumentStoreError> {
        self.check_available()?;
        let mut tables = self.tables.lock().await;
        tables.entry(table.to_string()).or_insert_with(|| Table {
            key_attribute: key_attribute.to_string(),
            items: BTreeMap::new(),
        });
        Ok(())
    }

    async fn get_item(
        &self,
        table: &str,
        _key_attribute: &str,
        key: &str,
    ) -> Result<Option<Item>, DocumentStoreError> {
        self.check_available()?;
        let mut tables = self.tables.lock().await;
        Ok(table_mut(&mut tables, table)?.items.get(key).cloned())
    }

    async fn put_item(
        &self,
        table: &str,
        item: Item,
        condition: Option<Condition>,
    ) -> Result<(), DocumentStoreError> {
        self.check_available()?;
        let mut tables = self.tables.lock().await;
        let table = table_mut(&mut tables, table)?;

        let key = item
            .get(&table.key_attribute)
            .and_then(|value| value.as_str())
            .ok_or_else(|| {
                DocumentStoreError::InvalidItem(format!(
                    "missing string key attribute '{}'",
                    table.key_attribute
                ))
            })?
            .to_string();

        check(condition.as_ref(), table.items.get(&key))?;
        table.items.insert(key, item);
        Ok(())
    }

    async fn delete_item(
        &self,
        table: &str,
        _key_attribute: &str,
        key: &str,
        condition: Option<Condition>,
    ) -> Result<(), DocumentStoreError> {
        self.check_available()?;
        let mut tables = self.tables.lock().await;
        let table = table_mut(&mut tables, table)?;

        check(condition.as_ref(), table.items.get(key))?;
        table.items.remove(key);
        Ok(())
    }

    async fn scan(&self, table: &str) -> Result<Vec<Item>, DocumentStoreError> {
        self.check_available()?;
        let mut tables = self.tables.lock().await;
        Ok(table_mut(&mut tables, table)?.items.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn item(value: Value) -> Item {
        value.as_object().cloned().unwrap()
    }

    async fn store() -> MemoryDocumentStore {
        let store = MemoryDocumentStore::new();
        store.ensure_table("icons", "IconName").await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let store = store().await;
        store
            .put_item("icons", item(json!({"IconName": "dock", "ModifiedBy": "ux"})), None)
            .await
            .unwrap();

        let found = store.get_item("icons", "IconName", "dock").await.unwrap();
        assert_eq!(found.unwrap()["ModifiedBy"], json!("ux"));

        store.delete_item("icons", "IconName", "dock", None).await.unwrap();
        assert!(store.get_item("icons", "IconName", "dock").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unknown_table() {
        let store = MemoryDocumentStore::new();
        let result = store.get_item("icons", "IconName", "dock").await;
        assert!(matches!(result, Err(DocumentStoreError::TableNotFound(t)) if t == "icons"));
    }

    #[tokio::test]
    async fn test_ensure_table_keeps_items() {
        let store = store().await;
        store
            .put_item("icons", item(json!({"IconName": "dock"})), None)
            .await
            .unwrap();
        store.ensure_table("icons", "IconName").await.unwrap();
        assert_eq!(store.scan("icons").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_item_without_key_is_rejected() {
        let store = store().await;
        let result = store
            .put_item("icons", item(json!({"ModifiedBy": "ux"})), None)
            .await;
        assert!(matches!(result, Err(DocumentStoreError::InvalidItem(_))));
    }

    #[tokio::test]
    async fn test_conditional_put() {
        let store = store().await;
        let only_new = || Some(Condition::AttributeNotExists("IconName".to_string()));

        store
            .put_item("icons", item(json!({"IconName": "dock"})), only_new())
            .await
            .unwrap();
        let second = store
            .put_item("icons", item(json!({"IconName": "dock"})), only_new())
            .await;
        assert!(matches!(second, Err(DocumentStoreError::ConditionCheckFailed)));
    }

    #[tokio::test]
    async fn test_conditional_delete() {
        let store = store().await;
        store
            .put_item("icons", item(json!({"IconName": "dock", "ChangeId": "a"})), None)
            .await
            .unwrap();

        let stale = Some(Condition::AttributeEquals("ChangeId".to_string(), json!("b")));
        let result = store.delete_item("icons", "IconName", "dock", stale).await;
        assert!(matches!(result, Err(DocumentStoreError::ConditionCheckFailed)));
        assert!(store.get_item("icons", "IconName", "dock").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_unavailable() {
        let store = store().await;
        store.set_unavailable(true);
        assert!(matches!(
            store.scan("icons").await,
            Err(DocumentStoreError::Transport(_))
        ));
        store.set_unavailable(false);
        assert!(store.scan("icons").await.unwrap().is_empty());
    }
}
