//! Index repository on a document store
//!
//! Every mutation takes the icon lease first, then the leases of the tags
//! it touches in sorted order, and gives them back in reverse order however
//! the operation ends. Items are read under the lease, changed in memory
//! and written back. Each write is recorded in an undo log holding the
//! previous item (or its absence) so a failed operation can be reverted.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{error, info, warn};

use super::items::{
    from_item, new_change_id, to_item, IconItem, IconfileItem, TagItem, ICONS_LOCK_TABLE,
    ICONS_TABLE, ICON_NAME_ATTRIBUTE, ICON_TAGS_LOCK_TABLE, ICON_TAGS_TABLE, TAG_ATTRIBUTE,
};
use super::{DocumentStore, Item};
use crate::indexing::{
    run_side_effect, IndexError, IndexRepository, ResultExt, SetupRetry, SideEffect,
};
use crate::lock::{Lease, LeaseLockManager, LockManagerConfig};
use crate::models::{IconDescriptor, IconfileDescriptor, TagUsage};

struct UndoEntry {
    table: &'static str,
    key_attribute: &'static str,
    key: String,
    previous: Option<Item>,
}

/// Writes of one operation, in order
struct UndoLog<'a> {
    store: &'a dyn DocumentStore,
    entries: Vec<UndoEntry>,
}

impl<'a> UndoLog<'a> {
    fn new(store: &'a dyn DocumentStore) -> Self {
        Self {
            store,
            entries: Vec::new(),
        }
    }

    async fn put(
        &mut self,
        table: &'static str,
        key_attribute: &'static str,
        key: &str,
        previous: Option<Item>,
        item: Item,
    ) -> Result<(), IndexError> {
        self.entries.push(UndoEntry {
            table,
            key_attribute,
            key: key.to_string(),
            previous,
        });
        self.store
            .put_item(table, item, None)
            .await
            .context(format!("Failed to write {} to {}", key, table))
    }

    async fn delete(
        &mut self,
        table: &'static str,
        key_attribute: &'static str,
        key: &str,
        previous: Item,
    ) -> Result<(), IndexError> {
        self.entries.push(UndoEntry {
            table,
            key_attribute,
            key: key.to_string(),
            previous: Some(previous),
        });
        self.store
            .delete_item(table, key_attribute, key, None)
            .await
            .context(format!("Failed to delete {} from {}", key, table))
    }

    /// Put every touched item back the way it was, newest first
    ///
    /// Each restore is attempted even if an earlier one failed. Returns
    /// whether all of them succeeded.
    async fn rollback(self, operation: &str) -> bool {
        let mut restored = true;
        for entry in self.entries.into_iter().rev() {
            let result = match entry.previous {
                Some(item) => self.store.put_item(entry.table, item, None).await,
                None => {
                    self.store
                        .delete_item(entry.table, entry.key_attribute, &entry.key, None)
                        .await
                }
            };
            if let Err(e) = result {
                error!(
                    "Failed to restore {} in {} after failed {}: {}",
                    entry.key, entry.table, operation, e
                );
                restored = false;
            }
        }
        restored
    }
}

/// Leases held by one operation, released last-acquired first
#[derive(Default)]
struct Leases(Vec<Lease>);

impl Leases {
    async fn release(mut self) {
        while let Some(lease) = self.0.pop() {
            lease.release().await;
        }
    }
}

/// Undo the change if it failed, otherwise run the side effect and undo on its failure
async fn finish<T>(
    operation: &str,
    undo: UndoLog<'_>,
    changed: Result<T, IndexError>,
    side_effect: Option<SideEffect<'_>>,
) -> Result<T, IndexError> {
    let value = match changed {
        Ok(value) => value,
        Err(e) => {
            undo.rollback(operation).await;
            return Err(e);
        }
    };

    if let Err(source) = run_side_effect(side_effect).await {
        let compensated = undo.rollback(operation).await;
        if !compensated {
            error!(
                "Index and blobstore may now disagree after failed {}",
                operation
            );
        }
        return Err(IndexError::SideEffect {
            operation: operation.to_string(),
            compensated,
            source,
        });
    }
    Ok(value)
}

/// Document-store index repository
pub struct DocumentIndex {
    store: Arc<dyn DocumentStore>,
    icon_locks: LeaseLockManager,
    tag_locks: LeaseLockManager,
}

impl DocumentIndex {
    /// Connect to the store, creating missing tables
    pub async fn open(
        store: Arc<dyn DocumentStore>,
        locking: LockManagerConfig,
    ) -> Result<Self, IndexError> {
        Self::open_with_retry(store, locking, SetupRetry::default()).await
    }

    pub async fn open_with_retry(
        store: Arc<dyn DocumentStore>,
        locking: LockManagerConfig,
        retry: SetupRetry,
    ) -> Result<Self, IndexError> {
        let index = Self {
            icon_locks: LeaseLockManager::new(store.clone(), ICONS_LOCK_TABLE, locking),
            tag_locks: LeaseLockManager::new(store.clone(), ICON_TAGS_LOCK_TABLE, locking),
            store,
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            match index.ensure_tables().await {
                Ok(()) => break,
                Err(e) if e.is_transient() && attempt < retry.attempts => {
                    warn!(
                        "Document store not ready (attempt {}/{}): {}",
                        attempt, retry.attempts, e
                    );
                    tokio::time::sleep(retry.delay).await;
                }
                Err(e) if e.is_transient() => {
                    return Err(IndexError::Unavailable {
                        attempts: attempt,
                        source: Box::new(e),
                    })
                }
                Err(e) => return Err(e),
            }
        }

        info!("Opened document-store index");
        Ok(index)
    }

    async fn ensure_tables(&self) -> Result<(), IndexError> {
        for (table, key_attribute) in [
            (ICONS_TABLE, ICON_NAME_ATTRIBUTE),
            (ICON_TAGS_TABLE, TAG_ATTRIBUTE),
        ] {
            self.store
                .ensure_table(table, key_attribute)
                .await
                .context(format!("Failed to prepare table {}", table))?;
        }
        for locks in [&self.icon_locks, &self.tag_locks] {
            locks
                .ensure_table()
                .await
                .context(format!("Failed to prepare table {}", locks.table()))?;
        }
        Ok(())
    }

    /// Read an item, keeping the stored form for the undo log
    async fn fetch<T: DeserializeOwned>(
        &self,
        table: &str,
        key_attribute: &str,
        key: &str,
    ) -> Result<Option<(T, Item)>, IndexError> {
        let Some(raw) = self
            .store
            .get_item(table, key_attribute, key)
            .await
            .context(format!("Failed to read {} from {}", key, table))?
        else {
            return Ok(None);
        };
        let value = from_item(raw.clone())?;
        Ok(Some((value, raw)))
    }

    async fn require_icon(&self, icon_name: &str) -> Result<(IconItem, Item), IndexError> {
        self.fetch(ICONS_TABLE, ICON_NAME_ATTRIBUTE, icon_name)
            .await?
            .ok_or_else(|| IndexError::IconNotFound(icon_name.to_string()))
    }

    async fn lock_icon(
        &self,
        leases: &mut Leases,
        icon_name: &str,
        operation: &str,
    ) -> Result<(), IndexError> {
        leases.0.push(self.icon_locks.acquire(icon_name, operation).await?);
        Ok(())
    }

    /// Always after the icon lease; the set iterates in sorted order
    async fn lock_tags(
        &self,
        leases: &mut Leases,
        tags: &BTreeSet<String>,
        operation: &str,
    ) -> Result<(), IndexError> {
        for tag in tags {
            leases.0.push(self.tag_locks.acquire(tag, operation).await?);
        }
        Ok(())
    }

    async fn put_icon(
        &self,
        undo: &mut UndoLog<'_>,
        previous: Option<Item>,
        icon: &IconItem,
    ) -> Result<(), IndexError> {
        undo.put(
            ICONS_TABLE,
            ICON_NAME_ATTRIBUTE,
            &icon.icon_name,
            previous,
            to_item(icon)?,
        )
        .await
    }

    async fn increment_tag(&self, undo: &mut UndoLog<'_>, tag: &str) -> Result<(), IndexError> {
        let (updated, previous) = match self.fetch::<TagItem>(ICON_TAGS_TABLE, TAG_ATTRIBUTE, tag).await? {
            Some((mut item, raw)) => {
                item.reference_count += 1;
                item.change_id = new_change_id();
                (item, Some(raw))
            }
            None => (
                TagItem {
                    tag: tag.to_string(),
                    reference_count: 1,
                    change_id: new_change_id(),
                },
                None,
            ),
        };
        undo.put(ICON_TAGS_TABLE, TAG_ATTRIBUTE, tag, previous, to_item(&updated)?)
            .await
    }

    async fn decrement_tag(&self, undo: &mut UndoLog<'_>, tag: &str) -> Result<(), IndexError> {
        match self.fetch::<TagItem>(ICON_TAGS_TABLE, TAG_ATTRIBUTE, tag).await? {
            None => {
                warn!("Tag {} has no reference count to decrement", tag);
                Ok(())
            }
            Some((mut item, raw)) if item.reference_count > 1 => {
                item.reference_count -= 1;
                item.change_id = new_change_id();
                undo.put(ICON_TAGS_TABLE, TAG_ATTRIBUTE, tag, Some(raw), to_item(&item)?)
                    .await
            }
            Some((_, raw)) => undo.delete(ICON_TAGS_TABLE, TAG_ATTRIBUTE, tag, raw).await,
        }
    }

    /// Delete the icon item and release its tags; the icon lease must be held
    async fn remove_icon(
        &self,
        undo: &mut UndoLog<'_>,
        leases: &mut Leases,
        icon: &IconItem,
        raw: Item,
        operation: &str,
    ) -> Result<(), IndexError> {
        self.lock_tags(leases, &icon.tags, operation).await?;
        undo.delete(ICONS_TABLE, ICON_NAME_ATTRIBUTE, &icon.icon_name, raw)
            .await?;
        for tag in &icon.tags {
            self.decrement_tag(undo, tag).await?;
        }
        Ok(())
    }

    async fn insert_icon(
        &self,
        undo: &mut UndoLog<'_>,
        icon_name: &str,
        iconfile: &IconfileDescriptor,
        modified_by: &str,
    ) -> Result<(), IndexError> {
        if self
            .fetch::<IconItem>(ICONS_TABLE, ICON_NAME_ATTRIBUTE, icon_name)
            .await?
            .is_some()
        {
            return Err(IndexError::IconAlreadyExists(icon_name.to_string()));
        }
        let mut icon = IconItem::new(icon_name, modified_by);
        icon.iconfiles.push(IconfileItem::from(iconfile));
        self.put_icon(undo, None, &icon).await
    }

    async fn insert_iconfile(
        &self,
        undo: &mut UndoLog<'_>,
        icon_name: &str,
        iconfile: &IconfileDescriptor,
        modified_by: &str,
    ) -> Result<(), IndexError> {
        let (mut icon, raw) = self.require_icon(icon_name).await?;
        if icon.has_iconfile(iconfile) {
            return Err(IndexError::IconfileAlreadyExists {
                icon: icon_name.to_string(),
                iconfile: iconfile.clone(),
            });
        }
        icon.iconfiles.push(IconfileItem::from(iconfile));
        icon.touch(modified_by);
        self.put_icon(undo, Some(raw), &icon).await
    }

    async fn attach_tag(
        &self,
        undo: &mut UndoLog<'_>,
        icon_name: &str,
        tag: &str,
        modified_by: &str,
    ) -> Result<(), IndexError> {
        let (mut icon, raw) = self.require_icon(icon_name).await?;
        if !icon.tags.insert(tag.to_string()) {
            return Ok(());
        }
        icon.touch(modified_by);
        self.put_icon(undo, Some(raw), &icon).await?;
        self.increment_tag(undo, tag).await
    }

    async fn detach_tag(
        &self,
        undo: &mut UndoLog<'_>,
        icon_name: &str,
        tag: &str,
        modified_by: &str,
    ) -> Result<(), IndexError> {
        let (mut icon, raw) = self.require_icon(icon_name).await?;
        if !icon.tags.remove(tag) {
            return Ok(());
        }
        icon.touch(modified_by);
        self.put_icon(undo, Some(raw), &icon).await?;
        self.decrement_tag(undo, tag).await
    }

    /// Returns whether the icon went away with its last iconfile
    async fn remove_iconfile(
        &self,
        undo: &mut UndoLog<'_>,
        leases: &mut Leases,
        icon_name: &str,
        iconfile: &IconfileDescriptor,
        modified_by: &str,
        operation: &str,
    ) -> Result<bool, IndexError> {
        let (mut icon, raw) = self.require_icon(icon_name).await?;
        if !icon.has_iconfile(iconfile) {
            return Err(IndexError::IconfileNotFound {
                icon: icon_name.to_string(),
                iconfile: iconfile.clone(),
            });
        }

        icon.iconfiles
            .retain(|f| f.format != iconfile.format || f.size != iconfile.size);
        if icon.iconfiles.is_empty() {
            self.remove_icon(undo, leases, &icon, raw, operation).await?;
            return Ok(true);
        }

        icon.touch(modified_by);
        self.put_icon(undo, Some(raw), &icon).await?;
        Ok(false)
    }
}

#[async_trait]
impl IndexRepository for DocumentIndex {
    async fn describe_all_icons(&self) -> Result<Vec<IconDescriptor>, IndexError> {
        let items = self
            .store
            .scan(ICONS_TABLE)
            .await
            .context("Failed to list icons")?;
        let mut icons = items
            .into_iter()
            .map(|item| from_item::<IconItem>(item).map(|icon| icon.to_descriptor()))
            .collect::<Result<Vec<_>, _>>()?;
        icons.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(icons)
    }

    async fn describe_icon(&self, icon_name: &str) -> Result<IconDescriptor, IndexError> {
        let (icon, _) = self.require_icon(icon_name).await?;
        Ok(icon.to_descriptor())
    }

    async fn get_existing_tags(&self) -> Result<Vec<String>, IndexError> {
        Ok(self
            .get_tags_with_counts()
            .await?
            .into_iter()
            .map(|usage| usage.tag)
            .collect())
    }

    async fn get_tags_with_counts(&self) -> Result<Vec<TagUsage>, IndexError> {
        let items = self
            .store
            .scan(ICON_TAGS_TABLE)
            .await
            .context("Failed to list tags")?;
        let mut usage = Vec::with_capacity(items.len());
        for item in items {
            let tag: TagItem = from_item(item)?;
            if tag.reference_count > 0 {
                usage.push(TagUsage::new(tag.tag, tag.reference_count));
            }
        }
        usage.sort_by(|a, b| a.tag.cmp(&b.tag));
        Ok(usage)
    }

    async fn create_icon(
        &self,
        icon_name: &str,
        iconfile: &IconfileDescriptor,
        modified_by: &str,
        side_effect: Option<SideEffect<'_>>,
    ) -> Result<(), IndexError> {
        let operation = "create icon";
        let mut leases = Leases::default();
        let result: Result<(), IndexError> = async {
            self.lock_icon(&mut leases, icon_name, operation).await?;
            let mut undo = UndoLog::new(self.store.as_ref());
            let changed = self
                .insert_icon(&mut undo, icon_name, iconfile, modified_by)
                .await;
            finish(operation, undo, changed, side_effect).await
        }
        .await;
        leases.release().await;
        result?;

        info!("Icon {} created with {}", icon_name, iconfile);
        Ok(())
    }

    async fn add_iconfile_to_icon(
        &self,
        icon_name: &str,
        iconfile: &IconfileDescriptor,
        modified_by: &str,
        side_effect: Option<SideEffect<'_>>,
    ) -> Result<(), IndexError> {
        let operation = "add iconfile";
        let mut leases = Leases::default();
        let result: Result<(), IndexError> = async {
            self.lock_icon(&mut leases, icon_name, operation).await?;
            let mut undo = UndoLog::new(self.store.as_ref());
            let changed = self
                .insert_iconfile(&mut undo, icon_name, iconfile, modified_by)
                .await;
            finish(operation, undo, changed, side_effect).await
        }
        .await;
        leases.release().await;
        result?;

        info!("Iconfile {} added to {}", iconfile, icon_name);
        Ok(())
    }

    async fn add_tag(
        &self,
        icon_name: &str,
        tag: &str,
        modified_by: &str,
    ) -> Result<(), IndexError> {
        let operation = "add tag";
        let mut leases = Leases::default();
        let result: Result<(), IndexError> = async {
            self.lock_icon(&mut leases, icon_name, operation).await?;
            self.lock_tags(&mut leases, &BTreeSet::from([tag.to_string()]), operation)
                .await?;
            let mut undo = UndoLog::new(self.store.as_ref());
            let changed = self.attach_tag(&mut undo, icon_name, tag, modified_by).await;
            finish(operation, undo, changed, None).await
        }
        .await;
        leases.release().await;
        result
    }

    async fn remove_tag(
        &self,
        icon_name: &str,
        tag: &str,
        modified_by: &str,
    ) -> Result<(), IndexError> {
        let operation = "remove tag";
        let mut leases = Leases::default();
        let result: Result<(), IndexError> = async {
            self.lock_icon(&mut leases, icon_name, operation).await?;
            self.lock_tags(&mut leases, &BTreeSet::from([tag.to_string()]), operation)
                .await?;
            let mut undo = UndoLog::new(self.store.as_ref());
            let changed = self.detach_tag(&mut undo, icon_name, tag, modified_by).await;
            finish(operation, undo, changed, None).await
        }
        .await;
        leases.release().await;
        result
    }

    async fn delete_icon(
        &self,
        icon_name: &str,
        modified_by: &str,
        side_effect: Option<SideEffect<'_>>,
    ) -> Result<(), IndexError> {
        let operation = "delete icon";
        let mut leases = Leases::default();
        let result: Result<(), IndexError> = async {
            self.lock_icon(&mut leases, icon_name, operation).await?;
            let (icon, raw) = self.require_icon(icon_name).await?;
            let mut undo = UndoLog::new(self.store.as_ref());
            let changed = self
                .remove_icon(&mut undo, &mut leases, &icon, raw, operation)
                .await;
            finish(operation, undo, changed, side_effect).await
        }
        .await;
        leases.release().await;
        result?;

        info!("Icon {} deleted by {}", icon_name, modified_by);
        Ok(())
    }

    async fn delete_iconfile(
        &self,
        icon_name: &str,
        iconfile: &IconfileDescriptor,
        modified_by: &str,
        side_effect: Option<SideEffect<'_>>,
    ) -> Result<(), IndexError> {
        let operation = "delete iconfile";
        let mut leases = Leases::default();
        let result: Result<bool, IndexError> = async {
            self.lock_icon(&mut leases, icon_name, operation).await?;
            let mut undo = UndoLog::new(self.store.as_ref());
            let changed = self
                .remove_iconfile(
                    &mut undo,
                    &mut leases,
                    icon_name,
                    iconfile,
                    modified_by,
                    operation,
                )
                .await;
            finish(operation, undo, changed, side_effect).await
        }
        .await;
        leases.release().await;

        if result? {
            info!("Last iconfile {} removed, icon {} deleted", iconfile, icon_name);
        } else {
            info!("Iconfile {} deleted from {}", iconfile, icon_name);
        }
        Ok(())
    }
}
