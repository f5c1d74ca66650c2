//! Stored item layouts

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use super::Item;
use crate::models::{IconDescriptor, IconfileDescriptor};

pub const ICONS_TABLE: &str = "icons";
pub const ICON_TAGS_TABLE: &str = "icon_tags";
pub const ICONS_LOCK_TABLE: &str = "icons_lock";
pub const ICON_TAGS_LOCK_TABLE: &str = "icon_tags_lock";

pub const ICON_NAME_ATTRIBUTE: &str = "IconName";
pub const TAG_ATTRIBUTE: &str = "Tag";
pub const LOCK_KEY_ATTRIBUTE: &str = "key";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IconfileItem {
    pub format: String,
    pub size: String,
}

/// One icon with its renditions and tags
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct IconItem {
    pub icon_name: String,
    /// Fresh on every write
    pub change_id: String,
    pub modified_by: String,
    #[serde(default)]
    pub iconfiles: Vec<IconfileItem>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

/// Number of icons carrying a tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TagItem {
    pub tag: String,
    pub reference_count: u64,
    pub change_id: String,
}

pub(crate) fn new_change_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub(crate) fn to_item<T: Serialize>(value: &T) -> Result<Item, serde_json::Error> {
    serde_json::from_value(serde_json::to_value(value)?)
}

pub(crate) fn from_item<T: for<'de> Deserialize<'de>>(item: Item) -> Result<T, serde_json::Error> {
    serde_json::from_value(serde_json::Value::Object(item))
}

impl IconItem {
    pub fn new(icon_name: &str, modified_by: &str) -> Self {
        Self {
            icon_name: icon_name.to_string(),
            change_id: new_change_id(),
            modified_by: modified_by.to_string(),
            iconfiles: Vec::new(),
            tags: BTreeSet::new(),
        }
    }

    pub fn has_iconfile(&self, descriptor: &IconfileDescriptor) -> bool {
        self.iconfiles
            .iter()
            .any(|f| f.format == descriptor.format && f.size == descriptor.size)
    }

    /// Mark a new revision by `modified_by`
    pub fn touch(&mut self, modified_by: &str) {
        self.change_id = new_change_id();
        self.modified_by = modified_by.to_string();
    }

    /// Iconfiles come out ordered by format, then size
    pub fn to_descriptor(&self) -> IconDescriptor {
        let mut icon = IconDescriptor::new(&self.icon_name, &self.modified_by);
        icon.tags = self.tags.clone();
        icon.iconfiles = self
            .iconfiles
            .iter()
            .map(|f| IconfileDescriptor::new(&f.format, &f.size))
            .collect();
        icon.iconfiles.sort();
        icon
    }
}

impl From<&IconfileDescriptor> for IconfileItem {
    fn from(descriptor: &IconfileDescriptor) -> Self {
        Self {
            format: descriptor.format.clone(),
            size: descriptor.size.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_icon_item_layout() {
        let mut icon = IconItem::new("dock", "ux");
        icon.iconfiles.push(IconfileItem::from(&IconfileDescriptor::new("png", "36dp")));
        icon.tags.insert("harbor".to_string());

        let item = to_item(&icon).unwrap();
        assert_eq!(item["IconName"], json!("dock"));
        assert_eq!(item["ModifiedBy"], json!("ux"));
        assert_eq!(item["Iconfiles"], json!([{"Format": "png", "Size": "36dp"}]));
        assert_eq!(item["Tags"], json!(["harbor"]));
        assert!(item["ChangeId"].is_string());

        let back: IconItem = from_item(item).unwrap();
        assert_eq!(back, icon);
    }

    #[test]
    fn test_missing_tags_default_to_empty() {
        let item = json!({"IconName": "dock", "ChangeId": "c", "ModifiedBy": "ux",
                          "Iconfiles": [{"Format": "png", "Size": "36dp"}]});
        let icon: IconItem = from_item(item.as_object().cloned().unwrap()).unwrap();
        assert!(icon.tags.is_empty());

        let descriptor = icon.to_descriptor();
        assert_eq!(descriptor.name, "dock");
        assert!(descriptor.has_iconfile(&IconfileDescriptor::new("png", "36dp")));
    }

    #[test]
    fn test_descriptor_orders_iconfiles_by_format_then_size() {
        let mut icon = IconItem::new("dock", "ux");
        for (format, size) in [("svg", "18px"), ("png", "36dp"), ("png", "18dp")] {
            icon.iconfiles.push(IconfileItem::from(&IconfileDescriptor::new(format, size)));
        }

        assert_eq!(
            icon.to_descriptor().iconfiles,
            vec![
                IconfileDescriptor::new("png", "18dp"),
                IconfileDescriptor::new("png", "36dp"),
                IconfileDescriptor::new("svg", "18px"),
            ]
        );
        // Stored order stays insertion order
        assert_eq!(icon.iconfiles[0].format, "svg");
    }

    #[test]
    fn test_touch_changes_revision() {
        let mut icon = IconItem::new("dock", "ux");
        let before = icon.change_id.clone();
        icon.touch("designer");
        assert_ne!(icon.change_id, before);
        assert_eq!(icon.modified_by, "designer");
    }
}
