// One received update, diffed against the cache it was folded into.
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::subscription::FieldRef;

/// Ephemeral view of a single update event. Values live here only for the
/// duration of the callback; the durable copy is the subscription cache.
#[derive(Debug, Clone)]
pub struct ItemUpdate {
    pub(crate) item_name: Option<String>,
    pub(crate) item_pos: u32,
    pub(crate) snapshot: bool,
    pub(crate) key: Option<String>,
    // Full post-merge values by 1-based field position.
    pub(crate) values: BTreeMap<u32, Option<String>>,
    pub(crate) changed: BTreeSet<u32>,
    pub(crate) json_patches: HashMap<u32, String>,
    // Position -> name mapping; empty under schema addressing.
    pub(crate) field_names: Arc<Vec<String>>,
}

impl ItemUpdate {
    pub fn item_name(&self) -> Option<&str> {
        self.item_name.as_deref()
    }

    /// 1-based position of the item within the subscription.
    pub fn item_pos(&self) -> u32 {
        self.item_pos
    }

    pub fn is_snapshot(&self) -> bool {
        self.snapshot
    }

    /// COMMAND rows carry the key the update is relative to.
    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    fn position<'a>(&self, field: impl Into<FieldRef<'a>>) -> Option<u32> {
        match field.into() {
            FieldRef::Position(position) if position >= 1 => Some(position),
            FieldRef::Position(_) => None,
            FieldRef::Name(name) => self
                .field_names
                .iter()
                .position(|candidate| candidate == name)
                .map(|index| index as u32 + 1),
        }
    }

    pub fn value<'a>(&self, field: impl Into<FieldRef<'a>>) -> Option<&str> {
        let position = self.position(field)?;
        self.values.get(&position)?.as_deref()
    }

    /// Whether the field differs from the previously cached value
    /// (key-relative for COMMAND rows).
    pub fn is_value_changed<'a>(&self, field: impl Into<FieldRef<'a>>) -> bool {
        self.position(field)
            .is_some_and(|position| self.changed.contains(&position))
    }

    /// The JSON-Patch diff the server attached to this field, if any.
    pub fn value_as_json_patch<'a>(&self, field: impl Into<FieldRef<'a>>) -> Option<&str> {
        let position = self.position(field)?;
        self.json_patches.get(&position).map(String::as_str)
    }

    fn name_of(&self, position: u32) -> Option<&str> {
        position
            .checked_sub(1)
            .and_then(|index| self.field_names.get(index as usize))
            .map(String::as_str)
    }

    /// Changed fields as (name, position, value) triples, in field order.
    pub fn changed_fields(&self) -> Vec<(Option<&str>, u32, Option<&str>)> {
        self.changed
            .iter()
            .map(|&position| {
                (
                    self.name_of(position),
                    position,
                    self.values.get(&position).and_then(Option::as_deref),
                )
            })
            .collect()
    }

    /// All fields carried by this update as (name, position, value).
    pub fn fields(&self) -> Vec<(Option<&str>, u32, Option<&str>)> {
        self.values
            .iter()
            .map(|(&position, value)| (self.name_of(position), position, value.as_deref()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ItemUpdate {
        ItemUpdate {
            item_name: Some("item1".to_string()),
            item_pos: 1,
            snapshot: false,
            key: None,
            values: BTreeMap::from([
                (1, Some("100.5".to_string())),
                (2, Some("100.7".to_string())),
                (3, None),
            ]),
            changed: BTreeSet::from([2]),
            json_patches: HashMap::from([(2, "[]".to_string())]),
            field_names: Arc::new(vec![
                "bid".to_string(),
                "ask".to_string(),
                "spread".to_string(),
            ]),
        }
    }

    #[test]
    fn lookup_by_name_and_position_agree() {
        let update = sample();
        assert_eq!(update.value("ask"), update.value(2u32));
        assert_eq!(update.value("bid"), Some("100.5"));
        assert_eq!(update.value(3u32), None);
        assert_eq!(update.value("missing"), None);
    }

    #[test]
    fn changed_flags_follow_the_diff() {
        let update = sample();
        assert!(update.is_value_changed("ask"));
        assert!(!update.is_value_changed("bid"));
        assert_eq!(update.changed_fields(), vec![(Some("ask"), 2, Some("100.7"))]);
    }

    #[test]
    fn json_patch_is_exposed_verbatim() {
        let update = sample();
        assert_eq!(update.value_as_json_patch("ask"), Some("[]"));
        assert_eq!(update.value_as_json_patch("bid"), None);
    }
}
