//! Caller-owned subscription handles.
//!
//! A `Subscription` is configuration plus a value cache; all behavior
//! lives in the engine. The registry holds a shared reference while the
//! subscription is active and routes updates into the cache, so the
//! inquiry getters can be called from any thread and observe a snapshot.
use cascade_wire::SubscriptionMode;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::engine::Command;
use crate::error::{ClientError, Result};
use crate::events::{SubscriptionEvent, SubscriptionListener};

/// Item addressing: an ordered list of names, or an opaque group
/// identifier. Mutually exclusive; setting one clears the other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemAddressing {
    List(Vec<String>),
    Group(String),
}

/// Field addressing: an ordered list of names, or an opaque schema
/// identifier. Mutually exclusive; setting one clears the other.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldAddressing {
    List(Vec<String>),
    Schema(String),
}

/// Requested snapshot policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Snapshot {
    Yes,
    No,
    Length(u32),
}

impl Snapshot {
    pub(crate) fn as_token(&self) -> String {
        match self {
            Snapshot::Yes => "yes".to_string(),
            Snapshot::No => "no".to_string(),
            Snapshot::Length(length) => format!("{length}"),
        }
    }
}

/// Requested server-side buffer size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferSize {
    Unlimited,
    Limited(u32),
}

impl BufferSize {
    pub(crate) fn as_token(&self) -> String {
        match self {
            BufferSize::Unlimited => "unlimited".to_string(),
            BufferSize::Limited(size) => format!("{size}"),
        }
    }
}

/// Requested update frequency cap.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MaxFrequency {
    /// Lean on the server default.
    ServerDefault,
    Unlimited,
    /// Disable filtering entirely; immutable while active.
    Unfiltered,
    /// Updates per second.
    Limited(f64),
}

impl MaxFrequency {
    pub(crate) fn as_token(&self) -> Option<String> {
        match self {
            MaxFrequency::ServerDefault => None,
            MaxFrequency::Unlimited => Some("unlimited".to_string()),
            MaxFrequency::Unfiltered => Some("unfiltered".to_string()),
            MaxFrequency::Limited(frequency) => Some(format!("{frequency}")),
        }
    }
}

/// Reference to an item by name or 1-based position.
#[derive(Debug, Clone, Copy)]
pub enum ItemRef<'a> {
    Name(&'a str),
    Position(u32),
}

impl<'a> From<&'a str> for ItemRef<'a> {
    fn from(name: &'a str) -> Self {
        ItemRef::Name(name)
    }
}

impl From<u32> for ItemRef<'_> {
    fn from(position: u32) -> Self {
        ItemRef::Position(position)
    }
}

/// Reference to a field by name or 1-based position.
#[derive(Debug, Clone, Copy)]
pub enum FieldRef<'a> {
    Name(&'a str),
    Position(u32),
}

impl<'a> From<&'a str> for FieldRef<'a> {
    fn from(name: &'a str) -> Self {
        FieldRef::Name(name)
    }
}

impl From<u32> for FieldRef<'_> {
    fn from(position: u32) -> Self {
        FieldRef::Position(position)
    }
}

pub(crate) struct SubscriptionState {
    pub(crate) mode: SubscriptionMode,
    pub(crate) items: Option<ItemAddressing>,
    pub(crate) fields: Option<FieldAddressing>,
    pub(crate) data_adapter: Option<String>,
    pub(crate) selector: Option<String>,
    pub(crate) requested_snapshot: Option<Snapshot>,
    pub(crate) requested_buffer_size: Option<BufferSize>,
    pub(crate) requested_max_frequency: MaxFrequency,
    pub(crate) second_fields: Option<FieldAddressing>,
    pub(crate) second_data_adapter: Option<String>,
    pub(crate) active: bool,
    pub(crate) subscribed: bool,
    pub(crate) id: Option<u32>,
    // Latest value per (item position, field position); COMMAND keeps a
    // per-key nesting instead. Registry-written, caller-read.
    pub(crate) values: HashMap<u32, HashMap<u32, Option<String>>>,
    pub(crate) command_values: HashMap<u32, HashMap<String, HashMap<u32, Option<String>>>>,
}

pub(crate) struct SubscriptionShared {
    pub(crate) state: Mutex<SubscriptionState>,
    pub(crate) listeners: RwLock<Vec<Arc<dyn SubscriptionListener>>>,
    // Set while the owning client holds this subscription active, so
    // live-legal setters can reach the engine.
    pub(crate) engine: Mutex<Option<mpsc::UnboundedSender<Command>>>,
}

/// A single real-time subscription. Cheap to clone; clones are handles to
/// the same subscription.
#[derive(Clone)]
pub struct Subscription {
    pub(crate) inner: Arc<SubscriptionShared>,
}

fn validate_name(name: &str, what: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ClientError::argument(format!("{what} must not be empty")));
    }
    if name.chars().any(char::is_whitespace) {
        return Err(ClientError::argument(format!(
            "{what} must not contain whitespace: {name:?}"
        )));
    }
    Ok(())
}

impl Subscription {
    pub fn new(mode: SubscriptionMode) -> Self {
        Self {
            inner: Arc::new(SubscriptionShared {
                state: Mutex::new(SubscriptionState {
                    mode,
                    items: None,
                    fields: None,
                    data_adapter: None,
                    selector: None,
                    requested_snapshot: None,
                    requested_buffer_size: None,
                    requested_max_frequency: MaxFrequency::ServerDefault,
                    second_fields: None,
                    second_data_adapter: None,
                    active: false,
                    subscribed: false,
                    id: None,
                    values: HashMap::new(),
                    command_values: HashMap::new(),
                }),
                listeners: RwLock::new(Vec::new()),
                engine: Mutex::new(None),
            }),
        }
    }

    /// Convenience constructor with item and field lists.
    pub fn with_items(mode: SubscriptionMode, items: &[&str], fields: &[&str]) -> Result<Self> {
        let subscription = Self::new(mode);
        subscription.set_items(items)?;
        subscription.set_fields(fields)?;
        Ok(subscription)
    }

    fn structural<R>(&self, mutate: impl FnOnce(&mut SubscriptionState) -> Result<R>) -> Result<R> {
        let mut state = self.inner.state.lock();
        if state.active {
            return Err(ClientError::state(
                "structural properties are immutable while the subscription is active",
            ));
        }
        mutate(&mut state)
    }

    pub fn mode(&self) -> SubscriptionMode {
        self.inner.state.lock().mode
    }

    pub fn set_items(&self, items: &[&str]) -> Result<()> {
        for item in items {
            validate_name(item, "item name")?;
        }
        if items.is_empty() {
            return Err(ClientError::argument("item list must not be empty"));
        }
        let items: Vec<String> = items.iter().map(|item| item.to_string()).collect();
        self.structural(|state| {
            state.items = Some(ItemAddressing::List(items));
            Ok(())
        })
    }

    pub fn set_item_group(&self, group: &str) -> Result<()> {
        validate_name(group, "item group")?;
        let group = group.to_string();
        self.structural(|state| {
            state.items = Some(ItemAddressing::Group(group));
            Ok(())
        })
    }

    pub fn set_fields(&self, fields: &[&str]) -> Result<()> {
        for field in fields {
            validate_name(field, "field name")?;
        }
        if fields.is_empty() {
            return Err(ClientError::argument("field list must not be empty"));
        }
        let fields: Vec<String> = fields.iter().map(|field| field.to_string()).collect();
        self.structural(move |state| {
            if state.mode == SubscriptionMode::Command {
                // COMMAND updates are key-relative; both control fields
                // must be present.
                for required in ["key", "command"] {
                    if !fields.iter().any(|field| field == required) {
                        return Err(ClientError::argument(format!(
                            "COMMAND field list must contain {required:?}"
                        )));
                    }
                }
            }
            state.fields = Some(FieldAddressing::List(fields));
            Ok(())
        })
    }

    pub fn set_field_schema(&self, schema: &str) -> Result<()> {
        validate_name(schema, "field schema")?;
        let schema = schema.to_string();
        self.structural(|state| {
            state.fields = Some(FieldAddressing::Schema(schema));
            Ok(())
        })
    }

    pub fn set_data_adapter(&self, adapter: Option<&str>) -> Result<()> {
        if let Some(adapter) = adapter {
            validate_name(adapter, "data adapter")?;
        }
        let adapter = adapter.map(str::to_string);
        self.structural(|state| {
            state.data_adapter = adapter;
            Ok(())
        })
    }

    pub fn set_selector(&self, selector: Option<&str>) -> Result<()> {
        if let Some(selector) = selector {
            validate_name(selector, "selector")?;
        }
        let selector = selector.map(str::to_string);
        self.structural(|state| {
            state.selector = selector;
            Ok(())
        })
    }

    pub fn set_requested_snapshot(&self, snapshot: Option<Snapshot>) -> Result<()> {
        self.structural(|state| {
            match (state.mode, snapshot) {
                (SubscriptionMode::Raw, Some(Snapshot::Yes | Snapshot::Length(_))) => {
                    return Err(ClientError::argument("RAW subscriptions have no snapshot"));
                }
                (SubscriptionMode::Merge | SubscriptionMode::Command, Some(Snapshot::Length(_))) => {
                    return Err(ClientError::argument(
                        "snapshot length applies to DISTINCT subscriptions only",
                    ));
                }
                _ => {}
            }
            state.requested_snapshot = snapshot;
            Ok(())
        })
    }

    pub fn set_requested_buffer_size(&self, size: Option<BufferSize>) -> Result<()> {
        self.structural(|state| {
            state.requested_buffer_size = size;
            Ok(())
        })
    }

    /// The one property that may change while active. Live changes to or
    /// from "unfiltered" (or the server default) are rejected.
    pub fn set_requested_max_frequency(&self, frequency: MaxFrequency) -> Result<()> {
        let forward = {
            let mut state = self.inner.state.lock();
            if state.mode == SubscriptionMode::Raw {
                return Err(ClientError::argument(
                    "RAW subscriptions have no frequency cap",
                ));
            }
            if state.active {
                let barred = |value: &MaxFrequency| {
                    matches!(value, MaxFrequency::Unfiltered | MaxFrequency::ServerDefault)
                };
                if barred(&state.requested_max_frequency) || barred(&frequency) {
                    return Err(ClientError::argument(
                        "cannot switch to or from unfiltered dispatch while active",
                    ));
                }
            }
            state.requested_max_frequency = frequency;
            state.active
        };
        if forward
            && let Some(engine) = self.inner.engine.lock().as_ref()
        {
            let _ = engine.send(Command::ChangeFrequency {
                shared: Arc::clone(&self.inner),
                frequency,
            });
        }
        Ok(())
    }

    /// Second-level field list for COMMAND cascading.
    pub fn set_command_second_level_fields(&self, fields: &[&str]) -> Result<()> {
        for field in fields {
            validate_name(field, "field name")?;
        }
        if fields.is_empty() {
            return Err(ClientError::argument("field list must not be empty"));
        }
        let fields: Vec<String> = fields.iter().map(|field| field.to_string()).collect();
        self.structural(|state| {
            if state.mode != SubscriptionMode::Command {
                return Err(ClientError::argument(
                    "second-level fields apply to COMMAND subscriptions only",
                ));
            }
            state.second_fields = Some(FieldAddressing::List(fields));
            Ok(())
        })
    }

    pub fn set_command_second_level_field_schema(&self, schema: &str) -> Result<()> {
        validate_name(schema, "field schema")?;
        let schema = schema.to_string();
        self.structural(|state| {
            if state.mode != SubscriptionMode::Command {
                return Err(ClientError::argument(
                    "second-level schema applies to COMMAND subscriptions only",
                ));
            }
            state.second_fields = Some(FieldAddressing::Schema(schema));
            Ok(())
        })
    }

    pub fn set_command_second_level_data_adapter(&self, adapter: Option<&str>) -> Result<()> {
        if let Some(adapter) = adapter {
            validate_name(adapter, "data adapter")?;
        }
        let adapter = adapter.map(str::to_string);
        self.structural(|state| {
            if state.mode != SubscriptionMode::Command {
                return Err(ClientError::argument(
                    "second-level adapter applies to COMMAND subscriptions only",
                ));
            }
            state.second_data_adapter = adapter;
            Ok(())
        })
    }

    pub fn items(&self) -> Option<Vec<String>> {
        match &self.inner.state.lock().items {
            Some(ItemAddressing::List(items)) => Some(items.clone()),
            _ => None,
        }
    }

    pub fn item_group(&self) -> Option<String> {
        match &self.inner.state.lock().items {
            Some(ItemAddressing::Group(group)) => Some(group.clone()),
            _ => None,
        }
    }

    pub fn fields(&self) -> Option<Vec<String>> {
        match &self.inner.state.lock().fields {
            Some(FieldAddressing::List(fields)) => Some(fields.clone()),
            _ => None,
        }
    }

    pub fn field_schema(&self) -> Option<String> {
        match &self.inner.state.lock().fields {
            Some(FieldAddressing::Schema(schema)) => Some(schema.clone()),
            _ => None,
        }
    }

    pub fn data_adapter(&self) -> Option<String> {
        self.inner.state.lock().data_adapter.clone()
    }

    pub fn selector(&self) -> Option<String> {
        self.inner.state.lock().selector.clone()
    }

    pub fn requested_snapshot(&self) -> Option<Snapshot> {
        self.inner.state.lock().requested_snapshot
    }

    pub fn requested_buffer_size(&self) -> Option<BufferSize> {
        self.inner.state.lock().requested_buffer_size
    }

    pub fn requested_max_frequency(&self) -> MaxFrequency {
        self.inner.state.lock().requested_max_frequency
    }

    pub fn is_active(&self) -> bool {
        self.inner.state.lock().active
    }

    pub fn is_subscribed(&self) -> bool {
        self.inner.state.lock().subscribed
    }

    /// Latest cached value for MERGE subscriptions (or the first-level
    /// fields of a COMMAND row addressed by position only).
    pub fn value<'a, 'b>(
        &self,
        item: impl Into<ItemRef<'a>>,
        field: impl Into<FieldRef<'b>>,
    ) -> Option<String> {
        let state = self.inner.state.lock();
        let item_pos = resolve_item(&state, item.into())?;
        let field_pos = resolve_field(&state, field.into())?;
        state
            .values
            .get(&item_pos)
            .and_then(|fields| fields.get(&field_pos))
            .cloned()
            .flatten()
    }

    /// Latest cached value for a COMMAND row addressed by key.
    pub fn command_value<'a, 'b>(
        &self,
        item: impl Into<ItemRef<'a>>,
        key: &str,
        field: impl Into<FieldRef<'b>>,
    ) -> Option<String> {
        let state = self.inner.state.lock();
        let item_pos = resolve_item(&state, item.into())?;
        let field_pos = resolve_field(&state, field.into())?;
        state
            .command_values
            .get(&item_pos)
            .and_then(|rows| rows.get(key))
            .and_then(|fields| fields.get(&field_pos))
            .cloned()
            .flatten()
    }

    pub fn add_listener(&self, listener: Arc<dyn SubscriptionListener>) {
        self.inner.listeners.write().push(Arc::clone(&listener));
        listener.on_event(&SubscriptionEvent::ListenStart);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn SubscriptionListener>) {
        let mut listeners = self.inner.listeners.write();
        if let Some(index) = listeners
            .iter()
            .position(|existing| Arc::ptr_eq(existing, listener))
        {
            let removed = listeners.swap_remove(index);
            drop(listeners);
            removed.on_event(&SubscriptionEvent::ListenEnd);
        }
    }
}

pub(crate) fn resolve_item(state: &SubscriptionState, item: ItemRef<'_>) -> Option<u32> {
    match item {
        ItemRef::Position(position) if position >= 1 => Some(position),
        ItemRef::Position(_) => None,
        ItemRef::Name(name) => match &state.items {
            Some(ItemAddressing::List(items)) => items
                .iter()
                .position(|candidate| candidate == name)
                .map(|index| index as u32 + 1),
            _ => None,
        },
    }
}

pub(crate) fn resolve_field(state: &SubscriptionState, field: FieldRef<'_>) -> Option<u32> {
    match field {
        FieldRef::Position(position) if position >= 1 => Some(position),
        FieldRef::Position(_) => None,
        FieldRef::Name(name) => match &state.fields {
            Some(FieldAddressing::List(fields)) => fields
                .iter()
                .position(|candidate| candidate == name)
                .map(|index| index as u32 + 1),
            _ => None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn item_list_and_group_are_mutually_exclusive() {
        let subscription = Subscription::new(SubscriptionMode::Merge);
        subscription.set_items(&["item1", "item2"]).expect("items");
        assert_eq!(
            subscription.items(),
            Some(vec!["item1".to_string(), "item2".to_string()])
        );
        assert_eq!(subscription.item_group(), None);

        subscription.set_item_group("portfolio").expect("group");
        assert_eq!(subscription.items(), None);
        assert_eq!(subscription.item_group(), Some("portfolio".to_string()));

        subscription.set_items(&["item3"]).expect("items again");
        assert_eq!(subscription.item_group(), None);
        assert_eq!(subscription.items(), Some(vec!["item3".to_string()]));
    }

    #[test]
    fn field_list_and_schema_are_mutually_exclusive() {
        let subscription = Subscription::new(SubscriptionMode::Merge);
        subscription.set_fields(&["bid", "ask"]).expect("fields");
        subscription.set_field_schema("quotes").expect("schema");
        assert_eq!(subscription.fields(), None);
        assert_eq!(subscription.field_schema(), Some("quotes".to_string()));
    }

    #[test]
    fn names_with_whitespace_are_rejected() {
        let subscription = Subscription::new(SubscriptionMode::Merge);
        assert!(matches!(
            subscription.set_items(&["bad item"]),
            Err(ClientError::IllegalArgument(_))
        ));
        assert!(matches!(
            subscription.set_fields(&[""]),
            Err(ClientError::IllegalArgument(_))
        ));
    }

    #[test]
    fn command_fields_require_key_and_command() {
        let subscription = Subscription::new(SubscriptionMode::Command);
        assert!(matches!(
            subscription.set_fields(&["qty", "price"]),
            Err(ClientError::IllegalArgument(_))
        ));
        subscription
            .set_fields(&["key", "command", "qty"])
            .expect("valid command fields");
    }

    #[test]
    fn snapshot_rules_follow_mode() {
        let raw = Subscription::new(SubscriptionMode::Raw);
        assert!(raw.set_requested_snapshot(Some(Snapshot::Yes)).is_err());
        raw.set_requested_snapshot(Some(Snapshot::No)).expect("no");

        let merge = Subscription::new(SubscriptionMode::Merge);
        assert!(merge
            .set_requested_snapshot(Some(Snapshot::Length(10)))
            .is_err());

        let distinct = Subscription::new(SubscriptionMode::Distinct);
        distinct
            .set_requested_snapshot(Some(Snapshot::Length(10)))
            .expect("length");
    }

    #[test]
    fn structural_mutation_fails_while_active() {
        let subscription = Subscription::new(SubscriptionMode::Merge);
        subscription.set_items(&["item1"]).expect("items");
        subscription.inner.state.lock().active = true;
        assert!(matches!(
            subscription.set_items(&["item2"]),
            Err(ClientError::IllegalState(_))
        ));
        assert!(matches!(
            subscription.set_data_adapter(Some("FEED")),
            Err(ClientError::IllegalState(_))
        ));
    }

    #[test]
    fn frequency_rules_while_active() {
        let subscription = Subscription::new(SubscriptionMode::Merge);
        subscription
            .set_requested_max_frequency(MaxFrequency::Limited(1.0))
            .expect("inactive set");
        subscription.inner.state.lock().active = true;
        subscription
            .set_requested_max_frequency(MaxFrequency::Limited(2.0))
            .expect("live change between numeric caps");
        assert!(subscription
            .set_requested_max_frequency(MaxFrequency::Unfiltered)
            .is_err());

        // From unfiltered, no live change at all.
        let unfiltered = Subscription::new(SubscriptionMode::Merge);
        unfiltered
            .set_requested_max_frequency(MaxFrequency::Unfiltered)
            .expect("inactive set");
        unfiltered.inner.state.lock().active = true;
        assert!(unfiltered
            .set_requested_max_frequency(MaxFrequency::Limited(1.0))
            .is_err());
    }

    #[test]
    fn second_level_setters_require_command_mode() {
        let merge = Subscription::new(SubscriptionMode::Merge);
        assert!(merge.set_command_second_level_fields(&["qty"]).is_err());

        let command = Subscription::new(SubscriptionMode::Command);
        command
            .set_command_second_level_fields(&["qty", "price"])
            .expect("second level");
    }
}
