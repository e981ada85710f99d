//! Subscription registry: assigns wire ids, routes inbound update events
//! to the owning subscription by item position, applies the per-mode
//! update semantics, and maintains the per-item value caches.
//!
//! COMMAND cascading: an ADD for a key on a two-level subscription spawns
//! an implicit MERGE child for that key; the child's updates are folded
//! back into the parent row with field positions starting right after the
//! highest first-level position, and a DELETE tears the child down.
use cascade_wire::{ClientRequest, CommandVerb, SubscriptionMode};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{ClientError, Result};
use crate::events::SubscriptionEvent;
use crate::item_update::ItemUpdate;
use crate::subscription::{FieldAddressing, ItemAddressing, SubscriptionShared};

/// What the engine must do after a registry step, in order.
pub(crate) enum RegistryAction {
    Send(ClientRequest),
    Notify {
        target: Arc<SubscriptionShared>,
        event: SubscriptionEvent,
    },
}

struct SecondLevel {
    schema: String,
    field_names: Arc<Vec<String>>,
    data_adapter: Option<String>,
}

struct ActiveSub {
    shared: Arc<SubscriptionShared>,
    mode: SubscriptionMode,
    group: String,
    schema: String,
    data_adapter: Option<String>,
    selector: Option<String>,
    snapshot_token: Option<String>,
    buffer_token: Option<String>,
    frequency_token: Option<String>,
    item_names: Arc<Vec<String>>,
    field_names: Arc<Vec<String>>,
    // Combined first+second level names for cascaded updates.
    combined_field_names: Arc<Vec<String>>,
    // Authoritative counts from the subscription ack.
    field_count: u32,
    key_pos: Option<u32>,
    command_pos: Option<u32>,
    second: Option<SecondLevel>,
    children: HashMap<(u32, String), u32>,
    parent: Option<(u32, u32, String)>,
}

impl ActiveSub {
    fn item_name(&self, position: u32) -> Option<String> {
        self.item_names.get(position as usize - 1).cloned()
    }

    fn key_position(&self) -> u32 {
        self.key_pos.or_else(|| find_field(&self.field_names, "key")).unwrap_or(1)
    }

    fn command_position(&self) -> u32 {
        self.command_pos
            .or_else(|| find_field(&self.field_names, "command"))
            .unwrap_or(2)
    }
}

fn find_field(names: &[String], wanted: &str) -> Option<u32> {
    names
        .iter()
        .position(|name| name == wanted)
        .map(|index| index as u32 + 1)
}

pub(crate) struct Registry {
    subs: HashMap<u32, ActiveSub>,
    next_id: u32,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            subs: HashMap::new(),
            next_id: 0,
        }
    }

    fn allocate_id(&mut self) -> u32 {
        // Ids start at 1 and are never reused within a client lifetime.
        self.next_id += 1;
        self.next_id
    }

    /// Caller-visible subscriptions currently registered (cascade
    /// children excluded).
    pub(crate) fn active_count(&self) -> usize {
        self.subs.values().filter(|sub| sub.parent.is_none()).count()
    }

    /// Register a caller subscription and assign its wire id. The caller
    /// has already flipped the `active` flag synchronously.
    pub(crate) fn activate(&mut self, shared: Arc<SubscriptionShared>) -> Result<u32> {
        let id = self.allocate_id();
        let entry = {
            let mut state = shared.state.lock();
            let (group, item_names) = match &state.items {
                Some(ItemAddressing::List(items)) => (items.join(" "), items.clone()),
                Some(ItemAddressing::Group(group)) => (group.clone(), Vec::new()),
                None => {
                    return Err(ClientError::argument(
                        "subscription has no item list or group",
                    ));
                }
            };
            let (schema, field_names) = match &state.fields {
                Some(FieldAddressing::List(fields)) => (fields.join(" "), fields.clone()),
                Some(FieldAddressing::Schema(schema)) => (schema.clone(), Vec::new()),
                None => {
                    return Err(ClientError::argument(
                        "subscription has no field list or schema",
                    ));
                }
            };
            let second = match &state.second_fields {
                Some(FieldAddressing::List(fields)) => Some(SecondLevel {
                    schema: fields.join(" "),
                    field_names: Arc::new(fields.clone()),
                    data_adapter: state.second_data_adapter.clone(),
                }),
                Some(FieldAddressing::Schema(schema)) => Some(SecondLevel {
                    schema: schema.clone(),
                    field_names: Arc::new(Vec::new()),
                    data_adapter: state.second_data_adapter.clone(),
                }),
                None => None,
            };
            state.id = Some(id);
            let field_names = Arc::new(field_names);
            let mut combined = (*field_names).clone();
            if let Some(second) = &second {
                combined.extend(second.field_names.iter().cloned());
            }
            ActiveSub {
                shared: Arc::clone(&shared),
                mode: state.mode,
                group,
                schema,
                data_adapter: state.data_adapter.clone(),
                selector: state.selector.clone(),
                snapshot_token: state.requested_snapshot.map(|snapshot| snapshot.as_token()),
                buffer_token: state.requested_buffer_size.map(|size| size.as_token()),
                frequency_token: state.requested_max_frequency.as_token(),
                item_names: Arc::new(item_names),
                field_count: field_names.len() as u32,
                field_names,
                combined_field_names: Arc::new(combined),
                key_pos: None,
                command_pos: None,
                second,
                children: HashMap::new(),
                parent: None,
            }
        };
        self.subs.insert(id, entry);
        Ok(id)
    }

    pub(crate) fn build_subscribe(&self, id: u32) -> Option<ClientRequest> {
        let sub = self.subs.get(&id)?;
        Some(ClientRequest::Subscribe {
            subscription: id,
            mode: sub.mode,
            group: sub.group.clone(),
            schema: sub.schema.clone(),
            data_adapter: sub.data_adapter.clone(),
            selector: sub.selector.clone(),
            snapshot: sub.snapshot_token.clone(),
            buffer_size: sub.buffer_token.clone(),
            max_frequency: sub.frequency_token.clone(),
        })
    }

    /// Caller-initiated unsubscribe: drop the entry (and any cascade
    /// children), clear caches, and report what to send/notify.
    pub(crate) fn deactivate(&mut self, shared: &Arc<SubscriptionShared>) -> Vec<RegistryAction> {
        let id = shared.state.lock().id;
        let Some(id) = id else {
            return Vec::new();
        };
        let Some(sub) = self.subs.remove(&id) else {
            return Vec::new();
        };
        let mut actions = Vec::new();
        for (_, child_id) in sub.children {
            if self.subs.remove(&child_id).is_some() {
                actions.push(RegistryAction::Send(ClientRequest::Unsubscribe {
                    subscription: child_id,
                }));
            }
        }
        actions.push(RegistryAction::Send(ClientRequest::Unsubscribe {
            subscription: id,
        }));
        {
            let mut state = sub.shared.state.lock();
            state.subscribed = false;
            state.id = None;
            state.values.clear();
            state.command_values.clear();
        }
        actions.push(RegistryAction::Notify {
            target: sub.shared,
            event: SubscriptionEvent::Unsubscribed,
        });
        actions
    }

    /// A fresh session replaced the previous one: every active
    /// subscription is resubscribed from scratch.
    pub(crate) fn resubscribe_all(&mut self) -> Vec<RegistryAction> {
        let mut actions = Vec::new();
        // Cascade children belong to the dead session's snapshot state.
        let child_ids: Vec<u32> = self
            .subs
            .iter()
            .filter(|(_, sub)| sub.parent.is_some())
            .map(|(&id, _)| id)
            .collect();
        for id in child_ids {
            self.subs.remove(&id);
        }
        let mut ids: Vec<u32> = self.subs.keys().copied().collect();
        ids.sort_unstable();
        for id in ids {
            let sub = self.subs.get_mut(&id).expect("sub just listed");
            sub.children.clear();
            {
                let mut state = sub.shared.state.lock();
                state.values.clear();
                state.command_values.clear();
            }
            if let Some(request) = self.build_subscribe(id) {
                actions.push(RegistryAction::Send(request));
            }
        }
        actions
    }

    /// Subscribe requests for active subscriptions not yet acknowledged
    /// on the current session (activated while the link was down, or
    /// whose request may have died with the old transport).
    pub(crate) fn pending_subscribes(&self) -> Vec<ClientRequest> {
        let mut ids: Vec<u32> = self
            .subs
            .iter()
            .filter(|(_, sub)| sub.parent.is_none() && !sub.shared.state.lock().subscribed)
            .map(|(&id, _)| id)
            .collect();
        ids.sort_unstable();
        ids.into_iter()
            .filter_map(|id| self.build_subscribe(id))
            .collect()
    }

    /// The session is gone (loss or disconnect): subscriptions stay
    /// active but leave the `subscribed` sub-state.
    pub(crate) fn on_session_lost(&mut self) -> Vec<RegistryAction> {
        let mut actions = Vec::new();
        for sub in self.subs.values() {
            if sub.parent.is_some() {
                continue;
            }
            let was_subscribed = {
                let mut state = sub.shared.state.lock();
                std::mem::replace(&mut state.subscribed, false)
            };
            if was_subscribed {
                actions.push(RegistryAction::Notify {
                    target: Arc::clone(&sub.shared),
                    event: SubscriptionEvent::Unsubscribed,
                });
            }
        }
        actions
    }

    pub(crate) fn change_frequency(
        &mut self,
        shared: &Arc<SubscriptionShared>,
        token: Option<String>,
    ) -> Option<ClientRequest> {
        let id = shared.state.lock().id?;
        let sub = self.subs.get_mut(&id)?;
        sub.frequency_token = token.clone();
        Some(ClientRequest::ChangeFrequency {
            subscription: id,
            max_frequency: token?,
        })
    }

    pub(crate) fn on_subscription_ack(
        &mut self,
        id: u32,
        items: u32,
        fields: u32,
        key_pos: Option<u32>,
        command_pos: Option<u32>,
    ) -> Vec<RegistryAction> {
        let Some(sub) = self.subs.get_mut(&id) else {
            debug!(id, "ack for unknown subscription");
            return Vec::new();
        };
        if !sub.item_names.is_empty() && items as usize != sub.item_names.len() {
            warn!(
                id,
                items,
                expected = sub.item_names.len(),
                "item count mismatch in subscription ack"
            );
        }
        sub.field_count = fields;
        sub.key_pos = key_pos;
        sub.command_pos = command_pos;
        if sub.parent.is_some() {
            // Cascade children acknowledge silently.
            return Vec::new();
        }
        sub.shared.state.lock().subscribed = true;
        vec![RegistryAction::Notify {
            target: Arc::clone(&sub.shared),
            event: SubscriptionEvent::Subscribed,
        }]
    }

    pub(crate) fn on_subscription_error(
        &mut self,
        id: u32,
        code: i32,
        message: String,
    ) -> Vec<RegistryAction> {
        let Some(sub) = self.subs.get(&id) else {
            debug!(id, "error for unknown subscription");
            return Vec::new();
        };
        if let Some((parent_id, item, key)) = sub.parent.clone() {
            self.subs.remove(&id);
            let Some(parent) = self.subs.get_mut(&parent_id) else {
                return Vec::new();
            };
            parent.children.remove(&(item, key.clone()));
            return vec![RegistryAction::Notify {
                target: Arc::clone(&parent.shared),
                event: SubscriptionEvent::SecondLevelSubscriptionError { code, message, key },
            }];
        }
        vec![RegistryAction::Notify {
            target: Arc::clone(&sub.shared),
            event: SubscriptionEvent::SubscriptionError { code, message },
        }]
    }

    pub(crate) fn on_unsubscription_ack(&mut self, id: u32) {
        if self.subs.contains_key(&id) {
            debug!(id, "unsubscription ack for a live subscription");
        }
    }

    pub(crate) fn on_end_of_snapshot(&mut self, id: u32, item: u32) -> Vec<RegistryAction> {
        let Some(sub) = self.subs.get(&id) else {
            return Vec::new();
        };
        // Only DISTINCT and COMMAND have a delimited snapshot.
        if !matches!(
            sub.mode,
            SubscriptionMode::Distinct | SubscriptionMode::Command
        ) {
            debug!(id, item, mode = ?sub.mode, "end-of-snapshot on snapshotless mode");
            return Vec::new();
        }
        vec![RegistryAction::Notify {
            target: Arc::clone(&sub.shared),
            event: SubscriptionEvent::EndOfSnapshot {
                item_name: sub.item_name(item),
                item_pos: item,
            },
        }]
    }

    pub(crate) fn on_clear_snapshot(&mut self, id: u32, item: u32) -> Vec<RegistryAction> {
        let Some(sub) = self.subs.get(&id) else {
            return Vec::new();
        };
        {
            let mut state = sub.shared.state.lock();
            state.values.remove(&item);
            state.command_values.remove(&item);
        }
        vec![RegistryAction::Notify {
            target: Arc::clone(&sub.shared),
            event: SubscriptionEvent::ClearSnapshot {
                item_name: sub.item_name(item),
                item_pos: item,
            },
        }]
    }

    pub(crate) fn on_overflow(&mut self, id: u32, item: u32, lost: u32) -> Vec<RegistryAction> {
        let Some(sub) = self.subs.get(&id) else {
            return Vec::new();
        };
        if let Some((parent_id, _, key)) = sub.parent.clone() {
            let Some(parent) = self.subs.get(&parent_id) else {
                return Vec::new();
            };
            return vec![RegistryAction::Notify {
                target: Arc::clone(&parent.shared),
                event: SubscriptionEvent::SecondLevelItemLostUpdates { lost, key },
            }];
        }
        vec![RegistryAction::Notify {
            target: Arc::clone(&sub.shared),
            event: SubscriptionEvent::ItemLostUpdates {
                item_name: sub.item_name(item),
                item_pos: item,
                lost,
            },
        }]
    }

    pub(crate) fn on_real_max_frequency(
        &mut self,
        id: u32,
        frequency: Option<String>,
    ) -> Vec<RegistryAction> {
        let Some(sub) = self.subs.get(&id) else {
            return Vec::new();
        };
        if sub.parent.is_some() {
            return Vec::new();
        }
        vec![RegistryAction::Notify {
            target: Arc::clone(&sub.shared),
            event: SubscriptionEvent::RealMaxFrequency { frequency },
        }]
    }

    /// Route one update event: diff against the cache, fold the values
    /// in, and produce the `ItemUpdate` notification (plus any cascade
    /// bookkeeping requests).
    pub(crate) fn on_update(
        &mut self,
        id: u32,
        item: u32,
        key: Option<String>,
        command: Option<CommandVerb>,
        snapshot: bool,
        changes: Vec<cascade_wire::FieldChange>,
    ) -> Vec<RegistryAction> {
        let Some(sub) = self.subs.get(&id) else {
            debug!(id, "update for unknown subscription");
            return Vec::new();
        };
        if let Some(parent) = sub.parent.clone() {
            return self.on_child_update(parent, changes);
        }
        match sub.mode {
            SubscriptionMode::Merge => self.on_merge_update(id, item, snapshot, changes),
            SubscriptionMode::Distinct | SubscriptionMode::Raw => {
                self.on_plain_update(id, item, snapshot, changes)
            }
            SubscriptionMode::Command => self.on_command_update(id, item, key, command, snapshot, changes),
        }
    }

    fn on_merge_update(
        &mut self,
        id: u32,
        item: u32,
        snapshot: bool,
        changes: Vec<cascade_wire::FieldChange>,
    ) -> Vec<RegistryAction> {
        let sub = self.subs.get(&id).expect("sub resolved by caller");
        let mut json_patches = HashMap::new();
        let (values, changed) = {
            let mut state = sub.shared.state.lock();
            let cache = state.values.entry(item).or_default();
            let mut changed = BTreeSet::new();
            for change in changes {
                if let Some(patch) = change.json_patch {
                    json_patches.insert(change.field, patch);
                }
                let previous = cache.insert(change.field, change.value.clone());
                if previous.flatten() != change.value {
                    changed.insert(change.field);
                }
            }
            let values: BTreeMap<u32, Option<String>> =
                cache.iter().map(|(&pos, value)| (pos, value.clone())).collect();
            (values, changed)
        };
        vec![RegistryAction::Notify {
            target: Arc::clone(&sub.shared),
            event: SubscriptionEvent::ItemUpdate(ItemUpdate {
                item_name: sub.item_name(item),
                item_pos: item,
                snapshot,
                key: None,
                values,
                changed,
                json_patches,
                field_names: Arc::clone(&sub.field_names),
            }),
        }]
    }

    // DISTINCT and RAW updates stand alone: no cache, every carried field
    // counts as changed.
    fn on_plain_update(
        &mut self,
        id: u32,
        item: u32,
        snapshot: bool,
        changes: Vec<cascade_wire::FieldChange>,
    ) -> Vec<RegistryAction> {
        let sub = self.subs.get(&id).expect("sub resolved by caller");
        if sub.mode == SubscriptionMode::Raw && snapshot {
            debug!(id, item, "snapshot-flagged update on a RAW subscription");
        }
        let mut values = BTreeMap::new();
        let mut changed = BTreeSet::new();
        let mut json_patches = HashMap::new();
        for change in changes {
            if let Some(patch) = change.json_patch {
                json_patches.insert(change.field, patch);
            }
            changed.insert(change.field);
            values.insert(change.field, change.value);
        }
        vec![RegistryAction::Notify {
            target: Arc::clone(&sub.shared),
            event: SubscriptionEvent::ItemUpdate(ItemUpdate {
                item_name: sub.item_name(item),
                item_pos: item,
                snapshot: snapshot && sub.mode == SubscriptionMode::Distinct,
                key: None,
                values,
                changed,
                json_patches,
                field_names: Arc::clone(&sub.field_names),
            }),
        }]
    }

    fn on_command_update(
        &mut self,
        id: u32,
        item: u32,
        key: Option<String>,
        command: Option<CommandVerb>,
        snapshot: bool,
        changes: Vec<cascade_wire::FieldChange>,
    ) -> Vec<RegistryAction> {
        let (key_pos, command_pos) = {
            let sub = self.subs.get(&id).expect("sub resolved by caller");
            (sub.key_position(), sub.command_position())
        };
        // The key may also arrive as a plain field value.
        let key = key.or_else(|| {
            changes
                .iter()
                .find(|change| change.field == key_pos)
                .and_then(|change| change.value.clone())
        });
        let Some(key) = key else {
            warn!(id, item, "COMMAND update without a key; dropped");
            return Vec::new();
        };
        let verb = command.unwrap_or(CommandVerb::Update);

        let mut actions = Vec::new();
        let sub = self.subs.get_mut(&id).expect("sub resolved by caller");
        let mut json_patches = HashMap::new();

        let (values, changed) = {
            let mut state = sub.shared.state.lock();
            let rows = state.command_values.entry(item).or_default();
            match verb {
                CommandVerb::Delete => {
                    let previous = rows.remove(&key).unwrap_or_default();
                    // Every field the row carried goes to null, except the
                    // key; the command field reports the verb itself.
                    let mut values = BTreeMap::new();
                    let mut changed = BTreeSet::new();
                    let field_count =
                        (sub.field_count as usize).max(previous.keys().copied().max().unwrap_or(0) as usize);
                    for position in 1..=field_count as u32 {
                        if position == key_pos {
                            values.insert(position, Some(key.clone()));
                            continue;
                        }
                        if position == command_pos {
                            values.insert(position, Some("DELETE".to_string()));
                            changed.insert(position);
                            continue;
                        }
                        values.insert(position, None);
                        changed.insert(position);
                    }
                    (values, changed)
                }
                CommandVerb::Add | CommandVerb::Update => {
                    let row = rows.entry(key.clone()).or_default();
                    let mut changed = BTreeSet::new();
                    for change in &changes {
                        if let Some(patch) = &change.json_patch {
                            json_patches.insert(change.field, patch.clone());
                        }
                        let previous = row.insert(change.field, change.value.clone());
                        if previous.flatten() != change.value {
                            changed.insert(change.field);
                        }
                    }
                    // Keep the control fields coherent with the verb.
                    let verb_token = match verb {
                        CommandVerb::Add => "ADD",
                        _ => "UPDATE",
                    };
                    let previous_verb = row.insert(command_pos, Some(verb_token.to_string()));
                    if previous_verb.flatten().as_deref() != Some(verb_token) {
                        changed.insert(command_pos);
                    }
                    let previous_key = row.insert(key_pos, Some(key.clone()));
                    if previous_key.flatten().as_deref() != Some(key.as_str()) {
                        changed.insert(key_pos);
                    }
                    let values: BTreeMap<u32, Option<String>> =
                        row.iter().map(|(&pos, value)| (pos, value.clone())).collect();
                    (values, changed)
                }
            }
        };

        actions.push(RegistryAction::Notify {
            target: Arc::clone(&sub.shared),
            event: SubscriptionEvent::ItemUpdate(ItemUpdate {
                item_name: sub.item_name(item),
                item_pos: item,
                snapshot,
                key: Some(key.clone()),
                values,
                changed,
                json_patches,
                field_names: Arc::clone(&sub.combined_field_names),
            }),
        });

        // Cascade bookkeeping.
        if sub.second.is_some() {
            match verb {
                CommandVerb::Add => {
                    if !sub.children.contains_key(&(item, key.clone())) {
                        actions.extend(self.spawn_child(id, item, key));
                    }
                }
                CommandVerb::Delete => {
                    let sub = self.subs.get_mut(&id).expect("sub resolved by caller");
                    if let Some(child_id) = sub.children.remove(&(item, key)) {
                        self.subs.remove(&child_id);
                        actions.push(RegistryAction::Send(ClientRequest::Unsubscribe {
                            subscription: child_id,
                        }));
                    }
                }
                CommandVerb::Update => {}
            }
        }
        actions
    }

    fn spawn_child(&mut self, parent_id: u32, item: u32, key: String) -> Vec<RegistryAction> {
        let child_id = self.allocate_id();
        let parent = self.subs.get_mut(&parent_id).expect("parent resolved");
        let Some(second) = &parent.second else {
            return Vec::new();
        };
        let child = ActiveSub {
            shared: Arc::clone(&parent.shared),
            mode: SubscriptionMode::Merge,
            group: key.clone(),
            schema: second.schema.clone(),
            data_adapter: second.data_adapter.clone(),
            selector: None,
            snapshot_token: Some("yes".to_string()),
            buffer_token: None,
            frequency_token: parent.frequency_token.clone(),
            item_names: Arc::new(vec![key.clone()]),
            field_names: Arc::clone(&second.field_names),
            combined_field_names: Arc::clone(&second.field_names),
            field_count: second.field_names.len() as u32,
            key_pos: None,
            command_pos: None,
            second: None,
            children: HashMap::new(),
            parent: Some((parent_id, item, key.clone())),
        };
        parent.children.insert((item, key), child_id);
        let request = ClientRequest::Subscribe {
            subscription: child_id,
            mode: SubscriptionMode::Merge,
            group: child.group.clone(),
            schema: child.schema.clone(),
            data_adapter: child.data_adapter.clone(),
            selector: None,
            snapshot: child.snapshot_token.clone(),
            buffer_size: None,
            max_frequency: child.frequency_token.clone(),
        };
        self.subs.insert(child_id, child);
        vec![RegistryAction::Send(request)]
    }

    // A child update is re-expressed as an UPDATE on the parent row, with
    // second-level field positions offset past the first level.
    fn on_child_update(
        &mut self,
        (parent_id, item, key): (u32, u32, String),
        changes: Vec<cascade_wire::FieldChange>,
    ) -> Vec<RegistryAction> {
        let Some(parent) = self.subs.get(&parent_id) else {
            return Vec::new();
        };
        let offset = parent.field_count;
        let mut json_patches = HashMap::new();
        let (values, changed) = {
            let mut state = parent.shared.state.lock();
            let rows = state.command_values.entry(item).or_default();
            let Some(row) = rows.get_mut(&key) else {
                // The row was deleted while the child update was in
                // flight.
                debug!(parent_id, %key, "child update for a deleted row");
                return Vec::new();
            };
            let mut changed = BTreeSet::new();
            for change in changes {
                let position = offset + change.field;
                if let Some(patch) = change.json_patch {
                    json_patches.insert(position, patch);
                }
                let previous = row.insert(position, change.value.clone());
                if previous.flatten() != change.value {
                    changed.insert(position);
                }
            }
            let values: BTreeMap<u32, Option<String>> =
                row.iter().map(|(&pos, value)| (pos, value.clone())).collect();
            (values, changed)
        };
        vec![RegistryAction::Notify {
            target: Arc::clone(&parent.shared),
            event: SubscriptionEvent::ItemUpdate(ItemUpdate {
                item_name: parent.item_name(item),
                item_pos: item,
                snapshot: false,
                key: Some(key),
                values,
                changed,
                json_patches,
                field_names: Arc::clone(&parent.combined_field_names),
            }),
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::Subscription;
    use cascade_wire::FieldChange;

    fn change(field: u32, value: Option<&str>) -> FieldChange {
        FieldChange {
            field,
            value: value.map(str::to_string),
            json_patch: None,
        }
    }

    fn updates(actions: &[RegistryAction]) -> Vec<&ItemUpdate> {
        actions
            .iter()
            .filter_map(|action| match action {
                RegistryAction::Notify {
                    event: SubscriptionEvent::ItemUpdate(update),
                    ..
                } => Some(update),
                _ => None,
            })
            .collect()
    }

    fn sends(actions: &[RegistryAction]) -> Vec<&ClientRequest> {
        actions
            .iter()
            .filter_map(|action| match action {
                RegistryAction::Send(request) => Some(request),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn merge_updates_diff_against_the_cache() {
        let mut registry = Registry::new();
        let subscription =
            Subscription::with_items(SubscriptionMode::Merge, &["item1"], &["bid", "ask"])
                .expect("subscription");
        let id = registry.activate(Arc::clone(&subscription.inner)).expect("activate");

        let actions = registry.on_update(
            id,
            1,
            None,
            None,
            true,
            vec![change(1, Some("10")), change(2, Some("11"))],
        );
        let first = updates(&actions)[0];
        assert!(first.is_snapshot());
        assert!(first.is_value_changed("bid"));
        assert!(first.is_value_changed("ask"));

        // Second update repeats the bid: only the ask counts as changed.
        let actions = registry.on_update(
            id,
            1,
            None,
            None,
            false,
            vec![change(1, Some("10")), change(2, Some("12"))],
        );
        let second = updates(&actions)[0];
        assert!(!second.is_value_changed("bid"));
        assert!(second.is_value_changed("ask"));
        assert_eq!(second.value("ask"), Some("12"));

        // The cache is readable through the handle.
        assert_eq!(subscription.value("item1", "ask"), Some("12".to_string()));
    }

    #[test]
    fn command_add_update_delete_semantics() {
        let mut registry = Registry::new();
        let subscription = Subscription::with_items(
            SubscriptionMode::Command,
            &["orders"],
            &["key", "command", "qty"],
        )
        .expect("subscription");
        let id = registry.activate(Arc::clone(&subscription.inner)).expect("activate");

        let actions = registry.on_update(
            id,
            1,
            Some("K1".to_string()),
            Some(CommandVerb::Add),
            true,
            vec![change(1, Some("K1")), change(3, Some("100"))],
        );
        let add = updates(&actions)[0];
        assert_eq!(add.key(), Some("K1"));
        assert_eq!(add.value("command"), Some("ADD"));
        assert!(add.is_value_changed("qty"));

        // UPDATE with the same qty: only the command verb changes.
        let actions = registry.on_update(
            id,
            1,
            Some("K1".to_string()),
            Some(CommandVerb::Update),
            false,
            vec![change(3, Some("100"))],
        );
        let update = updates(&actions)[0];
        assert!(!update.is_value_changed("qty"));
        assert!(update.is_value_changed("command"));

        // UPDATE with a different qty.
        let actions = registry.on_update(
            id,
            1,
            Some("K1".to_string()),
            Some(CommandVerb::Update),
            false,
            vec![change(3, Some("250"))],
        );
        let update = updates(&actions)[0];
        assert!(update.is_value_changed("qty"));
        assert_eq!(update.value("qty"), Some("250"));
        assert_eq!(
            subscription.command_value("orders", "K1", "qty"),
            Some("250".to_string())
        );

        // DELETE nulls every non-key field and drops the row.
        let actions = registry.on_update(
            id,
            1,
            Some("K1".to_string()),
            Some(CommandVerb::Delete),
            false,
            vec![],
        );
        let delete = updates(&actions)[0];
        assert_eq!(delete.value("key"), Some("K1"));
        assert_eq!(delete.value("command"), Some("DELETE"));
        assert_eq!(delete.value("qty"), None);
        assert!(delete.is_value_changed("qty"));
        assert!(delete.is_value_changed("command"));
        assert!(!delete.is_value_changed("key"));
        assert_eq!(subscription.command_value("orders", "K1", "qty"), None);
    }

    #[test]
    fn two_level_add_spawns_child_and_delete_reaps_it() {
        let mut registry = Registry::new();
        let subscription = Subscription::with_items(
            SubscriptionMode::Command,
            &["orders"],
            &["key", "command"],
        )
        .expect("subscription");
        subscription
            .set_command_second_level_fields(&["status", "eta"])
            .expect("second level");
        let id = registry.activate(Arc::clone(&subscription.inner)).expect("activate");

        let actions = registry.on_update(
            id,
            1,
            Some("K1".to_string()),
            Some(CommandVerb::Add),
            false,
            vec![change(1, Some("K1"))],
        );
        let requests = sends(&actions);
        assert_eq!(requests.len(), 1);
        let child_id = match requests[0] {
            ClientRequest::Subscribe {
                subscription,
                mode: SubscriptionMode::Merge,
                group,
                schema,
                ..
            } => {
                assert_eq!(group, "K1");
                assert_eq!(schema, "status eta");
                *subscription
            }
            other => panic!("unexpected request: {other:?}"),
        };

        // Child updates surface on the parent with offset positions:
        // first level has 2 fields, so child field 1 lands at 3.
        let actions = registry.on_update(
            child_id,
            1,
            None,
            None,
            true,
            vec![change(1, Some("shipped"))],
        );
        let folded = updates(&actions)[0];
        assert_eq!(folded.key(), Some("K1"));
        assert_eq!(folded.value(3u32), Some("shipped"));
        assert_eq!(folded.value("status"), Some("shipped"));
        assert!(folded.is_value_changed(3u32));

        // DELETE unsubscribes the child.
        let actions = registry.on_update(
            id,
            1,
            Some("K1".to_string()),
            Some(CommandVerb::Delete),
            false,
            vec![],
        );
        let requests = sends(&actions);
        assert!(matches!(
            requests[0],
            ClientRequest::Unsubscribe { subscription } if *subscription == child_id
        ));
    }

    #[test]
    fn end_of_snapshot_only_for_distinct_and_command() {
        let mut registry = Registry::new();
        let merge = Subscription::with_items(SubscriptionMode::Merge, &["item1"], &["f1"])
            .expect("subscription");
        let merge_id = registry.activate(Arc::clone(&merge.inner)).expect("activate");
        assert!(registry.on_end_of_snapshot(merge_id, 1).is_empty());

        let distinct = Subscription::with_items(SubscriptionMode::Distinct, &["item1"], &["f1"])
            .expect("subscription");
        let distinct_id = registry.activate(Arc::clone(&distinct.inner)).expect("activate");
        let actions = registry.on_end_of_snapshot(distinct_id, 1);
        assert!(matches!(
            actions[0],
            RegistryAction::Notify {
                event: SubscriptionEvent::EndOfSnapshot { item_pos: 1, .. },
                ..
            }
        ));
    }

    #[test]
    fn overflow_reports_lost_updates_without_touching_the_cache() {
        let mut registry = Registry::new();
        let subscription = Subscription::with_items(SubscriptionMode::Merge, &["item1"], &["f1"])
            .expect("subscription");
        let id = registry.activate(Arc::clone(&subscription.inner)).expect("activate");
        registry.on_update(id, 1, None, None, false, vec![change(1, Some("kept"))]);

        let actions = registry.on_overflow(id, 1, 7);
        assert!(matches!(
            actions[0],
            RegistryAction::Notify {
                event: SubscriptionEvent::ItemLostUpdates { lost: 7, .. },
                ..
            }
        ));
        assert_eq!(subscription.value("item1", "f1"), Some("kept".to_string()));
    }

    #[test]
    fn resubscribe_clears_caches_and_reissues_requests() {
        let mut registry = Registry::new();
        let subscription = Subscription::with_items(SubscriptionMode::Merge, &["item1"], &["f1"])
            .expect("subscription");
        let id = registry.activate(Arc::clone(&subscription.inner)).expect("activate");
        registry.on_update(id, 1, None, None, false, vec![change(1, Some("stale"))]);

        let actions = registry.resubscribe_all();
        let requests = sends(&actions);
        assert_eq!(requests.len(), 1);
        assert!(matches!(
            requests[0],
            ClientRequest::Subscribe { subscription, .. } if *subscription == id
        ));
        assert_eq!(subscription.value("item1", "f1"), None);
    }

    #[test]
    fn ids_start_at_one_and_never_repeat() {
        let mut registry = Registry::new();
        let first = Subscription::with_items(SubscriptionMode::Merge, &["a"], &["f"])
            .expect("subscription");
        let second = Subscription::with_items(SubscriptionMode::Merge, &["b"], &["f"])
            .expect("subscription");
        let first_id = registry.activate(Arc::clone(&first.inner)).expect("activate");
        assert_eq!(first_id, 1);
        registry.deactivate(&first.inner);
        let second_id = registry.activate(Arc::clone(&second.inner)).expect("activate");
        assert_eq!(second_id, 2);
    }
}
