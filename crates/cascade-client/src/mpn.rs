//! MPN (push-notification) registry: device registration and a
//! server-side subscription store mirrored locally.
//!
//! The unit of identity is the server-assigned subscription id, not the
//! in-memory object: records live in a registry map and `MpnSubscription`
//! handles resolve their status/format/trigger through it, so every
//! handle bound to the same id observes the same state. Coalescing binds
//! a new request onto a pre-existing record instead of allocating a new
//! server entity.
use cascade_wire::{
    ClientRequest, MpnDeviceStatus, MpnSnapshot, MpnSubscriptionStatus, SubscriptionMode,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use tracing::debug;

use crate::engine::Command;
use crate::error::{ClientError, Result};
use crate::events::{
    MpnDeviceEvent, MpnDeviceListener, MpnSubscriptionEvent, MpnSubscriptionListener,
};
use crate::subscription::{FieldAddressing, ItemAddressing};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
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

// ── Device ──────────────────────────────────────────────────────────────

pub(crate) struct MpnDeviceState {
    pub(crate) platform: String,
    pub(crate) application_id: String,
    pub(crate) device_token: String,
    pub(crate) previous_device_token: Option<String>,
    pub(crate) device_id: Option<String>,
    pub(crate) status: MpnDeviceStatus,
    pub(crate) status_timestamp: u64,
}

pub(crate) struct MpnDeviceShared {
    pub(crate) state: Mutex<MpnDeviceState>,
    pub(crate) listeners: RwLock<Vec<Arc<dyn MpnDeviceListener>>>,
}

/// A push-notification target device.
#[derive(Clone)]
pub struct MpnDevice {
    pub(crate) inner: Arc<MpnDeviceShared>,
}

impl MpnDevice {
    pub fn new(device_token: &str, application_id: &str, platform: &str) -> Result<Self> {
        validate_name(device_token, "device token")?;
        validate_name(application_id, "application id")?;
        validate_name(platform, "platform")?;
        Ok(Self {
            inner: Arc::new(MpnDeviceShared {
                state: Mutex::new(MpnDeviceState {
                    platform: platform.to_string(),
                    application_id: application_id.to_string(),
                    device_token: device_token.to_string(),
                    previous_device_token: None,
                    device_id: None,
                    status: MpnDeviceStatus::Unknown,
                    status_timestamp: 0,
                }),
                listeners: RwLock::new(Vec::new()),
            }),
        })
    }

    /// Token the device held before a platform rotation, so the server
    /// can migrate the existing registration.
    pub fn set_previous_device_token(&self, token: Option<&str>) -> Result<()> {
        if let Some(token) = token {
            validate_name(token, "device token")?;
        }
        let mut state = self.inner.state.lock();
        if state.device_id.is_some() {
            return Err(ClientError::state(
                "previous token is fixed once the device is registered",
            ));
        }
        state.previous_device_token = token.map(str::to_string);
        Ok(())
    }

    pub fn platform(&self) -> String {
        self.inner.state.lock().platform.clone()
    }

    pub fn application_id(&self) -> String {
        self.inner.state.lock().application_id.clone()
    }

    pub fn device_token(&self) -> String {
        self.inner.state.lock().device_token.clone()
    }

    pub fn previous_device_token(&self) -> Option<String> {
        self.inner.state.lock().previous_device_token.clone()
    }

    /// Server-assigned id, available only once registered.
    pub fn device_id(&self) -> Option<String> {
        self.inner.state.lock().device_id.clone()
    }

    pub fn status(&self) -> MpnDeviceStatus {
        self.inner.state.lock().status
    }

    pub fn status_timestamp(&self) -> u64 {
        self.inner.state.lock().status_timestamp
    }

    pub fn is_registered(&self) -> bool {
        self.inner.state.lock().status == MpnDeviceStatus::Registered
    }

    pub fn add_listener(&self, listener: Arc<dyn MpnDeviceListener>) {
        self.inner.listeners.write().push(Arc::clone(&listener));
        listener.on_event(&MpnDeviceEvent::ListenStart);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn MpnDeviceListener>) {
        let mut listeners = self.inner.listeners.write();
        if let Some(index) = listeners
            .iter()
            .position(|existing| Arc::ptr_eq(existing, listener))
        {
            let removed = listeners.swap_remove(index);
            drop(listeners);
            removed.on_event(&MpnDeviceEvent::ListenEnd);
        }
    }
}

// ── Subscription records and handles ────────────────────────────────────

/// Registry-owned record of one server-side MPN subscription.
pub(crate) struct MpnRecord {
    pub(crate) mode: SubscriptionMode,
    pub(crate) group: String,
    pub(crate) schema: String,
    pub(crate) data_adapter: Option<String>,
    pub(crate) format: Option<String>,
    pub(crate) trigger: Option<String>,
    pub(crate) status: MpnSubscriptionStatus,
    pub(crate) status_timestamp: u64,
    pub(crate) handles: Vec<Weak<MpnSubShared>>,
}

pub(crate) type MpnRecords = Arc<RwLock<HashMap<String, MpnRecord>>>;

pub(crate) struct MpnSubState {
    pub(crate) mode: SubscriptionMode,
    pub(crate) items: Option<ItemAddressing>,
    pub(crate) fields: Option<FieldAddressing>,
    pub(crate) data_adapter: Option<String>,
    pub(crate) requested_format: Option<String>,
    pub(crate) requested_trigger: Option<String>,
    pub(crate) status: MpnSubscriptionStatus,
    pub(crate) status_timestamp: u64,
    pub(crate) subscription_id: Option<String>,
    pub(crate) active: bool,
}

pub(crate) struct MpnSubShared {
    pub(crate) state: Mutex<MpnSubState>,
    pub(crate) listeners: RwLock<Vec<Arc<dyn MpnSubscriptionListener>>>,
    pub(crate) engine: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    // Set when attached to a client, so getters resolve through the
    // shared record rather than a private copy.
    pub(crate) records: Mutex<Option<MpnRecords>>,
}

impl MpnSubShared {
    fn resolve<R>(&self, read: impl FnOnce(&MpnRecord) -> R) -> Option<R> {
        let id = self.state.lock().subscription_id.clone()?;
        let records = self.records.lock().clone()?;
        let map = records.read();
        map.get(&id).map(read)
    }
}

/// A push-notification subscription handle. Clones share identity; so do
/// distinct handles bound to the same server subscription id.
#[derive(Clone)]
pub struct MpnSubscription {
    pub(crate) inner: Arc<MpnSubShared>,
}

impl MpnSubscription {
    pub fn new(mode: SubscriptionMode) -> Result<Self> {
        if !matches!(mode, SubscriptionMode::Merge | SubscriptionMode::Distinct) {
            return Err(ClientError::argument(
                "MPN subscriptions support MERGE and DISTINCT only",
            ));
        }
        Ok(Self {
            inner: Arc::new(MpnSubShared {
                state: Mutex::new(MpnSubState {
                    mode,
                    items: None,
                    fields: None,
                    data_adapter: None,
                    requested_format: None,
                    requested_trigger: None,
                    status: MpnSubscriptionStatus::Unknown,
                    status_timestamp: 0,
                    subscription_id: None,
                    active: false,
                }),
                listeners: RwLock::new(Vec::new()),
                engine: Mutex::new(None),
                records: Mutex::new(None),
            }),
        })
    }

    fn structural<R>(&self, mutate: impl FnOnce(&mut MpnSubState) -> Result<R>) -> Result<R> {
        let mut state = self.inner.state.lock();
        if state.active {
            return Err(ClientError::state(
                "structural properties are immutable while the MPN subscription is active",
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
        self.structural(|state| {
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

    /// Notification payload template. Unlike the structural properties,
    /// this may change while active: the new value is applied
    /// optimistically and the server confirms or rejects it.
    pub fn set_notification_format(&self, format: &str) -> Result<()> {
        if format.is_empty() {
            return Err(ClientError::argument("notification format must not be empty"));
        }
        let forward = {
            let mut state = self.inner.state.lock();
            state.requested_format = Some(format.to_string());
            state.active
        };
        if forward
            && let Some(engine) = self.inner.engine.lock().as_ref()
        {
            let _ = engine.send(Command::MpnChangeFormat {
                shared: Arc::clone(&self.inner),
                format: format.to_string(),
            });
        }
        Ok(())
    }

    /// Trigger expression; `None` means "notify on every update". May
    /// change while active, like the format.
    pub fn set_trigger_expression(&self, trigger: Option<&str>) -> Result<()> {
        let forward = {
            let mut state = self.inner.state.lock();
            state.requested_trigger = trigger.map(str::to_string);
            state.active
        };
        if forward
            && let Some(engine) = self.inner.engine.lock().as_ref()
        {
            let _ = engine.send(Command::MpnChangeTrigger {
                shared: Arc::clone(&self.inner),
                trigger: trigger.map(str::to_string),
            });
        }
        Ok(())
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

    /// The locally requested format (see `actual_notification_format`
    /// for the last server-confirmed value).
    pub fn notification_format(&self) -> Option<String> {
        self.inner.state.lock().requested_format.clone()
    }

    pub fn actual_notification_format(&self) -> Option<String> {
        self.inner.resolve(|record| record.format.clone()).flatten()
    }

    pub fn trigger_expression(&self) -> Option<String> {
        self.inner.state.lock().requested_trigger.clone()
    }

    pub fn actual_trigger_expression(&self) -> Option<String> {
        self.inner.resolve(|record| record.trigger.clone()).flatten()
    }

    pub fn status(&self) -> MpnSubscriptionStatus {
        self.inner
            .resolve(|record| record.status)
            .unwrap_or_else(|| self.inner.state.lock().status)
    }

    pub fn status_timestamp(&self) -> u64 {
        self.inner
            .resolve(|record| record.status_timestamp)
            .unwrap_or_else(|| self.inner.state.lock().status_timestamp)
    }

    /// Server-assigned persistent id, shared by every in-memory object
    /// bound to the same server-side entity.
    pub fn subscription_id(&self) -> Option<String> {
        self.inner.state.lock().subscription_id.clone()
    }

    pub fn is_active(&self) -> bool {
        self.inner.state.lock().active
    }

    pub fn is_subscribed(&self) -> bool {
        matches!(
            self.status(),
            MpnSubscriptionStatus::Subscribed | MpnSubscriptionStatus::Triggered
        )
    }

    pub fn is_triggered(&self) -> bool {
        self.status() == MpnSubscriptionStatus::Triggered
    }

    pub fn add_listener(&self, listener: Arc<dyn MpnSubscriptionListener>) {
        self.inner.listeners.write().push(Arc::clone(&listener));
        listener.on_event(&MpnSubscriptionEvent::ListenStart);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn MpnSubscriptionListener>) {
        let mut listeners = self.inner.listeners.write();
        if let Some(index) = listeners
            .iter()
            .position(|existing| Arc::ptr_eq(existing, listener))
        {
            let removed = listeners.swap_remove(index);
            drop(listeners);
            removed.on_event(&MpnSubscriptionEvent::ListenEnd);
        }
    }
}

/// Filter for bulk unsubscription and collection inquiries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpnFilter {
    All,
    Subscribed,
    Triggered,
}

impl MpnFilter {
    pub fn parse(filter: Option<&str>) -> Result<Self> {
        match filter {
            None => Ok(MpnFilter::All),
            Some("ALL") => Ok(MpnFilter::All),
            Some("SUBSCRIBED") => Ok(MpnFilter::Subscribed),
            Some("TRIGGERED") => Ok(MpnFilter::Triggered),
            Some(other) => Err(ClientError::argument(format!(
                "invalid MPN filter: {other:?}"
            ))),
        }
    }

    pub(crate) fn matches(&self, status: MpnSubscriptionStatus) -> bool {
        match self {
            MpnFilter::All => matches!(
                status,
                MpnSubscriptionStatus::Subscribed | MpnSubscriptionStatus::Triggered
            ),
            MpnFilter::Subscribed => status == MpnSubscriptionStatus::Subscribed,
            MpnFilter::Triggered => status == MpnSubscriptionStatus::Triggered,
        }
    }
}

// ── Engine-side registry ────────────────────────────────────────────────

pub(crate) enum MpnAction {
    Send(ClientRequest),
    NotifyDevice {
        target: Arc<MpnDeviceShared>,
        event: MpnDeviceEvent,
    },
    NotifySubs {
        targets: Vec<Arc<MpnSubShared>>,
        event: MpnSubscriptionEvent,
    },
}

struct PendingMpnSub {
    shared: Arc<MpnSubShared>,
    coalescing: bool,
    sent: bool,
}

pub(crate) struct MpnRegistry {
    device: Option<Arc<MpnDeviceShared>>,
    registered: bool,
    register_sent: bool,
    pending: HashMap<u32, PendingMpnSub>,
    records: MpnRecords,
    next_ref: u32,
}

impl MpnRegistry {
    pub(crate) fn new(records: MpnRecords) -> Self {
        Self {
            device: None,
            registered: false,
            register_sent: false,
            pending: HashMap::new(),
            records,
            next_ref: 0,
        }
    }

    pub(crate) fn device(&self) -> Option<Arc<MpnDeviceShared>> {
        self.device.clone()
    }

    fn device_id(&self) -> Option<String> {
        self.device
            .as_ref()
            .and_then(|device| device.state.lock().device_id.clone())
    }

    fn build_register(&self) -> Option<ClientRequest> {
        let device = self.device.as_ref()?;
        let state = device.state.lock();
        Some(ClientRequest::MpnRegister {
            platform: state.platform.clone(),
            application_id: state.application_id.clone(),
            device_token: state.device_token.clone(),
            previous_device_token: state.previous_device_token.clone(),
        })
    }

    /// Adopt a device; the registration request goes out as soon as a
    /// session is available.
    pub(crate) fn register(
        &mut self,
        shared: Arc<MpnDeviceShared>,
        session_present: bool,
    ) -> Vec<MpnAction> {
        self.device = Some(shared);
        self.registered = false;
        self.register_sent = false;
        let mut actions = Vec::new();
        if session_present
            && let Some(request) = self.build_register()
        {
            self.register_sent = true;
            actions.push(MpnAction::Send(request));
        }
        actions
    }

    /// A session came up (or was replaced): (re)issue the registration.
    pub(crate) fn on_session_established(&mut self) -> Vec<MpnAction> {
        self.registered = false;
        self.register_sent = false;
        let mut actions = Vec::new();
        if let Some(request) = self.build_register() {
            self.register_sent = true;
            actions.push(MpnAction::Send(request));
        }
        actions
    }

    pub(crate) fn on_register_ack(&mut self, device_id: String) -> Vec<MpnAction> {
        let Some(device) = self.device.clone() else {
            return Vec::new();
        };
        self.registered = true;
        {
            let mut state = device.state.lock();
            state.device_id = Some(device_id);
            state.status = MpnDeviceStatus::Registered;
            state.status_timestamp = now_ms();
        }
        let mut actions = vec![
            MpnAction::NotifyDevice {
                target: Arc::clone(&device),
                event: MpnDeviceEvent::Registered,
            },
            MpnAction::NotifyDevice {
                target: device,
                event: MpnDeviceEvent::StatusChange {
                    status: MpnDeviceStatus::Registered,
                    timestamp: now_ms(),
                },
            },
        ];
        // Flush subscriptions that were waiting for the registration.
        actions.extend(self.flush_pending());
        actions
    }

    /// Send every subscribe request still waiting on a usable link, once
    /// the device registration is in place.
    pub(crate) fn flush_pending(&mut self) -> Vec<MpnAction> {
        if !self.registered {
            return Vec::new();
        }
        let refs: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, pending)| !pending.sent)
            .map(|(&reference, _)| reference)
            .collect();
        let mut actions = Vec::new();
        for reference in refs {
            if let Some(request) = self.build_subscribe_request(reference) {
                if let Some(pending) = self.pending.get_mut(&reference) {
                    pending.sent = true;
                }
                actions.push(MpnAction::Send(request));
            }
        }
        actions
    }

    pub(crate) fn on_register_error(&mut self, code: i32, message: String) -> Vec<MpnAction> {
        self.register_sent = false;
        let Some(device) = self.device.clone() else {
            return Vec::new();
        };
        vec![MpnAction::NotifyDevice {
            target: device,
            event: MpnDeviceEvent::RegistrationFailed { code, message },
        }]
    }

    pub(crate) fn on_device_status(
        &mut self,
        status: MpnDeviceStatus,
        timestamp: u64,
    ) -> Vec<MpnAction> {
        let Some(device) = self.device.clone() else {
            return Vec::new();
        };
        let previous = {
            let mut state = device.state.lock();
            let previous = state.status;
            state.status = status;
            state.status_timestamp = timestamp;
            previous
        };
        let mut actions = vec![MpnAction::NotifyDevice {
            target: Arc::clone(&device),
            event: MpnDeviceEvent::StatusChange { status, timestamp },
        }];
        match (previous, status) {
            (MpnDeviceStatus::Registered, MpnDeviceStatus::Suspended) => {
                actions.push(MpnAction::NotifyDevice {
                    target: device,
                    event: MpnDeviceEvent::Suspended,
                });
            }
            (MpnDeviceStatus::Suspended, MpnDeviceStatus::Registered) => {
                actions.push(MpnAction::NotifyDevice {
                    target: device,
                    event: MpnDeviceEvent::Resumed,
                });
            }
            _ => {}
        }
        actions
    }

    fn definition(shared: &MpnSubShared) -> Result<(SubscriptionMode, String, String, Option<String>)> {
        let state = shared.state.lock();
        let group = match &state.items {
            Some(ItemAddressing::List(items)) => items.join(" "),
            Some(ItemAddressing::Group(group)) => group.clone(),
            None => {
                return Err(ClientError::argument(
                    "MPN subscription has no item list or group",
                ));
            }
        };
        let schema = match &state.fields {
            Some(FieldAddressing::List(fields)) => fields.join(" "),
            Some(FieldAddressing::Schema(schema)) => schema.clone(),
            None => {
                return Err(ClientError::argument(
                    "MPN subscription has no field list or schema",
                ));
            }
        };
        Ok((state.mode, group, schema, state.data_adapter.clone()))
    }

    /// Accept a subscribe call. When coalescing finds a live local match
    /// the handle converges onto the existing record immediately; the
    /// request still goes to the server, which performs the same merge on
    /// its side.
    pub(crate) fn subscribe(
        &mut self,
        shared: Arc<MpnSubShared>,
        coalescing: bool,
        session_present: bool,
    ) -> Result<Vec<MpnAction>> {
        let (mode, group, schema, data_adapter) = Self::definition(&shared)?;
        *shared.records.lock() = Some(Arc::clone(&self.records));

        let mut actions = Vec::new();
        {
            let mut state = shared.state.lock();
            state.status = MpnSubscriptionStatus::Active;
            state.status_timestamp = now_ms();
        }
        actions.push(MpnAction::NotifySubs {
            targets: vec![Arc::clone(&shared)],
            event: MpnSubscriptionEvent::StatusChange {
                status: MpnSubscriptionStatus::Active,
                timestamp: now_ms(),
            },
        });

        if coalescing {
            let trigger = shared.state.lock().requested_trigger.clone();
            let matched = {
                let records = self.records.read();
                records
                    .iter()
                    .find(|(_, record)| {
                        record.mode == mode
                            && record.group == group
                            && record.schema == schema
                            && record.data_adapter == data_adapter
                            && record.trigger == trigger
                    })
                    .map(|(id, _)| id.clone())
            };
            if let Some(subscription_id) = matched {
                // Converge onto the existing server entity.
                shared.state.lock().subscription_id = Some(subscription_id.clone());
                let (status, timestamp, targets) = {
                    let mut records = self.records.write();
                    let record = records.get_mut(&subscription_id).expect("record just found");
                    record.handles.push(Arc::downgrade(&shared));
                    (
                        record.status,
                        record.status_timestamp,
                        collect_handles(record),
                    )
                };
                actions.push(MpnAction::NotifySubs {
                    targets: targets.clone(),
                    event: MpnSubscriptionEvent::StatusChange { status, timestamp },
                });
                if matches!(
                    status,
                    MpnSubscriptionStatus::Subscribed | MpnSubscriptionStatus::Triggered
                ) {
                    actions.push(MpnAction::NotifySubs {
                        targets: vec![Arc::clone(&shared)],
                        event: MpnSubscriptionEvent::Subscribed,
                    });
                }
            }
        }

        self.next_ref += 1;
        let reference = self.next_ref;
        self.pending.insert(
            reference,
            PendingMpnSub {
                shared,
                coalescing,
                sent: false,
            },
        );
        if session_present && self.registered {
            if let Some(request) = self.build_subscribe_request(reference) {
                if let Some(pending) = self.pending.get_mut(&reference) {
                    pending.sent = true;
                }
                actions.push(MpnAction::Send(request));
            }
        }
        Ok(actions)
    }

    fn build_subscribe_request(&self, reference: u32) -> Option<ClientRequest> {
        let pending = self.pending.get(&reference)?;
        let device_id = self.device_id()?;
        let (mode, group, schema, data_adapter) = Self::definition(&pending.shared).ok()?;
        let state = pending.shared.state.lock();
        Some(ClientRequest::MpnSubscribe {
            requested: reference,
            device_id,
            coalescing: pending.coalescing,
            mode,
            group,
            schema,
            data_adapter,
            format: state.requested_format.clone(),
            trigger: state.requested_trigger.clone(),
        })
    }

    pub(crate) fn on_subscription_ack(
        &mut self,
        reference: u32,
        subscription_id: String,
    ) -> Vec<MpnAction> {
        let Some(pending) = self.pending.remove(&reference) else {
            debug!(reference, "MPN ack for unknown reference");
            return Vec::new();
        };
        let shared = pending.shared;
        let (mode, group, schema, data_adapter) = match Self::definition(&shared) {
            Ok(definition) => definition,
            Err(_) => return Vec::new(),
        };
        let (format, trigger) = {
            let state = shared.state.lock();
            (state.requested_format.clone(), state.requested_trigger.clone())
        };
        let timestamp = now_ms();
        shared.state.lock().subscription_id = Some(subscription_id.clone());

        let targets = {
            let mut records = self.records.write();
            let record = records.entry(subscription_id.clone()).or_insert_with(|| MpnRecord {
                mode,
                group,
                schema,
                data_adapter,
                format: None,
                trigger: None,
                status: MpnSubscriptionStatus::Subscribed,
                status_timestamp: timestamp,
                handles: Vec::new(),
            });
            // The server accepted this definition; its requested values
            // become the confirmed ones, for every bound handle.
            record.format = format;
            record.trigger = trigger;
            record.status = MpnSubscriptionStatus::Subscribed;
            record.status_timestamp = timestamp;
            if !record
                .handles
                .iter()
                .any(|weak| weak.as_ptr() == Arc::as_ptr(&shared))
            {
                record.handles.push(Arc::downgrade(&shared));
            }
            collect_handles(record)
        };
        vec![
            MpnAction::NotifySubs {
                targets: targets.clone(),
                event: MpnSubscriptionEvent::StatusChange {
                    status: MpnSubscriptionStatus::Subscribed,
                    timestamp,
                },
            },
            MpnAction::NotifySubs {
                targets,
                event: MpnSubscriptionEvent::Subscribed,
            },
        ]
    }

    pub(crate) fn on_subscription_error(
        &mut self,
        reference: u32,
        code: i32,
        message: String,
    ) -> Vec<MpnAction> {
        let Some(pending) = self.pending.remove(&reference) else {
            return Vec::new();
        };
        {
            let mut state = pending.shared.state.lock();
            state.active = false;
            state.status = MpnSubscriptionStatus::Unknown;
            state.status_timestamp = now_ms();
        }
        vec![MpnAction::NotifySubs {
            targets: vec![pending.shared],
            event: MpnSubscriptionEvent::SubscriptionError { code, message },
        }]
    }

    pub(crate) fn on_status_change(
        &mut self,
        subscription_id: String,
        status: MpnSubscriptionStatus,
        timestamp: u64,
    ) -> Vec<MpnAction> {
        let (previous, targets) = {
            let mut records = self.records.write();
            let Some(record) = records.get_mut(&subscription_id) else {
                debug!(%subscription_id, "status change for unknown MPN record");
                return Vec::new();
            };
            let previous = record.status;
            record.status = status;
            record.status_timestamp = timestamp;
            (previous, collect_handles(record))
        };
        let mut actions = vec![MpnAction::NotifySubs {
            targets: targets.clone(),
            event: MpnSubscriptionEvent::StatusChange { status, timestamp },
        }];
        if status == MpnSubscriptionStatus::Triggered && previous != MpnSubscriptionStatus::Triggered
        {
            actions.push(MpnAction::NotifySubs {
                targets: targets.clone(),
                event: MpnSubscriptionEvent::Triggered,
            });
        }
        if status == MpnSubscriptionStatus::Subscribed && previous == MpnSubscriptionStatus::Triggered
        {
            // A coalescing redefinition replaced the trigger and the new
            // expression is not satisfied yet.
            actions.push(MpnAction::NotifySubs {
                targets,
                event: MpnSubscriptionEvent::Subscribed,
            });
        }
        actions
    }

    pub(crate) fn on_unsubscription_ack(&mut self, subscription_id: String) -> Vec<MpnAction> {
        let targets = {
            let mut records = self.records.write();
            let Some(record) = records.remove(&subscription_id) else {
                return Vec::new();
            };
            collect_handles(&record)
        };
        let timestamp = now_ms();
        for shared in &targets {
            let mut state = shared.state.lock();
            state.active = false;
            state.status = MpnSubscriptionStatus::Unknown;
            state.status_timestamp = timestamp;
        }
        vec![
            MpnAction::NotifySubs {
                targets: targets.clone(),
                event: MpnSubscriptionEvent::StatusChange {
                    status: MpnSubscriptionStatus::Unknown,
                    timestamp,
                },
            },
            MpnAction::NotifySubs {
                targets,
                event: MpnSubscriptionEvent::Unsubscribed,
            },
        ]
    }

    /// The server pushed its full subscription list: merge it in as the
    /// authoritative state and drop records it no longer contains.
    pub(crate) fn on_subscription_list(&mut self, snapshots: Vec<MpnSnapshot>) -> Vec<MpnAction> {
        let mut actions = Vec::new();
        let mut dropped_targets = Vec::new();
        {
            let mut records = self.records.write();
            let listed: std::collections::HashSet<&str> = snapshots
                .iter()
                .map(|snapshot| snapshot.subscription_id.as_str())
                .collect();
            let stale: Vec<String> = records
                .keys()
                .filter(|id| !listed.contains(id.as_str()))
                .cloned()
                .collect();
            for id in stale {
                if let Some(record) = records.remove(&id) {
                    dropped_targets.extend(collect_handles(&record));
                }
            }
            for snapshot in snapshots {
                let record = records
                    .entry(snapshot.subscription_id.clone())
                    .or_insert_with(|| MpnRecord {
                        mode: snapshot.mode,
                        group: snapshot.group.clone(),
                        schema: snapshot.schema.clone(),
                        data_adapter: snapshot.data_adapter.clone(),
                        format: None,
                        trigger: None,
                        status: snapshot.status,
                        status_timestamp: now_ms(),
                        handles: Vec::new(),
                    });
                record.mode = snapshot.mode;
                record.group = snapshot.group;
                record.schema = snapshot.schema;
                record.data_adapter = snapshot.data_adapter;
                record.format = snapshot.format;
                record.trigger = snapshot.trigger;
                record.status = snapshot.status;
            }
        }
        if !dropped_targets.is_empty() {
            let timestamp = now_ms();
            for shared in &dropped_targets {
                let mut state = shared.state.lock();
                state.active = false;
                state.status = MpnSubscriptionStatus::Unknown;
                state.status_timestamp = timestamp;
            }
            actions.push(MpnAction::NotifySubs {
                targets: dropped_targets,
                event: MpnSubscriptionEvent::Unsubscribed,
            });
        }
        if let Some(device) = self.device.clone() {
            actions.push(MpnAction::NotifyDevice {
                target: device,
                event: MpnDeviceEvent::SubscriptionsUpdated,
            });
        }
        actions
    }

    pub(crate) fn on_property_changed(
        &mut self,
        subscription_id: String,
        property: String,
        value: Option<String>,
    ) -> Vec<MpnAction> {
        let targets = {
            let mut records = self.records.write();
            let Some(record) = records.get_mut(&subscription_id) else {
                return Vec::new();
            };
            match property.as_str() {
                "notification_format" => record.format = value,
                "trigger" => record.trigger = value,
                other => {
                    debug!(other, "unknown MPN property confirmation");
                    return Vec::new();
                }
            }
            collect_handles(record)
        };
        vec![MpnAction::NotifySubs {
            targets,
            event: MpnSubscriptionEvent::PropertyChange { property },
        }]
    }

    pub(crate) fn on_modification_error(
        &mut self,
        subscription_id: String,
        property: String,
        code: i32,
        message: String,
    ) -> Vec<MpnAction> {
        let targets = {
            let records = self.records.read();
            let Some(record) = records.get(&subscription_id) else {
                return Vec::new();
            };
            collect_handles(record)
        };
        vec![MpnAction::NotifySubs {
            targets,
            event: MpnSubscriptionEvent::ModificationError {
                code,
                message,
                property,
            },
        }]
    }

    pub(crate) fn unsubscribe(&mut self, shared: &Arc<MpnSubShared>) -> Result<Vec<MpnAction>> {
        let subscription_id = shared
            .state
            .lock()
            .subscription_id
            .clone()
            .ok_or_else(|| ClientError::state("MPN subscription is not subscribed"))?;
        let device_id = self
            .device_id()
            .ok_or_else(|| ClientError::state("no MPN device is registered"))?;
        Ok(vec![MpnAction::Send(ClientRequest::MpnUnsubscribe {
            device_id,
            subscription_id,
        })])
    }

    pub(crate) fn unsubscribe_filtered(&mut self, filter: MpnFilter) -> Vec<MpnAction> {
        let Some(device_id) = self.device_id() else {
            return Vec::new();
        };
        let matching: Vec<String> = {
            let records = self.records.read();
            records
                .iter()
                .filter(|(_, record)| filter.matches(record.status))
                .map(|(id, _)| id.clone())
                .collect()
        };
        matching
            .into_iter()
            .map(|subscription_id| {
                MpnAction::Send(ClientRequest::MpnUnsubscribe {
                    device_id: device_id.clone(),
                    subscription_id,
                })
            })
            .collect()
    }

    pub(crate) fn change_format(
        &mut self,
        shared: &Arc<MpnSubShared>,
        format: String,
    ) -> Vec<MpnAction> {
        let Some(subscription_id) = shared.state.lock().subscription_id.clone() else {
            return Vec::new();
        };
        let Some(device_id) = self.device_id() else {
            return Vec::new();
        };
        vec![MpnAction::Send(ClientRequest::MpnChangeFormat {
            device_id,
            subscription_id,
            format,
        })]
    }

    pub(crate) fn change_trigger(
        &mut self,
        shared: &Arc<MpnSubShared>,
        trigger: Option<String>,
    ) -> Vec<MpnAction> {
        let Some(subscription_id) = shared.state.lock().subscription_id.clone() else {
            return Vec::new();
        };
        let Some(device_id) = self.device_id() else {
            return Vec::new();
        };
        vec![MpnAction::Send(ClientRequest::MpnChangeTrigger {
            device_id,
            subscription_id,
            trigger,
        })]
    }
}

fn collect_handles(record: &MpnRecord) -> Vec<Arc<MpnSubShared>> {
    record
        .handles
        .iter()
        .filter_map(Weak::upgrade)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_sub() -> MpnSubscription {
        let subscription = MpnSubscription::new(SubscriptionMode::Merge).expect("mpn sub");
        subscription.set_items(&["item1"]).expect("items");
        subscription.set_fields(&["stock", "price"]).expect("fields");
        subscription
            .set_notification_format("{\"title\": \"${stock}\"}")
            .expect("format");
        subscription
    }

    fn registry() -> MpnRegistry {
        MpnRegistry::new(Arc::new(RwLock::new(HashMap::new())))
    }

    fn register_device(registry: &mut MpnRegistry) {
        let device = MpnDevice::new("token-1", "com.example.app", "Apple").expect("device");
        registry.register(Arc::clone(&device.inner), true);
        registry.on_register_ack("DEV-1".to_string());
    }

    fn sent(actions: &[MpnAction]) -> Vec<&ClientRequest> {
        actions
            .iter()
            .filter_map(|action| match action {
                MpnAction::Send(request) => Some(request),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn command_mode_is_rejected() {
        assert!(MpnSubscription::new(SubscriptionMode::Command).is_err());
        assert!(MpnSubscription::new(SubscriptionMode::Raw).is_err());
    }

    #[test]
    fn invalid_filter_is_an_argument_error() {
        assert!(MpnFilter::parse(Some("SOMETIMES")).is_err());
        assert_eq!(MpnFilter::parse(None).expect("filter"), MpnFilter::All);
        assert_eq!(
            MpnFilter::parse(Some("TRIGGERED")).expect("filter"),
            MpnFilter::Triggered
        );
    }

    #[test]
    fn coalescing_converges_on_the_same_subscription_id() {
        let mut registry = registry();
        register_device(&mut registry);

        let first = sample_sub();
        first.inner.state.lock().active = true;
        let actions = registry
            .subscribe(Arc::clone(&first.inner), false, true)
            .expect("subscribe");
        let reference = match sent(&actions)[0] {
            ClientRequest::MpnSubscribe { requested, .. } => *requested,
            other => panic!("unexpected request: {other:?}"),
        };
        registry.on_subscription_ack(reference, "SUB-1".to_string());
        assert_eq!(first.subscription_id(), Some("SUB-1".to_string()));
        assert!(first.is_subscribed());

        // An equivalent definition with coalescing lands on SUB-1
        // without waiting for the server.
        let second = sample_sub();
        second.inner.state.lock().active = true;
        registry
            .subscribe(Arc::clone(&second.inner), true, true)
            .expect("subscribe");
        assert_eq!(second.subscription_id(), Some("SUB-1".to_string()));
        assert!(second.is_subscribed());

        // Both handles resolve state through the same record.
        registry.on_status_change("SUB-1".to_string(), MpnSubscriptionStatus::Triggered, 42);
        assert!(first.is_triggered());
        assert!(second.is_triggered());
        assert_eq!(first.status_timestamp(), 42);
    }

    #[test]
    fn non_coalescing_keeps_identities_apart() {
        let mut registry = registry();
        register_device(&mut registry);

        let first = sample_sub();
        first.inner.state.lock().active = true;
        let actions = registry
            .subscribe(Arc::clone(&first.inner), false, true)
            .expect("subscribe");
        let reference = match sent(&actions)[0] {
            ClientRequest::MpnSubscribe { requested, .. } => *requested,
            other => panic!("unexpected request: {other:?}"),
        };
        registry.on_subscription_ack(reference, "SUB-1".to_string());

        let second = sample_sub();
        second.inner.state.lock().active = true;
        let actions = registry
            .subscribe(Arc::clone(&second.inner), false, true)
            .expect("subscribe");
        let reference = match sent(&actions)[0] {
            ClientRequest::MpnSubscribe { requested, coalescing, .. } => {
                assert!(!coalescing);
                *requested
            }
            other => panic!("unexpected request: {other:?}"),
        };
        registry.on_subscription_ack(reference, "SUB-2".to_string());
        assert_eq!(second.subscription_id(), Some("SUB-2".to_string()));
    }

    #[test]
    fn subscription_list_is_authoritative() {
        let mut registry = registry();
        register_device(&mut registry);

        let actions = registry.on_subscription_list(vec![MpnSnapshot {
            subscription_id: "SUB-9".to_string(),
            mode: SubscriptionMode::Merge,
            group: "item1".to_string(),
            schema: "stock price".to_string(),
            data_adapter: None,
            format: Some("{}".to_string()),
            trigger: None,
            status: MpnSubscriptionStatus::Triggered,
        }]);
        assert!(actions.iter().any(|action| matches!(
            action,
            MpnAction::NotifyDevice {
                event: MpnDeviceEvent::SubscriptionsUpdated,
                ..
            }
        )));
        assert_eq!(
            registry.records.read().get("SUB-9").map(|record| record.status),
            Some(MpnSubscriptionStatus::Triggered)
        );

        // An empty list still fires the update and clears the store.
        let actions = registry.on_subscription_list(Vec::new());
        assert!(actions.iter().any(|action| matches!(
            action,
            MpnAction::NotifyDevice {
                event: MpnDeviceEvent::SubscriptionsUpdated,
                ..
            }
        )));
        assert!(registry.records.read().is_empty());
    }

    #[test]
    fn modification_keeps_requested_and_actual_apart() {
        let mut registry = registry();
        register_device(&mut registry);

        let subscription = sample_sub();
        subscription.inner.state.lock().active = true;
        let actions = registry
            .subscribe(Arc::clone(&subscription.inner), false, true)
            .expect("subscribe");
        let reference = match sent(&actions)[0] {
            ClientRequest::MpnSubscribe { requested, .. } => *requested,
            other => panic!("unexpected request: {other:?}"),
        };
        registry.on_subscription_ack(reference, "SUB-1".to_string());
        assert_eq!(
            subscription.actual_notification_format(),
            Some("{\"title\": \"${stock}\"}".to_string())
        );

        // Optimistic local change; server rejects it.
        subscription.set_notification_format("{\"new\": 1}").expect("format");
        registry.on_modification_error(
            "SUB-1".to_string(),
            "notification_format".to_string(),
            -5,
            "bad template".to_string(),
        );
        assert_eq!(
            subscription.notification_format(),
            Some("{\"new\": 1}".to_string())
        );
        assert_eq!(
            subscription.actual_notification_format(),
            Some("{\"title\": \"${stock}\"}".to_string())
        );

        // Confirmation path updates the actual value.
        registry.on_property_changed(
            "SUB-1".to_string(),
            "notification_format".to_string(),
            Some("{\"new\": 1}".to_string()),
        );
        assert_eq!(
            subscription.actual_notification_format(),
            Some("{\"new\": 1}".to_string())
        );
    }

    #[test]
    fn filtered_unsubscribe_targets_matching_records() {
        let mut registry = registry();
        register_device(&mut registry);

        for (id, status) in [
            ("SUB-A", MpnSubscriptionStatus::Subscribed),
            ("SUB-B", MpnSubscriptionStatus::Triggered),
        ] {
            registry.records.write().insert(
                id.to_string(),
                MpnRecord {
                    mode: SubscriptionMode::Merge,
                    group: "g".to_string(),
                    schema: "s".to_string(),
                    data_adapter: None,
                    format: None,
                    trigger: None,
                    status,
                    status_timestamp: 0,
                    handles: Vec::new(),
                },
            );
        }

        let actions = registry.unsubscribe_filtered(MpnFilter::Triggered);
        let requests = sent(&actions);
        assert_eq!(requests.len(), 1);
        assert!(matches!(
            requests[0],
            ClientRequest::MpnUnsubscribe { subscription_id, .. } if subscription_id == "SUB-B"
        ));

        let actions = registry.unsubscribe_filtered(MpnFilter::All);
        assert_eq!(sent(&actions).len(), 2);
    }

    #[test]
    fn structural_mutation_is_barred_while_active() {
        let subscription = sample_sub();
        subscription.inner.state.lock().active = true;
        assert!(subscription.set_items(&["other"]).is_err());
        // Format and trigger stay legal while active.
        subscription.set_notification_format("{}").expect("format");
        subscription
            .set_trigger_expression(Some("Double.parseDouble(${price}) > 10"))
            .expect("trigger");
    }
}
