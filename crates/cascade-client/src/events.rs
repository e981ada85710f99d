//! Listener model: one trait per listener family, each consuming a tagged
//! event enum through a single dispatch method. All engine-originated
//! callbacks are delivered by the notification dispatcher task, in the
//! order the engine processed their triggering events; the attach/detach
//! notifications (`ListenStart`/`ListenEnd`) fire synchronously on the
//! caller thread at add/remove time.
use cascade_wire::{ClientStatus, MpnDeviceStatus, MpnSubscriptionStatus, Property};

use crate::item_update::ItemUpdate;

/// Client-level notifications.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    StatusChange { status: ClientStatus },
    PropertyChange { property: Property },
    ServerError { code: i32, message: String },
    ListenStart,
    ListenEnd,
}

pub trait ClientListener: Send + Sync {
    fn on_event(&self, event: &ClientEvent);
}

/// Per-subscription notifications.
#[derive(Debug, Clone)]
pub enum SubscriptionEvent {
    Subscribed,
    SubscriptionError {
        code: i32,
        message: String,
    },
    Unsubscribed,
    ItemUpdate(ItemUpdate),
    EndOfSnapshot {
        item_name: Option<String>,
        item_pos: u32,
    },
    ClearSnapshot {
        item_name: Option<String>,
        item_pos: u32,
    },
    // The server discarded updates for this item under buffer pressure.
    ItemLostUpdates {
        item_name: Option<String>,
        item_pos: u32,
        lost: u32,
    },
    // Authoritative frequency: a decimal figure, "unlimited", or None
    // when the subscription has no cap.
    RealMaxFrequency {
        frequency: Option<String>,
    },
    SecondLevelSubscriptionError {
        code: i32,
        message: String,
        key: String,
    },
    SecondLevelItemLostUpdates {
        lost: u32,
        key: String,
    },
    ListenStart,
    ListenEnd,
}

pub trait SubscriptionListener: Send + Sync {
    fn on_event(&self, event: &SubscriptionEvent);
}

/// Terminal outcome of one sequenced message; exactly one fires per
/// message that carries a listener.
#[derive(Debug, Clone)]
pub enum MessageOutcome {
    Processed { response: Option<String> },
    Denied { code: i32, message: String },
    // Processing failure; completion state unknown.
    Error,
    // Superseded by a later message's delay-timeout policy.
    Discarded,
    // Outcome unknowable, typically after session loss.
    Aborted { sent_on_network: bool },
}

pub trait MessageListener: Send + Sync {
    fn on_outcome(&self, outcome: &MessageOutcome);
}

/// MPN device notifications.
#[derive(Debug, Clone)]
pub enum MpnDeviceEvent {
    Registered,
    RegistrationFailed { code: i32, message: String },
    StatusChange { status: MpnDeviceStatus, timestamp: u64 },
    Suspended,
    Resumed,
    // The server-side MPN subscription list was (re)fetched; fires even
    // when the resulting collection is empty.
    SubscriptionsUpdated,
    ListenStart,
    ListenEnd,
}

pub trait MpnDeviceListener: Send + Sync {
    fn on_event(&self, event: &MpnDeviceEvent);
}

/// MPN subscription notifications.
#[derive(Debug, Clone)]
pub enum MpnSubscriptionEvent {
    Subscribed,
    SubscriptionError {
        code: i32,
        message: String,
    },
    Unsubscribed,
    Triggered,
    StatusChange {
        status: MpnSubscriptionStatus,
        timestamp: u64,
    },
    PropertyChange {
        property: String,
    },
    ModificationError {
        code: i32,
        message: String,
        property: String,
    },
    ListenStart,
    ListenEnd,
}

pub trait MpnSubscriptionListener: Send + Sync {
    fn on_event(&self, event: &MpnSubscriptionEvent);
}
