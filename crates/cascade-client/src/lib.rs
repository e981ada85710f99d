// Client engine for the cascade publish/subscribe data-push protocol.
//
// CLIENT-SIDE DESIGN INTENT
// -------------------------
// One background engine task per client owns all protocol state: the
// session machine, the subscription registry, the message sequencer, and
// the MPN registry. Public API calls validate synchronously, then
// enqueue a command and return; they never touch the network. One
// dispatcher task delivers every listener callback, in the order the
// engine processed the triggering events.
//
// If we want more parallelism, we scale by running more clients, not by
// letting multiple tasks mutate one client's protocol state.

pub(crate) mod macros;

mod client;
mod config;
mod dispatch;
mod engine;
mod error;
mod events;
mod item_update;
mod mpn;
mod registry;
mod sequencer;
mod session;
mod subscription;


pub use cascade_wire::{
    ClientStatus, MpnDeviceStatus, MpnSubscriptionStatus, Property, SubscriptionMode,
    TransportKind,
};

pub use client::CascadeClient;
pub use config::{ConnectionDetails, ConnectionOptions, MaxBandwidth};
pub use error::{ClientError, Result};
pub use events::{
    ClientEvent, ClientListener, MessageListener, MessageOutcome, MpnDeviceEvent,
    MpnDeviceListener, MpnSubscriptionEvent, MpnSubscriptionListener, SubscriptionEvent,
    SubscriptionListener,
};
pub use item_update::ItemUpdate;
pub use mpn::{MpnDevice, MpnFilter, MpnSubscription};
pub use subscription::{
    BufferSize, FieldAddressing, FieldRef, ItemAddressing, ItemRef, MaxFrequency, Snapshot,
    Subscription,
};
